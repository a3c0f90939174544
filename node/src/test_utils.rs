//! Chain fixtures shared by unit and integration tests.

use consensus::pow::REGTEST_POW_BITS;
use consensus::{
    Block, BlockHash, BlockHeader, OutPoint, Transaction, TxIn, TxOut, ZERO_HASH,
    meets_difficulty,
};
use network::Network;

/// Parent of the first block a fresh regtest node accepts.
pub fn genesis_for_tests() -> BlockHash {
    Network::Regtest.genesis_hash()
}

fn coinbase(tag: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                txid: ZERO_HASH,
                vout: u32::MAX,
            },
            script_sig: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Increments the nonce until the header meets its regtest target.
pub fn mine(mut header: BlockHeader) -> BlockHeader {
    while !meets_difficulty(&header) {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// A mined single-transaction block on top of `prev`.
pub fn block_on(prev: BlockHash, tag: u32) -> Block {
    let tx = coinbase(tag);
    let header = mine(BlockHeader {
        version: 0x2000_0000,
        prev_block_hash: prev,
        merkle_root: tx.txid(),
        timestamp: 1_700_000_000 + tag,
        bits: REGTEST_POW_BITS,
        nonce: 0,
        tx_count: 1,
    });
    Block {
        header,
        transactions: vec![tx],
    }
}

/// `count` linked blocks starting on top of `prev`.
pub fn chain_on(prev: BlockHash, count: usize) -> Vec<Block> {
    let mut parent = prev;
    (0..count)
        .map(|i| {
            let block = block_on(parent, i as u32 + 1);
            parent = block.hash();
            block
        })
        .collect()
}

/// Headers of [`chain_on`] as they travel in a `headers` message.
pub fn headers_of(blocks: &[Block]) -> Vec<BlockHeader> {
    blocks
        .iter()
        .map(|block| BlockHeader {
            tx_count: 0,
            ..block.header
        })
        .collect()
}
