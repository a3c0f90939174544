use std::sync::Arc;

use consensus::{Block, BlockHash, ConsensusError, display_hash, meets_difficulty, merkle_root};

use crate::error::NodeResult;
use crate::storage::BlockRepository;

pub trait BlockValidator: Send + Sync {
    fn validate(&self, block: &Block) -> NodeResult<()>;
}

/// Checks a block against the locally stored tip: linkage, proof of work
/// and the merkle commitment to its transactions.
pub struct ChainValidator {
    repository: Arc<dyn BlockRepository>,
    genesis_hash: BlockHash,
}

impl ChainValidator {
    pub fn new(repository: Arc<dyn BlockRepository>, genesis_hash: BlockHash) -> Self {
        Self {
            repository,
            genesis_hash,
        }
    }

    fn expected_parent(&self) -> NodeResult<BlockHash> {
        match self.repository.get_last() {
            Ok(tip) => Ok(tip.hash()),
            Err(err) if err.is_not_found() => Ok(self.genesis_hash),
            Err(err) => Err(err),
        }
    }
}

impl BlockValidator for ChainValidator {
    fn validate(&self, block: &Block) -> NodeResult<()> {
        let hash = block.hash();
        if block.transactions.is_empty() {
            return Err(ConsensusError::EmptyBlock(display_hash(&hash)).into());
        }

        let expected = self.expected_parent()?;
        if block.header.prev_block_hash != expected {
            return Err(ConsensusError::linkage(&hash, &expected).into());
        }

        if !meets_difficulty(&block.header) {
            return Err(ConsensusError::InsufficientWork(display_hash(&hash)).into());
        }

        if merkle_root(&block.txids()) != Some(block.header.merkle_root) {
            return Err(ConsensusError::MerkleMismatch(display_hash(&hash)).into());
        }
        Ok(())
    }
}
