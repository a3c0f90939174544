use sha2::{Digest, Sha256};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

pub type BlockHash = [u8; 32];

/// Size of the hashed portion of a header.
pub const HEADER_SIZE: usize = 80;

pub const ZERO_HASH: BlockHash = [0u8; 32];

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Hashes are stored in internal byte order and displayed reversed.
pub fn display_hash(hash: &BlockHash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parses a hash written in display order.
pub fn parse_display_hash(value: &str) -> Result<BlockHash, DecodeError> {
    let bytes = hex::decode(value).map_err(|_| DecodeError::InvalidValue("hash is not hex"))?;
    let mut hash: BlockHash = bytes
        .try_into()
        .map_err(|_| DecodeError::InvalidValue("hash must be 32 bytes"))?;
    hash.reverse();
    Ok(hash)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: BlockHash,
    pub merkle_root: BlockHash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Trailing transaction count. Always zero inside a `headers` message.
    pub tx_count: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> BlockHash {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.encode_fixed(&mut encoder);
        sha256d(&encoder.into_inner())
    }

    pub fn encode_fixed(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_bytes(&self.prev_block_hash);
        encoder.write_bytes(&self.merkle_root);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn decode_fixed(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block_hash: decoder.read_fixed()?,
            merkle_root: decoder.read_fixed()?,
            timestamp: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
            tx_count: 0,
        })
    }
}

/// Header as carried by a `headers` message: 80 bytes plus the varint count.
impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.encode_fixed(encoder);
        encoder.write_varint(self.tx_count);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut header = Self::decode_fixed(decoder)?;
        header.tx_count = decoder.read_varint()?;
        Ok(header)
    }
}
