use crate::header::BlockHash;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("block {block} does not extend tip {expected}")]
    Linkage { block: String, expected: String },
    #[error("block {0} does not meet its difficulty target")]
    InsufficientWork(String),
    #[error("merkle root mismatch for block {0}")]
    MerkleMismatch(String),
    #[error("block {0} carries no transactions")]
    EmptyBlock(String),
}

impl ConsensusError {
    pub fn linkage(block: &BlockHash, expected: &BlockHash) -> Self {
        Self::Linkage {
            block: crate::header::display_hash(block),
            expected: crate::header::display_hash(expected),
        }
    }
}
