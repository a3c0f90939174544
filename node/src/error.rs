use consensus::ConsensusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] consensus::DecodeError),
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("network error: {0}")]
    Network(#[from] network::NetworkError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("block {0} not found")]
    NotFound(String),
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
    #[error("invalid state: {0}")]
    Invalid(&'static str),
}

impl NodeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
