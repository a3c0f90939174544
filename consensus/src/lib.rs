pub mod encoding;
pub mod error;
pub mod header;
pub mod merkle;
pub mod pow;
pub mod types;

pub use encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use error::ConsensusError;
pub use header::{
    BlockHash, BlockHeader, HEADER_SIZE, ZERO_HASH, display_hash, parse_display_hash, sha256d,
};
pub use merkle::merkle_root;
pub use pow::{bits_to_target, header_work, meets_difficulty, validate_chain};
pub use types::{Block, OutPoint, Transaction, TxIn, TxOut, Txid};
