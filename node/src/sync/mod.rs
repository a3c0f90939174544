//! Headers-first synchronization against a single peer.
//!
//! Data flows through bounded channels:
//!
//! ```text
//! HeadersRequester --expected hash--> HeaderSyncHandler --getdata--> outbound
//!                                      |            |
//!                                 batch report   expected batch
//!                                      v            v
//!                                  PeerSync <--- BlockSyncHandler (batch stored)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use consensus::{BlockHash, BlockHeader};
use num_bigint::BigUint;
use num_traits::Zero;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::storage::BlockRepository;
use crate::validator::BlockValidator;

pub mod blocks;
pub mod headers;
pub mod requester;
pub mod session;

pub use blocks::BlockSyncHandler;
pub use headers::HeaderSyncHandler;
pub use requester::HeadersRequester;
pub use session::{PeerSync, SessionInputs};

/// Headers from one `headers` message after validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderBatch {
    pub headers: Vec<BlockHeader>,
    pub work: BigUint,
    pub is_valid: bool,
}

impl HeaderBatch {
    /// Empty response: the peer has nothing past the requested hash.
    pub fn tip_reached() -> Self {
        Self {
            headers: Vec::new(),
            work: BigUint::zero(),
            is_valid: true,
        }
    }

    pub fn rejected(headers: Vec<BlockHeader>) -> Self {
        Self {
            headers,
            work: BigUint::zero(),
            is_valid: false,
        }
    }

    pub fn last_hash(&self) -> Option<BlockHash> {
        self.headers.last().map(BlockHeader::hash)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// How much chain a peer has past our tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainOverview {
    pub peer: SocketAddr,
    pub blocks: u64,
    pub work: BigUint,
    pub is_valid: bool,
}

impl ChainOverview {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            blocks: 0,
            work: BigUint::zero(),
            is_valid: true,
        }
    }
}

/// Shared collaborators for every peer's sync pipeline.
#[derive(Clone)]
pub struct SyncContext {
    pub repository: Arc<dyn BlockRepository>,
    pub validator: Arc<dyn BlockValidator>,
    pub genesis_hash: BlockHash,
    pub sync_wait: Duration,
    pub channel_capacity: usize,
}

/// Sends `value` unless `stop` fires first. False if it was not delivered.
pub(crate) async fn send_or_stop<T>(
    tx: &mpsc::Sender<T>,
    value: T,
    stop: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        result = tx.send(value) => result.is_ok(),
    }
}
