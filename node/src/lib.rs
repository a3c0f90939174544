pub mod config;
pub mod error;
pub mod lifecycle;
pub mod peer;
pub mod service;
pub mod storage;
pub mod sync;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod validator;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use peer::{PeerConnectionManager, PeerError, PeerMode, ServerPeer};
pub use service::{Backoff, Node, PeerConnector, TcpConnector};
pub use storage::{BlockRepository, Storage};
pub use sync::{ChainOverview, HeaderBatch, SyncContext};
pub use validator::{BlockValidator, ChainValidator};
