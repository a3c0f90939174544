use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use consensus::{Block, display_hash};
use network::{Connection, Message, NODE_NETWORK, Network, NetworkError, Peer, Timeouts};
use node::lifecycle::Lifecycle;
use node::test_utils::{block_on, chain_on, genesis_for_tests, headers_of};
use node::{
    BlockRepository, ChainValidator, PeerConnectionManager, PeerMode, ServerPeer, Storage,
    SyncContext,
};
use num_bigint::BigUint;
use parking_lot::Mutex;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

fn remote_addr() -> SocketAddr {
    "127.0.0.1:18444".parse().expect("socket addr")
}

fn timeouts() -> Timeouts {
    Timeouts {
        read: Duration::from_millis(200),
        write: Duration::from_millis(200),
    }
}

fn context(storage: Arc<Storage>) -> SyncContext {
    SyncContext {
        repository: storage.clone(),
        validator: Arc::new(ChainValidator::new(storage, genesis_for_tests())),
        genesis_hash: genesis_for_tests(),
        sync_wait: Duration::from_millis(500),
        channel_capacity: 64,
    }
}

fn peer_over(stream: DuplexStream) -> Peer<DuplexStream> {
    Peer {
        addr: remote_addr(),
        version: 70016,
        services: NODE_NETWORK,
        user_agent: "/remote:1.0/".into(),
        start_height: 5,
        connection: Connection::new(stream, remote_addr(), Network::Regtest, timeouts()),
    }
}

/// Remote peer serving `blocks` on top of regtest genesis, `batch` headers
/// per answer. Sends `greeting` first and logs everything it receives.
fn chain_server(
    stream: DuplexStream,
    blocks: Vec<Block>,
    batch: usize,
    greeting: Vec<Message>,
    log: Arc<Mutex<Vec<Message>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut remote = Connection::new(stream, remote_addr(), Network::Regtest, timeouts());
        for message in greeting {
            remote.send(message).await.expect("send greeting");
        }
        loop {
            let message = match remote.recv().await {
                Ok(message) => message,
                Err(err) if err.is_timeout() => continue,
                Err(_) => break,
            };
            log.lock().push(message.clone());
            let answers = match message {
                Message::GetHeaders(request) => {
                    let from = request.locator[0];
                    let start = if from == genesis_for_tests() {
                        0
                    } else {
                        blocks
                            .iter()
                            .position(|block| block.hash() == from)
                            .map_or(blocks.len(), |index| index + 1)
                    };
                    let end = (start + batch).min(blocks.len());
                    vec![Message::Headers(headers_of(&blocks[start..end]))]
                }
                Message::GetData(inventory) => inventory
                    .iter()
                    .filter_map(|item| blocks.iter().find(|block| block.hash() == item.hash))
                    .map(|block| Message::Block(block.clone()))
                    .collect(),
                _ => Vec::new(),
            };
            for answer in answers {
                if remote.send(answer).await.is_err() {
                    return;
                }
            }
        }
    })
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn tip(storage: &Storage) -> Option<String> {
    storage.get_last().ok().map(|block| display_hash(&block.hash()))
}

#[tokio::test]
async fn overview_then_sync_stores_the_whole_chain() {
    let blocks = chain_on(genesis_for_tests(), 5);
    let storage = Arc::new(Storage::temporary().expect("storage"));
    let log = Arc::new(Mutex::new(Vec::new()));
    let (local, remote) = duplex(1 << 20);
    let server = chain_server(remote, blocks.clone(), 2, Vec::new(), log.clone());
    let (errors_tx, _errors_rx) = mpsc::channel(4);
    let peer = ServerPeer::new(peer_over(local), &context(storage.clone()), errors_tx);

    peer.start().await.expect("start");
    let overview = peer
        .chain_overview()
        .await
        .expect("overview session")
        .await
        .expect("overview result");
    assert!(overview.is_valid);
    assert_eq!(overview.peer, remote_addr());
    assert_eq!(overview.blocks, 5);
    assert_eq!(overview.work, BigUint::from(10u32));
    assert_eq!(peer.mode(), PeerMode::Overview);
    assert!(storage.get_last().expect_err("nothing stored").is_not_found());
    assert!(
        !log.lock().iter().any(|message| matches!(message, Message::GetData(_))),
        "overview never fetches blocks"
    );

    peer.sync().await.expect("sync");
    assert_eq!(peer.mode(), PeerMode::Standard);
    let want = display_hash(&blocks[4].hash());
    eventually("chain tip stored", || tip(&storage).as_deref() == Some(want.as_str())).await;
    for block in &blocks {
        assert!(storage.has_block(&block.hash()).unwrap());
    }

    peer.stop().await.expect("stop");
    peer.stop().await.expect("second stop is a no-op");
    assert_eq!(peer.lifecycle(), Lifecycle::Stopped);
    server.await.expect("remote exits once the connection closes");
}

#[tokio::test]
async fn overview_answers_pings_and_ignores_blocks() {
    let blocks = chain_on(genesis_for_tests(), 2);
    let stray = block_on(genesis_for_tests(), 99);
    let storage = Arc::new(Storage::temporary().expect("storage"));
    let log = Arc::new(Mutex::new(Vec::new()));
    let (local, remote) = duplex(1 << 20);
    let server = chain_server(
        remote,
        blocks,
        10,
        vec![Message::Ping(7), Message::Block(stray)],
        log.clone(),
    );
    let (errors_tx, _errors_rx) = mpsc::channel(4);
    let peer = ServerPeer::new(peer_over(local), &context(storage.clone()), errors_tx);

    peer.start().await.expect("start");
    let overview = peer.chain_overview().await.unwrap().await.unwrap();
    assert_eq!(overview.blocks, 2);

    eventually("pong", || log.lock().contains(&Message::Pong(7))).await;
    assert!(storage.get_last().is_err(), "blocks are dropped in overview mode");

    peer.stop().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn invalid_remote_chain_is_flagged() {
    let mut blocks = chain_on(genesis_for_tests(), 3);
    blocks[2].header.prev_block_hash = [0xab; 32];
    let storage = Arc::new(Storage::temporary().expect("storage"));
    let (local, remote) = duplex(1 << 20);
    let server = chain_server(remote, blocks, 10, Vec::new(), Arc::default());
    let (errors_tx, _errors_rx) = mpsc::channel(4);
    let peer = ServerPeer::new(peer_over(local), &context(storage), errors_tx);

    peer.start().await.unwrap();
    let overview = peer.chain_overview().await.unwrap().await.unwrap();
    assert!(!overview.is_valid);
    assert_eq!(overview.blocks, 0);

    peer.stop().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn hang_up_is_reported_once() {
    let storage = Arc::new(Storage::temporary().expect("storage"));
    let (local, remote) = duplex(1 << 10);
    drop(remote);
    let (errors_tx, mut errors_rx) = mpsc::channel(4);
    let peer = ServerPeer::new(peer_over(local), &context(storage), errors_tx);

    peer.start().await.unwrap();
    let failure = errors_rx.recv().await.expect("peer error");
    assert_eq!(failure.addr, remote_addr());
    assert!(matches!(failure.error, NetworkError::ConnectionClosed));
    assert!(failure.error.is_retryable());

    peer.stop().await.unwrap();
    assert!(errors_rx.try_recv().is_err());
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let storage = Arc::new(Storage::temporary().expect("storage"));
    let (local, _remote) = duplex(1 << 10);
    let (errors_tx, _errors_rx) = mpsc::channel(4);
    let peer = ServerPeer::new(peer_over(local), &context(storage), errors_tx);

    peer.stop().await.unwrap();
    peer.stop().await.unwrap();
    peer.start().await.unwrap();
    assert_eq!(peer.lifecycle(), Lifecycle::Stopped);
    assert!(peer.sync().await.is_err(), "a stopped peer cannot sync");
}

#[tokio::test]
async fn zero_channel_capacity_still_runs_the_overview() {
    let blocks = chain_on(genesis_for_tests(), 3);
    let storage = Arc::new(Storage::temporary().expect("storage"));
    let (local, remote) = duplex(1 << 20);
    let server = chain_server(remote, blocks, 1, Vec::new(), Arc::default());
    let (errors_tx, _errors_rx) = mpsc::channel(4);
    let unchecked = SyncContext {
        channel_capacity: 0,
        ..context(storage)
    };
    let peer = ServerPeer::new(peer_over(local), &unchecked, errors_tx);

    peer.start().await.expect("start");
    let overview = peer.chain_overview().await.unwrap().await.unwrap();
    assert!(overview.is_valid);
    assert_eq!(overview.blocks, 3);

    peer.stop().await.unwrap();
    server.await.unwrap();
}
