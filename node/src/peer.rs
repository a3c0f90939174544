//! One peer's connection: dispatch loops, sync pipeline and mode switching.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use consensus::{Block, BlockHash, BlockHeader};
use network::{Connection, Message, MessageReader, MessageWriter, NetworkError, Peer};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::lifecycle::{Lifecycle, LifecycleCell};
use crate::sync::{
    BlockSyncHandler, ChainOverview, HeaderBatch, HeaderSyncHandler, HeadersRequester, PeerSync,
    SessionInputs, SyncContext, send_or_stop,
};

/// A connection-level failure, reported once per peer.
#[derive(Debug)]
pub struct PeerError {
    pub addr: SocketAddr,
    pub error: NetworkError,
}

/// What the outbound loop lets through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerMode {
    /// Header requests and pongs only; blocks are never fetched.
    Overview,
    Standard,
}

impl PeerMode {
    pub fn permits(self, message: &Message) -> bool {
        match self {
            Self::Standard => true,
            Self::Overview => matches!(message, Message::GetHeaders(_) | Message::Pong(_)),
        }
    }
}

/// Sync control surface the node drives for every connected peer.
#[async_trait]
pub trait PeerConnectionManager: Send + Sync {
    fn peer_addr(&self) -> SocketAddr;

    async fn start(&self) -> NodeResult<()>;

    /// Idempotent. Returns once every task of this peer has exited and the
    /// connection is closed.
    async fn stop(&self) -> NodeResult<()>;

    /// Switches to standard mode and starts fetching blocks.
    async fn sync(&self) -> NodeResult<()>;

    async fn stop_sync(&self) -> NodeResult<()>;

    /// Switches to overview mode and measures the peer's chain.
    async fn chain_overview(&self) -> NodeResult<oneshot::Receiver<ChainOverview>>;
}

struct Pending<T> {
    connection: Connection<T>,
    outgoing_rx: mpsc::Receiver<Message>,
    headers_tx: mpsc::Sender<Vec<BlockHeader>>,
    blocks_tx: mpsc::Sender<Block>,
    header_handler: HeaderSyncHandler,
    block_handler: BlockSyncHandler,
}

struct Running<T> {
    dispatch_stop: CancellationToken,
    handlers_stop: CancellationToken,
    inbound: JoinHandle<MessageReader<T>>,
    outbound: JoinHandle<MessageWriter<T>>,
    handlers: Vec<JoinHandle<()>>,
}

/// Error reporting shared by both dispatch loops.
#[derive(Clone)]
struct Reporter {
    addr: SocketAddr,
    errors: mpsc::Sender<PeerError>,
    reported: Arc<AtomicBool>,
}

impl Reporter {
    async fn report(&self, error: NetworkError, stop: &CancellationToken) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(peer = %self.addr, %error, "peer connection failed");
        let failure = PeerError {
            addr: self.addr,
            error,
        };
        if !send_or_stop(&self.errors, failure, stop).await {
            debug!(peer = %self.addr, "peer error not delivered");
        }
    }
}

pub struct ServerPeer<T = TcpStream> {
    addr: SocketAddr,
    lifecycle: LifecycleCell,
    mode: watch::Sender<PeerMode>,
    sync: PeerSync,
    outgoing: mpsc::Sender<Message>,
    reporter: Reporter,
    pending: Mutex<Option<Pending<T>>>,
    running: Mutex<Option<Running<T>>>,
}

impl<T> ServerPeer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wires the sync pipeline for a negotiated peer. Nothing runs until
    /// [`PeerConnectionManager::start`].
    pub fn new(peer: Peer<T>, context: &SyncContext, errors: mpsc::Sender<PeerError>) -> Self {
        let addr = peer.addr;
        let capacity = context.channel_capacity.max(1);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (headers_tx, headers_rx) = mpsc::channel(capacity);
        let (blocks_tx, blocks_rx) = mpsc::channel(capacity);
        let (expected_hash_tx, expected_hash_rx) = mpsc::channel::<BlockHash>(capacity);
        let (blocks_expected_tx, blocks_expected_rx) = mpsc::channel::<HeaderBatch>(capacity);
        let (reports_tx, reports_rx) = mpsc::channel(capacity);
        let (processed_tx, processed_rx) = mpsc::channel(capacity);

        let header_handler = HeaderSyncHandler::new(
            addr,
            headers_rx,
            expected_hash_rx,
            outgoing_tx.clone(),
            blocks_expected_tx,
            reports_tx,
        );
        let block_handler = BlockSyncHandler::new(
            addr,
            blocks_rx,
            blocks_expected_rx,
            processed_tx,
            context.repository.clone(),
            context.validator.clone(),
        );
        let requester = HeadersRequester::new(
            context.repository.clone(),
            context.genesis_hash,
            outgoing_tx.clone(),
            expected_hash_tx,
        );
        let sync = PeerSync::new(
            addr,
            requester,
            context.sync_wait,
            SessionInputs {
                reports: reports_rx,
                processed: processed_rx,
            },
        );
        let (mode, _) = watch::channel(PeerMode::Overview);

        Self {
            addr,
            lifecycle: LifecycleCell::new(),
            mode,
            sync,
            outgoing: outgoing_tx,
            reporter: Reporter {
                addr,
                errors,
                reported: Arc::new(AtomicBool::new(false)),
            },
            pending: Mutex::new(Some(Pending {
                connection: peer.connection,
                outgoing_rx,
                headers_tx,
                blocks_tx,
                header_handler,
                block_handler,
            })),
            running: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> PeerMode {
        *self.mode.borrow()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.state()
    }

    fn set_mode(&self, mode: PeerMode) {
        self.mode.send_if_modified(|current| {
            if *current == mode {
                return false;
            }
            info!(peer = %self.addr, from = ?current, to = ?mode, "switching peer mode");
            *current = mode;
            true
        });
    }

    fn ensure_running(&self) -> NodeResult<()> {
        match self.lifecycle.state() {
            Lifecycle::Running => Ok(()),
            _ => Err(NodeError::Invalid("peer is not running")),
        }
    }
}

#[async_trait]
impl<T> PeerConnectionManager for ServerPeer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn start(&self) -> NodeResult<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or(NodeError::Invalid("peer connection already consumed"))?;

        let (writer, reader) = pending.connection.split();
        let dispatch_stop = CancellationToken::new();
        let handlers_stop = CancellationToken::new();
        let handlers = vec![
            pending.header_handler.spawn(handlers_stop.clone()),
            pending.block_handler.spawn(handlers_stop.clone()),
        ];
        let routes = Routes {
            outgoing: self.outgoing.clone(),
            headers: pending.headers_tx,
            blocks: pending.blocks_tx,
            mode: self.mode.subscribe(),
        };
        let inbound = tokio::spawn(inbound(
            reader,
            routes,
            self.reporter.clone(),
            dispatch_stop.clone(),
        ));
        let outbound = tokio::spawn(outbound(
            writer,
            pending.outgoing_rx,
            self.mode.subscribe(),
            self.reporter.clone(),
            dispatch_stop.clone(),
        ));

        *self.running.lock() = Some(Running {
            dispatch_stop,
            handlers_stop,
            inbound,
            outbound,
            handlers,
        });
        info!(peer = %self.addr, "peer started");
        Ok(())
    }

    async fn stop(&self) -> NodeResult<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        if let Err(err) = self.sync.stop().await {
            warn!(peer = %self.addr, %err, "sync session did not stop cleanly");
        }
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        // Dispatch loops first so nothing writes to the connection while it
        // closes.
        running.dispatch_stop.cancel();
        let reader = running.inbound.await;
        let writer = running.outbound.await;

        running.handlers_stop.cancel();
        for handle in running.handlers {
            if let Err(err) = handle.await {
                warn!(peer = %self.addr, %err, "sync handler failed");
            }
        }

        match writer {
            Ok(writer) => {
                if let Err(err) = writer.close().await {
                    debug!(peer = %self.addr, %err, "closing connection");
                }
            }
            Err(err) => warn!(peer = %self.addr, %err, "outbound loop failed"),
        }
        drop(reader);
        info!(peer = %self.addr, "peer stopped");
        Ok(())
    }

    async fn sync(&self) -> NodeResult<()> {
        self.ensure_running()?;
        self.set_mode(PeerMode::Standard);
        self.sync.start_standard().await
    }

    async fn stop_sync(&self) -> NodeResult<()> {
        self.sync.stop().await?;
        self.set_mode(PeerMode::Overview);
        Ok(())
    }

    async fn chain_overview(&self) -> NodeResult<oneshot::Receiver<ChainOverview>> {
        self.ensure_running()?;
        self.set_mode(PeerMode::Overview);
        self.sync.start_overview(None).await
    }
}

struct Routes {
    outgoing: mpsc::Sender<Message>,
    headers: mpsc::Sender<Vec<BlockHeader>>,
    blocks: mpsc::Sender<Block>,
    mode: watch::Receiver<PeerMode>,
}

async fn inbound<T>(
    mut reader: MessageReader<T>,
    routes: Routes,
    reporter: Reporter,
    stop: CancellationToken,
) -> MessageReader<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let peer = reader.peer_addr();
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = reader.read() => match result {
                Ok(message) => message,
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    reporter.report(err, &stop).await;
                    break;
                }
            },
        };

        let delivered = match message {
            Message::Ping(nonce) => send_or_stop(&routes.outgoing, Message::Pong(nonce), &stop).await,
            Message::Headers(headers) => send_or_stop(&routes.headers, headers, &stop).await,
            Message::Block(block) => {
                let standard = *routes.mode.borrow() == PeerMode::Standard;
                if standard {
                    send_or_stop(&routes.blocks, block, &stop).await
                } else {
                    debug!(%peer, "dropping block received in overview mode");
                    true
                }
            }
            other => {
                debug!(%peer, command = %other.command(), "ignoring message");
                true
            }
        };
        if !delivered {
            break;
        }
    }
    debug!(%peer, "inbound loop stopped");
    reader
}

async fn outbound<T>(
    mut writer: MessageWriter<T>,
    mut outgoing: mpsc::Receiver<Message>,
    mode: watch::Receiver<PeerMode>,
    reporter: Reporter,
    stop: CancellationToken,
) -> MessageWriter<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let peer = writer.peer_addr();
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let current = *mode.borrow();
        if !current.permits(&message) {
            debug!(%peer, command = %message.command(), mode = ?current, "withholding message");
            continue;
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = writer.write(message) => {
                if let Err(err) = result {
                    reporter.report(err, &stop).await;
                    break;
                }
            }
        }
    }
    debug!(%peer, "outbound loop stopped");
    writer
}
