//! Fleet supervision: connect to every configured peer, race their chains
//! and sync from the one with the most work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use network::{HandshakeConfig, negotiate_outbound};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::lifecycle::LifecycleCell;
use crate::peer::{PeerConnectionManager, PeerError, ServerPeer};
use crate::sync::{ChainOverview, SyncContext};

/// Opens a negotiated, not yet started, connection manager for a peer.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    type Manager: PeerConnectionManager + 'static;

    async fn connect(
        &self,
        addr: SocketAddr,
        errors: mpsc::Sender<PeerError>,
    ) -> NodeResult<Arc<Self::Manager>>;
}

pub struct TcpConnector {
    handshake: HandshakeConfig,
    context: SyncContext,
}

impl TcpConnector {
    pub fn new(handshake: HandshakeConfig, context: SyncContext) -> Self {
        Self { handshake, context }
    }
}

#[async_trait]
impl PeerConnector for TcpConnector {
    type Manager = ServerPeer;

    async fn connect(
        &self,
        addr: SocketAddr,
        errors: mpsc::Sender<PeerError>,
    ) -> NodeResult<Arc<ServerPeer>> {
        let peer = negotiate_outbound(addr, &self.handshake).await?;
        Ok(Arc::new(ServerPeer::new(peer, &self.context, errors)))
    }
}

/// Reconnect delays: `base`, doubled after every failed attempt, capped at
/// `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            next: base.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

struct PeerChain<M> {
    manager: Arc<M>,
    overview: Option<ChainOverview>,
    /// Registration order, used to break work ties.
    seen: u64,
}

struct PeerTable<M> {
    peers: HashMap<SocketAddr, PeerChain<M>>,
    syncing: Option<SocketAddr>,
    next_seen: u64,
}

impl<M> PeerTable<M> {
    fn new() -> Self {
        Self {
            peers: HashMap::new(),
            syncing: None,
            next_seen: 0,
        }
    }

    fn remove(&mut self, addr: &SocketAddr) -> Option<PeerChain<M>> {
        if self.syncing.as_ref() == Some(addr) {
            self.syncing = None;
        }
        self.peers.remove(addr)
    }

    /// The peer to sync from, once nobody syncs and every peer has reported.
    /// Greatest valid work wins; ties go to the peer seen first.
    fn best_candidate(&self) -> Option<SocketAddr> {
        if self.syncing.is_some() {
            return None;
        }
        let mut reported = Vec::with_capacity(self.peers.len());
        for (addr, chain) in &self.peers {
            reported.push((chain.seen, *addr, chain.overview.as_ref()?));
        }
        reported.sort_by_key(|(seen, _, _)| *seen);

        let mut best: Option<(SocketAddr, &ChainOverview)> = None;
        for (_, addr, overview) in reported {
            if !overview.is_valid {
                continue;
            }
            match best {
                Some((_, leader)) if overview.work <= leader.work => {}
                _ => best = Some((addr, overview)),
            }
        }
        best.map(|(addr, _)| addr)
    }
}

struct NodeInner<C: PeerConnector> {
    connector: C,
    addrs: Vec<SocketAddr>,
    table: Mutex<PeerTable<C::Manager>>,
    errors_tx: mpsc::Sender<PeerError>,
    reconnect_base: Duration,
    reconnect_max: Duration,
    stop: CancellationToken,
    tasks: TaskTracker,
}

pub struct Node<C: PeerConnector = TcpConnector> {
    inner: Arc<NodeInner<C>>,
    lifecycle: LifecycleCell,
    errors_rx: Mutex<Option<mpsc::Receiver<PeerError>>>,
}

impl<C: PeerConnector> Node<C> {
    pub fn new(connector: C, config: &NodeConfig) -> NodeResult<Self> {
        let addrs = config.peer_addrs()?;
        let (errors_tx, errors_rx) = mpsc::channel(config.channel_capacity.max(addrs.len()).max(1));
        Ok(Self {
            inner: Arc::new(NodeInner {
                connector,
                addrs,
                table: Mutex::new(PeerTable::new()),
                errors_tx,
                reconnect_base: config.reconnect_base(),
                reconnect_max: config.reconnect_max(),
                stop: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            lifecycle: LifecycleCell::new(),
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }

    /// Connects to every configured peer in the background. A second call
    /// is a no-op.
    pub fn start(&self) -> NodeResult<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let errors = self
            .errors_rx
            .lock()
            .take()
            .ok_or(NodeError::Invalid("peer error channel already taken"))?;

        info!(peers = self.inner.addrs.len(), "starting node");
        let inner = self.inner.clone();
        self.inner.tasks.spawn(inner.listen_errors(errors));
        for addr in self.inner.addrs.iter().copied() {
            self.inner.spawn_connect(addr, true);
        }
        Ok(())
    }

    /// Stops background work, waits for it to finish, then stops every
    /// connected peer.
    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        info!("stopping node");
        self.inner.stop.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let managers: Vec<_> = {
            let mut table = self.inner.table.lock();
            table.syncing = None;
            table.peers.drain().map(|(_, chain)| chain.manager).collect()
        };
        for manager in managers {
            if let Err(err) = manager.stop().await {
                warn!(peer = %manager.peer_addr(), %err, "peer did not stop cleanly");
            }
        }
        info!("node stopped");
    }

    pub fn syncing_peer(&self) -> Option<SocketAddr> {
        self.inner.table.lock().syncing
    }

    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.inner.table.lock().peers.keys().copied().collect()
    }

    pub fn chain_overview(&self, addr: &SocketAddr) -> Option<ChainOverview> {
        self.inner
            .table
            .lock()
            .peers
            .get(addr)
            .and_then(|chain| chain.overview.clone())
    }
}

impl<C: PeerConnector> NodeInner<C> {
    fn spawn_connect(self: &Arc<Self>, addr: SocketAddr, immediate: bool) {
        let inner = self.clone();
        self.tasks.spawn(inner.connect_with_backoff(addr, immediate));
    }

    async fn connect_with_backoff(self: Arc<Self>, addr: SocketAddr, immediate: bool) {
        let mut backoff = Backoff::new(self.reconnect_base, self.reconnect_max);
        let mut wait = !immediate;
        loop {
            if wait {
                let delay = backoff.next_delay();
                debug!(peer = %addr, ?delay, "waiting before reconnect");
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
            wait = true;

            let connected = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                result = self.connector.connect(addr, self.errors_tx.clone()) => result,
            };
            match connected {
                Ok(manager) => {
                    self.register(manager).await;
                    return;
                }
                Err(err) => warn!(peer = %addr, %err, "connection attempt failed"),
            }
        }
    }

    /// Tracks a fresh manager, starts it and enters it into the chain race.
    async fn register(self: &Arc<Self>, manager: Arc<C::Manager>) {
        let addr = manager.peer_addr();
        let replaced = {
            let mut table = self.table.lock();
            let seen = table.next_seen;
            table.next_seen += 1;
            let replaced = table.remove(&addr);
            table.peers.insert(
                addr,
                PeerChain {
                    manager: manager.clone(),
                    overview: None,
                    seen,
                },
            );
            replaced
        };
        if let Some(old) = replaced {
            let _ = old.manager.stop().await;
        }

        if let Err(err) = manager.start().await {
            warn!(peer = %addr, %err, "failed to start peer");
            return;
        }
        let overview = match manager.chain_overview().await {
            Ok(overview) => overview,
            Err(err) => {
                warn!(peer = %addr, %err, "failed to start chain overview");
                return;
            }
        };
        let overview = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return,
            result = overview => match result {
                Ok(overview) => overview,
                Err(_) => {
                    debug!(peer = %addr, "chain overview abandoned");
                    return;
                }
            },
        };

        {
            let mut table = self.table.lock();
            match table.peers.get_mut(&addr) {
                Some(chain) if Arc::ptr_eq(&chain.manager, &manager) => {
                    chain.overview = Some(overview);
                }
                _ => return,
            }
        }
        self.select_best().await;
    }

    async fn select_best(&self) {
        let chosen = {
            let mut table = self.table.lock();
            let Some(addr) = table.best_candidate() else {
                return;
            };
            table.syncing = Some(addr);
            table
                .peers
                .get(&addr)
                .map(|chain| (chain.manager.clone(), chain.overview.clone()))
        };
        let Some((manager, overview)) = chosen else {
            return;
        };
        if let Some(overview) = overview {
            info!(
                peer = %overview.peer,
                blocks = overview.blocks,
                work = %overview.work,
                "selected peer for sync"
            );
        }
        if let Err(err) = manager.sync().await {
            warn!(peer = %manager.peer_addr(), %err, "failed to start sync");
        }
    }

    async fn listen_errors(self: Arc<Self>, mut errors: mpsc::Receiver<PeerError>) {
        loop {
            let failure = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                failure = errors.recv() => match failure {
                    Some(failure) => failure,
                    None => break,
                },
            };
            self.handle_failure(failure).await;
        }
        debug!("peer error listener stopped");
    }

    async fn handle_failure(self: &Arc<Self>, failure: PeerError) {
        let PeerError { addr, error } = failure;
        let removed = self.table.lock().remove(&addr);
        let Some(chain) = removed else {
            debug!(peer = %addr, %error, "error from untracked peer");
            return;
        };
        warn!(
            peer = %addr,
            %error,
            retryable = error.is_retryable(),
            "dropping peer, scheduling reconnect"
        );
        if let Err(err) = chain.manager.stop().await {
            warn!(peer = %addr, %err, "peer did not stop cleanly");
        }
        self.spawn_connect(addr, false);
        self.select_best().await;
    }
}
