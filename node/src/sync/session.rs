use std::net::SocketAddr;
use std::time::Duration;

use consensus::{BlockHash, display_hash};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ChainOverview, HeaderBatch, HeadersRequester};
use crate::error::{NodeError, NodeResult};

/// Handler outputs a session consumes. They outlive any single session and
/// are handed from one session task to the next.
pub struct SessionInputs {
    pub reports: mpsc::Receiver<HeaderBatch>,
    pub processed: mpsc::Receiver<HeaderBatch>,
}

impl SessionInputs {
    /// Discards whatever the previous session left unread.
    fn drain(&mut self) {
        while self.reports.try_recv().is_ok() {}
        while self.processed.try_recv().is_ok() {}
    }
}

struct RunningSession {
    stop: CancellationToken,
    handle: JoinHandle<SessionInputs>,
}

struct SessionSlot {
    inputs: Option<SessionInputs>,
    running: Option<RunningSession>,
}

/// Per-peer control loop. At most one session task runs at a time; starting
/// a new one stops the previous one first.
pub struct PeerSync {
    peer: SocketAddr,
    requester: HeadersRequester,
    sync_wait: Duration,
    slot: Mutex<SessionSlot>,
}

impl PeerSync {
    pub fn new(
        peer: SocketAddr,
        requester: HeadersRequester,
        sync_wait: Duration,
        inputs: SessionInputs,
    ) -> Self {
        Self {
            peer,
            requester,
            sync_wait,
            slot: Mutex::new(SessionSlot {
                inputs: Some(inputs),
                running: None,
            }),
        }
    }

    /// Measures the peer's chain from `resume` (or the local tip) to the
    /// peer's tip without fetching blocks. The receiver yields exactly one
    /// overview unless the session is stopped first.
    pub async fn start_overview(
        &self,
        resume: Option<BlockHash>,
    ) -> NodeResult<oneshot::Receiver<ChainOverview>> {
        let (tx, rx) = oneshot::channel();
        self.launch(move |task| tokio::spawn(task.overview(resume, tx)))
            .await?;
        Ok(rx)
    }

    /// Fetches and stores blocks until stopped.
    pub async fn start_standard(&self) -> NodeResult<()> {
        self.launch(|task| tokio::spawn(task.standard())).await
    }

    /// Stops the running session and waits for it to exit. A no-op when
    /// nothing runs.
    pub async fn stop(&self) -> NodeResult<()> {
        let mut slot = self.slot.lock().await;
        halt(&mut slot).await
    }

    async fn launch<F>(&self, spawn: F) -> NodeResult<()>
    where
        F: FnOnce(SessionTask) -> JoinHandle<SessionInputs>,
    {
        let mut slot = self.slot.lock().await;
        halt(&mut slot).await?;
        let mut inputs = slot
            .inputs
            .take()
            .ok_or(NodeError::Invalid("sync session inputs lost"))?;
        inputs.drain();

        let stop = CancellationToken::new();
        let task = SessionTask {
            peer: self.peer,
            requester: self.requester.clone(),
            sync_wait: self.sync_wait,
            inputs,
            stop: stop.clone(),
        };
        slot.running = Some(RunningSession {
            stop,
            handle: spawn(task),
        });
        Ok(())
    }
}

async fn halt(slot: &mut SessionSlot) -> NodeResult<()> {
    let Some(running) = slot.running.take() else {
        return Ok(());
    };
    running.stop.cancel();
    match running.handle.await {
        Ok(inputs) => {
            slot.inputs = Some(inputs);
            Ok(())
        }
        Err(err) => {
            error!(%err, "sync session task failed");
            Err(NodeError::Invalid("sync session task failed"))
        }
    }
}

struct SessionTask {
    peer: SocketAddr,
    requester: HeadersRequester,
    sync_wait: Duration,
    inputs: SessionInputs,
    stop: CancellationToken,
}

impl SessionTask {
    /// False when the session should end: stop fired or the request could
    /// not be delivered.
    async fn request(&self, hash: BlockHash) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            result = self.requester.request_from(hash) => match result {
                Ok(()) => true,
                Err(err) => {
                    warn!(peer = %self.peer, %err, "header request failed");
                    false
                }
            },
        }
    }

    async fn request_from_last_block(&self) -> bool {
        match self.requester.local_tip() {
            Ok(tip) => self.request(tip).await,
            Err(err) => {
                error!(peer = %self.peer, %err, "failed to read local tip");
                false
            }
        }
    }

    async fn overview(
        mut self,
        resume: Option<BlockHash>,
        result: oneshot::Sender<ChainOverview>,
    ) -> SessionInputs {
        let mut overview = ChainOverview::new(self.peer);
        let start = match resume {
            Some(hash) => Ok(hash),
            None => self.requester.local_tip(),
        };
        let mut from = match start {
            Ok(hash) => hash,
            Err(err) => {
                error!(peer = %self.peer, %err, "failed to read local tip");
                overview.is_valid = false;
                let _ = result.send(overview);
                return self.inputs;
            }
        };
        if !self.request(from).await {
            return self.inputs;
        }

        let mut previous_last: Option<BlockHash> = None;
        let timer = sleep(self.sync_wait);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return self.inputs,
                report = self.inputs.reports.recv() => {
                    let Some(batch) = report else {
                        overview.is_valid = false;
                        break;
                    };
                    if !batch.is_valid {
                        warn!(peer = %self.peer, "peer chain rejected");
                        overview.is_valid = false;
                        break;
                    }
                    let Some(last) = batch.last_hash() else {
                        break;
                    };
                    if previous_last == Some(last) {
                        debug!(peer = %self.peer, "ignoring duplicate header batch");
                        continue;
                    }
                    overview.blocks += batch.len() as u64;
                    overview.work += &batch.work;
                    previous_last = Some(last);
                    from = last;
                    if !self.request(from).await {
                        return self.inputs;
                    }
                    timer.as_mut().reset(Instant::now() + self.sync_wait);
                }
                _ = &mut timer => {
                    debug!(peer = %self.peer, from = %display_hash(&from), "no headers in time, re-requesting");
                    if !self.request(from).await {
                        return self.inputs;
                    }
                    timer.as_mut().reset(Instant::now() + self.sync_wait);
                }
            }
        }

        info!(
            peer = %self.peer,
            blocks = overview.blocks,
            work = %overview.work,
            valid = overview.is_valid,
            "chain overview complete"
        );
        let _ = result.send(overview);
        self.inputs
    }

    async fn standard(mut self) -> SessionInputs {
        info!(peer = %self.peer, "starting block sync");
        if !self.request_from_last_block().await {
            return self.inputs;
        }

        let timer = sleep(self.sync_wait);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                processed = self.inputs.processed.recv() => {
                    let Some(batch) = processed else { break };
                    if let Some(last) = batch.last_hash() {
                        if !self.request(last).await {
                            break;
                        }
                    }
                    timer.as_mut().reset(Instant::now() + self.sync_wait);
                }
                report = self.inputs.reports.recv() => match report {
                    None => break,
                    Some(batch) if !batch.is_valid => {
                        warn!(peer = %self.peer, "peer sent invalid headers during sync");
                    }
                    Some(batch) if batch.is_empty() => {
                        debug!(peer = %self.peer, "peer tip reached, waiting");
                    }
                    Some(batch) => debug!(peer = %self.peer, count = batch.len(), "awaiting blocks"),
                },
                _ = &mut timer => {
                    debug!(peer = %self.peer, "no progress in time, re-requesting from local tip");
                    if !self.request_from_last_block().await {
                        break;
                    }
                    timer.as_mut().reset(Instant::now() + self.sync_wait);
                }
            }
        }
        debug!(peer = %self.peer, "block sync stopped");
        self.inputs
    }
}
