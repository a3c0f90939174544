use std::net::SocketAddr;

use consensus::{BlockHash, BlockHeader, display_hash, header_work, meets_difficulty, validate_chain};
use network::{Inventory, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HeaderBatch, send_or_stop};

/// Turns `headers` answers into block requests.
///
/// An answer is only accepted when its first header builds on the hash most
/// recently announced on the expected-hash channel. Everything else is a
/// stale or unsolicited response and is dropped without a report.
pub struct HeaderSyncHandler {
    peer: SocketAddr,
    headers_rx: mpsc::Receiver<Vec<BlockHeader>>,
    expected_rx: mpsc::Receiver<BlockHash>,
    outgoing: mpsc::Sender<Message>,
    blocks_expected: mpsc::Sender<HeaderBatch>,
    reports: mpsc::Sender<HeaderBatch>,
    expected: Option<BlockHash>,
}

impl HeaderSyncHandler {
    pub fn new(
        peer: SocketAddr,
        headers_rx: mpsc::Receiver<Vec<BlockHeader>>,
        expected_rx: mpsc::Receiver<BlockHash>,
        outgoing: mpsc::Sender<Message>,
        blocks_expected: mpsc::Sender<HeaderBatch>,
        reports: mpsc::Sender<HeaderBatch>,
    ) -> Self {
        Self {
            peer,
            headers_rx,
            expected_rx,
            outgoing,
            blocks_expected,
            reports,
            expected: None,
        }
    }

    /// Runs until `stop` fires or an input channel closes. Awaiting the
    /// handle confirms the loop has exited.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                hash = self.expected_rx.recv() => match hash {
                    Some(hash) => self.expected = Some(hash),
                    None => break,
                },
                headers = self.headers_rx.recv() => match headers {
                    Some(headers) => {
                        if !self.on_headers(headers, &stop).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(peer = %self.peer, "header handler stopped");
    }

    /// False once an output can no longer be delivered.
    async fn on_headers(&mut self, headers: Vec<BlockHeader>, stop: &CancellationToken) -> bool {
        let Some(first) = headers.first() else {
            debug!(peer = %self.peer, "peer has no headers past the requested hash");
            return send_or_stop(&self.reports, HeaderBatch::tip_reached(), stop).await;
        };

        if Some(first.prev_block_hash) != self.expected {
            debug!(
                peer = %self.peer,
                prev = %display_hash(&first.prev_block_hash),
                "dropping unsolicited headers"
            );
            return true;
        }

        let (mut work, linked) = validate_chain(&headers);
        if !linked || !meets_difficulty(first) {
            warn!(peer = %self.peer, count = headers.len(), "peer sent an invalid header chain");
            return send_or_stop(&self.reports, HeaderBatch::rejected(headers), stop).await;
        }
        work += header_work(first.bits);

        let inventory: Vec<Inventory> = headers
            .iter()
            .map(|header| Inventory::block(header.hash()))
            .collect();
        let batch = HeaderBatch {
            headers,
            work,
            is_valid: true,
        };
        info!(peer = %self.peer, count = batch.len(), "received valid headers");

        // The block handler must know the batch before any block can answer
        // the getdata.
        send_or_stop(&self.blocks_expected, batch.clone(), stop).await
            && send_or_stop(&self.outgoing, Message::GetData(inventory), stop).await
            && send_or_stop(&self.reports, batch, stop).await
    }
}
