use std::net::SocketAddr;
use std::sync::Arc;

use consensus::{Block, display_hash};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HeaderBatch, send_or_stop};
use crate::storage::BlockRepository;
use crate::validator::BlockValidator;

struct Expected {
    batch: HeaderBatch,
    cursor: usize,
}

/// Stores the blocks of the current header batch strictly in header order.
///
/// Validation and storage failures drop the single block and leave the
/// cursor where it is. The session's re-request timer restarts progress.
pub struct BlockSyncHandler {
    peer: SocketAddr,
    blocks_rx: mpsc::Receiver<Block>,
    expected_rx: mpsc::Receiver<HeaderBatch>,
    processed: mpsc::Sender<HeaderBatch>,
    repository: Arc<dyn BlockRepository>,
    validator: Arc<dyn BlockValidator>,
    current: Option<Expected>,
}

impl BlockSyncHandler {
    pub fn new(
        peer: SocketAddr,
        blocks_rx: mpsc::Receiver<Block>,
        expected_rx: mpsc::Receiver<HeaderBatch>,
        processed: mpsc::Sender<HeaderBatch>,
        repository: Arc<dyn BlockRepository>,
        validator: Arc<dyn BlockValidator>,
    ) -> Self {
        Self {
            peer,
            blocks_rx,
            expected_rx,
            processed,
            repository,
            validator,
            current: None,
        }
    }

    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                batch = self.expected_rx.recv() => match batch {
                    Some(batch) if batch.is_empty() => {}
                    Some(batch) => self.current = Some(Expected { batch, cursor: 0 }),
                    None => break,
                },
                block = self.blocks_rx.recv() => match block {
                    Some(block) => {
                        if let Some(done) = self.on_block(block) {
                            if !send_or_stop(&self.processed, done, &stop).await {
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(peer = %self.peer, "block handler stopped");
    }

    /// Returns the batch once its last block has been stored.
    fn on_block(&mut self, block: Block) -> Option<HeaderBatch> {
        let hash = block.hash();
        let current = self.current.as_mut()?;
        let wanted = current.batch.headers.get(current.cursor)?.hash();
        if hash != wanted {
            debug!(
                peer = %self.peer,
                block = %display_hash(&hash),
                wanted = %display_hash(&wanted),
                "dropping out-of-order block"
            );
            return None;
        }

        if let Err(err) = self.validator.validate(&block) {
            warn!(peer = %self.peer, block = %display_hash(&hash), %err, "rejected block");
            return None;
        }
        if let Err(err) = self.repository.save(&block) {
            error!(peer = %self.peer, block = %display_hash(&hash), %err, "failed to store block");
            return None;
        }

        current.cursor += 1;
        if current.cursor < current.batch.len() {
            return None;
        }
        let done = self.current.take()?;
        info!(
            peer = %self.peer,
            count = done.batch.len(),
            tip = %display_hash(&hash),
            "stored block batch"
        );
        Some(done.batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::error::{NodeError, NodeResult};
    use crate::storage::Storage;
    use crate::test_utils::{chain_on, genesis_for_tests, headers_of};
    use crate::validator::ChainValidator;
    use consensus::BlockHash;

    #[derive(Default)]
    struct RecordingRepository {
        saved: Mutex<Vec<BlockHash>>,
    }

    impl BlockRepository for RecordingRepository {
        fn save(&self, block: &Block) -> NodeResult<()> {
            self.saved.lock().push(block.hash());
            Ok(())
        }

        fn get(&self, hash: &BlockHash) -> NodeResult<Block> {
            Err(NodeError::NotFound(display_hash(hash)))
        }

        fn get_last(&self) -> NodeResult<Block> {
            Err(NodeError::NotFound("chain tip".into()))
        }
    }

    struct AcceptAll;

    impl BlockValidator for AcceptAll {
        fn validate(&self, _block: &Block) -> NodeResult<()> {
            Ok(())
        }
    }

    struct Harness {
        blocks: mpsc::Sender<Block>,
        expected: mpsc::Sender<HeaderBatch>,
        processed: mpsc::Receiver<HeaderBatch>,
        stop: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn harness(
        repository: Arc<dyn BlockRepository>,
        validator: Arc<dyn BlockValidator>,
    ) -> Harness {
        let (blocks_tx, blocks_rx) = mpsc::channel(8);
        let (expected_tx, expected_rx) = mpsc::channel(8);
        let (processed_tx, processed_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let handle = BlockSyncHandler::new(
            "127.0.0.1:18444".parse().unwrap(),
            blocks_rx,
            expected_rx,
            processed_tx,
            repository,
            validator,
        )
        .spawn(stop.clone());
        Harness {
            blocks: blocks_tx,
            expected: expected_tx,
            processed: processed_rx,
            stop,
            handle,
        }
    }

    fn batch_of(blocks: &[Block]) -> HeaderBatch {
        HeaderBatch {
            headers: headers_of(blocks),
            work: Default::default(),
            is_valid: true,
        }
    }

    #[tokio::test]
    async fn stores_blocks_in_header_order() {
        let repository = Arc::new(RecordingRepository::default());
        let mut h = harness(repository.clone(), Arc::new(AcceptAll));
        let blocks = chain_on(genesis_for_tests(), 2);

        h.expected.send(batch_of(&blocks)).await.unwrap();
        // Second block first: dropped, the cursor stays on the first.
        h.blocks.send(blocks[1].clone()).await.unwrap();
        h.blocks.send(blocks[0].clone()).await.unwrap();
        h.blocks.send(blocks[1].clone()).await.unwrap();

        let done = h.processed.recv().await.expect("batch complete");
        assert_eq!(done.len(), 2);
        assert_eq!(
            *repository.saved.lock(),
            vec![blocks[0].hash(), blocks[1].hash()]
        );
        assert!(h.processed.try_recv().is_err());

        h.stop.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_order_block_is_never_saved() {
        let repository = Arc::new(RecordingRepository::default());
        let h = harness(repository.clone(), Arc::new(AcceptAll));
        let blocks = chain_on(genesis_for_tests(), 2);

        h.expected.send(batch_of(&blocks)).await.unwrap();
        h.blocks.send(blocks[1].clone()).await.unwrap();

        h.stop.cancel();
        h.handle.await.unwrap();
        assert!(repository.saved.lock().is_empty());
    }

    #[tokio::test]
    async fn blocks_without_a_batch_are_dropped() {
        let repository = Arc::new(RecordingRepository::default());
        let h = harness(repository.clone(), Arc::new(AcceptAll));
        let blocks = chain_on(genesis_for_tests(), 1);
        h.blocks.send(blocks[0].clone()).await.unwrap();

        h.stop.cancel();
        h.handle.await.unwrap();
        assert!(repository.saved.lock().is_empty());
    }

    #[tokio::test]
    async fn invalid_block_holds_the_cursor() {
        let storage = Arc::new(Storage::temporary().unwrap());
        let validator = Arc::new(ChainValidator::new(storage.clone(), genesis_for_tests()));
        let mut h = harness(storage.clone(), validator);
        let blocks = chain_on(genesis_for_tests(), 2);

        // Same header, so the hash matches, but the merkle root does not.
        let mut tampered = blocks[0].clone();
        tampered.transactions[0].lock_time = 5;

        h.expected.send(batch_of(&blocks)).await.unwrap();
        h.blocks.send(tampered).await.unwrap();
        for block in &blocks {
            h.blocks.send(block.clone()).await.unwrap();
        }

        let done = h.processed.recv().await.expect("batch completes");
        assert_eq!(done.headers, headers_of(&blocks));
        assert_eq!(storage.get_last().unwrap(), blocks[1]);
    }

    #[tokio::test]
    async fn new_expectation_replaces_the_current_one() {
        let repository = Arc::new(RecordingRepository::default());
        let mut h = harness(repository.clone(), Arc::new(AcceptAll));
        let first = chain_on(genesis_for_tests(), 2);
        let second = chain_on([0x42; 32], 1);

        h.expected.send(batch_of(&first)).await.unwrap();
        h.blocks.send(first[0].clone()).await.unwrap();
        h.expected.send(batch_of(&second)).await.unwrap();
        h.blocks.send(second[0].clone()).await.unwrap();

        // Only the replacement completes; the first batch never does.
        let done = h.processed.recv().await.unwrap();
        assert_eq!(done.headers, headers_of(&second));
        assert_eq!(repository.saved.lock().last(), Some(&second[0].hash()));
        assert!(h.processed.try_recv().is_err());
    }
}
