use std::sync::Arc;

use consensus::{BlockHash, display_hash};
use network::{GetHeadersMessage, Message};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{NodeError, NodeResult};
use crate::storage::BlockRepository;

/// Issues `getheaders` requests and tells the header handler which parent
/// hash the answer must start from.
#[derive(Clone)]
pub struct HeadersRequester {
    repository: Arc<dyn BlockRepository>,
    genesis_hash: BlockHash,
    outgoing: mpsc::Sender<Message>,
    expected: mpsc::Sender<BlockHash>,
}

impl HeadersRequester {
    pub fn new(
        repository: Arc<dyn BlockRepository>,
        genesis_hash: BlockHash,
        outgoing: mpsc::Sender<Message>,
        expected: mpsc::Sender<BlockHash>,
    ) -> Self {
        Self {
            repository,
            genesis_hash,
            outgoing,
            expected,
        }
    }

    /// Hash of the last persisted block, or genesis on an empty store.
    pub fn local_tip(&self) -> NodeResult<BlockHash> {
        match self.repository.get_last() {
            Ok(block) => Ok(block.hash()),
            Err(err) if err.is_not_found() => Ok(self.genesis_hash),
            Err(err) => Err(err),
        }
    }

    pub async fn request_from_last_block(&self) -> NodeResult<BlockHash> {
        let tip = self.local_tip()?;
        self.request_from(tip).await?;
        Ok(tip)
    }

    /// The expectation goes out before the request so the handler can never
    /// see the answer first.
    pub async fn request_from(&self, hash: BlockHash) -> NodeResult<()> {
        debug!(from = %display_hash(&hash), "requesting headers");
        self.expected
            .send(hash)
            .await
            .map_err(|_| NodeError::ChannelClosed("expected hash"))?;
        self.outgoing
            .send(Message::GetHeaders(GetHeadersMessage::from_hash(hash)))
            .await
            .map_err(|_| NodeError::ChannelClosed("outgoing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::test_utils::{block_on, genesis_for_tests};

    fn requester(
        storage: Arc<Storage>,
    ) -> (HeadersRequester, mpsc::Receiver<Message>, mpsc::Receiver<BlockHash>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(4);
        let (expected_tx, expected_rx) = mpsc::channel(4);
        (
            HeadersRequester::new(storage, genesis_for_tests(), outgoing_tx, expected_tx),
            outgoing_rx,
            expected_rx,
        )
    }

    #[tokio::test]
    async fn requests_from_genesis_on_empty_store() {
        let storage = Arc::new(Storage::temporary().unwrap());
        let (requester, mut outgoing, mut expected) = requester(storage);

        let from = requester.request_from_last_block().await.expect("request");
        assert_eq!(from, genesis_for_tests());
        assert_eq!(expected.recv().await, Some(genesis_for_tests()));
        match outgoing.recv().await {
            Some(Message::GetHeaders(request)) => {
                assert_eq!(request.locator, vec![genesis_for_tests()]);
            }
            other => panic!("expected getheaders, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_from_stored_tip() {
        let storage = Arc::new(Storage::temporary().unwrap());
        let first = block_on(genesis_for_tests(), 1);
        storage.save(&first).unwrap();
        let (requester, _outgoing, mut expected) = requester(storage);

        requester.request_from_last_block().await.expect("request");
        assert_eq!(expected.recv().await, Some(first.hash()));
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let storage = Arc::new(Storage::temporary().unwrap());
        let (requester, outgoing, _expected) = requester(storage);
        drop(outgoing);
        let err = requester.request_from([1; 32]).await.expect_err("closed");
        assert!(matches!(err, NodeError::ChannelClosed("outgoing")));
    }
}
