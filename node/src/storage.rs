use std::path::Path;

use consensus::{Block, BlockHash, Decodable, Encodable, display_hash};
use serde::{Deserialize, Serialize};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::error::{NodeError, NodeResult};

const META_KEY: &[u8] = b"meta";

/// Persistent block store consumed by the sync engine.
pub trait BlockRepository: Send + Sync {
    /// Durably records `block` and the link from its parent to it.
    fn save(&self, block: &Block) -> NodeResult<()>;

    fn get(&self, hash: &BlockHash) -> NodeResult<Block>;

    /// Tip of the locally stored chain. `NotFound` when nothing is stored.
    fn get_last(&self) -> NodeResult<Block>;

    fn has_block(&self, hash: &BlockHash) -> NodeResult<bool> {
        match self.get(hash) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMeta {
    pub last_saved: BlockHash,
    pub stored_blocks: u64,
}

#[derive(Debug)]
pub struct Storage {
    db: sled::Db,
    blocks: sled::Tree,
    links: sled::Tree,
    meta: sled::Tree,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> NodeResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> NodeResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> NodeResult<Self> {
        let blocks = db.open_tree("blocks")?;
        let links = db.open_tree("links")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            blocks,
            links,
            meta,
        })
    }

    pub fn load_meta(&self) -> NodeResult<Option<ChainMeta>> {
        Ok(self
            .meta
            .get(META_KEY)?
            .map(|value| bincode::deserialize(&value))
            .transpose()?)
    }

    pub fn flush(&self) -> NodeResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn next_after(&self, hash: &BlockHash) -> NodeResult<Option<BlockHash>> {
        Ok(self.links.get(hash)?.and_then(|value| value.as_ref().try_into().ok()))
    }
}

impl BlockRepository for Storage {
    fn save(&self, block: &Block) -> NodeResult<()> {
        let hash = block.hash();
        let encoded = block.encode_to_vec();
        let prev = block.header.prev_block_hash;

        (&self.blocks, &self.links, &self.meta)
            .transaction(|(blocks, links, meta)| {
                let known = blocks.get(hash)?.is_some();
                let mut chain = match meta.get(META_KEY)? {
                    Some(raw) => bincode::deserialize::<ChainMeta>(&raw)
                        .map_err(|_| ConflictableTransactionError::Abort(()))?,
                    None => ChainMeta::default(),
                };
                if !known {
                    chain.stored_blocks += 1;
                }
                chain.last_saved = hash;
                let chain = bincode::serialize(&chain)
                    .map_err(|_| ConflictableTransactionError::Abort(()))?;

                blocks.insert(&hash[..], encoded.as_slice())?;
                links.insert(&prev[..], &hash[..])?;
                meta.insert(META_KEY, chain)?;
                Ok(())
            })
            .map_err(|err: TransactionError<()>| match err {
                TransactionError::Storage(err) => NodeError::Storage(err),
                TransactionError::Abort(()) => NodeError::Invalid("corrupt chain metadata"),
            })?;
        self.flush()
    }

    fn get(&self, hash: &BlockHash) -> NodeResult<Block> {
        let raw = self
            .blocks
            .get(hash)?
            .ok_or_else(|| NodeError::NotFound(display_hash(hash)))?;
        Ok(Block::decode_all(&raw)?)
    }

    fn get_last(&self) -> NodeResult<Block> {
        let Some(meta) = self.load_meta()? else {
            return Err(NodeError::NotFound("chain tip".into()));
        };

        // Follow parent -> child links from the last saved block. Bounded by
        // the number of stored blocks in case the links form a cycle.
        let mut tip = meta.last_saved;
        for _ in 0..meta.stored_blocks {
            match self.next_after(&tip)? {
                Some(next) if self.blocks.contains_key(next)? => tip = next,
                _ => break,
            }
        }
        self.get(&tip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{block_on, chain_on, genesis_for_tests};
    use tempfile::tempdir;

    #[test]
    fn empty_store_has_no_tip() {
        let storage = Storage::temporary().expect("storage");
        assert!(storage.get_last().expect_err("empty").is_not_found());
        assert!(!storage.has_block(&[1; 32]).unwrap());
    }

    #[test]
    fn save_and_get_round_trip() {
        let storage = Storage::temporary().expect("storage");
        let first = block_on(genesis_for_tests(), 1);
        storage.save(&first).expect("save");
        assert_eq!(storage.get(&first.hash()).unwrap(), first);
        assert_eq!(storage.get_last().unwrap(), first);
        assert!(storage.has_block(&first.hash()).unwrap());
        assert!(storage.get(&[9; 32]).expect_err("missing").is_not_found());
    }

    #[test]
    fn tip_follows_links_past_last_saved() {
        let storage = Storage::temporary().expect("storage");
        let blocks = chain_on(genesis_for_tests(), 3);
        for block in &blocks {
            storage.save(block).unwrap();
        }
        // Re-saving an old block moves the last-saved pointer back; the
        // link walk still finds the tip.
        storage.save(&blocks[0]).unwrap();
        assert_eq!(storage.get_last().unwrap(), blocks[2]);
        assert_eq!(storage.load_meta().unwrap().unwrap().stored_blocks, 3);
    }

    #[test]
    fn cyclic_links_stop_after_stored_blocks() {
        let storage = Storage::temporary().expect("storage");
        let blocks = chain_on(genesis_for_tests(), 3);
        for block in &blocks {
            storage.save(block).unwrap();
        }
        // Point the tip back at the first block: 0 -> 1 -> 2 -> 0 -> ...
        storage
            .links
            .insert(&blocks[2].hash()[..], &blocks[0].hash()[..])
            .unwrap();

        // Three steps from the last saved block (2) land on 2 again.
        assert_eq!(storage.load_meta().unwrap().unwrap().stored_blocks, 3);
        assert_eq!(storage.get_last().unwrap(), blocks[2]);

        // Entries outside the chain do not lengthen the walk.
        for key in 0u32..64 {
            storage.blocks.insert(key.to_be_bytes(), &b"unrelated"[..]).unwrap();
        }
        assert_eq!(storage.get_last().unwrap(), blocks[2]);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blocks.db");
        let first = block_on(genesis_for_tests(), 7);
        {
            let storage = Storage::open(&path).expect("open");
            storage.save(&first).expect("save");
        }
        let reopened = Storage::open(&path).expect("reopen");
        assert_eq!(reopened.get_last().unwrap(), first);
    }
}
