//! Content blocks
//!
//! Object content is a list of lines. It is cut into blocks of
//! `lines_per_block` lines, and each block into [`N_SUB_BLOCK`] sub-blocks by
//! line index modulo `N_SUB_BLOCK`. Every sub-block is hashed separately so a
//! peer can verify what it receives against the layout in the oplog.

use crate::storage::{key, Database, Order, StorageError};
use replica_core::canonical::canonical_json;
use replica_core::crypto::keccak256;
use replica_core::op::BlockMeta;
use replica_core::{BitVector, Eid, Hash32, ObjectKind};
use serde::{Deserialize, Serialize};
use sled::Batch;
use thiserror::Error;

pub const N_SUB_BLOCK: usize = 2;
pub const N_LINE_IN_BLOCK: usize = 20;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Block {0} out of range")]
    OutOfRange(u32),
    #[error("Block {block} sub-block {sub} hash mismatch")]
    HashMismatch { block: u32, sub: usize },
    #[error("Block {0} has {1} sub-blocks")]
    BadShape(u32, usize),
}

impl BlockError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            BlockError::Storage(e) => e.kind(),
            BlockError::HashMismatch { .. } => replica_core::ErrorKind::Authority,
            _ => replica_core::ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, BlockError>;

/// One block as sent on the wire: its sub-blocks' lines
pub type Block = Vec<Vec<String>>;

/// Block layout of an object plus which blocks are present locally
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(rename = "ID")]
    pub id: Eid,
    #[serde(rename = "N")]
    pub n_block: u32,
    #[serde(rename = "H")]
    pub hashs: Vec<Vec<Hash32>>,
    #[serde(rename = "M", default)]
    pub media_ids: Vec<Eid>,
    #[serde(rename = "G", default)]
    pub is_good: BitVector,
    #[serde(rename = "g", default)]
    pub is_all_good: bool,
}

impl BlockInfo {
    /// Fresh layout with no blocks present
    pub fn from_meta(meta: &BlockMeta) -> Self {
        Self {
            id: meta.id,
            n_block: meta.n_block,
            hashs: meta.hashs.clone(),
            media_ids: meta.media_ids.clone(),
            is_good: BitVector::new(meta.n_block as usize),
            is_all_good: meta.n_block == 0,
        }
    }

    pub fn meta(&self) -> BlockMeta {
        BlockMeta {
            id: self.id,
            n_block: self.n_block,
            hashs: self.hashs.clone(),
            media_ids: self.media_ids.clone(),
        }
    }

    /// Same layout, ignoring what is present
    pub fn same_layout(&self, meta: &BlockMeta) -> bool {
        self.id == meta.id && self.n_block == meta.n_block && self.hashs == meta.hashs
    }

    pub fn set_good(&mut self, idx: u32) {
        self.is_good.set(idx as usize);
        self.is_all_good = self.is_good.all_set(self.n_block as usize);
    }

    pub fn has(&self, idx: u32) -> bool {
        self.is_good.get(idx as usize)
    }

    /// Indices not yet present
    pub fn missing(&self) -> Vec<u32> {
        (0..self.n_block).filter(|i| !self.has(*i)).collect()
    }

    /// Check a received block against the announced hashes
    pub fn verify(&self, idx: u32, block: &Block) -> Result<()> {
        let hashes = self
            .hashs
            .get(idx as usize)
            .ok_or(BlockError::OutOfRange(idx))?;
        if block.len() != N_SUB_BLOCK || hashes.len() != N_SUB_BLOCK {
            return Err(BlockError::BadShape(idx, block.len()));
        }
        for (sub, (lines, expected)) in block.iter().zip(hashes).enumerate() {
            if sub_block_hash(lines)? != *expected {
                return Err(BlockError::HashMismatch { block: idx, sub });
            }
        }
        Ok(())
    }
}

pub fn sub_block_hash(lines: &[String]) -> Result<Hash32> {
    Ok(Hash32(keccak256(&canonical_json(&lines)?)))
}

/// Cut content into blocks and build the layout announcing them
pub fn split(content: &[String], lines_per_block: usize) -> Result<(BlockMeta, Vec<Block>)> {
    let lines_per_block = lines_per_block.max(1);
    let mut blocks = Vec::new();
    let mut hashs = Vec::new();
    for chunk in content.chunks(lines_per_block) {
        let mut block: Block = vec![Vec::new(); N_SUB_BLOCK];
        for (i, line) in chunk.iter().enumerate() {
            block[i % N_SUB_BLOCK].push(line.clone());
        }
        hashs.push(
            block
                .iter()
                .map(|lines| sub_block_hash(lines))
                .collect::<Result<Vec<_>>>()?,
        );
        blocks.push(block);
    }
    let meta = BlockMeta {
        id: Eid::new_random(),
        n_block: blocks.len() as u32,
        hashs,
        media_ids: Vec::new(),
    };
    Ok((meta, blocks))
}

/// Interleave sub-blocks back into lines
pub fn join(blocks: &[Block]) -> Vec<String> {
    let mut out = Vec::new();
    for block in blocks {
        let total: usize = block.iter().map(|s| s.len()).sum();
        for i in 0..total {
            if let Some(line) = block
                .get(i % N_SUB_BLOCK)
                .and_then(|sub| sub.get(i / N_SUB_BLOCK))
            {
                out.push(line.clone());
            }
        }
    }
    out
}

/// Sub-block storage of one entity
#[derive(Clone)]
pub struct BlockStore {
    db: Database,
    entity_id: Eid,
}

impl BlockStore {
    pub fn new(db: Database, entity_id: Eid) -> Self {
        Self { db, entity_id }
    }

    fn prefix(&self, kind: ObjectKind, object_id: &Eid, info_id: &Eid) -> Vec<u8> {
        key(&[
            &kind.prefix(b"bk"),
            self.entity_id.as_bytes(),
            object_id.as_bytes(),
            info_id.as_bytes(),
        ])
    }

    fn sub_key(&self, kind: ObjectKind, object_id: &Eid, info_id: &Eid, idx: u32, sub: usize) -> Vec<u8> {
        key(&[
            &self.prefix(kind, object_id, info_id),
            &idx.to_be_bytes(),
            &[sub as u8],
        ])
    }

    /// Verify and store a block, marking it present in `info`
    pub fn put_block(
        &self,
        kind: ObjectKind,
        object_id: &Eid,
        info: &mut BlockInfo,
        idx: u32,
        block: &Block,
    ) -> Result<()> {
        info.verify(idx, block)?;
        let mut batch = Batch::default();
        for (sub, lines) in block.iter().enumerate() {
            batch.insert(
                self.sub_key(kind, object_id, &info.id, idx, sub),
                serde_json::to_vec(lines)?,
            );
        }
        self.db.apply(batch)?;
        info.set_good(idx);
        Ok(())
    }

    /// A stored block, or `None` if it is not present
    pub fn get_block(&self, kind: ObjectKind, object_id: &Eid, info: &BlockInfo, idx: u32) -> Result<Option<Block>> {
        if idx >= info.n_block || !info.has(idx) {
            return Ok(None);
        }
        let mut block = Vec::with_capacity(N_SUB_BLOCK);
        for sub in 0..N_SUB_BLOCK {
            match self.db.get_json::<Vec<String>>(&self.sub_key(kind, object_id, &info.id, idx, sub))? {
                Some(lines) => block.push(lines),
                None => return Ok(None),
            }
        }
        Ok(Some(block))
    }

    /// Full content, once every block is present
    pub fn content(&self, kind: ObjectKind, object_id: &Eid, info: &BlockInfo) -> Result<Option<Vec<String>>> {
        if !info.is_all_good {
            return Ok(None);
        }
        let mut blocks = Vec::with_capacity(info.n_block as usize);
        for idx in 0..info.n_block {
            match self.get_block(kind, object_id, info, idx)? {
                Some(b) => blocks.push(b),
                None => return Ok(None),
            }
        }
        Ok(Some(join(&blocks)))
    }

    /// Drop every stored block of one layout
    pub fn remove(&self, kind: ObjectKind, object_id: &Eid, info_id: &Eid) -> Result<usize> {
        let prefix = self.prefix(kind, object_id, info_id);
        let mut batch = Batch::default();
        let mut n = 0;
        for item in self.db.iterate(&prefix, None, Order::Forward)? {
            let (k, _) = item?;
            batch.remove(k);
            n += 1;
        }
        self.db.apply(batch)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn create_test_blocks() -> (BlockStore, Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let store = BlockStore::new(storage.content.clone(), Eid::new_random());
        (store, storage, dir)
    }

    fn lines(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("line {}", i)).collect()
    }

    #[test]
    fn test_split_layout() {
        let (meta, blocks) = split(&lines(5), 2).unwrap();
        assert_eq!(meta.n_block, 3);
        assert_eq!(blocks[0], vec![vec!["line 0".to_string()], vec!["line 1".to_string()]]);
        assert_eq!(blocks[2], vec![vec!["line 4".to_string()], vec![]]);
        assert_eq!(join(&blocks), lines(5));

        let (meta, blocks) = split(&[], 20).unwrap();
        assert_eq!(meta.n_block, 0);
        assert!(blocks.is_empty());
        assert!(BlockInfo::from_meta(&meta).is_all_good);
    }

    #[test]
    fn test_store_and_reassemble_out_of_order() {
        let (store, _s, _dir) = create_test_blocks();
        let content = lines(45);
        let (meta, blocks) = split(&content, N_LINE_IN_BLOCK).unwrap();
        let object = Eid::new_random();
        let mut info = BlockInfo::from_meta(&meta);

        store.put_block(ObjectKind::Article, &object, &mut info, 2, &blocks[2]).unwrap();
        store.put_block(ObjectKind::Article, &object, &mut info, 0, &blocks[0]).unwrap();
        assert_eq!(info.missing(), vec![1]);
        assert!(!info.is_all_good);
        assert!(store.content(ObjectKind::Article, &object, &info).unwrap().is_none());
        assert!(store.get_block(ObjectKind::Article, &object, &info, 1).unwrap().is_none());

        store.put_block(ObjectKind::Article, &object, &mut info, 1, &blocks[1]).unwrap();
        assert!(info.is_all_good);
        assert_eq!(
            store.content(ObjectKind::Article, &object, &info).unwrap().unwrap(),
            content
        );

        assert_eq!(store.remove(ObjectKind::Article, &object, &info.id).unwrap(), 6);
        assert!(store.get_block(ObjectKind::Article, &object, &info, 0).unwrap().is_none());
    }

    #[test]
    fn test_rejects_tampered_block() {
        let (store, _s, _dir) = create_test_blocks();
        let (meta, mut blocks) = split(&lines(4), 2).unwrap();
        let mut info = BlockInfo::from_meta(&meta);
        blocks[0][1][0] = "forged".into();
        assert!(matches!(
            store.put_block(ObjectKind::Article, &Eid::new_random(), &mut info, 0, &blocks[0]),
            Err(BlockError::HashMismatch { block: 0, sub: 1 })
        ));
        assert!(matches!(
            store.put_block(ObjectKind::Article, &Eid::new_random(), &mut info, 7, &blocks[1]),
            Err(BlockError::OutOfRange(7))
        ));
        assert!(!info.has(0));
    }
}
