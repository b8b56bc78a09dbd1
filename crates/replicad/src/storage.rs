//! Persistent storage using sled
//!
//! One sled tree per logical store. [`Database`] wraps a tree with the
//! prefix iteration, index-keyed and timestamp-guarded writes the replication
//! layer is built on.

use crate::lock_map::{LockError, LockMap};
use replica_core::canonical::base64_vec;
use replica_core::Timestamp;
use replica_net::PeerInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, IVec};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Iteration start {0} does not extend prefix")]
    InvalidIterStart(String),
    #[error("Corrupt value under key {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            StorageError::Lock(e) => e.kind(),
            StorageError::InvalidIterStart(_) => replica_core::ErrorKind::Validation,
            _ => replica_core::ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Iteration direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Forward,
    Reverse,
}

/// Values that carry the timestamp of their last update
pub trait UpdateTs {
    fn update_ts(&self) -> Timestamp;
}

/// Secondary index record: the keys an item is stored under
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "K", with = "base64_vec")]
    pub keys: Vec<Vec<u8>>,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
}

impl Index {
    pub fn new(keys: Vec<Vec<u8>>, update_ts: Timestamp) -> Self {
        Self { keys, update_ts }
    }
}

impl UpdateTs for Index {
    fn update_ts(&self) -> Timestamp {
        self.update_ts
    }
}

/// Outcome of an index-keyed write
#[derive(Debug, Default)]
pub struct PutAll {
    /// False when a newer index was already stored
    pub written: bool,
    /// Keys of the index that was replaced
    pub old_keys: Vec<Vec<u8>>,
}

pub type KvIter = Box<dyn Iterator<Item = Result<(IVec, IVec)>> + Send>;

/// Concatenate key parts
pub fn key(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// One logical store
#[derive(Clone)]
pub struct Database {
    tree: sled::Tree,
    locks: Arc<LockMap>,
}

impl Database {
    pub fn new(tree: sled::Tree, locks: Arc<LockMap>) -> Self {
        Self { tree, locks }
    }

    pub fn locks(&self) -> &LockMap {
        &self.locks
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.tree.get(key)? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.tree.contains_key(key)?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    pub fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        self.put(key, &serde_json::to_vec(value)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    /// Remove and return
    pub fn pop(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.remove(key)?.map(|v| v.to_vec()))
    }

    /// Write unless the stored value carries a newer update timestamp.
    /// Returns whether the value was written.
    pub fn try_put<T>(&self, key: &[u8], value: &T) -> Result<bool>
    where
        T: Serialize + DeserializeOwned + UpdateTs,
    {
        let _guard = self.locks.lock(key)?;
        if let Some(existing) = self.get_json::<T>(key)? {
            if existing.update_ts() > value.update_ts() {
                return Ok(false);
            }
        }
        self.put_json(key, value)?;
        Ok(true)
    }

    /// Iterate keys under `prefix`, optionally starting at `start`.
    ///
    /// `start` must extend `prefix`. Forward iteration begins at the first key
    /// `>= start`; reverse iteration at the last key `<= start`, or at the
    /// largest key under the prefix when no start is given.
    pub fn iterate(&self, prefix: &[u8], start: Option<&[u8]>, order: Order) -> Result<KvIter> {
        let iter: KvIter = match (start, order) {
            (None, Order::Forward) => Box::new(self.tree.scan_prefix(prefix).map(lift)),
            (None, Order::Reverse) => Box::new(self.tree.scan_prefix(prefix).rev().map(lift)),
            (Some(start), order) => {
                if !start.starts_with(prefix) {
                    return Err(StorageError::InvalidIterStart(hex::encode(start)));
                }
                let prefix = prefix.to_vec();
                match order {
                    Order::Forward => Box::new(
                        self.tree
                            .range(start.to_vec()..)
                            .map(lift)
                            .take_while(move |r| match r {
                                Ok((k, _)) => k.starts_with(&prefix),
                                Err(_) => true,
                            }),
                    ),
                    Order::Reverse => {
                        Box::new(self.tree.range(prefix..=start.to_vec()).rev().map(lift))
                    }
                }
            }
        };
        Ok(iter)
    }

    /// Values under a prefix, decoded as JSON
    pub fn scan_json<T: DeserializeOwned>(&self, prefix: &[u8], order: Order) -> Result<Vec<T>> {
        self.iterate(prefix, None, order)?
            .map(|r| r.and_then(|(_, v)| Ok(serde_json::from_slice(&v)?)))
            .collect()
    }

    pub fn get_index(&self, idx_key: &[u8]) -> Result<Option<Index>> {
        self.get_json(idx_key)
    }

    /// Primary key behind an index
    pub fn get_key_by_idx_key(&self, idx_key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_index(idx_key)?
            .and_then(|idx| idx.keys.into_iter().next()))
    }

    /// Value stored under the primary key behind an index
    pub fn get_by_idx_key(&self, idx_key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get_key_by_idx_key(idx_key)? {
            Some(k) => self.get(&k),
            None => Ok(None),
        }
    }

    /// Write an index and its keys atomically unless a newer index is stored.
    pub fn try_put_all(
        &self,
        idx_key: &[u8],
        index: &Index,
        kvs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<PutAll> {
        self.put_all_with(idx_key, index, kvs, Batch::default(), false)
    }

    /// Write an index and its keys atomically, regardless of timestamps
    pub fn force_put_all(
        &self,
        idx_key: &[u8],
        index: &Index,
        kvs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<PutAll> {
        self.put_all_with(idx_key, index, kvs, Batch::default(), true)
    }

    /// Index-keyed write with extra operations folded into the same batch.
    ///
    /// Keys of the previous index that the new one no longer lists are removed.
    pub fn put_all_with(
        &self,
        idx_key: &[u8],
        index: &Index,
        kvs: &[(Vec<u8>, Vec<u8>)],
        mut batch: Batch,
        force: bool,
    ) -> Result<PutAll> {
        let _guard = self.locks.lock(idx_key)?;
        let old = self.get_index(idx_key)?;
        if let Some(old) = &old {
            if !force && old.update_ts > index.update_ts {
                return Ok(PutAll {
                    written: false,
                    old_keys: old.keys.clone(),
                });
            }
            for k in &old.keys {
                if !index.keys.contains(k) {
                    batch.remove(k.as_slice());
                }
            }
        }
        batch.insert(idx_key, serde_json::to_vec(index)?);
        for (k, v) in kvs {
            batch.insert(k.as_slice(), v.as_slice());
        }
        self.tree.apply_batch(batch)?;
        Ok(PutAll {
            written: true,
            old_keys: old.map(|o| o.keys).unwrap_or_default(),
        })
    }

    /// Remove an index and every key it lists
    pub fn delete_all(&self, idx_key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let _guard = self.locks.lock(idx_key)?;
        let Some(index) = self.get_index(idx_key)? else {
            return Ok(Vec::new());
        };
        let mut batch = Batch::default();
        batch.remove(idx_key);
        for k in &index.keys {
            batch.remove(k.as_slice());
        }
        self.tree.apply_batch(batch)?;
        Ok(index.keys)
    }

    /// Apply a batch atomically
    pub fn apply(&self, batch: Batch) -> Result<()> {
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}

fn lift(r: std::result::Result<(IVec, IVec), sled::Error>) -> Result<(IVec, IVec)> {
    r.map_err(StorageError::from)
}

/// Storage backend for replicad
pub struct Storage {
    db: Db,
    locks: Arc<LockMap>,
    /// Oplogs, their indexes and Merkle nodes
    pub oplog: Database,
    /// Objects, blocks and counters
    pub content: Database,
    /// Sync times, fix sentinels and other bookkeeping
    pub meta: Database,
    /// Local key material
    pub key: Database,
    /// Peer table
    peers: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let locks = Arc::new(LockMap::new());
        let oplog = Database::new(db.open_tree("oplog")?, locks.clone());
        let content = Database::new(db.open_tree("content")?, locks.clone());
        let meta = Database::new(db.open_tree("meta")?, locks.clone());
        let key = Database::new(db.open_tree("key")?, locks.clone());
        let peers = db.open_tree("peers")?;

        Ok(Self {
            db,
            locks,
            oplog,
            content,
            meta,
            key,
            peers,
        })
    }

    pub fn locks(&self) -> Arc<LockMap> {
        self.locks.clone()
    }

    /// Store a peer
    pub fn put_peer(&self, peer: &PeerInfo) -> Result<()> {
        let value = postcard::to_allocvec(peer)?;
        self.peers.insert(peer.id.as_bytes(), value)?;
        Ok(())
    }

    pub fn remove_peer(&self, peer: &PeerInfo) -> Result<()> {
        self.peers.remove(peer.id.as_bytes())?;
        Ok(())
    }

    /// Load all known peers
    pub fn load_peers(&self) -> Result<Vec<PeerInfo>> {
        let mut peers = Vec::new();
        for item in self.peers.iter() {
            let (_, value) = item?;
            peers.push(postcard::from_bytes(&value)?);
        }
        Ok(peers)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::Eid;

    fn create_test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (storage, dir)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Stamped {
        v: u32,
        ut: Timestamp,
    }

    impl UpdateTs for Stamped {
        fn update_ts(&self) -> Timestamp {
            self.ut
        }
    }

    #[test]
    fn test_try_put_refuses_older() {
        let (storage, _dir) = create_test_storage();
        let db = &storage.meta;
        let newer = Stamped {
            v: 1,
            ut: Timestamp::new(100, 0),
        };
        let older = Stamped {
            v: 2,
            ut: Timestamp::new(99, 0),
        };
        let same = Stamped {
            v: 3,
            ut: Timestamp::new(100, 0),
        };
        assert!(db.try_put(b"k", &newer).unwrap());
        assert!(!db.try_put(b"k", &older).unwrap());
        assert_eq!(db.get_json::<Stamped>(b"k").unwrap().unwrap().v, 1);
        assert!(db.try_put(b"k", &same).unwrap());
        assert_eq!(db.get_json::<Stamped>(b"k").unwrap().unwrap().v, 3);
    }

    fn fill(db: &Database) {
        for k in [&b"a1"[..], b"b1", b"b2", b"b3", b"c1"] {
            db.put(k, k).unwrap();
        }
    }

    fn keys(iter: KvIter) -> Vec<Vec<u8>> {
        iter.map(|r| r.unwrap().0.to_vec()).collect()
    }

    #[test]
    fn test_iterate_prefix_orders() {
        let (storage, _dir) = create_test_storage();
        let db = &storage.content;
        fill(db);

        let fwd = keys(db.iterate(b"b", None, Order::Forward).unwrap());
        assert_eq!(fwd, vec![b"b1".to_vec(), b"b2".to_vec(), b"b3".to_vec()]);

        let rev = keys(db.iterate(b"b", None, Order::Reverse).unwrap());
        assert_eq!(rev, vec![b"b3".to_vec(), b"b2".to_vec(), b"b1".to_vec()]);
    }

    #[test]
    fn test_iterate_with_start() {
        let (storage, _dir) = create_test_storage();
        let db = &storage.content;
        fill(db);

        let fwd = keys(db.iterate(b"b", Some(b"b2"), Order::Forward).unwrap());
        assert_eq!(fwd, vec![b"b2".to_vec(), b"b3".to_vec()]);

        let rev = keys(db.iterate(b"b", Some(b"b2"), Order::Reverse).unwrap());
        assert_eq!(rev, vec![b"b2".to_vec(), b"b1".to_vec()]);

        assert!(matches!(
            db.iterate(b"b", Some(b"c1"), Order::Forward),
            Err(StorageError::InvalidIterStart(_))
        ));
    }

    #[test]
    fn test_put_all_replaces_stale_keys() {
        let (storage, _dir) = create_test_storage();
        let db = &storage.oplog;
        let first = Index::new(vec![b"p1".to_vec(), b"x1".to_vec()], Timestamp::new(10, 0));
        db.try_put_all(
            b"idx",
            &first,
            &[(b"p1".to_vec(), b"v1".to_vec()), (b"x1".to_vec(), b"x".to_vec())],
        )
        .unwrap();
        assert_eq!(db.get_by_idx_key(b"idx").unwrap().unwrap(), b"v1".to_vec());

        let second = Index::new(vec![b"p2".to_vec(), b"x1".to_vec()], Timestamp::new(11, 0));
        let out = db
            .try_put_all(
                b"idx",
                &second,
                &[(b"p2".to_vec(), b"v2".to_vec()), (b"x1".to_vec(), b"x".to_vec())],
            )
            .unwrap();
        assert!(out.written);
        assert_eq!(out.old_keys.len(), 2);
        assert!(db.get(b"p1").unwrap().is_none());
        assert!(db.get(b"x1").unwrap().is_some());
        assert_eq!(db.get_key_by_idx_key(b"idx").unwrap().unwrap(), b"p2".to_vec());

        // older index is refused unless forced
        let stale = Index::new(vec![b"p0".to_vec()], Timestamp::new(5, 0));
        let out = db
            .try_put_all(b"idx", &stale, &[(b"p0".to_vec(), b"v0".to_vec())])
            .unwrap();
        assert!(!out.written);
        assert!(db.get(b"p0").unwrap().is_none());
        db.force_put_all(b"idx", &stale, &[(b"p0".to_vec(), b"v0".to_vec())])
            .unwrap();
        assert!(db.get(b"p2").unwrap().is_none());

        let removed = db.delete_all(b"idx").unwrap();
        assert_eq!(removed, vec![b"p0".to_vec()]);
        assert!(db.get(b"idx").unwrap().is_none());
        assert!(db.get(b"p0").unwrap().is_none());
    }

    #[test]
    fn test_pop() {
        let (storage, _dir) = create_test_storage();
        storage.meta.put(b"k", b"v").unwrap();
        assert_eq!(storage.meta.pop(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(storage.meta.pop(b"k").unwrap(), None);
    }

    #[test]
    fn test_peer_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let peer = PeerInfo::new(Eid::new_random(), vec!["127.0.0.1:9000".parse().unwrap()]);
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.put_peer(&peer).unwrap();
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.load_peers().unwrap(), vec![peer]);
    }
}
