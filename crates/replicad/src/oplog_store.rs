//! Per-stream oplog storage
//!
//! Primary keys are `prefix(status) ‖ entity ‖ update_ts ‖ id`, so each
//! status bucket iterates in update order. An id index records every key an
//! oplog occupies; rewriting the oplog under a new status drops the old keys
//! in the same batch, including the Merkle leaf when it stops being alive.

use crate::merkle::{MerkleLevel, MerkleNode, MerkleTree};
use crate::oplog::Oplog;
use crate::storage::{key, Database, Index, Order, StorageError, UpdateTs};
use replica_core::{Address, Eid, Status, Stream, Timestamp};
use serde::{Deserialize, Serialize};
use sled::Batch;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OplogError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Oplog not found: {0}")]
    NotFound(Eid),
    #[error("Oplog status {0:?} cannot be stored")]
    InvalidStatus(Status),
}

impl OplogError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            OplogError::Storage(e) => e.kind(),
            OplogError::Core(e) => e.kind(),
            _ => replica_core::ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, OplogError>;

/// Which copy of an oplog to keep
#[derive(Debug)]
pub enum Selection {
    /// Nothing stored under this id
    New,
    /// Identical copy stored
    Same(Oplog),
    /// Incoming copy wins over the stored one
    Replace(Oplog),
    /// Stored copy wins
    KeepExisting(Oplog),
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct SyncTime {
    #[serde(rename = "UT")]
    update_ts: Timestamp,
}

impl UpdateTs for SyncTime {
    fn update_ts(&self) -> Timestamp {
        self.update_ts
    }
}

fn status_suffix(status: Status) -> Option<&'static [u8; 2]> {
    match status {
        Status::Alive => Some(b"lg"),
        Status::Pending => Some(b"lm"),
        Status::InternalPending => Some(b"li"),
        Status::Failed => Some(b"lf"),
        _ => None,
    }
}

/// Oplogs of one stream of one entity
#[derive(Clone)]
pub struct OplogStore {
    db: Database,
    meta: Database,
    stream: Stream,
    entity_id: Eid,
    merkle: MerkleTree,
}

impl OplogStore {
    pub fn new(db: Database, meta: Database, stream: Stream, entity_id: Eid) -> Self {
        let merkle = MerkleTree::new(db.clone(), stream, entity_id);
        Self {
            db,
            meta,
            stream,
            entity_id,
            merkle,
        }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn merkle(&self) -> &MerkleTree {
        &self.merkle
    }

    fn base(&self, suffix: &[u8; 2]) -> Vec<u8> {
        key(&[&self.stream.prefix(suffix), self.entity_id.as_bytes()])
    }

    fn primary_key(&self, status: Status, update_ts: Timestamp, id: &Eid) -> Result<Vec<u8>> {
        let suffix = status_suffix(status).ok_or(OplogError::InvalidStatus(status))?;
        Ok(key(&[&self.base(suffix), &update_ts.to_bytes(), id.as_bytes()]))
    }

    fn idx_key(&self, id: &Eid) -> Vec<u8> {
        key(&[&self.base(b"ig"), id.as_bytes()])
    }

    fn object_key(&self, object_id: &Eid, update_ts: Timestamp, id: &Eid) -> Vec<u8> {
        key(&[
            &self.base(b"ob"),
            object_id.as_bytes(),
            &update_ts.to_bytes(),
            id.as_bytes(),
        ])
    }

    /// Write an oplog under its current status, replacing any previous copy
    pub fn append(&self, oplog: &Oplog) -> Result<()> {
        let status = oplog.status();
        let primary = self.primary_key(status, oplog.update_ts, &oplog.id)?;
        let by_object = self.object_key(&oplog.object_id, oplog.update_ts, &oplog.id);
        let mut kvs = vec![
            (primary, serde_json::to_vec(oplog)?),
            (by_object, oplog.id.as_bytes().to_vec()),
        ];
        if status == Status::Alive {
            kvs.push(
                self.merkle
                    .leaf_entry(oplog.update_ts, &oplog.id, oplog.leaf_address()),
            );
        }
        let index = Index::new(kvs.iter().map(|(k, _)| k.clone()).collect(), oplog.update_ts);

        let mut batch = Batch::default();
        batch.insert(self.merkle.dirty_key(oplog.update_ts), &[][..]);
        self.db
            .put_all_with(&self.idx_key(&oplog.id), &index, &kvs, batch, true)?;
        Ok(())
    }

    pub fn get(&self, id: &Eid) -> Result<Option<Oplog>> {
        match self.db.get_by_idx_key(&self.idx_key(id))? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: &Eid) -> Result<bool> {
        Ok(self.db.contains(&self.idx_key(id))?)
    }

    /// Oplogs for the given ids, skipping unknown ones
    pub fn get_many(&self, ids: &[Eid]) -> Result<Vec<Oplog>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(log) = self.get(id)? {
                out.push(log);
            }
        }
        Ok(out)
    }

    /// Move an oplog to `Failed`, or confirm `Alive` once a master log id is set
    pub fn update_status(&self, id: &Eid, status: Status) -> Result<Oplog> {
        let mut log = self.get(id)?.ok_or(OplogError::NotFound(*id))?;
        match status {
            Status::Failed => log.failed = true,
            Status::Alive if log.master_log_id.is_some() => log.failed = false,
            other => return Err(OplogError::InvalidStatus(other)),
        }
        self.append(&log)?;
        Ok(log)
    }

    pub fn set_is_sync(&self, id: &Eid, is_sync: bool) -> Result<()> {
        let mut log = self.get(id)?.ok_or(OplogError::NotFound(*id))?;
        if log.is_sync != is_sync {
            log.is_sync = is_sync;
            self.append(&log)?;
        }
        Ok(())
    }

    pub fn delete(&self, id: &Eid) -> Result<()> {
        if let Some(log) = self.get(id)? {
            self.db.delete_all(&self.idx_key(id))?;
            self.merkle.mark_dirty(log.update_ts)?;
        }
        Ok(())
    }

    /// Up to `limit` oplogs of one status, strictly after `after` in the given order
    pub fn range(
        &self,
        status: Status,
        after: Option<(Timestamp, Eid)>,
        limit: usize,
        order: Order,
    ) -> Result<Vec<Oplog>> {
        let prefix = match status_suffix(status) {
            Some(suffix) => self.base(suffix),
            None => return Ok(Vec::new()),
        };
        let start = after.map(|(ts, id)| key(&[&prefix, &ts.to_bytes(), id.as_bytes()]));
        let mut out = Vec::new();
        for item in self.db.iterate(&prefix, start.as_deref(), order)? {
            let (k, v) = item?;
            if start.as_deref() == Some(&k[..]) {
                continue;
            }
            out.push(serde_json::from_slice(&v)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Every oplog of one status in update order
    pub fn all(&self, status: Status) -> Result<Vec<Oplog>> {
        self.range(status, None, usize::MAX, Order::Forward)
    }

    /// Oplogs touching one object, in update order
    pub fn by_object(&self, object_id: &Eid, order: Order) -> Result<Vec<Oplog>> {
        let prefix = key(&[&self.base(b"ob"), object_id.as_bytes()]);
        let mut out = Vec::new();
        for item in self.db.iterate(&prefix, None, order)? {
            let (_, v) = item?;
            let id = Eid::from_slice(&v)?;
            if let Some(log) = self.get(&id)? {
                out.push(log);
            }
        }
        Ok(out)
    }

    /// Alive oplogs with update ts in `[start, end)`
    pub fn alive_in(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Oplog>> {
        let ids: Vec<Eid> = self
            .merkle
            .leaf_ids(start, end)?
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        self.get_many(&ids)
    }

    /// Alive oplogs the object layer has not finished applying
    pub fn unsynced(&self) -> Result<Vec<Oplog>> {
        Ok(self
            .all(Status::Alive)?
            .into_iter()
            .filter(|l| !l.is_sync)
            .collect())
    }

    /// Decide between a stored copy and an incoming one.
    ///
    /// Identical hashes keep the stored copy. Otherwise the higher status
    /// class wins, then the earlier update ts, then the smaller hash. A failed
    /// copy always yields to a non-failed one so it gets re-examined.
    pub fn select_existing(&self, incoming: &Oplog) -> Result<Selection> {
        let Some(existing) = self.get(&incoming.id)? else {
            return Ok(Selection::New);
        };
        if existing.failed && !incoming.failed {
            return Ok(Selection::Replace(existing));
        }
        if existing.hash == incoming.hash {
            return Ok(Selection::Same(existing));
        }
        let mine = existing.status().class().conflict_rank();
        let theirs = incoming.status().class().conflict_rank();
        let incoming_wins = match theirs.cmp(&mine) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                (incoming.update_ts, incoming.hash) < (existing.update_ts, existing.hash)
            }
        };
        Ok(if incoming_wins {
            Selection::Replace(existing)
        } else {
            Selection::KeepExisting(existing)
        })
    }

    fn sync_time_key(&self) -> Vec<u8> {
        self.base(b"st")
    }

    /// Newest update ts taken in from peers
    pub fn sync_time(&self) -> Result<Timestamp> {
        Ok(self
            .meta
            .get_json::<SyncTime>(&self.sync_time_key())?
            .map(|s| s.update_ts)
            .unwrap_or_default())
    }

    pub fn save_sync_time(&self, ts: Timestamp) -> Result<()> {
        self.meta
            .try_put(&self.sync_time_key(), &SyncTime { update_ts: ts })?;
        Ok(())
    }

    pub fn tree_list(&self, ts: Timestamp) -> Result<Vec<MerkleNode>> {
        Ok(self.merkle.tree_list(ts)?)
    }

    pub fn root(&self, ts: Timestamp) -> Result<Address> {
        Ok(self.merkle.root(ts)?)
    }

    pub fn children(&self, level: MerkleLevel, start: Timestamp) -> Result<Vec<MerkleNode>> {
        Ok(self.merkle.children(level, start)?)
    }
}
