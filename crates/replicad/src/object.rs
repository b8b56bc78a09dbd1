//! Materialized objects
//!
//! An object is the current state of everything its oplogs did to it. While
//! an update or delete is pending, or its blocks are still arriving, the
//! change waits in [`SyncInfo`] and the visible state stays as it was.

use crate::block::BlockInfo;
use crate::storage::{key, Database, Index, Order, StorageError, UpdateTs};
use replica_core::{Eid, ObjectKind, Status, Timestamp, Version, CURRENT_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A change waiting to be applied
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    #[serde(rename = "l")]
    pub log_id: Eid,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "S")]
    pub status: Status,
    #[serde(rename = "d", default)]
    pub is_delete: bool,
    #[serde(rename = "a", default)]
    pub attrs: Value,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockInfo>,
}

impl SyncInfo {
    fn rank(&self) -> u8 {
        u8::from(self.is_delete)
    }

    /// Whether `self` should replace `orig` as the waiting change.
    ///
    /// Deletes beat updates. Within a class the later update ts wins and
    /// equal timestamps fall to the smaller log id.
    pub fn replaces(&self, orig: &SyncInfo) -> bool {
        if self.rank() != orig.rank() {
            return self.rank() > orig.rank();
        }
        if self.update_ts != orig.update_ts {
            return self.update_ts > orig.update_ts;
        }
        self.log_id < orig.log_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Object {
    #[serde(rename = "V")]
    pub version: Version,
    #[serde(rename = "ID")]
    pub id: Eid,
    #[serde(rename = "k")]
    pub kind: ObjectKind,
    #[serde(rename = "CID")]
    pub creator_id: Eid,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    /// Oplog that created the object
    #[serde(rename = "l")]
    pub log_id: Eid,
    /// Oplog whose state is currently applied
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub update_log_id: Option<Eid>,
    #[serde(rename = "S")]
    pub status: Status,
    #[serde(rename = "P", default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Eid>,
    #[serde(rename = "a", default)]
    pub attrs: Value,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockInfo>,
    #[serde(rename = "y", default, skip_serializing_if = "Option::is_none")]
    pub sync_info: Option<SyncInfo>,
}

impl Object {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Eid,
        kind: ObjectKind,
        creator_id: Eid,
        log_id: Eid,
        ts: Timestamp,
        status: Status,
        attrs: Value,
        block: Option<BlockInfo>,
    ) -> Self {
        Self {
            version: CURRENT_VERSION,
            id,
            kind,
            creator_id,
            create_ts: ts,
            update_ts: ts,
            log_id,
            update_log_id: None,
            status,
            parent: None,
            attrs,
            block,
            sync_info: None,
        }
    }

    /// Every announced block is present
    pub fn blocks_complete(&self) -> bool {
        self.block.as_ref().map(|b| b.is_all_good).unwrap_or(true)
    }

    /// Media attached through the block layout
    pub fn media_ids(&self) -> Vec<Eid> {
        self.block
            .as_ref()
            .map(|b| b.media_ids.clone())
            .unwrap_or_default()
    }
}

impl UpdateTs for Object {
    fn update_ts(&self) -> Timestamp {
        self.update_ts
    }
}

/// Objects of one entity
#[derive(Clone)]
pub struct ObjectStore {
    db: Database,
    meta: Database,
    entity_id: Eid,
}

impl ObjectStore {
    pub fn new(db: Database, meta: Database, entity_id: Eid) -> Self {
        Self {
            db,
            meta,
            entity_id,
        }
    }

    fn primary_key(&self, kind: ObjectKind, create_ts: Timestamp, id: &Eid) -> Vec<u8> {
        key(&[
            &kind.prefix(b"db"),
            self.entity_id.as_bytes(),
            &create_ts.to_bytes(),
            id.as_bytes(),
        ])
    }

    fn idx_key(&self, kind: ObjectKind, id: &Eid) -> Vec<u8> {
        key(&[&kind.prefix(b"ix"), self.entity_id.as_bytes(), id.as_bytes()])
    }

    pub fn get(&self, kind: ObjectKind, id: &Eid) -> Result<Option<Object>, StorageError> {
        match self.db.get_by_idx_key(&self.idx_key(kind, id))? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    /// Write regardless of what is stored
    pub fn save(&self, obj: &Object) -> Result<(), StorageError> {
        let primary = self.primary_key(obj.kind, obj.create_ts, &obj.id);
        let index = Index::new(vec![primary.clone()], obj.update_ts);
        self.db.force_put_all(
            &self.idx_key(obj.kind, &obj.id),
            &index,
            &[(primary, serde_json::to_vec(obj)?)],
        )?;
        Ok(())
    }

    /// Write unless a newer copy is stored. Returns whether it was written.
    pub fn try_save(&self, obj: &Object) -> Result<bool, StorageError> {
        let primary = self.primary_key(obj.kind, obj.create_ts, &obj.id);
        let index = Index::new(vec![primary.clone()], obj.update_ts);
        let out = self.db.try_put_all(
            &self.idx_key(obj.kind, &obj.id),
            &index,
            &[(primary, serde_json::to_vec(obj)?)],
        )?;
        Ok(out.written)
    }

    /// Physically remove an object
    pub fn remove(&self, kind: ObjectKind, id: &Eid) -> Result<(), StorageError> {
        self.db.delete_all(&self.idx_key(kind, id))?;
        Ok(())
    }

    /// Objects of one kind in creation order
    pub fn list(&self, kind: ObjectKind) -> Result<Vec<Object>, StorageError> {
        let prefix = key(&[&kind.prefix(b"db"), self.entity_id.as_bytes()]);
        self.db.scan_json(&prefix, Order::Forward)
    }

    pub fn list_with_status(&self, kind: ObjectKind, status: Status) -> Result<Vec<Object>, StorageError> {
        Ok(self
            .list(kind)?
            .into_iter()
            .filter(|o| o.status == status)
            .collect())
    }

    fn last_seen_prefix(&self, object_id: &Eid) -> Vec<u8> {
        key(&[b".lsdb", self.entity_id.as_bytes(), object_id.as_bytes()])
    }

    /// Record that `reader` has seen `object_id` up to `ts`
    pub fn set_last_seen(&self, object_id: &Eid, reader: &Eid, ts: Timestamp) -> Result<bool, StorageError> {
        let k = key(&[&self.last_seen_prefix(object_id), reader.as_bytes()]);
        self.meta.try_put(&k, &Index::new(Vec::new(), ts))
    }

    pub fn last_seen(&self, object_id: &Eid, reader: &Eid) -> Result<Option<Timestamp>, StorageError> {
        let k = key(&[&self.last_seen_prefix(object_id), reader.as_bytes()]);
        Ok(self.meta.get_json::<Index>(&k)?.map(|i| i.update_ts))
    }

    /// Forget every last-seen mark of an object
    pub fn wipe_last_seen(&self, object_id: &Eid) -> Result<usize, StorageError> {
        let prefix = self.last_seen_prefix(object_id);
        let mut batch = sled::Batch::default();
        let mut n = 0;
        for item in self.meta.iterate(&prefix, None, Order::Forward)? {
            let (k, _) = item?;
            batch.remove(k);
            n += 1;
        }
        self.meta.apply(batch)?;
        Ok(n)
    }
}
