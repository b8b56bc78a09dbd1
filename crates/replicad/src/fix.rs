//! One-shot repairs of data written by older nodes
//!
//! Each fix leaves a marker in the meta tree so it runs once per entity.

use crate::handler::EntityStores;
use crate::oplog_store::OplogError;
use crate::storage::{key, StorageError};
use replica_core::{ObjectKind, OpKind, OpPayload, Status, Stream};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FixError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Oplog error: {0}")]
    Oplog(#[from] OplogError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
}

impl FixError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            FixError::Storage(e) => e.kind(),
            FixError::Oplog(e) => e.kind(),
            FixError::Core(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FixError>;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FixReport {
    pub prev_log_ids: usize,
    pub duplicate_masters: usize,
}

pub fn run(stores: &EntityStores) -> Result<FixReport> {
    Ok(FixReport {
        prev_log_ids: fix_prev_log_id(stores)?,
        duplicate_masters: fix_duplicate_master(stores)?,
    })
}

pub(crate) fn marker(tag: &[u8], stores: &EntityStores) -> Vec<u8> {
    key(&[tag, stores.entity_id.as_bytes()])
}

/// Creates of articles and comments once carried a predecessor. Creates are
/// unchained, so the link is dropped.
pub fn fix_prev_log_id(stores: &EntityStores) -> Result<usize> {
    let done = marker(b".fxpl", stores);
    if stores.meta.contains(&done)? {
        return Ok(0);
    }
    let store = stores.oplogs(Stream::Board);
    let mut fixed = 0;
    for status in [Status::Alive, Status::Pending, Status::InternalPending] {
        for mut log in store.all(status)? {
            let kind = log.kind()?;
            if !matches!(kind, OpKind::CreateArticle | OpKind::CreateComment) || log.prev_log_id.is_none() {
                continue;
            }
            log.prev_log_id = None;
            store.append(&log)?;
            fixed += 1;
        }
    }
    stores.meta.put(&done, &[1])?;
    if fixed > 0 {
        info!(entity = %stores.entity_id, fixed, "Cleared predecessor of create oplogs");
    }
    Ok(fixed)
}

/// Keep only the oldest alive genesis of the entity
pub fn fix_duplicate_master(stores: &EntityStores) -> Result<usize> {
    let done = marker(b".fxdm", stores);
    if stores.meta.contains(&done)? {
        return Ok(0);
    }
    let store = stores.oplogs(Stream::Master);
    let mut genesis = Vec::new();
    for log in store.all(Status::Alive)? {
        if log.kind()? != OpKind::CreateMaster {
            continue;
        }
        if let OpPayload::Master(data) = log.payload()? {
            if data.acceptance.is_none() {
                genesis.push(log);
            }
        }
    }
    genesis.sort_by_key(|l| l.order_key());

    let mut fixed = 0;
    if let Some((kept, rest)) = genesis.split_first() {
        for dup in rest {
            warn!(entity = %stores.entity_id, oplog = %dup.id, kept = %kept.id, "Dropping duplicate genesis");
            store.update_status(&dup.id, Status::Failed)?;
            if let Some(mut obj) = stores.objects.get(ObjectKind::Master, &dup.object_id)? {
                if obj.log_id == dup.id {
                    obj.log_id = kept.id;
                    stores.objects.save(&obj)?;
                }
            }
            fixed += 1;
        }
    }
    stores.meta.put(&done, &[1])?;
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::Oplog;
    use crate::storage::Storage;
    use replica_core::crypto::KeyPair;
    use replica_core::op::{CreateObjectData, MasterOpData};
    use replica_core::{Eid, Timestamp};

    fn create_test_stores() -> (EntityStores, KeyPair, Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let owner = KeyPair::generate();
        let stores = EntityStores::new(&storage, Eid::with_address(&owner.address()));
        (stores, owner, storage, dir)
    }

    fn alive(stores: &EntityStores, owner: &KeyPair, kind: OpKind, prev: Option<Eid>, payload: OpPayload, ts: i64) -> Oplog {
        let me = Eid::with_address_postfix(&owner.address(), &stores.entity_id);
        let object = if kind == OpKind::CreateMaster { me } else { Eid::new_random() };
        let mut log = Oplog::new(stores.entity_id, kind, me, object, prev, &payload, Timestamp::new(ts, 0)).unwrap();
        log.sign(owner).unwrap();
        log.master_sign(me, owner, Timestamp::new(ts, 0)).unwrap();
        log.set_alive(me);
        log
    }

    #[test]
    fn test_prev_log_id_cleared_once() {
        let (stores, owner, _s, _dir) = create_test_stores();
        let payload = OpPayload::CreateObject(CreateObjectData::default());
        let log = alive(&stores, &owner, OpKind::CreateArticle, Some(Eid::new_random()), payload, 100);
        let hash = log.hash;
        stores.oplogs(Stream::Board).append(&log).unwrap();

        assert_eq!(fix_prev_log_id(&stores).unwrap(), 1);
        let stored = stores.oplogs(Stream::Board).get(&log.id).unwrap().unwrap();
        assert!(stored.prev_log_id.is_none());
        assert_eq!(stored.hash, hash);
        assert!(stored.verify().is_ok());

        let mut again = stored.clone();
        again.prev_log_id = Some(Eid::new_random());
        stores.oplogs(Stream::Board).append(&again).unwrap();
        assert_eq!(fix_prev_log_id(&stores).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_genesis_keeps_oldest() {
        let (stores, owner, _s, _dir) = create_test_stores();
        let payload = OpPayload::Master(MasterOpData::default());
        let first = alive(&stores, &owner, OpKind::CreateMaster, None, payload.clone(), 100);
        let second = alive(&stores, &owner, OpKind::CreateMaster, None, payload, 200);
        stores.oplogs(Stream::Master).append(&first).unwrap();
        stores.oplogs(Stream::Master).append(&second).unwrap();

        let report = run(&stores).unwrap();
        assert_eq!(report.duplicate_masters, 1);
        let store = stores.oplogs(Stream::Master);
        assert_eq!(store.get(&first.id).unwrap().unwrap().status(), Status::Alive);
        assert_eq!(store.get(&second.id).unwrap().unwrap().status(), Status::Failed);
        assert_eq!(run(&stores).unwrap(), FixReport::default());
    }
}
