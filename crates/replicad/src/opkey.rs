//! Local operational keys
//!
//! App oplogs are signed with short-lived keys derived from the master key,
//! never with the master key itself. This module keeps the private halves
//! and the next derivation index; the public record lives in the opkey
//! stream and is read back through [`crate::authority`].

use crate::storage::{key, Database, Order, StorageError};
use replica_core::bip32::{derive_child_with_retry, KeyExtraInfo};
use replica_core::canonical::base64_bytes;
use replica_core::crypto::KeyPair;
use replica_core::op::OpKeyOpData;
use replica_core::{Eid, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum OpKeyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
    #[error("No operational key valid at {0}")]
    NoValidKey(Timestamp),
    #[error("Derivation index space exhausted after {0}")]
    IndexExhausted(u32),
}

impl OpKeyError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            OpKeyError::Storage(e) => e.kind(),
            OpKeyError::Core(e) => e.kind(),
            OpKeyError::NoValidKey(_) => replica_core::ErrorKind::Authority,
            OpKeyError::IndexExhausted(_) => replica_core::ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, OpKeyError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LocalOpKey {
    #[serde(rename = "ID")]
    id: Eid,
    #[serde(rename = "k", with = "base64_bytes")]
    private: Vec<u8>,
    #[serde(rename = "CT")]
    create_ts: Timestamp,
    #[serde(rename = "r", default)]
    revoked: bool,
}

/// A freshly derived key, ready to be announced
pub struct NewOpKey {
    pub id: Eid,
    pub key: KeyPair,
    pub payload: OpKeyOpData,
}

pub struct OpKeyManager {
    db: Database,
    entity_id: Eid,
    master: KeyPair,
    renew_secs: i64,
    expire_secs: i64,
}

impl OpKeyManager {
    pub fn new(db: Database, entity_id: Eid, master: KeyPair, renew_secs: i64, expire_secs: i64) -> Self {
        Self {
            db,
            entity_id,
            master,
            renew_secs,
            expire_secs,
        }
    }

    fn index_key(&self) -> Vec<u8> {
        key(&[b".okix", self.entity_id.as_bytes()])
    }

    fn keys_prefix(&self) -> Vec<u8> {
        key(&[b".okpk", self.entity_id.as_bytes()])
    }

    fn key_key(&self, create_ts: Timestamp, id: &Eid) -> Vec<u8> {
        key(&[&self.keys_prefix(), &create_ts.to_bytes(), id.as_bytes()])
    }

    fn local_keys(&self) -> Result<Vec<LocalOpKey>> {
        Ok(self.db.scan_json(&self.keys_prefix(), Order::Reverse)?)
    }

    /// Derive the next key and store its private half
    pub fn create(&self, now: Timestamp) -> Result<NewOpKey> {
        let start = self.db.get_json::<u32>(&self.index_key())?.unwrap_or(0);
        let (child, extra): (KeyPair, KeyExtraInfo) = derive_child_with_retry(&self.master, start)?;
        let next = extra
            .data
            .child
            .checked_add(1)
            .ok_or(OpKeyError::IndexExhausted(extra.data.child))?;
        self.db.put_json(&self.index_key(), &next)?;

        let id = Eid::with_address(&child.address());
        let local = LocalOpKey {
            id,
            private: child.private_bytes().to_vec(),
            create_ts: now,
            revoked: false,
        };
        self.db.put_json(&self.key_key(now, &id), &local)?;
        debug!(entity = %self.entity_id, opkey = %id, index = extra.data.child, "Derived operational key");

        Ok(NewOpKey {
            id,
            payload: OpKeyOpData {
                pubkey: child.public_key_bytes(),
                extra: Some(extra),
            },
            key: child,
        })
    }

    /// Newest unrevoked key that has not expired at `now`
    pub fn current(&self, now: Timestamp) -> Result<(Eid, KeyPair)> {
        for local in self.local_keys()? {
            if local.revoked || local.create_ts > now {
                continue;
            }
            if now > local.create_ts.add_seconds(self.expire_secs) {
                break;
            }
            return Ok((local.id, KeyPair::from_private_bytes(&local.private)?));
        }
        Err(OpKeyError::NoValidKey(now))
    }

    /// No key, or the newest one is due for rotation
    pub fn needs_renewal(&self, now: Timestamp) -> Result<bool> {
        Ok(match self.local_keys()?.into_iter().find(|k| !k.revoked) {
            Some(newest) => now >= newest.create_ts.add_seconds(self.renew_secs),
            None => true,
        })
    }

    /// Unrevoked keys past their expiry
    pub fn expired(&self, now: Timestamp) -> Result<Vec<Eid>> {
        Ok(self
            .local_keys()?
            .into_iter()
            .filter(|k| !k.revoked && now > k.create_ts.add_seconds(self.expire_secs))
            .map(|k| k.id)
            .collect())
    }

    pub fn mark_revoked(&self, id: &Eid) -> Result<bool> {
        for mut local in self.local_keys()? {
            if local.id == *id && !local.revoked {
                local.revoked = true;
                self.db.put_json(&self.key_key(local.create_ts, id), &local)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn create_test_manager() -> (OpKeyManager, Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let master = KeyPair::generate();
        let manager = OpKeyManager::new(
            storage.key.clone(),
            Eid::with_address(&master.address()),
            master,
            86400,
            259200,
        );
        (manager, storage, dir)
    }

    #[test]
    fn test_rotation_schedule() {
        let (manager, _s, _dir) = create_test_manager();
        let t0 = Timestamp::new(1_000_000, 0);
        assert!(manager.needs_renewal(t0).unwrap());
        assert!(matches!(manager.current(t0), Err(OpKeyError::NoValidKey(_))));

        let first = manager.create(t0).unwrap();
        assert!(!manager.needs_renewal(t0.add_seconds(86399)).unwrap());
        assert!(manager.needs_renewal(t0.add_seconds(86400)).unwrap());
        let (id, key) = manager.current(t0.add_seconds(10)).unwrap();
        assert_eq!(id, first.id);
        assert_eq!(key.address(), first.key.address());

        let t1 = t0.add_seconds(86400);
        let second = manager.create(t1).unwrap();
        assert_ne!(first.key.address(), second.key.address());
        assert_eq!(manager.current(t1).unwrap().0, second.id);
        assert_eq!(manager.expired(t0.add_seconds(259201)).unwrap(), vec![first.id]);
    }

    #[test]
    fn test_last_index_is_not_reused() {
        let (manager, _s, _dir) = create_test_manager();
        manager.db.put_json(&manager.index_key(), &u32::MAX).unwrap();
        let t0 = Timestamp::new(1_000_000, 0);
        let err = manager.create(t0).err().unwrap();
        // a rejected last child ends the same way: no wrap to index 0
        assert!(matches!(
            err,
            OpKeyError::IndexExhausted(u32::MAX) | OpKeyError::Core(replica_core::Error::InvalidChild(u32::MAX))
        ));
        assert_eq!(manager.db.get_json::<u32>(&manager.index_key()).unwrap(), Some(u32::MAX));
        assert!(matches!(manager.current(t0), Err(OpKeyError::NoValidKey(_))));
    }

    #[test]
    fn test_revoked_key_is_skipped() {
        let (manager, _s, _dir) = create_test_manager();
        let t0 = Timestamp::new(1_000_000, 0);
        let first = manager.create(t0).unwrap();
        let second = manager.create(t0.add_seconds(5)).unwrap();
        assert!(manager.mark_revoked(&second.id).unwrap());
        assert!(!manager.mark_revoked(&second.id).unwrap());
        assert_eq!(manager.current(t0.add_seconds(6)).unwrap().0, first.id);
        assert!(first.payload.extra.is_some());
    }
}
