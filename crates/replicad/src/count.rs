//! Approximate distinct counters
//!
//! Linear counting over a 2^p bit vector. Items are placed by the top `p`
//! bits of their BLAKE3 hash, and the estimate is `m * ln(m / zeros)`.

use crate::storage::{key, Database, StorageError};
use replica_core::{BitVector, Eid, ObjectKind};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PRECISION: u8 = 12;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    #[serde(rename = "p")]
    precision: u8,
    #[serde(rename = "B")]
    bits: BitVector,
}

impl Default for Count {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION)
    }
}

impl Count {
    pub fn new(precision: u8) -> Self {
        Self {
            precision,
            bits: BitVector::new(1 << precision),
        }
    }

    fn m(&self) -> usize {
        1 << self.precision
    }

    fn bucket(&self, item: &[u8]) -> usize {
        let hash = blake3::hash(item);
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_be_bytes(head) >> (64 - u32::from(self.precision))) as usize
    }

    pub fn add(&mut self, item: &[u8]) {
        let b = self.bucket(item);
        self.bits.set(b);
    }

    /// Add, returning true if the item's bucket was empty
    pub fn add_with_is_new(&mut self, item: &[u8]) -> bool {
        let b = self.bucket(item);
        self.bits.set_with_is_new(b)
    }

    pub fn estimate(&self) -> u64 {
        let m = self.m() as f64;
        let set = self.bits.pop_count().min(self.m());
        let zeros = self.m() - set;
        if zeros == 0 {
            return self.m() as u64;
        }
        (m * (m / zeros as f64).ln()).round() as u64
    }

    pub fn union(&mut self, other: &Count) {
        self.bits.union(&other.bits);
    }

    pub fn intersect(&mut self, other: &Count) {
        self.bits.intersect(&other.bits);
    }
}

/// Counters keyed by `(kind, object, name)`
#[derive(Clone)]
pub struct CountStore {
    db: Database,
    entity_id: Eid,
}

impl CountStore {
    pub fn new(db: Database, entity_id: Eid) -> Self {
        Self { db, entity_id }
    }

    fn object_prefix(&self, kind: ObjectKind, object_id: &Eid) -> Vec<u8> {
        key(&[&kind.prefix(b"cn"), self.entity_id.as_bytes(), object_id.as_bytes()])
    }

    fn count_key(&self, kind: ObjectKind, object_id: &Eid, name: &str) -> Vec<u8> {
        key(&[&self.object_prefix(kind, object_id), name.as_bytes()])
    }

    pub fn get(&self, kind: ObjectKind, object_id: &Eid, name: &str) -> Result<Count, StorageError> {
        Ok(self
            .db
            .get_json(&self.count_key(kind, object_id, name))?
            .unwrap_or_default())
    }

    /// Count `item` under `name`. Returns true if the estimate may have grown.
    pub fn add(&self, kind: ObjectKind, object_id: &Eid, name: &str, item: &[u8]) -> Result<bool, StorageError> {
        let k = self.count_key(kind, object_id, name);
        let _guard = self.db.locks().lock(&k)?;
        let mut count: Count = self.db.get_json(&k)?.unwrap_or_default();
        let is_new = count.add_with_is_new(item);
        if is_new {
            self.db.put_json(&k, &count)?;
        }
        Ok(is_new)
    }

    /// Drop every counter of an object
    pub fn remove(&self, kind: ObjectKind, object_id: &Eid) -> Result<usize, StorageError> {
        let prefix = self.object_prefix(kind, object_id);
        let mut batch = sled::Batch::default();
        let mut n = 0;
        for item in self.db.iterate(&prefix, None, crate::storage::Order::Forward)? {
            let (k, _) = item?;
            batch.remove(k);
            n += 1;
        }
        self.db.apply(batch)?;
        Ok(n)
    }
}
