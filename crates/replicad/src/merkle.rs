//! Time-bucketed Merkle tree over the alive oplogs of one stream
//!
//! Leaves are keyed by `(update_ts, id)`. Interior nodes cover calendar
//! windows: hour, day, month and year. A node is `(level, start, count,
//! addr)` where `addr` is the address of the Keccak hash of its children's
//! addresses, so equal addresses mean equal leaf sets.
//!
//! Writers only drop a dirty marker for the leaf's hour next to the leaf.
//! [`MerkleTree::regenerate`] folds dirty hours up to the year nodes.

use crate::storage::{key, Database, Order, Result, StorageError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use replica_core::crypto::{hash_to_address, keccak256};
use replica_core::timestamp::SIZE_TIMESTAMP;
use replica_core::{Address, Eid, Stream, Timestamp, SIZE_ADDRESS, SIZE_EID};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Size of an encoded node
pub const SIZE_MERKLE_NODE: usize = 1 + SIZE_TIMESTAMP + 4 + SIZE_ADDRESS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MerkleLevel {
    Leaf = 0,
    Hour = 1,
    Day = 2,
    Month = 3,
    Year = 4,
    /// The open hour, computed on demand and never stored
    Now = 5,
}

impl MerkleLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MerkleLevel::Leaf),
            1 => Some(MerkleLevel::Hour),
            2 => Some(MerkleLevel::Day),
            3 => Some(MerkleLevel::Month),
            4 => Some(MerkleLevel::Year),
            5 => Some(MerkleLevel::Now),
            _ => None,
        }
    }

    /// Level of the nodes directly below
    pub fn child(self) -> Option<MerkleLevel> {
        match self {
            MerkleLevel::Leaf => None,
            MerkleLevel::Hour | MerkleLevel::Now => Some(MerkleLevel::Leaf),
            MerkleLevel::Day => Some(MerkleLevel::Hour),
            MerkleLevel::Month => Some(MerkleLevel::Day),
            MerkleLevel::Year => Some(MerkleLevel::Month),
        }
    }

    /// `[start, end)` of the window at this level holding `ts`
    pub fn window(self, ts: Timestamp) -> Result<(Timestamp, Timestamp)> {
        let w = match self {
            MerkleLevel::Leaf => (ts, ts),
            MerkleLevel::Hour | MerkleLevel::Now => ts.hour_window(),
            MerkleLevel::Day => ts.day_window(),
            MerkleLevel::Month => ts.month_window().map_err(corrupt)?,
            MerkleLevel::Year => ts.year_window().map_err(corrupt)?,
        };
        Ok(w)
    }
}

fn corrupt(e: replica_core::Error) -> StorageError {
    StorageError::Corrupt(e.to_string())
}

/// A tree node, or a leaf when `level` is [`MerkleLevel::Leaf`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MerkleNode {
    pub level: MerkleLevel,
    pub start_ts: Timestamp,
    pub count: u32,
    pub addr: Address,
}

impl MerkleNode {
    pub fn to_bytes(&self) -> [u8; SIZE_MERKLE_NODE] {
        let mut out = [0u8; SIZE_MERKLE_NODE];
        out[0] = self.level as u8;
        out[1..1 + SIZE_TIMESTAMP].copy_from_slice(&self.start_ts.to_bytes());
        out[1 + SIZE_TIMESTAMP..5 + SIZE_TIMESTAMP].copy_from_slice(&self.count.to_be_bytes());
        out[5 + SIZE_TIMESTAMP..].copy_from_slice(&self.addr.0);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIZE_MERKLE_NODE {
            return Err(StorageError::Corrupt(format!("merkle node of {} bytes", bytes.len())));
        }
        let level = MerkleLevel::from_u8(bytes[0])
            .ok_or_else(|| StorageError::Corrupt(format!("merkle level {}", bytes[0])))?;
        let start_ts = Timestamp::from_bytes(&bytes[1..1 + SIZE_TIMESTAMP]).map_err(corrupt)?;
        let mut count = [0u8; 4];
        count.copy_from_slice(&bytes[1 + SIZE_TIMESTAMP..5 + SIZE_TIMESTAMP]);
        let addr = Address::from_slice(&bytes[5 + SIZE_TIMESTAMP..]).map_err(corrupt)?;
        Ok(Self {
            level,
            start_ts,
            count: u32::from_be_bytes(count),
            addr,
        })
    }

    /// End of the covered window
    pub fn end_ts(&self) -> Result<Timestamp> {
        Ok(self.level.window(self.start_ts)?.1)
    }

    fn same_content(&self, other: &MerkleNode) -> bool {
        self.count == other.count && self.addr == other.addr
    }
}

impl Serialize for MerkleNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for MerkleNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
        MerkleNode::from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}

/// Fold children into `(count, addr)`; `None` when there are none
pub fn combine(children: &[MerkleNode]) -> Option<(u32, Address)> {
    let count: u32 = children.iter().map(|c| c.count).sum();
    if count == 0 {
        return None;
    }
    let mut buf = Vec::with_capacity(children.len() * SIZE_ADDRESS);
    for child in children {
        buf.extend_from_slice(&child.addr.0);
    }
    Some((count, hash_to_address(&keccak256(&buf))))
}

/// One window where two tree lists disagree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowDiff {
    pub level: MerkleLevel,
    pub start_ts: Timestamp,
    pub mine: Option<MerkleNode>,
    pub theirs: Option<MerkleNode>,
}

/// Windows whose content differs between two node lists
pub fn diff_nodes(mine: &[MerkleNode], theirs: &[MerkleNode]) -> Vec<WindowDiff> {
    let mut windows: BTreeMap<(MerkleLevel, Timestamp), (Option<MerkleNode>, Option<MerkleNode>)> =
        BTreeMap::new();
    for n in mine {
        windows.entry((n.level, n.start_ts)).or_default().0 = Some(*n);
    }
    for n in theirs {
        windows.entry((n.level, n.start_ts)).or_default().1 = Some(*n);
    }
    windows
        .into_iter()
        .filter(|(_, (a, b))| match (a, b) {
            (Some(a), Some(b)) => !a.same_content(b),
            _ => true,
        })
        .map(|((level, start_ts), (mine, theirs))| WindowDiff {
            level,
            start_ts,
            mine,
            theirs,
        })
        .collect()
}

/// Root address of a tree list, zero for an empty list
pub fn root_of(list: &[MerkleNode]) -> Address {
    combine(list).map(|(_, addr)| addr).unwrap_or_default()
}

/// The Merkle tree of one stream of one entity
#[derive(Clone)]
pub struct MerkleTree {
    db: Database,
    stream: Stream,
    entity_id: Eid,
}

impl MerkleTree {
    pub fn new(db: Database, stream: Stream, entity_id: Eid) -> Self {
        Self {
            db,
            stream,
            entity_id,
        }
    }

    fn base(&self, suffix: &[u8; 2]) -> Vec<u8> {
        key(&[&self.stream.prefix(suffix), self.entity_id.as_bytes()])
    }

    fn level_prefix(&self, level: MerkleLevel) -> Vec<u8> {
        let mut k = self.base(b"mk");
        k.push(level as u8);
        k
    }

    pub fn leaf_key(&self, update_ts: Timestamp, id: &Eid) -> Vec<u8> {
        key(&[
            &self.level_prefix(MerkleLevel::Leaf),
            &update_ts.to_bytes(),
            id.as_bytes(),
        ])
    }

    fn node_key(&self, level: MerkleLevel, start: Timestamp) -> Vec<u8> {
        key(&[&self.level_prefix(level), &start.to_bytes()])
    }

    /// Dirty marker for the hour holding `ts`
    pub fn dirty_key(&self, ts: Timestamp) -> Vec<u8> {
        key(&[&self.base(b"mu"), &ts.hour_window().0.to_bytes()])
    }

    /// Key and value of the leaf for an oplog
    pub fn leaf_entry(&self, update_ts: Timestamp, id: &Eid, addr: Address) -> (Vec<u8>, Vec<u8>) {
        let node = MerkleNode {
            level: MerkleLevel::Leaf,
            start_ts: update_ts,
            count: 1,
            addr,
        };
        (self.leaf_key(update_ts, id), node.to_bytes().to_vec())
    }

    /// Nodes of `level` with start in `[start, end)`
    fn nodes_in(&self, level: MerkleLevel, start: Timestamp, end: Timestamp) -> Result<Vec<MerkleNode>> {
        let prefix = self.level_prefix(level);
        let from = key(&[&prefix, &start.to_bytes()]);
        let mut out = Vec::new();
        for item in self.db.iterate(&prefix, Some(&from), Order::Forward)? {
            let (_, v) = item?;
            let node = MerkleNode::from_bytes(&v)?;
            if node.start_ts >= end {
                break;
            }
            out.push(node);
        }
        Ok(out)
    }

    /// Leaf ids with update ts in `[start, end)`
    pub fn leaf_ids(&self, start: Timestamp, end: Timestamp) -> Result<Vec<(Timestamp, Eid)>> {
        let prefix = self.level_prefix(MerkleLevel::Leaf);
        let from = key(&[&prefix, &start.to_bytes()]);
        let mut out = Vec::new();
        for item in self.db.iterate(&prefix, Some(&from), Order::Forward)? {
            let (k, _) = item?;
            let rest = &k[prefix.len()..];
            if rest.len() != SIZE_TIMESTAMP + SIZE_EID {
                return Err(StorageError::Corrupt(hex::encode(&k)));
            }
            let ts = Timestamp::from_bytes(&rest[..SIZE_TIMESTAMP]).map_err(corrupt)?;
            if ts >= end {
                break;
            }
            let id = Eid::from_slice(&rest[SIZE_TIMESTAMP..]).map_err(corrupt)?;
            out.push((ts, id));
        }
        Ok(out)
    }

    pub fn node(&self, level: MerkleLevel, start: Timestamp) -> Result<Option<MerkleNode>> {
        match self.db.get(&self.node_key(level, start))? {
            Some(v) => Ok(Some(MerkleNode::from_bytes(&v)?)),
            None => Ok(None),
        }
    }

    /// Children of the window `(level, start)`
    pub fn children(&self, level: MerkleLevel, start: Timestamp) -> Result<Vec<MerkleNode>> {
        let Some(child) = level.child() else {
            return Ok(Vec::new());
        };
        let (start, end) = level.window(start)?;
        self.nodes_in(child, start, end)
    }

    /// Recompute the window `(level, start)` from its children
    fn rebuild(&self, level: MerkleLevel, start: Timestamp) -> Result<()> {
        let children = self.children(level, start)?;
        let k = self.node_key(level, start);
        match combine(&children) {
            Some((count, addr)) => {
                let node = MerkleNode {
                    level,
                    start_ts: start,
                    count,
                    addr,
                };
                self.db.put(&k, &node.to_bytes())
            }
            None => self.db.delete(&k),
        }
    }

    /// Recompute the hour holding `ts` and every ancestor
    pub fn update(&self, ts: Timestamp) -> Result<()> {
        for level in [
            MerkleLevel::Hour,
            MerkleLevel::Day,
            MerkleLevel::Month,
            MerkleLevel::Year,
        ] {
            let (start, _) = level.window(ts)?;
            self.rebuild(level, start)?;
        }
        Ok(())
    }

    /// Fold every dirty hour into the tree. Returns the number of hours processed.
    pub fn regenerate(&self) -> Result<usize> {
        let prefix = self.base(b"mu");
        let mut hours = Vec::new();
        for item in self.db.iterate(&prefix, None, Order::Forward)? {
            let (k, _) = item?;
            hours.push(k.to_vec());
        }
        for k in &hours {
            let ts = Timestamp::from_bytes(&k[prefix.len()..]).map_err(corrupt)?;
            self.update(ts)?;
            self.db.delete(k)?;
        }
        Ok(hours.len())
    }

    /// Mark the hour holding `ts` for regeneration
    pub fn mark_dirty(&self, ts: Timestamp) -> Result<()> {
        self.db.put(&self.dirty_key(ts), &[])
    }

    /// Tree list at `ts`: closed years, then months of this year, days of
    /// this month, hours of today, and the open hour up to `ts`.
    pub fn tree_list(&self, ts: Timestamp) -> Result<Vec<MerkleNode>> {
        self.regenerate()?;
        let (year, _) = MerkleLevel::Year.window(ts)?;
        let (month, _) = MerkleLevel::Month.window(ts)?;
        let (day, _) = MerkleLevel::Day.window(ts)?;
        let (hour, _) = MerkleLevel::Hour.window(ts)?;

        let mut list = self.nodes_in(MerkleLevel::Year, Timestamp::ZERO, year)?;
        list.extend(self.nodes_in(MerkleLevel::Month, year, month)?);
        list.extend(self.nodes_in(MerkleLevel::Day, month, day)?);
        list.extend(self.nodes_in(MerkleLevel::Hour, day, hour)?);
        let open = self.nodes_in(MerkleLevel::Leaf, hour, ts)?;
        if let Some((count, addr)) = combine(&open) {
            list.push(MerkleNode {
                level: MerkleLevel::Now,
                start_ts: hour,
                count,
                addr,
            });
        }
        Ok(list)
    }

    pub fn root(&self, ts: Timestamp) -> Result<Address> {
        Ok(root_of(&self.tree_list(ts)?))
    }
}
