//! Oplog and object statuses, and the coarser classes used in dispatch
//!
//! Both enums serialize as a single byte. [`StatusClass`] derives `Ord` in
//! declaration order, which is the precedence used on conflict.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fine-grained status shared by oplogs and objects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Status {
    #[default]
    Invalid = 0,
    Init = 1,
    InternalSync = 2,
    InternalPending = 3,
    Pending = 4,
    Sync = 5,
    Alive = 6,
    Failed = 7,
    InternalRevoke = 8,
    PendingRevoke = 9,
    Revoked = 10,
    InternalTransfer = 11,
    PendingTransfer = 12,
    Transferred = 13,
    InternalMigrate = 14,
    PendingMigrate = 15,
    Migrated = 16,
    InternalDeleted = 17,
    PendingDeleted = 18,
    Deleted = 19,
    InternalTerminal = 20,
    PendingTerminal = 21,
    Terminal = 22,
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use Status::*;
        const ALL: [Status; 23] = [
            Invalid,
            Init,
            InternalSync,
            InternalPending,
            Pending,
            Sync,
            Alive,
            Failed,
            InternalRevoke,
            PendingRevoke,
            Revoked,
            InternalTransfer,
            PendingTransfer,
            Transferred,
            InternalMigrate,
            PendingMigrate,
            Migrated,
            InternalDeleted,
            PendingDeleted,
            Deleted,
            InternalTerminal,
            PendingTerminal,
            Terminal,
        ];
        ALL.get(value as usize)
            .copied()
            .ok_or(Error::InvalidStatus(value))
    }
}

impl Status {
    pub fn class(self) -> StatusClass {
        use Status::*;
        match self {
            Invalid => StatusClass::Invalid,
            Init => StatusClass::Init,
            InternalSync | InternalPending => StatusClass::InternalPendingAlive,
            Pending | Sync => StatusClass::PendingAlive,
            Alive => StatusClass::Alive,
            Failed => StatusClass::Failed,
            InternalRevoke | InternalTransfer | InternalDeleted | InternalTerminal => {
                StatusClass::InternalDelete
            }
            PendingRevoke | PendingTransfer | PendingDeleted | PendingTerminal => {
                StatusClass::PendingDelete
            }
            Revoked | Transferred | Deleted => StatusClass::Deleted,
            InternalMigrate => StatusClass::InternalMigrate,
            PendingMigrate => StatusClass::PendingMigrate,
            Migrated => StatusClass::Migrated,
            Terminal => StatusClass::Terminal,
        }
    }

    /// Status an object takes when a delete lands on it
    pub fn to_delete_status(self) -> Status {
        match self {
            Status::InternalPending | Status::InternalSync => Status::InternalDeleted,
            Status::Pending | Status::Sync => Status::PendingDeleted,
            _ => Status::Deleted,
        }
    }

    pub fn is_alive(self) -> bool {
        self == Status::Alive
    }

    /// True for every delete-like class, including migrate and terminal
    pub fn is_deleted_class(self) -> bool {
        self.class() >= StatusClass::InternalDelete
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        Status::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// Coarse status grouping. Later variants win on conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusClass {
    Invalid,
    Failed,
    Init,
    InternalPendingAlive,
    PendingAlive,
    Alive,
    InternalDelete,
    InternalMigrate,
    PendingDelete,
    PendingMigrate,
    Deleted,
    Migrated,
    Terminal,
}

impl StatusClass {
    /// Rank used when two oplogs compete for one object.
    ///
    /// Migrate classes rank with their delete counterparts.
    pub fn conflict_rank(self) -> u8 {
        match self {
            StatusClass::Invalid => 0,
            StatusClass::Failed => 1,
            StatusClass::Init => 2,
            StatusClass::InternalPendingAlive => 3,
            StatusClass::PendingAlive => 4,
            StatusClass::Alive => 5,
            StatusClass::InternalDelete | StatusClass::InternalMigrate => 6,
            StatusClass::PendingDelete | StatusClass::PendingMigrate => 7,
            StatusClass::Deleted | StatusClass::Migrated => 8,
            StatusClass::Terminal => 9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_roundtrip() {
        for raw in 0..=22u8 {
            let status = Status::try_from(raw).unwrap();
            assert_eq!(status as u8, raw);
        }
        assert!(matches!(Status::try_from(23), Err(Error::InvalidStatus(23))));
    }

    #[test]
    fn test_class_table() {
        assert_eq!(Status::InternalSync.class(), StatusClass::InternalPendingAlive);
        assert_eq!(Status::Sync.class(), StatusClass::PendingAlive);
        assert_eq!(Status::Pending.class(), StatusClass::PendingAlive);
        assert_eq!(Status::PendingTerminal.class(), StatusClass::PendingDelete);
        assert_eq!(Status::Revoked.class(), StatusClass::Deleted);
        assert_eq!(Status::Terminal.class(), StatusClass::Terminal);
    }

    #[test]
    fn test_conflict_precedence() {
        let order = [
            Status::Invalid,
            Status::Failed,
            Status::InternalPending,
            Status::Pending,
            Status::Alive,
            Status::InternalDeleted,
            Status::PendingDeleted,
            Status::Deleted,
            Status::Terminal,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].class().conflict_rank() < pair[1].class().conflict_rank());
        }
        assert_eq!(
            StatusClass::PendingMigrate.conflict_rank(),
            StatusClass::PendingDelete.conflict_rank()
        );
    }

    #[test]
    fn test_delete_status() {
        assert_eq!(Status::InternalPending.to_delete_status(), Status::InternalDeleted);
        assert_eq!(Status::Sync.to_delete_status(), Status::PendingDeleted);
        assert_eq!(Status::Alive.to_delete_status(), Status::Deleted);
        assert!(Status::PendingDeleted.is_deleted_class());
        assert!(!Status::Alive.is_deleted_class());
    }

    #[test]
    fn test_json_is_number() {
        assert_eq!(serde_json::to_string(&Status::Alive).unwrap(), "6");
        let back: Status = serde_json::from_str("19").unwrap();
        assert_eq!(back, Status::Deleted);
        assert!(serde_json::from_str::<Status>("99").is_err());
    }
}
