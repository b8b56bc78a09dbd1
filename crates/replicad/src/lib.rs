//! replicad - oplog replication daemon
//!
//! This crate provides:
//! - Per-stream oplog storage with Merkle trees for anti-entropy
//! - Authority checks for masters, members and operational keys
//! - Object materialization with block-wise content backfill
//! - The peer sync protocol and a per-entity protocol manager

pub mod authority;
pub mod block;
pub mod config;
pub mod count;
pub mod fix;
pub mod handler;
pub mod lock_map;
pub mod manager;
pub mod merkle;
pub mod object;
pub mod opkey;
pub mod oplog;
pub mod oplog_store;
pub mod processor;
pub mod server;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod scenarios;

pub use config::{Config, EntityType, ProtocolParams};
pub use handler::EntityStores;
pub use manager::{ManagerError, Outbound, ProtocolManager};
pub use oplog::Oplog;
pub use server::Server;
pub use storage::Storage;
