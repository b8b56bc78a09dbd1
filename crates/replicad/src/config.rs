//! Configuration for replicad

use clap::{Parser, ValueEnum};
use replica_core::Eid;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// What kind of entity a set of oplogs belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum EntityType {
    /// A single user's own data
    Personal,
    /// A board with one owning master
    Board,
    /// Jointly owned, co-signed by several masters
    Shared,
}

/// replicad - oplog replication daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "replicad")]
#[command(about = "Replicates signed per-entity oplogs between peers")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9300")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/replicad")]
    pub data_dir: PathBuf,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Entities to replicate (comma-separated base58 ids)
    #[arg(long = "entity", value_delimiter = ',')]
    pub entities: Vec<String>,

    /// Entity type for the replicated entities
    #[arg(long, value_enum, default_value = "board")]
    pub entity_type: EntityType,

    /// Create a new entity owned by this node on startup
    #[arg(long)]
    pub create_entity: bool,

    /// Master signatures required on a shared entity
    #[arg(long, default_value = "2")]
    pub max_masters: u32,

    /// Anti-entropy interval in seconds
    #[arg(long, default_value = "30")]
    pub sync_interval_secs: u64,

    /// Merkle regeneration interval in seconds
    #[arg(long, default_value = "900")]
    pub merkle_interval_secs: u64,

    /// Seconds before an operational key is renewed
    #[arg(long, default_value = "86400")]
    pub renew_opkey_secs: i64,

    /// Seconds an operational key stays valid
    #[arg(long, default_value = "259200")]
    pub expire_opkey_secs: i64,

    /// Seconds a pending oplog may still be co-signed
    #[arg(long, default_value = "300")]
    pub expire_oplog_secs: i64,

    /// Bad oplogs tolerated from a peer before it is dropped
    #[arg(long, default_value = "3")]
    pub strike_limit: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.entities.is_empty() && !self.create_entity {
            anyhow::bail!("Nothing to replicate: pass --entity or --create-entity");
        }
        for id in &self.entities {
            Eid::from_str(id).map_err(|e| anyhow::anyhow!("Invalid entity id {}: {}", id, e))?;
        }
        if self.max_masters == 0 {
            anyhow::bail!("max-masters must be at least 1");
        }
        if self.sync_interval_secs == 0 || self.merkle_interval_secs == 0 {
            anyhow::bail!("Intervals must be positive");
        }
        if self.expire_opkey_secs <= self.renew_opkey_secs {
            anyhow::bail!("Operational keys must outlive their renewal period");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("Log format must be json or pretty");
        }
        Ok(())
    }

    /// Parsed entity ids
    pub fn entity_ids(&self) -> anyhow::Result<Vec<Eid>> {
        self.entities
            .iter()
            .map(|id| Eid::from_str(id).map_err(|e| anyhow::anyhow!("{}: {}", id, e)))
            .collect()
    }

    /// Protocol parameters derived from the command line
    pub fn params(&self) -> ProtocolParams {
        ProtocolParams {
            max_masters: self.max_masters,
            renew_opkey_secs: self.renew_opkey_secs,
            expire_opkey_secs: self.expire_opkey_secs,
            expire_oplog_secs: self.expire_oplog_secs,
            strike_limit: self.strike_limit,
            ..ProtocolParams::default()
        }
    }
}

/// Tunables shared by every protocol manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Co-signatures required on a shared entity
    pub max_masters: u32,
    /// Entries per SyncOplogAck chunk
    pub max_sync_oplog_ack: usize,
    /// Objects per SyncCreateObjectAck
    pub max_sync_object_ack: usize,
    /// Blocks per block ack
    pub max_sync_block: usize,
    /// Lines per content block
    pub lines_per_block: usize,
    pub renew_opkey_secs: i64,
    pub expire_opkey_secs: i64,
    /// Keys are honoured slightly before their creation time
    pub opkey_grace_secs: i64,
    pub expire_oplog_secs: i64,
    /// Merkle windows before `sync_time - offset` are not re-validated
    pub offset_merkle_sync_secs: i64,
    /// Merkle drill-downs per peer and window before a full resync is requested
    pub max_sync_retries: u32,
    pub strike_limit: u32,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            max_masters: 2,
            max_sync_oplog_ack: 200,
            max_sync_object_ack: 50,
            max_sync_block: 50,
            lines_per_block: 20,
            renew_opkey_secs: 86400,
            expire_opkey_secs: 259200,
            opkey_grace_secs: 60,
            expire_oplog_secs: 300,
            offset_merkle_sync_secs: 3600,
            max_sync_retries: 3,
            strike_limit: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut full = vec!["replicad"];
        full.extend_from_slice(args);
        Config::parse_from(full)
    }

    #[test]
    fn test_defaults_validate() {
        let config = parse(&["--create-entity"]);
        config.validate().unwrap();
        assert_eq!(config.entity_type, EntityType::Board);
        assert_eq!(config.params(), ProtocolParams::default());
    }

    #[test]
    fn test_requires_entity() {
        assert!(parse(&[]).validate().is_err());
    }

    #[test]
    fn test_entity_list() {
        let a = Eid::new_random().to_string();
        let b = Eid::new_random().to_string();
        let config = parse(&["--entity", &format!("{},{}", a, b)]);
        config.validate().unwrap();
        assert_eq!(config.entity_ids().unwrap().len(), 2);

        let bad = parse(&["--entity", "not-base58!"]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_opkey_lifetime_checked() {
        let config = parse(&[
            "--create-entity",
            "--renew-opkey-secs",
            "100",
            "--expire-opkey-secs",
            "50",
        ]);
        assert!(config.validate().is_err());
    }
}
