//! Oplog batch pipeline
//!
//! Every oplog, local or from a peer, goes through the same steps: verify
//! signatures, check the predecessor chain, gate on authority, pick the copy
//! to keep, co-sign if we are a master, process, store, and collect what
//! should be relayed.

use crate::authority::{Authority, AuthorityError};
use crate::block::BlockStore;
use crate::config::ProtocolParams;
use crate::count::CountStore;
use crate::object::ObjectStore;
use crate::oplog::Oplog;
use crate::oplog_store::{OplogError, OplogStore, Selection};
use crate::processor::{self, Outcome, ProcessContext, ProcessError, ProcessInfo};
use crate::storage::{Database, Storage};
use replica_core::crypto::KeyPair;
use replica_core::{Eid, Status, Stream, Timestamp};
use replica_net::PeerId;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Oplog error: {0}")]
    Oplog(#[from] OplogError),
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
    #[error("Authority error: {0}")]
    Authority(#[from] AuthorityError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
}

impl HandleError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            HandleError::Oplog(e) => e.kind(),
            HandleError::Process(e) => e.kind(),
            HandleError::Authority(e) => e.kind(),
            HandleError::Core(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HandleError>;

// =============================================================================
// ENTITY STORES
// =============================================================================

/// Every store of one entity
#[derive(Clone)]
pub struct EntityStores {
    pub entity_id: Eid,
    master: OplogStore,
    member: OplogStore,
    opkey: OplogStore,
    board: OplogStore,
    friend: OplogStore,
    pub objects: ObjectStore,
    pub blocks: BlockStore,
    pub counts: CountStore,
    pub meta: Database,
    pub keys: Database,
}

impl EntityStores {
    pub fn new(storage: &Storage, entity_id: Eid) -> Self {
        let oplogs = |stream| OplogStore::new(storage.oplog.clone(), storage.meta.clone(), stream, entity_id);
        Self {
            entity_id,
            master: oplogs(Stream::Master),
            member: oplogs(Stream::Member),
            opkey: oplogs(Stream::OpKey),
            board: oplogs(Stream::Board),
            friend: oplogs(Stream::Friend),
            objects: ObjectStore::new(storage.content.clone(), storage.meta.clone(), entity_id),
            blocks: BlockStore::new(storage.content.clone(), entity_id),
            counts: CountStore::new(storage.content.clone(), entity_id),
            meta: storage.meta.clone(),
            keys: storage.key.clone(),
        }
    }

    pub fn oplogs(&self, stream: Stream) -> &OplogStore {
        match stream {
            Stream::Master => &self.master,
            Stream::Member => &self.member,
            Stream::OpKey => &self.opkey,
            Stream::Board => &self.board,
            Stream::Friend => &self.friend,
        }
    }

    pub fn ctx(&self, stream: Stream) -> ProcessContext<'_> {
        ProcessContext {
            oplogs: self.oplogs(stream),
            objects: &self.objects,
            blocks: &self.blocks,
            counts: &self.counts,
        }
    }

    pub fn reload_authority(&self, authority: &Authority) -> std::result::Result<(), AuthorityError> {
        authority.reload(&self.master, &self.member, &self.opkey)
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Where a batch came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Local,
    Peer(PeerId),
}

/// Keys we co-sign with, when we are a master
pub struct CoSigner {
    pub id: Eid,
    pub master_key: KeyPair,
    pub opkey: Option<KeyPair>,
}

impl CoSigner {
    pub(crate) fn key_for(&self, stream: Stream) -> Option<&KeyPair> {
        if stream.is_app() {
            self.opkey.as_ref()
        } else {
            Some(&self.master_key)
        }
    }
}

#[derive(Debug, Default)]
pub struct HandleResult {
    /// Alive oplogs that are new or changed here, to relay
    pub alive: Vec<Oplog>,
    /// Pending oplogs that are new or gained signatures, to relay
    pub pending: Vec<Oplog>,
    pub info: ProcessInfo,
    /// Offences committed by the source
    pub strikes: u32,
    /// A master-stream oplog failed verification
    pub fatal: bool,
    /// Skipped for lack of the authority records to judge them
    pub deferred: usize,
}

pub struct Handler<'a> {
    pub stores: &'a EntityStores,
    pub authority: &'a Authority,
    pub params: &'a ProtocolParams,
    pub signer: Option<&'a CoSigner>,
}

impl<'a> Handler<'a> {
    pub fn handle_oplogs(
        &self,
        stream: Stream,
        mut oplogs: Vec<Oplog>,
        source: Source,
        now: Timestamp,
    ) -> Result<HandleResult> {
        let store = self.stores.oplogs(stream);
        let mut result = HandleResult::default();
        oplogs.sort_by_key(|l| l.order_key());
        oplogs.dedup_by_key(|l| l.id);

        let mut verified = Vec::with_capacity(oplogs.len());
        for log in oplogs {
            let ok = log.entity_id == self.stores.entity_id
                && log.stream == stream
                && log.kind().is_ok()
                && log.status() != Status::Invalid
                && log.verify().is_ok();
            if ok {
                verified.push(log);
                continue;
            }
            warn!(entity = %self.stores.entity_id, stream = stream.name(), oplog = %log.id, ?source, "Dropped unverifiable oplog");
            result.strikes += 1;
            if stream == Stream::Master {
                result.fatal = true;
                return Ok(result);
            }
        }

        let verified = self.truncate_broken_chain(store, verified)?;
        let mut newest = Timestamp::ZERO;
        for log in verified {
            if let Some(done) = self.handle_one(stream, store, log, source, now, &mut result)? {
                newest = newest.max(done.update_ts);
                if done.status() == Status::Alive {
                    if !stream.is_app() {
                        self.stores.reload_authority(self.authority)?;
                    }
                    result.alive.push(done);
                } else {
                    result.pending.push(done);
                }
            }
        }

        if let Source::Peer(peer) = source {
            if !newest.is_zero() {
                store.save_sync_time(newest)?;
            }
            debug!(
                entity = %self.stores.entity_id,
                stream = stream.name(),
                %peer,
                alive = result.alive.len(),
                pending = result.pending.len(),
                deferred = result.deferred,
                "Handled oplogs"
            );
        }
        Ok(result)
    }

    /// Drop everything from the first oplog whose predecessor is not alive
    fn truncate_broken_chain(&self, store: &OplogStore, oplogs: Vec<Oplog>) -> Result<Vec<Oplog>> {
        let mut alive_in_batch: HashSet<Eid> = HashSet::new();
        let mut out = Vec::with_capacity(oplogs.len());
        for log in oplogs {
            if !log.kind()?.is_unchained() {
                if let Some(prev) = log.prev_log_id {
                    let ok = alive_in_batch.contains(&prev)
                        || store
                            .get(&prev)?
                            .map_or(false, |p| p.status() == Status::Alive);
                    if !ok {
                        warn!(oplog = %log.id, %prev, "Predecessor not alive, truncating batch");
                        break;
                    }
                }
            }
            if log.status() == Status::Alive {
                alive_in_batch.insert(log.id);
            }
            out.push(log);
        }
        Ok(out)
    }

    /// Returns the stored oplog when it is new or changed
    fn handle_one(
        &self,
        stream: Stream,
        store: &OplogStore,
        mut log: Oplog,
        source: Source,
        now: Timestamp,
        result: &mut HandleResult,
    ) -> Result<Option<Oplog>> {
        let ctx = self.stores.ctx(stream);

        if let Err(e) = self.authority.check(&log) {
            if e.is_missing_record() {
                // comes back with a later reconciliation
                debug!(entity = %self.stores.entity_id, oplog = %log.id, error = %e, "Deferred oplog");
                result.deferred += 1;
                return Ok(None);
            }
            warn!(entity = %self.stores.entity_id, oplog = %log.id, error = %e, "Authority rejected oplog");
            if matches!(source, Source::Peer(_)) {
                result.strikes += 1;
            }
            if matches!(store.select_existing(&log)?, Selection::New) {
                log.failed = true;
                store.append(&log)?;
            }
            processor::handle_failed(&ctx, &log, &mut result.info)?;
            return Ok(None);
        }

        match store.select_existing(&log)? {
            Selection::New => {}
            Selection::Same(_) => return Ok(None),
            Selection::Replace(existing) => {
                if !(existing.status() == Status::Alive && log.status() == Status::Alive) && !existing.failed {
                    let mut merged = existing.clone();
                    merged.merge_signs(&log);
                    log = merged;
                }
            }
            Selection::KeepExisting(existing) => {
                if existing.status() == Status::Alive && log.status() == Status::Alive {
                    return Ok(None);
                }
                let mut merged = existing.clone();
                if !merged.merge_signs(&log) {
                    return Ok(None);
                }
                log = merged;
            }
        }
        log.failed = false;

        if log.status() != Status::Alive {
            self.co_sign(stream, &mut log, now)?;
        }

        if log.status() == Status::Alive {
            let outcome = processor::process_alive(&ctx, &log, &mut result.info)?;
            log.is_sync = outcome == Outcome::Synced;
            log.failed = outcome == Outcome::Failed;
        } else {
            processor::process_pending(&ctx, &log)?;
        }
        log.is_newer = true;
        store.append(&log)?;

        if log.failed {
            return Ok(None);
        }
        Ok(Some(log))
    }

    /// Add our master signature while the oplog is young, and flip it alive on quorum
    fn co_sign(&self, stream: Stream, log: &mut Oplog, now: Timestamp) -> Result<()> {
        if log.is_expired(now, self.params.expire_oplog_secs) {
            return Ok(());
        }
        if let Some(signer) = self.signer {
            if self.authority.is_master_at(&signer.id, log.update_ts) {
                if let Some(key) = signer.key_for(stream) {
                    log.master_sign(signer.id, key, now)?;
                }
            }
        }
        let valid = self.authority.valid_master_signs(log);
        if valid > 0 && valid >= self.authority.quorum(log.update_ts) {
            if let Some(first) = log.master_signs.first().map(|s| s.id) {
                log.set_alive(first);
            }
        }
        Ok(())
    }
}
