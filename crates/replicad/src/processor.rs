//! Folding oplogs into objects
//!
//! Two passes per batch. The pending pass only records what is in flight:
//! a pending create materializes a pending object, a pending update or
//! delete becomes the object's [`SyncInfo`]. The alive pass commits.
//!
//! Each op kind has an [`OpHooks`] entry. The defaults cover plain objects;
//! comments and replies count themselves on their parent, articles and
//! messages mark the creator as having seen them, deletes cascade.

use crate::block::{Block, BlockError, BlockInfo, BlockStore};
use crate::count::CountStore;
use crate::object::{Object, ObjectStore, SyncInfo};
use crate::oplog::Oplog;
use crate::oplog_store::{OplogError, OplogStore};
use crate::storage::{Order, StorageError};
use replica_core::op::BlockMeta;
use replica_core::{Eid, ObjectKind, OpClass, OpKind, OpPayload, Status};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Oplog error: {0}")]
    Oplog(#[from] OplogError),
    #[error("Block error: {0}")]
    Block(#[from] BlockError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
}

impl ProcessError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            ProcessError::Storage(e) => e.kind(),
            ProcessError::Oplog(e) => e.kind(),
            ProcessError::Block(e) => e.kind(),
            ProcessError::Core(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Stores the processor reads and writes
pub struct ProcessContext<'a> {
    pub oplogs: &'a OplogStore,
    pub objects: &'a ObjectStore,
    pub blocks: &'a BlockStore,
    pub counts: &'a CountStore,
}

/// What processing did to one oplog
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Fully reflected in the object layer
    Synced,
    /// Waiting on the object, its blocks, or quorum
    Waiting,
    /// Lost a conflict or broke its chain
    Failed,
}

/// Follow-up work collected over one batch, bucketed by object kind
#[derive(Debug, Default)]
pub struct ProcessInfo {
    pub create_objects: HashMap<ObjectKind, Vec<Eid>>,
    pub create_blocks: HashMap<ObjectKind, Vec<Eid>>,
    pub update_objects: HashMap<ObjectKind, Vec<Eid>>,
    pub update_blocks: HashMap<ObjectKind, Vec<Eid>>,
    pub deleted: HashMap<ObjectKind, Vec<Eid>>,
    /// Stored oplogs demoted to failed along the way
    pub failed: Vec<Eid>,
}

fn push_unique(map: &mut HashMap<ObjectKind, Vec<Eid>>, kind: ObjectKind, id: Eid) {
    let ids = map.entry(kind).or_default();
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn tracked(map: &HashMap<ObjectKind, Vec<Eid>>, kind: ObjectKind, id: &Eid) -> bool {
    map.get(&kind).map_or(false, |ids| ids.contains(id))
}

impl ProcessInfo {
    pub fn is_empty(&self) -> bool {
        self.create_objects.is_empty()
            && self.create_blocks.is_empty()
            && self.update_objects.is_empty()
            && self.update_blocks.is_empty()
            && self.deleted.is_empty()
            && self.failed.is_empty()
    }

    pub fn merge(&mut self, other: ProcessInfo) {
        for (dst, src) in [
            (&mut self.create_objects, other.create_objects),
            (&mut self.create_blocks, other.create_blocks),
            (&mut self.update_objects, other.update_objects),
            (&mut self.update_blocks, other.update_blocks),
            (&mut self.deleted, other.deleted),
        ] {
            for (kind, ids) in src {
                for id in ids {
                    push_unique(dst, kind, id);
                }
            }
        }
        self.failed.extend(other.failed);
    }
}

// =============================================================================
// OP HOOKS
// =============================================================================

/// Per op kind behaviour of the processor
#[derive(Clone, Copy)]
pub struct OpHooks {
    /// The op's object is already queued for sync in this batch
    pub is_tracked: fn(&ProcessInfo, &Oplog) -> bool,
    /// Object built from a create op
    pub to_object: fn(&Oplog, ObjectKind, &OpPayload, Status) -> Object,
    /// Side effects once the object state is committed
    pub post_commit: fn(&ProcessContext<'_>, &Oplog, &OpPayload, &Object) -> Result<()>,
    /// Queue whatever the object still needs from peers
    pub update_info: fn(&mut ProcessInfo, &Object),
}

const DEFAULT_HOOKS: OpHooks = OpHooks {
    is_tracked: is_tracked_default,
    to_object: to_object_default,
    post_commit: post_commit_none,
    update_info: update_info_default,
};

pub fn hooks(kind: OpKind) -> OpHooks {
    match kind {
        OpKind::CreateArticle | OpKind::CreateMessage => OpHooks {
            post_commit: mark_creator_seen,
            ..DEFAULT_HOOKS
        },
        OpKind::CreateComment | OpKind::CreateReply => OpHooks {
            post_commit: count_on_parent,
            ..DEFAULT_HOOKS
        },
        k if k.class() == OpClass::Delete => OpHooks {
            post_commit: cascade_delete,
            ..DEFAULT_HOOKS
        },
        _ => DEFAULT_HOOKS,
    }
}

fn is_tracked_default(info: &ProcessInfo, log: &Oplog) -> bool {
    let Ok(kind) = log.kind() else {
        return false;
    };
    let object_kind = kind.object_kind();
    tracked(&info.create_objects, object_kind, &log.object_id)
        || tracked(&info.create_blocks, object_kind, &log.object_id)
}

fn to_object_default(log: &Oplog, object_kind: ObjectKind, payload: &OpPayload, status: Status) -> Object {
    let mut obj = Object::new(
        log.object_id,
        object_kind,
        log.doer_id,
        log.id,
        log.update_ts,
        status,
        payload.attrs(),
        payload.block().map(BlockInfo::from_meta),
    );
    if let OpPayload::CreateObject(data) = payload {
        obj.parent = data.parent;
    }
    obj
}

fn post_commit_none(_: &ProcessContext<'_>, _: &Oplog, _: &OpPayload, _: &Object) -> Result<()> {
    Ok(())
}

fn mark_creator_seen(ctx: &ProcessContext<'_>, log: &Oplog, _: &OpPayload, obj: &Object) -> Result<()> {
    ctx.objects.set_last_seen(&obj.id, &log.doer_id, log.update_ts)?;
    Ok(())
}

fn count_on_parent(ctx: &ProcessContext<'_>, _: &Oplog, _: &OpPayload, obj: &Object) -> Result<()> {
    let Some(parent) = obj.parent else {
        return Ok(());
    };
    let (parent_kind, name) = match obj.kind {
        ObjectKind::Reply => (ObjectKind::Comment, "reply"),
        _ => (ObjectKind::Article, "comment"),
    };
    ctx.counts.add(parent_kind, &parent, name, obj.id.as_bytes())?;
    Ok(())
}

/// Blocks, counters, last-seen marks and attached media go with the object
fn cascade_delete(ctx: &ProcessContext<'_>, log: &Oplog, payload: &OpPayload, obj: &Object) -> Result<()> {
    if let Some(block) = &obj.block {
        ctx.blocks.remove(obj.kind, &obj.id, &block.id)?;
    }
    ctx.counts.remove(obj.kind, &obj.id)?;
    ctx.objects.wipe_last_seen(&obj.id)?;

    let mut media = obj.media_ids();
    if let OpPayload::DeleteObject(data) = payload {
        for id in &data.media_ids {
            if !media.contains(id) {
                media.push(*id);
            }
        }
    }
    for id in media {
        delete_media(ctx, log, &id)?;
    }
    Ok(())
}

fn delete_media(ctx: &ProcessContext<'_>, log: &Oplog, media_id: &Eid) -> Result<()> {
    let Some(mut media) = ctx.objects.get(ObjectKind::Media, media_id)? else {
        return Ok(());
    };
    if media.status.is_deleted_class() {
        return Ok(());
    }
    if let Some(block) = &media.block {
        ctx.blocks.remove(ObjectKind::Media, media_id, &block.id)?;
    }
    media.status = Status::Deleted;
    media.update_ts = media.update_ts.max(log.update_ts);
    media.update_log_id = Some(log.id);
    media.sync_info = None;
    ctx.objects.save(&media)?;
    Ok(())
}

fn update_info_default(info: &mut ProcessInfo, obj: &Object) {
    match obj.status {
        Status::InternalSync => push_unique(&mut info.create_objects, obj.kind, obj.id),
        Status::Sync => push_unique(&mut info.create_blocks, obj.kind, obj.id),
        _ => {}
    }
    if let Some(si) = &obj.sync_info {
        if si.block.is_some() {
            match si.status {
                Status::InternalSync => push_unique(&mut info.update_objects, obj.kind, obj.id),
                Status::Sync => push_unique(&mut info.update_blocks, obj.kind, obj.id),
                _ => {}
            }
        }
    }
}

// =============================================================================
// ALIVE PASS
// =============================================================================

/// Commit an alive oplog to the object layer
pub fn process_alive(ctx: &ProcessContext<'_>, log: &Oplog, info: &mut ProcessInfo) -> Result<Outcome> {
    let kind = log.kind()?;
    let payload = log.payload()?;
    let outcome = match kind.class() {
        OpClass::Create => create_alive(ctx, log, kind, &payload, info)?,
        OpClass::Update => update_alive(ctx, log, kind, &payload, info)?,
        OpClass::Delete => delete_alive(ctx, log, kind, &payload, info)?,
        OpClass::Other => Outcome::Synced,
    };
    debug!(oplog = %log.id, object = %log.object_id, op = ?kind, ?outcome, "Processed alive oplog");
    Ok(outcome)
}

/// Persist what processing decided for a stored oplog
pub fn record(ctx: &ProcessContext<'_>, log_id: &Eid, outcome: Outcome, info: &mut ProcessInfo) -> Result<()> {
    match outcome {
        Outcome::Synced => ctx.oplogs.set_is_sync(log_id, true)?,
        Outcome::Waiting => {}
        Outcome::Failed => {
            ctx.oplogs.update_status(log_id, Status::Failed)?;
            info.failed.push(*log_id);
        }
    }
    Ok(())
}

fn demote(ctx: &ProcessContext<'_>, log_id: &Eid, info: &mut ProcessInfo) -> Result<()> {
    if ctx.oplogs.contains(log_id)? {
        ctx.oplogs.update_status(log_id, Status::Failed)?;
        info.failed.push(*log_id);
    }
    Ok(())
}

fn wants_blocks(object_kind: ObjectKind, payload: &OpPayload) -> bool {
    object_kind.has_blocks() && payload.block().map_or(false, |b| b.n_block > 0)
}

fn create_alive(
    ctx: &ProcessContext<'_>,
    log: &Oplog,
    kind: OpKind,
    payload: &OpPayload,
    info: &mut ProcessInfo,
) -> Result<Outcome> {
    let hooks = hooks(kind);
    let object_kind = kind.object_kind();
    if (hooks.is_tracked)(info, log) {
        return Ok(Outcome::Waiting);
    }

    let (sync_info, held) = match ctx.objects.get(object_kind, &log.object_id)? {
        None => (None, None),
        Some(obj) if obj.status.is_deleted_class() => return Ok(Outcome::Synced),
        Some(obj) if obj.log_id == log.id => match obj.status {
            Status::Alive => return Ok(Outcome::Synced),
            Status::InternalSync | Status::Sync => {
                (hooks.update_info)(info, &obj);
                return Ok(Outcome::Waiting);
            }
            // blocks stored while the create was pending
            _ => (obj.sync_info, obj.block),
        },
        Some(obj) if obj.status == Status::Failed => (None, None),
        Some(obj) => {
            // two creates for one object id: the earlier one stands
            if (log.update_ts, log.id) < (obj.create_ts, obj.log_id) {
                demote(ctx, &obj.log_id, info)?;
                (None, None)
            } else {
                return Ok(Outcome::Failed);
            }
        }
    };

    let mut obj = (hooks.to_object)(log, object_kind, payload, Status::Alive);
    if let Some(held) = held {
        if obj.block.as_ref().map_or(false, |b| b.same_layout(&held.meta())) {
            obj.block = Some(held);
        }
    }
    let status = if wants_blocks(object_kind, payload) && !obj.blocks_complete() {
        Status::InternalSync
    } else {
        Status::Alive
    };
    obj.status = status;
    obj.sync_info = sync_info;
    ctx.objects.save(&obj)?;
    (hooks.update_info)(info, &obj);

    if status != Status::Alive {
        return Ok(Outcome::Waiting);
    }
    (hooks.post_commit)(ctx, log, payload, &obj)?;
    replay_dependents(ctx, &obj, info)?;
    Ok(Outcome::Synced)
}

/// Re-run stored alive updates and deletes that arrived before their create
fn replay_dependents(ctx: &ProcessContext<'_>, obj: &Object, info: &mut ProcessInfo) -> Result<()> {
    for dep in ctx.oplogs.by_object(&obj.id, Order::Forward)? {
        if dep.id == obj.log_id || dep.is_sync || dep.status() != Status::Alive {
            continue;
        }
        if dep.kind()?.class() == OpClass::Create {
            continue;
        }
        let outcome = process_alive(ctx, &dep, info)?;
        record(ctx, &dep.id, outcome, info)?;
    }
    Ok(())
}

fn update_alive(
    ctx: &ProcessContext<'_>,
    log: &Oplog,
    kind: OpKind,
    payload: &OpPayload,
    info: &mut ProcessInfo,
) -> Result<Outcome> {
    let hooks = hooks(kind);
    let object_kind = kind.object_kind();
    let Some(mut obj) = ctx.objects.get(object_kind, &log.object_id)? else {
        return Ok(Outcome::Waiting);
    };
    if obj.status.is_deleted_class() {
        return Ok(Outcome::Synced);
    }
    if obj.status == Status::Failed || log.prev_log_id != Some(obj.log_id) {
        return Ok(Outcome::Failed);
    }
    if obj.update_log_id == Some(log.id) {
        return Ok(Outcome::Synced);
    }
    if log.update_ts < obj.update_ts {
        return Ok(Outcome::Synced);
    }
    if log.update_ts == obj.update_ts {
        if let Some(current) = obj.update_log_id {
            if log.id > current {
                return Ok(Outcome::Failed);
            }
            demote(ctx, &current, info)?;
        }
    }

    if wants_blocks(object_kind, payload) {
        let Some(meta) = payload.block() else {
            return Ok(Outcome::Waiting);
        };
        let block = held_update_block(&obj, &log.id, meta);
        if block.is_all_good {
            if let Some(old) = obj.block.replace(block) {
                if old.id != meta.id {
                    ctx.blocks.remove(object_kind, &obj.id, &old.id)?;
                }
            }
            obj.attrs = payload.attrs();
            obj.update_ts = log.update_ts;
            obj.update_log_id = Some(log.id);
            if obj
                .sync_info
                .as_ref()
                .map_or(false, |s| s.log_id == log.id || (!s.is_delete && s.update_ts <= log.update_ts))
            {
                obj.sync_info = None;
            }
            ctx.objects.save(&obj)?;
            (hooks.post_commit)(ctx, log, payload, &obj)?;
            return Ok(Outcome::Synced);
        }
        let si = SyncInfo {
            log_id: log.id,
            update_ts: log.update_ts,
            status: Status::InternalSync,
            is_delete: false,
            attrs: payload.attrs(),
            block: Some(block),
        };
        let take = match &obj.sync_info {
            None => true,
            Some(orig) if orig.log_id == si.log_id => !in_flight(orig),
            Some(orig) => (!in_flight(orig) && !orig.is_delete) || si.replaces(orig),
        };
        if take {
            obj.sync_info = Some(si);
            ctx.objects.save(&obj)?;
        }
        (hooks.update_info)(info, &obj);
        return Ok(Outcome::Waiting);
    }

    obj.attrs = payload.attrs();
    obj.update_ts = log.update_ts;
    obj.update_log_id = Some(log.id);
    if obj
        .sync_info
        .as_ref()
        .map_or(false, |s| !s.is_delete && s.update_ts <= log.update_ts)
    {
        obj.sync_info = None;
    }
    ctx.objects.save(&obj)?;
    (hooks.post_commit)(ctx, log, payload, &obj)?;
    Ok(Outcome::Synced)
}

/// An alive update still fetching its blocks
fn in_flight(si: &SyncInfo) -> bool {
    matches!(si.status, Status::InternalSync | Status::Sync)
}

/// Not yet alive, but its blocks may already be stored locally
fn is_pending(status: Status) -> bool {
    matches!(status, Status::Pending | Status::InternalPending)
}

/// Layout of an update, keeping whatever blocks arrived while it was pending
fn held_update_block(obj: &Object, log_id: &Eid, meta: &BlockMeta) -> BlockInfo {
    obj.sync_info
        .as_ref()
        .filter(|si| si.log_id == *log_id)
        .and_then(|si| si.block.as_ref())
        .filter(|b| b.same_layout(meta))
        .cloned()
        .unwrap_or_else(|| BlockInfo::from_meta(meta))
}

fn delete_alive(
    ctx: &ProcessContext<'_>,
    log: &Oplog,
    kind: OpKind,
    payload: &OpPayload,
    info: &mut ProcessInfo,
) -> Result<Outcome> {
    let hooks = hooks(kind);
    let object_kind = kind.object_kind();
    let [_, _, deleted] = kind.delete_statuses();

    let Some(mut obj) = ctx.objects.get(object_kind, &log.object_id)? else {
        let mut tombstone = Object::new(
            log.object_id,
            object_kind,
            log.doer_id,
            log.id,
            log.update_ts,
            deleted,
            Value::Null,
            None,
        );
        tombstone.update_log_id = Some(log.id);
        ctx.objects.save(&tombstone)?;
        push_unique(&mut info.deleted, object_kind, log.object_id);
        return Ok(Outcome::Synced);
    };

    if obj.status == deleted {
        return Ok(Outcome::Synced);
    }
    if obj.status == Status::Failed {
        return Ok(Outcome::Failed);
    }
    if log.prev_log_id != Some(obj.log_id) || log.update_ts < obj.create_ts {
        return Ok(Outcome::Failed);
    }

    if let Some(si) = obj.sync_info.take() {
        if let Some(block) = si.block {
            ctx.blocks.remove(object_kind, &obj.id, &block.id)?;
        }
    }
    obj.status = deleted;
    obj.update_ts = obj.update_ts.max(log.update_ts);
    obj.update_log_id = Some(log.id);
    ctx.objects.save(&obj)?;
    push_unique(&mut info.deleted, object_kind, obj.id);
    (hooks.post_commit)(ctx, log, payload, &obj)?;
    Ok(Outcome::Synced)
}

// =============================================================================
// PENDING PASS
// =============================================================================

/// Record a pending oplog without committing it
pub fn process_pending(ctx: &ProcessContext<'_>, log: &Oplog) -> Result<Outcome> {
    let kind = log.kind()?;
    let payload = log.payload()?;
    let object_kind = kind.object_kind();
    let class = kind.class();

    match class {
        OpClass::Create => {
            if ctx.objects.get(object_kind, &log.object_id)?.is_none() {
                let obj = (hooks(kind).to_object)(log, object_kind, &payload, log.status());
                ctx.objects.save(&obj)?;
            }
        }
        OpClass::Update | OpClass::Delete => {
            let Some(mut obj) = ctx.objects.get(object_kind, &log.object_id)? else {
                return Ok(Outcome::Waiting);
            };
            if obj.status.is_deleted_class() || obj.status == Status::Failed {
                return Ok(Outcome::Waiting);
            }
            let si = SyncInfo {
                log_id: log.id,
                update_ts: log.update_ts,
                status: log.status(),
                is_delete: class == OpClass::Delete,
                attrs: payload.attrs(),
                block: payload.block().map(|meta| held_update_block(&obj, &log.id, meta)),
            };
            let take = match &obj.sync_info {
                None => true,
                Some(orig) if in_flight(orig) => false,
                Some(orig) => orig.log_id == si.log_id || si.replaces(orig),
            };
            if take {
                obj.sync_info = Some(si);
                ctx.objects.save(&obj)?;
            }
        }
        OpClass::Other => {}
    }
    Ok(Outcome::Waiting)
}

/// An oplog was rejected: drop what it left on its object
pub fn handle_failed(ctx: &ProcessContext<'_>, log: &Oplog, info: &mut ProcessInfo) -> Result<()> {
    let object_kind = log.kind()?.object_kind();
    let Some(mut obj) = ctx.objects.get(object_kind, &log.object_id)? else {
        return Ok(());
    };
    let mut changed = false;
    if obj.sync_info.as_ref().map_or(false, |s| s.log_id == log.id) {
        if let Some(block) = obj.sync_info.take().and_then(|s| s.block) {
            ctx.blocks.remove(object_kind, &obj.id, &block.id)?;
        }
        changed = true;
    }
    if obj.log_id == log.id && !obj.status.is_deleted_class() && obj.status != Status::Failed {
        obj.status = Status::Failed;
        changed = true;
        for dep in ctx.oplogs.by_object(&obj.id, Order::Forward)? {
            if dep.id != log.id && !dep.failed {
                demote(ctx, &dep.id, info)?;
            }
        }
    }
    if changed {
        warn!(oplog = %log.id, object = %obj.id, "Rolled back failed oplog");
        ctx.objects.save(&obj)?;
    }
    Ok(())
}

// =============================================================================
// BLOCK BACKFILL
// =============================================================================

/// Result of taking in a batch of blocks
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlockProgress {
    pub stored: usize,
    pub rejected: usize,
    pub missing: Vec<u32>,
    pub complete: bool,
}

fn put_blocks(
    ctx: &ProcessContext<'_>,
    kind: ObjectKind,
    object_id: &Eid,
    bi: &mut BlockInfo,
    blocks: &[(u32, Block)],
    progress: &mut BlockProgress,
) -> Result<()> {
    for (idx, block) in blocks {
        if bi.has(*idx) {
            continue;
        }
        match ctx.blocks.put_block(kind, object_id, bi, *idx, block) {
            Ok(()) => progress.stored += 1,
            Err(BlockError::Storage(e)) => return Err(e.into()),
            Err(e) => {
                warn!(object = %object_id, block = idx, error = %e, "Rejected block");
                progress.rejected += 1;
            }
        }
    }
    progress.missing = bi.missing();
    progress.complete = bi.is_all_good;
    Ok(())
}

/// A peer confirmed it holds the layout a create announced
pub fn receive_create_object(ctx: &ProcessContext<'_>, remote: &Object, info: &mut ProcessInfo) -> Result<bool> {
    let Some(mut obj) = ctx.objects.get(remote.kind, &remote.id)? else {
        return Ok(false);
    };
    if obj.status != Status::InternalSync || obj.log_id != remote.log_id {
        return Ok(false);
    }
    match (&obj.block, &remote.block) {
        (Some(mine), Some(theirs)) if mine.same_layout(&theirs.meta()) => {}
        _ => return Ok(false),
    }
    obj.status = Status::Sync;
    ctx.objects.save(&obj)?;
    update_info_default(info, &obj);
    Ok(true)
}

/// Store blocks of a create. The object goes alive once the last one lands.
pub fn receive_create_blocks(
    ctx: &ProcessContext<'_>,
    kind: ObjectKind,
    object_id: &Eid,
    info_id: &Eid,
    blocks: &[(u32, Block)],
    info: &mut ProcessInfo,
) -> Result<BlockProgress> {
    let mut progress = BlockProgress::default();
    let Some(mut obj) = ctx.objects.get(kind, object_id)? else {
        return Ok(progress);
    };
    let pending = is_pending(obj.status);
    if !pending && !matches!(obj.status, Status::InternalSync | Status::Sync) {
        return Ok(progress);
    }
    let Some(mut bi) = obj.block.take() else {
        return Ok(progress);
    };
    if bi.id != *info_id {
        return Ok(progress);
    }
    put_blocks(ctx, kind, object_id, &mut bi, blocks, &mut progress)?;
    obj.block = Some(bi);
    if pending {
        // kept until the create goes alive
        ctx.objects.save(&obj)?;
        return Ok(progress);
    }
    obj.status = if progress.complete {
        Status::Alive
    } else {
        Status::Sync
    };
    ctx.objects.save(&obj)?;

    if progress.complete {
        if let Some(log) = ctx.oplogs.get(&obj.log_id)? {
            let payload = log.payload()?;
            (hooks(log.kind()?).post_commit)(ctx, &log, &payload, &obj)?;
            ctx.oplogs.set_is_sync(&log.id, true)?;
        }
        replay_dependents(ctx, &obj, info)?;
        debug!(object = %object_id, "Object blocks complete");
    }
    Ok(progress)
}

/// A peer confirmed it applied or is applying the update we wait on
pub fn receive_update_object(ctx: &ProcessContext<'_>, remote: &Object, info: &mut ProcessInfo) -> Result<bool> {
    let Some(mut obj) = ctx.objects.get(remote.kind, &remote.id)? else {
        return Ok(false);
    };
    let Some(si) = obj.sync_info.as_mut() else {
        return Ok(false);
    };
    if si.status != Status::InternalSync {
        return Ok(false);
    }
    let Some(mine) = &si.block else {
        return Ok(false);
    };
    let applied = remote.update_log_id == Some(si.log_id)
        && remote.block.as_ref().map_or(false, |b| b.same_layout(&mine.meta()));
    let in_progress = remote.sync_info.as_ref().map_or(false, |r| {
        r.log_id == si.log_id && r.block.as_ref().map_or(false, |b| b.same_layout(&mine.meta()))
    });
    if !applied && !in_progress {
        return Ok(false);
    }
    si.status = Status::Sync;
    ctx.objects.save(&obj)?;
    update_info_default(info, &obj);
    Ok(true)
}

/// Store blocks of an update. The update is applied once the last one lands.
pub fn receive_update_blocks(
    ctx: &ProcessContext<'_>,
    kind: ObjectKind,
    object_id: &Eid,
    info_id: &Eid,
    blocks: &[(u32, Block)],
) -> Result<BlockProgress> {
    let mut progress = BlockProgress::default();
    let Some(mut obj) = ctx.objects.get(kind, object_id)? else {
        return Ok(progress);
    };
    let Some(mut si) = obj.sync_info.take() else {
        return Ok(progress);
    };
    let pending = is_pending(si.status);
    let Some(mut bi) = si
        .block
        .take()
        .filter(|b| b.id == *info_id && (pending || in_flight(&si)))
    else {
        return Ok(progress);
    };
    put_blocks(ctx, kind, object_id, &mut bi, blocks, &mut progress)?;
    if !pending {
        si.status = Status::Sync;
    }

    if !progress.complete || pending {
        si.block = Some(bi);
        obj.sync_info = Some(si);
        ctx.objects.save(&obj)?;
        return Ok(progress);
    }

    if si.update_ts >= obj.update_ts {
        if let Some(old) = obj.block.replace(bi) {
            ctx.blocks.remove(kind, object_id, &old.id)?;
        }
        obj.attrs = si.attrs;
        obj.update_ts = si.update_ts;
        obj.update_log_id = Some(si.log_id);
    } else {
        ctx.blocks.remove(kind, object_id, &bi.id)?;
    }
    ctx.objects.save(&obj)?;
    ctx.oplogs.set_is_sync(&si.log_id, true)?;
    debug!(object = %object_id, oplog = %si.log_id, "Update blocks complete");
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{split, N_LINE_IN_BLOCK};
    use crate::storage::Storage;
    use replica_core::crypto::KeyPair;
    use replica_core::op::{CreateObjectData, DeleteObjectData, UpdateObjectData};
    use replica_core::{Stream, Timestamp};

    struct Stores {
        oplogs: OplogStore,
        objects: ObjectStore,
        blocks: BlockStore,
        counts: CountStore,
    }

    impl Stores {
        fn ctx(&self) -> ProcessContext<'_> {
            ProcessContext {
                oplogs: &self.oplogs,
                objects: &self.objects,
                blocks: &self.blocks,
                counts: &self.counts,
            }
        }
    }

    fn create_test_stores() -> (Stores, Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let entity = Eid::new_random();
        let stores = Stores {
            oplogs: OplogStore::new(storage.oplog.clone(), storage.meta.clone(), Stream::Board, entity),
            objects: ObjectStore::new(storage.content.clone(), storage.meta.clone(), entity),
            blocks: BlockStore::new(storage.content.clone(), entity),
            counts: CountStore::new(storage.content.clone(), entity),
        };
        (stores, storage, dir)
    }

    fn alive(kind: OpKind, object: Eid, prev: Option<Eid>, payload: OpPayload, ts: i64) -> Oplog {
        let key = KeyPair::generate();
        let doer = Eid::with_address(&key.address());
        let mut log = Oplog::new(Eid::new_random(), kind, doer, object, prev, &payload, Timestamp::new(ts, 0)).unwrap();
        log.sign(&key).unwrap();
        log.master_sign(doer, &key, Timestamp::new(ts, 0)).unwrap();
        log.set_alive(doer);
        log
    }

    fn run(stores: &Stores, log: &Oplog, info: &mut ProcessInfo) -> Outcome {
        let outcome = process_alive(&stores.ctx(), log, info).unwrap();
        let mut stored = log.clone();
        stored.is_sync = outcome == Outcome::Synced;
        stored.failed = outcome == Outcome::Failed;
        stores.oplogs.append(&stored).unwrap();
        outcome
    }

    fn create_article(object: Eid, ts: i64) -> Oplog {
        alive(
            OpKind::CreateArticle,
            object,
            None,
            OpPayload::CreateObject(CreateObjectData {
                attrs: serde_json::json!({"title": "hi"}),
                ..Default::default()
            }),
            ts,
        )
    }

    fn update_article(object: Eid, create: &Oplog, title: &str, ts: i64) -> Oplog {
        alive(
            OpKind::UpdateArticle,
            object,
            Some(create.id),
            OpPayload::UpdateObject(UpdateObjectData {
                attrs: serde_json::json!({"title": title}),
                ..Default::default()
            }),
            ts,
        )
    }

    fn delete_article(object: Eid, create: &Oplog, ts: i64) -> Oplog {
        alive(
            OpKind::DeleteArticle,
            object,
            Some(create.id),
            OpPayload::DeleteObject(DeleteObjectData::default()),
            ts,
        )
    }

    #[test]
    fn test_create_update_delete() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let create = create_article(oid, 100);
        assert_eq!(run(&stores, &create, &mut info), Outcome::Synced);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::Alive);
        assert_eq!(
            stores.objects.last_seen(&oid, &create.doer_id).unwrap(),
            Some(Timestamp::new(100, 0))
        );

        let update = update_article(oid, &create, "v2", 150);
        assert_eq!(run(&stores, &update, &mut info), Outcome::Synced);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.attrs["title"], "v2");
        assert_eq!(obj.update_log_id, Some(update.id));

        let stale = update_article(oid, &create, "v1", 120);
        assert_eq!(run(&stores, &stale, &mut info), Outcome::Synced);
        assert_eq!(stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap().attrs["title"], "v2");

        let delete = delete_article(oid, &create, 200);
        assert_eq!(run(&stores, &delete, &mut info), Outcome::Synced);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::Deleted);
        assert_eq!(stores.objects.last_seen(&oid, &create.doer_id).unwrap(), None);

        let late = update_article(oid, &create, "v3", 300);
        assert_eq!(run(&stores, &late, &mut info), Outcome::Synced);
        assert_eq!(
            stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap().status,
            Status::Deleted
        );
    }

    #[test]
    fn test_equal_ts_update_smaller_id_wins() {
        for first_small in [true, false] {
            let (stores, _s, _dir) = create_test_stores();
            let mut info = ProcessInfo::default();
            let oid = Eid::new_random();
            let create = create_article(oid, 100);
            run(&stores, &create, &mut info);

            let a = update_article(oid, &create, "a", 200);
            let b = update_article(oid, &create, "b", 200);
            let (small, large) = if a.id < b.id { (a, b) } else { (b, a) };
            let order = if first_small {
                [small.clone(), large.clone()]
            } else {
                [large.clone(), small.clone()]
            };
            for log in &order {
                run(&stores, log, &mut info);
            }
            let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
            assert_eq!(obj.update_log_id, Some(small.id));
            assert!(stores.oplogs.get(&large.id).unwrap().unwrap().failed);
        }
    }

    #[test]
    fn test_delete_before_create_leaves_tombstone() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let create = create_article(oid, 100);
        let delete = delete_article(oid, &create, 200);
        assert_eq!(run(&stores, &delete, &mut info), Outcome::Synced);
        assert_eq!(run(&stores, &create, &mut info), Outcome::Synced);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::Deleted);
        assert!(info.deleted[&ObjectKind::Article].contains(&oid));
    }

    #[test]
    fn test_update_before_create_is_replayed() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let create = create_article(oid, 100);
        let update = update_article(oid, &create, "later", 150);
        assert_eq!(run(&stores, &update, &mut info), Outcome::Waiting);
        run(&stores, &create, &mut info);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.attrs["title"], "later");
        assert!(stores.oplogs.get(&update.id).unwrap().unwrap().is_sync);
    }

    #[test]
    fn test_broken_chain_fails() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let create = create_article(oid, 100);
        run(&stores, &create, &mut info);
        let other = create_article(Eid::new_random(), 100);
        let update = update_article(oid, &other, "x", 150);
        assert_eq!(run(&stores, &update, &mut info), Outcome::Failed);
    }

    #[test]
    fn test_blocks_flow_partial_then_complete() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let content: Vec<String> = (0..45).map(|i| format!("l{}", i)).collect();
        let (meta, blocks) = split(&content, N_LINE_IN_BLOCK).unwrap();
        let create = alive(
            OpKind::CreateArticle,
            oid,
            None,
            OpPayload::CreateObject(CreateObjectData {
                block: Some(meta.clone()),
                ..Default::default()
            }),
            100,
        );
        assert_eq!(run(&stores, &create, &mut info), Outcome::Waiting);
        assert!(info.create_objects[&ObjectKind::Article].contains(&oid));
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::InternalSync);

        let mut info = ProcessInfo::default();
        assert!(receive_create_object(&stores.ctx(), &obj, &mut info).unwrap());
        assert!(info.create_blocks[&ObjectKind::Article].contains(&oid));

        let partial = vec![(0, blocks[0].clone()), (2, blocks[2].clone())];
        let progress =
            receive_create_blocks(&stores.ctx(), ObjectKind::Article, &oid, &meta.id, &partial, &mut info).unwrap();
        assert_eq!(progress.missing, vec![1]);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::Sync);
        assert!(!stores.oplogs.get(&create.id).unwrap().unwrap().is_sync);

        let rest = vec![(1, blocks[1].clone())];
        let progress =
            receive_create_blocks(&stores.ctx(), ObjectKind::Article, &oid, &meta.id, &rest, &mut info).unwrap();
        assert!(progress.complete);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::Alive);
        let bi = obj.block.unwrap();
        assert_eq!(stores.blocks.content(ObjectKind::Article, &oid, &bi).unwrap().unwrap(), content);
        assert!(stores.oplogs.get(&create.id).unwrap().unwrap().is_sync);
    }

    #[test]
    fn test_pending_create_keeps_local_blocks() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let content: Vec<String> = (0..45).map(|i| format!("l{}", i)).collect();
        let (meta, blocks) = split(&content, N_LINE_IN_BLOCK).unwrap();
        let mut create = alive(
            OpKind::CreateArticle,
            oid,
            None,
            OpPayload::CreateObject(CreateObjectData {
                block: Some(meta.clone()),
                ..Default::default()
            }),
            100,
        );
        create.master_log_id = None;
        assert_eq!(create.status(), Status::Pending);
        process_pending(&stores.ctx(), &create).unwrap();

        let all: Vec<(u32, Block)> = blocks.iter().cloned().enumerate().map(|(i, b)| (i as u32, b)).collect();
        let progress =
            receive_create_blocks(&stores.ctx(), ObjectKind::Article, &oid, &meta.id, &all, &mut info).unwrap();
        assert!(progress.complete);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::Pending);
        assert!(obj.blocks_complete());

        create.set_alive(create.doer_id);
        assert_eq!(run(&stores, &create, &mut info), Outcome::Synced);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.status, Status::Alive);
        let bi = obj.block.unwrap();
        assert_eq!(stores.blocks.content(ObjectKind::Article, &oid, &bi).unwrap().unwrap(), content);
    }

    #[test]
    fn test_pending_update_keeps_local_blocks() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let create = create_article(oid, 100);
        assert_eq!(run(&stores, &create, &mut info), Outcome::Synced);

        let content: Vec<String> = (0..25).map(|i| format!("v2 {}", i)).collect();
        let (meta, blocks) = split(&content, N_LINE_IN_BLOCK).unwrap();
        let mut update = alive(
            OpKind::UpdateArticle,
            oid,
            Some(create.id),
            OpPayload::UpdateObject(UpdateObjectData {
                attrs: serde_json::json!({"title": "v2"}),
                block: Some(meta.clone()),
                ..Default::default()
            }),
            150,
        );
        update.master_log_id = None;
        process_pending(&stores.ctx(), &update).unwrap();

        let all: Vec<(u32, Block)> = blocks.iter().cloned().enumerate().map(|(i, b)| (i as u32, b)).collect();
        let progress = receive_update_blocks(&stores.ctx(), ObjectKind::Article, &oid, &meta.id, &all).unwrap();
        assert!(progress.complete);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        let si = obj.sync_info.unwrap();
        assert_eq!(si.status, Status::Pending);
        assert!(si.block.unwrap().is_all_good);

        // a second pending pass must not clear what is already stored
        process_pending(&stores.ctx(), &update).unwrap();

        update.set_alive(update.doer_id);
        assert_eq!(run(&stores, &update, &mut info), Outcome::Synced);
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.attrs["title"], "v2");
        assert_eq!(obj.update_log_id, Some(update.id));
        assert!(obj.sync_info.is_none());
        let bi = obj.block.unwrap();
        assert_eq!(stores.blocks.content(ObjectKind::Article, &oid, &bi).unwrap().unwrap(), content);
    }

    #[test]
    fn test_pending_update_then_failed_rollback() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let create = create_article(oid, 100);
        run(&stores, &create, &mut info);

        let key = KeyPair::generate();
        let doer = Eid::with_address(&key.address());
        let mut pending = Oplog::new(
            Eid::new_random(),
            OpKind::UpdateArticle,
            doer,
            oid,
            Some(create.id),
            &OpPayload::UpdateObject(UpdateObjectData::default()),
            Timestamp::new(150, 0),
        )
        .unwrap();
        pending.sign(&key).unwrap();
        pending.internal_sign(doer, &key, Timestamp::new(150, 0)).unwrap();
        process_pending(&stores.ctx(), &pending).unwrap();
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert_eq!(obj.sync_info.as_ref().unwrap().log_id, pending.id);
        assert_eq!(obj.sync_info.as_ref().unwrap().status, Status::InternalPending);

        handle_failed(&stores.ctx(), &pending, &mut info).unwrap();
        let obj = stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap();
        assert!(obj.sync_info.is_none());
        assert_eq!(obj.status, Status::Alive);
    }

    #[test]
    fn test_failed_create_fails_dependents() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let oid = Eid::new_random();
        let create = create_article(oid, 100);
        run(&stores, &create, &mut info);
        let update = update_article(oid, &create, "x", 150);
        run(&stores, &update, &mut info);

        handle_failed(&stores.ctx(), &create, &mut info).unwrap();
        assert_eq!(
            stores.objects.get(ObjectKind::Article, &oid).unwrap().unwrap().status,
            Status::Failed
        );
        assert!(stores.oplogs.get(&update.id).unwrap().unwrap().failed);
        assert!(info.failed.contains(&update.id));
    }

    #[test]
    fn test_comment_counts_on_article() {
        let (stores, _s, _dir) = create_test_stores();
        let mut info = ProcessInfo::default();
        let article = Eid::new_random();
        run(&stores, &create_article(article, 100), &mut info);
        for ts in [110, 120] {
            let comment = alive(
                OpKind::CreateComment,
                Eid::new_random(),
                None,
                OpPayload::CreateObject(CreateObjectData {
                    parent: Some(article),
                    ..Default::default()
                }),
                ts,
            );
            run(&stores, &comment, &mut info);
        }
        let count = stores.counts.get(ObjectKind::Article, &article, "comment").unwrap();
        assert_eq!(count.estimate(), 2);
    }
}
