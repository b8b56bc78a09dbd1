//! Peer synchronization protocol
//!
//! Two peers reconcile a stream in three steps:
//!
//! 1. `SyncOplog` carries the requester's Merkle tree list up to its
//!    to-sync time. Windows that differ are pushed outright when only one
//!    side has content, or drilled into with `ForceSyncOplogByMerkle`
//!    until an hour is reached, where both sides swap oplog ids.
//! 2. `SyncOplogAck` carries the responder's leaf ids after the to-sync
//!    time, in chunks, so recent oplogs are compared id by id.
//! 3. Whatever either side lacks travels in `SyncOplogNewOplogs`, which
//!    may also ask for ids in return.
//!
//! Objects whose content arrives in blocks are backfilled with the
//! `SyncCreate*`, `SyncUpdate*` and `ForceSync*` messages once their oplog
//! has been taken in.

use crate::block::{Block, BlockInfo};
use crate::manager::{ManagerError, Outbound, ProtocolManager, Result};
use crate::merkle::{diff_nodes, MerkleLevel, MerkleNode, WindowDiff};
use crate::object::Object;
use crate::oplog::Oplog;
use crate::processor::{self, BlockProgress, ProcessInfo};
use replica_core::{Eid, ObjectKind, Status, Stream, Timestamp};
use replica_net::{MsgKind, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

// =============================================================================
// MESSAGE BODIES
// =============================================================================

/// Opens reconciliation of one stream
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncOplog {
    #[serde(rename = "TS")]
    pub ts: Timestamp,
    /// Tree list below this point is compared node by node
    #[serde(rename = "LT")]
    pub to_sync_time: Timestamp,
    #[serde(rename = "N")]
    pub nodes: Vec<MerkleNode>,
}

/// One chunk of leaf ids in `[start, end)`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncOplogAck {
    #[serde(rename = "TS")]
    pub start: Timestamp,
    #[serde(rename = "E")]
    pub end: Timestamp,
    #[serde(rename = "K")]
    pub ids: Vec<Eid>,
    /// Last chunk of this round
    #[serde(rename = "F", default)]
    pub last: bool,
}

/// Children of one window, sent while drilling down.
/// Also the body of `ForceSyncOplogByMerkleAck`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceSyncOplogByMerkle {
    #[serde(rename = "L")]
    pub level: u8,
    #[serde(rename = "T")]
    pub start: Timestamp,
    #[serde(rename = "N")]
    pub nodes: Vec<MerkleNode>,
}

/// Every oplog id the sender holds in one window
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceSyncOplogByOplogAck {
    #[serde(rename = "L")]
    pub level: u8,
    #[serde(rename = "T")]
    pub start: Timestamp,
    #[serde(rename = "K")]
    pub ids: Vec<Eid>,
}

/// Drill-down budget exhausted: resend everything in `[from, to)`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidSyncOplog {
    #[serde(rename = "f")]
    pub from: Timestamp,
    #[serde(rename = "t")]
    pub to: Timestamp,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncOplogNewOplogs {
    #[serde(rename = "O")]
    pub oplogs: Vec<Oplog>,
    /// Ids the sender wants back
    #[serde(rename = "K", default)]
    pub wanted: Vec<Eid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddOplog {
    #[serde(rename = "O")]
    pub oplog: Oplog,
}

/// Body of `AddOplogs`, `AddPendingOplogs`, `SyncPendingOplogAck` and
/// `SyncOplogNewOplogsAck`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddOplogs {
    #[serde(rename = "O")]
    pub oplogs: Vec<Oplog>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncPendingOplog {
    #[serde(rename = "TS")]
    pub ts: Timestamp,
}

/// Request for objects by id
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncObject {
    #[serde(rename = "k")]
    pub kind: ObjectKind,
    #[serde(rename = "O")]
    pub ids: Vec<Eid>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncObjectAck {
    #[serde(rename = "O")]
    pub objects: Vec<Object>,
}

/// Request for blocks of one block layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncBlock {
    #[serde(rename = "k")]
    pub kind: ObjectKind,
    #[serde(rename = "OID")]
    pub object_id: Eid,
    #[serde(rename = "ID")]
    pub info_id: Eid,
    #[serde(rename = "I")]
    pub indices: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncBlockAck {
    #[serde(rename = "k")]
    pub kind: ObjectKind,
    #[serde(rename = "OID")]
    pub object_id: Eid,
    #[serde(rename = "ID")]
    pub info_id: Eid,
    #[serde(rename = "B")]
    pub blocks: Vec<(u32, Block)>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ForceSyncMediaAck {
    #[serde(rename = "O")]
    pub objects: Vec<Object>,
    #[serde(rename = "B")]
    pub blocks: Vec<SyncBlockAck>,
}

fn parse_level(raw: u8) -> Result<MerkleLevel> {
    MerkleLevel::from_u8(raw).ok_or(ManagerError::BadMessage("merkle level"))
}

/// Split ordered leaves into chunks of about `max` ids. Leaves sharing a
/// timestamp never straddle two chunks.
fn chunk_leaves(
    leaves: Vec<(Timestamp, Eid)>,
    from: Timestamp,
    to: Timestamp,
    max: usize,
) -> Vec<(Timestamp, Timestamp, Vec<Eid>)> {
    let mut chunks = Vec::new();
    let mut start = from;
    let mut ids = Vec::new();
    let mut last_ts = None;
    for (ts, id) in leaves {
        if ids.len() >= max && last_ts != Some(ts) {
            chunks.push((start, ts, std::mem::take(&mut ids)));
            start = ts;
        }
        ids.push(id);
        last_ts = Some(ts);
    }
    chunks.push((start, to, ids));
    chunks
}

// =============================================================================
// OPLOG RECONCILIATION
// =============================================================================

impl ProtocolManager {
    /// Start of the part of a stream not yet validated against peers
    pub(crate) fn to_sync_time(&self, stream: Stream) -> Result<Timestamp> {
        let synced = self.stores.oplogs(stream).sync_time()?;
        if synced.is_zero() {
            return Ok(Timestamp::ZERO);
        }
        let back = synced
            .add_seconds(-self.params.offset_merkle_sync_secs)
            .max(Timestamp::ZERO);
        Ok(back.hour_window().0)
    }

    /// `SyncOplog` for one stream
    pub(crate) fn sync_oplog(&self, peer: PeerId, stream: Stream) -> Result<Outbound> {
        let to_sync_time = self.to_sync_time(stream)?;
        let body = SyncOplog {
            ts: self.now(),
            to_sync_time,
            nodes: self.stores.oplogs(stream).tree_list(to_sync_time)?,
        };
        self.envelope(Some(peer), stream, MsgKind::SyncOplog, &body)
    }

    pub(crate) fn on_sync_oplog(&self, peer: PeerId, stream: Stream, body: SyncOplog) -> Result<Vec<Outbound>> {
        let store = self.stores.oplogs(stream);
        let mine = store.tree_list(body.to_sync_time)?;
        let mut out = Vec::new();
        for diff in diff_nodes(&mine, &body.nodes) {
            out.extend(self.window_diff(peer, stream, &diff, MsgKind::ForceSyncOplogByMerkle)?);
        }

        let leaves = store.merkle().leaf_ids(body.to_sync_time, Timestamp::MAX)?;
        let chunks = chunk_leaves(
            leaves,
            body.to_sync_time,
            Timestamp::MAX,
            self.params.max_sync_oplog_ack,
        );
        let n = chunks.len();
        for (i, (start, end, ids)) in chunks.into_iter().enumerate() {
            let ack = SyncOplogAck {
                start,
                end,
                ids,
                last: i + 1 == n,
            };
            out.push(self.envelope(Some(peer), stream, MsgKind::SyncOplogAck, &ack)?);
        }
        debug!(
            entity = %self.entity_id,
            stream = stream.name(),
            %peer,
            windows = out.len().saturating_sub(n),
            "Answered SyncOplog"
        );
        Ok(out)
    }

    pub(crate) fn on_sync_oplog_ack(&self, peer: PeerId, stream: Stream, body: SyncOplogAck) -> Result<Vec<Outbound>> {
        let mut out = self.reconcile_ids(peer, stream, body.start, body.end, &body.ids)?;
        if body.last {
            out.extend(self.stream_synced(peer, stream)?);
        }
        Ok(out)
    }

    /// Answer one differing window of a tree list or a drill-down
    fn window_diff(&self, peer: PeerId, stream: Stream, diff: &WindowDiff, drill: MsgKind) -> Result<Vec<Outbound>> {
        let (start, end) = diff.level.window(diff.start_ts)?;
        match (&diff.mine, &diff.theirs) {
            (Some(_), None) => self.push_window(peer, stream, start, end),
            (None, _) => {
                let ack = ForceSyncOplogByOplogAck {
                    level: diff.level as u8,
                    start: diff.start_ts,
                    ids: Vec::new(),
                };
                Ok(vec![self.envelope(Some(peer), stream, MsgKind::ForceSyncOplogByOplogAck, &ack)?])
            }
            (Some(_), Some(_)) if matches!(diff.level, MerkleLevel::Hour | MerkleLevel::Now | MerkleLevel::Leaf) => {
                Ok(vec![self.window_ids(peer, stream, diff.level, diff.start_ts)?])
            }
            (Some(_), Some(_)) => {
                if !self.take_retry(peer, stream, diff.level, diff.start_ts) {
                    warn!(
                        entity = %self.entity_id,
                        stream = stream.name(),
                        %peer,
                        level = ?diff.level,
                        start = %diff.start_ts,
                        "Merkle drill-down budget exhausted"
                    );
                    let mut out = vec![self.envelope(
                        Some(peer),
                        stream,
                        MsgKind::InvalidSyncOplog,
                        &InvalidSyncOplog { from: start, to: end },
                    )?];
                    out.extend(self.push_window(peer, stream, start, end)?);
                    return Ok(out);
                }
                let body = ForceSyncOplogByMerkle {
                    level: diff.level as u8,
                    start: diff.start_ts,
                    nodes: self.stores.oplogs(stream).children(diff.level, diff.start_ts)?,
                };
                Ok(vec![self.envelope(Some(peer), stream, drill, &body)?])
            }
        }
    }

    fn window_ids(&self, peer: PeerId, stream: Stream, level: MerkleLevel, start_ts: Timestamp) -> Result<Outbound> {
        let (start, end) = level.window(start_ts)?;
        let ids = self
            .stores
            .oplogs(stream)
            .merkle()
            .leaf_ids(start, end)?
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        let ack = ForceSyncOplogByOplogAck {
            level: level as u8,
            start: start_ts,
            ids,
        };
        self.envelope(Some(peer), stream, MsgKind::ForceSyncOplogByOplogAck, &ack)
    }

    /// `ForceSyncOplogByMerkle` and its ack: compare children of one window
    pub(crate) fn on_force_sync_by_merkle(
        &self,
        peer: PeerId,
        stream: Stream,
        body: ForceSyncOplogByMerkle,
    ) -> Result<Vec<Outbound>> {
        let level = parse_level(body.level)?;
        if matches!(level, MerkleLevel::Hour | MerkleLevel::Now | MerkleLevel::Leaf) {
            return Ok(vec![self.window_ids(peer, stream, level, body.start)?]);
        }
        let mine = self.stores.oplogs(stream).children(level, body.start)?;
        let mut out = Vec::new();
        for diff in diff_nodes(&mine, &body.nodes) {
            out.extend(self.window_diff(peer, stream, &diff, MsgKind::ForceSyncOplogByMerkleAck)?);
        }
        Ok(out)
    }

    pub(crate) fn on_force_sync_by_oplog_ack(
        &self,
        peer: PeerId,
        stream: Stream,
        body: ForceSyncOplogByOplogAck,
    ) -> Result<Vec<Outbound>> {
        let level = parse_level(body.level)?;
        let (start, end) = level.window(body.start)?;
        self.reconcile_ids(peer, stream, start, end, &body.ids)
    }

    pub(crate) fn on_invalid_sync_oplog(
        &self,
        peer: PeerId,
        stream: Stream,
        body: InvalidSyncOplog,
    ) -> Result<Vec<Outbound>> {
        warn!(entity = %self.entity_id, stream = stream.name(), %peer, from = %body.from, to = %body.to, "Peer requested full window resync");
        self.push_window(peer, stream, body.from, body.to)
    }

    /// Send what the peer lacks in `[start, end)` and ask for what we lack
    fn reconcile_ids(
        &self,
        peer: PeerId,
        stream: Stream,
        start: Timestamp,
        end: Timestamp,
        theirs: &[Eid],
    ) -> Result<Vec<Outbound>> {
        let store = self.stores.oplogs(stream);
        let mine: Vec<Eid> = store
            .merkle()
            .leaf_ids(start, end)?
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        let theirs_set: HashSet<&Eid> = theirs.iter().collect();
        let mine_set: HashSet<&Eid> = mine.iter().collect();

        let give: Vec<Eid> = mine.iter().filter(|id| !theirs_set.contains(id)).copied().collect();
        let wanted: Vec<Eid> = theirs.iter().filter(|id| !mine_set.contains(id)).copied().collect();
        if give.is_empty() && wanted.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            entity = %self.entity_id,
            stream = stream.name(),
            %peer,
            give = give.len(),
            wanted = wanted.len(),
            "Reconciled oplog ids"
        );
        self.new_oplogs(peer, stream, store.get_many(&give)?, wanted)
    }

    /// Every alive oplog in `[start, end)`
    fn push_window(&self, peer: PeerId, stream: Stream, start: Timestamp, end: Timestamp) -> Result<Vec<Outbound>> {
        let oplogs = self.stores.oplogs(stream).alive_in(start, end)?;
        if oplogs.is_empty() {
            return Ok(Vec::new());
        }
        self.new_oplogs(peer, stream, oplogs, Vec::new())
    }

    fn new_oplogs(&self, peer: PeerId, stream: Stream, oplogs: Vec<Oplog>, wanted: Vec<Eid>) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        let mut wanted = Some(wanted);
        let max = self.params.max_sync_oplog_ack.max(1);
        let mut chunks: Vec<Vec<Oplog>> = oplogs.chunks(max).map(|c| c.to_vec()).collect();
        if chunks.is_empty() {
            chunks.push(Vec::new());
        }
        for chunk in chunks {
            let body = SyncOplogNewOplogs {
                oplogs: chunk,
                wanted: wanted.take().unwrap_or_default(),
            };
            out.push(self.envelope(Some(peer), stream, MsgKind::SyncOplogNewOplogs, &body)?);
        }
        Ok(out)
    }

    pub(crate) fn on_new_oplogs(&self, peer: PeerId, stream: Stream, body: SyncOplogNewOplogs) -> Result<Vec<Outbound>> {
        let mut out = self.ingest(peer, stream, body.oplogs)?;
        if !body.wanted.is_empty() {
            let found: Vec<Oplog> = self
                .stores
                .oplogs(stream)
                .get_many(&body.wanted)?
                .into_iter()
                .filter(|l| l.status() == Status::Alive)
                .collect();
            for chunk in found.chunks(self.params.max_sync_oplog_ack.max(1)) {
                let ack = AddOplogs {
                    oplogs: chunk.to_vec(),
                };
                out.push(self.envelope(Some(peer), stream, MsgKind::SyncOplogNewOplogsAck, &ack)?);
            }
        }
        Ok(out)
    }

    // =========================================================================
    // PENDING GOSSIP
    // =========================================================================

    pub(crate) fn sync_pending_oplog(&self, peer: PeerId, stream: Stream) -> Result<Outbound> {
        let body = SyncPendingOplog { ts: self.now() };
        self.envelope(Some(peer), stream, MsgKind::SyncPendingOplog, &body)
    }

    /// Pending and internal-pending oplogs still young enough to be co-signed
    pub(crate) fn pending_oplogs(&self, stream: Stream) -> Result<Vec<Oplog>> {
        let now = self.now();
        let store = self.stores.oplogs(stream);
        let mut out = store.all(Status::Pending)?;
        out.extend(store.all(Status::InternalPending)?);
        out.retain(|l| !l.is_expired(now, self.params.expire_oplog_secs));
        Ok(out)
    }

    pub(crate) fn on_sync_pending_oplog(
        &self,
        peer: PeerId,
        stream: Stream,
        _body: SyncPendingOplog,
    ) -> Result<Vec<Outbound>> {
        let pending = self.pending_oplogs(stream)?;
        let mut out = Vec::new();
        for chunk in pending.chunks(self.params.max_sync_oplog_ack.max(1)) {
            let ack = AddOplogs {
                oplogs: chunk.to_vec(),
            };
            out.push(self.envelope(Some(peer), stream, MsgKind::SyncPendingOplogAck, &ack)?);
        }
        Ok(out)
    }

    // =========================================================================
    // OBJECT AND BLOCK BACKFILL
    // =========================================================================

    /// Requests for whatever a batch left waiting on content.
    /// `target` is the peer that sent the batch, or every peer when `None`.
    pub(crate) fn backfill_requests(
        &self,
        stream: Stream,
        info: &ProcessInfo,
        target: Option<PeerId>,
    ) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        let max = self.params.max_sync_object_ack.max(1);
        for (kind, ids) in &info.create_objects {
            for chunk in ids.chunks(max) {
                let body = SyncObject {
                    kind: *kind,
                    ids: chunk.to_vec(),
                };
                out.push(self.envelope(target, stream, MsgKind::SyncCreateObject, &body)?);
            }
        }
        for (kind, ids) in &info.update_objects {
            for chunk in ids.chunks(max) {
                let body = SyncObject {
                    kind: *kind,
                    ids: chunk.to_vec(),
                };
                out.push(self.envelope(target, stream, MsgKind::SyncUpdateObject, &body)?);
            }
        }
        for (kind, ids) in &info.create_blocks {
            for id in ids {
                let Some(obj) = self.stores.objects.get(*kind, id)? else {
                    continue;
                };
                if let Some(bi) = &obj.block {
                    out.push(self.block_request(target, stream, MsgKind::SyncCreateBlock, &obj, bi)?);
                }
            }
        }
        for (kind, ids) in &info.update_blocks {
            for id in ids {
                let Some(obj) = self.stores.objects.get(*kind, id)? else {
                    continue;
                };
                if let Some(bi) = obj.sync_info.as_ref().and_then(|si| si.block.as_ref()) {
                    out.push(self.block_request(target, stream, MsgKind::SyncUpdateBlock, &obj, bi)?);
                }
            }
        }
        Ok(out)
    }

    fn block_request(
        &self,
        target: Option<PeerId>,
        stream: Stream,
        kind: MsgKind,
        obj: &Object,
        bi: &BlockInfo,
    ) -> Result<Outbound> {
        let body = SyncBlock {
            kind: obj.kind,
            object_id: obj.id,
            info_id: bi.id,
            indices: bi.missing(),
        };
        self.envelope(target, stream, kind, &body)
    }

    /// `SyncCreateObject`, `SyncUpdateObject` and `ForceSyncObject`
    pub(crate) fn on_object_request(
        &self,
        peer: PeerId,
        stream: Stream,
        reply: MsgKind,
        body: SyncObject,
    ) -> Result<Vec<Outbound>> {
        let mut objects = Vec::new();
        for id in body.ids.iter().take(self.params.max_sync_object_ack) {
            if let Some(obj) = self.stores.objects.get(body.kind, id)? {
                objects.push(obj);
            }
        }
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.envelope(Some(peer), stream, reply, &SyncObjectAck { objects })?])
    }

    /// `SyncCreateObjectAck`, `SyncUpdateObjectAck` and `ForceSyncObjectAck`
    pub(crate) fn on_object_ack(
        &self,
        peer: PeerId,
        stream: Stream,
        kind: MsgKind,
        body: SyncObjectAck,
    ) -> Result<Vec<Outbound>> {
        let ctx = self.stores.ctx(stream);
        let mut info = ProcessInfo::default();
        for remote in &body.objects {
            match kind {
                MsgKind::SyncCreateObjectAck => {
                    processor::receive_create_object(&ctx, remote, &mut info)?;
                }
                MsgKind::SyncUpdateObjectAck => {
                    processor::receive_update_object(&ctx, remote, &mut info)?;
                }
                _ => {
                    if !processor::receive_create_object(&ctx, remote, &mut info)? {
                        processor::receive_update_object(&ctx, remote, &mut info)?;
                    }
                }
            }
        }
        self.backfill_requests(stream, &info, Some(peer))
    }

    fn collect_blocks(&self, kind: ObjectKind, obj: &Object, bi: &BlockInfo, indices: &[u32]) -> Result<Vec<(u32, Block)>> {
        let mut blocks = Vec::new();
        for idx in indices {
            if blocks.len() >= self.params.max_sync_block {
                break;
            }
            if !bi.has(*idx) {
                continue;
            }
            if let Some(block) = self.stores.blocks.get_block(kind, &obj.id, bi, *idx)? {
                blocks.push((*idx, block));
            }
        }
        Ok(blocks)
    }

    /// `SyncCreateBlock`, `SyncUpdateBlock` and `ForceSyncBlock`
    pub(crate) fn on_block_request(
        &self,
        peer: PeerId,
        stream: Stream,
        reply: MsgKind,
        body: SyncBlock,
    ) -> Result<Vec<Outbound>> {
        let Some(obj) = self.stores.objects.get(body.kind, &body.object_id)? else {
            return Ok(Vec::new());
        };
        let bi = [
            obj.block.as_ref(),
            obj.sync_info.as_ref().and_then(|si| si.block.as_ref()),
        ]
        .into_iter()
        .flatten()
        .find(|b| b.id == body.info_id);
        let Some(bi) = bi else {
            return Ok(Vec::new());
        };
        let blocks = self.collect_blocks(body.kind, &obj, bi, &body.indices)?;
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        let ack = SyncBlockAck {
            kind: body.kind,
            object_id: body.object_id,
            info_id: body.info_id,
            blocks,
        };
        Ok(vec![self.envelope(Some(peer), stream, reply, &ack)?])
    }

    /// `SyncCreateBlockAck`, `SyncUpdateBlockAck` and `ForceSyncBlockAck`
    pub(crate) fn on_block_ack(&self, peer: PeerId, stream: Stream, kind: MsgKind, body: SyncBlockAck) -> Result<Vec<Outbound>> {
        let ctx = self.stores.ctx(stream);
        let mut info = ProcessInfo::default();
        let for_create = match kind {
            MsgKind::SyncCreateBlockAck => true,
            MsgKind::SyncUpdateBlockAck => false,
            _ => self
                .stores
                .objects
                .get(body.kind, &body.object_id)?
                .map_or(false, |o| {
                    matches!(o.status, Status::InternalSync | Status::Sync)
                        && o.block.as_ref().map_or(false, |b| b.id == body.info_id)
                }),
        };

        let progress: BlockProgress = if for_create {
            processor::receive_create_blocks(&ctx, body.kind, &body.object_id, &body.info_id, &body.blocks, &mut info)?
        } else {
            processor::receive_update_blocks(&ctx, body.kind, &body.object_id, &body.info_id, &body.blocks)?
        };
        debug!(
            entity = %self.entity_id,
            object = %body.object_id,
            stored = progress.stored,
            rejected = progress.rejected,
            missing = progress.missing.len(),
            "Took in blocks"
        );

        let mut out = Vec::new();
        if progress.stored > 0 && !progress.missing.is_empty() {
            let request = if for_create {
                MsgKind::SyncCreateBlock
            } else {
                MsgKind::SyncUpdateBlock
            };
            let body = SyncBlock {
                kind: body.kind,
                object_id: body.object_id,
                info_id: body.info_id,
                indices: progress.missing,
            };
            out.push(self.envelope(Some(peer), stream, request, &body)?);
        }
        out.extend(self.backfill_requests(stream, &info, Some(peer))?);
        Ok(out)
    }

    pub(crate) fn on_force_sync_media(&self, peer: PeerId, stream: Stream, body: SyncObject) -> Result<Vec<Outbound>> {
        let mut ack = ForceSyncMediaAck::default();
        for id in body.ids.iter().take(self.params.max_sync_object_ack) {
            let Some(obj) = self.stores.objects.get(ObjectKind::Media, id)? else {
                continue;
            };
            if let Some(bi) = &obj.block {
                let all: Vec<u32> = (0..bi.n_block).collect();
                let blocks = self.collect_blocks(ObjectKind::Media, &obj, bi, &all)?;
                ack.blocks.push(SyncBlockAck {
                    kind: ObjectKind::Media,
                    object_id: obj.id,
                    info_id: bi.id,
                    blocks,
                });
            }
            ack.objects.push(obj);
        }
        if ack.objects.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.envelope(Some(peer), stream, MsgKind::ForceSyncMediaAck, &ack)?])
    }

    pub(crate) fn on_force_sync_media_ack(
        &self,
        peer: PeerId,
        stream: Stream,
        body: ForceSyncMediaAck,
    ) -> Result<Vec<Outbound>> {
        let ctx = self.stores.ctx(stream);
        let mut info = ProcessInfo::default();
        for remote in &body.objects {
            processor::receive_create_object(&ctx, remote, &mut info)?;
        }
        for blocks in &body.blocks {
            processor::receive_create_blocks(
                &ctx,
                ObjectKind::Media,
                &blocks.object_id,
                &blocks.info_id,
                &blocks.blocks,
                &mut info,
            )?;
        }
        self.backfill_requests(stream, &info, Some(peer))
    }

    /// Repair requests for objects stuck waiting on peers
    pub(crate) fn repair_requests(&self, stream: Stream) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        for kind in stream_object_kinds(stream) {
            if !kind.has_blocks() {
                continue;
            }
            let mut stuck = Vec::new();
            for obj in self.stores.objects.list(*kind)? {
                let waiting_update = obj
                    .sync_info
                    .as_ref()
                    .map_or(false, |si| si.block.is_some() && matches!(si.status, Status::InternalSync | Status::Sync));
                if matches!(obj.status, Status::InternalSync) || waiting_update {
                    stuck.push(obj.id);
                }
                if obj.status == Status::Sync {
                    if let Some(bi) = &obj.block {
                        out.push(self.block_request(None, stream, MsgKind::ForceSyncBlock, &obj, bi)?);
                    }
                }
                if let Some(bi) = obj
                    .sync_info
                    .as_ref()
                    .filter(|si| si.status == Status::Sync)
                    .and_then(|si| si.block.as_ref())
                {
                    out.push(self.block_request(None, stream, MsgKind::ForceSyncBlock, &obj, bi)?);
                }
            }
            for chunk in stuck.chunks(self.params.max_sync_object_ack.max(1)) {
                let body = SyncObject {
                    kind: *kind,
                    ids: chunk.to_vec(),
                };
                let msg = if *kind == ObjectKind::Media {
                    MsgKind::ForceSyncMedia
                } else {
                    MsgKind::ForceSyncObject
                };
                out.push(self.envelope(None, stream, msg, &body)?);
            }
        }
        Ok(out)
    }
}

fn stream_object_kinds(stream: Stream) -> &'static [ObjectKind] {
    match stream {
        Stream::Master => &[ObjectKind::Master],
        Stream::Member => &[ObjectKind::Member],
        Stream::OpKey => &[ObjectKind::OpKey],
        Stream::Board => &[
            ObjectKind::Board,
            ObjectKind::Title,
            ObjectKind::Article,
            ObjectKind::Media,
            ObjectKind::Comment,
            ObjectKind::Reply,
        ],
        Stream::Friend => &[ObjectKind::Friend, ObjectKind::Message],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(ts: &[i64]) -> Vec<(Timestamp, Eid)> {
        ts.iter().map(|t| (Timestamp::new(*t, 0), Eid::new_random())).collect()
    }

    #[test]
    fn test_chunk_leaves_keeps_equal_ts_together() {
        let input = leaves(&[1, 2, 2, 2, 3, 4]);
        let chunks = chunk_leaves(input, Timestamp::ZERO, Timestamp::MAX, 2);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.2.len()).collect();
        assert_eq!(sizes, vec![4, 2]);
        assert_eq!(chunks[0].0, Timestamp::ZERO);
        assert_eq!(chunks[0].1, Timestamp::new(3, 0));
        assert_eq!(chunks[1].0, Timestamp::new(3, 0));
        assert_eq!(chunks[1].1, Timestamp::MAX);
    }

    #[test]
    fn test_chunk_leaves_empty_still_covers_range() {
        let chunks = chunk_leaves(Vec::new(), Timestamp::new(5, 0), Timestamp::MAX, 200);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].2.is_empty());
        assert_eq!(chunks[0].0, Timestamp::new(5, 0));
    }

    #[test]
    fn test_body_field_names() {
        let body = SyncOplogAck {
            start: Timestamp::ZERO,
            end: Timestamp::MAX,
            ids: vec![],
            last: true,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert!(v.get("TS").is_some());
        assert!(v.get("K").is_some());
        assert_eq!(v.get("F"), Some(&serde_json::Value::Bool(true)));

        let req = SyncBlock {
            kind: ObjectKind::Article,
            object_id: Eid::EMPTY,
            info_id: Eid::MAX,
            indices: vec![1],
        };
        let back: SyncBlock = serde_json::from_value(serde_json::to_value(&req).unwrap()).unwrap();
        assert_eq!(back.indices, vec![1]);
        assert_eq!(back.info_id, Eid::MAX);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(2).unwrap(), MerkleLevel::Day);
        assert!(matches!(parse_level(9), Err(ManagerError::BadMessage(_))));
    }
}
