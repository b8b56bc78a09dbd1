//! Per-entity protocol manager
//!
//! A [`ProtocolManager`] owns everything one entity needs on this node: the
//! stores, the authority table, the local operational keys and one session
//! per connected peer. It is synchronous; every call returns the messages
//! that should go out as a list of [`Outbound`]. [`EntityActor`] drives it
//! from a mailbox and a couple of timers.

use crate::authority::{sign_acceptance, Authority, AuthorityError};
use crate::block::{self, Block, BlockError};
use crate::config::{EntityType, ProtocolParams};
use crate::fix::{self, FixError};
use crate::handler::{CoSigner, EntityStores, HandleError, HandleResult, Handler, Source};
use crate::merkle::MerkleLevel;
use crate::oplog::Oplog;
use crate::oplog_store::OplogError;
use crate::opkey::{OpKeyError, OpKeyManager};
use crate::processor::{self, ProcessError, ProcessInfo};
use crate::storage::{Storage, StorageError};
use crate::sync::AddOplogs;
use parking_lot::RwLock;
use replica_core::crypto::KeyPair;
use replica_core::op::{
    Acceptance, CreateObjectData, DeleteObjectData, MasterOpData, MemberOpData, OpKeyOpData, UpdateObjectData,
};
use replica_core::{Eid, OpKind, OpPayload, Status, Stream, Timestamp};
use replica_net::{
    guarded_channel, FrameError, GuardedReceiver, GuardedSender, Message, MsgCode, MsgKind, PeerHealth, PeerId,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Streams in the order a session walks them
pub const SESSION_ORDER: [Stream; 5] = [Stream::Master, Stream::Member, Stream::OpKey, Stream::Board, Stream::Friend];

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
/// Oplogs held per peer while the streams they depend on reconcile
const MAX_DEFERRED_OPLOGS: usize = 4096;

/// Streams that must be reconciled with a peer before `stream` is taken from it
fn prerequisites(stream: Stream) -> &'static [Stream] {
    match stream {
        Stream::Master => &[],
        Stream::Member | Stream::OpKey => &[Stream::Master],
        Stream::Board | Stream::Friend => &[Stream::Master, Stream::Member, Stream::OpKey],
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Oplog error: {0}")]
    Oplog(#[from] OplogError),
    #[error("Handler error: {0}")]
    Handle(#[from] HandleError),
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
    #[error("Authority error: {0}")]
    Authority(#[from] AuthorityError),
    #[error("Operational key error: {0}")]
    OpKey(#[from] OpKeyError),
    #[error("Block error: {0}")]
    Block(#[from] BlockError),
    #[error("Fix error: {0}")]
    Fix(#[from] FixError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
    #[error("Not a master of this entity: {0}")]
    NotMaster(Eid),
    #[error("Unknown object: {0}")]
    UnknownObject(Eid),
    #[error("Oplog rejected: {0}")]
    Rejected(Eid),
    #[error("Bad message: {0}")]
    BadMessage(&'static str),
}

impl ManagerError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        use replica_core::ErrorKind;
        match self {
            ManagerError::Storage(e) => e.kind(),
            ManagerError::Oplog(e) => e.kind(),
            ManagerError::Handle(e) => e.kind(),
            ManagerError::Process(e) => e.kind(),
            ManagerError::Authority(e) => e.kind(),
            ManagerError::OpKey(e) => e.kind(),
            ManagerError::Block(e) => e.kind(),
            ManagerError::Fix(e) => e.kind(),
            ManagerError::Frame(e) => e.kind(),
            ManagerError::Core(e) => e.kind(),
            ManagerError::NotMaster(_) | ManagerError::Rejected(_) => ErrorKind::Authority,
            ManagerError::UnknownObject(_) | ManagerError::BadMessage(_) => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

// =============================================================================
// CLOCK
// =============================================================================

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// =============================================================================
// SESSIONS
// =============================================================================

/// What the caller should put on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Send { to: PeerId, message: Message },
    Broadcast { except: Option<PeerId>, message: Message },
    /// Close the session, the peer misbehaved
    Drop(PeerId),
}

/// Per-peer protocol state
#[derive(Debug)]
struct PeerSession {
    /// Streams whose first reconciliation has completed
    synced: HashSet<Stream>,
    health: PeerHealth,
    /// Merkle drill-downs per window
    retries: HashMap<(Stream, MerkleLevel, Timestamp), u32>,
    /// Oplogs that arrived ahead of their prerequisite streams
    deferred: Vec<(Stream, Vec<Oplog>)>,
}

impl PeerSession {
    fn new(strike_limit: u32) -> Self {
        Self {
            synced: HashSet::new(),
            health: PeerHealth::new(strike_limit, RECONNECT_BASE, RECONNECT_CAP),
            retries: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    fn ready_for(&self, stream: Stream) -> bool {
        prerequisites(stream).iter().all(|s| self.synced.contains(s))
    }

    fn deferred_len(&self) -> usize {
        self.deferred.iter().map(|(_, logs)| logs.len()).sum()
    }
}

// =============================================================================
// PROTOCOL MANAGER
// =============================================================================

pub struct ProtocolManager {
    pub(crate) entity_id: Eid,
    entity_type: EntityType,
    /// Our master id in this entity
    me: Eid,
    master_key: KeyPair,
    pub(crate) params: ProtocolParams,
    pub(crate) stores: EntityStores,
    authority: Authority,
    opkeys: OpKeyManager,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<PeerId, PeerSession>>,
}

impl ProtocolManager {
    pub fn new(
        storage: &Storage,
        entity_id: Eid,
        entity_type: EntityType,
        master_key: KeyPair,
        params: ProtocolParams,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let me = Eid::with_address_postfix(&master_key.address(), &entity_id);
        let stores = EntityStores::new(storage, entity_id);
        let authority = Authority::new(
            entity_id,
            entity_type,
            params.max_masters,
            params.opkey_grace_secs,
            params.expire_opkey_secs,
        );
        stores.reload_authority(&authority)?;
        let opkeys = OpKeyManager::new(
            stores.keys.clone(),
            entity_id,
            master_key.clone(),
            params.renew_opkey_secs,
            params.expire_opkey_secs,
        );
        Ok(Self {
            entity_id,
            entity_type,
            me,
            master_key,
            params,
            stores,
            authority,
            opkeys,
            clock,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Create a new entity owned by `master_key` and issue its first opkey
    pub fn create_entity(
        storage: &Storage,
        entity_type: EntityType,
        master_key: KeyPair,
        params: ProtocolParams,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, Vec<Outbound>)> {
        let entity_id = Eid::with_address(&master_key.address());
        let pm = Self::new(storage, entity_id, entity_type, master_key, params, clock)?;
        let now = pm.now();
        let mut genesis = Oplog::new(
            entity_id,
            OpKind::CreateMaster,
            pm.me,
            pm.me,
            None,
            &OpPayload::Master(MasterOpData::default()),
            now,
        )?;
        genesis.sign(&pm.master_key)?;
        genesis.master_sign(pm.me, &pm.master_key, now)?;
        genesis.set_alive(pm.me);

        let result = pm
            .handler(None)
            .handle_oplogs(Stream::Master, vec![genesis.clone()], Source::Local, now)?;
        if result.alive.is_empty() {
            return Err(ManagerError::Rejected(genesis.id));
        }
        let mut out = pm.after_handle(Stream::Master, None, result)?;
        out.extend(pm.renew_opkey()?);
        info!(entity = %entity_id, master = %pm.me, entity_type = ?entity_type, "Created entity");
        Ok((pm, out))
    }

    pub fn entity_id(&self) -> Eid {
        self.entity_id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn me(&self) -> Eid {
        self.me
    }

    pub fn stores(&self) -> &EntityStores {
        &self.stores
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn opkeys(&self) -> &OpKeyManager {
        &self.opkeys
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Run the one-shot fixes, then finish whatever a previous run left
    /// half-processed.
    pub fn start(&self) -> Result<Vec<Outbound>> {
        let report = fix::run(&self.stores)?;
        self.stores.reload_authority(&self.authority)?;

        let mut info = ProcessInfo::default();
        let mut replayed = 0;
        for stream in SESSION_ORDER {
            let ctx = self.stores.ctx(stream);
            for log in self.stores.oplogs(stream).unsynced()? {
                let outcome = processor::process_alive(&ctx, &log, &mut info)?;
                processor::record(&ctx, &log.id, outcome, &mut info)?;
                replayed += 1;
            }
        }
        info!(
            entity = %self.entity_id,
            prev_log_fixed = report.prev_log_ids,
            duplicate_masters = report.duplicate_masters,
            replayed,
            "Protocol manager started"
        );
        self.renew_opkey()
    }

    fn handler<'a>(&'a self, signer: Option<&'a CoSigner>) -> Handler<'a> {
        Handler {
            stores: &self.stores,
            authority: &self.authority,
            params: &self.params,
            signer,
        }
    }

    fn co_signer(&self, now: Timestamp) -> Result<CoSigner> {
        let opkey = match self.opkeys.current(now) {
            Ok((_, key)) => Some(key),
            Err(OpKeyError::NoValidKey(_)) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(CoSigner {
            id: self.me,
            master_key: self.master_key.clone(),
            opkey,
        })
    }

    pub(crate) fn envelope<T: Serialize>(
        &self,
        target: Option<PeerId>,
        stream: Stream,
        kind: MsgKind,
        body: &T,
    ) -> Result<Outbound> {
        let message = Message::new(MsgCode::Stream(stream, kind), self.entity_id, body)?;
        Ok(match target {
            Some(to) => Outbound::Send { to, message },
            None => Outbound::Broadcast { except: None, message },
        })
    }

    // =========================================================================
    // LOCAL OPERATIONS
    // =========================================================================

    /// Sign an oplog as ours and run it through the pipeline
    pub fn create_oplog(
        &self,
        kind: OpKind,
        object_id: Eid,
        prev: Option<Eid>,
        payload: &OpPayload,
    ) -> Result<(Oplog, Vec<Outbound>)> {
        let now = self.now();
        if !self.authority.is_master_at(&self.me, now) {
            return Err(ManagerError::NotMaster(self.me));
        }
        let stream = kind.stream();
        let signer = self.co_signer(now)?;
        let key = signer
            .key_for(stream)
            .ok_or(ManagerError::OpKey(OpKeyError::NoValidKey(now)))?;

        let mut log = Oplog::new(self.entity_id, kind, self.me, object_id, prev, payload, now)?;
        log.sign(key)?;
        log.internal_sign(self.me, key, now)?;

        let result = self
            .handler(Some(&signer))
            .handle_oplogs(stream, vec![log.clone()], Source::Local, now)?;
        let stored = self.stores.oplogs(stream).get(&log.id)?.unwrap_or(log);
        if stored.status() == Status::Failed {
            return Err(ManagerError::Rejected(stored.id));
        }
        debug!(entity = %self.entity_id, oplog = %stored.id, ?kind, status = ?stored.status(), "Created oplog");
        let out = self.after_handle(stream, None, result)?;
        Ok((stored, out))
    }

    /// Create an object, optionally with content split into blocks
    pub fn create_object(
        &self,
        kind: OpKind,
        parent: Option<Eid>,
        attrs: Value,
        content: Option<&[String]>,
    ) -> Result<(Eid, Vec<Outbound>)> {
        let object_id = Eid::new_random();
        let (meta, blocks) = match content {
            Some(lines) => {
                let (meta, blocks) = block::split(lines, self.params.lines_per_block)?;
                (Some(meta), blocks)
            }
            None => (None, Vec::new()),
        };
        let info_id = meta.as_ref().map(|m| m.id);
        let payload = OpPayload::CreateObject(CreateObjectData {
            parent,
            block: meta,
            attrs,
        });
        let (_, out) = self.create_oplog(kind, object_id, None, &payload)?;

        if let Some(info_id) = info_id {
            let indexed = index_blocks(blocks);
            let mut info = ProcessInfo::default();
            let ctx = self.stores.ctx(kind.stream());
            processor::receive_create_blocks(&ctx, kind.object_kind(), &object_id, &info_id, &indexed, &mut info)?;
        }
        Ok((object_id, out))
    }

    /// Update attributes and, when given, replace the content
    pub fn update_object(
        &self,
        kind: OpKind,
        object_id: Eid,
        attrs: Value,
        content: Option<&[String]>,
    ) -> Result<Vec<Outbound>> {
        let obj = self
            .stores
            .objects
            .get(kind.object_kind(), &object_id)?
            .ok_or(ManagerError::UnknownObject(object_id))?;
        let (meta, blocks) = match content {
            Some(lines) => {
                let (meta, blocks) = block::split(lines, self.params.lines_per_block)?;
                (Some(meta), blocks)
            }
            None => (None, Vec::new()),
        };
        let info_id = meta.as_ref().map(|m| m.id);
        let payload = OpPayload::UpdateObject(UpdateObjectData { block: meta, attrs });
        let (_, out) = self.create_oplog(kind, object_id, Some(obj.log_id), &payload)?;

        if let Some(info_id) = info_id {
            let ctx = self.stores.ctx(kind.stream());
            processor::receive_update_blocks(&ctx, kind.object_kind(), &object_id, &info_id, &index_blocks(blocks))?;
        }
        Ok(out)
    }

    pub fn delete_object(&self, kind: OpKind, object_id: Eid) -> Result<Vec<Outbound>> {
        let obj = self
            .stores
            .objects
            .get(kind.object_kind(), &object_id)?
            .ok_or(ManagerError::UnknownObject(object_id))?;
        let payload = OpPayload::DeleteObject(DeleteObjectData {
            media_ids: obj.media_ids(),
        });
        let (_, out) = self.create_oplog(kind, object_id, Some(obj.log_id), &payload)?;
        Ok(out)
    }

    /// Signed acceptance an invitee hands to the inviting master
    pub fn accept_invitation(key: &KeyPair, entity_id: &Eid, inviter_id: &Eid) -> Result<(Eid, Acceptance)> {
        let master_id = Eid::with_address_postfix(&key.address(), entity_id);
        Ok((master_id, sign_acceptance(key, entity_id, &master_id, inviter_id)?))
    }

    pub fn add_master(&self, master_id: Eid, acceptance: Acceptance) -> Result<Vec<Outbound>> {
        let payload = OpPayload::Master(MasterOpData {
            acceptance: Some(acceptance),
            to: None,
        });
        let (_, out) = self.create_oplog(OpKind::CreateMaster, master_id, None, &payload)?;
        info!(entity = %self.entity_id, master = %master_id, "Invited master");
        Ok(out)
    }

    pub fn add_member(&self, member_id: Eid, attrs: Value) -> Result<Vec<Outbound>> {
        let payload = OpPayload::Member(MemberOpData { attrs, to: None });
        let (_, out) = self.create_oplog(OpKind::AddMember, member_id, None, &payload)?;
        Ok(out)
    }

    /// Announce a fresh opkey when the newest is due and revoke expired ones
    pub fn renew_opkey(&self) -> Result<Vec<Outbound>> {
        let now = self.now();
        if !self.authority.is_master_at(&self.me, now) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if self.opkeys.needs_renewal(now)? {
            let new = self.opkeys.create(now)?;
            let (_, more) = self.create_oplog(OpKind::CreateOpKey, new.id, None, &OpPayload::OpKey(new.payload))?;
            out.extend(more);
            info!(entity = %self.entity_id, opkey = %new.id, "Renewed operational key");
        }
        for id in self.opkeys.expired(now)? {
            if let Some(obj) = self.stores.objects.get(replica_core::ObjectKind::OpKey, &id)? {
                if obj.status == Status::Alive {
                    let payload = OpPayload::OpKey(OpKeyOpData::default());
                    let (_, more) = self.create_oplog(OpKind::RevokeOpKey, id, Some(obj.log_id), &payload)?;
                    out.extend(more);
                }
            }
            self.opkeys.mark_revoked(&id)?;
            debug!(entity = %self.entity_id, opkey = %id, "Revoked expired operational key");
        }
        Ok(out)
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    /// Oplogs from a peer. A stream is held back until the streams its
    /// authority depends on have been reconciled with that peer: member and
    /// opkey wait for master, app streams wait for all three.
    pub(crate) fn ingest(&self, peer: PeerId, stream: Stream, oplogs: Vec<Oplog>) -> Result<Vec<Outbound>> {
        if oplogs.is_empty() {
            return Ok(Vec::new());
        }
        {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(&peer) else {
                debug!(entity = %self.entity_id, stream = stream.name(), %peer, "Ignored oplogs without a session");
                return Ok(Vec::new());
            };
            if !session.ready_for(stream) {
                if session.deferred_len() + oplogs.len() <= MAX_DEFERRED_OPLOGS {
                    debug!(entity = %self.entity_id, stream = stream.name(), %peer, n = oplogs.len(), "Deferred oplogs");
                    session.deferred.push((stream, oplogs));
                } else {
                    debug!(entity = %self.entity_id, stream = stream.name(), %peer, "Deferred queue full, ignored oplogs");
                }
                return Ok(Vec::new());
            }
        }
        self.handle_from(peer, stream, oplogs)
    }

    fn handle_from(&self, peer: PeerId, stream: Stream, oplogs: Vec<Oplog>) -> Result<Vec<Outbound>> {
        let now = self.now();
        let signer = self.co_signer(now)?;
        let result = self
            .handler(Some(&signer))
            .handle_oplogs(stream, oplogs, Source::Peer(peer), now)?;
        self.after_handle(stream, Some(peer), result)
    }

    fn after_handle(&self, stream: Stream, source: Option<PeerId>, result: HandleResult) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        if let Some(peer) = source {
            if result.fatal || (result.strikes > 0 && self.strike(peer, result.strikes)) {
                warn!(entity = %self.entity_id, %peer, strikes = result.strikes, fatal = result.fatal, "Dropping peer");
                out.push(Outbound::Drop(peer));
                return Ok(out);
            }
        }

        for (kind, oplogs) in [
            (MsgKind::AddOplogs, result.alive),
            (MsgKind::AddPendingOplogs, result.pending),
        ] {
            for chunk in oplogs.chunks(self.params.max_sync_oplog_ack.max(1)) {
                let body = AddOplogs { oplogs: chunk.to_vec() };
                let message = Message::new(MsgCode::Stream(stream, kind), self.entity_id, &body)?;
                out.push(Outbound::Broadcast { except: source, message });
            }
        }

        if let Some(peer) = source {
            out.extend(self.backfill_requests(stream, &result.info, Some(peer))?);
        }
        if stream == Stream::Master && source.is_some() {
            out.extend(self.renew_opkey()?);
        }
        Ok(out)
    }

    fn strike(&self, peer: PeerId, n: u32) -> bool {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(peer)
            .or_insert_with(|| PeerSession::new(self.params.strike_limit));
        let mut drop = false;
        for _ in 0..n {
            drop |= session.health.strike();
        }
        drop
    }

    pub fn strikes(&self, peer: &PeerId) -> u32 {
        self.sessions.read().get(peer).map_or(0, |s| s.health.strikes())
    }

    pub fn is_synced(&self, peer: &PeerId, stream: Stream) -> bool {
        self.sessions
            .read()
            .get(peer)
            .map_or(false, |s| s.synced.contains(&stream))
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.sessions.read().keys().copied().collect()
    }

    /// Count a Merkle drill-down of one window. False once the retries are spent.
    pub(crate) fn take_retry(&self, peer: PeerId, stream: Stream, level: MerkleLevel, start: Timestamp) -> bool {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(peer)
            .or_insert_with(|| PeerSession::new(self.params.strike_limit));
        let n = session.retries.entry((stream, level, start)).or_insert(0);
        *n += 1;
        *n <= self.params.max_sync_retries
    }

    /// The last chunk of a stream's reconciliation arrived. The first time,
    /// move on to the next stream, and after the last one ask for pending
    /// oplogs on every stream.
    pub(crate) fn stream_synced(&self, peer: PeerId, stream: Stream) -> Result<Vec<Outbound>> {
        let first = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .entry(peer)
                .or_insert_with(|| PeerSession::new(self.params.strike_limit));
            session.retries.retain(|(s, _, _), _| *s != stream);
            session.synced.insert(stream)
        };
        if !first {
            return Ok(Vec::new());
        }
        debug!(entity = %self.entity_id, stream = stream.name(), %peer, "Stream synced");

        let mut out = self.release_deferred(peer)?;
        if out.iter().any(|o| matches!(o, Outbound::Drop(_))) {
            return Ok(out);
        }
        let next = SESSION_ORDER
            .iter()
            .position(|s| *s == stream)
            .and_then(|i| SESSION_ORDER.get(i + 1));
        match next {
            Some(next) => out.push(self.sync_oplog(peer, *next)?),
            None => {
                for s in SESSION_ORDER {
                    out.push(self.sync_pending_oplog(peer, s)?);
                }
            }
        }
        Ok(out)
    }

    /// Handle the deferred batches whose prerequisite streams are now synced
    fn release_deferred(&self, peer: PeerId) -> Result<Vec<Outbound>> {
        let ready = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(&peer) else {
                return Ok(Vec::new());
            };
            let (ready, held): (Vec<_>, Vec<_>) = std::mem::take(&mut session.deferred)
                .into_iter()
                .partition(|(stream, _)| session.ready_for(*stream));
            session.deferred = held;
            ready
        };
        let mut out = Vec::new();
        for (stream, oplogs) in ready {
            out.extend(self.handle_from(peer, stream, oplogs)?);
            if out.iter().any(|o| matches!(o, Outbound::Drop(_))) {
                break;
            }
        }
        Ok(out)
    }

    pub fn on_peer_connected(&self, peer: PeerId) -> Result<Vec<Outbound>> {
        self.sessions
            .write()
            .insert(peer, PeerSession::new(self.params.strike_limit));
        debug!(entity = %self.entity_id, %peer, "Session opened");
        Ok(vec![self.sync_oplog(peer, Stream::Master)?])
    }

    pub fn on_peer_disconnected(&self, peer: &PeerId) {
        if self.sessions.write().remove(peer).is_some() {
            debug!(entity = %self.entity_id, %peer, "Session closed");
        }
    }

    /// Dispatch one message from `peer`
    pub fn handle_message(&self, peer: PeerId, msg: &Message) -> Result<Vec<Outbound>> {
        if msg.entity_id != self.entity_id {
            return Err(ManagerError::BadMessage("entity"));
        }
        let MsgCode::Stream(stream, kind) = msg.code else {
            return Ok(Vec::new());
        };
        use crate::sync::{AddOplog, SyncBlock, SyncBlockAck, SyncObject, SyncObjectAck};

        match kind {
            MsgKind::AddOplog | MsgKind::AddPendingOplog => {
                let body: AddOplog = msg.decode_body()?;
                self.ingest(peer, stream, vec![body.oplog])
            }
            MsgKind::AddOplogs
            | MsgKind::AddPendingOplogs
            | MsgKind::SyncOplogNewOplogsAck
            | MsgKind::SyncPendingOplogAck => {
                let body: AddOplogs = msg.decode_body()?;
                self.ingest(peer, stream, body.oplogs)
            }
            MsgKind::SyncOplog => self.on_sync_oplog(peer, stream, msg.decode_body()?),
            MsgKind::SyncOplogAck => self.on_sync_oplog_ack(peer, stream, msg.decode_body()?),
            MsgKind::ForceSyncOplogByMerkle | MsgKind::ForceSyncOplogByMerkleAck => {
                self.on_force_sync_by_merkle(peer, stream, msg.decode_body()?)
            }
            MsgKind::ForceSyncOplogByOplogAck => self.on_force_sync_by_oplog_ack(peer, stream, msg.decode_body()?),
            MsgKind::InvalidSyncOplog => self.on_invalid_sync_oplog(peer, stream, msg.decode_body()?),
            MsgKind::SyncOplogNewOplogs => self.on_new_oplogs(peer, stream, msg.decode_body()?),
            MsgKind::SyncPendingOplog => self.on_sync_pending_oplog(peer, stream, msg.decode_body()?),
            MsgKind::SyncCreateObject => {
                let body: SyncObject = msg.decode_body()?;
                self.on_object_request(peer, stream, MsgKind::SyncCreateObjectAck, body)
            }
            MsgKind::SyncUpdateObject => {
                let body: SyncObject = msg.decode_body()?;
                self.on_object_request(peer, stream, MsgKind::SyncUpdateObjectAck, body)
            }
            MsgKind::ForceSyncObject => {
                let body: SyncObject = msg.decode_body()?;
                self.on_object_request(peer, stream, MsgKind::ForceSyncObjectAck, body)
            }
            MsgKind::SyncCreateObjectAck | MsgKind::SyncUpdateObjectAck | MsgKind::ForceSyncObjectAck => {
                let body: SyncObjectAck = msg.decode_body()?;
                self.on_object_ack(peer, stream, kind, body)
            }
            MsgKind::SyncCreateBlock => {
                let body: SyncBlock = msg.decode_body()?;
                self.on_block_request(peer, stream, MsgKind::SyncCreateBlockAck, body)
            }
            MsgKind::SyncUpdateBlock => {
                let body: SyncBlock = msg.decode_body()?;
                self.on_block_request(peer, stream, MsgKind::SyncUpdateBlockAck, body)
            }
            MsgKind::ForceSyncBlock => {
                let body: SyncBlock = msg.decode_body()?;
                self.on_block_request(peer, stream, MsgKind::ForceSyncBlockAck, body)
            }
            MsgKind::SyncCreateBlockAck | MsgKind::SyncUpdateBlockAck | MsgKind::ForceSyncBlockAck => {
                let body: SyncBlockAck = msg.decode_body()?;
                self.on_block_ack(peer, stream, kind, body)
            }
            MsgKind::ForceSyncMedia => self.on_force_sync_media(peer, stream, msg.decode_body()?),
            MsgKind::ForceSyncMediaAck => self.on_force_sync_media_ack(peer, stream, msg.decode_body()?),
        }
    }

    // =========================================================================
    // PERIODIC WORK
    // =========================================================================

    /// Anti-entropy round: renew keys, reconcile every stream with every
    /// peer, and chase content still missing.
    pub fn tick(&self) -> Result<Vec<Outbound>> {
        let mut out = self.renew_opkey()?;
        let peers = {
            let mut sessions = self.sessions.write();
            for session in sessions.values_mut() {
                session.retries.clear();
            }
            sessions
                .iter()
                .map(|(id, s)| (*id, s.synced.contains(&Stream::Master)))
                .collect::<Vec<_>>()
        };
        for (peer, master_synced) in &peers {
            if !master_synced {
                out.push(self.sync_oplog(*peer, Stream::Master)?);
                continue;
            }
            for stream in SESSION_ORDER {
                out.push(self.sync_oplog(*peer, stream)?);
                out.push(self.sync_pending_oplog(*peer, stream)?);
            }
        }
        if !peers.is_empty() {
            for stream in SESSION_ORDER {
                out.extend(self.repair_requests(stream)?);
            }
        }
        Ok(out)
    }

    /// Fold dirty hours into every Merkle tree
    pub fn regenerate_merkle(&self) -> Result<usize> {
        let mut hours = 0;
        for stream in SESSION_ORDER {
            hours += self.stores.oplogs(stream).merkle().regenerate()?;
        }
        Ok(hours)
    }
}

fn index_blocks(blocks: Vec<Block>) -> Vec<(u32, Block)> {
    blocks
        .into_iter()
        .enumerate()
        .map(|(i, b)| (i as u32, b))
        .collect()
}

// =============================================================================
// ACTOR
// =============================================================================

/// Input to an entity actor
#[derive(Debug)]
pub enum Command {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Message { from: PeerId, message: Message },
}

/// Drives one protocol manager: mailbox, anti-entropy and Merkle timers
pub struct EntityActor {
    pm: ProtocolManager,
    mailbox: GuardedReceiver<Command>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: broadcast::Receiver<()>,
    sync_interval: Duration,
    merkle_interval: Duration,
}

impl EntityActor {
    pub fn spawn(
        pm: ProtocolManager,
        outbound: mpsc::Sender<Outbound>,
        shutdown: broadcast::Receiver<()>,
        sync_interval: Duration,
        merkle_interval: Duration,
        capacity: usize,
    ) -> (GuardedSender<Command>, JoinHandle<()>) {
        let (tx, mailbox) = guarded_channel(capacity);
        let actor = Self {
            pm,
            mailbox,
            outbound,
            shutdown,
            sync_interval,
            merkle_interval,
        };
        (tx, tokio::spawn(actor.run()))
    }

    async fn run(mut self) {
        let entity = self.pm.entity_id();
        let started = self.pm.start();
        self.emit(started).await;

        let mut sync_ticker = interval(self.sync_interval);
        let mut merkle_ticker = interval(self.merkle_interval);
        loop {
            tokio::select! {
                cmd = self.mailbox.recv() => {
                    let Some(cmd) = cmd else { break };
                    let result = match cmd {
                        Command::PeerConnected(peer) => self.pm.on_peer_connected(peer),
                        Command::PeerDisconnected(peer) => {
                            self.pm.on_peer_disconnected(&peer);
                            Ok(Vec::new())
                        }
                        Command::Message { from, message } => self.pm.handle_message(from, &message),
                    };
                    self.emit(result).await;
                }
                _ = sync_ticker.tick() => {
                    let result = self.pm.tick();
                    self.emit(result).await;
                }
                _ = merkle_ticker.tick() => {
                    match self.pm.regenerate_merkle() {
                        Ok(0) => {}
                        Ok(hours) => debug!(%entity, hours, "Regenerated Merkle trees"),
                        Err(e) => warn!(%entity, "Merkle regeneration failed: {}", e),
                    }
                }
                _ = self.shutdown.recv() => {
                    info!(%entity, "Entity actor stopping");
                    break;
                }
            }
        }
        self.mailbox.close();
    }

    async fn emit(&self, result: Result<Vec<Outbound>>) {
        match result {
            Ok(out) => {
                for item in out {
                    if self.outbound.send(item).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == replica_core::ErrorKind::Fatal => {
                error!(entity = %self.pm.entity_id(), "Protocol error: {}", e)
            }
            Err(e) => warn!(entity = %self.pm.entity_id(), "Protocol error: {}", e),
        }
    }
}
