//! Two managers wired back to back through an in-memory queue

use crate::config::{EntityType, ProtocolParams};
use crate::manager::{Clock, Outbound, ProtocolManager};
use crate::oplog::Oplog;
use crate::storage::{Order, Storage};
use crate::sync::{AddOplogs, SyncBlockAck};
use parking_lot::Mutex;
use replica_core::crypto::KeyPair;
use replica_core::op::CreateObjectData;
use replica_core::{Eid, ObjectKind, OpKind, OpPayload, Status, Stream, Timestamp};
use replica_net::{Message, MsgCode, MsgKind, PeerId};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// 2021-03-03T00:00:00Z
const DAY: i64 = 1_614_729_600;

pub(crate) struct ManualClock(Mutex<Timestamp>);

impl ManualClock {
    pub(crate) fn new(ts: Timestamp) -> Self {
        Self(Mutex::new(ts))
    }

    pub(crate) fn set(&self, ts: Timestamp) {
        *self.0.lock() = ts;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.0.lock()
    }
}

struct Node {
    id: PeerId,
    pm: ProtocolManager,
    clock: Arc<ManualClock>,
    _storage: Storage,
    _dir: tempfile::TempDir,
}

fn params() -> ProtocolParams {
    ProtocolParams {
        lines_per_block: 1,
        ..ProtocolParams::default()
    }
}

fn founder(ts: i64) -> Node {
    founder_of(EntityType::Board, ts)
}

fn founder_of(entity_type: EntityType, ts: i64) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let clock = Arc::new(ManualClock::new(Timestamp::new(ts, 0)));
    let (pm, _) =
        ProtocolManager::create_entity(&storage, entity_type, KeyPair::generate(), params(), clock.clone())
            .unwrap();
    Node {
        id: Eid::new_random(),
        pm,
        clock,
        _storage: storage,
        _dir: dir,
    }
}

fn joiner(entity_id: Eid, key: KeyPair, ts: i64) -> Node {
    joiner_of(EntityType::Board, entity_id, key, ts)
}

fn joiner_of(entity_type: EntityType, entity_id: Eid, key: KeyPair, ts: i64) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let clock = Arc::new(ManualClock::new(Timestamp::new(ts, 0)));
    let pm = ProtocolManager::new(&storage, entity_id, entity_type, key, params(), clock.clone()).unwrap();
    Node {
        id: Eid::new_random(),
        pm,
        clock,
        _storage: storage,
        _dir: dir,
    }
}

/// A founder plus a second node invited as master
fn founder_and_master(ts: i64) -> (Node, Node) {
    founder_and_master_of(EntityType::Board, ts)
}

fn founder_and_master_of(entity_type: EntityType, ts: i64) -> (Node, Node) {
    let a = founder_of(entity_type, ts);
    let key = KeyPair::generate();
    let (mid, acceptance) = ProtocolManager::accept_invitation(&key, &a.pm.entity_id(), &a.pm.me()).unwrap();
    a.pm.add_master(mid, acceptance).unwrap();
    let b = joiner_of(entity_type, a.pm.entity_id(), key, ts);
    assert_eq!(b.pm.me(), mid);
    (a, b)
}

fn set_time(nodes: [&Node; 2], ts: i64) {
    for n in nodes {
        n.clock.set(Timestamp::new(ts, 0));
    }
}

fn kind_of(msg: &Message) -> Option<MsgKind> {
    match msg.code {
        MsgCode::Stream(_, kind) => Some(kind),
        MsgCode::Session(_) => None,
    }
}

/// Deliver until both sides go quiet. Returns the kinds delivered.
fn pump<F>(nodes: [&Node; 2], initial: Vec<(usize, Outbound)>, mut filter: F) -> Vec<MsgKind>
where
    F: FnMut(&Message) -> Option<Message>,
{
    let mut queue: VecDeque<(usize, Message)> = VecDeque::new();
    let route = |queue: &mut VecDeque<(usize, Message)>, from: usize, out: Outbound| {
        let to = 1 - from;
        match out {
            Outbound::Send { to: peer, message } => {
                assert_eq!(peer, nodes[to].id);
                queue.push_back((to, message));
            }
            Outbound::Broadcast { except, message } => {
                if except != Some(nodes[to].id) {
                    queue.push_back((to, message));
                }
            }
            Outbound::Drop(peer) => panic!("node {} dropped {}", from, peer),
        }
    };
    for (from, out) in initial {
        route(&mut queue, from, out);
    }

    let mut delivered = Vec::new();
    let mut steps = 0;
    while let Some((to, message)) = queue.pop_front() {
        steps += 1;
        assert!(steps < 20_000, "pump did not settle");
        let Some(message) = filter(&message) else {
            continue;
        };
        if let Some(kind) = kind_of(&message) {
            delivered.push(kind);
        }
        let out = nodes[to].pm.handle_message(nodes[1 - to].id, &message).unwrap();
        for item in out {
            route(&mut queue, to, item);
        }
    }
    delivered
}

fn pass(msg: &Message) -> Option<Message> {
    Some(msg.clone())
}

fn tagged(from: usize, out: Vec<Outbound>) -> Vec<(usize, Outbound)> {
    out.into_iter().map(|o| (from, o)).collect()
}

fn connect(a: &Node, b: &Node) -> Vec<(usize, Outbound)> {
    let mut out = tagged(0, a.pm.on_peer_connected(b.id).unwrap());
    out.extend(tagged(1, b.pm.on_peer_connected(a.id).unwrap()));
    out
}

fn tick(a: &Node, b: &Node) -> Vec<(usize, Outbound)> {
    let mut out = tagged(0, a.pm.tick().unwrap());
    out.extend(tagged(1, b.pm.tick().unwrap()));
    out
}

/// Connect and run an extra anti-entropy round
fn settle(a: &Node, b: &Node) {
    let initial = connect(a, b);
    pump([a, b], initial, pass);
    let initial = tick(a, b);
    pump([a, b], initial, pass);
}

fn lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("line {}", i)).collect()
}

fn board_root(n: &Node) -> replica_core::Address {
    n.pm.stores().oplogs(Stream::Board).root(n.pm.now()).unwrap()
}

#[test]
fn test_article_with_blocks_replicates() {
    let a = founder(DAY);
    let b = joiner(a.pm.entity_id(), KeyPair::generate(), DAY);
    set_time([&a, &b], DAY + 100);
    let content = lines(3);
    let (article, _) = a
        .pm
        .create_object(OpKind::CreateArticle, None, json!({"title": "hello"}), Some(&content))
        .unwrap();

    let initial = connect(&a, &b);
    let kinds = pump([&a, &b], initial, pass);
    assert!(kinds.contains(&MsgKind::SyncCreateObject));
    assert!(kinds.contains(&MsgKind::SyncCreateBlockAck));

    let obj = b.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().unwrap();
    assert_eq!(obj.status, Status::Alive);
    let bi = obj.block.as_ref().unwrap();
    assert_eq!(bi.n_block, 3);
    let stored = b.pm.stores().blocks.content(ObjectKind::Article, &article, bi).unwrap();
    assert_eq!(stored, Some(content));
    assert_eq!(board_root(&a), board_root(&b));
    assert!(b.pm.is_synced(&a.id, Stream::Friend));
}

#[test]
fn test_concurrent_update_and_delete_converge() {
    let (a, b) = founder_and_master(DAY);
    set_time([&a, &b], DAY + 100);
    settle(&a, &b);
    assert!(b.pm.opkeys().current(b.pm.now()).is_ok());

    let (article, _) = a
        .pm
        .create_object(OpKind::CreateArticle, None, json!({"title": "v1"}), None)
        .unwrap();
    let initial = tick(&a, &b);
    pump([&a, &b], initial, pass);
    assert!(b.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().is_some());

    set_time([&a, &b], DAY + 200);
    a.pm.update_object(OpKind::UpdateArticle, article, json!({"title": "v2"}), None)
        .unwrap();
    b.pm.delete_object(OpKind::DeleteArticle, article).unwrap();

    set_time([&a, &b], DAY + 300);
    let initial = tick(&a, &b);
    pump([&a, &b], initial, pass);

    let deleted = OpKind::DeleteArticle.delete_statuses()[2];
    for n in [&a, &b] {
        let obj = n.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().unwrap();
        assert_eq!(obj.status, deleted);
    }
    assert_eq!(board_root(&a), board_root(&b));
}

#[test]
fn test_missing_block_is_refetched() {
    let a = founder(DAY);
    let b = joiner(a.pm.entity_id(), KeyPair::generate(), DAY);
    set_time([&a, &b], DAY + 100);
    let content = lines(3);
    let (article, _) = a
        .pm
        .create_object(OpKind::CreateArticle, None, Value::Null, Some(&content))
        .unwrap();

    let mut block_requests = 0;
    let initial = connect(&a, &b);
    pump([&a, &b], initial, |msg| match kind_of(msg) {
        Some(MsgKind::SyncCreateBlock) => {
            block_requests += 1;
            (block_requests == 1).then(|| msg.clone())
        }
        Some(MsgKind::SyncCreateBlockAck) => {
            let mut body: SyncBlockAck = msg.decode_body().unwrap();
            body.blocks.retain(|(idx, _)| *idx != 1);
            Some(Message::new(msg.code, msg.entity_id, &body).unwrap())
        }
        _ => Some(msg.clone()),
    });
    assert!(block_requests > 1);

    let obj = b.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().unwrap();
    assert_eq!(obj.status, Status::Sync);
    let bi = obj.block.as_ref().unwrap();
    assert!(bi.has(0) && !bi.has(1) && bi.has(2));

    let initial = tick(&a, &b);
    let kinds = pump([&a, &b], initial, pass);
    assert!(kinds.contains(&MsgKind::ForceSyncBlockAck));
    let obj = b.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().unwrap();
    assert_eq!(obj.status, Status::Alive);
    let stored = b
        .pm
        .stores()
        .blocks
        .content(ObjectKind::Article, &article, obj.block.as_ref().unwrap())
        .unwrap();
    assert_eq!(stored, Some(content));
}

fn signed_with(key: &KeyPair, pm: &ProtocolManager, ts: Timestamp) -> Oplog {
    let mut log = Oplog::new(
        pm.entity_id(),
        OpKind::CreateArticle,
        pm.me(),
        Eid::new_random(),
        None,
        &OpPayload::CreateObject(CreateObjectData::default()),
        ts,
    )
    .unwrap();
    log.sign(key).unwrap();
    log.internal_sign(pm.me(), key, ts).unwrap();
    log.master_sign(pm.me(), key, ts).unwrap();
    log.set_alive(pm.me());
    log
}

#[test]
fn test_opkey_honoured_until_expiry() {
    let a = founder(DAY);
    let b = joiner(a.pm.entity_id(), KeyPair::generate(), DAY);
    settle(&a, &b);
    let (_, k1) = a.pm.opkeys().current(Timestamp::new(DAY, 0)).unwrap();
    let expire = a.pm.params.expire_opkey_secs;

    let inside = signed_with(&k1, &a.pm, Timestamp::new(DAY + expire - 10, 0));
    let outside = signed_with(&k1, &a.pm, Timestamp::new(DAY + expire + 1000, 0));
    b.clock.set(Timestamp::new(DAY + expire + 1000, 0));
    for log in [&inside, &outside] {
        let msg = Message::new(
            MsgCode::Stream(Stream::Board, MsgKind::AddOplogs),
            a.pm.entity_id(),
            &AddOplogs {
                oplogs: vec![log.clone()],
            },
        )
        .unwrap();
        b.pm.handle_message(a.id, &msg).unwrap();
    }

    let store = b.pm.stores().oplogs(Stream::Board);
    assert_eq!(store.get(&inside.id).unwrap().unwrap().status(), Status::Alive);
    assert_eq!(store.get(&outside.id).unwrap().unwrap().status(), Status::Failed);
    assert_eq!(b.pm.strikes(&a.id), 1);
    assert!(b.pm.stores().objects.get(ObjectKind::Article, &outside.object_id).unwrap().is_none());
}

#[test]
fn test_merkle_drill_down_finds_missing_oplog() {
    let a = founder(DAY);
    let b = joiner(a.pm.entity_id(), KeyPair::generate(), DAY);
    set_time([&a, &b], DAY + 10);
    settle(&a, &b);

    let h3 = DAY + 3 * 3600;
    set_time([&a, &b], h3 + 10);
    let (first, _) = a
        .pm
        .create_object(OpKind::CreateArticle, None, Value::Null, None)
        .unwrap();
    let initial = tick(&a, &b);
    pump([&a, &b], initial, pass);
    assert!(b.pm.stores().objects.get(ObjectKind::Article, &first).unwrap().is_some());

    a.pm.on_peer_disconnected(&b.id);
    b.pm.on_peer_disconnected(&a.id);
    set_time([&a, &b], h3 + 20);
    let (second, _) = a
        .pm
        .create_object(OpKind::CreateArticle, None, Value::Null, None)
        .unwrap();

    let later = Timestamp::new(DAY + 4 * 86400, 0);
    set_time([&a, &b], later.ts);
    for n in [&a, &b] {
        n.pm.stores().oplogs(Stream::Board).save_sync_time(later).unwrap();
    }
    assert_ne!(board_root(&a), board_root(&b));

    let initial = connect(&a, &b);
    let kinds = pump([&a, &b], initial, pass);
    assert!(kinds.contains(&MsgKind::ForceSyncOplogByMerkle));
    assert!(b.pm.stores().objects.get(ObjectKind::Article, &second).unwrap().is_some());
    assert_eq!(board_root(&a), board_root(&b));
}

#[test]
fn test_start_repairs_once() {
    let a = founder(DAY);
    a.clock.set(Timestamp::new(DAY + 50, 0));
    let (_, key) = a.pm.opkeys().current(a.pm.now()).unwrap();
    let mut log = signed_with(&key, &a.pm, Timestamp::new(DAY + 50, 0));
    log.prev_log_id = Some(Eid::new_random());
    a.pm.stores().oplogs(Stream::Board).append(&log).unwrap();

    let meta = &a.pm.stores().meta;
    let prev_marker = crate::fix::marker(b".fxpl", a.pm.stores());
    let master_marker = crate::fix::marker(b".fxdm", a.pm.stores());
    assert!(!meta.contains(&prev_marker).unwrap());

    a.pm.start().unwrap();
    let stored = a.pm.stores().oplogs(Stream::Board).get(&log.id).unwrap().unwrap();
    assert!(stored.prev_log_id.is_none());
    assert!(stored.is_sync);
    assert!(a.pm.stores().objects.get(ObjectKind::Article, &log.object_id).unwrap().is_some());
    assert!(meta.contains(&prev_marker).unwrap());
    assert!(meta.contains(&master_marker).unwrap());

    // a record broken again after the markers are set is left alone
    let mut again = signed_with(&key, &a.pm, Timestamp::new(DAY + 60, 0));
    again.prev_log_id = Some(Eid::new_random());
    again.is_sync = true;
    a.pm.stores().oplogs(Stream::Board).append(&again).unwrap();

    a.pm.start().unwrap();
    let stored = a.pm.stores().oplogs(Stream::Board).get(&again.id).unwrap().unwrap();
    assert_eq!(stored.prev_log_id, again.prev_log_id);
    let opkeys = a.pm.stores().oplogs(Stream::OpKey).all(Status::Alive).unwrap();
    assert_eq!(opkeys.len(), 1);
}

#[test]
fn test_shared_entity_keeps_creator_content() {
    let (a, b) = founder_and_master_of(EntityType::Shared, DAY);
    set_time([&a, &b], DAY + 100);
    settle(&a, &b);
    let initial = tick(&a, &b);
    pump([&a, &b], initial, pass);
    assert_eq!(b.pm.stores().oplogs(Stream::OpKey).all(Status::Alive).unwrap().len(), 2);
    assert_eq!(a.pm.authority().quorum(a.pm.now()), 2);

    set_time([&a, &b], DAY + 200);
    let content = lines(3);
    let (article, out) = a
        .pm
        .create_object(OpKind::CreateArticle, None, json!({"title": "shared"}), Some(&content))
        .unwrap();
    let obj = a.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().unwrap();
    assert_eq!(obj.status, Status::Pending);
    assert!(obj.blocks_complete());

    pump([&a, &b], tagged(0, out), pass);
    let initial = tick(&a, &b);
    pump([&a, &b], initial, pass);
    for n in [&a, &b] {
        let obj = n.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().unwrap();
        assert_eq!(obj.status, Status::Alive);
        let stored = n
            .pm
            .stores()
            .blocks
            .content(ObjectKind::Article, &article, obj.block.as_ref().unwrap())
            .unwrap();
        assert_eq!(stored, Some(content.clone()));
    }

    set_time([&a, &b], DAY + 300);
    let revised = vec!["first".to_string(), "second".to_string()];
    let out = a
        .pm
        .update_object(OpKind::UpdateArticle, article, json!({"title": "v2"}), Some(&revised))
        .unwrap();
    pump([&a, &b], tagged(0, out), pass);
    let initial = tick(&a, &b);
    pump([&a, &b], initial, pass);
    for n in [&a, &b] {
        let obj = n.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().unwrap();
        assert_eq!(obj.attrs["title"], "v2");
        assert!(obj.sync_info.is_none());
        let stored = n
            .pm
            .stores()
            .blocks
            .content(ObjectKind::Article, &article, obj.block.as_ref().unwrap())
            .unwrap();
        assert_eq!(stored, Some(revised.clone()));
    }
    assert_eq!(board_root(&a), board_root(&b));
}

#[test]
fn test_opkey_rotation() {
    let a = founder(DAY);
    let b = joiner(a.pm.entity_id(), KeyPair::generate(), DAY);
    settle(&a, &b);
    let (k1_id, k1) = a.pm.opkeys().current(Timestamp::new(DAY, 0)).unwrap();

    let renewed = DAY + a.pm.params.renew_opkey_secs;
    set_time([&a, &b], renewed);
    let initial = tick(&a, &b);
    pump([&a, &b], initial, pass);
    let (k2_id, k2) = a.pm.opkeys().current(a.pm.now()).unwrap();
    assert_ne!(k1_id, k2_id);
    assert_eq!(b.pm.stores().oplogs(Stream::OpKey).all(Status::Alive).unwrap().len(), 2);

    set_time([&a, &b], renewed + 10);
    let (article, out) = a
        .pm
        .create_object(OpKind::CreateArticle, None, Value::Null, None)
        .unwrap();
    let created = a
        .pm
        .stores()
        .oplogs(Stream::Board)
        .by_object(&article, Order::Forward)
        .unwrap();
    assert_eq!(created[0].creator_address().unwrap(), k2.address());
    pump([&a, &b], tagged(0, out), pass);
    assert!(b.pm.stores().objects.get(ObjectKind::Article, &article).unwrap().is_some());

    // the previous key still signs until it expires
    let late = signed_with(&k1, &a.pm, Timestamp::new(renewed + 20, 0));
    set_time([&a, &b], renewed + 20);
    let msg = Message::new(
        MsgCode::Stream(Stream::Board, MsgKind::AddOplogs),
        a.pm.entity_id(),
        &AddOplogs {
            oplogs: vec![late.clone()],
        },
    )
    .unwrap();
    let out = b.pm.handle_message(a.id, &msg).unwrap();
    assert!(!out.iter().any(|o| matches!(o, Outbound::Drop(_))));
    let stored = b.pm.stores().oplogs(Stream::Board).get(&late.id).unwrap().unwrap();
    assert_eq!(stored.status(), Status::Alive);
    assert_eq!(b.pm.strikes(&a.id), 0);
}

#[test]
fn test_app_oplogs_wait_for_authority_streams() {
    let a = founder(DAY);
    a.clock.set(Timestamp::new(DAY + 100, 0));
    let mut board = Vec::new();
    for _ in 0..3 {
        let (id, _) = a
            .pm
            .create_object(OpKind::CreateArticle, None, Value::Null, None)
            .unwrap();
        board.extend(a.pm.stores().oplogs(Stream::Board).by_object(&id, Order::Forward).unwrap());
    }
    let b = joiner(a.pm.entity_id(), KeyPair::generate(), DAY + 100);

    b.pm.on_peer_connected(a.id).unwrap();
    let masters = a.pm.stores().oplogs(Stream::Master).all(Status::Alive).unwrap();
    let add = |stream: Stream, oplogs: Vec<Oplog>| {
        Message::new(
            MsgCode::Stream(stream, MsgKind::AddOplogs),
            a.pm.entity_id(),
            &AddOplogs { oplogs },
        )
        .unwrap()
    };
    b.pm.handle_message(a.id, &add(Stream::Master, masters)).unwrap();
    b.pm.stream_synced(a.id, Stream::Master).unwrap();

    let out = b.pm.handle_message(a.id, &add(Stream::Board, board.clone())).unwrap();
    assert!(!out.iter().any(|o| matches!(o, Outbound::Drop(_))));
    assert_eq!(b.pm.strikes(&a.id), 0);
    for log in &board {
        assert!(b.pm.stores().oplogs(Stream::Board).get(&log.id).unwrap().is_none());
    }

    let opkeys = a.pm.stores().oplogs(Stream::OpKey).all(Status::Alive).unwrap();
    b.pm.handle_message(a.id, &add(Stream::OpKey, opkeys)).unwrap();
    b.pm.stream_synced(a.id, Stream::Member).unwrap();
    let out = b.pm.stream_synced(a.id, Stream::OpKey).unwrap();
    assert!(!out.iter().any(|o| matches!(o, Outbound::Drop(_))));
    assert_eq!(b.pm.strikes(&a.id), 0);
    for log in &board {
        let stored = b.pm.stores().oplogs(Stream::Board).get(&log.id).unwrap().unwrap();
        assert_eq!(stored.status(), Status::Alive);
    }
}
