//! Who may write what, and when
//!
//! The table is folded from the alive oplogs of the master, member and opkey
//! streams, in update order. Each record carries a validity window so every
//! check is made against the oplog's own update ts rather than the present.
//! Readers take a snapshot `Arc`; a reload swaps in a fresh table.

use crate::config::EntityType;
use crate::oplog::Oplog;
use crate::oplog_store::{OplogError, OplogStore};
use parking_lot::RwLock;
use replica_core::canonical::canonical_json;
use replica_core::crypto::{public_key_to_address, sign_data, verify_data, KeyPair};
use replica_core::op::Acceptance;
use replica_core::{Address, Eid, OpKind, OpPayload, Status, Stream, Timestamp};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Signer {0} is not a master at {1}")]
    NotMaster(Address, Timestamp),
    #[error("Signer {0} is neither a member nor holds a valid operational key at {1}")]
    NotAuthorized(Address, Timestamp),
    #[error("Operational key {0} not valid at {1}")]
    OpKeyInvalid(Address, Timestamp),
    #[error("No master, member or operational key record for {0}")]
    UnknownSigner(Address),
    #[error("Genesis master must be created by the entity key")]
    BadGenesis,
    #[error("Invalid master acceptance")]
    BadAcceptance,
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
    #[error("Oplog error: {0}")]
    Oplog(#[from] OplogError),
}

impl AuthorityError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            AuthorityError::Oplog(e) => e.kind(),
            _ => replica_core::ErrorKind::Authority,
        }
    }

    /// The table lacks the record to judge by, which is not the sender's fault
    pub fn is_missing_record(&self) -> bool {
        matches!(self, AuthorityError::UnknownSigner(_))
    }
}

pub type Result<T> = std::result::Result<T, AuthorityError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterRecord {
    pub id: Eid,
    pub log_id: Eid,
    pub since: Timestamp,
    pub until: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRecord {
    pub id: Eid,
    pub since: Timestamp,
    pub until: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpKeyRecord {
    pub id: Eid,
    pub address: Address,
    pub master_id: Eid,
    pub create_ts: Timestamp,
    pub revoke_ts: Option<Timestamp>,
}

fn within(since: Timestamp, until: Option<Timestamp>, ts: Timestamp) -> bool {
    since <= ts && until.map_or(true, |u| ts < u)
}

#[derive(Clone, Debug, Default)]
pub struct AuthorityTable {
    masters: Vec<MasterRecord>,
    members: HashMap<Eid, MemberRecord>,
    opkeys: HashMap<Address, OpKeyRecord>,
}

impl AuthorityTable {
    pub fn masters(&self) -> &[MasterRecord] {
        &self.masters
    }

    pub fn master(&self, id: &Eid) -> Option<&MasterRecord> {
        self.masters.iter().find(|m| m.id == *id)
    }

    pub fn is_master_at(&self, id: &Eid, ts: Timestamp) -> bool {
        self.master(id).map_or(false, |m| within(m.since, m.until, ts))
    }

    /// Master alive at `ts` whose key has address `addr`
    pub fn master_by_address(&self, addr: &Address, ts: Timestamp) -> Option<&MasterRecord> {
        self.masters
            .iter()
            .find(|m| m.id.address() == *addr && within(m.since, m.until, ts))
    }

    pub fn alive_masters_at(&self, ts: Timestamp) -> usize {
        self.masters
            .iter()
            .filter(|m| within(m.since, m.until, ts))
            .count()
    }

    pub fn knows_master(&self, addr: &Address) -> bool {
        self.masters.iter().any(|m| m.id.address() == *addr)
    }

    pub fn knows_member(&self, addr: &Address) -> bool {
        self.members.values().any(|m| m.id.address() == *addr)
    }

    pub fn member_by_address(&self, addr: &Address, ts: Timestamp) -> Option<&MemberRecord> {
        self.members
            .values()
            .find(|m| m.id.address() == *addr && within(m.since, m.until, ts))
    }

    pub fn opkey(&self, addr: &Address) -> Option<&OpKeyRecord> {
        self.opkeys.get(addr)
    }

    pub fn opkeys(&self) -> impl Iterator<Item = &OpKeyRecord> {
        self.opkeys.values()
    }

    fn apply(&mut self, log: &Oplog) -> Result<()> {
        let ts = log.update_ts;
        match log.kind()? {
            OpKind::CreateMaster => {
                if self.master(&log.object_id).is_none() {
                    self.masters.push(MasterRecord {
                        id: log.object_id,
                        log_id: log.id,
                        since: ts,
                        until: None,
                    });
                }
            }
            OpKind::TransferMaster | OpKind::RevokeMaster | OpKind::MigrateMaster => {
                if let Some(m) = self.masters.iter_mut().find(|m| m.id == log.object_id) {
                    m.until.get_or_insert(ts);
                }
            }
            OpKind::AddMember => {
                self.members.entry(log.object_id).or_insert(MemberRecord {
                    id: log.object_id,
                    since: ts,
                    until: None,
                });
            }
            OpKind::RemoveMember | OpKind::MigrateMember => {
                if let Some(m) = self.members.get_mut(&log.object_id) {
                    m.until.get_or_insert(ts);
                }
            }
            OpKind::CreateOpKey => {
                if let OpPayload::OpKey(data) = log.payload()? {
                    let address = public_key_to_address(&data.pubkey)?;
                    self.opkeys.entry(address).or_insert(OpKeyRecord {
                        id: log.object_id,
                        address,
                        master_id: log.doer_id,
                        create_ts: ts,
                        revoke_ts: None,
                    });
                }
            }
            OpKind::RevokeOpKey => {
                if let Some(k) = self.opkeys.values_mut().find(|k| k.id == log.object_id) {
                    k.revoke_ts.get_or_insert(ts);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct AcceptanceContent<'a> {
    #[serde(rename = "E")]
    entity_id: &'a Eid,
    #[serde(rename = "M")]
    master_id: &'a Eid,
    #[serde(rename = "I")]
    inviter_id: &'a Eid,
}

fn acceptance_bytes(entity_id: &Eid, master_id: &Eid, inviter_id: &Eid) -> Result<Vec<u8>> {
    Ok(canonical_json(&AcceptanceContent {
        entity_id,
        master_id,
        inviter_id,
    })?)
}

/// Signed by an invitee to accept becoming master `master_id`
pub fn sign_acceptance(key: &KeyPair, entity_id: &Eid, master_id: &Eid, inviter_id: &Eid) -> Result<Acceptance> {
    let bytes = acceptance_bytes(entity_id, master_id, inviter_id)?;
    let (salt, _, sig) = sign_data(key, &bytes)?;
    Ok(Acceptance {
        salt,
        sig: sig.to_vec(),
        pubkey: key.public_key_bytes(),
    })
}

pub struct Authority {
    entity_id: Eid,
    entity_type: EntityType,
    max_masters: u32,
    opkey_grace_secs: i64,
    expire_opkey_secs: i64,
    table: RwLock<Arc<AuthorityTable>>,
}

impl Authority {
    pub fn new(
        entity_id: Eid,
        entity_type: EntityType,
        max_masters: u32,
        opkey_grace_secs: i64,
        expire_opkey_secs: i64,
    ) -> Self {
        Self {
            entity_id,
            entity_type,
            max_masters,
            opkey_grace_secs,
            expire_opkey_secs,
            table: RwLock::new(Arc::new(AuthorityTable::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<AuthorityTable> {
        self.table.read().clone()
    }

    /// Rebuild from the alive oplogs of the authority streams
    pub fn reload(&self, master: &OplogStore, member: &OplogStore, opkey: &OplogStore) -> Result<()> {
        let mut logs = master.all(Status::Alive)?;
        logs.extend(member.all(Status::Alive)?);
        logs.extend(opkey.all(Status::Alive)?);
        logs.sort_by_key(|l| l.order_key());

        let mut table = AuthorityTable::default();
        for log in &logs {
            table.apply(log)?;
        }
        *self.table.write() = Arc::new(table);
        Ok(())
    }

    /// Master co-signatures needed at `ts`, capped by how many masters exist
    pub fn quorum(&self, ts: Timestamp) -> usize {
        let wanted = match self.entity_type {
            EntityType::Personal | EntityType::Board => 1,
            EntityType::Shared => self.max_masters as usize,
        };
        wanted.min(self.snapshot().alive_masters_at(ts)).max(1)
    }

    pub fn is_master_at(&self, id: &Eid, ts: Timestamp) -> bool {
        self.snapshot().is_master_at(id, ts)
    }

    /// Operational key record valid at `ts`
    pub fn validate_opkey(&self, table: &AuthorityTable, addr: &Address, ts: Timestamp) -> Result<OpKeyRecord> {
        let key = table.opkey(addr).ok_or(AuthorityError::UnknownSigner(*addr))?;
        let from = key.create_ts.add_seconds(-self.opkey_grace_secs);
        let to = key.create_ts.add_seconds(self.expire_opkey_secs);
        let revoked = key.revoke_ts.map_or(false, |r| ts >= r);
        if ts < from || ts > to || revoked || !table.is_master_at(&key.master_id, ts) {
            return Err(AuthorityError::OpKeyInvalid(*addr, ts));
        }
        Ok(key.clone())
    }

    /// Gate an oplog on its creator and every master co-signature
    pub fn check(&self, log: &Oplog) -> Result<()> {
        let table = self.snapshot();
        let ts = log.update_ts;
        let creator = log.creator_address()?;
        let kind = log.kind()?;

        match log.stream {
            Stream::Master if kind == OpKind::CreateMaster => {
                self.check_create_master(&table, log, &creator)?;
            }
            Stream::Master | Stream::Member | Stream::OpKey => {
                if table.master_by_address(&creator, ts).is_none() {
                    return Err(if log.stream != Stream::Master && !table.knows_master(&creator) {
                        AuthorityError::UnknownSigner(creator)
                    } else {
                        AuthorityError::NotMaster(creator, ts)
                    });
                }
                if let OpPayload::OpKey(data) = log.payload()? {
                    if let Some(extra) = &data.extra {
                        extra.verify(&data.pubkey, &log.doer_id.address())?;
                    }
                }
            }
            Stream::Board | Stream::Friend => {
                let by_member = table.member_by_address(&creator, ts).is_some()
                    && log.doer_id.address() == creator;
                if !by_member {
                    match self.validate_opkey(&table, &creator, ts) {
                        Ok(_) => {}
                        Err(AuthorityError::UnknownSigner(_))
                            if !table.knows_member(&creator) && !table.knows_master(&creator) =>
                        {
                            return Err(AuthorityError::UnknownSigner(creator));
                        }
                        Err(_) => return Err(AuthorityError::NotAuthorized(creator, ts)),
                    }
                }
            }
        }

        for sign in &log.master_signs {
            self.check_master_sign(&table, log, sign)?;
        }
        Ok(())
    }

    fn check_create_master(&self, table: &AuthorityTable, log: &Oplog, creator: &Address) -> Result<()> {
        let ts = log.update_ts;
        match log.payload()? {
            OpPayload::Master(data) => match data.acceptance {
                None => {
                    if *creator != self.entity_id.address() || log.object_id.address() != *creator {
                        return Err(AuthorityError::BadGenesis);
                    }
                }
                Some(acceptance) => {
                    table
                        .master_by_address(creator, ts)
                        .ok_or(AuthorityError::NotMaster(*creator, ts))?;
                    if public_key_to_address(&acceptance.pubkey)? != log.object_id.address() {
                        return Err(AuthorityError::BadAcceptance);
                    }
                    let bytes = acceptance_bytes(&self.entity_id, &log.object_id, &log.doer_id)?;
                    verify_data(&bytes, &acceptance.pubkey, &acceptance.salt, &acceptance.sig)
                        .map_err(|_| AuthorityError::BadAcceptance)?;
                }
            },
            _ => return Err(AuthorityError::BadGenesis),
        }
        Ok(())
    }

    fn check_master_sign(&self, table: &AuthorityTable, log: &Oplog, sign: &crate::oplog::SignInfo) -> Result<()> {
        let ts = log.update_ts;
        let addr = sign.signer_address()?;
        if log.stream.is_app() {
            let key = self.validate_opkey(table, &addr, ts)?;
            if key.master_id != sign.id {
                return Err(AuthorityError::OpKeyInvalid(addr, ts));
            }
            return Ok(());
        }
        let genesis_self_sign = log.kind()? == OpKind::CreateMaster
            && sign.id == log.object_id
            && addr == log.object_id.address();
        if genesis_self_sign || table.master_by_address(&addr, ts).map(|m| m.id) == Some(sign.id) {
            Ok(())
        } else if log.stream != Stream::Master && !table.knows_master(&addr) {
            Err(AuthorityError::UnknownSigner(addr))
        } else {
            Err(AuthorityError::NotMaster(addr, ts))
        }
    }

    /// Distinct master co-signatures that pass [`Authority::check`]
    pub fn valid_master_signs(&self, log: &Oplog) -> usize {
        let table = self.snapshot();
        log.master_signs
            .iter()
            .filter(|s| self.check_master_sign(&table, log, s).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use replica_core::bip32::derive_child;
    use replica_core::op::{MasterOpData, OpKeyOpData};

    struct Fixture {
        storage: Storage,
        _dir: tempfile::TempDir,
        entity: Eid,
        owner: KeyPair,
        owner_id: Eid,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let owner = KeyPair::generate();
        let entity = Eid::with_address(&owner.address());
        let owner_id = Eid::with_address_postfix(&owner.address(), &entity);
        Fixture {
            storage,
            _dir: dir,
            entity,
            owner,
            owner_id,
        }
    }

    impl Fixture {
        fn store(&self, stream: Stream) -> OplogStore {
            OplogStore::new(self.storage.oplog.clone(), self.storage.meta.clone(), stream, self.entity)
        }

        fn authority(&self) -> Authority {
            Authority::new(self.entity, EntityType::Board, 2, 60, 259200)
        }

        fn reload(&self, auth: &Authority) {
            auth.reload(&self.store(Stream::Master), &self.store(Stream::Member), &self.store(Stream::OpKey))
                .unwrap();
        }

        fn alive(&self, kind: OpKind, doer: Eid, object: Eid, payload: OpPayload, ts: i64, key: &KeyPair) -> Oplog {
            let mut log = Oplog::new(self.entity, kind, doer, object, None, &payload, Timestamp::new(ts, 0)).unwrap();
            log.sign(key).unwrap();
            log.master_sign(doer, key, Timestamp::new(ts, 0)).unwrap();
            log.set_alive(doer);
            log
        }
    }

    #[test]
    fn test_genesis_rules() {
        let f = fixture();
        let auth = f.authority();
        let genesis = f.alive(
            OpKind::CreateMaster,
            f.owner_id,
            f.owner_id,
            OpPayload::Master(MasterOpData::default()),
            10,
            &f.owner,
        );
        auth.check(&genesis).unwrap();

        let stranger = KeyPair::generate();
        let sid = Eid::with_address_postfix(&stranger.address(), &f.entity);
        let forged = f.alive(
            OpKind::CreateMaster,
            sid,
            sid,
            OpPayload::Master(MasterOpData::default()),
            10,
            &stranger,
        );
        assert!(matches!(auth.check(&forged), Err(AuthorityError::BadGenesis)));
    }

    #[test]
    fn test_invited_master_and_windows() {
        let f = fixture();
        let auth = f.authority();
        let masters = f.store(Stream::Master);
        masters
            .append(&f.alive(
                OpKind::CreateMaster,
                f.owner_id,
                f.owner_id,
                OpPayload::Master(MasterOpData::default()),
                10,
                &f.owner,
            ))
            .unwrap();
        f.reload(&auth);
        assert!(auth.is_master_at(&f.owner_id, Timestamp::new(10, 0)));
        assert!(!auth.is_master_at(&f.owner_id, Timestamp::new(9, 0)));

        let invitee = KeyPair::generate();
        let invitee_id = Eid::with_address_postfix(&invitee.address(), &f.entity);
        let acceptance = sign_acceptance(&invitee, &f.entity, &invitee_id, &f.owner_id).unwrap();
        let invite = f.alive(
            OpKind::CreateMaster,
            f.owner_id,
            invitee_id,
            OpPayload::Master(MasterOpData {
                acceptance: Some(acceptance.clone()),
                to: None,
            }),
            20,
            &f.owner,
        );
        auth.check(&invite).unwrap();

        // acceptance bound to a different inviter is refused
        let wrong = sign_acceptance(&invitee, &f.entity, &invitee_id, &Eid::new_random()).unwrap();
        let bad = f.alive(
            OpKind::CreateMaster,
            f.owner_id,
            invitee_id,
            OpPayload::Master(MasterOpData {
                acceptance: Some(wrong),
                to: None,
            }),
            20,
            &f.owner,
        );
        assert!(matches!(auth.check(&bad), Err(AuthorityError::BadAcceptance)));

        masters.append(&invite).unwrap();
        let revoke = f.alive(
            OpKind::RevokeMaster,
            f.owner_id,
            invitee_id,
            OpPayload::Master(MasterOpData::default()),
            30,
            &f.owner,
        );
        masters.append(&revoke).unwrap();
        f.reload(&auth);
        assert!(auth.is_master_at(&invitee_id, Timestamp::new(25, 0)));
        assert!(!auth.is_master_at(&invitee_id, Timestamp::new(30, 0)));
        assert_eq!(auth.snapshot().alive_masters_at(Timestamp::new(25, 0)), 2);
    }

    #[test]
    fn test_opkey_window() {
        let f = fixture();
        let auth = f.authority();
        f.store(Stream::Master)
            .append(&f.alive(
                OpKind::CreateMaster,
                f.owner_id,
                f.owner_id,
                OpPayload::Master(MasterOpData::default()),
                10,
                &f.owner,
            ))
            .unwrap();
        f.reload(&auth);

        let (child, extra) = derive_child(&f.owner, 0).unwrap();
        let create_key = f.alive(
            OpKind::CreateOpKey,
            f.owner_id,
            Eid::with_address(&child.address()),
            OpPayload::OpKey(OpKeyOpData {
                pubkey: child.public_key_bytes(),
                extra: Some(extra),
            }),
            1000,
            &f.owner,
        );
        auth.check(&create_key).unwrap();
        f.store(Stream::OpKey).append(&create_key).unwrap();
        f.reload(&auth);

        let table = auth.snapshot();
        let addr = child.address();
        assert!(auth.validate_opkey(&table, &addr, Timestamp::new(1000, 0)).is_ok());
        assert!(auth.validate_opkey(&table, &addr, Timestamp::new(950, 0)).is_ok());
        assert!(auth.validate_opkey(&table, &addr, Timestamp::new(900, 0)).is_err());
        assert!(auth.validate_opkey(&table, &addr, Timestamp::new(1000 + 259200, 0)).is_ok());
        assert!(auth.validate_opkey(&table, &addr, Timestamp::new(1001 + 259200, 0)).is_err());
    }

    #[test]
    fn test_unknown_signer_is_missing_record() {
        let f = fixture();
        let auth = f.authority();
        f.store(Stream::Master)
            .append(&f.alive(
                OpKind::CreateMaster,
                f.owner_id,
                f.owner_id,
                OpPayload::Master(MasterOpData::default()),
                10,
                &f.owner,
            ))
            .unwrap();
        f.reload(&auth);

        // signed by an opkey this node has not heard of yet
        let (child, _) = derive_child(&f.owner, 0).unwrap();
        let post = f.alive(
            OpKind::CreateArticle,
            f.owner_id,
            Eid::new_random(),
            OpPayload::CreateObject(Default::default()),
            1000,
            &child,
        );
        let err = auth.check(&post).unwrap_err();
        assert!(matches!(err, AuthorityError::UnknownSigner(_)));
        assert!(err.is_missing_record());

        // a known key used outside its window is a definite refusal
        let (_, extra) = derive_child(&f.owner, 0).unwrap();
        let create_key = f.alive(
            OpKind::CreateOpKey,
            f.owner_id,
            Eid::with_address(&child.address()),
            OpPayload::OpKey(OpKeyOpData {
                pubkey: child.public_key_bytes(),
                extra: Some(extra),
            }),
            5000,
            &f.owner,
        );
        f.store(Stream::OpKey).append(&create_key).unwrap();
        f.reload(&auth);
        let err = auth.check(&post).unwrap_err();
        assert!(matches!(err, AuthorityError::NotAuthorized(_, _)));
        assert!(!err.is_missing_record());
    }

    #[test]
    fn test_quorum_policy() {
        let f = fixture();
        let shared = Authority::new(f.entity, EntityType::Shared, 2, 60, 259200);
        assert_eq!(shared.quorum(Timestamp::new(10, 0)), 1);
        f.store(Stream::Master)
            .append(&f.alive(
                OpKind::CreateMaster,
                f.owner_id,
                f.owner_id,
                OpPayload::Master(MasterOpData::default()),
                10,
                &f.owner,
            ))
            .unwrap();
        let other = KeyPair::generate();
        let other_id = Eid::with_address_postfix(&other.address(), &f.entity);
        let acceptance = sign_acceptance(&other, &f.entity, &other_id, &f.owner_id).unwrap();
        f.store(Stream::Master)
            .append(&f.alive(
                OpKind::CreateMaster,
                f.owner_id,
                other_id,
                OpPayload::Master(MasterOpData {
                    acceptance: Some(acceptance),
                    to: None,
                }),
                20,
                &f.owner,
            ))
            .unwrap();
        shared
            .reload(&f.store(Stream::Master), &f.store(Stream::Member), &f.store(Stream::OpKey))
            .unwrap();
        assert_eq!(shared.quorum(Timestamp::new(15, 0)), 1);
        assert_eq!(shared.quorum(Timestamp::new(25, 0)), 2);
        assert_eq!(f.authority().quorum(Timestamp::new(25, 0)), 1);
    }
}
