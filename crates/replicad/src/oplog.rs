//! Signed operation log entries
//!
//! An oplog's status is never stored. It is read off its signatures:
//! a failure mark wins, then the master log id set on quorum, then master
//! co-signatures, then internal signatures.

use crate::storage::UpdateTs;
use replica_core::canonical::{base64_bytes, canonical_json};
use replica_core::crypto::{
    data_hash, hash_to_address, keccak256_concat, sign_data, verify_data, KeyPair,
};
use replica_core::{
    Address, Eid, Error as CoreError, Hash32, OpKind, OpPayload, Salt, Status, Stream, Timestamp,
    Version, CURRENT_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A co-signature over an oplog's creator hash
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInfo {
    /// Signer's master id
    #[serde(rename = "ID")]
    pub id: Eid,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "H")]
    pub hash: Hash32,
    #[serde(rename = "s")]
    pub salt: Salt,
    #[serde(rename = "S", with = "base64_bytes")]
    pub sig: Vec<u8>,
    #[serde(rename = "K", with = "base64_bytes")]
    pub pubkey: Vec<u8>,
}

#[derive(Serialize)]
struct SignInfoContent<'a> {
    #[serde(rename = "cH")]
    creator_hash: &'a Hash32,
    #[serde(rename = "ID")]
    id: &'a Eid,
    #[serde(rename = "CT")]
    create_ts: &'a Timestamp,
}

impl SignInfo {
    fn content(creator_hash: &Hash32, id: &Eid, create_ts: &Timestamp) -> Result<Vec<u8>, CoreError> {
        canonical_json(&SignInfoContent {
            creator_hash,
            id,
            create_ts,
        })
    }

    /// Sign `creator_hash` as master `id`
    pub fn sign(
        creator_hash: &Hash32,
        id: Eid,
        key: &KeyPair,
        create_ts: Timestamp,
    ) -> Result<Self, CoreError> {
        let bytes = Self::content(creator_hash, &id, &create_ts)?;
        let (salt, hash, sig) = sign_data(key, &bytes)?;
        Ok(Self {
            id,
            create_ts,
            hash: Hash32(hash),
            salt,
            sig: sig.to_vec(),
            pubkey: key.public_key_bytes(),
        })
    }

    pub fn verify(&self, creator_hash: &Hash32) -> Result<(), CoreError> {
        let bytes = Self::content(creator_hash, &self.id, &self.create_ts)?;
        if data_hash(&bytes, &self.salt) != self.hash.0 {
            return Err(CoreError::InvalidSignature);
        }
        verify_data(&bytes, &self.pubkey, &self.salt, &self.sig)
    }

    pub fn signer_address(&self) -> Result<Address, CoreError> {
        replica_core::crypto::public_key_to_address(&self.pubkey)
    }
}

/// One entry of a stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Oplog {
    #[serde(rename = "V")]
    pub version: Version,
    #[serde(rename = "T")]
    pub stream: Stream,
    #[serde(rename = "ID")]
    pub id: Eid,
    #[serde(rename = "E")]
    pub entity_id: Eid,
    /// Who performed the operation
    #[serde(rename = "CID")]
    pub doer_id: Eid,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "OID")]
    pub object_id: Eid,
    #[serde(rename = "O")]
    pub op: u32,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub prev_log_id: Option<Eid>,
    #[serde(rename = "D", default)]
    pub data: Value,

    #[serde(rename = "cH", default)]
    pub creator_hash: Hash32,
    #[serde(rename = "s", default)]
    pub salt: Salt,
    #[serde(rename = "S", with = "base64_bytes", default)]
    pub sig: Vec<u8>,
    #[serde(rename = "K", with = "base64_bytes", default)]
    pub pubkey: Vec<u8>,

    #[serde(rename = "m", default)]
    pub master_signs: Vec<SignInfo>,
    #[serde(rename = "i", default)]
    pub internal_signs: Vec<SignInfo>,
    /// Set by the master whose signature completed the quorum
    #[serde(rename = "mID", default, skip_serializing_if = "Option::is_none")]
    pub master_log_id: Option<Eid>,
    #[serde(rename = "F", default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(rename = "H", default)]
    pub hash: Hash32,

    /// Local: the object layer has fully applied this oplog
    #[serde(rename = "y", default)]
    pub is_sync: bool,
    /// Local: newer than what the store held when it arrived
    #[serde(skip)]
    pub is_newer: bool,
}

#[derive(Serialize)]
struct SignContent<'a> {
    #[serde(rename = "V")]
    version: Version,
    #[serde(rename = "T")]
    stream: Stream,
    #[serde(rename = "ID")]
    id: &'a Eid,
    #[serde(rename = "E")]
    entity_id: &'a Eid,
    #[serde(rename = "CID")]
    doer_id: &'a Eid,
    #[serde(rename = "CT")]
    create_ts: &'a Timestamp,
    #[serde(rename = "UT")]
    update_ts: &'a Timestamp,
    #[serde(rename = "OID")]
    object_id: &'a Eid,
    #[serde(rename = "O")]
    op: u32,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    prev_log_id: Option<&'a Eid>,
    #[serde(rename = "D")]
    data: &'a Value,
}

impl Oplog {
    /// Unsigned oplog. `update_ts` starts equal to `ts` and never changes.
    pub fn new(
        entity_id: Eid,
        kind: OpKind,
        doer_id: Eid,
        object_id: Eid,
        prev_log_id: Option<Eid>,
        payload: &OpPayload,
        ts: Timestamp,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            version: CURRENT_VERSION,
            stream: kind.stream(),
            id: Eid::with_address(&doer_id.address()),
            entity_id,
            doer_id,
            create_ts: ts,
            update_ts: ts,
            object_id,
            op: kind.code(),
            prev_log_id,
            data: payload.to_value()?,
            creator_hash: Hash32::default(),
            salt: Salt::default(),
            sig: Vec::new(),
            pubkey: Vec::new(),
            master_signs: Vec::new(),
            internal_signs: Vec::new(),
            master_log_id: None,
            failed: false,
            hash: Hash32::default(),
            is_sync: false,
            is_newer: false,
        })
    }

    pub fn kind(&self) -> Result<OpKind, CoreError> {
        OpKind::from_code(self.stream, self.op)
    }

    pub fn payload(&self) -> Result<OpPayload, CoreError> {
        OpPayload::decode(self.kind()?, &self.data)
    }

    /// Canonical bytes covered by the creator signature.
    ///
    /// The predecessor link is only covered for chained kinds.
    pub fn sign_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let chained = !self.kind()?.is_unchained();
        canonical_json(&SignContent {
            version: self.version,
            stream: self.stream,
            id: &self.id,
            entity_id: &self.entity_id,
            doer_id: &self.doer_id,
            create_ts: &self.create_ts,
            update_ts: &self.update_ts,
            object_id: &self.object_id,
            op: self.op,
            prev_log_id: if chained {
                self.prev_log_id.as_ref()
            } else {
                None
            },
            data: &self.data,
        })
    }

    /// Creator signature
    pub fn sign(&mut self, key: &KeyPair) -> Result<(), CoreError> {
        let bytes = self.sign_bytes()?;
        let (salt, hash, sig) = sign_data(key, &bytes)?;
        self.salt = salt;
        self.creator_hash = Hash32(hash);
        self.sig = sig.to_vec();
        self.pubkey = key.public_key_bytes();
        self.refresh_hash();
        Ok(())
    }

    /// Check every signature and the content hash
    pub fn verify(&self) -> Result<(), CoreError> {
        let bytes = self.sign_bytes()?;
        if data_hash(&bytes, &self.salt) != self.creator_hash.0 {
            return Err(CoreError::InvalidSignature);
        }
        verify_data(&bytes, &self.pubkey, &self.salt, &self.sig)?;
        for sign in self.master_signs.iter().chain(&self.internal_signs) {
            sign.verify(&self.creator_hash)?;
        }
        if self.compute_hash() != self.hash {
            return Err(CoreError::InvalidSignature);
        }
        Ok(())
    }

    pub fn creator_address(&self) -> Result<Address, CoreError> {
        replica_core::crypto::public_key_to_address(&self.pubkey)
    }

    /// Add a master co-signature. Returns false if `signer` already signed.
    pub fn master_sign(&mut self, signer: Eid, key: &KeyPair, ts: Timestamp) -> Result<bool, CoreError> {
        if self.master_signs.iter().any(|s| s.id == signer) {
            return Ok(false);
        }
        let sign = SignInfo::sign(&self.creator_hash, signer, key, ts)?;
        insert_sorted(&mut self.master_signs, sign);
        self.refresh_hash();
        Ok(true)
    }

    /// Add an internal signature. Returns false if `signer` already signed.
    pub fn internal_sign(&mut self, signer: Eid, key: &KeyPair, ts: Timestamp) -> Result<bool, CoreError> {
        if self.internal_signs.iter().any(|s| s.id == signer) {
            return Ok(false);
        }
        let sign = SignInfo::sign(&self.creator_hash, signer, key, ts)?;
        insert_sorted(&mut self.internal_signs, sign);
        self.refresh_hash();
        Ok(true)
    }

    /// Union the signatures of another copy of this oplog. Returns true if any were added.
    pub fn merge_signs(&mut self, other: &Oplog) -> bool {
        let mut changed = false;
        for sign in &other.master_signs {
            if !self.master_signs.iter().any(|s| s.id == sign.id) {
                insert_sorted(&mut self.master_signs, sign.clone());
                changed = true;
            }
        }
        for sign in &other.internal_signs {
            if !self.internal_signs.iter().any(|s| s.id == sign.id) {
                insert_sorted(&mut self.internal_signs, sign.clone());
                changed = true;
            }
        }
        if self.master_log_id.is_none() && other.master_log_id.is_some() {
            self.master_log_id = other.master_log_id;
            changed = true;
        }
        if changed {
            self.refresh_hash();
        }
        changed
    }

    /// Mark the quorum reached
    pub fn set_alive(&mut self, master_log_id: Eid) {
        self.master_log_id = Some(master_log_id);
        self.refresh_hash();
    }

    pub fn status(&self) -> Status {
        if self.failed {
            Status::Failed
        } else if self.master_log_id.is_some() {
            Status::Alive
        } else if !self.master_signs.is_empty() {
            Status::Pending
        } else if !self.internal_signs.is_empty() {
            Status::InternalPending
        } else {
            Status::Invalid
        }
    }

    /// Distinct masters that co-signed
    pub fn master_sign_count(&self) -> usize {
        self.master_signs.len()
    }

    /// `keccak(mID ‖ cH ‖ salt ‖ sig ‖ pubkey ‖ master signs ‖ internal signs)`
    pub fn compute_hash(&self) -> Hash32 {
        let mut parts: Vec<&[u8]> = Vec::new();
        if let Some(mid) = &self.master_log_id {
            parts.push(mid.as_bytes());
        }
        parts.push(&self.creator_hash.0);
        parts.push(&self.salt.0);
        parts.push(&self.sig);
        parts.push(&self.pubkey);
        for sign in self.master_signs.iter().chain(&self.internal_signs) {
            parts.push(sign.id.as_bytes());
            parts.push(&sign.sig);
        }
        Hash32(keccak256_concat(&parts))
    }

    pub fn refresh_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    /// Merkle leaf address of this oplog.
    ///
    /// Covers only what the creator signed. Copies of one alive oplog that
    /// gathered different co-signatures on different nodes share a leaf.
    pub fn leaf_address(&self) -> Address {
        hash_to_address(&keccak256_concat(&[
            &self.creator_hash.0,
            &self.salt.0,
            &self.sig,
            &self.pubkey,
        ]))
    }

    /// Too old to be co-signed
    pub fn is_expired(&self, now: Timestamp, expire_secs: i64) -> bool {
        now > self.update_ts.add_seconds(expire_secs)
    }

    /// Ordering key used across the replication layer
    pub fn order_key(&self) -> (Timestamp, Eid) {
        (self.update_ts, self.id)
    }
}

impl UpdateTs for Oplog {
    fn update_ts(&self) -> Timestamp {
        self.update_ts
    }
}

fn insert_sorted(signs: &mut Vec<SignInfo>, sign: SignInfo) {
    let pos = signs.partition_point(|s| s.id < sign.id);
    signs.insert(pos, sign);
}
