//! Log streams, operation kinds and their payload schemas
//!
//! Every stream numbers its operations from 1 in declaration order. The
//! numbers are wire identifiers: new kinds are only ever appended.

use crate::bip32::KeyExtraInfo;
use crate::canonical::base64_bytes;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::types::{Eid, Hash32, Salt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// STREAMS
// =============================================================================

/// An independent oplog stream of an entity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stream {
    Master,
    Member,
    OpKey,
    Board,
    Friend,
}

impl Stream {
    pub const ALL: [Stream; 5] = [
        Stream::Master,
        Stream::Member,
        Stream::OpKey,
        Stream::Board,
        Stream::Friend,
    ];

    /// Two-byte tag used in every storage prefix of the stream
    pub fn tag(self) -> &'static [u8; 2] {
        match self {
            Stream::Master => b"MA",
            Stream::Member => b"mb",
            Stream::OpKey => b"ok",
            Stream::Board => b"bd",
            Stream::Friend => b"fr",
        }
    }

    /// High byte of every message code of the stream
    pub fn code_base(self) -> u8 {
        match self {
            Stream::Master => 1,
            Stream::Member => 2,
            Stream::OpKey => 3,
            Stream::Board => 4,
            Stream::Friend => 5,
        }
    }

    pub fn from_code_base(base: u8) -> Option<Stream> {
        Stream::ALL.into_iter().find(|s| s.code_base() == base)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stream::Master => "master",
            Stream::Member => "member",
            Stream::OpKey => "opkey",
            Stream::Board => "board",
            Stream::Friend => "friend",
        }
    }

    /// `.` + tag + suffix, e.g. `.bdlg`
    pub fn prefix(self, suffix: &[u8; 2]) -> [u8; 5] {
        let tag = self.tag();
        [b'.', tag[0], tag[1], suffix[0], suffix[1]]
    }

    /// Application streams are gated until the master stream converged
    pub fn is_app(self) -> bool {
        matches!(self, Stream::Board | Stream::Friend)
    }

    fn ops(self) -> &'static [OpKind] {
        match self {
            Stream::Master => MASTER_OPS,
            Stream::Member => MEMBER_OPS,
            Stream::OpKey => OPKEY_OPS,
            Stream::Board => BOARD_OPS,
            Stream::Friend => FRIEND_OPS,
        }
    }
}

// =============================================================================
// OBJECT KINDS
// =============================================================================

/// Kind of object an operation acts on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Board,
    Title,
    Article,
    Comment,
    Reply,
    Media,
    Friend,
    Message,
    Master,
    Member,
    OpKey,
}

impl ObjectKind {
    pub fn tag(self) -> &'static [u8; 2] {
        match self {
            ObjectKind::Board => b"bo",
            ObjectKind::Title => b"tl",
            ObjectKind::Article => b"al",
            ObjectKind::Comment => b"ct",
            ObjectKind::Reply => b"rp",
            ObjectKind::Media => b"ma",
            ObjectKind::Friend => b"fd",
            ObjectKind::Message => b"ms",
            ObjectKind::Master => b"MA",
            ObjectKind::Member => b"mb",
            ObjectKind::OpKey => b"ok",
        }
    }

    /// `.` + tag + suffix, e.g. `.aldb`
    pub fn prefix(self, suffix: &[u8; 2]) -> [u8; 5] {
        let tag = self.tag();
        [b'.', tag[0], tag[1], suffix[0], suffix[1]]
    }

    /// Objects whose content may span blocks
    pub fn has_blocks(self) -> bool {
        matches!(
            self,
            ObjectKind::Title
                | ObjectKind::Article
                | ObjectKind::Comment
                | ObjectKind::Reply
                | ObjectKind::Media
                | ObjectKind::Message
        )
    }
}

// =============================================================================
// OPERATION KINDS
// =============================================================================

/// How an operation affects its object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    Create,
    Update,
    Delete,
    Other,
}

/// Every operation kind of every stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    CreateMaster,
    TransferMaster,
    RevokeMaster,
    MigrateMaster,

    AddMember,
    RemoveMember,
    MigrateMember,

    CreateOpKey,
    RevokeOpKey,

    CreateBoard,
    DeleteBoard,
    MigrateBoard,
    CreateTitle,
    UpdateTitle,
    CreateArticle,
    UpdateArticle,
    DeleteArticle,
    CreateMedia,
    DeleteMedia,
    CreateComment,
    DeleteComment,
    CreateReply,
    UpdateReply,
    DeleteReply,

    CreateFriend,
    DeleteFriend,
    CreateMessage,
    CreateFriendMedia,
}

use OpKind::*;

const MASTER_OPS: &[OpKind] = &[CreateMaster, TransferMaster, RevokeMaster, MigrateMaster];
const MEMBER_OPS: &[OpKind] = &[AddMember, RemoveMember, MigrateMember];
const OPKEY_OPS: &[OpKind] = &[CreateOpKey, RevokeOpKey];
const BOARD_OPS: &[OpKind] = &[
    CreateBoard,
    DeleteBoard,
    MigrateBoard,
    CreateTitle,
    UpdateTitle,
    CreateArticle,
    UpdateArticle,
    DeleteArticle,
    CreateMedia,
    DeleteMedia,
    CreateComment,
    DeleteComment,
    CreateReply,
    UpdateReply,
    DeleteReply,
];
const FRIEND_OPS: &[OpKind] = &[CreateFriend, DeleteFriend, CreateMessage, CreateFriendMedia];

impl OpKind {
    /// Resolve a wire tag. Unknown tags fail closed.
    pub fn from_code(stream: Stream, code: u32) -> Result<OpKind> {
        code.checked_sub(1)
            .and_then(|i| stream.ops().get(i as usize))
            .copied()
            .ok_or(Error::UnknownOp {
                stream: stream.name(),
                op: code,
            })
    }

    pub fn stream(self) -> Stream {
        match self {
            CreateMaster | TransferMaster | RevokeMaster | MigrateMaster => Stream::Master,
            AddMember | RemoveMember | MigrateMember => Stream::Member,
            CreateOpKey | RevokeOpKey => Stream::OpKey,
            CreateFriend | DeleteFriend | CreateMessage | CreateFriendMedia => Stream::Friend,
            _ => Stream::Board,
        }
    }

    /// Wire tag within the stream
    pub fn code(self) -> u32 {
        let ops = self.stream().ops();
        ops.iter().position(|k| *k == self).map(|i| i as u32 + 1).unwrap_or(0)
    }

    pub fn class(self) -> OpClass {
        match self {
            CreateMaster | AddMember | CreateOpKey | CreateBoard | CreateTitle | CreateArticle
            | CreateMedia | CreateComment | CreateReply | CreateFriend | CreateMessage
            | CreateFriendMedia => OpClass::Create,
            UpdateTitle | UpdateArticle | UpdateReply => OpClass::Update,
            TransferMaster | RevokeMaster | MigrateMaster | RemoveMember | MigrateMember
            | RevokeOpKey | DeleteBoard | MigrateBoard | DeleteArticle | DeleteMedia
            | DeleteComment | DeleteReply | DeleteFriend => OpClass::Delete,
        }
    }

    pub fn object_kind(self) -> ObjectKind {
        match self {
            CreateMaster | TransferMaster | RevokeMaster | MigrateMaster => ObjectKind::Master,
            AddMember | RemoveMember | MigrateMember => ObjectKind::Member,
            CreateOpKey | RevokeOpKey => ObjectKind::OpKey,
            CreateBoard | DeleteBoard | MigrateBoard => ObjectKind::Board,
            CreateTitle | UpdateTitle => ObjectKind::Title,
            CreateArticle | UpdateArticle | DeleteArticle => ObjectKind::Article,
            CreateMedia | DeleteMedia | CreateFriendMedia => ObjectKind::Media,
            CreateComment | DeleteComment => ObjectKind::Comment,
            CreateReply | UpdateReply | DeleteReply => ObjectKind::Reply,
            CreateFriend | DeleteFriend => ObjectKind::Friend,
            CreateMessage => ObjectKind::Message,
        }
    }

    /// Kinds that never chain on a predecessor oplog
    pub fn is_unchained(self) -> bool {
        self.class() == OpClass::Create
    }

    /// `[internal, pending, final]` statuses a delete-class op moves its object through
    pub fn delete_statuses(self) -> [Status; 3] {
        match self {
            RevokeMaster | RevokeOpKey => [
                Status::InternalRevoke,
                Status::PendingRevoke,
                Status::Revoked,
            ],
            TransferMaster => [
                Status::InternalTransfer,
                Status::PendingTransfer,
                Status::Transferred,
            ],
            MigrateMaster | MigrateMember | MigrateBoard => [
                Status::InternalMigrate,
                Status::PendingMigrate,
                Status::Migrated,
            ],
            _ => [
                Status::InternalDeleted,
                Status::PendingDeleted,
                Status::Deleted,
            ],
        }
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Block layout announced by a create or update op
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    #[serde(rename = "ID")]
    pub id: Eid,
    #[serde(rename = "N")]
    pub n_block: u32,
    /// `hashs[block][sub_block]`
    #[serde(rename = "H")]
    pub hashs: Vec<Vec<Hash32>>,
    #[serde(rename = "M", default)]
    pub media_ids: Vec<Eid>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateObjectData {
    /// Object this one hangs off, e.g. the article of a comment
    #[serde(rename = "P", default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Eid>,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockMeta>,
    #[serde(rename = "a", default)]
    pub attrs: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateObjectData {
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockMeta>,
    #[serde(rename = "a", default)]
    pub attrs: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteObjectData {
    /// Attached media deleted along with the object
    #[serde(rename = "M", default)]
    pub media_ids: Vec<Eid>,
}

/// Invitee's signature accepting a master invitation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptance {
    #[serde(rename = "s")]
    pub salt: Salt,
    #[serde(rename = "S", with = "base64_bytes")]
    pub sig: Vec<u8>,
    #[serde(rename = "K", with = "base64_bytes")]
    pub pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterOpData {
    /// Acceptance of the new master; absent for the entity creator
    #[serde(rename = "A", default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<Acceptance>,
    /// Successor for transfer, target entity for migrate
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Eid>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberOpData {
    #[serde(rename = "a", default)]
    pub attrs: Value,
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Eid>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKeyOpData {
    /// Uncompressed public key of the opkey
    #[serde(rename = "K", with = "base64_bytes", default)]
    pub pubkey: Vec<u8>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<KeyExtraInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityOpData {
    #[serde(rename = "a", default)]
    pub attrs: Value,
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Eid>,
}

/// Payload decoded against the schema of its op kind
#[derive(Clone, Debug, PartialEq)]
pub enum OpPayload {
    CreateObject(CreateObjectData),
    UpdateObject(UpdateObjectData),
    DeleteObject(DeleteObjectData),
    Master(MasterOpData),
    Member(MemberOpData),
    OpKey(OpKeyOpData),
    Entity(EntityOpData),
}

fn parse<T: serde::de::DeserializeOwned>(kind: OpKind, value: &Value) -> Result<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value).map_err(|e| Error::InvalidPayload(format!("{:?}: {}", kind, e)))
}

impl OpPayload {
    pub fn decode(kind: OpKind, value: &Value) -> Result<OpPayload> {
        let payload = match kind.stream() {
            Stream::Master => OpPayload::Master(parse(kind, value)?),
            Stream::Member => OpPayload::Member(parse(kind, value)?),
            Stream::OpKey => {
                let data: OpKeyOpData = parse(kind, value)?;
                if kind == CreateOpKey && (data.pubkey.is_empty() || data.extra.is_none()) {
                    return Err(Error::InvalidPayload("opkey without key".into()));
                }
                OpPayload::OpKey(data)
            }
            Stream::Board | Stream::Friend => match kind {
                CreateBoard | DeleteBoard | MigrateBoard | CreateFriend | DeleteFriend => {
                    OpPayload::Entity(parse(kind, value)?)
                }
                _ => match kind.class() {
                    OpClass::Create => OpPayload::CreateObject(parse(kind, value)?),
                    OpClass::Update => OpPayload::UpdateObject(parse(kind, value)?),
                    _ => OpPayload::DeleteObject(parse(kind, value)?),
                },
            },
        };
        Ok(payload)
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            OpPayload::CreateObject(d) => serde_json::to_value(d)?,
            OpPayload::UpdateObject(d) => serde_json::to_value(d)?,
            OpPayload::DeleteObject(d) => serde_json::to_value(d)?,
            OpPayload::Master(d) => serde_json::to_value(d)?,
            OpPayload::Member(d) => serde_json::to_value(d)?,
            OpPayload::OpKey(d) => serde_json::to_value(d)?,
            OpPayload::Entity(d) => serde_json::to_value(d)?,
        };
        Ok(value)
    }

    /// Block layout carried by create/update payloads
    pub fn block(&self) -> Option<&BlockMeta> {
        match self {
            OpPayload::CreateObject(d) => d.block.as_ref(),
            OpPayload::UpdateObject(d) => d.block.as_ref(),
            _ => None,
        }
    }

    pub fn attrs(&self) -> Value {
        match self {
            OpPayload::CreateObject(d) => d.attrs.clone(),
            OpPayload::UpdateObject(d) => d.attrs.clone(),
            OpPayload::Member(d) => d.attrs.clone(),
            OpPayload::Entity(d) => d.attrs.clone(),
            _ => Value::Null,
        }
    }
}
