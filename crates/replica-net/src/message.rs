//! Message codes and the entity-scoped message envelope
//!
//! A code is `(stream base << 8) | kind`. Base 0 is reserved for session
//! messages that are not bound to a stream.

use crate::framing::{Frame, FrameError};
use replica_core::{Eid, Stream, SIZE_EID};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Per-stream message kinds. Every stream carries the same set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    AddOplog = 1,
    AddOplogs = 2,
    AddPendingOplog = 3,
    AddPendingOplogs = 4,
    SyncOplog = 5,
    SyncOplogAck = 6,
    ForceSyncOplogByMerkle = 7,
    ForceSyncOplogByMerkleAck = 8,
    ForceSyncOplogByOplogAck = 9,
    InvalidSyncOplog = 10,
    SyncOplogNewOplogs = 11,
    SyncOplogNewOplogsAck = 12,
    SyncPendingOplog = 13,
    SyncPendingOplogAck = 14,

    SyncCreateObject = 20,
    SyncCreateObjectAck = 21,
    SyncCreateBlock = 22,
    SyncCreateBlockAck = 23,
    SyncUpdateObject = 24,
    SyncUpdateObjectAck = 25,
    SyncUpdateBlock = 26,
    SyncUpdateBlockAck = 27,

    ForceSyncObject = 30,
    ForceSyncObjectAck = 31,
    ForceSyncBlock = 32,
    ForceSyncBlockAck = 33,
    ForceSyncMedia = 34,
    ForceSyncMediaAck = 35,
}

impl TryFrom<u8> for MsgKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MsgKind::*;
        let kind = match value {
            1 => AddOplog,
            2 => AddOplogs,
            3 => AddPendingOplog,
            4 => AddPendingOplogs,
            5 => SyncOplog,
            6 => SyncOplogAck,
            7 => ForceSyncOplogByMerkle,
            8 => ForceSyncOplogByMerkleAck,
            9 => ForceSyncOplogByOplogAck,
            10 => InvalidSyncOplog,
            11 => SyncOplogNewOplogs,
            12 => SyncOplogNewOplogsAck,
            13 => SyncPendingOplog,
            14 => SyncPendingOplogAck,
            20 => SyncCreateObject,
            21 => SyncCreateObjectAck,
            22 => SyncCreateBlock,
            23 => SyncCreateBlockAck,
            24 => SyncUpdateObject,
            25 => SyncUpdateObjectAck,
            26 => SyncUpdateBlock,
            27 => SyncUpdateBlockAck,
            30 => ForceSyncObject,
            31 => ForceSyncObjectAck,
            32 => ForceSyncBlock,
            33 => ForceSyncBlockAck,
            34 => ForceSyncMedia,
            35 => ForceSyncMediaAck,
            other => return Err(other),
        };
        Ok(kind)
    }
}

/// Messages outside any stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionKind {
    Hello = 1,
    Ping = 2,
    Pong = 3,
}

/// Decoded message code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgCode {
    Session(SessionKind),
    Stream(Stream, MsgKind),
}

impl MsgCode {
    pub fn to_u16(self) -> u16 {
        match self {
            MsgCode::Session(kind) => kind as u16,
            MsgCode::Stream(stream, kind) => (u16::from(stream.code_base()) << 8) | kind as u16,
        }
    }

    pub fn from_u16(code: u16) -> Result<Self, FrameError> {
        let base = (code >> 8) as u8;
        let low = (code & 0xff) as u8;
        if base == 0 {
            return match low {
                1 => Ok(MsgCode::Session(SessionKind::Hello)),
                2 => Ok(MsgCode::Session(SessionKind::Ping)),
                3 => Ok(MsgCode::Session(SessionKind::Pong)),
                _ => Err(FrameError::UnknownCode(code)),
            };
        }
        let stream = Stream::from_code_base(base).ok_or(FrameError::UnknownCode(code))?;
        let kind = MsgKind::try_from(low).map_err(|_| FrameError::UnknownCode(code))?;
        Ok(MsgCode::Stream(stream, kind))
    }
}

/// A message addressed to one entity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub code: MsgCode,
    pub entity_id: Eid,
    /// JSON body
    pub body: Vec<u8>,
}

impl Message {
    pub fn new<T: Serialize>(code: MsgCode, entity_id: Eid, body: &T) -> Result<Self, FrameError> {
        Ok(Self {
            code,
            entity_id,
            body: serde_json::to_vec(body)?,
        })
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Frame body is `entity_id ‖ JSON`
    pub fn to_frame(&self) -> Frame {
        let mut body = Vec::with_capacity(SIZE_EID + self.body.len());
        body.extend_from_slice(self.entity_id.as_bytes());
        body.extend_from_slice(&self.body);
        Frame::new(self.code.to_u16(), body)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let code = MsgCode::from_u16(frame.code)?;
        if frame.body.len() < SIZE_EID {
            return Err(FrameError::ShortBody(frame.body.len()));
        }
        let entity_id =
            Eid::from_slice(&frame.body[..SIZE_EID]).map_err(|_| FrameError::ShortBody(frame.body.len()))?;
        Ok(Self {
            code,
            entity_id,
            body: frame.body[SIZE_EID..].to_vec(),
        })
    }

    pub fn stream(&self) -> Option<Stream> {
        match self.code {
            MsgCode::Stream(stream, _) => Some(stream),
            MsgCode::Session(_) => None,
        }
    }
}
