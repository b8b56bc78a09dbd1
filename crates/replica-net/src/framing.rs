//! Message framing for network transport
//!
//! Wire format:
//! - 2 bytes: message code (big-endian)
//! - 4 bytes: body length (big-endian)
//! - N bytes: body

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum body size (20 MB)
pub const MAX_FRAME_SIZE: usize = 20 * 1024 * 1024;

const HEADER_LEN: usize = 6;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown message code: {0:#06x}")]
    UnknownCode(u16),
    #[error("Frame body too short: {0} bytes")]
    ShortBody(usize),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            FrameError::Io(_) => replica_core::ErrorKind::Sync,
            _ => replica_core::ErrorKind::Validation,
        }
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Message code
    pub code: u16,
    /// Body bytes
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(code: u16, body: Vec<u8>) -> Self {
        Self { code, body }
    }
}

/// Codec for code-tagged, length-prefixed frames
#[derive(Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let code = u16::from_be_bytes([src[0], src[1]]);
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(length).to_vec();

        Ok(Some(Frame { code, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(item.body.len()));
        }

        dst.reserve(HEADER_LEN + item.body.len());
        dst.put_u16(item.code);
        dst.put_u32(item.body.len() as u32);
        dst.put_slice(&item.body);

        Ok(())
    }
}
