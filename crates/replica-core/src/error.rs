//! Error types for the replication core primitives

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared by every error enum in the workspace.
///
/// Callers branch on the kind rather than on individual variants: validation
/// errors fail the request, conflicts are idempotency signals, authority
/// errors mark the offending oplog failed, sync errors trigger repair and
/// fatal errors quiesce the entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Authority,
    Sync,
    Fatal,
}

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// JSON encoding/decoding error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Identifier of the wrong size or bad base58
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Timestamp bytes of the wrong size or nanos out of range
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Bit vector bytes not a multiple of 8
    #[error("invalid bit vector")]
    InvalidBitVector,

    /// Byte that is neither 0 nor 1 where a bool was expected
    #[error("not bool: {0:#04x}")]
    NotBool(u8),

    /// Unknown status value
    #[error("invalid status: {0}")]
    InvalidStatus(u8),

    /// Unknown operation tag for a stream
    #[error("unknown op {op} for stream {stream}")]
    UnknownOp { stream: &'static str, op: u32 },

    /// Payload does not match the schema of its op kind
    #[error("invalid op payload: {0}")]
    InvalidPayload(String),

    /// Invalid private or public key bytes
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signature does not verify or cannot be parsed
    #[error("invalid signature")]
    InvalidSignature,

    /// BIP32-like child derivation produced an unusable key
    #[error("invalid child key at index {0}")]
    InvalidChild(u32),

    /// Derived key does not belong to the claimed parent
    #[error("key extra info mismatch")]
    KeyExtraMismatch,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSignature | Error::KeyExtraMismatch => ErrorKind::Authority,
            _ => ErrorKind::Validation,
        }
    }
}
