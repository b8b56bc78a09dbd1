//! Replica Core Library
//!
//! Primitives shared by the oplog replication engine: identifiers,
//! timestamps, bit vectors, statuses, operation kinds and payloads,
//! canonical encodings and secp256k1 key handling.
//!
//! # Modules
//!
//! - [`types`]: Identifiers (`Eid`, `Address`, `Salt`, `Hash32`)
//! - [`timestamp`]: Packed UTC timestamps and calendar windows
//! - [`bit_vector`]: Word-backed bit vectors
//! - [`status`]: `Status` and `StatusClass`
//! - [`op`]: Streams, op kinds and payload schemas
//! - [`canonical`]: Canonical JSON and base64 serde helpers
//! - [`crypto`]: Keccak-256 and recoverable signatures
//! - [`bip32`]: Child key derivation
//! - [`error`]: Error types

pub mod bip32;
pub mod bit_vector;
pub mod canonical;
pub mod crypto;
pub mod error;
pub mod op;
pub mod status;
pub mod timestamp;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use bit_vector::BitVector;
pub use error::{Error, ErrorKind, Result};
pub use op::{ObjectKind, OpClass, OpKind, OpPayload, Stream};
pub use status::{Status, StatusClass};
pub use timestamp::Timestamp;
pub use types::*;
