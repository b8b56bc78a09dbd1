//! Networking primitives for the oplog replication core
//!
//! This crate provides:
//! - Code-tagged, length-prefixed message framing
//! - Per-stream message codes and the entity envelope
//! - A non-panicking guarded channel
//! - Peer health (strikes, backoff)
//! - TCP session transport

pub mod channel;
pub mod framing;
pub mod message;
pub mod peer;
pub mod transport;

pub use channel::{guarded_channel, ChannelError, GuardedReceiver, GuardedSender};
pub use framing::{Frame, FrameCodec, FrameError};
pub use message::{Message, MsgCode, MsgKind, SessionKind};
pub use peer::{PeerHealth, PeerId, PeerInfo};
pub use transport::{Transport, TransportError, TransportEvent};
