//! Bounded channel that refuses sends after close instead of failing hard
//!
//! The closed flag is only read under the lock. Closing wakes a pending
//! receiver, which drains what is already buffered and then sees EOF.

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Channel full")]
    Full,
}

impl ChannelError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        replica_core::ErrorKind::Sync
    }
}

struct Shared {
    closed: RwLock<bool>,
    notify: Notify,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    fn close(&self) {
        *self.closed.write() = true;
        self.notify.notify_one();
    }
}

/// Sending half
pub struct GuardedSender<T> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for GuardedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Receiving half
pub struct GuardedReceiver<T> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared>,
}

/// Create a guarded channel holding up to `capacity` messages
pub fn guarded_channel<T>(capacity: usize) -> (GuardedSender<T>, GuardedReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared {
        closed: RwLock::new(false),
        notify: Notify::new(),
    });
    (
        GuardedSender {
            tx,
            shared: shared.clone(),
        },
        GuardedReceiver { rx, shared },
    )
}

impl<T> GuardedSender<T> {
    pub async fn send(&self, value: T) -> Result<(), ChannelError> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.tx.send(value).await.map_err(|_| ChannelError::Closed)
    }

    pub fn try_send(&self, value: T) -> Result<(), ChannelError> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.tx.try_send(value).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed() || self.tx.is_closed()
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl<T> GuardedReceiver<T> {
    /// Next message, or `None` once the channel is closed and drained
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if self.shared.is_closed() {
                return self.rx.try_recv().ok();
            }
            tokio::select! {
                msg = self.rx.recv() => return msg,
                _ = self.shared.notify.notified() => continue,
            }
        }
    }

    pub fn close(&mut self) {
        self.shared.close();
        self.rx.close();
    }
}
