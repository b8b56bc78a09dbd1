//! Advisory per-key reader/writer locks
//!
//! Keys are arbitrary byte strings. State lives in a sharded map so locks on
//! unrelated keys never contend. Promotion from reader to writer is not
//! supported: a holder of a read lock that asks for the write lock on the
//! same key fails like any other writer would.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Attempts made by the blocking variants
pub const LOCK_RETRIES: usize = 100;
const MAX_SLEEP_MS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Key busy: {0}")]
    Busy(String),
    #[error("Invalid lock state for key {0}")]
    InvalidLock(String),
}

impl LockError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            LockError::Busy(_) => replica_core::ErrorKind::Conflict,
            LockError::InvalidLock(_) => replica_core::ErrorKind::Fatal,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct LockState {
    readers: u32,
    writer: bool,
}

fn key_str(key: &[u8]) -> String {
    hex::encode(key)
}

#[derive(Default)]
pub struct LockMap {
    locks: DashMap<Vec<u8>, LockState>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, key: &[u8]) -> Result<(), LockError> {
        match self.locks.entry(key.to_vec()) {
            Entry::Occupied(_) => Err(LockError::Busy(key_str(key))),
            Entry::Vacant(v) => {
                v.insert(LockState {
                    readers: 0,
                    writer: true,
                });
                Ok(())
            }
        }
    }

    pub fn unlock(&self, key: &[u8]) -> Result<(), LockError> {
        match self.locks.entry(key.to_vec()) {
            Entry::Occupied(o) if o.get().writer => {
                o.remove();
                Ok(())
            }
            _ => Err(LockError::InvalidLock(key_str(key))),
        }
    }

    pub fn try_rlock(&self, key: &[u8]) -> Result<(), LockError> {
        match self.locks.entry(key.to_vec()) {
            Entry::Occupied(mut o) => {
                let state = o.get_mut();
                if state.writer {
                    return Err(LockError::Busy(key_str(key)));
                }
                state.readers += 1;
                Ok(())
            }
            Entry::Vacant(v) => {
                v.insert(LockState {
                    readers: 1,
                    writer: false,
                });
                Ok(())
            }
        }
    }

    pub fn runlock(&self, key: &[u8]) -> Result<(), LockError> {
        match self.locks.entry(key.to_vec()) {
            Entry::Occupied(mut o) if !o.get().writer && o.get().readers > 0 => {
                if o.get().readers == 1 {
                    o.remove();
                } else {
                    o.get_mut().readers -= 1;
                }
                Ok(())
            }
            _ => Err(LockError::InvalidLock(key_str(key))),
        }
    }

    /// Write lock with retry, released when the guard drops
    pub fn lock(&self, key: &[u8]) -> Result<WriteGuard<'_>, LockError> {
        retry(|| self.try_lock(key))?;
        Ok(WriteGuard {
            map: self,
            key: key.to_vec(),
        })
    }

    /// Read lock with retry, released when the guard drops
    pub fn rlock(&self, key: &[u8]) -> Result<ReadGuard<'_>, LockError> {
        retry(|| self.try_rlock(key))?;
        Ok(ReadGuard {
            map: self,
            key: key.to_vec(),
        })
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.locks.contains_key(key)
    }
}

fn retry(mut attempt: impl FnMut() -> Result<(), LockError>) -> Result<(), LockError> {
    let mut last = Ok(());
    for _ in 0..LOCK_RETRIES {
        last = attempt();
        match &last {
            Ok(()) => return Ok(()),
            Err(LockError::Busy(_)) => {
                let ms = rand::thread_rng().gen_range(1..=MAX_SLEEP_MS);
                std::thread::sleep(Duration::from_millis(ms));
            }
            Err(_) => return last,
        }
    }
    last
}

pub struct WriteGuard<'a> {
    map: &'a LockMap,
    key: Vec<u8>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.map.unlock(&self.key);
    }
}

pub struct ReadGuard<'a> {
    map: &'a LockMap,
    key: Vec<u8>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let _ = self.map.runlock(&self.key);
    }
}
