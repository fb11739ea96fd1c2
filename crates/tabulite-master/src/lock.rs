//! Coordination-service lock seam.
//!
//! The cluster's coordination service holds one byte-empty file per range
//! server, `/servers/<location>`, used purely as a lock holder: the file
//! is exclusively locked by its owning server while alive, and recovery
//! must win that lock before touching the server's durable state. The
//! real service lives outside this repository; [`LocalLockService`] is an
//! in-process implementation with the same semantics for single-process
//! deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{Error, Result};

/// Handle to an open coordination-service file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle(u64);

/// Outcome of a try-lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Granted,
    Busy,
}

/// Exclusive-lock service over a flat file namespace.
pub trait LockService: Send + Sync {
    /// Opens `path`, creating it if absent.
    fn open(&self, path: &str) -> Result<LockHandle>;

    /// Attempts to take the exclusive lock on an open file. Never
    /// blocks.
    fn try_lock(&self, handle: LockHandle) -> Result<LockStatus>;

    /// Releases the handle and any lock it holds. Idempotent.
    fn release(&self, handle: LockHandle) -> Result<()>;
}

#[derive(Debug, Default)]
struct LockState {
    next_handle: u64,
    handles: HashMap<u64, String>,
    lock_owners: HashMap<String, u64>,
}

/// In-process lock service.
#[derive(Debug, Default)]
pub struct LocalLockService {
    state: Mutex<LockState>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if some handle currently holds the lock on `path`.
    pub fn is_locked(&self, path: &str) -> bool {
        self.state.lock().unwrap().lock_owners.contains_key(path)
    }
}

impl LockService for LocalLockService {
    fn open(&self, path: &str) -> Result<LockHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.handles.insert(handle, path.to_string());
        Ok(LockHandle(handle))
    }

    fn try_lock(&self, handle: LockHandle) -> Result<LockStatus> {
        let mut state = self.state.lock().unwrap();
        let path = state
            .handles
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| Error::LockService(format!("unknown handle {}", handle.0)))?;
        match state.lock_owners.get(&path) {
            Some(&owner) if owner == handle.0 => Ok(LockStatus::Granted),
            Some(_) => Ok(LockStatus::Busy),
            None => {
                state.lock_owners.insert(path, handle.0);
                Ok(LockStatus::Granted)
            }
        }
    }

    fn release(&self, handle: LockHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(path) = state.handles.remove(&handle.0) {
            if state.lock_owners.get(&path) == Some(&handle.0) {
                state.lock_owners.remove(&path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_conflicts() {
        let service = LocalLockService::new();
        let first = service.open("/servers/rs1").unwrap();
        let second = service.open("/servers/rs1").unwrap();

        assert_eq!(service.try_lock(first).unwrap(), LockStatus::Granted);
        assert_eq!(service.try_lock(second).unwrap(), LockStatus::Busy);
        // re-acquiring an owned lock stays granted
        assert_eq!(service.try_lock(first).unwrap(), LockStatus::Granted);

        service.release(first).unwrap();
        assert_eq!(service.try_lock(second).unwrap(), LockStatus::Granted);
    }

    #[test]
    fn release_is_idempotent() {
        let service = LocalLockService::new();
        let handle = service.open("/servers/rs1").unwrap();
        service.try_lock(handle).unwrap();
        service.release(handle).unwrap();
        service.release(handle).unwrap();
        assert!(!service.is_locked("/servers/rs1"));
    }

    #[test]
    fn distinct_paths_do_not_conflict() {
        let service = LocalLockService::new();
        let one = service.open("/servers/rs1").unwrap();
        let two = service.open("/servers/rs2").unwrap();
        assert_eq!(service.try_lock(one).unwrap(), LockStatus::Granted);
        assert_eq!(service.try_lock(two).unwrap(), LockStatus::Granted);
    }
}
