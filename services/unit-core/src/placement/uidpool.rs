//! Instance UID allocation.
//!
//! UIDs are stable for the lifetime of an instance identity: the pool is
//! refilled from persisted records on startup and an ident keeps its UID
//! across placement passes and restarts.

use std::collections::BTreeSet;

use thiserror::Error;

const UID_RANGE_START: u32 = 5000;
const UID_RANGE_END: u32 = 10000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UidPoolError {
    #[error("no free UID available")]
    Exhausted,

    #[error("UID {0} out of range")]
    OutOfRange(u32),

    #[error("UID {0} already taken")]
    AlreadyTaken(u32),

    #[error("UID {0} not taken")]
    NotTaken(u32),
}

/// Allocator over a fixed UID range with lowest-free-first reuse.
#[derive(Debug, Default)]
pub struct UidPool {
    taken: BTreeSet<u32>,
}

impl UidPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lowest free UID.
    pub fn acquire(&mut self) -> Result<u32, UidPoolError> {
        for uid in UID_RANGE_START..UID_RANGE_END {
            if self.taken.insert(uid) {
                return Ok(uid);
            }
        }

        Err(UidPoolError::Exhausted)
    }

    /// Mark a persisted UID as taken.
    pub fn add(&mut self, uid: u32) -> Result<(), UidPoolError> {
        if !(UID_RANGE_START..UID_RANGE_END).contains(&uid) {
            return Err(UidPoolError::OutOfRange(uid));
        }

        if !self.taken.insert(uid) {
            return Err(UidPoolError::AlreadyTaken(uid));
        }

        Ok(())
    }

    /// Return a UID to the pool.
    pub fn release(&mut self, uid: u32) -> Result<(), UidPoolError> {
        if !self.taken.remove(&uid) {
            return Err(UidPoolError::NotTaken(uid));
        }

        Ok(())
    }
}
