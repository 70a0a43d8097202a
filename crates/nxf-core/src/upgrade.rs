//! Shared-to-exclusive lock transitions.
//!
//! A reader that finds it must mutate drops its read guard, takes the write
//! guard, and re-checks the condition before mutating: another thread may
//! have done the work while no lock was held.

use nxf_error::Result;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// Where a read-then-maybe-write access currently stands.
pub enum LockPhase<'a, T> {
    ReadHeld(RwLockReadGuard<'a, T>),
    /// No guard held; the write lock is being acquired.
    Upgrading,
    WriteHeld(RwLockWriteGuard<'a, T>),
}

impl<T> LockPhase<'_, T> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadHeld(_) => "read_held",
            Self::Upgrading => "upgrading",
            Self::WriteHeld(_) => "write_held",
        }
    }
}

/// Run `check` under the read lock; if it yields nothing, upgrade and run
/// `check` again under the write lock before falling back to `mutate`.
pub fn read_or_upgrade<T, R>(
    lock: &RwLock<T>,
    check: impl Fn(&T) -> Option<R>,
    mutate: impl FnOnce(&mut T) -> Result<R>,
) -> Result<R> {
    let mut phase = LockPhase::ReadHeld(lock.read());
    loop {
        phase = match phase {
            LockPhase::ReadHeld(guard) => {
                if let Some(done) = check(&guard) {
                    return Ok(done);
                }
                drop(guard);
                trace!(from = "read_held", to = "upgrading", "lock_phase");
                LockPhase::Upgrading
            }
            LockPhase::Upgrading => {
                let guard = lock.write();
                trace!(from = "upgrading", to = "write_held", "lock_phase");
                LockPhase::WriteHeld(guard)
            }
            LockPhase::WriteHeld(mut guard) => {
                if let Some(done) = check(&guard) {
                    trace!("lock_upgrade_revalidated");
                    return Ok(done);
                }
                return mutate(&mut guard);
            }
        };
    }
}
