use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::{RalError, Result};

/// Whether the lock's key is this process alone, or shared across every
/// process on the machine (spec.md §4.1: "keyed by host scope:
/// per-process for local, per-machine for global").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockScope {
    Process,
    Machine,
}

/// Whether the acquirer wants exclusive programming rights, or is willing
/// to share in read-only mode if someone else already owns the PMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

const NONE: u8 = 0;
const EXCLUSIVE: u8 = 1;
const SHARED: u8 = 2;

/// Process-local acquirer count, guarding against two `Engine` instances
/// in the same process reprogramming the same PMU concurrently.
static PROCESS_STATE: AtomicU8 = AtomicU8::new(NONE);
static PROCESS_SHARED_COUNT: Mutex<u32> = Mutex::new(0);

/// A named resource (flock on a well-known path for machine scope, an
/// atomic for process scope) granting the right to program PMUs,
/// acquired by the owner object created at startup (spec.md §9: no global
/// mutable singleton).
pub struct InstanceLock {
    scope: LockScope,
    mode: LockMode,
    machine_file: Option<std::fs::File>,
}

impl InstanceLock {
    pub fn acquire(scope: LockScope, mode: LockMode) -> Result<Self> {
        match scope {
            LockScope::Process => Self::acquire_process(mode),
            LockScope::Machine => Self::acquire_machine(mode),
        }
    }

    fn acquire_process(mode: LockMode) -> Result<Self> {
        match mode {
            LockMode::Exclusive => {
                PROCESS_STATE
                    .compare_exchange(NONE, EXCLUSIVE, Ordering::AcqRel, Ordering::Acquire)
                    .map_err(|_| RalError::PmuBusy { scope: "process" })?;
            }
            LockMode::Shared => {
                let mut count = PROCESS_SHARED_COUNT.lock();
                if PROCESS_STATE.load(Ordering::Acquire) == EXCLUSIVE {
                    return Err(RalError::PmuBusy { scope: "process" });
                }
                PROCESS_STATE.store(SHARED, Ordering::Release);
                *count += 1;
            }
        }
        Ok(InstanceLock {
            scope: LockScope::Process,
            mode,
            machine_file: None,
        })
    }

    fn acquire_machine(mode: LockMode) -> Result<Self> {
        let path = "/var/run/pcm-rs.lock";
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .or_else(|_| {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open("/tmp/pcm-rs.lock")
            })
            .map_err(|source| RalError::AccessDenied {
                core_id: u32::MAX,
                source,
            })?;

        let operation = match mode {
            LockMode::Exclusive => libc::LOCK_EX | libc::LOCK_NB,
            LockMode::Shared => libc::LOCK_SH | libc::LOCK_NB,
        };
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(RalError::PmuBusy { scope: "machine" });
        }

        Ok(InstanceLock {
            scope: LockScope::Machine,
            mode,
            machine_file: Some(file),
        })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match self.scope {
            LockScope::Process => match self.mode {
                LockMode::Exclusive => PROCESS_STATE.store(NONE, Ordering::Release),
                LockMode::Shared => {
                    let mut count = PROCESS_SHARED_COUNT.lock();
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        PROCESS_STATE.store(NONE, Ordering::Release);
                    }
                }
            },
            LockScope::Machine => {
                if let Some(file) = &self.machine_file {
                    unsafe {
                        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both cases share the same process-global lock state, so they run as
    // one test to avoid a race between parallel test threads.
    #[test]
    fn process_scope_exclusive_lock_busy_then_released() {
        let first = InstanceLock::acquire(LockScope::Process, LockMode::Exclusive).unwrap();
        let second = InstanceLock::acquire(LockScope::Process, LockMode::Exclusive);
        assert!(matches!(second, Err(RalError::PmuBusy { scope: "process" })));
        drop(first);

        let again = InstanceLock::acquire(LockScope::Process, LockMode::Exclusive);
        assert!(again.is_ok());
    }
}
