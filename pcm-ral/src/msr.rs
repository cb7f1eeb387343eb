use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::affinity::AffinityGuard;
use crate::error::{RalError, Result};

/// One `MsrHandle` per online hyperthread, as required by the data model
/// invariant "every online thread has exactly one `MsrHandle`". Backed by
/// the Linux `msr` driver's per-core character device
/// (`/dev/cpu/<n>/msr`), where the MSR index is the byte offset of an
/// 8-byte `pread`/`pwrite`.
pub struct MsrHandle {
    core_id: u32,
    file: File,
    /// Set once a secure-boot write probe detects that writes are
    /// silently discarded. Programming code checks this flag and falls
    /// back to perf-subsystem mode instead of issuing further writes.
    degraded: AtomicBool,
}

impl MsrHandle {
    pub fn open(core_id: u32) -> Result<Self> {
        let path = format!("/dev/cpu/{core_id}/msr");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| classify_open_error(core_id, source))?;
        Ok(MsrHandle {
            core_id,
            file,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn read(&self, msr: u32) -> Result<u64> {
        let _pin = AffinityGuard::pin(self.core_id)?;
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, msr as u64)
            .map_err(|source| self.classify_io_error(source))?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, msr: u32, value: u64) -> Result<()> {
        let _pin = AffinityGuard::pin(self.core_id)?;
        self.file
            .write_all_at(&value.to_ne_bytes(), msr as u64)
            .map_err(|source| self.classify_io_error(source))
    }

    /// Write-read round trip used to detect secure-boot systems that
    /// silently refuse MSR writes (spec.md §4.1). Leaves `msr` restored to
    /// its original value regardless of outcome. When a refusal is
    /// detected, marks this handle degraded so callers switch to
    /// perf-subsystem mode for subsequent programming.
    pub fn probe_write_protection(&self, msr: u32, probe_value: u64) -> Result<bool> {
        let original = self.read(msr)?;
        self.write(msr, probe_value)?;
        let observed = self.read(msr)?;
        self.write(msr, original)?;
        let refused = observed != probe_value;
        if refused {
            self.degraded.store(true, Ordering::Relaxed);
        }
        Ok(refused)
    }

    fn classify_io_error(&self, source: io::Error) -> RalError {
        match source.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => RalError::AccessDenied {
                core_id: self.core_id,
                source,
            },
            Some(libc::ENXIO) => RalError::Offline {
                core_id: self.core_id,
            },
            _ => RalError::AccessDenied {
                core_id: self.core_id,
                source,
            },
        }
    }
}

fn classify_open_error(core_id: u32, source: io::Error) -> RalError {
    match source.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ENXIO) => RalError::Offline { core_id },
        _ => RalError::AccessDenied { core_id, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_nonexistent_core_reports_offline_or_denied() {
        // Core 999999 does not exist on any real machine; whatever error
        // the open() call surfaces must classify to Offline or
        // AccessDenied, never panic.
        match MsrHandle::open(999_999) {
            Ok(_) => panic!("opening a nonexistent core's msr device should fail"),
            Err(RalError::Offline { core_id }) => assert_eq!(core_id, 999_999),
            Err(RalError::AccessDenied { core_id, .. }) => assert_eq!(core_id, 999_999),
            Err(other) => panic!("unexpected error variant: {other}"),
        }
    }
}
