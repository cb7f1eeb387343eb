use crate::error::{RalError, Result};

/// Pins the calling OS thread to a single logical processor for the
/// lifetime of the guard, restoring the thread's previous affinity mask
/// on drop. Used by the MSR path (where `CPUID`/`RDMSR` must execute on
/// the target core) and by the topology enumerator's CPUID probing.
pub struct AffinityGuard {
    previous: libc::cpu_set_t,
}

impl AffinityGuard {
    /// Pins to `core_id`. Fails with [`RalError::Offline`] if the kernel
    /// reports the core is not currently schedulable, or
    /// [`RalError::AffinityFailed`] for any other `sched_setaffinity`
    /// failure.
    pub fn pin(core_id: u32) -> Result<Self> {
        unsafe {
            let mut previous: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &mut previous,
            ) != 0
            {
                return Err(RalError::AffinityFailed {
                    core_id,
                    source: std::io::Error::last_os_error(),
                });
            }

            let mut target: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut target);
            libc::CPU_SET(core_id as usize, &mut target);

            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &target) != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINVAL) {
                    return Err(RalError::Offline { core_id });
                }
                return Err(RalError::AffinityFailed {
                    core_id,
                    source: err,
                });
            }

            Ok(AffinityGuard { previous })
        }
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        unsafe {
            // Best-effort restore; there's nothing sensible to do with a
            // failure here other than log it, and this crate has no
            // logging context (core id) left at this point.
            let _ = libc::sched_setaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &self.previous,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_to_current_core_succeeds() {
        // Pinning to core 0 should always be possible in test environments
        // (it may already be excluded from the runtime's affinity mask on
        // some CI containers, so tolerate Offline too).
        match AffinityGuard::pin(0) {
            Ok(_) | Err(RalError::Offline { .. }) => {}
            Err(e) => panic!("unexpected affinity error: {e}"),
        }
    }
}
