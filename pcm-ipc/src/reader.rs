//! Lock-free reader side of the shared-memory protocol (spec.md §4.9).

use std::fs::OpenOptions;
use std::sync::atomic::{fence, Ordering};

use memmap2::{Mmap, MmapOptions};

use crate::error::{IpcError, Result};
use crate::layout::*;

const MAX_RETRIES: u32 = 1000;

pub struct SharedMemoryReader {
    map: Mmap,
}

impl SharedMemoryReader {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path.as_ref())
            .map_err(|source| IpcError::Create {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        let map = unsafe { MmapOptions::new().len(SEGMENT_SIZE).map(&file) }
            .map_err(|source| IpcError::Map { source })?;
        let reader = SharedMemoryReader { map };
        reader.check_version()?;
        Ok(reader)
    }

    fn state_ptr(&self) -> *const SharedPcmState {
        self.map.as_ptr() as *const SharedPcmState
    }

    fn check_version(&self) -> Result<()> {
        let found = unsafe { std::ptr::addr_of!((*self.state_ptr()).version).read_volatile() };
        if &found != VERSION {
            return Err(IpcError::VersionMismatch {
                found,
                expected: *VERSION,
            });
        }
        Ok(())
    }

    fn read_end(&self) -> u64 {
        unsafe { std::ptr::addr_of!((*self.state_ptr()).last_update_tsc_end).read_volatile() }
    }

    fn read_begin(&self) -> u64 {
        unsafe { std::ptr::addr_of!((*self.state_ptr()).last_update_tsc_begin).read_volatile() }
    }

    /// Copies the whole region and validates it wasn't torn by a
    /// concurrent publish, per the retry loop in spec.md §4.9. Returns a
    /// boxed copy since the segment is too large to move on the stack.
    pub fn read_snapshot(&self) -> Result<Box<SharedPcmState>> {
        for _ in 0..MAX_RETRIES {
            let end_before = self.read_end();
            fence(Ordering::Acquire);

            let copy = unsafe { std::ptr::read_volatile(self.state_ptr()) };
            let boxed = Box::new(copy);

            fence(Ordering::Acquire);
            let begin_after = self.read_begin();
            let end_after = self.read_end();

            if end_before == end_after && begin_after <= end_before {
                return Ok(boxed);
            }
        }
        Err(IpcError::TornRead(MAX_RETRIES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_is_detected() {
        let found = *b"0.0.0\0\0\0\0\0\0\0";
        let err = IpcError::VersionMismatch {
            found,
            expected: *VERSION,
        };
        assert!(matches!(err, IpcError::VersionMismatch { .. }));
    }
}
