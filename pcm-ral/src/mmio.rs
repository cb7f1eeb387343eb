use std::fs::OpenOptions;
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapOptions, MmapRaw};

use crate::error::{RalError, Result};

/// A scoped mapping of a physical address range, backed by `/dev/mem`.
/// The mapping (and the underlying `mmap`) is released when this value is
/// dropped, satisfying the RAL's "guarantee release when out of scope"
/// requirement.
pub struct MmioRange {
    phys_addr: u64,
    size: usize,
    readonly: bool,
    map: MmapRaw,
}

impl MmioRange {
    pub fn open(phys_addr: u64, size: usize, readonly: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open("/dev/mem")
            .map_err(|source| RalError::MmapFailed {
                phys_addr,
                size,
                source,
            })?;

        let map = unsafe {
            MmapOptions::new()
                .offset(phys_addr)
                .len(size)
                .map_raw(&file)
                .map_err(|source| RalError::MmapFailed {
                    phys_addr,
                    size,
                    source,
                })?
        };

        Ok(MmioRange {
            phys_addr,
            size,
            readonly,
            map,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read32(&self, offset: usize) -> Result<u32> {
        let value = unsafe { self.ptr32(offset).read_volatile() };
        fence(Ordering::Acquire);
        if value == u32::MAX {
            return Err(RalError::TransientIo {
                phys_addr: self.phys_addr,
                offset: offset as u64,
            });
        }
        Ok(value)
    }

    pub fn read64(&self, offset: usize) -> Result<u64> {
        let value = unsafe { self.ptr64(offset).read_volatile() };
        fence(Ordering::Acquire);
        if value == u64::MAX {
            return Err(RalError::TransientIo {
                phys_addr: self.phys_addr,
                offset: offset as u64,
            });
        }
        Ok(value)
    }

    pub fn write32(&self, offset: usize, value: u32) -> Result<()> {
        assert!(!self.readonly, "write to a readonly MMIO range");
        unsafe { self.ptr32_mut(offset).write_volatile(value) };
        fence(Ordering::Release);
        Ok(())
    }

    pub fn write64(&self, offset: usize, value: u64) -> Result<()> {
        assert!(!self.readonly, "write to a readonly MMIO range");
        unsafe { self.ptr64_mut(offset).write_volatile(value) };
        fence(Ordering::Release);
        Ok(())
    }

    unsafe fn ptr32(&self, offset: usize) -> *const u32 {
        self.map.as_ptr().add(offset) as *const u32
    }

    unsafe fn ptr64(&self, offset: usize) -> *const u64 {
        self.map.as_ptr().add(offset) as *const u64
    }

    unsafe fn ptr32_mut(&self, offset: usize) -> *mut u32 {
        self.map.as_mut_ptr().add(offset) as *mut u32
    }

    unsafe fn ptr64_mut(&self, offset: usize) -> *mut u64 {
        self.map.as_mut_ptr().add(offset) as *mut u64
    }
}

// SAFETY: the mapping is only ever dereferenced through the volatile
// accessors above, which do not alias Rust-level references across
// threads; the underlying device register file provides whatever
// synchronization the hardware needs.
unsafe impl Send for MmioRange {}
unsafe impl Sync for MmioRange {}
