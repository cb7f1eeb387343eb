//! Uniform read/write access to MSRs, PCI configuration space, and MMIO
//! regions, plus core affinity pinning and the PMU instance lock.

pub mod affinity;
pub mod error;
pub mod lock;
pub mod mmio;
pub mod msr;
pub mod pci;

pub use affinity::AffinityGuard;
pub use error::{RalError, Result};
pub use lock::{InstanceLock, LockMode, LockScope};
pub use mmio::MmioRange;
pub use msr::MsrHandle;
pub use pci::{PciAddress, PciHandle};

/// A box descriptor's register, as one of the three access types named in
/// spec.md §3 (`RegisterHandle`). Each PMU programmer holds a set of
/// these rather than caring how the address resolves underneath.
///
/// Every variant carries the register's own bound address alongside the
/// handle (an MSR number, a PCI config-space offset, or an MMIO offset
/// within an already-mapped box). Callers that only ever own one register
/// per handle — the common case — address it as offset `0`; the bound
/// address is added underneath so a single `MsrHandle` (which, unlike
/// `PciHandle`/`MmioRange`, isn't pinned to one register by construction)
/// can still be wrapped per-register like the other two variants.
pub enum RegisterHandle {
    Msr(MsrHandle, u32),
    Pci(PciHandle, u16),
    Mmio(MmioRange, usize),
}

impl RegisterHandle {
    pub fn read64(&self, offset: u32) -> Result<u64> {
        match self {
            RegisterHandle::Msr(h, base) => h.read(base.wrapping_add(offset)),
            RegisterHandle::Pci(h, base) => h.read64(base.wrapping_add(offset as u16)),
            RegisterHandle::Mmio(h, base) => h.read64(base.wrapping_add(offset as usize)),
        }
    }

    pub fn write64(&self, offset: u32, value: u64) -> Result<()> {
        match self {
            RegisterHandle::Msr(h, base) => h.write(base.wrapping_add(offset), value),
            RegisterHandle::Pci(h, base) => h.write64(base.wrapping_add(offset as u16), value),
            RegisterHandle::Mmio(h, base) => h.write64(base.wrapping_add(offset as usize), value),
        }
    }

    pub fn read32(&self, offset: u32) -> Result<u32> {
        match self {
            RegisterHandle::Msr(h, base) => h.read(base.wrapping_add(offset)).map(|v| v as u32),
            RegisterHandle::Pci(h, base) => h.read32(base.wrapping_add(offset as u16)),
            RegisterHandle::Mmio(h, base) => h.read32(base.wrapping_add(offset as usize)),
        }
    }

    pub fn write32(&self, offset: u32, value: u32) -> Result<()> {
        match self {
            RegisterHandle::Msr(h, base) => h.write(base.wrapping_add(offset), value as u64),
            RegisterHandle::Pci(h, base) => h.write32(base.wrapping_add(offset as u16), value),
            RegisterHandle::Mmio(h, base) => h.write32(base.wrapping_add(offset as usize), value),
        }
    }
}
