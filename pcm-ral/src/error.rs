use thiserror::Error;

/// Error taxonomy for the register access layer, matching the init/operate
/// split used throughout the rest of the crate: `AccessDenied` and
/// `Offline` are fatal for the affected register only, never for the
/// whole process.
#[derive(Debug, Error)]
pub enum RalError {
    #[error("access denied reading/writing register on core {core_id}: {source}")]
    AccessDenied {
        core_id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("core {core_id} is offline")]
    Offline { core_id: u32 },

    #[error("PCI device {0:04x}:{1:02x}:{2:02x}.{3} not present")]
    NotPresent(u16, u8, u8, u8),

    #[error("MMIO read returned all-ones at offset {offset:#x} of {phys_addr:#x}")]
    TransientIo { phys_addr: u64, offset: u64 },

    #[error("failed to map {size} bytes at physical address {phys_addr:#x}: {source}")]
    MmapFailed {
        phys_addr: u64,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("PMU is owned by another instance (scope: {scope})")]
    PmuBusy { scope: &'static str },

    #[error("sched_setaffinity failed for core {core_id}: {source}")]
    AffinityFailed {
        core_id: u32,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RalError>;
