//! The fixed, cacheline-aligned shared-memory layout (spec.md §6). The
//! constants here are part of the wire contract: any consumer mapping the
//! segment must agree on them.

pub const VERSION: &[u8; 12] = b"0.1.0\0\0\0\0\0\0\0";
pub const MAX_CPU_CORES: usize = 4096;
pub const MAX_SOCKETS: usize = 256;
pub const MEMORY_MAX_IMC_CHANNELS: usize = 12;
pub const QPI_MAX_LINKS_PER_SOCKET: usize = 4;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PcmCoreCounter {
    pub core_id: u32,
    pub valid: u8,
    pub _pad: [u8; 3],
    pub instructions_retired: u64,
    pub cycles_unhalted: u64,
    pub cycles_unhalted_ref: u64,
    pub invariant_tsc: u64,
    pub thermal_headroom: u32,
    pub smi_count: u32,
}

impl Default for PcmCoreCounter {
    fn default() -> Self {
        PcmCoreCounter {
            core_id: 0,
            valid: 0,
            _pad: [0; 3],
            instructions_retired: 0,
            cycles_unhalted: 0,
            cycles_unhalted_ref: 0,
            invariant_tsc: 0,
            thermal_headroom: 0,
            smi_count: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SharedSystemCounters {
    pub n_cores: u32,
    pub n_online_cores: u32,
    pub n_sockets: u32,
    pub n_online_sockets: u32,
    pub n_links_per_socket: u32,
}

impl Default for SharedSystemCounters {
    fn default() -> Self {
        SharedSystemCounters {
            n_cores: 0,
            n_online_cores: 0,
            n_sockets: 0,
            n_online_sockets: 0,
            n_links_per_socket: 0,
        }
    }
}

#[repr(C)]
pub struct SharedCoreCounters {
    pub cores: [PcmCoreCounter; MAX_CPU_CORES],
    pub pkg_energy_avail: u8,
    pub energy_per_socket: [f64; MAX_SOCKETS],
}

impl Default for SharedCoreCounters {
    fn default() -> Self {
        SharedCoreCounters {
            cores: [PcmCoreCounter::default(); MAX_CPU_CORES],
            pkg_energy_avail: 0,
            energy_per_socket: [0.0; MAX_SOCKETS],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct PcmMemSocket {
    pub dram_reads_bytes: u64,
    pub dram_writes_bytes: u64,
    pub pmem_reads_bytes: u64,
    pub pmem_writes_bytes: u64,
    pub per_channel_bytes: [u64; MEMORY_MAX_IMC_CHANNELS],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct PcmMemSystem {
    pub dram_reads_bytes_total: u64,
    pub dram_writes_bytes_total: u64,
}

#[repr(C)]
pub struct SharedMemoryCounters {
    pub sockets: [PcmMemSocket; MAX_SOCKETS],
    pub system: PcmMemSystem,
    pub dram_energy_avail: u8,
    pub pmm_avail: u8,
}

impl Default for SharedMemoryCounters {
    fn default() -> Self {
        SharedMemoryCounters {
            sockets: [PcmMemSocket::default(); MAX_SOCKETS],
            system: PcmMemSystem::default(),
            dram_energy_avail: 0,
            pmm_avail: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct PcmQpiSocket {
    pub links: [u64; QPI_MAX_LINKS_PER_SOCKET],
}

#[repr(C)]
pub struct SharedQpiCounters {
    pub incoming: [PcmQpiSocket; MAX_SOCKETS],
    pub incoming_total: u64,
    pub outgoing: [PcmQpiSocket; MAX_SOCKETS],
    pub outgoing_total: u64,
    pub in_avail: u8,
    pub out_avail: u8,
}

impl Default for SharedQpiCounters {
    fn default() -> Self {
        SharedQpiCounters {
            incoming: [PcmQpiSocket::default(); MAX_SOCKETS],
            incoming_total: 0,
            outgoing: [PcmQpiSocket::default(); MAX_SOCKETS],
            outgoing_total: 0,
            in_avail: 0,
            out_avail: 0,
        }
    }
}

#[repr(C)]
#[derive(Default)]
pub struct SharedPcmCounters {
    pub system: SharedSystemCounters,
    pub core: SharedCoreCounters,
    pub memory: SharedMemoryCounters,
    pub qpi: SharedQpiCounters,
}

/// The top-level region (spec.md §6). `last_update_tsc_begin`/`_end` bound
/// every other field for the lock-free reader protocol (spec.md §4.9);
/// `last_update_tsc_end` must be the physically last field written.
#[repr(C)]
pub struct SharedPcmState {
    pub version: [u8; 12],
    pub last_update_tsc_begin: u64,
    pub timestamp: u64,
    pub cycles_to_get_pcm_state: u64,
    pub poll_ms: u32,
    pub pcm: SharedPcmCounters,
    pub last_update_tsc_end: u64,
}

impl Default for SharedPcmState {
    fn default() -> Self {
        SharedPcmState {
            version: *VERSION,
            last_update_tsc_begin: 0,
            timestamp: 0,
            cycles_to_get_pcm_state: 0,
            poll_ms: 0,
            pcm: SharedPcmCounters::default(),
            last_update_tsc_end: 0,
        }
    }
}

pub const SEGMENT_SIZE: usize = std::mem::size_of::<SharedPcmState>();
