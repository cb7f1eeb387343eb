use std::collections::HashMap;

use pcm_ral::AffinityGuard;

use crate::cpuid::{self, LevelType};
use crate::error::{Result, TopologyError};
use crate::tree::{Core, HyperThread, Socket, SystemRoot, TopologyEntry, UncoreVariant};

/// Set via `PCM_IGNORE_ARCH_PERFMON=1`; allows startup on hypervisor
/// guests that don't advertise `arch_perfmon` (spec.md §4.2 step 5, §6).
pub struct BuildOptions {
    pub ignore_arch_perfmon: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            ignore_arch_perfmon: std::env::var("PCM_IGNORE_ARCH_PERFMON").as_deref() == Ok("1"),
        }
    }
}

struct RawCpu {
    os_id: u32,
    online: bool,
    apic_id: u32,
    smt_mask_width: u32,
    core_mask_width: u32,
    tile_shift: u32,
}

/// Lists every OS-visible CPU id and whether it is currently online, by
/// walking `/sys/devices/system/cpu/cpu*`.
fn enumerate_os_cpus() -> Vec<(u32, bool)> {
    let mut cpus = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/cpu") else {
        return cpus;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(digits) = name.strip_prefix("cpu") else {
            continue;
        };
        let Ok(os_id) = digits.parse::<u32>() else {
            continue;
        };
        let online_path = entry.path().join("online");
        let online = match std::fs::read_to_string(&online_path) {
            Ok(content) => content.trim() == "1",
            // cpu0 has no "online" file on most kernels and is always online.
            Err(_) => os_id == 0,
        };
        cpus.push((os_id, online));
    }
    cpus.sort_unstable_by_key(|&(id, _)| id);
    cpus
}

fn probe_cpu(os_id: u32) -> Result<RawCpu> {
    let _pin = AffinityGuard::pin(os_id)?;

    let leaves = cpuid::read_extended_topology();
    let mut smt_mask_width = 0u32;
    let mut core_mask_width = 0u32;
    let mut apic_id = 0u32;
    let mut saw_smt = false;
    let mut saw_core = false;

    for (i, leaf) in leaves.iter().enumerate() {
        if i == 0 {
            apic_id = leaf.x2apic_id;
        }
        match leaf.level_type {
            LevelType::Smt if !saw_smt => {
                smt_mask_width = leaf.shift_width;
                saw_smt = true;
            }
            LevelType::Core if !saw_core => {
                core_mask_width = leaf.shift_width;
                saw_core = true;
            }
            _ => {}
        }
    }
    if !saw_core {
        // "If only SMT reported, core_mask_width = smt_mask_width" (spec.md §4.2 step 1).
        core_mask_width = smt_mask_width;
    }

    let tile_shift = cpuid::l2_share_shift();

    Ok(RawCpu {
        os_id,
        online: true,
        apic_id,
        smt_mask_width,
        core_mask_width,
        tile_shift,
    })
}

/// Runs the full discovery algorithm of spec.md §4.2 and returns the
/// frozen topology tree.
pub fn discover(options: &BuildOptions) -> Result<SystemRoot> {
    if cpuid::is_hypervisor()
        && cpuid::arch_perfmon_version() == 0
        && !options.ignore_arch_perfmon
    {
        return Err(TopologyError::UnsupportedGuest);
    }

    let os_cpus = enumerate_os_cpus();
    if os_cpus.iter().all(|&(_, online)| !online) {
        return Err(TopologyError::NoOnlineProcessors);
    }

    let mut entries: Vec<TopologyEntry> = Vec::with_capacity(os_cpus.len());
    let mut apic_socket_order: Vec<u32> = Vec::new();
    let mut apic_to_logical_socket: HashMap<u32, u32> = HashMap::new();

    for (os_id, online) in os_cpus {
        if !online {
            entries.push(TopologyEntry {
                os_id,
                apic_id: None,
                socket_id: 0,
                core_id: 0,
                tile_id: 0,
                thread_id: 0,
                online: false,
            });
            continue;
        }

        let raw = probe_cpu(os_id)?;
        let thread_mask = mask(raw.smt_mask_width);
        let core_mask = mask(raw.core_mask_width.saturating_sub(raw.smt_mask_width));

        let thread_id = raw.apic_id & thread_mask;
        let core_id = (raw.apic_id >> raw.smt_mask_width) & core_mask;
        let apic_socket = raw.apic_id >> raw.core_mask_width;
        let tile_id = if raw.tile_shift > 0 {
            raw.apic_id >> raw.tile_shift
        } else {
            0
        };

        let logical_socket = *apic_to_logical_socket.entry(apic_socket).or_insert_with(|| {
            apic_socket_order.push(apic_socket);
            (apic_socket_order.len() - 1) as u32
        });

        entries.push(TopologyEntry {
            os_id,
            apic_id: Some(raw.apic_id),
            socket_id: logical_socket,
            core_id,
            tile_id,
            thread_id,
            online: true,
        });
    }

    Ok(build_tree(entries))
}

fn mask(width: u32) -> u32 {
    if width == 0 {
        0
    } else if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

fn build_tree(entries: Vec<TopologyEntry>) -> SystemRoot {
    let mut hyperthreads = Vec::with_capacity(entries.len());
    // (socket_id, core_id) -> core arena index
    let mut core_index: HashMap<(u32, u32), u32> = HashMap::new();
    let mut cores: Vec<Core> = Vec::new();
    // socket_id -> socket arena index
    let mut socket_index: HashMap<u32, u32> = HashMap::new();
    let mut sockets: Vec<Socket> = Vec::new();

    for entry in entries {
        let socket_id = entry.socket_id;
        let core_id = entry.core_id;
        let thread_idx = hyperthreads.len() as u32;

        let c_idx = *core_index.entry((socket_id, core_id)).or_insert_with(|| {
            cores.push(Core {
                core_id,
                threads: Vec::new(),
            });
            (cores.len() - 1) as u32
        });
        cores[c_idx as usize].threads.push(thread_idx);

        socket_index.entry(socket_id).or_insert_with(|| {
            sockets.push(Socket {
                socket_id,
                cores: Vec::new(),
                reference_core_index: c_idx,
                uncore_variant: UncoreVariant::Server,
            });
            (sockets.len() - 1) as u32
        });

        hyperthreads.push(HyperThread { entry, msr: None });
    }

    for (&(socket_id, _), &c_idx) in &core_index {
        let s_idx = socket_index[&socket_id] as usize;
        if !sockets[s_idx].cores.contains(&c_idx) {
            sockets[s_idx].cores.push(c_idx);
        }
    }
    for socket in &mut sockets {
        socket.cores.sort_unstable();
        // The reference core is the lowest online core id in the socket.
        if let Some(&min_idx) = socket.cores.first() {
            socket.reference_core_index = min_idx;
        }
        socket.uncore_variant = if sockets_are_multi_socket_capable(&socket.cores, &cores) {
            UncoreVariant::Server
        } else {
            UncoreVariant::Client
        };
    }

    SystemRoot {
        hyperthreads,
        cores,
        sockets,
    }
}

/// Server-class (family 0x06) model IDs that expose the full uncore set
/// (CHA/M2M/UPI/PCU): Skylake-SP/Cascade Lake-SP/Cooper Lake-SP (0x55),
/// Ice Lake-SP (0x6a/0x6c), Sapphire Rapids (0x8f). Any other model is
/// treated as a client part with the reduced `UncoreVariant::Client` set
/// (SPEC_FULL.md §2 "Client (non-server) uncore path") —
/// `pcm_engine::register_discovered_boxes` skips `Client` sockets outright,
/// since the DVSEC discovery capability it looks for is a server-uncore
/// feature.
const SERVER_MODELS: &[u8] = &[0x55, 0x6a, 0x6c, 0x8f];

fn sockets_are_multi_socket_capable(_cores: &[u32], _all_cores: &[Core]) -> bool {
    let leaf1 = cpuid::cpuid_count(0x01, 0);
    let family = ((leaf1.eax >> 8) & 0xf) as u8;
    let model_id = ((leaf1.eax >> 4) & 0xf) as u8 | (((leaf1.eax >> 16) & 0xf) as u8) << 4;
    family == 0x06 && SERVER_MODELS.contains(&model_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_handles_edge_widths() {
        assert_eq!(mask(0), 0);
        assert_eq!(mask(1), 1);
        assert_eq!(mask(3), 7);
        assert_eq!(mask(32), u32::MAX);
    }

    #[test]
    fn build_tree_groups_threads_under_cores_and_sockets() {
        let entries = vec![
            TopologyEntry {
                os_id: 0,
                apic_id: Some(0),
                socket_id: 0,
                core_id: 0,
                tile_id: 0,
                thread_id: 0,
                online: true,
            },
            TopologyEntry {
                os_id: 1,
                apic_id: Some(1),
                socket_id: 0,
                core_id: 0,
                tile_id: 0,
                thread_id: 1,
                online: true,
            },
            TopologyEntry {
                os_id: 2,
                apic_id: Some(2),
                socket_id: 0,
                core_id: 1,
                tile_id: 0,
                thread_id: 0,
                online: true,
            },
        ];
        let root = build_tree(entries);
        assert_eq!(root.sockets.len(), 1);
        assert_eq!(root.cores.len(), 2);
        assert_eq!(root.hyperthreads.len(), 3);
        assert_eq!(root.cores[0].threads.len(), 2);
        assert_eq!(root.cores[1].threads.len(), 1);
    }

    #[test]
    fn offline_entries_get_placeholder_apic_and_zeroed_ids() {
        let entries = vec![TopologyEntry {
            os_id: 5,
            apic_id: None,
            socket_id: 0,
            core_id: 0,
            tile_id: 0,
            thread_id: 0,
            online: false,
        }];
        let root = build_tree(entries);
        assert_eq!(root.online_thread_count(), 0);
        assert!(!root.hyperthreads[0].entry.online);
        assert!(root.hyperthreads[0].entry.apic_id.is_none());
    }
}
