//! TPMI/DVSEC-based uncore PMU discovery (spec.md §4.4, §6; SPEC_FULL.md
//! §2 "TPMI-based uncore discovery"): walks the extended PCI capability
//! list of every Intel function looking for the uncore discovery DVSEC,
//! maps the PFS (Presence Field Set) table its BAR points at, and turns
//! every box entry this crate knows how to program into an [`UncorePmu`]
//! ready for [`crate::engine::CounterEngine::register_uncore_box`].
//!
//! Only `SPR_PCU_BOX_TYPE` has a numeric box-type ID grounded in the
//! available reference sources; other discovered box types (IMC/CHA/M2M/
//! xPI/Ubox/IIO) are logged at `debug!` with their raw type ID and
//! skipped rather than guessed at. Gated off entirely by
//! `PCM_NO_UNCORE_PMU_DISCOVERY=1`, matching the upstream tool's own
//! switch — there is no separate static address table to fall back to in
//! that case, so a socket simply registers zero uncore boxes.

use pcm_ral::{MmioRange, PciAddress, PciHandle, RegisterHandle};
use pcm_topology::{SystemRoot, UncoreVariant};

use crate::uncore_pmu::{UncoreBoxKind, UncorePmu};

const UNCORE_DISCOVERY_MAP_SIZE: usize = 0x8_0000;
const UNCORE_EXT_CAP_ID_DISCOVERY: u64 = 0x23;
const UNCORE_DISCOVERY_DVSEC_ID_PMON: u64 = 1;
const PCI_VENDOR_INTEL: u32 = 0x8086;
const CAP_LIST_OFFSET: u16 = 0x100;
const MAX_CAP_WALK_STEPS: u32 = 64;

const SPR_PCU_BOX_TYPE: u16 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AccessType {
    Msr,
    Mmio,
    PciCfg,
    Unknown,
}

impl AccessType {
    fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => AccessType::Msr,
            1 => AccessType::Mmio,
            2 => AccessType::PciCfg,
            _ => AccessType::Unknown,
        }
    }
}

struct GlobalPmu {
    stride: u64,
    max_units: u64,
}

struct BoxPmu {
    num_regs: u64,
    ctrl_offset: u64,
    bit_width: u64,
    ctr_offset: u64,
    access_type: AccessType,
    box_ctrl_addr: u64,
    box_type: u16,
}

fn parse_global(words: [u64; 3]) -> GlobalPmu {
    GlobalPmu {
        stride: (words[0] >> 8) & 0xff,
        max_units: (words[0] >> 16) & 0x3ff,
    }
}

fn parse_box(words: [u64; 3]) -> BoxPmu {
    BoxPmu {
        num_regs: words[0] & 0xff,
        ctrl_offset: (words[0] >> 8) & 0xff,
        bit_width: (words[0] >> 16) & 0xff,
        ctr_offset: (words[0] >> 24) & 0xff,
        access_type: AccessType::from_bits(words[0] >> 62),
        box_ctrl_addr: words[1],
        box_type: (words[2] & 0xffff) as u16,
    }
}

/// Byte stride between consecutive counters within one box, per the
/// access type's natural register width (spec.md §6 PFS table).
fn register_step(access_type: AccessType, bit_width: u64) -> u64 {
    match access_type {
        AccessType::Msr => 1,
        AccessType::PciCfg | AccessType::Mmio => match bit_width {
            0..=8 => 1,
            9..=16 => 2,
            17..=32 => 4,
            _ => 8,
        },
        AccessType::Unknown => 0,
    }
}

fn read_table(range: &MmioRange, offset: usize) -> pcm_ral::Result<[u64; 3]> {
    let mut words = [0u64; 3];
    for (i, word) in words.iter_mut().enumerate() {
        *word = range.read64(offset + i * 8)?;
    }
    Ok(words)
}

/// Maps the PFS table at `bar` and returns every box entry it lists,
/// skipping invalid (all-zero) unit slots (spec.md §6).
fn parse_discovery_table(bar: u64) -> pcm_ral::Result<Vec<BoxPmu>> {
    let range = MmioRange::open(bar, UNCORE_DISCOVERY_MAP_SIZE, true)?;
    let global = parse_global(read_table(&range, 0)?);
    let step = (global.stride * 8) as usize;

    let mut boxes = Vec::new();
    for unit in 0..global.max_units {
        let offset = (unit as usize + 1) * step;
        let words = read_table(&range, offset)?;
        if words[0] == 0 && words[1] == 0 {
            continue;
        }
        boxes.push(parse_box(words));
    }
    Ok(boxes)
}

/// Walks one PCI function's extended capability list looking for the
/// uncore discovery DVSEC, returning the PFS table's BAR if found.
fn find_discovery_bar(handle: &PciHandle) -> Option<u32> {
    let mut offset = CAP_LIST_OFFSET;
    for _ in 0..MAX_CAP_WALK_STEPS {
        if offset == 0 {
            return None;
        }
        let word0 = handle.read64(offset).ok()?;
        if word0 == 0 {
            return None;
        }
        let word1 = handle.read64(offset + 8).ok()?;

        let cap_id = word0 & 0xffff;
        let cap_next = ((word0 >> 20) & 0xfff) as u16;
        if cap_id == UNCORE_EXT_CAP_ID_DISCOVERY {
            let entry_id = word1 & 0xffff;
            if entry_id == UNCORE_DISCOVERY_DVSEC_ID_PMON {
                let t_bir = (word1 >> 32) & 0x7;
                let bar_offset = (0x10 + t_bir * 4) as u16;
                match handle.read32(bar_offset) {
                    Ok(bar) if bar != 0 => return Some(bar & !0xfff),
                    Ok(_) => {}
                    Err(err) => log::debug!("uncore discovery: bar read failed on {:?}: {err}", handle.address()),
                }
            }
        }
        offset = cap_next & !0x3;
    }
    None
}

/// One socket's worth of discovered boxes, in PCI scan order — the same
/// simplification the discovery mechanism itself makes (each qualifying
/// device's PFS table describes one socket's uncore).
fn discover_socket_boxes(address: PciAddress) -> Option<Vec<BoxPmu>> {
    let handle = PciHandle::open(address).ok()?;
    let vendor_device = handle.read32(0).ok()?;
    if (vendor_device & 0xffff) as u32 != PCI_VENDOR_INTEL {
        return None;
    }
    let status = handle.read32(6).ok()?;
    if status & 0x10 == 0 {
        // No capability list on this function.
        return None;
    }
    let bar = find_discovery_bar(&handle)?;
    match parse_discovery_table(bar as u64) {
        Ok(boxes) => Some(boxes),
        Err(err) => {
            log::debug!("uncore discovery: PFS table read failed at bar 0x{bar:x}: {err}");
            None
        }
    }
}

fn build_pmu(box_: &BoxPmu, kind: UncoreBoxKind, reference_os_id: u32) -> Option<UncorePmu> {
    if box_.access_type == AccessType::Unknown {
        log::debug!("uncore discovery: box type {} has an unrecognized access type, skipping", box_.box_type);
        return None;
    }
    if box_.access_type == AccessType::PciCfg {
        // PCICFG-access boxes address registers as raw PCI config offsets
        // under the box's own BDF, which this discovery pass doesn't
        // resolve a `PciAddress` for; leave them unregistered for now
        // rather than guess at a device/function split.
        log::debug!("uncore discovery: box type {} uses PCICFG access, not yet supported", box_.box_type);
        return None;
    }

    let step = register_step(box_.access_type, box_.bit_width);
    if step == 0 || box_.num_regs == 0 {
        return None;
    }
    let num_regs = box_.num_regs.min(4) as usize;

    let handle_at = |reg_offset: u64, c: u64| -> Option<RegisterHandle> {
        let addr = box_.box_ctrl_addr + reg_offset + c * step;
        match box_.access_type {
            AccessType::Msr => pcm_ral::MsrHandle::open(reference_os_id).ok().map(|h| RegisterHandle::Msr(h, addr as u32)),
            AccessType::Mmio => {
                let page_base = addr & !0xfff;
                let within_page = (addr - page_base) as usize;
                MmioRange::open(page_base, 0x1000, false).ok().map(|m| RegisterHandle::Mmio(m, within_page))
            }
            AccessType::PciCfg | AccessType::Unknown => None,
        }
    };

    let mut counter_control = Vec::with_capacity(num_regs);
    let mut counter_value = Vec::with_capacity(num_regs);
    for c in 0..num_regs as u64 {
        let ctrl = handle_at(box_.ctrl_offset, c)?;
        let value = handle_at(box_.ctr_offset, c)?;
        counter_control.push(ctrl);
        counter_value.push(std::sync::Arc::new(value));
    }

    Some(UncorePmu::new(kind, None, counter_control, counter_value))
}

/// Discovers and registers every uncore box this crate can address on
/// `topology`'s server-class sockets. Client sockets (spec.md §2,
/// SPEC_FULL.md §2 "Client (non-server) uncore path") register none —
/// the reduced desktop/laptop uncore never carries the DVSEC discovery
/// capability this walk looks for, so skipping them outright is both
/// correct and avoids a wasted PCI scan per socket.
pub fn register_discovered_boxes(topology: &SystemRoot, register: impl Fn(usize, UncorePmu)) {
    if std::env::var("PCM_NO_UNCORE_PMU_DISCOVERY").as_deref() == Ok("1") {
        log::info!("uncore PMU discovery disabled via PCM_NO_UNCORE_PMU_DISCOVERY");
        return;
    }

    let server_sockets = topology.sockets.iter().filter(|s| s.uncore_variant == UncoreVariant::Server).count();
    if server_sockets == 0 {
        return;
    }

    let mut socket_index = 0usize;
    for segment in pcm_ral::pci::discover_segment_groups() {
        for address in pcm_ral::pci::enumerate_devices(segment) {
            let Some(boxes) = discover_socket_boxes(address) else {
                continue;
            };
            let Some(socket) = topology.sockets.get(socket_index) else {
                break;
            };
            if socket.uncore_variant != UncoreVariant::Server {
                socket_index += 1;
                continue;
            }
            let Some(reference_os_id) = topology
                .reference_core_thread(socket_index)
                .map(|idx| topology.hyperthreads[idx as usize].entry.os_id)
            else {
                socket_index += 1;
                continue;
            };
            let mut registered = 0;
            for box_ in &boxes {
                if box_.box_type != SPR_PCU_BOX_TYPE {
                    log::debug!("uncore discovery: socket {socket_index} box type {} has no grounded role mapping yet, skipping", box_.box_type);
                    continue;
                }
                if let Some(pmu) = build_pmu(box_, UncoreBoxKind::Pcu, reference_os_id) {
                    register(socket_index, pmu);
                    registered += 1;
                }
            }
            log::info!("uncore discovery: socket {socket_index} registered {registered} box(es)");
            socket_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_step_matches_access_type_width() {
        assert_eq!(register_step(AccessType::Msr, 48), 1);
        assert_eq!(register_step(AccessType::Mmio, 8), 1);
        assert_eq!(register_step(AccessType::Mmio, 16), 2);
        assert_eq!(register_step(AccessType::Mmio, 32), 4);
        assert_eq!(register_step(AccessType::Mmio, 48), 8);
        assert_eq!(register_step(AccessType::Unknown, 32), 0);
    }

    #[test]
    fn parse_global_pmu_extracts_stride_and_max_units() {
        // type:8=0 | stride:8=8 | maxUnits:10=12 packed from bit 16.
        let word0 = (8u64 << 8) | (12u64 << 16);
        let global = parse_global([word0, 0, 0]);
        assert_eq!(global.stride, 8);
        assert_eq!(global.max_units, 12);
    }

    #[test]
    fn parse_box_pmu_extracts_layout_fields() {
        // numRegs:8=4 | ctrlOffset:8=0x10 | bitWidth:8=48 | ctrOffset:8=0x18,
        // accessType:2=1 (Mmio) at bit 62.
        let word0 = 4u64 | (0x10 << 8) | (48u64 << 16) | (0x18 << 24) | (1u64 << 62);
        let word2 = SPR_PCU_BOX_TYPE as u64;
        let box_ = parse_box([word0, 0xdead_beef, word2]);
        assert_eq!(box_.num_regs, 4);
        assert_eq!(box_.ctrl_offset, 0x10);
        assert_eq!(box_.bit_width, 48);
        assert_eq!(box_.ctr_offset, 0x18);
        assert_eq!(box_.access_type, AccessType::Mmio);
        assert_eq!(box_.box_ctrl_addr, 0xdead_beef);
        assert_eq!(box_.box_type, SPR_PCU_BOX_TYPE);
    }
}
