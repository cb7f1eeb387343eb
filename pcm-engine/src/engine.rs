//! The Counter Engine (spec.md §4.5): `program`/`sample_*`/`cleanup` and
//! the state machine that guards them.

use std::sync::Arc;

use parking_lot::Mutex;
use pcm_ral::{InstanceLock, LockMode, LockScope, MsrHandle, RalError};
use pcm_topology::SystemRoot;

use crate::core_pmu::{self, ProgrammedCore};
use crate::error::{EngineError, Result};
use crate::mode::ProgramMode;
use crate::state::{BasicCounterState, SocketCounterState, SystemCounterState, UncoreCounterState};
use crate::uncore_pmu::{UncoreBoxKind, UncorePmu};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EngineState {
    Uninitialized,
    Programmed,
}

/// Owns every programmed register on the machine for as long as it's
/// alive. Created once at startup and handed to the sampling loop, HTTP
/// server and shared-memory publisher (spec.md §9: no global singleton).
pub struct CounterEngine {
    topology: Arc<SystemRoot>,
    state: Mutex<EngineState>,
    thread_msrs: Mutex<Vec<Option<MsrHandle>>>,
    programmed_cores: Mutex<Vec<Option<ProgrammedCore>>>,
    uncore_boxes: Mutex<Vec<Vec<UncorePmu>>>,
    clamp_guest_counters: bool,
    _lock: Mutex<Option<InstanceLock>>,
}

impl CounterEngine {
    pub fn new(topology: Arc<SystemRoot>) -> Self {
        let thread_count = topology.hyperthreads.len();
        let socket_count = topology.sockets.len();
        CounterEngine {
            topology,
            state: Mutex::new(EngineState::Uninitialized),
            thread_msrs: Mutex::new((0..thread_count).map(|_| None).collect()),
            programmed_cores: Mutex::new((0..thread_count).map(|_| None).collect()),
            uncore_boxes: Mutex::new((0..socket_count).map(|_| Vec::new()).collect()),
            clamp_guest_counters: pcm_topology::cpuid::is_hypervisor()
                && std::env::var("PCM_NO_AWS_WORKAROUND").as_deref() != Ok("1"),
            _lock: Mutex::new(None),
        }
    }

    /// Registers an already-addressed uncore box under a socket, so
    /// `sample_socket`/`sample_system` pick it up. Address resolution
    /// (`uncore_discovery::register_discovered_boxes`, SPEC_FULL.md §2)
    /// happens upstream of the `CounterEngine` itself, called from the
    /// `pcm` binary before `program()`.
    pub fn register_uncore_box(&self, socket_index: usize, box_: UncorePmu) {
        self.uncore_boxes.lock()[socket_index].push(box_);
    }

    pub fn topology(&self) -> &SystemRoot {
        &self.topology
    }

    /// Idempotent per process; fails with `PmuBusy` if another owner holds
    /// the Instance Lock (spec.md §4.5, §4.1).
    pub fn program(&self, mode: ProgramMode) -> Result<()> {
        let mut state = self.state.lock();
        if *state == EngineState::Programmed {
            return Ok(());
        }

        let lock = InstanceLock::acquire(LockScope::Process, LockMode::Exclusive).map_err(map_lock_error)?;

        let tsx_present = core_pmu::tsx_force_abort_feature_present();

        let mut thread_msrs = self.thread_msrs.lock();
        let mut programmed = self.programmed_cores.lock();
        for (idx, thread) in self.topology.hyperthreads.iter().enumerate() {
            if !thread.entry.online {
                continue;
            }
            if thread_msrs[idx].is_none() {
                let handle = MsrHandle::open(thread.entry.os_id)?;
                thread_msrs[idx] = Some(handle);
            }
            let msr = thread_msrs[idx].as_ref().unwrap();
            let result = core_pmu::program(msr, &mode, self.clamp_guest_counters, tsx_present)?;
            programmed[idx] = Some(result);
        }

        for boxes in self.uncore_boxes.lock().iter_mut() {
            for b in boxes.iter_mut() {
                if let ProgramMode::RawPmuConfigs { by_unit_name } = &mode {
                    if let Some(events) = by_unit_name.get(b.kind.role_name()) {
                        b.program(events)?;
                        continue;
                    }
                }
                if let Ok(defaults) = pcm_events::uncore_role_defaults(b.kind.role_name()) {
                    b.program_defaults(defaults, &[])?;
                }
            }
        }

        *self._lock.lock() = Some(lock);
        *state = EngineState::Programmed;
        Ok(())
    }

    fn require_programmed(&self) -> Result<()> {
        if *self.state.lock() != EngineState::Programmed {
            return Err(EngineError::PmuBusy);
        }
        Ok(())
    }

    /// Samples one hyperthread in isolation (spec.md §4.6: the Aggregator
    /// dispatches one such task per online thread). Returns zeros for an
    /// offline thread or one the engine hasn't programmed.
    pub fn sample_thread(&self, thread_index: usize) -> Result<BasicCounterState> {
        self.require_programmed()?;
        let thread_msrs = self.thread_msrs.lock();
        let programmed = self.programmed_cores.lock();
        let Some(thread) = self.topology.hyperthreads.get(thread_index) else {
            return Ok(BasicCounterState::default());
        };
        if !thread.entry.online {
            return Ok(BasicCounterState::default());
        }
        match (thread_msrs[thread_index].as_ref(), programmed[thread_index].as_ref()) {
            (Some(msr), Some(prog)) => core_pmu::sample(msr, prog),
            _ => Ok(BasicCounterState::default()),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.topology.hyperthreads.len()
    }

    pub fn socket_count(&self) -> usize {
        self.topology.sockets.len()
    }

    /// Sums every online hyperthread belonging to `core_index` (a
    /// `pcm_topology::SystemRoot::cores` arena index). Offline cores (and
    /// offline threads within an online core) contribute zero, per spec.md
    /// §7 ("Offline - per-thread reads of that core yield zeros").
    pub fn sample_core(&self, core_index: usize) -> Result<BasicCounterState> {
        self.require_programmed()?;
        let core = &self.topology.cores[core_index];
        let thread_msrs = self.thread_msrs.lock();
        let programmed = self.programmed_cores.lock();

        let mut total = BasicCounterState::default();
        for &thread_idx in &core.threads {
            let thread = &self.topology.hyperthreads[thread_idx as usize];
            if !thread.entry.online {
                continue;
            }
            let (Some(msr), Some(prog)) = (
                thread_msrs[thread_idx as usize].as_ref(),
                programmed[thread_idx as usize].as_ref(),
            ) else {
                continue;
            };
            match core_pmu::sample(msr, prog) {
                Ok(sample) => total.accumulate(&sample),
                Err(err) => log::warn!("sample_core: thread {thread_idx} read failed: {err}"),
            }
        }
        Ok(total)
    }

    pub fn sample_socket(&self, socket_index: usize) -> Result<SocketCounterState> {
        self.require_programmed()?;
        let socket = &self.topology.sockets[socket_index];

        let mut basic = BasicCounterState::default();
        for &core_idx in &socket.cores {
            basic.accumulate(&self.sample_core(core_idx as usize)?);
        }

        let mut uncore = UncoreCounterState::default();
        for b in self.uncore_boxes.lock()[socket_index].iter() {
            match b.sample() {
                Ok(values) => fold_box_sample(b.kind, &values, &mut uncore),
                Err(err) => log::warn!("sample_socket: uncore box read failed: {err}"),
            }
        }

        Ok(SocketCounterState {
            socket_id: socket.socket_id,
            basic,
            uncore,
        })
    }

    pub fn sample_system(&self) -> Result<SystemCounterState> {
        self.require_programmed()?;
        let mut system = SystemCounterState::default();
        system.xpi_links = vec![Vec::new(); self.topology.sockets.len()];
        for socket_index in 0..self.topology.sockets.len() {
            let socket_state = self.sample_socket(socket_index)?;
            system.basic.accumulate(&socket_state.basic);
            system.uncore.accumulate(&socket_state.uncore);
        }
        Ok(system)
    }

    /// Reads every xPI (UPI/QPI) link box registered under `socket_index`,
    /// one at a time, via the socket's reference core (spec.md §4.6: "reads
    /// per-link xPI counters... require sequential access via the
    /// reference core's MSR handle").
    pub fn sample_xpi_links(&self, socket_index: usize) -> Result<Vec<crate::state::XpiLinkState>> {
        self.require_programmed()?;
        let mut links = Vec::new();
        for b in self.uncore_boxes.lock()[socket_index].iter() {
            if !matches!(b.kind, UncoreBoxKind::Xpi | UncoreBoxKind::M3upi) {
                continue;
            }
            let values = b.sample()?;
            links.push(crate::state::XpiLinkState {
                tx_l0_cycles: values.first().copied().unwrap_or(0),
                incoming_packets: values.get(1).copied().unwrap_or(0),
                outgoing_flits: values.get(2).copied().unwrap_or(0),
            });
        }
        Ok(links)
    }

    /// Freezes every programmed PMU, clears control registers, restores
    /// the NMI watchdog, and drops the Instance Lock (spec.md §4.5, §5).
    pub fn cleanup(&self) -> Result<()> {
        let mut thread_msrs = self.thread_msrs.lock();
        let mut programmed = self.programmed_cores.lock();
        for idx in 0..programmed.len() {
            if let (Some(msr), Some(mut prog)) = (thread_msrs[idx].as_ref(), programmed[idx].take()) {
                if let Err(err) = core_pmu::cleanup(msr, &mut prog) {
                    log::error!("cleanup: failed to reset core {idx}: {err}");
                }
            }
        }
        thread_msrs.clear();
        thread_msrs.resize_with(self.topology.hyperthreads.len(), || None);

        for boxes in self.uncore_boxes.lock().iter_mut() {
            for b in boxes.iter_mut() {
                if let Err(err) = b.cleanup() {
                    log::error!("cleanup: failed to reset uncore box: {err}");
                }
            }
        }

        *self.state.lock() = EngineState::Uninitialized;
        *self._lock.lock() = None;
        Ok(())
    }
}

/// Folds a raw per-counter read into the role-specific `UncoreCounterState`
/// fields it represents. `CAS_COUNT`-style memory-controller events count
/// 64-byte cache lines, matching how Intel's own tooling scales them.
fn fold_box_sample(kind: UncoreBoxKind, values: &[u64], into: &mut UncoreCounterState) {
    const CACHE_LINE_BYTES: u64 = 64;
    match kind {
        UncoreBoxKind::Imc => {
            if let Some(&rd) = values.first() {
                into.dram_reads_bytes += rd * CACHE_LINE_BYTES;
            }
            if let Some(&wr) = values.get(1) {
                into.dram_writes_bytes += wr * CACHE_LINE_BYTES;
            }
            if let Some(&pmm_rd) = values.get(2) {
                into.pmem_reads_bytes += pmm_rd * CACHE_LINE_BYTES;
            }
            if let Some(&pmm_wr) = values.get(3) {
                into.pmem_writes_bytes += pmm_wr * CACHE_LINE_BYTES;
            }
        }
        UncoreBoxKind::Cha => {
            if let Some(&occ) = values.first() {
                into.tor_occupancy += occ;
            }
            if let Some(&ins) = values.get(1) {
                into.tor_inserts += ins;
                into.cha_requests += ins;
            }
        }
        UncoreBoxKind::Pcu => {
            if let Some(&clocks) = values.first() {
                into.uncore_clocks += clocks;
            }
        }
        UncoreBoxKind::Ubox | UncoreBoxKind::Iio => {
            if let Some(&bytes) = values.first() {
                into.io_request_bytes += bytes * CACHE_LINE_BYTES;
            }
        }
        UncoreBoxKind::M2m | UncoreBoxKind::M3upi | UncoreBoxKind::Xpi => {
            // Per-link xPI/M2M traffic is folded at the system level by the
            // aggregator, which reads these boxes sequentially via the
            // socket's reference core (spec.md §4.6).
        }
    }
}

fn map_lock_error(err: RalError) -> EngineError {
    match err {
        RalError::PmuBusy { .. } => EngineError::PmuBusy,
        other => EngineError::Ral(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_imc_sample_scales_to_bytes() {
        let mut state = UncoreCounterState::default();
        fold_box_sample(UncoreBoxKind::Imc, &[10, 20], &mut state);
        assert_eq!(state.dram_reads_bytes, 640);
        assert_eq!(state.dram_writes_bytes, 1280);
    }
}
