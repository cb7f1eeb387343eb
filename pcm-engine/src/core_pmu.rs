//! Core PMU programming and sampling (spec.md §4.4 "Core PMU").

use pcm_ral::MsrHandle;
use pcm_topology::cpuid;

use crate::error::{EngineError, Result};
use crate::mode::{FixedCounterConfig, ProgramMode};
use crate::nmi::NmiWatchdogGuard;
use crate::state::BasicCounterState;

pub const IA32_PERFEVTSEL0: u32 = 0x186;
pub const IA32_PMC0: u32 = 0xC1;
pub const IA32_FIXED_CTR0: u32 = 0x309;
pub const IA32_FIXED_CTR_CTRL: u32 = 0x38D;
pub const IA32_PERF_GLOBAL_STATUS: u32 = 0x38E;
pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38F;
pub const IA32_PERF_GLOBAL_OVF_CTRL: u32 = 0x390;
pub const MSR_TSX_FORCE_ABORT: u32 = 0x10F;

const MAX_GENERAL_COUNTERS: usize = 4;
const MAX_FIXED_COUNTERS: usize = 4; // instr, cycles, ref-cycles, topdown slots

/// General-purpose and fixed counters are both 48 bits wide on every
/// family-0x06 part this table covers (spec.md §4.4).
const COUNTER_WIDTH: u32 = 48;

/// Folds the counter's `PERF_GLOBAL_STATUS` overflow bit into its raw
/// value: `extract_bits(raw, 0, width-1)` plus `overflow << width`
/// (spec.md §4.4). Without this a 48-bit counter wrapping between samples
/// reads back near zero instead of continuing to climb.
fn width_correct(raw: u64, overflowed: bool) -> u64 {
    let mask = (1u64 << COUNTER_WIDTH) - 1;
    (raw & mask) | ((overflowed as u64) << COUNTER_WIDTH)
}

/// What ended up programmed on one core, kept around so `sample`/`cleanup`
/// know which counters to read and clear.
pub struct ProgrammedCore {
    pub general_count: usize,
    pub fixed_cfg: FixedCounterConfig,
    pub topdown_enabled: bool,
    pub nmi_guard: Option<NmiWatchdogGuard>,
}

fn general_counter_budget(clamp_guest: bool, tsx_force_abort_refuses_fourth: bool) -> usize {
    let mut budget = MAX_GENERAL_COUNTERS;
    if clamp_guest {
        // "clamp general counters to 3 unless opt-out flag set" (spec.md §4.4).
        budget = budget.min(3);
    }
    if tsx_force_abort_refuses_fourth {
        budget = budget.min(3);
    }
    budget
}

/// Reads `MSR_TSX_FORCE_ABORT` when the CPUID TSX-force-abort feature bit
/// is present; a nonzero value means the fourth general counter is
/// unusable while TSX transactions are force-aborted (spec.md §4.4).
fn tsx_forces_fourth_counter_unusable(msr: &MsrHandle, feature_present: bool) -> bool {
    if !feature_present {
        return false;
    }
    match msr.read(MSR_TSX_FORCE_ABORT) {
        Ok(value) => value & 1 != 0,
        Err(_) => false,
    }
}

/// Freeze -> reset -> configure -> unfreeze (spec.md §4.4), specialized to
/// the core PMU's fixed + general-purpose counter banks.
pub fn program(
    msr: &MsrHandle,
    mode: &ProgramMode,
    clamp_guest_counters: bool,
    tsx_feature_present: bool,
) -> Result<ProgrammedCore> {
    let tsx_refuses = tsx_forces_fourth_counter_unusable(msr, tsx_feature_present);
    let budget = general_counter_budget(clamp_guest_counters, tsx_refuses);

    let (fixed_cfg, gp_events, topdown_enabled) = match mode {
        ProgramMode::DefaultEvents => {
            let family = 0x06u8;
            let model = 0x55u8; // resolved by caller in a full build; default table is family-wide
            let table = pcm_events::core_table_for(family, model)?;
            let gp = vec![
                table.l2_miss.select,
                table.l2_hit.select,
                table.l3_miss.select,
                table.l3_hit.select,
            ];
            (
                FixedCounterConfig {
                    instructions_retired: true,
                    cycles_unhalted: true,
                    cycles_unhalted_ref: true,
                    topdown_slots: false,
                },
                gp,
                false,
            )
        }
        ProgramMode::CustomCoreEvents { list } => (
            FixedCounterConfig {
                instructions_retired: true,
                cycles_unhalted: true,
                cycles_unhalted_ref: true,
                topdown_slots: false,
            },
            list.clone(),
            false,
        ),
        ProgramMode::ExtendedCustomCoreEvents {
            fixed_cfg,
            gp_cfg,
            offcore_rsp_msr_values,
        } => {
            for (index, value) in offcore_rsp_msr_values {
                msr.write(*index, *value)
                    .map_err(|_| EngineError::MsrAccessDenied { core_id: msr.core_id() })?;
            }
            (*fixed_cfg, gp_cfg.clone(), fixed_cfg.topdown_slots)
        }
        ProgramMode::RawPmuConfigs { .. } => {
            // Raw mode only targets uncore boxes by name; the core stays idle.
            (FixedCounterConfig::default(), Vec::new(), false)
        }
    };

    if gp_events.len() > budget {
        return Err(EngineError::ResourceExhausted {
            requested: gp_events.len(),
            available: budget,
        });
    }

    let nmi_guard = NmiWatchdogGuard::disable_if_active();

    // 1-2: freeze. The core PMU's "UNIT_CTL" equivalent is GLOBAL_CTRL.
    write(msr, IA32_PERF_GLOBAL_CTRL, 0)?;

    // 3: configure general-purpose counters.
    for (i, event) in gp_events.iter().enumerate() {
        write(msr, IA32_PMC0 + i as u32, 0)?;
        write(msr, IA32_PERFEVTSEL0 + i as u32, event.encode())?;
    }
    for i in gp_events.len()..MAX_GENERAL_COUNTERS {
        write(msr, IA32_PERFEVTSEL0 + i as u32, 0)?;
    }

    // Fixed-counter control: 4 bits per counter (EN_PMI off, usr+os on = 0b0011).
    let mut fixed_ctrl: u64 = 0;
    if fixed_cfg.instructions_retired {
        fixed_ctrl |= 0b0011;
    }
    if fixed_cfg.cycles_unhalted {
        fixed_ctrl |= 0b0011 << 4;
    }
    if fixed_cfg.cycles_unhalted_ref {
        fixed_ctrl |= 0b0011 << 8;
    }
    if fixed_cfg.topdown_slots {
        fixed_ctrl |= 0b0011 << 12;
    }
    write(msr, IA32_FIXED_CTR_CTRL, fixed_ctrl)?;
    for i in 0..MAX_FIXED_COUNTERS {
        write(msr, IA32_FIXED_CTR0 + i as u32, 0)?;
    }

    // 5: reset by acknowledging any stale overflow bits.
    write(msr, IA32_PERF_GLOBAL_OVF_CTRL, u64::MAX)?;

    // 6: unfreeze - enable exactly what we programmed.
    let mut enable_mask: u64 = 0;
    for i in 0..gp_events.len() {
        enable_mask |= 1 << i;
    }
    if fixed_cfg.instructions_retired {
        enable_mask |= 1 << 32;
    }
    if fixed_cfg.cycles_unhalted {
        enable_mask |= 1 << 33;
    }
    if fixed_cfg.cycles_unhalted_ref {
        enable_mask |= 1 << 34;
    }
    if fixed_cfg.topdown_slots {
        enable_mask |= 1 << 35;
    }
    write(msr, IA32_PERF_GLOBAL_CTRL, enable_mask)?;

    Ok(ProgrammedCore {
        general_count: gp_events.len(),
        fixed_cfg,
        topdown_enabled,
        nmi_guard,
    })
}

/// Single-sample read under the repeat-until-stable overflow protocol
/// (spec.md §4.4): read status, read counters, read status again, retry
/// on mismatch, then clear the accumulated overflow mask.
pub fn sample(msr: &MsrHandle, programmed: &ProgrammedCore) -> Result<BasicCounterState> {
    const MAX_ATTEMPTS: u32 = 8;
    let mut state = BasicCounterState::default();

    for attempt in 0..MAX_ATTEMPTS {
        let status_before = read(msr, IA32_PERF_GLOBAL_STATUS)?;

        let instructions = read(msr, IA32_FIXED_CTR0)?;
        let cycles = read(msr, IA32_FIXED_CTR0 + 1)?;
        let cycles_ref = read(msr, IA32_FIXED_CTR0 + 2)?;
        let topdown_slots = if programmed.topdown_enabled {
            read(msr, IA32_FIXED_CTR0 + 3)?
        } else {
            0
        };
        let mut general = [0u64; MAX_GENERAL_COUNTERS];
        for i in 0..programmed.general_count {
            general[i] = read(msr, IA32_PMC0 + i as u32)?;
        }

        let status_after = read(msr, IA32_PERF_GLOBAL_STATUS)?;
        if status_after == status_before || attempt == MAX_ATTEMPTS - 1 {
            write(msr, IA32_PERF_GLOBAL_OVF_CTRL, status_after)?;

            state.instructions_retired = width_correct(instructions, status_after & (1 << 32) != 0);
            state.cycles_unhalted = width_correct(cycles, status_after & (1 << 33) != 0);
            state.cycles_unhalted_ref = width_correct(cycles_ref, status_after & (1 << 34) != 0);
            for i in 0..programmed.general_count {
                general[i] = width_correct(general[i], status_after & (1 << i) != 0);
            }
            state.general_purpose = general;
            state.invariant_tsc = state.cycles_unhalted_ref;
            if programmed.topdown_enabled {
                state.topdown_retiring = width_correct(topdown_slots, status_after & (1 << 35) != 0);
            }
            return Ok(state);
        }
    }
    Ok(state)
}

/// Freezes the core PMU, clears every control register it touched, and
/// restores the NMI watchdog if this programming pass had disabled it
/// (spec.md §4.5: "cleanup(): ... restores NMI watchdog").
pub fn cleanup(msr: &MsrHandle, programmed: &mut ProgrammedCore) -> Result<()> {
    write(msr, IA32_PERF_GLOBAL_CTRL, 0)?;
    for i in 0..MAX_GENERAL_COUNTERS {
        write(msr, IA32_PERFEVTSEL0 + i as u32, 0)?;
        write(msr, IA32_PMC0 + i as u32, 0)?;
    }
    write(msr, IA32_FIXED_CTR_CTRL, 0)?;
    for i in 0..MAX_FIXED_COUNTERS {
        write(msr, IA32_FIXED_CTR0 + i as u32, 0)?;
    }
    write(msr, IA32_PERF_GLOBAL_OVF_CTRL, u64::MAX)?;
    programmed.nmi_guard.take();
    Ok(())
}

/// True when CPUID reports the TSX-force-abort feature bit (encoded in
/// structured extended feature leaf 7, bit 13 of EDX on affected parts).
pub fn tsx_force_abort_feature_present() -> bool {
    let leaf7 = cpuid::cpuid_count(7, 0);
    leaf7.edx & (1 << 13) != 0
}

fn read(msr: &MsrHandle, index: u32) -> Result<u64> {
    msr.read(index)
        .map_err(|_| EngineError::MsrAccessDenied { core_id: msr.core_id() })
}

fn write(msr: &MsrHandle, index: u32, value: u64) -> Result<()> {
    msr.write(index, value)
        .map_err(|_| EngineError::MsrAccessDenied { core_id: msr.core_id() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_counter_budget_applies_guest_clamp() {
        assert_eq!(general_counter_budget(false, false), 4);
        assert_eq!(general_counter_budget(true, false), 3);
        assert_eq!(general_counter_budget(false, true), 3);
        assert_eq!(general_counter_budget(true, true), 3);
    }

    #[test]
    fn width_correct_folds_overflow_bit_above_the_counter_width() {
        assert_eq!(width_correct(100, false), 100);
        let wrapped_near_zero = 42u64;
        assert_eq!(width_correct(wrapped_near_zero, true), (1u64 << 48) + 42);
    }

    #[test]
    fn width_correct_discards_bits_above_the_counter_width() {
        let raw_with_garbage_above_width = (1u64 << 48) | 7;
        assert_eq!(width_correct(raw_with_garbage_above_width, false), 7);
    }
}
