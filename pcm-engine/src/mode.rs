//! Programming modes accepted by `CounterEngine::program` (spec.md §4.5).

use std::collections::HashMap;

use pcm_events::EventSelect;

/// Core fixed-counter configuration (`IA32_FIXED_CTR_CTRL` layout).
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedCounterConfig {
    pub instructions_retired: bool,
    pub cycles_unhalted: bool,
    pub cycles_unhalted_ref: bool,
    pub topdown_slots: bool,
}

#[derive(Clone, Debug)]
pub enum ProgramMode {
    /// Use the built-in per-microarchitecture event table (spec.md §4.4).
    DefaultEvents,
    /// Program the four general-purpose counters from a caller-supplied list.
    CustomCoreEvents { list: Vec<EventSelect> },
    /// Full control over fixed counters, general-purpose counters, and any
    /// offcore-response MSR values they require.
    ExtendedCustomCoreEvents {
        fixed_cfg: FixedCounterConfig,
        gp_cfg: Vec<EventSelect>,
        offcore_rsp_msr_values: Vec<(u32, u64)>,
    },
    /// Program uncore boxes directly, keyed by role name (`"imc"`, `"cha"`, ...).
    RawPmuConfigs {
        by_unit_name: HashMap<String, Vec<EventSelect>>,
    },
}

impl Default for ProgramMode {
    fn default() -> Self {
        ProgramMode::DefaultEvents
    }
}
