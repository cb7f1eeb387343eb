//! `PCM_*` environment switches (spec.md §6 `Environment`). Read once at
//! startup; nothing here is re-checked per tick.

#[derive(Debug, Clone, Copy)]
pub struct EnvConfig {
    pub no_perf: bool,
    pub use_resctrl: bool,
    pub no_rdt: bool,
    pub ignore_arch_perfmon: bool,
    pub no_aws_workaround: bool,
    pub no_uncore_pmu_discovery: bool,
    pub print_uncore_pmu_discovery: bool,
}

fn flag_set(name: &str) -> bool {
    std::env::var(name).as_deref() == Ok("1")
}

impl EnvConfig {
    pub fn from_env() -> Self {
        EnvConfig {
            no_perf: flag_set("PCM_NO_PERF"),
            use_resctrl: flag_set("PCM_USE_RESCTRL"),
            no_rdt: flag_set("PCM_NO_RDT"),
            ignore_arch_perfmon: flag_set("PCM_IGNORE_ARCH_PERFMON"),
            no_aws_workaround: flag_set("PCM_NO_AWS_WORKAROUND"),
            no_uncore_pmu_discovery: flag_set("PCM_NO_UNCORE_PMU_DISCOVERY"),
            print_uncore_pmu_discovery: flag_set("PCM_PRINT_UNCORE_PMU_DISCOVERY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_vars_default_to_false() {
        std::env::remove_var("PCM_NO_PERF");
        let cfg = EnvConfig::from_env();
        assert!(!cfg.no_perf);
    }
}
