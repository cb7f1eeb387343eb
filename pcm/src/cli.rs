//! Command-line surface for the publisher process (spec.md §6 `CLI`).

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "pcm",
    version,
    about = "Samples hardware performance counters and publishes them over HTTP and shared memory."
)]
pub struct Opt {
    /// Sample poll interval, in milliseconds. Must be greater than zero.
    #[arg(short = 'p', long = "poll-ms", default_value_t = 1000)]
    pub poll_ms: u64,

    /// Counter group subscription.
    #[arg(short = 'c', long = "group", value_enum, default_value_t = CounterGroup::All)]
    pub counter_group: CounterGroup,

    /// Debug/no-fork foreground mode.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Unix group name to own the shared-memory segment (mode 0660).
    #[arg(short = 'g', long = "shm-group")]
    pub shm_group: Option<String>,

    /// Whether the published snapshot is a delta from the previous tick
    /// or the raw cumulative counters.
    #[arg(short = 'm', long = "mode", value_enum, default_value_t = PublishMode::Difference)]
    pub publish_mode: PublishMode,

    /// File to write the shared-memory segment path into.
    #[arg(short = 's', long = "shm-path-file")]
    pub shm_path_file: Option<PathBuf>,

    /// HTTP listen port.
    #[arg(long = "port", default_value_t = 9738)]
    pub port: u16,

    /// Shared-memory segment file path (defaults to a temp-dir name).
    #[arg(long = "shm-segment")]
    pub shm_segment: Option<PathBuf>,
}

impl Opt {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CounterGroup {
    Core,
    Memory,
    Qpi,
    All,
}

impl CounterGroup {
    pub fn wants_core(self) -> bool {
        matches!(self, CounterGroup::Core | CounterGroup::All)
    }

    pub fn wants_memory(self) -> bool {
        matches!(self, CounterGroup::Memory | CounterGroup::All)
    }

    pub fn wants_qpi(self) -> bool {
        matches!(self, CounterGroup::Qpi | CounterGroup::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PublishMode {
    Difference,
    Absolute,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_rejects_zero() {
        let opt = Opt {
            poll_ms: 0,
            counter_group: CounterGroup::All,
            debug: false,
            shm_group: None,
            publish_mode: PublishMode::Difference,
            shm_path_file: None,
            port: 9738,
            shm_segment: None,
        };
        assert_eq!(opt.poll_interval(), std::time::Duration::from_millis(1));
    }

    #[test]
    fn counter_group_filters() {
        assert!(CounterGroup::All.wants_core());
        assert!(CounterGroup::All.wants_memory());
        assert!(!CounterGroup::Core.wants_memory());
        assert!(!CounterGroup::Memory.wants_qpi());
    }
}
