//! Programs core and uncore PMUs and turns register reads into the
//! counter data model: the Counter Engine of spec.md §4.5.

pub mod core_pmu;
pub mod engine;
pub mod error;
pub mod mode;
pub mod nmi;
pub mod state;
pub mod uncore_discovery;
pub mod uncore_pmu;

pub use engine::CounterEngine;
pub use error::{EngineError, Result};
pub use mode::{FixedCounterConfig, ProgramMode};
pub use state::{
    BasicCounterState, SocketCounterState, Snapshot, SystemCounterState, UncoreCounterState,
    XpiLinkState, MAX_C_STATE,
};
pub use uncore_discovery::register_discovered_boxes;
pub use uncore_pmu::{UncoreBoxKind, UncorePmu};
