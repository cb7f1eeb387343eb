//! Event-select bit packing, per-microarchitecture default event tables,
//! and the counter-width extender used by narrow uncore counters.

pub mod cwe;
pub mod descriptor;
pub mod error;
pub mod tables;

pub use cwe::CounterWidthExtender;
pub use descriptor::{EventCounter, EventDescription, EventSelect};
pub use error::{EventsError, Result};
pub use tables::{core_table_for, uncore_role_defaults, CoreEventTable, UncoreRoleEvents};
