//! Discovers the machine's socket/core/hyperthread topology from CPUID
//! leaf 0xB and freezes it into an arena-indexed tree.

pub mod build;
pub mod cpuid;
pub mod error;
pub mod tree;

pub use build::{discover, BuildOptions};
pub use error::{Result, TopologyError};
pub use tree::{Core, HyperThread, Socket, SystemRoot, TopologyEntry, UncoreVariant};
