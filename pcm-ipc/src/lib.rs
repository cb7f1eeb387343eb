//! Publishes the latest snapshot into a fixed-layout shared-memory region
//! and lets consumers read it without locking (spec.md §4.9).

pub mod error;
pub mod layout;
pub mod publisher;
pub mod reader;

pub use error::{IpcError, Result};
pub use layout::{SharedPcmState, MAX_CPU_CORES, MAX_SOCKETS, SEGMENT_SIZE, VERSION};
pub use publisher::SharedMemoryPublisher;
pub use reader::SharedMemoryReader;
