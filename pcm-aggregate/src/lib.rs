//! Fans counter reads out across a worker pool and folds them into a
//! single per-tick `Snapshot` (spec.md §4.6).

pub mod aggregator;
pub mod pool;
pub mod ring;

pub use aggregator::{Aggregator, DEFAULT_WORKER_COUNT};
pub use pool::WorkerPool;
pub use ring::{SnapshotRing, RING_CAPACITY};
