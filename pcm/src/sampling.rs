//! The Sampling Loop (spec.md §4.7): ticks at a fixed interval, dispatches
//! a snapshot through the Aggregator, and fans it out to the ring and the
//! shared-memory segment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pcm_aggregate::{Aggregator, SnapshotRing};
use pcm_engine::Snapshot;
use pcm_ipc::SharedMemoryPublisher;

use crate::cli::{CounterGroup, PublishMode};

#[cfg(target_arch = "x86_64")]
fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
fn rdtsc() -> u64 {
    // Non-x86 builds have no TSC; a monotonic nanosecond clock preserves
    // the begin < end ordering the shared-memory fencing protocol needs.
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Runs until `exit` is set, checked once per tick (spec.md §4.7:
/// "finishes the current iteration then exits within 1 tick").
pub async fn run(
    aggregator: Arc<Aggregator>,
    ring: SnapshotRing,
    mut publisher: Option<SharedMemoryPublisher>,
    publish_mode: PublishMode,
    counter_group: CounterGroup,
    poll_interval: Duration,
    exit: Arc<AtomicBool>,
) {
    let mut next_tick = tokio::time::Instant::now() + poll_interval;
    let mut previous: Option<Snapshot> = None;
    while !exit.load(Ordering::Relaxed) {
        let rdtsc_begin = rdtsc();
        let timestamp_ns = now_ns();

        let aggregator = Arc::clone(&aggregator);
        let snapshot = tokio::task::spawn_blocking(move || aggregator.dispatch_snapshot(timestamp_ns)).await;

        match snapshot {
            Ok(Ok(snapshot)) => {
                let rdtsc_end = rdtsc();
                if let Some(publisher) = publisher.as_mut() {
                    let mut published = match (publish_mode, previous.as_ref()) {
                        (PublishMode::Difference, Some(earlier)) => published_delta(&snapshot, earlier),
                        _ => snapshot.clone(),
                    };
                    apply_group_filter(&mut published, counter_group);
                    publisher.publish(&published, rdtsc_begin, rdtsc_end);
                }
                previous = Some(snapshot.clone());
                ring.push(snapshot);
            }
            Ok(Err(err)) => log::error!("sampling loop: dispatch failed: {err}"),
            Err(join_err) => log::error!("sampling loop: aggregator task panicked: {join_err}"),
        }

        tokio::time::sleep_until(next_tick).await;
        next_tick += poll_interval;
    }
}

/// Builds the `-m difference` view: same shape as `snapshot`, with the
/// system-wide counters replaced by their delta against the previous tick
/// (spec.md §6: "a delta from the previous tick").
fn published_delta(snapshot: &Snapshot, earlier: &Snapshot) -> Snapshot {
    let mut delta = snapshot.clone();
    delta.system.basic = snapshot.system.basic.delta(&earlier.system.basic);
    delta.system.uncore = snapshot.system.uncore.delta(&earlier.system.uncore);
    delta
}

/// Zeroes out the groups `-c` didn't ask for before the snapshot is
/// written to shared memory (spec.md §6: "counter group subscription").
fn apply_group_filter(snapshot: &mut Snapshot, group: CounterGroup) {
    if !group.wants_core() {
        snapshot.system.basic = Default::default();
        snapshot.threads.iter_mut().for_each(|t| *t = Default::default());
    }
    if !group.wants_memory() {
        snapshot.system.uncore.dram_reads_bytes = 0;
        snapshot.system.uncore.dram_writes_bytes = 0;
        snapshot.system.uncore.pmem_reads_bytes = 0;
        snapshot.system.uncore.pmem_writes_bytes = 0;
    }
    if !group.wants_qpi() {
        snapshot.system.xpi_links.iter_mut().for_each(|links| links.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ns_is_monotonic_enough_for_ordering() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
