//! The bounded snapshot ring the Sampling Loop pushes into and the HTTP
//! layer reads from (spec.md §2 "Sampling Loop", §4.8).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pcm_engine::Snapshot;

pub const RING_CAPACITY: usize = 30;

struct Inner {
    deque: Mutex<VecDeque<Arc<Snapshot>>>,
    not_empty: Condvar,
}

/// A plain mutex-guarded deque holding shared-ownership pointers to
/// snapshots (spec.md §5: "pushes and reads hold the lock for the
/// duration of a pointer swap, not a payload copy"). Newest is always at
/// the front; `RING_CAPACITY` pops the tail.
#[derive(Clone)]
pub struct SnapshotRing {
    inner: Arc<Inner>,
}

impl SnapshotRing {
    pub fn new() -> Self {
        SnapshotRing {
            inner: Arc::new(Inner {
                deque: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
                not_empty: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, snapshot: Snapshot) {
        let mut deque = self.inner.deque.lock();
        deque.push_front(Arc::new(snapshot));
        while deque.len() > RING_CAPACITY {
            deque.pop_back();
        }
        self.inner.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index 0 is the newest snapshot, matching `/persecond/{N}`'s
    /// `snapshots[N]` addressing (spec.md §4.8).
    pub fn get(&self, index: usize) -> Option<Arc<Snapshot>> {
        self.inner.deque.lock().get(index).cloned()
    }

    /// Blocks in 1-second polls until at least `min_len` snapshots are
    /// available (spec.md §4.8: "a request that arrives before the ring
    /// has enough samples... blocks in 1-second polls until it does").
    pub fn wait_until_len_at_least(&self, min_len: usize) {
        let mut deque = self.inner.deque.lock();
        while deque.len() < min_len {
            self.inner
                .not_empty
                .wait_for(&mut deque, std::time::Duration::from_secs(1));
        }
    }
}

impl Default for SnapshotRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn dummy_snapshot(timestamp_ns: u64) -> Snapshot {
        Snapshot {
            dispatched_at: Instant::now(),
            timestamp_ns,
            threads: Vec::new(),
            sockets: Vec::new(),
            system: Default::default(),
        }
    }

    #[test]
    fn push_keeps_newest_at_front_and_caps_at_capacity() {
        let ring = SnapshotRing::new();
        for i in 0..(RING_CAPACITY as u64 + 5) {
            ring.push(dummy_snapshot(i));
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        assert_eq!(ring.get(0).unwrap().timestamp_ns, RING_CAPACITY as u64 + 4);
    }

    #[test]
    fn get_out_of_range_is_none() {
        let ring = SnapshotRing::new();
        ring.push(dummy_snapshot(1));
        assert!(ring.get(5).is_none());
    }
}
