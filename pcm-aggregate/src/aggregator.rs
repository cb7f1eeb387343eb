//! Walks the topology tree and produces a `Snapshot` (spec.md §4.6).

use std::sync::Arc;
use std::time::Instant;

use pcm_engine::{CounterEngine, Result, Snapshot, SystemCounterState, UncoreCounterState};

use crate::pool::WorkerPool;

/// `~64` per spec.md §4.6/§5; real machines rarely have more online
/// threads than this, so most jobs run immediately rather than queueing.
pub const DEFAULT_WORKER_COUNT: usize = 64;

pub struct Aggregator {
    engine: Arc<CounterEngine>,
    pool: WorkerPool,
}

impl Aggregator {
    pub fn new(engine: Arc<CounterEngine>) -> Self {
        Aggregator::with_worker_count(engine, DEFAULT_WORKER_COUNT)
    }

    pub fn with_worker_count(engine: Arc<CounterEngine>, worker_count: usize) -> Self {
        Aggregator {
            engine,
            pool: WorkerPool::new(worker_count.max(1)),
        }
    }

    /// Dispatches one task per online thread and one per socket into the
    /// worker pool, waits for all of them, then folds the results into a
    /// single `Snapshot` (spec.md §4.6 steps 1-3) before sequentially
    /// reading each socket's xPI links via its reference core (step 4).
    pub fn dispatch_snapshot(&self, timestamp_ns: u64) -> Result<Snapshot> {
        let dispatched_at = Instant::now();
        let thread_count = self.engine.thread_count();
        let socket_count = self.engine.socket_count();

        let (thread_tx, thread_rx) = crossbeam_channel::bounded(thread_count.max(1));
        for idx in 0..thread_count {
            let engine = Arc::clone(&self.engine);
            let tx = thread_tx.clone();
            self.pool.spawn(move || {
                let result = engine.sample_thread(idx);
                let _ = tx.send((idx, result));
            });
        }
        drop(thread_tx);

        let mut threads = vec![Default::default(); thread_count];
        for _ in 0..thread_count {
            let (idx, result) = thread_rx.recv().expect("worker dropped without replying");
            match result {
                Ok(state) => threads[idx] = state,
                Err(err) => log::warn!("aggregator: thread {idx} sample failed: {err}"),
            }
        }

        let (socket_tx, socket_rx) = crossbeam_channel::bounded(socket_count.max(1));
        for idx in 0..socket_count {
            let engine = Arc::clone(&self.engine);
            let tx = socket_tx.clone();
            self.pool.spawn(move || {
                let result = engine.sample_socket(idx);
                let _ = tx.send((idx, result));
            });
        }
        drop(socket_tx);

        let mut sockets: Vec<UncoreCounterState> = vec![UncoreCounterState::default(); socket_count];
        let mut system = SystemCounterState::default();
        for _ in 0..socket_count {
            let (idx, result) = socket_rx.recv().expect("worker dropped without replying");
            match result {
                Ok(socket_state) => {
                    sockets[idx] = socket_state.uncore.clone();
                    system.basic.accumulate(&socket_state.basic);
                    system.uncore.accumulate(&socket_state.uncore);
                }
                Err(err) => log::warn!("aggregator: socket {idx} sample failed: {err}"),
            }
        }

        // Sequential by design: each reference core's MSR handle is not
        // safe to fan out across the pool (spec.md §4.6 step 4).
        system.xpi_links = Vec::with_capacity(socket_count);
        for idx in 0..socket_count {
            match self.engine.sample_xpi_links(idx) {
                Ok(links) => system.xpi_links.push(links),
                Err(err) => {
                    log::warn!("aggregator: socket {idx} xpi read failed: {err}");
                    system.xpi_links.push(Vec::new());
                }
            }
        }

        Ok(Snapshot {
            dispatched_at,
            timestamp_ns,
            threads,
            sockets,
            system,
        })
    }
}
