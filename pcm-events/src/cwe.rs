//! Counter-Width Extender (spec.md §4.3): wraps a narrow hardware counter
//! with a background poller so readers always see a monotonic 64-bit
//! value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

struct CweState {
    last_raw: u64,
    extended: u64,
}

/// Owns a background thread that re-reads the wrapped counter every
/// `watchdog_delay` and folds wraparounds into a 64-bit accumulator.
/// Dropping the extender stops the thread (spec.md §4.3: "the task exits
/// when the extender is dropped").
pub struct CounterWidthExtender {
    state: Arc<Mutex<CweState>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CounterWidthExtender {
    /// `width` is the hardware counter's bit width (24, 32 or 48).
    /// `read_raw` must be cheap and non-blocking enough to run on the
    /// watchdog thread; it typically reads one MMIO or MSR register.
    pub fn spawn<F>(width: u32, watchdog_delay: Duration, read_raw: F) -> Self
    where
        F: Fn() -> u64 + Send + 'static,
    {
        assert!(width > 0 && width <= 64, "counter width out of range");
        let initial = read_raw();
        let state = Arc::new(Mutex::new(CweState {
            last_raw: initial & mask(width),
            extended: 0,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_state = Arc::clone(&state);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("pcm-cwe".into())
            .spawn(move || loop {
                if thread_stop.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(watchdog_delay);
                if thread_stop.load(Ordering::Acquire) {
                    return;
                }
                let current_raw = read_raw() & mask(width);
                let mut guard = thread_state.lock().unwrap();
                advance(&mut guard, current_raw, width);
            })
            .expect("failed to spawn counter-width-extender thread");

        CounterWidthExtender {
            state,
            stop,
            handle: Some(handle),
        }
    }

    /// The monotonic 64-bit view. Safe to call concurrently with the
    /// watchdog thread (spec.md §4.3: "reads may run concurrently with
    /// the watchdog").
    pub fn extended(&self) -> u64 {
        self.state.lock().unwrap().extended
    }
}

impl Drop for CounterWidthExtender {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// `current_raw < last_raw` → add `1 << width`; always
/// `extended += (current_raw - last_raw) mod 2^width`; `last_raw = current_raw`
/// (spec.md §4.3). The two rules collapse into one wrapping subtraction
/// over the masked width.
fn advance(state: &mut CweState, current_raw: u64, width: u32) {
    let delta = current_raw.wrapping_sub(state.last_raw) & mask(width);
    state.extended = state.extended.wrapping_add(delta);
    state.last_raw = current_raw;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_accumulates_without_wrap() {
        let mut state = CweState {
            last_raw: 10,
            extended: 0,
        };
        advance(&mut state, 25, 32);
        assert_eq!(state.extended, 15);
        assert_eq!(state.last_raw, 25);
    }

    #[test]
    fn advance_handles_counter_wraparound() {
        let width = 24u32;
        let top = mask(width);
        let mut state = CweState {
            last_raw: top - 2,
            extended: 0,
        };
        // Counter wrapped from top-2 to 5: 3 ticks to wrap plus 5 more.
        advance(&mut state, 5, width);
        assert_eq!(state.extended, 8);
        assert_eq!(state.last_raw, 5);
    }

    #[test]
    fn extender_reads_initial_value_without_waiting() {
        let ext = CounterWidthExtender::spawn(48, Duration::from_secs(3600), || 42);
        assert_eq!(ext.extended(), 0);
    }
}
