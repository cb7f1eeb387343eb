//! The counter data model (spec.md §3): per-thread, per-socket and
//! system-wide accumulators, plus the timestamped `Snapshot` the
//! sampling loop dispatches.

/// Residency buckets tracked for package/core C-states; C0 is "active",
/// the rest are successively deeper idle states.
pub const MAX_C_STATE: usize = 11;

/// Per-thread counter accumulator (spec.md §3). All fields are 64-bit
/// unsigned sums; callers add deltas, never subtract, so overflow would
/// indicate a bug rather than a value to wrap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicCounterState {
    pub instructions_retired: u64,
    pub cycles_unhalted: u64,
    pub cycles_unhalted_ref: u64,
    /// Up to four general-purpose event totals, in programmed-counter order.
    pub general_purpose: [u64; 4],
    pub l3_occupancy: u64,
    pub invariant_tsc: u64,
    pub c_state_residency: [u64; MAX_C_STATE],
    pub thermal_headroom: u64,
    pub smi_count: u64,
    pub topdown_frontend_bound: u64,
    pub topdown_bad_speculation: u64,
    pub topdown_backend_bound: u64,
    pub topdown_retiring: u64,
}

impl BasicCounterState {
    /// Component-wise `self - earlier`, saturating at zero. Used to turn
    /// two cumulative snapshots into one interval's delta (spec.md §4.8:
    /// endpoints map to a `(before, after)` snapshot pair).
    pub fn delta(&self, earlier: &BasicCounterState) -> BasicCounterState {
        BasicCounterState {
            instructions_retired: self.instructions_retired.saturating_sub(earlier.instructions_retired),
            cycles_unhalted: self.cycles_unhalted.saturating_sub(earlier.cycles_unhalted),
            cycles_unhalted_ref: self.cycles_unhalted_ref.saturating_sub(earlier.cycles_unhalted_ref),
            general_purpose: std::array::from_fn(|i| {
                self.general_purpose[i].saturating_sub(earlier.general_purpose[i])
            }),
            l3_occupancy: self.l3_occupancy,
            invariant_tsc: self.invariant_tsc.saturating_sub(earlier.invariant_tsc),
            c_state_residency: std::array::from_fn(|i| {
                self.c_state_residency[i].saturating_sub(earlier.c_state_residency[i])
            }),
            thermal_headroom: self.thermal_headroom,
            smi_count: self.smi_count.saturating_sub(earlier.smi_count),
            topdown_frontend_bound: self.topdown_frontend_bound.saturating_sub(earlier.topdown_frontend_bound),
            topdown_bad_speculation: self.topdown_bad_speculation.saturating_sub(earlier.topdown_bad_speculation),
            topdown_backend_bound: self.topdown_backend_bound.saturating_sub(earlier.topdown_backend_bound),
            topdown_retiring: self.topdown_retiring.saturating_sub(earlier.topdown_retiring),
        }
    }

    pub fn accumulate(&mut self, other: &BasicCounterState) {
        self.instructions_retired += other.instructions_retired;
        self.cycles_unhalted += other.cycles_unhalted;
        self.cycles_unhalted_ref += other.cycles_unhalted_ref;
        for i in 0..4 {
            self.general_purpose[i] += other.general_purpose[i];
        }
        self.l3_occupancy += other.l3_occupancy;
        self.invariant_tsc += other.invariant_tsc;
        for i in 0..MAX_C_STATE {
            self.c_state_residency[i] += other.c_state_residency[i];
        }
        self.thermal_headroom += other.thermal_headroom;
        self.smi_count += other.smi_count;
        self.topdown_frontend_bound += other.topdown_frontend_bound;
        self.topdown_bad_speculation += other.topdown_bad_speculation;
        self.topdown_backend_bound += other.topdown_backend_bound;
        self.topdown_retiring += other.topdown_retiring;
    }
}

/// Per-socket uncore accumulator (spec.md §3).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UncoreCounterState {
    pub dram_reads_bytes: u64,
    pub dram_writes_bytes: u64,
    pub pmem_reads_bytes: u64,
    pub pmem_writes_bytes: u64,
    pub edc_bytes: u64,
    pub io_request_bytes: u64,
    pub package_energy_units: u64,
    pub dram_energy_units: u64,
    pub package_c_state_residency: [u64; MAX_C_STATE],
    pub tor_occupancy: u64,
    pub tor_inserts: u64,
    pub uncore_clocks: u64,
    pub cha_requests: u64,
    /// Free-running per-channel memory controller counters
    /// (`MEMORY_MAX_IMC_CHANNELS` in the shared-memory layout, SPEC_FULL §2).
    pub per_channel_bytes: Vec<u64>,
}

impl UncoreCounterState {
    pub fn delta(&self, earlier: &UncoreCounterState) -> UncoreCounterState {
        let per_channel_bytes = self
            .per_channel_bytes
            .iter()
            .enumerate()
            .map(|(i, v)| v.saturating_sub(earlier.per_channel_bytes.get(i).copied().unwrap_or(0)))
            .collect();
        UncoreCounterState {
            dram_reads_bytes: self.dram_reads_bytes.saturating_sub(earlier.dram_reads_bytes),
            dram_writes_bytes: self.dram_writes_bytes.saturating_sub(earlier.dram_writes_bytes),
            pmem_reads_bytes: self.pmem_reads_bytes.saturating_sub(earlier.pmem_reads_bytes),
            pmem_writes_bytes: self.pmem_writes_bytes.saturating_sub(earlier.pmem_writes_bytes),
            edc_bytes: self.edc_bytes.saturating_sub(earlier.edc_bytes),
            io_request_bytes: self.io_request_bytes.saturating_sub(earlier.io_request_bytes),
            package_energy_units: self.package_energy_units.saturating_sub(earlier.package_energy_units),
            dram_energy_units: self.dram_energy_units.saturating_sub(earlier.dram_energy_units),
            package_c_state_residency: std::array::from_fn(|i| {
                self.package_c_state_residency[i].saturating_sub(earlier.package_c_state_residency[i])
            }),
            tor_occupancy: self.tor_occupancy,
            tor_inserts: self.tor_inserts.saturating_sub(earlier.tor_inserts),
            uncore_clocks: self.uncore_clocks.saturating_sub(earlier.uncore_clocks),
            cha_requests: self.cha_requests.saturating_sub(earlier.cha_requests),
            per_channel_bytes,
        }
    }

    pub fn accumulate(&mut self, other: &UncoreCounterState) {
        self.dram_reads_bytes += other.dram_reads_bytes;
        self.dram_writes_bytes += other.dram_writes_bytes;
        self.pmem_reads_bytes += other.pmem_reads_bytes;
        self.pmem_writes_bytes += other.pmem_writes_bytes;
        self.edc_bytes += other.edc_bytes;
        self.io_request_bytes += other.io_request_bytes;
        self.package_energy_units += other.package_energy_units;
        self.dram_energy_units += other.dram_energy_units;
        for i in 0..MAX_C_STATE {
            self.package_c_state_residency[i] += other.package_c_state_residency[i];
        }
        self.tor_occupancy += other.tor_occupancy;
        self.tor_inserts += other.tor_inserts;
        self.uncore_clocks += other.uncore_clocks;
        self.cha_requests += other.cha_requests;
        if self.per_channel_bytes.len() < other.per_channel_bytes.len() {
            self.per_channel_bytes.resize(other.per_channel_bytes.len(), 0);
        }
        for (slot, value) in self.per_channel_bytes.iter_mut().zip(&other.per_channel_bytes) {
            *slot += value;
        }
    }
}

/// Per-link xPI (UPI/QPI) traffic counters, indexed `[socket][link]` at
/// the `SystemCounterState` level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XpiLinkState {
    pub incoming_packets: u64,
    pub outgoing_flits: u64,
    pub tx_l0_cycles: u64,
}

/// One socket's rolled-up state: the sum of its online threads' basic
/// counters plus its uncore accumulator (spec.md §4.5 `sample_socket`).
#[derive(Clone, Debug, Default)]
pub struct SocketCounterState {
    pub socket_id: u32,
    pub basic: BasicCounterState,
    pub uncore: UncoreCounterState,
}

/// The union of all sockets plus per-link xPI traffic (spec.md §3).
#[derive(Clone, Debug, Default)]
pub struct SystemCounterState {
    pub basic: BasicCounterState,
    pub uncore: UncoreCounterState,
    /// `xpi_links[socket][link]`.
    pub xpi_links: Vec<Vec<XpiLinkState>>,
}

/// A self-consistent capture of every programmed counter at one instant,
/// dispatched at a monotonic steady-clock time (spec.md §3).
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub dispatched_at: std::time::Instant,
    pub timestamp_ns: u64,
    pub threads: Vec<BasicCounterState>,
    pub sockets: Vec<UncoreCounterState>,
    pub system: SystemCounterState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_fields_elementwise() {
        let mut a = BasicCounterState::default();
        a.instructions_retired = 10;
        a.general_purpose[0] = 1;
        let mut b = BasicCounterState::default();
        b.instructions_retired = 5;
        b.general_purpose[0] = 2;
        a.accumulate(&b);
        assert_eq!(a.instructions_retired, 15);
        assert_eq!(a.general_purpose[0], 3);
    }

    #[test]
    fn delta_saturates_instead_of_wrapping() {
        let mut earlier = BasicCounterState::default();
        earlier.instructions_retired = 100;
        let later = BasicCounterState::default();
        assert_eq!(later.delta(&earlier).instructions_retired, 0);
    }

    #[test]
    fn uncore_accumulate_grows_per_channel_vector() {
        let mut a = UncoreCounterState::default();
        a.per_channel_bytes = vec![1, 2];
        let mut b = UncoreCounterState::default();
        b.per_channel_bytes = vec![10, 20, 30];
        a.accumulate(&b);
        assert_eq!(a.per_channel_bytes, vec![11, 22, 30]);
    }
}
