//! Prometheus text and JSON renderers (spec.md §4.8).

use pcm_engine::{BasicCounterState, Snapshot, UncoreCounterState};
use pcm_topology::SystemRoot;
use serde::Serialize;

/// One 16x16 transparent icon. Spec.md §4.8 only requires static bytes at
/// a fixed content type; the exact pixels aren't part of the contract.
pub const FAVICON_BYTES: &[u8] = &[
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x10, 0x10, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00, 0x68, 0x04,
    0x00, 0x00, 0x16, 0x00, 0x00, 0x00,
];

fn munge(name: &str) -> String {
    name.replace(['-', ' '], "_")
}

struct SocketDelta {
    socket_id: u32,
    basic: BasicCounterState,
    uncore: UncoreCounterState,
}

fn per_socket_deltas(topology: &SystemRoot, before: Option<&Snapshot>, after: &Snapshot) -> Vec<SocketDelta> {
    topology
        .sockets
        .iter()
        .enumerate()
        .map(|(socket_idx, socket)| {
            let mut basic_after = BasicCounterState::default();
            let mut basic_before = BasicCounterState::default();
            for &core_idx in &socket.cores {
                for &thread_idx in &topology.cores[core_idx as usize].threads {
                    if let Some(state) = after.threads.get(thread_idx as usize) {
                        basic_after.accumulate(state);
                    }
                    if let Some(before) = before {
                        if let Some(state) = before.threads.get(thread_idx as usize) {
                            basic_before.accumulate(state);
                        }
                    }
                }
            }
            let uncore_after = after.sockets.get(socket_idx).cloned().unwrap_or_default();
            let uncore_before = before
                .and_then(|b| b.sockets.get(socket_idx).cloned())
                .unwrap_or_default();

            let basic = match before {
                Some(_) => basic_after.delta(&basic_before),
                None => basic_after,
            };
            let uncore = match before {
                Some(_) => uncore_after.delta(&uncore_before),
                None => uncore_after,
            };

            SocketDelta {
                socket_id: socket.socket_id,
                basic,
                uncore,
            }
        })
        .collect()
}

/// Emits one line per metric as `metric_name{label="value",...} number`
/// (spec.md §4.8).
pub fn render_prometheus(topology: &SystemRoot, before: Option<&Snapshot>, after: &Snapshot) -> String {
    let mut out = String::new();
    for socket in per_socket_deltas(topology, before, after) {
        let label = format!("{{socket=\"{}\"}}", socket.socket_id);
        push_metric(&mut out, "Instructions_Retired_Any", &label, socket.basic.instructions_retired);
        push_metric(&mut out, "Clock_Unhalted_Thread", &label, socket.basic.cycles_unhalted);
        push_metric(&mut out, "Clock_Unhalted_Ref", &label, socket.basic.cycles_unhalted_ref);
        push_metric(&mut out, "DRAM_Reads", &label, socket.uncore.dram_reads_bytes);
        push_metric(&mut out, "DRAM_Writes", &label, socket.uncore.dram_writes_bytes);
        push_metric(&mut out, "PMem_Reads", &label, socket.uncore.pmem_reads_bytes);
        push_metric(&mut out, "PMem_Writes", &label, socket.uncore.pmem_writes_bytes);
    }
    out
}

fn push_metric(out: &mut String, name: &str, label: &str, value: u64) {
    out.push_str(&munge(name));
    out.push_str(label);
    out.push(' ');
    out.push_str(&value.to_string());
    out.push('\n');
}

#[derive(Serialize)]
struct JsonSocket {
    socket: u32,
    instructions_retired_any: u64,
    clock_unhalted_thread: u64,
    dram_reads_bytes: u64,
    dram_writes_bytes: u64,
}

#[derive(Serialize)]
struct JsonSnapshot {
    timestamp_ns: u64,
    sockets: Vec<JsonSocket>,
}

/// Mirrors the topology tree as a nested JSON object (spec.md §4.8).
pub fn render_json(topology: &SystemRoot, before: Option<&Snapshot>, after: &Snapshot) -> serde_json::Value {
    let sockets = per_socket_deltas(topology, before, after)
        .into_iter()
        .map(|s| JsonSocket {
            socket: s.socket_id,
            instructions_retired_any: s.basic.instructions_retired,
            clock_unhalted_thread: s.basic.cycles_unhalted,
            dram_reads_bytes: s.uncore.dram_reads_bytes,
            dram_writes_bytes: s.uncore.dram_writes_bytes,
        })
        .collect();
    serde_json::to_value(JsonSnapshot {
        timestamp_ns: after.timestamp_ns,
        sockets,
    })
    .unwrap_or(serde_json::Value::Null)
}

pub fn dashboard_json() -> serde_json::Value {
    serde_json::json!({
        "name": "pcm-rs",
        "endpoints": ["/", "/metrics", "/persecond", "/persecond/{n}", "/dashboard"],
    })
}

pub const LANDING_PAGE_HTML: &str = "<!doctype html><html><head><title>pcm-rs</title></head>\
<body><h1>pcm-rs</h1><p>See <a href=\"/metrics\">/metrics</a>.</p></body></html>";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn munge_replaces_dashes_and_spaces() {
        assert_eq!(munge("DRAM Reads-Total"), "DRAM_Reads_Total");
    }
}
