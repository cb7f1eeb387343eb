//! TCP accept loop: one `hyper_util` auto-protocol connection per accepted
//! socket, each given to its own tokio task (spec.md §4.8).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;

use crate::service::{handle, AppState};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the accept loop until `shutdown` is set. Each connection is served
/// on its own task so a slow client can't stall the listener.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>, shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("pcm-server listening on {addr}");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
        };
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(state.clone(), req));
            let mut builder = Builder::new(hyper_util::rt::TokioExecutor::new());
            builder.http1().timer(TokioTimer::new());
            let conn = builder.serve_connection(io, service);
            match tokio::time::timeout(CONNECTION_TIMEOUT, conn).await {
                Ok(Err(err)) => log::debug!("connection from {peer} ended with error: {err}"),
                Err(_) => log::debug!("connection from {peer} timed out"),
                Ok(Ok(())) => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use pcm_aggregate::SnapshotRing;
    use pcm_engine::{BasicCounterState, Snapshot, SystemCounterState, UncoreCounterState};
    use pcm_topology::{Core, HyperThread, Socket, SystemRoot, TopologyEntry, UncoreVariant};

    use super::*;
    use crate::service::AppState;

    fn one_thread_topology() -> SystemRoot {
        SystemRoot {
            hyperthreads: vec![HyperThread {
                entry: TopologyEntry {
                    os_id: 0,
                    apic_id: Some(0),
                    socket_id: 0,
                    core_id: 0,
                    tile_id: 0,
                    thread_id: 0,
                    online: true,
                },
                msr: None,
            }],
            cores: vec![Core {
                core_id: 0,
                threads: vec![0],
            }],
            sockets: vec![Socket {
                socket_id: 0,
                cores: vec![0],
                reference_core_index: 0,
                uncore_variant: UncoreVariant::Client,
            }],
        }
    }

    /// `/metrics` waits for a `(before, after)` pair, i.e. at least two
    /// entries in the ring (spec.md §4.8).
    fn ring_with_two_snapshots() -> SnapshotRing {
        let ring = SnapshotRing::new();
        let mut earlier = BasicCounterState::default();
        earlier.instructions_retired = 10;
        ring.push(Snapshot {
            dispatched_at: std::time::Instant::now(),
            timestamp_ns: 0,
            threads: vec![earlier],
            sockets: vec![UncoreCounterState::default()],
            system: SystemCounterState::default(),
        });
        let mut later = BasicCounterState::default();
        later.instructions_retired = 42;
        ring.push(Snapshot {
            dispatched_at: std::time::Instant::now(),
            timestamp_ns: 1,
            threads: vec![later],
            sockets: vec![UncoreCounterState::default()],
            system: SystemCounterState::default(),
        });
        ring
    }

    /// Finds a free loopback port by binding then immediately releasing it;
    /// `serve` takes an address rather than a pre-bound listener, so the
    /// handoff has an unavoidable (and in practice harmless) gap.
    fn free_loopback_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        listener.local_addr().expect("local_addr")
    }

    #[tokio::test]
    async fn serve_answers_metrics_over_a_real_loopback_connection() {
        let addr = free_loopback_addr();
        let state = Arc::new(AppState {
            topology: Arc::new(one_thread_topology()),
            ring: ring_with_two_snapshots(),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move { serve(addr, state, server_shutdown).await });

        // Give the accept loop a moment to bind before connecting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).expect("connect to loopback server");
            stream
                .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .expect("write request");
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).expect("read response");
            buf
        })
        .await
        .expect("blocking request task panicked");

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"), "unexpected status line: {text}");
        assert!(text.contains("Instructions_Retired_Any"), "expected Prometheus-style metric names, got: {text}");

        shutdown.store(true, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    }

    #[tokio::test]
    async fn serve_rejects_requests_without_a_host_header() {
        let addr = free_loopback_addr();
        let state = Arc::new(AppState {
            topology: Arc::new(one_thread_topology()),
            ring: ring_with_two_snapshots(),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move { serve(addr, state, server_shutdown).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).expect("connect to loopback server");
            stream
                .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
                .expect("write request");
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).expect("read response");
            buf
        })
        .await
        .expect("blocking request task panicked");

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 400"), "unexpected status line: {text}");

        shutdown.store(true, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    }
}
