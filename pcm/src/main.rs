//! Publisher process entry point (spec.md §6): discovers the topology,
//! programs the counter engine, then runs the Sampling Loop alongside the
//! HTTP server and shared-memory publisher until interrupted.

mod cli;
mod config;
mod daemon;
mod sampling;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use pcm_aggregate::{Aggregator, SnapshotRing};
use pcm_engine::{CounterEngine, ProgramMode};
use pcm_ipc::SharedMemoryPublisher;
use pcm_topology::BuildOptions;

use cli::Opt;
use config::EnvConfig;

fn main() {
    env_logger::init();
    let opt = Opt::parse();
    let env_config = EnvConfig::from_env();

    if !opt.debug {
        if let Err(err) = daemon::daemonize() {
            eprintln!("failed to daemonize (pass -d to run in the foreground): {err}");
            std::process::exit(1);
        }
    }

    if let Err(err) = run(opt, env_config) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("topology discovery failed: {0}")]
    Topology(#[from] pcm_topology::TopologyError),
    #[error("counter engine failed: {0}")]
    Engine(#[from] pcm_engine::EngineError),
    #[error("shared-memory segment failed: {0}")]
    Ipc(#[from] pcm_ipc::IpcError),
    #[error("could not write segment path file: {0}")]
    Io(#[from] std::io::Error),
}

fn run(opt: Opt, env_config: EnvConfig) -> Result<(), RunError> {
    let topology = Arc::new(pcm_topology::discover(&BuildOptions::default())?);
    log::info!(
        "discovered {} socket(s), {} core(s), {} thread(s)",
        topology.socket_count(),
        topology.core_count(),
        topology.online_thread_count(),
    );

    let engine = Arc::new(CounterEngine::new(Arc::clone(&topology)));
    pcm_engine::register_discovered_boxes(&topology, |socket_index, pmu| {
        engine.register_uncore_box(socket_index, pmu);
    });
    if env_config.print_uncore_pmu_discovery {
        log::info!(
            "uncore PMU discovery: PCM_NO_UNCORE_PMU_DISCOVERY={}, {} socket(s) online",
            env_config.no_uncore_pmu_discovery,
            topology.online_socket_count(),
        );
    }
    engine.program(ProgramMode::default())?;

    let publisher = match opt.shm_segment.clone() {
        Some(path) => Some(SharedMemoryPublisher::create(path, opt.poll_ms as u32)?),
        None if opt.shm_path_file.is_some() => {
            let path = std::env::temp_dir().join(format!("pcm-shm-{}", std::process::id()));
            Some(SharedMemoryPublisher::create(path, opt.poll_ms as u32)?)
        }
        None => None,
    };
    if let Some(publisher) = &publisher {
        if let Some(group) = &opt.shm_group {
            if let Err(err) = publisher.set_group_owner(group) {
                log::warn!("could not chown shared-memory segment to group '{group}': {err}");
            }
        }
        if let Some(path_file) = &opt.shm_path_file {
            std::fs::write(path_file, publisher.path().display().to_string())?;
        }
        log::info!("publishing shared memory at {}", publisher.path().display());
    }

    let aggregator = Arc::new(Aggregator::new(Arc::clone(&engine)));
    let ring = SnapshotRing::new();
    let exit = Arc::new(AtomicBool::new(false));

    {
        let exit = Arc::clone(&exit);
        ctrlc::set_handler(move || exit.store(true, Ordering::Relaxed)).expect("failed to install SIGINT handler");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");

    runtime.block_on(async {
        let addr = SocketAddr::from(([0, 0, 0, 0], opt.port));
        let app_state = Arc::new(pcm_server::AppState {
            topology: Arc::clone(&topology),
            ring: ring.clone(),
        });
        let server_exit = Arc::clone(&exit);
        let server_task = tokio::spawn(async move { pcm_server::serve(addr, app_state, server_exit).await });

        sampling::run(
            aggregator,
            ring,
            publisher,
            opt.publish_mode,
            opt.counter_group,
            opt.poll_interval(),
            Arc::clone(&exit),
        )
        .await;

        exit.store(true, Ordering::Relaxed);
        if let Ok(Err(err)) = server_task.await {
            log::warn!("http server exited with error: {err}");
        }
    });

    if let Err(err) = engine.cleanup() {
        log::error!("cleanup failed: {err}");
    }
    Ok(())
}
