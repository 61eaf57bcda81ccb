//! Hydranode daemon.
//!
//! Loads the JSON configuration, wires the scheduler, worker pool and the
//! eDonkey2000 module together, and runs the tick loop until interrupted.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use ed2k::engine::{Ed2k, Ed2kConfig};
use sched::{SchedBase, SchedConfig, WorkerPool};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("hydranode.json"), PathBuf::from);
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "cannot load configuration");
            std::process::exit(1);
        }
    };
    info!(path = %config_path.display(), "configuration loaded");

    if let Err(e) = run(&config) {
        error!(error = %e, "daemon failed");
        std::process::exit(1);
    }
}

fn shutdown_channel() -> Receiver<()> {
    // a tiny handler thread turns SIGINT into a loop-visible message
    let (tx, rx) = bounded(1);
    if let Err(e) = ctrlc_handler(move || {
        let _ = tx.try_send(());
    }) {
        warn!(error = %e, "no interrupt handler; use SIGKILL to stop");
    }
    rx
}

/// Installs a minimal SIGINT hook without pulling a signal crate: stdin
/// EOF (ctrl-d) or an explicit `quit` line also stop the daemon.
fn ctrlc_handler<F: Fn() + Send + 'static>(f: F) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("shutdown-watch".into())
        .spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                match std::io::stdin().read_line(&mut line) {
                    Ok(0) => {
                        f();
                        return;
                    }
                    Ok(_) if line.trim() == "quit" => {
                        f();
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        f();
                        return;
                    }
                }
            }
        })
        .map(|_| ())
}

fn run(config: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.temp_dir)?;
    std::fs::create_dir_all(&config.incoming_dir)?;

    let pool = WorkerPool::new(config.worker_threads);
    let sched_cfg = SchedConfig {
        up_limit: config.up_limit()?,
        down_limit: config.down_limit()?,
        conn_limit: config.connection_limit,
        half_open_limit: config.half_open_limit,
        ..SchedConfig::default()
    };
    let tick_ms = sched_cfg.tick_ms;
    let mut sched = SchedBase::new(sched_cfg, pool.handle());

    let ed2k_cfg = Ed2kConfig {
        nick: config.nick.clone(),
        tcp_port: config.tcp_port,
        udp_port: config.udp_port,
        temp_dir: config.temp_dir.clone(),
        incoming_dir: config.incoming_dir.clone(),
        server_met: config.temp_dir.join("server.met"),
        crypt_key: config.temp_dir.join("cryptkey.dat"),
        upload_slots: config.upload_slots,
        find_servers: config.find_servers,
    };
    let mut engine = Ed2k::new(ed2k_cfg, &mut sched, pool.handle())?;

    for path in &config.shared_dirs {
        share_directory(&mut engine, path);
    }

    let start = Instant::now();
    engine.start(&mut sched, 0);
    info!(
        tcp = config.tcp_port,
        udp = config.udp_port,
        "hydranode is up"
    );

    let shutdown = shutdown_channel();
    loop {
        let now = start.elapsed().as_millis() as u64;
        sched.tick(now);
        engine.tick(&mut sched, now);
        if shutdown.try_recv().is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(tick_ms));
    }

    info!("shutting down");
    for d in engine.downloads.iter_mut() {
        d.part.save();
    }
    if let Err(e) = engine.servers.save_met(&config.temp_dir.join("server.met")) {
        warn!(error = %e, "saving server.met on shutdown");
    }
    Ok(())
}

fn share_directory(engine: &mut Ed2k, dir: &PathBuf) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read shared directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            engine.share_path(path);
        }
    }
}
