use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use riffled::api::all_routes;
use riffled::config::Config;
use riffled::hub::Hub;

#[derive(Parser, Debug)]
#[command(name = "riffled")]
#[command(about = "Riffle Dataplane Daemon")]
struct Args {
    /// Path to config file (default: RIFFLE_CONFIG or /etc/riffle/riffle.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Control API bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,
    /// Launch a worker per listed core at startup, e.g. -c 1 -c 2
    #[arg(short = 'c', long = "core")]
    cores: Vec<usize>,
    /// Packet buffers per NUMA-node pool (overrides config)
    #[arg(long)]
    buffers: Option<usize>,
    /// Use plain pages instead of huge pages for packet pools
    #[arg(long)]
    plain_pools: bool,
    /// Validate config and environment, then exit
    #[arg(short = 't', long)]
    test: bool,
}

/// Write the panic payload and backtrace somewhere durable before the abort
/// profile kills the process.
fn install_crash_handler(crash_file: String) {
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let report = format!("{info}\n{backtrace}\n");
        eprintln!("{report}");
        if let Some(parent) = std::path::Path::new(&crash_file).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&crash_file, &report) {
            eprintln!("[riffled] failed to write crash report to {crash_file}: {err}");
        }
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }
    if let Some(buffers) = args.buffers {
        config.runtime.buffers_per_socket = buffers;
    }
    if args.plain_pools {
        config.runtime.plain_pools = true;
    }

    install_crash_handler(config.logging.crash_file.clone());

    // Calibrate the cycle counter before anything cares about rates.
    let hz = riffled::tsc::tsc_hz();
    info!("[riffled] tsc frequency: {:.3} GHz", hz as f64 / 1e9);

    if args.test {
        println!("[riffled] config ok; bind={}", config.api.bind);
        return Ok(());
    }

    let bind = config.api.bind.clone();
    let scheduler = config.runtime.default_scheduler.clone();
    let hub = Hub::new(config);

    for (wid, core) in args.cores.iter().enumerate() {
        let hub = hub.clone();
        let core = *core;
        let scheduler = scheduler.clone();
        tokio::task::spawn_blocking(move || hub.add_worker(wid, core, &scheduler))
            .await??;
        info!("[riffled] worker {wid} launched on core {core}");
    }

    let mut shutdown = hub.subscribe_shutdown();

    let api = all_routes(hub.clone());
    let listener = TcpListener::bind(&bind).await?;
    info!("[riffled] control API on http://{bind}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api).await {
            eprintln!("server error: {e}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[riffled] SIGINT received");
        }
        _ = sigterm.recv() => {
            info!("[riffled] SIGTERM received");
        }
        _ = shutdown.changed() => {
            info!("[riffled] shutdown requested via control API");
        }
    }

    info!("[riffled] pausing workers and shutting down...");
    let hub_clone = Arc::clone(&hub);
    if tokio::task::spawn_blocking(move || hub_clone.pause_all())
        .await
        .is_err()
    {
        warn!("[riffled] pause on shutdown failed; exiting anyway");
    }
    std::process::exit(0);
}
