use std::path::PathBuf;
#[cfg(feature = "xen-backend")]
use std::sync::atomic::AtomicBool;
#[cfg(feature = "xen-backend")]
use std::sync::Arc;

use clap::Parser;
#[cfg(feature = "xen-backend")]
use tokio::sync::Mutex;

use qmemman_daemon::allocator::Allocator;
use qmemman_daemon::config::Config;
use qmemman_daemon::constants;
#[cfg(feature = "xen-backend")]
use qmemman_daemon::hypervisor::Hypervisor;
#[cfg(feature = "xen-backend")]
use qmemman_daemon::notify;
#[cfg(feature = "xen-backend")]
use qmemman_daemon::server::{self, RequestServer};
#[cfg(feature = "xen-backend")]
use qmemman_daemon::state::SystemState;
#[cfg(feature = "xen-backend")]
use qmemman_daemon::watcher::XsWatcher;

/// Xen memory-balancing daemon: listens for VM memory requests and keeps
/// every guest near its preferred working set.
#[derive(Parser, Debug)]
#[command(name = "qmemmand", version, about)]
struct Cli {
    /// Path to the daemon's INI config file.
    #[arg(short, long, default_value = constants::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stay attached to the controlling terminal and log to stderr
    /// instead of relying on the system journal.
    #[arg(short, long)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.foreground);

    let config = Config::load(&cli.config)?;
    tracing::info!(
        min_prefmem = config.allocator.min_prefmem,
        dom0_mem_boost = config.allocator.dom0_mem_boost,
        cache_factor = config.allocator.cache_factor,
        config_path = %cli.config.display(),
        "loaded configuration"
    );

    run(config.allocator).await
}

fn init_logging(foreground: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if foreground {
        subscriber.init();
    } else {
        subscriber.with_ansi(false).init();
    }
}

#[cfg(feature = "xen-backend")]
async fn run(allocator: Allocator) -> anyhow::Result<()> {
    use qmemman_daemon::hypervisor::xen::XenHypervisor;
    let hv = Arc::new(XenHypervisor::connect().await?);
    run_with_hypervisor(hv, allocator).await
}

#[cfg(not(feature = "xen-backend"))]
async fn run(_allocator: Allocator) -> anyhow::Result<()> {
    anyhow::bail!(
        "qmemmand was built without the `xen-backend` feature; \
         there is no hypervisor backend to connect to"
    )
}

#[cfg(feature = "xen-backend")]
async fn run_with_hypervisor<H>(hv: Arc<H>, allocator: Allocator) -> anyhow::Result<()>
where
    H: Hypervisor,
{
    let state = SystemState::new(hv.clone(), allocator).await?;
    let state = Arc::new(Mutex::new(state));
    let force_reenumerate = Arc::new(AtomicBool::new(false));

    let listener = server::bind(std::path::Path::new(constants::DEFAULT_SOCK_PATH))?;
    tracing::info!(sock_path = constants::DEFAULT_SOCK_PATH, "listening");

    let request_server = RequestServer::new(state.clone(), force_reenumerate.clone());
    let watcher = XsWatcher::new(hv, state, force_reenumerate).await?;

    notify::notify_ready();

    let server_task = tokio::spawn(request_server.run(listener));
    let watcher_task = tokio::spawn(watcher.run());
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        res = server_task => {
            res??;
        }
        res = watcher_task => {
            res??;
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
        }
    }

    Ok(())
}
