use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weaver_cli::broker::EventKind;
use weaver_cli::cache::CacheManager;
use weaver_cli::control::{
    ApiServer,
    ControlPlane,
    ControlPlaneConfig,
    SqliteRegistry,
    StaticTemplates,
};
use weaver_cli::database::SessionDb;
use weaver_cli::headless::client::{ClientRegistry, ProviderKind};
use weaver_cli::watcher::{DEFAULT_DEBOUNCE, DbWatcher, WatchEvent};
use weaver_cli::control::events::ControlEvent;

/// Drive AI coding assistants as headless subprocesses over a beads board.
#[derive(Debug, Parser)]
#[command(name = "weaver", version, about)]
struct Cli {
    /// Path to the beads database to watch.
    #[arg(long, default_value = "beads.db")]
    db_path: PathBuf,

    /// Path to weaver's own session repository.
    #[arg(long, default_value = "weaver.db")]
    state_db: PathBuf,

    /// API port; 0 auto-assigns.
    #[arg(long, default_value_t = 0)]
    api_port: u16,

    /// Default provider for new workflows.
    #[arg(long, default_value = "claude")]
    provider: String,

    /// Max concurrent workers per workflow.
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Directory exported to subprocesses as BEADS_DIR.
    #[arg(long)]
    beads_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let default_provider = ProviderKind::from_str(&cli.provider)
        .map_err(|_| eyre::eyre!("unknown provider: {}", cli.provider))?;
    info!(provider = %default_provider, "starting weaver");

    let clients = Arc::new(ClientRegistry::with_defaults());
    let db = Arc::new(SessionDb::open(&cli.state_db).wrap_err("opening session repository")?);
    let registry = Arc::new(SqliteRegistry::new(db));

    let plane = ControlPlane::new(registry.clone(), clients, ControlPlaneConfig {
        max_workers_per_pool: cli.max_workers,
        beads_dir: cli.beads_dir.clone().or_else(|| cli.db_path.parent().map(Into::into)),
        ..ControlPlaneConfig::default()
    });

    let api = ApiServer::start(
        cli.api_port,
        registry,
        plane.clone(),
        Arc::new(StaticTemplates::default()),
    )
    .await
    .wrap_err("starting api server")?;
    info!(port = api.port(), "api ready");

    // Watch the beads database; a change flushes the query cache before
    // anything rereads it, then asks the UI to refresh the active mode.
    let cache: Arc<CacheManager<String, serde_json::Value>> = Arc::new(CacheManager::new());
    let watcher = DbWatcher::start(&cli.db_path, DEFAULT_DEBOUNCE).wrap_err("starting watcher")?;
    {
        let cache = cache.clone();
        let bus = plane.bus();
        let mut events = watcher.subscribe(CancellationToken::new());
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event.payload {
                    WatchEvent::DbChanged => {
                        cache.flush().await;
                        bus.publish(
                            EventKind::Custom("refresh".to_string()),
                            ControlEvent::ModeRefreshRequested,
                        );
                    },
                    WatchEvent::WatcherError(message) => {
                        warn!(%message, "database watcher error");
                    },
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.wrap_err("waiting for ctrl-c")?;
    info!("shutting down");

    api.stop();
    watcher.stop();
    watcher.stopped().await;
    plane.shutdown(Duration::from_secs(10)).await;
    Ok(())
}
