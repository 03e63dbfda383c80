use palette_daemon::{bootstrap, dispatcher, http};
use palette_proto::config::{Config, ConfigStore};
use palette_proto::notification;
use palette_proto::state::StatusManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const USER_AGENT: &str = concat!("palette-daemon/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first: it names the log file
    let store = Arc::new(ConfigStore::open(Config::config_path())?);
    let config = store.snapshot().await;

    let log_path = config.daemon.log_file.clone();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,palette_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", store.path());

    let cancel = CancellationToken::new();
    let status = Arc::new(StatusManager::new());

    let (notifications, notification_rx) = notification::channel(notification::DEFAULT_CAPACITY);
    let dispatcher_handle = dispatcher::spawn(notification_rx, status.clone());

    let http_handle = if config.http.enabled {
        Some(http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            status.clone(),
            cancel.clone(),
        ))
    } else {
        None
    };

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()?;

    let services = bootstrap::Services {
        store,
        notifications,
        status,
        http: client,
        cancel: cancel.clone(),
    };
    let subscription = bootstrap::start(&services).await;

    info!("Daemon initialised, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    if let Some(handle) = subscription {
        let _ = handle.await;
    }
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    // last queue producer goes with the services
    drop(services);
    let _ = dispatcher_handle.await;

    Ok(())
}
