use std::net::SocketAddr;

use eventwell_db::{EventStore, PostgresStorage, Storage};

/// Server configuration parsed from environment variables.
///
/// # Environment Variables
///
/// | Variable                    | Required | Default | Description                        |
/// |-----------------------------|----------|---------|------------------------------------|
/// | `DATABASE_URL`              | Yes      | --      | PostgreSQL connection URL          |
/// | `EVENTWELL_METRICS_LISTEN`  | No       | (off)   | Address serving `GET /metrics`     |
#[derive(Debug, Clone, PartialEq)]
struct Config {
    /// PostgreSQL connection URL.
    database_url: String,
    /// Address the Prometheus endpoint listens on; `None` disables it.
    metrics_listen: Option<SocketAddr>,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if `DATABASE_URL` is not set or
    /// `EVENTWELL_METRICS_LISTEN` is set but not a valid socket address.
    fn from_env() -> Result<Config, String> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL environment variable is required".to_string())?;

        let metrics_listen = match std::env::var("EVENTWELL_METRICS_LISTEN") {
            Ok(raw) => Some(raw.parse::<SocketAddr>().map_err(|e| {
                format!("EVENTWELL_METRICS_LISTEN is not a valid socket address: {e}")
            })?),
            Err(_) => None,
        };

        Ok(Config {
            database_url,
            metrics_listen,
        })
    }
}

/// Initialize the global `tracing` subscriber with an `EnvFilter`.
///
/// Reads `RUST_LOG` for level filtering, defaulting to `"info"`. Uses
/// `try_init()` so repeated calls (tests in one process) are a silent no-op.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for a shutdown signal: SIGINT on all platforms, plus SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
    }
}

/// One-shot schema bootstrap: create the tables if the schema is absent.
/// Idempotent; exits 0 whether the schema was created or already present.
async fn run_init(database_url: &str) -> i32 {
    let storage = match PostgresStorage::connect(database_url).await {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect for initialization");
            return 1;
        }
    };

    match storage.initialize().await {
        Ok(true) => {
            tracing::info!("schema created");
            0
        }
        Ok(false) => {
            tracing::info!("schema already initialized");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "schema initialization failed");
            1
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    // `eventwell-db init` bootstraps the schema and exits.
    if std::env::args().nth(1).as_deref() == Some("init") {
        std::process::exit(run_init(&config.database_url).await);
    }

    if let Some(addr) = config.metrics_listen {
        match eventwell_db::metrics::install_recorder() {
            Ok(handle) => {
                eventwell_db::metrics::serve_metrics(handle, addr);
            }
            Err(e) => tracing::warn!(error = %e, "metrics recorder unavailable"),
        }
    }

    let store = match EventStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to the database");
            std::process::exit(1);
        }
    };
    tracing::info!("eventwell-db node running");

    shutdown_signal().await;

    tracing::info!("shutting down");
    store.shutdown().await;
}
