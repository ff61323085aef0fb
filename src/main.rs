//! ClovisGate -- S3-compatible gateway in front of a Motr/Clovis-style
//! backing store.
//!
//! Crash-only design: every startup is a recovery. There is no separate
//! recovery mode. SIGTERM/SIGINT handlers only stop accepting connections
//! and wait with a timeout before exiting -- no cleanup.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

/// Command-line arguments for the ClovisGate server.
#[derive(Parser, Debug)]
#[command(
    name = "clovisgate",
    version,
    about = "S3-compatible gateway front-end for a Motr/Clovis-style backing store"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "clovisgate.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config);
    let config = clovisgate::config::load_config(&cli.config)?;

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Crash-only startup: every startup IS recovery.
    info!("Crash-only startup: performing recovery checks");

    clovisgate::metrics::init_metrics();
    clovisgate::metrics::describe_metrics();
    info!("Prometheus metrics initialized");

    let store: Arc<dyn clovisgate::store::ObjectStoreClient> = match config.store.engine.as_str() {
        "memory" => {
            info!("Using in-memory backing store (dev/test only)");
            Arc::new(clovisgate::store::memory::MemoryObjectStore::new())
        }
        "sqlite" | _ => {
            if let Some(parent) = std::path::Path::new(&config.store.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::create_dir_all(&config.store.objects_root)?;
            let sqlite_store = clovisgate::store::sqlite::SqliteObjectStore::new(
                &config.store.db_path,
                config.store.objects_root.clone(),
            )?;
            info!(
                "SQLite backing store initialized: db={} objects_root={}",
                config.store.db_path, config.store.objects_root
            );
            Arc::new(sqlite_store)
        }
    };

    // Seed the default credential from config (crash-only: idempotent on
    // every startup, just an upsert into the Credentials index).
    let credential = clovisgate::auth::Credential {
        access_key_id: config.auth.access_key.clone(),
        secret_key: config.auth.secret_key.clone(),
        owner_id: config.auth.access_key.clone(),
    };
    clovisgate::records::save_credential(&store, &credential).await?;
    info!("Default credentials seeded");

    let state = Arc::new(clovisgate::AppState {
        config: config.clone(),
        store,
        auth_cache: clovisgate::auth::AuthCache::new(),
    });

    let app = clovisgate::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("ClovisGate listening on {}", bind_addr);

    // Graceful shutdown: on SIGTERM/SIGINT, stop accepting new connections,
    // wait for in-flight requests to complete (with timeout), then exit.
    // No cleanup -- crash-only design means next startup handles recovery.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ClovisGate shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
