use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use courier_server::api::{self, AppState};
use courier_server::blob_store::BlobStore;
use courier_server::config::ServerConfig;
use courier_server::rate_limit::RateLimiter;
use courier_server::router::Router;
use courier_server::server;
use courier_server::session::SessionSettings;
use courier_store::{Persistence, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier relay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        registration_open = config.registration_open,
        session_policy = ?config.session_policy,
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Open storage and rebuild in-memory state
    // -----------------------------------------------------------------------
    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    let blob_store =
        BlobStore::new(config.blob_storage_path.clone(), config.max_blob_size).await?;
    let router = Arc::new(Router::load(store.clone(), blob_store.clone(), &config)?);
    info!(
        users = router.user_count(),
        groups = router.group_count(),
        "State loaded"
    );

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();
    let shutdown = CancellationToken::new();

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Every 5 minutes: evict buckets idle >10 min and unused lock entries
    let rl = rate_limiter.clone();
    let lock_tables = router.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let buckets = rl.purge_stale(Duration::from_secs(600));
            let locks = lock_tables.purge_idle_locks();
            debug!(buckets, locks, "Purged idle entries");
        }
    });

    // -----------------------------------------------------------------------
    // 5. Bind listeners
    // -----------------------------------------------------------------------
    let relay_listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding relay listener on {}", config.listen_addr))?;
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http_addr))?;

    let app_state = AppState {
        blob_store: Arc::new(blob_store),
        router: router.clone(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
        started: Instant::now(),
    };

    let relay = tokio::spawn(server::run(
        relay_listener,
        router,
        SessionSettings::from(&config),
        rate_limiter,
        shutdown.clone(),
    ));

    // -----------------------------------------------------------------------
    // 6. Run until Ctrl+C or the HTTP server fails
    // -----------------------------------------------------------------------
    let http = api::serve(app_state, http_listener, shutdown.clone());
    tokio::pin!(http);

    let outcome = tokio::select! {
        result = &mut http => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Err(e) = relay.await {
        tracing::warn!(error = %e, "Relay listener task failed");
    }
    store.flush().context("flushing store")?;
    info!("Shutdown complete");

    outcome
}
