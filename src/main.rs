//! Dagang outbound webhook delivery service.
//!
//! Main entry point. Loads configuration, prepares the queue table, and
//! runs the dispatcher and periodic health reporting until shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use dagang_core::time::RealClock;
use dagang_outbox::{
    BackoffPolicy, BreakerConfig, CircuitBreaker, DispatchConfig, Dispatcher, HealthConfig,
    HealthReporter, HttpSender, PostgresQueueStore, SenderConfig,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting Dagang webhook delivery service");

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let clock = Arc::new(RealClock);
    let store = Arc::new(PostgresQueueStore::new(db_pool.clone()));
    let sender = Arc::new(HttpSender::new(SenderConfig {
        secret: config.webhook_secret.clone(),
        api_key: config.api_key.clone(),
        timeout: config.delivery_timeout,
        service_name: "dagang".to_string(),
    })?);
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        sender,
        breaker.clone(),
        BackoffPolicy::default(),
        clock,
        DispatchConfig { poll_interval: config.poll_interval, batch_size: config.batch_size },
    ));
    let reporter = HealthReporter::new(
        store,
        breaker,
        dispatcher.stats(),
        HealthConfig::default(),
    );

    let shutdown = CancellationToken::new();

    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    let health_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => match reporter.snapshot().await {
                        Ok(snap) => info!(
                            status = %snap.status,
                            backlog = snap.backlog,
                            circuit = %snap.circuit.state,
                            failure_ratio = snap.failure_ratio,
                            delivered = snap.items_delivered,
                            exhausted = snap.items_exhausted,
                            "delivery pipeline health"
                        ),
                        Err(e) => error!(error = %e, "health snapshot failed"),
                    },
                }
            }
        }
    });

    info!("Dagang is delivering webhooks");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");
    shutdown.cancel();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            info!("Shutdown grace period expired");
        }
        _ = dispatcher_handle => {
            info!("Dispatcher stopped");
        }
    }
    health_handle.abort();

    db_pool.close().await;
    info!("Database connections closed");

    info!("Dagang shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,dagang=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the queue table and claim index exist.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbound_webhooks (
            id UUID PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            target_url TEXT NOT NULL,
            payload BYTEA NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            next_retry_at TIMESTAMPTZ,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create outbound_webhooks table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_outbound_webhooks_due
        ON outbound_webhooks(status, next_retry_at, created_at)
        WHERE status IN ('pending', 'failed')
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create outbound_webhooks claim index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_outbound_webhooks_correlation
        ON outbound_webhooks(correlation_id, created_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create outbound_webhooks correlation index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Service configuration.
struct Config {
    /// PostgreSQL connection string
    database_url: String,
    /// Maximum database connections
    database_max_connections: u32,
    /// HMAC signing secret for outbound payloads
    webhook_secret: String,
    /// API key sent with every delivery
    api_key: String,
    /// Per-attempt delivery timeout
    delivery_timeout: Duration,
    /// Dispatcher poll interval
    poll_interval: Duration,
    /// Items claimed per dispatch cycle
    batch_size: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Missing credentials fail startup; a service signing with an empty
    /// secret would produce deliveries every receiver rejects.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .context("WEBHOOK_SECRET environment variable not set")?;

        let api_key =
            std::env::var("WEBHOOK_API_KEY").context("WEBHOOK_API_KEY environment variable not set")?;

        let delivery_timeout = std::env::var("DELIVERY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(dagang_outbox::DEFAULT_TIMEOUT_MS));

        let poll_interval = std::env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let batch_size = std::env::var("DISPATCH_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(dagang_outbox::DEFAULT_BATCH_SIZE);

        Ok(Self {
            database_url,
            database_max_connections,
            webhook_secret,
            api_key,
            delivery_timeout,
            poll_interval,
            batch_size,
        })
    }

    /// Returns database URL with password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(password_start) = self.database_url[..at_pos].rfind(':') {
                if let Some(user_start) = self.database_url[..password_start].rfind('/') {
                    return format!(
                        "{}//{}:***@{}",
                        &self.database_url[..user_start],
                        &self.database_url[user_start + 2..password_start],
                        &self.database_url[at_pos + 1..]
                    );
                }
            }
        }
        // Fallback: just return postgresql://***
        "postgresql://***".to_string()
    }
}
