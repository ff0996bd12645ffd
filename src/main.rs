//! Application entry point for the `coldchain-sensorsync` service.
//!
//! This binary orchestrates the full startup sequence, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Selecting the store: PostgreSQL when `DATABASE_URL` is set (schema
//!   created if missing), in-memory otherwise
//! - Connecting the BLE gateway driver
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! - `BLE_GATEWAY_URL` (**required**) – base URL of the BLE bridge
//! - `DATABASE_URL` (optional) – PostgreSQL connection string
//! - `SENSORSYNC_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `SENSORSYNC_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`coldchain_sensorsync::config`] for the remaining tunables.
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use coldchain_sensorsync::{
    config, routes, schema, GatewayDriver, MemoryStore, PgStore, SensorStore,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let store: Arc<dyn SensorStore> = match &cfg.db_url {
        Some(db_url) => {
            tracing::info!("Connecting to database");
            let pool = PgPoolOptions::new()
                .max_connections(cfg.db_pool_max)
                .connect(db_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Successfully connected to database");

            schema::create_schema(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, logs will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let driver = Arc::new(GatewayDriver::new(&cfg));
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(store, driver, cfg);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `SENSORSYNC_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `SENSORSYNC_LOG_LEVEL` env var
///
/// Call once at startup, before any logging macros run.
fn init_tracing() {
    // ---
    let span_events = match env::var("SENSORSYNC_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to SENSORSYNC_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("SENSORSYNC_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
