//! Application entry point for the `greenspace-sensors` backend service.
//!
//! Startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Opening the configured store (PostgreSQL pool plus schema, or in-memory)
//! - Mounting all API routes via the `routes` gateway
//! - Serving until SIGINT/SIGTERM, then draining and closing the pool
//!
//! # Environment Variables
//! - `STORE_BACKEND`, `DATABASE_URL`, `DB_*`, `SERVER_*`, `REQUEST_TIMEOUT`:
//!   see [`config::load_from_env`]
//! - `APP_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `APP_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – override TTY color detection
use std::{env, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

mod cancel;
mod codec;
mod config;
mod error;
mod join;
mod models;
mod registry;
mod routes;
mod schema;
mod store;
mod telemetry;

pub use config::Config;

use config::StoreBackend;
use store::{MemoryStore, PgStore, Store};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let (store, pool) = open_store(&cfg).await?;

    let app: Router = routes::router(store, &cfg);

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.bind_addr))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(pool) = pool {
        pool.close().await;
        tracing::info!("Database pool closed");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Open the configured backend. The pool is returned separately so it can be
/// closed once the server has drained.
async fn open_store(cfg: &Config) -> Result<(Arc<dyn Store>, Option<PgPool>)> {
    // ---
    match cfg.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; data is lost on exit");
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            Ok((store, None))
        }
        StoreBackend::Postgres => {
            let url = cfg.db.connection_url();
            let masked = config::mask_db_url(&url);
            tracing::info!("Attempting to connect to database: {}", masked);

            let pool = PgPoolOptions::new()
                .max_connections(cfg.db.pool_max)
                .acquire_timeout(cfg.db.timeout)
                .connect(&url)
                .await
                .with_context(|| format!("Failed to connect to database '{}'", masked))?;

            tracing::info!("Successfully connected to database");

            schema::create_schema(&pool).await?;
            let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
            Ok((store, Some(pool)))
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output: `FORCE_COLOR=1|true|yes` forces it on, `0|false|no` off,
///   anything else auto-detects a TTY
/// - Span events via `APP_SPAN_EVENTS`: `full`, `enter_exit`, otherwise CLOSE
/// - Level via `RUST_LOG` when set, else [`default_directives`]
fn init_tracing() {
    // ---
    let span_events = match env::var("APP_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(env::var("APP_LOG_LEVEL").ok().as_deref()))
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

/// Filter used when `RUST_LOG` is unset.
///
/// `APP_LOG_LEVEL` sets the crate-wide level (default `debug`; unknown values
/// fall back to it). Per-query sqlx logging is held at `warn` and hyper's
/// connection chatter at `info`, so `debug` shows the service's own ingest and
/// join decisions without transport noise.
fn default_directives(level: Option<&str>) -> String {
    // ---
    let level = match level {
        Some(l @ ("trace" | "debug" | "info" | "warn" | "error")) => l,
        _ => "debug",
    };
    format!("{level},sqlx::query=warn,hyper=info")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_default_directives() {
        // ---
        assert_eq!(default_directives(None), "debug,sqlx::query=warn,hyper=info");
        assert_eq!(
            default_directives(Some("warn")),
            "warn,sqlx::query=warn,hyper=info"
        );
        assert_eq!(
            default_directives(Some("loud")),
            "debug,sqlx::query=warn,hyper=info"
        );
        assert!(EnvFilter::try_new(default_directives(Some("trace"))).is_ok());
    }
}
