//! awardlens HTTP Server
//!
//! Serves the analytics core over HTTP/JSON and runs the background job
//! workers and the artifact reaper.
//!
//! # Endpoints
//!
//! ## Query
//! - `POST /api/v1/search` - One page of matching contracts
//! - `POST /api/v1/aggregate` - Top groups per dimension plus summary
//! - `POST /api/v1/aggregate/paginated` - One dimension, paginated
//! - `POST /api/v1/distribution` - Contract value histogram
//! - `POST /api/v1/rounding` - Rounding pattern analysis
//!
//! ## Export
//! - `POST /api/v1/export/estimate` - Row count and size estimate
//! - `POST /api/v1/export` - Inline CSV, or `202` with a job id
//!
//! ## Jobs
//! - `POST /api/v1/jobs` - Submit a background job
//! - `GET /api/v1/jobs/:id` - Job status
//! - `POST /api/v1/jobs/:id/cancel` - Cancel a job
//! - `GET /api/v1/jobs/:id/events` - Progress as server-sent events
//! - `GET /api/v1/jobs/:id/artifact` - Download the result
//!
//! ## Catalog
//! - `GET /api/v1/options` - Filter picker values
//! - `POST /api/v1/options/lookup` - Entity name lookup
//! - `GET /api/v1/catalog` - Dataset sources
//! - `POST /api/v1/catalog/reload` - Rediscover the dataset directory
//! - `POST /api/v1/catalog/verify` - Checksum every source
//!
//! ## Admin
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//!
//! # CLI Commands
//!
//! - `start` - Start the HTTP server (default if no command specified)
//! - `check-config` - Validate configuration file
//! - `catalog` - List dataset sources without starting the server
//! - `verify` - Checksum every dataset source

mod config;
mod handlers;
mod types;

use awardlens::services::ServiceConfig;
use awardlens::{AnalyticsEngine, Config};
use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use handlers::AppState;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// =============================================================================
// Router and Server Setup
// =============================================================================

/// Build CORS layer from configuration
fn build_cors_layer(cors_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if cors_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        layer.allow_origin(origins)
    }
}

/// Build the application router
fn build_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let api = Router::new()
        // Query
        .route("/search", post(handlers::search))
        .route("/aggregate", post(handlers::aggregate))
        .route("/aggregate/paginated", post(handlers::aggregate_paginated))
        .route("/distribution", post(handlers::value_distribution))
        .route("/rounding", post(handlers::rounding_patterns))
        // Export
        .route("/export/estimate", post(handlers::export_estimate))
        .route("/export", post(handlers::export))
        // Jobs
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/:id", get(handlers::job_status))
        .route("/jobs/:id/cancel", post(handlers::cancel_job))
        .route("/jobs/:id/events", get(handlers::job_events))
        .route("/jobs/:id/artifact", get(handlers::job_artifact))
        // Catalog
        .route("/options", get(handlers::filter_options))
        .route("/options/lookup", post(handlers::lookup))
        .route("/catalog", get(handlers::catalog))
        .route("/catalog/reload", post(handlers::reload_catalog))
        .route("/catalog/verify", post(handlers::verify_catalog));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(cors_origins))
}

/// Graceful shutdown signal handler
///
/// A handler that fails to install waits forever instead of panicking, so
/// the server can still be stopped by the other signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler installation failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

/// Install the tracing subscriber
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    if config.monitoring.structured_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }
}

// =============================================================================
// CLI Definition
// =============================================================================

/// awardlens - analytics over government contract awards
#[derive(Parser)]
#[command(name = "awardlens-server")]
#[command(version)]
#[command(
    about = "Search, aggregation and export server for contract award data",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (overrides AWARDLENS_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override listen address (e.g., 0.0.0.0:8080)
    #[arg(short, long, global = true)]
    listen: Option<String>,

    /// Override dataset directory
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Start,

    /// Validate configuration file without starting the server
    CheckConfig,

    /// List dataset sources without starting the server
    Catalog {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Checksum every dataset source
    Verify,
}

/// Resolve configuration and apply CLI overrides
fn resolve_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let (mut config, source) = config::load_config(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config.dataset.data_dir = data_dir.clone();
    }
    if let Some(listen) = &cli.listen {
        let addr: SocketAddr = listen.parse()?;
        config.server.host = addr.ip().to_string();
        config.server.port = addr.port();
    }
    config.validate()?;
    eprintln!("[config] Loaded configuration from {}", source);
    Ok(config)
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(cli)?;

    println!("Configuration is valid!");
    println!();
    println!("Server:");
    println!("  Listen address: {}:{}", config.server.host, config.server.port);
    println!();
    println!("Dataset:");
    println!("  Data directory: {:?}", config.dataset.data_dir);
    println!("  Segment cache: {} segments", config.dataset.segment_cache_capacity);
    println!(
        "  Fallback years: {}-{}",
        config.dataset.first_year, config.dataset.last_year
    );
    println!();
    println!("Query:");
    println!("  Sync budget: {} ms", config.query.sync_budget_ms);
    println!("  Inline export threshold: {} rows", config.export.sync_row_threshold);
    println!();
    println!("Tasks:");
    println!("  Artifact directory: {:?}", config.tasks.artifact_dir);
    println!("  Workers: {}", config.tasks.workers);
    println!("  Retention: {} s", config.tasks.retention_secs);
    println!();
    println!("Monitoring:");
    println!("  Metrics enabled: {}", config.monitoring.metrics_enabled);
    println!("  Log level: {}", config.monitoring.log_level);

    Ok(())
}

/// List dataset sources
fn cmd_catalog(cli: &Cli, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(cli)?;
    let catalog = awardlens::catalog::CatalogHandle::open(
        config.dataset.data_dir.clone(),
        config.dataset.segment_cache_capacity,
    )?;
    let snapshot = catalog.snapshot();

    if format == "json" {
        let body = serde_json::json!({
            "dataDir": config.dataset.data_dir,
            "sources": snapshot.sources(),
            "skipped": snapshot
                .skipped()
                .iter()
                .map(|(path, reason)| serde_json::json!({"path": path, "reason": reason}))
                .collect::<Vec<_>>(),
            "coveredYears": snapshot.covered_years(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("awardlens catalog");
        println!("=================");
        println!();
        println!("Data directory: {:?}", config.dataset.data_dir);
        if let Some((first, last)) = snapshot.covered_years() {
            println!("Covered years: {}-{}", first, last);
        }
        println!();
        for source in snapshot.sources() {
            println!(
                "  {:<48} {:<28} {:>12} rows  {}",
                source.id,
                source.grain.to_string(),
                source.row_count,
                format_bytes(source.file_size)
            );
        }
        for (path, reason) in snapshot.skipped() {
            println!("  skipped {:?}: {}", path, reason);
        }
    }

    Ok(())
}

/// Checksum every source
fn cmd_verify(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(cli)?;
    let catalog = awardlens::catalog::CatalogHandle::open(
        config.dataset.data_dir.clone(),
        config.dataset.segment_cache_capacity,
    )?;
    let report = catalog.verify();

    for check in report.sources.iter().chain(report.skipped.iter()) {
        match &check.error {
            None => println!("  ok      {}", check.id),
            Some(e) => println!("  FAILED  {}: {}", check.id, e),
        }
    }
    println!();
    println!("Verified {} sources in {} ms", report.sources.len(), report.duration_ms);

    if report.is_healthy() {
        Ok(())
    } else {
        Err("catalog verification failed".into())
    }
}

/// Format bytes into human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::CheckConfig) => return cmd_check_config(&cli),
        Some(Commands::Catalog { format }) => return cmd_catalog(&cli, format),
        Some(Commands::Verify) => return cmd_verify(&cli),
        Some(Commands::Start) | None => {},
    }

    let config = resolve_config(&cli)?;
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers.max(1))
        .enable_all()
        .build()?
        .block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&config);
    if config.monitoring.metrics_enabled {
        awardlens::metrics::init();
    }

    info!("Starting awardlens server v{}", env!("CARGO_PKG_VERSION"));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let cors_origins = config.server.cors_origins.clone();

    let engine = AnalyticsEngine::builder().with_config(config).build()?;
    let services = Arc::new(engine.services(ServiceConfig::default())?);
    services.start_all().await?;

    let supervisor = tokio::spawn({
        let services = services.clone();
        async move { services.supervise().await }
    });

    let state = Arc::new(AppState {
        engine,
        services: services.clone(),
    });
    let app = build_router(state, &cors_origins);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = services.shutdown().await {
        warn!(error = %e, "Background services did not stop cleanly");
    }
    if tokio::time::timeout(Duration::from_secs(5), supervisor).await.is_err() {
        warn!("Supervisor did not stop in time");
    }

    info!("Server shutdown complete");
    Ok(())
}
