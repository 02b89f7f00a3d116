//! Gateway Bootstrap - CLI Application
//!
//! Runs the gateway control plane:
//! - Configuration via TOML
//! - Platform detection and token refresh
//! - Managed rollouts
//! - Health and status endpoints

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use gateway_bootstrap::{
    config::{BootstrapConfig, SAMPLE_CONFIG},
    health::HealthChecker,
    metadata::{resolve_base_url, MetadataClient},
    platform::PlatformResolver,
    Bootstrap,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Gateway Bootstrap - control plane for a cloud API gateway
#[derive(Parser)]
#[command(name = "gateway-bootstrap")]
#[command(version, about = "Bootstrap control plane for a cloud API gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane and its status server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
    /// Detect the compute platform and print it
    Resolve {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    health: Arc<HealthChecker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
        Commands::Resolve { config } => resolve_platform(&config).await?,
    }

    Ok(())
}

fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Start the control plane
async fn start(config_path: &str) -> anyhow::Result<()> {
    init_logging()?;

    let config = BootstrapConfig::from_file(config_path)?;
    info!("Loaded configuration from {}", config_path);

    let health = Arc::new(HealthChecker::new());
    let state = AppState {
        health: health.clone(),
    };

    // Liveness is served while bootstrap is still running
    let app = Router::new()
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/v1/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.server_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server listening on {}", addr);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let bootstrap = match Bootstrap::start(&config).await {
        Ok(bootstrap) => Arc::new(bootstrap),
        Err(e) => {
            error!("Bootstrap failed: {}", e);
            let _ = stop_tx.send(());
            let _ = server.await;
            return Err(e.into());
        }
    };
    health.attach(bootstrap.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    bootstrap.shutdown().await;
    let _ = stop_tx.send(());
    server.await??;

    Ok(())
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match BootstrapConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Status server: {}", config.server_addr());
            println!(
                "Metadata server: {}",
                resolve_base_url(config.metadata.base_url.as_deref())
            );
            println!(
                "Platform override: {}",
                config.platform.platform_override.as_deref().unwrap_or("none")
            );
            println!(
                "Rollout strategy: {}",
                config.rollout.strategy.as_deref().unwrap_or("from metadata")
            );
            println!(
                "Service name: {}",
                config.rollout.service_name.as_deref().unwrap_or("from metadata")
            );
            println!("Poll interval: {}s", config.rollout.poll_interval);
            println!(
                "Identity audience: {}",
                config.tokens.identity_audience.as_deref().unwrap_or("none")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    std::fs::write(output_path, SAMPLE_CONFIG)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}

/// Probe the metadata server and print the platform
async fn resolve_platform(config_path: &str) -> anyhow::Result<()> {
    let config = BootstrapConfig::from_file(config_path)?;
    let client = MetadataClient::new(
        resolve_base_url(config.metadata.base_url.as_deref()),
        config.metadata.retry_policy(),
    )?;

    let platform = PlatformResolver::new(Arc::new(client))
        .with_override(config.platform.platform_override.clone())
        .resolve()
        .await?;
    println!("{}", platform);
    Ok(())
}

/// Liveness handler
async fn liveness_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health.liveness()))
}

/// Readiness handler
async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.readiness();
    (
        if health.status.is_serving() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        Json(health),
    )
}

/// Bootstrap status handler
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.health.status() {
        Some(status) => (StatusCode::OK, Json(serde_json::to_value(status).unwrap_or_default())),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "starting" })),
        ),
    }
}
