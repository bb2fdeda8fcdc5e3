//! grpc-relay - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use grpc_relay::{
    BackendPoolConfig, BackendRegistry, ConnPool, ProxyServer, ProxyService, Router, RouterConfig,
    StaticDirector, StaticResolver, metrics,
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "grpc-relay")]
#[command(about = "Transparent gRPC proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the backend pool config file (JSON)
    #[arg(long)]
    backends: PathBuf,

    /// Path to the router config file (JSON)
    #[arg(long)]
    routes: PathBuf,

    /// Address the relay listens on
    #[arg(long, default_value = "0.0.0.0:8081")]
    listen: SocketAddr,

    /// Address for the Prometheus /metrics endpoint (disabled if unset)
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting gRPC relay");

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Load configuration
    let backends_config =
        BackendPoolConfig::load(&cli.backends).context("Failed to load backend config")?;
    let router_config = RouterConfig::load(&cli.routes).context("Failed to load router config")?;
    router_config.validate(&backends_config)?;

    tracing::info!(
        backends = backends_config.backends.len(),
        routes = router_config.routes.len(),
        listen = %cli.listen,
        "Configuration loaded"
    );

    // Assemble the core: registry -> pool -> director -> handler
    let registry = BackendRegistry::from_config(&backends_config, &StaticResolver)
        .await
        .context("Failed to build backend registry")?;
    let pool = ConnPool::new(backends_config.pool.clone());
    let director = Arc::new(StaticDirector::new(
        Router::new(router_config),
        registry,
        pool.clone(),
    ));
    let proxy = ProxyService::new(director);

    // Periodically publish pool occupancy
    tokio::spawn({
        let pool = pool.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                metrics::update_pool_connections(pool.stats().connections);
            }
        }
    });

    // Expose /metrics if requested
    if let Some(metrics_addr) = cli.metrics_listen {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = prometheus_handle.clone();
                async move { handle.render() }
            }),
        );
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(metrics_addr).await {
                Ok(listener) => {
                    tracing::info!(addr = %metrics_addr, "serving metrics");
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!(error = %e, "metrics server error");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, addr = %metrics_addr, "failed to bind metrics listener");
                }
            }
        });
    }

    // Serve until a shutdown signal arrives
    ProxyServer::new(proxy)
        .serve(cli.listen, shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    pool.shutdown();
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
