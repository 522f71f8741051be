//! Routeway - HTTP routing data-plane
//!
//! Routes incoming requests by host and path to pools of registered backend
//! endpoints. Registrations arrive through the admin API.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{parse_duration, RouterConfig};
use routeway_proxy::{HttpTransport, ProxyConfig, ProxyRoundTripper, ProxyStats};
use routeway_router::{LoadBalance, RegistryConfig, RouteRegistry};
use routeway_server::access_log::access_hook;
use routeway_server::{AdminServer, AdminState, HeartbeatFlag, ProxyServer, RequestHandler};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Routeway - route HTTP and TCP traffic to registered backends
#[derive(Parser, Debug)]
#[command(name = "routeway")]
#[command(about = "Routeway - route HTTP and TCP traffic to registered backends")]
#[command(version = concat!(env!("ROUTEWAY_GIT_TAG"), " (", env!("ROUTEWAY_GIT_HASH"), ", built ", env!("ROUTEWAY_BUILD_TIME"), ")"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML configuration file
    #[arg(short, long, env = "ROUTEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address for proxied traffic (e.g., 0.0.0.0:8081)
    #[arg(long, env = "ROUTEWAY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Address for the admin API (e.g., 127.0.0.1:8082)
    #[arg(long, env = "ROUTEWAY_ADMIN")]
    admin: Option<SocketAddr>,

    /// Per-attempt endpoint timeout (e.g., 60s; 0 disables)
    #[arg(long, env = "ROUTEWAY_ENDPOINT_TIMEOUT", value_parser = parse_duration)]
    endpoint_timeout: Option<Duration>,

    /// Load balancing policy: round-robin or least-connection
    #[arg(long, env = "ROUTEWAY_LOAD_BALANCE")]
    load_balance: Option<LoadBalance>,

    /// Trace key enabling X-Router-Address / X-Router-Backend
    #[arg(long, env = "ROUTEWAY_TRACE_KEY")]
    trace_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ROUTEWAY_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Config file values, overridden by flags
    fn into_config(self) -> Result<RouterConfig> {
        let mut config = match &self.config {
            Some(path) => RouterConfig::load(path)?,
            None => RouterConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(admin) = self.admin {
            config.admin_addr = admin;
        }
        if let Some(timeout) = self.endpoint_timeout {
            config.endpoint_timeout = timeout;
        }
        if let Some(policy) = self.load_balance {
            config.load_balance = policy;
        }
        if let Some(trace_key) = self.trace_key {
            config.trace_key = trace_key;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }

        Ok(config)
    }
}

/// Setup logging with the specified log level; RUST_LOG wins when set
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.into_config()?;

    setup_logging(&config.log_level)?;
    info!("Routeway {} ({}) starting...", env!("ROUTEWAY_GIT_TAG"), env!("ROUTEWAY_GIT_HASH"));

    let registry = Arc::new(RouteRegistry::new(RegistryConfig {
        prune_stale_droplets_interval: config.prune_stale_droplets_interval,
        droplet_stale_threshold: config.droplet_stale_threshold,
        retry_after_failure: config.retry_after_failure,
    }));
    registry.start_pruning_cycle();

    let stats = Arc::new(ProxyStats::new());
    let heartbeat = HeartbeatFlag::new(false);

    let transport = HttpTransport::new().with_dial_timeout(config.dial_timeout);
    let proxy = ProxyRoundTripper::new(
        Arc::new(transport),
        ProxyConfig {
            trace_key: config.trace_key.clone(),
            router_ip: config.router_ip.clone(),
            secure_cookies: config.secure_cookies,
            load_balance: config.load_balance,
            endpoint_timeout: config.endpoint_timeout,
            dial_timeout: config.dial_timeout,
        },
    )
    .with_reporter(stats.clone())
    .with_access_hook(access_hook());

    let handler = RequestHandler::new(registry.clone(), Arc::new(proxy), heartbeat.clone())
        .with_health_check_user_agent(config.health_check_user_agent.clone());

    let proxy_server = ProxyServer::bind(config.listen_addr, Arc::new(handler))
        .await
        .context("Failed to start proxy listener")?;
    let admin_server = AdminServer::bind(
        config.admin_addr,
        Arc::new(AdminState {
            registry: registry.clone(),
            stats,
            heartbeat: heartbeat.clone(),
        }),
    )
    .await
    .context("Failed to start admin API")?;

    info!("Proxy address: {}", proxy_server.local_addr()?);
    info!("Admin address: {}", admin_server.local_addr()?);

    let shutdown = CancellationToken::new();
    let proxy_task = tokio::spawn(proxy_server.serve(shutdown.clone()));
    let admin_task = tokio::spawn(admin_server.serve(shutdown.clone()));
    heartbeat.set_healthy(true);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, draining...");

    heartbeat.set_healthy(false);
    if !config.drain_wait.is_zero() {
        tokio::time::sleep(config.drain_wait).await;
    }

    shutdown.cancel();
    registry.stop_pruning_cycle();

    for (name, task) in [("proxy", proxy_task), ("admin", admin_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task panicked: {}", name, e),
        }
    }

    info!("Routeway stopped");
    Ok(())
}
