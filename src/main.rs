#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Node entrypoint (systemd-friendly).
//!
//! Reads configuration from the environment (a full TOML config front-end is an external
//! collaborator concern, out of this crate's scope), boots a [`positron_net::node::Node`], and
//! keeps the process alive until `SIGINT`/`SIGTERM`.

use positron_net::core::config::NodeConfig;
use positron_net::node::Node;
use tracing::{error, info};

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn config_from_env() -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.host = env("P2P_HOST", &cfg.host);
    cfg.port = env_parsed("P2P_PORT", cfg.port);
    cfg.data_dir = env("P2P_DATA_DIR", &cfg.data_dir);
    cfg.log_level = env("P2P_LOG_LEVEL", &cfg.log_level);
    cfg.bootstrap_nodes = std::env::var("P2P_BOOTSTRAP_NODES")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or(cfg.bootstrap_nodes);
    cfg
}

#[tokio::main]
async fn main() {
    let cfg = config_from_env();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cfg.log_level.clone()))
        .with_target(false)
        .compact()
        .try_init();

    let node = match Node::start(cfg).await {
        Ok(node) => node,
        Err(e) => {
            error!(err = ?e, "node failed to start");
            std::process::exit(1);
        }
    };
    node.run().await;
    info!(node = %node.node_id(), "node running");

    shutdown_signal().await;

    info!("shutdown signal received");
    node.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
