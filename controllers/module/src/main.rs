//! Module Controller
//!
//! Reconciles `Module` resources: for every kernel version running on the
//! nodes a Module selects, it builds and signs the module image when asked
//! to, then keeps one module-loader DaemonSet per kernel version in place.
//! DaemonSets and Jobs that no longer serve a live kernel are removed.

mod api;
mod backoff;
mod cluster;
mod config;
mod controller;
mod daemonset;
mod error;
mod filter;
mod kernel;
mod metrics;
mod reconcile_helpers;
mod reconciler;
mod server;
mod stage;
mod status;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and oci-client both pull in rustls; pick the provider once.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Module Controller");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Kernel label: {}", config.kernel_label);
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Build image: {}", config.build_image);
    info!("  Sign image: {}", config.sign_image);
    info!(
        "  Requeue backoff: {}s..{}s, concurrency {}",
        config.requeue_min_seconds, config.requeue_max_seconds, config.concurrency
    );

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
