//! ENI IPAM Controller
//!
//! Cluster-wide control plane of the ENI CNI:
//! - ENI: drives elastic network interfaces from creation to attachment and
//!   removes the ones that never make it
//! - NetResourceSet: runs one IPAM engine per node that keeps a pool of
//!   addresses between its watermarks
//! - Node: creates each node's NetResourceSet and publishes its interface and
//!   address capacity

mod adapters;
mod backoff;
mod capacity;
mod config;
mod controller;
mod eni;
mod error;
mod events;
mod ipam;
mod metrics;
mod node_discovery;
mod reconcile_helpers;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod watcher_test;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and reqwest both link rustls, pin the process to one provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting ENI IPAM Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Cloud endpoint: {}", config.cloud_endpoint);
    info!("  Region: {}", config.cloud_region);
    info!("  VPC: {}", config.vpc_id);
    info!("  IPv4: {}, IPv6: {}", config.enable_ipv4, config.enable_ipv6);
    info!("  Release excess IPs: {}", config.release_excess_ips);
    info!("  Rate limiting: {}", config.flow_control.enabled);
    info!(
        "  Resync interval: {}",
        humantime::format_duration(config.resync_interval)
    );
    info!("  Range mode: {}", config.discovery.range_mode);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
