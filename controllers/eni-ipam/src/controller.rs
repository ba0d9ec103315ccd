//! Main controller implementation.
//!
//! Builds every component from the configuration and runs them as background
//! tasks:
//! - ENI watcher: drives ENI objects through their lifecycle
//! - NetResourceSet watcher: keeps the per-node IPAM engines in step
//! - Node watcher: creates NetResourceSets and publishes node capacity
//! - ENI resync: compares ENI objects with the cloud inventory
//! - Node manager resync: refreshes subnets and re-evaluates every node
//! - Metrics server: `/metrics`, `/healthz` and `/readyz`

use crate::adapters::AdapterContext;
use crate::config::ControllerConfig;
use crate::eni::EniSyncer;
use crate::error::ControllerError;
use crate::events::{EventRecorder, KubeEventRecorder};
use crate::ipam::node_manager::NodeManager;
use crate::ipam::subnet::SubnetBorrowTracker;
use crate::metrics::{self, IpamMetrics, ProbeState};
use crate::node_discovery::NodeDiscovery;
use crate::store::{
    EniStore, KubeEniStore, KubeNetResourceSetStore, KubeNodeStore, NetResourceSetStore, NodeStore,
};
use crate::watcher::Watcher;
use cloud_client::{CloudClient, CloudClientTrait, FlowControlClient, LimiterMetrics};
use crds::{ENI, NetResourceSet};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for ENI lifecycle and IP address management.
#[derive(Debug)]
pub struct Controller {
    eni_watcher: JoinHandle<Result<(), ControllerError>>,
    net_resource_set_watcher: JoinHandle<Result<(), ControllerError>>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
    eni_resync: JoinHandle<Result<(), ControllerError>>,
    node_manager_resync: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing ENI IPAM Controller");
        let config = Arc::new(config);

        // Create Kubernetes client
        let kube_client = Client::try_default().await.map_err(ControllerError::Kube)?;

        let registry = Registry::new();
        let limiter_metrics = LimiterMetrics::register(&registry)?;
        let ipam_metrics = IpamMetrics::register(&registry)?;

        // Create cloud client, rate limited per operation
        let cloud_client = CloudClient::new(
            config.cloud_endpoint.clone(),
            config.cloud_token.clone(),
            config.cloud_timeout,
        )?;
        let cloud: Arc<dyn CloudClientTrait> = Arc::new(FlowControlClient::new(
            cloud_client,
            &config.flow_control,
            Some(limiter_metrics),
        )?);
        info!("Cloud client ready for {} in region {}", cloud.endpoint(), config.cloud_region);

        let enis: Arc<dyn EniStore> = Arc::new(KubeEniStore::new(kube_client.clone()));
        let net_resources: Arc<dyn NetResourceSetStore> = Arc::new(KubeNetResourceSetStore::new(kube_client.clone()));
        let nodes: Arc<dyn NodeStore> = Arc::new(KubeNodeStore::new(kube_client.clone()));
        let events: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(kube_client.clone()));
        let subnets = Arc::new(SubnetBorrowTracker::new(Arc::clone(&cloud)));

        let syncer = Arc::new(EniSyncer::new(
            Arc::clone(&config),
            Arc::clone(&cloud),
            Arc::clone(&enis),
            Arc::clone(&net_resources),
            Arc::clone(&events),
            Arc::clone(&subnets),
        ));
        let node_manager = NodeManager::new(
            AdapterContext {
                config: Arc::clone(&config),
                cloud,
                enis,
                nodes: Arc::clone(&nodes),
                subnets,
            },
            Arc::clone(&net_resources),
            ipam_metrics,
        );
        let discovery = Arc::new(NodeDiscovery::new(Arc::clone(&config), net_resources, nodes, events));

        let watcher_instance = Arc::new(Watcher::new(
            syncer,
            node_manager.clone(),
            discovery,
            Api::<ENI>::all(kube_client.clone()),
            Api::<NetResourceSet>::all(kube_client.clone()),
            Api::<Node>::all(kube_client),
        ));

        // Start all watchers in background tasks
        let eni_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_enis().await })
        };

        let net_resource_set_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_net_resource_sets().await })
        };

        let node_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_nodes().await })
        };

        let eni_resync = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.resync_enis().await })
        };

        let node_manager_resync = {
            let interval = config.resync_interval;
            tokio::spawn(async move {
                node_manager.run(interval).await;
                Ok::<(), ControllerError>(())
            })
        };

        let probes = ProbeState::new(registry);
        let metrics_server = {
            let probes = probes.clone();
            let addr = config.metrics_addr.clone();
            tokio::spawn(async move { metrics::serve(&addr, probes).await })
        };
        probes.set_ready(true);

        Ok(Self {
            eni_watcher,
            net_resource_set_watcher,
            node_watcher,
            eni_resync,
            node_manager_resync,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("ENI IPAM Controller running");

        // Wait for any task to exit (they should run forever)
        tokio::select! {
            result = &mut self.eni_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("ENI watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("ENI watcher error: {}", e)))?;
            }
            result = &mut self.net_resource_set_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("NetResourceSet watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("NetResourceSet watcher error: {}", e)))?;
            }
            result = &mut self.node_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Node watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Node watcher error: {}", e)))?;
            }
            result = &mut self.eni_resync => {
                result.map_err(|e| ControllerError::Watch(format!("ENI resync panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("ENI resync error: {}", e)))?;
            }
            result = &mut self.node_manager_resync => {
                result.map_err(|e| ControllerError::Watch(format!("Node manager resync panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Node manager resync error: {}", e)))?;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
