//! Node manager.
//!
//! Owns one [`NetResource`] per NetResourceSet, feeds it watch events and
//! runs the periodic resync that refreshes subnets and re-evaluates every
//! node's pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use crds::{EniType, NetResourceSet};
use futures::future::join_all;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapters::{self, AdapterContext};
use crate::error::ControllerError;
use crate::ipam::net_resource::NetResource;
use crate::ipam::trigger::Trigger;
use crate::metrics::IpamMetrics;
use crate::store::NetResourceSetStore;

/// Minimum spacing of two resyncs requested by pool maintenance
const RESYNC_TRIGGER_INTERVAL: Duration = Duration::from_secs(10);

/// What a [`NetResource`] needs from the manager that owns it
#[async_trait]
pub trait NodeManagerHandle: Send + Sync {
    /// Whether the last resync of the cloud inventory succeeded
    fn instances_api_is_ready(&self) -> bool;

    /// Request a resync of all nodes soon
    fn trigger_resync(&self);

    /// Pods bound to the node that wait for an address
    async fn pending_pod_count(&self, node_name: &str) -> Result<usize, ControllerError>;
}

struct ManagedNode {
    instance_type: EniType,
    resource: Arc<NetResource>,
}

struct ManagerInner {
    adapters: AdapterContext,
    store: Arc<dyn NetResourceSetStore>,
    metrics: IpamMetrics,
    nodes: Mutex<HashMap<String, ManagedNode>>,
    instances_api_ready: AtomicBool,
    resync_trigger: Trigger,
}

/// Registry of per-node IPAM engines
#[derive(Clone)]
pub struct NodeManager {
    inner: Arc<ManagerInner>,
}

impl NodeManager {
    /// Create the manager. Must be called from within a Tokio runtime.
    pub fn new(adapters: AdapterContext, store: Arc<dyn NetResourceSetStore>, metrics: IpamMetrics) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let weak = weak.clone();
            let resync_trigger = Trigger::new("ipam-node-manager-resync", RESYNC_TRIGGER_INTERVAL, move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    inner.resync().await;
                    true
                }
            });

            ManagerInner {
                adapters,
                store,
                metrics,
                nodes: Mutex::new(HashMap::new()),
                instances_api_ready: AtomicBool::new(false),
                resync_trigger,
            }
        });
        Self { inner }
    }

    /// Engine of a node, if the node is known
    pub fn get(&self, name: &str) -> Option<Arc<NetResource>> {
        self.inner.lock().get(name).map(|n| Arc::clone(&n.resource))
    }

    /// Names of all known nodes
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// A NetResourceSet was created or updated
    pub async fn upsert(&self, resource: &NetResourceSet) {
        self.inner.upsert(resource).await;
    }

    /// A NetResourceSet was deleted
    pub fn delete(&self, name: &str) {
        if let Some(node) = self.inner.lock().remove(name) {
            node.resource.set_running(false);
            info!("Removed node {} from IPAM", name);
        }
    }

    /// Refresh subnets and re-evaluate every node
    pub async fn resync(&self) {
        self.inner.resync().await;
    }

    pub fn instances_api_is_ready(&self) -> bool {
        self.inner.instances_api_is_ready()
    }

    /// Resync every `interval` until the task is dropped
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.inner.resync().await;
        }
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ManagedNode>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(self: &Arc<Self>) -> Weak<dyn NodeManagerHandle> {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }

    async fn upsert(self: &Arc<Self>, resource: &NetResourceSet) {
        let name = resource.name_any();
        let instance_type = resource.eni_spec().instance_type;

        let (node, created) = {
            let mut nodes = self.lock();
            match nodes.get(&name) {
                Some(existing) if existing.instance_type == instance_type => (Arc::clone(&existing.resource), false),
                _ => {
                    let ops = adapters::new_operations(resource, self.adapters.clone());
                    let node = NetResource::new(
                        name.clone(),
                        Arc::clone(&self.adapters.config),
                        ops,
                        self.handle(),
                        Arc::clone(&self.store),
                        self.metrics.clone(),
                    );
                    nodes.insert(
                        name.clone(),
                        ManagedNode {
                            instance_type,
                            resource: Arc::clone(&node),
                        },
                    );
                    (node, true)
                }
            }
        };

        if created {
            info!("Discovered new NetResourceSet {} ({})", name, instance_type.as_str());
        }
        node.updated_resource(resource).await;
        if created {
            node.trigger_pool_maintenance();
            node.trigger_sync();
        }
    }

    async fn resync(&self) {
        let sync_time = Instant::now();

        match self.adapters.subnets.resync(&self.adapters.config.vpc_id).await {
            Ok(count) => {
                debug!("Synchronized {} subnets", count);
                self.instances_api_ready.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                warn!("Unable to synchronize subnets, blocking mutating operations: {}", e);
                self.instances_api_ready.store(false, Ordering::SeqCst);
                return;
            }
        }

        let nodes: Vec<Arc<NetResource>> = self.lock().values().map(|n| Arc::clone(&n.resource)).collect();
        join_all(nodes.iter().map(|node| async move {
            node.update_last_resync(sync_time);
            node.recalculate().await;
            if node.allocation_needed() || node.release_needed() {
                debug!("Node {} needs {} addresses", node.name(), node.get_needed_addresses());
                node.require_pool_maintenance();
                node.trigger_pool_maintenance();
            }
            node.trigger_sync();
        }))
        .await;
        debug!("Resynced {} nodes", nodes.len());
    }
}

#[async_trait]
impl NodeManagerHandle for ManagerInner {
    fn instances_api_is_ready(&self) -> bool {
        self.instances_api_ready.load(Ordering::SeqCst)
    }

    fn trigger_resync(&self) {
        self.resync_trigger.trigger();
    }

    async fn pending_pod_count(&self, node_name: &str) -> Result<usize, ControllerError> {
        self.adapters.nodes.pending_pod_count(node_name).await
    }
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("nodes", &self.node_names())
            .field("instances_api_ready", &self.instances_api_is_ready())
            .finish_non_exhaustive()
    }
}
