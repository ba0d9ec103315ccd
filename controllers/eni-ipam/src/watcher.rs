//! Kubernetes resource watchers.
//!
//! ENI objects go through a `kube_runtime::Controller`, which requeues them
//! while their cloud status settles and backs off per object on failure.
//! NetResourceSets and Nodes are plain watch streams feeding the node
//! manager and node discovery.

use crate::backoff::BackoffTracker;
use crate::eni::{EniSyncer, SyncOutcome};
use crate::error::ControllerError;
use crate::ipam::node_manager::NodeManager;
use crate::node_discovery::NodeDiscovery;
use crate::reconcile_helpers::is_being_deleted;
use crds::{ENI, NetResourceSet};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, ResourceExt};
use kube_runtime::{Controller, WatchStreamExt, controller::{Action, Config as ControllerConfig}, watcher};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Smallest delay before a failed object is reconciled again
const ERROR_BACKOFF_MIN: Duration = Duration::from_secs(1);

/// Largest delay before a failed object is reconciled again
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(60);

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Handler plus the failure backoff of every object it reconciles
struct WatchContext<C> {
    handler: Arc<C>,
    backoff: BackoffTracker,
}

/// Run a `kube_runtime::Controller` for `K` until its stream ends.
///
/// Successful passes reset the object's backoff. Failures requeue the
/// object after the next Fibonacci delay.
async fn watch_resource<K, C, F>(
    api: Api<K>,
    handler: Arc<C>,
    reconcile_fn: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let context = Arc::new(WatchContext {
        handler,
        backoff: BackoffTracker::new(ERROR_BACKOFF_MIN, ERROR_BACKOFF_MAX),
    });

    let error_policy = |obj: Arc<K>, error: &ControllerError, ctx: Arc<WatchContext<C>>| {
        let delay = ctx.backoff.next_backoff(&obj.name_any());
        error!(
            "Reconciliation error for {} {}, retrying in {}: {}",
            resource_name,
            obj.name_any(),
            humantime::format_duration(delay),
            error
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<WatchContext<C>>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let name = obj.name_any();
            debug!("Reconciling {} {}", resource_name, name);
            let action = reconcile_fn(Arc::clone(&ctx.handler), obj).await?;
            ctx.backoff.reset(&name);
            Ok::<Action, ControllerError>(action)
        }
    };

    // Debounce batches the status writes of one pass into a single event
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(3);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, context)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    Ok(())
}

/// Run one syncer pass over an ENI object
pub fn reconcile_eni(syncer: Arc<EniSyncer>, eni: Arc<ENI>) -> ReconcileFuture {
    Box::pin(async move {
        if is_being_deleted(&eni.metadata) {
            syncer.delete(&eni.name_any()).await?;
            return Ok(Action::await_change());
        }
        let outcome = if eni.finalizers().is_empty() {
            syncer.create(&eni).await?
        } else {
            syncer.update(&eni).await?
        };
        Ok(match outcome {
            SyncOutcome::Done => Action::await_change(),
            SyncOutcome::Requeue(delay) => Action::requeue(delay),
        })
    })
}

/// Feed one NetResourceSet watch event to the node manager
pub async fn handle_net_resource_set_event(manager: &NodeManager, event: watcher::Event<NetResourceSet>) {
    match event {
        watcher::Event::Apply(nrs) | watcher::Event::InitApply(nrs) => {
            let name = nrs.name_any();
            if is_being_deleted(&nrs.metadata) {
                manager.delete(&name);
                return;
            }
            if nrs.spec.eni.is_none() {
                debug!("NetResourceSet {} has no interface settings, skipping", name);
                return;
            }
            debug!("NetResourceSet applied: {}", name);
            manager.upsert(&nrs).await;
        }
        watcher::Event::Delete(nrs) => {
            let name = nrs.name_any();
            info!("NetResourceSet deleted: {}", name);
            manager.delete(&name);
        }
        watcher::Event::Init => debug!("NetResourceSet watcher initialized"),
        watcher::Event::InitDone => info!("NetResourceSet watcher initialization complete"),
    }
}

/// Feed one Node watch event to node discovery
pub async fn handle_node_event(discovery: &NodeDiscovery, event: watcher::Event<Node>) {
    match event {
        watcher::Event::Apply(node) => {
            let name = node.name_any();
            debug!("Node applied: {}", name);
            if let Err(e) = discovery.discover(&node).await {
                error!("Failed to discover node {}: {}", name, e);
            }
        }
        watcher::Event::InitApply(node) => {
            let name = node.name_any();
            debug!("Node init apply: {}", name);
            if let Err(e) = discovery.discover(&node).await {
                warn!("Failed to discover node {}: {}", name, e);
            }
        }
        // the NetResourceSet is garbage collected through its owner reference
        watcher::Event::Delete(node) => info!("Node deleted: {}", node.name_any()),
        watcher::Event::Init => debug!("Node watcher initialized"),
        watcher::Event::InitDone => info!("Node watcher initialization complete"),
    }
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    syncer: Arc<EniSyncer>,
    node_manager: NodeManager,
    discovery: Arc<NodeDiscovery>,
    eni_api: Api<ENI>,
    net_resource_set_api: Api<NetResourceSet>,
    node_api: Api<Node>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        syncer: Arc<EniSyncer>,
        node_manager: NodeManager,
        discovery: Arc<NodeDiscovery>,
        eni_api: Api<ENI>,
        net_resource_set_api: Api<NetResourceSet>,
        node_api: Api<Node>,
    ) -> Self {
        Self {
            syncer,
            node_manager,
            discovery,
            eni_api,
            net_resource_set_api,
            node_api,
        }
    }

    /// Starts watching ENI resources.
    pub async fn watch_enis(&self) -> Result<(), ControllerError> {
        watch_resource(self.eni_api.clone(), Arc::clone(&self.syncer), reconcile_eni, "ENI").await
    }

    /// Starts watching NetResourceSet resources.
    pub async fn watch_net_resource_sets(&self) -> Result<(), ControllerError> {
        info!("Starting NetResourceSet watcher");

        let mut stream = Box::pin(
            watcher(self.net_resource_set_api.clone(), watcher::Config::default()).default_backoff(),
        );
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => handle_net_resource_set_event(&self.node_manager, event).await,
                Err(e) => warn!("NetResourceSet watcher stream error: {}", e),
            }
        }

        Err(ControllerError::Watch("NetResourceSet watch stream ended".to_string()))
    }

    /// Starts watching Node resources.
    pub async fn watch_nodes(&self) -> Result<(), ControllerError> {
        info!("Starting Node watcher");

        let mut stream = Box::pin(watcher(self.node_api.clone(), watcher::Config::default()).default_backoff());
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => handle_node_event(&self.discovery, event).await,
                Err(e) => warn!("Node watcher stream error: {}", e),
            }
        }

        Err(ControllerError::Watch("Node watch stream ended".to_string()))
    }

    /// Compares ENI objects with the cloud inventory until the task is dropped.
    pub async fn resync_enis(&self) -> Result<(), ControllerError> {
        info!("Starting ENI resync loop");
        loop {
            let delay = match self.syncer.resync_enis().await {
                Ok(delay) => delay,
                Err(e) => {
                    warn!("Failed to resync ENIs: {}", e);
                    self.syncer.config.eni_resync_interval
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("syncer", &self.syncer)
            .field("node_manager", &self.node_manager)
            .finish_non_exhaustive()
    }
}
