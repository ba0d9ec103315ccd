//! Per-node IPAM engine.
//!
//! A [`NetResource`] tracks the address pool of one node, computes the
//! deficit or excess against the node's watermarks and resolves it through
//! the node's [`NetResourceOperations`]. The release of excess addresses goes
//! through a handshake with the node agent carried in
//! `status.ipam.releaseIPs`.
//!
//! All state lives behind one lock that is never held across a cloud or API
//! server call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crds::{AllocationMap, IpReleaseStatus, NetResourceSet, PrivateIp};
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::ipam::action::{AllocationAction, MaintenanceAction};
use crate::ipam::node_manager::NodeManagerHandle;
use crate::ipam::ops::{NetResourceOperations, ReuseRequest};
use crate::ipam::stats::{Statistics, calculate_excess_ips, calculate_needed_ips};
use crate::ipam::trigger::Trigger;
use crate::metrics::IpamMetrics;
use crate::store::NetResourceSetStore;

/// Repeating warnings of one node are logged at most this often
const WARNING_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Grace period after an instance stops before it is considered gone
const STOPPED_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct NodeState {
    resource: Option<NetResourceSet>,
    stats: Statistics,
    available: AllocationMap,
    instance_running: bool,
    instance_stopped_running: Option<Instant>,
    waiting_for_pool_maintenance: bool,
    resync_needed: Option<Instant>,
    last_max_adapter_warning: Option<Instant>,
    last_pending_pods_warning: Option<Instant>,
    /// When each excess address was first seen
    ips_marked_for_release: HashMap<String, Instant>,
    /// Handshake state published to the agent
    ip_release_status: HashMap<String, IpReleaseStatus>,
}

fn warning_due(last: &mut Option<Instant>) -> bool {
    let due = last.is_none_or(|at| at.elapsed() > WARNING_INTERVAL);
    if due {
        *last = Some(Instant::now());
    }
    due
}

fn is_ipv4_or_unparsable(address: &str) -> bool {
    address.parse::<IpAddr>().map_or(true, |ip| ip.is_ipv4())
}

/// IPAM state and pool maintenance of one node
pub struct NetResource {
    name: String,
    config: Arc<ControllerConfig>,
    ops: Arc<dyn NetResourceOperations>,
    manager: Weak<dyn NodeManagerHandle>,
    store: Arc<dyn NetResourceSetStore>,
    metrics: IpamMetrics,
    state: Mutex<NodeState>,

    pool_maintainer: Trigger,
    k8s_sync: Trigger,
    retry: Trigger,
    retry_sync: Trigger,
}

/// Clears the in-flight flag when a maintenance pass ends
struct MaintenanceGuard<'a>(&'a NetResource);

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().waiting_for_pool_maintenance = false;
    }
}

impl NetResource {
    /// Create the engine of a node and spawn its triggers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: Arc<ControllerConfig>,
        ops: Arc<dyn NetResourceOperations>,
        manager: Weak<dyn NodeManagerHandle>,
        store: Arc<dyn NetResourceSetStore>,
        metrics: IpamMetrics,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<NetResource>| {
            let pool_maintainer = {
                let weak = weak.clone();
                Trigger::new(
                    format!("ipam-pool-maintainer-{name}"),
                    config.pool_maintenance_interval,
                    move || {
                        let weak = weak.clone();
                        async move {
                            let Some(node) = weak.upgrade() else {
                                return false;
                            };
                            match node.maintain_ip_pool().await {
                                Ok(()) => node.k8s_sync.trigger(),
                                Err(e) => warn!("Unable to maintain ip pool of node {}: {}", node.name, e),
                            }
                            true
                        }
                    },
                )
            };

            let k8s_sync = {
                let weak = weak.clone();
                Trigger::new(
                    format!("ipam-sync-k8s-{name}"),
                    config.api_sync_interval,
                    move || {
                        let weak = weak.clone();
                        async move {
                            let Some(node) = weak.upgrade() else {
                                return false;
                            };
                            // failures re-arm the retry trigger
                            let _ = node.sync_to_api_server().await;
                            true
                        }
                    },
                )
            };

            let retry = {
                let weak = weak.clone();
                Trigger::new(format!("ipam-pool-maintainer-retry-{name}"), config.resync_interval, move || {
                    let weak = weak.clone();
                    async move {
                        let Some(node) = weak.upgrade() else {
                            return false;
                        };
                        node.pool_maintainer.trigger();
                        true
                    }
                })
            };

            let retry_sync = {
                let weak = weak.clone();
                Trigger::new(format!("ipam-sync-k8s-retry-{name}"), config.resync_interval, move || {
                    let weak = weak.clone();
                    async move {
                        let Some(node) = weak.upgrade() else {
                            return false;
                        };
                        node.k8s_sync.trigger();
                        true
                    }
                })
            };

            Self {
                name,
                config,
                ops,
                manager,
                store,
                metrics,
                state: Mutex::new(NodeState::default()),
                pool_maintainer,
                k8s_sync,
                retry,
                retry_sync,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request a pool maintenance pass
    pub fn trigger_pool_maintenance(&self) {
        self.pool_maintainer.trigger();
    }

    /// Request a sync of the pool and status to the API server
    pub fn trigger_sync(&self) {
        self.k8s_sync.trigger();
    }

    /// Whether the instance is up and did not stop within the grace period
    pub fn is_running(&self) -> bool {
        let state = self.lock();
        state.instance_running
            && state
                .instance_stopped_running
                .is_none_or(|stopped| stopped + STOPPED_GRACE_PERIOD <= Instant::now())
    }

    /// Record whether the NetResourceSet of the node still exists
    pub fn set_running(&self, running: bool) {
        let mut state = self.lock();
        let was_running = state.instance_running;
        state.instance_running = running;
        debug!("Set running {} for node {}", running, self.name);
        if was_running && !running {
            state.instance_stopped_running = Some(Instant::now());
        }
    }

    /// Copy of the node statistics
    pub fn stats(&self) -> Statistics {
        self.lock().stats
    }

    /// Addresses available to the node
    pub fn pool(&self) -> AllocationMap {
        self.lock().available.clone()
    }

    /// Copy of the last NetResourceSet received
    pub fn resource_copy(&self) -> Option<NetResourceSet> {
        self.lock().resource.clone()
    }

    /// Cloud instance of the node, empty until a resource was received
    pub fn instance_id(&self) -> String {
        self.lock()
            .resource
            .as_ref()
            .map(|r| r.spec.instance_id.clone())
            .unwrap_or_default()
    }

    /// Addresses to allocate (positive) or release (negative)
    pub fn get_needed_addresses(&self) -> i64 {
        let stats = self.stats();
        if stats.needed > 0 {
            return stats.needed;
        }
        if self.config.release_excess_ips && stats.excess > 0 {
            return -stats.excess;
        }
        0
    }

    fn get_pre_allocate(&self, resource: &NetResourceSet) -> i64 {
        if resource.spec.ipam.pre_allocate != 0 {
            resource.spec.ipam.pre_allocate
        } else {
            self.config.default_pre_allocate
        }
    }

    fn get_max_allocate(&self, resource: &NetResourceSet, instance_max: i64) -> i64 {
        let max_allocate = resource.spec.ipam.max_allocate;
        if max_allocate > 0 {
            if max_allocate > instance_max {
                debug!(
                    "max-allocate ({}) of node {} is higher than the instance limit ({})",
                    max_allocate, self.name, instance_max
                );
                return instance_max;
            }
            return max_allocate;
        }
        instance_max
    }

    /// A new version of the node's NetResourceSet was observed.
    ///
    /// Returns whether addresses need to be allocated, in which case a pool
    /// maintenance pass has been triggered.
    pub async fn updated_resource(&self, resource: &NetResourceSet) -> bool {
        self.ops.updated_node(resource);
        self.lock().resource = Some(resource.clone());
        self.set_running(true);

        self.recalculate().await;
        let needed = self.allocation_needed();
        if needed {
            self.pool_maintainer.trigger();
        }
        needed
    }

    /// Refresh the pool from the node's interfaces and recompute the statistics
    pub async fn recalculate(&self) {
        if self.lock().resource.is_none() {
            return;
        }

        let inventory = self.ops.resync_interfaces_and_ips().await;
        let instance_max = self.ops.maximum_allocatable_ipv4();
        let burstable = self.ops.maximum_burstable_allocatable_ipv4();

        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(resource) = state.resource.as_ref() else {
            return;
        };

        let inventory = match inventory {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!(
                    "Unable to resync interfaces of node {}, delete its NetResourceSet if the instance is gone: {}",
                    self.name, e
                );
                state.stats.needed = 0;
                state.stats.excess = 0;
                return;
            }
        };

        let used = resource
            .status
            .as_ref()
            .map(|s| s.ipam.used.keys().filter(|ip| is_ipv4_or_unparsable(ip)).count())
            .unwrap_or_default();
        let available = inventory
            .available
            .keys()
            .filter(|ip| is_ipv4_or_unparsable(ip))
            .count();

        let pre_allocate = self.get_pre_allocate(resource);
        let min_allocate = resource.spec.ipam.min_allocate;
        let max_allocate = self.get_max_allocate(resource, instance_max);
        let max_above_watermark = resource.spec.ipam.max_above_watermark;

        state.available = inventory.available;
        state.stats.used = i64::try_from(used).unwrap_or(i64::MAX);
        state.stats.available = i64::try_from(available).unwrap_or(i64::MAX);
        state.stats.remaining_interfaces = inventory.remaining_interfaces;
        state.stats.needed = calculate_needed_ips(
            state.stats.available,
            state.stats.used,
            pre_allocate,
            min_allocate,
            max_allocate,
            burstable,
        );
        state.stats.excess = calculate_excess_ips(
            state.stats.available,
            state.stats.used,
            pre_allocate,
            min_allocate,
            max_above_watermark,
            burstable,
        );

        debug!(
            "Recalculated needed addresses of node {}: available={} used={} toAlloc={} toRelease={} waitingForPoolMaintenance={} resyncNeeded={} maxBurstableIPs={}",
            self.name,
            state.stats.available,
            state.stats.used,
            state.stats.needed,
            state.stats.excess,
            state.waiting_for_pool_maintenance,
            state.resync_needed.is_some(),
            burstable
        );
    }

    /// Whether the node needs addresses and no pass or resync is pending
    pub fn allocation_needed(&self) -> bool {
        let state = self.lock();
        !state.waiting_for_pool_maintenance && state.resync_needed.is_none() && state.stats.needed > 0
    }

    /// Whether the node has excess addresses or a release handshake in progress
    pub fn release_needed(&self) -> bool {
        let state = self.lock();
        let needed = self.config.release_excess_ips
            && !state.waiting_for_pool_maintenance
            && state.resync_needed.is_none()
            && state.stats.excess > 0;
        let in_progress = state
            .resource
            .as_ref()
            .and_then(|r| r.status.as_ref())
            .is_some_and(|s| !s.ipam.release_ips.is_empty());
        needed || in_progress
    }

    /// Mark a maintenance pass as wanted or in flight
    pub fn require_pool_maintenance(&self) {
        self.lock().waiting_for_pool_maintenance = true;
    }

    fn begin_pool_maintenance(&self) -> MaintenanceGuard<'_> {
        self.require_pool_maintenance();
        MaintenanceGuard(self)
    }

    fn require_resync(&self) {
        self.lock().resync_needed = Some(Instant::now());
    }

    /// Clear the pending resync when the manager resynced after it was requested
    pub fn update_last_resync(&self, sync_time: Instant) {
        let mut state = self.lock();
        if state.resync_needed.is_some_and(|needed| sync_time > needed) {
            debug!("Resetting resyncNeeded of node {}", self.name);
            state.resync_needed = None;
        }
    }

    async fn pending_pod_count(&self) -> Result<usize, ControllerError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| ControllerError::Reconciliation("node manager is gone".to_string()))?;
        manager.pending_pod_count(&self.name).await
    }

    async fn determine_maintenance_action(&self) -> Result<Option<MaintenanceAction>, ControllerError> {
        let stats = self.stats();

        // bursting nodes overprovision on purpose and never release
        if self.config.release_excess_ips
            && stats.excess > 0
            && self.ops.maximum_burstable_allocatable_ipv4() == 0
        {
            return Ok(Some(MaintenanceAction {
                allocation: None,
                release: Some(self.ops.prepare_ip_release(stats.excess)),
            }));
        }

        if stats.needed == 0 {
            return Ok(None);
        }

        let mut allocation = self.ops.prepare_ip_allocation().await?;

        let surge = match self.pending_pod_count().await {
            Ok(pending) => (i64::try_from(pending).unwrap_or(i64::MAX) - stats.needed).max(0),
            Err(e) => {
                if warning_due(&mut self.lock().last_pending_pods_warning) {
                    warn!(
                        "Unable to compute pending pods of node {}, will not surge-allocate: {}",
                        self.name, e
                    );
                }
                0
            }
        };
        allocation.max_ips_to_allocate = stats.needed + surge;

        let stats = {
            let mut state = self.lock();
            state.stats.remaining_interfaces = allocation.available_interfaces;
            state.stats
        };

        info!(
            "Resolving IP deficit of node {}: available={} used={} neededIPs={} remainingInterfaces={} selectedInterface={} selectedPoolID={} maxIPsToAllocate={}",
            self.name,
            stats.available,
            stats.used,
            stats.needed,
            stats.remaining_interfaces,
            allocation.interface_id,
            allocation.pool_id,
            allocation.max_ips_to_allocate
        );

        Ok(Some(MaintenanceAction {
            allocation: Some(allocation),
            release: None,
        }))
    }

    /// Forget released addresses the agent has removed from its status
    fn remove_stale_release_ips(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let published = state
            .resource
            .as_ref()
            .and_then(|r| r.status.as_ref())
            .map(|s| &s.ipam.release_ips);
        state.ip_release_status.retain(|ip, status| {
            *status != IpReleaseStatus::Released || published.is_some_and(|p| p.contains_key(ip))
        });
    }

    /// Cancel handshakes of addresses that are no longer in excess
    fn abort_no_longer_excess_ips(&self, excess: &HashSet<&str>) {
        let mut guard = self.lock();
        abort_no_longer_excess_locked(&mut guard, excess);
    }

    async fn handle_ip_release(&self, action: &mut MaintenanceAction) -> Result<bool, ControllerError> {
        let now = Instant::now();
        let delay = self.config.excess_ip_release_delay;
        let candidates = action.release_candidates().to_vec();
        let excess: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let mut to_release = Vec::new();

        {
            let mut guard = self.lock();
            let state = &mut *guard;

            for ip in &candidates {
                state.ips_marked_for_release.entry(ip.clone()).or_insert(now);
            }
            if candidates.is_empty() {
                state.ips_marked_for_release.clear();
            }

            let published = state
                .resource
                .as_ref()
                .and_then(|r| r.status.as_ref())
                .map(|s| s.ipam.release_ips.clone())
                .unwrap_or_default();

            let mut to_mark = Vec::new();
            let marked: Vec<(String, Instant)> = state
                .ips_marked_for_release
                .iter()
                .map(|(ip, at)| (ip.clone(), *at))
                .collect();
            for (ip, marked_at) in marked {
                if !excess.contains(ip.as_str()) {
                    state.ips_marked_for_release.remove(&ip);
                    state.ip_release_status.remove(&ip);
                    continue;
                }
                if now.duration_since(marked_at) < delay {
                    continue;
                }
                match published.get(&ip) {
                    Some(IpReleaseStatus::ReadyForRelease) => to_release.push(ip),
                    Some(IpReleaseStatus::DoNotRelease) => {
                        state.ips_marked_for_release.remove(&ip);
                        state.ip_release_status.remove(&ip);
                    }
                    Some(_) => {}
                    None => to_mark.push(ip),
                }
            }

            for ip in to_mark {
                debug!("Marking IP {} of node {} for release", ip, self.name);
                state.ip_release_status.insert(ip, IpReleaseStatus::MarkedForRelease);
            }

            abort_no_longer_excess_locked(state, &excess);
        }

        if to_release.is_empty() {
            return Ok(false);
        }
        let Some(release) = action.release.as_mut() else {
            return Ok(false);
        };

        to_release.sort();
        release.ips_to_release = to_release;
        let stats = self.stats();
        info!(
            "Releasing excess IPs from node {}: available={} used={} excess={} releasing={:?} selectedInterface={} selectedPoolID={}",
            self.name,
            stats.available,
            stats.used,
            stats.excess,
            release.ips_to_release,
            release.interface_id,
            release.pool_id
        );

        match self.ops.release_ips(release).await {
            Ok(()) => {
                let count = i64::try_from(release.ips_to_release.len()).unwrap_or(i64::MAX);
                self.metrics.add_ip_release(&release.pool_id, count);
                let mut state = self.lock();
                for ip in &release.ips_to_release {
                    state.ips_marked_for_release.remove(ip);
                    state.ip_release_status.insert(ip.clone(), IpReleaseStatus::Released);
                }
                Ok(true)
            }
            Err(e) => {
                self.metrics
                    .inc_allocation_attempt("ip unassignment failed", &release.pool_id);
                warn!(
                    "Unable to unassign {} IPs from interface {} of node {}: {}",
                    release.ips_to_release.len(),
                    release.interface_id,
                    self.name,
                    e
                );
                Err(e)
            }
        }
    }

    async fn handle_ip_allocation(&self, action: &mut MaintenanceAction) -> Result<bool, ControllerError> {
        let Some(allocation) = action.allocation.as_mut() else {
            debug!("No allocation action required for node {}", self.name);
            return Ok(false);
        };

        if allocation.has_capacity() {
            let max = allocation.max_ips_to_allocate;
            allocation.available_for_allocation_ipv4 = allocation.available_for_allocation_ipv4.min(max);
            allocation.available_for_allocation_ipv6 = allocation.available_for_allocation_ipv6.min(max);

            match self.ops.allocate_ips(allocation).await {
                Ok(()) => {
                    self.metrics.inc_allocation_attempt("success", &allocation.pool_id);
                    self.metrics.add_ip_allocation(
                        &allocation.pool_id,
                        allocation.available_for_allocation_ipv4 + allocation.available_for_allocation_ipv6,
                    );
                    return Ok(true);
                }
                Err(e) => {
                    self.metrics
                        .inc_allocation_attempt("ip assignment failed", &allocation.pool_id);
                    warn!(
                        "Unable to assign {} IPv4 and {} IPv6 addresses to interface {} of node {}, will create new interface: {}",
                        allocation.available_for_allocation_ipv4,
                        allocation.available_for_allocation_ipv6,
                        allocation.interface_id,
                        self.name,
                        e
                    );
                }
            }
        }

        self.create_interface(allocation).await
    }

    async fn create_interface(&self, allocation: &AllocationAction) -> Result<bool, ControllerError> {
        if allocation.available_interfaces == 0 {
            // running at capacity is not an allocation failure
            if warning_due(&mut self.lock().last_max_adapter_warning) {
                warn!("Instance {} of node {} is out of interfaces", self.instance_id(), self.name);
            }
            return Ok(false);
        }

        match self.ops.create_interface(allocation).await {
            Ok(created) => {
                self.metrics.inc_allocation_attempt("success", &allocation.pool_id);
                debug!("Created {} interfaces on node {}", created, self.name);
                Ok(true)
            }
            Err(e) => {
                self.metrics.inc_allocation_attempt(e.condition, &allocation.pool_id);
                warn!("Unable to create interface on instance of node {}: {}", self.name, e);
                Err(e.source)
            }
        }
    }

    /// One pass of release-then-allocate, returning whether the cloud was mutated
    async fn resolve_pool_gap(&self) -> Result<bool, ControllerError> {
        if self.config.release_excess_ips {
            self.remove_stale_release_ips();
        }

        let mut action = match self.determine_maintenance_action().await {
            Ok(Some(action)) => action,
            Ok(None) => {
                self.abort_no_longer_excess_ips(&HashSet::new());
                return Ok(false);
            }
            Err(e) => {
                self.abort_no_longer_excess_ips(&HashSet::new());
                return Err(e);
            }
        };

        if self.handle_ip_release(&mut action).await? {
            return Ok(true);
        }
        self.handle_ip_allocation(&mut action).await
    }

    /// Allocate or release addresses to close the node's gap, creating
    /// interfaces when needed
    pub async fn maintain_ip_pool(&self) -> Result<(), ControllerError> {
        let _guard = self.begin_pool_maintenance();

        let manager = self.manager.upgrade();
        if !manager.as_ref().is_some_and(|m| m.instances_api_is_ready()) {
            self.retry.trigger();
            return Err(ControllerError::InstancesApiUnstable);
        }

        if !self.is_running() {
            return Ok(());
        }

        let result = self.resolve_pool_gap().await;
        if result.is_ok() {
            debug!("Setting resync needed for node {}", self.name);
            self.require_resync();
        }
        self.recalculate().await;

        if matches!(result, Ok(true) | Err(_)) {
            debug!("Pool maintenance of node {} triggering resync", self.name);
            if let Some(manager) = manager {
                manager.trigger_resync();
            }
        }
        result.map(|_| ())
    }

    /// Publish the local handshake states into `nrs`, keeping answers the
    /// agent already gave to addresses still marked for release
    pub fn populate_ip_release_status(&self, nrs: &mut NetResourceSet) {
        self.remove_stale_release_ips();
        let state = self.lock();
        let status = nrs.status.get_or_insert_with(Default::default);

        let mut release = BTreeMap::new();
        for (ip, local) in &state.ip_release_status {
            if *local == IpReleaseStatus::MarkedForRelease {
                if let Some(answer @ (IpReleaseStatus::ReadyForRelease | IpReleaseStatus::DoNotRelease)) =
                    status.ipam.release_ips.get(ip).copied()
                {
                    release.insert(ip.clone(), answer);
                    continue;
                }
            }
            release.insert(ip.clone(), *local);
        }
        status.ipam.release_ips = release;
    }

    /// Write status then pool to the API server, re-arming the retry trigger on failure
    pub async fn sync_to_api_server(&self) -> Result<(), ControllerError> {
        let result = self.write_to_api_server().await;
        if let Err(e) = &result {
            self.retry_sync.trigger();
            error!("Error syncing NetResourceSet {} to apiserver: {}", self.name, e);
        }
        result
    }

    async fn write_to_api_server(&self) -> Result<(), ControllerError> {
        debug!("Refreshing node {}", self.name);
        let Some(mut node) = self.resource_copy() else {
            return Ok(());
        };
        let name = node.name_any();

        // the pool written to the spec must never be newer than the status
        let pool = self.pool();

        let mut result = Ok(());
        for attempt in 0..2 {
            self.ops.populate_status_fields(&mut node);
            self.populate_ip_release_status(&mut node);

            match self.store.update_status(&node).await {
                Ok(updated) => {
                    node = updated;
                    result = Ok(());
                    break;
                }
                Err(e) if e.is_not_found() => {
                    warn!("Skipping status update of NetResourceSet {}: {}", name, e);
                    self.set_running(false);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Failed to update status of NetResourceSet {} (attempt {}): {}", name, attempt, e);
                    match self.store.get(&name).await? {
                        Some(latest) => node = latest,
                        None => return Ok(()),
                    }
                    result = Err(e);
                }
            }
        }
        if let Err(e) = result {
            warn!("Unable to update NetResourceSet {} status: {}", name, e);
            return Err(e);
        }

        let mut result = Ok(());
        for attempt in 0..2 {
            node.spec.ipam.pool = pool.clone();
            if node.spec.ipam.pre_allocate == 0 {
                node.spec.ipam.pre_allocate = self.ops.minimum_allocatable_ipv4();
            }
            debug!("Updating NetResourceSet {} with pool size {}", name, pool.len());

            match self.store.update(&node).await {
                Ok(_) => {
                    result = Ok(());
                    break;
                }
                Err(e) => {
                    debug!("Failed to update NetResourceSet {} (attempt {}): {}", name, attempt, e);
                    match self.store.get(&name).await? {
                        Some(latest) => node = latest,
                        None => return Ok(()),
                    }
                    result = Err(e);
                }
            }
        }
        if let Err(e) = &result {
            warn!("Unable to update NetResourceSet {} spec: {}", name, e);
        }
        result
    }

    /// Borrow an address from another subnet for this node
    pub async fn allocate_ip_cross_subnet(
        &self,
        subnet_id: &str,
    ) -> Result<(Vec<PrivateIp>, String), ControllerError> {
        self.ops.allocate_ip_cross_subnet(subnet_id).await
    }

    /// Move addresses held elsewhere onto this node
    pub async fn reuse_ips(&self, ips: &[ReuseRequest], owner: &str) -> Result<String, ControllerError> {
        self.ops.reuse_ips(ips, owner).await
    }
}

fn abort_no_longer_excess_locked(state: &mut NodeState, excess: &HashSet<&str>) {
    let Some(published) = state
        .resource
        .as_ref()
        .and_then(|r| r.status.as_ref())
        .map(|s| &s.ipam.release_ips)
    else {
        return;
    };

    for (ip, status) in published {
        if excess.contains(ip.as_str()) || *status == IpReleaseStatus::Released {
            continue;
        }
        // the handshake can be aborted from every state but released
        if state
            .ip_release_status
            .get(ip)
            .is_some_and(|local| *local != IpReleaseStatus::Released)
        {
            state.ips_marked_for_release.remove(ip);
            state.ip_release_status.remove(ip);
        }
    }
}

impl std::fmt::Debug for NetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetResource")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
