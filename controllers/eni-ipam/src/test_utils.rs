//! Test utilities for unit testing the syncer, the IPAM engine and the adapters
//!
//! In-memory stores stand in for the API server: they track resource
//! versions, reject stale writes with a conflict and honour finalizers on
//! delete. Builders create the objects most tests start from.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use cloud_client::{InstanceDetail, MockCloudClient, NicInfo, NicIp, Subnet};
use crds::{
    AllocationIp, ENI, EniSpec, EniStatus, EniType, EniUseMode, IpamSpec, LABEL_NODE_NAME, NetResourceSet,
    NetResourceSetSpec, NodeEniSpec, PrivateIp, VpcEniStatus,
};
use k8s_openapi::api::core::v1::{Node, NodeStatus, ObjectReference};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};

use crate::adapters::AdapterContext;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::{EventKind, EventRecorder};
use crate::ipam::action::{AllocationAction, ReleaseAction};
use crate::ipam::node_manager::NodeManagerHandle;
use crate::ipam::ops::{InterfaceCreationError, InterfaceInventory, NetResourceOperations, ReuseRequest};
use crate::ipam::subnet::SubnetBorrowTracker;
use crate::store::{EniStore, NetResourceSetStore, NodeStore, eni_has_ip};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now() -> Option<Time> {
    timestamp_ago(Duration::ZERO)
}

/// API server timestamp `age` in the past
pub fn timestamp_ago(age: Duration) -> Option<Time> {
    let at = Utc::now() - chrono::Duration::from_std(age).ok()?;
    serde_json::from_value(serde_json::Value::String(
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
    ))
    .ok()
}

/// Objects keyed by name with API server write semantics
#[derive(Debug)]
struct ObjectTable<K> {
    objects: BTreeMap<String, K>,
    next_version: u64,
    conflicts: usize,
}

impl<K> Default for ObjectTable<K> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_version: 1,
            conflicts: 0,
        }
    }
}

impl<K> ObjectTable<K>
where
    K: Resource + Clone,
{
    fn stamp(&mut self, obj: &mut K) {
        obj.meta_mut().resource_version = Some(self.next_version.to_string());
        self.next_version += 1;
    }

    fn create(&mut self, obj: &K) -> Result<K, ControllerError> {
        let name = obj.name_any();
        if self.objects.contains_key(&name) {
            return Err(ControllerError::Conflict(format!("{name} already exists")));
        }
        let mut stored = obj.clone();
        self.stamp(&mut stored);
        self.objects.insert(name, stored.clone());
        Ok(stored)
    }

    /// Stored copy matching the version of `obj`
    fn current(&mut self, obj: &K) -> Result<&mut K, ControllerError> {
        let name = obj.name_any();
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(ControllerError::Conflict(format!("{name} injected conflict")));
        }
        let stored = self
            .objects
            .get_mut(&name)
            .ok_or_else(|| ControllerError::NotFound(name.clone()))?;
        let wanted = obj.meta().resource_version.as_ref();
        if wanted.is_some() && wanted != stored.meta().resource_version.as_ref() {
            return Err(ControllerError::Conflict(format!("{name} has been modified")));
        }
        Ok(stored)
    }

    /// Drop an object whose deletion finished with its last finalizer
    fn collect(&mut self, name: &str) {
        let finished = self.objects.get(name).is_some_and(|o| {
            o.meta().deletion_timestamp.is_some() && o.meta().finalizers.as_ref().is_none_or(Vec::is_empty)
        });
        if finished {
            self.objects.remove(name);
        }
    }

    fn delete(&mut self, name: &str) {
        let Some(stored) = self.objects.get_mut(name) else {
            return;
        };
        if stored.meta().finalizers.as_ref().is_none_or(Vec::is_empty) {
            self.objects.remove(name);
            return;
        }
        if stored.meta().deletion_timestamp.is_none() {
            stored.meta_mut().deletion_timestamp = now();
        }
    }
}

/// In-memory ENI objects
#[derive(Debug, Default)]
pub struct MemoryEniStore {
    table: Mutex<ObjectTable<ENI>>,
}

impl MemoryEniStore {
    /// Store an object as is, replacing any previous one
    pub fn insert(&self, eni: ENI) -> ENI {
        let mut table = lock(&self.table);
        let mut stored = eni;
        table.stamp(&mut stored);
        table.objects.insert(stored.name_any(), stored.clone());
        stored
    }

    pub fn snapshot(&self, name: &str) -> Option<ENI> {
        lock(&self.table).objects.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.table).objects.keys().cloned().collect()
    }

    /// Fail the next `count` writes with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        lock(&self.table).conflicts = count;
    }
}

#[async_trait]
impl EniStore for MemoryEniStore {
    async fn get(&self, name: &str) -> Result<Option<ENI>, ControllerError> {
        Ok(self.snapshot(name))
    }

    async fn list_by_node(&self, node_name: &str) -> Result<Vec<ENI>, ControllerError> {
        Ok(lock(&self.table)
            .objects
            .values()
            .filter(|e| e.labels().get(LABEL_NODE_NAME).is_some_and(|n| n == node_name))
            .cloned()
            .collect())
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Vec<ENI>, ControllerError> {
        Ok(lock(&self.table)
            .objects
            .values()
            .filter(|e| eni_has_ip(e, ip))
            .cloned()
            .collect())
    }

    async fn create(&self, eni: &ENI) -> Result<ENI, ControllerError> {
        lock(&self.table).create(eni)
    }

    async fn update(&self, eni: &ENI) -> Result<ENI, ControllerError> {
        let mut table = lock(&self.table);
        let stored = table.current(eni)?;
        let status = stored.status.clone();
        let deletion = stored.metadata.deletion_timestamp.clone();
        let mut next = eni.clone();
        next.status = status;
        next.metadata.deletion_timestamp = deletion;
        table.stamp(&mut next);
        let name = next.name_any();
        table.objects.insert(name.clone(), next.clone());
        table.collect(&name);
        Ok(next)
    }

    async fn update_status(&self, eni: &ENI) -> Result<ENI, ControllerError> {
        let mut table = lock(&self.table);
        let stored = table.current(eni)?;
        let mut next = stored.clone();
        next.status = eni.status.clone();
        table.stamp(&mut next);
        table.objects.insert(next.name_any(), next.clone());
        Ok(next)
    }

    async fn delete(&self, name: &str) -> Result<(), ControllerError> {
        lock(&self.table).delete(name);
        Ok(())
    }
}

/// In-memory NetResourceSet objects
#[derive(Debug, Default)]
pub struct MemoryNetResourceSetStore {
    table: Mutex<ObjectTable<NetResourceSet>>,
    writes: AtomicUsize,
}

impl MemoryNetResourceSetStore {
    pub fn insert(&self, nrs: NetResourceSet) -> NetResourceSet {
        let mut table = lock(&self.table);
        let mut stored = nrs;
        table.stamp(&mut stored);
        table.objects.insert(stored.name_any(), stored.clone());
        stored
    }

    pub fn snapshot(&self, name: &str) -> Option<NetResourceSet> {
        lock(&self.table).objects.get(name).cloned()
    }

    pub fn inject_conflicts(&self, count: usize) {
        lock(&self.table).conflicts = count;
    }

    /// Successful spec and status writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetResourceSetStore for MemoryNetResourceSetStore {
    async fn get(&self, name: &str) -> Result<Option<NetResourceSet>, ControllerError> {
        Ok(self.snapshot(name))
    }

    async fn create(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError> {
        let created = lock(&self.table).create(nrs)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError> {
        let mut table = lock(&self.table);
        let stored = table.current(nrs)?;
        let mut next = nrs.clone();
        next.status = stored.status.clone();
        table.stamp(&mut next);
        table.objects.insert(next.name_any(), next.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    async fn update_status(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError> {
        let mut table = lock(&self.table);
        let stored = table.current(nrs)?;
        let mut next = stored.clone();
        next.status = nrs.status.clone();
        table.stamp(&mut next);
        table.objects.insert(next.name_any(), next.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }
}

/// In-memory nodes without pending pods
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    patches: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl MemoryNodeStore {
    pub fn insert(&self, node: Node) {
        lock(&self.nodes).insert(node.name_any(), node);
    }

    /// Capacity patches received so far
    pub fn capacity_patches(&self) -> Vec<(String, BTreeMap<String, String>)> {
        lock(&self.patches).clone()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ControllerError> {
        Ok(lock(&self.nodes).get(name).cloned())
    }

    async fn patch_capacity(&self, name: &str, capacity: &BTreeMap<String, String>) -> Result<(), ControllerError> {
        let mut nodes = lock(&self.nodes);
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| ControllerError::NotFound(name.to_string()))?;
        let current = node
            .status
            .get_or_insert_with(NodeStatus::default)
            .capacity
            .get_or_insert_with(BTreeMap::new);
        for (key, value) in capacity {
            current.insert(key.clone(), Quantity(value.clone()));
        }
        lock(&self.patches).push((name.to_string(), capacity.clone()));
        Ok(())
    }

    async fn pending_pod_count(&self, _name: &str) -> Result<usize, ControllerError> {
        Ok(0)
    }
}

/// Event captured by [`RecordingEventRecorder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RecordingEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEventRecorder {
    async fn record(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            object: object.name.clone().unwrap_or_default(),
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Manager handle with a settable readiness flag
#[derive(Debug)]
pub struct TestManagerHandle {
    pub ready: AtomicBool,
    pub resyncs: AtomicUsize,
    pub pending: AtomicUsize,
}

impl TestManagerHandle {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            resyncs: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NodeManagerHandle for TestManagerHandle {
    fn instances_api_is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn trigger_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
    }

    async fn pending_pod_count(&self, _node_name: &str) -> Result<usize, ControllerError> {
        Ok(self.pending.load(Ordering::SeqCst))
    }
}

/// Scripted instance family for engine tests.
///
/// Allocations add addresses to the inventory and releases remove them, so
/// a recalculation after a maintenance pass sees the outcome.
#[derive(Debug, Default)]
pub struct FakeOperations {
    pub state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub inventory: InterfaceInventory,
    pub allocation: AllocationAction,
    pub max_allocatable: i64,
    pub min_allocatable: i64,
    pub burstable: i64,
    pub fail_allocation: bool,
    pub fail_release: bool,
    pub allocations: Vec<AllocationAction>,
    pub releases: Vec<ReleaseAction>,
    pub interfaces_created: i64,
    next_ip: u32,
}

impl FakeOperations {
    /// Node with `available` addresses on `eni-1` and room for `max` in total
    pub fn with_pool(available: usize, max: i64) -> Arc<Self> {
        let fake = Self::default();
        {
            let mut state = lock(&fake.state);
            for _ in 0..available {
                state.add_ip("eni-1");
            }
            state.max_allocatable = max;
            state.allocation = AllocationAction {
                interface_id: "eni-1".to_string(),
                pool_id: "sbn-test".to_string(),
                available_for_allocation_ipv4: max,
                available_interfaces: 1,
                ..Default::default()
            };
        }
        Arc::new(fake)
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }
}

impl FakeState {
    fn add_ip(&mut self, eni_id: &str) -> String {
        self.next_ip += 1;
        let ip = format!("10.1.{}.{}", self.next_ip / 250, self.next_ip % 250);
        self.inventory
            .available
            .insert(ip.clone(), AllocationIp::on_interface(eni_id));
        ip
    }
}

#[async_trait]
impl NetResourceOperations for FakeOperations {
    fn updated_node(&self, _nrs: &NetResourceSet) {}

    fn populate_status_fields(&self, _nrs: &mut NetResourceSet) {}

    async fn resync_interfaces_and_ips(&self) -> Result<InterfaceInventory, ControllerError> {
        Ok(self.lock().inventory.clone())
    }

    async fn prepare_ip_allocation(&self) -> Result<AllocationAction, ControllerError> {
        Ok(self.lock().allocation.clone())
    }

    async fn allocate_ips(&self, action: &AllocationAction) -> Result<(), ControllerError> {
        let mut state = self.lock();
        state.allocations.push(action.clone());
        if state.fail_allocation {
            return Err(ControllerError::AllocationFailed("scripted failure".to_string()));
        }
        for _ in 0..action.available_for_allocation_ipv4 {
            state.add_ip(&action.interface_id);
        }
        Ok(())
    }

    fn prepare_ip_release(&self, excess: i64) -> ReleaseAction {
        let state = self.lock();
        ReleaseAction {
            interface_id: "eni-1".to_string(),
            pool_id: "sbn-test".to_string(),
            ips_to_release: state
                .inventory
                .available
                .keys()
                .take(usize::try_from(excess).unwrap_or_default())
                .cloned()
                .collect(),
        }
    }

    async fn release_ips(&self, action: &ReleaseAction) -> Result<(), ControllerError> {
        let mut state = self.lock();
        state.releases.push(action.clone());
        if state.fail_release {
            return Err(ControllerError::AllocationFailed("scripted release failure".to_string()));
        }
        for ip in &action.ips_to_release {
            state.inventory.available.remove(ip);
        }
        Ok(())
    }

    async fn create_interface(&self, _action: &AllocationAction) -> Result<i64, InterfaceCreationError> {
        self.lock().interfaces_created += 1;
        Ok(1)
    }

    fn maximum_allocatable_ipv4(&self) -> i64 {
        self.lock().max_allocatable
    }

    fn minimum_allocatable_ipv4(&self) -> i64 {
        self.lock().min_allocatable
    }

    fn maximum_burstable_allocatable_ipv4(&self) -> i64 {
        self.lock().burstable
    }

    async fn allocate_ip_cross_subnet(&self, subnet_id: &str) -> Result<(Vec<PrivateIp>, String), ControllerError> {
        Ok((vec![PrivateIp::secondary("10.9.0.1", subnet_id)], "eni-1".to_string()))
    }

    async fn reuse_ips(&self, _ips: &[ReuseRequest], _owner: &str) -> Result<String, ControllerError> {
        Ok("eni-1".to_string())
    }
}

/// Configuration with the VPC the mock cloud uses
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        vpc_id: "vpc-test".to_string(),
        ..Default::default()
    }
}

/// Node with the given CPU and memory quantities and room for 110 pods
pub fn test_node(name: &str, cpu: &str, memory: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            capacity: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
                ("pods".to_string(), Quantity("110".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// NetResourceSet of a node in secondary-ip mode on subnet `sbn-test`
pub fn test_nrs(name: &str, instance_id: &str, instance_type: EniType) -> NetResourceSet {
    let mut nrs = NetResourceSet::new(
        name,
        NetResourceSetSpec {
            instance_id: instance_id.to_string(),
            ipam: IpamSpec {
                pre_allocate: 2,
                ..Default::default()
            },
            eni: Some(NodeEniSpec {
                instance_type,
                use_mode: EniUseMode::SecondaryIp,
                subnet_ids: vec!["sbn-test".to_string()],
                burstable_mehrfach_eni: 0,
                route_table_offset: 127,
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    nrs.metadata.uid = Some(format!("uid-{name}"));
    nrs
}

/// ENI object of `node` with a primary address and `secondary` more
pub fn test_eni(id: &str, node: &str, subnet_id: &str, status: VpcEniStatus, secondary: usize) -> ENI {
    let mut private_ip_set = vec![PrivateIp {
        private_ip_address: format!("192.168.{}.2", id.len()),
        subnet_id: subnet_id.to_string(),
        primary: true,
        ..Default::default()
    }];
    private_ip_set.extend((0..secondary).map(|i| PrivateIp::secondary(format!("10.2.{}.{}", id.len(), i + 10), subnet_id)));

    let mut eni = ENI::new(
        id,
        EniSpec {
            node_name: node.to_string(),
            eni_type: EniType::Bcc,
            borrow_ip_count: 8,
            eni: crds::EniInfo {
                id: id.to_string(),
                instance_id: format!("i-{node}"),
                vpc_id: "vpc-test".to_string(),
                subnet_id: subnet_id.to_string(),
                private_ip_set,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    eni.metadata.labels = Some(BTreeMap::from([(LABEL_NODE_NAME.to_string(), node.to_string())]));
    if status != VpcEniStatus::None {
        let mut eni_status = EniStatus::default();
        eni_status.append_vpc_status(status);
        eni.status = Some(eni_status);
    }
    eni
}

/// Instance with a primary interface on `sbn-test`
pub fn test_instance(instance_id: &str, eni_quota: i64) -> InstanceDetail {
    InstanceDetail {
        instance_id: instance_id.to_string(),
        name: instance_id.to_string(),
        cpu_count: 8,
        memory_capacity_in_gb: 16,
        eni_quota,
        zone_name: "zoneA".to_string(),
        nic_info: NicInfo {
            eni_id: format!("eni-primary-{instance_id}"),
            name: "eth0".to_string(),
            vpc_id: "vpc-test".to_string(),
            subnet_id: "sbn-test".to_string(),
            mac_address: "fa:16:3e:00:00:99".to_string(),
            security_groups: vec!["sg-default".to_string()],
            ips: vec![NicIp {
                private_ip: "192.168.0.10".to_string(),
                primary: true,
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn test_subnet(id: &str, available: i64) -> Subnet {
    Subnet {
        subnet_id: id.to_string(),
        name: format!("{id}-name"),
        zone_name: "zoneA".to_string(),
        cidr: "10.0.0.0/16".to_string(),
        vpc_id: "vpc-test".to_string(),
        available_ip: available,
        ..Default::default()
    }
}

/// Adapter dependencies backed by the mock cloud and in-memory stores
#[derive(Debug)]
pub struct TestEnv {
    pub cloud: MockCloudClient,
    pub enis: Arc<MemoryEniStore>,
    pub nodes: Arc<MemoryNodeStore>,
    pub subnets: Arc<SubnetBorrowTracker>,
    pub config: Arc<ControllerConfig>,
}

impl TestEnv {
    pub fn new(config: ControllerConfig) -> Self {
        let cloud = MockCloudClient::new("mock");
        Self {
            subnets: Arc::new(SubnetBorrowTracker::new(Arc::new(cloud.clone()))),
            cloud,
            enis: Arc::new(MemoryEniStore::default()),
            nodes: Arc::new(MemoryNodeStore::default()),
            config: Arc::new(config),
        }
    }

    pub fn context(&self) -> AdapterContext {
        AdapterContext {
            config: Arc::clone(&self.config),
            cloud: Arc::new(self.cloud.clone()),
            enis: Arc::clone(&self.enis) as Arc<dyn EniStore>,
            nodes: Arc::clone(&self.nodes) as Arc<dyn NodeStore>,
            subnets: Arc::clone(&self.subnets),
        }
    }
}
