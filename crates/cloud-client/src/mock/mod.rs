//! Mock cloud client for unit testing
//!
//! Stores interfaces, instances and subnets in memory so controllers can be
//! tested without a cloud account. Failures can be injected per operation
//! and every call is recorded for assertions.
//!
//! The mock is organized into domain-specific modules:
//! - `eni.rs` - interface and private IP operations
//! - `instance.rs` - instance, subnet and enterprise security group operations
//! - `vpc.rs` - route table, security group and EIP operations
//! - `hpc.rs` - RDMA interface operations of HPC instances

mod eni;
mod hpc;
mod instance;
mod vpc;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::models::*;

/// Failure to return from the next call of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// `NoSuchObject`
    NotFound,
    /// `EniNotFound`
    EniNotFound,
    /// Cloud side throttling
    Throttled,
    /// Any other API error
    Api(String),
}

impl InjectedFailure {
    fn into_error(self, operation: &str, target: &str) -> CloudError {
        let message = format!("{operation} {target}");
        match self {
            Self::NotFound => CloudError::NotFound(message),
            Self::EniNotFound => CloudError::EniNotFound(message),
            Self::Throttled => CloudError::Throttled(message),
            Self::Api(code) => CloudError::Api {
                status: 500,
                code,
                message,
            },
        }
    }
}

/// A call received by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Operation name, as used by the rate limiter
    pub operation: String,
    /// Interface, instance or subnet the call targeted
    pub target: String,
    /// Addresses passed explicitly
    pub ips: Vec<String>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock cloud client for testing
#[derive(Debug, Clone)]
pub struct MockCloudClient {
    pub(crate) endpoint: String,
    pub(crate) enis: Arc<Mutex<HashMap<String, Eni>>>,
    pub(crate) instances: Arc<Mutex<HashMap<String, InstanceDetail>>>,
    pub(crate) subnets: Arc<Mutex<HashMap<String, Subnet>>>,
    pub(crate) esgs: Arc<Mutex<HashMap<String, Vec<EnterpriseSecurityGroup>>>>,
    pub(crate) route_rules: Arc<Mutex<HashMap<String, Vec<RouteRule>>>>,
    pub(crate) security_groups: Arc<Mutex<HashMap<String, Vec<SecurityGroup>>>>,
    pub(crate) direct_eips: Arc<Mutex<HashSet<String>>>,
    pub(crate) hpc_enis: Arc<Mutex<HashMap<String, Vec<HpcEni>>>>,
    pub(crate) failures: Arc<Mutex<HashMap<String, VecDeque<InjectedFailure>>>>,
    pub(crate) calls: Arc<Mutex<Vec<MockCall>>>,
    pub(crate) latency: Arc<Mutex<Duration>>,
    pub(crate) attach_status: Arc<Mutex<String>>,
    // Counter for generating IDs and addresses
    pub(crate) next_id: Arc<Mutex<u64>>,
}

impl MockCloudClient {
    /// Create a new mock client
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            enis: Arc::new(Mutex::new(HashMap::new())),
            instances: Arc::new(Mutex::new(HashMap::new())),
            subnets: Arc::new(Mutex::new(HashMap::new())),
            esgs: Arc::new(Mutex::new(HashMap::new())),
            route_rules: Arc::new(Mutex::new(HashMap::new())),
            security_groups: Arc::new(Mutex::new(HashMap::new())),
            direct_eips: Arc::new(Mutex::new(HashSet::new())),
            hpc_enis: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            attach_status: Arc::new(Mutex::new("inuse".to_string())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Interface fixture with one primary IPv4 address
    pub fn eni(eni_id: &str, subnet_id: &str, status: &str) -> Eni {
        Eni {
            eni_id: eni_id.to_string(),
            name: eni_id.to_string(),
            subnet_id: subnet_id.to_string(),
            vpc_id: "vpc-test".to_string(),
            zone_name: "zoneA".to_string(),
            status: status.to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            private_ip_set: vec![CloudPrivateIp {
                private_ip_address: format!("192.168.{}.2", eni_id.len()),
                subnet_id: subnet_id.to_string(),
                primary: true,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Add or replace an interface
    pub fn add_eni(&self, eni: Eni) {
        lock(&self.enis).insert(eni.eni_id.clone(), eni);
    }

    /// Snapshot of an interface
    pub fn get_eni(&self, eni_id: &str) -> Option<Eni> {
        lock(&self.enis).get(eni_id).cloned()
    }

    /// Change the lifecycle status of an interface
    pub fn set_eni_status(&self, eni_id: &str, status: &str) {
        if let Some(eni) = lock(&self.enis).get_mut(eni_id) {
            eni.status = status.to_string();
        }
    }

    /// Status an interface moves to when attached (default `inuse`)
    pub fn set_attach_status(&self, status: &str) {
        *lock(&self.attach_status) = status.to_string();
    }

    /// Add or replace an instance
    pub fn add_instance(&self, instance: InstanceDetail) {
        lock(&self.instances).insert(instance.instance_id.clone(), instance);
    }

    /// Snapshot of an instance
    pub fn get_instance(&self, instance_id: &str) -> Option<InstanceDetail> {
        lock(&self.instances).get(instance_id).cloned()
    }

    /// Add or replace a subnet
    pub fn add_subnet(&self, subnet: Subnet) {
        lock(&self.subnets).insert(subnet.subnet_id.clone(), subnet);
    }

    /// Enterprise security groups returned for an instance
    pub fn set_enterprise_security_groups(&self, instance_id: &str, groups: Vec<EnterpriseSecurityGroup>) {
        lock(&self.esgs).insert(instance_id.to_string(), groups);
    }

    /// Append a rule to the route table of a VPC
    pub fn add_route_rule(&self, vpc_id: &str, rule: RouteRule) {
        lock(&self.route_rules).entry(vpc_id.to_string()).or_default().push(rule);
    }

    /// Security groups returned for an instance
    pub fn set_security_groups(&self, instance_id: &str, groups: Vec<SecurityGroup>) {
        lock(&self.security_groups).insert(instance_id.to_string(), groups);
    }

    /// Whether an EIP is in direct mode
    pub fn is_eip_direct(&self, eip: &str) -> bool {
        lock(&self.direct_eips).contains(eip)
    }

    /// RDMA interfaces of an HPC instance
    pub fn set_hpc_enis(&self, instance_id: &str, enis: Vec<HpcEni>) {
        lock(&self.hpc_enis).insert(instance_id.to_string(), enis);
    }

    /// Snapshot of the RDMA interfaces of an HPC instance
    pub fn hpc_enis(&self, instance_id: &str) -> Vec<HpcEni> {
        lock(&self.hpc_enis).get(instance_id).cloned().unwrap_or_default()
    }

    /// Make the next call of `operation` fail
    pub fn fail_next(&self, operation: &str, failure: InjectedFailure) {
        lock(&self.failures)
            .entry(operation.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Calls of one operation received so far
    pub fn calls_of(&self, operation: &str) -> Vec<MockCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    pub(crate) fn next_id(&self) -> u64 {
        let mut id = lock(&self.next_id);
        let current = *id;
        *id += 1;
        current
    }

    pub(crate) fn next_ipv4(&self) -> String {
        let n = self.next_id();
        format!("10.0.{}.{}", n / 250, n % 250 + 1)
    }

    pub(crate) fn next_ipv6(&self) -> String {
        format!("fd00::{:x}", self.next_id())
    }

    /// Record the call, apply latency and return any injected failure
    pub(crate) async fn enter(&self, operation: &str, target: &str, ips: &[String]) -> Result<(), CloudError> {
        lock(&self.calls).push(MockCall {
            operation: operation.to_string(),
            target: target.to_string(),
            ips: ips.to_vec(),
        });

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failure = lock(&self.failures)
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(failure) => Err(failure.into_error(operation, target)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl CloudClientTrait for MockCloudClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_enis(&self, args: &ListEnisArgs) -> Result<Vec<Eni>, CloudError> {
        eni::list_enis(self, args).await
    }

    async fn stat_eni(&self, eni_id: &str) -> Result<Eni, CloudError> {
        eni::stat_eni(self, eni_id).await
    }

    async fn create_eni(&self, args: &CreateEniArgs) -> Result<String, CloudError> {
        eni::create_eni(self, args).await
    }

    async fn delete_eni(&self, eni_id: &str) -> Result<(), CloudError> {
        eni::delete_eni(self, eni_id).await
    }

    async fn attach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
        eni::attach_eni(self, instance_id, eni_id).await
    }

    async fn detach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
        eni::detach_eni(self, instance_id, eni_id).await
    }

    async fn batch_add_private_ip(
        &self,
        private_ips: &[String],
        count: usize,
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<Vec<String>, CloudError> {
        eni::batch_add_private_ip(self, private_ips, count, eni_id, None, is_ipv6).await
    }

    async fn batch_delete_private_ip(
        &self,
        private_ips: &[String],
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<(), CloudError> {
        eni::batch_delete_private_ip(self, private_ips, eni_id, is_ipv6).await
    }

    async fn batch_add_private_ip_cross_subnet(
        &self,
        eni_id: &str,
        subnet_id: &str,
        private_ips: &[String],
        count: usize,
        is_ipv6: bool,
    ) -> Result<Vec<String>, CloudError> {
        eni::batch_add_private_ip(self, private_ips, count, eni_id, Some(subnet_id), is_ipv6).await
    }

    async fn get_bcc_instance_detail(&self, instance_id: &str) -> Result<InstanceDetail, CloudError> {
        instance::get_bcc_instance_detail(self, instance_id).await
    }

    async fn bcc_batch_add_ip(&self, args: &BccBatchAddIpArgs) -> Result<Vec<String>, CloudError> {
        instance::bcc_batch_add_ip(self, args).await
    }

    async fn bcc_batch_del_ip(&self, instance_id: &str, private_ips: &[String]) -> Result<(), CloudError> {
        instance::bcc_batch_del_ip(self, instance_id, private_ips).await
    }

    async fn list_enterprise_security_groups(
        &self,
        instance_id: &str,
    ) -> Result<Vec<EnterpriseSecurityGroup>, CloudError> {
        instance::list_enterprise_security_groups(self, instance_id).await
    }

    async fn describe_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        instance::describe_subnet(self, subnet_id).await
    }

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>, CloudError> {
        instance::list_subnets(self, vpc_id).await
    }

    async fn list_route_table(&self, vpc_id: &str, route_table_id: &str) -> Result<Vec<RouteRule>, CloudError> {
        vpc::list_route_table(self, vpc_id, route_table_id).await
    }

    async fn list_security_groups(&self, vpc_id: &str, instance_id: &str) -> Result<Vec<SecurityGroup>, CloudError> {
        vpc::list_security_groups(self, vpc_id, instance_id).await
    }

    async fn bind_eni_public_ip(&self, private_ip: &str, public_ip: &str, eni_id: &str) -> Result<(), CloudError> {
        vpc::bind_eni_public_ip(self, private_ip, public_ip, eni_id).await
    }

    async fn unbind_eni_public_ip(&self, public_ip: &str, eni_id: &str) -> Result<(), CloudError> {
        vpc::unbind_eni_public_ip(self, public_ip, eni_id).await
    }

    async fn direct_eip(&self, eip: &str) -> Result<(), CloudError> {
        vpc::direct_eip(self, eip).await
    }

    async fn undirect_eip(&self, eip: &str) -> Result<(), CloudError> {
        vpc::undirect_eip(self, eip).await
    }

    async fn get_hpc_eni_id(&self, instance_id: &str) -> Result<Vec<HpcEni>, CloudError> {
        hpc::get_hpc_eni_id(self, instance_id).await
    }

    async fn batch_add_hpc_eni_private_ip(
        &self,
        eni_id: &str,
        private_ips: &[String],
        count: usize,
    ) -> Result<Vec<String>, CloudError> {
        hpc::batch_add_hpc_eni_private_ip(self, eni_id, private_ips, count).await
    }

    async fn batch_delete_hpc_eni_private_ip(&self, eni_id: &str, private_ips: &[String]) -> Result<(), CloudError> {
        hpc::batch_delete_hpc_eni_private_ip(self, eni_id, private_ips).await
    }
}
