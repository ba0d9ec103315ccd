//! Capability set every instance family implements.

use async_trait::async_trait;
use crds::{AllocationMap, NetResourceSet, PrivateIp};
use thiserror::Error;

use crate::error::ControllerError;
use crate::ipam::action::{AllocationAction, ReleaseAction};

/// Allocation attempt conditions recorded when interface creation fails
pub mod condition {
    pub const NO_MATCHING_SUBNET: &str = "no matching subnet";
    pub const UNABLE_TO_GET_SECURITY_GROUPS: &str = "unable to get security groups";
    pub const UNABLE_TO_CREATE_ENI: &str = "unable to create ENI";
    pub const UNABLE_TO_RECORD_ENI: &str = "unable to record ENI";
    pub const UNABLE_TO_GET_INSTANCE: &str = "unable to get instance";
}

/// Interface creation failure with the condition it is counted under
#[derive(Debug, Error)]
#[error("{condition}: {source}")]
pub struct InterfaceCreationError {
    pub condition: &'static str,
    #[source]
    pub source: ControllerError,
}

impl InterfaceCreationError {
    pub fn new(condition: &'static str, source: ControllerError) -> Self {
        Self { condition, source }
    }
}

/// Result of listing the node's interfaces and addresses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceInventory {
    /// Addresses usable for pods, keyed by address
    pub available: AllocationMap,
    /// Interfaces that can still be created
    pub remaining_interfaces: i64,
}

/// Address requested on a specific interface when migrating between nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReuseRequest {
    pub ip: String,
    pub subnet_id: String,
}

/// Operations the NetResource engine calls on the node's instance family.
///
/// Implementations keep their own per-node caches; the engine never holds
/// its lock across any of these calls.
#[async_trait]
pub trait NetResourceOperations: Send + Sync {
    /// A new copy of the node's NetResourceSet was received
    fn updated_node(&self, nrs: &NetResourceSet);

    /// Write family specific status (interface map) into `nrs`
    fn populate_status_fields(&self, nrs: &mut NetResourceSet);

    /// Refresh interface state from the cloud and list usable addresses
    async fn resync_interfaces_and_ips(&self) -> Result<InterfaceInventory, ControllerError>;

    /// Pick the interface new addresses go on
    async fn prepare_ip_allocation(&self) -> Result<AllocationAction, ControllerError>;

    /// Allocate the addresses counted in `action`
    async fn allocate_ips(&self, action: &AllocationAction) -> Result<(), ControllerError>;

    /// Pick up to `excess` addresses to release
    fn prepare_ip_release(&self, excess: i64) -> ReleaseAction;

    /// Release the addresses listed in `action`
    async fn release_ips(&self, action: &ReleaseAction) -> Result<(), ControllerError>;

    /// Create a new interface, returning how many interfaces were created
    async fn create_interface(&self, action: &AllocationAction) -> Result<i64, InterfaceCreationError>;

    /// Largest number of IPv4 addresses the instance can hold
    fn maximum_allocatable_ipv4(&self) -> i64;

    /// Smallest pool worth keeping on the instance
    fn minimum_allocatable_ipv4(&self) -> i64;

    /// Addresses of one full interface in burstable mode, 0 otherwise
    fn maximum_burstable_allocatable_ipv4(&self) -> i64;

    /// Borrow one address from another subnet, returning it and the interface it went on
    async fn allocate_ip_cross_subnet(
        &self,
        subnet_id: &str,
    ) -> Result<(Vec<PrivateIp>, String), ControllerError>;

    /// Move addresses from whatever interface holds them onto this node, returning the interface used
    async fn reuse_ips(&self, ips: &[ReuseRequest], owner: &str) -> Result<String, ControllerError>;
}
