//! Instance family adapters.
//!
//! Each node's [`NetResource`](crate::ipam::net_resource::NetResource) reaches
//! the cloud through one [`NetResourceOperations`] implementation chosen from
//! the node's instance type. Virtual machines use [`StandardNode`], which
//! attaches secondary interfaces. Elastic bare metal hosts use
//! [`PrimaryEniNode`], which falls back to secondary addresses on the built-in
//! interface when the host has no interface quota.

pub mod primary_eni;
pub mod standard;


use std::sync::Arc;

use cloud_client::CloudClientTrait;
use crds::{EniType, NetResourceSet};
use kube::ResourceExt;

use crate::config::ControllerConfig;
use crate::ipam::ops::NetResourceOperations;
use crate::ipam::subnet::SubnetBorrowTracker;
use crate::store::{EniStore, NodeStore};

pub use primary_eni::PrimaryEniNode;
pub use standard::{EniQuota, StandardNode};

/// Shared dependencies of every adapter
#[derive(Clone)]
pub struct AdapterContext {
    pub config: Arc<ControllerConfig>,
    pub cloud: Arc<dyn CloudClientTrait>,
    pub enis: Arc<dyn EniStore>,
    pub nodes: Arc<dyn NodeStore>,
    pub subnets: Arc<SubnetBorrowTracker>,
}

impl std::fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterContext")
            .field("vpc_id", &self.config.vpc_id)
            .field("cloud", &self.cloud.endpoint())
            .finish_non_exhaustive()
    }
}

/// Adapter for the instance family of `resource`
pub fn new_operations(resource: &NetResourceSet, ctx: AdapterContext) -> Arc<dyn NetResourceOperations> {
    let standard = StandardNode::new(resource.name_any(), resource, ctx);
    match resource.eni_spec().instance_type {
        EniType::Ebc => Arc::new(PrimaryEniNode::new(standard)),
        _ => Arc::new(standard),
    }
}
