//! NetResourceSet CRD
//!
//! Per-node desired and observed network resource state. The node discovery
//! publisher owns the spec; the IPAM engine owns `spec.ipam.pool` and the
//! whole status block.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::eni::{CceEniStatus, EniType, EniUseMode, VpcEniStatus};

/// Map of IP address to the allocation that holds it.
pub type AllocationMap = BTreeMap<String, AllocationIp>;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "cce.baidubce.com",
    version = "v2",
    kind = "NetResourceSet",
    plural = "netresourcesets",
    shortname = "nrs",
    status = "NetResourceSetStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct NetResourceSetSpec {
    /// Cloud instance backing this node
    #[serde(rename = "instanceID", default)]
    pub instance_id: String,

    /// Addresses reported by the Kubernetes node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,

    /// IPAM thresholds and the allocatable pool
    #[serde(default)]
    pub ipam: IpamSpec,

    /// ENI allocation settings, generated once by node discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eni: Option<NodeEniSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    /// Address type as reported by the node (InternalIP, Hostname, ...)
    #[serde(rename = "type")]
    pub address_type: String,

    /// Address value
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpamSpec {
    /// Addresses available for pod allocation on this node
    #[serde(default)]
    pub pool: AllocationMap,

    /// Minimum number of addresses that must be allocated on this node
    #[serde(default)]
    pub min_allocate: i64,

    /// Upper bound on addresses allocated to this node (0 means no bound)
    #[serde(default)]
    pub max_allocate: i64,

    /// Number of spare addresses to keep ready
    #[serde(default)]
    pub pre_allocate: i64,

    /// Spare addresses tolerated above the watermark before releasing
    #[serde(default)]
    pub max_above_watermark: i64,

    /// Pod CIDRs used by range allocation mode
    #[serde(rename = "podCIDRs", default, skip_serializing_if = "Vec::is_empty")]
    pub pod_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationIp {
    /// Pod or consumer holding the address ("namespace/name")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Interface ID that the address lives on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl AllocationIp {
    /// Allocation held by the given interface
    pub fn on_interface(eni_id: impl Into<String>) -> Self {
        Self {
            owner: None,
            resource: Some(eni_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeEniSpec {
    /// Instance family of the node
    #[serde(default)]
    pub instance_type: EniType,

    /// How pod addresses are placed on interfaces
    #[serde(default)]
    pub use_mode: EniUseMode,

    /// Subnets new interfaces may be created in
    #[serde(rename = "subnetIDs", default)]
    pub subnet_ids: Vec<String>,

    /// Security groups attached to new interfaces
    #[serde(default)]
    pub security_groups: Vec<String>,

    /// Enterprise security groups attached to new interfaces
    #[serde(default)]
    pub enterprise_security_group_list: Vec<String>,

    /// Number of interfaces whose full IP capacity is allocated at once (0 disables bursting)
    #[serde(default)]
    pub burstable_mehrfach_eni: i64,

    /// Number of interfaces to create ahead of demand
    #[serde(default, rename = "preAllocateENI")]
    pub pre_allocate_eni: i64,

    /// Offset of the per-interface route table
    #[serde(default)]
    pub route_table_offset: i32,

    /// Whether source based routing is installed for secondary interfaces
    #[serde(default)]
    pub install_source_based_routing: bool,

    /// Availability zone of the instance
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,

    /// VPC of the instance
    #[serde(rename = "vpcID", default, skip_serializing_if = "String::is_empty")]
    pub vpc_id: String,

    /// Whether the primary address of an interface may be handed to pods
    #[serde(default)]
    pub use_primary_address: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetResourceSetStatus {
    /// Address usage and release handshake
    #[serde(default)]
    pub ipam: IpamStatus,

    /// Interfaces of this node keyed by interface ID
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enis: BTreeMap<String, SimpleEniStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpamStatus {
    /// Addresses currently handed out to pods
    #[serde(default)]
    pub used: AllocationMap,

    /// Release handshake state per address
    #[serde(rename = "releaseIPs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub release_ips: BTreeMap<String, IpReleaseStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimpleEniStatus {
    /// Subnet of the interface
    #[serde(rename = "subnetID", default)]
    pub subnet_id: String,

    /// Cloud-side lifecycle status
    #[serde(default)]
    pub vpc_status: VpcEniStatus,

    /// Node-side status
    #[serde(default)]
    pub cce_status: CceEniStatus,
}

/// IP release handshake state.
///
/// The operator writes `marked-for-release` and `released`; the node agent
/// answers with `ready-for-release` or `do-not-release`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum IpReleaseStatus {
    /// Operator wants to release the address
    MarkedForRelease,
    /// Agent confirmed the address is unused
    ReadyForRelease,
    /// Agent refused, the address is in use
    DoNotRelease,
    /// Address has been released on the cloud side
    Released,
}

impl IpReleaseStatus {
    /// Wire value of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarkedForRelease => "marked-for-release",
            Self::ReadyForRelease => "ready-for-release",
            Self::DoNotRelease => "do-not-release",
            Self::Released => "released",
        }
    }
}

impl std::fmt::Display for IpReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NetResourceSet {
    /// ENI settings of the node, or defaults when discovery has not run yet
    pub fn eni_spec(&self) -> NodeEniSpec {
        self.spec.eni.clone().unwrap_or_default()
    }

    /// Whether the node places pod addresses on the primary interface only
    pub fn uses_primary_ip_mode(&self) -> bool {
        self.spec
            .eni
            .as_ref()
            .is_some_and(|eni| eni.use_mode == EniUseMode::PrimaryIp)
    }
}
