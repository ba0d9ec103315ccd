//! ENI CRD
//!
//! One object per cloud elastic network interface. The spec mirrors the
//! cloud-side interface; the status tracks the lifecycle observed in the VPC.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels::ANNOTATION_IPV6_PRIMARY_IP;

/// Maximum number of entries kept in `status.vpcStatusChangeLog`
pub const MAX_VPC_STATUS_CHANGE_LOG: usize = 10;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "cce.baidubce.com",
    version = "v2",
    kind = "ENI",
    plural = "enis",
    shortname = "eni",
    status = "EniStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EniSpec {
    /// Kubernetes node the interface belongs to
    #[serde(default)]
    pub node_name: String,

    /// How pod addresses are placed on this interface
    #[serde(default)]
    pub use_mode: EniUseMode,

    /// Interface family
    #[serde(rename = "type", default)]
    pub eni_type: EniType,

    /// Offset of the interface's route table
    #[serde(default)]
    pub route_table_offset: i32,

    /// Whether source based routing is installed for this interface
    #[serde(default)]
    pub install_source_based_routing: bool,

    /// Addresses the interface reserves in its subnet, including those already allocated
    #[serde(rename = "borrowIPCount", default)]
    pub borrow_ip_count: i64,

    /// Cloud-side attributes
    #[serde(default)]
    pub eni: EniInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EniInfo {
    /// Cloud interface ID
    #[serde(default)]
    pub id: String,

    /// Cloud interface name
    #[serde(default)]
    pub name: String,

    /// Availability zone
    #[serde(default)]
    pub zone_name: String,

    /// Instance the interface is (or will be) attached to
    #[serde(rename = "instanceID", default)]
    pub instance_id: String,

    /// VPC of the interface
    #[serde(rename = "vpcID", default)]
    pub vpc_id: String,

    /// Subnet of the interface
    #[serde(rename = "subnetID", default)]
    pub subnet_id: String,

    /// Hardware address
    #[serde(default)]
    pub mac_address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Security groups bound to the interface
    #[serde(default)]
    pub security_group_ids: Vec<String>,

    /// Enterprise security groups bound to the interface
    #[serde(default)]
    pub enterprise_security_group_ids: Vec<String>,

    /// IPv4 addresses, the primary one flagged
    #[serde(rename = "privateIPSet", default)]
    pub private_ip_set: Vec<PrivateIp>,

    /// IPv6 addresses, exactly one flagged primary when non-empty
    #[serde(rename = "ipv6PrivateIPSet", default)]
    pub ipv6_private_ip_set: Vec<PrivateIp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrivateIp {
    #[serde(rename = "privateIPAddress")]
    pub private_ip_address: String,

    #[serde(rename = "publicIPAddress", default, skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<String>,

    /// Subnet the address was taken from (differs from the interface subnet when borrowed)
    #[serde(rename = "subnetID", default, skip_serializing_if = "String::is_empty")]
    pub subnet_id: String,

    #[serde(default)]
    pub primary: bool,
}

impl PrivateIp {
    /// Secondary address on the given subnet
    pub fn secondary(address: impl Into<String>, subnet_id: impl Into<String>) -> Self {
        Self {
            private_ip_address: address.into(),
            public_ip_address: None,
            subnet_id: subnet_id.into(),
            primary: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EniStatus {
    /// Lifecycle status last observed in the VPC
    #[serde(default)]
    pub vpc_status: VpcEniStatus,

    /// Node-side status written by the agent
    #[serde(default)]
    pub cce_status: CceEniStatus,

    /// Most recent VPC status transitions, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpc_status_change_log: Vec<VpcStatusChange>,

    /// Interface index on the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_index: Option<i32>,
}

impl EniStatus {
    /// Record a new VPC status, keeping a bounded change log
    pub fn append_vpc_status(&mut self, status: VpcEniStatus) {
        self.vpc_status = status;
        self.vpc_status_change_log.push(VpcStatusChange {
            vpc_status: status,
            time: Utc::now(),
        });
        let overflow = self
            .vpc_status_change_log
            .len()
            .saturating_sub(MAX_VPC_STATUS_CHANGE_LOG);
        self.vpc_status_change_log.drain(..overflow);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpcStatusChange {
    pub vpc_status: VpcEniStatus,
    pub time: DateTime<Utc>,
}

/// Lifecycle status of an interface as reported by the VPC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum VpcEniStatus {
    /// Not observed yet
    #[default]
    None,
    /// Created, not attached
    Available,
    /// Attach in progress
    Attaching,
    /// Attached to the instance
    #[serde(alias = "in-use")]
    InUse,
    /// Detach in progress
    Detaching,
    /// Removed from the VPC, terminal
    Deleted,
}

impl VpcEniStatus {
    /// Wire value of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Available => "available",
            Self::Attaching => "attaching",
            Self::InUse => "inuse",
            Self::Detaching => "detaching",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for VpcEniStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VpcEniStatus {
    type Err = String;

    /// Parse the status string returned by the cloud API
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "attaching" => Ok(Self::Attaching),
            "inuse" | "in-use" => Ok(Self::InUse),
            "detaching" => Ok(Self::Detaching),
            "deleted" => Ok(Self::Deleted),
            "" | "none" => Ok(Self::None),
            other => Err(format!("unknown ENI status {other}")),
        }
    }
}

/// Node-side interface status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum CceEniStatus {
    #[default]
    Pending,
    ReadyOnNode,
    UsingInPodNetwork,
}

/// How pod addresses are placed on an interface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EniUseMode {
    /// Pods get secondary addresses of secondary interfaces
    #[default]
    SecondaryIp,
    /// Each pod gets the primary address of a dedicated interface
    PrimaryIp,
    /// Pods get secondary addresses of the instance's primary interface
    PrimaryWithSecondaryIp,
}

impl EniUseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecondaryIp => "secondary-ip",
            Self::PrimaryIp => "primary-ip",
            Self::PrimaryWithSecondaryIp => "primary-with-secondary-ip",
        }
    }
}

impl FromStr for EniUseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secondary-ip" | "Secondary" => Ok(Self::SecondaryIp),
            "primary-ip" | "Primary" => Ok(Self::PrimaryIp),
            "primary-with-secondary-ip" | "PrimaryWithSecondaryIP" => {
                Ok(Self::PrimaryWithSecondaryIp)
            }
            other => Err(format!("unknown ENI use mode {other}")),
        }
    }
}

/// Interface family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EniType {
    /// Standard virtual machine
    #[default]
    Bcc,
    /// Bare metal
    Bbc,
    /// Elastic bare metal, may only have its primary interface
    Ebc,
    /// HPC RDMA interface
    Hpc,
    /// Elastic RDMA interface
    Eri,
}

impl EniType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bcc => "bcc",
            Self::Bbc => "bbc",
            Self::Ebc => "ebc",
            Self::Hpc => "hpc",
            Self::Eri => "eri",
        }
    }

    /// RDMA interface types are not supported by the ENI stat API
    pub fn is_rdma(&self) -> bool {
        matches!(self, Self::Hpc | Self::Eri)
    }
}

impl ENI {
    /// Flag exactly one IPv6 address as primary.
    ///
    /// The address recorded in the election annotation wins if it is still
    /// present, then an address the cloud already flagged, then the first
    /// address. The annotation is updated to the elected address.
    pub fn elect_ipv6_primary_ip(&mut self) {
        let set = &mut self.spec.eni.ipv6_private_ip_set;
        if set.is_empty() {
            return;
        }

        let annotated = self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_IPV6_PRIMARY_IP))
            .cloned();

        let elected = annotated
            .and_then(|ip| set.iter().position(|p| p.private_ip_address == ip))
            .or_else(|| set.iter().position(|p| p.primary))
            .unwrap_or(0);

        for (index, ip) in set.iter_mut().enumerate() {
            ip.primary = index == elected;
        }

        let address = set[elected].private_ip_address.clone();
        self.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_IPV6_PRIMARY_IP.to_string(), address);
    }

    /// Interface ID, falling back to the object name
    pub fn eni_id(&self) -> &str {
        if self.spec.eni.id.is_empty() {
            self.metadata.name.as_deref().unwrap_or_default()
        } else {
            &self.spec.eni.id
        }
    }

    /// Current VPC status, `None` when no status was written yet
    pub fn vpc_status(&self) -> VpcEniStatus {
        self.status
            .as_ref()
            .map(|s| s.vpc_status)
            .unwrap_or_default()
    }
}
