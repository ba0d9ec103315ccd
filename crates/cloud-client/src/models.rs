//! Cloud API models
//!
//! Request and response shapes of the VPC, ENI and instance APIs. Field names
//! follow the API's camelCase JSON.

use serde::{Deserialize, Serialize};

/// Elastic network interface as reported by the VPC API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eni {
    pub eni_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zone_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub vpc_id: String,
    #[serde(default)]
    pub subnet_id: String,
    /// Lifecycle status (`available`, `attaching`, `inuse`, `detaching`)
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub private_ip_set: Vec<CloudPrivateIp>,
    #[serde(default)]
    pub ipv6_private_ip_set: Vec<CloudPrivateIp>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub enterprise_security_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
}

/// Private address of an interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudPrivateIp {
    pub private_ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<String>,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub primary: bool,
}

/// Filter for listing interfaces
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEnisArgs {
    pub vpc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Parameters for creating an interface
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEniArgs {
    pub name: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enterprise_security_group_ids: Vec<String>,
    pub private_ip_set: Vec<CloudPrivateIp>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ipv6_private_ip_set: Vec<CloudPrivateIp>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Instance detail of a virtual machine or elastic bare metal host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDetail {
    pub instance_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub cpu_count: i64,
    #[serde(default)]
    pub memory_capacity_in_gb: i64,
    /// Number of extra interfaces the instance may attach; 0 restricts the
    /// instance to its primary interface
    #[serde(default)]
    pub eni_quota: i64,
    #[serde(default)]
    pub zone_name: String,
    #[serde(default)]
    pub nic_info: NicInfo,
}

/// Built-in primary interface of an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicInfo {
    #[serde(default)]
    pub eni_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vpc_id: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub enterprise_security_groups: Vec<String>,
    #[serde(default)]
    pub ips: Vec<NicIp>,
    #[serde(default)]
    pub ipv6s: Vec<NicIp>,
}

/// Address of the built-in interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicIp {
    pub private_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip: Option<String>,
    #[serde(default)]
    pub primary: bool,
}

/// Secondary addresses for the built-in interface of an instance
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BccBatchAddIpArgs {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub private_ips: Vec<String>,
    pub secondary_private_ip_address_count: usize,
    /// Also allocate one IPv6 address per IPv4 address
    pub allocate_multi_ipv6_addr: bool,
}

/// VPC subnet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub subnet_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zone_name: String,
    #[serde(default)]
    pub cidr: String,
    #[serde(default)]
    pub ipv6_cidr: String,
    #[serde(default)]
    pub vpc_id: String,
    /// Free addresses remaining in the subnet
    #[serde(default, rename = "availableIp")]
    pub available_ip: i64,
}

/// Enterprise security group bound to an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterpriseSecurityGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Rule of a VPC route table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub route_rule_id: String,
    #[serde(default)]
    pub route_table_id: String,
    #[serde(default)]
    pub source_address: String,
    #[serde(default)]
    pub destination_address: String,
    #[serde(default)]
    pub next_hop_id: String,
    /// `custom`, `vpn`, `nat`, ...
    #[serde(default)]
    pub next_hop_type: String,
    #[serde(default)]
    pub description: String,
}

/// Regular (non enterprise) security group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vpc_id: String,
    #[serde(default)]
    pub description: String,
}

/// RDMA interface of an HPC instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HpcEni {
    pub eni_id: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub private_ip_set: Vec<CloudPrivateIp>,
}
