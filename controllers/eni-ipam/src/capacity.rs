//! Interface and address limits per instance family.
//!
//! Limits are derived from the node's CPU and memory, overridden by the
//! operator's customer limits, and published as extended resources in the
//! node's `status.capacity` so the scheduler can account for pod addresses.

use std::collections::BTreeMap;
use std::sync::Arc;

use crds::{ANNOTATION_CROSS_VPC_MAX_ENI, EniType, LABEL_CROSS_VPC_MAX_ENI};
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::store::NodeStore;

/// Pod addresses schedulable on the node
pub const RESOURCE_IP: &str = "cce.baidubce.com/ip";
/// Interfaces schedulable on the node
pub const RESOURCE_ENI: &str = "cce.baidubce.com/eni";
/// RDMA addresses schedulable on the node
pub const RESOURCE_RDMA_IP: &str = "cce.baidubce.com/rdmaip";
/// Cross-VPC interfaces schedulable on the node
pub const RESOURCE_CROSS_VPC_ENI: &str = "cross-vpc-eni.cce.io/eni";

/// Interfaces of a bare metal host
const BBC_MAX_ENI: i64 = 1;
/// Addresses of the single bare metal interface
const BBC_MAX_IP_PER_ENI: i64 = 40;
/// Addresses of one HPC RDMA interface
const HPC_MAX_RDMA_IP: i64 = 13;
/// Pods a node accepts when it does not report a limit
pub const DEFAULT_MAX_PODS: i64 = 128;

/// Addresses an interface may hold for the given instance memory
pub fn max_ip_per_eni(memory_gb: i64) -> i64 {
    match memory_gb {
        m if m > 0 && m < 2 => 2,
        2..=8 => 8,
        9..=32 => 16,
        33..=64 => 30,
        m if m > 64 => 40,
        _ => 0,
    }
}

/// Interfaces an instance may attach for the given CPU count
pub fn max_eni_per_node(cpu: i64) -> i64 {
    match cpu {
        1..=7 => cpu,
        c if c >= 8 => 8,
        _ => 0,
    }
}

/// Limits of a node and the resources published from them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapacity {
    /// Interfaces the node may attach
    pub max_eni: i64,
    /// Addresses one interface may hold, primary included
    pub max_ip_per_eni: i64,
    /// Published interface resource
    pub customer_eni_resource: i64,
    /// Published address resource
    pub customer_ip_resource: i64,
}

impl NodeCapacity {
    /// Extended resources to publish into the node's capacity
    pub fn resources(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (RESOURCE_ENI.to_string(), self.customer_eni_resource.to_string()),
            (RESOURCE_IP.to_string(), self.customer_ip_resource.to_string()),
        ])
    }
}

/// RDMA limits of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeRdmaCapacity {
    /// Addresses one RDMA interface may hold
    pub max_rdma_ip_per_interface: i64,
    /// Published RDMA address resource
    pub customer_rdma_ip_resource: i64,
}

impl NodeRdmaCapacity {
    pub fn resources(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            RESOURCE_RDMA_IP.to_string(),
            self.customer_rdma_ip_resource.to_string(),
        )])
    }
}

fn or_override(computed: i64, customer: i64) -> i64 {
    if customer != 0 { customer } else { computed }
}

/// Limits of a virtual machine
pub fn bcc_capacity(cpu: i64, memory_gb: i64, config: &ControllerConfig) -> NodeCapacity {
    let max_eni = or_override(max_eni_per_node(cpu), config.customer_max_eni);
    let max_ip_per_eni = or_override(max_ip_per_eni(memory_gb), config.customer_max_ip);
    NodeCapacity {
        max_eni,
        max_ip_per_eni,
        customer_eni_resource: max_eni,
        customer_ip_resource: (max_ip_per_eni - 1) * max_eni,
    }
}

/// Limits of a bare metal host, which schedules pods on addresses only
pub fn bbc_capacity(config: &ControllerConfig) -> NodeCapacity {
    let max_eni = or_override(BBC_MAX_ENI, config.customer_max_eni);
    let max_ip_per_eni = or_override(BBC_MAX_IP_PER_ENI, config.customer_max_ip);
    NodeCapacity {
        max_eni,
        max_ip_per_eni,
        customer_eni_resource: 0,
        customer_ip_resource: max_ip_per_eni,
    }
}

/// Limits of the RDMA interfaces of a node
pub fn rdma_capacity(eni_type: EniType, memory_gb: i64, config: &ControllerConfig) -> NodeRdmaCapacity {
    if eni_type == EniType::Hpc {
        let max = or_override(HPC_MAX_RDMA_IP, config.customer_max_rdma_ip);
        return NodeRdmaCapacity {
            max_rdma_ip_per_interface: max,
            customer_rdma_ip_resource: max,
        };
    }
    let max = or_override(max_ip_per_eni(memory_gb), config.customer_max_ip);
    NodeRdmaCapacity {
        max_rdma_ip_per_interface: max,
        customer_rdma_ip_resource: max - 1,
    }
}

fn range_size(network: &IpNetwork) -> i64 {
    let host_bits = match network {
        IpNetwork::V4(n) => 32 - u32::from(n.prefix()),
        IpNetwork::V6(n) => 128 - u32::from(n.prefix()),
    };
    1u128
        .checked_shl(host_bits)
        .and_then(|size| i64::try_from(size).ok())
        .unwrap_or(i64::MAX)
}

/// Limits in range mode, where every node owns CIDRs of pod addresses.
///
/// The address limit is the larger of the summed IPv4 and IPv6 range sizes.
pub fn range_capacity(pod_cidrs: &[String], config: &ControllerConfig) -> Result<NodeCapacity, ControllerError> {
    let mut ipv4 = 0i64;
    let mut ipv6 = 0i64;
    for cidr in pod_cidrs {
        let network: IpNetwork = cidr
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("pod CIDR {cidr}: {e}")))?;
        let size = range_size(&network);
        match network {
            IpNetwork::V4(_) => ipv4 = ipv4.saturating_add(size),
            IpNetwork::V6(_) => ipv6 = ipv6.saturating_add(size),
        }
    }

    let max_eni = or_override(1, config.customer_max_eni);
    let max_ip_per_eni = or_override(ipv4.max(ipv6), config.customer_max_ip);
    Ok(NodeCapacity {
        max_eni,
        max_ip_per_eni,
        customer_eni_resource: max_eni,
        customer_ip_resource: max_ip_per_eni,
    })
}

/// Cross-VPC interfaces of a node: the CPU limit, lowered by the node's
/// annotation and label when they are set
pub fn cross_vpc_max_eni(node: &Node, cpu: i64) -> i64 {
    let from_meta = |value: Option<&String>| value.and_then(|v| v.trim().parse::<i64>().ok());
    [
        Some(max_eni_per_node(cpu)),
        from_meta(node.annotations().get(ANNOTATION_CROSS_VPC_MAX_ENI)),
        from_meta(node.labels().get(LABEL_CROSS_VPC_MAX_ENI)),
    ]
    .into_iter()
    .flatten()
    .min()
    .unwrap_or_default()
}

/// Whether cross-VPC interfaces are configured for the node
pub fn has_cross_vpc_limit(node: &Node) -> bool {
    node.annotations().contains_key(ANNOTATION_CROSS_VPC_MAX_ENI)
        || node.labels().contains_key(LABEL_CROSS_VPC_MAX_ENI)
}

/// Parse a Kubernetes quantity ("4", "3800m", "16Gi", "1e3") into a number
pub fn parse_quantity(raw: &str) -> Option<f64> {
    const SUFFIXES: [(&str, f64); 13] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    let raw = raw.trim();
    if let Ok(value) = raw.parse::<f64>() {
        return Some(value);
    }
    let (number, factor) = SUFFIXES
        .iter()
        .find_map(|(suffix, factor)| raw.strip_suffix(suffix).map(|n| (n, *factor)))
        .or_else(|| raw.strip_suffix('P').map(|n| (n, 1e15)))
        .or_else(|| raw.strip_suffix('E').map(|n| (n, 1e18)))?;
    number.parse::<f64>().ok().map(|n| n * factor)
}

/// CPU and memory reported in a node's capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeResources {
    /// Whole CPUs, rounded up
    pub cpu: i64,
    /// Memory in GiB, rounded down
    pub memory_gb: i64,
    /// Pods the node accepts
    pub max_pods: i64,
}

fn quantity_of(node: &Node, key: &str) -> Option<f64> {
    node.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(key))
        .and_then(|q| parse_quantity(&q.0))
}

/// Read CPU, memory and pod limits from the node's capacity
#[allow(clippy::cast_possible_truncation, reason = "capacities are far below i64::MAX")]
pub fn node_resources(node: &Node) -> NodeResources {
    NodeResources {
        cpu: quantity_of(node, "cpu").map_or(0, |c| c.ceil() as i64),
        memory_gb: quantity_of(node, "memory").map_or(0, |m| (m / 1_073_741_824.0) as i64),
        max_pods: quantity_of(node, "pods").map_or(DEFAULT_MAX_PODS, |p| p as i64),
    }
}

/// Resources already published that differ from `desired`
fn changed_resources(node: &Node, desired: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(key, value)| {
            let current = quantity_of(node, key);
            let wanted = value.parse::<f64>().ok();
            current.is_none() || current != wanted
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Writes a node's limits into its status capacity
#[derive(Clone)]
pub struct CapacityPublisher {
    nodes: Arc<dyn NodeStore>,
}

impl CapacityPublisher {
    pub fn new(nodes: Arc<dyn NodeStore>) -> Self {
        Self { nodes }
    }

    /// Patch the resources that differ, returning whether a patch was sent
    pub async fn publish(&self, node: &Node, desired: &BTreeMap<String, String>) -> Result<bool, ControllerError> {
        let name = node.name_any();
        let changed = changed_resources(node, desired);
        if changed.is_empty() {
            debug!("Capacity of node {} is up to date", name);
            return Ok(false);
        }

        self.nodes.patch_capacity(&name, &changed).await.inspect_err(|e| {
            warn!("Failed to patch capacity of node {}: {}", name, e);
        })?;
        info!("Patched capacity {:?} to node {}", changed, name);
        Ok(true)
    }
}

impl std::fmt::Debug for CapacityPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityPublisher").finish_non_exhaustive()
    }
}
