//! Node discovery.
//!
//! Every Kubernetes node gets a NetResourceSet carrying its instance, its
//! addresses and the interface settings the IPAM engine works from. The
//! node's interface and address limits are published into its capacity.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use crds::{EniType, EniUseMode, LABEL_ENI_TYPE, LABEL_ENI_USE_MODE, LABEL_NODE_NAME, NetResourceSet, NodeAddress, NodeEniSpec};
use k8s_openapi::api::core::v1::Node;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::capacity::{
    self, CapacityPublisher, RESOURCE_CROSS_VPC_ENI, RESOURCE_RDMA_IP, bbc_capacity, bcc_capacity, cross_vpc_max_eni,
    has_cross_vpc_limit, range_capacity, rdma_capacity,
};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::{EventKind, EventRecorder};
use crate::reconcile_helpers::owner_reference;
use crate::store::{NetResourceSetStore, NodeStore};

/// Get-or-create attempts before giving up on a node
pub const NRS_UPDATE_ATTEMPTS: usize = 10;

/// Zone label set by the cloud provider
const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Cloud instance behind a node, taken from the last segment of its
/// provider ID (`cce://i-abc` or `cce://region/i-abc`)
pub fn instance_id_from_provider_id(provider_id: &str) -> Option<String> {
    let path = provider_id.split_once("://").map_or(provider_id, |(_, rest)| rest);
    path.rsplit('/')
        .next()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn instance_type_of(node: &Node) -> EniType {
    let Some(raw) = node.labels().get(LABEL_ENI_TYPE) else {
        return EniType::Bcc;
    };
    [EniType::Bcc, EniType::Bbc, EniType::Ebc, EniType::Hpc, EniType::Eri]
        .into_iter()
        .find(|t| t.as_str() == raw.as_str())
        .unwrap_or_else(|| {
            warn!("Node {} has unknown interface type {}, using bcc", node.name_any(), raw);
            EniType::Bcc
        })
}

/// IP addresses of a node, first occurrence of each address wins
fn node_addresses(node: &Node) -> Vec<NodeAddress> {
    let mut seen = BTreeSet::new();
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .into_iter()
        .flatten()
        .filter(|a| a.address.parse::<IpAddr>().is_ok())
        .filter(|a| seen.insert(a.address.clone()))
        .map(|a| NodeAddress {
            address_type: a.type_.clone(),
            ip: a.address.clone(),
        })
        .collect()
}

/// Keeps the NetResourceSet and capacity of every node current
pub struct NodeDiscovery {
    config: Arc<ControllerConfig>,
    net_resources: Arc<dyn NetResourceSetStore>,
    events: Arc<dyn EventRecorder>,
    publisher: CapacityPublisher,
}

impl NodeDiscovery {
    pub fn new(
        config: Arc<ControllerConfig>,
        net_resources: Arc<dyn NetResourceSetStore>,
        nodes: Arc<dyn NodeStore>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            config,
            net_resources,
            events,
            publisher: CapacityPublisher::new(nodes),
        }
    }

    /// Bring the node's NetResourceSet and capacity up to date
    pub async fn discover(&self, node: &Node) -> Result<NetResourceSet, ControllerError> {
        let nrs = self.update_net_resource_set(node).await?;
        self.publish_capacity(node, &nrs).await?;
        Ok(nrs)
    }

    /// Create the node's NetResourceSet or update the existing one.
    ///
    /// A write on a stale or concurrently created object is retried with a
    /// fresh copy, up to [`NRS_UPDATE_ATTEMPTS`] times.
    pub async fn update_net_resource_set(&self, node: &Node) -> Result<NetResourceSet, ControllerError> {
        let name = node.name_any();
        let Some(instance_id) = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .and_then(instance_id_from_provider_id)
        else {
            self.events
                .record(
                    &node.object_ref(&()),
                    EventKind::Warning,
                    "MetaAPIError01",
                    "failed to get instance id from the node's provider id",
                )
                .await;
            return Err(ControllerError::InstanceIdUnavailable(name));
        };

        info!("Creating or updating NetResourceSet {}", name);
        for attempt in 1..=NRS_UPDATE_ATTEMPTS {
            let existing = self.net_resources.get(&name).await?;
            let exists = existing.is_some();
            let mut nrs = existing.unwrap_or_else(|| NetResourceSet::new(&name, Default::default()));
            self.mutate(&mut nrs, node, &instance_id);

            let written = if exists {
                self.net_resources.update(&nrs).await
            } else {
                self.net_resources.create(&nrs).await
            };
            match written {
                Ok(nrs) => {
                    if !exists {
                        info!("Successfully created NetResourceSet {}", name);
                    }
                    return Ok(nrs);
                }
                Err(e) if e.is_conflict() => {
                    warn!("Unable to write NetResourceSet {} (attempt {}), will retry: {}", name, attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Reconciliation(format!(
            "could not create or update NetResourceSet {name} after {NRS_UPDATE_ATTEMPTS} attempts"
        )))
    }

    /// Copy identity, metadata and addresses of the node onto its NetResourceSet
    pub fn mutate(&self, nrs: &mut NetResourceSet, node: &Node, instance_id: &str) {
        let name = node.name_any();
        nrs.metadata.owner_references = Some(vec![owner_reference(node)]);

        let labels = nrs.labels_mut();
        labels.extend(node.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
        labels.insert(LABEL_NODE_NAME.to_string(), name);
        nrs.annotations_mut()
            .extend(node.annotations().iter().map(|(k, v)| (k.clone(), v.clone())));

        nrs.spec.addresses = node_addresses(node);
        nrs.spec.instance_id = instance_id.to_string();

        if self.config.discovery.range_mode {
            nrs.spec.ipam.pod_cidrs = node
                .spec
                .as_ref()
                .and_then(|s| s.pod_cidrs.clone())
                .unwrap_or_default();
        } else {
            self.refresh_eni_config(nrs, node);
        }
    }

    /// Interface settings of the node.
    ///
    /// The interface spec is generated once. Pool thresholds, security groups
    /// and subnets are refreshed from the configuration on every pass; the
    /// subnets of interfaces the node already holds stay listed.
    pub fn refresh_eni_config(&self, nrs: &mut NetResourceSet, node: &Node) {
        let defaults = &self.config.discovery;

        let mut subnet_ids = defaults.subnet_ids.clone();
        if let Some(status) = nrs.status.as_ref().filter(|s| !s.enis.is_empty()) {
            let merged: BTreeSet<String> = subnet_ids
                .into_iter()
                .chain(status.enis.values().map(|e| e.subnet_id.clone()))
                .filter(|s| !s.is_empty())
                .collect();
            subnet_ids = merged.into_iter().collect();
        }

        let label_mode = nrs.labels().get(LABEL_ENI_USE_MODE).and_then(|raw| {
            raw.parse::<EniUseMode>()
                .inspect_err(|e| warn!("Ignoring use mode label of node {}: {}", node.name_any(), e))
                .ok()
        });

        let spec = &mut nrs.spec;
        let eni = spec.eni.get_or_insert_with(|| {
            let use_mode = label_mode.unwrap_or(defaults.use_mode);
            info!("Generating interface spec of node {} in {} mode", node.name_any(), use_mode.as_str());
            NodeEniSpec {
                instance_type: instance_type_of(node),
                use_mode,
                install_source_based_routing: use_mode == EniUseMode::SecondaryIp
                    && defaults.install_source_based_routing,
                use_primary_address: defaults.use_primary_address,
                route_table_offset: defaults.route_table_offset,
                availability_zone: node.labels().get(LABEL_TOPOLOGY_ZONE).cloned().unwrap_or_default(),
                vpc_id: self.config.vpc_id.clone(),
                ..Default::default()
            }
        });

        if eni.use_mode != EniUseMode::PrimaryIp {
            eni.burstable_mehrfach_eni = defaults.burstable_mehrfach_eni;
            eni.pre_allocate_eni = defaults.pre_allocate_eni;
            if defaults.burstable_mehrfach_eni == 0 {
                spec.ipam.min_allocate = defaults.min_allocate;
                spec.ipam.pre_allocate = defaults.pre_allocate;
                spec.ipam.max_above_watermark = defaults.max_above_watermark;
            }
            spec.ipam.max_allocate = capacity::node_resources(node).max_pods;
            debug!("Set max allocate of node {} to {}", node.name_any(), spec.ipam.max_allocate);
        }
        eni.security_groups.clone_from(&defaults.security_groups);
        eni.enterprise_security_group_list
            .clone_from(&defaults.enterprise_security_groups);
        eni.subnet_ids = subnet_ids;
    }

    /// Extended resources the node should advertise
    pub fn desired_capacity(&self, node: &Node, nrs: &NetResourceSet) -> Result<BTreeMap<String, String>, ControllerError> {
        let config = &self.config;
        let resources = capacity::node_resources(node);

        let Some(eni) = nrs.spec.eni.as_ref() else {
            if nrs.spec.ipam.pod_cidrs.is_empty() {
                return Ok(BTreeMap::new());
            }
            return Ok(range_capacity(&nrs.spec.ipam.pod_cidrs, config)?.resources());
        };

        let mut desired = match eni.instance_type {
            EniType::Bbc => bbc_capacity(config).resources(),
            EniType::Hpc | EniType::Eri => BTreeMap::from([(
                RESOURCE_RDMA_IP.to_string(),
                rdma_capacity(eni.instance_type, resources.memory_gb, config)
                    .customer_rdma_ip_resource
                    .to_string(),
            )]),
            EniType::Bcc | EniType::Ebc => bcc_capacity(resources.cpu, resources.memory_gb, config).resources(),
        };
        if has_cross_vpc_limit(node) {
            desired.insert(
                RESOURCE_CROSS_VPC_ENI.to_string(),
                cross_vpc_max_eni(node, resources.cpu).to_string(),
            );
        }
        Ok(desired)
    }

    /// Publish the node's limits, skipping a patch when nothing changed
    pub async fn publish_capacity(&self, node: &Node, nrs: &NetResourceSet) -> Result<bool, ControllerError> {
        let desired = self.desired_capacity(node, nrs)?;
        if desired.is_empty() {
            return Ok(false);
        }
        self.publisher.publish(node, &desired).await
    }
}

impl std::fmt::Debug for NodeDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDiscovery")
            .field("vpc_id", &self.config.vpc_id)
            .field("range_mode", &self.config.discovery.range_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::{RESOURCE_ENI, RESOURCE_IP};
    use crate::test_utils::*;
    use crds::{ANNOTATION_CROSS_VPC_MAX_ENI, NetResourceSetStatus, SimpleEniStatus};
    use k8s_openapi::api::core::v1::{NodeAddress as K8sNodeAddress, NodeSpec};
    use pretty_assertions::assert_eq;

    const NODE: &str = "node-1";

    struct Harness {
        nrs_store: Arc<MemoryNetResourceSetStore>,
        nodes: Arc<MemoryNodeStore>,
        events: Arc<RecordingEventRecorder>,
        discovery: NodeDiscovery,
    }

    fn setup(config: ControllerConfig) -> Harness {
        let nrs_store = Arc::new(MemoryNetResourceSetStore::default());
        let nodes = Arc::new(MemoryNodeStore::default());
        let events = Arc::new(RecordingEventRecorder::default());
        let discovery = NodeDiscovery::new(
            Arc::new(config),
            Arc::clone(&nrs_store) as _,
            Arc::clone(&nodes) as _,
            Arc::clone(&events) as _,
        );
        Harness {
            nrs_store,
            nodes,
            events,
            discovery,
        }
    }

    fn discovery_config() -> ControllerConfig {
        let mut config = test_config();
        config.discovery.subnet_ids = vec!["sbn-b".to_string(), "sbn-a".to_string()];
        config.discovery.security_groups = vec!["sg-1".to_string()];
        config.discovery.burstable_mehrfach_eni = 0;
        config.discovery.pre_allocate = 3;
        config.discovery.min_allocate = 1;
        config
    }

    fn node() -> Node {
        let mut node = test_node(NODE, "4", "16Gi");
        node.metadata.uid = Some("node-uid".to_string());
        node.labels_mut()
            .insert(LABEL_TOPOLOGY_ZONE.to_string(), "zoneA".to_string());
        node.annotations_mut()
            .insert("example.com/team".to_string(), "net".to_string());
        node.spec = Some(NodeSpec {
            provider_id: Some("cce://i-node-1".to_string()),
            ..Default::default()
        });
        let address = |type_: &str, ip: &str| K8sNodeAddress {
            type_: type_.to_string(),
            address: ip.to_string(),
        };
        if let Some(status) = node.status.as_mut() {
            status.addresses = Some(vec![
                address("InternalIP", "192.168.0.10"),
                address("Hostname", NODE),
                address("ExternalIP", "192.168.0.10"),
            ]);
        }
        node
    }

    #[test]
    fn test_instance_id_from_provider_id() {
        assert_eq!(instance_id_from_provider_id("cce://i-abc"), Some("i-abc".to_string()));
        assert_eq!(instance_id_from_provider_id("cce://bj/i-abc"), Some("i-abc".to_string()));
        assert_eq!(instance_id_from_provider_id("i-abc"), Some("i-abc".to_string()));
        assert_eq!(instance_id_from_provider_id("cce://"), None);
    }

    #[tokio::test]
    async fn test_creates_net_resource_set_for_new_node() {
        let h = setup(discovery_config());

        let nrs = h.discovery.update_net_resource_set(&node()).await.unwrap();

        assert_eq!(nrs.spec.instance_id, "i-node-1");
        assert_eq!(nrs.labels().get(LABEL_NODE_NAME).map(String::as_str), Some(NODE));
        assert_eq!(nrs.annotations().get("example.com/team").map(String::as_str), Some("net"));
        let owner = &nrs.owner_references()[0];
        assert_eq!((owner.kind.as_str(), owner.uid.as_str()), ("Node", "node-uid"));
        assert_eq!(
            nrs.spec.addresses,
            vec![NodeAddress {
                address_type: "InternalIP".to_string(),
                ip: "192.168.0.10".to_string(),
            }]
        );

        let eni = nrs.spec.eni.as_ref().unwrap();
        assert_eq!(eni.instance_type, EniType::Bcc);
        assert_eq!(eni.use_mode, EniUseMode::SecondaryIp);
        assert_eq!(eni.availability_zone, "zoneA");
        assert_eq!(eni.vpc_id, "vpc-test");
        assert_eq!(eni.subnet_ids, vec!["sbn-b", "sbn-a"]);
        assert_eq!(eni.security_groups, vec!["sg-1"]);
        assert_eq!(nrs.spec.ipam.pre_allocate, 3);
        assert_eq!(nrs.spec.ipam.min_allocate, 1);
        assert_eq!(nrs.spec.ipam.max_allocate, 110);
        assert!(h.nrs_store.snapshot(NODE).is_some());
    }

    #[tokio::test]
    async fn test_update_keeps_generated_spec_and_known_subnets() {
        let h = setup(discovery_config());
        let mut existing = test_nrs(NODE, "i-old", EniType::Ebc);
        existing.status = Some(NetResourceSetStatus {
            enis: BTreeMap::from([(
                "eni-1".to_string(),
                SimpleEniStatus {
                    subnet_id: "sbn-c".to_string(),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        });
        h.nrs_store.insert(existing);

        let nrs = h.discovery.update_net_resource_set(&node()).await.unwrap();

        let eni = nrs.spec.eni.as_ref().unwrap();
        assert_eq!(eni.instance_type, EniType::Ebc);
        assert_eq!(eni.subnet_ids, vec!["sbn-a", "sbn-b", "sbn-c"]);
        assert_eq!(nrs.spec.instance_id, "i-node-1");
    }

    #[tokio::test]
    async fn test_use_mode_label_and_primary_ip_mode() {
        let h = setup(discovery_config());
        let mut node = node();
        node.labels_mut()
            .insert(LABEL_ENI_USE_MODE.to_string(), "primary-ip".to_string());

        let nrs = h.discovery.update_net_resource_set(&node).await.unwrap();

        assert_eq!(nrs.spec.eni.as_ref().unwrap().use_mode, EniUseMode::PrimaryIp);
        // pool thresholds are left alone in primary-ip mode
        assert_eq!(nrs.spec.ipam.pre_allocate, 0);
        assert_eq!(nrs.spec.ipam.max_allocate, 0);
    }

    #[tokio::test]
    async fn test_burstable_nodes_keep_pool_thresholds() {
        let mut config = discovery_config();
        config.discovery.burstable_mehrfach_eni = 1;
        let h = setup(config);

        let nrs = h.discovery.update_net_resource_set(&node()).await.unwrap();

        assert_eq!(nrs.spec.eni.as_ref().unwrap().burstable_mehrfach_eni, 1);
        assert_eq!(nrs.spec.ipam.pre_allocate, 0);
        assert_eq!(nrs.spec.ipam.max_allocate, 110);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let h = setup(discovery_config());
        h.nrs_store.insert(test_nrs(NODE, "i-node-1", EniType::Bcc));
        h.nrs_store.inject_conflicts(3);

        assert!(h.discovery.update_net_resource_set(&node()).await.is_ok());

        h.nrs_store.inject_conflicts(NRS_UPDATE_ATTEMPTS);
        let err = h.discovery.update_net_resource_set(&node()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Reconciliation(_)), "{err}");
    }

    #[tokio::test]
    async fn test_missing_provider_id_is_an_error() {
        let h = setup(discovery_config());
        let mut node = node();
        node.spec = None;

        let err = h.discovery.update_net_resource_set(&node).await.unwrap_err();

        assert!(matches!(err, ControllerError::InstanceIdUnavailable(ref n) if n == NODE), "{err}");
        assert_eq!(h.events.reasons(), vec!["MetaAPIError01"]);
        assert!(h.nrs_store.snapshot(NODE).is_none());
    }

    #[tokio::test]
    async fn test_range_mode_copies_pod_cidrs() {
        let mut config = discovery_config();
        config.discovery.range_mode = true;
        let h = setup(config);
        let mut node = node();
        if let Some(spec) = node.spec.as_mut() {
            spec.pod_cidrs = Some(vec!["10.0.0.0/24".to_string()]);
        }

        let nrs = h.discovery.update_net_resource_set(&node).await.unwrap();

        assert!(nrs.spec.eni.is_none());
        assert_eq!(nrs.spec.ipam.pod_cidrs, vec!["10.0.0.0/24"]);
        let desired = h.discovery.desired_capacity(&node, &nrs).unwrap();
        assert_eq!(desired[RESOURCE_IP], "256");
        assert_eq!(desired[RESOURCE_ENI], "1");
    }

    #[tokio::test]
    async fn test_discover_publishes_capacity_once() {
        let h = setup(discovery_config());
        let node = node();
        h.nodes.insert(node.clone());

        h.discovery.discover(&node).await.unwrap();

        let patches = h.nodes.capacity_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].1[RESOURCE_ENI], "4");
        assert_eq!(patches[0].1[RESOURCE_IP], "60");

        let patched = h.nodes.get_node(NODE).await.unwrap().unwrap();
        h.discovery.discover(&patched).await.unwrap();
        assert_eq!(h.nodes.capacity_patches().len(), 1);
    }

    #[test]
    fn test_desired_capacity_per_instance_family() {
        let h = setup(discovery_config());
        let mut node = node();

        let bbc = test_nrs(NODE, "i-node-1", EniType::Bbc);
        let desired = h.discovery.desired_capacity(&node, &bbc).unwrap();
        assert_eq!(desired[RESOURCE_ENI], "0");
        assert_eq!(desired[RESOURCE_IP], "40");

        let hpc = test_nrs(NODE, "i-node-1", EniType::Hpc);
        let desired = h.discovery.desired_capacity(&node, &hpc).unwrap();
        assert_eq!(desired[RESOURCE_RDMA_IP], "13");
        assert!(!desired.contains_key(RESOURCE_IP));

        node.annotations_mut()
            .insert(ANNOTATION_CROSS_VPC_MAX_ENI.to_string(), "2".to_string());
        let bcc = test_nrs(NODE, "i-node-1", EniType::Bcc);
        let desired = h.discovery.desired_capacity(&node, &bcc).unwrap();
        assert_eq!(desired[RESOURCE_CROSS_VPC_ENI], "2");
    }
}
