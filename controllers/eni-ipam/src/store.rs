//! Kubernetes-side storage seams.
//!
//! The ENI syncer, the IPAM engine, the adapters and node discovery reach the
//! API server only through these traits. The `Kube*` types are the real
//! implementations; `test_utils` provides in-memory ones.

use std::collections::BTreeMap;

use async_trait::async_trait;
use crds::{ENI, LABEL_NODE_NAME, NetResourceSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::error::ControllerError;
use crate::reconcile_helpers::{map_kube_error, object_name};

/// ENI custom resources
#[async_trait]
pub trait EniStore: Send + Sync {
    /// Latest copy of an ENI, `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<ENI>, ControllerError>;
    /// ENIs labelled with the given node
    async fn list_by_node(&self, node_name: &str) -> Result<Vec<ENI>, ControllerError>;
    /// ENIs holding the given address in either IP set
    async fn find_by_ip(&self, ip: &str) -> Result<Vec<ENI>, ControllerError>;
    async fn create(&self, eni: &ENI) -> Result<ENI, ControllerError>;
    /// Replace metadata and spec
    async fn update(&self, eni: &ENI) -> Result<ENI, ControllerError>;
    /// Replace the status subresource
    async fn update_status(&self, eni: &ENI) -> Result<ENI, ControllerError>;
    /// Delete, succeeding when the object is already gone
    async fn delete(&self, name: &str) -> Result<(), ControllerError>;
}

/// NetResourceSet custom resources
#[async_trait]
pub trait NetResourceSetStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<NetResourceSet>, ControllerError>;
    async fn create(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError>;
    async fn update(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError>;
    async fn update_status(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError>;
}

/// Kubernetes nodes and the pods scheduled on them
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ControllerError>;
    /// Merge the given extended resources into `status.capacity`
    async fn patch_capacity(
        &self,
        name: &str,
        capacity: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError>;
    /// Pods bound to the node that are still pending
    async fn pending_pod_count(&self, name: &str) -> Result<usize, ControllerError>;
}

/// Whether an ENI holds `ip` in its IPv4 or IPv6 set
pub fn eni_has_ip(eni: &ENI, ip: &str) -> bool {
    eni.spec
        .eni
        .private_ip_set
        .iter()
        .chain(eni.spec.eni.ipv6_private_ip_set.iter())
        .any(|p| p.private_ip_address == ip)
}

/// Cluster-scoped ENI API
#[derive(Clone)]
pub struct KubeEniStore {
    api: Api<ENI>,
}

impl KubeEniStore {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl EniStore for KubeEniStore {
    async fn get(&self, name: &str) -> Result<Option<ENI>, ControllerError> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn list_by_node(&self, node_name: &str) -> Result<Vec<ENI>, ControllerError> {
        let lp = ListParams::default().labels(&format!("{LABEL_NODE_NAME}={node_name}"));
        let list = self
            .api
            .list(&lp)
            .await
            .map_err(|e| map_kube_error(e, node_name))?;
        Ok(list.items)
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Vec<ENI>, ControllerError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, ip))?;
        Ok(list.items.into_iter().filter(|e| eni_has_ip(e, ip)).collect())
    }

    async fn create(&self, eni: &ENI) -> Result<ENI, ControllerError> {
        let name = object_name(&eni.metadata, "ENI")?;
        self.api
            .create(&PostParams::default(), eni)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn update(&self, eni: &ENI) -> Result<ENI, ControllerError> {
        let name = object_name(&eni.metadata, "ENI")?;
        self.api
            .replace(name, &PostParams::default(), eni)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn update_status(&self, eni: &ENI) -> Result<ENI, ControllerError> {
        let name = object_name(&eni.metadata, "ENI")?;
        self.api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(eni)?)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn delete(&self, name: &str) -> Result<(), ControllerError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match map_kube_error(e, name) {
                ControllerError::NotFound(_) => {
                    debug!("ENI {} already deleted", name);
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}

/// Cluster-scoped NetResourceSet API
#[derive(Clone)]
pub struct KubeNetResourceSetStore {
    api: Api<NetResourceSet>,
}

impl KubeNetResourceSetStore {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl NetResourceSetStore for KubeNetResourceSetStore {
    async fn get(&self, name: &str) -> Result<Option<NetResourceSet>, ControllerError> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn create(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError> {
        let name = object_name(&nrs.metadata, "NetResourceSet")?;
        self.api
            .create(&PostParams::default(), nrs)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn update(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError> {
        let name = object_name(&nrs.metadata, "NetResourceSet")?;
        self.api
            .replace(name, &PostParams::default(), nrs)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn update_status(&self, nrs: &NetResourceSet) -> Result<NetResourceSet, ControllerError> {
        let name = object_name(&nrs.metadata, "NetResourceSet")?;
        self.api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(nrs)?)
            .await
            .map_err(|e| map_kube_error(e, name))
    }
}

/// Node and Pod APIs
#[derive(Clone)]
pub struct KubeNodeStore {
    nodes: Api<Node>,
    pods: Api<Pod>,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            pods: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ControllerError> {
        self.nodes
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, name))
    }

    async fn patch_capacity(
        &self,
        name: &str,
        capacity: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        let patch = serde_json::json!({
            "status": {
                "capacity": capacity,
            }
        });
        self.nodes
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, name))?;
        Ok(())
    }

    async fn pending_pod_count(&self, name: &str) -> Result<usize, ControllerError> {
        let lp = ListParams::default().fields(&format!("spec.nodeName={name},status.phase=Pending"));
        let pods = self
            .pods
            .list(&lp)
            .await
            .map_err(|e| map_kube_error(e, name))?;
        Ok(pods.items.len())
    }
}
