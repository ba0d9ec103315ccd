//! Helper functions for common reconciliation patterns
//!
//! Metadata inspection, owner references and Kubernetes error mapping
//! shared by the ENI syncer, the IPAM engine and node discovery.

use std::future::Future;

use chrono::{DateTime, Utc};
use crds::{API_VERSION, NetResourceSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use tracing::debug;

use crate::error::ControllerError;

/// Kind of the per-node custom resource
pub const NET_RESOURCE_SET_KIND: &str = "NetResourceSet";

/// Creation time of an object, `None` when the server did not set one
pub fn created_at(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(&meta.creation_timestamp).ok()?;
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Whether deletion has been requested for the object
pub fn is_being_deleted(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Whether any owner reference points at a NetResourceSet
pub fn managed_by_net_resource_set(meta: &ObjectMeta) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|owners| {
            owners
                .iter()
                .any(|o| o.api_version == API_VERSION && o.kind == NET_RESOURCE_SET_KIND)
        })
}

/// Owner reference pointing at a NetResourceSet
pub fn net_resource_set_owner(nrs: &NetResourceSet) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: NET_RESOURCE_SET_KIND.to_string(),
        name: nrs.metadata.name.clone().unwrap_or_default(),
        uid: nrs.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Owner reference to any Kubernetes object with static type information
pub fn owner_reference<K>(obj: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.meta().name.clone().unwrap_or_default(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Object name or an error naming the kind of object
pub fn object_name<'a>(meta: &'a ObjectMeta, kind: &str) -> Result<&'a str, ControllerError> {
    meta.name
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{kind} missing name")))
}

/// Translate the API server status codes that drive retry decisions
pub fn map_kube_error(err: kube::Error, name: &str) -> ControllerError {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 => ControllerError::Conflict(format!("{name}: {}", ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => ControllerError::NotFound(name.to_string()),
        kube::Error::Api(ae) if ae.code == 410 => {
            ControllerError::ResourceExpired(format!("{name}: {}", ae.message))
        }
        _ => ControllerError::Kube(err),
    }
}

/// Remove `finalizer` from the list, `true` when it was present
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    let removed = finalizers.len() != before;
    if finalizers.is_empty() {
        meta.finalizers = None;
    }
    removed
}

/// Run `op` until it succeeds, fails with something other than a stale
/// resource version, or `attempts` runs are used up.
///
/// `op` must re-read the object it writes on every run.
pub async fn retry_on_conflict<T, F, Fut>(attempts: usize, mut op: F) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if (e.is_conflict() || e.is_resource_expired()) && attempt < attempts => {
                debug!("Retrying after stale write (attempt {}): {}", attempt, e);
                attempt += 1;
            }
            other => return other,
        }
    }
}
