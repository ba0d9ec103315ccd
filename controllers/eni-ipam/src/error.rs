//! Controller-specific error types.
//!
//! Cloud failures leaving an adapter or the ENI state machine are wrapped
//! with the operation and the resource they were issued for. Kubernetes
//! errors that drive retry decisions (conflict, expired, not found) get
//! their own variants so the in-memory stores used by tests can produce them.

use cloud_client::CloudError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the ENI IPAM Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cloud API error
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Cloud API error with operation context
    #[error("{context}: {source}")]
    CloudCall {
        /// Operation and resource the call was made for
        context: String,
        /// Underlying cloud error
        #[source]
        source: CloudError,
    },

    /// Stale resource version on update
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Watch or list resource version too old
    #[error("Resource expired: {0}")]
    ResourceExpired(String),

    /// Object missing on the API server
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The node's backing instance cannot be determined
    #[error("Instance ID unavailable for node {0}")]
    InstanceIdUnavailable(String),

    /// IP or interface allocation failed
    #[error("IP allocation failed: {0}")]
    AllocationFailed(String),

    /// Operation not supported by the node's instance family
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Instance inventory is being refreshed, mutations are blocked
    #[error("instances API is unstable, blocking mutating operations")]
    InstancesApiUnstable,

    /// An interface of the node has not reached the inuse state yet
    #[error("eni {0} is not inuse on vpc, please try again later")]
    EniNotInUse(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ControllerError {
    /// Wrap a cloud error with the operation and resource it was issued for
    pub fn cloud(context: impl Into<String>, source: CloudError) -> Self {
        Self::CloudCall {
            context: context.into(),
            source,
        }
    }

    /// Optimistic concurrency failure, retry with a fresh copy
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Resource version too old, retry with a fresh copy
    pub fn is_resource_expired(&self) -> bool {
        matches!(self, Self::ResourceExpired(_))
    }

    /// Object does not exist on the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
