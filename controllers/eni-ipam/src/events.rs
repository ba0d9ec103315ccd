//! Operator-visible Kubernetes events.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::warn;

/// Component name recorded as the event source
pub const EVENT_COMPONENT: &str = "eni-syncer";

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Records events against Kubernetes objects.
///
/// Recording is best effort: failures are logged and never surface to the
/// reconciliation that emitted the event.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str);
}

/// Writes core/v1 events through the API server
#[derive(Clone)]
pub struct KubeEventRecorder {
    api: Api<Event>,
}

impl KubeEventRecorder {
    /// Events of cluster-scoped objects live in the `default` namespace
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::namespaced(client, "default"),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        let prefix = object.name.clone().unwrap_or_else(|| "eni".to_string());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{prefix}.")),
                ..Default::default()
            },
            involved_object: object.clone(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(kind.as_str().to_string()),
            source: Some(EventSource {
                component: Some(EVENT_COMPONENT.to_string()),
                host: None,
            }),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = self.api.create(&PostParams::default(), &event).await {
            warn!("Failed to record event {} for {:?}: {}", reason, object.name, e);
        }
    }
}
