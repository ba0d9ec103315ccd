//! Prometheus metrics and the probe endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ControllerError;

/// IPAM counters, labelled by pool (subnet)
#[derive(Debug, Clone)]
pub struct IpamMetrics {
    allocation_attempts: IntCounterVec,
    ips_allocated: IntCounterVec,
    ips_released: IntCounterVec,
}

impl IpamMetrics {
    /// Create the collectors and register them
    pub fn register(registry: &Registry) -> Result<Self, ControllerError> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.allocation_attempts.clone()))?;
        registry.register(Box::new(metrics.ips_allocated.clone()))?;
        registry.register(Box::new(metrics.ips_released.clone()))?;
        Ok(metrics)
    }

    /// Collectors that are not exported anywhere
    pub fn unregistered() -> Result<Self, ControllerError> {
        Ok(Self {
            allocation_attempts: IntCounterVec::new(
                Opts::new(
                    "ipam_allocation_attempts_total",
                    "Interface and IP allocation attempts, by outcome",
                ),
                &["status", "pool"],
            )?,
            ips_allocated: IntCounterVec::new(
                Opts::new("ipam_ips_allocated_total", "IP addresses allocated"),
                &["pool"],
            )?,
            ips_released: IntCounterVec::new(
                Opts::new("ipam_ips_released_total", "IP addresses released"),
                &["pool"],
            )?,
        })
    }

    pub fn inc_allocation_attempt(&self, status: &str, pool: &str) {
        self.allocation_attempts.with_label_values(&[status, pool]).inc();
    }

    pub fn add_ip_allocation(&self, pool: &str, count: i64) {
        if let Ok(count) = u64::try_from(count) {
            self.ips_allocated.with_label_values(&[pool]).inc_by(count);
        }
    }

    pub fn add_ip_release(&self, pool: &str, count: i64) {
        if let Ok(count) = u64::try_from(count) {
            self.ips_released.with_label_values(&[pool]).inc_by(count);
        }
    }

    /// Current value of an allocation attempt counter
    pub fn allocation_attempts(&self, status: &str, pool: &str) -> u64 {
        self.allocation_attempts.with_label_values(&[status, pool]).get()
    }

    /// Current number of addresses allocated from a pool
    pub fn ips_allocated(&self, pool: &str) -> u64 {
        self.ips_allocated.with_label_values(&[pool]).get()
    }

    /// Current number of addresses released to a pool
    pub fn ips_released(&self, pool: &str) -> u64 {
        self.ips_released.with_label_values(&[pool]).get()
    }
}

/// State shared by the probe handlers
#[derive(Clone)]
pub struct ProbeState {
    registry: Registry,
    ready: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip readiness once the watchers are running
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

/// `/metrics`, `/healthz` and `/readyz`
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<ProbeState>) -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&state.registry.gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn readyz_handler(State(state): State<ProbeState>) -> StatusCode {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve the probe endpoint until the task is dropped
pub async fn serve(addr: &str, state: ProbeState) -> Result<(), ControllerError> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDR {addr}: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Watch(format!("failed to bind metrics server on {addr}: {e}")))?;
    info!("Serving metrics and probes on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {e}")))
}
