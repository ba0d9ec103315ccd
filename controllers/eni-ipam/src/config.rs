//! Controller configuration.
//!
//! Built once in `main` from environment variables and handed to every
//! component at construction time.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use cloud_client::FlowControlConfig;
use crds::EniUseMode;

use crate::error::ControllerError;

/// Spare addresses kept ready when a node does not set `preAllocate`
pub const DEFAULT_PRE_ALLOCATE: i64 = 8;

/// Controller-wide settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Cloud API endpoint
    pub cloud_endpoint: String,
    /// Bearer token for the cloud API
    pub cloud_token: String,
    /// Region of the cluster
    pub cloud_region: String,
    /// VPC of the cluster
    pub vpc_id: String,
    /// Per-request timeout of the cloud HTTP client
    pub cloud_timeout: Duration,

    /// Rate limiting of cloud operations
    pub flow_control: FlowControlConfig,

    /// Allocate IPv4 addresses
    pub enable_ipv4: bool,
    /// Allocate IPv6 addresses
    pub enable_ipv6: bool,
    /// Release addresses above the watermark
    pub release_excess_ips: bool,
    /// Cool-down before an excess address is offered for release
    pub excess_ip_release_delay: Duration,

    /// Interval of the node manager resync loop
    pub resync_interval: Duration,
    /// Interval at which ENIs are listed from the cloud
    pub eni_resync_interval: Duration,
    /// Minimum spacing of two pool maintenance runs on one node
    pub pool_maintenance_interval: Duration,
    /// Minimum spacing of two API server syncs of one node
    pub api_sync_interval: Duration,

    /// Operator override of the interface limit per node (0 keeps the computed one)
    pub customer_max_eni: i64,
    /// Operator override of the address limit per interface (0 keeps the computed one)
    pub customer_max_ip: i64,
    /// Operator override of the RDMA address limit per interface (0 keeps the computed one)
    pub customer_max_rdma_ip: i64,
    /// `preAllocate` used when a node sets none
    pub default_pre_allocate: i64,

    /// Defaults written into new NetResourceSet objects
    pub discovery: DiscoveryDefaults,

    /// Bind address of the metrics and probe server
    pub metrics_addr: String,
}

/// Defaults applied by node discovery
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDefaults {
    pub min_allocate: i64,
    pub pre_allocate: i64,
    pub max_above_watermark: i64,
    pub burstable_mehrfach_eni: i64,
    pub pre_allocate_eni: i64,
    pub subnet_ids: Vec<String>,
    pub security_groups: Vec<String>,
    pub enterprise_security_groups: Vec<String>,
    pub route_table_offset: i32,
    pub use_mode: EniUseMode,
    pub use_primary_address: bool,
    pub install_source_based_routing: bool,
    /// Nodes get pod CIDR ranges instead of interfaces
    pub range_mode: bool,
}

impl Default for DiscoveryDefaults {
    fn default() -> Self {
        Self {
            min_allocate: 0,
            pre_allocate: 0,
            max_above_watermark: 0,
            burstable_mehrfach_eni: 1,
            pre_allocate_eni: 1,
            subnet_ids: Vec::new(),
            security_groups: Vec::new(),
            enterprise_security_groups: Vec::new(),
            route_table_offset: 127,
            use_mode: EniUseMode::SecondaryIp,
            use_primary_address: false,
            install_source_based_routing: false,
            range_mode: false,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cloud_endpoint: "https://bcc.bj.baidubce.com".to_string(),
            cloud_token: String::new(),
            cloud_region: "bj".to_string(),
            vpc_id: String::new(),
            cloud_timeout: Duration::from_secs(30),
            flow_control: FlowControlConfig::default(),
            enable_ipv4: true,
            enable_ipv6: false,
            release_excess_ips: true,
            excess_ip_release_delay: Duration::from_secs(180),
            resync_interval: Duration::from_secs(60),
            eni_resync_interval: Duration::from_secs(60),
            pool_maintenance_interval: Duration::from_secs(1),
            api_sync_interval: Duration::from_secs(1),
            customer_max_eni: 0,
            customer_max_ip: 0,
            customer_max_rdma_ip: 0,
            default_pre_allocate: DEFAULT_PRE_ALLOCATE,
            discovery: DiscoveryDefaults::default(),
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cloud_token = get("CLOUD_TOKEN").ok_or_else(|| {
            ControllerError::InvalidConfig("CLOUD_TOKEN environment variable is required".to_string())
        })?;
        let vpc_id = get("CLOUD_VPC_ID").ok_or_else(|| {
            ControllerError::InvalidConfig("CLOUD_VPC_ID environment variable is required".to_string())
        })?;

        let flow_control = FlowControlConfig {
            enabled: parse_or(&get, "API_RATE_LIMIT_ENABLED", defaults.flow_control.enabled)?,
            overrides: get("API_RATE_LIMIT").unwrap_or_default(),
            qps: parse_or(&get, "API_QPS", defaults.flow_control.qps)?,
            burst: parse_or(&get, "API_BURST", defaults.flow_control.burst)?,
            timeout: duration_or(&get, "API_TIMEOUT", defaults.flow_control.timeout)?,
        };

        let use_mode = match get("ENI_USE_MODE") {
            Some(raw) => raw
                .parse::<EniUseMode>()
                .map_err(|e| ControllerError::InvalidConfig(format!("ENI_USE_MODE: {e}")))?,
            None => defaults.discovery.use_mode,
        };

        let discovery = DiscoveryDefaults {
            min_allocate: parse_or(&get, "IPPOOL_MIN_ALLOCATE", defaults.discovery.min_allocate)?,
            pre_allocate: parse_or(&get, "IPPOOL_PRE_ALLOCATE", defaults.discovery.pre_allocate)?,
            max_above_watermark: parse_or(
                &get,
                "IPPOOL_MAX_ABOVE_WATERMARK",
                defaults.discovery.max_above_watermark,
            )?,
            burstable_mehrfach_eni: parse_or(
                &get,
                "BURSTABLE_MEHRFACH_ENI",
                defaults.discovery.burstable_mehrfach_eni,
            )?,
            pre_allocate_eni: parse_or(&get, "ENI_PRE_ALLOCATE_NUM", defaults.discovery.pre_allocate_eni)?,
            subnet_ids: list(get("ENI_SUBNET_IDS")),
            security_groups: list(get("ENI_SECURITY_GROUP_IDS")),
            enterprise_security_groups: list(get("ENI_ENTERPRISE_SECURITY_GROUP_IDS")),
            route_table_offset: parse_or(&get, "ENI_ROUTE_TABLE_OFFSET", defaults.discovery.route_table_offset)?,
            use_mode,
            use_primary_address: parse_or(&get, "ENI_USE_PRIMARY_ADDRESS", defaults.discovery.use_primary_address)?,
            install_source_based_routing: parse_or(
                &get,
                "ENI_INSTALL_SOURCE_BASED_ROUTING",
                defaults.discovery.install_source_based_routing,
            )?,
            range_mode: parse_or(&get, "IPAM_RANGE_MODE", defaults.discovery.range_mode)?,
        };

        let config = Self {
            cloud_endpoint: get("CLOUD_ENDPOINT").unwrap_or(defaults.cloud_endpoint),
            cloud_token,
            cloud_region: get("CLOUD_REGION").unwrap_or(defaults.cloud_region),
            vpc_id,
            cloud_timeout: duration_or(&get, "CLOUD_TIMEOUT", defaults.cloud_timeout)?,
            flow_control,
            enable_ipv4: parse_or(&get, "ENABLE_IPV4", defaults.enable_ipv4)?,
            enable_ipv6: parse_or(&get, "ENABLE_IPV6", defaults.enable_ipv6)?,
            release_excess_ips: parse_or(&get, "RELEASE_EXCESS_IPS", defaults.release_excess_ips)?,
            excess_ip_release_delay: duration_or(
                &get,
                "EXCESS_IP_RELEASE_DELAY",
                defaults.excess_ip_release_delay,
            )?,
            resync_interval: duration_or(&get, "RESOURCE_RESYNC_INTERVAL", defaults.resync_interval)?,
            eni_resync_interval: duration_or(&get, "ENI_RESYNC_INTERVAL", defaults.eni_resync_interval)?,
            pool_maintenance_interval: duration_or(
                &get,
                "POOL_MAINTENANCE_INTERVAL",
                defaults.pool_maintenance_interval,
            )?,
            api_sync_interval: duration_or(&get, "API_SYNC_INTERVAL", defaults.api_sync_interval)?,
            customer_max_eni: parse_or(&get, "CUSTOMER_MAX_ENI", defaults.customer_max_eni)?,
            customer_max_ip: parse_or(&get, "CUSTOMER_MAX_IP", defaults.customer_max_ip)?,
            customer_max_rdma_ip: parse_or(&get, "CUSTOMER_MAX_RDMA_IP", defaults.customer_max_rdma_ip)?,
            default_pre_allocate: parse_or(&get, "DEFAULT_PRE_ALLOCATE", defaults.default_pre_allocate)?,
            discovery,
            metrics_addr: get("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
        };

        if !config.enable_ipv4 && !config.enable_ipv6 {
            return Err(ControllerError::InvalidConfig(
                "at least one of ENABLE_IPV4 and ENABLE_IPV6 must be true".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}

fn duration_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ControllerError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => humantime::parse_duration(raw.trim())
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}

fn list(raw: Option<String>) -> Vec<String> {
    raw.map(|r| {
        r.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| map.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [("CLOUD_TOKEN", "secret"), ("CLOUD_VPC_ID", "vpc-1")];

    #[test]
    fn test_defaults_with_required_values() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.vpc_id, "vpc-1");
        assert!(config.enable_ipv4);
        assert!(!config.enable_ipv6);
        assert_eq!(config.default_pre_allocate, DEFAULT_PRE_ALLOCATE);
        assert_eq!(config.excess_ip_release_delay, Duration::from_secs(180));
        assert!(config.flow_control.enabled);
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let err = load(&[("CLOUD_VPC_ID", "vpc-1")]).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_durations_use_humantime() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("EXCESS_IP_RELEASE_DELAY", "2m 30s"));
        vars.push(("API_TIMEOUT", "500ms"));
        let config = load(&vars).unwrap();
        assert_eq!(config.excess_ip_release_delay, Duration::from_secs(150));
        assert_eq!(config.flow_control.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("CUSTOMER_MAX_ENI", "eight"));
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("CUSTOMER_MAX_ENI"));
    }

    #[test]
    fn test_lists_and_use_mode() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ENI_SUBNET_IDS", "sbn-a, sbn-b,,"));
        vars.push(("ENI_USE_MODE", "primary-ip"));
        let config = load(&vars).unwrap();
        assert_eq!(config.discovery.subnet_ids, vec!["sbn-a", "sbn-b"]);
        assert_eq!(config.discovery.use_mode, EniUseMode::PrimaryIp);
    }

    #[test]
    fn test_both_families_disabled_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ENABLE_IPV4", "false"));
        assert!(load(&vars).is_err());
    }
}
