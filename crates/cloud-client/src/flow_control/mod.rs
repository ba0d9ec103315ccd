//! Rate limited gateway in front of the cloud API
//!
//! [`FlowControlClient`] wraps any [`CloudClientTrait`] implementation and
//! routes every call through the limiter of its operation. With rate
//! limiting disabled every call passes straight through.

pub mod limiter;
pub mod operations;

use std::future::Future;
use std::time::Duration;

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::models::*;

pub use limiter::{ApiLimiter, ApiLimiterSet, LimitedRequest, LimiterMetrics, LimiterParameters, LimiterStats};

/// Settings of the gateway
#[derive(Debug, Clone)]
pub struct FlowControlConfig {
    /// Route calls through the limiters
    pub enabled: bool,
    /// Per-operation overrides, `Op=key:value,...;Op2=...`
    pub overrides: String,
    /// Fallback rate for operations without an entry
    pub qps: f64,
    /// Fallback burst (also the fallback parallelism)
    pub burst: u32,
    /// Fallback maximum wait
    pub timeout: Duration,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides: String::new(),
            qps: 5.0,
            burst: 10,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Cloud client that rate limits every operation
#[derive(Debug)]
pub struct FlowControlClient<C> {
    inner: C,
    limiters: ApiLimiterSet,
    enabled: bool,
}

impl<C: CloudClientTrait> FlowControlClient<C> {
    /// Wrap `inner`. Fails if the override configuration is malformed.
    pub fn new(inner: C, config: &FlowControlConfig, metrics: Option<LimiterMetrics>) -> Result<Self, CloudError> {
        let fallback = LimiterParameters {
            rate_limit: config.qps,
            rate_burst: config.burst,
            max_parallel_requests: usize::try_from(config.burst).unwrap_or(usize::MAX),
            max_wait_duration: config.timeout,
            log: false,
        };
        let limiters = ApiLimiterSet::new(
            operations::default_parameters(),
            &config.overrides,
            fallback,
            metrics,
        )?;
        Ok(Self {
            inner,
            limiters,
            enabled: config.enabled,
        })
    }

    /// The wrapped client
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// The limiters, for inspection
    pub fn limiters(&self) -> &ApiLimiterSet {
        &self.limiters
    }

    async fn limited<T, F>(&self, operation: &str, call: F) -> Result<T, CloudError>
    where
        F: Future<Output = Result<T, CloudError>> + Send,
    {
        if !self.enabled {
            return call.await;
        }

        let request = self.limiters.wait(operation).await?;
        match call.await {
            Ok(value) => {
                request.done();
                Ok(value)
            }
            Err(err) => {
                request.error(&err);
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl<C: CloudClientTrait> CloudClientTrait for FlowControlClient<C> {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn list_enis(&self, args: &ListEnisArgs) -> Result<Vec<Eni>, CloudError> {
        self.limited(operations::LIST_ENIS, self.inner.list_enis(args)).await
    }

    async fn stat_eni(&self, eni_id: &str) -> Result<Eni, CloudError> {
        self.limited(operations::STAT_ENI, self.inner.stat_eni(eni_id)).await
    }

    async fn create_eni(&self, args: &CreateEniArgs) -> Result<String, CloudError> {
        self.limited(operations::CREATE_ENI, self.inner.create_eni(args)).await
    }

    async fn delete_eni(&self, eni_id: &str) -> Result<(), CloudError> {
        self.limited(operations::DELETE_ENI, self.inner.delete_eni(eni_id)).await
    }

    async fn attach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
        self.limited(operations::ATTACH_ENI, self.inner.attach_eni(instance_id, eni_id))
            .await
    }

    async fn detach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
        self.limited(operations::DETACH_ENI, self.inner.detach_eni(instance_id, eni_id))
            .await
    }

    async fn batch_add_private_ip(
        &self,
        private_ips: &[String],
        count: usize,
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<Vec<String>, CloudError> {
        self.limited(
            operations::BATCH_ADD_PRIVATE_IP,
            self.inner.batch_add_private_ip(private_ips, count, eni_id, is_ipv6),
        )
        .await
    }

    async fn batch_delete_private_ip(
        &self,
        private_ips: &[String],
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<(), CloudError> {
        self.limited(
            operations::BATCH_DELETE_PRIVATE_IP,
            self.inner.batch_delete_private_ip(private_ips, eni_id, is_ipv6),
        )
        .await
    }

    async fn batch_add_private_ip_cross_subnet(
        &self,
        eni_id: &str,
        subnet_id: &str,
        private_ips: &[String],
        count: usize,
        is_ipv6: bool,
    ) -> Result<Vec<String>, CloudError> {
        self.limited(
            operations::BATCH_ADD_PRIVATE_IP_CROSS_SUBNET,
            self.inner
                .batch_add_private_ip_cross_subnet(eni_id, subnet_id, private_ips, count, is_ipv6),
        )
        .await
    }

    async fn get_bcc_instance_detail(&self, instance_id: &str) -> Result<InstanceDetail, CloudError> {
        self.limited(
            operations::GET_BCC_INSTANCE_DETAIL,
            self.inner.get_bcc_instance_detail(instance_id),
        )
        .await
    }

    async fn bcc_batch_add_ip(&self, args: &BccBatchAddIpArgs) -> Result<Vec<String>, CloudError> {
        self.limited(operations::BCC_BATCH_ADD_IP, self.inner.bcc_batch_add_ip(args))
            .await
    }

    async fn bcc_batch_del_ip(&self, instance_id: &str, private_ips: &[String]) -> Result<(), CloudError> {
        self.limited(
            operations::BCC_BATCH_DEL_IP,
            self.inner.bcc_batch_del_ip(instance_id, private_ips),
        )
        .await
    }

    async fn list_enterprise_security_groups(
        &self,
        instance_id: &str,
    ) -> Result<Vec<EnterpriseSecurityGroup>, CloudError> {
        self.limited(
            operations::LIST_ENTERPRISE_SECURITY_GROUPS,
            self.inner.list_enterprise_security_groups(instance_id),
        )
        .await
    }

    async fn describe_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        self.limited(operations::DESCRIBE_SUBNET, self.inner.describe_subnet(subnet_id))
            .await
    }

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>, CloudError> {
        self.limited(operations::LIST_SUBNETS, self.inner.list_subnets(vpc_id))
            .await
    }

    async fn list_route_table(&self, vpc_id: &str, route_table_id: &str) -> Result<Vec<RouteRule>, CloudError> {
        self.limited(
            operations::LIST_ROUTE_TABLE,
            self.inner.list_route_table(vpc_id, route_table_id),
        )
        .await
    }

    async fn list_security_groups(&self, vpc_id: &str, instance_id: &str) -> Result<Vec<SecurityGroup>, CloudError> {
        self.limited(
            operations::LIST_SECURITY_GROUP,
            self.inner.list_security_groups(vpc_id, instance_id),
        )
        .await
    }

    async fn bind_eni_public_ip(&self, private_ip: &str, public_ip: &str, eni_id: &str) -> Result<(), CloudError> {
        self.limited(
            operations::BIND_ENI_PUBLIC_IP,
            self.inner.bind_eni_public_ip(private_ip, public_ip, eni_id),
        )
        .await
    }

    async fn unbind_eni_public_ip(&self, public_ip: &str, eni_id: &str) -> Result<(), CloudError> {
        self.limited(
            operations::UNBIND_ENI_PUBLIC_IP,
            self.inner.unbind_eni_public_ip(public_ip, eni_id),
        )
        .await
    }

    async fn direct_eip(&self, eip: &str) -> Result<(), CloudError> {
        self.limited(operations::DIRECT_EIP, self.inner.direct_eip(eip)).await
    }

    async fn undirect_eip(&self, eip: &str) -> Result<(), CloudError> {
        self.limited(operations::UNDIRECT_EIP, self.inner.undirect_eip(eip)).await
    }

    async fn get_hpc_eni_id(&self, instance_id: &str) -> Result<Vec<HpcEni>, CloudError> {
        self.limited(operations::GET_HPC_ENI_ID, self.inner.get_hpc_eni_id(instance_id))
            .await
    }

    async fn batch_add_hpc_eni_private_ip(
        &self,
        eni_id: &str,
        private_ips: &[String],
        count: usize,
    ) -> Result<Vec<String>, CloudError> {
        self.limited(
            operations::BATCH_ADD_HPC_ENI_PRIVATE_IP,
            self.inner.batch_add_hpc_eni_private_ip(eni_id, private_ips, count),
        )
        .await
    }

    async fn batch_delete_hpc_eni_private_ip(&self, eni_id: &str, private_ips: &[String]) -> Result<(), CloudError> {
        self.limited(
            operations::BATCH_DELETE_HPC_ENI_PRIVATE_IP,
            self.inner.batch_delete_hpc_eni_private_ip(eni_id, private_ips),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::{InjectedFailure, MockCloudClient};

    fn gateway(mock: MockCloudClient, enabled: bool, overrides: &str) -> Arc<FlowControlClient<MockCloudClient>> {
        let config = FlowControlConfig {
            enabled,
            overrides: overrides.to_string(),
            ..FlowControlConfig::default()
        };
        Arc::new(FlowControlClient::new(mock, &config, None).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_eni_calls_are_serialized() {
        let mock = MockCloudClient::new("http://cloud.test");
        mock.add_eni(MockCloudClient::eni("eni-a", "sbn-1", "available"));
        mock.add_eni(MockCloudClient::eni("eni-b", "sbn-1", "available"));
        mock.set_latency(Duration::from_secs(3));
        let client = gateway(mock.clone(), true, "DeleteENI=rate-limit:100,rate-burst:10");

        let start = tokio::time::Instant::now();
        let a = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.delete_eni("eni-a").await }
        });
        let b = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.delete_eni("eni-b").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert!(start.elapsed() >= Duration::from_secs(6), "one slot means back to back calls");
        assert_eq!(client.limiters().limiter("DeleteENI").stats().done, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_table_listing_is_serialized() {
        let mock = MockCloudClient::new("http://cloud.test");
        mock.add_route_rule(
            "vpc-test",
            RouteRule {
                route_rule_id: "rr-1".to_string(),
                route_table_id: "rt-1".to_string(),
                destination_address: "172.16.0.0/24".to_string(),
                next_hop_id: "i-node-1".to_string(),
                next_hop_type: "custom".to_string(),
                ..Default::default()
            },
        );
        mock.set_latency(Duration::from_secs(3));
        let client = gateway(mock.clone(), true, "ListRouteTable=rate-limit:100,rate-burst:10");

        let start = tokio::time::Instant::now();
        let a = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.list_route_table("vpc-test", "rt-1").await }
        });
        let b = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.list_route_table("vpc-test", "").await }
        });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert!(start.elapsed() >= Duration::from_secs(6), "one slot means back to back calls");
        assert_eq!(a, b);
        assert_eq!(a[0].next_hop_id, "i-node-1");
        assert_eq!(client.limiters().limiter("ListRouteTable").stats().done, 2);
        assert_eq!(mock.calls_of("ListRouteTable").len(), 2);
    }

    #[tokio::test]
    async fn test_eip_calls_use_their_own_limiters() {
        let mock = MockCloudClient::new("http://cloud.test");
        let eni = MockCloudClient::eni("eni-a", "sbn-1", "inuse");
        let private_ip = eni.private_ip_set[0].private_ip_address.clone();
        mock.add_eni(eni);
        let client = gateway(mock.clone(), true, "");

        client.bind_eni_public_ip(&private_ip, "100.88.0.1", "eni-a").await.unwrap();
        client.direct_eip("100.88.0.1").await.unwrap();
        assert!(mock.is_eip_direct("100.88.0.1"));

        client.unbind_eni_public_ip("100.88.0.1", "eni-a").await.unwrap();
        assert!(!mock.is_eip_direct("100.88.0.1"));
        assert_eq!(mock.get_eni("eni-a").unwrap().private_ip_set[0].public_ip_address, None);

        let err = client.undirect_eip("100.88.0.1").await.unwrap_err();
        assert!(err.is_not_found());

        for (operation, done, errors) in [
            ("BindENIPublicIP", 1, 0),
            ("DirectEIP", 1, 0),
            ("UnBindENIPublicIP", 1, 0),
            ("UnDirectEIP", 0, 1),
        ] {
            let limiter = client.limiters().limiter(operation);
            assert_eq!(limiter.name(), operation);
            assert_eq!((limiter.stats().done, limiter.stats().errors), (done, errors), "{operation}");
        }
    }

    #[tokio::test]
    async fn test_hpc_private_ip_calls() {
        let mock = MockCloudClient::new("http://cloud.test");
        mock.set_hpc_enis(
            "i-hpc-1",
            vec![HpcEni {
                eni_id: "eni-rdma-1".to_string(),
                status: "inuse".to_string(),
                private_ip_set: vec![CloudPrivateIp {
                    private_ip_address: "10.9.0.2".to_string(),
                    primary: true,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        );
        let client = gateway(mock.clone(), true, "");

        let enis = client.get_hpc_eni_id("i-hpc-1").await.unwrap();
        assert_eq!(enis.len(), 1);

        let added = client
            .batch_add_hpc_eni_private_ip("eni-rdma-1", &[], 2)
            .await
            .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(mock.hpc_enis("i-hpc-1")[0].private_ip_set.len(), 3);

        client
            .batch_delete_hpc_eni_private_ip("eni-rdma-1", &[added[0].clone()])
            .await
            .unwrap();
        let remaining: Vec<String> = mock.hpc_enis("i-hpc-1")[0]
            .private_ip_set
            .iter()
            .map(|ip| ip.private_ip_address.clone())
            .collect();
        assert_eq!(remaining, vec!["10.9.0.2".to_string(), added[1].clone()]);

        let err = client.get_hpc_eni_id("i-plain-1").await.unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(client.limiters().limiter("GetHPCEniID").parameters().max_wait_duration, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_gateway_passes_through() {
        let mock = MockCloudClient::new("http://cloud.test");
        mock.add_eni(MockCloudClient::eni("eni-a", "sbn-1", "available"));
        mock.add_eni(MockCloudClient::eni("eni-b", "sbn-1", "available"));
        mock.set_latency(Duration::from_secs(3));
        let client = gateway(mock, false, "");

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(client.delete_eni("eni-a"), client.delete_eni("eni-b"));
        a.unwrap();
        b.unwrap();

        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(client.limiters().limiter("DeleteENI").stats().done, 0);
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_returned_unchanged() {
        let mock = MockCloudClient::new("http://cloud.test");
        mock.fail_next("StatENI", InjectedFailure::NotFound);
        let client = gateway(mock, true, "");

        let err = client.stat_eni("eni-missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(client.limiters().limiter("StatENI").stats().errors, 1);
    }

    #[test]
    fn test_malformed_overrides_fail_construction() {
        let config = FlowControlConfig {
            overrides: "DeleteENI=rate-limit:-1".to_string(),
            ..FlowControlConfig::default()
        };
        let result = FlowControlClient::new(MockCloudClient::new("http://cloud.test"), &config, None);
        assert!(matches!(result, Err(CloudError::InvalidLimiterConfig(_))));
    }
}
