//! CloudClientTrait for mocking and flow control
//!
//! The concrete [`CloudClient`](crate::CloudClient), the rate limited
//! [`FlowControlClient`](crate::FlowControlClient) and the test mock all
//! implement this trait, so callers only ever hold a `dyn CloudClientTrait`.

use crate::error::CloudError;
use crate::models::*;

/// Trait for cloud API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait CloudClientTrait: Send + Sync {
    /// Get the API endpoint
    fn endpoint(&self) -> &str;

    // ENI Operations
    async fn list_enis(&self, args: &ListEnisArgs) -> Result<Vec<Eni>, CloudError>;
    async fn stat_eni(&self, eni_id: &str) -> Result<Eni, CloudError>;
    async fn create_eni(&self, args: &CreateEniArgs) -> Result<String, CloudError>;
    async fn delete_eni(&self, eni_id: &str) -> Result<(), CloudError>;
    async fn attach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError>;
    async fn detach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError>;

    // Private IP Operations
    async fn batch_add_private_ip(
        &self,
        private_ips: &[String],
        count: usize,
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<Vec<String>, CloudError>;
    async fn batch_delete_private_ip(
        &self,
        private_ips: &[String],
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<(), CloudError>;
    async fn batch_add_private_ip_cross_subnet(
        &self,
        eni_id: &str,
        subnet_id: &str,
        private_ips: &[String],
        count: usize,
        is_ipv6: bool,
    ) -> Result<Vec<String>, CloudError>;

    // Instance Operations
    async fn get_bcc_instance_detail(&self, instance_id: &str) -> Result<InstanceDetail, CloudError>;
    async fn bcc_batch_add_ip(&self, args: &BccBatchAddIpArgs) -> Result<Vec<String>, CloudError>;
    async fn bcc_batch_del_ip(&self, instance_id: &str, private_ips: &[String]) -> Result<(), CloudError>;
    async fn list_enterprise_security_groups(
        &self,
        instance_id: &str,
    ) -> Result<Vec<EnterpriseSecurityGroup>, CloudError>;

    // Subnet Operations
    async fn describe_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError>;
    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>, CloudError>;

    // VPC Operations
    async fn list_route_table(&self, vpc_id: &str, route_table_id: &str) -> Result<Vec<RouteRule>, CloudError>;
    async fn list_security_groups(&self, vpc_id: &str, instance_id: &str) -> Result<Vec<SecurityGroup>, CloudError>;

    // EIP Operations
    async fn bind_eni_public_ip(&self, private_ip: &str, public_ip: &str, eni_id: &str) -> Result<(), CloudError>;
    async fn unbind_eni_public_ip(&self, public_ip: &str, eni_id: &str) -> Result<(), CloudError>;
    /// Route the EIP straight to the address it is bound to
    async fn direct_eip(&self, eip: &str) -> Result<(), CloudError>;
    async fn undirect_eip(&self, eip: &str) -> Result<(), CloudError>;

    // HPC (RDMA) Operations
    async fn get_hpc_eni_id(&self, instance_id: &str) -> Result<Vec<HpcEni>, CloudError>;
    async fn batch_add_hpc_eni_private_ip(
        &self,
        eni_id: &str,
        private_ips: &[String],
        count: usize,
    ) -> Result<Vec<String>, CloudError>;
    async fn batch_delete_hpc_eni_private_ip(&self, eni_id: &str, private_ips: &[String]) -> Result<(), CloudError>;
}
