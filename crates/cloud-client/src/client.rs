//! Cloud API client
//!
//! Implements the VPC/ENI/instance REST API client. Requests are sent to a
//! configured endpoint with a bearer token; request signing is handled by the
//! endpoint (an API gateway or signing proxy).

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::models::*;

/// Error body returned by the cloud API
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEnisResponse {
    #[serde(default)]
    enis: Vec<Eni>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEniResponse {
    eni_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivateIpsResponse {
    #[serde(default)]
    private_ip_addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    instance: InstanceDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BccBatchAddIpResponse {
    #[serde(default)]
    private_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SubnetResponse {
    subnet: Subnet,
}

#[derive(Debug, Deserialize)]
struct ListSubnetsResponse {
    #[serde(default)]
    subnets: Vec<Subnet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEsgResponse {
    #[serde(default)]
    enterprise_security_groups: Vec<EnterpriseSecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRouteTableResponse {
    #[serde(default)]
    route_rules: Vec<RouteRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSecurityGroupsResponse {
    #[serde(default)]
    security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HpcEniListResponse {
    #[serde(default)]
    result: Vec<HpcEni>,
}

/// Cloud API client
#[derive(Debug, Clone)]
pub struct CloudClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl CloudClient {
    /// Create a new cloud client
    ///
    /// # Arguments
    /// * `endpoint` - API endpoint (e.g., `https://bcc.bj.baidubce.com`)
    /// * `token` - Bearer token for authentication
    /// * `timeout` - Per-request timeout
    pub fn new(endpoint: String, token: String, timeout: Duration) -> Result<Self, CloudError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.endpoint, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
    }

    /// Turn a non-success response into a typed error
    async fn check(response: Response, context: &str) -> Result<Response, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = if parsed.message.is_empty() {
            format!("{context}: {body}")
        } else {
            format!("{context}: {}", parsed.message)
        };
        Err(CloudError::from_api(status.as_u16(), parsed.code, message))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        context: &str,
    ) -> Result<T, CloudError> {
        debug!("{}", context);
        let response = Self::check(builder.send().await?, context).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| CloudError::Api {
            status: 200,
            code: "DecodeError".to_string(),
            message: format!(
                "{context}: error decoding response body: {e} - Response (first 500 chars): {}",
                text.chars().take(500).collect::<String>()
            ),
        })
    }

    async fn send_empty(&self, builder: RequestBuilder, context: &str) -> Result<(), CloudError> {
        debug!("{}", context);
        Self::check(builder.send().await?, context).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CloudClientTrait for CloudClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_enis(&self, args: &ListEnisArgs) -> Result<Vec<Eni>, CloudError> {
        let builder = self.request(Method::GET, "/v1/eni").query(args);
        let response: ListEnisResponse = self
            .send_json(builder, &format!("list ENIs of vpc {}", args.vpc_id))
            .await?;
        Ok(response.enis)
    }

    async fn stat_eni(&self, eni_id: &str) -> Result<Eni, CloudError> {
        let builder = self.request(Method::GET, &format!("/v1/eni/{eni_id}"));
        self.send_json(builder, &format!("stat ENI {eni_id}")).await
    }

    async fn create_eni(&self, args: &CreateEniArgs) -> Result<String, CloudError> {
        let builder = self
            .request(Method::POST, "/v1/eni")
            .query(&[("clientToken", uuid::Uuid::new_v4().to_string())])
            .json(args);
        let response: CreateEniResponse = self
            .send_json(builder, &format!("create ENI {} in subnet {}", args.name, args.subnet_id))
            .await?;
        Ok(response.eni_id)
    }

    async fn delete_eni(&self, eni_id: &str) -> Result<(), CloudError> {
        let builder = self.request(Method::DELETE, &format!("/v1/eni/{eni_id}"));
        self.send_empty(builder, &format!("delete ENI {eni_id}")).await
    }

    async fn attach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, &format!("/v1/eni/{eni_id}"))
            .query(&[("attach", "")])
            .json(&json!({ "instanceId": instance_id }));
        self.send_empty(builder, &format!("attach ENI {eni_id} to instance {instance_id}"))
            .await
    }

    async fn detach_eni(&self, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, &format!("/v1/eni/{eni_id}"))
            .query(&[("detach", "")])
            .json(&json!({ "instanceId": instance_id }));
        self.send_empty(builder, &format!("detach ENI {eni_id} from instance {instance_id}"))
            .await
    }

    async fn batch_add_private_ip(
        &self,
        private_ips: &[String],
        count: usize,
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<Vec<String>, CloudError> {
        let builder = self
            .request(Method::POST, &format!("/v1/eni/{eni_id}/privateIp/batchAdd"))
            .json(&json!({
                "privateIpAddresses": private_ips,
                "privateIpAddressCount": count,
                "isIpv6": is_ipv6,
            }));
        let response: PrivateIpsResponse = self
            .send_json(builder, &format!("batch add {count} private IPs to ENI {eni_id}"))
            .await?;
        Ok(response.private_ip_addresses)
    }

    async fn batch_delete_private_ip(
        &self,
        private_ips: &[String],
        eni_id: &str,
        is_ipv6: bool,
    ) -> Result<(), CloudError> {
        let builder = self
            .request(Method::POST, &format!("/v1/eni/{eni_id}/privateIp/batchDel"))
            .json(&json!({
                "privateIpAddresses": private_ips,
                "isIpv6": is_ipv6,
            }));
        self.send_empty(
            builder,
            &format!("batch delete {} private IPs from ENI {eni_id}", private_ips.len()),
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
        let ips: Vec<_> = private_ips
            .iter()
            .map(|ip| json!({ "subnetId": subnet_id, "privateIpAddress": ip }))
            .collect();
        let builder = self
            .request(
                Method::POST,
                &format!("/v1/eni/{eni_id}/privateIp/batchAddByCrossSubnet"),
            )
            .json(&json!({
                "subnetId": subnet_id,
                "privateIpArgs": ips,
                "privateIpAddressCount": count,
                "isIpv6": is_ipv6,
            }));
        let response: PrivateIpsResponse = self
            .send_json(
                builder,
                &format!("batch add {count} private IPs from subnet {subnet_id} to ENI {eni_id}"),
            )
            .await?;
        Ok(response.private_ip_addresses)
    }

    async fn get_bcc_instance_detail(&self, instance_id: &str) -> Result<InstanceDetail, CloudError> {
        let builder = self.request(Method::GET, &format!("/v2/instance/{instance_id}"));
        let response: InstanceResponse = self
            .send_json(builder, &format!("get instance {instance_id}"))
            .await?;
        Ok(response.instance)
    }

    async fn bcc_batch_add_ip(&self, args: &BccBatchAddIpArgs) -> Result<Vec<String>, CloudError> {
        let builder = self
            .request(Method::PUT, "/v2/instance/batchAddIp")
            .json(args);
        let response: BccBatchAddIpResponse = self
            .send_json(
                builder,
                &format!(
                    "batch add {} IPs to instance {}",
                    args.secondary_private_ip_address_count, args.instance_id
                ),
            )
            .await?;
        Ok(response.private_ips)
    }

    async fn bcc_batch_del_ip(&self, instance_id: &str, private_ips: &[String]) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, "/v2/instance/batchDelIp")
            .json(&json!({ "instanceId": instance_id, "privateIps": private_ips }));
        self.send_empty(
            builder,
            &format!("batch delete {} IPs from instance {instance_id}", private_ips.len()),
        )
        .await
    }

    async fn list_enterprise_security_groups(
        &self,
        instance_id: &str,
    ) -> Result<Vec<EnterpriseSecurityGroup>, CloudError> {
        let builder = self
            .request(Method::GET, "/v1/enterprise/security")
            .query(&[("instanceId", instance_id)]);
        let response: ListEsgResponse = self
            .send_json(builder, &format!("list enterprise security groups of {instance_id}"))
            .await?;
        Ok(response.enterprise_security_groups)
    }

    async fn describe_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        let builder = self.request(Method::GET, &format!("/v1/subnet/{subnet_id}"));
        let response: SubnetResponse = self
            .send_json(builder, &format!("describe subnet {subnet_id}"))
            .await?;
        Ok(response.subnet)
    }

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>, CloudError> {
        let builder = self
            .request(Method::GET, "/v1/subnet")
            .query(&[("vpcId", vpc_id)]);
        let response: ListSubnetsResponse = self
            .send_json(builder, &format!("list subnets of vpc {vpc_id}"))
            .await?;
        Ok(response.subnets)
    }

    async fn list_route_table(&self, vpc_id: &str, route_table_id: &str) -> Result<Vec<RouteRule>, CloudError> {
        let mut query = vec![("vpcId", vpc_id)];
        if !route_table_id.is_empty() {
            query.push(("routeTableId", route_table_id));
        }
        let builder = self.request(Method::GET, "/v1/route").query(&query);
        let response: ListRouteTableResponse = self
            .send_json(builder, &format!("list route table of vpc {vpc_id}"))
            .await?;
        Ok(response.route_rules)
    }

    async fn list_security_groups(&self, vpc_id: &str, instance_id: &str) -> Result<Vec<SecurityGroup>, CloudError> {
        let builder = self
            .request(Method::GET, "/v2/securityGroup")
            .query(&[("vpcId", vpc_id), ("instanceId", instance_id)]);
        let response: ListSecurityGroupsResponse = self
            .send_json(builder, &format!("list security groups of {instance_id}"))
            .await?;
        Ok(response.security_groups)
    }

    async fn bind_eni_public_ip(&self, private_ip: &str, public_ip: &str, eni_id: &str) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, &format!("/v1/eni/{eni_id}"))
            .query(&[("bind", "")])
            .json(&json!({ "privateIpAddress": private_ip, "publicIpAddress": public_ip }));
        self.send_empty(builder, &format!("bind EIP {public_ip} to {private_ip} on ENI {eni_id}"))
            .await
    }

    async fn unbind_eni_public_ip(&self, public_ip: &str, eni_id: &str) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, &format!("/v1/eni/{eni_id}"))
            .query(&[("unBind", "")])
            .json(&json!({ "publicIpAddress": public_ip }));
        self.send_empty(builder, &format!("unbind EIP {public_ip} from ENI {eni_id}"))
            .await
    }

    async fn direct_eip(&self, eip: &str) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, &format!("/v1/eip/{eip}"))
            .query(&[("direct", "")]);
        self.send_empty(builder, &format!("direct EIP {eip}")).await
    }

    async fn undirect_eip(&self, eip: &str) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, &format!("/v1/eip/{eip}"))
            .query(&[("unDirect", "")]);
        self.send_empty(builder, &format!("undirect EIP {eip}")).await
    }

    async fn get_hpc_eni_id(&self, instance_id: &str) -> Result<Vec<HpcEni>, CloudError> {
        let builder = self
            .request(Method::GET, "/v1/eni/hpc/eniId")
            .query(&[("instanceId", instance_id)]);
        let response: HpcEniListResponse = self
            .send_json(builder, &format!("get HPC ENIs of instance {instance_id}"))
            .await?;
        Ok(response.result)
    }

    async fn batch_add_hpc_eni_private_ip(
        &self,
        eni_id: &str,
        private_ips: &[String],
        count: usize,
    ) -> Result<Vec<String>, CloudError> {
        let builder = self
            .request(Method::POST, "/v1/eni/hpc/batchAddPrivateIp")
            .json(&json!({
                "eniId": eni_id,
                "privateIpAddresses": private_ips,
                "privateIpAddressCount": count,
            }));
        let response: PrivateIpsResponse = self
            .send_json(builder, &format!("batch add {count} private IPs to HPC ENI {eni_id}"))
            .await?;
        Ok(response.private_ip_addresses)
    }

    async fn batch_delete_hpc_eni_private_ip(&self, eni_id: &str, private_ips: &[String]) -> Result<(), CloudError> {
        let builder = self
            .request(Method::POST, "/v1/eni/hpc/batchDelPrivateIp")
            .json(&json!({ "eniId": eni_id, "privateIpAddresses": private_ips }));
        self.send_empty(
            builder,
            &format!("batch delete {} private IPs from HPC ENI {eni_id}", private_ips.len()),
        )
        .await
    }
}
