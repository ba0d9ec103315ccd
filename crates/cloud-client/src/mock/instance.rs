//! Instance, subnet and security group operations for MockCloudClient

use super::{lock, MockCloudClient};
use crate::error::CloudError;
use crate::models::*;

pub async fn get_bcc_instance_detail(client: &MockCloudClient, instance_id: &str) -> Result<InstanceDetail, CloudError> {
    client.enter("GetBCCInstanceDetail", instance_id, &[]).await?;
    lock(&client.instances)
        .get(instance_id)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id} not found")))
}

pub async fn bcc_batch_add_ip(client: &MockCloudClient, args: &BccBatchAddIpArgs) -> Result<Vec<String>, CloudError> {
    client.enter("BCCBatchAddIP", &args.instance_id, &args.private_ips).await?;

    let mut v4: Vec<String> = args.private_ips.clone();
    while v4.len() < args.secondary_private_ip_address_count {
        v4.push(client.next_ipv4());
    }
    let v6: Vec<String> = if args.allocate_multi_ipv6_addr {
        v4.iter().map(|_| client.next_ipv6()).collect()
    } else {
        Vec::new()
    };

    let mut instances = lock(&client.instances);
    let instance = instances
        .get_mut(&args.instance_id)
        .ok_or_else(|| CloudError::NotFound(format!("instance {} not found", args.instance_id)))?;
    for ip in &v4 {
        instance.nic_info.ips.push(NicIp {
            private_ip: ip.clone(),
            ..Default::default()
        });
    }
    for ip in &v6 {
        instance.nic_info.ipv6s.push(NicIp {
            private_ip: ip.clone(),
            ..Default::default()
        });
    }
    Ok(v4.into_iter().chain(v6).collect())
}

pub async fn bcc_batch_del_ip(client: &MockCloudClient, instance_id: &str, private_ips: &[String]) -> Result<(), CloudError> {
    client.enter("BCCBatchDelIP", instance_id, private_ips).await?;
    let mut instances = lock(&client.instances);
    let instance = instances
        .get_mut(instance_id)
        .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id} not found")))?;
    instance.nic_info.ips.retain(|ip| !private_ips.contains(&ip.private_ip));
    instance.nic_info.ipv6s.retain(|ip| !private_ips.contains(&ip.private_ip));
    Ok(())
}

pub async fn list_enterprise_security_groups(
    client: &MockCloudClient,
    instance_id: &str,
) -> Result<Vec<EnterpriseSecurityGroup>, CloudError> {
    client.enter("ListEnterpriseSecurityGroups", instance_id, &[]).await?;
    Ok(lock(&client.esgs)
        .get(instance_id)
        .cloned()
        .unwrap_or_default())
}

pub async fn describe_subnet(client: &MockCloudClient, subnet_id: &str) -> Result<Subnet, CloudError> {
    client.enter("DescribeSubnet", subnet_id, &[]).await?;
    lock(&client.subnets)
        .get(subnet_id)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("subnet {subnet_id} not found")))
}

pub async fn list_subnets(client: &MockCloudClient, vpc_id: &str) -> Result<Vec<Subnet>, CloudError> {
    client.enter("ListSubnets", vpc_id, &[]).await?;
    let mut subnets: Vec<Subnet> = lock(&client.subnets)
        .values()
        .filter(|s| vpc_id.is_empty() || s.vpc_id == vpc_id)
        .cloned()
        .collect();
    subnets.sort_by(|a, b| a.subnet_id.cmp(&b.subnet_id));
    Ok(subnets)
}
