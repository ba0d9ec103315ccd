//! Route table, security group and EIP operations for MockCloudClient

use super::{lock, MockCloudClient};
use crate::error::CloudError;
use crate::models::*;

pub async fn list_route_table(
    client: &MockCloudClient,
    vpc_id: &str,
    route_table_id: &str,
) -> Result<Vec<RouteRule>, CloudError> {
    client.enter("ListRouteTable", vpc_id, &[]).await?;
    Ok(lock(&client.route_rules)
        .get(vpc_id)
        .into_iter()
        .flatten()
        .filter(|r| route_table_id.is_empty() || r.route_table_id == route_table_id)
        .cloned()
        .collect())
}

pub async fn list_security_groups(
    client: &MockCloudClient,
    vpc_id: &str,
    instance_id: &str,
) -> Result<Vec<SecurityGroup>, CloudError> {
    client.enter("ListSecurityGroup", instance_id, &[]).await?;
    Ok(lock(&client.security_groups)
        .get(instance_id)
        .into_iter()
        .flatten()
        .filter(|g| vpc_id.is_empty() || g.vpc_id == vpc_id)
        .cloned()
        .collect())
}

pub async fn bind_eni_public_ip(
    client: &MockCloudClient,
    private_ip: &str,
    public_ip: &str,
    eni_id: &str,
) -> Result<(), CloudError> {
    client
        .enter("BindENIPublicIP", eni_id, &[private_ip.to_string(), public_ip.to_string()])
        .await?;
    let mut enis = lock(&client.enis);
    let eni = enis
        .get_mut(eni_id)
        .ok_or_else(|| CloudError::EniNotFound(format!("ENI {eni_id} not found")))?;
    let ip = eni
        .private_ip_set
        .iter_mut()
        .find(|ip| ip.private_ip_address == private_ip)
        .ok_or_else(|| CloudError::NotFound(format!("{private_ip} is not on ENI {eni_id}")))?;
    ip.public_ip_address = Some(public_ip.to_string());
    Ok(())
}

pub async fn unbind_eni_public_ip(client: &MockCloudClient, public_ip: &str, eni_id: &str) -> Result<(), CloudError> {
    client
        .enter("UnBindENIPublicIP", eni_id, &[public_ip.to_string()])
        .await?;
    let mut enis = lock(&client.enis);
    let eni = enis
        .get_mut(eni_id)
        .ok_or_else(|| CloudError::EniNotFound(format!("ENI {eni_id} not found")))?;
    for ip in &mut eni.private_ip_set {
        if ip.public_ip_address.as_deref() == Some(public_ip) {
            ip.public_ip_address = None;
        }
    }
    lock(&client.direct_eips).remove(public_ip);
    Ok(())
}

fn is_bound(client: &MockCloudClient, eip: &str) -> bool {
    lock(&client.enis)
        .values()
        .flat_map(|e| &e.private_ip_set)
        .any(|ip| ip.public_ip_address.as_deref() == Some(eip))
}

pub async fn direct_eip(client: &MockCloudClient, eip: &str) -> Result<(), CloudError> {
    client.enter("DirectEIP", eip, &[]).await?;
    if !is_bound(client, eip) {
        return Err(CloudError::NotFound(format!("EIP {eip} is not bound")));
    }
    lock(&client.direct_eips).insert(eip.to_string());
    Ok(())
}

pub async fn undirect_eip(client: &MockCloudClient, eip: &str) -> Result<(), CloudError> {
    client.enter("UnDirectEIP", eip, &[]).await?;
    if !lock(&client.direct_eips).remove(eip) {
        return Err(CloudError::NotFound(format!("EIP {eip} is not in direct mode")));
    }
    Ok(())
}
