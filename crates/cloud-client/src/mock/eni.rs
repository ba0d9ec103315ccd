//! Interface and private IP operations for MockCloudClient

use super::{lock, MockCloudClient};
use crate::error::CloudError;
use crate::models::*;

pub async fn list_enis(client: &MockCloudClient, args: &ListEnisArgs) -> Result<Vec<Eni>, CloudError> {
    client.enter("ListENIs", &args.vpc_id, &[]).await?;
    let mut enis: Vec<Eni> = lock(&client.enis)
        .values()
        .filter(|e| args.vpc_id.is_empty() || e.vpc_id == args.vpc_id)
        .filter(|e| args.instance_id.as_ref().is_none_or(|id| &e.instance_id == id))
        .filter(|e| args.name.as_ref().is_none_or(|name| &e.name == name))
        .cloned()
        .collect();
    enis.sort_by(|a, b| a.eni_id.cmp(&b.eni_id));
    Ok(enis)
}

pub async fn stat_eni(client: &MockCloudClient, eni_id: &str) -> Result<Eni, CloudError> {
    client.enter("StatENI", eni_id, &[]).await?;
    lock(&client.enis)
        .get(eni_id)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("ENI {eni_id} not found")))
}

pub async fn create_eni(client: &MockCloudClient, args: &CreateEniArgs) -> Result<String, CloudError> {
    client.enter("CreateENI", &args.subnet_id, &[]).await?;
    let eni_id = format!("eni-{}", client.next_id());
    let mut private_ip_set = args.private_ip_set.clone();
    if private_ip_set.is_empty() {
        private_ip_set.push(CloudPrivateIp {
            private_ip_address: client.next_ipv4(),
            subnet_id: args.subnet_id.clone(),
            primary: true,
            ..Default::default()
        });
    }
    for ip in &mut private_ip_set {
        if ip.private_ip_address.is_empty() {
            ip.private_ip_address = client.next_ipv4();
        }
    }

    let eni = Eni {
        eni_id: eni_id.clone(),
        name: args.name.clone(),
        subnet_id: args.subnet_id.clone(),
        vpc_id: "vpc-test".to_string(),
        zone_name: "zoneA".to_string(),
        status: "available".to_string(),
        mac_address: format!("fa:16:3e:00:01:{:02x}", client.next_id() % 256),
        description: args.description.clone(),
        security_group_ids: args.security_group_ids.clone(),
        enterprise_security_group_ids: args.enterprise_security_group_ids.clone(),
        private_ip_set,
        ipv6_private_ip_set: args.ipv6_private_ip_set.clone(),
        ..Default::default()
    };
    client.add_eni(eni);
    Ok(eni_id)
}

pub async fn delete_eni(client: &MockCloudClient, eni_id: &str) -> Result<(), CloudError> {
    client.enter("DeleteENI", eni_id, &[]).await?;
    lock(&client.enis)
        .remove(eni_id)
        .map(|_| ())
        .ok_or_else(|| CloudError::EniNotFound(format!("ENI {eni_id} not found")))
}

pub async fn attach_eni(client: &MockCloudClient, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
    client.enter("AttachENI", eni_id, &[]).await?;
    let attach_status = lock(&client.attach_status).clone();
    let mut enis = lock(&client.enis);
    let eni = enis
        .get_mut(eni_id)
        .ok_or_else(|| CloudError::EniNotFound(format!("ENI {eni_id} not found")))?;
    if eni.status != "available" {
        return Err(CloudError::Api {
            status: 409,
            code: "EniStatusConflict".to_string(),
            message: format!("ENI {eni_id} is {}", eni.status),
        });
    }
    eni.instance_id = instance_id.to_string();
    eni.status = attach_status;
    Ok(())
}

pub async fn detach_eni(client: &MockCloudClient, instance_id: &str, eni_id: &str) -> Result<(), CloudError> {
    client.enter("DetachENI", eni_id, &[]).await?;
    let mut enis = lock(&client.enis);
    let eni = enis
        .get_mut(eni_id)
        .ok_or_else(|| CloudError::EniNotFound(format!("ENI {eni_id} not found")))?;
    if eni.instance_id != instance_id {
        return Err(CloudError::InvalidRequest(format!(
            "ENI {eni_id} is not attached to {instance_id}"
        )));
    }
    eni.instance_id.clear();
    eni.status = "available".to_string();
    Ok(())
}

pub async fn batch_add_private_ip(
    client: &MockCloudClient,
    private_ips: &[String],
    count: usize,
    eni_id: &str,
    subnet_id: Option<&str>,
    is_ipv6: bool,
) -> Result<Vec<String>, CloudError> {
    let operation = if subnet_id.is_some() {
        "BatchAddPrivateIpCrossSubnet"
    } else {
        "BatchAddPrivateIP"
    };
    client.enter(operation, eni_id, private_ips).await?;

    let addresses: Vec<String> = if private_ips.is_empty() {
        (0..count)
            .map(|_| {
                if is_ipv6 {
                    client.next_ipv6()
                } else {
                    client.next_ipv4()
                }
            })
            .collect()
    } else {
        private_ips.to_vec()
    };

    let mut enis = lock(&client.enis);
    let eni = enis
        .get_mut(eni_id)
        .ok_or_else(|| CloudError::EniNotFound(format!("ENI {eni_id} not found")))?;
    let subnet = subnet_id.map_or_else(|| eni.subnet_id.clone(), str::to_string);
    let set = if is_ipv6 {
        &mut eni.ipv6_private_ip_set
    } else {
        &mut eni.private_ip_set
    };
    for address in &addresses {
        set.push(CloudPrivateIp {
            private_ip_address: address.clone(),
            subnet_id: subnet.clone(),
            primary: false,
            ..Default::default()
        });
    }
    Ok(addresses)
}

pub async fn batch_delete_private_ip(
    client: &MockCloudClient,
    private_ips: &[String],
    eni_id: &str,
    is_ipv6: bool,
) -> Result<(), CloudError> {
    client.enter("BatchDeletePrivateIP", eni_id, private_ips).await?;
    let mut enis = lock(&client.enis);
    let eni = enis
        .get_mut(eni_id)
        .ok_or_else(|| CloudError::EniNotFound(format!("ENI {eni_id} not found")))?;
    let set = if is_ipv6 {
        &mut eni.ipv6_private_ip_set
    } else {
        &mut eni.private_ip_set
    };
    set.retain(|ip| !private_ips.contains(&ip.private_ip_address));
    Ok(())
}
