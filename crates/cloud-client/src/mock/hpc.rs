//! HPC (RDMA) interface operations for MockCloudClient

use super::{lock, MockCloudClient};
use crate::error::CloudError;
use crate::models::*;

pub async fn get_hpc_eni_id(client: &MockCloudClient, instance_id: &str) -> Result<Vec<HpcEni>, CloudError> {
    client.enter("GetHPCEniID", instance_id, &[]).await?;
    lock(&client.hpc_enis)
        .get(instance_id)
        .cloned()
        .ok_or_else(|| CloudError::Unsupported(format!("instance {instance_id} has no HPC interfaces")))
}

fn with_hpc_eni<T>(
    client: &MockCloudClient,
    eni_id: &str,
    f: impl FnOnce(&mut HpcEni) -> T,
) -> Result<T, CloudError> {
    lock(&client.hpc_enis)
        .values_mut()
        .flatten()
        .find(|e| e.eni_id == eni_id)
        .map(f)
        .ok_or_else(|| CloudError::EniNotFound(format!("HPC ENI {eni_id} not found")))
}

pub async fn batch_add_hpc_eni_private_ip(
    client: &MockCloudClient,
    eni_id: &str,
    private_ips: &[String],
    count: usize,
) -> Result<Vec<String>, CloudError> {
    client.enter("BatchAddHpcEniPrivateIP", eni_id, private_ips).await?;

    let mut added: Vec<String> = private_ips.to_vec();
    while added.len() < count {
        added.push(client.next_ipv4());
    }
    with_hpc_eni(client, eni_id, |eni| {
        eni.private_ip_set.extend(added.iter().map(|ip| CloudPrivateIp {
            private_ip_address: ip.clone(),
            ..Default::default()
        }));
    })?;
    Ok(added)
}

pub async fn batch_delete_hpc_eni_private_ip(
    client: &MockCloudClient,
    eni_id: &str,
    private_ips: &[String],
) -> Result<(), CloudError> {
    client.enter("BatchDeleteHpcEniPrivateIP", eni_id, private_ips).await?;
    with_hpc_eni(client, eni_id, |eni| {
        eni.private_ip_set
            .retain(|ip| ip.primary || !private_ips.contains(&ip.private_ip_address));
    })
}
