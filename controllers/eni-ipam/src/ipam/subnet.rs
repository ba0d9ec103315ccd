//! Subnet address borrowing.
//!
//! Every interface reserves (borrows) addresses in its subnet up to its
//! `borrowIPCount`. Allocation on an interface is bounded by what it has
//! borrowed, or by what is left unborrowed in the subnet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cloud_client::{CloudClientTrait, Subnet};
use crds::ENI;
use tracing::{debug, warn};

use crate::error::ControllerError;

/// Borrowing state of one subnet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetBorrow {
    pub subnet_id: String,
    pub name: String,
    pub has_ipv6: bool,
    /// Free addresses reported by the cloud
    pub available_ips: i64,
    /// Addresses reserved per interface and not allocated yet
    borrowed: HashMap<String, i64>,
}

impl SubnetBorrow {
    fn from_cloud(subnet: &Subnet) -> Self {
        Self {
            subnet_id: subnet.subnet_id.clone(),
            name: subnet.name.clone(),
            has_ipv6: !subnet.ipv6_cidr.is_empty(),
            available_ips: subnet.available_ip,
            borrowed: HashMap::new(),
        }
    }

    /// Addresses still reserved by the interface
    pub fn borrowed_ip_num(&self, eni_id: &str) -> i64 {
        self.borrowed.get(eni_id).copied().unwrap_or_default()
    }

    /// Free addresses no interface has reserved
    pub fn borrowed_available_ips(&self) -> i64 {
        (self.available_ips - self.borrowed.values().sum::<i64>()).max(0)
    }
}

/// Cache of subnets and the addresses interfaces have borrowed from them
pub struct SubnetBorrowTracker {
    cloud: Arc<dyn CloudClientTrait>,
    subnets: Mutex<HashMap<String, SubnetBorrow>>,
}

impl SubnetBorrowTracker {
    pub fn new(cloud: Arc<dyn CloudClientTrait>) -> Self {
        Self {
            cloud,
            subnets: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SubnetBorrow>> {
        self.subnets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subnet from the cache, described on the cloud on first use
    pub async fn get_subnet(&self, subnet_id: &str) -> Result<SubnetBorrow, ControllerError> {
        if let Some(subnet) = self.lock().get(subnet_id) {
            return Ok(subnet.clone());
        }

        let subnet = self
            .cloud
            .describe_subnet(subnet_id)
            .await
            .map_err(|e| ControllerError::cloud(format!("describe subnet {subnet_id}"), e))?;
        self.upsert(&subnet);
        self.lock()
            .get(subnet_id)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(subnet_id.to_string()))
    }

    /// Insert a subnet or refresh its free address count, keeping reservations
    pub fn upsert(&self, subnet: &Subnet) {
        let mut subnets = self.lock();
        match subnets.get_mut(&subnet.subnet_id) {
            Some(existing) => {
                existing.available_ips = subnet.available_ip;
                existing.has_ipv6 = !subnet.ipv6_cidr.is_empty();
                existing.name.clone_from(&subnet.name);
            }
            None => {
                subnets.insert(subnet.subnet_id.clone(), SubnetBorrow::from_cloud(subnet));
            }
        }
    }

    /// Refresh every subnet of the VPC
    pub async fn resync(&self, vpc_id: &str) -> Result<usize, ControllerError> {
        let subnets = self
            .cloud
            .list_subnets(vpc_id)
            .await
            .map_err(|e| ControllerError::cloud(format!("list subnets of {vpc_id}"), e))?;
        for subnet in &subnets {
            self.upsert(subnet);
        }
        debug!("Refreshed {} subnets of {}", subnets.len(), vpc_id);
        Ok(subnets.len())
    }

    /// Reserve addresses for an interface up to its `borrowIPCount`.
    ///
    /// Addresses the interface already holds in its own subnet count against
    /// the reservation.
    pub fn force_borrow_for_eni(&self, eni: &ENI) {
        let subnet_id = &eni.spec.eni.subnet_id;
        if subnet_id.is_empty() || eni.spec.borrow_ip_count <= 0 {
            return;
        }

        let held = eni
            .spec
            .eni
            .private_ip_set
            .iter()
            .filter(|ip| ip.subnet_id.is_empty() || ip.subnet_id == *subnet_id)
            .count();
        let held = i64::try_from(held).unwrap_or(i64::MAX);
        let want = (eni.spec.borrow_ip_count - held).max(0);

        let mut subnets = self.lock();
        let Some(subnet) = subnets.get_mut(subnet_id) else {
            warn!("Subnet {} of ENI {} is not known, skipping borrow", subnet_id, eni.eni_id());
            return;
        };
        subnet.borrowed.insert(eni.eni_id().to_string(), want);
    }

    /// Drop every reservation of an interface
    pub fn cancel_borrow(&self, eni_id: &str) {
        for subnet in self.lock().values_mut() {
            subnet.borrowed.remove(eni_id);
        }
    }
}

impl std::fmt::Debug for SubnetBorrowTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetBorrowTracker")
            .field("subnets", &self.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_client::MockCloudClient;
    use crds::{EniSpec, PrivateIp};

    fn subnet(id: &str, available: i64) -> Subnet {
        Subnet {
            subnet_id: id.to_string(),
            name: format!("{id}-name"),
            available_ip: available,
            ..Default::default()
        }
    }

    fn eni(id: &str, subnet_id: &str, borrow: i64, ips: usize) -> ENI {
        let mut eni = ENI::new(id, EniSpec::default());
        eni.spec.borrow_ip_count = borrow;
        eni.spec.eni.id = id.to_string();
        eni.spec.eni.subnet_id = subnet_id.to_string();
        eni.spec.eni.private_ip_set = (0..ips)
            .map(|i| PrivateIp::secondary(format!("10.0.0.{i}"), subnet_id))
            .collect();
        eni
    }

    #[tokio::test]
    async fn test_get_subnet_describes_once() {
        let cloud = MockCloudClient::new("mock");
        cloud.add_subnet(subnet("sbn-a", 100));
        let tracker = SubnetBorrowTracker::new(Arc::new(cloud.clone()));

        let first = tracker.get_subnet("sbn-a").await.unwrap();
        let second = tracker.get_subnet("sbn-a").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "sbn-a-name");
        assert_eq!(cloud.calls_of("DescribeSubnet").len(), 1);
    }

    #[tokio::test]
    async fn test_borrow_reduces_unborrowed_addresses() {
        let cloud = MockCloudClient::new("mock");
        cloud.add_subnet(subnet("sbn-a", 100));
        let tracker = SubnetBorrowTracker::new(Arc::new(cloud));
        tracker.get_subnet("sbn-a").await.unwrap();

        tracker.force_borrow_for_eni(&eni("eni-1", "sbn-a", 16, 4));
        let view = tracker.get_subnet("sbn-a").await.unwrap();
        assert_eq!(view.borrowed_ip_num("eni-1"), 12);
        assert_eq!(view.borrowed_available_ips(), 88);

        // a fuller interface reserves less
        tracker.force_borrow_for_eni(&eni("eni-1", "sbn-a", 16, 16));
        let view = tracker.get_subnet("sbn-a").await.unwrap();
        assert_eq!(view.borrowed_ip_num("eni-1"), 0);
        assert_eq!(view.borrowed_available_ips(), 100);

        tracker.force_borrow_for_eni(&eni("eni-2", "sbn-a", 8, 1));
        tracker.cancel_borrow("eni-2");
        assert_eq!(tracker.get_subnet("sbn-a").await.unwrap().borrowed_available_ips(), 100);
    }

    #[tokio::test]
    async fn test_resync_keeps_reservations() {
        let cloud = MockCloudClient::new("mock");
        let mut sbn = subnet("sbn-a", 50);
        sbn.vpc_id = "vpc-test".to_string();
        cloud.add_subnet(sbn.clone());
        let tracker = SubnetBorrowTracker::new(Arc::new(cloud.clone()));
        tracker.get_subnet("sbn-a").await.unwrap();
        tracker.force_borrow_for_eni(&eni("eni-1", "sbn-a", 10, 0));

        sbn.available_ip = 30;
        cloud.add_subnet(sbn);
        assert_eq!(tracker.resync("vpc-test").await.unwrap(), 1);

        let view = tracker.get_subnet("sbn-a").await.unwrap();
        assert_eq!(view.available_ips, 30);
        assert_eq!(view.borrowed_available_ips(), 20);
    }
}
