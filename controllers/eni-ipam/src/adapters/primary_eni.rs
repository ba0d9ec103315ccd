//! Elastic bare metal adapter.
//!
//! A host with an interface quota behaves like a virtual machine. A host
//! without one allocates pod addresses as secondary addresses of its
//! built-in interface, which is recorded as an ENI object in
//! `primary-with-secondary-ip` mode on first use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cloud_client::{BccBatchAddIpArgs, InstanceDetail, NicIp};
use crds::{
    ENI, EniInfo, EniSpec, EniUseMode, LABEL_ENI_TYPE, LABEL_ENI_USE_MODE, LABEL_INSTANCE_ID, LABEL_NODE_NAME,
    NetResourceSet, PrivateIp, VpcEniStatus,
};
use tracing::{debug, info, warn};

use crate::adapters::standard::{StandardNode, split_families};
use crate::error::ControllerError;
use crate::ipam::action::{AllocationAction, ReleaseAction};
use crate::ipam::ops::{InterfaceCreationError, InterfaceInventory, NetResourceOperations, ReuseRequest, condition};
use crate::reconcile_helpers::net_resource_set_owner;

/// Adapter of elastic bare metal hosts
#[derive(Debug)]
pub struct PrimaryEniNode {
    standard: StandardNode,
    /// Host has no interface quota and uses its built-in interface
    primary_mode: AtomicBool,
}

fn nic_ips(ips: &[NicIp], subnet_id: &str) -> Vec<PrivateIp> {
    ips.iter()
        .map(|ip| PrivateIp {
            private_ip_address: ip.private_ip.clone(),
            public_ip_address: ip.eip.clone(),
            subnet_id: subnet_id.to_string(),
            primary: ip.primary,
        })
        .collect()
}

impl PrimaryEniNode {
    pub fn new(standard: StandardNode) -> Self {
        Self {
            standard,
            primary_mode: AtomicBool::new(false),
        }
    }

    fn primary_mode(&self) -> bool {
        self.primary_mode.load(Ordering::SeqCst)
    }

    fn observe(&self, instance: &InstanceDetail) -> bool {
        let primary = instance.eni_quota == 0;
        if self.primary_mode.swap(primary, Ordering::SeqCst) != primary {
            info!(
                "Node {} switched to {} mode",
                self.standard.name(),
                if primary { "primary interface" } else { "secondary interface" }
            );
        }
        primary
    }

    /// Whether the built-in interface has no ENI object yet
    async fn primary_eni_missing(&self, instance: &InstanceDetail) -> Result<bool, ControllerError> {
        let eni_id = &instance.nic_info.eni_id;
        if eni_id.is_empty() {
            return Ok(false);
        }
        Ok(self.standard.context().enis.get(eni_id).await?.is_none())
    }

    /// ENI object mirroring the built-in interface of the host
    fn primary_eni_object(&self, resource: &NetResourceSet, instance: &InstanceDetail) -> ENI {
        let spec = resource.eni_spec();
        let nic = &instance.nic_info;
        let use_mode = EniUseMode::PrimaryWithSecondaryIp;

        let mut eni = ENI::new(
            &nic.eni_id,
            EniSpec {
                node_name: self.standard.name().to_string(),
                use_mode,
                eni_type: spec.instance_type,
                route_table_offset: spec.route_table_offset,
                install_source_based_routing: spec.install_source_based_routing,
                borrow_ip_count: self.standard.quota().max_ip,
                eni: EniInfo {
                    id: nic.eni_id.clone(),
                    name: nic.name.clone(),
                    zone_name: instance.zone_name.clone(),
                    instance_id: instance.instance_id.clone(),
                    vpc_id: nic.vpc_id.clone(),
                    subnet_id: nic.subnet_id.clone(),
                    mac_address: nic.mac_address.clone(),
                    security_group_ids: nic.security_groups.clone(),
                    enterprise_security_group_ids: nic.enterprise_security_groups.clone(),
                    private_ip_set: nic_ips(&nic.ips, &nic.subnet_id),
                    ipv6_private_ip_set: nic_ips(&nic.ipv6s, &nic.subnet_id),
                    ..Default::default()
                },
            },
        );
        eni.metadata.labels = Some(BTreeMap::from([
            (LABEL_INSTANCE_ID.to_string(), instance.instance_id.clone()),
            (LABEL_NODE_NAME.to_string(), self.standard.name().to_string()),
            (LABEL_ENI_TYPE.to_string(), spec.instance_type.as_str().to_string()),
            (LABEL_ENI_USE_MODE.to_string(), use_mode.as_str().to_string()),
        ]));
        eni.metadata.owner_references = Some(vec![net_resource_set_owner(resource)]);
        eni.elect_ipv6_primary_ip();
        eni
    }

    /// Record the built-in interface and mark it in use
    async fn ensure_primary_eni(&self) -> Result<(), InterfaceCreationError> {
        let instance = self
            .standard
            .refresh_instance()
            .await
            .map_err(|e| InterfaceCreationError::new(condition::UNABLE_TO_GET_INSTANCE, e))?;
        let eni_id = instance.nic_info.eni_id.clone();
        if eni_id.is_empty() {
            return Err(InterfaceCreationError::new(
                condition::UNABLE_TO_GET_INSTANCE,
                ControllerError::AllocationFailed(format!(
                    "instance {} reports no primary interface",
                    instance.instance_id
                )),
            ));
        }

        let record = |e| InterfaceCreationError::new(condition::UNABLE_TO_RECORD_ENI, e);
        let enis = &self.standard.context().enis;
        let mut eni = match enis.get(&eni_id).await.map_err(record)? {
            Some(eni) => eni,
            None => {
                let object = self.primary_eni_object(&self.standard.resource(), &instance);
                let created = enis.create(&object).await.map_err(record)?;
                info!("Recorded primary interface {} of node {}", eni_id, self.standard.name());
                created
            }
        };

        if eni.vpc_status() != VpcEniStatus::InUse {
            let mut status = eni.status.clone().unwrap_or_default();
            status.append_vpc_status(VpcEniStatus::InUse);
            eni.status = Some(status);
            eni = enis.update_status(&eni).await.map_err(record)?;
        }
        self.standard.context().subnets.force_borrow_for_eni(&eni);
        Ok(())
    }
}

#[async_trait]
impl NetResourceOperations for PrimaryEniNode {
    fn updated_node(&self, nrs: &NetResourceSet) {
        self.standard.updated_node(nrs);
    }

    fn populate_status_fields(&self, nrs: &mut NetResourceSet) {
        self.standard.populate_status_fields(nrs);
    }

    async fn resync_interfaces_and_ips(&self) -> Result<InterfaceInventory, ControllerError> {
        let instance = self.standard.cached_instance().await?;
        let primary = self.observe(&instance);
        let mut inventory = self.standard.resync_interfaces_and_ips().await?;
        if primary && inventory.remaining_interfaces == 0 && self.primary_eni_missing(&instance).await? {
            inventory.remaining_interfaces = 1;
        }
        Ok(inventory)
    }

    async fn prepare_ip_allocation(&self) -> Result<AllocationAction, ControllerError> {
        let instance = self.standard.refresh_instance().await?;
        let primary = self.observe(&instance);
        let mut action = self.standard.prepare(true).await?;
        if primary
            && action.interface_id.is_empty()
            && action.available_interfaces == 0
            && self.primary_eni_missing(&instance).await?
        {
            debug!("Primary interface of node {} is not recorded yet", self.standard.name());
            action.available_interfaces = 1;
        }
        Ok(action)
    }

    async fn allocate_ips(&self, action: &AllocationAction) -> Result<(), ControllerError> {
        if !self.primary_mode() {
            return self.standard.allocate_ips(action).await;
        }

        let instance_id = self.standard.instance_id()?;
        let args = BccBatchAddIpArgs {
            instance_id: instance_id.clone(),
            private_ips: Vec::new(),
            secondary_private_ip_address_count: usize::try_from(action.available_for_allocation_ipv4)
                .unwrap_or_default(),
            allocate_multi_ipv6_addr: self.standard.context().config.enable_ipv6
                && action.available_for_allocation_ipv6 > 0,
        };
        let added = self
            .standard
            .context()
            .cloud
            .bcc_batch_add_ip(&args)
            .await
            .map_err(|e| ControllerError::cloud(format!("allocate ip to instance {instance_id}"), e))?;
        debug!("Allocated {:?} on primary interface of {}", added, instance_id);

        let (ipv4, ipv6) = split_families(&added);
        let to_private = |ips: Vec<String>| -> Vec<PrivateIp> {
            ips.into_iter()
                .map(|ip| PrivateIp::secondary(ip, action.pool_id.as_str()))
                .collect()
        };
        self.standard
            .record_ips(&action.interface_id, &to_private(ipv4), &to_private(ipv6), &[])
            .await?;
        Ok(())
    }

    fn prepare_ip_release(&self, excess: i64) -> ReleaseAction {
        self.standard.prepare_ip_release(excess)
    }

    async fn release_ips(&self, action: &ReleaseAction) -> Result<(), ControllerError> {
        if !self.primary_mode() {
            return self.standard.release_ips(action).await;
        }

        let instance_id = self.standard.instance_id()?;
        self.standard
            .context()
            .cloud
            .bcc_batch_del_ip(&instance_id, &action.ips_to_release)
            .await
            .map_err(|e| ControllerError::cloud(format!("release ip from instance {instance_id}"), e))?;
        if let Err(e) = self
            .standard
            .record_ips(&action.interface_id, &[], &[], &action.ips_to_release)
            .await
        {
            warn!("Failed to remove released IPs from ENI object {}: {}", action.interface_id, e);
        }
        Ok(())
    }

    async fn create_interface(&self, action: &AllocationAction) -> Result<i64, InterfaceCreationError> {
        if !self.primary_mode() {
            return self.standard.create_interface(action).await;
        }
        self.ensure_primary_eni().await.map(|()| 1)
    }

    fn maximum_allocatable_ipv4(&self) -> i64 {
        if self.primary_mode() {
            return (self.standard.quota().max_ip - 1).max(0);
        }
        self.standard.maximum_allocatable_ipv4()
    }

    fn minimum_allocatable_ipv4(&self) -> i64 {
        self.standard.minimum_allocatable_ipv4()
    }

    fn maximum_burstable_allocatable_ipv4(&self) -> i64 {
        if self.primary_mode() {
            return 0;
        }
        self.standard.maximum_burstable_allocatable_ipv4()
    }

    async fn allocate_ip_cross_subnet(&self, subnet_id: &str) -> Result<(Vec<PrivateIp>, String), ControllerError> {
        if self.primary_mode() {
            return Err(ControllerError::Unsupported(
                "allocate ip cross subnet on a primary interface".to_string(),
            ));
        }
        self.standard.allocate_ip_cross_subnet(subnet_id).await
    }

    async fn reuse_ips(&self, ips: &[ReuseRequest], owner: &str) -> Result<String, ControllerError> {
        if self.primary_mode() {
            return Err(ControllerError::Unsupported("reuse ips on a primary interface".to_string()));
        }
        self.standard.reuse_ips(ips, owner).await
    }
}
