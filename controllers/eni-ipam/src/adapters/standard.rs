//! Standard multi-interface adapter.
//!
//! Pod addresses are secondary addresses of interfaces created in the node's
//! configured subnets and attached by the ENI syncer. Interface and address
//! limits come from the instance detail or from the node's CPU and memory.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use cloud_client::{CloudPrivateIp, CreateEniArgs, InstanceDetail};
use crds::{
    AllocationIp, AllocationMap, ENI, EniInfo, EniSpec, EniType, EniUseMode, LABEL_ENI_TYPE, LABEL_ENI_USE_MODE,
    LABEL_INSTANCE_ID, LABEL_NODE_NAME, NetResourceSet, NodeEniSpec, PrivateIp, SimpleEniStatus, VpcEniStatus,
};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::adapters::AdapterContext;
use crate::capacity::{self, bbc_capacity, bcc_capacity};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::ipam::action::{AllocationAction, ReleaseAction};
use crate::ipam::ops::{InterfaceCreationError, InterfaceInventory, NetResourceOperations, ReuseRequest, condition};
use crate::ipam::subnet::SubnetBorrow;
use crate::reconcile_helpers::{net_resource_set_owner, retry_on_conflict};

/// Attempts of a read-modify-write of an ENI object
const CONFLICT_RETRIES: usize = 3;

/// Description of interfaces created by the controller
const ENI_DESCRIPTION: &str = "auto created by eni-ipam, do not modify";

/// Interface and address limits of an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EniQuota {
    /// Interfaces the instance may attach
    pub max_eni: i64,
    /// Addresses per interface, primary included
    pub max_ip: i64,
}

#[derive(Debug, Default)]
struct NodeCache {
    resource: NetResourceSet,
    instance: Option<InstanceDetail>,
    quota: Option<EniQuota>,
    enis: Vec<ENI>,
}

/// Adapter of instances with secondary interfaces
pub struct StandardNode {
    name: String,
    ctx: AdapterContext,
    cache: Mutex<NodeCache>,
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn batch_size(n: i64) -> usize {
    usize::try_from(n).unwrap_or_default()
}

pub(crate) fn is_ipv6(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6())
}

/// Split addresses into (IPv4, IPv6)
pub(crate) fn split_families<'a, I>(addresses: I) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = &'a String>,
{
    let (v6, v4): (Vec<String>, Vec<String>) = addresses.into_iter().cloned().partition(|ip| is_ipv6(ip));
    (v4, v6)
}

/// Addresses of each family that still fit on an interface.
///
/// With both families enabled the family that is behind catches up first,
/// so interfaces carry as many IPv6 as IPv4 addresses.
pub fn addresses_available_on_eni(config: &ControllerConfig, limit: i64, ipv4: i64, ipv6: i64) -> (i64, i64) {
    match (config.enable_ipv4, config.enable_ipv6) {
        (true, true) => {
            let diff = ipv6 - ipv4;
            if diff > 0 {
                ((limit - ipv4).min(diff).max(0), 0)
            } else if diff < 0 {
                (0, (limit - ipv6).min(-diff).max(0))
            } else {
                ((limit - ipv4).max(0), (limit - ipv6).max(0))
            }
        }
        (true, false) => ((limit - ipv4).max(0), 0),
        (false, true) => (0, (limit - ipv6).max(0)),
        (false, false) => (0, 0),
    }
}

/// Cloud name of a new interface
fn eni_name(node: &str, instance_id: &str) -> String {
    format!("{node}/{instance_id}/{}", Utc::now().timestamp_millis())
}

impl StandardNode {
    pub fn new(name: impl Into<String>, resource: &NetResourceSet, ctx: AdapterContext) -> Self {
        Self {
            name: name.into(),
            ctx,
            cache: Mutex::new(NodeCache {
                resource: resource.clone(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    /// Last NetResourceSet received
    pub fn resource(&self) -> NetResourceSet {
        self.lock().resource.clone()
    }

    fn eni_spec(&self) -> NodeEniSpec {
        self.lock().resource.eni_spec()
    }

    /// Cloud instance of the node
    pub fn instance_id(&self) -> Result<String, ControllerError> {
        let id = self.lock().resource.spec.instance_id.clone();
        if id.is_empty() {
            return Err(ControllerError::InstanceIdUnavailable(self.name.clone()));
        }
        Ok(id)
    }

    /// Fetch the instance detail from the cloud and cache it
    pub async fn refresh_instance(&self) -> Result<InstanceDetail, ControllerError> {
        let instance_id = self.instance_id()?;
        let instance = self
            .ctx
            .cloud
            .get_bcc_instance_detail(&instance_id)
            .await
            .map_err(|e| ControllerError::cloud(format!("get instance {instance_id}"), e))?;
        self.lock().instance = Some(instance.clone());
        Ok(instance)
    }

    /// Instance detail from the cache, fetched on first use
    pub async fn cached_instance(&self) -> Result<InstanceDetail, ControllerError> {
        if let Some(instance) = self.lock().instance.clone() {
            return Ok(instance);
        }
        self.refresh_instance().await
    }

    /// Quota computed so far, zero before the first resync
    pub fn quota(&self) -> EniQuota {
        self.lock().quota.unwrap_or_default()
    }

    /// Compute the quota once and cache it
    pub async fn refresh_quota(&self) -> Result<EniQuota, ControllerError> {
        if let Some(quota) = self.lock().quota {
            return Ok(quota);
        }

        let instance = self.cached_instance().await?;
        let resources = self
            .ctx
            .nodes
            .get_node(&self.name)
            .await?
            .map(|node| capacity::node_resources(&node))
            .unwrap_or_default();
        let cpu = if resources.cpu > 0 { resources.cpu } else { instance.cpu_count };
        let memory = if resources.memory_gb > 0 {
            resources.memory_gb
        } else {
            instance.memory_capacity_in_gb
        };

        let spec = self.eni_spec();
        let config = &self.ctx.config;
        let defaults = match spec.instance_type {
            EniType::Bbc => bbc_capacity(config),
            _ => bcc_capacity(cpu, memory, config),
        };

        // instances that are not plain VMs may not support interfaces at all
        let max_eni = if config.customer_max_eni != 0 {
            config.customer_max_eni
        } else if instance.eni_quota != 0 {
            instance.eni_quota
        } else if spec.instance_type == EniType::Bcc {
            defaults.max_eni
        } else {
            0
        };
        let max_ip = if spec.use_mode == EniUseMode::PrimaryIp {
            0
        } else {
            defaults.max_ip_per_eni
        };

        let quota = EniQuota { max_eni, max_ip };
        debug!("Quota of node {}: {:?}", self.name, quota);
        self.lock().quota = Some(quota);
        Ok(quota)
    }

    async fn list_enis(&self) -> Result<Vec<ENI>, ControllerError> {
        let mut enis = self.ctx.enis.list_by_node(&self.name).await?;
        enis.sort_by_key(ResourceExt::name_any);
        Ok(enis)
    }

    /// Pick the first in-use interface with room for more addresses.
    ///
    /// With `check_subnet` the IPv4 count is further bounded by what the
    /// interface borrowed, or what is left unborrowed in its subnet.
    pub async fn prepare(&self, check_subnet: bool) -> Result<AllocationAction, ControllerError> {
        let quota = self.refresh_quota().await?;
        let enis = self.list_enis().await?;

        let mut action = AllocationAction::default();
        let mut eni_count = 0;
        for eni in &enis {
            eni_count += 1;
            if action.has_capacity() && !action.interface_id.is_empty() {
                continue;
            }
            if eni.spec.use_mode == EniUseMode::PrimaryIp {
                continue;
            }
            // a creating interface must not lead to another one being created
            if eni.vpc_status() != VpcEniStatus::InUse {
                return Err(ControllerError::EniNotInUse(eni.eni_id().to_string()));
            }

            let (ipv4, ipv6) = addresses_available_on_eni(
                &self.ctx.config,
                quota.max_ip,
                count(eni.spec.eni.private_ip_set.len()),
                count(eni.spec.eni.ipv6_private_ip_set.len()),
            );
            if ipv4 == 0 && ipv6 == 0 {
                continue;
            }

            let eni_id = eni.eni_id().to_string();
            debug!("ENI {} of node {} has room for {} IPv4 and {} IPv6", eni_id, self.name, ipv4, ipv6);
            action.available_for_allocation_ipv4 = if check_subnet {
                let subnet = self.ctx.subnets.get_subnet(&eni.spec.eni.subnet_id).await?;
                let borrowed = subnet.borrowed_ip_num(&eni_id);
                if borrowed > 0 {
                    borrowed.min(ipv4)
                } else {
                    subnet.borrowed_available_ips().min(ipv4)
                }
            } else {
                ipv4
            };
            action.available_for_allocation_ipv6 = ipv6;
            action.pool_id.clone_from(&eni.spec.eni.subnet_id);
            action.interface_id = eni_id;
        }

        action.available_interfaces = (quota.max_eni - eni_count).max(0);
        self.lock().enis = enis;
        Ok(action)
    }

    /// Add and remove addresses in an ENI object and refresh its borrow
    pub async fn record_ips(
        &self,
        eni_id: &str,
        added_ipv4: &[PrivateIp],
        added_ipv6: &[PrivateIp],
        removed: &[String],
    ) -> Result<ENI, ControllerError> {
        let store = &self.ctx.enis;
        let updated = retry_on_conflict(CONFLICT_RETRIES, || async move {
            let mut eni = store
                .get(eni_id)
                .await?
                .ok_or_else(|| ControllerError::NotFound(eni_id.to_string()))?;
            let info = &mut eni.spec.eni;
            info.private_ip_set.retain(|ip| !removed.contains(&ip.private_ip_address));
            info.ipv6_private_ip_set
                .retain(|ip| !removed.contains(&ip.private_ip_address));
            for ip in added_ipv4 {
                if !info.private_ip_set.iter().any(|p| p.private_ip_address == ip.private_ip_address) {
                    info.private_ip_set.push(ip.clone());
                }
            }
            for ip in added_ipv6 {
                if !info
                    .ipv6_private_ip_set
                    .iter()
                    .any(|p| p.private_ip_address == ip.private_ip_address)
                {
                    info.ipv6_private_ip_set.push(ip.clone());
                }
            }
            store.update(&eni).await
        })
        .await?;

        self.ctx.subnets.force_borrow_for_eni(&updated);
        Ok(updated)
    }

    /// Delete addresses from an interface, logging failures
    async fn delete_quietly(&self, eni_id: &str, addresses: &[String]) {
        let (ipv4, ipv6) = split_families(addresses);
        for (family, is_ipv6) in [(ipv4, false), (ipv6, true)] {
            if family.is_empty() {
                continue;
            }
            if let Err(e) = self.ctx.cloud.batch_delete_private_ip(&family, eni_id, is_ipv6).await {
                warn!("Failed to roll back {:?} on ENI {}: {}", family, eni_id, e);
            }
        }
    }

    /// Configured subnet with the most unborrowed addresses
    async fn select_subnet(&self, subnet_ids: &[String]) -> Result<SubnetBorrow, ControllerError> {
        let mut best: Option<SubnetBorrow> = None;
        for id in subnet_ids {
            let subnet = match self.ctx.subnets.get_subnet(id).await {
                Ok(subnet) => subnet,
                Err(e) => {
                    warn!("Skipping subnet {} for node {}: {}", id, self.name, e);
                    continue;
                }
            };
            if subnet.borrowed_available_ips() <= 0 {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|b| subnet.borrowed_available_ips() > b.borrowed_available_ips())
            {
                best = Some(subnet);
            }
        }
        best.ok_or_else(|| {
            ControllerError::AllocationFailed(format!(
                "no subnet with free addresses among {subnet_ids:?} for node {}",
                self.name
            ))
        })
    }

    /// Security groups of a new interface: the node's own, else the instance's
    async fn security_groups(
        &self,
        spec: &NodeEniSpec,
        instance: &InstanceDetail,
    ) -> Result<(Vec<String>, Vec<String>), ControllerError> {
        if !spec.security_groups.is_empty() || !spec.enterprise_security_group_list.is_empty() {
            return Ok((spec.security_groups.clone(), spec.enterprise_security_group_list.clone()));
        }

        let groups = instance.nic_info.security_groups.clone();
        let enterprise: Vec<String> = self
            .ctx
            .cloud
            .list_enterprise_security_groups(&instance.instance_id)
            .await
            .map_err(|e| ControllerError::cloud(format!("list enterprise security groups of {}", instance.instance_id), e))?
            .into_iter()
            .map(|g| g.id)
            .collect();
        if groups.is_empty() && enterprise.is_empty() {
            return Err(ControllerError::AllocationFailed(format!(
                "instance {} has no security group",
                instance.instance_id
            )));
        }
        Ok((groups, enterprise))
    }

    /// Create a cloud interface and the ENI object that drives its attachment
    pub async fn create_eni(&self) -> Result<String, InterfaceCreationError> {
        let instance = self
            .refresh_instance()
            .await
            .map_err(|e| InterfaceCreationError::new(condition::UNABLE_TO_GET_INSTANCE, e))?;
        let resource = self.resource();
        let spec = resource.eni_spec();

        let subnet = self
            .select_subnet(&spec.subnet_ids)
            .await
            .map_err(|e| InterfaceCreationError::new(condition::NO_MATCHING_SUBNET, e))?;
        let (security_groups, enterprise_security_groups) = self
            .security_groups(&spec, &instance)
            .await
            .map_err(|e| InterfaceCreationError::new(condition::UNABLE_TO_GET_SECURITY_GROUPS, e))?;

        let primary = |subnet_id: &str| CloudPrivateIp {
            subnet_id: subnet_id.to_string(),
            primary: true,
            ..Default::default()
        };
        let args = CreateEniArgs {
            name: eni_name(&self.name, &instance.instance_id),
            subnet_id: subnet.subnet_id.clone(),
            security_group_ids: security_groups.clone(),
            enterprise_security_group_ids: enterprise_security_groups.clone(),
            private_ip_set: vec![primary(&subnet.subnet_id)],
            ipv6_private_ip_set: if self.ctx.config.enable_ipv6 && subnet.has_ipv6 {
                vec![primary(&subnet.subnet_id)]
            } else {
                Vec::new()
            },
            description: ENI_DESCRIPTION.to_string(),
        };

        let eni_id = self.ctx.cloud.create_eni(&args).await.map_err(|e| {
            InterfaceCreationError::new(
                condition::UNABLE_TO_CREATE_ENI,
                ControllerError::cloud(format!("create ENI in subnet {}", subnet.subnet_id), e),
            )
        })?;
        info!("Created ENI {} in subnet {} for node {}", eni_id, subnet.subnet_id, self.name);

        let mut eni = ENI::new(
            &eni_id,
            EniSpec {
                node_name: self.name.clone(),
                use_mode: spec.use_mode,
                eni_type: spec.instance_type,
                route_table_offset: spec.route_table_offset,
                install_source_based_routing: spec.install_source_based_routing,
                borrow_ip_count: self.quota().max_ip,
                eni: EniInfo {
                    id: eni_id.clone(),
                    name: args.name.clone(),
                    zone_name: instance.zone_name.clone(),
                    instance_id: instance.instance_id.clone(),
                    vpc_id: self.ctx.config.vpc_id.clone(),
                    subnet_id: subnet.subnet_id.clone(),
                    description: ENI_DESCRIPTION.to_string(),
                    security_group_ids: security_groups,
                    enterprise_security_group_ids: enterprise_security_groups,
                    ..Default::default()
                },
            },
        );
        eni.metadata.labels = Some(BTreeMap::from([
            (LABEL_INSTANCE_ID.to_string(), instance.instance_id.clone()),
            (LABEL_NODE_NAME.to_string(), self.name.clone()),
            (LABEL_ENI_TYPE.to_string(), spec.instance_type.as_str().to_string()),
            (LABEL_ENI_USE_MODE.to_string(), spec.use_mode.as_str().to_string()),
        ]));
        eni.metadata.owner_references = Some(vec![net_resource_set_owner(&resource)]);

        match self.ctx.enis.create(&eni).await {
            Ok(created) => {
                self.ctx.subnets.force_borrow_for_eni(&created);
                Ok(eni_id)
            }
            Err(e) => {
                if let Err(rollback) = self.ctx.cloud.delete_eni(&eni_id).await {
                    warn!("Failed to roll back ENI {} of node {}: {}", eni_id, self.name, rollback);
                }
                Err(InterfaceCreationError::new(condition::UNABLE_TO_RECORD_ENI, e))
            }
        }
    }

    /// Interface with room for one more address, creating one when none has
    async fn interface_with_room(&self) -> Result<String, ControllerError> {
        let action = self.prepare(false).await?;
        if action.has_capacity() {
            return Ok(action.interface_id);
        }
        if action.available_interfaces == 0 {
            return Err(ControllerError::AllocationFailed(format!(
                "no available ip for allocation on node {}",
                self.name
            )));
        }
        let eni_id = self.create_eni().await.map_err(|e| e.source)?;
        Err(ControllerError::AllocationFailed(format!(
            "no available eni for allocation on node {}, creating new eni {}",
            self.name, eni_id
        )))
    }

    /// Add exactly one address of a family from `subnet_id`
    async fn add_one_cross_subnet(
        &self,
        eni_id: &str,
        subnet_id: &str,
        address: Option<&str>,
        is_ipv6: bool,
    ) -> Result<String, ControllerError> {
        let explicit: Vec<String> = address.map(str::to_string).into_iter().collect();
        let mut added = self
            .ctx
            .cloud
            .batch_add_private_ip_cross_subnet(eni_id, subnet_id, &explicit, 1, is_ipv6)
            .await
            .map_err(|e| ControllerError::cloud(format!("allocate ip cross subnet {subnet_id} on eni {eni_id}"), e))?;
        if added.len() != 1 {
            self.delete_quietly(eni_id, &added).await;
            return Err(ControllerError::AllocationFailed(format!(
                "allocate ip cross subnet {subnet_id} on eni {eni_id} returned {} addresses",
                added.len()
            )));
        }
        Ok(added.remove(0))
    }

    fn reject_primary_ip_mode(&self, operation: &str) -> Result<(), ControllerError> {
        if self.lock().resource.uses_primary_ip_mode() {
            return Err(ControllerError::Unsupported(format!("{operation} in primary-ip mode")));
        }
        Ok(())
    }

    /// Interfaces holding the requested addresses on other nodes give them up.
    ///
    /// Returns the interface of this node already holding one of them.
    async fn release_from_old_owners(&self, ips: &[ReuseRequest]) -> Result<Option<String>, ControllerError> {
        let mut local: Vec<String> = Vec::new();
        for request in ips {
            for holder in self.ctx.enis.find_by_ip(&request.ip).await? {
                let holder_id = holder.eni_id().to_string();
                if holder.spec.node_name == self.name {
                    local.push(holder.name_any());
                    continue;
                }
                self.ctx
                    .cloud
                    .batch_delete_private_ip(std::slice::from_ref(&request.ip), &holder_id, is_ipv6(&request.ip))
                    .await
                    .map_err(|e| ControllerError::cloud(format!("release ip {} from eni {holder_id}", request.ip), e))?;
                info!("Released IP {} from ENI {} of node {}", request.ip, holder_id, holder.spec.node_name);
                if let Err(e) = self.record_ips(&holder_id, &[], &[], std::slice::from_ref(&request.ip)).await {
                    warn!("Failed to remove IP {} from ENI object {}: {}", request.ip, holder_id, e);
                }
            }
        }

        if local.len() > 1 {
            warn!("IPs {:?} are held by several ENIs of node {}: {:?}, using the first", ips, self.name, local);
        }
        Ok(local.into_iter().next())
    }
}

#[async_trait]
impl NetResourceOperations for StandardNode {
    fn updated_node(&self, nrs: &NetResourceSet) {
        let mut cache = self.lock();
        if cache.resource.spec.eni != nrs.spec.eni || cache.resource.spec.instance_id != nrs.spec.instance_id {
            cache.quota = None;
            cache.instance = None;
        }
        cache.resource = nrs.clone();
    }

    fn populate_status_fields(&self, nrs: &mut NetResourceSet) {
        let enis: BTreeMap<String, SimpleEniStatus> = self
            .lock()
            .enis
            .iter()
            .map(|eni| {
                let status = eni.status.clone().unwrap_or_default();
                (
                    eni.eni_id().to_string(),
                    SimpleEniStatus {
                        subnet_id: eni.spec.eni.subnet_id.clone(),
                        vpc_status: status.vpc_status,
                        cce_status: status.cce_status,
                    },
                )
            })
            .collect();
        nrs.status.get_or_insert_with(Default::default).enis = enis;
    }

    async fn resync_interfaces_and_ips(&self) -> Result<InterfaceInventory, ControllerError> {
        let quota = self.refresh_quota().await?;
        let use_primary_address = self.eni_spec().use_primary_address;
        let enis = self.list_enis().await?;

        let mut available = AllocationMap::new();
        for eni in &enis {
            if eni.vpc_status() != VpcEniStatus::InUse {
                continue;
            }
            let include_primary = use_primary_address || eni.spec.use_mode == EniUseMode::PrimaryIp;
            let subnet_id = &eni.spec.eni.subnet_id;
            for ip in eni.spec.eni.private_ip_set.iter().chain(&eni.spec.eni.ipv6_private_ip_set) {
                if ip.primary && !include_primary {
                    continue;
                }
                // addresses borrowed from other subnets are pinned to their owner
                if !ip.subnet_id.is_empty() && ip.subnet_id != *subnet_id {
                    continue;
                }
                available.insert(ip.private_ip_address.clone(), AllocationIp::on_interface(eni.eni_id()));
            }
        }

        let remaining_interfaces = (quota.max_eni - count(enis.len())).max(0);
        debug!(
            "Resynced node {}: {} ENIs, {} addresses, {} interfaces left",
            self.name,
            enis.len(),
            available.len(),
            remaining_interfaces
        );
        self.lock().enis = enis;
        Ok(InterfaceInventory {
            available,
            remaining_interfaces,
        })
    }

    async fn prepare_ip_allocation(&self) -> Result<AllocationAction, ControllerError> {
        self.refresh_instance().await?;
        self.prepare(true).await
    }

    async fn allocate_ips(&self, action: &AllocationAction) -> Result<(), ControllerError> {
        let eni_id = &action.interface_id;
        let pool_id = &action.pool_id;

        let mut added_ipv4 = Vec::new();
        if action.available_for_allocation_ipv4 > 0 {
            added_ipv4 = self
                .ctx
                .cloud
                .batch_add_private_ip(&[], batch_size(action.available_for_allocation_ipv4), eni_id, false)
                .await
                .map_err(|e| ControllerError::cloud(format!("allocate ip to eni {eni_id}"), e))?
                .into_iter()
                .map(|ip| PrivateIp::secondary(ip, pool_id.as_str()))
                .collect();
            debug!("Allocated {:?} to ENI {}", added_ipv4, eni_id);
        }

        let mut added_ipv6 = Vec::new();
        let mut failure = None;
        if action.available_for_allocation_ipv6 > 0 {
            match self
                .ctx
                .cloud
                .batch_add_private_ip(&[], batch_size(action.available_for_allocation_ipv6), eni_id, true)
                .await
            {
                Ok(ips) => {
                    added_ipv6 = ips
                        .into_iter()
                        .map(|ip| PrivateIp::secondary(ip, pool_id.as_str()))
                        .collect();
                }
                Err(e) => failure = Some(ControllerError::cloud(format!("allocate ipv6 to eni {eni_id}"), e)),
            }
        }

        if !added_ipv4.is_empty() || !added_ipv6.is_empty() {
            self.record_ips(eni_id, &added_ipv4, &added_ipv6, &[]).await?;
        }
        failure.map_or(Ok(()), Err)
    }

    fn prepare_ip_release(&self, excess: i64) -> ReleaseAction {
        let cache = self.lock();
        let used: HashSet<&str> = cache
            .resource
            .status
            .as_ref()
            .map(|s| s.ipam.used.keys().map(String::as_str).collect())
            .unwrap_or_default();

        let mut best: Option<(&ENI, Vec<String>)> = None;
        for eni in &cache.enis {
            if eni.vpc_status() != VpcEniStatus::InUse || eni.spec.use_mode == EniUseMode::PrimaryIp {
                continue;
            }
            let free: Vec<String> = eni
                .spec
                .eni
                .private_ip_set
                .iter()
                .filter(|ip| !ip.primary)
                .filter(|ip| ip.subnet_id.is_empty() || ip.subnet_id == eni.spec.eni.subnet_id)
                .filter(|ip| !used.contains(ip.private_ip_address.as_str()))
                .map(|ip| ip.private_ip_address.clone())
                .collect();
            if best.as_ref().is_none_or(|(_, b)| free.len() > b.len()) {
                best = Some((eni, free));
            }
        }

        let Some((eni, mut free)) = best else {
            return ReleaseAction::default();
        };
        free.sort();
        free.truncate(batch_size(excess));
        ReleaseAction {
            interface_id: eni.eni_id().to_string(),
            pool_id: eni.spec.eni.subnet_id.clone(),
            ips_to_release: free,
        }
    }

    async fn release_ips(&self, action: &ReleaseAction) -> Result<(), ControllerError> {
        let eni_id = &action.interface_id;
        let (ipv4, ipv6) = split_families(&action.ips_to_release);
        for (family, is_ipv6) in [(&ipv4, false), (&ipv6, true)] {
            if family.is_empty() {
                continue;
            }
            self.ctx
                .cloud
                .batch_delete_private_ip(family, eni_id, is_ipv6)
                .await
                .map_err(|e| ControllerError::cloud(format!("release {family:?} from eni {eni_id}"), e))?;
        }

        // the ENI syncer restores the IP sets from the cloud on its next pass
        if let Err(e) = self.record_ips(eni_id, &[], &[], &action.ips_to_release).await {
            warn!("Failed to remove released IPs from ENI object {}: {}", eni_id, e);
        }
        Ok(())
    }

    async fn create_interface(&self, _action: &AllocationAction) -> Result<i64, InterfaceCreationError> {
        self.create_eni().await.map(|_| 1)
    }

    fn maximum_allocatable_ipv4(&self) -> i64 {
        let quota = self.quota();
        match self.eni_spec().use_mode {
            EniUseMode::PrimaryIp => quota.max_eni,
            EniUseMode::PrimaryWithSecondaryIp => (quota.max_ip - 1).max(0),
            EniUseMode::SecondaryIp => (quota.max_eni * (quota.max_ip - 1)).max(0),
        }
    }

    fn minimum_allocatable_ipv4(&self) -> i64 {
        self.ctx.config.default_pre_allocate
    }

    fn maximum_burstable_allocatable_ipv4(&self) -> i64 {
        let spec = self.eni_spec();
        if spec.use_mode == EniUseMode::PrimaryIp || spec.burstable_mehrfach_eni <= 0 {
            return 0;
        }
        (self.quota().max_ip - 1).max(0) * spec.burstable_mehrfach_eni
    }

    async fn allocate_ip_cross_subnet(&self, subnet_id: &str) -> Result<(Vec<PrivateIp>, String), ControllerError> {
        self.reject_primary_ip_mode("allocate ip cross subnet")?;
        let eni_id = self.interface_with_room().await?;
        let subnet = self.ctx.subnets.get_subnet(subnet_id).await?;

        let ipv4 = self.add_one_cross_subnet(&eni_id, subnet_id, None, false).await?;
        let mut added_ipv6 = Vec::new();
        if self.ctx.config.enable_ipv6 && subnet.has_ipv6 {
            match self.add_one_cross_subnet(&eni_id, subnet_id, None, true).await {
                Ok(ipv6) => added_ipv6.push(PrivateIp::secondary(ipv6, subnet_id)),
                Err(e) => {
                    self.delete_quietly(&eni_id, std::slice::from_ref(&ipv4)).await;
                    return Err(e);
                }
            }
        }
        let added_ipv4 = vec![PrivateIp::secondary(ipv4, subnet_id)];

        if let Err(e) = self.record_ips(&eni_id, &added_ipv4, &added_ipv6, &[]).await {
            let addresses: Vec<String> = added_ipv4
                .iter()
                .chain(&added_ipv6)
                .map(|ip| ip.private_ip_address.clone())
                .collect();
            self.delete_quietly(&eni_id, &addresses).await;
            return Err(e);
        }

        info!("Allocated cross subnet {} IPs on ENI {} of node {}", subnet_id, eni_id, self.name);
        Ok((added_ipv4.into_iter().chain(added_ipv6).collect(), eni_id))
    }

    async fn reuse_ips(&self, ips: &[ReuseRequest], owner: &str) -> Result<String, ControllerError> {
        self.reject_primary_ip_mode("reuse ips")?;
        if ips.is_empty() {
            return Err(ControllerError::AllocationFailed("no ip to reuse".to_string()));
        }
        if !owner
            .split_once('/')
            .is_some_and(|(namespace, name)| !namespace.is_empty() && !name.is_empty())
        {
            return Err(ControllerError::AllocationFailed(format!("invalid owner {owner}")));
        }

        let ipv4 = ips.iter().find(|r| !is_ipv6(&r.ip));
        let ipv6 = ips.iter().find(|r| is_ipv6(&r.ip));

        let eni_id = self.interface_with_room().await?;
        if let Some(local) = self.release_from_old_owners(ips).await? {
            info!("IPs {:?} of {} are local to ENI {}, directly reusable", ips, owner, local);
            return Ok(local);
        }

        let mut added_ipv4 = Vec::new();
        if let Some(request) = ipv4 {
            let ip = self
                .add_one_cross_subnet(&eni_id, &request.subnet_id, Some(&request.ip), false)
                .await?;
            added_ipv4.push(PrivateIp::secondary(ip, request.subnet_id.as_str()));
        }

        let mut added_ipv6 = Vec::new();
        if let Some(request) = ipv6.filter(|_| self.ctx.config.enable_ipv6) {
            match self
                .add_one_cross_subnet(&eni_id, &request.subnet_id, Some(&request.ip), true)
                .await
            {
                Ok(ip) => added_ipv6.push(PrivateIp::secondary(ip, request.subnet_id.as_str())),
                Err(e) => {
                    let rollback: Vec<String> = added_ipv4.iter().map(|ip| ip.private_ip_address.clone()).collect();
                    self.delete_quietly(&eni_id, &rollback).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.record_ips(&eni_id, &added_ipv4, &added_ipv6, &[]).await {
            let rollback: Vec<String> = added_ipv4
                .iter()
                .chain(&added_ipv6)
                .map(|ip| ip.private_ip_address.clone())
                .collect();
            self.delete_quietly(&eni_id, &rollback).await;
            return Err(e);
        }

        info!("Reused IPs {:?} of {} on ENI {} of node {}", ips, owner, eni_id, self.name);
        Ok(eni_id)
    }
}

impl std::fmt::Debug for StandardNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardNode")
            .field("name", &self.name)
            .field("quota", &self.quota())
            .finish_non_exhaustive()
    }
}
