//! Per-interface state machine.
//!
//! One pass looks at the interface in the cloud and performs at most one
//! transition:
//!
//! | local status | cloud status | action                                     |
//! |--------------|--------------|--------------------------------------------|
//! | any          | gone         | delete the object                          |
//! | any          | inuse        | copy cloud fields to the spec, mark inuse  |
//! | available    | available    | attach, or delete when created too long ago |
//! | attaching    | attaching    | delete when created too long ago           |
//! | detaching    | any          | nothing                                    |
//!
//! A differing status is recorded; an unchanged non-final one is looked at
//! again after [`ENI_READY_TIME_TO_ATTACH`].

use std::time::Duration;

use chrono::Utc;
use cloud_client::{CloudPrivateIp, Eni};
use crds::{ENI, PrivateIp, VpcEniStatus};
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::eni::{ENI_MAX_CREATE_DURATION, ENI_READY_TIME_TO_ATTACH, EniSyncer};
use crate::error::ControllerError;
use crate::events::EventKind;
use crate::reconcile_helpers::{created_at, managed_by_net_resource_set};

/// Result of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOutcome {
    /// Spec and status were written, nothing left to persist
    Synced,
    /// Persist the status if it changed
    Continue,
    /// Status is not final, look again later
    Delay(Duration),
}

/// Whether a transition removed the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Stay,
    Deleted,
}

fn to_private_ips(ips: &[CloudPrivateIp], subnet_id: &str) -> Vec<PrivateIp> {
    ips.iter()
        .map(|ip| PrivateIp {
            private_ip_address: ip.private_ip_address.clone(),
            public_ip_address: ip.public_ip_address.clone(),
            subnet_id: if ip.subnet_id.is_empty() {
                subnet_id.to_string()
            } else {
                ip.subnet_id.clone()
            },
            primary: ip.primary,
        })
        .collect()
}

/// Drives one ENI object through its lifecycle
pub struct EniStateMachine<'a> {
    syncer: &'a EniSyncer,
    resource: ENI,
    cloud_eni: Option<Eni>,
}

impl<'a> EniStateMachine<'a> {
    pub fn new(syncer: &'a EniSyncer, resource: ENI) -> Self {
        Self {
            syncer,
            resource,
            cloud_eni: None,
        }
    }

    /// The object with any status change of the pass applied
    pub fn into_resource(self) -> ENI {
        self.resource
    }

    fn name(&self) -> String {
        self.resource.name_any()
    }

    fn eni_id(&self) -> String {
        self.resource.eni_id().to_string()
    }

    fn cloud_status(&self) -> VpcEniStatus {
        let Some(cloud_eni) = self.cloud_eni.as_ref() else {
            return VpcEniStatus::None;
        };
        cloud_eni.status.parse().unwrap_or_else(|e| {
            warn!("ENI {} reports {}", cloud_eni.eni_id, e);
            VpcEniStatus::None
        })
    }

    fn expired(&self) -> bool {
        created_at(&self.resource.metadata).is_some_and(|created| {
            Utc::now()
                .signed_duration_since(created)
                .to_std()
                .is_ok_and(|age| age > ENI_MAX_CREATE_DURATION)
        })
    }

    async fn event(&self, kind: EventKind, reason: &str, message: &str) {
        let object = self.resource.object_ref(&());
        self.syncer.events.record(&object, kind, reason, message).await;
    }

    /// Run one pass
    pub async fn start(&mut self) -> Result<MachineOutcome, ControllerError> {
        // the cloud cannot stat RDMA interfaces
        if self.resource.spec.eni_type.is_rdma() {
            return Ok(MachineOutcome::Continue);
        }

        let local = self.resource.vpc_status();
        match local {
            VpcEniStatus::InUse => {
                debug!("ENI {} is already in use", self.name());
                return Ok(MachineOutcome::Continue);
            }
            VpcEniStatus::Deleted => return Ok(MachineOutcome::Continue),
            _ => {}
        }

        if !managed_by_net_resource_set(&self.resource.metadata) {
            info!(
                "ENI object {} is not owned by a NetResourceSet yet, skip state machine",
                self.name()
            );
            return Ok(MachineOutcome::Synced);
        }

        match self.syncer.cloud.stat_eni(&self.eni_id()).await {
            Ok(cloud_eni) => self.cloud_eni = Some(cloud_eni),
            Err(e) if e.is_not_found() => {
                error!("ENI {} not in use and not found in VPC, will delete it", self.name());
                self.delete_eni().await?;
                return Ok(MachineOutcome::Synced);
            }
            Err(e) => {
                return Err(ControllerError::cloud(
                    format!("refresh status of eni {}", self.eni_id()),
                    e,
                ));
            }
        }

        let cloud = self.cloud_status();
        if cloud == VpcEniStatus::InUse {
            self.mark_in_use().await?;
            return Ok(MachineOutcome::Synced);
        }

        let transition = match local {
            VpcEniStatus::Available => self.attach_eni(cloud).await,
            VpcEniStatus::Attaching => self.attaching_eni(cloud).await,
            // no automatic recovery of a stuck detach
            _ => Ok(Transition::Stay),
        };
        match transition {
            Ok(Transition::Deleted) => return Ok(MachineOutcome::Synced),
            Ok(Transition::Stay) => {}
            Err(e) => {
                error!("Failed to run state machine of ENI {} in status {}: {}", self.eni_id(), local, e);
                return Err(e);
            }
        }

        if local != cloud {
            self.resource
                .status
                .get_or_insert_with(Default::default)
                .append_vpc_status(cloud);
            return Ok(MachineOutcome::Continue);
        }

        debug!("ENI {} status is not final: {}", self.eni_id(), local);
        Ok(MachineOutcome::Delay(ENI_READY_TIME_TO_ATTACH))
    }

    /// Copy what the cloud reports onto the object, then persist spec and status
    async fn mark_in_use(&mut self) -> Result<(), ControllerError> {
        let Some(cloud_eni) = self.cloud_eni.as_ref() else {
            return Ok(());
        };
        let spec = &mut self.resource.spec.eni;
        spec.id = cloud_eni.eni_id.clone();
        spec.name = cloud_eni.name.clone();
        spec.mac_address = cloud_eni.mac_address.clone();
        spec.instance_id = cloud_eni.instance_id.clone();
        spec.security_group_ids = cloud_eni.security_group_ids.clone();
        spec.enterprise_security_group_ids = cloud_eni.enterprise_security_group_ids.clone();
        spec.description = cloud_eni.description.clone();
        spec.vpc_id = cloud_eni.vpc_id.clone();
        spec.zone_name = cloud_eni.zone_name.clone();
        spec.subnet_id = cloud_eni.subnet_id.clone();
        spec.private_ip_set = to_private_ips(&cloud_eni.private_ip_set, &cloud_eni.subnet_id);
        spec.ipv6_private_ip_set = to_private_ips(&cloud_eni.ipv6_private_ip_set, &cloud_eni.subnet_id);
        self.resource.elect_ipv6_primary_ip();

        let mut updated = self.syncer.enis.update(&self.resource).await.map_err(|e| {
            error!("Failed to update spec of ENI {}: {}", self.resource.name_any(), e);
            e
        })?;
        updated
            .status
            .get_or_insert_with(Default::default)
            .append_vpc_status(VpcEniStatus::InUse);
        self.resource = self.syncer.enis.update_status(&updated).await?;
        info!("Updated ENI {} to inuse and populated its content", self.name());
        Ok(())
    }

    /// Attach an available interface to its instance
    async fn attach_eni(&self, cloud: VpcEniStatus) -> Result<Transition, ControllerError> {
        if cloud != VpcEniStatus::Available {
            return Ok(Transition::Stay);
        }
        if self.expired() {
            self.delete_eni().await?;
            return Ok(Transition::Deleted);
        }

        let instance_id = self.resource.spec.eni.instance_id.clone();
        let eni_id = self.eni_id();
        if let Err(e) = self.syncer.cloud.attach_eni(&instance_id, &eni_id).await {
            self.event(
                EventKind::Warning,
                "AttachENIFailed",
                &format!("failed attach eni({eni_id}) to {instance_id}, will delete it: {e}"),
            )
            .await;
            if let Err(rollback) = self.delete_eni().await {
                error!("Failed to delete ENI {} after attach failure: {}", self.name(), rollback);
            }
            return Err(ControllerError::cloud(
                format!("attach eni {eni_id} to instance {instance_id}"),
                e,
            ));
        }

        info!("Attached ENI {} to instance {}", eni_id, instance_id);
        Ok(Transition::Stay)
    }

    /// Give up on an interface stuck in attaching
    async fn attaching_eni(&self, cloud: VpcEniStatus) -> Result<Transition, ControllerError> {
        if cloud != VpcEniStatus::Attaching || !self.expired() {
            return Ok(Transition::Stay);
        }
        self.event(
            EventKind::Warning,
            "AttachingENIError",
            &format!(
                "eni({}) is in attaching status more than {}, will delete it",
                self.eni_id(),
                humantime::format_duration(ENI_MAX_CREATE_DURATION)
            ),
        )
        .await;
        self.delete_eni().await?;
        Ok(Transition::Deleted)
    }

    /// Delete the interface in the cloud, then its object
    async fn delete_eni(&self) -> Result<(), ControllerError> {
        let eni_id = self.eni_id();
        match self.syncer.cloud.delete_eni(&eni_id).await {
            Err(e) if !e.is_not_found() => {
                self.event(
                    EventKind::Warning,
                    "DeleteENIFailed",
                    &format!("failed to delete eni({eni_id}): {e}"),
                )
                .await;
                return Err(ControllerError::cloud(format!("delete eni {eni_id}"), e));
            }
            _ => {}
        }
        self.event(EventKind::Normal, "DeleteENISuccess", &format!("delete eni({eni_id}) success"))
            .await;
        self.syncer.subnets.cancel_borrow(&eni_id);

        self.syncer.enis.delete(&self.name()).await.map_err(|e| {
            ControllerError::Reconciliation(format!("failed to delete eni({}) object: {e}", self.name()))
        })?;
        info!("Deleted ENI {} object", self.name());
        Ok(())
    }
}

impl std::fmt::Debug for EniStateMachine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EniStateMachine")
            .field("eni", &self.resource.name_any())
            .field("cloud_status", &self.cloud_status())
            .finish_non_exhaustive()
    }
}
