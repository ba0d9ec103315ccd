//! ENI syncer.
//!
//! Reconciles ENI custom resources against the cloud. Every create or update
//! event runs one pass of the [`state_machine`] after the `eni-syncer`
//! finalizer has been managed; writes that hit a stale resource version are
//! retried with a fresh copy.

pub mod state_machine;


use std::sync::Arc;
use std::time::Duration;

use cloud_client::{CloudClientTrait, ListEnisArgs};
use crds::{ENI, ENI_FINALIZER, EniType, EniUseMode, VpcEniStatus};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::EventRecorder;
use crate::ipam::subnet::SubnetBorrowTracker;
use crate::reconcile_helpers::{is_being_deleted, remove_finalizer};
use crate::store::{EniStore, NetResourceSetStore};
use state_machine::{EniStateMachine, MachineOutcome};

/// Delay before a non-final interface is looked at again
pub const ENI_READY_TIME_TO_ATTACH: Duration = Duration::from_secs(1);

/// Interfaces still not attached this long after creation are deleted
pub const ENI_MAX_CREATE_DURATION: Duration = Duration::from_secs(5 * 60);

/// Attempts of one update pass on stale resource versions
const UPDATE_ATTEMPTS: usize = 3;

/// What the caller should do after a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to do until the object changes
    Done,
    /// Look at the object again after the delay
    Requeue(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizerChange {
    Unchanged,
    Added,
    Removed,
}

/// Reconciles ENI objects with the cloud
pub struct EniSyncer {
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) cloud: Arc<dyn CloudClientTrait>,
    pub(crate) enis: Arc<dyn EniStore>,
    pub(crate) nodes: Arc<dyn NetResourceSetStore>,
    pub(crate) events: Arc<dyn EventRecorder>,
    pub(crate) subnets: Arc<SubnetBorrowTracker>,
}

impl EniSyncer {
    pub fn new(
        config: Arc<ControllerConfig>,
        cloud: Arc<dyn CloudClientTrait>,
        enis: Arc<dyn EniStore>,
        nodes: Arc<dyn NetResourceSetStore>,
        events: Arc<dyn EventRecorder>,
        subnets: Arc<SubnetBorrowTracker>,
    ) -> Self {
        Self {
            config,
            cloud,
            enis,
            nodes,
            events,
            subnets,
        }
    }

    /// A new ENI object was observed
    pub async fn create(&self, resource: &ENI) -> Result<SyncOutcome, ControllerError> {
        if resource.spec.eni_type == EniType::Bbc {
            return Ok(SyncOutcome::Done);
        }
        info!("Create a new ENI {} object", resource.name_any());
        self.update(resource).await
    }

    /// An ENI object changed
    pub async fn update(&self, resource: &ENI) -> Result<SyncOutcome, ControllerError> {
        if resource.spec.eni_type == EniType::Bbc {
            return Ok(SyncOutcome::Done);
        }

        let name = resource.name_any();
        let mut current = resource.clone();
        let mut attempt = 1;
        loop {
            match self.handle_update(&current).await {
                Err(e) if (e.is_conflict() || e.is_resource_expired()) && attempt < UPDATE_ATTEMPTS => {
                    debug!("Retrying update of ENI {} (attempt {}): {}", name, attempt, e);
                    attempt += 1;
                    match self.enis.get(&name).await? {
                        Some(latest) => current = latest,
                        None => return Ok(SyncOutcome::Done),
                    }
                }
                other => return other,
            }
        }
    }

    /// An ENI object was deleted, release it from the finalizer if possible
    pub async fn delete(&self, name: &str) -> Result<(), ControllerError> {
        info!("ENI {} has been deleted", name);
        let Some(mut eni) = self.enis.get(name).await? else {
            return Ok(());
        };
        if self.manage_finalizer(&mut eni).await? == FinalizerChange::Removed {
            if let Err(e) = self.enis.update(&eni).await {
                error!("Failed to remove finalizer of ENI {}: {}", name, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Re-run the state machine for every interface whose cloud status moved.
    ///
    /// Returns the period after which the next resync is due.
    pub async fn resync_enis(&self) -> Result<Duration, ControllerError> {
        info!("Start to resync ENIs of VPC {}", self.config.vpc_id);
        let args = ListEnisArgs {
            vpc_id: self.config.vpc_id.clone(),
            ..Default::default()
        };
        let remote = self
            .cloud
            .list_enis(&args)
            .await
            .map_err(|e| ControllerError::cloud(format!("list enis of vpc {}", self.config.vpc_id), e))?;

        let mut changed = 0;
        for cloud_eni in &remote {
            let Some(local) = self.enis.get(&cloud_eni.eni_id).await? else {
                continue;
            };
            let status = cloud_eni.status.parse::<VpcEniStatus>().unwrap_or_default();
            if local.vpc_status() == status {
                continue;
            }
            changed += 1;
            if let Err(e) = self.update(&local).await {
                warn!("Failed to resync ENI {}: {}", cloud_eni.eni_id, e);
            }
        }
        debug!("Resynced {} ENIs, {} changed", remote.len(), changed);
        Ok(self.config.eni_resync_interval)
    }

    async fn handle_update(&self, resource: &ENI) -> Result<SyncOutcome, ControllerError> {
        if resource.vpc_status() == VpcEniStatus::Deleted {
            return Ok(SyncOutcome::Done);
        }

        let mut eni = resource.clone();
        match self.manage_finalizer(&mut eni).await? {
            FinalizerChange::Removed => {
                info!("ENI {} should remove finalizers", eni.name_any());
                self.enis.update(&eni).await?;
                return Ok(SyncOutcome::Done);
            }
            FinalizerChange::Added => {
                eni = self.enis.update(&eni).await?;
            }
            FinalizerChange::Unchanged => {}
        }

        // the built-in interface of a host is driven by its node adapter
        if eni.spec.use_mode == EniUseMode::PrimaryWithSecondaryIp {
            self.subnets.force_borrow_for_eni(&eni);
            return Ok(SyncOutcome::Done);
        }

        let original_status = eni.status.clone();
        let mut machine = EniStateMachine::new(self, eni);
        let outcome = machine.start().await;
        let eni = machine.into_resource();

        let requeue = match outcome {
            Ok(MachineOutcome::Synced) => {
                self.subnets.force_borrow_for_eni(&eni);
                return Ok(SyncOutcome::Done);
            }
            Ok(MachineOutcome::Continue) => SyncOutcome::Done,
            Ok(MachineOutcome::Delay(delay)) => SyncOutcome::Requeue(delay),
            Err(e) => {
                error!("ENI state machine of {} failed: {}", eni.name_any(), e);
                return Err(e);
            }
        };

        if eni.status != original_status {
            let Some(mut latest) = self.enis.get(&eni.name_any()).await? else {
                return Ok(SyncOutcome::Done);
            };
            latest.status = eni.status.clone();
            self.enis.update_status(&latest).await?;
            info!(
                "Updated status of ENI {} from {} to {}",
                eni.name_any(),
                original_status.unwrap_or_default().vpc_status,
                eni.vpc_status()
            );
        }

        self.subnets.force_borrow_for_eni(&eni);
        Ok(requeue)
    }

    /// Add the finalizer on first sight, drop it once the interface may go.
    ///
    /// A deleted interface keeps its finalizer while its NetResourceSet is
    /// alive, owns it, and the interface is still in use.
    async fn manage_finalizer(&self, eni: &mut ENI) -> Result<FinalizerChange, ControllerError> {
        if !is_being_deleted(&eni.metadata) {
            if eni.finalizers().is_empty() {
                eni.finalizers_mut().push(ENI_FINALIZER.to_string());
                return Ok(FinalizerChange::Added);
            }
            return Ok(FinalizerChange::Unchanged);
        }
        if !eni.finalizers().iter().any(|f| f == ENI_FINALIZER) {
            return Ok(FinalizerChange::Unchanged);
        }

        let deletable = match self.nodes.get(&eni.spec.node_name).await? {
            None => true,
            Some(node) if is_being_deleted(&node.metadata) => true,
            Some(node) => {
                let owner_uid = eni.owner_references().first().map(|o| o.uid.as_str());
                let owner_mismatch = owner_uid.is_some_and(|uid| Some(uid) != node.metadata.uid.as_deref());
                owner_mismatch || !matches!(eni.vpc_status(), VpcEniStatus::Deleted | VpcEniStatus::InUse)
            }
        };
        if !deletable {
            return Ok(FinalizerChange::Unchanged);
        }

        remove_finalizer(&mut eni.metadata, ENI_FINALIZER);
        info!(
            "Remove finalizer from deletable ENI {} on NetResourceSet {}",
            eni.name_any(),
            eni.spec.node_name
        );
        Ok(FinalizerChange::Removed)
    }
}

impl std::fmt::Debug for EniSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EniSyncer")
            .field("vpc_id", &self.config.vpc_id)
            .field("endpoint", &self.cloud.endpoint())
            .finish_non_exhaustive()
    }
}
