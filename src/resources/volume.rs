//! Block volume converger.

use serde::Deserialize;
use tracing::warn;

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::{ComputeApi, Volume, VolumeChange, VolumeSpec};
use crate::tag_set::TagSet;
use crate::tag_strategy::InstanceTagStrategy;

use super::{
    Converger, NAME_TAG, ResourceKind, ResourceRef, check_immutable, reconcile_tags, require,
    single, with_name_tag,
};

const DEFAULT_VOLUME_TYPE: &str = "gp3";

/// Desired state of a block volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VolumeDesired {
    /// Logical name, stored in the `Name` tag.
    pub name: String,
    /// Volume id, when already known.
    pub id: Option<String>,
    /// Availability zone. Create-only.
    pub availability_zone: Option<String>,
    /// Size in GiB.
    pub size: Option<u32>,
    /// Volume type (default `gp3` on create).
    pub volume_type: Option<String>,
    /// Provisioned IOPS.
    pub iops: Option<u32>,
    /// Encryption at rest. Create-only.
    pub encrypted: Option<bool>,
    /// Source snapshot. Create-only.
    pub snapshot_id: Option<String>,
    /// Tags; `Name` is added automatically.
    pub tags: Option<TagSet>,
}

impl VolumeDesired {
    /// How to find this volume.
    #[must_use]
    pub fn target(&self) -> ResourceRef {
        ResourceRef {
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }
}

/// Converges block volumes.
#[derive(Debug)]
pub struct VolumeConverger<'a, C> {
    client: &'a C,
    cfg: &'a ConvergeConfig,
}

impl<'a, C: ComputeApi> VolumeConverger<'a, C> {
    /// Converger using the given compute client.
    #[must_use]
    pub const fn new(client: &'a C, cfg: &'a ConvergeConfig) -> Self {
        Self { client, cfg }
    }

    async fn find(&self, target: &ResourceRef) -> Result<Option<Volume>, ConvergeError> {
        if let Some(id) = &target.id {
            let found = self.client.describe_volume(id).await?;
            if found.is_none() {
                warn!(name = %target.name, id = %id, "recorded volume id no longer exists");
            }
            return Ok(found);
        }
        let found = self.client.find_volumes_by_name(&target.name).await?;
        single(Self::KIND, &target.name, found)
    }

    async fn create(&self, desired: &VolumeDesired, log: &mut MutationLog) -> Result<(), ConvergeError> {
        let name = &desired.name;
        let spec = VolumeSpec {
            availability_zone: require(Self::KIND, name, "availability_zone", desired.availability_zone.as_ref())?
                .clone(),
            size: *require(Self::KIND, name, "size", desired.size.as_ref())?,
            volume_type: desired
                .volume_type
                .clone()
                .unwrap_or_else(|| DEFAULT_VOLUME_TYPE.to_string()),
            iops: desired.iops,
            encrypted: desired.encrypted.unwrap_or(false),
            snapshot_id: desired.snapshot_id.clone(),
        };

        log.record(format!(
            "create {} GiB {} volume in {}",
            spec.size, spec.volume_type, spec.availability_zone
        ));
        let volume = self.client.create_volume(&spec).await?;
        log.identify(&volume.id);

        let tags = with_name_tag(desired.tags.as_ref(), name)
            .unwrap_or_else(|| TagSet::new().with(NAME_TAG, name));
        let strategy = InstanceTagStrategy::new(self.client, volume.id.clone());
        reconcile_tags(self.cfg, &strategy, Some(&tags), log).await?;
        Ok(())
    }

    fn check_create_only(&self, volume: &Volume, desired: &VolumeDesired) -> Result<(), ConvergeError> {
        let name = &desired.name;
        check_immutable(
            Self::KIND,
            name,
            "availability_zone",
            desired.availability_zone.as_ref(),
            &volume.availability_zone,
        )?;
        check_immutable(Self::KIND, name, "encrypted", desired.encrypted.as_ref(), &volume.encrypted)?;
        check_immutable(
            Self::KIND,
            name,
            "snapshot_id",
            desired.snapshot_id.as_ref().map(Some).as_ref(),
            &volume.snapshot_id.as_ref(),
        )
    }

    async fn converge_attributes(
        &self,
        volume: &Volume,
        desired: &VolumeDesired,
        log: &mut MutationLog,
    ) -> Result<bool, ConvergeError> {
        let mut changes = Vec::new();
        if let Some(size) = desired.size
            && size != volume.size
        {
            changes.push(VolumeChange::Size(size));
        }
        if let Some(volume_type) = &desired.volume_type
            && *volume_type != volume.volume_type
        {
            changes.push(VolumeChange::VolumeType(volume_type.clone()));
        }
        if let Some(iops) = desired.iops
            && Some(iops) != volume.iops
        {
            changes.push(VolumeChange::Iops(iops));
        }

        let changed = !changes.is_empty();
        for change in changes {
            log.record(format!("modify volume {}: {change:?}", volume.id));
            self.client.modify_volume(&volume.id, change).await?;
        }
        Ok(changed)
    }

    async fn present(&self, desired: &VolumeDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let Some(volume) = self.find(&desired.target()).await? else {
            self.create(desired, log).await?;
            return Ok(OutcomeKind::Created);
        };
        log.identify(&volume.id);

        self.check_create_only(&volume, desired)?;
        let mut updated = self.converge_attributes(&volume, desired, log).await?;

        let strategy = InstanceTagStrategy::new(self.client, volume.id.clone());
        let tags = with_name_tag(desired.tags.as_ref(), &desired.name);
        updated |= reconcile_tags(self.cfg, &strategy, tags.as_ref(), log).await?;

        Ok(if updated { OutcomeKind::Updated } else { OutcomeKind::Unchanged })
    }

    async fn absent(&self, target: &ResourceRef, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        if let Some(id) = &target.id {
            log.identify(id);
        }
        let Some(volume) = self.find(target).await? else {
            return Ok(OutcomeKind::Unchanged);
        };
        log.identify(&volume.id);
        log.record(format!("delete volume {}", volume.id));
        self.client.delete_volume(&volume.id).await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: ComputeApi> Converger for VolumeConverger<'_, C> {
    type Desired = VolumeDesired;
    type Target = ResourceRef;

    const KIND: ResourceKind = ResourceKind::Volume;

    async fn ensure_present(&self, desired: &VolumeDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
        let mut log = MutationLog::new(Self::KIND, &desired.name);
        let result = self.present(desired, &mut log).await;
        log.settle(result)
    }

    async fn ensure_absent(&self, target: &ResourceRef) -> Result<ConvergenceOutcome, ConvergeFailure> {
        let mut log = MutationLog::new(Self::KIND, &target.name);
        let result = self.absent(target, &mut log).await;
        log.settle(result)
    }
}
