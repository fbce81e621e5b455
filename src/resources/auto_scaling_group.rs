//! Autoscaling group converger.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::{AutoScalingApi, AutoScalingGroup, AutoScalingGroupUpdate};
use crate::tag_set::TagSet;
use crate::tag_strategy::AutoScalingTagStrategy;

use super::{Converger, ResourceKind, ResourceRef, reconcile_tags, require};

/// Desired state of an autoscaling group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AutoScalingGroupDesired {
    /// Group name.
    pub name: String,
    /// Launch configuration name.
    pub launch_configuration: Option<String>,
    /// Minimum size.
    pub min_size: Option<u32>,
    /// Maximum size.
    pub max_size: Option<u32>,
    /// Desired capacity.
    pub desired_capacity: Option<u32>,
    /// Zones, in any order.
    pub availability_zones: Option<Vec<String>>,
    /// Tags; never propagated to instances.
    pub tags: Option<TagSet>,
}

/// Converges autoscaling groups.
#[derive(Debug)]
pub struct AutoScalingGroupConverger<'a, C> {
    client: &'a C,
    cfg: &'a ConvergeConfig,
}

impl<'a, C: AutoScalingApi> AutoScalingGroupConverger<'a, C> {
    /// Converger using the given autoscaling client.
    #[must_use]
    pub const fn new(client: &'a C, cfg: &'a ConvergeConfig) -> Self {
        Self { client, cfg }
    }

    fn group(desired: &AutoScalingGroupDesired) -> Result<AutoScalingGroup, ConvergeError> {
        let kind = ResourceKind::AutoScalingGroup;
        let name = &desired.name;
        Ok(AutoScalingGroup {
            name: name.clone(),
            launch_configuration: require(kind, name, "launch_configuration", desired.launch_configuration.as_ref())?
                .clone(),
            min_size: *require(kind, name, "min_size", desired.min_size.as_ref())?,
            max_size: *require(kind, name, "max_size", desired.max_size.as_ref())?,
            desired_capacity: desired.desired_capacity,
            availability_zones: require(kind, name, "availability_zones", desired.availability_zones.as_ref())?
                .clone(),
        })
    }

    fn update(current: &AutoScalingGroup, desired: &AutoScalingGroupDesired) -> AutoScalingGroupUpdate {
        let zones_differ = |want: &Vec<String>| {
            want.iter().collect::<BTreeSet<_>>() != current.availability_zones.iter().collect::<BTreeSet<_>>()
        };
        AutoScalingGroupUpdate {
            launch_configuration: desired
                .launch_configuration
                .clone()
                .filter(|l| *l != current.launch_configuration),
            min_size: desired.min_size.filter(|n| *n != current.min_size),
            max_size: desired.max_size.filter(|n| *n != current.max_size),
            desired_capacity: desired
                .desired_capacity
                .filter(|n| Some(*n) != current.desired_capacity),
            availability_zones: desired.availability_zones.clone().filter(zones_differ),
        }
    }

    async fn present(&self, desired: &AutoScalingGroupDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &desired.name;
        let strategy = AutoScalingTagStrategy::new(self.client, name.clone());

        let Some(current) = self.client.describe_auto_scaling_group(name).await? else {
            let group = Self::group(desired)?;
            log.record(format!(
                "create autoscaling group {name} ({}..{}) from {}",
                group.min_size, group.max_size, group.launch_configuration
            ));
            self.client.create_auto_scaling_group(&group).await?;
            log.identify(name);
            reconcile_tags(self.cfg, &strategy, desired.tags.as_ref(), log).await?;
            return Ok(OutcomeKind::Created);
        };
        log.identify(name);

        let update = Self::update(&current, desired);
        let mut updated = !update.is_empty();
        if updated {
            log.record(format!("update autoscaling group {name}: {update:?}"));
            self.client.update_auto_scaling_group(name, &update).await?;
        }
        updated |= reconcile_tags(self.cfg, &strategy, desired.tags.as_ref(), log).await?;

        Ok(if updated { OutcomeKind::Updated } else { OutcomeKind::Unchanged })
    }

    async fn absent(&self, target: &ResourceRef, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &target.name;
        if self.client.describe_auto_scaling_group(name).await?.is_none() {
            return Ok(OutcomeKind::Unchanged);
        }
        log.identify(name);
        log.record(format!("delete autoscaling group {name} with its instances"));
        self.client.delete_auto_scaling_group(name, true).await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: AutoScalingApi> Converger for AutoScalingGroupConverger<'_, C> {
    type Desired = AutoScalingGroupDesired;
    type Target = ResourceRef;

    const KIND: ResourceKind = ResourceKind::AutoScalingGroup;

    async fn ensure_present(&self, desired: &AutoScalingGroupDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxCloud;

    fn desired() -> AutoScalingGroupDesired {
        AutoScalingGroupDesired {
            name: "workers".into(),
            launch_configuration: Some("lc-1".into()),
            min_size: Some(1),
            max_size: Some(3),
            availability_zones: Some(vec!["us-east-1a".into(), "us-east-1b".into()]),
            tags: Some(TagSet::from_pairs([("role", "worker")])),
            ..AutoScalingGroupDesired::default()
        }
    }

    #[tokio::test]
    async fn several_field_changes_share_one_update() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = AutoScalingGroupConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger
            .ensure_present(&AutoScalingGroupDesired {
                max_size: Some(6),
                desired_capacity: Some(2),
                availability_zones: Some(vec!["us-east-1b".into(), "us-east-1a".into()]),
                ..desired()
            })
            .await
            .ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Updated));
        assert_eq!(cloud.mutating_calls(), vec!["autoscaling:UpdateAutoScalingGroup".to_string()]);
    }

    #[test]
    fn update_only_carries_divergent_fields() {
        let current = AutoScalingGroup {
            name: "workers".into(),
            launch_configuration: "lc-1".into(),
            min_size: 1,
            max_size: 3,
            desired_capacity: None,
            availability_zones: vec!["us-east-1a".into(), "us-east-1b".into()],
        };
        let update = AutoScalingGroupConverger::<SandboxCloud>::update(
            &current,
            &AutoScalingGroupDesired {
                min_size: Some(2),
                ..desired()
            },
        );
        assert_eq!(
            update,
            AutoScalingGroupUpdate {
                min_size: Some(2),
                ..AutoScalingGroupUpdate::default()
            }
        );
    }

    #[tokio::test]
    async fn destroy_forces_deletion() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = AutoScalingGroupConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger.ensure_absent(&ResourceRef::named("workers")).await.ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Destroyed));
        assert_eq!(cloud.mutating_calls(), vec!["autoscaling:DeleteAutoScalingGroup".to_string()]);
    }

    #[tokio::test]
    async fn missing_launch_configuration_fails_before_any_call() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let failure = AutoScalingGroupConverger::new(&cloud, &cfg)
            .ensure_present(&AutoScalingGroupDesired {
                launch_configuration: None,
                ..desired()
            })
            .await
            .err();

        assert!(matches!(
            failure.as_ref().map(|f| &f.error),
            Some(ConvergeError::MissingAttribute { attribute: "launch_configuration", .. })
        ));
        let outcome = failure.map(|f| f.outcome);
        assert_eq!(outcome.as_ref().map(|o| o.mutated), Some(false));
        assert_eq!(outcome.and_then(|o| o.id), None);
        assert!(cloud.mutating_calls().is_empty());
    }
}
