//! Classic load balancer converger.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::{LoadBalancer, LoadBalancerApi, LoadBalancerSpec};
use crate::tag_set::TagSet;
use crate::tag_strategy::LoadBalancerTagStrategy;

use super::{Converger, ResourceKind, ResourceRef, check_immutable, reconcile_tags, require};

const DEFAULT_SCHEME: &str = "internet-facing";

/// Desired state of a load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoadBalancerDesired {
    /// Access point name.
    pub name: String,
    /// `internet-facing` (default) or `internal`. Create-only.
    pub scheme: Option<String>,
    /// Subnets to attach.
    pub subnets: Option<Vec<String>>,
    /// Security groups to apply.
    pub security_groups: Option<Vec<String>>,
    /// Tags.
    pub tags: Option<TagSet>,
}

/// Converges load balancers.
#[derive(Debug)]
pub struct LoadBalancerConverger<'a, C> {
    client: &'a C,
    cfg: &'a ConvergeConfig,
}

fn set_of(items: &[String]) -> BTreeSet<&str> {
    items.iter().map(String::as_str).collect()
}

impl<'a, C: LoadBalancerApi> LoadBalancerConverger<'a, C> {
    /// Converger using the given load balancing client.
    #[must_use]
    pub const fn new(client: &'a C, cfg: &'a ConvergeConfig) -> Self {
        Self { client, cfg }
    }

    /// Attach new subnets before detaching old ones so the balancer never sits in zero subnets.
    async fn converge_subnets(
        &self,
        current: &LoadBalancer,
        desired: &[String],
        log: &mut MutationLog,
    ) -> Result<bool, ConvergeError> {
        let have = set_of(&current.subnets);
        let want = set_of(desired);
        let attach: Vec<String> = want.difference(&have).map(|s| (*s).to_string()).collect();
        let detach: Vec<String> = have.difference(&want).map(|s| (*s).to_string()).collect();

        if !attach.is_empty() {
            log.record(format!("attach {} to subnets {attach:?}", current.name));
            self.client.attach_to_subnets(&current.name, &attach).await?;
        }
        if !detach.is_empty() {
            log.record(format!("detach {} from subnets {detach:?}", current.name));
            self.client.detach_from_subnets(&current.name, &detach).await?;
        }
        Ok(!attach.is_empty() || !detach.is_empty())
    }

    async fn present(&self, desired: &LoadBalancerDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &desired.name;
        let strategy = LoadBalancerTagStrategy::new(self.client, name.clone());

        let Some(current) = self.client.describe_load_balancer(name).await? else {
            let spec = LoadBalancerSpec {
                name: name.clone(),
                scheme: desired
                    .scheme
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SCHEME.to_string()),
                subnets: require(Self::KIND, name, "subnets", desired.subnets.as_ref())?.clone(),
                security_groups: desired.security_groups.clone().unwrap_or_default(),
            };
            log.record(format!("create {} load balancer {name} in {:?}", spec.scheme, spec.subnets));
            let created = self.client.create_load_balancer(&spec).await?;
            log.identify(created.dns_name);
            reconcile_tags(self.cfg, &strategy, desired.tags.as_ref(), log).await?;
            return Ok(OutcomeKind::Created);
        };
        log.identify(&current.dns_name);

        check_immutable(Self::KIND, name, "scheme", desired.scheme.as_ref(), &current.scheme)?;

        let mut updated = false;
        if let Some(subnets) = &desired.subnets {
            updated |= self.converge_subnets(&current, subnets, log).await?;
        }
        if let Some(groups) = &desired.security_groups
            && set_of(groups) != set_of(&current.security_groups)
        {
            log.record(format!("apply security groups {groups:?} to {name}"));
            self.client.apply_security_groups(name, groups).await?;
            updated = true;
        }
        updated |= reconcile_tags(self.cfg, &strategy, desired.tags.as_ref(), log).await?;

        Ok(if updated { OutcomeKind::Updated } else { OutcomeKind::Unchanged })
    }

    async fn absent(&self, target: &ResourceRef, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &target.name;
        let Some(current) = self.client.describe_load_balancer(name).await? else {
            return Ok(OutcomeKind::Unchanged);
        };
        log.identify(current.dns_name);
        log.record(format!("delete load balancer {name}"));
        self.client.delete_load_balancer(name).await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: LoadBalancerApi> Converger for LoadBalancerConverger<'_, C> {
    type Desired = LoadBalancerDesired;
    type Target = ResourceRef;

    const KIND: ResourceKind = ResourceKind::LoadBalancer;

    async fn ensure_present(&self, desired: &LoadBalancerDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
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

    fn desired() -> LoadBalancerDesired {
        LoadBalancerDesired {
            name: "web".into(),
            subnets: Some(vec!["subnet-a".into(), "subnet-b".into()]),
            security_groups: Some(vec!["sg-1".into()]),
            tags: Some(TagSet::from_pairs([("env", "prod")])),
            ..LoadBalancerDesired::default()
        }
    }

    #[tokio::test]
    async fn swapping_a_subnet_attaches_then_detaches() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = LoadBalancerConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger
            .ensure_present(&LoadBalancerDesired {
                subnets: Some(vec!["subnet-b".into(), "subnet-c".into()]),
                ..desired()
            })
            .await
            .ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Updated));
        assert_eq!(
            cloud.mutating_calls(),
            vec![
                "elb:AttachLoadBalancerToSubnets".to_string(),
                "elb:DetachLoadBalancerFromSubnets".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn reordered_security_groups_are_unchanged() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = LoadBalancerConverger::new(&cloud, &cfg);
        let two_groups = LoadBalancerDesired {
            security_groups: Some(vec!["sg-1".into(), "sg-2".into()]),
            ..desired()
        };
        let created = converger.ensure_present(&two_groups).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger
            .ensure_present(&LoadBalancerDesired {
                security_groups: Some(vec!["sg-2".into(), "sg-1".into()]),
                ..desired()
            })
            .await
            .ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Unchanged));
        assert!(cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn scheme_is_create_only() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = LoadBalancerConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");

        let failure = converger
            .ensure_present(&LoadBalancerDesired {
                scheme: Some("internal".into()),
                ..desired()
            })
            .await
            .err();
        assert!(matches!(
            failure.map(|f| f.error),
            Some(ConvergeError::ImmutableAttributeConflict { attribute: "scheme", .. })
        ));
    }

    #[tokio::test]
    async fn failed_detach_still_lists_the_attach() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = LoadBalancerConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();
        cloud.fail_next("elb:DetachLoadBalancerFromSubnets", "Throttling");

        let failure = converger
            .ensure_present(&LoadBalancerDesired {
                subnets: Some(vec!["subnet-b".into(), "subnet-c".into()]),
                ..desired()
            })
            .await
            .err();

        assert!(matches!(
            failure.as_ref().map(|f| &f.error),
            Some(ConvergeError::Transport(e)) if e.code == "Throttling"
        ));
        let outcome = failure.map(|f| f.outcome);
        assert_eq!(outcome.as_ref().map(|o| o.outcome), Some(OutcomeKind::Failed));
        assert_eq!(outcome.as_ref().map(|o| o.mutated), Some(true));
        assert_eq!(outcome.as_ref().map(|o| o.actions.len()), Some(2));
        assert!(outcome.is_some_and(|o| o.actions[0].starts_with("attach web")));
    }
}
