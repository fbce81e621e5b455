//! Search domain converger.

use serde::Deserialize;

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::{SearchApi, SearchDomain, SearchDomainChange, SearchDomainSpec};
use crate::tag_set::TagSet;
use crate::tag_strategy::SearchIndexTagStrategy;

use super::{Converger, ResourceKind, ResourceRef, check_immutable, reconcile_tags, require};

/// Desired state of a search domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchDomainDesired {
    /// Domain name.
    pub name: String,
    /// Engine version. Create-only.
    pub engine_version: Option<String>,
    /// Data node instance type.
    pub instance_type: Option<String>,
    /// Data node count.
    pub instance_count: Option<u32>,
    /// Tags, valueless ones allowed.
    pub tags: Option<TagSet>,
}

/// Converges search domains.
#[derive(Debug)]
pub struct SearchDomainConverger<'a, C> {
    client: &'a C,
    cfg: &'a ConvergeConfig,
}

impl<'a, C: SearchApi> SearchDomainConverger<'a, C> {
    /// Converger using the given search client.
    #[must_use]
    pub const fn new(client: &'a C, cfg: &'a ConvergeConfig) -> Self {
        Self { client, cfg }
    }

    fn changes(current: &SearchDomain, desired: &SearchDomainDesired) -> Vec<SearchDomainChange> {
        let mut out = Vec::new();
        if let Some(t) = &desired.instance_type
            && *t != current.instance_type
        {
            out.push(SearchDomainChange::InstanceType(t.clone()));
        }
        if let Some(n) = desired.instance_count
            && n != current.instance_count
        {
            out.push(SearchDomainChange::InstanceCount(n));
        }
        out
    }

    async fn present(&self, desired: &SearchDomainDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &desired.name;

        let Some(domain) = self.client.describe_domain(name).await? else {
            let spec = SearchDomainSpec {
                name: name.clone(),
                engine_version: require(Self::KIND, name, "engine_version", desired.engine_version.as_ref())?
                    .clone(),
                instance_type: require(Self::KIND, name, "instance_type", desired.instance_type.as_ref())?
                    .clone(),
                instance_count: *require(Self::KIND, name, "instance_count", desired.instance_count.as_ref())?,
            };
            log.record(format!(
                "create search domain {name} ({} x{})",
                spec.instance_type, spec.instance_count
            ));
            let domain = self.client.create_domain(&spec).await?;
            log.identify(&domain.arn);
            let strategy = SearchIndexTagStrategy::new(self.client, domain.arn);
            reconcile_tags(self.cfg, &strategy, desired.tags.as_ref(), log).await?;
            return Ok(OutcomeKind::Created);
        };
        log.identify(&domain.arn);

        check_immutable(
            Self::KIND,
            name,
            "engine_version",
            desired.engine_version.as_ref(),
            &domain.engine_version,
        )?;

        let changes = Self::changes(&domain, desired);
        let mut updated = !changes.is_empty();
        for change in changes {
            log.record(format!("update search domain {name}: {change:?}"));
            self.client.update_domain_config(name, change).await?;
        }

        let strategy = SearchIndexTagStrategy::new(self.client, domain.arn);
        updated |= reconcile_tags(self.cfg, &strategy, desired.tags.as_ref(), log).await?;

        Ok(if updated { OutcomeKind::Updated } else { OutcomeKind::Unchanged })
    }

    async fn absent(&self, target: &ResourceRef, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &target.name;
        let Some(domain) = self.client.describe_domain(name).await? else {
            return Ok(OutcomeKind::Unchanged);
        };
        log.identify(domain.arn);
        log.record(format!("delete search domain {name}"));
        self.client.delete_domain(name).await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: SearchApi> Converger for SearchDomainConverger<'_, C> {
    type Desired = SearchDomainDesired;
    type Target = ResourceRef;

    const KIND: ResourceKind = ResourceKind::SearchDomain;

    async fn ensure_present(&self, desired: &SearchDomainDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
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

    fn desired() -> SearchDomainDesired {
        let mut tags = TagSet::from_pairs([("team", "search")]);
        tags.insert("flag", None);
        SearchDomainDesired {
            name: "catalog".into(),
            engine_version: Some("OpenSearch_2.11".into()),
            instance_type: Some("t3.small.search".into()),
            instance_count: Some(2),
            tags: Some(tags),
        }
    }

    #[tokio::test]
    async fn valueless_tags_are_stable_across_passes() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = SearchDomainConverger::new(&cloud, &cfg);

        let first = converger.ensure_present(&desired()).await.ok();
        assert_eq!(first.map(|o| o.outcome), Some(OutcomeKind::Created));

        cloud.reset_calls();
        let second = converger.ensure_present(&desired()).await.ok();
        assert_eq!(second.map(|o| o.outcome), Some(OutcomeKind::Unchanged));
        assert!(cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn scaling_out_is_one_config_update() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = SearchDomainConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger
            .ensure_present(&SearchDomainDesired {
                instance_count: Some(4),
                ..desired()
            })
            .await;

        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(cloud.mutating_calls(), vec!["es:UpdateDomainConfig".to_string()]);
    }

    #[tokio::test]
    async fn engine_version_is_create_only() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = SearchDomainConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let failure = converger
            .ensure_present(&SearchDomainDesired {
                engine_version: Some("OpenSearch_2.13".into()),
                instance_count: Some(4),
                ..desired()
            })
            .await
            .err();

        assert!(matches!(
            failure.as_ref().map(|f| &f.error),
            Some(ConvergeError::ImmutableAttributeConflict { attribute: "engine_version", .. })
        ));
        assert!(failure.is_some_and(|f| f.outcome.id.is_some_and(|id| id.contains("domain/catalog"))));
        assert!(cloud.mutating_calls().is_empty());
    }
}
