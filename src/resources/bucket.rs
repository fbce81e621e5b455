//! Object-store bucket converger.

use serde::Deserialize;

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::ObjectStoreApi;
use crate::tag_set::TagSet;
use crate::tag_strategy::ObjectStoreTagStrategy;

use super::{Converger, ResourceKind, ResourceRef, check_immutable, reconcile_tags};

/// Desired state of a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BucketDesired {
    /// Bucket name.
    pub name: String,
    /// Region, defaults to the configured one. Create-only.
    pub region: Option<String>,
    /// Object versioning.
    pub versioning: Option<bool>,
    /// Tags; an empty set clears every tag.
    pub tags: Option<TagSet>,
}

/// Converges object-store buckets.
#[derive(Debug)]
pub struct BucketConverger<'a, C> {
    client: &'a C,
    cfg: &'a ConvergeConfig,
}

impl<'a, C: ObjectStoreApi> BucketConverger<'a, C> {
    /// Converger using the given object-store client.
    #[must_use]
    pub const fn new(client: &'a C, cfg: &'a ConvergeConfig) -> Self {
        Self { client, cfg }
    }

    async fn converge_tags(&self, desired: &BucketDesired, log: &mut MutationLog) -> Result<bool, ConvergeError> {
        let Some(tags) = &desired.tags else {
            return Ok(false);
        };
        let strategy = ObjectStoreTagStrategy::new(self.client, &desired.name, tags);
        reconcile_tags(self.cfg, &strategy, Some(tags), log).await
    }

    async fn set_versioning(&self, name: &str, enabled: bool, log: &mut MutationLog) -> Result<(), ConvergeError> {
        log.record(format!("set versioning={enabled} on bucket {name}"));
        self.client.put_bucket_versioning(name, enabled).await?;
        Ok(())
    }

    async fn present(&self, desired: &BucketDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &desired.name;

        let Some(bucket) = self.client.describe_bucket(name).await? else {
            let region = desired.region.as_deref().unwrap_or(&self.cfg.region);
            log.record(format!("create bucket {name} in {region}"));
            let bucket = self.client.create_bucket(name, region).await?;
            log.identify(bucket.name);
            if desired.versioning == Some(true) {
                self.set_versioning(name, true, log).await?;
            }
            self.converge_tags(desired, log).await?;
            return Ok(OutcomeKind::Created);
        };
        log.identify(&bucket.name);

        check_immutable(Self::KIND, name, "region", desired.region.as_ref(), &bucket.region)?;

        let mut updated = false;
        if let Some(want) = desired.versioning
            && want != bucket.versioning_enabled
        {
            self.set_versioning(name, want, log).await?;
            updated = true;
        }
        updated |= self.converge_tags(desired, log).await?;

        Ok(if updated { OutcomeKind::Updated } else { OutcomeKind::Unchanged })
    }

    async fn absent(&self, target: &ResourceRef, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &target.name;
        if self.client.describe_bucket(name).await?.is_none() {
            return Ok(OutcomeKind::Unchanged);
        }
        log.identify(name);
        log.record(format!("delete bucket {name}"));
        self.client.delete_bucket(name).await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: ObjectStoreApi> Converger for BucketConverger<'_, C> {
    type Desired = BucketDesired;
    type Target = ResourceRef;

    const KIND: ResourceKind = ResourceKind::Bucket;

    async fn ensure_present(&self, desired: &BucketDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
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
    use crate::tag_strategy::TagStrategy;

    fn desired(tags: TagSet) -> BucketDesired {
        BucketDesired {
            name: "logs".into(),
            versioning: Some(true),
            tags: Some(tags),
            ..BucketDesired::default()
        }
    }

    #[tokio::test]
    async fn clearing_tags_takes_one_call_and_sticks() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = BucketConverger::new(&cloud, &cfg);
        let created = converger
            .ensure_present(&desired(TagSet::from_pairs([("a", "1"), ("b", "2")])))
            .await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger.ensure_present(&desired(TagSet::new())).await.ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Updated));
        assert_eq!(cloud.mutating_calls(), vec!["s3:DeleteBucketTagging".to_string()]);
        let strategy = ObjectStoreTagStrategy::new(&cloud, "logs", &TagSet::new());
        assert_eq!(strategy.current_tags().await.ok(), Some(TagSet::new()));

        cloud.reset_calls();
        let again = converger.ensure_present(&desired(TagSet::new())).await.ok();
        assert_eq!(again.map(|o| o.outcome), Some(OutcomeKind::Unchanged));
        assert!(cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn dropping_one_key_rewrites_the_set_once() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = BucketConverger::new(&cloud, &cfg);
        let created = converger
            .ensure_present(&desired(TagSet::from_pairs([("a", "1"), ("b", "2")])))
            .await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger
            .ensure_present(&desired(TagSet::from_pairs([("a", "1")])))
            .await;

        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(cloud.mutating_calls(), vec!["s3:PutBucketTagging".to_string()]);
    }

    async fn seed_with_stack_tag(cloud: &SandboxCloud) {
        cloud.seed_bucket("logs");
        let seed = ObjectStoreTagStrategy::new(cloud, "logs", &TagSet::new());
        let put = seed
            .set_tags(&TagSet::from_pairs([("aws:cloudformation:stack-name", "s"), ("a", "1")]))
            .await;
        assert!(put.is_ok(), "{put:?}");
        cloud.reset_calls();
    }

    #[tokio::test]
    async fn provider_managed_tags_survive_a_rewrite() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        seed_with_stack_tag(&cloud).await;
        let cfg = ConvergeConfig {
            reserved_tag_prefix: Some("aws:".into()),
            ..ConvergeConfig::default()
        };
        let converger = BucketConverger::new(&cloud, &cfg);

        let outcome = converger
            .ensure_present(&desired(TagSet::from_pairs([("a", "1"), ("b", "2")])))
            .await;

        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(cloud.mutating_calls().last(), Some(&"s3:PutBucketTagging".to_string()));
        let strategy = ObjectStoreTagStrategy::new(&cloud, "logs", &TagSet::new());
        let remote = strategy.current_tags().await.ok().unwrap_or_default();
        assert_eq!(remote.value("aws:cloudformation:stack-name"), Some("s"));
        assert_eq!(remote.value("b"), Some("2"));

        cloud.reset_calls();
        let again = converger
            .ensure_present(&desired(TagSet::from_pairs([("a", "1"), ("b", "2")])))
            .await
            .ok();
        assert_eq!(again.map(|o| o.outcome), Some(OutcomeKind::Unchanged));
        assert!(cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn clearing_tags_writes_back_provider_managed_ones() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        seed_with_stack_tag(&cloud).await;
        let cfg = ConvergeConfig {
            reserved_tag_prefix: Some("aws:".into()),
            ..ConvergeConfig::default()
        };
        let converger = BucketConverger::new(&cloud, &cfg);

        let outcome = converger.ensure_present(&desired(TagSet::new())).await;

        assert!(outcome.is_ok(), "{outcome:?}");
        assert!(!cloud.mutating_calls().contains(&"s3:DeleteBucketTagging".to_string()));
        let strategy = ObjectStoreTagStrategy::new(&cloud, "logs", &TagSet::new());
        assert_eq!(
            strategy.current_tags().await.ok(),
            Some(TagSet::from_pairs([("aws:cloudformation:stack-name", "s")]))
        );
    }

    #[tokio::test]
    async fn region_is_create_only() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = BucketConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired(TagSet::new())).await;
        assert!(created.is_ok(), "{created:?}");

        let failure = converger
            .ensure_present(&BucketDesired {
                region: Some("eu-west-1".into()),
                ..desired(TagSet::new())
            })
            .await
            .err();
        assert!(matches!(
            failure.map(|f| f.error),
            Some(ConvergeError::ImmutableAttributeConflict { attribute: "region", .. })
        ));
    }
}
