//! Relational database instance converger.

use serde::Deserialize;

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::{DbInstance, DbInstanceSpec, DbModification, IdentityApi, RelationalApi};
use crate::tag_set::TagSet;
use crate::tag_strategy::{RelationalStoreTagStrategy, resolve_account_id};

use super::{Converger, ResourceKind, ResourceRef, check_immutable, reconcile_tags, require};

/// Desired state of a database instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DbInstanceDesired {
    /// Instance identifier.
    pub name: String,
    /// Engine. Create-only.
    pub engine: Option<String>,
    /// Engine version.
    pub engine_version: Option<String>,
    /// Instance class.
    pub instance_class: Option<String>,
    /// Storage in GiB.
    pub allocated_storage: Option<u32>,
    /// Multi-zone deployment.
    pub multi_az: Option<bool>,
    /// Master user name. Create-only.
    pub master_username: Option<String>,
    /// Master password, used on create only.
    pub master_password: Option<String>,
    /// Tags, valueless ones allowed.
    pub tags: Option<TagSet>,
}

/// Converges relational database instances.
#[derive(Debug)]
pub struct DbInstanceConverger<'a, C> {
    client: &'a C,
    cfg: &'a ConvergeConfig,
}

impl<'a, C: RelationalApi + IdentityApi> DbInstanceConverger<'a, C> {
    /// Converger using the given relational and identity client.
    #[must_use]
    pub const fn new(client: &'a C, cfg: &'a ConvergeConfig) -> Self {
        Self { client, cfg }
    }

    async fn account_id(&self) -> Result<String, ConvergeError> {
        match &self.cfg.account_id {
            Some(id) => Ok(id.clone()),
            None => resolve_account_id(self.client).await,
        }
    }

    async fn converge_tags(&self, desired: &DbInstanceDesired, log: &mut MutationLog) -> Result<bool, ConvergeError> {
        if desired.tags.is_none() {
            return Ok(false);
        }
        let account_id = self.account_id().await?;
        let strategy = RelationalStoreTagStrategy::for_db_instance(
            self.client,
            &self.cfg.partition,
            &self.cfg.region,
            &account_id,
            &desired.name,
        );
        reconcile_tags(self.cfg, &strategy, desired.tags.as_ref(), log).await
    }

    fn spec(desired: &DbInstanceDesired) -> Result<DbInstanceSpec, ConvergeError> {
        let kind = ResourceKind::DbInstance;
        let name = &desired.name;
        Ok(DbInstanceSpec {
            identifier: name.clone(),
            engine: require(kind, name, "engine", desired.engine.as_ref())?.clone(),
            engine_version: desired.engine_version.clone(),
            instance_class: require(kind, name, "instance_class", desired.instance_class.as_ref())?.clone(),
            allocated_storage: *require(kind, name, "allocated_storage", desired.allocated_storage.as_ref())?,
            multi_az: desired.multi_az.unwrap_or(false),
            master_username: require(kind, name, "master_username", desired.master_username.as_ref())?.clone(),
            master_password: require(kind, name, "master_password", desired.master_password.as_ref())?.clone(),
        })
    }

    fn modifications(current: &DbInstance, desired: &DbInstanceDesired) -> Vec<DbModification> {
        let mut out = Vec::new();
        if let Some(v) = &desired.engine_version
            && *v != current.engine_version
        {
            out.push(DbModification::EngineVersion(v.clone()));
        }
        if let Some(c) = &desired.instance_class
            && *c != current.instance_class
        {
            out.push(DbModification::InstanceClass(c.clone()));
        }
        if let Some(s) = desired.allocated_storage
            && s != current.allocated_storage
        {
            out.push(DbModification::AllocatedStorage(s));
        }
        if let Some(m) = desired.multi_az
            && m != current.multi_az
        {
            out.push(DbModification::MultiAz(m));
        }
        out
    }

    async fn present(&self, desired: &DbInstanceDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &desired.name;

        let Some(current) = self.client.describe_db_instance(name).await? else {
            let spec = Self::spec(desired)?;
            log.record(format!(
                "create {} instance {name} ({}, {} GiB)",
                spec.engine, spec.instance_class, spec.allocated_storage
            ));
            self.client.create_db_instance(&spec).await?;
            log.identify(name);
            self.converge_tags(desired, log).await?;
            return Ok(OutcomeKind::Created);
        };
        log.identify(name);

        check_immutable(Self::KIND, name, "engine", desired.engine.as_ref(), &current.engine)?;
        check_immutable(
            Self::KIND,
            name,
            "master_username",
            desired.master_username.as_ref(),
            &current.master_username,
        )?;

        let modifications = Self::modifications(&current, desired);
        let mut updated = !modifications.is_empty();
        for modification in modifications {
            log.record(format!("modify db instance {name}: {modification:?}"));
            self.client.modify_db_instance(name, modification).await?;
        }

        updated |= self.converge_tags(desired, log).await?;

        Ok(if updated { OutcomeKind::Updated } else { OutcomeKind::Unchanged })
    }

    async fn absent(&self, target: &ResourceRef, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = &target.name;
        if self.client.describe_db_instance(name).await?.is_none() {
            return Ok(OutcomeKind::Unchanged);
        }
        log.identify(name);
        let skip = self.cfg.skip_final_snapshot;
        log.record(format!("delete db instance {name} (skip_final_snapshot={skip})"));
        self.client.delete_db_instance(name, skip).await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: RelationalApi + IdentityApi> Converger for DbInstanceConverger<'_, C> {
    type Desired = DbInstanceDesired;
    type Target = ResourceRef;

    const KIND: ResourceKind = ResourceKind::DbInstance;

    async fn ensure_present(&self, desired: &DbInstanceDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
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

    fn desired() -> DbInstanceDesired {
        DbInstanceDesired {
            name: "orders".into(),
            engine: Some("postgres".into()),
            engine_version: Some("16.3".into()),
            instance_class: Some("db.t3.micro".into()),
            allocated_storage: Some(20),
            master_username: Some("admin".into()),
            master_password: Some("secret-password".into()),
            tags: Some(TagSet::from_pairs([("env", "prod")])),
            ..DbInstanceDesired::default()
        }
    }

    #[tokio::test]
    async fn tags_land_on_the_constructed_arn_when_identity_is_denied() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        cloud.deny_identity("arn:aws:iam::123456789012:user/foo");
        let cfg = ConvergeConfig::default();

        let outcome = DbInstanceConverger::new(&cloud, &cfg)
            .ensure_present(&desired())
            .await
            .ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Created));
        let tags = cloud
            .list_tags_for_resource("arn:aws:rds:us-east-1:123456789012:db:orders")
            .await
            .unwrap_or_default();
        assert_eq!(tags.len(), 1);
    }

    #[tokio::test]
    async fn each_attribute_gets_its_own_modify_call() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = DbInstanceConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger
            .ensure_present(&DbInstanceDesired {
                instance_class: Some("db.t3.small".into()),
                multi_az: Some(true),
                ..desired()
            })
            .await
            .ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Updated));
        assert_eq!(
            cloud.mutating_calls(),
            vec!["rds:ModifyDBInstance".to_string(), "rds:ModifyDBInstance".to_string()]
        );
    }

    #[tokio::test]
    async fn engine_change_is_refused() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = DbInstanceConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let failure = converger
            .ensure_present(&DbInstanceDesired {
                engine: Some("mysql".into()),
                allocated_storage: Some(100),
                ..desired()
            })
            .await
            .err();

        assert!(matches!(
            failure.map(|f| f.error),
            Some(ConvergeError::ImmutableAttributeConflict { attribute: "engine", .. })
        ));
        assert!(cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn configured_account_id_skips_identity_lookup() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        cloud.fail_next("iam:GetUser", "Throttling");
        let cfg = ConvergeConfig {
            account_id: Some("123456789012".into()),
            ..ConvergeConfig::default()
        };

        let outcome = DbInstanceConverger::new(&cloud, &cfg)
            .ensure_present(&desired())
            .await;

        assert!(outcome.is_ok(), "{outcome:?}");
    }

    #[tokio::test]
    async fn failed_tag_call_keeps_the_modification_in_the_outcome() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = DbInstanceConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();
        cloud.fail_next("rds:AddTagsToResource", "Throttling");

        let failure = converger
            .ensure_present(&DbInstanceDesired {
                allocated_storage: Some(40),
                tags: Some(TagSet::from_pairs([("env", "prod"), ("team", "dev")])),
                ..desired()
            })
            .await
            .err();

        assert_eq!(
            cloud.mutating_calls(),
            vec!["rds:ModifyDBInstance".to_string(), "rds:AddTagsToResource".to_string()]
        );
        let outcome = failure.map(|f| f.outcome);
        assert_eq!(outcome.as_ref().map(|o| o.outcome), Some(OutcomeKind::Failed));
        assert_eq!(outcome.as_ref().map(|o| o.mutated), Some(true));
        assert_eq!(outcome.as_ref().and_then(|o| o.id.as_deref()), Some("orders"));
        let actions = outcome.map(|o| o.actions).unwrap_or_default();
        assert_eq!(actions.len(), 2);
        assert!(actions[0].contains("AllocatedStorage(40)"));
    }
}
