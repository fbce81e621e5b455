//! Virtual network converger.
//!
//! A network may own one internet gateway. An owned gateway carries an
//! ownership tag (`OwnerVPC` by default) whose value is the network id; only
//! owned gateways are deleted when the network lets go of them. Gateways
//! attached by someone else are detached and left in place.

use serde::Deserialize;
use tracing::{info, warn};

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::{ComputeApi, InstanceTenancy, InternetGateway, ProviderError, Tag, Vpc, VpcAttribute};
use crate::tag_set::TagSet;
use crate::tag_strategy::InstanceTagStrategy;

use super::{
    Converger, NAME_TAG, ResourceKind, ResourceRef, check_immutable, reconcile_tags, require,
    single, with_name_tag,
};

/// Desired state of a virtual network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkDesired {
    /// Logical name, stored in the `Name` tag.
    pub name: String,
    /// Network id, when already known.
    pub id: Option<String>,
    /// Primary address block. Create-only.
    pub cidr_block: Option<String>,
    /// Tenancy class. Create-only.
    pub instance_tenancy: Option<InstanceTenancy>,
    /// DNS resolution flag.
    pub enable_dns_support: Option<bool>,
    /// DNS hostnames flag.
    pub enable_dns_hostnames: Option<bool>,
    /// Whether the network should have an owned internet gateway attached.
    pub internet_gateway: Option<bool>,
    /// Tags; `Name` is added automatically.
    pub tags: Option<TagSet>,
}

impl NetworkDesired {
    /// How to find this network.
    #[must_use]
    pub fn target(&self) -> ResourceRef {
        ResourceRef {
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }
}

/// Converges virtual networks and their owned gateways.
#[derive(Debug)]
pub struct NetworkConverger<'a, C> {
    client: &'a C,
    cfg: &'a ConvergeConfig,
}

impl<'a, C: ComputeApi> NetworkConverger<'a, C> {
    /// Converger using the given compute client.
    #[must_use]
    pub const fn new(client: &'a C, cfg: &'a ConvergeConfig) -> Self {
        Self { client, cfg }
    }

    async fn find(&self, target: &ResourceRef) -> Result<Option<Vpc>, ConvergeError> {
        if let Some(id) = &target.id {
            let found = self.client.describe_vpc(id).await?;
            if found.is_none() {
                warn!(name = %target.name, id = %id, "recorded network id no longer exists");
            }
            return Ok(found);
        }
        let found = self.client.find_vpcs_by_name(&target.name).await?;
        single(Self::KIND, &target.name, found)
    }

    async fn create(&self, desired: &NetworkDesired, log: &mut MutationLog) -> Result<(), ConvergeError> {
        let cidr = require(Self::KIND, &desired.name, "cidr_block", desired.cidr_block.as_deref())?;
        let tenancy = desired.instance_tenancy.unwrap_or_default();

        log.record(format!("create vpc {cidr} with {} tenancy", tenancy.as_str()));
        let vpc = self.client.create_vpc(cidr, tenancy).await?;
        log.identify(&vpc.id);

        let tags = with_name_tag(desired.tags.as_ref(), &desired.name)
            .unwrap_or_else(|| TagSet::new().with(NAME_TAG, &desired.name));
        let strategy = InstanceTagStrategy::new(self.client, vpc.id.clone());
        reconcile_tags(self.cfg, &strategy, Some(&tags), log).await?;

        self.converge_attributes(&vpc, desired, log).await?;
        if desired.internet_gateway == Some(true) {
            self.attach_owned_gateway(&vpc, &desired.name, log).await?;
        }
        Ok(())
    }

    async fn converge_attributes(
        &self,
        vpc: &Vpc,
        desired: &NetworkDesired,
        log: &mut MutationLog,
    ) -> Result<bool, ConvergeError> {
        let mut changed = false;

        if let Some(want) = desired.enable_dns_support
            && want != vpc.enable_dns_support
        {
            log.record(format!("set enable_dns_support={want} on {}", vpc.id));
            self.client
                .modify_vpc_attribute(&vpc.id, VpcAttribute::EnableDnsSupport(want))
                .await?;
            changed = true;
        }

        if let Some(want) = desired.enable_dns_hostnames
            && want != vpc.enable_dns_hostnames
        {
            log.record(format!("set enable_dns_hostnames={want} on {}", vpc.id));
            self.client
                .modify_vpc_attribute(&vpc.id, VpcAttribute::EnableDnsHostnames(want))
                .await?;
            changed = true;
        }

        Ok(changed)
    }

    async fn converge_gateway(
        &self,
        vpc: &Vpc,
        desired: &NetworkDesired,
        log: &mut MutationLog,
    ) -> Result<bool, ConvergeError> {
        let Some(want) = desired.internet_gateway else {
            return Ok(false);
        };
        let attached = self.client.describe_attached_gateways(&vpc.id).await?;

        match (want, attached.is_empty()) {
            (true, true) => {
                self.attach_owned_gateway(vpc, &desired.name, log).await?;
                Ok(true)
            }
            (false, false) => {
                for gateway in &attached {
                    self.release_gateway(gateway, &vpc.id, log).await?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Create, tag and attach a gateway; roll the gateway back once if tagging or attaching fails.
    async fn attach_owned_gateway(
        &self,
        vpc: &Vpc,
        name: &str,
        log: &mut MutationLog,
    ) -> Result<(), ConvergeError> {
        log.record(format!("create internet gateway for {}", vpc.id));
        let gateway = self.client.create_internet_gateway().await?;

        if let Err(source) = self.tag_and_attach(&gateway.id, vpc, name, log).await {
            warn!(gateway = %gateway.id, error = %source, "gateway setup failed, rolling back");
            log.record(format!("delete internet gateway {} after failed setup", gateway.id));
            let cleanup_failures = match self.client.delete_internet_gateway(&gateway.id).await {
                Ok(()) => Vec::new(),
                Err(e) => {
                    warn!(gateway = %gateway.id, error = %e, "gateway rollback failed");
                    vec![e]
                }
            };
            return Err(ConvergeError::PartialCreation {
                kind: Self::KIND,
                name: name.to_string(),
                source,
                cleanup_failures,
            });
        }
        Ok(())
    }

    async fn tag_and_attach(
        &self,
        gateway_id: &str,
        vpc: &Vpc,
        name: &str,
        log: &mut MutationLog,
    ) -> Result<(), ProviderError> {
        let owner_key = &self.cfg.owner_tag_key;
        log.record(format!("tag internet gateway {gateway_id} with {owner_key}={}", vpc.id));
        self.client
            .create_tags(
                gateway_id,
                &[Tag::new(NAME_TAG, name), Tag::new(owner_key, &vpc.id)],
            )
            .await?;

        log.record(format!("attach internet gateway {gateway_id} to {}", vpc.id));
        self.client.attach_internet_gateway(gateway_id, &vpc.id).await
    }

    /// Detach a gateway, then delete it only if its ownership tag names this network.
    async fn release_gateway(
        &self,
        gateway: &InternetGateway,
        vpc_id: &str,
        log: &mut MutationLog,
    ) -> Result<(), ConvergeError> {
        log.record(format!("detach internet gateway {} from {vpc_id}", gateway.id));
        self.client
            .detach_internet_gateway(&gateway.id, vpc_id)
            .await?;

        if gateway.tag(&self.cfg.owner_tag_key) == Some(vpc_id) {
            log.record(format!("delete internet gateway {}", gateway.id));
            self.client.delete_internet_gateway(&gateway.id).await?;
        } else {
            info!(gateway = %gateway.id, vpc = vpc_id, "gateway not owned by this network, leaving it");
        }
        Ok(())
    }

    async fn present(&self, desired: &NetworkDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let Some(vpc) = self.find(&desired.target()).await? else {
            self.create(desired, log).await?;
            return Ok(OutcomeKind::Created);
        };
        log.identify(&vpc.id);

        check_immutable(Self::KIND, &desired.name, "cidr_block", desired.cidr_block.as_ref(), &vpc.cidr_block)?;
        check_immutable(
            Self::KIND,
            &desired.name,
            "instance_tenancy",
            desired.instance_tenancy.as_ref(),
            &vpc.instance_tenancy,
        )?;

        let mut updated = self.converge_attributes(&vpc, desired, log).await?;
        updated |= self.converge_gateway(&vpc, desired, log).await?;

        let strategy = InstanceTagStrategy::new(self.client, vpc.id.clone());
        let tags = with_name_tag(desired.tags.as_ref(), &desired.name);
        updated |= reconcile_tags(self.cfg, &strategy, tags.as_ref(), log).await?;

        Ok(if updated { OutcomeKind::Updated } else { OutcomeKind::Unchanged })
    }

    async fn absent(&self, target: &ResourceRef, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        if let Some(id) = &target.id {
            log.identify(id);
        }
        let Some(vpc) = self.find(target).await? else {
            return Ok(OutcomeKind::Unchanged);
        };
        log.identify(&vpc.id);

        for gateway in self.client.describe_attached_gateways(&vpc.id).await? {
            self.release_gateway(&gateway, &vpc.id, log).await?;
        }

        log.record(format!("delete vpc {}", vpc.id));
        self.client.delete_vpc(&vpc.id).await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: ComputeApi> Converger for NetworkConverger<'_, C> {
    type Desired = NetworkDesired;
    type Target = ResourceRef;

    const KIND: ResourceKind = ResourceKind::Network;

    async fn ensure_present(&self, desired: &NetworkDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
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

    fn desired() -> NetworkDesired {
        NetworkDesired {
            name: "main".into(),
            cidr_block: Some("10.0.0.0/16".into()),
            enable_dns_hostnames: Some(true),
            internet_gateway: Some(true),
            tags: Some(TagSet::from_pairs([("env", "test")])),
            ..NetworkDesired::default()
        }
    }

    #[tokio::test]
    async fn creates_then_is_unchanged() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = NetworkConverger::new(&cloud, &cfg);

        let first = converger.ensure_present(&desired()).await;
        assert!(first.is_ok(), "{first:?}");
        assert_eq!(first.ok().map(|o| o.outcome), Some(OutcomeKind::Created));

        cloud.reset_calls();
        let second = converger.ensure_present(&desired()).await.ok();
        assert_eq!(second.as_ref().map(|o| o.outcome), Some(OutcomeKind::Unchanged));
        assert_eq!(second.map(|o| o.mutated), Some(false));
        assert!(cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn created_gateway_carries_ownership_tag() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let created = NetworkConverger::new(&cloud, &cfg).ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        let vpc_id = created.ok().and_then(|o| o.id).unwrap_or_default();

        let gateways = cloud.describe_attached_gateways(&vpc_id).await.unwrap_or_default();
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].tag("OwnerVPC"), Some(vpc_id.as_str()));
    }

    #[tokio::test]
    async fn changed_cidr_is_rejected_without_mutation() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = NetworkConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let conflicting = NetworkDesired {
            cidr_block: Some("10.9.0.0/16".into()),
            enable_dns_support: Some(false),
            ..desired()
        };
        let failure = converger.ensure_present(&conflicting).await.err();

        assert!(matches!(
            failure.as_ref().map(|f| &f.error),
            Some(ConvergeError::ImmutableAttributeConflict { attribute: "cidr_block", .. })
        ));
        assert_eq!(failure.map(|f| f.outcome.mutated), Some(false));
        assert!(cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn flips_dns_flag_with_a_single_attribute_call() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = NetworkConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger
            .ensure_present(&NetworkDesired {
                enable_dns_hostnames: Some(false),
                ..desired()
            })
            .await
            .ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Updated));
        assert_eq!(cloud.mutating_calls(), vec!["ec2:ModifyVpcAttribute".to_string()]);
    }

    #[tokio::test]
    async fn destroy_deletes_owned_gateway() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = NetworkConverger::new(&cloud, &cfg);
        let created = converger.ensure_present(&desired()).await;
        assert!(created.is_ok(), "{created:?}");
        cloud.reset_calls();

        let outcome = converger.ensure_absent(&ResourceRef::named("main")).await.ok();

        assert_eq!(outcome.map(|o| o.outcome), Some(OutcomeKind::Destroyed));
        assert_eq!(
            cloud.mutating_calls(),
            vec![
                "ec2:DetachInternetGateway".to_string(),
                "ec2:DeleteInternetGateway".to_string(),
                "ec2:DeleteVpc".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn destroy_leaves_foreign_gateway_detached() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let converger = NetworkConverger::new(&cloud, &cfg);
        let plain = NetworkDesired {
            internet_gateway: None,
            ..desired()
        };
        let created = converger.ensure_present(&plain).await;
        assert!(created.is_ok(), "{created:?}");
        let vpc_id = created.ok().and_then(|o| o.id).unwrap_or_default();
        let foreign = cloud.seed_gateway(&vpc_id, &[("Name", "shared")]);
        cloud.reset_calls();

        let destroyed = converger.ensure_absent(&ResourceRef::named("main")).await;
        assert!(destroyed.is_ok(), "{destroyed:?}");

        assert!(cloud.mutating_calls().contains(&"ec2:DetachInternetGateway".to_string()));
        assert!(!cloud.mutating_calls().contains(&"ec2:DeleteInternetGateway".to_string()));
        assert!(cloud.gateway_exists(&foreign));
    }

    #[tokio::test]
    async fn failed_attach_rolls_back_the_gateway() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        cloud.fail_next("ec2:AttachInternetGateway", "Gateway.NotAttached");

        let failure = NetworkConverger::new(&cloud, &cfg)
            .ensure_present(&desired())
            .await
            .err();

        assert!(matches!(
            failure.as_ref().map(|f| &f.error),
            Some(ConvergeError::PartialCreation { source, cleanup_failures, .. })
                if source.code == "Gateway.NotAttached" && cleanup_failures.is_empty()
        ));
        assert!(cloud.mutating_calls().ends_with(&["ec2:DeleteInternetGateway".to_string()]));
        assert_eq!(cloud.gateway_count(), 0);
    }

    #[tokio::test]
    async fn failed_create_still_reports_the_network_and_its_calls() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        cloud.fail_next("ec2:AttachInternetGateway", "Gateway.NotAttached");

        let failure = NetworkConverger::new(&cloud, &cfg)
            .ensure_present(&desired())
            .await
            .err();
        let outcome = failure.map(|f| f.outcome);

        let vpc_id = outcome.as_ref().and_then(|o| o.id.clone()).unwrap_or_default();
        assert!(vpc_id.starts_with("vpc-"), "{outcome:?}");
        assert!(cloud.describe_vpc(&vpc_id).await.ok().flatten().is_some());
        assert_eq!(outcome.as_ref().map(|o| o.outcome), Some(OutcomeKind::Failed));
        assert_eq!(outcome.as_ref().map(|o| o.mutated), Some(true));
        let actions = outcome.map(|o| o.actions).unwrap_or_default();
        assert_eq!(actions.len(), cloud.mutating_calls().len());
        assert!(actions[0].starts_with("create vpc"));
        assert!(actions.last().is_some_and(|a| a.ends_with("after failed setup")));
    }

    #[tokio::test]
    async fn recorded_id_that_vanished_is_recreated() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let gone = NetworkDesired {
            id: Some("vpc-deadbeef".into()),
            ..desired()
        };
        let outcome = NetworkConverger::new(&cloud, &cfg).ensure_present(&gone).await.ok();
        assert_eq!(outcome.as_ref().map(|o| o.outcome), Some(OutcomeKind::Created));
        assert_ne!(outcome.and_then(|o| o.id).as_deref(), Some("vpc-deadbeef"));
    }

    #[tokio::test]
    async fn missing_cidr_fails_before_any_call() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let cfg = ConvergeConfig::default();
        let failure = NetworkConverger::new(&cloud, &cfg)
            .ensure_present(&NetworkDesired {
                name: "bare".into(),
                ..NetworkDesired::default()
            })
            .await
            .err();
        assert!(matches!(
            failure.map(|f| f.error),
            Some(ConvergeError::MissingAttribute { attribute: "cidr_block", .. })
        ));
        assert!(cloud.mutating_calls().is_empty());
    }
}
