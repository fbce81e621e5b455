//! Per-service tag strategies.
//!
//! Unique responsibility: hide each provider's tagging API behind one
//! contract (`current_tags` / `set_tags` / `delete_tags`) while keeping every
//! service quirk local to its own strategy:
//!
//! | Strategy | fetched by | valueless tags | delete |
//! |---|---|---|---|
//! | [`InstanceTagStrategy`] | resource id | no, `""` substituted | per key |
//! | [`AutoScalingTagStrategy`] | group name | no | per key, `propagate_at_launch=false` |
//! | [`LoadBalancerTagStrategy`] | access point name | no | per key |
//! | [`RelationalStoreTagStrategy`] | constructed ARN | yes | per key |
//! | [`SearchIndexTagStrategy`] | domain ARN | yes, value omitted | bulk by key |
//! | [`ObjectStoreTagStrategy`] | bucket name | coerced to string | wholesale replace or clear |
//!
//! The strategy for a resource is picked by whoever knows which service the
//! resource lives in; the reconciler only sees the trait.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::converge_error::ConvergeError;
use crate::provider::{
    ACCESS_DENIED, AutoScalingApi, ComputeApi, GroupTag, IdentityApi, LoadBalancerApi,
    NO_SUCH_TAG_SET, ObjectStoreApi, OptionalTag, ProviderResult, RESOURCE_NOT_FOUND,
    RelationalApi, SearchApi, Tag,
};
use crate::tag_set::TagSet;

/// How a provider mutates tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMutation {
    /// Individual keys can be added, overwritten and removed.
    Partial,
    /// Only the whole tag set can be replaced or cleared.
    Wholesale,
}

/// What a strategy's provider can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagCapabilities {
    /// Whether a tag may exist without a value.
    pub valueless_tags: bool,
    /// Partial or wholesale mutation.
    pub mutation: TagMutation,
}

/// Uniform tag access for one remote object.
#[allow(async_fn_in_trait)]
pub trait TagStrategy {
    /// Identifier of the tagged object, for logs.
    fn target(&self) -> &str;

    /// Static description of the provider's tagging model.
    fn capabilities(&self) -> TagCapabilities;

    /// Tags currently on the object; empty when the provider reports none.
    async fn current_tags(&self) -> ProviderResult<TagSet>;

    /// Apply exactly these tags.
    async fn set_tags(&self, tags: &TagSet) -> ProviderResult<()>;

    /// Remove these keys.
    async fn delete_tags(&self, keys: &BTreeSet<String>) -> ProviderResult<()>;

    /// Desired tags as this provider will store them.
    ///
    /// Providers that cannot hold a valueless tag store `""` instead, so the
    /// desired set is rewritten the same way before diffing.
    fn prepare_desired(&self, desired: &TagSet) -> TagSet {
        if self.capabilities().valueless_tags {
            desired.clone()
        } else {
            desired.with_empty_values()
        }
    }
}

fn to_tags(tags: &TagSet) -> Vec<Tag> {
    tags.iter()
        .map(|(k, v)| Tag::new(k, v.unwrap_or_default()))
        .collect()
}

fn to_optional_tags(tags: &TagSet) -> Vec<OptionalTag> {
    tags.iter()
        .map(|(k, v)| OptionalTag {
            key: k.to_string(),
            value: v.map(str::to_string),
        })
        .collect()
}

fn from_tags(tags: Vec<Tag>) -> TagSet {
    tags.into_iter().map(|t| (t.key, Some(t.value))).collect()
}

fn from_optional_tags(tags: Vec<OptionalTag>) -> TagSet {
    tags.into_iter().map(|t| (t.key, t.value)).collect()
}

fn key_list(keys: &BTreeSet<String>) -> Vec<String> {
    keys.iter().cloned().collect()
}

// ============================================================================
// Instance / network
// ============================================================================

/// Tags of a compute resource (network, volume, gateway), addressed by id.
#[derive(Debug)]
pub struct InstanceTagStrategy<'a, C> {
    client: &'a C,
    resource_id: String,
}

impl<'a, C: ComputeApi> InstanceTagStrategy<'a, C> {
    /// Strategy for the resource with the given id.
    #[must_use]
    pub fn new(client: &'a C, resource_id: impl Into<String>) -> Self {
        Self {
            client,
            resource_id: resource_id.into(),
        }
    }
}

impl<C: ComputeApi> TagStrategy for InstanceTagStrategy<'_, C> {
    fn target(&self) -> &str {
        &self.resource_id
    }

    fn capabilities(&self) -> TagCapabilities {
        TagCapabilities {
            valueless_tags: false,
            mutation: TagMutation::Partial,
        }
    }

    async fn current_tags(&self) -> ProviderResult<TagSet> {
        Ok(from_tags(self.client.describe_tags(&self.resource_id).await?))
    }

    async fn set_tags(&self, tags: &TagSet) -> ProviderResult<()> {
        self.client
            .create_tags(&self.resource_id, &to_tags(tags))
            .await
    }

    async fn delete_tags(&self, keys: &BTreeSet<String>) -> ProviderResult<()> {
        self.client
            .delete_tags(&self.resource_id, &key_list(keys))
            .await
    }
}

// ============================================================================
// Autoscaling group
// ============================================================================

/// Tags of an autoscaling group, addressed by group name.
#[derive(Debug)]
pub struct AutoScalingTagStrategy<'a, C> {
    client: &'a C,
    group_name: String,
}

impl<'a, C: AutoScalingApi> AutoScalingTagStrategy<'a, C> {
    /// Strategy for the named group.
    #[must_use]
    pub fn new(client: &'a C, group_name: impl Into<String>) -> Self {
        Self {
            client,
            group_name: group_name.into(),
        }
    }

    fn group_tags(&self, tags: &TagSet) -> Vec<GroupTag> {
        tags.iter()
            .map(|(k, v)| GroupTag {
                key: k.to_string(),
                value: v.unwrap_or_default().to_string(),
                propagate_at_launch: false,
            })
            .collect()
    }
}

impl<C: AutoScalingApi> TagStrategy for AutoScalingTagStrategy<'_, C> {
    fn target(&self) -> &str {
        &self.group_name
    }

    fn capabilities(&self) -> TagCapabilities {
        TagCapabilities {
            valueless_tags: false,
            mutation: TagMutation::Partial,
        }
    }

    async fn current_tags(&self) -> ProviderResult<TagSet> {
        let tags = self.client.describe_group_tags(&self.group_name).await?;
        Ok(tags.into_iter().map(|t| (t.key, Some(t.value))).collect())
    }

    async fn set_tags(&self, tags: &TagSet) -> ProviderResult<()> {
        self.client
            .create_or_update_group_tags(&self.group_name, &self.group_tags(tags))
            .await
    }

    async fn delete_tags(&self, keys: &BTreeSet<String>) -> ProviderResult<()> {
        // The delete call takes full tag records; only the key matters to it.
        let tags: Vec<GroupTag> = keys
            .iter()
            .map(|k| GroupTag {
                key: k.clone(),
                value: String::new(),
                propagate_at_launch: false,
            })
            .collect();
        self.client.delete_group_tags(&self.group_name, &tags).await
    }
}

// ============================================================================
// Load balancer
// ============================================================================

/// Tags of a load balancer, addressed by access point name.
#[derive(Debug)]
pub struct LoadBalancerTagStrategy<'a, C> {
    client: &'a C,
    name: String,
}

impl<'a, C: LoadBalancerApi> LoadBalancerTagStrategy<'a, C> {
    /// Strategy for the named load balancer.
    #[must_use]
    pub fn new(client: &'a C, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

impl<C: LoadBalancerApi> TagStrategy for LoadBalancerTagStrategy<'_, C> {
    fn target(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> TagCapabilities {
        TagCapabilities {
            valueless_tags: false,
            mutation: TagMutation::Partial,
        }
    }

    async fn current_tags(&self) -> ProviderResult<TagSet> {
        let descriptions = self
            .client
            .describe_load_balancer_tags(std::slice::from_ref(&self.name))
            .await?;
        Ok(descriptions
            .into_iter()
            .next()
            .map(|d| from_tags(d.tags))
            .unwrap_or_default())
    }

    async fn set_tags(&self, tags: &TagSet) -> ProviderResult<()> {
        self.client
            .add_load_balancer_tags(&self.name, &to_tags(tags))
            .await
    }

    async fn delete_tags(&self, keys: &BTreeSet<String>) -> ProviderResult<()> {
        self.client
            .remove_load_balancer_tags(&self.name, &key_list(keys))
            .await
    }
}

// ============================================================================
// Relational store
// ============================================================================

static ACCOUNT_IN_ARN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"arn:[a-z0-9-]+:iam::(\d{12}):").ok());

/// Extract the account id embedded in an IAM principal ARN, wherever it appears in `text`.
#[must_use]
pub fn account_id_from_text(text: &str) -> Option<String> {
    ACCOUNT_IN_ARN
        .as_ref()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Resolve the caller's account id.
///
/// Asks the identity service for the calling user. Least-privilege
/// credentials usually may not make that call, but the access-denied message
/// names the caller's ARN, so the account id is read out of it instead.
///
/// # Errors
///
/// Returns an error if the call fails for another reason, or if neither the
/// response nor the error message contains an account id.
pub async fn resolve_account_id<I: IdentityApi>(identity: &I) -> Result<String, ConvergeError> {
    match identity.get_user().await {
        Ok(user) => account_id_from_text(&user.arn).ok_or_else(|| {
            ConvergeError::AccountId(format!("no account id in user arn {}", user.arn))
        }),
        Err(e) if e.is_code(ACCESS_DENIED) => {
            debug!(error = %e, "identity lookup denied, reading account id from the error");
            account_id_from_text(&e.message)
                .ok_or_else(|| ConvergeError::AccountId(format!("access denied without arn: {e}")))
        }
        Err(e) => Err(ConvergeError::Transport(e)),
    }
}

/// Build `arn:<partition>:<service>:<region>:<account>:<resource_type>:<name>`.
#[must_use]
pub fn build_arn(
    partition: &str,
    service: &str,
    region: &str,
    account_id: &str,
    resource_type: &str,
    name: &str,
) -> String {
    format!("arn:{partition}:{service}:{region}:{account_id}:{resource_type}:{name}")
}

/// Tags of a relational-store resource, addressed by its ARN.
#[derive(Debug)]
pub struct RelationalStoreTagStrategy<'a, C> {
    client: &'a C,
    arn: String,
}

impl<'a, C: RelationalApi> RelationalStoreTagStrategy<'a, C> {
    /// Strategy for an already known ARN.
    #[must_use]
    pub fn new(client: &'a C, arn: impl Into<String>) -> Self {
        Self {
            client,
            arn: arn.into(),
        }
    }

    /// Strategy for a database instance; the ARN is built from the account id.
    #[must_use]
    pub fn for_db_instance(
        client: &'a C,
        partition: &str,
        region: &str,
        account_id: &str,
        identifier: &str,
    ) -> Self {
        Self::new(
            client,
            build_arn(partition, "rds", region, account_id, "db", identifier),
        )
    }
}

impl<C: RelationalApi> TagStrategy for RelationalStoreTagStrategy<'_, C> {
    fn target(&self) -> &str {
        &self.arn
    }

    fn capabilities(&self) -> TagCapabilities {
        TagCapabilities {
            valueless_tags: true,
            mutation: TagMutation::Partial,
        }
    }

    async fn current_tags(&self) -> ProviderResult<TagSet> {
        Ok(from_optional_tags(
            self.client.list_tags_for_resource(&self.arn).await?,
        ))
    }

    async fn set_tags(&self, tags: &TagSet) -> ProviderResult<()> {
        self.client
            .add_tags_to_resource(&self.arn, &to_optional_tags(tags))
            .await
    }

    async fn delete_tags(&self, keys: &BTreeSet<String>) -> ProviderResult<()> {
        self.client
            .remove_tags_from_resource(&self.arn, &key_list(keys))
            .await
    }
}

// ============================================================================
// Search index
// ============================================================================

/// Tags of a search domain, addressed by its ARN.
#[derive(Debug)]
pub struct SearchIndexTagStrategy<'a, C> {
    client: &'a C,
    arn: String,
}

impl<'a, C: SearchApi> SearchIndexTagStrategy<'a, C> {
    /// Strategy for the domain with the given ARN.
    #[must_use]
    pub fn new(client: &'a C, arn: impl Into<String>) -> Self {
        Self {
            client,
            arn: arn.into(),
        }
    }
}

impl<C: SearchApi> TagStrategy for SearchIndexTagStrategy<'_, C> {
    fn target(&self) -> &str {
        &self.arn
    }

    fn capabilities(&self) -> TagCapabilities {
        TagCapabilities {
            valueless_tags: true,
            mutation: TagMutation::Partial,
        }
    }

    async fn current_tags(&self) -> ProviderResult<TagSet> {
        match self.client.list_domain_tags(&self.arn).await {
            Ok(tags) => Ok(from_optional_tags(tags)),
            Err(e) if e.is_code(RESOURCE_NOT_FOUND) => {
                debug!(arn = %self.arn, "search domain reports no tags");
                Ok(TagSet::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_tags(&self, tags: &TagSet) -> ProviderResult<()> {
        self.client
            .add_domain_tags(&self.arn, &to_optional_tags(tags))
            .await
    }

    async fn delete_tags(&self, keys: &BTreeSet<String>) -> ProviderResult<()> {
        self.client
            .remove_domain_tags(&self.arn, &key_list(keys))
            .await
    }
}

// ============================================================================
// Object store
// ============================================================================

/// Tags of a bucket.
///
/// The provider only replaces or clears the whole tag set, so the strategy
/// carries the desired tags it was built for: deleting keys means writing the
/// desired set without them, or clearing everything when nothing is desired.
#[derive(Debug)]
pub struct ObjectStoreTagStrategy<'a, C> {
    client: &'a C,
    bucket: String,
    desired: TagSet,
}

impl<'a, C: ObjectStoreApi> ObjectStoreTagStrategy<'a, C> {
    /// Strategy for the named bucket converging towards `desired`.
    #[must_use]
    pub fn new(client: &'a C, bucket: impl Into<String>, desired: &TagSet) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            desired: desired.with_empty_values(),
        }
    }
}

impl<C: ObjectStoreApi> TagStrategy for ObjectStoreTagStrategy<'_, C> {
    fn target(&self) -> &str {
        &self.bucket
    }

    fn capabilities(&self) -> TagCapabilities {
        TagCapabilities {
            valueless_tags: false,
            mutation: TagMutation::Wholesale,
        }
    }

    async fn current_tags(&self) -> ProviderResult<TagSet> {
        match self.client.get_bucket_tagging(&self.bucket).await {
            Ok(tags) => Ok(from_tags(tags)),
            Err(e) if e.is_code(NO_SUCH_TAG_SET) => {
                debug!(bucket = %self.bucket, "bucket has no tag set");
                Ok(TagSet::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_tags(&self, tags: &TagSet) -> ProviderResult<()> {
        self.client
            .put_bucket_tagging(&self.bucket, &to_tags(tags))
            .await
    }

    // Writes only the desired set, so the reconciler sends reserved-prefix tags
    // through `set_tags` instead while any are on the bucket.
    async fn delete_tags(&self, keys: &BTreeSet<String>) -> ProviderResult<()> {
        if self.desired.is_empty() {
            self.client.delete_bucket_tagging(&self.bucket).await
        } else {
            self.set_tags(&self.desired.without(keys)).await
        }
    }
}
