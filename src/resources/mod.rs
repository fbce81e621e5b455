//! Resource convergers.
//!
//! One converger per resource kind. Each one fetches the live object, sorts
//! the situation into absent / matching / divergent / immutable conflict, and
//! issues the calls that close the gap:
//!
//! 1) Look the object up by id when one is known, else by its natural key.
//! 2) Absent: create it with every desired attribute, plus owned sub-resources.
//! 3) Present: refuse if a create-only attribute differs, otherwise update
//!    each divergent mutable attribute with its own call.
//! 4) Reconcile tags last, unless step 3 refused.
//!
//! `ensure_absent` tears owned sub-resources down before the primary object.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::converge_config::ConvergeConfig;
use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog};
use crate::tag_reconciler::TagReconciler;
use crate::tag_set::TagSet;
use crate::tag_strategy::TagStrategy;

pub mod auto_scaling_group;
pub mod bucket;
pub mod db_instance;
pub mod load_balancer;
pub mod network;
pub mod record_set;
pub mod search_domain;
pub mod volume;

pub use auto_scaling_group::{AutoScalingGroupConverger, AutoScalingGroupDesired};
pub use bucket::{BucketConverger, BucketDesired};
pub use db_instance::{DbInstanceConverger, DbInstanceDesired};
pub use load_balancer::{LoadBalancerConverger, LoadBalancerDesired};
pub use network::{NetworkConverger, NetworkDesired};
pub use record_set::{RecordSetConverger, RecordSetDesired, RecordSetKey};
pub use search_domain::{SearchDomainConverger, SearchDomainDesired};
pub use volume::{VolumeConverger, VolumeDesired};

/// Tag key holding the natural key of id-addressed resources.
pub const NAME_TAG: &str = "Name";

/// Every resource kind this crate converges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network with its optional internet gateway.
    Network,
    /// Block volume.
    Volume,
    /// DNS record set.
    RecordSet,
    /// Relational database instance.
    DbInstance,
    /// Object-store bucket.
    Bucket,
    /// Search domain.
    SearchDomain,
    /// Classic load balancer.
    LoadBalancer,
    /// Autoscaling group.
    AutoScalingGroup,
}

impl ResourceKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Network,
        Self::Volume,
        Self::RecordSet,
        Self::DbInstance,
        Self::Bucket,
        Self::SearchDomain,
        Self::LoadBalancer,
        Self::AutoScalingGroup,
    ];

    /// Snake-case name, as used in desired-state documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Volume => "volume",
            Self::RecordSet => "record_set",
            Self::DbInstance => "db_instance",
            Self::Bucket => "bucket",
            Self::SearchDomain => "search_domain",
            Self::LoadBalancer => "load_balancer",
            Self::AutoScalingGroup => "auto_scaling_group",
        }
    }

    /// Whether the provider assigns the id (so the natural key is a tag).
    #[must_use]
    pub const fn has_assigned_id(self) -> bool {
        matches!(self, Self::Network | Self::Volume)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locates an existing object: by id when known, else by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// Logical name (natural key).
    pub name: String,
    /// Provider-assigned id, when known.
    pub id: Option<String>,
}

impl ResourceRef {
    /// Reference by name only.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    /// Reference by name and known id.
    #[must_use]
    pub fn with_id(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Some(id.into()),
        }
    }
}

/// Convergence entry points of one resource kind.
#[allow(async_fn_in_trait)]
pub trait Converger {
    /// Desired configuration.
    type Desired;
    /// What `ensure_absent` needs to find the object.
    type Target;

    /// Kind handled by this converger.
    const KIND: ResourceKind;

    /// Create or update the object until it matches `desired`.
    ///
    /// # Errors
    ///
    /// Fails on an immutable-attribute conflict, a missing create attribute,
    /// an ambiguous lookup, or a failed remote call. The failure carries the
    /// calls issued before the error.
    async fn ensure_present(&self, desired: &Self::Desired)
    -> Result<ConvergenceOutcome, ConvergeFailure>;

    /// Delete the object and the sub-resources it owns.
    ///
    /// # Errors
    ///
    /// Fails if a remote call fails, carrying the calls issued before it.
    async fn ensure_absent(&self, target: &Self::Target)
    -> Result<ConvergenceOutcome, ConvergeFailure>;
}

/// Fail when a create-only attribute differs from the live value.
pub(crate) fn check_immutable<T>(
    kind: ResourceKind,
    name: &str,
    attribute: &'static str,
    desired: Option<&T>,
    current: &T,
) -> Result<(), ConvergeError>
where
    T: PartialEq + fmt::Debug + ?Sized,
{
    match desired {
        Some(d) if d != current => Err(ConvergeError::ImmutableAttributeConflict {
            kind,
            name: name.to_string(),
            attribute,
            desired: format!("{d:?}"),
            current: format!("{current:?}"),
        }),
        _ => Ok(()),
    }
}

/// Attribute needed to create an object.
pub(crate) fn require<'a, T: ?Sized>(
    kind: ResourceKind,
    name: &str,
    attribute: &'static str,
    value: Option<&'a T>,
) -> Result<&'a T, ConvergeError> {
    value.ok_or_else(|| ConvergeError::MissingAttribute {
        kind,
        name: name.to_string(),
        attribute,
    })
}

/// At most one natural-key match.
pub(crate) fn single<T>(
    kind: ResourceKind,
    name: &str,
    mut found: Vec<T>,
) -> Result<Option<T>, ConvergeError> {
    match found.len() {
        0 | 1 => Ok(found.pop()),
        count => Err(ConvergeError::AmbiguousResource {
            kind,
            name: name.to_string(),
            count,
        }),
    }
}

/// Run tag reconciliation when tags are managed.
pub(crate) async fn reconcile_tags<S: TagStrategy>(
    cfg: &ConvergeConfig,
    strategy: &S,
    desired: Option<&TagSet>,
    log: &mut MutationLog,
) -> Result<bool, ConvergeError> {
    let Some(desired) = desired else {
        return Ok(false);
    };
    let mutated = TagReconciler::new(strategy)
        .with_reserved_prefix(cfg.reserved_tag_prefix.as_deref())
        .converge_tags(desired, log)
        .await?;
    Ok(mutated)
}

/// Desired tags of a name-tagged resource: the declared tags plus `Name`.
pub(crate) fn with_name_tag(tags: Option<&TagSet>, name: &str) -> Option<TagSet> {
    tags.map(|t| t.clone().with(NAME_TAG, name))
}
