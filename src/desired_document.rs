//! Desired-state document.
//!
//! A JSON document listing the resources to converge, in order:
//!
//! ```text
//! {
//!   "resources": [
//!     { "kind": "network", "name": "main", "cidr_block": "10.0.0.0/16",
//!       "internet_gateway": true, "tags": { "env": "prod" } },
//!     { "kind": "bucket", "name": "logs", "versioning": true, "tags": {} }
//!   ]
//! }
//! ```
//!
//! Omitted attributes are unmanaged; `"tags": {}` means "no tags", while
//! leaving `tags` out leaves the remote tags alone.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::resources::{
    AutoScalingGroupDesired, BucketDesired, DbInstanceDesired, LoadBalancerDesired, NetworkDesired,
    RecordSetDesired, ResourceKind, ResourceRef, SearchDomainDesired, VolumeDesired,
    record_set::normalize_name,
};

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceDeclaration {
    /// Virtual network.
    Network(NetworkDesired),
    /// Block volume.
    Volume(VolumeDesired),
    /// DNS record set.
    RecordSet(RecordSetDesired),
    /// Database instance.
    DbInstance(DbInstanceDesired),
    /// Bucket.
    Bucket(BucketDesired),
    /// Search domain.
    SearchDomain(SearchDomainDesired),
    /// Load balancer.
    LoadBalancer(LoadBalancerDesired),
    /// Autoscaling group.
    AutoScalingGroup(AutoScalingGroupDesired),
}

impl ResourceDeclaration {
    /// Kind of the declared resource.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Network(_) => ResourceKind::Network,
            Self::Volume(_) => ResourceKind::Volume,
            Self::RecordSet(_) => ResourceKind::RecordSet,
            Self::DbInstance(_) => ResourceKind::DbInstance,
            Self::Bucket(_) => ResourceKind::Bucket,
            Self::SearchDomain(_) => ResourceKind::SearchDomain,
            Self::LoadBalancer(_) => ResourceKind::LoadBalancer,
            Self::AutoScalingGroup(_) => ResourceKind::AutoScalingGroup,
        }
    }

    /// Logical name; record sets are named `zone/fqdn/TYPE`.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Network(d) => d.name.clone(),
            Self::Volume(d) => d.name.clone(),
            Self::RecordSet(d) => format!(
                "{}/{}/{}",
                d.zone_id,
                normalize_name(&d.name),
                d.record_type.to_ascii_uppercase()
            ),
            Self::DbInstance(d) => d.name.clone(),
            Self::Bucket(d) => d.name.clone(),
            Self::SearchDomain(d) => d.name.clone(),
            Self::LoadBalancer(d) => d.name.clone(),
            Self::AutoScalingGroup(d) => d.name.clone(),
        }
    }

    /// Id written in the document, for kinds that have one.
    #[must_use]
    pub fn declared_id(&self) -> Option<&str> {
        match self {
            Self::Network(d) => d.id.as_deref(),
            Self::Volume(d) => d.id.as_deref(),
            _ => None,
        }
    }

    /// Fill in a previously recorded id unless the document names one.
    #[must_use]
    pub fn with_known_id(mut self, known: Option<&str>) -> Self {
        let Some(known) = known else {
            return self;
        };
        match &mut self {
            Self::Network(d) if d.id.is_none() => d.id = Some(known.to_string()),
            Self::Volume(d) if d.id.is_none() => d.id = Some(known.to_string()),
            _ => {}
        }
        self
    }

    /// Locator used to tear the resource down.
    #[must_use]
    pub fn target(&self) -> ResourceRef {
        ResourceRef {
            name: self.name(),
            id: self.declared_id().map(str::to_string),
        }
    }
}

/// Errors reading a desired-state document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// I/O error.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: io::Error,
    },
    /// Malformed JSON or unknown kind.
    #[error("invalid document: {0}")]
    Parse(#[from] serde_json::Error),
    /// The same resource is declared twice.
    #[error("{kind} {name} is declared more than once")]
    Duplicate {
        /// Resource kind.
        kind: ResourceKind,
        /// Logical name.
        name: String,
    },
    /// A declaration without a name.
    #[error("a {0} declaration has an empty name")]
    EmptyName(ResourceKind),
}

/// Resources to converge, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DesiredDocument {
    /// Declarations.
    pub resources: Vec<ResourceDeclaration>,
}

impl DesiredDocument {
    /// Parse and validate a document.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON, an unknown kind, an empty name or
    /// a duplicate declaration.
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        let doc: Self = serde_json::from_str(json)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Read, parse and validate a document file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_path(path: &Path) -> Result<Self, DocumentError> {
        let json = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<(), DocumentError> {
        let mut seen = BTreeSet::new();
        for decl in &self.resources {
            let kind = decl.kind();
            let name = decl.name();
            let blank = match decl {
                ResourceDeclaration::RecordSet(d) => [&d.zone_id, &d.name, &d.record_type]
                    .iter()
                    .any(|s| s.trim().is_empty()),
                _ => name.trim().is_empty(),
            };
            if blank {
                return Err(DocumentError::EmptyName(kind));
            }
            if !seen.insert((kind, name.clone())) {
                return Err(DocumentError::Duplicate { kind, name });
            }
        }
        Ok(())
    }
}
