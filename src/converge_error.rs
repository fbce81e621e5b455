//! Convergence errors.
//!
//! A missing remote object is never an error here; convergers treat it as the
//! `NotPresent` state. Everything below aborts the current pass.

use thiserror::Error;

use crate::provider::ProviderError;
use crate::resources::ResourceKind;

/// Error type for convergence operations.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Desired value of a create-only attribute differs from the remote one.
    #[error(
        "{kind} '{name}': attribute '{attribute}' cannot be changed after creation \
         (desired {desired}, current {current})"
    )]
    ImmutableAttributeConflict {
        /// Resource kind.
        kind: ResourceKind,
        /// Logical resource name.
        name: String,
        /// Attribute name.
        attribute: &'static str,
        /// Desired value, rendered.
        desired: String,
        /// Current remote value, rendered.
        current: String,
    },

    /// The resource is absent and cannot be created without this attribute.
    #[error("{kind} '{name}': attribute '{attribute}' is required to create it")]
    MissingAttribute {
        /// Resource kind.
        kind: ResourceKind,
        /// Logical resource name.
        name: String,
        /// Attribute name.
        attribute: &'static str,
    },

    /// More than one remote object carries the natural key.
    #[error("{kind} '{name}': {count} remote objects match, expected at most one")]
    AmbiguousResource {
        /// Resource kind.
        kind: ResourceKind,
        /// Logical resource name.
        name: String,
        /// Number of matches.
        count: usize,
    },

    /// Neither the identity service nor its access-denied error revealed an account id.
    #[error("cannot determine account id: {0}")]
    AccountId(String),

    /// A remote call failed; the provider error is passed through as is.
    #[error(transparent)]
    Transport(#[from] ProviderError),

    /// A multi-step create failed after owned sub-resources were created.
    ///
    /// Displays as the original failure. `cleanup_failures` lists the
    /// rollback calls that failed in turn.
    #[error("{source}")]
    PartialCreation {
        /// Resource kind.
        kind: ResourceKind,
        /// Logical resource name.
        name: String,
        /// The failure that interrupted creation.
        source: ProviderError,
        /// Rollback calls that failed.
        cleanup_failures: Vec<ProviderError>,
    },
}

impl ConvergeError {
    /// The underlying provider error, if this failure came from a remote call.
    #[must_use]
    pub const fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Transport(e) | Self::PartialCreation { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Whether this is a configuration problem rather than a remote failure.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::ImmutableAttributeConflict { .. }
                | Self::MissingAttribute { .. }
                | Self::AmbiguousResource { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_conflict_names_attribute_and_both_values() {
        let err = ConvergeError::ImmutableAttributeConflict {
            kind: ResourceKind::Network,
            name: "main".into(),
            attribute: "cidr_block",
            desired: "10.1.0.0/16".into(),
            current: "10.0.0.0/16".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cidr_block"));
        assert!(msg.contains("10.1.0.0/16"));
        assert!(msg.contains("10.0.0.0/16"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn transport_and_partial_creation_display_the_provider_error() {
        let original = ProviderError::new("ec2", "RequestLimitExceeded", "slow down");
        let transport = ConvergeError::from(original.clone());
        assert_eq!(transport.to_string(), original.to_string());

        let partial = ConvergeError::PartialCreation {
            kind: ResourceKind::Network,
            name: "main".into(),
            source: original.clone(),
            cleanup_failures: vec![],
        };
        assert_eq!(partial.to_string(), original.to_string());
        assert_eq!(partial.provider_error(), Some(&original));
    }
}
