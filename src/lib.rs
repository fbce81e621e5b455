//! Cloud Converge - declarative convergence of cloud resources.
//!
//! A library for bringing remote cloud objects to a declared state with:
//! - **Convergers**: one per resource kind, with create / update / refuse / delete decisions
//! - **Tag reconciliation**: one algorithm over per-service tag strategies
//! - **Reports**: every pass yields `created`, `updated`, `unchanged` or `destroyed`
//! - **Managed entries**: persist the provider id each declaration resolved to
//! - **Sandbox provider**: an in-memory cloud for tests and dry runs
//!
//! ## Quick Start
//!
//! Configuration is loaded from environment variables. Create a `.env` file:
//!
//! ```text
//! CONVERGE_REGION=eu-west-1
//! CONVERGE_ACCOUNT_ID=123456789012
//! CONVERGE_LOG=info
//! ```
//!
//! Then converge a desired-state document:
//!
//! ```ignore
//! use cloud_converge::{ConvergeConfig, ConvergeOrchestrator, DesiredDocument, EntryState, SandboxCloud};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ConvergeConfig::from_env()?;
//!     let cloud = SandboxCloud::new(&cfg.region, "123456789012");
//!     let doc = DesiredDocument::from_path("infra.json".as_ref())?;
//!
//!     let mut entries = EntryState::new();
//!     let report = ConvergeOrchestrator::new(&cloud, &cfg).apply(&doc, &mut entries).await;
//!     for outcome in report.outcomes() {
//!         println!("{outcome}");
//!     }
//!     Ok(())
//! }
//! ```

// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy for strict discipline
#![deny(clippy::all)]                 // All standard Clippy lints
#![deny(clippy::unwrap_used)]         // unwrap() is forbidden
#![deny(clippy::expect_used)]         // expect() is forbidden
#![deny(clippy::panic)]               // panic!() is forbidden
#![deny(clippy::print_stdout)]        // println!() is forbidden in the library
#![deny(clippy::todo)]                // TODO is forbidden
#![deny(clippy::unimplemented)]       // unimplemented!() is forbidden
#![deny(clippy::unwrap_in_result)]    // unwrap() in Result is forbidden
#![deny(clippy::redundant_clone)]     // Useless clones are forbidden
#![deny(clippy::pedantic)]            // Very strict Clippy lints
#![deny(clippy::nursery)]             // Experimental lints
#![allow(clippy::future_not_send)]    // Provider futures carry no Send bound

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Modules
// ============================================================================

/// Tag maps and tag diffs.
pub mod tag_set;

/// Provider client contracts, one trait per service.
pub mod provider;

/// Convergence errors.
pub mod converge_error;

/// Outcomes, mutation log and reports.
pub mod convergence_report;

/// Per-service tag strategies and ARN helpers.
pub mod tag_strategy;

/// Service-agnostic tag reconciliation.
pub mod tag_reconciler;

/// Convergers, one per resource kind.
pub mod resources;

/// Environment-driven configuration.
pub mod converge_config;

/// Managed-entry persistence.
///
/// Use this module to remember provider ids between runs.
pub mod resource_store;

/// Desired-state documents.
pub mod desired_document;

/// Whole-document orchestration.
///
/// Use this module to apply, destroy or verify a document in one call.
pub mod converge_orchestrator;

/// In-memory provider implementing every service.
pub mod sandbox;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use converge_config::{ConfigError, ConvergeConfig};
pub use converge_error::ConvergeError;
pub use converge_orchestrator::ConvergeOrchestrator;
pub use convergence_report::{
    ConvergeFailure, ConvergenceOutcome, ConvergenceReport, MutationLog, OutcomeKind,
};
pub use desired_document::{DesiredDocument, DocumentError, ResourceDeclaration};
pub use provider::{CloudProvider, ProviderError, ProviderResult};
pub use resource_store::{EntryState, EntryStore, JsonFileEntryStore, StoreError};
pub use resources::{Converger, ResourceKind, ResourceRef};
pub use sandbox::{SandboxCloud, SandboxError};
pub use tag_reconciler::TagReconciler;
pub use tag_set::{TagDiff, TagSet};
pub use tag_strategy::{TagCapabilities, TagMutation, TagStrategy};
