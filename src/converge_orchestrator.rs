//! Convergence orchestrator.
//!
//! Walks a [`DesiredDocument`] against one provider:
//! - `apply()`: converge every declaration in order, recording resolved ids
//! - `destroy()`: tear declarations down in reverse order, forgetting their ids
//! - `verify()`: apply twice; the second pass must not change anything
//!
//! A failed declaration becomes a `failed` outcome, still listing the calls
//! made before the error, and the walk continues with the next one. If the
//! failed pass got as far as creating the object, its id is recorded anyway
//! so the next run finds it instead of creating a second one.

use tracing::{error, info};

use crate::converge_config::ConvergeConfig;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, ConvergenceReport};
use crate::desired_document::{DesiredDocument, ResourceDeclaration};
use crate::provider::CloudProvider;
use crate::resource_store::{EntryState, now_unix_ms};
use crate::resources::{
    AutoScalingGroupConverger, BucketConverger, Converger, DbInstanceConverger,
    LoadBalancerConverger, NetworkConverger, RecordSetConverger, ResourceRef,
    SearchDomainConverger, VolumeConverger,
};

/// Drives the convergers for a whole document.
#[derive(Debug)]
pub struct ConvergeOrchestrator<'a, P> {
    provider: &'a P,
    cfg: &'a ConvergeConfig,
}

impl<'a, P: CloudProvider> ConvergeOrchestrator<'a, P> {
    /// Orchestrator over the given provider.
    #[must_use]
    pub const fn new(provider: &'a P, cfg: &'a ConvergeConfig) -> Self {
        Self { provider, cfg }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ConvergeConfig {
        self.cfg
    }

    /// Converge one declaration.
    ///
    /// # Errors
    ///
    /// Returns the converger's failure unchanged.
    pub async fn ensure_present(&self, decl: &ResourceDeclaration) -> Result<ConvergenceOutcome, ConvergeFailure> {
        let (p, cfg) = (self.provider, self.cfg);
        match decl {
            ResourceDeclaration::Network(d) => NetworkConverger::new(p, cfg).ensure_present(d).await,
            ResourceDeclaration::Volume(d) => VolumeConverger::new(p, cfg).ensure_present(d).await,
            ResourceDeclaration::RecordSet(d) => RecordSetConverger::new(p).ensure_present(d).await,
            ResourceDeclaration::DbInstance(d) => DbInstanceConverger::new(p, cfg).ensure_present(d).await,
            ResourceDeclaration::Bucket(d) => BucketConverger::new(p, cfg).ensure_present(d).await,
            ResourceDeclaration::SearchDomain(d) => SearchDomainConverger::new(p, cfg).ensure_present(d).await,
            ResourceDeclaration::LoadBalancer(d) => LoadBalancerConverger::new(p, cfg).ensure_present(d).await,
            ResourceDeclaration::AutoScalingGroup(d) => {
                AutoScalingGroupConverger::new(p, cfg).ensure_present(d).await
            }
        }
    }

    /// Tear one declaration down.
    ///
    /// # Errors
    ///
    /// Returns the converger's failure unchanged.
    pub async fn ensure_absent(&self, decl: &ResourceDeclaration) -> Result<ConvergenceOutcome, ConvergeFailure> {
        let (p, cfg) = (self.provider, self.cfg);
        match decl {
            ResourceDeclaration::Network(d) => NetworkConverger::new(p, cfg).ensure_absent(&d.target()).await,
            ResourceDeclaration::Volume(d) => VolumeConverger::new(p, cfg).ensure_absent(&d.target()).await,
            ResourceDeclaration::RecordSet(d) => RecordSetConverger::new(p).ensure_absent(&d.key()).await,
            ResourceDeclaration::DbInstance(d) => {
                DbInstanceConverger::new(p, cfg)
                    .ensure_absent(&ResourceRef::named(&d.name))
                    .await
            }
            ResourceDeclaration::Bucket(d) => {
                BucketConverger::new(p, cfg)
                    .ensure_absent(&ResourceRef::named(&d.name))
                    .await
            }
            ResourceDeclaration::SearchDomain(d) => {
                SearchDomainConverger::new(p, cfg)
                    .ensure_absent(&ResourceRef::named(&d.name))
                    .await
            }
            ResourceDeclaration::LoadBalancer(d) => {
                LoadBalancerConverger::new(p, cfg)
                    .ensure_absent(&ResourceRef::named(&d.name))
                    .await
            }
            ResourceDeclaration::AutoScalingGroup(d) => {
                AutoScalingGroupConverger::new(p, cfg)
                    .ensure_absent(&ResourceRef::named(&d.name))
                    .await
            }
        }
    }

    /// Converge every declaration in order.
    pub async fn apply(&self, doc: &DesiredDocument, entries: &mut EntryState) -> ConvergenceReport {
        let mut report = ConvergenceReport::new();
        for decl in &doc.resources {
            let (kind, name) = (decl.kind(), decl.name());
            let decl = decl.clone().with_known_id(entries.id_of(kind, &name));

            match self.ensure_present(&decl).await {
                Ok(outcome) => {
                    entries.record(kind, &name, outcome.id.clone(), now_unix_ms());
                    report.push(outcome);
                }
                Err(failure) => {
                    error!(
                        kind = %kind,
                        name = %name,
                        error = %failure.error,
                        calls = failure.outcome.actions.len(),
                        "convergence failed"
                    );
                    if failure.outcome.id.is_some() {
                        entries.record(kind, &name, failure.outcome.id.clone(), now_unix_ms());
                    }
                    report.push(*failure.outcome);
                }
            }
        }
        info!(
            outcomes = report.outcomes().len(),
            failures = report.failures().count(),
            "apply finished"
        );
        report
    }

    /// Tear every declaration down, last declared first.
    pub async fn destroy(&self, doc: &DesiredDocument, entries: &mut EntryState) -> ConvergenceReport {
        let mut report = ConvergenceReport::new();
        for decl in doc.resources.iter().rev() {
            let (kind, name) = (decl.kind(), decl.name());
            let decl = decl.clone().with_known_id(entries.id_of(kind, &name));

            match self.ensure_absent(&decl).await {
                Ok(outcome) => {
                    entries.forget(kind, &name);
                    report.push(outcome);
                }
                Err(failure) => {
                    error!(kind = %kind, name = %name, error = %failure.error, "teardown failed");
                    report.push(*failure.outcome);
                }
            }
        }
        info!(
            outcomes = report.outcomes().len(),
            failures = report.failures().count(),
            "destroy finished"
        );
        report
    }

    /// Apply twice and return both reports; converged state shows as an all-unchanged second report.
    pub async fn verify(
        &self,
        doc: &DesiredDocument,
        entries: &mut EntryState,
    ) -> (ConvergenceReport, ConvergenceReport) {
        let first = self.apply(doc, entries).await;
        let second = self.apply(doc, entries).await;
        if !second.is_idempotent() {
            error!("second pass was not a no-op");
        }
        (first, second)
    }
}
