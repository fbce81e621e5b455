//! DNS record set converger.
//!
//! Record sets have no id and no tags; they are found by zone, name and type.
//! Names are compared in lowercase fully-qualified form and values as an
//! unordered collection, since the provider hands both back normalised.

use serde::Deserialize;

use crate::converge_error::ConvergeError;
use crate::convergence_report::{ConvergeFailure, ConvergenceOutcome, MutationLog, OutcomeKind};
use crate::provider::{ChangeAction, DnsApi, RecordChange, RecordSet};

use super::{Converger, ResourceKind, require, single};

/// Natural key of a record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSetKey {
    /// Hosted zone id.
    pub zone_id: String,
    /// Record name, any case, with or without the trailing dot.
    pub name: String,
    /// Record type, e.g. `A`.
    pub record_type: String,
}

/// Desired state of a DNS record set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RecordSetDesired {
    /// Hosted zone id.
    pub zone_id: String,
    /// Record name.
    pub name: String,
    /// Record type. Part of the key, so never updated.
    pub record_type: String,
    /// Time to live in seconds.
    pub ttl: Option<u32>,
    /// Record values, in any order.
    pub values: Option<Vec<String>>,
}

impl RecordSetDesired {
    /// Key used to find this record set.
    #[must_use]
    pub fn key(&self) -> RecordSetKey {
        RecordSetKey {
            zone_id: self.zone_id.clone(),
            name: self.name.clone(),
            record_type: self.record_type.clone(),
        }
    }
}

/// Lowercase, fully-qualified form of a record name.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut out = name.trim().to_ascii_lowercase();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

fn same_values(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b: Vec<&str> = b.iter().map(String::as_str).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

/// Converges DNS record sets.
#[derive(Debug)]
pub struct RecordSetConverger<'a, C> {
    client: &'a C,
}

impl<'a, C: DnsApi> RecordSetConverger<'a, C> {
    /// Converger using the given DNS client.
    #[must_use]
    pub const fn new(client: &'a C) -> Self {
        Self { client }
    }

    async fn find(&self, key: &RecordSetKey) -> Result<Option<RecordSet>, ConvergeError> {
        let name = normalize_name(&key.name);
        let found: Vec<RecordSet> = self
            .client
            .list_record_sets(&key.zone_id)
            .await?
            .into_iter()
            .filter(|r| {
                normalize_name(&r.name) == name && r.record_type.eq_ignore_ascii_case(&key.record_type)
            })
            .collect();
        single(Self::KIND, &name, found)
    }

    async fn change(
        &self,
        zone_id: &str,
        action: ChangeAction,
        record_set: RecordSet,
        log: &mut MutationLog,
    ) -> Result<(), ConvergeError> {
        log.record(format!(
            "{action:?} {} {} ttl={} {:?} in {zone_id}",
            record_set.name, record_set.record_type, record_set.ttl, record_set.values
        ));
        self.client
            .change_record_sets(zone_id, &[RecordChange { action, record_set }])
            .await?;
        Ok(())
    }

    async fn present(&self, desired: &RecordSetDesired, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let name = normalize_name(&desired.name);
        let record_type = desired.record_type.to_ascii_uppercase();

        let Some(current) = self.find(&desired.key()).await? else {
            let ttl = *require(Self::KIND, &name, "ttl", desired.ttl.as_ref())?;
            let values = require(Self::KIND, &name, "values", desired.values.as_ref())?.clone();
            let record = RecordSet {
                name,
                record_type,
                ttl,
                values,
            };
            self.change(&desired.zone_id, ChangeAction::Create, record, log)
                .await?;
            return Ok(OutcomeKind::Created);
        };

        let ttl_differs = desired.ttl.is_some_and(|t| t != current.ttl);
        let values_differ = desired
            .values
            .as_ref()
            .is_some_and(|v| !same_values(v, &current.values));
        if !ttl_differs && !values_differ {
            return Ok(OutcomeKind::Unchanged);
        }

        let record = RecordSet {
            name: current.name.clone(),
            record_type: current.record_type.clone(),
            ttl: desired.ttl.unwrap_or(current.ttl),
            values: desired.values.clone().unwrap_or(current.values),
        };
        self.change(&desired.zone_id, ChangeAction::Upsert, record, log)
            .await?;
        Ok(OutcomeKind::Updated)
    }

    async fn absent(&self, key: &RecordSetKey, log: &mut MutationLog) -> Result<OutcomeKind, ConvergeError> {
        let Some(current) = self.find(key).await? else {
            return Ok(OutcomeKind::Unchanged);
        };
        // A delete must carry the record exactly as it exists.
        self.change(&key.zone_id, ChangeAction::Delete, current, log)
            .await?;
        Ok(OutcomeKind::Destroyed)
    }
}

impl<C: DnsApi> Converger for RecordSetConverger<'_, C> {
    type Desired = RecordSetDesired;
    type Target = RecordSetKey;

    const KIND: ResourceKind = ResourceKind::RecordSet;

    async fn ensure_present(&self, desired: &RecordSetDesired) -> Result<ConvergenceOutcome, ConvergeFailure> {
        let mut log = MutationLog::new(Self::KIND, normalize_name(&desired.name));
        let result = self.present(desired, &mut log).await;
        log.settle(result)
    }

    async fn ensure_absent(&self, key: &RecordSetKey) -> Result<ConvergenceOutcome, ConvergeFailure> {
        let mut log = MutationLog::new(Self::KIND, normalize_name(&key.name));
        let result = self.absent(key, &mut log).await;
        log.settle(result)
    }
}
