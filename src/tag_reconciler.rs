//! Service-agnostic tag reconciliation.
//!
//! Unique responsibility: given a [`TagStrategy`] and the desired tags, issue
//! the fewest calls that make the remote tags equal to the desired ones.
//!
//! Call order for providers with per-key mutation:
//! 1) `delete_tags` for keys no longer desired,
//! 2) `set_tags` for new keys,
//! 3) `set_tags` for keys whose value changed.
//!
//! Deleting first keeps tag-count quotas from being exceeded and avoids a key
//! briefly carrying two meanings. Wholesale providers get exactly one call per
//! pass: `delete_tags` when something must go (it rewrites the desired set or
//! clears everything), otherwise `set_tags` with the whole desired set. A
//! wholesale write would drop reserved-prefix tags, so while any are on the
//! object the pass always writes them back alongside the desired set.

use tracing::debug;

use crate::convergence_report::MutationLog;
use crate::provider::ProviderResult;
use crate::tag_set::{TagDiff, TagSet};
use crate::tag_strategy::{TagMutation, TagStrategy};

/// Reconciles the tags of one remote object.
#[derive(Debug)]
pub struct TagReconciler<'a, S> {
    strategy: &'a S,
    reserved_prefix: Option<&'a str>,
}

impl<'a, S: TagStrategy> TagReconciler<'a, S> {
    /// Reconciler driving the given strategy.
    #[must_use]
    pub const fn new(strategy: &'a S) -> Self {
        Self {
            strategy,
            reserved_prefix: None,
        }
    }

    /// Never delete keys starting with `prefix` (provider-managed tags).
    #[must_use]
    pub const fn with_reserved_prefix(mut self, prefix: Option<&'a str>) -> Self {
        self.reserved_prefix = prefix;
        self
    }

    /// Fetch the current tags and diff them against `desired`.
    ///
    /// # Errors
    ///
    /// Returns the provider error if the tags cannot be fetched.
    pub async fn plan(&self, desired: &TagSet) -> ProviderResult<TagDiff> {
        Ok(self.survey(desired).await?.1)
    }

    async fn survey(&self, desired: &TagSet) -> ProviderResult<(TagSet, TagDiff)> {
        let current = self.strategy.current_tags().await?;
        let desired = self.strategy.prepare_desired(desired);
        let diff = TagDiff::compute(&current, &desired, self.reserved_prefix);
        debug!(target_id = %self.strategy.target(), %current, %diff, "tag plan");
        Ok((current, diff))
    }

    /// Bring the remote tags to `desired`, recording each call in `log`.
    ///
    /// Returns whether any mutating call was issued.
    ///
    /// # Errors
    ///
    /// Returns the first provider error; later calls are not attempted.
    pub async fn converge_tags(&self, desired: &TagSet, log: &mut MutationLog) -> ProviderResult<bool> {
        let (current, diff) = self.survey(desired).await?;
        if diff.is_empty() {
            return Ok(false);
        }

        let target = self.strategy.target();
        match self.strategy.capabilities().mutation {
            TagMutation::Partial => {
                if !diff.to_delete.is_empty() {
                    log.record(format!("delete tags {:?} from {target}", diff.to_delete));
                    self.strategy.delete_tags(&diff.to_delete).await?;
                }
                if !diff.to_add.is_empty() {
                    log.record(format!("add tags {} to {target}", diff.to_add));
                    self.strategy.set_tags(&diff.to_add).await?;
                }
                if !diff.to_update.is_empty() {
                    log.record(format!("update tags {} on {target}", diff.to_update));
                    self.strategy.set_tags(&diff.to_update).await?;
                }
            }
            TagMutation::Wholesale => {
                let reserved = current.reserved(self.reserved_prefix);
                if diff.to_delete.is_empty() || !reserved.is_empty() {
                    let mut full = reserved;
                    for (key, value) in self.strategy.prepare_desired(desired).iter() {
                        full.insert(key, value.map(str::to_string));
                    }
                    log.record(format!("replace tags on {target} with {full}"));
                    self.strategy.set_tags(&full).await?;
                } else {
                    log.record(format!("delete tags {:?} from {target}", diff.to_delete));
                    self.strategy.delete_tags(&diff.to_delete).await?;
                }
            }
        }

        Ok(true)
    }
}
