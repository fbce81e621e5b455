//! Tag sets and tag diffs.
//!
//! Unique responsibility: represent the key/value tags attached to a remote
//! object and compute the add/update/delete partition between what is on the
//! object and what the caller wants.
//!
//! Values are optional because some providers accept a tag without a value.
//! Whether a given provider does is a strategy capability, see
//! `tag_strategy`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Mapping from tag key to optional tag value.
///
/// Keys are unique; iteration order is the key order and carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, Option<String>>);

impl TagSet {
    /// Create an empty tag set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a tag set from `(key, value)` pairs where every value is present.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), Some(v.into())))
            .collect()
    }

    /// Insert or replace a tag.
    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        self.0.insert(key.into(), value);
    }

    /// Builder-style insert of a tag with a value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, Some(value.into()));
        self
    }

    /// Remove a tag, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        self.0.remove(key)
    }

    /// Look up a tag. The outer `Option` is key presence.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Option<String>> {
        self.0.get(key)
    }

    /// Value of a tag, treating a valueless tag as absent.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Option::as_deref)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterate over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Copy of this set without the given keys.
    #[must_use]
    pub fn without(&self, keys: &BTreeSet<String>) -> Self {
        self.0
            .iter()
            .filter(|(k, _)| !keys.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Tags whose key starts with `prefix`. An empty or missing prefix matches nothing.
    #[must_use]
    pub fn reserved(&self, prefix: Option<&str>) -> Self {
        self.0
            .iter()
            .filter(|(k, _)| is_reserved(k, prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copy of this set with absent values replaced by the empty string.
    #[must_use]
    pub fn with_empty_values(&self) -> Self {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone().unwrap_or_default())))
            .collect()
    }
}

fn is_reserved(key: &str, prefix: Option<&str>) -> bool {
    prefix.is_some_and(|p| !p.is_empty() && key.starts_with(p))
}

impl FromIterator<(String, Option<String>)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match v {
                Some(v) => write!(f, "{k}={v:?}")?,
                None => write!(f, "{k}")?,
            }
        }
        f.write_str("}")
    }
}

/// Partition of tag keys between a current and a desired tag set.
///
/// `to_add`, `to_update` and `to_delete` are pairwise disjoint. Keys present
/// in both sets with equal values are in none of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    /// Desired tags absent from the remote object.
    pub to_add: TagSet,
    /// Desired tags present remotely with a different value.
    pub to_update: TagSet,
    /// Remote keys absent from the desired set.
    pub to_delete: BTreeSet<String>,
}

impl TagDiff {
    /// Compute the diff using exact value equality.
    ///
    /// Keys starting with `reserved_prefix` are never scheduled for deletion.
    #[must_use]
    pub fn compute(current: &TagSet, desired: &TagSet, reserved_prefix: Option<&str>) -> Self {
        let mut diff = Self::default();

        for (key, value) in &desired.0 {
            match current.0.get(key) {
                None => diff.to_add.insert(key.clone(), value.clone()),
                Some(existing) if existing != value => {
                    diff.to_update.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }

        diff.to_delete = current
            .0
            .keys()
            .filter(|k| !desired.0.contains_key(*k))
            .filter(|k| !is_reserved(k, reserved_prefix))
            .cloned()
            .collect();

        diff
    }

    /// Whether applying this diff would need no call.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

impl fmt::Display for TagDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "add {} update {} delete {:?}",
            self.to_add, self.to_update, self.to_delete
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        TagSet::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn identical_sets_produce_empty_diff() {
        let current = tags(&[("env", "prod"), ("team", "core")]);
        let diff = TagDiff::compute(&current, &current.clone(), None);
        assert!(diff.is_empty());
    }

    #[test]
    fn classifies_add_update_delete() {
        let current = tags(&[("env", "dev"), ("stale", "x"), ("keep", "1")]);
        let desired = tags(&[("env", "prod"), ("owner", "ops"), ("keep", "1")]);

        let diff = TagDiff::compute(&current, &desired, None);

        assert_eq!(diff.to_add, tags(&[("owner", "ops")]));
        assert_eq!(diff.to_update, tags(&[("env", "prod")]));
        assert_eq!(diff.to_delete, BTreeSet::from(["stale".to_string()]));
    }

    #[test]
    fn valueless_and_empty_value_are_different() {
        let mut current = TagSet::new();
        current.insert("flag", Some(String::new()));
        let mut desired = TagSet::new();
        desired.insert("flag", None);

        let diff = TagDiff::compute(&current, &desired, None);
        assert_eq!(diff.to_update.get("flag"), Some(&None));
    }

    #[test]
    fn reserved_prefix_is_never_deleted() {
        let current = tags(&[("aws:cloudformation:stack-name", "s"), ("old", "1")]);
        let diff = TagDiff::compute(&current, &TagSet::new(), Some("aws:"));
        assert_eq!(diff.to_delete, BTreeSet::from(["old".to_string()]));
    }

    #[test]
    fn empty_reserved_prefix_disables_protection() {
        let current = tags(&[("aws:x", "1")]);
        let diff = TagDiff::compute(&current, &TagSet::new(), Some(""));
        assert_eq!(diff.to_delete.len(), 1);
        assert!(current.reserved(Some("")).is_empty());
    }

    #[test]
    fn reserved_picks_prefixed_keys_only() {
        let current = tags(&[("aws:cloudformation:stack-name", "s"), ("a", "1")]);
        assert_eq!(
            current.reserved(Some("aws:")),
            tags(&[("aws:cloudformation:stack-name", "s")])
        );
        assert!(current.reserved(None).is_empty());
    }

    #[test]
    fn without_and_empty_values() {
        let mut set = tags(&[("a", "1"), ("b", "2")]);
        set.insert("c", None);
        let trimmed = set.without(&BTreeSet::from(["a".to_string()]));
        assert!(!trimmed.contains_key("a"));
        assert_eq!(trimmed.with_empty_values().value("c"), Some(""));
    }

    fn tag_map() -> impl Strategy<Value = TagSet> {
        proptest::collection::btree_map("[a-e]", proptest::option::of("[xyz]"), 0..6)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        /// The three sets are disjoint and, with unchanged keys, cover both key sets.
        #[test]
        fn prop_diff_partitions_key_union(current in tag_map(), desired in tag_map()) {
            let diff = TagDiff::compute(&current, &desired, None);

            let add: BTreeSet<&str> = diff.to_add.keys().collect();
            let update: BTreeSet<&str> = diff.to_update.keys().collect();
            let delete: BTreeSet<&str> = diff.to_delete.iter().map(String::as_str).collect();
            let unchanged: BTreeSet<&str> = desired
                .iter()
                .filter(|(k, v)| current.get(k).map(Option::as_deref) == Some(*v))
                .map(|(k, _)| k)
                .collect();

            prop_assert!(add.is_disjoint(&update));
            prop_assert!(add.is_disjoint(&delete));
            prop_assert!(update.is_disjoint(&delete));
            prop_assert!(unchanged.is_disjoint(&add) && unchanged.is_disjoint(&update));

            let covered: BTreeSet<&str> = add
                .iter()
                .chain(&update)
                .chain(&delete)
                .chain(&unchanged)
                .copied()
                .collect();
            let union: BTreeSet<&str> = current.keys().chain(desired.keys()).collect();
            prop_assert_eq!(covered, union);
        }

        /// Equal sets never need a call.
        #[test]
        fn prop_equal_sets_are_minimal(set in tag_map()) {
            prop_assert!(TagDiff::compute(&set, &set, Some("aws:")).is_empty());
        }
    }
}
