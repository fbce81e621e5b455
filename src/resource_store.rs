//! Managed-entry persistence.
//!
//! Unique responsibility: remember which provider id each declared resource
//! resolved to, keyed by `(kind, name)`, so the next run looks objects up by
//! id instead of by their `Name` tag.
//!
//! Non-goals:
//! - Being the source of truth. The live provider state always wins; a
//!   recorded id that no longer exists is simply treated as absent.
//!
//! Expected integration:
//! 1) Load entries (`JsonFileEntryStore`)
//! 2) Fill in known ids on the declarations
//! 3) Converge
//! 4) Record the ids from the outcomes (or forget destroyed ones), then save

#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::ResourceKind;

/// Entry file format version.
const ENTRY_FORMAT_VERSION: u32 = 1;

/// One declared resource and the id it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedEntry {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Logical name.
    pub name: String,
    /// Provider id, when the provider assigns one.
    pub id: Option<String>,
    /// Last update (ms since epoch).
    pub updated_at_ms: u64,
}

/// Every managed entry, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    /// Format version for serialization.
    pub format_version: u32,
    /// Entries, sorted by kind then name.
    pub entries: Vec<ManagedEntry>,
}

impl Default for EntryState {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryState {
    /// Empty state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            format_version: ENTRY_FORMAT_VERSION,
            entries: Vec::new(),
        }
    }

    fn position(&self, kind: ResourceKind, name: &str) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|e| (e.kind, e.name.as_str()).cmp(&(kind, name)))
    }

    /// Entry for `(kind, name)`.
    #[must_use]
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&ManagedEntry> {
        self.position(kind, name).ok().map(|i| &self.entries[i])
    }

    /// Recorded id for `(kind, name)`.
    #[must_use]
    pub fn id_of(&self, kind: ResourceKind, name: &str) -> Option<&str> {
        self.get(kind, name).and_then(|e| e.id.as_deref())
    }

    /// Insert or replace an entry.
    pub fn record(&mut self, kind: ResourceKind, name: &str, id: Option<String>, now_ms: u64) {
        let entry = ManagedEntry {
            kind,
            name: name.to_string(),
            id,
            updated_at_ms: now_ms,
        };
        match self.position(kind, name) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
    }

    /// Drop an entry; returns whether one existed.
    pub fn forget(&mut self, kind: ResourceKind, name: &str) -> bool {
        match self.position(kind, name) {
            Ok(i) => {
                self.entries.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.format_version != ENTRY_FORMAT_VERSION {
            return Err(StoreError::InvalidState("unsupported entry format version"));
        }
        if self.entries.iter().any(|e| e.name.trim().is_empty()) {
            return Err(StoreError::InvalidState("entry with empty name"));
        }
        if self
            .entries
            .windows(2)
            .any(|w| (w[0].kind, &w[0].name) >= (w[1].kind, &w[1].name))
        {
            return Err(StoreError::InvalidState("entries not sorted or duplicated"));
        }
        Ok(())
    }
}

/// Errors for entry store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Invalid state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Persistence of managed entries.
pub trait EntryStore {
    /// Load the entries; `None` when nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns an error if loading fails (I/O, parsing, or validation).
    fn load(&self) -> Result<Option<EntryState>, StoreError>;

    /// Save the entries.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails (I/O, serialization, or validation).
    fn save(&self, state: &EntryState) -> Result<(), StoreError>;
}

/// File-based JSON entry store with atomic writes.
#[derive(Debug, Clone)]
pub struct JsonFileEntryStore {
    path: PathBuf,
}

impl JsonFileEntryStore {
    /// Store backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to the entry file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EntryStore for JsonFileEntryStore {
    fn load(&self) -> Result<Option<EntryState>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let state: EntryState = serde_json::from_slice(&bytes)?;
        state.validate()?;
        Ok(Some(state))
    }

    fn save(&self, state: &EntryState) -> Result<(), StoreError> {
        state.validate()?;
        write_json_atomic(&self.path, state)
    }
}

/// Write `value` as pretty JSON next to `path`, sync it, then rename over `path`.
pub(crate) fn write_json_atomic<T, E>(path: &Path, value: &T) -> Result<(), E>
where
    T: Serialize + ?Sized,
    E: From<io::Error> + From<serde_json::Error>,
{
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.to_path_buf();
    let tmp_name = format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("converge_state")
    );
    tmp.set_file_name(tmp_name);

    let json = serde_json::to_vec_pretty(value)?;
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }

    // Rename over an existing file can fail on Windows.
    #[cfg(windows)]
    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Current timestamp in milliseconds since UNIX epoch.
#[must_use]
pub fn now_unix_ms() -> u64 {
    let Ok(dur) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(dur.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_entries_sorted_and_unique() {
        let mut state = EntryState::new();
        state.record(ResourceKind::Volume, "data", Some("vol-1".into()), 1);
        state.record(ResourceKind::Network, "main", Some("vpc-1".into()), 1);
        state.record(ResourceKind::Network, "main", Some("vpc-2".into()), 2);

        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.entries[0].kind, ResourceKind::Network);
        assert_eq!(state.id_of(ResourceKind::Network, "main"), Some("vpc-2"));
        assert!(state.validate().is_ok());
    }

    #[test]
    fn forget_reports_whether_an_entry_existed() {
        let mut state = EntryState::new();
        state.record(ResourceKind::Bucket, "logs", None, 1);
        assert!(state.forget(ResourceKind::Bucket, "logs"));
        assert!(!state.forget(ResourceKind::Bucket, "logs"));
    }

    #[test]
    fn save_then_load_through_a_file() {
        let dir = tempfile::tempdir().ok();
        let path = dir
            .as_ref()
            .map(|d| d.path().join("nested").join("state.json"))
            .unwrap_or_default();
        let store = JsonFileEntryStore::new(&path);
        assert!(matches!(store.load(), Ok(None)));

        let mut state = EntryState::new();
        state.record(ResourceKind::Network, "main", Some("vpc-1".into()), 7);
        assert!(store.save(&state).is_ok());

        assert_eq!(store.load().ok().flatten(), Some(state));
        assert!(!path.with_file_name(".state.json.tmp").exists());
    }

    #[test]
    fn saving_again_replaces_the_previous_file() {
        let dir = tempfile::tempdir().ok();
        let path = dir
            .as_ref()
            .map(|d| d.path().join("state.json"))
            .unwrap_or_default();
        let store = JsonFileEntryStore::new(&path);

        let mut state = EntryState::new();
        state.record(ResourceKind::Volume, "data", Some("vol-1".into()), 1);
        let first = store.save(&state);
        assert!(first.is_ok(), "{first:?}");
        state.record(ResourceKind::Volume, "data", Some("vol-2".into()), 2);
        let second = store.save(&state);
        assert!(second.is_ok(), "{second:?}");

        let loaded = store.load().ok().flatten();
        assert_eq!(
            loaded.as_ref().and_then(|s| s.id_of(ResourceKind::Volume, "data")),
            Some("vol-2")
        );
    }

    #[test]
    fn wrong_version_is_rejected() {
        let dir = tempfile::tempdir().ok();
        let path = dir
            .as_ref()
            .map(|d| d.path().join("state.json"))
            .unwrap_or_default();
        let written = fs::write(&path, br#"{"format_version": 9, "entries": []}"#);
        assert!(written.is_ok(), "{written:?}");

        let err = JsonFileEntryStore::new(&path).load().err();
        assert!(matches!(err, Some(StoreError::InvalidState(_))));
    }
}
