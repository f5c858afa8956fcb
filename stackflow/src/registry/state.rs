//! Persisted outputs of the most recent run.

use super::OutputSnapshot;
use crate::errors::StateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The state document format this build reads and writes.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// How the run that wrote a state document ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stack committed.
    Succeeded,
    /// The run stopped part way; outputs hold what was committed.
    Failed,
    /// Every stack was torn down.
    Destroyed,
}

/// Outputs persisted after a run, versioned by a monotonically increasing run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Format version of this document.
    pub version: u32,
    /// Id of the run that wrote this document.
    pub run_id: u64,
    /// Deployment name.
    pub deployment: String,
    /// When the document was written.
    pub committed_at: DateTime<Utc>,
    /// How the run ended.
    pub status: RunStatus,
    /// Committed outputs, keyed by stack then output key.
    pub outputs: OutputSnapshot,
    /// Stacks a failed run committed in full; the next deploy skips them.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resumable: BTreeSet<String>,
}

impl PersistedState {
    /// Creates a state document for the given run.
    #[must_use]
    pub fn new(deployment: impl Into<String>, run_id: u64, status: RunStatus, outputs: OutputSnapshot) -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            run_id,
            deployment: deployment.into(),
            committed_at: Utc::now(),
            status,
            outputs,
            resumable: BTreeSet::new(),
        }
    }

    /// Marks the stacks the next deploy may skip.
    #[must_use]
    pub fn with_resumable<I, S>(mut self, stacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resumable = stacks.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the id the next run should use.
    #[must_use]
    pub const fn next_run_id(previous: Option<&Self>) -> u64 {
        match previous {
            Some(state) => state.run_id + 1,
            None => 1,
        }
    }

    fn check_version(self) -> Result<Self, StateError> {
        if self.version == STATE_FORMAT_VERSION {
            Ok(self)
        } else {
            Err(StateError::UnsupportedVersion {
                found: self.version,
                expected: STATE_FORMAT_VERSION,
            })
        }
    }
}

/// Storage backend for persisted state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the last persisted state, if any.
    async fn load(&self) -> Result<Option<PersistedState>, StateError>;

    /// Replaces the persisted state.
    async fn save(&self, state: &PersistedState) -> Result<(), StateError>;
}

/// A state store backed by a JSON file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so a crash never leaves a half-written document behind.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Creates a store for the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the state file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: PersistedState = serde_json::from_slice(&raw)?;
        state.check_version().map(Some)
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, raw).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(path = %self.path.display(), run_id = state.run_id, "Persisted deployment state");
        Ok(())
    }
}

/// An in-memory state store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: Mutex<Option<PersistedState>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding an existing state.
    #[must_use]
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }

    /// Returns the current state without going through the trait.
    #[must_use]
    pub fn current(&self) -> Option<PersistedState> {
        self.state.lock().clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StateError> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StackOutputs;
    use crate::registry::OutputRegistry;
    use serde_json::json;

    fn sample_outputs() -> OutputSnapshot {
        let registry = OutputRegistry::new();
        let mut outputs = StackOutputs::new();
        outputs.insert("physical_id".to_string(), json!("phys-abc"));
        registry.commit("search-index", outputs).unwrap();
        registry.snapshot()
    }

    #[test]
    fn test_next_run_id() {
        assert_eq!(PersistedState::next_run_id(None), 1);
        let state = PersistedState::new("prod", 7, RunStatus::Succeeded, OutputSnapshot::new());
        assert_eq!(PersistedState::next_run_id(Some(&state)), 8);
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("nested").join("state.json"));
        let state = PersistedState::new("prod", 3, RunStatus::Succeeded, sample_outputs());

        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();

        assert_eq!(loaded, state);
        assert_eq!(loaded.outputs.get("search-index", "physical_id"), Some(&json!("phys-abc")));
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = PersistedState::new("prod", 1, RunStatus::Succeeded, OutputSnapshot::new());
        state.version = 99;
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        let err = FileStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::UnsupportedVersion { found: 99, expected: 1 }));
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryStateStore::new();
        assert!(tokio_test::block_on(store.load()).unwrap().is_none());

        let state = PersistedState::new("dev", 1, RunStatus::Failed, sample_outputs());
        tokio_test::block_on(store.save(&state)).unwrap();

        assert_eq!(store.current().unwrap().status, RunStatus::Failed);
    }
}
