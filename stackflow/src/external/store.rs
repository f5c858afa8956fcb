//! Storage for external resource state, kept outside the invocation itself.

use super::ExternalResource;
use crate::errors::ExternalResourceError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Persists resource records so retries and redelivery survive restarts.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Loads a resource by logical id.
    async fn get(&self, logical_id: &str) -> Result<Option<ExternalResource>, ExternalResourceError>;

    /// Stores a resource, replacing any earlier record.
    async fn put(&self, resource: &ExternalResource) -> Result<(), ExternalResourceError>;

    /// Lists every stored resource, ordered by logical id.
    async fn list(&self) -> Result<Vec<ExternalResource>, ExternalResourceError>;
}

/// In-memory resource store.
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    resources: DashMap<String, ExternalResource>,
}

impl InMemoryResourceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get(&self, logical_id: &str) -> Result<Option<ExternalResource>, ExternalResourceError> {
        Ok(self.resources.get(logical_id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, resource: &ExternalResource) -> Result<(), ExternalResourceError> {
        self.resources
            .insert(resource.logical_id.clone(), resource.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExternalResource>, ExternalResourceError> {
        let mut resources: Vec<_> = self
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        resources.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));
        Ok(resources)
    }
}

/// Resource store backed by one JSON file, rewritten atomically on each put.
#[derive(Debug)]
pub struct FileResourceStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, ExternalResource>>>,
}

impl FileResourceStore {
    /// Creates a store at `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<BTreeMap<String, ExternalResource>, ExternalResourceError> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(store_error),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(store_error(err)),
        }
    }

    async fn write_file(
        &self,
        resources: &BTreeMap<String, ExternalResource>,
    ) -> Result<(), ExternalResourceError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(store_error)?;
        }
        let raw = serde_json::to_vec_pretty(resources).map_err(store_error)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await.map_err(store_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(store_error)
    }
}

fn store_error(err: impl std::fmt::Display) -> ExternalResourceError {
    ExternalResourceError::Store(err.to_string())
}

#[async_trait]
impl ResourceStore for FileResourceStore {
    async fn get(&self, logical_id: &str) -> Result<Option<ExternalResource>, ExternalResourceError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        Ok(cache.as_ref().and_then(|resources| resources.get(logical_id).cloned()))
    }

    async fn put(&self, resource: &ExternalResource) -> Result<(), ExternalResourceError> {
        let mut cache = self.cache.lock().await;
        let mut resources = match cache.take() {
            Some(resources) => resources,
            None => self.read_file().await?,
        };
        resources.insert(resource.logical_id.clone(), resource.clone());
        let written = self.write_file(&resources).await;
        *cache = Some(resources);
        written
    }

    async fn list(&self) -> Result<Vec<ExternalResource>, ExternalResourceError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        Ok(cache
            .as_ref()
            .map(|resources| resources.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ResourceState;
    use serde_json::json;

    fn created(id: &str) -> ExternalResource {
        let mut resource = ExternalResource::declare(id, "search_index", json!({}));
        resource.transition(ResourceState::Creating).unwrap();
        resource.assign_physical_id(&format!("phys-{id}")).unwrap();
        resource.transition(ResourceState::Created).unwrap();
        resource
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryResourceStore::new();
        assert!(store.get("b").await.unwrap().is_none());

        store.put(&created("b")).await.unwrap();
        store.put(&created("a")).await.unwrap();

        assert_eq!(store.len(), 2);
        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.logical_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("resources.json");

        let store = FileResourceStore::new(&path);
        store.put(&created("docs")).await.unwrap();

        let reopened = FileResourceStore::new(&path);
        let resource = reopened.get("docs").await.unwrap().unwrap();
        assert_eq!(resource.state(), ResourceState::Created);
        assert_eq!(resource.physical_id(), Some("phys-docs"));
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileResourceStore::new(&path).get("docs").await.unwrap_err();
        assert!(matches!(err, ExternalResourceError::Store(_)));
    }
}
