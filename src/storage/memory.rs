//! In-process blob store for tests and local runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::BlobStore;
use crate::error::StorageError;

type Key = (String, String);

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<Key, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects across all containers.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

fn key(container: &str, key: &str) -> Key {
    (container.to_string(), key.to_string())
}

fn not_found(container: &str, key: &str) -> StorageError {
    StorageError::NotFound {
        container: container.to_string(),
        key: key.to_string(),
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, container: &str, k: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(&key(container, k))
            .cloned()
            .ok_or_else(|| not_found(container, k))
    }

    async fn write(
        &self,
        container: &str,
        k: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        let id = key(container, k);
        if !overwrite && objects.contains_key(&id) {
            return Err(StorageError::AlreadyExists {
                container: container.to_string(),
                key: k.to_string(),
            });
        }
        objects.insert(id, data.to_vec());
        Ok(())
    }

    async fn promote(
        &self,
        container: &str,
        temp_key: &str,
        final_key: &str,
    ) -> Result<(), StorageError> {
        // Copy, not move: the caller removes the temp key afterwards.
        let mut objects = self.objects.write().await;
        let data = objects
            .get(&key(container, temp_key))
            .cloned()
            .ok_or_else(|| not_found(container, temp_key))?;
        objects.insert(key(container, final_key), data);
        Ok(())
    }

    async fn delete(&self, container: &str, k: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(&key(container, k));
        Ok(())
    }

    async fn list(&self, container: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, k)| k.clone())
            .collect())
    }
}
