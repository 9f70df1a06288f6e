//! Blob storage: input payloads in, classification records out.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;

/// Backend-agnostic container/key object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read an object. Missing objects yield [`StorageError::NotFound`].
    async fn read(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write an object. With `overwrite == false` an existing object is an
    /// [`StorageError::AlreadyExists`] error.
    async fn write(
        &self,
        container: &str,
        key: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<(), StorageError>;

    /// Replace `final_key` with the content of `temp_key`.
    async fn promote(
        &self,
        container: &str,
        temp_key: &str,
        final_key: &str,
    ) -> Result<(), StorageError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError>;

    /// Keys in a container, sorted.
    async fn list(&self, container: &str) -> Result<Vec<String>, StorageError>;
}

/// Marker embedded in temporary keys written by [`publish_json`].
pub const TEMP_MARKER: &str = ".tmp-";

/// True for keys left behind by an interrupted [`publish_json`].
pub fn is_temp_key(key: &str) -> bool {
    key.contains(TEMP_MARKER)
}

/// Serialize `value` and publish it under `key` without exposing a partial
/// object: write to a unique temp key, promote, then remove the temp key.
///
/// Temp cleanup is best effort; a failure there is logged, not returned.
pub async fn publish_json<T>(
    store: &dyn BlobStore,
    container: &str,
    key: &str,
    value: &T,
) -> Result<(), StorageError>
where
    T: Serialize + ?Sized + Sync,
{
    let data = serde_json::to_vec(value)?;
    let temp_key = format!("{key}{TEMP_MARKER}{}", Uuid::new_v4().simple());

    store.write(container, &temp_key, &data, true).await?;
    let promoted = store.promote(container, &temp_key, key).await;

    if let Err(e) = store.delete(container, &temp_key).await {
        warn!(container, key = %temp_key, error = %e, "Failed to delete temporary blob");
    }

    promoted?;
    debug!(container, key, bytes = data.len(), "Published blob");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_twice_leaves_one_object() {
        let store = MemoryBlobStore::new();
        publish_json(&store, "out", "c-1.json", &json!({"v": 1}))
            .await
            .unwrap();
        publish_json(&store, "out", "c-1.json", &json!({"v": 2}))
            .await
            .unwrap();

        assert_eq!(store.list("out").await.unwrap(), vec!["c-1.json"]);
        let raw = store.read("out", "c-1.json").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["v"], 2);
    }

    #[tokio::test]
    async fn fs_publish_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        publish_json(&store, "out", "c-2.json", &json!({"ok": true}))
            .await
            .unwrap();
        publish_json(&store, "out", "c-2.json", &json!({"ok": false}))
            .await
            .unwrap();

        let keys = store.list("out").await.unwrap();
        assert_eq!(keys, vec!["c-2.json"]);
        assert!(!keys.iter().any(|k| is_temp_key(k)));
        let raw = store.read("out", "c-2.json").await.unwrap();
        assert_eq!(raw, br#"{"ok":false}"#);
    }

    #[test]
    fn temp_key_detection() {
        assert!(is_temp_key("c-1.json.tmp-0a1b2c"));
        assert!(!is_temp_key("c-1.json"));
    }
}
