//! Directory-backed blob store. Containers are subdirectories of the root.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::BlobStore;
use crate::error::StorageError;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `container/key`, rejecting anything that escapes the root.
    fn resolve(&self, container: &str, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(container).join(key);
        let safe = !container.is_empty()
            && !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(backend(container, key, "invalid container or key"));
        }
        Ok(self.root.join(relative))
    }
}

fn backend(container: &str, key: &str, reason: impl ToString) -> StorageError {
    StorageError::Backend {
        container: container.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn map_io(container: &str, key: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound {
            container: container.to_string(),
            key: key.to_string(),
        },
        ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            container: container.to_string(),
            key: key.to_string(),
        },
        _ => backend(container, key, err),
    }
}

async fn ensure_parent(path: &Path, container: &str, key: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| backend(container, key, e))?;
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(container, key)?;
        fs::read(&path).await.map_err(|e| map_io(container, key, e))
    }

    async fn write(
        &self,
        container: &str,
        key: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let path = self.resolve(container, key)?;
        ensure_parent(&path, container, key).await?;

        if overwrite {
            return fs::write(&path, data)
                .await
                .map_err(|e| map_io(container, key, e));
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| map_io(container, key, e))?;
        file.write_all(data)
            .await
            .map_err(|e| backend(container, key, e))?;
        file.flush().await.map_err(|e| backend(container, key, e))
    }

    async fn promote(
        &self,
        container: &str,
        temp_key: &str,
        final_key: &str,
    ) -> Result<(), StorageError> {
        let from = self.resolve(container, temp_key)?;
        let to = self.resolve(container, final_key)?;
        ensure_parent(&to, container, final_key).await?;
        // rename replaces the destination atomically on the same filesystem
        fs::rename(&from, &to)
            .await
            .map_err(|e| map_io(container, temp_key, e))
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(container, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(backend(container, key, e)),
        }
    }

    async fn list(&self, container: &str) -> Result<Vec<String>, StorageError> {
        let base = self.root.join(container);
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(backend(container, "", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| backend(container, "", e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| backend(container, "", e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let key: Vec<_> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.read("incoming", "nope.json").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn write_without_overwrite_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.write("c", "a.json", b"1", false).await.unwrap();
        let err = store.write("c", "a.json", b"2", false).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        store.write("c", "a.json", b"3", true).await.unwrap();
        assert_eq!(store.read("c", "a.json").await.unwrap(), b"3");
    }

    #[tokio::test]
    async fn list_nested_and_missing_containers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.list("empty").await.unwrap().is_empty());

        store.write("c", "b.json", b"{}", true).await.unwrap();
        store.write("c", "2024/a.json", b"{}", true).await.unwrap();
        assert_eq!(store.list("c").await.unwrap(), vec!["2024/a.json", "b.json"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.write("c", "x", b"1", true).await.unwrap();
        store.delete("c", "x").await.unwrap();
        store.delete("c", "x").await.unwrap();
        assert!(store.list("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.read("c", "../secret").await.unwrap_err();
        assert!(matches!(err, StorageError::Backend { .. }));
    }
}
