// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::StorageError;

/// Byte-level storage under string keys with `/` separators.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Writes `bytes` at `key` atomically, creating parent directories.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Keys under `prefix`, sorted for deterministic replay order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Local-filesystem backend rooted at a directory.
pub struct LocalStorageBackend {
    root: PathBuf,
}

impl LocalStorageBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for component in key.split('/').filter(|component| !component.is_empty()) {
            path.push(component);
        }
        path
    }

    fn io_error(path: &Path, error: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.resolve(key);
        tokio::task::spawn_blocking(move || {
            let parent = path
                .parent()
                .ok_or_else(|| StorageError::Io {
                    path: path.display().to_string(),
                    message: "key has no parent directory".to_string(),
                })?
                .to_path_buf();
            std::fs::create_dir_all(&parent).map_err(|error| Self::io_error(&parent, error))?;
            // Stage into a temp file in the same directory so the final
            // rename is atomic on the same filesystem.
            let staged = tempfile::NamedTempFile::new_in(&parent)
                .map_err(|error| Self::io_error(&parent, error))?;
            std::fs::write(staged.path(), &bytes)
                .map_err(|error| Self::io_error(staged.path(), error))?;
            staged
                .persist(&path)
                .map_err(|error| Self::io_error(&path, error.error))?;
            Ok(())
        })
        .await
        .map_err(|join_error| StorageError::Io {
            path: key.to_string(),
            message: format!("storage task aborted: {join_error}"),
        })?
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key))
            }
            Err(error) => Err(Self::io_error(&path, error)),
        })
        .await
        .map_err(|join_error| StorageError::Io {
            path: String::new(),
            message: format!("storage task aborted: {join_error}"),
        })?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(prefix);
        let prefix = prefix.trim_end_matches('/').to_string();
        tokio::task::spawn_blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Vec::new())
                }
                Err(error) => return Err(Self::io_error(&dir, error)),
            };
            let mut keys = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|error| Self::io_error(&dir, error))?;
                if entry.path().is_file() {
                    keys.push(format!(
                        "{prefix}/{}",
                        entry.file_name().to_string_lossy()
                    ));
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|join_error| StorageError::Io {
            path: String::new(),
            message: format!("storage task aborted: {join_error}"),
        })?
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key);
        Ok(tokio::task::spawn_blocking(move || path.is_file())
            .await
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalStorageBackend::new(dir.path());
        backend
            .put("raw/abc/entities/e1.json", b"{\"x\":1}".to_vec())
            .await
            .unwrap();
        let bytes = backend.get("raw/abc/entities/e1.json").await.unwrap();
        assert_eq!(bytes, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalStorageBackend::new(dir.path());
        let error = backend.get("raw/missing.json").await.unwrap_err();
        assert!(matches!(error, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_returns_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalStorageBackend::new(dir.path());
        backend.put("raw/s/entities/b.json", vec![1]).await.unwrap();
        backend.put("raw/s/entities/a.json", vec![2]).await.unwrap();
        let keys = backend.list("raw/s/entities").await.unwrap();
        assert_eq!(keys, vec!["raw/s/entities/a.json", "raw/s/entities/b.json"]);
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalStorageBackend::new(dir.path());
        assert!(backend.list("raw/nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalStorageBackend::new(dir.path());
        backend.put("raw/s/manifest.json", b"v1".to_vec()).await.unwrap();
        backend.put("raw/s/manifest.json", b"v2".to_vec()).await.unwrap();
        assert_eq!(backend.get("raw/s/manifest.json").await.unwrap(), b"v2");
    }
}
