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

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use weft_entities::Entity;

use crate::backend::StorageBackend;
use crate::StorageError;

const ENTITY_MODULE_MARKER: &str = "weft_entities::entity";

/// Snapshot summary written at finalization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub sync_id: Uuid,
    pub source_short_name: String,
    pub entity_count: u64,
    pub file_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A streamed entity as captured, with the replay markers attached.
#[derive(Clone, Debug)]
pub struct CapturedEntity {
    pub entity: Entity,
    pub captured_at: OffsetDateTime,
    /// Storage key of the attached file, for file entities.
    pub stored_file: Option<String>,
}

impl CapturedEntity {
    pub fn to_json(&self) -> Result<JsonValue, StorageError> {
        let mut value = serde_json::to_value(&self.entity).map_err(|error| {
            StorageError::MalformedEntity {
                path: self.entity.entity_id().to_string(),
                message: error.to_string(),
            }
        })?;
        let object = value.as_object_mut().expect("entities serialize as objects");
        object.insert(
            "__entity_module__".to_string(),
            JsonValue::from(ENTITY_MODULE_MARKER),
        );
        object.insert(
            "__captured_at__".to_string(),
            JsonValue::from(self.captured_at.format(&Rfc3339).unwrap_or_default()),
        );
        if let Some(stored_file) = &self.stored_file {
            object.insert("__stored_file__".to_string(), JsonValue::from(stored_file.clone()));
        }
        Ok(value)
    }

    pub fn from_json(path: &str, mut value: JsonValue) -> Result<Self, StorageError> {
        let malformed = |message: String| StorageError::MalformedEntity {
            path: path.to_string(),
            message,
        };
        let object = value
            .as_object_mut()
            .ok_or_else(|| malformed("captured entity is not an object".to_string()))?;
        object
            .remove("__entity_module__")
            .ok_or_else(|| malformed("missing __entity_module__".to_string()))?;
        let captured_at = object
            .remove("__captured_at__")
            .and_then(|value| value.as_str().map(str::to_string))
            .and_then(|raw| OffsetDateTime::parse(&raw, &Rfc3339).ok())
            .ok_or_else(|| malformed("missing or invalid __captured_at__".to_string()))?;
        let stored_file = object
            .remove("__stored_file__")
            .and_then(|value| value.as_str().map(str::to_string));
        // `__entity_class__` stays in place: it is the serde tag of `Entity`.
        let entity: Entity = serde_json::from_value(value)
            .map_err(|error| malformed(format!("cannot reconstruct entity: {error}")))?;
        Ok(Self {
            entity,
            captured_at,
            stored_file,
        })
    }
}

/// Reads and writes the `raw/{sync_id}/…` snapshot layout.
#[derive(Clone)]
pub struct SnapshotStore {
    backend: Arc<dyn StorageBackend>,
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn entity_key(sync_id: Uuid, entity_id: &str) -> String {
        format!("raw/{sync_id}/entities/{}.json", sanitize(entity_id))
    }

    fn file_key(sync_id: Uuid, entity_id: &str, file_name: &str) -> String {
        format!(
            "raw/{sync_id}/files/{}_{}",
            sanitize(entity_id),
            sanitize(file_name)
        )
    }

    fn manifest_key(sync_id: Uuid) -> String {
        format!("raw/{sync_id}/manifest.json")
    }

    pub async fn write_entity(
        &self,
        sync_id: Uuid,
        captured: &CapturedEntity,
    ) -> Result<String, StorageError> {
        let key = Self::entity_key(sync_id, captured.entity.entity_id());
        let json = captured.to_json()?;
        let bytes = serde_json::to_vec_pretty(&json).map_err(|error| {
            StorageError::MalformedEntity {
                path: key.clone(),
                message: error.to_string(),
            }
        })?;
        self.backend.put(&key, bytes).await?;
        Ok(key)
    }

    /// Stores a file attachment and returns its storage key, to be recorded
    /// as `__stored_file__` on the owning entity.
    pub async fn write_file(
        &self,
        sync_id: Uuid,
        entity_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StorageError> {
        let key = Self::file_key(sync_id, entity_id, file_name);
        self.backend.put(&key, bytes).await?;
        Ok(key)
    }

    pub async fn write_manifest(&self, manifest: &SnapshotManifest) -> Result<(), StorageError> {
        let key = Self::manifest_key(manifest.sync_id);
        let bytes = serde_json::to_vec_pretty(manifest).map_err(|error| {
            StorageError::MalformedEntity {
                path: key.clone(),
                message: error.to_string(),
            }
        })?;
        self.backend.put(&key, bytes).await
    }

    pub async fn read_manifest(&self, sync_id: Uuid) -> Result<SnapshotManifest, StorageError> {
        let key = Self::manifest_key(sync_id);
        let bytes = self.backend.get(&key).await?;
        serde_json::from_slice(&bytes).map_err(|error| StorageError::MalformedEntity {
            path: key,
            message: error.to_string(),
        })
    }

    pub async fn list_entity_keys(&self, sync_id: Uuid) -> Result<Vec<String>, StorageError> {
        let keys = self
            .backend
            .list(&format!("raw/{sync_id}/entities"))
            .await?;
        Ok(keys
            .into_iter()
            .filter(|key| key.ends_with(".json"))
            .collect())
    }

    pub async fn read_entity(&self, key: &str) -> Result<CapturedEntity, StorageError> {
        let bytes = self.backend.get(key).await?;
        let value: JsonValue =
            serde_json::from_slice(&bytes).map_err(|error| StorageError::MalformedEntity {
                path: key.to_string(),
                message: error.to_string(),
            })?;
        CapturedEntity::from_json(key, value)
    }

    pub async fn read_file(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.backend.get(key).await
    }

    pub async fn snapshot_exists(&self, sync_id: Uuid) -> Result<bool, StorageError> {
        self.backend.exists(&Self::manifest_key(sync_id)).await
    }
}

/// Entity ids come from sources and may contain path separators.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use weft_entities::{ChunkEntity, ContentKind, EntityCommon, FileEntity};

    use super::*;
    use crate::backend::LocalStorageBackend;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(Arc::new(LocalStorageBackend::new(dir.path())));
        (dir, store)
    }

    fn captured(entity: Entity) -> CapturedEntity {
        CapturedEntity {
            entity,
            captured_at: time::macros::datetime!(2024-06-01 00:00:00 UTC),
            stored_file: None,
        }
    }

    #[tokio::test]
    async fn test_entity_round_trip_through_snapshot() {
        let (_dir, store) = store();
        let sync_id = Uuid::new_v4();
        let entity = Entity::Chunk(ChunkEntity {
            common: EntityCommon::new("E1", "note", "notion.page"),
            textual_representation: "hello".to_string(),
            content_kind: ContentKind::Prose,
        });
        let key = store.write_entity(sync_id, &captured(entity.clone())).await.unwrap();
        assert_eq!(key, format!("raw/{sync_id}/entities/E1.json"));

        let restored = store.read_entity(&key).await.unwrap();
        assert_eq!(restored.entity, entity);
        assert!(restored.stored_file.is_none());
    }

    #[tokio::test]
    async fn test_captured_json_carries_replay_markers() {
        let entity = Entity::Base {
            common: EntityCommon::new("E2", "thing", "test.thing"),
        };
        let mut record = captured(entity);
        record.stored_file = Some("raw/s/files/E2_data.bin".to_string());
        let json = record.to_json().unwrap();
        assert_eq!(json["__entity_class__"], "BaseEntity");
        assert_eq!(json["__entity_module__"], "weft_entities::entity");
        assert_eq!(json["__stored_file__"], "raw/s/files/E2_data.bin");
        assert!(json["__captured_at__"].as_str().unwrap().starts_with("2024-06-01"));
    }

    #[tokio::test]
    async fn test_file_attachment_round_trip() {
        let (_dir, store) = store();
        let sync_id = Uuid::new_v4();
        let key = store
            .write_file(sync_id, "F1", "report.pdf", b"pdfbytes".to_vec())
            .await
            .unwrap();
        assert_eq!(key, format!("raw/{sync_id}/files/F1_report.pdf"));
        assert_eq!(store.read_file(&key).await.unwrap(), b"pdfbytes");
    }

    #[tokio::test]
    async fn test_manifest_round_trip_and_existence() {
        let (_dir, store) = store();
        let sync_id = Uuid::new_v4();
        assert!(!store.snapshot_exists(sync_id).await.unwrap());
        let manifest = SnapshotManifest {
            sync_id,
            source_short_name: "slack".to_string(),
            entity_count: 3,
            file_count: 1,
            created_at: OffsetDateTime::now_utc(),
        };
        store.write_manifest(&manifest).await.unwrap();
        assert!(store.snapshot_exists(sync_id).await.unwrap());
        let back = store.read_manifest(sync_id).await.unwrap();
        assert_eq!(back.entity_count, 3);
        assert_eq!(back.source_short_name, "slack");
    }

    #[tokio::test]
    async fn test_entity_ids_with_separators_are_sanitized() {
        let (_dir, store) = store();
        let sync_id = Uuid::new_v4();
        let entity = Entity::File(FileEntity {
            common: EntityCommon::new("folder/doc", "doc", "drive.file"),
            download_url: "https://example.com/doc".to_string(),
            mime_type: None,
            local_path: None,
            total_size: None,
            should_skip: false,
        });
        let key = store.write_entity(sync_id, &captured(entity)).await.unwrap();
        assert_eq!(key, format!("raw/{sync_id}/entities/folder_doc.json"));
        let keys = store.list_entity_keys(sync_id).await.unwrap();
        assert_eq!(keys, vec![key]);
    }
}
