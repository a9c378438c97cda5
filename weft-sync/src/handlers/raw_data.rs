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

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{info, warn};

use weft_common::retry::with_availability_retry;
use weft_entities::{ActionBatch, Entity};
use weft_storage::{CapturedEntity, SnapshotManifest, SnapshotStore};

use crate::context::SyncContext;
use crate::handlers::{ActionHandler, HandlerError};

/// Captures every streamed entity (and attached file) into the
/// `raw/{sync_id}/…` snapshot layout. The snapshot records the stream as it
/// was, so deletes and orphan cleanup do not touch it; `finalize` publishes
/// the manifest.
pub struct SnapshotHandler {
    store: SnapshotStore,
    entity_count: AtomicU64,
    file_count: AtomicU64,
}

impl SnapshotHandler {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            entity_count: AtomicU64::new(0),
            file_count: AtomicU64::new(0),
        }
    }

    fn wrap(&self, source: weft_storage::StorageError) -> HandlerError {
        HandlerError::Storage {
            handler: self.name(),
            source,
        }
    }

    async fn capture(&self, entity: &Entity, ctx: &SyncContext) -> Result<(), HandlerError> {
        let mut stored_file = None;
        if let Entity::File(file) = entity {
            if let Some(local_path) = &file.local_path {
                match tokio::fs::read(local_path).await {
                    Ok(bytes) => {
                        let key = with_availability_retry("snapshot_write_file", || {
                            self.store.write_file(
                                ctx.sync_id(),
                                &file.common.entity_id,
                                &file.common.name,
                                bytes.clone(),
                            )
                        })
                        .await
                        .map_err(|error| self.wrap(error))?;
                        self.file_count.fetch_add(1, Ordering::Relaxed);
                        stored_file = Some(key);
                    }
                    Err(error) => {
                        warn!(
                            entity_id = %file.common.entity_id,
                            %error,
                            "cannot read local file for snapshot"
                        );
                    }
                }
            }
        }
        let captured = CapturedEntity {
            entity: entity.clone(),
            captured_at: OffsetDateTime::now_utc(),
            stored_file,
        };
        with_availability_retry("snapshot_write_entity", || {
            self.store.write_entity(ctx.sync_id(), &captured)
        })
        .await
        .map_err(|error| self.wrap(error))?;
        self.entity_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for SnapshotHandler {
    fn name(&self) -> String {
        "raw_data".to_string()
    }

    async fn handle_batch(
        &self,
        batch: &ActionBatch,
        ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        for processed in batch.inserts().chain(batch.updates()) {
            self.capture(&processed.entity, ctx).await?;
        }
        Ok(())
    }

    async fn handle_orphan_cleanup(
        &self,
        _orphan_entity_ids: &[String],
        _ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        // The snapshot is an append-only capture of the stream.
        Ok(())
    }

    async fn finalize(&self, ctx: &SyncContext) -> Result<(), HandlerError> {
        let manifest = SnapshotManifest {
            sync_id: ctx.sync_id(),
            source_short_name: ctx.source_name().to_string(),
            entity_count: self.entity_count.load(Ordering::Relaxed),
            file_count: self.file_count.load(Ordering::Relaxed),
            created_at: OffsetDateTime::now_utc(),
        };
        info!(
            sync_id = %ctx.sync_id(),
            entity_count = manifest.entity_count,
            file_count = manifest.file_count,
            "snapshot-manifest-written"
        );
        with_availability_retry("snapshot_write_manifest", || {
            self.store.write_manifest(&manifest)
        })
        .await
        .map_err(|error| self.wrap(error))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use weft_config::{SourceConnectionConfig, SyncExecutionConfig};
    use weft_entities::{ChunkEntity, ContentKind, EntityAction, EntityCommon, ProcessedEntity};
    use weft_metastore::{InMemoryMetastore, Sync, SyncJob};
    use weft_storage::LocalStorageBackend;

    fn test_ctx() -> SyncContext {
        let source_connection = SourceConnectionConfig::new("slack", Uuid::new_v4());
        let sync = Sync::new("s", source_connection.id, source_connection.collection_id);
        let job = SyncJob::new(sync.id);
        SyncContext::new(
            sync,
            job,
            source_connection,
            SyncExecutionConfig::capture_only(),
            false,
            true,
            Arc::new(InMemoryMetastore::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_capture_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(Arc::new(LocalStorageBackend::new(dir.path())));
        let handler = SnapshotHandler::new(store.clone());
        let ctx = test_ctx();

        let mut batch = ActionBatch::new();
        batch
            .push(EntityAction::Insert(ProcessedEntity {
                entity: Entity::Chunk(ChunkEntity {
                    common: EntityCommon::new("E1", "note", "slack.message"),
                    textual_representation: "hello".to_string(),
                    content_kind: ContentKind::Prose,
                }),
                chunks: Vec::new(),
            }))
            .unwrap();
        handler.handle_batch(&batch, &ctx).await.unwrap();
        handler.finalize(&ctx).await.unwrap();

        let manifest = store.read_manifest(ctx.sync_id()).await.unwrap();
        assert_eq!(manifest.entity_count, 1);
        assert_eq!(manifest.file_count, 0);
        assert_eq!(manifest.source_short_name, "slack");

        let keys = store.list_entity_keys(ctx.sync_id()).await.unwrap();
        assert_eq!(keys.len(), 1);
        let captured = store.read_entity(&keys[0]).await.unwrap();
        assert_eq!(captured.entity.entity_id(), "E1");
    }
}
