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

use async_trait::async_trait;
use tracing::debug;

use weft_common::retry::with_availability_retry;
use weft_destinations::{chunk_doc_id, ChunkDocument, Destination};
use weft_entities::{ActionBatch, Entity, ProcessedEntity};

use crate::context::SyncContext;
use crate::handlers::{ActionHandler, HandlerError};

/// Writes pre-chunked, embedded documents to vector destinations.
///
/// Updates delete the entity's previous documents before upserting, so a
/// shrinking chunk count leaves no stale tail chunks behind.
pub struct VectorHandler {
    destinations: Vec<Arc<dyn Destination>>,
}

impl VectorHandler {
    pub fn new(destinations: Vec<Arc<dyn Destination>>) -> Self {
        Self { destinations }
    }

    fn documents_for(processed: &ProcessedEntity, ctx: &SyncContext) -> Vec<ChunkDocument> {
        let entity = &processed.entity;
        let common = entity.common();
        let metadata = common.system_metadata.as_ref();
        processed
            .chunks
            .iter()
            .map(|chunk| ChunkDocument {
                doc_id: chunk_doc_id(ctx.sync_id(), &common.entity_id, chunk.index),
                sync_id: ctx.sync_id(),
                collection_id: ctx.collection_id(),
                original_entity_id: common.entity_id.clone(),
                chunk_index: chunk.index,
                name: common.name.clone(),
                entity_type: common.entity_type.clone(),
                source_name: ctx.source_name().to_string(),
                content_hash: metadata
                    .and_then(|metadata| metadata.content_hash.clone())
                    .unwrap_or_default(),
                text: chunk.text.clone(),
                dense_embedding: chunk.dense_embedding.clone(),
                sparse_embedding: chunk.sparse_embedding.clone(),
                breadcrumbs: common.breadcrumbs.clone(),
                access: metadata.and_then(|metadata| metadata.access.clone()),
            })
            .collect()
    }

    fn wrap(&self, source: weft_destinations::DestinationError) -> HandlerError {
        HandlerError::Destination {
            handler: self.name(),
            source,
        }
    }
}

#[async_trait]
impl ActionHandler for VectorHandler {
    fn name(&self) -> String {
        let names: Vec<String> = self
            .destinations
            .iter()
            .map(|destination| destination.name())
            .collect();
        format!("vector[{}]", names.join(","))
    }

    async fn handle_batch(
        &self,
        batch: &ActionBatch,
        ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        if self.destinations.is_empty() || !batch.has_mutations() {
            return Ok(());
        }

        let mut upsert_documents: Vec<ChunkDocument> = Vec::new();
        for processed in batch.inserts() {
            upsert_documents.extend(Self::documents_for(processed, ctx));
        }
        let update_documents: Vec<ChunkDocument> = batch
            .updates()
            .flat_map(|processed| Self::documents_for(processed, ctx))
            .collect();
        let updated_entity_ids: Vec<String> = batch
            .updates()
            .map(|processed| processed.entity.entity_id().to_string())
            .collect();
        let deleted_entity_ids: Vec<String> =
            batch.deletes().map(str::to_string).collect();

        for destination in &self.destinations {
            if !updated_entity_ids.is_empty() {
                with_availability_retry("vector_update_clear", || {
                    destination.bulk_delete_by_entity_ids(&updated_entity_ids, ctx.sync_id())
                })
                .await
                .map_err(|error| self.wrap(error))?;
            }
            if !deleted_entity_ids.is_empty() {
                with_availability_retry("vector_delete", || {
                    destination.bulk_delete_by_entity_ids(&deleted_entity_ids, ctx.sync_id())
                })
                .await
                .map_err(|error| self.wrap(error))?;
            }
            let all_documents: Vec<ChunkDocument> = upsert_documents
                .iter()
                .chain(update_documents.iter())
                .cloned()
                .collect();
            if !all_documents.is_empty() {
                debug!(
                    handler = %self.name(),
                    num_documents = all_documents.len(),
                    "vector-upsert"
                );
                with_availability_retry("vector_upsert", || destination.bulk_upsert(&all_documents))
                    .await
                    .map_err(|error| self.wrap(error))?;
            }
        }
        Ok(())
    }

    async fn handle_orphan_cleanup(
        &self,
        orphan_entity_ids: &[String],
        ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        if orphan_entity_ids.is_empty() {
            return Ok(());
        }
        for destination in &self.destinations {
            with_availability_retry("vector_orphan_cleanup", || {
                destination.bulk_delete_by_entity_ids(orphan_entity_ids, ctx.sync_id())
            })
            .await
            .map_err(|error| self.wrap(error))?;
        }
        Ok(())
    }
}

/// Forwards raw entities to destinations that chunk and embed internally.
pub struct SelfProcessingHandler {
    destinations: Vec<Arc<dyn Destination>>,
}

impl SelfProcessingHandler {
    pub fn new(destinations: Vec<Arc<dyn Destination>>) -> Self {
        Self { destinations }
    }

    fn wrap(&self, source: weft_destinations::DestinationError) -> HandlerError {
        HandlerError::Destination {
            handler: self.name(),
            source,
        }
    }
}

#[async_trait]
impl ActionHandler for SelfProcessingHandler {
    fn name(&self) -> String {
        let names: Vec<String> = self
            .destinations
            .iter()
            .map(|destination| destination.name())
            .collect();
        format!("self_processing[{}]", names.join(","))
    }

    async fn handle_batch(
        &self,
        batch: &ActionBatch,
        ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        if self.destinations.is_empty() || !batch.has_mutations() {
            return Ok(());
        }
        let inserts: Vec<Entity> = batch
            .inserts()
            .map(|processed| processed.entity.clone())
            .collect();
        let updates: Vec<Entity> = batch
            .updates()
            .map(|processed| processed.entity.clone())
            .collect();
        let updated_entity_ids: Vec<String> = updates
            .iter()
            .map(|entity| entity.entity_id().to_string())
            .collect();
        let deleted_entity_ids: Vec<String> =
            batch.deletes().map(str::to_string).collect();

        for destination in &self.destinations {
            if !updated_entity_ids.is_empty() {
                with_availability_retry("raw_update_clear", || {
                    destination.bulk_delete_by_entity_ids(&updated_entity_ids, ctx.sync_id())
                })
                .await
                .map_err(|error| self.wrap(error))?;
            }
            if !deleted_entity_ids.is_empty() {
                with_availability_retry("raw_delete", || {
                    destination.bulk_delete_by_entity_ids(&deleted_entity_ids, ctx.sync_id())
                })
                .await
                .map_err(|error| self.wrap(error))?;
            }
            let all_entities: Vec<Entity> =
                inserts.iter().chain(updates.iter()).cloned().collect();
            if !all_entities.is_empty() {
                with_availability_retry("raw_insert", || {
                    destination.bulk_insert_raw(ctx.sync_id(), ctx.collection_id(), &all_entities)
                })
                .await
                .map_err(|error| self.wrap(error))?;
            }
        }
        Ok(())
    }

    async fn handle_orphan_cleanup(
        &self,
        orphan_entity_ids: &[String],
        ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        if orphan_entity_ids.is_empty() {
            return Ok(());
        }
        for destination in &self.destinations {
            with_availability_retry("raw_orphan_cleanup", || {
                destination.bulk_delete_by_entity_ids(orphan_entity_ids, ctx.sync_id())
            })
            .await
            .map_err(|error| self.wrap(error))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use weft_config::{SourceConnectionConfig, SyncExecutionConfig};
    use weft_destinations::{DestinationError, MockDestination};
    use weft_entities::{ChunkEntity, ContentKind, EmbeddedChunk, EntityAction, EntityCommon};
    use weft_metastore::{InMemoryMetastore, Sync, SyncJob};

    fn test_ctx() -> SyncContext {
        let source_connection = SourceConnectionConfig::new("slack", Uuid::new_v4());
        let sync = Sync::new("s", source_connection.id, source_connection.collection_id);
        let job = SyncJob::new(sync.id);
        SyncContext::new(
            sync,
            job,
            source_connection,
            SyncExecutionConfig::default(),
            false,
            true,
            Arc::new(InMemoryMetastore::new()),
            CancellationToken::new(),
        )
    }

    fn processed(entity_id: &str) -> ProcessedEntity {
        ProcessedEntity {
            entity: Entity::Chunk(ChunkEntity {
                common: EntityCommon::new(entity_id, entity_id, "slack.message"),
                textual_representation: "hello".to_string(),
                content_kind: ContentKind::Prose,
            }),
            chunks: vec![EmbeddedChunk {
                index: 0,
                text: "hello".to_string(),
                token_count: 1,
                dense_embedding: Some(vec![0.0, 1.0]),
                sparse_embedding: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_insert_upserts_documents_with_deterministic_ids() {
        let ctx = test_ctx();
        let sync_id = ctx.sync_id();
        let mut destination = MockDestination::new();
        destination.expect_name().return_const("mock".to_string());
        destination
            .expect_bulk_upsert()
            .withf(move |documents: &[ChunkDocument]| {
                documents.len() == 1
                    && documents[0].doc_id == chunk_doc_id(sync_id, "E1", 0)
                    && documents[0].original_entity_id == "E1"
            })
            .times(1)
            .returning(|_| Ok(()));

        let handler = VectorHandler::new(vec![Arc::new(destination)]);
        let mut batch = ActionBatch::new();
        batch.push(EntityAction::Insert(processed("E1"))).unwrap();
        handler.handle_batch(&batch, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_clears_before_upserting() {
        let ctx = test_ctx();
        let mut destination = MockDestination::new();
        destination.expect_name().return_const("mock".to_string());
        let mut sequence = mockall::Sequence::new();
        destination
            .expect_bulk_delete_by_entity_ids()
            .withf(|entity_ids: &[String], _| entity_ids == ["E1".to_string()])
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));
        destination
            .expect_bulk_upsert()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));

        let handler = VectorHandler::new(vec![Arc::new(destination)]);
        let mut batch = ActionBatch::new();
        batch.push(EntityAction::Update(processed("E1"))).unwrap();
        handler.handle_batch(&batch, &ctx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_destination_is_retried_then_succeeds() {
        let ctx = test_ctx();
        let mut destination = MockDestination::new();
        destination.expect_name().return_const("mock".to_string());
        let mut attempts = 0;
        destination
            .expect_bulk_upsert()
            .times(3)
            .returning(move |_| {
                attempts += 1;
                if attempts < 3 {
                    Err(DestinationError::Unavailable("connection refused".to_string()))
                } else {
                    Ok(())
                }
            });

        let handler = VectorHandler::new(vec![Arc::new(destination)]);
        let mut batch = ActionBatch::new();
        batch.push(EntityAction::Insert(processed("E1"))).unwrap();
        handler.handle_batch(&batch, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_destination_error_fails_fast() {
        let ctx = test_ctx();
        let mut destination = MockDestination::new();
        destination.expect_name().return_const("mock".to_string());
        destination.expect_bulk_upsert().times(1).returning(|_| {
            Err(DestinationError::Permanent {
                status: Some(400),
                message: "schema mismatch".to_string(),
            })
        });

        let handler = VectorHandler::new(vec![Arc::new(destination)]);
        let mut batch = ActionBatch::new();
        batch.push(EntityAction::Insert(processed("E1"))).unwrap();
        let error = handler.handle_batch(&batch, &ctx).await.unwrap_err();
        assert!(matches!(error, HandlerError::Destination { .. }));
    }

    #[tokio::test]
    async fn test_skip_only_batch_touches_nothing() {
        let ctx = test_ctx();
        let mut destination = MockDestination::new();
        destination.expect_name().return_const("mock".to_string());
        destination.expect_bulk_upsert().times(0);
        destination.expect_bulk_delete_by_entity_ids().times(0);

        let handler = VectorHandler::new(vec![Arc::new(destination)]);
        let mut batch = ActionBatch::new();
        batch
            .push(EntityAction::Skip { entity_id: "E1".to_string() })
            .unwrap();
        handler.handle_batch(&batch, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_self_processing_forwards_raw_entities() {
        let ctx = test_ctx();
        let mut destination = MockDestination::new();
        destination.expect_name().return_const("vespa".to_string());
        destination
            .expect_bulk_insert_raw()
            .withf(|_, _, entities: &[Entity]| entities.len() == 1 && entities[0].entity_id() == "E1")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let handler = SelfProcessingHandler::new(vec![Arc::new(destination)]);
        let mut batch = ActionBatch::new();
        batch.push(EntityAction::Insert(processed("E1"))).unwrap();
        handler.handle_batch(&batch, &ctx).await.unwrap();
    }
}
