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

//! Builds everything a sync run needs: context, source, pipeline, pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use weft_common::worker_pool::WorkerPool;
use weft_config::{DestinationStrategy, SyncExecutionConfig};
use weft_destinations::{Destination, ProcessingRequirement};
use weft_inference::{DenseEmbedder, HashedSparseEmbedder, SparseEmbedder};
use weft_metastore::{Metastore, MetastoreError, SlotRole, SyncJob};
use weft_storage::SnapshotStore;

use crate::context::SyncContext;
use crate::cursor::SyncCursorService;
use crate::handlers::{ActionHandler, MembershipHandler, SelfProcessingHandler, SnapshotHandler, VectorHandler};
use crate::pipeline::{EntityPipeline, FileProcessor, TextChunker};
use crate::source::{ReplaySource, Source, SourceLoader, SourceRuntimeArgs};
use crate::SyncError;

/// Cursor staleness bound; sources with shorter-lived tokens override the
/// check themselves.
const CURSOR_MAX_AGE_DAYS: i64 = 55;

/// Interval for forced full-cleanup syncs on continuous sources.
const PERIODIC_FULL_SYNC_DAYS: i64 = 30;

/// A fully wired sync run, ready for the orchestrator.
pub struct PreparedSync {
    pub context: Arc<SyncContext>,
    pub source: Box<dyn Source>,
    pub pipeline: Arc<EntityPipeline>,
    pub worker_pool: WorkerPool,
    pub cursor_service: SyncCursorService,
}

pub struct SyncFactory {
    metastore: Arc<dyn Metastore>,
    loader: Arc<SourceLoader>,
    destinations: HashMap<Uuid, Arc<dyn Destination>>,
    snapshot_store: Option<SnapshotStore>,
    dense_embedder: Option<Arc<dyn DenseEmbedder>>,
    sparse_embedder: Arc<dyn SparseEmbedder>,
}

impl SyncFactory {
    pub fn metastore(&self) -> &Arc<dyn Metastore> {
        &self.metastore
    }

    pub fn new(metastore: Arc<dyn Metastore>, loader: Arc<SourceLoader>) -> Self {
        Self {
            metastore,
            loader,
            destinations: HashMap::new(),
            snapshot_store: None,
            dense_embedder: None,
            sparse_embedder: Arc::new(HashedSparseEmbedder::new()),
        }
    }

    /// Registers the destination instance backing a destination connection.
    pub fn with_destination(
        mut self,
        connection_id: Uuid,
        destination: Arc<dyn Destination>,
    ) -> Self {
        self.destinations.insert(connection_id, destination);
        self
    }

    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn with_dense_embedder(mut self, embedder: Arc<dyn DenseEmbedder>) -> Self {
        self.dense_embedder = Some(embedder);
        self
    }

    pub fn with_sparse_embedder(mut self, embedder: Arc<dyn SparseEmbedder>) -> Self {
        self.sparse_embedder = embedder;
        self
    }

    /// Resolves the sync, its source connection and destinations, loads the
    /// cursor under the execution-config rules, and wires the pipeline.
    pub async fn prepare(
        &self,
        job: SyncJob,
        execution_config: SyncExecutionConfig,
        force_full_sync: bool,
        cancel: CancellationToken,
    ) -> Result<PreparedSync, SyncError> {
        execution_config.validate()?;
        let sync = self.metastore.sync(job.sync_id).await?;
        let source_connection = match self
            .metastore
            .source_connection(sync.source_connection_id)
            .await
        {
            Ok(source_connection) => source_connection,
            Err(MetastoreError::NotFound(_)) => {
                // The connection was deleted while the job sat in the queue:
                // the orchestrator self-destructs instead of failing.
                return Err(SyncError::OrphanedSourceConnection(sync.source_connection_id));
            }
            Err(error) => return Err(error.into()),
        };

        let selected_destinations = self.select_destinations(&sync, &execution_config)?;

        let cursor_service = SyncCursorService::new(self.metastore.clone());
        let mut cursor = cursor_service
            .load_for_run(sync.id, &execution_config, force_full_sync)
            .await;
        let mut force_full_sync = force_full_sync;

        let mut source: Box<dyn Source> =
            if execution_config.replay_target_destination_id.is_some() {
                let store = self.snapshot_store.clone().ok_or_else(|| {
                    SyncError::Config(weft_config::ConfigError::Invalid(
                        "replay requested but no snapshot store configured".to_string(),
                    ))
                })?;
                Box::new(ReplaySource::new(sync.id, store))
            } else {
                self.loader
                    .load(SourceRuntimeArgs {
                        source_connection: source_connection.clone(),
                        cursor: cursor.clone(),
                        force_full_sync,
                        snapshot_store: self.snapshot_store.clone(),
                    })
                    .await?
            };

        // Source-defined staleness: an expired cursor (or a due periodic
        // cleanup) turns this run into a full sync.
        if let Some(cursor_data) = cursor.cursor_data.clone() {
            if source.cursor_is_expired(&cursor_data, CURSOR_MAX_AGE_DAYS) {
                info!(sync_id = %sync.id, "cursor expired, forcing full sync");
                cursor = crate::cursor::SyncCursor::empty();
                force_full_sync = true;
                source = self.rebuild_source(&execution_config, &source_connection, force_full_sync).await?;
            } else if source.needs_periodic_full_sync(&cursor_data, PERIODIC_FULL_SYNC_DAYS) {
                info!(sync_id = %sync.id, "periodic full sync due");
                cursor = crate::cursor::SyncCursor::empty();
                force_full_sync = true;
                source = self.rebuild_source(&execution_config, &source_connection, force_full_sync).await?;
            }
        }

        // A run covers the full universe when it starts without a cursor or
        // when the source cannot sync incrementally at all.
        let full_pass = cursor.is_empty() || !source.capabilities().supports_continuous;
        let context = Arc::new(SyncContext::new(
            sync,
            job,
            source_connection,
            execution_config.clone(),
            force_full_sync,
            full_pass,
            self.metastore.clone(),
            cancel,
        ));

        let handlers = self.build_handlers(&execution_config, &selected_destinations)?;
        let needs_embeddings = execution_config.enable_vector_handlers
            && selected_destinations
                .iter()
                .any(|destination| destination.processing() == ProcessingRequirement::Chunks);
        let scratch_dir = tempfile::Builder::new()
            .prefix("weft-sync-")
            .tempdir()
            .map_err(|error| {
                SyncError::Config(weft_config::ConfigError::Invalid(format!(
                    "cannot create scratch dir: {error}"
                )))
            })?
            .into_path();
        let pipeline = Arc::new(EntityPipeline::new(
            Arc::new(TextChunker::new()?),
            Arc::new(FileProcessor::new()),
            if needs_embeddings {
                self.dense_embedder.clone()
            } else {
                None
            },
            self.sparse_embedder.clone(),
            handlers,
            scratch_dir,
        ));

        Ok(PreparedSync {
            context,
            source,
            pipeline,
            worker_pool: WorkerPool::new(execution_config.max_workers),
            cursor_service,
        })
    }

    /// Rebuilds the source with an empty cursor. Only reachable for live
    /// sources: replay runs load no cursor, so they never hit the expiry
    /// path.
    async fn rebuild_source(
        &self,
        _execution_config: &SyncExecutionConfig,
        source_connection: &weft_config::SourceConnectionConfig,
        force_full_sync: bool,
    ) -> Result<Box<dyn Source>, SyncError> {
        self.loader
            .load(SourceRuntimeArgs {
                source_connection: source_connection.clone(),
                cursor: crate::cursor::SyncCursor::empty(),
                force_full_sync,
                snapshot_store: self.snapshot_store.clone(),
            })
            .await
    }

    fn select_destinations(
        &self,
        sync: &weft_metastore::Sync,
        execution_config: &SyncExecutionConfig,
    ) -> Result<Vec<Arc<dyn Destination>>, SyncError> {
        let selected_ids: Vec<Uuid> = if !execution_config.target_destinations.is_empty() {
            execution_config.target_destinations.clone()
        } else {
            sync.destination_slots()
                .filter(|slot| match (execution_config.destination_strategy, slot.role) {
                    (DestinationStrategy::All, _) => true,
                    (DestinationStrategy::ActiveOnly, Some(SlotRole::Active)) => true,
                    (DestinationStrategy::ShadowOnly, Some(SlotRole::Shadow)) => true,
                    (
                        DestinationStrategy::ActiveAndShadow,
                        Some(SlotRole::Active) | Some(SlotRole::Shadow),
                    ) => true,
                    _ => false,
                })
                .map(|slot| slot.connection_id)
                .collect()
        };
        selected_ids
            .into_iter()
            .filter(|connection_id| !execution_config.exclude_destinations.contains(connection_id))
            .map(|connection_id| {
                self.destinations.get(&connection_id).cloned().ok_or_else(|| {
                    SyncError::Config(weft_config::ConfigError::Invalid(format!(
                        "no destination registered for connection {connection_id}"
                    )))
                })
            })
            .collect()
    }

    fn build_handlers(
        &self,
        execution_config: &SyncExecutionConfig,
        destinations: &[Arc<dyn Destination>],
    ) -> Result<Vec<Arc<dyn ActionHandler>>, SyncError> {
        let mut handlers: Vec<Arc<dyn ActionHandler>> = Vec::new();
        if execution_config.enable_vector_handlers {
            let chunk_destinations: Vec<Arc<dyn Destination>> = destinations
                .iter()
                .filter(|destination| destination.processing() == ProcessingRequirement::Chunks)
                .cloned()
                .collect();
            if !chunk_destinations.is_empty() {
                handlers.push(Arc::new(VectorHandler::new(chunk_destinations)));
            }
            let raw_destinations: Vec<Arc<dyn Destination>> = destinations
                .iter()
                .filter(|destination| {
                    destination.processing() == ProcessingRequirement::RawEntities
                })
                .cloned()
                .collect();
            if !raw_destinations.is_empty() {
                handlers.push(Arc::new(SelfProcessingHandler::new(raw_destinations)));
            }
        }
        if execution_config.enable_raw_data_handler {
            if let Some(store) = &self.snapshot_store {
                handlers.push(Arc::new(SnapshotHandler::new(store.clone())));
            }
        }
        if execution_config.enable_access_control_handler {
            handlers.push(Arc::new(MembershipHandler::new()));
        }
        Ok(handlers)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};

    use super::*;
    use crate::source::{EntitySink, SourceCapabilities, SourceError, SourceFactory};
    use weft_config::SourceConnectionConfig;
    use weft_metastore::InMemoryMetastore;

    /// Continuous source whose change token is always expired.
    struct ExpiringTokenSource;

    #[async_trait]
    impl Source for ExpiringTokenSource {
        fn name(&self) -> String {
            "ExpiringTokenSource".to_string()
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                supports_continuous: true,
                federated_search: false,
            }
        }

        async fn produce(&mut self, _sink: &EntitySink) -> Result<(), SourceError> {
            Ok(())
        }

        fn cursor_is_expired(&self, _cursor_data: &JsonValue, _max_age_days: i64) -> bool {
            true
        }
    }

    struct ExpiringTokenFactory;

    #[async_trait]
    impl SourceFactory for ExpiringTokenFactory {
        fn short_name(&self) -> &'static str {
            "expiring"
        }

        async fn create(&self, _runtime: SourceRuntimeArgs) -> Result<Box<dyn Source>, SyncError> {
            Ok(Box::new(ExpiringTokenSource))
        }
    }

    #[tokio::test]
    async fn test_expired_cursor_forces_a_full_sync() {
        let metastore = Arc::new(InMemoryMetastore::new());
        let source_connection = SourceConnectionConfig::new("expiring", Uuid::new_v4());
        let sync = weft_metastore::Sync::new(
            "s",
            source_connection.id,
            source_connection.collection_id,
        );
        metastore
            .create_source_connection(source_connection)
            .await
            .unwrap();
        metastore.create_sync(sync.clone()).await.unwrap();
        metastore
            .upsert_cursor(
                sync.id,
                Some("change_token".to_string()),
                json!({"change_token": "stale"}),
            )
            .await
            .unwrap();

        let mut loader = SourceLoader::new();
        loader.add_source(Arc::new(ExpiringTokenFactory));
        let factory = SyncFactory::new(metastore.clone(), Arc::new(loader));

        let job = metastore.create_job(sync.id).await.unwrap();
        let prepared = factory
            .prepare(
                job,
                SyncExecutionConfig::default(),
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        // The stale token turned the run into a full pass.
        assert!(prepared.context.force_full_sync);
        assert!(prepared.context.full_pass);
    }

    #[tokio::test]
    async fn test_fresh_cursor_keeps_incremental_run() {
        struct FreshTokenSource;

        #[async_trait]
        impl Source for FreshTokenSource {
            fn name(&self) -> String {
                "FreshTokenSource".to_string()
            }

            fn capabilities(&self) -> SourceCapabilities {
                SourceCapabilities {
                    supports_continuous: true,
                    federated_search: false,
                }
            }

            async fn produce(&mut self, _sink: &EntitySink) -> Result<(), SourceError> {
                Ok(())
            }
        }

        struct FreshTokenFactory;

        #[async_trait]
        impl SourceFactory for FreshTokenFactory {
            fn short_name(&self) -> &'static str {
                "fresh"
            }

            async fn create(
                &self,
                _runtime: SourceRuntimeArgs,
            ) -> Result<Box<dyn Source>, SyncError> {
                Ok(Box::new(FreshTokenSource))
            }
        }

        let metastore = Arc::new(InMemoryMetastore::new());
        let source_connection = SourceConnectionConfig::new("fresh", Uuid::new_v4());
        let sync = weft_metastore::Sync::new(
            "s",
            source_connection.id,
            source_connection.collection_id,
        );
        metastore
            .create_source_connection(source_connection)
            .await
            .unwrap();
        metastore.create_sync(sync.clone()).await.unwrap();
        metastore
            .upsert_cursor(
                sync.id,
                Some("change_token".to_string()),
                json!({"change_token": "current"}),
            )
            .await
            .unwrap();

        let mut loader = SourceLoader::new();
        loader.add_source(Arc::new(FreshTokenFactory));
        let factory = SyncFactory::new(metastore.clone(), Arc::new(loader));

        let job = metastore.create_job(sync.id).await.unwrap();
        let prepared = factory
            .prepare(
                job,
                SyncExecutionConfig::default(),
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!prepared.context.force_full_sync);
        assert!(!prepared.context.full_pass);
    }
}
