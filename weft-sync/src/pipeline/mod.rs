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

//! # Entity pipeline
//!
//! Per-entity stages, serialized per entity, unordered across entities:
//!
//! 1. classify: content hash against the stored hash for
//!    `(sync_id, source_connection_id, entity_id)`, yielding Skip, Insert or
//!    Update.
//! 2. transform: chunk the textual representation (prose or code), after
//!    downloading and converting file entities.
//! 3. embed: batched dense embeddings, sparse weights per chunk.
//! 4. dispatch: hand one action batch to every handler, in parallel.
//!
//! Per-`entity_id` the job's last action wins: each entity is routed to
//! exactly one worker, and an `entity_id` appears at most once per batch.

mod chunker;
mod file_handler;

pub use chunker::{TextChunker, MAX_TOKENS_PER_CHUNK, TARGET_CHUNK_TOKENS};
pub use file_handler::{
    FileConverter, FileOutcome, FileProcessor, PlainTextConverter, MAX_FILE_SIZE_BYTES,
};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use weft_common::ErrorSeverity;
use weft_entities::{
    content_hash, ActionBatch, ActionKind, Chunk, ContentKind, EmbeddedChunk, Entity, EntityAction,
    ProcessedEntity, SystemMetadata,
};
use weft_inference::{DenseEmbedder, InferenceError, SparseEmbedder};
use weft_metastore::EntityHashRecord;

use crate::context::SyncContext;
use crate::handlers::ActionHandler;
use crate::source::SourceError;
use crate::SyncError;

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "rb", "sh",
];

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to initialize chunker: {0}")]
    ChunkerInit(String),
    #[error("empty chunk produced")]
    EmptyChunk,
    #[error("chunk has {token_count} tokens after safety net (max {max_tokens})")]
    OversizedChunk { token_count: usize, max_tokens: usize },
    #[error("converter `{converter}` failed: {message}")]
    Conversion {
        converter: &'static str,
        message: String,
    },
    #[error("embedding failed: {0}")]
    Embedding(#[from] InferenceError),
    #[error("pipeline invariant violated: {0}")]
    Invariant(String),
}

impl PipelineError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Conversion { .. } => ErrorSeverity::Expected,
            PipelineError::Embedding(error) => error.severity(),
            PipelineError::ChunkerInit(_)
            | PipelineError::EmptyChunk
            | PipelineError::OversizedChunk { .. }
            | PipelineError::Invariant(_) => ErrorSeverity::Critical,
        }
    }

    /// Invariant violations fail the job; everything else is per-entity.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::EmptyChunk
                | PipelineError::OversizedChunk { .. }
                | PipelineError::Invariant(_)
        )
    }
}

pub struct EntityPipeline {
    chunker: Arc<TextChunker>,
    file_processor: Arc<FileProcessor>,
    dense_embedder: Option<Arc<dyn DenseEmbedder>>,
    sparse_embedder: Arc<dyn SparseEmbedder>,
    handlers: Vec<Arc<dyn ActionHandler>>,
    scratch_dir: PathBuf,
}

impl EntityPipeline {
    pub fn new(
        chunker: Arc<TextChunker>,
        file_processor: Arc<FileProcessor>,
        dense_embedder: Option<Arc<dyn DenseEmbedder>>,
        sparse_embedder: Arc<dyn SparseEmbedder>,
        handlers: Vec<Arc<dyn ActionHandler>>,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            chunker,
            file_processor,
            dense_embedder,
            sparse_embedder,
            handlers,
            scratch_dir,
        }
    }

    pub fn handlers(&self) -> &[Arc<dyn ActionHandler>] {
        &self.handlers
    }

    /// Runs one entity through classify → transform → embed → dispatch.
    pub async fn process(
        &self,
        mut entity: Entity,
        ctx: &SyncContext,
    ) -> Result<ActionKind, SyncError> {
        let entity_id = entity.entity_id().to_string();
        ctx.record_seen(&entity_id);

        // File stage: resolve the blob into markdown before anything else.
        let text = match &mut entity {
            Entity::File(file) => {
                match self
                    .file_processor
                    .fetch_and_convert(file, &self.scratch_dir)
                    .await
                {
                    Ok(FileOutcome::Converted { markdown }) => {
                        let kind = content_kind_for_name(&file.common.name);
                        Some((markdown, kind))
                    }
                    Ok(FileOutcome::Skipped { reason })
                    | Err(SourceError::FileSkipped { reason }) => {
                        debug!(%entity_id, %reason, "file-skipped");
                        ctx.progress.record_skipped(1);
                        return Ok(ActionKind::Skip);
                    }
                    Err(error) => return Err(SyncError::Source(error)),
                }
            }
            Entity::Chunk(chunk) => Some((
                chunk.textual_representation.clone(),
                chunk.content_kind,
            )),
            Entity::Base { .. } => None,
        };

        self.stamp_system_metadata(&mut entity, ctx);
        let hash = entity
            .system_metadata()
            .and_then(|metadata| metadata.content_hash.clone())
            .unwrap_or_default();

        // Classify.
        let stored_hash = if ctx.execution_config.skip_hash_comparison {
            None
        } else {
            ctx.metastore
                .entity_hash(ctx.sync_id(), ctx.source_connection_id(), &entity_id)
                .await?
        };
        if !ctx.force_full_sync && stored_hash.as_deref() == Some(hash.as_str()) {
            debug!(%entity_id, "hash-unchanged-skip");
            ctx.progress.record_skipped(1);
            return Ok(ActionKind::Skip);
        }
        let action_kind = if stored_hash.is_none() {
            ActionKind::Insert
        } else {
            ActionKind::Update
        };

        // Transform.
        let chunks = match &text {
            Some((content, ContentKind::Code)) => self.chunker.chunk_code(content)?,
            Some((content, ContentKind::Prose)) => self.chunker.chunk_prose(content)?,
            None => Vec::new(),
        };

        // Embed.
        let embedded = self.embed_chunks(chunks).await?;

        // Dispatch.
        let processed = ProcessedEntity {
            entity,
            chunks: embedded,
        };
        let mut batch = ActionBatch::new();
        let action = match action_kind {
            ActionKind::Insert => EntityAction::Insert(processed),
            _ => EntityAction::Update(processed),
        };
        batch
            .push(action)
            .map_err(|error| PipelineError::Invariant(error.to_string()))?;
        futures::future::try_join_all(
            self.handlers
                .iter()
                .map(|handler| handler.handle_batch(&batch, ctx)),
        )
        .await?;

        // Publish the new hash so the next run classifies this entity Skip.
        if !ctx.execution_config.skip_hash_updates {
            ctx.metastore
                .upsert_entity_hash(EntityHashRecord {
                    sync_id: ctx.sync_id(),
                    source_connection_id: ctx.source_connection_id(),
                    collection_id: ctx.collection_id(),
                    entity_id: entity_id.clone(),
                    content_hash: hash,
                    entity_type: batch
                        .actions()
                        .first()
                        .map(|action| match action {
                            EntityAction::Insert(processed) | EntityAction::Update(processed) => {
                                processed.entity.entity_type().to_string()
                            }
                            _ => String::new(),
                        })
                        .unwrap_or_default(),
                    source_name: ctx.source_name().to_string(),
                })
                .await?;
        }

        match action_kind {
            ActionKind::Insert => ctx.progress.record_inserted(1),
            _ => ctx.progress.record_updated(1),
        }
        Ok(action_kind)
    }

    fn stamp_system_metadata(&self, entity: &mut Entity, ctx: &SyncContext) {
        let hash = content_hash(entity);
        let previous_access = entity
            .system_metadata()
            .and_then(|metadata| metadata.access.clone());
        let entity_type = entity.entity_type().to_string();
        let original_entity_id = entity.entity_id().to_string();
        entity.set_system_metadata(SystemMetadata {
            sync_id: ctx.sync_id(),
            source_connection_id: ctx.source_connection_id(),
            entity_type,
            source_name: ctx.source_name().to_string(),
            original_entity_id,
            content_hash: Some(hash),
            chunk_index: None,
            access: previous_access,
        });
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, SyncError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let dense_embeddings = match &self.dense_embedder {
            Some(embedder) => {
                let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
                let embeddings = embedder
                    .embed_many(&texts)
                    .await
                    .map_err(PipelineError::Embedding)?;
                if embeddings.len() != chunks.len() {
                    return Err(PipelineError::Invariant(format!(
                        "embedder returned {} embeddings for {} chunks",
                        embeddings.len(),
                        chunks.len()
                    ))
                    .into());
                }
                Some(embeddings)
            }
            None => None,
        };
        let mut embedded = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let sparse = self
                .sparse_embedder
                .embed(&chunk.text)
                .await
                .map_err(PipelineError::Embedding)?;
            embedded.push(EmbeddedChunk {
                index: chunk.index,
                text: chunk.text,
                token_count: chunk.token_count,
                dense_embedding: dense_embeddings
                    .as_ref()
                    .map(|embeddings| embeddings[i].clone()),
                sparse_embedding: Some(sparse),
            });
        }
        Ok(embedded)
    }
}

fn content_kind_for_name(name: &str) -> ContentKind {
    let extension = name.rsplit('.').next().unwrap_or_default().to_lowercase();
    if CODE_EXTENSIONS.contains(&extension.as_str()) {
        ContentKind::Code
    } else {
        ContentKind::Prose
    }
}
