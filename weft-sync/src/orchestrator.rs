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

//! Drives one sync job end to end.
//!
//! ```text
//! Pending → Running → {Completed | Failed | Cancelling → Cancelled}
//!                  └─(orphaned source-connection)→ self-destruct, no status update
//! ```
//!
//! The job never retries itself: a failed run stays Failed and the next
//! scheduled run starts fresh from the persisted cursor.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use weft_metastore::{Metastore, SyncJob, SyncJobStatus};

use crate::context::SyncContext;
use crate::cursor::SyncCursorService;
use crate::factory::{PreparedSync, SyncFactory};
use crate::pipeline::EntityPipeline;
use crate::source::{Source, SourceStream};
use crate::SyncError;

/// How many processed entities between job-progress flushes.
const PROGRESS_FLUSH_INTERVAL: u64 = 100;

pub struct SyncOrchestrator {
    context: Arc<SyncContext>,
    source: Option<Box<dyn Source>>,
    pipeline: Arc<EntityPipeline>,
    worker_pool: weft_common::worker_pool::WorkerPool,
    cursor_service: SyncCursorService,
}

impl SyncOrchestrator {
    pub fn new(prepared: PreparedSync) -> Self {
        Self {
            context: prepared.context,
            source: Some(prepared.source),
            pipeline: prepared.pipeline,
            worker_pool: prepared.worker_pool,
            cursor_service: prepared.cursor_service,
        }
    }

    pub async fn run(mut self) -> Result<SyncJob, SyncError> {
        let context = self.context.clone();
        match self.execute().await {
            Ok(job) => Ok(job),
            Err(error) => {
                let stats = context.progress.stats();
                warn!(job_id = %context.job.id, %error, "sync-job-failed");
                let _ = context
                    .metastore
                    .update_job_status(
                        context.job.id,
                        SyncJobStatus::Failed,
                        Some(error.to_string()),
                        Some(stats),
                    )
                    .await;
                Err(error)
            }
        }
    }

    async fn execute(&mut self) -> Result<SyncJob, SyncError> {
        let context = self.context.clone();
        let job_id = context.job.id;
        info!(job_id = %job_id, sync_id = %context.sync_id(), "sync-job-starting");
        context
            .metastore
            .update_job_status(job_id, SyncJobStatus::Running, None, None)
            .await?;

        let source = self
            .source
            .take()
            .ok_or_else(|| SyncError::Workers("orchestrator run twice".to_string()))?;
        let mut stream = SourceStream::spawn(
            source,
            context.execution_config.stream_buffer_size,
            &context.cancel,
        );

        let mut cancelled = false;
        let mut submitted: u64 = 0;
        loop {
            tokio::select! {
                _ = context.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                entity = stream.next_entity() => {
                    let Some(entity) = entity else { break; };
                    if entity.should_skip() {
                        context.progress.record_skipped(1);
                        continue;
                    }
                    self.worker_pool.throttle().await;
                    let pipeline = self.pipeline.clone();
                    let worker_context = context.clone();
                    self.worker_pool.submit(async move {
                        match pipeline.process(entity, &worker_context).await {
                            Ok(_) => Ok(()),
                            Err(error) if error.is_fatal_for_job() => {
                                Err(anyhow::anyhow!(error.to_string()))
                            }
                            Err(error) => {
                                warn!(%error, "entity-processing-failed");
                                worker_context.progress.record_failed(1);
                                Ok(())
                            }
                        }
                    });
                    submitted += 1;
                    if submitted % PROGRESS_FLUSH_INTERVAL == 0 {
                        let _ = context
                            .metastore
                            .record_job_progress(job_id, context.progress.stats())
                            .await;
                    }
                }
            }
        }

        if cancelled {
            return self.finish_cancelled(stream).await;
        }

        // Drain every in-flight worker before looking at the terminal state.
        let pool_result = self.worker_pool.wait_for_completion().await;
        let outcome = stream.finish().await;
        if let Err(pool_error) = pool_result {
            return Err(SyncError::Workers(pool_error.to_string()));
        }
        match outcome.result {
            Ok(()) => {}
            Err(crate::source::SourceError::Cancelled) => {
                return self.finish_cancelled_drained().await;
            }
            Err(source_error) => return Err(source_error.into()),
        }

        self.cleanup_orphans().await?;

        if !context.execution_config.skip_cursor_updates {
            if let Some(update) = outcome.cursor {
                let cursor_field = update
                    .cursor_field
                    .or_else(|| context.source_connection.cursor_field.clone());
                self.cursor_service
                    .create_or_update(context.sync_id(), cursor_field, update.cursor_data)
                    .await?;
            }
        }

        for handler in self.pipeline.handlers() {
            handler.finalize(&context).await?;
        }

        let stats = context.progress.stats();
        let job = context
            .metastore
            .update_job_status(job_id, SyncJobStatus::Completed, None, Some(stats))
            .await?;
        info!(job_id = %job_id, ?stats, "sync-job-completed");
        Ok(job)
    }

    /// Entities present in the prior run of this source connection but not
    /// in this one are deleted from every destination. Only sound after a
    /// full pass, and never during replay-style runs that skip hash updates.
    async fn cleanup_orphans(&self) -> Result<(), SyncError> {
        let context = &self.context;
        if !context.full_pass || context.execution_config.skip_hash_updates {
            return Ok(());
        }
        let stored_ids = context
            .metastore
            .list_entity_ids(context.sync_id(), context.source_connection_id())
            .await?;
        let seen = context.seen_entity_ids();
        let orphans: Vec<String> = stored_ids
            .into_iter()
            .filter(|entity_id| !seen.contains(entity_id))
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }
        info!(num_orphans = orphans.len(), "orphan-cleanup");
        for handler in self.pipeline.handlers() {
            handler.handle_orphan_cleanup(&orphans, context).await?;
        }
        context
            .metastore
            .delete_entity_hashes(context.sync_id(), context.source_connection_id(), &orphans)
            .await?;
        context.progress.record_deleted(orphans.len() as u64);
        Ok(())
    }

    async fn finish_cancelled(&mut self, stream: SourceStream) -> Result<SyncJob, SyncError> {
        stream.cancel();
        let context = self.context.clone();
        // Transition to Cancelling if the cancel API has not already.
        let _ = context
            .metastore
            .update_job_status(context.job.id, SyncJobStatus::Cancelling, None, None)
            .await;
        // Drain in-flight workers; their batches complete, nothing new is
        // submitted.
        if let Err(pool_error) = self.worker_pool.wait_for_completion().await {
            warn!(%pool_error, "worker failures while draining cancelled job");
        }
        let _outcome = stream.finish().await;
        self.finish_cancelled_drained().await
    }

    async fn finish_cancelled_drained(&self) -> Result<SyncJob, SyncError> {
        let context = &self.context;
        let stats = context.progress.stats();
        let job = context
            .metastore
            .update_job_status(
                context.job.id,
                SyncJobStatus::Cancelled,
                Some("cancelled by request".to_string()),
                Some(stats),
            )
            .await?;
        info!(job_id = %context.job.id, "sync-job-cancelled");
        Ok(job)
    }
}

/// Cleans up after a sync whose source connection vanished while the job was
/// queued or running. The job status is deliberately left untouched.
pub async fn self_destruct(
    metastore: &Arc<dyn Metastore>,
    sync_id: Uuid,
    reason: &str,
) -> Result<(), SyncError> {
    info!(%sync_id, reason, "sync-self-destruct");
    let _ = metastore.delete_cursor(sync_id).await;
    Ok(())
}

/// Prepares and runs a job; an orphaned source connection self-destructs
/// instead of failing.
pub async fn run_sync(
    factory: &SyncFactory,
    job: SyncJob,
    execution_config: weft_config::SyncExecutionConfig,
    force_full_sync: bool,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<SyncJob, SyncError> {
    let job_id = job.id;
    let sync_id = job.sync_id;
    match factory
        .prepare(job, execution_config, force_full_sync, cancel)
        .await
    {
        Ok(prepared) => SyncOrchestrator::new(prepared).run().await,
        Err(SyncError::OrphanedSourceConnection(source_connection_id)) => {
            self_destruct(
                factory.metastore(),
                sync_id,
                &format!("source connection {source_connection_id} deleted"),
            )
            .await?;
            Ok(factory.metastore().job(job_id).await?)
        }
        Err(error) => {
            let _ = factory
                .metastore()
                .update_job_status(job_id, SyncJobStatus::Failed, Some(error.to_string()), None)
                .await;
            Err(error)
        }
    }
}
