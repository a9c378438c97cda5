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

//! # Sync core
//!
//! A sync job pulls entities from a [`source::Source`] (or replays them from
//! a captured snapshot), pushes them through a bounded read-ahead stream into
//! a worker pool, and runs each entity through the pipeline: classify by
//! content hash, chunk, embed, then dispatch an action batch to every
//! destination handler. Finalization computes orphans, publishes the cursor,
//! and rolls the job up to a terminal status.
//!
//! Concurrency model: one cooperative task per worker, no shared mutable
//! state between jobs, cancellation via a token observed at every suspension
//! point.

pub mod context;
pub mod cursor;
pub mod factory;
pub mod handlers;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod source;

use weft_common::retry::{ClassifyError, ErrorClass};
use weft_common::ErrorSeverity;
use weft_metastore::MetastoreError;
use weft_storage::StorageError;

use crate::handlers::HandlerError;
use crate::pipeline::PipelineError;
use crate::source::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("metastore error: {0}")]
    Metastore(#[from] MetastoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("configuration error: {0}")]
    Config(#[from] weft_config::ConfigError),
    #[error("worker pool failure: {0}")]
    Workers(String),
    #[error("source connection {0} no longer exists")]
    OrphanedSourceConnection(uuid::Uuid),
    #[error("sync job was cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SyncError::Source(error) => error.severity(),
            SyncError::Pipeline(error) => error.severity(),
            SyncError::Handler(error) => error.severity(),
            SyncError::Metastore(error) => error.severity(),
            SyncError::Storage(error) => error.severity(),
            SyncError::Config(error) => error.severity(),
            SyncError::Workers(_) => ErrorSeverity::Critical,
            SyncError::OrphanedSourceConnection(_) => ErrorSeverity::Expected,
            // Cancellation is a terminal state, not a failure.
            SyncError::Cancelled => ErrorSeverity::Expected,
        }
    }

    /// Whether a per-entity occurrence of this error must fail the whole job.
    ///
    /// Per-entity errors are captured and counted, never fatal, except when a
    /// handler reports a permanent classification.
    pub fn is_fatal_for_job(&self) -> bool {
        match self {
            SyncError::Handler(error) => error.error_class() == ErrorClass::Permanent,
            SyncError::Pipeline(error) => error.is_invariant_violation(),
            SyncError::Cancelled => true,
            _ => false,
        }
    }
}
