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

//! # Destination handlers
//!
//! A handler consumes an [`ActionBatch`] and applies it to one destination
//! family: the vector store, the raw-data snapshot, or the relational
//! membership table. Handlers are stateless at the sync level, idempotent
//! for their action types, and run in parallel for each batch.
//!
//! Availability failures (refused connections, timeouts, transient 5xx)
//! retry up to four times with 2s/4s/8s/16s waits; permanent failures (4xx,
//! validation) fail the batch immediately and, by policy, the sync.

mod access_control;
mod raw_data;
mod vector;

pub use access_control::MembershipHandler;
pub use raw_data::SnapshotHandler;
pub use vector::{SelfProcessingHandler, VectorHandler};

use async_trait::async_trait;

use weft_common::retry::{ClassifyError, ErrorClass};
use weft_common::ErrorSeverity;
use weft_destinations::DestinationError;
use weft_entities::ActionBatch;
use weft_metastore::MetastoreError;
use weft_storage::StorageError;

use crate::context::SyncContext;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("[{handler}] destination error: {source}")]
    Destination {
        handler: String,
        source: DestinationError,
    },
    #[error("[{handler}] storage error: {source}")]
    Storage {
        handler: String,
        source: StorageError,
    },
    #[error("[{handler}] metastore error: {source}")]
    Metastore {
        handler: String,
        source: MetastoreError,
    },
}

impl HandlerError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HandlerError::Destination { source, .. } => source.severity(),
            HandlerError::Storage { source, .. } => source.severity(),
            HandlerError::Metastore { source, .. } => source.severity(),
        }
    }
}

impl ClassifyError for HandlerError {
    fn error_class(&self) -> ErrorClass {
        match self {
            HandlerError::Destination { source, .. } => source.error_class(),
            HandlerError::Storage { source, .. } => source.error_class(),
            HandlerError::Metastore { source, .. } => source.error_class(),
        }
    }
}

/// One destination family's view of the pipeline output.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Applies a batch. Must be idempotent: replaying the same batch leaves
    /// the destination unchanged.
    async fn handle_batch(
        &self,
        batch: &ActionBatch,
        ctx: &SyncContext,
    ) -> Result<(), HandlerError>;

    /// End-of-job deletion of entities that vanished from the source.
    async fn handle_orphan_cleanup(
        &self,
        orphan_entity_ids: &[String],
        ctx: &SyncContext,
    ) -> Result<(), HandlerError>;

    /// Called once after a successful run (e.g. manifest publication).
    async fn finalize(&self, _ctx: &SyncContext) -> Result<(), HandlerError> {
        Ok(())
    }
}
