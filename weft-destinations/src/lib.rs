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

//! # Destinations
//!
//! A destination consumes four operations: `bulk_insert_raw`,
//! `bulk_upsert`, `bulk_delete_by_entity_ids` and `search`. Everything else
//! about the backing store is its own business.
//!
//! Documents are keyed deterministically:
//! `sha1(sync_id || original_entity_id || chunk_index)`, so re-running a sync
//! or replaying a snapshot lands on the same ids.

mod http;
mod in_memory;

pub use http::HttpSearchDestination;
pub use in_memory::InMemoryDestination;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use weft_common::retry::{ClassifyError, ErrorClass};
use weft_common::ErrorSeverity;
use weft_entities::{AccessControl, Breadcrumb, Entity, SparseWeights};
use weft_query::{CompiledQuery, SearchResult};

/// Deterministic document id for a chunk.
pub fn chunk_doc_id(sync_id: Uuid, original_entity_id: &str, chunk_index: u32) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sync_id.to_string().as_bytes());
    hasher.update(original_entity_id.as_bytes());
    hasher.update(chunk_index.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether the destination wants pre-chunked documents with embeddings, or
/// raw entities it chunks and embeds internally.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessingRequirement {
    Chunks,
    RawEntities,
}

/// A chunk with embeddings and denormalized metadata, ready to index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkDocument {
    pub doc_id: String,
    pub sync_id: Uuid,
    pub collection_id: Uuid,
    pub original_entity_id: String,
    pub chunk_index: u32,
    pub name: String,
    pub entity_type: String,
    pub source_name: String,
    pub content_hash: String,
    pub text: String,
    #[serde(default)]
    pub dense_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub sparse_embedding: Option<SparseWeights>,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default)]
    pub access: Option<AccessControl>,
}

#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("destination unavailable: {0}")]
    Unavailable(String),
    #[error("destination timed out: {0}")]
    Timeout(String),
    #[error("destination rejected the request ({status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },
    #[error("malformed destination payload: {0}")]
    Serialization(String),
}

impl DestinationError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DestinationError::Unavailable(_) | DestinationError::Timeout(_) => {
                ErrorSeverity::Operational
            }
            DestinationError::Permanent { .. } | DestinationError::Serialization(_) => {
                ErrorSeverity::Critical
            }
        }
    }
}

impl ClassifyError for DestinationError {
    fn error_class(&self) -> ErrorClass {
        match self {
            DestinationError::Unavailable(_) | DestinationError::Timeout(_) => {
                ErrorClass::Retryable
            }
            _ => ErrorClass::Permanent,
        }
    }
}

/// The operations the sync and search cores consume from any vector store.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
#[async_trait]
pub trait Destination: Send + Sync + 'static {
    fn name(&self) -> String;

    fn processing(&self) -> ProcessingRequirement;

    /// Indexes raw entities; the destination chunks and embeds internally.
    /// Only meaningful for `ProcessingRequirement::RawEntities`.
    async fn bulk_insert_raw(
        &self,
        sync_id: Uuid,
        collection_id: Uuid,
        entities: &[Entity],
    ) -> Result<(), DestinationError>;

    /// Idempotent upsert keyed by [`ChunkDocument::doc_id`].
    async fn bulk_upsert(&self, documents: &[ChunkDocument]) -> Result<(), DestinationError>;

    /// Removes every document whose `original_entity_id` matches, within the
    /// sync scope.
    async fn bulk_delete_by_entity_ids(
        &self,
        entity_ids: &[String],
        sync_id: Uuid,
    ) -> Result<(), DestinationError>;

    async fn search(&self, query: &CompiledQuery) -> Result<Vec<SearchResult>, DestinationError>;
}
