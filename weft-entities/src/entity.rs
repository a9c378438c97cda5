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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use uuid::Uuid;

/// One ancestor reference in an entity's hierarchy path.
///
/// Breadcrumbs are an ordered list, not back-references; the entity graph has
/// no pointer cycles.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub entity_id: String,
    pub name: String,
    pub kind: String,
}

impl Breadcrumb {
    pub fn new(
        entity_id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Access control attached to an entity by its source.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccessControl {
    pub is_public: bool,
    #[serde(default)]
    pub viewers: Vec<String>,
}

/// Envelope populated by the pipeline, not the source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMetadata {
    pub sync_id: Uuid,
    pub source_connection_id: Uuid,
    pub entity_type: String,
    pub source_name: String,
    pub original_entity_id: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub chunk_index: Option<u32>,
    #[serde(default)]
    pub access: Option<AccessControl>,
}

/// Role a payload field plays, so the pipeline can drive hashing and
/// embedding generically without knowing the source schema.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// Part of the embeddable surface; contributes to the content hash.
    Embeddable,
    /// Carried along for display and filtering; contributes to the hash.
    Metadata,
    /// Timestamp from the source; excluded from the hash (clock noise).
    Timestamp,
}

/// One source-declared payload field with its role annotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityField {
    pub name: String,
    pub value: JsonValue,
    pub role: FieldRole,
}

impl EntityField {
    pub fn embeddable(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            role: FieldRole::Embeddable,
        }
    }

    pub fn metadata(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            role: FieldRole::Metadata,
        }
    }
}

/// Attributes shared by every entity variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityCommon {
    /// Stable, source-issued identifier, unique within a source connection.
    pub entity_id: String,
    /// Human-readable label.
    pub name: String,
    /// Dotted type name, e.g. `"slack.message"`.
    pub entity_type: String,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub fields: Vec<EntityField>,
    #[serde(default)]
    pub system_metadata: Option<SystemMetadata>,
}

impl EntityCommon {
    pub fn new(
        entity_id: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
            entity_type: entity_type.into(),
            breadcrumbs: Vec::new(),
            created_at: None,
            updated_at: None,
            fields: Vec::new(),
            system_metadata: None,
        }
    }
}

/// Whether a chunk entity's text is prose or code, which selects the chunker.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Prose,
    Code,
}

/// An entity carrying a textual representation to be chunked and embedded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntity {
    #[serde(flatten)]
    pub common: EntityCommon,
    pub textual_representation: String,
    #[serde(default)]
    pub content_kind: ContentKind,
}

/// A downloadable blob, converted to markdown then chunked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEntity {
    #[serde(flatten)]
    pub common: EntityCommon,
    pub download_url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Set by the file handler after download.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub total_size: Option<u64>,
    /// Set by the file handler when the file is gated out (size, extension,
    /// empty download). Skipped files are not errors.
    #[serde(default)]
    pub should_skip: bool,
}

/// The unit of ingestion. The variant set is closed; source-specific entity
/// types are expressed through `entity_type` plus annotated fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__entity_class__")]
pub enum Entity {
    #[serde(rename = "BaseEntity")]
    Base { #[serde(flatten)] common: EntityCommon },
    #[serde(rename = "ChunkEntity")]
    Chunk(ChunkEntity),
    #[serde(rename = "FileEntity")]
    File(FileEntity),
}

impl Entity {
    pub fn common(&self) -> &EntityCommon {
        match self {
            Entity::Base { common } => common,
            Entity::Chunk(chunk) => &chunk.common,
            Entity::File(file) => &file.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut EntityCommon {
        match self {
            Entity::Base { common } => common,
            Entity::Chunk(chunk) => &mut chunk.common,
            Entity::File(file) => &mut file.common,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.common().entity_id
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn entity_type(&self) -> &str {
        &self.common().entity_type
    }

    pub fn entity_class(&self) -> &'static str {
        match self {
            Entity::Base { .. } => "BaseEntity",
            Entity::Chunk(_) => "ChunkEntity",
            Entity::File(_) => "FileEntity",
        }
    }

    pub fn system_metadata(&self) -> Option<&SystemMetadata> {
        self.common().system_metadata.as_ref()
    }

    pub fn set_system_metadata(&mut self, system_metadata: SystemMetadata) {
        self.common_mut().system_metadata = Some(system_metadata);
    }

    /// The text the pipeline chunks and embeds, if any.
    pub fn textual_representation(&self) -> Option<&str> {
        match self {
            Entity::Chunk(chunk) => Some(&chunk.textual_representation),
            _ => None,
        }
    }

    pub fn should_skip(&self) -> bool {
        match self {
            Entity::File(file) => file.should_skip,
            _ => false,
        }
    }
}

/// Sparse term weights for keyword-style retrieval.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseWeights {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseWeights {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// One chunk of an entity's textual representation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
    pub token_count: usize,
}

/// A chunk with its embeddings attached, ready for a destination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub index: u32,
    pub text: String,
    pub token_count: usize,
    #[serde(default)]
    pub dense_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub sparse_embedding: Option<SparseWeights>,
}

/// Pipeline output for one entity: the entity itself plus its chunks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntity {
    pub entity: Entity,
    pub chunks: Vec<EmbeddedChunk>,
}
