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

//! # Entities
//!
//! Everything Weft ingests is normalized into an [`Entity`]: a typed record
//! with a stable source-issued id, a breadcrumb trail locating it in the
//! source's hierarchy, and a payload of annotated fields. Chunk entities carry
//! a textual representation the pipeline chunks and embeds; file entities
//! carry a download URL the pipeline resolves into a local file before
//! conversion.
//!
//! The pipeline, never the source, owns the `system_metadata` envelope and the
//! content hash. Hashes are canonical (NFC text, sorted lowercase keys, no
//! whitespace) so they survive restarts and implementation changes.

mod action;
mod content_hash;
mod entity;
mod membership;

pub use action::{ActionBatch, ActionBatchError, ActionKind, EntityAction};
pub use content_hash::{canonical_json, content_hash};
pub use entity::{
    AccessControl, Breadcrumb, Chunk, ChunkEntity, ContentKind, EmbeddedChunk, Entity,
    EntityCommon, EntityField, FieldRole, FileEntity, ProcessedEntity, SparseWeights,
    SystemMetadata,
};
pub use membership::{Membership, MembershipAction, MembershipBatch, MemberType};
