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

//! # Snapshot storage
//!
//! At-rest layout for captured syncs, bit-exact:
//!
//! ```text
//! raw/{sync_id}/
//!   manifest.json
//!   entities/
//!     {entity_id}.json
//!   files/
//!     {entity_id}_{name}
//! ```
//!
//! Writes are atomic (staged into a temp file, then renamed) and offloaded to
//! the blocking thread pool so the event loop is never blocked.

mod backend;
mod snapshot;

pub use backend::{LocalStorageBackend, StorageBackend};
pub use snapshot::{CapturedEntity, SnapshotManifest, SnapshotStore};

use weft_common::retry::{ClassifyError, ErrorClass};
use weft_common::ErrorSeverity;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("io error on `{path}`: {message}")]
    Io { path: String, message: String },
    #[error("malformed captured entity at `{path}`: {message}")]
    MalformedEntity { path: String, message: String },
}

impl StorageError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::NotFound(_) => ErrorSeverity::Expected,
            StorageError::Io { .. } => ErrorSeverity::Operational,
            StorageError::MalformedEntity { .. } => ErrorSeverity::Critical,
        }
    }
}

impl ClassifyError for StorageError {
    fn error_class(&self) -> ErrorClass {
        match self {
            StorageError::Io { .. } => ErrorClass::Retryable,
            _ => ErrorClass::Permanent,
        }
    }
}
