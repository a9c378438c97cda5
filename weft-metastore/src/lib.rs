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

//! # Metastore
//!
//! The metastore owns the durable control-plane state of Weft: syncs and
//! their destination slots, sync jobs, cursors, the per-entity content hash
//! index and access-control membership rows.
//!
//! Every compound operation exposed by the [`Metastore`] trait is atomic in
//! the implementation: one lock section in memory, one transaction in a
//! relational backend. Callers never see a sync with two Active destination
//! slots, and never create a second concurrent job on the same sync.

mod in_memory;
mod metastore;
#[cfg(feature = "postgres")]
mod postgres_memberships;
mod types;

pub use in_memory::InMemoryMetastore;
pub use metastore::{Metastore, MetastoreResult};
#[cfg(feature = "postgres")]
pub use postgres_memberships::PostgresMembershipStore;
pub use types::{
    EntityCount, EntityHashRecord, SlotRole, Sync, SyncConnection, SyncCursorRecord, SyncJob,
    SyncJobStatus,
};

use weft_common::retry::{ClassifyError, ErrorClass};
use weft_common::ErrorSeverity;

#[derive(Debug, thiserror::Error)]
pub enum MetastoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("a job is already pending or running for sync {sync_id}")]
    JobAlreadyRunning { sync_id: uuid::Uuid },
    #[error("illegal job transition from {from:?} to {to:?}")]
    IllegalJobTransition { from: SyncJobStatus, to: SyncJobStatus },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("metastore unavailable: {0}")]
    Unavailable(String),
}

impl MetastoreError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MetastoreError::NotFound(_)
            | MetastoreError::AlreadyExists(_)
            | MetastoreError::JobAlreadyRunning { .. } => ErrorSeverity::Expected,
            MetastoreError::Unavailable(_) => ErrorSeverity::Operational,
            MetastoreError::IllegalJobTransition { .. }
            | MetastoreError::InvariantViolation(_) => ErrorSeverity::Critical,
        }
    }
}

impl ClassifyError for MetastoreError {
    fn error_class(&self) -> ErrorClass {
        match self {
            MetastoreError::Unavailable(_) => ErrorClass::Retryable,
            _ => ErrorClass::Permanent,
        }
    }
}
