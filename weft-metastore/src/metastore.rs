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

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use weft_common::progress::SyncStats;
use weft_config::SourceConnectionConfig;
use weft_entities::{Membership, MemberType};

use crate::types::{
    EntityCount, EntityHashRecord, SlotRole, Sync, SyncCursorRecord, SyncJob, SyncJobStatus,
};
use crate::MetastoreError;

pub type MetastoreResult<T> = Result<T, MetastoreError>;

/// Control-plane store consumed by the sync core, the search core and the
/// janitor. Compound operations are atomic.
#[async_trait]
pub trait Metastore: Send + ::std::marker::Sync + 'static {
    // Source connections.

    async fn create_source_connection(
        &self,
        config: SourceConnectionConfig,
    ) -> MetastoreResult<()>;

    async fn source_connection(&self, id: Uuid) -> MetastoreResult<SourceConnectionConfig>;

    async fn delete_source_connection(&self, id: Uuid) -> MetastoreResult<()>;

    // Syncs and destination slots.

    async fn create_sync(&self, sync: Sync) -> MetastoreResult<()>;

    async fn sync(&self, sync_id: Uuid) -> MetastoreResult<Sync>;

    /// Attaches a destination connection. The first destination becomes
    /// Active; later attachments start as Shadow.
    async fn attach_slot(&self, sync_id: Uuid, connection_id: Uuid) -> MetastoreResult<Sync>;

    /// Sets a destination slot role. Promoting to Active demotes the current
    /// Active to Shadow. Demoting the sole remaining Active is rejected.
    async fn set_slot_role(
        &self,
        sync_id: Uuid,
        connection_id: Uuid,
        role: SlotRole,
    ) -> MetastoreResult<Sync>;

    /// Promotes a Shadow to Active and demotes the prior Active to
    /// Deprecated, atomically.
    async fn switch_active(&self, sync_id: Uuid, shadow_connection_id: Uuid)
        -> MetastoreResult<Sync>;

    /// Removes a slot. Sources and Active destinations cannot be removed.
    async fn remove_slot(&self, sync_id: Uuid, connection_id: Uuid) -> MetastoreResult<Sync>;

    // Jobs.

    /// Creates a job, failing fast if a live job already exists for the sync.
    async fn create_job(&self, sync_id: Uuid) -> MetastoreResult<SyncJob>;

    async fn job(&self, job_id: Uuid) -> MetastoreResult<SyncJob>;

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: SyncJobStatus,
        error: Option<String>,
        stats: Option<SyncStats>,
    ) -> MetastoreResult<SyncJob>;

    /// Refreshes the job's stats and progress timestamp without changing its
    /// status.
    async fn record_job_progress(&self, job_id: Uuid, stats: SyncStats) -> MetastoreResult<()>;

    /// Jobs whose status is Pending, Running or Cancelling.
    async fn list_live_jobs(&self) -> MetastoreResult<Vec<SyncJob>>;

    // Cursors.

    async fn cursor(&self, sync_id: Uuid) -> MetastoreResult<Option<SyncCursorRecord>>;

    async fn upsert_cursor(
        &self,
        sync_id: Uuid,
        cursor_field: Option<String>,
        cursor_data: JsonValue,
    ) -> MetastoreResult<SyncCursorRecord>;

    async fn update_cursor_data(
        &self,
        sync_id: Uuid,
        cursor_data: JsonValue,
    ) -> MetastoreResult<Option<SyncCursorRecord>>;

    async fn delete_cursor(&self, sync_id: Uuid) -> MetastoreResult<bool>;

    // Content hash index.

    async fn entity_hash(
        &self,
        sync_id: Uuid,
        source_connection_id: Uuid,
        entity_id: &str,
    ) -> MetastoreResult<Option<String>>;

    async fn upsert_entity_hash(&self, record: EntityHashRecord) -> MetastoreResult<()>;

    async fn delete_entity_hashes(
        &self,
        sync_id: Uuid,
        source_connection_id: Uuid,
        entity_ids: &[String],
    ) -> MetastoreResult<()>;

    /// Every entity id stored for `(sync_id, source_connection_id)`; the
    /// orphan-cleanup pass diffs this against the ids seen in the run.
    async fn list_entity_ids(
        &self,
        sync_id: Uuid,
        source_connection_id: Uuid,
    ) -> MetastoreResult<Vec<String>>;

    /// Entity counts per source and entity type within a collection.
    async fn entity_counts(&self, collection_id: Uuid) -> MetastoreResult<Vec<EntityCount>>;

    // Access-control memberships.

    async fn upsert_memberships(
        &self,
        source_connection_id: Uuid,
        memberships: &[Membership],
    ) -> MetastoreResult<u64>;

    async fn delete_memberships(
        &self,
        source_connection_id: Uuid,
        keys: &[(String, MemberType, String)],
    ) -> MetastoreResult<u64>;

    async fn delete_memberships_by_member(
        &self,
        source_connection_id: Uuid,
        members: &[(String, MemberType)],
    ) -> MetastoreResult<u64>;

    async fn delete_memberships_by_group(
        &self,
        source_connection_id: Uuid,
        groups: &[String],
    ) -> MetastoreResult<u64>;
}
