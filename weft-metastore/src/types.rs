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

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use uuid::Uuid;

use weft_common::progress::SyncStats;

/// Role of a destination slot. The source slot carries no role.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    Active,
    Shadow,
    Deprecated,
}

/// A slot binding a connection to a sync.
///
/// `role == None` marks the source slot; it is never a destination and can
/// never be removed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyncConnection {
    pub connection_id: Uuid,
    pub role: Option<SlotRole>,
}

/// A sync binds one source connection to destination connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sync {
    pub id: Uuid,
    pub name: String,
    pub source_connection_id: Uuid,
    pub collection_id: Uuid,
    pub connections: Vec<SyncConnection>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Sync {
    pub fn new(name: impl Into<String>, source_connection_id: Uuid, collection_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source_connection_id,
            collection_id,
            connections: vec![SyncConnection {
                connection_id: source_connection_id,
                role: None,
            }],
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn destination_slots(&self) -> impl Iterator<Item = &SyncConnection> {
        self.connections.iter().filter(|slot| slot.role.is_some())
    }

    pub fn active_slot(&self) -> Option<&SyncConnection> {
        self.connections
            .iter()
            .find(|slot| slot.role == Some(SlotRole::Active))
    }

    pub fn slot(&self, connection_id: Uuid) -> Option<&SyncConnection> {
        self.connections
            .iter()
            .find(|slot| slot.connection_id == connection_id)
    }

    pub fn num_active_slots(&self) -> usize {
        self.connections
            .iter()
            .filter(|slot| slot.role == Some(SlotRole::Active))
            .count()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl SyncJobStatus {
    /// Statuses that block the creation of another job on the same sync.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SyncJobStatus::Pending | SyncJobStatus::Running | SyncJobStatus::Cancelling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncJobStatus::Completed | SyncJobStatus::Failed | SyncJobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: SyncJobStatus) -> bool {
        use SyncJobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelling)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

/// One execution of a sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub sync_id: Uuid,
    pub status: SyncJobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Last time the job reported progress; the janitor uses this to detect
    /// stalled jobs.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_progress_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stats: SyncStats,
}

impl SyncJob {
    pub fn new(sync_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_id,
            status: SyncJobStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
            last_progress_at: None,
            error: None,
            stats: SyncStats::default(),
        }
    }
}

/// Durable per-sync cursor row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncCursorRecord {
    pub sync_id: Uuid,
    pub cursor_field: Option<String>,
    pub cursor_data: JsonValue,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

/// Hash index row keyed by `(sync_id, source_connection_id, entity_id)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityHashRecord {
    pub sync_id: Uuid,
    pub source_connection_id: Uuid,
    pub collection_id: Uuid,
    pub entity_id: String,
    pub content_hash: String,
    pub entity_type: String,
    pub source_name: String,
}

/// Entity count per source and entity type within a collection.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntityCount {
    pub source_name: String,
    pub entity_type: String,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_transitions() {
        use SyncJobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_new_sync_has_source_slot_only() {
        let source_connection_id = Uuid::new_v4();
        let sync = Sync::new("sync", source_connection_id, Uuid::new_v4());
        assert_eq!(sync.connections.len(), 1);
        assert_eq!(sync.connections[0].role, None);
        assert_eq!(sync.destination_slots().count(), 0);
        assert!(sync.active_slot().is_none());
    }
}
