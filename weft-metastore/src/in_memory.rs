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

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use weft_common::progress::SyncStats;
use weft_config::SourceConnectionConfig;
use weft_entities::{Membership, MemberType};

use crate::metastore::{Metastore, MetastoreResult};
use crate::types::{
    EntityCount, EntityHashRecord, SlotRole, Sync, SyncConnection, SyncCursorRecord, SyncJob,
    SyncJobStatus,
};
use crate::MetastoreError;

#[derive(Default)]
struct MetastoreState {
    source_connections: HashMap<Uuid, SourceConnectionConfig>,
    syncs: HashMap<Uuid, Sync>,
    jobs: HashMap<Uuid, SyncJob>,
    cursors: HashMap<Uuid, SyncCursorRecord>,
    entity_hashes: HashMap<(Uuid, Uuid, String), EntityHashRecord>,
    memberships: HashMap<Uuid, HashSet<Membership>>,
}

/// In-memory metastore. Every operation takes the single state lock, which
/// makes each compound operation a unit of work.
#[derive(Default)]
pub struct InMemoryMetastore {
    state: Mutex<MetastoreState>,
}

impl InMemoryMetastore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sync_mut(state: &mut MetastoreState, sync_id: Uuid) -> MetastoreResult<&mut Sync> {
    state
        .syncs
        .get_mut(&sync_id)
        .ok_or_else(|| MetastoreError::NotFound(format!("sync {sync_id}")))
}

#[async_trait]
impl Metastore for InMemoryMetastore {
    async fn create_source_connection(
        &self,
        config: SourceConnectionConfig,
    ) -> MetastoreResult<()> {
        let mut state = self.state.lock().await;
        if state.source_connections.contains_key(&config.id) {
            return Err(MetastoreError::AlreadyExists(format!(
                "source connection {}",
                config.id
            )));
        }
        state.source_connections.insert(config.id, config);
        Ok(())
    }

    async fn source_connection(&self, id: Uuid) -> MetastoreResult<SourceConnectionConfig> {
        let state = self.state.lock().await;
        state
            .source_connections
            .get(&id)
            .cloned()
            .ok_or_else(|| MetastoreError::NotFound(format!("source connection {id}")))
    }

    async fn delete_source_connection(&self, id: Uuid) -> MetastoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .source_connections
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| MetastoreError::NotFound(format!("source connection {id}")))
    }

    async fn create_sync(&self, sync: Sync) -> MetastoreResult<()> {
        let mut state = self.state.lock().await;
        if state.syncs.contains_key(&sync.id) {
            return Err(MetastoreError::AlreadyExists(format!("sync {}", sync.id)));
        }
        state.syncs.insert(sync.id, sync);
        Ok(())
    }

    async fn sync(&self, sync_id: Uuid) -> MetastoreResult<Sync> {
        let state = self.state.lock().await;
        state
            .syncs
            .get(&sync_id)
            .cloned()
            .ok_or_else(|| MetastoreError::NotFound(format!("sync {sync_id}")))
    }

    async fn attach_slot(&self, sync_id: Uuid, connection_id: Uuid) -> MetastoreResult<Sync> {
        let mut state = self.state.lock().await;
        let sync = sync_mut(&mut state, sync_id)?;
        if sync.slot(connection_id).is_some() {
            return Err(MetastoreError::AlreadyExists(format!(
                "slot {connection_id} on sync {sync_id}"
            )));
        }
        // The first destination becomes Active so the sync never sits with
        // destinations but no Active slot.
        let role = if sync.destination_slots().count() == 0 {
            SlotRole::Active
        } else {
            SlotRole::Shadow
        };
        sync.connections.push(SyncConnection {
            connection_id,
            role: Some(role),
        });
        Ok(sync.clone())
    }

    async fn set_slot_role(
        &self,
        sync_id: Uuid,
        connection_id: Uuid,
        role: SlotRole,
    ) -> MetastoreResult<Sync> {
        let mut state = self.state.lock().await;
        let sync = sync_mut(&mut state, sync_id)?;
        let current_role = sync
            .slot(connection_id)
            .ok_or_else(|| {
                MetastoreError::NotFound(format!("slot {connection_id} on sync {sync_id}"))
            })?
            .role;
        let Some(current_role) = current_role else {
            return Err(MetastoreError::InvariantViolation(
                "source slots have no role".to_string(),
            ));
        };
        if current_role == SlotRole::Active && role != SlotRole::Active {
            // Demoting the sole remaining Active would leave destinations
            // without an Active slot.
            return Err(MetastoreError::InvariantViolation(
                "cannot demote the sole Active destination; promote another slot instead"
                    .to_string(),
            ));
        }
        if role == SlotRole::Active {
            for slot in sync.connections.iter_mut() {
                if slot.role == Some(SlotRole::Active) && slot.connection_id != connection_id {
                    slot.role = Some(SlotRole::Shadow);
                }
            }
        }
        for slot in sync.connections.iter_mut() {
            if slot.connection_id == connection_id {
                slot.role = Some(role);
            }
        }
        debug_assert!(sync.num_active_slots() <= 1);
        Ok(sync.clone())
    }

    async fn switch_active(
        &self,
        sync_id: Uuid,
        shadow_connection_id: Uuid,
    ) -> MetastoreResult<Sync> {
        let mut state = self.state.lock().await;
        let sync = sync_mut(&mut state, sync_id)?;
        match sync.slot(shadow_connection_id).map(|slot| slot.role) {
            None => {
                return Err(MetastoreError::NotFound(format!(
                    "slot {shadow_connection_id} on sync {sync_id}"
                )))
            }
            Some(Some(SlotRole::Shadow)) => {}
            Some(role) => {
                return Err(MetastoreError::InvariantViolation(format!(
                    "switch requires a Shadow slot, found {role:?}"
                )))
            }
        }
        for slot in sync.connections.iter_mut() {
            if slot.role == Some(SlotRole::Active) {
                slot.role = Some(SlotRole::Deprecated);
            }
        }
        for slot in sync.connections.iter_mut() {
            if slot.connection_id == shadow_connection_id {
                slot.role = Some(SlotRole::Active);
            }
        }
        debug_assert_eq!(sync.num_active_slots(), 1);
        Ok(sync.clone())
    }

    async fn remove_slot(&self, sync_id: Uuid, connection_id: Uuid) -> MetastoreResult<Sync> {
        let mut state = self.state.lock().await;
        let sync = sync_mut(&mut state, sync_id)?;
        match sync.slot(connection_id).map(|slot| slot.role) {
            None => {
                return Err(MetastoreError::NotFound(format!(
                    "slot {connection_id} on sync {sync_id}"
                )))
            }
            Some(None) => {
                return Err(MetastoreError::InvariantViolation(
                    "sources cannot be removed".to_string(),
                ))
            }
            Some(Some(SlotRole::Active)) => {
                return Err(MetastoreError::InvariantViolation(
                    "Active destinations cannot be removed; demote first".to_string(),
                ))
            }
            Some(Some(_)) => {}
        }
        sync.connections
            .retain(|slot| slot.connection_id != connection_id);
        Ok(sync.clone())
    }

    async fn create_job(&self, sync_id: Uuid) -> MetastoreResult<SyncJob> {
        let mut state = self.state.lock().await;
        if !state.syncs.contains_key(&sync_id) {
            return Err(MetastoreError::NotFound(format!("sync {sync_id}")));
        }
        let live_job_exists = state
            .jobs
            .values()
            .any(|job| job.sync_id == sync_id && job.status.is_live());
        if live_job_exists {
            return Err(MetastoreError::JobAlreadyRunning { sync_id });
        }
        let job = SyncJob::new(sync_id);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn job(&self, job_id: Uuid) -> MetastoreResult<SyncJob> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| MetastoreError::NotFound(format!("job {job_id}")))
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: SyncJobStatus,
        error: Option<String>,
        stats: Option<SyncStats>,
    ) -> MetastoreResult<SyncJob> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| MetastoreError::NotFound(format!("job {job_id}")))?;
        if !job.status.can_transition_to(status) {
            return Err(MetastoreError::IllegalJobTransition {
                from: job.status,
                to: status,
            });
        }
        let now = OffsetDateTime::now_utc();
        job.status = status;
        match status {
            SyncJobStatus::Running => job.started_at = Some(now),
            status if status.is_terminal() => job.completed_at = Some(now),
            _ => {}
        }
        if let Some(error) = error {
            job.error = Some(error);
        }
        if let Some(stats) = stats {
            job.stats = stats;
        }
        Ok(job.clone())
    }

    async fn record_job_progress(&self, job_id: Uuid, stats: SyncStats) -> MetastoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| MetastoreError::NotFound(format!("job {job_id}")))?;
        job.stats = stats;
        job.last_progress_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn list_live_jobs(&self) -> MetastoreResult<Vec<SyncJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status.is_live())
            .cloned()
            .collect())
    }

    async fn cursor(&self, sync_id: Uuid) -> MetastoreResult<Option<SyncCursorRecord>> {
        let state = self.state.lock().await;
        Ok(state.cursors.get(&sync_id).cloned())
    }

    async fn upsert_cursor(
        &self,
        sync_id: Uuid,
        cursor_field: Option<String>,
        cursor_data: JsonValue,
    ) -> MetastoreResult<SyncCursorRecord> {
        let mut state = self.state.lock().await;
        let record = SyncCursorRecord {
            sync_id,
            cursor_field,
            cursor_data,
            last_updated: OffsetDateTime::now_utc(),
        };
        state.cursors.insert(sync_id, record.clone());
        Ok(record)
    }

    async fn update_cursor_data(
        &self,
        sync_id: Uuid,
        cursor_data: JsonValue,
    ) -> MetastoreResult<Option<SyncCursorRecord>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.cursors.get_mut(&sync_id) else {
            return Ok(None);
        };
        record.cursor_data = cursor_data;
        record.last_updated = OffsetDateTime::now_utc();
        Ok(Some(record.clone()))
    }

    async fn delete_cursor(&self, sync_id: Uuid) -> MetastoreResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.cursors.remove(&sync_id).is_some())
    }

    async fn entity_hash(
        &self,
        sync_id: Uuid,
        source_connection_id: Uuid,
        entity_id: &str,
    ) -> MetastoreResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .entity_hashes
            .get(&(sync_id, source_connection_id, entity_id.to_string()))
            .map(|record| record.content_hash.clone()))
    }

    async fn upsert_entity_hash(&self, record: EntityHashRecord) -> MetastoreResult<()> {
        let mut state = self.state.lock().await;
        state.entity_hashes.insert(
            (
                record.sync_id,
                record.source_connection_id,
                record.entity_id.clone(),
            ),
            record,
        );
        Ok(())
    }

    async fn delete_entity_hashes(
        &self,
        sync_id: Uuid,
        source_connection_id: Uuid,
        entity_ids: &[String],
    ) -> MetastoreResult<()> {
        let mut state = self.state.lock().await;
        for entity_id in entity_ids {
            state
                .entity_hashes
                .remove(&(sync_id, source_connection_id, entity_id.clone()));
        }
        Ok(())
    }

    async fn list_entity_ids(
        &self,
        sync_id: Uuid,
        source_connection_id: Uuid,
    ) -> MetastoreResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .entity_hashes
            .keys()
            .filter(|(stored_sync_id, stored_source_id, _)| {
                *stored_sync_id == sync_id && *stored_source_id == source_connection_id
            })
            .map(|(_, _, entity_id)| entity_id.clone())
            .collect())
    }

    async fn entity_counts(&self, collection_id: Uuid) -> MetastoreResult<Vec<EntityCount>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
        for record in state.entity_hashes.values() {
            if record.collection_id != collection_id {
                continue;
            }
            *counts
                .entry((record.source_name.clone(), record.entity_type.clone()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((source_name, entity_type), count)| EntityCount {
                source_name,
                entity_type,
                count,
            })
            .collect())
    }

    async fn upsert_memberships(
        &self,
        source_connection_id: Uuid,
        memberships: &[Membership],
    ) -> MetastoreResult<u64> {
        let mut state = self.state.lock().await;
        let rows = state.memberships.entry(source_connection_id).or_default();
        for membership in memberships {
            rows.replace(membership.clone());
        }
        Ok(memberships.len() as u64)
    }

    async fn delete_memberships(
        &self,
        source_connection_id: Uuid,
        keys: &[(String, MemberType, String)],
    ) -> MetastoreResult<u64> {
        let mut state = self.state.lock().await;
        let Some(rows) = state.memberships.get_mut(&source_connection_id) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|membership| {
            !keys.iter().any(|(member_id, member_type, group_id)| {
                membership.member_id == *member_id
                    && membership.member_type == *member_type
                    && membership.group_id == *group_id
            })
        });
        Ok((before - rows.len()) as u64)
    }

    async fn delete_memberships_by_member(
        &self,
        source_connection_id: Uuid,
        members: &[(String, MemberType)],
    ) -> MetastoreResult<u64> {
        let mut state = self.state.lock().await;
        let Some(rows) = state.memberships.get_mut(&source_connection_id) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|membership| {
            !members.iter().any(|(member_id, member_type)| {
                membership.member_id == *member_id && membership.member_type == *member_type
            })
        });
        Ok((before - rows.len()) as u64)
    }

    async fn delete_memberships_by_group(
        &self,
        source_connection_id: Uuid,
        groups: &[String],
    ) -> MetastoreResult<u64> {
        let mut state = self.state.lock().await;
        let Some(rows) = state.memberships.get_mut(&source_connection_id) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|membership| !groups.contains(&membership.group_id));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sync_with_source(metastore: &InMemoryMetastore) -> Sync {
        let sync = Sync::new("test-sync", Uuid::new_v4(), Uuid::new_v4());
        metastore.create_sync(sync.clone()).await.unwrap();
        sync
    }

    #[tokio::test]
    async fn test_only_one_live_job_per_sync() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;

        let job = metastore.create_job(sync.id).await.unwrap();
        let error = metastore.create_job(sync.id).await.unwrap_err();
        assert!(matches!(error, MetastoreError::JobAlreadyRunning { .. }));

        metastore
            .update_job_status(job.id, SyncJobStatus::Running, None, None)
            .await
            .unwrap();
        assert!(metastore.create_job(sync.id).await.is_err());

        metastore
            .update_job_status(job.id, SyncJobStatus::Completed, None, None)
            .await
            .unwrap();
        assert!(metastore.create_job(sync.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_illegal_job_transition_rejected() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;
        let job = metastore.create_job(sync.id).await.unwrap();
        let error = metastore
            .update_job_status(job.id, SyncJobStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, MetastoreError::IllegalJobTransition { .. }));
    }

    #[tokio::test]
    async fn test_first_attached_destination_becomes_active() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();

        let sync_state = metastore.attach_slot(sync.id, d1).await.unwrap();
        assert_eq!(sync_state.slot(d1).unwrap().role, Some(SlotRole::Active));

        let sync_state = metastore.attach_slot(sync.id, d2).await.unwrap();
        assert_eq!(sync_state.slot(d2).unwrap().role, Some(SlotRole::Shadow));
        assert_eq!(sync_state.num_active_slots(), 1);
    }

    #[tokio::test]
    async fn test_switch_promotes_shadow_and_deprecates_active() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        metastore.attach_slot(sync.id, d1).await.unwrap();
        metastore.attach_slot(sync.id, d2).await.unwrap();

        let sync_state = metastore.switch_active(sync.id, d2).await.unwrap();
        assert_eq!(sync_state.slot(d2).unwrap().role, Some(SlotRole::Active));
        assert_eq!(sync_state.slot(d1).unwrap().role, Some(SlotRole::Deprecated));
        assert_eq!(sync_state.num_active_slots(), 1);
    }

    #[tokio::test]
    async fn test_promote_a_then_b_equals_promote_b() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;
        let d0 = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        metastore.attach_slot(sync.id, d0).await.unwrap();
        metastore.attach_slot(sync.id, a).await.unwrap();
        metastore.attach_slot(sync.id, b).await.unwrap();

        metastore.set_slot_role(sync.id, a, SlotRole::Active).await.unwrap();
        let sync_state = metastore.set_slot_role(sync.id, b, SlotRole::Active).await.unwrap();

        // a ends in Shadow, exactly as if b had been promoted directly.
        assert_eq!(sync_state.slot(a).unwrap().role, Some(SlotRole::Shadow));
        assert_eq!(sync_state.slot(b).unwrap().role, Some(SlotRole::Active));
        assert_eq!(sync_state.num_active_slots(), 1);
    }

    #[tokio::test]
    async fn test_sole_active_cannot_be_demoted_or_removed() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;
        let d1 = Uuid::new_v4();
        metastore.attach_slot(sync.id, d1).await.unwrap();

        assert!(metastore
            .set_slot_role(sync.id, d1, SlotRole::Shadow)
            .await
            .is_err());
        assert!(metastore.remove_slot(sync.id, d1).await.is_err());
    }

    #[tokio::test]
    async fn test_source_slot_cannot_be_removed_or_assigned_a_role() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;
        assert!(metastore
            .remove_slot(sync.id, sync.source_connection_id)
            .await
            .is_err());
        assert!(metastore
            .set_slot_role(sync.id, sync.source_connection_id, SlotRole::Active)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cursor_crud() {
        let metastore = InMemoryMetastore::new();
        let sync = sync_with_source(&metastore).await;
        assert!(metastore.cursor(sync.id).await.unwrap().is_none());

        metastore
            .upsert_cursor(
                sync.id,
                Some("updated_at".to_string()),
                serde_json::json!({"updated_at": "2024-01-01T00:00:00Z"}),
            )
            .await
            .unwrap();
        let record = metastore.cursor(sync.id).await.unwrap().unwrap();
        assert_eq!(record.cursor_field.as_deref(), Some("updated_at"));

        let updated = metastore
            .update_cursor_data(sync.id, serde_json::json!({"updated_at": "2024-02-01T00:00:00Z"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.cursor_data["updated_at"], "2024-02-01T00:00:00Z");

        assert!(metastore.delete_cursor(sync.id).await.unwrap());
        assert!(!metastore.delete_cursor(sync.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_membership_bulk_operations() {
        let metastore = InMemoryMetastore::new();
        let source_connection_id = Uuid::new_v4();
        let memberships: Vec<Membership> = (0..4)
            .map(|i| Membership {
                member_id: format!("user-{i}"),
                member_type: MemberType::User,
                group_id: if i % 2 == 0 { "g-even" } else { "g-odd" }.to_string(),
            })
            .collect();
        assert_eq!(
            metastore
                .upsert_memberships(source_connection_id, &memberships)
                .await
                .unwrap(),
            4
        );
        assert_eq!(
            metastore
                .delete_memberships_by_group(source_connection_id, &["g-even".to_string()])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            metastore
                .delete_memberships_by_member(
                    source_connection_id,
                    &[("user-1".to_string(), MemberType::User)],
                )
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_entity_counts_group_by_source_and_type() {
        let metastore = InMemoryMetastore::new();
        let collection_id = Uuid::new_v4();
        let sync_id = Uuid::new_v4();
        let source_connection_id = Uuid::new_v4();
        for (i, entity_type) in ["slack.message", "slack.message", "slack.channel"]
            .iter()
            .enumerate()
        {
            metastore
                .upsert_entity_hash(EntityHashRecord {
                    sync_id,
                    source_connection_id,
                    collection_id,
                    entity_id: format!("E{i}"),
                    content_hash: format!("hash-{i}"),
                    entity_type: entity_type.to_string(),
                    source_name: "slack".to_string(),
                })
                .await
                .unwrap();
        }
        let counts = metastore.entity_counts(collection_id).await.unwrap();
        assert_eq!(
            counts,
            vec![
                EntityCount {
                    source_name: "slack".to_string(),
                    entity_type: "slack.channel".to_string(),
                    count: 1,
                },
                EntityCount {
                    source_name: "slack".to_string(),
                    entity_type: "slack.message".to_string(),
                    count: 2,
                },
            ]
        );
    }
}
