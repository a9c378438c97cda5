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
use tracing::{debug, info};

use weft_common::retry::with_availability_retry;
use weft_entities::{
    ActionBatch, Entity, Membership, MembershipAction, MembershipBatch, MemberType,
};

use crate::context::SyncContext;
use crate::handlers::{ActionHandler, HandlerError};

/// Upsert chunk size; keeps each relational statement far under the bind
/// parameter limit.
const MEMBERSHIP_CHUNK_SIZE: usize = 2000;

/// Entity types carrying membership payloads end with this suffix.
const MEMBERSHIP_TYPE_SUFFIX: &str = ".membership";

/// Persists access-control membership rows.
///
/// Sources that sync permissions emit membership entities
/// (`{source}.membership` with `member_id`, `member_type`, `group_id`
/// fields). Full syncs upsert; deletes map to membership removal, and
/// orphaned membership entities are removed at cleanup.
pub struct MembershipHandler;

impl MembershipHandler {
    pub fn new() -> Self {
        Self
    }

    fn wrap(&self, source: weft_metastore::MetastoreError) -> HandlerError {
        HandlerError::Metastore {
            handler: self.name(),
            source,
        }
    }

    fn membership_from_entity(entity: &Entity) -> Option<MembershipAction> {
        if !entity.entity_type().ends_with(MEMBERSHIP_TYPE_SUFFIX) {
            return None;
        }
        let field = |name: &str| {
            entity
                .common()
                .fields
                .iter()
                .find(|field| field.name == name)
                .and_then(|field| field.value.as_str())
                .map(str::to_string)
        };
        let member_type = match field("member_type").as_deref() {
            Some("group") => MemberType::Group,
            _ => MemberType::User,
        };
        Some(MembershipAction::Upsert(Membership {
            member_id: field("member_id")?,
            member_type,
            group_id: field("group_id")?,
        }))
    }

    async fn apply(
        &self,
        batch: MembershipBatch,
        ctx: &SyncContext,
    ) -> Result<u64, HandlerError> {
        if !batch.has_mutations() {
            return Ok(0);
        }
        let source_connection_id = ctx.source_connection_id();
        let mut total = 0u64;
        for chunk in batch.upserts.chunks(MEMBERSHIP_CHUNK_SIZE) {
            total += with_availability_retry("membership_upsert", || {
                ctx.metastore.upsert_memberships(source_connection_id, chunk)
            })
            .await
            .map_err(|error| self.wrap(error))?;
            if batch.upserts.len() > MEMBERSHIP_CHUNK_SIZE {
                info!(
                    upserted = total,
                    total = batch.upserts.len(),
                    "membership-upsert-progress"
                );
            }
        }
        if !batch.deletes.is_empty() {
            total += with_availability_retry("membership_delete", || {
                ctx.metastore
                    .delete_memberships(source_connection_id, &batch.deletes)
            })
            .await
            .map_err(|error| self.wrap(error))?;
        }
        if !batch.delete_members.is_empty() {
            total += with_availability_retry("membership_delete_by_member", || {
                ctx.metastore
                    .delete_memberships_by_member(source_connection_id, &batch.delete_members)
            })
            .await
            .map_err(|error| self.wrap(error))?;
        }
        if !batch.delete_groups.is_empty() {
            total += with_availability_retry("membership_delete_by_group", || {
                ctx.metastore
                    .delete_memberships_by_group(source_connection_id, &batch.delete_groups)
            })
            .await
            .map_err(|error| self.wrap(error))?;
        }
        Ok(total)
    }
}

impl Default for MembershipHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for MembershipHandler {
    fn name(&self) -> String {
        "access_control".to_string()
    }

    async fn handle_batch(
        &self,
        batch: &ActionBatch,
        ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        let mut membership_batch = MembershipBatch::default();
        for processed in batch.inserts().chain(batch.updates()) {
            if let Some(action) = Self::membership_from_entity(&processed.entity) {
                membership_batch.push(action);
            }
        }
        let count = self.apply(membership_batch, ctx).await?;
        if count > 0 {
            debug!(count, "memberships-persisted");
        }
        Ok(())
    }

    async fn handle_orphan_cleanup(
        &self,
        orphan_entity_ids: &[String],
        ctx: &SyncContext,
    ) -> Result<(), HandlerError> {
        // Membership entity ids are `{member_id}:{group_id}`; a vanished
        // membership entity means the member left the group.
        let mut membership_batch = MembershipBatch::default();
        for entity_id in orphan_entity_ids {
            if let Some((member_id, group_id)) = entity_id.split_once(':') {
                membership_batch.push(MembershipAction::Delete {
                    member_id: member_id.to_string(),
                    member_type: MemberType::User,
                    group_id: group_id.to_string(),
                });
            }
        }
        self.apply(membership_batch, ctx).await.map(|_| ())
    }
}
