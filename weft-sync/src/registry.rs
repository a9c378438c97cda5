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

//! Destination slot lifecycle.
//!
//! Slots carry one of three roles: Active (serving), Shadow (receiving
//! writes, not serving), Deprecated (kept for rollback). Role transitions
//! run inside the metastore's unit of work, so "at most one Active slot" is
//! never observably violated.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use weft_config::SyncExecutionConfig;
use weft_metastore::{Metastore, SlotRole, Sync};
use weft_storage::SnapshotStore;

use crate::SyncError;

pub struct DestinationRegistry {
    metastore: Arc<dyn Metastore>,
    snapshot_store: Option<SnapshotStore>,
}

impl DestinationRegistry {
    pub fn new(metastore: Arc<dyn Metastore>, snapshot_store: Option<SnapshotStore>) -> Self {
        Self {
            metastore,
            snapshot_store,
        }
    }

    /// Attaches a destination connection; the first destination becomes
    /// Active, later ones Shadow.
    pub async fn attach(&self, sync_id: Uuid, connection_id: Uuid) -> Result<Sync, SyncError> {
        let sync = self.metastore.attach_slot(sync_id, connection_id).await?;
        info!(%sync_id, %connection_id, "destination-attached");
        Ok(sync)
    }

    /// Attach plus, when a captured snapshot exists, a ready-to-run replay
    /// configuration that backfills the new destination.
    pub async fn fork(
        &self,
        sync_id: Uuid,
        connection_id: Uuid,
        backfill: bool,
    ) -> Result<(Sync, Option<SyncExecutionConfig>), SyncError> {
        let sync = self.attach(sync_id, connection_id).await?;
        if !backfill {
            return Ok((sync, None));
        }
        let snapshot_available = match &self.snapshot_store {
            Some(store) => store.snapshot_exists(sync_id).await?,
            None => false,
        };
        if !snapshot_available {
            info!(%sync_id, "fork requested backfill but no snapshot exists");
            return Ok((sync, None));
        }
        Ok((
            sync,
            Some(SyncExecutionConfig::replay_to_destination(connection_id)),
        ))
    }

    /// Promotes a Shadow to Active; the prior Active becomes Deprecated.
    pub async fn switch(&self, sync_id: Uuid, shadow_connection_id: Uuid) -> Result<Sync, SyncError> {
        let sync = self
            .metastore
            .switch_active(sync_id, shadow_connection_id)
            .await?;
        info!(%sync_id, %shadow_connection_id, "destination-switched");
        Ok(sync)
    }

    pub async fn set_role(
        &self,
        sync_id: Uuid,
        connection_id: Uuid,
        role: SlotRole,
    ) -> Result<Sync, SyncError> {
        Ok(self
            .metastore
            .set_slot_role(sync_id, connection_id, role)
            .await?)
    }

    pub async fn remove(&self, sync_id: Uuid, connection_id: Uuid) -> Result<Sync, SyncError> {
        Ok(self.metastore.remove_slot(sync_id, connection_id).await?)
    }
}
