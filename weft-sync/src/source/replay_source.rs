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

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};
use uuid::Uuid;

use weft_entities::Entity;
use weft_storage::SnapshotStore;

use crate::source::{EntitySink, Source, SourceCapabilities, SourceError};

/// Read-only source replaying a captured snapshot.
///
/// Reads `raw/{sync_id}/entities/*.json`, reconstructs each entity, and for
/// file entities restores the stored attachment into a process-local temp
/// directory, re-attached as `local_path`. Malformed records are logged and
/// skipped; a replay should salvage what it can.
pub struct ReplaySource {
    snapshot_sync_id: Uuid,
    store: SnapshotStore,
    restore_files: bool,
    /// Files must outlive this source: workers read them after the producer
    /// task has dropped it. The directory is removed by the job runner's
    /// scratch cleanup, not here.
    temp_dir: Option<PathBuf>,
    num_replayed: usize,
}

impl ReplaySource {
    pub fn new(snapshot_sync_id: Uuid, store: SnapshotStore) -> Self {
        Self {
            snapshot_sync_id,
            store,
            restore_files: true,
            temp_dir: None,
            num_replayed: 0,
        }
    }

    pub fn without_file_restore(mut self) -> Self {
        self.restore_files = false;
        self
    }

    async fn restore_file(&mut self, stored_file: &str) -> Option<PathBuf> {
        if !self.restore_files {
            return None;
        }
        let bytes = match self.store.read_file(stored_file).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(stored_file, %error, "failed to restore snapshot file");
                return None;
            }
        };
        if self.temp_dir.is_none() {
            match tempfile::Builder::new().prefix("weft-replay-").tempdir() {
                Ok(dir) => self.temp_dir = Some(dir.into_path()),
                Err(error) => {
                    warn!(%error, "failed to create replay temp dir");
                    return None;
                }
            }
        }
        let dir = self.temp_dir.as_ref()?;
        let file_name = stored_file.rsplit('/').next()?;
        let local_path = dir.join(file_name);
        match tokio::fs::write(&local_path, bytes).await {
            Ok(()) => Some(local_path),
            Err(error) => {
                warn!(stored_file, %error, "failed to materialize snapshot file");
                None
            }
        }
    }
}

#[async_trait]
impl Source for ReplaySource {
    fn name(&self) -> String {
        "ReplaySource".to_string()
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            supports_continuous: false,
            federated_search: false,
        }
    }

    async fn produce(&mut self, sink: &EntitySink) -> Result<(), SourceError> {
        match self.store.read_manifest(self.snapshot_sync_id).await {
            Ok(manifest) => info!(
                snapshot_sync_id = %self.snapshot_sync_id,
                entity_count = manifest.entity_count,
                source = %manifest.source_short_name,
                "replaying-snapshot"
            ),
            Err(error) => warn!(%error, "snapshot manifest unreadable, replaying entity files"),
        }
        let keys = self
            .store
            .list_entity_keys(self.snapshot_sync_id)
            .await
            .map_err(|error| SourceError::Api {
                status: None,
                message: format!("cannot list snapshot entities: {error}"),
            })?;
        for key in keys {
            if sink.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            let captured = match self.store.read_entity(&key).await {
                Ok(captured) => captured,
                Err(error) => {
                    warn!(%key, %error, "failed to reconstruct captured entity");
                    continue;
                }
            };
            let mut entity = captured.entity;
            if let Entity::File(file) = &mut entity {
                // The captured local_path points into the original job's
                // temp dir, which no longer exists.
                file.local_path = None;
                if let Some(stored_file) = &captured.stored_file {
                    file.local_path = self.restore_file(stored_file.as_str()).await;
                }
            }
            sink.send(entity).await?;
            self.num_replayed += 1;
        }
        Ok(())
    }

    fn observable_state(&self) -> JsonValue {
        json!({
            "snapshot_sync_id": self.snapshot_sync_id.to_string(),
            "num_replayed": self.num_replayed,
        })
    }
}
