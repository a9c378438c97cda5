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

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_common::progress::SyncProgress;
use weft_config::{SourceConnectionConfig, SyncExecutionConfig};
use weft_metastore::{Metastore, Sync, SyncJob};

/// Everything a worker needs while processing one job. Cross-cutting
/// services are passed in explicitly; nothing in the hot path is global.
pub struct SyncContext {
    pub sync: Sync,
    pub job: SyncJob,
    pub source_connection: SourceConnectionConfig,
    pub execution_config: SyncExecutionConfig,
    pub force_full_sync: bool,
    /// Whether this run started without a cursor, i.e. covered the full
    /// entity universe. Orphan cleanup is only sound after a full pass.
    pub full_pass: bool,
    pub metastore: Arc<dyn Metastore>,
    pub progress: Arc<SyncProgress>,
    pub cancel: CancellationToken,
    /// Entity ids seen this run; diffed against the stored hash index to
    /// find orphans at finalization. Guarded by a std mutex: critical
    /// sections are short and never cross an await.
    seen_entity_ids: Mutex<HashSet<String>>,
}

impl SyncContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sync: Sync,
        job: SyncJob,
        source_connection: SourceConnectionConfig,
        execution_config: SyncExecutionConfig,
        force_full_sync: bool,
        full_pass: bool,
        metastore: Arc<dyn Metastore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sync,
            job,
            source_connection,
            execution_config,
            force_full_sync,
            full_pass,
            metastore,
            progress: Arc::new(SyncProgress::new()),
            cancel,
            seen_entity_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn sync_id(&self) -> Uuid {
        self.sync.id
    }

    pub fn collection_id(&self) -> Uuid {
        self.sync.collection_id
    }

    pub fn source_connection_id(&self) -> Uuid {
        self.source_connection.id
    }

    pub fn source_name(&self) -> &str {
        &self.source_connection.short_name
    }

    pub fn record_seen(&self, entity_id: &str) {
        if let Ok(mut seen) = self.seen_entity_ids.lock() {
            seen.insert(entity_id.to_string());
        }
    }

    pub fn seen_entity_ids(&self) -> HashSet<String> {
        self.seen_entity_ids
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}
