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

//! # Sync cursors
//!
//! A cursor is per-sync durable state: a `cursor_field` naming what the
//! source tracks, and an opaque JSON payload whose shape belongs to the
//! source class. A source may publish a dual cursor (the advance value plus
//! a lagging `{field}_overlap` partner) so the next incremental pass
//! re-reads a small window under clock skew. The service copies and reports
//! the overlap partner; only the owning source interprets it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use weft_config::SyncExecutionConfig;
use weft_metastore::{Metastore, MetastoreError, SyncCursorRecord};

const OVERLAP_SUFFIX: &str = "_overlap";

/// Cursor value a source publishes at the end of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct CursorUpdate {
    pub cursor_field: Option<String>,
    pub cursor_data: JsonValue,
}

/// Cursor state materialized for one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncCursor {
    pub cursor_field: Option<String>,
    pub cursor_data: Option<JsonValue>,
}

impl SyncCursor {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor_data.is_none()
    }

    pub fn overlap_key(cursor_field: &str) -> String {
        format!("{cursor_field}{OVERLAP_SUFFIX}")
    }
}

/// Diagnostic view of a stored cursor, including dual-cursor state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CursorSummary {
    pub status: String,
    pub cursor_field: Option<String>,
    pub last_updated: Option<String>,
    pub data_keys: Vec<String>,
    pub has_dual_cursor: bool,
    pub overlap_keys: Vec<String>,
    pub original_values: Map<String, JsonValue>,
    pub overlap_values: Map<String, JsonValue>,
}

/// Cursor persistence on top of the metastore.
#[derive(Clone)]
pub struct SyncCursorService {
    metastore: Arc<dyn Metastore>,
}

impl SyncCursorService {
    pub fn new(metastore: Arc<dyn Metastore>) -> Self {
        Self { metastore }
    }

    /// Cursor data for a sync; empty object when no cursor exists or the
    /// lookup fails (a missing cursor just means a full sync).
    pub async fn get_cursor_data(&self, sync_id: Uuid) -> JsonValue {
        match self.metastore.cursor(sync_id).await {
            Ok(Some(record)) => record.cursor_data,
            Ok(None) => JsonValue::Object(Map::new()),
            Err(error) => {
                warn!(%sync_id, %error, "failed to load cursor data");
                JsonValue::Object(Map::new())
            }
        }
    }

    pub async fn get_cursor_field(&self, sync_id: Uuid) -> Option<String> {
        match self.metastore.cursor(sync_id).await {
            Ok(record) => record.and_then(|record| record.cursor_field),
            Err(error) => {
                warn!(%sync_id, %error, "failed to load cursor field");
                None
            }
        }
    }

    pub async fn create_or_update(
        &self,
        sync_id: Uuid,
        cursor_field: Option<String>,
        cursor_data: JsonValue,
    ) -> Result<SyncCursorRecord, MetastoreError> {
        let record = self
            .metastore
            .upsert_cursor(sync_id, cursor_field, cursor_data)
            .await?;
        info!(%sync_id, "cursor-published");
        Ok(record)
    }

    pub async fn update_cursor_data(
        &self,
        sync_id: Uuid,
        cursor_data: JsonValue,
    ) -> Result<Option<SyncCursorRecord>, MetastoreError> {
        let updated = self.metastore.update_cursor_data(sync_id, cursor_data).await?;
        if updated.is_none() {
            warn!(%sync_id, "no cursor found to update");
        }
        Ok(updated)
    }

    pub async fn delete(&self, sync_id: Uuid) -> Result<bool, MetastoreError> {
        self.metastore.delete_cursor(sync_id).await
    }

    /// Materializes the cursor for a run, applying the loading rules:
    /// `force_full_sync` wins over everything, then `skip_cursor_load`,
    /// otherwise the stored cursor is used for an incremental pass.
    pub async fn load_for_run(
        &self,
        sync_id: Uuid,
        execution_config: &SyncExecutionConfig,
        force_full_sync: bool,
    ) -> SyncCursor {
        if force_full_sync {
            info!(%sync_id, "FORCE FULL SYNC: cursor materialized empty");
            return SyncCursor::empty();
        }
        if execution_config.skip_cursor_load {
            info!(%sync_id, "SKIP CURSOR LOAD: cursor materialized empty");
            return SyncCursor::empty();
        }
        match self.metastore.cursor(sync_id).await {
            Ok(Some(record)) => {
                info!(%sync_id, cursor_field = ?record.cursor_field, "Incremental sync: cursor loaded");
                SyncCursor {
                    cursor_field: record.cursor_field,
                    cursor_data: Some(record.cursor_data),
                }
            }
            Ok(None) => SyncCursor::empty(),
            Err(error) => {
                warn!(%sync_id, %error, "cursor load failed, falling back to full sync");
                SyncCursor::empty()
            }
        }
    }

    /// Diagnostic summary, useful for monitoring dual-cursor state.
    pub async fn summary(&self, sync_id: Uuid) -> CursorSummary {
        let record = match self.metastore.cursor(sync_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return CursorSummary {
                    status: "no_cursor".to_string(),
                    ..CursorSummary::default()
                }
            }
            Err(error) => {
                return CursorSummary {
                    status: format!("error: {error}"),
                    ..CursorSummary::default()
                }
            }
        };
        let mut summary = CursorSummary {
            status: "active".to_string(),
            cursor_field: record.cursor_field.clone(),
            last_updated: format_rfc3339(record.last_updated),
            ..CursorSummary::default()
        };
        let Some(data) = record.cursor_data.as_object() else {
            return summary;
        };
        summary.data_keys = data.keys().cloned().collect();
        if let Some(cursor_field) = &record.cursor_field {
            if let Some(value) = data.get(cursor_field) {
                summary
                    .original_values
                    .insert(cursor_field.clone(), value.clone());
            }
        }
        for (key, value) in data {
            if key.ends_with(OVERLAP_SUFFIX) {
                summary.has_dual_cursor = true;
                summary.overlap_keys.push(key.clone());
                summary.overlap_values.insert(key.clone(), value.clone());
            }
        }
        summary
    }
}

fn format_rfc3339(datetime: OffsetDateTime) -> Option<String> {
    datetime
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}
