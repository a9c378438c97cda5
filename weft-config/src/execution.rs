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
use tracing::warn;
use uuid::Uuid;

use crate::ConfigError;

/// Which destination slots a sync run targets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStrategy {
    ActiveOnly,
    ShadowOnly,
    All,
    #[default]
    ActiveAndShadow,
}

impl DestinationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationStrategy::ActiveOnly => "active_only",
            DestinationStrategy::ShadowOnly => "shadow_only",
            DestinationStrategy::All => "all",
            DestinationStrategy::ActiveAndShadow => "active_and_shadow",
        }
    }
}

/// Per-run knobs of the sync pipeline.
///
/// The defaults describe a regular production sync. The presets describe the
/// two special runs: capturing a snapshot without touching destinations, and
/// replaying a snapshot into a single destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncExecutionConfig {
    pub destination_strategy: DestinationStrategy,
    /// Explicit destination connection ids. Overrides `destination_strategy`.
    #[serde(default)]
    pub target_destinations: Vec<Uuid>,
    #[serde(default)]
    pub exclude_destinations: Vec<Uuid>,

    pub enable_vector_handlers: bool,
    pub enable_raw_data_handler: bool,
    pub enable_access_control_handler: bool,

    pub skip_hash_comparison: bool,
    pub skip_hash_updates: bool,
    pub skip_cursor_load: bool,
    pub skip_cursor_updates: bool,

    pub max_workers: usize,
    pub stream_buffer_size: usize,
    pub batch_size: usize,

    /// When set, the run replays the captured snapshot into this destination
    /// instead of pulling from the live source.
    #[serde(default)]
    pub replay_target_destination_id: Option<Uuid>,
}

impl Default for SyncExecutionConfig {
    fn default() -> Self {
        Self {
            destination_strategy: DestinationStrategy::ActiveAndShadow,
            target_destinations: Vec::new(),
            exclude_destinations: Vec::new(),
            enable_vector_handlers: true,
            enable_raw_data_handler: true,
            enable_access_control_handler: true,
            skip_hash_comparison: false,
            skip_hash_updates: false,
            skip_cursor_load: false,
            skip_cursor_updates: false,
            max_workers: weft_common::DEFAULT_MAX_WORKERS,
            stream_buffer_size: weft_common::DEFAULT_STREAM_CAPACITY,
            batch_size: 100,
            replay_target_destination_id: None,
        }
    }
}

impl SyncExecutionConfig {
    /// Capture the source into the snapshot store only: no destinations, no
    /// hash or cursor mutations, so the run is repeatable.
    pub fn capture_only() -> Self {
        Self {
            enable_vector_handlers: false,
            enable_access_control_handler: false,
            skip_hash_updates: true,
            skip_cursor_load: true,
            skip_cursor_updates: true,
            ..Self::default()
        }
    }

    /// Replay the captured snapshot into one destination. The snapshot
    /// handler is disabled so the same data is not captured again, and the
    /// cursor is left untouched: a replay is not a source advance.
    pub fn replay_to_destination(destination_id: Uuid) -> Self {
        Self {
            target_destinations: vec![destination_id],
            enable_raw_data_handler: false,
            enable_access_control_handler: false,
            skip_hash_comparison: true,
            skip_hash_updates: true,
            skip_cursor_load: true,
            skip_cursor_updates: true,
            replay_target_destination_id: Some(destination_id),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be positive".to_string()));
        }
        if self.stream_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "stream_buffer_size must be positive".to_string(),
            ));
        }
        for destination_id in &self.target_destinations {
            if self.exclude_destinations.contains(destination_id) {
                return Err(ConfigError::Invalid(format!(
                    "destination {destination_id} is both targeted and excluded"
                )));
            }
        }
        if !self.target_destinations.is_empty()
            && self.destination_strategy != DestinationStrategy::ActiveAndShadow
        {
            warn!(
                strategy = self.destination_strategy.as_str(),
                "destination_strategy is ignored when target_destinations is set"
            );
        }
        if self.replay_target_destination_id.is_some() && self.enable_raw_data_handler {
            warn!("replay run would capture the same snapshot again; disable the raw data handler");
        }
        if self.skip_cursor_updates && !self.skip_hash_updates {
            warn!("skip_cursor_updates=true but skip_hash_updates=false; the next run will skip entities the cursor will re-emit");
        }
        Ok(())
    }
}
