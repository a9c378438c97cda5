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

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::ConfigError;

/// How a source authenticates against its upstream API.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Direct,
    OAuthBrowser,
    OAuthToken,
    AuthProvider,
}

/// Refresh behavior of OAuth sources.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthType {
    NoRefresh,
    WithRefresh,
    WithRotatingRefresh,
}

/// Lifecycle state of a source connection's authentication.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Pending,
    Active,
    Inactive,
    Syncing,
    Error,
    PendingAuth,
}

/// Credentials handed to a source at construction.
///
/// The OAuth ceremony itself happens outside the sync core; by the time a
/// source is built, the tokens are resolved.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SourceCredentials {
    None,
    AccessToken {
        access_token: String,
    },
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
    },
}

/// A configured integration: which source, with which credentials, feeding
/// which collection, on which schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConnectionConfig {
    pub id: Uuid,
    /// Source short name, e.g. `"slack"`, `"snapshot"`.
    pub short_name: String,
    pub collection_id: Uuid,
    pub credentials: SourceCredentials,
    /// Source-specific configuration, owned by the source class schema.
    #[serde(default)]
    pub config: JsonValue,
    pub auth_state: AuthState,
    /// Cron expression for scheduled runs, if any.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Field the source cursor tracks for continuous syncs.
    #[serde(default)]
    pub cursor_field: Option<String>,
}

impl SourceConnectionConfig {
    pub fn new(short_name: impl Into<String>, collection_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            short_name: short_name.into(),
            collection_id,
            credentials: SourceCredentials::None,
            config: JsonValue::Null,
            auth_state: AuthState::Pending,
            schedule: None,
            cursor_field: None,
        }
    }

    pub fn with_credentials(mut self, credentials: SourceCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    pub fn with_cursor_field(mut self, cursor_field: impl Into<String>) -> Self {
        self.cursor_field = Some(cursor_field.into());
        self
    }

    /// Validates the schedule, if present, as a cron expression.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.short_name.trim().is_empty() {
            return Err(ConfigError::Invalid("source short name is empty".to_string()));
        }
        if let Some(schedule) = &self.schedule {
            cron::Schedule::from_str(schedule).map_err(|error| ConfigError::InvalidSchedule {
                expression: schedule.clone(),
                message: error.to_string(),
            })?;
        }
        Ok(())
    }
}
