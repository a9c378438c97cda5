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

mod execution;
mod source_config;

pub use execution::{DestinationStrategy, SyncExecutionConfig};
pub use source_config::{
    AuthMethod, AuthState, OAuthType, SourceConnectionConfig, SourceCredentials,
};

use weft_common::ErrorSeverity;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid cron expression `{expression}`: {message}")]
    InvalidSchedule { expression: String, message: String },
}

impl ConfigError {
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Expected
    }
}
