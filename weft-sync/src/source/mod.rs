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

//! # Sources
//!
//! Weft gets its data from `Sources`. A source pushes fully-identified
//! entities (`entity_id`, `breadcrumbs`, `name`) into an [`EntitySink`]; the
//! sink is the write end of the bounded read-ahead stream the orchestrator
//! consumes, so back-pressure is implicit in `send`.
//!
//! A source instance is used by exactly one job and must not share mutable
//! state between calls. Sources honor cancellation at every suspension
//! point: `EntitySink::send` observes the job's cancellation token, and any
//! network call a source makes should do the same.
//!
//! Incremental syncs: when `supports_continuous` and a cursor is supplied,
//! the source emits only records changed at or after the cursor value under
//! its own ordering, and publishes an advanced cursor at the end of the run.
//! Federated-search-only sources never produce; the factory refuses to build
//! a sync pipeline for them.

mod replay_source;
mod stream;
mod vec_source;

pub use replay_source::ReplaySource;
pub use stream::{ProducerOutcome, SourceStream};
pub use vec_source::VecSource;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use weft_common::ErrorSeverity;
use weft_config::{AuthMethod, OAuthType, SourceConnectionConfig};
use weft_entities::Entity;
use weft_storage::SnapshotStore;

use crate::cursor::{CursorUpdate, SyncCursor};
use crate::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("file skipped: {reason}")]
    FileSkipped { reason: String },
    #[error("download failed for `{url}`: {message}")]
    DownloadFailure { url: String, message: String },
    #[error("source rate limit exceeded, retry after {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },
    #[error("source authentication failed: {0}")]
    Auth(String),
    #[error("source api error ({status:?}): {message}")]
    Api { status: Option<u16>, message: String },
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("entity stream closed by consumer")]
    StreamClosed,
    #[error("source cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SourceError::FileSkipped { .. }
            | SourceError::Unsupported(_)
            | SourceError::Cancelled => ErrorSeverity::Expected,
            SourceError::DownloadFailure { .. }
            | SourceError::RateLimited { .. }
            | SourceError::Auth(_)
            | SourceError::Api { .. }
            | SourceError::StreamClosed => ErrorSeverity::Operational,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SourceCapabilities {
    pub supports_continuous: bool,
    pub federated_search: bool,
}

/// How a source class authenticates; consumed by the connection lifecycle
/// outside the sync core.
#[derive(Clone, Debug)]
pub struct SourceAuthSpec {
    pub methods: Vec<AuthMethod>,
    pub oauth_type: Option<OAuthType>,
}

impl Default for SourceAuthSpec {
    fn default() -> Self {
        Self {
            methods: vec![AuthMethod::Direct],
            oauth_type: None,
        }
    }
}

/// Cancellation-aware write end of the source stream.
#[derive(Clone)]
pub struct EntitySink {
    tx: tokio::sync::mpsc::Sender<Entity>,
    cancel: CancellationToken,
}

impl EntitySink {
    pub(crate) fn new(
        tx: tokio::sync::mpsc::Sender<Entity>,
        cancel: CancellationToken,
    ) -> Self {
        Self { tx, cancel }
    }

    /// Sends one entity downstream, suspending under back-pressure.
    pub async fn send(&self, entity: Entity) -> Result<(), SourceError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            sent = self.tx.send(entity) => sent.map_err(|_| SourceError::StreamClosed),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A source produces a lazy, finite entity stream and/or answers federated
/// searches.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// A name identifying the type of source.
    fn name(&self) -> String;

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    fn auth_spec(&self) -> SourceAuthSpec {
        SourceAuthSpec::default()
    }

    /// Emits the full or incremental entity universe into `sink`.
    async fn produce(&mut self, sink: &EntitySink) -> Result<(), SourceError>;

    /// Federated search: up to `limit` entities answering `query`. Used when
    /// the source forbids full sync due to rate limits.
    async fn search(&mut self, _query: &str, _limit: usize) -> Result<Vec<Entity>, SourceError> {
        Err(SourceError::Unsupported(
            "this source does not support federated search".to_string(),
        ))
    }

    /// The advance cursor to persist after a successful run, if any.
    fn published_cursor(&self) -> Option<CursorUpdate> {
        None
    }

    /// Source-defined staleness check over persisted cursor data.
    fn cursor_is_expired(&self, _cursor_data: &JsonValue, _max_age_days: i64) -> bool {
        false
    }

    /// Source-defined periodic-full-sync check over persisted cursor data.
    fn needs_periodic_full_sync(&self, _cursor_data: &JsonValue, _interval_days: i64) -> bool {
        false
    }

    /// Diagnostic state; content varies per source.
    fn observable_state(&self) -> JsonValue {
        json!({})
    }
}

/// Everything a factory needs to construct a source instance for one job.
pub struct SourceRuntimeArgs {
    pub source_connection: SourceConnectionConfig,
    pub cursor: SyncCursor,
    pub force_full_sync: bool,
    pub snapshot_store: Option<SnapshotStore>,
}

#[async_trait]
pub trait SourceFactory: Send + Sync + 'static {
    fn short_name(&self) -> &'static str;

    async fn create(&self, runtime: SourceRuntimeArgs) -> Result<Box<dyn Source>, SyncError>;
}

/// Registry of source factories keyed by short name.
#[derive(Default)]
pub struct SourceLoader {
    factories: HashMap<&'static str, Arc<dyn SourceFactory>>,
}

impl SourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, factory: Arc<dyn SourceFactory>) {
        self.factories.insert(factory.short_name(), factory);
    }

    pub async fn load(
        &self,
        runtime: SourceRuntimeArgs,
    ) -> Result<Box<dyn Source>, SyncError> {
        let short_name = runtime.source_connection.short_name.clone();
        let factory = self.factories.get(short_name.as_str()).ok_or_else(|| {
            SyncError::Config(weft_config::ConfigError::Invalid(format!(
                "unknown source `{short_name}`"
            )))
        })?;
        let source = factory.create(runtime).await?;
        if source.capabilities().federated_search {
            // Federated search is strictly mutually exclusive with `produce`
            // in the sync pipeline.
            return Err(SyncError::Config(weft_config::ConfigError::Invalid(format!(
                "source `{short_name}` is federated-search only and cannot be synced"
            ))));
        }
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    struct FederatedOnlySource;

    #[async_trait]
    impl Source for FederatedOnlySource {
        fn name(&self) -> String {
            "FederatedOnlySource".to_string()
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                supports_continuous: false,
                federated_search: true,
            }
        }

        async fn produce(&mut self, _sink: &EntitySink) -> Result<(), SourceError> {
            Err(SourceError::Unsupported("federated only".to_string()))
        }
    }

    struct FederatedOnlyFactory;

    #[async_trait]
    impl SourceFactory for FederatedOnlyFactory {
        fn short_name(&self) -> &'static str {
            "federated"
        }

        async fn create(
            &self,
            _runtime: SourceRuntimeArgs,
        ) -> Result<Box<dyn Source>, SyncError> {
            Ok(Box::new(FederatedOnlySource))
        }
    }

    fn runtime_args(short_name: &str) -> SourceRuntimeArgs {
        SourceRuntimeArgs {
            source_connection: SourceConnectionConfig::new(short_name, Uuid::new_v4()),
            cursor: SyncCursor::empty(),
            force_full_sync: false,
            snapshot_store: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_source_is_a_config_error() {
        let loader = SourceLoader::new();
        let error = loader.load(runtime_args("nope")).await.map(|_| ()).unwrap_err();
        assert!(matches!(error, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_federated_only_source_cannot_be_synced() {
        let mut loader = SourceLoader::new();
        loader.add_source(Arc::new(FederatedOnlyFactory));
        let error = loader.load(runtime_args("federated")).await.map(|_| ()).unwrap_err();
        assert!(matches!(error, SyncError::Config(_)));
    }
}
