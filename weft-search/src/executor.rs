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

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use weft_destinations::Destination;
use weft_query::{CompiledQuery, SearchResult};

use crate::SearchError;

/// Runs compiled queries against the destination.
pub struct Executor {
    destination: Arc<dyn Destination>,
}

impl Executor {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self { destination }
    }

    /// Executes the query; returns results and wall time in milliseconds.
    pub async fn execute(
        &self,
        query: &CompiledQuery,
    ) -> Result<(Vec<SearchResult>, u64), SearchError> {
        let started = Instant::now();
        let results = self.destination.search(query).await?;
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            destination = %self.destination.name(),
            num_results = results.len(),
            duration_ms,
            "query-executed"
        );
        Ok((results, duration_ms))
    }
}
