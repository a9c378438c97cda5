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

pub mod progress;
pub mod retry;
pub mod worker_pool;

use serde::{Deserialize, Serialize};

/// Default number of concurrent workers processing entities in a sync job.
pub const DEFAULT_MAX_WORKERS: usize = 20;

/// Pending submissions are capped at `max_workers * PENDING_FACTOR`.
///
/// Fast sources may build up a backlog for efficiency, slow sources will not
/// accumulate many pending tasks anyway, and memory stays bounded.
pub const PENDING_FACTOR: usize = 2;

/// Once throttled, submission resumes below `0.9 * max_pending` to avoid
/// flapping around the limit.
pub const THROTTLE_RELEASE_FACTOR: f64 = 0.9;

/// Capacity of the read-ahead queue between a source and the worker pool.
pub const DEFAULT_STREAM_CAPACITY: usize = 10_000;

/// Severity classification attached to every error kind for alerting.
///
/// - `Expected`: client errors, validation failures, expected edge cases.
/// - `Operational`: network issues, external service failures, retryable.
/// - `Critical`: bugs, invariant violations, unexpected failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Expected,
    Operational,
    Critical,
}

impl ErrorSeverity {
    pub fn should_alert(&self) -> bool {
        !matches!(self, ErrorSeverity::Expected)
    }
}
