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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// End-of-job roll-up published on the sync job record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub entities_inserted: u64,
    pub entities_updated: u64,
    pub entities_deleted: u64,
    pub entities_failed: u64,
    pub entities_skipped: u64,
}

impl SyncStats {
    pub fn total_processed(&self) -> u64 {
        self.entities_inserted
            + self.entities_updated
            + self.entities_deleted
            + self.entities_failed
            + self.entities_skipped
    }
}

/// Lock-free progress counters shared between workers of one sync job.
#[derive(Debug, Default)]
pub struct SyncProgress {
    inserted: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_inserted(&self, count: u64) {
        self.inserted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_updated(&self, count: u64) {
        self.updated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deleted(&self, count: u64) {
        self.deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, count: u64) {
        self.skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            entities_inserted: self.inserted.load(Ordering::Relaxed),
            entities_updated: self.updated.load(Ordering::Relaxed),
            entities_deleted: self.deleted.load(Ordering::Relaxed),
            entities_failed: self.failed.load(Ordering::Relaxed),
            entities_skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counters_roll_up() {
        let progress = SyncProgress::new();
        progress.record_inserted(3);
        progress.record_updated(1);
        progress.record_skipped(2);
        progress.record_failed(1);
        let stats = progress.stats();
        assert_eq!(stats.entities_inserted, 3);
        assert_eq!(stats.entities_updated, 1);
        assert_eq!(stats.entities_skipped, 2);
        assert_eq!(stats.entities_failed, 1);
        assert_eq!(stats.total_processed(), 7);
    }
}
