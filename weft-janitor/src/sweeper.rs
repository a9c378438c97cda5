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
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weft_metastore::{Metastore, SyncJob, SyncJobStatus};

const RUN_INTERVAL: Duration = Duration::from_secs(60);

/// Jobs sitting in Pending or Cancelling longer than this are swept.
const QUEUED_JOB_MAX_AGE: Duration = Duration::from_secs(3 * 60);

/// Running jobs with no progress heartbeat for longer than this are swept.
const RUNNING_JOB_STALL_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Debug, Default, Serialize)]
pub struct SweeperCounters {
    /// The number of sweep passes performed.
    pub num_passes: usize,
    /// The number of jobs cancelled by the sweeper.
    pub num_swept_jobs: usize,
    /// The number of cancellations that failed.
    pub num_failed_sweeps: usize,
}

/// Periodically cancels jobs stuck in a live status.
pub struct StuckJobSweeper {
    metastore: Arc<dyn Metastore>,
    counters: SweeperCounters,
}

impl StuckJobSweeper {
    pub fn new(metastore: Arc<dyn Metastore>) -> Self {
        Self {
            metastore,
            counters: SweeperCounters::default(),
        }
    }

    pub fn counters(&self) -> &SweeperCounters {
        &self.counters
    }

    /// Runs sweep passes until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> SweeperCounters {
        let mut interval = tokio::time::interval(RUN_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
        self.counters
    }

    /// One sweep pass. Errors are counted, never propagated: the sweeper
    /// itself must not die to a flaky metastore.
    pub async fn run_once(&mut self) {
        self.counters.num_passes += 1;
        let live_jobs = match self.metastore.list_live_jobs().await {
            Ok(jobs) => jobs,
            Err(metastore_error) => {
                error!(error = %metastore_error, "failed to list live jobs");
                return;
            }
        };
        let now = OffsetDateTime::now_utc();
        for job in live_jobs {
            if let Some(reason) = stuck_reason(&job, now) {
                self.sweep(job, reason).await;
            }
        }
    }

    async fn sweep(&mut self, job: SyncJob, reason: String) {
        warn!(job_id = %job.id, sync_id = %job.sync_id, %reason, "sweeping-stuck-job");
        // A Pending or Running job must pass through Cancelling first.
        if job.status != SyncJobStatus::Cancelling {
            if let Err(error) = self
                .metastore
                .update_job_status(job.id, SyncJobStatus::Cancelling, Some(reason.clone()), None)
                .await
            {
                warn!(job_id = %job.id, %error, "failed to mark job cancelling");
            }
        }
        match self
            .metastore
            .update_job_status(job.id, SyncJobStatus::Cancelled, Some(reason), None)
            .await
        {
            Ok(_) => {
                self.counters.num_swept_jobs += 1;
                info!(job_id = %job.id, "stuck-job-cancelled");
            }
            Err(error) => {
                self.counters.num_failed_sweeps += 1;
                error!(job_id = %job.id, %error, "failed to cancel stuck job");
            }
        }
    }
}

fn stuck_reason(job: &SyncJob, now: OffsetDateTime) -> Option<String> {
    let age_of = |since: OffsetDateTime| {
        Duration::from_secs((now - since).whole_seconds().max(0) as u64)
    };
    match job.status {
        SyncJobStatus::Pending | SyncJobStatus::Cancelling => {
            let age = age_of(job.created_at);
            (age > QUEUED_JOB_MAX_AGE).then(|| {
                format!(
                    "job stuck in {:?} for {}s",
                    job.status,
                    age.as_secs()
                )
            })
        }
        SyncJobStatus::Running => {
            let last_activity = job
                .last_progress_at
                .or(job.started_at)
                .unwrap_or(job.created_at);
            let age = age_of(last_activity);
            (age > RUNNING_JOB_STALL_AGE)
                .then(|| format!("job running with no progress for {}s", age.as_secs()))
        }
        _ => None,
    }
}
