//! In-flight job progress and its persistence between phases.

use std::sync::Arc;

use adpulse_adapters::FetchContext;
use adpulse_core::{JobCounters, JobProgress, JobStatus, SoftError, SyncJob, SyncPhase};
use adpulse_storage::{CheckpointAck, SyncStore};
use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

/// Final status from how the run ended.
pub fn final_status(cancelled: bool, progress: &JobProgress) -> JobStatus {
    if cancelled {
        JobStatus::Cancelled
    } else if progress.has_errors() {
        JobStatus::CompletedWithErrors
    } else {
        JobStatus::Completed
    }
}

pub struct JobTracker {
    store: Arc<dyn SyncStore>,
    job: SyncJob,
    progress: JobProgress,
    ctx: FetchContext,
    phase: SyncPhase,
}

impl JobTracker {
    pub fn new(store: Arc<dyn SyncStore>, job: SyncJob, ctx: FetchContext) -> Self {
        let progress = job.progress.clone();
        Self {
            store,
            job,
            progress,
            ctx,
            phase: SyncPhase::Entities,
        }
    }

    pub fn ctx(&self) -> &FetchContext {
        &self.ctx
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn enter(&mut self, phase: SyncPhase) {
        info!(job_id = %self.job.id, phase = %phase, "entering phase");
        self.phase = phase;
    }

    pub fn counters_mut(&mut self) -> &mut JobCounters {
        &mut self.progress.counters
    }

    pub fn record(&mut self, error: SoftError) {
        warn!(job_id = %self.job.id, phase = %error.phase, message = %error.message, "soft error");
        self.progress.record(error);
    }

    pub fn record_all(&mut self, errors: impl IntoIterator<Item = SoftError>) {
        for error in errors {
            self.record(error);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }

    fn sync_call_count(&mut self) {
        self.progress.api_calls = self.ctx.calls.count();
    }

    /// Persist progress. A job that left `running` elsewhere cancels this run.
    pub async fn checkpoint(&mut self) -> Result<CheckpointAck> {
        self.sync_call_count();
        let ack = self.store.checkpoint(self.job.id, &self.progress).await?;
        if let CheckpointAck::Inactive(status) = ack {
            info!(job_id = %self.job.id, status = %status, "job no longer running; stopping");
            self.ctx.cancel.cancel();
        }
        Ok(ack)
    }

    pub fn final_status(&self) -> JobStatus {
        final_status(self.is_cancelled(), &self.progress)
    }

    /// In-memory view of the job as it would be finished.
    pub fn snapshot(&self, status: JobStatus) -> SyncJob {
        let now = Utc::now();
        let mut job = self.job.clone();
        job.status = status;
        job.progress = self.progress.clone();
        job.completed_at = Some(now);
        job.duration_ms = Some(job.elapsed(now).num_milliseconds());
        job
    }

    /// Write the terminal state. The store keeps a status someone else set.
    pub async fn finish(&mut self, status: JobStatus) -> Result<SyncJob> {
        self.sync_call_count();
        let finished = self
            .store
            .finish_job(self.job.id, &self.progress, status, Utc::now())
            .await?;
        Ok(finished.unwrap_or_else(|| self.snapshot(status)))
    }
}
