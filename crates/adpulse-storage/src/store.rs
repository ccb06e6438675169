use std::collections::HashSet;

use adpulse_core::{
    AdAccount, AdEntity, DailyMetricRecord, JobProgress, JobStatus, MetricSnapshot, NameMapping,
    NewSyncJob, SyncJob, TagFields, TagProvenance,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of the atomic "insert a running job" operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginJob {
    Started(SyncJob),
    /// Another job already holds the running slot.
    Conflict(SyncJob),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAck {
    Active,
    /// The job left `running` outside this run (cancelled or recovered).
    Inactive(JobStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub account_id: Option<Uuid>,
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            account_id: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsUpdate {
    pub ad_id: String,
    pub metrics: MetricSnapshot,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagUpdate {
    pub ad_id: String,
    pub business_code: Option<String>,
    pub tags: TagFields,
    pub provenance: TagProvenance,
}

/// Current tag state of an entity, as seen by the tag resolution phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggingCandidate {
    pub ad_id: String,
    pub name: String,
    pub business_code: Option<String>,
    pub tags: TagFields,
    pub provenance: TagProvenance,
}

/// Persistence used by the sync pipeline. Every write is an upsert on a natural key.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Fail every running job started before `started_before`.
    async fn recover_stuck_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>>;

    /// Insert a running job unless one already exists, as a single atomic step.
    async fn begin_job(&self, job: NewSyncJob) -> Result<BeginJob>;

    async fn running_job(&self) -> Result<Option<SyncJob>>;

    async fn checkpoint(&self, job_id: Uuid, progress: &JobProgress) -> Result<CheckpointAck>;

    /// Write final progress and status. A job no longer running keeps its status.
    async fn finish_job(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
        status: JobStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<SyncJob>>;

    /// Mark the running job (optionally a specific one) cancelled.
    async fn cancel_job(
        &self,
        job_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>>;

    async fn get_account(&self, account_id: Uuid) -> Result<Option<AdAccount>>;

    async fn active_accounts(&self) -> Result<Vec<AdAccount>>;

    async fn manual_ad_ids(&self, account_id: Uuid) -> Result<HashSet<String>>;

    /// Full upsert keyed by ad id. Rows that are manual in storage keep their tags.
    async fn upsert_entities(&self, batch: &[AdEntity]) -> Result<u64>;

    /// Metrics-only update. Returns false when the entity does not exist.
    async fn update_entity_metrics(&self, update: &MetricsUpdate) -> Result<bool>;

    /// Upsert keyed by (ad id, date).
    async fn upsert_daily_metrics(&self, batch: &[DailyMetricRecord]) -> Result<u64>;

    async fn name_mappings(&self, account_id: Uuid) -> Result<Vec<NameMapping>>;

    /// Non-manual entities of an account.
    async fn tagging_candidates(&self, account_id: Uuid) -> Result<Vec<TaggingCandidate>>;

    /// Write resolved tags, skipping rows that became manual meanwhile.
    async fn apply_tags(&self, updates: &[TagUpdate]) -> Result<u64>;

    async fn list_entities(&self, account_id: Option<Uuid>) -> Result<Vec<AdEntity>>;

    async fn list_daily_metrics(&self, account_id: Option<Uuid>)
        -> Result<Vec<DailyMetricRecord>>;
}

/// Synthetic soft error appended to jobs failed by stuck-job recovery.
pub fn stuck_job_error(at: DateTime<Utc>) -> adpulse_core::SoftError {
    adpulse_core::SoftError {
        phase: adpulse_core::SyncPhase::Recovery,
        message: "timed out: job was still running past the stuck-job threshold".to_string(),
        at,
    }
}
