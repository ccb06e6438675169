//! In-process store with the same upsert semantics as the Postgres schema.
//!
//! Used by tests and dry runs. All mutations happen under one lock, so the
//! running-job check and insert in `begin_job` are atomic.

use std::collections::{BTreeMap, HashMap, HashSet};

use adpulse_core::{
    AdAccount, AdEntity, DailyMetricRecord, JobProgress, JobStatus, NameMapping, NewSyncJob,
    SyncJob, SyncPhase, TagFields, TagProvenance,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    stuck_job_error, BeginJob, CheckpointAck, JobFilter, MetricsUpdate, SyncStore, TagUpdate,
    TaggingCandidate,
};

#[derive(Debug, Default)]
struct MemoryState {
    accounts: BTreeMap<Uuid, AdAccount>,
    jobs: Vec<SyncJob>,
    entities: BTreeMap<String, AdEntity>,
    daily: BTreeMap<(String, NaiveDate), DailyMetricRecord>,
    mappings: HashMap<(Uuid, String), NameMapping>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: AdAccount) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    pub async fn insert_mapping(&self, mapping: NameMapping) {
        self.state
            .lock()
            .await
            .mappings
            .insert((mapping.account_id, mapping.business_code.clone()), mapping);
    }

    /// Insert a job row as-is, bypassing the running-job guard.
    pub async fn insert_job(&self, job: SyncJob) {
        self.state.lock().await.jobs.push(job);
    }

    /// Human tag edit: sets tags and flips provenance to manual.
    pub async fn set_manual_tags(&self, ad_id: &str, tags: TagFields) -> bool {
        let mut state = self.state.lock().await;
        match state.entities.get_mut(ad_id) {
            Some(entity) => {
                entity.tags = tags;
                entity.tag_source = TagProvenance::Manual;
                true
            }
            None => false,
        }
    }

    pub async fn entity(&self, ad_id: &str) -> Option<AdEntity> {
        self.state.lock().await.entities.get(ad_id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }
}

fn finalize(job: &mut SyncJob, completed_at: DateTime<Utc>) {
    job.completed_at = Some(completed_at);
    job.duration_ms = Some(job.elapsed(completed_at).num_milliseconds().max(0));
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn recover_stuck_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>> {
        let mut state = self.state.lock().await;
        let mut recovered = Vec::new();
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Running && j.started_at < started_before)
        {
            job.status = JobStatus::Failed;
            job.progress.record(stuck_job_error(now));
            finalize(job, now);
            recovered.push(job.clone());
        }
        Ok(recovered)
    }

    async fn begin_job(&self, job: NewSyncJob) -> Result<BeginJob> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.jobs.iter().find(|j| j.status == JobStatus::Running) {
            return Ok(BeginJob::Conflict(running.clone()));
        }
        let job = job.into_running();
        state.jobs.push(job.clone());
        Ok(BeginJob::Started(job))
    }

    async fn running_job(&self) -> Result<Option<SyncJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .find(|j| j.status == JobStatus::Running)
            .cloned())
    }

    async fn checkpoint(&self, job_id: Uuid, progress: &JobProgress) -> Result<CheckpointAck> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| anyhow::anyhow!("sync job {job_id} not found"))?;
        if job.status != JobStatus::Running {
            return Ok(CheckpointAck::Inactive(job.status));
        }
        job.progress = progress.clone();
        Ok(CheckpointAck::Active)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
        status: JobStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<SyncJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        let carried: Vec<_> = if job.status == JobStatus::Running {
            job.status = status;
            Vec::new()
        } else {
            job.progress
                .errors
                .iter()
                .filter(|e| e.phase == SyncPhase::Recovery)
                .cloned()
                .collect()
        };
        job.progress = progress.clone();
        job.progress.errors.extend(carried);
        if job.completed_at.is_none() {
            finalize(job, completed_at);
        }
        Ok(Some(job.clone()))
    }

    async fn cancel_job(
        &self,
        job_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.iter_mut().find(|j| {
            j.status == JobStatus::Running && job_id.map_or(true, |id| id == j.id)
        }) else {
            return Ok(None);
        };
        job.status = JobStatus::Cancelled;
        finalize(job, now);
        Ok(Some(job.clone()))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        let state = self.state.lock().await;
        let mut jobs = state
            .jobs
            .iter()
            .filter(|j| filter.account_id.map_or(true, |id| id == j.account_id))
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(filter.limit.max(0) as usize);
        Ok(jobs)
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<AdAccount>> {
        Ok(self.state.lock().await.accounts.get(&account_id).cloned())
    }

    async fn active_accounts(&self) -> Result<Vec<AdAccount>> {
        let state = self.state.lock().await;
        let mut accounts = state
            .accounts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect::<Vec<_>>();
        accounts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(accounts)
    }

    async fn manual_ad_ids(&self, account_id: Uuid) -> Result<HashSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .values()
            .filter(|e| e.account_id == account_id && e.tag_source.is_manual())
            .map(|e| e.ad_id.clone())
            .collect())
    }

    async fn upsert_entities(&self, batch: &[AdEntity]) -> Result<u64> {
        let mut state = self.state.lock().await;
        for incoming in batch {
            let manual_tags = state
                .entities
                .get(&incoming.ad_id)
                .filter(|existing| existing.tag_source.is_manual())
                .map(|existing| existing.tags.clone());
            let entity = match manual_tags {
                Some(tags) => AdEntity {
                    tags,
                    tag_source: TagProvenance::Manual,
                    ..incoming.clone()
                },
                None => incoming.clone(),
            };
            state.entities.insert(incoming.ad_id.clone(), entity);
        }
        Ok(batch.len() as u64)
    }

    async fn update_entity_metrics(&self, update: &MetricsUpdate) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.entities.get_mut(&update.ad_id) {
            Some(entity) => {
                entity.metrics = update.metrics;
                entity.last_synced_at = update.synced_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_daily_metrics(&self, batch: &[DailyMetricRecord]) -> Result<u64> {
        let mut state = self.state.lock().await;
        for record in batch {
            state
                .daily
                .insert((record.ad_id.clone(), record.date), record.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn name_mappings(&self, account_id: Uuid) -> Result<Vec<NameMapping>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .values()
            .filter(|m| m.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn tagging_candidates(&self, account_id: Uuid) -> Result<Vec<TaggingCandidate>> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .values()
            .filter(|e| e.account_id == account_id && !e.tag_source.is_manual())
            .map(|e| TaggingCandidate {
                ad_id: e.ad_id.clone(),
                name: e.name.clone(),
                business_code: e.business_code.clone(),
                tags: e.tags.clone(),
                provenance: e.tag_source,
            })
            .collect())
    }

    async fn apply_tags(&self, updates: &[TagUpdate]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for update in updates {
            if let Some(entity) = state.entities.get_mut(&update.ad_id) {
                if entity.tag_source.is_manual() {
                    continue;
                }
                entity.business_code = update.business_code.clone();
                entity.tags = update.tags.clone();
                entity.tag_source = update.provenance;
                written += 1;
            }
        }
        Ok(written)
    }

    async fn list_entities(&self, account_id: Option<Uuid>) -> Result<Vec<AdEntity>> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .values()
            .filter(|e| account_id.map_or(true, |id| id == e.account_id))
            .cloned()
            .collect())
    }

    async fn list_daily_metrics(
        &self,
        account_id: Option<Uuid>,
    ) -> Result<Vec<DailyMetricRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .daily
            .values()
            .filter(|r| account_id.map_or(true, |id| id == r.account_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_core::{DateRange, MetricSnapshot, SyncKind};
    use chrono::Duration;

    fn new_job(account_id: Uuid, started_at: DateTime<Utc>) -> NewSyncJob {
        NewSyncJob {
            id: Uuid::new_v4(),
            account_id,
            kind: SyncKind::Manual,
            range: DateRange::new(
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            )
            .unwrap(),
            started_at,
        }
    }

    fn entity(ad_id: &str, account_id: Uuid, provenance: TagProvenance) -> AdEntity {
        AdEntity {
            ad_id: ad_id.to_string(),
            account_id,
            name: format!("{ad_id}_name"),
            status: Some("ACTIVE".into()),
            campaign_name: None,
            adset_name: None,
            thumbnail_url: None,
            video_id: None,
            metrics: MetricSnapshot::default(),
            business_code: None,
            tags: TagFields {
                hook: Some("Question".into()),
                ..TagFields::default()
            },
            tag_source: provenance,
            last_synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_begin_conflicts_with_running_job() {
        let store = MemoryStore::new();
        let account = Uuid::new_v4();
        let first = store.begin_job(new_job(account, Utc::now())).await.unwrap();
        let BeginJob::Started(first) = first else {
            panic!("first job should start");
        };
        let second = store.begin_job(new_job(account, Utc::now())).await.unwrap();
        assert_eq!(second, BeginJob::Conflict(first.clone()));
        assert_eq!(store.running_count().await, 1);

        store
            .finish_job(first.id, &JobProgress::default(), JobStatus::Completed, Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            store.begin_job(new_job(account, Utc::now())).await.unwrap(),
            BeginJob::Started(_)
        ));
    }

    #[tokio::test]
    async fn recovery_fails_only_jobs_older_than_cutoff() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = new_job(Uuid::new_v4(), now - Duration::minutes(15)).into_running();
        store.insert_job(stale.clone()).await;

        let recovered = store
            .recover_stuck_jobs(now - Duration::minutes(10), now)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        let job = store.get_job(stale.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress.errors.len(), 1);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn checkpoint_reports_cancelled_job_and_finish_keeps_cancelled() {
        let store = MemoryStore::new();
        let BeginJob::Started(job) = store
            .begin_job(new_job(Uuid::new_v4(), Utc::now()))
            .await
            .unwrap()
        else {
            panic!("job should start");
        };
        store.cancel_job(None, Utc::now()).await.unwrap();
        let ack = store.checkpoint(job.id, &JobProgress::default()).await.unwrap();
        assert_eq!(ack, CheckpointAck::Inactive(JobStatus::Cancelled));

        let finished = store
            .finish_job(job.id, &JobProgress::default(), JobStatus::Completed, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn upsert_keeps_manual_tags() {
        let store = MemoryStore::new();
        let account = Uuid::new_v4();
        store
            .upsert_entities(&[entity("1", account, TagProvenance::Parsed)])
            .await
            .unwrap();
        let manual_tags = TagFields {
            product: Some("Serum".into()),
            ..TagFields::default()
        };
        assert!(store.set_manual_tags("1", manual_tags.clone()).await);

        let mut incoming = entity("1", account, TagProvenance::Untagged);
        incoming.tags = TagFields::empty();
        incoming.name = "renamed".into();
        store.upsert_entities(&[incoming]).await.unwrap();

        let stored = store.entity("1").await.unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.tags, manual_tags);
        assert_eq!(stored.tag_source, TagProvenance::Manual);
        assert!(store.tagging_candidates(account).await.unwrap().is_empty());
    }
}
