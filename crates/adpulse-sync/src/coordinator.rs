//! Job coordination: recovery, the single-running-job guard, staggered
//! accounts, the cooperative deadline and cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use adpulse_adapters::{
    AdRow, FetchContext, GraphClient, GraphEndpoints, InsightRow, InsightsWindow, Paged,
};
use adpulse_core::{
    AdAccount, DateRange, JobStatus, NewSyncJob, SoftError, SyncJob, SyncKind, SyncPhase,
    VISIBLE_ERROR_LIMIT,
};
use adpulse_storage::{BeginJob, JobFilter, SyncStore};
use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::JobTracker;
use crate::daily::DailyMetricsSync;
use crate::reconcile::{apply_plan, plan_reconciliation, MetricsSource, PlanInput};
use crate::tagging::{resolve_account_tags, MappingIndex, TagResolver, TagVocabulary};
use crate::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    One(Uuid),
    AllActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub target: SyncTarget,
    pub kind: SyncKind,
    /// Daily-metrics window; the kind's default lookback when absent.
    pub range: Option<DateRange>,
}

impl SyncRequest {
    pub fn one(account_id: Uuid, kind: SyncKind) -> Self {
        Self {
            target: SyncTarget::One(account_id),
            kind,
            range: None,
        }
    }

    pub fn all(kind: SyncKind) -> Self {
        Self {
            target: SyncTarget::AllActive,
            kind,
            range: None,
        }
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccountOutcome {
    Finished { job: SyncJob },
    Skipped { reason: String, running_job_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSyncResult {
    pub account_id: Uuid,
    pub account_name: String,
    #[serde(flatten)]
    pub outcome: AccountOutcome,
}

impl AccountSyncResult {
    pub fn job(&self) -> Option<&SyncJob> {
        match &self.outcome {
            AccountOutcome::Finished { job } => Some(job),
            AccountOutcome::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync job {job_id} is already running for account {account_id} ({elapsed_seconds}s elapsed)")]
    Conflict {
        job_id: Uuid,
        account_id: Uuid,
        elapsed_seconds: i64,
    },
    #[error("unknown ad account {0}")]
    UnknownAccount(Uuid),
    #[error("no active ad accounts to sync")]
    NoActiveAccounts,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct SyncCoordinator {
    store: Arc<dyn SyncStore>,
    client: GraphClient,
    endpoints: GraphEndpoints,
    resolver: TagResolver,
    config: SyncConfig,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl SyncCoordinator {
    /// Tag vocabulary comes from `rules/tag_vocabulary.yaml` when present.
    pub fn new(store: Arc<dyn SyncStore>, config: SyncConfig) -> anyhow::Result<Self> {
        let vocabulary = TagVocabulary::from_workspace_root(&config.workspace_root)?;
        Self::with_resolver(store, config, TagResolver::new(vocabulary))
    }

    pub fn with_resolver(
        store: Arc<dyn SyncStore>,
        config: SyncConfig,
        resolver: TagResolver,
    ) -> anyhow::Result<Self> {
        let client = GraphClient::new(config.graph_client_config())
            .context("building ads api client")?;
        Ok(Self {
            store,
            client,
            endpoints: GraphEndpoints::new(config.api_base.clone()),
            resolver,
            config,
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    fn active_runs(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_local(&self, job_id: Uuid) {
        if let Some(token) = self.active_runs().get(&job_id) {
            token.cancel();
        }
    }

    /// Stop accepting work: pending stagger waits end, in-process runs are
    /// cancelled at their next check, and later `start` calls sync nothing.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn conflict(running: &SyncJob) -> SyncError {
        SyncError::Conflict {
            job_id: running.id,
            account_id: running.account_id,
            elapsed_seconds: running.elapsed(Utc::now()).num_seconds(),
        }
    }

    /// Recover stuck jobs, then sync the requested accounts one after another.
    pub async fn start(&self, request: SyncRequest) -> Result<Vec<AccountSyncResult>, SyncError> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.config.stuck_job_after)
            .context("stuck job threshold out of range")?;
        let recovered = self.store.recover_stuck_jobs(now - threshold, now).await?;
        for job in &recovered {
            warn!(job_id = %job.id, account_id = %job.account_id, "recovered stuck sync job");
            self.signal_local(job.id);
        }
        if let Some(running) = self.store.running_job().await? {
            return Err(Self::conflict(&running));
        }

        let accounts = match request.target {
            SyncTarget::One(id) => vec![self
                .store
                .get_account(id)
                .await?
                .ok_or(SyncError::UnknownAccount(id))?],
            SyncTarget::AllActive => {
                let accounts = self.store.active_accounts().await?;
                if accounts.is_empty() {
                    return Err(SyncError::NoActiveAccounts);
                }
                accounts
            }
        };

        let mut results = Vec::with_capacity(accounts.len());
        for (index, account) in accounts.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                info!(remaining = accounts.len() - index, "shutting down; remaining accounts not synced");
                break;
            }
            if index > 0 && !self.config.stagger_delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!(remaining = accounts.len() - index, "shutting down; remaining accounts not synced");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.stagger_delay) => {}
                }
            }

            let range = request
                .range
                .unwrap_or_else(|| self.config.windows.range_for(request.kind, Utc::now().date_naive()));
            let begin = self
                .store
                .begin_job(NewSyncJob {
                    id: Uuid::new_v4(),
                    account_id: account.id,
                    kind: request.kind,
                    range,
                    started_at: Utc::now(),
                })
                .await?;

            match begin {
                BeginJob::Conflict(running) => {
                    if index == 0 {
                        return Err(Self::conflict(&running));
                    }
                    let elapsed_seconds = running.elapsed(Utc::now()).num_seconds();
                    warn!(account_id = %account.id, running_job = %running.id, "skipping account; another sync is running");
                    results.push(AccountSyncResult {
                        account_id: account.id,
                        account_name: account.name.clone(),
                        outcome: AccountOutcome::Skipped {
                            reason: format!(
                                "sync job {} is already running ({elapsed_seconds}s elapsed)",
                                running.id
                            ),
                            running_job_id: running.id,
                        },
                    });
                }
                BeginJob::Started(job) => {
                    let job = self.run_account(account, job, range).await;
                    results.push(AccountSyncResult {
                        account_id: account.id,
                        account_name: account.name.clone(),
                        outcome: AccountOutcome::Finished { job },
                    });
                }
            }
        }
        Ok(results)
    }

    async fn run_account(&self, account: &AdAccount, job: SyncJob, range: DateRange) -> SyncJob {
        let cancel = self.shutdown.child_token();
        self.active_runs().insert(job.id, cancel.clone());

        let span = info_span!(
            "account_sync",
            job_id = %job.id,
            account_id = %account.id,
            kind = %job.kind,
        );
        let job_id = job.id;
        let ctx = FetchContext::new(self.config.job_budget, cancel);
        let mut tracker = JobTracker::new(self.store.clone(), job, ctx);

        let finished = async {
            let status = match self.run_phases(account, range, &mut tracker).await {
                Ok(()) => tracker.final_status(),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "account sync failed");
                    let phase = tracker.phase();
                    tracker.record(SoftError::new(phase, format!("unexpected error: {err:#}")));
                    JobStatus::Failed
                }
            };
            match tracker.finish(status).await {
                Ok(job) => {
                    info!(
                        status = %job.status,
                        api_calls = job.progress.api_calls,
                        soft_errors = job.progress.errors.len(),
                        "account sync finished"
                    );
                    job
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "could not persist final job state");
                    tracker.snapshot(status)
                }
            }
        }
        .instrument(span)
        .await;

        self.active_runs().remove(&job_id);
        finished
    }

    /// Entities, lifetime insights, reconciliation, daily metrics, tags.
    async fn run_phases(
        &self,
        account: &AdAccount,
        range: DateRange,
        tracker: &mut JobTracker,
    ) -> anyhow::Result<()> {
        let ctx = tracker.ctx().clone();
        let store = self.store.as_ref();
        let token = account.access_token.as_str();

        tracker.enter(SyncPhase::Entities);
        let ads_url = self.endpoints.ads_url(&account.platform_account_id)?;
        let ads: Paged<AdRow> = self
            .client
            .fetch_all(&ads_url, token, &ctx, SyncPhase::Entities, "ads")
            .await;
        tracker.counters_mut().entities_fetched = ads.items.len() as i64;
        tracker.record_all(ads.errors);
        let manual_ids = store.manual_ad_ids(account.id).await?;
        let mappings = MappingIndex::new(store.name_mappings(account.id).await?);

        tracker.enter(SyncPhase::Insights);
        let mut metrics = if ads.items.is_empty() {
            MetricsSource {
                complete: true,
                ..MetricsSource::default()
            }
        } else {
            let url = self
                .endpoints
                .insights_url(&account.platform_account_id, InsightsWindow::Lifetime)?;
            let rows: Paged<InsightRow> = self
                .client
                .fetch_all(&url, token, &ctx, SyncPhase::Insights, "lifetime insights")
                .await;
            let complete = rows.errors.is_empty() && rows.stopped.is_none();
            tracker.record_all(rows.errors);
            MetricsSource::from_rows(&rows.items, complete)
        };
        if !metrics.complete {
            metrics.stored = store
                .list_entities(Some(account.id))
                .await?
                .into_iter()
                .map(|entity| (entity.ad_id, entity.metrics))
                .collect();
        }

        let plan = plan_reconciliation(
            ads.items,
            &PlanInput {
                account_id: account.id,
                metrics: &metrics,
                manual_ids: &manual_ids,
                resolver: &self.resolver,
                mappings: &mappings,
                synced_at: Utc::now(),
            },
        );
        if plan.skipped_manual > 0 {
            info!(count = plan.skipped_manual, "manual ads left untouched without fresh metrics");
        }
        let applied = apply_plan(store, &plan, &ctx.cancel).await?;
        let counters = tracker.counters_mut();
        counters.entities_upserted = applied.upserted as i64;
        counters.metrics_only_updated = applied.metrics_updated as i64;
        tracker.record_all(applied.errors);
        tracker.checkpoint().await?;

        tracker.enter(SyncPhase::DailyMetrics);
        if !tracker.is_cancelled() {
            let daily = DailyMetricsSync {
                client: &self.client,
                endpoints: &self.endpoints,
                store,
                chunk_days: self.config.daily_chunk_days,
            }
            .run(account, range, &ctx)
            .await?;
            tracker.counters_mut().daily_rows_upserted = daily.rows_upserted as i64;
            tracker.record_all(daily.errors);
            tracker.checkpoint().await?;
        }

        tracker.enter(SyncPhase::Tagging);
        if !tracker.is_cancelled() {
            let tags =
                resolve_account_tags(store, &self.resolver, account.id, &mappings, &ctx.cancel)
                    .await?;
            let counters = tracker.counters_mut();
            counters.tags_parsed = tags.parsed;
            counters.tags_csv_matched = tags.csv_matched;
            counters.tags_untagged = tags.untagged;
            counters.tags_manual_preserved = tags.manual_preserved;
            tracker.checkpoint().await?;
        }

        tracker.enter(SyncPhase::Finalize);
        Ok(())
    }

    /// Cancel the running job (or a specific one). In-process runs stop at
    /// their next check; runs elsewhere stop at their next checkpoint.
    pub async fn cancel(&self, job_id: Option<Uuid>) -> Result<Option<SyncJob>, SyncError> {
        let cancelled = self.store.cancel_job(job_id, Utc::now()).await?;
        if let Some(job) = &cancelled {
            info!(job_id = %job.id, "sync job cancelled");
            self.signal_local(job.id);
        }
        Ok(cancelled)
    }

    /// Job history with at most the first 20 soft errors per job.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>, SyncError> {
        Ok(self
            .store
            .list_jobs(filter)
            .await?
            .iter()
            .map(|job| job.with_visible_errors(VISIBLE_ERROR_LIMIT))
            .collect())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>, SyncError> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn running_job(&self) -> Result<Option<SyncJob>, SyncError> {
        Ok(self.store.running_job().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use adpulse_storage::MemoryStore;
    use chrono::NaiveDate;

    fn config() -> SyncConfig {
        SyncConfig {
            api_base: "http://127.0.0.1:9".into(),
            stagger_delay: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    fn running_job(account_id: Uuid, minutes_ago: i64) -> SyncJob {
        let day = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        NewSyncJob {
            id: Uuid::new_v4(),
            account_id,
            kind: SyncKind::Manual,
            range: DateRange::new(day, day).unwrap(),
            started_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
        .into_running()
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = SyncCoordinator::new(store, config()).unwrap();
        let err = coordinator
            .start(SyncRequest::one(Uuid::new_v4(), SyncKind::Manual))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownAccount(_)));
    }

    #[tokio::test]
    async fn all_with_no_active_accounts_is_an_error() {
        let coordinator = SyncCoordinator::new(Arc::new(MemoryStore::new()), config()).unwrap();
        let err = coordinator
            .start(SyncRequest::all(SyncKind::Scheduled))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoActiveAccounts));
    }

    #[tokio::test]
    async fn cancel_with_nothing_running_returns_none() {
        let coordinator = SyncCoordinator::new(Arc::new(MemoryStore::new()), config()).unwrap();
        assert!(coordinator.cancel(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_marks_running_job_and_fires_local_token() {
        let store = Arc::new(MemoryStore::new());
        let job = running_job(Uuid::new_v4(), 1);
        store.insert_job(job.clone()).await;
        let coordinator = SyncCoordinator::new(store.clone(), config()).unwrap();
        let token = CancellationToken::new();
        coordinator.active_runs().insert(job.id, token.clone());

        let cancelled = coordinator.cancel(Some(job.id)).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(token.is_cancelled());
        assert_eq!(store.running_count().await, 0);
    }

    #[tokio::test]
    async fn listed_jobs_show_at_most_twenty_errors() {
        let store = Arc::new(MemoryStore::new());
        let mut job = running_job(Uuid::new_v4(), 1);
        job.status = JobStatus::CompletedWithErrors;
        for i in 0..25 {
            job.progress
                .record(SoftError::new(SyncPhase::DailyMetrics, format!("chunk {i} failed")));
        }
        store.insert_job(job.clone()).await;
        let coordinator = SyncCoordinator::new(store, config()).unwrap();

        let jobs = coordinator.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs[0].progress.errors.len(), VISIBLE_ERROR_LIMIT);
        let full = coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(full.progress.errors.len(), 25);
    }

    fn active_account(name: &str) -> AdAccount {
        AdAccount {
            id: Uuid::new_v4(),
            name: name.into(),
            platform_account_id: format!("act_{name}"),
            access_token: "tok".into(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn running_job_conflicts_before_account_lookup() {
        let store = Arc::new(MemoryStore::new());
        let running = running_job(Uuid::new_v4(), 2);
        store.insert_job(running.clone()).await;
        let coordinator = SyncCoordinator::new(store, config()).unwrap();

        let err = coordinator
            .start(SyncRequest::one(Uuid::new_v4(), SyncKind::Manual))
            .await
            .unwrap_err();
        match err {
            SyncError::Conflict {
                job_id,
                elapsed_seconds,
                ..
            } => {
                assert_eq!(job_id, running.id);
                assert!(elapsed_seconds >= 119);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_ends_the_stagger_wait() {
        let store = Arc::new(MemoryStore::new());
        store.insert_account(active_account("one")).await;
        store.insert_account(active_account("two")).await;
        let coordinator = Arc::new(
            SyncCoordinator::new(
                store.clone(),
                SyncConfig {
                    stagger_delay: Duration::from_secs(3600),
                    ..config()
                },
            )
            .unwrap(),
        );

        let trigger = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.shutdown();
        });

        let results = tokio::time::timeout(
            Duration::from_secs(30),
            coordinator.start(SyncRequest::all(SyncKind::Manual)),
        )
        .await
        .expect("shutdown should end the stagger wait")
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(store.running_count().await, 0);
    }
}
