//! Postgres-backed [`SyncStore`].

use std::collections::HashSet;

use adpulse_core::{
    AdAccount, AdEntity, DailyMetricRecord, JobCounters, JobProgress, JobStatus, MetricSnapshot,
    NameMapping, NewSyncJob, SoftError, SyncJob, TagFields, TagProvenance,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{
    stuck_job_error, BeginJob, CheckpointAck, JobFilter, MetricsUpdate, SyncStore, TagUpdate,
    TaggingCandidate,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const JOB_COLUMNS: &str = r#"
    id, account_id, sync_type, status, date_since, date_until, started_at, completed_at,
    duration_ms, entities_fetched, entities_upserted, metrics_only_updated,
    daily_rows_upserted, tags_parsed, tags_csv_matched, tags_untagged,
    tags_manual_preserved, api_calls, errors
"#;

// Binds $2..$11, see `bind_progress`.
const PROGRESS_ASSIGNMENTS: &str = r#"
    entities_fetched = $2, entities_upserted = $3, metrics_only_updated = $4,
    daily_rows_upserted = $5, tags_parsed = $6, tags_csv_matched = $7,
    tags_untagged = $8, tags_manual_preserved = $9, api_calls = $10, errors = $11
"#;

const METRIC_COLUMNS: &str = r#"
    spend, roas, cost_per_result, ctr, clicks, impressions, cpm, cpc, frequency,
    results, result_value, scroll_stop_rate
"#;

const ENTITY_COLUMNS: &str = r#"
    ad_id, account_id, name, status, campaign_name, adset_name, thumbnail_url, video_id,
    spend, roas, cost_per_result, ctr, clicks, impressions, cpm, cpc, frequency,
    results, result_value, scroll_stop_rate,
    business_code, tag_type, tag_person, tag_style, tag_product, tag_hook, tag_theme,
    tag_source, last_synced_at
"#;

const DAILY_BATCH_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn fetch_job(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading sync job {job_id}"))?;
        row.as_ref().map(job_from_row).transpose()
    }
}

fn bind_progress<'q>(
    query: Query<'q, Postgres, PgArguments>,
    progress: &JobProgress,
) -> Result<Query<'q, Postgres, PgArguments>> {
    let c = &progress.counters;
    let errors = serde_json::to_value(&progress.errors).context("serializing soft errors")?;
    Ok(query
        .bind(c.entities_fetched)
        .bind(c.entities_upserted)
        .bind(c.metrics_only_updated)
        .bind(c.daily_rows_upserted)
        .bind(c.tags_parsed)
        .bind(c.tags_csv_matched)
        .bind(c.tags_untagged)
        .bind(c.tags_manual_preserved)
        .bind(progress.api_calls)
        .bind(errors))
}

fn job_from_row(row: &PgRow) -> Result<SyncJob> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    let errors: serde_json::Value = row.try_get("errors")?;
    let errors: Vec<SoftError> =
        serde_json::from_value(errors).context("decoding sync_jobs.errors")?;
    Ok(SyncJob {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        kind: sync_type.parse()?,
        status: status.parse()?,
        since: row.try_get("date_since")?,
        until: row.try_get("date_until")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        progress: JobProgress {
            counters: JobCounters {
                entities_fetched: row.try_get("entities_fetched")?,
                entities_upserted: row.try_get("entities_upserted")?,
                metrics_only_updated: row.try_get("metrics_only_updated")?,
                daily_rows_upserted: row.try_get("daily_rows_upserted")?,
                tags_parsed: row.try_get("tags_parsed")?,
                tags_csv_matched: row.try_get("tags_csv_matched")?,
                tags_untagged: row.try_get("tags_untagged")?,
                tags_manual_preserved: row.try_get("tags_manual_preserved")?,
            },
            api_calls: row.try_get("api_calls")?,
            errors,
        },
    })
}

fn metrics_from_row(row: &PgRow) -> Result<MetricSnapshot> {
    Ok(MetricSnapshot {
        spend: row.try_get("spend")?,
        roas: row.try_get("roas")?,
        cost_per_result: row.try_get("cost_per_result")?,
        ctr: row.try_get("ctr")?,
        clicks: row.try_get("clicks")?,
        impressions: row.try_get("impressions")?,
        cpm: row.try_get("cpm")?,
        cpc: row.try_get("cpc")?,
        frequency: row.try_get("frequency")?,
        results: row.try_get("results")?,
        result_value: row.try_get("result_value")?,
        scroll_stop_rate: row.try_get("scroll_stop_rate")?,
    })
}

fn tags_from_row(row: &PgRow) -> Result<TagFields> {
    Ok(TagFields {
        creative_type: row.try_get("tag_type")?,
        person: row.try_get("tag_person")?,
        style: row.try_get("tag_style")?,
        product: row.try_get("tag_product")?,
        hook: row.try_get("tag_hook")?,
        theme: row.try_get("tag_theme")?,
    })
}

fn entity_from_row(row: &PgRow) -> Result<AdEntity> {
    let tag_source: String = row.try_get("tag_source")?;
    Ok(AdEntity {
        ad_id: row.try_get("ad_id")?,
        account_id: row.try_get("account_id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        campaign_name: row.try_get("campaign_name")?,
        adset_name: row.try_get("adset_name")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        video_id: row.try_get("video_id")?,
        metrics: metrics_from_row(row)?,
        business_code: row.try_get("business_code")?,
        tags: tags_from_row(row)?,
        tag_source: tag_source.parse()?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<AdAccount> {
    Ok(AdAccount {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        platform_account_id: row.try_get("platform_account_id")?,
        access_token: row.try_get("access_token")?,
        is_active: row.try_get("is_active")?,
    })
}

fn push_metric_binds(b: &mut Separated<'_, '_, Postgres, &'static str>, m: &MetricSnapshot) {
    b.push_bind(m.spend)
        .push_bind(m.roas)
        .push_bind(m.cost_per_result)
        .push_bind(m.ctr)
        .push_bind(m.clicks)
        .push_bind(m.impressions)
        .push_bind(m.cpm)
        .push_bind(m.cpc)
        .push_bind(m.frequency)
        .push_bind(m.results)
        .push_bind(m.result_value)
        .push_bind(m.scroll_stop_rate);
}

#[async_trait]
impl SyncStore for PgStore {
    async fn recover_stuck_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>> {
        let note = serde_json::to_value(vec![stuck_job_error(now)])?;
        let sql = format!(
            r#"
            UPDATE sync_jobs
               SET status = 'failed',
                   completed_at = $2,
                   duration_ms = (EXTRACT(EPOCH FROM ($2 - started_at)) * 1000)::BIGINT,
                   errors = errors || $3::jsonb
             WHERE status = 'running'
               AND started_at < $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(started_before)
            .bind(now)
            .bind(note)
            .fetch_all(&self.pool)
            .await
            .context("recovering stuck sync jobs")?;
        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        for job in &jobs {
            warn!(job_id = %job.id, account_id = %job.account_id, "recovered stuck sync job");
        }
        Ok(jobs)
    }

    async fn begin_job(&self, job: NewSyncJob) -> Result<BeginJob> {
        let sql = format!(
            r#"
            INSERT INTO sync_jobs (id, account_id, sync_type, status, date_since, date_until, started_at)
            VALUES ($1, $2, $3, 'running', $4, $5, $6)
            ON CONFLICT (status) WHERE status = 'running' DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        // The running job may finish between a failed insert and the lookup.
        for _ in 0..3 {
            let inserted = sqlx::query(&sql)
                .bind(job.id)
                .bind(job.account_id)
                .bind(job.kind.as_str())
                .bind(job.range.since)
                .bind(job.range.until)
                .bind(job.started_at)
                .fetch_optional(&self.pool)
                .await
                .context("inserting sync job")?;
            if let Some(row) = inserted {
                return Ok(BeginJob::Started(job_from_row(&row)?));
            }
            if let Some(running) = self.running_job().await? {
                return Ok(BeginJob::Conflict(running));
            }
        }
        anyhow::bail!("could not acquire the running-job slot for account {}", job.account_id)
    }

    async fn running_job(&self) -> Result<Option<SyncJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = 'running' LIMIT 1");
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .context("loading running sync job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn checkpoint(&self, job_id: Uuid, progress: &JobProgress) -> Result<CheckpointAck> {
        let sql = format!(
            "UPDATE sync_jobs SET {PROGRESS_ASSIGNMENTS} WHERE id = $1 AND status = 'running' RETURNING id"
        );
        let updated = bind_progress(sqlx::query(&sql).bind(job_id), progress)?
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("checkpointing sync job {job_id}"))?;
        if updated.is_some() {
            return Ok(CheckpointAck::Active);
        }
        let job = self
            .fetch_job(job_id)
            .await?
            .with_context(|| format!("sync job {job_id} not found"))?;
        Ok(CheckpointAck::Inactive(job.status))
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
        status: JobStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<SyncJob>> {
        let sql = format!(
            r#"
            UPDATE sync_jobs
               SET entities_fetched = $2, entities_upserted = $3, metrics_only_updated = $4,
                   daily_rows_upserted = $5, tags_parsed = $6, tags_csv_matched = $7,
                   tags_untagged = $8, tags_manual_preserved = $9, api_calls = $10,
                   errors = CASE
                       WHEN status = 'running' THEN $11
                       ELSE $11 || jsonb_path_query_array(errors, '$[*] ? (@.phase == "recovery")')
                   END,
                   status = CASE WHEN status = 'running' THEN $12 ELSE status END,
                   completed_at = COALESCE(completed_at, $13),
                   duration_ms = COALESCE(
                       duration_ms,
                       (EXTRACT(EPOCH FROM ($13 - started_at)) * 1000)::BIGINT
                   )
             WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = bind_progress(sqlx::query(&sql).bind(job_id), progress)?
            .bind(status.as_str())
            .bind(completed_at)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("finishing sync job {job_id}"))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn cancel_job(
        &self,
        job_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>> {
        let sql = format!(
            r#"
            UPDATE sync_jobs
               SET status = 'cancelled',
                   completed_at = $2,
                   duration_ms = (EXTRACT(EPOCH FROM ($2 - started_at)) * 1000)::BIGINT
             WHERE status = 'running'
               AND ($1::uuid IS NULL OR id = $1)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .context("cancelling sync job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        self.fetch_job(job_id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM sync_jobs
             WHERE ($1::uuid IS NULL OR account_id = $1)
             ORDER BY started_at DESC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.account_id)
            .bind(filter.limit.max(0))
            .fetch_all(&self.pool)
            .await
            .context("listing sync jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<AdAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, platform_account_id, access_token, is_active
              FROM ad_accounts
             WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading account {account_id}"))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn active_accounts(&self) -> Result<Vec<AdAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, platform_account_id, access_token, is_active
              FROM ad_accounts
             WHERE is_active
             ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing active accounts")?;
        rows.iter().map(account_from_row).collect()
    }

    async fn manual_ad_ids(&self, account_id: Uuid) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT ad_id
              FROM ad_entities
             WHERE account_id = $1
               AND tag_source = 'manual'
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("loading manually tagged ads")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("ad_id").map_err(Into::into))
            .collect()
    }

    async fn upsert_entities(&self, batch: &[AdEntity]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO ad_entities ({ENTITY_COLUMNS}) "));
        qb.push_values(batch, |mut b, e| {
            b.push_bind(e.ad_id.clone())
                .push_bind(e.account_id)
                .push_bind(e.name.clone())
                .push_bind(e.status.clone())
                .push_bind(e.campaign_name.clone())
                .push_bind(e.adset_name.clone())
                .push_bind(e.thumbnail_url.clone())
                .push_bind(e.video_id.clone());
            push_metric_binds(&mut b, &e.metrics);
            b.push_bind(e.business_code.clone())
                .push_bind(e.tags.creative_type.clone())
                .push_bind(e.tags.person.clone())
                .push_bind(e.tags.style.clone())
                .push_bind(e.tags.product.clone())
                .push_bind(e.tags.hook.clone())
                .push_bind(e.tags.theme.clone())
                .push_bind(e.tag_source.as_str())
                .push_bind(e.last_synced_at);
        });
        // Tag columns stay put for rows a human marked manual after planning.
        qb.push(
            r#"
            ON CONFLICT (ad_id) DO UPDATE SET
                account_id = EXCLUDED.account_id,
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                campaign_name = EXCLUDED.campaign_name,
                adset_name = EXCLUDED.adset_name,
                thumbnail_url = EXCLUDED.thumbnail_url,
                video_id = EXCLUDED.video_id,
                spend = EXCLUDED.spend,
                roas = EXCLUDED.roas,
                cost_per_result = EXCLUDED.cost_per_result,
                ctr = EXCLUDED.ctr,
                clicks = EXCLUDED.clicks,
                impressions = EXCLUDED.impressions,
                cpm = EXCLUDED.cpm,
                cpc = EXCLUDED.cpc,
                frequency = EXCLUDED.frequency,
                results = EXCLUDED.results,
                result_value = EXCLUDED.result_value,
                scroll_stop_rate = EXCLUDED.scroll_stop_rate,
                business_code = EXCLUDED.business_code,
                tag_type = CASE WHEN ad_entities.tag_source = 'manual' THEN ad_entities.tag_type ELSE EXCLUDED.tag_type END,
                tag_person = CASE WHEN ad_entities.tag_source = 'manual' THEN ad_entities.tag_person ELSE EXCLUDED.tag_person END,
                tag_style = CASE WHEN ad_entities.tag_source = 'manual' THEN ad_entities.tag_style ELSE EXCLUDED.tag_style END,
                tag_product = CASE WHEN ad_entities.tag_source = 'manual' THEN ad_entities.tag_product ELSE EXCLUDED.tag_product END,
                tag_hook = CASE WHEN ad_entities.tag_source = 'manual' THEN ad_entities.tag_hook ELSE EXCLUDED.tag_hook END,
                tag_theme = CASE WHEN ad_entities.tag_source = 'manual' THEN ad_entities.tag_theme ELSE EXCLUDED.tag_theme END,
                tag_source = CASE WHEN ad_entities.tag_source = 'manual' THEN ad_entities.tag_source ELSE EXCLUDED.tag_source END,
                last_synced_at = EXCLUDED.last_synced_at,
                updated_at = NOW()
            "#,
        );
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("upserting ad entities")?;
        Ok(result.rows_affected())
    }

    async fn update_entity_metrics(&self, update: &MetricsUpdate) -> Result<bool> {
        let m = &update.metrics;
        let result = sqlx::query(
            r#"
            UPDATE ad_entities
               SET spend = $2, roas = $3, cost_per_result = $4, ctr = $5, clicks = $6,
                   impressions = $7, cpm = $8, cpc = $9, frequency = $10, results = $11,
                   result_value = $12, scroll_stop_rate = $13, last_synced_at = $14,
                   updated_at = NOW()
             WHERE ad_id = $1
            "#,
        )
        .bind(&update.ad_id)
        .bind(m.spend)
        .bind(m.roas)
        .bind(m.cost_per_result)
        .bind(m.ctr)
        .bind(m.clicks)
        .bind(m.impressions)
        .bind(m.cpm)
        .bind(m.cpc)
        .bind(m.frequency)
        .bind(m.results)
        .bind(m.result_value)
        .bind(m.scroll_stop_rate)
        .bind(update.synced_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating metrics for ad {}", update.ad_id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_daily_metrics(&self, batch: &[DailyMetricRecord]) -> Result<u64> {
        let mut affected = 0;
        for chunk in batch.chunks(DAILY_BATCH_LIMIT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO daily_metrics (ad_id, account_id, date, {METRIC_COLUMNS}) "
            ));
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.ad_id.clone())
                    .push_bind(r.account_id)
                    .push_bind(r.date);
                push_metric_binds(&mut b, &r.metrics);
            });
            qb.push(
                r#"
                ON CONFLICT (ad_id, date) DO UPDATE SET
                    account_id = EXCLUDED.account_id,
                    spend = EXCLUDED.spend,
                    roas = EXCLUDED.roas,
                    cost_per_result = EXCLUDED.cost_per_result,
                    ctr = EXCLUDED.ctr,
                    clicks = EXCLUDED.clicks,
                    impressions = EXCLUDED.impressions,
                    cpm = EXCLUDED.cpm,
                    cpc = EXCLUDED.cpc,
                    frequency = EXCLUDED.frequency,
                    results = EXCLUDED.results,
                    result_value = EXCLUDED.result_value,
                    scroll_stop_rate = EXCLUDED.scroll_stop_rate,
                    updated_at = NOW()
                "#,
            );
            affected += qb
                .build()
                .execute(&self.pool)
                .await
                .context("upserting daily metrics")?
                .rows_affected();
        }
        Ok(affected)
    }

    async fn name_mappings(&self, account_id: Uuid) -> Result<Vec<NameMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, business_code, tag_type, tag_person, tag_style,
                   tag_product, tag_hook, tag_theme
              FROM name_mappings
             WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("loading name mappings")?;
        rows.iter()
            .map(|row| {
                Ok(NameMapping {
                    account_id: row.try_get("account_id")?,
                    business_code: row.try_get("business_code")?,
                    tags: tags_from_row(row)?,
                })
            })
            .collect()
    }

    async fn tagging_candidates(&self, account_id: Uuid) -> Result<Vec<TaggingCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT ad_id, name, business_code, tag_type, tag_person, tag_style,
                   tag_product, tag_hook, tag_theme, tag_source
              FROM ad_entities
             WHERE account_id = $1
               AND tag_source <> 'manual'
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("loading tagging candidates")?;
        rows.iter()
            .map(|row| {
                let provenance: String = row.try_get("tag_source")?;
                Ok(TaggingCandidate {
                    ad_id: row.try_get("ad_id")?,
                    name: row.try_get("name")?,
                    business_code: row.try_get("business_code")?,
                    tags: tags_from_row(row)?,
                    provenance: provenance.parse::<TagProvenance>()?,
                })
            })
            .collect()
    }

    async fn apply_tags(&self, updates: &[TagUpdate]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("opening tag transaction")?;
        let mut written = 0;
        for update in updates {
            written += sqlx::query(
                r#"
                UPDATE ad_entities
                   SET business_code = $2, tag_type = $3, tag_person = $4, tag_style = $5,
                       tag_product = $6, tag_hook = $7, tag_theme = $8, tag_source = $9,
                       updated_at = NOW()
                 WHERE ad_id = $1
                   AND tag_source <> 'manual'
                "#,
            )
            .bind(&update.ad_id)
            .bind(&update.business_code)
            .bind(&update.tags.creative_type)
            .bind(&update.tags.person)
            .bind(&update.tags.style)
            .bind(&update.tags.product)
            .bind(&update.tags.hook)
            .bind(&update.tags.theme)
            .bind(update.provenance.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("writing tags for ad {}", update.ad_id))?
            .rows_affected();
        }
        tx.commit().await.context("committing tag transaction")?;
        Ok(written)
    }

    async fn list_entities(&self, account_id: Option<Uuid>) -> Result<Vec<AdEntity>> {
        let sql = format!(
            r#"
            SELECT {ENTITY_COLUMNS}
              FROM ad_entities
             WHERE ($1::uuid IS NULL OR account_id = $1)
             ORDER BY ad_id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("listing ad entities")?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn list_daily_metrics(
        &self,
        account_id: Option<Uuid>,
    ) -> Result<Vec<DailyMetricRecord>> {
        let sql = format!(
            r#"
            SELECT ad_id, account_id, date, {METRIC_COLUMNS}
              FROM daily_metrics
             WHERE ($1::uuid IS NULL OR account_id = $1)
             ORDER BY ad_id, date
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("listing daily metrics")?;
        rows.iter()
            .map(|row| {
                Ok(DailyMetricRecord {
                    ad_id: row.try_get("ad_id")?,
                    account_id: row.try_get("account_id")?,
                    date: row.try_get("date")?,
                    metrics: metrics_from_row(row)?,
                })
            })
            .collect()
    }
}
