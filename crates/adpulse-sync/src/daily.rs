//! Per-day metrics over a date range, fetched in bounded chunks.

use std::collections::BTreeMap;

use adpulse_adapters::{
    parse_insight, FetchContext, GraphClient, GraphEndpoints, InsightRow, InsightsWindow, Paged,
    StopReason,
};
use adpulse_core::{AdAccount, DailyMetricRecord, DateRange, SoftError, SyncPhase};
use adpulse_storage::SyncStore;
use anyhow::Result;
use chrono::{Days, NaiveDate};
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_CHUNK_DAYS: u32 = 14;

/// Consecutive sub-ranges of at most `chunk_days` days covering `range`.
pub fn split_into_chunks(range: DateRange, chunk_days: u32) -> Vec<DateRange> {
    let step = u64::from(chunk_days.max(1));
    let mut chunks = Vec::new();
    let mut since = range.since;
    while since <= range.until {
        let until = since
            .checked_add_days(Days::new(step - 1))
            .map(|end| end.min(range.until))
            .unwrap_or(range.until);
        chunks.push(DateRange { since, until });
        match until.checked_add_days(Days::new(1)) {
            Some(next) => since = next,
            None => break,
        }
    }
    chunks
}

pub fn daily_record(account_id: Uuid, row: &InsightRow) -> Result<DailyMetricRecord, String> {
    let ad_id = row
        .ad_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "daily row without ad_id".to_string())?;
    let raw_date = row
        .date_start
        .as_deref()
        .ok_or_else(|| format!("daily row for ad {ad_id} without date_start"))?;
    let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d")
        .map_err(|err| format!("daily row for ad {ad_id} has bad date `{raw_date}`: {err}"))?;
    Ok(DailyMetricRecord {
        ad_id: ad_id.to_string(),
        account_id,
        date,
        metrics: parse_insight(row),
    })
}

/// Decode rows, keeping the last row per (ad id, date).
pub fn collect_records(
    account_id: Uuid,
    rows: &[InsightRow],
) -> (Vec<DailyMetricRecord>, Vec<SoftError>) {
    let mut by_key = BTreeMap::new();
    let mut errors = Vec::new();
    for row in rows {
        match daily_record(account_id, row) {
            Ok(record) => {
                by_key.insert((record.ad_id.clone(), record.date), record);
            }
            Err(message) => errors.push(SoftError::new(SyncPhase::DailyMetrics, message)),
        }
    }
    (by_key.into_values().collect(), errors)
}

#[derive(Debug, Clone, Default)]
pub struct DailyOutcome {
    pub chunks_total: usize,
    pub chunks_completed: usize,
    pub rows_upserted: u64,
    pub errors: Vec<SoftError>,
    pub stopped: Option<StopReason>,
}

pub struct DailyMetricsSync<'a> {
    pub client: &'a GraphClient,
    pub endpoints: &'a GraphEndpoints,
    pub store: &'a dyn SyncStore,
    pub chunk_days: u32,
}

impl DailyMetricsSync<'_> {
    /// Fetch and upsert chunk by chunk. Rows from finished chunks stay committed
    /// when a later chunk fails or the job stops.
    pub async fn run(
        &self,
        account: &AdAccount,
        range: DateRange,
        ctx: &FetchContext,
    ) -> Result<DailyOutcome> {
        let chunks = split_into_chunks(range, self.chunk_days);
        let mut outcome = DailyOutcome {
            chunks_total: chunks.len(),
            ..DailyOutcome::default()
        };

        for (index, chunk) in chunks.iter().enumerate() {
            let label = format!(
                "daily chunk {}/{} ({}..{})",
                index + 1,
                chunks.len(),
                chunk.since,
                chunk.until
            );
            if let Some(reason) = ctx.stop_reason() {
                if reason == StopReason::Deadline {
                    outcome
                        .errors
                        .push(ctx.timeout_notice(SyncPhase::DailyMetrics, &label));
                }
                outcome.stopped = Some(reason);
                break;
            }

            let url = match self
                .endpoints
                .insights_url(&account.platform_account_id, InsightsWindow::Daily(*chunk))
            {
                Ok(url) => url,
                Err(err) => {
                    outcome
                        .errors
                        .push(SoftError::new(SyncPhase::DailyMetrics, format!("{label}: {err}")));
                    break;
                }
            };

            let paged: Paged<InsightRow> = self
                .client
                .fetch_all(&url, &account.access_token, ctx, SyncPhase::DailyMetrics, &label)
                .await;
            let (records, decode_errors) = collect_records(account.id, &paged.items);
            outcome.errors.extend(decode_errors);
            if !records.is_empty() {
                outcome.rows_upserted += self.store.upsert_daily_metrics(&records).await?;
            }
            debug!(chunk = %label, rows = records.len(), "daily chunk stored");

            let failed = !paged.errors.is_empty();
            outcome.errors.extend(paged.errors);
            if paged.stopped.is_some() {
                outcome.stopped = paged.stopped;
                break;
            }
            if !failed {
                outcome.chunks_completed += 1;
            }
        }

        info!(
            chunks = outcome.chunks_total,
            completed = outcome.chunks_completed,
            rows = outcome.rows_upserted,
            "daily metrics finished"
        );
        Ok(outcome)
    }
}
