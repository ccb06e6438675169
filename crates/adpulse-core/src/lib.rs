//! Core domain model for adpulse: sync jobs, ad entities, daily metrics and tag state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-core";

/// Number of soft errors surfaced to users per job.
pub const VISIBLE_ERROR_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// What triggered a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Manual,
    Initial,
    Scheduled,
}

text_enum!(SyncKind, "sync kind", {
    Manual => "manual",
    Initial => "initial",
    Scheduled => "scheduled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

text_enum!(JobStatus, "job status", {
    Running => "running",
    Completed => "completed",
    CompletedWithErrors => "completed_with_errors",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// Origin of an entity's tag assignment.
///
/// `Manual` sits at the top of the lattice: the pipeline never replaces it.
/// Every other value is recomputed on each sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagProvenance {
    Parsed,
    CsvMatch,
    Manual,
    Untagged,
}

text_enum!(TagProvenance, "tag provenance", {
    Parsed => "parsed",
    CsvMatch => "csv_match",
    Manual => "manual",
    Untagged => "untagged",
});

impl TagProvenance {
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }
}

/// Pipeline stage a soft error was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Recovery,
    Entities,
    Insights,
    DailyMetrics,
    Tagging,
    Finalize,
}

text_enum!(SyncPhase, "sync phase", {
    Recovery => "recovery",
    Entities => "entities",
    Insights => "insights",
    DailyMetrics => "daily_metrics",
    Tagging => "tagging",
    Finalize => "finalize",
});

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagFields {
    pub creative_type: Option<String>,
    pub person: Option<String>,
    pub style: Option<String>,
    pub product: Option<String>,
    pub hook: Option<String>,
    pub theme: Option<String>,
}

impl TagFields {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.creative_type.is_none()
            && self.person.is_none()
            && self.style.is_none()
            && self.product.is_none()
            && self.hook.is_none()
            && self.theme.is_none()
    }
}

/// Canonical flat metric record. Absent source values are stored as zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub spend: f64,
    pub roas: f64,
    pub cost_per_result: f64,
    pub ctr: f64,
    pub clicks: i64,
    pub impressions: i64,
    pub cpm: f64,
    pub cpc: f64,
    pub frequency: f64,
    pub results: i64,
    pub result_value: f64,
    pub scroll_stop_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl DateRange {
    pub fn new(since: NaiveDate, until: NaiveDate) -> Option<Self> {
        (since <= until).then_some(Self { since, until })
    }

    /// Inclusive number of calendar days covered.
    pub fn days(&self) -> i64 {
        (self.until - self.since).num_days() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftError {
    pub phase: SyncPhase,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SoftError {
    pub fn new(phase: SyncPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobCounters {
    pub entities_fetched: i64,
    pub entities_upserted: i64,
    pub metrics_only_updated: i64,
    pub daily_rows_upserted: i64,
    pub tags_parsed: i64,
    pub tags_csv_matched: i64,
    pub tags_untagged: i64,
    pub tags_manual_preserved: i64,
}

/// Mutable part of a job written by every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub counters: JobCounters,
    pub api_calls: i64,
    pub errors: Vec<SoftError>,
}

impl JobProgress {
    pub fn record(&mut self, error: SoftError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: SyncKind,
    pub status: JobStatus,
    pub since: NaiveDate,
    pub until: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub progress: JobProgress,
}

impl SyncJob {
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.started_at)
    }

    /// Copy of the job carrying only the first `limit` soft errors.
    pub fn with_visible_errors(&self, limit: usize) -> Self {
        let mut job = self.clone();
        job.progress.errors.truncate(limit);
        job
    }
}

/// Parameters for inserting a fresh running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncJob {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: SyncKind,
    pub range: DateRange,
    pub started_at: DateTime<Utc>,
}

impl NewSyncJob {
    pub fn into_running(self) -> SyncJob {
        SyncJob {
            id: self.id,
            account_id: self.account_id,
            kind: self.kind,
            status: JobStatus::Running,
            since: self.range.since,
            until: self.range.until,
            started_at: self.started_at,
            completed_at: None,
            duration_ms: None,
            progress: JobProgress::default(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdAccount {
    pub id: Uuid,
    pub name: String,
    pub platform_account_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub is_active: bool,
}

impl fmt::Debug for AdAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdAccount")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("platform_account_id", &self.platform_account_id)
            .field("access_token", &"<redacted>")
            .field("is_active", &self.is_active)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdEntity {
    pub ad_id: String,
    pub account_id: Uuid,
    pub name: String,
    pub status: Option<String>,
    pub campaign_name: Option<String>,
    pub adset_name: Option<String>,
    pub thumbnail_url: Option<String>,
    pub video_id: Option<String>,
    pub metrics: MetricSnapshot,
    pub business_code: Option<String>,
    pub tags: TagFields,
    pub tag_source: TagProvenance,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricRecord {
    pub ad_id: String,
    pub account_id: Uuid,
    pub date: NaiveDate,
    pub metrics: MetricSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMapping {
    pub account_id: Uuid,
    pub business_code: String,
    pub tags: TagFields,
}
