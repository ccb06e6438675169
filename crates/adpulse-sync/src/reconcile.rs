//! Merge fetched ads with lifetime metrics and write them back without
//! touching manually curated tags.

use std::collections::{HashMap, HashSet};

use adpulse_adapters::{parse_insight, AdRow, InsightRow};
use adpulse_core::{AdEntity, MetricSnapshot, SoftError, SyncPhase};
use adpulse_storage::{MetricsUpdate, SyncStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::tagging::{MappingIndex, TagResolver};

pub const UPSERT_BATCH_SIZE: usize = 100;
pub const METRICS_UPDATE_CONCURRENCY: usize = 50;

/// Lifetime metrics by ad id, plus what to do for ads without a fresh row.
#[derive(Debug, Clone, Default)]
pub struct MetricsSource {
    pub fresh: HashMap<String, MetricSnapshot>,
    /// True when the insights walk finished without errors.
    pub complete: bool,
    /// Stored metrics, consulted only when the walk was incomplete.
    pub stored: HashMap<String, MetricSnapshot>,
}

impl MetricsSource {
    pub fn from_rows(rows: &[InsightRow], complete: bool) -> Self {
        let fresh = rows
            .iter()
            .filter_map(|row| {
                let id = row.ad_id.as_deref().filter(|id| !id.is_empty())?;
                Some((id.to_string(), parse_insight(row)))
            })
            .collect();
        Self {
            fresh,
            complete,
            stored: HashMap::new(),
        }
    }

    /// A complete walk that skipped an ad means it had no delivery: zero.
    /// An incomplete one falls back to what is stored, or nothing.
    pub fn for_ad(&self, ad_id: &str) -> Option<MetricSnapshot> {
        if let Some(metrics) = self.fresh.get(ad_id) {
            return Some(*metrics);
        }
        if self.complete {
            Some(MetricSnapshot::default())
        } else {
            self.stored.get(ad_id).copied()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub full: Vec<AdEntity>,
    pub metrics_only: Vec<MetricsUpdate>,
    pub skipped_manual: usize,
}

pub struct PlanInput<'a> {
    pub account_id: Uuid,
    pub metrics: &'a MetricsSource,
    pub manual_ids: &'a HashSet<String>,
    pub resolver: &'a TagResolver,
    pub mappings: &'a MappingIndex,
    pub synced_at: DateTime<Utc>,
}

/// Split fetched ads into full upserts and metrics-only updates for manual rows.
/// Duplicate ad ids keep their first occurrence.
pub fn plan_reconciliation(ads: Vec<AdRow>, input: &PlanInput<'_>) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let mut seen = HashSet::new();

    for ad in ads {
        if ad.id.is_empty() || !seen.insert(ad.id.clone()) {
            continue;
        }
        let metrics = input.metrics.for_ad(&ad.id);

        if input.manual_ids.contains(&ad.id) {
            match metrics {
                Some(metrics) => plan.metrics_only.push(MetricsUpdate {
                    ad_id: ad.id,
                    metrics,
                    synced_at: input.synced_at,
                }),
                None => plan.skipped_manual += 1,
            }
            continue;
        }

        let resolved = input.resolver.resolve(&ad.name, input.mappings);
        let status = ad.display_status();
        let creative = ad.creative.unwrap_or_default();
        plan.full.push(AdEntity {
            account_id: input.account_id,
            status,
            campaign_name: ad.campaign.and_then(|c| c.name),
            adset_name: ad.adset.and_then(|a| a.name),
            thumbnail_url: creative.thumbnail_url,
            video_id: creative.video_id,
            metrics: metrics.unwrap_or_default(),
            business_code: resolved.business_code,
            tags: resolved.tags,
            tag_source: resolved.provenance,
            last_synced_at: input.synced_at,
            name: ad.name,
            ad_id: ad.id,
        });
    }

    plan
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub upserted: u64,
    pub metrics_updated: u64,
    pub errors: Vec<SoftError>,
}

/// Write the plan: full upserts in batches, then bounded concurrent metrics
/// updates where every update settles before the next group starts.
pub async fn apply_plan(
    store: &dyn SyncStore,
    plan: &ReconcilePlan,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    for batch in plan.full.chunks(UPSERT_BATCH_SIZE) {
        if cancel.is_cancelled() {
            return Ok(outcome);
        }
        outcome.upserted += store.upsert_entities(batch).await?;
        debug!(rows = batch.len(), "entity batch upserted");
    }

    for group in plan.metrics_only.chunks(METRICS_UPDATE_CONCURRENCY) {
        if cancel.is_cancelled() {
            break;
        }
        let settled = join_all(group.iter().map(|update| store.update_entity_metrics(update))).await;
        for (update, result) in group.iter().zip(settled) {
            match result {
                Ok(true) => outcome.metrics_updated += 1,
                Ok(false) => outcome.errors.push(SoftError::new(
                    SyncPhase::Entities,
                    format!("metrics update for ad {} matched no row", update.ad_id),
                )),
                Err(err) => outcome.errors.push(SoftError::new(
                    SyncPhase::Entities,
                    format!("metrics update for ad {} failed: {err:#}", update.ad_id),
                )),
            }
        }
    }

    info!(
        upserted = outcome.upserted,
        metrics_only = outcome.metrics_updated,
        failed = outcome.errors.len(),
        "reconciliation applied"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_core::TagProvenance;
    use adpulse_storage::MemoryStore;

    fn ads(json: &str) -> Vec<AdRow> {
        serde_json::from_str(json).unwrap()
    }

    fn source(json: &str, complete: bool) -> MetricsSource {
        let rows: Vec<InsightRow> = serde_json::from_str(json).unwrap();
        MetricsSource::from_rows(&rows, complete)
    }

    fn plan(rows: Vec<AdRow>, metrics: &MetricsSource, manual: &[&str]) -> ReconcilePlan {
        let manual_ids = manual.iter().map(|s| s.to_string()).collect();
        let resolver = TagResolver::default();
        let mappings = MappingIndex::default();
        plan_reconciliation(
            rows,
            &PlanInput {
                account_id: Uuid::nil(),
                metrics,
                manual_ids: &manual_ids,
                resolver: &resolver,
                mappings: &mappings,
                synced_at: Utc::now(),
            },
        )
    }

    #[test]
    fn manual_ads_only_get_metrics() {
        let rows = ads(
            r#"[
                {"id": "1", "name": "ABC001_Video_Creator_UGCNative_Serum_ProblemCallout_Antiaging",
                 "effective_status": "ACTIVE", "campaign": {"name": "Spring"},
                 "creative": {"thumbnail_url": "https://cdn/t.jpg", "video_id": "v1"}},
                {"id": "2", "name": "hand tagged"}
            ]"#,
        );
        let metrics = source(r#"[{"ad_id": "1", "spend": "5"}, {"ad_id": "2", "spend": "9"}]"#, true);
        let plan = plan(rows, &metrics, &["2"]);

        assert_eq!(plan.full.len(), 1);
        let entity = &plan.full[0];
        assert_eq!(entity.tag_source, TagProvenance::Parsed);
        assert_eq!(entity.campaign_name.as_deref(), Some("Spring"));
        assert_eq!(entity.video_id.as_deref(), Some("v1"));
        assert_eq!(entity.status.as_deref(), Some("ACTIVE"));
        assert_eq!(entity.metrics.spend, 5.0);

        assert_eq!(plan.metrics_only.len(), 1);
        assert_eq!(plan.metrics_only[0].ad_id, "2");
        assert_eq!(plan.metrics_only[0].metrics.spend, 9.0);
    }

    #[test]
    fn ads_missing_from_a_complete_walk_get_zero_metrics() {
        let plan = plan(ads(r#"[{"id": "1", "name": "x"}]"#), &source("[]", true), &[]);
        assert_eq!(plan.full[0].metrics, MetricSnapshot::default());
    }

    #[test]
    fn incomplete_walk_keeps_stored_metrics_and_skips_unknown_manual() {
        let mut metrics = source("[]", false);
        metrics.stored.insert(
            "1".into(),
            MetricSnapshot {
                spend: 42.0,
                ..MetricSnapshot::default()
            },
        );
        let plan = plan(
            ads(r#"[{"id": "1", "name": "x"}, {"id": "2", "name": "y"}]"#),
            &metrics,
            &["2"],
        );
        assert_eq!(plan.full[0].metrics.spend, 42.0);
        assert!(plan.metrics_only.is_empty());
        assert_eq!(plan.skipped_manual, 1);
    }

    #[test]
    fn duplicate_ad_ids_are_planned_once() {
        let plan = plan(
            ads(r#"[{"id": "1", "name": "first"}, {"id": "1", "name": "second"}]"#),
            &source("[]", true),
            &[],
        );
        assert_eq!(plan.full.len(), 1);
        assert_eq!(plan.full[0].name, "first");
    }

    #[tokio::test]
    async fn apply_writes_entities_and_reports_missing_metrics_rows() {
        let store = MemoryStore::new();
        let metrics = source(r#"[{"ad_id": "1", "spend": "5"}, {"ad_id": "2", "spend": "9"}]"#, true);
        let plan = plan(
            ads(r#"[{"id": "1", "name": "x"}, {"id": "2", "name": "y"}]"#),
            &metrics,
            &["2"],
        );

        let outcome = apply_plan(&store, &plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.upserted, 1);
        assert_eq!(outcome.metrics_updated, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].message.contains("matched no row"));
        assert_eq!(store.list_entities(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_apply_writes_nothing() {
        let store = MemoryStore::new();
        let plan = plan(ads(r#"[{"id": "1", "name": "x"}]"#), &source("[]", true), &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = apply_plan(&store, &plan, &cancel).await.unwrap();
        assert_eq!(outcome.upserted, 0);
        assert!(store.list_entities(None).await.unwrap().is_empty());
    }
}
