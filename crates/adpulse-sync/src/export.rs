//! Parquet snapshots of synced entities and daily metrics, with a checksum manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use adpulse_core::{AdEntity, DailyMetricRecord, MetricSnapshot};
use adpulse_storage::SyncStore;
use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub account_id: Option<Uuid>,
    pub files: Vec<ExportFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `ad_entities.parquet`, `daily_metrics.parquet` and `manifest.json` into `out_dir`.
///
/// Encoding and file writes run on the blocking pool.
pub async fn export_snapshot(
    store: &dyn SyncStore,
    out_dir: &Path,
    account_id: Option<Uuid>,
) -> Result<ExportManifest> {
    let entities = store.list_entities(account_id).await?;
    let daily = store.list_daily_metrics(account_id).await?;

    let (entity_rows, daily_rows) = (entities.len(), daily.len());
    let dir = out_dir.to_path_buf();
    let manifest = tokio::task::spawn_blocking(move || {
        write_snapshot(&dir, account_id, &entities, &daily)
    })
    .await
    .context("export task panicked")??;

    info!(
        entities = entity_rows,
        daily_rows,
        dir = %out_dir.display(),
        "export written"
    );
    Ok(manifest)
}

fn write_snapshot(
    out_dir: &Path,
    account_id: Option<Uuid>,
    entities: &[AdEntity],
    daily: &[DailyMetricRecord],
) -> Result<ExportManifest> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let entities_path = out_dir.join("ad_entities.parquet");
    let daily_path = out_dir.join("daily_metrics.parquet");
    write_entities_parquet(&entities_path, entities)?;
    write_daily_parquet(&daily_path, daily)?;

    let manifest = ExportManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        generated_at: Utc::now(),
        account_id,
        files: vec![
            manifest_entry("ad_entities", out_dir, &entities_path, entities.len())?,
            manifest_entry("daily_metrics", out_dir, &daily_path, daily.len())?,
        ],
    };

    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

fn write_parquet(path: &PathBuf, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn metric_fields() -> Vec<ArrowField> {
    vec![
        ArrowField::new("spend", DataType::Float64, false),
        ArrowField::new("roas", DataType::Float64, false),
        ArrowField::new("cost_per_result", DataType::Float64, false),
        ArrowField::new("ctr", DataType::Float64, false),
        ArrowField::new("clicks", DataType::Int64, false),
        ArrowField::new("impressions", DataType::Int64, false),
        ArrowField::new("cpm", DataType::Float64, false),
        ArrowField::new("cpc", DataType::Float64, false),
        ArrowField::new("frequency", DataType::Float64, false),
        ArrowField::new("results", DataType::Int64, false),
        ArrowField::new("result_value", DataType::Float64, false),
        ArrowField::new("scroll_stop_rate", DataType::Float64, false),
    ]
}

fn metric_columns<'a>(metrics: impl Iterator<Item = &'a MetricSnapshot> + Clone) -> Vec<ArrayRef> {
    let float = |f: fn(&MetricSnapshot) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(metrics.clone().map(f).collect::<Vec<_>>()))
    };
    let int = |f: fn(&MetricSnapshot) -> i64| -> ArrayRef {
        Arc::new(Int64Array::from(metrics.clone().map(f).collect::<Vec<_>>()))
    };
    vec![
        float(|m| m.spend),
        float(|m| m.roas),
        float(|m| m.cost_per_result),
        float(|m| m.ctr),
        int(|m| m.clicks),
        int(|m| m.impressions),
        float(|m| m.cpm),
        float(|m| m.cpc),
        float(|m| m.frequency),
        int(|m| m.results),
        float(|m| m.result_value),
        float(|m| m.scroll_stop_rate),
    ]
}

fn opt_strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn write_entities_parquet(path: &PathBuf, entities: &[AdEntity]) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("ad_id", DataType::Utf8, false),
        ArrowField::new("account_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, true),
        ArrowField::new("campaign_name", DataType::Utf8, true),
        ArrowField::new("adset_name", DataType::Utf8, true),
        ArrowField::new("business_code", DataType::Utf8, true),
        ArrowField::new("tag_type", DataType::Utf8, true),
        ArrowField::new("tag_person", DataType::Utf8, true),
        ArrowField::new("tag_style", DataType::Utf8, true),
        ArrowField::new("tag_product", DataType::Utf8, true),
        ArrowField::new("tag_hook", DataType::Utf8, true),
        ArrowField::new("tag_theme", DataType::Utf8, true),
        ArrowField::new("tag_source", DataType::Utf8, false),
        ArrowField::new("last_synced_at", DataType::Utf8, false),
    ];
    fields.extend(metric_fields());
    let schema = Arc::new(Schema::new(fields));

    let account_ids: Vec<String> = entities.iter().map(|e| e.account_id.to_string()).collect();
    let synced: Vec<String> = entities.iter().map(|e| e.last_synced_at.to_rfc3339()).collect();
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            entities.iter().map(|e| e.ad_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            account_ids.iter().map(String::as_str).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            entities.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        )),
        opt_strings(entities.iter().map(|e| e.status.as_deref())),
        opt_strings(entities.iter().map(|e| e.campaign_name.as_deref())),
        opt_strings(entities.iter().map(|e| e.adset_name.as_deref())),
        opt_strings(entities.iter().map(|e| e.business_code.as_deref())),
        opt_strings(entities.iter().map(|e| e.tags.creative_type.as_deref())),
        opt_strings(entities.iter().map(|e| e.tags.person.as_deref())),
        opt_strings(entities.iter().map(|e| e.tags.style.as_deref())),
        opt_strings(entities.iter().map(|e| e.tags.product.as_deref())),
        opt_strings(entities.iter().map(|e| e.tags.hook.as_deref())),
        opt_strings(entities.iter().map(|e| e.tags.theme.as_deref())),
        Arc::new(StringArray::from(
            entities.iter().map(|e| e.tag_source.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            synced.iter().map(String::as_str).collect::<Vec<_>>(),
        )),
    ];
    columns.extend(metric_columns(entities.iter().map(|e| &e.metrics)));

    let batch = RecordBatch::try_new(schema, columns).context("building ad_entities record batch")?;
    write_parquet(path, batch)
}

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn write_daily_parquet(path: &PathBuf, rows: &[DailyMetricRecord]) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("ad_id", DataType::Utf8, false),
        ArrowField::new("account_id", DataType::Utf8, false),
        ArrowField::new("date", DataType::Date32, false),
    ];
    fields.extend(metric_fields());
    let schema = Arc::new(Schema::new(fields));

    let account_ids: Vec<String> = rows.iter().map(|r| r.account_id.to_string()).collect();
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.ad_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            account_ids.iter().map(String::as_str).collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            rows.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>(),
        )),
    ];
    columns.extend(metric_columns(rows.iter().map(|r| &r.metrics)));

    let batch = RecordBatch::try_new(schema, columns).context("building daily_metrics record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &PathBuf, rows: usize) -> Result<ExportFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_core::{TagFields, TagProvenance};
    use adpulse_storage::MemoryStore;

    fn entity(ad_id: &str, account_id: Uuid) -> AdEntity {
        AdEntity {
            ad_id: ad_id.into(),
            account_id,
            name: format!("ad {ad_id}"),
            status: Some("ACTIVE".into()),
            campaign_name: None,
            adset_name: None,
            thumbnail_url: None,
            video_id: None,
            metrics: MetricSnapshot {
                spend: 12.5,
                clicks: 3,
                ..MetricSnapshot::default()
            },
            business_code: None,
            tags: TagFields::empty(),
            tag_source: TagProvenance::Untagged,
            last_synced_at: Utc::now(),
        }
    }

    #[test]
    fn epoch_day_numbers() {
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), 1);
    }

    #[tokio::test]
    async fn export_writes_files_and_checksums() {
        let store = MemoryStore::new();
        let account = Uuid::new_v4();
        store
            .upsert_entities(&[entity("1", account), entity("2", account)])
            .await
            .unwrap();
        store
            .upsert_daily_metrics(&[DailyMetricRecord {
                ad_id: "1".into(),
                account_id: account,
                date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
                metrics: MetricSnapshot::default(),
            }])
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let manifest = export_snapshot(&store, dir.path(), Some(account)).await.unwrap();

        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].rows, 2);
        assert_eq!(manifest.files[1].rows, 1);
        for file in &manifest.files {
            assert_eq!(file.sha256.len(), 64);
            assert!(dir.path().join(&file.path).exists());
        }
        assert!(dir.path().join("manifest.json").exists());
    }

    #[tokio::test]
    async fn export_creates_missing_output_dir_and_manifest_matches() {
        let store = MemoryStore::new();
        store.upsert_entities(&[entity("1", Uuid::nil())]).await.unwrap();
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("exports").join("latest");

        let manifest = export_snapshot(&store, &out, None).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(written["files"][0]["sha256"], manifest.files[0].sha256.as_str());
        assert_eq!(written["files"][0]["rows"], 1);
    }

    #[tokio::test]
    async fn empty_store_still_exports_valid_files() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let manifest = export_snapshot(&store, dir.path(), None).await.unwrap();
        assert!(manifest.files.iter().all(|f| f.rows == 0 && f.bytes > 0));
    }
}
