//! Raw insight rows to canonical [`MetricSnapshot`]s.
//!
//! Every absent or unparseable source value becomes zero, so "no data" and
//! "zero performance" are indistinguishable downstream.

use adpulse_core::MetricSnapshot;

use crate::graph::{ActionValue, InsightRow, LooseNumber};

/// Action types counted as a result, in priority order.
pub const PURCHASE_ACTION_TYPES: &[&str] = &[
    "purchase",
    "offsite_conversion.fb_pixel_purchase",
    "omni_purchase",
];

fn value(field: Option<LooseNumber>) -> f64 {
    field.map(|n| n.0).unwrap_or(0.0)
}

fn count(field: Option<LooseNumber>) -> i64 {
    value(field).round() as i64
}

fn purchase_value(actions: Option<&[ActionValue]>) -> Option<f64> {
    let actions = actions?;
    PURCHASE_ACTION_TYPES.iter().find_map(|wanted| {
        actions
            .iter()
            .find(|a| a.action_type.as_deref() == Some(*wanted))
            .map(|a| value(a.value))
    })
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

pub fn parse_insight(row: &InsightRow) -> MetricSnapshot {
    let spend = value(row.spend);
    let clicks = count(row.clicks);
    let impressions = count(row.impressions);
    let results = purchase_value(row.actions.as_deref())
        .map(|n| n.round() as i64)
        .unwrap_or(0);
    let result_value = purchase_value(row.action_values.as_deref()).unwrap_or(0.0);

    let roas = purchase_value(row.purchase_roas.as_deref())
        .unwrap_or_else(|| ratio(result_value, spend));
    let cost_per_result = purchase_value(row.cost_per_action_type.as_deref())
        .unwrap_or_else(|| ratio(spend, results as f64));

    MetricSnapshot {
        spend,
        roas,
        cost_per_result,
        ctr: value(row.ctr),
        clicks,
        impressions,
        cpm: value(row.cpm),
        cpc: value(row.cpc),
        frequency: value(row.frequency),
        results,
        result_value,
        // Click-through proxy kept under its historical name.
        scroll_stop_rate: ratio(clicks as f64, impressions as f64),
    }
}
