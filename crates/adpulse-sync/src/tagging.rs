//! Name-based tag resolution: structured parse, mapping-table fallback, untagged.

use std::collections::HashMap;
use std::path::Path;

use adpulse_core::{NameMapping, TagFields, TagProvenance};
use adpulse_storage::{SyncStore, TagUpdate};
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub const NAME_DELIMITER: char = '_';
/// Business code followed by one segment per tag category.
pub const EXPECTED_SEGMENTS: usize = 7;

const TAG_WRITE_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabEntry {
    pub token: String,
    pub label: String,
}

impl<'de> Deserialize<'de> for VocabEntry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Plain(String),
            Labeled { token: String, label: String },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Plain(label) => VocabEntry {
                token: label.clone(),
                label,
            },
            Raw::Labeled { token, label } => VocabEntry { token, label },
        })
    }
}

fn entry(token: &str, label: &str) -> VocabEntry {
    VocabEntry {
        token: token.to_string(),
        label: label.to_string(),
    }
}

fn plain(values: &[&str]) -> Vec<VocabEntry> {
    values.iter().map(|v| entry(v, v)).collect()
}

/// Lowercase alphanumerics only, so `UGCNative`, `ugc-native` and `UGC Native` compare equal.
fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Controlled vocabularies, one per tag category.
#[derive(Debug, Clone, Deserialize)]
pub struct TagVocabulary {
    pub creative_type: Vec<VocabEntry>,
    pub person: Vec<VocabEntry>,
    pub style: Vec<VocabEntry>,
    pub product: Vec<VocabEntry>,
    pub hook: Vec<VocabEntry>,
    pub theme: Vec<VocabEntry>,
}

impl Default for TagVocabulary {
    fn default() -> Self {
        Self {
            creative_type: plain(&["Video", "Image", "Carousel"]),
            person: plain(&["Creator", "Customer", "Founder", "Model", "Expert", "None"]),
            style: vec![
                entry("UGCNative", "UGC Native"),
                entry("Studio", "Studio"),
                entry("Testimonial", "Testimonial"),
                entry("Unboxing", "Unboxing"),
                entry("Tutorial", "Tutorial"),
                entry("Lifestyle", "Lifestyle"),
                entry("Motion", "Motion"),
            ],
            product: plain(&[
                "Serum",
                "Moisturizer",
                "Cleanser",
                "Toner",
                "Sunscreen",
                "Mask",
                "Bundle",
            ]),
            hook: vec![
                entry("ProblemCallout", "Problem Callout"),
                entry("Question", "Question"),
                entry("Statistic", "Statistic"),
                entry("BeforeAfter", "Before After"),
                entry("SocialProof", "Social Proof"),
                entry("Offer", "Offer"),
                entry("Curiosity", "Curiosity"),
            ],
            theme: plain(&[
                "Antiaging",
                "Hydration",
                "Acne",
                "Glow",
                "Sensitive",
                "Routine",
            ]),
        }
    }
}

impl TagVocabulary {
    /// Load `rules/tag_vocabulary.yaml` under `root`, or the built-in set when absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("tag_vocabulary.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn lookup<'a>(entries: &'a [VocabEntry], segment: &str) -> Option<&'a str> {
        let wanted = normalize_token(segment);
        if wanted.is_empty() {
            return None;
        }
        entries
            .iter()
            .find(|e| normalize_token(&e.token) == wanted)
            .map(|e| e.label.as_str())
    }
}

/// Mapping rows for one account keyed by normalized business code.
#[derive(Debug, Clone, Default)]
pub struct MappingIndex {
    by_code: HashMap<String, TagFields>,
}

impl MappingIndex {
    pub fn new(mappings: Vec<NameMapping>) -> Self {
        Self {
            by_code: mappings
                .into_iter()
                .map(|m| (m.business_code.trim().to_ascii_uppercase(), m.tags))
                .collect(),
        }
    }

    pub fn get(&self, code: &str) -> Option<&TagFields> {
        self.by_code.get(&code.trim().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagResolution {
    pub business_code: Option<String>,
    pub tags: TagFields,
    pub provenance: TagProvenance,
}

/// Leading name segment when it looks like a code: ASCII letters, digits, `-`.
pub fn extract_business_code(name: &str) -> Option<String> {
    let first = name.split(NAME_DELIMITER).next()?.trim();
    let valid = !first.is_empty()
        && first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    valid.then(|| first.to_ascii_uppercase())
}

#[derive(Debug, Clone, Default)]
pub struct TagResolver {
    vocabulary: TagVocabulary,
}

impl TagResolver {
    pub fn new(vocabulary: TagVocabulary) -> Self {
        Self { vocabulary }
    }

    /// Structured parse of `code_type_person_style_product_hook_theme`.
    pub fn parse_name(&self, name: &str) -> Option<TagFields> {
        let segments: Vec<&str> = name.trim().split(NAME_DELIMITER).collect();
        if segments.len() != EXPECTED_SEGMENTS {
            return None;
        }
        let v = &self.vocabulary;
        let pick = |entries: &[VocabEntry], segment: &str| {
            TagVocabulary::lookup(entries, segment).map(str::to_string)
        };
        Some(TagFields {
            creative_type: Some(pick(&v.creative_type, segments[1])?),
            person: Some(pick(&v.person, segments[2])?),
            style: Some(pick(&v.style, segments[3])?),
            product: Some(pick(&v.product, segments[4])?),
            hook: Some(pick(&v.hook, segments[5])?),
            theme: Some(pick(&v.theme, segments[6])?),
        })
    }

    /// Parse, then mapping lookup, then untagged. Callers skip manual entities.
    pub fn resolve(&self, name: &str, mappings: &MappingIndex) -> TagResolution {
        let business_code = extract_business_code(name);
        if let Some(tags) = self.parse_name(name) {
            return TagResolution {
                business_code,
                tags,
                provenance: TagProvenance::Parsed,
            };
        }
        if let Some(tags) = business_code.as_deref().and_then(|code| mappings.get(code)) {
            return TagResolution {
                tags: tags.clone(),
                business_code,
                provenance: TagProvenance::CsvMatch,
            };
        }
        TagResolution {
            business_code,
            tags: TagFields::empty(),
            provenance: TagProvenance::Untagged,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPhaseOutcome {
    pub parsed: i64,
    pub csv_matched: i64,
    pub untagged: i64,
    pub manual_preserved: i64,
    pub rewritten: u64,
}

/// Re-resolve every non-manual entity of an account and write the ones that changed.
pub async fn resolve_account_tags(
    store: &dyn SyncStore,
    resolver: &TagResolver,
    account_id: Uuid,
    mappings: &MappingIndex,
    cancel: &CancellationToken,
) -> Result<TagPhaseOutcome> {
    let mut outcome = TagPhaseOutcome {
        manual_preserved: store.manual_ad_ids(account_id).await?.len() as i64,
        ..TagPhaseOutcome::default()
    };

    let mut updates = Vec::new();
    for candidate in store.tagging_candidates(account_id).await? {
        let resolved = resolver.resolve(&candidate.name, mappings);
        match resolved.provenance {
            TagProvenance::Parsed => outcome.parsed += 1,
            TagProvenance::CsvMatch => outcome.csv_matched += 1,
            TagProvenance::Untagged => outcome.untagged += 1,
            TagProvenance::Manual => {}
        }
        let unchanged = candidate.provenance == resolved.provenance
            && candidate.tags == resolved.tags
            && candidate.business_code == resolved.business_code;
        if !unchanged {
            updates.push(TagUpdate {
                ad_id: candidate.ad_id,
                business_code: resolved.business_code,
                tags: resolved.tags,
                provenance: resolved.provenance,
            });
        }
    }

    for batch in updates.chunks(TAG_WRITE_BATCH) {
        if cancel.is_cancelled() {
            break;
        }
        outcome.rewritten += store.apply_tags(batch).await?;
    }

    info!(
        parsed = outcome.parsed,
        csv_matched = outcome.csv_matched,
        untagged = outcome.untagged,
        manual = outcome.manual_preserved,
        rewritten = outcome.rewritten,
        "tag resolution finished"
    );
    Ok(outcome)
}
