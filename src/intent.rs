//! Intent detection for chat utterances.
//!
//! [`IntentDetector`] is the pluggable seam; the router only sees ordered
//! [`Intent`]s. The shipped [`KeywordIntentDetector`] splits an utterance into
//! clauses on conjunctions and punctuation, scores each clause against
//! weighted cue phrases per label, and combines matched cue weights with a
//! noisy-OR:
//!
//! ```text
//! confidence = 1 - Π (1 - weight_i)
//! ```
//!
//! Each clause contributes its best label. A label detected in several
//! clauses appears once, at its first position, with the highest confidence
//! and merged slots. Thresholding is the router's job.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use estate_harness_core::models::Intent;

use crate::structured::parse_price;

pub const MARKET_ANALYSIS: &str = "market_analysis";
pub const LEGAL: &str = "legal";
pub const PROPERTY_SEARCH: &str = "property_search";
pub const TRANSACTION_HISTORY: &str = "transaction_history";
pub const FREE_FORM: &str = "free_form";

/// Slot names filled by the keyword detector.
pub mod slots {
    pub const AREA: &str = "area";
    pub const BEDROOMS: &str = "bedrooms";
    pub const MAX_PRICE: &str = "max_price";
    pub const PROPERTY_REF: &str = "property_ref";
    pub const CLIENT_ID: &str = "client_id";
    pub const QUERY: &str = "query";
}

pub trait IntentDetector: Send + Sync {
    /// Intents in utterance order. May be empty.
    fn detect(&self, utterance: &str) -> Vec<Intent>;
}

const CUES: &[(&str, &[(&str, f64)])] = &[
    (
        MARKET_ANALYSIS,
        &[
            ("rental yield", 0.8),
            ("yield", 0.6),
            ("market", 0.5),
            ("trend", 0.6),
            ("trends", 0.6),
            ("average price", 0.7),
            ("price per sq", 0.7),
            ("occupancy", 0.6),
            ("roi", 0.6),
            ("return on investment", 0.7),
            ("appreciation", 0.5),
            ("growth", 0.4),
            ("investment", 0.3),
            ("forecast", 0.5),
        ],
    ),
    (
        LEGAL,
        &[
            ("golden visa", 0.8),
            ("visa", 0.7),
            ("residency", 0.7),
            ("legal", 0.7),
            ("law", 0.6),
            ("laws", 0.6),
            ("regulation", 0.6),
            ("regulations", 0.6),
            ("contract", 0.6),
            ("clause", 0.6),
            ("eviction", 0.6),
            ("tenancy", 0.5),
            ("freehold", 0.5),
            ("ownership", 0.4),
            ("lease", 0.4),
            ("rules", 0.3),
            ("requirements", 0.3),
        ],
    ),
    (
        PROPERTY_SEARCH,
        &[
            ("listing", 0.6),
            ("listings", 0.6),
            ("apartment", 0.5),
            ("apartments", 0.5),
            ("villa", 0.5),
            ("villas", 0.5),
            ("townhouse", 0.5),
            ("studio", 0.5),
            ("bedroom", 0.5),
            ("for sale", 0.5),
            ("looking for", 0.4),
            ("buy", 0.4),
            ("budget", 0.4),
            ("find", 0.3),
            ("property", 0.3),
            ("properties", 0.3),
            ("under", 0.2),
        ],
    ),
    (
        TRANSACTION_HISTORY,
        &[
            ("sale history", 0.8),
            ("past sales", 0.8),
            ("recent sales", 0.8),
            ("price paid", 0.7),
            ("transaction", 0.7),
            ("transactions", 0.7),
            ("sold", 0.6),
            ("history", 0.5),
            ("deals", 0.5),
        ],
    ),
];

static CLAUSE_SPLIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:[,;&]|\band\b|\balso\b|\bplus\b|\bas well as\b|\bthen\b)\s*")
        .expect("valid regex")
});
static AREA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:in|at|around|near|for)\s+((?:[A-Z][a-zA-Z]+)(?:\s+[A-Z][a-zA-Z]+){0,3})")
        .expect("valid regex")
});
static BEDROOMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\s*(?:-\s*)?(?:bed(?:room)?s?|br)\b").expect("valid regex")
});
static BUDGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:under|below|max(?:imum)?|up to|less than|budget(?:\s+of)?)\s*(?:aed|usd|\$)?\s*([\d][\d,.]*\s*(?:k|m|mn|million)?)\b")
        .expect("valid regex")
});
static CLIENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(C-\d{1,8})\b").expect("valid regex"));
static PROPERTY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-BD-Z][A-Z]{0,2}-\d{1,6})\b").expect("valid regex"));

/// True when `cue` occurs in `hay` on word boundaries.
fn contains_phrase(hay: &str, cue: &str) -> bool {
    hay.match_indices(cue).any(|(start, _)| {
        let end = start + cue.len();
        let before = hay[..start].chars().next_back();
        let after = hay[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn noisy_or(weights: impl Iterator<Item = f64>) -> f64 {
    1.0 - weights.fold(1.0, |miss, w| miss * (1.0 - w.clamp(0.0, 1.0)))
}

/// Slots found in `clause`.
pub fn extract_slots(clause: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(c) = AREA.captures(clause) {
        out.insert(slots::AREA.to_string(), c[1].to_string());
    }
    if let Some(c) = BEDROOMS.captures(clause) {
        out.insert(slots::BEDROOMS.to_string(), c[1].to_string());
    } else if contains_phrase(&clause.to_lowercase(), "studio") {
        out.insert(slots::BEDROOMS.to_string(), "0".to_string());
    }
    if let Some(price) = BUDGET.captures(clause).and_then(|c| parse_price(&c[1])) {
        out.insert(slots::MAX_PRICE.to_string(), format!("{}", price));
    }
    if let Some(c) = CLIENT_ID.captures(clause) {
        out.insert(slots::CLIENT_ID.to_string(), c[1].to_uppercase());
    }
    if let Some(c) = PROPERTY_ID.captures(clause) {
        out.insert(slots::PROPERTY_REF.to_string(), c[1].to_string());
    }
    out
}

/// Weighted cue matching per clause, combined by noisy-OR.
#[derive(Debug, Clone, Default)]
pub struct KeywordIntentDetector;

impl KeywordIntentDetector {
    pub fn new() -> Self {
        Self
    }

    fn score_clause(&self, clause: &str) -> Option<(&'static str, f64)> {
        let lower = clause.to_lowercase();
        CUES.iter()
            .map(|(label, cues)| {
                let matched = cues
                    .iter()
                    .filter(|(cue, _)| contains_phrase(&lower, cue))
                    .map(|(_, w)| *w);
                (*label, noisy_or(matched))
            })
            .filter(|(_, confidence)| *confidence > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl IntentDetector for KeywordIntentDetector {
    fn detect(&self, utterance: &str) -> Vec<Intent> {
        let mut intents: Vec<Intent> = Vec::new();
        // Slots from clauses with no cue attach to the nearest intent.
        let mut orphan_slots: BTreeMap<String, String> = BTreeMap::new();

        for clause in CLAUSE_SPLIT.split(utterance).map(str::trim).filter(|c| !c.is_empty()) {
            let clause_slots = extract_slots(clause);
            let Some((label, confidence)) = self.score_clause(clause) else {
                match intents.last_mut() {
                    Some(prev) => merge_missing(&mut prev.slot_values, clause_slots),
                    None => merge_missing(&mut orphan_slots, clause_slots),
                }
                continue;
            };

            if let Some(existing) = intents.iter_mut().find(|i| i.label == label) {
                existing.confidence = existing.confidence.max(confidence);
                merge_missing(&mut existing.slot_values, clause_slots);
                if let Some(query) = existing.slot_values.get_mut(slots::QUERY) {
                    query.push_str("; ");
                    query.push_str(clause);
                }
                continue;
            }

            let mut slot_values = clause_slots;
            merge_missing(&mut slot_values, std::mem::take(&mut orphan_slots));
            slot_values.insert(slots::QUERY.to_string(), clause.to_string());
            intents.push(Intent {
                label: label.to_string(),
                confidence,
                slot_values,
            });
        }

        // An area named once applies to every intent of the turn.
        let shared_area = intents
            .iter()
            .find_map(|i| i.slot_values.get(slots::AREA).cloned());
        if let Some(area) = shared_area {
            for intent in &mut intents {
                intent
                    .slot_values
                    .entry(slots::AREA.to_string())
                    .or_insert_with(|| area.clone());
            }
        }
        intents
    }
}

fn merge_missing(into: &mut BTreeMap<String, String>, from: BTreeMap<String, String>) {
    for (k, v) in from {
        into.entry(k).or_insert(v);
    }
}

/// The fallback intent carrying the whole utterance.
pub fn free_form(utterance: &str) -> Intent {
    let mut slot_values = extract_slots(utterance);
    slot_values.insert(slots::QUERY.to_string(), utterance.trim().to_string());
    Intent {
        label: FREE_FORM.to_string(),
        confidence: 0.0,
        slot_values,
    }
}
