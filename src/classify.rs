//! Document classifier: LLM first, weighted keyword rules as fallback.
//!
//! | AI outcome | Result | Warning |
//! |------------|--------|---------|
//! | confidence ≥ `min_ai_confidence` | AI category | none |
//! | low confidence, rules agree | rule result | none |
//! | low confidence, rules disagree | rule result | `low_confidence_classification` |
//! | low confidence, rules found nothing | AI category | `low_confidence_classification` |
//! | timeout, transport or unparseable reply | rule result | `classification_degraded` |
//! | provider disabled | rule result | none |
//!
//! Empty or whitespace-only text is `unknown / 0.0 / rule` without an LLM
//! call. Classification never returns an error.

use std::sync::Arc;

use tracing::{debug, warn};

use estate_harness_core::models::{Category, ClassificationMethod, ClassificationResult};

use crate::config::ClassifierSettings;
use crate::error::LlmError;
use crate::llm::{complete_bounded, LlmClient};

pub const WARN_LOW_CONFIDENCE: &str = "low_confidence_classification";
pub const WARN_DEGRADED: &str = "classification_degraded";

/// Characters of the document shown to the model.
const PROMPT_EXCERPT_CHARS: usize = 4_000;
/// Minimum weighted keyword score for the rules to name a category.
const MIN_RULE_SCORE: f64 = 2.0;
/// Score at which rule confidence stops growing with more evidence.
const SATURATION_SCORE: f64 = 8.0;
/// Hits counted per keyword, so one repeated word cannot dominate.
const MAX_HITS_PER_KEYWORD: usize = 3;

const TRANSACTION_KEYWORDS: &[(&str, f64)] = &[
    ("sale price", 2.0),
    ("purchase price", 2.0),
    ("sold for", 2.0),
    ("transaction", 1.5),
    ("buyer", 1.0),
    ("seller", 1.0),
    ("purchaser", 1.0),
    ("transferred", 1.0),
    ("title deed", 1.0),
    ("consideration", 0.5),
    ("price", 0.5),
];

const LEGAL_KEYWORDS: &[(&str, f64)] = &[
    ("agreement", 1.5),
    ("hereby", 2.0),
    ("whereas", 2.0),
    ("clause", 1.5),
    ("governing law", 2.0),
    ("jurisdiction", 1.5),
    ("indemn", 1.5),
    ("shall", 1.0),
    ("terminat", 1.0),
    ("liabilit", 1.0),
    ("landlord", 1.0),
    ("tenant", 1.0),
    ("party", 0.5),
    ("visa", 0.5),
];

const MARKET_KEYWORDS: &[(&str, f64)] = &[
    ("rental yield", 2.5),
    ("year-on-year", 2.0),
    ("yoy", 2.0),
    ("average price", 2.0),
    ("price per sq", 2.0),
    ("market report", 2.0),
    ("occupancy", 1.5),
    ("quarter", 1.0),
    ("trend", 1.0),
    ("demand", 1.0),
    ("supply", 1.0),
    ("growth", 1.0),
    ("market", 1.0),
    ("index", 0.5),
];

const BROCHURE_KEYWORDS: &[(&str, f64)] = &[
    ("brochure", 2.0),
    ("amenities", 2.0),
    ("bedroom", 1.5),
    ("bathroom", 1.5),
    ("sq ft", 1.0),
    ("sqft", 1.0),
    ("luxury", 1.0),
    ("balcony", 1.0),
    ("swimming pool", 1.0),
    ("starting from", 1.5),
    ("payment plan", 1.0),
    ("handover", 1.0),
    ("for sale", 1.0),
];

fn keywords(category: Category) -> &'static [(&'static str, f64)] {
    match category {
        Category::Transaction => TRANSACTION_KEYWORDS,
        Category::Legal => LEGAL_KEYWORDS,
        Category::MarketReport => MARKET_KEYWORDS,
        Category::Brochure => BROCHURE_KEYWORDS,
        Category::Unknown => &[],
    }
}

fn keyword_score(lower: &str, category: Category) -> f64 {
    keywords(category)
        .iter()
        .map(|(kw, weight)| lower.matches(kw).count().min(MAX_HITS_PER_KEYWORD) as f64 * weight)
        .sum()
}

/// A CSV whose header names both a price and a date column.
fn is_transaction_table(lower: &str) -> bool {
    let header = lower.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    header.contains(',') && header.contains("price") && header.contains("date")
}

/// Classify with keyword heuristics only.
pub fn classify_by_rules(text: &str) -> ClassificationResult {
    let lower = text.to_lowercase();
    if lower.trim().is_empty() {
        return ClassificationResult::unknown();
    }
    if is_transaction_table(&lower) {
        return ClassificationResult::new(Category::Transaction, 0.9, ClassificationMethod::Rule);
    }

    let scores: Vec<(Category, f64)> = Category::KNOWN
        .iter()
        .map(|c| (*c, keyword_score(&lower, *c)))
        .collect();
    let total: f64 = scores.iter().map(|(_, s)| s).sum();
    let Some(&(best, best_score)) = scores.iter().max_by(|a, b| a.1.total_cmp(&b.1)) else {
        return ClassificationResult::unknown();
    };
    if best_score < MIN_RULE_SCORE {
        return ClassificationResult::unknown();
    }
    let share = best_score / total;
    let strength = (best_score / SATURATION_SCORE).min(1.0);
    ClassificationResult::new(best, share * strength, ClassificationMethod::Rule)
}

fn prompt_for(text: &str) -> String {
    let excerpt: String = text.chars().take(PROMPT_EXCERPT_CHARS).collect();
    format!(
        "Classify this real-estate document into exactly one category: \
         transaction, legal, market_report, brochure.\n\
         Reply with JSON only: {{\"category\": \"<category>\", \"confidence\": <number between 0 and 1>}}\n\n\
         Document:\n{}",
        excerpt
    )
}

/// Parse the model's reply. The JSON object may be wrapped in prose or a
/// code fence; the category must be a known one and the confidence a number.
pub fn parse_ai_response(raw: &str) -> Result<(Category, f64), LlmError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(LlmError::InvalidResponse("no JSON object in reply".into()));
    };
    if end < start {
        return Err(LlmError::InvalidResponse("no JSON object in reply".into()));
    }
    let json: serde_json::Value = serde_json::from_str(&raw[start..=end])
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    let category = json
        .get("category")
        .and_then(|c| c.as_str())
        .and_then(Category::parse)
        .filter(|c| *c != Category::Unknown)
        .ok_or_else(|| LlmError::InvalidResponse("missing or unknown category".into()))?;
    let confidence = match json.get("confidence") {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|c| c.is_finite())
    .ok_or_else(|| LlmError::InvalidResponse("missing confidence".into()))?;
    Ok((category, confidence))
}

/// Classification plus the warnings it raised.
#[derive(Debug, Clone)]
pub struct Classification {
    pub result: ClassificationResult,
    pub warnings: Vec<String>,
}

pub struct DocumentClassifier {
    llm: Arc<dyn LlmClient>,
    settings: ClassifierSettings,
}

impl DocumentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, settings: ClassifierSettings) -> Self {
        Self { llm, settings }
    }

    pub async fn classify(&self, text: &str) -> Classification {
        let mut warnings = Vec::new();
        if text.trim().is_empty() {
            return Classification {
                result: ClassificationResult::unknown(),
                warnings,
            };
        }

        let rule = classify_by_rules(text);
        let ai = match complete_bounded(
            self.llm.as_ref(),
            &prompt_for(text),
            self.settings.timeout,
            &self.settings.llm_retry,
        )
        .await
        {
            Ok(raw) => parse_ai_response(&raw),
            Err(e) => Err(e),
        };

        let result = match ai {
            Ok((category, confidence)) if confidence >= self.settings.min_ai_confidence => {
                ClassificationResult::new(category, confidence, ClassificationMethod::Ai)
            }
            Ok((category, confidence)) => {
                debug!(ai = %category, confidence, rule = %rule.category, "low-confidence AI classification");
                if rule.category == Category::Unknown {
                    warnings.push(WARN_LOW_CONFIDENCE.to_string());
                    ClassificationResult::new(category, confidence, ClassificationMethod::Ai)
                } else {
                    if rule.category != category {
                        warnings.push(WARN_LOW_CONFIDENCE.to_string());
                    }
                    rule
                }
            }
            Err(LlmError::Disabled) => rule,
            Err(e) => {
                warn!(llm = self.llm.name(), error = %e, "AI classification failed, using rules");
                warnings.push(WARN_DEGRADED.to_string());
                rule
            }
        };
        Classification { result, warnings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    const LEGAL_TEXT: &str = "This Tenancy Agreement is made between the Landlord and the Tenant. \
        The Tenant shall pay rent quarterly. Either party may terminate this agreement by notice. \
        This clause is subject to the governing law of the Emirate.";

    fn classifier(llm: MockLlmClient) -> DocumentClassifier {
        DocumentClassifier::new(
            Arc::new(llm),
            ClassifierSettings {
                min_ai_confidence: 0.6,
                timeout: Duration::from_millis(50),
                llm_retry: RetryPolicy::immediate(1),
            },
        )
    }

    #[test]
    fn rules_recognise_each_category() {
        assert_eq!(classify_by_rules(LEGAL_TEXT).category, Category::Legal);
        assert_eq!(
            classify_by_rules("price,date,buyer,seller\n950000,2024-01-02,A,B").category,
            Category::Transaction
        );
        assert_eq!(
            classify_by_rules("Q1 market report: rental yield rose 6%, average price up year-on-year.").category,
            Category::MarketReport
        );
        assert_eq!(
            classify_by_rules("Luxury 3 bedroom, 4 bathroom villa with amenities. Starting from AED 3M.").category,
            Category::Brochure
        );
        let r = classify_by_rules("hello world");
        assert_eq!(r.category, Category::Unknown);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn rule_confidence_is_bounded() {
        let r = classify_by_rules(&LEGAL_TEXT.repeat(20));
        assert!((0.0..=1.0).contains(&r.confidence));
        assert_eq!(r.method, ClassificationMethod::Rule);
    }

    #[test]
    fn parses_wrapped_json() {
        let reply = "Sure!\n```json\n{\"category\": \"Market Report\", \"confidence\": \"0.82\"}\n```";
        assert_eq!(parse_ai_response(reply).unwrap(), (Category::MarketReport, 0.82));
        assert!(parse_ai_response("legal").is_err());
        assert!(parse_ai_response("{\"category\": \"poem\", \"confidence\": 0.9}").is_err());
        assert!(parse_ai_response("{\"category\": \"legal\"}").is_err());
    }

    #[tokio::test]
    async fn empty_text_is_unknown_without_calling_llm() {
        let llm = Arc::new(MockLlmClient::replying("{\"category\":\"legal\",\"confidence\":0.9}"));
        let c = DocumentClassifier::new(llm.clone(), ClassifierSettings::default());
        let out = c.classify("   \n").await;
        assert_eq!(out.result, ClassificationResult::unknown());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn confident_ai_wins() {
        let c = classifier(MockLlmClient::replying("{\"category\":\"brochure\",\"confidence\":0.91}"));
        let out = c.classify(LEGAL_TEXT).await;
        assert_eq!(out.result.category, Category::Brochure);
        assert_eq!(out.result.method, ClassificationMethod::Ai);
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn low_confidence_disagreement_prefers_rules_and_warns() {
        let c = classifier(MockLlmClient::replying("{\"category\":\"brochure\",\"confidence\":0.3}"));
        let out = c.classify(LEGAL_TEXT).await;
        assert_eq!(out.result.category, Category::Legal);
        assert_eq!(out.result.method, ClassificationMethod::Rule);
        assert_eq!(out.warnings, vec![WARN_LOW_CONFIDENCE.to_string()]);
    }

    #[tokio::test]
    async fn low_confidence_agreement_is_silent() {
        let c = classifier(MockLlmClient::replying("{\"category\":\"legal\",\"confidence\":0.5}"));
        let out = c.classify(LEGAL_TEXT).await;
        assert_eq!(out.result.category, Category::Legal);
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn hung_llm_degrades_to_rules() {
        let c = classifier(MockLlmClient::hanging());
        let out = c.classify(LEGAL_TEXT).await;
        assert_eq!(out.result.category, Category::Legal);
        assert_eq!(out.result.method, ClassificationMethod::Rule);
        assert_eq!(out.warnings, vec![WARN_DEGRADED.to_string()]);
    }

    #[tokio::test]
    async fn disabled_llm_uses_rules_silently() {
        let c = classifier(MockLlmClient::failing(LlmError::Disabled));
        let out = c.classify(LEGAL_TEXT).await;
        assert_eq!(out.result.category, Category::Legal);
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn both_paths_failing_is_unknown() {
        let c = classifier(MockLlmClient::failing(LlmError::Transport("refused".into())));
        let out = c.classify("lorem ipsum dolor sit amet").await;
        assert_eq!(out.result, ClassificationResult::unknown());
        assert_eq!(out.warnings, vec![WARN_DEGRADED.to_string()]);
    }
}
