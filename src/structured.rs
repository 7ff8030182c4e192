//! Category-specific structured extraction.
//!
//! Turns classified text into typed records and semantic chunks:
//!
//! | Category | Records | Chunks (collection) |
//! |----------|---------|---------------------|
//! | transaction | [`TransactionRecord`] per CSV row or sale sentence | none |
//! | legal | [`LegalChunk`] per sentence-aligned segment | one per legal chunk (`legal`) |
//! | market_report | [`MarketMetric`] per metric sentence | narrative (`market_report`) |
//! | brochure | one [`PropertyListing`] | narrative (`brochure`) |
//! | unknown | none | narrative (`unknown`) |
//!
//! Transaction candidates that fail validation are dropped and reported as
//! [`ValidationFailure`]s. Nothing the LLM produced reaches this module; all
//! structure here is derived from the document text itself.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Duration as ChronoDuration, NaiveDate};
use regex::Regex;

use estate_harness_core::chunk::{chunk_sentences, split_sentences, ChunkBounds};
use estate_harness_core::models::{
    Category, ClauseType, ExtractedRecord, LegalChunk, MarketMetric, NormalizedDocument,
    PropertyListing, SemanticChunk, TransactionCandidate, ValidationFailure,
};

use crate::extract::csv_tables;

static CURRENCY_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\b(?:aed|usd|eur|gbp|dhs?)|\$|€|£)\s*([\d][\d,]*(?:\.\d+)?\s*(?:k|m|mn|million)?)\b")
        .expect("valid regex")
});
static DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{4}|\d{1,2}\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\s+\d{4})\b")
        .expect("valid regex")
});
static PROPERTY_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{1,3}-\d{1,6})\b").expect("valid regex"));
static LABELLED_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ref(?:erence)?|property id|listing id)\b(?:\s*(?:no\.?|number))?\s*[:#.\-]?\s*([A-Z0-9][A-Z0-9\-]{2,})")
        .expect("valid regex")
});
static BETWEEN_PARTIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:between|by)\s+([A-Z][\w.&' ]*?)\s+(?:and|to)\s+([A-Z][\w.&' ]*?)(?:\s+(?:for|on|at)\b|[,.;]|$)")
        .expect("valid regex")
});
static SALE_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sold|purchased|bought|transferred|sale|transaction|leased)\b")
        .expect("valid regex")
});
static AREA_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[Ii]n|[Ff]or|[Aa]cross|[Aa]t)\s+((?:[A-Z][a-zA-Z]+)(?:\s+[A-Z][a-zA-Z]+){0,3})")
        .expect("valid regex")
});
static PERIOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(Q[1-4]\s*20\d{2}|H[12]\s*20\d{2}|FY\s*20\d{2}|20\d{2})\b").expect("valid regex")
});
static BEDROOMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\s*(?:-\s*)?(?:bed(?:room)?s?|br)\b").expect("valid regex")
});
static SIZE_SQFT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([\d][\d,]*(?:\.\d+)?)\s*(?:sq\.?\s*ft\.?|sqft|square\s+feet)").expect("valid regex")
});
static LOCATION_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:location|address|community)\s*[:\-]\s*([^\n.]+)").expect("valid regex")
});

struct MetricPattern {
    metric: &'static str,
    unit: &'static str,
    regex: LazyLock<Regex>,
}

static METRIC_PATTERNS: [MetricPattern; 5] = [
    MetricPattern {
        metric: "rental_yield",
        unit: "percent",
        regex: LazyLock::new(|| {
            Regex::new(r"(?i)rental\s+yields?\b[^.%\d]{0,40}?(\d+(?:\.\d+)?)\s*%").expect("valid regex")
        }),
    },
    MetricPattern {
        metric: "average_price",
        unit: "currency",
        regex: LazyLock::new(|| {
            Regex::new(r"(?i)average\s+(?:sale\s+|selling\s+|transaction\s+)?prices?\b[^.\d]{0,40}?([\d][\d,]*(?:\.\d+)?\s*(?:k|m|mn|million)?)\b")
                .expect("valid regex")
        }),
    },
    MetricPattern {
        metric: "price_per_sqft",
        unit: "currency_per_sqft",
        regex: LazyLock::new(|| {
            Regex::new(r"(?i)price\s+per\s+(?:sq\.?\s*ft|square\s+foot|sqft)\b[^.\d]{0,40}?([\d][\d,]*(?:\.\d+)?)")
                .expect("valid regex")
        }),
    },
    MetricPattern {
        metric: "occupancy",
        unit: "percent",
        regex: LazyLock::new(|| {
            Regex::new(r"(?i)occupancy(?:\s+rates?)?\b[^.%\d]{0,40}?(\d+(?:\.\d+)?)\s*%").expect("valid regex")
        }),
    },
    MetricPattern {
        metric: "transaction_volume",
        unit: "count",
        regex: LazyLock::new(|| {
            Regex::new(r"(?i)\b([\d][\d,]*)\s+(?:transactions|deals|sales)\b").expect("valid regex")
        }),
    },
];

const CLAUSE_KEYWORDS: &[(ClauseType, &[&str], f64)] = &[
    (ClauseType::Payment, &["payment", "pay ", "instal", "deposit", "purchase price", "fee", "escrow"], 1.0),
    (ClauseType::Termination, &["terminat", "cancel", "rescind", "expiry", "notice period"], 1.2),
    (ClauseType::Liability, &["liab", "indemn", "damages", "warrant", "breach"], 1.0),
    (ClauseType::Confidentiality, &["confidential", "non-disclosure", "disclose"], 1.2),
    (ClauseType::GoverningLaw, &["governing law", "jurisdiction", "court", "arbitration", "dispute"], 1.2),
    (ClauseType::Ownership, &["title deed", "ownership", "freehold", "leasehold", "registration", "land department"], 1.0),
    (ClauseType::Residency, &["visa", "residency", "resident", "immigration"], 1.5),
    (ClauseType::Tenancy, &["tenant", "landlord", "lease", "rent ", "ejari"], 0.8),
    (ClauseType::Obligations, &["shall", "obligation", "must", "responsib"], 0.4),
];

/// Clause types mentioned in `text`, strongest first. Never empty.
pub fn classify_clause(text: &str) -> Vec<ClauseType> {
    let lower = text.to_lowercase();
    let mut scored: Vec<(ClauseType, f64)> = CLAUSE_KEYWORDS
        .iter()
        .map(|(clause, words, weight)| {
            let hits: usize = words.iter().map(|w| lower.matches(w).count()).sum();
            (*clause, hits as f64 * weight)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    if scored.is_empty() {
        return vec![ClauseType::General];
    }
    scored.into_iter().map(|(c, _)| c).collect()
}

/// Parse a price such as `"AED 1,250,000"`, `"1.2m"` or `"950k"`.
pub fn parse_price(raw: &str) -> Option<f64> {
    let lower = raw.trim().to_lowercase();
    let stripped: String = lower
        .trim_start_matches(|c: char| c.is_alphabetic() || matches!(c, '$' | '€' | '£') || c.is_whitespace())
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    let (number, multiplier) = if let Some(n) = stripped.strip_suffix("million") {
        (n, 1_000_000.0)
    } else if let Some(n) = stripped.strip_suffix("mn") {
        (n, 1_000_000.0)
    } else if let Some(n) = stripped.strip_suffix('m') {
        (n, 1_000_000.0)
    } else if let Some(n) = stripped.strip_suffix('k') {
        (n, 1_000.0)
    } else {
        (stripped.as_str(), 1.0)
    };
    let number = number.trim_end_matches(|c: char| c.is_alphabetic());
    number.parse::<f64>().ok().map(|n| n * multiplier).filter(|n| n.is_finite())
}

/// Parse a date in ISO, day-first, written-month, or Excel serial form.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    const FORMATS: &[&str] = &[
        "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d %b %Y", "%d %B %Y",
        "%b %d, %Y", "%B %d, %Y", "%d.%m.%Y",
    ];
    // Datetime cells such as "2024-01-15 00:00:00".
    let date_part = s.split(['T', ' ']).next().unwrap_or(s);
    for candidate in [s, date_part] {
        for fmt in FORMATS {
            if let Ok(d) = NaiveDate::parse_from_str(candidate, fmt) {
                return Some(d);
            }
        }
    }
    // Excel stores dates as days since 1899-12-30.
    if let Ok(serial) = s.parse::<f64>() {
        if (20_000.0..80_000.0).contains(&serial) {
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
            return epoch.checked_add_signed(ChronoDuration::days(serial.trunc() as i64));
        }
    }
    None
}

fn split_parties(raw: &str) -> Vec<String> {
    raw.split([';', '&', '/'])
        .flat_map(|p| p.split(" and "))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[derive(Debug, Default)]
struct ColumnMap {
    price: Option<usize>,
    date: Option<usize>,
    parties: Vec<usize>,
    property: Option<usize>,
    area: Option<usize>,
}

impl ColumnMap {
    fn from_header(header: &[String]) -> Self {
        let mut map = ColumnMap::default();
        for (i, h) in header.iter().enumerate() {
            let h = h.to_lowercase().replace(['_', '-'], " ");
            let h = h.trim();
            if map.price.is_none()
                && (h.contains("price") || matches!(h, "amount" | "value" | "consideration"))
            {
                map.price = Some(i);
            } else if map.date.is_none() && (h.contains("date") || matches!(h, "sold on" | "closed")) {
                map.date = Some(i);
            } else if matches!(
                h,
                "buyer" | "seller" | "purchaser" | "vendor" | "party" | "parties" | "tenant" | "landlord"
            ) {
                map.parties.push(i);
            } else if map.property.is_none()
                && matches!(
                    h,
                    "property" | "property ref" | "property id" | "ref" | "reference" | "unit" | "listing"
                )
            {
                map.property = Some(i);
            } else if map.area.is_none() && matches!(h, "area" | "community" | "location" | "district") {
                map.area = Some(i);
            }
        }
        map
    }

    fn is_transaction_table(&self) -> bool {
        self.price.is_some() || self.date.is_some()
    }
}

/// Records, chunks and validation failures produced for one document.
#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<ExtractedRecord>,
    pub chunks: Vec<SemanticChunk>,
    pub failures: Vec<ValidationFailure>,
}

#[derive(Debug, Clone)]
pub struct StructuredExtractor {
    bounds: ChunkBounds,
}

impl StructuredExtractor {
    pub fn new(bounds: ChunkBounds) -> Self {
        Self { bounds }
    }

    pub fn extract(&self, doc: &NormalizedDocument, category: Category) -> Extraction {
        match category {
            Category::Transaction => self.transactions(doc),
            Category::Legal => self.legal(doc),
            Category::MarketReport => self.market_report(doc),
            Category::Brochure => self.brochure(doc),
            Category::Unknown => Extraction {
                chunks: self.narrative(doc, Category::Unknown),
                ..Extraction::default()
            },
        }
    }

    fn narrative(&self, doc: &NormalizedDocument, category: Category) -> Vec<SemanticChunk> {
        chunk_sentences(&doc.raw_text, self.bounds)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                SemanticChunk::new(category.collection(), &doc.source_id, i as i64, text, vec![category.as_str().to_string()])
            })
            .collect()
    }

    fn transactions(&self, doc: &NormalizedDocument) -> Extraction {
        let candidates = if doc.format.is_tabular() {
            match csv_tables(&doc.raw_text) {
                Ok(tables) => table_candidates(&tables),
                // Text that failed CSV parsing after classification; read it as prose.
                Err(_) => prose_candidates(&doc.raw_text),
            }
        } else {
            match csv_tables(&doc.raw_text) {
                Ok(tables) if looks_tabular(&tables) => table_candidates(&tables),
                _ => prose_candidates(&doc.raw_text),
            }
        };

        let mut out = Extraction::default();
        for candidate in candidates {
            match candidate.validate() {
                Ok(record) => out.records.push(ExtractedRecord::Transaction(record)),
                Err(failure) => out.failures.push(failure),
            }
        }
        out
    }

    fn legal(&self, doc: &NormalizedDocument) -> Extraction {
        let mut out = Extraction::default();
        for (i, text) in chunk_sentences(&doc.raw_text, self.bounds).into_iter().enumerate() {
            let clauses = classify_clause(&text);
            let primary = clauses[0];
            let extra: Vec<String> = clauses[1..].iter().map(|c| c.as_str().to_string()).collect();
            if let Some(chunk) = LegalChunk::new(text, primary, extra) {
                out.chunks.push(SemanticChunk::from_legal(&doc.source_id, i as i64, &chunk));
                out.records.push(ExtractedRecord::Legal(chunk));
            }
        }
        out
    }

    fn market_report(&self, doc: &NormalizedDocument) -> Extraction {
        let doc_area = AREA_PHRASE
            .captures(&doc.raw_text)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "all".to_string());
        let doc_period = PERIOD.captures(&doc.raw_text).map(|c| c[1].to_string());

        // Last mention wins, so a restated figure replaces the earlier one.
        let mut metrics: HashMap<String, MarketMetric> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for para in doc.raw_text.split("\n\n") {
            for sentence in split_sentences(para) {
                let area = AREA_PHRASE
                    .captures(&sentence)
                    .map(|c| c[1].to_string())
                    .unwrap_or_else(|| doc_area.clone());
                let period = PERIOD
                    .captures(&sentence)
                    .map(|c| c[1].to_string())
                    .or_else(|| doc_period.clone());
                for pattern in METRIC_PATTERNS.iter() {
                    let Some(caps) = pattern.regex.captures(&sentence) else {
                        continue;
                    };
                    let value = match pattern.unit {
                        "currency" => parse_price(&caps[1]),
                        _ => caps[1].replace(',', "").parse::<f64>().ok(),
                    };
                    let Some(value) = value else { continue };
                    let metric = MarketMetric {
                        area: area.clone(),
                        metric: pattern.metric.to_string(),
                        value,
                        unit: Some(pattern.unit.to_string()),
                        period: period.clone(),
                    };
                    let key = metric.natural_key();
                    if !metrics.contains_key(&key) {
                        order.push(key.clone());
                    }
                    metrics.insert(key, metric);
                }
            }
        }

        let records = order
            .into_iter()
            .filter_map(|k| metrics.remove(&k))
            .map(ExtractedRecord::MarketMetric)
            .collect();
        Extraction {
            records,
            chunks: self.narrative(doc, Category::MarketReport),
            failures: Vec::new(),
        }
    }

    fn brochure(&self, doc: &NormalizedDocument) -> Extraction {
        let text = &doc.raw_text;
        let property_ref = LABELLED_REF
            .captures(text)
            .map(|c| c[1].to_uppercase())
            .or_else(|| PROPERTY_REF.captures(text).map(|c| c[1].to_string()))
            .unwrap_or_else(|| format!("BR-{}", &doc.source_id[..8.min(doc.source_id.len())]).to_uppercase());
        let title = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.chars().take(120).collect::<String>())
            .unwrap_or_default();
        let price = CURRENCY_AMOUNT.captures(text).and_then(|c| parse_price(&c[1]));
        let bedrooms = BEDROOMS
            .captures(text)
            .and_then(|c| c[1].parse::<u32>().ok())
            .or_else(|| text.to_lowercase().contains("studio").then_some(0));
        let size_sqft = SIZE_SQFT
            .captures(text)
            .and_then(|c| c[1].replace(',', "").parse::<f64>().ok());
        let location = LOCATION_LABEL
            .captures(text)
            .map(|c| c[1].trim().to_string())
            .or_else(|| AREA_PHRASE.captures(text).map(|c| c[1].to_string()));
        let description: String = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(400)
            .collect();

        let listing = PropertyListing {
            property_ref,
            title,
            price,
            bedrooms,
            size_sqft,
            location,
            description,
        };
        Extraction {
            records: vec![ExtractedRecord::Listing(listing)],
            chunks: self.narrative(doc, Category::Brochure),
            failures: Vec::new(),
        }
    }
}

/// Plain text that still parses as a comma table with a price or date header.
fn looks_tabular(tables: &[Vec<Vec<String>>]) -> bool {
    tables.iter().any(|t| {
        t.len() > 1 && t[0].len() > 1 && ColumnMap::from_header(&t[0]).is_transaction_table()
    })
}

fn table_candidates(tables: &[Vec<Vec<String>>]) -> Vec<TransactionCandidate> {
    let multi = tables.len() > 1;
    let mut out = Vec::new();
    for (t, table) in tables.iter().enumerate() {
        let Some((header, rows)) = table.split_first() else {
            continue;
        };
        let columns = ColumnMap::from_header(header);
        if !columns.is_transaction_table() {
            continue;
        }
        let cell = |row: &[String], idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| row.get(i)).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };
        for (r, row) in rows.iter().enumerate() {
            // Header is row 1.
            let location = if multi {
                format!("table {} row {}", t + 1, r + 2)
            } else {
                format!("row {}", r + 2)
            };
            let parties = columns
                .parties
                .iter()
                .filter_map(|i| row.get(*i))
                .flat_map(|p| split_parties(p))
                .collect();
            out.push(TransactionCandidate {
                location,
                price: cell(row, columns.price).and_then(|p| parse_price(&p)),
                date: cell(row, columns.date).and_then(|d| parse_date(&d)),
                parties,
                property_ref: cell(row, columns.property),
                area: cell(row, columns.area),
            });
        }
    }
    out
}

/// One candidate per sentence that mentions a sale and a price or a date.
fn prose_candidates(text: &str) -> Vec<TransactionCandidate> {
    let mut out = Vec::new();
    let mut n = 0;
    for para in text.split("\n\n") {
        for sentence in split_sentences(para) {
            if !SALE_VERB.is_match(&sentence) {
                continue;
            }
            let price = CURRENCY_AMOUNT.captures(&sentence).and_then(|c| parse_price(&c[1]));
            let date = DATE_TOKEN.captures(&sentence).and_then(|c| parse_date(&c[1]));
            if price.is_none() && date.is_none() {
                continue;
            }
            n += 1;
            let parties = BETWEEN_PARTIES
                .captures(&sentence)
                .map(|c| vec![c[1].trim().to_string(), c[2].trim().to_string()])
                .unwrap_or_default();
            out.push(TransactionCandidate {
                location: format!("sentence {}", n),
                price,
                date,
                parties,
                property_ref: PROPERTY_REF.captures(&sentence).map(|c| c[1].to_string()),
                area: AREA_PHRASE.captures(&sentence).map(|c| c[1].to_string()),
            });
        }
    }
    out
}
