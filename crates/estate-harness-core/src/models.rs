//! Core data model shared by ingestion, retrieval and nurturing.
//!
//! These types flow between the extractor adapters, the classifier, the
//! dual-store writer, the query router and the nurture scheduler. They carry
//! no I/O and enforce their own invariants at construction time: a
//! [`TransactionRecord`] always has a price and a date, a [`LegalChunk`]
//! always has at least one tag, and a [`ClassificationResult`] confidence is
//! always inside `[0, 1]`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{content_hash, hash_parts};

// ═══════════════════════════════════════════════════════════════════════
// Documents & classification
// ═══════════════════════════════════════════════════════════════════════

/// Input formats accepted by the extractor adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Csv,
    Excel,
    Text,
}

impl DocumentFormat {
    /// Parse a declared format hint (short name or MIME type).
    pub fn parse(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "pdf" | "application/pdf" => Some(Self::Pdf),
            "csv" | "text/csv" => Some(Self::Csv),
            "excel" | "xlsx"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                Some(Self::Excel)
            }
            "text" | "txt" | "plain" | "md" | "markdown" | "text/plain" | "text/markdown" => {
                Some(Self::Text)
            }
            _ => None,
        }
    }

    /// Guess the format from a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "csv" => Some(Self::Csv),
            "xlsx" => Some(Self::Excel),
            "txt" | "md" | "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Csv => "csv",
            Self::Excel => "excel",
            Self::Text => "text",
        }
    }

    /// True for formats whose normalized text is a sequence of CSV blocks.
    pub fn is_tabular(&self) -> bool {
        matches!(self, Self::Csv | Self::Excel)
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain-text rendition of an input document, produced by an extractor adapter.
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    /// SHA-256 of the raw input bytes.
    pub source_id: String,
    pub raw_text: String,
    pub format: DocumentFormat,
    pub byte_size: usize,
    pub extracted_at: DateTime<Utc>,
}

/// Document category; also names the vector collection a document's chunks land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Transaction,
    Legal,
    MarketReport,
    Brochure,
    Unknown,
}

impl Category {
    pub const KNOWN: [Category; 4] = [
        Category::Transaction,
        Category::Legal,
        Category::MarketReport,
        Category::Brochure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Legal => "legal",
            Self::MarketReport => "market_report",
            Self::Brochure => "brochure",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient parse of a category label (accepts spaces, dashes, any case).
    pub fn parse(label: &str) -> Option<Self> {
        let norm = label.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match norm.as_str() {
            "transaction" | "transactions" => Some(Self::Transaction),
            "legal" | "contract" => Some(Self::Legal),
            "market_report" | "market" => Some(Self::MarketReport),
            "brochure" | "listing" | "property_brochure" => Some(Self::Brochure),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Vector collection for this category's semantic chunks.
    pub fn collection(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Ai,
    Rule,
}

/// Outcome of document classification. Confidence is clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub confidence: f64,
    pub method: ClassificationMethod,
}

impl ClassificationResult {
    pub fn new(category: Category, confidence: f64, method: ClassificationMethod) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            category,
            confidence,
            method,
        }
    }

    /// The result reported when neither the AI nor the rule path found a category.
    pub fn unknown() -> Self {
        Self::new(Category::Unknown, 0.0, ClassificationMethod::Rule)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extracted records
// ═══════════════════════════════════════════════════════════════════════

/// A record that failed validation during structured extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationFailure {
    pub kind: &'static str,
    /// Human-readable position, e.g. `"row 3"`.
    pub location: String,
    pub reason: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "validation_failed: {} {}: {}",
            self.kind, self.location, self.reason
        )
    }
}

/// A sale or lease transaction with a mandatory price and date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub price: f64,
    pub date: NaiveDate,
    pub parties: Vec<String>,
    pub property_ref: Option<String>,
    pub area: Option<String>,
}

impl TransactionRecord {
    /// Hash of price, date, parties and property reference.
    ///
    /// Parties are compared case-insensitively and order-independently, and
    /// the price is compared at cent precision.
    pub fn natural_key(&self) -> String {
        let cents = format!("{:.0}", (self.price * 100.0).round());
        let date = self.date.to_string();
        let mut parties: Vec<String> = self
            .parties
            .iter()
            .map(|p| p.trim().to_lowercase())
            .collect();
        parties.sort();
        let parties = parties.join("|");
        let property = self
            .property_ref
            .as_deref()
            .map(|p| p.trim().to_lowercase())
            .unwrap_or_default();
        format!(
            "txn:{}",
            hash_parts(&[cents.as_str(), date.as_str(), parties.as_str(), property.as_str()])
        )
    }

    pub fn fingerprint(&self) -> String {
        let area = self.area.clone().unwrap_or_default();
        hash_parts(&[self.natural_key().as_str(), area.as_str()])
    }
}

/// Raw transaction fields as read from a row or sentence, before validation.
#[derive(Debug, Clone, Default)]
pub struct TransactionCandidate {
    pub location: String,
    pub price: Option<f64>,
    pub date: Option<NaiveDate>,
    pub parties: Vec<String>,
    pub property_ref: Option<String>,
    pub area: Option<String>,
}

impl TransactionCandidate {
    /// Promote to a [`TransactionRecord`], rejecting rows without a usable price or date.
    pub fn validate(self) -> Result<TransactionRecord, ValidationFailure> {
        let fail = |reason: &str| ValidationFailure {
            kind: "transaction",
            location: self.location.clone(),
            reason: reason.to_string(),
        };
        let price = match self.price {
            None => return Err(fail("missing price")),
            Some(p) if !p.is_finite() || p <= 0.0 => return Err(fail("non-positive price")),
            Some(p) => p,
        };
        let date = self.date.ok_or_else(|| fail("missing date"))?;
        Ok(TransactionRecord {
            price,
            date,
            parties: self.parties,
            property_ref: self.property_ref,
            area: self.area,
        })
    }
}

/// Clause families recognised in legal documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseType {
    Payment,
    Termination,
    Liability,
    Confidentiality,
    GoverningLaw,
    Ownership,
    Residency,
    Tenancy,
    Obligations,
    General,
}

impl ClauseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Termination => "termination",
            Self::Liability => "liability",
            Self::Confidentiality => "confidentiality",
            Self::GoverningLaw => "governing_law",
            Self::Ownership => "ownership",
            Self::Residency => "residency",
            Self::Tenancy => "tenancy",
            Self::Obligations => "obligations",
            Self::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "payment" => Self::Payment,
            "termination" => Self::Termination,
            "liability" => Self::Liability,
            "confidentiality" => Self::Confidentiality,
            "governing_law" => Self::GoverningLaw,
            "ownership" => Self::Ownership,
            "residency" => Self::Residency,
            "tenancy" => Self::Tenancy,
            "obligations" => Self::Obligations,
            "general" => Self::General,
            _ => return None,
        })
    }
}

/// A sentence-aligned segment of a legal document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegalChunk {
    pub text: String,
    pub tags: Vec<String>,
    pub clause_type: ClauseType,
}

impl LegalChunk {
    /// Build a chunk; the clause type is always present as a tag.
    ///
    /// Returns `None` for blank text.
    pub fn new(text: impl Into<String>, clause_type: ClauseType, extra_tags: Vec<String>) -> Option<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return None;
        }
        let mut tags = vec![clause_type.as_str().to_string()];
        for tag in extra_tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Some(Self {
            text,
            tags,
            clause_type,
        })
    }
}

/// One numeric market indicator, e.g. rental yield for an area in a quarter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketMetric {
    pub area: String,
    pub metric: String,
    pub value: f64,
    pub unit: Option<String>,
    pub period: Option<String>,
}

impl MarketMetric {
    pub fn natural_key(&self) -> String {
        format!(
            "metric:{}:{}:{}",
            self.area.to_lowercase(),
            self.metric,
            self.period.as_deref().unwrap_or("-").to_lowercase()
        )
    }

    pub fn fingerprint(&self) -> String {
        let value = self.value.to_string();
        hash_parts(&[
            self.natural_key().as_str(),
            value.as_str(),
            self.unit.as_deref().unwrap_or(""),
        ])
    }
}

/// A property advertised in a brochure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyListing {
    pub property_ref: String,
    pub title: String,
    pub price: Option<f64>,
    pub bedrooms: Option<u32>,
    pub size_sqft: Option<f64>,
    pub location: Option<String>,
    pub description: String,
}

impl PropertyListing {
    pub fn natural_key(&self) -> String {
        format!("listing:{}", self.property_ref.to_uppercase())
    }

    pub fn fingerprint(&self) -> String {
        let price = self.price.map(|p| p.to_string()).unwrap_or_default();
        let beds = self.bedrooms.map(|b| b.to_string()).unwrap_or_default();
        let size = self.size_sqft.map(|s| s.to_string()).unwrap_or_default();
        hash_parts(&[
            self.natural_key().as_str(),
            self.title.as_str(),
            price.as_str(),
            beds.as_str(),
            size.as_str(),
            self.location.as_deref().unwrap_or(""),
            self.description.as_str(),
        ])
    }
}

/// Output of the structured extractor, keyed by category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractedRecord {
    Transaction(TransactionRecord),
    Legal(LegalChunk),
    MarketMetric(MarketMetric),
    Listing(PropertyListing),
}

impl ExtractedRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Legal(_) => "legal",
            Self::MarketMetric(_) => "market_metric",
            Self::Listing(_) => "listing",
        }
    }

    /// Business key used for idempotent upserts.
    pub fn natural_key(&self) -> String {
        match self {
            Self::Transaction(t) => t.natural_key(),
            Self::Legal(l) => format!("legal:{}", content_hash(&l.text)),
            Self::MarketMetric(m) => m.natural_key(),
            Self::Listing(l) => l.natural_key(),
        }
    }

    /// Hash of the full record content; equal hashes mean nothing to update.
    pub fn content_hash(&self) -> String {
        match self {
            Self::Transaction(t) => t.fingerprint(),
            Self::Legal(l) => content_hash(&l.text),
            Self::MarketMetric(m) => m.fingerprint(),
            Self::Listing(l) => l.fingerprint(),
        }
    }

    /// Legal chunks live only in the vector store.
    pub fn is_relational(&self) -> bool {
        !matches!(self, Self::Legal(_))
    }
}

/// A unit of unstructured content bound for a vector collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChunk {
    pub collection: String,
    pub source_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub tags: Vec<String>,
    pub clause_type: Option<ClauseType>,
    /// SHA-256 of the whitespace-normalized text; unique per collection.
    pub content_hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl SemanticChunk {
    pub fn new(
        collection: impl Into<String>,
        source_id: impl Into<String>,
        chunk_index: i64,
        text: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        let text = text.into();
        let content_hash = content_hash(&text);
        Self {
            collection: collection.into(),
            source_id: source_id.into(),
            chunk_index,
            text,
            tags,
            clause_type: None,
            content_hash,
            embedding: None,
        }
    }

    pub fn from_legal(source_id: &str, chunk_index: i64, chunk: &LegalChunk) -> Self {
        let mut out = Self::new(
            Category::Legal.collection(),
            source_id,
            chunk_index,
            chunk.text.clone(),
            chunk.tags.clone(),
        );
        out.clause_type = Some(chunk.clause_type);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    Vector,
}

/// Receipt for one newly written (or updated) row or chunk.
#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    pub store: StoreKind,
    pub natural_key: String,
    pub content_hash: String,
    pub written_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Sessions & entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Property,
    Client,
    MarketArea,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Property => "property",
            Self::Client => "client",
            Self::MarketArea => "market_area",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "property" => Some(Self::Property),
            "client" => Some(Self::Client),
            "market_area" | "area" => Some(Self::MarketArea),
            _ => None,
        }
    }
}

/// Reference to a property, client or market area, in canonical form.
///
/// Property and client ids are upper-cased; market areas are lower-cased with
/// collapsed whitespace, so `"Dubai  Marina"` and `"dubai marina"` are the same
/// entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: &str) -> Self {
        let collapsed = entity_id.split_whitespace().collect::<Vec<_>>().join(" ");
        let entity_id = match entity_type {
            EntityType::Property | EntityType::Client => collapsed.to_uppercase(),
            EntityType::MarketArea => collapsed.to_lowercase(),
        };
        Self {
            entity_type,
            entity_id,
        }
    }

    pub fn property(id: &str) -> Self {
        Self::new(EntityType::Property, id)
    }

    pub fn client(id: &str) -> Self {
        Self::new(EntityType::Client, id)
    }

    pub fn market_area(name: &str) -> Self {
        Self::new(EntityType::MarketArea, name)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type.as_str(), self.entity_id)
    }
}

/// Context fetched from the backing stores for one entity, owned by one session.
#[derive(Debug, Clone, Serialize)]
pub struct CachedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Duration,
}

impl CachedEntity {
    /// Fresh while `now - fetched_at < ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.fetched_at < ttl,
            Err(_) => true,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Per-conversation state: the entity cache and activity timestamps.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub entity_cache: HashMap<EntityRef, CachedEntity>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: now,
            last_active_at: now,
            entity_cache: HashMap::new(),
        }
    }
}

/// A user goal detected in one chat utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub label: String,
    pub confidence: f64,
    pub slot_values: BTreeMap<String, String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Leads & notifications
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NurtureState {
    New,
    Hot,
    Warm,
    Cold,
    Qualified,
    Closed,
}

impl NurtureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Qualified => "qualified",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "new" => Self::New,
            "hot" => Self::Hot,
            "warm" => Self::Warm,
            "cold" => Self::Cold,
            "qualified" => Self::Qualified,
            "closed" => Self::Closed,
            _ => return None,
        })
    }

    /// States the scheduler never moves a lead out of.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Qualified | Self::Closed)
    }
}

/// A prospect tracked by the nurture scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub lead_id: String,
    pub client_id: Option<String>,
    pub nurture_state: NurtureState,
    /// Recomputed on every scheduler pass, in `[0, 100]`.
    pub score: f64,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub next_follow_up_at: Option<DateTime<Utc>>,
    /// Size of `contact_log` after the last trim.
    pub recent_contacts: u32,
    /// Size of `engagement_log` after the last trim.
    pub engagement_events: u32,
    /// When each contact inside the activity window happened.
    #[serde(default)]
    pub contact_log: Vec<DateTime<Utc>>,
    /// Engagement signals (viewings, replies, document opens) inside the
    /// activity window.
    #[serde(default)]
    pub engagement_log: Vec<DateTime<Utc>>,
    /// Set by an agent action when the lead qualifies; consumed by the scheduler.
    pub qualified_signal_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Bumped by the store on every successful save.
    #[serde(default)]
    pub version: u64,
}

impl Lead {
    pub fn new(lead_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            lead_id: lead_id.into(),
            client_id: None,
            nurture_state: NurtureState::New,
            score: 0.0,
            last_contacted_at: None,
            next_follow_up_at: None,
            recent_contacts: 0,
            engagement_events: 0,
            contact_log: Vec::new(),
            engagement_log: Vec::new(),
            qualified_signal_at: None,
            created_at: now,
            version: 0,
        }
    }

    pub fn log_contact(&mut self, at: DateTime<Utc>) {
        self.contact_log.push(at);
        if self.last_contacted_at.map_or(true, |last| last < at) {
            self.last_contacted_at = Some(at);
        }
        self.recent_contacts = count_u32(self.contact_log.len());
    }

    pub fn log_engagement(&mut self, at: DateTime<Utc>) {
        self.engagement_log.push(at);
        self.engagement_events = count_u32(self.engagement_log.len());
    }

    /// Contacts logged within `window` before `now`.
    pub fn contacts_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> u32 {
        count_u32(self.contact_log.iter().filter(|at| now - **at <= window).count())
    }

    /// Engagement signals logged within `window` before `now`.
    pub fn engagements_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> u32 {
        count_u32(self.engagement_log.iter().filter(|at| now - **at <= window).count())
    }

    /// Drop activity older than `window` and refresh the counters.
    pub fn trim_activity(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        self.contact_log.retain(|at| now - *at <= window);
        self.engagement_log.retain(|at| now - *at <= window);
        self.recent_contacts = count_u32(self.contact_log.len());
        self.engagement_events = count_u32(self.engagement_log.len());
    }
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Qualified,
    Inactivity,
    Cooling,
    HotLead,
    FollowUpDue,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qualified => "qualified",
            Self::Inactivity => "inactivity",
            Self::Cooling => "cooling",
            Self::HotLead => "hot_lead",
            Self::FollowUpDue => "follow_up_due",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "qualified" => Self::Qualified,
            "inactivity" => Self::Inactivity,
            "cooling" => Self::Cooling,
            "hot_lead" => Self::HotLead,
            "follow_up_due" => Self::FollowUpDue,
            _ => return None,
        })
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A follow-up or state-change notice for the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub lead_id: String,
    pub trigger_reason: TriggerReason,
    pub due_at: DateTime<Utc>,
    pub delivered: bool,
}

impl NotificationEvent {
    pub fn new(lead_id: &str, trigger_reason: TriggerReason, due_at: DateTime<Utc>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            lead_id: lead_id.to_string(),
            trigger_reason,
            due_at,
            delivered: false,
        }
    }
}
