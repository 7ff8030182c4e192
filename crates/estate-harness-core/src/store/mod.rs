//! Storage abstraction for Estate Harness.
//!
//! Three traits split persistence by concern:
//!
//! | Trait | Backs |
//! |-------|-------|
//! | [`RelationalStore`] | transactions, market metrics, listings, clients; batched entity fetches |
//! | [`VectorStore`] | semantic chunks per collection, nearest-neighbour retrieval |
//! | [`LeadStore`] | leads and the notification ledger |
//!
//! Relational writes go through a [`RecordTransaction`] so the dual-store
//! writer can stage a document's rows, write its chunks, and only then
//! commit. Implementations must be `Send + Sync`.

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{
    ClauseType, EntityRef, ExtractedRecord, Lead, MarketMetric, NotificationEvent,
    PropertyListing, SemanticChunk, TransactionRecord, TriggerReason,
};

/// What a committed [`RecordTransaction`] changed.
///
/// Decided while the store holds its write lock, so two transactions
/// committing the same content never both count it as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Natural keys inserted, or updated because their content hash changed.
    pub written: Vec<String>,
    /// Staged rows identical to what was already stored.
    pub unchanged: usize,
}

/// A staged batch of relational upserts.
///
/// Nothing is visible until [`commit`](Self::commit). Dropping a
/// transaction without committing discards every staged write.
#[async_trait]
pub trait RecordTransaction: Send {
    /// Stage `record` under its natural key. Staging the same key again
    /// replaces the earlier row.
    async fn upsert(&mut self, record: &ExtractedRecord) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<CommitSummary>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub area: Option<String>,
    pub property_ref: Option<String>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    /// Case-insensitive substring of the listing location.
    pub area: Option<String>,
    pub max_price: Option<f64>,
    pub min_bedrooms: Option<u32>,
    pub limit: usize,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>>;

    /// Fetch context for many entities in one call.
    ///
    /// Unknown entities are absent from the returned map.
    async fn fetch_entities(&self, refs: &[EntityRef]) -> Result<HashMap<EntityRef, serde_json::Value>>;

    /// Matching transactions, newest first.
    async fn transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>>;

    async fn market_metrics(&self, area: Option<&str>) -> Result<Vec<MarketMetric>>;

    /// Matching listings, cheapest first.
    async fn listings(&self, query: &ListingQuery) -> Result<Vec<PropertyListing>>;

    /// Insert or replace a client profile.
    async fn put_client(&self, client_id: &str, profile: &serde_json::Value) -> Result<()>;
}

/// Query for [`VectorStore::nearest`]. Without an embedding, scoring falls
/// back to term overlap.
#[derive(Debug, Clone)]
pub struct VectorQuery<'a> {
    pub text: &'a str,
    pub embedding: Option<&'a [f32]>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkHit {
    pub collection: String,
    pub source_id: String,
    pub text: String,
    pub tags: Vec<String>,
    pub clause_type: Option<ClauseType>,
    pub content_hash: String,
    pub score: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Write `chunk` unless its `(collection, content_hash)` already exists.
    ///
    /// Returns `true` when a new chunk was written.
    async fn upsert_if_absent(&self, chunk: &SemanticChunk) -> Result<bool>;

    async fn contains(&self, collection: &str, content_hash: &str) -> Result<bool>;

    /// Best-scoring chunks in `collection`, highest score first. Chunks
    /// scoring zero are omitted.
    async fn nearest(&self, collection: &str, query: &VectorQuery<'_>) -> Result<Vec<ChunkHit>>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn leads(&self) -> Result<Vec<Lead>>;

    async fn lead(&self, lead_id: &str) -> Result<Option<Lead>>;

    /// Compare-and-set write of a lead.
    ///
    /// Succeeds only when the stored version still equals `lead.version`
    /// (or, for version 0, when no lead with that id exists); the stored
    /// version becomes `lead.version + 1`. Returns `false` on a version
    /// conflict, in which case nothing is written.
    async fn save_lead(&self, lead: &Lead) -> Result<bool>;

    /// True when an undelivered event for `(lead_id, reason)` exists.
    async fn has_pending_event(&self, lead_id: &str, reason: TriggerReason) -> Result<bool>;

    async fn record_event(&self, event: &NotificationEvent) -> Result<()>;

    async fn pending_events(&self) -> Result<Vec<NotificationEvent>>;

    /// Returns `false` if no such event exists.
    async fn mark_delivered(&self, event_id: &str) -> Result<bool>;
}

/// Score a stored chunk against a query: cosine when both sides carry an
/// embedding, term overlap otherwise.
pub fn score_chunk(query: &VectorQuery<'_>, chunk_text: &str, chunk_embedding: Option<&[f32]>) -> f64 {
    match (query.embedding, chunk_embedding) {
        (Some(q), Some(c)) if q.len() == c.len() => {
            crate::embedding::cosine_similarity(q, c) as f64
        }
        _ => crate::embedding::term_overlap(query.text, chunk_text),
    }
}

/// Entity payload for a property: its listing plus recent transactions.
///
/// `None` when neither exists.
pub fn property_payload(
    listing: Option<&PropertyListing>,
    transactions: &[TransactionRecord],
) -> Option<serde_json::Value> {
    if listing.is_none() && transactions.is_empty() {
        return None;
    }
    Some(serde_json::json!({
        "listing": listing,
        "transactions": transactions,
    }))
}

/// Entity payload for a market area: its metrics and transaction summary.
pub fn market_payload(
    area: &str,
    metrics: &[MarketMetric],
    transactions: &[TransactionRecord],
) -> Option<serde_json::Value> {
    if metrics.is_empty() && transactions.is_empty() {
        return None;
    }
    let mut prices: Vec<f64> = transactions.iter().map(|t| t.price).collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    let median = match prices.len() {
        0 => None,
        n if n % 2 == 1 => Some(prices[n / 2]),
        n => Some((prices[n / 2 - 1] + prices[n / 2]) / 2.0),
    };
    Some(serde_json::json!({
        "area": area,
        "metrics": metrics,
        "transaction_count": transactions.len(),
        "median_price": median,
    }))
}
