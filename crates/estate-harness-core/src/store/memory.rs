//! In-memory implementation of every store trait, for tests and demos.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Relational
//! transactions stage writes locally and apply them under a single write
//! lock on commit, which is also where each row is judged written or
//! unchanged. Lead saves are compare-and-set on [`Lead::version`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{
    EntityRef, EntityType, ExtractedRecord, Lead, MarketMetric, NotificationEvent,
    PropertyListing, SemanticChunk, TransactionRecord, TriggerReason,
};

use super::{
    market_payload, property_payload, score_chunk, ChunkHit, CommitSummary, LeadStore,
    ListingQuery, RecordTransaction, RelationalStore, TransactionQuery, VectorQuery,
    VectorStore,
};

#[derive(Clone)]
struct StoredRecord {
    record: ExtractedRecord,
    content_hash: String,
}

#[derive(Default)]
struct Inner {
    records: RwLock<HashMap<String, StoredRecord>>,
    clients: RwLock<HashMap<String, serde_json::Value>>,
    chunks: RwLock<Vec<SemanticChunk>>,
    leads: RwLock<HashMap<String, Lead>>,
    events: RwLock<Vec<NotificationEvent>>,
    entity_fetches: AtomicUsize,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of [`RelationalStore::fetch_entities`] calls served so far.
    pub fn entity_fetch_count(&self) -> usize {
        self.inner.entity_fetches.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> usize {
        read(&self.inner.records).len()
    }

    pub fn chunk_count(&self) -> usize {
        read(&self.inner.chunks).len()
    }

    fn committed_transactions(&self) -> Vec<TransactionRecord> {
        read(&self.inner.records)
            .values()
            .filter_map(|r| match &r.record {
                ExtractedRecord::Transaction(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    fn committed_metrics(&self) -> Vec<MarketMetric> {
        read(&self.inner.records)
            .values()
            .filter_map(|r| match &r.record {
                ExtractedRecord::MarketMetric(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn committed_listing(&self, property_ref: &str) -> Option<PropertyListing> {
        let key = format!("listing:{}", property_ref.to_uppercase());
        match read(&self.inner.records).get(&key).map(|r| &r.record) {
            Some(ExtractedRecord::Listing(l)) => Some(l.clone()),
            _ => None,
        }
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    staged: HashMap<String, StoredRecord>,
}

#[async_trait]
impl RecordTransaction for MemoryTransaction {
    async fn upsert(&mut self, record: &ExtractedRecord) -> Result<()> {
        if !record.is_relational() {
            bail!("{} records belong in the vector store", record.kind());
        }
        self.staged.insert(
            record.natural_key(),
            StoredRecord {
                record: record.clone(),
                content_hash: record.content_hash(),
            },
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<CommitSummary> {
        let MemoryTransaction { inner, staged } = *self;
        let mut records = write(&inner.records);
        let mut summary = CommitSummary::default();
        for (key, row) in staged {
            if records.get(&key).is_some_and(|r| r.content_hash == row.content_hash) {
                summary.unchanged += 1;
                continue;
            }
            records.insert(key.clone(), row);
            summary.written.push(key);
        }
        Ok(summary)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn matches_area(candidate: Option<&str>, wanted: &str) -> bool {
    candidate
        .map(|a| a.to_lowercase().contains(&wanted.to_lowercase()))
        .unwrap_or(false)
}

#[async_trait]
impl RelationalStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: HashMap::new(),
        }))
    }

    async fn fetch_entities(
        &self,
        refs: &[EntityRef],
    ) -> Result<HashMap<EntityRef, serde_json::Value>> {
        self.inner.entity_fetches.fetch_add(1, Ordering::SeqCst);
        let transactions = self.committed_transactions();
        let metrics = self.committed_metrics();
        let clients = read(&self.inner.clients).clone();

        let mut out = HashMap::new();
        for r in refs {
            let payload = match r.entity_type {
                EntityType::Client => clients.get(&r.entity_id).cloned(),
                EntityType::Property => {
                    let listing = self.committed_listing(&r.entity_id);
                    let txns: Vec<TransactionRecord> = transactions
                        .iter()
                        .filter(|t| {
                            t.property_ref
                                .as_deref()
                                .map(|p| p.eq_ignore_ascii_case(&r.entity_id))
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect();
                    property_payload(listing.as_ref(), &txns)
                }
                EntityType::MarketArea => {
                    let area_metrics: Vec<MarketMetric> = metrics
                        .iter()
                        .filter(|m| m.area.to_lowercase() == r.entity_id)
                        .cloned()
                        .collect();
                    let txns: Vec<TransactionRecord> = transactions
                        .iter()
                        .filter(|t| t.area.as_deref().map(str::to_lowercase).as_deref() == Some(r.entity_id.as_str()))
                        .cloned()
                        .collect();
                    market_payload(&r.entity_id, &area_metrics, &txns)
                }
            };
            if let Some(payload) = payload {
                out.insert(r.clone(), payload);
            }
        }
        Ok(out)
    }

    async fn transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>> {
        let mut rows: Vec<TransactionRecord> = self
            .committed_transactions()
            .into_iter()
            .filter(|t| match &query.area {
                Some(area) => matches_area(t.area.as_deref(), area),
                None => true,
            })
            .filter(|t| match &query.property_ref {
                Some(p) => t
                    .property_ref
                    .as_deref()
                    .map(|r| r.eq_ignore_ascii_case(p))
                    .unwrap_or(false),
                None => true,
            })
            .filter(|t| query.since.map(|s| t.date >= s).unwrap_or(true))
            .filter(|t| query.until.map(|u| t.date <= u).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date).then(b.price.total_cmp(&a.price)));
        if query.limit > 0 {
            rows.truncate(query.limit);
        }
        Ok(rows)
    }

    async fn market_metrics(&self, area: Option<&str>) -> Result<Vec<MarketMetric>> {
        let mut rows: Vec<MarketMetric> = self
            .committed_metrics()
            .into_iter()
            .filter(|m| area.map(|a| matches_area(Some(&m.area), a)).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| a.area.cmp(&b.area).then(a.metric.cmp(&b.metric)));
        Ok(rows)
    }

    async fn listings(&self, query: &ListingQuery) -> Result<Vec<PropertyListing>> {
        let mut rows: Vec<PropertyListing> = read(&self.inner.records)
            .values()
            .filter_map(|r| match &r.record {
                ExtractedRecord::Listing(l) => Some(l.clone()),
                _ => None,
            })
            .filter(|l| match &query.area {
                Some(area) => matches_area(l.location.as_deref(), area),
                None => true,
            })
            .filter(|l| match (query.max_price, l.price) {
                (Some(max), Some(price)) => price <= max,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|l| match (query.min_bedrooms, l.bedrooms) {
                (Some(min), Some(beds)) => beds >= min,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            let pa = a.price.unwrap_or(f64::MAX);
            let pb = b.price.unwrap_or(f64::MAX);
            pa.total_cmp(&pb).then(a.property_ref.cmp(&b.property_ref))
        });
        if query.limit > 0 {
            rows.truncate(query.limit);
        }
        Ok(rows)
    }

    async fn put_client(&self, client_id: &str, profile: &serde_json::Value) -> Result<()> {
        let key = EntityRef::client(client_id).entity_id;
        write(&self.inner.clients).insert(key, profile.clone());
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert_if_absent(&self, chunk: &SemanticChunk) -> Result<bool> {
        let mut chunks = write(&self.inner.chunks);
        let exists = chunks
            .iter()
            .any(|c| c.collection == chunk.collection && c.content_hash == chunk.content_hash);
        if exists {
            return Ok(false);
        }
        chunks.push(chunk.clone());
        Ok(true)
    }

    async fn contains(&self, collection: &str, content_hash: &str) -> Result<bool> {
        Ok(read(&self.inner.chunks)
            .iter()
            .any(|c| c.collection == collection && c.content_hash == content_hash))
    }

    async fn nearest(&self, collection: &str, query: &VectorQuery<'_>) -> Result<Vec<ChunkHit>> {
        let chunks = read(&self.inner.chunks);
        let mut hits: Vec<ChunkHit> = chunks
            .iter()
            .filter(|c| c.collection == collection)
            .filter_map(|c| {
                let score = score_chunk(query, &c.text, c.embedding.as_deref());
                (score > 0.0).then(|| ChunkHit {
                    collection: c.collection.clone(),
                    source_id: c.source_id.clone(),
                    text: c.text.clone(),
                    tags: c.tags.clone(),
                    clause_type: c.clause_type,
                    content_hash: c.content_hash.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.limit);
        Ok(hits)
    }
}

#[async_trait]
impl LeadStore for InMemoryStore {
    async fn leads(&self) -> Result<Vec<Lead>> {
        let mut leads: Vec<Lead> = read(&self.inner.leads).values().cloned().collect();
        leads.sort_by(|a, b| a.lead_id.cmp(&b.lead_id));
        Ok(leads)
    }

    async fn lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        Ok(read(&self.inner.leads).get(lead_id).cloned())
    }

    async fn save_lead(&self, lead: &Lead) -> Result<bool> {
        let mut leads = write(&self.inner.leads);
        let stored_version = leads.get(&lead.lead_id).map(|l| l.version);
        let current = match stored_version {
            Some(v) => v == lead.version,
            None => lead.version == 0,
        };
        if !current {
            return Ok(false);
        }
        let mut saved = lead.clone();
        saved.version = lead.version + 1;
        leads.insert(lead.lead_id.clone(), saved);
        Ok(true)
    }

    async fn has_pending_event(&self, lead_id: &str, reason: TriggerReason) -> Result<bool> {
        Ok(read(&self.inner.events)
            .iter()
            .any(|e| e.lead_id == lead_id && e.trigger_reason == reason && !e.delivered))
    }

    async fn record_event(&self, event: &NotificationEvent) -> Result<()> {
        write(&self.inner.events).push(event.clone());
        Ok(())
    }

    async fn pending_events(&self) -> Result<Vec<NotificationEvent>> {
        let mut pending: Vec<NotificationEvent> = read(&self.inner.events)
            .iter()
            .filter(|e| !e.delivered)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.due_at.cmp(&b.due_at));
        Ok(pending)
    }

    async fn mark_delivered(&self, event_id: &str) -> Result<bool> {
        let mut events = write(&self.inner.events);
        match events.iter_mut().find(|e| e.event_id == event_id) {
            Some(event) => {
                event.delivered = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
