//! Intent handlers and their registry.
//!
//! Each handler answers one intent label from the stores and returns a
//! [`HandlerOutput`]: a titled JSON body plus the entities it mentions. The
//! router wraps outputs (or failures) into [`Section`]s.
//!
//! | Intent | Handler | Reads |
//! |--------|---------|-------|
//! | `market_analysis` | [`MarketAnalysisHandler`] | market metrics, area transactions, `market_report` chunks |
//! | `legal` | [`LegalHandler`] | `legal` chunks |
//! | `property_search` | [`PropertySearchHandler`] | listings, `brochure` chunks |
//! | `transaction_history` | [`TransactionHistoryHandler`] | transactions |
//! | `free_form` | [`FreeFormHandler`] | every chunk collection |
//!
//! Custom handlers are added with [`HandlerRegistry::register`]; a handler
//! registered for an existing intent replaces the previous one.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use estate_harness_core::models::{Category, EntityRef, Intent};
use estate_harness_core::store::{
    ChunkHit, ListingQuery, RelationalStore, TransactionQuery, VectorQuery, VectorStore,
};

use crate::embedding::{embed_query, Embedder};
use crate::error::HandlerError;
use crate::intent::{self, slots};

/// One part of a merged chat response.
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub intent: String,
    pub handler: String,
    pub title: String,
    pub body: Value,
    pub entities: Vec<EntityRef>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Section {
    pub fn from_output(intent: &str, handler: &str, output: HandlerOutput) -> Self {
        Self {
            intent: intent.to_string(),
            handler: handler.to_string(),
            title: output.title,
            body: output.body,
            entities: output.entities,
            degraded: false,
            error: None,
        }
    }

    /// Placeholder for a handler that failed or timed out.
    pub fn degraded(intent: &str, handler: &str, error: &HandlerError) -> Self {
        Self {
            intent: intent.to_string(),
            handler: handler.to_string(),
            title: format!("{} unavailable", intent.replace('_', " ")),
            body: Value::Null,
            entities: Vec::new(),
            degraded: true,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub title: String,
    pub body: Value,
    pub entities: Vec<EntityRef>,
}

/// Store access shared by every handler of a turn.
#[derive(Clone)]
pub struct HandlerContext {
    pub relational: Arc<dyn RelationalStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub top_k: usize,
}

impl HandlerContext {
    /// Query embedding, or `None` when embeddings are off or the call failed.
    async fn query_embedding(&self, text: &str) -> Option<Vec<f32>> {
        if !self.embedder.is_enabled() {
            return None;
        }
        match embed_query(self.embedder.as_ref(), text).await {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "query embedding failed, using term overlap");
                None
            }
        }
    }

    async fn search(&self, collection: &str, text: &str) -> Result<Vec<ChunkHit>> {
        let embedding = self.query_embedding(text).await;
        let query = VectorQuery {
            text,
            embedding: embedding.as_deref(),
            limit: self.top_k,
        };
        self.vectors.nearest(collection, &query).await
    }
}

#[async_trait]
pub trait IntentHandler: Send + Sync {
    fn name(&self) -> &str;

    /// The intent label this handler answers.
    fn intent(&self) -> &str;

    async fn handle(&self, intent: &Intent, ctx: &HandlerContext) -> Result<HandlerOutput>;
}

pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn IntentHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registry with a handler for every built-in intent label.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MarketAnalysisHandler));
        registry.register(Arc::new(LegalHandler));
        registry.register(Arc::new(PropertySearchHandler));
        registry.register(Arc::new(TransactionHistoryHandler));
        registry.register(Arc::new(FreeFormHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn IntentHandler>) {
        self.handlers.retain(|h| h.intent() != handler.intent());
        self.handlers.push(handler);
    }

    pub fn find(&self, intent: &str) -> Option<Arc<dyn IntentHandler>> {
        self.handlers.iter().find(|h| h.intent() == intent).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn slot<'a>(intent: &'a Intent, name: &str) -> Option<&'a str> {
    intent.slot_values.get(name).map(String::as_str).filter(|s| !s.is_empty())
}

fn query_text(intent: &Intent) -> &str {
    slot(intent, slots::QUERY).unwrap_or(intent.label.as_str())
}

/// Entities named directly by the intent's slots.
fn slot_entities(intent: &Intent) -> Vec<EntityRef> {
    let mut out = Vec::new();
    if let Some(p) = slot(intent, slots::PROPERTY_REF) {
        out.push(EntityRef::property(p));
    }
    if let Some(c) = slot(intent, slots::CLIENT_ID) {
        out.push(EntityRef::client(c));
    }
    if let Some(a) = slot(intent, slots::AREA) {
        out.push(EntityRef::market_area(a));
    }
    out
}

fn push_unique(entities: &mut Vec<EntityRef>, entity: EntityRef) {
    if !entities.contains(&entity) {
        entities.push(entity);
    }
}

// ============ Market analysis ============

pub struct MarketAnalysisHandler;

#[async_trait]
impl IntentHandler for MarketAnalysisHandler {
    fn name(&self) -> &str {
        "market_analysis"
    }

    fn intent(&self) -> &str {
        intent::MARKET_ANALYSIS
    }

    async fn handle(&self, intent: &Intent, ctx: &HandlerContext) -> Result<HandlerOutput> {
        let area = slot(intent, slots::AREA);
        let metrics = ctx.relational.market_metrics(area).await?;
        let transactions = ctx
            .relational
            .transactions(&TransactionQuery {
                area: area.map(str::to_string),
                limit: 0,
                ..TransactionQuery::default()
            })
            .await?;
        let excerpts = ctx.search(Category::MarketReport.collection(), query_text(intent)).await?;

        let mut prices: Vec<f64> = transactions.iter().map(|t| t.price).collect();
        prices.sort_by(|a, b| a.total_cmp(b));
        let average = (!prices.is_empty()).then(|| prices.iter().sum::<f64>() / prices.len() as f64);

        let mut entities = slot_entities(intent);
        for m in &metrics {
            push_unique(&mut entities, EntityRef::market_area(&m.area));
        }

        Ok(HandlerOutput {
            title: match area {
                Some(a) => format!("Market analysis: {}", a),
                None => "Market analysis".to_string(),
            },
            body: json!({
                "area": area,
                "metrics": metrics,
                "transaction_count": transactions.len(),
                "average_transaction_price": average,
                "excerpts": excerpts,
            }),
            entities,
        })
    }
}

// ============ Legal ============

pub struct LegalHandler;

#[async_trait]
impl IntentHandler for LegalHandler {
    fn name(&self) -> &str {
        "legal"
    }

    fn intent(&self) -> &str {
        intent::LEGAL
    }

    async fn handle(&self, intent: &Intent, ctx: &HandlerContext) -> Result<HandlerOutput> {
        let hits = ctx.search(Category::Legal.collection(), query_text(intent)).await?;
        let clauses: Vec<Value> = hits
            .iter()
            .map(|h| {
                json!({
                    "clause_type": h.clause_type,
                    "tags": h.tags,
                    "text": h.text,
                    "score": h.score,
                    "source_id": h.source_id,
                })
            })
            .collect();
        Ok(HandlerOutput {
            title: "Legal guidance".to_string(),
            body: json!({ "clauses": clauses }),
            entities: slot_entities(intent),
        })
    }
}

// ============ Property search ============

pub struct PropertySearchHandler;

#[async_trait]
impl IntentHandler for PropertySearchHandler {
    fn name(&self) -> &str {
        "property_search"
    }

    fn intent(&self) -> &str {
        intent::PROPERTY_SEARCH
    }

    async fn handle(&self, intent: &Intent, ctx: &HandlerContext) -> Result<HandlerOutput> {
        let query = ListingQuery {
            area: slot(intent, slots::AREA).map(str::to_string),
            max_price: slot(intent, slots::MAX_PRICE).and_then(|p| p.parse().ok()),
            min_bedrooms: slot(intent, slots::BEDROOMS).and_then(|b| b.parse().ok()),
            limit: ctx.top_k,
        };
        let listings = ctx.relational.listings(&query).await?;
        let highlights = ctx.search(Category::Brochure.collection(), query_text(intent)).await?;

        let mut entities = slot_entities(intent);
        for l in &listings {
            push_unique(&mut entities, EntityRef::property(&l.property_ref));
        }

        Ok(HandlerOutput {
            title: format!("{} matching listing(s)", listings.len()),
            body: json!({
                "filters": {
                    "area": query.area,
                    "max_price": query.max_price,
                    "min_bedrooms": query.min_bedrooms,
                },
                "listings": listings,
                "highlights": highlights,
            }),
            entities,
        })
    }
}

// ============ Transaction history ============

pub struct TransactionHistoryHandler;

#[async_trait]
impl IntentHandler for TransactionHistoryHandler {
    fn name(&self) -> &str {
        "transaction_history"
    }

    fn intent(&self) -> &str {
        intent::TRANSACTION_HISTORY
    }

    async fn handle(&self, intent: &Intent, ctx: &HandlerContext) -> Result<HandlerOutput> {
        let transactions = ctx
            .relational
            .transactions(&TransactionQuery {
                area: slot(intent, slots::AREA).map(str::to_string),
                property_ref: slot(intent, slots::PROPERTY_REF).map(str::to_string),
                limit: ctx.top_k,
                ..TransactionQuery::default()
            })
            .await?;

        let mut entities = slot_entities(intent);
        for t in &transactions {
            if let Some(p) = &t.property_ref {
                push_unique(&mut entities, EntityRef::property(p));
            }
        }

        Ok(HandlerOutput {
            title: format!("{} recent transaction(s)", transactions.len()),
            body: json!({ "transactions": transactions }),
            entities,
        })
    }
}

// ============ Free form ============

/// Fallback when no intent clears the threshold: search every collection.
pub struct FreeFormHandler;

#[async_trait]
impl IntentHandler for FreeFormHandler {
    fn name(&self) -> &str {
        "free_form"
    }

    fn intent(&self) -> &str {
        intent::FREE_FORM
    }

    async fn handle(&self, intent: &Intent, ctx: &HandlerContext) -> Result<HandlerOutput> {
        let text = query_text(intent);
        let mut hits = Vec::new();
        for category in Category::KNOWN.iter().chain([Category::Unknown].iter()) {
            hits.extend(ctx.search(category.collection(), text).await?);
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(ctx.top_k);
        Ok(HandlerOutput {
            title: "Related documents".to_string(),
            body: json!({ "results": hits }),
            entities: slot_entities(intent),
        })
    }
}
