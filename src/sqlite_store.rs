//! SQLite-backed implementation of the store traits.
//!
//! One pool serves the relational tables, the vector chunk table and the
//! lead ledger (schema in [`crate::migrate`]). Vector search is brute force:
//! chunks of the requested collection are scored in process with cosine
//! similarity, or term overlap for chunks or queries without an embedding.
//!
//! A [`RecordTransaction`] stages rows in memory and applies them in a single
//! SQLite transaction on commit. Holding a write transaction open while the
//! dual-store writer inserts chunks through another pooled connection would
//! block on SQLite's single writer lock. Every statement in the commit is a
//! write, so the lock is taken before anything is read and the written or
//! unchanged verdict comes from `rows_affected` under that lock.
//!
//! Lead saves are compare-and-set on the `version` column.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use estate_harness_core::embedding::{blob_to_vec, vec_to_blob};
use estate_harness_core::models::{
    ClauseType, EntityRef, EntityType, ExtractedRecord, Lead, MarketMetric, NotificationEvent,
    NurtureState, PropertyListing, SemanticChunk, TransactionRecord, TriggerReason,
};
use estate_harness_core::store::{
    market_payload, property_payload, score_chunk, ChunkHit, LeadStore, ListingQuery,
    CommitSummary, RecordTransaction, RelationalStore, TransactionQuery, VectorQuery,
    VectorStore,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn table_for(record: &ExtractedRecord) -> Result<&'static str> {
    Ok(match record {
        ExtractedRecord::Transaction(_) => "transactions",
        ExtractedRecord::MarketMetric(_) => "market_metrics",
        ExtractedRecord::Listing(_) => "listings",
        ExtractedRecord::Legal(_) => bail!("legal records belong in the vector store"),
    })
}

const TRANSACTION_COLUMNS: &str = "price, date, parties_json, property_ref, area";
const METRIC_COLUMNS: &str = "area, metric, value, unit, period";
const LISTING_COLUMNS: &str = "property_ref, title, price, bedrooms, size_sqft, location, description";

fn transaction_from_row(row: &SqliteRow) -> Result<TransactionRecord> {
    let date: String = row.try_get("date")?;
    let parties: String = row.try_get("parties_json")?;
    Ok(TransactionRecord {
        price: row.try_get("price")?,
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .with_context(|| format!("invalid transaction date '{}'", date))?,
        parties: serde_json::from_str(&parties)?,
        property_ref: row.try_get("property_ref")?,
        area: row.try_get("area")?,
    })
}

fn metric_from_row(row: &SqliteRow) -> Result<MarketMetric> {
    Ok(MarketMetric {
        area: row.try_get("area")?,
        metric: row.try_get("metric")?,
        value: row.try_get("value")?,
        unit: row.try_get("unit")?,
        period: row.try_get("period")?,
    })
}

fn listing_from_row(row: &SqliteRow) -> Result<PropertyListing> {
    let bedrooms: Option<i64> = row.try_get("bedrooms")?;
    Ok(PropertyListing {
        property_ref: row.try_get("property_ref")?,
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        bedrooms: bedrooms.map(u32::try_from).transpose()?,
        size_sqft: row.try_get("size_sqft")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
    })
}

fn lead_from_row(row: &SqliteRow) -> Result<Lead> {
    let state: String = row.try_get("nurture_state")?;
    let contacts: i64 = row.try_get("recent_contacts")?;
    let engagement: i64 = row.try_get("engagement_events")?;
    let contact_log: String = row.try_get("contact_log_json")?;
    let engagement_log: String = row.try_get("engagement_log_json")?;
    let created_at: String = row.try_get("created_at")?;
    let version: i64 = row.try_get("version")?;
    Ok(Lead {
        lead_id: row.try_get("lead_id")?,
        client_id: row.try_get("client_id")?,
        nurture_state: NurtureState::parse(&state)
            .ok_or_else(|| anyhow!("unknown nurture state '{}'", state))?,
        score: row.try_get("score")?,
        last_contacted_at: parse_opt_ts(row.try_get("last_contacted_at")?)?,
        next_follow_up_at: parse_opt_ts(row.try_get("next_follow_up_at")?)?,
        recent_contacts: u32::try_from(contacts)?,
        engagement_events: u32::try_from(engagement)?,
        contact_log: serde_json::from_str(&contact_log)?,
        engagement_log: serde_json::from_str(&engagement_log)?,
        qualified_signal_at: parse_opt_ts(row.try_get("qualified_signal_at")?)?,
        created_at: parse_ts(&created_at)?,
        version: u64::try_from(version)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<NotificationEvent> {
    let reason: String = row.try_get("trigger_reason")?;
    let due_at: String = row.try_get("due_at")?;
    let delivered: i64 = row.try_get("delivered")?;
    Ok(NotificationEvent {
        event_id: row.try_get("event_id")?,
        lead_id: row.try_get("lead_id")?,
        trigger_reason: TriggerReason::parse(&reason)
            .ok_or_else(|| anyhow!("unknown trigger reason '{}'", reason))?,
        due_at: parse_ts(&due_at)?,
        delivered: delivered != 0,
    })
}

// ============ Relational ============

struct StagedRow {
    record: ExtractedRecord,
    content_hash: String,
}

struct SqliteTransaction {
    pool: SqlitePool,
    staged: HashMap<String, StagedRow>,
}

/// Upsert one staged row. Returns the number of rows changed: 0 when the
/// stored content hash already matches.
async fn write_row(conn: &mut SqliteConnection, key: &str, row: &StagedRow, now: &str) -> Result<u64> {
    let changed = match &row.record {
        ExtractedRecord::Transaction(t) => {
            sqlx::query(
                r#"
                INSERT INTO transactions (natural_key, content_hash, price, date, parties_json,
                                          property_ref, area, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(natural_key) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    price = excluded.price,
                    date = excluded.date,
                    parties_json = excluded.parties_json,
                    property_ref = excluded.property_ref,
                    area = excluded.area,
                    updated_at = excluded.updated_at
                WHERE transactions.content_hash != excluded.content_hash
                "#,
            )
            .bind(key)
            .bind(&row.content_hash)
            .bind(t.price)
            .bind(t.date.to_string())
            .bind(serde_json::to_string(&t.parties)?)
            .bind(&t.property_ref)
            .bind(&t.area)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .rows_affected()
        }
        ExtractedRecord::MarketMetric(m) => {
            sqlx::query(
                r#"
                INSERT INTO market_metrics (natural_key, content_hash, area, metric, value,
                                            unit, period, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(natural_key) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    area = excluded.area,
                    value = excluded.value,
                    unit = excluded.unit,
                    period = excluded.period,
                    updated_at = excluded.updated_at
                WHERE market_metrics.content_hash != excluded.content_hash
                "#,
            )
            .bind(key)
            .bind(&row.content_hash)
            .bind(&m.area)
            .bind(&m.metric)
            .bind(m.value)
            .bind(&m.unit)
            .bind(&m.period)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .rows_affected()
        }
        ExtractedRecord::Listing(l) => {
            sqlx::query(
                r#"
                INSERT INTO listings (natural_key, content_hash, property_ref, title, price,
                                      bedrooms, size_sqft, location, description, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(natural_key) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    title = excluded.title,
                    price = excluded.price,
                    bedrooms = excluded.bedrooms,
                    size_sqft = excluded.size_sqft,
                    location = excluded.location,
                    description = excluded.description,
                    updated_at = excluded.updated_at
                WHERE listings.content_hash != excluded.content_hash
                "#,
            )
            .bind(key)
            .bind(&row.content_hash)
            .bind(&l.property_ref)
            .bind(&l.title)
            .bind(l.price)
            .bind(l.bedrooms.map(i64::from))
            .bind(l.size_sqft)
            .bind(&l.location)
            .bind(&l.description)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .rows_affected()
        }
        ExtractedRecord::Legal(_) => bail!("legal records belong in the vector store"),
    };
    Ok(changed)
}

#[async_trait]
impl RecordTransaction for SqliteTransaction {
    async fn upsert(&mut self, record: &ExtractedRecord) -> Result<()> {
        table_for(record)?;
        self.staged.insert(
            record.natural_key(),
            StagedRow {
                record: record.clone(),
                content_hash: record.content_hash(),
            },
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<CommitSummary> {
        let mut summary = CommitSummary::default();
        if self.staged.is_empty() {
            return Ok(summary);
        }
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        for (key, row) in &self.staged {
            if write_row(&mut tx, key, row, &now).await? > 0 {
                summary.written.push(key.clone());
            } else {
                summary.unchanged += 1;
            }
        }
        tx.commit().await?;
        Ok(summary)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl SqliteStore {
    async fn transactions_where(&self, column_expr: &str, values: &[String]) -> Result<Vec<TransactionRecord>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM transactions WHERE {} IN ({}) ORDER BY date DESC",
            TRANSACTION_COLUMNS,
            column_expr,
            placeholders(values.len())
        );
        let mut query = sqlx::query(&sql);
        for v in values {
            query = query.bind(v);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>> {
        Ok(Box::new(SqliteTransaction {
            pool: self.pool.clone(),
            staged: HashMap::new(),
        }))
    }

    async fn fetch_entities(&self, refs: &[EntityRef]) -> Result<HashMap<EntityRef, serde_json::Value>> {
        let ids = |t: EntityType| -> Vec<String> {
            let mut ids: Vec<String> = refs
                .iter()
                .filter(|r| r.entity_type == t)
                .map(|r| r.entity_id.clone())
                .collect();
            ids.sort();
            ids.dedup();
            ids
        };
        let properties = ids(EntityType::Property);
        let areas = ids(EntityType::MarketArea);
        let clients = ids(EntityType::Client);
        let mut out = HashMap::new();

        if !properties.is_empty() {
            let sql = format!(
                "SELECT {} FROM listings WHERE UPPER(property_ref) IN ({})",
                LISTING_COLUMNS,
                placeholders(properties.len())
            );
            let mut query = sqlx::query(&sql);
            for p in &properties {
                query = query.bind(p);
            }
            let mut listings: HashMap<String, PropertyListing> = HashMap::new();
            for row in query.fetch_all(&self.pool).await? {
                let listing = listing_from_row(&row)?;
                listings.insert(listing.property_ref.to_uppercase(), listing);
            }
            let txns = self.transactions_where("UPPER(property_ref)", &properties).await?;
            for p in &properties {
                let own: Vec<TransactionRecord> = txns
                    .iter()
                    .filter(|t| t.property_ref.as_deref().map(str::to_uppercase).as_deref() == Some(p.as_str()))
                    .cloned()
                    .collect();
                if let Some(payload) = property_payload(listings.get(p), &own) {
                    out.insert(EntityRef::property(p), payload);
                }
            }
        }

        if !areas.is_empty() {
            let sql = format!(
                "SELECT {} FROM market_metrics WHERE LOWER(area) IN ({}) ORDER BY area, metric",
                METRIC_COLUMNS,
                placeholders(areas.len())
            );
            let mut query = sqlx::query(&sql);
            for a in &areas {
                query = query.bind(a);
            }
            let metrics: Vec<MarketMetric> = query
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(metric_from_row)
                .collect::<Result<_>>()?;
            let txns = self.transactions_where("LOWER(area)", &areas).await?;
            for a in &areas {
                let own_metrics: Vec<MarketMetric> =
                    metrics.iter().filter(|m| m.area.to_lowercase() == *a).cloned().collect();
                let own_txns: Vec<TransactionRecord> = txns
                    .iter()
                    .filter(|t| t.area.as_deref().map(str::to_lowercase).as_deref() == Some(a.as_str()))
                    .cloned()
                    .collect();
                if let Some(payload) = market_payload(a, &own_metrics, &own_txns) {
                    out.insert(EntityRef::market_area(a), payload);
                }
            }
        }

        if !clients.is_empty() {
            let sql = format!(
                "SELECT client_id, profile_json FROM clients WHERE client_id IN ({})",
                placeholders(clients.len())
            );
            let mut query = sqlx::query(&sql);
            for c in &clients {
                query = query.bind(c);
            }
            for row in query.fetch_all(&self.pool).await? {
                let id: String = row.try_get("client_id")?;
                let profile: String = row.try_get("profile_json")?;
                out.insert(EntityRef::client(&id), serde_json::from_str(&profile)?);
            }
        }

        Ok(out)
    }

    async fn transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM transactions
            WHERE (? IS NULL OR LOWER(area) LIKE '%' || LOWER(?) || '%')
              AND (? IS NULL OR UPPER(property_ref) = UPPER(?))
              AND (? IS NULL OR date >= ?)
              AND (? IS NULL OR date <= ?)
            ORDER BY date DESC, price DESC
            LIMIT ?
            "#,
            TRANSACTION_COLUMNS
        );
        let since = query.since.map(|d| d.to_string());
        let until = query.until.map(|d| d.to_string());
        let limit = if query.limit == 0 { -1 } else { query.limit as i64 };
        let rows = sqlx::query(&sql)
            .bind(&query.area)
            .bind(&query.area)
            .bind(&query.property_ref)
            .bind(&query.property_ref)
            .bind(&since)
            .bind(&since)
            .bind(&until)
            .bind(&until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn market_metrics(&self, area: Option<&str>) -> Result<Vec<MarketMetric>> {
        let sql = format!(
            "SELECT {} FROM market_metrics \
             WHERE (? IS NULL OR LOWER(area) LIKE '%' || LOWER(?) || '%') \
             ORDER BY area, metric",
            METRIC_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(area).bind(area).fetch_all(&self.pool).await?;
        rows.iter().map(metric_from_row).collect()
    }

    async fn listings(&self, query: &ListingQuery) -> Result<Vec<PropertyListing>> {
        let sql = format!(
            r#"
            SELECT {} FROM listings
            WHERE (? IS NULL OR LOWER(location) LIKE '%' || LOWER(?) || '%')
              AND (? IS NULL OR (price IS NOT NULL AND price <= ?))
              AND (? IS NULL OR (bedrooms IS NOT NULL AND bedrooms >= ?))
            ORDER BY price IS NULL, price ASC, property_ref
            LIMIT ?
            "#,
            LISTING_COLUMNS
        );
        let min_bedrooms = query.min_bedrooms.map(i64::from);
        let limit = if query.limit == 0 { -1 } else { query.limit as i64 };
        let rows = sqlx::query(&sql)
            .bind(&query.area)
            .bind(&query.area)
            .bind(query.max_price)
            .bind(query.max_price)
            .bind(min_bedrooms)
            .bind(min_bedrooms)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn put_client(&self, client_id: &str, profile: &serde_json::Value) -> Result<()> {
        let id = EntityRef::client(client_id).entity_id;
        sqlx::query(
            r#"
            INSERT INTO clients (client_id, profile_json, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(client_id) DO UPDATE SET
                profile_json = excluded.profile_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(serde_json::to_string(profile)?)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============ Vector ============

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert_if_absent(&self, chunk: &SemanticChunk) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO vector_chunks (id, collection, source_id, chunk_index, text, tags_json,
                                       clause_type, content_hash, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, content_hash) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&chunk.collection)
        .bind(&chunk.source_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(serde_json::to_string(&chunk.tags)?)
        .bind(chunk.clause_type.map(|c| c.as_str()))
        .bind(&chunk.content_hash)
        .bind(chunk.embedding.as_deref().map(vec_to_blob))
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn contains(&self, collection: &str, content_hash: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vector_chunks WHERE collection = ? AND content_hash = ?",
        )
        .bind(collection)
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn nearest(&self, collection: &str, query: &VectorQuery<'_>) -> Result<Vec<ChunkHit>> {
        let rows = sqlx::query(
            "SELECT source_id, text, tags_json, clause_type, content_hash, embedding \
             FROM vector_chunks WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::new();
        for row in rows {
            let text: String = row.try_get("text")?;
            let blob: Option<Vec<u8>> = row.try_get("embedding")?;
            let embedding = blob.as_deref().map(blob_to_vec);
            let score = score_chunk(query, &text, embedding.as_deref());
            if score <= 0.0 {
                continue;
            }
            let tags: String = row.try_get("tags_json")?;
            let clause: Option<String> = row.try_get("clause_type")?;
            hits.push(ChunkHit {
                collection: collection.to_string(),
                source_id: row.try_get("source_id")?,
                text,
                tags: serde_json::from_str(&tags)?,
                clause_type: clause.as_deref().and_then(ClauseType::parse),
                content_hash: row.try_get("content_hash")?,
                score,
            });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.limit);
        Ok(hits)
    }
}

// ============ Leads ============

const LEAD_COLUMNS: &str = "lead_id, client_id, nurture_state, score, last_contacted_at, \
     next_follow_up_at, recent_contacts, engagement_events, contact_log_json, engagement_log_json, \
     qualified_signal_at, created_at, version";

#[async_trait]
impl LeadStore for SqliteStore {
    async fn leads(&self) -> Result<Vec<Lead>> {
        let sql = format!("SELECT {} FROM leads ORDER BY lead_id", LEAD_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(lead_from_row).collect()
    }

    async fn lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        let sql = format!("SELECT {} FROM leads WHERE lead_id = ?", LEAD_COLUMNS);
        let row = sqlx::query(&sql).bind(lead_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn save_lead(&self, lead: &Lead) -> Result<bool> {
        let expected = i64::try_from(lead.version)?;
        let result = sqlx::query(
            r#"
            INSERT INTO leads (lead_id, client_id, nurture_state, score, last_contacted_at,
                               next_follow_up_at, recent_contacts, engagement_events,
                               contact_log_json, engagement_log_json, qualified_signal_at,
                               created_at, version)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1
            WHERE ? = 0
            ON CONFLICT(lead_id) DO NOTHING
            "#,
        )
        .bind(&lead.lead_id)
        .bind(&lead.client_id)
        .bind(lead.nurture_state.as_str())
        .bind(lead.score)
        .bind(lead.last_contacted_at.map(ts))
        .bind(lead.next_follow_up_at.map(ts))
        .bind(i64::from(lead.recent_contacts))
        .bind(i64::from(lead.engagement_events))
        .bind(serde_json::to_string(&lead.contact_log)?)
        .bind(serde_json::to_string(&lead.engagement_log)?)
        .bind(lead.qualified_signal_at.map(ts))
        .bind(ts(lead.created_at))
        .bind(expected)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let result = sqlx::query(
            r#"
            UPDATE leads SET
                client_id = ?,
                nurture_state = ?,
                score = ?,
                last_contacted_at = ?,
                next_follow_up_at = ?,
                recent_contacts = ?,
                engagement_events = ?,
                contact_log_json = ?,
                engagement_log_json = ?,
                qualified_signal_at = ?,
                version = version + 1
            WHERE lead_id = ? AND version = ?
            "#,
        )
        .bind(&lead.client_id)
        .bind(lead.nurture_state.as_str())
        .bind(lead.score)
        .bind(lead.last_contacted_at.map(ts))
        .bind(lead.next_follow_up_at.map(ts))
        .bind(i64::from(lead.recent_contacts))
        .bind(i64::from(lead.engagement_events))
        .bind(serde_json::to_string(&lead.contact_log)?)
        .bind(serde_json::to_string(&lead.engagement_log)?)
        .bind(lead.qualified_signal_at.map(ts))
        .bind(&lead.lead_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_pending_event(&self, lead_id: &str, reason: TriggerReason) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE lead_id = ? AND trigger_reason = ? AND delivered = 0",
        )
        .bind(lead_id)
        .bind(reason.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn record_event(&self, event: &NotificationEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (event_id, lead_id, trigger_reason, due_at, delivered) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(&event.lead_id)
        .bind(event.trigger_reason.as_str())
        .bind(ts(event.due_at))
        .bind(i64::from(event.delivered))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_events(&self) -> Result<Vec<NotificationEvent>> {
        let rows = sqlx::query(
            "SELECT event_id, lead_id, trigger_reason, due_at, delivered \
             FROM notifications WHERE delivered = 0 ORDER BY due_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn mark_delivered(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE notifications SET delivered = 1 WHERE event_id = ?")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};

    async fn open(dir: &tempfile::TempDir) -> SqliteStore {
        let config = Config::with_db_path(dir.path().join("estate.db"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn txn(price: f64, property: &str) -> ExtractedRecord {
        ExtractedRecord::Transaction(TransactionRecord {
            price,
            date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            parties: vec!["Alice".into(), "Bob".into()],
            property_ref: Some(property.into()),
            area: Some("Dubai Marina".into()),
        })
    }

    #[tokio::test]
    async fn staged_upserts_apply_on_commit_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut tx = store.begin().await.unwrap();
        tx.upsert(&txn(1.0e6, "P-1")).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.transactions(&TransactionQuery::default()).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.upsert(&txn(1.0e6, "P-1")).await.unwrap();
        assert_eq!(tx.commit().await.unwrap().written.len(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.upsert(&txn(1.0e6, "P-1")).await.unwrap();
        assert!(tx.upsert(&ExtractedRecord::Legal(
            estate_harness_core::models::LegalChunk::new("x", ClauseType::General, vec![]).unwrap()
        ))
        .await
        .is_err());
        let summary = tx.commit().await.unwrap();
        assert!(summary.written.is_empty());
        assert_eq!(summary.unchanged, 1);

        let rows = store
            .transactions(&TransactionQuery {
                area: Some("marina".into()),
                ..TransactionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].parties, vec!["Alice".to_string(), "Bob".to_string()]);
    }

    #[tokio::test]
    async fn entity_batch_and_listing_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&txn(2.0e6, "P-7")).await.unwrap();
        tx.upsert(&ExtractedRecord::Listing(PropertyListing {
            property_ref: "P-7".into(),
            title: "Marina view".into(),
            price: Some(2.1e6),
            bedrooms: Some(2),
            size_sqft: Some(1200.0),
            location: Some("Dubai Marina".into()),
            description: String::new(),
        }))
        .await
        .unwrap();
        tx.commit().await.unwrap();
        store.put_client("c-1", &serde_json::json!({"name": "Dana"})).await.unwrap();

        let found = store
            .fetch_entities(&[
                EntityRef::property("p-7"),
                EntityRef::market_area("Dubai Marina"),
                EntityRef::client("C-1"),
                EntityRef::property("P-404"),
            ])
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[&EntityRef::property("P-7")]["listing"]["title"], "Marina view");
        assert_eq!(found[&EntityRef::market_area("dubai marina")]["transaction_count"], 1);
        assert_eq!(found[&EntityRef::client("c-1")]["name"], "Dana");

        let cheap = store
            .listings(&ListingQuery {
                max_price: Some(1.0e6),
                ..ListingQuery::default()
            })
            .await
            .unwrap();
        assert!(cheap.is_empty());
        let two_bed = store
            .listings(&ListingQuery {
                area: Some("marina".into()),
                min_bedrooms: Some(2),
                limit: 5,
                ..ListingQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(two_bed.len(), 1);
    }

    #[tokio::test]
    async fn chunks_dedup_per_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let mut chunk = SemanticChunk::new("legal", "doc", 0, "Rent is payable quarterly.", vec!["payment".into()]);
        chunk.embedding = Some(vec![1.0, 0.0]);
        assert!(store.upsert_if_absent(&chunk).await.unwrap());
        assert!(!store.upsert_if_absent(&chunk).await.unwrap());
        let mut other = chunk.clone();
        other.collection = "unknown".into();
        assert!(store.upsert_if_absent(&other).await.unwrap());
        assert!(store.contains("legal", &chunk.content_hash).await.unwrap());

        let by_vector = store
            .nearest("legal", &VectorQuery { text: "", embedding: Some(&[1.0, 0.0]), limit: 3 })
            .await
            .unwrap();
        assert_eq!(by_vector.len(), 1);
        assert!((by_vector[0].score - 1.0).abs() < 1e-6);
        let by_terms = store
            .nearest("legal", &VectorQuery { text: "quarterly rent", embedding: None, limit: 3 })
            .await
            .unwrap();
        assert_eq!(by_terms[0].tags, vec!["payment".to_string()]);
    }

    #[tokio::test]
    async fn leads_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let now = Utc::now();
        let mut lead = Lead::new("L-1", now);
        lead.last_contacted_at = Some(now);
        lead.nurture_state = NurtureState::Warm;
        lead.log_contact(now);
        assert!(store.save_lead(&lead).await.unwrap());
        let stored = store.lead("L-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.contact_log, lead.contact_log);
        assert_eq!(Lead { version: 0, ..stored.clone() }, lead);

        let event = NotificationEvent::new("L-1", TriggerReason::Inactivity, now);
        store.record_event(&event).await.unwrap();
        assert!(store.has_pending_event("L-1", TriggerReason::Inactivity).await.unwrap());
        assert!(!store.has_pending_event("L-1", TriggerReason::Cooling).await.unwrap());
        assert_eq!(store.pending_events().await.unwrap(), vec![event.clone()]);
        assert!(store.mark_delivered(&event.event_id).await.unwrap());
        assert!(!store.mark_delivered("missing").await.unwrap());
        assert!(store.pending_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_commits_of_the_same_row_count_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        a.upsert(&txn(1.5e6, "P-9")).await.unwrap();
        b.upsert(&txn(1.5e6, "P-9")).await.unwrap();

        let (first, second) = tokio::join!(a.commit(), b.commit());
        let written = first.unwrap().written.len() + second.unwrap().written.len();
        assert_eq!(written, 1);
        assert_eq!(store.transactions(&TransactionQuery::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_lead_save_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let now = Utc::now();
        assert!(store.save_lead(&Lead::new("L-2", now)).await.unwrap());
        assert!(!store.save_lead(&Lead::new("L-2", now)).await.unwrap());

        let snapshot = store.lead("L-2").await.unwrap().unwrap();
        let mut closed = snapshot.clone();
        closed.nurture_state = NurtureState::Closed;
        assert!(store.save_lead(&closed).await.unwrap());

        let mut stale = snapshot;
        stale.nurture_state = NurtureState::Cold;
        assert!(!store.save_lead(&stale).await.unwrap());
        let stored = store.lead("L-2").await.unwrap().unwrap();
        assert_eq!(stored.nurture_state, NurtureState::Closed);
        assert_eq!(stored.version, 2);
    }
}
