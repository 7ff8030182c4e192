//! Schema creation for the SQLite stores. Every statement is idempotent.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        natural_key TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        price REAL NOT NULL,
        date TEXT NOT NULL,
        parties_json TEXT NOT NULL DEFAULT '[]',
        property_ref TEXT,
        area TEXT,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS market_metrics (
        natural_key TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        area TEXT NOT NULL,
        metric TEXT NOT NULL,
        value REAL NOT NULL,
        unit TEXT,
        period TEXT,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS listings (
        natural_key TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        property_ref TEXT NOT NULL,
        title TEXT NOT NULL,
        price REAL,
        bedrooms INTEGER,
        size_sqft REAL,
        location TEXT,
        description TEXT NOT NULL DEFAULT '',
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clients (
        client_id TEXT PRIMARY KEY,
        profile_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leads (
        lead_id TEXT PRIMARY KEY,
        client_id TEXT,
        nurture_state TEXT NOT NULL,
        score REAL NOT NULL DEFAULT 0,
        last_contacted_at TEXT,
        next_follow_up_at TEXT,
        recent_contacts INTEGER NOT NULL DEFAULT 0,
        engagement_events INTEGER NOT NULL DEFAULT 0,
        contact_log_json TEXT NOT NULL DEFAULT '[]',
        engagement_log_json TEXT NOT NULL DEFAULT '[]',
        qualified_signal_at TEXT,
        created_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        event_id TEXT PRIMARY KEY,
        lead_id TEXT NOT NULL,
        trigger_reason TEXT NOT NULL,
        due_at TEXT NOT NULL,
        delivered INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vector_chunks (
        id TEXT PRIMARY KEY,
        collection TEXT NOT NULL,
        source_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        tags_json TEXT NOT NULL DEFAULT '[]',
        clause_type TEXT,
        content_hash TEXT NOT NULL,
        embedding BLOB,
        created_at TEXT NOT NULL,
        UNIQUE(collection, content_hash)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_property ON transactions(property_ref COLLATE NOCASE)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_metrics_area ON market_metrics(area COLLATE NOCASE)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_pending ON notifications(lead_id, trigger_reason, delivered)",
    "CREATE INDEX IF NOT EXISTS idx_vector_chunks_collection ON vector_chunks(collection)",
];

/// Create every table and index on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}
