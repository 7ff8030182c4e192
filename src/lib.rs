//! # Estate Harness
//!
//! Ingestion, retrieval and lead nurturing for real-estate documents.
//!
//! Documents (PDF, CSV, Excel, text) are normalized, classified, and split
//! into typed records for a relational store and semantic chunks for a
//! vector index. Chat turns are decomposed into intents, answered by one
//! handler per intent, and merged with per-session entity context. A
//! background scheduler scores leads and emits follow-up notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────────┐   ┌─────────────┐
//! │ Documents │──▶│ extract → classify → struct. │──▶│ DualStore   │
//! └───────────┘   └──────────────────────────────┘   │ Writer      │
//!                                                    └──┬───────┬──┘
//!                                                       ▼       ▼
//!                                               ┌──────────┐ ┌────────┐
//!                                               │relational│ │ vector │
//!                                               └────┬─────┘ └───┬────┘
//!                      ┌─────────────────────────────┤           │
//!                      ▼                             ▼           ▼
//!              ┌───────────────┐            ┌──────────────────────┐
//!              │ NurtureSched. │            │ QueryRouter+Context  │
//!              └───────────────┘            └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and component settings |
//! | [`extract`] | Format adapters: PDF, CSV, XLSX, text |
//! | [`classify`] | LLM classifier with keyword-rule fallback |
//! | [`structured`] | Records and chunks per document category |
//! | [`writer`] | Relational + vector write as one retried unit |
//! | [`ingest`] | The per-document pipeline |
//! | [`intent`] | Multi-intent detection |
//! | [`handlers`] | One handler per intent |
//! | [`router`] | Concurrent dispatch and response merge |
//! | [`context`] | Per-session entity cache |
//! | [`nurture`] | Lead scoring, state machine and scheduler |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`server`] | HTTP API |

pub mod classify;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod harness;
pub mod ingest;
pub mod intent;
pub mod llm;
pub mod migrate;
pub mod nurture;
pub mod retry;
pub mod router;
pub mod server;
pub mod sqlite_store;
pub mod structured;
pub mod writer;
