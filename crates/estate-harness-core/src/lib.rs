//! # Estate Harness Core
//!
//! Runtime-free logic shared by the ingestion pipeline, the query router and
//! the nurture scheduler: the data model, clause-aware chunking, content
//! fingerprints, vector helpers and the storage traits with an in-memory
//! backend.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem I/O.

pub mod chunk;
pub mod embedding;
pub mod hash;
pub mod models;
pub mod store;
