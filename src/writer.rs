//! Dual-store writer.
//!
//! One document's relational records and semantic chunks are written as a
//! unit:
//!
//! 1. embed chunks (optional; failure only drops the vectors)
//! 2. begin a relational transaction and stage every relational record
//! 3. `upsert_if_absent` every chunk into its collection
//! 4. commit, or roll back if any chunk write failed
//!
//! Relational rows count as written only if the commit changed them, so two
//! concurrent ingests of the same document report each row once.
//!
//! The unit is retried with the configured [`RetryPolicy`]. Both stores are
//! keyed idempotently (natural key, and collection plus content hash), so a
//! retry after a partial vector write cannot duplicate anything. When every
//! attempt fails the caller gets [`IngestError::IngestFailed`] and no
//! relational rows from the document are committed.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use estate_harness_core::models::{ExtractedRecord, SemanticChunk, StoreKind, StoredArtifact};
use estate_harness_core::store::{RelationalStore, VectorStore};

use crate::embedding::Embedder;
use crate::error::IngestError;
use crate::retry::RetryPolicy;

/// What one successful write unit changed.
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub records_written: usize,
    pub chunks_written: usize,
    pub artifacts: Vec<StoredArtifact>,
}

pub struct DualStoreWriter {
    relational: Arc<dyn RelationalStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
}

impl DualStoreWriter {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            relational,
            vectors,
            embedder,
            retry,
        }
    }

    pub async fn write(
        &self,
        records: &[ExtractedRecord],
        chunks: &[SemanticChunk],
    ) -> Result<WriteResult, IngestError> {
        let chunks = self.embed(chunks).await;
        let chunks = &chunks;
        self.retry
            .run("dual_store.write", |_: &anyhow::Error| true, move |attempt| async move {
                debug!(attempt, records = records.len(), chunks = chunks.len(), "writing document");
                self.write_once(records, chunks).await
            })
            .await
            .map_err(|e| IngestError::IngestFailed {
                attempts: e.attempts,
                message: format!("{:#}", e.last),
            })
    }

    /// Attach embeddings when a provider is configured. Never fails.
    async fn embed(&self, chunks: &[SemanticChunk]) -> Vec<SemanticChunk> {
        let mut chunks = chunks.to_vec();
        if chunks.is_empty() || !self.embedder.is_enabled() {
            return chunks;
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        match self.embedder.embed(&texts).await {
            Ok(vectors) => {
                for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                    chunk.embedding = Some(vector);
                }
            }
            Err(e) => {
                warn!(
                    model = self.embedder.model_name(),
                    error = %e,
                    "embedding failed, storing chunks without vectors"
                );
            }
        }
        chunks
    }

    async fn write_once(&self, records: &[ExtractedRecord], chunks: &[SemanticChunk]) -> Result<WriteResult> {
        let mut result = WriteResult::default();
        let mut tx = self.relational.begin().await.context("begin relational transaction")?;

        let relational: Vec<&ExtractedRecord> = records.iter().filter(|r| r.is_relational()).collect();
        for record in &relational {
            if let Err(e) = tx.upsert(record).await {
                rollback(tx).await;
                return Err(e.context(format!("upsert {}", record.natural_key())));
            }
        }

        for chunk in chunks {
            match self.vectors.upsert_if_absent(chunk).await {
                Ok(true) => {
                    result.chunks_written += 1;
                    result.artifacts.push(StoredArtifact {
                        store: StoreKind::Vector,
                        natural_key: format!("chunk:{}:{}", chunk.collection, chunk.content_hash),
                        content_hash: chunk.content_hash.clone(),
                        written_at: Utc::now(),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    rollback(tx).await;
                    return Err(e.context(format!("write chunk to '{}'", chunk.collection)));
                }
            }
        }

        let summary = tx.commit().await.context("commit relational transaction")?;
        let by_key: HashMap<String, &ExtractedRecord> =
            relational.iter().map(|r| (r.natural_key(), *r)).collect();
        for key in summary.written {
            let Some(record) = by_key.get(&key) else {
                continue;
            };
            result.records_written += 1;
            result.artifacts.push(StoredArtifact {
                store: StoreKind::Relational,
                natural_key: key,
                content_hash: record.content_hash(),
                written_at: Utc::now(),
            });
        }
        debug!(written = result.records_written, unchanged = summary.unchanged, "relational commit");
        Ok(result)
    }
}

async fn rollback(tx: Box<dyn estate_harness_core::store::RecordTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use estate_harness_core::models::{ClauseType, LegalChunk, TransactionRecord};
    use estate_harness_core::store::memory::InMemoryStore;
    use estate_harness_core::store::{ChunkHit, VectorQuery};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::embedding::DisabledEmbedder;

    /// Vector store that fails the first `failures` writes.
    struct FlakyVectors {
        inner: InMemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for FlakyVectors {
        async fn upsert_if_absent(&self, chunk: &SemanticChunk) -> Result<bool> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("vector store unavailable");
            }
            self.inner.upsert_if_absent(chunk).await
        }

        async fn contains(&self, collection: &str, content_hash: &str) -> Result<bool> {
            self.inner.contains(collection, content_hash).await
        }

        async fn nearest(&self, collection: &str, query: &VectorQuery<'_>) -> Result<Vec<ChunkHit>> {
            self.inner.nearest(collection, query).await
        }
    }

    fn txn(price: f64) -> ExtractedRecord {
        ExtractedRecord::Transaction(TransactionRecord {
            price,
            date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            parties: vec!["Alice".into(), "Bob".into()],
            property_ref: Some("P-1".into()),
            area: Some("Dubai Marina".into()),
        })
    }

    fn legal_chunk() -> (ExtractedRecord, SemanticChunk) {
        let legal = LegalChunk::new("The tenant shall pay rent.", ClauseType::Payment, vec![]).unwrap();
        let chunk = SemanticChunk::from_legal("src", 0, &legal);
        (ExtractedRecord::Legal(legal), chunk)
    }

    fn writer(store: &InMemoryStore, vectors: Arc<dyn VectorStore>, attempts: u32) -> DualStoreWriter {
        DualStoreWriter::new(
            Arc::new(store.clone()),
            vectors,
            Arc::new(DisabledEmbedder),
            RetryPolicy::immediate(attempts),
        )
    }

    #[tokio::test]
    async fn writes_are_idempotent() {
        let store = InMemoryStore::default();
        let w = writer(&store, Arc::new(store.clone()), 3);
        let (legal, chunk) = legal_chunk();
        let records = vec![txn(950_000.0), legal];

        let first = w.write(&records, std::slice::from_ref(&chunk)).await.unwrap();
        assert_eq!(first.records_written, 1);
        assert_eq!(first.chunks_written, 1);
        assert_eq!(first.artifacts.len(), 2);

        let second = w.write(&records, &[chunk]).await.unwrap();
        assert_eq!(second.records_written, 0);
        assert_eq!(second.chunks_written, 0);
        assert!(second.artifacts.is_empty());
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.chunk_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_writes_of_one_document_count_rows_once() {
        let store = InMemoryStore::default();
        let w = writer(&store, Arc::new(store.clone()), 3);
        let records = vec![txn(1_250_000.0)];

        let (a, b) = tokio::join!(w.write(&records, &[]), w.write(&records, &[]));
        let total = a.unwrap().records_written + b.unwrap().records_written;
        assert_eq!(total, 1);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn transient_vector_failure_is_retried() {
        let store = InMemoryStore::default();
        let flaky = Arc::new(FlakyVectors {
            inner: store.clone(),
            failures: AtomicUsize::new(1),
        });
        let w = writer(&store, flaky, 3);
        let (_, chunk) = legal_chunk();
        let result = w.write(&[txn(1.0)], &[chunk]).await.unwrap();
        assert_eq!(result.records_written, 1);
        assert_eq!(result.chunks_written, 1);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_no_relational_rows() {
        let store = InMemoryStore::default();
        let flaky = Arc::new(FlakyVectors {
            inner: store.clone(),
            failures: AtomicUsize::new(10),
        });
        let w = writer(&store, flaky, 2);
        let (_, chunk) = legal_chunk();
        let err = w.write(&[txn(1.0)], &[chunk]).await.unwrap_err();
        match err {
            IngestError::IngestFailed { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("vector store unavailable"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.chunk_count(), 0);
    }
}
