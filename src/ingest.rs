//! Ingestion pipeline orchestration.
//!
//! Coordinates one document through the full flow:
//! extractor adapter → classifier → structured extractor → dual-store writer.
//! Stages within a document are strictly sequential; independent documents
//! run concurrently through [`IngestPipeline::ingest_many`].
//!
//! Partial success is the norm: validation failures and degraded
//! classification are reported as warnings on the [`IngestResult`], while
//! adapter errors and exhausted store retries fail the document.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use estate_harness_core::models::{Category, ClassificationResult, DocumentFormat, StoredArtifact};
use estate_harness_core::store::{RelationalStore, VectorStore};

use crate::classify::DocumentClassifier;
use crate::config::PipelineSettings;
use crate::embedding::Embedder;
use crate::error::IngestError;
use crate::extract::normalize;
use crate::llm::LlmClient;
use crate::structured::StructuredExtractor;
use crate::writer::DualStoreWriter;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub source_id: String,
    pub records_written: usize,
    pub chunks_written: usize,
    pub category: Category,
    pub classification: ClassificationResult,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub artifacts: Vec<StoredArtifact>,
}

/// A document queued for [`IngestPipeline::ingest_many`].
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub bytes: Vec<u8>,
    pub format_hint: String,
}

pub struct IngestPipeline {
    settings: PipelineSettings,
    classifier: DocumentClassifier,
    extractor: StructuredExtractor,
    writer: DualStoreWriter,
}

impl IngestPipeline {
    pub fn new(
        settings: PipelineSettings,
        llm: Arc<dyn LlmClient>,
        relational: Arc<dyn RelationalStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            classifier: DocumentClassifier::new(llm, settings.classifier.clone()),
            extractor: StructuredExtractor::new(settings.chunk_bounds),
            writer: DualStoreWriter::new(relational, vectors, embedder, settings.write_retry.clone()),
            settings,
        }
    }

    /// Ingest one document declared as `format_hint` (`pdf`, `csv`,
    /// `excel`/`xlsx`, `text`, or the matching MIME type).
    pub async fn ingest(&self, bytes: &[u8], format_hint: &str) -> Result<IngestResult, IngestError> {
        let format = DocumentFormat::parse(format_hint)
            .ok_or_else(|| IngestError::UnsupportedFormat(format_hint.to_string()))?;

        let doc = normalize(bytes, format, self.settings.max_document_bytes)?;
        let source_id = doc.source_id.clone();

        let classification = self.classifier.classify(&doc.raw_text).await;
        let category = classification.result.category;
        let mut warnings = classification.warnings;

        let extraction = self.extractor.extract(&doc, category);
        for failure in &extraction.failures {
            warn!(source_id = %source_id, location = %failure.location, reason = %failure.reason, "record dropped");
            warnings.push(failure.to_string());
        }

        let written = self.writer.write(&extraction.records, &extraction.chunks).await?;

        info!(
            source_id = %source_id,
            format = %format,
            category = category.as_str(),
            method = ?classification.result.method,
            records = written.records_written,
            chunks = written.chunks_written,
            warnings = warnings.len(),
            "ingested document"
        );

        Ok(IngestResult {
            source_id,
            records_written: written.records_written,
            chunks_written: written.chunks_written,
            category,
            classification: classification.result,
            warnings,
            artifacts: written.artifacts,
        })
    }

    /// Ingest independent documents concurrently. Results keep input order.
    pub async fn ingest_many(&self, requests: Vec<IngestRequest>) -> Vec<Result<IngestResult, IngestError>> {
        stream::iter(requests)
            .map(|req| async move { self.ingest(&req.bytes, &req.format_hint).await })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_harness_core::store::memory::InMemoryStore;

    use crate::embedding::DisabledEmbedder;
    use crate::llm::{DisabledLlm, MockLlmClient};

    fn pipeline_with(store: &InMemoryStore, llm: Arc<dyn LlmClient>) -> IngestPipeline {
        let mut settings = PipelineSettings::default();
        settings.write_retry = crate::retry::RetryPolicy::immediate(3);
        IngestPipeline::new(
            settings,
            llm,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(DisabledEmbedder),
        )
    }

    #[tokio::test]
    async fn unsupported_format_is_rejected() {
        let store = InMemoryStore::default();
        let err = pipeline_with(&store, Arc::new(DisabledLlm))
            .ingest(b"hello", "docx")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(ref f) if f == "docx"));
        assert_eq!(err.code(), "unsupported_format");
    }

    #[tokio::test]
    async fn empty_document_is_an_extraction_error() {
        let store = InMemoryStore::default();
        let err = pipeline_with(&store, Arc::new(DisabledLlm))
            .ingest(b"", "text")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Extraction(_)));
    }

    #[tokio::test]
    async fn csv_with_invalid_row_reports_partial_success() {
        let store = InMemoryStore::default();
        let csv = "price,date,buyer,seller,property\n\
                   950000,2024-01-15,Alice,Bob,P-1\n\
                   ,2024-02-01,Carol,Dan,P-2\n\
                   1200000,2024-03-15,Eve,Frank,P-3\n";
        let result = pipeline_with(&store, Arc::new(DisabledLlm))
            .ingest(csv.as_bytes(), "csv")
            .await
            .unwrap();
        assert_eq!(result.category, Category::Transaction);
        assert_eq!(result.records_written, 2);
        assert_eq!(result.chunks_written, 0);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("validation_failed"));
    }

    #[tokio::test]
    async fn disagreeing_low_confidence_ai_prefers_rules() {
        let store = InMemoryStore::default();
        let llm = Arc::new(MockLlmClient::replying(r#"{"category":"brochure","confidence":0.3}"#));
        let text = "This lease agreement is governed by the laws of Dubai. The tenant shall pay rent. \
                    Either party may terminate this agreement by notice.";
        let result = pipeline_with(&store, llm).ingest(text.as_bytes(), "text").await.unwrap();
        assert_eq!(result.category, Category::Legal);
        assert!(result.warnings.iter().any(|w| w == "low_confidence_classification"));
        assert!(result.chunks_written >= 1);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let store = InMemoryStore::default();
        let pipeline = pipeline_with(&store, Arc::new(DisabledLlm));
        let results = pipeline
            .ingest_many(vec![
                IngestRequest {
                    bytes: b"Some general notes about the office move.".to_vec(),
                    format_hint: "text".into(),
                },
                IngestRequest {
                    bytes: b"x".to_vec(),
                    format_hint: "doc".into(),
                },
            ])
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().category, Category::Unknown);
        assert!(results[1].is_err());
    }
}
