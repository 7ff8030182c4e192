//! Wiring: builds every component from a [`Config`].
//!
//! The CLI and the HTTP server both go through [`Harness`], so the pipeline,
//! router, context manager and scheduler always share the same stores.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use estate_harness_core::store::memory::InMemoryStore;
use estate_harness_core::store::{LeadStore, RelationalStore, VectorStore};

use crate::config::{Config, NurtureRules, PipelineSettings, RouterSettings, TtlPolicy};
use crate::context::ContextManager;
use crate::embedding::{create_embedder, Embedder};
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::ingest::IngestPipeline;
use crate::intent::KeywordIntentDetector;
use crate::llm::{create_llm_client, LlmClient};
use crate::nurture::{LogDispatch, NotificationDispatch, NurtureScheduler};
use crate::router::QueryRouter;
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

/// The three store seams, usually backed by one implementation.
#[derive(Clone)]
pub struct Stores {
    pub relational: Arc<dyn RelationalStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub leads: Arc<dyn LeadStore>,
}

impl Stores {
    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            relational: store.clone(),
            vectors: store.clone(),
            leads: store,
        }
    }

    pub fn memory(store: InMemoryStore) -> Self {
        Self {
            relational: Arc::new(store.clone()),
            vectors: Arc::new(store.clone()),
            leads: Arc::new(store),
        }
    }
}

pub struct Harness {
    pub config: Arc<Config>,
    pub stores: Stores,
    pub pipeline: IngestPipeline,
    pub router: QueryRouter,
    pub context: Arc<ContextManager>,
    pub scheduler: Arc<NurtureScheduler>,
}

impl Harness {
    /// Open the configured SQLite database (migrating it) and build every
    /// component with the configured LLM and embedding providers.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let llm = create_llm_client(&config.llm)?;
        let embedder = create_embedder(&config.embedding, config.ingest.retry.policy())?;
        info!(
            db = %config.db.path.display(),
            llm = llm.name(),
            embedder = embedder.model_name(),
            "harness ready"
        );
        Ok(Self::assemble(
            config,
            Stores::sqlite(SqliteStore::new(pool)),
            llm,
            embedder,
            Arc::new(LogDispatch),
        ))
    }

    pub fn assemble(
        config: &Config,
        stores: Stores,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn Embedder>,
        dispatch: Arc<dyn NotificationDispatch>,
    ) -> Self {
        let pipeline = IngestPipeline::new(
            PipelineSettings::from(config),
            llm,
            stores.relational.clone(),
            stores.vectors.clone(),
            embedder.clone(),
        );

        let router_settings = RouterSettings::from(&config.router);
        let context = Arc::new(ContextManager::new(
            stores.relational.clone(),
            TtlPolicy::from(&config.context),
        ));
        let router = QueryRouter::new(
            Arc::new(KeywordIntentDetector::new()),
            HandlerRegistry::with_builtins(),
            context.clone(),
            HandlerContext {
                relational: stores.relational.clone(),
                vectors: stores.vectors.clone(),
                embedder,
                top_k: router_settings.top_k,
            },
            router_settings,
        );

        let scheduler = Arc::new(NurtureScheduler::new(
            stores.leads.clone(),
            dispatch,
            NurtureRules::from(&config.nurture),
        ));

        Self {
            config: Arc::new(config.clone()),
            stores,
            pipeline,
            router,
            context,
            scheduler,
        }
    }
}
