//! Multi-intent query router.
//!
//! One chat turn:
//!
//! 1. detect intents, drop those under `min_intent_confidence`
//!    (none left → a single `free_form` intent)
//! 2. run every intent's handler on its own task, each bounded by
//!    `handler_timeout`; errors, panics and timeouts become degraded
//!    sections
//! 3. keep sections in detection order
//! 4. deduplicate entity mentions across sections and resolve them through
//!    the session's [`ContextManager`] in one batch
//!
//! `route` never fails: a turn always produces a response.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use estate_harness_core::models::{CachedEntity, EntityRef, Intent};

use crate::config::RouterSettings;
use crate::context::ContextManager;
use crate::error::HandlerError;
use crate::handlers::{HandlerContext, HandlerRegistry, Section};
use crate::intent::{self, IntentDetector};

/// An entity referenced by one or more sections of a response.
#[derive(Debug, Clone, Serialize)]
pub struct EntityMention {
    pub entity: EntityRef,
    /// Indexes into [`MergedResponse::sections`], ascending.
    pub sections: Vec<usize>,
    /// Session-cached context, absent when the stores know nothing about it.
    pub context: Option<CachedEntity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedResponse {
    pub session_id: String,
    pub intents: Vec<Intent>,
    pub sections: Vec<Section>,
    pub entities: Vec<EntityMention>,
}

impl MergedResponse {
    pub fn degraded_count(&self) -> usize {
        self.sections.iter().filter(|s| s.degraded).count()
    }
}

pub struct QueryRouter {
    detector: Arc<dyn IntentDetector>,
    registry: HandlerRegistry,
    context: Arc<ContextManager>,
    handler_ctx: HandlerContext,
    settings: RouterSettings,
}

impl QueryRouter {
    pub fn new(
        detector: Arc<dyn IntentDetector>,
        registry: HandlerRegistry,
        context: Arc<ContextManager>,
        handler_ctx: HandlerContext,
        settings: RouterSettings,
    ) -> Self {
        Self {
            detector,
            registry,
            context,
            handler_ctx,
            settings,
        }
    }

    /// Intents for `utterance` after thresholding, or the free-form fallback.
    pub fn intents_for(&self, utterance: &str) -> Vec<Intent> {
        let intents: Vec<Intent> = self
            .detector
            .detect(utterance)
            .into_iter()
            .filter(|i| i.confidence >= self.settings.min_intent_confidence)
            .collect();
        if intents.is_empty() {
            vec![intent::free_form(utterance)]
        } else {
            intents
        }
    }

    pub async fn route(&self, utterance: &str, session_id: &str) -> MergedResponse {
        let intents = self.intents_for(utterance);
        let sections = join_all(intents.iter().map(|i| self.dispatch(i))).await;
        let entities = self.merge_entities(session_id, &sections).await;

        let response = MergedResponse {
            session_id: session_id.to_string(),
            intents,
            sections,
            entities,
        };
        info!(
            session_id,
            intents = response.intents.len(),
            degraded = response.degraded_count(),
            entities = response.entities.len(),
            "routed chat turn"
        );
        response
    }

    async fn dispatch(&self, intent: &Intent) -> Section {
        let Some(handler) = self.registry.find(&intent.label) else {
            let err = HandlerError::NotRegistered(intent.label.clone());
            warn!(intent = %intent.label, "no handler registered");
            return Section::degraded(&intent.label, "none", &err);
        };
        let name = handler.name().to_string();
        let timeout = self.settings.handler_timeout;

        let task = {
            let intent = intent.clone();
            let ctx = self.handler_ctx.clone();
            tokio::spawn(async move { handler.handle(&intent, &ctx).await })
        };
        let abort = task.abort_handle();

        let message = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(output))) => return Section::from_output(&intent.label, &name, output),
            Ok(Ok(Err(e))) => {
                warn!(handler = %name, error = %e, "handler failed");
                format!("{:#}", e)
            }
            Ok(Err(join_err)) => {
                warn!(handler = %name, error = %join_err, "handler panicked");
                "handler panicked".to_string()
            }
            Err(_) => {
                abort.abort();
                warn!(handler = %name, ?timeout, "handler timed out");
                let err = HandlerError::Timeout {
                    handler: name.clone(),
                    timeout,
                };
                return Section::degraded(&intent.label, &name, &err);
            }
        };
        let err = HandlerError::Failed {
            handler: name.clone(),
            message,
        };
        Section::degraded(&intent.label, &name, &err)
    }

    /// First mention wins the position; later mentions add section indexes.
    async fn merge_entities(&self, session_id: &str, sections: &[Section]) -> Vec<EntityMention> {
        let mut mentions: Vec<EntityMention> = Vec::new();
        for (idx, section) in sections.iter().enumerate() {
            for entity in &section.entities {
                match mentions.iter_mut().find(|m| &m.entity == entity) {
                    Some(m) => {
                        if m.sections.last() != Some(&idx) {
                            m.sections.push(idx);
                        }
                    }
                    None => mentions.push(EntityMention {
                        entity: entity.clone(),
                        sections: vec![idx],
                        context: None,
                    }),
                }
            }
        }

        let refs: Vec<EntityRef> = mentions.iter().map(|m| m.entity.clone()).collect();
        match self.context.resolve(session_id, &refs).await {
            Ok(mut resolved) => {
                for m in &mut mentions {
                    m.context = resolved.remove(&m.entity);
                }
            }
            Err(e) => warn!(session_id, error = %e, "entity resolution failed"),
        }
        mentions
    }
}
