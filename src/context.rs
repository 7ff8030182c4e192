//! Per-session entity context.
//!
//! Each [`Session`] owns a cache of [`CachedEntity`] values keyed by
//! [`EntityRef`]. `resolve` answers a whole batch of references with at most
//! one [`RelationalStore::fetch_entities`] call: fresh cache entries are hits,
//! everything missing or stale is fetched together.
//!
//! Freshness is `now - fetched_at < ttl` with a TTL per entity type
//! ([`TtlPolicy`]); market data expires first. Entities the store does not
//! know are not cached.
//!
//! Sessions live in a [`DashMap`], so turns of different sessions never
//! contend on one lock. Idle sessions are dropped lazily when touched and by
//! [`ContextManager::sweep_idle`], which the server runs periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use estate_harness_core::models::{CachedEntity, EntityRef, EntityType, Session};
use estate_harness_core::store::RelationalStore;

use crate::config::TtlPolicy;

pub struct ContextManager {
    sessions: DashMap<String, Session>,
    store: Arc<dyn RelationalStore>,
    ttl: TtlPolicy,
}

impl ContextManager {
    pub fn new(store: Arc<dyn RelationalStore>, ttl: TtlPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            ttl,
        }
    }

    fn ttl_for(&self, entity_type: EntityType) -> Duration {
        match entity_type {
            EntityType::Property => self.ttl.property,
            EntityType::Client => self.ttl.client,
            EntityType::MarketArea => self.ttl.market_area,
        }
    }

    fn idle_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl.session_idle)
            .unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    fn is_idle(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now - session.last_active_at >= self.idle_window()
    }

    pub async fn resolve(
        &self,
        session_id: &str,
        refs: &[EntityRef],
    ) -> Result<HashMap<EntityRef, CachedEntity>> {
        self.resolve_at(session_id, refs, Utc::now()).await
    }

    /// [`resolve`](Self::resolve) with an explicit clock.
    pub async fn resolve_at(
        &self,
        session_id: &str,
        refs: &[EntityRef],
        now: DateTime<Utc>,
    ) -> Result<HashMap<EntityRef, CachedEntity>> {
        let mut resolved = HashMap::new();
        let mut misses: Vec<EntityRef> = Vec::new();

        // The map guard must be released before awaiting the store.
        {
            if self.sessions.remove_if(session_id, |_, s| self.is_idle(s, now)).is_some() {
                debug!(session_id, "evicted idle session");
            }
            let mut session = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Session::new(session_id, now));
            session.last_active_at = now;

            for r in refs {
                if resolved.contains_key(r) || misses.contains(r) {
                    continue;
                }
                match session.entity_cache.get(r) {
                    Some(cached) if cached.is_fresh(now) => {
                        resolved.insert(r.clone(), cached.clone());
                    }
                    _ => misses.push(r.clone()),
                }
            }
        }

        if misses.is_empty() {
            return Ok(resolved);
        }

        let fetched = self.store.fetch_entities(&misses).await?;
        debug!(
            session_id,
            requested = misses.len(),
            found = fetched.len(),
            "fetched entity context"
        );

        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, now));
        for r in misses {
            let Some(payload) = fetched.get(&r) else {
                session.entity_cache.remove(&r);
                continue;
            };
            let entity = CachedEntity {
                entity_type: r.entity_type,
                entity_id: r.entity_id.clone(),
                payload: payload.clone(),
                fetched_at: now,
                ttl: self.ttl_for(r.entity_type),
            };
            session.entity_cache.insert(r.clone(), entity.clone());
            resolved.insert(r, entity);
        }
        Ok(resolved)
    }

    /// Drop one cached entity. Returns whether it was cached.
    pub fn invalidate(&self, session_id: &str, entity_ref: &EntityRef) -> bool {
        self.sessions
            .get_mut(session_id)
            .map(|mut s| s.entity_cache.remove(entity_ref).is_some())
            .unwrap_or(false)
    }

    /// Drop an entity from every session. Returns the number of sessions affected.
    pub fn invalidate_everywhere(&self, entity_ref: &EntityRef) -> usize {
        self.sessions
            .iter_mut()
            .filter_map(|mut s| s.entity_cache.remove(entity_ref))
            .count()
    }

    /// Remove sessions idle past the configured window.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !self.is_idle(s, now));
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            info!(evicted, remaining = self.sessions.len(), "swept idle sessions");
        }
        evicted
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Entity refs currently cached for a session, sorted.
    pub fn cached_refs(&self, session_id: &str) -> Vec<EntityRef> {
        let mut refs: Vec<EntityRef> = self
            .sessions
            .get(session_id)
            .map(|s| s.entity_cache.keys().cloned().collect())
            .unwrap_or_default();
        refs.sort();
        refs
    }
}

/// Run [`ContextManager::sweep_idle`] every `every` until the task is aborted.
pub fn spawn_sweeper(manager: Arc<ContextManager>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            manager.sweep_idle(Utc::now());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use estate_harness_core::models::{ExtractedRecord, MarketMetric, TransactionRecord};
    use estate_harness_core::store::memory::InMemoryStore;

    fn ttl() -> TtlPolicy {
        TtlPolicy {
            property: Duration::from_secs(3600),
            client: Duration::from_secs(1800),
            market_area: Duration::from_secs(300),
            session_idle: Duration::from_secs(1800),
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&ExtractedRecord::Transaction(TransactionRecord {
            price: 2_000_000.0,
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            parties: vec![],
            property_ref: Some("P-1".into()),
            area: Some("Dubai Marina".into()),
        }))
        .await
        .unwrap();
        tx.upsert(&ExtractedRecord::MarketMetric(MarketMetric {
            area: "Dubai Marina".into(),
            metric: "rental_yield".into(),
            value: 6.5,
            unit: Some("percent".into()),
            period: Some("Q1 2024".into()),
        }))
        .await
        .unwrap();
        tx.commit().await.unwrap();
        store
    }

    fn manager(store: &InMemoryStore) -> ContextManager {
        ContextManager::new(Arc::new(store.clone()), ttl())
    }

    #[tokio::test]
    async fn second_resolve_within_ttl_is_a_cache_hit() {
        let store = seeded().await;
        let ctx = manager(&store);
        let t0 = Utc::now();
        let refs = [EntityRef::property("P-1")];

        let first = ctx.resolve_at("s1", &refs, t0).await.unwrap();
        assert_eq!(first.len(), 1);
        ctx.resolve_at("s1", &refs, t0 + chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(store.entity_fetch_count(), 1);

        ctx.resolve_at("s1", &refs, t0 + chrono::Duration::minutes(61)).await.unwrap();
        assert_eq!(store.entity_fetch_count(), 2);
    }

    #[tokio::test]
    async fn market_data_expires_before_property_data() {
        let store = seeded().await;
        let ctx = manager(&store);
        let t0 = Utc::now();
        let refs = [EntityRef::property("P-1"), EntityRef::market_area("Dubai Marina")];
        ctx.resolve_at("s1", &refs, t0).await.unwrap();
        assert_eq!(store.entity_fetch_count(), 1);

        // Six minutes later only the market area is stale; one batched refetch.
        let again = ctx
            .resolve_at("s1", &refs, t0 + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(store.entity_fetch_count(), 2);
        assert_eq!(again[&refs[1]].fetched_at, t0 + chrono::Duration::minutes(6));
        assert_eq!(again[&refs[0]].fetched_at, t0);
    }

    #[tokio::test]
    async fn many_refs_one_fetch() {
        let store = seeded().await;
        let ctx = manager(&store);
        let refs = [
            EntityRef::property("P-1"),
            EntityRef::property("p-1"),
            EntityRef::market_area("dubai marina"),
            EntityRef::client("C-404"),
        ];
        let resolved = ctx.resolve("s1", &refs).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(store.entity_fetch_count(), 1);
    }

    #[tokio::test]
    async fn sessions_do_not_share_caches() {
        let store = seeded().await;
        let ctx = manager(&store);
        let refs = [EntityRef::property("P-1")];
        ctx.resolve("a", &refs).await.unwrap();
        ctx.resolve("b", &refs).await.unwrap();
        assert_eq!(store.entity_fetch_count(), 2);
        assert_eq!(ctx.session_count(), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_refetch() {
        let store = seeded().await;
        let ctx = manager(&store);
        let p = EntityRef::property("P-1");
        ctx.resolve("a", std::slice::from_ref(&p)).await.unwrap();
        ctx.resolve("b", std::slice::from_ref(&p)).await.unwrap();

        assert!(ctx.invalidate("a", &p));
        assert!(!ctx.invalidate("a", &p));
        assert!(!ctx.invalidate("missing", &p));
        ctx.resolve("a", std::slice::from_ref(&p)).await.unwrap();
        assert_eq!(store.entity_fetch_count(), 3);

        assert_eq!(ctx.invalidate_everywhere(&p), 2);
        assert!(ctx.cached_refs("b").is_empty());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let store = seeded().await;
        let ctx = manager(&store);
        let t0 = Utc::now();
        let refs = [EntityRef::property("P-1")];
        ctx.resolve_at("old", &refs, t0).await.unwrap();
        ctx.resolve_at("new", &refs, t0 + chrono::Duration::minutes(20)).await.unwrap();

        assert_eq!(ctx.sweep_idle(t0 + chrono::Duration::minutes(31)), 1);
        assert_eq!(ctx.session_count(), 1);

        // Lazy eviction: touching a stale session starts it fresh.
        ctx.resolve_at("new", &refs, t0 + chrono::Duration::minutes(55)).await.unwrap();
        assert_eq!(store.entity_fetch_count(), 3);
    }
}
