//! TTL cache and the caching [`ShopStore`] decorator.
//!
//! [`TtlCache`] maps namespaced string keys to values with an absolute
//! expiry. Expired entries are evicted lazily on read and by a background
//! sweep task owned by the cache; dropping the cache aborts the sweep.
//!
//! [`CachedStore`] wraps any backend. Read queries are keyed by a prefix
//! plus their canonical text:
//!
//! | Prefix | Query |
//! |--------|-------|
//! | `<G>` | `nearest_shops` |
//! | `<S>` | `shops_with_keyword` |
//! | `<A>` | `adv_query` |
//! | `<D>` | keyword search with distances, see [`CachedStore::keyword_near`] |
//! | `<U>` | admin session state, see [`crate::session`] |
//!
//! Writes pass through to the backend and then flush every query entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use shopfinder_core::keyword::KeywordQuery;
use shopfinder_core::models::{Coord, Shop, ShopStatus};
use shopfinder_core::proximity;
use shopfinder_core::query::AdvQuery;
use shopfinder_core::store::{ShopStore, TagMaintenance};
use shopfinder_core::{StoreError, StoreResult};

use crate::config::CacheConfig;

pub const GEO_PREFIX: &str = "<G>";
pub const KEYWORD_PREFIX: &str = "<S>";
pub const ADV_PREFIX: &str = "<A>";
pub const DISTANCE_PREFIX: &str = "<D>";
pub const SESSION_PREFIX: &str = "<U>";

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type Entries<V> = RwLock<HashMap<String, Entry<V>>>;

/// A thread-safe map whose entries expire after a TTL.
pub struct TtlCache<V> {
    entries: Arc<Entries<V>>,
    ttl: Duration,
    sweeper: Option<JoinHandle<()>>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// A cache without a sweep task. Expired entries go on the next read.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            sweeper: None,
        }
    }

    /// A cache that also purges expired entries every `sweep_interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_sweeper(ttl: Duration, sweep_interval: Duration) -> Self {
        let mut cache = Self::new(ttl);
        let entries = Arc::downgrade(&cache.entries);
        cache.sweeper = Some(tokio::spawn(sweep(entries, sweep_interval)));
        cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Owned copy of a live entry.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(e) if e.expires_at > now => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: re-check under the write lock in case it was refreshed.
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.into(), entry);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.write().remove(key).map(|e| e.value)
    }

    /// Drop every entry.
    pub fn flush(&self) {
        self.entries.write().clear();
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries)
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Drop for TtlCache<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

fn purge<V>(entries: &Entries<V>) -> usize {
    let now = Instant::now();
    let mut map = entries.write();
    let before = map.len();
    map.retain(|_, e| e.expires_at > now);
    before - map.len()
}

async fn sweep<V>(entries: Weak<Entries<V>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            break;
        };
        let purged = purge(&entries);
        if purged > 0 {
            debug!(purged, "cache sweep");
        }
    }
}

/// Read-through cache in front of a [`ShopStore`].
pub struct CachedStore {
    inner: Arc<dyn ShopStore>,
    results: TtlCache<Vec<Shop>>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn ShopStore>, results: TtlCache<Vec<Shop>>) -> Self {
        Self { inner, results }
    }

    /// Build from config, with a sweep task. Needs a tokio runtime.
    pub fn from_config(inner: Arc<dyn ShopStore>, config: &CacheConfig) -> Self {
        Self::new(
            inner,
            TtlCache::with_sweeper(config.ttl(), config.sweep_interval()),
        )
    }

    /// The wrapped backend, bypassing the cache.
    pub fn inner(&self) -> &Arc<dyn ShopStore> {
        &self.inner
    }

    /// Forget every cached query result.
    pub fn flush(&self) {
        debug!("flushing query cache");
        self.results.flush();
    }

    async fn cached<F, Fut>(&self, key: String, load: F) -> StoreResult<Vec<Shop>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = StoreResult<Vec<Shop>>>,
    {
        if let Some(hit) = self.results.get(&key) {
            debug!(key = %key, "cache hit");
            return Ok(hit);
        }
        let shops = load().await?;
        self.results.insert(key, shops.clone());
        Ok(shops)
    }

    /// Keyword results annotated with distance from a point, nearest first.
    ///
    /// Shops without a physical location sort last.
    pub async fn keyword_near(&self, text: &str, lat: f64, lon: f64) -> StoreResult<Vec<Shop>> {
        let origin = Coord::new(lat, lon);
        if !origin.is_valid() {
            return Err(StoreError::validation(format!("invalid point ({lat}, {lon})")));
        }
        let query = KeywordQuery::parse(text)?;
        let key = format!("{DISTANCE_PREFIX}{}@{lat:.6},{lon:.6}", keyword_text(&query));

        self.cached(key, || async {
            let mut shops = self.shops_with_keyword(text).await?;
            for shop in &mut shops {
                shop.distance = shop.coord().map(|c| proximity::haversine_m(origin, c));
            }
            shops.sort_by(|a, b| match (a.distance, b.distance) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.id.cmp(&b.id),
            });
            Ok(shops)
        })
        .await
    }
}

fn keyword_text(query: &KeywordQuery) -> String {
    match query {
        KeywordQuery::Single(term) => term.clone(),
        KeywordQuery::AllTags(terms) => terms.join(" "),
    }
}

#[async_trait]
impl ShopStore for CachedStore {
    async fn nearest_shops(&self, lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<Shop>> {
        let metres = proximity::parse_radius(radius)?;
        let key = format!("{GEO_PREFIX}{lat:.6},{lon:.6}@{metres}");
        self.cached(key, || self.inner.nearest_shops(lat, lon, radius))
            .await
    }

    async fn shops_with_keyword(&self, text: &str) -> StoreResult<Vec<Shop>> {
        let query = KeywordQuery::parse(text)?;
        let key = format!("{KEYWORD_PREFIX}{}", keyword_text(&query));
        self.cached(key, || self.inner.shops_with_keyword(text))
            .await
    }

    async fn adv_query(&self, query: &str) -> StoreResult<Vec<Shop>> {
        // Invalid queries never reach the backend or the cache.
        AdvQuery::parse(query)?;
        let key = format!("{ADV_PREFIX}{}", query.trim());
        self.cached(key, || self.inner.adv_query(query)).await
    }

    async fn shop_by_id(&self, id: i64) -> StoreResult<Shop> {
        self.inner.shop_by_id(id).await
    }

    async fn shop_missing_info(&self) -> StoreResult<Vec<Shop>> {
        self.inner.shop_missing_info().await
    }

    async fn update_shop_info(&self, shops: &[Shop]) -> StoreResult<u64> {
        let written = self.inner.update_shop_info(shops).await?;
        self.flush();
        Ok(written)
    }

    async fn shop_count(&self) -> StoreResult<u64> {
        self.inner.shop_count().await
    }

    async fn districts(&self) -> StoreResult<Vec<String>> {
        self.inner.districts().await
    }

    async fn suggest_keyword(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.suggest_keyword(key).await
    }

    async fn insert_shop(&self, shop: &Shop) -> StoreResult<i64> {
        let id = self.inner.insert_shop(shop).await?;
        self.flush();
        Ok(id)
    }

    async fn set_status(&self, id: i64, status: ShopStatus) -> StoreResult<()> {
        self.inner.set_status(id, status).await?;
        self.flush();
        Ok(())
    }

    async fn all_shops(&self) -> StoreResult<Vec<Shop>> {
        self.inner.all_shops().await
    }

    fn tag_maintenance(&self) -> Option<&dyn TagMaintenance> {
        self.inner.tag_maintenance()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfinder_core::models::Location;
    use shopfinder_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts backend reads that reach the store.
    struct Counting {
        store: InMemoryStore,
        reads: AtomicUsize,
    }

    impl Counting {
        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        fn hit(&self) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ShopStore for Counting {
        async fn nearest_shops(&self, lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<Shop>> {
            self.hit();
            self.store.nearest_shops(lat, lon, radius).await
        }
        async fn shops_with_keyword(&self, text: &str) -> StoreResult<Vec<Shop>> {
            self.hit();
            self.store.shops_with_keyword(text).await
        }
        async fn adv_query(&self, query: &str) -> StoreResult<Vec<Shop>> {
            self.hit();
            self.store.adv_query(query).await
        }
        async fn shop_by_id(&self, id: i64) -> StoreResult<Shop> {
            self.store.shop_by_id(id).await
        }
        async fn shop_missing_info(&self) -> StoreResult<Vec<Shop>> {
            self.store.shop_missing_info().await
        }
        async fn update_shop_info(&self, shops: &[Shop]) -> StoreResult<u64> {
            self.store.update_shop_info(shops).await
        }
        async fn shop_count(&self) -> StoreResult<u64> {
            self.store.shop_count().await
        }
        async fn districts(&self) -> StoreResult<Vec<String>> {
            self.store.districts().await
        }
        async fn suggest_keyword(&self, key: &str) -> StoreResult<Vec<String>> {
            self.store.suggest_keyword(key).await
        }
        async fn insert_shop(&self, shop: &Shop) -> StoreResult<i64> {
            self.store.insert_shop(shop).await
        }
        async fn set_status(&self, id: i64, status: ShopStatus) -> StoreResult<()> {
            self.store.set_status(id, status).await
        }
        async fn all_shops(&self) -> StoreResult<Vec<Shop>> {
            self.store.all_shops().await
        }
    }

    fn cafe(name: &str, lat: f64, lon: f64) -> Shop {
        let mut shop = Shop::new(name, "咖啡", "中環");
        shop.address = Some("addr".into());
        shop.tags = vec!["咖啡".into()];
        shop.location = Location::Coord(Coord::new(lat, lon));
        shop
    }

    fn setup() -> (Arc<Counting>, CachedStore) {
        let backend = Arc::new(Counting {
            store: InMemoryStore::with_shops([
                cafe("far", 22.2900, 114.1582),
                cafe("near", 22.2821, 114.1582),
            ]),
            reads: AtomicUsize::new(0),
        });
        let cached = CachedStore::new(backend.clone(), TtlCache::new(Duration::from_secs(600)));
        (backend, cached)
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_query_hits_backend_once_until_ttl() {
        let (backend, cached) = setup();

        cached.shops_with_keyword("咖啡").await.unwrap();
        cached.shops_with_keyword(" 咖啡 ").await.unwrap();
        assert_eq!(backend.reads(), 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        cached.shops_with_keyword("咖啡").await.unwrap();
        assert_eq!(backend.reads(), 2);
    }

    #[tokio::test]
    async fn writes_flush_cached_results() {
        let (backend, cached) = setup();

        assert_eq!(cached.adv_query("咖啡").await.unwrap().len(), 2);
        cached.set_status(1, ShopStatus::Closed).await.unwrap();
        assert_eq!(cached.adv_query("咖啡").await.unwrap().len(), 1);
        assert_eq!(backend.reads(), 2);
    }

    #[tokio::test]
    async fn invalid_adv_query_never_reaches_backend() {
        let (backend, cached) = setup();
        let err = cached.adv_query("-a OR -b").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(backend.reads(), 0);
    }

    #[tokio::test]
    async fn hits_are_owned_copies() {
        let (_backend, cached) = setup();
        let mut first = cached.nearest_shops(22.2819, 114.1582, "2km").await.unwrap();
        first[0].name = "mutated".into();
        let second = cached.nearest_shops(22.2819, 114.1582, "2km").await.unwrap();
        assert_eq!(second[0].name, "near");
    }

    #[tokio::test]
    async fn keyword_near_sorts_by_distance() {
        let (_backend, cached) = setup();
        let mut online = Shop::new("web", "咖啡", "");
        online.url = Some("https://example.com".into());
        online.tags = vec!["咖啡".into()];
        online.location = Location::Online;
        cached.insert_shop(&online).await.unwrap();

        let found = cached.keyword_near("咖啡", 22.2819, 114.1582).await.unwrap();
        let names: Vec<_> = found.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["near", "far", "web"]);
        assert!(found[2].distance.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_and_stops_with_cache() {
        let cache: TtlCache<u32> =
            TtlCache::with_sweeper(Duration::from_secs(10), Duration::from_secs(30));
        cache.insert("a", 1);
        cache.insert_with_ttl("b", 2, Duration::from_secs(120));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(2));

        let entries = Arc::downgrade(&cache.entries);
        drop(cache);
        assert!(entries.upgrade().is_none());
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::ZERO);
        cache.insert("k", 7);
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }
}
