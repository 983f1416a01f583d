// Generic TTL cache
// One instance is built per process and shared by the token cache, reference data and adapters

use crate::error::SearchError;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Deserialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// Closed set of logical cache namespaces.
// The payload type stored under a key is agreed by convention between writer and reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    AccessToken(String),
    AllAirports,
    AllAirlines,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::AccessToken(provider) => write!(f, "access_token:{}", provider),
            CacheKey::AllAirports => write!(f, "airports"),
            CacheKey::AllAirlines => write!(f, "airlines"),
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
    pub expired_count: AtomicUsize,
    pub factory_invocations: AtomicUsize,
    pub joined_in_flight: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStatsReport {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub expired_count: usize,
    pub factory_invocations: usize,
    pub joined_in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
        }
    }
}

type CachedValue = Arc<dyn Any + Send + Sync>;
type InFlight = Shared<BoxFuture<'static, Result<CachedValue, SearchError>>>;

enum Lookup<T> {
    Hit(Arc<T>),
    InFlight(InFlight),
    Vacant,
}

struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: CachedValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct Cache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    // Guards the check-then-register step of get_or_create. Never held across an await.
    in_flight: Arc<Mutex<HashMap<CacheKey, InFlight>>>,
    config: CacheConfig,
    stats: CacheStats,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("items", &self.entries.len())
            .field("in_flight", &self.in_flight.lock().len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            config,
            stats: CacheStats::default(),
        }
    }

    pub fn add<T: Any + Send + Sync>(&self, key: CacheKey, value: T, ttl: Duration) {
        debug!(%key, ttl_secs = ttl.as_secs(), "caching value");
        self.entries
            .insert(key, CacheEntry::new(Arc::new(value), ttl));
    }

    pub fn add_default<T: Any + Send + Sync>(&self, key: CacheKey, value: T) {
        let ttl = Duration::from_secs(self.config.default_ttl_seconds);
        self.add(key, value, ttl);
    }

    // Returns the value if present, unexpired and of the requested type
    pub fn get<T: Any + Send + Sync>(&self, key: &CacheKey) -> Option<Arc<T>> {
        let Some(value) = self.live_value(key) else {
            self.stats.miss_count.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match value.downcast::<T>() {
            Ok(value) => {
                self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(_) => {
                warn!(%key, "cached value has an unexpected type, treating as absent");
                self.stats.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.live_value(key).is_some()
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    // Sweeps every expired entry, returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let purged = before.saturating_sub(self.entries.len());
        self.stats.expired_count.fetch_add(purged, Ordering::Relaxed);
        purged
    }

    pub fn stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            items_count: self.entries.len(),
            hit_count: self.stats.hit_count.load(Ordering::Relaxed),
            miss_count: self.stats.miss_count.load(Ordering::Relaxed),
            expired_count: self.stats.expired_count.load(Ordering::Relaxed),
            factory_invocations: self.stats.factory_invocations.load(Ordering::Relaxed),
            joined_in_flight: self.stats.joined_in_flight.load(Ordering::Relaxed),
        }
    }

    pub async fn get_or_create<T, F, Fut>(
        &self,
        key: CacheKey,
        factory: F,
        ttl: Duration,
    ) -> Result<Arc<T>, SearchError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SearchError>> + Send + 'static,
    {
        self.get_or_create_with(key, move || {
            let pending = factory();
            async move { pending.await.map(|value| (value, ttl)) }
        })
        .await
    }

    // Like get_or_create, but the factory decides the TTL from the value it produced.
    //
    // At most one factory runs per key at a time: the first caller spawns it as a task and
    // registers a shared handle under the key, later callers await that same handle. The
    // task stores its own result and deregisters itself, so it runs to completion even when
    // every caller has gone away. Failures reach every waiter and are never cached.
    //
    // `factory` is called without any cache lock held and may itself use the cache.
    pub async fn get_or_create_with<T, F, Fut>(
        &self,
        key: CacheKey,
        factory: F,
    ) -> Result<Arc<T>, SearchError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Duration), SearchError>> + Send + 'static,
    {
        let joined = {
            let in_flight = self.in_flight.lock();
            match self.lookup::<T>(&key, &in_flight) {
                Lookup::Hit(value) => return Ok(value),
                Lookup::InFlight(flight) => Some(flight),
                Lookup::Vacant => None,
            }
        };

        let flight = match joined {
            Some(flight) => flight,
            None => {
                let pending = factory();
                let mut in_flight = self.in_flight.lock();
                // Someone may have started the same key while the factory was being built
                match self.lookup::<T>(&key, &in_flight) {
                    Lookup::Hit(value) => return Ok(value),
                    Lookup::InFlight(flight) => flight,
                    Lookup::Vacant => {
                        debug!(%key, "cache miss, starting factory");
                        self.stats.miss_count.fetch_add(1, Ordering::Relaxed);
                        self.stats.factory_invocations.fetch_add(1, Ordering::Relaxed);
                        let flight = self.start_flight(key.clone(), pending);
                        in_flight.insert(key.clone(), flight.clone());
                        flight
                    }
                }
            }
        };

        let value = flight.await?;
        value.downcast::<T>().map_err(|_| {
            SearchError::Configuration(format!(
                "cache key {} is shared by incompatible value types",
                key
            ))
        })
    }

    // Must be called with the in-flight lock held
    fn lookup<T>(&self, key: &CacheKey, in_flight: &HashMap<CacheKey, InFlight>) -> Lookup<T>
    where
        T: Any + Send + Sync,
    {
        if let Some(value) = self.live_value(key) {
            if let Ok(value) = value.downcast::<T>() {
                self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
                return Lookup::Hit(value);
            }
            warn!(%key, "cached value has an unexpected type, recomputing");
        }

        match in_flight.get(key) {
            Some(existing) => {
                debug!(%key, "joining in-flight computation");
                self.stats.joined_in_flight.fetch_add(1, Ordering::Relaxed);
                Lookup::InFlight(existing.clone())
            }
            None => Lookup::Vacant,
        }
    }

    fn start_flight<T, Fut>(&self, key: CacheKey, pending: Fut) -> InFlight
    where
        T: Any + Send + Sync,
        Fut: Future<Output = Result<(T, Duration), SearchError>> + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let in_flight = Arc::clone(&self.in_flight);
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let key = task_key;
            let outcome = AssertUnwindSafe(pending).catch_unwind().await;
            let result = match outcome {
                Ok(Ok((value, ttl))) => Ok((Arc::new(value) as CachedValue, ttl)),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(SearchError::TaskFailed(format!(
                    "cache factory for {} panicked",
                    key
                ))),
            };

            // Publish and deregister under the same lock callers use to register,
            // so nobody can observe "no entry and nothing in flight" in between.
            let mut registered = in_flight.lock();
            let result = result.map(|(value, ttl)| {
                entries.insert(key.clone(), CacheEntry::new(Arc::clone(&value), ttl));
                value
            });
            if let Err(error) = &result {
                debug!(%key, %error, "cache factory failed, nothing cached");
            }
            registered.remove(&key);
            result
        });

        let in_flight = Arc::clone(&self.in_flight);
        async move {
            match task.await {
                Ok(result) => result,
                // The runtime dropped the task before it could deregister
                Err(error) => {
                    in_flight.lock().remove(&key);
                    Err(SearchError::TaskFailed(format!(
                        "cache factory for {} did not finish: {}",
                        key, error
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }

    // Expired entries are evicted on read
    fn live_value(&self, key: &CacheKey) -> Option<CachedValue> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(Arc::clone(&entry.value)),
            Some(_) => true,
            None => false,
        };

        if expired
            && self
                .entries
                .remove_if(key, |_, entry| entry.is_expired())
                .is_some()
        {
            debug!(%key, "evicted expired entry");
            self.stats.expired_count.fetch_add(1, Ordering::Relaxed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    fn token_key(provider: &str) -> CacheKey {
        CacheKey::AccessToken(provider.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_get_contains_remove() {
        let cache = Cache::default();
        let key = token_key("gds");

        assert!(cache.get::<String>(&key).is_none());
        cache.add(key.clone(), "token-1".to_string(), Duration::from_secs(60));

        assert!(cache.contains(&key));
        assert_eq!(cache.get::<String>(&key).as_deref().map(String::as_str), Some("token-1"));
        assert!(cache.remove(&key));
        assert!(!cache.contains(&key));
        assert!(!cache.remove(&key));

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration_and_ttl() {
        let cache = Cache::new(CacheConfig {
            default_ttl_seconds: 5,
        });

        cache.add_default(CacheKey::AllAirports, vec!["LHR".to_string()]);
        cache.add(
            CacheKey::AllAirlines,
            vec!["BA".to_string()],
            Duration::from_secs(2),
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.get::<Vec<String>>(&CacheKey::AllAirports).is_some());
        assert!(cache.get::<Vec<String>>(&CacheKey::AllAirlines).is_none());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.get::<Vec<String>>(&CacheKey::AllAirports).is_none());

        let stats = cache.stats();
        assert_eq!(stats.expired_count, 2);
        assert_eq!(stats.items_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_payload_type_behaves_as_absent() {
        let cache = Cache::default();
        cache.add(CacheKey::AllAirports, 42_u32, Duration::from_secs(60));

        assert!(cache.get::<String>(&CacheKey::AllAirports).is_none());
        assert_eq!(cache.get::<u32>(&CacheKey::AllAirports).as_deref(), Some(&42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_create_returns_cached_value() {
        let cache = Cache::default();
        cache.add(token_key("gds"), "cached".to_string(), Duration::from_secs(60));

        let value = cache
            .get_or_create(
                token_key("gds"),
                || async { Ok::<_, SearchError>("fresh".to_string()) },
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(value.as_str(), "cached");
        assert_eq!(cache.stats().factory_invocations, 0);
    }

    #[test]
    fn test_cache_hit_completes_on_first_poll() {
        let cache = Cache::default();
        cache.add(CacheKey::AllAirlines, vec!["BA".to_string()], Duration::from_secs(60));

        let mut hit = tokio_test::task::spawn(cache.get_or_create(
            CacheKey::AllAirlines,
            || async { Ok::<Vec<String>, SearchError>(vec![]) },
            Duration::from_secs(60),
        ));
        let value = tokio_test::assert_ready!(hit.poll());
        assert_eq!(value.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_create_single_flight() {
        let cache = Cache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..16).map(|_| {
            let calls = Arc::clone(&calls);
            cache.get_or_create(
                token_key("gds"),
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, SearchError>("token".to_string())
                },
                Duration::from_secs(60),
            )
        });
        let results = join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| r.as_ref().map(|v| v.as_str()) == Ok("token")));

        let stats = cache.stats();
        assert_eq!(stats.factory_invocations, 1);
        assert_eq!(stats.joined_in_flight, 15);
        assert!(cache.contains(&token_key("gds")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access_with_contention() {
        let cache = Arc::new(Cache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create(
                        CacheKey::AllAirlines,
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, SearchError>(vec!["BA".to_string(), "LH".to_string()])
                        },
                        Duration::from_secs(60),
                    )
                    .await
            }));
        }

        for handle in handles {
            let airlines = handle.await.unwrap().unwrap();
            assert_eq!(airlines.len(), 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_failure_reaches_all_waiters_and_is_not_cached() {
        let cache = Cache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let calls = Arc::clone(&calls);
            cache.get_or_create(
                token_key("metasearch"),
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<String, _>(SearchError::Credential("invalid_client".to_string()))
                },
                Duration::from_secs(60),
            )
        });
        let results = join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(
            r,
            Err(SearchError::Credential(message)) if message == "invalid_client"
        )));
        assert!(!cache.contains(&token_key("metasearch")));

        // The next caller starts a fresh computation
        let retry = cache
            .get_or_create(
                token_key("metasearch"),
                || async { Ok::<_, SearchError>("recovered".to_string()) },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(retry.as_str(), "recovered");
        assert_eq!(cache.stats().factory_invocations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_is_scoped_per_key() {
        let cache = Arc::new(Cache::default());

        let slow_cache = Arc::clone(&cache);
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_create(
                    CacheKey::AllAirports,
                    || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, SearchError>(vec!["JFK".to_string()])
                    },
                    Duration::from_secs(600),
                )
                .await
        });
        tokio::task::yield_now().await;

        let airlines = cache
            .get_or_create(
                CacheKey::AllAirlines,
                || async { Ok::<_, SearchError>(vec!["AA".to_string()]) },
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        assert_eq!(airlines.len(), 1);
        assert!(!slow.is_finished());
        assert_eq!(slow.await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_computation_still_completes() {
        let cache = Arc::new(Cache::default());
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let only_caller = {
            let (started, finished) = (Arc::clone(&started), Arc::clone(&finished));
            cache.get_or_create(
                CacheKey::AllAirports,
                move || async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, SearchError>(vec!["CDG".to_string()])
                },
                Duration::from_secs(60),
            )
        };
        // Poll the only caller once, then drop it mid-computation
        let abandoned = tokio::time::timeout(Duration::from_millis(10), only_caller).await;
        assert!(abandoned.is_err());

        // Nobody is waiting any more, the computation still lands in the cache
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(cache.contains(&CacheKey::AllAirports));

        let later = cache
            .get_or_create(
                CacheKey::AllAirports,
                || async { Ok::<_, SearchError>(vec!["ORY".to_string()]) },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(later.as_slice(), ["CDG".to_string()]);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().factory_invocations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_may_use_the_cache_synchronously() {
        let cache = Arc::new(Cache::default());
        cache.add(CacheKey::AllAirlines, vec!["BA".to_string()], Duration::from_secs(60));

        let nested = Arc::clone(&cache);
        let airports = cache
            .get_or_create(
                CacheKey::AllAirports,
                move || {
                    // A cache hit resolves on first poll, so block_on returns immediately
                    let airlines = futures::executor::block_on(nested.get_or_create(
                        CacheKey::AllAirlines,
                        || async { Ok::<Vec<String>, SearchError>(vec![]) },
                        Duration::from_secs(60),
                    ));
                    async move {
                        let count = airlines?.len();
                        Ok::<_, SearchError>(vec![format!("{} airlines", count)])
                    }
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(airports.as_slice(), ["1 airlines".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_decides_ttl() {
        let cache = Cache::default();

        cache
            .get_or_create_with(token_key("gds"), || async {
                Ok::<_, SearchError>(("short-lived".to_string(), Duration::from_secs(10)))
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.contains(&token_key("gds")));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.contains(&token_key("gds")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = Cache::default();
        cache.add(token_key("a"), 1_u8, Duration::from_secs(1));
        cache.add(token_key("b"), 2_u8, Duration::from_secs(1));
        cache.add(token_key("c"), 3_u8, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.stats().items_count, 1);

        cache.clear();
        assert_eq!(cache.stats().items_count, 0);
    }
}
