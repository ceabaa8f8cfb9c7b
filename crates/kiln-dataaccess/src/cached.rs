//! Cached data access — short-TTL read caching over any other variant.
//!
//! Misses fetch through and are coalesced per key, so two concurrent
//! lookups of the same entity issue exactly one upstream fetch. A 404 is
//! cached negatively for a shorter interval; 5xx and transport errors
//! are never cached. Writes pass straight through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

use kiln_core::{ApiError, ApiResult, App, Call, Fn, Route, Trigger};

use crate::DataAccess;

/// Cache tuning. The TTLs are deliberately short: the catalog is
/// eventually consistent and a runner must never serve config older
/// than `ttl`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            negative_ttl: Duration::from_secs(1),
            capacity: 10_240,
        }
    }
}

/// A cached lookup result; `Missing` is the negative entry for a 404.
#[derive(Clone)]
enum Entry<T> {
    Found(T),
    Missing,
}

/// Gives negative entries their own (shorter) lifetime.
struct EntryExpiry {
    ttl: Duration,
    negative_ttl: Duration,
}

impl<K, T> Expiry<K, Entry<T>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &Entry<T>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(match value {
            Entry::Found(_) => self.ttl,
            Entry::Missing => self.negative_ttl,
        })
    }
}

fn build_cache<T: Clone + Send + Sync + 'static>(config: &CacheConfig) -> Cache<String, Entry<T>> {
    Cache::builder()
        .max_capacity(config.capacity)
        .expire_after(EntryExpiry {
            ttl: config.ttl,
            negative_ttl: config.negative_ttl,
        })
        .build()
}

/// Object-safe handle to a cache's invalidation entry point, for the
/// runner-side cache admin endpoint.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate_app(&self, app_id: &str);
}

#[async_trait]
impl<D: DataAccess> CacheInvalidator for CachedAccess<D> {
    async fn invalidate_app(&self, app_id: &str) {
        CachedAccess::invalidate_app(self, app_id).await;
    }
}

/// TTL-cached wrapper around another [`DataAccess`].
pub struct CachedAccess<D> {
    inner: D,
    apps_by_id: Cache<String, Entry<App>>,
    apps_by_name: Cache<String, Entry<App>>,
    routes: Cache<String, Entry<Route>>,
    fns: Cache<String, Entry<Fn>>,
    triggers: Cache<String, Entry<Trigger>>,
}

impl<D: DataAccess> CachedAccess<D> {
    pub fn new(inner: D) -> Self {
        Self::with_config(inner, CacheConfig::default())
    }

    pub fn with_config(inner: D, config: CacheConfig) -> Self {
        Self {
            inner,
            apps_by_id: build_cache(&config),
            apps_by_name: build_cache(&config),
            routes: build_cache(&config),
            fns: build_cache(&config),
            triggers: build_cache(&config),
        }
    }

    /// Drop every cached entry belonging to an app. Used by the cache
    /// invalidation endpoint after a catalog write.
    pub async fn invalidate_app(&self, app_id: &str) {
        let app_name = match self.apps_by_id.get(app_id).await {
            Some(Entry::Found(app)) => Some(app.name),
            _ => None,
        };
        self.apps_by_id.invalidate(app_id).await;

        if let Some(name) = &app_name {
            self.apps_by_name.invalidate(name).await;
            let prefix = format!("{name}:");
            let stale: Vec<Arc<String>> = self
                .routes
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k)
                .collect();
            for key in stale {
                self.routes.invalidate(key.as_str()).await;
            }
        }

        let stale_fns: Vec<Arc<String>> = self
            .fns
            .iter()
            .filter(|(_, v)| matches!(v, Entry::Found(f) if f.app_id == app_id))
            .map(|(k, _)| k)
            .collect();
        for key in stale_fns {
            self.fns.invalidate(key.as_str()).await;
        }

        let prefix = format!("{app_id}:");
        let stale_triggers: Vec<Arc<String>> = self
            .triggers
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k)
            .collect();
        for key in stale_triggers {
            self.triggers.invalidate(key.as_str()).await;
        }

        debug!(app_id, "cache invalidated");
    }

    /// Fetch-through with per-key coalescing. Only the first of N
    /// concurrent misses reaches the inner access; errors other than
    /// 404 are returned to every waiter and cached by nobody.
    async fn fetch<T, F>(
        cache: &Cache<String, Entry<T>>,
        key: String,
        what: &'static str,
        load: F,
    ) -> ApiResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: std::future::Future<Output = ApiResult<T>>,
    {
        let entry = cache
            .try_get_with(key, async {
                match load.await {
                    Ok(value) => Ok(Entry::Found(value)),
                    Err(ApiError::NotFound(_)) => Ok(Entry::Missing),
                    Err(other) => Err(other),
                }
            })
            .await
            .map_err(|e: Arc<ApiError>| (*e).clone())?;
        match entry {
            Entry::Found(value) => Ok(value),
            Entry::Missing => Err(ApiError::NotFound(what)),
        }
    }
}

#[async_trait]
impl<D: DataAccess> DataAccess for CachedAccess<D> {
    async fn get_app_by_id(&self, id: &str) -> ApiResult<App> {
        Self::fetch(
            &self.apps_by_id,
            id.to_string(),
            "app",
            self.inner.get_app_by_id(id),
        )
        .await
    }

    async fn get_app_by_name(&self, name: &str) -> ApiResult<App> {
        Self::fetch(
            &self.apps_by_name,
            name.to_string(),
            "app",
            self.inner.get_app_by_name(name),
        )
        .await
    }

    async fn get_route(&self, app_name: &str, path: &str) -> ApiResult<Route> {
        Self::fetch(
            &self.routes,
            format!("{app_name}:{path}"),
            "route",
            self.inner.get_route(app_name, path),
        )
        .await
    }

    async fn get_fn(&self, fn_id: &str) -> ApiResult<Fn> {
        Self::fetch(&self.fns, fn_id.to_string(), "fn", self.inner.get_fn(fn_id)).await
    }

    async fn get_trigger_by_source(&self, app_id: &str, source: &str) -> ApiResult<Trigger> {
        Self::fetch(
            &self.triggers,
            format!("{app_id}:{source}"),
            "trigger",
            self.inner.get_trigger_by_source(app_id, source),
        )
        .await
    }

    async fn insert_call(&self, call: &Call) -> ApiResult<()> {
        self.inner.insert_call(call).await
    }

    async fn insert_log(&self, app_name: &str, call_id: &str, log: &[u8]) -> ApiResult<()> {
        self.inner.insert_log(app_name, call_id, log).await
    }

    async fn enqueue(&self, call: &Call) -> ApiResult<()> {
        self.inner.enqueue(call).await
    }

    async fn dequeue_one(&self) -> ApiResult<Option<Call>> {
        self.inner.dequeue_one().await
    }

    async fn delete_from_queue(&self, call_id: &str) -> ApiResult<bool> {
        self.inner.delete_from_queue(call_id).await
    }

    async fn return_to_queue(&self, call_id: &str, delay: Duration) -> ApiResult<()> {
        self.inner.return_to_queue(call_id, delay).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts upstream fetches and serves a mutable app.
    struct CountingAccess {
        fetches: AtomicU64,
        app: std::sync::Mutex<Option<App>>,
        fail_with: std::sync::Mutex<Option<ApiError>>,
    }

    impl CountingAccess {
        fn with_app(app: App) -> Self {
            Self {
                fetches: AtomicU64::new(0),
                app: std::sync::Mutex::new(Some(app)),
                fail_with: std::sync::Mutex::new(None),
            }
        }

        fn set_app(&self, app: Option<App>) {
            *self.app.lock().unwrap() = app;
        }

        fn set_failure(&self, err: Option<ApiError>) {
            *self.fail_with.lock().unwrap() = err;
        }

        fn fetch_count(&self) -> u64 {
            self.fetches.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl DataAccess for &CountingAccess {
        async fn get_app_by_id(&self, _id: &str) -> ApiResult<App> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            // Give concurrent misses a window to overlap.
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            self.app
                .lock()
                .unwrap()
                .clone()
                .ok_or(ApiError::NotFound("app"))
        }

        async fn get_app_by_name(&self, _name: &str) -> ApiResult<App> {
            Err(ApiError::NotFound("app"))
        }
        async fn get_route(&self, _a: &str, _p: &str) -> ApiResult<Route> {
            Err(ApiError::NotFound("route"))
        }
        async fn get_fn(&self, _id: &str) -> ApiResult<Fn> {
            Err(ApiError::NotFound("fn"))
        }
        async fn get_trigger_by_source(&self, _a: &str, _s: &str) -> ApiResult<Trigger> {
            Err(ApiError::NotFound("trigger"))
        }
        async fn insert_call(&self, _c: &Call) -> ApiResult<()> {
            Ok(())
        }
        async fn insert_log(&self, _a: &str, _c: &str, _l: &[u8]) -> ApiResult<()> {
            Ok(())
        }
        async fn enqueue(&self, _c: &Call) -> ApiResult<()> {
            Ok(())
        }
        async fn dequeue_one(&self) -> ApiResult<Option<Call>> {
            Ok(None)
        }
        async fn delete_from_queue(&self, _c: &str) -> ApiResult<bool> {
            Ok(false)
        }
        async fn return_to_queue(&self, _c: &str, _d: Duration) -> ApiResult<()> {
            Ok(())
        }
    }

    fn test_app(config_val: &str) -> App {
        let mut config = BTreeMap::new();
        config.insert("GREETING".to_string(), config_val.to_string());
        App {
            id: "a-1".to_string(),
            name: "myapp".to_string(),
            config,
            annotations: BTreeMap::new(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn short_ttl() -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_millis(80),
            negative_ttl: Duration::from_millis(40),
            capacity: 128,
        }
    }

    #[tokio::test]
    async fn hit_avoids_second_fetch() {
        let inner = CountingAccess::with_app(test_app("hi"));
        let cached = CachedAccess::new(&inner);

        cached.get_app_by_id("a-1").await.unwrap();
        cached.get_app_by_id("a-1").await.unwrap();
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_issue_one_fetch() {
        let inner = Box::leak(Box::new(CountingAccess::with_app(test_app("hi"))));
        let cached = Arc::new(CachedAccess::new(&*inner));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cached = cached.clone();
            tasks.push(tokio::spawn(async move {
                cached.get_app_by_id("a-1").await.unwrap()
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().name, "myapp");
        }
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test]
    async fn value_refreshes_after_ttl() {
        let inner = CountingAccess::with_app(test_app("old"));
        let cached = CachedAccess::with_config(&inner, short_ttl());

        let first = cached.get_app_by_id("a-1").await.unwrap();
        assert_eq!(first.config["GREETING"], "old");

        inner.set_app(Some(test_app("new")));
        // Within the TTL the stale value is still served.
        let second = cached.get_app_by_id("a-1").await.unwrap();
        assert_eq!(second.config["GREETING"], "old");

        tokio::time::sleep(Duration::from_millis(120)).await;
        let third = cached.get_app_by_id("a-1").await.unwrap();
        assert_eq!(third.config["GREETING"], "new");
        assert_eq!(inner.fetch_count(), 2);
    }

    #[tokio::test]
    async fn not_found_is_cached_briefly() {
        let inner = CountingAccess::with_app(test_app("hi"));
        inner.set_app(None);
        let cached = CachedAccess::with_config(&inner, short_ttl());

        assert_eq!(
            cached.get_app_by_id("a-1").await.unwrap_err(),
            ApiError::NotFound("app")
        );
        assert_eq!(
            cached.get_app_by_id("a-1").await.unwrap_err(),
            ApiError::NotFound("app")
        );
        // The second 404 came from the negative entry.
        assert_eq!(inner.fetch_count(), 1);

        // Once the negative TTL lapses, a created app becomes visible.
        inner.set_app(Some(test_app("hi")));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cached.get_app_by_id("a-1").await.is_ok());
    }

    #[tokio::test]
    async fn upstream_errors_are_not_cached() {
        let inner = CountingAccess::with_app(test_app("hi"));
        inner.set_failure(Some(ApiError::Upstream("boom".into())));
        let cached = CachedAccess::with_config(&inner, short_ttl());

        assert!(matches!(
            cached.get_app_by_id("a-1").await.unwrap_err(),
            ApiError::Upstream(_)
        ));
        inner.set_failure(None);
        // The failure was not cached; the next read fetches and succeeds.
        assert!(cached.get_app_by_id("a-1").await.is_ok());
        assert_eq!(inner.fetch_count(), 2);
    }

    #[tokio::test]
    async fn explicit_invalidation_forces_fresh_value() {
        let inner = CountingAccess::with_app(test_app("old"));
        let cached = CachedAccess::new(&inner);

        cached.get_app_by_id("a-1").await.unwrap();
        inner.set_app(Some(test_app("new")));

        cached.invalidate_app("a-1").await;
        let fresh = cached.get_app_by_id("a-1").await.unwrap();
        assert_eq!(fresh.config["GREETING"], "new");
    }
}
