//! # Cache Module
//!
//! Query cache in front of the nodes' `loadtracks` endpoint.
//!
//! Results are keyed by search source plus normalized query and kept in a
//! bounded [`LfuCache`]. Concurrent misses for the same key share one
//! in-flight request. Failed loads are returned to every waiter and never
//! stored.
//!
//! ```rust,no_run
//! # use open_music_link::{cache::QueryCache, sources::SearchSource};
//! # async fn example(cache: QueryCache, rest: std::sync::Arc<open_music_link::node::rest::RestClient>) -> open_music_link::Result<()> {
//! let result = cache.get_or_resolve(SearchSource::YouTube, "lofi beats", rest).await?;
//! println!("{} tracks", result.tracks().len());
//! # Ok(())
//! # }
//! ```

pub mod lfu_cache;

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::node::rest::TrackLoader;
use crate::sources::{is_url, LoadResult, SearchSource};
use crate::{Error, Result};
pub use lfu_cache::{CacheMetrics, LfuCache};

/// Clave de caché: fuente más búsqueda normalizada.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: SearchSource,
    pub query: String,
}

impl CacheKey {
    /// Free-text queries are trimmed, whitespace-collapsed and lowercased.
    /// URLs are only trimmed since their paths are case-sensitive.
    pub fn new(source: SearchSource, query: &str) -> Self {
        let trimmed = query.trim();
        let query = if is_url(trimmed) {
            trimmed.to_string()
        } else {
            trimmed
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        };
        Self { source, query }
    }
}

type Resolution = Shared<BoxFuture<'static, std::result::Result<LoadResult, Arc<Error>>>>;

struct CacheInner {
    entries: Mutex<LfuCache<CacheKey, LoadResult>>,
    in_flight: DashMap<CacheKey, Resolution>,
}

#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(LfuCache::new(capacity)),
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn get(&self, source: SearchSource, query: &str) -> Option<LoadResult> {
        self.inner.entries.lock().get(&CacheKey::new(source, query))
    }

    /// Devuelve el resultado cacheado o lo resuelve con `loader`.
    pub async fn get_or_resolve(
        &self,
        source: SearchSource,
        query: &str,
        loader: Arc<dyn TrackLoader>,
    ) -> Result<LoadResult> {
        let key = CacheKey::new(source, query);
        if let Some(hit) = self.inner.entries.lock().get(&key) {
            debug!(query = %key.query, "✅ Cache hit de búsqueda");
            return Ok(hit);
        }

        let resolution = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(pending) => {
                debug!(query = %key.query, "uniéndose a una resolución en curso");
                pending.get().clone()
            }
            Entry::Vacant(slot) => {
                // otro llamador pudo terminar entre la búsqueda y aquí
                if let Some(hit) = self.inner.entries.lock().get(&key) {
                    return Ok(hit);
                }
                let resolution = Self::resolve(self.inner.clone(), key.clone(), query, loader);
                slot.insert(resolution.clone());
                resolution
            }
        };

        resolution.await.map_err(|e| e.duplicate())
    }

    fn resolve(
        inner: Arc<CacheInner>,
        key: CacheKey,
        query: &str,
        loader: Arc<dyn TrackLoader>,
    ) -> Resolution {
        let identifier = key.source.identifier(query);
        async move {
            debug!(%identifier, "❌ Cache miss, resolviendo");
            let result = loader
                .load_tracks(&identifier)
                .await
                .and_then(LoadResult::into_result);

            if let Ok(value) = &result {
                inner.entries.lock().insert(key.clone(), value.clone());
            }
            inner.in_flight.remove(&key);
            result.map_err(Arc::new)
        }
        .boxed()
        .shared()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.inner.entries.lock().metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::rest::MockTrackLoader;
    use crate::sources::{fixtures::track, Severity, TrackError};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[test]
    fn test_key_normalization() {
        assert_eq!(
            CacheKey::new(SearchSource::YouTube, "  Lofi   Hip  Hop "),
            CacheKey::new(SearchSource::YouTube, "lofi hip hop")
        );
        assert_ne!(
            CacheKey::new(SearchSource::YouTube, "rain"),
            CacheKey::new(SearchSource::SoundCloud, "rain")
        );
        assert_eq!(
            CacheKey::new(SearchSource::YouTube, " https://youtu.be/AbC ").query,
            "https://youtu.be/AbC"
        );
    }

    #[tokio::test]
    async fn test_hit_skips_loader() {
        let mut loader = MockTrackLoader::new();
        loader
            .expect_load_tracks()
            .withf(|identifier| identifier == "ytsearch:rain")
            .times(1)
            .returning(|_| Ok(LoadResult::Search(vec![track("r", 1000)])));
        let loader: Arc<dyn TrackLoader> = Arc::new(loader);

        let cache = QueryCache::new(4);
        let first = cache
            .get_or_resolve(SearchSource::YouTube, "rain", loader.clone())
            .await
            .unwrap();
        let second = cache
            .get_or_resolve(SearchSource::YouTube, "  RAIN ", loader)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.metrics().hits, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let mut loader = MockTrackLoader::new();
        loader.expect_load_tracks().times(2).returning(|_| {
            Ok(LoadResult::Error(TrackError {
                message: Some("unavailable".into()),
                severity: Severity::Common,
                cause: String::new(),
            }))
        });
        let loader: Arc<dyn TrackLoader> = Arc::new(loader);

        let cache = QueryCache::new(4);
        for _ in 0..2 {
            let err = cache
                .get_or_resolve(SearchSource::YouTube, "gone", loader.clone())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::LoadFailed { .. }));
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let mut loader = MockTrackLoader::new();
        loader
            .expect_load_tracks()
            .returning(|id| Ok(LoadResult::Search(vec![track(id, 1)])));
        let loader: Arc<dyn TrackLoader> = Arc::new(loader);

        let cache = QueryCache::new(2);
        for query in ["a", "b", "c"] {
            cache
                .get_or_resolve(SearchSource::YouTube, query, loader.clone())
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(SearchSource::YouTube, "a").is_none());
        assert!(cache.get(SearchSource::YouTube, "c").is_some());
    }

    /// Blocks every load until released, counting calls.
    struct GatedLoader {
        calls: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl TrackLoader for GatedLoader {
        async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(LoadResult::Search(vec![track(identifier, 1)]))
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let loader = Arc::new(GatedLoader {
            calls: AtomicUsize::new(0),
            gate: Notify::new(),
        });
        let cache = QueryCache::new(4);

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let cache = cache.clone();
                let loader: Arc<dyn TrackLoader> = loader.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_resolve(SearchSource::YouTube, "same song", loader)
                        .await
                })
            })
            .collect();

        while loader.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        loader.gate.notify_one();

        for waiter in waiters {
            let result = waiter.await.unwrap().unwrap();
            assert_eq!(result.tracks().len(), 1);
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }
}
