use inference_engine::{ChatModel, LoadParams};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::models::chat::ModelSourceSpec;
use crate::services::model_resolver::ModelResolver;
use crate::utils::error::ApiError;

/// What identifies a loaded model. Sampling parameters are per call and
/// do not take part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub source: ModelSourceSpec,
    pub load: LoadParams,
}

/// A checked-out model. The weights stay in memory while any lease or the
/// cache still holds them.
#[derive(Clone)]
pub struct ModelLease {
    model: Arc<dyn ChatModel>,
}

impl ModelLease {
    pub fn model(&self) -> &dyn ChatModel {
        self.model.as_ref()
    }
}

struct Entry {
    key: ModelKey,
    model: Arc<dyn ChatModel>,
    size_bytes: u64,
}

/// LRU cache of loaded models in front of the [`ModelResolver`].
pub struct ModelCache {
    resolver: ModelResolver,
    // Most recently used first.
    entries: Mutex<VecDeque<Entry>>,
    load_lock: tokio::sync::Mutex<()>,
    max_models: usize,
    max_memory_bytes: u64,
}

impl ModelCache {
    pub fn new(resolver: ModelResolver, config: &CacheConfig) -> Self {
        Self {
            resolver,
            entries: Mutex::new(VecDeque::new()),
            load_lock: tokio::sync::Mutex::new(()),
            max_models: config.max_models,
            max_memory_bytes: config.max_memory_mb * 1024 * 1024,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns a lease on the model for `source` loaded with `load`,
    /// loading it on a miss.
    pub async fn checkout(
        &self,
        source: &ModelSourceSpec,
        load: LoadParams,
    ) -> Result<ModelLease, ApiError> {
        if self.max_models == 0 {
            let model = self.resolver.resolve(source, load).await?;
            return Ok(ModelLease { model });
        }

        let key = ModelKey {
            source: source.clone(),
            load,
        };

        if let Some(model) = self.lookup(&key) {
            debug!("Model cache hit: {}", source);
            return Ok(ModelLease { model });
        }

        // One load at a time; a concurrent miss on the same key waits here
        // and then finds the entry.
        let _guard = self.load_lock.lock().await;
        if let Some(model) = self.lookup(&key) {
            debug!("Model cache hit after wait: {}", source);
            return Ok(ModelLease { model });
        }

        let model = self.resolver.resolve(source, load).await?;
        self.insert(key, model.clone());
        Ok(ModelLease { model })
    }

    /// Drops every cached model. Outstanding leases keep theirs alive.
    pub fn clear(&self) {
        let evicted: Vec<Entry> = self.entries.lock().drain(..).collect();
        if !evicted.is_empty() {
            info!("Cleared {} cached models", evicted.len());
        }
    }

    fn lookup(&self, key: &ModelKey) -> Option<Arc<dyn ChatModel>> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| &e.key == key)?;
        let entry = entries.remove(pos)?;
        let model = entry.model.clone();
        entries.push_front(entry);
        Some(model)
    }

    fn insert(&self, key: ModelKey, model: Arc<dyn ChatModel>) {
        let size_bytes = model.size_bytes();
        let evicted = {
            let mut entries = self.entries.lock();
            entries.push_front(Entry {
                key,
                model,
                size_bytes,
            });
            self.evict(&mut entries)
        };

        // Freed outside the lock; releasing weights can be slow.
        for entry in evicted {
            info!(
                "Evicting model {} ({} MB)",
                entry.key.source,
                entry.size_bytes / 1024 / 1024
            );
        }
    }

    fn evict(&self, entries: &mut VecDeque<Entry>) -> Vec<Entry> {
        let mut evicted = Vec::new();

        while entries.len() > self.max_models {
            evicted.extend(entries.pop_back());
        }

        if self.max_memory_bytes > 0 {
            let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
            // The newest entry stays even if it alone exceeds the budget.
            while entries.len() > 1 && total > self.max_memory_bytes {
                if let Some(entry) = entries.pop_back() {
                    total -= entry.size_bytes;
                    evicted.push(entry);
                }
            }
        }

        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hub::MockModelFetcher;
    use inference_engine::scripted::ScriptedLoader;
    use std::io::Write;
    use std::path::PathBuf;

    struct Fixture {
        _files: Vec<tempfile::NamedTempFile>,
        sources: Vec<ModelSourceSpec>,
    }

    fn fixture(count: usize) -> Fixture {
        let files: Vec<_> = (0..count)
            .map(|_| {
                let mut f = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
                f.write_all(b"GGUF").unwrap();
                f
            })
            .collect();
        let sources = files
            .iter()
            .map(|f| ModelSourceSpec::Local {
                path: PathBuf::from(f.path()),
            })
            .collect();
        Fixture {
            _files: files,
            sources,
        }
    }

    fn cache(loader: &ScriptedLoader, max_models: usize, max_memory_mb: u64) -> ModelCache {
        let resolver = ModelResolver::new(Arc::new(loader.clone()), Arc::new(MockModelFetcher::new()));
        ModelCache::new(
            resolver,
            &CacheConfig {
                max_models,
                max_memory_mb,
            },
        )
    }

    #[tokio::test]
    async fn test_hit_reuses_loaded_model() {
        let fx = fixture(1);
        let loader = ScriptedLoader::new("Hi");
        let cache = cache(&loader, 2, 0);

        let a = cache.checkout(&fx.sources[0], LoadParams::default()).await.unwrap();
        let b = cache.checkout(&fx.sources[0], LoadParams::default()).await.unwrap();
        assert_eq!(loader.load_count(), 1);
        assert_eq!(loader.live_models(), 1);
        drop((a, b));
        assert_eq!(loader.live_models(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_load_params_are_part_of_key() {
        let fx = fixture(1);
        let loader = ScriptedLoader::new("Hi");
        let cache = cache(&loader, 2, 0);

        let wide = LoadParams {
            context_size: 4096,
            ..LoadParams::default()
        };
        cache.checkout(&fx.sources[0], LoadParams::default()).await.unwrap();
        cache.checkout(&fx.sources[0], wide).await.unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let fx = fixture(3);
        let loader = ScriptedLoader::new("Hi");
        let cache = cache(&loader, 2, 0);
        let params = LoadParams::default();

        cache.checkout(&fx.sources[0], params).await.unwrap();
        cache.checkout(&fx.sources[1], params).await.unwrap();
        // Touch 0 so 1 becomes least recently used.
        cache.checkout(&fx.sources[0], params).await.unwrap();
        cache.checkout(&fx.sources[2], params).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(loader.live_models(), 2);
        assert_eq!(loader.load_count(), 3);

        cache.checkout(&fx.sources[0], params).await.unwrap();
        assert_eq!(loader.load_count(), 3);
        cache.checkout(&fx.sources[1], params).await.unwrap();
        assert_eq!(loader.load_count(), 4);
    }

    #[tokio::test]
    async fn test_memory_budget() {
        let fx = fixture(2);
        let loader = ScriptedLoader::new("Hi").with_size_bytes(600 * 1024 * 1024);
        let cache = cache(&loader, 4, 1000);

        cache.checkout(&fx.sources[0], LoadParams::default()).await.unwrap();
        cache.checkout(&fx.sources[1], LoadParams::default()).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(loader.live_models(), 1);
    }

    #[tokio::test]
    async fn test_evicted_model_lives_while_leased() {
        let fx = fixture(2);
        let loader = ScriptedLoader::new("Hi");
        let cache = cache(&loader, 1, 0);

        let lease = cache.checkout(&fx.sources[0], LoadParams::default()).await.unwrap();
        cache.checkout(&fx.sources[1], LoadParams::default()).await.unwrap();
        assert_eq!(loader.live_models(), 2);
        assert_eq!(lease.model().token_count("Say hi").unwrap(), 3);

        drop(lease);
        assert_eq!(loader.live_models(), 1);
        cache.clear();
        assert_eq!(loader.live_models(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_cache_frees_per_request() {
        let fx = fixture(1);
        let loader = ScriptedLoader::new("Hi");
        let cache = cache(&loader, 0, 0);

        let lease = cache.checkout(&fx.sources[0], LoadParams::default()).await.unwrap();
        assert_eq!(loader.live_models(), 1);
        assert!(cache.is_empty());
        drop(lease);
        assert_eq!(loader.live_models(), 0);

        cache.checkout(&fx.sources[0], LoadParams::default()).await.unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        let fx = fixture(1);
        let loader = ScriptedLoader::new("Hi");
        let cache = Arc::new(cache(&loader, 1, 0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let source = fx.sources[0].clone();
                tokio::spawn(async move { cache.checkout(&source, LoadParams::default()).await.is_ok() })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(loader.load_count(), 1);
    }
}
