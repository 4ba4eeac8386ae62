//! Model registry: resolves model keys to loaded handles.
//!
//! Each registry instance owns its cache of loaded models; there is no
//! process-wide state. Loads are single-flight per key: concurrent resolves
//! of the same key wait on the first load. Only successful loads are cached;
//! a failed load is retried by the next resolve.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use pvcast_core::{Error, ModelKey, ModelTag, Result};

use crate::hub::{model_dir, ModelHub};
use crate::model::{load_artifact, ForecastModel, ModelInput, ModelSchema};

/// A model as loaded from the cache, shared by every handle that uses it.
struct LoadedModel {
    key: ModelKey,
    schema: ModelSchema,
    model: Arc<dyn ForecastModel>,
}

type LoadCell = Arc<OnceCell<Arc<LoadedModel>>>;

/// A loaded model bound to the configured name it runs under.
#[derive(Clone)]
pub struct ModelHandle {
    pub name: String,
    /// The model that actually runs.
    pub key: ModelKey,
    /// The requested model when `key` is the default fallback.
    pub fallback_for: Option<ModelKey>,
    pub schema: ModelSchema,
    model: Arc<dyn ForecastModel>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("fallback_for", &self.fallback_for)
            .field("schema", &self.schema)
            .finish()
    }
}

impl ModelHandle {
    /// Wrap an in-memory model; used by tests and embedders of the pipeline.
    pub fn from_model(
        name: impl Into<String>,
        key: ModelKey,
        schema: ModelSchema,
        model: Arc<dyn ForecastModel>,
    ) -> Self {
        Self {
            name: name.into(),
            key,
            fallback_for: None,
            schema,
            model,
        }
    }

    pub fn tag(&self) -> ModelTag {
        ModelTag {
            name: self.name.clone(),
            key: self.key.clone(),
            fallback_for: self.fallback_for.clone(),
        }
    }

    /// Replace the required-source list declared by the artifact.
    pub fn with_required_sources(mut self, required: Vec<String>) -> Self {
        self.schema.inputs.required_sources = required;
        self
    }

    pub fn forward(&self, input: &ModelInput) -> Result<ndarray::Array3<f32>> {
        self.model.forward(input)
    }
}

/// Resolves model keys against a local cache, a hub and a default model.
pub struct ModelRegistry {
    cache_dir: PathBuf,
    hub: Option<Arc<dyn ModelHub>>,
    default_model: Option<ModelKey>,
    checksums: HashMap<ModelKey, String>,
    loaded: DashMap<ModelKey, LoadCell>,
    load_count: AtomicUsize,
}

impl ModelRegistry {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            hub: None,
            default_model: None,
            checksums: HashMap::new(),
            loaded: DashMap::new(),
            load_count: AtomicUsize::new(0),
        }
    }

    pub fn with_hub(mut self, hub: Arc<dyn ModelHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_default_model(mut self, key: Option<ModelKey>) -> Self {
        self.default_model = key;
        self
    }

    /// Expect `model.json` of `key` to have this hex SHA-256.
    pub fn with_checksum(mut self, key: ModelKey, sha256: impl Into<String>) -> Self {
        self.checksums.insert(key, sha256.into().to_lowercase());
        self
    }

    /// Number of artifact loads performed (cache hits excluded).
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Resolve `key` for the model configured as `name`, falling back to the
    /// default model when its weights cannot be found.
    pub async fn resolve(&self, name: &str, key: &ModelKey) -> Result<ModelHandle> {
        let reason = match self.load(key).await {
            Ok(loaded) => return Ok(Self::bind(name, &loaded, None)),
            Err(reason) => reason,
        };

        let default = match &self.default_model {
            Some(default) if default != key => default,
            _ => return Err(Error::ModelUnavailable(format!("{}: {}", key, reason))),
        };

        warn!(
            "Model {} ({}) unavailable: {}. Falling back to default model {}",
            name, key, reason, default
        );
        let loaded = self.load(default).await.map_err(|e| {
            Error::ModelUnavailable(format!("{}: {}; default {} also failed: {}", key, reason, default, e))
        })?;
        Ok(Self::bind(name, &loaded, Some(key.clone())))
    }

    fn bind(name: &str, loaded: &LoadedModel, fallback_for: Option<ModelKey>) -> ModelHandle {
        ModelHandle {
            name: name.to_string(),
            key: loaded.key.clone(),
            fallback_for,
            schema: loaded.schema.clone(),
            model: loaded.model.clone(),
        }
    }

    async fn load(&self, key: &ModelKey) -> std::result::Result<Arc<LoadedModel>, String> {
        let cell = self
            .loaded
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(|| async {
            self.load_count.fetch_add(1, Ordering::SeqCst);
            self.load_uncached(key).await.map_err(|e| e.to_string())
        })
        .await
        .cloned()
    }

    async fn load_uncached(&self, key: &ModelKey) -> Result<Arc<LoadedModel>> {
        let cache_dir = self.cache_dir.clone();
        let hub = self.hub.clone();
        let expected = self.checksums.get(key).cloned();
        let key = key.clone();

        tokio::task::spawn_blocking(move || {
            let mut dir = model_dir(&cache_dir, &key);
            if !dir.join("model.json").exists() {
                let hub = hub.ok_or_else(|| {
                    Error::ModelUnavailable(format!("{} not in cache {}", key, cache_dir.display()))
                })?;
                dir = hub.download(&key)?;
            }

            let bytes = std::fs::read(dir.join("model.json")).map_err(|e| {
                Error::ModelUnavailable(format!("{}: {}", dir.display(), e))
            })?;
            if let Some(expected) = expected {
                let actual = hex::encode(Sha256::digest(&bytes));
                if actual != expected {
                    return Err(Error::ModelUnavailable(format!(
                        "{} checksum mismatch: expected {}, got {}",
                        key, expected, actual
                    )));
                }
            }

            let (schema, model) = load_artifact(&dir, &bytes)?;
            info!(
                "Loaded model {} ({} horizons, probabilistic={})",
                key,
                schema.outputs.horizons,
                schema.outputs.quantiles.is_some()
            );
            Ok(Arc::new(LoadedModel { key, schema, model }))
        })
        .await
        .map_err(|e| Error::Internal(format!("model load task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn write_model(root: &Path, key: &ModelKey, horizons: usize) -> String {
        let dir = model_dir(root, key);
        std::fs::create_dir_all(&dir).unwrap();
        let json = serde_json::json!({
            "kind": "linear",
            "schema": {
                "inputs": {"sources": ["ukv"]},
                "outputs": {"horizons": horizons}
            },
            "intercept": 0.2
        })
        .to_string();
        std::fs::write(dir.join("model.json"), &json).unwrap();
        hex::encode(Sha256::digest(json.as_bytes()))
    }

    #[tokio::test]
    async fn test_resolve_from_cache() {
        let cache = tempfile::tempdir().unwrap();
        let key = ModelKey::new("ocf/pvnet", "v1");
        write_model(cache.path(), &key, 16);

        let registry = ModelRegistry::new(cache.path());
        let handle = registry.resolve("pvnet_v2", &key).await.unwrap();
        assert_eq!(handle.key, key);
        assert_eq!(handle.name, "pvnet_v2");
        assert!(handle.fallback_for.is_none());
        assert_eq!(handle.schema.outputs.horizons, 16);
    }

    #[tokio::test]
    async fn test_missing_without_default_is_unavailable() {
        let cache = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(cache.path());
        let result = registry.resolve("x", &ModelKey::new("ocf/absent", "v1")).await;
        assert!(matches!(result, Err(Error::ModelUnavailable(_))));
    }

    #[tokio::test]
    async fn test_fallback_to_default_is_tagged() {
        let cache = tempfile::tempdir().unwrap();
        let default = ModelKey::new("ocf/default", "v0");
        write_model(cache.path(), &default, 8);

        let registry = ModelRegistry::new(cache.path()).with_default_model(Some(default.clone()));
        let requested = ModelKey::new("ocf/absent", "v1");
        let handle = registry.resolve("pvnet_v2", &requested).await.unwrap();

        assert_eq!(handle.key, default);
        assert_eq!(handle.fallback_for, Some(requested));
        assert!(handle.tag().to_string().contains("fallback"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let cache = tempfile::tempdir().unwrap();
        let key = ModelKey::new("ocf/pvnet", "v1");
        let good = write_model(cache.path(), &key, 4);

        let ok = ModelRegistry::new(cache.path()).with_checksum(key.clone(), good.to_uppercase());
        assert!(ok.resolve("a", &key).await.is_ok());

        let bad = ModelRegistry::new(cache.path()).with_checksum(key.clone(), "00ff");
        assert!(matches!(
            bad.resolve("a", &key).await,
            Err(Error::ModelUnavailable(_))
        ));
    }

    /// Hub that is slow, so concurrent resolves overlap with the download.
    struct SlowHub {
        mirror: PathBuf,
        cache: PathBuf,
        calls: AtomicUsize,
    }

    impl ModelHub for SlowHub {
        fn download(&self, key: &ModelKey) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            crate::hub::DirectoryHub::new(&self.mirror, &self.cache).download(key)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolves_load_once() {
        let mirror = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let key = ModelKey::new("ocf/pvnet", "v1");
        write_model(mirror.path(), &key, 4);

        let hub = Arc::new(SlowHub {
            mirror: mirror.path().to_path_buf(),
            cache: cache.path().to_path_buf(),
            calls: AtomicUsize::new(0),
        });
        let registry = ModelRegistry::new(cache.path()).with_hub(hub.clone());

        let (a, b, c) = tokio::join!(
            registry.resolve("a", &key),
            registry.resolve("b", &key),
            registry.resolve("c", &key),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(hub.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.load_count(), 1);

        // Later resolves reuse the loaded model.
        registry.resolve("d", &key).await.unwrap();
        assert_eq!(registry.load_count(), 1);
    }

    /// Hub whose first download fails.
    struct FlakyHub {
        mirror: PathBuf,
        cache: PathBuf,
        calls: AtomicUsize,
    }

    impl ModelHub for FlakyHub {
        fn download(&self, key: &ModelKey) -> Result<PathBuf> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::ModelUnavailable("hub timeout".into()));
            }
            crate::hub::DirectoryHub::new(&self.mirror, &self.cache).download(key)
        }
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let mirror = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let key = ModelKey::new("ocf/pvnet", "v1");
        write_model(mirror.path(), &key, 4);

        let hub = Arc::new(FlakyHub {
            mirror: mirror.path().to_path_buf(),
            cache: cache.path().to_path_buf(),
            calls: AtomicUsize::new(0),
        });
        let registry = ModelRegistry::new(cache.path()).with_hub(hub.clone());

        assert!(matches!(
            registry.resolve("a", &key).await,
            Err(Error::ModelUnavailable(_))
        ));
        let handle = registry.resolve("a", &key).await.unwrap();
        assert_eq!(handle.key, key);
        assert!(handle.fallback_for.is_none());
        assert_eq!(hub.calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.load_count(), 2);

        // Once loaded, the model stays cached.
        registry.resolve("b", &key).await.unwrap();
        assert_eq!(registry.load_count(), 2);
    }
}
