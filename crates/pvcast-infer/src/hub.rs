//! Model hub downloader used on local cache misses.

use std::path::{Path, PathBuf};

use tracing::info;

use pvcast_core::{Error, ModelKey, Result};

/// Directory of a model inside a cache or mirror root.
/// Repository-style ids (`org/name`) are flattened to `org--name`.
pub fn model_dir(root: &Path, key: &ModelKey) -> PathBuf {
    root.join(key.id.replace('/', "--")).join(&key.version)
}

/// Something that can place model weights into the local cache.
pub trait ModelHub: Send + Sync {
    /// Fetch `key` and return the local directory holding `model.json`.
    fn download(&self, key: &ModelKey) -> Result<PathBuf>;
}

/// Hub backed by a mirror directory with the same layout as the cache.
pub struct DirectoryHub {
    mirror: PathBuf,
    cache_dir: PathBuf,
}

impl DirectoryHub {
    pub fn new(mirror: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            mirror: mirror.into(),
            cache_dir: cache_dir.into(),
        }
    }
}

impl ModelHub for DirectoryHub {
    fn download(&self, key: &ModelKey) -> Result<PathBuf> {
        let source = model_dir(&self.mirror, key);
        if !source.join("model.json").exists() {
            return Err(Error::ModelUnavailable(format!(
                "{} not found in hub mirror {}",
                key,
                self.mirror.display()
            )));
        }

        let dest = model_dir(&self.cache_dir, key);
        std::fs::create_dir_all(&dest)?;
        for entry in std::fs::read_dir(&source)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
        }
        info!("Downloaded {} into {}", key, dest.display());
        Ok(dest)
    }
}
