//! On-disk image cache keyed by seed.
//!
//! A file at `{dir}/{seed}.png` means the image for that seed has been fully
//! generated. Files only ever appear there through an atomic rename, and
//! writers of the same seed are serialized by [`ImageCache::lock`].

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, anyhow};
use log::debug;
use tempfile::{Builder, NamedTempFile};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

pub type SeedGuard = OwnedMutexGuard<()>;

#[cfg(unix)]
const CACHE_FILE_MODE: u32 = 0o644;

#[derive(Debug)]
pub struct ImageCache {
    dir: PathBuf,
    locks: Mutex<HashMap<u32, Arc<AsyncMutex<()>>>>,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output dir {}", dir.display()))?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn filename(key: impl std::fmt::Display) -> String {
        format!("{key}.png")
    }

    pub fn path_for(&self, key: impl std::fmt::Display) -> PathBuf {
        self.dir.join(Self::filename(key))
    }

    pub fn lookup(&self, seed: u32) -> Option<PathBuf> {
        let path = self.path_for(seed);
        path.is_file().then_some(path)
    }

    pub async fn read(&self, seed: u32) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.lookup(seed) else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read cached image {}", path.display()))?;
        Ok(Some(bytes))
    }

    /// Waits for exclusive access to `seed`.
    pub async fn lock(&self, seed: u32) -> SeedGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(seed).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn new_job_id() -> String {
        Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    /// A PNG temp file inside the cache directory, removed on drop unless
    /// committed.
    pub fn temp_png(&self, prefix: &str) -> Result<NamedTempFile> {
        Builder::new()
            .prefix(prefix)
            .suffix(".png")
            .tempfile_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))
    }

    /// Atomically moves `file` to its final location for `key`.
    ///
    /// Committed files are readable by other users, as static files are
    /// often served by a separate process.
    pub fn commit(&self, file: NamedTempFile, key: impl std::fmt::Display) -> Result<PathBuf> {
        let path = self.path_for(key);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(file.path(), fs::Permissions::from_mode(CACHE_FILE_MODE))
                .with_context(|| format!("Failed to set permissions on {}", file.path().display()))?;
        }
        file.persist(&path)
            .map_err(|e| anyhow!(e.error))
            .with_context(|| format!("Failed to store {}", path.display()))?;
        debug!("Committed {}", path.display());
        Ok(path)
    }
}
