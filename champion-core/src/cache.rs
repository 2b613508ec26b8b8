//! Memoization of champion selection results.
//!
//! Every key owns an async mutex in an in-process lock table, so concurrent callers for
//! one key wait for a single computation. With a cache directory configured, a per-key
//! lock file extends the guarantee across processes and entries are persisted as JSON.

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::persistence::{self, JsonRead};

/// When a cached value stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Freshness {
    /// The key captures every input; the entry never goes stale.
    ContentKeyed,
    /// Valid while the watched file keeps this modification time.
    ConfigModified { secs: u64, nanos: u32 },
}

impl Freshness {
    /// Marker for the current modification time of `path`.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let modified = std::fs::metadata(path)?.modified()?;
        let since = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
        Ok(Freshness::ConfigModified {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        })
    }
}

/// A stored value with its freshness marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub payload: T,
    pub freshness: Freshness,
    pub created_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn check(&self, freshness: Freshness) -> Result<(), CacheError> {
        if self.freshness == freshness {
            Ok(())
        } else {
            Err(CacheError::StaleCacheEntry {
                key: self.key.clone(),
            })
        }
    }
}

type Slot<T> = Arc<tokio::sync::Mutex<Option<CacheEntry<T>>>>;

/// Per-key memoization with at most one computation in flight per key.
pub struct SelectionCache<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    dir: Option<PathBuf>,
    enabled: bool,
}

impl<T> std::fmt::Debug for SelectionCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionCache")
            .field("dir", &self.dir)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl<T> Default for SelectionCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SelectionCache<T> {
    /// In-process cache.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            dir: None,
            enabled: true,
        }
    }

    /// Add a disk tier under `dir`.
    pub fn with_disk(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            dir: config.dir.clone(),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn slot(&self, key: &str) -> Slot<T> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    fn entry_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.json", file_stem(key)))
    }

    fn lock_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.lock", file_stem(key)))
    }
}

impl<T> SelectionCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Return the cached value for `key` if fresh, otherwise run `compute` once and
    /// store its result. Errors are returned to every waiter in turn and never cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        freshness: Freshness,
        compute: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        if !self.enabled {
            return compute().await;
        }
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.as_ref() {
            match entry.check(freshness) {
                Ok(()) => {
                    tracing::debug!(key, "Selection cache hit");
                    return Ok(entry.payload.clone());
                }
                Err(stale) => tracing::debug!(reason = %stale, "Recomputing"),
            }
        }

        let Some(dir) = self.dir.clone() else {
            let payload = compute().await?;
            *guard = Some(new_entry(key, payload.clone(), freshness));
            tracing::debug!(key, "Selection cache filled");
            return Ok(payload);
        };

        let _lock = lock_file(Self::lock_path(&dir, key)).await?;
        let path = Self::entry_path(&dir, key);
        match read_entry::<T>(path.clone()).await {
            Some(entry) if entry.check(freshness).is_ok() => {
                tracing::debug!(key, path = %path.display(), "Selection cache hit on disk");
                let payload = entry.payload.clone();
                *guard = Some(entry);
                return Ok(payload);
            }
            Some(_) => tracing::debug!(key, "Disk cache entry is stale"),
            None => {}
        }

        let payload = compute().await?;
        let entry = new_entry(key, payload.clone(), freshness);
        persist_entry(path, entry.clone()).await?;
        *guard = Some(entry);
        tracing::debug!(key, "Selection cache filled");
        Ok(payload)
    }

    /// Drop `key` from both tiers.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        *guard = None;
        if let Some(dir) = &self.dir {
            let _lock = lock_file(Self::lock_path(dir, key)).await?;
            remove_file(&Self::entry_path(dir, key))?;
        }
        tracing::debug!(key, "Selection cache entry invalidated");
        Ok(())
    }

    /// Drop every in-process entry and every persisted entry. Slots stay in the lock
    /// table so a computation already in flight keeps excluding new callers.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let slots: Vec<Slot<T>> = {
            let map = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        for slot in slots {
            *slot.lock().await = None;
        }
        if let Some(dir) = &self.dir {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return Ok(());
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "json") {
                    remove_file(&path)?;
                }
            }
        }
        Ok(())
    }
}

fn new_entry<T>(key: &str, payload: T, freshness: Freshness) -> CacheEntry<T> {
    CacheEntry {
        key: key.to_string(),
        payload,
        freshness,
        created_at: Utc::now(),
    }
}

fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn remove_file(path: &Path) -> Result<(), CacheError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::Persist {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
    }
}

/// Exclusive lock on `path`, released when the returned file is dropped.
async fn lock_file(path: PathBuf) -> Result<File, CacheError> {
    let display = path.display().to_string();
    let locked = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    })
    .await;
    match locked {
        Ok(Ok(file)) => Ok(file),
        Ok(Err(e)) => Err(CacheError::Lock {
            path: display,
            message: e.to_string(),
        }),
        Err(e) => Err(CacheError::Lock {
            path: display,
            message: e.to_string(),
        }),
    }
}

async fn read_entry<T>(path: PathBuf) -> Option<CacheEntry<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let read = tokio::task::spawn_blocking(move || persistence::read_json::<CacheEntry<T>>(&path))
        .await
        .ok()?;
    match read {
        JsonRead::Ready(entry) => Some(entry),
        JsonRead::Missing | JsonRead::Incomplete => None,
        JsonRead::Malformed(reason) => {
            tracing::warn!(reason = %reason, "Ignoring unreadable cache entry");
            None
        }
    }
}

async fn persist_entry<T>(path: PathBuf, entry: CacheEntry<T>) -> Result<(), CacheError>
where
    T: Serialize + Send + 'static,
{
    let display = path.display().to_string();
    let written = tokio::task::spawn_blocking(move || persistence::atomic_write_json(&path, &entry))
        .await
        .map_err(|e| CacheError::Persist {
            path: display.clone(),
            message: e.to_string(),
        })?;
    written.map_err(|e| CacheError::Persist {
        path: display,
        message: e.to_string(),
    })
}
