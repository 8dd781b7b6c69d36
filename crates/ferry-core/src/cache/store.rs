//! Durable, generation-stamped blob store behind the cache coordinator.
//!
//! Layout under the root:
//!
//! ```text
//! index.json        url -> entry metadata, rewritten via temp + rename
//! blobs/<sha256>-<id> one file per stored version of a url
//! tmp/              partial writes, wiped on open
//! .lock             exclusive advisory lock held for the store's lifetime
//! ```
//!
//! The index is the only source of truth for what is cached. A blob without an
//! index entry is an orphan and an entry whose blob is missing or short is dropped.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use ferry_protocol::{CacheSummary, ClearScope, EntryClass, EntryMeta};

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache directory `{}` is locked by another process", .0.display())]
    Locked(PathBuf),
    #[error("cache io on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache index: {0}")]
    Index(String),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    blob: String,
    size_bytes: u64,
    stored_at: DateTime<Utc>,
    generation: String,
    class: EntryClass,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexFile {
    generation: String,
    entries: BTreeMap<String, IndexEntry>,
}

/// What [`CacheStore::open`] had to repair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub kept: usize,
    pub stale_generation: usize,
    pub missing_blobs: usize,
    pub orphan_blobs: usize,
    pub index_rebuilt: bool,
}

pub struct CacheStore {
    root: PathBuf,
    generation: String,
    index: IndexFile,
    reconcile: ReconcileReport,
    _lock: File,
}

impl CacheStore {
    /// Open (creating if needed) the store at `root` for `generation`.
    ///
    /// Entries stamped with any other generation are evicted before the store is
    /// handed out.
    pub async fn open(root: impl Into<PathBuf>, generation: &str) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.clone(), root.join(BLOB_DIR), root.join(TMP_DIR)] {
            tokio::fs::create_dir_all(&dir).await.map_err(io_at(&dir))?;
        }
        let lock_path = root.join(LOCK_FILE);
        let lock = File::create(&lock_path).map_err(io_at(&lock_path))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(root));
        }

        let mut store = Self {
            index: IndexFile {
                generation: generation.to_string(),
                entries: BTreeMap::new(),
            },
            generation: generation.to_string(),
            reconcile: ReconcileReport::default(),
            root,
            _lock: lock,
        };
        store.reconcile().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    pub fn last_reconcile(&self) -> &ReconcileReport {
        &self.reconcile
    }

    pub async fn store(
        &mut self,
        url: &str,
        bytes: &[u8],
        class: EntryClass,
    ) -> Result<EntryMeta, StoreError> {
        let blob = blob_name(url);
        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.part", uuid::Uuid::new_v4()));
        let dest = self.blob_path(&blob);
        tokio::fs::write(&tmp, bytes).await.map_err(io_at(&tmp))?;
        if let Err(err) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io {
                path: dest,
                source: err,
            });
        }

        let entry = IndexEntry {
            blob,
            size_bytes: bytes.len() as u64,
            stored_at: Utc::now(),
            generation: self.generation.clone(),
            class,
        };
        let previous = self.index.entries.insert(url.to_string(), entry.clone());
        if let Err(err) = self.persist_index().await {
            // Until the index names it, the new blob is invisible; the old entry stays.
            match previous {
                Some(prev) => {
                    self.index.entries.insert(url.to_string(), prev);
                }
                None => {
                    self.index.entries.remove(url);
                }
            }
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(err);
        }
        if let Some(prev) = previous {
            let old = self.blob_path(&prev.blob);
            if let Err(err) = tokio::fs::remove_file(&old).await {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(target: "ferry::cache", path = %old.display(), "superseded blob removal failed: {err}");
                }
            }
        }
        debug!(target: "ferry::cache", url, size = entry.size_bytes, class = class.as_str(), "stored");
        Ok(self.meta(url, &entry))
    }

    pub async fn lookup(&mut self, url: &str) -> Result<Option<(Bytes, EntryMeta)>, StoreError> {
        let Some(entry) = self.index.entries.get(url).cloned() else {
            return Ok(None);
        };
        let path = self.blob_path(&entry.blob);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(target: "ferry::cache", url, "blob vanished; dropping entry");
                self.forget(url).await?;
                return Ok(None);
            }
            Err(err) => return Err(StoreError::Io { path, source: err }),
        };
        if bytes.len() as u64 != entry.size_bytes {
            warn!(
                target: "ferry::cache",
                url,
                expected = entry.size_bytes,
                actual = bytes.len(),
                "blob size disagrees with index; dropping entry"
            );
            self.forget(url).await?;
            return Ok(None);
        }
        Ok(Some((Bytes::from(bytes), self.meta(url, &entry))))
    }

    /// Remove entries matching `scope`; returns how many were removed.
    pub async fn clear(&mut self, scope: &ClearScope) -> Result<u64, StoreError> {
        let doomed: Vec<(String, String)> = self
            .index
            .entries
            .iter()
            .filter(|(url, e)| scope.matches(url, e.class))
            .map(|(url, e)| (url.clone(), e.blob.clone()))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        for (url, _) in &doomed {
            self.index.entries.remove(url);
        }
        self.persist_index().await?;
        for (_, blob) in &doomed {
            let path = self.blob_path(blob);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(target: "ferry::cache", path = %path.display(), "blob removal failed: {err}");
                }
            }
        }
        info!(target: "ferry::cache", removed = doomed.len(), "cache cleared");
        Ok(doomed.len() as u64)
    }

    pub fn status(&self) -> CacheSummary {
        let mut summary = CacheSummary {
            generation: self.generation.clone(),
            ..CacheSummary::default()
        };
        for entry in self.index.entries.values() {
            match entry.class {
                EntryClass::Static => summary.static_asset_count += 1,
                EntryClass::Model => summary.model_count += 1,
            }
            summary.total_bytes += entry.size_bytes;
        }
        summary
    }

    async fn reconcile(&mut self) -> Result<(), StoreError> {
        let mut report = ReconcileReport::default();
        let index_path = self.root.join(INDEX_FILE);
        let loaded = match tokio::fs::read(&index_path).await {
            Ok(raw) => match serde_json::from_slice::<IndexFile>(&raw) {
                Ok(index) => index,
                Err(err) => {
                    warn!(target: "ferry::cache", "unreadable cache index, starting empty: {err}");
                    report.index_rebuilt = true;
                    IndexFile::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => IndexFile::default(),
            Err(err) => {
                return Err(StoreError::Io {
                    path: index_path,
                    source: err,
                })
            }
        };

        let mut kept = BTreeMap::new();
        for (url, entry) in loaded.entries {
            if entry.generation != self.generation {
                report.stale_generation += 1;
                continue;
            }
            let ok = tokio::fs::metadata(self.blob_path(&entry.blob))
                .await
                .map(|m| m.len() == entry.size_bytes)
                .unwrap_or(false);
            if !ok {
                report.missing_blobs += 1;
                continue;
            }
            kept.insert(url, entry);
        }
        report.kept = kept.len();

        let referenced: HashSet<&str> = kept.values().map(|e| e.blob.as_str()).collect();
        let blob_dir = self.root.join(BLOB_DIR);
        let mut dir = tokio::fs::read_dir(&blob_dir).await.map_err(io_at(&blob_dir))?;
        while let Some(item) = dir.next_entry().await.map_err(io_at(&blob_dir))? {
            let name = item.file_name().to_string_lossy().into_owned();
            if !referenced.contains(name.as_str()) {
                report.orphan_blobs += 1;
                let _ = tokio::fs::remove_file(item.path()).await;
            }
        }
        let tmp_dir = self.root.join(TMP_DIR);
        let mut tmp = tokio::fs::read_dir(&tmp_dir).await.map_err(io_at(&tmp_dir))?;
        while let Some(item) = tmp.next_entry().await.map_err(io_at(&tmp_dir))? {
            let _ = tokio::fs::remove_file(item.path()).await;
        }

        self.index = IndexFile {
            generation: self.generation.clone(),
            entries: kept,
        };
        self.persist_index().await?;
        if report.stale_generation + report.missing_blobs + report.orphan_blobs > 0 {
            info!(
                target: "ferry::cache",
                generation = %self.generation,
                kept = report.kept,
                stale = report.stale_generation,
                missing = report.missing_blobs,
                orphans = report.orphan_blobs,
                "cache reconciled"
            );
        }
        self.reconcile = report;
        Ok(())
    }

    async fn forget(&mut self, url: &str) -> Result<(), StoreError> {
        if let Some(entry) = self.index.entries.remove(url) {
            let _ = tokio::fs::remove_file(self.blob_path(&entry.blob)).await;
            self.persist_index().await?;
        }
        Ok(())
    }

    async fn persist_index(&self) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(&self.index)
            .map_err(|e| StoreError::Index(e.to_string()))?;
        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("index-{}.json", uuid::Uuid::new_v4()));
        let dest = self.root.join(INDEX_FILE);
        tokio::fs::write(&tmp, &body).await.map_err(io_at(&tmp))?;
        if let Err(err) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io {
                path: dest,
                source: err,
            });
        }
        Ok(())
    }

    fn blob_path(&self, blob: &str) -> PathBuf {
        self.root.join(BLOB_DIR).join(blob)
    }

    fn meta(&self, url: &str, entry: &IndexEntry) -> EntryMeta {
        EntryMeta {
            url: url.to_string(),
            size_bytes: entry.size_bytes,
            stored_at: entry.stored_at,
            generation: entry.generation.clone(),
            class: entry.class,
            path: Some(self.blob_path(&entry.blob).display().to_string()),
        }
    }
}

/// A fresh blob name per store, so a replacement never overwrites the blob the
/// index currently points at.
fn blob_name(url: &str) -> String {
    format!(
        "{}-{}",
        hex::encode(Sha256::digest(url.as_bytes())),
        uuid::Uuid::new_v4().simple()
    )
}
