//! Shared catalog handle with a decoded-segment cache
//!
//! One `CatalogHandle` is created at process start and cloned into every
//! component. It owns the current [`Catalog`] snapshot and an LRU of decoded
//! segments. Reloading swaps the snapshot and drops the cache in one step, so
//! a query that already holds an `Arc<SegmentData>` finishes on the old data.

use super::{Catalog, DatasetSource};
use crate::error::{Error, Result};
use crate::storage::{MmapSegment, SegmentData};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cache key: source id plus the catalog generation it was decoded under
type CacheKey = (String, u64);

struct HandleInner {
    root: PathBuf,
    snapshot: RwLock<Arc<Catalog>>,
    cache: Mutex<LruCache<CacheKey, Arc<SegmentData>>>,
    generation: AtomicU64,
    loads: AtomicU64,
    hits: AtomicU64,
}

/// Cloneable handle to the dataset catalog
#[derive(Clone)]
pub struct CatalogHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for CatalogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogHandle")
            .field("root", &self.inner.root)
            .field("generation", &self.generation())
            .finish()
    }
}

/// Result of checksumming one source
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCheck {
    /// Source id
    pub id: String,
    /// Whether the checksum and every column decoded cleanly
    pub ok: bool,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of [`CatalogHandle::verify`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    /// Catalog generation that was verified
    pub generation: u64,
    /// Per-source results
    pub sources: Vec<SourceCheck>,
    /// Files that were skipped at discovery
    pub skipped: Vec<SourceCheck>,
    /// Time spent
    pub duration_ms: u64,
}

impl VerifyReport {
    /// Whether every source verified
    pub fn is_healthy(&self) -> bool {
        self.skipped.is_empty() && self.sources.iter().all(|s| s.ok)
    }
}

impl CatalogHandle {
    /// Discover the dataset under `root`
    pub fn open(root: impl Into<PathBuf>, cache_capacity: usize) -> Result<Self> {
        let root = root.into();
        let catalog = Catalog::discover(&root)?;
        info!(
            root = %root.display(),
            sources = catalog.len(),
            "Dataset catalog loaded"
        );
        Ok(Self::from_catalog(catalog, cache_capacity))
    }

    /// Wrap an already built catalog
    pub fn from_catalog(catalog: Catalog, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(HandleInner {
                root: catalog.root().to_path_buf(),
                snapshot: RwLock::new(Arc::new(catalog)),
                cache: Mutex::new(LruCache::new(capacity)),
                generation: AtomicU64::new(1),
                loads: AtomicU64::new(0),
                hits: AtomicU64::new(0),
            }),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.inner.snapshot.read().clone()
    }

    /// Dataset root
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Generation counter, bumped on every reload
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// (segment decodes, cache hits) since startup
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.inner.loads.load(Ordering::Relaxed),
            self.inner.hits.load(Ordering::Relaxed),
        )
    }

    /// Rebuild signal from the ETL: rediscover and swap the snapshot
    pub fn reload(&self) -> Result<Arc<Catalog>> {
        let catalog = Arc::new(Catalog::discover(&self.inner.root)?);
        {
            let mut snapshot = self.inner.snapshot.write();
            *snapshot = catalog.clone();
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            self.inner.cache.lock().clear();
        }
        info!(
            sources = catalog.len(),
            generation = self.generation(),
            "Dataset catalog reloaded"
        );
        Ok(catalog)
    }

    /// Decoded data of a source, from cache when possible
    ///
    /// Decoding happens outside the cache lock; two concurrent misses for the
    /// same source may both decode, and the second insert wins.
    pub fn load(&self, source: &DatasetSource) -> Result<Arc<SegmentData>> {
        let key = (source.id.clone(), self.generation());
        if let Some(data) = self.inner.cache.lock().get(&key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data.clone());
        }

        let started = Instant::now();
        let data = MmapSegment::open(&source.path)
            .and_then(|segment| segment.decode())
            .map_err(|e| {
                warn!(source = %source.id, error = %e, "Failed to load segment");
                Error::source_unavailable(&source.id, e)
            })?;
        let data = Arc::new(data);
        self.inner.loads.fetch_add(1, Ordering::Relaxed);
        debug!(
            source = %source.id,
            rows = data.row_count(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Segment decoded"
        );

        self.inner.cache.lock().put(key, data.clone());
        Ok(data)
    }

    /// Checksum and decode every source of the current snapshot
    pub fn verify(&self) -> VerifyReport {
        let started = Instant::now();
        let catalog = self.snapshot();
        let sources = catalog
            .sources()
            .iter()
            .map(|source| {
                let result = MmapSegment::open(&source.path).and_then(|s| s.decode());
                SourceCheck {
                    id: source.id.clone(),
                    ok: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }
            })
            .collect::<Vec<_>>();
        let skipped = catalog
            .skipped()
            .iter()
            .map(|(path, reason)| SourceCheck {
                id: path.display().to_string(),
                ok: false,
                error: Some(reason.clone()),
            })
            .collect::<Vec<_>>();

        let failed = sources.iter().filter(|s| !s.ok).count() + skipped.len();
        if failed > 0 {
            warn!(failed, "Catalog verification found unreadable sources");
        } else {
            info!(sources = sources.len(), "Catalog verification passed");
        }

        VerifyReport {
            generation: self.generation(),
            sources,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
