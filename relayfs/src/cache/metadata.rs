//! Metadata cache with staleness tracking.
//!
//! Entries are snapshots: they only change through an explicit [`fetch`]
//! (conditional on the stored change token) or by being replaced wholesale.
//! Sibling mutations flag the parent directory dirty with
//! [`Cache::invalidate_parent`], and the next [`Cache::get`] of a dirty entry
//! refreshes it before handing it out.
//!
//! [`fetch`]: MetadataCacheEntry::fetch

use crate::backend::{Metadata, MetadataReply, RemoteBackend};
use crate::error::{Error, Result};
use crate::path;
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque handle to an in-progress upload holding this path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadLease(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Backend said "not modified"; the previous snapshot was kept.
    Unchanged,
    /// Snapshot replaced with what the backend returned.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataCacheEntry {
    path: String,
    metadata: Metadata,
    dirty: bool,
    uploader: Option<UploadLease>,
}

impl MetadataCacheEntry {
    /// An entry that has never been fetched. It is stale until the first
    /// fetch fills it in.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            metadata: Metadata {
                path: path.clone(),
                ..Default::default()
            },
            path,
            dirty: true,
            uploader: None,
        }
    }

    pub fn with_metadata(path: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            path: path.into(),
            metadata,
            dirty: false,
            uploader: None,
        }
    }

    /// Zero-length file placeholder used while a file is being created; the
    /// real snapshot replaces it once the upload commits.
    pub fn placeholder_file(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::with_metadata(path.clone(), Metadata::file(path, 0, None))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last fetched snapshot. May be stale; check [`needs_refresh`](Self::needs_refresh).
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn needs_refresh(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn uploader(&self) -> Option<UploadLease> {
        self.uploader
    }

    pub fn set_uploader(&mut self, lease: Option<UploadLease>) {
        self.uploader = lease;
    }

    /// Conditional read keyed by the stored change token.
    ///
    /// Deleted objects fail with [`Error::NotFound`]; the caller is expected
    /// to drop the entry. Any other backend error is returned unchanged and
    /// leaves the entry as it was.
    pub async fn fetch(&mut self, backend: &dyn RemoteBackend) -> Result<FetchOutcome> {
        let prev_hash = self.metadata.hash.clone();
        match backend.metadata(&self.path, prev_hash.as_deref()).await? {
            MetadataReply::NotModified => {
                self.dirty = false;
                Ok(FetchOutcome::Unchanged)
            }
            MetadataReply::Modified(metadata) if metadata.is_deleted => {
                Err(Error::NotFound(format!("{} is deleted", self.path)))
            }
            MetadataReply::Modified(metadata) => {
                self.metadata = metadata;
                self.dirty = false;
                Ok(FetchOutcome::Replaced)
            }
        }
    }
}

/// Path-keyed registry of metadata snapshots.
pub struct Cache {
    entries: moka::sync::Cache<String, MetadataCacheEntry>,
    backend: Arc<dyn RemoteBackend>,
}

impl Cache {
    pub fn new(backend: Arc<dyn RemoteBackend>, capacity: u64) -> Self {
        Self {
            entries: moka::sync::Cache::new(capacity),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
        &self.backend
    }

    /// Current entry for `path`, fetching it on a miss and refreshing it when
    /// stale. A fetched directory seeds shallow entries for its children.
    pub async fn get(&self, path: &str) -> Result<MetadataCacheEntry> {
        if let Some(entry) = self.get_cached(path).await? {
            debug!(path, "metadata cache hit");
            return Ok(entry);
        }

        info!(path, "metadata cache miss");
        let mut entry = MetadataCacheEntry::new(path);
        entry.fetch(self.backend.as_ref()).await?;
        self.set(entry.clone());
        if entry.metadata.is_dir {
            self.seed_children(&entry);
        }
        Ok(entry)
    }

    /// Like [`get`](Self::get) but never fetches a missing path.
    pub async fn get_cached(&self, path: &str) -> Result<Option<MetadataCacheEntry>> {
        let Some(mut entry) = self.entries.get(path) else {
            return Ok(None);
        };
        if !entry.needs_refresh() {
            return Ok(Some(entry));
        }

        match entry.fetch(self.backend.as_ref()).await {
            Ok(outcome) => {
                debug!(path, ?outcome, "refreshed stale metadata");
                self.set(entry.clone());
                if outcome == FetchOutcome::Replaced && entry.metadata.is_dir {
                    self.seed_children(&entry);
                }
                Ok(Some(entry))
            }
            Err(Error::NotFound(msg)) => {
                info!(path, "remote object vanished, dropping cache entry");
                self.entries.invalidate(path);
                Err(Error::NotFound(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Directory snapshot with a full listing. Shallow entries seeded from a
    /// parent listing are fetched again to pick up their own children.
    pub async fn list(&self, path: &str) -> Result<MetadataCacheEntry> {
        let entry = self.get(path).await?;
        if !entry.metadata.is_dir {
            return Err(Error::NotDir(path.to_string()));
        }
        if entry.metadata.contents.is_some() {
            return Ok(entry);
        }

        // seeded entries carry the child's token; a conditional fetch would
        // report "not modified" without ever producing a listing
        let mut fresh = MetadataCacheEntry::new(path);
        fresh.uploader = entry.uploader;
        if let Err(e) = fresh.fetch(self.backend.as_ref()).await {
            if matches!(e, Error::NotFound(_)) {
                self.entries.invalidate(path);
            }
            return Err(e);
        }
        self.set(fresh.clone());
        self.seed_children(&fresh);
        Ok(fresh)
    }

    pub fn set(&self, entry: MetadataCacheEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove(&self, path: &str) -> Option<MetadataCacheEntry> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Flag a cached entry stale. Returns false when the path is not cached.
    pub fn mark_dirty(&self, path: &str) -> bool {
        match self.entries.get(path) {
            Some(mut entry) => {
                entry.mark_dirty();
                self.set(entry);
                true
            }
            None => false,
        }
    }

    /// Flag the parent directory of `path` stale so its listing is re-read on
    /// next access. Parents that are not cached are left alone.
    pub fn invalidate_parent(&self, path: &str) -> bool {
        match path::parent(path) {
            Some(parent) => self.mark_dirty(parent),
            None => false,
        }
    }

    fn seed_children(&self, dir: &MetadataCacheEntry) {
        let Some(contents) = &dir.metadata.contents else {
            return;
        };
        for child in contents {
            if let Some(existing) = self.entries.get(&child.path) {
                if existing.uploader.is_some() {
                    continue;
                }
            }
            debug!(path = %child.path, "seeding child entry");
            self.set(MetadataCacheEntry::with_metadata(
                child.path.clone(),
                child.clone(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn cache_with(backend: Arc<MemoryBackend>) -> Cache {
        Cache::new(backend, 1024)
    }

    #[tokio::test]
    async fn test_not_modified_keeps_contents_and_clears_dirty() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/docs/a.txt", "hello");
        let mut entry = MetadataCacheEntry::new("/docs");
        assert_eq!(
            entry.fetch(backend.as_ref()).await.unwrap(),
            FetchOutcome::Replaced
        );
        let before = entry.metadata().clone();

        entry.mark_dirty();
        assert!(entry.needs_refresh());
        assert_eq!(
            entry.fetch(backend.as_ref()).await.unwrap(),
            FetchOutcome::Unchanged
        );
        assert!(!entry.needs_refresh());
        assert_eq!(entry.metadata(), &before);
    }

    #[tokio::test]
    async fn test_fetch_deleted_object_is_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/gone.txt", "x");
        let mut entry = MetadataCacheEntry::new("/gone.txt");
        entry.fetch(backend.as_ref()).await.unwrap();
        backend.remove("/gone.txt");
        entry.mark_dirty();
        assert!(matches!(
            entry.fetch(backend.as_ref()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_seeds_children_of_directories() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/a.txt", "hello");
        backend.put_file("/sub/b.txt", "world");
        let cache = cache_with(backend.clone());

        let root = cache.get("/").await.unwrap();
        assert!(root.metadata().is_dir);
        assert!(cache.contains("/a.txt"));
        assert!(cache.contains("/sub"));

        let calls = backend.metadata_calls();
        let child = cache.get("/a.txt").await.unwrap();
        assert_eq!(child.metadata().bytes, 5);
        assert_eq!(backend.metadata_calls(), calls, "child served from seed");
    }

    #[tokio::test]
    async fn test_get_cached_does_not_fetch_misses() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/a.txt", "hello");
        let cache = cache_with(backend.clone());
        assert!(cache.get_cached("/a.txt").await.unwrap().is_none());
        assert_eq!(backend.metadata_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_parent_refreshes_listing() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/dir/a.txt", "a");
        let cache = cache_with(backend.clone());
        let dir = cache.get("/dir").await.unwrap();
        assert_eq!(dir.metadata().contents.as_ref().unwrap().len(), 1);

        backend.put_file("/dir/b.txt", "b");
        let stale = cache.get("/dir").await.unwrap();
        assert_eq!(stale.metadata().contents.as_ref().unwrap().len(), 1);

        assert!(cache.invalidate_parent("/dir/b.txt"));
        let fresh = cache.get("/dir").await.unwrap();
        assert_eq!(fresh.metadata().contents.as_ref().unwrap().len(), 2);
        assert!(cache.contains("/dir/b.txt"));

        assert!(!cache.invalidate_parent("/"));
        assert!(!cache.invalidate_parent("/uncached/x"));
    }

    #[tokio::test]
    async fn test_stale_entry_of_deleted_object_is_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/a.txt", "a");
        let cache = cache_with(backend.clone());
        cache.get("/a.txt").await.unwrap();
        backend.remove("/a.txt");
        cache.mark_dirty("/a.txt");
        assert!(matches!(cache.get("/a.txt").await, Err(Error::NotFound(_))));
        assert!(!cache.contains("/a.txt"));
    }

    #[tokio::test]
    async fn test_list_refetches_shallow_directories() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/sub/b.txt", "b");
        let cache = cache_with(backend.clone());
        cache.get("/").await.unwrap();
        let seeded = cache.get_cached("/sub").await.unwrap().unwrap();
        assert!(seeded.metadata().contents.is_none());

        let listed = cache.list("/sub").await.unwrap();
        let names: Vec<_> = listed
            .metadata()
            .contents
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.path.as_str())
            .collect();
        assert_eq!(names, vec!["/sub/b.txt"]);
        assert!(matches!(
            cache.list("/sub/b.txt").await,
            Err(Error::NotDir(_))
        ));
    }

    #[test]
    fn test_placeholder_and_uploader() {
        let mut entry = MetadataCacheEntry::placeholder_file("/new.txt");
        assert!(!entry.needs_refresh());
        assert_eq!(entry.metadata().bytes, 0);
        assert!(!entry.metadata().is_dir);
        entry.set_uploader(Some(UploadLease(7)));
        assert_eq!(entry.uploader(), Some(UploadLease(7)));
    }
}
