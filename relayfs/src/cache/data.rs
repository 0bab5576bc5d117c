//! Worker-owned byte cache.
//!
//! Entries live in a slab and are addressed by [`EntryId`]; a path index
//! points at the current entry for each path. Relays hold ids, never
//! references, so an entry that is superseded (dirty, re-requested) stays
//! alive for the relays still attached to it and is dropped with the last
//! of them.

use crate::backend::ReadSource;
#[cfg(test)]
use crate::backend::RemoteBackend;
#[cfg(test)]
use crate::error::Result;
use slab::Slab;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::task::{Context, Poll};
use tokio::io::ReadBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) usize);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct DataCacheEntry {
    path: String,
    size: u64,
    buffer: Vec<u8>,
    is_cached: bool,
    dirty: bool,
    source: Option<ReadSource>,
    /// Whether the source is in the reactor's input set.
    registered: bool,
    refs: usize,
}

impl fmt::Debug for DataCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCacheEntry")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("len", &self.buffer.len())
            .field("is_cached", &self.is_cached)
            .field("dirty", &self.dirty)
            .field("fetching", &self.source.is_some())
            .field("refs", &self.refs)
            .finish()
    }
}

impl DataCacheEntry {
    fn new(path: &str, size: u64, source: Option<ReadSource>) -> Self {
        Self {
            path: path.to_string(),
            size,
            buffer: Vec::new(),
            is_cached: source.is_none(),
            dirty: false,
            registered: source.is_some(),
            source,
            refs: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declared total length.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes fetched so far.
    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_cached(&self) -> bool {
        self.is_cached
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.registered && self.source.is_some()
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    /// Up to `max` buffered bytes starting at `offset`.
    pub fn slice(&self, offset: u64, max: usize) -> &[u8] {
        let start = (offset as usize).min(self.buffer.len());
        let end = start.saturating_add(max).min(self.buffer.len());
        &self.buffer[start..end]
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn drop_source(&mut self) {
        self.source = None;
        self.registered = false;
    }

    fn append(&mut self, chunk: &[u8]) {
        let room = self.size.saturating_sub(self.len()) as usize;
        if chunk.len() > room {
            warn!(
                path = %self.path,
                size = self.size,
                received = self.len() + chunk.len() as u64,
                "remote object larger than declared size"
            );
            self.buffer.extend_from_slice(&chunk[..room]);
            self.dirty = true;
            self.drop_source();
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    fn complete(&mut self) {
        self.drop_source();
        if self.len() != self.size {
            warn!(
                path = %self.path,
                size = self.size,
                received = self.len(),
                "remote object shorter than declared size"
            );
            self.dirty = true;
            return;
        }
        self.is_cached = true;
    }

    fn fail(&mut self, err: &io::Error) {
        warn!(path = %self.path, error = %err, received = self.len(), "background fetch failed");
        self.drop_source();
        self.dirty = true;
    }
}

/// Answer of [`DataCache::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Ready(EntryId),
    /// Not cached; the remote read source has to be opened first.
    Fetch,
}

/// Outcome of one pump of a fetch source.
#[derive(Debug)]
pub enum FetchProgress {
    Chunk(usize),
    Complete,
    Failed(io::Error),
}

#[derive(Default)]
pub struct DataCache {
    entries: Slab<DataCacheEntry>,
    index: HashMap<String, EntryId>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current entry for `path` without creating one.
    pub fn lookup(&self, path: &str) -> Option<EntryId> {
        self.index.get(path).copied()
    }

    /// Entry for `path` with declared length `size`, if one can be served
    /// without touching the remote store.
    ///
    /// A hit with a different size marks the entry dirty and still returns
    /// it. A hit on an entry that is already dirty is unindexed so a fresh
    /// one can replace it. An empty object needs no fetch and is created on
    /// the spot. Anything else is [`Claim::Fetch`]: the caller opens the
    /// remote read source and hands it to [`insert`](Self::insert).
    pub fn claim(&mut self, path: &str, size: u64) -> Claim {
        if let Some(id) = self.lookup(path) {
            let entry = &mut self.entries[id.0];
            if !entry.dirty {
                if entry.size != size {
                    info!(
                        path,
                        cached = entry.size,
                        requested = size,
                        "declared size changed, marking data entry dirty"
                    );
                    entry.dirty = true;
                }
                // a fetch paused by the last detach resumes on the next attach
                return Claim::Ready(id);
            }
            debug!(path, %id, "replacing dirty data entry");
            self.unindex(id);
        }
        if size == 0 {
            return Claim::Ready(self.insert(path, 0, None));
        }
        Claim::Fetch
    }

    /// New entry for `path` fed by `source`; the buffer starts empty and
    /// grows as the reactor pumps it. Replaces whatever entry the path
    /// pointed at.
    pub fn insert(&mut self, path: &str, size: u64, source: Option<ReadSource>) -> EntryId {
        if let Some(old) = self.lookup(path) {
            self.unindex(old);
        }
        let id = EntryId(self.entries.insert(DataCacheEntry::new(path, size, source)));
        self.index.insert(path.to_string(), id);
        debug!(path, size, %id, "created data entry");
        id
    }

    /// [`claim`](Self::claim), opening the source inline on a miss.
    #[cfg(test)]
    pub(crate) async fn get_entry(
        &mut self,
        backend: &dyn RemoteBackend,
        path: &str,
        size: u64,
    ) -> Result<EntryId> {
        match self.claim(path, size) {
            Claim::Ready(id) => Ok(id),
            Claim::Fetch => {
                let source = backend.open_read_stream(path).await?;
                Ok(self.insert(path, size, Some(source)))
            }
        }
    }

    pub fn entry(&self, id: EntryId) -> Option<&DataCacheEntry> {
        self.entries.get(id.0)
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut DataCacheEntry> {
        self.entries.get_mut(id.0)
    }

    /// Record a relay reading from `id`. A fetch that was paused when the
    /// last relay left is put back into the input set.
    pub fn attach(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            entry.refs += 1;
            if !entry.is_cached && entry.source.is_some() {
                entry.registered = true;
            }
        }
    }

    /// Release a relay's reference. The fetch registration goes away with
    /// the last reference; the entry itself stays cached unless it is dirty
    /// or no longer indexed.
    pub fn detach(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get_mut(id.0) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if entry.registered {
            debug!(path = %entry.path, %id, "no readers left, unregistering fetch");
            entry.registered = false;
        }
        let indexed = self.index.get(&entry.path) == Some(&id);
        if entry.dirty || !indexed {
            debug!(path = %entry.path, %id, "dropping unreferenced data entry");
            if indexed {
                self.index.remove(&entry.path);
            }
            self.entries.remove(id.0);
        }
    }

    /// Entries whose fetch source is in the input set.
    pub fn registered(&self) -> Vec<EntryId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_registered())
            .map(|(key, _)| EntryId(key))
            .collect()
    }

    /// Pull at most one chunk from the fetch source of `id` into its buffer.
    pub fn poll_fetch(
        &mut self,
        id: EntryId,
        cx: &mut Context<'_>,
        scratch: &mut [u8],
    ) -> Poll<FetchProgress> {
        let Some(entry) = self.entries.get_mut(id.0) else {
            return Poll::Pending;
        };
        let Some(source) = entry.source.as_mut() else {
            return Poll::Pending;
        };

        let mut buf = ReadBuf::new(scratch);
        match source.as_mut().poll_read(cx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                entry.complete();
                debug!(path = %entry.path, bytes = entry.len(), cached = entry.is_cached, "fetch finished");
                Poll::Ready(FetchProgress::Complete)
            }
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len();
                entry.append(buf.filled());
                Poll::Ready(FetchProgress::Chunk(n))
            }
            Poll::Ready(Err(e)) => {
                entry.fail(&e);
                Poll::Ready(FetchProgress::Failed(e))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unindex(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(id.0) else {
            return;
        };
        if self.index.get(&entry.path) == Some(&id) {
            self.index.remove(&entry.path);
        }
        if entry.refs == 0 {
            self.entries.remove(id.0);
        }
    }
}
