//! In-memory backend: local development and tests.

use super::{Metadata, MetadataReply, ReadSource, RemoteBackend};
use crate::error::BackendError;
use crate::path;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Clone, Debug)]
enum MemoryObject {
    File {
        data: Bytes,
        version: u64,
        /// Bytes served before the read source fails with a transient error.
        fail_after: Option<usize>,
    },
    Dir {
        version: u64,
    },
}

impl MemoryObject {
    fn version(&self) -> u64 {
        match self {
            MemoryObject::File { version, .. } | MemoryObject::Dir { version } => *version,
        }
    }
}

pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    next_version: AtomicU64,
    streams_opened: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert("/".to_string(), MemoryObject::Dir { version: 0 });
        Self {
            objects: Mutex::new(objects),
            next_version: AtomicU64::new(1),
            streams_opened: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
        }
    }

    // a panic while holding the lock leaves the map itself intact
    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, MemoryObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace a file, creating missing parent directories.
    pub fn put_file(&self, remote: &str, data: impl Into<Bytes>) {
        self.insert_file(remote, data.into(), None);
    }

    /// A file whose read source breaks with a transient error after
    /// `fail_after` bytes.
    pub fn put_failing_file(&self, remote: &str, data: impl Into<Bytes>, fail_after: usize) {
        self.insert_file(remote, data.into(), Some(fail_after));
    }

    fn insert_file(&self, remote: &str, data: Bytes, fail_after: Option<usize>) {
        let remote = path::normalize(remote);
        if let Some(parent) = path::parent(&remote) {
            self.mkdir(parent);
        }
        let version = self.bump();
        let mut objects = self.objects();
        objects.insert(
            remote.clone(),
            MemoryObject::File {
                data,
                version,
                fail_after,
            },
        );
        Self::touch_parent(&mut objects, &remote, version);
    }

    /// mkdir -p.
    pub fn mkdir(&self, remote: &str) {
        let remote = path::normalize(remote);
        let mut chain = vec![remote.clone()];
        let mut cur = remote.as_str();
        while let Some(parent) = path::parent(cur) {
            chain.push(parent.to_string());
            cur = parent;
        }
        let mut objects = self.objects();
        for dir in chain.into_iter().rev() {
            if objects.contains_key(&dir) {
                continue;
            }
            let version = self.bump();
            objects.insert(dir.clone(), MemoryObject::Dir { version });
            Self::touch_parent(&mut objects, &dir, version);
        }
    }

    /// Remove an object (and, for directories, everything below it).
    pub fn remove(&self, remote: &str) {
        let remote = path::normalize(remote);
        let version = self.bump();
        let mut objects = self.objects();
        let prefix = format!("{remote}/");
        objects.retain(|k, _| k != &remote && !k.starts_with(&prefix));
        Self::touch_parent(&mut objects, &remote, version);
    }

    fn touch_parent(objects: &mut BTreeMap<String, MemoryObject>, remote: &str, version: u64) {
        if let Some(parent) = path::parent(remote) {
            if let Some(MemoryObject::Dir { version: v }) = objects.get_mut(parent) {
                *v = version;
            }
        }
    }

    /// Number of read sources handed out so far.
    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    fn shallow(remote: &str, object: &MemoryObject) -> Metadata {
        let hash = Some(format!("v{}", object.version()));
        match object {
            MemoryObject::File { data, .. } => Metadata::file(remote, data.len() as u64, hash),
            MemoryObject::Dir { .. } => Metadata::dir(remote, hash, None),
        }
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn metadata(
        &self,
        remote: &str,
        hash: Option<&str>,
    ) -> Result<MetadataReply, BackendError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects();
        let object = objects
            .get(remote)
            .ok_or_else(|| BackendError::NotFound(remote.to_string()))?;
        let mut metadata = Self::shallow(remote, object);
        if hash.is_some() && metadata.hash.as_deref() == hash {
            return Ok(MetadataReply::NotModified);
        }
        if metadata.is_dir {
            let contents = objects
                .iter()
                .filter(|(k, _)| k.as_str() != "/" && path::parent(k) == Some(remote))
                .map(|(k, v)| Self::shallow(k, v))
                .collect();
            metadata.contents = Some(contents);
        }
        Ok(MetadataReply::Modified(metadata))
    }

    async fn open_read_stream(&self, remote: &str) -> Result<ReadSource, BackendError> {
        let objects = self.objects();
        match objects.get(remote) {
            Some(MemoryObject::File {
                data, fail_after, ..
            }) => {
                self.streams_opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::pin(MemoryReader {
                    data: data.clone(),
                    pos: 0,
                    fail_after: *fail_after,
                }))
            }
            Some(MemoryObject::Dir { .. }) => {
                Err(BackendError::Other(format!("{remote} is a directory")))
            }
            None => Err(BackendError::NotFound(remote.to_string())),
        }
    }
}

struct MemoryReader {
    data: Bytes,
    pos: usize,
    fail_after: Option<usize>,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let limit = self.fail_after.unwrap_or(self.data.len()).min(self.data.len());
        if self.pos >= limit && self.fail_after.is_some() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by remote",
            )));
        }
        let n = buf.remaining().min(limit - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}
