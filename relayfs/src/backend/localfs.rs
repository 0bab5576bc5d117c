//! Local directory backend, used to mock the remote store (implements RemoteBackend).

use super::{Metadata, MetadataReply, ReadSource, RemoteBackend, digest_token};
use crate::error::BackendError;
use crate::path;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    fn file_token(len: u64, modified: Option<SystemTime>) -> String {
        let nanos = modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        digest_token([len.to_string().as_bytes(), nanos.to_string().as_bytes()])
    }

    async fn describe(&self, remote: &str) -> Result<Metadata, BackendError> {
        let local = self.path_for(remote);
        let meta = fs::metadata(&local).await?;
        if !meta.is_dir() {
            let hash = Self::file_token(meta.len(), meta.modified().ok());
            return Ok(Metadata::file(remote, meta.len(), Some(hash)));
        }

        let mut children = Vec::new();
        let mut dir = fs::read_dir(&local).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_path = path::join(remote, &name);
            let child_meta = entry.metadata().await?;
            if child_meta.is_dir() {
                // shallow: a child directory's token needs its own listing
                children.push(Metadata::dir(child_path, None, None));
            } else {
                let hash = Self::file_token(child_meta.len(), child_meta.modified().ok());
                children.push(Metadata::file(child_path, child_meta.len(), Some(hash)));
            }
        }
        children.sort_by(|a, b| a.path.cmp(&b.path));

        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(children.len());
        for child in &children {
            parts.push(
                format!(
                    "{}:{}:{}:{}",
                    child.path,
                    child.is_dir,
                    child.bytes,
                    child.hash.as_deref().unwrap_or("")
                )
                .into_bytes(),
            );
        }
        let hash = digest_token(parts.iter().map(|p| p.as_slice()));
        Ok(Metadata::dir(remote, Some(hash), Some(children)))
    }
}

#[async_trait]
impl RemoteBackend for LocalFsBackend {
    async fn metadata(
        &self,
        path: &str,
        hash: Option<&str>,
    ) -> Result<MetadataReply, BackendError> {
        let metadata = self.describe(path).await?;
        if hash.is_some() && metadata.hash.as_deref() == hash {
            return Ok(MetadataReply::NotModified);
        }
        Ok(MetadataReply::Modified(metadata))
    }

    async fn open_read_stream(&self, path: &str) -> Result<ReadSource, BackendError> {
        let local = self.path_for(path);
        if fs::metadata(&local).await?.is_dir() {
            return Err(BackendError::Other(format!("{path} is a directory")));
        }
        let file = fs::File::open(local).await?;
        Ok(Box::pin(file))
    }
}
