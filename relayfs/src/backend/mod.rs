//! Remote storage adapters
//!
//! Submodules:
//! - `localfs`: a local directory posing as the remote store
//! - `memory`: in-memory objects with version tokens, for tests and demos
//! - `s3`: S3-compatible adapter
//!
//! Every adapter answers two questions: what does the object at `path` look
//! like right now (with a cheap "not modified" shortcut when the caller
//! already holds the current change token), and give me its bytes as a
//! sequential, pollable source.
pub mod localfs;
pub mod memory;
pub mod s3;

use crate::config::BackendConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Sequential byte source for one remote object.
pub type ReadSource = Pin<Box<dyn AsyncRead + Send>>;

/// Snapshot of a remote object. Directory snapshots carry their immediate
/// children (shallow, `contents` unset) when fetched directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub path: String,
    pub is_dir: bool,
    pub bytes: u64,
    /// Opaque change token; `None` when the backend did not supply one.
    pub hash: Option<String>,
    pub contents: Option<Vec<Metadata>>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Metadata {
    pub fn file(path: impl Into<String>, bytes: u64, hash: Option<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            bytes,
            hash,
            contents: None,
            is_deleted: false,
        }
    }

    pub fn dir(path: impl Into<String>, hash: Option<String>, contents: Option<Vec<Metadata>>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            bytes: 0,
            hash,
            contents,
            is_deleted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataReply {
    Modified(Metadata),
    /// The object still matches the change token the caller supplied.
    NotModified,
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Conditional metadata read keyed by a previously observed `hash`.
    async fn metadata(&self, path: &str, hash: Option<&str>)
    -> Result<MetadataReply, BackendError>;

    async fn open_read_stream(&self, path: &str) -> Result<ReadSource, BackendError>;
}

/// Construct the backend named by the configuration.
pub async fn build_backend(config: &BackendConfig) -> Arc<dyn RemoteBackend> {
    match config {
        BackendConfig::Localfs { root } => Arc::new(localfs::LocalFsBackend::new(root)),
        BackendConfig::S3(s3_config) => Arc::new(s3::S3Backend::new(s3_config).await),
        BackendConfig::Memory => Arc::new(memory::MemoryBackend::new()),
    }
}

/// SHA-256 hex digest over the given parts, used for synthesized change tokens.
pub(crate) fn digest_token<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
