//! Path-based filesystem callbacks over the metadata cache and the download
//! manager. Attribute and listing calls only consult the cache; file
//! contents go through the manager's proxies.

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::path;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub size: u64,
    pub kind: FileType,
    /// Permission bits; the mount is read-only.
    pub perm: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

pub struct RemoteFs {
    cache: Arc<Cache>,
    manager: Manager,
}

impl RemoteFs {
    pub fn new(manager: Manager) -> Self {
        Self {
            cache: manager.cache().clone(),
            manager,
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub async fn getattr(&self, path: &str) -> Result<FileAttr> {
        let path = path::normalize(path);
        let entry = self.cache.get(&path).await?;
        let metadata = entry.metadata();
        Ok(if metadata.is_dir {
            FileAttr {
                size: 0,
                kind: FileType::Dir,
                perm: 0o555,
            }
        } else {
            FileAttr {
                size: metadata.bytes,
                kind: FileType::File,
                perm: 0o444,
            }
        })
    }

    /// Directory listing, `.` and `..` first.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = path::normalize(path);
        let entry = self.cache.list(&path).await?;
        let mut out = vec![
            DirEntry {
                name: ".".to_string(),
                kind: FileType::Dir,
            },
            DirEntry {
                name: "..".to_string(),
                kind: FileType::Dir,
            },
        ];
        for child in entry.metadata().contents.iter().flatten() {
            if child.is_deleted {
                continue;
            }
            out.push(DirEntry {
                name: path::basename(&child.path).to_string(),
                kind: if child.is_dir {
                    FileType::Dir
                } else {
                    FileType::File
                },
            });
        }
        Ok(out)
    }

    /// Open for reading. Any write access mode is refused.
    pub async fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let path = path::normalize(path);
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0 {
            return Err(Error::ReadOnly(path));
        }
        self.manager.open(&path).await
    }

    pub async fn read(&self, path: &str, size: usize, offset: u64, handle: u64) -> Result<Vec<u8>> {
        debug!(path, size, offset, handle, "read");
        self.manager.read(handle, size, offset).await
    }

    pub async fn release(&self, handle: u64) -> Result<()> {
        self.manager.close(handle).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.manager.shutdown().await
    }
}
