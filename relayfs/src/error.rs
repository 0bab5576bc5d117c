//! Error taxonomy shared by the cache, the worker and the manager.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Remote object is missing or was deleted.
    #[error("not found: {0}")]
    NotFound(String),

    /// Declared size disagrees with the cached bytes; the caller must reopen.
    #[error("inconsistent data: {0}")]
    Inconsistent(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("is a directory: {0}")]
    IsDir(String),

    #[error("not a directory: {0}")]
    NotDir(String),

    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("download worker is gone: {0}")]
    WorkerGone(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// errno reported to the filesystem callback layer.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::Inconsistent(_) => libc::ECANCELED,
            Error::Protocol(_) => libc::EPROTO,
            Error::Transient(_) => libc::EAGAIN,
            Error::Backend(_) | Error::WorkerGone(_) => libc::EIO,
            Error::Busy(_) => libc::EBUSY,
            Error::IsDir(_) => libc::EISDIR,
            Error::NotDir(_) => libc::ENOTDIR,
            Error::ReadOnly(_) => libc::EROFS,
            Error::BadHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Errors reported by a [`RemoteBackend`](crate::backend::RemoteBackend).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Other(String),
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(path) => Error::NotFound(path),
            BackendError::Transient(msg) => Error::Transient(msg),
            BackendError::Other(msg) => Error::Backend(msg),
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => BackendError::NotFound(err.to_string()),
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::WouldBlock => BackendError::Transient(err.to_string()),
            _ => BackendError::Other(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteErrorKind {
    NotFound,
    Inconsistent,
    Protocol,
    Transient,
    Backend,
    Io,
}

/// Error carried over the control channel in place of a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::NotFound(_) => RemoteErrorKind::NotFound,
            Error::Inconsistent(_) => RemoteErrorKind::Inconsistent,
            Error::Protocol(_) => RemoteErrorKind::Protocol,
            Error::Transient(_) => RemoteErrorKind::Transient,
            Error::Io(_) => RemoteErrorKind::Io,
            _ => RemoteErrorKind::Backend,
        };
        let message = match err {
            Error::NotFound(msg)
            | Error::Inconsistent(msg)
            | Error::Protocol(msg)
            | Error::Transient(msg)
            | Error::Backend(msg) => msg.clone(),
            other => other.to_string(),
        };
        RemoteError { kind, message }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::NotFound => Error::NotFound(err.message),
            RemoteErrorKind::Inconsistent => Error::Inconsistent(err.message),
            RemoteErrorKind::Protocol => Error::Protocol(err.message),
            RemoteErrorKind::Transient => Error::Transient(err.message),
            RemoteErrorKind::Backend => Error::Backend(err.message),
            RemoteErrorKind::Io => Error::Io(io::Error::other(err.message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_keeps_not_found() {
        let err = Error::NotFound("/missing.txt".into());
        let remote = RemoteError::from(&err);
        assert_eq!(remote.kind, RemoteErrorKind::NotFound);
        assert_eq!(remote.message, "/missing.txt");

        match Error::from(remote) {
            Error::NotFound(path) => assert_eq!(path, "/missing.txt"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::Inconsistent("x".into()).errno(), libc::ECANCELED);
        assert_eq!(Error::BadHandle(3).errno(), libc::EBADF);
        assert_eq!(Error::ReadOnly("x".into()).errno(), libc::EROFS);
    }

    #[test]
    fn test_backend_io_error_classification() {
        let nf = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(BackendError::from(nf), BackendError::NotFound(_)));
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(BackendError::from(reset), BackendError::Transient(_)));
    }
}
