//! Control messages exchanged between the manager and the download worker.
pub mod wire;

pub use wire::{ControlChannel, MAX_FRAME_SIZE};

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    //request
    DownloadRequest { path: String, expected_size: u64 },
    DownloadCloseRequest { endpoint: SocketAddr },
    DownloadShutdownRequest,

    //response
    DownloadResponse { endpoint: SocketAddr },
    DownloadCloseResponse,
    /// Sent in place of a response.
    Error(RemoteError),
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::DownloadRequest { .. } => "DownloadRequest",
            ControlMessage::DownloadCloseRequest { .. } => "DownloadCloseRequest",
            ControlMessage::DownloadShutdownRequest => "DownloadShutdownRequest",
            ControlMessage::DownloadResponse { .. } => "DownloadResponse",
            ControlMessage::DownloadCloseResponse => "DownloadCloseResponse",
            ControlMessage::Error(_) => "Error",
        }
    }
}
