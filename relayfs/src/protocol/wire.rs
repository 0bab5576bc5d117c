//! Control channel framing.
//!
//! # Frame Format
//!
//! ```text
//! +-----------+----------+
//! |  length   | payload  |
//! | (4 bytes) | (N bytes)|
//! +-----------+----------+
//! ```
//!
//! - Length is a big-endian u32 specifying the payload size
//! - Payload is a bincode-serialized [`ControlMessage`]

use super::ControlMessage;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::task::{Context, Poll};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Maximum frame payload (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub fn encode(msg: &ControlMessage) -> Result<Bytes> {
    let payload =
        bincode::serialize(msg).map_err(|e| Error::Protocol(format!("encode failed: {e}")))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }
    Ok(Bytes::from(payload))
}

pub fn decode(data: &[u8]) -> Result<ControlMessage> {
    bincode::deserialize(data).map_err(|e| Error::Protocol(format!("decode failed: {e}")))
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// One end of the private manager/worker channel. Each frame carries exactly
/// one message.
pub struct ControlChannel {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl ControlChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, codec()),
        }
    }

    /// Adopt a std socket (inherited descriptor, or one end of a pair handed
    /// to another thread). Must be called inside a runtime.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Connected (manager, worker) pair.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let frame = encode(msg)?;
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Next message; `None` once the peer has closed the channel.
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(decode(&frame?)?)),
            None => Ok(None),
        }
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<ControlMessage>>> {
        self.framed.poll_next_unpin(cx).map(|frame| {
            frame.map(|frame| match frame {
                Ok(buf) => decode(&buf),
                Err(e) => Err(Error::Io(e)),
            })
        })
    }

    /// Send one request and wait for its reply.
    pub async fn request(&mut self, msg: &ControlMessage) -> Result<ControlMessage> {
        self.send(msg).await?;
        self.recv().await?.ok_or_else(|| {
            Error::WorkerGone(format!("channel closed awaiting reply to {}", msg.name()))
        })
    }
}
