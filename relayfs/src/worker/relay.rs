//! Per-open relay: a one-shot loopback listener plus a sequential cursor over
//! a data cache entry.
//!
//! The relay's "has more to give" state is the `armed` flag. The reactor
//! arms a relay whenever its entry changes and services armed relays in the
//! same poll that watches the control channel and the fetch sources, so no
//! separate wakeup handle is needed. Accepting the client happens in that
//! poll too, bounded by a deadline.

use crate::cache::{DataCacheEntry, EntryId};
use bytes::{Buf, Bytes};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::Sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Nothing new buffered yet; try again once the entry grows.
    WouldBlock,
    /// The entry is dirty; its bytes can't be trusted for the declared size.
    Cancelled,
}

/// What one service pass did to a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Idle,
    Progress,
    /// Client write side shut down after the last byte.
    Finished,
    /// Client connection dropped because the entry went dirty.
    Cancelled,
    /// No client connected before the accept deadline.
    Expired,
}

pub struct StreamRelay {
    path: String,
    entry: EntryId,
    endpoint: SocketAddr,
    listener: Option<TcpListener>,
    accept_deadline: Option<Pin<Box<Sleep>>>,
    client: Option<TcpStream>,
    cursor: u64,
    armed: bool,
    /// Bytes read from the entry but not yet accepted by the client socket.
    outbox: Bytes,
    done: bool,
}

impl StreamRelay {
    /// Listen on a fresh loopback port with a backlog of one. The manager's
    /// connection is queued by the backlog until [`accept`](Self::accept).
    pub fn bind(path: &str, entry: EntryId) -> io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        let listener = socket.listen(1)?;
        let endpoint = listener.local_addr()?;
        Ok(Self {
            path: path.to_string(),
            entry,
            endpoint,
            listener: Some(listener),
            accept_deadline: None,
            client: None,
            cursor: 0,
            armed: true,
            outbox: Bytes::new(),
            done: false,
        })
    }

    /// Endpoint to hand to the manager.
    pub fn prepare_response(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn arm(&mut self) {
        if !self.done {
            self.armed = true;
        }
    }

    /// Give the manager `timeout` to connect before the relay expires.
    pub fn start_accept(&mut self, timeout: Duration) {
        self.accept_deadline = Some(Box::pin(tokio::time::sleep(timeout)));
    }

    /// Take the single client connection. The listener is closed afterwards,
    /// whether a client came or the deadline passed.
    pub fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<SocketAddr>> {
        let Some(listener) = self.listener.as_ref() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "relay already accepted",
            )));
        };
        match listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, peer))) => {
                self.listener = None;
                self.accept_deadline = None;
                if let Err(e) = stream.set_nodelay(true) {
                    return Poll::Ready(Err(e));
                }
                self.client = Some(stream);
                Poll::Ready(Ok(peer))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                let expired = self
                    .accept_deadline
                    .as_mut()
                    .is_some_and(|deadline| deadline.as_mut().poll(cx).is_ready());
                if !expired {
                    return Poll::Pending;
                }
                self.listener = None;
                self.accept_deadline = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no client connected",
                )))
            }
        }
    }

    /// Next slice of at most `max` bytes. `Ok(None)` means the cursor sits at
    /// the declared size.
    pub fn read(&mut self, entry: &DataCacheEntry, max: usize) -> Result<Option<Bytes>, ReadError> {
        if entry.is_dirty() {
            self.armed = false;
            return Err(ReadError::Cancelled);
        }
        if self.cursor == entry.size() {
            self.armed = false;
            return Ok(None);
        }
        if self.cursor >= entry.len() {
            self.armed = false;
            return Err(ReadError::WouldBlock);
        }

        let chunk = Bytes::copy_from_slice(entry.slice(self.cursor, max));
        self.cursor += chunk.len() as u64;
        // stay armed at the declared end so the next pass reports EOF
        self.armed = self.cursor < entry.len() || self.cursor == entry.size();
        Ok(Some(chunk))
    }

    /// Accept the client if it has not connected yet, push pending bytes
    /// to it and, if armed, read one more slice. Registers for write
    /// readiness when the socket is full.
    pub fn poll_service(
        &mut self,
        cx: &mut Context<'_>,
        entry: Option<&DataCacheEntry>,
        max: usize,
    ) -> Service {
        if self.done {
            return Service::Idle;
        }

        let mut progressed = false;
        if self.client.is_none() {
            if self.listener.is_none() {
                return Service::Idle;
            }
            match self.poll_accept(cx) {
                Poll::Pending => return Service::Idle,
                Poll::Ready(Ok(peer)) => {
                    debug!(path = %self.path, endpoint = %self.endpoint, %peer, entry = %self.entry, "relay connected");
                    progressed = true;
                }
                Poll::Ready(Err(e)) => {
                    warn!(path = %self.path, endpoint = %self.endpoint, error = %e, "relay was never connected");
                    self.close_client();
                    return Service::Expired;
                }
            }
        }

        match self.poll_flush_outbox(cx) {
            Poll::Pending => return Service::Idle,
            Poll::Ready(Ok(wrote)) => progressed |= wrote,
            Poll::Ready(Err(e)) => {
                warn!(path = %self.path, endpoint = %self.endpoint, error = %e, "relay client write failed");
                self.close_client();
                return Service::Cancelled;
            }
        }
        if !self.armed {
            return if progressed {
                Service::Progress
            } else {
                Service::Idle
            };
        }

        // the entry is gone only if it was dropped underneath us
        let result = match entry {
            Some(entry) => self.read(entry, max),
            None => Err(ReadError::Cancelled),
        };
        match result {
            Ok(Some(chunk)) => {
                self.outbox = chunk;
                if let Poll::Ready(Err(e)) = self.poll_flush_outbox(cx) {
                    warn!(path = %self.path, endpoint = %self.endpoint, error = %e, "relay client write failed");
                    self.close_client();
                    return Service::Cancelled;
                }
                Service::Progress
            }
            Ok(None) => {
                if let Some(client) = self.client.as_mut() {
                    if let Poll::Ready(Err(e)) = Pin::new(client).poll_shutdown(cx) {
                        debug!(path = %self.path, error = %e, "shutdown of relay client failed");
                    }
                }
                self.done = true;
                debug!(path = %self.path, endpoint = %self.endpoint, bytes = self.cursor, "relay reached end of stream");
                Service::Finished
            }
            Err(ReadError::WouldBlock) => {
                if progressed {
                    Service::Progress
                } else {
                    Service::Idle
                }
            }
            Err(ReadError::Cancelled) => {
                debug!(path = %self.path, endpoint = %self.endpoint, cursor = self.cursor, "relay cancelled, entry is dirty");
                self.close_client();
                Service::Cancelled
            }
        }
    }

    /// Ready(Ok(true)) when something was written and the outbox is now
    /// empty, Ready(Ok(false)) when it was already empty.
    fn poll_flush_outbox(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        let Some(client) = self.client.as_ref() else {
            return Poll::Ready(Ok(false));
        };
        let mut wrote = false;
        while !self.outbox.is_empty() {
            match client.poll_write_ready(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            match client.try_write(&self.outbox) {
                Ok(n) => {
                    self.outbox.advance(n);
                    wrote = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Ready(Ok(wrote))
    }

    fn close_client(&mut self) {
        self.listener = None;
        self.accept_deadline = None;
        self.client = None;
        self.outbox = Bytes::new();
        self.armed = false;
        self.done = true;
    }
}
