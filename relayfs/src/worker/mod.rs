//! Download worker
//!
//! A single-threaded reactor that owns the data cache. Each turn polls, in
//! order:
//! - the control channel (so shutdown and new opens are never starved),
//! - remote read sources still being opened for download requests,
//! - every registered fetch source, one bounded chunk each, starting from a
//!   rotating position,
//! - every relay that is waiting for its client, armed, or still holding
//!   unsent bytes.
//!
//! Relays are keyed by the loopback endpoint they listen on; that endpoint
//! is also what the manager names when it closes one.
pub mod relay;

pub use relay::{ReadError, Service, StreamRelay};

use crate::backend::{ReadSource, RemoteBackend};
use crate::cache::data::FetchProgress;
use crate::cache::{Claim, DataCache, EntryId};
use crate::config::DownloadConfig;
use crate::error::{BackendError, Error, RemoteError, RemoteErrorKind, Result};
use crate::protocol::{ControlChannel, ControlMessage};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashMap;
use std::future::{Future, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, instrument, warn};

/// What woke the reactor up with work for the async half of the loop.
enum Event {
    Control(Option<Result<ControlMessage>>),
    Opened {
        path: String,
        size: u64,
        source: std::result::Result<ReadSource, BackendError>,
    },
}

type OpenSource = Pin<Box<dyn Future<Output = Event> + Send>>;

pub struct Worker {
    control: ControlChannel,
    backend: Arc<dyn RemoteBackend>,
    data: DataCache,
    relays: HashMap<SocketAddr, StreamRelay>,
    opening: FuturesUnordered<OpenSource>,
    config: DownloadConfig,
    scratch: Vec<u8>,
    next_fetch: usize,
}

impl Worker {
    pub fn new(
        control: ControlChannel,
        backend: Arc<dyn RemoteBackend>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            control,
            backend,
            data: DataCache::new(),
            relays: HashMap::new(),
            opening: FuturesUnordered::new(),
            scratch: vec![0u8; config.chunk_size],
            config,
            next_fetch: 0,
        }
    }

    /// Serve until a shutdown request arrives or the manager hangs up.
    pub async fn run(mut self) -> Result<()> {
        info!(chunk_size = self.config.chunk_size, "download worker started");
        while self.step().await? {}
        info!(relays = self.relays.len(), entries = self.data.len(), "download worker stopped");
        Ok(())
    }

    /// Run reactor turns until an event needs an answer, then answer it.
    /// Returns false when the loop must stop.
    async fn step(&mut self) -> Result<bool> {
        match poll_fn(|cx| self.poll_turn(cx)).await {
            Event::Control(None) => {
                info!("control channel closed, download worker exiting");
                Ok(false)
            }
            Event::Control(Some(Ok(msg))) => self.handle(msg).await,
            Event::Control(Some(Err(Error::Protocol(reason)))) => {
                warn!(%reason, "undecodable control message");
                self.reply_error(RemoteErrorKind::Protocol, reason).await?;
                Ok(true)
            }
            Event::Control(Some(Err(e))) => Err(e),
            Event::Opened { path, size, source } => {
                self.finish_open(path, size, source).await?;
                Ok(true)
            }
        }
    }

    /// One reactor turn. Resolves only when a control message (or EOF) or
    /// an opened source is available; data work is done in place.
    fn poll_turn(&mut self, cx: &mut Context<'_>) -> Poll<Event> {
        if let Poll::Ready(msg) = self.control.poll_recv(cx) {
            return Poll::Ready(Event::Control(msg));
        }
        if !self.opening.is_empty() {
            if let Poll::Ready(Some(opened)) = self.opening.poll_next_unpin(cx) {
                return Poll::Ready(opened);
            }
        }

        let mut progressed = false;

        let fetching = self.data.registered();
        if !fetching.is_empty() {
            let start = self.next_fetch % fetching.len();
            self.next_fetch = self.next_fetch.wrapping_add(1);
            for &id in fetching[start..].iter().chain(&fetching[..start]) {
                if let Poll::Ready(progress) = self.data.poll_fetch(id, cx, &mut self.scratch) {
                    if let FetchProgress::Failed(e) = &progress {
                        debug!(%id, error = %e, "cancelling relays of failed fetch");
                    }
                    arm_relays(&mut self.relays, id);
                    progressed = true;
                }
            }
        }

        let mut expired = Vec::new();
        for (endpoint, relay) in self.relays.iter_mut() {
            let entry = self.data.entry(relay.entry());
            match relay.poll_service(cx, entry, self.config.chunk_size) {
                Service::Idle => {}
                Service::Expired => expired.push(*endpoint),
                Service::Progress | Service::Finished | Service::Cancelled => progressed = true,
            }
        }
        for endpoint in expired {
            if let Some(relay) = self.relays.remove(&endpoint) {
                self.data.detach(relay.entry());
            }
        }

        if progressed {
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }

    /// Dispatch one control message. Returns false when the loop must stop.
    async fn handle(&mut self, msg: ControlMessage) -> Result<bool> {
        match msg {
            ControlMessage::DownloadShutdownRequest => {
                info!("shutdown requested");
                return Ok(false);
            }
            ControlMessage::DownloadRequest {
                path,
                expected_size,
            } => self.handle_download(path, expected_size).await?,
            ControlMessage::DownloadCloseRequest { endpoint } => {
                self.handle_close(endpoint).await?
            }
            other => {
                warn!(message = other.name(), "response sent to the worker");
                self.reply_error(
                    RemoteErrorKind::Protocol,
                    format!("unexpected {} from manager", other.name()),
                )
                .await?;
            }
        }
        Ok(true)
    }

    /// Answer at once when the entry is cached; otherwise open the remote
    /// source off the reactor and answer from [`finish_open`](Self::finish_open).
    #[instrument(level = "debug", skip(self))]
    async fn handle_download(&mut self, path: String, expected_size: u64) -> Result<()> {
        match self.data.claim(&path, expected_size) {
            Claim::Ready(id) => self.start_relay(&path, id).await,
            Claim::Fetch => {
                debug!(%path, "opening remote read source");
                let backend = self.backend.clone();
                self.opening.push(Box::pin(async move {
                    let source = backend.open_read_stream(&path).await;
                    Event::Opened {
                        path,
                        size: expected_size,
                        source,
                    }
                }));
                Ok(())
            }
        }
    }

    async fn finish_open(
        &mut self,
        path: String,
        size: u64,
        source: std::result::Result<ReadSource, BackendError>,
    ) -> Result<()> {
        match source {
            Ok(source) => {
                let id = self.data.insert(&path, size, Some(source));
                self.start_relay(&path, id).await
            }
            Err(e) => {
                let e = Error::from(e);
                warn!(%path, error = %e, "download request failed");
                self.control.send(&ControlMessage::Error(RemoteError::from(&e))).await
            }
        }
    }

    /// Bind a relay over `id`, tell the manager where it listens, and leave
    /// the accept to the reactor.
    async fn start_relay(&mut self, path: &str, id: EntryId) -> Result<()> {
        let mut relay = match StreamRelay::bind(path, id) {
            Ok(relay) => relay,
            Err(e) => {
                let e = Error::from(e);
                warn!(%path, error = %e, "could not bind relay");
                return self.control.send(&ControlMessage::Error(RemoteError::from(&e))).await;
            }
        };

        let endpoint = relay.prepare_response();
        self.control
            .send(&ControlMessage::DownloadResponse { endpoint })
            .await?;
        self.data.attach(id);
        relay.start_accept(self.config.accept_timeout());
        debug!(%path, %endpoint, entry = %id, "relay listening");
        self.relays.insert(endpoint, relay);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn handle_close(&mut self, endpoint: SocketAddr) -> Result<()> {
        self.control
            .send(&ControlMessage::DownloadCloseResponse)
            .await?;
        match self.relays.remove(&endpoint) {
            Some(relay) => {
                let id = relay.entry();
                debug!(path = relay.path(), delivered = relay.cursor(), "relay closed");
                drop(relay);
                self.data.detach(id);
            }
            None => warn!(%endpoint, "close request for unknown relay"),
        }
        Ok(())
    }

    async fn reply_error(&mut self, kind: RemoteErrorKind, message: String) -> Result<()> {
        self.control
            .send(&ControlMessage::Error(RemoteError::new(kind, message)))
            .await
    }
}

fn arm_relays(relays: &mut HashMap<SocketAddr, StreamRelay>, id: EntryId) {
    for relay in relays.values_mut().filter(|r| r.entry() == id) {
        relay.arm();
    }
}

/// Adopt the control socket a parent process left open at `fd`.
pub fn control_from_fd(fd: RawFd) -> io::Result<ControlChannel> {
    // reject descriptors that are not open before taking ownership
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).map_err(io::Error::from)?;
    // SAFETY: the descriptor is open and was handed to this process for its
    // exclusive use; nothing else in the process refers to it.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    ControlChannel::from_std(stream)
}
