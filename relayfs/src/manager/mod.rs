//! Filesystem-facing side of the download subsystem.
//!
//! The manager starts the download worker, turns `open(path)` into a
//! download request plus a [`Proxy`] connected to the relay the worker set
//! up, and hands out integer handles for those proxies. The worker either
//! runs as a re-executed copy of the current binary (`worker` subcommand,
//! control socket inherited as a descriptor) or on a dedicated thread with
//! its own single-threaded runtime.
//!
//! Every control exchange runs on a task of its own. A caller that stops
//! waiting (timeout, `select!`, an interrupted syscall) cannot leave a reply
//! on the channel for the next request, and an open it abandons after the
//! relay was set up is closed again.
mod proxy;

pub use proxy::Proxy;

use crate::cache::Cache;
use crate::config::{Config, DownloadConfig, WorkerMode};
use crate::error::{Error, Result};
use crate::protocol::{ControlChannel, ControlMessage};
use crate::worker::Worker;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, instrument, warn};

enum WorkerHandle {
    Process(Child),
    Thread(JoinHandle<()>),
}

pub struct Manager {
    control: Arc<Mutex<ControlChannel>>,
    cache: Arc<Cache>,
    proxies: Mutex<HashMap<u64, Arc<Mutex<Proxy>>>>,
    next_handle: AtomicU64,
    worker: Mutex<Option<WorkerHandle>>,
    shutdown_timeout: Duration,
}

impl Manager {
    /// Start a worker in the configured mode. Process mode needs the path of
    /// the config file so the child can load the same configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &Config, config_path: Option<&Path>, cache: Arc<Cache>) -> Result<Self> {
        match (config.worker.mode, config_path) {
            (WorkerMode::Process, Some(path)) => Self::spawn_process(path, &config.download, cache),
            (WorkerMode::Process, None) => {
                warn!("no config file to hand to a worker process, running the worker on a thread");
                Self::spawn_thread(&config.download, cache)
            }
            (WorkerMode::Thread, _) => Self::spawn_thread(&config.download, cache),
        }
    }

    /// Run the worker on its own thread, sharing the cache's backend.
    pub fn spawn_thread(download: &DownloadConfig, cache: Arc<Cache>) -> Result<Self> {
        let (manager_end, worker_end) = std::os::unix::net::UnixStream::pair()?;
        let backend = cache.backend().clone();
        let worker_config = download.clone();

        let handle = std::thread::Builder::new()
            .name("relayfs-worker".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                let result = rt.block_on(async move {
                    let control = ControlChannel::from_std(worker_end)?;
                    Worker::new(control, backend, worker_config).run().await
                });
                if let Err(e) = result {
                    error!(error = %e, "download worker failed");
                }
            })?;
        info!("started download worker thread");

        let control = ControlChannel::from_std(manager_end)?;
        Ok(Self::from_parts(
            control,
            cache,
            Some(WorkerHandle::Thread(handle)),
            download.shutdown_timeout(),
        ))
    }

    /// Re-execute the current binary as `relayfs worker`, handing it one end
    /// of a socket pair as its control channel.
    pub fn spawn_process(
        config_path: &Path,
        download: &DownloadConfig,
        cache: Arc<Cache>,
    ) -> Result<Self> {
        let (manager_end, worker_end) = std::os::unix::net::UnixStream::pair()?;
        let fd = worker_end.as_raw_fd();

        let mut command = tokio::process::Command::new(std::env::current_exe()?);
        command
            .arg("worker")
            .arg("--config")
            .arg(config_path)
            .arg("--control-fd")
            .arg(fd.to_string())
            .kill_on_drop(true);
        // SAFETY: the hook only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || inherit_fd(fd));
        }
        let child = command.spawn()?;
        drop(worker_end);
        info!(pid = ?child.id(), "spawned download worker process");

        let control = ControlChannel::from_std(manager_end)?;
        Ok(Self::from_parts(
            control,
            cache,
            Some(WorkerHandle::Process(child)),
            download.shutdown_timeout(),
        ))
    }

    fn from_parts(
        control: ControlChannel,
        cache: Arc<Cache>,
        worker: Option<WorkerHandle>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            control: Arc::new(Mutex::new(control)),
            cache,
            proxies: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            worker: Mutex::new(worker),
            shutdown_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub async fn open_handles(&self) -> usize {
        self.proxies.lock().await.len()
    }

    async fn request(&self, msg: ControlMessage) -> Result<ControlMessage> {
        let control = self.control.clone();
        tokio::spawn(async move { exchange(&control, &msg).await })
            .await
            .map_err(|e| Error::WorkerGone(format!("control exchange aborted: {e}")))?
    }

    /// Open `path` for sequential reading and return its handle.
    #[instrument(level = "debug", skip(self))]
    pub async fn open(&self, path: &str) -> Result<u64> {
        let entry = self.cache.get(path).await?;
        let metadata = entry.metadata();
        if metadata.is_dir {
            return Err(Error::IsDir(path.to_string()));
        }
        if entry.uploader().is_some() {
            return Err(Error::Busy(format!("{path} is being uploaded")));
        }
        let size = metadata.bytes;

        let control = self.control.clone();
        let target = path.to_string();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let opened = connect_relay(&control, &target, size).await;
            if let Err(Ok(proxy)) = tx.send(opened) {
                let endpoint = proxy.endpoint();
                drop(proxy);
                debug!(path = %target, %endpoint, "open abandoned, releasing relay");
                let msg = ControlMessage::DownloadCloseRequest { endpoint };
                if let Err(e) = exchange(&control, &msg).await {
                    warn!(path = %target, %endpoint, error = %e, "failed to release abandoned relay");
                }
            }
        });

        let proxy = match rx.await {
            Ok(Ok(proxy)) => proxy,
            Ok(Err(err)) => {
                if matches!(err, Error::NotFound(_)) {
                    debug!(path, "worker reports object gone, dropping metadata");
                    self.cache.remove(path);
                }
                return Err(err);
            }
            Err(_) => return Err(Error::WorkerGone("open task ended without reply".into())),
        };
        let endpoint = proxy.endpoint();
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.proxies
            .lock()
            .await
            .insert(handle, Arc::new(Mutex::new(proxy)));
        info!(path, handle, %endpoint, size, "opened");
        Ok(handle)
    }

    /// Sequential read on an open handle; blocks until `size` bytes or end
    /// of file.
    pub async fn read(&self, handle: u64, size: usize, offset: u64) -> Result<Vec<u8>> {
        let proxy = self
            .proxies
            .lock()
            .await
            .get(&handle)
            .cloned()
            .ok_or(Error::BadHandle(handle))?;
        let mut proxy = proxy.lock().await;
        proxy.read(size, offset).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self, handle: u64) -> Result<()> {
        let proxy = self
            .proxies
            .lock()
            .await
            .remove(&handle)
            .ok_or(Error::BadHandle(handle))?;
        let endpoint = proxy.lock().await.endpoint();

        match self
            .request(ControlMessage::DownloadCloseRequest { endpoint })
            .await?
        {
            ControlMessage::DownloadCloseResponse => {
                debug!(handle, %endpoint, "closed");
                Ok(())
            }
            ControlMessage::Error(remote) => Err(remote.into()),
            other => Err(Error::Protocol(format!(
                "expected DownloadCloseResponse, got {}",
                other.name()
            ))),
        }
    }

    /// Ask the worker to stop and wait a bounded time for it to exit. A
    /// worker process that overstays is killed.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };
        self.proxies.lock().await.clear();

        let sent = self
            .control
            .lock()
            .await
            .send(&ControlMessage::DownloadShutdownRequest)
            .await;
        if let Err(e) = sent {
            warn!(error = %e, "could not deliver shutdown request, worker may be gone");
        }

        let timeout = self.shutdown_timeout;
        match worker {
            WorkerHandle::Process(mut child) => {
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(status) => {
                        let status = status?;
                        info!(%status, "download worker process exited");
                    }
                    Err(_) => {
                        warn!(?timeout, "download worker process did not exit, killing it");
                        child.kill().await?;
                    }
                }
            }
            WorkerHandle::Thread(handle) => {
                let joined = tokio::task::spawn_blocking(move || handle.join());
                match tokio::time::timeout(timeout, joined).await {
                    Ok(Ok(Ok(()))) => info!("download worker thread exited"),
                    Ok(Ok(Err(_))) => error!("download worker thread panicked"),
                    Ok(Err(e)) => warn!(error = %e, "failed to join download worker thread"),
                    Err(_) => warn!(?timeout, "download worker thread did not exit in time"),
                }
            }
        }
        Ok(())
    }
}

/// One request/reply round trip; the lock keeps exchanges from interleaving.
async fn exchange(control: &Mutex<ControlChannel>, msg: &ControlMessage) -> Result<ControlMessage> {
    let mut control = control.lock().await;
    control.request(msg).await.map_err(|e| match e {
        Error::Io(e) => Error::WorkerGone(e.to_string()),
        other => other,
    })
}

/// Ask the worker for a relay over `path` and connect a proxy to it.
async fn connect_relay(control: &Mutex<ControlChannel>, path: &str, size: u64) -> Result<Proxy> {
    let reply = exchange(
        control,
        &ControlMessage::DownloadRequest {
            path: path.to_string(),
            expected_size: size,
        },
    )
    .await?;
    match reply {
        ControlMessage::DownloadResponse { endpoint } => Proxy::connect(path, endpoint, size).await,
        ControlMessage::Error(remote) => Err(remote.into()),
        other => Err(Error::Protocol(format!(
            "expected DownloadResponse, got {}",
            other.name()
        ))),
    }
}

fn inherit_fd(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}
