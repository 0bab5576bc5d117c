#![allow(dead_code)]

use relayfs::backend::RemoteBackend;
use relayfs::config::DownloadConfig;
use relayfs::{Cache, Manager};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Thread-mode manager over `backend` with a small fetch chunk so transfers
/// take several reactor turns.
pub fn manager_over(backend: Arc<dyn RemoteBackend>, chunk_size: usize) -> Manager {
    init_logging();
    let download = DownloadConfig {
        chunk_size,
        ..DownloadConfig::default()
    };
    let cache = Arc::new(Cache::new(backend, 1024));
    Manager::spawn_thread(&download, cache).expect("failed to start worker thread")
}

pub async fn read_all(manager: &Manager, handle: u64, piece: usize) -> relayfs::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let data = manager.read(handle, piece, out.len() as u64).await?;
        if data.is_empty() {
            return Ok(out);
        }
        out.extend_from_slice(&data);
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
