mod common;

use common::{manager_over, pattern, read_all};
use relayfs::Error;
use relayfs::backend::memory::MemoryBackend;
use std::sync::Arc;

#[tokio::test]
async fn test_open_read_in_order_then_eof() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/a.txt", "hello");
    let manager = manager_over(backend.clone(), 1024);

    let handle = manager.open("/a.txt").await.unwrap();
    assert_eq!(manager.read(handle, 3, 0).await.unwrap(), b"hel");
    assert_eq!(manager.read(handle, 2, 3).await.unwrap(), b"lo");
    assert!(manager.read(handle, 1, 5).await.unwrap().is_empty());

    manager.close(handle).await.unwrap();
    assert_eq!(manager.open_handles().await, 0);
    assert!(matches!(
        manager.read(handle, 1, 5).await,
        Err(Error::BadHandle(_))
    ));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_read_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/a.txt", "hello");
    let manager = manager_over(backend, 1024);

    let handle = manager.open("/a.txt").await.unwrap();
    assert!(matches!(
        manager.read(handle, 3, 1).await,
        Err(Error::Protocol(_))
    ));
    // the handle is still usable from the right offset
    assert_eq!(manager.read(handle, 5, 0).await.unwrap(), b"hello");
    manager.close(handle).await.unwrap();
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_opens_share_one_fetch() {
    let payload = pattern(64 * 1024);
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/big.bin", payload.clone());
    let manager = manager_over(backend.clone(), 1024);

    let first = manager.open("/big.bin").await.unwrap();
    let second = manager.open("/big.bin").await.unwrap();
    assert_ne!(first, second);

    let head = manager.read(first, 1000, 0).await.unwrap();
    assert_eq!(head, &payload[..1000]);
    let other = manager.read(second, 3000, 0).await.unwrap();
    assert_eq!(other, &payload[..3000]);

    // closing one reader mid-transfer leaves the other intact
    manager.close(second).await.unwrap();
    let mut rest = Vec::new();
    loop {
        let data = manager
            .read(first, 4096, 1000 + rest.len() as u64)
            .await
            .unwrap();
        if data.is_empty() {
            break;
        }
        rest.extend_from_slice(&data);
    }
    assert_eq!(rest, &payload[1000..]);
    assert_eq!(backend.streams_opened(), 1);

    manager.close(first).await.unwrap();
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_entry_is_served_from_cache() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/a.txt", "hello");
    let manager = manager_over(backend.clone(), 2);

    let handle = manager.open("/a.txt").await.unwrap();
    assert_eq!(read_all(&manager, handle, 4).await.unwrap(), b"hello");
    manager.close(handle).await.unwrap();

    let handle = manager.open("/a.txt").await.unwrap();
    assert_eq!(read_all(&manager, handle, 4).await.unwrap(), b"hello");
    manager.close(handle).await.unwrap();
    assert_eq!(backend.streams_opened(), 1);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_size_change_cancels_then_reopen_refetches() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/a.txt", "hello");
    let manager = manager_over(backend.clone(), 1024);

    let handle = manager.open("/a.txt").await.unwrap();
    assert_eq!(read_all(&manager, handle, 16).await.unwrap(), b"hello");
    manager.close(handle).await.unwrap();

    backend.put_file("/a.txt", "hello world");
    manager.cache().mark_dirty("/a.txt");

    // the worker still holds 5 bytes for this path; the new declared size
    // makes the entry inconsistent and the reader is cancelled
    let stale = manager.open("/a.txt").await.unwrap();
    assert!(matches!(
        manager.read(stale, 11, 0).await,
        Err(Error::Inconsistent(_))
    ));
    manager.close(stale).await.unwrap();

    let fresh = manager.open("/a.txt").await.unwrap();
    assert_eq!(read_all(&manager, fresh, 16).await.unwrap(), b"hello world");
    manager.close(fresh).await.unwrap();
    assert_eq!(backend.streams_opened(), 2);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fetch_failure_cancels_reader() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_failing_file("/flaky.bin", pattern(4096), 1500);
    let manager = manager_over(backend.clone(), 512);

    let handle = manager.open("/flaky.bin").await.unwrap();
    let err = read_all(&manager, handle, 1024).await.unwrap_err();
    assert!(matches!(err, Error::Inconsistent(_)), "got {err:?}");
    manager.close(handle).await.unwrap();

    // no retry behind the reader's back; a reopen starts a new fetch
    let handle = manager.open("/flaky.bin").await.unwrap();
    assert!(read_all(&manager, handle, 1024).await.is_err());
    manager.close(handle).await.unwrap();
    assert_eq!(backend.streams_opened(), 2);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_and_vanished_objects_are_not_found() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/gone.txt", "bye");
    let manager = manager_over(backend.clone(), 1024);

    assert!(matches!(
        manager.open("/nope.txt").await,
        Err(Error::NotFound(_))
    ));

    // metadata still cached, object already deleted remotely
    manager.cache().get("/gone.txt").await.unwrap();
    backend.remove("/gone.txt");
    assert!(matches!(
        manager.open("/gone.txt").await,
        Err(Error::NotFound(_))
    ));
    assert!(!manager.cache().contains("/gone.txt"));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_file_reads_eof() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/empty", "");
    let manager = manager_over(backend.clone(), 1024);

    let handle = manager.open("/empty").await.unwrap();
    assert!(manager.read(handle, 10, 0).await.unwrap().is_empty());
    manager.close(handle).await.unwrap();
    assert_eq!(backend.streams_opened(), 0);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_requests_after_shutdown_fail() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put_file("/a.txt", "hello");
    let manager = manager_over(backend, 1024);
    manager.shutdown().await.unwrap();
    assert!(matches!(
        manager.open("/a.txt").await,
        Err(Error::WorkerGone(_))
    ));
    // a second shutdown is a no-op
    manager.shutdown().await.unwrap();
}
