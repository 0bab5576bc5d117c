mod common;

use common::manager_over;
use relayfs::Error;
use relayfs::backend::localfs::LocalFsBackend;
use relayfs::fs::{FileType, RemoteFs};
use std::sync::Arc;

fn fs_over(root: &std::path::Path) -> RemoteFs {
    let backend = Arc::new(LocalFsBackend::new(root));
    RemoteFs::new(manager_over(backend, 4096))
}

#[tokio::test]
async fn test_getattr_and_readdir_consult_cache() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/b.txt"), b"world!").unwrap();
    let fs = fs_over(dir.path());

    let attr = fs.getattr("/a.txt").await.unwrap();
    assert_eq!(attr.kind, FileType::File);
    assert_eq!(attr.size, 5);
    assert_eq!(fs.getattr("/sub").await.unwrap().kind, FileType::Dir);

    let names: Vec<_> = fs
        .readdir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", "..", "a.txt", "sub"]);

    // `sub` was only seeded by the root listing; listing it fetches it
    let sub: Vec<_> = fs
        .readdir("/sub")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(sub, vec![".", "..", "b.txt"]);

    assert!(matches!(
        fs.getattr("/missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(fs.readdir("/a.txt").await, Err(Error::NotDir(_))));
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_new_sibling_shows_after_parent_invalidation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
    let fs = fs_over(dir.path());

    assert_eq!(fs.readdir("/").await.unwrap().len(), 3);
    std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
    assert_eq!(fs.readdir("/").await.unwrap().len(), 3, "listing is cached");

    fs.manager().cache().invalidate_parent("/b.txt");
    assert_eq!(fs.readdir("/").await.unwrap().len(), 4);
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_open_read_release_through_fs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    let fs = fs_over(dir.path());

    let handle = fs.open("/a.txt", libc::O_RDONLY).await.unwrap();
    assert_eq!(fs.read("/a.txt", 3, 0, handle).await.unwrap(), b"hel");
    assert_eq!(fs.read("/a.txt", 3, 3, handle).await.unwrap(), b"lo");
    assert!(fs.read("/a.txt", 3, 5, handle).await.unwrap().is_empty());
    fs.release(handle).await.unwrap();
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_and_directory_opens_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let fs = fs_over(dir.path());

    assert!(matches!(
        fs.open("/a.txt", libc::O_WRONLY).await,
        Err(Error::ReadOnly(_))
    ));
    assert!(matches!(
        fs.open("/a.txt", libc::O_RDWR).await,
        Err(Error::ReadOnly(_))
    ));
    assert!(matches!(
        fs.open("/sub", libc::O_RDONLY).await,
        Err(Error::IsDir(_))
    ));
    assert_eq!(Error::ReadOnly("x".into()).errno(), libc::EROFS);
    fs.shutdown().await.unwrap();
}
