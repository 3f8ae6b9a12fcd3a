#[macro_use]
mod common;

use std::path::Path;
use std::time::Duration;

use pluvio_file::mutex::key_path;
use pluvio_file::timer::sleep;
use pluvio_file::{
    spawn, CancellationSource, FileError, FileMutex, FilesystemDriver, KeyedFileMutex,
    KeyedLockingFileMutex, LockingFileMutex, PathMetadata,
};

async fn ephemeral_mutex_removes_its_file<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let path = dir.join("ephemeral.lock");
    let mutex = FileMutex::new(driver.clone(), &path);
    let lock = mutex.acquire(None).await.unwrap();
    assert_eq!(lock.path(), path);
    assert!(path.exists());

    lock.release().await.unwrap();
    assert!(!path.exists());

    // reacquiring recreates the file
    let lock = mutex.acquire(None).await.unwrap();
    assert!(path.exists());
    lock.release().await.unwrap();
}

async fn persistent_mutex_keeps_its_file<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let path = dir.join("persistent.lock");
    let mutex = LockingFileMutex::new(driver.clone(), &path);
    for _ in 0..3 {
        let lock = mutex.acquire(None).await.unwrap();
        lock.release().await.unwrap();
        assert!(path.exists());
    }
}

async fn contender_waits_for_release<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let path = dir.join("contended.lock");
    let held = FileMutex::new(driver.clone(), &path).acquire(None).await.unwrap();

    let contender = FileMutex::new(driver.clone(), &path);
    let pending = spawn(async move { contender.acquire(None).await });
    sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());

    held.release().await.unwrap();
    let lock = pending.await.unwrap();
    assert!(path.exists());
    lock.release().await.unwrap();
    assert!(!path.exists());
}

async fn persistent_contender_waits_for_release<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let path = dir.join("persistent-contended.lock");
    let held = LockingFileMutex::new(driver.clone(), &path)
        .acquire(None)
        .await
        .unwrap();

    let contender = LockingFileMutex::new(driver.clone(), &path);
    let pending = spawn(async move { contender.acquire(None).await });
    sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());

    held.release().await.unwrap();
    pending.await.unwrap().release().await.unwrap();
}

async fn dropped_lock_is_released<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let path = dir.join("dropped.lock");
    let mutex = FileMutex::new(driver.clone(), &path);
    drop(mutex.acquire(None).await.unwrap());
    let lock = mutex.acquire(None).await.unwrap();
    lock.release().await.unwrap();
}

async fn cancelled_acquire_gives_up<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let path = dir.join("cancelled.lock");
    let held = FileMutex::new(driver.clone(), &path).acquire(None).await.unwrap();

    let source = CancellationSource::new();
    let token = source.token();
    let contender = FileMutex::new(driver.clone(), &path);
    let pending = spawn(async move { contender.acquire(Some(token)).await });
    sleep(Duration::from_millis(20)).await;
    source.cancel();

    assert!(matches!(pending.await, Err(FileError::Cancelled)));
    held.release().await.unwrap();
}

async fn keyed_mutexes_hash_their_keys<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let ephemeral = KeyedFileMutex::new(driver.clone(), dir);
    let alpha = ephemeral.acquire("alpha", None).await.unwrap();
    assert_eq!(alpha.path(), key_path(dir, "alpha"));

    // distinct keys do not contend
    let beta = ephemeral.acquire("beta", None).await.unwrap();
    assert_ne!(alpha.path(), beta.path());
    alpha.release().await.unwrap();
    beta.release().await.unwrap();
    assert!(!key_path(dir, "alpha").exists());

    let persistent = KeyedLockingFileMutex::new(driver.clone(), dir);
    let lock = persistent.acquire("gamma", None).await.unwrap();
    lock.release().await.unwrap();
    assert!(key_path(dir, "gamma").exists());
}

async fn missing_directory_is_rejected<D>(driver: &D, dir: &Path)
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let missing = dir.join("no-such-dir");
    let err = FileMutex::new(driver.clone(), missing.join("m.lock"))
        .acquire(None)
        .await
        .unwrap_err();
    assert!(matches!(err, FileError::InvalidArgument(_)));

    let err = KeyedLockingFileMutex::new(driver.clone(), &missing)
        .acquire("key", None)
        .await
        .unwrap_err();
    assert!(matches!(err, FileError::InvalidArgument(_)));

    // a regular file is not a directory either
    let file = dir.join("plain");
    std::fs::write(&file, b"").unwrap();
    let err = KeyedFileMutex::new(driver.clone(), &file)
        .acquire("key", None)
        .await
        .unwrap_err();
    assert!(matches!(err, FileError::InvalidArgument(_)));
}

on_every_driver!(
    ephemeral_mutex_removes_its_file,
    persistent_mutex_keeps_its_file,
    contender_waits_for_release,
    persistent_contender_waits_for_release,
    dropped_lock_is_released,
    cancelled_acquire_gives_up,
    keyed_mutexes_hash_their_keys,
    missing_directory_is_rejected,
);
