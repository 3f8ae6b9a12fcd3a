//! File-based mutexes built on the advisory lock of a handle.
//!
//! [`FileMutex`] deletes its lock file on release, so nothing is left behind
//! after a clean shutdown, but a crash leaves a locked-looking file on disk
//! only until the holder's descriptor is closed by the OS. [`LockingFileMutex`]
//! never deletes the file; releasing just drops the advisory lock.
//!
//! Deleting a file while holding its lock lets a waiter that opened the old
//! file acquire a lock on an unlinked inode while a newcomer creates and
//! locks a fresh file at the same path. Within one process [`FileMutex`]
//! closes that window with a per-path gate; across processes it stays open
//! for the time between `open` and `flock` of the late waiter. Use
//! [`LockingFileMutex`] when several processes contend for the same path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::channel::oneshot;
use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;
use sha2::{Digest, Sha256};

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::{FileError, Result};
use crate::file::{File, FilesystemDriver, PathMetadata};
use crate::mode::LockKind;

type Release = Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<()>>>;

/// A held mutex. Call [`Lock::release`] to release it and observe failures;
/// dropping it releases in the background when a runtime is installed.
pub struct Lock {
    path: PathBuf,
    release: Option<Release>,
}

impl Lock {
    fn new(path: PathBuf, release: Release) -> Self {
        Lock {
            path,
            release: Some(release),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.release.take() {
            Some(release) => release().await,
            None => Ok(()),
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let path = self.path.clone();
        let releasing = release();
        let spawned = crate::executor::try_spawn(async move {
            if let Err(err) = releasing.await {
                tracing::warn!("releasing mutex {} failed: {}", path.display(), err);
            }
        });
        if spawned.is_none() {
            // the handle was closed by dropping it, which drops the lock too
            tracing::debug!("mutex {} dropped without a runtime", self.path.display());
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("path", &self.path)
            .field("released", &self.is_released())
            .finish()
    }
}

thread_local! {
    static GATES: RefCell<HashMap<PathBuf, Shared<LocalBoxFuture<'static, ()>>>> =
        RefCell::new(HashMap::new());
}

/// Serializes acquisitions of one path within this thread.
struct PathGate {
    key: PathBuf,
    _open: oneshot::Sender<()>,
}

impl PathGate {
    async fn enter(key: PathBuf, cancellation: Option<&Cancellation>) -> Result<PathGate> {
        loop {
            let held = GATES.with(|gates| gates.borrow().get(&key).cloned());
            match held {
                Some(held) => {
                    tracing::trace!("PathGate: waiting for {}", key.display());
                    with_cancellation(held, cancellation).await?;
                }
                None => break,
            }
        }
        let (open, closed) = oneshot::channel::<()>();
        let closed = closed.map(|_| ()).boxed_local().shared();
        GATES.with(|gates| gates.borrow_mut().insert(key.clone(), closed));
        Ok(PathGate { key, _open: open })
    }
}

impl Drop for PathGate {
    fn drop(&mut self) {
        // dropping `_open` right after wakes the waiters
        GATES.with(|gates| gates.borrow_mut().remove(&self.key));
    }
}

fn gate_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

async fn ensure_directory<D: PathMetadata>(driver: &D, directory: &Path) -> Result<()> {
    let directory = if directory.as_os_str().is_empty() {
        Path::new(".")
    } else {
        directory
    };
    if driver.is_directory(directory).await? {
        Ok(())
    } else {
        Err(FileError::InvalidArgument(format!(
            "directory '{}' does not exist or is not a directory",
            directory.display()
        )))
    }
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// Lock file path for `key` inside `directory`.
pub fn key_path(directory: &Path, key: &str) -> PathBuf {
    let digest = Sha256::digest(key.as_bytes());
    directory.join(format!("{}.lock", hex::encode(digest)))
}

/// Mutex whose lock file is deleted on release.
pub struct FileMutex<D> {
    driver: D,
    path: PathBuf,
}

impl<D> FileMutex<D>
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    pub fn new(driver: D, path: impl Into<PathBuf>) -> Self {
        FileMutex {
            driver,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[tracing::instrument(level = "trace", skip(self, cancellation), fields(path = %self.path.display()))]
    pub async fn acquire(&self, cancellation: Option<Cancellation>) -> Result<Lock> {
        ensure_directory(&self.driver, parent_of(&self.path)).await?;
        acquire_ephemeral(&self.driver, self.path.clone(), cancellation).await
    }
}

async fn acquire_ephemeral<D>(driver: &D, path: PathBuf, cancellation: Option<Cancellation>) -> Result<Lock>
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    let gate = PathGate::enter(gate_key(&path), cancellation.as_ref()).await?;
    let file = driver.open_file(&path, "a").await?;
    file.lock(LockKind::Exclusive, cancellation).await?;
    tracing::debug!("FileMutex: acquired {}", path.display());

    let driver = driver.clone();
    let lock_path = path.clone();
    Ok(Lock::new(
        lock_path,
        Box::new(move || {
            async move {
                let deleted = driver.delete_file(&path).await;
                let closed = file.close().await;
                drop(gate);
                deleted.map_err(|err| FileError::LockFailed {
                    path: path.display().to_string(),
                    message: format!("failed to remove the mutex file: {err}"),
                })?;
                closed
            }
            .boxed_local()
        }),
    ))
}

/// Mutex whose lock file persists; release only drops the advisory lock.
pub struct LockingFileMutex<D> {
    driver: D,
    path: PathBuf,
}

impl<D> LockingFileMutex<D>
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    pub fn new(driver: D, path: impl Into<PathBuf>) -> Self {
        LockingFileMutex {
            driver,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[tracing::instrument(level = "trace", skip(self, cancellation), fields(path = %self.path.display()))]
    pub async fn acquire(&self, cancellation: Option<Cancellation>) -> Result<Lock> {
        ensure_directory(&self.driver, parent_of(&self.path)).await?;
        acquire_persistent(&self.driver, self.path.clone(), cancellation).await
    }
}

async fn acquire_persistent<D>(driver: &D, path: PathBuf, cancellation: Option<Cancellation>) -> Result<Lock>
where
    D: FilesystemDriver,
{
    let file = driver.open_file(&path, "c").await?;
    file.lock(LockKind::Exclusive, cancellation).await?;
    tracing::debug!("LockingFileMutex: acquired {}", path.display());

    Ok(Lock::new(
        path,
        Box::new(move || {
            async move {
                file.unlock().await?;
                file.close().await
            }
            .boxed_local()
        }),
    ))
}

/// [`FileMutex`] per key; lock files are `<directory>/<sha256(key)>.lock`.
pub struct KeyedFileMutex<D> {
    driver: D,
    directory: PathBuf,
}

impl<D> KeyedFileMutex<D>
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    pub fn new(driver: D, directory: impl Into<PathBuf>) -> Self {
        KeyedFileMutex {
            driver,
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn acquire(&self, key: &str, cancellation: Option<Cancellation>) -> Result<Lock> {
        ensure_directory(&self.driver, &self.directory).await?;
        acquire_ephemeral(&self.driver, key_path(&self.directory, key), cancellation).await
    }
}

/// [`LockingFileMutex`] per key; lock files are `<directory>/<sha256(key)>.lock`.
pub struct KeyedLockingFileMutex<D> {
    driver: D,
    directory: PathBuf,
}

impl<D> KeyedLockingFileMutex<D>
where
    D: FilesystemDriver + PathMetadata + Clone + 'static,
{
    pub fn new(driver: D, directory: impl Into<PathBuf>) -> Self {
        KeyedLockingFileMutex {
            driver,
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn acquire(&self, key: &str, cancellation: Option<Cancellation>) -> Result<Lock> {
        ensure_directory(&self.driver, &self.directory).await?;
        acquire_persistent(&self.driver, key_path(&self.directory, key), cancellation).await
    }
}
