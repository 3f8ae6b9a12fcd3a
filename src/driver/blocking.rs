//! Direct driver: every operation runs inline on the calling thread.
//!
//! Futures returned here are already complete when the call returns, except
//! for writes chained behind a write that was never awaited. The scheduler is
//! blocked for the duration of each syscall.

use std::future::{ready, Future};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::cancel::Cancellation;
use crate::error::{FileError, Result};
use crate::file::fd::SharedFd;
use crate::file::queued::HandleCore;
use crate::file::{File, FilesystemDriver, PathMetadata};
use crate::lock::{self, Backoff};
use crate::mode::{LockKind, OpenMode, Whence};

/// Opens [`BlockingFile`]s through `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct BlockingDriver {
    backoff: Backoff,
}

impl BlockingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(backoff: Backoff) -> Self {
        BlockingDriver { backoff }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn open_now(&self, path: &Path, mode: &str) -> Result<BlockingFile> {
        let mode = OpenMode::parse(mode)?;
        let file = mode.to_open_options().open(path).map_err(|err| {
            FileError::from_io(format!("failed to open '{}'", path.display()), err)
        })?;
        let size = file
            .metadata()
            .map_err(|err| FileError::from_io(format!("failed to stat '{}'", path.display()), err))?
            .len();
        tracing::debug!("BlockingDriver: opened {} mode={} size={}", path.display(), mode, size);
        Ok(BlockingFile {
            core: HandleCore::new(path.to_path_buf(), mode, size),
            fd: SharedFd::new(file, path.to_path_buf()),
            backoff: self.backoff,
        })
    }
}

impl FilesystemDriver for BlockingDriver {
    type File = BlockingFile;

    fn open_file(&self, path: &Path, mode: &str) -> impl Future<Output = Result<BlockingFile>> {
        ready(self.open_now(path, mode))
    }
}

impl PathMetadata for BlockingDriver {
    fn is_directory(&self, path: &Path) -> impl Future<Output = Result<bool>> {
        ready(match std::fs::metadata(path) {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FileError::from_io(
                format!("failed to stat '{}'", path.display()),
                err,
            )),
        })
    }

    fn delete_file(&self, path: &Path) -> impl Future<Output = Result<()>> {
        ready(std::fs::remove_file(path).map_err(|err| {
            FileError::from_io(format!("failed to delete '{}'", path.display()), err)
        }))
    }
}

/// Handle whose I/O blocks the scheduler thread.
pub struct BlockingFile {
    core: Rc<HandleCore>,
    fd: Rc<SharedFd>,
    backoff: Backoff,
}

impl BlockingFile {
    fn read_now(&self, cancellation: Option<&Cancellation>, length: usize) -> Result<Option<Vec<u8>>> {
        let ticket = self.core.begin_read(length)?;
        if let Some(cancellation) = cancellation {
            cancellation.check()?;
        }
        if ticket.length() == 0 {
            return Ok(None);
        }
        let offset = ticket.offset();
        let data = self.fd.with("failed to read", |mut file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut data = Vec::with_capacity(ticket.length());
            file.take(ticket.length() as u64).read_to_end(&mut data)?;
            Ok(data)
        })?;
        Ok(ticket.complete(data))
    }
}

fn close_handle(core: &Rc<HandleCore>, fd: Rc<SharedFd>) -> LocalBoxFuture<'static, Result<()>> {
    core.close_with(move || ready(fd.close()))
}

impl File for BlockingFile {
    fn read(
        &self,
        cancellation: Option<Cancellation>,
        length: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> {
        ready(self.read_now(cancellation.as_ref(), length))
    }

    fn write(&self, bytes: Vec<u8>) -> impl Future<Output = Result<()>> {
        let fd = Rc::clone(&self.fd);
        let queued = self.core.queue_write(move |offset| {
            ready(fd.with("failed to write", |mut file| {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&bytes)?;
                Ok(bytes.len())
            }))
        });
        async move { queued?.await }
    }

    fn truncate(&self, size: u64) -> impl Future<Output = Result<()>> {
        let fd = Rc::clone(&self.fd);
        let queued = self
            .core
            .queue_truncate(size, move |size| ready(fd.with("failed to truncate", |file| file.set_len(size))));
        async move { queued?.await }
    }

    fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        self.core.seek(offset, whence)
    }

    fn tell(&self) -> u64 {
        self.core.tell()
    }

    fn eof(&self) -> bool {
        self.core.eof()
    }

    fn close(&self) -> impl Future<Output = Result<()>> {
        close_handle(&self.core, Rc::clone(&self.fd))
    }

    fn end(&self) -> impl Future<Output = Result<()>> {
        let core = Rc::clone(&self.core);
        let fd = Rc::clone(&self.fd);
        self.core.end_with(move || close_handle(&core, fd))
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn on_close<F>(&self, observer: F)
    where
        F: FnOnce() + 'static,
    {
        self.core.on_close(Box::new(observer));
    }

    fn lock(&self, kind: LockKind, cancellation: Option<Cancellation>) -> impl Future<Output = Result<()>> {
        async move { lock::acquire(self, kind, &self.backoff, cancellation.as_ref()).await }
    }

    fn try_lock(&self, kind: LockKind) -> impl Future<Output = Result<bool>> {
        ready(lock::try_lock_handle(&self.core, &self.fd, kind))
    }

    fn unlock(&self) -> impl Future<Output = Result<()>> {
        ready(lock::unlock_handle(&self.core, &self.fd))
    }

    fn lock_kind(&self) -> Option<LockKind> {
        self.core.lock_kind()
    }

    fn path(&self) -> &Path {
        self.core.path()
    }

    fn mode(&self) -> &OpenMode {
        self.core.mode()
    }

    fn is_readable(&self) -> bool {
        self.core.mode().is_readable()
    }

    fn is_writable(&self) -> bool {
        self.core.is_writable()
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for BlockingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingFile")
            .field("path", &PathBuf::from(self.core.path()))
            .field("position", &self.core.tell())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}
