use std::cell::RefCell;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{FileError, Result};

/// Descriptor shared between a handle and the operations it queued.
///
/// Queued writes hold an `Rc` to it, so the descriptor outlives a dropped
/// handle until the queue drained. Dropping the last reference closes it and
/// logs a failure instead of returning it.
pub(crate) struct SharedFd {
    file: RefCell<Option<std::fs::File>>,
    path: PathBuf,
}

impl SharedFd {
    pub(crate) fn new(file: std::fs::File, path: PathBuf) -> Rc<Self> {
        Rc::new(SharedFd {
            file: RefCell::new(Some(file)),
            path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn raw(&self) -> Result<RawFd> {
        self.file
            .borrow()
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| FileError::closed(&self.path))
    }

    /// Run a blocking call against the descriptor.
    pub(crate) fn with<T>(
        &self,
        message: &str,
        f: impl FnOnce(&std::fs::File) -> std::io::Result<T>,
    ) -> Result<T> {
        let file = self.file.borrow();
        let file = file.as_ref().ok_or_else(|| FileError::closed(&self.path))?;
        f(file).map_err(|err| {
            FileError::from_io(format!("{} '{}'", message, self.path.display()), err)
        })
    }

    /// Give up ownership of the raw descriptor; the caller must close it.
    pub(crate) fn detach(&self) -> Option<RawFd> {
        self.file.borrow_mut().take().map(IntoRawFd::into_raw_fd)
    }

    pub(crate) fn close(&self) -> Result<()> {
        match self.detach() {
            Some(fd) => close_raw(fd, &self.path),
            None => Ok(()),
        }
    }
}

impl Drop for SharedFd {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!("best-effort close failed: {}", err);
        }
    }
}

pub(crate) fn close_raw(fd: RawFd, path: &Path) -> Result<()> {
    if unsafe { libc::close(fd) } == 0 {
        return Ok(());
    }
    Err(FileError::from_io(
        format!("failed to close '{}'", path.display()),
        std::io::Error::last_os_error(),
    ))
}
