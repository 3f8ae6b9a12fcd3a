//! Polling driver: requests go through `io_uring` and complete through the
//! [`IoUringReactor`] polled by the runtime.
//!
//! All I/O is positional. The reactor must be registered with the runtime that
//! drives the handles, see [`UringDriver::attach`].

mod builder;
mod reactor;

pub use builder::IoUringReactorBuilder;
pub use reactor::{IoUringReactor, PollInterest};

use std::ffi::CString;
use std::future::{ready, Future};
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::future::{Either, LocalBoxFuture};
use futures::FutureExt;
use io_uring::{opcode, types};

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::{FileError, Result};
use crate::executor::Runtime;
use crate::file::fd::{close_raw, SharedFd};
use crate::file::queued::HandleCore;
use crate::file::{File, FilesystemDriver, PathMetadata};
use crate::lock::{self, Backoff};
use crate::mode::{LockKind, OpenMode, Whence};

use reactor::{IoBuffer, WaitHandle};

/// Id the reactor is registered under by [`UringDriver::attach`].
pub const REACTOR_ID: &str = "io_uring";

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        FileError::InvalidArgument(format!("path '{}' contains a NUL byte", path.display()))
    })
}

/// Length field of a read or write SQE. Longer buffers are transferred in
/// several requests.
fn sqe_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn push_failed(message: String) -> impl FnOnce(std::io::Error) -> FileError {
    move |err| FileError::from_io(message, err)
}

/// Opens [`UringFile`]s; every request is submitted to `io_uring`.
#[derive(Clone)]
pub struct UringDriver {
    reactor: Rc<IoUringReactor>,
    backoff: Backoff,
}

impl UringDriver {
    /// Driver on this thread's reactor.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self::with_reactor(IoUringReactor::current()?))
    }

    pub fn with_reactor(reactor: Rc<IoUringReactor>) -> Self {
        UringDriver {
            reactor,
            backoff: Backoff::default(),
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn reactor(&self) -> &Rc<IoUringReactor> {
        &self.reactor
    }

    /// Register the reactor with `runtime` under [`REACTOR_ID`].
    pub fn attach(&self, runtime: &Runtime) {
        runtime.register_reactor(REACTOR_ID, Rc::clone(&self.reactor));
    }

    fn submit_open(&self, path: &Path, mode: &str) -> Result<(OpenMode, WaitHandle)> {
        let mode = OpenMode::parse(mode)?;
        let c_path = c_path(path)?;
        let sqe = opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), c_path.as_ptr())
            .flags(mode.to_open_flags())
            .mode(0o666)
            .build();
        let wait = self
            .reactor
            .push_sqe(sqe, IoBuffer::Path(c_path))
            .map_err(push_failed(format!("failed to open '{}'", path.display())))?;
        Ok((mode, wait))
    }
}

impl FilesystemDriver for UringDriver {
    type File = UringFile;

    fn open_file(&self, path: &Path, mode: &str) -> impl Future<Output = Result<UringFile>> {
        let submitted = self.submit_open(path, mode);
        let path = path.to_path_buf();
        let reactor = Rc::clone(&self.reactor);
        let backoff = self.backoff;
        async move {
            let (mode, wait) = submitted?;
            let raw = wait.await.result.map_err(|err| {
                FileError::from_io(format!("failed to open '{}'", path.display()), err)
            })?;
            // SAFETY: the descriptor was just returned by openat and is owned by nobody else.
            let file = unsafe { std::fs::File::from_raw_fd(raw) };
            let size = file
                .metadata()
                .map_err(|err| FileError::from_io(format!("failed to stat '{}'", path.display()), err))?
                .len();
            tracing::debug!("UringDriver: opened {} mode={} size={}", path.display(), mode, size);
            Ok(UringFile {
                core: HandleCore::new(path.clone(), mode, size),
                fd: SharedFd::new(file, path),
                reactor,
                backoff,
            })
        }
    }
}

impl PathMetadata for UringDriver {
    fn is_directory(&self, path: &Path) -> impl Future<Output = Result<bool>> {
        let submitted = c_path(path).and_then(|c_path| {
            // SAFETY: statx is plain old data
            let mut stat: Box<libc::statx> = Box::new(unsafe { std::mem::zeroed() });
            let sqe = opcode::Statx::new(
                types::Fd(libc::AT_FDCWD),
                c_path.as_ptr(),
                &mut *stat as *mut libc::statx as *mut _,
            )
            .mask(libc::STATX_TYPE)
            .build();
            self.reactor
                .push_sqe(sqe, IoBuffer::Stat(c_path, stat))
                .map_err(push_failed(format!("failed to stat '{}'", path.display())))
        });
        let path = path.to_path_buf();
        async move {
            let completion = submitted?.await;
            match completion.result {
                Ok(_) => match completion.buffer {
                    IoBuffer::Stat(_, stat) => {
                        Ok(u32::from(stat.stx_mode) & libc::S_IFMT == libc::S_IFDIR)
                    }
                    _ => Ok(false),
                },
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(false),
                Err(err) => Err(FileError::from_io(
                    format!("failed to stat '{}'", path.display()),
                    err,
                )),
            }
        }
    }

    fn delete_file(&self, path: &Path) -> impl Future<Output = Result<()>> {
        let submitted = c_path(path).and_then(|c_path| {
            let sqe = opcode::UnlinkAt::new(types::Fd(libc::AT_FDCWD), c_path.as_ptr()).build();
            self.reactor
                .push_sqe(sqe, IoBuffer::Path(c_path))
                .map_err(push_failed(format!("failed to delete '{}'", path.display())))
        });
        let path = path.to_path_buf();
        async move {
            submitted?.await.result.map_err(|err| {
                FileError::from_io(format!("failed to delete '{}'", path.display()), err)
            })?;
            Ok(())
        }
    }
}

/// Handle whose I/O is completed by the [`IoUringReactor`].
pub struct UringFile {
    core: Rc<HandleCore>,
    fd: Rc<SharedFd>,
    reactor: Rc<IoUringReactor>,
    backoff: Backoff,
}

fn push_write(
    reactor: &Rc<IoUringReactor>,
    fd: &SharedFd,
    data: Vec<u8>,
    offset: u64,
    written: usize,
) -> Result<WaitHandle> {
    let raw = fd.raw()?;
    let remaining = &data[written..];
    let sqe = opcode::Write::new(types::Fd(raw), remaining.as_ptr(), sqe_len(remaining.len()))
        .offset(offset + written as u64)
        .build();
    reactor
        .push_sqe(sqe, IoBuffer::Data(data))
        .map_err(push_failed(format!("failed to write '{}'", fd.path().display())))
}

/// Write all of `data` at `offset`. The first request is queued before this
/// returns; short writes are continued from where they stopped.
fn submit_write(
    reactor: Rc<IoUringReactor>,
    fd: Rc<SharedFd>,
    data: Vec<u8>,
    offset: u64,
) -> impl Future<Output = Result<usize>> {
    let first = push_write(&reactor, &fd, data, offset, 0);
    async move {
        let mut wait = first?;
        let mut written = 0usize;
        loop {
            let completion = wait.await;
            let n = completion.result.map_err(|err| {
                FileError::from_io(format!("failed to write '{}'", fd.path().display()), err)
            })? as usize;
            let data = completion.buffer.into_data();
            if n == 0 && !data.is_empty() {
                return Err(FileError::from_io(
                    format!("failed to write '{}'", fd.path().display()),
                    std::io::Error::from(std::io::ErrorKind::WriteZero),
                ));
            }
            written += n;
            if written >= data.len() {
                return Ok(written);
            }
            wait = push_write(&reactor, &fd, data, offset, written)?;
        }
    }
}

fn submit_truncate(
    reactor: Rc<IoUringReactor>,
    fd: Rc<SharedFd>,
    size: u64,
) -> impl Future<Output = Result<()>> {
    let submitted = fd.raw().and_then(|raw| {
        let sqe = opcode::Ftruncate::new(types::Fd(raw), size).build();
        reactor
            .push_sqe(sqe, IoBuffer::Empty)
            .map_err(push_failed(format!("failed to truncate '{}'", fd.path().display())))
    });
    async move {
        match submitted?.await.result {
            Ok(_) => Ok(()),
            // kernels before 6.9 have no IORING_OP_FTRUNCATE
            Err(err) if matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)) => {
                fd.with("failed to truncate", |file| file.set_len(size))
            }
            Err(err) => Err(FileError::from_io(
                format!("failed to truncate '{}'", fd.path().display()),
                err,
            )),
        }
    }
}

fn close_handle(
    core: &Rc<HandleCore>,
    reactor: Rc<IoUringReactor>,
    fd: Rc<SharedFd>,
) -> LocalBoxFuture<'static, Result<()>> {
    core.close_with(move || {
        let Some(raw) = fd.detach() else {
            return Either::Left(ready(Ok(())));
        };
        let path = fd.path().to_path_buf();
        match reactor.push_sqe(opcode::Close::new(types::Fd(raw)).build(), IoBuffer::Empty) {
            Ok(wait) => Either::Right(
                async move {
                    wait.await.result.map_err(|err| {
                        FileError::from_io(format!("failed to close '{}'", path.display()), err)
                    })?;
                    Ok(())
                }
                .boxed_local(),
            ),
            Err(err) => {
                tracing::debug!("UringFile: closing {} inline: {}", path.display(), err);
                Either::Left(ready(close_raw(raw, &path)))
            }
        }
    })
}

impl UringFile {
    fn submit_read(
        &self,
        cancellation: Option<&Cancellation>,
        length: usize,
    ) -> Result<Option<(crate::file::queued::ReadTicket, WaitHandle)>> {
        let ticket = self.core.begin_read(length)?;
        if let Some(cancellation) = cancellation {
            cancellation.check()?;
        }
        if ticket.length() == 0 {
            return Ok(None);
        }
        let raw = self.fd.raw()?;
        // a short read is a valid result; the caller reads again for the rest
        let mut data = vec![0u8; sqe_len(ticket.length()) as usize];
        let sqe = opcode::Read::new(types::Fd(raw), data.as_mut_ptr(), sqe_len(data.len()))
            .offset(ticket.offset())
            .build();
        let wait = self
            .reactor
            .push_sqe(sqe, IoBuffer::Data(data))
            .map_err(push_failed(format!("failed to read '{}'", self.core.path().display())))?;
        Ok(Some((ticket, wait)))
    }
}

impl File for UringFile {
    fn read(
        &self,
        cancellation: Option<Cancellation>,
        length: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> {
        let submitted = self.submit_read(cancellation.as_ref(), length);
        let path = self.core.path().to_path_buf();
        async move {
            let Some((ticket, wait)) = submitted? else {
                return Ok(None);
            };
            // a cancelled WaitHandle cancels the request when dropped
            let completion = with_cancellation(wait, cancellation.as_ref()).await?;
            let n = completion.result.map_err(|err| {
                FileError::from_io(format!("failed to read '{}'", path.display()), err)
            })? as usize;
            let mut data = completion.buffer.into_data();
            data.truncate(n);
            Ok(ticket.complete(data))
        }
    }

    fn write(&self, bytes: Vec<u8>) -> impl Future<Output = Result<()>> {
        let reactor = Rc::clone(&self.reactor);
        let fd = Rc::clone(&self.fd);
        let queued = self
            .core
            .queue_write(move |offset| submit_write(reactor, fd, bytes, offset));
        async move { queued?.await }
    }

    fn truncate(&self, size: u64) -> impl Future<Output = Result<()>> {
        let reactor = Rc::clone(&self.reactor);
        let fd = Rc::clone(&self.fd);
        let queued = self
            .core
            .queue_truncate(size, move |size| submit_truncate(reactor, fd, size));
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
        close_handle(&self.core, Rc::clone(&self.reactor), Rc::clone(&self.fd))
    }

    fn end(&self) -> impl Future<Output = Result<()>> {
        let core = Rc::clone(&self.core);
        let reactor = Rc::clone(&self.reactor);
        let fd = Rc::clone(&self.fd);
        self.core.end_with(move || close_handle(&core, reactor, fd))
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

    /// `flock(LOCK_NB)` never sleeps, so it is issued directly.
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

impl std::fmt::Debug for UringFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringFile")
            .field("path", &PathBuf::from(self.core.path()))
            .field("position", &self.core.tell())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqe_length_saturates() {
        assert_eq!(sqe_len(0), 0);
        assert_eq!(sqe_len(8192), 8192);
        assert_eq!(sqe_len(u32::MAX as usize), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(sqe_len(u32::MAX as usize + 1), u32::MAX);
    }
}
