//! Worker transport used by the pooled driver.
//!
//! A worker executes [`FileTask`]s somewhere other than the scheduler thread
//! and replies with a [`TaskOutput`]. Failures reported by the worker itself
//! surface as [`FileError::FilesystemOperationFailed`] (or the more specific
//! variant it chose); losing the worker surfaces as
//! [`FileError::WorkerTransportFailed`].

use std::path::PathBuf;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::error::{FileError, Result};
use crate::mode::{LockKind, OpenMode};

/// Stable identifier of a worker within its pool.
pub type WorkerId = u64;

/// Handle number of a file opened on a worker. Only meaningful to that worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteHandle(pub u64);

#[derive(Debug, Clone)]
pub enum FileTask {
    Open { path: PathBuf, mode: OpenMode },
    Read { handle: RemoteHandle, offset: u64, length: usize },
    Write { handle: RemoteHandle, offset: u64, data: Vec<u8> },
    Truncate { handle: RemoteHandle, size: u64 },
    TryLock { handle: RemoteHandle, kind: LockKind },
    Unlock { handle: RemoteHandle },
    Close { handle: RemoteHandle },
    IsDirectory { path: PathBuf },
    DeleteFile { path: PathBuf },
}

impl FileTask {
    pub fn name(&self) -> &'static str {
        match self {
            FileTask::Open { .. } => "open",
            FileTask::Read { .. } => "read",
            FileTask::Write { .. } => "write",
            FileTask::Truncate { .. } => "truncate",
            FileTask::TryLock { .. } => "try_lock",
            FileTask::Unlock { .. } => "unlock",
            FileTask::Close { .. } => "close",
            FileTask::IsDirectory { .. } => "is_directory",
            FileTask::DeleteFile { .. } => "delete_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Opened { handle: RemoteHandle, size: u64 },
    Data(Vec<u8>),
    Written(usize),
    Locked(bool),
    IsDirectory(bool),
    Done,
}

impl TaskOutput {
    fn unexpected(self, task: &'static str) -> FileError {
        FileError::WorkerTransportFailed {
            message: format!("unexpected reply to {task}: {self:?}"),
        }
    }

    pub(crate) fn into_opened(self) -> Result<(RemoteHandle, u64)> {
        match self {
            TaskOutput::Opened { handle, size } => Ok((handle, size)),
            other => Err(other.unexpected("open")),
        }
    }

    pub(crate) fn into_data(self) -> Result<Vec<u8>> {
        match self {
            TaskOutput::Data(data) => Ok(data),
            other => Err(other.unexpected("read")),
        }
    }

    pub(crate) fn into_written(self) -> Result<usize> {
        match self {
            TaskOutput::Written(n) => Ok(n),
            other => Err(other.unexpected("write")),
        }
    }

    pub(crate) fn into_locked(self) -> Result<bool> {
        match self {
            TaskOutput::Locked(locked) => Ok(locked),
            other => Err(other.unexpected("try_lock")),
        }
    }

    pub(crate) fn into_is_directory(self) -> Result<bool> {
        match self {
            TaskOutput::IsDirectory(is_dir) => Ok(is_dir),
            other => Err(other.unexpected("is_directory")),
        }
    }

    pub(crate) fn into_done(self) -> Result<()> {
        match self {
            TaskOutput::Done => Ok(()),
            other => Err(other.unexpected("task")),
        }
    }
}

/// One execution context for file tasks.
pub trait Worker {
    fn id(&self) -> WorkerId;

    /// False once the worker can no longer accept tasks.
    fn is_running(&self) -> bool;

    /// Hand `task` to the worker. The task is sent before this returns, so
    /// dropping the future only discards the reply.
    fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>>;
}

/// Source of workers.
pub trait WorkerPool {
    /// A worker the caller may assign handles to.
    fn get_worker(&self) -> LocalBoxFuture<'static, Result<Rc<dyn Worker>>>;

    /// Run a task that is not bound to an open handle, on any worker.
    fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>>;

    /// Most distinct workers `get_worker` hands out at once.
    fn worker_limit(&self) -> usize;
}
