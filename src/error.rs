//! Error type shared by every driver.

use std::sync::Arc;

/// Errors surfaced by file handles, drivers and mutexes.
///
/// The type is `Clone` so a queued write's outcome can be observed both by the
/// caller and by the operations chained behind it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FileError {
    #[error("{0}")]
    Closed(String),

    #[error("a read is pending or writes are queued on this handle")]
    PendingOperation,

    #[error("{message}: {source}")]
    FilesystemOperationFailed {
        message: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("worker transport failed: {message}")]
    WorkerTransportFailed { message: String },

    #[error("error attempting to lock file at \"{path}\": {message}")]
    LockFailed { path: String, message: String },

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, FileError>;

impl FileError {
    /// Wrap an OS error. `EBADF` means the descriptor went away underneath us,
    /// which callers observe as a closed handle.
    pub fn from_io(message: impl Into<String>, err: std::io::Error) -> Self {
        let message = message.into();
        if err.raw_os_error() == Some(libc::EBADF) {
            return FileError::Closed(format!("{message}: the handle has been closed"));
        }
        FileError::FilesystemOperationFailed {
            message,
            source: Arc::new(err),
        }
    }

    pub fn closed(path: &std::path::Path) -> Self {
        FileError::Closed(format!("the file '{}' has been closed", path.display()))
    }

    pub fn not_writable(path: &std::path::Path) -> Self {
        FileError::Closed(format!(
            "the file '{}' is no longer writable",
            path.display()
        ))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FileError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ebadf_maps_to_closed() {
        let err = FileError::from_io("write failed", std::io::Error::from_raw_os_error(libc::EBADF));
        assert!(matches!(err, FileError::Closed(_)));

        let err = FileError::from_io("write failed", std::io::Error::from_raw_os_error(libc::ENOSPC));
        match err {
            FileError::FilesystemOperationFailed { message, source } => {
                assert_eq!(message, "write failed");
                assert_eq!(source.raw_os_error(), Some(libc::ENOSPC));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
