//! Advisory locking with exponential backoff.
//!
//! `try_lock` is a single `flock(LOCK_NB)` request. `lock` keeps retrying it,
//! sleeping on the runtime's timer between attempts, until it succeeds or the
//! cancellation token fires. There is no attempt limit.

use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;

use crate::cancel::Cancellation;
use crate::error::{FileError, Result};
use crate::file::fd::SharedFd;
use crate::file::queued::HandleCore;
use crate::file::File;
use crate::mode::LockKind;
use crate::timer::sleep_with_cancellation;

/// Retry delays used while a lock is contended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_latency: Duration,
    pub delay_limit: Duration,
    pub max_exponent: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base_latency: Duration::from_millis(10),
            delay_limit: Duration::from_secs(1),
            max_exponent: 7,
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_latency(mut self, latency: Duration) -> Self {
        self.base_latency = latency;
        self
    }

    pub fn delay_limit(mut self, limit: Duration) -> Self {
        self.delay_limit = limit;
        self
    }

    pub fn max_exponent(mut self, exponent: u32) -> Self {
        self.max_exponent = exponent;
        self
    }

    /// Delay before retry number `attempt` (starting at 0).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(self.max_exponent).min(31);
        self.base_latency
            .checked_mul(factor)
            .unwrap_or(self.delay_limit)
            .min(self.delay_limit)
    }
}

/// One non-blocking `flock` request. `Ok(false)` means another holder has it.
pub(crate) fn try_flock(fd: RawFd, path: &Path, kind: LockKind) -> Result<bool> {
    let ret = unsafe { libc::flock(fd, kind.flock_operation() | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) => Ok(false),
        Some(libc::EBADF) => Err(FileError::closed(path)),
        _ => Err(FileError::LockFailed {
            path: path.display().to_string(),
            message: err.to_string(),
        }),
    }
}

pub(crate) fn unlock_flock(fd: RawFd, path: &Path) -> Result<()> {
    let ret = unsafe { libc::flock(fd, libc::LOCK_UN) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EBADF) {
        return Err(FileError::closed(path));
    }
    Err(FileError::LockFailed {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

/// `try_lock` for handles that own their descriptor.
pub(crate) fn try_lock_handle(core: &HandleCore, fd: &SharedFd, kind: LockKind) -> Result<bool> {
    core.ensure_open()?;
    let locked = try_flock(fd.raw()?, core.path(), kind)?;
    core.record_lock_attempt(kind, locked);
    Ok(locked)
}

pub(crate) fn unlock_handle(core: &HandleCore, fd: &SharedFd) -> Result<()> {
    core.ensure_open()?;
    unlock_flock(fd.raw()?, core.path())?;
    core.set_lock_kind(None);
    Ok(())
}

/// Retry `file.try_lock(kind)` until it succeeds, sleeping per `backoff`
/// between attempts.
pub async fn acquire<F>(
    file: &F,
    kind: LockKind,
    backoff: &Backoff,
    cancellation: Option<&Cancellation>,
) -> Result<()>
where
    F: File + ?Sized,
{
    let mut attempt = 0u32;
    loop {
        if let Some(cancellation) = cancellation {
            cancellation.check()?;
        }
        if file.try_lock(kind).await? {
            tracing::trace!(
                "lock::acquire {:?} on {} after {} retries",
                kind,
                file.path().display(),
                attempt
            );
            return Ok(());
        }
        let delay = backoff.delay_for(attempt);
        tracing::trace!(
            "lock::acquire {} contended, retrying in {:?}",
            file.path().display(),
            delay
        );
        sleep_with_cancellation(delay, cancellation).await?;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn delay_grows_then_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(0), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(80));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1000), Duration::from_secs(1));

        let backoff = Backoff::new().delay_limit(Duration::from_secs(60));
        assert_eq!(backoff.delay_for(7), Duration::from_millis(1280));
        assert_eq!(backoff.delay_for(30), Duration::from_millis(1280));
    }

    #[test]
    fn flock_contention_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contended.lock");
        let a = std::fs::File::create(&path).unwrap();
        let b = std::fs::File::open(&path).unwrap();

        assert!(try_flock(a.as_raw_fd(), &path, LockKind::Exclusive).unwrap());
        assert!(!try_flock(b.as_raw_fd(), &path, LockKind::Shared).unwrap());
        unlock_flock(a.as_raw_fd(), &path).unwrap();
        assert!(try_flock(b.as_raw_fd(), &path, LockKind::Shared).unwrap());
        assert!(try_flock(a.as_raw_fd(), &path, LockKind::Shared).unwrap());
    }

    #[test]
    fn bad_descriptor_reports_closed() {
        let path = Path::new("/nonexistent");
        assert!(matches!(
            try_flock(-1, path, LockKind::Exclusive),
            Err(FileError::Closed(_))
        ));
    }
}
