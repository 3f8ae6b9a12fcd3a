//! Open modes, seek origins and lock kinds.

use std::fs::OpenOptions;

use crate::error::{FileError, Result};

/// Parsed `fopen`-style mode string (`r`, `r+`, `w`, `w+`, `a`, `a+`, `x`, `c`, `c+`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMode {
    raw: String,
    readable: bool,
    writable: bool,
    append: bool,
    create: bool,
    truncate: bool,
    create_new: bool,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Result<Self> {
        let mut chars = mode.chars();
        let base = chars
            .next()
            .ok_or_else(|| FileError::InvalidArgument("file mode cannot be empty".to_string()))?;

        let mut plus = false;
        for c in chars {
            match c {
                '+' => plus = true,
                // binary/text/close-on-exec markers carry no meaning here
                'b' | 't' | 'e' => {}
                _ => {
                    return Err(FileError::InvalidArgument(format!(
                        "unsupported character '{c}' in file mode '{mode}'"
                    )))
                }
            }
        }

        let (create, truncate, create_new) = match base {
            'r' => (false, false, false),
            'w' => (true, true, false),
            'a' | 'c' => (true, false, false),
            'x' => (true, false, true),
            _ => {
                return Err(FileError::InvalidArgument(format!(
                    "invalid file mode '{mode}'"
                )))
            }
        };

        Ok(OpenMode {
            raw: mode.to_string(),
            readable: base == 'r' || plus,
            writable: base != 'r' || plus,
            append: base == 'a',
            create,
            truncate,
            create_new,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_append(&self) -> bool {
        self.append
    }

    /// Options for drivers that use the OS cursor; append mode is delegated to the kernel.
    pub fn to_open_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.readable)
            .write(self.writable && !self.append)
            .append(self.append)
            .create(self.create && !self.create_new)
            .create_new(self.create_new)
            .truncate(self.truncate);
        options
    }

    /// `open(2)` flags for positional drivers. No `O_APPEND`: Linux would
    /// ignore the offset given to `pwrite`. Append-mode writes are issued at
    /// the handle's size instead.
    pub fn to_open_flags(&self) -> libc::c_int {
        let mut flags = match (self.readable, self.writable) {
            (true, true) => libc::O_RDWR,
            (false, true) => libc::O_WRONLY,
            _ => libc::O_RDONLY,
        };
        if self.create {
            flags |= libc::O_CREAT;
        }
        if self.truncate {
            flags |= libc::O_TRUNC;
        }
        if self.create_new {
            flags |= libc::O_EXCL;
        }
        flags | libc::O_CLOEXEC
    }

    /// Positional counterpart of [`OpenMode::to_open_options`].
    pub fn to_positional_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.readable)
            .write(self.writable)
            .create(self.create && !self.create_new)
            .create_new(self.create_new)
            .truncate(self.truncate);
        options
    }
}

impl std::fmt::Display for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Origin for [`File::seek`](crate::file::File::seek).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Whence {
    #[default]
    Start,
    Current,
    End,
}

/// Advisory lock kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    pub(crate) fn flock_operation(self) -> libc::c_int {
        match self {
            LockKind::Shared => libc::LOCK_SH,
            LockKind::Exclusive => libc::LOCK_EX,
        }
    }
}

/// Resolve a seek request against the current cursor and size.
pub(crate) fn resolve_seek(position: u64, size: u64, offset: i64, whence: Whence) -> Result<u64> {
    let origin = match whence {
        Whence::Start => 0i128,
        Whence::Current => position as i128,
        Whence::End => size as i128,
    };
    let target = origin + offset as i128;
    if target < 0 || target > i64::MAX as i128 {
        return Err(FileError::InvalidArgument(format!(
            "cannot seek to position {target}"
        )));
    }
    Ok(target as u64)
}
