//! Error codes mirrored to user space.
//!
//! Syscall-adjacent code elsewhere favors `Result<_, &'static str>`; here
//! the string is replaced with a closed enum so the syscall dispatcher
//! can translate failures into the `v0`/`a3` ABI pair without string
//! matching, and so every error site states exactly which of the fixed
//! taxonomy applies.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Errno {
    /// Out of physical memory / coremap frames.
    ENOMEM = 1,
    /// Bad user pointer.
    EFAULT = 2,
    /// Invalid argument or option.
    EINVAL = 3,
    /// Swap store exhausted.
    ENOSPC = 4,
    /// Unknown syscall number.
    ENOSYS = 5,
    /// No such child process.
    ECHILD = 6,
    /// No such process.
    ESRCH = 7,
    /// Bad file descriptor.
    EBADF = 8,
    /// Too many open files.
    EMFILE = 9,
    /// Argument list (argv/path) too large.
    E2BIG = 10,
    /// Generic device I/O failure.
    EIO = 11,
    /// Not a directory.
    ENOTDIR = 12,
    /// No such file or directory.
    ENOENT = 13,
    /// Is a directory.
    EISDIR = 14,
    /// Out of PIDs.
    ENPROC = 15,
}

impl Errno {
    /// The value written into `v0` when a syscall fails.
    pub fn to_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::ENOMEM => "out of memory",
            Errno::EFAULT => "bad address",
            Errno::EINVAL => "invalid argument",
            Errno::ENOSPC => "no space left on swap device",
            Errno::ENOSYS => "function not implemented",
            Errno::ECHILD => "no child processes",
            Errno::ESRCH => "no such process",
            Errno::EBADF => "bad file descriptor",
            Errno::EMFILE => "too many open files",
            Errno::E2BIG => "argument list too long",
            Errno::EIO => "I/O error",
            Errno::ENOTDIR => "not a directory",
            Errno::ENOENT => "no such file or directory",
            Errno::EISDIR => "is a directory",
            Errno::ENPROC => "too many processes",
        };
        f.write_str(s)
    }
}

pub type KResult<T> = Result<T, Errno>;

/// Either a successful resident/backing location or exhaustion, used by the
/// coremap and swap store where "no space" is the only failure mode and a
/// dedicated type reads better than `Errno` at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alloc<T> {
    Ok(T),
    NoSpace,
}

impl<T> Alloc<T> {
    pub fn ok_or_enomem(self) -> KResult<T> {
        match self {
            Alloc::Ok(v) => Ok(v),
            Alloc::NoSpace => Err(Errno::ENOMEM),
        }
    }

    pub fn ok_or_enospc(self) -> KResult<T> {
        match self {
            Alloc::Ok(v) => Ok(v),
            Alloc::NoSpace => Err(Errno::ENOSPC),
        }
    }
}
