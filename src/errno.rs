//! Safe wrapper around `errno`.
//!
//! # Example
//! ```
//! use ipv4acd::errno::Errno;
//!
//! Errno::clear();
//! assert_eq!(Errno::last(), Errno::from_raw(0));
//! ```

use libc::c_int;
use std::{fmt, io};

/// The error type returned by every syscall wrapper in this crate.
///
/// A thin newtype around the platform's `errno` values, restricted to the
/// codes that can actually occur on the syscalls this engine makes
/// (`socket`, `bind`, `setsockopt`, `send`, `recv`, `close`,
/// `timerfd_create`, `timerfd_settime`, `epoll_create1`, `epoll_ctl`,
/// `epoll_wait`, `if_nametoindex`). Unlike a general-purpose libc binding,
/// this crate only targets Linux, so there is a single `consts` table
/// instead of one per platform family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
#[non_exhaustive]
pub enum Errno {
    UnknownErrno = 0,
    EPERM = libc::EPERM,
    ENOENT = libc::ENOENT,
    EINTR = libc::EINTR,
    EIO = libc::EIO,
    EBADF = libc::EBADF,
    EAGAIN = libc::EAGAIN,
    ENOMEM = libc::ENOMEM,
    EACCES = libc::EACCES,
    EFAULT = libc::EFAULT,
    EBUSY = libc::EBUSY,
    EEXIST = libc::EEXIST,
    ENODEV = libc::ENODEV,
    EINVAL = libc::EINVAL,
    EMFILE = libc::EMFILE,
    ENFILE = libc::ENFILE,
    ENOTSOCK = libc::ENOTSOCK,
    EMSGSIZE = libc::EMSGSIZE,
    EPROTONOSUPPORT = libc::EPROTONOSUPPORT,
    EAFNOSUPPORT = libc::EAFNOSUPPORT,
    EADDRINUSE = libc::EADDRINUSE,
    EADDRNOTAVAIL = libc::EADDRNOTAVAIL,
    ENETDOWN = libc::ENETDOWN,
    ENETUNREACH = libc::ENETUNREACH,
    ECONNRESET = libc::ECONNRESET,
    ENOBUFS = libc::ENOBUFS,
    EISCONN = libc::EISCONN,
    ENOTCONN = libc::ENOTCONN,
    ETIMEDOUT = libc::ETIMEDOUT,
    ECONNREFUSED = libc::ECONNREFUSED,
    ENOSYS = libc::ENOSYS,
}

impl Errno {
    /// Returns the last error reported by the OS, equivalent to `errno`.
    pub fn last() -> Errno {
        Errno::from_raw(Self::last_raw())
    }

    /// Returns the raw numeric value of the last error, equivalent to `errno`.
    pub fn last_raw() -> i32 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    /// Sets the platform-specific errno to `self`.
    #[cfg(test)]
    pub fn set(self) {
        unsafe { *libc_errno_location() = self as c_int };
    }

    /// Clears the current errno value.
    pub fn clear() {
        unsafe { *libc_errno_location() = 0 };
    }

    /// Converts a raw errno value into an `Errno`, falling back to
    /// `UnknownErrno` if the value isn't one this crate needs to distinguish.
    pub fn from_raw(raw: i32) -> Errno {
        match raw {
            0 => Errno::UnknownErrno,
            libc::EPERM => Errno::EPERM,
            libc::ENOENT => Errno::ENOENT,
            libc::EINTR => Errno::EINTR,
            libc::EIO => Errno::EIO,
            libc::EBADF => Errno::EBADF,
            libc::EAGAIN => Errno::EAGAIN,
            libc::ENOMEM => Errno::ENOMEM,
            libc::EACCES => Errno::EACCES,
            libc::EFAULT => Errno::EFAULT,
            libc::EBUSY => Errno::EBUSY,
            libc::EEXIST => Errno::EEXIST,
            libc::ENODEV => Errno::ENODEV,
            libc::EINVAL => Errno::EINVAL,
            libc::EMFILE => Errno::EMFILE,
            libc::ENFILE => Errno::ENFILE,
            libc::ENOTSOCK => Errno::ENOTSOCK,
            libc::EMSGSIZE => Errno::EMSGSIZE,
            libc::EPROTONOSUPPORT => Errno::EPROTONOSUPPORT,
            libc::EAFNOSUPPORT => Errno::EAFNOSUPPORT,
            libc::EADDRINUSE => Errno::EADDRINUSE,
            libc::EADDRNOTAVAIL => Errno::EADDRNOTAVAIL,
            libc::ENETDOWN => Errno::ENETDOWN,
            libc::ENETUNREACH => Errno::ENETUNREACH,
            libc::ECONNRESET => Errno::ECONNRESET,
            libc::ENOBUFS => Errno::ENOBUFS,
            libc::EISCONN => Errno::EISCONN,
            libc::ENOTCONN => Errno::ENOTCONN,
            libc::ETIMEDOUT => Errno::ETIMEDOUT,
            libc::ECONNREFUSED => Errno::ECONNREFUSED,
            libc::ENOSYS => Errno::ENOSYS,
            _ => Errno::UnknownErrno,
        }
    }

    /// Returns `true` iff this error means "try again later" (`EAGAIN`/`EINTR`).
    pub fn would_block_or_interrupted(self) -> bool {
        matches!(self, Errno::EAGAIN | Errno::EINTR)
    }

    /// Turns a raw syscall return value into a `Result`, the pattern every
    /// wrapper in this crate uses: negative means failure, consult `errno`.
    pub fn result<T: ErrnoSentinel + PartialEq<T>>(ret: T) -> Result<T> {
        if ret == T::sentinel() {
            Err(Errno::last())
        } else {
            Ok(ret)
        }
    }
}

/// A type that has a sentinel value indicating syscall failure.
pub trait ErrnoSentinel: Sized {
    fn sentinel() -> Self;
}

impl ErrnoSentinel for i32 {
    fn sentinel() -> Self {
        -1
    }
}

impl ErrnoSentinel for isize {
    fn sentinel() -> Self {
        -1
    }
}

impl ErrnoSentinel for i64 {
    fn sentinel() -> Self {
        -1
    }
}

unsafe fn libc_errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}: {}", io::Error::from_raw_os_error(*self as i32))
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for io::Error {
    fn from(e: Errno) -> io::Error {
        io::Error::from_raw_os_error(e as i32)
    }
}

/// The result type returned by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_known_errno() {
        assert_eq!(Errno::from_raw(libc::EBUSY), Errno::EBUSY);
        assert_eq!(Errno::EBUSY as i32, libc::EBUSY);
    }

    #[test]
    fn unknown_errno_falls_back() {
        assert_eq!(Errno::from_raw(i32::MAX), Errno::UnknownErrno);
    }

    #[test]
    fn set_and_last_roundtrip() {
        Errno::EINVAL.set();
        assert_eq!(Errno::last(), Errno::EINVAL);
        Errno::clear();
        assert_eq!(Errno::last(), Errno::UnknownErrno);
    }

    #[test]
    fn would_block_or_interrupted() {
        assert!(Errno::EAGAIN.would_block_or_interrupted());
        assert!(Errno::EINTR.would_block_or_interrupted());
        assert!(!Errno::EIO.would_block_or_interrupted());
    }
}
