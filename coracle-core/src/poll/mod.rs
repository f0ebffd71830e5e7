//! Readiness notification over the kernel poller.
//!
//! Linux uses epoll, the BSDs and macOS use kqueue. Both are driven
//! level-triggered for read interest, so a partial read leaves the
//! descriptor re-readable on the next [`Poll::wait`]. Write interest is
//! armed one-shot by [`Poll::want_write`] and reverts to read-only once the
//! event has been delivered.
//!
//! On platforms without a supported poller, [`Poll::create`] fails with
//! `system not supported` and callers fall back to one thread per
//! connection.

#[cfg(unix)]
pub use std::os::unix::io::RawFd;

#[cfg(not(unix))]
pub type RawFd = i32;

/// The readiness mode of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The descriptor is readable.
    Read,
    /// The descriptor is writable.
    Write,
}

/// One readiness event produced by [`Poll::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// The file descriptor that became ready.
    pub fd: RawFd,
    /// Read or write readiness.
    pub mode: Mode,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            fd: -1,
            mode: Mode::Read,
        }
    }
}

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Poll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub use kqueue::Poll;

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
mod unsupported;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
pub use unsupported::Poll;
