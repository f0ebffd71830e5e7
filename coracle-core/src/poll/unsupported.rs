//! Stub poller for platforms without epoll or kqueue.
//!
//! [`Poll::create`] always fails; servers fall back to one thread per
//! connection.

use std::time::Duration;

use super::{Event, RawFd};
use crate::error::{Error, Result};

/// Placeholder poller; cannot be constructed.
pub struct Poll {}

impl Poll {
    /// Always fails with `system not supported`.
    pub fn create() -> Result<Self> {
        Err(Error::SystemNotSupported)
    }

    pub fn set_timeout(&self, _d: Option<Duration>) {}

    pub fn register(&self, _fd: RawFd) -> Result<()> {
        Ok(())
    }

    pub fn want_write(&self, _fd: RawFd) -> Result<()> {
        Ok(())
    }

    pub fn unregister(&self, _fd: RawFd) -> Result<()> {
        Ok(())
    }

    pub fn wait(&self, _events: &mut [Event]) -> Result<usize> {
        Ok(0)
    }

    pub fn close(&self) {}
}
