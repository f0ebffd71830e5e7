//! epoll-backed poller (Linux).

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Event, Mode};
use crate::error::{Error, Result};

// Internal tick when no timeout is configured, so a closed poller is
// noticed even if no descriptor ever becomes ready.
const DEFAULT_TICK_MS: i32 = 1000;

/// A poller over an epoll instance, level-triggered for reads.
pub struct Poll {
    epfd: RawFd,
    wake: RawFd,
    timeout_ms: AtomicI64,
    closed: AtomicBool,
    // Scratch space for raw kernel events; wait() is single-consumer in
    // practice but the lock keeps the API safe for any caller.
    raw: Mutex<Vec<libc::epoll_event>>,
}

impl Poll {
    /// Create a new poller.
    pub fn create() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let wake = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(Error::Io(err));
        }
        let poll = Self {
            epfd,
            wake,
            timeout_ms: AtomicI64::new(-1),
            closed: AtomicBool::new(false),
            raw: Mutex::new(Vec::new()),
        };
        poll.ctl(libc::EPOLL_CTL_ADD, wake, libc::EPOLLIN as u32)?;
        Ok(poll)
    }

    /// Set the wait timeout. `None` waits until readiness (with an internal
    /// periodic wakeup).
    pub fn set_timeout(&self, d: Option<Duration>) {
        let ms = d.map_or(-1, |d| d.as_millis().min(i64::MAX as u128) as i64);
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Add read interest for `fd`.
    pub fn register(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
    }

    /// Arm one write-readiness notification for `fd`. Read interest stays;
    /// the write interest is cleared again when the event is delivered.
    pub fn want_write(&self, fd: RawFd) -> Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        )
    }

    /// Remove all interest for `fd`.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Block until readiness and fill `events`, returning the event count.
    ///
    /// Returns `Ok(0)` when a configured timeout elapses and
    /// [`Error::Closed`] once the poller is closed.
    pub fn wait(&self, events: &mut [Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let configured = self.timeout_ms.load(Ordering::Relaxed);
            let timeout = if configured < 0 {
                DEFAULT_TICK_MS
            } else {
                configured.min(i64::from(i32::MAX)) as i32
            };
            let mut raw = self.raw.lock().expect("poll lock poisoned");
            raw.resize(
                events.len(),
                libc::epoll_event { events: 0, u64: 0 },
            );
            let n = unsafe {
                libc::epoll_wait(self.epfd, raw.as_mut_ptr(), raw.len() as i32, timeout)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            }
            if n == 0 {
                if configured >= 0 {
                    return Ok(0);
                }
                continue;
            }
            let mut count = 0;
            for ev in raw.iter().take(n as usize) {
                let fd = ev.u64 as RawFd;
                if fd == self.wake {
                    self.drain_wake();
                    continue;
                }
                if ev.events & libc::EPOLLOUT as u32 != 0 {
                    events[count] = Event {
                        fd,
                        mode: Mode::Write,
                    };
                    // One-shot write interest: fall back to read-only. The
                    // unread input, if any, is re-reported level-triggered.
                    let _ = self.ctl(libc::EPOLL_CTL_MOD, fd, libc::EPOLLIN as u32);
                } else {
                    events[count] = Event {
                        fd,
                        mode: Mode::Read,
                    };
                }
                count += 1;
            }
            if count == 0 {
                continue;
            }
            return Ok(count);
        }
    }

    /// Close the poller, waking any blocked [`Poll::wait`]. Idempotent.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let one: u64 = 1;
            unsafe {
                libc::write(self.wake, std::ptr::addr_of!(one).cast(), 8);
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.wake, buf.as_mut_ptr().cast(), 8);
        }
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Poll {
    fn drop(&mut self) {
        self.close();
        unsafe {
            libc::close(self.wake);
            libc::close(self.epfd);
        }
    }
}
