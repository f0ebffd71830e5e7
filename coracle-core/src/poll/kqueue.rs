//! kqueue-backed poller (macOS and the BSDs).

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Event, Mode};
use crate::error::{Error, Result};

const DEFAULT_TICK_MS: i64 = 1000;
// Ident of the internal EVFILT_USER wake event.
const WAKE_IDENT: usize = 0;

/// A poller over a kqueue, level-triggered for reads.
pub struct Poll {
    kq: RawFd,
    timeout_ms: AtomicI64,
    closed: AtomicBool,
    raw: Mutex<Vec<libc::kevent>>,
}

impl Poll {
    /// Create a new poller.
    pub fn create() -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let poll = Self {
            kq,
            timeout_ms: AtomicI64::new(-1),
            closed: AtomicBool::new(false),
            raw: Mutex::new(Vec::new()),
        };
        // Register the user event used to wake wait() on close.
        poll.change(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
        )?;
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
        self.change(fd as usize, libc::EVFILT_READ, libc::EV_ADD, 0)
    }

    /// Arm one write-readiness notification for `fd`.
    pub fn want_write(&self, fd: RawFd) -> Result<()> {
        self.change(
            fd as usize,
            libc::EVFILT_WRITE,
            libc::EV_ADD | libc::EV_ONESHOT,
            0,
        )
    }

    /// Remove all interest for `fd`.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        // The write filter is one-shot and may already be gone.
        let _ = self.change(fd as usize, libc::EVFILT_WRITE, libc::EV_DELETE, 0);
        self.change(fd as usize, libc::EVFILT_READ, libc::EV_DELETE, 0)
    }

    /// Block until readiness and fill `events`, returning the event count.
    pub fn wait(&self, events: &mut [Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let configured = self.timeout_ms.load(Ordering::Relaxed);
            let wait_ms = if configured < 0 {
                DEFAULT_TICK_MS
            } else {
                configured
            };
            let ts = libc::timespec {
                tv_sec: wait_ms / 1000,
                tv_nsec: (wait_ms % 1000) * 1_000_000,
            };
            let mut raw = self.raw.lock().expect("poll lock poisoned");
            raw.resize(events.len(), zeroed_kevent());
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    raw.as_mut_ptr(),
                    raw.len() as i32,
                    &ts,
                )
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
                if ev.filter == libc::EVFILT_USER && ev.ident == WAKE_IDENT {
                    continue;
                }
                let mode = if ev.filter == libc::EVFILT_WRITE {
                    Mode::Write
                } else {
                    Mode::Read
                };
                events[count] = Event {
                    fd: ev.ident as RawFd,
                    mode,
                };
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
            let _ = self.change(
                WAKE_IDENT,
                libc::EVFILT_USER,
                libc::EV_ENABLE,
                libc::NOTE_TRIGGER,
            );
        }
    }

    fn change(&self, ident: usize, filter: i16, flags: u16, fflags: u32) -> Result<()> {
        let mut ev = zeroed_kevent();
        ev.ident = ident;
        ev.filter = filter;
        ev.flags = flags;
        ev.fflags = fflags;
        let rc = unsafe { libc::kevent(self.kq, &ev, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn zeroed_kevent() -> libc::kevent {
    libc::kevent {
        ident: 0,
        filter: 0,
        flags: 0,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

impl Drop for Poll {
    fn drop(&mut self) {
        self.close();
        unsafe {
            libc::close(self.kq);
        }
    }
}
