//! In-process loopback transport.
//!
//! A [`Stream`]-compatible transport that never touches the kernel: dialled
//! and accepted halves are wired through in-memory byte pipes, rendezvoused
//! over a process-wide listener registry. Used by tests and by same-process
//! clients that want the full framer/handler stack without a socket.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::stream::{Addr, Conn, Stream};

const NETWORK: &str = "inproc";

/// Process-wide registry of in-process listeners.
static LISTENERS: Lazy<DashMap<String, Arc<ListenerShared>>> = Lazy::new(DashMap::new);

/// Announce on an in-process address.
pub fn listen(address: &str) -> Result<Listener> {
    let shared = Arc::new(ListenerShared {
        addr: Addr::new(NETWORK, address),
        state: Mutex::new(AcceptState {
            accepters: Vec::new(),
        }),
        cond: Condvar::new(),
        closed: AtomicBool::new(false),
    });
    let entry = LISTENERS.entry(address.to_string());
    match entry {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AddrInUse),
        dashmap::mapref::entry::Entry::Vacant(v) => {
            v.insert(shared.clone());
            Ok(Listener { shared })
        }
    }
}

/// Connect to an in-process address.
///
/// Parks until a pending [`Listener::accept`] takes the other half. The
/// returned connection reports the listener address as both its local and
/// remote address.
pub fn dial(address: &str) -> Result<Conn> {
    let shared = LISTENERS
        .get(address)
        .map(|e| e.value().clone())
        .ok_or(Error::ConnectionRefused)?;

    let accepter = {
        let mut st = shared.state.lock().expect("inproc lock poisoned");
        loop {
            if shared.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if let Some(a) = st.accepters.pop() {
                break a;
            }
            st = shared.cond.wait(st).expect("inproc lock poisoned");
        }
    };

    let (dial_half, accept_half) = pair(shared.addr.clone());
    if accepter.send(accept_half).is_err() {
        return Err(Error::Closed);
    }
    Ok(dial_half)
}

#[derive(Debug)]
struct AcceptState {
    accepters: Vec<flume::Sender<Conn>>,
}

#[derive(Debug)]
struct ListenerShared {
    addr: Addr,
    state: Mutex<AcceptState>,
    cond: Condvar,
    closed: AtomicBool,
}

/// An in-process listener. Clones share the same listening address.
#[derive(Debug, Clone)]
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    /// Wait for and return the next connection.
    pub fn accept(&self) -> Result<Conn> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (tx, rx) = flume::bounded(1);
        {
            let mut st = self.shared.state.lock().expect("inproc lock poisoned");
            st.accepters.push(tx);
        }
        self.shared.cond.notify_all();
        rx.recv().map_err(|_| Error::Closed)
    }

    /// The listener's network address.
    #[must_use]
    pub fn addr(&self) -> Addr {
        self.shared.addr.clone()
    }

    /// Close the listener; blocked accepts and dials unblock with
    /// `use of closed network connection`. Idempotent.
    pub fn close(&self) {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        LISTENERS.remove(self.shared.addr.address());
        let accepters = {
            let mut st = self.shared.state.lock().expect("inproc lock poisoned");
            std::mem::take(&mut st.accepters)
        };
        // Dropping the handoff channels unblocks pending accepts.
        drop(accepters);
        self.shared.cond.notify_all();
    }
}

// Build both connection halves: each side reads what the other writes.
fn pair(addr: Addr) -> (Conn, Conn) {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let a = Arc::new(InprocStream {
        read: b_to_a.clone(),
        write: a_to_b.clone(),
        laddr: addr.clone(),
        raddr: addr.clone(),
    });
    let b = Arc::new(InprocStream {
        read: a_to_b,
        write: b_to_a,
        laddr: addr.clone(),
        raddr: addr,
    });
    (a, b)
}

struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

// A buffered in-memory byte pipe. Reads park until data or close; writes
// always complete.
#[derive(Clone)]
struct Pipe {
    state: Arc<(Mutex<PipeState>, Condvar)>,
}

impl Pipe {
    fn new() -> Self {
        Self {
            state: Arc::new((
                Mutex::new(PipeState {
                    data: VecDeque::new(),
                    closed: false,
                }),
                Condvar::new(),
            )),
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cond) = &*self.state;
        let mut st = lock.lock().expect("inproc pipe lock poisoned");
        while st.data.is_empty() {
            if st.closed {
                return Ok(0);
            }
            st = cond.wait(st).expect("inproc pipe lock poisoned");
        }
        let n = buf.len().min(st.data.len());
        for (i, b) in st.data.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let (lock, cond) = &*self.state;
        let mut st = lock.lock().expect("inproc pipe lock poisoned");
        if st.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "use of closed network connection",
            ));
        }
        st.data.extend(buf.iter().copied());
        cond.notify_all();
        Ok(buf.len())
    }

    fn close(&self) {
        let (lock, cond) = &*self.state;
        let mut st = lock.lock().expect("inproc pipe lock poisoned");
        st.closed = true;
        cond.notify_all();
    }
}

struct InprocStream {
    read: Pipe,
    write: Pipe,
    laddr: Addr,
    raddr: Addr,
}

impl Stream for InprocStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.write.write(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.write.close();
        self.read.close();
        Ok(())
    }

    fn local_addr(&self) -> Option<Addr> {
        Some(self.laddr.clone())
    }

    fn remote_addr(&self) -> Option<Addr> {
        Some(self.raddr.clone())
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "not supported"))
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "not supported"))
    }
}

impl Drop for InprocStream {
    fn drop(&mut self) {
        self.write.close();
        self.read.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_dial_without_listener_is_refused() {
        let err = dial("nobody-home").unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused));
    }

    #[test]
    fn test_double_listen_fails() {
        let l = listen("test-inproc-dup").unwrap();
        let err = listen("test-inproc-dup").unwrap_err();
        assert!(matches!(err, Error::AddrInUse));
        l.close();
        // Address is free again after close.
        let l = listen("test-inproc-dup").unwrap();
        l.close();
    }

    #[test]
    fn test_echo() {
        let l = listen("test-inproc-echo").unwrap();
        let server = {
            let l = l.clone();
            thread::spawn(move || {
                let conn = l.accept().unwrap();
                let mut buf = [0u8; 16];
                let n = conn.read(&mut buf).unwrap();
                conn.write_all(&buf[..n]).unwrap();
            })
        };
        let conn = dial("test-inproc-echo").unwrap();
        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.join().unwrap();
        l.close();
    }

    #[test]
    fn test_addresses_mirror_listener() {
        let l = listen("test-inproc-addr").unwrap();
        let accepted = {
            let l = l.clone();
            thread::spawn(move || l.accept().unwrap())
        };
        let conn = dial("test-inproc-addr").unwrap();
        let accepted = accepted.join().unwrap();
        // Both halves report the listener address on both ends.
        assert_eq!(conn.local_addr(), conn.remote_addr());
        assert_eq!(conn.local_addr().unwrap().address(), "test-inproc-addr");
        assert_eq!(accepted.remote_addr().unwrap().address(), "test-inproc-addr");
        l.close();
    }

    #[test]
    fn test_close_unblocks_accept() {
        let l = listen("test-inproc-close").unwrap();
        let waiter = {
            let l = l.clone();
            thread::spawn(move || l.accept())
        };
        thread::sleep(Duration::from_millis(20));
        l.close();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed));
        l.close();
    }

    #[test]
    fn test_read_after_peer_close_is_eof() {
        let l = listen("test-inproc-eof").unwrap();
        let accepted = {
            let l = l.clone();
            thread::spawn(move || l.accept().unwrap())
        };
        let conn = dial("test-inproc-eof").unwrap();
        let accepted = accepted.join().unwrap();
        conn.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(accepted.read(&mut buf).unwrap(), 0);
        l.close();
    }

    #[test]
    fn test_deadlines_not_supported() {
        let l = listen("test-inproc-deadline").unwrap();
        let accepted = {
            let l = l.clone();
            thread::spawn(move || l.accept().unwrap())
        };
        let conn = dial("test-inproc-deadline").unwrap();
        accepted.join().unwrap();
        let err = conn.set_read_timeout(None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        l.close();
    }
}
