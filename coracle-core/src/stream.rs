//! Stream abstraction shared by every transport.
//!
//! [`Stream`] is the minimum capability the reactor and the framer need
//! from a connection: thread-safe reads and writes, close, addresses, and
//! (for pollable transports) the raw descriptor. Connections are shared as
//! [`Conn`] handles; per-direction serialisation is the caller's business
//! (the framer holds independent read and write locks).

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::poll::RawFd;

/// A network end point address: the network name plus its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    network: &'static str,
    address: String,
}

impl Addr {
    /// Constructor.
    #[must_use]
    pub fn new(network: &'static str, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }

    /// Name of the network ("tcp", "unix", "inproc", ...).
    #[must_use]
    pub fn network(&self) -> &'static str {
        self.network
    }

    /// String form of the address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "not supported")
}

/// A generic stream-oriented network connection.
///
/// Methods take `&self`: implementations are internally synchronised where
/// the OS primitive is not already.
pub trait Stream: Send + Sync {
    /// Read into `buf`, returning the number of bytes read. `Ok(0)` means
    /// end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes written.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Flush buffered data, where the transport buffers at all.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Close the connection. Idempotent.
    fn close(&self) -> io::Result<()>;

    /// The local network address.
    fn local_addr(&self) -> Option<Addr> {
        None
    }

    /// The remote network address.
    fn remote_addr(&self) -> Option<Addr> {
        None
    }

    /// The raw descriptor, for transports the kernel poller can watch.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Switch the descriptor between blocking and non-blocking mode.
    fn set_nonblocking(&self, _nonblocking: bool) -> io::Result<()> {
        Err(unsupported())
    }

    /// Set the read deadline.
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Err(unsupported())
    }

    /// Set the write deadline.
    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Err(unsupported())
    }

    /// Write the whole of `buf`, looping over short writes.
    ///
    /// A non-blocking stream that reports `WouldBlock` mid-write is
    /// retried after a short pause: messages are all-or-nothing on the
    /// wire, so a partial frame must never be abandoned to the reactor.
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match self.write(&buf[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

/// A shared handle to a connection.
pub type Conn = Arc<dyn Stream>;

impl Stream for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            r => r,
        }
    }

    fn local_addr(&self) -> Option<Addr> {
        TcpStream::local_addr(self)
            .ok()
            .map(|a| Addr::new("tcp", a.to_string()))
    }

    fn remote_addr(&self) -> Option<Addr> {
        TcpStream::peer_addr(self)
            .ok()
            .map(|a| Addr::new("tcp", a.to_string()))
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl Stream for UnixStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            r => r,
        }
    }

    fn local_addr(&self) -> Option<Addr> {
        UnixStream::local_addr(self).ok().map(|a| {
            let path = a
                .as_pathname()
                .map_or_else(|| "@".to_string(), |p| p.display().to_string());
            Addr::new("unix", path)
        })
    }

    fn remote_addr(&self) -> Option<Addr> {
        UnixStream::peer_addr(self).ok().map(|a| {
            let path = a
                .as_pathname()
                .map_or_else(|| "@".to_string(), |p| p.display().to_string());
            Addr::new("unix", path)
        })
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_write_timeout(self, timeout)
    }
}

/// Adapter lending a [`Conn`] to APIs that want `std::io` traits.
pub struct ConnIo(pub Conn);

impl Read for ConnIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for ConnIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
