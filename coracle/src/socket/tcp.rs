//! TCP socket, plain or TLS.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Socket as RawSocket, Type};

use coracle_core::error::{Error, Result};
use coracle_core::stream::{Addr, Conn};

use super::{Listener, Socket, SocketConn, StreamConn};
use crate::server::Accept;
use crate::tls::{self, TlsConfig};

/// TCP socket; a TLS config upgrades it to `tcps`.
pub struct Tcp {
    config: Option<TlsConfig>,
}

impl Tcp {
    /// Constructor.
    #[must_use]
    pub fn new(config: Option<TlsConfig>) -> Self {
        Self { config }
    }
}

impl Socket for Tcp {
    fn scheme(&self) -> &'static str {
        if self.config.is_none() {
            "tcp"
        } else {
            "tcps"
        }
    }

    fn dial(&self, address: &str) -> Result<Box<dyn SocketConn>> {
        let stream = TcpStream::connect(address)?;
        // Leave Nagle on: the batching writer owns write coalescing.
        let _ = stream.set_nodelay(false);
        let conn: Conn = Arc::new(stream);
        let conn = match &self.config {
            Some(config) => tls::wrap_client(conn, config, address)?,
            None => conn,
        };
        Ok(Box::new(StreamConn(conn)))
    }

    fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let listener = bind(address)?;
        Ok(Box::new(TcpSocketListener {
            shared: Arc::new(TcpListenerShared {
                listener,
                config: self.config.clone(),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

// std's bind does not set SO_REUSEADDR, which makes quick restart cycles
// flaky; build the listener through socket2 instead.
fn bind(address: &str) -> Result<TcpListener> {
    let addr: SocketAddr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve {address}")))?;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = RawSocket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

struct TcpListenerShared {
    listener: TcpListener,
    config: Option<TlsConfig>,
    closed: AtomicBool,
}

impl TcpListenerShared {
    fn accept_conn(&self) -> Result<Conn> {
        let (stream, _peer) = self.listener.accept().map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                Error::Closed
            } else {
                Error::Io(e)
            }
        })?;
        let _ = stream.set_nodelay(false);
        let conn: Conn = Arc::new(stream);
        match &self.config {
            Some(config) => tls::wrap_server(conn, config),
            None => Ok(conn),
        }
    }

    fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        shutdown_listener(&self.listener);
        Ok(())
    }

    fn addr(&self) -> Option<Addr> {
        self.listener
            .local_addr()
            .ok()
            .map(|a| Addr::new("tcp", a.to_string()))
    }
}

// Unblocks a blocked accept; the descriptor itself stays alive until the
// listener drops.
#[cfg(unix)]
#[allow(unsafe_code)]
fn shutdown_listener(listener: &TcpListener) {
    unsafe {
        libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
    }
}

#[cfg(not(unix))]
fn shutdown_listener(_listener: &TcpListener) {}

// The Arc is the accept handle: the same shared state backs the listener
// and the reactor.
impl Accept for Arc<TcpListenerShared> {
    fn accept(&self) -> Result<Conn> {
        self.accept_conn()
    }

    fn close(&self) -> Result<()> {
        TcpListenerShared::close(self)
    }

    fn addr(&self) -> Option<Addr> {
        TcpListenerShared::addr(self)
    }
}

/// A TCP listener.
pub struct TcpSocketListener {
    shared: Arc<TcpListenerShared>,
}

impl Listener for TcpSocketListener {
    fn accept(&self) -> Result<Box<dyn SocketConn>> {
        Ok(Box::new(StreamConn(self.shared.accept_conn()?)))
    }

    fn close(&self) -> Result<()> {
        self.shared.close()
    }

    fn addr(&self) -> Option<Addr> {
        self.shared.addr()
    }

    fn acceptor(&self) -> Arc<dyn Accept> {
        Arc::new(self.shared.clone())
    }
}
