//! UNIX domain socket, plain or TLS.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coracle_core::error::{Error, Result};
use coracle_core::stream::{Addr, Conn};

use super::{Listener, Socket, SocketConn, StreamConn};
use crate::server::Accept;
use crate::tls::{self, TlsConfig};

/// UNIX domain socket; a TLS config upgrades it to `unixs`.
pub struct Unix {
    config: Option<TlsConfig>,
}

impl Unix {
    /// Constructor.
    #[must_use]
    pub fn new(config: Option<TlsConfig>) -> Self {
        Self { config }
    }
}

impl Socket for Unix {
    fn scheme(&self) -> &'static str {
        if self.config.is_none() {
            "unix"
        } else {
            "unixs"
        }
    }

    fn dial(&self, address: &str) -> Result<Box<dyn SocketConn>> {
        let stream = UnixStream::connect(address)?;
        let conn: Conn = Arc::new(stream);
        let conn = match &self.config {
            Some(config) => tls::wrap_client(conn, config, address)?,
            None => conn,
        };
        Ok(Box::new(StreamConn(conn)))
    }

    fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let listener = UnixListener::bind(address)?;
        Ok(Box::new(UnixSocketListener {
            shared: Arc::new(UnixListenerShared {
                listener,
                path: PathBuf::from(address),
                config: self.config.clone(),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

// Unblocks a blocked accept; the descriptor itself stays alive until the
// listener drops.
#[allow(unsafe_code)]
fn shutdown_listener(listener: &UnixListener) {
    unsafe {
        libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
    }
}

struct UnixListenerShared {
    listener: UnixListener,
    path: PathBuf,
    config: Option<TlsConfig>,
    closed: AtomicBool,
}

impl UnixListenerShared {
    fn accept_conn(&self) -> Result<Conn> {
        let (stream, _peer) = self.listener.accept().map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                Error::Closed
            } else {
                Error::Io(e)
            }
        })?;
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
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }

    fn addr(&self) -> Option<Addr> {
        Some(Addr::new("unix", self.path.display().to_string()))
    }
}

impl Accept for Arc<UnixListenerShared> {
    fn accept(&self) -> Result<Conn> {
        self.accept_conn()
    }

    fn close(&self) -> Result<()> {
        UnixListenerShared::close(self)
    }

    fn addr(&self) -> Option<Addr> {
        UnixListenerShared::addr(self)
    }
}

/// A UNIX domain socket listener.
pub struct UnixSocketListener {
    shared: Arc<UnixListenerShared>,
}

impl Listener for UnixSocketListener {
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
