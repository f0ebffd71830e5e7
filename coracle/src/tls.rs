//! TLS as a transparent byte-stream wrapper.
//!
//! The `s`-suffixed schemes (`tcps`, `unixs`, `wss`, `https`, `inprocs`)
//! wrap their stream in rustls before any protocol bytes flow. Certificate
//! and cipher management stays with the caller: this module only carries a
//! ready-made `ClientConfig`/`ServerConfig` pair and drives the handshake
//! eagerly, the record layer lazily.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};

use coracle_core::error::{Error, Result};
use coracle_core::poll::RawFd;
use coracle_core::stream::{Addr, Conn, ConnIo, Stream};

/// TLS material for a socket. Dialers use `client`, listeners `server`.
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub client: Option<Arc<rustls::ClientConfig>>,
    pub server: Option<Arc<rustls::ServerConfig>>,
}

impl TlsConfig {
    /// Config for a dialing socket.
    #[must_use]
    pub fn client(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            client: Some(config),
            server: None,
        }
    }

    /// Config for a listening socket.
    #[must_use]
    pub fn server(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            server: Some(config),
            client: None,
        }
    }
}

/// Wrap the dialing side; `address` supplies the SNI host (a trailing
/// `:port` is stripped).
pub fn wrap_client(conn: Conn, config: &TlsConfig, address: &str) -> Result<Conn> {
    let client = config
        .client
        .clone()
        .ok_or_else(|| Error::Config("tls client config is not set".into()))?;
    let host = address.rsplit_once(':').map_or(address, |(h, _)| h);
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Config(format!("invalid tls server name: {host}")))?;
    let session = ClientConnection::new(client, name)
        .map_err(|e| Error::Handshake(format!("tls client setup: {e}")))?;
    TlsStream::establish(Session::Client(session), conn)
}

/// Wrap the accepting side.
pub fn wrap_server(conn: Conn, config: &TlsConfig) -> Result<Conn> {
    let server = config
        .server
        .clone()
        .ok_or_else(|| Error::Config("tls server config is not set".into()))?;
    let session = ServerConnection::new(server)
        .map_err(|e| Error::Handshake(format!("tls server setup: {e}")))?;
    TlsStream::establish(Session::Server(session), conn)
}

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Session {
    fn complete_io(&mut self, io: &mut ConnIo) -> io::Result<(usize, usize)> {
        match self {
            Self::Client(c) => c.complete_io(io),
            Self::Server(s) => s.complete_io(io),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Self::Client(c) => c.reader(),
            Self::Server(s) => s.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Self::Client(c) => c.writer(),
            Self::Server(s) => s.writer(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_write(),
            Self::Server(s) => s.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(c) => c.is_handshaking(),
            Self::Server(s) => s.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Client(c) => c.send_close_notify(),
            Self::Server(s) => s.send_close_notify(),
        }
    }
}

struct TlsInner {
    session: Session,
    io: ConnIo,
}

// One lock covers both directions: rustls keeps a single state machine,
// and the framer above serialises each direction anyway.
struct TlsStream {
    inner: Mutex<TlsInner>,
    peer: Conn,
}

impl TlsStream {
    fn establish(mut session: Session, conn: Conn) -> Result<Conn> {
        let mut io = ConnIo(conn.clone());
        while session.is_handshaking() {
            session
                .complete_io(&mut io)
                .map_err(|e| Error::Handshake(format!("tls handshake: {e}")))?;
        }
        Ok(Arc::new(Self {
            inner: Mutex::new(TlsInner { session, io }),
            peer: conn,
        }))
    }
}

impl Stream for TlsStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().expect("tls lock poisoned");
        let TlsInner { session, io } = &mut *guard;
        loop {
            match session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; pull more records.
                    let (rd, _) = session.complete_io(io)?;
                    if rd == 0 {
                        return Ok(0);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().expect("tls lock poisoned");
        let TlsInner { session, io } = &mut *guard;
        let n = session.writer().write(buf)?;
        while session.wants_write() {
            session.complete_io(io)?;
        }
        Ok(n)
    }

    fn flush(&self) -> io::Result<()> {
        let mut guard = self.inner.lock().expect("tls lock poisoned");
        let TlsInner { session, io } = &mut *guard;
        while session.wants_write() {
            session.complete_io(io)?;
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        {
            let mut guard = self.inner.lock().expect("tls lock poisoned");
            let TlsInner { session, io } = &mut *guard;
            session.send_close_notify();
            while session.wants_write() {
                if session.complete_io(io).is_err() {
                    break;
                }
            }
        }
        self.peer.close()
    }

    fn local_addr(&self) -> Option<Addr> {
        self.peer.local_addr()
    }

    fn remote_addr(&self) -> Option<Addr> {
        self.peer.remote_addr()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.peer.raw_fd()
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.peer.set_nonblocking(nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.peer.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.peer.set_write_timeout(timeout)
    }
}
