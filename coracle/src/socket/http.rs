//! HTTP CONNECT socket: an HTTP/1.1 CONNECT exchange upgrades the
//! connection to an opaque byte channel, which lets framed traffic pass
//! infrastructure that only speaks HTTP.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coracle_core::error::{Error, Result};
use coracle_core::stream::{Addr, Conn};

use super::tcp::Tcp;
use super::{Listener, Socket, SocketConn, StreamConn};
use crate::server::Accept;
use crate::tls::{self, TlsConfig};

/// The status line content the server answers a CONNECT with.
pub const HTTP_CONNECTED: &str = "200 Connected to Server";

/// The request path used for the upgrade.
pub const HTTP_PATH: &str = "/";

/// HTTP CONNECT socket; a TLS config upgrades it to `https`.
pub struct Http {
    config: Option<TlsConfig>,
}

impl Http {
    /// Constructor.
    #[must_use]
    pub fn new(config: Option<TlsConfig>) -> Self {
        Self { config }
    }
}

impl Socket for Http {
    fn scheme(&self) -> &'static str {
        if self.config.is_none() {
            "http"
        } else {
            "https"
        }
    }

    fn dial(&self, address: &str) -> Result<Box<dyn SocketConn>> {
        let stream = TcpStream::connect(address)?;
        let conn: Conn = Arc::new(stream);
        let conn = match &self.config {
            Some(config) => tls::wrap_client(conn, config, address)?,
            None => conn,
        };
        conn.write_all(format!("CONNECT {HTTP_PATH} HTTP/1.1\n\n").as_bytes())
            .map_err(Error::from_read)?;
        let head = read_head(&conn)?;
        let status_line = head.lines().next().unwrap_or_default();
        let status = status_line
            .split_once(' ')
            .map_or(status_line, |(_, rest)| rest);
        if status != HTTP_CONNECTED {
            let _ = conn.close();
            return Err(Error::handshake(format!(
                "unexpected HTTP response: {status}"
            )));
        }
        Ok(Box::new(StreamConn(conn)))
    }

    fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let inner = Tcp::new(self.config.clone()).listen(address)?;
        Ok(Box::new(HttpListener { inner }))
    }
}

/// An HTTP CONNECT listener over a TCP (or TLS) listener.
pub struct HttpListener {
    inner: Box<dyn Listener>,
}

impl Listener for HttpListener {
    fn accept(&self) -> Result<Box<dyn SocketConn>> {
        let conn = self.inner.accept()?.connection();
        upgrade_http_conn(&conn)?;
        Ok(Box::new(StreamConn(conn)))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn addr(&self) -> Option<Addr> {
        self.inner.addr()
    }

    fn acceptor(&self) -> Arc<dyn Accept> {
        Arc::new(HttpAcceptor {
            inner: self.inner.acceptor(),
        })
    }
}

struct HttpAcceptor {
    inner: Arc<dyn Accept>,
}

impl Accept for HttpAcceptor {
    fn accept(&self) -> Result<Conn> {
        let conn = self.inner.accept()?;
        upgrade_http_conn(&conn)?;
        Ok(conn)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn addr(&self) -> Option<Addr> {
        self.inner.addr()
    }
}

// Server side of the CONNECT exchange.
fn upgrade_http_conn(conn: &Conn) -> Result<()> {
    let head = read_head(conn)?;
    let request_line = head.lines().next().unwrap_or_default();
    if !request_line.starts_with("CONNECT ") {
        let _ = conn.write_all(
            b"HTTP/1.1 405 Method Not Allowed\r\n\
              Content-Type: text/plain; charset=utf-8\r\n\
              Content-Length: 17\r\n\r\n\
              405 must CONNECT\n",
        );
        let _ = conn.close();
        return Err(Error::handshake("request method must be CONNECT"));
    }
    conn.write_all(format!("HTTP/1.0 {HTTP_CONNECTED}\n\n").as_bytes())
        .map_err(Error::from_read)?;
    Ok(())
}

// Read until the blank line ending an HTTP head. Both sides of the
// CONNECT exchange send no body, so nothing beyond it needs buffering.
fn read_head(conn: &Conn) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = match conn.read(&mut chunk) {
            Ok(0) => return Err(Error::Eof),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from_read(e)),
        };
        head.extend_from_slice(&chunk[..n]);
        let blank = head.windows(2).any(|w| w == b"\n\n")
            || head.windows(4).any(|w| w == b"\r\n\r\n");
        if blank {
            return String::from_utf8(head)
                .map_err(|_| Error::handshake("http head is not valid utf-8"));
        }
        if head.len() > 16 * 1024 {
            return Err(Error::handshake("http head too large"));
        }
    }
}
