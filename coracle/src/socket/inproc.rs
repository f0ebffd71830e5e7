//! In-process socket: the loopback transport behind the `inproc` scheme.
//! With a TLS config (`inprocs`) the byte pipes carry TLS records, which
//! is mainly useful for exercising the TLS path without a network.

use std::sync::Arc;

use coracle_core::error::Result;
use coracle_core::inproc;
use coracle_core::stream::{Addr, Conn};

use super::{Listener, Socket, SocketConn, StreamConn};
use crate::server::Accept;
use crate::tls::{self, TlsConfig};

/// In-process socket; a TLS config upgrades it to `inprocs`.
pub struct Inproc {
    config: Option<TlsConfig>,
}

impl Inproc {
    /// Constructor.
    #[must_use]
    pub fn new(config: Option<TlsConfig>) -> Self {
        Self { config }
    }
}

impl Socket for Inproc {
    fn scheme(&self) -> &'static str {
        if self.config.is_none() {
            "inproc"
        } else {
            "inprocs"
        }
    }

    fn dial(&self, address: &str) -> Result<Box<dyn SocketConn>> {
        let conn = inproc::dial(address)?;
        let conn = match &self.config {
            Some(config) => tls::wrap_client(conn, config, address)?,
            None => conn,
        };
        Ok(Box::new(StreamConn(conn)))
    }

    fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let listener = inproc::listen(address)?;
        Ok(Box::new(InprocSocketListener {
            listener,
            config: self.config.clone(),
        }))
    }
}

/// An in-process listener.
pub struct InprocSocketListener {
    listener: inproc::Listener,
    config: Option<TlsConfig>,
}

impl InprocSocketListener {
    fn accept_conn(&self) -> Result<Conn> {
        let conn = self.listener.accept()?;
        match &self.config {
            Some(config) => tls::wrap_server(conn, config),
            None => Ok(conn),
        }
    }
}

impl Listener for InprocSocketListener {
    fn accept(&self) -> Result<Box<dyn SocketConn>> {
        Ok(Box::new(StreamConn(self.accept_conn()?)))
    }

    fn close(&self) -> Result<()> {
        self.listener.close();
        Ok(())
    }

    fn addr(&self) -> Option<Addr> {
        Some(self.listener.addr())
    }

    fn acceptor(&self) -> Arc<dyn Accept> {
        Arc::new(InprocAcceptor {
            listener: self.listener.clone(),
            config: self.config.clone(),
        })
    }
}

struct InprocAcceptor {
    listener: inproc::Listener,
    config: Option<TlsConfig>,
}

impl Accept for InprocAcceptor {
    fn accept(&self) -> Result<Conn> {
        let conn = self.listener.accept()?;
        match &self.config {
            Some(config) => tls::wrap_server(conn, config),
            None => Ok(conn),
        }
    }

    fn close(&self) -> Result<()> {
        self.listener.close();
        Ok(())
    }

    fn addr(&self) -> Option<Addr> {
        Some(self.listener.addr())
    }
}
