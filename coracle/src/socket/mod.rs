//! Scheme-tagged socket abstraction.
//!
//! One [`Socket`] per network scheme: `tcp`, `unix`, `http` (CONNECT
//! upgrade), `ws` and `inproc`, each with an `s`-suffixed TLS variant
//! selected by supplying a [`TlsConfig`](crate::tls::TlsConfig). A socket
//! dials connections and opens listeners; listeners hand accepted
//! connections to the reactor through the `serve_*` family.

use std::any::Any;
use std::sync::Arc;

use coracle_core::error::{Error, Result};
use coracle_core::messages::{Messages, StreamMessages};
use coracle_core::stream::{Addr, Conn};

use crate::handler::{ConnHandler, DataHandler, DynHandler};
use crate::server::{Accept, Server};
use crate::tls::TlsConfig;

mod http;
mod inproc;
mod tcp;
#[cfg(unix)]
mod unix;
mod ws;

pub use http::Http;
pub use inproc::Inproc;
pub use tcp::Tcp;
#[cfg(unix)]
pub use unix::Unix;
pub use ws::Ws;

/// Per-connection hook run once on accept, before serving starts.
pub type OpenedFn = Box<dyn Fn(&Conn) -> Result<()> + Send + Sync>;

/// Request handler for [`Listener::serve_data`].
pub type DataFn = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Type-erased per-connection context for the closure-based serve
/// variants.
pub type Ctx = Box<dyn Any + Send>;

/// Upgrade closure for [`Listener::serve_conn`].
pub type OpenConnFn = Box<dyn Fn(Conn) -> Result<Ctx> + Send + Sync>;

/// Upgrade closure for [`Listener::serve_messages`].
pub type OpenMessagesFn = Box<dyn Fn(Arc<dyn Messages>) -> Result<Ctx> + Send + Sync>;

/// Serve closure shared by the closure-based serve variants.
pub type ServeFn = Box<dyn Fn(&mut Ctx) -> Result<()> + Send + Sync>;

/// A connection produced by a [`Socket`].
pub trait SocketConn: Send + Sync {
    /// Framed-message view of this connection.
    fn messages(&self) -> Arc<dyn Messages>;

    /// The underlying byte stream.
    fn connection(&self) -> Conn;
}

/// A generic network dialer and listener for one scheme.
pub trait Socket: Send + Sync {
    /// The socket's scheme, e.g. `tcp` or `tcps`.
    fn scheme(&self) -> &'static str;

    /// Connect to an address.
    fn dial(&self, address: &str) -> Result<Box<dyn SocketConn>>;

    /// Announce on a local address.
    fn listen(&self, address: &str) -> Result<Box<dyn Listener>>;
}

impl std::fmt::Debug for dyn Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("scheme", &self.scheme()).finish()
    }
}

/// A listener for one scheme.
pub trait Listener: Send + Sync {
    /// Wait for and return the next connection.
    fn accept(&self) -> Result<Box<dyn SocketConn>>;

    /// Close the listener; blocked accepts unblock with an error.
    fn close(&self) -> Result<()>;

    /// The listener's network address.
    fn addr(&self) -> Option<Addr>;

    /// A shareable accept handle feeding the reactor. Transports with a
    /// stream upgrade (TLS, CONNECT, WebSocket) apply it here.
    fn acceptor(&self) -> Arc<dyn Accept>;

    /// Serve a handler over this listener. Blocks until close.
    fn serve(&self, handler: Arc<dyn DynHandler>) -> Result<()> {
        Server::new(handler).serve_acceptor(self.acceptor())
    }

    /// Serve a request/response function: one read, one call, one write.
    fn serve_data(&self, opened: Option<OpenedFn>, handler: DataFn) -> Result<()> {
        let mut h = DataHandler::new(handler);
        if let Some(opened) = opened {
            h = h.with_upgrade(Box::new(move |conn: Conn| {
                opened(&conn)?;
                Ok(conn)
            }));
        }
        Server::new(h).serve_acceptor(self.acceptor())
    }

    /// Serve an upgrade/serve closure pair over raw connections.
    fn serve_conn(&self, opened: OpenConnFn, serve: ServeFn) -> Result<()> {
        Server::new(ConnHandler::new(opened, serve)).serve_acceptor(self.acceptor())
    }

    /// Serve an upgrade/serve closure pair over framed messages.
    fn serve_messages(&self, opened: OpenMessagesFn, serve: ServeFn) -> Result<()> {
        let upgrade = move |conn: Conn| {
            let messages: Arc<dyn Messages> = Arc::new(StreamMessages::new(conn, true, 0, 0));
            opened(messages)
        };
        Server::new(ConnHandler::new(upgrade, serve)).serve_acceptor(self.acceptor())
    }
}

/// Dispatch on a network name. The `s`-suffixed names expect a
/// [`TlsConfig`]; a config supplied with the bare name enables TLS just
/// the same.
pub fn new_socket(network: &str, config: Option<TlsConfig>) -> Result<Box<dyn Socket>> {
    match network {
        "tcp" | "tcps" => Ok(Box::new(Tcp::new(config))),
        #[cfg(unix)]
        "unix" | "unixs" => Ok(Box::new(Unix::new(config))),
        "http" | "https" => Ok(Box::new(Http::new(config))),
        "ws" | "wss" => Ok(Box::new(Ws::new(config))),
        "inproc" | "inprocs" => Ok(Box::new(Inproc::new(config))),
        _ => Err(Error::Network),
    }
}

/// Format `scheme://addr` for a socket.
#[must_use]
pub fn url(socket: &dyn Socket, addr: &str) -> String {
    format!("{}://{addr}", socket.scheme())
}

/// Strip the socket's scheme prefix from a url.
pub fn address(socket: &dyn Socket, url: &str) -> Result<String> {
    let prefix = format!("{}://", socket.scheme());
    url.strip_prefix(&prefix)
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("error url: {url}")))
}

/// The standard [`SocketConn`] for plain byte-stream transports: framed
/// messages come from the varint framer in shared-buffer mode.
pub struct StreamConn(pub Conn);

impl SocketConn for StreamConn {
    fn messages(&self) -> Arc<dyn Messages> {
        Arc::new(StreamMessages::new(self.0.clone(), false, 0, 0))
    }

    fn connection(&self) -> Conn {
        self.0.clone()
    }
}
