//! WebSocket socket: RFC 6455 over TCP (`ws`) or TLS (`wss`).
//!
//! `accept` and the `serve_*` variants perform the WebSocket upgrade;
//! `messages()` is the WebSocket connection itself rather than the varint
//! framer, so one message equals one frame sequence on the wire.

use std::net::TcpStream;
use std::sync::Arc;

use coracle_core::error::{Error, Result};
use coracle_core::messages::Messages;
use coracle_core::stream::{Addr, Conn};
use coracle_ws::conn::Conn as WsConn;

use super::tcp::Tcp;
use super::{Ctx, DataFn, Listener, OpenConnFn, OpenMessagesFn, OpenedFn, ServeFn, Socket, SocketConn};
use crate::handler::ConnHandler;
use crate::server::{Accept, Server};
use crate::tls::{self, TlsConfig};

/// The upgrade request path used by WebSocket sockets.
pub const WS_PATH: &str = "/";

/// WebSocket socket; a TLS config upgrades it to `wss`.
pub struct Ws {
    config: Option<TlsConfig>,
}

impl Ws {
    /// Constructor.
    #[must_use]
    pub fn new(config: Option<TlsConfig>) -> Self {
        Self { config }
    }
}

impl Socket for Ws {
    fn scheme(&self) -> &'static str {
        if self.config.is_none() {
            "ws"
        } else {
            "wss"
        }
    }

    fn dial(&self, address: &str) -> Result<Box<dyn SocketConn>> {
        let stream = TcpStream::connect(address)?;
        let _ = stream.set_nodelay(false);
        let conn: Conn = Arc::new(stream);
        let conn = match &self.config {
            Some(config) => tls::wrap_client(conn, config, address)?,
            None => conn,
        };
        let ws = WsConn::connect(conn, address, WS_PATH)?;
        Ok(Box::new(WsSocketConn { ws: Arc::new(ws) }))
    }

    fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let inner = Tcp::new(self.config.clone()).listen(address)?;
        Ok(Box::new(WsListener { inner }))
    }
}

/// A WebSocket connection as a [`SocketConn`].
pub struct WsSocketConn {
    ws: Arc<WsConn>,
}

impl SocketConn for WsSocketConn {
    fn messages(&self) -> Arc<dyn Messages> {
        self.ws.clone()
    }

    fn connection(&self) -> Conn {
        self.ws.clone()
    }
}

/// A WebSocket listener over a TCP (or TLS) listener.
///
/// The plain [`Listener::serve`] hands the handler the raw accepted
/// stream (its `upgrade` decides what to do with it); the closure-based
/// variants below perform the WebSocket upgrade first.
pub struct WsListener {
    inner: Box<dyn Listener>,
}

impl Listener for WsListener {
    fn accept(&self) -> Result<Box<dyn SocketConn>> {
        let conn = self.inner.accept()?.connection();
        let ws = WsConn::accept(conn)?;
        Ok(Box::new(WsSocketConn { ws: Arc::new(ws) }))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn addr(&self) -> Option<Addr> {
        self.inner.addr()
    }

    fn acceptor(&self) -> Arc<dyn Accept> {
        self.inner.acceptor()
    }

    fn serve_data(&self, opened: Option<OpenedFn>, handler: DataFn) -> Result<()> {
        let upgrade = move |conn: Conn| -> Result<Ctx> {
            let ws: Arc<WsConn> = Arc::new(WsConn::accept(conn)?);
            if let Some(opened) = &opened {
                opened(&(ws.clone() as Conn))?;
            }
            Ok(Box::new(ws) as Ctx)
        };
        let serve = move |ctx: &mut Ctx| -> Result<()> {
            let ws = downcast_ws(ctx)?;
            let mut buf = Vec::new();
            let n = ws.read_message(&mut buf)?;
            let res = handler(&buf[..n]);
            if res.is_empty() {
                return Ok(());
            }
            ws.write_message(&res)
        };
        Server::new(ConnHandler::new(upgrade, serve)).serve_acceptor(self.acceptor())
    }

    fn serve_conn(&self, opened: OpenConnFn, serve: ServeFn) -> Result<()> {
        let upgrade = move |conn: Conn| -> Result<Ctx> {
            let ws = WsConn::accept(conn)?;
            opened(Arc::new(ws) as Conn)
        };
        Server::new(ConnHandler::new(upgrade, serve)).serve_acceptor(self.acceptor())
    }

    fn serve_messages(&self, opened: OpenMessagesFn, serve: ServeFn) -> Result<()> {
        let upgrade = move |conn: Conn| -> Result<Ctx> {
            let ws = Arc::new(WsConn::accept(conn)?);
            opened(ws as Arc<dyn Messages>)
        };
        Server::new(ConnHandler::new(upgrade, serve)).serve_acceptor(self.acceptor())
    }
}

fn downcast_ws(ctx: &mut Ctx) -> Result<&Arc<WsConn>> {
    ctx.downcast_ref::<Arc<WsConn>>()
        .ok_or_else(|| Error::Config("handler context type mismatch".into()))
}
