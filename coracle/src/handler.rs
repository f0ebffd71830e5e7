//! The per-connection handler protocol.
//!
//! A [`Handler`] turns an accepted connection into a context once
//! (`upgrade`) and then serves one request per readiness event (`serve`).
//! The context is a type parameter: the reactor treats it opaquely and
//! guarantees at most one `serve` per connection at a time.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use coracle_core::buffer::{self, Pool};
use coracle_core::error::{Error, Result};
use coracle_core::stream::Conn;

/// Default read buffer for [`DataHandler`].
const DATA_BUFFER_SIZE: usize = 65536;

/// Per-connection protocol logic.
pub trait Handler: Send + Sync + 'static {
    /// State carried between `serve` invocations of one connection.
    type Ctx: Send + 'static;

    /// Called once per connection, before it is registered with the
    /// poller. Failing here closes the connection.
    fn upgrade(&self, conn: Conn) -> Result<Self::Ctx>;

    /// Called on every read-readiness event, serially per connection.
    /// A terminal error (EOF class) tears the connection down.
    fn serve(&self, ctx: &mut Self::Ctx) -> Result<()>;
}

impl<H: Handler> Handler for Arc<H> {
    type Ctx = H::Ctx;

    fn upgrade(&self, conn: Conn) -> Result<Self::Ctx> {
        (**self).upgrade(conn)
    }

    fn serve(&self, ctx: &mut Self::Ctx) -> Result<()> {
        (**self).serve(ctx)
    }
}

/// A handler built from an upgrade closure and a serve closure.
pub struct ConnHandler<U, S, C> {
    upgrade: U,
    serve: S,
    _ctx: PhantomData<fn() -> C>,
}

impl<U, S, C> ConnHandler<U, S, C>
where
    U: Fn(Conn) -> Result<C> + Send + Sync + 'static,
    S: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    C: Send + 'static,
{
    /// Constructor.
    pub fn new(upgrade: U, serve: S) -> Self {
        Self {
            upgrade,
            serve,
            _ctx: PhantomData,
        }
    }
}

impl<U, S, C> Handler for ConnHandler<U, S, C>
where
    U: Fn(Conn) -> Result<C> + Send + Sync + 'static,
    S: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    C: Send + 'static,
{
    type Ctx = C;

    fn upgrade(&self, conn: Conn) -> Result<C> {
        (self.upgrade)(conn)
    }

    fn serve(&self, ctx: &mut C) -> Result<()> {
        (self.serve)(ctx)
    }
}

/// Stream-upgrade hook for [`DataHandler`], e.g. a TLS wrap.
pub type UpgradeFn = Box<dyn Fn(Conn) -> Result<Conn> + Send + Sync>;

/// Request/response handler: one read, one `handler` call, one write.
///
/// The request slice is borrowed from a buffer that goes back to the
/// shared pool after the call; handlers that keep the bytes copy them.
/// `no_shared` trades the pool for a private per-connection buffer.
pub struct DataHandler<F> {
    /// Read buffer size; 0 selects the default of 64 KiB.
    pub buffer_size: usize,
    /// Use a private per-connection buffer instead of the shared pool.
    pub no_shared: bool,
    handler: F,
    upgrade: Option<UpgradeFn>,
}

impl<F> DataHandler<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    /// Constructor.
    pub fn new(handler: F) -> Self {
        Self {
            buffer_size: 0,
            no_shared: false,
            handler,
            upgrade: None,
        }
    }

    /// Set the read buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Use a private buffer per connection.
    #[must_use]
    pub fn with_no_shared(mut self, no_shared: bool) -> Self {
        self.no_shared = no_shared;
        self
    }

    /// Install a stream-upgrade hook run once per connection.
    #[must_use]
    pub fn with_upgrade(mut self, upgrade: UpgradeFn) -> Self {
        self.upgrade = Some(upgrade);
        self
    }
}

/// Context of a [`DataHandler`] connection.
pub struct DataCtx {
    conn: Conn,
    pool: Option<Arc<Pool>>,
    buffer: Vec<u8>,
}

impl<F> Handler for DataHandler<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    type Ctx = DataCtx;

    fn upgrade(&self, conn: Conn) -> Result<DataCtx> {
        let conn = match &self.upgrade {
            Some(f) => f(conn)?,
            None => conn,
        };
        let size = if self.buffer_size < 1 {
            DATA_BUFFER_SIZE
        } else {
            self.buffer_size
        };
        Ok(if self.no_shared {
            DataCtx {
                conn,
                pool: None,
                buffer: vec![0u8; size],
            }
        } else {
            DataCtx {
                conn,
                pool: Some(buffer::assign_pool(size)),
                buffer: Vec::new(),
            }
        })
    }

    fn serve(&self, ctx: &mut DataCtx) -> Result<()> {
        let mut buf = match &ctx.pool {
            Some(pool) => pool.get_buffer(),
            None => std::mem::take(&mut ctx.buffer),
        };
        let result = match ctx.conn.read(&mut buf) {
            Ok(0) => Err(Error::Eof),
            Ok(n) => {
                let res = (self.handler)(&buf[..n]);
                if res.is_empty() {
                    Ok(())
                } else {
                    ctx.conn.write_all(&res).map_err(Error::from_read)
                }
            }
            Err(e) => Err(Error::from_read(e)),
        };
        match &ctx.pool {
            Some(pool) => pool.put_buffer(buf),
            None => ctx.buffer = buf,
        }
        result
    }
}

/// Object-safe form of [`Handler`], for listeners that take a handler as
/// a trait object.
pub trait DynHandler: Send + Sync {
    fn upgrade_boxed(&self, conn: Conn) -> Result<Box<dyn Any + Send>>;
    fn serve_boxed(&self, ctx: &mut Box<dyn Any + Send>) -> Result<()>;
}

struct Erased<H: Handler>(H);

impl<H: Handler> DynHandler for Erased<H> {
    fn upgrade_boxed(&self, conn: Conn) -> Result<Box<dyn Any + Send>> {
        Ok(Box::new(self.0.upgrade(conn)?))
    }

    fn serve_boxed(&self, ctx: &mut Box<dyn Any + Send>) -> Result<()> {
        let ctx = ctx
            .downcast_mut::<H::Ctx>()
            .ok_or_else(|| Error::Config("handler context type mismatch".into()))?;
        self.0.serve(ctx)
    }
}

/// Erase a typed handler into a [`DynHandler`].
pub fn erase<H: Handler>(handler: H) -> Arc<dyn DynHandler> {
    Arc::new(Erased(handler))
}

impl Handler for Arc<dyn DynHandler> {
    type Ctx = Box<dyn Any + Send>;

    fn upgrade(&self, conn: Conn) -> Result<Self::Ctx> {
        self.upgrade_boxed(conn)
    }

    fn serve(&self, ctx: &mut Self::Ctx) -> Result<()> {
        self.serve_boxed(ctx)
    }
}
