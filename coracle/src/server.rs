//! The reactor: readiness events in, handler invocations out.
//!
//! `serve` runs a blocking accept loop. Each accepted connection is
//! upgraded once, switched to non-blocking and registered with the kernel
//! poller; a reactor thread translates read-readiness into `serve`
//! dispatches on the scheduler. A per-connection lock keeps invocations
//! serial, and level-triggered polling makes it safe to skip an event
//! while one is in flight.
//!
//! Connections without a pollable descriptor (in-process transports) and
//! platforms without a kernel poller fall back to one thread per
//! connection looping `serve` until a terminal error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::Duration;

use coracle_core::error::{Error, Result};
use coracle_core::poll::{Event, Mode, Poll, RawFd};
use coracle_core::scheduler::{Scheduler, SchedulerOptions};
use coracle_core::stream::{Addr, Conn};

use crate::handler::Handler;

/// Something a server can accept connections from.
pub trait Accept: Send + Sync + 'static {
    /// Wait for and return the next connection.
    fn accept(&self) -> Result<Conn>;

    /// Close the listener; blocked accepts unblock with an error.
    fn close(&self) -> Result<()>;

    /// The listener's network address.
    fn addr(&self) -> Option<Addr> {
        None
    }
}

/// Server tuning knobs.
#[derive(Default, Clone)]
pub struct ServerOptions {
    /// Worker cap for the scheduler; 0 selects the CPU count.
    pub max_workers: usize,
    /// Scheduler options.
    pub scheduler: SchedulerOptions,
    /// Skip the kernel poller and serve every connection on its own
    /// thread.
    pub no_poll: bool,
}

struct ConnEntry<C> {
    conn: Conn,
    ctx: Mutex<C>,
}

struct ServeState {
    listener: Arc<dyn Accept>,
    poll: Option<Arc<Poll>>,
}

struct Inner<H: Handler> {
    handler: H,
    opts: ServerOptions,
    closed: AtomicBool,
    state: Mutex<Option<ServeState>>,
    conns: Mutex<HashMap<RawFd, Arc<ConnEntry<H::Ctx>>>>,
    threaded: Mutex<HashMap<u64, Conn>>,
    next_thread_id: AtomicU64,
    eofs: AtomicUsize,
}

/// A reactor server dispatching readiness to a [`Handler`].
pub struct Server<H: Handler> {
    inner: Arc<Inner<H>>,
}

impl<H: Handler> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: Handler> Server<H> {
    /// Create a server with default options.
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self::with_options(handler, ServerOptions::default())
    }

    /// Create a server with explicit options.
    #[must_use]
    pub fn with_options(handler: H, opts: ServerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                opts,
                closed: AtomicBool::new(false),
                state: Mutex::new(None),
                conns: Mutex::new(HashMap::new()),
                threaded: Mutex::new(HashMap::new()),
                next_thread_id: AtomicU64::new(0),
                eofs: AtomicUsize::new(0),
            }),
        }
    }

    /// Accept and serve connections until [`Server::close`]. Blocks.
    pub fn serve<L: Accept>(&self, listener: L) -> Result<()> {
        self.serve_acceptor(Arc::new(listener))
    }

    /// [`Server::serve`] over a shared listener handle.
    pub fn serve_acceptor(&self, listener: Arc<dyn Accept>) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let scheduler = Scheduler::new(self.inner.opts.max_workers, self.inner.opts.scheduler.clone());
        let poll = if self.inner.opts.no_poll {
            None
        } else {
            match Poll::create() {
                Ok(p) => Some(Arc::new(p)),
                Err(e) => {
                    tracing::debug!(error = %e, "kernel poller unavailable, serving one thread per connection");
                    None
                }
            }
        };
        {
            let mut st = self.inner.state.lock().expect("server lock poisoned");
            *st = Some(ServeState {
                listener: listener.clone(),
                poll: poll.clone(),
            });
        }
        // close() may have raced us between the flag check and the state
        // store; make sure the loop below cannot outlive it.
        if self.inner.closed.load(Ordering::Acquire) {
            let _ = listener.close();
            if let Some(p) = &poll {
                p.close();
            }
        }

        let reactor = poll.clone().map(|p| {
            let inner = self.inner.clone();
            let sched = scheduler.clone();
            thread::Builder::new()
                .name("coracle-reactor".into())
                .spawn(move || reactor_loop(&inner, &p, &sched))
                .expect("failed to spawn reactor thread")
        });

        loop {
            match listener.accept() {
                Ok(conn) => self.handle_conn(conn, poll.as_ref()),
                Err(e) => {
                    if self.inner.closed.load(Ordering::Acquire) {
                        break;
                    }
                    if e.is_terminal() {
                        tracing::warn!(error = %e, "listener failed, stopping accept loop");
                        break;
                    }
                    tracing::warn!(error = %e, "accept error");
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }

        if let Some(p) = &poll {
            p.close();
        }
        if let Some(h) = reactor {
            let _ = h.join();
        }
        scheduler.close();
        self.close_conns();
        Ok(())
    }

    /// Stop accepting, close the poller and every tracked connection.
    /// Idempotent; in-flight serves finish their current invocation.
    pub fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let state = self.inner.state.lock().expect("server lock poisoned");
        if let Some(st) = state.as_ref() {
            let _ = st.listener.close();
            if let Some(p) = &st.poll {
                p.close();
            }
        }
        drop(state);
        self.close_conns();
    }

    /// The number of connections currently tracked.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.inner.conns.lock().expect("server lock poisoned").len()
            + self.inner.threaded.lock().expect("server lock poisoned").len()
    }

    /// How many connections ended with a terminal (EOF-class) error.
    #[must_use]
    pub fn eofs(&self) -> usize {
        self.inner.eofs.load(Ordering::Relaxed)
    }

    fn handle_conn(&self, conn: Conn, poll: Option<&Arc<Poll>>) {
        let ctx = match self.inner.handler.upgrade(conn.clone()) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "upgrade failed");
                let _ = conn.close();
                return;
            }
        };
        match (poll, conn.raw_fd()) {
            (Some(poll), Some(fd)) => {
                let entry = Arc::new(ConnEntry {
                    conn: conn.clone(),
                    ctx: Mutex::new(ctx),
                });
                self.inner
                    .conns
                    .lock()
                    .expect("server lock poisoned")
                    .insert(fd, entry);
                if conn.set_nonblocking(true).is_err() || poll.register(fd).is_err() {
                    tracing::warn!(fd, "failed to register connection");
                    self.inner
                        .conns
                        .lock()
                        .expect("server lock poisoned")
                        .remove(&fd);
                    let _ = conn.close();
                }
            }
            _ => self.spawn_conn_thread(conn, ctx),
        }
    }

    // Fallback path: no poller or no descriptor, loop serve on a thread.
    fn spawn_conn_thread(&self, conn: Conn, mut ctx: H::Ctx) {
        let id = self.inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .threaded
            .lock()
            .expect("server lock poisoned")
            .insert(id, conn.clone());
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("coracle-conn".into())
            .spawn(move || {
                loop {
                    if inner.closed.load(Ordering::Acquire) {
                        break;
                    }
                    match inner.handler.serve(&mut ctx) {
                        Ok(()) => {}
                        Err(e) if e.is_would_block() => {}
                        Err(e) => {
                            if e.is_terminal() {
                                inner.eofs.fetch_add(1, Ordering::Relaxed);
                            } else {
                                tracing::warn!(error = %e, "serve error");
                            }
                            break;
                        }
                    }
                }
                let _ = conn.close();
                inner
                    .threaded
                    .lock()
                    .expect("server lock poisoned")
                    .remove(&id);
            });
        if spawned.is_err() {
            tracing::warn!("failed to spawn connection thread");
            self.inner
                .threaded
                .lock()
                .expect("server lock poisoned")
                .remove(&id);
        }
    }

    fn close_conns(&self) {
        let entries: Vec<_> = {
            let mut conns = self.inner.conns.lock().expect("server lock poisoned");
            conns.drain().collect()
        };
        for (_, entry) in entries {
            let _ = entry.conn.close();
        }
        let threaded: Vec<_> = {
            let mut threaded = self.inner.threaded.lock().expect("server lock poisoned");
            threaded.drain().collect()
        };
        for (_, conn) in threaded {
            let _ = conn.close();
        }
    }
}

fn reactor_loop<H: Handler>(inner: &Arc<Inner<H>>, poll: &Arc<Poll>, scheduler: &Scheduler) {
    let mut events = vec![Event::default(); 1024];
    loop {
        let n = match poll.wait(&mut events) {
            Ok(n) => n,
            // Closed (or broken beyond repair): the serve loop tears down.
            Err(_) => return,
        };
        for ev in &events[..n] {
            if ev.mode != Mode::Read {
                continue;
            }
            let entry = {
                let conns = inner.conns.lock().expect("server lock poisoned");
                conns.get(&ev.fd).cloned()
            };
            let Some(entry) = entry else { continue };
            let inner = inner.clone();
            let poll = poll.clone();
            let fd = ev.fd;
            scheduler.schedule(move || serve_ready(&inner, &poll, fd, &entry));
        }
    }
}

fn serve_ready<H: Handler>(
    inner: &Arc<Inner<H>>,
    poll: &Arc<Poll>,
    fd: RawFd,
    entry: &Arc<ConnEntry<H::Ctx>>,
) {
    // The serving lock: a contended try_lock means an invocation is in
    // flight, and level-triggered polling will report any unread data
    // again.
    let mut ctx = match entry.ctx.try_lock() {
        Ok(ctx) => ctx,
        Err(TryLockError::WouldBlock) => return,
        Err(TryLockError::Poisoned(e)) => e.into_inner(),
    };
    match inner.handler.serve(&mut ctx) {
        Ok(()) => {}
        Err(e) if e.is_would_block() => {}
        Err(e) => {
            if e.is_terminal() {
                inner.eofs.fetch_add(1, Ordering::Relaxed);
            } else {
                tracing::warn!(error = %e, "serve error");
            }
            drop(ctx);
            let _ = poll.unregister(fd);
            inner
                .conns
                .lock()
                .expect("server lock poisoned")
                .remove(&fd);
            let _ = entry.conn.close();
        }
    }
}
