//! Adaptive batching writer.
//!
//! When many producers funnel into one stream, each small write costs a
//! syscall. The writer watches a caller-supplied concurrency oracle and
//! switches between writing through immediately (low contention) and
//! accumulating writes for a single flush (high contention). A background
//! flusher guarantees buffered bytes never wait longer than one tick.
//!
//! Without an oracle the writer is a transparent pass-through.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::buffer;
use crate::stream::Conn;

const THRESH: usize = 4;
const MAXIMUM_SEGMENT_SIZE: usize = 65536;
const LASTS_SIZE: usize = 4;

/// A callback reporting the caller-maintained count of in-flight writers.
pub type ConcurrencyFn = Arc<dyn Fn() -> usize + Send + Sync>;

struct State {
    buffer: Vec<u8>,
    size: usize,
    count: usize,
    write_cnt: usize,
}

struct Inner {
    conn: Conn,
    concurrency: Option<ConcurrencyFn>,
    shared: bool,
    mss: usize,
    state: Mutex<State>,
    // Ring of the last observed concurrency samples; read racily on
    // purpose, a stale sample only skews the batch estimate by one write.
    lasts: [AtomicUsize; LASTS_SIZE],
    cursor: AtomicUsize,
    trigger_tx: flume::Sender<()>,
    done_tx: flume::Sender<()>,
    closed: AtomicBool,
}

impl Inner {
    fn batch(&self) -> usize {
        let Some(concurrency) = &self.concurrency else {
            return 0;
        };
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.lasts[cursor % LASTS_SIZE].store(concurrency(), Ordering::Relaxed);
        self.lasts
            .iter()
            .map(|l| l.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0)
    }

    fn append(&self, st: &mut State, p: &[u8]) {
        if self.shared && st.buffer.is_empty() {
            st.buffer = buffer::assign_pool(self.mss).get_buffer();
        }
        st.buffer[st.size..st.size + p.len()].copy_from_slice(p);
        st.size += p.len();
    }

    fn flush_locked(&self, st: &mut State, reset: bool) -> io::Result<()> {
        if st.size == 0 {
            return Ok(());
        }
        let r = self.conn.write_all(&st.buffer[..st.size]);
        if self.shared {
            let buf = std::mem::take(&mut st.buffer);
            buffer::assign_pool(self.mss).put_buffer(buf);
        }
        st.size = 0;
        st.count = 0;
        if reset {
            st.write_cnt = 0;
        }
        r
    }
}

/// Batch writer over a [`Conn`], parameterised by a concurrency oracle.
pub struct Writer {
    inner: Arc<Inner>,
}

impl Writer {
    /// Create a batch writer. `size < 1` selects the default segment size.
    /// With no `concurrency` oracle the writer passes every write through.
    #[must_use]
    pub fn new(conn: Conn, concurrency: Option<ConcurrencyFn>, size: usize, shared: bool) -> Self {
        let mss = if size < 1 { MAXIMUM_SEGMENT_SIZE } else { size };
        let enabled = concurrency.is_some();
        let (trigger_tx, trigger_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);
        let buffer = if enabled && !shared {
            vec![0u8; mss]
        } else {
            Vec::new()
        };
        let inner = Arc::new(Inner {
            conn,
            concurrency,
            shared,
            mss,
            state: Mutex::new(State {
                buffer,
                size: 0,
                count: 0,
                write_cnt: 0,
            }),
            lasts: [
                AtomicUsize::new(0),
                AtomicUsize::new(0),
                AtomicUsize::new(0),
                AtomicUsize::new(0),
            ],
            cursor: AtomicUsize::new(0),
            trigger_tx,
            done_tx,
            closed: AtomicBool::new(false),
        });
        if enabled {
            let flusher = inner.clone();
            thread::Builder::new()
                .name("coracle-flusher".into())
                .spawn(move || run_flusher(&flusher, &trigger_rx, &done_rx))
                .expect("failed to spawn flusher thread");
        }
        Self { inner }
    }

    /// Write `p`, either through to the stream or into the batch buffer.
    /// Returns `p.len()` on success.
    pub fn write(&self, p: &[u8]) -> io::Result<usize> {
        let inner = &self.inner;
        if inner.concurrency.is_none() {
            inner.conn.write_all(p)?;
            return Ok(p.len());
        }
        let batch = inner.batch();
        let length = p.len();
        let mut st = inner.state.lock().expect("writer lock poisoned");
        st.write_cnt += 1;
        if st.size + length > inner.mss {
            // Oversized for the buffer: flush what is pending, then write
            // this one straight through.
            if st.size > 0 {
                inner.flush_locked(&mut st, false)?;
            }
            if length > 0 {
                inner.conn.write_all(p)?;
            }
        } else if batch <= THRESH {
            write_through(inner, &mut st, p)?;
        } else if batch <= THRESH * THRESH {
            if st.write_cnt < THRESH {
                write_through(inner, &mut st, p)?;
            } else {
                accumulate(inner, &mut st, p, batch, THRESH)?;
            }
        } else {
            let alpha = (THRESH * 2) as isize - ((batch - 1) / THRESH) as isize;
            if alpha > 1 {
                if (st.write_cnt as isize) < alpha {
                    write_through(inner, &mut st, p)?;
                } else {
                    accumulate(inner, &mut st, p, batch, alpha as usize)?;
                }
            } else {
                accumulate(inner, &mut st, p, batch, 1)?;
            }
        }
        Ok(length)
    }

    /// Write any buffered data to the underlying stream.
    pub fn flush(&self) -> io::Result<()> {
        let mut st = self.inner.state.lock().expect("writer lock poisoned");
        self.inner.flush_locked(&mut st, true)
    }

    /// Flush and stop the background flusher. The underlying stream stays
    /// open. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        if self.inner.concurrency.is_some() {
            self.flush()?;
        }
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        if self.inner.concurrency.is_some() {
            let _ = self.inner.done_tx.try_send(());
        }
        Ok(())
    }
}

// Low-contention path: anything already buffered is completed right away,
// a lone write skips the buffer entirely.
fn write_through(inner: &Inner, st: &mut State, p: &[u8]) -> io::Result<()> {
    if st.size > 0 {
        inner.append(st, p);
        inner.flush_locked(st, false)
    } else {
        inner.conn.write_all(p)?;
        st.size = 0;
        st.count = 0;
        Ok(())
    }
}

// High-contention path: buffer until enough writers have joined the cycle,
// then flush and nudge the background flusher to pick up stragglers.
fn accumulate(inner: &Inner, st: &mut State, p: &[u8], batch: usize, window: usize) -> io::Result<()> {
    inner.append(st, p);
    st.count += 1;
    let mut r = Ok(());
    if st.count > batch.saturating_sub(window) {
        r = inner.flush_locked(st, true);
    }
    let _ = inner.trigger_tx.try_send(());
    r
}

fn run_flusher(inner: &Arc<Inner>, trigger: &flume::Receiver<()>, done: &flume::Receiver<()>) {
    enum Sig {
        Trigger,
        Done,
    }
    loop {
        {
            let mut st = inner.state.lock().expect("writer lock poisoned");
            if let Err(e) = inner.flush_locked(&mut st, true) {
                tracing::warn!(error = %e, "background flush failed");
            }
        }
        let tick = if inner.batch() < THRESH * 2 {
            Duration::from_secs(1)
        } else {
            Duration::from_micros(100)
        };
        let sig = flume::Selector::new()
            .recv(trigger, |r| match r {
                Ok(()) => Sig::Trigger,
                Err(_) => Sig::Done,
            })
            .recv(done, |_| Sig::Done)
            .wait_timeout(tick);
        match sig {
            Ok(Sig::Trigger) => {
                // Let a few more arrivals land in the buffer before the
                // flush at the top of the loop.
                thread::sleep(Duration::from_micros(inner.batch() as u64));
            }
            Ok(Sig::Done) => return,
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;

    struct Sink {
        bytes: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                bytes: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Stream for Sink {
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            self.bytes.fetch_add(buf.len(), Ordering::Relaxed);
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(buf.len())
        }

        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_pass_through_without_oracle() {
        let sink = Sink::new();
        let w = Writer::new(sink.clone(), None, 0, false);
        w.write(b"hello").unwrap();
        w.write(b"world").unwrap();
        assert_eq!(sink.bytes.load(Ordering::Relaxed), 10);
        assert_eq!(sink.calls.load(Ordering::Relaxed), 2);
        w.close().unwrap();
    }

    #[test]
    fn test_low_concurrency_writes_through() {
        let sink = Sink::new();
        let oracle: ConcurrencyFn = Arc::new(|| 1);
        let w = Writer::new(sink.clone(), Some(oracle), 0, false);
        for _ in 0..10 {
            assert_eq!(w.write(&[0u8; 100]).unwrap(), 100);
        }
        w.flush().unwrap();
        assert_eq!(sink.bytes.load(Ordering::Relaxed), 1000);
        w.close().unwrap();
    }

    #[test]
    fn test_oversized_write_bypasses_buffer() {
        let sink = Sink::new();
        let oracle: ConcurrencyFn = Arc::new(|| 64);
        let w = Writer::new(sink.clone(), Some(oracle), 1024, false);
        let big = vec![7u8; 4096];
        w.write(&big).unwrap();
        assert_eq!(sink.bytes.load(Ordering::Relaxed), 4096);
        w.close().unwrap();
    }

    #[test]
    fn test_coalesces_under_contention() {
        let sink = Sink::new();
        let inflight = Arc::new(AtomicUsize::new(0));
        let counter = inflight.clone();
        let oracle: ConcurrencyFn = Arc::new(move || counter.load(Ordering::Relaxed));
        let w = Arc::new(Writer::new(sink.clone(), Some(oracle), 0, false));

        let producers = 64;
        let per_producer = 100;
        let payload = vec![0u8; 512];
        let mut handles = Vec::new();
        for _ in 0..producers {
            let w = w.clone();
            let inflight = inflight.clone();
            let payload = payload.clone();
            handles.push(thread::spawn(move || {
                inflight.fetch_add(1, Ordering::Relaxed);
                for _ in 0..per_producer {
                    w.write(&payload).unwrap();
                }
                inflight.fetch_sub(1, Ordering::Relaxed);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        w.close().unwrap();

        let total = producers * per_producer * 512;
        assert_eq!(sink.bytes.load(Ordering::Relaxed), total);
        // The point of the exercise: at least 2x coalescing.
        let calls = sink.calls.load(Ordering::Relaxed);
        assert!(
            calls <= producers * per_producer / 2,
            "expected coalescing, saw {calls} underlying writes"
        );
    }

    #[test]
    fn test_buffered_bytes_keep_order() {
        struct Recorder(Mutex<Vec<u8>>);
        impl Stream for Recorder {
            fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn write(&self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn close(&self) -> io::Result<()> {
                Ok(())
            }
        }
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        let oracle: ConcurrencyFn = Arc::new(|| 32);
        let w = Writer::new(rec.clone(), Some(oracle), 0, false);
        let mut expect = Vec::new();
        for i in 0..200u8 {
            let chunk = [i; 16];
            w.write(&chunk).unwrap();
            expect.extend_from_slice(&chunk);
        }
        w.close().unwrap();
        assert_eq!(*rec.0.lock().unwrap(), expect);
    }

    #[test]
    fn test_close_idempotent() {
        let sink = Sink::new();
        let oracle: ConcurrencyFn = Arc::new(|| 8);
        let w = Writer::new(sink, Some(oracle), 0, true);
        w.write(b"tail").unwrap();
        w.close().unwrap();
        w.close().unwrap();
    }
}
