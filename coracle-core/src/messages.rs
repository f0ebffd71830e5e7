//! Varint-length message framing over a byte stream.
//!
//! Each message on the wire is an unsigned LEB128 length (at most 10
//! bytes) followed by the payload. Partial frames accumulate across reads,
//! so the framer works unchanged over blocking streams and over
//! non-blocking streams driven by the reactor: a `WouldBlock` surfaces to
//! the caller with all partial state preserved, and the next readiness
//! event resumes exactly where the stream left off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};

use crate::buffer::{self, Pool};
use crate::error::{Error, Result};
use crate::stream::Conn;
use crate::writer::{ConcurrencyFn, Writer};

/// Default payload buffer size; with the 10-byte varint headroom the
/// working buffers come to 65 536 bytes.
pub const BUFFER_SIZE: usize = 65526;

const VARINT_HEADROOM: usize = 10;

/// Reading and writing of framed messages.
pub trait Messages: Send + Sync {
    /// Read one message into `buf` (cleared first), returning its length.
    /// Blocks until a full frame is present.
    fn read_message(&self, buf: &mut Vec<u8>) -> Result<usize>;

    /// Write `payload` as one message frame.
    fn write_message(&self, payload: &[u8]) -> Result<()>;

    /// Close the framer and the underlying stream. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Upgrading a message writer to batch mode.
pub trait Batch {
    /// Enable the batching writer, driven by the given concurrency oracle.
    fn set_concurrency(&self, concurrency: ConcurrencyFn);
}

enum Sink {
    Direct(Conn),
    Batched(Writer),
}

struct ReadState {
    pool: Option<Arc<Pool>>,
    scratch: Vec<u8>,
    accumulated: BytesMut,
}

struct WriteState {
    pool: Option<Arc<Pool>>,
    scratch: Vec<u8>,
    sink: Sink,
}

/// Framed messages over a [`Conn`].
///
/// Reads and writes serialise independently, so one thread can read while
/// another writes. In shared mode the working buffers are borrowed from
/// the global pool per operation instead of living with the framer.
pub struct StreamMessages {
    conn: Conn,
    shared: bool,
    read_buffer_size: usize,
    write_buffer_size: usize,
    reading: Mutex<ReadState>,
    writing: Mutex<WriteState>,
    closed: AtomicBool,
}

impl StreamMessages {
    /// Create a framer over `conn`. Buffer sizes of 0 select the default.
    #[must_use]
    pub fn new(
        conn: Conn,
        shared: bool,
        write_buffer_size: usize,
        read_buffer_size: usize,
    ) -> Self {
        let write_buffer_size = if write_buffer_size < 1 {
            BUFFER_SIZE + VARINT_HEADROOM
        } else {
            write_buffer_size + VARINT_HEADROOM
        };
        let read_buffer_size = if read_buffer_size < 1 {
            BUFFER_SIZE + VARINT_HEADROOM
        } else {
            read_buffer_size + VARINT_HEADROOM
        };
        let (read_pool, write_pool, read_scratch, write_scratch) = if shared {
            (
                Some(buffer::assign_pool(read_buffer_size)),
                Some(buffer::assign_pool(write_buffer_size)),
                Vec::new(),
                Vec::new(),
            )
        } else {
            (None, None, vec![0u8; read_buffer_size], vec![0u8; write_buffer_size])
        };
        Self {
            conn: conn.clone(),
            shared,
            read_buffer_size,
            write_buffer_size,
            reading: Mutex::new(ReadState {
                pool: read_pool,
                scratch: read_scratch,
                accumulated: BytesMut::new(),
            }),
            writing: Mutex::new(WriteState {
                pool: write_pool,
                scratch: write_scratch,
                sink: Sink::Direct(conn),
            }),
            closed: AtomicBool::new(false),
        }
    }
}

impl Messages for StreamMessages {
    fn read_message(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut st = self.reading.lock().expect("framer read lock poisoned");
        loop {
            if let Some((length, header)) = decode_varint(&st.accumulated)? {
                let total = header + length;
                if st.accumulated.len() >= total {
                    buf.clear();
                    buf.extend_from_slice(&st.accumulated[header..total]);
                    st.accumulated.advance(total);
                    return Ok(length);
                }
            }
            // Need more bytes from the stream.
            let n = if self.shared {
                let pool = st
                    .pool
                    .clone()
                    .unwrap_or_else(|| buffer::assign_pool(self.read_buffer_size));
                let mut scratch = pool.get_buffer();
                let r = self.conn.read(&mut scratch);
                match r {
                    Ok(n) => {
                        st.accumulated.extend_from_slice(&scratch[..n]);
                        pool.put_buffer(scratch);
                        n
                    }
                    Err(e) => {
                        pool.put_buffer(scratch);
                        return Err(Error::from_read(e));
                    }
                }
            } else {
                let ReadState {
                    scratch,
                    accumulated,
                    ..
                } = &mut *st;
                let n = self.conn.read(scratch).map_err(Error::from_read)?;
                accumulated.extend_from_slice(&scratch[..n]);
                n
            };
            if n == 0 {
                return Err(Error::Eof);
            }
        }
    }

    fn write_message(&self, payload: &[u8]) -> Result<()> {
        let mut st = self.writing.lock().expect("framer write lock poisoned");
        let size = VARINT_HEADROOM + payload.len();
        let (mut frame, pool) = if self.shared {
            let pool = st
                .pool
                .clone()
                .unwrap_or_else(|| buffer::assign_pool(self.write_buffer_size));
            (pool.get_buffer(), Some(pool))
        } else {
            (std::mem::take(&mut st.scratch), None)
        };
        if frame.len() < size {
            // Payload larger than the working buffer; one-off allocation.
            frame.resize(size, 0);
        }
        let mut i = encode_varint(payload.len() as u64, &mut frame[..VARINT_HEADROOM]);
        frame[i..i + payload.len()].copy_from_slice(payload);
        i += payload.len();
        let r = match &st.sink {
            Sink::Direct(conn) => conn.write_all(&frame[..i]).map_err(Error::from_read),
            Sink::Batched(w) => w.write(&frame[..i]).map(|_| ()).map_err(Error::from_read),
        };
        if let Some(pool) = pool {
            pool.put_buffer(frame);
        } else {
            st.scratch = frame;
        }
        r
    }

    fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        {
            let st = self.writing.lock().expect("framer write lock poisoned");
            if let Sink::Batched(w) = &st.sink {
                w.close()?;
            }
        }
        self.conn.close().map_err(Error::from_read)
    }
}

impl Batch for StreamMessages {
    fn set_concurrency(&self, concurrency: ConcurrencyFn) {
        let mut st = self.writing.lock().expect("framer write lock poisoned");
        st.sink = Sink::Batched(Writer::new(
            self.conn.clone(),
            Some(concurrency),
            0,
            self.shared,
        ));
    }
}

/// Encode `value` as LEB128 into `buf`, returning the byte count.
/// `buf` must hold at least 10 bytes.
pub fn encode_varint(mut value: u64, buf: &mut [u8]) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

/// Decode a LEB128 length prefix.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on a complete prefix,
/// `Ok(None)` when more input is needed, and a protocol error when the
/// prefix overflows 64 bits.
pub fn decode_varint(data: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in data.iter().enumerate() {
        if i > 9 || (i == 9 && b > 1) {
            return Err(Error::protocol("varint overflows a 64-bit integer"));
        }
        if b < 0x80 {
            value |= u64::from(b) << shift;
            let length = usize::try_from(value)
                .map_err(|_| Error::protocol("message length exceeds addressable memory"))?;
            return Ok(Some((length, i + 1)));
        }
        value |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Ok(None)
}
