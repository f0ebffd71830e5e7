//! Batching under load: many producers funnelling framed messages through
//! one batching writer must coalesce syscalls without losing a byte.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use coracle_core::messages::{Batch, Messages, StreamMessages};
use coracle_core::stream::{Conn, Stream};
use coracle_core::writer::ConcurrencyFn;

struct CountingSink {
    bytes: AtomicUsize,
    calls: AtomicUsize,
}

impl Stream for CountingSink {
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
fn test_framed_writes_coalesce_under_contention() {
    let sink = Arc::new(CountingSink {
        bytes: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let conn: Conn = sink.clone();
    let messages = Arc::new(StreamMessages::new(conn, false, 0, 0));

    let inflight = Arc::new(AtomicUsize::new(0));
    let oracle = inflight.clone();
    let concurrency: ConcurrencyFn = Arc::new(move || oracle.load(Ordering::Relaxed));
    messages.set_concurrency(concurrency);

    let producers = 64;
    let per_producer = 100;
    let payload = vec![0xA5u8; 512];

    let mut handles = Vec::new();
    for _ in 0..producers {
        let messages = messages.clone();
        let inflight = inflight.clone();
        let payload = payload.clone();
        handles.push(thread::spawn(move || {
            inflight.fetch_add(1, Ordering::Relaxed);
            for _ in 0..per_producer {
                messages.write_message(&payload).unwrap();
            }
            inflight.fetch_sub(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    messages.close().unwrap();

    // 512 bytes of payload plus a 2-byte varint length per message.
    let total = producers * per_producer * (512 + 2);
    assert_eq!(sink.bytes.load(Ordering::Relaxed), total);

    let calls = sink.calls.load(Ordering::Relaxed);
    assert!(
        calls <= producers * per_producer / 2,
        "expected at least 2x coalescing, saw {calls} underlying writes"
    );
}
