//! Size-bucketed buffer pool.
//!
//! Buffers are grouped into buckets keyed by a page-quantized capacity.
//! Every I/O path in the workspace borrows its scratch space here instead of
//! allocating, so a bucket's free list is unbounded and reclamation is
//! best-effort: leaking a buffer costs memory, never correctness.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Default page quantum for bucket sizing.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// A collection of buckets sharing one page quantum.
pub struct Buffers {
    page_size: usize,
    pools: DashMap<usize, Arc<Pool>>,
}

impl Buffers {
    /// Create a bucket collection. `page_size == 0` selects the default.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size
        };
        Self {
            page_size,
            pools: DashMap::new(),
        }
    }

    /// The page quantum of this collection.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The bucket serving capacity >= `size`.
    ///
    /// Sizes that are not a page multiple round up to the next page; the
    /// rounded size is the bucket key. Buckets are created lazily and the
    /// lookup path is lock-free; creation is serialised per key.
    pub fn assign_pool(&self, size: usize) -> Arc<Pool> {
        let size = self.bucket_size(size);
        if let Some(p) = self.pools.get(&size) {
            return p.value().clone();
        }
        self.pools
            .entry(size)
            .or_insert_with(|| Arc::new(Pool::new(size)))
            .value()
            .clone()
    }

    /// Borrow a buffer of length >= `size` from the matching bucket.
    pub fn get_buffer(&self, size: usize) -> Vec<u8> {
        self.assign_pool(size).get_buffer()
    }

    /// Return a buffer to the bucket it came from.
    pub fn put_buffer(&self, buf: Vec<u8>) {
        // Key by the largest bucket the capacity can serve, so a buffer with
        // surplus capacity still lands somewhere its invariant holds.
        let size = (buf.capacity() / self.page_size) * self.page_size;
        if size == 0 {
            return;
        }
        self.assign_pool(size).put_buffer(buf);
    }

    fn bucket_size(&self, size: usize) -> usize {
        let quantized = if size % self.page_size != 0 {
            (size / self.page_size + 1) * self.page_size
        } else {
            size
        };
        quantized.max(self.page_size)
    }
}

impl Default for Buffers {
    fn default() -> Self {
        Self::new(0)
    }
}

/// One bucket: a free list of buffers of a fixed capacity.
pub struct Pool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Pool {
    fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// The fixed capacity of buffers in this bucket.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Take a buffer with `len == size()`.
    pub fn get_buffer(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().expect("buffer pool lock poisoned").pop() {
            return buf;
        }
        vec![0u8; self.size]
    }

    /// Take a buffer truncated to `n` bytes (capacity stays at the bucket
    /// size).
    pub fn get_buffer_size(&self, n: usize) -> Vec<u8> {
        let mut buf = self.get_buffer();
        buf.truncate(n);
        buf
    }

    /// Return a buffer to this bucket.
    ///
    /// Returning a buffer that never came from a bucket of this size is a
    /// programming error.
    pub fn put_buffer(&self, mut buf: Vec<u8>) {
        debug_assert!(
            buf.capacity() >= self.size,
            "buffer returned to the wrong bucket"
        );
        buf.resize(self.size, 0);
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .push(buf);
    }
}

static DEFAULT_BUFFERS: Lazy<Buffers> = Lazy::new(|| Buffers::new(DEFAULT_PAGE_SIZE));

/// The bucket of the process-wide default collection serving `size` bytes.
pub fn assign_pool(size: usize) -> Arc<Pool> {
    DEFAULT_BUFFERS.assign_pool(size)
}

/// Borrow from the process-wide default collection.
pub fn get_buffer(size: usize) -> Vec<u8> {
    DEFAULT_BUFFERS.get_buffer(size)
}

/// Return to the process-wide default collection.
pub fn put_buffer(buf: Vec<u8>) {
    DEFAULT_BUFFERS.put_buffer(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let b = Buffers::new(1024);
        assert_eq!(b.bucket_size(0), 1024);
        assert_eq!(b.bucket_size(1), 1024);
        assert_eq!(b.bucket_size(512), 1024);
        assert_eq!(b.bucket_size(1024), 1024);
        assert_eq!(b.bucket_size(1025), 2048);

        let b = Buffers::new(1023);
        assert_eq!(b.bucket_size(1024), 2046);
    }

    #[test]
    fn test_assign_pool_capacity() {
        let b = Buffers::new(1024);
        for i in 0..4 {
            let size = 64 * 1024 + i;
            let p = b.assign_pool(size);
            assert!(p.size() >= size);
            let buf = b.get_buffer(size);
            assert!(buf.len() >= size);
            b.put_buffer(buf);
        }
    }

    #[test]
    fn test_pool_reuse() {
        let b = Buffers::new(0);
        let p = b.assign_pool(4096);
        let mut buf = p.get_buffer();
        buf[0] = 0xAB;
        p.put_buffer(buf);
        let buf = p.get_buffer();
        assert_eq!(buf.len(), p.size());
        // Same allocation came back off the free list.
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn test_get_buffer_size_truncates() {
        let b = Buffers::new(0);
        let p = b.assign_pool(100);
        let buf = p.get_buffer_size(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.capacity() >= p.size());
        p.put_buffer(buf);
    }

    #[test]
    fn test_global_pool() {
        for n in [0usize, 1, 1024, 65_536, 65_537] {
            let buf = get_buffer(n);
            assert!(buf.len() >= n);
            put_buffer(buf);
        }
    }

    #[test]
    fn test_concurrent_assign() {
        let b = std::sync::Arc::new(Buffers::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = b.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    let buf = b.get_buffer(i % 8192);
                    b.put_buffer(buf);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
