//! Bucketed byte-buffer recycling.
//!
//! Buffers come in five size classes and are recycled through per-worker
//! free lists so that steady-state request traffic performs no allocator
//! calls. Sizes above the largest bucket are allocated exactly and tracked
//! so a stray release can be caught.
//!
//! PERF: Backing storage is 64-byte aligned so a buffer never shares a
//! cache line with neighbouring allocations.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Cache-line size used for buffer alignment.
pub const CACHE_LINE: usize = 64;

/// Per-bucket free-list cap. Releases past this go back to the allocator.
pub const FREE_LIST_CAP: usize = 128;

/// Bound on simultaneously outstanding one-off (non-bucket) buffers.
pub const ONE_OFF_CAP: usize = 256;

// ============================================================================
// Size classes
// ============================================================================

/// Discrete size classes for pooled buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    /// 1 KiB
    Tiny,
    /// 4 KiB
    Small,
    /// 16 KiB
    Medium,
    /// 64 KiB
    Large,
    /// 256 KiB
    Huge,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::Tiny,
        Bucket::Small,
        Bucket::Medium,
        Bucket::Large,
        Bucket::Huge,
    ];

    /// Byte capacity of this class.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Bucket::Tiny => 1024,
            Bucket::Small => 4 * 1024,
            Bucket::Medium => 16 * 1024,
            Bucket::Large => 64 * 1024,
            Bucket::Huge => 256 * 1024,
        }
    }

    /// Smallest bucket holding at least `n` bytes, or `None` when `n`
    /// exceeds the largest class.
    #[inline]
    pub fn fitting(n: usize) -> Option<Bucket> {
        Bucket::ALL.iter().copied().find(|b| b.size() >= n)
    }

    /// Bucket whose capacity is exactly `n`, if any.
    #[inline]
    fn exact(n: usize) -> Option<Bucket> {
        Bucket::ALL.iter().copied().find(|b| b.size() == n)
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            Bucket::Tiny => 0,
            Bucket::Small => 1,
            Bucket::Medium => 2,
            Bucket::Large => 3,
            Bucket::Huge => 4,
        }
    }

    /// Next larger class, used when a response outgrows its write buffer.
    #[inline]
    pub fn next_larger(self) -> Option<Bucket> {
        match self {
            Bucket::Tiny => Some(Bucket::Small),
            Bucket::Small => Some(Bucket::Medium),
            Bucket::Medium => Some(Bucket::Large),
            Bucket::Large => Some(Bucket::Huge),
            Bucket::Huge => None,
        }
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// A contiguous, cache-line-aligned byte region with exclusive ownership.
///
/// Ownership transfers on [`BufferPool::acquire`] / [`BufferPool::release`];
/// whoever holds the `Buffer` value is the sole writer. The filled prefix
/// (`len`) and the capacity are tracked separately so a buffer can be
/// cleared and retained across keep-alive requests.
pub struct Buffer {
    ptr: NonNull<u8>,
    cap: usize,
    len: usize,
}

// The raw pointer is uniquely owned; a Buffer moves between threads only as
// a whole value.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocate a fresh zeroed buffer of exactly `cap` bytes.
    pub fn with_capacity(cap: usize) -> Buffer {
        assert!(cap > 0, "zero-sized buffer");
        let layout = Layout::from_size_align(cap, CACHE_LINE).expect("buffer layout");
        // SAFETY: layout has non-zero size and valid power-of-two alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("buffer allocation failed");
        Buffer { ptr, cap, len: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remaining writable bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.cap - self.len
    }

    /// Drop the filled prefix without touching the backing storage.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Filled prefix.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: bytes below `len` were written through `unfilled`/`extend`
        // or zeroed at allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable view of the filled prefix.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Writable tail past the filled prefix. Pair with [`Buffer::advance`].
    #[inline]
    pub fn unfilled(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.len), self.cap - self.len)
        }
    }

    /// Mark `n` bytes of the unfilled tail as filled.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.cap);
        self.len += n;
    }

    /// Append `data`, failing when it does not fit.
    #[inline]
    pub fn extend_from_slice(&mut self, data: &[u8]) -> bool {
        if data.len() > self.remaining() {
            return false;
        }
        self.unfilled()[..data.len()].copy_from_slice(data);
        self.len += data.len();
        true
    }

    /// Discard the first `n` filled bytes, shifting the rest down.
    pub fn truncate_front(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        if n == 0 {
            return;
        }
        if n < self.len {
            self.as_mut_slice().copy_within(n.., 0);
        }
        self.len -= n;
    }

    /// Stable address of the backing storage, used as the buffer's identity.
    #[inline]
    pub(crate) fn addr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.cap, CACHE_LINE).expect("buffer layout");
        // SAFETY: `ptr` was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("cap", &self.cap)
            .field("len", &self.len)
            .finish()
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Buffer pool counters, readable for tests and diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferPoolStats {
    /// Acquires served from a free list.
    pub hits: u64,
    /// Acquires that had to allocate.
    pub misses: u64,
    /// Buffers returned to a free list.
    pub recycled: u64,
    /// Buffers released past the free-list cap and freed.
    pub discarded: u64,
}

/// Per-worker collection of five bucketed free lists.
///
/// Invariants: every address on a free list is unique, and no free list
/// exceeds [`FREE_LIST_CAP`]. The pool is not `Send`-shared; each worker
/// constructs its own.
pub struct BufferPool {
    free: [Vec<Buffer>; 5],
    /// Addresses of outstanding one-off buffers, for release validation.
    one_offs: Vec<*const u8>,
    stats: BufferPoolStats,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            free: Default::default(),
            one_offs: Vec::with_capacity(ONE_OFF_CAP),
            stats: BufferPoolStats::default(),
        }
    }

    /// Acquire a buffer holding at least `n` bytes.
    ///
    /// Rounds up to the smallest fitting bucket; sizes past the largest
    /// bucket get an exactly-sized tracked one-off.
    pub fn acquire(&mut self, n: usize) -> Buffer {
        match Bucket::fitting(n) {
            Some(bucket) => self.acquire_bucket(bucket),
            None => {
                self.stats.misses += 1;
                let buf = Buffer::with_capacity(n);
                if self.one_offs.len() == ONE_OFF_CAP {
                    debug_assert!(false, "one-off buffer tracking table full");
                    tracing::error!(outstanding = ONE_OFF_CAP, "one-off buffer table full");
                }
                self.one_offs.push(buf.addr());
                buf
            }
        }
    }

    /// Acquire a buffer of the given size class.
    pub fn acquire_bucket(&mut self, bucket: Bucket) -> Buffer {
        let list = &mut self.free[bucket.index()];
        match list.pop() {
            Some(mut buf) => {
                self.stats.hits += 1;
                buf.clear();
                buf
            }
            None => {
                self.stats.misses += 1;
                Buffer::with_capacity(bucket.size())
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Classified by exact capacity: bucket-sized buffers go back on their
    /// free list while it has room, one-offs are checked against the
    /// tracking table. An unknown buffer is a double release: panic in
    /// debug builds, log and drop in release.
    pub fn release(&mut self, buf: Buffer) {
        match Bucket::exact(buf.capacity()) {
            Some(bucket) => {
                let list = &mut self.free[bucket.index()];
                if list.iter().any(|b| b.addr() == buf.addr()) {
                    // The pool already owns this region; freeing the
                    // duplicate would free it twice.
                    std::mem::forget(buf);
                    if cfg!(debug_assertions) {
                        panic!("double release of pooled buffer");
                    }
                    tracing::error!("double release of pooled buffer");
                    return;
                }
                if list.len() < FREE_LIST_CAP {
                    self.stats.recycled += 1;
                    list.push(buf);
                } else {
                    self.stats.discarded += 1;
                }
            }
            None => {
                // Bounded at ONE_OFF_CAP, linear scan is fine.
                match self.one_offs.iter().position(|&p| p == buf.addr()) {
                    Some(i) => {
                        self.one_offs.swap_remove(i);
                        self.stats.discarded += 1;
                    }
                    None => {
                        let cap = buf.capacity();
                        std::mem::forget(buf);
                        if cfg!(debug_assertions) {
                            panic!("release of untracked one-off buffer");
                        }
                        tracing::error!(cap, "release of untracked buffer");
                    }
                }
            }
        }
    }

    /// Free every pooled buffer and forget tracked one-offs.
    pub fn cleanup(&mut self) {
        for list in &mut self.free {
            list.clear();
        }
        self.one_offs.clear();
    }

    /// Number of buffers currently parked in the given free list.
    pub fn free_count(&self, bucket: Bucket) -> usize {
        self.free[bucket.index()].len()
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.stats
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rounding() {
        assert_eq!(Bucket::fitting(1), Some(Bucket::Tiny));
        assert_eq!(Bucket::fitting(1024), Some(Bucket::Tiny));
        assert_eq!(Bucket::fitting(1025), Some(Bucket::Small));
        assert_eq!(Bucket::fitting(100_000), Some(Bucket::Huge));
        assert_eq!(Bucket::fitting(256 * 1024 + 1), None);
    }

    #[test]
    fn alignment() {
        let pool_sizes = [1, 777, 4096, 300_000];
        for n in pool_sizes {
            let buf = Buffer::with_capacity(n);
            assert_eq!(buf.addr() as usize % CACHE_LINE, 0);
        }
    }

    #[test]
    fn released_buffer_is_reacquired() {
        let mut pool = BufferPool::new();
        let buf = pool.acquire(4096);
        let addr = buf.addr();
        pool.release(buf);
        let again = pool.acquire_bucket(Bucket::Small);
        assert_eq!(again.addr(), addr);
        pool.release(again);
    }

    #[test]
    fn free_list_is_capped() {
        let mut pool = BufferPool::new();
        let bufs: Vec<_> = (0..FREE_LIST_CAP + 10)
            .map(|_| Buffer::with_capacity(Bucket::Tiny.size()))
            .collect();
        for b in bufs {
            pool.release(b);
        }
        assert_eq!(pool.free_count(Bucket::Tiny), FREE_LIST_CAP);
        assert_eq!(pool.stats().discarded, 10);
    }

    #[test]
    fn one_off_round_trip() {
        let mut pool = BufferPool::new();
        let big = pool.acquire(512 * 1024);
        assert_eq!(big.capacity(), 512 * 1024);
        pool.release(big);
        // Table is empty again; a second one-off reuses the slot.
        let big2 = pool.acquire(512 * 1024);
        pool.release(big2);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_detected() {
        let mut pool = BufferPool::new();
        let buf = pool.acquire_bucket(Bucket::Tiny);
        let stolen = Buffer {
            ptr: buf.ptr,
            cap: buf.cap,
            len: 0,
        };
        pool.release(buf);
        pool.release(stolen); // same address, must be caught
    }

    #[test]
    fn truncate_front_shifts_remainder() {
        let mut buf = Buffer::with_capacity(1024);
        assert!(buf.extend_from_slice(b"hello world"));
        buf.truncate_front(6);
        assert_eq!(buf.as_slice(), b"world");
        buf.truncate_front(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn extend_rejects_overflow() {
        let mut buf = Buffer::with_capacity(1024);
        assert!(!buf.extend_from_slice(&[0u8; 2048]));
        assert!(buf.is_empty());
    }

    #[test]
    fn steady_state_growth_is_bounded() {
        let mut pool = BufferPool::new();
        for _ in 0..10_000 {
            let a = pool.acquire(1024);
            let b = pool.acquire(16 * 1024);
            pool.release(a);
            pool.release(b);
        }
        // Balanced traffic keeps exactly one buffer parked per class used.
        assert_eq!(pool.free_count(Bucket::Tiny), 1);
        assert_eq!(pool.free_count(Bucket::Medium), 1);
        assert_eq!(pool.stats().misses, 2);
    }
}
