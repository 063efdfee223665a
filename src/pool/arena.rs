//! Per-request bump allocator.
//!
//! One arena belongs to one request on one connection. Allocation bumps an
//! offset; `reset` rewinds it in O(1). The region never grows: callers get
//! `None` when the remaining space is insufficient and must fall back or
//! fail the request. Resetting takes `&mut self`, so any slice handed out
//! earlier is dead by construction before the next request reuses the
//! region.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::ptr::NonNull;

/// Default allocation alignment.
pub const DEFAULT_ALIGN: usize = 8;

/// A fixed-capacity bump region. Single-threaded, owned by one request.
pub struct Arena {
    base: NonNull<u8>,
    cap: usize,
    offset: Cell<usize>,
}

impl Arena {
    /// Allocate a zeroed region of `cap` bytes.
    pub fn with_capacity(cap: usize) -> Arena {
        assert!(cap > 0, "zero-sized arena");
        let layout = Layout::from_size_align(cap, DEFAULT_ALIGN).expect("arena layout");
        // SAFETY: non-zero size, valid alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).expect("arena allocation failed");
        Arena {
            base,
            cap,
            offset: Cell::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Bytes handed out since the last reset.
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.cap - self.offset.get()
    }

    /// Bump-allocate `size` bytes at the given alignment.
    ///
    /// Returns a zeroed (or previously-used, then overwritten) mutable
    /// slice living as long as the arena borrow, or `None` when the region
    /// cannot hold the request.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<&mut [u8]> {
        debug_assert!(align.is_power_of_two());
        let offset = self.offset.get();
        let aligned = offset.checked_add(align - 1)? & !(align - 1);
        let end = aligned.checked_add(size)?;
        if end > self.cap {
            return None;
        }
        self.offset.set(end);
        // SAFETY: [aligned, end) is in bounds and disjoint from every
        // previously returned slice; the offset only moves forward between
        // resets, and reset requires `&mut self`.
        Some(unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(aligned), size) })
    }

    /// Bump-allocate `size` bytes at the default 8-byte alignment.
    #[inline]
    pub fn alloc(&self, size: usize) -> Option<&mut [u8]> {
        self.alloc_aligned(size, DEFAULT_ALIGN)
    }

    /// Copy `data` into the arena.
    pub fn alloc_slice(&self, data: &[u8]) -> Option<&[u8]> {
        let dst = self.alloc_aligned(data.len(), 1)?;
        dst.copy_from_slice(data);
        Some(dst)
    }

    /// Copy `s` into the arena.
    pub fn alloc_str(&self, s: &str) -> Option<&str> {
        let bytes = self.alloc_slice(s.as_bytes())?;
        // SAFETY: bytes are a verbatim copy of a valid str.
        Some(unsafe { std::str::from_utf8_unchecked(bytes) })
    }

    /// Rewind the offset to zero. O(1); the region is not zeroed.
    #[inline]
    pub fn reset(&mut self) {
        self.offset.set(0);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.cap, DEFAULT_ALIGN).expect("arena layout");
        // SAFETY: `base` was allocated with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("cap", &self.cap)
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_reset() {
        let mut arena = Arena::with_capacity(256);
        assert_eq!(arena.available(), 256);

        let a = arena.alloc(100).unwrap();
        assert_eq!(a.len(), 100);
        assert!(arena.available() <= 156);

        assert!(arena.alloc(200).is_none());

        arena.reset();
        assert_eq!(arena.available(), 256);
        assert!(arena.alloc(200).is_some());
    }

    #[test]
    fn default_alignment_is_eight() {
        let arena = Arena::with_capacity(256);
        let _ = arena.alloc(3).unwrap();
        let b = arena.alloc(8).unwrap();
        assert_eq!(b.as_ptr() as usize % DEFAULT_ALIGN, 0);
    }

    #[test]
    fn custom_alignment() {
        let arena = Arena::with_capacity(1024);
        let _ = arena.alloc_aligned(1, 1).unwrap();
        let aligned = arena.alloc_aligned(10, 64).unwrap();
        assert_eq!(aligned.as_ptr() as usize % 64, 0);
    }

    #[test]
    fn allocations_within_available_always_succeed() {
        let arena = Arena::with_capacity(4096);
        // 8-byte aligned chunks pack exactly.
        for _ in 0..512 {
            assert!(arena.alloc(8).is_some());
        }
        assert_eq!(arena.available(), 0);
        assert!(arena.alloc(1).is_none());
    }

    #[test]
    fn slice_and_str_copies() {
        let arena = Arena::with_capacity(64);
        let s = arena.alloc_str("/users/42").unwrap();
        assert_eq!(s, "/users/42");
        let b = arena.alloc_slice(b"abc").unwrap();
        assert_eq!(b, b"abc");
        assert!(arena.alloc_slice(&[0u8; 64]).is_none());
    }
}
