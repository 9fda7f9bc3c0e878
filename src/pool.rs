//! Bump-pointer arena used for all per-connection scratch storage.
//!
//! A [`MemoryPool`] is a single fixed-capacity byte buffer split into a
//! front region (grows upward, used for the read/write buffers and anything
//! that may need to grow) and a back region (grows downward, used for small
//! persistent records that must outlive many front-region grows, such as
//! parsed header entries).
//!
//! The hot path is [`MemoryPool::try_grow_last`]: the request parser keeps
//! re-growing the same front allocation as more bytes arrive, and this must
//! never copy. [`MemoryPool::reallocate`] is the general form, which silently
//! falls back to copy-and-abandon when the pointer being grown isn't the most
//! recent front allocation; callers on the hot path use `try_grow_last`
//! instead so they can't accidentally hit that fallback.

use std::fmt;

/// Error returned when a pool operation cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted;

impl fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory pool exhausted")
    }
}

impl std::error::Error for PoolExhausted {}

/// Bump-pointer allocator with two-ended allocation and a constrained
/// "grow the last front allocation" operation.
///
/// Not reentrant; a pool belongs to exactly one connection at a time.
pub struct MemoryPool {
    buffer: Box<[u8]>,
    /// Next free byte from the front.
    pos: usize,
    /// Next free byte from the back (exclusive upper bound of the free region).
    end: usize,
    /// Offset of the start of the most recent front allocation, if any.
    last_front_alloc: Option<usize>,
    /// Bytes abandoned by non-most-recent `reallocate` calls; diagnostic only.
    leaked_bytes: usize,
}

impl MemoryPool {
    /// Creates a pool backed by a zeroed buffer of exactly `max` bytes.
    pub fn create(max: usize) -> Self {
        MemoryPool {
            buffer: vec![0u8; max].into_boxed_slice(),
            pos: 0,
            end: max,
            last_front_alloc: None,
            leaked_bytes: 0,
        }
    }

    /// Total capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes currently free between the front and back cursors.
    pub fn free_region_size(&self) -> usize {
        self.end - self.pos
    }

    /// Running total of bytes abandoned by a non-most-recent `reallocate`.
    /// Stays at zero unless callers reallocate through stale pointers.
    pub fn leaked_bytes(&self) -> usize {
        self.leaked_bytes
    }

    /// Reclaims the whole pool for a new request/response cycle on the same
    /// connection. Does not re-zero the buffer; every live region is
    /// addressed by an offset/length recorded during the cycle that just
    /// ended, so stale bytes past `pos`/before `end` are never read.
    pub(crate) fn reset(&mut self) {
        self.pos = 0;
        self.end = self.buffer.len();
        self.last_front_alloc = None;
        self.leaked_bytes = 0;
    }

    /// Reserves `size` bytes from the front (default) or back (`from_end`),
    /// returning the byte offset of the reservation within the pool.
    ///
    /// Back allocations are for small, persistent records that must outlive
    /// later front-region grows (e.g. parsed header entries); they are never
    /// reallocated or reclaimed individually, only at pool drop.
    pub fn allocate(&mut self, size: usize, from_end: bool) -> Result<usize, PoolExhausted> {
        if size > self.free_region_size() {
            return Err(PoolExhausted);
        }
        if from_end {
            self.end -= size;
            Ok(self.end)
        } else {
            let offset = self.pos;
            self.pos += size;
            self.last_front_alloc = Some(offset);
            Ok(offset)
        }
    }

    /// The non-leaking hot path: grows (or shrinks) the most recent front
    /// allocation in place. Returns `None` if `old_offset` is not the most
    /// recent front allocation, or if there isn't room to grow — callers
    /// must not fall back to `reallocate` from here if they want to
    /// guarantee no leak; this method exists precisely so they don't have to.
    pub fn try_grow_last(&mut self, old_offset: usize, old_len: usize, new_len: usize) -> bool {
        if self.last_front_alloc != Some(old_offset) {
            return false;
        }
        if old_offset + new_len > self.end {
            return false;
        }
        self.pos = old_offset + new_len;
        let _ = old_len;
        true
    }

    /// General reallocate: cheap in-place grow/shrink if `old_offset` is the
    /// most recent front allocation and there's room; otherwise a fresh
    /// front allocation of `new_len` bytes is made, `min(old_len, new_len)`
    /// bytes are copied over, and the old slot is abandoned (counted in
    /// [`MemoryPool::leaked_bytes`], reclaimed only at pool drop).
    pub fn reallocate(
        &mut self,
        old_offset: usize,
        old_len: usize,
        new_len: usize,
    ) -> Result<usize, PoolExhausted> {
        if self.try_grow_last(old_offset, old_len, new_len) {
            return Ok(old_offset);
        }

        let new_offset = self.allocate(new_len, false)?;
        let copy_len = old_len.min(new_len);
        let (src_start, src_end) = (old_offset, old_offset + copy_len);
        self.buffer.copy_within(src_start..src_end, new_offset);

        self.leaked_bytes += old_len;
        tracing::debug!(
            old_offset,
            old_len,
            new_len,
            leaked_total = self.leaked_bytes,
            "memory pool abandoned a non-most-recent allocation on reallocate"
        );

        Ok(new_offset)
    }

    /// Shared view of bytes `[offset, offset+len)`.
    pub fn get(&self, offset: usize, len: usize) -> &[u8] {
        &self.buffer[offset..offset + len]
    }

    /// Bounds-checked shared view, for callers working off attacker-controlled
    /// offsets/lengths (request parsing) that must not panic on malformed input.
    pub fn try_get(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.buffer.get(offset..offset.checked_add(len)?)
    }

    /// Exclusive view of bytes `[offset, offset+len)`.
    pub fn get_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.buffer[offset..offset + len]
    }

    /// Copies `len` bytes from `src` to `dst` within the same buffer
    /// (regions may overlap). Used to reassemble data split across several
    /// front-region spans (e.g. dechunking) into one contiguous allocation.
    pub(crate) fn copy_region(&mut self, src: usize, dst: usize, len: usize) {
        self.buffer.copy_within(src..src + len, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_front_and_back_share_one_free_region() {
        let mut pool = MemoryPool::create(16);
        assert_eq!(pool.free_region_size(), 16);

        let front = pool.allocate(4, false).unwrap();
        assert_eq!(front, 0);
        assert_eq!(pool.free_region_size(), 12);

        let back = pool.allocate(4, true).unwrap();
        assert_eq!(back, 12);
        assert_eq!(pool.free_region_size(), 8);
    }

    #[test]
    fn allocate_fails_when_exhausted() {
        let mut pool = MemoryPool::create(4);
        assert!(pool.allocate(5, false).is_err());
        assert!(pool.allocate(4, false).is_ok());
        assert!(pool.allocate(1, false).is_err());
    }

    #[test]
    fn try_grow_last_extends_in_place_without_copy() {
        let mut pool = MemoryPool::create(32);
        let off = pool.allocate(4, false).unwrap();
        pool.get_mut(off, 4).copy_from_slice(b"abcd");

        assert!(pool.try_grow_last(off, 4, 8));
        assert_eq!(pool.get(off, 4), b"abcd");
        assert_eq!(pool.leaked_bytes(), 0);
    }

    #[test]
    fn try_grow_last_rejects_non_most_recent() {
        let mut pool = MemoryPool::create(32);
        let first = pool.allocate(4, false).unwrap();
        let _second = pool.allocate(4, false).unwrap();

        assert!(!pool.try_grow_last(first, 4, 8));
    }

    #[test]
    fn shrinking_most_recent_allocation_never_fails() {
        let mut pool = MemoryPool::create(16);
        let off = pool.allocate(8, false).unwrap();
        assert!(pool.try_grow_last(off, 8, 2));
        assert_eq!(pool.free_region_size(), 14);
    }

    #[test]
    fn reallocate_non_most_recent_copies_and_leaks() {
        let mut pool = MemoryPool::create(64);
        let first = pool.allocate(4, false).unwrap();
        pool.get_mut(first, 4).copy_from_slice(b"data");
        let _second = pool.allocate(4, false).unwrap();

        let moved = pool.reallocate(first, 4, 8).unwrap();
        assert_ne!(moved, first);
        assert_eq!(&pool.get(moved, 4), b"data");
        assert_eq!(pool.leaked_bytes(), 4);
    }

    #[test]
    fn free_region_size_monotonic_between_allocations() {
        let mut pool = MemoryPool::create(64);
        let mut prev = pool.free_region_size();
        for _ in 0..4 {
            pool.allocate(8, false).unwrap();
            let now = pool.free_region_size();
            assert!(now < prev);
            prev = now;
        }
    }

    #[test]
    fn reset_reclaims_whole_pool_for_next_cycle() {
        let mut pool = MemoryPool::create(16);
        pool.allocate(4, false).unwrap();
        pool.allocate(4, true).unwrap();
        pool.reallocate(0, 4, 8).unwrap();
        assert!(pool.leaked_bytes() > 0);

        pool.reset();
        assert_eq!(pool.free_region_size(), 16);
        assert_eq!(pool.leaked_bytes(), 0);
        assert_eq!(pool.allocate(16, false), Ok(0));
    }

    #[test]
    fn regions_never_overlap_or_escape_bounds() {
        let mut pool = MemoryPool::create(32);
        let a = pool.allocate(8, false).unwrap();
        let b = pool.allocate(8, true).unwrap();

        assert!(a + 8 <= b);
        assert!(b + 8 <= pool.capacity());
    }
}
