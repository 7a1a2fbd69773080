//! Fixed byte arena shared by the producer and the spill thread.
//!
//! Offsets handed around are *logical*: they grow without bound and map to
//! a physical position by `offset % capacity`. The buffer's used/released
//! counters guarantee that the producer only writes logical ranges the spill
//! thread has released, and the spill thread only reads frozen ranges the
//! producer no longer touches.

use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::slice;

/// One record (or coalesced run of records) inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIndexEntry {
    /// Logical start offset.
    pub offset: u64,
    pub len: u32,
}

impl RecordIndexEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

pub struct SpillArena {
    data: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all access goes through `write_at` / `view`, whose callers uphold
// the disjointness contract described on those methods.
unsafe impl Sync for SpillArena {}

impl SpillArena {
    pub fn new(capacity: usize) -> Self {
        let data = (0..capacity.max(1)).map(|_| UnsafeCell::new(0u8)).collect();
        Self { data }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }

    fn physical(&self, offset: u64) -> usize {
        (offset % self.data.len() as u64) as usize
    }

    /// Copy `bytes` to logical `offset`, wrapping at the physical end.
    ///
    /// # Safety
    /// No other thread may read or write `[offset, offset + bytes.len())`
    /// for the duration of the call.
    pub unsafe fn write_at(&self, offset: u64, bytes: &[u8]) {
        let cap = self.capacity();
        debug_assert!(bytes.len() <= cap);
        let start = self.physical(offset);
        let first = bytes.len().min(cap - start);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base().add(start), first);
        if first < bytes.len() {
            std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.base(), bytes.len() - first);
        }
    }

    /// Read-only view over a frozen logical range.
    ///
    /// # Safety
    /// No thread may write `[start, end)` while the view is alive.
    pub unsafe fn view(&self, start: u64, end: u64) -> ArenaView<'_> {
        ArenaView {
            arena: self,
            start,
            end,
        }
    }
}

// ── ArenaView ──────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct ArenaView<'a> {
    arena: &'a SpillArena,
    start: u64,
    end: u64,
}

impl<'a> ArenaView<'a> {
    /// Logical range covered.
    pub fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Bytes of `entry`, split in two if it wraps the physical end.
    pub fn bytes(&self, entry: &RecordIndexEntry) -> RecordBytes<'a> {
        debug_assert!(entry.offset >= self.start && entry.end() <= self.end);
        let cap = self.arena.capacity();
        let start = self.arena.physical(entry.offset);
        let len = entry.len as usize;
        let first = len.min(cap - start);
        // SAFETY: the entry lies inside the frozen range this view covers.
        unsafe {
            let base = self.arena.base();
            RecordBytes {
                head: slice::from_raw_parts(base.add(start), first),
                tail: slice::from_raw_parts(base, len - first),
            }
        }
    }
}

/// A record's bytes; `tail` is non-empty only when the record wraps.
#[derive(Debug, Clone, Copy)]
pub struct RecordBytes<'a> {
    pub head: &'a [u8],
    pub tail: &'a [u8],
}

impl<'a> RecordBytes<'a> {
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contiguous(&self) -> Option<&'a [u8]> {
        if self.tail.is_empty() {
            Some(self.head)
        } else {
            None
        }
    }

    /// Contiguous bytes, copying into `scratch` only when the record wraps.
    pub fn as_slice<'s>(&self, scratch: &'s mut Vec<u8>) -> &'s [u8]
    where
        'a: 's,
    {
        match self.contiguous() {
            Some(bytes) => bytes,
            None => {
                scratch.clear();
                scratch.extend_from_slice(self.head);
                scratch.extend_from_slice(self.tail);
                &scratch[..]
            }
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self.head)?;
        w.write_all(self.tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_write_and_view() {
        let arena = SpillArena::new(8);
        // SAFETY: single-threaded test.
        unsafe {
            arena.write_at(6, b"abcd");
            let view = arena.view(6, 10);
            let bytes = view.bytes(&RecordIndexEntry { offset: 6, len: 4 });
            assert_eq!(bytes.head, b"ab");
            assert_eq!(bytes.tail, b"cd");
            let mut scratch = Vec::new();
            assert_eq!(bytes.as_slice(&mut scratch), b"abcd");
        }
    }

    #[test]
    fn test_logical_offsets_past_capacity() {
        let arena = SpillArena::new(4);
        unsafe {
            arena.write_at(9, b"xy");
            let view = arena.view(9, 11);
            let bytes = view.bytes(&RecordIndexEntry { offset: 9, len: 2 });
            assert_eq!(bytes.contiguous(), Some(&b"xy"[..]));
        }
    }
}
