//! Arena heap — best-fit allocator over one fixed byte arena
//!
//! Every block starts with a 16-byte header (`used`, `size`, `prev`, `next`)
//! stored inside the arena itself. Blocks form a doubly linked list in
//! address order; `size` includes the header, so the sizes of all blocks
//! always add up to the arena size.
//!
//! - Best fit: the smallest free block that is large enough wins, an exact
//!   match ends the scan early.
//! - A chosen block is split when more than two headers' worth would be left.
//! - Free merges with the next block, then with the previous one, so two free
//!   blocks are never adjacent.
//!
//! Offsets replace raw pointers: a [`HeapPtr`] is the payload offset inside
//! the arena. Freeing the same pointer twice, or a pointer that did not come
//! from [`Heap::malloc`], is not detected. The arena is bounds-checked, so the
//! damage is limited to corrupted bookkeeping or a panic.
//!
//! Author: Moroya Sakamoto

use log::{debug, trace, warn};

use crate::config::ALIGNMENT;
use crate::error::Status;

/// Bytes of block header preceding every payload
pub const HEADER_SIZE: usize = 16;

/// Link value meaning "no neighbour"
const NIL: u32 = u32::MAX;

/// Round `value` up to a power-of-two `align`
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a power-of-two `align`
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[repr(C, align(8))]
struct Arena<const N: usize>([u8; N]);

/// Payload handle returned by [`Heap::malloc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapPtr(usize);

impl HeapPtr {
    /// Payload offset from the arena base
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Raw form, for passing through a task argument
    pub const fn to_raw(self) -> usize {
        self.0
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Pointer `bytes` further into the same payload
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    used: bool,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// One node of the block list, as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Header offset
    pub offset: usize,
    /// Total bytes including header
    pub size: usize,
    pub used: bool,
}

/// Heap usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Arena bytes
    pub total: usize,
    /// Bytes in used blocks (headers included)
    pub used: usize,
    /// Bytes in free blocks (headers included)
    pub free: usize,
    /// Number of blocks in the list
    pub blocks: usize,
    /// Largest payload a single `malloc` could still return
    pub largest_free: usize,
}

/// Fixed-arena heap
pub struct Heap<const N: usize> {
    arena: Arena<N>,
    formatted: bool,
}

impl<const N: usize> Heap<N> {
    /// Unformatted heap; call [`init`](Self::init) before allocating
    pub const fn new() -> Self {
        Self {
            arena: Arena([0u8; N]),
            formatted: false,
        }
    }

    /// Format the arena as one free block spanning all of it.
    ///
    /// Calling this again invalidates every outstanding allocation.
    pub fn init(&mut self) -> Status {
        if N < HEADER_SIZE + ALIGNMENT || N >= NIL as usize {
            return Status::InvalidArgument;
        }
        self.write_header(
            0,
            Header {
                used: false,
                size: N,
                prev: None,
                next: None,
            },
        );
        self.formatted = true;
        debug!("heap: formatted {} byte arena", N);
        Status::Ok
    }

    pub fn is_initialized(&self) -> bool {
        self.formatted
    }

    /// Allocate `size` payload bytes. `None` when no free block is large
    /// enough (no compaction is attempted), when `size` is zero, or before
    /// [`init`](Self::init).
    pub fn malloc(&mut self, size: usize) -> Option<HeapPtr> {
        if !self.formatted || size == 0 || size > N {
            return None;
        }
        let need = align_up(size, ALIGNMENT) + HEADER_SIZE;

        let mut best: Option<(usize, usize)> = None;
        let mut cursor = Some(0);
        while let Some(offset) = cursor {
            let header = self.header(offset);
            if !header.used && header.size >= need {
                if header.size == need {
                    best = Some((offset, header.size));
                    break;
                }
                if best.map_or(true, |(_, best_size)| header.size < best_size) {
                    best = Some((offset, header.size));
                }
            }
            cursor = header.next;
        }

        let Some((offset, _)) = best else {
            warn!("heap: no block for {} bytes", size);
            return None;
        };

        let mut header = self.header(offset);
        if header.size - need > 2 * HEADER_SIZE {
            let rest = offset + need;
            self.write_header(
                rest,
                Header {
                    used: false,
                    size: header.size - need,
                    prev: Some(offset),
                    next: header.next,
                },
            );
            if let Some(next) = header.next {
                self.set_prev(next, Some(rest));
            }
            trace!(
                "heap: split {:#x} into {} + {}",
                offset,
                need,
                header.size - need
            );
            header.size = need;
            header.next = Some(rest);
        }
        header.used = true;
        self.write_header(offset, header);

        Some(HeapPtr(offset + HEADER_SIZE))
    }

    /// Release a block and merge it with free neighbours
    pub fn free(&mut self, ptr: HeapPtr) {
        let offset = ptr.0 - HEADER_SIZE;
        let mut header = self.header(offset);
        header.used = false;

        if let Some(next) = header.next {
            let after = self.header(next);
            if !after.used {
                trace!("heap: merge {:#x} <- {:#x}", offset, next);
                header.size += after.size;
                header.next = after.next;
                if let Some(beyond) = after.next {
                    self.set_prev(beyond, Some(offset));
                }
            }
        }
        self.write_header(offset, header);

        if let Some(prev) = header.prev {
            let mut before = self.header(prev);
            if !before.used {
                trace!("heap: merge {:#x} <- {:#x}", prev, offset);
                before.size += header.size;
                before.next = header.next;
                if let Some(next) = header.next {
                    self.set_prev(next, Some(prev));
                }
                self.write_header(prev, before);
            }
        }
    }

    /// `raw` as a payload pointer if it is shaped like one: behind the first
    /// header, inside the arena, aligned. Does not prove `malloc` returned it.
    pub fn payload(&self, raw: usize) -> Option<HeapPtr> {
        let shaped = raw >= HEADER_SIZE && raw < N && raw % ALIGNMENT == 0;
        shaped.then_some(HeapPtr(raw))
    }

    /// Payload bytes available behind `ptr`
    pub fn usable_size(&self, ptr: HeapPtr) -> usize {
        self.header(ptr.0 - HEADER_SIZE).size - HEADER_SIZE
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.arena.0[offset..offset + 4]);
        u32::from_ne_bytes(word)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.arena.0[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn bytes(&self, ptr: HeapPtr, len: usize) -> &[u8] {
        &self.arena.0[ptr.0..ptr.0 + len]
    }

    pub fn bytes_mut(&mut self, ptr: HeapPtr, len: usize) -> &mut [u8] {
        &mut self.arena.0[ptr.0..ptr.0 + len]
    }

    /// Machine address of an arena offset
    pub fn address_of(&self, offset: usize) -> usize {
        self.arena.0.as_ptr() as usize + offset
    }

    /// Arena offset of a machine address, if it lies inside the arena
    pub fn offset_of_address(&self, addr: usize) -> Option<usize> {
        let base = self.arena.0.as_ptr() as usize;
        (base..=base + N).contains(&addr).then(|| addr - base)
    }

    /// Walk the block list in address order
    pub fn blocks(&self) -> Blocks<'_, N> {
        Blocks {
            heap: self,
            cursor: self.formatted.then_some(0),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            total: N,
            ..HeapStats::default()
        };
        for block in self.blocks() {
            stats.blocks += 1;
            if block.used {
                stats.used += block.size;
            } else {
                stats.free += block.size;
                stats.largest_free = stats.largest_free.max(block.size - HEADER_SIZE);
            }
        }
        stats
    }

    /// Verify the list invariants: sizes cover the arena exactly, links are
    /// in strict address order with matching back-links, and no two free
    /// blocks are adjacent.
    pub fn check(&self) -> bool {
        if !self.formatted {
            return false;
        }
        let mut expected_offset = 0;
        let mut prev: Option<usize> = None;
        let mut prev_free = false;
        let mut cursor = Some(0);
        while let Some(offset) = cursor {
            if offset != expected_offset || offset + HEADER_SIZE > N {
                return false;
            }
            let header = self.header(offset);
            if header.prev != prev || header.size < HEADER_SIZE {
                return false;
            }
            if prev_free && !header.used {
                return false;
            }
            expected_offset = offset + header.size;
            prev = Some(offset);
            prev_free = !header.used;
            cursor = header.next;
        }
        expected_offset == N
    }

    fn header(&self, offset: usize) -> Header {
        let link = |word: u32| (word != NIL).then_some(word as usize);
        Header {
            used: self.read_u32(offset) != 0,
            size: self.read_u32(offset + 4) as usize,
            prev: link(self.read_u32(offset + 8)),
            next: link(self.read_u32(offset + 12)),
        }
    }

    fn write_header(&mut self, offset: usize, header: Header) {
        let link = |slot: Option<usize>| slot.map_or(NIL, |o| o as u32);
        self.write_u32(offset, header.used as u32);
        self.write_u32(offset + 4, header.size as u32);
        self.write_u32(offset + 8, link(header.prev));
        self.write_u32(offset + 12, link(header.next));
    }

    fn set_prev(&mut self, offset: usize, prev: Option<usize>) {
        let mut header = self.header(offset);
        header.prev = prev;
        self.write_header(offset, header);
    }
}

impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over [`BlockInfo`], see [`Heap::blocks`]
pub struct Blocks<'a, const N: usize> {
    heap: &'a Heap<N>,
    cursor: Option<usize>,
}

impl<const N: usize> Iterator for Blocks<'_, N> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let offset = self.cursor?;
        let header = self.heap.header(offset);
        // A corrupted list must not walk us out of the arena
        self.cursor = header.next.filter(|&next| next > offset && next < N);
        Some(BlockInfo {
            offset,
            size: header.size,
            used: header.used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap<1024> {
        let mut heap = Heap::new();
        assert_eq!(heap.init(), Status::Ok);
        heap
    }

    fn total_size<const N: usize>(heap: &Heap<N>) -> usize {
        heap.blocks().map(|b| b.size).sum()
    }

    #[test]
    fn test_init_single_free_block() {
        let heap = heap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(
            blocks,
            vec![BlockInfo {
                offset: 0,
                size: 1024,
                used: false
            }]
        );
        assert!(heap.check());
    }

    #[test]
    fn test_uninitialized_heap_refuses() {
        let mut heap = Heap::<1024>::new();
        assert!(heap.malloc(16).is_none());
        assert!(!heap.check());
        assert_eq!(heap.blocks().count(), 0);
    }

    #[test]
    fn test_zero_size_refused() {
        let mut heap = heap();
        assert!(heap.malloc(0).is_none());
    }

    #[test]
    fn test_payload_shape() {
        let mut heap = heap();
        let ptr = heap.malloc(32).unwrap();
        assert_eq!(heap.payload(ptr.to_raw()), Some(ptr));
        for raw in [0, 1, 8, 15, 17, 1024, 4096] {
            assert_eq!(heap.payload(raw), None, "{raw}");
        }
    }

    #[test]
    fn test_concrete_reuse_scenario() {
        let mut heap = heap();
        let first = heap.malloc(100).unwrap();
        // First block sits at the arena base
        assert_eq!(first.offset(), HEADER_SIZE);

        let second = heap.malloc(100).unwrap();
        assert!(second.offset() >= first.offset() + 100);

        heap.free(first);
        let third = heap.malloc(50).unwrap();
        assert_eq!(third, first);
        assert!(heap.check());
    }

    #[test]
    fn test_payload_alignment() {
        let mut heap = heap();
        for size in [1, 3, 7, 9, 13] {
            let ptr = heap.malloc(size).unwrap();
            assert_eq!(ptr.offset() % ALIGNMENT, 0);
            assert_eq!(heap.address_of(ptr.offset()) % ALIGNMENT, 0);
            assert!(heap.usable_size(ptr) >= size);
        }
    }

    #[test]
    fn test_conservation_through_churn() {
        let mut heap = heap();
        let mut live = Vec::new();
        for round in 0..6 {
            for size in [24, 8, 64, 40] {
                if let Some(ptr) = heap.malloc(size + round) {
                    live.push(ptr);
                }
                assert_eq!(total_size(&heap), 1024);
                assert!(heap.check());
            }
            // Free every other allocation
            let mut i = 0;
            live.retain(|&ptr| {
                i += 1;
                if i % 2 == 0 {
                    heap.free(ptr);
                    false
                } else {
                    true
                }
            });
            assert_eq!(total_size(&heap), 1024);
            assert!(heap.check());
        }
        for ptr in live {
            heap.free(ptr);
        }
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn test_split_pair_coalesces_back() {
        let mut heap = heap();
        let a = heap.malloc(200).unwrap();
        let b = heap.malloc(200).unwrap();
        assert_eq!(heap.blocks().count(), 3);

        heap.free(a);
        heap.free(b);
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 1024);
        assert!(!blocks[0].used);
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        let mut heap = heap();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        let c = heap.malloc(64).unwrap();
        let _guard = heap.malloc(64).unwrap();

        heap.free(a);
        heap.free(c);
        assert_eq!(heap.blocks().filter(|b| !b.used).count(), 3);

        heap.free(b);
        let free: Vec<_> = heap.blocks().filter(|b| !b.used).collect();
        assert_eq!(free.len(), 2);
        assert_eq!(free[0].offset, 0);
        assert_eq!(free[0].size, 3 * (64 + HEADER_SIZE));
        assert!(heap.check());
    }

    #[test]
    fn test_best_fit_picks_smallest_hole() {
        let mut heap = heap();
        let big = heap.malloc(200).unwrap();
        let _a = heap.malloc(8).unwrap();
        let small = heap.malloc(64).unwrap();
        let _b = heap.malloc(8).unwrap();

        heap.free(big);
        heap.free(small);
        let ptr = heap.malloc(60).unwrap();
        assert_eq!(ptr, small);
    }

    #[test]
    fn test_exact_fit_takes_whole_block() {
        let mut heap = heap();
        let a = heap.malloc(96).unwrap();
        let _pin = heap.malloc(8).unwrap();
        heap.free(a);

        let before = heap.blocks().count();
        let again = heap.malloc(96).unwrap();
        assert_eq!(again, a);
        assert_eq!(heap.blocks().count(), before);
    }

    #[test]
    fn test_small_remainder_not_split() {
        let mut heap = Heap::<256>::new();
        heap.init();
        // Leaves 256 - (216 + 16) = 24 bytes: not more than two headers
        let ptr = heap.malloc(216).unwrap();
        assert_eq!(heap.blocks().count(), 1);
        assert_eq!(heap.usable_size(ptr), 256 - HEADER_SIZE);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut heap = heap();
        assert!(heap.malloc(2048).is_none());
        let all = heap.malloc(1024 - HEADER_SIZE).unwrap();
        assert!(heap.malloc(8).is_none());
        heap.free(all);
        assert!(heap.malloc(8).is_some());
    }

    #[test]
    fn test_stats() {
        let mut heap = heap();
        let ptr = heap.malloc(100).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.total, 1024);
        assert_eq!(stats.used, 104 + HEADER_SIZE);
        assert_eq!(stats.used + stats.free, 1024);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.largest_free, 1024 - 120 - HEADER_SIZE);
        heap.free(ptr);
        assert_eq!(heap.stats().used, 0);
    }

    #[test]
    fn test_reinit_discards_allocations() {
        let mut heap = heap();
        heap.malloc(100).unwrap();
        heap.malloc(100).unwrap();
        heap.init();
        assert_eq!(heap.blocks().count(), 1);
        assert_eq!(heap.stats().free, 1024);
    }

    #[test]
    fn test_word_access_and_addresses() {
        let mut heap = heap();
        let ptr = heap.malloc(16).unwrap();
        heap.write_u32(ptr.offset(), 0xCAFE_F00D);
        assert_eq!(heap.read_u32(ptr.offset()), 0xCAFE_F00D);
        heap.bytes_mut(ptr.add(4), 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(heap.bytes(ptr.add(4), 4), &[1, 2, 3, 4]);

        let addr = heap.address_of(ptr.offset());
        assert_eq!(heap.offset_of_address(addr), Some(ptr.offset()));
        assert_eq!(heap.offset_of_address(0), None);
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(68, 8), 72);
        assert_eq!(align_down(77, 8), 72);
    }
}
