//! The region allocator.
//!
//! A `Heap` owns one mapping and carves it into a gap-free sequence of
//! blocks. All bookkeeping lives inside the mapping itself:
//!
//! ```text
//!   mapping
//!   +-----+--------+---------------+--------+-----------+--------+-----+
//!   | pad | header |    payload    | header |  (unused) | footer | end |
//!   +-----+--------+---------------+--------+-----------+--------+-----+
//!         ^        ^               ^                             ^
//!         |        |               |                             |
//!     heap_start   payload      free block                   end marker
//!                  (8-aligned)
//! ```
//!
//! Allocation is a best-fit search over one left-to-right walk of the block
//! sequence, splitting the chosen block when the remainder can stand on its
//! own as a free block. Release coalesces immediately with both physical
//! neighbours, so no two free blocks are ever adjacent. Free blocks carry a
//! footer so that a block being released can find a free predecessor in
//! constant time. Allocated blocks have no footer; their successor only
//! records that they are allocated, in its `prev_allocated` header bit.

use core::ptr::NonNull;

use crate::align::{align_up, is_aligned, round_to_page};
use crate::error::{HeapError, Result};
use crate::header::{
    decode_footer, encode_footer, BlockHeader, Tag, Word, BLOCK_ALIGN, MAX_BLOCK_SIZE,
    MIN_FREE_BLOCK, WORD_BYTES,
};
use crate::os;

mod report;
pub use report::{BlockInfo, Blocks, HeapStats, Report};

/// Bytes of the mapping that are not part of any block: the leading pad that
/// puts every payload on an 8-byte boundary, and the trailing end marker.
const RESERVED_BYTES: usize = 2 * WORD_BYTES;

/// A single-region, best-fit heap with in-place block metadata.
///
/// The region is mapped once by [`Heap::new`] and never grows or shrinks. It
/// is unmapped when the `Heap` is dropped, which invalidates every pointer it
/// has handed out.
///
/// `Heap` does no locking of its own. To share one across threads, or to use
/// it through the `Allocator` trait, wrap it in a
#[cfg_attr(feature = "locked_heap", doc = "[`LockedHeap`](crate::LockedHeap).")]
#[cfg_attr(not(feature = "locked_heap"), doc = "`LockedHeap`.")]
pub struct Heap {
    /// The start of the mapping, as returned by the OS.
    mapping: NonNull<u8>,

    /// The length of the mapping: the requested size rounded up to a whole
    /// number of pages.
    mapped_len: usize,

    /// The first block header.
    start: NonNull<u8>,

    /// The number of bytes covered by blocks, from `start` up to (not
    /// including) the end marker.
    arena_size: usize,
}

// Safety: the heap exclusively owns its mapping, and every access to it goes
// through `&self`/`&mut self`.
unsafe impl Send for Heap {}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("heap_start", &self.start)
            .field("arena_size", &self.arena_size)
            .field("mapped_len", &self.mapped_len)
            .finish()
    }
}

impl Heap {
    /// Map a region of at least `requested` bytes and install a single free
    /// block spanning all of it.
    ///
    /// The request is rounded up to a whole number of pages. Eight bytes of
    /// the mapping are reserved for alignment padding and the end marker, so
    /// [`Heap::arena_size`] is the rounded size minus eight.
    pub fn new(requested: usize) -> Result<Heap> {
        if requested == 0 {
            log::error!("requested heap size is not positive");
            return Err(HeapError::InvalidArgument(
                "requested heap size must be positive",
            ));
        }

        let page = os::page_size();
        let mapped_len = round_to_page(requested, page)
            .filter(|len| len - RESERVED_BYTES <= MAX_BLOCK_SIZE)
            .ok_or_else(|| {
                log::error!("requested heap size {requested} is too large");
                HeapError::InvalidArgument("requested heap size is too large")
            })?;

        let mapping = os::map(mapped_len).map_err(|e| {
            log::error!("mmap cannot allocate {mapped_len} bytes: {e}");
            HeapError::Map(e)
        })?;

        let arena_size = mapped_len - RESERVED_BYTES;
        debug_assert!(is_aligned(arena_size, BLOCK_ALIGN));

        // Safety: the mapping is at least a page long.
        let start = unsafe { mapping.add(WORD_BYTES) };

        let mut heap = Heap {
            mapping,
            mapped_len,
            start,
            arena_size,
        };

        // There is no block before the first one; treat it as allocated so
        // that release never looks below `heap_start` for a footer.
        heap.write_header(0, BlockHeader::free(arena_size, true));
        heap.write_footer(0, arena_size);
        heap.write_word(arena_size, Tag::end_marker());

        log::debug!(
            "initialized heap: mapping = {:p}, mapped_len = {mapped_len}, \
             heap_start = {:p}, arena_size = {arena_size}",
            heap.mapping,
            heap.start,
        );

        Ok(heap)
    }

    /// The address of the first block header.
    #[inline]
    pub fn heap_start(&self) -> NonNull<u8> {
        self.start
    }

    /// The number of bytes covered by blocks.
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    /// The length of the underlying mapping.
    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// Allocate a block with room for at least `size` payload bytes.
    ///
    /// The returned pointer is 8-byte aligned and stays valid until it is
    /// passed to [`Heap::release`] or the heap is dropped.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_with_len(size).map(|(ptr, _)| ptr)
    }

    /// Like [`Heap::allocate`], but also return the usable size of the new
    /// block, as [`Heap::usable_size`] would.
    pub(crate) fn allocate_with_len(&mut self, size: usize) -> Result<(NonNull<u8>, usize)> {
        let need = self.block_size_for(size)?;
        let (offset, block) = self.best_fit(need).ok_or(HeapError::OutOfMemory { size })?;

        let remainder = block.size - need;
        let taken = if remainder >= MIN_FREE_BLOCK {
            log::trace!(
                "splitting block at {offset:#x}: {} -> {need} + {remainder}",
                block.size
            );
            self.write_header(offset, BlockHeader::allocated(need, block.prev_allocated));

            // The successor of the remainder already has its
            // `prev_allocated` bit clear, since it used to follow `block`.
            let rest = offset + need;
            self.write_header(rest, BlockHeader::free(remainder, true));
            self.write_footer(rest, remainder);
            need
        } else {
            self.write_header(
                offset,
                BlockHeader::allocated(block.size, block.prev_allocated),
            );
            self.set_prev_allocated(offset + block.size, true);
            block.size
        };

        Ok((self.payload(offset), taken - WORD_BYTES))
    }

    /// Release a block previously returned by [`Heap::allocate`], merging it
    /// with any free physical neighbours.
    ///
    /// Fails without touching the heap if `ptr` is null, misaligned, outside
    /// of the heap, not the payload of a block, or the payload of a block that
    /// is already free.
    pub fn release(&mut self, ptr: *mut u8) -> Result<()> {
        let (offset, block) = self.live_block(ptr).inspect_err(|e| {
            log::debug!("rejected release of {ptr:p}: {e}");
        })?;

        let mut start = offset;
        let mut size = block.size;
        let mut prev_allocated = block.prev_allocated;

        let next = offset + block.size;
        match self.tag(next) {
            Tag::Block(next_block) if !next_block.allocated => {
                log::trace!(
                    "coalescing {offset:#x} with following free block at {next:#x}"
                );
                size += next_block.size;
            }
            Tag::Block(_) => self.set_prev_allocated(next, false),
            Tag::End => {}
        }

        if !block.prev_allocated {
            let prev_size = decode_footer(self.read_word(offset - WORD_BYTES));
            start = offset - prev_size;
            let prev = self.header(start);
            debug_assert!(!prev.allocated);
            debug_assert_eq!(prev.size, prev_size);
            log::trace!("coalescing {offset:#x} with preceding free block at {start:#x}");

            prev_allocated = prev.prev_allocated;
            size += prev_size;
        }

        self.write_header(start, BlockHeader::free(size, prev_allocated));
        self.write_footer(start, size);
        Ok(())
    }

    /// The number of payload bytes available in the live block at `ptr`.
    ///
    /// This may exceed the size that was asked for, because block sizes are
    /// rounded up to a multiple of eight.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let (_, block) = self.live_block(ptr.as_ptr())?;
        Ok(block.size - WORD_BYTES)
    }

    /// Iterate over every block, from `heap_start` up to the end marker.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self)
    }

    /// Totals over every block.
    pub fn stats(&self) -> HeapStats {
        HeapStats::collect(self.blocks())
    }

    /// A printable table of every block, followed by the totals.
    pub fn report(&self) -> Report<'_> {
        Report::new(self)
    }

    /// Print [`Heap::report`] to standard output.
    pub fn dump(&self) {
        print!("{}", self.report());
    }

    /// The block size that holds `size` payload bytes.
    fn block_size_for(&self, size: usize) -> Result<usize> {
        if size < 1 {
            return Err(HeapError::InvalidArgument("allocation size must be positive"));
        }
        size.checked_add(WORD_BYTES)
            .and_then(|n| align_up(n, BLOCK_ALIGN))
            .filter(|n| *n <= self.arena_size)
            .ok_or(HeapError::OutOfMemory { size })
    }

    /// Find the smallest free block of at least `need` bytes. Among equally
    /// sized candidates, the lowest address wins.
    fn best_fit(&self, need: usize) -> Option<(usize, BlockHeader)> {
        let mut best: Option<(usize, BlockHeader)> = None;
        for (offset, block) in self.walk() {
            if block.allocated || block.size < need {
                continue;
            }
            if block.size == need {
                log::trace!("exact fit for {need} bytes at {offset:#x}");
                return Some((offset, block));
            }
            if best.map_or(true, |(_, b)| block.size < b.size) {
                best = Some((offset, block));
            }
        }
        if let Some((offset, block)) = best {
            log::trace!("best fit for {need} bytes at {offset:#x} ({} bytes)", block.size);
        }
        best
    }

    /// Check that `ptr` is the payload of an allocated block, and return that
    /// block's offset and header.
    fn live_block(&self, ptr: *mut u8) -> Result<(usize, BlockHeader)> {
        if ptr.is_null() {
            return Err(HeapError::InvalidArgument("null pointer"));
        }

        let addr = ptr as usize;
        if !is_aligned(addr, BLOCK_ALIGN) {
            return Err(HeapError::InvalidArgument("pointer is not 8-byte aligned"));
        }

        let first_payload = self.start.as_ptr() as usize + WORD_BYTES;
        let end = self.start.as_ptr() as usize + self.arena_size;
        if addr < first_payload || addr >= end {
            return Err(HeapError::OutOfRange { addr });
        }

        let offset = addr - first_payload;
        let block = self
            .walk()
            .take_while(|(at, _)| *at <= offset)
            .find(|(at, _)| *at == offset)
            .map(|(_, block)| block)
            .ok_or(HeapError::InvalidArgument("pointer is not the start of a block"))?;

        if !block.allocated {
            return Err(HeapError::DoubleFree { addr });
        }
        Ok((offset, block))
    }

    /// Walk the block sequence, yielding each block's offset from
    /// `heap_start` and its header.
    fn walk(&self) -> impl Iterator<Item = (usize, BlockHeader)> + '_ {
        let mut offset = 0;
        core::iter::from_fn(move || match self.tag(offset) {
            Tag::End => None,
            Tag::Block(block) => {
                let at = offset;
                offset += block.size;
                Some((at, block))
            }
        })
    }

    /// The footer of the free block at `offset`.
    fn footer(&self, offset: usize, size: usize) -> usize {
        decode_footer(self.read_word(offset + size - WORD_BYTES))
    }

    #[inline]
    fn payload(&self, offset: usize) -> NonNull<u8> {
        // Safety: every block offset is within the mapping.
        unsafe { self.start.add(offset + WORD_BYTES) }
    }

    #[inline]
    fn word_ptr(&self, offset: usize) -> *mut Word {
        debug_assert!(offset <= self.arena_size);
        debug_assert!(is_aligned(offset, WORD_BYTES));
        // Safety: `offset` is at most `arena_size`, and the end marker's word
        // is the last word of the mapping.
        unsafe { self.start.as_ptr().add(offset).cast() }
    }

    #[inline]
    fn read_word(&self, offset: usize) -> Word {
        // Safety: `word_ptr` is in bounds and word-aligned, since `start` is
        // one word past a page boundary and offsets are word multiples.
        unsafe { self.word_ptr(offset).read() }
    }

    #[inline]
    fn write_word(&mut self, offset: usize, word: Word) {
        // Safety: see `read_word`.
        unsafe { self.word_ptr(offset).write(word) }
    }

    #[inline]
    fn tag(&self, offset: usize) -> Tag {
        Tag::decode(self.read_word(offset))
    }

    /// The header of the real block at `offset`.
    fn header(&self, offset: usize) -> BlockHeader {
        match self.tag(offset) {
            Tag::Block(block) => block,
            Tag::End => unreachable!("end marker at {offset:#x} read as a block header"),
        }
    }

    #[inline]
    fn write_header(&mut self, offset: usize, header: BlockHeader) {
        debug_assert!(offset + header.size <= self.arena_size);
        self.write_word(offset, header.encode());
    }

    #[inline]
    fn write_footer(&mut self, offset: usize, size: usize) {
        self.write_word(offset + size - WORD_BYTES, encode_footer(size));
    }

    /// Update the `prev_allocated` bit of the block at `offset`, unless
    /// `offset` is the end marker.
    fn set_prev_allocated(&mut self, offset: usize, prev_allocated: bool) {
        if let Tag::Block(mut block) = self.tag(offset) {
            block.prev_allocated = prev_allocated;
            self.write_header(offset, block);
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Safety: the mapping came from `os::map` with this length, and
        // dropping the heap ends every loan of its memory.
        unsafe { os::unmap(self.mapping, self.mapped_len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        let _ = env_logger::try_init();
        Heap::new(1000).expect("should map a heap")
    }

    /// `(allocated, size)` for every block.
    fn shape(heap: &Heap) -> Vec<(bool, usize)> {
        heap.blocks().map(|b| (b.allocated, b.size)).collect()
    }

    /// Allocate one block of each given block size, each followed by a
    /// minimal separator block, then release the sized ones. Returns their
    /// payload pointers.
    fn carve(heap: &mut Heap, block_sizes: &[usize]) -> Vec<NonNull<u8>> {
        let ptrs: Vec<_> = block_sizes
            .iter()
            .map(|size| {
                let p = heap.allocate(size - WORD_BYTES).unwrap();
                heap.allocate(1).unwrap();
                p
            })
            .collect();
        for p in &ptrs {
            heap.release(p.as_ptr()).unwrap();
        }
        ptrs
    }

    fn assert_invariants(heap: &Heap) {
        let blocks: Vec<_> = heap.blocks().collect();
        let mut expected_start = heap.heap_start().as_ptr() as usize;
        let mut prev_allocated = true;
        for block in &blocks {
            assert_eq!(block.start, expected_start, "gap or overlap before {block:?}");
            assert_eq!(block.size % BLOCK_ALIGN, 0);
            assert_eq!(block.prev_allocated, prev_allocated, "stale p-bit on {block:?}");
            if block.allocated {
                assert_eq!(block.footer, None);
            } else {
                assert!(block.prev_allocated, "adjacent free blocks at {block:?}");
                assert_eq!(block.footer, Some(block.size));
            }
            expected_start += block.size;
            prev_allocated = block.allocated;
        }
        assert_eq!(
            expected_start,
            heap.heap_start().as_ptr() as usize + heap.arena_size()
        );
    }

    #[test]
    fn new_installs_one_free_block() {
        let heap = heap();
        let page = os::page_size();
        assert_eq!(heap.mapped_len(), page);
        assert_eq!(heap.arena_size(), page - 8);
        assert_eq!(heap.heap_start().as_ptr() as usize % page, WORD_BYTES);

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].allocated);
        assert!(blocks[0].prev_allocated);
        assert_eq!(blocks[0].size, heap.arena_size());
        assert_eq!(blocks[0].footer, Some(heap.arena_size()));
        assert_invariants(&heap);
    }

    #[test]
    fn new_rejects_bad_sizes() {
        assert!(matches!(Heap::new(0), Err(HeapError::InvalidArgument(_))));
        assert!(matches!(
            Heap::new(usize::MAX),
            Err(HeapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_rounds_to_pages() {
        let page = os::page_size();
        let heap = Heap::new(page + 1).unwrap();
        assert_eq!(heap.mapped_len(), 2 * page);
        assert_eq!(heap.arena_size(), 2 * page - 8);
    }

    #[test]
    fn scenario_reuses_freed_space() {
        let mut heap = heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(200).unwrap();
        assert!(b > a);
        heap.release(a.as_ptr()).unwrap();

        let c = heap.allocate(50).unwrap();
        assert_eq!(c, a);
        assert_eq!(
            shape(&heap),
            [
                (true, 56),
                (false, 48),
                (true, 208),
                (false, heap.arena_size() - 104 - 208),
            ]
        );
        assert_invariants(&heap);
    }

    #[test]
    fn payloads_are_aligned_and_usable() {
        let mut heap = heap();
        for size in 1..=40 {
            let p = heap.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % 8, 0);
            let usable = heap.usable_size(p).unwrap();
            assert!(usable >= size);
            assert!(usable < size + 8);
            unsafe { p.as_ptr().write_bytes(0xAA, usable) };
        }
        assert_invariants(&heap);
    }

    #[test]
    fn allocated_len_matches_usable_size() {
        let mut heap = heap();
        let ptrs = carve(&mut heap, &[16, 40]);

        // Exact fit into a carved hole.
        let (p, len) = heap.allocate_with_len(36).unwrap();
        assert_eq!(p, ptrs[1]);
        assert_eq!(len, 36);
        assert_eq!(heap.usable_size(p).unwrap(), len);

        // Split off the tail of the arena.
        for size in [1, 7, 13, 100] {
            let (p, len) = heap.allocate_with_len(size).unwrap();
            assert_eq!(heap.usable_size(p).unwrap(), len);
        }
        assert_invariants(&heap);
    }

    #[test]
    fn allocate_rejects_bad_sizes() {
        let mut heap = heap();
        let before = shape(&heap);
        assert!(matches!(
            heap.allocate(0),
            Err(HeapError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.allocate(heap.arena_size()),
            Err(HeapError::OutOfMemory { .. })
        ));
        assert!(matches!(
            heap.allocate(usize::MAX),
            Err(HeapError::OutOfMemory { .. })
        ));
        assert_eq!(shape(&heap), before);
    }

    #[test]
    fn whole_arena_can_be_allocated() {
        let mut heap = heap();
        let p = heap.allocate(heap.arena_size() - WORD_BYTES).unwrap();
        assert_eq!(shape(&heap), [(true, heap.arena_size())]);
        assert!(matches!(
            heap.allocate(1),
            Err(HeapError::OutOfMemory { size: 1 })
        ));
        heap.release(p.as_ptr()).unwrap();
        assert_eq!(shape(&heap), [(false, heap.arena_size())]);
    }

    #[test]
    fn best_fit_takes_exact_match() {
        let mut heap = heap();
        let ptrs = carve(&mut heap, &[16, 40, 24]);
        let p = heap.allocate(20).unwrap();
        assert_eq!(p, ptrs[2]);
        assert_invariants(&heap);
    }

    #[test]
    fn best_fit_takes_tightest_block() {
        let mut heap = heap();
        let ptrs = carve(&mut heap, &[16, 48, 40, 24]);
        let p = heap.allocate(28).unwrap();
        assert_eq!(p, ptrs[2]);
        assert_invariants(&heap);
    }

    #[test]
    fn best_fit_breaks_ties_by_address() {
        let mut heap = heap();
        let ptrs = carve(&mut heap, &[32, 32, 32]);
        assert_eq!(heap.allocate(20).unwrap(), ptrs[0]);
        assert_eq!(heap.allocate(20).unwrap(), ptrs[1]);
        assert_invariants(&heap);
    }

    #[test]
    fn split_leaves_minimum_free_block() {
        let mut heap = heap();
        let ptrs = carve(&mut heap, &[40]);
        let p = heap.allocate(28).unwrap();
        assert_eq!(p, ptrs[0]);

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!((blocks[0].allocated, blocks[0].size), (true, 32));
        assert_eq!((blocks[1].allocated, blocks[1].size), (false, 8));
        assert_eq!(blocks[1].footer, Some(8));
        assert!(!blocks[2].prev_allocated);
        assert_invariants(&heap);
    }

    #[test]
    fn exact_fit_marks_successor() {
        let mut heap = heap();
        carve(&mut heap, &[24]);
        assert!(!heap.blocks().nth(1).unwrap().prev_allocated);
        heap.allocate(20).unwrap();
        assert!(heap.blocks().nth(1).unwrap().prev_allocated);
        assert_invariants(&heap);
    }

    #[test]
    fn split_preserves_predecessor_status() {
        let mut heap = heap();
        let a = heap.allocate(12).unwrap();
        let b = heap.allocate(60).unwrap();
        heap.allocate(1).unwrap();
        heap.release(a.as_ptr()).unwrap();
        heap.release(b.as_ptr()).unwrap();
        // `a` and `b` coalesced into one 80-byte block.
        assert_eq!(shape(&heap)[0], (false, 80));

        let x = heap.allocate(4).unwrap();
        let y = heap.allocate(4).unwrap();
        assert_eq!((x, y), (a, unsafe { a.add(8) }));
        let blocks: Vec<_> = heap.blocks().collect();
        assert!(blocks[0].prev_allocated);
        assert!(blocks[1].prev_allocated);
        assert_invariants(&heap);
    }

    #[test]
    fn release_coalesces_three_blocks() {
        let mut heap = heap();
        let x = heap.allocate(12).unwrap();
        let y = heap.allocate(20).unwrap();
        let z = heap.allocate(28).unwrap();
        let guard = heap.allocate(1).unwrap();

        heap.release(x.as_ptr()).unwrap();
        heap.release(z.as_ptr()).unwrap();
        assert_eq!(
            &shape(&heap)[..4],
            [(false, 16), (true, 24), (false, 32), (true, 8)]
        );

        heap.release(y.as_ptr()).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!((blocks[0].allocated, blocks[0].size), (false, 16 + 24 + 32));
        assert_eq!(blocks[0].footer, Some(72));
        assert!(blocks[0].prev_allocated);
        assert!(blocks[1].allocated);
        assert!(!blocks[1].prev_allocated);
        assert_invariants(&heap);

        heap.release(guard.as_ptr()).unwrap();
        assert_eq!(shape(&heap), [(false, heap.arena_size())]);
    }

    #[test]
    fn release_coalesces_forward_into_tail() {
        let mut heap = heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        heap.release(b.as_ptr()).unwrap();
        assert_eq!(
            shape(&heap),
            [(true, 104), (false, heap.arena_size() - 104)]
        );
        heap.release(a.as_ptr()).unwrap();
        assert_eq!(shape(&heap), [(false, heap.arena_size())]);
    }

    #[test]
    fn allocate_then_release_round_trips() {
        let mut heap = heap();
        heap.allocate(64).unwrap();
        carve(&mut heap, &[48, 16]);
        let before: Vec<_> = heap.blocks().collect();
        let stats = heap.stats();

        for size in [1, 7, 8, 12, 40, 44, 100, 3000] {
            let p = heap.allocate(size).unwrap();
            heap.release(p.as_ptr()).unwrap();
            assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
            assert_eq!(heap.stats(), stats);
        }
    }

    #[test]
    fn double_free_is_detected() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        heap.allocate(16).unwrap();
        heap.release(a.as_ptr()).unwrap();

        let before: Vec<_> = heap.blocks().collect();
        assert!(matches!(
            heap.release(a.as_ptr()),
            Err(HeapError::DoubleFree { .. })
        ));
        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
    }

    #[test]
    fn release_rejects_bad_pointers() {
        let mut heap = heap();
        let a = heap.allocate(32).unwrap();
        let before: Vec<_> = heap.blocks().collect();

        assert!(matches!(
            heap.release(core::ptr::null_mut()),
            Err(HeapError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.release(unsafe { a.as_ptr().add(1) }),
            Err(HeapError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.release(unsafe { a.as_ptr().add(8) }),
            Err(HeapError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.release(unsafe { a.as_ptr().sub(8) }),
            Err(HeapError::OutOfRange { .. })
        ));
        let end = heap.heap_start().as_ptr() as usize + heap.arena_size();
        let past_end = (end + 8 - end % 8) as *mut u8;
        assert!(matches!(
            heap.release(past_end),
            Err(HeapError::OutOfRange { .. })
        ));

        let mut local = 0u64;
        assert!(matches!(
            heap.release(core::ptr::addr_of_mut!(local).cast()),
            Err(HeapError::OutOfRange { .. })
        ));

        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
        heap.release(a.as_ptr()).unwrap();
    }

    #[test]
    fn out_of_memory_when_nothing_fits() {
        let mut heap = heap();
        let ptrs = carve(&mut heap, &[64, 64]);
        let rest = heap.blocks().last().unwrap().size;
        heap.allocate(rest - WORD_BYTES).unwrap();

        let before: Vec<_> = heap.blocks().collect();
        assert!(matches!(
            heap.allocate(61),
            Err(HeapError::OutOfMemory { size: 61 })
        ));
        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
        assert_eq!(heap.allocate(60).unwrap(), ptrs[0]);
    }

    #[test]
    fn stats_cover_the_arena() {
        let mut heap = heap();
        heap.allocate(100).unwrap();
        let b = heap.allocate(200).unwrap();
        heap.allocate(300).unwrap();
        heap.release(b.as_ptr()).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.used, 104 + 304);
        assert_eq!(stats.free, heap.arena_size() - stats.used);
        assert_eq!(stats.total, heap.arena_size());
        assert_eq!(stats.allocated_blocks, 2);
        assert_eq!(stats.free_blocks, 2);
    }
}
