//! Shared fuzzing and testing infrastructure for `region_heap`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use region_heap::{Heap, HeapError};
use std::{collections::BTreeMap, ptr::NonNull};

/// Bytes in a block header.
const HEADER_BYTES: usize = 4;

/// Payload alignment, and the granularity of block sizes.
const BLOCK_ALIGN: usize = 8;

/// The requested payload size of a test allocation.
//
// Note: a plain `u16` would work, but almost every value it can take is far
// larger than the interesting sizes for exercising split and coalesce, so we
// wrap it to give it a mutator that favors small sizes.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Size(pub u16);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: u16,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 512 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                size.0
            } else {
                self.max_size
            };
            size.0 = ctx.rng().gen_index(usize::from(max_size) + 1).unwrap() as u16;
            Ok(())
        })?;

        // Occasionally ask for something huge, to exercise the out-of-memory
        // path.
        if !c.shrink() {
            c.mutation(|_ctx| {
                size.0 = u16::MAX;
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = context
            .rng()
            .gen_index(usize::from(self.max_size) + 1)
            .unwrap();
        Ok(Size(size as u16))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Allocate `size` bytes and remember the result as `id`, releasing
    /// whatever `id` held before.
    Alloc { id: u32, size: Size },
    /// Release the live allocation `id`.
    Release { id: u32 },
    /// Release a pointer that `id` used to hold, which must fail.
    ReleaseStale { id: u32 },
    /// Release a pointer into the middle of live allocation `id`, which must
    /// fail.
    ReleaseInterior { id: u32, offset: u8 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Release {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::ReleaseStale {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::ReleaseInterior {
                    id: ctx.rng().gen_u32(),
                    offset: ctx.rng().gen_u32() as u8,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Release { id }
                    | Op::ReleaseStale { id }
                    | Op::ReleaseInterior { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Release an existing allocation, possibly followed by a bogus release
        // of the same pointer.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, Op::Release { id });
                    if ctx.rng().gen_bool() {
                        ops.ops.insert(release_index + 1, Op::ReleaseStale { id });
                    }
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh heap of `heap_size` bytes.
    pub fn run(&self, heap_size: usize) -> Result<(), String> {
        let heap = Heap::new(heap_size).map_err(|e| format!("cannot create heap: {e}"))?;
        self.run_with_heap(heap)
    }

    /// Run these test operations against the given heap, which must have no
    /// live allocations.
    pub fn run_with_heap(&self, mut heap: Heap) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::default();
        check_heap(&heap, &live)?;
        let initial: Vec<_> = heap.blocks().collect();

        // Pointers that ids used to hold, for stale releases.
        let mut stale: BTreeMap<u32, NonNull<u8>> = BTreeMap::new();

        // The block list just before the most recent allocation, as long as
        // nothing else has touched the heap since.
        let mut before_last_alloc: Option<(u32, Vec<_>)> = None;

        // Fill an allocation with the given byte pattern.
        let fill = |alloc: &LiveAlloc, byte: u8| unsafe {
            alloc.ptr.as_ptr().write_bytes(byte, alloc.usable);
        };

        // Check that nothing has scribbled over a live allocation.
        let check_intact = |id: u32, alloc: &LiveAlloc| -> Result<(), String> {
            let slice = unsafe { core::slice::from_raw_parts(alloc.ptr.as_ptr(), alloc.usable) };
            ensure!(
                slice.iter().all(|b| *b == LIVE_POISON_PATTERN),
                "live allocation id{id} at {:p} was overwritten",
                alloc.ptr,
            );
            Ok(())
        };

        // Release a live allocation, which must succeed.
        let release = |heap: &mut Heap, id: u32, alloc: LiveAlloc| -> Result<(), String> {
            log::debug!("releasing id{id} -> {alloc:?}");
            check_intact(id, &alloc)?;
            fill(&alloc, FREE_POISON_PATTERN);
            heap.release(alloc.ptr.as_ptr())
                .map_err(|e| format!("releasing live allocation id{id} failed: {e}"))
        };

        // Attempt a release that must be rejected without any effect.
        let release_bogus = |heap: &mut Heap, ptr: *mut u8| -> Result<(), String> {
            let before: Vec<_> = heap.blocks().collect();
            let result = heap.release(ptr);
            log::debug!("bogus release of {ptr:p} -> {result:?}");
            ensure!(result.is_err(), "bogus release of {ptr:p} succeeded");
            ensure!(
                heap.blocks().eq(before.iter().copied()),
                "rejected release of {ptr:p} modified the heap",
            );
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size } => {
                    let size = usize::from(size.0);

                    if let Some(old) = live.map.remove(&id) {
                        let ptr = old.ptr;
                        release(&mut heap, id, old)?;
                        stale.insert(id, ptr);
                    }

                    let before: Vec<_> = heap.blocks().collect();
                    let expected = expected_fit(&heap, size);

                    match heap.allocate(size) {
                        Ok(ptr) => {
                            let addr = ptr.as_ptr() as usize;
                            ensure!(size > 0, "zero-sized allocation succeeded");
                            ensure!(
                                addr % BLOCK_ALIGN == 0,
                                "payload {ptr:p} is not {BLOCK_ALIGN}-byte aligned",
                            );
                            ensure!(
                                Some(addr - HEADER_BYTES) == expected,
                                "allocation of {size} bytes did not take the best fit: \
                                 got block {:#x}, expected {expected:#x?}",
                                addr - HEADER_BYTES,
                            );

                            let usable = heap
                                .usable_size(ptr)
                                .map_err(|e| format!("fresh allocation is not live: {e}"))?;
                            ensure!(
                                usable >= size && usable < size + BLOCK_ALIGN,
                                "usable size {usable} does not fit request of {size}",
                            );

                            let alloc = LiveAlloc { ptr, size, usable };
                            log::debug!("new allocation: id{id} -> {alloc:?}");
                            live.assert_not_overlapping(&alloc)?;
                            fill(&alloc, LIVE_POISON_PATTERN);
                            live.map.insert(id, alloc);
                            stale.remove(&id);

                            before_last_alloc = Some((id, before));
                        }
                        Err(HeapError::InvalidArgument(_)) => {
                            ensure!(size == 0, "allocation of {size} bytes was rejected");
                            before_last_alloc = None;
                        }
                        Err(HeapError::OutOfMemory { .. }) => {
                            ensure!(
                                expected.is_none(),
                                "allocation of {size} bytes failed despite a fit at {expected:#x?}",
                            );
                            ensure!(
                                heap.blocks().eq(before.iter().copied()),
                                "failed allocation modified the heap",
                            );
                            before_last_alloc = None;
                        }
                        Err(e) => return Err(format!("unexpected allocation error: {e}")),
                    }
                }

                Op::Release { id } => {
                    if let Some(alloc) = live.map.remove(&id) {
                        let ptr = alloc.ptr;
                        release(&mut heap, id, alloc)?;
                        stale.insert(id, ptr);

                        // Releasing the most recent allocation, with nothing in
                        // between, puts the heap back exactly as it was.
                        if let Some((last_id, before)) = before_last_alloc.take() {
                            if last_id == id {
                                ensure!(
                                    heap.blocks().eq(before.iter().copied()),
                                    "allocate-then-release of id{id} did not round trip",
                                );
                            }
                        }
                    }
                }

                Op::ReleaseStale { id } => {
                    if let Some(&ptr) = stale.get(&id) {
                        // Only bogus if nothing live has been placed there since.
                        if live.map.values().all(|a| a.ptr != ptr) {
                            release_bogus(&mut heap, ptr.as_ptr())?;
                        }
                    }
                }

                Op::ReleaseInterior { id, offset } => {
                    if let Some(alloc) = live.map.get(&id) {
                        let offset = 1 + usize::from(offset) % (alloc.usable - 1);
                        let ptr = unsafe { alloc.ptr.as_ptr().add(offset) };
                        release_bogus(&mut heap, ptr)?;
                    }
                }
            }

            check_heap(&heap, &live)?;
        }

        // Finally, release any remaining live allocations.
        for (id, alloc) in std::mem::take(&mut live.map) {
            release(&mut heap, id, alloc)?;
        }
        check_heap(&heap, &live)?;
        ensure!(
            heap.blocks().eq(initial.iter().copied()),
            "releasing everything did not restore the initial heap",
        );

        Ok(())
    }
}

/// The header address of the block that best fit should choose for a request
/// of `size` bytes, according to a straightforward model over the block list.
fn expected_fit(heap: &Heap, size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    let need = (size + HEADER_BYTES).next_multiple_of(BLOCK_ALIGN);
    heap.blocks()
        .filter(|b| !b.allocated && b.size >= need)
        .min_by_key(|b| b.size)
        .map(|b| b.start)
}

/// Check every structural invariant of the heap, and that its allocated
/// blocks are exactly our live allocations.
fn check_heap(heap: &Heap, live: &LiveMap) -> Result<(), String> {
    let start = heap.heap_start().as_ptr() as usize;
    let mut expected_start = start;
    let mut prev_allocated = true;
    let mut allocated_payloads = Vec::new();

    for block in heap.blocks() {
        let index = block.index;
        ensure!(
            block.start == expected_start,
            "block {index} starts at {:#x}, expected {expected_start:#x}",
            block.start,
        );
        ensure!(
            block.size % BLOCK_ALIGN == 0 && block.size >= 2 * HEADER_BYTES,
            "block {index} has bad size {}",
            block.size,
        );
        ensure!(
            block.end == block.start + block.size - 1,
            "block {index} has a bad end address",
        );
        ensure!(
            block.prev_allocated == prev_allocated,
            "block {index} has a stale prev-allocated bit",
        );

        if block.allocated {
            ensure!(block.footer.is_none(), "allocated block {index} has a footer");
            allocated_payloads.push(block.start + HEADER_BYTES);
        } else {
            ensure!(
                prev_allocated,
                "block {index} and its predecessor are adjacent and both free",
            );
            ensure!(
                block.footer == Some(block.size),
                "free block {index} has footer {:?} but size {}",
                block.footer,
                block.size,
            );
        }

        expected_start += block.size;
        prev_allocated = block.allocated;
    }

    ensure!(
        expected_start == start + heap.arena_size(),
        "blocks end at {expected_start:#x}, not at the end marker",
    );

    let stats = heap.stats();
    ensure!(
        stats.total == heap.arena_size(),
        "block sizes add up to {}, not {}",
        stats.total,
        heap.arena_size(),
    );

    let mut live_payloads: Vec<_> = live
        .map
        .values()
        .map(|a| a.ptr.as_ptr() as usize)
        .collect();
    live_payloads.sort_unstable();
    ensure!(
        allocated_payloads == live_payloads,
        "allocated blocks do not match live allocations",
    );

    Ok(())
}

// We fill live memory with a poison pattern, so that any metadata written into
// a live payload shows up when the allocation is released.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
struct LiveAlloc {
    /// The payload pointer.
    ptr: NonNull<u8>,
    /// Requested size at allocation time.
    size: usize,
    /// Actual usable size of the block.
    usable: usize,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, size, usable } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", size)
            .field("usable", usable)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,
}

impl LiveMap {
    /// Two distinct live allocations should never overlap.
    fn assert_not_overlapping(&self, alloc: &LiveAlloc) -> Result<(), String> {
        let start = alloc.ptr.as_ptr() as usize;
        let end = start + alloc.usable;
        for other in self.map.values() {
            let other_start = other.ptr.as_ptr() as usize;
            let other_end = other_start + other.usable;
            ensure!(
                end <= other_start || other_end <= start,
                "two distinct live allocations should never overlap",
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    const HEAP_SIZE: usize = 1 << 16;

    fn alloc(id: u32, size: u16) -> Op {
        Op::Alloc { id, size: Size(size) }
    }

    fn seed_corpus() -> Vec<Ops> {
        vec![
            // Empty.
            Ops::default(),
            // Simple alloc/release pair.
            Ops::new([alloc(0, 8), Op::Release { id: 0 }]),
            // Zero-sized and oversized requests.
            Ops::new([alloc(0, 0), alloc(1, u16::MAX)]),
            // Reuse of a freed block by best fit.
            Ops::new([
                alloc(0, 100),
                alloc(1, 200),
                Op::Release { id: 0 },
                alloc(2, 50),
            ]),
            // Free the outer two of three blocks, then the middle one.
            Ops::new([
                alloc(0, 12),
                alloc(1, 20),
                alloc(2, 28),
                alloc(3, 1),
                Op::Release { id: 0 },
                Op::Release { id: 2 },
                Op::Release { id: 1 },
            ]),
            // Double release, and release of an interior pointer.
            Ops::new([
                alloc(0, 16),
                alloc(1, 16),
                Op::ReleaseInterior { id: 0, offset: 3 },
                Op::Release { id: 0 },
                Op::ReleaseStale { id: 0 },
            ]),
            // Reallocating an id releases its old block first.
            Ops::new([alloc(0, 40), alloc(0, 16), Op::ReleaseStale { id: 0 }]),
        ]
    }

    #[test]
    fn seed_corpus_passes() {
        let _ = env_logger::try_init();
        for ops in seed_corpus() {
            if let Err(e) = ops.run(HEAP_SIZE) {
                panic!("test failure: {e}: {ops:#?}");
            }
        }
    }

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        match Check::new().iters(10_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus(),
            |ops| ops.run(HEAP_SIZE),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }
}
