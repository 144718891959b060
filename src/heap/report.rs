//! Read-only views of the block sequence.

use core::fmt;

use super::Heap;
use crate::header::Tag;

/// One block, as seen by [`Heap::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Position in the block sequence, starting at zero.
    pub index: usize,
    /// Is this block allocated?
    pub allocated: bool,
    /// Is the block just below this one allocated? Always `true` for the
    /// first block.
    pub prev_allocated: bool,
    /// Address of the block's header.
    pub start: usize,
    /// Address of the block's last byte.
    pub end: usize,
    /// Total size of the block in bytes, header included.
    pub size: usize,
    /// The size recorded in the block's footer. Only free blocks have one.
    pub footer: Option<usize>,
}

/// Iterator over the blocks of a [`Heap`], in address order.
pub struct Blocks<'a> {
    heap: &'a Heap,
    offset: usize,
    index: usize,
}

impl<'a> Blocks<'a> {
    pub(super) fn new(heap: &'a Heap) -> Self {
        Blocks {
            heap,
            offset: 0,
            index: 0,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = match self.heap.tag(self.offset) {
            Tag::End => return None,
            Tag::Block(block) => block,
        };

        let start = self.heap.start.as_ptr() as usize + self.offset;
        let info = BlockInfo {
            index: self.index,
            allocated: block.allocated,
            prev_allocated: block.prev_allocated,
            start,
            end: start + block.size - 1,
            size: block.size,
            footer: (!block.allocated).then(|| self.heap.footer(self.offset, block.size)),
        };

        self.offset += block.size;
        self.index += 1;
        Some(info)
    }
}

/// Byte and block totals over a whole heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes in allocated blocks, headers included.
    pub used: usize,
    /// Bytes in free blocks, headers and footers included.
    pub free: usize,
    /// `used + free`; always the heap's arena size.
    pub total: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
}

impl HeapStats {
    pub(super) fn collect(blocks: impl Iterator<Item = BlockInfo>) -> Self {
        let mut stats = HeapStats::default();
        for block in blocks {
            if block.allocated {
                stats.used += block.size;
                stats.allocated_blocks += 1;
            } else {
                stats.free += block.size;
                stats.free_blocks += 1;
            }
        }
        stats.total = stats.used + stats.free;
        stats
    }
}

/// A tabular listing of every block in a heap, with totals.
///
/// Created by [`Heap::report`].
pub struct Report<'a> {
    heap: &'a Heap,
}

impl<'a> Report<'a> {
    pub(super) fn new(heap: &'a Heap) -> Self {
        Report { heap }
    }
}

const RULE: &str =
    "------------------------------------------------------------------------------";
const BANNER: &str =
    "******************************************************************************";

fn status(allocated: bool) -> &'static str {
    if allocated {
        "alloc"
    } else {
        "FREE"
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{BANNER}")?;
        writeln!(f, "HEAP: block list")?;
        writeln!(
            f,
            "{:<6}{:<8}{:<8}{:<20}{:<20}{:>8}",
            "No.", "Status", "Prev", "Begin", "End", "Size"
        )?;
        writeln!(f, "{RULE}")?;

        for block in self.heap.blocks() {
            writeln!(
                f,
                "{:<6}{:<8}{:<8}{:<20}{:<20}{:>8}",
                block.index + 1,
                status(block.allocated),
                status(block.prev_allocated),
                format!("{:#014x}", block.start),
                format!("{:#014x}", block.end),
                block.size,
            )?;
        }

        let stats = HeapStats::collect(self.heap.blocks());
        writeln!(f, "{RULE}")?;
        writeln!(f, "Total used size = {:>8}", stats.used)?;
        writeln!(f, "Total free size = {:>8}", stats.free)?;
        writeln!(f, "Total size      = {:>8}", stats.total)?;
        writeln!(f, "{BANNER}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_report_addresses() {
        let mut heap = Heap::new(1).unwrap();
        let a = heap.allocate(100).unwrap();
        heap.allocate(200).unwrap();
        heap.release(a.as_ptr()).unwrap();

        let start = heap.heap_start().as_ptr() as usize;
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(
            blocks[0],
            BlockInfo {
                index: 0,
                allocated: false,
                prev_allocated: true,
                start,
                end: start + 103,
                size: 104,
                footer: Some(104),
            }
        );
        assert_eq!(blocks[1].start, start + 104);
        assert!(blocks[1].allocated);
        assert!(!blocks[1].prev_allocated);
        assert_eq!(blocks[1].footer, None);
        assert_eq!(blocks[2].index, 2);
    }

    #[test]
    fn report_lists_every_block() {
        let mut heap = Heap::new(1).unwrap();
        heap.allocate(100).unwrap();
        let text = heap.report().to_string();

        assert!(text.contains("HEAP: block list"));
        let rows: Vec<_> = text
            .lines()
            .filter(|line| line.starts_with('1') || line.starts_with('2'))
            .collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains("alloc"));
        assert!(rows[1].contains("FREE"));
        assert!(text.contains(&format!("Total used size = {:>8}", 104)));
        assert!(text.contains(&format!(
            "Total size      = {:>8}",
            heap.arena_size()
        )));
    }
}
