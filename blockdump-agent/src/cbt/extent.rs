//! Disk extents, the unit of transfer work.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Contiguous byte range of a virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockExtent {
    pub offset: u64,
    pub length: u64,
}

impl BlockExtent {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True when the two ranges overlap or share a boundary.
    pub fn touches(&self, other: &BlockExtent) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }

    /// Cut the extent down to `[0, capacity)`. `None` if nothing remains.
    pub fn clip_to(&self, capacity: u64) -> Option<BlockExtent> {
        let end = self.end().min(capacity);
        if self.offset >= end {
            None
        } else {
            Some(BlockExtent::new(self.offset, end - self.offset))
        }
    }

    /// Split into consecutive pieces no longer than `max_len`.
    pub fn pieces(&self, max_len: u64) -> Pieces {
        Pieces {
            next: self.offset,
            end: self.end(),
            max_len: max_len.max(1),
        }
    }
}

impl fmt::Display for BlockExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}+{}]", self.offset, self.length)
    }
}

/// Iterator returned by [`BlockExtent::pieces`].
#[derive(Debug, Clone)]
pub struct Pieces {
    next: u64,
    end: u64,
    max_len: u64,
}

impl Iterator for Pieces {
    type Item = BlockExtent;

    fn next(&mut self) -> Option<BlockExtent> {
        if self.next >= self.end {
            return None;
        }
        let length = (self.end - self.next).min(self.max_len);
        let piece = BlockExtent::new(self.next, length);
        self.next += length;
        Some(piece)
    }
}

/// Sort by offset and coalesce overlapping or adjacent extents. Empty extents
/// are dropped.
pub fn merge_extents<I>(extents: I) -> Vec<BlockExtent>
where
    I: IntoIterator<Item = BlockExtent>,
{
    let mut sorted: Vec<BlockExtent> = extents.into_iter().filter(|e| !e.is_empty()).collect();
    sorted.sort_unstable();

    let mut merged: Vec<BlockExtent> = Vec::with_capacity(sorted.len());
    for extent in sorted {
        match merged.last_mut() {
            Some(last) if last.touches(&extent) => {
                let end = last.end().max(extent.end());
                last.length = end - last.offset;
            }
            _ => merged.push(extent),
        }
    }
    merged
}

/// Sum of extent lengths.
pub fn total_length(extents: &[BlockExtent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overlapping_and_adjacent() {
        let merged = merge_extents(vec![
            BlockExtent::new(50, 10),
            BlockExtent::new(0, 10),
            BlockExtent::new(10, 5),
            BlockExtent::new(55, 20),
            BlockExtent::new(100, 0),
            BlockExtent::new(200, 8),
        ]);
        assert_eq!(
            merged,
            vec![
                BlockExtent::new(0, 15),
                BlockExtent::new(50, 25),
                BlockExtent::new(200, 8),
            ]
        );
    }

    #[test]
    fn test_merge_contained_extent() {
        let merged = merge_extents(vec![BlockExtent::new(0, 100), BlockExtent::new(10, 5)]);
        assert_eq!(merged, vec![BlockExtent::new(0, 100)]);
    }

    #[test]
    fn test_merge_keeps_gaps() {
        let merged = merge_extents(vec![BlockExtent::new(0, 10), BlockExtent::new(11, 10)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_clip_to_capacity() {
        assert_eq!(BlockExtent::new(90, 20).clip_to(100), Some(BlockExtent::new(90, 10)));
        assert_eq!(BlockExtent::new(100, 20).clip_to(100), None);
        assert_eq!(BlockExtent::new(0, 10).clip_to(100), Some(BlockExtent::new(0, 10)));
    }

    #[test]
    fn test_pieces_cover_extent() {
        let pieces: Vec<_> = BlockExtent::new(100, 25).pieces(10).collect();
        assert_eq!(
            pieces,
            vec![
                BlockExtent::new(100, 10),
                BlockExtent::new(110, 10),
                BlockExtent::new(120, 5),
            ]
        );
        assert_eq!(BlockExtent::new(0, 0).pieces(10).count(), 0);
        assert_eq!(total_length(&pieces), 25);
    }

    #[test]
    fn test_contains_offset() {
        let extent = BlockExtent::new(10, 10);
        assert!(extent.contains_offset(10));
        assert!(extent.contains_offset(19));
        assert!(!extent.contains_offset(20));
    }
}
