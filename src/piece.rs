//! Per-piece download state.
//!
//! A [`PieceState`] records which byte ranges of a piece have been
//! downloaded so far, without holding any of the data itself. Adjacent and
//! overlapping ranges are merged as they arrive, so a complete piece is
//! always represented by the single block `(0, piece_len)`.
//!
//! The state serializes to the resume-file entry format
//! `"<number>:<start>-<end>:..."` via [`std::fmt::Display`] and parses back
//! with [`PieceState::parse`]; persisting these entries is the storage
//! owner's responsibility.

use std::fmt;

use thiserror::Error;

use crate::{storage::StorageInfo, PieceIndex};

/// A downloaded byte range within one piece, half-open: `start..end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub start: u32,
    pub end: u32,
}

/// Download state of a single piece.
#[derive(Clone, Debug)]
pub struct PieceState {
    number: PieceIndex,
    len: u32,
    blocks: Vec<Block>,
}

impl PieceState {
    pub fn new(number: PieceIndex, len: u32) -> Self {
        Self {
            number,
            len,
            blocks: Vec::new(),
        }
    }

    /// Creates the state of every piece of a fresh torrent.
    pub fn create_states(info: &StorageInfo) -> Vec<PieceState> {
        (0..info.piece_count)
            .map(|number| PieceState::new(number, info.piece_len(number)))
            .collect()
    }

    pub fn number(&self) -> PieceIndex {
        self.number
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Records a downloaded block, merging it with any adjacent or
    /// overlapping blocks already present.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit within the piece.
    pub fn add_block(&mut self, offset: u32, len: u32) {
        assert!(
            u64::from(offset) + u64::from(len) <= u64::from(self.len),
            "block {}..{} does not fit in piece of {} bytes",
            offset,
            u64::from(offset) + u64::from(len),
            self.len
        );
        if len == 0 {
            return;
        }

        self.blocks.push(Block {
            start: offset,
            end: offset + len,
        });
        self.blocks.sort_unstable_by_key(|b| b.start);

        // single merge pass over the sorted ranges
        let mut merged: Vec<Block> = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.drain(..) {
            match merged.last_mut() {
                Some(last) if block.start <= last.end => {
                    last.end = last.end.max(block.end);
                }
                _ => merged.push(block),
            }
        }
        self.blocks = merged;
    }

    /// The piece is complete when its ranges have collapsed into the single
    /// block spanning the whole piece.
    pub fn is_complete(&self) -> bool {
        self.blocks.len() == 1 && self.blocks[0].start == 0 && self.blocks[0].end == self.len
    }

    /// Marks the piece as verified and complete, replacing all blocks with
    /// the single full-range block.
    pub fn set_complete(&mut self) {
        self.blocks.clear();
        self.blocks.push(Block {
            start: 0,
            end: self.len,
        });
    }

    /// Discards everything downloaded so far, as done after a failed hash
    /// check.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Total bytes covered by the downloaded ranges.
    pub fn bytes_downloaded(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| u64::from(b.end - b.start))
            .sum()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Parses a resume-file entry previously produced by the `Display`
    /// implementation, e.g. `"5:0-16384"`.
    pub fn parse(entry: &str, len: u32) -> Result<Self, ParsePieceError> {
        let mut parts = entry.split(':');
        let number = parts
            .next()
            .ok_or(ParsePieceError)?
            .parse::<PieceIndex>()
            .map_err(|_| ParsePieceError)?;

        let mut state = PieceState::new(number, len);
        for range in parts {
            let (start, end) = range.split_once('-').ok_or(ParsePieceError)?;
            let start = start.parse::<u32>().map_err(|_| ParsePieceError)?;
            let end = end.parse::<u32>().map_err(|_| ParsePieceError)?;
            if end < start || end > len {
                return Err(ParsePieceError);
            }
            state.add_block(start, end - start);
        }
        Ok(state)
    }
}

impl fmt::Display for PieceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number)?;
        for block in &self.blocks {
            write!(f, ":{}-{}", block.start, block.end)?;
        }
        Ok(())
    }
}

/// A resume-file entry could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed piece state entry")]
pub struct ParsePieceError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_merge_adjacent_and_overlapping_blocks() {
        // every pair in both insertion orders
        let cases: &[((u32, u32), (u32, u32), usize)] = &[
            ((0, 100), (100, 100), 1), // adjacent
            ((0, 100), (50, 100), 1),  // overlapping
            ((0, 100), (0, 100), 1),   // identical
            ((0, 100), (200, 100), 2), // disjoint
        ];
        for &((o1, l1), (o2, l2), expected) in cases {
            for order in [[(o1, l1), (o2, l2)], [(o2, l2), (o1, l1)]] {
                let mut piece = PieceState::new(0, 1024);
                for (offset, len) in order {
                    piece.add_block(offset, len);
                }
                assert_eq!(piece.blocks().len(), expected, "case {:?}", order);
                if expected == 1 {
                    let union_start = o1.min(o2);
                    let union_end = (o1 + l1).max(o2 + l2);
                    assert_eq!(
                        piece.blocks()[0],
                        Block {
                            start: union_start,
                            end: union_end
                        }
                    );
                }
            }
        }
    }

    #[test]
    fn should_bridge_a_gap_between_blocks() {
        let mut piece = PieceState::new(0, 48);
        piece.add_block(0, 16);
        piece.add_block(32, 16);
        assert_eq!(piece.blocks().len(), 2);
        piece.add_block(16, 16);
        assert_eq!(piece.blocks().len(), 1);
        assert!(piece.is_complete());
    }

    #[test]
    fn should_be_complete_only_with_the_full_range_block() {
        let mut piece = PieceState::new(0, 32);
        assert!(!piece.is_complete());
        piece.add_block(0, 16);
        assert!(!piece.is_complete());
        piece.add_block(16, 16);
        assert!(piece.is_complete());

        piece.clear();
        assert!(!piece.is_complete());
        assert_eq!(piece.bytes_downloaded(), 0);

        piece.set_complete();
        assert!(piece.is_complete());
        assert_eq!(piece.bytes_downloaded(), 32);
    }

    #[test]
    fn should_round_trip_resume_entries() {
        let mut piece = PieceState::new(5, 0x4000);
        piece.add_block(0, 100);
        piece.add_block(200, 50);
        let entry = piece.to_string();
        assert_eq!(entry, "5:0-100:200-250");

        let parsed = PieceState::parse(&entry, 0x4000).unwrap();
        assert_eq!(parsed.number(), 5);
        assert_eq!(parsed.blocks(), piece.blocks());

        // a piece with no progress serializes to just its number
        let empty = PieceState::new(3, 0x4000);
        assert_eq!(empty.to_string(), "3");
        assert!(PieceState::parse("3", 0x4000).unwrap().is_empty());
    }

    #[test]
    fn should_reject_malformed_resume_entries() {
        assert!(PieceState::parse("", 16).is_err());
        assert!(PieceState::parse("x:0-8", 16).is_err());
        assert!(PieceState::parse("0:8", 16).is_err());
        assert!(PieceState::parse("0:8-4", 16).is_err());
        assert!(PieceState::parse("0:0-32", 16).is_err());
    }
}
