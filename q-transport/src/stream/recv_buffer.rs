// SPDX-License-Identifier: Apache-2.0

//! Out-of-order byte reassembly for a single stream's receive side
//! (spec §4.2 "Receive path"). Bytes that arrive ahead of the read cursor
//! are buffered as disjoint chunks; `pop()` drains whatever prefix has
//! become contiguous.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct RecvBuffer {
    /// The offset of the next byte the application has not yet been handed.
    cursor: u64,
    /// Disjoint, non-adjacent chunks keyed by start offset, all at or past
    /// `cursor`.
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Inserts `bytes` at `offset`. Overlap with already-buffered or
    /// already-delivered data is silently dropped rather than treated as an
    /// error, matching RFC 9000's "receivers... MUST be able to tolerate
    /// overlapping" guidance.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut start = offset;
        let mut data = bytes;

        // Drop the portion that precedes the read cursor.
        if start < self.cursor {
            let already_delivered = self.cursor - start;
            if already_delivered as usize >= data.len() {
                return;
            }
            data = &data[already_delivered as usize..];
            start = self.cursor;
        }

        let mut end = start + data.len() as u64;
        let mut merged = data.to_vec();

        // Merge with the chunk starting at or before `start`, if it overlaps.
        if let Some((&prev_start, prev_data)) = self.chunks.range(..=start).next_back() {
            let prev_end = prev_start + prev_data.len() as u64;
            if prev_end >= start {
                if prev_end >= end {
                    // fully covered by existing data
                    return;
                }
                let overlap = (prev_end - start) as usize;
                merged = [&prev_data[..], &merged[overlap..]].concat();
                start = prev_start;
                self.chunks.remove(&prev_start);
            }
        }

        // Merge with any chunks that start within [start, end].
        let overlapping: Vec<u64> = self
            .chunks
            .range(start..=end)
            .map(|(&k, _)| k)
            .collect();
        for key in overlapping {
            let next_data = self.chunks.remove(&key).unwrap();
            let next_end = key + next_data.len() as u64;
            if next_end > end {
                let overlap = (end - key) as usize;
                merged.extend_from_slice(&next_data[overlap..]);
                end = next_end;
            }
        }

        self.chunks.insert(start, merged);
    }

    /// `true` if at least one byte is available contiguously from the
    /// cursor.
    pub fn is_readable(&self) -> bool {
        matches!(self.chunks.keys().next(), Some(&start) if start == self.cursor)
    }

    /// Removes and returns the contiguous prefix available at the cursor,
    /// advancing it past what was returned.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let &start = self.chunks.keys().next()?;
        if start != self.cursor {
            return None;
        }
        let data = self.chunks.remove(&start).unwrap();
        self.cursor += data.len() as u64;
        Some(data)
    }

    pub fn highest_received_offset(&self) -> u64 {
        self.chunks
            .iter()
            .map(|(&start, data)| start + data.len() as u64)
            .max()
            .unwrap_or(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_chunks_become_readable_once_contiguous() {
        let mut buf = RecvBuffer::new();
        buf.write_at(4, b"4567");
        assert!(!buf.is_readable());
        buf.write_at(0, b"0123");
        assert!(buf.is_readable());
        assert_eq!(buf.pop().unwrap(), b"01234567");
        assert_eq!(buf.cursor(), 8);
    }

    #[test]
    fn overlapping_retransmit_is_absorbed() {
        let mut buf = RecvBuffer::new();
        buf.write_at(0, b"hello ");
        buf.write_at(3, b"lo world");
        assert_eq!(buf.pop().unwrap(), b"hello world");
    }

    #[test]
    fn bytes_before_cursor_are_dropped() {
        let mut buf = RecvBuffer::new();
        buf.write_at(0, b"abcd");
        buf.pop();
        buf.write_at(0, b"abcd"); // fully stale retransmit
        assert!(!buf.is_readable());
        buf.write_at(2, b"cdef"); // partially stale
        assert_eq!(buf.pop().unwrap(), b"ef");
    }
}
