//! Fixed-capacity circular store of multichannel scans.
//!
//! Storage is a single row-major `Vec<f64>` of `capacity × channels` samples.
//! Positions are tracked with two absolute, never-wrapping counters: `write_idx`
//! (scans produced so far) and `read_idx` (scans consumed so far). The physical
//! row of absolute scan `i` is `i % capacity`.
//!
//! # Invariant
//!
//! `0 <= write_idx - read_idx <= capacity` holds after every public call. Writers
//! are handed at most one contiguous run of rows up to the physical end of
//! storage; readers see wraparound only through [`ScanRing::read_into`], which
//! splits the copy into two contiguous segments when needed.

use tracing::warn;

/// Circular scan buffer with absolute read/write counters.
#[derive(Debug, Clone)]
pub struct ScanRing {
    storage: Vec<f64>,
    channels: usize,
    capacity: usize,
    write_idx: u64,
    read_idx: u64,
}

impl ScanRing {
    /// Create a ring holding `capacity` scans of `channels` samples each.
    pub fn new(capacity: usize, channels: usize) -> Self {
        Self {
            storage: vec![0.0; capacity * channels],
            channels,
            capacity,
            write_idx: 0,
            read_idx: 0,
        }
    }

    /// Capacity in scans.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples per scan.
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Scans produced so far.
    pub fn write_idx(&self) -> u64 {
        self.write_idx
    }

    /// Scans consumed (or discarded) so far.
    pub fn read_idx(&self) -> u64 {
        self.read_idx
    }

    /// Scans written but not yet read.
    pub fn pending(&self) -> u64 {
        self.write_idx - self.read_idx
    }

    /// Scans that can be written without overwriting unread data.
    pub fn free(&self) -> usize {
        self.capacity - self.pending() as usize
    }

    /// Oldest absolute scan index still resident in storage.
    pub fn oldest_resident(&self) -> u64 {
        self.write_idx.saturating_sub(self.capacity as u64)
    }

    /// Let `fill` write directly into storage at the write position.
    ///
    /// The slice handed to `fill` starts at row `write_idx % capacity` and ends
    /// at the physical end of storage or after `max_scans` rows, whichever
    /// comes first; it never spans the wrap boundary. `fill` returns the number
    /// of rows it wrote, which advances `write_idx`.
    ///
    /// Writing here may overwrite unread scans; callers bound `max_scans` by
    /// [`ScanRing::free`] when that matters and call
    /// [`ScanRing::discard_overwritten`] otherwise.
    pub fn fill_with<E, F>(&mut self, max_scans: usize, fill: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [f64]) -> Result<usize, E>,
    {
        if self.capacity == 0 || self.channels == 0 {
            return Ok(0);
        }
        let rel = (self.write_idx % self.capacity as u64) as usize;
        let rows = (self.capacity - rel).min(max_scans);
        if rows == 0 {
            return Ok(0);
        }
        let start = rel * self.channels;
        let end = start + rows * self.channels;
        let written = fill(&mut self.storage[start..end])?.min(rows);
        self.write_idx += written as u64;
        Ok(written)
    }

    /// Advance `read_idx` past scans that have been overwritten.
    ///
    /// Returns the number of scans dropped.
    pub fn discard_overwritten(&mut self) -> u64 {
        let oldest = self.oldest_resident();
        if self.read_idx < oldest {
            let dropped = oldest - self.read_idx;
            self.read_idx = oldest;
            dropped
        } else {
            0
        }
    }

    /// Move the read position to absolute scan `idx`.
    ///
    /// The position is clamped to the resident range
    /// `[write_idx - capacity, write_idx]`; the clamped position is returned.
    pub fn seek_read(&mut self, idx: u64) -> u64 {
        let clamped = idx.clamp(self.oldest_resident(), self.write_idx);
        if clamped != idx {
            warn!(
                requested = idx,
                clamped,
                write_idx = self.write_idx,
                "read position outside resident scans"
            );
        }
        self.read_idx = clamped;
        clamped
    }

    /// Iterate one channel over `len` scans starting at absolute index `start`.
    ///
    /// The scans must be resident.
    pub fn column(&self, start: u64, len: usize, channel: usize) -> impl Iterator<Item = f64> + '_ {
        let capacity = self.capacity as u64;
        let channels = self.channels;
        (start..start + len as u64).map(move |idx| {
            let row = (idx % capacity) as usize;
            self.storage[row * channels + channel]
        })
    }

    /// Copy the next `scans` unread scans into `dst` and advance `read_idx`.
    ///
    /// `scans` is clamped to the unread count and to the rows `dst` can hold.
    /// When the requested range wraps past the physical end of storage the copy
    /// is split into `[i0, capacity)` followed by `[0, i1)`. Returns the number
    /// of scans copied.
    pub fn read_into(&mut self, dst: &mut [f64], scans: usize) -> usize {
        if self.capacity == 0 || self.channels == 0 {
            return 0;
        }
        let n = scans
            .min(self.pending() as usize)
            .min(dst.len() / self.channels);
        if n == 0 {
            return 0;
        }

        let capacity = self.capacity as u64;
        let ch = self.channels;
        let i0 = (self.read_idx % capacity) as usize;
        let mut i1 = ((self.read_idx + n as u64) % capacity) as usize;
        if i1 == 0 {
            i1 = self.capacity;
        }

        if i1 <= i0 {
            let n0 = self.capacity - i0;
            dst[..n0 * ch].copy_from_slice(&self.storage[i0 * ch..]);
            dst[n0 * ch..n * ch].copy_from_slice(&self.storage[..i1 * ch]);
        } else {
            dst[..n * ch].copy_from_slice(&self.storage[i0 * ch..i1 * ch]);
        }

        self.read_idx += n as u64;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    /// Write `rows` scans whose samples encode their absolute index.
    fn produce(ring: &mut ScanRing, rows: usize) -> usize {
        let channels = ring.channel_count();
        let start = ring.write_idx();
        ring.fill_with::<Infallible, _>(rows, |dst| {
            let n = dst.len() / channels;
            for r in 0..n {
                for c in 0..channels {
                    dst[r * channels + c] = ((start + r as u64) * 10 + c as u64) as f64;
                }
            }
            Ok(n)
        })
        .unwrap()
    }

    fn expected(start: u64, rows: usize, channels: usize) -> Vec<f64> {
        (start..start + rows as u64)
            .flat_map(|i| (0..channels).map(move |c| (i * 10 + c as u64) as f64))
            .collect()
    }

    #[test]
    fn test_fill_never_crosses_wrap() {
        let mut ring = ScanRing::new(10, 2);
        assert_eq!(produce(&mut ring, 7), 7);
        ring.read_into(&mut vec![0.0; 14], 7);
        // only three rows remain before the physical end
        assert_eq!(produce(&mut ring, 7), 3);
        assert_eq!(ring.write_idx(), 10);
        assert_eq!(produce(&mut ring, 7), 7);
        assert_eq!(ring.write_idx(), 17);
    }

    #[test]
    fn test_split_read_across_wrap() {
        let mut ring = ScanRing::new(8, 3);
        produce(&mut ring, 6);
        let mut dst = vec![0.0; 6 * 3];
        assert_eq!(ring.read_into(&mut dst, 6), 6);
        produce(&mut ring, 2);
        produce(&mut ring, 4);
        assert_eq!(ring.pending(), 6);

        let mut dst = vec![0.0; 6 * 3];
        assert_eq!(ring.read_into(&mut dst, 6), 6);
        assert_eq!(dst, expected(6, 6, 3));
        assert_eq!(ring.read_idx(), 12);
    }

    #[test]
    fn test_read_ending_exactly_at_wrap() {
        let mut ring = ScanRing::new(4, 1);
        produce(&mut ring, 4);
        let mut dst = vec![0.0; 4];
        // i1 == 0 must be treated as the physical end, not as empty
        assert_eq!(ring.read_into(&mut dst, 4), 4);
        assert_eq!(dst, expected(0, 4, 1));
        assert_eq!(ring.pending(), 0);
    }

    #[test]
    fn test_read_is_clamped() {
        let mut ring = ScanRing::new(16, 2);
        produce(&mut ring, 5);
        let mut small = vec![0.0; 3 * 2];
        assert_eq!(ring.read_into(&mut small, 10), 3);
        let mut big = vec![0.0; 32];
        assert_eq!(ring.read_into(&mut big, 10), 2);
        assert_eq!(ring.read_into(&mut big, 10), 0);
    }

    #[test]
    fn test_fidelity_for_every_wrap_placement() {
        // Drain in every block size against every starting offset; what comes
        // out must be exactly what went in.
        for offset in 0..9 {
            for block in 1..=9 {
                let mut ring = ScanRing::new(9, 2);
                produce(&mut ring, offset);
                let mut skip = vec![0.0; 18];
                ring.read_into(&mut skip, offset);

                let mut out = Vec::new();
                let mut dst = vec![0.0; block * 2];
                while ring.write_idx() < offset as u64 + 40 {
                    let free = ring.free();
                    produce(&mut ring, free.min(block + 1));
                    let n = ring.read_into(&mut dst, block);
                    out.extend_from_slice(&dst[..n * 2]);
                }
                while ring.pending() > 0 {
                    let n = ring.read_into(&mut dst, block);
                    out.extend_from_slice(&dst[..n * 2]);
                }
                let total = ring.write_idx() - offset as u64;
                assert_eq!(
                    out,
                    expected(offset as u64, total as usize, 2),
                    "offset {offset} block {block}"
                );
            }
        }
    }

    #[test]
    fn test_discard_and_seek() {
        let mut ring = ScanRing::new(5, 1);
        for _ in 0..4 {
            produce(&mut ring, 5);
        }
        assert_eq!(ring.write_idx(), 20);
        assert_eq!(ring.discard_overwritten(), 15);
        assert_eq!(ring.read_idx(), 15);

        assert_eq!(ring.seek_read(17), 17);
        let mut dst = vec![0.0; 5];
        assert_eq!(ring.read_into(&mut dst, 5), 3);
        assert_eq!(&dst[..3], &expected(17, 3, 1)[..]);

        // positions that are no longer resident are clamped
        assert_eq!(ring.seek_read(2), 15);
    }

    #[test]
    fn test_column_follows_absolute_index() {
        let mut ring = ScanRing::new(4, 2);
        produce(&mut ring, 4);
        ring.discard_overwritten();
        let mut dst = vec![0.0; 8];
        ring.read_into(&mut dst, 3);
        produce(&mut ring, 3);
        let col: Vec<f64> = ring.column(3, 4, 1).collect();
        assert_eq!(col, vec![31.0, 41.0, 51.0, 61.0]);
    }

    #[test]
    fn test_empty_ring_is_inert() {
        let mut ring = ScanRing::new(0, 2);
        assert_eq!(produce(&mut ring, 10), 0);
        assert_eq!(ring.read_into(&mut [0.0; 4], 2), 0);
    }
}
