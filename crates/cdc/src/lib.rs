//! Content-defined chunking (CDC).
//!
//! Overview
//! - A cyclic-polynomial rolling hash slides a fixed 48-byte window over the
//!   input; a chunk boundary is declared where the low bits of the hash are
//!   zero, subject to minimum and maximum chunk sizes.
//! - Boundaries depend only on the bytes near them: editing a region of the
//!   input moves at most a few boundaries, so unmodified regions keep their
//!   chunks and deduplicate against earlier versions.
//! - Determinism: the per-byte mixing table is derived from SHA-256 under a
//!   fixed label, and all parameters are frozen at construction. The same
//!   bytes and configuration always produce the same boundaries.
//!
//! Two splitters are provided: [`Chunker`] cuts a byte slice into chunks, and
//! [`RecordChunker`] groups a sequence of variable-length records, emitting
//! boundaries only at record ends while still judging the rolling hash over
//! the record bytes. The latter is what makes multi-level chunking of
//! serialized child lists dedupe across small insertions.

#![deny(unsafe_code)]

use std::ops::Range;

use once_cell::sync::Lazy;
use sha2::digest::{FixedOutput as ShaFixedOutput, Update as ShaUpdate};

/// Rolling-hash window width in bytes.
pub const WINDOW_SIZE: usize = 48;

/// Smallest acceptable average chunk size.
pub const AVERAGE_MIN: u32 = 256;
/// Largest acceptable average chunk size.
pub const AVERAGE_MAX: u32 = 4 * 1024 * 1024;

const TABLE_LABEL: &[u8] = b"cdc mixing table v1";

// Per-byte mixing values, eight bytes of SHA-256(label || byte) each. Derived
// rather than pasted so the table and its provenance stay in sync.
static MIX: Lazy<[u64; 256]> = Lazy::new(|| {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut h = sha2::Sha256::default();
        ShaUpdate::update(&mut h, TABLE_LABEL);
        ShaUpdate::update(&mut h, &[i as u8]);
        let out = ShaFixedOutput::finalize_fixed(h);
        let mut word = [0u8; 8];
        word.copy_from_slice(&out[..8]);
        *slot = u64::from_be_bytes(word);
    }
    table
});

/// A chunk of the input, as an offset/length pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// Byte offset of the chunk within the input.
    pub offset: usize,
    /// Chunk length in bytes.
    pub len: usize,
}

/// Splitter configuration: min = avg/4, max = avg*4, and a boundary mask of
/// the low log2(avg) hash bits. The maximum-size rule dominates the mask rule.
#[derive(Clone, Copy, Debug)]
pub struct Chunker {
    min_size: usize,
    max_size: usize,
    mask: u64,
}

impl Chunker {
    /// Create a splitter targeting the given average chunk size.
    ///
    /// # Panics
    ///
    /// Panics if `avg_size` lies outside [`AVERAGE_MIN`]..=[`AVERAGE_MAX`].
    pub fn new(avg_size: u32) -> Self {
        assert!(
            (AVERAGE_MIN..=AVERAGE_MAX).contains(&avg_size),
            "average chunk size {avg_size} out of range"
        );
        Self {
            min_size: (avg_size / 4) as usize,
            max_size: (avg_size as usize) * 4,
            mask: (1u64 << avg_size.ilog2()) - 1,
        }
    }

    /// Minimum chunk size in bytes.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Maximum chunk size in bytes.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Lazily split `data` into chunks in input order. Empty input yields no
    /// chunks; every chunk except possibly the last is at least `min_size`
    /// bytes, and no chunk exceeds `max_size`.
    pub fn split<'a>(&self, data: &'a [u8]) -> Chunks<'a> {
        Chunks { chunker: *self, data, offset: 0 }
    }

    // Length of the chunk starting at data[0]. The window is primed so the
    // first judgement at min_size sees exactly WINDOW_SIZE bytes.
    fn cut(&self, data: &[u8]) -> usize {
        if data.len() <= self.min_size {
            return data.len();
        }
        let bound = data.len().min(self.max_size);
        let first = self.min_size - WINDOW_SIZE;
        let mut hash = 0u64;
        for i in first..bound {
            hash = hash.rotate_left(1) ^ MIX[data[i] as usize];
            if i >= first + WINDOW_SIZE {
                hash ^= MIX[data[i - WINDOW_SIZE] as usize].rotate_left(WINDOW_SIZE as u32);
            }
            if i + 1 >= self.min_size && hash & self.mask == 0 {
                return i + 1;
            }
        }
        bound
    }
}

/// Iterator over the chunks of a byte slice. See [`Chunker::split`].
pub struct Chunks<'a> {
    chunker: Chunker,
    data: &'a [u8],
    offset: usize,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.offset >= self.data.len() {
            return None;
        }
        let len = self.chunker.cut(&self.data[self.offset..]);
        let chunk = Chunk { offset: self.offset, len };
        self.offset += len;
        Some(chunk)
    }
}

/// Record-aligned splitter: groups a sequence of variable-length records,
/// rolling the hash over the record bytes but cutting only at record ends.
///
/// A group always contains at least two records when two or more remain, so
/// repeated application over a shrinking list terminates.
#[derive(Clone, Copy, Debug)]
pub struct RecordChunker {
    params: Chunker,
}

impl RecordChunker {
    /// Create a record splitter targeting the given average group size in
    /// bytes. Panics on the same bounds as [`Chunker::new`].
    pub fn new(avg_size: u32) -> Self {
        Self { params: Chunker::new(avg_size) }
    }

    /// Group `records` into consecutive index ranges. Every record belongs to
    /// exactly one group and order is preserved.
    ///
    /// The hash is judged at every byte, exactly as in [`Chunker`]; a match
    /// mid-record defers the boundary to that record's end.
    pub fn split<R: AsRef<[u8]>>(&self, records: &[R]) -> Vec<Range<usize>> {
        let mut groups = Vec::new();
        let mut start = 0usize;
        let mut matched = false;
        let mut hash = 0u64;
        let mut window = [0u8; WINDOW_SIZE];
        let mut fed = 0usize;
        for (idx, record) in records.iter().enumerate() {
            for &b in record.as_ref() {
                hash = hash.rotate_left(1) ^ MIX[b as usize];
                if fed >= WINDOW_SIZE {
                    let out = window[fed % WINDOW_SIZE];
                    hash ^= MIX[out as usize].rotate_left(WINDOW_SIZE as u32);
                }
                window[fed % WINDOW_SIZE] = b;
                fed += 1;
                if fed >= self.params.min_size && hash & self.params.mask == 0 {
                    matched = true;
                }
            }
            let in_group = idx + 1 - start;
            if in_group >= 2 && (matched || fed >= self.params.max_size) {
                groups.push(start..idx + 1);
                start = idx + 1;
                matched = false;
                hash = 0;
                fed = 0;
            }
        }
        if start < records.len() {
            groups.push(start..records.len());
        }
        groups
    }
}
