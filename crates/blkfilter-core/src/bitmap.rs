//! Compressible bitmap over the blocks of a device.
//!
//! The bitmap is split into chunks of [`BITS_PER_CHUNK`] bits. Each chunk is
//! either *raw* (a flat array of words) or *RLE* (an ordered list of runs of
//! set bits). Sparse or dense chunks are far smaller as runs; fragmented
//! chunks are smaller raw. Chunks convert between the two as they change.
//!
//! Which chunks are RLE is itself recorded in a smaller [`Bitmap`] with one
//! bit per chunk (`use_rle`). The recursion bottoms out at a bitmap of at most
//! one chunk, which is always raw and has no `use_rle`. Each level divides the
//! bit count by 2^16, so a 64-bit length nests at most [`MAX_DEPTH`] levels.
//!
//! Within a word, bit 0 is the most significant bit, so scanning for the next
//! set or clear bit is a leading-zero count.

use std::fmt;

use tracing::{debug, trace};

use crate::block::BITS_PER_CHUNK;
use crate::error::{FilterError, FilterResult};

const WORD_BITS: u64 = u64::BITS as u64;
const WORDS_PER_CHUNK: usize = (BITS_PER_CHUNK / WORD_BITS) as usize;
const MSB: u64 = 1 << 63;

/// Maximum number of runs in an RLE chunk. A chunk needing more is no
/// smaller than its raw form and is kept raw.
pub const MAX_RUNS: usize = (BITS_PER_CHUNK / 8) as usize / std::mem::size_of::<Run>();

/// Maximum number of nested bitmaps, the outermost included.
pub const MAX_DEPTH: usize = 4;

/// A run of set bits inside an RLE chunk, in chunk-local bit offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// First set bit.
    pub start: u64,
    /// Number of consecutive set bits.
    pub len: u64,
}

impl Run {
    /// One past the last set bit.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Chunk-level failures. `OutOfRange` asks the caller to convert the chunk to
/// raw and retry; it never leaves this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkError {
    OutOfRange,
    NoMemory,
}

#[cfg(test)]
thread_local! {
    /// Number of upcoming chunk allocations to fail.
    static FAIL_ALLOCS: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

#[cfg(test)]
fn alloc_fails() -> bool {
    FAIL_ALLOCS.with(|fails| {
        let left = fails.get();
        fails.set(left.saturating_sub(1));
        left > 0
    })
}

#[cfg(not(test))]
#[inline]
fn alloc_fails() -> bool {
    false
}

/// Reserves room for `additional` more elements of a chunk.
fn reserve<T>(vec: &mut Vec<T>, additional: usize) -> Result<(), ChunkError> {
    if alloc_fails() {
        return Err(ChunkError::NoMemory);
    }
    vec.try_reserve(additional).map_err(|_| ChunkError::NoMemory)
}

/// Mask of bits `[lo, hi)` within one word, `hi <= 64`.
#[inline]
fn word_mask(lo: u64, hi: u64) -> u64 {
    (u64::MAX >> lo) & !u64::MAX.checked_shr(hi as u32).unwrap_or(0)
}

/// Returns the first bit in `[off, max)` equal to `want`, or `max`.
fn scan(words: &[u64], off: u64, max: u64, want: bool) -> u64 {
    if off >= max {
        return max;
    }
    let flip = if want { 0 } else { u64::MAX };
    let last = ((max - 1) / WORD_BITS) as usize;
    let mut i = (off / WORD_BITS) as usize;
    let mut w = (words[i] ^ flip) & (u64::MAX >> (off % WORD_BITS));
    loop {
        if w != 0 {
            return (i as u64 * WORD_BITS + u64::from(w.leading_zeros())).min(max);
        }
        if i == last {
            return max;
        }
        i += 1;
        w = words[i] ^ flip;
    }
}

/// Sets or clears bits `[off, max)`.
fn fill(words: &mut [u64], off: u64, max: u64, value: bool) {
    let mut bit = off;
    while bit < max {
        let i = (bit / WORD_BITS) as usize;
        let base = i as u64 * WORD_BITS;
        let hi = (max - base).min(WORD_BITS);
        let mask = word_mask(bit - base, hi);
        if value {
            words[i] |= mask;
        } else {
            words[i] &= !mask;
        }
        bit = base + hi;
    }
}

struct RawChunk {
    words: Box<[u64]>,
}

impl RawChunk {
    fn zeroed() -> Result<Self, ChunkError> {
        let mut words = Vec::new();
        reserve(&mut words, WORDS_PER_CHUNK)?;
        words.resize(WORDS_PER_CHUNK, 0);
        Ok(Self {
            words: words.into_boxed_slice(),
        })
    }

    fn from_runs(runs: &[Run]) -> Result<Self, ChunkError> {
        let mut raw = Self::zeroed()?;
        for run in runs {
            fill(&mut raw.words, run.start, run.end(), true);
        }
        Ok(raw)
    }

    fn get(&self, bitoff: &mut u64, bitmax: u64) -> bool {
        *bitoff = scan(&self.words, *bitoff, bitmax, false);
        *bitoff == bitmax
    }

    fn set(&mut self, bitoff: u64) {
        self.words[(bitoff / WORD_BITS) as usize] |= MSB >> (bitoff % WORD_BITS);
    }

    fn clr(&mut self, bitoff: u64, bitmax: u64) {
        fill(&mut self.words, bitoff, bitmax, false);
    }

    /// Number of runs this chunk would need as RLE.
    fn run_count(&self) -> usize {
        let mut carry = 0u64;
        let mut count = 0usize;
        for &w in self.words.iter() {
            let prev = (w >> 1) | (carry << 63);
            count += (w & !prev).count_ones() as usize;
            carry = w & 1;
        }
        count
    }

    fn is_compressible(&self) -> bool {
        self.run_count() < MAX_RUNS
    }

    fn to_runs(&self) -> Result<Vec<Run>, ChunkError> {
        let mut runs = Vec::new();
        let mut bit = 0;
        loop {
            let start = scan(&self.words, bit, BITS_PER_CHUNK, true);
            if start == BITS_PER_CHUNK {
                return Ok(runs);
            }
            let end = scan(&self.words, start, BITS_PER_CHUNK, false);
            if runs.len() >= MAX_RUNS {
                return Err(ChunkError::OutOfRange);
            }
            reserve(&mut runs, 1)?;
            runs.push(Run {
                start,
                len: end - start,
            });
            bit = end;
        }
    }
}

#[derive(Default)]
struct RleChunk {
    runs: Vec<Run>,
}

impl RleChunk {
    /// Inserts a run at `idx`, failing before any mutation.
    fn insert(&mut self, idx: usize, run: Run) -> Result<(), ChunkError> {
        if self.runs.len() >= MAX_RUNS {
            return Err(ChunkError::OutOfRange);
        }
        reserve(&mut self.runs, 1)?;
        self.runs.insert(idx, run);
        Ok(())
    }

    fn get(&self, bitoff: &mut u64, bitmax: u64) -> bool {
        let idx = self.runs.partition_point(|r| r.end() <= *bitoff);
        if let Some(run) = self.runs.get(idx) {
            if run.start <= *bitoff {
                *bitoff = run.end().min(bitmax);
            }
        }
        *bitoff == bitmax
    }

    fn set(&mut self, bitoff: u64) -> Result<(), ChunkError> {
        // First run that ends at or after the bit.
        let idx = self.runs.partition_point(|r| r.end() < bitoff);
        match self.runs.get(idx).copied() {
            Some(run) if run.start <= bitoff && bitoff < run.end() => Ok(()),
            Some(run) if run.end() == bitoff => {
                self.runs[idx].len += 1;
                if let Some(next) = self.runs.get(idx + 1).copied() {
                    if next.start == bitoff + 1 {
                        self.runs[idx].len += next.len;
                        self.runs.remove(idx + 1);
                    }
                }
                Ok(())
            }
            Some(run) if run.start == bitoff + 1 => {
                self.runs[idx].start = bitoff;
                self.runs[idx].len += 1;
                Ok(())
            }
            _ => self.insert(idx, Run { start: bitoff, len: 1 }),
        }
    }

    fn clr(&mut self, bitoff: u64, bitmax: u64) -> Result<(), ChunkError> {
        let idx = self.runs.partition_point(|r| r.end() <= bitoff);
        let first = match self.runs.get(idx).copied() {
            Some(run) if run.start < bitmax => run,
            _ => return Ok(()),
        };
        if first.start < bitoff && first.end() > bitmax {
            // The cleared range splits one run in two.
            self.insert(
                idx + 1,
                Run {
                    start: bitmax,
                    len: first.end() - bitmax,
                },
            )?;
            self.runs[idx].len = bitoff - first.start;
            return Ok(());
        }
        let mut lo = idx;
        if first.start < bitoff {
            self.runs[idx].len = bitoff - first.start;
            lo += 1;
        }
        let hi = self.runs.partition_point(|r| r.end() <= bitmax);
        self.runs.drain(lo..hi);
        if let Some(run) = self.runs.get_mut(lo) {
            if run.start < bitmax {
                let end = run.end();
                run.start = bitmax;
                run.len = end - bitmax;
            }
        }
        Ok(())
    }
}

enum Chunk {
    Raw(RawChunk),
    Rle(RleChunk),
}

/// A bitmap of compressible chunks.
pub struct Bitmap {
    bitlen: u64,
    chunks: Vec<Chunk>,
    use_rle: Option<Box<Bitmap>>,
}

impl Bitmap {
    /// Creates a bitmap of `bitlen` clear bits. Every chunk starts as an
    /// empty RLE chunk, except in a single-chunk bitmap, which is raw.
    pub fn new(bitlen: u64) -> FilterResult<Self> {
        if bitlen == 0 {
            return Err(FilterError::invalid("bitmap length is zero"));
        }
        let count = (bitlen - 1) / BITS_PER_CHUNK + 1;
        if count == 1 {
            let raw = RawChunk::zeroed().map_err(|_| FilterError::NoMemory)?;
            return Ok(Self {
                bitlen,
                chunks: vec![Chunk::Raw(raw)],
                use_rle: None,
            });
        }
        let mut use_rle = Bitmap::new(count)?;
        for chunk in 0..count {
            use_rle.set(chunk)?;
        }
        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(count as usize)
            .map_err(|_| FilterError::NoMemory)?;
        chunks.extend((0..count).map(|_| Chunk::Rle(RleChunk::default())));
        let bitmap = Self {
            bitlen,
            chunks,
            use_rle: Some(Box::new(use_rle)),
        };
        debug_assert!(bitmap.depth() <= MAX_DEPTH);
        trace!(bitlen, chunks = count, "created bitmap");
        Ok(bitmap)
    }

    /// Number of bits.
    pub fn len(&self) -> u64 {
        self.bitlen
    }

    /// Always false; a bitmap has at least one bit.
    pub fn is_empty(&self) -> bool {
        self.bitlen == 0
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Number of chunks currently held as runs.
    pub fn rle_chunk_count(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| matches!(c, Chunk::Rle(_)))
            .count() as u64
    }

    /// Number of nested bitmaps, this one included.
    pub fn depth(&self) -> usize {
        1 + self.use_rle.as_ref().map_or(0, |m| m.depth())
    }

    /// True if `chunk` is held as runs.
    pub fn is_chunk_rle(&self, chunk: u64) -> bool {
        self.use_rle.as_ref().is_some_and(|m| m.is_set(chunk))
    }

    /// The runs of an RLE chunk, or `None` for a raw chunk.
    pub fn runs(&self, chunk: u64) -> Option<&[Run]> {
        match self.chunks.get(chunk as usize)? {
            Chunk::Rle(rle) => Some(&rle.runs),
            Chunk::Raw(_) => None,
        }
    }

    /// True if bit `bitoff` is set.
    pub fn is_set(&self, bitoff: u64) -> bool {
        let mut off = bitoff;
        self.find(&mut off, bitoff.saturating_add(1))
    }

    /// Returns true if every bit in `[bitoff, bitmax)` is set. Otherwise
    /// advances `bitoff` to the first clear bit found and returns false.
    ///
    /// A raw chunk found to be entirely set is collapsed to a single run.
    pub fn get(&mut self, bitoff: &mut u64, bitmax: u64) -> bool {
        let start = *bitoff;
        let result = self.find(bitoff, bitmax);
        if self.use_rle.is_some() && *bitoff > start {
            let first = start.div_ceil(BITS_PER_CHUNK);
            let last = *bitoff / BITS_PER_CHUNK;
            for chunk in first..last {
                if !self.is_chunk_rle(chunk) && self.raw_to_rle(chunk).is_ok() {
                    trace!(chunk, "collapsed full raw chunk");
                }
            }
        }
        result
    }

    /// Sets bit `bitoff`.
    pub fn set(&mut self, bitoff: u64) -> FilterResult<()> {
        if bitoff >= self.bitlen {
            return Err(FilterError::invalid(format!(
                "bit {} out of range for bitmap of {}",
                bitoff, self.bitlen
            )));
        }
        let chunk = bitoff / BITS_PER_CHUNK;
        let local = bitoff % BITS_PER_CHUNK;
        if self.is_chunk_rle(chunk) {
            match self.rle_retry(chunk, |rle| rle.set(local)) {
                Ok(()) => return Ok(()),
                Err(ChunkError::NoMemory) => return Err(FilterError::NoMemory),
                Err(ChunkError::OutOfRange) => self.rle_to_raw(chunk)?,
            }
        }
        if let Chunk::Raw(raw) = &mut self.chunks[chunk as usize] {
            raw.set(local);
        }
        Ok(())
    }

    /// Clears every bit in `[bitoff, bitmax)`.
    pub fn clr(&mut self, bitoff: u64, bitmax: u64) -> FilterResult<()> {
        let end = bitmax.min(self.bitlen);
        let mut bit = bitoff;
        while bit < end {
            let chunk = bit / BITS_PER_CHUNK;
            let base = chunk * BITS_PER_CHUNK;
            let hi = (end - base).min(BITS_PER_CHUNK);
            self.chunk_clr(chunk, bit - base, hi)?;
            bit = base + hi;
        }
        Ok(())
    }

    /// Converts every raw chunk that would be smaller as runs, recursing into
    /// the `use_rle` bitmap first.
    pub fn compress(&mut self) {
        let count = self.chunk_count();
        let Some(use_rle) = self.use_rle.as_mut() else {
            return;
        };
        use_rle.compress();
        let mut converted = 0u64;
        let mut chunk = 0;
        while chunk < count {
            // Skip straight to the next raw chunk.
            let mut next = chunk;
            if self.use_rle.as_ref().is_some_and(|m| m.find(&mut next, count)) {
                break;
            }
            chunk = next;
            let compressible = match &self.chunks[chunk as usize] {
                Chunk::Raw(raw) => raw.is_compressible(),
                Chunk::Rle(_) => false,
            };
            if compressible && self.raw_to_rle(chunk).is_ok() {
                converted += 1;
            }
            chunk += 1;
        }
        if converted > 0 {
            debug!(bitlen = self.bitlen, converted, "compressed bitmap chunks");
        }
    }

    /// Converts `chunk` to raw form if it is held as runs.
    pub fn decompress_chunk(&mut self, chunk: u64) -> FilterResult<()> {
        if chunk >= self.chunk_count() {
            return Err(FilterError::invalid(format!("no chunk {}", chunk)));
        }
        if self.is_chunk_rle(chunk) {
            self.rle_to_raw(chunk)?;
        }
        Ok(())
    }

    /// Converts `chunk` to runs if it is raw and fits the run budget.
    /// Returns whether the chunk is now held as runs.
    pub fn compress_chunk(&mut self, chunk: u64) -> FilterResult<bool> {
        if chunk >= self.chunk_count() {
            return Err(FilterError::invalid(format!("no chunk {}", chunk)));
        }
        match self.raw_to_rle(chunk) {
            Ok(()) => Ok(self.is_chunk_rle(chunk)),
            Err(ChunkError::OutOfRange) => Ok(false),
            Err(ChunkError::NoMemory) => Err(FilterError::NoMemory),
        }
    }

    fn find(&self, bitoff: &mut u64, bitmax: u64) -> bool {
        if *bitoff >= self.bitlen {
            return false;
        }
        if *bitoff >= bitmax {
            return true;
        }
        let end = bitmax.min(self.bitlen);
        while *bitoff < end {
            let chunk = *bitoff / BITS_PER_CHUNK;
            let base = chunk * BITS_PER_CHUNK;
            let hi = (end - base).min(BITS_PER_CHUNK);
            let mut local = *bitoff - base;
            let full = match &self.chunks[chunk as usize] {
                Chunk::Rle(rle) => {
                    debug_assert!(self.is_chunk_rle(chunk));
                    rle.get(&mut local, hi)
                }
                Chunk::Raw(raw) => raw.get(&mut local, hi),
            };
            *bitoff = base + local;
            if !full {
                return false;
            }
        }
        *bitoff == bitmax
    }

    fn chunk_clr(&mut self, chunk: u64, lo: u64, hi: u64) -> FilterResult<()> {
        if self.is_chunk_rle(chunk) {
            match self.rle_retry(chunk, |rle| rle.clr(lo, hi)) {
                Ok(()) => return Ok(()),
                Err(ChunkError::NoMemory) => return Err(FilterError::NoMemory),
                Err(ChunkError::OutOfRange) => self.rle_to_raw(chunk)?,
            }
        } else if lo == 0 && hi == BITS_PER_CHUNK && self.use_rle.is_some() {
            // The whole chunk becomes clear: an empty run list replaces it.
            if let Some(use_rle) = self.use_rle.as_mut() {
                if use_rle.set(chunk).is_ok() {
                    self.chunks[chunk as usize] = Chunk::Rle(RleChunk::default());
                    trace!(chunk, "cleared raw chunk replaced by runs");
                    return Ok(());
                }
            }
        }
        if let Chunk::Raw(raw) = &mut self.chunks[chunk as usize] {
            raw.clr(lo, hi);
        }
        Ok(())
    }

    /// Applies `op` to an RLE chunk, compressing once and retrying if it ran
    /// out of memory.
    fn rle_retry<F>(&mut self, chunk: u64, op: F) -> Result<(), ChunkError>
    where
        F: Fn(&mut RleChunk) -> Result<(), ChunkError>,
    {
        let mut retried = false;
        loop {
            let result = match &mut self.chunks[chunk as usize] {
                Chunk::Rle(rle) => op(rle),
                Chunk::Raw(_) => return Err(ChunkError::OutOfRange),
            };
            match result {
                Err(ChunkError::NoMemory) if !retried => {
                    debug!(chunk, "run allocation failed, compressing and retrying");
                    self.compress();
                    retried = true;
                }
                other => return other,
            }
        }
    }

    fn raw_to_rle(&mut self, chunk: u64) -> Result<(), ChunkError> {
        let runs = match &self.chunks[chunk as usize] {
            Chunk::Raw(raw) => raw.to_runs()?,
            Chunk::Rle(_) => return Ok(()),
        };
        let Some(use_rle) = self.use_rle.as_mut() else {
            // A lone chunk always stays raw.
            return Err(ChunkError::OutOfRange);
        };
        use_rle.set(chunk).map_err(|_| ChunkError::NoMemory)?;
        self.chunks[chunk as usize] = Chunk::Rle(RleChunk { runs });
        Ok(())
    }

    fn rle_to_raw(&mut self, chunk: u64) -> FilterResult<()> {
        let runs = match &self.chunks[chunk as usize] {
            Chunk::Rle(rle) => &rle.runs,
            Chunk::Raw(_) => return Ok(()),
        };
        let raw = match RawChunk::from_runs(runs) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(chunk, "raw chunk allocation failed, compressing and retrying");
                self.compress();
                let runs = match &self.chunks[chunk as usize] {
                    Chunk::Rle(rle) => &rle.runs,
                    Chunk::Raw(_) => return Ok(()),
                };
                RawChunk::from_runs(runs).map_err(|_| FilterError::NoMemory)?
            }
        };
        if let Some(use_rle) = self.use_rle.as_mut() {
            use_rle.clr(chunk, chunk + 1)?;
        }
        self.chunks[chunk as usize] = Chunk::Raw(raw);
        trace!(chunk, "expanded chunk to raw");
        Ok(())
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("bitlen", &self.bitlen)
            .field("chunks", &self.chunks.len())
            .field("rle_chunks", &self.rle_chunk_count())
            .field("use_rle", &self.use_rle)
            .finish()
    }
}
