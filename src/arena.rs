//! Fixed-budget arena backing every cache object.
//!
//! The arena owns one contiguous byte region sized once at startup. Blocks
//! are handed out first-fit from a free list ordered by offset and adjacent
//! free chunks are merged again on release. Each chunk carries
//! [`CHUNK_OVERHEAD`] bytes of bookkeeping (its size, stored in front of and
//! behind the payload) on top of the 8-byte aligned payload, which is exactly
//! what [`required_size`] reports. Callers size a whole write with it before
//! touching the arena, so an allocation failing half way through a build is
//! an allocator fault rather than an expected shortfall.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::error;

use crate::error::{CacheError, Result};

/// Payload alignment in bytes.
pub const ALIGNMENT: usize = 8;

/// Per-chunk bookkeeping: one size word in front of and one behind the payload.
pub const CHUNK_OVERHEAD: usize = 2 * SIZE_FIELD;

const SIZE_FIELD: usize = std::mem::size_of::<u64>();
const MIN_PAYLOAD: usize = 8;

/// Bytes of arena capacity consumed by an allocation of `size` logical bytes.
pub const fn required_size(size: usize) -> usize {
    let payload = if size < MIN_PAYLOAD { MIN_PAYLOAD } else { size };
    align(payload) + CHUNK_OVERHEAD
}

const fn align(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Handle to one allocated chunk. Only the arena creates blocks and a block
/// is consumed when it is released, so a handle can never be freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    offset: usize,
    chunk: usize,
    len: usize,
}

impl Block {
    /// Logical size requested by the owner.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes this block takes out of the arena budget.
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Chunk sizes of a planned write, in the order the write allocates them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    chunks: Vec<usize>,
    total: usize,
}

impl Footprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one allocation of `size` logical bytes.
    pub fn push(&mut self, size: usize) {
        self.push_chunk(required_size(size));
    }

    pub(crate) fn push_chunk(&mut self, chunk: usize) {
        self.chunks.push(chunk);
        self.total += chunk;
    }

    /// Arena bytes of all recorded chunks.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn chunks(&self) -> &[usize] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Point-in-time arena accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    pub capacity: usize,
    pub used: usize,
    pub free: usize,
    pub peak_used: usize,
    pub allocations: usize,
    pub free_chunks: usize,
    pub largest_free_chunk: usize,
}

/// Fixed-capacity allocator over a single byte region.
#[derive(Debug)]
pub struct Arena {
    region: Box<[u8]>,
    /// Free chunks, offset -> chunk size.
    free: BTreeMap<usize, usize>,
    used: usize,
    peak_used: usize,
    allocations: usize,
}

impl Arena {
    /// Creates an arena of `capacity` bytes, rounded down to the alignment.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity & !(ALIGNMENT - 1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }

        Self {
            region: vec![0u8; capacity].into_boxed_slice(),
            free,
            used: 0,
            peak_used: 0,
            allocations: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free_size(&self) -> usize {
        self.capacity() - self.used
    }

    pub fn peak_used(&self) -> usize {
        self.peak_used
    }

    /// Number of live blocks.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn largest_free_chunk(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.capacity(),
            used: self.used,
            free: self.free_size(),
            peak_used: self.peak_used,
            allocations: self.allocations,
            free_chunks: self.free.len(),
            largest_free_chunk: self.largest_free_chunk(),
        }
    }

    /// Allocates a block of `size` logical bytes.
    ///
    /// Fails with `OutOfBudget` when the chunk would exceed the free bytes and
    /// with `Fragmented` when the bytes exist but not contiguously. In both
    /// cases the arena is left unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<Block> {
        let chunk = required_size(size);
        let available = self.free_size();
        if chunk > available {
            return Err(CacheError::OutOfBudget {
                requested: chunk,
                available,
            });
        }

        let (offset, free_len) = self
            .free
            .iter()
            .find(|(_, &len)| len >= chunk)
            .map(|(&offset, &len)| (offset, len))
            .ok_or_else(|| CacheError::Fragmented {
                requested: chunk,
                largest: self.largest_free_chunk(),
            })?;

        self.free.remove(&offset);
        if free_len > chunk {
            self.free.insert(offset + chunk, free_len - chunk);
        }

        self.write_size_fields(offset, chunk);
        self.used += chunk;
        self.peak_used = self.peak_used.max(self.used);
        self.allocations += 1;

        let block = Block {
            offset,
            chunk,
            len: size,
        };
        self.bytes_mut(&block).fill(0);
        Ok(block)
    }

    /// Checks that every chunk of `footprint` can be placed, in order, without
    /// freeing anything first.
    ///
    /// First-fit placement is replayed on a copy of the free list, so the
    /// answer matches what the same sequence of `allocate` calls would do.
    /// Fails with `OutOfBudget` when the total exceeds the free bytes and with
    /// `Fragmented` naming the first chunk that finds no free run.
    pub fn check_fit(&self, footprint: &Footprint) -> Result<()> {
        let available = self.free_size();
        if footprint.total() > available {
            return Err(CacheError::OutOfBudget {
                requested: footprint.total(),
                available,
            });
        }

        let mut runs: Vec<usize> = self.free.values().copied().collect();
        for &chunk in footprint.chunks() {
            match runs.iter_mut().find(|len| **len >= chunk) {
                Some(len) => *len -= chunk,
                None => {
                    return Err(CacheError::Fragmented {
                        requested: chunk,
                        largest: runs.iter().copied().max().unwrap_or(0),
                    })
                }
            }
        }
        Ok(())
    }

    /// Changes the logical size of `block`, keeping its contents up to the
    /// smaller of the two sizes. On failure `block` is left untouched.
    pub fn resize(&mut self, block: &mut Block, new_size: usize) -> Result<()> {
        self.validate(block)?;

        if required_size(new_size) == block.chunk {
            if new_size > block.len {
                let start = block.offset + SIZE_FIELD + block.len;
                self.region[start..start + new_size - block.len].fill(0);
            }
            block.len = new_size;
            return Ok(());
        }

        let fresh = self.allocate(new_size)?;
        let keep = block.len.min(new_size);
        let src = block.offset + SIZE_FIELD;
        self.region
            .copy_within(src..src + keep, fresh.offset + SIZE_FIELD);

        let old = std::mem::replace(block, fresh);
        self.release(old);
        Ok(())
    }

    /// Returns a block's chunk to the free list, merging it with free
    /// neighbours.
    pub fn release(&mut self, block: Block) {
        if let Err(e) = self.validate(&block) {
            error!("Refusing to release block: {}", e);
            return;
        }

        let mut offset = block.offset;
        let mut len = block.chunk;

        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        self.free.insert(offset, len);

        // Clear the size words so a stale handle to this chunk fails validation.
        self.write_size_fields(block.offset, 0);
        self.region[block.offset + block.chunk - SIZE_FIELD..block.offset + block.chunk]
            .fill(0);

        self.used -= block.chunk;
        self.allocations -= 1;
    }

    /// Payload of a block, `len()` bytes long.
    pub fn bytes(&self, block: &Block) -> &[u8] {
        let start = block.offset + SIZE_FIELD;
        &self.region[start..start + block.len]
    }

    pub fn bytes_mut(&mut self, block: &Block) -> &mut [u8] {
        let start = block.offset + SIZE_FIELD;
        &mut self.region[start..start + block.len]
    }

    fn write_size_fields(&mut self, offset: usize, chunk: usize) {
        let word = (chunk as u64).to_le_bytes();
        self.region[offset..offset + SIZE_FIELD].copy_from_slice(&word);
        if chunk >= CHUNK_OVERHEAD {
            let tail = offset + chunk - SIZE_FIELD;
            self.region[tail..tail + SIZE_FIELD].copy_from_slice(&word);
        }
    }

    fn read_size_field(&self, offset: usize) -> Option<usize> {
        let bytes = self.region.get(offset..offset + SIZE_FIELD)?;
        let mut word = [0u8; SIZE_FIELD];
        word.copy_from_slice(bytes);
        Some(u64::from_le_bytes(word) as usize)
    }

    fn validate(&self, block: &Block) -> Result<()> {
        let end = block.offset.checked_add(block.chunk);
        let fits = matches!(end, Some(end) if end <= self.capacity());
        let head = self.read_size_field(block.offset);
        let tail = block
            .offset
            .checked_add(block.chunk)
            .and_then(|end| end.checked_sub(SIZE_FIELD))
            .and_then(|tail| self.read_size_field(tail));

        if fits && head == Some(block.chunk) && tail == Some(block.chunk) {
            Ok(())
        } else {
            Err(CacheError::InvalidHandle {
                offset: block.offset,
            })
        }
    }
}
