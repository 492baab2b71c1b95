//! Refcounted, deduplicated string storage inside the arena.
//!
//! Every string the cache keeps lives exactly once in the arena as
//! `[refcount: u32][bytes]`. Owners hold a move-only [`StrRef`]; taking a
//! second reference goes through the pool (`acquire`) and every reference is
//! handed back through the pool (`release`). The last release returns the
//! block to the arena.
//!
//! [`CacheMem`] pairs the arena with its pool so cache objects can be built
//! and torn down through one context, and [`SizeEstimate`] computes the exact
//! arena bytes a planned write will need.

use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};

use crate::arena::{self, Arena, ArenaStats, Block, Footprint};
use crate::error::Result;

const REFCOUNT_SIZE: usize = std::mem::size_of::<u32>();

/// Stable identity of an interned string, usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrId(u32);

impl StrId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Owned reference to an interned string. Not `Clone`: see [`StringPool::acquire`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "interned strings must be released back to the pool"]
pub struct StrRef {
    slot: u32,
}

impl StrRef {
    pub fn id(&self) -> StrId {
        StrId(self.slot)
    }

    /// Raw slot for storage inside arena records.
    pub(crate) fn into_slot(self) -> u32 {
        self.slot
    }

    /// Rebuilds a reference previously stored with [`StrRef::into_slot`].
    pub(crate) fn from_slot(slot: u32) -> Self {
        Self { slot }
    }
}

struct Entry {
    block: Block,
    hash: u64,
}

/// Content-addressed string pool.
pub struct StringPool {
    entries: Vec<Option<Entry>>,
    vacant: Vec<u32>,
    index: HashMap<u64, Vec<u32>>,
    hasher: RandomState,
    bytes_used: usize,
    live: usize,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            vacant: Vec::new(),
            index: HashMap::new(),
            hasher: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
            bytes_used: 0,
            live: 0,
        }
    }

    /// Number of distinct live strings.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Arena bytes held by the pool, chunk overhead included.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Interns `bytes`: bumps the refcount when the content is already
    /// pooled, otherwise copies it into a fresh arena block.
    pub fn intern(&mut self, arena: &mut Arena, bytes: &[u8]) -> Result<StrRef> {
        let hash = self.hasher.hash_one(bytes);
        if let Some(slot) = self.lookup(arena, hash, bytes) {
            self.adjust_refcount(arena, slot, 1);
            return Ok(StrRef { slot });
        }

        let block = arena.allocate(REFCOUNT_SIZE + bytes.len())?;
        {
            let buf = arena.bytes_mut(&block);
            buf[..REFCOUNT_SIZE].copy_from_slice(&1u32.to_le_bytes());
            buf[REFCOUNT_SIZE..].copy_from_slice(bytes);
        }
        self.bytes_used += block.chunk_size();

        let entry = Some(Entry { block, hash });
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.entries[slot as usize] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as u32
            }
        };
        self.index.entry(hash).or_default().push(slot);
        self.live += 1;

        Ok(StrRef { slot })
    }

    pub fn intern_str(&mut self, arena: &mut Arena, s: &str) -> Result<StrRef> {
        self.intern(arena, s.as_bytes())
    }

    /// Takes another reference to an already interned string.
    pub fn acquire(&mut self, arena: &mut Arena, s: &StrRef) -> StrRef {
        self.adjust_refcount(arena, s.slot, 1);
        StrRef { slot: s.slot }
    }

    /// Drops one reference; the last one frees the arena block.
    pub fn release(&mut self, arena: &mut Arena, s: StrRef) {
        let slot = s.into_slot();
        if self.adjust_refcount(arena, slot, -1) != Some(0) {
            return;
        }

        if let Some(entry) = self.entries.get_mut(slot as usize).and_then(Option::take) {
            if let Some(bucket) = self.index.get_mut(&entry.hash) {
                bucket.retain(|&s| s != slot);
                if bucket.is_empty() {
                    self.index.remove(&entry.hash);
                }
            }
            self.bytes_used -= entry.block.chunk_size();
            self.live -= 1;
            self.vacant.push(slot);
            arena.release(entry.block);
        }
    }

    /// Content of an interned string. Non UTF-8 content reads as empty.
    pub fn get<'a>(&self, arena: &'a Arena, s: &StrRef) -> &'a str {
        std::str::from_utf8(self.get_bytes(arena, s)).unwrap_or("")
    }

    /// Content of a string by identity, empty when it is no longer pooled.
    pub fn resolve<'a>(&self, arena: &'a Arena, id: StrId) -> &'a str {
        match self.entry(id.0) {
            Some(entry) => {
                std::str::from_utf8(&arena.bytes(&entry.block)[REFCOUNT_SIZE..]).unwrap_or("")
            }
            None => "",
        }
    }

    pub fn get_bytes<'a>(&self, arena: &'a Arena, s: &StrRef) -> &'a [u8] {
        match self.entry(s.slot) {
            Some(entry) => &arena.bytes(&entry.block)[REFCOUNT_SIZE..],
            None => &[],
        }
    }

    /// Identity of `bytes` if it is currently interned.
    pub fn find(&self, arena: &Arena, bytes: &[u8]) -> Option<StrId> {
        let hash = self.hasher.hash_one(bytes);
        self.lookup(arena, hash, bytes).map(StrId)
    }

    pub fn refcount(&self, arena: &Arena, s: &StrRef) -> u32 {
        self.entry(s.slot)
            .map(|entry| read_refcount(arena, &entry.block))
            .unwrap_or(0)
    }

    /// Arena bytes interning `bytes` would take: zero when already pooled.
    pub fn required_size(&self, arena: &Arena, bytes: &[u8]) -> usize {
        match self.find(arena, bytes) {
            Some(_) => 0,
            None => chunk_size_for(bytes.len()),
        }
    }

    fn entry(&self, slot: u32) -> Option<&Entry> {
        self.entries.get(slot as usize).and_then(Option::as_ref)
    }

    fn lookup(&self, arena: &Arena, hash: u64, bytes: &[u8]) -> Option<u32> {
        self.index.get(&hash)?.iter().copied().find(|&slot| {
            self.entry(slot)
                .map(|entry| &arena.bytes(&entry.block)[REFCOUNT_SIZE..] == bytes)
                .unwrap_or(false)
        })
    }

    fn adjust_refcount(&mut self, arena: &mut Arena, slot: u32, delta: i64) -> Option<u32> {
        let entry = self.entries.get(slot as usize).and_then(Option::as_ref)?;
        let count = (read_refcount(arena, &entry.block) as i64 + delta).max(0) as u32;
        arena.bytes_mut(&entry.block)[..REFCOUNT_SIZE].copy_from_slice(&count.to_le_bytes());
        Some(count)
    }
}

fn read_refcount(arena: &Arena, block: &Block) -> u32 {
    let mut word = [0u8; REFCOUNT_SIZE];
    word.copy_from_slice(&arena.bytes(block)[..REFCOUNT_SIZE]);
    u32::from_le_bytes(word)
}

fn chunk_size_for(len: usize) -> usize {
    arena::required_size(REFCOUNT_SIZE + len)
}

/// Objects holding arena handles return them through this trait.
pub trait Release {
    fn release(self, mem: &mut CacheMem);
}

impl Release for StrRef {
    fn release(self, mem: &mut CacheMem) {
        mem.strings.release(&mut mem.arena, self);
    }
}

impl Release for Block {
    fn release(self, mem: &mut CacheMem) {
        mem.arena.release(self);
    }
}

impl<T: Release> Release for Option<T> {
    fn release(self, mem: &mut CacheMem) {
        if let Some(inner) = self {
            inner.release(mem);
        }
    }
}

impl<T: Release> Release for Vec<T> {
    fn release(self, mem: &mut CacheMem) {
        for item in self {
            item.release(mem);
        }
    }
}

/// Unwraps a `Result` or, on error, releases the handles acquired so far
/// and returns the error from the enclosing function.
macro_rules! try_or_release {
    ($result:expr, $mem:expr $(, $held:expr)*) => {
        match $result {
            Ok(value) => value,
            Err(e) => {
                $( $crate::strpool::Release::release($held, $mem); )*
                return Err(e.into());
            }
        }
    };
}
pub(crate) use try_or_release;

/// Memory figures reported by diagnostics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MemoryStats {
    #[serde(flatten)]
    pub arena: ArenaStats,
    pub strings: usize,
    pub strpool_bytes: usize,
}

/// The arena together with the string pool that lives in it.
pub struct CacheMem {
    arena: Arena,
    strings: StringPool,
}

impl CacheMem {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::new(capacity),
            strings: StringPool::new(),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn free_size(&self) -> usize {
        self.arena.free_size()
    }

    pub fn check_fit(&self, footprint: &Footprint) -> Result<()> {
        self.arena.check_fit(footprint)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            arena: self.arena.stats(),
            strings: self.strings.len(),
            strpool_bytes: self.strings.bytes_used(),
        }
    }

    pub fn intern(&mut self, s: &str) -> Result<StrRef> {
        self.strings.intern(&mut self.arena, s.as_bytes())
    }

    pub fn intern_opt(&mut self, s: Option<&str>) -> Result<Option<StrRef>> {
        s.map(|s| self.intern(s)).transpose()
    }

    pub fn acquire(&mut self, s: &StrRef) -> StrRef {
        self.strings.acquire(&mut self.arena, s)
    }

    pub fn get(&self, s: &StrRef) -> &str {
        self.strings.get(&self.arena, s)
    }

    pub fn resolve(&self, id: StrId) -> &str {
        self.strings.resolve(&self.arena, id)
    }

    pub fn get_owned(&self, s: &StrRef) -> String {
        self.get(s).to_string()
    }

    pub fn find(&self, s: &str) -> Option<StrId> {
        self.strings.find(&self.arena, s.as_bytes())
    }

    pub fn allocate(&mut self, size: usize) -> Result<Block> {
        self.arena.allocate(size)
    }

    pub fn resize(&mut self, block: &mut Block, new_size: usize) -> Result<()> {
        self.arena.resize(block, new_size)
    }

    pub fn bytes(&self, block: &Block) -> &[u8] {
        self.arena.bytes(block)
    }

    pub fn bytes_mut(&mut self, block: &Block) -> &mut [u8] {
        self.arena.bytes_mut(block)
    }

    /// Starts sizing a write against the current pool contents.
    pub fn estimate<'s>(&self) -> SizeEstimate<'_, 's> {
        SizeEstimate {
            mem: self,
            fresh: HashSet::new(),
            footprint: Footprint::new(),
        }
    }
}

/// Accumulates the exact arena bytes of a planned write. Strings already in
/// the pool cost nothing and a new string is counted once however often the
/// write uses it.
pub struct SizeEstimate<'m, 's> {
    mem: &'m CacheMem,
    fresh: HashSet<&'s str>,
    footprint: Footprint,
}

impl<'m, 's> SizeEstimate<'m, 's> {
    pub fn add_str(&mut self, s: &'s str) -> &mut Self {
        if !self.fresh.contains(s) && self.mem.find(s).is_none() {
            self.fresh.insert(s);
            self.footprint.push_chunk(chunk_size_for(s.len()));
        }
        self
    }

    pub fn add_opt_str(&mut self, s: Option<&'s str>) -> &mut Self {
        if let Some(s) = s {
            self.add_str(s);
        }
        self
    }

    /// Adds one arena block of `size` logical bytes.
    pub fn add_block(&mut self, size: usize) -> &mut Self {
        self.footprint.push(size);
        self
    }

    pub fn total(&self) -> usize {
        self.footprint.total()
    }

    /// The counted chunks in the order they were added.
    pub fn finish(self) -> Footprint {
        self.footprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning() {
        let mut arena = Arena::new(4096);
        let mut pool = StringPool::new();

        let a = pool.intern_str(&mut arena, "host-1").unwrap();
        let b = pool.intern_str(&mut arena, "host-1").unwrap();
        let c = pool.intern_str(&mut arena, "host-2").unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.refcount(&arena, &a), 2);
        assert_eq!(pool.get(&arena, &c), "host-2");
        assert_eq!(arena.allocations(), 2);

        pool.release(&mut arena, a);
        pool.release(&mut arena, b);
        pool.release(&mut arena, c);
        assert!(pool.is_empty());
        assert_eq!(arena.used(), 0);
        assert_eq!(pool.bytes_used(), 0);
    }

    #[test]
    fn test_acquire_and_release_to_zero() {
        let mut arena = Arena::new(4096);
        let mut pool = StringPool::new();

        let first = pool.intern_str(&mut arena, "vm-42").unwrap();
        let second = pool.acquire(&mut arena, &first);
        assert_eq!(pool.refcount(&arena, &first), 2);

        pool.release(&mut arena, first);
        assert_eq!(pool.get(&arena, &second), "vm-42");
        assert_eq!(pool.refcount(&arena, &second), 1);

        pool.release(&mut arena, second);
        assert!(pool.find(&arena, b"vm-42").is_none());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_slot_reuse_keeps_lookup_consistent() {
        let mut arena = Arena::new(4096);
        let mut pool = StringPool::new();

        let a = pool.intern_str(&mut arena, "alpha").unwrap();
        pool.release(&mut arena, a);
        let b = pool.intern_str(&mut arena, "beta").unwrap();
        assert_eq!(pool.get(&arena, &b), "beta");
        assert!(pool.find(&arena, b"alpha").is_none());
        assert_eq!(pool.find(&arena, b"beta"), Some(b.id()));
        pool.release(&mut arena, b);
    }

    #[test]
    fn test_required_size() {
        let mut arena = Arena::new(4096);
        let mut pool = StringPool::new();

        let expected = arena::required_size(REFCOUNT_SIZE + "datastore-7".len());
        assert_eq!(pool.required_size(&arena, b"datastore-7"), expected);

        let s = pool.intern_str(&mut arena, "datastore-7").unwrap();
        assert_eq!(pool.required_size(&arena, b"datastore-7"), 0);
        assert_eq!(arena.used(), expected);
        pool.release(&mut arena, s);
    }

    #[test]
    fn test_intern_out_of_budget() {
        let mut arena = Arena::new(32);
        let mut pool = StringPool::new();

        let err = pool
            .intern_str(&mut arena, "a string far longer than the arena")
            .unwrap_err();
        assert!(err.is_out_of_budget());
        assert!(pool.is_empty());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_size_estimate_counts_new_strings_once() {
        let mut mem = CacheMem::new(4096);
        let known = mem.intern("HostSystem").unwrap();

        let mut est = mem.estimate();
        est.add_str("HostSystem")
            .add_str("host-9")
            .add_str("host-9")
            .add_opt_str(None)
            .add_block(24);

        assert_eq!(
            est.total(),
            chunk_size_for("host-9".len()) + arena::required_size(24)
        );
        known.release(&mut mem);
        assert_eq!(mem.arena().used(), 0);
    }

    #[test]
    fn test_release_trait_for_containers() {
        let mut mem = CacheMem::new(4096);
        let names = vec![mem.intern("a").unwrap(), mem.intern("b").unwrap()];
        let block = Some(mem.allocate(40).unwrap());

        names.release(&mut mem);
        block.release(&mut mem);
        assert_eq!(mem.stats().arena.used, 0);
        assert_eq!(mem.stats().strings, 0);
    }
}
