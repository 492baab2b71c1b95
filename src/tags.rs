//! Tag and category side-cache.
//!
//! Tags are collected for every inventory object in private memory, sized,
//! and swapped in as one generation. Readers always see either the previous
//! or the new generation. A failure of a whole refresh sets a cache-wide
//! error that takes precedence over the (retained) entries.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::arena::{Block, Footprint};
use crate::error::{Result, SourceError};
use crate::source::{parse_version, InventoryObject, VsphereSource};
use crate::strpool::{try_or_release, CacheMem, Release, StrId, StrRef};

/// Error served when the endpoint predates the tagging service.
pub const TAGS_UNSUPPORTED: &str = "Tags are not supported in this VMware version";

/// First endpoint version with the tagging service.
pub const MIN_TAGS_VERSION: (u32, u32) = (6, 5);

/// One tag as served to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
}

/// Tags of one object, or the error that prevented reading them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTags {
    pub kind: String,
    pub id: String,
    pub uuid: String,
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reader result: the tags, `None` when the object has no entry, or an
/// error string.
pub type TagLookup = std::result::Result<Option<Vec<Tag>>, String>;

/// Whole tag generation copied out for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagsSnapshot {
    pub generation: u64,
    pub error: Option<String>,
    pub entries: Vec<EntityTags>,
}

/// Whether an endpoint version has the tagging service.
pub fn tags_supported(version: &str) -> bool {
    match parse_version(version) {
        Some((major, minor, _)) => (major, minor) >= MIN_TAGS_VERSION,
        None => false,
    }
}

/// Collects the tags of every object. Each tag id is resolved once and each
/// category id is resolved once per call; per-object failures end up in
/// the object's `error`.
pub fn collect_entity_tags(
    source: &dyn VsphereSource,
    objects: &[InventoryObject],
) -> Vec<EntityTags> {
    let mut tags: HashMap<String, std::result::Result<Tag, String>> = HashMap::new();
    let mut categories: HashMap<String, std::result::Result<String, String>> = HashMap::new();
    let mut collected = Vec::with_capacity(objects.len());

    for object in objects {
        let mut entry = EntityTags {
            kind: object.kind.clone(),
            id: object.id.clone(),
            uuid: object.uuid.clone(),
            tags: Vec::new(),
            error: None,
        };

        match source.fetch_tag_links(&object.kind, &object.id) {
            Ok(tag_ids) => {
                for tag_id in tag_ids {
                    let resolved = tags
                        .entry(tag_id.clone())
                        .or_insert_with(|| resolve_tag(source, &tag_id, &mut categories));
                    match resolved {
                        Ok(tag) => entry.tags.push(tag.clone()),
                        Err(e) => {
                            entry.tags.clear();
                            entry.error = Some(e.clone());
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Cannot get tags of {} \"{}\": {}",
                    object.kind, object.id, e
                );
                entry.error = Some(e.to_string());
            }
        }

        collected.push(entry);
    }

    debug!(
        "Collected tags for {} objects: {} distinct tags, {} categories",
        collected.len(),
        tags.len(),
        categories.len()
    );
    collected
}

fn resolve_tag(
    source: &dyn VsphereSource,
    tag_id: &str,
    categories: &mut HashMap<String, std::result::Result<String, String>>,
) -> std::result::Result<Tag, String> {
    let remote = source.fetch_tag(tag_id).map_err(|e| describe(tag_id, &e))?;
    let category = categories
        .entry(remote.category_id.clone())
        .or_insert_with(|| {
            source
                .fetch_category(&remote.category_id)
                .map_err(|e| describe(&remote.category_id, &e))
        })
        .clone()?;

    Ok(Tag {
        id: remote.id,
        name: remote.name,
        description: remote.description,
        category,
    })
}

fn describe(id: &str, e: &SourceError) -> String {
    format!("Cannot resolve \"{}\": {}", id, e)
}

const ENTRY_RECORD_SIZE: usize = std::mem::size_of::<SharedEntityTags>();
const TAG_RECORD_SIZE: usize = std::mem::size_of::<SharedTag>();

struct SharedTag {
    record: Block,
    id: StrRef,
    name: StrRef,
    description: StrRef,
    category: StrRef,
}

impl SharedTag {
    fn create(mem: &mut CacheMem, tag: &Tag) -> Result<Self> {
        let record = mem.allocate(TAG_RECORD_SIZE)?;
        let id = try_or_release!(mem.intern(&tag.id), mem, record);
        let name = try_or_release!(mem.intern(&tag.name), mem, record, id);
        let description = try_or_release!(mem.intern(&tag.description), mem, record, id, name);
        let category =
            try_or_release!(mem.intern(&tag.category), mem, record, id, name, description);

        Ok(Self {
            record,
            id,
            name,
            description,
            category,
        })
    }

    fn view(&self, mem: &CacheMem) -> Tag {
        Tag {
            id: mem.get_owned(&self.id),
            name: mem.get_owned(&self.name),
            description: mem.get_owned(&self.description),
            category: mem.get_owned(&self.category),
        }
    }
}

impl Release for SharedTag {
    fn release(self, mem: &mut CacheMem) {
        self.category.release(mem);
        self.description.release(mem);
        self.name.release(mem);
        self.id.release(mem);
        self.record.release(mem);
    }
}

struct SharedEntityTags {
    record: Block,
    kind: StrRef,
    id: StrRef,
    uuid: StrRef,
    tags: Vec<SharedTag>,
    error: Option<StrRef>,
}

impl SharedEntityTags {
    fn create(mem: &mut CacheMem, entry: &EntityTags) -> Result<Self> {
        let record = mem.allocate(ENTRY_RECORD_SIZE)?;
        let kind = try_or_release!(mem.intern(&entry.kind), mem, record);
        let id = try_or_release!(mem.intern(&entry.id), mem, record, kind);
        let uuid = try_or_release!(mem.intern(&entry.uuid), mem, record, kind, id);
        let error = try_or_release!(
            mem.intern_opt(entry.error.as_deref()),
            mem,
            record,
            kind,
            id,
            uuid
        );

        let mut shared = Self {
            record,
            kind,
            id,
            uuid,
            tags: Vec::new(),
            error,
        };
        if shared.error.is_some() {
            return Ok(shared);
        }

        shared.tags.reserve(entry.tags.len());
        for tag in &entry.tags {
            let tag = try_or_release!(SharedTag::create(mem, tag), mem, shared);
            shared.tags.push(tag);
        }
        Ok(shared)
    }

    fn lookup(&self, mem: &CacheMem) -> TagLookup {
        match &self.error {
            Some(error) => Err(mem.get_owned(error)),
            None => Ok(Some(self.tags.iter().map(|t| t.view(mem)).collect())),
        }
    }

    fn view(&self, mem: &CacheMem) -> EntityTags {
        EntityTags {
            kind: mem.get_owned(&self.kind),
            id: mem.get_owned(&self.id),
            uuid: mem.get_owned(&self.uuid),
            tags: self.tags.iter().map(|t| t.view(mem)).collect(),
            error: self.error.as_ref().map(|e| mem.get_owned(e)),
        }
    }
}

impl Release for SharedEntityTags {
    fn release(self, mem: &mut CacheMem) {
        self.tags.release(mem);
        self.error.release(mem);
        self.uuid.release(mem);
        self.id.release(mem);
        self.kind.release(mem);
        self.record.release(mem);
    }
}

fn is_kept(entry: &EntityTags) -> bool {
    !entry.tags.is_empty() || entry.error.is_some()
}

/// Current tag generation: entries sorted by uuid and indexed by object.
#[derive(Default)]
pub struct TagCache {
    entries: Vec<SharedEntityTags>,
    by_object: HashMap<(StrId, StrId), usize>,
    error: Option<StrRef>,
    generation: u64,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of generations swapped in so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn error(&self, mem: &CacheMem) -> Option<String> {
        self.error.as_ref().map(|e| mem.get_owned(e))
    }

    /// Exact arena bytes a `replace` with `entries` needs while the current
    /// generation is still alive.
    pub fn required_size(&self, mem: &CacheMem, entries: &[EntityTags]) -> usize {
        self.footprint(mem, entries).total()
    }

    /// Chunks a `replace` with `entries` allocates, in allocation order.
    pub fn footprint(&self, mem: &CacheMem, entries: &[EntityTags]) -> Footprint {
        let mut est = mem.estimate();

        for entry in entries.iter().filter(|e| is_kept(e)) {
            est.add_block(ENTRY_RECORD_SIZE)
                .add_str(&entry.kind)
                .add_str(&entry.id)
                .add_str(&entry.uuid)
                .add_opt_str(entry.error.as_deref());
            if entry.error.is_some() {
                continue;
            }
            for tag in &entry.tags {
                est.add_block(TAG_RECORD_SIZE)
                    .add_str(&tag.id)
                    .add_str(&tag.name)
                    .add_str(&tag.description)
                    .add_str(&tag.category);
            }
        }

        est.finish()
    }

    /// Builds the new generation next to the current one, then swaps it in
    /// and releases the old one. Clears the cache-wide error. On failure the
    /// current generation is left untouched.
    pub fn replace(&mut self, mem: &mut CacheMem, entries: &[EntityTags]) -> Result<()> {
        let mut fresh: Vec<SharedEntityTags> = Vec::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| is_kept(e)) {
            let shared = try_or_release!(SharedEntityTags::create(mem, entry), mem, fresh);
            fresh.push(shared);
        }

        fresh.sort_by(|a, b| mem.get(&a.uuid).cmp(mem.get(&b.uuid)));
        let by_object = fresh
            .iter()
            .enumerate()
            .map(|(index, e)| ((e.kind.id(), e.id.id()), index))
            .collect();

        let old = std::mem::replace(&mut self.entries, fresh);
        old.release(mem);
        self.error.take().release(mem);
        self.by_object = by_object;
        self.generation += 1;
        Ok(())
    }

    /// Sets the cache-wide error; entries are kept.
    pub fn set_error(&mut self, mem: &mut CacheMem, error: &str) -> Result<()> {
        let fresh = mem.intern(error)?;
        self.error.replace(fresh).release(mem);
        Ok(())
    }

    pub fn get_entity_tags(&self, mem: &CacheMem, kind: &str, id: &str) -> TagLookup {
        if let Some(error) = &self.error {
            return Err(mem.get_owned(error));
        }
        let (Some(kind), Some(id)) = (mem.find(kind), mem.find(id)) else {
            return Ok(None);
        };
        match self.by_object.get(&(kind, id)) {
            Some(&index) => self.entries[index].lookup(mem),
            None => Ok(None),
        }
    }

    pub fn get_tags_by_uuid(&self, mem: &CacheMem, uuid: &str) -> TagLookup {
        if let Some(error) = &self.error {
            return Err(mem.get_owned(error));
        }
        match self
            .entries
            .binary_search_by(|e| mem.get(&e.uuid).cmp(uuid))
        {
            Ok(index) => self.entries[index].lookup(mem),
            Err(_) => Ok(None),
        }
    }

    pub fn snapshot(&self, mem: &CacheMem) -> TagsSnapshot {
        TagsSnapshot {
            generation: self.generation,
            error: self.error(mem),
            entries: self.entries.iter().map(|e| e.view(mem)).collect(),
        }
    }

    /// Returns every tag record to the arena.
    pub fn clear(&mut self, mem: &mut CacheMem) {
        std::mem::take(&mut self.entries).release(mem);
        self.error.take().release(mem);
        self.by_object.clear();
    }
}
