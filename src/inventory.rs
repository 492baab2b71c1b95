//! Inventory snapshot side-cache.
//!
//! The objects of the latest inventory fetch (type, id, uuid, name, parent)
//! are duplicated into the arena as one generation and swapped in whole, so
//! readers see either the previous or the new inventory.

use ahash::AHashMap as HashMap;
use serde::Serialize;

use crate::arena::{Block, Footprint};
use crate::error::Result;
use crate::source::InventoryObject;
use crate::strpool::{try_or_release, CacheMem, Release, StrId, StrRef};

const OBJECT_RECORD_SIZE: usize = std::mem::size_of::<SharedObject>();

/// Whole inventory generation copied out for readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventorySnapshot {
    pub generation: u64,
    pub objects: Vec<InventoryObject>,
}

struct SharedObject {
    record: Block,
    kind: StrRef,
    id: StrRef,
    uuid: StrRef,
    name: StrRef,
    parent: Option<StrRef>,
}

impl SharedObject {
    fn create(mem: &mut CacheMem, object: &InventoryObject) -> Result<Self> {
        let record = mem.allocate(OBJECT_RECORD_SIZE)?;
        let kind = try_or_release!(mem.intern(&object.kind), mem, record);
        let id = try_or_release!(mem.intern(&object.id), mem, record, kind);
        let uuid = try_or_release!(mem.intern(&object.uuid), mem, record, kind, id);
        let name = try_or_release!(mem.intern(&object.name), mem, record, kind, id, uuid);
        let parent = try_or_release!(
            mem.intern_opt(object.parent.as_deref()),
            mem,
            record,
            kind,
            id,
            uuid,
            name
        );

        Ok(Self {
            record,
            kind,
            id,
            uuid,
            name,
            parent,
        })
    }

    fn is(&self, mem: &CacheMem, object: &InventoryObject) -> bool {
        mem.get(&self.uuid) == object.uuid
            && mem.get(&self.kind) == object.kind
            && mem.get(&self.id) == object.id
            && mem.get(&self.name) == object.name
            && self.parent.as_ref().map(|p| mem.get(p)) == object.parent.as_deref()
    }

    fn view(&self, mem: &CacheMem) -> InventoryObject {
        InventoryObject {
            kind: mem.get_owned(&self.kind),
            id: mem.get_owned(&self.id),
            uuid: mem.get_owned(&self.uuid),
            name: mem.get_owned(&self.name),
            parent: self.parent.as_ref().map(|p| mem.get_owned(p)),
        }
    }
}

impl Release for SharedObject {
    fn release(self, mem: &mut CacheMem) {
        self.parent.release(mem);
        self.name.release(mem);
        self.uuid.release(mem);
        self.id.release(mem);
        self.kind.release(mem);
        self.record.release(mem);
    }
}

/// Current inventory generation: objects sorted by uuid and indexed by
/// (type, id).
#[derive(Default)]
pub struct InventoryCache {
    objects: Vec<SharedObject>,
    by_object: HashMap<(StrId, StrId), usize>,
    generation: u64,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `objects` describe exactly the current generation.
    pub fn matches(&self, mem: &CacheMem, objects: &[InventoryObject]) -> bool {
        if objects.len() != self.objects.len() {
            return false;
        }
        let mut incoming: Vec<&InventoryObject> = objects.iter().collect();
        incoming.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        incoming
            .iter()
            .zip(&self.objects)
            .all(|(object, shared)| shared.is(mem, object))
    }

    /// Chunks a `replace` with `objects` allocates while the current
    /// generation is still alive, in allocation order.
    pub fn footprint(&self, mem: &CacheMem, objects: &[InventoryObject]) -> Footprint {
        let mut est = mem.estimate();
        for object in objects {
            est.add_block(OBJECT_RECORD_SIZE)
                .add_str(&object.kind)
                .add_str(&object.id)
                .add_str(&object.uuid)
                .add_str(&object.name)
                .add_opt_str(object.parent.as_deref());
        }
        est.finish()
    }

    /// Builds the new generation next to the current one, then swaps it in
    /// and releases the old one. On failure the current generation is left
    /// untouched.
    pub fn replace(&mut self, mem: &mut CacheMem, objects: &[InventoryObject]) -> Result<()> {
        let mut fresh: Vec<SharedObject> = Vec::with_capacity(objects.len());
        for object in objects {
            let shared = try_or_release!(SharedObject::create(mem, object), mem, fresh);
            fresh.push(shared);
        }

        fresh.sort_by(|a, b| mem.get(&a.uuid).cmp(mem.get(&b.uuid)));
        let by_object = fresh
            .iter()
            .enumerate()
            .map(|(index, o)| ((o.kind.id(), o.id.id()), index))
            .collect();

        std::mem::replace(&mut self.objects, fresh).release(mem);
        self.by_object = by_object;
        self.generation += 1;
        Ok(())
    }

    pub fn get_object(&self, mem: &CacheMem, kind: &str, id: &str) -> Option<InventoryObject> {
        let key = (mem.find(kind)?, mem.find(id)?);
        self.by_object
            .get(&key)
            .map(|&index| self.objects[index].view(mem))
    }

    pub fn get_by_uuid(&self, mem: &CacheMem, uuid: &str) -> Option<InventoryObject> {
        self.objects
            .binary_search_by(|o| mem.get(&o.uuid).cmp(uuid))
            .ok()
            .map(|index| self.objects[index].view(mem))
    }

    pub fn snapshot(&self, mem: &CacheMem) -> InventorySnapshot {
        InventorySnapshot {
            generation: self.generation,
            objects: self.objects.iter().map(|o| o.view(mem)).collect(),
        }
    }

    pub fn clear(&mut self, mem: &mut CacheMem) {
        std::mem::take(&mut self.objects).release(mem);
        self.by_object.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(kind: &str, id: &str, uuid: &str, parent: Option<&str>) -> InventoryObject {
        InventoryObject {
            kind: kind.into(),
            id: id.into(),
            uuid: uuid.into(),
            name: format!("{}.example.com", id),
            parent: parent.map(String::from),
        }
    }

    fn inventory() -> Vec<InventoryObject> {
        vec![
            object("HostSystem", "host-1", "uuid-b", Some("domain-c7")),
            object("VirtualMachine", "vm-1", "uuid-c", Some("host-1")),
            object("Datastore", "datastore-1", "uuid-a", None),
        ]
    }

    #[test]
    fn test_lookups_by_object_and_uuid() {
        let mut mem = CacheMem::new(64 * 1024);
        let mut cache = InventoryCache::new();
        cache.replace(&mut mem, &inventory()).unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.generation(), 1);

        let vm = cache.get_object(&mem, "VirtualMachine", "vm-1").unwrap();
        assert_eq!(vm.uuid, "uuid-c");
        assert_eq!(vm.parent.as_deref(), Some("host-1"));
        assert_eq!(vm.name, "vm-1.example.com");

        let ds = cache.get_by_uuid(&mem, "uuid-a").unwrap();
        assert_eq!(ds.id, "datastore-1");
        assert_eq!(ds.parent, None);

        assert!(cache.get_object(&mem, "VirtualMachine", "vm-404").is_none());
        assert!(cache.get_object(&mem, "Datastore", "vm-1").is_none());
        assert!(cache.get_by_uuid(&mem, "uuid-z").is_none());

        let uuids: Vec<String> = cache
            .snapshot(&mem)
            .objects
            .into_iter()
            .map(|o| o.uuid)
            .collect();
        assert_eq!(uuids, vec!["uuid-a", "uuid-b", "uuid-c"]);
    }

    #[test]
    fn test_footprint_matches_allocation() {
        let mut mem = CacheMem::new(64 * 1024);
        let mut cache = InventoryCache::new();

        let required = cache.footprint(&mem, &inventory()).total();
        cache.replace(&mut mem, &inventory()).unwrap();
        assert_eq!(mem.arena().used(), required);

        // The same inventory again shares every string with the live one.
        let again = cache.footprint(&mem, &inventory());
        assert_eq!(again.total(), 3 * crate::arena::required_size(OBJECT_RECORD_SIZE));
    }

    #[test]
    fn test_replace_swaps_and_releases_old_generation() {
        let mut mem = CacheMem::new(64 * 1024);
        let mut cache = InventoryCache::new();
        cache.replace(&mut mem, &inventory()).unwrap();

        let moved = vec![object("VirtualMachine", "vm-1", "uuid-c", Some("host-2"))];
        cache.replace(&mut mem, &moved).unwrap();
        assert_eq!(cache.generation(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_object(&mem, "HostSystem", "host-1").is_none());
        assert_eq!(
            cache
                .get_by_uuid(&mem, "uuid-c")
                .and_then(|o| o.parent)
                .as_deref(),
            Some("host-2")
        );

        let only_moved = CacheMem::new(64 * 1024);
        let expected = InventoryCache::new().footprint(&only_moved, &moved).total();
        assert_eq!(mem.arena().used(), expected);

        assert!(cache.matches(&mem, &moved));
        assert!(!cache.matches(&mem, &inventory()));
        let renamed = vec![object("VirtualMachine", "vm-1", "uuid-c", None)];
        assert!(!cache.matches(&mem, &renamed));

        cache.clear(&mut mem);
        assert_eq!(mem.arena().used(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failed_replace_keeps_current_generation() {
        let mut mem = CacheMem::new(4096);
        let mut cache = InventoryCache::new();
        cache.replace(&mut mem, &inventory()).unwrap();
        let used = mem.arena().used();

        let huge: Vec<InventoryObject> = (0..64)
            .map(|i| object("VirtualMachine", &format!("vm-{}", i), &format!("u-{}", i), None))
            .collect();
        assert!(mem.check_fit(&cache.footprint(&mem, &huge)).is_err());
        assert!(cache.replace(&mut mem, &huge).is_err());

        assert_eq!(mem.arena().used(), used);
        assert_eq!(cache.generation(), 1);
        assert_eq!(
            cache.get_object(&mem, "HostSystem", "host-1").unwrap().uuid,
            "uuid-b"
        );
    }
}
