//! Object table: an arena of generation-checked slots.
//!
//! Lifetime is reference counted. Every value stored in a counted location
//! (operand stack, locals, globals, properties, elements, table entries,
//! undo records) owns one count. Counts reaching zero destroy the object at
//! once and cascade; cycles are left to [`Heap::collect`].

use bitflags::bitflags;
use object::{Body, Object, ObjectId, ObjectSource, PropId, Value, Visitable};

use crate::undo::{Change, UndoLog, UndoRecord, UndoSettings};

/// Slot 0 is never handed out, so `obj#0` is always invalid.
const RESERVED_SLOTS: u32 = 1;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory: all {limit} object ids are in use")]
    OutOfMemory { limit: u32 },
    #[error("invalid object reference {0:?}")]
    InvalidObject(ObjectId),
    #[error("object id {0} is defined more than once")]
    DuplicateObject(u32),
    #[error("{id:?} is not a {expected}")]
    WrongKind { id: ObjectId, expected: &'static str },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of the object id namespace. Allocation beyond it is fatal.
    pub max_objects: u32,
    /// Dynamic allocations between automatic cycle collections.
    pub gc_threshold: usize,
    pub undo: UndoSettings,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            max_objects: 1 << 22,
            gc_threshold: 10_000,
            undo: UndoSettings::default(),
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_objects <= RESERVED_SLOTS {
            return Err("max_objects must leave room for at least one object");
        }
        if self.gc_threshold == 0 {
            return Err("gc_threshold must be > 0");
        }
        if self.undo.max_savepoints == 0 {
            return Err("max_savepoints must be > 0");
        }
        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub(crate) struct SlotFlags: u8 {
        const PERSISTENT = 1 << 0;
        const MARKED = 1 << 1;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) refs: u32,
    pub(crate) flags: SlotFlags,
    pub(crate) object: Option<Object>,
}

/// Object table plus the undo log that records its mutations.
#[derive(Debug)]
pub struct Heap {
    pub(crate) settings: HeapSettings,
    pub(crate) slots: Vec<Slot>,
    pub(crate) free: Vec<u32>,
    pub(crate) live: usize,
    pub(crate) allocated_since_gc: usize,
    pub(crate) undo: UndoLog,
}

impl ObjectSource for Heap {
    fn object(&self, id: ObjectId) -> Option<&Object> {
        self.get(id)
    }
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        let undo = UndoLog::new(settings.undo.clone());
        Self {
            settings,
            slots: vec![Slot::default(); RESERVED_SLOTS as usize],
            free: Vec::new(),
            live: 0,
            allocated_since_gc: 0,
            undo,
        }
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// True once enough objects were allocated that a cycle collection is
    /// due.
    pub fn should_collect(&self) -> bool {
        self.allocated_since_gc >= self.settings.gc_threshold
    }

    // ── Slot access ────────────────────────────────────────────────

    fn slot(&self, id: ObjectId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation && s.object.is_some())
    }

    pub(crate) fn slot_mut(&mut self, id: ObjectId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.object.is_some())
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.slot(id).and_then(|s| s.object.as_ref())
    }

    pub fn deref(&self, id: ObjectId) -> Result<&Object, HeapError> {
        self.get(id).ok_or(HeapError::InvalidObject(id))
    }

    pub(crate) fn object_mut(
        &mut self,
        id: ObjectId,
    ) -> Result<&mut Object, HeapError> {
        self.slot_mut(id)
            .and_then(|s| s.object.as_mut())
            .ok_or(HeapError::InvalidObject(id))
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.slot(id).is_some()
    }

    pub fn is_persistent(&self, id: ObjectId) -> bool {
        self.slot(id)
            .is_some_and(|s| s.flags.contains(SlotFlags::PERSISTENT))
    }

    pub fn ref_count(&self, id: ObjectId) -> Option<u32> {
        self.slot(id).map(|s| s.refs)
    }

    /// Ids of all live objects in slot order.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.object
                .as_ref()
                .map(|_| ObjectId::new(i as u32, s.generation))
        })
    }

    /// First live object after `after` in slot order (or the first one at
    /// all).
    pub fn next_id(&self, after: Option<ObjectId>) -> Option<ObjectId> {
        let start = after.map_or(0, |id| id.index as usize + 1);
        self.slots
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, s)| s.object.is_some())
            .map(|(i, s)| ObjectId::new(i as u32, s.generation))
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Register an object loaded from the image under its image id.
    pub fn define_persistent(
        &mut self,
        image_id: u32,
        object: Object,
    ) -> Result<ObjectId, HeapError> {
        let id = ObjectId::persistent(image_id);
        if image_id < RESERVED_SLOTS {
            return Err(HeapError::InvalidObject(id));
        }
        if image_id >= self.settings.max_objects {
            return Err(HeapError::OutOfMemory {
                limit: self.settings.max_objects,
            });
        }
        let index = image_id as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Slot::default());
        }
        let slot = &mut self.slots[index];
        if slot.object.is_some() {
            return Err(HeapError::DuplicateObject(image_id));
        }
        slot.generation = 0;
        slot.object = Some(object);
        slot.flags = SlotFlags::PERSISTENT;
        slot.refs = 0;
        self.live += 1;
        Ok(id)
    }

    /// Make every unused slot below the high-water mark available to
    /// dynamic allocation. Called once all persistent objects are defined.
    pub fn seal(&mut self) {
        self.free.clear();
        for (i, slot) in self.slots.iter_mut().enumerate().rev() {
            if i < RESERVED_SLOTS as usize || slot.object.is_some() {
                continue;
            }
            // Holes never carry generation 0, which marks image ids.
            if slot.generation == 0 {
                slot.generation = 1;
            }
            self.free.push(i as u32);
        }
    }

    /// Allocate a dynamic object. The returned id carries one count owned
    /// by the caller; values inside `object` are taken over as owned.
    pub fn alloc(&mut self, object: Object) -> Result<ObjectId, HeapError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.slots.len() as u32;
                if index >= self.settings.max_objects {
                    return Err(HeapError::OutOfMemory {
                        limit: self.settings.max_objects,
                    });
                }
                self.slots.push(Slot {
                    generation: 1,
                    ..Slot::default()
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.object = Some(object);
        slot.refs = 1;
        slot.flags = SlotFlags::empty();
        self.live += 1;
        self.allocated_since_gc += 1;
        Ok(ObjectId::new(index, slot.generation))
    }

    pub(crate) fn free_slot(&mut self, index: u32) -> Option<Object> {
        let slot = &mut self.slots[index as usize];
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.refs = 0;
        slot.flags = SlotFlags::empty();
        self.free.push(index);
        self.live -= 1;
        Some(object)
    }

    // ── Reference counting ─────────────────────────────────────────

    pub fn retain(&mut self, id: ObjectId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.refs = slot.refs.saturating_add(1);
        }
    }

    /// Drop one count on `id`. Dynamic objects reaching zero are destroyed
    /// and the references they held are released in turn.
    pub fn release(&mut self, id: ObjectId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(slot) = self.slot_mut(id) else {
                continue;
            };
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs > 0 || slot.flags.contains(SlotFlags::PERSISTENT) {
                continue;
            }
            if let Some(object) = self.free_slot(id.index) {
                log::trace!("freed {id:?} ({})", object.body.kind_name());
                object.visit_edges(&mut |v: Value| {
                    if let Value::Obj(o) = v {
                        work.push(o);
                    }
                });
            }
        }
    }

    #[inline]
    pub fn retain_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.retain(id);
        }
    }

    #[inline]
    pub fn release_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.release(id);
        }
    }

    pub fn release_values(&mut self, values: impl IntoIterator<Item = Value>) {
        for v in values {
            self.release_value(v);
        }
    }

    // ── Mutation ───────────────────────────────────────────────────
    //
    // The only paths that change object state. Each takes ownership of the
    // stored value and logs the prior state when a savepoint is active.

    fn record(&mut self, target: ObjectId, change: Change) {
        if self.undo.is_recording() {
            self.retain(target);
            self.undo.push(UndoRecord { target, change });
        } else {
            let mut held = Vec::new();
            change.visit_values(&mut |v| held.push(v));
            self.release_values(held);
        }
    }

    fn vector_mut(
        &mut self,
        id: ObjectId,
    ) -> Result<&mut Vec<Value>, HeapError> {
        match &mut self.object_mut(id)?.body {
            Body::Vector(items) => Ok(items),
            _ => Err(HeapError::WrongKind {
                id,
                expected: "vector",
            }),
        }
    }

    fn table_mut(
        &mut self,
        id: ObjectId,
    ) -> Result<&mut Vec<(Value, Value)>, HeapError> {
        match &mut self.object_mut(id)?.body {
            Body::LookupTable(entries) => Ok(entries),
            _ => Err(HeapError::WrongKind {
                id,
                expected: "lookup table",
            }),
        }
    }

    pub fn set_prop(
        &mut self,
        id: ObjectId,
        prop: PropId,
        value: Value,
    ) -> Result<(), HeapError> {
        let prior = match &mut self.object_mut(id)?.body {
            Body::Tads(t) => t.props.set(prop, value),
            _ => {
                return Err(HeapError::WrongKind {
                    id,
                    expected: "tads-object",
                });
            }
        };
        self.record(id, Change::Prop { prop, prior });
        Ok(())
    }

    /// Remove an own property. Returns false if it was not defined.
    pub fn remove_prop(
        &mut self,
        id: ObjectId,
        prop: PropId,
    ) -> Result<bool, HeapError> {
        let prior = match &mut self.object_mut(id)?.body {
            Body::Tads(t) => t.props.remove(prop),
            _ => {
                return Err(HeapError::WrongKind {
                    id,
                    expected: "tads-object",
                });
            }
        };
        let Some(prior) = prior else {
            return Ok(false);
        };
        self.record(id, Change::Prop { prop, prior: Some(prior) });
        Ok(true)
    }

    pub fn set_element(
        &mut self,
        id: ObjectId,
        index: usize,
        value: Value,
    ) -> Result<(), HeapError> {
        let items = self.vector_mut(id)?;
        let len = items.len();
        let Some(slot) = items.get_mut(index) else {
            return Err(HeapError::IndexOutOfRange { index, len });
        };
        let prior = std::mem::replace(slot, value);
        self.record(id, Change::Element { index, prior });
        Ok(())
    }

    pub fn insert_element(
        &mut self,
        id: ObjectId,
        index: usize,
        value: Value,
    ) -> Result<(), HeapError> {
        let items = self.vector_mut(id)?;
        if index > items.len() {
            return Err(HeapError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        items.insert(index, value);
        self.record(id, Change::Inserted { index });
        Ok(())
    }

    /// Remove and return an element; the caller owns the returned value.
    pub fn remove_element(
        &mut self,
        id: ObjectId,
        index: usize,
    ) -> Result<Value, HeapError> {
        let items = self.vector_mut(id)?;
        if index >= items.len() {
            return Err(HeapError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        let removed = items.remove(index);
        self.retain_value(removed);
        self.record(id, Change::Removed { index, prior: removed });
        Ok(removed)
    }

    /// Insert or replace a lookup-table entry. Takes ownership of both
    /// `key` and `value`.
    pub fn table_put(
        &mut self,
        id: ObjectId,
        key: Value,
        value: Value,
    ) -> Result<(), HeapError> {
        let entries = self.table_mut(id)?;
        let (index, prior) = match entries.iter().position(|(k, _)| *k == key)
        {
            Some(i) => (i, Some(std::mem::replace(&mut entries[i].1, value))),
            None => {
                entries.push((key, value));
                (entries.len() - 1, None)
            }
        };
        // The change record holds its own count on the key.
        if prior.is_none() {
            self.retain_value(key);
        }
        self.record(id, Change::Entry { index, key, prior });
        Ok(())
    }

    /// Remove a lookup-table entry. `key` is borrowed.
    pub fn table_remove(
        &mut self,
        id: ObjectId,
        key: Value,
    ) -> Result<bool, HeapError> {
        let entries = self.table_mut(id)?;
        let Some(index) = entries.iter().position(|(k, _)| *k == key) else {
            return Ok(false);
        };
        let (key, value) = entries.remove(index);
        self.record(id, Change::EntryRemoved { index, key, value });
        Ok(true)
    }

    // ── Restore support ────────────────────────────────────────────

    /// Drop every object and all undo history. Slot generations move past
    /// every id handed out so far, so ids held elsewhere go stale.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.object.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1).max(1);
            }
            slot.refs = 0;
            slot.flags = SlotFlags::empty();
        }
        self.free.clear();
        self.live = 0;
        self.allocated_since_gc = 0;
        self.undo = UndoLog::new(self.settings.undo.clone());
    }

    /// Whether `id` names a slot an object could be restored into.
    pub fn check_restorable(&self, id: ObjectId) -> Result<(), HeapError> {
        if id.index < RESERVED_SLOTS {
            return Err(HeapError::InvalidObject(id));
        }
        if id.index >= self.settings.max_objects {
            return Err(HeapError::OutOfMemory {
                limit: self.settings.max_objects,
            });
        }
        Ok(())
    }

    /// Put an object back at an exact id, as recorded in a saved state.
    pub fn insert_restored(
        &mut self,
        id: ObjectId,
        object: Object,
        persistent: bool,
    ) -> Result<(), HeapError> {
        self.check_restorable(id)?;
        let index = id.index as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Slot::default());
        }
        let slot = &mut self.slots[index];
        if slot.object.is_some() {
            return Err(HeapError::DuplicateObject(id.index));
        }
        slot.generation = id.generation;
        slot.object = Some(object);
        slot.refs = 0;
        slot.flags = if persistent {
            SlotFlags::PERSISTENT
        } else {
            SlotFlags::empty()
        };
        self.live += 1;
        Ok(())
    }

    /// Recompute every reference count from the object graph, the given
    /// roots and the undo log.
    pub fn rebuild_counts(&mut self, roots: &mut dyn crate::RootProvider) {
        for slot in self.slots.iter_mut() {
            slot.refs = 0;
        }
        let mut edges = Vec::new();
        for slot in &self.slots {
            if let Some(object) = &slot.object {
                object.visit_edges(&mut |v: Value| edges.push(v));
            }
        }
        roots.visit_roots(&mut |v| edges.push(v));
        self.undo.visit_values(&mut |v| edges.push(v));
        for v in edges {
            self.retain_value(v);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use object::{MetaclassId, PropTable, TadsObject};

    use super::*;

    pub(crate) fn tads(props: &[(u16, Value)]) -> Object {
        let mut table = PropTable::new();
        for &(p, v) in props {
            table.set(PropId(p), v);
        }
        Object::new(
            MetaclassId(0),
            Body::Tads(TadsObject {
                superclasses: Vec::new(),
                props: table,
            }),
        )
    }

    fn vector(items: Vec<Value>) -> Object {
        Object::new(MetaclassId(1), Body::Vector(items))
    }

    #[test]
    fn persistent_ids_map_to_slots_and_holes_are_reused() {
        let mut heap = Heap::new(HeapSettings::default());
        let a = heap.define_persistent(3, tads(&[])).unwrap();
        assert_eq!(a, ObjectId::persistent(3));
        assert_eq!(
            heap.define_persistent(3, tads(&[])),
            Err(HeapError::DuplicateObject(3))
        );
        heap.seal();

        let d = heap.alloc(tads(&[])).unwrap();
        assert_eq!(d.index, 1, "lowest hole first");
        assert_ne!(d.generation, 0);
        assert!(heap.is_persistent(a));
        assert!(!heap.is_persistent(d));
    }

    #[test]
    fn zero_is_never_a_valid_object() {
        let mut heap = Heap::new(HeapSettings::default());
        assert!(heap.define_persistent(0, tads(&[])).is_err());
        assert!(heap.get(ObjectId::persistent(0)).is_none());
    }

    #[test]
    fn release_to_zero_cascades() {
        let mut heap = Heap::new(HeapSettings::default());
        let inner = heap.alloc(tads(&[])).unwrap();
        // outer takes over the count owned by `inner`
        let outer = heap.alloc(tads(&[(1, Value::Obj(inner))])).unwrap();
        assert_eq!(heap.live_count(), 2);

        heap.release(outer);
        assert_eq!(heap.live_count(), 0);
        assert!(heap.get(inner).is_none());
    }

    #[test]
    fn stale_ids_are_detected_after_reuse() {
        let mut heap = Heap::new(HeapSettings::default());
        let a = heap.alloc(tads(&[])).unwrap();
        heap.release(a);
        let b = heap.alloc(tads(&[])).unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert_eq!(heap.deref(a), Err(HeapError::InvalidObject(a)));
        assert!(heap.deref(b).is_ok());
    }

    #[test]
    fn namespace_exhaustion_is_out_of_memory() {
        let mut heap = Heap::new(HeapSettings {
            max_objects: 3,
            ..HeapSettings::default()
        });
        heap.alloc(tads(&[])).unwrap();
        heap.alloc(tads(&[])).unwrap();
        assert_eq!(
            heap.alloc(tads(&[])),
            Err(HeapError::OutOfMemory { limit: 3 })
        );
    }

    #[test]
    fn set_prop_releases_replaced_value_without_savepoint() {
        let mut heap = Heap::new(HeapSettings::default());
        let holder = heap.alloc(tads(&[])).unwrap();
        let child = heap.alloc(tads(&[])).unwrap();
        heap.set_prop(holder, PropId(1), Value::Obj(child)).unwrap();
        assert_eq!(heap.ref_count(child), Some(1));

        heap.set_prop(holder, PropId(1), Value::Nil).unwrap();
        assert!(heap.get(child).is_none());
    }

    #[test]
    fn vector_mutations_check_bounds() {
        let mut heap = Heap::new(HeapSettings::default());
        let v = heap.alloc(vector(vec![Value::Int(1)])).unwrap();
        heap.insert_element(v, 1, Value::Int(2)).unwrap();
        heap.set_element(v, 0, Value::Int(5)).unwrap();
        assert_eq!(
            heap.set_element(v, 2, Value::Nil),
            Err(HeapError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert_eq!(heap.remove_element(v, 0), Ok(Value::Int(5)));
        assert_eq!(
            heap.get(v).map(|o| o.body.clone()),
            Some(Body::Vector(vec![Value::Int(2)]))
        );
    }

    #[test]
    fn wrong_kind_is_reported() {
        let mut heap = Heap::new(HeapSettings::default());
        let v = heap.alloc(vector(vec![])).unwrap();
        assert!(matches!(
            heap.set_prop(v, PropId(1), Value::Nil),
            Err(HeapError::WrongKind { .. })
        ));
    }

    #[test]
    fn clear_then_restore_keeps_ids_exact_and_stales_the_rest() {
        let mut heap = Heap::new(HeapSettings::default());
        heap.define_persistent(1, tads(&[])).unwrap();
        heap.seal();
        let kept = heap.alloc(tads(&[])).unwrap();
        let dropped = heap.alloc(tads(&[])).unwrap();

        heap.clear();
        assert_eq!(heap.live_count(), 0);
        heap.insert_restored(ObjectId::persistent(1), tads(&[]), true).unwrap();
        heap.insert_restored(kept, tads(&[(1, Value::Int(4))]), false).unwrap();
        heap.seal();
        heap.rebuild_counts(&mut vec![Value::Obj(kept)]);

        assert!(heap.is_persistent(ObjectId::persistent(1)));
        assert_eq!(heap.ref_count(kept), Some(1));
        assert!(heap.get(dropped).is_none());
        let fresh = heap.alloc(tads(&[])).unwrap();
        assert_ne!(fresh, dropped);
    }

    #[test]
    fn restored_ids_must_fit_the_table() {
        let mut heap = Heap::new(HeapSettings {
            max_objects: 8,
            ..HeapSettings::default()
        });
        assert!(heap.check_restorable(ObjectId::new(7, 3)).is_ok());
        assert!(matches!(
            heap.check_restorable(ObjectId::new(0, 0)),
            Err(HeapError::InvalidObject(_))
        ));
        assert!(matches!(
            heap.check_restorable(ObjectId::new(8, 0)),
            Err(HeapError::OutOfMemory { limit: 8 })
        ));

        heap.insert_restored(ObjectId::new(3, 1), tads(&[]), false).unwrap();
        assert!(matches!(
            heap.insert_restored(ObjectId::new(3, 2), tads(&[]), false),
            Err(HeapError::DuplicateObject(3))
        ));
        assert_eq!(heap.live_count(), 1);
    }
}
