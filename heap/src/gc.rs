//! Cycle collection.
//!
//! Reference counting frees acyclic garbage eagerly; this mark-sweep pass
//! finds the rest. Roots are whatever the [`RootProvider`] reports, every
//! persistent object, and every value the undo log holds.

use object::{ObjectId, Value, Visitable};

use crate::Heap;
use crate::table::SlotFlags;

/// Reports the values the collector must treat as live.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value));
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
        for &v in self.iter() {
            visitor(v);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub marked: usize,
    pub freed: usize,
    pub live: usize,
}

impl Heap {
    /// Free every dynamic object unreachable from the roots.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) -> GcStats {
        let mut work: Vec<ObjectId> = Vec::new();
        let mut push = |v: Value| {
            if let Value::Obj(id) = v {
                work.push(id);
            }
        };
        roots.visit_roots(&mut push);
        self.undo.visit_values(&mut push);
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.object.is_some()
                && slot.flags.contains(SlotFlags::PERSISTENT)
            {
                work.push(ObjectId::new(i as u32, slot.generation));
            }
        }

        // ── Mark ──
        let mut marked = 0;
        while let Some(id) = work.pop() {
            let Some(slot) = self.slot_mut(id) else {
                continue;
            };
            if slot.flags.contains(SlotFlags::MARKED) {
                continue;
            }
            slot.flags.insert(SlotFlags::MARKED);
            marked += 1;
            if let Some(object) = &slot.object {
                object.visit_edges(&mut |v: Value| {
                    if let Value::Obj(o) = v {
                        work.push(o);
                    }
                });
            }
        }

        // ── Sweep ──
        let dead: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.object.is_some() && !s.flags.contains(SlotFlags::MARKED)
            })
            .map(|(i, _)| i as u32)
            .collect();

        let mut edges = Vec::new();
        for &index in &dead {
            if let Some(object) = self.free_slot(index) {
                object.visit_edges(&mut |v: Value| edges.push(v));
            }
        }
        // Counts held by garbage on survivors go away with it. Edges into
        // other garbage no longer resolve.
        for v in edges {
            if let Value::Obj(id) = v
                && let Some(slot) = self.slot_mut(id)
            {
                slot.refs = slot.refs.saturating_sub(1);
            }
        }

        for slot in self.slots.iter_mut() {
            slot.flags.remove(SlotFlags::MARKED);
        }
        self.allocated_since_gc = 0;

        let stats = GcStats {
            marked,
            freed: dead.len(),
            live: self.live,
        };
        log::debug!(
            "gc: marked {}, freed {}, live {}",
            stats.marked,
            stats.freed,
            stats.live
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use object::PropId;

    use super::*;
    use crate::HeapSettings;
    use crate::table::tests::tads;

    /// Two dynamic objects pointing at each other. The caller still owns
    /// one count on each.
    fn cycle(heap: &mut Heap) -> (ObjectId, ObjectId) {
        let a = heap.alloc(tads(&[])).unwrap();
        let b = heap.alloc(tads(&[])).unwrap();
        heap.retain(a);
        heap.retain(b);
        heap.set_prop(a, PropId(1), Value::Obj(b)).unwrap();
        heap.set_prop(b, PropId(1), Value::Obj(a)).unwrap();
        (a, b)
    }

    #[test]
    fn unreachable_cycle_is_reclaimed() {
        let mut heap = Heap::new(HeapSettings::default());
        let (a, b) = cycle(&mut heap);
        heap.release(a);
        heap.release(b);
        assert_eq!(heap.live_count(), 2, "counts alone cannot free a cycle");

        let stats = heap.collect(&mut Vec::new());
        assert_eq!(stats.freed, 2);
        assert_eq!(heap.live_count(), 0);
        assert!(!heap.contains(a) && !heap.contains(b));
    }

    #[test]
    fn rooted_cycle_survives() {
        let mut heap = Heap::new(HeapSettings::default());
        let (a, b) = cycle(&mut heap);
        heap.release(b);

        let stats = heap.collect(&mut vec![Value::Obj(a)]);
        assert_eq!(stats.freed, 0);
        assert!(heap.contains(a) && heap.contains(b));
        assert_eq!(heap.ref_count(a), Some(2));
    }

    #[test]
    fn persistent_objects_are_roots() {
        let mut heap = Heap::new(HeapSettings::default());
        heap.define_persistent(1, tads(&[])).unwrap();
        heap.seal();
        let root = ObjectId::persistent(1);
        let child = heap.alloc(tads(&[])).unwrap();
        heap.set_prop(root, PropId(2), Value::Obj(child)).unwrap();

        let garbage = heap.alloc(tads(&[])).unwrap();
        heap.set_prop(garbage, PropId(1), Value::Obj(garbage)).unwrap();

        let stats = heap.collect(&mut Vec::new());
        assert_eq!(stats.freed, 1);
        assert!(heap.contains(root) && heap.contains(child));
        assert!(!heap.contains(garbage));
    }

    #[test]
    fn survivor_counts_drop_with_garbage() {
        let mut heap = Heap::new(HeapSettings::default());
        let survivor = heap.alloc(tads(&[])).unwrap();
        let (a, b) = cycle(&mut heap);
        heap.retain(survivor);
        heap.set_prop(a, PropId(2), Value::Obj(survivor)).unwrap();
        heap.release(a);
        heap.release(b);
        assert_eq!(heap.ref_count(survivor), Some(2));

        heap.collect(&mut vec![Value::Obj(survivor)]);
        assert_eq!(heap.ref_count(survivor), Some(1));
    }

    #[test]
    fn undo_records_keep_objects_alive() {
        let mut heap = Heap::new(HeapSettings::default());
        let holder = heap.alloc(tads(&[])).unwrap();
        let child = heap.alloc(tads(&[])).unwrap();
        heap.set_prop(child, PropId(1), Value::Obj(child)).unwrap();
        heap.retain(child);
        heap.set_prop(holder, PropId(1), Value::Obj(child)).unwrap();

        heap.begin_savepoint();
        heap.set_prop(holder, PropId(1), Value::Nil).unwrap();
        heap.collect(&mut vec![Value::Obj(holder)]);
        assert!(heap.contains(child));
    }
}
