//! Undo log.
//!
//! While at least one savepoint exists, every mutation made through the
//! heap appends a record describing the prior state. Records own counts on
//! every value they mention, target included, so nothing they need can be
//! freed until the record is applied or discarded.

use object::{Body, ObjectId, PropId, Value};

use crate::Heap;

#[derive(Debug, Clone)]
pub struct UndoSettings {
    /// Savepoints kept before the oldest one is dropped.
    pub max_savepoints: usize,
}

impl Default for UndoSettings {
    fn default() -> Self {
        Self { max_savepoints: 64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SavepointId(pub u32);

/// Prior state of one mutated location.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Property value before the write; `None` if it was undefined.
    Prop { prop: PropId, prior: Option<Value> },
    Element { index: usize, prior: Value },
    Inserted { index: usize },
    Removed { index: usize, prior: Value },
    /// Table entry written at `index`; `None` if the key was new.
    Entry {
        index: usize,
        key: Value,
        prior: Option<Value>,
    },
    EntryRemoved {
        index: usize,
        key: Value,
        value: Value,
    },
}

impl Change {
    pub(crate) fn visit_values(&self, f: &mut dyn FnMut(Value)) {
        match *self {
            Change::Prop { prior, .. } => prior.into_iter().for_each(f),
            Change::Element { prior, .. } | Change::Removed { prior, .. } => {
                f(prior)
            }
            Change::Inserted { .. } => {}
            Change::Entry { key, prior, .. } => {
                f(key);
                if let Some(v) = prior {
                    f(v);
                }
            }
            Change::EntryRemoved { key, value, .. } => {
                f(key);
                f(value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UndoRecord {
    pub target: ObjectId,
    pub change: Change,
}

#[derive(Debug, Clone, Copy)]
struct Savepoint {
    id: SavepointId,
    /// Index of the first record made after this savepoint.
    start: usize,
}

#[derive(Debug)]
pub struct UndoLog {
    settings: UndoSettings,
    records: Vec<UndoRecord>,
    savepoints: Vec<Savepoint>,
    next_id: u32,
}

impl UndoLog {
    pub fn new(settings: UndoSettings) -> Self {
        Self {
            settings,
            records: Vec::new(),
            savepoints: Vec::new(),
            next_id: 1,
        }
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        !self.savepoints.is_empty()
    }

    pub(crate) fn push(&mut self, record: UndoRecord) {
        self.records.push(record);
    }

    pub fn savepoint_count(&self) -> usize {
        self.savepoints.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Every value the log holds a count on.
    pub(crate) fn visit_values(&self, f: &mut dyn FnMut(Value)) {
        for record in &self.records {
            f(Value::Obj(record.target));
            record.change.visit_values(f);
        }
    }
}

// ── Heap operations ───────────────────────────────────────────────────

impl Heap {
    pub fn undo_log(&self) -> &UndoLog {
        &self.undo
    }

    /// Establish a new savepoint. When the limit is reached the oldest
    /// savepoint and its records are discarded first.
    pub fn begin_savepoint(&mut self) -> SavepointId {
        if self.undo.savepoints.len() >= self.undo.settings.max_savepoints {
            self.drop_oldest_savepoint();
        }
        let id = SavepointId(self.undo.next_id);
        self.undo.next_id = self.undo.next_id.wrapping_add(1);
        self.undo.savepoints.push(Savepoint {
            id,
            start: self.undo.records.len(),
        });
        log::trace!("savepoint {} established", id.0);
        id
    }

    fn drop_oldest_savepoint(&mut self) {
        if self.undo.savepoints.is_empty() {
            return;
        }
        let end = self
            .undo
            .savepoints
            .get(1)
            .map_or(self.undo.records.len(), |s| s.start);
        let dropped: Vec<UndoRecord> = self.undo.records.drain(..end).collect();
        self.undo.savepoints.remove(0);
        for sp in &mut self.undo.savepoints {
            sp.start -= end;
        }
        for record in dropped {
            self.discard_record(record);
        }
    }

    /// Roll back every change made since `savepoint`, most recent first.
    /// The savepoint and any newer ones cease to exist. Returns false if
    /// the savepoint is unknown.
    pub fn undo_to(&mut self, savepoint: SavepointId) -> bool {
        let Some(pos) =
            self.undo.savepoints.iter().position(|s| s.id == savepoint)
        else {
            return false;
        };
        let start = self.undo.savepoints[pos].start;
        self.undo.savepoints.truncate(pos);
        let mut undone = 0;
        while self.undo.records.len() > start {
            if let Some(record) = self.undo.records.pop() {
                self.apply_undo(record);
                undone += 1;
            }
        }
        log::debug!("undid {undone} changes back to savepoint {}", savepoint.0);
        true
    }

    /// Roll back to the most recent savepoint.
    pub fn undo_last(&mut self) -> bool {
        match self.undo.savepoints.last() {
            Some(sp) => {
                let id = sp.id;
                self.undo_to(id)
            }
            None => false,
        }
    }

    /// Make all changes permanent: discard every record and savepoint.
    pub fn commit(&mut self) {
        self.undo.savepoints.clear();
        let records = std::mem::take(&mut self.undo.records);
        for record in records {
            self.discard_record(record);
        }
    }

    fn discard_record(&mut self, record: UndoRecord) {
        let mut held = Vec::new();
        record.change.visit_values(&mut |v| held.push(v));
        self.release_values(held);
        self.release(record.target);
    }

    fn apply_undo(&mut self, record: UndoRecord) {
        let UndoRecord { target, change } = record;
        let mut released: Vec<Value> = Vec::new();

        if !self.contains(target) {
            log::warn!("undo target {target:?} no longer exists");
            change.visit_values(&mut |v| released.push(v));
            self.release_values(released);
            return;
        }
        let Ok(object) = self.object_mut(target) else {
            return;
        };

        match (&mut object.body, change) {
            (Body::Tads(t), Change::Prop { prop, prior }) => {
                let current = match prior {
                    Some(v) => t.props.set(prop, v),
                    None => t.props.remove(prop),
                };
                released.extend(current);
            }
            (Body::Vector(items), Change::Element { index, prior })
                if index < items.len() =>
            {
                released.push(std::mem::replace(&mut items[index], prior));
            }
            (Body::Vector(items), Change::Inserted { index })
                if index < items.len() =>
            {
                released.push(items.remove(index));
            }
            (Body::Vector(items), Change::Removed { index, prior })
                if index <= items.len() =>
            {
                items.insert(index, prior);
            }
            (Body::LookupTable(entries), Change::Entry { index, key, prior }) => {
                released.push(key);
                let at = entries.get(index).filter(|(k, _)| *k == key).is_some();
                match prior {
                    None if at => {
                        let (k, v) = entries.remove(index);
                        released.push(k);
                        released.push(v);
                    }
                    Some(prior) if at => {
                        released.push(std::mem::replace(
                            &mut entries[index].1,
                            prior,
                        ));
                    }
                    other => released.extend(other),
                }
            }
            (
                Body::LookupTable(entries),
                Change::EntryRemoved { index, key, value },
            ) => {
                let index = index.min(entries.len());
                entries.insert(index, (key, value));
            }
            (body, change) => {
                log::warn!(
                    "undo record {change:?} does not apply to a {}",
                    body.kind_name()
                );
                change.visit_values(&mut |v| released.push(v));
            }
        }

        self.release_values(released);
        self.release(target);
    }
}

#[cfg(test)]
mod tests {
    use object::{MetaclassId, Object};

    use super::*;
    use crate::HeapSettings;
    use crate::table::tests::tads;

    fn heap() -> Heap {
        Heap::new(HeapSettings::default())
    }

    fn prop(heap: &Heap, id: ObjectId, p: u16) -> Option<Value> {
        heap.get(id).and_then(|o| o.own_prop(PropId(p)))
    }

    #[test]
    fn nothing_is_recorded_without_a_savepoint() {
        let mut heap = heap();
        let obj = heap.alloc(tads(&[])).unwrap();
        heap.set_prop(obj, PropId(1), Value::Int(1)).unwrap();
        assert_eq!(heap.undo_log().record_count(), 0);
        assert!(!heap.undo_last());
    }

    #[test]
    fn undo_to_savepoint_restores_exact_state() {
        let mut heap = heap();
        let obj = heap.alloc(tads(&[(1, Value::Int(1))])).unwrap();

        let first = heap.begin_savepoint();
        heap.set_prop(obj, PropId(1), Value::Int(2)).unwrap();

        let second = heap.begin_savepoint();
        heap.set_prop(obj, PropId(1), Value::Int(3)).unwrap();
        heap.set_prop(obj, PropId(2), Value::True).unwrap();

        let third = heap.begin_savepoint();
        heap.remove_prop(obj, PropId(1)).unwrap();
        assert_eq!(prop(&heap, obj, 1), None);

        assert!(heap.undo_to(second));
        assert_eq!(prop(&heap, obj, 1), Some(Value::Int(2)));
        assert_eq!(prop(&heap, obj, 2), None);
        assert!(!heap.undo_to(third), "newer savepoints are gone");

        assert!(heap.undo_to(first));
        assert_eq!(prop(&heap, obj, 1), Some(Value::Int(1)));
        assert_eq!(heap.undo_log().record_count(), 0);
        assert_eq!(heap.ref_count(obj), Some(1));
    }

    #[test]
    fn records_keep_replaced_objects_alive() {
        let mut heap = heap();
        let holder = heap.alloc(tads(&[])).unwrap();
        let child = heap.alloc(tads(&[])).unwrap();
        heap.set_prop(holder, PropId(1), Value::Obj(child)).unwrap();

        let sp = heap.begin_savepoint();
        heap.set_prop(holder, PropId(1), Value::Nil).unwrap();
        assert!(heap.contains(child), "held by the undo record");

        assert!(heap.undo_to(sp));
        assert_eq!(prop(&heap, holder, 1), Some(Value::Obj(child)));
        assert_eq!(heap.ref_count(child), Some(1));

        heap.begin_savepoint();
        heap.set_prop(holder, PropId(1), Value::Nil).unwrap();
        heap.commit();
        assert!(!heap.contains(child), "freed once the record is discarded");
    }

    #[test]
    fn vector_changes_undo_in_reverse_order() {
        let mut heap = heap();
        let v = heap
            .alloc(Object::new(
                MetaclassId(1),
                Body::Vector(vec![Value::Int(1), Value::Int(2)]),
            ))
            .unwrap();
        let sp = heap.begin_savepoint();
        heap.insert_element(v, 0, Value::Int(0)).unwrap();
        heap.set_element(v, 2, Value::Int(9)).unwrap();
        heap.remove_element(v, 1).unwrap();

        assert!(heap.undo_to(sp));
        assert_eq!(
            heap.get(v).map(|o| o.body.clone()),
            Some(Body::Vector(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn table_changes_restore_entry_order() {
        let mut heap = heap();
        let t = heap
            .alloc(Object::new(MetaclassId(2), Body::LookupTable(Vec::new())))
            .unwrap();
        heap.table_put(t, Value::Int(1), Value::Int(10)).unwrap();
        heap.table_put(t, Value::Int(2), Value::Int(20)).unwrap();

        let sp = heap.begin_savepoint();
        heap.table_remove(t, Value::Int(1)).unwrap();
        heap.table_put(t, Value::Int(2), Value::Int(21)).unwrap();
        heap.table_put(t, Value::Int(3), Value::Int(30)).unwrap();

        assert!(heap.undo_to(sp));
        assert_eq!(
            heap.get(t).map(|o| o.body.clone()),
            Some(Body::LookupTable(vec![
                (Value::Int(1), Value::Int(10)),
                (Value::Int(2), Value::Int(20)),
            ]))
        );
    }

    #[test]
    fn oldest_savepoint_is_dropped_at_the_limit() {
        let mut heap = Heap::new(HeapSettings {
            undo: UndoSettings { max_savepoints: 2 },
            ..HeapSettings::default()
        });
        let obj = heap.alloc(tads(&[])).unwrap();
        let first = heap.begin_savepoint();
        heap.set_prop(obj, PropId(1), Value::Int(1)).unwrap();
        let second = heap.begin_savepoint();
        heap.set_prop(obj, PropId(1), Value::Int(2)).unwrap();
        let _third = heap.begin_savepoint();

        assert_eq!(heap.undo_log().savepoint_count(), 2);
        assert_eq!(heap.undo_log().record_count(), 1);
        assert!(!heap.undo_to(first));
        assert!(heap.undo_to(second));
        assert_eq!(prop(&heap, obj, 1), Some(Value::Int(1)));
    }
}
