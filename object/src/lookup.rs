use crate::{Object, ObjectId, PropId, Value};

/// Read access to objects by id, implemented by the object table.
pub trait ObjectSource {
    fn object(&self, id: ObjectId) -> Option<&Object>;
}

/// The result of a property lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupResult {
    /// No object in the inheritance graph defines the property.
    None,
    Found {
        /// The object that defines the property (may differ from the
        /// receiver if it was inherited).
        holder: ObjectId,
        value: Value,
    },
}

impl LookupResult {
    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found { .. })
    }
}

/// Linearise the superclass graph of `start`.
///
/// Depth-first, left-to-right, each object listed once at its first
/// occurrence. Objects reachable through several paths (a diamond) are
/// therefore visited exactly once, and a malformed cyclic graph terminates.
/// Unknown ids are skipped.
pub fn linearize(source: &impl ObjectSource, start: ObjectId) -> Vec<ObjectId> {
    let mut order = Vec::new();
    // Explicit stack of (object, next superclass position) replaces recursion.
    let mut stack: Vec<(ObjectId, usize)> = Vec::new();
    if source.object(start).is_none() {
        return order;
    }
    order.push(start);
    stack.push((start, 0));

    while let Some((id, pos)) = stack.last().copied() {
        let supers = source.object(id).map(|o| o.superclasses()).unwrap_or(&[]);
        if pos >= supers.len() {
            stack.pop();
            continue;
        }
        if let Some(top) = stack.last_mut() {
            top.1 += 1;
        }
        let next = supers[pos];
        if order.contains(&next) || source.object(next).is_none() {
            continue;
        }
        order.push(next);
        stack.push((next, 0));
    }
    order
}

/// Look up `prop` on `receiver`, walking its superclasses.
pub fn lookup(
    source: &impl ObjectSource,
    receiver: ObjectId,
    prop: PropId,
) -> LookupResult {
    find_in(source, &linearize(source, receiver), prop)
}

/// Look up the definition of `prop` that `defining` overrides when seen
/// from `receiver`: the search continues after `defining` in the
/// receiver's linearisation.
pub fn lookup_inherited(
    source: &impl ObjectSource,
    receiver: ObjectId,
    defining: ObjectId,
    prop: PropId,
) -> LookupResult {
    let order = linearize(source, receiver);
    let Some(pos) = order.iter().position(|&id| id == defining) else {
        // The defining object is not an ancestor: fall back to its own
        // superclasses.
        let order = linearize(source, defining);
        return find_in(source, order.get(1..).unwrap_or(&[]), prop);
    };
    find_in(source, &order[pos + 1..], prop)
}

fn find_in(
    source: &impl ObjectSource,
    order: &[ObjectId],
    prop: PropId,
) -> LookupResult {
    for &id in order {
        if let Some(value) = source.object(id).and_then(|o| o.own_prop(prop)) {
            return LookupResult::Found { holder: id, value };
        }
    }
    LookupResult::None
}

/// True if `obj` is `class` or inherits from it.
pub fn is_instance_of(
    source: &impl ObjectSource,
    obj: ObjectId,
    class: ObjectId,
) -> bool {
    linearize(source, obj).contains(&class)
}
