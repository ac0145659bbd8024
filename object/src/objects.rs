use crate::{ObjectId, PropId, Value};

/// Index into the VM's loaded metaclass table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetaclassId(pub u16);

// ── Visiting ───────────────────────────────────────────────────────

/// Receives every value an object holds.
pub trait Visitor {
    fn visit(&mut self, value: Value);
}

impl<F: FnMut(Value)> Visitor for F {
    fn visit(&mut self, value: Value) {
        self(value)
    }
}

pub trait Visitable {
    /// Call `visitor` for every value stored directly in `self`.
    fn visit_edges(&self, visitor: &mut dyn Visitor);
}

// ── Property table ─────────────────────────────────────────────────

/// Property-value mapping of a program-defined object, kept sorted by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropTable {
    entries: Vec<(PropId, Value)>,
}

impl PropTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn get(&self, prop: PropId) -> Option<Value> {
        self.entries
            .binary_search_by_key(&prop, |(p, _)| *p)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn contains(&self, prop: PropId) -> bool {
        self.get(prop).is_some()
    }

    /// Set `prop`, returning the value it replaced.
    pub fn set(&mut self, prop: PropId, value: Value) -> Option<Value> {
        match self.entries.binary_search_by_key(&prop, |(p, _)| *p) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            Err(i) => {
                self.entries.insert(i, (prop, value));
                None
            }
        }
    }

    pub fn remove(&mut self, prop: PropId) -> Option<Value> {
        self.entries
            .binary_search_by_key(&prop, |(p, _)| *p)
            .ok()
            .map(|i| self.entries.remove(i).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropId, Value)> + '_ {
        self.entries.iter().copied()
    }
}

// ── Bodies ─────────────────────────────────────────────────────────

/// A program-defined object: superclasses plus its own properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TadsObject {
    pub superclasses: Vec<ObjectId>,
    pub props: PropTable,
}

/// Metaclass-specific state of an object.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Tads(TadsObject),
    /// Immutable list.
    List(Vec<Value>),
    /// Mutable, undoable list.
    Vector(Vec<Value>),
    Str(String),
    /// Insertion-ordered key/value table.
    LookupTable(Vec<(Value, Value)>),
}

impl Body {
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Body::Tads(_) => "tads-object",
            Body::List(_) => "list",
            Body::Vector(_) => "vector",
            Body::Str(_) => "string",
            Body::LookupTable(_) => "lookuptable",
        }
    }
}

/// A heap object. The metaclass binding never changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    metaclass: MetaclassId,
    pub body: Body,
}

impl Object {
    pub fn new(metaclass: MetaclassId, body: Body) -> Self {
        Self { metaclass, body }
    }

    #[inline(always)]
    pub fn metaclass(&self) -> MetaclassId {
        self.metaclass
    }

    pub fn as_tads(&self) -> Option<&TadsObject> {
        match &self.body {
            Body::Tads(t) => Some(t),
            _ => None,
        }
    }

    pub fn superclasses(&self) -> &[ObjectId] {
        match &self.body {
            Body::Tads(t) => &t.superclasses,
            _ => &[],
        }
    }

    /// Own (non-inherited) property value.
    pub fn own_prop(&self, prop: PropId) -> Option<Value> {
        self.as_tads().and_then(|t| t.props.get(prop))
    }
}

impl Visitable for Object {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        match &self.body {
            Body::Tads(t) => {
                for &sc in &t.superclasses {
                    visitor.visit(Value::Obj(sc));
                }
                for (_, v) in t.props.iter() {
                    visitor.visit(v);
                }
            }
            Body::List(items) | Body::Vector(items) => {
                for &v in items {
                    visitor.visit(v);
                }
            }
            Body::Str(_) => {}
            Body::LookupTable(entries) => {
                for &(k, v) in entries {
                    visitor.visit(k);
                    visitor.visit(v);
                }
            }
        }
    }
}
