//! Value helpers shared by the interpreter and native code: allocation of
//! strings and lists, content access, equality, ordering and display.

use std::cmp::Ordering;

use object::{Body, MetaclassId, Object, ObjectId, TadsObject, Value};

use crate::VM;
use crate::error::{ErrorCode, Fault, VmError, VmResult};
use crate::metaclass::MetaKind;

impl VM {
    /// Take an extra count on `value` and hand it out.
    pub(crate) fn owned(&mut self, value: Value) -> Value {
        self.heap.retain_value(value);
        value
    }

    /// Allocate an object whose values are already owned by `body`.
    pub(crate) fn alloc(&mut self, meta: MetaclassId, body: Body) -> VmResult<Value> {
        let id = self.heap.alloc(Object::new(meta, body))?;
        Ok(Value::Obj(id))
    }

    pub fn new_string(&mut self, text: String) -> VmResult<Value> {
        let meta = self.metaclasses.id_of(MetaKind::Str)?;
        self.alloc(meta, Body::Str(text))
    }

    /// New list object holding `items`, which stay owned by the caller.
    pub fn new_list(&mut self, items: &[Value]) -> VmResult<Value> {
        let meta = self.metaclasses.id_of(MetaKind::List)?;
        for &v in items {
            self.heap.retain_value(v);
        }
        self.alloc(meta, Body::List(items.to_vec()))
    }

    /// New program object inheriting from `superclasses`, with no
    /// properties. Returns an owned id.
    pub(crate) fn new_tads(&mut self, superclasses: Vec<ObjectId>) -> VmResult<ObjectId> {
        let meta = self.metaclasses.id_of(MetaKind::TadsObject)?;
        for &sc in &superclasses {
            self.heap.retain(sc);
        }
        let body = Body::Tads(TadsObject {
            superclasses,
            ..TadsObject::default()
        });
        Ok(self.heap.alloc(Object::new(meta, body))?)
    }

    /// Metaclass kind of an object value; constants report the kind they
    /// behave as.
    pub(crate) fn kind_of(&self, value: Value) -> Option<MetaKind> {
        match value {
            Value::SString(_) => Some(MetaKind::Str),
            Value::List(_) => Some(MetaKind::List),
            Value::Obj(id) => self.heap.get(id).map(|o| MetaKind::of(&o.body)),
            _ => None,
        }
    }

    /// Text of a constant string or string object.
    pub fn string_value(&mut self, value: Value) -> VmResult<Option<String>> {
        match value {
            Value::SString(ofs) => self.pools.read_string(ofs).map(Some),
            Value::Obj(id) => match &self.heap.deref(id)?.body {
                Body::Str(s) => Ok(Some(s.clone())),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Elements of a constant list, list object or vector. The values are
    /// borrowed.
    pub fn list_items(&mut self, value: Value) -> VmResult<Option<Vec<Value>>> {
        match value {
            Value::List(ofs) => self.pools.read_list(ofs).map(Some),
            Value::Obj(id) => match &self.heap.deref(id)?.body {
                Body::List(items) | Body::Vector(items) => Ok(Some(items.clone())),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    pub(crate) fn expect_string(&mut self, value: Value) -> Result<String, Fault> {
        self.string_value(value)?
            .ok_or_else(|| VmError::bad_type("string").into())
    }

    pub(crate) fn expect_list(&mut self, value: Value) -> Result<Vec<Value>, Fault> {
        self.list_items(value)?
            .ok_or_else(|| VmError::bad_type("list").into())
    }

    /// Immutable lists only: vectors compare by identity.
    fn immutable_list(&mut self, value: Value) -> VmResult<Option<Vec<Value>>> {
        match value {
            Value::Obj(id) if !matches!(self.heap.deref(id)?.body, Body::List(_)) => Ok(None),
            _ => self.list_items(value),
        }
    }

    /// Language-level equality: numbers by value, strings and lists by
    /// content, everything else by identity.
    pub fn values_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => return Ok(x == y),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                return Ok(as_f64(a) == as_f64(b));
            }
            _ => {}
        }
        if a == b {
            return Ok(true);
        }
        if let (Some(x), Some(y)) = (self.string_value(a)?, self.string_value(b)?) {
            return Ok(x == y);
        }
        if let (Some(x), Some(y)) = (self.immutable_list(a)?, self.immutable_list(b)?) {
            if x.len() != y.len() {
                return Ok(false);
            }
            for (&p, &q) in x.iter().zip(&y) {
                if !self.values_equal(p, q)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Ordering over numbers and strings.
    pub fn compare_values(&mut self, a: Value, b: Value) -> Result<Ordering, Fault> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => return Ok(x.cmp(&y)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                return as_f64(a)
                    .partial_cmp(&as_f64(b))
                    .ok_or_else(|| ErrorCode::InvalidComparison.into());
            }
            _ => {}
        }
        match (self.string_value(a)?, self.string_value(b)?) {
            (Some(x), Some(y)) => Ok(x.cmp(&y)),
            _ => Err(ErrorCode::InvalidComparison.into()),
        }
    }

    /// Text form used by `toString` and output.
    pub fn display_string(&mut self, value: Value) -> VmResult<String> {
        self.display_nested(value, 0)
    }

    fn display_nested(&mut self, value: Value, depth: usize) -> VmResult<String> {
        // A vector may contain itself.
        const MAX_DEPTH: usize = 16;
        if let Some(s) = self.string_value(value)? {
            return Ok(s);
        }
        if let Some(items) = self.list_items(value)? {
            if depth >= MAX_DEPTH {
                return Ok("[...]".to_string());
            }
            let mut parts = Vec::with_capacity(items.len());
            for v in items {
                parts.push(self.display_nested(v, depth + 1)?);
            }
            return Ok(format!("[{}]", parts.join(", ")));
        }
        Ok(match value {
            Value::Empty => String::new(),
            Value::Nil => "nil".to_string(),
            Value::True => "true".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(x) => x.to_string(),
            other => format!("{other:?}"),
        })
    }
}

pub(crate) fn as_f64(value: Value) -> f64 {
    match value {
        Value::Int(n) => n as f64,
        Value::Float(x) => x,
        _ => f64::NAN,
    }
}
