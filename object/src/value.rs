use core::fmt;
use core::hash::{Hash, Hasher};

/// Identifier of an object in the object table.
///
/// `index` selects the slot, `generation` is bumped every time the slot is
/// freed so that a stale id can never alias a newer object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub index: u32,
    pub generation: u32,
}

impl ObjectId {
    #[inline(always)]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Id of an object defined in the image. Image ids map directly onto
    /// slot indexes at generation zero.
    #[inline(always)]
    pub const fn persistent(image_id: u32) -> Self {
        Self {
            index: image_id,
            generation: 0,
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.index)?;
        if self.generation != 0 {
            write!(f, "@{}", self.generation)?;
        }
        Ok(())
    }
}

/// A property identifier. Zero is never a valid property.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PropId(pub u16);

impl PropId {
    pub const INVALID: PropId = PropId(0);

    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Type codes shared by the portable image encoding and `dataType`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Nil = 1,
    True = 2,
    Obj = 5,
    Prop = 6,
    Int = 7,
    SString = 8,
    List = 10,
    CodeOfs = 11,
    FuncPtr = 12,
    Empty = 13,
    Float = 14,
}

impl DataType {
    pub const fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => DataType::Nil,
            2 => DataType::True,
            5 => DataType::Obj,
            6 => DataType::Prop,
            7 => DataType::Int,
            8 => DataType::SString,
            10 => DataType::List,
            11 => DataType::CodeOfs,
            12 => DataType::FuncPtr,
            13 => DataType::Empty,
            14 => DataType::Float,
            _ => return None,
        })
    }
}

/// Size of a value in the image's portable encoding.
pub const PORTABLE_SIZE: usize = 5;

/// A VM value.
///
/// Everything is copied by value. `Obj` is a counted handle: whoever stores
/// it in a counted location (stack, property, element, undo record) owns one
/// reference in the object table.
#[derive(Clone, Copy)]
pub enum Value {
    /// No value at all (uninitialised slot, missing result).
    Empty,
    Nil,
    True,
    Int(i32),
    Float(f64),
    Obj(ObjectId),
    Prop(PropId),
    /// A function value: code pool offset of a method header.
    FuncPtr(u32),
    /// A method bound to a property: code pool offset of a method header.
    CodeOfs(u32),
    /// Constant pool offset of a string.
    SString(u32),
    /// Constant pool offset of a list.
    List(u32),
}

impl Value {
    #[inline(always)]
    pub const fn from_bool(b: bool) -> Self {
        if b { Value::True } else { Value::Nil }
    }

    /// Truthiness used by conditional jumps and `Not`.
    #[inline]
    pub fn is_true(self) -> bool {
        !matches!(self, Value::Nil | Value::Empty | Value::Int(0))
    }

    #[inline(always)]
    pub const fn as_obj(self) -> Option<ObjectId> {
        match self {
            Value::Obj(id) => Some(id),
            _ => None,
        }
    }

    #[inline(always)]
    pub const fn as_int(self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    #[inline(always)]
    pub const fn as_prop(self) -> Option<PropId> {
        match self {
            Value::Prop(p) => Some(p),
            _ => None,
        }
    }

    pub const fn data_type(self) -> DataType {
        match self {
            Value::Empty => DataType::Empty,
            Value::Nil => DataType::Nil,
            Value::True => DataType::True,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Obj(_) => DataType::Obj,
            Value::Prop(_) => DataType::Prop,
            Value::FuncPtr(_) => DataType::FuncPtr,
            Value::CodeOfs(_) => DataType::CodeOfs,
            Value::SString(_) => DataType::SString,
            Value::List(_) => DataType::List,
        }
    }

    pub const fn type_name(self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Nil => "nil",
            Value::True => "true",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Obj(_) => "object",
            Value::Prop(_) => "property",
            Value::FuncPtr(_) => "function pointer",
            Value::CodeOfs(_) => "method",
            Value::SString(_) => "string",
            Value::List(_) => "list",
        }
    }

    // ── Portable encoding ──────────────────────────────────────────

    /// Decode a 5-byte portable value as stored in the image.
    ///
    /// Returns `None` for unknown tags or for tags that cannot appear in an
    /// image (floats).
    pub fn from_portable(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PORTABLE_SIZE {
            return None;
        }
        let data = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(match DataType::from_u8(bytes[0])? {
            DataType::Nil => Value::Nil,
            DataType::True => Value::True,
            DataType::Empty => Value::Empty,
            DataType::Int => Value::Int(data as i32),
            DataType::Obj => Value::Obj(ObjectId::persistent(data)),
            DataType::Prop => Value::Prop(PropId(data as u16)),
            DataType::SString => Value::SString(data),
            DataType::List => Value::List(data),
            DataType::CodeOfs => Value::CodeOfs(data),
            DataType::FuncPtr => Value::FuncPtr(data),
            DataType::Float => return None,
        })
    }

    /// Encode into the 5-byte portable form. Floats and dynamic objects
    /// have no portable representation.
    pub fn to_portable(self) -> Option<[u8; PORTABLE_SIZE]> {
        let data: u32 = match self {
            Value::Nil | Value::True | Value::Empty => 0,
            Value::Int(n) => n as u32,
            Value::Obj(id) if id.generation == 0 => id.index,
            Value::Obj(_) | Value::Float(_) => return None,
            Value::Prop(p) => p.0 as u32,
            Value::SString(o)
            | Value::List(o)
            | Value::CodeOfs(o)
            | Value::FuncPtr(o) => o,
        };
        let d = data.to_le_bytes();
        Some([self.data_type() as u8, d[0], d[1], d[2], d[3]])
    }
}

// Identity comparison: floats compare by bit pattern so `Value` can key
// lookup tables. Language-level equality is implemented by the interpreter.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty)
            | (Value::Nil, Value::Nil)
            | (Value::True, Value::True) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Obj(a), Value::Obj(b)) => a == b,
            (Value::Prop(a), Value::Prop(b)) => a == b,
            (Value::FuncPtr(a), Value::FuncPtr(b))
            | (Value::CodeOfs(a), Value::CodeOfs(b))
            | (Value::SString(a), Value::SString(b))
            | (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.data_type() as u8).hash(state);
        match self {
            Value::Empty | Value::Nil | Value::True => {}
            Value::Int(n) => n.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Obj(id) => id.hash(state),
            Value::Prop(p) => p.hash(state),
            Value::FuncPtr(o)
            | Value::CodeOfs(o)
            | Value::SString(o)
            | Value::List(o) => o.hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "Empty"),
            Value::Nil => write!(f, "nil"),
            Value::True => write!(f, "true"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Obj(id) => write!(f, "{id:?}"),
            Value::Prop(p) => write!(f, "&prop#{}", p.0),
            Value::FuncPtr(o) => write!(f, "FuncPtr(0x{o:x})"),
            Value::CodeOfs(o) => write!(f, "CodeOfs(0x{o:x})"),
            Value::SString(o) => write!(f, "SString(0x{o:x})"),
            Value::List(o) => write!(f, "List(0x{o:x})"),
        }
    }
}
