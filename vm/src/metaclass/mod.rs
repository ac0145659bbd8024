//! Metaclasses: the native implementations behind every object kind.
//!
//! The image names the metaclasses it depends on (`MCLD`) together with the
//! property ids it uses for their native methods. A loaded metaclass binds
//! those ids to entries of the descriptor's method table.

use ahash::AHashMap;
use object::{Body, MetaclassId, ObjectId, PropId, Value};

use crate::VM;
use crate::codec::ByteReader;
use crate::dependency::{Version, negotiate, parse_dependency};
use crate::error::{ErrorCode, Fault, VmError, VmResult};

pub mod list;
pub mod lookup_table;
pub mod string;
pub mod tads_object;
pub mod vector;

/// A native method: receives `self` and the arguments, returns an owned
/// result.
pub type NativeFn = fn(&mut VM, Value, &[Value]) -> Result<Value, Fault>;

/// Decodes the image data of one object.
pub type LoadFn = fn(&[u8]) -> VmResult<Body>;

/// Implements `New` for a metaclass. Arguments are borrowed.
pub type CreateFn = fn(&mut VM, MetaclassId, &[Value]) -> Result<Value, Fault>;

#[derive(Clone, Copy)]
pub struct NativeMethod {
    pub name: &'static str,
    pub min_args: u8,
    pub max_args: u8,
    pub func: NativeFn,
}

impl NativeMethod {
    pub const fn new(name: &'static str, min_args: u8, max_args: u8, func: NativeFn) -> Self {
        Self {
            name,
            min_args,
            max_args,
            func,
        }
    }

    pub fn check_args(&self, argc: usize) -> Result<(), Fault> {
        if (self.min_args as usize..=self.max_args as usize).contains(&argc) {
            Ok(())
        } else {
            Err(ErrorCode::WrongArgCount.into())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKind {
    TadsObject,
    List,
    Vector,
    Str,
    LookupTable,
}

impl MetaKind {
    pub fn of(body: &Body) -> Self {
        match body {
            Body::Tads(_) => MetaKind::TadsObject,
            Body::List(_) => MetaKind::List,
            Body::Vector(_) => MetaKind::Vector,
            Body::Str(_) => MetaKind::Str,
            Body::LookupTable(_) => MetaKind::LookupTable,
        }
    }
}

pub struct MetaclassDesc {
    pub name: &'static str,
    pub version: Version,
    pub kind: MetaKind,
    pub methods: &'static [NativeMethod],
    pub load: LoadFn,
    pub create: CreateFn,
}

pub static BUILTIN_METACLASSES: &[MetaclassDesc] = &[
    MetaclassDesc {
        name: "tads-object",
        version: Version(30005),
        kind: MetaKind::TadsObject,
        methods: tads_object::METHODS,
        load: tads_object::load,
        create: tads_object::create,
    },
    MetaclassDesc {
        name: "list",
        version: Version(30008),
        kind: MetaKind::List,
        methods: list::METHODS,
        load: list::load,
        create: list::create,
    },
    MetaclassDesc {
        name: "vector",
        version: Version(30005),
        kind: MetaKind::Vector,
        methods: vector::METHODS,
        load: vector::load,
        create: vector::create,
    },
    MetaclassDesc {
        name: "string",
        version: Version(30008),
        kind: MetaKind::Str,
        methods: string::METHODS,
        load: string::load,
        create: string::create,
    },
    MetaclassDesc {
        name: "lookuptable",
        version: Version(30003),
        kind: MetaKind::LookupTable,
        methods: lookup_table::METHODS,
        load: lookup_table::load,
        create: lookup_table::create,
    },
];

/// Metaclasses the interpreter creates objects of on its own.
const REQUIRED: &[MetaKind] = &[
    MetaKind::TadsObject,
    MetaKind::List,
    MetaKind::Str,
    MetaKind::Vector,
];

pub fn find_desc(name: &str) -> Option<&'static MetaclassDesc> {
    BUILTIN_METACLASSES.iter().find(|d| d.name == name)
}

fn desc_of(kind: MetaKind) -> &'static MetaclassDesc {
    // Every kind has exactly one descriptor.
    match kind {
        MetaKind::TadsObject => &BUILTIN_METACLASSES[0],
        MetaKind::List => &BUILTIN_METACLASSES[1],
        MetaKind::Vector => &BUILTIN_METACLASSES[2],
        MetaKind::Str => &BUILTIN_METACLASSES[3],
        MetaKind::LookupTable => &BUILTIN_METACLASSES[4],
    }
}

/// One entry of the metaclass table.
pub struct LoadedMetaclass {
    pub desc: &'static MetaclassDesc,
    pub requested: Version,
    /// Property ids in method-table order, as listed by the image.
    pub props: Vec<PropId>,
    bindings: AHashMap<PropId, usize>,
}

impl LoadedMetaclass {
    fn new(desc: &'static MetaclassDesc, requested: Version, props: Vec<PropId>) -> Self {
        let bindings = props
            .iter()
            .enumerate()
            .filter(|(i, p)| p.is_valid() && *i < desc.methods.len())
            .map(|(i, &p)| (p, i))
            .collect();
        Self {
            desc,
            requested,
            props,
            bindings,
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn native(&self, prop: PropId) -> Option<&'static NativeMethod> {
        let desc = self.desc;
        self.bindings.get(&prop).map(|&i| &desc.methods[i])
    }
}

/// The image's metaclass dependency table, indexed by `MetaclassId`.
#[derive(Default)]
pub struct MetaclassTable {
    entries: Vec<LoadedMetaclass>,
}

impl MetaclassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve one `MCLD` entry.
    pub fn add_dependency(&mut self, dep: &str, props: Vec<PropId>) -> VmResult<MetaclassId> {
        let (name, requested) = parse_dependency(dep, "MCLD")?;
        let desc = find_desc(&name)
            .ok_or_else(|| VmError::new(ErrorCode::UnknownMetaclass).arg(&name))?;
        negotiate(&name, requested, &[desc.version])?;
        let id = MetaclassId(self.entries.len() as u16);
        self.entries.push(LoadedMetaclass::new(desc, requested, props));
        Ok(id)
    }

    /// Append the metaclasses the interpreter relies on that the image did
    /// not name.
    pub fn ensure_required(&mut self) {
        for &kind in REQUIRED {
            if !self.entries.iter().any(|e| e.desc.kind == kind) {
                let desc = desc_of(kind);
                log::debug!("adding implicit metaclass {}", desc.name);
                self.entries
                    .push(LoadedMetaclass::new(desc, desc.version, Vec::new()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: MetaclassId) -> Option<&LoadedMetaclass> {
        self.entries.get(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedMetaclass> {
        self.entries.iter()
    }

    /// First table entry implementing `kind`.
    pub fn id_of(&self, kind: MetaKind) -> VmResult<MetaclassId> {
        self.entries
            .iter()
            .position(|e| e.desc.kind == kind)
            .map(|i| MetaclassId(i as u16))
            .ok_or_else(|| VmError::internal(format!("no {kind:?} metaclass loaded")))
    }

    pub fn id_by_name(&self, name: &str) -> Option<MetaclassId> {
        self.entries
            .iter()
            .position(|e| e.desc.name == name)
            .map(|i| MetaclassId(i as u16))
    }

    /// Native method bound to `prop` for objects of `meta`.
    pub fn native(&self, meta: MetaclassId, prop: PropId) -> Option<&'static NativeMethod> {
        self.get(meta).and_then(|m| m.native(prop))
    }

    /// Native method bound to `prop` by any entry implementing `kind`.
    /// Used for constant strings and lists, which have no object.
    pub fn native_for_kind(&self, kind: MetaKind, prop: PropId) -> Option<&'static NativeMethod> {
        self.entries
            .iter()
            .filter(|e| e.desc.kind == kind)
            .find_map(|e| e.native(prop))
    }
}

// ── Argument helpers ──────────────────────────────────────────────────

pub(crate) fn arg(args: &[Value], i: usize) -> Result<Value, Fault> {
    args.get(i)
        .copied()
        .ok_or_else(|| ErrorCode::WrongArgCount.into())
}

pub(crate) fn expect_int(v: Value) -> Result<i32, Fault> {
    v.as_int()
        .ok_or_else(|| VmError::bad_type("integer").into())
}

pub(crate) fn expect_obj(v: Value) -> Result<ObjectId, Fault> {
    v.as_obj().ok_or_else(|| VmError::bad_type("object").into())
}

/// Convert a 1-based index into a 0-based one.
pub(crate) fn zero_based(index: i32, len: usize) -> Result<usize, Fault> {
    if index < 1 || index as usize > len {
        return Err(VmError::new(ErrorCode::IndexOutOfRange).arg(index).into());
    }
    Ok(index as usize - 1)
}

/// Reader over one object's image data. Load errors carry only the reason;
/// the image loader adds the object id.
pub(crate) fn object_reader(data: &[u8]) -> ByteReader<'_> {
    ByteReader::new(data, bad_data("truncated or malformed"))
}

pub(crate) fn bad_data(reason: &str) -> VmError {
    VmError::new(ErrorCode::BadObjectData).arg(reason)
}
