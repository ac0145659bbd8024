//! `tads-object`: program-defined objects with superclasses and a property
//! table.

use object::{Body, MetaclassId, ObjectId, PropId, PropTable, TadsObject, Value, lookup};

use super::{NativeMethod, arg, bad_data, expect_obj, object_reader};
use crate::VM;
use crate::codec::{put_portable, put_u16, put_u32};
use crate::error::{Fault, VmError, VmResult};

pub static METHODS: &[NativeMethod] = &[
    NativeMethod::new("createInstance", 0, u8::MAX, create_instance),
    NativeMethod::new("ofKind", 1, 1, of_kind),
    NativeMethod::new("getSuperclassList", 0, 0, get_superclass_list),
    NativeMethod::new("propDefined", 1, 1, prop_defined),
];

/// Image data: `sc_count:u16`, `prop_count:u16`, `flags:u16`, superclass
/// ids, then `prop:u16` + portable value pairs.
pub fn load(data: &[u8]) -> VmResult<Body> {
    let mut r = object_reader(data);
    let sc_count = r.u16()? as usize;
    let prop_count = r.u16()? as usize;
    let _flags = r.u16()?;
    let mut superclasses = Vec::with_capacity(sc_count);
    for _ in 0..sc_count {
        superclasses.push(ObjectId::persistent(r.u32()?));
    }
    let mut props = PropTable::with_capacity(prop_count);
    for _ in 0..prop_count {
        let prop = PropId(r.u16()?);
        let value = r.portable()?;
        if !prop.is_valid() {
            return Err(bad_data("property id 0"));
        }
        if props.set(prop, value).is_some() {
            return Err(bad_data("property defined twice"));
        }
    }
    if !r.is_empty() {
        return Err(bad_data("trailing bytes after properties"));
    }
    Ok(Body::Tads(TadsObject {
        superclasses,
        props,
    }))
}

pub fn encode(superclasses: &[u32], props: &[(u16, Value)]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u16(&mut out, superclasses.len() as u16);
    put_u16(&mut out, props.len() as u16);
    put_u16(&mut out, 0);
    for &sc in superclasses {
        put_u32(&mut out, sc);
    }
    for &(prop, value) in props {
        put_u16(&mut out, prop);
        put_portable(&mut out, value);
    }
    out
}

/// `new` takes the superclasses as arguments. Constructors are not run.
pub fn create(vm: &mut VM, meta: MetaclassId, args: &[Value]) -> Result<Value, Fault> {
    let mut superclasses = Vec::with_capacity(args.len());
    for &v in args {
        let id = expect_obj(v)?;
        vm.heap.deref(id)?;
        superclasses.push(id);
    }
    for &sc in &superclasses {
        vm.heap.retain(sc);
    }
    let body = Body::Tads(TadsObject {
        superclasses,
        props: PropTable::new(),
    });
    Ok(vm.alloc(meta, body)?)
}

fn create_instance(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let class = expect_obj(this)?;
    vm.heap.deref(class)?;
    Ok(Value::Obj(vm.new_tads(vec![class])?))
}

fn of_kind(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let obj = expect_obj(this)?;
    let Some(class) = arg(args, 0)?.as_obj() else {
        return Ok(Value::Nil);
    };
    Ok(Value::from_bool(lookup::is_instance_of(&vm.heap, obj, class)))
}

fn get_superclass_list(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let obj = vm.heap.deref(expect_obj(this)?)?;
    let supers: Vec<Value> = obj.superclasses().iter().map(|&id| Value::Obj(id)).collect();
    Ok(vm.new_list(&supers)?)
}

fn prop_defined(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let obj = expect_obj(this)?;
    let prop = arg(args, 0)?
        .as_prop()
        .ok_or_else(|| VmError::bad_type("property"))?;
    let meta = vm.heap.deref(obj)?.metaclass();
    let found = lookup::lookup(&vm.heap, obj, prop).is_found()
        || vm.metaclasses.native(meta, prop).is_some();
    Ok(Value::from_bool(found))
}
