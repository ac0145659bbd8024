//! `vector`: mutable sequences. Every change goes through the object
//! table so it is undoable.

use object::{Body, MetaclassId, Value};

use super::list::{position_of, read_values};
use super::{NativeMethod, arg, expect_int, expect_obj, zero_based};
use crate::VM;
use crate::error::{Fault, VmError, VmResult};

pub static METHODS: &[NativeMethod] = &[
    NativeMethod::new("length", 0, 0, length),
    NativeMethod::new("append", 1, 1, append),
    NativeMethod::new("removeElementAt", 1, 1, remove_element_at),
    NativeMethod::new("toList", 0, 0, to_list),
    NativeMethod::new("indexOf", 1, 1, index_of),
];

/// Same layout as a list.
pub fn load(data: &[u8]) -> VmResult<Body> {
    read_values(data).map(Body::Vector)
}

pub fn create(vm: &mut VM, meta: MetaclassId, args: &[Value]) -> Result<Value, Fault> {
    for &v in args {
        vm.heap.retain_value(v);
    }
    Ok(vm.alloc(meta, Body::Vector(args.to_vec()))?)
}

fn items(vm: &mut VM, this: Value) -> Result<Vec<Value>, Fault> {
    match vm.heap.deref(expect_obj(this)?)?.body {
        Body::Vector(ref items) => Ok(items.clone()),
        _ => Err(VmError::bad_type("vector").into()),
    }
}

fn length(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Int(items(vm, this)?.len() as i32))
}

fn append(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let len = items(vm, this)?.len();
    let id = expect_obj(this)?;
    let value = vm.owned(arg(args, 0)?);
    if let Err(e) = vm.heap.insert_element(id, len, value) {
        vm.heap.release_value(value);
        return Err(e.into());
    }
    Ok(vm.owned(this))
}

fn remove_element_at(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let len = items(vm, this)?.len();
    let index = zero_based(expect_int(arg(args, 0)?)?, len)?;
    Ok(vm.heap.remove_element(expect_obj(this)?, index)?)
}

fn to_list(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let items = items(vm, this)?;
    Ok(vm.new_list(&items)?)
}

fn index_of(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let items = items(vm, this)?;
    position_of(vm, &items, arg(args, 0)?)
}
