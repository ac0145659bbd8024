//! `lookuptable`: insertion-ordered key/value map. Keys match by identity.

use object::{Body, MetaclassId, Value};

use super::{NativeMethod, arg, bad_data, expect_obj, object_reader};
use crate::VM;
use crate::codec::{put_portable, put_u16};
use crate::error::{ErrorCode, Fault, VmError, VmResult};

pub static METHODS: &[NativeMethod] = &[
    NativeMethod::new("isKeyPresent", 1, 1, is_key_present),
    NativeMethod::new("removeElement", 1, 1, remove_element),
    NativeMethod::new("keysToList", 0, 0, keys_to_list),
    NativeMethod::new("valsToList", 0, 0, vals_to_list),
    NativeMethod::new("entryCount", 0, 0, entry_count),
];

/// Image data: `u16` count + (key, value) portable pairs.
pub fn load(data: &[u8]) -> VmResult<Body> {
    let mut r = object_reader(data);
    let count = r.u16()? as usize;
    let mut entries: Vec<(Value, Value)> = Vec::with_capacity(count);
    for _ in 0..count {
        let key = r.portable()?;
        let value = r.portable()?;
        if entries.iter().any(|(k, _)| *k == key) {
            return Err(bad_data("duplicate lookup table key"));
        }
        entries.push((key, value));
    }
    if !r.is_empty() {
        return Err(bad_data("trailing bytes after table entries"));
    }
    Ok(Body::LookupTable(entries))
}

pub fn encode(entries: &[(Value, Value)]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u16(&mut out, entries.len() as u16);
    for &(k, v) in entries {
        put_portable(&mut out, k);
        put_portable(&mut out, v);
    }
    out
}

/// `new LookupTable(k1, v1, k2, v2, ...)`.
pub fn create(vm: &mut VM, meta: MetaclassId, args: &[Value]) -> Result<Value, Fault> {
    if args.len() % 2 != 0 {
        return Err(ErrorCode::WrongArgCount.into());
    }
    let mut entries: Vec<(Value, Value)> = Vec::with_capacity(args.len() / 2);
    for pair in args.chunks_exact(2) {
        match entries.iter_mut().find(|(k, _)| *k == pair[0]) {
            Some(entry) => entry.1 = pair[1],
            None => entries.push((pair[0], pair[1])),
        }
    }
    for &(k, v) in &entries {
        vm.heap.retain_value(k);
        vm.heap.retain_value(v);
    }
    Ok(vm.alloc(meta, Body::LookupTable(entries))?)
}

fn entries(vm: &mut VM, this: Value) -> Result<Vec<(Value, Value)>, Fault> {
    match vm.heap.deref(expect_obj(this)?)?.body {
        Body::LookupTable(ref entries) => Ok(entries.clone()),
        _ => Err(VmError::bad_type("lookup table").into()),
    }
}

fn is_key_present(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let key = arg(args, 0)?;
    Ok(Value::from_bool(
        entries(vm, this)?.iter().any(|(k, _)| *k == key),
    ))
}

/// Returns the removed value, or nil when the key was absent.
fn remove_element(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let key = arg(args, 0)?;
    let Some(value) = entries(vm, this)?
        .into_iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
    else {
        return Ok(Value::Nil);
    };
    let value = vm.owned(value);
    vm.heap.table_remove(expect_obj(this)?, key)?;
    Ok(value)
}

fn keys_to_list(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let keys: Vec<Value> = entries(vm, this)?.into_iter().map(|(k, _)| k).collect();
    Ok(vm.new_list(&keys)?)
}

fn vals_to_list(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let vals: Vec<Value> = entries(vm, this)?.into_iter().map(|(_, v)| v).collect();
    Ok(vm.new_list(&vals)?)
}

fn entry_count(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Int(entries(vm, this)?.len() as i32))
}
