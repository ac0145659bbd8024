//! `list`: immutable sequences. Constant lists in the constant pool share
//! these methods.

use object::{Body, MetaclassId, Value};

use super::{NativeMethod, arg, bad_data, expect_int, object_reader, zero_based};
use crate::VM;
use crate::codec::{put_portable, put_u16};
use crate::error::{Fault, VmResult};

pub static METHODS: &[NativeMethod] = &[
    NativeMethod::new("length", 0, 0, length),
    NativeMethod::new("car", 0, 0, car),
    NativeMethod::new("cdr", 0, 0, cdr),
    NativeMethod::new("indexOf", 1, 1, index_of),
    NativeMethod::new("append", 1, 1, append),
    NativeMethod::new("sublist", 1, 2, sublist),
];

/// Image data: `u16` count + portable values.
pub(crate) fn read_values(data: &[u8]) -> VmResult<Vec<Value>> {
    let mut r = object_reader(data);
    let count = r.u16()? as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(r.portable()?);
    }
    if !r.is_empty() {
        return Err(bad_data("trailing bytes after list elements"));
    }
    Ok(items)
}

pub fn load(data: &[u8]) -> VmResult<Body> {
    read_values(data).map(Body::List)
}

pub fn encode(items: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + items.len() * object::PORTABLE_SIZE);
    put_u16(&mut out, items.len() as u16);
    for &v in items {
        put_portable(&mut out, v);
    }
    out
}

pub fn create(vm: &mut VM, meta: MetaclassId, args: &[Value]) -> Result<Value, Fault> {
    for &v in args {
        vm.heap.retain_value(v);
    }
    Ok(vm.alloc(meta, Body::List(args.to_vec()))?)
}

fn length(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let items = vm.expect_list(this)?;
    Ok(Value::Int(items.len() as i32))
}

fn car(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let items = vm.expect_list(this)?;
    Ok(items.first().map_or(Value::Nil, |&v| vm.owned(v)))
}

fn cdr(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let items = vm.expect_list(this)?;
    if items.is_empty() {
        return Ok(Value::Nil);
    }
    Ok(vm.new_list(&items[1..])?)
}

/// 1-based position of the first element equal to `v`, or nil.
pub(crate) fn position_of(vm: &mut VM, items: &[Value], v: Value) -> Result<Value, Fault> {
    for (i, &item) in items.iter().enumerate() {
        if vm.values_equal(item, v)? {
            return Ok(Value::Int(i as i32 + 1));
        }
    }
    Ok(Value::Nil)
}

fn index_of(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let items = vm.expect_list(this)?;
    position_of(vm, &items, arg(args, 0)?)
}

fn append(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let mut items = vm.expect_list(this)?;
    items.push(arg(args, 0)?);
    Ok(vm.new_list(&items)?)
}

fn sublist(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let items = vm.expect_list(this)?;
    let start = expect_int(arg(args, 0)?)?;
    // One past the end yields an empty list.
    let from = if start as usize == items.len() + 1 {
        items.len()
    } else {
        zero_based(start, items.len())?
    };
    let rest = &items[from..];
    let take = match args.get(1) {
        Some(&len) => (expect_int(len)?.max(0) as usize).min(rest.len()),
        None => rest.len(),
    };
    Ok(vm.new_list(&rest[..take])?)
}
