//! `string`: immutable text. Positions are 1-based and count characters.

use object::{Body, MetaclassId, Value};

use super::{NativeMethod, arg, bad_data, expect_int, object_reader, zero_based};
use crate::VM;
use crate::codec::put_u16;
use crate::error::{Fault, VmResult};

pub static METHODS: &[NativeMethod] = &[
    NativeMethod::new("length", 0, 0, length),
    NativeMethod::new("toUpper", 0, 0, to_upper),
    NativeMethod::new("toLower", 0, 0, to_lower),
    NativeMethod::new("substr", 1, 2, substr),
    NativeMethod::new("find", 1, 1, find),
];

/// Image data: `u16` byte length + UTF-8.
pub fn load(data: &[u8]) -> VmResult<Body> {
    let mut r = object_reader(data);
    let len = r.u16()? as usize;
    let text = r.str(len)?;
    if !r.is_empty() {
        return Err(bad_data("trailing bytes after string"));
    }
    Ok(Body::Str(text))
}

pub fn encode(text: &str) -> Vec<u8> {
    let mut end = text.len().min(u16::MAX as usize);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &text.as_bytes()[..end];
    let mut out = Vec::with_capacity(2 + bytes.len());
    put_u16(&mut out, bytes.len() as u16);
    out.extend_from_slice(bytes);
    out
}

/// `new string(a, b, ...)` concatenates the text forms of its arguments.
pub fn create(vm: &mut VM, meta: MetaclassId, args: &[Value]) -> Result<Value, Fault> {
    let mut text = String::new();
    for &v in args {
        text.push_str(&vm.display_string(v)?);
    }
    Ok(vm.alloc(meta, Body::Str(text))?)
}

fn length(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let text = vm.expect_string(this)?;
    Ok(Value::Int(text.chars().count() as i32))
}

fn to_upper(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let text = vm.expect_string(this)?;
    Ok(vm.new_string(text.to_uppercase())?)
}

fn to_lower(vm: &mut VM, this: Value, _args: &[Value]) -> Result<Value, Fault> {
    let text = vm.expect_string(this)?;
    Ok(vm.new_string(text.to_lowercase())?)
}

fn substr(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let chars: Vec<char> = vm.expect_string(this)?.chars().collect();
    let start = expect_int(arg(args, 0)?)?;
    let from = if start as usize == chars.len() + 1 {
        chars.len()
    } else {
        zero_based(start, chars.len())?
    };
    let rest = &chars[from..];
    let take = match args.get(1) {
        Some(&len) => (expect_int(len)?.max(0) as usize).min(rest.len()),
        None => rest.len(),
    };
    Ok(vm.new_string(rest[..take].iter().collect())?)
}

fn find(vm: &mut VM, this: Value, args: &[Value]) -> Result<Value, Fault> {
    let text = vm.expect_string(this)?;
    let needle = vm.expect_string(arg(args, 0)?)?;
    Ok(match text.find(&needle) {
        Some(byte) => Value::Int(text[..byte].chars().count() as i32 + 1),
        None => Value::Nil,
    })
}
