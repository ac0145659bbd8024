//! `t3vm`: VM introspection and control.

use object::Value;

use super::{FunctionSetDesc, IntrinsicDesc};
use crate::VM;
use crate::dependency::Version;
use crate::error::Fault;
use crate::metaclass::arg;

/// Major, minor and patch level packed as `0x00MMmmpp`.
pub const VM_VERSION: i32 = 0x0001_0000;
pub const VM_ID: &str = "t3vm-rs";

pub static FUNCTION_SET: FunctionSetDesc = FunctionSetDesc {
    name: "t3vm",
    versions: &[(Version(10004), 4), (Version(10006), 6)],
    functions: &[
        IntrinsicDesc::new("t3RunGC", 0, 0, run_gc),
        IntrinsicDesc::new("t3GetVMVsn", 0, 0, get_vm_vsn),
        IntrinsicDesc::new("t3GetVMID", 0, 0, get_vm_id),
        IntrinsicDesc::new("t3DebugTrace", 1, super::VARARGS, debug_trace),
        IntrinsicDesc::new("t3GetStackDepth", 0, 0, get_stack_depth),
        IntrinsicDesc::new("t3GetGlobalSymbol", 1, 1, get_global_symbol),
    ],
};

fn run_gc(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    vm.collect_garbage();
    Ok(Value::Nil)
}

fn get_vm_vsn(_vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Int(VM_VERSION))
}

fn get_vm_id(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    Ok(vm.new_string(VM_ID.to_string())?)
}

/// Mode 1 asks whether a debugger is attached; other modes log their
/// arguments.
fn debug_trace(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    if arg(args, 0)? == Value::Int(1) {
        return Ok(Value::Nil);
    }
    let mut parts = Vec::with_capacity(args.len());
    for &v in args {
        parts.push(vm.display_string(v)?);
    }
    log::debug!("t3DebugTrace: {}", parts.join(" "));
    Ok(Value::Nil)
}

fn get_stack_depth(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Int(vm.stack.depth() as i32))
}

fn get_global_symbol(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name = vm.expect_string(arg(args, 0)?)?;
    Ok(match vm.exports.get(&name).copied() {
        Some(v) => vm.owned(v),
        None => Value::Nil,
    })
}
