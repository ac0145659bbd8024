//! `tads-io`: console output through the host.

use object::Value;

use super::{FunctionSetDesc, IntrinsicDesc, VARARGS};
use crate::VM;
use crate::dependency::Version;
use crate::error::Fault;

pub static FUNCTION_SET: FunctionSetDesc = FunctionSetDesc {
    name: "tads-io",
    versions: &[(Version(30007), 1)],
    functions: &[IntrinsicDesc::new("say", 1, VARARGS, say)],
};

fn say(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let mut text = String::new();
    for &v in args {
        text.push_str(&vm.display_string(v)?);
    }
    vm.host.write_output(&text);
    Ok(Value::Nil)
}
