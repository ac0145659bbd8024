//! `tads-gen`: general-purpose functions.

use std::cmp::Ordering;

use object::{Value, lookup};

use super::{FunctionSetDesc, IntrinsicDesc, VARARGS};
use crate::VM;
use crate::dependency::Version;
use crate::error::{ErrorCode, Fault, VmError};
use crate::host::Signal;
use crate::metaclass::{MetaKind, arg, expect_int, expect_obj};
use crate::values::as_f64;

pub static FUNCTION_SET: FunctionSetDesc = FunctionSetDesc {
    name: "tads-gen",
    versions: &[(Version(30006), 10), (Version(30008), 17)],
    functions: &[
        IntrinsicDesc::new("dataType", 1, 1, data_type),
        IntrinsicDesc::new("getArg", 1, 1, get_arg),
        IntrinsicDesc::new("firstObj", 0, 1, first_obj),
        IntrinsicDesc::new("nextObj", 1, 2, next_obj),
        IntrinsicDesc::new("toString", 1, 1, to_string),
        IntrinsicDesc::new("toInteger", 1, 1, to_integer),
        IntrinsicDesc::new("getTime", 0, 0, get_time),
        IntrinsicDesc::new("savepoint", 0, 0, savepoint),
        IntrinsicDesc::new("undo", 0, 0, undo),
        IntrinsicDesc::new("sum", 1, VARARGS, sum),
        IntrinsicDesc::new("max", 1, VARARGS, max),
        IntrinsicDesc::new("min", 1, VARARGS, min),
        IntrinsicDesc::new("toFloat", 1, 1, to_float),
        IntrinsicDesc::new("restartGame", 0, 0, restart_game),
        IntrinsicDesc::new("quit", 0, 0, quit),
        IntrinsicDesc::new("saveState", 1, 1, save_state),
        IntrinsicDesc::new("restoreState", 1, 1, restore_state),
    ],
};

fn bad_argument(what: impl std::fmt::Display) -> Fault {
    VmError::new(ErrorCode::BadArgument).arg(what).into()
}

fn data_type(_vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Int(arg(args, 0)?.data_type() as i32))
}

/// Argument `n` (1-based) of the calling function.
fn get_arg(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let n = expect_int(arg(args, 0)?)?;
    let value = n
        .checked_sub(1)
        .and_then(|i| usize::try_from(i).ok())
        .and_then(|i| vm.stack.frame_arg(i))
        .ok_or_else(|| Fault::from(VmError::new(ErrorCode::IndexOutOfRange).arg(n)))?;
    Ok(vm.owned(value))
}

/// Next program object after `after`, optionally restricted to instances
/// of `class`.
fn scan_objects(vm: &mut VM, mut after: Option<object::ObjectId>, class: Option<Value>) -> Result<Value, Fault> {
    let class = class.map(expect_obj).transpose()?;
    while let Some(id) = vm.heap.next_id(after) {
        after = Some(id);
        let is_program_object = vm.kind_of(Value::Obj(id)) == Some(MetaKind::TadsObject);
        let matches = class.is_none_or(|c| c != id && lookup::is_instance_of(&vm.heap, id, c));
        if is_program_object && matches {
            return Ok(vm.owned(Value::Obj(id)));
        }
    }
    Ok(Value::Nil)
}

fn first_obj(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    scan_objects(vm, None, args.first().copied())
}

fn next_obj(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let after = expect_obj(arg(args, 0)?)?;
    scan_objects(vm, Some(after), args.get(1).copied())
}

fn to_string(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let text = vm.display_string(arg(args, 0)?)?;
    Ok(vm.new_string(text)?)
}

fn to_integer(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let v = arg(args, 0)?;
    let n = match v {
        Value::Int(n) => n,
        Value::True => 1,
        Value::Nil => 0,
        Value::Float(x) => {
            let t = x.trunc();
            if !(i32::MIN as f64..=i32::MAX as f64).contains(&t) {
                return Err(ErrorCode::NumericOverflow.into());
            }
            t as i32
        }
        _ => {
            let text = vm.expect_string(v)?;
            text.trim()
                .parse()
                .map_err(|_| bad_argument(format!("\"{text}\" is not an integer")))?
        }
    };
    Ok(Value::Int(n))
}

fn to_float(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let v = arg(args, 0)?;
    let x = match v {
        Value::Int(n) => n as f64,
        Value::Float(x) => x,
        _ => {
            let text = vm.expect_string(v)?;
            text.trim()
                .parse()
                .map_err(|_| bad_argument(format!("\"{text}\" is not a number")))?
        }
    };
    Ok(Value::Float(x))
}

/// Milliseconds since the VM started, wrapping within the integer range.
fn get_time(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Int((vm.host.get_time_ms() & i32::MAX as u64) as i32))
}

fn savepoint(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Int(vm.heap.begin_savepoint().0 as i32))
}

fn undo(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::from_bool(vm.heap.undo_last()))
}

/// The values a numeric aggregate works on: a single list argument
/// contributes its elements, otherwise the arguments themselves.
fn operands(vm: &mut VM, args: &[Value]) -> Result<Vec<Value>, Fault> {
    if let [single] = args
        && let Some(items) = vm.list_items(*single)?
    {
        return Ok(items);
    }
    Ok(args.to_vec())
}

fn sum(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let mut total = Value::Int(0);
    for v in operands(vm, args)? {
        total = match (total, v) {
            (Value::Int(a), Value::Int(b)) => Value::Int(
                a.checked_add(b)
                    .ok_or_else(|| Fault::from(ErrorCode::NumericOverflow))?,
            ),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let f = as_f64(total) + as_f64(v);
                if !f.is_finite() {
                    return Err(ErrorCode::NumericOverflow.into());
                }
                Value::Float(f)
            }
            _ => return Err(VmError::bad_type("number").into()),
        };
    }
    Ok(total)
}

fn extreme(vm: &mut VM, args: &[Value], keep: Ordering) -> Result<Value, Fault> {
    let values = operands(vm, args)?;
    let Some((&first, rest)) = values.split_first() else {
        return Err(bad_argument("empty list"));
    };
    let mut best = first;
    for &v in rest {
        if vm.compare_values(v, best)? == keep {
            best = v;
        }
    }
    Ok(vm.owned(best))
}

fn max(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    extreme(vm, args, Ordering::Greater)
}

fn min(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    extreme(vm, args, Ordering::Less)
}

fn restart_game(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    vm.interrupt.signal(Signal::Restart);
    Ok(Value::Nil)
}

fn quit(vm: &mut VM, _args: &[Value]) -> Result<Value, Fault> {
    vm.interrupt.signal(Signal::Quit);
    Ok(Value::Nil)
}

fn save_state(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name = vm.expect_string(arg(args, 0)?)?;
    vm.save_to_host(&name)?;
    Ok(Value::True)
}

fn restore_state(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name = vm.expect_string(arg(args, 0)?)?;
    vm.restore_from_host(&name)?;
    Ok(Value::True)
}
