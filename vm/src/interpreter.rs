//! The bytecode interpreter.
//!
//! A single loop fetches the instruction at the innermost frame's ip,
//! decodes it and executes it. Instructions report failures as [`Fault`]s:
//! fatal errors stop the loop, program errors become exception objects, and
//! exceptions unwind frames until a handler covers the faulting
//! instruction.

use bytecode::method::parse_exception_table;
use bytecode::{Instruction, MethodHeader};
use object::{Body, LookupResult, MetaclassId, ObjectId, PropId, Value, lookup};

use crate::VM;
use crate::error::{ErrorCode, Fault, VmError, VmResult};
use crate::host::Signal;
use crate::metaclass::{MetaKind, NativeMethod, expect_int, zero_based};
use crate::stack::Frame;
use crate::values::as_f64;

/// Why the loop stopped without producing a value.
#[derive(Debug)]
pub(crate) enum Halt {
    Error(VmError),
    Signal(Signal),
}

impl From<VmError> for Halt {
    fn from(e: VmError) -> Self {
        Halt::Error(e)
    }
}

enum Flow {
    Next,
    /// The current method returned this owned value.
    Return(Value),
}

// ── Frames ────────────────────────────────────────────────────────────

fn no_frame() -> VmError {
    VmError::internal("no active frame")
}

fn current(vm: &VM) -> VmResult<&Frame> {
    vm.stack.current().ok_or_else(no_frame)
}

pub(crate) fn read_header(vm: &mut VM, method: u32) -> VmResult<MethodHeader> {
    let bytes = vm.pools.read_code(method, MethodHeader::SIZE)?;
    Ok(MethodHeader::parse(&bytes)?)
}

fn release_refs(vm: &mut VM, self_val: Value, defining: Option<ObjectId>) {
    vm.heap.release_value(self_val);
    if let Some(d) = defining {
        vm.heap.release(d);
    }
}

/// Start the method at code offset `method`, taking the top `argc` stack
/// values as its arguments. `self_val` and `defining` are owned and move
/// into the new frame.
pub(crate) fn enter(
    vm: &mut VM,
    method: u32,
    argc: usize,
    self_val: Value,
    defining: Option<ObjectId>,
    target: Option<PropId>,
) -> Result<(), Fault> {
    let header = match read_header(vm, method) {
        Ok(header) => header,
        Err(e) => {
            release_refs(vm, self_val, defining);
            return Err(e.into());
        }
    };
    if !header.accepts(argc) || vm.stack.top(argc).is_err() {
        release_refs(vm, self_val, defining);
        return Err(ErrorCode::WrongArgCount.into());
    }
    let local_base = vm.stack.len();
    let arg_base = local_base - argc;
    for _ in 0..header.locals {
        if let Err((fault, _)) = vm.stack.push(Value::Nil) {
            vm.stack.truncate(local_base);
            release_refs(vm, self_val, defining);
            return Err(fault);
        }
    }
    let frame = Frame {
        method,
        header,
        insn_start: method,
        ip: method + vm.entry.method_header_size as u32,
        self_val,
        defining,
        target,
        argc,
        arg_base,
        local_base,
        stack_base: local_base + header.locals as usize,
    };
    if let Err((fault, frame)) = vm.stack.push_frame(frame) {
        vm.stack.truncate(local_base);
        release_refs(vm, frame.self_val, frame.defining);
        return Err(fault);
    }
    vm.pools.code().pin(method);
    log::trace!("enter {method:#x} ({argc} args), depth {}", vm.stack.depth());
    Ok(())
}

/// Pop the innermost frame, releasing its arguments, locals, operands and
/// references. Returns false if there was none.
pub(crate) fn pop_frame(vm: &mut VM) -> bool {
    let Some(frame) = vm.stack.pop_frame() else {
        return false;
    };
    let spent = vm.stack.truncate(frame.arg_base);
    vm.heap.release_values(spent);
    release_refs(vm, frame.self_val, frame.defining);
    vm.pools.code().unpin(frame.method);
    true
}

/// Pop frames until only `floor` remain.
pub(crate) fn discard_frames(vm: &mut VM, floor: usize) {
    while vm.stack.depth() > floor && pop_frame(vm) {}
}

fn push(vm: &mut VM, value: Value) -> Result<(), Fault> {
    vm.stack.push(value).map_err(|(fault, value)| {
        vm.heap.release_value(value);
        fault
    })
}

/// Move the top `n` values off the stack; the caller owns them.
fn pop_values(vm: &mut VM, n: usize) -> Result<Vec<Value>, Fault> {
    let values = vm.stack.top(n)?.to_vec();
    let len = vm.stack.len();
    vm.stack.truncate(len - n);
    Ok(values)
}

// ── Main loop ─────────────────────────────────────────────────────────

fn fetch(vm: &mut VM) -> VmResult<Instruction> {
    let ip = current(vm)?.ip;
    let (insn, len) = bytecode::decode(vm.pools.code().page_slice(ip)?)?;
    if let Some(frame) = vm.stack.current_mut() {
        frame.insn_start = ip;
        frame.ip = ip + len as u32;
    }
    Ok(insn)
}

/// Run until the frame count drops back to `floor`, returning the owned
/// value the last frame above it returned.
pub(crate) fn execute(vm: &mut VM, floor: usize) -> Result<Value, Halt> {
    while vm.stack.depth() > floor {
        if let Some(signal) = vm.interrupt.take() {
            log::debug!("{} requested", signal.name());
            return Err(Halt::Signal(signal));
        }
        if vm.heap.should_collect() {
            vm.collect_garbage();
        }

        let outcome = match fetch(vm) {
            Ok(insn) => {
                log::trace!("{:#07x}  {insn}", current(vm).map_or(0, |f| f.insn_start));
                step(vm, insn)
            }
            Err(e) => Err(e.into()),
        };
        let result = match outcome {
            Ok(Flow::Next) => Ok(None),
            Ok(Flow::Return(value)) => finish_return(vm, value, floor),
            Err(fault) => Err(fault),
        };
        match result {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(fault) => handle_fault(vm, fault, floor)?,
        }
    }
    Err(Halt::Error(VmError::internal("nothing to execute")))
}

fn finish_return(vm: &mut VM, value: Value, floor: usize) -> Result<Option<Value>, Fault> {
    pop_frame(vm);
    if vm.stack.depth() <= floor {
        return Ok(Some(value));
    }
    push(vm, value)?;
    Ok(None)
}

// ── Exceptions ────────────────────────────────────────────────────────

fn handle_fault(vm: &mut VM, fault: Fault, floor: usize) -> Result<(), Halt> {
    let exception = match fault {
        Fault::Thrown(value) => value,
        Fault::Error(e) if e.is_fatal() => return Err(Halt::Error(e)),
        Fault::Error(e) => raise(vm, e)?,
    };
    unwind(vm, exception, floor)
}

/// Turn a program error into an exception object.
fn raise(vm: &mut VM, error: VmError) -> VmResult<Value> {
    log::debug!("runtime error {error}");
    let superclasses = vm
        .special
        .runtime_error
        .filter(|&id| vm.heap.contains(id))
        .into_iter()
        .collect();
    let id = vm.new_tads(superclasses)?;
    if let Err(e) = describe_exception(vm, id, &error) {
        vm.heap.release(id);
        return Err(e);
    }
    vm.raised.insert(id, error);
    Ok(Value::Obj(id))
}

fn describe_exception(vm: &mut VM, id: ObjectId, error: &VmError) -> VmResult<()> {
    if let Some(prop) = vm.special.exception_message {
        let message = vm.messages.message(error);
        let text = vm.new_string(message)?;
        vm.heap.set_prop(id, prop, text)?;
    }
    if let Some(prop) = vm.special.errno {
        vm.heap
            .set_prop(id, prop, Value::Int(error.code.number() as i32))?;
    }
    Ok(())
}

/// Unwind to the nearest handler for the owned `exception`.
fn unwind(vm: &mut VM, exception: Value, floor: usize) -> Result<(), Halt> {
    while vm.stack.depth() > floor {
        match find_handler(vm, exception) {
            Ok(Some(handler)) => {
                let frame = current(vm)?;
                let (base, method) = (frame.stack_base, frame.method);
                let spent = vm.stack.truncate(base);
                vm.heap.release_values(spent);
                if let Some(frame) = vm.stack.current_mut() {
                    frame.ip = method + handler;
                }
                log::debug!("exception caught by handler at {:#x}", method + handler);
                return push(vm, exception).map_err(|_| Halt::Error(ErrorCode::StackOverflow.into()));
            }
            Ok(None) => {
                pop_frame(vm);
            }
            Err(e) => {
                vm.heap.release_value(exception);
                return Err(Halt::Error(e));
            }
        }
    }
    let error = unhandled(vm, exception);
    vm.heap.release_value(exception);
    Err(Halt::Error(error))
}

/// Handler offset (relative to the method) in the current frame that
/// catches `exception` at the current instruction.
fn find_handler(vm: &mut VM, exception: Value) -> VmResult<Option<u32>> {
    let frame = current(vm)?;
    if frame.header.exc_table == 0 {
        return Ok(None);
    }
    let at = frame.method_offset();
    let table = frame.method + frame.header.exc_table as u32;
    let entry_size = vm.entry.exc_entry_size as usize;
    let entries = parse_exception_table(vm.pools.code().page_slice(table)?, entry_size)?;
    for entry in entries {
        if !u16::try_from(at).is_ok_and(|at| entry.covers(at)) {
            continue;
        }
        let caught = entry.catches_everything()
            || exception.as_obj().is_some_and(|obj| {
                lookup::is_instance_of(&vm.heap, obj, ObjectId::persistent(entry.class))
            });
        if caught {
            return Ok(Some(entry.handler as u32));
        }
    }
    Ok(None)
}

fn unhandled(vm: &mut VM, exception: Value) -> VmError {
    let original = exception
        .as_obj()
        .and_then(|id| vm.raised.get(&id))
        .cloned();
    let message = match original {
        Some(error) => vm.messages.format(&error),
        None => describe_thrown(vm, exception),
    };
    VmError::new(ErrorCode::UnhandledException).arg(message)
}

/// Text of a program-thrown exception: its message property if it has one.
fn describe_thrown(vm: &mut VM, exception: Value) -> String {
    let message = exception
        .as_obj()
        .zip(vm.special.exception_message)
        .and_then(|(id, prop)| match lookup::lookup(&vm.heap, id, prop) {
            LookupResult::Found { value, .. } => Some(value),
            LookupResult::None => None,
        });
    match message {
        Some(v) => vm.display_string(v).unwrap_or_else(|_| format!("{v:?}")),
        None => format!("{exception:?}"),
    }
}

// ── Instructions ──────────────────────────────────────────────────────

fn step(vm: &mut VM, insn: Instruction) -> Result<Flow, Fault> {
    use Instruction as I;
    match insn {
        I::Nop => {}
        I::PushNil => push(vm, Value::Nil)?,
        I::PushTrue => push(vm, Value::True)?,
        I::PushInt { value } => push(vm, Value::Int(value))?,
        I::PushStr { ofs } => push(vm, Value::SString(ofs))?,
        I::PushList { ofs } => push(vm, Value::List(ofs))?,
        I::PushObj { id } => {
            let v = vm.owned(Value::Obj(ObjectId::persistent(id)));
            push(vm, v)?;
        }
        I::PushProp { prop } => push(vm, Value::Prop(PropId(prop)))?,
        I::PushFnPtr { ofs } => push(vm, Value::FuncPtr(ofs))?,
        I::PushSelf => {
            let v = owned_self(vm)?;
            push(vm, v)?;
        }
        I::GetArg { idx } => {
            let v = get_arg(vm, idx as usize)?;
            let v = vm.owned(v);
            push(vm, v)?;
        }
        I::GetLocal { idx } => {
            let at = local_slot(vm, idx)?;
            let v = vm.stack.get(at)?;
            let v = vm.owned(v);
            push(vm, v)?;
        }
        I::SetLocal { idx } => {
            let at = local_slot(vm, idx)?;
            let v = vm.stack.pop()?;
            let old = vm.stack.replace(at, v)?;
            vm.heap.release_value(old);
        }
        I::GetGlobal { idx } => {
            let v = *vm
                .globals
                .get(idx as usize)
                .ok_or_else(|| global_out_of_range(idx))?;
            let v = vm.owned(v);
            push(vm, v)?;
        }
        I::SetGlobal { idx } => {
            let v = vm.stack.pop()?;
            match vm.globals.get_mut(idx as usize) {
                Some(slot) => {
                    let old = std::mem::replace(slot, v);
                    vm.heap.release_value(old);
                }
                None => {
                    vm.heap.release_value(v);
                    return Err(global_out_of_range(idx));
                }
            }
        }
        I::Dup => {
            let v = vm.stack.peek(0)?;
            let v = vm.owned(v);
            push(vm, v)?;
        }
        I::Discard => {
            let v = vm.stack.pop()?;
            vm.heap.release_value(v);
        }
        I::Swap => {
            let [a, b] = two(pop_values(vm, 2)?)?;
            push(vm, b)?;
            push(vm, a)?;
        }
        I::Add | I::Sub | I::Mul | I::Div | I::Mod => {
            binary(vm, |vm, a, b| arithmetic(vm, insn, a, b))?;
        }
        I::Eq | I::Ne => binary(vm, |vm, a, b| {
            let equal = vm.values_equal(a, b)?;
            Ok(Value::from_bool(equal == matches!(insn, I::Eq)))
        })?,
        I::Lt | I::Le | I::Gt | I::Ge => binary(vm, |vm, a, b| {
            let ord = vm.compare_values(a, b)?;
            Ok(Value::from_bool(match insn {
                I::Lt => ord.is_lt(),
                I::Le => ord.is_le(),
                I::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        })?,
        I::Neg => {
            let a = vm.stack.pop()?;
            let result = negate(a);
            vm.heap.release_value(a);
            push(vm, result?)?;
        }
        I::Not => {
            let a = vm.stack.pop()?;
            vm.heap.release_value(a);
            push(vm, Value::from_bool(!a.is_true()))?;
        }
        I::Jmp { offset } => jump(vm, offset)?,
        I::Jt { offset } | I::Jf { offset } => {
            let cond = vm.stack.pop()?;
            vm.heap.release_value(cond);
            if cond.is_true() == matches!(insn, I::Jt { .. }) {
                jump(vm, offset)?;
            }
        }
        I::GetProp { prop } => {
            let target = vm.stack.pop()?;
            return invoke_property(vm, target, PropId(prop), 0);
        }
        I::GetPropSelf { prop } => {
            let target = owned_self(vm)?;
            return invoke_property(vm, target, PropId(prop), 0);
        }
        I::SetProp { prop } => {
            let [value, obj] = two(pop_values(vm, 2)?)?;
            set_property(vm, obj, PropId(prop), value)?;
        }
        I::SetPropSelf { prop } => {
            let value = vm.stack.pop()?;
            let obj = match owned_self(vm) {
                Ok(obj) => obj,
                Err(e) => {
                    vm.heap.release_value(value);
                    return Err(e);
                }
            };
            set_property(vm, obj, PropId(prop), value)?;
        }
        I::CallProp { argc, prop } => {
            let target = vm.stack.pop()?;
            return invoke_property(vm, target, PropId(prop), argc as usize);
        }
        I::CallPropSelf { argc, prop } => {
            let target = owned_self(vm)?;
            return invoke_property(vm, target, PropId(prop), argc as usize);
        }
        I::Inherited { argc, prop } => return inherited(vm, PropId(prop), argc as usize),
        I::Call { argc, ofs } => enter(vm, ofs, argc as usize, Value::Nil, None, None)?,
        I::PtrCall { argc } => match vm.stack.pop()? {
            Value::FuncPtr(ofs) => enter(vm, ofs, argc as usize, Value::Nil, None, None)?,
            Value::Prop(prop) => {
                let target = owned_self(vm)?;
                return invoke_property(vm, target, prop, argc as usize);
            }
            other => {
                vm.heap.release_value(other);
                return Err(VmError::bad_type("function pointer").into());
            }
        },
        I::Builtin { argc, func, set } => {
            let desc = vm.function_sets.resolve(set, func)?;
            desc.check_args(argc as usize)?;
            call_with_args(vm, argc as usize, |vm, args| (desc.func)(vm, args))?;
        }
        I::New { argc, meta } => {
            let meta = MetaclassId(meta);
            let create = vm
                .metaclasses
                .get(meta)
                .map(|m| m.desc.create)
                .ok_or_else(|| VmError::new(ErrorCode::BadMetaclassIndex).arg(meta.0))?;
            call_with_args(vm, argc as usize, |vm, args| create(vm, meta, args))?;
        }
        I::Index => binary(vm, index_value)?,
        I::SetIndex => {
            let values = pop_values(vm, 3)?;
            let result = match values[..] {
                [container, index, value] => store_index(vm, container, index, value),
                _ => Err(VmError::new(ErrorCode::StackUnderflow).into()),
            };
            vm.heap.release_values(values);
            push(vm, result?)?;
        }
        I::Return => return Ok(Flow::Return(vm.stack.pop()?)),
        I::RetNil => return Ok(Flow::Return(Value::Nil)),
        I::RetTrue => return Ok(Flow::Return(Value::True)),
        I::Throw => {
            let exception = vm.stack.pop()?;
            if exception.as_obj().is_none() {
                vm.heap.release_value(exception);
                return Err(VmError::bad_type("object").into());
            }
            return Err(Fault::Thrown(exception));
        }
    }
    Ok(Flow::Next)
}

fn two(values: Vec<Value>) -> Result<[Value; 2], Fault> {
    <[Value; 2]>::try_from(values).map_err(|_| VmError::new(ErrorCode::StackUnderflow).into())
}

fn owned_self(vm: &mut VM) -> Result<Value, Fault> {
    let v = current(vm)?.self_val;
    Ok(vm.owned(v))
}

fn get_arg(vm: &VM, idx: usize) -> Result<Value, Fault> {
    let frame = current(vm)?;
    if idx < frame.argc {
        return Ok(vm.stack.get(frame.arg_base + idx)?);
    }
    let declared = frame.header.argc as usize + frame.header.opt_argc as usize;
    if idx < declared {
        return Ok(Value::Empty);
    }
    Err(VmError::new(ErrorCode::IndexOutOfRange).arg(idx + 1).into())
}

fn local_slot(vm: &VM, idx: u16) -> VmResult<usize> {
    let frame = current(vm)?;
    if idx >= frame.header.locals {
        return Err(VmError::new(ErrorCode::BadBytecode)
            .arg(format!("local {idx} beyond the {} declared", frame.header.locals)));
    }
    Ok(frame.local_base + idx as usize)
}

fn global_out_of_range(idx: u16) -> Fault {
    VmError::new(ErrorCode::IndexOutOfRange)
        .arg(format!("global {idx}"))
        .into()
}

fn jump(vm: &mut VM, offset: i16) -> VmResult<()> {
    let frame = vm.stack.current_mut().ok_or_else(no_frame)?;
    let target = frame.ip as i64 + offset as i64;
    if target < frame.method as i64 || target > u32::MAX as i64 {
        return Err(VmError::new(ErrorCode::BadBytecode).arg("jump outside the method"));
    }
    frame.ip = target as u32;
    Ok(())
}

/// Pop two operands, apply `f` to them borrowed, release them and push the
/// owned result.
fn binary(
    vm: &mut VM,
    f: impl FnOnce(&mut VM, Value, Value) -> Result<Value, Fault>,
) -> Result<(), Fault> {
    let [a, b] = two(pop_values(vm, 2)?)?;
    let result = f(vm, a, b);
    vm.heap.release_value(a);
    vm.heap.release_value(b);
    push(vm, result?)
}

/// Call `f` with the top `argc` stack values, then drop them and push the
/// owned result.
fn call_with_args(
    vm: &mut VM,
    argc: usize,
    f: impl FnOnce(&mut VM, &[Value]) -> Result<Value, Fault>,
) -> Result<(), Fault> {
    let args = vm.stack.top(argc)?.to_vec();
    let result = f(vm, &args);
    let spent = pop_values(vm, argc)?;
    vm.heap.release_values(spent);
    push(vm, result?)
}

// ── Arithmetic ────────────────────────────────────────────────────────

fn arithmetic(vm: &mut VM, insn: Instruction, a: Value, b: Value) -> Result<Value, Fault> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int_arithmetic(insn, x, y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            float_arithmetic(insn, as_f64(a), as_f64(b))
        }
        _ => match insn {
            Instruction::Add => add_values(vm, a, b),
            Instruction::Sub => subtract_values(vm, a, b),
            _ => Err(VmError::bad_type("number").into()),
        },
    }
}

fn int_arithmetic(insn: Instruction, x: i32, y: i32) -> Result<Value, Fault> {
    let result = match insn {
        Instruction::Add => x.checked_add(y),
        Instruction::Sub => x.checked_sub(y),
        Instruction::Mul => x.checked_mul(y),
        Instruction::Div | Instruction::Mod if y == 0 => {
            return Err(ErrorCode::DivideByZero.into());
        }
        Instruction::Div => x.checked_div(y),
        _ => x.checked_rem(y),
    };
    result
        .map(Value::Int)
        .ok_or_else(|| ErrorCode::NumericOverflow.into())
}

fn float_arithmetic(insn: Instruction, x: f64, y: f64) -> Result<Value, Fault> {
    let result = match insn {
        Instruction::Add => x + y,
        Instruction::Sub => x - y,
        Instruction::Mul => x * y,
        Instruction::Div | Instruction::Mod if y == 0.0 => {
            return Err(ErrorCode::DivideByZero.into());
        }
        Instruction::Div => x / y,
        _ => x % y,
    };
    if !result.is_finite() {
        return Err(ErrorCode::NumericOverflow.into());
    }
    Ok(Value::Float(result))
}

/// `+` on strings concatenates; on lists it appends an element or
/// concatenates another list.
fn add_values(vm: &mut VM, a: Value, b: Value) -> Result<Value, Fault> {
    if let Some(left) = vm.string_value(a)? {
        let right = vm.display_string(b)?;
        return Ok(vm.new_string(left + &right)?);
    }
    if let Some(mut items) = vm.list_items(a)? {
        match vm.list_items(b)? {
            Some(more) => items.extend(more),
            None => items.push(b),
        }
        return Ok(vm.new_list(&items)?);
    }
    Err(VmError::bad_type("number").into())
}

/// `-` on lists removes every element equal to `b`, or to any element of
/// `b` if it is a list itself.
fn subtract_values(vm: &mut VM, a: Value, b: Value) -> Result<Value, Fault> {
    let Some(items) = vm.list_items(a)? else {
        return Err(VmError::bad_type("number").into());
    };
    let remove = vm.list_items(b)?.unwrap_or_else(|| vec![b]);
    let mut kept = Vec::with_capacity(items.len());
    'items: for v in items {
        for &r in &remove {
            if vm.values_equal(v, r)? {
                continue 'items;
            }
        }
        kept.push(v);
    }
    Ok(vm.new_list(&kept)?)
}

fn negate(a: Value) -> Result<Value, Fault> {
    match a {
        Value::Int(n) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ErrorCode::NumericOverflow.into()),
        Value::Float(x) => Ok(Value::Float(-x)),
        _ => Err(VmError::bad_type("number").into()),
    }
}

// ── Indexing ──────────────────────────────────────────────────────────

fn index_value(vm: &mut VM, container: Value, index: Value) -> Result<Value, Fault> {
    if let Some(Body::LookupTable(entries)) = container
        .as_obj()
        .and_then(|id| vm.heap.get(id))
        .map(|o| &o.body)
    {
        let found = entries
            .iter()
            .find(|(k, _)| *k == index)
            .map_or(Value::Nil, |&(_, v)| v);
        return Ok(vm.owned(found));
    }
    let Some(items) = vm.list_items(container)? else {
        return Err(VmError::bad_type("list").into());
    };
    let i = zero_based(expect_int(index)?, items.len())?;
    Ok(vm.owned(items[i]))
}

/// Store `value` at `index`. Vectors and lookup tables change in place;
/// lists are copied. All inputs are borrowed; the result is owned.
fn store_index(vm: &mut VM, container: Value, index: Value, value: Value) -> Result<Value, Fault> {
    if let Some(id) = container.as_obj() {
        let vector_len = match &vm.heap.deref(id)?.body {
            Body::Vector(items) => Some(items.len()),
            Body::LookupTable(_) => None,
            _ => return store_in_copy(vm, container, index, value),
        };
        match vector_len {
            Some(len) => {
                let i = zero_based(expect_int(index)?, len)?;
                let v = vm.owned(value);
                if let Err(e) = vm.heap.set_element(id, i, v) {
                    vm.heap.release_value(v);
                    return Err(e.into());
                }
            }
            None => {
                let (k, v) = (vm.owned(index), vm.owned(value));
                if let Err(e) = vm.heap.table_put(id, k, v) {
                    vm.heap.release_value(k);
                    vm.heap.release_value(v);
                    return Err(e.into());
                }
            }
        }
        return Ok(vm.owned(container));
    }
    store_in_copy(vm, container, index, value)
}

fn store_in_copy(vm: &mut VM, container: Value, index: Value, value: Value) -> Result<Value, Fault> {
    let Some(mut items) = vm.list_items(container)? else {
        return Err(VmError::bad_type("list").into());
    };
    let i = zero_based(expect_int(index)?, items.len())?;
    items[i] = value;
    Ok(vm.new_list(&items)?)
}

// ── Properties ────────────────────────────────────────────────────────

enum Resolved {
    Method { ofs: u32, holder: ObjectId },
    Data(Value),
    Native(&'static NativeMethod),
}

fn undefined(prop: PropId) -> Fault {
    VmError::new(ErrorCode::UndefinedProperty).arg(prop.0).into()
}

/// Find what evaluating `prop` on `target` means: an inherited method or
/// data value, or a native method of the target's metaclass.
fn resolve_property(vm: &VM, target: Value, prop: PropId) -> Result<Resolved, Fault> {
    let native = match target {
        Value::Obj(id) => {
            if let LookupResult::Found { holder, value } = lookup::lookup(&vm.heap, id, prop) {
                return Ok(match value {
                    Value::CodeOfs(ofs) => Resolved::Method { ofs, holder },
                    v => Resolved::Data(v),
                });
            }
            let meta = vm.heap.deref(id)?.metaclass();
            vm.metaclasses.native(meta, prop)
        }
        Value::SString(_) => vm.metaclasses.native_for_kind(MetaKind::Str, prop),
        Value::List(_) => vm.metaclasses.native_for_kind(MetaKind::List, prop),
        _ => return Err(VmError::bad_type("object").into()),
    };
    native.map(Resolved::Native).ok_or_else(|| undefined(prop))
}

/// Evaluate `prop` on the owned `target` with `argc` arguments on the
/// stack.
fn invoke_property(vm: &mut VM, target: Value, prop: PropId, argc: usize) -> Result<Flow, Fault> {
    match resolve_property(vm, target, prop) {
        Err(e) => {
            vm.heap.release_value(target);
            Err(e)
        }
        Ok(Resolved::Method { ofs, holder }) => {
            vm.heap.retain(holder);
            enter(vm, ofs, argc, target, Some(holder), Some(prop))?;
            Ok(Flow::Next)
        }
        Ok(Resolved::Data(value)) => {
            let value = vm.owned(value);
            vm.heap.release_value(target);
            if argc > 0 {
                vm.heap.release_value(value);
                return Err(ErrorCode::WrongArgCount.into());
            }
            push(vm, value)?;
            Ok(Flow::Next)
        }
        Ok(Resolved::Native(method)) => {
            call_native(vm, method, target, argc)?;
            Ok(Flow::Next)
        }
    }
}

fn call_native(vm: &mut VM, method: &'static NativeMethod, this: Value, argc: usize) -> Result<(), Fault> {
    let result = method
        .check_args(argc)
        .and_then(|()| call_with_args(vm, argc, |vm, args| (method.func)(vm, this, args)));
    vm.heap.release_value(this);
    result
}

/// Continue the search for `prop` past the running method's defining
/// object.
fn inherited(vm: &mut VM, prop: PropId, argc: usize) -> Result<Flow, Fault> {
    let frame = current(vm)?;
    let (self_val, defining) = (frame.self_val, frame.defining);
    let (Some(self_id), Some(defining)) = (self_val.as_obj(), defining) else {
        return Err(undefined(prop));
    };
    match lookup::lookup_inherited(&vm.heap, self_id, defining, prop) {
        LookupResult::Found {
            holder,
            value: Value::CodeOfs(ofs),
        } => {
            let this = vm.owned(self_val);
            vm.heap.retain(holder);
            enter(vm, ofs, argc, this, Some(holder), Some(prop))?;
        }
        LookupResult::Found { value, .. } => {
            if argc > 0 {
                return Err(ErrorCode::WrongArgCount.into());
            }
            let v = vm.owned(value);
            push(vm, v)?;
        }
        LookupResult::None => {
            let meta = vm.heap.deref(self_id)?.metaclass();
            let method = vm.metaclasses.native(meta, prop).ok_or_else(|| undefined(prop))?;
            let this = vm.owned(self_val);
            call_native(vm, method, this, argc)?;
        }
    }
    Ok(Flow::Next)
}

fn set_property(vm: &mut VM, obj: Value, prop: PropId, value: Value) -> Result<(), Fault> {
    let result = match obj {
        Value::Obj(id) => vm.heap.set_prop(id, prop, value).map_err(Fault::from),
        _ => Err(VmError::bad_type("object").into()),
    };
    if result.is_err() {
        vm.heap.release_value(value);
    }
    vm.heap.release_value(obj);
    result
}
