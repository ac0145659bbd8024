mod common;

use bytecode::{BytecodeBuilder, Op};
use heap::SavepointId;
use object::{Body, ObjectId, PropId, Value};
use t3vm::{ErrorCode, ExitStatus, PoolMode, Signal, VMCreateInfo};

use common::*;

fn completed(status: t3vm::VmResult<ExitStatus>) -> Value {
    match status {
        Ok(ExitStatus::Completed(v)) => v,
        other => panic!("run did not complete: {other:?}"),
    }
}

#[test]
fn sum_of_constant_list() {
    let mut w = writer();
    let list = w.list(&[Value::Int(1), Value::Int(2), Value::Int(3)]);
    let entry = w.code(&method(0, |b| {
        b.push_list(list);
        b.builtin(1, SUM, GEN);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, host) = load(&w);
    assert_eq!(completed(vm.run()), Value::Int(6));
    assert!(host.errors().is_empty());
}

#[test]
fn undo_without_savepoint_is_a_no_op() {
    let mut w = writer();
    let entry = w.code(&method(0, |b| {
        b.builtin(0, UNDO, GEN);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    assert_eq!(completed(vm.run()), Value::Nil);
}

#[test]
fn undo_rolls_back_to_savepoint() {
    let mut w = writer();
    w.tads_object(2, TADS, &[], &[(10, Value::Int(1))]);
    let entry = w.code(&method(0, |b| {
        b.builtin(0, SAVEPOINT, GEN);
        b.op(Op::Discard);
        b.push_int(5);
        b.push_obj(2);
        b.set_prop(10);
        b.builtin(0, UNDO, GEN);
        b.op(Op::Discard);
        b.push_obj(2);
        b.get_prop(10);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    assert_eq!(completed(vm.run()), Value::Int(1));
}

fn items_of(vm: &t3vm::VM, id: u32) -> Vec<Value> {
    match vm.heap().get(ObjectId::persistent(id)).map(|o| &o.body) {
        Some(Body::List(items) | Body::Vector(items)) => items.clone(),
        other => panic!("object {id} is not a list: {other:?}"),
    }
}

#[test]
fn persistent_list_sums_and_undo_restores_the_image_objects() {
    let mut w = bare_writer();
    w.list_object(1, LIST, &[Value::Int(1), Value::Int(2), Value::Int(3)]);
    w.list_object(2, VECTOR, &[Value::Int(1), Value::Int(2), Value::Int(3)]);
    let entry = w.code(&method(0, |b| {
        b.push_obj(1);
        b.builtin(1, SUM, GEN);
        b.op(Op::Return);
    }));
    let both = w.code(&method(0, |b| {
        b.push_obj(1);
        b.builtin(1, SUM, GEN);
        b.push_obj(2);
        b.builtin(1, SUM, GEN);
        b.op(Op::Add);
        b.op(Op::Return);
    }));
    w.symbol("both", Value::FuncPtr(both));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    let initial = vm.heap_mut().begin_savepoint();
    assert_eq!(completed(vm.run()), Value::Int(6));

    // Nothing was changed, so undoing is a no-op for the list.
    assert!(vm.heap_mut().undo_to(initial));
    assert_eq!(items_of(&vm, 1), [Value::Int(1), Value::Int(2), Value::Int(3)]);

    let initial = vm.heap_mut().begin_savepoint();
    vm.heap_mut()
        .set_element(ObjectId::persistent(2), 0, Value::Int(10))
        .unwrap();
    assert_eq!(vm.call_function("both", &[]).ok(), Some(Value::Int(21)));

    assert!(vm.heap_mut().undo_to(initial));
    assert_eq!(items_of(&vm, 1), [Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(items_of(&vm, 2), [Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(vm.call_function("both", &[]).ok(), Some(Value::Int(12)));
    assert_eq!(vm.heap().undo_log().savepoint_count(), 0);
}

#[test]
fn undo_to_an_earlier_savepoint_among_several() {
    let mut w = writer();
    w.tads_object(2, TADS, &[], &[(10, Value::Int(0))]);
    // Savepoint k is kept in global k, then p10 becomes k + 1.
    let entry = w.code(&method(0, |b| {
        for k in 0..4u16 {
            b.builtin(0, SAVEPOINT, GEN);
            b.set_global(k);
            b.push_int(i32::from(k) + 1);
            b.push_obj(2);
            b.set_prop(10);
        }
        b.op(Op::RetNil);
    }));
    let current = w.code(&method(0, |b| {
        b.push_obj(2);
        b.get_prop(10);
        b.op(Op::Return);
    }));
    w.symbol("current", Value::FuncPtr(current));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    completed(vm.run());
    assert_eq!(vm.call_function("current", &[]).ok(), Some(Value::Int(4)));
    assert_eq!(vm.heap().undo_log().savepoint_count(), 4);

    let savepoint = |vm: &t3vm::VM, k: usize| match vm.global(k) {
        Some(Value::Int(id)) => SavepointId(id as u32),
        other => panic!("global {k} holds {other:?}"),
    };

    // Back to the state when savepoint 2 was established.
    let second = savepoint(&vm, 2);
    assert!(vm.heap_mut().undo_to(second));
    assert_eq!(vm.call_function("current", &[]).ok(), Some(Value::Int(2)));
    assert_eq!(vm.heap().undo_log().savepoint_count(), 2);

    // Savepoint 2 and everything newer are gone.
    assert!(!vm.heap_mut().undo_to(second));
    let third = savepoint(&vm, 3);
    assert!(!vm.heap_mut().undo_to(third));

    let first = savepoint(&vm, 0);
    assert!(vm.heap_mut().undo_to(first));
    assert_eq!(vm.call_function("current", &[]).ok(), Some(Value::Int(0)));
    assert_eq!(vm.heap().undo_log().savepoint_count(), 0);
}

#[test]
fn say_writes_to_the_host() {
    let mut w = writer();
    let text = w.string("hello, world");
    let entry = w.code(&method(0, |b| {
        b.push_str(text);
        b.push_int(7);
        b.builtin(2, SAY, IO);
        b.op(Op::Discard);
        b.op(Op::RetNil);
    }));
    w.entrypoint(entry);

    let (mut vm, host) = load(&w);
    completed(vm.run());
    assert_eq!(host.output(), "hello, world7");
}

#[test]
fn entrypoint_receives_arguments() {
    let mut w = writer();
    let mut b = BytecodeBuilder::method(bytecode::MethodHeader {
        argc: 1,
        max_stack: 4,
        ..Default::default()
    });
    b.get_arg(0);
    b.call_prop(0, LENGTH_PROP);
    b.op(Op::Return);
    let entry = w.code(&b.finish());
    w.entrypoint(entry);

    let info = VMCreateInfo {
        args: vec!["north".into(), "south".into()],
        ..Default::default()
    };
    let (mut vm, _) = load_with(&w, info);
    assert_eq!(completed(vm.run()), Value::Int(2));
}

#[test]
fn divide_by_zero_is_caught() {
    let mut w = writer();
    w.symbol("errno_", Value::Prop(PropId(60)));
    let mut b = BytecodeBuilder::method(bytecode::MethodHeader {
        max_stack: 4,
        ..Default::default()
    });
    let start = b.current_offset();
    b.push_int(1);
    b.push_int(0);
    b.op(Op::Div);
    b.op(Op::Return);
    let end = b.current_offset();
    b.get_prop(60);
    b.op(Op::Return);
    b.add_handler(start, end, 0, end);
    let entry = w.code(&b.finish());
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    assert_eq!(
        completed(vm.run()),
        Value::Int(ErrorCode::DivideByZero.number() as i32)
    );
}

#[test]
fn handler_only_catches_its_class() {
    let mut w = writer();
    // Object 2 is the class the handler wants; object 3 is unrelated.
    w.tads_object(2, TADS, &[], &[]);
    w.tads_object(3, TADS, &[], &[]);
    let mut b = BytecodeBuilder::method(bytecode::MethodHeader {
        max_stack: 4,
        ..Default::default()
    });
    let start = b.current_offset();
    b.push_obj(3);
    b.op(Op::Throw);
    let end = b.current_offset();
    b.op(Op::RetTrue);
    b.add_handler(start, end, 2, end);
    let entry = w.code(&b.finish());
    w.entrypoint(entry);

    let (mut vm, host) = load(&w);
    let err = vm.run().err().map(|e| e.code);
    assert_eq!(err, Some(ErrorCode::UnhandledException));
    assert_eq!(host.errors().len(), 1);
}

#[test]
fn uncaught_error_is_reported_with_its_message() {
    let mut w = writer();
    let entry = w.code(&method(0, |b| {
        b.push_int(1);
        b.push_int(0);
        b.op(Op::Mod);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, host) = load(&w);
    assert!(vm.run().is_err());
    let errors = host.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("division by zero"), "{errors:?}");
}

/// Run `body` under a catch-all handler. Returns the caught error's
/// number, or whatever `body` left on the stack if nothing was thrown.
fn errno_of(mut w: t3vm::ImageWriter, body: impl FnOnce(&mut BytecodeBuilder)) -> Value {
    w.symbol("errno_", Value::Prop(PropId(60)));
    let mut b = BytecodeBuilder::method(bytecode::MethodHeader {
        max_stack: 8,
        ..Default::default()
    });
    let start = b.current_offset();
    body(&mut b);
    b.op(Op::Return);
    let end = b.current_offset();
    b.get_prop(60);
    b.op(Op::Return);
    b.add_handler(start, end, 0, end);
    let entry = w.code(&b.finish());
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    completed(vm.run())
}

#[test]
fn get_arg_rejects_indexes_below_one() {
    let out_of_range = Value::Int(ErrorCode::IndexOutOfRange.number() as i32);
    for n in [i32::MIN, -1, 0] {
        let caught = errno_of(writer(), |b| {
            b.push_int(n);
            b.builtin(1, GET_ARG, GEN);
        });
        assert_eq!(caught, out_of_range, "getArg({n})");
    }
}

#[test]
fn float_sum_overflow_is_an_error() {
    let mut w = writer();
    let big = w.string("1e308");
    let caught = errno_of(w, |b| {
        b.push_str(big);
        b.builtin(1, TO_FLOAT, GEN);
        b.push_str(big);
        b.builtin(1, TO_FLOAT, GEN);
        b.builtin(2, SUM, GEN);
    });
    assert_eq!(caught, Value::Int(ErrorCode::NumericOverflow.number() as i32));

    let mut w = writer();
    let half = w.string("0.5");
    let total = errno_of(w, |b| {
        b.push_str(half);
        b.builtin(1, TO_FLOAT, GEN);
        b.push_int(2);
        b.builtin(2, SUM, GEN);
    });
    assert_eq!(total, Value::Float(2.5));
}

#[test]
fn diamond_inheritance_and_inherited_calls() {
    let mut w = writer();
    // A: p11 returns 41.
    let base = w.code(&method(0, |b| {
        b.push_int(41);
        b.op(Op::Return);
    }));
    // B: p11 returns inherited p11 + 1.
    let derived = w.code(&method(0, |b| {
        b.inherited(0, 11);
        b.push_int(1);
        b.op(Op::Add);
        b.op(Op::Return);
    }));
    w.tads_object(10, TADS, &[], &[(10, Value::Int(42)), (11, Value::CodeOfs(base))]);
    w.tads_object(11, TADS, &[10], &[(11, Value::CodeOfs(derived))]);
    w.tads_object(12, TADS, &[10], &[]);
    w.tads_object(13, TADS, &[11, 12], &[]);
    let entry = w.code(&method(0, |b| {
        b.push_obj(13);
        b.get_prop(10);
        b.push_obj(13);
        b.call_prop(0, 11);
        b.op(Op::Add);
        b.push_obj(10);
        b.push_obj(13);
        b.call_prop(1, OF_KIND_PROP);
        let skip = b.jump_if_true();
        b.push_int(1000);
        b.op(Op::Add);
        b.bind(skip);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    assert_eq!(completed(vm.run()), Value::Int(84));
}

#[test]
fn unreachable_cycles_are_collected() {
    let mut w = writer();
    let entry = w.code(&method(1, |b| {
        b.new_object(0, TADS);
        b.set_local(0);
        b.new_object(0, TADS);
        b.op(Op::Dup);
        b.get_local(0);
        b.set_prop(20);
        b.get_local(0);
        b.op(Op::Swap);
        b.set_prop(20);
        b.op(Op::PushNil);
        b.set_local(0);
        b.builtin(0, RUN_GC, T3VM);
        b.op(Op::Discard);
        b.op(Op::RetNil);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    let before = vm.heap().live_count();
    completed(vm.run());
    assert_eq!(vm.heap().live_count(), before);
}

#[test]
fn globals_keep_objects_alive() {
    let mut w = writer();
    let entry = w.code(&method(0, |b| {
        b.new_object(0, TADS);
        b.set_global(3);
        b.builtin(0, RUN_GC, T3VM);
        b.op(Op::Discard);
        b.get_global(3);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    let value = completed(vm.run());
    let id = value.as_obj().expect("an object");
    assert!(vm.heap().contains(id));
    assert_eq!(vm.global(3), Some(value));
}

#[test]
fn paged_pools_evict_and_reload() {
    let mut w = writer();
    w.page_size(128);
    let funcs: Vec<u32> = (0..16)
        .map(|i| {
            w.code(&method(0, |b| {
                b.push_int(i);
                b.op(Op::Return);
            }))
        })
        .collect();
    let entry = w.code(&method(0, |b| {
        b.call(0, funcs[0]);
        for &f in &funcs[1..] {
            b.call(0, f);
            b.op(Op::Add);
        }
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let info = VMCreateInfo {
        pool_mode: PoolMode::Paged {
            max_resident_pages: 2,
        },
        ..Default::default()
    };
    let (mut vm, _) = load_with(&w, info);
    assert_eq!(completed(vm.run()), Value::Int((0..16).sum()));
}

#[test]
fn masked_images_load_only_in_memory() {
    let mut w = writer();
    w.xor_mask(0x5a);
    let entry = w.code(&method(0, |b| {
        b.push_int(9);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    assert_eq!(completed(vm.run()), Value::Int(9));

    let paged = VMCreateInfo {
        pool_mode: PoolMode::Paged {
            max_resident_pages: 4,
        },
        ..Default::default()
    };
    assert_eq!(load_error(&w, paged), ErrorCode::MaskedImageNotSupported);
}

#[test]
fn images_without_entrypoint_or_with_bad_metaclass_fail_to_load() {
    let mut w = writer();
    w.code(&method(0, |b| b.op(Op::RetNil)));
    assert_eq!(load_error(&w, VMCreateInfo::default()), ErrorCode::NoEntrypoint);

    let mut w = writer();
    w.tads_object(2, 9, &[], &[]);
    let entry = w.code(&method(0, |b| b.op(Op::RetNil)));
    w.entrypoint(entry);
    assert_eq!(
        load_error(&w, VMCreateInfo::default()),
        ErrorCode::BadMetaclassIndex
    );
}

#[test]
fn invalid_settings_are_rejected() {
    let mut w = writer();
    let entry = w.code(&method(0, |b| b.op(Op::RetNil)));
    w.entrypoint(entry);
    let mut info = VMCreateInfo::default();
    info.heap.max_objects = 0;
    assert_eq!(load_error(&w, info), ErrorCode::BadArgument);
}

#[test]
fn exported_functions_can_be_called() {
    let mut w = writer();
    let double = w.code(&{
        let mut b = BytecodeBuilder::method(bytecode::MethodHeader {
            argc: 1,
            max_stack: 4,
            ..Default::default()
        });
        b.get_arg(0);
        b.get_arg(0);
        b.op(Op::Add);
        b.op(Op::Return);
        b.finish()
    });
    w.symbol("double", Value::FuncPtr(double));
    let entry = w.code(&method(0, |b| b.op(Op::RetNil)));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    assert_eq!(vm.call_function("double", &[Value::Int(21)]).ok(), Some(Value::Int(42)));
    let err = vm.call_function("triple", &[]).err().map(|e| e.code);
    assert_eq!(err, Some(ErrorCode::NoSuchFunction));
    let err = vm.call_function("double", &[]).err().map(|e| e.code);
    assert_eq!(err, Some(ErrorCode::WrongArgCount));
}

#[test]
fn quit_and_interrupts_end_the_run() {
    let mut w = writer();
    let entry = w.code(&method(0, |b| {
        b.builtin(0, 14, GEN);
        b.op(Op::Discard);
        let top = b.current_offset();
        b.jump_back(Op::Jmp, top);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    assert_eq!(vm.run().ok(), Some(ExitStatus::Quit));

    vm.interrupt_handle().signal(Signal::Abort);
    assert_eq!(vm.run().ok(), Some(ExitStatus::Aborted));
}

#[test]
fn restart_resets_persistent_objects() {
    let mut w = writer();
    w.tads_object(2, TADS, &[], &[(10, Value::Int(1))]);
    let entry = w.code(&method(0, |b| {
        b.push_obj(2);
        b.get_prop(10);
        b.op(Op::Return);
    }));
    w.entrypoint(entry);

    let (mut vm, _) = load(&w);
    let id = ObjectId::persistent(2);
    assert!(vm.heap_mut().set_prop(id, PropId(10), Value::Int(5)).is_ok());
    vm.interrupt_handle().signal(Signal::Restart);
    assert_eq!(completed(vm.run()), Value::Int(1));
    assert_eq!(
        vm.heap().get(id).and_then(|o| o.own_prop(PropId(10))),
        Some(Value::Int(1))
    );
}
