mod common;

use std::io::{Seek, SeekFrom};

use bytecode::Op;
use object::{ObjectId, PropId, Value};
use sha2::{Digest, Sha256};
use t3vm::{ErrorCode, ExitStatus, ImageWriter};

use common::*;

/// A program that builds a two-object cycle reachable from global 0,
/// changes persistent object 2, and saves itself to the host file "slot".
/// The exported function "check" walks the cycle and returns the sum of
/// the values found at both ends.
fn cycle_program() -> ImageWriter {
    let mut w = writer();
    w.tads_object(2, TADS, &[], &[(10, Value::Int(1))]);
    let slot = w.string("slot");
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
        b.push_int(7);
        b.get_local(0);
        b.set_prop(21);
        b.push_int(30);
        b.push_obj(2);
        b.set_prop(10);
        b.get_local(0);
        b.set_global(0);
        b.push_str(slot);
        b.builtin(1, SAVE_STATE, GEN);
        b.op(Op::Discard);
        b.op(Op::RetNil);
    }));
    let check = w.code(&method(0, |b| {
        b.get_global(0);
        b.get_prop(20);
        b.get_prop(20);
        b.get_prop(21);
        b.push_obj(2);
        b.get_prop(10);
        b.op(Op::Add);
        b.op(Op::Return);
    }));
    w.symbol("check", Value::FuncPtr(check));
    w.entrypoint(entry);
    w
}

fn saved_by_program(w: &ImageWriter) -> Vec<u8> {
    let (mut vm, host) = load(w);
    assert!(matches!(vm.run(), Ok(ExitStatus::Completed(_))));
    host.file("slot").expect("the program saved its state")
}

fn restore_error(w: &ImageWriter, bytes: &[u8]) -> ErrorCode {
    let (mut vm, _) = load(w);
    let mut r = bytes;
    match vm.restore_state(&mut r) {
        Ok(()) => panic!("state unexpectedly restored"),
        Err(e) => e.code,
    }
}

#[test]
fn cycles_and_persistent_changes_survive_a_restore() {
    let w = cycle_program();
    let saved = saved_by_program(&w);

    let (mut vm, _) = load(&w);
    let mut r = saved.as_slice();
    vm.restore_state(&mut r).unwrap();
    assert_eq!(vm.call_function("check", &[]).ok(), Some(Value::Int(37)));

    // Only the two dynamic objects come back besides the image's own.
    let fresh = load(&w).0.heap().live_count();
    assert_eq!(vm.heap().live_count(), fresh + 2);
}

#[test]
fn state_round_trips_through_a_file() {
    let w = cycle_program();
    let (mut vm, _) = load(&w);
    vm.run().unwrap();

    let mut file = tempfile::tempfile().unwrap();
    vm.save_state(&mut file).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();

    let (mut other, _) = load(&w);
    other.restore_state(&mut file).unwrap();
    assert_eq!(other.call_function("check", &[]).ok(), Some(Value::Int(37)));
    assert_eq!(
        other
            .heap()
            .get(ObjectId::persistent(2))
            .and_then(|o| o.own_prop(PropId(10))),
        Some(Value::Int(30))
    );
}

#[test]
fn state_from_another_image_is_rejected() {
    let w = cycle_program();
    let saved = saved_by_program(&w);

    let mut other = cycle_program();
    other.string("a different image");
    assert_eq!(restore_error(&other, &saved), ErrorCode::WrongSavedState);

    // A rejected restore leaves the VM as it was.
    let (mut vm, _) = load(&other);
    let mut r = saved.as_slice();
    assert!(vm.restore_state(&mut r).is_err());
    assert_eq!(vm.global(0), Some(Value::Nil));
}

#[test]
fn damaged_states_are_rejected() {
    let w = cycle_program();
    let saved = saved_by_program(&w);

    assert_eq!(restore_error(&w, b"not a state"), ErrorCode::NotSavedState);

    let mut flipped = saved.clone();
    let middle = flipped.len() / 2;
    flipped[middle] ^= 0xff;
    assert_eq!(restore_error(&w, &flipped), ErrorCode::CorruptSavedState);

    let truncated = &saved[..saved.len() - 5];
    assert_eq!(restore_error(&w, truncated), ErrorCode::CorruptSavedState);
}

/// Offset of the first object's index: signature, version, identity and
/// the object count come first.
const FIRST_OBJECT_INDEX: usize = 11 + 2 + 32 + 4;

/// `saved` with the first object's index replaced and the checksum
/// recomputed, so only the id checks can catch it.
fn with_first_index(saved: &[u8], index: u32) -> Vec<u8> {
    let mut bytes = saved.to_vec();
    bytes[FIRST_OBJECT_INDEX..FIRST_OBJECT_INDEX + 4].copy_from_slice(&index.to_le_bytes());
    let content = bytes.len() - 32;
    let digest = Sha256::digest(&bytes[..content]);
    bytes[content..].copy_from_slice(&digest);
    bytes
}

#[test]
fn states_with_bad_object_ids_are_rejected_without_changes() {
    let w = cycle_program();
    let saved = saved_by_program(&w);
    let (mut vm, _) = load(&w);
    vm.run().unwrap();
    let live = vm.heap().live_count();
    let first = ObjectId::persistent(1);
    let recorded = &saved[FIRST_OBJECT_INDEX..FIRST_OBJECT_INDEX + 4];
    assert_eq!(recorded, first.index.to_le_bytes());

    // 2 duplicates object 2, 0 is reserved and u32::MAX is past the table.
    for index in [2, 0, u32::MAX] {
        let bytes = with_first_index(&saved, index);
        let mut r = bytes.as_slice();
        let err = vm.restore_state(&mut r).unwrap_err();
        assert_eq!(err.code, ErrorCode::CorruptSavedState, "index {index}");

        assert_eq!(vm.heap().live_count(), live);
        assert!(vm.heap().contains(first));
        assert_eq!(vm.call_function("check", &[]).ok(), Some(Value::Int(37)));
    }

    // The untouched state still restores.
    let mut r = saved.as_slice();
    vm.restore_state(&mut r).unwrap();
    assert_eq!(vm.call_function("check", &[]).ok(), Some(Value::Int(37)));
}

#[test]
fn restoring_discards_undo_history() {
    let w = cycle_program();
    let (mut vm, _) = load(&w);
    vm.run().unwrap();
    let savepoint = vm.heap_mut().begin_savepoint();
    vm.heap_mut()
        .set_prop(ObjectId::persistent(2), PropId(10), Value::Int(5))
        .unwrap();

    let mut saved = Vec::new();
    vm.save_state(&mut saved).unwrap();
    let mut r = saved.as_slice();
    vm.restore_state(&mut r).unwrap();

    assert_eq!(vm.heap().undo_log().savepoint_count(), 0);
    assert!(!vm.heap_mut().undo_to(savepoint));
    assert_eq!(vm.call_function("check", &[]).ok(), Some(Value::Int(12)));
}
