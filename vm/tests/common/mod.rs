#![allow(dead_code)]

use std::io::Cursor;

use bytecode::{BytecodeBuilder, MethodHeader};
use t3vm::{BufferHost, ErrorCode, ImageWriter, VM, VMCreateInfo};

pub const TADS: u16 = 0;
pub const LIST: u16 = 1;
pub const VECTOR: u16 = 2;
pub const STRING: u16 = 3;

pub const GEN: u8 = 0;
pub const T3VM: u8 = 1;
pub const IO: u8 = 2;

// tads-gen
pub const GET_ARG: u16 = 1;
pub const TO_FLOAT: u16 = 12;
pub const SAVEPOINT: u16 = 7;
pub const UNDO: u16 = 8;
pub const SUM: u16 = 9;
pub const SAVE_STATE: u16 = 15;
// t3vm
pub const RUN_GC: u16 = 0;
// tads-io
pub const SAY: u16 = 0;

pub const LENGTH_PROP: u16 = 40;
pub const OF_KIND_PROP: u16 = 31;

/// The usual metaclasses and function sets, with no objects yet.
pub fn bare_writer() -> ImageWriter {
    let mut w = ImageWriter::new();
    w.metaclass("tads-object/030005", &[30, OF_KIND_PROP, 32, 33]);
    w.metaclass("list/030008", &[LENGTH_PROP, 41, 42, 43, 44, 45]);
    w.metaclass("vector/030005", &[50, 51, 52, 53, 54]);
    w.metaclass("string/030008", &[]);
    w.function_set("tads-gen/030008");
    w.function_set("t3vm/010006");
    w.function_set("tads-io/030007");
    w
}

/// Image scaffolding every test program shares: [`bare_writer`] plus
/// object 1, a plain program object.
pub fn writer() -> ImageWriter {
    let mut w = bare_writer();
    w.tads_object(1, TADS, &[], &[]);
    w
}

/// A method taking no arguments.
pub fn method(locals: u16, body: impl FnOnce(&mut BytecodeBuilder)) -> Vec<u8> {
    let mut b = BytecodeBuilder::method(MethodHeader {
        locals,
        max_stack: 16,
        ..MethodHeader::default()
    });
    body(&mut b);
    b.finish()
}

pub fn load_with(w: &ImageWriter, info: VMCreateInfo) -> (VM, BufferHost) {
    let host = BufferHost::new();
    let view = host.clone();
    match VM::load_image(Cursor::new(w.to_bytes()), info, Box::new(host)) {
        Ok(vm) => (vm, view),
        Err(e) => panic!("image failed to load: {e}"),
    }
}

pub fn load(w: &ImageWriter) -> (VM, BufferHost) {
    load_with(w, VMCreateInfo::default())
}

pub fn load_error(w: &ImageWriter, info: VMCreateInfo) -> ErrorCode {
    match VM::load_image(Cursor::new(w.to_bytes()), info, Box::new(BufferHost::new())) {
        Ok(_) => panic!("image unexpectedly loaded"),
        Err(e) => e.code,
    }
}
