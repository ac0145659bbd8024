use crate::method::{ExceptionEntry, MethodHeader, encode_exception_table};
use crate::op::Op;

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`], [`BytecodeBuilder::jump_if_true`],
/// and [`BytecodeBuilder::jump_if_false`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the jump instruction (base for relative offset).
    base: usize,
}

/// Builds a bytecode byte sequence, optionally framed as a method.
///
/// A method builder reserves room for the [`MethodHeader`] up front, so
/// every offset it reports is relative to the method start, which is what
/// exception tables use.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
    header: Option<MethodHeader>,
    handlers: Vec<ExceptionEntry>,
}

impl BytecodeBuilder {
    /// A bare instruction stream.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            header: None,
            handlers: Vec::new(),
        }
    }

    /// A method with the given header. `exc_table` is filled in by
    /// [`finish`](Self::finish).
    pub fn method(header: MethodHeader) -> Self {
        Self {
            buf: header.encode().to_vec(),
            header: Some(header),
            handlers: Vec::new(),
        }
    }

    /// Current byte offset (from the method start, for method builders).
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Protect `[start, end)` with a handler at `handler`.
    pub fn add_handler(&mut self, start: usize, end: usize, class: u32, handler: usize) {
        self.handlers.push(ExceptionEntry {
            start: start as u16,
            end: end as u16,
            class,
            handler: handler as u16,
        });
    }

    /// Finish the stream. Method builders append the exception table and
    /// patch its offset into the header.
    pub fn finish(mut self) -> Vec<u8> {
        if let Some(mut header) = self.header.take()
            && !self.handlers.is_empty()
        {
            header.exc_table = self.buf.len() as u16;
            self.buf[..MethodHeader::SIZE].copy_from_slice(&header.encode());
            encode_exception_table(&self.handlers, &mut self.buf);
        }
        self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit an operand-less instruction.
    pub fn op(&mut self, op: Op) {
        debug_assert_eq!(op.operand_len(), 0, "{op:?} takes operands");
        self.buf.push(op as u8);
    }

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    // ── pushes ─────────────────────────────────────────────────────

    /// Push an integer, choosing the short form when it fits.
    pub fn push_int(&mut self, value: i32) {
        if let Ok(v) = i8::try_from(value) {
            self.emit_op(Op::PushInt8);
            self.emit_u8(v as u8);
        } else {
            self.emit_op(Op::PushInt);
            self.emit_u32(value as u32);
        }
    }

    pub fn push_str(&mut self, ofs: u32) {
        self.emit_op(Op::PushStr);
        self.emit_u32(ofs);
    }

    pub fn push_list(&mut self, ofs: u32) {
        self.emit_op(Op::PushList);
        self.emit_u32(ofs);
    }

    pub fn push_obj(&mut self, id: u32) {
        self.emit_op(Op::PushObj);
        self.emit_u32(id);
    }

    pub fn push_prop(&mut self, prop: u16) {
        self.emit_op(Op::PushProp);
        self.emit_u16(prop);
    }

    pub fn push_fnptr(&mut self, ofs: u32) {
        self.emit_op(Op::PushFnPtr);
        self.emit_u32(ofs);
    }

    // ── variables ──────────────────────────────────────────────────

    pub fn get_arg(&mut self, idx: u8) {
        self.emit_op(Op::GetArg);
        self.emit_u8(idx);
    }

    pub fn get_local(&mut self, idx: u16) {
        self.emit_op(Op::GetLocal);
        self.emit_u16(idx);
    }

    pub fn set_local(&mut self, idx: u16) {
        self.emit_op(Op::SetLocal);
        self.emit_u16(idx);
    }

    pub fn get_global(&mut self, idx: u16) {
        self.emit_op(Op::GetGlobal);
        self.emit_u16(idx);
    }

    pub fn set_global(&mut self, idx: u16) {
        self.emit_op(Op::SetGlobal);
        self.emit_u16(idx);
    }

    // ── properties and calls ───────────────────────────────────────

    fn emit_prop_op(&mut self, op: Op, prop: u16) {
        self.emit_op(op);
        self.emit_u16(prop);
    }

    pub fn get_prop(&mut self, prop: u16) {
        self.emit_prop_op(Op::GetProp, prop);
    }

    pub fn get_prop_self(&mut self, prop: u16) {
        self.emit_prop_op(Op::GetPropSelf, prop);
    }

    pub fn set_prop(&mut self, prop: u16) {
        self.emit_prop_op(Op::SetProp, prop);
    }

    pub fn set_prop_self(&mut self, prop: u16) {
        self.emit_prop_op(Op::SetPropSelf, prop);
    }

    fn emit_call_op(&mut self, op: Op, argc: u8, prop: u16) {
        self.emit_op(op);
        self.emit_u8(argc);
        self.emit_u16(prop);
    }

    pub fn call_prop(&mut self, argc: u8, prop: u16) {
        self.emit_call_op(Op::CallProp, argc, prop);
    }

    pub fn call_prop_self(&mut self, argc: u8, prop: u16) {
        self.emit_call_op(Op::CallPropSelf, argc, prop);
    }

    pub fn inherited(&mut self, argc: u8, prop: u16) {
        self.emit_call_op(Op::Inherited, argc, prop);
    }

    pub fn new_object(&mut self, argc: u8, meta: u16) {
        self.emit_call_op(Op::New, argc, meta);
    }

    pub fn call(&mut self, argc: u8, ofs: u32) {
        self.emit_op(Op::Call);
        self.emit_u8(argc);
        self.emit_u32(ofs);
    }

    pub fn ptr_call(&mut self, argc: u8) {
        self.emit_op(Op::PtrCall);
        self.emit_u8(argc);
    }

    pub fn builtin(&mut self, argc: u8, func: u16, set: u8) {
        self.emit_op(Op::Builtin);
        self.emit_u8(argc);
        self.emit_u16(func);
        self.emit_u8(set);
    }

    // ── jumps ──────────────────────────────────────────────────────

    /// Emit an unconditional forward jump. Returns a [`Label`] that must be
    /// resolved later with [`bind`](Self::bind).
    pub fn jump(&mut self) -> Label {
        self.emit_jump_placeholder(Op::Jmp)
    }

    pub fn jump_if_true(&mut self) -> Label {
        self.emit_jump_placeholder(Op::Jt)
    }

    pub fn jump_if_false(&mut self) -> Label {
        self.emit_jump_placeholder(Op::Jf)
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as isize - label.base as isize) as i16;
        self.buf[label.offset_pos..label.offset_pos + 2]
            .copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit a backward jump to `target` (from
    /// [`current_offset`](Self::current_offset)).
    pub fn jump_back(&mut self, op: Op, target: usize) {
        debug_assert!(matches!(op, Op::Jmp | Op::Jt | Op::Jf));
        self.emit_op(op);
        let base = self.buf.len() + 2;
        let offset = (target as isize - base as isize) as i16;
        self.emit_i16(offset);
    }

    fn emit_jump_placeholder(&mut self, op: Op) -> Label {
        self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_i16(0); // placeholder
        let base = self.buf.len();
        Label { offset_pos, base }
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
