//! Operand stack and call frames.
//!
//! One contiguous value stack holds every frame's arguments, locals and
//! operands:
//!
//! ```text
//! | args (argc) | locals | operands ... |
//! ^ arg_base    ^ local_base
//!                        ^ stack_base
//! ```
//!
//! Every value on the stack owns one count. A frame also owns a count on
//! its `self` value and on its defining object.

use bytecode::MethodHeader;
use object::{ObjectId, PropId, Value};

use crate::error::{ErrorCode, Fault, VmError, VmResult};

#[derive(Debug, Clone)]
pub struct StackSettings {
    /// Value slots across all frames.
    pub stack_size: usize,
    pub max_frames: usize,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            stack_size: 4096,
            max_frames: 1024,
        }
    }
}

impl StackSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.stack_size < 16 {
            return Err("stack_size must be >= 16");
        }
        if self.max_frames == 0 {
            return Err("max_frames must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    /// Code offset of the method header.
    pub method: u32,
    pub header: MethodHeader,
    /// Code offset of the instruction being executed, for handler lookup.
    pub insn_start: u32,
    /// Code offset of the next instruction.
    pub ip: u32,
    pub self_val: Value,
    /// Object the running method was found on, for `inherited`.
    pub defining: Option<ObjectId>,
    pub target: Option<PropId>,
    pub argc: usize,
    pub arg_base: usize,
    pub local_base: usize,
    pub stack_base: usize,
}

impl Frame {
    /// Offset of the current instruction relative to the method start.
    pub fn method_offset(&self) -> u32 {
        self.insn_start - self.method
    }
}

pub struct Stack {
    settings: StackSettings,
    values: Vec<Value>,
    frames: Vec<Frame>,
}

impl Stack {
    pub fn new(settings: StackSettings) -> Self {
        Self {
            values: Vec::with_capacity(settings.stack_size),
            frames: Vec::new(),
            settings,
        }
    }

    /// Number of active frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Lowest value index the current frame may pop.
    fn floor(&self) -> usize {
        self.frames.last().map_or(0, |f| f.stack_base)
    }

    // ── Values ─────────────────────────────────────────────────────

    /// Push an owned value. On overflow the value is handed back so the
    /// caller can release it.
    pub fn push(&mut self, value: Value) -> Result<(), (Fault, Value)> {
        if self.values.len() >= self.settings.stack_size {
            return Err((ErrorCode::StackOverflow.into(), value));
        }
        self.values.push(value);
        Ok(())
    }

    /// Pop an owned value.
    pub fn pop(&mut self) -> VmResult<Value> {
        if self.values.len() <= self.floor() {
            return Err(VmError::new(ErrorCode::StackUnderflow));
        }
        self.values
            .pop()
            .ok_or_else(|| VmError::new(ErrorCode::StackUnderflow))
    }

    /// Value `depth` slots below the top, borrowed.
    pub fn peek(&self, depth: usize) -> VmResult<Value> {
        let len = self.values.len();
        if depth >= len - self.floor().min(len) {
            return Err(VmError::new(ErrorCode::StackUnderflow));
        }
        Ok(self.values[len - 1 - depth])
    }

    /// The top `n` values, deepest first.
    pub fn top(&self, n: usize) -> VmResult<&[Value]> {
        let len = self.values.len();
        if n > len - self.floor().min(len) {
            return Err(VmError::new(ErrorCode::StackUnderflow));
        }
        Ok(&self.values[len - n..])
    }

    pub fn get(&self, index: usize) -> VmResult<Value> {
        self.values
            .get(index)
            .copied()
            .ok_or_else(|| VmError::new(ErrorCode::StackUnderflow))
    }

    /// Store an owned value at `index`, returning the owned value it
    /// replaced.
    pub fn replace(&mut self, index: usize, value: Value) -> VmResult<Value> {
        self.values
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, value))
            .ok_or_else(|| VmError::new(ErrorCode::StackUnderflow))
    }

    /// Remove everything from `len` up; the caller owns the result.
    pub fn truncate(&mut self, len: usize) -> Vec<Value> {
        if len >= self.values.len() {
            return Vec::new();
        }
        self.values.split_off(len)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    // ── Frames ─────────────────────────────────────────────────────

    pub fn push_frame(&mut self, frame: Frame) -> Result<(), (Fault, Frame)> {
        if self.frames.len() >= self.settings.max_frames {
            return Err((ErrorCode::StackOverflow.into(), frame));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    /// Argument `index` (0-based) of the innermost frame.
    pub fn frame_arg(&self, index: usize) -> Option<Value> {
        let frame = self.frames.last()?;
        if index >= frame.argc {
            return None;
        }
        self.values.get(frame.arg_base + index).copied()
    }

    /// Remove every value and frame. The caller owns what comes back:
    /// stack values plus each frame's `self` and defining object.
    pub fn clear(&mut self) -> Vec<Value> {
        let mut owned = std::mem::take(&mut self.values);
        for frame in self.frames.drain(..) {
            owned.push(frame.self_val);
            if let Some(d) = frame.defining {
                owned.push(Value::Obj(d));
            }
        }
        owned
    }

    /// Every value the stack holds a count on.
    pub fn visit_values(&self, f: &mut dyn FnMut(Value)) {
        for &v in &self.values {
            f(v);
        }
        for frame in &self.frames {
            f(frame.self_val);
            if let Some(d) = frame.defining {
                f(Value::Obj(d));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(arg_base: usize, argc: usize, locals: usize) -> Frame {
        Frame {
            method: 0,
            header: MethodHeader::default(),
            insn_start: 0,
            ip: 0,
            self_val: Value::Nil,
            defining: None,
            target: None,
            argc,
            arg_base,
            local_base: arg_base + argc,
            stack_base: arg_base + argc + locals,
        }
    }

    #[test]
    fn frames_cannot_pop_below_their_base() {
        let mut stack = Stack::new(StackSettings::default());
        stack.push(Value::Int(1)).unwrap();
        stack.push(Value::Int(2)).unwrap();
        stack.push_frame(frame(1, 1, 0)).unwrap();
        assert_eq!(stack.frame_arg(0), Some(Value::Int(2)));
        assert_eq!(stack.frame_arg(1), None);
        assert!(stack.pop().is_err());
        stack.push(Value::True).unwrap();
        assert_eq!(stack.peek(0).unwrap(), Value::True);
        assert!(stack.peek(1).is_err());
        assert_eq!(stack.pop().unwrap(), Value::True);
        stack.pop_frame();
        assert_eq!(stack.pop().unwrap(), Value::Int(2));
    }

    #[test]
    fn overflow_hands_back_the_value() {
        let mut stack = Stack::new(StackSettings {
            stack_size: 16,
            max_frames: 1,
        });
        for i in 0..16 {
            stack.push(Value::Int(i)).unwrap();
        }
        let (fault, value) = stack.push(Value::True).unwrap_err();
        assert_eq!(fault, Fault::from(ErrorCode::StackOverflow));
        assert_eq!(value, Value::True);

        stack.push_frame(frame(0, 0, 0)).unwrap();
        assert!(stack.push_frame(frame(0, 0, 0)).is_err());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn clear_returns_everything_owned() {
        let mut stack = Stack::new(StackSettings::default());
        stack.push(Value::Int(7)).unwrap();
        let mut f = frame(1, 0, 0);
        f.self_val = Value::Obj(ObjectId::persistent(3));
        f.defining = Some(ObjectId::persistent(4));
        stack.push_frame(f).unwrap();
        let owned = stack.clear();
        assert_eq!(owned, vec![
            Value::Int(7),
            Value::Obj(ObjectId::persistent(3)),
            Value::Obj(ObjectId::persistent(4)),
        ]);
        assert_eq!(stack.depth(), 0);
        assert!(stack.is_empty());
    }
}
