/// Bytecode opcodes.
///
/// The machine is a pure stack machine. Operands follow the opcode byte,
/// little-endian. Code and constant pool offsets are 32-bit, property ids
/// 16-bit, argument counts 8-bit. Jump offsets are `i16` relative to the
/// end of the jump instruction.
///
/// Stack effects are written `before -> after`, top of stack rightmost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,

    /// `-> nil`
    PushNil,

    /// `-> true`
    PushTrue,

    /// `-> int`
    /// Operands: `value:i8`
    PushInt8,

    /// `-> int`
    /// Operands: `value:i32`
    PushInt,

    /// Push a constant-pool string.
    /// Operands: `ofs:u32`
    PushStr,

    /// Push a constant-pool list.
    /// Operands: `ofs:u32`
    PushList,

    /// Operands: `id:u32` (image object id)
    PushObj,

    /// Operands: `prop:u16`
    PushProp,

    /// Push a function pointer.
    /// Operands: `ofs:u32` (code pool)
    PushFnPtr,

    /// `-> self`
    PushSelf,

    /// Push an argument of the current frame (0-based).
    /// Operands: `idx:u8`
    GetArg,

    /// Operands: `idx:u16`
    GetLocal,

    /// `value ->`
    /// Operands: `idx:u16`
    SetLocal,

    /// Operands: `idx:u16`
    GetGlobal,

    /// `value ->`
    /// Operands: `idx:u16`
    SetGlobal,

    /// `a -> a a`
    Dup,

    /// `a ->`
    Discard,

    /// `a b -> b a`
    Swap,

    /// `a b -> a+b`. Also concatenates strings and appends to lists.
    Add,

    /// `a b -> a-b`. Also removes elements from lists.
    Sub,

    Mul,
    Div,
    Mod,

    /// `a -> -a`
    Neg,

    /// `a -> !a`
    Not,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    /// Operands: `offset:i16`
    Jmp,

    /// `cond ->`, jump if true.
    /// Operands: `offset:i16`
    Jt,

    /// `cond ->`, jump if false.
    /// Operands: `offset:i16`
    Jf,

    /// Evaluate a property without arguments.
    /// `obj -> value`
    /// Operands: `prop:u16`
    GetProp,

    /// Operands: `prop:u16`
    GetPropSelf,

    /// `value obj ->`
    /// Operands: `prop:u16`
    SetProp,

    /// `value ->`
    /// Operands: `prop:u16`
    SetPropSelf,

    /// `args.. obj -> result`
    /// Operands: `argc:u8`, `prop:u16`
    CallProp,

    /// `args.. -> result`
    /// Operands: `argc:u8`, `prop:u16`
    CallPropSelf,

    /// Call the definition of `prop` that the current method overrides.
    /// `args.. -> result`
    /// Operands: `argc:u8`, `prop:u16`
    Inherited,

    /// Call a function at a code offset.
    /// `args.. -> result`
    /// Operands: `argc:u8`, `ofs:u32`
    Call,

    /// Call a function pointer.
    /// `args.. fnptr -> result`
    /// Operands: `argc:u8`
    PtrCall,

    /// Call an intrinsic function.
    /// `args.. -> result`
    /// Operands: `argc:u8`, `func:u16`, `set:u8`
    Builtin,

    /// Create an object of a loaded metaclass.
    /// `args.. -> obj`
    /// Operands: `argc:u8`, `meta:u16`
    New,

    /// `container index -> value`
    Index,

    /// `container index value -> container'`
    SetIndex,

    /// `value ->` and return it to the caller.
    Return,

    RetNil,
    RetTrue,

    /// `exc ->` and unwind.
    Throw,
}

impl Op {
    pub const COUNT: usize = Op::Throw as usize + 1;

    /// Size of the operand bytes following the opcode.
    pub const fn operand_len(self) -> usize {
        match self {
            Op::PushInt8 | Op::GetArg | Op::PtrCall => 1,
            Op::PushProp
            | Op::GetLocal
            | Op::SetLocal
            | Op::GetGlobal
            | Op::SetGlobal
            | Op::Jmp
            | Op::Jt
            | Op::Jf
            | Op::GetProp
            | Op::GetPropSelf
            | Op::SetProp
            | Op::SetPropSelf => 2,
            Op::CallProp | Op::CallPropSelf | Op::Inherited | Op::New => 3,
            Op::PushInt | Op::PushStr | Op::PushList | Op::PushObj | Op::PushFnPtr => 4,
            Op::Builtin => 4,
            Op::Call => 5,
            _ => 0,
        }
    }

    /// Whether the op transfers control unconditionally (nothing after it
    /// runs).
    pub const fn is_terminator(self) -> bool {
        matches!(
            self,
            Op::Jmp | Op::Return | Op::RetNil | Op::RetTrue | Op::Throw
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
