use core::fmt;

use crate::op::Op;

/// A decoded instruction with its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    PushNil,
    PushTrue,
    PushInt { value: i32 },
    PushStr { ofs: u32 },
    PushList { ofs: u32 },
    PushObj { id: u32 },
    PushProp { prop: u16 },
    PushFnPtr { ofs: u32 },
    PushSelf,
    GetArg { idx: u8 },
    GetLocal { idx: u16 },
    SetLocal { idx: u16 },
    GetGlobal { idx: u16 },
    SetGlobal { idx: u16 },
    Dup,
    Discard,
    Swap,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Jmp { offset: i16 },
    Jt { offset: i16 },
    Jf { offset: i16 },
    GetProp { prop: u16 },
    GetPropSelf { prop: u16 },
    SetProp { prop: u16 },
    SetPropSelf { prop: u16 },
    CallProp { argc: u8, prop: u16 },
    CallPropSelf { argc: u8, prop: u16 },
    Inherited { argc: u8, prop: u16 },
    Call { argc: u8, ofs: u32 },
    PtrCall { argc: u8 },
    Builtin { argc: u8, func: u16, set: u8 },
    New { argc: u8, meta: u16 },
    Index,
    SetIndex,
    Return,
    RetNil,
    RetTrue,
    Throw,
}

impl Instruction {
    /// The opcode this instruction encodes to. Both integer pushes report
    /// [`Op::PushInt`].
    pub fn op(&self) -> Op {
        match self {
            Self::Nop => Op::Nop,
            Self::PushNil => Op::PushNil,
            Self::PushTrue => Op::PushTrue,
            Self::PushInt { .. } => Op::PushInt,
            Self::PushStr { .. } => Op::PushStr,
            Self::PushList { .. } => Op::PushList,
            Self::PushObj { .. } => Op::PushObj,
            Self::PushProp { .. } => Op::PushProp,
            Self::PushFnPtr { .. } => Op::PushFnPtr,
            Self::PushSelf => Op::PushSelf,
            Self::GetArg { .. } => Op::GetArg,
            Self::GetLocal { .. } => Op::GetLocal,
            Self::SetLocal { .. } => Op::SetLocal,
            Self::GetGlobal { .. } => Op::GetGlobal,
            Self::SetGlobal { .. } => Op::SetGlobal,
            Self::Dup => Op::Dup,
            Self::Discard => Op::Discard,
            Self::Swap => Op::Swap,
            Self::Add => Op::Add,
            Self::Sub => Op::Sub,
            Self::Mul => Op::Mul,
            Self::Div => Op::Div,
            Self::Mod => Op::Mod,
            Self::Neg => Op::Neg,
            Self::Not => Op::Not,
            Self::Eq => Op::Eq,
            Self::Ne => Op::Ne,
            Self::Lt => Op::Lt,
            Self::Le => Op::Le,
            Self::Gt => Op::Gt,
            Self::Ge => Op::Ge,
            Self::Jmp { .. } => Op::Jmp,
            Self::Jt { .. } => Op::Jt,
            Self::Jf { .. } => Op::Jf,
            Self::GetProp { .. } => Op::GetProp,
            Self::GetPropSelf { .. } => Op::GetPropSelf,
            Self::SetProp { .. } => Op::SetProp,
            Self::SetPropSelf { .. } => Op::SetPropSelf,
            Self::CallProp { .. } => Op::CallProp,
            Self::CallPropSelf { .. } => Op::CallPropSelf,
            Self::Inherited { .. } => Op::Inherited,
            Self::Call { .. } => Op::Call,
            Self::PtrCall { .. } => Op::PtrCall,
            Self::Builtin { .. } => Op::Builtin,
            Self::New { .. } => Op::New,
            Self::Index => Op::Index,
            Self::SetIndex => Op::SetIndex,
            Self::Return => Op::Return,
            Self::RetNil => Op::RetNil,
            Self::RetTrue => Op::RetTrue,
            Self::Throw => Op::Throw,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PushInt { value } => write!(f, "PushInt {value}"),
            Self::PushStr { ofs } => write!(f, "PushStr @{ofs:#x}"),
            Self::PushList { ofs } => write!(f, "PushList @{ofs:#x}"),
            Self::PushObj { id } => write!(f, "PushObj obj#{id}"),
            Self::PushProp { prop } => write!(f, "PushProp &{prop}"),
            Self::PushFnPtr { ofs } => write!(f, "PushFnPtr @{ofs:#x}"),
            Self::GetArg { idx } => write!(f, "GetArg a{idx}"),
            Self::GetLocal { idx } => write!(f, "GetLocal l{idx}"),
            Self::SetLocal { idx } => write!(f, "SetLocal l{idx}"),
            Self::GetGlobal { idx } => write!(f, "GetGlobal g{idx}"),
            Self::SetGlobal { idx } => write!(f, "SetGlobal g{idx}"),
            Self::Jmp { offset } => write!(f, "Jmp {offset:+}"),
            Self::Jt { offset } => write!(f, "Jt {offset:+}"),
            Self::Jf { offset } => write!(f, "Jf {offset:+}"),
            Self::GetProp { prop } => write!(f, "GetProp &{prop}"),
            Self::GetPropSelf { prop } => write!(f, "GetPropSelf &{prop}"),
            Self::SetProp { prop } => write!(f, "SetProp &{prop}"),
            Self::SetPropSelf { prop } => write!(f, "SetPropSelf &{prop}"),
            Self::CallProp { argc, prop } => write!(f, "CallProp &{prop} ({argc})"),
            Self::CallPropSelf { argc, prop } => {
                write!(f, "CallPropSelf &{prop} ({argc})")
            }
            Self::Inherited { argc, prop } => {
                write!(f, "Inherited &{prop} ({argc})")
            }
            Self::Call { argc, ofs } => write!(f, "Call @{ofs:#x} ({argc})"),
            Self::PtrCall { argc } => write!(f, "PtrCall ({argc})"),
            Self::Builtin { argc, func, set } => {
                write!(f, "Builtin {set}.{func} ({argc})")
            }
            Self::New { argc, meta } => write!(f, "New m{meta} ({argc})"),
            other => write!(f, "{:?}", other.op()),
        }
    }
}
