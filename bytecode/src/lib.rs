mod op;
mod instruction;
mod builder;
mod decoder;
pub mod method;

pub use op::Op;
pub use instruction::Instruction;
pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, DecodeError, decode};
pub use method::{ExceptionEntry, MethodHeader};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes)
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn round_trip_operands() {
        let mut b = BytecodeBuilder::new();
        b.push_int(5);
        b.push_int(-100_000);
        b.push_str(0x40);
        b.push_list(0x1_0000);
        b.push_obj(7);
        b.push_prop(300);
        b.push_fnptr(0x20);
        b.get_arg(1);
        b.get_local(2);
        b.set_local(3);
        b.get_global(4);
        b.set_global(5);
        b.get_prop(10);
        b.set_prop_self(11);
        b.call_prop(2, 12);
        b.call_prop_self(0, 13);
        b.inherited(1, 14);
        b.call(3, 0xdead);
        b.ptr_call(1);
        b.builtin(1, 9, 2);
        b.new_object(1, 0);
        b.op(Op::SetIndex);
        b.op(Op::RetNil);

        assert_eq!(decode_all(&b.finish()), vec![
            Instruction::PushInt { value: 5 },
            Instruction::PushInt { value: -100_000 },
            Instruction::PushStr { ofs: 0x40 },
            Instruction::PushList { ofs: 0x1_0000 },
            Instruction::PushObj { id: 7 },
            Instruction::PushProp { prop: 300 },
            Instruction::PushFnPtr { ofs: 0x20 },
            Instruction::GetArg { idx: 1 },
            Instruction::GetLocal { idx: 2 },
            Instruction::SetLocal { idx: 3 },
            Instruction::GetGlobal { idx: 4 },
            Instruction::SetGlobal { idx: 5 },
            Instruction::GetProp { prop: 10 },
            Instruction::SetPropSelf { prop: 11 },
            Instruction::CallProp { argc: 2, prop: 12 },
            Instruction::CallPropSelf { argc: 0, prop: 13 },
            Instruction::Inherited { argc: 1, prop: 14 },
            Instruction::Call { argc: 3, ofs: 0xdead },
            Instruction::PtrCall { argc: 1 },
            Instruction::Builtin { argc: 1, func: 9, set: 2 },
            Instruction::New { argc: 1, meta: 0 },
            Instruction::SetIndex,
            Instruction::RetNil,
        ]);
    }

    #[test]
    fn small_ints_use_short_form() {
        let mut b = BytecodeBuilder::new();
        b.push_int(-128);
        assert_eq!(b.as_bytes(), &[Op::PushInt8 as u8, 0x80]);
        b.push_int(128);
        assert_eq!(b.as_bytes().len(), 2 + 5);
    }

    #[test]
    fn forward_jump() {
        let mut b = BytecodeBuilder::new();
        b.op(Op::PushTrue);
        let label = b.jump_if_false();
        b.push_int(1);
        b.bind(label);
        b.op(Op::Return);

        assert_eq!(decode_all(&b.finish()), vec![
            Instruction::PushTrue,
            Instruction::Jf { offset: 2 },
            Instruction::PushInt { value: 1 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn backward_jump() {
        let mut b = BytecodeBuilder::new();
        let loop_top = b.current_offset();
        b.get_local(0);
        b.jump_back(Op::Jt, loop_top);

        assert_eq!(decode_all(&b.finish()), vec![
            Instruction::GetLocal { idx: 0 },
            Instruction::Jt { offset: -6 },
        ]);
    }

    #[test]
    fn invalid_and_truncated_input() {
        assert_eq!(
            decode(&[0xff]),
            Err(DecodeError::InvalidOpcode { opcode: 0xff, offset: 0 })
        );
        assert_eq!(
            decode(&[Op::PushInt as u8, 1, 2]),
            Err(DecodeError::Truncated { offset: 0 })
        );
        assert_eq!(decode(&[]), Err(DecodeError::Truncated { offset: 0 }));

        let mut it = BytecodeDecoder::new(&[Op::Nop as u8, 0xfe, Op::Nop as u8]);
        assert_eq!(it.next(), Some(Ok(Instruction::Nop)));
        assert!(matches!(it.next(), Some(Err(DecodeError::InvalidOpcode { offset: 1, .. }))));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn decode_reports_length() {
        let mut b = BytecodeBuilder::new();
        b.call(0, 99);
        b.op(Op::Return);
        assert_eq!(decode(b.as_bytes()), Ok((Instruction::Call { argc: 0, ofs: 99 }, 6)));
    }

    #[test]
    fn method_builder_offsets_include_header() {
        let header = MethodHeader { locals: 1, max_stack: 4, ..MethodHeader::default() };
        let mut b = BytecodeBuilder::method(header);
        let start = b.current_offset();
        assert_eq!(start, MethodHeader::SIZE);
        b.push_int(1);
        b.op(Op::Throw);
        let end = b.current_offset();
        b.op(Op::RetTrue);
        b.add_handler(start, end, 0, end);
        let bytes = b.finish();

        let parsed = MethodHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.locals, 1);
        assert_eq!(parsed.exc_table as usize, end + 1);
        let table = method::parse_exception_table(
            &bytes[parsed.exc_table as usize..],
            ExceptionEntry::SIZE,
        )
        .unwrap();
        assert_eq!(table, vec![ExceptionEntry {
            start: start as u16,
            end: end as u16,
            class: 0,
            handler: end as u16,
        }]);
    }

    #[test]
    fn method_without_handlers_has_no_table() {
        let mut b = BytecodeBuilder::method(MethodHeader::default());
        b.op(Op::RetNil);
        let bytes = b.finish();
        assert_eq!(bytes.len(), MethodHeader::SIZE + 1);
        assert_eq!(MethodHeader::parse(&bytes).unwrap().exc_table, 0);
    }

    #[test]
    fn display_instructions() {
        assert_eq!(Instruction::CallProp { argc: 2, prop: 5 }.to_string(), "CallProp &5 (2)");
        assert_eq!(Instruction::Jmp { offset: -7 }.to_string(), "Jmp -7");
        assert_eq!(Instruction::Builtin { argc: 1, func: 9, set: 1 }.to_string(), "Builtin 1.9 (1)");
        assert_eq!(Instruction::Swap.to_string(), "Swap");
    }
}
