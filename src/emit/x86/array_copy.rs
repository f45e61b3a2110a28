//! Array copies.
//!
//! Without a statically known element type the copy goes through the
//! runtime's generic routine, which answers zero on success and the
//! complement of the number of elements copied when it gives up. The
//! remainder is then handed to the element-wise slow path, which raises
//! the right exception.

use super::super::stubs::SlowPath;
use super::X86Emitter;
use crate::asm::{Address, AluOp, Cond, Label, Reg, Scale, Width, X86_64Assembler};
use crate::error::{EmitError, EmitResult};
use crate::lir::{ArrayCopyFlags, CodeEmitInfo, Kind, LirOp};
use crate::runtime::{RuntimeCall, TypeId};

/// Registers of one copy, in runtime argument order.
#[derive(Debug, Clone, Copy)]
struct CopyArgs {
    src: Reg,
    src_pos: Reg,
    dst: Reg,
    dst_pos: Reg,
    length: Reg,
}

impl CopyArgs {
    fn to_array(self) -> [Reg; 5] {
        [self.src, self.src_pos, self.dst, self.dst_pos, self.length]
    }
}

impl X86Emitter<'_> {
    pub(super) fn emit_array_copy(&mut self, op: &LirOp) -> EmitResult {
        let LirOp::ArrayCopy {
            src,
            src_pos,
            dst,
            dst_pos,
            length,
            tmp,
            expected_type,
            flags,
            info,
        } = op
        else {
            return Err(EmitError::unsupported(format!("{op} is not an array copy")));
        };
        let args = CopyArgs {
            src: self.reg(src)?,
            src_pos: self.reg(src_pos)?,
            dst: self.reg(dst)?,
            dst_pos: self.reg(dst_pos)?,
            length: self.reg(length)?,
        };
        let tmp = self.reg(tmp)?;
        let regs = args.to_array();
        if regs.contains(&tmp) {
            return Err(EmitError::unsupported(format!("{op}: temp aliases an argument")));
        }

        let entry = self.buf.new_label();
        let continuation = self.buf.new_label();
        self.add_slow_path(SlowPath::ArrayCopy {
            entry,
            continuation,
            args: regs,
            info: info.clone(),
        });
        match expected_type {
            None => self.generic_array_copy(args, tmp, info, entry, continuation),
            Some(ty) => self.typed_array_copy(args, tmp, *ty, *flags, info, entry, continuation),
        }
    }

    fn generic_array_copy(
        &mut self,
        args: CopyArgs,
        tmp: Reg,
        info: &CodeEmitInfo,
        entry: Label,
        continuation: Label,
    ) -> EmitResult {
        let width = self.word_width();
        let int_args = [1, 3, 4];
        for (i, reg) in args.to_array().into_iter().enumerate() {
            let i = i as u32;
            let w = if int_args.contains(&i) { Width::Dword } else { width };
            self.store_argument(i, reg, w);
        }
        self.call_native_runtime(RuntimeCall::ArrayCopy, 5, &int_args, Some(info))?;

        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.test_rr(Width::Dword, Reg::Rax, Reg::Rax);
        asm.jcc(Cond::E, continuation);
        // elements already copied
        asm.mov_rr(Width::Dword, tmp, Reg::Rax);
        asm.not(Width::Dword, tmp);
        for (i, reg) in args.to_array().into_iter().enumerate() {
            let i = i as u32;
            let w = if int_args.contains(&i) { Width::Dword } else { width };
            asm.load(w, reg, &self.frame.argument_address(i));
        }
        asm.alu_rr(AluOp::Add, Width::Dword, args.src_pos, tmp);
        asm.alu_rr(AluOp::Add, Width::Dword, args.dst_pos, tmp);
        asm.alu_rr(AluOp::Sub, Width::Dword, args.length, tmp);
        asm.jmp(entry);
        asm.buffer().bind(continuation);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn typed_array_copy(
        &mut self,
        args: CopyArgs,
        tmp: Reg,
        expected: TypeId,
        flags: ArrayCopyFlags,
        info: &CodeEmitInfo,
        entry: Label,
        continuation: Label,
    ) -> EmitResult {
        let desc = self
            .model
            .type_desc(expected)
            .ok_or_else(|| EmitError::unsupported(format!("unknown type {}", expected.0)))?;
        let element = desc
            .element_kind
            .or(desc.component.map(|_| Kind::Object))
            .ok_or_else(|| EmitError::unsupported(format!("{} is not an array type", desc.name)))?;
        let expected_hub = desc.hub;
        let size = element.element_size(self.word as usize);
        let scale = Scale::from_bytes(size)
            .ok_or_else(|| EmitError::unsupported(format!("element size {size}")))?;

        let layout = self.config.layout;
        let width = self.word_width();
        let is_64bit = self.is_64bit();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if flags.src_null_check {
            asm.test_rr(width, args.src, args.src);
            asm.jcc(Cond::E, entry);
        }
        if flags.dst_null_check {
            asm.test_rr(width, args.dst, args.dst);
            asm.jcc(Cond::E, entry);
        }
        for (check, reg) in [
            (flags.src_pos_positive_check, args.src_pos),
            (flags.dst_pos_positive_check, args.dst_pos),
            (flags.length_positive_check, args.length),
        ] {
            if check {
                asm.test_rr(Width::Dword, reg, reg);
                asm.jcc(Cond::L, entry);
            }
        }
        for (check, array, pos) in [
            (flags.src_range_check, args.src, args.src_pos),
            (flags.dst_range_check, args.dst, args.dst_pos),
        ] {
            if check {
                asm.lea(Width::Dword, tmp, &Address::indexed(pos, args.length, Scale::Times1, 0));
                asm.alu_rm(AluOp::Cmp, Width::Dword, tmp, &Address::new(array, layout.array_length_offset));
                asm.jcc(Cond::A, entry);
            }
        }
        if is_64bit {
            // positions index memory below
            asm.movsxd(args.src_pos, args.src_pos);
            asm.movsxd(args.dst_pos, args.dst_pos);
        }
        if flags.type_check {
            asm.load(width, tmp, &Address::new(args.src, layout.hub_offset));
            asm.alu_rm(AluOp::Cmp, width, tmp, &Address::new(args.dst, layout.hub_offset));
            asm.jcc(Cond::Ne, entry);
        }

        if self.config.generate_assertion_code {
            self.assert_array_types(args, tmp, expected_hub, element == Kind::Object, flags.type_check);
        }

        let base = layout.array_base_offset;
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.lea(width, tmp, &Address::indexed(args.src, args.src_pos, scale, base));
        asm.store(width, &self.frame.argument_address(0), tmp);
        asm.lea(width, tmp, &Address::indexed(args.dst, args.dst_pos, scale, base));
        asm.store(width, &self.frame.argument_address(1), tmp);
        asm.store(Width::Dword, &self.frame.argument_address(2), args.length);
        let call = if element == Kind::Object {
            RuntimeCall::OopArrayCopy
        } else {
            RuntimeCall::PrimitiveArrayCopy
        };
        self.call_native_runtime(call, 3, &[2], Some(info))?;
        self.buf.bind(continuation);
        Ok(())
    }

    /// Traps unless the arrays have the type the copy was compiled for.
    /// When the copy checked the types itself a match on either side is
    /// enough for object arrays.
    fn assert_array_types(&mut self, args: CopyArgs, tmp: Reg, hub: u64, oop_array: bool, type_checked: bool) {
        let known_ok = self.buf.new_label();
        let halt = self.buf.new_label();
        self.load_object(tmp, hub);
        let hub_offset = self.config.layout.hub_offset;
        let width = self.word_width();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        let dst_hub = Address::new(args.dst, hub_offset);
        let src_hub = Address::new(args.src, hub_offset);
        if oop_array && type_checked {
            asm.alu_rm(AluOp::Cmp, width, tmp, &dst_hub);
            asm.jcc(Cond::E, known_ok);
            asm.alu_rm(AluOp::Cmp, width, tmp, &src_hub);
            asm.jcc(Cond::E, known_ok);
        } else {
            asm.alu_rm(AluOp::Cmp, width, tmp, &dst_hub);
            asm.jcc(Cond::Ne, halt);
            asm.alu_rm(AluOp::Cmp, width, tmp, &src_hub);
            asm.jcc(Cond::E, known_ok);
        }
        asm.buffer().bind(halt);
        asm.int3();
        asm.buffer().bind(known_ok);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::asm::Reg;
    use crate::config::CompilerConfig;
    use crate::lir::{ArrayCopyFlags, CodeEmitInfo, Kind, LirMethod, LirOp, Operand};
    use crate::runtime::{MethodId, RuntimeCall, TypeDesc, TypeId};
    use crate::scope::ScopeId;
    use crate::target::{Callee, CompiledMethod};

    const INT_ARRAY: TypeId = TypeId(2);

    fn copy(expected_type: Option<TypeId>, flags: ArrayCopyFlags) -> LirOp {
        LirOp::ArrayCopy {
            src: Operand::reg(Reg::Rbx, Kind::Object),
            src_pos: Operand::reg(Reg::Rcx, Kind::Int),
            dst: Operand::reg(Reg::Rdx, Kind::Object),
            dst_pos: Operand::reg(Reg::Rsi, Kind::Int),
            length: Operand::reg(Reg::Rdi, Kind::Int),
            tmp: Operand::reg(Reg::R11, Kind::Word),
            expected_type,
            flags,
            info: CodeEmitInfo::new(ScopeId::ROOT, 12),
        }
    }

    fn callees(method: &CompiledMethod) -> Vec<Callee> {
        method.stops.iter().filter_map(|s| s.callee.clone()).collect()
    }

    #[test]
    fn test_generic_copy_spills_arguments_and_resumes_slow_path() {
        let code = body(&CompilerConfig::default(), vec![copy(None, ArrayCopyFlags::default())], 0);
        #[rustfmt::skip]
        let spills = [
            0x48, 0x89, 0x1C, 0x24, // mov [rsp], rbx
            0x89, 0x4C, 0x24, 0x08, // mov [rsp + 8], ecx
            0x48, 0x89, 0x54, 0x24, 0x10, // mov [rsp + 16], rdx
            0x89, 0x74, 0x24, 0x18, // mov [rsp + 24], esi
            0x89, 0x7C, 0x24, 0x20, // mov [rsp + 32], edi
        ];
        assert_eq!(&code[..spills.len()], &spills);
        // length reaches the runtime in r8d
        assert!(code.windows(5).any(|w| w == [0x44, 0x8B, 0x44, 0x24, 0x20]));
        // mov r11d, eax; not r11d
        assert!(code.windows(6).any(|w| w == [0x41, 0x89, 0xC3, 0x41, 0xF7, 0xD3]));

        let lir = LirMethod::new(MethodId(0), vec![copy(None, ArrayCopyFlags::default())]);
        let method = compile_with(&CompilerConfig::default(), &model(), &lir).unwrap();
        let callees = callees(&method);
        assert!(callees.contains(&Callee::Runtime(RuntimeCall::ArrayCopy)));
        assert!(callees.contains(&Callee::GlobalStub(RuntimeCall::SlowArrayCopy)));
    }

    #[test]
    fn test_typed_copy_checks_then_calls_primitive_routine() {
        let code = body(
            &CompilerConfig::default(),
            vec![copy(Some(INT_ARRAY), ArrayCopyFlags::all())],
            0,
        );
        // test rbx, rbx; jz slow path
        assert_eq!(&code[..5], &[0x48, 0x85, 0xDB, 0x0F, 0x84]);
        // lea r11d, [rcx + rdi]; cmp r11d, [rbx + 16]; ja slow path
        assert!(code
            .windows(10)
            .any(|w| w == [0x44, 0x8D, 0x1C, 0x39, 0x44, 0x3B, 0x5B, 0x10, 0x0F, 0x87]));
        // lea r11, [rbx + rcx*4 + 24]
        assert!(code.windows(5).any(|w| w == [0x4C, 0x8D, 0x5C, 0x8B, 0x18]));

        let lir = LirMethod::new(MethodId(0), vec![copy(Some(INT_ARRAY), ArrayCopyFlags::all())]);
        let method = compile_with(&CompilerConfig::default(), &model(), &lir).unwrap();
        assert!(callees(&method).contains(&Callee::Runtime(RuntimeCall::PrimitiveArrayCopy)));
    }

    #[test]
    fn test_typed_copy_sign_extends_positions() {
        let code = body(
            &CompilerConfig::default(),
            vec![copy(Some(INT_ARRAY), ArrayCopyFlags::default())],
            0,
        );
        // movsxd rcx, ecx; movsxd rsi, esi
        assert!(code.windows(6).any(|w| w == [0x48, 0x63, 0xC9, 0x48, 0x63, 0xF6]));
    }

    #[test]
    fn test_object_array_uses_oop_routine() {
        let mut model = model();
        let points = model.add_type(TypeDesc {
            name: "Point[]".to_string(),
            superclass: Some(TypeId(0)),
            interfaces: vec![],
            is_interface: false,
            component: Some(TypeId(1)),
            hub: 0x4000,
            super_check_offset: 24,
            element_kind: None,
        });
        let lir = LirMethod::new(MethodId(0), vec![copy(Some(points), ArrayCopyFlags::default())]);
        let method = compile_with(&CompilerConfig::default(), &model, &lir).unwrap();
        assert!(callees(&method).contains(&Callee::Runtime(RuntimeCall::OopArrayCopy)));
    }

    #[test]
    fn test_assertion_code_compares_hubs() {
        let flags = ArrayCopyFlags {
            type_check: false,
            ..ArrayCopyFlags::all()
        };
        // cmp r11, [rdx]
        let hub_compare = [0x4C, 0x3B, 0x1A];
        let code = body(&CompilerConfig::default(), vec![copy(Some(INT_ARRAY), flags)], 0);
        assert!(!code.windows(3).any(|w| w == hub_compare));

        let mut config = CompilerConfig::default();
        config.generate_assertion_code = true;
        let code = body(&config, vec![copy(Some(INT_ARRAY), flags)], 0);
        assert!(code.windows(3).any(|w| w == hub_compare));
    }

    #[test]
    fn test_non_array_type_is_rejected() {
        let lir = LirMethod::new(MethodId(0), vec![copy(Some(TypeId(1)), ArrayCopyFlags::all())]);
        assert!(compile_with(&CompilerConfig::default(), &model(), &lir).is_err());
    }
}
