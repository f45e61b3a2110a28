//! Moves between every pair of operand locations.

use super::{X86Emitter, regs};
use crate::asm::{Address, Reg, Width, X86_64Assembler, Xmm};
use crate::error::{EmitError, EmitResult};
use crate::lir::{CodeEmitInfo, Constant, Kind, Location, ObjectRef, Operand};

impl X86Emitter<'_> {
    pub(super) fn emit_move(
        &mut self,
        src: &Operand,
        dst: &Operand,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        use Location::*;
        match (src.loc, dst.loc) {
            (Register { .. } | RegisterPair { .. } | Xmm { .. }, Register { .. } | RegisterPair { .. } | Xmm { .. }) => {
                self.reg_to_reg(src, dst)
            }
            (Register { .. } | RegisterPair { .. } | Xmm { .. }, StackSlot { .. } | DoubleStackSlot { .. }) => {
                self.reg_to_stack(src, dst)
            }
            (Register { .. } | RegisterPair { .. } | Xmm { .. }, Address { .. }) => {
                self.reg_to_mem(src, dst, info)
            }
            (StackSlot { .. } | DoubleStackSlot { .. }, Register { .. } | RegisterPair { .. } | Xmm { .. }) => {
                self.stack_to_reg(src, dst)
            }
            (StackSlot { .. } | DoubleStackSlot { .. }, StackSlot { .. } | DoubleStackSlot { .. }) => {
                self.stack_to_stack(src, dst)
            }
            (Address { .. }, Register { .. } | RegisterPair { .. } | Xmm { .. }) => {
                self.mem_to_reg(src, dst, info)
            }
            (Constant { value }, Register { .. } | RegisterPair { .. } | Xmm { .. }) => {
                self.const_to_reg(value, dst)
            }
            (Constant { value }, StackSlot { .. } | DoubleStackSlot { .. }) => {
                self.const_to_stack(value, dst)
            }
            (Constant { value }, Address { .. }) => self.const_to_mem(value, dst, info),
            _ => Err(EmitError::unsupported(format!("move {src} -> {dst}"))),
        }
    }

    fn reg_to_reg(&mut self, src: &Operand, dst: &Operand) -> EmitResult {
        match (src.loc, dst.loc) {
            (Location::Register { .. }, Location::Register { .. }) => {
                let (s, d) = (self.reg(src)?, self.reg(dst)?);
                if s != d {
                    let width = self.width(dst.kind);
                    X86_64Assembler::new(&mut self.buf).mov_rr(width, d, s);
                }
                if dst.kind == Kind::Object {
                    self.verify_oop(d);
                }
                Ok(())
            }
            (Location::RegisterPair { .. }, Location::RegisterPair { .. }) => {
                let (src, dst) = (self.pair(src)?, self.pair(dst)?);
                self.move_pair(src, dst);
                Ok(())
            }
            (Location::Xmm { .. }, Location::Xmm { .. }) => {
                let fp = Self::fp(dst.kind)?;
                let (s, d) = (self.xmm(src)?, self.xmm(dst)?);
                if s != d {
                    X86_64Assembler::new(&mut self.buf).movs_rr(fp, d, s);
                }
                Ok(())
            }
            // raw bit moves between the register files
            (Location::Register { .. }, Location::Xmm { .. }) => {
                let width = self.bits_width(dst.kind)?;
                let (s, d) = (self.reg(src)?, self.xmm(dst)?);
                X86_64Assembler::new(&mut self.buf).movd_to_xmm(width, d, s);
                Ok(())
            }
            (Location::Xmm { .. }, Location::Register { .. }) => {
                let width = self.bits_width(src.kind)?;
                let (s, d) = (self.xmm(src)?, self.reg(dst)?);
                X86_64Assembler::new(&mut self.buf).movd_from_xmm(width, d, s);
                Ok(())
            }
            _ => Err(EmitError::unsupported(format!("move {src} -> {dst}"))),
        }
    }

    fn bits_width(&self, kind: Kind) -> EmitResult<Width> {
        match kind {
            Kind::Float | Kind::Int => Ok(Width::Dword),
            Kind::Double | Kind::Long if self.is_64bit() => Ok(Width::Qword),
            other => Err(EmitError::unsupported(format!("bit move of {other}"))),
        }
    }

    /// Moves a register pair, ordering the halves so neither source half
    /// is clobbered before it is read.
    pub(super) fn move_pair(&mut self, (src_lo, src_hi): (Reg, Reg), (dst_lo, dst_hi): (Reg, Reg)) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if dst_lo == src_hi && dst_hi == src_lo {
            asm.xchg(Width::Dword, src_lo, src_hi);
            return;
        }
        let halves = if dst_lo == src_hi {
            [(dst_hi, src_hi), (dst_lo, src_lo)]
        } else {
            [(dst_lo, src_lo), (dst_hi, src_hi)]
        };
        for (d, s) in halves {
            if d != s {
                asm.mov_rr(Width::Dword, d, s);
            }
        }
    }

    fn reg_to_stack(&mut self, src: &Operand, dst: &Operand) -> EmitResult {
        let addr = self.stack_address(dst)?;
        match src.loc {
            Location::Register { .. } => {
                let reg = self.reg(src)?;
                if src.kind == Kind::Object {
                    self.verify_oop(reg);
                }
                let width = self.width(src.kind);
                X86_64Assembler::new(&mut self.buf).store(width, &addr, reg);
            }
            Location::RegisterPair { .. } => {
                let (lo, hi) = self.pair(src)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.store(Width::Dword, &addr, lo);
                asm.store(Width::Dword, &addr.offset(4), hi);
            }
            _ => {
                let fp = Self::fp(src.kind)?;
                let xmm = self.xmm(src)?;
                X86_64Assembler::new(&mut self.buf).movs_store(fp, &addr, xmm);
            }
        }
        Ok(())
    }

    fn stack_to_reg(&mut self, src: &Operand, dst: &Operand) -> EmitResult {
        let addr = self.stack_address(src)?;
        match dst.loc {
            Location::Register { .. } => {
                let reg = self.reg(dst)?;
                let width = self.width(dst.kind);
                X86_64Assembler::new(&mut self.buf).load(width, reg, &addr);
                if dst.kind == Kind::Object {
                    self.verify_oop(reg);
                }
            }
            Location::RegisterPair { .. } => {
                let (lo, hi) = self.pair(dst)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.load(Width::Dword, lo, &addr);
                asm.load(Width::Dword, hi, &addr.offset(4));
            }
            _ => {
                let fp = Self::fp(dst.kind)?;
                let xmm = self.xmm(dst)?;
                X86_64Assembler::new(&mut self.buf).movs_load(fp, xmm, &addr);
            }
        }
        Ok(())
    }

    /// Copies through the stack with push and pop so no register is needed.
    fn stack_to_stack(&mut self, src: &Operand, dst: &Operand) -> EmitResult {
        let (from, to) = (self.stack_address(src)?, self.stack_address(dst)?);
        let words = if !self.is_64bit() && src.kind.is_double_word() { 2 } else { 1 };
        let mut asm = X86_64Assembler::new(&mut self.buf);
        for i in 0..words {
            asm.push_m(&from.offset(4 * i));
            asm.pop_m(&to.offset(4 * i));
        }
        Ok(())
    }

    fn reg_to_mem(&mut self, src: &Operand, dst: &Operand, info: Option<&CodeEmitInfo>) -> EmitResult {
        let Location::Address { addr } = dst.loc else {
            return Err(EmitError::unsupported(format!("store to {dst}")));
        };
        let addr = self.address(&addr)?;
        if src.kind == Kind::Object
            && let Some(reg) = src.as_register()
        {
            self.verify_oop(reg);
        }
        let at = self.buf.position();
        match src.loc {
            Location::Register { .. } => {
                let reg = self.reg(src)?;
                match dst.kind {
                    Kind::Byte | Kind::Boolean => {
                        self.check_byte_reg(reg)?;
                        X86_64Assembler::new(&mut self.buf).store_u8(&addr, reg);
                    }
                    Kind::Char | Kind::Short => {
                        X86_64Assembler::new(&mut self.buf).store_u16(&addr, reg);
                    }
                    kind => {
                        let width = self.width(kind);
                        X86_64Assembler::new(&mut self.buf).store(width, &addr, reg);
                    }
                }
            }
            Location::RegisterPair { .. } => {
                let (lo, hi) = self.pair(src)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.store(Width::Dword, &addr, lo);
                asm.store(Width::Dword, &addr.offset(4), hi);
            }
            _ => {
                let fp = Self::fp(src.kind)?;
                let xmm = self.xmm(src)?;
                X86_64Assembler::new(&mut self.buf).movs_store(fp, &addr, xmm);
            }
        }
        if let Some(info) = info {
            self.record_implicit_exception(at, info)?;
        }
        Ok(())
    }

    fn mem_to_reg(&mut self, src: &Operand, dst: &Operand, info: Option<&CodeEmitInfo>) -> EmitResult {
        let Location::Address { addr: operand } = src.loc else {
            return Err(EmitError::unsupported(format!("load from {src}")));
        };
        let addr = self.address(&operand)?;
        let at = self.buf.position();
        match dst.loc {
            Location::Register { .. } => {
                let reg = self.reg(dst)?;
                let width = self.width(src.kind);
                let mut asm = X86_64Assembler::new(&mut self.buf);
                match src.kind {
                    Kind::Byte => asm.load_i8(Width::Dword, reg, &addr),
                    Kind::Boolean => asm.load_u8(Width::Dword, reg, &addr),
                    Kind::Char => asm.load_u16(Width::Dword, reg, &addr),
                    Kind::Short => asm.load_i16(Width::Dword, reg, &addr),
                    _ => asm.load(width, reg, &addr),
                }
            }
            Location::RegisterPair { .. } => {
                let (lo, hi) = self.pair(dst)?;
                let uses = |r: Reg| operand.base == r || operand.index == Some(r);
                if uses(lo) && uses(hi) {
                    return Err(EmitError::unsupported(format!("load {src} clobbers its address")));
                }
                let mut asm = X86_64Assembler::new(&mut self.buf);
                if uses(lo) {
                    asm.load(Width::Dword, hi, &addr.offset(4));
                    asm.load(Width::Dword, lo, &addr);
                } else {
                    asm.load(Width::Dword, lo, &addr);
                    asm.load(Width::Dword, hi, &addr.offset(4));
                }
            }
            _ => {
                let fp = Self::fp(dst.kind)?;
                let xmm = self.xmm(dst)?;
                X86_64Assembler::new(&mut self.buf).movs_load(fp, xmm, &addr);
            }
        }
        if let Some(info) = info {
            self.record_implicit_exception(at, info)?;
        }
        if src.kind == Kind::Object
            && let Some(reg) = dst.as_register()
        {
            self.verify_oop(reg);
        }
        Ok(())
    }

    /// IA-32 has byte forms only for eax, ecx, edx and ebx.
    pub(super) fn check_byte_reg(&self, reg: Reg) -> EmitResult {
        if !self.is_64bit() && reg.encoding() >= 4 {
            return Err(EmitError::unsupported(format!("{reg:?} has no byte form on ia32")));
        }
        Ok(())
    }

    pub(super) fn const_to_reg(&mut self, value: Constant, dst: &Operand) -> EmitResult {
        match dst.loc {
            Location::Register { .. } => {
                let reg = self.reg(dst)?;
                match value {
                    Constant::Object(o) => self.load_object(reg, o.0),
                    Constant::Long(v) if self.is_64bit() => {
                        X86_64Assembler::new(&mut self.buf).mov_ri(Width::Qword, reg, v);
                    }
                    Constant::Double(_) if self.is_64bit() => {
                        X86_64Assembler::new(&mut self.buf).mov_ri(Width::Qword, reg, value.bits() as i64);
                    }
                    Constant::Int(_) | Constant::Float(_) => {
                        X86_64Assembler::new(&mut self.buf).mov_ri(Width::Dword, reg, value.lo() as i64);
                    }
                    _ => return Err(EmitError::unsupported(format!("{value} into {dst}"))),
                }
            }
            Location::RegisterPair { .. } => {
                let (lo, hi) = self.pair(dst)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.mov_ri(Width::Dword, lo, value.lo() as i64);
                asm.mov_ri(Width::Dword, hi, value.hi() as i64);
            }
            _ => {
                let fp = Self::fp(dst.kind)?;
                let xmm = self.xmm(dst)?;
                if value.is_zero_bits() {
                    X86_64Assembler::new(&mut self.buf).xorp(fp, xmm, xmm);
                } else if self.is_64bit() {
                    let at = X86_64Assembler::new(&mut self.buf).movs_rip(fp, xmm);
                    self.record_literal(at, value);
                } else {
                    let slot = self.stage_constant(value);
                    X86_64Assembler::new(&mut self.buf).movs_load(fp, xmm, &slot);
                }
            }
        }
        Ok(())
    }

    fn const_to_stack(&mut self, value: Constant, dst: &Operand) -> EmitResult {
        let addr = self.stack_address(dst)?;
        self.store_constant(value, dst.kind, &addr);
        Ok(())
    }

    fn const_to_mem(&mut self, value: Constant, dst: &Operand, info: Option<&CodeEmitInfo>) -> EmitResult {
        let Location::Address { addr } = dst.loc else {
            return Err(EmitError::unsupported(format!("store to {dst}")));
        };
        let addr = self.address(&addr)?;
        let at = match dst.kind {
            Kind::Byte | Kind::Boolean => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.store_imm8(&addr, value.lo() as u8);
                at
            }
            Kind::Char | Kind::Short => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.store_imm16(&addr, value.lo() as u16);
                at
            }
            kind => self.store_constant(value, kind, &addr),
        };
        if let Some(info) = info {
            self.record_implicit_exception(at, info)?;
        }
        Ok(())
    }

    /// Stores a constant of `kind` to memory and returns the offset of the
    /// first instruction that touches it. 64-bit values that do not fit a
    /// sign-extended immediate go through the scratch register, or are
    /// split into words on IA-32.
    pub(super) fn store_constant(&mut self, value: Constant, kind: Kind, addr: &Address) -> usize {
        let word = self.word_width();
        match value {
            Constant::Object(ObjectRef(0)) => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.store_imm(word, addr, 0);
                at
            }
            Constant::Object(o) if self.is_64bit() => {
                self.load_object(regs::SCRATCH, o.0);
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.store(Width::Qword, addr, regs::SCRATCH);
                at
            }
            _ if kind.is_double_word() => {
                let bits = value.bits() as i64;
                let is_64bit = self.is_64bit();
                let mut asm = X86_64Assembler::new(&mut self.buf);
                match i32::try_from(bits) {
                    Ok(imm) if is_64bit => {
                        let at = asm.position();
                        asm.store_imm(Width::Qword, addr, imm);
                        at
                    }
                    _ if is_64bit => {
                        asm.mov_ri64(regs::SCRATCH, bits);
                        let at = asm.position();
                        asm.store(Width::Qword, addr, regs::SCRATCH);
                        at
                    }
                    _ => {
                        let at = asm.position();
                        asm.store_imm(Width::Dword, addr, value.lo());
                        asm.store_imm(Width::Dword, &addr.offset(4), value.hi());
                        at
                    }
                }
            }
            _ => {
                let width = if kind == Kind::Object { word } else { self.width(kind) };
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.store_imm(width, addr, value.lo());
                at
            }
        }
    }

    pub(super) fn emit_lea(&mut self, addr: &Operand, dst: &Operand) -> EmitResult {
        let addr = self.memory_address(addr)?;
        let dst = self.reg(dst)?;
        let width = self.word_width();
        X86_64Assembler::new(&mut self.buf).lea(width, dst, &addr);
        Ok(())
    }

    pub(super) fn emit_monitor_address(&mut self, monitor: u32, dst: &Operand) -> EmitResult {
        if monitor >= self.frame.monitors() {
            return Err(EmitError::unsupported(format!("monitor {monitor} outside the frame")));
        }
        let addr = self.frame.monitor_lock_address(monitor);
        let dst = self.reg(dst)?;
        let width = self.word_width();
        X86_64Assembler::new(&mut self.buf).lea(width, dst, &addr);
        Ok(())
    }

    /// Loads `op` into `dst` unless it is already there.
    pub(super) fn load_xmm(&mut self, op: &Operand, dst: Xmm) -> EmitResult {
        match op.loc {
            Location::Xmm { xmm } if xmm == dst => Ok(()),
            _ => self.emit_move(op, &Operand::xmm(dst, op.kind), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::asm::{Reg, Xmm};
    use crate::config::{Arch, CompilerConfig};
    use crate::lir::{AddressOperand, CodeEmitInfo, Constant, Kind, LirMethod, LirOp, Operand};
    use crate::runtime::MethodId;
    use crate::scope::ScopeId;
    use crate::target::StopKind;

    fn ia32() -> CompilerConfig {
        let mut config = CompilerConfig::default();
        config.target.arch = Arch::Ia32;
        config
    }

    fn mv(src: Operand, dst: Operand) -> LirOp {
        LirOp::Move { src, dst, info: None }
    }

    #[test]
    fn test_register_and_stack_moves() {
        let config = CompilerConfig::default();
        let code = body(
            &config,
            vec![
                mv(Operand::reg(Reg::Rsi, Kind::Int), Operand::reg(Reg::Rax, Kind::Int)),
                mv(Operand::reg(Reg::Rdi, Kind::Object), Operand::stack(1, Kind::Object)),
                mv(Operand::stack(0, Kind::Long), Operand::stack(1, Kind::Long)),
            ],
            2,
        );
        assert_eq!(
            code,
            vec![
                0x89, 0xF0, // mov eax, esi
                0x48, 0x89, 0x7C, 0x24, 0x30, // mov [rsp+48], rdi
                0xFF, 0x74, 0x24, 0x28, // push [rsp+40]
                0x8F, 0x44, 0x24, 0x30, // pop [rsp+48]
            ]
        );
    }

    #[test]
    fn test_sub_word_loads_extend_by_kind() {
        let config = CompilerConfig::default();
        let addr = AddressOperand::new(Reg::Rsi, 16);
        let code = body(
            &config,
            vec![
                mv(Operand::address(addr, Kind::Byte), Operand::reg(Reg::Rax, Kind::Int)),
                mv(Operand::address(addr, Kind::Char), Operand::reg(Reg::Rax, Kind::Int)),
            ],
            0,
        );
        assert_eq!(code, vec![0x0F, 0xBE, 0x46, 0x10, 0x0F, 0xB7, 0x46, 0x10]);
    }

    #[test]
    fn test_swapped_pair_uses_xchg() {
        let code = body(
            &ia32(),
            vec![mv(Operand::pair(Reg::Rax, Reg::Rdx), Operand::pair(Reg::Rdx, Reg::Rax))],
            0,
        );
        assert_eq!(code, vec![0x87, 0xC2]);
    }

    #[test]
    fn test_pair_load_avoids_clobbering_base() {
        let addr = AddressOperand::new(Reg::Rax, 8);
        let code = body(
            &ia32(),
            vec![mv(Operand::address(addr, Kind::Long), Operand::pair(Reg::Rax, Reg::Rdx))],
            0,
        );
        // mov edx, [eax+12]; mov eax, [eax+8]
        assert_eq!(code, vec![0x8B, 0x50, 0x0C, 0x8B, 0x40, 0x08]);
    }

    #[test]
    fn test_float_constants() {
        let config = CompilerConfig::default();
        let code = body(
            &config,
            vec![
                mv(Operand::constant(Constant::Float(0.0)), Operand::xmm(Xmm(1), Kind::Float)),
                mv(Operand::constant(Constant::Double(1.5)), Operand::xmm(Xmm(0), Kind::Double)),
            ],
            0,
        );
        // xorps xmm1, xmm1; movsd xmm0, [rip+0]
        assert_eq!(
            code,
            vec![0x0F, 0x57, 0xC9, 0xF2, 0x0F, 0x10, 0x05, 0x00, 0x00, 0x00, 0x00]
        );

        let lir = LirMethod::new(
            MethodId(0),
            vec![
                mv(Operand::constant(Constant::Double(1.5)), Operand::xmm(Xmm(0), Kind::Double)),
                LirOp::Return { result: None },
            ],
        );
        let method = compile_with(&config, &model(), &lir).unwrap();
        assert_eq!(method.literals.scalars[..8], 1.5f64.to_bits().to_le_bytes());
    }

    #[test]
    fn test_faulting_load_records_safepoint() {
        let config = CompilerConfig::default();
        let info = CodeEmitInfo::new(ScopeId::ROOT, 4).with_register_ref(Reg::Rsi);
        let lir = LirMethod::new(
            MethodId(0),
            vec![
                LirOp::Move {
                    src: Operand::address(AddressOperand::new(Reg::Rsi, 16), Kind::Int),
                    dst: Operand::reg(Reg::Rax, Kind::Int),
                    info: Some(info),
                },
                LirOp::Return { result: None },
            ],
        );
        let method = compile_with(&config, &model(), &lir).unwrap();
        let stop = method.stops.get(0).unwrap();
        assert_eq!(stop.kind, StopKind::Safepoint);
        assert_eq!(stop.offset, 20);
        assert!(method.reference_maps.is_register_ref(0, Reg::Rsi.encoding() as usize));
    }

    #[test]
    fn test_wide_long_constant_to_memory_uses_scratch() {
        let config = CompilerConfig::default();
        let code = body(
            &config,
            vec![mv(
                Operand::constant(Constant::Long(1 << 40)),
                Operand::address(AddressOperand::new(Reg::Rdi, 0), Kind::Long),
            )],
            0,
        );
        assert_eq!(&code[..2], &[0x49, 0xBA]);
        assert_eq!(&code[10..], &[0x4C, 0x89, 0x17]);
    }
}
