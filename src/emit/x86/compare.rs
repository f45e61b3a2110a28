//! Compares, branches, conditional moves and atomics.

use super::{X86Emitter, regs};
use crate::asm::{Address, AluOp, Cond, Reg, Width, X86_64Assembler};
use crate::error::{EmitError, EmitResult};
use crate::lir::{
    CodeEmitInfo, CompareToIntOp, Condition, Constant, Kind, LabelId, Location, MemBarKind, Operand,
};

/// Condition after an integer compare.
fn int_cond(cond: Condition) -> EmitResult<Cond> {
    Ok(match cond {
        Condition::Equal => Cond::E,
        Condition::NotEqual => Cond::Ne,
        Condition::Less => Cond::L,
        Condition::LessEqual => Cond::Le,
        Condition::GreaterEqual => Cond::Ge,
        Condition::Greater => Cond::G,
        Condition::BelowEqual => Cond::Be,
        Condition::AboveEqual => Cond::Ae,
        Condition::Always => return Err(EmitError::unsupported("no flag test for `always`")),
    })
}

/// Condition after `ucomis`, which sets the flags like an unsigned compare.
fn float_cond(cond: Condition) -> EmitResult<Cond> {
    Ok(match cond {
        Condition::Equal => Cond::E,
        Condition::NotEqual => Cond::Ne,
        Condition::Less => Cond::B,
        Condition::LessEqual => Cond::Be,
        Condition::Greater => Cond::A,
        Condition::GreaterEqual => Cond::Ae,
        other => return Err(EmitError::unsupported(format!("{other:?} on floats"))),
    })
}

fn cond_for(cond: Condition, kind: Kind) -> EmitResult<Cond> {
    if kind.is_float() { float_cond(cond) } else { int_cond(cond) }
}

impl X86Emitter<'_> {
    pub(super) fn emit_compare(
        &mut self,
        cond: Condition,
        left: &Operand,
        right: &Operand,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        if left.kind.is_float() {
            return self.compare_float(left, right);
        }
        if left.kind == Kind::Long && !self.is_64bit() {
            return self.compare_long_pair(cond, left, right);
        }
        let width = self.width(left.kind);
        match (left.loc, right.loc) {
            (Location::Register { .. }, Location::Register { .. }) => {
                let (l, r) = (self.reg(left)?, self.reg(right)?);
                X86_64Assembler::new(&mut self.buf).alu_rr(AluOp::Cmp, width, l, r);
            }
            (Location::Register { .. }, Location::Constant { value }) => {
                let l = self.reg(left)?;
                self.compare_constant(l, width, value);
            }
            (Location::Register { .. }, _) => {
                let l = self.reg(left)?;
                let addr = self.memory_address(right)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.alu_rm(AluOp::Cmp, width, l, &addr);
                if let Some(info) = info {
                    self.record_implicit_exception(at, info)?;
                }
            }
            (
                Location::Address { .. } | Location::StackSlot { .. } | Location::DoubleStackSlot { .. },
                Location::Constant { value },
            ) => {
                let imm = self.imm32(value).ok_or_else(|| {
                    EmitError::unsupported(format!("compare {left} with wide {right}"))
                })?;
                let addr = self.memory_address(left)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.alu_mi(AluOp::Cmp, width, &addr, imm);
                if let Some(info) = info {
                    self.record_implicit_exception(at, info)?;
                }
            }
            _ => return Err(EmitError::unsupported(format!("compare {left} with {right}"))),
        }
        Ok(())
    }

    /// `value` as a sign-extended 32-bit immediate, if it has one.
    fn imm32(&self, value: Constant) -> Option<i32> {
        match value {
            Constant::Object(o) if !o.is_null() && self.is_64bit() => None,
            Constant::Long(v) => i32::try_from(v).ok(),
            other => Some(other.lo()),
        }
    }

    fn compare_constant(&mut self, l: Reg, width: Width, value: Constant) {
        match value {
            Constant::Object(o) if o.is_null() => {
                X86_64Assembler::new(&mut self.buf).test_rr(width, l, l);
            }
            Constant::Object(o) if self.is_64bit() => {
                self.load_object(regs::SCRATCH, o.0);
                X86_64Assembler::new(&mut self.buf).alu_rr(AluOp::Cmp, width, l, regs::SCRATCH);
            }
            Constant::Long(v) => match i32::try_from(v) {
                Ok(imm) => X86_64Assembler::new(&mut self.buf).alu_ri(AluOp::Cmp, width, l, imm),
                Err(_) => {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.mov_ri64(regs::SCRATCH, v);
                    asm.alu_rr(AluOp::Cmp, width, l, regs::SCRATCH);
                }
            },
            other => X86_64Assembler::new(&mut self.buf).alu_ri(AluOp::Cmp, width, l, other.lo()),
        }
    }

    fn compare_float(&mut self, left: &Operand, right: &Operand) -> EmitResult {
        let fp = Self::fp(left.kind)?;
        let l = self.xmm(left)?;
        match right.loc {
            Location::Xmm { .. } => {
                let r = self.xmm(right)?;
                X86_64Assembler::new(&mut self.buf).ucomis(fp, l, r);
            }
            Location::Constant { value } if self.is_64bit() => {
                let at = X86_64Assembler::new(&mut self.buf).ucomis_rip(fp, l);
                self.record_literal(at, value);
            }
            Location::Constant { value } => {
                let slot = self.stage_constant(value);
                X86_64Assembler::new(&mut self.buf).ucomis_m(fp, l, &slot);
            }
            _ => {
                let addr = self.memory_address(right)?;
                X86_64Assembler::new(&mut self.buf).ucomis_m(fp, l, &addr);
            }
        }
        Ok(())
    }

    /// Long compare on IA-32. Clobbers the left pair; only the conditions
    /// the subtract-with-borrow flags answer are accepted.
    fn compare_long_pair(&mut self, cond: Condition, left: &Operand, right: &Operand) -> EmitResult {
        let (xl, xh) = self.pair(left)?;
        match cond {
            Condition::Equal
            | Condition::NotEqual
            | Condition::Less
            | Condition::GreaterEqual => {}
            other => {
                return Err(EmitError::unsupported(format!("long compare for {other:?}")));
            }
        }
        let mut asm = X86_64Assembler::new(&mut self.buf);
        match right.loc {
            Location::RegisterPair { lo, hi } => {
                asm.alu_rr(AluOp::Sub, Width::Dword, xl, lo);
                asm.alu_rr(AluOp::Sbb, Width::Dword, xh, hi);
            }
            Location::Constant { value } => {
                asm.alu_ri(AluOp::Sub, Width::Dword, xl, value.lo());
                asm.alu_ri(AluOp::Sbb, Width::Dword, xh, value.hi());
            }
            _ => return Err(EmitError::unsupported(format!("long compare with {right}"))),
        }
        if matches!(cond, Condition::Equal | Condition::NotEqual) {
            asm.alu_rr(AluOp::Or, Width::Dword, xh, xl);
        }
        Ok(())
    }

    pub(super) fn emit_branch(
        &mut self,
        cond: Condition,
        kind: Kind,
        label: LabelId,
        unordered: Option<LabelId>,
    ) -> EmitResult {
        let target = self.label(label);
        if cond == Condition::Always {
            X86_64Assembler::new(&mut self.buf).jmp(target);
            return Ok(());
        }
        if !kind.is_float() {
            let cc = int_cond(cond)?;
            X86_64Assembler::new(&mut self.buf).jcc(cc, target);
            return Ok(());
        }
        let cc = float_cond(cond)?;
        // without an unordered target a NaN operand falls through
        let (unordered, skip) = match unordered {
            Some(id) => (self.label(id), None),
            None => {
                let skip = self.buf.new_label();
                (skip, Some(skip))
            }
        };
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.jcc(Cond::P, unordered);
        asm.jcc(cc, target);
        if let Some(skip) = skip {
            asm.buffer().bind(skip);
        }
        Ok(())
    }

    pub(super) fn emit_compare_to_int(
        &mut self,
        cmp: CompareToIntOp,
        left: &Operand,
        right: &Operand,
        dst: &Operand,
    ) -> EmitResult {
        match cmp {
            CompareToIntOp::FloatCompareLess | CompareToIntOp::FloatCompareGreater => {
                let d = self.reg(dst)?;
                self.compare_float(left, right)?;
                let less = cmp == CompareToIntOp::FloatCompareLess;
                let done = self.buf.new_label();
                let mut asm = X86_64Assembler::new(&mut self.buf);
                // mov leaves the flags of the compare intact
                if less {
                    asm.mov_ri(Width::Dword, d, -1);
                    asm.jcc_short(Cond::P, done);
                    asm.jcc_short(Cond::B, done);
                } else {
                    asm.mov_ri(Width::Dword, d, 1);
                    asm.jcc_short(Cond::P, done);
                    asm.jcc_short(Cond::A, done);
                }
                asm.mov_ri(Width::Dword, d, 0);
                asm.jcc_short(Cond::E, done);
                if less {
                    asm.inc(Width::Dword, d);
                } else {
                    asm.dec(Width::Dword, d);
                }
                asm.buffer().bind(done);
                Ok(())
            }
            CompareToIntOp::LongCompare if self.is_64bit() => {
                let d = self.reg(dst)?;
                let l = self.reg(left)?;
                if right.as_register() == Some(d) {
                    return Err(EmitError::unsupported(format!("{right} aliases the result {dst}")));
                }
                match right.as_constant() {
                    Some(value) => self.compare_constant(l, Width::Qword, value),
                    None => {
                        let r = self.reg(right)?;
                        X86_64Assembler::new(&mut self.buf).alu_rr(AluOp::Cmp, Width::Qword, l, r);
                    }
                }
                let done = self.buf.new_label();
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.mov_ri(Width::Dword, d, -1);
                asm.jcc_short(Cond::L, done);
                asm.setcc(Cond::Ne, d);
                asm.movzx_rr8(Width::Dword, d, d);
                asm.buffer().bind(done);
                Ok(())
            }
            CompareToIntOp::LongCompare => {
                let (xl, xh) = self.pair(left)?;
                let (yl, yh) = self.pair(right)?;
                let d = self.reg(dst)?;
                let (high, low, done) = (self.buf.new_label(), self.buf.new_label(), self.buf.new_label());
                let w = Width::Dword;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.alu_rr(AluOp::Cmp, w, xh, yh);
                asm.jcc_short(Cond::L, low);
                asm.jcc_short(Cond::G, high);
                // the high word of the left operand receives the result
                asm.alu_rr(AluOp::Xor, w, xh, xh);
                asm.alu_rr(AluOp::Cmp, w, xl, yl);
                asm.jcc_short(Cond::B, low);
                asm.jcc_short(Cond::E, done);
                asm.buffer().bind(high);
                asm.alu_rr(AluOp::Xor, w, xh, xh);
                asm.inc(w, xh);
                asm.jmp_short(done);
                asm.buffer().bind(low);
                asm.alu_rr(AluOp::Xor, w, xh, xh);
                asm.dec(w, xh);
                asm.buffer().bind(done);
                if d != xh {
                    asm.mov_rr(w, d, xh);
                }
                Ok(())
            }
        }
    }

    /// `dst = cond ? left : right` on the flags of the preceding compare.
    pub(super) fn emit_cond_move(
        &mut self,
        cond: Condition,
        kind: Kind,
        left: &Operand,
        right: &Operand,
        dst: &Operand,
    ) -> EmitResult {
        let cc = cond_for(cond, kind)?;
        let aliases = match (right.loc, dst.loc) {
            (Location::Register { reg: r }, Location::Register { reg: d }) => r == d,
            (Location::Xmm { xmm: r }, Location::Xmm { xmm: d }) => r == d,
            (Location::RegisterPair { lo, hi }, Location::RegisterPair { lo: dl, hi: dh }) => {
                [lo, hi].iter().any(|r| *r == dl || *r == dh)
            }
            _ => false,
        };
        if aliases && left.loc != right.loc {
            return Err(EmitError::unsupported(format!("{right} aliases the result {dst}")));
        }
        // moves must not touch the flags, so constants are loaded with mov
        self.emit_move(left, dst, None)?;

        let use_cmov = self.config.target.supports_cmov
            && !kind.is_float()
            && dst.as_register().is_some()
            && matches!(
                right.loc,
                Location::Register { .. } | Location::StackSlot { .. } | Location::DoubleStackSlot { .. }
            );
        if use_cmov {
            let d = self.reg(dst)?;
            let width = self.width(dst.kind);
            let ncc = cc.invert();
            match right.loc {
                Location::Register { .. } => {
                    let r = self.reg(right)?;
                    X86_64Assembler::new(&mut self.buf).cmov(ncc, width, d, r);
                }
                _ => {
                    let addr = self.stack_address(right)?;
                    X86_64Assembler::new(&mut self.buf).cmov_rm(ncc, width, d, &addr);
                }
            }
            return Ok(());
        }

        let skip = self.buf.new_label();
        X86_64Assembler::new(&mut self.buf).jcc(cc, skip);
        self.emit_move(right, dst, None)?;
        self.buf.bind(skip);
        Ok(())
    }

    pub(super) fn emit_compare_and_swap(
        &mut self,
        addr: &Operand,
        cmp_value: &Operand,
        new_value: &Operand,
    ) -> EmitResult {
        let address = match addr.loc {
            Location::Register { .. } => Address::new(self.reg(addr)?, 0),
            _ => self.memory_address(addr)?,
        };
        let is_mp = self.model.is_mp;
        if new_value.kind == Kind::Long && !self.is_64bit() {
            if self.pair(cmp_value)? != (Reg::Rax, Reg::Rdx) || self.pair(new_value)? != (Reg::Rbx, Reg::Rcx) {
                return Err(EmitError::unsupported("cmpxchg8b needs edx:eax and ecx:ebx"));
            }
            let mut asm = X86_64Assembler::new(&mut self.buf);
            if is_mp {
                asm.lock();
            }
            asm.cmpxchg8b(&address);
            return Ok(());
        }
        if self.reg(cmp_value)? != Reg::Rax {
            return Err(EmitError::unsupported("compare value must be in rax"));
        }
        let new = self.reg(new_value)?;
        let width = self.width(new_value.kind);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if is_mp {
            asm.lock();
        }
        asm.cmpxchg(width, &address, new);
        Ok(())
    }

    /// x86 only reorders stores after later loads, so acquire and release
    /// need no instruction.
    pub(super) fn emit_membar(&mut self, kind: MemBarKind) -> EmitResult {
        if kind == MemBarKind::Full && self.model.is_mp {
            X86_64Assembler::new(&mut self.buf).mfence();
        }
        Ok(())
    }
}
