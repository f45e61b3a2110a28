//! Integer, long and floating point arithmetic, logic and shifts.

use super::super::stubs::SlowPath;
use super::{X86Emitter, regs};
use crate::asm::{Address, AluOp, Cond, Fp, Reg, ShiftOp, SseOp, Width, X86_64Assembler, Xmm};
use crate::error::{BailoutReason, EmitError, EmitResult};
use crate::lir::{
    ArithOp, CodeEmitInfo, Constant, IntrinsicOp, Kind, Location, LogicOp, Operand, ShiftKind,
};
use crate::runtime::RuntimeCall;

/// Right-hand side of a two-address integer instruction.
enum Rhs {
    Reg(Reg),
    Imm(i32),
    Mem(Address),
}

impl X86Emitter<'_> {
    pub(super) fn emit_arith(
        &mut self,
        op: ArithOp,
        left: &Operand,
        right: &Operand,
        dst: &Operand,
        temp: Option<&Operand>,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        match dst.kind {
            Kind::Float | Kind::Double => self.arith_float(op, left, right, dst),
            Kind::Long if !self.is_64bit() => self.arith_long_pair(op, left, right, dst, temp, info),
            _ => match op {
                ArithOp::Div | ArithOp::Rem => self.arith_div(op, left, right, dst, temp, info),
                _ => self.arith_int(op, left, right, dst),
            },
        }
    }

    /// Copies `left` into `dst` for a two-address instruction.
    fn two_address(&mut self, left: &Operand, right: &Operand, dst: &Operand) -> EmitResult<Reg> {
        let d = self.reg(dst)?;
        if left.as_register() != Some(d) {
            if right.as_register() == Some(d) {
                return Err(EmitError::unsupported(format!("{right} aliases the result {dst}")));
            }
            self.emit_move(left, dst, None)?;
        }
        Ok(d)
    }

    /// Resolves an integer right operand, materializing 64-bit constants
    /// that do not fit an immediate in the scratch register.
    fn rhs(&mut self, right: &Operand) -> EmitResult<Rhs> {
        match right.loc {
            Location::Register { .. } => Ok(Rhs::Reg(self.reg(right)?)),
            Location::Constant { value } => {
                let bits = match value {
                    Constant::Long(v) => v,
                    other => other.lo() as i64,
                };
                match i32::try_from(bits) {
                    Ok(imm) => Ok(Rhs::Imm(imm)),
                    Err(_) if self.is_64bit() => {
                        X86_64Assembler::new(&mut self.buf).mov_ri64(regs::SCRATCH, bits);
                        Ok(Rhs::Reg(regs::SCRATCH))
                    }
                    Err(_) => Err(EmitError::unsupported(format!("immediate {value}"))),
                }
            }
            _ => Ok(Rhs::Mem(self.memory_address(right)?)),
        }
    }

    fn alu(&mut self, op: AluOp, width: Width, dst: Reg, rhs: &Rhs) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        match rhs {
            Rhs::Reg(r) => asm.alu_rr(op, width, dst, *r),
            Rhs::Imm(imm) => asm.alu_ri(op, width, dst, *imm),
            Rhs::Mem(addr) => asm.alu_rm(op, width, dst, addr),
        }
    }

    fn arith_int(&mut self, op: ArithOp, left: &Operand, right: &Operand, dst: &Operand) -> EmitResult {
        let width = self.width(dst.kind);
        let d = self.two_address(left, right, dst)?;
        let rhs = self.rhs(right)?;
        match op {
            ArithOp::Add => self.alu(AluOp::Add, width, d, &rhs),
            ArithOp::Sub => self.alu(AluOp::Sub, width, d, &rhs),
            ArithOp::Mul => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                match rhs {
                    Rhs::Reg(r) => asm.imul_rr(width, d, r),
                    Rhs::Imm(imm) => asm.imul_rri(width, d, d, imm),
                    Rhs::Mem(addr) => asm.imul_rm(width, d, &addr),
                }
            }
            ArithOp::Div | ArithOp::Rem => {
                return Err(EmitError::unsupported("division reached the two-address path"));
            }
        }
        Ok(())
    }

    /// Signed division. A power of two divisor is strength reduced; any
    /// other divisor uses `idiv` with the dividend in rax and rdx killed,
    /// special-casing MIN / -1 which would trap.
    fn arith_div(
        &mut self,
        op: ArithOp,
        left: &Operand,
        right: &Operand,
        dst: &Operand,
        temp: Option<&Operand>,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        let long = dst.kind == Kind::Long;
        let width = if long { Width::Qword } else { Width::Dword };
        let d = self.reg(dst)?;

        let divisor = match right.as_constant() {
            Some(Constant::Int(v)) => Some(v as i64),
            Some(Constant::Long(v)) => Some(v),
            Some(other) => return Err(EmitError::unsupported(format!("divisor {other}"))),
            None => None,
        };
        if let Some(divisor) = divisor
            && divisor > 1
            && divisor.count_ones() == 1
            && (!long || divisor.trailing_zeros() < 31)
        {
            return self.divide_by_power_of_two(op, left, d, width, divisor);
        }

        let l = self.reg(left)?;
        if l != Reg::Rax {
            return Err(EmitError::unsupported(format!("dividend {left} must be in rax")));
        }
        let r = match divisor {
            Some(value) => {
                let temp = temp.ok_or_else(|| EmitError::unsupported("constant divisor needs a temp"))?;
                let t = self.reg(temp)?;
                X86_64Assembler::new(&mut self.buf).mov_ri(width, t, value);
                t
            }
            None => self.reg(right)?,
        };
        if r == Reg::Rax || r == Reg::Rdx {
            return Err(EmitError::unsupported(format!("divisor {r:?} overlaps rdx:rax")));
        }

        let (normal, done) = (self.buf.new_label(), self.buf.new_label());
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if long {
            asm.mov_ri64(regs::SCRATCH, i64::MIN);
            asm.alu_rr(AluOp::Cmp, width, Reg::Rax, regs::SCRATCH);
        } else {
            asm.alu_ri(AluOp::Cmp, width, Reg::Rax, i32::MIN);
        }
        asm.jcc(Cond::Ne, normal);
        // quotient MIN is already in rax, remainder is zero
        asm.alu_rr(AluOp::Xor, Width::Dword, Reg::Rdx, Reg::Rdx);
        asm.alu_ri(AluOp::Cmp, width, r, -1);
        asm.jcc(Cond::E, done);
        asm.buffer().bind(normal);
        if long {
            asm.cqo();
        } else {
            asm.cdq();
        }
        let at = asm.position();
        asm.idiv(width, r);
        asm.buffer().bind(done);
        if let Some(info) = info {
            self.record_implicit_exception(at, info)?;
        }

        let result = if op == ArithOp::Div { Reg::Rax } else { Reg::Rdx };
        if d != result {
            X86_64Assembler::new(&mut self.buf).mov_rr(width, d, result);
        }
        Ok(())
    }

    fn divide_by_power_of_two(
        &mut self,
        op: ArithOp,
        left: &Operand,
        d: Reg,
        width: Width,
        divisor: i64,
    ) -> EmitResult {
        let log2 = divisor.trailing_zeros() as u8;
        let l = self.reg(left)?;
        if op == ArithOp::Div {
            if l != Reg::Rax {
                return Err(EmitError::unsupported(format!("dividend {left} must be in rax")));
            }
            let mut asm = X86_64Assembler::new(&mut self.buf);
            // round towards zero: add divisor - 1 to negative dividends
            if width == Width::Qword {
                asm.cqo();
            } else {
                asm.cdq();
            }
            if divisor == 2 {
                asm.alu_rr(AluOp::Sub, width, Reg::Rax, Reg::Rdx);
            } else {
                asm.alu_ri(AluOp::And, width, Reg::Rdx, (divisor - 1) as i32);
                asm.alu_rr(AluOp::Add, width, Reg::Rax, Reg::Rdx);
            }
            asm.shift_ri(ShiftOp::Sar, width, Reg::Rax, log2);
            if d != Reg::Rax {
                asm.mov_rr(width, d, Reg::Rax);
            }
            return Ok(());
        }

        let done = self.buf.new_label();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if d != l {
            asm.mov_rr(width, d, l);
        }
        // keep the sign bit and the low bits
        if width == Width::Qword {
            asm.mov_ri64(regs::SCRATCH, i64::MIN | (divisor - 1));
            asm.alu_rr(AluOp::And, width, d, regs::SCRATCH);
        } else {
            asm.alu_ri(AluOp::And, width, d, i32::MIN | (divisor - 1) as i32);
        }
        asm.jcc(Cond::Ns, done);
        asm.dec(width, d);
        asm.alu_ri(AluOp::Or, width, d, !(divisor - 1) as i32);
        asm.inc(width, d);
        asm.buffer().bind(done);
        Ok(())
    }

    /// Longs on IA-32 in register pairs.
    fn arith_long_pair(
        &mut self,
        op: ArithOp,
        left: &Operand,
        right: &Operand,
        dst: &Operand,
        temp: Option<&Operand>,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        match op {
            ArithOp::Add | ArithOp::Sub => {
                let (lo, hi) = self.pair_two_address(left, right, dst)?;
                let (op_lo, op_hi) = if op == ArithOp::Add {
                    (AluOp::Add, AluOp::Adc)
                } else {
                    (AluOp::Sub, AluOp::Sbb)
                };
                self.pair_alu(op_lo, op_hi, (lo, hi), right)
            }
            ArithOp::Mul => {
                let (xl, xh) = self.pair(left)?;
                let (yl, yh) = self.pair(right)?;
                let (dl, dh) = self.pair(dst)?;
                if (xl, xh, dl, dh) != (Reg::Rax, Reg::Rdx, Reg::Rax, Reg::Rdx) {
                    return Err(EmitError::unsupported("long multiply must use edx:eax"));
                }
                let temp = temp.ok_or_else(|| EmitError::unsupported("long multiply needs a temp"))?;
                let t = self.reg(temp)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.imul_rr(Width::Dword, Reg::Rdx, yl);
                asm.mov_rr(Width::Dword, t, yh);
                asm.imul_rr(Width::Dword, t, Reg::Rax);
                asm.alu_rr(AluOp::Add, Width::Dword, t, Reg::Rdx);
                asm.mul(Width::Dword, yl);
                asm.alu_rr(AluOp::Add, Width::Dword, Reg::Rdx, t);
                Ok(())
            }
            ArithOp::Div | ArithOp::Rem => {
                let (xl, xh) = self.pair(left)?;
                let (yl, yh) = self.pair(right)?;
                let temp = temp.ok_or_else(|| EmitError::unsupported("long division needs a temp"))?;
                let t = self.reg(temp)?;
                let info = info.ok_or_else(|| EmitError::unsupported("long division without debug info"))?;

                let zero = self.buf.new_label();
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.mov_rr(Width::Dword, t, yl);
                asm.alu_rr(AluOp::Or, Width::Dword, t, yh);
                asm.jcc(Cond::E, zero);
                self.add_slow_path(SlowPath::Throw {
                    entry: zero,
                    call: RuntimeCall::ThrowDivByZero,
                    argument: None,
                    info: Some(info.clone()),
                });

                for (i, reg) in [xl, xh, yl, yh].into_iter().enumerate() {
                    self.store_argument(i as u32, reg, Width::Dword);
                }
                let call = if op == ArithOp::Div {
                    RuntimeCall::ArithmeticLdiv
                } else {
                    RuntimeCall::ArithmeticLrem
                };
                self.call_runtime(call, Some(info))?;
                let dst = self.pair(dst)?;
                self.move_pair((Reg::Rax, Reg::Rdx), dst);
                Ok(())
            }
        }
    }

    fn pair_two_address(&mut self, left: &Operand, right: &Operand, dst: &Operand) -> EmitResult<(Reg, Reg)> {
        let (lo, hi) = self.pair(dst)?;
        if left.loc != dst.loc {
            if let Location::RegisterPair { lo: rl, hi: rh } = right.loc
                && [rl, rh].iter().any(|r| *r == lo || *r == hi)
            {
                return Err(EmitError::unsupported(format!("{right} aliases the result {dst}")));
            }
            self.emit_move(left, dst, None)?;
        }
        Ok((lo, hi))
    }

    /// Applies `op_lo` to the low words and `op_hi` to the high words.
    fn pair_alu(&mut self, op_lo: AluOp, op_hi: AluOp, (lo, hi): (Reg, Reg), right: &Operand) -> EmitResult {
        match right.loc {
            Location::RegisterPair { .. } => {
                let (rl, rh) = self.pair(right)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.alu_rr(op_lo, Width::Dword, lo, rl);
                asm.alu_rr(op_hi, Width::Dword, hi, rh);
            }
            Location::Constant { value } => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.alu_ri(op_lo, Width::Dword, lo, value.lo());
                asm.alu_ri(op_hi, Width::Dword, hi, value.hi());
            }
            _ => {
                let addr = self.memory_address(right)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.alu_rm(op_lo, Width::Dword, lo, &addr);
                asm.alu_rm(op_hi, Width::Dword, hi, &addr.offset(4));
            }
        }
        Ok(())
    }

    fn arith_float(&mut self, op: ArithOp, left: &Operand, right: &Operand, dst: &Operand) -> EmitResult {
        let fp = Self::fp(dst.kind)?;
        let d = self.xmm(dst)?;
        let sse = match op {
            ArithOp::Add => SseOp::Add,
            ArithOp::Sub => SseOp::Sub,
            ArithOp::Mul => SseOp::Mul,
            ArithOp::Div => SseOp::Div,
            ArithOp::Rem => return self.float_remainder(fp, left, right, d),
        };
        if left.as_xmm() != Some(d) {
            if right.as_xmm() == Some(d) {
                return Err(EmitError::unsupported(format!("{right} aliases the result {dst}")));
            }
            self.load_xmm(left, d)?;
        }
        match right.loc {
            Location::Xmm { .. } => {
                let r = self.xmm(right)?;
                X86_64Assembler::new(&mut self.buf).sse_arith(sse, fp, d, r);
            }
            Location::Constant { value } if self.is_64bit() => {
                let at = X86_64Assembler::new(&mut self.buf).sse_arith_rip(sse, fp, d);
                self.record_literal(at, value);
            }
            Location::Constant { value } => {
                let slot = self.stage_constant(value);
                X86_64Assembler::new(&mut self.buf).sse_arith_m(sse, fp, d, &slot);
            }
            _ => {
                let addr = self.memory_address(right)?;
                X86_64Assembler::new(&mut self.buf).sse_arith_m(sse, fp, d, &addr);
            }
        }
        Ok(())
    }

    /// There is no SSE remainder; the runtime computes it with the
    /// operands in xmm0 and xmm1.
    fn float_remainder(&mut self, fp: Fp, left: &Operand, right: &Operand, d: Xmm) -> EmitResult {
        if !self.is_64bit() {
            return Err(BailoutReason::Unimplemented("float remainder on ia32").into());
        }
        if (left.as_xmm(), right.as_xmm(), d) != (Some(Xmm(0)), Some(Xmm(1)), Xmm(0)) {
            return Err(EmitError::unsupported("float remainder operands must be xmm0 and xmm1"));
        }
        let call = match fp {
            Fp::Single => RuntimeCall::ArithmeticFrem,
            Fp::Double => RuntimeCall::ArithmeticDrem,
        };
        self.call_runtime(call, None)
    }

    pub(super) fn emit_logic(&mut self, op: LogicOp, left: &Operand, right: &Operand, dst: &Operand) -> EmitResult {
        let alu = match op {
            LogicOp::And => AluOp::And,
            LogicOp::Or => AluOp::Or,
            LogicOp::Xor => AluOp::Xor,
        };
        if dst.kind == Kind::Long && !self.is_64bit() {
            let pair = self.pair_two_address(left, right, dst)?;
            return self.pair_alu(alu, alu, pair, right);
        }
        let width = self.width(dst.kind);
        let d = self.two_address(left, right, dst)?;
        let rhs = self.rhs(right)?;
        self.alu(alu, width, d, &rhs);
        Ok(())
    }

    pub(super) fn emit_shift(&mut self, kind: ShiftKind, left: &Operand, count: &Operand, dst: &Operand) -> EmitResult {
        let op = match kind {
            ShiftKind::Shl => ShiftOp::Shl,
            ShiftKind::Shr => ShiftOp::Sar,
            ShiftKind::Ushr => ShiftOp::Shr,
        };
        if dst.kind == Kind::Long && !self.is_64bit() {
            return self.shift_pair(kind, op, left, count, dst);
        }
        let width = self.width(dst.kind);
        let mask = if width == Width::Qword { 63 } else { 31 };
        match count.as_constant() {
            Some(c) => {
                let d = self.two_address(left, count, dst)?;
                let n = (c.lo() & mask) as u8;
                if n != 0 {
                    X86_64Assembler::new(&mut self.buf).shift_ri(op, width, d, n);
                }
            }
            None => {
                if self.reg(count)? != Reg::Rcx || dst.as_register() == Some(Reg::Rcx) {
                    return Err(EmitError::unsupported("variable shift count must be in rcx"));
                }
                let d = self.two_address(left, count, dst)?;
                X86_64Assembler::new(&mut self.buf).shift_cl(op, width, d);
            }
        }
        Ok(())
    }

    fn shift_pair(&mut self, kind: ShiftKind, op: ShiftOp, left: &Operand, count: &Operand, dst: &Operand) -> EmitResult {
        let (lo, hi) = self.pair_two_address(left, count, dst)?;
        let w = Width::Dword;
        if let Some(c) = count.as_constant() {
            let n = (c.lo() & 63) as u8;
            let mut asm = X86_64Assembler::new(&mut self.buf);
            match (kind, n) {
                (_, 0) => {}
                (ShiftKind::Shl, 1..32) => {
                    asm.shld_ri(hi, lo, n);
                    asm.shift_ri(ShiftOp::Shl, w, lo, n);
                }
                (_, 1..32) => {
                    asm.shrd_ri(lo, hi, n);
                    asm.shift_ri(op, w, hi, n);
                }
                (ShiftKind::Shl, _) => {
                    asm.mov_rr(w, hi, lo);
                    if n > 32 {
                        asm.shift_ri(ShiftOp::Shl, w, hi, n - 32);
                    }
                    asm.alu_rr(AluOp::Xor, w, lo, lo);
                }
                (ShiftKind::Shr, _) => {
                    asm.mov_rr(w, lo, hi);
                    if n > 32 {
                        asm.shift_ri(ShiftOp::Sar, w, lo, n - 32);
                    }
                    asm.shift_ri(ShiftOp::Sar, w, hi, 31);
                }
                (ShiftKind::Ushr, _) => {
                    asm.mov_rr(w, lo, hi);
                    if n > 32 {
                        asm.shift_ri(ShiftOp::Shr, w, lo, n - 32);
                    }
                    asm.alu_rr(AluOp::Xor, w, hi, hi);
                }
            }
            return Ok(());
        }

        if self.reg(count)? != Reg::Rcx || lo == Reg::Rcx || hi == Reg::Rcx {
            return Err(EmitError::unsupported("variable shift count must be in ecx"));
        }
        let done = self.buf.new_label();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        // the hardware masks the count to five bits; bit 5 moves whole words
        match kind {
            ShiftKind::Shl => {
                asm.shld_cl(hi, lo);
                asm.shift_cl(ShiftOp::Shl, w, lo);
                asm.test_ri(w, Reg::Rcx, 32);
                asm.jcc_short(Cond::E, done);
                asm.mov_rr(w, hi, lo);
                asm.alu_rr(AluOp::Xor, w, lo, lo);
            }
            ShiftKind::Shr => {
                asm.shrd_cl(lo, hi);
                asm.shift_cl(ShiftOp::Sar, w, hi);
                asm.test_ri(w, Reg::Rcx, 32);
                asm.jcc_short(Cond::E, done);
                asm.mov_rr(w, lo, hi);
                asm.shift_ri(ShiftOp::Sar, w, hi, 31);
            }
            ShiftKind::Ushr => {
                asm.shrd_cl(lo, hi);
                asm.shift_cl(ShiftOp::Shr, w, hi);
                asm.test_ri(w, Reg::Rcx, 32);
                asm.jcc_short(Cond::E, done);
                asm.mov_rr(w, lo, hi);
                asm.alu_rr(AluOp::Xor, w, hi, hi);
            }
        }
        asm.buffer().bind(done);
        Ok(())
    }

    pub(super) fn emit_negate(&mut self, src: &Operand, dst: &Operand) -> EmitResult {
        match dst.kind {
            Kind::Float | Kind::Double => {
                let fp = Self::fp(dst.kind)?;
                let d = self.xmm(dst)?;
                self.load_xmm(src, d)?;
                let mask = match fp {
                    Fp::Single => Constant::Int(i32::MIN),
                    Fp::Double => Constant::Long(i64::MIN),
                };
                self.packed_with_mask(fp, d, mask, true);
            }
            Kind::Long if !self.is_64bit() => {
                let (s, d) = (self.pair(src)?, self.pair(dst)?);
                self.move_pair(s, d);
                let (lo, hi) = d;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.neg(Width::Dword, lo);
                asm.alu_ri(AluOp::Adc, Width::Dword, hi, 0);
                asm.neg(Width::Dword, hi);
            }
            kind => {
                let d = self.reg(dst)?;
                self.emit_move(src, dst, None)?;
                let width = self.width(kind);
                X86_64Assembler::new(&mut self.buf).neg(width, d);
            }
        }
        Ok(())
    }

    /// `xorp` (or `andp`) of `dst` with a sign mask constant.
    fn packed_with_mask(&mut self, fp: Fp, dst: Xmm, mask: Constant, xor: bool) {
        if self.is_64bit() {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            let at = if xor { asm.xorp_rip(fp, dst) } else { asm.andp_rip(fp, dst) };
            self.record_literal(at, mask);
        } else {
            let slot = self.stage_constant(mask);
            let mut asm = X86_64Assembler::new(&mut self.buf);
            if xor {
                asm.xorp_m(fp, dst, &slot);
            } else {
                asm.andp_m(fp, dst, &slot);
            }
        }
    }

    pub(super) fn emit_intrinsic(&mut self, op: IntrinsicOp, src: &Operand, dst: &Operand) -> EmitResult {
        let fp = Self::fp(dst.kind)?;
        let d = self.xmm(dst)?;
        match op {
            IntrinsicOp::Abs => {
                self.load_xmm(src, d)?;
                let mask = match fp {
                    Fp::Single => Constant::Int(i32::MAX),
                    Fp::Double => Constant::Long(i64::MAX),
                };
                self.packed_with_mask(fp, d, mask, false);
            }
            IntrinsicOp::Sqrt => match src.loc {
                Location::Xmm { .. } => {
                    let s = self.xmm(src)?;
                    X86_64Assembler::new(&mut self.buf).sse_arith(SseOp::Sqrt, fp, d, s);
                }
                _ => {
                    let addr = self.memory_address(src)?;
                    X86_64Assembler::new(&mut self.buf).sse_arith_m(SseOp::Sqrt, fp, d, &addr);
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::asm::{Reg, Xmm};
    use crate::config::{Arch, CompilerConfig};
    use crate::error::{BailoutReason, EmitError};
    use crate::lir::{
        ArithOp, CodeEmitInfo, Constant, IntrinsicOp, Kind, LirMethod, LirOp, Operand, ShiftKind,
    };
    use crate::runtime::MethodId;
    use crate::scope::ScopeId;

    fn ia32() -> CompilerConfig {
        let mut config = CompilerConfig::default();
        config.target.arch = Arch::Ia32;
        config
    }

    fn arith(arith: ArithOp, left: Operand, right: Operand, dst: Operand) -> LirOp {
        LirOp::Arith {
            arith,
            left,
            right,
            dst,
            temp: None,
            info: None,
        }
    }

    fn int(reg: Reg) -> Operand {
        Operand::reg(reg, Kind::Int)
    }

    #[test]
    fn test_add_moves_left_into_result() {
        let code = body(
            &CompilerConfig::default(),
            vec![arith(ArithOp::Add, int(Reg::Rsi), Operand::int(5), int(Reg::Rax))],
            0,
        );
        // mov eax, esi; add eax, 5
        assert_eq!(code, vec![0x89, 0xF0, 0x83, 0xC0, 0x05]);
    }

    #[test]
    fn test_divide_by_eight() {
        let code = body(
            &CompilerConfig::default(),
            vec![arith(ArithOp::Div, int(Reg::Rax), Operand::int(8), int(Reg::Rax))],
            0,
        );
        // cdq; and edx, 7; add eax, edx; sar eax, 3
        assert_eq!(code, vec![0x99, 0x83, 0xE2, 0x07, 0x01, 0xD0, 0xC1, 0xF8, 0x03]);
    }

    #[test]
    fn test_remainder_by_power_of_two() {
        let code = body(
            &CompilerConfig::default(),
            vec![arith(ArithOp::Rem, int(Reg::Rsi), Operand::int(4), int(Reg::Rax))],
            0,
        );
        assert_eq!(
            code,
            vec![
                0x89, 0xF0, // mov eax, esi
                0x81, 0xE0, 0x03, 0x00, 0x00, 0x80, // and eax, 0x80000003
                0x0F, 0x89, 0x07, 0x00, 0x00, 0x00, // jns done
                0xFF, 0xC8, // dec eax
                0x83, 0xC8, 0xFC, // or eax, -4
                0xFF, 0xC0, // inc eax
            ]
        );
    }

    #[test]
    fn test_idiv_guards_min_over_minus_one() {
        let info = CodeEmitInfo::new(ScopeId::ROOT, 2);
        let lir = LirMethod::new(
            MethodId(0),
            vec![
                LirOp::Arith {
                    arith: ArithOp::Div,
                    left: int(Reg::Rax),
                    right: int(Reg::Rcx),
                    dst: int(Reg::Rax),
                    temp: None,
                    info: Some(info),
                },
                LirOp::Return { result: None },
            ],
        );
        let method = compile_with(&CompilerConfig::default(), &model(), &lir).unwrap();
        assert_eq!(
            &method.code[20..46],
            &[
                0x81, 0xF8, 0x00, 0x00, 0x00, 0x80, // cmp eax, 0x80000000
                0x0F, 0x85, 0x0B, 0x00, 0x00, 0x00, // jne normal
                0x31, 0xD2, // xor edx, edx
                0x83, 0xF9, 0xFF, // cmp ecx, -1
                0x0F, 0x84, 0x03, 0x00, 0x00, 0x00, // je done
                0x99, // cdq
                0xF7, 0xF9, // idiv ecx
            ]
        );
        // the idiv itself is the faulting instruction
        let stop = method.stops.get(0).unwrap();
        assert_eq!(stop.offset, 44);
        assert_eq!(method.bytecode_location_at(0).unwrap().bci, 2);
    }

    #[test]
    fn test_pair_multiply() {
        let mut lir = LirOp::Arith {
            arith: ArithOp::Mul,
            left: Operand::pair(Reg::Rax, Reg::Rdx),
            right: Operand::pair(Reg::Rbx, Reg::Rcx),
            dst: Operand::pair(Reg::Rax, Reg::Rdx),
            temp: Some(int(Reg::Rsi)),
            info: None,
        };
        let code = body(&ia32(), vec![lir.clone()], 0);
        assert_eq!(
            code,
            vec![
                0x0F, 0xAF, 0xD3, // imul edx, ebx
                0x89, 0xCE, // mov esi, ecx
                0x0F, 0xAF, 0xF0, // imul esi, eax
                0x01, 0xD6, // add esi, edx
                0xF7, 0xE3, // mul ebx
                0x01, 0xF2, // add edx, esi
            ]
        );
        if let LirOp::Arith { temp, .. } = &mut lir {
            *temp = None;
        }
        assert!(matches!(
            compile_with(&ia32(), &model(), &LirMethod::new(MethodId(0), vec![lir])),
            Err(EmitError::ShouldNotReachHere(_))
        ));
    }

    #[test]
    fn test_pair_shift_by_constant() {
        let shift = |shift, n| LirOp::Shift {
            shift,
            left: Operand::pair(Reg::Rax, Reg::Rdx),
            count: Operand::int(n),
            dst: Operand::pair(Reg::Rax, Reg::Rdx),
        };
        let code = body(&ia32(), vec![shift(ShiftKind::Shl, 4), shift(ShiftKind::Ushr, 40)], 0);
        assert_eq!(
            code,
            vec![
                0x0F, 0xA4, 0xC2, 0x04, // shld edx, eax, 4
                0xC1, 0xE0, 0x04, // shl eax, 4
                0x89, 0xD0, // mov eax, edx
                0xC1, 0xE8, 0x08, // shr eax, 8
                0x31, 0xD2, // xor edx, edx
            ]
        );
    }

    #[test]
    fn test_float_negate_uses_sign_mask_literal() {
        let config = CompilerConfig::default();
        let lir = LirMethod::new(
            MethodId(0),
            vec![
                LirOp::Negate {
                    src: Operand::xmm(Xmm(1), Kind::Double),
                    dst: Operand::xmm(Xmm(0), Kind::Double),
                },
                LirOp::Return { result: None },
            ],
        );
        let method = compile_with(&config, &model(), &lir).unwrap();
        // movsd xmm0, xmm1; xorpd xmm0, [rip+disp]
        assert_eq!(&method.code[20..27], &[0xF2, 0x0F, 0x10, 0xC1, 0x66, 0x0F, 0x57]);
        assert_eq!(method.literals.scalars[..8], i64::MIN.to_le_bytes());
        assert_eq!(method.literals.layout.scalar_offset % 16, 0);
    }

    #[test]
    fn test_float_remainder_on_ia32_bails_out() {
        let lir = LirMethod::new(
            MethodId(0),
            vec![arith(
                ArithOp::Rem,
                Operand::xmm(Xmm(0), Kind::Float),
                Operand::xmm(Xmm(1), Kind::Float),
                Operand::xmm(Xmm(0), Kind::Float),
            )],
        );
        let err = compile_with(&ia32(), &model(), &lir).unwrap_err();
        assert!(matches!(err, EmitError::Bailout(BailoutReason::Unimplemented(_))));
    }

    #[test]
    fn test_sqrt() {
        let code = body(
            &CompilerConfig::default(),
            vec![LirOp::Intrinsic {
                intrinsic: IntrinsicOp::Sqrt,
                src: Operand::xmm(Xmm(2), Kind::Double),
                dst: Operand::xmm(Xmm(0), Kind::Double),
            }],
            0,
        );
        assert_eq!(code, vec![0xF2, 0x0F, 0x51, 0xC2]);
    }

    #[test]
    fn test_wide_long_constant_goes_through_scratch() {
        let code = body(
            &CompilerConfig::default(),
            vec![arith(
                ArithOp::Add,
                Operand::reg(Reg::Rax, Kind::Long),
                Operand::constant(Constant::Long(1 << 33)),
                Operand::reg(Reg::Rax, Kind::Long),
            )],
            0,
        );
        // mov r10, imm64; add rax, r10
        assert_eq!(&code[..2], &[0x49, 0xBA]);
        assert_eq!(&code[10..], &[0x4C, 0x01, 0xD0]);
    }
}
