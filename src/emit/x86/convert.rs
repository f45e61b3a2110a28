//! Primitive conversions.

use super::super::stubs::SlowPath;
use super::{X86Emitter, regs};
use crate::asm::{AluOp, Cond, Fp, Reg, ShiftOp, Width, X86_64Assembler, Xmm};
use crate::error::{BailoutReason, EmitError, EmitResult};
use crate::lir::{ConvertOp, Operand};

impl X86Emitter<'_> {
    pub(super) fn emit_convert(&mut self, conv: ConvertOp, src: &Operand, dst: &Operand) -> EmitResult {
        match conv {
            ConvertOp::I2L => self.int_to_long(src, dst),
            ConvertOp::L2I => {
                let s = if self.is_64bit() { self.reg(src)? } else { self.pair(src)?.0 };
                let d = self.reg(dst)?;
                if s != d || self.is_64bit() {
                    // the 32-bit move also clears the upper half
                    X86_64Assembler::new(&mut self.buf).mov_rr(Width::Dword, d, s);
                }
                Ok(())
            }
            ConvertOp::I2B => {
                let (s, d) = (self.reg(src)?, self.reg(dst)?);
                if self.is_64bit() || s.encoding() < 4 {
                    X86_64Assembler::new(&mut self.buf).movsx_rr8(Width::Dword, d, s);
                    return Ok(());
                }
                let mut asm = X86_64Assembler::new(&mut self.buf);
                if s != d {
                    asm.mov_rr(Width::Dword, d, s);
                }
                asm.shift_ri(ShiftOp::Shl, Width::Dword, d, 24);
                asm.shift_ri(ShiftOp::Sar, Width::Dword, d, 24);
                Ok(())
            }
            ConvertOp::I2C | ConvertOp::I2S => {
                let (s, d) = (self.reg(src)?, self.reg(dst)?);
                let mut asm = X86_64Assembler::new(&mut self.buf);
                if conv == ConvertOp::I2C {
                    asm.movzx_rr16(Width::Dword, d, s);
                } else {
                    asm.movsx_rr16(Width::Dword, d, s);
                }
                Ok(())
            }
            ConvertOp::I2F | ConvertOp::I2D => {
                let fp = if conv == ConvertOp::I2F { Fp::Single } else { Fp::Double };
                let (s, d) = (self.reg(src)?, self.xmm(dst)?);
                X86_64Assembler::new(&mut self.buf).cvtsi2s(fp, Width::Dword, d, s);
                Ok(())
            }
            ConvertOp::L2F | ConvertOp::L2D => {
                if !self.is_64bit() {
                    return Err(BailoutReason::Unimplemented("long to float on ia32").into());
                }
                let fp = if conv == ConvertOp::L2F { Fp::Single } else { Fp::Double };
                let (s, d) = (self.reg(src)?, self.xmm(dst)?);
                X86_64Assembler::new(&mut self.buf).cvtsi2s(fp, Width::Qword, d, s);
                Ok(())
            }
            ConvertOp::F2D | ConvertOp::D2F => {
                let (s, d) = (self.xmm(src)?, self.xmm(dst)?);
                let mut asm = X86_64Assembler::new(&mut self.buf);
                if conv == ConvertOp::F2D {
                    asm.cvtss2sd(d, s);
                } else {
                    asm.cvtsd2ss(d, s);
                }
                Ok(())
            }
            ConvertOp::F2I => self.float_to_int(Fp::Single, Width::Dword, src, dst),
            ConvertOp::D2I => self.float_to_int(Fp::Double, Width::Dword, src, dst),
            ConvertOp::F2L | ConvertOp::D2L => {
                if !self.is_64bit() {
                    return Err(BailoutReason::Unimplemented("float to long on ia32").into());
                }
                let fp = if conv == ConvertOp::F2L { Fp::Single } else { Fp::Double };
                self.float_to_int(fp, Width::Qword, src, dst)
            }
        }
    }

    fn int_to_long(&mut self, src: &Operand, dst: &Operand) -> EmitResult {
        let s = self.reg(src)?;
        if self.is_64bit() {
            let d = self.reg(dst)?;
            X86_64Assembler::new(&mut self.buf).movsxd(d, s);
            return Ok(());
        }
        let (lo, hi) = self.pair(dst)?;
        if hi == s {
            return Err(EmitError::unsupported(format!("{src} aliases the high word of {dst}")));
        }
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if lo != s {
            asm.mov_rr(Width::Dword, lo, s);
        }
        asm.mov_rr(Width::Dword, hi, lo);
        asm.shift_ri(ShiftOp::Sar, Width::Dword, hi, 31);
        Ok(())
    }

    /// Truncating conversion. The hardware answers the indefinite value,
    /// the minimum of the width, for NaN and out of range inputs; that
    /// result is fixed up out of line.
    fn float_to_int(&mut self, fp: Fp, width: Width, src: &Operand, dst: &Operand) -> EmitResult {
        let s: Xmm = self.xmm(src)?;
        let d: Reg = self.reg(dst)?;
        if width == Width::Qword && d == regs::SCRATCH {
            return Err(EmitError::unsupported("conversion into the scratch register"));
        }
        let entry = self.buf.new_label();
        let continuation = self.buf.new_label();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.cvtts2si(fp, width, d, s);
        match width {
            Width::Dword => asm.alu_ri(AluOp::Cmp, Width::Dword, d, i32::MIN),
            Width::Qword => {
                asm.mov_ri64(regs::SCRATCH, i64::MIN);
                asm.alu_rr(AluOp::Cmp, Width::Qword, d, regs::SCRATCH);
            }
        }
        asm.jcc(Cond::E, entry);
        asm.buffer().bind(continuation);
        self.add_slow_path(SlowPath::ConvertToInt {
            entry,
            continuation,
            fp,
            width,
            src: s,
            dst: d,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::asm::{Reg, Xmm};
    use crate::config::{Arch, CompilerConfig};
    use crate::error::{BailoutReason, EmitError};
    use crate::lir::{ConvertOp, Kind, LirMethod, LirOp, Operand};
    use crate::runtime::MethodId;

    fn ia32() -> CompilerConfig {
        let mut config = CompilerConfig::default();
        config.target.arch = Arch::Ia32;
        config
    }

    fn convert(conv: ConvertOp, src: Operand, dst: Operand) -> LirOp {
        LirOp::Convert { conv, src, dst }
    }

    #[test]
    fn test_int_to_long_sign_extends() {
        let code = body(
            &CompilerConfig::default(),
            vec![convert(
                ConvertOp::I2L,
                Operand::reg(Reg::Rsi, Kind::Int),
                Operand::reg(Reg::Rax, Kind::Long),
            )],
            0,
        );
        assert_eq!(code, vec![0x48, 0x63, 0xC6]);

        let code = body(
            &ia32(),
            vec![convert(
                ConvertOp::I2L,
                Operand::reg(Reg::Rsi, Kind::Int),
                Operand::pair(Reg::Rax, Reg::Rdx),
            )],
            0,
        );
        // mov eax, esi; mov edx, eax; sar edx, 31
        assert_eq!(code, vec![0x89, 0xF0, 0x89, 0xC2, 0xC1, 0xFA, 0x1F]);
    }

    #[test]
    fn test_int_to_byte_without_byte_register() {
        let code = body(
            &ia32(),
            vec![convert(
                ConvertOp::I2B,
                Operand::reg(Reg::Rsi, Kind::Int),
                Operand::reg(Reg::Rax, Kind::Byte),
            )],
            0,
        );
        // mov eax, esi; shl eax, 24; sar eax, 24
        assert_eq!(code, vec![0x89, 0xF0, 0xC1, 0xE0, 0x18, 0xC1, 0xF8, 0x18]);
    }

    #[test]
    fn test_float_to_int_checks_indefinite_value() {
        let code = body(
            &CompilerConfig::default(),
            vec![convert(
                ConvertOp::F2I,
                Operand::xmm(Xmm(0), Kind::Float),
                Operand::reg(Reg::Rax, Kind::Int),
            )],
            0,
        );
        assert_eq!(
            &code[..10],
            &[
                0xF3, 0x0F, 0x2C, 0xC0, // cvttss2si eax, xmm0
                0x81, 0xF8, 0x00, 0x00, 0x00, 0x80, // cmp eax, 0x80000000
            ]
        );
        assert_eq!(&code[10..12], &[0x0F, 0x84]);
        assert_eq!(code.len(), 16);
    }

    #[test]
    fn test_double_to_long_compares_through_scratch() {
        let code = body(
            &CompilerConfig::default(),
            vec![convert(
                ConvertOp::D2L,
                Operand::xmm(Xmm(0), Kind::Double),
                Operand::reg(Reg::Rax, Kind::Long),
            )],
            0,
        );
        assert_eq!(
            &code[..18],
            &[
                0xF2, 0x48, 0x0F, 0x2C, 0xC0, // cvttsd2si rax, xmm0
                0x49, 0xBA, 0, 0, 0, 0, 0, 0, 0, 0x80, // mov r10, i64::MIN
                0x4C, 0x39, 0xD0, // cmp rax, r10
            ]
        );
    }

    #[test]
    fn test_long_to_double_bails_out_on_ia32() {
        let lir = LirMethod::new(
            MethodId(0),
            vec![convert(
                ConvertOp::L2D,
                Operand::pair(Reg::Rax, Reg::Rdx),
                Operand::xmm(Xmm(0), Kind::Double),
            )],
        );
        let err = compile_with(&ia32(), &model(), &lir).unwrap_err();
        assert_eq!(
            err,
            EmitError::Bailout(BailoutReason::Unimplemented("long to float on ia32"))
        );
    }
}
