//! x86-64 instruction encoding.
//!
//! The encoder covers the subset the LIR emitter needs: integer moves and
//! arithmetic in 32 and 64 bit widths, memory operands with base, index and
//! displacement, RIP-relative loads for literal references, conditional moves,
//! atomics and scalar SSE2. When no REX prefix is required the same bytes are
//! valid in 32-bit protected mode, which the IA-32 emitter relies on.

use serde::{Deserialize, Serialize};

use super::codebuf::{CodeBuffer, Label, ReferenceSize};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    pub fn from_encoding(encoding: u8) -> Option<Reg> {
        Self::ALL.get(encoding as usize).copied()
    }

    /// Full register number (0-15).
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Byte access to SPL, BPL, SIL and DIL needs a REX prefix, otherwise
    /// the encoding selects AH, CH, DH or BH.
    fn needs_rex_for_byte(self) -> bool {
        matches!(self, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi)
    }
}

/// An SSE register, `xmm0` through `xmm15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Xmm(pub u8);

impl Xmm {
    pub fn code(self) -> u8 {
        self.0 & 0x7
    }
}

/// x86-64 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Operand width of an integer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Dword,
    Qword,
}

impl Width {
    fn rex_w(self) -> bool {
        self == Width::Qword
    }
}

/// Scalar floating point precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fp {
    Single,
    Double,
}

impl Fp {
    /// Operand size prefix of the packed form.
    fn packed_prefix(self) -> Option<u8> {
        match self {
            Fp::Single => None,
            Fp::Double => Some(0x66),
        }
    }

    /// Mandatory prefix of the scalar form.
    fn scalar_prefix(self) -> u8 {
        match self {
            Fp::Single => 0xF3,
            Fp::Double => 0xF2,
        }
    }
}

/// Group-1 arithmetic operations; the discriminant is the ModR/M extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Group-2 shift operations; the discriminant is the ModR/M extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Scalar SSE arithmetic; the discriminant is the opcode byte after `0F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SseOp {
    Sqrt = 0x51,
    Add = 0x58,
    Mul = 0x59,
    Sub = 0x5C,
    Div = 0x5E,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    Times1 = 0,
    Times2 = 1,
    Times4 = 2,
    Times8 = 3,
}

impl Scale {
    pub fn from_bytes(bytes: usize) -> Option<Scale> {
        match bytes {
            1 => Some(Scale::Times1),
            2 => Some(Scale::Times2),
            4 => Some(Scale::Times4),
            8 => Some(Scale::Times8),
            _ => None,
        }
    }

    pub fn log2(self) -> u8 {
        self as u8
    }
}

/// A memory operand `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Reg,
    pub index: Option<(Reg, Scale)>,
    pub disp: i32,
}

impl Address {
    pub fn new(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    pub fn indexed(base: Reg, index: Reg, scale: Scale, disp: i32) -> Self {
        debug_assert!(index != Reg::Rsp, "rsp cannot be an index register");
        Self {
            base,
            index: Some((index, scale)),
            disp,
        }
    }

    /// The same address moved by `delta` bytes.
    pub fn offset(self, delta: i32) -> Self {
        Self {
            disp: self.disp + delta,
            ..self
        }
    }

    fn index_encoding(&self) -> u8 {
        self.index.map_or(0, |(index, _)| index.encoding())
    }
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn position(&self) -> usize {
        self.buf.position()
    }

    pub fn buffer(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    // ==================== Prefix and operand helpers ====================

    /// Emit a REX prefix when any bit is set or when a byte register needs it.
    fn rex(&mut self, w: bool, reg: u8, index: u8, base: u8, force: bool) {
        let mut rex = 0x40;
        if w {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if index >= 8 {
            rex |= 0x02;
        }
        if base >= 8 {
            rex |= 0x01;
        }
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    fn rex_mem(&mut self, w: bool, reg: u8, addr: &Address, force: bool) {
        self.rex(w, reg, addr.index_encoding(), addr.base.encoding(), force);
    }

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit ModR/M, SIB and displacement for a memory operand.
    fn mem(&mut self, reg: u8, addr: &Address) {
        let base = addr.base;
        // rbp and r13 as base cannot use the no-displacement form
        let mode = if addr.disp == 0 && base.code() != 5 {
            0b00
        } else if i8::try_from(addr.disp).is_ok() {
            0b01
        } else {
            0b10
        };
        match addr.index {
            Some((index, scale)) => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf
                    .emit_u8(((scale as u8) << 6) | (index.code() << 3) | base.code());
            }
            None if base.code() == 0b100 => {
                // rsp and r12 need a SIB byte with no index
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(0x24);
            }
            None => self.buf.emit_u8(Self::modrm(mode, reg, base.code())),
        }
        match mode {
            0b01 => self.buf.emit_u8(addr.disp as i8 as u8),
            0b10 => self.buf.emit_u32(addr.disp as u32),
            _ => {}
        }
    }

    /// Emit a RIP-relative operand with a zero displacement and return the
    /// offset of the displacement field.
    fn rip(&mut self, reg: u8) -> usize {
        self.buf.emit_u8(Self::modrm(0b00, reg, 0b101));
        let at = self.buf.position();
        self.buf.emit_u32(0);
        at
    }

    fn imm_group(&mut self, ext: u8, rm: u8, imm: i32) {
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, rm));
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, rm));
            self.buf.emit_u32(imm as u32);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r, r
    pub fn mov_rr(&mut self, w: Width, dst: Reg, src: Reg) {
        self.rex(w.rex_w(), src.encoding(), 0, dst.encoding(), false);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r, imm using the shortest encoding for the width.
    pub fn mov_ri(&mut self, w: Width, dst: Reg, imm: i64) {
        match w {
            Width::Dword => {
                self.rex(false, 0, 0, dst.encoding(), false);
                self.buf.emit_u8(0xB8 + dst.code());
                self.buf.emit_u32(imm as u32);
            }
            Width::Qword => {
                if let Ok(imm32) = i32::try_from(imm) {
                    self.rex(true, 0, 0, dst.encoding(), false);
                    self.buf.emit_u8(0xC7);
                    self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
                    self.buf.emit_u32(imm32 as u32);
                } else {
                    self.mov_ri64(dst, imm);
                }
            }
        }
    }

    /// MOV r64, imm64 in its full ten byte form. Returns the offset of the
    /// immediate so it can be patched later.
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) -> usize {
        self.rex(true, 0, 0, dst.encoding(), false);
        self.buf.emit_u8(0xB8 + dst.code());
        let at = self.buf.position();
        self.buf.emit_u64(imm as u64);
        at
    }

    /// MOV r, [mem]
    pub fn load(&mut self, w: Width, dst: Reg, addr: &Address) {
        self.rex_mem(w.rex_w(), dst.encoding(), addr, false);
        self.buf.emit_u8(0x8B);
        self.mem(dst.code(), addr);
    }

    /// MOV r, [rip + disp32]. Returns the offset of the displacement.
    pub fn load_rip(&mut self, w: Width, dst: Reg) -> usize {
        self.rex(w.rex_w(), dst.encoding(), 0, 0, false);
        self.buf.emit_u8(0x8B);
        self.rip(dst.code())
    }

    /// MOV [mem], r
    pub fn store(&mut self, w: Width, addr: &Address, src: Reg) {
        self.rex_mem(w.rex_w(), src.encoding(), addr, false);
        self.buf.emit_u8(0x89);
        self.mem(src.code(), addr);
    }

    /// MOV [mem], imm32 (sign-extended for the qword form)
    pub fn store_imm(&mut self, w: Width, addr: &Address, imm: i32) {
        self.rex_mem(w.rex_w(), 0, addr, false);
        self.buf.emit_u8(0xC7);
        self.mem(0, addr);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV BYTE PTR [mem], r8
    pub fn store_u8(&mut self, addr: &Address, src: Reg) {
        self.rex_mem(false, src.encoding(), addr, src.needs_rex_for_byte());
        self.buf.emit_u8(0x88);
        self.mem(src.code(), addr);
    }

    /// MOV WORD PTR [mem], r16
    pub fn store_u16(&mut self, addr: &Address, src: Reg) {
        self.buf.emit_u8(0x66);
        self.rex_mem(false, src.encoding(), addr, false);
        self.buf.emit_u8(0x89);
        self.mem(src.code(), addr);
    }

    /// MOV BYTE PTR [mem], imm8
    pub fn store_imm8(&mut self, addr: &Address, imm: u8) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0xC6);
        self.mem(0, addr);
        self.buf.emit_u8(imm);
    }

    /// MOV WORD PTR [mem], imm16
    pub fn store_imm16(&mut self, addr: &Address, imm: u16) {
        self.buf.emit_u8(0x66);
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0xC7);
        self.mem(0, addr);
        self.buf.emit_u16(imm);
    }

    fn extend_rm(&mut self, w: Width, op: u8, dst: Reg, addr: &Address) {
        self.rex_mem(w.rex_w(), dst.encoding(), addr, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(op);
        self.mem(dst.code(), addr);
    }

    fn extend_rr(&mut self, w: Width, op: u8, dst: Reg, src: Reg, byte_src: bool) {
        let force = byte_src && src.needs_rex_for_byte();
        self.rex(w.rex_w(), dst.encoding(), 0, src.encoding(), force);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(op);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVZX r, BYTE PTR [mem]
    pub fn load_u8(&mut self, w: Width, dst: Reg, addr: &Address) {
        self.extend_rm(w, 0xB6, dst, addr);
    }

    /// MOVSX r, BYTE PTR [mem]
    pub fn load_i8(&mut self, w: Width, dst: Reg, addr: &Address) {
        self.extend_rm(w, 0xBE, dst, addr);
    }

    /// MOVZX r, WORD PTR [mem]
    pub fn load_u16(&mut self, w: Width, dst: Reg, addr: &Address) {
        self.extend_rm(w, 0xB7, dst, addr);
    }

    /// MOVSX r, WORD PTR [mem]
    pub fn load_i16(&mut self, w: Width, dst: Reg, addr: &Address) {
        self.extend_rm(w, 0xBF, dst, addr);
    }

    /// MOVZX r, r8
    pub fn movzx_rr8(&mut self, w: Width, dst: Reg, src: Reg) {
        self.extend_rr(w, 0xB6, dst, src, true);
    }

    /// MOVSX r, r8
    pub fn movsx_rr8(&mut self, w: Width, dst: Reg, src: Reg) {
        self.extend_rr(w, 0xBE, dst, src, true);
    }

    /// MOVZX r, r16
    pub fn movzx_rr16(&mut self, w: Width, dst: Reg, src: Reg) {
        self.extend_rr(w, 0xB7, dst, src, false);
    }

    /// MOVSX r, r16
    pub fn movsx_rr16(&mut self, w: Width, dst: Reg, src: Reg) {
        self.extend_rr(w, 0xBF, dst, src, false);
    }

    /// MOVSXD r64, r32 (sign-extend 32-bit to 64-bit)
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.encoding(), 0, src.encoding(), false);
        self.buf.emit_u8(0x63);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// LEA r, [mem]
    pub fn lea(&mut self, w: Width, dst: Reg, addr: &Address) {
        self.rex_mem(w.rex_w(), dst.encoding(), addr, false);
        self.buf.emit_u8(0x8D);
        self.mem(dst.code(), addr);
    }

    /// LEA r, [rip + disp32]. Returns the offset of the displacement.
    pub fn lea_rip(&mut self, w: Width, dst: Reg) -> usize {
        self.rex(w.rex_w(), dst.encoding(), 0, 0, false);
        self.buf.emit_u8(0x8D);
        self.rip(dst.code())
    }

    /// XCHG r, r
    pub fn xchg(&mut self, w: Width, a: Reg, b: Reg) {
        self.rex(w.rex_w(), a.encoding(), 0, b.encoding(), false);
        self.buf.emit_u8(0x87);
        self.buf.emit_u8(Self::modrm(0b11, a.code(), b.code()));
    }

    // ==================== Arithmetic Operations ====================

    /// OP r/m, r
    pub fn alu_rr(&mut self, op: AluOp, w: Width, dst: Reg, src: Reg) {
        self.rex(w.rex_w(), src.encoding(), 0, dst.encoding(), false);
        self.buf.emit_u8((op as u8) * 8 + 1);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// OP r/m, imm (imm8 form when it fits)
    pub fn alu_ri(&mut self, op: AluOp, w: Width, dst: Reg, imm: i32) {
        self.rex(w.rex_w(), 0, 0, dst.encoding(), false);
        self.imm_group(op as u8, dst.code(), imm);
    }

    /// OP r, [mem]
    pub fn alu_rm(&mut self, op: AluOp, w: Width, dst: Reg, addr: &Address) {
        self.rex_mem(w.rex_w(), dst.encoding(), addr, false);
        self.buf.emit_u8((op as u8) * 8 + 3);
        self.mem(dst.code(), addr);
    }

    /// OP [mem], imm
    pub fn alu_mi(&mut self, op: AluOp, w: Width, addr: &Address, imm: i32) {
        self.rex_mem(w.rex_w(), 0, addr, false);
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.mem(op as u8, addr);
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.mem(op as u8, addr);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// Group-1 operation on a byte in memory: `op BYTE PTR [mem], imm8`.
    pub fn alu_mi8(&mut self, op: AluOp, addr: &Address, imm: u8) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0x80);
        self.mem(op as u8, addr);
        self.buf.emit_u8(imm);
    }

    /// IMUL r, r/m (signed multiply, result in first operand)
    pub fn imul_rr(&mut self, w: Width, dst: Reg, src: Reg) {
        self.rex(w.rex_w(), dst.encoding(), 0, src.encoding(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// IMUL r, [mem]
    pub fn imul_rm(&mut self, w: Width, dst: Reg, addr: &Address) {
        self.rex_mem(w.rex_w(), dst.encoding(), addr, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.mem(dst.code(), addr);
    }

    /// IMUL r, r/m, imm (signed multiply with immediate)
    pub fn imul_rri(&mut self, w: Width, dst: Reg, src: Reg, imm: i32) {
        self.rex(w.rex_w(), dst.encoding(), 0, src.encoding(), false);
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x6B);
            self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x69);
            self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    fn group3(&mut self, ext: u8, w: Width, rm: Reg) {
        self.rex(w.rex_w(), 0, 0, rm.encoding(), false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, ext, rm.code()));
    }

    /// MUL r/m (unsigned multiply: rDX:rAX = rAX * r/m)
    pub fn mul(&mut self, w: Width, src: Reg) {
        self.group3(4, w, src);
    }

    /// IDIV r/m (signed divide rDX:rAX, quotient in rAX, remainder in rDX)
    pub fn idiv(&mut self, w: Width, src: Reg) {
        self.group3(7, w, src);
    }

    /// NEG r/m (two's complement negation)
    pub fn neg(&mut self, w: Width, dst: Reg) {
        self.group3(3, w, dst);
    }

    /// NOT r/m
    pub fn not(&mut self, w: Width, dst: Reg) {
        self.group3(2, w, dst);
    }

    /// INC r/m
    pub fn inc(&mut self, w: Width, dst: Reg) {
        self.rex(w.rex_w(), 0, 0, dst.encoding(), false);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    /// DEC r/m
    pub fn dec(&mut self, w: Width, dst: Reg) {
        self.rex(w.rex_w(), 0, 0, dst.encoding(), false);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 1, dst.code()));
    }

    /// CDQ (sign-extend EAX into EDX:EAX)
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// CQO (sign-extend RAX into RDX:RAX, needed before IDIV)
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// Shift by an immediate count.
    pub fn shift_ri(&mut self, op: ShiftOp, w: Width, dst: Reg, imm: u8) {
        self.rex(w.rex_w(), 0, 0, dst.encoding(), false);
        if imm == 1 {
            self.buf.emit_u8(0xD1);
            self.buf.emit_u8(Self::modrm(0b11, op as u8, dst.code()));
        } else {
            self.buf.emit_u8(0xC1);
            self.buf.emit_u8(Self::modrm(0b11, op as u8, dst.code()));
            self.buf.emit_u8(imm);
        }
    }

    /// Shift by CL.
    pub fn shift_cl(&mut self, op: ShiftOp, w: Width, dst: Reg) {
        self.rex(w.rex_w(), 0, 0, dst.encoding(), false);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, op as u8, dst.code()));
    }

    /// SHLD r32, r32, CL (double precision shift for register pairs)
    pub fn shld_cl(&mut self, dst: Reg, src: Reg) {
        self.rex(false, src.encoding(), 0, dst.encoding(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xA5);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SHRD r32, r32, CL
    pub fn shrd_cl(&mut self, dst: Reg, src: Reg) {
        self.rex(false, src.encoding(), 0, dst.encoding(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAD);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SHLD r32, r32, imm8
    pub fn shld_ri(&mut self, dst: Reg, src: Reg, imm: u8) {
        self.rex(false, src.encoding(), 0, dst.encoding(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xA4);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
        self.buf.emit_u8(imm);
    }

    /// SHRD r32, r32, imm8
    pub fn shrd_ri(&mut self, dst: Reg, src: Reg, imm: u8) {
        self.rex(false, src.encoding(), 0, dst.encoding(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAC);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
        self.buf.emit_u8(imm);
    }

    /// TEST r/m, r (bitwise AND, set flags, discard result)
    pub fn test_rr(&mut self, w: Width, dst: Reg, src: Reg) {
        self.rex(w.rex_w(), src.encoding(), 0, dst.encoding(), false);
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// TEST r/m, imm32
    pub fn test_ri(&mut self, w: Width, dst: Reg, imm: i32) {
        self.rex(w.rex_w(), 0, 0, dst.encoding(), false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// TEST [mem], r
    pub fn test_mr(&mut self, w: Width, addr: &Address, src: Reg) {
        self.rex_mem(w.rex_w(), src.encoding(), addr, false);
        self.buf.emit_u8(0x85);
        self.mem(src.code(), addr);
    }

    /// CMOVcc r, r
    pub fn cmov(&mut self, cond: Cond, w: Width, dst: Reg, src: Reg) {
        self.rex(w.rex_w(), dst.encoding(), 0, src.encoding(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CMOVcc r, [mem]
    pub fn cmov_rm(&mut self, cond: Cond, w: Width, dst: Reg, addr: &Address) {
        self.rex_mem(w.rex_w(), dst.encoding(), addr, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 + cond as u8);
        self.mem(dst.code(), addr);
    }

    // ==================== Atomics ====================

    /// LOCK prefix for the next instruction.
    pub fn lock(&mut self) {
        self.buf.emit_u8(0xF0);
    }

    /// CMPXCHG [mem], r (compares with rAX)
    pub fn cmpxchg(&mut self, w: Width, addr: &Address, src: Reg) {
        self.rex_mem(w.rex_w(), src.encoding(), addr, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB1);
        self.mem(src.code(), addr);
    }

    /// CMPXCHG8B [mem] (compares EDX:EAX, exchanges with ECX:EBX)
    pub fn cmpxchg8b(&mut self, addr: &Address) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xC7);
        self.mem(1, addr);
    }

    /// MFENCE
    pub fn mfence(&mut self) {
        self.buf.emit_bytes(&[0x0F, 0xAE, 0xF0]);
    }

    // ==================== Stack Operations ====================

    /// PUSH r
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// PUSH [mem], one machine word
    pub fn push_m(&mut self, addr: &Address) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0xFF);
        self.mem(6, addr);
    }

    /// POP [mem]. An rsp based address is computed after the pop.
    pub fn pop_m(&mut self, addr: &Address) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0x8F);
        self.mem(0, addr);
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to a label.
    pub fn jmp(&mut self, target: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(target, ReferenceSize::Rel32);
    }

    /// JMP rel8 to a label that must be within 127 bytes.
    pub fn jmp_short(&mut self, target: Label) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_label_ref(target, ReferenceSize::Rel8);
    }

    /// Jcc rel32 to a label.
    pub fn jcc(&mut self, cond: Cond, target: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_ref(target, ReferenceSize::Rel32);
    }

    /// Jcc rel8 to a label that must be within 127 bytes.
    pub fn jcc_short(&mut self, cond: Cond, target: Label) {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.emit_label_ref(target, ReferenceSize::Rel8);
    }

    /// CALL rel32. Returns the offset of the displacement field.
    pub fn call_rel32(&mut self, offset: i32) -> usize {
        self.buf.emit_u8(0xE8);
        let at = self.buf.position();
        self.buf.emit_u32(offset as u32);
        at
    }

    /// CALL r (indirect call through register)
    pub fn call_r(&mut self, reg: Reg) {
        self.rex(false, 0, 0, reg.encoding(), false);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// CALL [mem]
    pub fn call_m(&mut self, addr: &Address) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0xFF);
        self.mem(2, addr);
    }

    /// RET (return)
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// NOP (no operation)
    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    /// Emit exactly `len` bytes of padding using the recommended multi-byte
    /// NOP forms.
    pub fn nops(&mut self, mut len: usize) {
        const FORMS: [&[u8]; 8] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];
        while len > 0 {
            let n = len.min(FORMS.len());
            self.buf.emit_bytes(FORMS[n - 1]);
            len -= n;
        }
    }

    /// INT3
    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    // ==================== Conditional Set ====================

    /// SETcc r8 (set byte based on condition)
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.rex(false, 0, 0, dst.encoding(), dst.needs_rex_for_byte());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    // ==================== SSE2 Floating Point ====================

    fn sse_rr(&mut self, prefix: Option<u8>, w: bool, op: u8, reg: u8, rm: u8) {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }
        self.rex(w, reg, 0, rm, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(op);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm));
    }

    fn sse_rm(&mut self, prefix: Option<u8>, op: u8, reg: u8, addr: &Address) {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }
        self.rex_mem(false, reg, addr, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(op);
        self.mem(reg & 0x7, addr);
    }

    fn sse_rip(&mut self, prefix: Option<u8>, op: u8, reg: u8) -> usize {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }
        self.rex(false, reg, 0, 0, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(op);
        self.rip(reg & 0x7)
    }

    /// MOVSS / MOVSD xmm, xmm
    pub fn movs_rr(&mut self, fp: Fp, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(fp.scalar_prefix()), false, 0x10, dst.0, src.0);
    }

    /// MOVSS / MOVSD xmm, [mem]
    pub fn movs_load(&mut self, fp: Fp, dst: Xmm, addr: &Address) {
        self.sse_rm(Some(fp.scalar_prefix()), 0x10, dst.0, addr);
    }

    /// MOVSS / MOVSD [mem], xmm
    pub fn movs_store(&mut self, fp: Fp, addr: &Address, src: Xmm) {
        self.sse_rm(Some(fp.scalar_prefix()), 0x11, src.0, addr);
    }

    /// MOVSS / MOVSD xmm, [rip + disp32]. Returns the offset of the displacement.
    pub fn movs_rip(&mut self, fp: Fp, dst: Xmm) -> usize {
        self.sse_rip(Some(fp.scalar_prefix()), 0x10, dst.0)
    }

    /// Scalar arithmetic, `dst = dst op src`.
    pub fn sse_arith(&mut self, op: SseOp, fp: Fp, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(fp.scalar_prefix()), false, op as u8, dst.0, src.0);
    }

    /// Scalar arithmetic with a memory operand.
    pub fn sse_arith_m(&mut self, op: SseOp, fp: Fp, dst: Xmm, addr: &Address) {
        self.sse_rm(Some(fp.scalar_prefix()), op as u8, dst.0, addr);
    }

    /// Scalar arithmetic with a RIP-relative operand.
    pub fn sse_arith_rip(&mut self, op: SseOp, fp: Fp, dst: Xmm) -> usize {
        self.sse_rip(Some(fp.scalar_prefix()), op as u8, dst.0)
    }

    /// UCOMISS / UCOMISD xmm, xmm (unordered compare, sets ZF PF CF)
    pub fn ucomis(&mut self, fp: Fp, a: Xmm, b: Xmm) {
        let prefix = match fp {
            Fp::Single => None,
            Fp::Double => Some(0x66),
        };
        self.sse_rr(prefix, false, 0x2E, a.0, b.0);
    }

    /// UCOMISS / UCOMISD xmm, [rip + disp32]
    pub fn ucomis_rip(&mut self, fp: Fp, a: Xmm) -> usize {
        let prefix = match fp {
            Fp::Single => None,
            Fp::Double => Some(0x66),
        };
        self.sse_rip(prefix, 0x2E, a.0)
    }

    /// UCOMISS / UCOMISD xmm, [mem]
    pub fn ucomis_m(&mut self, fp: Fp, a: Xmm, addr: &Address) {
        self.sse_rm(fp.packed_prefix(), 0x2E, a.0, addr);
    }

    /// CVTSI2SS / CVTSI2SD xmm, r
    pub fn cvtsi2s(&mut self, fp: Fp, w: Width, dst: Xmm, src: Reg) {
        self.sse_rr(Some(fp.scalar_prefix()), w.rex_w(), 0x2A, dst.0, src.encoding());
    }

    /// CVTTSS2SI / CVTTSD2SI r, xmm (truncating)
    pub fn cvtts2si(&mut self, fp: Fp, w: Width, dst: Reg, src: Xmm) {
        self.sse_rr(Some(fp.scalar_prefix()), w.rex_w(), 0x2C, dst.encoding(), src.0);
    }

    /// CVTSS2SD xmm, xmm
    pub fn cvtss2sd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0xF3), false, 0x5A, dst.0, src.0);
    }

    /// CVTSD2SS xmm, xmm
    pub fn cvtsd2ss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0xF2), false, 0x5A, dst.0, src.0);
    }

    /// ANDPS / ANDPD xmm, [rip + disp32], used to clear the sign bit
    pub fn andp_rip(&mut self, fp: Fp, dst: Xmm) -> usize {
        let prefix = match fp {
            Fp::Single => None,
            Fp::Double => Some(0x66),
        };
        self.sse_rip(prefix, 0x54, dst.0)
    }

    /// XORPS / XORPD xmm, xmm
    pub fn xorp(&mut self, fp: Fp, dst: Xmm, src: Xmm) {
        let prefix = match fp {
            Fp::Single => None,
            Fp::Double => Some(0x66),
        };
        self.sse_rr(prefix, false, 0x57, dst.0, src.0);
    }

    /// XORPS / XORPD xmm, [rip + disp32], used to flip the sign bit
    pub fn xorp_rip(&mut self, fp: Fp, dst: Xmm) -> usize {
        let prefix = match fp {
            Fp::Single => None,
            Fp::Double => Some(0x66),
        };
        self.sse_rip(prefix, 0x57, dst.0)
    }

    /// XORPS / XORPD xmm, [mem]; the operand must be 16-byte aligned
    pub fn xorp_m(&mut self, fp: Fp, dst: Xmm, addr: &Address) {
        self.sse_rm(fp.packed_prefix(), 0x57, dst.0, addr);
    }

    /// ANDPS / ANDPD xmm, [mem]; the operand must be 16-byte aligned
    pub fn andp_m(&mut self, fp: Fp, dst: Xmm, addr: &Address) {
        self.sse_rm(fp.packed_prefix(), 0x54, dst.0, addr);
    }

    /// MOVMSKPS / MOVMSKPD r32, xmm (sign bits into the low bits of r32)
    pub fn movmskp(&mut self, fp: Fp, dst: Reg, src: Xmm) {
        self.sse_rr(fp.packed_prefix(), false, 0x50, dst.encoding(), src.0);
    }

    /// MOVD / MOVQ xmm, r
    pub fn movd_to_xmm(&mut self, w: Width, dst: Xmm, src: Reg) {
        self.sse_rr(Some(0x66), w.rex_w(), 0x6E, dst.0, src.encoding());
    }

    /// MOVD / MOVQ r, xmm
    pub fn movd_from_xmm(&mut self, w: Width, dst: Reg, src: Xmm) {
        // the xmm register goes in the reg field for the store form
        self.sse_rr(Some(0x66), w.rex_w(), 0x7E, src.0, dst.encoding());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.resolve_fixups().unwrap();
        buf.into_code()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        let code = assemble(|a| a.mov_rr(Width::Qword, Reg::Rax, Reg::Rbx));
        assert_eq!(code, [0x48, 0x89, 0xD8]);

        // MOV R9, R8 = 4D 89 C1
        let code = assemble(|a| a.mov_rr(Width::Qword, Reg::R9, Reg::R8));
        assert_eq!(code, [0x4D, 0x89, 0xC1]);

        // MOV EAX, EBX = 89 D8
        let code = assemble(|a| a.mov_rr(Width::Dword, Reg::Rax, Reg::Rbx));
        assert_eq!(code, [0x89, 0xD8]);
    }

    #[test]
    fn test_mov_ri() {
        let code = assemble(|a| a.mov_ri(Width::Dword, Reg::Rax, 5));
        assert_eq!(code, [0xB8, 0x05, 0x00, 0x00, 0x00]);

        let code = assemble(|a| a.mov_ri(Width::Qword, Reg::Rcx, -1));
        assert_eq!(code, [0x48, 0xC7, 0xC1, 0xFF, 0xFF, 0xFF, 0xFF]);

        let code = assemble(|a| a.mov_ri(Width::Qword, Reg::Rax, 0x123456789ABCDEF0u64 as i64));
        assert_eq!(
            code,
            [0x48, 0xB8, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_mov_ri64_r15_reports_immediate_offset() {
        let mut buf = CodeBuffer::new();
        let at = X86_64Assembler::new(&mut buf).mov_ri64(Reg::R15, 42);
        assert_eq!(at, 2);
        assert_eq!(
            buf.code(),
            &[0x49, 0xBF, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_load_addressing_forms() {
        // MOV RAX, [RBX] = 48 8B 03
        let code = assemble(|a| a.load(Width::Qword, Reg::Rax, &Address::new(Reg::Rbx, 0)));
        assert_eq!(code, [0x48, 0x8B, 0x03]);

        // MOV RAX, [RBX+16] = 48 8B 43 10
        let code = assemble(|a| a.load(Width::Qword, Reg::Rax, &Address::new(Reg::Rbx, 16)));
        assert_eq!(code, [0x48, 0x8B, 0x43, 0x10]);

        // MOV RAX, [RSP+8] = 48 8B 44 24 08
        let code = assemble(|a| a.load(Width::Qword, Reg::Rax, &Address::new(Reg::Rsp, 8)));
        assert_eq!(code, [0x48, 0x8B, 0x44, 0x24, 0x08]);

        // MOV RAX, [RBP] = 48 8B 45 00
        let code = assemble(|a| a.load(Width::Qword, Reg::Rax, &Address::new(Reg::Rbp, 0)));
        assert_eq!(code, [0x48, 0x8B, 0x45, 0x00]);

        // MOV RAX, [R12] = 49 8B 04 24
        let code = assemble(|a| a.load(Width::Qword, Reg::Rax, &Address::new(Reg::R12, 0)));
        assert_eq!(code, [0x49, 0x8B, 0x04, 0x24]);

        // MOV EAX, [RBX+0x200] = 8B 83 00 02 00 00
        let code = assemble(|a| a.load(Width::Dword, Reg::Rax, &Address::new(Reg::Rbx, 0x200)));
        assert_eq!(code, [0x8B, 0x83, 0x00, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_load_indexed() {
        // MOV RAX, [RBX+RCX*8+16] = 48 8B 44 CB 10
        let addr = Address::indexed(Reg::Rbx, Reg::Rcx, Scale::Times8, 16);
        let code = assemble(|a| a.load(Width::Qword, Reg::Rax, &addr));
        assert_eq!(code, [0x48, 0x8B, 0x44, 0xCB, 0x10]);

        // MOV EAX, [R8+R9*4] = 43 8B 04 88
        let addr = Address::indexed(Reg::R8, Reg::R9, Scale::Times4, 0);
        let code = assemble(|a| a.load(Width::Dword, Reg::Rax, &addr));
        assert_eq!(code, [0x43, 0x8B, 0x04, 0x88]);
    }

    #[test]
    fn test_load_rip_reports_displacement_offset() {
        let mut buf = CodeBuffer::new();
        let at = X86_64Assembler::new(&mut buf).load_rip(Width::Qword, Reg::Rax);
        assert_eq!(at, 3);
        assert_eq!(buf.code(), &[0x48, 0x8B, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn test_store_forms() {
        // MOV [RBX], RAX = 48 89 03
        let code = assemble(|a| a.store(Width::Qword, &Address::new(Reg::Rbx, 0), Reg::Rax));
        assert_eq!(code, [0x48, 0x89, 0x03]);

        // MOV BYTE PTR [RAX], SIL = 40 88 30
        let code = assemble(|a| a.store_u8(&Address::new(Reg::Rax, 0), Reg::Rsi));
        assert_eq!(code, [0x40, 0x88, 0x30]);

        // MOV WORD PTR [RAX], CX = 66 89 08
        let code = assemble(|a| a.store_u16(&Address::new(Reg::Rax, 0), Reg::Rcx));
        assert_eq!(code, [0x66, 0x89, 0x08]);

        // MOV DWORD PTR [RSP+4], 7 = C7 44 24 04 07 00 00 00
        let code = assemble(|a| a.store_imm(Width::Dword, &Address::new(Reg::Rsp, 4), 7));
        assert_eq!(code, [0xC7, 0x44, 0x24, 0x04, 0x07, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_extensions() {
        // MOVZX EAX, SIL = 40 0F B6 C6
        let code = assemble(|a| a.movzx_rr8(Width::Dword, Reg::Rax, Reg::Rsi));
        assert_eq!(code, [0x40, 0x0F, 0xB6, 0xC6]);

        // MOVSX EAX, CX = 0F BF C1
        let code = assemble(|a| a.movsx_rr16(Width::Dword, Reg::Rax, Reg::Rcx));
        assert_eq!(code, [0x0F, 0xBF, 0xC1]);

        // MOVSXD RAX, ECX = 48 63 C1
        let code = assemble(|a| a.movsxd(Reg::Rax, Reg::Rcx));
        assert_eq!(code, [0x48, 0x63, 0xC1]);
    }

    #[test]
    fn test_alu() {
        // ADD RAX, RBX = 48 01 D8
        let code = assemble(|a| a.alu_rr(AluOp::Add, Width::Qword, Reg::Rax, Reg::Rbx));
        assert_eq!(code, [0x48, 0x01, 0xD8]);

        // SUB RSP, 32 = 48 83 EC 20
        let code = assemble(|a| a.alu_ri(AluOp::Sub, Width::Qword, Reg::Rsp, 32));
        assert_eq!(code, [0x48, 0x83, 0xEC, 0x20]);

        // ADD RAX, 256 = 48 81 C0 00 01 00 00
        let code = assemble(|a| a.alu_ri(AluOp::Add, Width::Qword, Reg::Rax, 256));
        assert_eq!(code, [0x48, 0x81, 0xC0, 0x00, 0x01, 0x00, 0x00]);

        // ADC EDX, ECX = 11 CA
        let code = assemble(|a| a.alu_rr(AluOp::Adc, Width::Dword, Reg::Rdx, Reg::Rcx));
        assert_eq!(code, [0x11, 0xCA]);

        // CMP RAX, [RDX+8] = 48 3B 42 08
        let code =
            assemble(|a| a.alu_rm(AluOp::Cmp, Width::Qword, Reg::Rax, &Address::new(Reg::Rdx, 8)));
        assert_eq!(code, [0x48, 0x3B, 0x42, 0x08]);

        // AND EDX, 7 = 83 E2 07
        let code = assemble(|a| a.alu_ri(AluOp::And, Width::Dword, Reg::Rdx, 7));
        assert_eq!(code, [0x83, 0xE2, 0x07]);
    }

    #[test]
    fn test_mul_div() {
        // IMUL RAX, RBX = 48 0F AF C3
        let code = assemble(|a| a.imul_rr(Width::Qword, Reg::Rax, Reg::Rbx));
        assert_eq!(code, [0x48, 0x0F, 0xAF, 0xC3]);

        // IDIV RCX = 48 F7 F9
        let code = assemble(|a| a.idiv(Width::Qword, Reg::Rcx));
        assert_eq!(code, [0x48, 0xF7, 0xF9]);

        // CDQ; IDIV ECX = 99 F7 F9
        let code = assemble(|a| {
            a.cdq();
            a.idiv(Width::Dword, Reg::Rcx);
        });
        assert_eq!(code, [0x99, 0xF7, 0xF9]);

        // NEG RAX = 48 F7 D8
        let code = assemble(|a| a.neg(Width::Qword, Reg::Rax));
        assert_eq!(code, [0x48, 0xF7, 0xD8]);
    }

    #[test]
    fn test_shifts() {
        // SAR EAX, 3 = C1 F8 03
        let code = assemble(|a| a.shift_ri(ShiftOp::Sar, Width::Dword, Reg::Rax, 3));
        assert_eq!(code, [0xC1, 0xF8, 0x03]);

        // SAR EAX, 1 = D1 F8
        let code = assemble(|a| a.shift_ri(ShiftOp::Sar, Width::Dword, Reg::Rax, 1));
        assert_eq!(code, [0xD1, 0xF8]);

        // SHL RDX, CL = 48 D3 E2
        let code = assemble(|a| a.shift_cl(ShiftOp::Shl, Width::Qword, Reg::Rdx));
        assert_eq!(code, [0x48, 0xD3, 0xE2]);

        // SHLD EDX, EAX, CL = 0F A5 C2
        let code = assemble(|a| a.shld_cl(Reg::Rdx, Reg::Rax));
        assert_eq!(code, [0x0F, 0xA5, 0xC2]);
    }

    #[test]
    fn test_cmov_and_setcc() {
        // CMOVE RAX, RBX = 48 0F 44 C3
        let code = assemble(|a| a.cmov(Cond::E, Width::Qword, Reg::Rax, Reg::Rbx));
        assert_eq!(code, [0x48, 0x0F, 0x44, 0xC3]);

        // SETE AL = 0F 94 C0
        let code = assemble(|a| a.setcc(Cond::E, Reg::Rax));
        assert_eq!(code, [0x0F, 0x94, 0xC0]);

        // SETL DIL = 40 0F 9C C7
        let code = assemble(|a| a.setcc(Cond::L, Reg::Rdi));
        assert_eq!(code, [0x40, 0x0F, 0x9C, 0xC7]);
    }

    #[test]
    fn test_lock_cmpxchg() {
        // LOCK CMPXCHG [RDX], RCX = F0 48 0F B1 0A
        let code = assemble(|a| {
            a.lock();
            a.cmpxchg(Width::Qword, &Address::new(Reg::Rdx, 0), Reg::Rcx);
        });
        assert_eq!(code, [0xF0, 0x48, 0x0F, 0xB1, 0x0A]);
    }

    #[test]
    fn test_push_pop() {
        let code = assemble(|a| {
            a.push(Reg::Rbx);
            a.push(Reg::R12);
            a.pop(Reg::R12);
            a.pop(Reg::Rbx);
        });
        assert_eq!(code, [0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B]);
    }

    #[test]
    fn test_label_jumps() {
        // JE +1; NOP
        let code = assemble(|a| {
            let done = a.buffer().new_label();
            a.jcc(Cond::E, done);
            a.nop();
            a.buffer().bind(done);
        });
        assert_eq!(code, [0x0F, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90]);

        // JNS +1 (short); NOP
        let code = assemble(|a| {
            let done = a.buffer().new_label();
            a.jcc_short(Cond::Ns, done);
            a.nop();
            a.buffer().bind(done);
        });
        assert_eq!(code, [0x79, 0x01, 0x90]);
    }

    #[test]
    fn test_calls() {
        let mut buf = CodeBuffer::new();
        let at = X86_64Assembler::new(&mut buf).call_rel32(0x10);
        assert_eq!(at, 1);
        assert_eq!(buf.code(), &[0xE8, 0x10, 0x00, 0x00, 0x00]);

        // CALL R12 = 41 FF D4
        let code = assemble(|a| a.call_r(Reg::R12));
        assert_eq!(code, [0x41, 0xFF, 0xD4]);

        // CALL [RAX+16] = FF 50 10
        let code = assemble(|a| a.call_m(&Address::new(Reg::Rax, 16)));
        assert_eq!(code, [0xFF, 0x50, 0x10]);
    }

    #[test]
    fn test_nops_have_requested_length() {
        for len in 0..20 {
            let code = assemble(|a| a.nops(len));
            assert_eq!(code.len(), len);
        }
        assert_eq!(assemble(|a| a.nops(5)), [0x0F, 0x1F, 0x44, 0x00, 0x00]);
    }

    #[test]
    fn test_sse() {
        // ADDSD XMM1, XMM2 = F2 0F 58 CA
        let code = assemble(|a| a.sse_arith(SseOp::Add, Fp::Double, Xmm(1), Xmm(2)));
        assert_eq!(code, [0xF2, 0x0F, 0x58, 0xCA]);

        // ADDSD XMM8, XMM1 = F2 44 0F 58 C1
        let code = assemble(|a| a.sse_arith(SseOp::Add, Fp::Double, Xmm(8), Xmm(1)));
        assert_eq!(code, [0xF2, 0x44, 0x0F, 0x58, 0xC1]);

        // UCOMISS XMM0, XMM1 = 0F 2E C1
        let code = assemble(|a| a.ucomis(Fp::Single, Xmm(0), Xmm(1)));
        assert_eq!(code, [0x0F, 0x2E, 0xC1]);

        // CVTTSS2SI EAX, XMM0 = F3 0F 2C C0
        let code = assemble(|a| a.cvtts2si(Fp::Single, Width::Dword, Reg::Rax, Xmm(0)));
        assert_eq!(code, [0xF3, 0x0F, 0x2C, 0xC0]);

        // CVTSI2SD XMM0, RAX = F2 48 0F 2A C0
        let code = assemble(|a| a.cvtsi2s(Fp::Double, Width::Qword, Xmm(0), Reg::Rax));
        assert_eq!(code, [0xF2, 0x48, 0x0F, 0x2A, 0xC0]);

        // MOVQ RAX, XMM1 = 66 48 0F 7E C8
        let code = assemble(|a| a.movd_from_xmm(Width::Qword, Reg::Rax, Xmm(1)));
        assert_eq!(code, [0x66, 0x48, 0x0F, 0x7E, 0xC8]);
    }

    #[test]
    fn test_memory_forms_for_stack_copies_and_polls() {
        // PUSH QWORD PTR [RSP+16] = FF 74 24 10
        let code = assemble(|a| a.push_m(&Address::new(Reg::Rsp, 16)));
        assert_eq!(code, [0xFF, 0x74, 0x24, 0x10]);

        // POP QWORD PTR [RSP+8] = 8F 44 24 08
        let code = assemble(|a| a.pop_m(&Address::new(Reg::Rsp, 8)));
        assert_eq!(code, [0x8F, 0x44, 0x24, 0x08]);

        // TEST [R10], EAX = 41 85 02
        let code = assemble(|a| a.test_mr(Width::Dword, &Address::new(Reg::R10, 0), Reg::Rax));
        assert_eq!(code, [0x41, 0x85, 0x02]);

        // SHLD EDX, EAX, 4 = 0F A4 C2 04
        let code = assemble(|a| a.shld_ri(Reg::Rdx, Reg::Rax, 4));
        assert_eq!(code, [0x0F, 0xA4, 0xC2, 0x04]);
    }

    #[test]
    fn test_byte_flag_update() {
        // OR BYTE PTR [R11+4], 1 = 41 80 4B 04 01
        let code = assemble(|a| a.alu_mi8(AluOp::Or, &Address::new(Reg::R11, 4), 1));
        assert_eq!(code, [0x41, 0x80, 0x4B, 0x04, 0x01]);
    }

    #[test]
    fn test_packed_sign_helpers() {
        // MOVMSKPD EAX, XMM1 = 66 0F 50 C1
        let code = assemble(|a| a.movmskp(Fp::Double, Reg::Rax, Xmm(1)));
        assert_eq!(code, [0x66, 0x0F, 0x50, 0xC1]);

        // XORPS XMM0, [RSP] = 0F 57 04 24
        let code = assemble(|a| a.xorp_m(Fp::Single, Xmm(0), &Address::new(Reg::Rsp, 0)));
        assert_eq!(code, [0x0F, 0x57, 0x04, 0x24]);

        let mut buf = CodeBuffer::new();
        let at = X86_64Assembler::new(&mut buf).lea_rip(Width::Qword, Reg::Rdx);
        assert_eq!(at, 3);
        assert_eq!(buf.code(), &[0x48, 0x8D, 0x15, 0, 0, 0, 0]);
    }

    #[test]
    fn test_movsd_rip() {
        let mut buf = CodeBuffer::new();
        let at = X86_64Assembler::new(&mut buf).movs_rip(Fp::Double, Xmm(0));
        assert_eq!(at, 4);
        assert_eq!(buf.code(), &[0xF2, 0x0F, 0x10, 0x05, 0, 0, 0, 0]);
    }
}
