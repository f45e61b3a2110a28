//! Operands of allocated LIR.
//!
//! By the time LIR reaches the emitter every operand has a fixed storage
//! class: a register, a register pair for wide values on IA-32, an SSE
//! register, a spill slot, a constant or a memory address.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::asm::{Reg, Xmm};

/// Machine type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object,
    Word,
    Void,
    Illegal,
}

impl Kind {
    /// Values that occupy two 32-bit words.
    pub fn is_double_word(self) -> bool {
        matches!(self, Kind::Long | Kind::Double)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Kind::Float | Kind::Double)
    }

    pub fn is_sub_word(self) -> bool {
        matches!(self, Kind::Boolean | Kind::Byte | Kind::Char | Kind::Short)
    }

    /// Size of an array element of this kind.
    pub fn element_size(self, word: usize) -> usize {
        match self {
            Kind::Boolean | Kind::Byte => 1,
            Kind::Char | Kind::Short => 2,
            Kind::Int | Kind::Float => 4,
            Kind::Long | Kind::Double => 8,
            Kind::Object | Kind::Word => word,
            Kind::Void | Kind::Illegal => 0,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Kind::Boolean => "z",
            Kind::Byte => "b",
            Kind::Char => "c",
            Kind::Short => "s",
            Kind::Int => "i",
            Kind::Long => "l",
            Kind::Float => "f",
            Kind::Double => "d",
            Kind::Object => "a",
            Kind::Word => "w",
            Kind::Void => "v",
            Kind::Illegal => "-",
        };
        f.write_str(c)
    }
}

/// An object reference embedded in code, e.g. a hub or an interned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
}

impl Constant {
    pub fn kind(&self) -> Kind {
        match self {
            Constant::Int(_) => Kind::Int,
            Constant::Long(_) => Kind::Long,
            Constant::Float(_) => Kind::Float,
            Constant::Double(_) => Kind::Double,
            Constant::Object(_) => Kind::Object,
        }
    }

    /// Raw bit pattern, zero-extended.
    pub fn bits(&self) -> u64 {
        match *self {
            Constant::Int(v) => v as u32 as u64,
            Constant::Long(v) => v as u64,
            Constant::Float(v) => v.to_bits() as u64,
            Constant::Double(v) => v.to_bits(),
            Constant::Object(o) => o.0,
        }
    }

    pub fn lo(&self) -> i32 {
        self.bits() as u32 as i32
    }

    pub fn hi(&self) -> i32 {
        (self.bits() >> 32) as u32 as i32
    }

    /// Positive zero, which can be materialized without a literal.
    pub fn is_zero_bits(&self) -> bool {
        self.bits() == 0
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{v}"),
            Constant::Long(v) => write!(f, "{v}L"),
            Constant::Float(v) => write!(f, "{v}f"),
            Constant::Double(v) => write!(f, "{v}d"),
            Constant::Object(o) if o.is_null() => f.write_str("null"),
            Constant::Object(o) => write!(f, "obj:{:#x}", o.0),
        }
    }
}

/// `[base + index * scale + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressOperand {
    pub base: Reg,
    #[serde(default)]
    pub index: Option<Reg>,
    #[serde(default = "default_scale")]
    pub scale: u8,
    #[serde(default)]
    pub disp: i32,
}

fn default_scale() -> u8 {
    1
}

impl AddressOperand {
    pub fn new(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            scale: 1,
            disp,
        }
    }

    pub fn indexed(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        Self {
            base,
            index: Some(index),
            scale,
            disp,
        }
    }
}

impl fmt::Display for AddressOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}", self.base)?;
        if let Some(index) = self.index {
            write!(f, "+{index:?}*{}", self.scale)?;
        }
        if self.disp != 0 {
            write!(f, "{:+}", self.disp)?;
        }
        f.write_str("]")
    }
}

/// Where an operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Location {
    Register { reg: Reg },
    /// A long split over two 32-bit registers (IA-32 only)
    RegisterPair { lo: Reg, hi: Reg },
    Xmm { xmm: Xmm },
    StackSlot { index: u32 },
    /// Two consecutive spill words (IA-32) or one 8-byte slot
    DoubleStackSlot { index: u32 },
    Constant { value: Constant },
    Address { addr: AddressOperand },
    Illegal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    #[serde(flatten)]
    pub loc: Location,
    pub kind: Kind,
}

impl Operand {
    pub fn reg(reg: Reg, kind: Kind) -> Self {
        Self {
            loc: Location::Register { reg },
            kind,
        }
    }

    pub fn pair(lo: Reg, hi: Reg) -> Self {
        Self {
            loc: Location::RegisterPair { lo, hi },
            kind: Kind::Long,
        }
    }

    pub fn xmm(xmm: Xmm, kind: Kind) -> Self {
        Self {
            loc: Location::Xmm { xmm },
            kind,
        }
    }

    pub fn stack(index: u32, kind: Kind) -> Self {
        Self {
            loc: Location::StackSlot { index },
            kind,
        }
    }

    pub fn double_stack(index: u32, kind: Kind) -> Self {
        Self {
            loc: Location::DoubleStackSlot { index },
            kind,
        }
    }

    pub fn constant(value: Constant) -> Self {
        Self {
            loc: Location::Constant { value },
            kind: value.kind(),
        }
    }

    pub fn int(value: i32) -> Self {
        Self::constant(Constant::Int(value))
    }

    pub fn address(addr: AddressOperand, kind: Kind) -> Self {
        Self {
            loc: Location::Address { addr },
            kind,
        }
    }

    pub fn illegal() -> Self {
        Self {
            loc: Location::Illegal,
            kind: Kind::Illegal,
        }
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self.loc, Location::Illegal)
    }

    pub fn as_register(&self) -> Option<Reg> {
        match self.loc {
            Location::Register { reg } => Some(reg),
            _ => None,
        }
    }

    pub fn as_xmm(&self) -> Option<Xmm> {
        match self.loc {
            Location::Xmm { xmm } => Some(xmm),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<Constant> {
        match self.loc {
            Location::Constant { value } => Some(value),
            _ => None,
        }
    }

    pub fn is_stack(&self) -> bool {
        matches!(
            self.loc,
            Location::StackSlot { .. } | Location::DoubleStackSlot { .. }
        )
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.loc {
            Location::Register { reg } => write!(f, "{reg:?}|{}", self.kind),
            Location::RegisterPair { lo, hi } => write!(f, "{hi:?}:{lo:?}|{}", self.kind),
            Location::Xmm { xmm } => write!(f, "xmm{}|{}", xmm.0, self.kind),
            Location::StackSlot { index } => write!(f, "stack:{index}|{}", self.kind),
            Location::DoubleStackSlot { index } => write!(f, "dstack:{index}|{}", self.kind),
            Location::Constant { value } => write!(f, "{value}"),
            Location::Address { addr } => write!(f, "{addr}|{}", self.kind),
            Location::Illegal => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_halves() {
        let c = Constant::Long(0x1122_3344_5566_7788);
        assert_eq!(c.lo(), 0x5566_7788);
        assert_eq!(c.hi(), 0x1122_3344);
        assert!(Constant::Double(0.0).is_zero_bits());
        assert!(!Constant::Double(-0.0).is_zero_bits());
    }

    #[test]
    fn test_operand_json_shape() {
        let op = Operand::reg(Reg::Rax, Kind::Int);
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"class":"register","reg":"rax","kind":"int"}"#);

        let parsed: Operand =
            serde_json::from_str(r#"{"class":"constant","value":{"kind":"long","value":-1},"kind":"long"}"#)
                .unwrap();
        assert_eq!(parsed.as_constant(), Some(Constant::Long(-1)));
    }

    #[test]
    fn test_display() {
        let addr = AddressOperand::indexed(Reg::Rsi, Reg::Rcx, 4, 24);
        assert_eq!(Operand::address(addr, Kind::Int).to_string(), "[Rsi+Rcx*4+24]|i");
        assert_eq!(Operand::constant(Constant::Object(ObjectRef::NULL)).to_string(), "null");
    }
}
