//! LIR operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::operand::Operand;
use crate::asm::Reg;
use crate::runtime::{MethodId, RuntimeCall, TypeId};
use crate::scope::ScopeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    GreaterEqual,
    Greater,
    BelowEqual,
    AboveEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftKind {
    Shl,
    Shr,
    Ushr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertOp {
    I2L,
    L2I,
    I2B,
    I2C,
    I2S,
    I2F,
    I2D,
    L2F,
    L2D,
    F2I,
    F2L,
    D2I,
    D2L,
    F2D,
    D2F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrinsicOp {
    Abs,
    Sqrt,
}

/// Three-way comparisons producing -1, 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareToIntOp {
    /// Unordered operands produce -1
    FloatCompareLess,
    /// Unordered operands produce 1
    FloatCompareGreater,
    LongCompare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCheckCode {
    CheckCast,
    InstanceOf,
    StoreCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemBarKind {
    Full,
    Acquire,
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallKind {
    /// Direct call to a statically bound method
    Static { method: MethodId },
    /// Direct call to a virtual method proven monomorphic
    OptVirtual { method: MethodId },
    /// Call through an inline cache; the expected hub is loaded first
    InlineCache { method: MethodId },
    /// Call through the receiver's vtable
    Virtual { method: MethodId, vtable_index: u32 },
    /// Direct call into the runtime
    Runtime { call: RuntimeCall },
    /// Indirect call into native code through a register
    Native { symbol: String, target: Reg },
}

impl CallKind {
    pub fn method(&self) -> Option<MethodId> {
        match *self {
            CallKind::Static { method }
            | CallKind::OptVirtual { method }
            | CallKind::InlineCache { method }
            | CallKind::Virtual { method, .. } => Some(method),
            CallKind::Runtime { .. } | CallKind::Native { .. } => None,
        }
    }
}

/// A handler protecting the instruction the info is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandlerRef {
    pub handler: LabelId,
    #[serde(default)]
    pub catch_type: Option<TypeId>,
}

/// Debug information for one stop: where in the inlined source it is and
/// which locations hold references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEmitInfo {
    pub scope: ScopeId,
    pub bci: i32,
    /// Spill slots holding live references
    #[serde(default)]
    pub frame_refs: Vec<u32>,
    /// Registers holding live references
    #[serde(default)]
    pub register_refs: Vec<Reg>,
    /// Monitors held at this point; their object words are references
    #[serde(default)]
    pub locked_monitors: Vec<u32>,
    #[serde(default)]
    pub exception_handlers: Vec<ExceptionHandlerRef>,
}

impl CodeEmitInfo {
    pub fn new(scope: ScopeId, bci: i32) -> Self {
        Self {
            scope,
            bci,
            frame_refs: Vec::new(),
            register_refs: Vec::new(),
            locked_monitors: Vec::new(),
            exception_handlers: Vec::new(),
        }
    }

    pub fn with_register_ref(mut self, reg: Reg) -> Self {
        if !self.register_refs.contains(&reg) {
            self.register_refs.push(reg);
        }
        self
    }

    pub fn with_frame_ref(mut self, slot: u32) -> Self {
        self.frame_refs.push(slot);
        self
    }

    pub fn with_handler(mut self, handler: LabelId, catch_type: Option<TypeId>) -> Self {
        self.exception_handlers.push(ExceptionHandlerRef {
            handler,
            catch_type,
        });
        self
    }
}

/// Checks performed before a statically typed array copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayCopyFlags {
    pub src_null_check: bool,
    pub dst_null_check: bool,
    pub src_pos_positive_check: bool,
    pub dst_pos_positive_check: bool,
    pub length_positive_check: bool,
    pub src_range_check: bool,
    pub dst_range_check: bool,
    pub type_check: bool,
}

impl ArrayCopyFlags {
    pub fn all() -> Self {
        Self {
            src_null_check: true,
            dst_null_check: true,
            src_pos_positive_check: true,
            dst_pos_positive_check: true,
            length_positive_check: true,
            src_range_check: true,
            dst_range_check: true,
            type_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LirOp {
    Label {
        label: LabelId,
    },
    Branch {
        cond: Condition,
        #[serde(default = "int_kind")]
        kind: super::Kind,
        label: LabelId,
        /// Target taken when a float compare is unordered
        #[serde(default)]
        unordered: Option<LabelId>,
    },
    Move {
        src: Operand,
        dst: Operand,
        /// Present when a memory access doubles as a null check
        #[serde(default)]
        info: Option<CodeEmitInfo>,
    },
    Convert {
        conv: ConvertOp,
        src: Operand,
        dst: Operand,
    },
    Lea {
        addr: Operand,
        dst: Operand,
    },
    MonitorAddress {
        monitor: u32,
        dst: Operand,
    },
    Arith {
        arith: ArithOp,
        left: Operand,
        right: Operand,
        dst: Operand,
        #[serde(default)]
        temp: Option<Operand>,
        /// Division by zero check
        #[serde(default)]
        info: Option<CodeEmitInfo>,
    },
    Logic {
        logic: LogicOp,
        left: Operand,
        right: Operand,
        dst: Operand,
    },
    Shift {
        shift: ShiftKind,
        left: Operand,
        count: Operand,
        dst: Operand,
    },
    Negate {
        src: Operand,
        dst: Operand,
    },
    Intrinsic {
        intrinsic: IntrinsicOp,
        src: Operand,
        dst: Operand,
    },
    Compare {
        cond: Condition,
        left: Operand,
        right: Operand,
        #[serde(default)]
        info: Option<CodeEmitInfo>,
    },
    CompareToInt {
        cmp: CompareToIntOp,
        left: Operand,
        right: Operand,
        dst: Operand,
    },
    CondMove {
        cond: Condition,
        /// Kind of the values compared by the preceding compare
        #[serde(default = "int_kind")]
        kind: super::Kind,
        left: Operand,
        right: Operand,
        dst: Operand,
    },
    CompareAndSwap {
        addr: Operand,
        cmp_value: Operand,
        new_value: Operand,
    },
    MemBar {
        kind: MemBarKind,
    },
    SafepointPoll {
        tmp: Operand,
        info: CodeEmitInfo,
    },
    Call {
        call: CallKind,
        #[serde(default)]
        receiver: Option<Operand>,
        info: Option<CodeEmitInfo>,
    },
    Throw {
        exception_pc: Operand,
        exception: Operand,
        unwind: bool,
        info: CodeEmitInfo,
    },
    TypeCheck {
        code: TypeCheckCode,
        object: Operand,
        #[serde(default)]
        array: Option<Operand>,
        result: Operand,
        #[serde(default)]
        klass: Option<TypeId>,
        tmp1: Operand,
        tmp2: Operand,
        tmp3: Operand,
        #[serde(default)]
        fast_check: bool,
        #[serde(default)]
        info: Option<CodeEmitInfo>,
        #[serde(default)]
        profiled_method: Option<MethodId>,
        #[serde(default)]
        profiled_bci: i32,
    },
    Lock {
        hdr: Operand,
        obj: Operand,
        lock: Operand,
        #[serde(default)]
        scratch: Option<Operand>,
        monitor: u32,
        #[serde(default)]
        info: Option<CodeEmitInfo>,
    },
    Unlock {
        hdr: Operand,
        obj: Operand,
        lock: Operand,
        monitor: u32,
        #[serde(default)]
        info: Option<CodeEmitInfo>,
    },
    ArrayCopy {
        src: Operand,
        src_pos: Operand,
        dst: Operand,
        dst_pos: Operand,
        length: Operand,
        tmp: Operand,
        #[serde(default)]
        expected_type: Option<TypeId>,
        #[serde(default)]
        flags: ArrayCopyFlags,
        info: CodeEmitInfo,
    },
    ProfileCall {
        method: MethodId,
        bci: i32,
        mdo: Operand,
        #[serde(default)]
        receiver: Option<Operand>,
        #[serde(default)]
        known_holder: Option<TypeId>,
        #[serde(default)]
        virtual_call: bool,
    },
    NullCheck {
        obj: Operand,
        info: CodeEmitInfo,
    },
    Return {
        #[serde(default)]
        result: Option<Operand>,
    },
}

fn int_kind() -> super::Kind {
    super::Kind::Int
}

impl LirOp {
    /// Short mnemonic used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            LirOp::Label { .. } => "label",
            LirOp::Branch { .. } => "branch",
            LirOp::Move { .. } => "move",
            LirOp::Convert { .. } => "convert",
            LirOp::Lea { .. } => "lea",
            LirOp::MonitorAddress { .. } => "monitor_address",
            LirOp::Arith { .. } => "arith",
            LirOp::Logic { .. } => "logic",
            LirOp::Shift { .. } => "shift",
            LirOp::Negate { .. } => "negate",
            LirOp::Intrinsic { .. } => "intrinsic",
            LirOp::Compare { .. } => "cmp",
            LirOp::CompareToInt { .. } => "cmp_to_int",
            LirOp::CondMove { .. } => "cmove",
            LirOp::CompareAndSwap { .. } => "cas",
            LirOp::MemBar { .. } => "membar",
            LirOp::SafepointPoll { .. } => "safepoint",
            LirOp::Call { .. } => "call",
            LirOp::Throw { .. } => "throw",
            LirOp::TypeCheck { .. } => "type_check",
            LirOp::Lock { .. } => "lock",
            LirOp::Unlock { .. } => "unlock",
            LirOp::ArrayCopy { .. } => "arraycopy",
            LirOp::ProfileCall { .. } => "profile_call",
            LirOp::NullCheck { .. } => "null_check",
            LirOp::Return { .. } => "return",
        }
    }
}

impl fmt::Display for LirOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirOp::Label { label } => write!(f, "L{}:", label.0),
            LirOp::Branch { cond, label, .. } => write!(f, "branch {cond:?} L{}", label.0),
            LirOp::Move { src, dst, .. } => write!(f, "move {src} -> {dst}"),
            LirOp::Convert { conv, src, dst } => write!(f, "convert {conv:?} {src} -> {dst}"),
            LirOp::Arith {
                arith,
                left,
                right,
                dst,
                ..
            } => write!(f, "{arith:?} {left} {right} -> {dst}"),
            LirOp::Logic {
                logic,
                left,
                right,
                dst,
            } => write!(f, "{logic:?} {left} {right} -> {dst}"),
            LirOp::Shift {
                shift,
                left,
                count,
                dst,
            } => write!(f, "{shift:?} {left} {count} -> {dst}"),
            LirOp::Compare {
                cond, left, right, ..
            } => write!(f, "cmp {cond:?} {left} {right}"),
            LirOp::Call { call, .. } => write!(f, "call {call:?}"),
            other => f.write_str(other.name()),
        }
    }
}
