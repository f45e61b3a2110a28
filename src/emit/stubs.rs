//! Out-of-line slow paths.
//!
//! The fast path of an operation jumps to `entry`; slow paths are emitted
//! after the method body and, unless they throw, jump back to
//! `continuation`.

use crate::asm::{Fp, Label, Reg, Width, Xmm};
use crate::lir::CodeEmitInfo;
use crate::runtime::RuntimeCall;

#[derive(Debug, Clone)]
pub enum SlowPath {
    /// Calls a throwing runtime routine, optionally passing one register.
    Throw {
        entry: Label,
        call: RuntimeCall,
        argument: Option<Reg>,
        info: Option<CodeEmitInfo>,
    },
    MonitorEnter {
        entry: Label,
        continuation: Label,
        obj: Reg,
        lock: Reg,
        info: Option<CodeEmitInfo>,
    },
    MonitorExit {
        entry: Label,
        continuation: Label,
        lock: Reg,
    },
    /// Element-wise copy that raises the right exception on failure.
    ArrayCopy {
        entry: Label,
        continuation: Label,
        /// src, src_pos, dst, dst_pos, length
        args: [Reg; 5],
        info: CodeEmitInfo,
    },
    /// Fixes up a float to integer conversion that produced the
    /// indefinite value: NaN becomes zero, everything else saturates.
    ConvertToInt {
        entry: Label,
        continuation: Label,
        fp: Fp,
        width: Width,
        src: Xmm,
        dst: Reg,
    },
}

impl SlowPath {
    pub fn entry(&self) -> Label {
        match self {
            SlowPath::Throw { entry, .. }
            | SlowPath::MonitorEnter { entry, .. }
            | SlowPath::MonitorExit { entry, .. }
            | SlowPath::ArrayCopy { entry, .. }
            | SlowPath::ConvertToInt { entry, .. } => *entry,
        }
    }

    /// The runtime routine the path calls, if any.
    pub fn runtime_call(&self) -> Option<RuntimeCall> {
        match self {
            SlowPath::Throw { call, .. } => Some(*call),
            SlowPath::MonitorEnter { .. } => Some(RuntimeCall::MonitorEnter),
            SlowPath::MonitorExit { .. } => Some(RuntimeCall::MonitorExit),
            SlowPath::ArrayCopy { .. } => Some(RuntimeCall::SlowArrayCopy),
            SlowPath::ConvertToInt { .. } => None,
        }
    }
}
