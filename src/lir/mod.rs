//! Register-allocated LIR, the input of the emitter.

pub mod op;
pub mod operand;

use serde::{Deserialize, Serialize};

pub use op::{
    ArithOp, ArrayCopyFlags, CallKind, CodeEmitInfo, CompareToIntOp, Condition, ConvertOp,
    ExceptionHandlerRef, IntrinsicOp, LabelId, LirOp, LogicOp, MemBarKind, ShiftKind,
    TypeCheckCode,
};
pub use operand::{AddressOperand, Constant, Kind, Location, ObjectRef, Operand};

use crate::runtime::{MethodId, RuntimeModel};
use crate::scope::ScopeTree;

/// One method after register allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LirMethod {
    pub method: MethodId,
    /// Inlining scopes; a tree holding only the root when absent
    #[serde(default)]
    pub scopes: Option<ScopeTree>,
    #[serde(default)]
    pub spill_slots: u32,
    #[serde(default)]
    pub monitors: u32,
    pub ops: Vec<LirOp>,
}

impl LirMethod {
    pub fn new(method: MethodId, ops: Vec<LirOp>) -> Self {
        Self {
            method,
            scopes: None,
            spill_slots: 0,
            monitors: 0,
            ops,
        }
    }

    pub fn scope_tree(&self) -> ScopeTree {
        self.scopes
            .clone()
            .unwrap_or_else(|| ScopeTree::new(self.method))
    }
}

/// Everything the command line needs to compile one method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationRequest {
    pub model: RuntimeModel,
    pub method: LirMethod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_json() {
        let json = r#"{
            "model": {
                "types": [{"name": "Math", "hub": 4096}],
                "methods": [{"name": "id", "holder": 0, "signature": "(I)I", "is_static": true}]
            },
            "method": {
                "method": 0,
                "spill_slots": 1,
                "ops": [
                    {"op": "move",
                     "src": {"class": "register", "reg": "rsi", "kind": "int"},
                     "dst": {"class": "register", "reg": "rax", "kind": "int"}},
                    {"op": "return", "result": {"class": "register", "reg": "rax", "kind": "int"}}
                ]
            }
        }"#;
        let request: CompilationRequest = serde_json::from_str(json).unwrap();
        assert!(request.model.is_mp);
        assert_eq!(request.model.qualified_name(MethodId(0)), "Math.id(I)I");
        assert_eq!(request.method.ops.len(), 2);
        assert_eq!(request.method.scope_tree().root_method(), Some(MethodId(0)));
    }
}
