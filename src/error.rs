//! Error taxonomy of the backend.
//!
//! A [`Bailout`] abandons one compilation and lets the caller retry at a
//! lower tier. An [`InternalError`] means an upstream component produced
//! input the emitter can never handle.

use thiserror::Error;

use crate::asm::{FixupError, MemoryError};

/// Why a compilation was abandoned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BailoutReason {
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
    #[error("out of memory building method data")]
    OutOfMemoryBuildingMethodData,
    #[error("stub space exhausted")]
    StubSpaceExhausted,
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
    #[error("code too large: {0} bytes")]
    CodeTooLarge(usize),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("bailout in {method}: {reason}")]
pub struct Bailout {
    pub method: String,
    pub reason: BailoutReason,
}

/// An operand or operation combination the emitter should never see.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("should not reach here in {method} at `{op}`: {message}")]
pub struct InternalError {
    pub method: String,
    pub op: String,
    pub message: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Bailout(#[from] Bailout),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl CompileError {
    pub fn is_bailout(&self) -> bool {
        matches!(self, CompileError::Bailout(_))
    }

    pub fn method(&self) -> &str {
        match self {
            CompileError::Bailout(b) => &b.method,
            CompileError::Internal(e) => &e.method,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Failure while emitting one operation, before the method and operation
/// context is attached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error(transparent)]
    Bailout(BailoutReason),
    #[error("{0}")]
    ShouldNotReachHere(String),
}

impl EmitError {
    pub fn unsupported(what: impl std::fmt::Display) -> Self {
        EmitError::ShouldNotReachHere(what.to_string())
    }

    pub fn into_compile_error(self, method: &str, op: impl std::fmt::Display) -> CompileError {
        match self {
            EmitError::Bailout(reason) => Bailout {
                method: method.to_string(),
                reason,
            }
            .into(),
            EmitError::ShouldNotReachHere(message) => InternalError {
                method: method.to_string(),
                op: op.to_string(),
                message,
            }
            .into(),
        }
    }
}

impl From<BailoutReason> for EmitError {
    fn from(reason: BailoutReason) -> Self {
        EmitError::Bailout(reason)
    }
}

impl From<FixupError> for EmitError {
    fn from(err: FixupError) -> Self {
        EmitError::ShouldNotReachHere(err.to_string())
    }
}

pub type EmitResult<T = ()> = Result<T, EmitError>;

/// Failure publishing compiled code.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("call at offset {offset} has no linkable callee: {callee}")]
    UnresolvedCallee { offset: usize, callee: String },
    #[error("no direct call at offset {0}")]
    NoCallAt(usize),
    #[error("call target {target:#x} is out of rel32 range from {site:#x}")]
    CallOutOfRange { site: usize, target: usize },
    #[error("method {0} has no installed code")]
    NotInstalled(String),
    #[error("{0} is not the code of a method")]
    NotAMethod(String),
}

/// Failure walking the frames of compiled code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackWalkError {
    #[error("{0:#x} is not in compiled code")]
    NotCompiledCode(usize),
    #[error("stack word at {0:#x} is not readable")]
    UnreadableStack(usize),
    #[error("no stop for {ip:#x} in {method}")]
    NoStop { ip: usize, method: String },
}
