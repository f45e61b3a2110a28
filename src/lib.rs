//! c1x - the x86 back end of a baseline JIT compiler.
//!
//! The emitter turns register-allocated LIR into machine code together
//! with the metadata the runtime needs afterwards: stops with reference
//! maps, an exception table and compressed source positions. Compiled
//! methods are installed into executable memory by the code cache, which
//! also forwards superseded versions and supports stack walks.

pub mod asm;
pub mod code;
pub mod config;
pub mod emit;
pub mod error;
pub mod lir;
pub mod runtime;
pub mod scope;
pub mod target;

pub use code::{CodeCache, InstalledMethod, StackWalker};
pub use config::{Arch, CompilerConfig, TargetConfig};
pub use emit::Compiler;
pub use error::{CompileError, CompileResult, InstallError};
pub use lir::{CompilationRequest, LirMethod, LirOp};
pub use runtime::{MethodId, RuntimeCall, RuntimeLinkage, RuntimeModel, TypeId};
pub use target::CompiledMethod;
