//! Code emission.
//!
//! A [`Compiler`] turns one register-allocated [`LirMethod`] into a
//! [`CompiledMethod`] by walking its operations through a target emitter.
//! Emitters report failures without context; the driver attaches the
//! method and the operation and decides whether the failure is a bailout
//! the caller can recover from.

pub mod frame_map;
pub mod stub_cache;
pub mod stubs;
pub mod x86;

use std::sync::Arc;

use log::{debug, error, info, warn};

use self::stub_cache::StubCache;
use self::x86::X86Emitter;
use crate::config::{Arch, CompilerConfig};
use crate::error::{BailoutReason, CompileError, CompileResult, EmitError, EmitResult};
use crate::lir::{LirMethod, LirOp};
use crate::runtime::RuntimeModel;
use crate::scope::{ScopeId, ScopeTree};
use crate::target::CompiledMethod;

/// Emits the operations of one method, in order, into machine code.
pub trait LirEmitter {
    /// Entry points and frame setup.
    fn emit_prologue(&mut self) -> EmitResult;

    fn emit_op(&mut self, op: &LirOp) -> EmitResult;

    /// Emits the out-of-line code and encodes the metadata tables.
    fn finish(self: Box<Self>) -> EmitResult<CompiledMethod>;
}

pub struct Compiler {
    config: CompilerConfig,
    model: RuntimeModel,
    stubs: Arc<StubCache>,
}

impl Compiler {
    pub fn new(config: CompilerConfig, model: RuntimeModel) -> Self {
        Self::with_stubs(config, model, Arc::new(StubCache::new()))
    }

    /// A compiler sharing global stubs with other compilers.
    pub fn with_stubs(config: CompilerConfig, model: RuntimeModel, stubs: Arc<StubCache>) -> Self {
        Self {
            config,
            model,
            stubs,
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn model(&self) -> &RuntimeModel {
        &self.model
    }

    pub fn stubs(&self) -> &Arc<StubCache> {
        &self.stubs
    }

    /// Stack slots an exception path inside `scope` keeps for unlocking.
    pub fn lock_stack_size(&self, scopes: &ScopeTree, scope: ScopeId) -> u32 {
        scopes.compute_lock_stack_size(scope, &self.model, self.config.opt_inline_except)
    }

    fn emitter<'a>(&'a self, lir: &LirMethod, scopes: &'a ScopeTree) -> EmitResult<Box<dyn LirEmitter + 'a>> {
        let target = self.config.target;
        if target.windows && target.arch == Arch::Ia32 {
            return Err(BailoutReason::UnsupportedTarget("windows on ia32".to_string()).into());
        }
        let locks = scopes.max_locks();
        if lir.monitors < locks {
            return Err(EmitError::unsupported(format!(
                "frame has {} monitor slots but scopes hold {locks} locks",
                lir.monitors
            )));
        }
        Ok(Box::new(X86Emitter::new(
            &self.config,
            &self.model,
            &self.stubs,
            lir,
            scopes,
        )))
    }

    /// Compiles `lir`. A bailout leaves nothing behind: the caller can
    /// retry with other options or fall back to the interpreter.
    pub fn compile(&self, lir: &LirMethod) -> CompileResult<CompiledMethod> {
        let name = self.model.qualified_name(lir.method);
        match self.emit(&name, lir) {
            Ok(method) => {
                debug!(
                    "compiled {name}: {} bytes code, {} stops",
                    method.code.len(),
                    method.stops.len()
                );
                if self.config.traces(&name) {
                    info!("{}", method.trace_to_string(&self.model));
                }
                Ok(method)
            }
            Err(err @ CompileError::Bailout(_)) => {
                warn!("{err}");
                Err(err)
            }
            Err(err) => {
                error!("{err}");
                if self.config.abort_on_internal_error {
                    panic!("{err}");
                }
                Err(err)
            }
        }
    }

    fn emit(&self, name: &str, lir: &LirMethod) -> CompileResult<CompiledMethod> {
        let scopes = lir.scope_tree();
        let mut emitter = self
            .emitter(lir, &scopes)
            .map_err(|e| e.into_compile_error(name, "target selection"))?;
        emitter
            .emit_prologue()
            .map_err(|e| e.into_compile_error(name, "prologue"))?;
        for op in &lir.ops {
            emitter
                .emit_op(op)
                .map_err(|e| e.into_compile_error(name, op))?;
        }
        let method = emitter
            .finish()
            .map_err(|e| e.into_compile_error(name, "finish"))?;

        let size = method.bundle_size();
        if size > self.config.max_code_size {
            let err: EmitError = BailoutReason::CodeTooLarge(size).into();
            return Err(err.into_compile_error(name, "finish"));
        }
        Ok(method)
    }
}

#[cfg(test)]
mod tests {
    use super::x86::test_support::model;
    use super::*;
    use crate::asm::Reg;
    use crate::error::Bailout;
    use crate::lir::{Kind, LirMethod, Operand, TypeCheckCode};
    use crate::runtime::{MethodId, TypeId};

    fn checkcast() -> LirOp {
        LirOp::TypeCheck {
            code: TypeCheckCode::CheckCast,
            object: Operand::reg(Reg::Rsi, Kind::Object),
            array: None,
            result: Operand::reg(Reg::Rsi, Kind::Object),
            klass: Some(TypeId(0)),
            tmp1: Operand::reg(Reg::Rcx, Kind::Object),
            tmp2: Operand::reg(Reg::Rdx, Kind::Object),
            tmp3: Operand::reg(Reg::Rbx, Kind::Object),
            fast_check: false,
            info: None,
            profiled_method: None,
            profiled_bci: 0,
        }
    }

    fn returning(ops: Vec<LirOp>) -> LirMethod {
        let mut ops = ops;
        ops.push(LirOp::Return { result: None });
        LirMethod::new(MethodId(0), ops)
    }

    #[test]
    fn test_compile_names_the_method() {
        let compiler = Compiler::new(CompilerConfig::default(), model());
        let method = compiler.compile(&returning(vec![])).unwrap();
        assert_eq!(method.name, compiler.model().qualified_name(MethodId(0)));
        assert_eq!(method.method, Some(MethodId(0)));
    }

    #[test]
    fn test_global_stubs_are_shared() {
        let stubs = Arc::new(StubCache::new());
        let first = Compiler::with_stubs(CompilerConfig::default(), model(), stubs.clone());
        let second = Compiler::with_stubs(CompilerConfig::default(), model(), stubs.clone());
        first.compile(&returning(vec![checkcast()])).unwrap();
        let generated = stubs.len();
        assert_eq!(generated, 2);
        second.compile(&returning(vec![checkcast()])).unwrap();
        assert_eq!(stubs.len(), generated);
    }

    #[test]
    fn test_code_too_large_is_a_bailout() {
        let config = CompilerConfig {
            max_code_size: 16,
            ..CompilerConfig::default()
        };
        let err = Compiler::new(config, model())
            .compile(&returning(vec![]))
            .unwrap_err();
        assert!(err.is_bailout());
        assert!(matches!(
            err,
            CompileError::Bailout(Bailout {
                reason: BailoutReason::CodeTooLarge(_),
                ..
            })
        ));
    }

    #[test]
    fn test_internal_error_names_the_operation() {
        let op = LirOp::Move {
            src: Operand::reg(Reg::Rsi, Kind::Int),
            dst: Operand::reg(Reg::R9, Kind::Int),
            info: None,
        };
        let mut config = CompilerConfig::default();
        config.target.arch = Arch::Ia32;
        let err = Compiler::new(config, model())
            .compile(&returning(vec![op.clone()]))
            .unwrap_err();
        let CompileError::Internal(internal) = err else {
            panic!("expected an internal error, got {err:?}");
        };
        assert_eq!(internal.op, op.to_string());
    }

    #[test]
    #[should_panic(expected = "should not reach here")]
    fn test_abort_on_internal_error() {
        let config = CompilerConfig {
            abort_on_internal_error: true,
            ..CompilerConfig::default()
        };
        let op = LirOp::Move {
            src: Operand::reg(Reg::Rsi, Kind::Int),
            dst: Operand::stack(7, Kind::Int),
            info: None,
        };
        let _ = Compiler::new(config, model()).compile(&returning(vec![op]));
    }

    #[test]
    fn test_windows_ia32_is_unsupported() {
        let mut config = CompilerConfig::default();
        config.target.arch = Arch::Ia32;
        config.target.windows = true;
        let err = Compiler::new(config, model())
            .compile(&returning(vec![]))
            .unwrap_err();
        assert!(err.is_bailout());
    }

    #[test]
    fn test_frame_must_hold_every_scope_lock() {
        let mut scopes = ScopeTree::new(MethodId(0));
        let inlined = scopes.new_scope(ScopeId::ROOT, 3, MethodId(0), 1);
        scopes.set_minimum_locks(ScopeId::ROOT, 1);
        scopes.set_minimum_locks(inlined, 2);
        let mut lir = returning(vec![]);
        lir.scopes = Some(scopes);
        lir.monitors = 1;

        let compiler = Compiler::new(CompilerConfig::default(), model());
        let err = compiler.compile(&lir).unwrap_err();
        assert!(matches!(err, CompileError::Internal(_)), "{err:?}");

        lir.monitors = 2;
        assert!(compiler.compile(&lir).is_ok());
    }

    #[test]
    fn test_lock_stack_size_follows_config() {
        let mut model = model();
        model.methods[0].exception_handler_count = 1;
        let mut scopes = ScopeTree::new(MethodId(0));
        scopes.set_caller_stack_size(ScopeId::ROOT, 3);

        let compiler = Compiler::new(CompilerConfig::default(), model.clone());
        assert_eq!(compiler.lock_stack_size(&scopes, ScopeId::ROOT), 3);

        let config = CompilerConfig {
            opt_inline_except: false,
            ..CompilerConfig::default()
        };
        let compiler = Compiler::new(config, model);
        assert_eq!(compiler.lock_stack_size(&scopes, ScopeId::ROOT), 0);
    }
}
