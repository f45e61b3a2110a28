//! Calls, returns, exceptions, safepoint polls and call profiling.

use super::{X86Emitter, regs};
use crate::asm::{Address, AluOp, Reg, Width, X86_64Assembler, Xmm};
use crate::error::{BailoutReason, EmitError, EmitResult};
use crate::lir::{CallKind, CodeEmitInfo, Kind, Operand};
use crate::runtime::{MethodId, RuntimeCall, TypeId};
use crate::target::Callee;

/// Length of `mov rax, imm64`, which loads the inline cache's expected hub.
const IC_LOAD_SIZE: usize = 10;
/// `lea rdx, [rip - LEA_RIP_SIZE]` yields the address of the lea itself.
const LEA_RIP_SIZE: i32 = 7;
/// Value an unresolved inline cache holds; matches no hub.
const IC_UNRESOLVED: i64 = -1;

impl X86Emitter<'_> {
    pub(super) fn emit_call(
        &mut self,
        call: &CallKind,
        receiver: Option<&Operand>,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        match call {
            CallKind::Static { method } | CallKind::OptVirtual { method } => {
                self.direct_call(Callee::Method(*method), info)
            }
            CallKind::InlineCache { method } => {
                let is_64bit = self.is_64bit();
                let load_size = if is_64bit { IC_LOAD_SIZE } else { 5 };
                self.align_call(load_size + 1);
                let mut asm = X86_64Assembler::new(&mut self.buf);
                if is_64bit {
                    asm.mov_ri64(Reg::Rax, IC_UNRESOLVED);
                } else {
                    asm.mov_ri(Width::Dword, Reg::Rax, IC_UNRESOLVED);
                }
                let at = asm.position();
                asm.call_rel32(0);
                self.record_call(at, true, Callee::Method(*method), info)
            }
            CallKind::Virtual {
                method,
                vtable_index,
            } => {
                let receiver = receiver
                    .ok_or_else(|| EmitError::unsupported("virtual call without a receiver"))?;
                let recv = self.reg(receiver)?;
                let layout = self.config.layout;
                let width = self.word_width();
                let entry = layout.vtable_start_offset + *vtable_index as i32 * layout.vtable_entry_size;

                let mut asm = X86_64Assembler::new(&mut self.buf);
                let load_at = asm.position();
                asm.load(width, Reg::Rax, &Address::new(recv, layout.hub_offset));
                let call_at = asm.position();
                asm.call_m(&Address::new(Reg::Rax, entry));
                if let Some(info) = info {
                    self.record_implicit_exception(load_at, info)?;
                }
                self.record_call(call_at, false, Callee::Method(*method), info)
            }
            CallKind::Runtime { call } => self.call_runtime(*call, info),
            CallKind::Native { symbol, target } => {
                let target = self.check_reg(*target)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let at = asm.position();
                asm.call_r(target);
                self.record_call(at, false, Callee::Native(symbol.clone()), info)
            }
        }
    }

    fn direct_call(&mut self, callee: Callee, info: Option<&CodeEmitInfo>) -> EmitResult {
        self.align_call(1);
        let at = self.buf.position();
        X86_64Assembler::new(&mut self.buf).call_rel32(0);
        self.record_call(at, true, callee, info)
    }

    /// Touches the polling page; the runtime protects it to stop threads.
    pub(super) fn emit_safepoint_poll(&mut self, tmp: &Operand, info: &CodeEmitInfo) -> EmitResult {
        let tmp = self.reg(tmp)?;
        let page = self.model.polling_page as i64;
        let width = self.word_width();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.mov_ri(width, tmp, page);
        let at = asm.position();
        asm.test_mr(Width::Dword, &Address::new(tmp, 0), Reg::Rax);
        self.record_implicit_exception(at, info)
    }

    pub(super) fn emit_null_check(&mut self, obj: &Operand, info: &CodeEmitInfo) -> EmitResult {
        let obj = self.reg(obj)?;
        let mut asm = X86_64Assembler::new(&mut self.buf);
        let at = asm.position();
        asm.test_mr(Width::Dword, &Address::new(obj, 0), Reg::Rax);
        self.record_implicit_exception(at, info)
    }

    /// Throws the exception in rax. The throwing pc goes to rdx and is
    /// the stop the handler search looks up.
    pub(super) fn emit_throw(
        &mut self,
        exception_pc: &Operand,
        exception: &Operand,
        unwind: bool,
        info: &CodeEmitInfo,
    ) -> EmitResult {
        if self.reg(exception)? != regs::EXCEPTION_OOP || self.reg(exception_pc)? != regs::EXCEPTION_PC {
            return Err(EmitError::unsupported("exception state must be in rax and rdx"));
        }
        self.verify_oop(regs::EXCEPTION_OOP);
        if unwind {
            self.call_runtime(RuntimeCall::UnwindException, None)?;
            X86_64Assembler::new(&mut self.buf).int3();
            return Ok(());
        }

        let is_64bit = self.is_64bit();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        let pc = asm.position();
        if is_64bit {
            let disp = asm.lea_rip(Width::Qword, regs::EXCEPTION_PC);
            asm.buffer().patch_u32(disp, (-LEA_RIP_SIZE) as u32);
        } else {
            // call the next instruction and pop the return address
            asm.call_rel32(0);
            asm.pop(regs::EXCEPTION_PC);
            asm.alu_ri(AluOp::Sub, Width::Dword, regs::EXCEPTION_PC, 5);
        }
        self.record_implicit_exception(pc, info)?;
        self.call_runtime(RuntimeCall::HandleException, None)?;
        X86_64Assembler::new(&mut self.buf).int3();
        Ok(())
    }

    pub(super) fn emit_return(&mut self, result: Option<&Operand>) -> EmitResult {
        if let Some(result) = result.filter(|r| !r.is_illegal()) {
            let location = self.return_location(result.kind)?;
            if result.loc != location.loc {
                self.emit_move(result, &location, None)?;
            } else if result.kind == Kind::Object {
                self.verify_oop(Reg::Rax);
            }
        }
        let frame_size = self.frame.frame_size() as i32;
        let width = self.word_width();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.alu_ri(AluOp::Add, width, Reg::Rsp, frame_size);
        asm.ret();
        Ok(())
    }

    fn return_location(&self, kind: Kind) -> EmitResult<Operand> {
        Ok(match kind {
            Kind::Float | Kind::Double => Operand::xmm(Xmm(0), kind),
            Kind::Long if !self.is_64bit() => Operand::pair(Reg::Rax, Reg::Rdx),
            Kind::Void | Kind::Illegal => {
                return Err(EmitError::unsupported(format!("returning a {kind} value")));
            }
            _ => Operand::reg(Reg::Rax, kind),
        })
    }

    /// Counts a call in the profile of `method`. Virtual calls also record
    /// the receiver's hub in the cell's receiver rows.
    pub(super) fn emit_profile_call(
        &mut self,
        method: MethodId,
        bci: i32,
        mdo: &Operand,
        receiver: Option<&Operand>,
        known_holder: Option<TypeId>,
        virtual_call: bool,
    ) -> EmitResult {
        let data = self
            .model
            .method(method)
            .and_then(|m| m.profile.as_ref())
            .ok_or(BailoutReason::OutOfMemoryBuildingMethodData)?;
        let cell = data
            .cell(bci)
            .ok_or_else(|| EmitError::unsupported(format!("no profile cell at bci {bci}")))?;
        let address = data.address;
        let mdo = self.reg(mdo)?;
        let width = self.word_width();
        let counter = Address::new(mdo, cell + self.config.layout.profile_counter_offset);

        self.load_object(mdo, address);
        if !virtual_call || !self.config.profile_virtual_calls {
            X86_64Assembler::new(&mut self.buf).alu_mi(AluOp::Add, width, &counter, 1);
            return Ok(());
        }

        let recv = receiver
            .ok_or_else(|| EmitError::unsupported("virtual call profile without a receiver"))?;
        let recv = self.reg(recv)?;
        let holder = known_holder
            .filter(|_| self.config.optimize_virtual_call_profiling)
            .map(|holder| {
                self.model
                    .type_desc(holder)
                    .map(|t| t.hub)
                    .ok_or_else(|| EmitError::unsupported(format!("unknown type {}", holder.0)))
            })
            .transpose()?;
        match holder {
            Some(hub) => self.load_object(recv, hub),
            None => {
                let hub = Address::new(recv, self.config.layout.hub_offset);
                X86_64Assembler::new(&mut self.buf).load(width, recv, &hub);
            }
        }
        let done = self.buf.new_label();
        self.type_profile_helper(mdo, cell, recv, done)?;
        // every row is taken by another receiver
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.alu_mi(AluOp::Add, width, &counter, 1);
        asm.buffer().bind(done);
        Ok(())
    }
}
