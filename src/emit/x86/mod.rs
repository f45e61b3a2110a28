//! Emitter for the x86 family.
//!
//! One emitter serves AMD64 and IA-32. On IA-32 longs live in register
//! pairs or in two stack words, and there is no scratch register:
//! constants that have to come from memory are staged in the outgoing
//! argument area at `[esp]` instead of the literal pool.

mod arith;
mod array_copy;
mod calls;
mod compare;
mod convert;
pub mod global_stubs;
mod locking;
mod moves;
mod type_check;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::LirEmitter;
use super::frame_map::FrameMap;
use super::stub_cache::StubCache;
use super::stubs::SlowPath;
use crate::asm::{
    Address, AluOp, CodeBuffer, Cond, Fp, Label, Reg, Scale, Width, X86_64Assembler, Xmm,
};
use crate::config::{Arch, CompilerConfig};
use crate::error::{EmitError, EmitResult};
use crate::lir::{
    AddressOperand, CodeEmitInfo, Constant, Kind, LabelId, LirMethod, LirOp, Location, ObjectRef,
    Operand,
};
use crate::runtime::{MethodDesc, MethodId, RuntimeCall, RuntimeModel};
use crate::scope::{CodePos, ScopeTree};
use crate::target::{
    BODY_OFFSET, ByteBitMap, Callee, CodeKind, CompiledMethod, OPTIMIZED_ENTRY_OFFSET,
    TargetMethodBuilder,
};

/// Fixed register assignments.
pub mod regs {
    use crate::asm::Reg;

    /// Never handed out by the register allocator (AMD64 only)
    pub const SCRATCH: Reg = Reg::R10;
    /// Exception object on entry to the handler search
    pub const EXCEPTION_OOP: Reg = Reg::Rax;
    /// Throwing pc on entry to the handler search
    pub const EXCEPTION_PC: Reg = Reg::Rdx;

    pub const SYSV_ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
    pub const WIN64_ARGS: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];
}

/// Page size assumed by the recursive stack-lock test.
const PAGE_SIZE: i32 = 4096;

pub struct X86Emitter<'a> {
    config: &'a CompilerConfig,
    model: &'a RuntimeModel,
    stubs: &'a StubCache,
    scopes: &'a ScopeTree,
    method: MethodId,
    arch: Arch,
    word: i32,
    frame: FrameMap,
    buf: CodeBuffer,
    builder: TargetMethodBuilder,
    labels: FxHashMap<LabelId, Label>,
    slow_paths: Vec<SlowPath>,
}

impl<'a> X86Emitter<'a> {
    pub fn new(
        config: &'a CompilerConfig,
        model: &'a RuntimeModel,
        stubs: &'a StubCache,
        lir: &LirMethod,
        scopes: &'a ScopeTree,
    ) -> Self {
        let arch = config.target.arch;
        let frame = FrameMap::new(arch, lir.spill_slots, lir.monitors);
        let builder = TargetMethodBuilder::new(
            Some(lir.method),
            model.qualified_name(lir.method),
            CodeKind::Method,
            arch.word_size(),
            frame.frame_size(),
            arch.register_count(),
        );
        Self {
            config,
            model,
            stubs,
            scopes,
            method: lir.method,
            arch,
            word: arch.word_size() as i32,
            frame,
            buf: CodeBuffer::new(),
            builder,
            labels: FxHashMap::default(),
            slow_paths: Vec::new(),
        }
    }

    fn is_64bit(&self) -> bool {
        self.arch.is_64bit()
    }

    fn method_desc(&self) -> Option<&'a MethodDesc> {
        self.model.method(self.method)
    }

    // ==================== Operand access ====================

    fn word_width(&self) -> Width {
        if self.is_64bit() { Width::Qword } else { Width::Dword }
    }

    /// Width of a value of `kind` held in one register.
    fn width(&self, kind: Kind) -> Width {
        match kind {
            Kind::Long | Kind::Object | Kind::Word => self.word_width(),
            _ => Width::Dword,
        }
    }

    fn fp(kind: Kind) -> EmitResult<Fp> {
        match kind {
            Kind::Float => Ok(Fp::Single),
            Kind::Double => Ok(Fp::Double),
            other => Err(EmitError::unsupported(format!("{other} is not a float kind"))),
        }
    }

    fn check_reg(&self, reg: Reg) -> EmitResult<Reg> {
        if !self.is_64bit() && reg.needs_rex_ext() {
            return Err(EmitError::unsupported(format!("{reg:?} on ia32")));
        }
        Ok(reg)
    }

    fn reg(&self, op: &Operand) -> EmitResult<Reg> {
        let reg = op
            .as_register()
            .ok_or_else(|| EmitError::unsupported(format!("expected a register, got {op}")))?;
        self.check_reg(reg)
    }

    fn pair(&self, op: &Operand) -> EmitResult<(Reg, Reg)> {
        match op.loc {
            Location::RegisterPair { lo, hi } if !self.is_64bit() => {
                Ok((self.check_reg(lo)?, self.check_reg(hi)?))
            }
            _ => Err(EmitError::unsupported(format!("expected a register pair, got {op}"))),
        }
    }

    fn xmm(&self, op: &Operand) -> EmitResult<Xmm> {
        let xmm = op
            .as_xmm()
            .ok_or_else(|| EmitError::unsupported(format!("expected an xmm register, got {op}")))?;
        if !self.is_64bit() && xmm.0 >= 8 {
            return Err(EmitError::unsupported(format!("xmm{} on ia32", xmm.0)));
        }
        Ok(xmm)
    }

    /// Address of a spill slot operand; for a double slot the low word.
    fn stack_address(&self, op: &Operand) -> EmitResult<Address> {
        let (index, words) = match op.loc {
            Location::StackSlot { index } => (index, 1),
            Location::DoubleStackSlot { index } if self.is_64bit() => (index, 1),
            Location::DoubleStackSlot { index } => (index, 2),
            _ => return Err(EmitError::unsupported(format!("expected a stack slot, got {op}"))),
        };
        if index + words > self.frame.spill_slots() {
            return Err(EmitError::unsupported(format!(
                "spill slot {index} outside a frame of {} slots",
                self.frame.spill_slots()
            )));
        }
        Ok(self.frame.spill_address(index))
    }

    fn address(&self, addr: &AddressOperand) -> EmitResult<Address> {
        let base = self.check_reg(addr.base)?;
        match addr.index {
            None => Ok(Address::new(base, addr.disp)),
            Some(index) => {
                let scale = Scale::from_bytes(addr.scale as usize)
                    .ok_or_else(|| EmitError::unsupported(format!("scale {}", addr.scale)))?;
                Ok(Address::indexed(base, self.check_reg(index)?, scale, addr.disp))
            }
        }
    }

    /// Address of a stack slot or memory operand.
    fn memory_address(&self, op: &Operand) -> EmitResult<Address> {
        match op.loc {
            Location::Address { addr } => self.address(&addr),
            Location::StackSlot { .. } | Location::DoubleStackSlot { .. } => {
                self.stack_address(op)
            }
            _ => Err(EmitError::unsupported(format!("expected memory, got {op}"))),
        }
    }

    fn label(&mut self, id: LabelId) -> Label {
        if let Some(label) = self.labels.get(&id) {
            return *label;
        }
        let label = self.buf.new_label();
        self.labels.insert(id, label);
        label
    }

    // ==================== Debug information ====================

    fn position(&self, info: &CodeEmitInfo) -> EmitResult<Arc<CodePos>> {
        if self.scopes.get(info.scope).is_none() {
            return Err(EmitError::unsupported(format!("unknown scope {}", info.scope.0)));
        }
        Ok(self.scopes.to_code_pos(info.scope, info.bci))
    }

    fn frame_map(&self, info: Option<&CodeEmitInfo>) -> EmitResult<ByteBitMap> {
        let mut map = self.builder.new_frame_map();
        let Some(info) = info else {
            return Ok(map);
        };
        let spills = info.frame_refs.iter().map(|&slot| {
            (slot < self.frame.spill_slots())
                .then(|| self.frame.spill_word(slot))
                .ok_or(slot)
        });
        let monitors = info.locked_monitors.iter().map(|&monitor| {
            (monitor < self.frame.monitors())
                .then(|| self.frame.monitor_object_word(monitor))
                .ok_or(monitor)
        });
        for word in spills.chain(monitors) {
            let word = word.map_err(|slot| {
                EmitError::unsupported(format!("reference slot {slot} outside the frame"))
            })?;
            map.set(word as usize);
        }
        Ok(map)
    }

    fn register_map(&self, info: &CodeEmitInfo) -> EmitResult<ByteBitMap> {
        let mut map = self.builder.new_register_map();
        for &reg in &info.register_refs {
            map.set(self.check_reg(reg)?.encoding() as usize);
        }
        Ok(map)
    }

    fn record_handlers(&mut self, offset: usize, info: &CodeEmitInfo) {
        for handler in &info.exception_handlers {
            let label = self.label(handler.handler);
            self.builder
                .record_exception_handler(offset, label, handler.catch_type);
        }
    }

    /// Records a call stop at `offset`, the first byte of the call.
    fn record_call(
        &mut self,
        offset: usize,
        direct: bool,
        callee: Callee,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        let frame_map = self.frame_map(info)?;
        let pos = info.map(|i| self.position(i)).transpose()?;
        if direct {
            self.builder.record_direct_call(offset, callee, frame_map, pos);
        } else {
            self.builder
                .record_indirect_call(offset, Some(callee), frame_map, pos);
        }
        if let Some(info) = info {
            self.record_handlers(offset, info);
        }
        Ok(())
    }

    /// Records a safepoint for an instruction that may fault, such as a
    /// load doubling as a null check.
    fn record_implicit_exception(&mut self, offset: usize, info: &CodeEmitInfo) -> EmitResult {
        let frame_map = self.frame_map(Some(info))?;
        let register_map = self.register_map(info)?;
        let pos = self.position(info)?;
        self.builder
            .record_safepoint(offset, frame_map, register_map, Some(pos));
        self.record_handlers(offset, info);
        Ok(())
    }

    fn record_literal(&mut self, disp_offset: usize, constant: Constant) {
        self.builder
            .record_data_patch(disp_offset, disp_offset + 4, constant);
    }

    /// Stages `constant` in the outgoing argument area and returns its
    /// address. Only valid between calls.
    fn stage_constant(&mut self, constant: Constant) -> Address {
        let slot = self.frame.argument_address(0);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.store_imm(Width::Dword, &slot, constant.lo());
        if constant.kind().is_double_word() {
            asm.store_imm(Width::Dword, &slot.offset(4), constant.hi());
        }
        slot
    }

    /// Loads a hub or other object constant into `dst`.
    fn load_object(&mut self, dst: Reg, value: u64) {
        if value == 0 {
            X86_64Assembler::new(&mut self.buf).mov_ri(Width::Dword, dst, 0);
        } else if self.is_64bit() {
            let at = X86_64Assembler::new(&mut self.buf).load_rip(Width::Qword, dst);
            self.record_literal(at, Constant::Object(ObjectRef(value)));
        } else {
            X86_64Assembler::new(&mut self.buf).mov_ri(Width::Dword, dst, value as u32 as i64);
        }
    }

    /// Traps unless `reg` holds a null or word-aligned reference.
    fn verify_oop(&mut self, reg: Reg) {
        if !self.config.verify_oops {
            return;
        }
        let ok = self.buf.new_label();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.test_ri(Width::Dword, reg, self.word - 1);
        asm.jcc_short(Cond::E, ok);
        asm.int3();
        self.buf.bind(ok);
    }

    // ==================== Calls into stubs and the runtime ====================

    /// Pads so that the call displacement `disp_delta` bytes ahead lands
    /// on a 4-byte boundary and can be patched atomically.
    fn align_call(&mut self, disp_delta: usize) {
        if !self.config.align_call_sites {
            return;
        }
        let pos = self.buf.position() + disp_delta;
        let pad = (4 - pos % 4) % 4;
        X86_64Assembler::new(&mut self.buf).nops(pad);
    }

    /// Stores `reg` into outgoing argument `index`.
    fn store_argument(&mut self, index: u32, reg: Reg, width: Width) {
        let slot = self.frame.argument_address(index);
        X86_64Assembler::new(&mut self.buf).store(width, &slot, reg);
    }

    /// Calls the global stub for `call`, creating it on first use. The
    /// arguments must already be in the outgoing argument area.
    fn call_stub(&mut self, call: RuntimeCall, info: Option<&CodeEmitInfo>) -> EmitResult {
        let target = self.config.target;
        self.stubs
            .get_or_create(call, || global_stubs::generate(target, call))?;
        self.align_call(1);
        let at = self.buf.position();
        X86_64Assembler::new(&mut self.buf).call_rel32(0);
        self.record_call(at, true, Callee::GlobalStub(call), info)
    }

    /// Direct call into a runtime routine that follows the native
    /// convention.
    fn call_runtime(&mut self, call: RuntimeCall, info: Option<&CodeEmitInfo>) -> EmitResult {
        self.align_call(1);
        let at = self.buf.position();
        X86_64Assembler::new(&mut self.buf).call_rel32(0);
        self.record_call(at, true, Callee::Runtime(call), info)
    }

    /// Moves outgoing arguments `0..count` into the native argument
    /// registers and calls `call`. IA-32 passes them in place on the stack.
    /// `int_args` marks arguments that are 32-bit ints.
    fn call_native_runtime(
        &mut self,
        call: RuntimeCall,
        count: u32,
        int_args: &[u32],
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        if !self.is_64bit() {
            return self.call_runtime(call, info);
        }
        let width = |i: u32| {
            if int_args.contains(&i) { Width::Dword } else { Width::Qword }
        };
        if self.config.target.windows {
            // shadow space plus stack arguments below the outgoing area
            let shadow = 48;
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.alu_ri(AluOp::Sub, Width::Qword, Reg::Rsp, shadow);
            for i in 0..count {
                let slot = self.frame.argument_address(i).offset(shadow);
                match regs::WIN64_ARGS.get(i as usize) {
                    Some(&reg) => asm.load(width(i), reg, &slot),
                    None => {
                        asm.load(Width::Qword, regs::SCRATCH, &slot);
                        asm.store(Width::Qword, &Address::new(Reg::Rsp, 32 + 8 * (i as i32 - 4)), regs::SCRATCH);
                    }
                }
            }
            self.call_runtime(call, info)?;
            X86_64Assembler::new(&mut self.buf).alu_ri(AluOp::Add, Width::Qword, Reg::Rsp, shadow);
            return Ok(());
        }
        let mut asm = X86_64Assembler::new(&mut self.buf);
        for i in 0..count {
            let reg = regs::SYSV_ARGS[i as usize];
            asm.load(width(i), reg, &self.frame.argument_address(i));
        }
        self.call_runtime(call, info)
    }

    // ==================== Slow paths ====================

    fn add_slow_path(&mut self, path: SlowPath) {
        self.slow_paths.push(path);
    }

    fn emit_slow_path(&mut self, path: SlowPath) -> EmitResult {
        self.buf.bind(path.entry());
        match path {
            SlowPath::Throw {
                call,
                argument,
                info,
                ..
            } => {
                if let Some(reg) = argument {
                    self.store_argument(0, reg, self.word_width());
                }
                self.call_stub(call, info.as_ref())?;
                X86_64Assembler::new(&mut self.buf).int3();
            }
            SlowPath::MonitorEnter {
                continuation,
                obj,
                lock,
                info,
                ..
            } => {
                let width = self.word_width();
                self.store_argument(0, obj, width);
                self.store_argument(1, lock, width);
                self.call_stub(RuntimeCall::MonitorEnter, info.as_ref())?;
                X86_64Assembler::new(&mut self.buf).jmp(continuation);
            }
            SlowPath::MonitorExit {
                continuation, lock, ..
            } => {
                self.store_argument(0, lock, self.word_width());
                self.call_stub(RuntimeCall::MonitorExit, None)?;
                X86_64Assembler::new(&mut self.buf).jmp(continuation);
            }
            SlowPath::ArrayCopy {
                continuation,
                args,
                info,
                ..
            } => {
                for (i, reg) in args.into_iter().enumerate() {
                    let width = if i % 2 == 0 { self.word_width() } else { Width::Dword };
                    self.store_argument(i as u32, reg, width);
                }
                self.call_stub(RuntimeCall::SlowArrayCopy, Some(&info))?;
                X86_64Assembler::new(&mut self.buf).jmp(continuation);
            }
            SlowPath::ConvertToInt {
                continuation,
                fp,
                width,
                src,
                dst,
                ..
            } => {
                let nan = self.buf.new_label();
                let (min, max) = match width {
                    Width::Dword => (i32::MIN as i64, i32::MAX as i64),
                    Width::Qword => (i64::MIN, i64::MAX),
                };
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.ucomis(fp, src, src);
                asm.jcc(Cond::P, nan);
                // the sign bit picks the bound; mov leaves the flags alone
                asm.movmskp(fp, dst, src);
                asm.test_ri(Width::Dword, dst, 1);
                asm.mov_ri(width, dst, min);
                asm.jcc(Cond::Ne, continuation);
                asm.mov_ri(width, dst, max);
                asm.jmp(continuation);
                asm.buffer().bind(nan);
                asm.alu_rr(AluOp::Xor, Width::Dword, dst, dst);
                asm.jmp(continuation);
            }
        }
        Ok(())
    }

    /// Entry the runtime dispatches to when an exception reaches this
    /// frame: search the handlers, release the monitor of a synchronized
    /// method, then unwind to the caller.
    fn emit_exception_handler_entry(&mut self) -> EmitResult {
        let entry = self.buf.new_label();
        self.buf.bind(entry);
        self.builder.set_exception_handler_entry(entry);
        X86_64Assembler::new(&mut self.buf).nop();

        let desc = self.method_desc();
        if desc.is_some_and(|m| m.has_exception_handlers()) {
            self.call_runtime(RuntimeCall::HandleException, None)?;
        }
        if desc.is_some_and(|m| m.is_synchronized) && self.config.generate_synchronization_code {
            if self.frame.monitors() == 0 {
                return Err(EmitError::unsupported("synchronized method without a monitor"));
            }
            let saved = self.frame.argument_address(2);
            let lock = self.frame.monitor_lock_address(0);
            let width = self.word_width();
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.store(width, &saved, regs::EXCEPTION_OOP);
            asm.lea(width, Reg::Rax, &lock);
            self.unlock_object(Reg::Rcx, Reg::Rbx, Reg::Rax)?;
            X86_64Assembler::new(&mut self.buf).load(width, regs::EXCEPTION_OOP, &saved);
        }
        self.call_runtime(RuntimeCall::UnwindException, None)?;
        X86_64Assembler::new(&mut self.buf).int3();
        Ok(())
    }

    fn emit_slow_paths(&mut self) -> EmitResult {
        // slow paths can add further slow paths
        while !self.slow_paths.is_empty() {
            for path in std::mem::take(&mut self.slow_paths) {
                self.emit_slow_path(path)?;
            }
        }
        Ok(())
    }

    fn finish_method(mut self) -> EmitResult<CompiledMethod> {
        self.emit_exception_handler_entry()?;
        self.emit_slow_paths()?;
        if let Some((id, _)) = self
            .labels
            .iter()
            .find(|(_, label)| !self.buf.is_bound(**label))
        {
            return Err(EmitError::unsupported(format!("label L{} never bound", id.0)));
        }
        self.builder.finish(self.buf)
    }
}

impl LirEmitter for X86Emitter<'_> {
    fn emit_prologue(&mut self) -> EmitResult {
        let body = self.buf.new_label();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        // unverified entry at 0, optimized entry at 8; forwarding rewrites
        // the first bytes of both words with a jump
        asm.jmp(body);
        asm.nops(OPTIMIZED_ENTRY_OFFSET - asm.position());
        asm.nops(BODY_OFFSET - asm.position());
        asm.buffer().bind(body);
        let frame_size = self.frame.frame_size() as i32;
        let width = self.word_width();
        X86_64Assembler::new(&mut self.buf).alu_ri(AluOp::Sub, width, Reg::Rsp, frame_size);
        Ok(())
    }

    fn emit_op(&mut self, op: &LirOp) -> EmitResult {
        match op {
            LirOp::Label { label } => {
                let label = self.label(*label);
                if self.buf.is_bound(label) {
                    return Err(EmitError::unsupported("label bound twice"));
                }
                self.buf.bind(label);
                Ok(())
            }
            LirOp::Branch {
                cond,
                kind,
                label,
                unordered,
            } => self.emit_branch(*cond, *kind, *label, *unordered),
            LirOp::Move { src, dst, info } => self.emit_move(src, dst, info.as_ref()),
            LirOp::Convert { conv, src, dst } => self.emit_convert(*conv, src, dst),
            LirOp::Lea { addr, dst } => self.emit_lea(addr, dst),
            LirOp::MonitorAddress { monitor, dst } => self.emit_monitor_address(*monitor, dst),
            LirOp::Arith {
                arith,
                left,
                right,
                dst,
                temp,
                info,
            } => self.emit_arith(*arith, left, right, dst, temp.as_ref(), info.as_ref()),
            LirOp::Logic {
                logic,
                left,
                right,
                dst,
            } => self.emit_logic(*logic, left, right, dst),
            LirOp::Shift {
                shift,
                left,
                count,
                dst,
            } => self.emit_shift(*shift, left, count, dst),
            LirOp::Negate { src, dst } => self.emit_negate(src, dst),
            LirOp::Intrinsic {
                intrinsic,
                src,
                dst,
            } => self.emit_intrinsic(*intrinsic, src, dst),
            LirOp::Compare {
                cond,
                left,
                right,
                info,
            } => self.emit_compare(*cond, left, right, info.as_ref()),
            LirOp::CompareToInt {
                cmp,
                left,
                right,
                dst,
            } => self.emit_compare_to_int(*cmp, left, right, dst),
            LirOp::CondMove {
                cond,
                kind,
                left,
                right,
                dst,
            } => self.emit_cond_move(*cond, *kind, left, right, dst),
            LirOp::CompareAndSwap {
                addr,
                cmp_value,
                new_value,
            } => self.emit_compare_and_swap(addr, cmp_value, new_value),
            LirOp::MemBar { kind } => self.emit_membar(*kind),
            LirOp::SafepointPoll { tmp, info } => self.emit_safepoint_poll(tmp, info),
            LirOp::Call {
                call,
                receiver,
                info,
            } => self.emit_call(call, receiver.as_ref(), info.as_ref()),
            LirOp::Throw {
                exception_pc,
                exception,
                unwind,
                info,
            } => self.emit_throw(exception_pc, exception, *unwind, info),
            LirOp::TypeCheck { .. } => self.emit_type_check(op),
            LirOp::Lock {
                hdr,
                obj,
                lock,
                monitor,
                info,
                ..
            } => self.emit_lock(hdr, obj, lock, *monitor, info.as_ref()),
            LirOp::Unlock {
                hdr,
                obj,
                lock,
                monitor,
                ..
            } => self.emit_unlock(hdr, obj, lock, *monitor),
            LirOp::ArrayCopy { .. } => self.emit_array_copy(op),
            LirOp::ProfileCall {
                method,
                bci,
                mdo,
                receiver,
                known_holder,
                virtual_call,
            } => self.emit_profile_call(
                *method,
                *bci,
                mdo,
                receiver.as_ref(),
                *known_holder,
                *virtual_call,
            ),
            LirOp::NullCheck { obj, info } => self.emit_null_check(obj, info),
            LirOp::Return { result } => self.emit_return(result.as_ref()),
        }
    }

    fn finish(self: Box<Self>) -> EmitResult<CompiledMethod> {
        (*self).finish_method()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for the emitter tests.

    use super::*;
    use crate::runtime::{MethodData, ProfileCell, TypeDesc};

    pub fn model() -> RuntimeModel {
        let mut model = RuntimeModel {
            polling_page: 0x7000_0000,
            ..RuntimeModel::default()
        };
        let object = model.add_type(TypeDesc {
            name: "Object".to_string(),
            superclass: None,
            interfaces: vec![],
            is_interface: false,
            component: None,
            hub: 0x1000,
            super_check_offset: 32,
            element_kind: None,
        });
        model.add_type(TypeDesc {
            name: "Point".to_string(),
            superclass: Some(object),
            interfaces: vec![],
            is_interface: false,
            component: None,
            hub: 0x2000,
            super_check_offset: 24,
            element_kind: None,
        });
        model.add_type(TypeDesc {
            name: "int[]".to_string(),
            superclass: Some(object),
            interfaces: vec![],
            is_interface: false,
            component: None,
            hub: 0x3000,
            super_check_offset: 24,
            element_kind: Some(Kind::Int),
        });
        model.add_method(MethodDesc {
            name: "run".to_string(),
            holder: object,
            signature: "()V".to_string(),
            is_synchronized: false,
            is_static: true,
            is_interface_method: false,
            exception_handler_count: 0,
            profile: Some(MethodData {
                address: 0x5000_0000,
                cells: vec![ProfileCell { bci: 7, offset: 32 }],
            }),
        });
        model
    }

    /// Emits `ops` for method 0 and returns the compiled method.
    pub fn compile_with(
        config: &CompilerConfig,
        model: &RuntimeModel,
        lir: &LirMethod,
    ) -> EmitResult<CompiledMethod> {
        let stubs = StubCache::new();
        let scopes = lir.scope_tree();
        let mut emitter = Box::new(X86Emitter::new(config, model, &stubs, lir, &scopes));
        emitter.emit_prologue()?;
        for op in &lir.ops {
            emitter.emit_op(op)?;
        }
        emitter.finish()
    }

    /// Bytes emitted for `ops` alone, between the prologue and the
    /// trailing exception handler entry, with jumps resolved and literal
    /// displacements left at zero.
    pub fn body(config: &CompilerConfig, ops: Vec<LirOp>, spill_slots: u32) -> Vec<u8> {
        let model = model();
        let mut lir = LirMethod::new(MethodId(0), ops);
        lir.spill_slots = spill_slots;
        let stubs = StubCache::new();
        let scopes = lir.scope_tree();
        let mut emitter = X86Emitter::new(config, &model, &stubs, &lir, &scopes);
        emitter.emit_prologue().unwrap();
        let start = emitter.buf.position();
        for op in &lir.ops {
            emitter.emit_op(op).unwrap();
        }
        let end = emitter.buf.position();
        emitter.emit_exception_handler_entry().unwrap();
        emitter.emit_slow_paths().unwrap();
        emitter.buf.resolve_fixups().unwrap();
        emitter.buf.code()[start..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::target::StopKind;

    #[test]
    fn test_entry_layout() {
        let config = CompilerConfig::default();
        let lir = LirMethod::new(MethodId(0), vec![LirOp::Return { result: None }]);
        let method = compile_with(&config, &model(), &lir).unwrap();

        // jmp to the body, padding, then the frame is allocated at 16
        assert_eq!(&method.code[..5], &[0xE9, 0x0B, 0x00, 0x00, 0x00]);
        assert_eq!(&method.code[16..20], &[0x48, 0x83, 0xEC, 0x28]);
        // add rsp, 40; ret
        assert_eq!(&method.code[20..25], &[0x48, 0x83, 0xC4, 0x28, 0xC3]);
        assert_eq!(method.frame_size, 40);
        assert!(method.exception_handler_offset.is_some());
    }

    #[test]
    fn test_exception_entry_calls_unwind() {
        let config = CompilerConfig::default();
        let lir = LirMethod::new(MethodId(0), vec![LirOp::Return { result: None }]);
        let method = compile_with(&config, &model(), &lir).unwrap();

        let entry = method.exception_handler_offset.unwrap();
        let stop = method.stops.iter().last().unwrap();
        assert!(stop.offset > entry);
        assert_eq!(stop.kind, StopKind::DirectCall);
        assert_eq!(
            stop.callee,
            Some(Callee::Runtime(RuntimeCall::UnwindException))
        );
        // aligned so the displacement can be patched atomically
        assert_eq!((stop.offset + 1) % 4, 0);
    }

    #[test]
    fn test_unbound_label_is_internal_error() {
        let config = CompilerConfig::default();
        let lir = LirMethod::new(
            MethodId(0),
            vec![LirOp::Branch {
                cond: crate::lir::Condition::Always,
                kind: Kind::Int,
                label: LabelId(3),
                unordered: None,
            }],
        );
        let err = compile_with(&config, &model(), &lir).unwrap_err();
        assert!(matches!(err, EmitError::ShouldNotReachHere(_)));
    }

    #[test]
    fn test_reference_slots_map_to_frame_words() {
        let config = CompilerConfig::default();
        let info = CodeEmitInfo::new(crate::scope::ScopeId::ROOT, 3).with_frame_ref(1);
        let mut lir = LirMethod::new(
            MethodId(0),
            vec![
                LirOp::SafepointPoll {
                    tmp: Operand::reg(Reg::Rcx, Kind::Word),
                    info,
                },
                LirOp::Return { result: None },
            ],
        );
        lir.spill_slots = 2;
        let method = compile_with(&config, &model(), &lir).unwrap();

        assert_eq!(method.stops.get(0).unwrap().kind, StopKind::Safepoint);
        // spill slot 1 sits above the five outgoing argument words
        assert!(method.reference_maps.is_frame_slot_ref(0, 6));
        assert_eq!(method.bytecode_location_at(0).unwrap().bci, 3);
    }
}
