//! Stack locking.
//!
//! A locked object's lock word points at the lock slot of a monitor in the
//! owner's frame, which holds the displaced header. A recursive lock stores
//! zero as its displaced header. The object's header is only written by the
//! compare-and-swap, so a fast path that gives up leaves it untouched.

use super::super::stubs::SlowPath;
use super::{PAGE_SIZE, X86Emitter};
use crate::asm::{Address, AluOp, Cond, Reg, X86_64Assembler};
use crate::error::{EmitError, EmitResult};
use crate::lir::{CodeEmitInfo, Operand};

impl X86Emitter<'_> {
    fn check_monitor(&self, monitor: u32) -> EmitResult {
        if monitor >= self.frame.monitors() {
            return Err(EmitError::unsupported(format!(
                "monitor {monitor} outside a frame of {} monitors",
                self.frame.monitors()
            )));
        }
        Ok(())
    }

    fn lock_registers(&self, hdr: &Operand, obj: &Operand, lock: &Operand) -> EmitResult<(Reg, Reg, Reg)> {
        let regs = (self.reg(hdr)?, self.reg(obj)?, self.reg(lock)?);
        if regs.0 == regs.1 || regs.0 == regs.2 || regs.1 == regs.2 {
            return Err(EmitError::unsupported("lock operands share a register"));
        }
        Ok(regs)
    }

    pub(super) fn emit_lock(
        &mut self,
        hdr: &Operand,
        obj: &Operand,
        lock: &Operand,
        monitor: u32,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        let (hdr, obj, lock) = self.lock_registers(hdr, obj, lock)?;
        if hdr != Reg::Rax {
            return Err(EmitError::unsupported("the header must be in rax"));
        }
        self.check_monitor(monitor)?;
        let entry = self.buf.new_label();
        let continuation = self.buf.new_label();
        self.add_slow_path(SlowPath::MonitorEnter {
            entry,
            continuation,
            obj,
            lock,
            info: info.cloned(),
        });

        let width = self.word_width();
        let lock_slot = self.frame.monitor_lock_address(monitor);
        let object_slot = self.frame.monitor_object_address(monitor);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.lea(width, lock, &lock_slot);
        asm.store(width, &object_slot, obj);
        if !self.config.use_fast_locking {
            asm.jmp(entry);
            asm.buffer().bind(continuation);
            return Ok(());
        }
        self.verify_oop(obj);

        let lock_word = Address::new(obj, self.config.layout.lock_word_offset);
        let at = self.buf.position();
        X86_64Assembler::new(&mut self.buf).load(width, hdr, &lock_word);
        if let Some(info) = info {
            self.record_implicit_exception(at, info)?;
        }
        let displaced = Address::new(lock, 0);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        // expect the unlocked form of the header
        asm.alu_ri(AluOp::Or, width, hdr, 1);
        asm.store(width, &displaced, hdr);
        if self.model.is_mp {
            asm.lock();
        }
        asm.cmpxchg(width, &lock_word, lock);
        asm.jcc(Cond::E, continuation);
        // already locked: recursive when the header points into this
        // thread's stack within a page above rsp
        asm.alu_rr(AluOp::Sub, width, hdr, Reg::Rsp);
        asm.alu_ri(AluOp::And, width, hdr, (self.word - 1) - PAGE_SIZE);
        asm.store(width, &displaced, hdr);
        asm.jcc(Cond::Ne, entry);
        asm.buffer().bind(continuation);
        Ok(())
    }

    pub(super) fn emit_unlock(&mut self, hdr: &Operand, obj: &Operand, lock: &Operand, monitor: u32) -> EmitResult {
        let (hdr, obj, lock) = self.lock_registers(hdr, obj, lock)?;
        self.check_monitor(monitor)?;
        let lock_slot = self.frame.monitor_lock_address(monitor);
        let width = self.word_width();
        X86_64Assembler::new(&mut self.buf).lea(width, lock, &lock_slot);
        self.unlock_object(hdr, obj, lock)
    }

    /// Releases the monitor whose lock slot `lock` points at. The lock
    /// address is the expected header, so it has to be in rax.
    pub(super) fn unlock_object(&mut self, hdr: Reg, obj: Reg, lock: Reg) -> EmitResult {
        if lock != Reg::Rax {
            return Err(EmitError::unsupported("the lock address must be in rax"));
        }
        let entry = self.buf.new_label();
        let continuation = self.buf.new_label();
        self.add_slow_path(SlowPath::MonitorExit {
            entry,
            continuation,
            lock,
        });
        if !self.config.use_fast_locking {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.jmp(entry);
            asm.buffer().bind(continuation);
            return Ok(());
        }

        let width = self.word_width();
        let displaced = Address::new(lock, 0);
        let object = Address::new(lock, self.word);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.load(width, hdr, &displaced);
        asm.test_rr(width, hdr, hdr);
        // recursive
        asm.jcc(Cond::E, continuation);
        asm.load(width, obj, &object);
        self.verify_oop(obj);

        let lock_word = Address::new(obj, self.config.layout.lock_word_offset);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if self.model.is_mp {
            asm.lock();
        }
        asm.cmpxchg(width, &lock_word, hdr);
        asm.jcc(Cond::Ne, entry);
        asm.buffer().bind(continuation);
        Ok(())
    }
}
