//! Instance-of, checked cast and array store checks.
//!
//! Every hub carries a display of its primary supertypes. A type's
//! `super_check_offset` names the display slot that holds it when it is a
//! primary supertype, or the secondary super cache otherwise. A hit in the
//! display is decisive; a miss is decisive too unless the offset was the
//! cache slot, in which case the runtime's subtype search settles it.

use super::super::stubs::SlowPath;
use super::X86Emitter;
use crate::asm::{Address, AluOp, Cond, Label, Reg, Scale, Width, X86_64Assembler};
use crate::error::{BailoutReason, EmitError, EmitResult};
use crate::lir::{CodeEmitInfo, LirOp, TypeCheckCode};
use crate::runtime::{MethodId, RuntimeCall, TypeId};

/// Where control goes once the outcome of a check is known.
#[derive(Debug, Clone, Copy)]
struct Targets {
    success: Label,
    failure: Label,
    null: Label,
}

/// Address of a method's profile block and the cell for one bytecode.
#[derive(Debug, Clone, Copy)]
struct ProfileSite {
    mdo: u64,
    cell: i32,
}

/// Registers a type check may use.
#[derive(Debug, Clone, Copy)]
struct Temps {
    /// Holds the hub checked against
    sup: Reg,
    /// Holds the object's hub
    sub: Reg,
    scratch: Reg,
}

impl X86Emitter<'_> {
    pub(super) fn emit_type_check(&mut self, op: &LirOp) -> EmitResult {
        let LirOp::TypeCheck {
            code,
            object,
            array,
            result,
            klass,
            tmp1,
            tmp2,
            tmp3,
            fast_check,
            info,
            profiled_method,
            profiled_bci,
        } = op
        else {
            return Err(EmitError::unsupported(format!("{op} is not a type check")));
        };
        let obj = self.reg(object)?;
        let temps = Temps {
            sup: self.reg(tmp1)?,
            sub: self.reg(tmp2)?,
            scratch: self.reg(tmp3)?,
        };
        if [temps.sup, temps.sub, temps.scratch].contains(&obj) {
            return Err(EmitError::unsupported(format!("{object} aliases a type check temp")));
        }
        let profile = self.profile_site(*profiled_method, *profiled_bci)?;

        match code {
            TypeCheckCode::StoreCheck => {
                let array = array
                    .as_ref()
                    .ok_or_else(|| EmitError::unsupported("store check without an array"))?;
                let array = self.reg(array)?;
                self.store_check(obj, array, temps, profile, info.as_ref())
            }
            TypeCheckCode::CheckCast => {
                let klass = klass.ok_or_else(|| EmitError::unsupported("checkcast without a type"))?;
                let done = self.buf.new_label();
                let failure = self.buf.new_label();
                self.add_slow_path(SlowPath::Throw {
                    entry: failure,
                    call: RuntimeCall::ThrowClassCastException,
                    argument: Some(obj),
                    info: info.clone(),
                });
                let targets = Targets {
                    success: done,
                    failure,
                    null: done,
                };
                self.type_check_helper(obj, klass, *fast_check, temps, profile, targets)?;
                self.buf.bind(done);
                if result.as_register() != Some(obj) {
                    self.emit_move(object, result, None)?;
                }
                Ok(())
            }
            TypeCheckCode::InstanceOf => {
                let klass = klass.ok_or_else(|| EmitError::unsupported("instanceof without a type"))?;
                let dst = self.reg(result)?;
                let (success, failure, done) =
                    (self.buf.new_label(), self.buf.new_label(), self.buf.new_label());
                let targets = Targets {
                    success,
                    failure,
                    null: failure,
                };
                self.type_check_helper(obj, klass, *fast_check, temps, profile, targets)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.buffer().bind(failure);
                asm.mov_ri(Width::Dword, dst, 0);
                asm.jmp(done);
                asm.buffer().bind(success);
                asm.mov_ri(Width::Dword, dst, 1);
                asm.buffer().bind(done);
                Ok(())
            }
        }
    }

    /// Profile cell for a cast when cast profiling is on.
    fn profile_site(&self, method: Option<MethodId>, bci: i32) -> EmitResult<Option<ProfileSite>> {
        let Some(method) = method.filter(|_| self.config.profile_checkcasts) else {
            return Ok(None);
        };
        let data = self
            .model
            .method(method)
            .and_then(|m| m.profile.as_ref())
            .ok_or(BailoutReason::OutOfMemoryBuildingMethodData)?;
        let cell = data
            .cell(bci)
            .ok_or_else(|| EmitError::unsupported(format!("no profile cell at bci {bci}")))?;
        Ok(Some(ProfileSite {
            mdo: data.address,
            cell,
        }))
    }

    /// Null test of `obj`. With a profile the first null seen sets the
    /// cell's flag before going to `null`.
    fn null_test(&mut self, obj: Reg, mdo: Reg, profile: Option<ProfileSite>, null: Label) {
        let width = self.word_width();
        X86_64Assembler::new(&mut self.buf).test_rr(width, obj, obj);
        let Some(site) = profile else {
            X86_64Assembler::new(&mut self.buf).jcc(Cond::E, null);
            return;
        };
        let not_null = self.buf.new_label();
        X86_64Assembler::new(&mut self.buf).jcc(Cond::Ne, not_null);
        self.load_object(mdo, site.mdo);
        let layout = self.config.layout;
        let flags = Address::new(mdo, site.cell + layout.profile_flags_offset);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.alu_mi8(AluOp::Or, &flags, layout.profile_null_seen_flag);
        asm.jmp(null);
        asm.buffer().bind(not_null);
    }

    fn load_hub(&mut self, dst: Reg, obj: Reg) -> usize {
        let width = self.word_width();
        let hub = Address::new(obj, self.config.layout.hub_offset);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        let at = asm.position();
        asm.load(width, dst, &hub);
        at
    }

    /// Checks `obj`, known non-null unless profiling says otherwise,
    /// against the constant type `klass`.
    fn type_check_helper(
        &mut self,
        obj: Reg,
        klass: TypeId,
        fast_check: bool,
        temps: Temps,
        profile: Option<ProfileSite>,
        targets: Targets,
    ) -> EmitResult {
        let desc = self
            .model
            .type_desc(klass)
            .ok_or_else(|| EmitError::unsupported(format!("unknown type {}", klass.0)))?;
        let (hub, super_check_offset) = (desc.hub, desc.super_check_offset);
        let width = self.word_width();
        let (success, failure) = match profile {
            Some(_) => (self.buf.new_label(), self.buf.new_label()),
            None => (targets.success, targets.failure),
        };

        self.load_object(temps.sup, hub);
        self.null_test(obj, temps.scratch, profile, targets.null);
        self.verify_oop(obj);

        if fast_check {
            // exact type: compare the hub itself
            let addr = Address::new(obj, self.config.layout.hub_offset);
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.alu_rm(AluOp::Cmp, width, temps.sup, &addr);
            asm.jcc(Cond::Ne, failure);
        } else if !self.config.fast_path_type_check {
            self.load_hub(temps.sub, obj);
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.alu_rr(AluOp::Cmp, width, temps.sub, temps.sup);
            asm.jcc(Cond::E, success);
            self.slow_subtype_check(temps.sub, temps.sup, failure)?;
        } else {
            self.load_hub(temps.sub, obj);
            let display = Address::new(temps.sub, super_check_offset);
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.alu_rm(AluOp::Cmp, width, temps.sup, &display);
            if super_check_offset != self.config.layout.secondary_super_cache_offset {
                asm.jcc(Cond::Ne, failure);
            } else {
                asm.jcc(Cond::E, success);
                asm.alu_rr(AluOp::Cmp, width, temps.sub, temps.sup);
                asm.jcc(Cond::E, success);
                self.slow_subtype_check(temps.sub, temps.sup, failure)?;
            }
        }
        self.finish_type_check(obj, temps, profile, success, failure, targets)
    }

    /// Falls through on success; jumps to the profiling tails when a
    /// profile is kept.
    fn finish_type_check(
        &mut self,
        obj: Reg,
        temps: Temps,
        profile: Option<ProfileSite>,
        success: Label,
        failure: Label,
        targets: Targets,
    ) -> EmitResult {
        let Some(site) = profile else {
            X86_64Assembler::new(&mut self.buf).jmp(targets.success);
            return Ok(());
        };
        let mdo = temps.scratch;
        self.buf.bind(success);
        self.load_object(mdo, site.mdo);
        self.load_hub(temps.sup, obj);
        self.type_profile_helper(mdo, site.cell, temps.sup, targets.success)?;
        X86_64Assembler::new(&mut self.buf).jmp(targets.success);

        self.buf.bind(failure);
        self.load_object(mdo, site.mdo);
        let counter = Address::new(mdo, site.cell + self.config.layout.profile_counter_offset);
        let width = self.word_width();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.alu_mi(AluOp::Sub, width, &counter, 1);
        asm.jmp(targets.failure);
        Ok(())
    }

    fn store_check(
        &mut self,
        value: Reg,
        array: Reg,
        temps: Temps,
        profile: Option<ProfileSite>,
        info: Option<&CodeEmitInfo>,
    ) -> EmitResult {
        let done = self.buf.new_label();
        let failure = self.buf.new_label();
        self.add_slow_path(SlowPath::Throw {
            entry: failure,
            call: RuntimeCall::ThrowArrayStoreException,
            argument: Some(value),
            info: info.cloned(),
        });
        let targets = Targets {
            success: done,
            failure,
            null: done,
        };
        let (success, fail) = match profile {
            Some(_) => (self.buf.new_label(), self.buf.new_label()),
            None => (done, failure),
        };

        // storing null always succeeds
        self.null_test(value, temps.scratch, profile, done);
        let at = self.load_hub(temps.sup, array);
        if let Some(info) = info {
            self.record_implicit_exception(at, info)?;
        }
        self.load_hub(temps.sub, value);
        let width = self.word_width();
        let element = Address::new(temps.sup, self.config.layout.element_hub_offset);
        X86_64Assembler::new(&mut self.buf).load(width, temps.sup, &element);

        if self.config.fast_path_type_check {
            self.subtype_check_fast(temps.sub, temps.sup, temps.scratch, success, fail)?;
        }
        self.slow_subtype_check(temps.sub, temps.sup, fail)?;
        self.finish_type_check(value, temps, profile, success, fail, targets)?;
        self.buf.bind(done);
        Ok(())
    }

    /// Display check with the super check offset read from the hub.
    /// Falls through when only the subtype search can decide.
    pub(super) fn subtype_check_fast(
        &mut self,
        sub: Reg,
        sup: Reg,
        tmp: Reg,
        success: Label,
        failure: Label,
    ) -> EmitResult {
        let layout = self.config.layout;
        let width = self.word_width();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.alu_rr(AluOp::Cmp, width, sub, sup);
        asm.jcc(Cond::E, success);
        asm.load(Width::Dword, tmp, &Address::new(sup, layout.super_check_offset_offset));
        asm.alu_rm(AluOp::Cmp, width, sup, &Address::indexed(sub, tmp, Scale::Times1, 0));
        asm.jcc(Cond::E, success);
        asm.alu_ri(AluOp::Cmp, Width::Dword, tmp, layout.secondary_super_cache_offset);
        asm.jcc(Cond::Ne, failure);
        Ok(())
    }

    /// Calls the runtime's subtype search and jumps to `failure` when it
    /// answers false. Clobbers `sub`.
    pub(super) fn slow_subtype_check(&mut self, sub: Reg, sup: Reg, failure: Label) -> EmitResult {
        let width = self.word_width();
        self.store_argument(0, sub, width);
        self.store_argument(1, sup, width);
        self.call_stub(RuntimeCall::SlowSubtypeCheck, None)?;
        let result = self.frame.argument_address(0);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.load(width, sub, &result);
        asm.test_rr(width, sub, sub);
        asm.jcc(Cond::E, failure);
        Ok(())
    }

    /// Counts `recv` in the receiver rows of a type profile cell: bumps
    /// the row already holding it, or claims the first empty row. Jumps
    /// to `done` when a row was updated and falls through when every row
    /// holds another type.
    pub(super) fn type_profile_helper(&mut self, mdo: Reg, cell: i32, recv: Reg, done: Label) -> EmitResult {
        if mdo == recv {
            return Err(EmitError::unsupported("profile block and receiver share a register"));
        }
        let layout = self.config.layout;
        let rows = self.config.profile_type_width;
        let word = self.word;
        let width = self.word_width();
        for row in 0..rows {
            let next = self.buf.new_label();
            let receiver = Address::new(mdo, layout.receiver_offset(cell, row, word));
            let count = Address::new(mdo, layout.receiver_count_offset(cell, row, word));
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.alu_rm(AluOp::Cmp, width, recv, &receiver);
            asm.jcc(Cond::Ne, next);
            asm.alu_mi(AluOp::Add, width, &count, 1);
            asm.jmp(done);
            asm.buffer().bind(next);
        }
        for row in 0..rows {
            let next = self.buf.new_label();
            let receiver = Address::new(mdo, layout.receiver_offset(cell, row, word));
            let count = Address::new(mdo, layout.receiver_count_offset(cell, row, word));
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.alu_mi(AluOp::Cmp, width, &receiver, 0);
            asm.jcc(Cond::Ne, next);
            asm.store(width, &receiver, recv);
            asm.store_imm(width, &count, 1);
            asm.jmp(done);
            asm.buffer().bind(next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::asm::Reg;
    use crate::config::CompilerConfig;
    use crate::lir::{CodeEmitInfo, Kind, LirMethod, LirOp, Operand, TypeCheckCode};
    use crate::runtime::{MethodId, RuntimeCall, TypeId};
    use crate::scope::ScopeId;
    use crate::target::{Callee, StopKind};

    const OBJECT: TypeId = TypeId(0);
    const POINT: TypeId = TypeId(1);

    fn type_check(code: TypeCheckCode, klass: Option<TypeId>, info: Option<CodeEmitInfo>) -> LirOp {
        LirOp::TypeCheck {
            code,
            object: Operand::reg(Reg::Rsi, Kind::Object),
            array: (code == TypeCheckCode::StoreCheck).then(|| Operand::reg(Reg::Rdi, Kind::Object)),
            result: Operand::reg(Reg::Rax, Kind::Int),
            klass,
            tmp1: Operand::reg(Reg::Rcx, Kind::Object),
            tmp2: Operand::reg(Reg::Rdx, Kind::Object),
            tmp3: Operand::reg(Reg::Rbx, Kind::Object),
            fast_check: false,
            info,
            profiled_method: None,
            profiled_bci: 0,
        }
    }

    fn callees(method: &crate::target::CompiledMethod) -> Vec<Callee> {
        method.stops.iter().filter_map(|s| s.callee.clone()).collect()
    }

    #[test]
    fn test_instanceof_primary_supertype_is_decided_inline() {
        let code = body(
            &CompilerConfig::default(),
            vec![type_check(TypeCheckCode::InstanceOf, Some(POINT), None)],
            0,
        );
        #[rustfmt::skip]
        let expected = vec![
            0x48, 0x8B, 0x0D, 0, 0, 0, 0, // mov rcx, [rip + hub literal]
            0x48, 0x85, 0xF6, // test rsi, rsi
            0x0F, 0x84, 0x12, 0, 0, 0, // jz failure
            0x48, 0x8B, 0x16, // mov rdx, [rsi]
            0x48, 0x3B, 0x4A, 0x18, // cmp rcx, [rdx + 24]
            0x0F, 0x85, 0x05, 0, 0, 0, // jne failure
            0xE9, 0x0A, 0, 0, 0, // jmp success
            0xB8, 0, 0, 0, 0, // failure: mov eax, 0
            0xE9, 0x05, 0, 0, 0, // jmp done
            0xB8, 0x01, 0, 0, 0, // success: mov eax, 1
        ];
        assert_eq!(code, expected);
    }

    #[test]
    fn test_checkcast_to_secondary_slot_calls_subtype_search() {
        let lir = LirMethod::new(
            MethodId(0),
            vec![
                type_check(TypeCheckCode::CheckCast, Some(OBJECT), Some(CodeEmitInfo::new(ScopeId::ROOT, 2))),
                LirOp::Return { result: None },
            ],
        );
        let method = compile_with(&CompilerConfig::default(), &model(), &lir).unwrap();
        let callees = callees(&method);
        assert!(callees.contains(&Callee::GlobalStub(RuntimeCall::SlowSubtypeCheck)));
        assert!(callees.contains(&Callee::GlobalStub(RuntimeCall::ThrowClassCastException)));
    }

    #[test]
    fn test_store_check_null_checks_array() {
        let info = CodeEmitInfo::new(ScopeId::ROOT, 5);
        let lir = LirMethod::new(
            MethodId(0),
            vec![
                type_check(TypeCheckCode::StoreCheck, None, Some(info)),
                LirOp::Return { result: None },
            ],
        );
        let method = compile_with(&CompilerConfig::default(), &model(), &lir).unwrap();
        // test rsi, rsi; jz done; then the array hub load faults on null
        let stop = method.stops.get(0).unwrap();
        assert_eq!((stop.offset, stop.kind), (29, StopKind::Safepoint));
        assert_eq!(&method.code[29..32], &[0x48, 0x8B, 0x0F]);
        assert!(callees(&method).contains(&Callee::GlobalStub(RuntimeCall::ThrowArrayStoreException)));
    }

    #[test]
    fn test_profiled_checkcast_records_null_seen() {
        let mut config = CompilerConfig::default();
        config.profile_checkcasts = true;
        let mut op = type_check(TypeCheckCode::CheckCast, Some(POINT), None);
        if let LirOp::TypeCheck {
            profiled_method,
            profiled_bci,
            ..
        } = &mut op
        {
            *profiled_method = Some(MethodId(0));
            *profiled_bci = 7;
        }
        let code = body(&config, vec![op], 0);
        // or byte [rbx + 32], 1
        assert!(code.windows(4).any(|w| w == [0x80, 0x4B, 0x20, 0x01]));
        // counter decrement on failure: sub qword [rbx + 40], 1
        assert!(code.windows(4).any(|w| w == [0x48, 0x83, 0x6B, 0x28]));
    }

    #[test]
    fn test_aliased_temp_is_rejected() {
        let mut op = type_check(TypeCheckCode::InstanceOf, Some(POINT), None);
        if let LirOp::TypeCheck { tmp1, .. } = &mut op {
            *tmp1 = Operand::reg(Reg::Rsi, Kind::Object);
        }
        let lir = LirMethod::new(MethodId(0), vec![op]);
        assert!(compile_with(&CompilerConfig::default(), &model(), &lir).is_err());
    }
}
