//! Global stubs.
//!
//! Compiled code passes stub arguments in its outgoing argument area and
//! expects every register, SSE registers included, to survive the call. A
//! stub saves the machine state, moves the arguments into the native
//! convention, calls the runtime routine and, for routines with a result,
//! writes the result back over the caller's first argument slot.

use super::regs;
use crate::asm::{Address, AluOp, CodeBuffer, Fp, Reg, Width, X86_64Assembler, Xmm};
use crate::config::{Arch, TargetConfig};
use crate::error::EmitResult;
use crate::runtime::RuntimeCall;
use crate::target::{Callee, CodeKind, CompiledMethod, TargetMethodBuilder};

/// Bytes saved per SSE register; compiled code only keeps scalars in them.
const XMM_SAVE_SIZE: i32 = 8;

/// Space below the arguments a Win64 callee may use, plus room for a
/// fifth argument.
const WIN64_OUTGOING: i32 = 48;

fn saved_registers(arch: Arch) -> Vec<Reg> {
    (0..arch.register_count() as u8)
        .filter_map(Reg::from_encoding)
        .filter(|&reg| reg != Reg::Rsp)
        .collect()
}

fn xmm_count(arch: Arch) -> u8 {
    match arch {
        Arch::Amd64 => 16,
        Arch::Ia32 => 8,
    }
}

/// Generates the stub that forwards to the runtime routine for `call`.
pub fn generate(target: TargetConfig, call: RuntimeCall) -> EmitResult<CompiledMethod> {
    let arch = target.arch;
    let word = arch.word_size() as i32;
    let width = if arch.is_64bit() { Width::Qword } else { Width::Dword };
    let saved = saved_registers(arch);
    let xmm_area = xmm_count(arch) as i32 * XMM_SAVE_SIZE;
    let outgoing = if arch.is_64bit() && target.windows { WIN64_OUTGOING } else { 0 };
    // bytes between rsp after the prologue and the return address
    let frame = saved.len() as i32 * word + xmm_area + outgoing;
    // caller's argument slot `i`, seen from the stub's rsp
    let caller_slot = |i: usize| Address::new(Reg::Rsp, frame + word + i as i32 * word);

    let mut buf = CodeBuffer::new();
    let mut builder = TargetMethodBuilder::new(
        None,
        format!("stub {call}"),
        CodeKind::GlobalStub,
        word as u32,
        frame as u32,
        arch.register_count(),
    );

    let mut asm = X86_64Assembler::new(&mut buf);
    for &reg in &saved {
        asm.push(reg);
    }
    asm.alu_ri(AluOp::Sub, width, Reg::Rsp, xmm_area + outgoing);
    for i in 0..xmm_count(arch) {
        let slot = Address::new(Reg::Rsp, outgoing + i as i32 * XMM_SAVE_SIZE);
        asm.movs_store(Fp::Double, &slot, Xmm(i));
    }

    let arguments = call.arguments();
    match arch {
        Arch::Amd64 => {
            let native: &[Reg] = if target.windows {
                &regs::WIN64_ARGS
            } else {
                &regs::SYSV_ARGS
            };
            for i in 0..arguments {
                match native.get(i) {
                    Some(&reg) => asm.load(Width::Qword, reg, &caller_slot(i)),
                    None => {
                        let stack = Address::new(Reg::Rsp, 32 + 8 * (i - native.len()) as i32);
                        asm.load(Width::Qword, regs::SCRATCH, &caller_slot(i));
                        asm.store(Width::Qword, &stack, regs::SCRATCH);
                    }
                }
            }
        }
        Arch::Ia32 => {
            // right to left; each push moves the next argument one word
            // further from esp, so every push reads the same address
            for _ in 0..arguments {
                asm.push_m(&caller_slot(arguments.saturating_sub(1)));
            }
        }
    }
    let at = asm.position();
    asm.call_rel32(0);
    let frame_map = builder.new_frame_map();
    builder.record_direct_call(at, Callee::Runtime(call), frame_map, None);

    let mut asm = X86_64Assembler::new(&mut buf);
    if call.is_throwing() {
        asm.int3();
        return builder.finish(buf);
    }
    if !arch.is_64bit() && arguments > 0 {
        asm.alu_ri(AluOp::Add, Width::Dword, Reg::Rsp, arguments as i32 * word);
    }
    if call.has_result() {
        asm.store(width, &caller_slot(0), Reg::Rax);
    }
    for i in 0..xmm_count(arch) {
        let slot = Address::new(Reg::Rsp, outgoing + i as i32 * XMM_SAVE_SIZE);
        asm.movs_load(Fp::Double, Xmm(i), &slot);
    }
    asm.alu_ri(AluOp::Add, width, Reg::Rsp, xmm_area + outgoing);
    for &reg in saved.iter().rev() {
        asm.pop(reg);
    }
    asm.ret();
    builder.finish(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::StopKind;

    fn amd64() -> TargetConfig {
        TargetConfig::default()
    }

    #[test]
    fn test_stub_saves_registers_and_calls_runtime() {
        let stub = generate(amd64(), RuntimeCall::MonitorEnter).unwrap();
        assert_eq!(stub.kind, CodeKind::GlobalStub);
        // push rax .. push rbx, rsp skipped
        assert_eq!(&stub.code[..5], &[0x50, 0x51, 0x52, 0x53, 0x55]);
        // fifteen pushes and 128 bytes of SSE state: the first argument
        // is at rsp + 256
        let first_arg = [0x48, 0x8B, 0xBC, 0x24, 0x00, 0x01, 0x00, 0x00];
        assert!(stub.code.windows(8).any(|w| w == first_arg));

        let stop = stub.stops.get(0).unwrap();
        assert_eq!(stop.kind, StopKind::DirectCall);
        assert_eq!(stop.callee, Some(Callee::Runtime(RuntimeCall::MonitorEnter)));
        assert_eq!(stub.code[stop.offset as usize], 0xE8);
        assert_eq!(stub.code.last(), Some(&0xC3));
        assert_eq!(stub.frame_size, 248);
    }

    #[test]
    fn test_result_is_written_to_first_argument_slot() {
        let stub = generate(amd64(), RuntimeCall::SlowSubtypeCheck).unwrap();
        // mov [rsp + 256], rax
        let store = [0x48, 0x89, 0x84, 0x24, 0x00, 0x01, 0x00, 0x00];
        assert!(stub.code.windows(8).any(|w| w == store));

        let stub = generate(amd64(), RuntimeCall::MonitorExit).unwrap();
        assert!(!stub.code.windows(8).any(|w| w == store));
    }

    #[test]
    fn test_throwing_stub_does_not_return() {
        let stub = generate(amd64(), RuntimeCall::ThrowClassCastException).unwrap();
        assert_eq!(stub.code.last(), Some(&0xCC));
        // no epilogue: add rsp, 128 never appears
        let epilogue = [0x48, 0x81, 0xC4, 0x80, 0x00, 0x00, 0x00];
        assert!(!stub.code.windows(7).any(|w| w == epilogue));
    }

    #[test]
    fn test_win64_passes_fifth_argument_on_stack() {
        let target = TargetConfig {
            windows: true,
            ..TargetConfig::default()
        };
        let stub = generate(target, RuntimeCall::SlowArrayCopy).unwrap();
        // mov [rsp + 32], r10
        let store = [0x4C, 0x89, 0x54, 0x24, 0x20];
        assert!(stub.code.windows(5).any(|w| w == store));
    }

    #[test]
    fn test_ia32_pushes_arguments() {
        let target = TargetConfig {
            arch: Arch::Ia32,
            ..TargetConfig::default()
        };
        let stub = generate(target, RuntimeCall::MonitorEnter).unwrap();
        // seven pushes, 64 bytes of SSE state, the return address, then
        // the second argument: push dword [esp + 100] twice
        let push = [0xFF, 0x74, 0x24, 0x64];
        let pushes = stub.code.windows(4).filter(|w| *w == push).count();
        assert_eq!(pushes, 2);
        // add esp, 8 after the call
        assert!(stub.code.windows(3).any(|w| w == [0x83, 0xC4, 0x08]));
        assert_eq!(stub.frame_size, 92);
    }
}
