//! Walking the frames of compiled code.
//!
//! A compiled frame is `frame_size` bytes above its stack pointer with the
//! return address right after it, so the caller of a frame is found
//! without frame pointers. Return addresses point past their call; the
//! stop for a frame that is not the faulting one is therefore the closest
//! one before the return address.

use std::sync::Arc;

use super::cache::CodeCache;
use super::installed::InstalledMethod;
use crate::error::StackWalkError;
use crate::scope::CodePos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    pub ip: usize,
    pub sp: usize,
}

impl FrameCursor {
    pub fn new(ip: usize, sp: usize) -> Self {
        Self { ip, sp }
    }
}

/// What the frame below (the callee of) the frame being inspected is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeKind {
    /// A call resolution trampoline
    Trampoline,
    /// A trap handler that saved every register at a safepoint or fault
    TrapStub,
    /// A stub that saved the registers it uses
    CalleeSaved,
    Native,
    /// Another compiled method
    Java,
}

impl CalleeKind {
    /// Whether the callee holds this frame's register state, which makes
    /// the register map of the stop meaningful.
    pub fn saves_registers(self) -> bool {
        matches!(self, CalleeKind::TrapStub | CalleeKind::CalleeSaved)
    }

    /// Whether the frame stopped at the instruction itself rather than
    /// after a call.
    pub fn is_trap(self) -> bool {
        self == CalleeKind::TrapStub
    }
}

/// Receives the locations of live references in a frame.
pub trait ReferenceMapPreparer {
    fn set_frame_slot(&mut self, address: usize);

    /// `bit` is the encoding of the register holding a reference.
    fn set_register(&mut self, bit: usize);
}

/// Read access to the stack being walked.
pub trait StackMemory {
    fn read_word(&self, address: usize) -> Option<usize>;
}

/// A copy of a stack region.
#[derive(Debug, Clone, Default)]
pub struct StackSnapshot {
    base: usize,
    words: Vec<usize>,
    word_size: usize,
}

impl StackSnapshot {
    pub fn new(base: usize, word_size: usize, words: Vec<usize>) -> Self {
        Self {
            base,
            words,
            word_size,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn end(&self) -> usize {
        self.base + self.words.len() * self.word_size
    }
}

impl StackMemory for StackSnapshot {
    fn read_word(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        if self.word_size == 0 || offset % self.word_size != 0 {
            return None;
        }
        self.words.get(offset / self.word_size).copied()
    }
}

/// One compiled frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub cursor: FrameCursor,
    pub method: Arc<InstalledMethod>,
    /// Offset of `cursor.ip` in the method's code
    pub offset: u32,
}

impl Frame {
    /// Index of the stop describing this frame.
    pub fn stop_index(&self, callee: CalleeKind) -> Option<usize> {
        let stops = &self.method.method().stops;
        if callee.is_trap() {
            stops.find_exact(self.offset)
        } else {
            stops.find_closest(self.offset.checked_sub(1)?)
        }
    }
}

pub struct StackWalker<'a, M: StackMemory> {
    cache: &'a CodeCache,
    memory: &'a M,
}

impl<'a, M: StackMemory> StackWalker<'a, M> {
    pub fn new(cache: &'a CodeCache, memory: &'a M) -> Self {
        Self { cache, memory }
    }

    /// The compiled frame `cursor` is in.
    pub fn frame_at(&self, cursor: FrameCursor) -> Result<Frame, StackWalkError> {
        let method = self
            .cache
            .find_by_ip(cursor.ip)
            .ok_or(StackWalkError::NotCompiledCode(cursor.ip))?;
        let offset = method
            .offset_of(cursor.ip)
            .ok_or(StackWalkError::NotCompiledCode(cursor.ip))?;
        Ok(Frame {
            cursor,
            method,
            offset,
        })
    }

    /// Cursor of the caller of the frame at `cursor`.
    pub fn advance(&self, cursor: FrameCursor) -> Result<FrameCursor, StackWalkError> {
        let frame = self.frame_at(cursor)?;
        let compiled = frame.method.method();
        let return_slot = cursor.sp + compiled.frame_size as usize;
        let ip = self
            .memory
            .read_word(return_slot)
            .ok_or(StackWalkError::UnreadableStack(return_slot))?;
        Ok(FrameCursor {
            ip,
            sp: return_slot + compiled.word_size as usize,
        })
    }

    /// Reports the references live in the frame at `cursor`. Registers are
    /// only reported when `callee` saved them.
    pub fn prepare_reference_map(
        &self,
        cursor: FrameCursor,
        callee: CalleeKind,
        preparer: &mut dyn ReferenceMapPreparer,
    ) -> Result<(), StackWalkError> {
        let frame = self.frame_at(cursor)?;
        let compiled = frame.method.method();
        let index = frame
            .stop_index(callee)
            .ok_or_else(|| StackWalkError::NoStop {
                ip: cursor.ip,
                method: compiled.name.clone(),
            })?;
        let maps = &compiled.reference_maps;
        let word = compiled.word_size as usize;

        for slot in 0..maps.layout().frame_words as usize {
            if maps.is_frame_slot_ref(index, slot) {
                preparer.set_frame_slot(cursor.sp + slot * word);
            }
        }
        if callee.saves_registers() {
            for bit in 0..maps.layout().register_count as usize {
                if maps.is_register_ref(index, bit) {
                    preparer.set_register(bit);
                }
            }
        }
        Ok(())
    }

    /// Source position of `ip`, innermost scope first.
    pub fn debug_info_at(&self, ip: usize, implicit_exception_point: bool) -> Option<Arc<CodePos>> {
        let method = self.cache.find_by_ip(ip)?;
        let offset = method.offset_of(ip)?;
        method
            .method()
            .debug_info_at(offset, implicit_exception_point)
    }

    /// Calls `visitor` with the frame at `cursor`. Returns what the visitor
    /// returned.
    pub fn accept_frame_visitor(
        &self,
        cursor: FrameCursor,
        visitor: &mut impl FnMut(&Frame) -> bool,
    ) -> Result<bool, StackWalkError> {
        let frame = self.frame_at(cursor)?;
        Ok(visitor(&frame))
    }

    /// Visits compiled frames from `start` outwards until the visitor
    /// returns false or the walk leaves compiled code. Returns the number
    /// of frames visited.
    pub fn walk(
        &self,
        start: FrameCursor,
        mut visitor: impl FnMut(&Frame) -> bool,
    ) -> Result<usize, StackWalkError> {
        let mut cursor = start;
        let mut visited = 0;
        while self.cache.find_by_ip(cursor.ip).is_some() {
            visited += 1;
            if !self.accept_frame_visitor(cursor, &mut visitor)? {
                break;
            }
            cursor = self.advance(cursor)?;
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Reg;
    use crate::code::cache::test_support::runtime_page;
    use crate::config::CompilerConfig;
    use crate::emit::Compiler;
    use crate::emit::x86::test_support::model;
    use crate::lir::{CallKind, CodeEmitInfo, Kind, LirMethod, LirOp, Operand};
    use crate::runtime::MethodId;
    use crate::scope::ScopeId;
    use crate::target::StopKind;

    const STACK_BASE: usize = 0x10_0000;
    const OUTSIDE: usize = 0xDEAD_0000;

    #[derive(Default)]
    struct Collected {
        slots: Vec<usize>,
        registers: Vec<usize>,
    }

    impl ReferenceMapPreparer for Collected {
        fn set_frame_slot(&mut self, address: usize) {
            self.slots.push(address);
        }

        fn set_register(&mut self, bit: usize) {
            self.registers.push(bit);
        }
    }

    struct Fixture {
        cache: CodeCache,
        callee: Arc<InstalledMethod>,
        caller: Arc<InstalledMethod>,
        _page: crate::asm::ExecutableMemory,
    }

    /// Method 0 polls a safepoint with a reference in spill slot 1 and in
    /// rbx; method 1 calls it with a reference in spill slot 0.
    fn fixture() -> Fixture {
        let (page, linkage) = runtime_page();
        let compiler = Compiler::new(CompilerConfig::default(), model());
        let cache = CodeCache::new(linkage, compiler.stubs().clone());

        let poll_info = CodeEmitInfo::new(ScopeId::ROOT, 3)
            .with_frame_ref(1)
            .with_register_ref(Reg::Rbx);
        let mut lir = LirMethod::new(
            MethodId(0),
            vec![
                LirOp::SafepointPoll {
                    tmp: Operand::reg(Reg::Rcx, Kind::Word),
                    info: poll_info,
                },
                LirOp::Return { result: None },
            ],
        );
        lir.spill_slots = 2;
        let callee = cache
            .install(Arc::new(compiler.compile(&lir).unwrap()))
            .unwrap();

        let call_info = CodeEmitInfo::new(ScopeId::ROOT, 7).with_frame_ref(0);
        let mut lir = LirMethod::new(
            MethodId(1),
            vec![
                LirOp::Call {
                    call: CallKind::Static { method: MethodId(0) },
                    receiver: None,
                    info: Some(call_info),
                },
                LirOp::Return { result: None },
            ],
        );
        lir.spill_slots = 1;
        let caller = cache
            .install(Arc::new(compiler.compile(&lir).unwrap()))
            .unwrap();

        Fixture {
            cache,
            callee,
            caller,
            _page: page,
        }
    }

    fn first_stop(method: &InstalledMethod, kind: StopKind) -> usize {
        method
            .method()
            .stops
            .iter()
            .find(|s| s.kind == kind)
            .unwrap()
            .offset as usize
    }

    /// The stack with the callee on top, stopped at its safepoint.
    fn stack(f: &Fixture) -> (StackSnapshot, FrameCursor) {
        let callee_frame = f.callee.method().frame_size as usize;
        let caller_frame = f.caller.method().frame_size as usize;
        let return_address = f.caller.address() + first_stop(&f.caller, StopKind::DirectCall) + 5;

        let mut words = vec![0usize; (callee_frame + caller_frame) / 8 + 2];
        words[callee_frame / 8] = return_address;
        words[(callee_frame + 8 + caller_frame) / 8] = OUTSIDE;
        let top = FrameCursor::new(
            f.callee.address() + first_stop(&f.callee, StopKind::Safepoint),
            STACK_BASE,
        );
        (StackSnapshot::new(STACK_BASE, 8, words), top)
    }

    #[test]
    fn test_advance_finds_caller() {
        let f = fixture();
        let (memory, top) = stack(&f);
        let walker = StackWalker::new(&f.cache, &memory);
        let caller = walker.advance(top).unwrap();
        assert_eq!(caller.sp, STACK_BASE + f.callee.method().frame_size as usize + 8);
        assert_eq!(walker.frame_at(caller).unwrap().method.address(), f.caller.address());
    }

    #[test]
    fn test_walk_stops_outside_compiled_code() {
        let f = fixture();
        let (memory, top) = stack(&f);
        let walker = StackWalker::new(&f.cache, &memory);
        let mut names = Vec::new();
        let visited = walker
            .walk(top, |frame| {
                names.push(frame.method.method().method);
                true
            })
            .unwrap();
        assert_eq!(visited, 2);
        assert_eq!(names, vec![Some(MethodId(0)), Some(MethodId(1))]);

        let visited = walker.walk(top, |_| false).unwrap();
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_trap_frame_reports_registers() {
        let f = fixture();
        let (memory, top) = stack(&f);
        let walker = StackWalker::new(&f.cache, &memory);

        let mut refs = Collected::default();
        walker
            .prepare_reference_map(top, CalleeKind::TrapStub, &mut refs)
            .unwrap();
        // spill slot 1 is frame word 6
        assert_eq!(refs.slots, vec![STACK_BASE + 48]);
        assert_eq!(refs.registers, vec![Reg::Rbx.encoding() as usize]);
    }

    #[test]
    fn test_caller_frame_uses_stop_before_return_address() {
        let f = fixture();
        let (memory, top) = stack(&f);
        let walker = StackWalker::new(&f.cache, &memory);
        let caller = walker.advance(top).unwrap();

        let mut refs = Collected::default();
        walker
            .prepare_reference_map(caller, CalleeKind::Java, &mut refs)
            .unwrap();
        assert_eq!(refs.slots, vec![caller.sp + 40]);
        assert!(refs.registers.is_empty());

        assert_eq!(walker.debug_info_at(caller.ip, false).unwrap().bci, 7);
        assert_eq!(walker.debug_info_at(top.ip, true).unwrap().bci, 3);
    }

    #[test]
    fn test_unknown_ip_is_not_compiled_code() {
        let f = fixture();
        let memory = StackSnapshot::default();
        let walker = StackWalker::new(&f.cache, &memory);
        let err = walker.advance(FrameCursor::new(OUTSIDE, STACK_BASE)).unwrap_err();
        assert_eq!(err, StackWalkError::NotCompiledCode(OUTSIDE));
    }
}
