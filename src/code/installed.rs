//! Compiled code copied into executable memory.
//!
//! Installation copies the position independent bundle into a fresh
//! mapping and fills in the displacement of every direct call. After that
//! the code is only changed one aligned 8-byte word at a time: call sites
//! are relinked by rewriting the word holding their displacement, and
//! forwarding rewrites the two entry words with jumps to the newer
//! version. Threads already past the entry keep running the old body.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::asm::ExecutableMemory;
use crate::error::InstallError;
use crate::target::{
    Callee, CodeKind, CompiledMethod, JIT_ENTRY_OFFSET, OPTIMIZED_ENTRY_OFFSET, StopKind,
};

const CALL_OPCODE: u8 = 0xE8;
const JMP_OPCODE: u8 = 0xE9;
/// Length of a `call rel32` or `jmp rel32`.
const REL32_INSN_SIZE: usize = 5;

pub struct InstalledMethod {
    method: Arc<CompiledMethod>,
    memory: ExecutableMemory,
    forwardee: Mutex<Option<Arc<InstalledMethod>>>,
}

/// Displacement of a rel32 instruction at `site` reaching `target`.
fn rel32(site: usize, target: usize) -> Result<i32, InstallError> {
    let next = site + REL32_INSN_SIZE;
    i32::try_from(target as i64 - next as i64)
        .map_err(|_| InstallError::CallOutOfRange { site, target })
}

impl InstalledMethod {
    /// Copies `method` into executable memory. `resolve` supplies the
    /// address of every direct callee.
    pub fn install(
        method: Arc<CompiledMethod>,
        resolve: impl Fn(&Callee) -> Option<usize>,
    ) -> Result<Self, InstallError> {
        let mut image = method.bundle();
        let mut memory = ExecutableMemory::new(image.len())?;
        let base = memory.address();

        for stop in method.stops.iter().filter(|s| s.kind == StopKind::DirectCall) {
            let offset = stop.offset as usize;
            if image.get(offset) != Some(&CALL_OPCODE) {
                return Err(InstallError::NoCallAt(offset));
            }
            let callee = stop.callee.as_ref().ok_or_else(|| InstallError::UnresolvedCallee {
                offset,
                callee: "none".to_string(),
            })?;
            let target = resolve(callee).ok_or_else(|| InstallError::UnresolvedCallee {
                offset,
                callee: callee.to_string(),
            })?;
            let disp = rel32(base + offset, target)?;
            image[offset + 1..offset + REL32_INSN_SIZE].copy_from_slice(&disp.to_le_bytes());
        }

        memory.write(0, &image)?;
        memory.make_executable()?;
        Ok(Self {
            method,
            memory,
            forwardee: Mutex::new(None),
        })
    }

    pub fn method(&self) -> &Arc<CompiledMethod> {
        &self.method
    }

    pub fn address(&self) -> usize {
        self.memory.address()
    }

    pub fn code_size(&self) -> usize {
        self.method.code.len()
    }

    /// Whether `ip` points into this method's instructions.
    pub fn contains(&self, ip: usize) -> bool {
        ip >= self.address() && ip < self.address() + self.code_size()
    }

    pub fn offset_of(&self, ip: usize) -> Option<u32> {
        self.contains(ip).then(|| (ip - self.address()) as u32)
    }

    pub fn entry_address(&self, optimized: bool) -> usize {
        self.address() + self.method.entry_offset(optimized)
    }

    /// The code as currently installed, patches included.
    pub fn code(&self) -> Result<Vec<u8>, InstallError> {
        Ok(self.memory.read(0, self.code_size())?)
    }

    /// Function pointer to an entry point.
    ///
    /// # Safety
    /// `F` must match the calling convention and signature of the code.
    pub unsafe fn entry_point<F: Copy>(&self, optimized: bool) -> Option<F> {
        // SAFETY: forwarded to the caller
        unsafe { self.memory.as_fn(self.method.entry_offset(optimized)) }
    }

    /// Points the direct call starting at `call_offset` at `target`. The
    /// displacement has to lie inside one aligned word, which call site
    /// alignment guarantees.
    pub fn patch_call_site(&self, call_offset: usize, target: usize) -> Result<(), InstallError> {
        if self
            .method
            .stops
            .direct_call_at(call_offset as u32)
            .is_none()
        {
            return Err(InstallError::NoCallAt(call_offset));
        }
        let disp = rel32(self.address() + call_offset, target)?;
        let disp_offset = call_offset + 1;
        let word = disp_offset & !7;
        let shift = (disp_offset - word) * 8;
        if shift > 32 {
            return Err(crate::asm::MemoryError::Misaligned(disp_offset).into());
        }
        let mask = 0xFFFF_FFFFu64 << shift;
        self.memory
            .patch_word(word, |old| (old & !mask) | (((disp as u32) as u64) << shift))?;
        Ok(())
    }

    /// Redirects new calls into this method to `newer`. Each entry word
    /// gets a `jmp rel32` to the matching entry of `newer` with one atomic
    /// store; the rest of the word is left as it was.
    pub fn forward_to(&self, newer: &Arc<InstalledMethod>) -> Result<(), InstallError> {
        if self.method.kind != CodeKind::Method {
            return Err(InstallError::NotAMethod(self.method.name.clone()));
        }
        for (entry, optimized) in [(JIT_ENTRY_OFFSET, false), (OPTIMIZED_ENTRY_OFFSET, true)] {
            let disp = rel32(self.address() + entry, newer.entry_address(optimized))?;
            let mut jump = [0u8; 8];
            jump[0] = JMP_OPCODE;
            jump[1..REL32_INSN_SIZE].copy_from_slice(&disp.to_le_bytes());
            let jump = u64::from_le_bytes(jump);
            let mask = (1u64 << (REL32_INSN_SIZE * 8)) - 1;
            self.memory.patch_word(entry, |old| (old & !mask) | jump)?;
        }
        info!(
            "forwarded {} at {:#x} to {:#x}",
            self.method.name,
            self.address(),
            newer.address()
        );
        *self.forwardee.lock() = Some(newer.clone());
        Ok(())
    }

    /// The version new calls are redirected to, if any.
    pub fn forwardee(&self) -> Option<Arc<InstalledMethod>> {
        self.forwardee.lock().clone()
    }
}

impl std::fmt::Debug for InstalledMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledMethod")
            .field("name", &self.method.name)
            .field("address", &format_args!("{:#x}", self.address()))
            .field("code_size", &self.code_size())
            .finish()
    }
}
