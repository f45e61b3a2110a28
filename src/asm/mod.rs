//! Machine code assembly: the byte buffer, the x86 encoder and executable
//! memory for installed code.

pub mod codebuf;
pub mod memory;
pub mod x86_64;

pub use codebuf::{CodeBuffer, FixupError, Label, ReferenceSize};
pub use memory::{ExecutableMemory, MemoryError};
pub use x86_64::{Address, AluOp, Cond, Fp, Reg, Scale, ShiftOp, SseOp, Width, X86_64Assembler, Xmm};
