//! Installed code: linking into executable memory, forwarding, the code
//! cache and stack walking.

pub mod cache;
pub mod installed;
pub mod stack;

pub use cache::CodeCache;
pub use installed::InstalledMethod;
pub use stack::{
    CalleeKind, Frame, FrameCursor, ReferenceMapPreparer, StackMemory, StackSnapshot, StackWalker,
};
