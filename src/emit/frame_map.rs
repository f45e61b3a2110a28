//! Frame layout of a compiled method.
//!
//! ```text
//! rsp + frame_size       return address
//!                        monitors, two words each (displaced header, object)
//!                        spill slots
//! rsp + 0                reserved outgoing argument words
//! ```
//!
//! Frame words are numbered from the stack pointer; word `i` of the frame
//! is bit `i` of a stop's frame map.

use crate::asm::{Address, Reg};
use crate::config::Arch;

/// Outgoing words reserved for stub and runtime call parameters.
pub const RESERVED_ARGUMENT_WORDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMap {
    word: u32,
    spill_slots: u32,
    monitors: u32,
    frame_size: u32,
}

impl FrameMap {
    pub fn new(arch: Arch, spill_slots: u32, monitors: u32) -> Self {
        let word = arch.word_size();
        let raw = (RESERVED_ARGUMENT_WORDS + spill_slots + 2 * monitors) * word;
        // with the return address pushed the stack stays 16-byte aligned
        let frame_size = (raw + word).next_multiple_of(16) - word;
        Self {
            word,
            spill_slots,
            monitors,
            frame_size,
        }
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn frame_words(&self) -> u32 {
        self.frame_size / self.word
    }

    pub fn spill_slots(&self) -> u32 {
        self.spill_slots
    }

    pub fn monitors(&self) -> u32 {
        self.monitors
    }

    /// Frame word holding spill slot `index`.
    pub fn spill_word(&self, index: u32) -> u32 {
        RESERVED_ARGUMENT_WORDS + index
    }

    pub fn spill_address(&self, index: u32) -> Address {
        self.word_address(self.spill_word(index))
    }

    fn monitor_base_word(&self) -> u32 {
        RESERVED_ARGUMENT_WORDS + self.spill_slots
    }

    /// Frame word holding the displaced header of monitor `index`.
    pub fn monitor_lock_word(&self, index: u32) -> u32 {
        self.monitor_base_word() + 2 * index
    }

    /// Frame word holding the locked object of monitor `index`.
    pub fn monitor_object_word(&self, index: u32) -> u32 {
        self.monitor_lock_word(index) + 1
    }

    pub fn monitor_lock_address(&self, index: u32) -> Address {
        self.word_address(self.monitor_lock_word(index))
    }

    pub fn monitor_object_address(&self, index: u32) -> Address {
        self.word_address(self.monitor_object_word(index))
    }

    /// Outgoing parameter `index` of a stub or runtime call.
    pub fn argument_address(&self, index: u32) -> Address {
        debug_assert!(index < RESERVED_ARGUMENT_WORDS);
        self.word_address(index)
    }

    fn word_address(&self, word: u32) -> Address {
        Address::new(Reg::Rsp, (word * self.word) as i32)
    }
}
