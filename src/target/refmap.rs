//! Reference maps: one fixed-size record per stop.
//!
//! A record is the frame bitmap (one bit per frame word, counted from the
//! stack pointer) followed by the register bitmap (one bit per register
//! encoding). Both are rounded up to whole bytes independently.


use serde::{Deserialize, Serialize};

use super::bitmap::ByteBitMap;

/// Shape of every record of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefMapLayout {
    pub frame_words: u32,
    pub register_count: u32,
}

impl RefMapLayout {
    pub fn new(frame_words: u32, register_count: u32) -> Self {
        Self {
            frame_words,
            register_count,
        }
    }

    pub fn frame_map_bytes(&self) -> usize {
        ByteBitMap::bytes_for(self.frame_words as usize)
    }

    pub fn register_map_bytes(&self) -> usize {
        ByteBitMap::bytes_for(self.register_count as usize)
    }

    pub fn record_size(&self) -> usize {
        self.frame_map_bytes() + self.register_map_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceMaps {
    layout: RefMapLayout,
    bytes: Vec<u8>,
}

impl ReferenceMaps {
    pub fn new(layout: RefMapLayout) -> Self {
        Self {
            layout,
            bytes: Vec::new(),
        }
    }

    pub fn layout(&self) -> RefMapLayout {
        self.layout
    }

    /// Appends a record and returns its index. Bits beyond the layout are
    /// dropped; a missing register map leaves the register bytes zero.
    pub fn push(&mut self, frame: &ByteBitMap, registers: Option<&ByteBitMap>) -> usize {
        let index = self.len();
        let frame_bytes = self.layout.frame_map_bytes();
        let reg_bytes = self.layout.register_map_bytes();

        let start = self.bytes.len();
        self.bytes.resize(start + self.layout.record_size(), 0);

        let src = frame.as_bytes();
        let n = src.len().min(frame_bytes);
        self.bytes[start..start + n].copy_from_slice(&src[..n]);

        if let Some(registers) = registers {
            let src = registers.as_bytes();
            let n = src.len().min(reg_bytes);
            let at = start + frame_bytes;
            self.bytes[at..at + n].copy_from_slice(&src[..n]);
        }
        index
    }

    pub fn len(&self) -> usize {
        match self.layout.record_size() {
            0 => 0,
            size => self.bytes.len() / size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn record(&self, index: usize) -> Option<&[u8]> {
        let size = self.layout.record_size();
        self.bytes.get(index * size..(index + 1) * size)
    }

    pub fn frame_map(&self, index: usize) -> Option<&[u8]> {
        self.record(index)
            .map(|r| &r[..self.layout.frame_map_bytes()])
    }

    pub fn register_map(&self, index: usize) -> Option<&[u8]> {
        self.record(index)
            .map(|r| &r[self.layout.frame_map_bytes()..])
    }

    pub fn is_frame_slot_ref(&self, index: usize, word: usize) -> bool {
        self.frame_map(index)
            .and_then(|m| m.get(word / 8))
            .is_some_and(|b| b & (1 << (word % 8)) != 0)
    }

    pub fn is_register_ref(&self, index: usize, bit: usize) -> bool {
        self.register_map(index)
            .and_then(|m| m.get(bit / 8))
            .is_some_and(|b| b & (1 << (bit % 8)) != 0)
    }

    /// Human readable dump of record `index`.
    pub fn describe(&self, index: usize) -> String {
        let mut out = String::new();
        let layout = self.layout;
        let frame: Vec<usize> = (0..layout.frame_words as usize)
            .filter(|&w| self.is_frame_slot_ref(index, w))
            .collect();
        out.push_str(&format!("  frame map: {frame:?}"));
        if layout.register_count > 0 {
            out.push_str("\n  register map:");
            if let Some(map) = self.register_map(index) {
                for byte in map {
                    out.push_str(&format!(" {byte:#x}"));
                }
            }
            let regs: Vec<String> = (0..layout.register_count as usize)
                .filter(|&r| self.is_register_ref(index, r))
                .map(|r| format!("reg{r}"))
                .collect();
            if !regs.is_empty() {
                out.push_str(&format!(" {{ {} }}", regs.join(" ")));
            }
        }
        out
    }
}
