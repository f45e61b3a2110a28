//! Code buffer for building machine code.
//!
//! Bytes are appended in order; branch targets are expressed as [`Label`]s
//! whose displacements are patched once the label is bound.

use thiserror::Error;

/// A branch target inside a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Width of a label reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSize {
    /// 8-bit displacement relative to the end of the field
    Rel8,
    /// 32-bit displacement relative to the end of the field
    Rel32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixupError {
    #[error("label {0} referenced but never bound")]
    UnboundLabel(usize),
    #[error("displacement {disp} to label {label} does not fit in {size:?}")]
    OutOfRange {
        label: usize,
        disp: i64,
        size: ReferenceSize,
    },
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: usize,
    label: Label,
    size: ReferenceSize,
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Bound offset per label, `None` while unbound
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Offset at which the next byte will be emitted.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Create a new, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.index()].is_none(), "label bound twice");
        self.labels[label.index()] = Some(self.code.len());
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.index()).copied().flatten()
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.label_offset(label).is_some()
    }

    /// Emit a displacement field referring to `label`.
    ///
    /// A zero placeholder is written and patched by
    /// [`CodeBuffer::resolve_fixups`].
    pub fn emit_label_ref(&mut self, label: Label, size: ReferenceSize) {
        let at = self.code.len();
        match size {
            ReferenceSize::Rel8 => self.emit_u8(0),
            ReferenceSize::Rel32 => self.emit_u32(0),
        }
        self.fixups.push(Fixup { at, label, size });
    }

    /// Patch all label references.
    pub fn resolve_fixups(&mut self) -> Result<(), FixupError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self
                .label_offset(fixup.label)
                .ok_or(FixupError::UnboundLabel(fixup.label.index()))?;
            match fixup.size {
                ReferenceSize::Rel8 => {
                    let disp = target as i64 - (fixup.at as i64 + 1);
                    if disp < i8::MIN as i64 || disp > i8::MAX as i64 {
                        return Err(FixupError::OutOfRange {
                            label: fixup.label.index(),
                            disp,
                            size: fixup.size,
                        });
                    }
                    self.code[fixup.at] = disp as i8 as u8;
                }
                ReferenceSize::Rel32 => {
                    let disp = target as i64 - (fixup.at as i64 + 4);
                    if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
                        return Err(FixupError::OutOfRange {
                            label: fixup.label.index(),
                            disp,
                            size: fixup.size,
                        });
                    }
                    self.patch_u32(fixup.at, disp as i32 as u32);
                }
            }
        }
        Ok(())
    }

    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    /// Label references must already be resolved.
    pub fn into_code(self) -> Vec<u8> {
        debug_assert!(self.fixups.is_empty(), "unresolved label references");
        self.code
    }

    /// Pad with `fill` until the position is a multiple of `alignment`.
    pub fn align_with(&mut self, alignment: usize, fill: u8) {
        while self.code.len() % alignment != 0 {
            self.emit_u8(fill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_forward_rel32() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.emit_u8(0xE9);
        buf.emit_label_ref(target, ReferenceSize::Rel32);
        buf.emit_u8(0x90);
        buf.bind(target);
        buf.resolve_fixups().unwrap();

        assert_eq!(buf.code(), &[0xE9, 0x01, 0x00, 0x00, 0x00, 0x90]);
    }

    #[test]
    fn test_backward_rel8() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        buf.bind(top);
        buf.emit_u8(0x90);
        buf.emit_u8(0xEB);
        buf.emit_label_ref(top, ReferenceSize::Rel8);
        buf.resolve_fixups().unwrap();

        // jmp -3 back to the nop
        assert_eq!(buf.code(), &[0x90, 0xEB, 0xFD]);
    }

    #[test]
    fn test_unbound_label_is_error() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.emit_label_ref(label, ReferenceSize::Rel32);
        assert_eq!(buf.resolve_fixups(), Err(FixupError::UnboundLabel(0)));
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.align_with(4, 0x90);

        assert_eq!(buf.len(), 4);
    }
}
