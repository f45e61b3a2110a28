//! Literal pools.
//!
//! Constants that do not fit an instruction are loaded RIP-relative from
//! the data area placed after the code. Scalars and object references go
//! to separate pools so the collector only has to scan the reference pool:
//!
//! ```text
//! | code | pad to 16 | scalars (each padded to two words) | pad to word | references |
//! ```
//!
//! Every displacement is relative to the end of its instruction, so a copy
//! of the whole bundle needs no re-patching.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::lir::{Constant, ObjectRef};

pub const SCALAR_ALIGNMENT: usize = 16;

/// A RIP-relative operand waiting for the address of its constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPatch {
    /// Offset of the 32-bit displacement field
    pub disp_offset: u32,
    /// Offset the displacement is relative to
    pub instruction_end: u32,
    pub constant: Constant,
}

/// Offsets of the data areas inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BundleLayout {
    pub code_size: usize,
    pub scalar_offset: usize,
    pub reference_offset: usize,
    pub size: usize,
}

impl BundleLayout {
    pub fn new(code_size: usize, scalar_bytes: usize, references: usize, word: usize) -> Self {
        let scalar_offset = code_size.next_multiple_of(SCALAR_ALIGNMENT);
        let reference_offset = (scalar_offset + scalar_bytes).next_multiple_of(word);
        Self {
            code_size,
            scalar_offset,
            reference_offset,
            size: reference_offset + references * word,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Literals {
    pub scalars: Vec<u8>,
    pub references: Vec<ObjectRef>,
    pub layout: BundleLayout,
}

impl Literals {
    /// Lays out the constants of `patches` and writes each displacement
    /// into `code`. Equal constants share one pool entry.
    pub fn serialize(code: &mut [u8], patches: &[DataPatch], word: usize) -> Literals {
        let entry_size = 2 * word;
        let mut scalars: Vec<u8> = Vec::new();
        let mut references: Vec<ObjectRef> = Vec::new();
        let mut scalar_at: FxHashMap<(u64, usize), usize> = FxHashMap::default();
        let mut reference_at: FxHashMap<ObjectRef, usize> = FxHashMap::default();

        enum Slot {
            Scalar(usize),
            Reference(usize),
        }

        let slots: Vec<Slot> = patches
            .iter()
            .map(|patch| match patch.constant {
                Constant::Object(obj) => Slot::Reference(*reference_at.entry(obj).or_insert_with(|| {
                    references.push(obj);
                    references.len() - 1
                })),
                scalar => {
                    let size = scalar.kind().element_size(word);
                    let key = (scalar.bits(), size);
                    Slot::Scalar(*scalar_at.entry(key).or_insert_with(|| {
                        let at = scalars.len();
                        scalars.extend_from_slice(&scalar.bits().to_le_bytes()[..size]);
                        scalars.resize(at + size.next_multiple_of(entry_size), 0);
                        at
                    }))
                }
            })
            .collect();

        let layout = BundleLayout::new(code.len(), scalars.len(), references.len(), word);
        for (patch, slot) in patches.iter().zip(slots) {
            let target = match slot {
                Slot::Scalar(at) => layout.scalar_offset + at,
                Slot::Reference(index) => layout.reference_offset + index * word,
            };
            let disp = target as i64 - i64::from(patch.instruction_end);
            let at = patch.disp_offset as usize;
            code[at..at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
        }

        Literals {
            scalars,
            references,
            layout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.references.is_empty()
    }

    /// Appends the data areas to `code`, producing the bundle image.
    pub fn append_to(&self, code: &mut Vec<u8>, word: usize) {
        code.resize(self.layout.scalar_offset, 0);
        code.extend_from_slice(&self.scalars);
        code.resize(self.layout.reference_offset, 0);
        for obj in &self.references {
            code.extend_from_slice(&obj.0.to_le_bytes()[..word]);
        }
    }
}
