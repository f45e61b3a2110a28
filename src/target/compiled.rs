//! The compiled method: code plus every table the runtime consults after
//! compilation.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::exception_table::ExceptionTable;
use super::literals::Literals;
use super::refmap::ReferenceMaps;
use super::source_info::SourceInfo;
use super::stops::{Callee, StopKind, Stops};
use crate::runtime::{MethodId, RuntimeModel, TypeId};
use crate::scope::CodePos;

/// Entry used by callers that have not checked the receiver.
pub const JIT_ENTRY_OFFSET: usize = 0;
/// Entry used by callers that already dispatched to this exact method.
pub const OPTIMIZED_ENTRY_OFFSET: usize = 8;
/// First instruction of the method body.
pub const BODY_OFFSET: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    /// A compiled method with entry stubs in front of the body
    Method,
    /// A global stub; execution starts at offset 0
    GlobalStub,
}

/// Callees of a compiled method grouped by call kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallGraph {
    pub direct: BTreeSet<MethodId>,
    pub virtual_calls: BTreeSet<MethodId>,
    pub interface_calls: BTreeSet<MethodId>,
    pub inlined: BTreeSet<MethodId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledMethod {
    pub method: Option<MethodId>,
    pub name: String,
    pub kind: CodeKind,
    pub word_size: u32,
    /// Frame size in bytes, excluding the return address
    pub frame_size: u32,
    pub code: Vec<u8>,
    pub literals: Literals,
    pub stops: Stops,
    pub reference_maps: ReferenceMaps,
    pub exception_table: ExceptionTable,
    pub source_info: SourceInfo,
    /// Where exceptions raised in this method are dispatched from
    #[serde(default)]
    pub exception_handler_offset: Option<u32>,
}

impl CompiledMethod {
    pub fn frame_words(&self) -> u32 {
        self.frame_size / self.word_size
    }

    /// Code followed by the literal pools, ready to be copied anywhere.
    pub fn bundle(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.literals.layout.size);
        image.extend_from_slice(&self.code);
        self.literals.append_to(&mut image, self.word_size as usize);
        image
    }

    pub fn bundle_size(&self) -> usize {
        self.literals.layout.size.max(self.code.len())
    }

    /// An independent copy. The bundle is position independent, so nothing
    /// needs to be re-patched.
    pub fn duplicate(&self) -> CompiledMethod {
        self.clone()
    }

    pub fn entry_offset(&self, optimized: bool) -> usize {
        match (self.kind, optimized) {
            (CodeKind::GlobalStub, _) => 0,
            (CodeKind::Method, false) => JIT_ENTRY_OFFSET,
            (CodeKind::Method, true) => OPTIMIZED_ENTRY_OFFSET,
        }
    }

    /// Index of the last stop at or before `offset`.
    pub fn find_closest_stop(&self, offset: u32) -> Option<usize> {
        self.stops.find_closest(offset)
    }

    /// Handler for an exception of type `thrown` raised at `throw_offset`.
    /// In the top frame the offset is the start of the throwing
    /// instruction. In a caller frame it is a return address and is mapped
    /// back to the call that owns it. `None` means the exception propagates.
    pub fn throw_address_to_catch_address(
        &self,
        is_top_frame: bool,
        throw_offset: u32,
        thrown: TypeId,
        model: &RuntimeModel,
    ) -> Option<u32> {
        let throw_offset = if is_top_frame {
            throw_offset
        } else {
            let index = self.find_closest_stop(throw_offset.checked_sub(1)?)?;
            self.stops.get(index)?.offset
        };
        self.exception_table.lookup(throw_offset, thrown, model)
    }

    pub fn bytecode_location_at(&self, stop_index: usize) -> Option<Arc<CodePos>> {
        if stop_index >= self.stops.len() {
            return None;
        }
        self.source_info.decode(self.method, stop_index)
    }

    /// Source position of the code at `offset`. Return addresses point
    /// past their call, so unless the offset is an implicit exception
    /// point it is moved back into the instruction before searching.
    pub fn debug_info_at(&self, offset: u32, implicit_exception_point: bool) -> Option<Arc<CodePos>> {
        let offset = if implicit_exception_point {
            offset
        } else {
            offset.checked_sub(1)?
        };
        let index = self.find_closest_stop(offset)?;
        self.bytecode_location_at(index)
    }

    pub fn gather_calls(&self, model: &RuntimeModel) -> CallGraph {
        let mut calls = CallGraph::default();
        for stop in &self.stops {
            let Some(Callee::Method(method)) = stop.callee else {
                continue;
            };
            match stop.kind {
                StopKind::DirectCall => {
                    calls.direct.insert(method);
                }
                StopKind::IndirectCall => {
                    let is_interface = model
                        .method(method)
                        .and_then(|m| model.type_desc(m.holder))
                        .is_some_and(|t| t.is_interface);
                    if is_interface {
                        calls.interface_calls.insert(method);
                    } else {
                        calls.virtual_calls.insert(method);
                    }
                }
                StopKind::Safepoint => {}
            }
        }
        for index in 0..self.stops.len() {
            if let Some(pos) = self.bytecode_location_at(index) {
                calls.inlined.extend(pos.chain().map(|p| p.method));
            }
        }
        if let Some(root) = self.method {
            calls.inlined.remove(&root);
        }
        calls
    }

    pub fn reference_maps_to_string(&self) -> String {
        let mut out = String::new();
        for (index, stop) in self.stops.iter().enumerate() {
            out.push_str(&format!(
                "stop: index={index}, position={}, type={}\n",
                stop.offset, stop.kind
            ));
            out.push_str(&self.reference_maps.describe(index));
            out.push('\n');
        }
        out
    }

    pub fn exception_handlers_to_string(&self, model: &RuntimeModel) -> String {
        let mut out = String::new();
        for range in self.exception_table.iter() {
            let catch = range
                .catch_type
                .map_or("<any>", |t| model.type_name(t));
            out.push_str(&format!(
                "{} -> {} {catch}\n",
                range.protected_offset, range.handler_offset
            ));
        }
        out
    }

    /// Full human readable dump.
    pub fn trace_to_string(&self, model: &RuntimeModel) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "target method {} ({} bytes code, {} bytes data, frame {} bytes)\n",
            self.name,
            self.code.len(),
            self.bundle_size() - self.code.len(),
            self.frame_size
        ));
        out.push_str("code:\n");
        for (row, chunk) in self.code.chunks(16).enumerate() {
            out.push_str(&format!("  {:04x}:", row * 16));
            for byte in chunk {
                out.push_str(&format!(" {byte:02x}"));
            }
            out.push('\n');
        }

        out.push_str(&format!("stops: {}\n", self.stops.len()));
        for (index, stop) in self.stops.iter().enumerate() {
            out.push_str(&format!("  {index}: {:#x} {}", stop.encoded_position(), stop.kind));
            if let Some(callee) = &stop.callee {
                match callee {
                    Callee::Method(m) => {
                        out.push_str(&format!(" -> {}", model.qualified_name(*m)));
                    }
                    other => {
                        out.push_str(&format!(" -> {other}"));
                    }
                }
            }
            if let Some(pos) = self.bytecode_location_at(index) {
                out.push_str(&format!(" @ {pos}"));
            }
            out.push('\n');
        }

        out.push_str("reference maps:\n");
        out.push_str(&self.reference_maps_to_string());
        if !self.exception_table.is_empty() {
            out.push_str("exception handlers:\n");
            out.push_str(&self.exception_handlers_to_string(model));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MethodDesc, TypeDesc};
    use crate::target::refmap::RefMapLayout;
    use crate::target::stops::Stop;

    fn model() -> RuntimeModel {
        let mut model = RuntimeModel::default();
        let holder = model.add_type(TypeDesc {
            name: "Shape".to_string(),
            superclass: None,
            interfaces: vec![],
            is_interface: false,
            component: None,
            hub: 0x100,
            super_check_offset: 0,
            element_kind: None,
        });
        let iface = model.add_type(TypeDesc {
            name: "Drawable".to_string(),
            superclass: None,
            interfaces: vec![],
            is_interface: true,
            component: None,
            hub: 0x200,
            super_check_offset: 0,
            element_kind: None,
        });
        for (name, holder) in [("area", holder), ("draw", iface), ("scale", holder)] {
            model.add_method(MethodDesc {
                name: name.to_string(),
                holder,
                signature: "()V".to_string(),
                is_synchronized: false,
                is_static: false,
                is_interface_method: holder == iface,
                exception_handler_count: 0,
                profile: None,
            });
        }
        model
    }

    fn method_with(stops: Vec<Stop>) -> CompiledMethod {
        let count = stops.len();
        let mut maps = ReferenceMaps::new(RefMapLayout::new(4, 16));
        for _ in 0..count {
            maps.push(&crate::target::bitmap::ByteBitMap::new(4), None);
        }
        CompiledMethod {
            method: Some(MethodId(2)),
            name: "Shape.scale()V".to_string(),
            kind: CodeKind::Method,
            word_size: 8,
            frame_size: 32,
            code: vec![0x90; 64],
            literals: Literals::default(),
            stops: Stops::from_sorted(stops),
            reference_maps: maps,
            exception_table: ExceptionTable::new(),
            source_info: SourceInfo::Compact {
                bcis: (0..count as u16).collect(),
            },
            exception_handler_offset: None,
        }
    }

    #[test]
    fn test_gather_calls_classifies_callees() {
        let method = method_with(vec![
            Stop {
                offset: 20,
                kind: StopKind::DirectCall,
                callee: Some(Callee::Method(MethodId(0))),
            },
            Stop {
                offset: 30,
                kind: StopKind::IndirectCall,
                callee: Some(Callee::Method(MethodId(1))),
            },
            Stop {
                offset: 40,
                kind: StopKind::IndirectCall,
                callee: Some(Callee::Method(MethodId(0))),
            },
        ]);
        let calls = method.gather_calls(&model());
        assert_eq!(calls.direct, BTreeSet::from([MethodId(0)]));
        assert_eq!(calls.interface_calls, BTreeSet::from([MethodId(1)]));
        assert_eq!(calls.virtual_calls, BTreeSet::from([MethodId(0)]));
        assert!(calls.inlined.is_empty());
    }

    #[test]
    fn test_debug_info_uses_return_address() {
        let method = method_with(vec![
            Stop {
                offset: 20,
                kind: StopKind::DirectCall,
                callee: None,
            },
            Stop {
                offset: 30,
                kind: StopKind::Safepoint,
                callee: None,
            },
        ]);
        // return address of the call at 20 is 25
        assert_eq!(method.debug_info_at(25, false).unwrap().bci, 0);
        // an implicit exception at the safepoint itself
        assert_eq!(method.debug_info_at(30, true).unwrap().bci, 1);
        assert_eq!(method.debug_info_at(30, false).unwrap().bci, 0);
        assert!(method.debug_info_at(10, true).is_none());
    }

    #[test]
    fn test_reference_map_dump() {
        let method = method_with(vec![Stop {
            offset: 20,
            kind: StopKind::Safepoint,
            callee: None,
        }]);
        assert_eq!(
            method.reference_maps_to_string(),
            "stop: index=0, position=20, type=safepoint\n  frame map: []\n  register map: 0x0 0x0\n"
        );
    }

    #[test]
    fn test_caller_frame_lookup_maps_return_address_to_call() {
        let mut method = method_with(vec![
            Stop {
                offset: 20,
                kind: StopKind::DirectCall,
                callee: Some(Callee::Method(MethodId(0))),
            },
            Stop {
                offset: 30,
                kind: StopKind::Safepoint,
                callee: None,
            },
        ]);
        method.exception_table.push(20, 48, None);
        let model = model();

        assert_eq!(method.throw_address_to_catch_address(true, 20, TypeId(0), &model), Some(48));
        assert_eq!(method.throw_address_to_catch_address(false, 25, TypeId(0), &model), Some(48));
        assert_eq!(method.throw_address_to_catch_address(true, 25, TypeId(0), &model), None);
        // the safepoint at 30 has no handler
        assert_eq!(method.throw_address_to_catch_address(false, 31, TypeId(0), &model), None);
        assert_eq!(method.throw_address_to_catch_address(false, 10, TypeId(0), &model), None);
    }

    #[test]
    fn test_exception_handler_dump() {
        let mut method = method_with(vec![]);
        method.exception_table.push(20, 48, Some(TypeId(0)));
        method.exception_table.push(20, 56, None);
        assert_eq!(
            method.exception_handlers_to_string(&model()),
            "20 -> 48 Shape\n20 -> 56 <any>\n"
        );
    }
}
