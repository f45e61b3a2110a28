//! Collects stops, handlers and data patches while code is emitted and
//! freezes them into a [`CompiledMethod`].

use std::sync::Arc;

use super::bitmap::ByteBitMap;
use super::compiled::{CodeKind, CompiledMethod};
use super::exception_table::ExceptionTable;
use super::literals::{DataPatch, Literals};
use super::refmap::{RefMapLayout, ReferenceMaps};
use super::source_info::SourceInfo;
use super::stops::{Callee, Stop, StopKind, Stops};
use crate::asm::{CodeBuffer, Label};
use crate::error::{EmitError, EmitResult};
use crate::lir::Constant;
use crate::runtime::{MethodId, TypeId};
use crate::scope::CodePos;

#[derive(Debug, Clone)]
pub struct StopRecord {
    pub offset: u32,
    pub kind: StopKind,
    pub callee: Option<Callee>,
    pub frame_map: ByteBitMap,
    pub register_map: Option<ByteBitMap>,
    pub pos: Option<Arc<CodePos>>,
}

#[derive(Debug, Clone, Copy)]
struct PendingHandler {
    protected_offset: u32,
    handler: Label,
    catch_type: Option<TypeId>,
}

#[derive(Debug)]
pub struct TargetMethodBuilder {
    method: Option<MethodId>,
    name: String,
    kind: CodeKind,
    word_size: u32,
    layout: RefMapLayout,
    frame_size: u32,
    stops: Vec<StopRecord>,
    handlers: Vec<PendingHandler>,
    patches: Vec<DataPatch>,
    exception_handler: Option<Label>,
}

impl TargetMethodBuilder {
    pub fn new(
        method: Option<MethodId>,
        name: impl Into<String>,
        kind: CodeKind,
        word_size: u32,
        frame_size: u32,
        register_count: u32,
    ) -> Self {
        Self {
            method,
            name: name.into(),
            kind,
            word_size,
            layout: RefMapLayout::new(frame_size / word_size, register_count),
            frame_size,
            stops: Vec::new(),
            handlers: Vec::new(),
            patches: Vec::new(),
            exception_handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> RefMapLayout {
        self.layout
    }

    /// An empty frame map sized for this method.
    pub fn new_frame_map(&self) -> ByteBitMap {
        ByteBitMap::new(self.layout.frame_words as usize)
    }

    pub fn new_register_map(&self) -> ByteBitMap {
        ByteBitMap::new(self.layout.register_count as usize)
    }

    pub fn record_direct_call(
        &mut self,
        offset: usize,
        callee: Callee,
        frame_map: ByteBitMap,
        pos: Option<Arc<CodePos>>,
    ) {
        self.push_stop(offset, StopKind::DirectCall, Some(callee), frame_map, None, pos);
    }

    pub fn record_indirect_call(
        &mut self,
        offset: usize,
        callee: Option<Callee>,
        frame_map: ByteBitMap,
        pos: Option<Arc<CodePos>>,
    ) {
        self.push_stop(offset, StopKind::IndirectCall, callee, frame_map, None, pos);
    }

    pub fn record_safepoint(
        &mut self,
        offset: usize,
        frame_map: ByteBitMap,
        register_map: ByteBitMap,
        pos: Option<Arc<CodePos>>,
    ) {
        self.push_stop(offset, StopKind::Safepoint, None, frame_map, Some(register_map), pos);
    }

    fn push_stop(
        &mut self,
        offset: usize,
        kind: StopKind,
        callee: Option<Callee>,
        frame_map: ByteBitMap,
        register_map: Option<ByteBitMap>,
        pos: Option<Arc<CodePos>>,
    ) {
        self.stops.push(StopRecord {
            offset: offset as u32,
            kind,
            callee,
            frame_map,
            register_map,
            pos,
        });
    }

    pub fn record_exception_handler(
        &mut self,
        protected_offset: usize,
        handler: Label,
        catch_type: Option<TypeId>,
    ) {
        self.handlers.push(PendingHandler {
            protected_offset: protected_offset as u32,
            handler,
            catch_type,
        });
    }

    pub fn record_data_patch(&mut self, disp_offset: usize, instruction_end: usize, constant: Constant) {
        self.patches.push(DataPatch {
            disp_offset: disp_offset as u32,
            instruction_end: instruction_end as u32,
            constant,
        });
    }

    /// Marks the label of the exception handler entry.
    pub fn set_exception_handler_entry(&mut self, entry: Label) {
        self.exception_handler = Some(entry);
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    /// Resolves labels, lays out literals and encodes every table.
    pub fn finish(mut self, mut buf: CodeBuffer) -> EmitResult<CompiledMethod> {
        buf.resolve_fixups()?;

        let mut exception_table = ExceptionTable::new();
        for pending in &self.handlers {
            let handler = buf.label_offset(pending.handler).ok_or_else(|| {
                EmitError::ShouldNotReachHere(format!(
                    "exception handler for offset {} never bound",
                    pending.protected_offset
                ))
            })?;
            exception_table.push(pending.protected_offset, handler as u32, pending.catch_type);
        }

        let exception_handler_offset = self
            .exception_handler
            .and_then(|entry| buf.label_offset(entry))
            .map(|offset| offset as u32);

        let mut code = buf.into_code();
        let literals = Literals::serialize(&mut code, &self.patches, self.word_size as usize);

        // stable, so stops at one offset keep their recording order
        self.stops.sort_by_key(|s| s.offset);

        let mut reference_maps = ReferenceMaps::new(self.layout);
        let mut positions = Vec::with_capacity(self.stops.len());
        let mut stops = Vec::with_capacity(self.stops.len());
        for record in self.stops {
            reference_maps.push(&record.frame_map, record.register_map.as_ref());
            positions.push(record.pos);
            stops.push(Stop {
                offset: record.offset,
                kind: record.kind,
                callee: record.callee,
            });
        }

        Ok(CompiledMethod {
            method: self.method,
            name: self.name,
            kind: self.kind,
            word_size: self.word_size,
            frame_size: self.frame_size,
            code,
            literals,
            stops: Stops::from_sorted(stops),
            reference_maps,
            exception_table,
            source_info: SourceInfo::encode(&positions),
            exception_handler_offset,
        })
    }
}
