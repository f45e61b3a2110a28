//! Runtime metadata of compiled code: stops, reference maps, exception
//! tables, source positions and literal pools.

pub mod bitmap;
pub mod builder;
pub mod compiled;
pub mod exception_table;
pub mod literals;
pub mod refmap;
pub mod source_info;
pub mod stops;

pub use bitmap::ByteBitMap;
pub use builder::{StopRecord, TargetMethodBuilder};
pub use compiled::{
    BODY_OFFSET, CallGraph, CodeKind, CompiledMethod, JIT_ENTRY_OFFSET, OPTIMIZED_ENTRY_OFFSET,
};
pub use exception_table::{ExceptionRange, ExceptionTable};
pub use literals::{BundleLayout, DataPatch, Literals};
pub use refmap::{RefMapLayout, ReferenceMaps};
pub use source_info::SourceInfo;
pub use stops::{Callee, NATIVE_FUNCTION_CALL, Stop, StopKind, Stops};
