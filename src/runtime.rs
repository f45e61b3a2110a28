//! The runtime model the backend compiles against.
//!
//! Types, methods, object layout and runtime entry points are owned by the
//! virtual machine; the emitter only reads them. Everything here is plain
//! data so a whole compilation request can be serialized.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::lir::Kind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(pub u32);

/// A loaded class, interface or array type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDesc {
    pub name: String,
    #[serde(default)]
    pub superclass: Option<TypeId>,
    #[serde(default)]
    pub interfaces: Vec<TypeId>,
    #[serde(default)]
    pub is_interface: bool,
    /// Element type for array types
    #[serde(default)]
    pub component: Option<TypeId>,
    /// Address of the type's hub, the word stored in every instance header
    pub hub: u64,
    /// Offset inside a hub where the display entry for this type lives
    #[serde(default)]
    pub super_check_offset: i32,
    /// Element kind for array types
    #[serde(default)]
    pub element_kind: Option<Kind>,
}

/// Profile cells of one bytecode in a method's data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCell {
    pub bci: i32,
    /// Byte offset of the cell from the start of the data block
    pub offset: i32,
}

/// Address and cell table of a method's profile block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodData {
    pub address: u64,
    pub cells: Vec<ProfileCell>,
}

impl MethodData {
    pub fn cell(&self, bci: i32) -> Option<i32> {
        self.cells.iter().find(|c| c.bci == bci).map(|c| c.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDesc {
    pub name: String,
    pub holder: TypeId,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub is_synchronized: bool,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_interface_method: bool,
    #[serde(default)]
    pub exception_handler_count: usize,
    #[serde(default)]
    pub profile: Option<MethodData>,
}

impl MethodDesc {
    pub fn has_exception_handlers(&self) -> bool {
        self.exception_handler_count > 0
    }
}

/// Field offsets the runtime fixes for every object and hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectLayout {
    pub hub_offset: i32,
    pub lock_word_offset: i32,
    pub array_length_offset: i32,
    pub array_base_offset: i32,
    pub vtable_start_offset: i32,
    pub vtable_entry_size: i32,
    /// The display slot that forces a full subtype search
    pub secondary_super_cache_offset: i32,
    /// Offset of the element hub inside an array hub
    pub element_hub_offset: i32,
    /// Byte offset, from a profile cell, of the header flag byte
    pub profile_flags_offset: i32,
    pub profile_null_seen_flag: u8,
    pub profile_counter_offset: i32,
    /// First receiver row of a type profile cell; each row is a hub word
    /// followed by a count word
    pub profile_receiver_offset: i32,
    /// Offset inside a hub of the 32-bit copy of its super check offset
    pub super_check_offset_offset: i32,
}

impl Default for ObjectLayout {
    fn default() -> Self {
        Self {
            hub_offset: 0,
            lock_word_offset: 8,
            array_length_offset: 16,
            array_base_offset: 24,
            vtable_start_offset: 64,
            vtable_entry_size: 8,
            secondary_super_cache_offset: 32,
            element_hub_offset: 40,
            profile_flags_offset: 0,
            profile_null_seen_flag: 0x01,
            profile_counter_offset: 8,
            profile_receiver_offset: 16,
            super_check_offset_offset: 48,
        }
    }
}

impl ObjectLayout {
    pub fn receiver_offset(&self, cell: i32, row: usize, word: i32) -> i32 {
        cell + self.profile_receiver_offset + (row as i32) * 2 * word
    }

    pub fn receiver_count_offset(&self, cell: i32, row: usize, word: i32) -> i32 {
        self.receiver_offset(cell, row, word) + word
    }
}

/// Entry points into the runtime that compiled code calls directly or
/// through a global stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeCall {
    UnwindException,
    HandleException,
    ThrowDivByZero,
    ThrowClassCastException,
    ThrowArrayStoreException,
    SlowSubtypeCheck,
    MonitorEnter,
    MonitorExit,
    ArrayCopy,
    SlowArrayCopy,
    PrimitiveArrayCopy,
    OopArrayCopy,
    ArithmeticFrem,
    ArithmeticDrem,
    ArithmeticLdiv,
    ArithmeticLrem,
    ResolveStaticCall,
    ResolveVirtualCall,
}

impl RuntimeCall {
    pub const ALL: [RuntimeCall; 18] = [
        RuntimeCall::UnwindException,
        RuntimeCall::HandleException,
        RuntimeCall::ThrowDivByZero,
        RuntimeCall::ThrowClassCastException,
        RuntimeCall::ThrowArrayStoreException,
        RuntimeCall::SlowSubtypeCheck,
        RuntimeCall::MonitorEnter,
        RuntimeCall::MonitorExit,
        RuntimeCall::ArrayCopy,
        RuntimeCall::SlowArrayCopy,
        RuntimeCall::PrimitiveArrayCopy,
        RuntimeCall::OopArrayCopy,
        RuntimeCall::ArithmeticFrem,
        RuntimeCall::ArithmeticDrem,
        RuntimeCall::ArithmeticLdiv,
        RuntimeCall::ArithmeticLrem,
        RuntimeCall::ResolveStaticCall,
        RuntimeCall::ResolveVirtualCall,
    ];

    /// Number of word arguments the routine takes from the outgoing
    /// argument area.
    pub fn arguments(self) -> usize {
        match self {
            RuntimeCall::SlowSubtypeCheck | RuntimeCall::MonitorEnter => 2,
            RuntimeCall::MonitorExit
            | RuntimeCall::ThrowClassCastException
            | RuntimeCall::ThrowArrayStoreException => 1,
            RuntimeCall::SlowArrayCopy | RuntimeCall::ArrayCopy => 5,
            RuntimeCall::PrimitiveArrayCopy | RuntimeCall::OopArrayCopy => 3,
            RuntimeCall::ArithmeticLdiv | RuntimeCall::ArithmeticLrem => 4,
            _ => 0,
        }
    }

    /// Whether the routine returns a word result.
    pub fn has_result(self) -> bool {
        matches!(
            self,
            RuntimeCall::SlowSubtypeCheck
                | RuntimeCall::ArrayCopy
                | RuntimeCall::ArithmeticLdiv
                | RuntimeCall::ArithmeticLrem
        )
    }

    /// Routines that never return to the call site.
    pub fn is_throwing(self) -> bool {
        matches!(
            self,
            RuntimeCall::UnwindException
                | RuntimeCall::ThrowDivByZero
                | RuntimeCall::ThrowClassCastException
                | RuntimeCall::ThrowArrayStoreException
        )
    }
}

impl fmt::Display for RuntimeCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Resolved addresses of runtime routines, supplied when code is installed.
#[derive(Debug, Clone, Default)]
pub struct RuntimeLinkage {
    entries: FxHashMap<RuntimeCall, usize>,
    natives: FxHashMap<String, usize>,
}

impl RuntimeLinkage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, call: RuntimeCall, address: usize) -> &mut Self {
        self.entries.insert(call, address);
        self
    }

    pub fn bind_native(&mut self, symbol: impl Into<String>, address: usize) -> &mut Self {
        self.natives.insert(symbol.into(), address);
        self
    }

    pub fn address(&self, call: RuntimeCall) -> Option<usize> {
        self.entries.get(&call).copied()
    }

    pub fn native(&self, symbol: &str) -> Option<usize> {
        self.natives.get(symbol).copied()
    }
}

/// All types and methods a compilation may refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeModel {
    #[serde(default)]
    pub types: Vec<TypeDesc>,
    #[serde(default)]
    pub methods: Vec<MethodDesc>,
    /// Address of the page read by safepoint polls
    #[serde(default)]
    pub polling_page: u64,
    /// Whether locked instructions are needed for multiprocessor safety
    #[serde(default = "default_true")]
    pub is_mp: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeModel {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            methods: Vec::new(),
            polling_page: 0,
            is_mp: true,
        }
    }
}

impl RuntimeModel {
    pub fn type_desc(&self, id: TypeId) -> Option<&TypeDesc> {
        self.types.get(id.0 as usize)
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodDesc> {
        self.methods.get(id.0 as usize)
    }

    pub fn add_type(&mut self, desc: TypeDesc) -> TypeId {
        self.types.push(desc);
        TypeId((self.types.len() - 1) as u32)
    }

    pub fn add_method(&mut self, desc: MethodDesc) -> MethodId {
        self.methods.push(desc);
        MethodId((self.methods.len() - 1) as u32)
    }

    /// `Holder.name` for diagnostics.
    pub fn qualified_name(&self, id: MethodId) -> String {
        match self.method(id) {
            Some(m) => {
                let holder = self
                    .type_desc(m.holder)
                    .map(|t| t.name.as_str())
                    .unwrap_or("?");
                format!("{holder}.{}{}", m.name, m.signature)
            }
            None => format!("<method {}>", id.0),
        }
    }

    pub fn type_name(&self, id: TypeId) -> &str {
        self.type_desc(id).map(|t| t.name.as_str()).unwrap_or("?")
    }

    /// Whether a value of type `sub` can be stored in a `sup` variable.
    pub fn is_assignable_from(&self, sup: TypeId, sub: TypeId) -> bool {
        if sup == sub {
            return true;
        }
        let Some(sub_desc) = self.type_desc(sub) else {
            return false;
        };
        if let (Some(sup_elem), Some(sub_elem)) = (
            self.type_desc(sup).and_then(|t| t.component),
            sub_desc.component,
        ) {
            return self.is_assignable_from(sup_elem, sub_elem);
        }
        if sub_desc
            .interfaces
            .iter()
            .any(|&i| self.is_assignable_from(sup, i))
        {
            return true;
        }
        match sub_desc.superclass {
            Some(parent) => self.is_assignable_from(sup, parent),
            None => false,
        }
    }

    /// Finds the type whose hub is at `hub`.
    pub fn type_by_hub(&self, hub: u64) -> Option<TypeId> {
        self.types
            .iter()
            .position(|t| t.hub == hub)
            .map(|i| TypeId(i as u32))
    }
}
