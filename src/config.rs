//! Compiler configuration types.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::ObjectLayout;

/// Instruction set the emitter generates code for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    /// x86-64, 8-byte words, 16 general purpose registers
    #[default]
    Amd64,
    /// 32-bit x86, 4-byte words, longs in register pairs
    Ia32,
}

impl Arch {
    pub fn word_size(self) -> u32 {
        match self {
            Arch::Amd64 => 8,
            Arch::Ia32 => 4,
        }
    }

    /// Registers that can hold references and get a bit in register maps.
    pub fn register_count(self) -> u32 {
        match self {
            Arch::Amd64 => 16,
            Arch::Ia32 => 8,
        }
    }

    pub fn is_64bit(self) -> bool {
        self == Arch::Amd64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub arch: Arch,
    /// Windows calling convention for runtime calls
    pub windows: bool,
    /// Whether the processor supports `cmov`
    pub supports_cmov: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Amd64,
            windows: false,
            supports_cmov: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Options consulted while emitting code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub target: TargetConfig,
    pub layout: ObjectLayout,
    /// Inline compare-and-swap locking before falling back to the runtime
    pub use_fast_locking: bool,
    /// Unlock synchronized methods on the exception path
    pub generate_synchronization_code: bool,
    /// Extra runtime checks of compiler assumptions
    pub generate_assertion_code: bool,
    pub verify_oops: bool,
    /// Compare against the display slot before calling the subtype search
    pub fast_path_type_check: bool,
    pub profile_checkcasts: bool,
    /// Record receiver types at virtual call sites, not just the count
    pub profile_virtual_calls: bool,
    /// Skip the receiver search when the holder of a virtual call is known
    pub optimize_virtual_call_profiling: bool,
    /// Receiver rows per type profile cell
    pub profile_type_width: usize,
    /// Exception handlers of inlined methods are compiled into the caller
    pub opt_inline_except: bool,
    /// Pad call sites so their displacement can be patched atomically
    pub align_call_sites: bool,
    /// Methods whose qualified name contains this are dumped after compilation
    pub trace_target_methods: Option<String>,
    /// Panic instead of returning internal errors
    pub abort_on_internal_error: bool,
    /// Largest bundle a single method may produce
    pub max_code_size: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            layout: ObjectLayout::default(),
            use_fast_locking: true,
            generate_synchronization_code: true,
            generate_assertion_code: false,
            verify_oops: false,
            fast_path_type_check: true,
            profile_checkcasts: false,
            profile_virtual_calls: true,
            optimize_virtual_call_profiling: true,
            profile_type_width: 2,
            opt_inline_except: true,
            align_call_sites: true,
            trace_target_methods: None,
            abort_on_internal_error: false,
            max_code_size: 1 << 20,
        }
    }
}

impl CompilerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn word_size(&self) -> u32 {
        self.target.arch.word_size()
    }

    /// Whether dumps should be produced for `qualified_name`.
    pub fn traces(&self, qualified_name: &str) -> bool {
        self.trace_target_methods
            .as_deref()
            .is_some_and(|filter| qualified_name.contains(filter))
    }
}
