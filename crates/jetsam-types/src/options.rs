use serde::{Deserialize, Serialize};

/// The Wasm scalar type used for the value channel of every runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// 64-bit float (default). Full numeric semantics of the source language.
    F64,
    /// 32-bit integer. Smaller modules; fractional arithmetic truncates.
    I32,
}

/// Compilation options.
///
/// Passed explicitly through the pipeline; there is no ambient process-wide
/// configuration, so concurrent compiles with different options are safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Primary scalar of the module.
    pub value_type: ValueKind,
    /// Rounding granularity (bytes) of the internal region allocator.
    pub page_size: u32,
    /// Run the semantic analyzer. When off, every variable lowers to a
    /// module global instead of a local or closure cell.
    pub closures: bool,
    /// Peephole optimizer iterations (0 disables the optimizer).
    pub opt_passes: u32,
    /// Rewrite `call; return` into `return_call`. Requires host support.
    pub tail_call: bool,
    /// Linear-memory pages reserved for the runtime heap beyond static data.
    pub heap_pages: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            value_type: ValueKind::F64,
            page_size: 65536,
            closures: true,
            opt_passes: 2,
            tail_call: false,
            heap_pages: 16,
        }
    }
}
