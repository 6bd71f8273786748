//! jetsam code generation: typed Wasm IR, peephole optimizer, and binary
//! assembler.
//!
//! ```text
//! annotated tree → [generator] → IR module → [peephole] → [assembler] → .wasm
//! ```
//!
//! The stages are exposed individually so the pipeline crate can time
//! them; [`compile_module`] chains all three for direct use.

pub mod assembler;
pub mod builtins;
mod error;
pub mod generator;
pub mod ir;
pub mod peephole;
pub mod strings;
pub mod types;
pub mod wasm;

pub use error::{CodegenError, CodegenResult};
pub use generator::generate;

use jetsam_analyzer::Analysis;
use jetsam_types::estree::Program;
use jetsam_types::CompileOptions;

/// Lower, optimize, and assemble a program in one step.
pub fn compile_module(
    program: &Program,
    analysis: Option<&Analysis>,
    opts: &CompileOptions,
    module_name: &str,
) -> CodegenResult<Vec<u8>> {
    let mut module = generator::generate(program, analysis, opts, module_name)?;
    peephole::optimize(&mut module, opts);
    assembler::assemble(&mut module)
}
