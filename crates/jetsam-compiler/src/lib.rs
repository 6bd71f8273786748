//! jetsam compiler: orchestrates the full compilation pipeline.
//!
//! ```text
//! ESTree JSON → parse → SEMANTIC ANALYZER → CODE GENERATOR → PEEPHOLE → ASSEMBLER → .wasm
//! ```
//!
//! The pipeline is synchronous and single-threaded; each compile carries
//! its own counter state, so concurrent compiles in one process are fine
//! as long as each gets its own [`CompileOptions`].
//!
//! Errors at any stage abort immediately — no partial artifact is
//! returned. On success the caller receives the binary plus a per-stage
//! timing record and content hashes.

use jetsam_codegen::CodegenError;
use jetsam_types::estree::Program;
use jetsam_types::{CompileError, CompileOptions, ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Instant;

/// Compiler version (matches the Cargo package version).
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Observability ─────────────────────────────────────────────────────────────

/// Wall-clock milliseconds per pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub parse_ms: f64,
    pub analyze_ms: f64,
    pub generate_ms: f64,
    pub optimize_ms: f64,
    pub assemble_ms: f64,
}

/// The result of a successful compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOutput {
    /// The Wasm binary.
    pub wasm: Vec<u8>,
    /// Per-stage timings.
    pub timings: StageTimings,
    /// SHA-256 of the input text (hex).
    pub source_hash: String,
    /// SHA-256 of the binary (hex).
    pub wasm_hash: String,
    /// Export names, `m` first.
    pub exports: Vec<String>,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Compile an ESTree JSON document to a Wasm binary.
///
/// `file` is used for diagnostics and as the module name in the custom
/// name section.
pub fn compile(
    source_json: &str,
    file: &str,
    opts: &CompileOptions,
) -> Result<CompileOutput, CompileError> {
    let source_hash = sha256_hex(source_json.as_bytes());

    let start = Instant::now();
    let mut program = Program::from_json(source_json).map_err(|e| e.with_file(file))?;
    let parse_ms = ms_since(start);

    let (output, timings) = compile_tree(&mut program, file, opts)?;
    Ok(CompileOutput {
        source_hash,
        timings: StageTimings {
            parse_ms,
            ..timings
        },
        ..output
    })
}

/// Compile an already-parsed program (any ESTree-honoring parser may have
/// produced it). The tree is annotated in place by the analyzer.
pub fn compile_program(
    program: &mut Program,
    file: &str,
    opts: &CompileOptions,
) -> Result<CompileOutput, CompileError> {
    let (output, timings) = compile_tree(program, file, opts)?;
    Ok(CompileOutput { timings, ..output })
}

fn compile_tree(
    program: &mut Program,
    file: &str,
    opts: &CompileOptions,
) -> Result<(CompileOutput, StageTimings), CompileError> {
    let mut timings = StageTimings::default();

    // 1. Semantic analysis (the closures option gates it; without it,
    //    every variable lowers to a module global).
    let start = Instant::now();
    let analysis = if opts.closures {
        Some(jetsam_analyzer::analyze(program).map_err(|e| e.with_file(file))?)
    } else {
        None
    };
    timings.analyze_ms = ms_since(start);

    // 2. IR generation.
    let start = Instant::now();
    let mut module =
        jetsam_codegen::generate(program, analysis.as_ref(), opts, file)
            .map_err(|e| codegen_to_compile_error(e, file))?;
    timings.generate_ms = ms_since(start);

    let exports: Vec<String> = module
        .funcs
        .iter()
        .filter_map(|f| f.export.clone())
        .collect();

    // 3. Peephole optimization.
    let start = Instant::now();
    jetsam_codegen::peephole::optimize(&mut module, opts);
    timings.optimize_ms = ms_since(start);

    // 4. Assembly.
    let start = Instant::now();
    let wasm = jetsam_codegen::assembler::assemble(&mut module)
        .map_err(|e| codegen_to_compile_error(e, file))?;
    timings.assemble_ms = ms_since(start);

    log::debug!(
        "compiled {file}: {} bytes in {:.2}ms",
        wasm.len(),
        timings.analyze_ms + timings.generate_ms + timings.optimize_ms + timings.assemble_ms
    );

    let wasm_hash = sha256_hex(&wasm);
    Ok((
        CompileOutput {
            wasm,
            timings: timings.clone(),
            source_hash: String::new(),
            wasm_hash,
            exports,
        },
        timings,
    ))
}

// ── Error conversion ──────────────────────────────────────────────────────────

/// Map a codegen-internal error onto the structured taxonomy.
fn codegen_to_compile_error(e: CodegenError, file: &str) -> CompileError {
    let (kind, message) = match e {
        CodegenError::Unsupported(msg) => (ErrorKind::Unsupported, msg),
        CodegenError::TypeCompile(msg) => (ErrorKind::TypeCompile, msg),
        CodegenError::UnresolvedReference(msg) => (ErrorKind::UnresolvedReference, msg),
        CodegenError::Encoding(msg) => (ErrorKind::Encoding, msg),
        CodegenError::LimitExceeded(msg) => (ErrorKind::Encoding, format!("limit exceeded: {msg}")),
        CodegenError::Internal(msg) => (ErrorKind::Encoding, format!("internal: {msg}")),
    };
    CompileError::new(kind, message).with_file(file)
}

// ── Hashing ───────────────────────────────────────────────────────────────────

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        write!(s, "{b:02x}").expect("writing to a String cannot fail");
    }
    s
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_error_carries_file() {
        let err = compile("{", "bad.json", &CompileOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.file.as_deref(), Some("bad.json"));
    }
}
