//! Codegen error types.

use thiserror::Error;

/// Errors that can occur during IR lowering, optimization, or assembly.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// An AST feature is not implemented by the code generator.
    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// A static type hint contradicts a required operand type, or a strict
    /// mode binding could not be resolved at compile time.
    #[error("type error: {0}")]
    TypeCompile(String),

    /// A deferred instruction survived to assembly.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// An operand is outside its encodable range.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Too many locals, functions, or data bytes for the binary format.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// An internal consistency check failed.
    #[error("internal codegen error: {0}")]
    Internal(String),
}

/// Codegen result type alias.
pub type CodegenResult<T> = Result<T, CodegenError>;
