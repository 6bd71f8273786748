use crate::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pipeline stage an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Parse,
    Analyze,
    Generate,
    Assemble,
}

/// The error taxonomy of the compiler.
///
/// Every kind carries a stable numeric code so hosts can match on errors
/// without parsing message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The input was not a well-formed ESTree tree.
    Parse,
    /// A `let`/`const` binding conflicts with a prior binding in its scope.
    Redeclaration,
    /// A syntax or semantic feature the generator does not implement.
    Unsupported,
    /// A static type hint contradicts a required operand type, or a strict
    /// mode reference cannot be resolved at compile time.
    TypeCompile,
    /// A deferred instruction survived to assembly (a generator bug).
    UnresolvedReference,
    /// An operand does not fit its binary field.
    Encoding,
}

impl ErrorKind {
    /// Numeric error code (stable across releases).
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::Parse => 100,
            ErrorKind::Redeclaration => 200,
            ErrorKind::Unsupported => 300,
            ErrorKind::TypeCompile => 301,
            ErrorKind::UnresolvedReference => 400,
            ErrorKind::Encoding => 401,
        }
    }

    /// The pipeline stage that produces this kind of error.
    pub fn stage(self) -> ErrorStage {
        match self {
            ErrorKind::Parse => ErrorStage::Parse,
            ErrorKind::Redeclaration => ErrorStage::Analyze,
            ErrorKind::Unsupported | ErrorKind::TypeCompile => ErrorStage::Generate,
            ErrorKind::UnresolvedReference | ErrorKind::Encoding => ErrorStage::Assemble,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.code())
    }
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse => write!(f, "parse"),
            Self::Analyze => write!(f, "analyze"),
            Self::Generate => write!(f, "generate"),
            Self::Assemble => write!(f, "assemble"),
        }
    }
}

/// A structured compiler error.
///
/// Compilation aborts on the first error; no partial artifact is produced.
/// Hosts render these — they must not parse free-form strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileError {
    /// Error kind (determines code and stage).
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Source location, when derivable from the offending node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    /// Source file name, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl CompileError {
    /// Create a new error without position information.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            file: None,
        }
    }

    /// Attach a source span. Unknown spans are dropped.
    pub fn with_span(mut self, span: Span) -> Self {
        if !span.is_unknown() {
            self.span = Some(span);
        }
        self
    }

    /// Attach a source file name.
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
        }
        if let Some(span) = &self.span {
            write!(f, "{span}: ")?;
        }
        write!(
            f,
            "{} [{}] {}",
            self.kind,
            self.kind.stage(),
            self.message
        )
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes() {
        assert_eq!(ErrorKind::Parse.code(), 100);
        assert_eq!(ErrorKind::Redeclaration.code(), 200);
        assert_eq!(ErrorKind::Unsupported.code(), 300);
        assert_eq!(ErrorKind::UnresolvedReference.code(), 400);
    }

    #[test]
    fn test_error_kind_stages() {
        assert_eq!(ErrorKind::Redeclaration.stage(), ErrorStage::Analyze);
        assert_eq!(ErrorKind::Encoding.stage(), ErrorStage::Assemble);
        assert_eq!(ErrorKind::TypeCompile.stage(), ErrorStage::Generate);
    }

    #[test]
    fn test_display_with_span_and_file() {
        let err = CompileError::new(ErrorKind::Unsupported, "for-in statement")
            .with_span(Span::new(3, 5, 3, 20))
            .with_file("demo.js");
        assert_eq!(format!("{err}"), "demo.js:3:5: E300 [generate] for-in statement");
    }

    #[test]
    fn test_unknown_span_is_not_attached() {
        let err = CompileError::new(ErrorKind::Parse, "bad tree").with_span(Span::UNKNOWN);
        assert!(err.span.is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let err = CompileError::new(ErrorKind::Redeclaration, "'x' already declared")
            .with_span(Span::new(1, 1, 1, 8));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"redeclaration\""));
        let back: CompileError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, err.kind);
        assert_eq!(back.message, err.message);
    }
}
