//! ESTree AST node types.
//!
//! The compiler accepts trees from any parser that honors the ESTree
//! convention. Nodes are modeled as tagged variants; deserialization
//! dispatches on the ESTree `"type"` string, and kinds outside the
//! supported surface land in an `Unknown` variant that the code generator
//! rejects with a diagnostic instead of failing the parse.
//!
//! Scope annotations (`scope`, `observed_scopes`, rewritten identifier
//! names) are written into the tree by the semantic analyzer; fresh trees
//! carry `None`.

use crate::Span;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Index of a scope record in the analyzer's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

// ══════════════════════════════════════════════════════════════════════════════
// Top level
// ══════════════════════════════════════════════════════════════════════════════

/// A complete program: the body of an ESTree `Program` node.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
    pub span: Span,
    /// Root scope, set by the analyzer.
    pub scope: Option<ScopeId>,
}

impl Program {
    /// Parse an ESTree JSON document into a [`Program`].
    pub fn from_json(source: &str) -> Result<Program, crate::CompileError> {
        serde_json::from_str(source)
            .map_err(|e| crate::CompileError::new(crate::ErrorKind::Parse, e.to_string()))
    }
}

/// A spanned identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Ident {
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

/// A literal value. Regex literals are not modeled and surface as
/// [`ExprKind::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

/// A binding pattern. Only plain identifiers are supported; destructuring
/// patterns surface as `Unsupported` and fail in the generator.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Ident(Ident),
    Unsupported { kind: String, span: Span },
}

impl Pattern {
    /// The identifier, if this is a plain binding.
    pub fn as_ident(&self) -> Option<&Ident> {
        match self {
            Pattern::Ident(id) => Some(id),
            Pattern::Unsupported { .. } => None,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Functions
// ══════════════════════════════════════════════════════════════════════════════

/// A function body: block for declarations/expressions, bare expression for
/// concise arrows.
#[derive(Debug, Clone, PartialEq)]
pub enum FnBody {
    Block(Vec<Stmt>),
    Expr(Box<Expr>),
}

/// Shared shape of `FunctionDeclaration`, `FunctionExpression`, and
/// `ArrowFunctionExpression`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionNode {
    pub id: Option<Ident>,
    pub params: Vec<Pattern>,
    pub body: FnBody,
    pub is_async: bool,
    pub is_generator: bool,
    pub is_arrow: bool,
    pub span: Span,
    /// Function scope, set by the analyzer.
    pub scope: Option<ScopeId>,
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

/// `var` / `let` / `const`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

/// One declarator of a `VariableDeclaration`.
#[derive(Debug, Clone, PartialEq)]
pub struct Declarator {
    pub id: Pattern,
    pub init: Option<Expr>,
    pub span: Span,
}

/// The init clause of a classic `for` statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ForInit {
    Decl(Box<Stmt>),
    Expr(Expr),
}

/// `catch (param) { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    pub param: Option<Pattern>,
    pub body: Vec<Stmt>,
    pub span: Span,
    /// Catch scope, set by the analyzer.
    pub scope: Option<ScopeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expression(Expr),
    VarDecl {
        kind: DeclKind,
        decls: Vec<Declarator>,
    },
    FunctionDecl(Box<FunctionNode>),
    Return(Option<Expr>),
    If {
        test: Expr,
        consequent: Box<Stmt>,
        alternate: Option<Box<Stmt>>,
    },
    Block {
        body: Vec<Stmt>,
        /// Block scope, set by the analyzer.
        scope: Option<ScopeId>,
    },
    While {
        test: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        test: Expr,
    },
    For {
        init: Option<ForInit>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
        /// Scope wrapping the init clause and body, set by the analyzer.
        scope: Option<ScopeId>,
    },
    Break,
    Continue,
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        /// Scope of the try block, set by the analyzer.
        block_scope: Option<ScopeId>,
        handler: Option<CatchClause>,
        finalizer: Option<Vec<Stmt>>,
        /// Scope of the finally block, set by the analyzer.
        finalizer_scope: Option<ScopeId>,
    },
    Empty,
    /// A node kind outside the supported surface.
    Unknown { kind: String },
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    In,
    InstanceOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
    Plus,
    Not,
    BitNot,
    Typeof,
    Void,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    /// `&&=` — assigns only when the target is truthy.
    And,
    /// `||=` — assigns only when the target is falsy.
    Or,
    /// `??=` — assigns only when the target is nullish.
    Nullish,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Lit),
    Ident(Ident),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        argument: Box<Expr>,
    },
    Update {
        op: UpdateOp,
        prefix: bool,
        argument: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        /// Scopes in force at this call site, recorded by the analyzer for
        /// calls that could observe the local environment (`eval`,
        /// dynamic `Function`).
        observed_scopes: Option<Vec<ScopeId>>,
    },
    Member {
        object: Box<Expr>,
        property: Box<Expr>,
        computed: bool,
    },
    Function(Box<FunctionNode>),
    Sequence(Vec<Expr>),
    /// A node kind outside the supported surface.
    Unknown { kind: String },
}

// ══════════════════════════════════════════════════════════════════════════════
// Deserialization — dispatch on the ESTree "type" string
// ══════════════════════════════════════════════════════════════════════════════

impl<'de> Deserialize<'de> for Program {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        convert::program(&v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Stmt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        convert::stmt(&v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        convert::expr(&v).map_err(serde::de::Error::custom)
    }
}

mod convert {
    use super::*;

    type Res<T> = Result<T, String>;

    fn node_type(v: &Value) -> Res<&str> {
        v.get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "node without a string \"type\" field".to_string())
    }

    fn field<'a>(v: &'a Value, name: &str) -> Res<&'a Value> {
        match v.get(name) {
            Some(f) if !f.is_null() => Ok(f),
            _ => Err(format!(
                "{} node missing \"{name}\" field",
                node_type(v).unwrap_or("?")
            )),
        }
    }

    fn opt_field<'a>(v: &'a Value, name: &str) -> Option<&'a Value> {
        v.get(name).filter(|f| !f.is_null())
    }

    fn span_of(v: &Value) -> Span {
        let Some(loc) = opt_field(v, "loc") else {
            return Span::UNKNOWN;
        };
        let pos = |key: &str| -> Option<(u32, u32)> {
            let p = loc.get(key)?;
            Some((
                p.get("line")?.as_u64()? as u32,
                p.get("column")?.as_u64()? as u32,
            ))
        };
        match (pos("start"), pos("end")) {
            (Some((sl, sc)), Some((el, ec))) => Span::from_loc(sl, sc, el, ec),
            _ => Span::UNKNOWN,
        }
    }

    pub fn program(v: &Value) -> Res<Program> {
        if node_type(v)? != "Program" {
            return Err(format!("expected a Program node, got {}", node_type(v)?));
        }
        Ok(Program {
            body: stmt_list(field(v, "body")?)?,
            span: span_of(v),
            scope: None,
        })
    }

    fn stmt_list(v: &Value) -> Res<Vec<Stmt>> {
        v.as_array()
            .ok_or_else(|| "statement list is not an array".to_string())?
            .iter()
            .map(stmt)
            .collect()
    }

    fn block_body(v: &Value) -> Res<Vec<Stmt>> {
        if node_type(v)? != "BlockStatement" {
            return Err(format!("expected a BlockStatement, got {}", node_type(v)?));
        }
        stmt_list(field(v, "body")?)
    }

    pub fn stmt(v: &Value) -> Res<Stmt> {
        let span = span_of(v);
        let kind = match node_type(v)? {
            "ExpressionStatement" => StmtKind::Expression(expr(field(v, "expression")?)?),
            "VariableDeclaration" => var_decl(v)?,
            "FunctionDeclaration" => StmtKind::FunctionDecl(Box::new(function(v, false)?)),
            "ReturnStatement" => {
                StmtKind::Return(opt_field(v, "argument").map(expr).transpose()?)
            }
            "IfStatement" => StmtKind::If {
                test: expr(field(v, "test")?)?,
                consequent: Box::new(stmt(field(v, "consequent")?)?),
                alternate: opt_field(v, "alternate")
                    .map(|a| stmt(a).map(Box::new))
                    .transpose()?,
            },
            "BlockStatement" => StmtKind::Block {
                body: stmt_list(field(v, "body")?)?,
                scope: None,
            },
            "WhileStatement" => StmtKind::While {
                test: expr(field(v, "test")?)?,
                body: Box::new(stmt(field(v, "body")?)?),
            },
            "DoWhileStatement" => StmtKind::DoWhile {
                body: Box::new(stmt(field(v, "body")?)?),
                test: expr(field(v, "test")?)?,
            },
            "ForStatement" => StmtKind::For {
                init: opt_field(v, "init").map(for_init).transpose()?,
                test: opt_field(v, "test").map(expr).transpose()?,
                update: opt_field(v, "update").map(expr).transpose()?,
                body: Box::new(stmt(field(v, "body")?)?),
                scope: None,
            },
            "BreakStatement" => match opt_field(v, "label") {
                None => StmtKind::Break,
                Some(_) => StmtKind::Unknown {
                    kind: "BreakStatement with label".to_string(),
                },
            },
            "ContinueStatement" => match opt_field(v, "label") {
                None => StmtKind::Continue,
                Some(_) => StmtKind::Unknown {
                    kind: "ContinueStatement with label".to_string(),
                },
            },
            "ThrowStatement" => StmtKind::Throw(expr(field(v, "argument")?)?),
            "TryStatement" => StmtKind::Try {
                block: block_body(field(v, "block")?)?,
                block_scope: None,
                handler: opt_field(v, "handler").map(catch_clause).transpose()?,
                finalizer: opt_field(v, "finalizer").map(block_body).transpose()?,
                finalizer_scope: None,
            },
            "EmptyStatement" => StmtKind::Empty,
            other => StmtKind::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(Stmt { kind, span })
    }

    fn var_decl(v: &Value) -> Res<StmtKind> {
        let kind = match field(v, "kind")?.as_str() {
            Some("var") => DeclKind::Var,
            Some("let") => DeclKind::Let,
            Some("const") => DeclKind::Const,
            other => return Err(format!("unknown declaration kind {other:?}")),
        };
        let decls = field(v, "declarations")?
            .as_array()
            .ok_or_else(|| "declarations is not an array".to_string())?
            .iter()
            .map(|d| {
                Ok(Declarator {
                    id: pattern(field(d, "id")?)?,
                    init: opt_field(d, "init").map(expr).transpose()?,
                    span: span_of(d),
                })
            })
            .collect::<Res<Vec<_>>>()?;
        Ok(StmtKind::VarDecl { kind, decls })
    }

    fn for_init(v: &Value) -> Res<ForInit> {
        if node_type(v)? == "VariableDeclaration" {
            Ok(ForInit::Decl(Box::new(stmt(v)?)))
        } else {
            Ok(ForInit::Expr(expr(v)?))
        }
    }

    fn catch_clause(v: &Value) -> Res<CatchClause> {
        Ok(CatchClause {
            param: opt_field(v, "param").map(pattern).transpose()?,
            body: block_body(field(v, "body")?)?,
            span: span_of(v),
            scope: None,
        })
    }

    fn pattern(v: &Value) -> Res<Pattern> {
        match node_type(v)? {
            "Identifier" => Ok(Pattern::Ident(ident(v)?)),
            other => Ok(Pattern::Unsupported {
                kind: other.to_string(),
                span: span_of(v),
            }),
        }
    }

    fn ident(v: &Value) -> Res<Ident> {
        Ok(Ident {
            name: field(v, "name")?
                .as_str()
                .ok_or_else(|| "identifier name is not a string".to_string())?
                .to_string(),
            span: span_of(v),
        })
    }

    fn function(v: &Value, arrow: bool) -> Res<FunctionNode> {
        let params = field(v, "params")?
            .as_array()
            .ok_or_else(|| "params is not an array".to_string())?
            .iter()
            .map(pattern)
            .collect::<Res<Vec<_>>>()?;
        let body_node = field(v, "body")?;
        let body = if arrow && node_type(body_node)? != "BlockStatement" {
            FnBody::Expr(Box::new(expr(body_node)?))
        } else {
            FnBody::Block(block_body(body_node)?)
        };
        Ok(FunctionNode {
            id: opt_field(v, "id").map(ident).transpose()?,
            params,
            body,
            is_async: opt_field(v, "async").and_then(Value::as_bool).unwrap_or(false),
            is_generator: opt_field(v, "generator")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            is_arrow: arrow,
            span: span_of(v),
            scope: None,
        })
    }

    pub fn expr(v: &Value) -> Res<Expr> {
        let span = span_of(v);
        let kind = match node_type(v)? {
            "Literal" => literal(v),
            "Identifier" => ExprKind::Ident(ident(v)?),
            "BinaryExpression" => {
                let op_str = field(v, "operator")?.as_str().unwrap_or("");
                match bin_op(op_str) {
                    Some(op) => ExprKind::Binary {
                        op,
                        left: Box::new(expr(field(v, "left")?)?),
                        right: Box::new(expr(field(v, "right")?)?),
                    },
                    None => ExprKind::Unknown {
                        kind: format!("BinaryExpression operator {op_str:?}"),
                    },
                }
            }
            "LogicalExpression" => {
                let op = match field(v, "operator")?.as_str() {
                    Some("&&") => LogicalOp::And,
                    Some("||") => LogicalOp::Or,
                    Some("??") => LogicalOp::Nullish,
                    other => return Err(format!("unknown logical operator {other:?}")),
                };
                ExprKind::Logical {
                    op,
                    left: Box::new(expr(field(v, "left")?)?),
                    right: Box::new(expr(field(v, "right")?)?),
                }
            }
            "UnaryExpression" => {
                let op_str = field(v, "operator")?.as_str().unwrap_or("");
                match unary_op(op_str) {
                    Some(op) => ExprKind::Unary {
                        op,
                        argument: Box::new(expr(field(v, "argument")?)?),
                    },
                    None => ExprKind::Unknown {
                        kind: format!("UnaryExpression operator {op_str:?}"),
                    },
                }
            }
            "UpdateExpression" => ExprKind::Update {
                op: match field(v, "operator")?.as_str() {
                    Some("++") => UpdateOp::Inc,
                    Some("--") => UpdateOp::Dec,
                    other => return Err(format!("unknown update operator {other:?}")),
                },
                prefix: opt_field(v, "prefix").and_then(Value::as_bool).unwrap_or(false),
                argument: Box::new(expr(field(v, "argument")?)?),
            },
            "AssignmentExpression" => {
                let op_str = field(v, "operator")?.as_str().unwrap_or("");
                match assign_op(op_str) {
                    Some(op) => ExprKind::Assign {
                        op,
                        target: Box::new(expr(field(v, "left")?)?),
                        value: Box::new(expr(field(v, "right")?)?),
                    },
                    None => ExprKind::Unknown {
                        kind: format!("AssignmentExpression operator {op_str:?}"),
                    },
                }
            }
            "ConditionalExpression" => ExprKind::Conditional {
                test: Box::new(expr(field(v, "test")?)?),
                consequent: Box::new(expr(field(v, "consequent")?)?),
                alternate: Box::new(expr(field(v, "alternate")?)?),
            },
            "CallExpression" => ExprKind::Call {
                callee: Box::new(expr(field(v, "callee")?)?),
                args: field(v, "arguments")?
                    .as_array()
                    .ok_or_else(|| "arguments is not an array".to_string())?
                    .iter()
                    .map(expr)
                    .collect::<Res<Vec<_>>>()?,
                observed_scopes: None,
            },
            "MemberExpression" => ExprKind::Member {
                object: Box::new(expr(field(v, "object")?)?),
                property: Box::new(expr(field(v, "property")?)?),
                computed: opt_field(v, "computed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "FunctionExpression" => ExprKind::Function(Box::new(function(v, false)?)),
            "ArrowFunctionExpression" => ExprKind::Function(Box::new(function(v, true)?)),
            "SequenceExpression" => ExprKind::Sequence(
                field(v, "expressions")?
                    .as_array()
                    .ok_or_else(|| "expressions is not an array".to_string())?
                    .iter()
                    .map(expr)
                    .collect::<Res<Vec<_>>>()?,
            ),
            other => ExprKind::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(Expr { kind, span })
    }

    fn literal(v: &Value) -> ExprKind {
        if v.get("regex").is_some() {
            return ExprKind::Unknown {
                kind: "Literal (regex)".to_string(),
            };
        }
        match v.get("value") {
            Some(Value::Number(n)) => match n.as_f64() {
                Some(f) => ExprKind::Literal(Lit::Number(f)),
                None => ExprKind::Unknown {
                    kind: "Literal (non-f64 number)".to_string(),
                },
            },
            Some(Value::String(s)) => ExprKind::Literal(Lit::Str(s.clone())),
            Some(Value::Bool(b)) => ExprKind::Literal(Lit::Bool(*b)),
            Some(Value::Null) | None => ExprKind::Literal(Lit::Null),
            Some(other) => ExprKind::Unknown {
                kind: format!("Literal ({})", type_name(other)),
            },
        }
    }

    fn type_name(v: &Value) -> &'static str {
        match v {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    fn bin_op(s: &str) -> Option<BinOp> {
        Some(match s {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "%" => BinOp::Rem,
            "==" => BinOp::Eq,
            "!=" => BinOp::Ne,
            "===" => BinOp::StrictEq,
            "!==" => BinOp::StrictNe,
            "<" => BinOp::Lt,
            "<=" => BinOp::Le,
            ">" => BinOp::Gt,
            ">=" => BinOp::Ge,
            "&" => BinOp::BitAnd,
            "|" => BinOp::BitOr,
            "^" => BinOp::BitXor,
            "<<" => BinOp::Shl,
            ">>" => BinOp::Shr,
            ">>>" => BinOp::UShr,
            "in" => BinOp::In,
            "instanceof" => BinOp::InstanceOf,
            _ => return None,
        })
    }

    fn unary_op(s: &str) -> Option<UnaryOp> {
        Some(match s {
            "-" => UnaryOp::Minus,
            "+" => UnaryOp::Plus,
            "!" => UnaryOp::Not,
            "~" => UnaryOp::BitNot,
            "typeof" => UnaryOp::Typeof,
            "void" => UnaryOp::Void,
            "delete" => UnaryOp::Delete,
            _ => return None,
        })
    }

    fn assign_op(s: &str) -> Option<AssignOp> {
        Some(match s {
            "=" => AssignOp::Assign,
            "+=" => AssignOp::Add,
            "-=" => AssignOp::Sub,
            "*=" => AssignOp::Mul,
            "/=" => AssignOp::Div,
            "%=" => AssignOp::Rem,
            "&=" => AssignOp::BitAnd,
            "|=" => AssignOp::BitOr,
            "^=" => AssignOp::BitXor,
            "<<=" => AssignOp::Shl,
            ">>=" => AssignOp::Shr,
            ">>>=" => AssignOp::UShr,
            "&&=" => AssignOp::And,
            "||=" => AssignOp::Or,
            "??=" => AssignOp::Nullish,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_program(v: serde_json::Value) -> Program {
        serde_json::from_value(v).expect("valid ESTree")
    }

    #[test]
    fn test_minimal_program() {
        let prog = parse_program(json!({"type": "Program", "body": []}));
        assert!(prog.body.is_empty());
        assert!(prog.span.is_unknown());
        assert!(prog.scope.is_none());
    }

    #[test]
    fn test_expression_statement_with_loc() {
        let prog = parse_program(json!({
            "type": "Program",
            "body": [{
                "type": "ExpressionStatement",
                "loc": {"start": {"line": 1, "column": 0}, "end": {"line": 1, "column": 4}},
                "expression": {"type": "Literal", "value": 42.0}
            }]
        }));
        let stmt = &prog.body[0];
        assert_eq!(stmt.span, Span::new(1, 1, 1, 5));
        match &stmt.kind {
            StmtKind::Expression(e) => {
                assert_eq!(e.kind, ExprKind::Literal(Lit::Number(42.0)))
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_var_decl_kinds() {
        let prog = parse_program(json!({
            "type": "Program",
            "body": [{
                "type": "VariableDeclaration",
                "kind": "let",
                "declarations": [{
                    "type": "VariableDeclarator",
                    "id": {"type": "Identifier", "name": "x"},
                    "init": {"type": "Literal", "value": 1}
                }]
            }]
        }));
        match &prog.body[0].kind {
            StmtKind::VarDecl { kind, decls } => {
                assert_eq!(*kind, DeclKind::Let);
                assert_eq!(decls[0].id.as_ident().unwrap().name, "x");
                assert!(decls[0].init.is_some());
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_statement_kind_is_preserved() {
        let prog = parse_program(json!({
            "type": "Program",
            "body": [{"type": "WithStatement", "object": {}, "body": {}}]
        }));
        assert_eq!(
            prog.body[0].kind,
            StmtKind::Unknown {
                kind: "WithStatement".to_string()
            }
        );
    }

    #[test]
    fn test_compound_assignment_operators() {
        for (op_str, expected) in [
            ("+=", AssignOp::Add),
            ("&=", AssignOp::BitAnd),
            ("<<=", AssignOp::Shl),
            (">>>=", AssignOp::UShr),
            ("&&=", AssignOp::And),
            ("||=", AssignOp::Or),
            ("??=", AssignOp::Nullish),
        ] {
            let e: Expr = serde_json::from_value(json!({
                "type": "AssignmentExpression",
                "operator": op_str,
                "left": {"type": "Identifier", "name": "x"},
                "right": {"type": "Literal", "value": 1}
            }))
            .unwrap();
            match e.kind {
                ExprKind::Assign { op, .. } => assert_eq!(op, expected),
                other => panic!("unexpected expression: {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_operator_is_preserved() {
        let expr: Expr = serde_json::from_value(json!({
            "type": "BinaryExpression",
            "operator": "**",
            "left": {"type": "Literal", "value": 2},
            "right": {"type": "Literal", "value": 8}
        }))
        .unwrap();
        match expr.kind {
            ExprKind::Unknown { kind } => assert!(kind.contains("**")),
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn test_arrow_with_expression_body() {
        let expr: Expr = serde_json::from_value(json!({
            "type": "ArrowFunctionExpression",
            "params": [{"type": "Identifier", "name": "n"}],
            "body": {"type": "Identifier", "name": "n"}
        }))
        .unwrap();
        match expr.kind {
            ExprKind::Function(f) => {
                assert!(f.is_arrow);
                assert!(matches!(f.body, FnBody::Expr(_)));
                assert_eq!(f.params.len(), 1);
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn test_try_catch_finally() {
        let prog = parse_program(json!({
            "type": "Program",
            "body": [{
                "type": "TryStatement",
                "block": {"type": "BlockStatement", "body": []},
                "handler": {
                    "type": "CatchClause",
                    "param": {"type": "Identifier", "name": "e"},
                    "body": {"type": "BlockStatement", "body": []}
                },
                "finalizer": {"type": "BlockStatement", "body": []}
            }]
        }));
        match &prog.body[0].kind {
            StmtKind::Try {
                handler, finalizer, ..
            } => {
                assert_eq!(
                    handler.as_ref().unwrap().param.as_ref().unwrap().as_ident().unwrap().name,
                    "e"
                );
                assert!(finalizer.is_some());
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_null_literal_and_missing_value() {
        let e: Expr =
            serde_json::from_value(json!({"type": "Literal", "value": null})).unwrap();
        assert_eq!(e.kind, ExprKind::Literal(Lit::Null));
    }

    #[test]
    fn test_regex_literal_is_unknown() {
        let e: Expr = serde_json::from_value(
            json!({"type": "Literal", "regex": {"pattern": "a", "flags": ""}}),
        )
        .unwrap();
        assert!(matches!(e.kind, ExprKind::Unknown { .. }));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = Program::from_json("not json").unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Parse);
    }

    #[test]
    fn test_from_json_rejects_non_program() {
        let err = Program::from_json(r#"{"type": "Identifier", "name": "x"}"#).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Parse);
    }
}
