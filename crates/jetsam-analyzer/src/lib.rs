//! Semantic analyzer: resolves every identifier to a unique binding.
//!
//! ```text
//! ESTree Program → [pass 1: scope discovery] → [pass 2: disambiguation] → annotated tree
//! ```
//!
//! Pass 1 attaches a scope record to each scope-forming node and registers
//! every declaration, hoisting `var` and function declarations to the
//! nearest function (or program root) while `let`/`const`/catch bindings
//! stay in their block.
//!
//! Pass 2 assigns globally unique names (`base#N` on shadowing), rewrites
//! identifier references to their resolved unique name, marks bindings
//! captured by inner functions, and records the scopes in force at `eval`
//! and dynamic `Function` call sites. Unresolved references are left
//! untouched — the generator treats them as global accesses.
//!
//! The analyzer is idempotent: a second run over an annotated tree is a
//! no-op.

mod scope;

pub use scope::{Binding, BindingKind, ScopeArena, ScopeKind, ScopeRecord};

use jetsam_types::estree::{
    CatchClause, DeclKind, Expr, ExprKind, FnBody, ForInit, FunctionNode, Ident, Lit, Pattern,
    Program, ScopeId, Stmt, StmtKind,
};
use jetsam_types::{CompileError, ErrorKind, Result, Span};

/// The output of the analyzer: the scope arena plus tree-wide flags.
/// The annotated tree holds [`ScopeId`]s pointing into the arena.
#[derive(Debug)]
pub struct Analysis {
    pub scopes: ScopeArena,
    /// Whether the program opens with a `"use strict"` directive.
    pub strict: bool,
}

/// Analyze a program in place.
pub fn analyze(program: &mut Program) -> Result<Analysis> {
    let mut analyzer = Analyzer::default();
    analyzer.discover_program(program)?;
    analyzer.resolve_program(program);
    log::debug!(
        "analyzed program: {} scopes, {} renames",
        analyzer.arena.len(),
        analyzer.renames
    );
    Ok(Analysis {
        scopes: analyzer.arena,
        strict: analyzer.strict,
    })
}

#[derive(Default)]
struct Analyzer {
    arena: ScopeArena,
    seen: std::collections::HashSet<String>,
    counter: u32,
    renames: usize,
    strict: bool,
    /// Lexical scope chain during pass 2, outermost first.
    scope_stack: Vec<ScopeId>,
    /// Enclosing function scopes during pass 2, outermost first.
    fn_stack: Vec<ScopeId>,
}

impl Analyzer {
    // ══════════════════════════════════════════════════════════════════════
    // Pass 1 — discovery
    // ══════════════════════════════════════════════════════════════════════

    fn discover_program(&mut self, program: &mut Program) -> Result<()> {
        let root = self.arena.alloc(ScopeKind::Root, None);
        program.scope = Some(root);
        self.strict = has_strict_directive(&program.body);
        for stmt in &mut program.body {
            self.discover_stmt(stmt, root, root)?;
        }
        Ok(())
    }

    fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: BindingKind,
        span: Span,
    ) -> Result<()> {
        if self.arena.declare(scope, name, kind, span) {
            Ok(())
        } else {
            Err(
                CompileError::new(ErrorKind::Redeclaration, format!("'{name}' has already been declared"))
                    .with_span(span),
            )
        }
    }

    fn discover_stmt(&mut self, stmt: &mut Stmt, scope: ScopeId, fn_scope: ScopeId) -> Result<()> {
        match &mut stmt.kind {
            StmtKind::Expression(e) => self.discover_expr(e, scope, fn_scope),
            StmtKind::VarDecl { kind, decls } => {
                let (target, bkind) = match kind {
                    DeclKind::Var => (fn_scope, BindingKind::Var),
                    DeclKind::Let => (scope, BindingKind::Let),
                    DeclKind::Const => (scope, BindingKind::Const),
                };
                for decl in decls {
                    if let Some(id) = decl.id.as_ident() {
                        let (name, span) = (id.name.clone(), id.span);
                        self.declare(target, &name, bkind, span)?;
                    }
                    if let Some(init) = &mut decl.init {
                        self.discover_expr(init, scope, fn_scope)?;
                    }
                }
                Ok(())
            }
            StmtKind::FunctionDecl(f) => {
                if let Some(id) = &f.id {
                    let (name, span) = (id.name.clone(), id.span);
                    self.declare(fn_scope, &name, BindingKind::Function, span)?;
                }
                self.discover_function(f, scope, false)
            }
            StmtKind::Return(e) => match e {
                Some(e) => self.discover_expr(e, scope, fn_scope),
                None => Ok(()),
            },
            StmtKind::If {
                test,
                consequent,
                alternate,
            } => {
                self.discover_expr(test, scope, fn_scope)?;
                self.discover_stmt(consequent, scope, fn_scope)?;
                if let Some(alt) = alternate {
                    self.discover_stmt(alt, scope, fn_scope)?;
                }
                Ok(())
            }
            StmtKind::Block { body, scope: slot } => {
                let block = self.arena.alloc(ScopeKind::Block, Some(scope));
                *slot = Some(block);
                for s in body {
                    self.discover_stmt(s, block, fn_scope)?;
                }
                Ok(())
            }
            StmtKind::While { test, body } => {
                self.discover_expr(test, scope, fn_scope)?;
                self.discover_stmt(body, scope, fn_scope)
            }
            StmtKind::DoWhile { body, test } => {
                self.discover_stmt(body, scope, fn_scope)?;
                self.discover_expr(test, scope, fn_scope)
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
                scope: slot,
            } => {
                let for_scope = self.arena.alloc(ScopeKind::Block, Some(scope));
                *slot = Some(for_scope);
                match init {
                    Some(ForInit::Decl(d)) => self.discover_stmt(d, for_scope, fn_scope)?,
                    Some(ForInit::Expr(e)) => self.discover_expr(e, for_scope, fn_scope)?,
                    None => {}
                }
                if let Some(test) = test {
                    self.discover_expr(test, for_scope, fn_scope)?;
                }
                if let Some(update) = update {
                    self.discover_expr(update, for_scope, fn_scope)?;
                }
                self.discover_stmt(body, for_scope, fn_scope)
            }
            StmtKind::Throw(e) => self.discover_expr(e, scope, fn_scope),
            StmtKind::Try {
                block,
                block_scope,
                handler,
                finalizer,
                finalizer_scope,
            } => {
                let try_scope = self.arena.alloc(ScopeKind::Block, Some(scope));
                *block_scope = Some(try_scope);
                for s in block {
                    self.discover_stmt(s, try_scope, fn_scope)?;
                }
                if let Some(clause) = handler {
                    self.discover_catch(clause, scope, fn_scope)?;
                }
                if let Some(fin) = finalizer {
                    let fin_scope = self.arena.alloc(ScopeKind::Block, Some(scope));
                    *finalizer_scope = Some(fin_scope);
                    for s in fin {
                        self.discover_stmt(s, fin_scope, fn_scope)?;
                    }
                }
                Ok(())
            }
            StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Empty
            | StmtKind::Unknown { .. } => Ok(()),
        }
    }

    fn discover_catch(
        &mut self,
        clause: &mut CatchClause,
        scope: ScopeId,
        fn_scope: ScopeId,
    ) -> Result<()> {
        let catch_scope = self.arena.alloc(ScopeKind::Catch, Some(scope));
        clause.scope = Some(catch_scope);
        if let Some(Pattern::Ident(id)) = &clause.param {
            let (name, span) = (id.name.clone(), id.span);
            self.declare(catch_scope, &name, BindingKind::Catch, span)?;
        }
        for s in &mut clause.body {
            self.discover_stmt(s, catch_scope, fn_scope)?;
        }
        Ok(())
    }

    fn discover_function(
        &mut self,
        f: &mut FunctionNode,
        parent: ScopeId,
        declare_self: bool,
    ) -> Result<()> {
        let fscope = self.arena.alloc(ScopeKind::Function, Some(parent));
        f.scope = Some(fscope);
        // A named function expression can refer to itself by name.
        if declare_self {
            if let Some(id) = &f.id {
                let (name, span) = (id.name.clone(), id.span);
                self.declare(fscope, &name, BindingKind::Function, span)?;
            }
        }
        for param in &f.params {
            if let Some(id) = param.as_ident() {
                let (name, span) = (id.name.clone(), id.span);
                self.declare(fscope, &name, BindingKind::Param, span)?;
            }
        }
        match &mut f.body {
            FnBody::Block(stmts) => {
                for s in stmts {
                    self.discover_stmt(s, fscope, fscope)?;
                }
            }
            FnBody::Expr(e) => self.discover_expr(e, fscope, fscope)?,
        }
        Ok(())
    }

    fn discover_expr(&mut self, expr: &mut Expr, scope: ScopeId, fn_scope: ScopeId) -> Result<()> {
        match &mut expr.kind {
            ExprKind::Function(f) => self.discover_function(f, scope, !f.is_arrow),
            ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
                self.discover_expr(left, scope, fn_scope)?;
                self.discover_expr(right, scope, fn_scope)
            }
            ExprKind::Unary { argument, .. } | ExprKind::Update { argument, .. } => {
                self.discover_expr(argument, scope, fn_scope)
            }
            ExprKind::Assign { target, value, .. } => {
                self.discover_expr(target, scope, fn_scope)?;
                self.discover_expr(value, scope, fn_scope)
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.discover_expr(test, scope, fn_scope)?;
                self.discover_expr(consequent, scope, fn_scope)?;
                self.discover_expr(alternate, scope, fn_scope)
            }
            ExprKind::Call { callee, args, .. } => {
                self.discover_expr(callee, scope, fn_scope)?;
                for a in args {
                    self.discover_expr(a, scope, fn_scope)?;
                }
                Ok(())
            }
            ExprKind::Member {
                object,
                property,
                computed,
            } => {
                self.discover_expr(object, scope, fn_scope)?;
                if *computed {
                    self.discover_expr(property, scope, fn_scope)?;
                }
                Ok(())
            }
            ExprKind::Sequence(exprs) => {
                for e in exprs {
                    self.discover_expr(e, scope, fn_scope)?;
                }
                Ok(())
            }
            ExprKind::Literal(_) | ExprKind::Ident(_) | ExprKind::Unknown { .. } => Ok(()),
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Pass 2 — disambiguation
    // ══════════════════════════════════════════════════════════════════════

    fn resolve_program(&mut self, program: &mut Program) {
        let root = program.scope.expect("pass 1 ran");
        self.enter_scope(root);
        self.fn_stack.push(root);
        for stmt in &mut program.body {
            self.resolve_stmt(stmt);
        }
        self.fn_stack.pop();
        self.scope_stack.pop();
    }

    /// Push a scope and assign unique names to its bindings.
    fn enter_scope(&mut self, scope: ScopeId) {
        self.scope_stack.push(scope);
        let names: Vec<String> = self
            .arena
            .get(scope)
            .bindings()
            .iter()
            .map(|b| b.name.clone())
            .collect();
        for name in names {
            let unique = if self.seen.insert(name.clone()) {
                name.clone()
            } else {
                self.renames += 1;
                loop {
                    self.counter += 1;
                    let candidate = format!("{}#{}", name, self.counter);
                    if self.seen.insert(candidate.clone()) {
                        break candidate;
                    }
                }
            };
            self.arena.set_unique(scope, &name, unique);
        }
    }

    fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().expect("scope stack is never empty")
    }

    /// Rewrite the self-name of a named function expression. Declarations
    /// are renamed against their outer scope instead, so only a Function
    /// binding in the function's own scope applies here.
    fn rename_self_name(&mut self, ident: &mut Ident, fscope: ScopeId) {
        if let Some(b) = self.arena.get(fscope).get(&ident.name) {
            if b.kind == BindingKind::Function {
                ident.name = b.unique.clone();
            }
        }
    }

    /// Resolve a reference: rewrite to the unique name and record captures.
    fn resolve_ident(&mut self, ident: &mut Ident) {
        let Some((decl_scope, binding)) = self.arena.lookup(self.current_scope(), &ident.name)
        else {
            // Unresolved: the generator treats it as a global access.
            return;
        };
        let unique = binding.unique.clone();
        let decl_fn = self.arena.function_scope_of(decl_scope);
        let current_fn = *self.fn_stack.last().expect("fn stack is never empty");
        if decl_fn != current_fn {
            self.arena.mark_captured(decl_scope, &ident.name);
            for &f in self.fn_stack.iter().rev() {
                if f == decl_fn {
                    break;
                }
                self.arena.add_free_var(f, &unique);
            }
        }
        ident.name = unique;
    }

    fn resolve_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Expression(e) => self.resolve_expr(e),
            StmtKind::VarDecl { kind, decls } => {
                let target = match kind {
                    DeclKind::Var => self
                        .arena
                        .function_scope_of(self.current_scope()),
                    DeclKind::Let | DeclKind::Const => self.current_scope(),
                };
                for decl in decls {
                    if let Some(init) = &mut decl.init {
                        self.resolve_expr(init);
                    }
                    if let Pattern::Ident(id) = &mut decl.id {
                        let scope = target;
                        if let Some(b) = self.arena.get(scope).get(&id.name) {
                            id.name = b.unique.clone();
                        }
                    }
                }
            }
            StmtKind::FunctionDecl(f) => {
                let fn_scope = self.arena.function_scope_of(self.current_scope());
                if let Some(id) = &mut f.id {
                    if let Some(b) = self.arena.get(fn_scope).get(&id.name) {
                        id.name = b.unique.clone();
                    }
                }
                self.resolve_function(f);
            }
            StmtKind::Return(e) => {
                if let Some(e) = e {
                    self.resolve_expr(e);
                }
            }
            StmtKind::If {
                test,
                consequent,
                alternate,
            } => {
                self.resolve_expr(test);
                self.resolve_stmt(consequent);
                if let Some(alt) = alternate {
                    self.resolve_stmt(alt);
                }
            }
            StmtKind::Block { body, scope } => {
                let block = scope.expect("pass 1 ran");
                self.enter_scope(block);
                for s in body {
                    self.resolve_stmt(s);
                }
                self.scope_stack.pop();
            }
            StmtKind::While { test, body } => {
                self.resolve_expr(test);
                self.resolve_stmt(body);
            }
            StmtKind::DoWhile { body, test } => {
                self.resolve_stmt(body);
                self.resolve_expr(test);
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
                scope,
            } => {
                let for_scope = scope.expect("pass 1 ran");
                self.enter_scope(for_scope);
                match init {
                    Some(ForInit::Decl(d)) => self.resolve_stmt(d),
                    Some(ForInit::Expr(e)) => self.resolve_expr(e),
                    None => {}
                }
                if let Some(test) = test {
                    self.resolve_expr(test);
                }
                if let Some(update) = update {
                    self.resolve_expr(update);
                }
                self.resolve_stmt(body);
                self.scope_stack.pop();
            }
            StmtKind::Throw(e) => self.resolve_expr(e),
            StmtKind::Try {
                block,
                block_scope,
                handler,
                finalizer,
                finalizer_scope,
            } => {
                let try_scope = block_scope.expect("pass 1 ran");
                self.enter_scope(try_scope);
                for s in block {
                    self.resolve_stmt(s);
                }
                self.scope_stack.pop();
                if let Some(clause) = handler {
                    let catch_scope = clause.scope.expect("pass 1 ran");
                    self.enter_scope(catch_scope);
                    if let Some(Pattern::Ident(id)) = &mut clause.param {
                        if let Some(b) = self.arena.get(catch_scope).get(&id.name) {
                            id.name = b.unique.clone();
                        }
                    }
                    for s in &mut clause.body {
                        self.resolve_stmt(s);
                    }
                    self.scope_stack.pop();
                }
                if let Some(fin) = finalizer {
                    let fin_scope = finalizer_scope.expect("pass 1 ran");
                    self.enter_scope(fin_scope);
                    for s in fin {
                        self.resolve_stmt(s);
                    }
                    self.scope_stack.pop();
                }
            }
            StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Empty
            | StmtKind::Unknown { .. } => {}
        }
    }

    fn resolve_function(&mut self, f: &mut FunctionNode) {
        let fscope = f.scope.expect("pass 1 ran");
        self.enter_scope(fscope);
        self.fn_stack.push(fscope);
        if !f.is_arrow {
            if let Some(id) = &mut f.id {
                self.rename_self_name(id, fscope);
            }
        }
        for param in &mut f.params {
            if let Pattern::Ident(id) = param {
                if let Some(b) = self.arena.get(fscope).get(&id.name) {
                    id.name = b.unique.clone();
                }
            }
        }
        match &mut f.body {
            FnBody::Block(stmts) => {
                for s in stmts {
                    self.resolve_stmt(s);
                }
            }
            FnBody::Expr(e) => self.resolve_expr(e),
        }
        self.fn_stack.pop();
        self.scope_stack.pop();
    }

    fn resolve_expr(&mut self, expr: &mut Expr) {
        match &mut expr.kind {
            ExprKind::Ident(id) => self.resolve_ident(id),
            ExprKind::Function(f) => self.resolve_function(f),
            ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
                self.resolve_expr(left);
                self.resolve_expr(right);
            }
            ExprKind::Unary { argument, .. } | ExprKind::Update { argument, .. } => {
                self.resolve_expr(argument)
            }
            ExprKind::Assign { target, value, .. } => {
                self.resolve_expr(target);
                self.resolve_expr(value);
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.resolve_expr(test);
                self.resolve_expr(consequent);
                self.resolve_expr(alternate);
            }
            ExprKind::Call {
                callee,
                args,
                observed_scopes,
            } => {
                // `eval` and dynamic `Function` can observe the whole local
                // environment; record the scopes in force so later passes
                // keep those locals alive. The generator rejects such calls.
                if let ExprKind::Ident(id) = &callee.kind {
                    if (id.name == "eval" || id.name == "Function")
                        && self.arena.lookup(self.current_scope(), &id.name).is_none()
                    {
                        *observed_scopes = Some(self.scope_stack.clone());
                    }
                }
                self.resolve_expr(callee);
                for a in args {
                    self.resolve_expr(a);
                }
            }
            ExprKind::Member {
                object,
                property,
                computed,
            } => {
                self.resolve_expr(object);
                if *computed {
                    self.resolve_expr(property);
                }
            }
            ExprKind::Sequence(exprs) => {
                for e in exprs {
                    self.resolve_expr(e);
                }
            }
            ExprKind::Literal(_) | ExprKind::Unknown { .. } => {}
        }
    }
}

/// Whether the statement list opens with a `"use strict"` directive.
fn has_strict_directive(body: &[Stmt]) -> bool {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Expression(Expr {
                kind: ExprKind::Literal(Lit::Str(s)),
                ..
            }) => {
                if s == "use strict" {
                    return true;
                }
                // other directives ("use asm", ...) keep the prologue open
            }
            _ => break,
        }
    }
    false
}
