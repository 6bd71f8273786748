//! Integration tests for the semantic analyzer.
//!
//! Trees are built as ESTree JSON (what any conforming parser produces)
//! and deserialized through jetsam-types.

use jetsam_analyzer::{analyze, BindingKind};
use jetsam_types::estree::{Expr, ExprKind, FnBody, Pattern, Program, Stmt, StmtKind};
use jetsam_types::ErrorKind;
use serde_json::{json, Value};

// ══════════════════════════════════════════════════════════════════════════════
// ESTree builders
// ══════════════════════════════════════════════════════════════════════════════

fn program(body: Vec<Value>) -> Program {
    serde_json::from_value(json!({"type": "Program", "body": body})).expect("valid ESTree")
}

fn ident(name: &str) -> Value {
    json!({"type": "Identifier", "name": name})
}

fn num(n: f64) -> Value {
    json!({"type": "Literal", "value": n})
}

fn expr_stmt(e: Value) -> Value {
    json!({"type": "ExpressionStatement", "expression": e})
}

fn decl(kind: &str, name: &str, init: Value) -> Value {
    json!({
        "type": "VariableDeclaration",
        "kind": kind,
        "declarations": [{
            "type": "VariableDeclarator",
            "id": ident(name),
            "init": init
        }]
    })
}

fn block(body: Vec<Value>) -> Value {
    json!({"type": "BlockStatement", "body": body})
}

fn func_decl(name: &str, params: Vec<&str>, body: Vec<Value>) -> Value {
    json!({
        "type": "FunctionDeclaration",
        "id": ident(name),
        "params": params.iter().map(|p| ident(p)).collect::<Vec<_>>(),
        "body": {"type": "BlockStatement", "body": body}
    })
}

fn func_expr(params: Vec<&str>, body: Vec<Value>) -> Value {
    json!({
        "type": "FunctionExpression",
        "id": null,
        "params": params.iter().map(|p| ident(p)).collect::<Vec<_>>(),
        "body": {"type": "BlockStatement", "body": body}
    })
}

fn ret(e: Value) -> Value {
    json!({"type": "ReturnStatement", "argument": e})
}

fn call(callee: Value, args: Vec<Value>) -> Value {
    json!({"type": "CallExpression", "callee": callee, "arguments": args})
}

// ── Tree inspection ──────────────────────────────────────────────────────────

/// Collect the names of every identifier in reference position.
fn reference_names(program: &Program) -> Vec<String> {
    let mut out = Vec::new();
    fn walk_stmt(s: &Stmt, out: &mut Vec<String>) {
        match &s.kind {
            StmtKind::Expression(e) | StmtKind::Throw(e) => walk_expr(e, out),
            StmtKind::VarDecl { decls, .. } => {
                for d in decls {
                    if let Some(init) = &d.init {
                        walk_expr(init, out);
                    }
                }
            }
            StmtKind::FunctionDecl(f) => walk_fn(f, out),
            StmtKind::Return(Some(e)) => walk_expr(e, out),
            StmtKind::If {
                test,
                consequent,
                alternate,
            } => {
                walk_expr(test, out);
                walk_stmt(consequent, out);
                if let Some(a) = alternate {
                    walk_stmt(a, out);
                }
            }
            StmtKind::Block { body, .. } => body.iter().for_each(|s| walk_stmt(s, out)),
            StmtKind::While { test, body } => {
                walk_expr(test, out);
                walk_stmt(body, out);
            }
            StmtKind::DoWhile { body, test } => {
                walk_stmt(body, out);
                walk_expr(test, out);
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
                ..
            } => {
                match init {
                    Some(jetsam_types::estree::ForInit::Decl(d)) => walk_stmt(d, out),
                    Some(jetsam_types::estree::ForInit::Expr(e)) => walk_expr(e, out),
                    None => {}
                }
                if let Some(t) = test {
                    walk_expr(t, out);
                }
                if let Some(u) = update {
                    walk_expr(u, out);
                }
                walk_stmt(body, out);
            }
            StmtKind::Try {
                block,
                handler,
                finalizer,
                ..
            } => {
                block.iter().for_each(|s| walk_stmt(s, out));
                if let Some(h) = handler {
                    h.body.iter().for_each(|s| walk_stmt(s, out));
                }
                if let Some(f) = finalizer {
                    f.iter().for_each(|s| walk_stmt(s, out));
                }
            }
            _ => {}
        }
    }
    fn walk_fn(f: &jetsam_types::estree::FunctionNode, out: &mut Vec<String>) {
        match &f.body {
            FnBody::Block(stmts) => stmts.iter().for_each(|s| walk_stmt(s, out)),
            FnBody::Expr(e) => walk_expr(e, out),
        }
    }
    fn walk_expr(e: &Expr, out: &mut Vec<String>) {
        match &e.kind {
            ExprKind::Ident(id) => out.push(id.name.clone()),
            ExprKind::Function(f) => walk_fn(f, out),
            ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
                walk_expr(left, out);
                walk_expr(right, out);
            }
            ExprKind::Unary { argument, .. } | ExprKind::Update { argument, .. } => {
                walk_expr(argument, out)
            }
            ExprKind::Assign { target, value, .. } => {
                walk_expr(target, out);
                walk_expr(value, out);
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                walk_expr(test, out);
                walk_expr(consequent, out);
                walk_expr(alternate, out);
            }
            ExprKind::Call { callee, args, .. } => {
                walk_expr(callee, out);
                args.iter().for_each(|a| walk_expr(a, out));
            }
            ExprKind::Member {
                object,
                property,
                computed,
            } => {
                walk_expr(object, out);
                if *computed {
                    walk_expr(property, out);
                }
            }
            ExprKind::Sequence(exprs) => exprs.iter().for_each(|e| walk_expr(e, out)),
            _ => {}
        }
    }
    program.body.iter().for_each(|s| walk_stmt(s, &mut out));
    out
}

// ══════════════════════════════════════════════════════════════════════════════
// Scope discovery & renaming
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn shadowed_binding_is_renamed() {
    // let x = 1; { let x = 2; x; } x;
    let mut prog = program(vec![
        decl("let", "x", num(1.0)),
        block(vec![decl("let", "x", num(2.0)), expr_stmt(ident("x"))]),
        expr_stmt(ident("x")),
    ]);
    let analysis = analyze(&mut prog).unwrap();

    let refs = reference_names(&prog);
    assert_eq!(refs, vec!["x#1", "x"]);
    assert!(analysis.scopes.binding_by_unique("x").is_some());
    assert!(analysis.scopes.binding_by_unique("x#1").is_some());
}

#[test]
fn var_in_block_hoists_to_function_scope() {
    // { var x = 1; } x;
    let mut prog = program(vec![
        block(vec![decl("var", "x", num(1.0))]),
        expr_stmt(ident("x")),
    ]);
    let analysis = analyze(&mut prog).unwrap();
    // The reference outside the block resolves to the hoisted binding.
    assert_eq!(reference_names(&prog), vec!["x"]);
    let b = analysis.scopes.binding_by_unique("x").unwrap();
    assert_eq!(b.kind, BindingKind::Var);
}

#[test]
fn function_declaration_is_hoisted() {
    // f(); function f() {}
    let mut prog = program(vec![
        expr_stmt(call(ident("f"), vec![])),
        func_decl("f", vec![], vec![]),
    ]);
    let analysis = analyze(&mut prog).unwrap();
    assert_eq!(reference_names(&prog), vec!["f"]);
    let b = analysis.scopes.binding_by_unique("f").unwrap();
    assert_eq!(b.kind, BindingKind::Function);
}

#[test]
fn unresolved_reference_is_left_as_is() {
    let mut prog = program(vec![expr_stmt(call(ident("print"), vec![num(1.0)]))]);
    let analysis = analyze(&mut prog).unwrap();
    assert_eq!(reference_names(&prog), vec!["print"]);
    assert!(analysis.scopes.binding_by_unique("print").is_none());
}

#[test]
fn param_shadowing_outer_let() {
    // let n = 1; function f(n) { return n; } n;
    let mut prog = program(vec![
        decl("let", "n", num(1.0)),
        func_decl("f", vec!["n"], vec![ret(ident("n"))]),
        expr_stmt(ident("n")),
    ]);
    analyze(&mut prog).unwrap();
    let refs = reference_names(&prog);
    assert_eq!(refs, vec!["n#1", "n"]);
}

#[test]
fn for_let_binding_scopes_to_the_loop() {
    // for (let i = 0; i < 3; i++) {} ; i  → the trailing i is unresolved
    let mut prog = program(vec![
        json!({
            "type": "ForStatement",
            "init": decl("let", "i", num(0.0)),
            "test": {"type": "BinaryExpression", "operator": "<", "left": ident("i"), "right": num(3.0)},
            "update": {"type": "UpdateExpression", "operator": "++", "prefix": false, "argument": ident("i")},
            "body": block(vec![])
        }),
        expr_stmt(ident("i")),
    ]);
    let analysis = analyze(&mut prog).unwrap();
    let refs = reference_names(&prog);
    // Loop-internal references resolve; the trailing one does not.
    assert_eq!(refs, vec!["i", "i", "i"]);
    assert!(analysis.scopes.binding_by_unique("i").is_some());
    // The trailing reference stayed "i" only because it is unresolved —
    // renaming would have produced i#N had it resolved elsewhere.
}

// ══════════════════════════════════════════════════════════════════════════════
// Redeclaration errors
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn let_redeclaration_fails() {
    let mut prog = program(vec![
        decl("let", "x", num(1.0)),
        decl("let", "x", num(2.0)),
    ]);
    let err = analyze(&mut prog).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Redeclaration);
    assert!(err.message.contains("'x'"));
}

#[test]
fn var_over_let_redeclaration_fails() {
    let mut prog = program(vec![
        decl("let", "x", num(1.0)),
        decl("var", "x", num(2.0)),
    ]);
    assert_eq!(analyze(&mut prog).unwrap_err().kind, ErrorKind::Redeclaration);
}

#[test]
fn var_redeclaration_is_allowed() {
    let mut prog = program(vec![
        decl("var", "x", num(1.0)),
        decl("var", "x", num(2.0)),
    ]);
    assert!(analyze(&mut prog).is_ok());
}

#[test]
fn shadowing_in_inner_scope_is_allowed() {
    let mut prog = program(vec![
        decl("let", "x", num(1.0)),
        block(vec![decl("let", "x", num(2.0))]),
    ]);
    assert!(analyze(&mut prog).is_ok());
}

// ══════════════════════════════════════════════════════════════════════════════
// Capture analysis
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn binding_captured_by_inner_function_is_marked() {
    // function outer() { let n = 0; return function() { return n; }; }
    let mut prog = program(vec![func_decl(
        "outer",
        vec![],
        vec![
            decl("let", "n", num(0.0)),
            ret(func_expr(vec![], vec![ret(ident("n"))])),
        ],
    )]);
    let analysis = analyze(&mut prog).unwrap();
    let b = analysis.scopes.binding_by_unique("n").unwrap();
    assert!(b.captured);
}

#[test]
fn uncaptured_binding_is_not_marked() {
    let mut prog = program(vec![func_decl(
        "f",
        vec![],
        vec![decl("let", "n", num(0.0)), ret(ident("n"))],
    )]);
    let analysis = analyze(&mut prog).unwrap();
    assert!(!analysis.scopes.binding_by_unique("n").unwrap().captured);
}

#[test]
fn transitive_capture_threads_through_intermediate_function() {
    // function a() { let x = 1; return function b() { return function c() { return x; }; }; }
    let inner_c = func_expr(vec![], vec![ret(ident("x"))]);
    let inner_b = func_expr(vec![], vec![ret(inner_c)]);
    let mut prog = program(vec![func_decl(
        "a",
        vec![],
        vec![decl("let", "x", num(1.0)), ret(inner_b)],
    )]);
    let analysis = analyze(&mut prog).unwrap();
    assert!(analysis.scopes.binding_by_unique("x").unwrap().captured);

    // Both nested function scopes list x as free.
    let free_counts = (0..analysis.scopes.len() as u32)
        .map(jetsam_types::estree::ScopeId)
        .filter(|&id| {
            analysis.scopes.get(id).free_vars.iter().any(|f| f == "x")
        })
        .count();
    assert_eq!(free_counts, 2);
}

// ══════════════════════════════════════════════════════════════════════════════
// Side channels & directives
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn eval_call_site_records_scopes_in_force() {
    let mut prog = program(vec![block(vec![expr_stmt(call(
        ident("eval"),
        vec![num(1.0)],
    ))])]);
    analyze(&mut prog).unwrap();
    let StmtKind::Block { body, .. } = &prog.body[0].kind else {
        panic!("expected block");
    };
    let StmtKind::Expression(Expr {
        kind: ExprKind::Call {
            observed_scopes, ..
        },
        ..
    }) = &body[0].kind
    else {
        panic!("expected call");
    };
    let scopes = observed_scopes.as_ref().expect("eval records scopes");
    assert_eq!(scopes.len(), 2); // root + block
}

#[test]
fn plain_calls_record_nothing() {
    let mut prog = program(vec![expr_stmt(call(ident("print"), vec![num(1.0)]))]);
    analyze(&mut prog).unwrap();
    let StmtKind::Expression(Expr {
        kind: ExprKind::Call {
            observed_scopes, ..
        },
        ..
    }) = &prog.body[0].kind
    else {
        panic!("expected call");
    };
    assert!(observed_scopes.is_none());
}

#[test]
fn use_strict_directive_is_detected() {
    let mut prog = program(vec![
        expr_stmt(json!({"type": "Literal", "value": "use strict"})),
        decl("let", "x", num(1.0)),
    ]);
    assert!(analyze(&mut prog).unwrap().strict);

    let mut lax = program(vec![decl("let", "x", num(1.0))]);
    assert!(!analyze(&mut lax).unwrap().strict);
}

// ══════════════════════════════════════════════════════════════════════════════
// Invariants
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn analysis_is_idempotent() {
    let mut prog = program(vec![
        decl("let", "x", num(1.0)),
        block(vec![
            decl("let", "x", num(2.0)),
            expr_stmt(ident("x")),
            func_decl("g", vec!["x"], vec![ret(ident("x"))]),
        ]),
        expr_stmt(ident("x")),
    ]);
    analyze(&mut prog).unwrap();
    let snapshot = prog.clone();
    analyze(&mut prog).unwrap();
    assert_eq!(prog, snapshot);
}

#[test]
fn every_resolved_reference_maps_to_exactly_one_binding() {
    let mut prog = program(vec![
        decl("let", "a", num(1.0)),
        func_decl(
            "f",
            vec!["a", "b"],
            vec![
                decl("var", "c", ident("a")),
                block(vec![decl("let", "a", ident("b")), expr_stmt(ident("a"))]),
                ret(ident("c")),
            ],
        ),
        expr_stmt(call(ident("f"), vec![ident("a"), num(2.0)])),
    ]);
    let analysis = analyze(&mut prog).unwrap();
    for name in reference_names(&prog) {
        let binding = analysis.scopes.binding_by_unique(&name);
        assert!(
            binding.is_some(),
            "reference {name:?} does not resolve to a binding"
        );
    }
    // Uniqueness of unique names is structural: binding_by_unique is a map.
}

#[test]
fn catch_param_is_scoped_to_the_handler() {
    let mut prog = program(vec![
        json!({
            "type": "TryStatement",
            "block": block(vec![]),
            "handler": {
                "type": "CatchClause",
                "param": ident("e"),
                "body": block(vec![expr_stmt(ident("e"))])
            },
            "finalizer": null
        }),
        expr_stmt(ident("e")),
    ]);
    let analysis = analyze(&mut prog).unwrap();
    let refs = reference_names(&prog);
    assert_eq!(refs, vec!["e", "e"]);
    let b = analysis.scopes.binding_by_unique("e").unwrap();
    assert_eq!(b.kind, BindingKind::Catch);
    // The trailing `e` did not resolve (no rename happened, and the catch
    // binding is invisible outside the handler).
}

#[test]
fn pattern_params_other_than_identifiers_survive_analysis() {
    // Destructuring params are not bindings; the generator rejects them.
    let mut prog = program(vec![json!({
        "type": "FunctionDeclaration",
        "id": ident("f"),
        "params": [{"type": "ObjectPattern", "properties": []}],
        "body": block(vec![])
    })]);
    let analysis = analyze(&mut prog).unwrap();
    let StmtKind::FunctionDecl(f) = &prog.body[0].kind else {
        panic!("expected function");
    };
    assert!(matches!(f.params[0], Pattern::Unsupported { .. }));
    assert!(analysis.scopes.len() >= 2);
}
