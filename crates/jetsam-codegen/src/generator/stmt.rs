//! Statement lowering.
//!
//! Statements leave the operand stack balanced. Loops follow one shape: a
//! labeled outer block for `break`, a `loop` for the back-edge, and an
//! inner labeled block whose end is where `continue` lands.

use super::{at, FuncBuilder, Frame, Generator, Hint};
use crate::error::{CodegenError, CodegenResult};
use crate::ir::Instr;
use crate::wasm::{BlockType, Op};
use jetsam_types::estree::{
    CatchClause, Expr, ExprKind, ForInit, Pattern, Stmt, StmtKind,
};
use std::collections::HashSet;

impl<'a> Generator<'a> {
    pub(crate) fn lower_stmt(&mut self, fb: &mut FuncBuilder, stmt: &'a Stmt) -> CodegenResult<()> {
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.lower_expr(fb, expr)?;
                match fb.completion {
                    Some((cv, ct)) => {
                        fb.set(ct);
                        fb.set(cv);
                    }
                    None => {
                        fb.drop_();
                        fb.drop_();
                    }
                }
                Ok(())
            }
            StmtKind::VarDecl { decls, .. } => {
                for decl in decls {
                    let Pattern::Ident(id) = &decl.id else {
                        return Err(CodegenError::Unsupported(at(
                            "destructuring declaration",
                            decl.span,
                        )));
                    };
                    if let Some(init) = &decl.init {
                        let hint = self.lower_expr(fb, init)?;
                        self.store_binding(fb, &id.name, decl.span)?;
                        fb.set_hint(&id.name, hint);
                    }
                    // No initializer: locals and cells already read back
                    // as undefined.
                }
                Ok(())
            }
            // Handled during hoisting and in the prologue.
            StmtKind::FunctionDecl(_) => Ok(()),
            StmtKind::Return(arg) => {
                match arg {
                    Some(expr) => {
                        self.lower_expr(fb, expr)?;
                    }
                    None => self.undefined_pair(fb),
                }
                fb.op(Op::Return);
                Ok(())
            }
            StmtKind::If {
                test,
                consequent,
                alternate,
            } => {
                self.lower_truthy(fb, test)?;
                fb.begin_if(BlockType::Empty);
                self.lower_stmt(fb, consequent)?;
                if let Some(alt) = alternate {
                    fb.else_();
                    self.lower_stmt(fb, alt)?;
                }
                fb.end_frame();
                Ok(())
            }
            StmtKind::Block { body, .. } => {
                // Scoping is already settled by the analyzer; the label
                // itself carries no branches.
                fb.begin_block(Frame::Plain);
                for s in body {
                    self.lower_stmt(fb, s)?;
                }
                fb.end_frame();
                Ok(())
            }
            StmtKind::While { test, body } => {
                let mut assigned = HashSet::new();
                collect_assigned_expr(test, &mut assigned);
                collect_assigned_stmt(body, &mut assigned);
                fb.invalidate_hints(&assigned);

                fb.begin_block(Frame::BreakTarget);
                fb.begin_loop();
                self.lower_truthy(fb, test)?;
                fb.op(Op::I32Eqz);
                let brk = fb.frame_depth(Frame::BreakTarget).expect("just pushed");
                fb.u32op(Op::BrIf, brk);
                fb.begin_block(Frame::ContinueTarget);
                self.lower_stmt(fb, body)?;
                fb.end_frame();
                fb.u32op(Op::Br, 0);
                fb.end_frame();
                fb.end_frame();
                Ok(())
            }
            StmtKind::DoWhile { body, test } => {
                let mut assigned = HashSet::new();
                collect_assigned_stmt(body, &mut assigned);
                collect_assigned_expr(test, &mut assigned);
                fb.invalidate_hints(&assigned);

                fb.begin_block(Frame::BreakTarget);
                fb.begin_loop();
                fb.begin_block(Frame::ContinueTarget);
                self.lower_stmt(fb, body)?;
                fb.end_frame();
                self.lower_truthy(fb, test)?;
                fb.u32op(Op::BrIf, 0);
                fb.end_frame();
                fb.end_frame();
                Ok(())
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
                ..
            } => {
                match init {
                    Some(ForInit::Decl(decl)) => self.lower_stmt(fb, decl)?,
                    Some(ForInit::Expr(expr)) => {
                        self.lower_expr(fb, expr)?;
                        fb.drop_();
                        fb.drop_();
                    }
                    None => {}
                }
                let mut assigned = HashSet::new();
                if let Some(test) = test {
                    collect_assigned_expr(test, &mut assigned);
                }
                if let Some(update) = update {
                    collect_assigned_expr(update, &mut assigned);
                }
                collect_assigned_stmt(body, &mut assigned);
                fb.invalidate_hints(&assigned);

                fb.begin_block(Frame::BreakTarget);
                fb.begin_loop();
                if let Some(test) = test {
                    self.lower_truthy(fb, test)?;
                    fb.op(Op::I32Eqz);
                    let brk = fb.frame_depth(Frame::BreakTarget).expect("just pushed");
                    fb.u32op(Op::BrIf, brk);
                }
                fb.begin_block(Frame::ContinueTarget);
                self.lower_stmt(fb, body)?;
                fb.end_frame();
                if let Some(update) = update {
                    self.lower_expr(fb, update)?;
                    fb.drop_();
                    fb.drop_();
                }
                fb.u32op(Op::Br, 0);
                fb.end_frame();
                fb.end_frame();
                Ok(())
            }
            StmtKind::Break => match fb.frame_depth(Frame::BreakTarget) {
                Some(depth) => {
                    fb.u32op(Op::Br, depth);
                    Ok(())
                }
                None => Err(CodegenError::Unsupported(at(
                    "break outside of a loop",
                    stmt.span,
                ))),
            },
            StmtKind::Continue => match fb.frame_depth(Frame::ContinueTarget) {
                Some(depth) => {
                    fb.u32op(Op::Br, depth);
                    Ok(())
                }
                None => Err(CodegenError::Unsupported(at(
                    "continue outside of a loop",
                    stmt.span,
                ))),
            },
            StmtKind::Throw(expr) => {
                let tag = self.exception_tag();
                self.lower_expr(fb, expr)?;
                fb.ins.push(Instr::u32(Op::Throw, tag));
                Ok(())
            }
            StmtKind::Try {
                block,
                handler,
                finalizer,
                ..
            } => self.lower_try(fb, block, handler.as_ref(), finalizer.as_deref()),
            StmtKind::Empty => Ok(()),
            StmtKind::Unknown { kind } => {
                Err(CodegenError::Unsupported(at(kind, stmt.span)))
            }
        }
    }

    /// `try`/`catch`/`finally`. The finalizer is emitted twice: once in a
    /// `catch_all` arm that rethrows, once on the fall-through path.
    fn lower_try(
        &mut self,
        fb: &mut FuncBuilder,
        block: &'a [Stmt],
        handler: Option<&'a CatchClause>,
        finalizer: Option<&'a [Stmt]>,
    ) -> CodegenResult<()> {
        let tag = self.exception_tag();

        fb.begin_try();
        for s in block {
            self.lower_stmt(fb, s)?;
        }
        if let Some(clause) = handler {
            fb.ins.push(Instr::u32(Op::Catch, tag));
            // The tag's (value, type) parameters are on the stack.
            match &clause.param {
                Some(Pattern::Ident(id)) => {
                    let name = id.name.clone();
                    self.store_binding(fb, &name, clause.span)?;
                    fb.set_hint(&name, Hint::Unknown);
                }
                Some(Pattern::Unsupported { kind, span }) => {
                    return Err(CodegenError::Unsupported(at(kind, *span)));
                }
                None => {
                    fb.drop_();
                    fb.drop_();
                }
            }
            for s in &clause.body {
                self.lower_stmt(fb, s)?;
            }
        }
        if let Some(fin) = finalizer {
            fb.op(Op::CatchAll);
            for s in fin {
                self.lower_stmt(fb, s)?;
            }
            fb.u32op(Op::Rethrow, 0);
        }
        fb.end_frame();
        if let Some(fin) = finalizer {
            for s in fin {
                self.lower_stmt(fb, s)?;
            }
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Assignment pre-scan for hint invalidation
// ══════════════════════════════════════════════════════════════════════════════

/// Names assigned anywhere in a loop, gathered before lowering it so a
/// read early in the body cannot trust a hint the back-edge invalidates.
/// Nested functions are skipped: anything they touch is a cell or a
/// global, and those never carry hints.
fn collect_assigned_stmt(stmt: &Stmt, out: &mut HashSet<String>) {
    match &stmt.kind {
        StmtKind::Expression(e) | StmtKind::Throw(e) => collect_assigned_expr(e, out),
        StmtKind::VarDecl { decls, .. } => {
            for d in decls {
                if let Some(init) = &d.init {
                    collect_assigned_expr(init, out);
                }
                if let Pattern::Ident(id) = &d.id {
                    out.insert(id.name.clone());
                }
            }
        }
        StmtKind::Return(Some(e)) => collect_assigned_expr(e, out),
        StmtKind::If {
            test,
            consequent,
            alternate,
        } => {
            collect_assigned_expr(test, out);
            collect_assigned_stmt(consequent, out);
            if let Some(alt) = alternate {
                collect_assigned_stmt(alt, out);
            }
        }
        StmtKind::Block { body, .. } => body.iter().for_each(|s| collect_assigned_stmt(s, out)),
        StmtKind::While { test, body } => {
            collect_assigned_expr(test, out);
            collect_assigned_stmt(body, out);
        }
        StmtKind::DoWhile { body, test } => {
            collect_assigned_stmt(body, out);
            collect_assigned_expr(test, out);
        }
        StmtKind::For {
            init,
            test,
            update,
            body,
            ..
        } => {
            match init {
                Some(ForInit::Decl(d)) => collect_assigned_stmt(d, out),
                Some(ForInit::Expr(e)) => collect_assigned_expr(e, out),
                None => {}
            }
            if let Some(t) = test {
                collect_assigned_expr(t, out);
            }
            if let Some(u) = update {
                collect_assigned_expr(u, out);
            }
            collect_assigned_stmt(body, out);
        }
        StmtKind::Try {
            block,
            handler,
            finalizer,
            ..
        } => {
            block.iter().for_each(|s| collect_assigned_stmt(s, out));
            if let Some(h) = handler {
                if let Some(Pattern::Ident(id)) = &h.param {
                    out.insert(id.name.clone());
                }
                h.body.iter().for_each(|s| collect_assigned_stmt(s, out));
            }
            if let Some(f) = finalizer {
                f.iter().for_each(|s| collect_assigned_stmt(s, out));
            }
        }
        _ => {}
    }
}

fn collect_assigned_expr(expr: &Expr, out: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::Assign { target, value, .. } => {
            if let ExprKind::Ident(id) = &target.kind {
                out.insert(id.name.clone());
            }
            collect_assigned_expr(value, out);
        }
        ExprKind::Update { argument, .. } => {
            if let ExprKind::Ident(id) = &argument.kind {
                out.insert(id.name.clone());
            }
        }
        ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
            collect_assigned_expr(left, out);
            collect_assigned_expr(right, out);
        }
        ExprKind::Unary { argument, .. } => collect_assigned_expr(argument, out),
        ExprKind::Conditional {
            test,
            consequent,
            alternate,
        } => {
            collect_assigned_expr(test, out);
            collect_assigned_expr(consequent, out);
            collect_assigned_expr(alternate, out);
        }
        ExprKind::Call { callee, args, .. } => {
            collect_assigned_expr(callee, out);
            args.iter().for_each(|a| collect_assigned_expr(a, out));
        }
        ExprKind::Member { object, .. } => collect_assigned_expr(object, out),
        ExprKind::Sequence(exprs) => exprs.iter().for_each(|e| collect_assigned_expr(e, out)),
        _ => {}
    }
}
