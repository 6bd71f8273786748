//! Expression lowering.
//!
//! Every expression leaves a (value, type-id) pair on the operand stack
//! and reports a static type hint. Fast paths fire when both operand
//! hints are concrete; otherwise lowering falls back to the runtime
//! helpers of the built-in registry.

use super::{at, FuncBuilder, Generator, Hint, LocalBinding};
use crate::builtins::{self, MathIntrinsic, IMPORT_PRINT_CHAR, IMPORT_TIME, IMPORT_TIME_ORIGIN};
use crate::error::{CodegenError, CodegenResult};
use crate::types::TypeId;
use crate::wasm::{BlockType, Op, ValType};
use jetsam_types::estree::{
    AssignOp, BinOp, Expr, ExprKind, Lit, LogicalOp, UnaryOp, UpdateOp,
};
use jetsam_types::Span;

impl<'a> Generator<'a> {
    /// Lower an expression; leaves `(value, type)` on the stack.
    pub(crate) fn lower_expr(
        &mut self,
        fb: &mut FuncBuilder,
        expr: &'a Expr,
    ) -> CodegenResult<Hint> {
        match &expr.kind {
            ExprKind::Literal(lit) => self.lower_literal(fb, lit),
            ExprKind::Ident(id) => self.lower_ident(fb, &id.name, expr.span),
            ExprKind::Binary { op, left, right } => {
                self.lower_binary(fb, *op, left, right, expr.span)
            }
            ExprKind::Logical { op, left, right } => self.lower_logical(fb, *op, left, right),
            ExprKind::Unary { op, argument } => self.lower_unary(fb, *op, argument, expr.span),
            ExprKind::Update {
                op,
                prefix,
                argument,
            } => self.lower_update(fb, *op, *prefix, argument, expr.span),
            ExprKind::Assign { op, target, value } => {
                self.lower_assign(fb, *op, target, value, expr.span)
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => self.lower_conditional(fb, test, consequent, alternate),
            ExprKind::Call {
                callee,
                args,
                observed_scopes,
            } => self.lower_call(fb, callee, args, observed_scopes.is_some(), expr.span),
            ExprKind::Member {
                object,
                property,
                computed,
            } => self.lower_member_read(fb, object, property, *computed, expr.span),
            ExprKind::Function(node) => self.lower_function_expr(fb, node),
            ExprKind::Sequence(exprs) => {
                let mut hint = Hint::Known(TypeId::Undefined);
                for (i, e) in exprs.iter().enumerate() {
                    hint = self.lower_expr(fb, e)?;
                    if i + 1 != exprs.len() {
                        fb.drop_();
                        fb.drop_();
                    }
                }
                if exprs.is_empty() {
                    self.undefined_pair(fb);
                }
                Ok(hint)
            }
            ExprKind::Unknown { kind } => Err(CodegenError::Unsupported(at(kind, expr.span))),
        }
    }

    /// Static hint without lowering. Used to pick fast paths up front.
    pub(crate) fn hint_of(&self, fb: &FuncBuilder, expr: &Expr) -> Hint {
        match &expr.kind {
            ExprKind::Literal(Lit::Number(_)) => Hint::Known(TypeId::Number),
            ExprKind::Literal(Lit::Str(_)) => Hint::Known(TypeId::String),
            ExprKind::Literal(Lit::Bool(_)) => Hint::Known(TypeId::Boolean),
            ExprKind::Literal(Lit::Null) => Hint::Known(TypeId::Null),
            ExprKind::Ident(id) => match id.name.as_str() {
                "undefined" if fb.lookup(&id.name).is_none() => Hint::Known(TypeId::Undefined),
                "NaN" | "Infinity" if fb.lookup(&id.name).is_none() => {
                    Hint::Known(TypeId::Number)
                }
                name => fb.hint_for(name),
            },
            ExprKind::Binary { op, .. } => match op {
                BinOp::Sub
                | BinOp::Mul
                | BinOp::Div
                | BinOp::Rem
                | BinOp::BitAnd
                | BinOp::BitOr
                | BinOp::BitXor
                | BinOp::Shl
                | BinOp::Shr
                | BinOp::UShr => Hint::Known(TypeId::Number),
                BinOp::Add => Hint::Unknown,
                BinOp::Eq
                | BinOp::Ne
                | BinOp::StrictEq
                | BinOp::StrictNe
                | BinOp::Lt
                | BinOp::Le
                | BinOp::Gt
                | BinOp::Ge => Hint::Known(TypeId::Boolean),
                BinOp::In | BinOp::InstanceOf => Hint::Unknown,
            },
            ExprKind::Unary { op, .. } => match op {
                UnaryOp::Minus | UnaryOp::Plus | UnaryOp::BitNot => Hint::Known(TypeId::Number),
                UnaryOp::Not => Hint::Known(TypeId::Boolean),
                UnaryOp::Typeof => Hint::Known(TypeId::String),
                UnaryOp::Void => Hint::Known(TypeId::Undefined),
                UnaryOp::Delete => Hint::Unknown,
            },
            ExprKind::Update { .. } => Hint::Known(TypeId::Number),
            ExprKind::Assign {
                op: AssignOp::Assign,
                value,
                ..
            } => self.hint_of(fb, value),
            ExprKind::Assign { .. } => Hint::Unknown,
            ExprKind::Function(_) => Hint::Known(TypeId::Function),
            ExprKind::Sequence(exprs) => exprs
                .last()
                .map(|e| self.hint_of(fb, e))
                .unwrap_or(Hint::Known(TypeId::Undefined)),
            _ => Hint::Unknown,
        }
    }

    pub(crate) fn undefined_pair(&self, fb: &mut FuncBuilder) {
        fb.vtc(0.0);
        fb.i32c(TypeId::Undefined.as_i32());
    }

    // ══════════════════════════════════════════════════════════════════════
    // Leaves
    // ══════════════════════════════════════════════════════════════════════

    fn lower_literal(&mut self, fb: &mut FuncBuilder, lit: &Lit) -> CodegenResult<Hint> {
        match lit {
            Lit::Number(n) => {
                fb.vtc(*n);
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            Lit::Str(s) => {
                let ptr = self.pool.intern(s);
                fb.vtc(ptr as f64);
                fb.i32c(TypeId::String.as_i32());
                Ok(Hint::Known(TypeId::String))
            }
            Lit::Bool(b) => {
                fb.vtc(if *b { 1.0 } else { 0.0 });
                fb.i32c(TypeId::Boolean.as_i32());
                Ok(Hint::Known(TypeId::Boolean))
            }
            Lit::Null => {
                fb.vtc(0.0);
                fb.i32c(TypeId::Null.as_i32());
                Ok(Hint::Known(TypeId::Null))
            }
        }
    }

    fn lower_ident(
        &mut self,
        fb: &mut FuncBuilder,
        name: &str,
        span: Span,
    ) -> CodegenResult<Hint> {
        if let Some(binding) = fb.lookup(name) {
            match binding {
                LocalBinding::Direct { value, ty } => {
                    fb.get(value);
                    fb.get(ty);
                }
                LocalBinding::Cell { ptr } => {
                    fb.get(ptr);
                    fb.vt_load(0);
                    fb.get(ptr);
                    fb.load_i32(self.cell_type_offset());
                }
            }
            return Ok(fb.hint_for(name));
        }
        // A direct (environment-free) function used as a value.
        if self.is_direct_function(name) {
            return self.materialize_closure(fb, name);
        }
        match name {
            "undefined" => {
                self.undefined_pair(fb);
                Ok(Hint::Known(TypeId::Undefined))
            }
            "NaN" => {
                match self.vt {
                    ValType::F64 => fb.f64c(f64::NAN),
                    _ => fb.i32c(0),
                }
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            "Infinity" => {
                match self.vt {
                    ValType::F64 => fb.f64c(f64::INFINITY),
                    _ => fb.i32c(i32::MAX),
                }
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            _ => {
                if self.strict() {
                    return Err(CodegenError::TypeCompile(at(
                        &format!("'{name}' is not defined in strict mode"),
                        span,
                    )));
                }
                let (value, ty) = self.global_pair(name);
                fb.u32op(Op::GlobalGet, value);
                fb.u32op(Op::GlobalGet, ty);
                Ok(Hint::Unknown)
            }
        }
    }

    fn lower_function_expr(
        &mut self,
        fb: &mut FuncBuilder,
        node: &'a jetsam_types::estree::FunctionNode,
    ) -> CodegenResult<Hint> {
        let name = match &node.id {
            Some(id) => id.name.clone(),
            None => {
                self.anon_name()
            }
        };
        self.register_user_function(&name, node)?;
        self.materialize_closure(fb, &name)
    }

    // ══════════════════════════════════════════════════════════════════════
    // Operators
    // ══════════════════════════════════════════════════════════════════════

    /// Lower an expression and keep only the value channel, coerced to a
    /// number. The type constant dropped on the fast path is folded away
    /// by the optimizer.
    pub(crate) fn lower_as_number(
        &mut self,
        fb: &mut FuncBuilder,
        expr: &'a Expr,
    ) -> CodegenResult<()> {
        let hint = self.hint_of(fb, expr);
        self.lower_expr(fb, expr)?;
        if hint.is(TypeId::Number) || hint.is(TypeId::Boolean) {
            fb.drop_();
        } else {
            let call = self.request_function("#js_tonumber", false)?;
            fb.ins.push(call);
        }
        Ok(())
    }

    /// Lower an expression to a bare i32 truthiness flag.
    pub(crate) fn lower_truthy(
        &mut self,
        fb: &mut FuncBuilder,
        expr: &'a Expr,
    ) -> CodegenResult<()> {
        let hint = self.hint_of(fb, expr);
        self.lower_expr(fb, expr)?;
        match hint {
            Hint::Known(TypeId::Boolean) => {
                fb.drop_();
                fb.ptr_from_vt();
            }
            _ => {
                let call = self.request_function("#js_truthy", false)?;
                fb.ins.push(call);
            }
        }
        Ok(())
    }

    fn lower_binary(
        &mut self,
        fb: &mut FuncBuilder,
        op: BinOp,
        left: &'a Expr,
        right: &'a Expr,
        span: Span,
    ) -> CodegenResult<Hint> {
        let fast = self.hint_of(fb, left).is(TypeId::Number)
            && self.hint_of(fb, right).is(TypeId::Number);

        match op {
            BinOp::Add => {
                if fast {
                    self.lower_expr(fb, left)?;
                    fb.drop_();
                    self.lower_expr(fb, right)?;
                    fb.drop_();
                    self.num_op(fb, Op::F64Add, Op::I32Add);
                    fb.i32c(TypeId::Number.as_i32());
                    Ok(Hint::Known(TypeId::Number))
                } else {
                    self.lower_expr(fb, left)?;
                    self.lower_expr(fb, right)?;
                    let call = self.request_function("#js_add", false)?;
                    fb.ins.push(call);
                    Ok(Hint::Unknown)
                }
            }
            BinOp::Sub | BinOp::Mul | BinOp::Div => {
                self.lower_as_number(fb, left)?;
                self.lower_as_number(fb, right)?;
                match op {
                    BinOp::Sub => self.num_op(fb, Op::F64Sub, Op::I32Sub),
                    BinOp::Mul => self.num_op(fb, Op::F64Mul, Op::I32Mul),
                    _ => self.num_op(fb, Op::F64Div, Op::I32DivS),
                }
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            BinOp::Rem => {
                self.lower_as_number(fb, left)?;
                self.lower_as_number(fb, right)?;
                let call = self.request_function("#js_fmod", false)?;
                fb.ins.push(call);
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (f64_op, i32_op, helper) = match op {
                    BinOp::Lt => (Op::F64Lt, Op::I32LtS, "#js_lt"),
                    BinOp::Le => (Op::F64Le, Op::I32LeS, "#js_le"),
                    BinOp::Gt => (Op::F64Gt, Op::I32GtS, "#js_gt"),
                    _ => (Op::F64Ge, Op::I32GeS, "#js_ge"),
                };
                if fast {
                    self.lower_expr(fb, left)?;
                    fb.drop_();
                    self.lower_expr(fb, right)?;
                    fb.drop_();
                    self.num_op(fb, f64_op, i32_op);
                    fb.ptr_to_vt();
                    fb.i32c(TypeId::Boolean.as_i32());
                } else {
                    self.lower_expr(fb, left)?;
                    self.lower_expr(fb, right)?;
                    let call = self.request_function(helper, false)?;
                    fb.ins.push(call);
                }
                Ok(Hint::Known(TypeId::Boolean))
            }
            BinOp::Eq | BinOp::Ne | BinOp::StrictEq | BinOp::StrictNe => {
                let negate = matches!(op, BinOp::Ne | BinOp::StrictNe);
                if fast {
                    self.lower_expr(fb, left)?;
                    fb.drop_();
                    self.lower_expr(fb, right)?;
                    fb.drop_();
                    let (f64_op, i32_op) = if negate {
                        (Op::F64Ne, Op::I32Ne)
                    } else {
                        (Op::F64Eq, Op::I32Eq)
                    };
                    self.num_op(fb, f64_op, i32_op);
                    fb.ptr_to_vt();
                } else {
                    let helper = if matches!(op, BinOp::StrictEq | BinOp::StrictNe) {
                        "#js_seq"
                    } else {
                        "#js_eq"
                    };
                    self.lower_expr(fb, left)?;
                    self.lower_expr(fb, right)?;
                    let call = self.request_function(helper, false)?;
                    fb.ins.push(call);
                    fb.drop_();
                    if negate {
                        fb.ptr_from_vt();
                        fb.op(Op::I32Eqz);
                        fb.ptr_to_vt();
                    }
                }
                fb.i32c(TypeId::Boolean.as_i32());
                Ok(Hint::Known(TypeId::Boolean))
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
            | BinOp::UShr => {
                self.lower_as_number(fb, left)?;
                fb.vt_to_i32();
                self.lower_as_number(fb, right)?;
                fb.vt_to_i32();
                let i32_op = match op {
                    BinOp::BitAnd => Op::I32And,
                    BinOp::BitOr => Op::I32Or,
                    BinOp::BitXor => Op::I32Xor,
                    BinOp::Shl => Op::I32Shl,
                    BinOp::Shr => Op::I32ShrS,
                    _ => Op::I32ShrU,
                };
                fb.op(i32_op);
                if op == BinOp::UShr {
                    fb.ptr_to_vt();
                } else {
                    fb.i32_to_vt();
                }
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            BinOp::In => Err(CodegenError::Unsupported(at("'in' operator", span))),
            BinOp::InstanceOf => {
                Err(CodegenError::Unsupported(at("'instanceof' operator", span)))
            }
        }
    }

    fn num_op(&self, fb: &mut FuncBuilder, f64_op: Op, i32_op: Op) {
        match self.vt {
            ValType::F64 => fb.op(f64_op),
            _ => fb.op(i32_op),
        }
    }

    fn lower_logical(
        &mut self,
        fb: &mut FuncBuilder,
        op: LogicalOp,
        left: &'a Expr,
        right: &'a Expr,
    ) -> CodegenResult<Hint> {
        let (sv, st) = fb.scratch_pair();
        self.lower_expr(fb, left)?;
        fb.set(st);
        fb.set(sv);
        match op {
            LogicalOp::And | LogicalOp::Or => {
                fb.get(sv);
                fb.get(st);
                let call = self.request_function("#js_truthy", false)?;
                fb.ins.push(call);
                if op == LogicalOp::Or {
                    fb.op(Op::I32Eqz);
                }
            }
            LogicalOp::Nullish => {
                // evaluate the right side only for undefined/null
                fb.get(st);
                fb.i32c(TypeId::Null.as_i32());
                fb.op(Op::I32LeS);
            }
        }
        fb.begin_if(BlockType::Empty);
        self.lower_expr(fb, right)?;
        fb.set(st);
        fb.set(sv);
        fb.end_frame();
        fb.get(sv);
        fb.get(st);
        Ok(Hint::Unknown)
    }

    fn lower_conditional(
        &mut self,
        fb: &mut FuncBuilder,
        test: &'a Expr,
        consequent: &'a Expr,
        alternate: &'a Expr,
    ) -> CodegenResult<Hint> {
        let (sv, st) = fb.scratch_pair();
        self.lower_truthy(fb, test)?;
        fb.begin_if(BlockType::Empty);
        self.lower_expr(fb, consequent)?;
        fb.set(st);
        fb.set(sv);
        fb.else_();
        self.lower_expr(fb, alternate)?;
        fb.set(st);
        fb.set(sv);
        fb.end_frame();
        fb.get(sv);
        fb.get(st);
        Ok(Hint::Unknown)
    }

    fn lower_unary(
        &mut self,
        fb: &mut FuncBuilder,
        op: UnaryOp,
        argument: &'a Expr,
        span: Span,
    ) -> CodegenResult<Hint> {
        match op {
            UnaryOp::Minus => {
                if self.vt == ValType::F64 {
                    self.lower_as_number(fb, argument)?;
                    fb.op(Op::F64Neg);
                } else {
                    fb.i32c(0);
                    self.lower_as_number(fb, argument)?;
                    fb.op(Op::I32Sub);
                }
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            UnaryOp::Plus => {
                self.lower_as_number(fb, argument)?;
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            UnaryOp::Not => {
                self.lower_truthy(fb, argument)?;
                fb.op(Op::I32Eqz);
                fb.ptr_to_vt();
                fb.i32c(TypeId::Boolean.as_i32());
                Ok(Hint::Known(TypeId::Boolean))
            }
            UnaryOp::BitNot => {
                self.lower_as_number(fb, argument)?;
                fb.vt_to_i32();
                fb.i32c(-1);
                fb.op(Op::I32Xor);
                fb.i32_to_vt();
                fb.i32c(TypeId::Number.as_i32());
                Ok(Hint::Known(TypeId::Number))
            }
            UnaryOp::Typeof => {
                // typeof never throws, even on undeclared names.
                self.lower_expr(fb, argument)?;
                let (_, st) = fb.scratch_pair();
                fb.set(st);
                fb.drop_();
                fb.get(st);
                let call = self.request_function("#typeof_name", false)?;
                fb.ins.push(call);
                fb.ptr_to_vt();
                fb.i32c(TypeId::String.as_i32());
                Ok(Hint::Known(TypeId::String))
            }
            UnaryOp::Void => {
                self.lower_expr(fb, argument)?;
                fb.drop_();
                fb.drop_();
                self.undefined_pair(fb);
                Ok(Hint::Known(TypeId::Undefined))
            }
            UnaryOp::Delete => Err(CodegenError::Unsupported(at("'delete' operator", span))),
        }
    }

    fn lower_update(
        &mut self,
        fb: &mut FuncBuilder,
        op: UpdateOp,
        prefix: bool,
        argument: &'a Expr,
        span: Span,
    ) -> CodegenResult<Hint> {
        let ExprKind::Ident(id) = &argument.kind else {
            return Err(CodegenError::Unsupported(at(
                "update of a non-identifier",
                span,
            )));
        };
        let name = id.name.clone();
        let old = fb.temp(self.vt);
        let new = fb.temp(self.vt);

        self.lower_as_number(fb, argument)?;
        fb.set(old);
        fb.get(old);
        fb.vtc(1.0);
        match op {
            UpdateOp::Inc => self.num_op(fb, Op::F64Add, Op::I32Add),
            UpdateOp::Dec => self.num_op(fb, Op::F64Sub, Op::I32Sub),
        }
        fb.set(new);

        fb.get(new);
        fb.i32c(TypeId::Number.as_i32());
        self.store_binding(fb, &name, span)?;
        fb.set_hint(&name, Hint::Known(TypeId::Number));

        fb.get(if prefix { new } else { old });
        fb.i32c(TypeId::Number.as_i32());
        Ok(Hint::Known(TypeId::Number))
    }

    fn lower_assign(
        &mut self,
        fb: &mut FuncBuilder,
        op: AssignOp,
        target: &'a Expr,
        value: &'a Expr,
        span: Span,
    ) -> CodegenResult<Hint> {
        let ExprKind::Ident(id) = &target.kind else {
            return Err(CodegenError::Unsupported(at(
                "assignment to a non-identifier",
                span,
            )));
        };
        let name = id.name.clone();

        // Logical compounds short-circuit: the store happens only when
        // the right side is evaluated.
        if matches!(op, AssignOp::And | AssignOp::Or | AssignOp::Nullish) {
            return self.lower_logical_assign(fb, op, &name, value, span);
        }

        let hint = match op {
            AssignOp::Assign => self.lower_expr(fb, value)?,
            AssignOp::Add => {
                self.lower_expr(fb, target)?;
                self.lower_expr(fb, value)?;
                let call = self.request_function("#js_add", false)?;
                fb.ins.push(call);
                Hint::Unknown
            }
            AssignOp::Sub | AssignOp::Mul | AssignOp::Div | AssignOp::Rem => {
                self.lower_as_number(fb, target)?;
                self.lower_as_number(fb, value)?;
                match op {
                    AssignOp::Sub => self.num_op(fb, Op::F64Sub, Op::I32Sub),
                    AssignOp::Mul => self.num_op(fb, Op::F64Mul, Op::I32Mul),
                    AssignOp::Div => self.num_op(fb, Op::F64Div, Op::I32DivS),
                    _ => {
                        let call = self.request_function("#js_fmod", false)?;
                        fb.ins.push(call);
                    }
                }
                fb.i32c(TypeId::Number.as_i32());
                Hint::Known(TypeId::Number)
            }
            AssignOp::BitAnd
            | AssignOp::BitOr
            | AssignOp::BitXor
            | AssignOp::Shl
            | AssignOp::Shr
            | AssignOp::UShr => {
                self.lower_as_number(fb, target)?;
                fb.vt_to_i32();
                self.lower_as_number(fb, value)?;
                fb.vt_to_i32();
                let i32_op = match op {
                    AssignOp::BitAnd => Op::I32And,
                    AssignOp::BitOr => Op::I32Or,
                    AssignOp::BitXor => Op::I32Xor,
                    AssignOp::Shl => Op::I32Shl,
                    AssignOp::Shr => Op::I32ShrS,
                    _ => Op::I32ShrU,
                };
                fb.op(i32_op);
                if op == AssignOp::UShr {
                    fb.ptr_to_vt();
                } else {
                    fb.i32_to_vt();
                }
                fb.i32c(TypeId::Number.as_i32());
                Hint::Known(TypeId::Number)
            }
            AssignOp::And | AssignOp::Or | AssignOp::Nullish => unreachable!("handled above"),
        };

        // Keep the pair around: assignment is an expression.
        let tv = fb.temp(self.vt);
        let tt = fb.temp(ValType::I32);
        fb.set(tt);
        fb.set(tv);
        fb.get(tv);
        fb.get(tt);
        self.store_binding(fb, &name, span)?;
        fb.set_hint(&name, hint);
        fb.get(tv);
        fb.get(tt);
        Ok(hint)
    }

    /// `&&=` / `||=` / `??=`: test the current value, then evaluate the
    /// right side and store it only on the assigning path. The result is
    /// whichever pair ends up in the binding.
    fn lower_logical_assign(
        &mut self,
        fb: &mut FuncBuilder,
        op: AssignOp,
        name: &str,
        value: &'a Expr,
        span: Span,
    ) -> CodegenResult<Hint> {
        let tv = fb.temp(self.vt);
        let tt = fb.temp(ValType::I32);

        self.lower_ident(fb, name, span)?;
        fb.set(tt);
        fb.set(tv);
        match op {
            AssignOp::And | AssignOp::Or => {
                fb.get(tv);
                fb.get(tt);
                let call = self.request_function("#js_truthy", false)?;
                fb.ins.push(call);
                if op == AssignOp::Or {
                    fb.op(Op::I32Eqz);
                }
            }
            AssignOp::Nullish => {
                fb.get(tt);
                fb.i32c(TypeId::Null.as_i32());
                fb.op(Op::I32LeS);
            }
            _ => unreachable!("not a logical assignment"),
        }
        fb.begin_if(BlockType::Empty);
        self.lower_expr(fb, value)?;
        fb.set(tt);
        fb.set(tv);
        fb.get(tv);
        fb.get(tt);
        self.store_binding(fb, name, span)?;
        fb.end_frame();
        fb.set_hint(name, Hint::Unknown);
        fb.get(tv);
        fb.get(tt);
        Ok(Hint::Unknown)
    }

    /// Store a `(value, type)` pair from the stack into a binding.
    pub(crate) fn store_binding(
        &mut self,
        fb: &mut FuncBuilder,
        name: &str,
        span: Span,
    ) -> CodegenResult<()> {
        if let Some(binding) = fb.lookup(name) {
            match binding {
                LocalBinding::Direct { value, ty } => {
                    fb.set(ty);
                    fb.set(value);
                }
                LocalBinding::Cell { ptr } => {
                    let (sv, st) = fb.scratch_pair();
                    fb.set(st);
                    fb.set(sv);
                    fb.get(ptr);
                    fb.get(sv);
                    fb.vt_store(0);
                    fb.get(ptr);
                    fb.get(st);
                    fb.store_i32(self.cell_type_offset());
                }
            }
            return Ok(());
        }
        if self.decls.contains_key(name) {
            return Err(CodegenError::Unsupported(at(
                &format!("assignment to function declaration '{name}'"),
                span,
            )));
        }
        if self.strict() {
            return Err(CodegenError::TypeCompile(at(
                &format!("assignment to undeclared '{name}' in strict mode"),
                span,
            )));
        }
        let (value, ty) = self.global_pair(name);
        fb.u32op(Op::GlobalSet, ty);
        fb.u32op(Op::GlobalSet, value);
        Ok(())
    }

    // ══════════════════════════════════════════════════════════════════════
    // Calls
    // ══════════════════════════════════════════════════════════════════════

    fn lower_call(
        &mut self,
        fb: &mut FuncBuilder,
        callee: &'a Expr,
        args: &'a [Expr],
        observes_scope: bool,
        span: Span,
    ) -> CodegenResult<Hint> {
        if observes_scope {
            return Err(CodegenError::Unsupported(at(
                "dynamic code evaluation",
                span,
            )));
        }

        // Registry globals and direct declarations first.
        if let ExprKind::Ident(id) = &callee.kind {
            if fb.lookup(&id.name).is_none() {
                match id.name.as_str() {
                    "print" => return self.lower_print(fb, args),
                    "printChar" => return self.lower_print_char(fb, args),
                    _ => {}
                }
                if self.is_direct_function(&id.name) {
                    return self.lower_direct_call(fb, &id.name, args);
                }
            }
        }

        if let ExprKind::Member {
            object,
            property,
            computed,
        } = &callee.kind
        {
            return self.lower_method_call(fb, object, property, *computed, args, span);
        }

        self.lower_indirect_call(fb, callee, args)
    }

    fn lower_print(&mut self, fb: &mut FuncBuilder, args: &'a [Expr]) -> CodegenResult<Hint> {
        match args.first() {
            Some(arg) => {
                self.lower_expr(fb, arg)?;
            }
            None => self.undefined_pair(fb),
        }
        let call = self.request_function("#print_value", false)?;
        fb.ins.push(call);
        for extra in args.iter().skip(1) {
            self.lower_expr(fb, extra)?;
            fb.drop_();
            fb.drop_();
        }
        self.undefined_pair(fb);
        Ok(Hint::Known(TypeId::Undefined))
    }

    fn lower_print_char(
        &mut self,
        fb: &mut FuncBuilder,
        args: &'a [Expr],
    ) -> CodegenResult<Hint> {
        match args.first() {
            Some(arg) => {
                self.lower_as_number(fb, arg)?;
                fb.vt_to_i32();
            }
            None => fb.i32c(0),
        }
        fb.u32op(Op::Call, IMPORT_PRINT_CHAR);
        for extra in args.iter().skip(1) {
            self.lower_expr(fb, extra)?;
            fb.drop_();
            fb.drop_();
        }
        self.undefined_pair(fb);
        Ok(Hint::Known(TypeId::Undefined))
    }

    fn lower_direct_call(
        &mut self,
        fb: &mut FuncBuilder,
        name: &str,
        args: &'a [Expr],
    ) -> CodegenResult<Hint> {
        let arity = self.decls[name].params.len();
        fb.i32c(0); // no environment
        for arg in args.iter().take(arity) {
            self.lower_expr(fb, arg)?;
        }
        for _ in args.len()..arity {
            self.undefined_pair(fb);
        }
        let call = self.request_function(name, false)?;
        fb.ins.push(call);
        // Arguments beyond the arity still evaluate, in order, after the
        // call's operands; their results are discarded.
        if args.len() > arity {
            let tv = fb.temp(self.vt);
            let tt = fb.temp(ValType::I32);
            fb.set(tt);
            fb.set(tv);
            for extra in args.iter().skip(arity) {
                self.lower_expr(fb, extra)?;
                fb.drop_();
                fb.drop_();
            }
            fb.get(tv);
            fb.get(tt);
        }
        Ok(Hint::Unknown)
    }

    fn lower_indirect_call(
        &mut self,
        fb: &mut FuncBuilder,
        callee: &'a Expr,
        args: &'a [Expr],
    ) -> CodegenResult<Hint> {
        let rec = fb.temp(ValType::I32);

        self.lower_expr(fb, callee)?;
        // callee must be a function value
        fb.i32c(TypeId::Function.as_i32());
        fb.op(Op::I32Ne);
        fb.begin_if(BlockType::Empty);
        fb.op(Op::Unreachable);
        fb.end_frame();
        fb.ptr_from_vt();
        fb.set(rec);

        fb.get(rec);
        fb.load_i32(4); // environment pointer
        for arg in args {
            self.lower_expr(fb, arg)?;
        }
        fb.get(rec);
        fb.load_i32(0); // table slot
        let (params, results) = self.user_signature(args.len());
        let type_idx = self.module.type_index(params, results);
        fb.ins.push(crate::ir::Instr::with(
            Op::CallIndirect,
            vec![
                crate::ir::Operand::U32(type_idx),
                crate::ir::Operand::U32(0),
            ],
        ));
        Ok(Hint::Unknown)
    }

    fn lower_method_call(
        &mut self,
        fb: &mut FuncBuilder,
        object: &'a Expr,
        property: &'a Expr,
        computed: bool,
        args: &'a [Expr],
        span: Span,
    ) -> CodegenResult<Hint> {
        if computed {
            return Err(CodegenError::Unsupported(at(
                "computed member call",
                span,
            )));
        }
        let ExprKind::Ident(prop) = &property.kind else {
            return Err(CodegenError::Unsupported(at("member call", span)));
        };

        // Namespace members: Math, Date, performance.
        if let ExprKind::Ident(base) = &object.kind {
            if fb.lookup(&base.name).is_none() {
                match (base.name.as_str(), prop.name.as_str()) {
                    ("Math", m) => {
                        if let Some(intrinsic) = builtins::math_intrinsic(m) {
                            return self.lower_math(fb, intrinsic, m, args, span);
                        }
                        return Err(CodegenError::Unsupported(at(
                            &format!("Math.{m}"),
                            span,
                        )));
                    }
                    ("Date", "now") => {
                        fb.u32op(Op::Call, IMPORT_TIME_ORIGIN);
                        fb.u32op(Op::Call, IMPORT_TIME);
                        fb.op(Op::F64Add);
                        if self.vt != ValType::F64 {
                            fb.op(Op::I32TruncSatF64S);
                        }
                        fb.i32c(TypeId::Number.as_i32());
                        return Ok(Hint::Known(TypeId::Number));
                    }
                    ("performance", "now") => {
                        fb.u32op(Op::Call, IMPORT_TIME);
                        if self.vt != ValType::F64 {
                            fb.op(Op::I32TruncSatF64S);
                        }
                        fb.i32c(TypeId::Number.as_i32());
                        return Ok(Hint::Known(TypeId::Number));
                    }
                    _ => {}
                }
            }
        }

        self.lower_prototype_dispatch(fb, object, &prop.name, Some(args), span)
    }

    fn lower_math(
        &mut self,
        fb: &mut FuncBuilder,
        intrinsic: MathIntrinsic,
        name: &str,
        args: &'a [Expr],
        span: Span,
    ) -> CodegenResult<Hint> {
        let needed = match intrinsic {
            MathIntrinsic::Unary(_) | MathIntrinsic::Helper(_) => 1,
            MathIntrinsic::Binary(_) => 2,
        };
        if args.len() != needed {
            return Err(CodegenError::Unsupported(at(
                &format!("Math.{name} with {} arguments", args.len()),
                span,
            )));
        }
        for arg in args {
            self.lower_as_number(fb, arg)?;
        }
        match intrinsic {
            MathIntrinsic::Helper(helper) => {
                let call = self.request_function(helper, false)?;
                fb.ins.push(call);
            }
            MathIntrinsic::Unary(op) | MathIntrinsic::Binary(op) => {
                if self.vt == ValType::F64 {
                    fb.op(op);
                } else {
                    self.lower_math_i32(fb, intrinsic, name, span)?;
                }
            }
        }
        fb.i32c(TypeId::Number.as_i32());
        Ok(Hint::Known(TypeId::Number))
    }

    /// Integer value type: rounding is the identity, `abs`/`min`/`max`
    /// have branch-free encodings, `sqrt` has no integer counterpart.
    fn lower_math_i32(
        &mut self,
        fb: &mut FuncBuilder,
        intrinsic: MathIntrinsic,
        name: &str,
        span: Span,
    ) -> CodegenResult<()> {
        match (name, intrinsic) {
            ("floor" | "ceil" | "trunc", _) => {}
            ("abs", _) => {
                let t = fb.temp(ValType::I32);
                fb.set(t);
                fb.get(t);
                fb.get(t);
                fb.i32c(31);
                fb.op(Op::I32ShrS);
                fb.op(Op::I32Xor);
                fb.get(t);
                fb.i32c(31);
                fb.op(Op::I32ShrS);
                fb.op(Op::I32Sub);
            }
            ("min" | "max", _) => {
                let a = fb.temp(ValType::I32);
                let b = fb.temp(ValType::I32);
                fb.set(b);
                fb.set(a);
                fb.get(a);
                fb.get(b);
                fb.get(a);
                fb.get(b);
                fb.op(if name == "min" { Op::I32LtS } else { Op::I32GtS });
                fb.op(Op::Select);
            }
            _ => {
                return Err(CodegenError::Unsupported(at(
                    &format!("Math.{name} with the i32 value type"),
                    span,
                )))
            }
        }
        Ok(())
    }

    /// Member access through the prototype table, keyed by base type-id ×
    /// property name. A statically unknown base dispatches through a
    /// runtime type check and traps on mismatch.
    fn lower_prototype_dispatch(
        &mut self,
        fb: &mut FuncBuilder,
        object: &'a Expr,
        prop: &str,
        args: Option<&'a [Expr]>,
        span: Span,
    ) -> CodegenResult<Hint> {
        let base_hint = self.hint_of(fb, object);
        let (owner, entry) = match base_hint {
            Hint::Known(ty) => match builtins::prototype_method(ty, prop) {
                Some(e) => (ty, e),
                None => {
                    return Err(CodegenError::Unsupported(at(
                        &format!("property '{prop}' of {ty:?} values", ),
                        span,
                    )))
                }
            },
            Hint::Unknown => match builtins::prototype_method(TypeId::String, prop) {
                Some(e) => (TypeId::String, e),
                None => {
                    return Err(CodegenError::Unsupported(at(
                        &format!("property '{prop}'"),
                        span,
                    )))
                }
            },
        };
        match (args, entry.property) {
            (Some(_), true) => {
                return Err(CodegenError::Unsupported(at(
                    &format!("call of property '{prop}'"),
                    span,
                )))
            }
            (None, false) => {
                return Err(CodegenError::Unsupported(at(
                    &format!("method '{prop}' used as a value"),
                    span,
                )))
            }
            _ => {}
        }

        self.lower_expr(fb, object)?;
        if base_hint == Hint::Unknown {
            // runtime check before dispatching on the assumed type
            let (sv, st) = fb.scratch_pair();
            fb.set(st);
            fb.set(sv);
            fb.get(st);
            fb.i32c(owner.as_i32());
            fb.op(Op::I32Ne);
            fb.begin_if(BlockType::Empty);
            fb.op(Op::Unreachable);
            fb.end_frame();
            fb.get(sv);
            fb.get(st);
        }
        let args = args.unwrap_or(&[]);
        for arg in args.iter().take(entry.argc) {
            self.lower_expr(fb, arg)?;
        }
        for _ in args.len()..entry.argc {
            self.undefined_pair(fb);
        }
        let call = self.request_function(entry.helper, false)?;
        fb.ins.push(call);
        if args.len() > entry.argc {
            let tv = fb.temp(self.vt);
            let tt = fb.temp(ValType::I32);
            fb.set(tt);
            fb.set(tv);
            for extra in args.iter().skip(entry.argc) {
                self.lower_expr(fb, extra)?;
                fb.drop_();
                fb.drop_();
            }
            fb.get(tv);
            fb.get(tt);
        }
        Ok(Hint::Unknown)
    }

    fn lower_member_read(
        &mut self,
        fb: &mut FuncBuilder,
        object: &'a Expr,
        property: &'a Expr,
        computed: bool,
        span: Span,
    ) -> CodegenResult<Hint> {
        if computed {
            return Err(CodegenError::Unsupported(at("computed member access", span)));
        }
        let ExprKind::Ident(prop) = &property.kind else {
            return Err(CodegenError::Unsupported(at("member access", span)));
        };
        self.lower_prototype_dispatch(fb, object, &prop.name, None, span)
    }

    fn anon_name(&mut self) -> String {
        self.anon_counter += 1;
        format!("#fn{}", self.anon_counter)
    }
}
