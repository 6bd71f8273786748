//! IR lowering: annotated ESTree tree → [`IrModule`].
//!
//! The program body becomes a synthetic `#main` function exported as `m`.
//! Every other function is lowered lazily: a record is reserved (with its
//! final index) when the function is first declared or referenced, and the
//! body is generated when the worklist reaches it. A reference to a
//! function whose body is not final yet becomes a deferred instruction,
//! resolved before assembly.
//!
//! Calling convention for compiled source functions:
//!
//! ```text
//! (env: i32, a₀: VT, a₀ty: i32, a₁: VT, a₁ty: i32, …) -> (VT, i32)
//! ```
//!
//! `env` points to an array of closure-cell addresses (0 when the function
//! captures nothing). `#main` takes no parameters and returns the
//! program's completion value.

mod expr;
mod stmt;

use crate::builtins::{self, HEAP_GLOBAL};
use crate::error::{CodegenError, CodegenResult};
use crate::ir::{
    Deferred, FuncRecord, GlobalRecord, Instr, IrModule, LocalRecord, LowerState, Operand,
    TagRecord,
};
use crate::strings::StringPool;
use crate::types::{FuncFlags, TypeId};
use crate::wasm::{limits, pages_for, BlockType, Op, ValType};
use jetsam_analyzer::{Analysis, BindingKind};
use jetsam_types::estree::{FnBody, FunctionNode, Program, ScopeId, Stmt, StmtKind};
use jetsam_types::{CompileOptions, Span, ValueKind};
use std::collections::{HashMap, HashSet, VecDeque};

/// Static type hint for a subexpression: a concrete type id or unknown.
/// Hints select fast paths; they never replace runtime tags when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hint {
    Known(TypeId),
    Unknown,
}

impl Hint {
    pub(crate) fn is(self, ty: TypeId) -> bool {
        self == Hint::Known(ty)
    }
}

/// Where a named binding lives inside a function frame.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LocalBinding {
    /// A (value, type) pair of Wasm locals (or parameter slots).
    Direct { value: u32, ty: u32 },
    /// An i32 local holding the address of a heap cell.
    Cell { ptr: u32 },
}

/// Generate an IR module for an analyzed program.
pub fn generate(
    program: &Program,
    analysis: Option<&Analysis>,
    opts: &CompileOptions,
    module_name: &str,
) -> CodegenResult<IrModule> {
    let mut generator = Generator::new(analysis, opts, module_name);
    generator.run(program)?;
    Ok(generator.finish())
}

pub(crate) struct Generator<'a> {
    pub(crate) module: IrModule,
    pub(crate) analysis: Option<&'a Analysis>,
    pub(crate) opts: &'a CompileOptions,
    pub(crate) vt: ValType,
    pub(crate) pool: StringPool,
    /// name → index into `module.funcs`.
    funcs_by_name: HashMap<String, usize>,
    /// Scheduled-but-not-lowered function names.
    pending: VecDeque<String>,
    /// User functions by unique name (the lazy-generation thunks).
    decls: HashMap<String, &'a FunctionNode>,
    /// name → (value global, type global) indices.
    globals: HashMap<String, (u32, u32)>,
    /// Effective free-variable lists per function scope.
    free_cache: HashMap<u32, Vec<String>>,
    anon_counter: u32,
    exception_tag: Option<u32>,
}

impl<'a> Generator<'a> {
    fn new(analysis: Option<&'a Analysis>, opts: &'a CompileOptions, module_name: &str) -> Self {
        let mut module = IrModule::new(module_name);
        module.imports = builtins::import_table();
        // Global 0 is the heap cursor; its init is patched in finish()
        // once the static region size is known.
        module.globals.push(GlobalRecord {
            name: "#heap".to_string(),
            index: HEAP_GLOBAL,
            ty: ValType::I32,
            mutable: true,
            init: vec![Instr::with(Op::I32Const, vec![Operand::I32(0)])],
        });
        Generator {
            module,
            analysis,
            opts,
            vt: match opts.value_type {
                ValueKind::F64 => ValType::F64,
                ValueKind::I32 => ValType::I32,
            },
            pool: StringPool::new(),
            funcs_by_name: HashMap::new(),
            pending: VecDeque::new(),
            decls: HashMap::new(),
            globals: HashMap::new(),
            free_cache: HashMap::new(),
            anon_counter: 0,
            exception_tag: None,
        }
    }

    pub(crate) fn strict(&self) -> bool {
        self.analysis.map(|a| a.strict).unwrap_or(false)
    }

    fn run(&mut self, program: &'a Program) -> CodegenResult<()> {
        // Synthetic entry point.
        let main_idx = self.create_record(
            "#main",
            vec![],
            vec![],
            vec![self.vt, ValType::I32],
            FuncFlags::INTERNAL,
        )?;
        self.module.funcs[main_idx].export = Some("m".to_string());
        self.module.funcs[main_idx].state = LowerState::Scheduled;

        self.lower_main(program)?;

        // Drain the worklist; lowering one body may schedule more.
        while let Some(name) = self.pending.pop_front() {
            self.lower_scheduled(&name)?;
        }

        if self.module.funcs.len() + self.module.imports.len() > limits::MAX_FUNCTIONS {
            return Err(CodegenError::LimitExceeded(format!(
                "{} functions",
                self.module.funcs.len()
            )));
        }
        Ok(())
    }

    fn finish(mut self) -> IrModule {
        // Static data below, heap above, page-granular.
        let static_bytes = self.pool.len();
        let page_unit = self.opts.page_size.max(1);
        let rounded = static_bytes.div_ceil(page_unit) * page_unit;
        let static_pages = pages_for(rounded.max(1));
        let heap_base = static_pages * crate::wasm::WASM_PAGE;

        self.module.globals[HEAP_GLOBAL as usize].init =
            vec![Instr::with(Op::I32Const, vec![Operand::I32(heap_base as i32)])];
        self.module.pages.set("static", 0);
        self.module.pages.set("heap", static_pages);
        self.module.memory_pages = static_pages + self.opts.heap_pages;

        let pool = std::mem::take(&mut self.pool);
        if !pool.is_empty() {
            self.module.data.push(crate::ir::DataSegment {
                name: "strings".to_string(),
                offset: 0,
                bytes: pool.into_bytes(),
            });
        }
        log::debug!(
            "generated module: {} functions, {} globals, {} static bytes",
            self.module.funcs.len(),
            self.module.globals.len(),
            static_bytes
        );
        self.module
    }

    // ══════════════════════════════════════════════════════════════════════
    // Function records & scheduling
    // ══════════════════════════════════════════════════════════════════════

    fn create_record(
        &mut self,
        name: &str,
        params: Vec<ValType>,
        param_names: Vec<String>,
        results: Vec<ValType>,
        flags: FuncFlags,
    ) -> CodegenResult<usize> {
        if self.funcs_by_name.contains_key(name) {
            return Err(CodegenError::Internal(format!(
                "function '{name}' declared twice"
            )));
        }
        let index = self.module.next_func_index();
        let record = FuncRecord {
            name: name.to_string(),
            index,
            params,
            param_names,
            results,
            locals: Vec::new(),
            body: Vec::new(),
            flags,
            state: LowerState::Unseen,
            last_type_slot: None,
            export: None,
        };
        let pos = self.module.funcs.len();
        self.module.funcs.push(record);
        self.funcs_by_name.insert(name.to_string(), pos);
        Ok(pos)
    }

    /// Signature of a compiled source function with `argc` parameters.
    pub(crate) fn user_signature(&self, argc: usize) -> (Vec<ValType>, Vec<ValType>) {
        let mut params = vec![ValType::I32];
        for _ in 0..argc {
            params.push(self.vt);
            params.push(ValType::I32);
        }
        (params, vec![self.vt, ValType::I32])
    }

    /// Register a user function under its unique name. Idempotent.
    pub(crate) fn register_user_function(
        &mut self,
        name: &str,
        node: &'a FunctionNode,
    ) -> CodegenResult<()> {
        if self.funcs_by_name.contains_key(name) {
            return Ok(());
        }
        self.decls.insert(name.to_string(), node);
        let (params, results) = self.user_signature(node.params.len());
        let mut param_names = vec!["#env".to_string()];
        for p in &node.params {
            let pname = p
                .as_ident()
                .map(|i| i.name.clone())
                .unwrap_or_else(|| "#pat".to_string());
            param_names.push(pname.clone());
            param_names.push(format!("{pname}#type"));
        }
        let mut flags = FuncFlags::empty();
        if node.is_async {
            flags = flags | FuncFlags::ASYNC;
        }
        if node.is_generator {
            flags = flags | FuncFlags::GENERATOR;
        }
        self.create_record(name, params, param_names, results, flags)?;
        Ok(())
    }

    /// Demand a function: schedule it if unseen and return a call
    /// instruction — plain if the body is final, deferred otherwise.
    pub(crate) fn request_function(&mut self, name: &str, tail: bool) -> CodegenResult<Instr> {
        if !self.funcs_by_name.contains_key(name) {
            // Only registry helpers can be conjured from a bare name.
            let body_exists = name.starts_with('#')
                && builtins::emit(name, self.vt, &mut StringPool::new()).is_some();
            if !body_exists {
                return Err(CodegenError::Internal(format!(
                    "request for unknown function '{name}'"
                )));
            }
            let probe = builtins::emit(name, self.vt, &mut StringPool::new())
                .expect("existence checked above");
            let param_names = probe.param_names.iter().map(|s| s.to_string()).collect();
            self.create_record(
                name,
                probe.params,
                param_names,
                probe.results,
                FuncFlags::INTERNAL | FuncFlags::BUILTIN,
            )?;
        }
        let pos = self.funcs_by_name[name];
        let record = &mut self.module.funcs[pos];
        if record.state == LowerState::Unseen {
            record.state = LowerState::Scheduled;
            self.pending.push_back(name.to_string());
        }
        let record = &self.module.funcs[pos];
        if record.state == LowerState::Lowered {
            let op = if tail { Op::ReturnCall } else { Op::Call };
            Ok(Instr::u32(op, record.index))
        } else {
            Ok(Instr::Deferred(Deferred {
                target: name.to_string(),
                tail,
            }))
        }
    }

    fn lower_scheduled(&mut self, name: &str) -> CodegenResult<()> {
        let pos = self.funcs_by_name[name];
        if self.module.funcs[pos].state != LowerState::Scheduled {
            return Ok(());
        }
        self.module.funcs[pos].state = LowerState::Lowering;

        if self.module.funcs[pos].flags.contains(FuncFlags::BUILTIN) {
            let body = builtins::emit(name, self.vt, &mut self.pool)
                .ok_or_else(|| CodegenError::Internal(format!("no builtin body for '{name}'")))?;
            // Schedule everything the helper defers to.
            for instr in &body.body {
                if let Instr::Deferred(d) = instr {
                    let target = d.target.clone();
                    self.request_function(&target, false)?;
                }
            }
            let record = &mut self.module.funcs[pos];
            record.locals = body.locals;
            record.body = body.body;
            record.state = LowerState::DeferredPatched;
            record.state = LowerState::Lowered;
            return Ok(());
        }

        let node = *self
            .decls
            .get(name)
            .ok_or_else(|| CodegenError::Internal(format!("no declaration for '{name}'")))?;
        self.lower_user_function(name, node)
    }

    // ══════════════════════════════════════════════════════════════════════
    // Function body lowering
    // ══════════════════════════════════════════════════════════════════════

    fn lower_main(&mut self, program: &'a Program) -> CodegenResult<()> {
        let pos = self.funcs_by_name["#main"];
        self.module.funcs[pos].state = LowerState::Lowering;

        let mut fb = FuncBuilder::new("#main", self.vt, vec![], vec![]);
        fb.completion = Some((
            fb.declare_raw("#completion", self.vt),
            fb.declare_raw("#completion#type", ValType::I32),
        ));

        self.hoist_declarations(&program.body)?;
        self.export_top_level(&program.body)?;
        self.emit_prologue(&mut fb, program.scope, &[])?;
        for stmt in &program.body {
            self.lower_stmt(&mut fb, stmt)?;
        }
        let (cv, ct) = fb.completion.expect("set above");
        fb.get(cv);
        fb.get(ct);

        self.seal(pos, fb)
    }

    /// Export each declared top-level function under its source name.
    /// Exported functions are roots: they compile even when nothing in
    /// the program calls them. Capturing declarations are skipped — the
    /// host cannot supply a closure environment.
    fn export_top_level(&mut self, body: &'a [Stmt]) -> CodegenResult<()> {
        for stmt in body {
            let StmtKind::FunctionDecl(node) = &stmt.kind else {
                continue;
            };
            let Some(id) = &node.id else { continue };
            if !self.is_direct_function(&id.name) {
                continue;
            }
            let export_name = self
                .analysis
                .and_then(|a| a.scopes.binding_by_unique(&id.name))
                .map(|b| b.name.clone())
                .unwrap_or_else(|| id.name.clone());
            if export_name == "m" || export_name == "$" {
                continue; // reserved export names
            }
            self.request_function(&id.name, false)?;
            let pos = self.funcs_by_name[&id.name];
            self.module.funcs[pos].export = Some(export_name);
        }
        Ok(())
    }

    fn lower_user_function(&mut self, name: &str, node: &'a FunctionNode) -> CodegenResult<()> {
        if node.is_async {
            return Err(CodegenError::Unsupported(at(
                "async functions",
                node.span,
            )));
        }
        if node.is_generator {
            return Err(CodegenError::Unsupported(at(
                "generator functions",
                node.span,
            )));
        }
        let pos = self.funcs_by_name[name];
        let (params, _) = self.user_signature(node.params.len());
        let param_names = self.module.funcs[pos].param_names.clone();
        let mut fb = FuncBuilder::new(name, self.vt, params, param_names);

        // Map parameters to their slot pairs; captured ones are rebound to
        // cells in the prologue.
        let mut captured_params = Vec::new();
        for (i, p) in node.params.iter().enumerate() {
            let id = p.as_ident().ok_or_else(|| {
                CodegenError::Unsupported(at("destructuring parameters", node.span))
            })?;
            let value = 1 + 2 * i as u32;
            fb.bind(
                &id.name,
                LocalBinding::Direct {
                    value,
                    ty: value + 1,
                },
            );
            if self.binding_is_captured(&id.name) {
                captured_params.push((id.name.clone(), value));
            }
        }

        match &node.body {
            FnBody::Block(stmts) => {
                self.hoist_declarations(stmts)?;
                self.emit_prologue(&mut fb, node.scope, &captured_params)?;
                for stmt in stmts {
                    self.lower_stmt(&mut fb, stmt)?;
                }
                // fall-off-the-end returns undefined
                fb.vtc(0.0);
                fb.i32c(TypeId::Undefined.as_i32());
            }
            FnBody::Expr(expr) => {
                self.emit_prologue(&mut fb, node.scope, &captured_params)?;
                self.lower_expr(&mut fb, expr)?;
            }
        }
        self.seal(pos, fb)
    }

    /// Finish a record: install locals and body, walk the state machine.
    fn seal(&mut self, pos: usize, fb: FuncBuilder) -> CodegenResult<()> {
        if fb.locals.len() > limits::MAX_LOCALS {
            return Err(CodegenError::LimitExceeded(format!(
                "{} locals in '{}'",
                fb.locals.len(),
                self.module.funcs[pos].name
            )));
        }
        let record = &mut self.module.funcs[pos];
        record.locals = fb.locals;
        record.body = fb.ins;
        record.last_type_slot = fb.last_type;
        record.state = LowerState::DeferredPatched;
        record.state = LowerState::Lowered;
        Ok(())
    }

    // ══════════════════════════════════════════════════════════════════════
    // Hoisting & prologue
    // ══════════════════════════════════════════════════════════════════════

    /// Register the function declarations of one function body (at any
    /// block depth, but not inside nested functions), so forward
    /// references resolve.
    fn hoist_declarations(&mut self, stmts: &'a [Stmt]) -> CodegenResult<()> {
        let mut hoisted = Vec::new();
        collect_function_decls(stmts, &mut hoisted);
        for node in hoisted {
            let Some(id) = &node.id else { continue };
            self.register_user_function(&id.name, node)?;
        }
        Ok(())
    }

    /// Emit the frame prologue: unpack the closure environment, allocate
    /// cells for captured bindings, bind plain locals, and materialize
    /// closures for captured function declarations.
    fn emit_prologue(
        &mut self,
        fb: &mut FuncBuilder,
        scope: Option<ScopeId>,
        captured_params: &[(String, u32)],
    ) -> CodegenResult<()> {
        let Some(scope) = scope else {
            // Analyzer disabled: no frame, every variable is a global.
            return Ok(());
        };

        // 1. Closure environment → cell-pointer locals.
        let frees = self.effective_free(scope);
        for (i, fv) in frees.iter().enumerate() {
            let slot = fb.declare_raw(fv, ValType::I32);
            fb.bind(fv, LocalBinding::Cell { ptr: slot });
            fb.get(0); // #env
            fb.ins.push(Instr::with(
                Op::I32Load,
                vec![Operand::U32(2), Operand::U32(4 * i as u32)],
            ));
            fb.set(slot);
        }

        // 2. Cells for captured parameters (copy the incoming pair in).
        for (name, value_slot) in captured_params {
            let cell = self.alloc_cell(fb, name)?;
            fb.get(cell);
            fb.get(*value_slot);
            fb.vt_store(0);
            fb.get(cell);
            fb.get(value_slot + 1);
            fb.store_i32(self.cell_type_offset());
        }

        // 3. Frame bindings: cells for captured ones, local pairs
        //    otherwise. Function bindings only materialize when captured —
        //    direct ones lower to plain calls.
        let analysis = self.analysis.expect("scope implies analysis");
        let bindings: Vec<(String, BindingKind, bool)> = analysis
            .scopes
            .frame_bindings(scope)
            .iter()
            .map(|b| (b.unique.clone(), b.kind, b.captured))
            .collect();
        let mut closure_decls = Vec::new();
        for (unique, kind, captured) in bindings {
            if kind == BindingKind::Param {
                continue; // parameters already bound
            }
            if kind == BindingKind::Function {
                let fn_scope = self.decls.get(&unique).and_then(|n| n.scope);
                let is_closure_decl = match fn_scope {
                    Some(s) => !self.effective_free(s).is_empty(),
                    None => false,
                };
                if !is_closure_decl {
                    continue;
                }
                closure_decls.push(unique.clone());
            }
            if fb.lookup(&unique).is_some() {
                continue; // already bound (e.g. an env cell)
            }
            if captured {
                // Fresh linear memory is zero, so new cells read back as
                // undefined without an explicit store.
                self.alloc_cell(fb, &unique)?;
            } else {
                let value = fb.declare_raw(&unique, self.vt);
                let ty = fb.declare_raw(&format!("{unique}#type"), ValType::I32);
                fb.bind(&unique, LocalBinding::Direct { value, ty });
            }
        }

        // 4. Captured function declarations become closure values now, so
        //    later reads (including from inner functions) see them.
        for name in closure_decls {
            self.materialize_closure(fb, &name)?;
            self.store_binding(fb, &name, Span::UNKNOWN)?;
        }
        Ok(())
    }

    /// Allocate a heap cell and bind `name` to it.
    fn alloc_cell(&mut self, fb: &mut FuncBuilder, name: &str) -> CodegenResult<u32> {
        let slot = fb.declare_raw(name, ValType::I32);
        fb.bind(name, LocalBinding::Cell { ptr: slot });
        fb.i32c(self.cell_size() as i32);
        let call = self.request_function("#alloc", false)?;
        fb.ins.push(call);
        fb.set(slot);
        Ok(slot)
    }

    pub(crate) fn cell_size(&self) -> u32 {
        if self.vt == ValType::F64 {
            12
        } else {
            8
        }
    }

    pub(crate) fn cell_type_offset(&self) -> u32 {
        if self.vt == ValType::F64 {
            8
        } else {
            4
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Captures & closures
    // ══════════════════════════════════════════════════════════════════════

    pub(crate) fn binding_is_captured(&self, unique: &str) -> bool {
        self.analysis
            .and_then(|a| a.scopes.binding_by_unique(unique))
            .map(|b| b.captured)
            .unwrap_or(false)
    }

    /// The free variables a function actually needs cells for: the
    /// analyzer's list minus function bindings that lower to direct calls.
    ///
    /// Directness is the greatest fixpoint over the function-reference
    /// graph: every member of a capture-free cycle stays direct, and one
    /// captured variable anywhere in a cycle demotes the whole cycle.
    /// All declarations a scope can reach are registered before its
    /// first query, so results are final and cached for every scope the
    /// computation touches.
    pub(crate) fn effective_free(&mut self, fscope: ScopeId) -> Vec<String> {
        if let Some(cached) = self.free_cache.get(&fscope.0) {
            return cached.clone();
        }
        let Some(analysis) = self.analysis else {
            return Vec::new();
        };

        // Collect the subgraph reachable through function-binding
        // references. Each entry is (free name, target function scope);
        // a missing target means a plain variable (or an unregistered
        // declaration), which always stays free.
        let mut order: Vec<u32> = vec![fscope.0];
        let mut seen: HashSet<u32> = HashSet::from([fscope.0]);
        let mut raw: HashMap<u32, Vec<(String, Option<u32>)>> = HashMap::new();
        let mut fixed: HashMap<u32, bool> = HashMap::new();
        let mut i = 0;
        while i < order.len() {
            let s = order[i];
            i += 1;
            let free_vars = analysis.scopes.get(ScopeId(s)).free_vars.clone();
            let mut entries = Vec::new();
            for fv in free_vars {
                let kind = analysis.scopes.binding_by_unique(&fv).map(|b| b.kind);
                let target = if kind == Some(BindingKind::Function) {
                    self.decls.get(&fv).and_then(|n| n.scope).map(|t| t.0)
                } else {
                    None
                };
                if let Some(t) = target {
                    if seen.insert(t) {
                        match self.free_cache.get(&t) {
                            Some(cached) => {
                                fixed.insert(t, cached.is_empty());
                            }
                            None => order.push(t),
                        }
                    }
                }
                entries.push((fv, target));
            }
            raw.insert(s, entries);
        }

        // Greatest fixpoint: assume every unfinished member direct,
        // demote any member that still keeps a free variable, repeat
        // until stable. Demotion is monotone, so this terminates.
        let mut direct: HashMap<u32, bool> = order
            .iter()
            .map(|&s| (s, true))
            .chain(fixed.iter().map(|(&s, &d)| (s, d)))
            .collect();
        loop {
            let mut changed = false;
            for &s in &order {
                if !direct[&s] {
                    continue;
                }
                let keeps_any = raw[&s].iter().any(|(_, target)| match target {
                    Some(t) => !direct[t],
                    None => true,
                });
                if keeps_any {
                    direct.insert(s, false);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // Finalize every member computed in this round.
        for &s in &order {
            let effective: Vec<String> = raw[&s]
                .iter()
                .filter(|(_, target)| match target {
                    Some(t) => !direct[t],
                    None => true,
                })
                .map(|(fv, _)| fv.clone())
                .collect();
            self.free_cache.insert(s, effective);
        }
        self.free_cache[&fscope.0].clone()
    }

    /// Whether a unique name refers to a function declaration that lowers
    /// to direct calls (no captured environment).
    pub(crate) fn is_direct_function(&mut self, unique: &str) -> bool {
        let Some(fn_scope) = self.decls.get(unique).map(|n| n.scope) else {
            return false;
        };
        match fn_scope {
            Some(s) => self.effective_free(s).is_empty(),
            None => true, // analyzer off: every declared function is direct
        }
    }

    /// Push a function value: an 8-byte record `[table_slot, env_ptr]`.
    pub(crate) fn materialize_closure(
        &mut self,
        fb: &mut FuncBuilder,
        name: &str,
    ) -> CodegenResult<Hint> {
        // Schedule the body and take its address.
        let _ = self.request_function(name, false)?;
        let slot = self.module.table_slot(name);

        let fn_scope = self.decls.get(name).and_then(|n| n.scope);
        let frees = match fn_scope {
            Some(s) => self.effective_free(s),
            None => Vec::new(),
        };

        let env = if frees.is_empty() {
            None
        } else {
            let env = fb.temp(ValType::I32);
            fb.i32c(4 * frees.len() as i32);
            let call = self.request_function("#alloc", false)?;
            fb.ins.push(call);
            fb.set(env);
            for (i, fv) in frees.iter().enumerate() {
                let Some(LocalBinding::Cell { ptr }) = fb.lookup(fv) else {
                    return Err(CodegenError::Internal(format!(
                        "captured '{fv}' has no cell in '{}'",
                        fb.name
                    )));
                };
                fb.get(env);
                fb.get(ptr);
                fb.store_i32(4 * i as u32);
            }
            Some(env)
        };

        let rec = fb.temp(ValType::I32);
        fb.i32c(8);
        let call = self.request_function("#alloc", false)?;
        fb.ins.push(call);
        fb.set(rec);
        fb.get(rec);
        fb.i32c(slot as i32);
        fb.store_i32(0);
        fb.get(rec);
        match env {
            Some(env) => fb.get(env),
            None => fb.i32c(0),
        }
        fb.store_i32(4);

        fb.get(rec);
        fb.ptr_to_vt();
        fb.i32c(TypeId::Function.as_i32());
        Ok(Hint::Known(TypeId::Function))
    }

    // ══════════════════════════════════════════════════════════════════════
    // Globals & exceptions
    // ══════════════════════════════════════════════════════════════════════

    /// The (value, type) global pair backing an undeclared name.
    pub(crate) fn global_pair(&mut self, name: &str) -> (u32, u32) {
        if let Some(&pair) = self.globals.get(name) {
            return pair;
        }
        let value_idx = self.module.globals.len() as u32;
        let init_value = match self.vt {
            ValType::F64 => Instr::with(Op::F64Const, vec![Operand::F64(0.0)]),
            _ => Instr::with(Op::I32Const, vec![Operand::I32(0)]),
        };
        self.module.globals.push(GlobalRecord {
            name: name.to_string(),
            index: value_idx,
            ty: self.vt,
            mutable: true,
            init: vec![init_value],
        });
        let type_idx = self.module.globals.len() as u32;
        self.module.globals.push(GlobalRecord {
            name: format!("{name}#type"),
            index: type_idx,
            ty: ValType::I32,
            mutable: true,
            init: vec![Instr::with(
                Op::I32Const,
                vec![Operand::I32(TypeId::Undefined.as_i32())],
            )],
        });
        self.globals.insert(name.to_string(), (value_idx, type_idx));
        (value_idx, type_idx)
    }

    /// The exception tag shared by `throw` and `try`/`catch`.
    pub(crate) fn exception_tag(&mut self) -> u32 {
        if let Some(tag) = self.exception_tag {
            return tag;
        }
        let tag = self.module.tags.len() as u32;
        self.module.tags.push(TagRecord {
            index: tag,
            params: vec![self.vt, ValType::I32],
        });
        self.module.exceptions.push(crate::ir::ExceptionRecord {
            constructor: "Error".to_string(),
            tag,
        });
        self.exception_tag = Some(tag);
        tag
    }
}

/// Collect function declarations of one function body, skipping nested
/// functions (their declarations hoist into their own frames).
fn collect_function_decls<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a FunctionNode>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::FunctionDecl(f) => out.push(f),
            StmtKind::Block { body, .. } => collect_function_decls(body, out),
            StmtKind::If {
                consequent,
                alternate,
                ..
            } => {
                collect_function_decls(std::slice::from_ref(consequent), out);
                if let Some(alt) = alternate {
                    collect_function_decls(std::slice::from_ref(alt), out);
                }
            }
            StmtKind::While { body, .. } | StmtKind::DoWhile { body, .. } => {
                collect_function_decls(std::slice::from_ref(body), out)
            }
            StmtKind::For { body, .. } => collect_function_decls(std::slice::from_ref(body), out),
            StmtKind::Try {
                block,
                handler,
                finalizer,
                ..
            } => {
                collect_function_decls(block, out);
                if let Some(h) = handler {
                    collect_function_decls(&h.body, out);
                }
                if let Some(f) = finalizer {
                    collect_function_decls(f, out);
                }
            }
            _ => {}
        }
    }
}

/// Format a diagnostic with its source position when known.
pub(crate) fn at(what: &str, span: Span) -> String {
    if span.is_unknown() {
        what.to_string()
    } else {
        format!("{what} at {span}")
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Function builder
// ══════════════════════════════════════════════════════════════════════════════

/// Control-frame bookkeeping for branch depth computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Frame {
    /// A labeled block `break` can target.
    BreakTarget,
    /// A block whose end is where `continue` lands.
    ContinueTarget,
    Plain,
}

/// Accumulates one function's locals and instruction sequence.
pub(crate) struct FuncBuilder {
    pub(crate) name: String,
    pub(crate) vt: ValType,
    pub(crate) params: Vec<ValType>,
    pub(crate) param_names: Vec<String>,
    pub(crate) locals: Vec<LocalRecord>,
    pub(crate) ins: Vec<Instr>,
    bindings: HashMap<String, LocalBinding>,
    hints: HashMap<String, Hint>,
    ctrl: Vec<Frame>,
    n_params: u32,
    temp_counter: u32,
    pub(crate) last_type: Option<u32>,
    scratch_value: Option<u32>,
    /// Completion-value pair, allocated only for `#main`.
    pub(crate) completion: Option<(u32, u32)>,
}

impl FuncBuilder {
    pub(crate) fn new(
        name: &str,
        vt: ValType,
        params: Vec<ValType>,
        param_names: Vec<String>,
    ) -> FuncBuilder {
        let n_params = params.len() as u32;
        FuncBuilder {
            name: name.to_string(),
            vt,
            params,
            param_names,
            locals: Vec::new(),
            ins: Vec::new(),
            bindings: HashMap::new(),
            hints: HashMap::new(),
            ctrl: Vec::new(),
            n_params,
            temp_counter: 0,
            last_type: None,
            scratch_value: None,
            completion: None,
        }
    }

    // ── Locals ───────────────────────────────────────────────────────────

    /// Declare a local slot without binding a name to it.
    pub(crate) fn declare_raw(&mut self, name: &str, ty: ValType) -> u32 {
        let slot = self.n_params + self.locals.len() as u32;
        self.locals.push(LocalRecord {
            name: name.to_string(),
            ty,
        });
        slot
    }

    pub(crate) fn temp(&mut self, ty: ValType) -> u32 {
        self.temp_counter += 1;
        let name = format!("#t{}", self.temp_counter);
        self.declare_raw(&name, ty)
    }

    pub(crate) fn bind(&mut self, name: &str, binding: LocalBinding) {
        self.bindings.insert(name.to_string(), binding);
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<LocalBinding> {
        self.bindings.get(name).copied()
    }

    /// The `(#last_value, #last_type)` scratch pair used by short-circuit
    /// and conditional lowering.
    pub(crate) fn scratch_pair(&mut self) -> (u32, u32) {
        if let (Some(v), Some(t)) = (self.scratch_value, self.last_type) {
            return (v, t);
        }
        let v = self.declare_raw("#last_value", self.vt);
        let t = self.declare_raw("#last_type", ValType::I32);
        self.scratch_value = Some(v);
        self.last_type = Some(t);
        (v, t)
    }

    // ── Hints ────────────────────────────────────────────────────────────

    pub(crate) fn hint_for(&self, name: &str) -> Hint {
        match self.bindings.get(name) {
            Some(LocalBinding::Direct { .. }) => {
                *self.hints.get(name).unwrap_or(&Hint::Unknown)
            }
            // Cells can be written by closures; globals by anyone.
            _ => Hint::Unknown,
        }
    }

    pub(crate) fn set_hint(&mut self, name: &str, hint: Hint) {
        let effective = if self.ctrl.is_empty() { hint } else { Hint::Unknown };
        self.hints.insert(name.to_string(), effective);
    }

    pub(crate) fn invalidate_hints(&mut self, names: &HashSet<String>) {
        for name in names {
            self.hints.insert(name.clone(), Hint::Unknown);
        }
    }

    // ── Instruction emission ─────────────────────────────────────────────

    pub(crate) fn op(&mut self, op: Op) {
        self.ins.push(Instr::op(op));
    }

    pub(crate) fn u32op(&mut self, op: Op, v: u32) {
        self.ins.push(Instr::u32(op, v));
    }

    pub(crate) fn i32c(&mut self, v: i32) {
        self.ins.push(Instr::with(Op::I32Const, vec![Operand::I32(v)]));
    }

    pub(crate) fn f64c(&mut self, v: f64) {
        self.ins.push(Instr::with(Op::F64Const, vec![Operand::F64(v)]));
    }

    /// A constant on the value channel.
    pub(crate) fn vtc(&mut self, v: f64) {
        match self.vt {
            ValType::F64 => self.f64c(v),
            _ => self.i32c(v as i32),
        }
    }

    pub(crate) fn get(&mut self, slot: u32) {
        self.u32op(Op::LocalGet, slot);
    }

    pub(crate) fn set(&mut self, slot: u32) {
        self.u32op(Op::LocalSet, slot);
    }

    pub(crate) fn tee(&mut self, slot: u32) {
        self.u32op(Op::LocalTee, slot);
    }

    pub(crate) fn drop_(&mut self) {
        self.op(Op::Drop);
    }

    /// Load the value channel from a cell.
    pub(crate) fn vt_load(&mut self, offset: u32) {
        let (op, align) = match self.vt {
            ValType::F64 => (Op::F64Load, 3),
            _ => (Op::I32Load, 2),
        };
        self.ins
            .push(Instr::with(op, vec![Operand::U32(align), Operand::U32(offset)]));
    }

    /// Store the value channel into a cell.
    pub(crate) fn vt_store(&mut self, offset: u32) {
        let (op, align) = match self.vt {
            ValType::F64 => (Op::F64Store, 3),
            _ => (Op::I32Store, 2),
        };
        self.ins
            .push(Instr::with(op, vec![Operand::U32(align), Operand::U32(offset)]));
    }

    pub(crate) fn load_i32(&mut self, offset: u32) {
        self.ins.push(Instr::with(
            Op::I32Load,
            vec![Operand::U32(2), Operand::U32(offset)],
        ));
    }

    pub(crate) fn store_i32(&mut self, offset: u32) {
        self.ins.push(Instr::with(
            Op::I32Store,
            vec![Operand::U32(2), Operand::U32(offset)],
        ));
    }

    /// Value channel → i32 address.
    pub(crate) fn ptr_from_vt(&mut self) {
        if self.vt == ValType::F64 {
            self.op(Op::I32TruncF64U);
        }
    }

    /// i32 (unsigned) → value channel.
    pub(crate) fn ptr_to_vt(&mut self) {
        if self.vt == ValType::F64 {
            self.op(Op::F64ConvertI32U);
        }
    }

    /// i32 (signed) → value channel.
    pub(crate) fn i32_to_vt(&mut self) {
        if self.vt == ValType::F64 {
            self.op(Op::F64ConvertI32S);
        }
    }

    /// Value channel → i32 with saturating ToInt32 semantics.
    pub(crate) fn vt_to_i32(&mut self) {
        if self.vt == ValType::F64 {
            self.op(Op::I32TruncSatF64S);
        }
    }

    // ── Control frames ───────────────────────────────────────────────────

    pub(crate) fn begin_block(&mut self, frame: Frame) {
        self.ins
            .push(Instr::with(Op::Block, vec![Operand::Block(BlockType::Empty)]));
        self.ctrl.push(frame);
    }

    pub(crate) fn begin_loop(&mut self) {
        self.ins
            .push(Instr::with(Op::Loop, vec![Operand::Block(BlockType::Empty)]));
        self.ctrl.push(Frame::Plain);
    }

    pub(crate) fn begin_if(&mut self, bt: BlockType) {
        self.ins.push(Instr::with(Op::If, vec![Operand::Block(bt)]));
        self.ctrl.push(Frame::Plain);
    }

    pub(crate) fn begin_try(&mut self) {
        self.ins
            .push(Instr::with(Op::Try, vec![Operand::Block(BlockType::Empty)]));
        self.ctrl.push(Frame::Plain);
    }

    pub(crate) fn else_(&mut self) {
        self.op(Op::Else);
    }

    pub(crate) fn end_frame(&mut self) {
        self.ctrl.pop();
        self.op(Op::End);
    }

    /// Branch depth of the innermost frame matching `target`.
    pub(crate) fn frame_depth(&self, target: Frame) -> Option<u32> {
        self.ctrl
            .iter()
            .rev()
            .position(|f| *f == target)
            .map(|d| d as u32)
    }
}
