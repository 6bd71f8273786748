//! The built-in registry.
//!
//! Contributes two things to a module:
//!
//! 1. **Host imports** — `print`, `printChar`, `time`, `timeOrigin` under
//!    the `env` module, with fixed declaration ordinals. Imports that end
//!    up unused are dropped by the assembler's tree-shaking pass.
//! 2. **Prebuilt IR bodies** — runtime helpers (`#`-prefixed) and
//!    prototype methods, generated lazily on first demand. Helper-to-helper
//!    calls are emitted as deferred references and patched before assembly.
//!
//! Helper calling conventions (VT is the configured value scalar):
//!
//! | Helper | Signature |
//! |---|---|
//! | `#alloc` | `(size: i32) -> i32` |
//! | `#memcmp` | `(a: i32, b: i32, len: i32) -> i32` (1 = equal) |
//! | `#js_truthy` | `(v: VT, t: i32) -> i32` |
//! | `#js_tonumber` | `(v: VT, t: i32) -> VT` |
//! | `#js_fmod` | `(a: VT, b: VT) -> VT` |
//! | `#js_round` | `(v: VT) -> VT` |
//! | `#js_add`, `#js_eq`, `#js_seq`, `#js_lt`, `#js_le`, `#js_gt`, `#js_ge` | `(av: VT, at: i32, bv: VT, bt: i32) -> (VT, i32)` |
//! | `#to_string` | `(v: VT, t: i32) -> i32` (string address) |
//! | `#number_to_string` | `(v: VT) -> i32` |
//! | `#string_concat` | `(a: i32, b: i32) -> i32` |
//! | `#string_eq` | `(a: i32, b: i32) -> i32` |
//! | `#string_cmp` | `(a: i32, b: i32) -> i32` (-1/0/1) |
//! | `#typeof_name` | `(t: i32) -> i32` |
//! | `#print_string` | `(ptr: i32) -> ()` |
//! | `#print_value` | `(v: VT, t: i32) -> ()` |
//! | `#string_length` | `(this: VT, t: i32) -> (VT, i32)` |
//! | `#string_charCodeAt`, `#string_charAt` | `(this: VT, t: i32, i: VT, it: i32) -> (VT, i32)` |

use crate::ir::{ImportRecord, Instr, LocalRecord, Operand};
use crate::strings::StringPool;
use crate::types::TypeId;
use crate::wasm::{BlockType, Op, ValType};

// ══════════════════════════════════════════════════════════════════════════════
// Host imports
// ══════════════════════════════════════════════════════════════════════════════

pub const IMPORT_PRINT: u32 = 0;
pub const IMPORT_PRINT_CHAR: u32 = 1;
pub const IMPORT_TIME: u32 = 2;
pub const IMPORT_TIME_ORIGIN: u32 = 3;
/// Number of declared imports (defined functions start here).
pub const IMPORT_COUNT: u32 = 4;

/// The import table. Signatures are part of the runtime interface and do
/// not vary with the configured value type.
pub fn import_table() -> Vec<ImportRecord> {
    let entry = |index, name: &str, params: Vec<ValType>, results: Vec<ValType>| ImportRecord {
        module: "env".to_string(),
        name: name.to_string(),
        params,
        results,
        index,
    };
    vec![
        entry(IMPORT_PRINT, "print", vec![ValType::F64], vec![]),
        entry(IMPORT_PRINT_CHAR, "printChar", vec![ValType::I32], vec![]),
        entry(IMPORT_TIME, "time", vec![], vec![ValType::F64]),
        entry(IMPORT_TIME_ORIGIN, "timeOrigin", vec![], vec![ValType::F64]),
    ]
}

/// The `#heap` allocation-cursor global is always global 0; helper bodies
/// reference it by this constant.
pub const HEAP_GLOBAL: u32 = 0;

// ══════════════════════════════════════════════════════════════════════════════
// Prototype dispatch table
// ══════════════════════════════════════════════════════════════════════════════

/// One entry of the static dispatch table keyed by (type-id, name).
#[derive(Debug, Clone, Copy)]
pub struct MethodEntry {
    /// Name of the prebuilt helper implementing the method.
    pub helper: &'static str,
    /// Source-level argument count (each lowers to a value/type pair).
    pub argc: usize,
    /// True for property reads (`s.length`), false for method calls.
    pub property: bool,
}

/// Look up a prototype member for a base type-id.
pub fn prototype_method(ty: TypeId, name: &str) -> Option<MethodEntry> {
    match (ty, name) {
        (TypeId::String, "length") => Some(MethodEntry {
            helper: "#string_length",
            argc: 0,
            property: true,
        }),
        (TypeId::String, "charCodeAt") => Some(MethodEntry {
            helper: "#string_charCodeAt",
            argc: 1,
            property: false,
        }),
        (TypeId::String, "charAt") => Some(MethodEntry {
            helper: "#string_charAt",
            argc: 1,
            property: false,
        }),
        _ => None,
    }
}

/// A `Math` namespace member: a plain instruction, or a runtime helper
/// where the Wasm opcode has the wrong semantics (`f64.nearest` rounds
/// half-to-even, `Math.round` rounds half towards +∞).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MathIntrinsic {
    Unary(Op),
    Binary(Op),
    Helper(&'static str),
}

pub fn math_intrinsic(name: &str) -> Option<MathIntrinsic> {
    Some(match name {
        "floor" => MathIntrinsic::Unary(Op::F64Floor),
        "ceil" => MathIntrinsic::Unary(Op::F64Ceil),
        "abs" => MathIntrinsic::Unary(Op::F64Abs),
        "sqrt" => MathIntrinsic::Unary(Op::F64Sqrt),
        "trunc" => MathIntrinsic::Unary(Op::F64Trunc),
        "round" => MathIntrinsic::Helper("#js_round"),
        "min" => MathIntrinsic::Binary(Op::F64Min),
        "max" => MathIntrinsic::Binary(Op::F64Max),
        _ => return None,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Body builder
// ══════════════════════════════════════════════════════════════════════════════

/// The finished IR of one helper, handed to the generator for insertion.
pub struct BuiltinBody {
    pub params: Vec<ValType>,
    pub param_names: Vec<&'static str>,
    pub results: Vec<ValType>,
    pub locals: Vec<LocalRecord>,
    pub body: Vec<Instr>,
}

/// Tiny instruction builder for helper bodies.
struct B {
    vt: ValType,
    n_params: u32,
    params: Vec<ValType>,
    param_names: Vec<&'static str>,
    locals: Vec<LocalRecord>,
    ins: Vec<Instr>,
}

impl B {
    fn new(vt: ValType, params: &[(&'static str, ValType)]) -> B {
        B {
            vt,
            n_params: params.len() as u32,
            params: params.iter().map(|&(_, t)| t).collect(),
            param_names: params.iter().map(|&(n, _)| n).collect(),
            locals: Vec::new(),
            ins: Vec::new(),
        }
    }

    fn local(&mut self, name: &str, ty: ValType) -> u32 {
        let slot = self.n_params + self.locals.len() as u32;
        self.locals.push(LocalRecord {
            name: name.to_string(),
            ty,
        });
        slot
    }

    fn op(&mut self, op: Op) {
        self.ins.push(Instr::op(op));
    }

    fn u32(&mut self, op: Op, v: u32) {
        self.ins.push(Instr::u32(op, v));
    }

    fn i32c(&mut self, v: i32) {
        self.ins.push(Instr::with(Op::I32Const, vec![Operand::I32(v)]));
    }

    fn i64c(&mut self, v: i64) {
        self.ins.push(Instr::with(Op::I64Const, vec![Operand::I64(v)]));
    }

    fn f64c(&mut self, v: f64) {
        self.ins.push(Instr::with(Op::F64Const, vec![Operand::F64(v)]));
    }

    /// Push a constant on the value channel.
    fn vtc(&mut self, v: f64) {
        match self.vt {
            ValType::F64 => self.f64c(v),
            _ => self.i32c(v as i32),
        }
    }

    fn get(&mut self, slot: u32) {
        self.u32(Op::LocalGet, slot);
    }

    fn set(&mut self, slot: u32) {
        self.u32(Op::LocalSet, slot);
    }

    fn call_import(&mut self, index: u32) {
        self.u32(Op::Call, index);
    }

    /// Helper-to-helper call: always deferred, patched before assembly.
    fn call_helper(&mut self, name: &str) {
        self.ins.push(Instr::Deferred(crate::ir::Deferred {
            target: name.to_string(),
            tail: false,
        }));
    }

    fn block(&mut self, bt: BlockType) {
        self.ins.push(Instr::with(Op::Block, vec![Operand::Block(bt)]));
    }

    fn loop_(&mut self, bt: BlockType) {
        self.ins.push(Instr::with(Op::Loop, vec![Operand::Block(bt)]));
    }

    fn if_(&mut self, bt: BlockType) {
        self.ins.push(Instr::with(Op::If, vec![Operand::Block(bt)]));
    }

    fn else_(&mut self) {
        self.op(Op::Else);
    }

    fn end(&mut self) {
        self.op(Op::End);
    }

    fn br(&mut self, depth: u32) {
        self.u32(Op::Br, depth);
    }

    fn br_if(&mut self, depth: u32) {
        self.u32(Op::BrIf, depth);
    }

    fn load(&mut self, offset: u32) {
        self.ins
            .push(Instr::with(Op::I32Load, vec![Operand::U32(2), Operand::U32(offset)]));
    }

    fn store(&mut self, offset: u32) {
        self.ins
            .push(Instr::with(Op::I32Store, vec![Operand::U32(2), Operand::U32(offset)]));
    }

    fn store_unaligned(&mut self, offset: u32) {
        self.ins
            .push(Instr::with(Op::I32Store, vec![Operand::U32(0), Operand::U32(offset)]));
    }

    fn load8(&mut self, offset: u32) {
        self.ins
            .push(Instr::with(Op::I32Load8U, vec![Operand::U32(0), Operand::U32(offset)]));
    }

    fn store8(&mut self, offset: u32) {
        self.ins
            .push(Instr::with(Op::I32Store8, vec![Operand::U32(0), Operand::U32(offset)]));
    }

    /// Value channel → i32 pointer (addresses are exact unsigned ints).
    fn vt_to_ptr(&mut self) {
        if self.vt == ValType::F64 {
            self.op(Op::I32TruncF64U);
        }
    }

    /// Value channel → i32 with ToInt32-style saturation.
    fn vt_to_i32(&mut self) {
        if self.vt == ValType::F64 {
            self.op(Op::I32TruncSatF64S);
        }
    }

    /// i32 (unsigned: pointers, lengths, bools) → value channel.
    fn ptr_to_vt(&mut self) {
        if self.vt == ValType::F64 {
            self.op(Op::F64ConvertI32U);
        }
    }

    /// Equality on the value channel.
    fn vt_eq(&mut self) {
        match self.vt {
            ValType::F64 => self.op(Op::F64Eq),
            _ => self.op(Op::I32Eq),
        }
    }

    fn vt_add(&mut self) {
        match self.vt {
            ValType::F64 => self.op(Op::F64Add),
            _ => self.op(Op::I32Add),
        }
    }

    fn finish(self, results: Vec<ValType>) -> BuiltinBody {
        BuiltinBody {
            params: self.params,
            param_names: self.param_names,
            results,
            locals: self.locals,
            body: self.ins,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Helper bodies
// ══════════════════════════════════════════════════════════════════════════════

/// Generate the body of the named helper, or `None` if the name is not a
/// registered built-in. `pool` receives any string constants the body
/// references.
pub fn emit(name: &str, vt: ValType, pool: &mut StringPool) -> Option<BuiltinBody> {
    match name {
        "#alloc" => Some(emit_alloc(vt)),
        "#memcmp" => Some(emit_memcmp(vt)),
        "#js_truthy" => Some(emit_truthy(vt)),
        "#js_tonumber" => Some(emit_tonumber(vt)),
        "#js_fmod" => Some(emit_fmod(vt)),
        "#js_round" => Some(emit_round(vt)),
        "#js_add" => Some(emit_add(vt)),
        "#js_eq" => Some(emit_eq(vt, false)),
        "#js_seq" => Some(emit_eq(vt, true)),
        "#js_lt" => Some(emit_cmp(vt, Op::F64Lt, Op::I32LtS)),
        "#js_le" => Some(emit_cmp(vt, Op::F64Le, Op::I32LeS)),
        "#js_gt" => Some(emit_cmp(vt, Op::F64Gt, Op::I32GtS)),
        "#js_ge" => Some(emit_cmp(vt, Op::F64Ge, Op::I32GeS)),
        "#to_string" => Some(emit_to_string(vt, pool)),
        "#number_to_string" => Some(emit_number_to_string(vt, pool)),
        "#string_concat" => Some(emit_string_concat(vt)),
        "#string_eq" => Some(emit_string_eq(vt)),
        "#string_cmp" => Some(emit_string_cmp(vt)),
        "#typeof_name" => Some(emit_typeof_name(vt, pool)),
        "#print_string" => Some(emit_print_string(vt)),
        "#print_value" => Some(emit_print_value(vt, pool)),
        "#string_length" => Some(emit_string_length(vt)),
        "#string_charCodeAt" => Some(emit_string_char_code_at(vt)),
        "#string_charAt" => Some(emit_string_char_at(vt)),
        _ => None,
    }
}

/// `#alloc(size) -> ptr` — bump allocator over the heap region, growing
/// memory when the cursor passes the current end.
fn emit_alloc(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("size", ValType::I32)]);
    let old = b.local("old", ValType::I32);

    b.u32(Op::GlobalGet, HEAP_GLOBAL);
    b.set(old);
    // cursor += round8(size)
    b.u32(Op::GlobalGet, HEAP_GLOBAL);
    b.get(0);
    b.i32c(7);
    b.op(Op::I32Add);
    b.i32c(-8);
    b.op(Op::I32And);
    b.op(Op::I32Add);
    b.u32(Op::GlobalSet, HEAP_GLOBAL);

    // grow when the cursor is past memory.size pages
    b.block(BlockType::Empty);
    b.u32(Op::GlobalGet, HEAP_GLOBAL);
    b.u32(Op::MemorySize, 0);
    b.i32c(16);
    b.op(Op::I32Shl);
    b.op(Op::I32LeU);
    b.br_if(0);
    b.u32(Op::GlobalGet, HEAP_GLOBAL);
    b.i32c(65535);
    b.op(Op::I32Add);
    b.i32c(16);
    b.op(Op::I32ShrU);
    b.u32(Op::MemorySize, 0);
    b.op(Op::I32Sub);
    b.u32(Op::MemoryGrow, 0);
    b.op(Op::Drop);
    b.end();

    b.get(old);
    b.finish(vec![ValType::I32])
}

/// `#memcmp(a, b, len) -> i32` — 1 when `len` bytes match.
fn emit_memcmp(vt: ValType) -> BuiltinBody {
    let mut b = B::new(
        vt,
        &[("a", ValType::I32), ("b", ValType::I32), ("len", ValType::I32)],
    );
    let i = b.local("i", ValType::I32);

    b.block(BlockType::Empty);
    b.loop_(BlockType::Empty);
    // all bytes compared → equal
    b.get(i);
    b.get(2);
    b.op(Op::I32GeU);
    b.br_if(1);
    // bytes differ → return 0
    b.get(0);
    b.get(i);
    b.op(Op::I32Add);
    b.load8(0);
    b.get(1);
    b.get(i);
    b.op(Op::I32Add);
    b.load8(0);
    b.op(Op::I32Ne);
    b.if_(BlockType::Empty);
    b.i32c(0);
    b.op(Op::Return);
    b.end();
    // i += 1
    b.get(i);
    b.i32c(1);
    b.op(Op::I32Add);
    b.set(i);
    b.br(0);
    b.end();
    b.end();

    b.i32c(1);
    b.finish(vec![ValType::I32])
}

/// `#js_truthy(v, t) -> i32`.
fn emit_truthy(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("v", vt), ("t", ValType::I32)]);

    b.get(1);
    b.i32c(TypeId::Number.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    if vt == ValType::F64 {
        // nonzero and not NaN
        b.get(0);
        b.f64c(0.0);
        b.op(Op::F64Ne);
        b.get(0);
        b.get(0);
        b.op(Op::F64Eq);
        b.op(Op::I32And);
    } else {
        b.get(0);
        b.i32c(0);
        b.op(Op::I32Ne);
    }
    b.else_();
    b.get(1);
    b.i32c(TypeId::Boolean.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.get(0);
    b.vt_to_ptr();
    b.else_();
    b.get(1);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    // non-empty string
    b.get(0);
    b.vt_to_ptr();
    b.load(0);
    b.i32c(0);
    b.op(Op::I32Ne);
    b.else_();
    // undefined (0) and null (1) are falsy; everything else is truthy
    b.get(1);
    b.i32c(TypeId::Null.as_i32());
    b.op(Op::I32GtS);
    b.end();
    b.end();
    b.end();

    b.finish(vec![ValType::I32])
}

/// `#js_tonumber(v, t) -> VT`. Numbers and booleans pass through, null is
/// 0, everything else (including numeric strings) is NaN.
fn emit_tonumber(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("v", vt), ("t", ValType::I32)]);

    b.get(1);
    b.i32c(TypeId::Number.as_i32());
    b.op(Op::I32Eq);
    b.get(1);
    b.i32c(TypeId::Boolean.as_i32());
    b.op(Op::I32Eq);
    b.op(Op::I32Or);
    b.if_(BlockType::Value(vt));
    b.get(0);
    b.else_();
    b.get(1);
    b.i32c(TypeId::Null.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(vt));
    b.vtc(0.0);
    b.else_();
    if vt == ValType::F64 {
        b.f64c(f64::NAN);
    } else {
        b.i32c(0);
    }
    b.end();
    b.end();

    b.finish(vec![vt])
}

/// `#js_fmod(a, b) -> VT` — remainder; `a - trunc(a/b) * b` on f64.
fn emit_fmod(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("a", vt), ("b", vt)]);
    if vt == ValType::F64 {
        b.get(0);
        b.get(0);
        b.get(1);
        b.op(Op::F64Div);
        b.op(Op::F64Trunc);
        b.get(1);
        b.op(Op::F64Mul);
        b.op(Op::F64Sub);
    } else {
        b.get(0);
        b.get(1);
        b.op(Op::I32RemS);
    }
    b.finish(vec![vt])
}

/// `#js_round(v) -> VT` — round half towards +∞.
///
/// `floor(v + 0.5)` with a correction for the boundary where the
/// addition itself rounds up (e.g. the largest double below 0.5):
/// whenever the candidate exceeds `v` by more than a half, step back.
/// NaN and the infinities pass through both steps unchanged.
fn emit_round(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("v", vt)]);
    if vt == ValType::F64 {
        let r = b.local("r", ValType::F64);
        b.get(0);
        b.f64c(0.5);
        b.op(Op::F64Add);
        b.op(Op::F64Floor);
        b.set(r);
        b.get(r);
        b.get(0);
        b.op(Op::F64Sub);
        b.f64c(0.5);
        b.op(Op::F64Gt);
        b.if_(BlockType::Empty);
        b.get(r);
        b.f64c(1.0);
        b.op(Op::F64Sub);
        b.set(r);
        b.end();
        b.get(r);
    } else {
        // integer value type: already rounded
        b.get(0);
    }
    b.finish(vec![vt])
}

/// `#js_add(av, at, bv, bt) -> (VT, i32)` — numeric add, string
/// concatenation when either side is a string, numeric coercion otherwise.
fn emit_add(vt: ValType) -> BuiltinBody {
    let mut b = B::new(
        vt,
        &[("av", vt), ("at", ValType::I32), ("bv", vt), ("bt", ValType::I32)],
    );
    let rv = b.local("rv", vt);
    let rt = b.local("rt", ValType::I32);

    b.get(1);
    b.i32c(TypeId::Number.as_i32());
    b.op(Op::I32Eq);
    b.get(3);
    b.i32c(TypeId::Number.as_i32());
    b.op(Op::I32Eq);
    b.op(Op::I32And);
    b.if_(BlockType::Empty);
    b.get(0);
    b.get(2);
    b.vt_add();
    b.set(rv);
    b.i32c(TypeId::Number.as_i32());
    b.set(rt);
    b.else_();
    b.get(1);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.get(3);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.op(Op::I32Or);
    b.if_(BlockType::Empty);
    b.get(0);
    b.get(1);
    b.call_helper("#to_string");
    b.get(2);
    b.get(3);
    b.call_helper("#to_string");
    b.call_helper("#string_concat");
    b.ptr_to_vt();
    b.set(rv);
    b.i32c(TypeId::String.as_i32());
    b.set(rt);
    b.else_();
    b.get(0);
    b.get(1);
    b.call_helper("#js_tonumber");
    b.get(2);
    b.get(3);
    b.call_helper("#js_tonumber");
    b.vt_add();
    b.set(rv);
    b.i32c(TypeId::Number.as_i32());
    b.set(rt);
    b.end();
    b.end();

    b.get(rv);
    b.get(rt);
    b.finish(vec![vt, ValType::I32])
}

/// `#js_eq` / `#js_seq` — loose and strict equality, returning a boolean
/// value pair.
fn emit_eq(vt: ValType, strict: bool) -> BuiltinBody {
    let mut b = B::new(
        vt,
        &[("av", vt), ("at", ValType::I32), ("bv", vt), ("bt", ValType::I32)],
    );
    let r = b.local("r", ValType::I32);

    b.get(1);
    b.get(3);
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    // same kind: strings by content, everything else on the value channel
    b.get(1);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    b.get(0);
    b.vt_to_ptr();
    b.get(2);
    b.vt_to_ptr();
    b.call_helper("#string_eq");
    b.set(r);
    b.else_();
    b.get(0);
    b.get(2);
    b.vt_eq();
    b.set(r);
    b.end();
    b.else_();
    if !strict {
        // undefined == null
        b.get(1);
        b.i32c(TypeId::Null.as_i32());
        b.op(Op::I32LeS);
        b.get(3);
        b.i32c(TypeId::Null.as_i32());
        b.op(Op::I32LeS);
        b.op(Op::I32And);
        b.if_(BlockType::Empty);
        b.i32c(1);
        b.set(r);
        b.else_();
        // number ↔ boolean compare after coercion; anything else is false
        b.get(1);
        b.i32c(TypeId::Number.as_i32());
        b.op(Op::I32Eq);
        b.get(1);
        b.i32c(TypeId::Boolean.as_i32());
        b.op(Op::I32Eq);
        b.op(Op::I32Or);
        b.get(3);
        b.i32c(TypeId::Number.as_i32());
        b.op(Op::I32Eq);
        b.get(3);
        b.i32c(TypeId::Boolean.as_i32());
        b.op(Op::I32Eq);
        b.op(Op::I32Or);
        b.op(Op::I32And);
        b.if_(BlockType::Empty);
        b.get(0);
        b.get(1);
        b.call_helper("#js_tonumber");
        b.get(2);
        b.get(3);
        b.call_helper("#js_tonumber");
        b.vt_eq();
        b.set(r);
        b.else_();
        b.i32c(0);
        b.set(r);
        b.end();
        b.end();
    } else {
        b.i32c(0);
        b.set(r);
    }
    b.end();

    b.get(r);
    b.ptr_to_vt();
    b.i32c(TypeId::Boolean.as_i32());
    b.finish(vec![vt, ValType::I32])
}

/// Relational comparison: strings lexicographically, otherwise numeric.
fn emit_cmp(vt: ValType, f64_op: Op, i32_op: Op) -> BuiltinBody {
    let mut b = B::new(
        vt,
        &[("av", vt), ("at", ValType::I32), ("bv", vt), ("bt", ValType::I32)],
    );
    let r = b.local("r", ValType::I32);

    b.get(1);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.get(3);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.op(Op::I32And);
    b.if_(BlockType::Empty);
    b.get(0);
    b.vt_to_ptr();
    b.get(2);
    b.vt_to_ptr();
    b.call_helper("#string_cmp");
    b.i32c(0);
    b.op(i32_op);
    b.set(r);
    b.else_();
    b.get(0);
    b.get(1);
    b.call_helper("#js_tonumber");
    b.get(2);
    b.get(3);
    b.call_helper("#js_tonumber");
    if vt == ValType::F64 {
        b.op(f64_op);
    } else {
        b.op(i32_op);
    }
    b.set(r);
    b.end();

    b.get(r);
    b.ptr_to_vt();
    b.i32c(TypeId::Boolean.as_i32());
    b.finish(vec![vt, ValType::I32])
}

/// `#to_string(v, t) -> ptr`.
fn emit_to_string(vt: ValType, pool: &mut StringPool) -> BuiltinBody {
    let s_true = pool.intern("true");
    let s_false = pool.intern("false");
    let s_undefined = pool.intern("undefined");
    let s_null = pool.intern("null");
    let s_function = pool.intern("function");
    let s_object = pool.intern("[object]");

    let mut b = B::new(vt, &[("v", vt), ("t", ValType::I32)]);

    b.get(1);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.get(0);
    b.vt_to_ptr();
    b.else_();
    b.get(1);
    b.i32c(TypeId::Number.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.get(0);
    b.call_helper("#number_to_string");
    b.else_();
    b.get(1);
    b.i32c(TypeId::Boolean.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.get(0);
    b.vt_to_ptr();
    b.if_(BlockType::Value(ValType::I32));
    b.i32c(s_true as i32);
    b.else_();
    b.i32c(s_false as i32);
    b.end();
    b.else_();
    b.get(1);
    b.i32c(TypeId::Undefined.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.i32c(s_undefined as i32);
    b.else_();
    b.get(1);
    b.i32c(TypeId::Null.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.i32c(s_null as i32);
    b.else_();
    b.get(1);
    b.i32c(TypeId::Function.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.i32c(s_function as i32);
    b.else_();
    b.i32c(s_object as i32);
    b.end();
    b.end();
    b.end();
    b.end();
    b.end();
    b.end();

    b.finish(vec![ValType::I32])
}

/// `#number_to_string(v) -> ptr` — exact decimal digits for integral
/// values in the safe range; NaN and non-integral values fall back to
/// interned constants. Digits are written right-to-left into a scratch
/// buffer, then the length word lands just before the first digit.
fn emit_number_to_string(vt: ValType, pool: &mut StringPool) -> BuiltinBody {
    let s_nan = pool.intern("NaN");
    let s_number = pool.intern("[number]");

    let mut b = B::new(vt, &[("v", vt)]);
    let neg = b.local("neg", ValType::I32);
    let n = b.local("n", ValType::I64);
    let buf = b.local("buf", ValType::I32);
    let pos = b.local("pos", ValType::I32);
    let res = b.local("res", ValType::I32);

    if vt == ValType::F64 {
        // NaN → "NaN"
        b.get(0);
        b.get(0);
        b.op(Op::F64Ne);
        b.if_(BlockType::Empty);
        b.i32c(s_nan as i32);
        b.op(Op::Return);
        b.end();
        // non-integral or outside 2^53 → placeholder
        b.get(0);
        b.op(Op::F64Trunc);
        b.get(0);
        b.op(Op::F64Ne);
        b.get(0);
        b.op(Op::F64Abs);
        b.f64c(9007199254740992.0);
        b.op(Op::F64Ge);
        b.op(Op::I32Or);
        b.if_(BlockType::Empty);
        b.i32c(s_number as i32);
        b.op(Op::Return);
        b.end();

        b.get(0);
        b.f64c(0.0);
        b.op(Op::F64Lt);
        b.set(neg);
        b.get(0);
        b.op(Op::F64Abs);
        b.op(Op::I64TruncF64S);
        b.set(n);
    } else {
        b.get(0);
        b.i32c(0);
        b.op(Op::I32LtS);
        b.set(neg);
        b.get(0);
        b.get(0);
        b.i32c(31);
        b.op(Op::I32ShrS);
        b.op(Op::I32Xor);
        b.get(0);
        b.i32c(31);
        b.op(Op::I32ShrS);
        b.op(Op::I32Sub);
        b.op(Op::I64ExtendI32S);
        b.set(n);
    }

    // buf = alloc(32); digits grow down from buf + 32
    b.i32c(32);
    b.call_helper("#alloc");
    b.set(buf);
    b.get(buf);
    b.i32c(32);
    b.op(Op::I32Add);
    b.set(pos);

    b.get(n);
    b.op(Op::I64Eqz);
    b.if_(BlockType::Empty);
    b.get(pos);
    b.i32c(1);
    b.op(Op::I32Sub);
    b.set(pos);
    b.get(pos);
    b.i32c(48);
    b.store8(0);
    b.else_();
    b.block(BlockType::Empty);
    b.loop_(BlockType::Empty);
    b.get(n);
    b.op(Op::I64Eqz);
    b.br_if(1);
    b.get(pos);
    b.i32c(1);
    b.op(Op::I32Sub);
    b.set(pos);
    b.get(pos);
    b.get(n);
    b.i64c(10);
    b.op(Op::I64RemU);
    b.op(Op::I32WrapI64);
    b.i32c(48);
    b.op(Op::I32Add);
    b.store8(0);
    b.get(n);
    b.i64c(10);
    b.op(Op::I64DivU);
    b.set(n);
    b.br(0);
    b.end();
    b.end();
    b.end();

    b.get(neg);
    b.if_(BlockType::Empty);
    b.get(pos);
    b.i32c(1);
    b.op(Op::I32Sub);
    b.set(pos);
    b.get(pos);
    b.i32c(45);
    b.store8(0);
    b.end();

    // length word immediately before the digits
    b.get(pos);
    b.i32c(4);
    b.op(Op::I32Sub);
    b.set(res);
    b.get(res);
    b.get(buf);
    b.i32c(32);
    b.op(Op::I32Add);
    b.get(pos);
    b.op(Op::I32Sub);
    b.store_unaligned(0);
    b.get(res);
    b.finish(vec![ValType::I32])
}

/// `#string_concat(a, b) -> ptr`.
fn emit_string_concat(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("a", ValType::I32), ("b", ValType::I32)]);
    let la = b.local("la", ValType::I32);
    let lb = b.local("lb", ValType::I32);
    let res = b.local("res", ValType::I32);

    b.get(0);
    b.load(0);
    b.set(la);
    b.get(1);
    b.load(0);
    b.set(lb);

    b.i32c(4);
    b.get(la);
    b.op(Op::I32Add);
    b.get(lb);
    b.op(Op::I32Add);
    b.call_helper("#alloc");
    b.set(res);

    b.get(res);
    b.get(la);
    b.get(lb);
    b.op(Op::I32Add);
    b.store(0);

    // copy a's bytes, then b's
    b.get(res);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(0);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(la);
    b.ins.push(Instr::with(
        Op::MemoryCopy,
        vec![Operand::U32(0), Operand::U32(0)],
    ));
    b.get(res);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(la);
    b.op(Op::I32Add);
    b.get(1);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(lb);
    b.ins.push(Instr::with(
        Op::MemoryCopy,
        vec![Operand::U32(0), Operand::U32(0)],
    ));

    b.get(res);
    b.finish(vec![ValType::I32])
}

/// `#string_eq(a, b) -> i32`.
fn emit_string_eq(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("a", ValType::I32), ("b", ValType::I32)]);

    b.get(0);
    b.load(0);
    b.get(1);
    b.load(0);
    b.op(Op::I32Ne);
    b.if_(BlockType::Empty);
    b.i32c(0);
    b.op(Op::Return);
    b.end();

    b.get(0);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(1);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(0);
    b.load(0);
    b.call_helper("#memcmp");
    b.finish(vec![ValType::I32])
}

/// `#string_cmp(a, b) -> i32` — byte-lexicographic, -1/0/1.
fn emit_string_cmp(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("a", ValType::I32), ("b", ValType::I32)]);
    let la = b.local("la", ValType::I32);
    let lb = b.local("lb", ValType::I32);
    let min = b.local("min", ValType::I32);
    let i = b.local("i", ValType::I32);
    let ca = b.local("ca", ValType::I32);
    let cb = b.local("cb", ValType::I32);

    b.get(0);
    b.load(0);
    b.set(la);
    b.get(1);
    b.load(0);
    b.set(lb);
    b.get(la);
    b.get(lb);
    b.get(la);
    b.get(lb);
    b.op(Op::I32LtU);
    b.op(Op::Select);
    b.set(min);

    b.block(BlockType::Empty);
    b.loop_(BlockType::Empty);
    b.get(i);
    b.get(min);
    b.op(Op::I32GeU);
    b.br_if(1);
    b.get(0);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(i);
    b.op(Op::I32Add);
    b.load8(0);
    b.set(ca);
    b.get(1);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(i);
    b.op(Op::I32Add);
    b.load8(0);
    b.set(cb);
    b.get(ca);
    b.get(cb);
    b.op(Op::I32Ne);
    b.if_(BlockType::Empty);
    b.i32c(-1);
    b.i32c(1);
    b.get(ca);
    b.get(cb);
    b.op(Op::I32LtU);
    b.op(Op::Select);
    b.op(Op::Return);
    b.end();
    b.get(i);
    b.i32c(1);
    b.op(Op::I32Add);
    b.set(i);
    b.br(0);
    b.end();
    b.end();

    // shorter string sorts first
    b.get(la);
    b.get(lb);
    b.op(Op::I32Eq);
    b.if_(BlockType::Value(ValType::I32));
    b.i32c(0);
    b.else_();
    b.i32c(-1);
    b.i32c(1);
    b.get(la);
    b.get(lb);
    b.op(Op::I32LtU);
    b.op(Op::Select);
    b.end();
    b.finish(vec![ValType::I32])
}

/// `#typeof_name(t) -> ptr` — the `typeof` string for a type-id.
fn emit_typeof_name(vt: ValType, pool: &mut StringPool) -> BuiltinBody {
    let mut b = B::new(vt, &[("t", ValType::I32)]);

    // Kinds with a distinct typeof string; everything else is "object".
    let distinct = [
        TypeId::Undefined,
        TypeId::Boolean,
        TypeId::Number,
        TypeId::String,
        TypeId::Function,
        TypeId::Symbol,
        TypeId::BigInt,
    ];
    let object = pool.intern("object") as i32;
    let interned: Vec<(TypeId, i32)> = distinct
        .iter()
        .map(|&ty| (ty, pool.intern(ty.typeof_name()) as i32))
        .collect();

    for &(ty, ptr) in &interned {
        b.get(0);
        b.i32c(ty.as_i32());
        b.op(Op::I32Eq);
        b.if_(BlockType::Value(ValType::I32));
        b.i32c(ptr);
        b.else_();
    }
    b.i32c(object);
    for _ in &interned {
        b.end();
    }

    b.finish(vec![ValType::I32])
}

/// `#print_string(ptr)` — one `printChar` call per byte.
fn emit_print_string(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("ptr", ValType::I32)]);
    let len = b.local("len", ValType::I32);
    let i = b.local("i", ValType::I32);

    b.get(0);
    b.load(0);
    b.set(len);
    b.block(BlockType::Empty);
    b.loop_(BlockType::Empty);
    b.get(i);
    b.get(len);
    b.op(Op::I32GeU);
    b.br_if(1);
    b.get(0);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(i);
    b.op(Op::I32Add);
    b.load8(0);
    b.call_import(IMPORT_PRINT_CHAR);
    b.get(i);
    b.i32c(1);
    b.op(Op::I32Add);
    b.set(i);
    b.br(0);
    b.end();
    b.end();
    b.finish(vec![])
}

/// `#print_value(v, t)` — dispatch on the type-id.
fn emit_print_value(vt: ValType, pool: &mut StringPool) -> BuiltinBody {
    let s_true = pool.intern("true");
    let s_false = pool.intern("false");
    let s_undefined = pool.intern("undefined");
    let s_null = pool.intern("null");
    let s_function = pool.intern("function");

    let mut b = B::new(vt, &[("v", vt), ("t", ValType::I32)]);

    b.get(1);
    b.i32c(TypeId::Number.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    b.get(0);
    if vt != ValType::F64 {
        b.op(Op::F64ConvertI32S);
    }
    b.call_import(IMPORT_PRINT);
    b.else_();
    b.get(1);
    b.i32c(TypeId::String.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    b.get(0);
    b.vt_to_ptr();
    b.call_helper("#print_string");
    b.else_();
    b.get(1);
    b.i32c(TypeId::Boolean.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    b.get(0);
    b.vt_to_ptr();
    b.if_(BlockType::Value(ValType::I32));
    b.i32c(s_true as i32);
    b.else_();
    b.i32c(s_false as i32);
    b.end();
    b.call_helper("#print_string");
    b.else_();
    b.get(1);
    b.i32c(TypeId::Undefined.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    b.i32c(s_undefined as i32);
    b.call_helper("#print_string");
    b.else_();
    b.get(1);
    b.i32c(TypeId::Null.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    b.i32c(s_null as i32);
    b.call_helper("#print_string");
    b.else_();
    b.get(1);
    b.i32c(TypeId::Function.as_i32());
    b.op(Op::I32Eq);
    b.if_(BlockType::Empty);
    b.i32c(s_function as i32);
    b.call_helper("#print_string");
    b.else_();
    b.get(0);
    if vt != ValType::F64 {
        b.op(Op::F64ConvertI32S);
    }
    b.call_import(IMPORT_PRINT);
    b.end();
    b.end();
    b.end();
    b.end();
    b.end();
    b.end();
    b.finish(vec![])
}

/// `#string_length(this, t) -> (VT, i32)`.
fn emit_string_length(vt: ValType) -> BuiltinBody {
    let mut b = B::new(vt, &[("this", vt), ("t", ValType::I32)]);
    b.get(0);
    b.vt_to_ptr();
    b.load(0);
    b.ptr_to_vt();
    b.i32c(TypeId::Number.as_i32());
    b.finish(vec![vt, ValType::I32])
}

/// `#string_charCodeAt(this, t, i, it) -> (VT, i32)` — NaN out of range.
fn emit_string_char_code_at(vt: ValType) -> BuiltinBody {
    let mut b = B::new(
        vt,
        &[("this", vt), ("t", ValType::I32), ("i", vt), ("it", ValType::I32)],
    );
    let ptr = b.local("ptr", ValType::I32);
    let idx = b.local("idx", ValType::I32);

    b.get(0);
    b.vt_to_ptr();
    b.set(ptr);
    b.get(2);
    b.get(3);
    b.call_helper("#js_tonumber");
    b.vt_to_i32();
    b.set(idx);

    b.get(idx);
    b.i32c(0);
    b.op(Op::I32LtS);
    b.get(idx);
    b.get(ptr);
    b.load(0);
    b.op(Op::I32GeS);
    b.op(Op::I32Or);
    b.if_(BlockType::Value(vt));
    if vt == ValType::F64 {
        b.f64c(f64::NAN);
    } else {
        b.i32c(-1);
    }
    b.else_();
    b.get(ptr);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(idx);
    b.op(Op::I32Add);
    b.load8(0);
    b.ptr_to_vt();
    b.end();
    b.i32c(TypeId::Number.as_i32());
    b.finish(vec![vt, ValType::I32])
}

/// `#string_charAt(this, t, i, it) -> (VT, i32)` — one-byte string, empty
/// out of range.
fn emit_string_char_at(vt: ValType) -> BuiltinBody {
    let mut b = B::new(
        vt,
        &[("this", vt), ("t", ValType::I32), ("i", vt), ("it", ValType::I32)],
    );
    let ptr = b.local("ptr", ValType::I32);
    let idx = b.local("idx", ValType::I32);
    let res = b.local("res", ValType::I32);

    b.get(0);
    b.vt_to_ptr();
    b.set(ptr);
    b.get(2);
    b.get(3);
    b.call_helper("#js_tonumber");
    b.vt_to_i32();
    b.set(idx);

    b.get(idx);
    b.i32c(0);
    b.op(Op::I32LtS);
    b.get(idx);
    b.get(ptr);
    b.load(0);
    b.op(Op::I32GeS);
    b.op(Op::I32Or);
    b.if_(BlockType::Empty);
    // empty string
    b.i32c(8);
    b.call_helper("#alloc");
    b.set(res);
    b.get(res);
    b.i32c(0);
    b.store(0);
    b.else_();
    b.i32c(8);
    b.call_helper("#alloc");
    b.set(res);
    b.get(res);
    b.i32c(1);
    b.store(0);
    b.get(res);
    b.get(ptr);
    b.i32c(4);
    b.op(Op::I32Add);
    b.get(idx);
    b.op(Op::I32Add);
    b.load8(0);
    b.store8(4);
    b.end();

    b.get(res);
    b.ptr_to_vt();
    b.i32c(TypeId::String.as_i32());
    b.finish(vec![vt, ValType::I32])
}
