//! The typed Wasm intermediate representation.
//!
//! The generator builds an [`IrModule`]; the peephole optimizer rewrites
//! it in place; the assembler serializes it. Instruction operands are raw
//! integers and floats — LEB encoding happens only at assembly.
//!
//! Function indices live in one space: imports first (fixed ordinals from
//! the built-in registry), then defined functions in order of creation.
//! The assembler renumbers both when tree-shaking drops unused imports.

use crate::error::{CodegenError, CodegenResult};
use crate::types::FuncFlags;
use crate::wasm::{BlockType, Op, ValType};
use std::collections::{BTreeMap, HashMap};

// ══════════════════════════════════════════════════════════════════════════════
// Instructions
// ══════════════════════════════════════════════════════════════════════════════

/// An instruction operand, not yet encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    I32(i32),
    I64(i64),
    F64(f64),
    U32(u32),
    Block(BlockType),
}

/// A single IR instruction.
///
/// The deferred form captures a forward reference to a function whose
/// final body is not lowered yet; [`Deferred::resolve`] patches it into a
/// plain call before assembly. After the resolution pass no deferred form
/// may remain anywhere in the module.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Plain { op: Op, operands: Vec<Operand> },
    Deferred(Deferred),
}

impl Instr {
    /// An instruction with no operands.
    pub fn op(op: Op) -> Instr {
        Instr::Plain {
            op,
            operands: Vec::new(),
        }
    }

    /// An instruction with operands.
    pub fn with(op: Op, operands: Vec<Operand>) -> Instr {
        Instr::Plain { op, operands }
    }

    /// Shorthand for single-`u32`-operand instructions (locals, branches,
    /// calls, globals).
    pub fn u32(op: Op, value: u32) -> Instr {
        Instr::with(op, vec![Operand::U32(value)])
    }
}

/// A forward reference to a function by unique name.
#[derive(Debug, Clone, PartialEq)]
pub struct Deferred {
    /// Unique name of the target function.
    pub target: String,
    /// Resolve to `return_call` instead of `call`.
    pub tail: bool,
}

impl Deferred {
    /// Resolve against the module's final name → index table.
    pub fn resolve(&self, indices: &HashMap<String, u32>) -> CodegenResult<Instr> {
        let &index = indices.get(&self.target).ok_or_else(|| {
            CodegenError::UnresolvedReference(format!(
                "deferred call to unknown function '{}'",
                self.target
            ))
        })?;
        let op = if self.tail { Op::ReturnCall } else { Op::Call };
        Ok(Instr::u32(op, index))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Records
// ══════════════════════════════════════════════════════════════════════════════

/// Per-function lowering state.
///
/// ```text
/// Unseen → Scheduled → Lowering → DeferredPatched → Lowered
/// ```
///
/// Only `Lowered` functions may be optimized or assembled. Reentry while
/// `Lowering` signals recursion; the caller emits a deferred reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerState {
    Unseen,
    Scheduled,
    Lowering,
    DeferredPatched,
    Lowered,
}

/// One local slot. Slots are numbered contiguously after the parameters.
#[derive(Debug, Clone)]
pub struct LocalRecord {
    pub name: String,
    pub ty: ValType,
}

/// A function being (or already) lowered.
#[derive(Debug)]
pub struct FuncRecord {
    /// Unique name (`#main`, user unique names, `#`-prefixed helpers).
    pub name: String,
    /// Absolute index (imports precede defined functions).
    pub index: u32,
    pub params: Vec<ValType>,
    /// Names for the name section, one per parameter.
    pub param_names: Vec<String>,
    pub results: Vec<ValType>,
    pub locals: Vec<LocalRecord>,
    pub body: Vec<Instr>,
    pub flags: FuncFlags,
    pub state: LowerState,
    /// Slot of the `#last_type` scratch local, when allocated. The
    /// optimizer elides dead writes to it.
    pub last_type_slot: Option<u32>,
    /// Export name, when exported.
    pub export: Option<String>,
}

/// A host import. Ordinals are fixed at declaration; unused imports are
/// dropped and the index space renumbered during assembly.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub module: String,
    pub name: String,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub index: u32,
}

/// A module global.
#[derive(Debug)]
pub struct GlobalRecord {
    pub name: String,
    pub index: u32,
    pub ty: ValType,
    pub mutable: bool,
    pub init: Vec<Instr>,
}

/// Bytes placed in linear memory at a fixed offset, with a symbolic name.
#[derive(Debug)]
pub struct DataSegment {
    pub name: String,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// An exception tag: index plus parameter types.
#[derive(Debug)]
pub struct TagRecord {
    pub index: u32,
    pub params: Vec<ValType>,
}

/// Binds a language-level error constructor to a tag, so `throw`/`catch`
/// lower to Wasm `throw`/`catch`.
#[derive(Debug)]
pub struct ExceptionRecord {
    pub constructor: String,
    pub tag: u32,
}

/// Symbolic region name → page ordinal within linear memory.
#[derive(Debug, Default)]
pub struct PageMap {
    regions: BTreeMap<String, u32>,
}

impl PageMap {
    pub fn set(&mut self, region: &str, page: u32) {
        self.regions.insert(region.to_string(), page);
    }

    pub fn get(&self, region: &str) -> Option<u32> {
        self.regions.get(region).copied()
    }

    /// Base address of a region in bytes.
    pub fn base(&self, region: &str) -> Option<u32> {
        self.get(region).map(|p| p * crate::wasm::WASM_PAGE)
    }
}

/// A function signature, interned in the module's type table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

// ══════════════════════════════════════════════════════════════════════════════
// Module
// ══════════════════════════════════════════════════════════════════════════════

/// The aggregate IR: everything the assembler needs to emit a binary.
#[derive(Debug, Default)]
pub struct IrModule {
    /// Module name (for the custom name section).
    pub name: String,
    pub imports: Vec<ImportRecord>,
    pub funcs: Vec<FuncRecord>,
    pub globals: Vec<GlobalRecord>,
    pub tags: Vec<TagRecord>,
    pub exceptions: Vec<ExceptionRecord>,
    pub pages: PageMap,
    pub data: Vec<DataSegment>,
    /// Table slots (slot 0 is reserved null) → function names; resolved to
    /// indices at assembly. Holds every function whose address is taken.
    pub table: Vec<String>,
    /// Interned signatures; `call_indirect` operands index into this.
    pub types: Vec<FuncType>,
    /// Total linear-memory pages.
    pub memory_pages: u32,
    /// Optional start function index.
    pub start: Option<u32>,
}

impl IrModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Index the next defined function will get.
    pub fn next_func_index(&self) -> u32 {
        (self.imports.len() + self.funcs.len()) as u32
    }

    /// Number of imported functions (defined functions start after them).
    pub fn import_count(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Intern a signature and return its type index.
    pub fn type_index(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        let ty = FuncType { params, results };
        if let Some(pos) = self.types.iter().position(|t| *t == ty) {
            return pos as u32;
        }
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }

    /// Reserve a table slot for a function value. Slot 0 stays null so a
    /// zero function value traps instead of calling something.
    pub fn table_slot(&mut self, func_name: &str) -> u32 {
        if let Some(pos) = self.table.iter().position(|n| n == func_name) {
            return (pos + 1) as u32;
        }
        self.table.push(func_name.to_string());
        self.table.len() as u32
    }

    /// The final name → absolute index table (imports and functions).
    pub fn index_table(&self) -> HashMap<String, u32> {
        let mut map = HashMap::new();
        for imp in &self.imports {
            map.insert(format!("{}.{}", imp.module, imp.name), imp.index);
        }
        for f in &self.funcs {
            map.insert(f.name.clone(), f.index);
        }
        map
    }

    pub fn func_by_name(&self, name: &str) -> Option<&FuncRecord> {
        self.funcs.iter().find(|f| f.name == name)
    }

    pub fn func_by_name_mut(&mut self, name: &str) -> Option<&mut FuncRecord> {
        self.funcs.iter_mut().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_index_dedups() {
        let mut m = IrModule::new("t");
        let a = m.type_index(vec![ValType::F64], vec![]);
        let b = m.type_index(vec![ValType::I32], vec![ValType::I32]);
        let c = m.type_index(vec![ValType::F64], vec![]);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(m.types.len(), 2);
    }

    #[test]
    fn test_table_slot_zero_is_reserved() {
        let mut m = IrModule::new("t");
        assert_eq!(m.table_slot("f"), 1);
        assert_eq!(m.table_slot("g"), 2);
        assert_eq!(m.table_slot("f"), 1);
        assert_eq!(m.table.len(), 2);
    }

    #[test]
    fn test_deferred_resolution() {
        let mut indices = HashMap::new();
        indices.insert("f".to_string(), 7u32);
        let d = Deferred {
            target: "f".to_string(),
            tail: false,
        };
        assert_eq!(d.resolve(&indices).unwrap(), Instr::u32(Op::Call, 7));

        let t = Deferred {
            target: "f".to_string(),
            tail: true,
        };
        assert_eq!(t.resolve(&indices).unwrap(), Instr::u32(Op::ReturnCall, 7));

        let missing = Deferred {
            target: "g".to_string(),
            tail: false,
        };
        assert!(matches!(
            missing.resolve(&indices),
            Err(CodegenError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn test_page_map_base() {
        let mut pages = PageMap::default();
        pages.set("static", 0);
        pages.set("heap", 2);
        assert_eq!(pages.base("static"), Some(0));
        assert_eq!(pages.base("heap"), Some(131072));
        assert_eq!(pages.base("stack"), None);
    }

    #[test]
    fn test_next_func_index_counts_imports() {
        let mut m = IrModule::new("t");
        m.imports.push(ImportRecord {
            module: "env".into(),
            name: "print".into(),
            params: vec![ValType::F64],
            results: vec![],
            index: 0,
        });
        assert_eq!(m.next_func_index(), 1);
    }
}
