//! Binary assembly: [`IrModule`] → Wasm bytes.
//!
//! Order of operations: resolve deferred instructions, drop unreferenced
//! imports and renumber the function index space, then emit sections in
//! the order the binary format requires — magic/version, type, import,
//! function, table, memory, tag, global, export, start, element,
//! data-count, code, data, and the custom `name` section.

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{FuncType, Instr, IrModule, LocalRecord, LowerState, Operand};
use crate::wasm::{
    self, checked_u32, external, limits, BlockType, Op, OpEncoding, SectionId, ValType,
};
use std::collections::HashMap;

/// Serialize a module. Consumes the IR in the sense that indices are
/// rewritten in place; assemble once per module.
pub fn assemble(module: &mut IrModule) -> CodegenResult<Vec<u8>> {
    for f in &module.funcs {
        if f.state != LowerState::Lowered {
            return Err(CodegenError::Internal(format!(
                "function '{}' reached assembly in state {:?}",
                f.name, f.state
            )));
        }
    }
    if module.data.iter().map(|d| d.bytes.len()).sum::<usize>() > limits::MAX_DATA {
        return Err(CodegenError::LimitExceeded("data segment bytes".into()));
    }

    resolve_deferred(module)?;
    shake_imports(module)?;

    let mut out = Vec::with_capacity(4096);
    out.extend_from_slice(&wasm::MAGIC);
    out.extend_from_slice(&wasm::VERSION);

    // Intern every signature; instruction-level type indices (from
    // call_indirect) are already in `module.types` and stay stable
    // because type_index only appends.
    let import_types: Vec<u32> = module
        .imports
        .iter()
        .map(|i| (i.params.clone(), i.results.clone()))
        .collect::<Vec<_>>()
        .into_iter()
        .map(|(p, r)| module.type_index(p, r))
        .collect();
    let func_types: Vec<u32> = module
        .funcs
        .iter()
        .map(|f| (f.params.clone(), f.results.clone()))
        .collect::<Vec<_>>()
        .into_iter()
        .map(|(p, r)| module.type_index(p, r))
        .collect();
    let tag_types: Vec<u32> = module
        .tags
        .iter()
        .map(|t| t.params.clone())
        .collect::<Vec<_>>()
        .into_iter()
        .map(|p| module.type_index(p, vec![]))
        .collect();

    emit_type_section(module, &mut out)?;
    emit_import_section(module, &import_types, &mut out)?;
    emit_function_section(module, &func_types, &mut out)?;
    emit_table_section(module, &mut out)?;
    emit_memory_section(module, &mut out)?;
    emit_tag_section(module, &tag_types, &mut out)?;
    emit_global_section(module, &mut out)?;
    emit_export_section(module, &mut out)?;
    emit_start_section(module, &mut out)?;
    emit_element_section(module, &mut out)?;
    emit_data_count_section(module, &mut out)?;
    emit_code_section(module, &mut out)?;
    emit_data_section(module, &mut out)?;
    emit_name_section(module, &mut out)?;

    log::debug!(
        "assembled {} bytes ({} imports kept, {} functions)",
        out.len(),
        module.imports.len(),
        module.funcs.len()
    );
    Ok(out)
}

// ══════════════════════════════════════════════════════════════════════════════
// Deferred resolution
// ══════════════════════════════════════════════════════════════════════════════

/// Replace every deferred instruction with its resolved call. A deferred
/// form surviving this pass is a generator bug.
fn resolve_deferred(module: &mut IrModule) -> CodegenResult<()> {
    let indices = module.index_table();
    for func in &mut module.funcs {
        for instr in &mut func.body {
            if let Instr::Deferred(d) = instr {
                *instr = d.resolve(&indices)?;
            }
        }
    }
    // Second sweep: nothing deferred may remain anywhere in the module.
    for func in &module.funcs {
        for instr in &func.body {
            if let Instr::Deferred(d) = instr {
                return Err(CodegenError::UnresolvedReference(format!(
                    "deferred reference to '{}' survived resolution",
                    d.target
                )));
            }
        }
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Import tree-shaking
// ══════════════════════════════════════════════════════════════════════════════

/// Drop imports that no instruction references and renumber the function
/// index space (imports precede defined functions).
fn shake_imports(module: &mut IrModule) -> CodegenResult<()> {
    let import_count = module.import_count();
    let mut used = vec![false; import_count as usize];
    for func in &module.funcs {
        for instr in &func.body {
            if let Instr::Plain {
                op: Op::Call | Op::ReturnCall | Op::RefFunc,
                operands,
            } = instr
            {
                if let [Operand::U32(idx), ..] = operands.as_slice() {
                    if *idx < import_count {
                        used[*idx as usize] = true;
                    }
                }
            }
        }
    }

    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut kept = 0u32;
    for (old, &is_used) in used.iter().enumerate() {
        if is_used {
            remap.insert(old as u32, kept);
            kept += 1;
        }
    }
    let dropped = import_count - kept;
    for func in &module.funcs {
        remap.insert(func.index, func.index - dropped);
    }

    let shaken = module
        .imports
        .drain(..)
        .filter(|i| used[i.index as usize])
        .collect::<Vec<_>>();
    module.imports = shaken;
    for (new_idx, imp) in module.imports.iter_mut().enumerate() {
        imp.index = new_idx as u32;
    }
    for func in &mut module.funcs {
        func.index -= dropped;
        for instr in &mut func.body {
            if let Instr::Plain {
                op: Op::Call | Op::ReturnCall | Op::RefFunc,
                operands,
            } = instr
            {
                if let Some(Operand::U32(idx)) = operands.first().copied() {
                    let new = remap.get(&idx).ok_or_else(|| {
                        CodegenError::Internal(format!(
                            "call to import {idx} that was tree-shaken"
                        ))
                    })?;
                    operands[0] = Operand::U32(*new);
                }
            }
        }
    }
    if dropped > 0 {
        log::debug!("tree-shaking dropped {dropped} unused imports");
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Sections
// ══════════════════════════════════════════════════════════════════════════════

fn emit_section(id: SectionId, contents: Vec<u8>, out: &mut Vec<u8>) {
    out.push(id as u8);
    wasm::write_u32(out, contents.len() as u32);
    out.extend_from_slice(&contents);
}

fn write_functype(ty: &FuncType, buf: &mut Vec<u8>) {
    buf.push(0x60);
    wasm::write_u32(buf, ty.params.len() as u32);
    for p in &ty.params {
        buf.push(p.byte());
    }
    wasm::write_u32(buf, ty.results.len() as u32);
    for r in &ty.results {
        buf.push(r.byte());
    }
}

fn emit_type_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.types.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.types.len(), "type count")?);
    for ty in &module.types {
        write_functype(ty, &mut buf);
    }
    emit_section(SectionId::Type, buf, out);
    Ok(())
}

fn emit_import_section(
    module: &IrModule,
    import_types: &[u32],
    out: &mut Vec<u8>,
) -> CodegenResult<()> {
    if module.imports.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.imports.len(), "import count")?);
    for (imp, &ty) in module.imports.iter().zip(import_types) {
        wasm::write_name(&mut buf, &imp.module);
        wasm::write_name(&mut buf, &imp.name);
        buf.push(external::FUNC);
        wasm::write_u32(&mut buf, ty);
    }
    emit_section(SectionId::Import, buf, out);
    Ok(())
}

fn emit_function_section(
    module: &IrModule,
    func_types: &[u32],
    out: &mut Vec<u8>,
) -> CodegenResult<()> {
    if module.funcs.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.funcs.len(), "function count")?);
    for &ty in func_types {
        wasm::write_u32(&mut buf, ty);
    }
    emit_section(SectionId::Function, buf, out);
    Ok(())
}

fn emit_table_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.table.is_empty() {
        return Ok(());
    }
    let slots = checked_u32(module.table.len() + 1, "table size")?;
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, 1);
    buf.push(ValType::FuncRef.byte());
    buf.push(0x01); // min and max
    wasm::write_u32(&mut buf, slots);
    wasm::write_u32(&mut buf, slots);
    emit_section(SectionId::Table, buf, out);
    Ok(())
}

fn emit_memory_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, 1);
    buf.push(0x00); // min only
    wasm::write_u32(&mut buf, module.memory_pages.max(1));
    emit_section(SectionId::Memory, buf, out);
    Ok(())
}

fn emit_tag_section(module: &IrModule, tag_types: &[u32], out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.tags.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.tags.len(), "tag count")?);
    for &ty in tag_types {
        buf.push(0x00); // exception attribute
        wasm::write_u32(&mut buf, ty);
    }
    emit_section(SectionId::Tag, buf, out);
    Ok(())
}

fn emit_global_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.globals.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.globals.len(), "global count")?);
    for global in &module.globals {
        buf.push(global.ty.byte());
        buf.push(if global.mutable { 0x01 } else { 0x00 });
        for instr in &global.init {
            encode_instr(instr, &mut buf)?;
        }
        buf.push(0x0B); // end of init expression
    }
    emit_section(SectionId::Global, buf, out);
    Ok(())
}

fn emit_export_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    let exported: Vec<(&str, u32)> = module
        .funcs
        .iter()
        .filter_map(|f| f.export.as_deref().map(|n| (n, f.index)))
        .collect();
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(exported.len() + 1, "export count")?);
    for (name, index) in exported {
        wasm::write_name(&mut buf, name);
        buf.push(external::FUNC);
        wasm::write_u32(&mut buf, index);
    }
    // Linear memory is exported under the conventional name `$`.
    wasm::write_name(&mut buf, "$");
    buf.push(external::MEMORY);
    wasm::write_u32(&mut buf, 0);
    emit_section(SectionId::Export, buf, out);
    Ok(())
}

fn emit_start_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if let Some(start) = module.start {
        let mut buf = Vec::new();
        wasm::write_u32(&mut buf, start);
        emit_section(SectionId::Start, buf, out);
    }
    Ok(())
}

fn emit_element_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.table.is_empty() {
        return Ok(());
    }
    // Table names resolve through the renumbered index space.
    let indices = module.index_table();
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, 1); // one active segment
    wasm::write_u32(&mut buf, 0); // flags: table 0, funcref, active
    buf.push(0x41); // i32.const (slot 0 stays null)
    wasm::write_s32(&mut buf, 1);
    buf.push(0x0B);
    wasm::write_u32(&mut buf, checked_u32(module.table.len(), "element count")?);
    for name in &module.table {
        let index = indices.get(name).ok_or_else(|| {
            CodegenError::UnresolvedReference(format!("table entry '{name}' has no function"))
        })?;
        wasm::write_u32(&mut buf, *index);
    }
    emit_section(SectionId::Element, buf, out);
    Ok(())
}

fn emit_data_count_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.data.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.data.len(), "data count")?);
    emit_section(SectionId::DataCount, buf, out);
    Ok(())
}

fn emit_code_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.funcs.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.funcs.len(), "code count")?);
    for func in &module.funcs {
        let mut body = Vec::new();
        write_locals(&func.locals, &mut body)?;
        for instr in &func.body {
            encode_instr(instr, &mut body)?;
        }
        body.push(0x0B); // end of function body
        wasm::write_u32(&mut buf, checked_u32(body.len(), "body size")?);
        buf.extend_from_slice(&body);
    }
    emit_section(SectionId::Code, buf, out);
    Ok(())
}

/// Run-length encode consecutive locals of the same type.
fn write_locals(locals: &[LocalRecord], out: &mut Vec<u8>) -> CodegenResult<()> {
    let mut groups: Vec<(u32, ValType)> = Vec::new();
    for local in locals {
        match groups.last_mut() {
            Some((count, ty)) if *ty == local.ty => *count += 1,
            _ => groups.push((1, local.ty)),
        }
    }
    wasm::write_u32(out, checked_u32(groups.len(), "local group count")?);
    for (count, ty) in groups {
        wasm::write_u32(out, count);
        out.push(ty.byte());
    }
    Ok(())
}

fn emit_data_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    if module.data.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    wasm::write_u32(&mut buf, checked_u32(module.data.len(), "data count")?);
    for segment in &module.data {
        wasm::write_u32(&mut buf, 0); // active, memory 0
        buf.push(0x41); // i32.const offset
        wasm::write_s32(&mut buf, segment.offset as i32);
        buf.push(0x0B);
        wasm::write_u32(&mut buf, checked_u32(segment.bytes.len(), "segment size")?);
        buf.extend_from_slice(&segment.bytes);
    }
    emit_section(SectionId::Data, buf, out);
    Ok(())
}

/// Custom `name` section: module name, function names, local names.
fn emit_name_section(module: &IrModule, out: &mut Vec<u8>) -> CodegenResult<()> {
    let mut buf = Vec::new();
    wasm::write_name(&mut buf, "name");

    // module name (subsection 0)
    let mut sub = Vec::new();
    wasm::write_name(&mut sub, &module.name);
    buf.push(0);
    wasm::write_u32(&mut buf, sub.len() as u32);
    buf.extend_from_slice(&sub);

    // function names (subsection 1)
    let mut names: Vec<(u32, &str)> = module
        .imports
        .iter()
        .map(|i| (i.index, i.name.as_str()))
        .chain(module.funcs.iter().map(|f| (f.index, f.name.as_str())))
        .collect();
    names.sort_by_key(|&(i, _)| i);
    let mut sub = Vec::new();
    wasm::write_u32(&mut sub, names.len() as u32);
    for (index, name) in names {
        wasm::write_u32(&mut sub, index);
        wasm::write_name(&mut sub, name);
    }
    buf.push(1);
    wasm::write_u32(&mut buf, sub.len() as u32);
    buf.extend_from_slice(&sub);

    // local names (subsection 2)
    let mut sub = Vec::new();
    wasm::write_u32(&mut sub, module.funcs.len() as u32);
    let mut funcs: Vec<_> = module.funcs.iter().collect();
    funcs.sort_by_key(|f| f.index);
    for func in funcs {
        wasm::write_u32(&mut sub, func.index);
        let total = func.param_names.len() + func.locals.len();
        wasm::write_u32(&mut sub, total as u32);
        let mut slot = 0u32;
        for name in &func.param_names {
            wasm::write_u32(&mut sub, slot);
            wasm::write_name(&mut sub, name);
            slot += 1;
        }
        for local in &func.locals {
            wasm::write_u32(&mut sub, slot);
            wasm::write_name(&mut sub, &local.name);
            slot += 1;
        }
    }
    buf.push(2);
    wasm::write_u32(&mut buf, sub.len() as u32);
    buf.extend_from_slice(&sub);

    emit_section(SectionId::Custom, buf, out);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Instruction encoding
// ══════════════════════════════════════════════════════════════════════════════

fn operand_u32(operands: &[Operand], pos: usize, op: Op) -> CodegenResult<u32> {
    match operands.get(pos) {
        Some(Operand::U32(v)) => Ok(*v),
        other => Err(CodegenError::Encoding(format!(
            "{op:?} operand {pos} is {other:?}, expected u32"
        ))),
    }
}

fn operand_block(operands: &[Operand], op: Op) -> CodegenResult<BlockType> {
    match operands.first() {
        Some(Operand::Block(bt)) => Ok(*bt),
        other => Err(CodegenError::Encoding(format!(
            "{op:?} operand is {other:?}, expected a block type"
        ))),
    }
}

/// Encode one resolved instruction.
pub fn encode_instr(instr: &Instr, out: &mut Vec<u8>) -> CodegenResult<()> {
    let Instr::Plain { op, operands } = instr else {
        return Err(CodegenError::UnresolvedReference(
            "deferred instruction reached the encoder".to_string(),
        ));
    };
    let op = *op;
    match op.encoding() {
        OpEncoding::Single(byte) => out.push(byte),
        OpEncoding::Prefixed(sub) => {
            out.push(0xFC);
            wasm::write_u32(out, sub);
        }
    }
    match op {
        Op::Block | Op::Loop | Op::If | Op::Try => {
            out.push(operand_block(operands, op)?.byte());
        }
        Op::Br
        | Op::BrIf
        | Op::Call
        | Op::ReturnCall
        | Op::LocalGet
        | Op::LocalSet
        | Op::LocalTee
        | Op::GlobalGet
        | Op::GlobalSet
        | Op::Throw
        | Op::Rethrow
        | Op::Catch
        | Op::RefFunc
        | Op::MemorySize
        | Op::MemoryGrow => {
            wasm::write_u32(out, operand_u32(operands, 0, op)?);
        }
        Op::CallIndirect | Op::MemoryCopy => {
            wasm::write_u32(out, operand_u32(operands, 0, op)?);
            wasm::write_u32(out, operand_u32(operands, 1, op)?);
        }
        Op::I32Load | Op::F64Load | Op::I32Load8U | Op::I32Store | Op::F64Store
        | Op::I32Store8 => {
            wasm::write_u32(out, operand_u32(operands, 0, op)?);
            wasm::write_u32(out, operand_u32(operands, 1, op)?);
        }
        Op::I32Const => match operands.first() {
            Some(Operand::I32(v)) => wasm::write_s32(out, *v),
            other => {
                return Err(CodegenError::Encoding(format!(
                    "i32.const operand is {other:?}"
                )))
            }
        },
        Op::I64Const => match operands.first() {
            Some(Operand::I64(v)) => wasm::write_s64(out, *v),
            other => {
                return Err(CodegenError::Encoding(format!(
                    "i64.const operand is {other:?}"
                )))
            }
        },
        Op::F64Const => match operands.first() {
            Some(Operand::F64(v)) => wasm::write_f64(out, *v),
            other => {
                return Err(CodegenError::Encoding(format!(
                    "f64.const operand is {other:?}"
                )))
            }
        },
        _ => {
            if !operands.is_empty() {
                return Err(CodegenError::Encoding(format!(
                    "{op:?} takes no operands, got {operands:?}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Deferred;

    #[test]
    fn test_encode_call() {
        let mut out = Vec::new();
        encode_instr(&Instr::u32(Op::Call, 300), &mut out).unwrap();
        assert_eq!(out, vec![0x10, 0xAC, 0x02]);
    }

    #[test]
    fn test_encode_f64_const_bit_exact() {
        let mut out = Vec::new();
        encode_instr(
            &Instr::with(Op::F64Const, vec![Operand::F64(0.1)]),
            &mut out,
        )
        .unwrap();
        assert_eq!(out[0], 0x44);
        assert_eq!(f64::from_le_bytes(out[1..9].try_into().unwrap()), 0.1);
    }

    #[test]
    fn test_encode_prefixed() {
        let mut out = Vec::new();
        encode_instr(
            &Instr::with(Op::MemoryCopy, vec![Operand::U32(0), Operand::U32(0)]),
            &mut out,
        )
        .unwrap();
        assert_eq!(out, vec![0xFC, 10, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_negative_const() {
        let mut out = Vec::new();
        encode_instr(&Instr::with(Op::I32Const, vec![Operand::I32(-1)]), &mut out).unwrap();
        assert_eq!(out, vec![0x41, 0x7F]);
    }

    #[test]
    fn test_deferred_reaching_encoder_is_an_error() {
        let mut out = Vec::new();
        let err = encode_instr(
            &Instr::Deferred(Deferred {
                target: "f".to_string(),
                tail: false,
            }),
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, CodegenError::UnresolvedReference(_)));
    }

    #[test]
    fn test_operand_shape_mismatch_is_encoding_error() {
        let mut out = Vec::new();
        let err = encode_instr(
            &Instr::with(Op::Call, vec![Operand::F64(1.0)]),
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, CodegenError::Encoding(_)));
    }

    #[test]
    fn test_locals_are_run_length_encoded() {
        let locals = vec![
            LocalRecord { name: "a".into(), ty: ValType::I32 },
            LocalRecord { name: "b".into(), ty: ValType::I32 },
            LocalRecord { name: "c".into(), ty: ValType::F64 },
            LocalRecord { name: "d".into(), ty: ValType::I32 },
        ];
        let mut out = Vec::new();
        write_locals(&locals, &mut out).unwrap();
        assert_eq!(
            out,
            vec![3, 2, 0x7F, 1, 0x7C, 1, 0x7F]
        );
    }
}
