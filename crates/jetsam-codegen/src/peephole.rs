//! Peephole optimizer: local, provably-sound rewrites over each
//! function's instruction sequence.
//!
//! The pass count comes from the opt-passes option (default 2); within a
//! pass, rules are applied until a fixed point. Every rewrite preserves
//! the stack-effect signature and the set and order of trapping
//! instructions — a `f64.const → i32.trunc_f64_s` fold, for instance,
//! only fires when the conversion cannot trap.

use crate::ir::{Instr, IrModule, LowerState, Operand};
use crate::wasm::Op;
use jetsam_types::CompileOptions;

/// Run the optimizer over every lowered function.
pub fn optimize(module: &mut IrModule, opts: &CompileOptions) {
    let mut rewrites = 0usize;
    for _ in 0..opts.opt_passes {
        for func in &mut module.funcs {
            if func.state != LowerState::Lowered {
                continue;
            }
            loop {
                let mut changed = elide_dead_type_writes(&mut func.body, func.last_type_slot);
                changed |= strip_empty_blocks(&mut func.body);
                changed |= window_pass(&mut func.body, opts.tail_call);
                if changed {
                    rewrites += 1;
                } else {
                    break;
                }
            }
        }
    }
    if rewrites > 0 {
        log::debug!("peephole: {rewrites} fixpoint iterations with changes");
    }
}

fn local_op(instr: &Instr, expected: Op) -> Option<u32> {
    match instr {
        Instr::Plain { op, operands } if *op == expected => match operands.as_slice() {
            [Operand::U32(slot)] => Some(*slot),
            _ => None,
        },
        _ => None,
    }
}

fn is_const(instr: &Instr) -> bool {
    matches!(
        instr,
        Instr::Plain {
            op: Op::I32Const | Op::I64Const | Op::F64Const,
            ..
        }
    )
}

fn is_op(instr: &Instr, expected: Op) -> bool {
    matches!(instr, Instr::Plain { op, .. } if *op == expected)
}

fn i32_const_value(instr: &Instr) -> Option<i32> {
    match instr {
        Instr::Plain {
            op: Op::I32Const,
            operands,
        } => match operands.as_slice() {
            [Operand::I32(v)] => Some(*v),
            _ => None,
        },
        _ => None,
    }
}

fn f64_const_value(instr: &Instr) -> Option<f64> {
    match instr {
        Instr::Plain {
            op: Op::F64Const,
            operands,
        } => match operands.as_slice() {
            [Operand::F64(v)] => Some(*v),
            _ => None,
        },
        _ => None,
    }
}

/// One scan applying the two- and three-instruction window rules against
/// the already-rewritten suffix.
fn window_pass(body: &mut Vec<Instr>, tail_call: bool) -> bool {
    let mut out: Vec<Instr> = Vec::with_capacity(body.len());
    let mut changed = false;

    for instr in body.drain(..) {
        out.push(instr);
        loop {
            let n = out.len();
            // local.set k ; local.get k  →  local.tee k
            if n >= 2 {
                if let (Some(a), Some(b)) = (
                    local_op(&out[n - 2], Op::LocalSet),
                    local_op(&out[n - 1], Op::LocalGet),
                ) {
                    if a == b {
                        out.truncate(n - 2);
                        out.push(Instr::u32(Op::LocalTee, a));
                        changed = true;
                        continue;
                    }
                }
            }
            // local.get k ; drop  →  ∅
            if n >= 2
                && local_op(&out[n - 2], Op::LocalGet).is_some()
                && is_op(&out[n - 1], Op::Drop)
            {
                out.truncate(n - 2);
                changed = true;
                continue;
            }
            // local.tee k ; drop  →  local.set k
            if n >= 2 && is_op(&out[n - 1], Op::Drop) {
                if let Some(slot) = local_op(&out[n - 2], Op::LocalTee) {
                    out.truncate(n - 2);
                    out.push(Instr::u32(Op::LocalSet, slot));
                    changed = true;
                    continue;
                }
            }
            // <const> ; drop  →  ∅
            if n >= 2 && is_const(&out[n - 2]) && is_op(&out[n - 1], Op::Drop) {
                out.truncate(n - 2);
                changed = true;
                continue;
            }
            // i32.const 0 ; i32.eq  →  i32.eqz
            if n >= 2 && i32_const_value(&out[n - 2]) == Some(0) && is_op(&out[n - 1], Op::I32Eq)
            {
                out.truncate(n - 2);
                out.push(Instr::op(Op::I32Eqz));
                changed = true;
                continue;
            }
            // identity conversion round-trips
            if n >= 2 {
                let round_trip = [
                    (Op::I64ExtendI32S, Op::I32WrapI64),
                    (Op::F64ConvertI32S, Op::I32TruncF64S),
                    (Op::F64ConvertI32U, Op::I32TruncF64U),
                    (Op::F64ConvertI32S, Op::I32TruncSatF64S),
                    (Op::F64ConvertI32U, Op::I32TruncSatF64U),
                ]
                .iter()
                .any(|&(widen, narrow)| {
                    is_op(&out[n - 2], widen) && is_op(&out[n - 1], narrow)
                });
                if round_trip {
                    out.truncate(n - 2);
                    changed = true;
                    continue;
                }
            }
            // f64.const c ; i32.trunc_f64_s  →  i32.const ⌊c⌋
            if n >= 2 {
                if let Some(c) = f64_const_value(&out[n - 2]) {
                    let folded = if is_op(&out[n - 1], Op::I32TruncF64S) {
                        // trapping form: fold only when it cannot trap
                        let t = c.trunc();
                        (t >= i32::MIN as f64 && t <= i32::MAX as f64 && !c.is_nan())
                            .then_some(t as i32)
                    } else if is_op(&out[n - 1], Op::I32TruncSatF64S) {
                        Some(if c.is_nan() {
                            0
                        } else {
                            c.trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32
                        })
                    } else {
                        None
                    };
                    if let Some(v) = folded {
                        out.truncate(n - 2);
                        out.push(Instr::with(Op::I32Const, vec![Operand::I32(v)]));
                        changed = true;
                        continue;
                    }
                }
            }
            // call f ; return  →  return_call f
            if tail_call && n >= 2 && is_op(&out[n - 1], Op::Return) {
                if let Some(target) = local_op(&out[n - 2], Op::Call) {
                    out.truncate(n - 2);
                    out.push(Instr::u32(Op::ReturnCall, target));
                    changed = true;
                    continue;
                }
                if let Instr::Deferred(d) = &out[n - 2] {
                    if !d.tail {
                        let mut d = d.clone();
                        d.tail = true;
                        out.truncate(n - 2);
                        out.push(Instr::Deferred(d));
                        changed = true;
                        continue;
                    }
                }
            }
            break;
        }
    }
    *body = out;
    changed
}

/// Strip `block … end` pairs with nothing between them. An empty block
/// contains no branch to its own label, so removal cannot retarget
/// anything.
fn strip_empty_blocks(body: &mut Vec<Instr>) -> bool {
    let mut out: Vec<Instr> = Vec::with_capacity(body.len());
    let mut changed = false;
    for instr in body.drain(..) {
        let is_end = is_op(&instr, Op::End);
        if is_end && out.last().map(|p| is_op(p, Op::Block)).unwrap_or(false) {
            out.pop();
            changed = true;
            continue;
        }
        out.push(instr);
    }
    *body = out;
    changed
}

/// Elide writes to the `#last_type` scratch slot that are never read
/// afterwards. With a backward branch in the body, "afterwards" is
/// undecidable locally, so the rule then requires the slot to be entirely
/// unread.
fn elide_dead_type_writes(body: &mut Vec<Instr>, last_type_slot: Option<u32>) -> bool {
    let Some(slot) = last_type_slot else {
        return false;
    };
    let has_loop = body.iter().any(|i| is_op(i, Op::Loop));
    let last_read = body
        .iter()
        .rposition(|i| local_op(i, Op::LocalGet) == Some(slot));
    let mut changed = false;
    for idx in 0..body.len() {
        let dead = match (has_loop, last_read) {
            (false, Some(read)) => idx > read,
            (false, None) => true,
            (true, None) => true,
            (true, Some(_)) => false,
        };
        if !dead {
            continue;
        }
        if local_op(&body[idx], Op::LocalSet) == Some(slot) {
            body[idx] = Instr::op(Op::Drop);
            changed = true;
        } else if local_op(&body[idx], Op::LocalTee) == Some(slot) {
            body[idx] = Instr::op(Op::Nop);
            changed = true;
        }
    }
    if changed {
        // A tee became a nop; clean those out.
        body.retain(|i| !is_op(i, Op::Nop));
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FuncRecord;
    use crate::types::FuncFlags;
    use crate::wasm::BlockType;

    fn run(body: Vec<Instr>, passes: u32) -> Vec<Instr> {
        run_with(body, passes, false, None)
    }

    fn run_with(
        body: Vec<Instr>,
        passes: u32,
        tail_call: bool,
        last_type: Option<u32>,
    ) -> Vec<Instr> {
        let mut module = IrModule::new("test");
        module.funcs.push(FuncRecord {
            name: "f".to_string(),
            index: 0,
            params: vec![],
            param_names: vec![],
            results: vec![],
            locals: vec![],
            body,
            flags: FuncFlags::empty(),
            state: LowerState::Lowered,
            last_type_slot: last_type,
            export: None,
        });
        let opts = CompileOptions {
            opt_passes: passes,
            tail_call,
            ..CompileOptions::default()
        };
        optimize(&mut module, &opts);
        module.funcs.remove(0).body
    }

    fn i32c(v: i32) -> Instr {
        Instr::with(Op::I32Const, vec![Operand::I32(v)])
    }

    fn f64c(v: f64) -> Instr {
        Instr::with(Op::F64Const, vec![Operand::F64(v)])
    }

    #[test]
    fn test_set_get_becomes_tee() {
        let body = vec![
            i32c(1),
            Instr::u32(Op::LocalSet, 3),
            Instr::u32(Op::LocalGet, 3),
        ];
        assert_eq!(run(body, 1), vec![i32c(1), Instr::u32(Op::LocalTee, 3)]);
    }

    #[test]
    fn test_set_get_of_different_slots_is_kept() {
        let body = vec![Instr::u32(Op::LocalSet, 3), Instr::u32(Op::LocalGet, 4)];
        assert_eq!(run(body.clone(), 1), body);
    }

    #[test]
    fn test_get_drop_is_elided() {
        let body = vec![Instr::u32(Op::LocalGet, 2), Instr::op(Op::Drop)];
        assert!(run(body, 1).is_empty());
    }

    #[test]
    fn test_tee_drop_becomes_set() {
        let body = vec![Instr::u32(Op::LocalTee, 2), Instr::op(Op::Drop)];
        assert_eq!(run(body, 1), vec![Instr::u32(Op::LocalSet, 2)]);
    }

    #[test]
    fn test_const_drop_is_elided() {
        for konst in [i32c(7), f64c(1.5), Instr::with(Op::I64Const, vec![Operand::I64(9)])] {
            let body = vec![konst, Instr::op(Op::Drop)];
            assert!(run(body, 1).is_empty());
        }
    }

    #[test]
    fn test_eqz_canonicalization() {
        let body = vec![i32c(0), Instr::op(Op::I32Eq)];
        assert_eq!(run(body, 1), vec![Instr::op(Op::I32Eqz)]);
        // i32.const 1 ; i32.eq must stay
        let keep = vec![i32c(1), Instr::op(Op::I32Eq)];
        assert_eq!(run(keep.clone(), 1), keep);
    }

    #[test]
    fn test_identity_conversions_are_elided() {
        let body = vec![
            Instr::op(Op::F64ConvertI32S),
            Instr::op(Op::I32TruncF64S),
        ];
        assert!(run(body, 1).is_empty());
        let body = vec![Instr::op(Op::I64ExtendI32S), Instr::op(Op::I32WrapI64)];
        assert!(run(body, 1).is_empty());
        // mismatched signedness is not an identity
        let keep = vec![Instr::op(Op::F64ConvertI32S), Instr::op(Op::I32TruncF64U)];
        assert_eq!(run(keep.clone(), 1), keep);
    }

    #[test]
    fn test_constant_trunc_fold() {
        let body = vec![f64c(3.7), Instr::op(Op::I32TruncF64S)];
        assert_eq!(run(body, 1), vec![i32c(3)]);
        let body = vec![f64c(-2.9), Instr::op(Op::I32TruncF64S)];
        assert_eq!(run(body, 1), vec![i32c(-2)]);
        // out-of-range trapping trunc must not fold
        let keep = vec![f64c(1e40), Instr::op(Op::I32TruncF64S)];
        assert_eq!(run(keep.clone(), 1), keep);
        // saturating trunc folds anything
        let body = vec![f64c(f64::NAN), Instr::op(Op::I32TruncSatF64S)];
        assert_eq!(run(body, 1), vec![i32c(0)]);
    }

    #[test]
    fn test_empty_block_is_stripped() {
        let body = vec![
            Instr::with(Op::Block, vec![Operand::Block(BlockType::Empty)]),
            Instr::op(Op::End),
        ];
        assert!(run(body, 1).is_empty());
    }

    #[test]
    fn test_nonempty_block_is_kept() {
        let body = vec![
            Instr::with(Op::Block, vec![Operand::Block(BlockType::Empty)]),
            Instr::op(Op::Nop),
            Instr::op(Op::End),
        ];
        assert_eq!(run(body.clone(), 1).len(), 3);
    }

    #[test]
    fn test_dead_type_writes_are_elided() {
        // set #last_type twice, read never
        let body = vec![
            i32c(3),
            Instr::u32(Op::LocalSet, 7),
            i32c(4),
            Instr::u32(Op::LocalSet, 7),
        ];
        let out = run_with(body, 1, false, Some(7));
        // sets become drops, const+drop pairs then vanish
        assert!(out.is_empty());
    }

    #[test]
    fn test_type_writes_before_a_read_survive() {
        let body = vec![
            i32c(3),
            Instr::u32(Op::LocalSet, 7),
            Instr::u32(Op::LocalGet, 7),
            Instr::op(Op::Drop),
            i32c(4),
            Instr::u32(Op::LocalSet, 7),
        ];
        let out = run_with(body, 1, false, Some(7));
        // The trailing write is dead immediately. Collapsing the
        // set;get;drop of the first write then leaves the slot unread, so
        // the fixed point eliminates the remaining write too.
        assert!(out.is_empty());

        // With a loop in the body the positional argument is unsound, so
        // a consumed read anywhere pins every write.
        let body = vec![
            Instr::with(Op::Loop, vec![Operand::Block(BlockType::Empty)]),
            Instr::u32(Op::LocalGet, 7),
            Instr::op(Op::I32Eqz),
            Instr::u32(Op::LocalSet, 9),
            i32c(3),
            Instr::u32(Op::LocalSet, 7),
            Instr::op(Op::End),
        ];
        let out = run_with(body.clone(), 1, false, Some(7));
        assert_eq!(out, body);
    }

    #[test]
    fn test_tail_call_rewrite_requires_flag() {
        let body = vec![Instr::u32(Op::Call, 5), Instr::op(Op::Return)];
        assert_eq!(run(body.clone(), 2), body);
        let out = run_with(body, 2, true, None);
        assert_eq!(out, vec![Instr::u32(Op::ReturnCall, 5)]);
    }

    #[test]
    fn test_zero_passes_changes_nothing() {
        let body = vec![i32c(1), Instr::op(Op::Drop)];
        assert_eq!(run(body.clone(), 0), body);
    }

    #[test]
    fn test_optimizer_is_idempotent() {
        let body = vec![
            i32c(1),
            Instr::u32(Op::LocalSet, 3),
            Instr::u32(Op::LocalGet, 3),
            Instr::op(Op::Drop),
            Instr::with(Op::Block, vec![Operand::Block(BlockType::Empty)]),
            Instr::op(Op::End),
            f64c(2.5),
            Instr::op(Op::I32TruncSatF64S),
        ];
        let once = run(body.clone(), 1);
        let twice = run(body, 4);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_stack_effect_is_preserved() {
        // Each rule's input and output windows push/pop the same net
        // amount: spot-check the tee rewrite with a depth simulator.
        fn net(instrs: &[Instr]) -> i32 {
            instrs
                .iter()
                .map(|i| match i {
                    Instr::Plain { op, .. } => match op {
                        Op::I32Const | Op::I64Const | Op::F64Const | Op::LocalGet => 1,
                        Op::LocalSet | Op::Drop => -1,
                        Op::LocalTee => 0,
                        Op::I32Eq => -1,
                        Op::I32Eqz => 0,
                        _ => 0,
                    },
                    Instr::Deferred(_) => 0,
                })
                .sum()
        }
        let before = vec![
            i32c(1),
            Instr::u32(Op::LocalSet, 3),
            Instr::u32(Op::LocalGet, 3),
        ];
        let after = run(before.clone(), 1);
        assert_eq!(net(&before), net(&after));

        let before = vec![i32c(0), Instr::op(Op::I32Eq)];
        let after = run(before.clone(), 1);
        assert_eq!(net(&before), net(&after));
    }
}
