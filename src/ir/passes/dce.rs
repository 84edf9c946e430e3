//! Dead-code elimination (spec.md §4.5): drops instructions whose result is
//! never read and which have no observable side effect. Loads, calls, and
//! stores are never removed even when their result goes unused — a guest
//! load can retire a clear-on-read hardware latch, and a call may have
//! effects the IR can't see.

use std::collections::HashSet;

use super::super::{Arg, Function, Op};

fn is_pure(op: Op) -> bool {
    use Op::*;
    matches!(
        op,
        Add | Sub
            | SMul
            | UMul
            | Div
            | UDiv
            | Neg
            | FAdd
            | FSub
            | FMul
            | FDiv
            | FNeg
            | Abs
            | Sqrt
            | Sin
            | Cos
            | And
            | Or
            | Xor
            | Not
            | Lshr
            | Ashr
            | Shl
            | CmpEq
            | CmpNe
            | CmpLtS
            | CmpLtU
            | CmpLeS
            | CmpLeU
            | CmpGtS
            | CmpGtU
            | CmpGeS
            | CmpGeU
            | Select
    )
}

pub fn run(f: &mut Function) {
    loop {
        let mut used: HashSet<u32> = HashSet::new();
        for block in &f.blocks {
            for instr in &block.instrs {
                for arg in instr.arg_iter() {
                    if let Arg::Value(id) = arg {
                        used.insert(*id);
                    }
                }
            }
        }

        let mut removed_any = false;
        for block in f.blocks.iter_mut() {
            let before = block.instrs.len();
            block.instrs.retain(|instr| match instr.result {
                Some((id, _)) if is_pure(instr.op) && !used.contains(&id) => false,
                _ => true,
            });
            if block.instrs.len() != before {
                removed_any = true;
            }
        }
        if !removed_any {
            break;
        }
    }
}
