//! Constant folding (spec.md §4.5), grounded on the table-driven evaluator
//! in `original_source/src/jit/ir/passes/constant_propagation_pass.cc`:
//! when every argument to a foldable op is already constant, evaluate it
//! and replace every downstream use of the result with the folded value.
//! Division, negation, trig, and absolute value are deliberately excluded
//! (see [`super::super::Op::is_foldable`]) since they either trap or carry
//! host/guest rounding differences the JIT does not want to bake in ahead
//! of time.

use std::collections::HashMap;

use super::super::{Arg, Const, Function, Op, Type};

pub fn run(f: &mut Function) {
    let mut subst: HashMap<u32, Const> = HashMap::new();

    for block in f.blocks.iter_mut() {
        for instr in block.instrs.iter_mut() {
            for arg in instr.arg_iter_mut() {
                if let Arg::Value(id) = arg {
                    if let Some(c) = subst.get(id) {
                        *arg = Arg::Const(*c);
                    }
                }
            }

            let Some((result_id, result_ty)) = instr.result else { continue };
            if !instr.op.is_foldable() {
                continue;
            }
            let consts: Option<Vec<Const>> = instr
                .arg_iter()
                .map(|a| match a {
                    Arg::Const(c) => Some(*c),
                    _ => None,
                })
                .collect();
            let Some(consts) = consts else { continue };
            if let Some(folded) = eval(instr.op, &consts, result_ty) {
                subst.insert(result_id, folded);
            }
        }
    }
}

fn wrap_to(ty: Type, bits: u64) -> Const {
    match ty {
        Type::I8 => Const::I8(bits as u8),
        Type::I16 => Const::I16(bits as u16),
        Type::I32 => Const::I32(bits as u32),
        Type::I64 => Const::I64(bits),
        Type::F32 | Type::F64 | Type::V128 | Type::Str | Type::Block => Const::I64(bits),
    }
}

fn width_bits(ty: Type) -> u32 {
    match ty {
        Type::I8 => 8,
        Type::I16 => 16,
        Type::I32 => 32,
        Type::I64 | Type::F64 => 64,
        Type::F32 => 32,
        Type::V128 | Type::Str | Type::Block => 64,
    }
}

fn sign_extend(ty: Type, bits: u64) -> i64 {
    let shift = 64 - width_bits(ty);
    ((bits << shift) as i64) >> shift
}

/// Shared with the backends' evaluators (spec.md §4.6) so a folded
/// expression and its unfolded equivalent compute identically at runtime.
pub(crate) fn eval(op: Op, args: &[Const], result_ty: Type) -> Option<Const> {
    use Op::*;
    if result_ty.is_float() {
        let fargs: Vec<f64> = args.iter().map(Const::as_f64).collect();
        let v = match op {
            FAdd => fargs[0] + fargs[1],
            FSub => fargs[0] - fargs[1],
            FMul => fargs[0] * fargs[1],
            FDiv => fargs[0] / fargs[1],
            Select => return Some(if fargs[0] != 0.0 { args[1] } else { args[2] }),
            _ => return None,
        };
        return Some(if result_ty == Type::F32 { Const::F32(v as f32) } else { Const::F64(v) });
    }

    match op {
        Add => {
            let v = (args[0].as_u64()).wrapping_add(args[1].as_u64());
            Some(wrap_to(result_ty, v))
        }
        Sub => {
            let v = (args[0].as_u64()).wrapping_sub(args[1].as_u64());
            Some(wrap_to(result_ty, v))
        }
        SMul => {
            let a = sign_extend(args[0].ty(), args[0].as_u64());
            let b = sign_extend(args[1].ty(), args[1].as_u64());
            Some(wrap_to(result_ty, a.wrapping_mul(b) as u64))
        }
        UMul => {
            let a = args[0].as_u64();
            let b = args[1].as_u64();
            Some(wrap_to(result_ty, a.wrapping_mul(b)))
        }
        And => Some(wrap_to(result_ty, args[0].as_u64() & args[1].as_u64())),
        Or => Some(wrap_to(result_ty, args[0].as_u64() | args[1].as_u64())),
        Xor => Some(wrap_to(result_ty, args[0].as_u64() ^ args[1].as_u64())),
        Not => Some(wrap_to(result_ty, !args[0].as_u64())),
        Lshr => {
            let width = width_bits(args[0].ty());
            let shift = (args[1].as_u64() as u32) % width.max(1);
            let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
            Some(wrap_to(result_ty, (args[0].as_u64() & mask) >> shift))
        }
        Ashr => {
            let a = sign_extend(args[0].ty(), args[0].as_u64());
            let shift = (args[1].as_u64() as u32) % width_bits(args[0].ty()).max(1);
            Some(wrap_to(result_ty, (a >> shift) as u64))
        }
        Shl => {
            let shift = (args[1].as_u64() as u32) % width_bits(result_ty).max(1);
            Some(wrap_to(result_ty, args[0].as_u64().wrapping_shl(shift)))
        }
        CmpEq => Some(wrap_to(result_ty, (args[0].as_u64() == args[1].as_u64()) as u64)),
        CmpNe => Some(wrap_to(result_ty, (args[0].as_u64() != args[1].as_u64()) as u64)),
        CmpLtS => Some(wrap_to(result_ty, (sign_extend(args[0].ty(), args[0].as_u64()) < sign_extend(args[1].ty(), args[1].as_u64())) as u64)),
        CmpLtU => Some(wrap_to(result_ty, (args[0].as_u64() < args[1].as_u64()) as u64)),
        CmpLeS => Some(wrap_to(result_ty, (sign_extend(args[0].ty(), args[0].as_u64()) <= sign_extend(args[1].ty(), args[1].as_u64())) as u64)),
        CmpLeU => Some(wrap_to(result_ty, (args[0].as_u64() <= args[1].as_u64()) as u64)),
        CmpGtS => Some(wrap_to(result_ty, (sign_extend(args[0].ty(), args[0].as_u64()) > sign_extend(args[1].ty(), args[1].as_u64())) as u64)),
        CmpGtU => Some(wrap_to(result_ty, (args[0].as_u64() > args[1].as_u64()) as u64)),
        CmpGeS => Some(wrap_to(result_ty, (sign_extend(args[0].ty(), args[0].as_u64()) >= sign_extend(args[1].ty(), args[1].as_u64())) as u64)),
        CmpGeU => Some(wrap_to(result_ty, (args[0].as_u64() >= args[1].as_u64()) as u64)),
        Select => Some(if args[0].as_u64() != 0 { args[1] } else { args[2] }),
        _ => None,
    }
}
