//! Backends (spec.md §4.6): two interchangeable ways to run a compiled
//! [`Function`](crate::ir::Function) against a CPU context and the guest
//! bus, exposing the same `compile`/`call` contract.

pub mod interpreter;
pub mod native;

use std::collections::HashMap;

use crate::ir::{Arg, Const, Function, Op, Type, ValueId};
use crate::memory::GuestBus;

/// A CPU's architectural state as a flat byte buffer, addressed the way
/// `load.ctx`/`store.ctx` instructions address it: by byte offset
/// (spec.md §4.3).
pub struct CpuContext {
    pub bytes: Vec<u8>,
    pub remaining_cycles: i64,
}

impl CpuContext {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0u8; size], remaining_cycles: 0 }
    }

    pub fn read(&self, offset: i64, ty: Type) -> Const {
        let o = offset as usize;
        match ty {
            Type::I8 => Const::I8(self.bytes[o]),
            Type::I16 => Const::I16(u16::from_le_bytes([self.bytes[o], self.bytes[o + 1]])),
            Type::I32 => Const::I32(u32::from_le_bytes(self.bytes[o..o + 4].try_into().unwrap())),
            Type::I64 => Const::I64(u64::from_le_bytes(self.bytes[o..o + 8].try_into().unwrap())),
            Type::F32 => Const::F32(f32::from_le_bytes(self.bytes[o..o + 4].try_into().unwrap())),
            Type::F64 => Const::F64(f64::from_le_bytes(self.bytes[o..o + 8].try_into().unwrap())),
            Type::V128 | Type::Str | Type::Block => panic!("unsupported context field type {ty}"),
        }
    }

    pub fn write(&mut self, offset: i64, value: Const) {
        let o = offset as usize;
        match value {
            Const::I8(v) => self.bytes[o] = v,
            Const::I16(v) => self.bytes[o..o + 2].copy_from_slice(&v.to_le_bytes()),
            Const::I32(v) => self.bytes[o..o + 4].copy_from_slice(&v.to_le_bytes()),
            Const::I64(v) => self.bytes[o..o + 8].copy_from_slice(&v.to_le_bytes()),
            Const::F32(v) => self.bytes[o..o + 4].copy_from_slice(&v.to_le_bytes()),
            Const::F64(v) => self.bytes[o..o + 8].copy_from_slice(&v.to_le_bytes()),
        }
    }
}

/// Named runtime helpers reachable from `call` instructions (spec.md §4.3:
/// "function-typed external calls"). Populated once at startup from a
/// declarative table (spec.md §9 "dispatch tables ... built once at
/// startup").
pub type HostFn = fn(&[Const]) -> Option<Const>;

#[derive(Default)]
pub struct HostFnTable(HashMap<&'static str, HostFn>);

impl HostFnTable {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register(&mut self, name: &'static str, f: HostFn) {
        self.0.insert(name, f);
    }
    fn call(&self, name: &str, args: &[Const]) -> Option<Const> {
        (self.0.get(name)?)(args)
    }
}

/// `compile(ir) -> host_entry`, `call(host_entry, context)` (spec.md
/// §4.6). `host_entry` opaquely indexes whatever representation the
/// backend compiled the function into.
pub trait Backend {
    fn compile(&mut self, ir: Function) -> usize;
    fn call(&mut self, host_entry: usize, ctx: &mut CpuContext, guest: &mut dyn GuestBus, host_fns: &HostFnTable);
    /// Reuses a previously-freed code region's slot instead of growing the
    /// backend's storage (spec.md §4.7: invalidation "returns their code
    /// region to a free list for reuse").
    fn recompile(&mut self, host_entry: usize, ir: Function);
}

/// Shared evaluator walking one [`Function`] to completion: both backends
/// reduce to this, differing only in when the `Function` is consulted
/// (interpreter: every call; native: resolved once at `compile` time into
/// a flat instruction list the dispatch loop still walks, standing in for
/// true machine-code emission — see `native.rs`).
fn run_function(f: &Function, ctx: &mut CpuContext, guest: &mut dyn GuestBus, host_fns: &HostFnTable) {
    let mut regs: HashMap<ValueId, Const> = HashMap::new();
    let mut locals: Vec<Option<Const>> = vec![None; f.locals.len()];
    let mut block = 0usize;

    'blocks: loop {
        let b = &f.blocks[block];
        for instr in &b.instrs {
            let args: Vec<ArgVal> = instr.arg_iter().map(|a| resolve(a, &regs, &locals)).collect();
            match instr.op {
                Op::Branch => {
                    block = args[0].as_block();
                    continue 'blocks;
                }
                Op::CondBranch => {
                    let cond = args[0].as_const().as_u64() != 0;
                    block = if cond { args[1].as_block() } else { args[2].as_block() };
                    continue 'blocks;
                }
                Op::SourceInfo => {
                    ctx.remaining_cycles -= args.get(1).map(|a| a.as_const().as_i64()).unwrap_or(0);
                }
                Op::StoreGuest => {
                    let addr = args[0].as_const().as_u64() as u32;
                    guest.store_typed(addr, args[1].as_const());
                }
                Op::StoreContext => {
                    let offset = args[0].as_const().as_i64();
                    ctx.write(offset, args[1].as_const());
                }
                Op::StoreLocal => {
                    let id = args[0].as_const().as_u64() as usize;
                    locals[id] = Some(args[1].as_const());
                }
                Op::Call => {
                    if let Some(Arg::Sym(name)) = &instr.args[0] {
                        let call_args: Vec<Const> = args.iter().skip(1).map(|a| a.as_const()).collect();
                        let result = host_fns.call(name, &call_args);
                        if let (Some((id, _)), Some(value)) = (instr.result, result) {
                            regs.insert(id, value);
                        }
                    }
                }
                _ if instr.op.has_result() => {
                    let (id, ty) = instr.result.unwrap();
                    let value = eval_pure(instr.op, &args, ty, ctx, guest, locals.as_slice());
                    regs.insert(id, value);
                }
                _ => {}
            }
        }
        return;
    }
}

enum ArgVal {
    Const(Const),
    Block(usize),
}

impl ArgVal {
    fn as_const(&self) -> Const {
        match self {
            ArgVal::Const(c) => *c,
            ArgVal::Block(_) => panic!("expected a value argument, found a block reference"),
        }
    }
    fn as_block(&self) -> usize {
        match self {
            ArgVal::Block(b) => *b,
            ArgVal::Const(_) => panic!("expected a block argument, found a value"),
        }
    }
}

fn resolve(arg: &Arg, regs: &HashMap<ValueId, Const>, locals: &[Option<Const>]) -> ArgVal {
    match arg {
        Arg::Const(c) => ArgVal::Const(*c),
        Arg::Value(id) => ArgVal::Const(*regs.get(id).unwrap_or_else(|| panic!("use of undefined value %{id}"))),
        Arg::Local(id) => ArgVal::Const(locals[*id as usize].unwrap_or_else(|| panic!("read of uninitialized local {id}"))),
        Arg::Imm(v) => ArgVal::Const(Const::I64(*v as u64)),
        Arg::Block(b) => ArgVal::Block(*b as usize),
        Arg::Sym(_) => panic!("symbol arguments are only meaningful to `call`"),
    }
}

fn eval_pure(op: Op, args: &[ArgVal], ty: Type, ctx: &mut CpuContext, guest: &mut dyn GuestBus, locals: &[Option<Const>]) -> Const {
    use Op::*;
    match op {
        LoadContext => ctx.read(args[0].as_const().as_i64(), ty),
        LoadGuest => guest.load_typed(args[0].as_const().as_u64() as u32, ty),
        LoadLocal => locals[args[0].as_const().as_u64() as usize].unwrap_or_else(|| panic!("read of uninitialized local")),
        Neg => wrap(ty, (-(args[0].as_const().as_i64())) as u64),
        FNeg => float_result(ty, -args[0].as_const().as_f64()),
        Abs => float_result(ty, args[0].as_const().as_f64().abs()),
        Sqrt => float_result(ty, args[0].as_const().as_f64().sqrt()),
        Sin => float_result(ty, args[0].as_const().as_f64().sin()),
        Cos => float_result(ty, args[0].as_const().as_f64().cos()),
        Div => wrap(ty, (args[0].as_const().as_i64() / args[1].as_const().as_i64().max(1)) as u64),
        UDiv => wrap(ty, args[0].as_const().as_u64() / args[1].as_const().as_u64().max(1)),
        Select => {
            if args[0].as_const().as_u64() != 0 {
                args[1].as_const()
            } else {
                args[2].as_const()
            }
        }
        _ => crate::ir::passes::fold::eval(op, &args.iter().map(|a| a.as_const()).collect::<Vec<_>>(), ty)
            .unwrap_or_else(|| panic!("backend has no evaluator for {}", op.as_str())),
    }
}

fn wrap(ty: Type, bits: u64) -> Const {
    match ty {
        Type::I8 => Const::I8(bits as u8),
        Type::I16 => Const::I16(bits as u16),
        Type::I32 => Const::I32(bits as u32),
        Type::I64 => Const::I64(bits),
        _ => Const::I64(bits),
    }
}

fn float_result(ty: Type, v: f64) -> Const {
    if ty == Type::F32 {
        Const::F32(v as f32)
    } else {
        Const::F64(v)
    }
}
