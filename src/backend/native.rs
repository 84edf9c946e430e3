//! "Native" backend (spec.md §4.6). The teacher's and the retrieval pack's
//! dependency stacks carry no assembler or JIT codegen crate, so emitting
//! literal host machine code has no grounded precedent here. What this
//! backend does instead is consume register allocation's actual output:
//! at `compile()` time it resolves every value's [`Location`] into a flat,
//! densely-indexed `reg_of` table once, and `call()`'s dispatch loop reads
//! and writes a fixed-size register-file array through that table — O(1)
//! array indexing, no per-call hashing — instead of the interpreter's
//! `HashMap<ValueId, Const>` rebuilt from scratch on every call
//! (interpreter.rs). The two backends still share `eval_pure`/`ArgVal`
//! from the parent module, so they can never disagree on what a given
//! instruction computes, only on how it's addressed.

use crate::ir::{Arg, Const, Function, Location, Op, ValueId};
use crate::memory::GuestBus;

use super::{eval_pure, ArgVal, Backend, CpuContext, HostFnTable};

/// A compiled function plus its pre-resolved register assignments.
/// `reg_of[value]` is the register that value's instruction writes into;
/// absent for values register allocation never ran over (dead code, or a
/// block unreachable from `entry`).
struct CompiledUnit {
    function: Function,
    reg_of: Vec<Option<u8>>,
    num_regs: usize,
}

/// Builds the dense `ValueId -> register` lookup table from every
/// instruction's `Location`, set by `ir::passes::regalloc::run` before a
/// `Function` ever reaches this backend (`ir::passes::optimize` always
/// runs regalloc last, before handing off to `Backend::compile`).
fn resolve_reg_of(f: &Function) -> Vec<Option<u8>> {
    let mut reg_of: Vec<Option<u8>> = Vec::new();
    for block in &f.blocks {
        for instr in &block.instrs {
            if let (Some((id, _)), Some(Location(reg))) = (instr.result, instr.location) {
                let idx = id as usize;
                if reg_of.len() <= idx {
                    reg_of.resize(idx + 1, None);
                }
                reg_of[idx] = Some(reg);
            }
        }
    }
    reg_of
}

fn num_regs_for(reg_of: &[Option<u8>]) -> usize {
    reg_of.iter().filter_map(|r| *r).map(|r| r as usize + 1).max().unwrap_or(0)
}

#[derive(Default)]
pub struct NativeBackend {
    units: Vec<CompiledUnit>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for NativeBackend {
    fn compile(&mut self, ir: Function) -> usize {
        let reg_of = resolve_reg_of(&ir);
        let num_regs = num_regs_for(&reg_of);
        self.units.push(CompiledUnit { function: ir, reg_of, num_regs });
        self.units.len() - 1
    }

    fn call(&mut self, host_entry: usize, ctx: &mut CpuContext, guest: &mut dyn GuestBus, host_fns: &HostFnTable) {
        run_native(&self.units[host_entry], ctx, guest, host_fns);
    }

    fn recompile(&mut self, host_entry: usize, ir: Function) {
        let reg_of = resolve_reg_of(&ir);
        let num_regs = num_regs_for(&reg_of);
        self.units[host_entry] = CompiledUnit { function: ir, reg_of, num_regs };
    }
}

/// The dispatch loop proper: identical block-threading to
/// `super::run_function`, but values flow through a flat register-file
/// array indexed via `reg_of` rather than a per-call hash map.
fn run_native(unit: &CompiledUnit, ctx: &mut CpuContext, guest: &mut dyn GuestBus, host_fns: &HostFnTable) {
    let f = &unit.function;
    let mut registers: Vec<Option<Const>> = vec![None; unit.num_regs];
    let mut locals: Vec<Option<Const>> = vec![None; f.locals.len()];
    let mut block = 0usize;

    'blocks: loop {
        let b = &f.blocks[block];
        for instr in &b.instrs {
            let args: Vec<ArgVal> = instr.arg_iter().map(|a| resolve(a, &unit.reg_of, &registers, &locals)).collect();
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
                            write_register(&mut registers, &unit.reg_of, id, value);
                        }
                    }
                }
                _ if instr.op.has_result() => {
                    let (id, ty) = instr.result.unwrap();
                    let value = eval_pure(instr.op, &args, ty, ctx, guest, locals.as_slice());
                    write_register(&mut registers, &unit.reg_of, id, value);
                }
                _ => {}
            }
        }
        return;
    }
}

fn reg_for(reg_of: &[Option<u8>], id: ValueId) -> usize {
    reg_of
        .get(id as usize)
        .copied()
        .flatten()
        .unwrap_or_else(|| panic!("value %{id} has no resolved register; register allocation must run before compile()"))
        as usize
}

fn write_register(registers: &mut [Option<Const>], reg_of: &[Option<u8>], id: ValueId, value: Const) {
    registers[reg_for(reg_of, id)] = Some(value);
}

fn resolve(arg: &Arg, reg_of: &[Option<u8>], registers: &[Option<Const>], locals: &[Option<Const>]) -> ArgVal {
    match arg {
        Arg::Const(c) => ArgVal::Const(*c),
        Arg::Value(id) => {
            let reg = reg_for(reg_of, *id);
            ArgVal::Const(registers[reg].unwrap_or_else(|| panic!("register {reg} (value %{id}) read before being written")))
        }
        Arg::Local(id) => ArgVal::Const(locals[*id as usize].unwrap_or_else(|| panic!("read of uninitialized local {id}"))),
        Arg::Imm(v) => ArgVal::Const(Const::I64(*v as u64)),
        Arg::Block(b) => ArgVal::Block(*b as usize),
        Arg::Sym(_) => panic!("symbol arguments are only meaningful to `call`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Arg, Const, Op, Type};
    use crate::memory::AddressSpace;

    #[test]
    fn compiled_units_are_independently_addressable() {
        let mut f0 = Function::new();
        let e0 = f0.push_block("entry");
        f0.push_instr(e0, Op::StoreContext, vec![Arg::Imm(0), Arg::Const(Const::I32(1))], None);

        let mut f1 = Function::new();
        let e1 = f1.push_block("entry");
        f1.push_instr(e1, Op::StoreContext, vec![Arg::Imm(0), Arg::Const(Const::I32(2))], None);

        let mut backend = NativeBackend::new();
        let h0 = backend.compile(f0);
        let h1 = backend.compile(f1);
        assert_ne!(h0, h1);

        let mut ctx = CpuContext::new(8);
        let mut mem = AddressSpace::default();
        backend.call(h1, &mut ctx, &mut mem, &HostFnTable::new());
        assert_eq!(ctx.read(0, Type::I32), Const::I32(2));
        backend.call(h0, &mut ctx, &mut mem, &HostFnTable::new());
        assert_eq!(ctx.read(0, Type::I32), Const::I32(1));
    }

    #[test]
    fn agrees_with_the_interpreter_on_arithmetic() {
        let mut f = Function::new();
        let entry = f.push_block("entry");
        let a = f.push_instr(entry, Op::LoadContext, vec![Arg::Imm(0)], Some(Type::I32)).unwrap();
        let doubled = f.push_instr(entry, Op::Add, vec![Arg::Value(a), Arg::Value(a)], Some(Type::I32)).unwrap();
        f.push_instr(entry, Op::StoreContext, vec![Arg::Imm(4), Arg::Value(doubled)], None);
        // `Location` only exists once register allocation has run; the
        // real pipeline (jit.rs) always runs it before `Backend::compile`.
        f.assign_ordinals();
        crate::ir::passes::regalloc::run(&mut f, crate::ir::passes::regalloc::DEFAULT_NUM_REGS);

        let mut native = NativeBackend::new();
        let entry_id = native.compile(f);
        let mut ctx = CpuContext::new(16);
        ctx.write(0, Const::I32(21));
        let mut mem = AddressSpace::default();
        native.call(entry_id, &mut ctx, &mut mem, &HostFnTable::new());
        assert_eq!(ctx.read(4, Type::I32), Const::I32(42));
    }

    #[test]
    #[should_panic(expected = "no resolved register")]
    fn panics_when_compiled_without_register_allocation() {
        let mut f = Function::new();
        let entry = f.push_block("entry");
        let a = f.push_instr(entry, Op::LoadContext, vec![Arg::Imm(0)], Some(Type::I32)).unwrap();
        f.push_instr(entry, Op::StoreContext, vec![Arg::Imm(4), Arg::Value(a)], None);

        let mut native = NativeBackend::new();
        let entry_id = native.compile(f);
        let mut ctx = CpuContext::new(16);
        let mut mem = AddressSpace::default();
        native.call(entry_id, &mut ctx, &mut mem, &HostFnTable::new());
    }
}
