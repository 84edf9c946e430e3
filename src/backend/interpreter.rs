//! Tree-walking backend (spec.md §4.6): re-reads the compiled
//! [`Function`](crate::ir::Function) on every call. No ahead-of-time work
//! happens at `compile` time beyond stashing the function; this is the
//! fallback path the dispatcher reaches for when a block's specialization
//! mask doesn't warrant the native backend's upfront cost.

use crate::ir::Function;
use crate::memory::GuestBus;

use super::{run_function, Backend, CpuContext, HostFnTable};

#[derive(Default)]
pub struct InterpreterBackend {
    functions: Vec<Function>,
}

impl InterpreterBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for InterpreterBackend {
    fn compile(&mut self, ir: Function) -> usize {
        self.functions.push(ir);
        self.functions.len() - 1
    }

    fn call(&mut self, host_entry: usize, ctx: &mut CpuContext, guest: &mut dyn GuestBus, host_fns: &HostFnTable) {
        run_function(&self.functions[host_entry], ctx, guest, host_fns);
    }

    fn recompile(&mut self, host_entry: usize, ir: Function) {
        self.functions[host_entry] = ir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Arg, Const, Op, Type};
    use crate::memory::AddressSpace;

    #[test]
    fn runs_a_straight_line_add_and_store() {
        let mut f = Function::new();
        let entry = f.push_block("entry");
        let a = f.push_instr(entry, Op::LoadContext, vec![Arg::Imm(0)], Some(Type::I32)).unwrap();
        let sum = f.push_instr(entry, Op::Add, vec![Arg::Value(a), Arg::Const(Const::I32(5))], Some(Type::I32)).unwrap();
        f.push_instr(entry, Op::StoreContext, vec![Arg::Imm(4), Arg::Value(sum)], None);

        let mut backend = InterpreterBackend::new();
        let entry_id = backend.compile(f);
        let mut ctx = CpuContext::new(16);
        ctx.write(0, Const::I32(37));
        let mut mem = AddressSpace::default();
        let host_fns = HostFnTable::new();
        backend.call(entry_id, &mut ctx, &mut mem, &host_fns);
        assert_eq!(ctx.read(4, Type::I32), Const::I32(42));
    }

    #[test]
    fn follows_a_conditional_branch_to_the_taken_block() {
        let mut f = Function::new();
        let entry = f.push_block("entry");
        let taken = f.push_block("taken");
        let not_taken = f.push_block("not_taken");
        f.push_instr(entry, Op::CondBranch, vec![Arg::Const(Const::I32(1)), Arg::Block(taken as u32), Arg::Block(not_taken as u32)], None);
        f.push_instr(taken, Op::StoreContext, vec![Arg::Imm(0), Arg::Const(Const::I32(1))], None);
        f.push_instr(not_taken, Op::StoreContext, vec![Arg::Imm(0), Arg::Const(Const::I32(2))], None);

        let mut backend = InterpreterBackend::new();
        let entry_id = backend.compile(f);
        let mut ctx = CpuContext::new(8);
        let mut mem = AddressSpace::default();
        backend.call(entry_id, &mut ctx, &mut mem, &HostFnTable::new());
        assert_eq!(ctx.read(0, Type::I32), Const::I32(1));
    }
}
