//! Second-chance binpacking register allocation (spec.md §4.5), grounded
//! on `original_source/src/jit/passes/register_allocation_pass.c`'s
//! `ra_bin`/`ra_tmp`/`ra_use` model (itself Traub, Holloway & Smith's
//! "Quality and Speed in Linear-scan Register Allocation"). Registers are
//! bins; each live value is packed into a bin at the instruction that
//! defines it. When every bin is full, the occupant whose next use is
//! furthest away is evicted to a spill slot (`store.local`) — it gets a
//! "second chance" to be re-packed into a register the next time it's
//! read (`load.local`), which is itself a fresh definition with its own
//! bin. Bin occupancy is threaded per-block over the CFG: each successor
//! inherits a copy of its predecessor's bins, matching the original
//! pass's `ra_push_state`/`ra_pop_state` per-edge threading.

use std::collections::HashMap;

use super::super::{Arg, Function, Instruction, Location, Op, Type, ValueId};

pub const DEFAULT_NUM_REGS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Occupant {
    /// The value's stable identity across spills and refills: the
    /// `ValueId` of its original definition in the unmodified function.
    logical: ValueId,
}

type Bins = Vec<Option<Occupant>>;

/// Precomputed, read-only facts about the *original* function, plus the
/// bookkeeping that does grow as blocks are rewritten: which physical
/// value currently holds a logical value's contents, and which local slot
/// it spills to once it's spilled at all.
struct RaCtx {
    /// Ordinals, in ascending order, at which a logical value is read.
    uses: HashMap<ValueId, Vec<u32>>,
    value_types: HashMap<ValueId, Type>,
    /// The last ordinal (a use, or the def itself if never used) at which
    /// a logical value is still needed — used to expire dead bins.
    last_use: HashMap<ValueId, u32>,
    /// Logical value -> the value id currently holding it in a register:
    /// its own def, or the most recent `load.local` fill of it.
    current_value: HashMap<ValueId, ValueId>,
    /// Logical value -> the local it spills to, once it has spilled at
    /// least once. A slot is allocated once per logical value and reused
    /// on every subsequent spill of that same value.
    spill_slot: HashMap<ValueId, u32>,
}

impl RaCtx {
    fn new(f: &Function) -> Self {
        let mut uses: HashMap<ValueId, Vec<u32>> = HashMap::new();
        let mut value_types: HashMap<ValueId, Type> = HashMap::new();
        let mut def_ordinal: HashMap<ValueId, u32> = HashMap::new();

        for block in &f.blocks {
            for instr in &block.instrs {
                if let Some((id, ty)) = instr.result {
                    value_types.insert(id, ty);
                    def_ordinal.insert(id, instr.ordinal);
                }
                for arg in instr.arg_iter() {
                    if let Arg::Value(id) = arg {
                        uses.entry(*id).or_default().push(instr.ordinal);
                    }
                }
            }
        }
        for list in uses.values_mut() {
            list.sort_unstable();
        }

        let last_use = def_ordinal
            .iter()
            .map(|(&id, &def)| {
                let last = uses.get(&id).and_then(|us| us.iter().copied().max()).unwrap_or(def);
                (id, last)
            })
            .collect();

        RaCtx { uses, value_types, last_use, current_value: HashMap::new(), spill_slot: HashMap::new() }
    }

    /// First use ordinal of `logical` strictly after `after`, or
    /// `u32::MAX` if it's never read again past that point.
    fn next_use_after(&self, logical: ValueId, after: u32) -> u32 {
        self.uses.get(&logical).and_then(|us| us.iter().copied().find(|&o| o > after)).unwrap_or(u32::MAX)
    }
}

fn bin_of(bins: &Bins, logical: ValueId) -> Option<usize> {
    bins.iter().position(|b| b.map(|o| o.logical) == Some(logical))
}

/// Frees bins whose occupant is no longer needed by anything ahead of
/// `ordinal` (`ra_expire_tmps` in the original pass).
fn expire_dead_bins(bins: &mut Bins, ctx: &RaCtx, ordinal: u32) {
    for bin in bins.iter_mut() {
        if let Some(occ) = *bin {
            if ctx.last_use.get(&occ.logical).copied().unwrap_or(0) < ordinal {
                *bin = None;
            }
        }
    }
}

/// Runs allocation over `f`, assigning a [`Location`] to every
/// instruction with a result and inserting `store.local`/`load.local`
/// pairs around values it has to spill.
pub fn run(f: &mut Function, num_regs: usize) {
    if f.blocks.is_empty() {
        return;
    }
    let mut ctx = RaCtx::new(f);
    let mut visited = vec![false; f.blocks.len()];
    visit(f, 0, vec![None; num_regs], &mut visited, &mut ctx);
}

/// Recurses over the CFG, giving each successor its own copy of the
/// predecessor's bin occupancy (`ra_push_state`/`ra_pop_state`). Every
/// JIT-compiled function is a small DAG, so a visited guard is enough to
/// process each block exactly once; a join block is allocated against
/// whichever predecessor reaches it first.
fn visit(f: &mut Function, block: usize, mut bins: Bins, visited: &mut [bool], ctx: &mut RaCtx) {
    if block >= f.blocks.len() || visited[block] {
        return;
    }
    visited[block] = true;
    process_block(f, block, &mut bins, ctx);
    let successors = f.blocks[block].successors.clone();
    for succ in successors {
        visit(f, succ, bins.clone(), visited, ctx);
    }
}

fn process_block(f: &mut Function, block: usize, bins: &mut Bins, ctx: &mut RaCtx) {
    let original: Vec<Instruction> = std::mem::take(&mut f.blocks[block].instrs);
    let mut rebuilt: Vec<Instruction> = Vec::with_capacity(original.len());

    for mut instr in original {
        expire_dead_bins(bins, ctx, instr.ordinal);

        // A def whose first operand is a value dying right here can reuse
        // that operand's bin instead of evicting someone else for it.
        let reuse_candidate = match (&instr.result, &instr.args[0]) {
            (Some(_), Some(Arg::Value(v))) if ctx.next_use_after(*v, instr.ordinal) == u32::MAX => Some(*v),
            _ => None,
        };

        let instr_ordinal = instr.ordinal;
        for arg in instr.arg_iter_mut() {
            if let Arg::Value(used) = *arg {
                let physical = match ctx.current_value.get(&used) {
                    Some(&p) => p,
                    None => fill_value(f, &mut rebuilt, bins, ctx, used, instr_ordinal),
                };
                *arg = Arg::Value(physical);
            }
        }

        if let Some((result_id, _)) = instr.result {
            let reg = allocate_bin(f, &mut rebuilt, bins, ctx, result_id, reuse_candidate, instr.ordinal);
            instr.location = Some(Location(reg as u8));
            ctx.current_value.insert(result_id, result_id);
        }

        rebuilt.push(instr);
    }

    f.blocks[block].instrs = rebuilt;
}

/// Picks (or frees up) a bin for `logical`, preferring `reuse_candidate`'s
/// bin when it's dying at this instruction anyway.
fn allocate_bin(
    f: &mut Function,
    rebuilt: &mut Vec<Instruction>,
    bins: &mut Bins,
    ctx: &mut RaCtx,
    logical: ValueId,
    reuse_candidate: Option<ValueId>,
    ordinal: u32,
) -> usize {
    if let Some(cand) = reuse_candidate {
        if let Some(idx) = bin_of(bins, cand) {
            bins[idx] = Some(Occupant { logical });
            return idx;
        }
    }

    if let Some(idx) = bins.iter().position(|b| b.is_none()) {
        bins[idx] = Some(Occupant { logical });
        return idx;
    }

    // Every bin is occupied: evict whoever's next use is furthest away
    // (Belady's rule, `ra_alloc_blocked_reg`).
    let victim_idx = bins
        .iter()
        .enumerate()
        .map(|(i, b)| (i, ctx.next_use_after(b.unwrap().logical, ordinal)))
        .max_by_key(|&(_, dist)| dist)
        .map(|(i, _)| i)
        .expect("allocate_bin called with an empty bin set");
    let victim_logical = bins[victim_idx].unwrap().logical;
    spill(f, rebuilt, ctx, victim_logical, ordinal);
    bins[victim_idx] = Some(Occupant { logical });
    victim_idx
}

/// Stores the current physical value of `logical` to its spill slot
/// (allocating one the first time this logical value is spilled).
fn spill(f: &mut Function, rebuilt: &mut Vec<Instruction>, ctx: &mut RaCtx, logical: ValueId, ordinal: u32) {
    let physical = ctx.current_value.remove(&logical).unwrap_or(logical);
    let slot = match ctx.spill_slot.get(&logical) {
        Some(&slot) => slot,
        None => {
            let ty = ctx.value_types.get(&logical).copied().unwrap_or(Type::I32);
            let slot = f.alloc_local(ty);
            ctx.spill_slot.insert(logical, slot);
            slot
        }
    };
    let mut instr = Instruction::new(Op::StoreLocal, vec![Arg::Imm(slot as i64), Arg::Value(physical)], None);
    instr.ordinal = ordinal;
    rebuilt.push(instr);
}

/// Reloads a spilled logical value into a fresh register, producing a new
/// physical value that becomes its current incarnation.
fn fill_value(
    f: &mut Function,
    rebuilt: &mut Vec<Instruction>,
    bins: &mut Bins,
    ctx: &mut RaCtx,
    logical: ValueId,
    ordinal: u32,
) -> ValueId {
    let slot = *ctx
        .spill_slot
        .get(&logical)
        .unwrap_or_else(|| panic!("value %{logical} read before its first definition or spill"));
    let ty = ctx.value_types.get(&logical).copied().unwrap_or(Type::I32);
    let new_id = f.alloc_value();
    let reg = allocate_bin(f, rebuilt, bins, ctx, logical, None, ordinal);

    let mut instr = Instruction::new(Op::LoadLocal, vec![Arg::Imm(slot as i64)], Some((new_id, ty)));
    instr.ordinal = ordinal;
    instr.location = Some(Location(reg as u8));
    rebuilt.push(instr);

    ctx.current_value.insert(logical, new_id);
    new_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::NativeBackend;
    use crate::backend::{Backend, CpuContext, HostFnTable};
    use crate::ir::{Arg, Const, Function as F, Op, Type};
    use crate::memory::AddressSpace;

    #[test]
    fn reuses_a_dying_operands_register_for_the_result() {
        let mut f = F::new();
        let entry = f.push_block("entry");
        let v0 = f.push_instr(entry, Op::Add, vec![Arg::Const(Const::I32(1)), Arg::Const(Const::I32(2))], Some(Type::I32)).unwrap();
        // v0 dies right here: its only other use is as the sole operand of v1.
        let _v1 = f.push_instr(entry, Op::Not, vec![Arg::Value(v0)], Some(Type::I32)).unwrap();
        f.assign_ordinals();
        run(&mut f, DEFAULT_NUM_REGS);
        let reg0 = f.blocks[entry].instrs[0].location;
        let reg1 = f.blocks[entry].instrs[1].location;
        assert_eq!(reg0, reg1, "result should reuse the dying operand's register");
    }

    #[test]
    fn spills_when_live_temporaries_exceed_register_count() {
        let mut f = F::new();
        let entry = f.push_block("entry");
        let mut values = Vec::new();
        for i in 0..4 {
            values.push(f.push_instr(entry, Op::Add, vec![Arg::Const(Const::I32(i)), Arg::Const(Const::I32(1))], Some(Type::I32)).unwrap());
        }
        for &v in &values {
            f.push_instr(entry, Op::Not, vec![Arg::Value(v)], Some(Type::I32));
        }
        f.assign_ordinals();
        run(&mut f, 1);
        let has_spill = f.blocks[entry].instrs.iter().any(|i| i.op == Op::StoreLocal);
        assert!(has_spill, "expected a real store.local with only one register available");
        let has_fill = f.blocks[entry].instrs.iter().any(|i| i.op == Op::LoadLocal);
        assert!(has_fill, "expected a real load.local refilling the spilled value before its next use");
    }

    /// spec.md §8 safety property, exercised end to end: packing six live
    /// values through only two registers must never corrupt a value, even
    /// though every one of them has to be spilled and refilled at least
    /// once. Run through `NativeBackend` specifically, since it's the
    /// backend that actually consumes `Location` — the interpreter would
    /// miss a register-aliasing bug entirely.
    #[test]
    fn never_corrupts_values_when_packed_into_few_registers() {
        let mut f = F::new();
        let entry = f.push_block("entry");
        let mut values = Vec::new();
        for i in 0..6 {
            let v = f.push_instr(entry, Op::Add, vec![Arg::Const(Const::I32(i)), Arg::Const(Const::I32(100))], Some(Type::I32)).unwrap();
            values.push(v);
        }
        for (slot, &v) in values.iter().enumerate() {
            f.push_instr(entry, Op::StoreContext, vec![Arg::Imm((slot * 4) as i64), Arg::Value(v)], None);
        }
        f.assign_ordinals();
        run(&mut f, 2);

        let mut backend = NativeBackend::new();
        let entry_id = backend.compile(f);
        let mut ctx = CpuContext::new(6 * 4);
        let mut mem = AddressSpace::default();
        backend.call(entry_id, &mut ctx, &mut mem, &HostFnTable::new());

        for i in 0..6u32 {
            assert_eq!(
                ctx.read((i * 4) as i64, Type::I32),
                Const::I32(100 + i),
                "value {i} corrupted by register packing with only 2 registers"
            );
        }
    }
}
