//! IR optimization passes (spec.md §4.5): constant folding, dead-code
//! elimination, and register allocation, run in that order over a
//! [`Function`](super::Function) before it reaches a backend.

pub mod fold;
pub mod dce;
pub mod regalloc;

use super::Function;

/// Runs the fixed pipeline the JIT applies to every translated block.
/// Register allocation always runs last since later passes assume
/// [`super::Location`] is unassigned.
pub fn optimize(f: &mut Function) {
    fold::run(f);
    dce::run(f);
    f.assign_ordinals();
    regalloc::run(f, regalloc::DEFAULT_NUM_REGS);
}
