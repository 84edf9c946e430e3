//! JIT block cache (spec.md §4.7): maps `(pc, specialization_mask)` to a
//! compiled code region, sized and page-indexed so a guest write can
//! invalidate every block it touches.

use std::collections::{HashMap, HashSet};

use crate::backend::Backend;
use crate::frontend::{Frontend, Guest};
use crate::ir::{passes, Function};

/// Guest pages are tracked at this granularity (spec.md §9: "page
/// granularity is coarse, recompilation rates are bounded by page-write
/// locality").
pub const PAGE_SIZE: u32 = 4096;

fn page_of(addr: u32) -> u32 {
    addr / PAGE_SIZE
}

fn pages_covered(pc: u32, size: u32) -> Vec<u32> {
    let start = page_of(pc);
    let end = page_of(pc + size.saturating_sub(1));
    (start..=end).collect()
}

struct CachedBlock {
    host_entry: usize,
    pages: Vec<u32>,
}

/// One cache per guest frontend: the block key's mask dimension is that
/// frontend's own specialization bits (FPSCR PR/SZ for SH-4, none for
/// ARM7), so SH-4 and AICA each get their own `JitCache`.
pub struct JitCache<B: Backend> {
    backend: B,
    frontend: Box<dyn Frontend + Send>,
    blocks: HashMap<(u32, u32), CachedBlock>,
    by_page: HashMap<u32, HashSet<(u32, u32)>>,
    free_list: Vec<usize>,
}

impl<B: Backend> JitCache<B> {
    pub fn new(backend: B, frontend: Box<dyn Frontend + Send>) -> Self {
        Self { backend, frontend, blocks: HashMap::new(), by_page: HashMap::new(), free_list: Vec::new() }
    }

    fn key(&self, pc: u32) -> (u32, u32) {
        (pc, self.frontend.specialization_mask())
    }

    pub fn lookup(&self, pc: u32) -> Option<usize> {
        self.blocks.get(&self.key(pc)).map(|b| b.host_entry)
    }

    /// Dispatcher entry point: returns the cached block for `pc`, compiling
    /// it on a miss (spec.md §4.7).
    pub fn get_or_compile(&mut self, guest: &mut dyn Guest, pc: u32) -> usize {
        match self.lookup(pc) {
            Some(host_entry) => host_entry,
            None => self.compile_block(guest, pc),
        }
    }

    pub fn compile_block(&mut self, guest: &mut dyn Guest, pc: u32) -> usize {
        let shape = self.frontend.analyze_code(guest, pc);
        let mut ir = Function::new();
        self.frontend.translate_code(guest, pc, shape, &mut ir);
        passes::optimize(&mut ir);

        let host_entry = if let Some(slot) = self.free_list.pop() {
            self.backend.recompile(slot, ir);
            slot
        } else {
            self.backend.compile(ir)
        };

        let key = self.key(pc);
        let pages = pages_covered(pc, shape.size.max(1));
        for &pg in &pages {
            self.by_page.entry(pg).or_default().insert(key);
        }
        self.blocks.insert(key, CachedBlock { host_entry, pages });
        host_entry
    }

    /// Removes every block touching guest page `pg`, returning their code
    /// regions to the free list (spec.md §4.7) and reporting how many were
    /// invalidated.
    pub fn invalidate_page(&mut self, pg: u32) -> usize {
        let Some(keys) = self.by_page.remove(&pg) else { return 0 };
        let mut count = 0;
        for key in keys {
            if let Some(block) = self.blocks.remove(&key) {
                for &other_pg in &block.pages {
                    if other_pg != pg {
                        if let Some(set) = self.by_page.get_mut(&other_pg) {
                            set.remove(&key);
                        }
                    }
                }
                self.free_list.push(block.host_entry);
                count += 1;
            }
        }
        count
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::interpreter::InterpreterBackend;
    use crate::frontend::sh4::Sh4Frontend;
    use std::collections::HashMap as Map;

    struct FakeGuest(Map<u32, u16>);
    impl Guest for FakeGuest {
        fn read16(&mut self, addr: u32) -> u16 {
            *self.0.get(&addr).unwrap_or(&0x0009) // NOP
        }
        fn read32(&mut self, addr: u32) -> u32 {
            let lo = self.read16(addr) as u32;
            let hi = self.read16(addr + 2) as u32;
            (hi << 16) | lo
        }
    }

    fn nop_program(pc: u32) -> FakeGuest {
        let mut mem = Map::new();
        mem.insert(pc, 0x0009);
        mem.insert(pc + 2, 0xA000); // BRA #0 terminates the block
        FakeGuest(mem)
    }

    #[test]
    fn compiling_the_same_pc_twice_reuses_the_cached_entry() {
        let mut cache = JitCache::new(InterpreterBackend::new(), Box::new(Sh4Frontend::new(false, false)));
        let mut guest = nop_program(0x8000_0000);
        let first = cache.compile_block(&mut guest, 0x8000_0000);
        assert_eq!(cache.lookup(0x8000_0000), Some(first));
        assert_eq!(cache.block_count(), 1);
    }

    #[test]
    fn invalidating_a_page_frees_every_block_it_covers_and_clears_the_lookup() {
        let mut cache = JitCache::new(InterpreterBackend::new(), Box::new(Sh4Frontend::new(false, false)));
        let mut guest = nop_program(0x8000_0000);
        cache.compile_block(&mut guest, 0x8000_0000);
        assert_eq!(cache.lookup(0x8000_0000).is_some(), true);

        let freed = cache.invalidate_page(page_of(0x8000_0000));
        assert_eq!(freed, 1);
        assert_eq!(cache.lookup(0x8000_0000), None);
        assert_eq!(cache.block_count(), 0);
    }

    #[test]
    fn a_freed_code_region_is_reused_on_the_next_compile() {
        let mut cache = JitCache::new(InterpreterBackend::new(), Box::new(Sh4Frontend::new(false, false)));
        let mut guest = nop_program(0x8000_0000);
        let first = cache.compile_block(&mut guest, 0x8000_0000);
        cache.invalidate_page(page_of(0x8000_0000));

        let mut guest2 = nop_program(0x8000_1000);
        let second = cache.compile_block(&mut guest2, 0x8000_1000);
        assert_eq!(first, second, "recompilation should reuse the freed slot rather than grow storage");
    }
}
