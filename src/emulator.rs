//! Top-level wiring: owns guest memory, the scheduler, both JIT caches,
//! Holly, the TA, and the supplementary devices, and drives `dc_tick`
//! (spec.md §5 "Concurrency & Resource Model").
//!
//! The SH-4/ARM7 CPU loops are driven directly by `dc_tick` rather than
//! registered as [`scheduler::Device`]s: a `Device::run` has no guest-
//! memory parameter, and the JIT dispatcher needs one on every block
//! lookup. AICA and the scanout/SPG timer, which only advance internal
//! counters, fit the `Device` trait cleanly and are registered with the
//! scheduler as spec.md §4.2 describes.

use std::sync::{Arc, Mutex};

use crate::backend::interpreter::InterpreterBackend;
use crate::backend::{Backend, CpuContext, HostFnTable};
use crate::config::Config;
use crate::devices::aica::Aica;
use crate::devices::gdrom::GdRom;
use crate::devices::maple::Maple;
use crate::frontend::arm7::{Arm7Frontend, CTX_PC as ARM7_CTX_PC};
use crate::frontend::sh4::{Sh4Frontend, CTX_PC as SH4_CTX_PC};
use crate::holly::{self};
use crate::ir::{Const, Type};
use crate::jit::JitCache;
use crate::memory::{AddressSpace, RamRegion};
use crate::pvr::ta::{BackgroundState, RenderOutcome, Ta};
use crate::pvr::tr;
use crate::render::RenderBackend;
use crate::scanout::Scanout;
use crate::scheduler::Scheduler;

pub const MAIN_RAM_BASE: u32 = 0x0c00_0000;
pub const MAIN_RAM_SIZE: u32 = 16 * 1024 * 1024;
pub const VRAM_BASE: u32 = 0x0500_0000;
pub const VRAM_SIZE: u32 = 8 * 1024 * 1024;
pub const WAVE_RAM_BASE: u32 = 0x0080_0000;
pub const WAVE_RAM_SIZE: u32 = 2 * 1024 * 1024;

/// Where a raw `.bin` is loaded and entered (spec.md §6 "CLI surface").
pub const BIN_LOAD_ADDR: u32 = 0x0c01_0000;

/// Safety valve against a block whose cycle cost folds to zero looping
/// forever within one `dc_tick` slice.
const MAX_BLOCKS_PER_SLICE: u32 = 1_000_000;

pub struct Configuration {
    pub maple_ports: u32,
}

impl Configuration {
    pub fn from_config(config: &Config) -> Self {
        Self { maple_ports: config.get_u64("maple", "ports", 4) as u32 }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self { maple_ports: 4 }
    }
}

pub struct Emulator {
    mem: AddressSpace,
    scheduler: Scheduler,
    holly: Arc<Mutex<holly::Holly>>,
    sh4_jit: JitCache<InterpreterBackend>,
    arm7_jit: JitCache<InterpreterBackend>,
    sh4_ctx: CpuContext,
    arm7_ctx: CpuContext,
    host_fns: HostFnTable,
    ta: Ta,
    gdrom: GdRom,
    maple: Maple,
}

impl Emulator {
    pub fn new(config: &Configuration) -> Self {
        let holly = Arc::new(Mutex::new(holly::Holly::new()));

        let mut mem = AddressSpace::new();
        mem.map_ram(RamRegion::new(MAIN_RAM_BASE, MAIN_RAM_SIZE, MAIN_RAM_SIZE - 1));
        mem.map_ram(RamRegion::new(VRAM_BASE, VRAM_SIZE, VRAM_SIZE - 1));
        mem.map_ram(RamRegion::new(WAVE_RAM_BASE, WAVE_RAM_SIZE, WAVE_RAM_SIZE - 1));
        // Both CPUs reset onto a `branch to self` spin loop rather than
        // raw zeroed RAM: the frontends' block scanners require an
        // explicit terminator to end a block, so scanning all-zero memory
        // would never return. `load_bin`/a disc boot image overwrites
        // this before anything meaningful runs.
        mem.write_burst(MAIN_RAM_BASE, &[0xAF, 0xFE]);
        mem.write_burst(WAVE_RAM_BASE, &[0xEA, 0xFF, 0xFF, 0xFE]);

        let mut sh4_ctx = CpuContext::new(256);
        sh4_ctx.write(SH4_CTX_PC, Const::I32(MAIN_RAM_BASE as u32));
        let mut arm7_ctx = CpuContext::new(256);
        arm7_ctx.write(ARM7_CTX_PC, Const::I32(WAVE_RAM_BASE as u32));

        let mut scheduler = Scheduler::new();
        scheduler.register("aica", Box::new(Aica::new(0x8000, WAVE_RAM_SIZE)));
        scheduler.register("scanout", Box::new(Scanout::new(Arc::clone(&holly))));

        Self {
            mem,
            scheduler,
            holly: Arc::clone(&holly),
            sh4_jit: JitCache::new(InterpreterBackend::new(), Box::new(Sh4Frontend::new(false, false))),
            arm7_jit: JitCache::new(InterpreterBackend::new(), Box::new(Arm7Frontend)),
            sh4_ctx,
            arm7_ctx,
            host_fns: HostFnTable::new(),
            ta: Ta::new(Arc::clone(&holly)),
            gdrom: GdRom::new(Arc::clone(&holly)),
            maple: Maple::new(config.maple_ports),
        }
    }

    pub fn mem_mut(&mut self) -> &mut AddressSpace {
        &mut self.mem
    }

    pub fn gdrom_mut(&mut self) -> &mut GdRom {
        &mut self.gdrom
    }

    pub fn maple_mut(&mut self) -> &mut Maple {
        &mut self.maple
    }

    pub fn ta_mut(&mut self) -> &mut Ta {
        &mut self.ta
    }

    pub fn holly_handle(&self) -> Arc<Mutex<holly::Holly>> {
        Arc::clone(&self.holly)
    }

    /// Loads a raw `.bin` at `0x0c010000` and sets the SH-4's entry PC
    /// there (spec.md §6).
    pub fn load_bin(&mut self, bytes: &[u8]) {
        self.mem.write_burst(BIN_LOAD_ADDR, bytes);
        self.sh4_ctx.write(SH4_CTX_PC, Const::I32(BIN_LOAD_ADDR));
    }

    fn run_sh4_slice(&mut self, cycles: u64) {
        self.sh4_ctx.remaining_cycles += cycles as i64;
        let mut blocks = 0u32;
        while self.sh4_ctx.remaining_cycles > 0 && blocks < MAX_BLOCKS_PER_SLICE {
            let pc = match self.sh4_ctx.read(SH4_CTX_PC, Type::I32) {
                Const::I32(v) => v as u32,
                _ => unreachable!(),
            };
            let host_entry = self.sh4_jit.get_or_compile(&mut self.mem, pc);
            self.sh4_jit.backend_mut().call(host_entry, &mut self.sh4_ctx, &mut self.mem, &self.host_fns);
            blocks += 1;
        }
    }

    fn run_arm7_slice(&mut self, cycles: u64) {
        self.arm7_ctx.remaining_cycles += cycles as i64;
        let mut blocks = 0u32;
        while self.arm7_ctx.remaining_cycles > 0 && blocks < MAX_BLOCKS_PER_SLICE {
            let pc = match self.arm7_ctx.read(ARM7_CTX_PC, Type::I32) {
                Const::I32(v) => v as u32,
                _ => unreachable!(),
            };
            let host_entry = self.arm7_jit.get_or_compile(&mut self.mem, pc);
            self.arm7_jit.backend_mut().call(host_entry, &mut self.arm7_ctx, &mut self.mem, &self.host_fns);
            blocks += 1;
        }
    }

    /// Advances the whole machine by `delta_ns` (spec.md §5): both CPUs
    /// run their cycle share through the JIT dispatcher, then the
    /// scheduler advances AICA and fires due timers (render-done, list-
    /// complete).
    pub fn dc_tick(&mut self, delta_ns: u64) {
        let sh4_cycles = delta_ns * 200; // 200MHz SH-4, matches spec.md's clock-share model
        let arm7_cycles = delta_ns / 30; // ~33MHz ARM7
        self.run_sh4_slice(sh4_cycles);
        self.run_arm7_slice(arm7_cycles);
        self.scheduler.tick(delta_ns);
        self.ta.texture_cache_mut().sync_dirty();
    }

    /// `(irl9, irl11, irl13)` as currently asserted (spec.md §4.10).
    pub fn irl_lines(&self) -> [bool; 3] {
        self.holly.lock().unwrap().irl_lines()
    }

    /// `STARTRENDER` entry point (spec.md §4.8).
    pub fn start_render(&mut self, addr: u32, background: BackgroundState) -> RenderOutcome {
        self.ta.start_render(&mut self.mem, &mut self.scheduler, addr, background)
    }

    /// Render-thread side of the handoff: takes the latest pending
    /// context (if any) and draws it, returning whether a frame was
    /// produced (spec.md §5 "a separate host render thread lazily takes
    /// ownership of the latest pending context").
    pub fn render_pending(&mut self, backend: &mut dyn RenderBackend) -> bool {
        let pending = self.ta.pending_context_handle();
        let taken = pending.lock().unwrap().take();
        let Some(pending_context) = taken else { return false };

        let (tables, textures) = self.ta.tables_and_cache_mut();
        let render_context = tr::translate(&mut self.mem, textures, backend, tables, &pending_context.ctx);

        let identity: [f32; 16] = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        backend.begin_frame();
        backend.draw_batch(&identity, &render_context.vertices, &render_context.surfaces, &render_context.surface_order);
        backend.end_frame();
        true
    }
}
