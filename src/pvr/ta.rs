//! Tile Accelerator: the three FIFOs, PCW-driven command/poly/vertex
//! sizing tables, texture registration, and the `STARTRENDER` handoff
//! protocol (spec.md §4.8). Grounded directly on
//! `original_source/src/hw/pvr/ta.c` — `ta_get_poly_type_raw`,
//! `ta_get_vert_type_raw`, `ta_get_param_size_raw` (transcribed field for
//! field), `ta_write_context`'s 32-byte alignment check, and
//! `ta_start_render`'s non-blocking pending-context lock with its
//! 333ns/polygon duration estimate.
//!
//! The real PVR's `union pcw`/`union tsp`/`union tcw` bitfield layouts
//! were not present in the retrieved source (only `ta.c` was recovered,
//! not `ta.h`); this module defines its own consistent bit layout for
//! those three words; [`texture_cache::Tsp`]/[`texture_cache::Tcw`] use
//! the same convention. What is preserved exactly from the source is the
//! *logic* — which field combinations produce which poly/vertex type, and
//! which type combinations produce a 32- vs 64-byte parameter.

use std::sync::{Arc, Mutex};

use crate::holly::{self, bits, IstKind};
use crate::memory::AddressSpace;
use crate::pvr::texture_cache::{Tcw, TextureCache, Tsp};
use crate::scheduler::{Scheduler, TimerHandle};

pub type HollyHandle = Arc<Mutex<holly::Holly>>;

/// 333ns/polygon (spec.md §4.8): ~3 million polygons/second.
pub const NS_PER_POLYGON: u64 = 333;

pub const PARAM_END_OF_LIST: u32 = 0;
pub const PARAM_USER_TILE_CLIP: u32 = 1;
pub const PARAM_OBJ_LIST_SET: u32 = 2;
pub const PARAM_POLY_OR_VOL: u32 = 4;
pub const PARAM_SPRITE: u32 = 5;
pub const PARAM_VERTEX: u32 = 7;

pub const LIST_OPAQUE: u32 = 0;
pub const LIST_OPAQUE_MODVOL: u32 = 1;
pub const LIST_TRANSLUCENT: u32 = 2;
pub const LIST_TRANSLUCENT_MODVOL: u32 = 3;
pub const LIST_PUNCH_THROUGH: u32 = 4;

/// Sentinel meaning "no list/vertex type is active yet", matching
/// `TA_NUM_LISTS`/`TA_NUM_VERTS` in the source.
pub const NO_VERTEX_TYPE: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pcw(pub u32);

impl Pcw {
    pub fn para_type(self) -> u32 {
        (self.0 >> 29) & 0x7
    }
    pub fn list_type(self) -> u32 {
        (self.0 >> 24) & 0x7
    }
    pub fn col_type(self) -> u32 {
        (self.0 >> 4) & 0x3
    }
    pub fn texture(self) -> bool {
        (self.0 >> 3) & 1 != 0
    }
    pub fn offset(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }
    pub fn volume(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }
    pub fn uv_16bit(self) -> bool {
        self.0 & 1 != 0
    }
}

/// `ta_get_poly_type_raw` (spec: "57.1.1.2 Parameter Combinations").
fn poly_type_raw(pcw: Pcw) -> u32 {
    if pcw.list_type() == LIST_OPAQUE_MODVOL || pcw.list_type() == LIST_TRANSLUCENT_MODVOL {
        return 6;
    }
    if pcw.para_type() == PARAM_SPRITE {
        return 5;
    }
    if pcw.volume() {
        return match pcw.col_type() {
            0 => 3,
            2 => 4,
            3 => 3,
            _ => 0,
        };
    }
    match pcw.col_type() {
        0 | 1 | 3 => 0,
        2 if pcw.texture() && !pcw.offset() => 1,
        2 if pcw.texture() && pcw.offset() => 2,
        2 => 1,
        _ => 0,
    }
}

/// `ta_get_vert_type_raw`.
fn vert_type_raw(pcw: Pcw) -> u32 {
    if pcw.list_type() == LIST_OPAQUE_MODVOL || pcw.list_type() == LIST_TRANSLUCENT_MODVOL {
        return 17;
    }
    if pcw.para_type() == PARAM_SPRITE {
        return if pcw.texture() { 16 } else { 15 };
    }
    if pcw.volume() {
        if pcw.texture() {
            if pcw.col_type() == 0 {
                return if pcw.uv_16bit() { 12 } else { 11 };
            }
            if pcw.col_type() == 2 || pcw.col_type() == 3 {
                return if pcw.uv_16bit() { 14 } else { 13 };
            }
        }
        if pcw.col_type() == 0 {
            return 9;
        }
        if pcw.col_type() == 2 || pcw.col_type() == 3 {
            return 10;
        }
    }
    if pcw.texture() {
        if pcw.col_type() == 0 {
            return if pcw.uv_16bit() { 4 } else { 3 };
        }
        if pcw.col_type() == 1 {
            return if pcw.uv_16bit() { 6 } else { 5 };
        }
        if pcw.col_type() == 2 || pcw.col_type() == 3 {
            return if pcw.uv_16bit() { 8 } else { 7 };
        }
    }
    match pcw.col_type() {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 0,
    }
}

/// `ta_get_param_size_raw`.
fn param_size_raw(pcw: Pcw, vertex_type: u32) -> u32 {
    match pcw.para_type() {
        PARAM_END_OF_LIST => 32,
        PARAM_USER_TILE_CLIP => 32,
        PARAM_OBJ_LIST_SET => 32,
        PARAM_POLY_OR_VOL => {
            let t = poly_type_raw(pcw);
            if t == 0 || t == 1 || t == 3 {
                32
            } else {
                64
            }
        }
        PARAM_SPRITE => 32,
        PARAM_VERTEX => {
            if matches!(vertex_type, 0 | 1 | 2 | 3 | 4 | 7 | 8 | 9 | 10) {
                32
            } else {
                64
            }
        }
        _ => 0,
    }
}

/// Dispatch tables built once at startup (spec.md §9), indexed by the
/// PCW sub-fields that actually affect the three derived quantities.
pub struct ParamTables {
    poly_type: Vec<u32>,
    vert_type: Vec<u32>,
    param_size: Vec<Vec<u32>>,
}

const TABLE_BITS: usize = 12;
const TABLE_SIZE: usize = 1 << TABLE_BITS;
const NUM_VERT_SLOTS: usize = 19;

fn reduced_key(pcw: Pcw) -> usize {
    ((pcw.para_type() as usize) << 9)
        | ((pcw.list_type() as usize) << 6)
        | ((pcw.col_type() as usize) << 4)
        | ((pcw.texture() as usize) << 3)
        | ((pcw.offset() as usize) << 2)
        | ((pcw.volume() as usize) << 1)
        | (pcw.uv_16bit() as usize)
}

fn pcw_from_reduced(key: usize) -> Pcw {
    let para = ((key >> 9) & 0x7) as u32;
    let list = ((key >> 6) & 0x7) as u32;
    let col = ((key >> 4) & 0x3) as u32;
    let tex = (key >> 3) & 1;
    let off = (key >> 2) & 1;
    let vol = (key >> 1) & 1;
    let uv = key & 1;
    Pcw((para << 29) | (list << 24) | (col << 4) | ((tex as u32) << 3) | ((off as u32) << 2) | ((vol as u32) << 1) | uv as u32)
}

impl ParamTables {
    pub fn new() -> Self {
        let mut poly_type = vec![0u32; TABLE_SIZE];
        let mut vert_type = vec![0u32; TABLE_SIZE];
        let mut param_size = vec![vec![0u32; NUM_VERT_SLOTS]; TABLE_SIZE];
        for key in 0..TABLE_SIZE {
            let pcw = pcw_from_reduced(key);
            poly_type[key] = poly_type_raw(pcw);
            vert_type[key] = vert_type_raw(pcw);
            for vt in 0..NUM_VERT_SLOTS {
                param_size[key][vt] = param_size_raw(pcw, vt as u32);
            }
        }
        Self { poly_type, vert_type, param_size }
    }

    pub fn poly_type(&self, pcw: Pcw) -> u32 {
        self.poly_type[reduced_key(pcw)]
    }
    pub fn vert_type(&self, pcw: Pcw) -> u32 {
        self.vert_type[reduced_key(pcw)]
    }
    pub fn param_size(&self, pcw: Pcw, vertex_type: u32) -> u32 {
        let vt = (vertex_type as usize).min(NUM_VERT_SLOTS - 1);
        self.param_size[reduced_key(pcw)][vt]
    }
}

impl Default for ParamTables {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackgroundState {
    pub isp_tsp_tcw: [u8; 12],
    pub vertices: [[u8; 8]; 3],
    pub width: u32,
    pub height: u32,
    pub autosort: bool,
    pub texture_stride: u32,
    pub palette_pixel_format: u32,
}

#[derive(Debug, Clone)]
pub struct TileContext {
    pub addr: u32,
    pub params: Vec<u8>,
    pub cursor: usize,
    pub list_type: Option<u32>,
    pub vertex_type: Option<u32>,
    pub background: BackgroundState,
}

impl TileContext {
    fn new(addr: u32) -> Self {
        Self { addr, params: Vec::new(), cursor: 0, list_type: None, vertex_type: None, background: BackgroundState::default() }
    }
}

pub struct PendingContext {
    pub frame: u64,
    pub ctx: TileContext,
}

pub enum RenderOutcome {
    Accepted { render_ns: u64, timer: TimerHandle },
    Skipped,
}

/// Converts one YUV420 384-byte macroblock (256 Y + 64 U + 64 V, 16x16)
/// into a 512-byte UYVY422 macroblock (spec.md §4.8 "YUV FIFO").
fn yuv420_to_uyvy422(block: &[u8]) -> [u8; 512] {
    let y_plane = &block[0..256];
    let u_plane = &block[256..320];
    let v_plane = &block[320..384];
    let mut out = [0u8; 512];
    for row in 0..16 {
        for pair in 0..8 {
            let x0 = pair * 2;
            let y0 = y_plane[row * 16 + x0];
            let y1 = y_plane[row * 16 + x0 + 1];
            let u = u_plane[(row / 2) * 8 + pair];
            let v = v_plane[(row / 2) * 8 + pair];
            let out_off = (row * 16 + x0) * 2;
            out[out_off] = u;
            out[out_off + 1] = y0;
            out[out_off + 2] = v;
            out[out_off + 3] = y1;
        }
    }
    out
}

/// Collapses the 64-bit texture-path mirror onto VRAM's real size
/// (spec.md §4.8 "Texture FIFO"): an 8MB VRAM aperture mirrored across a
/// 16MB window.
pub const TEXTURE_FIFO_ADDR_MASK: u32 = 0x00FF_FFFF;

pub struct Ta {
    tables: ParamTables,
    holly: HollyHandle,
    contexts: std::collections::HashMap<u32, TileContext>,
    pending_context: Arc<Mutex<Option<PendingContext>>>,
    texture_cache: TextureCache,
    frame: u64,
    frames_skipped: u64,
    yuv_buffer: Vec<u8>,
    yuv_macroblock_count: u32,
    yuv_macroblocks_total: u32,
}

impl Ta {
    pub fn new(holly: HollyHandle) -> Self {
        Self {
            tables: ParamTables::new(),
            holly,
            contexts: std::collections::HashMap::new(),
            pending_context: Arc::new(Mutex::new(None)),
            texture_cache: TextureCache::new(),
            frame: 0,
            frames_skipped: 0,
            yuv_buffer: Vec::new(),
            yuv_macroblock_count: 0,
            yuv_macroblocks_total: 0,
        }
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    pub fn pending_context_handle(&self) -> Arc<Mutex<Option<PendingContext>>> {
        Arc::clone(&self.pending_context)
    }

    pub fn texture_cache_mut(&mut self) -> &mut TextureCache {
        &mut self.texture_cache
    }

    pub fn tables(&self) -> &ParamTables {
        &self.tables
    }

    /// Split borrow for the render thread: it needs read-only sizing
    /// tables alongside a mutable texture cache in the same call.
    pub fn tables_and_cache_mut(&mut self) -> (&ParamTables, &mut TextureCache) {
        (&self.tables, &mut self.texture_cache)
    }

    /// Poly FIFO: appends a burst and, every time a full command has
    /// accumulated, updates list/vertex-type state and raises list-
    /// complete interrupts (spec.md §4.8, `ta_write_context`).
    pub fn poly_fifo_write(&mut self, ctx_addr: u32, bytes: &[u8]) {
        let tables = &self.tables;
        let holly = &self.holly;
        let ctx = self.contexts.entry(ctx_addr).or_insert_with(|| TileContext::new(ctx_addr));
        ctx.params.extend_from_slice(bytes);

        loop {
            let available = ctx.params.len() - ctx.cursor;
            if available < 32 {
                break;
            }
            let pcw = Pcw(u32::from_le_bytes(ctx.params[ctx.cursor..ctx.cursor + 4].try_into().unwrap()));
            let vertex_type_for_size = ctx.vertex_type.unwrap_or(NO_VERTEX_TYPE);
            let size = tables.param_size(pcw, vertex_type_for_size) as usize;
            if size == 0 || available < size {
                break;
            }

            match pcw.para_type() {
                PARAM_END_OF_LIST => {
                    if let Some(lt) = ctx.list_type {
                        holly.lock().unwrap().raise(IstKind::Nrm, holly::list_complete_bit(lt));
                    }
                    ctx.list_type = None;
                    ctx.vertex_type = None;
                }
                PARAM_POLY_OR_VOL | PARAM_SPRITE => {
                    ctx.vertex_type = Some(tables.vert_type(pcw));
                }
                _ => {}
            }
            if matches!(pcw.para_type(), PARAM_OBJ_LIST_SET | PARAM_POLY_OR_VOL | PARAM_SPRITE) && ctx.list_type.is_none() {
                ctx.list_type = Some(pcw.list_type());
            }
            ctx.cursor += size;
        }
    }

    /// YUV FIFO: transcodes completed macroblocks into `wave_ram_base`,
    /// raising `TA_YUV_DONE` once `width_blocks * height_blocks`
    /// macroblocks have landed (spec.md §4.8).
    pub fn yuv_set_dimensions(&mut self, width_blocks: u32, height_blocks: u32) {
        self.yuv_macroblocks_total = width_blocks * height_blocks;
        self.yuv_macroblock_count = 0;
        self.yuv_buffer.clear();
    }

    pub fn yuv_fifo_write(&mut self, mem: &mut AddressSpace, wave_ram_base: u32, bytes: &[u8]) {
        self.yuv_buffer.extend_from_slice(bytes);
        while self.yuv_buffer.len() >= 384 {
            let macroblock: Vec<u8> = self.yuv_buffer.drain(0..384).collect();
            let uyvy = yuv420_to_uyvy422(&macroblock);
            mem.write_burst(wave_ram_base + self.yuv_macroblock_count * 512, &uyvy);
            self.yuv_macroblock_count += 1;
            if self.yuv_macroblock_count >= self.yuv_macroblocks_total {
                self.holly.lock().unwrap().raise(IstKind::Nrm, bits::TA_YUV_DONE);
                self.yuv_macroblock_count = 0;
            }
        }
    }

    /// Texture FIFO: a straight copy, masked to collapse the 64-bit path
    /// mirror (spec.md §4.8).
    pub fn texture_fifo_write(&mut self, mem: &mut AddressSpace, dest_addr: u32, bytes: &[u8]) {
        mem.write_burst(dest_addr & TEXTURE_FIFO_ADDR_MASK, bytes);
    }

    /// Walks a context's parameter buffer registering every textured
    /// polygon/sprite, returning the polygon count used for the render-
    /// duration estimate (spec.md §4.8 "Texture registration").
    fn register_textures(&mut self, mem: &mut AddressSpace, ctx: &TileContext) -> u32 {
        let mut num_polys = 0u32;
        let mut cursor = 0usize;
        let mut vertex_type = NO_VERTEX_TYPE;
        while cursor + 32 <= ctx.params.len() {
            let pcw = Pcw(u32::from_le_bytes(ctx.params[cursor..cursor + 4].try_into().unwrap()));
            let size = self.tables.param_size(pcw, vertex_type) as usize;
            if size == 0 {
                break;
            }
            if matches!(pcw.para_type(), PARAM_POLY_OR_VOL | PARAM_SPRITE) {
                vertex_type = self.tables.vert_type(pcw);
                num_polys += 1;
                if pcw.texture() && cursor + 12 <= ctx.params.len() {
                    let tsp = Tsp(u32::from_le_bytes(ctx.params[cursor + 4..cursor + 8].try_into().unwrap()));
                    let tcw = Tcw(u32::from_le_bytes(ctx.params[cursor + 8..cursor + 12].try_into().unwrap()));
                    self.texture_cache.register(mem, tsp, tcw, self.frame);
                }
            }
            cursor += size;
        }
        num_polys
    }

    /// `STARTRENDER` (spec.md §4.8 "Render-start protocol").
    pub fn start_render(&mut self, mem: &mut AddressSpace, scheduler: &mut Scheduler, addr: u32, background: BackgroundState) -> RenderOutcome {
        let Some(mut ctx) = self.contexts.remove(&addr) else {
            return RenderOutcome::Skipped;
        };
        ctx.background = background;

        let pending_context = Arc::clone(&self.pending_context);
        let mut guard = match pending_context.try_lock() {
            Ok(g) => g,
            Err(_) => {
                self.frames_skipped += 1;
                let holly = Arc::clone(&self.holly);
                let mut h = holly.lock().unwrap();
                h.raise(IstKind::Nrm, bits::RENDER_DONE_ISP);
                h.raise(IstKind::Nrm, bits::RENDER_DONE_VIDEO);
                h.raise(IstKind::Nrm, bits::RENDER_DONE_TSP);
                return RenderOutcome::Skipped;
            }
        };

        self.frame += 1;
        let num_polys = self.register_textures(mem, &ctx);
        *guard = Some(PendingContext { frame: self.frame, ctx });
        drop(guard);

        let render_ns = num_polys as u64 * NS_PER_POLYGON;
        let holly = Arc::clone(&self.holly);
        let timer = scheduler.start_timer(render_ns, move |_| {
            let mut h = holly.lock().unwrap();
            h.raise(IstKind::Nrm, bits::RENDER_DONE_ISP);
            h.raise(IstKind::Nrm, bits::RENDER_DONE_VIDEO);
            h.raise(IstKind::Nrm, bits::RENDER_DONE_TSP);
        });

        RenderOutcome::Accepted { render_ns, timer }
    }

    /// `SOFTRESET` (spec.md §9 open question, resolved in DESIGN.md:
    /// drain all FIFOs and discard the in-flight context).
    pub fn soft_reset(&mut self) {
        self.contexts.clear();
        self.yuv_buffer.clear();
        self.yuv_macroblock_count = 0;
        if let Ok(mut guard) = self.pending_context.try_lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcw(para: u32, list: u32, col: u32, texture: bool, offset: bool, volume: bool, uv16: bool) -> Pcw {
        Pcw((para << 29) | (list << 24) | (col << 4) | ((texture as u32) << 3) | ((offset as u32) << 2) | ((volume as u32) << 1) | uv16 as u32)
    }

    #[test]
    fn ta_parameter_sizing_matches_the_documented_table() {
        let tables = ParamTables::new();
        assert_eq!(tables.param_size(pcw(PARAM_END_OF_LIST, 0, 0, false, false, false, false), NO_VERTEX_TYPE), 32);

        let poly_type0 = pcw(PARAM_POLY_OR_VOL, LIST_OPAQUE, 0, false, false, false, false);
        assert_eq!(tables.poly_type(poly_type0), 0);
        assert_eq!(tables.param_size(poly_type0, NO_VERTEX_TYPE), 32);

        let poly_type2 = pcw(PARAM_POLY_OR_VOL, LIST_OPAQUE, 2, true, true, false, false);
        assert_eq!(tables.poly_type(poly_type2), 2);
        assert_eq!(tables.param_size(poly_type2, NO_VERTEX_TYPE), 64);

        assert_eq!(tables.param_size(pcw(PARAM_VERTEX, 0, 0, false, false, false, false), 5), 64);
        assert_eq!(tables.param_size(pcw(PARAM_VERTEX, 0, 0, false, false, false, false), 0), 32);
    }

    #[test]
    fn end_of_list_raises_the_interrupt_for_the_active_list_and_resets_state() {
        let holly = Arc::new(Mutex::new(holly::Holly::new()));
        holly.lock().unwrap().write_iml(0, IstKind::Nrm, bits::TA_LIST_OPAQUE);
        let mut ta = Ta::new(Arc::clone(&holly));

        let header = pcw(PARAM_POLY_OR_VOL, LIST_OPAQUE, 0, false, false, false, false);
        let mut command = vec![0u8; 32];
        command[0..4].copy_from_slice(&header.0.to_le_bytes());
        ta.poly_fifo_write(0x1000, &command);

        let eol = pcw(PARAM_END_OF_LIST, 0, 0, false, false, false, false);
        let mut eol_command = vec![0u8; 32];
        eol_command[0..4].copy_from_slice(&eol.0.to_le_bytes());
        ta.poly_fifo_write(0x1000, &eol_command);

        assert!(holly.lock().unwrap().ist(IstKind::Nrm) & bits::TA_LIST_OPAQUE != 0);
        assert_eq!(ta.contexts.get(&0x1000).unwrap().list_type, None);
    }

    #[test]
    fn a_second_startrender_while_the_first_is_pending_is_skipped_and_increments_the_counter() {
        let holly = Arc::new(Mutex::new(holly::Holly::new()));
        let mut ta = Ta::new(Arc::clone(&holly));
        let mut mem = AddressSpace::default();
        let mut sched = Scheduler::new();

        ta.contexts.insert(0x2000, TileContext::new(0x2000));
        let outcome1 = ta.start_render(&mut mem, &mut sched, 0x2000, BackgroundState::default());
        assert!(matches!(outcome1, RenderOutcome::Accepted { .. }));

        let held = ta.pending_context_handle();
        let _guard = held.lock().unwrap(); // simulate the render thread still holding the lock

        ta.contexts.insert(0x3000, TileContext::new(0x3000));
        let outcome2 = ta.start_render(&mut mem, &mut sched, 0x3000, BackgroundState::default());
        assert!(matches!(outcome2, RenderOutcome::Skipped));
        assert_eq!(ta.frames_skipped(), 1);
    }

    #[test]
    fn yuv_macroblocks_transcode_to_uyvy422_and_signal_completion() {
        let holly = Arc::new(Mutex::new(holly::Holly::new()));
        holly.lock().unwrap().write_iml(0, IstKind::Nrm, bits::TA_YUV_DONE);
        let mut ta = Ta::new(Arc::clone(&holly));
        let mut mem = AddressSpace::default();
        mem.map_ram(crate::memory::RamRegion::new(0, 0x10000, 0));

        ta.yuv_set_dimensions(1, 1);
        let mut block = vec![0u8; 384];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        ta.yuv_fifo_write(&mut mem, 0, &block);

        assert!(holly.lock().unwrap().ist(IstKind::Nrm) & bits::TA_YUV_DONE != 0);
        assert_eq!(mem.read8(0), block[256]); // first output byte is U(0,0)
    }
}
