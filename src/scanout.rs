//! Scanout/SPG timing: derives a periodic VBLANK-in interrupt from the
//! `SPG_LOAD`/`SPG_VBLANK`/`SPG_CONTROL` register layout (spec.md §8
//! "Scanout interrupt cadence"). Grounded on
//! `original_source/src/hw/holly/pvr2.h`'s `SPG_LOAD_T`/`SPG_VBLANK_T`/
//! `SPG_CONTROL_T` bitfields; `pvr2.cc`'s per-scanline state machine
//! wasn't present in the retrieved source, so this crate tracks whole
//! frames rather than individual scanlines — sufficient to reproduce the
//! cadence spec.md tests (exactly 60 `PCVOINT` raises per simulated
//! second at 60 Hz NTSC) without claiming scanline-accurate HBLANK/VSYNC
//! timing.

use std::sync::{Arc, Mutex};

use crate::holly::{self, bits, IstKind};
use crate::memory::MmioHandler;
use crate::scheduler::{Device, TimerQueue};

pub type HollyHandle = Arc<Mutex<holly::Holly>>;

/// `SPG_LOAD`: `hcount`/`vcount` are the last pixel/line index of a frame,
/// so line and pixel counts are one more than the stored value.
#[derive(Debug, Clone, Copy)]
pub struct SpgLoad {
    pub hcount: u32,
    pub vcount: u32,
}

/// `SPG_VBLANK`: the scanline range `[vbstart, vbend)` during which the
/// beam is in vertical blank.
#[derive(Debug, Clone, Copy)]
pub struct SpgVblank {
    pub vbstart: u32,
    pub vbend: u32,
}

/// `SPG_CONTROL`'s `NTSC`/`PAL` bits select the nominal refresh rate this
/// crate uses to derive the pixel clock from `SPG_LOAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStandard {
    Ntsc,
    Pal,
}

impl VideoStandard {
    fn refresh_hz(self) -> u64 {
        match self {
            VideoStandard::Ntsc => 60,
            VideoStandard::Pal => 50,
        }
    }
}

pub struct Scanout {
    holly: HollyHandle,
    standard: VideoStandard,
    load: SpgLoad,
    vblank: SpgVblank,
    /// Pixel clocks elapsed within the current frame.
    frame_cycles: u64,
    vblank_raises: u64,
}

impl Scanout {
    pub fn new(holly: HollyHandle) -> Self {
        Self {
            holly,
            standard: VideoStandard::Ntsc,
            load: SpgLoad { hcount: 857, vcount: 524 }, // NTSC 480i line/pixel totals
            vblank: SpgVblank { vbstart: 480, vbend: 524 },
            frame_cycles: 0,
            vblank_raises: 0,
        }
    }

    pub fn set_standard(&mut self, standard: VideoStandard) {
        self.standard = standard;
    }

    pub fn set_load(&mut self, load: SpgLoad) {
        self.load = load;
    }

    pub fn set_vblank(&mut self, vblank: SpgVblank) {
        self.vblank = vblank;
    }

    fn frame_pixels(&self) -> u64 {
        (self.load.hcount as u64 + 1) * (self.load.vcount as u64 + 1)
    }

    /// Total raises since construction — what the testable property
    /// counts over a 1 s window.
    pub fn vblank_raises(&self) -> u64 {
        self.vblank_raises
    }
}

impl Device for Scanout {
    /// Pixel clock sized so exactly `refresh_hz` frames (hence VBLANKs)
    /// elapse per second of virtual time (spec.md §8).
    fn clock_hz(&self) -> u64 {
        self.frame_pixels() * self.standard.refresh_hz()
    }

    fn run(&mut self, cycles: u64, _timers: &mut TimerQueue) -> u64 {
        let frame_pixels = self.frame_pixels();
        if frame_pixels == 0 {
            return cycles;
        }
        self.frame_cycles += cycles;
        while self.frame_cycles >= frame_pixels {
            self.frame_cycles -= frame_pixels;
            self.vblank_raises += 1;
            self.holly.lock().unwrap().raise(IstKind::Nrm, bits::PCVOINT);
        }
        cycles
    }
}

/// `SPG_LOAD`/`SPG_VBLANK`/`SPG_CONTROL` as little-endian 32-bit registers
/// at their PVR2 register-block offsets, matching `pvr2.h`'s layout.
impl MmioHandler for Scanout {
    fn read8(&mut self, addr: u32) -> u8 {
        self.read32(addr & !0x3) as u8
    }

    fn read16(&mut self, addr: u32) -> u16 {
        self.read32(addr & !0x3) as u16
    }

    fn read32(&mut self, addr: u32) -> u32 {
        match addr {
            0x00C => self.load.hcount | (self.load.vcount << 16),
            0x020 => self.vblank.vbstart | (self.vblank.vbend << 16),
            0x028 => if self.standard == VideoStandard::Ntsc { 1 << 6 } else { 1 << 7 },
            _ => 0,
        }
    }

    fn write8(&mut self, _addr: u32, _value: u8) {}

    fn write16(&mut self, _addr: u32, _value: u16) {}

    fn write32(&mut self, addr: u32, value: u32) {
        match addr {
            0x00C => self.set_load(SpgLoad { hcount: value & 0x3FF, vcount: (value >> 16) & 0x3FF }),
            0x020 => self.set_vblank(SpgVblank { vbstart: value & 0x3FF, vbend: (value >> 16) & 0x3FF }),
            0x028 => self.set_standard(if value & (1 << 6) != 0 { VideoStandard::Ntsc } else { VideoStandard::Pal }),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_one_second_tick_at_60hz_ntsc_raises_pcvoint_exactly_sixty_times() {
        let holly = Arc::new(Mutex::new(holly::Holly::new()));
        holly.lock().unwrap().write_iml(0, IstKind::Nrm, bits::PCVOINT);
        let mut scanout = Scanout::new(Arc::clone(&holly));
        let mut timers = TimerQueue::new();

        let clock_hz = scanout.clock_hz();
        let cycles = clock_hz; // exactly one second's worth at this clock
        scanout.run(cycles, &mut timers);

        assert_eq!(scanout.vblank_raises(), 60);
    }

    #[test]
    fn pal_mode_raises_fifty_times_per_second() {
        let holly = Arc::new(Mutex::new(holly::Holly::new()));
        let mut scanout = Scanout::new(Arc::clone(&holly));
        scanout.set_standard(VideoStandard::Pal);
        let mut timers = TimerQueue::new();

        let clock_hz = scanout.clock_hz();
        scanout.run(clock_hz, &mut timers);

        assert_eq!(scanout.vblank_raises(), 50);
    }

    #[test]
    fn register_writes_round_trip_through_spg_load() {
        let holly = Arc::new(Mutex::new(holly::Holly::new()));
        let mut scanout = Scanout::new(holly);
        scanout.write32(0x00C, 0x0100 << 16 | 0x0200);
        assert_eq!(scanout.load.hcount, 0x0200);
        assert_eq!(scanout.load.vcount, 0x0100);
    }
}
