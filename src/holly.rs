//! Holly interrupt routing (spec.md §4.10): three pending-interrupt
//! registers OR-masked against three level-mask registers to derive the
//! SH-4's IRL lines 9/11/13. Grounded on
//! `original_source/src/hw/holly/holly.cc`'s `RequestInterrupt`/
//! `UnrequestInterrupt`/`ForwardRequestInterrupts` triangle (register
//! layout and the "writing a 1 clears the interrupt" `IST` semantics);
//! `ForwardRequestInterrupts` itself was not present in the retrieved
//! source, so the OR-mask-into-three-lines computation follows spec.md
//! §4.10's description directly.
//!
//! Holly is the "central interrupt-routing service" spec.md §9 calls for
//! to break the Holly/PVR/TA/SH-4 reference cycle: devices only ever see
//! a `raise`/`clear` surface, never a reference back into whatever owns
//! the SH-4's interrupt pins. The emulator wires the far side (setting the
//! SH-4's IRL) by polling `irl_lines()` once per `dc_tick`, which is the
//! weak-reference role spec.md describes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IstKind {
    Nrm,
    Ext,
    Err,
}

/// Bits within `ISTNRM` this crate's devices raise (spec.md §4.8's list-
/// complete interrupts, plus render-done and VBLANK).
pub mod bits {
    pub const TA_LIST_OPAQUE: u32 = 1 << 7;
    pub const TA_LIST_OPAQUE_MODVOL: u32 = 1 << 8;
    pub const TA_LIST_TRANSLUCENT: u32 = 1 << 9;
    pub const TA_LIST_TRANSLUCENT_MODVOL: u32 = 1 << 10;
    pub const TA_LIST_PUNCH_THROUGH: u32 = 1 << 21;
    pub const TA_YUV_DONE: u32 = 1 << 4;
    pub const RENDER_DONE_ISP: u32 = 1 << 2;
    pub const RENDER_DONE_VIDEO: u32 = 1 << 3;
    pub const RENDER_DONE_TSP: u32 = 1 << 13;
    pub const PCVOINT: u32 = 1 << 3; // vblank-in, mirrors ISTNRM bit the scanout raises
    pub const GDROM_CMD_COMPLETE: u32 = 1 << 14;
    pub const MAPLE_DMA_COMPLETE: u32 = 1 << 12;
}

pub fn list_complete_bit(list_type: u32) -> u32 {
    use bits::*;
    match list_type {
        0 => TA_LIST_OPAQUE,
        1 => TA_LIST_OPAQUE_MODVOL,
        2 => TA_LIST_TRANSLUCENT,
        3 => TA_LIST_TRANSLUCENT_MODVOL,
        4 => TA_LIST_PUNCH_THROUGH,
        _ => 0,
    }
}

/// IRL line indices (spec.md §4.10: "SH-4 IRL lines 9, 11, 13").
pub const IRL_LEVELS: [u8; 3] = [9, 11, 13];

#[derive(Default)]
pub struct Holly {
    ist_nrm: u32,
    ist_ext: u32,
    ist_err: u32,
    iml2: [u32; 3],
    iml4: [u32; 3],
    iml6: [u32; 3],
    irl: [bool; 3],
}

impl Holly {
    pub fn new() -> Self {
        Self::default()
    }

    fn ist_mut(&mut self, kind: IstKind) -> &mut u32 {
        match kind {
            IstKind::Nrm => &mut self.ist_nrm,
            IstKind::Ext => &mut self.ist_ext,
            IstKind::Err => &mut self.ist_err,
        }
    }

    pub fn ist(&self, kind: IstKind) -> u32 {
        match kind {
            IstKind::Nrm => self.ist_nrm,
            IstKind::Ext => self.ist_ext,
            IstKind::Err => self.ist_err,
        }
    }

    /// Device-level raise (spec.md §4.10: "raise/unraise operations set/
    /// clear single bits").
    pub fn raise(&mut self, kind: IstKind, bit: u32) {
        *self.ist_mut(kind) |= bit;
        self.recompute();
    }

    pub fn clear(&mut self, kind: IstKind, bit: u32) {
        *self.ist_mut(kind) &= !bit;
        self.recompute();
    }

    /// Guest write to an `ISTxxx` register: writing a 1 clears that bit.
    pub fn write_ist(&mut self, kind: IstKind, value: u32) {
        *self.ist_mut(kind) &= !value;
        self.recompute();
    }

    pub fn write_iml(&mut self, level_index: usize, kind: IstKind, value: u32) {
        let table = match level_index {
            0 => &mut self.iml2,
            1 => &mut self.iml4,
            _ => &mut self.iml6,
        };
        table[kind as usize] = value;
        self.recompute();
    }

    fn recompute(&mut self) {
        for (i, table) in [&self.iml2, &self.iml4, &self.iml6].into_iter().enumerate() {
            let masked = (self.ist_nrm & table[IstKind::Nrm as usize]) | (self.ist_ext & table[IstKind::Ext as usize]) | (self.ist_err & table[IstKind::Err as usize]);
            self.irl[i] = masked != 0;
        }
    }

    /// `(irl9, irl11, irl13)` — what the emulator polls into the SH-4's
    /// interrupt controller each `dc_tick`.
    pub fn irl_lines(&self) -> [bool; 3] {
        self.irl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_raised_bit_masked_by_iml4_asserts_only_irl11() {
        let mut holly = Holly::new();
        holly.write_iml(1, IstKind::Nrm, bits::TA_LIST_OPAQUE);
        holly.raise(IstKind::Nrm, bits::TA_LIST_OPAQUE);
        assert_eq!(holly.irl_lines(), [false, true, false]);
    }

    #[test]
    fn writing_ist_clears_only_the_written_bits() {
        let mut holly = Holly::new();
        holly.write_iml(0, IstKind::Nrm, bits::TA_LIST_OPAQUE | bits::TA_YUV_DONE);
        holly.raise(IstKind::Nrm, bits::TA_LIST_OPAQUE | bits::TA_YUV_DONE);
        holly.write_ist(IstKind::Nrm, bits::TA_LIST_OPAQUE);
        assert_eq!(holly.ist(IstKind::Nrm), bits::TA_YUV_DONE);
        assert_eq!(holly.irl_lines(), [true, false, false]);
    }

    #[test]
    fn ext_and_err_registers_route_independently_of_nrm() {
        let mut holly = Holly::new();
        holly.write_iml(2, IstKind::Err, 0xFF);
        holly.raise(IstKind::Err, 0x1);
        assert_eq!(holly.irl_lines(), [false, false, true]);
        holly.clear(IstKind::Err, 0x1);
        assert_eq!(holly.irl_lines(), [false, false, false]);
    }
}
