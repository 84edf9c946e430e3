//! Supplementary devices beyond the CPU/PVR core: GD-ROM, Maple
//! controller ports, and AICA's register file and channel positions
//! (spec.md [SUPPLEMENT], grounded on `original_source/src/guest/gdrom/`,
//! `src/hw/maple/controller.c`, `src/hw/aica/aica.cc`).

pub mod aica;
pub mod gdrom;
pub mod maple;
