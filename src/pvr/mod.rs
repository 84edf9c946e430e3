//! PowerVR2 (PVR) subsystem: the Tile Accelerator's FIFOs and render-start
//! protocol (spec.md §4.8), the Tile Renderer's translation pass (spec.md
//! §4.9), and the texture cache shared between them.

pub mod ta;
pub mod texture_cache;
pub mod tr;

pub use ta::Ta;
pub use texture_cache::TextureCache;
