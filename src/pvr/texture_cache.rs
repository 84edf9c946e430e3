//! TSP/TCW-keyed texture cache with write-watch-driven dirty tracking
//! (spec.md §3 "Texture cache entry", §4.8 "Texture registration").
//! Grounded on `original_source/src/hw/pvr/ta.c`'s `ta_register_texture`
//! (address/size derivation, palette-selector addressing) and its
//! `texture_watch`/`palette_watch` invalidation pair.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::memory::AddressSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tsp(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tcw(pub u32);

impl Tsp {
    pub fn texture_u_size(self) -> u32 {
        (self.0 >> 3) & 0x7
    }
    pub fn texture_v_size(self) -> u32 {
        self.0 & 0x7
    }
}

impl Tcw {
    pub fn pixel_format(self) -> PixelFormat {
        PixelFormat::from_bits((self.0 >> 27) & 0x7)
    }
    pub fn texture_addr(self) -> u32 {
        (self.0 & 0x001F_FFFF) << 3
    }
    pub fn palette_selector(self) -> u32 {
        (self.0 >> 21) & 0x3F
    }
}

pub type TextureKey = u64;

pub fn texture_key(tsp: Tsp, tcw: Tcw) -> TextureKey {
    ((tsp.0 as u64) << 32) | tcw.0 as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba5551,
    Rgb565,
    Rgba4444,
    Paletted4,
    Paletted8,
    Reserved,
}

impl PixelFormat {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => PixelFormat::Rgba5551,
            1 => PixelFormat::Rgb565,
            2 => PixelFormat::Rgba4444,
            5 => PixelFormat::Paletted4,
            6 => PixelFormat::Paletted8,
            _ => PixelFormat::Reserved,
        }
    }
    fn element_size_bits(self) -> u32 {
        match self {
            PixelFormat::Paletted8 => 8,
            PixelFormat::Paletted4 => 4,
            _ => 16,
        }
    }
}

pub struct TextureEntry {
    pub key: TextureKey,
    pub tsp: Tsp,
    pub tcw: Tcw,
    pub texture_addr: u32,
    pub texture_size: u32,
    pub palette_addr: Option<u32>,
    pub palette_size: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub dirty: bool,
    pub host_handle: Option<u32>,
    pub frame: u64,
}

/// A free-running cache: entries persist across frames (`frame` marks last
/// use), invalidated only by write-watches or an explicit `invalidate`.
pub struct TextureCache {
    entries: HashMap<TextureKey, TextureEntry>,
    dirty_pending: Arc<Mutex<HashSet<TextureKey>>>,
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureCache {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), dirty_pending: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// Registers (or touches) the cache entry for `(tsp, tcw)`, installing
    /// write-watches over the texture and palette VRAM ranges on first
    /// registration (spec.md §4.8).
    pub fn register(&mut self, mem: &mut AddressSpace, tsp: Tsp, tcw: Tcw, frame: u64) -> TextureKey {
        let key = texture_key(tsp, tcw);
        if self.entries.contains_key(&key) {
            self.entries.get_mut(&key).unwrap().frame = frame;
            return key;
        }

        let format = tcw.pixel_format();
        let width = 8 << tsp.texture_u_size();
        let height = 8 << tsp.texture_v_size();
        let texture_addr = tcw.texture_addr();
        let texture_size = (width * height * format.element_size_bits()) >> 3;

        let (palette_addr, palette_size) = match format {
            PixelFormat::Paletted4 => (Some((tcw.palette_selector() << 4) * 4), 16 * 4),
            PixelFormat::Paletted8 => (Some(((tcw.palette_selector() & 0x30) << 4) * 4), 256 * 4),
            _ => (None, 0),
        };

        let entry = TextureEntry {
            key,
            tsp,
            tcw,
            texture_addr,
            texture_size,
            palette_addr,
            palette_size,
            width,
            height,
            format,
            dirty: true,
            host_handle: None,
            frame,
        };

        let pending = Arc::clone(&self.dirty_pending);
        mem.watch(texture_addr, texture_size.max(1), move || {
            pending.lock().unwrap().insert(key);
        });
        if let Some(pa) = palette_addr {
            let pending2 = Arc::clone(&self.dirty_pending);
            mem.watch(pa, palette_size.max(1), move || {
                pending2.lock().unwrap().insert(key);
            });
        }

        self.entries.insert(key, entry);
        key
    }

    /// Drains write-watch callbacks fired since the last sync, marking the
    /// matching entries dirty (spec.md §5: "Write-watch callbacks are
    /// invoked on the core thread").
    pub fn sync_dirty(&mut self) {
        let mut pending = self.dirty_pending.lock().unwrap();
        for key in pending.drain() {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.dirty = true;
            }
        }
    }

    pub fn get(&self, key: TextureKey) -> Option<&TextureEntry> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: TextureKey) -> Option<&mut TextureEntry> {
        self.entries.get_mut(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_the_same_key_twice_touches_rather_than_duplicates() {
        let mut cache = TextureCache::new();
        let mut mem = AddressSpace::default();
        let tsp = Tsp(0);
        let tcw = Tcw(0); // RGBA5551, addr 0
        cache.register(&mut mem, tsp, tcw, 1);
        cache.register(&mut mem, tsp, tcw, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(texture_key(tsp, tcw)).unwrap().frame, 2);
    }

    #[test]
    fn a_guest_write_to_the_texture_range_marks_the_entry_dirty() {
        let mut cache = TextureCache::new();
        let mut mem = AddressSpace::default();
        mem.map_ram(crate::memory::RamRegion::new(0, 0x10000, 0));
        let tsp = Tsp(0);
        let tcw = Tcw(0);
        let key = cache.register(&mut mem, tsp, tcw, 1);
        cache.get_mut(key).unwrap().dirty = false;

        mem.write8(0, 0xAB);
        cache.sync_dirty();
        assert!(cache.get(key).unwrap().dirty);
    }

    #[test]
    fn paletted_formats_compute_nonzero_palette_ranges() {
        let mut cache = TextureCache::new();
        let mut mem = AddressSpace::default();
        let tcw_4bpp = Tcw(5 << 27);
        let key = cache.register(&mut mem, Tsp(0), tcw_4bpp, 0);
        let entry = cache.get(key).unwrap();
        assert_eq!(entry.format, PixelFormat::Paletted4);
        assert_eq!(entry.palette_size, 64);
    }
}
