//! Render backend, the consumed external interface TR draws through
//! (spec.md §6): texture registration, frame brackets, and batched
//! surface draws. No concrete backend ships in this crate; `cli.rs`
//! wires in whatever windowing/graphics crate the host platform uses.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Invalid,
    Rgba5551,
    Rgb565,
    Rgba4444,
    Rgba8888,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFunc {
    None,
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    DstColor,
    OneMinusDstColor,
}

pub type TextureHandle = u32;

#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub filter_linear: bool,
    pub wrap_u_clamp: bool,
    pub wrap_v_clamp: bool,
    pub mipmaps: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Vertex {
    pub position: [f32; 3],
    pub base_color: [f32; 4],
    pub offset_color: [f32; 4],
    pub uv: [f32; 2],
}

#[derive(Debug, Clone, Copy)]
pub struct Surface {
    pub texture: Option<TextureHandle>,
    pub depth_write: bool,
    pub depth_test_ge: bool,
    pub cull_backface: bool,
    pub src_blend: BlendFunc,
    pub dst_blend: BlendFunc,
    pub flat_shade: bool,
    pub ignore_tex_alpha: bool,
    pub vertex_start: u32,
    pub vertex_count: u32,
}

/// A consumed interface: this crate draws through it, never implements it
/// (spec.md §6's render backend is supplied by the host binary).
pub trait RenderBackend {
    fn register_texture(&mut self, descriptor: TextureDescriptor, bytes: &[u8]) -> TextureHandle;
    fn free_texture(&mut self, handle: TextureHandle);
    fn begin_frame(&mut self);
    fn end_frame(&mut self);
    /// Draws `vertices[surface_order[i]]`'s surface for every `i`, so
    /// opaque lists can submit `0..surfaces.len()` while autosorted lists
    /// submit the Z-sorted permutation TR computed separately (spec.md §4.9).
    fn draw_batch(&mut self, projection: &[f32; 16], vertices: &[Vertex], surfaces: &[Surface], surface_order: &[u32]);
}
