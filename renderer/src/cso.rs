// gallium/renderer/src/cso.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pipeline state objects and the per-context record of what is bound.

use crate::shader::Shader;
use gallium_geometry::rect::RectI;
use gallium_geometry::vector::vec2i;
use gallium_gpu::resource::{Buffer, SamplerView, Surface};
use gallium_gpu::{PipeError, PipeResult, Winsys};
use smallvec::SmallVec;
use std::sync::Arc;

pub const MAX_COLOR_BUFFERS: usize = 4;
pub const MAX_SAMPLERS: usize = 16;
pub const MAX_VERTEX_BUFFERS: usize = 16;
pub const MAX_VERTEX_ELEMENTS: usize = 16;

bitflags! {
    pub struct ClearFlags: u32 {
        const COLOR   = 0x1;
        const DEPTH   = 0x2;
        const STENCIL = 0x4;
        const DEPTH_STENCIL = Self::DEPTH.bits | Self::STENCIL.bits;
    }
}

bitflags! {
    pub struct ColorMask: u8 {
        const R = 0x1;
        const G = 0x2;
        const B = 0x4;
        const A = 0x8;
        const RGBA = 0xf;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunc {
    #[inline]
    pub fn test<T>(self, value: T, reference: T) -> bool where T: PartialOrd {
        match self {
            CompareFunc::Never => false,
            CompareFunc::Less => value < reference,
            CompareFunc::Equal => value == reference,
            CompareFunc::LessEqual => value <= reference,
            CompareFunc::Greater => value > reference,
            CompareFunc::NotEqual => value != reference,
            CompareFunc::GreaterEqual => value >= reference,
            CompareFunc::Always => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    Incr,
    Decr,
    IncrWrap,
    DecrWrap,
    Invert,
}

impl StencilOp {
    #[inline]
    pub fn apply(self, value: u8, reference: u8) -> u8 {
        match self {
            StencilOp::Keep => value,
            StencilOp::Zero => 0,
            StencilOp::Replace => reference,
            StencilOp::Incr => value.saturating_add(1),
            StencilOp::Decr => value.saturating_sub(1),
            StencilOp::IncrWrap => value.wrapping_add(1),
            StencilOp::DecrWrap => value.wrapping_sub(1),
            StencilOp::Invert => !value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StencilState {
    pub enabled: bool,
    pub func: CompareFunc,
    pub fail_op: StencilOp,
    pub zfail_op: StencilOp,
    pub zpass_op: StencilOp,
    pub value_mask: u8,
    pub write_mask: u8,
}

impl Default for StencilState {
    fn default() -> StencilState {
        StencilState {
            enabled: false,
            func: CompareFunc::Always,
            fail_op: StencilOp::Keep,
            zfail_op: StencilOp::Keep,
            zpass_op: StencilOp::Keep,
            value_mask: !0,
            write_mask: !0,
        }
    }
}

/// Depth and stencil testing. `stencil[1]` applies to back faces when enabled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilState {
    pub depth_enabled: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunc,
    pub stencil: [StencilState; 2],
}

impl Default for DepthStencilState {
    fn default() -> DepthStencilState {
        DepthStencilState {
            depth_enabled: false,
            depth_write: false,
            depth_func: CompareFunc::Less,
            stencil: [StencilState::default(); 2],
        }
    }
}

impl DepthStencilState {
    /// The depth-stencil buffers a draw under this state may write.
    pub fn written_buffers(&self) -> ClearFlags {
        let mut flags = ClearFlags::empty();
        if self.depth_enabled && self.depth_write {
            flags |= ClearFlags::DEPTH;
        }
        if self.stencil.iter().any(|stencil| stencil.enabled && stencil.write_mask != 0) {
            flags |= ClearFlags::STENCIL;
        }
        flags
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstColor,
    InvDstColor,
    DstAlpha,
    InvDstAlpha,
    ConstColor,
    InvConstColor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFunc {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlendState {
    pub enabled: bool,
    pub rgb_func: BlendFunc,
    pub rgb_src: BlendFactor,
    pub rgb_dst: BlendFactor,
    pub alpha_func: BlendFunc,
    pub alpha_src: BlendFactor,
    pub alpha_dst: BlendFactor,
    pub color_mask: ColorMask,
}

impl Default for BlendState {
    fn default() -> BlendState {
        BlendState {
            enabled: false,
            rgb_func: BlendFunc::Add,
            rgb_src: BlendFactor::One,
            rgb_dst: BlendFactor::Zero,
            alpha_func: BlendFunc::Add,
            alpha_src: BlendFactor::One,
            alpha_dst: BlendFactor::Zero,
            color_mask: ColorMask::RGBA,
        }
    }
}

impl BlendState {
    /// Source-over blending with non-premultiplied alpha.
    pub fn alpha_blend() -> BlendState {
        BlendState {
            enabled: true,
            rgb_src: BlendFactor::SrcAlpha,
            rgb_dst: BlendFactor::InvSrcAlpha,
            alpha_src: BlendFactor::One,
            alpha_dst: BlendFactor::InvSrcAlpha,
            ..BlendState::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullFace {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizerState {
    pub cull: CullFace,
    /// Counter-clockwise as seen on screen, with y pointing down, is the front face.
    pub front_ccw: bool,
    pub fill: PolygonMode,
    pub flat_shade: bool,
    /// The first vertex of a triangle provokes flat-shaded values instead of the last.
    pub flatshade_first: bool,
    pub light_twoside: bool,
    pub perspective_correct: bool,
    pub sprite_coord_enable: u8,
    pub scissor: bool,
}

impl Default for RasterizerState {
    fn default() -> RasterizerState {
        RasterizerState {
            cull: CullFace::None,
            front_ccw: true,
            fill: PolygonMode::Fill,
            flat_shade: false,
            flatshade_first: false,
            light_twoside: false,
            perspective_correct: true,
            sprite_coord_enable: 0,
            scissor: false,
        }
    }
}

/// Maps normalized device coordinates to window coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub scale: [f32; 3],
    pub translate: [f32; 3],
}

impl Viewport {
    /// Maps the unit cube onto `rect`, y pointing down, depth into `[0, 1]`.
    pub fn from_rect(rect: RectI) -> Viewport {
        let half_width = rect.width() as f32 * 0.5;
        let half_height = rect.height() as f32 * 0.5;
        Viewport {
            scale: [half_width, -half_height, 0.5],
            translate: [rect.min_x() as f32 + half_width, rect.min_y() as f32 + half_height, 0.5],
        }
    }

    #[inline]
    pub fn identity() -> Viewport {
        Viewport { scale: [1.0; 3], translate: [0.0; 3] }
    }

    #[inline]
    pub fn apply(&self, ndc: [f32; 3]) -> [f32; 3] {
        [
            ndc[0] * self.scale[0] + self.translate[0],
            ndc[1] * self.scale[1] + self.translate[1],
            ndc[2] * self.scale[2] + self.translate[2],
        ]
    }
}

impl Default for Viewport {
    fn default() -> Viewport {
        Viewport::identity()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TexFilter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerState {
    pub min_filter: TexFilter,
    pub mag_filter: TexFilter,
    pub normalized_coords: bool,
    pub compare_enabled: bool,
    pub compare_func: CompareFunc,
}

impl Default for SamplerState {
    fn default() -> SamplerState {
        SamplerState {
            min_filter: TexFilter::Linear,
            mag_filter: TexFilter::Linear,
            normalized_coords: true,
            compare_enabled: false,
            compare_func: CompareFunc::LessEqual,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32x1,
    Float32x2,
    Float32x3,
    Float32x4,
    Unorm8x4,
    Snorm16x2,
    Fixed32x2,
}

impl VertexFormat {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            VertexFormat::Float32x1 | VertexFormat::Unorm8x4 | VertexFormat::Snorm16x2 => 4,
            VertexFormat::Float32x2 | VertexFormat::Fixed32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub src_offset: u32,
    pub buffer_index: u32,
    pub format: VertexFormat,
}

pub struct VertexBufferBinding<W> where W: Winsys {
    pub buffer: Arc<Buffer<W>>,
    pub stride: u32,
    pub offset: u32,
}

impl<W> Clone for VertexBufferBinding<W> where W: Winsys {
    fn clone(&self) -> VertexBufferBinding<W> {
        VertexBufferBinding {
            buffer: self.buffer.clone(),
            stride: self.stride,
            offset: self.offset,
        }
    }
}

pub struct IndexBufferBinding<W> where W: Winsys {
    pub buffer: Arc<Buffer<W>>,
    /// 2 or 4.
    pub index_size: u32,
    pub offset: u32,
}

impl<W> Clone for IndexBufferBinding<W> where W: Winsys {
    fn clone(&self) -> IndexBufferBinding<W> {
        IndexBufferBinding {
            buffer: self.buffer.clone(),
            index_size: self.index_size,
            offset: self.offset,
        }
    }
}

pub struct FramebufferState<W> where W: Winsys {
    pub width: u32,
    pub height: u32,
    pub cbufs: SmallVec<[Option<Arc<Surface<W>>>; MAX_COLOR_BUFFERS]>,
    pub zsbuf: Option<Arc<Surface<W>>>,
}

impl<W> Clone for FramebufferState<W> where W: Winsys {
    fn clone(&self) -> FramebufferState<W> {
        FramebufferState {
            width: self.width,
            height: self.height,
            cbufs: self.cbufs.clone(),
            zsbuf: self.zsbuf.clone(),
        }
    }
}

impl<W> Default for FramebufferState<W> where W: Winsys {
    fn default() -> FramebufferState<W> {
        FramebufferState { width: 0, height: 0, cbufs: SmallVec::new(), zsbuf: None }
    }
}

impl<W> FramebufferState<W> where W: Winsys {
    pub fn new(cbufs: &[Arc<Surface<W>>], zsbuf: Option<Arc<Surface<W>>>)
               -> PipeResult<FramebufferState<W>> {
        let first = cbufs.first().or(zsbuf.as_ref());
        let (width, height) = match first {
            None => (0, 0),
            Some(surface) => (surface.width(), surface.height()),
        };
        if cbufs.len() > MAX_COLOR_BUFFERS {
            return Err(PipeError::bad_input(format!("{} color buffers", cbufs.len())));
        }
        for surface in cbufs.iter().chain(zsbuf.iter()) {
            if surface.width() != width || surface.height() != height {
                return Err(PipeError::bad_input("framebuffer attachments differ in size"));
            }
        }
        if cbufs.iter().any(|surface| surface.format().is_depth_stencil()) {
            return Err(PipeError::bad_input("depth format bound as a color buffer"));
        }
        if let Some(ref zsbuf) = zsbuf {
            if !zsbuf.format().is_depth_stencil() {
                return Err(PipeError::bad_input("color format bound as depth buffer"));
            }
        }
        Ok(FramebufferState {
            width,
            height,
            cbufs: cbufs.iter().cloned().map(Some).collect(),
            zsbuf,
        })
    }

    #[inline]
    pub fn bounds(&self) -> RectI {
        RectI::new(vec2i(0, 0), vec2i(self.width as i32, self.height as i32))
    }

    pub fn surfaces(&self) -> impl Iterator<Item = &Arc<Surface<W>>> {
        self.cbufs.iter().flatten().chain(self.zsbuf.iter())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawInfo {
    pub mode: PrimitiveTopology,
    pub start: u32,
    pub count: u32,
    pub indexed: bool,
    pub index_bias: i32,
}

impl DrawInfo {
    #[inline]
    pub fn arrays(mode: PrimitiveTopology, start: u32, count: u32) -> DrawInfo {
        DrawInfo { mode, start, count, indexed: false, index_bias: 0 }
    }

    #[inline]
    pub fn elements(mode: PrimitiveTopology, start: u32, count: u32) -> DrawInfo {
        DrawInfo { mode, start, count, indexed: true, index_bias: 0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValue {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u8,
}

impl Default for ClearValue {
    fn default() -> ClearValue {
        ClearValue { color: [0.0; 4], depth: 1.0, stencil: 0 }
    }
}

/// Everything bound to a context.
pub struct PipeState<W> where W: Winsys {
    pub blend: BlendState,
    pub blend_color: [f32; 4],
    pub depth_stencil: DepthStencilState,
    pub stencil_ref: [u8; 2],
    pub rasterizer: RasterizerState,
    pub viewport: Viewport,
    pub scissor: RectI,
    pub framebuffer: FramebufferState<W>,
    pub vs: Option<Arc<Shader>>,
    pub fs: Option<Arc<Shader>>,
    pub vs_constants: Vec<[f32; 4]>,
    pub fs_constants: Vec<[f32; 4]>,
    pub samplers: SmallVec<[SamplerState; MAX_SAMPLERS]>,
    pub sampler_views: SmallVec<[Option<Arc<SamplerView<W>>>; MAX_SAMPLERS]>,
    pub vertex_elements: SmallVec<[VertexElement; MAX_VERTEX_ELEMENTS]>,
    pub vertex_buffers: SmallVec<[Option<VertexBufferBinding<W>>; MAX_VERTEX_BUFFERS]>,
    pub index_buffer: Option<IndexBufferBinding<W>>,
}

impl<W> Default for PipeState<W> where W: Winsys {
    fn default() -> PipeState<W> {
        PipeState {
            blend: BlendState::default(),
            blend_color: [0.0; 4],
            depth_stencil: DepthStencilState::default(),
            stencil_ref: [0; 2],
            rasterizer: RasterizerState::default(),
            viewport: Viewport::default(),
            scissor: RectI::default(),
            framebuffer: FramebufferState::default(),
            vs: None,
            fs: None,
            vs_constants: vec![],
            fs_constants: vec![],
            samplers: SmallVec::new(),
            sampler_views: SmallVec::new(),
            vertex_elements: SmallVec::new(),
            vertex_buffers: SmallVec::new(),
            index_buffer: None,
        }
    }
}

impl<W> PipeState<W> where W: Winsys {
    /// The pixels draws may touch: the framebuffer, narrowed by the scissor when enabled.
    pub fn clip_rect(&self) -> RectI {
        let bounds = self.framebuffer.bounds();
        if !self.rasterizer.scissor {
            return bounds;
        }
        bounds.intersection(self.scissor).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::{CompareFunc, StencilOp, Viewport};
    use gallium_geometry::rect::RectI;
    use gallium_geometry::vector::vec2i;

    #[test]
    fn test_viewport_maps_corners() {
        let viewport = Viewport::from_rect(RectI::new(vec2i(0, 0), vec2i(100, 50)));
        assert_eq!(viewport.apply([-1.0, 1.0, -1.0]), [0.0, 0.0, 0.0]);
        assert_eq!(viewport.apply([1.0, -1.0, 1.0]), [100.0, 50.0, 1.0]);
    }

    #[test]
    fn test_stencil_ops_saturate_or_wrap() {
        assert_eq!(StencilOp::Incr.apply(255, 0), 255);
        assert_eq!(StencilOp::IncrWrap.apply(255, 0), 0);
        assert_eq!(StencilOp::Decr.apply(0, 0), 0);
        assert_eq!(StencilOp::DecrWrap.apply(0, 0), 255);
        assert_eq!(StencilOp::Replace.apply(3, 9), 9);
        assert_eq!(StencilOp::Invert.apply(0x0f, 0), 0xf0);
    }

    #[test]
    fn test_compare_funcs() {
        assert!(CompareFunc::Less.test(0.25, 0.5));
        assert!(!CompareFunc::Less.test(0.5, 0.5));
        assert!(CompareFunc::LessEqual.test(0.5, 0.5));
        assert!(CompareFunc::NotEqual.test(1, 2));
        assert!(!CompareFunc::Never.test(1, 1));
    }
}
