// gallium/renderer/src/context.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pipe contexts.
//!
//! A context is created for one backend and keeps it for its whole life. State setters are
//! shared: they validate their arguments, record the new state, and dirty the matching bits.
//! Everything that touches the device goes to the backend.

use crate::cso::{BlendState, ClearFlags, ClearValue, DepthStencilState, DrawInfo};
use crate::cso::{FramebufferState, IndexBufferBinding, PipeState, RasterizerState};
use crate::cso::{SamplerState, VertexBufferBinding, VertexElement, Viewport};
use crate::cso::{MAX_SAMPLERS, MAX_VERTEX_BUFFERS, MAX_VERTEX_ELEMENTS};
use crate::dirty::DirtyState;
use crate::hw::{HwContext, HwStats};
use crate::rasterizer::RasterStats;
use crate::shader::{CompileKey, Shader, ShaderCompiler, ShaderStage};
use crate::soft::SoftContext;
use gallium_geometry::rect::RectI;
use gallium_geometry::vector::Vector2I;
use gallium_gpu::resource::{Buffer, SamplerView, Surface, Texture};
use gallium_gpu::screen::Screen;
use gallium_gpu::{PipeError, PipeResult, SurfaceFormat, Winsys};
use std::sync::Arc;

/// The most `[f32; 4]` constants a stage can have bound.
pub const MAX_CONSTANTS: usize = 256;

bitflags! {
    pub struct FlushFlags: u32 {
        /// Return a fence for the submitted work.
        const FENCE = 0x1;
        /// Wait for the submitted work to complete.
        const WAIT  = 0x2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    R600,
    Evergreen,
    Svga,
    Software,
}

/// A copy of a rectangle between two texture images of the same format.
pub struct CopyRegion<W> where W: Winsys {
    pub dst: Arc<Texture<W>>,
    pub dst_level: u32,
    pub dst_layer: u32,
    pub dst_origin: Vector2I,
    pub src: Arc<Texture<W>>,
    pub src_level: u32,
    pub src_layer: u32,
    pub src_rect: RectI,
}

impl<W> CopyRegion<W> where W: Winsys {
    /// The destination rectangle.
    #[inline]
    pub fn dst_rect(&self) -> RectI {
        RectI::new(self.dst_origin, self.src_rect.size())
    }

    pub fn validate(&self) -> PipeResult<()> {
        if self.src.desc().format.bytes_per_pixel() != self.dst.desc().format.bytes_per_pixel() {
            return Err(PipeError::bad_input(format!("copy between {:?} and {:?}",
                                                    self.src.desc().format,
                                                    self.dst.desc().format)));
        }
        self.src.check_level_layer(self.src_level, self.src_layer)?;
        self.dst.check_level_layer(self.dst_level, self.dst_layer)?;
        self.src.check_rect(self.src_level, self.src_rect)?;
        self.dst.check_rect(self.dst_level, self.dst_rect())?;
        if Arc::ptr_eq(&self.src, &self.dst) && self.src_level == self.dst_level &&
                self.src_layer == self.dst_layer && self.src_rect.intersects(self.dst_rect()) {
            return Err(PipeError::bad_input("overlapping copy within one image"));
        }
        Ok(())
    }
}

/// What every backend keeps: the screen, the compiler, the bound state and the dirty mask.
pub struct ContextCommon<W> where W: Winsys {
    pub screen: Arc<Screen<W>>,
    pub compiler: Arc<dyn ShaderCompiler>,
    pub state: PipeState<W>,
    pub dirty: DirtyState,
}

impl<W> ContextCommon<W> where W: Winsys {
    pub fn new(screen: Arc<Screen<W>>, compiler: Arc<dyn ShaderCompiler>) -> ContextCommon<W> {
        ContextCommon { screen, compiler, state: PipeState::default(), dirty: DirtyState::all() }
    }

    pub fn set_blend_state(&mut self, blend: BlendState) {
        self.state.blend = blend;
        self.dirty |= DirtyState::BLEND;
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        self.state.blend_color = color;
        self.dirty |= DirtyState::BLEND_COLOR;
    }

    pub fn set_depth_stencil_state(&mut self, depth_stencil: DepthStencilState) {
        self.state.depth_stencil = depth_stencil;
        self.dirty |= DirtyState::DEPTH_STENCIL;
    }

    pub fn set_stencil_ref(&mut self, stencil_ref: [u8; 2]) {
        self.state.stencil_ref = stencil_ref;
        self.dirty |= DirtyState::STENCIL_REF;
    }

    pub fn set_rasterizer_state(&mut self, rasterizer: RasterizerState) {
        self.state.rasterizer = rasterizer;
        self.dirty |= DirtyState::RASTERIZER;
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> PipeResult<()> {
        let finite = viewport.scale.iter().chain(viewport.translate.iter()).all(|v| v.is_finite());
        if !finite {
            return Err(PipeError::bad_input(format!("non-finite viewport {:?}", viewport)));
        }
        self.state.viewport = viewport;
        self.dirty |= DirtyState::VIEWPORT;
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: RectI) {
        self.state.scissor = scissor;
        self.dirty |= DirtyState::SCISSOR;
    }

    pub fn set_framebuffer_state(&mut self, framebuffer: FramebufferState<W>) {
        self.state.framebuffer = framebuffer;
        self.dirty |= DirtyState::FRAMEBUFFER;
    }

    pub fn bind_shader(&mut self, stage: ShaderStage, shader: Option<Arc<Shader>>)
                       -> PipeResult<()> {
        if let Some(ref shader) = shader {
            if shader.stage() != stage {
                return Err(PipeError::bad_input(format!("{:?} shader bound as {:?}",
                                                        shader.stage(),
                                                        stage)));
            }
        }
        match stage {
            ShaderStage::Vertex => {
                self.state.vs = shader;
                self.dirty |= DirtyState::VS;
            }
            ShaderStage::Fragment => {
                self.state.fs = shader;
                self.dirty |= DirtyState::FS;
            }
        }
        Ok(())
    }

    pub fn set_constants(&mut self, stage: ShaderStage, constants: Vec<[f32; 4]>)
                         -> PipeResult<()> {
        if constants.len() > MAX_CONSTANTS {
            return Err(PipeError::bad_input(format!("{} constants", constants.len())));
        }
        match stage {
            ShaderStage::Vertex => {
                self.state.vs_constants = constants;
                self.dirty |= DirtyState::VS_CONSTANTS;
            }
            ShaderStage::Fragment => {
                self.state.fs_constants = constants;
                self.dirty |= DirtyState::FS_CONSTANTS;
            }
        }
        Ok(())
    }

    pub fn set_samplers(&mut self, samplers: &[SamplerState]) -> PipeResult<()> {
        if samplers.len() > MAX_SAMPLERS {
            return Err(PipeError::bad_input(format!("{} samplers", samplers.len())));
        }
        self.state.samplers = samplers.iter().cloned().collect();
        self.dirty |= DirtyState::SAMPLERS;
        Ok(())
    }

    pub fn set_sampler_views(&mut self, views: &[Option<Arc<SamplerView<W>>>])
                             -> PipeResult<()> {
        if views.len() > MAX_SAMPLERS {
            return Err(PipeError::bad_input(format!("{} sampler views", views.len())));
        }
        self.state.sampler_views = views.iter().cloned().collect();
        self.dirty |= DirtyState::SAMPLER_VIEWS;
        Ok(())
    }

    pub fn set_vertex_elements(&mut self, elements: &[VertexElement]) -> PipeResult<()> {
        if elements.len() > MAX_VERTEX_ELEMENTS {
            return Err(PipeError::bad_input(format!("{} vertex elements", elements.len())));
        }
        if let Some(element) = elements.iter().find(|element| {
            element.buffer_index as usize >= MAX_VERTEX_BUFFERS
        }) {
            return Err(PipeError::bad_input(format!("vertex element reads buffer {}",
                                                    element.buffer_index)));
        }
        self.state.vertex_elements = elements.iter().cloned().collect();
        self.dirty |= DirtyState::VERTEX_ELEMENTS;
        Ok(())
    }

    pub fn set_vertex_buffers(&mut self, buffers: &[Option<VertexBufferBinding<W>>])
                              -> PipeResult<()> {
        if buffers.len() > MAX_VERTEX_BUFFERS {
            return Err(PipeError::bad_input(format!("{} vertex buffers", buffers.len())));
        }
        self.state.vertex_buffers = buffers.iter().cloned().collect();
        self.dirty |= DirtyState::VERTEX_BUFFERS;
        Ok(())
    }

    pub fn set_index_buffer(&mut self, binding: Option<IndexBufferBinding<W>>)
                            -> PipeResult<()> {
        if let Some(ref binding) = binding {
            if binding.index_size != 2 && binding.index_size != 4 {
                return Err(PipeError::bad_input(format!("{}-byte indices",
                                                        binding.index_size)));
            }
        }
        self.state.index_buffer = binding;
        self.dirty |= DirtyState::INDEX_BUFFER;
        Ok(())
    }

    /// The code-generation key for `stage` under the bound state.
    pub fn compile_key(&self, stage: ShaderStage, cpu: bool) -> CompileKey {
        let rasterizer = &self.state.rasterizer;
        let mut key = CompileKey { cpu, ..CompileKey::default() };
        if stage == ShaderStage::Fragment {
            key.light_twoside = rasterizer.light_twoside;
            key.flat_shade = rasterizer.flat_shade;
            key.sprite_coord_enable = rasterizer.sprite_coord_enable;
        }
        for (unit, sampler) in self.state.samplers.iter().enumerate() {
            if !sampler.normalized_coords {
                key.unnormalized_coords |= 1 << unit;
            }
            if sampler.compare_enabled {
                key.shadow_compare |= 1 << unit;
            }
        }
        key
    }

    /// True if a bound sampler view reads a level that is also bound for rendering.
    pub fn has_feedback_loop(&self) -> bool {
        let framebuffer = &self.state.framebuffer;
        self.state.sampler_views.iter().flatten().any(|view| {
            framebuffer.surfaces().any(|surface| {
                Arc::ptr_eq(surface.texture(), view.texture()) &&
                    surface.level() >= view.first_level() &&
                    surface.level() <= view.last_level()
            })
        })
    }

    /// Checks a draw against the bound state. Returns false for draws with nothing to do.
    pub fn validate_draw(&self, draw: &DrawInfo) -> PipeResult<bool> {
        if self.state.vs.is_none() || self.state.fs.is_none() {
            return Err(PipeError::bad_input("draw without both shaders bound"));
        }
        if draw.indexed && self.state.index_buffer.is_none() {
            return Err(PipeError::bad_input("indexed draw without an index buffer"));
        }
        if self.has_feedback_loop() {
            if self.screen.options().check_feedback_loops {
                warn!("draw samples from a level it renders to; dropping it");
                return Err(PipeError::bad_input("texture bound for sampling and rendering"));
            }
            debug!("draw samples from a level it renders to");
        }
        Ok(draw.count > 0 && self.state.framebuffer.width > 0)
    }

    /// Records that the last draw or clear wrote the bound render targets.
    pub fn mark_render_targets_dirty(&mut self, flags: ClearFlags) {
        let framebuffer = &self.state.framebuffer;
        if flags.contains(ClearFlags::COLOR) {
            for surface in framebuffer.cbufs.iter().flatten() {
                surface.mark_dirty();
            }
        }
        if flags.intersects(ClearFlags::DEPTH_STENCIL) {
            if let Some(ref zsbuf) = framebuffer.zsbuf {
                zsbuf.mark_dirty();
            }
        }
        self.invalidate_sampler_views();
    }

    /// Makes the next draw revalidate the bound sampler views against their textures.
    #[inline]
    pub fn invalidate_sampler_views(&mut self) {
        if self.state.sampler_views.iter().any(Option::is_some) {
            self.dirty |= DirtyState::SAMPLER_VIEWS;
        }
    }
}

/// Checks the arguments of a render-target surface request.
pub fn validate_surface_request<W>(texture: &Texture<W>,
                                   level: u32,
                                   layer: u32,
                                   format: SurfaceFormat)
                                   -> PipeResult<()>
                                   where W: Winsys {
    texture.check_level_layer(level, layer)?;
    let native = texture.desc().format;
    if native.bytes_per_pixel() != format.bytes_per_pixel() ||
            native.is_depth_stencil() != format.is_depth_stencil() {
        return Err(PipeError::bad_input(format!("{:?} surface of a {:?} texture",
                                                format,
                                                native)));
    }
    Ok(())
}

pub fn validate_level_range<W>(texture: &Texture<W>, first_level: u32, last_level: u32)
                               -> PipeResult<()>
                               where W: Winsys {
    if first_level > last_level || last_level >= texture.desc().num_levels {
        return Err(PipeError::bad_input(format!("levels {}..={} of a {}-level texture",
                                                first_level,
                                                last_level,
                                                texture.desc().num_levels)));
    }
    Ok(())
}

/// Checks a clear rectangle against the surface it applies to.
pub fn validate_clear_rect<W>(surface: &Surface<W>, rect: RectI) -> PipeResult<()>
                              where W: Winsys {
    if rect.is_empty() || rect.min_x() < 0 || rect.min_y() < 0 ||
            rect.max_x() > surface.width() as i32 || rect.max_y() > surface.height() as i32 {
        return Err(PipeError::bad_input(format!("clear of {:?} outside a {}x{} surface",
                                                rect,
                                                surface.width(),
                                                surface.height())));
    }
    Ok(())
}

/// A pipe context, bound to one backend at creation.
pub enum Context<W> where W: Winsys {
    Hardware(HwContext<W>),
    Software(SoftContext<W>),
}

impl<W> Context<W> where W: Winsys {
    pub fn new(screen: &Arc<Screen<W>>, compiler: Arc<dyn ShaderCompiler>, kind: BackendKind)
               -> PipeResult<Context<W>> {
        match kind {
            BackendKind::Software => {
                Ok(Context::Software(SoftContext::new(screen.clone(), compiler)?))
            }
            _ => Ok(Context::Hardware(HwContext::new(screen.clone(), compiler, kind)?)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match *self {
            Context::Hardware(ref context) => context.kind(),
            Context::Software(_) => BackendKind::Software,
        }
    }

    #[inline]
    pub fn common(&self) -> &ContextCommon<W> {
        match *self {
            Context::Hardware(ref context) => context.common(),
            Context::Software(ref context) => context.common(),
        }
    }

    #[inline]
    pub fn common_mut(&mut self) -> &mut ContextCommon<W> {
        match *self {
            Context::Hardware(ref mut context) => context.common_mut(),
            Context::Software(ref mut context) => context.common_mut(),
        }
    }

    #[inline]
    pub fn screen(&self) -> &Arc<Screen<W>> {
        &self.common().screen
    }

    pub fn set_blend_state(&mut self, blend: BlendState) {
        self.common_mut().set_blend_state(blend)
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        self.common_mut().set_blend_color(color)
    }

    pub fn set_depth_stencil_state(&mut self, depth_stencil: DepthStencilState) {
        self.common_mut().set_depth_stencil_state(depth_stencil)
    }

    pub fn set_stencil_ref(&mut self, stencil_ref: [u8; 2]) {
        self.common_mut().set_stencil_ref(stencil_ref)
    }

    pub fn set_rasterizer_state(&mut self, rasterizer: RasterizerState) {
        self.common_mut().set_rasterizer_state(rasterizer)
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> PipeResult<()> {
        self.common_mut().set_viewport(viewport)
    }

    pub fn set_scissor(&mut self, scissor: RectI) {
        self.common_mut().set_scissor(scissor)
    }

    pub fn bind_vs(&mut self, shader: Option<Arc<Shader>>) -> PipeResult<()> {
        self.common_mut().bind_shader(ShaderStage::Vertex, shader)
    }

    pub fn bind_fs(&mut self, shader: Option<Arc<Shader>>) -> PipeResult<()> {
        self.common_mut().bind_shader(ShaderStage::Fragment, shader)
    }

    pub fn set_constants(&mut self, stage: ShaderStage, constants: Vec<[f32; 4]>)
                         -> PipeResult<()> {
        self.common_mut().set_constants(stage, constants)
    }

    pub fn set_samplers(&mut self, samplers: &[SamplerState]) -> PipeResult<()> {
        self.common_mut().set_samplers(samplers)
    }

    pub fn set_sampler_views(&mut self, views: &[Option<Arc<SamplerView<W>>>])
                             -> PipeResult<()> {
        self.common_mut().set_sampler_views(views)
    }

    pub fn set_vertex_elements(&mut self, elements: &[VertexElement]) -> PipeResult<()> {
        self.common_mut().set_vertex_elements(elements)
    }

    pub fn set_vertex_buffers(&mut self, buffers: &[Option<VertexBufferBinding<W>>])
                              -> PipeResult<()> {
        self.common_mut().set_vertex_buffers(buffers)
    }

    pub fn set_index_buffer(&mut self, binding: Option<IndexBufferBinding<W>>)
                            -> PipeResult<()> {
        self.common_mut().set_index_buffer(binding)
    }

    /// Binds render targets. Unbound views with rendering in them are copied back first.
    pub fn set_framebuffer_state(&mut self, framebuffer: FramebufferState<W>) -> PipeResult<()> {
        match *self {
            Context::Hardware(ref mut context) => context.set_framebuffer_state(framebuffer),
            Context::Software(ref mut context) => context.set_framebuffer_state(framebuffer),
        }
    }

    pub fn draw(&mut self, draw: &DrawInfo) -> PipeResult<()> {
        match *self {
            Context::Hardware(ref mut context) => context.draw(draw),
            Context::Software(ref mut context) => context.draw(draw),
        }
    }

    /// Clears whole bound buffers.
    pub fn clear(&mut self, flags: ClearFlags, value: &ClearValue) -> PipeResult<()> {
        match *self {
            Context::Hardware(ref mut context) => context.clear(flags, value),
            Context::Software(ref mut context) => context.clear(flags, value),
        }
    }

    pub fn clear_render_target(&mut self,
                               surface: &Arc<Surface<W>>,
                               rect: RectI,
                               color: [f32; 4])
                               -> PipeResult<()> {
        if surface.format().is_depth_stencil() {
            return Err(PipeError::bad_input("color clear of a depth surface"));
        }
        validate_clear_rect(surface, rect)?;
        let value = ClearValue { color, ..ClearValue::default() };
        match *self {
            Context::Hardware(ref mut context) => {
                context.clear_surface(surface, ClearFlags::COLOR, &value, rect)
            }
            Context::Software(ref mut context) => {
                context.clear_surface(surface, ClearFlags::COLOR, &value, rect)
            }
        }
    }

    pub fn clear_depth_stencil(&mut self,
                               surface: &Arc<Surface<W>>,
                               flags: ClearFlags,
                               depth: f32,
                               stencil: u8,
                               rect: RectI)
                               -> PipeResult<()> {
        if !surface.format().is_depth_stencil() {
            return Err(PipeError::bad_input("depth clear of a color surface"));
        }
        let flags = flags & ClearFlags::DEPTH_STENCIL;
        if flags.is_empty() {
            return Err(PipeError::bad_input("depth-stencil clear of neither depth nor stencil"));
        }
        validate_clear_rect(surface, rect)?;
        let value = ClearValue { depth, stencil, ..ClearValue::default() };
        match *self {
            Context::Hardware(ref mut context) => {
                context.clear_surface(surface, flags, &value, rect)
            }
            Context::Software(ref mut context) => {
                context.clear_surface(surface, flags, &value, rect)
            }
        }
    }

    /// Writes buffer contents in command order: work already recorded sees the old contents.
    pub fn buffer_write(&mut self, buffer: &Arc<Buffer<W>>, offset: usize, data: &[u8])
                        -> PipeResult<()> {
        match *self {
            Context::Hardware(ref mut context) => context.buffer_write(buffer, offset, data),
            Context::Software(ref mut context) => context.buffer_write(buffer, offset, data),
        }
    }

    /// Replaces a rectangle of one layer of a texture level with tightly packed texels.
    pub fn texture_write(&mut self,
                         texture: &Arc<Texture<W>>,
                         layer: u32,
                         level: u32,
                         rect: RectI,
                         data: &[u8])
                         -> PipeResult<()> {
        texture.check_level_layer(level, layer)?;
        texture.check_rect(level, rect)?;
        let expected = rect.area() as usize * texture.desc().format.bytes_per_pixel();
        if data.len() != expected {
            return Err(PipeError::bad_input(format!("{} bytes for a {:?} region",
                                                    data.len(),
                                                    rect)));
        }
        match *self {
            Context::Hardware(ref mut context) => {
                context.texture_write(texture, layer, level, rect, data)
            }
            Context::Software(ref mut context) => {
                context.texture_write(texture, layer, level, rect, data)
            }
        }
    }

    pub fn resource_copy_region(&mut self, region: &CopyRegion<W>) -> PipeResult<()> {
        region.validate()?;
        match *self {
            Context::Hardware(ref mut context) => context.resource_copy_region(region),
            Context::Software(ref mut context) => context.resource_copy_region(region),
        }
    }

    pub fn create_surface(&mut self,
                          texture: &Arc<Texture<W>>,
                          level: u32,
                          layer: u32,
                          format: SurfaceFormat)
                          -> PipeResult<Arc<Surface<W>>> {
        validate_surface_request(texture, level, layer, format)?;
        match *self {
            Context::Hardware(ref mut context) => {
                context.create_surface(texture, level, layer, format)
            }
            Context::Software(_) => {
                Ok(Arc::new(Surface::new(texture.clone(), level, layer, format, None)))
            }
        }
    }

    pub fn create_sampler_view(&mut self,
                               texture: &Arc<Texture<W>>,
                               first_level: u32,
                               last_level: u32)
                               -> PipeResult<Arc<SamplerView<W>>> {
        validate_level_range(texture, first_level, last_level)?;
        if let Some(view) = texture.cached_sampler_view(first_level, last_level) {
            return Ok(view);
        }
        let screen = self.screen();
        let host = if screen.sampler_needs_view(texture.desc(), first_level, last_level) {
            let key = texture.desc().sampler_view_key(first_level, last_level);
            Some(screen.acquire_host_surface(key)?)
        } else {
            None
        };
        debug!("sampler view of levels {}..={} of {:?}: {}",
               first_level,
               last_level,
               texture.id(),
               if host.is_some() { "view" } else { "alias" });
        let view = Arc::new(SamplerView::new(texture.clone(), first_level, last_level, host, 0));
        texture.set_cached_sampler_view(&view);
        Ok(view)
    }

    pub fn flush(&mut self, flags: FlushFlags) -> PipeResult<Option<W::Fence>> {
        match *self {
            Context::Hardware(ref mut context) => context.flush(flags),
            Context::Software(ref mut context) => context.flush().map(|_| None),
        }
    }

    /// Flushes and waits for everything submitted so far.
    pub fn finish(&mut self) -> PipeResult<()> {
        self.flush(FlushFlags::WAIT).map(|_| ())
    }

    /// Reads back one layer of a texture level. Software contexts only.
    pub fn read_pixels(&mut self, texture: &Arc<Texture<W>>, layer: u32, level: u32)
                       -> PipeResult<Vec<u8>> {
        match *self {
            Context::Hardware(_) => Err(PipeError::bad_input("read-back needs a software context")),
            Context::Software(ref mut context) => context.read_pixels(texture, layer, level),
        }
    }

    pub fn hw_stats(&self) -> Option<&HwStats> {
        match *self {
            Context::Hardware(ref context) => Some(context.stats()),
            Context::Software(_) => None,
        }
    }

    pub fn raster_stats(&self) -> Option<&RasterStats> {
        match *self {
            Context::Hardware(_) => None,
            Context::Software(ref context) => Some(context.stats()),
        }
    }
}
