// gallium/renderer/src/hw/mod.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Contexts that drive a GPU through command buffers.
//!
//! State setters only record and dirty; everything reaches the command buffer lazily, when a
//! draw runs the emitter table. Every command that can run out of room follows the same
//! pattern: attempt, flush on `OutOfMemory`, attempt exactly once more, then give up.

mod emit;
pub mod family;

use crate::command::{CommandBuffer, Relocation};
use crate::context::{BackendKind, ContextCommon, CopyRegion, FlushFlags};
use crate::cso::{ClearFlags, ClearValue, DrawInfo, FramebufferState, PolygonMode};
use crate::cso::{MAX_COLOR_BUFFERS, MAX_VERTEX_ELEMENTS};
use crate::dirty::{DirtyState, PassReport, StateContext, StateEngine};
use crate::hw::family::{HwFamily, Packet, EVERGREEN, PACKET_COUNT, R600, SVGA};
use crate::shader::{ShaderCompiler, ShaderVariant};
use crate::upload::{self, UploadStats, UploadTracker};
use crate::vertex::VertexPipeline;
use byteorder::{ByteOrder, LittleEndian};
use gallium_geometry::rect::RectI;
use gallium_geometry::vector::{vec2i, Vector2I};
use gallium_gpu::resource::{Buffer, SamplerView, Surface, Texture};
use gallium_gpu::screen::Screen;
use gallium_gpu::{BindFlags, BufferUsage, PipeError, PipeResult, SurfaceFormat, TextureTarget};
use gallium_gpu::Winsys;
use smallvec::SmallVec;
use std::sync::Arc;

const TOPOLOGY_LINE_LIST: u32 = 2;

/// `[topology, start, count, index bias, index buffer, index offset, index size]`.
const DRAW_PAYLOAD_DWORDS: usize = 7;
/// `[src, src level/layer, dst, dst level/layer, src x, src y, dst x, dst y, width, height]`.
const COPY_PAYLOAD_DWORDS: usize = 10;
const CLEAR_PAYLOAD_DWORDS: usize = 12;
const TEXTURE_UPLOAD_PAYLOAD_DWORDS: usize = 7;

/// What the hardware is known to have bound in the current command buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct HwShadow {
    vs: Option<u64>,
    fs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct HwStats {
    pub draws: u64,
    /// Draws that failed even after a flush and retry.
    pub dropped_draws: u64,
    pub swtnl_draws: u64,
    pub flushes: u64,
    pub submissions: u64,
    pub state_passes: u64,
    /// Render-target views copied back into their textures.
    pub propagations: u64,
    /// Levels copied from textures into view surfaces.
    pub view_copies: u64,
    packets: [u64; PACKET_COUNT],
}

impl HwStats {
    #[inline]
    pub fn packets(&self, packet: Packet) -> u64 {
        self.packets[packet as usize]
    }
}

/// One layer of one level of a host surface.
#[derive(Clone, Copy, Debug)]
struct CopyTarget {
    handle: u32,
    level: u32,
    layer: u32,
}

impl CopyTarget {
    #[inline]
    fn subresource(&self) -> u32 {
        self.level << 16 | self.layer
    }
}

/// Vertices transformed on the CPU, ready to draw as a list.
struct SwtnlVertices<W> where W: Winsys {
    buffer: Arc<Buffer<W>>,
    topology: u32,
    count: u32,
    attributes: u32,
}

/// Everything the emitters see.
pub struct HwState<W> where W: Winsys {
    common: ContextCommon<W>,
    family: &'static HwFamily,
    cs: CommandBuffer<W>,
    uploads: UploadTracker<W>,
    shadow: HwShadow,
    need_swvfetch: bool,
    need_pipeline: bool,
    need_swtnl: bool,
    vs_variant: Option<Arc<ShaderVariant>>,
    fs_variant: Option<Arc<ShaderVariant>>,
    // The CPU vertex program when vertices are transformed in software.
    swtnl_vs: Option<Arc<ShaderVariant>>,
    passthrough_vs: Option<Arc<ShaderVariant>>,
    // `[handle, offset, stride]` per vertex buffer slot, for families that declare vertex
    // arrays in the draw packet.
    vertex_arrays: SmallVec<[[u32; 3]; MAX_VERTEX_ELEMENTS]>,
    // Texture upload sources, kept alive until the commands reading them are submitted.
    staging: Vec<W::Buffer>,
    last_fence: Option<W::Fence>,
    stats: HwStats,
}

pub struct HwContext<W> where W: Winsys {
    kind: BackendKind,
    engine: StateEngine<HwState<W>>,
    hw: HwState<W>,
}

impl<W> HwContext<W> where W: Winsys {
    pub fn new(screen: Arc<Screen<W>>, compiler: Arc<dyn ShaderCompiler>, kind: BackendKind)
               -> PipeResult<HwContext<W>> {
        let family: &'static HwFamily = match kind {
            BackendKind::R600 => &R600,
            BackendKind::Evergreen => &EVERGREEN,
            BackendKind::Svga => &SVGA,
            BackendKind::Software => {
                return Err(PipeError::Fatal("software backend requested from a GPU context"))
            }
        };
        if screen.is_software() {
            return Err(PipeError::Fatal("GPU context on a software screen"));
        }

        let limits = screen.winsys().limits();
        let cs = CommandBuffer::new(family.format, &limits)?;
        info!("creating {} context: {} command dwords, {} gtt bytes, {} vram bytes",
              family.name,
              limits.max_cmd_dwords,
              limits.gtt_bytes,
              limits.vram_bytes);

        Ok(HwContext {
            kind,
            engine: emit::build_engine(family),
            hw: HwState {
                common: ContextCommon::new(screen, compiler),
                family,
                cs,
                uploads: UploadTracker::new(),
                shadow: HwShadow::default(),
                need_swvfetch: false,
                need_pipeline: false,
                need_swtnl: false,
                vs_variant: None,
                fs_variant: None,
                swtnl_vs: None,
                passthrough_vs: None,
                vertex_arrays: SmallVec::new(),
                staging: vec![],
                last_fence: None,
                stats: HwStats::default(),
            },
        })
    }

    #[inline]
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    #[inline]
    pub fn family(&self) -> &'static HwFamily {
        self.hw.family
    }

    #[inline]
    pub fn common(&self) -> &ContextCommon<W> {
        &self.hw.common
    }

    #[inline]
    pub fn common_mut(&mut self) -> &mut ContextCommon<W> {
        &mut self.hw.common
    }

    #[inline]
    pub fn stats(&self) -> &HwStats {
        &self.hw.stats
    }

    #[inline]
    pub fn upload_stats(&self) -> UploadStats {
        self.hw.uploads.stats()
    }

    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer<W> {
        &self.hw.cs
    }

    #[inline]
    pub fn command_buffer_mut(&mut self) -> &mut CommandBuffer<W> {
        &mut self.hw.cs
    }

    #[inline]
    pub fn dirty(&self) -> DirtyState {
        self.hw.common.dirty
    }

    #[inline]
    pub fn set_dirty(&mut self, dirty: DirtyState) {
        self.hw.common.dirty = dirty
    }

    /// True while vertices are transformed on the CPU.
    #[inline]
    pub fn uses_swtnl(&self) -> bool {
        self.hw.need_swtnl
    }

    /// Runs the emitter table over the dirty state.
    pub fn run_state_pass(&mut self) -> PipeResult<PassReport> {
        let report = self.engine.run_pass(&mut self.hw)?;
        self.hw.stats.state_passes += 1;
        Ok(report)
    }

    /// Flushes up front if `dwords` more, plus whatever the dirty state will emit, cannot fit.
    /// Returns true if it flushed.
    pub fn need_space(&mut self, dwords: usize, include_draw: bool) -> PipeResult<bool> {
        let mut needed = dwords + self.engine.pending_dwords(self.hw.common.dirty) as usize;
        if include_draw {
            needed += self.hw.family.draw_dwords as usize + self.hw.pending_upload_dwords();
        }
        let cs = &self.hw.cs;
        if cs.used() + needed <= cs.capacity() {
            return Ok(false);
        }
        if cs.is_empty() && self.hw.uploads.open_count() == 0 {
            return Ok(false);
        }
        debug!("{} dwords needed with {} of {} used; flushing first",
               needed,
               cs.used(),
               cs.capacity());
        self.hw.flush(FlushFlags::empty())?;
        Ok(true)
    }

    fn with_retry<T, F>(&mut self, needs_state: bool, mut attempt: F) -> PipeResult<T>
                        where F: FnMut(&mut HwState<W>) -> PipeResult<T> {
        match attempt(&mut self.hw) {
            Err(PipeError::OutOfMemory) => {}
            result => return result,
        }
        debug!("out of command space; flushing and retrying once");
        self.hw.flush(FlushFlags::empty())?;
        if needs_state {
            self.run_state_pass()?;
        }
        attempt(&mut self.hw)
    }

    pub fn draw(&mut self, draw: &DrawInfo) -> PipeResult<()> {
        if !self.hw.common.validate_draw(draw)? {
            debug!("skipping empty draw {:?}", draw);
            return Ok(());
        }
        if let Err(error) = self.try_draw(draw) {
            self.hw.stats.dropped_draws += 1;
            warn!("dropping draw {:?}: {}", draw, error);
            return Err(error);
        }
        self.hw.stats.draws += 1;
        let written = self.hw.common.state.depth_stencil.written_buffers();
        self.hw.common.mark_render_targets_dirty(ClearFlags::COLOR | written);
        Ok(())
    }

    fn try_draw(&mut self, draw: &DrawInfo) -> PipeResult<()> {
        self.need_space(0, true)?;
        self.run_state_pass()?;
        if !self.hw.need_swtnl {
            return self.with_retry(true, |hw| hw.emit_draw(draw));
        }

        self.hw.stats.swtnl_draws += 1;
        match self.hw.transform_swtnl(draw)? {
            Some(vertices) => self.with_retry(true, |hw| hw.emit_swtnl_draw(&vertices)),
            None => {
                debug!("software vertex path produced no primitives");
                Ok(())
            }
        }
    }

    /// Clears whole bound buffers.
    pub fn clear(&mut self, flags: ClearFlags, value: &ClearValue) -> PipeResult<()> {
        let framebuffer = self.hw.common.state.framebuffer.clone();
        if flags.contains(ClearFlags::COLOR) {
            for surface in framebuffer.cbufs.iter().flatten() {
                self.clear_surface(surface, ClearFlags::COLOR, value, full_rect(surface))?;
            }
        }
        let depth_stencil = flags & ClearFlags::DEPTH_STENCIL;
        if let (false, Some(zsbuf)) = (depth_stencil.is_empty(), framebuffer.zsbuf.as_ref()) {
            self.clear_surface(zsbuf, depth_stencil, value, full_rect(zsbuf))?;
        }
        Ok(())
    }

    pub fn clear_surface(&mut self,
                         surface: &Arc<Surface<W>>,
                         flags: ClearFlags,
                         value: &ClearValue,
                         rect: RectI)
                         -> PipeResult<()> {
        let dwords = self.hw.family.packet_dwords(Packet::Clear, CLEAR_PAYLOAD_DWORDS);
        self.need_space(dwords, false)?;
        self.with_retry(false, |hw| hw.emit_clear(surface, flags, value, rect))?;
        surface.mark_dirty();
        self.hw.common.invalidate_sampler_views();
        Ok(())
    }

    /// Flushes first if pending commands read `buffer`, so that they see the old contents.
    pub fn buffer_write(&mut self, buffer: &Arc<Buffer<W>>, offset: usize, data: &[u8])
                        -> PipeResult<()> {
        let upload_open = buffer.lock().upload_open;
        if upload_open || self.hw.cs.references(buffer.id()) {
            debug!("buffer {:?} is read by pending commands; flushing before the write",
                   buffer.id());
            self.hw.flush(FlushFlags::empty())?;
        }
        buffer.write(offset, data)
    }

    pub fn texture_write(&mut self,
                         texture: &Arc<Texture<W>>,
                         layer: u32,
                         level: u32,
                         rect: RectI,
                         data: &[u8])
                         -> PipeResult<()> {
        self.with_retry(false, |hw| hw.propagate_views_of(texture))?;
        let dwords = self.hw.family.packet_dwords(Packet::TextureUpload,
                                                  TEXTURE_UPLOAD_PAYLOAD_DWORDS);
        self.need_space(dwords, false)?;
        self.with_retry(false, |hw| hw.emit_texture_upload(texture, layer, level, rect, data))?;
        texture.lock().note_write(texture.desc(), layer, level);
        self.hw.common.invalidate_sampler_views();
        Ok(())
    }

    pub fn resource_copy_region(&mut self, region: &CopyRegion<W>) -> PipeResult<()> {
        self.with_retry(false, |hw| hw.propagate_views_of(&region.src))?;
        let dwords = self.hw.family.packet_dwords(Packet::SurfaceCopy, COPY_PAYLOAD_DWORDS);
        self.need_space(dwords, false)?;
        self.with_retry(false, |hw| {
            let src = CopyTarget {
                handle: hw.texture_handle(&region.src)?,
                level: region.src_level,
                layer: region.src_layer,
            };
            let dst = CopyTarget {
                handle: hw.texture_handle(&region.dst)?,
                level: region.dst_level,
                layer: region.dst_layer,
            };
            hw.write_copy(src, dst, region.src_rect, region.dst_origin)
        })?;
        region.dst.lock().note_write(region.dst.desc(), region.dst_layer, region.dst_level);
        self.hw.common.invalidate_sampler_views();
        Ok(())
    }

    /// Creates a render target, as a separate view surface when the hardware needs one.
    pub fn create_surface(&mut self,
                          texture: &Arc<Texture<W>>,
                          level: u32,
                          layer: u32,
                          format: SurfaceFormat)
                          -> PipeResult<Arc<Surface<W>>> {
        let screen = texture.screen();
        let desc = texture.desc();
        let view = if screen.surface_needs_view(desc, level, format) {
            Some(screen.acquire_host_surface(desc.view_key(level, format))?)
        } else {
            None
        };
        let surface = Arc::new(Surface::new(texture.clone(), level, layer, format, view));
        if !surface.is_view() {
            return Ok(surface);
        }

        debug!("render target view of level {} layer {} of texture {:?}",
               level,
               layer,
               texture.id());
        let face = if desc.target == TextureTarget::Cube { layer } else { 0 };
        let defined = texture.lock().is_defined(desc, face, level);
        if defined {
            self.with_retry(false, |hw| {
                let src = CopyTarget { handle: hw.texture_handle(texture)?, level, layer };
                let dst = CopyTarget { handle: hw.surface_handle(&surface)?, level: 0, layer: 0 };
                hw.write_copy(src, dst, full_rect(&surface), Vector2I::zero())
            })?;
            self.hw.stats.view_copies += 1;
        }
        Ok(surface)
    }

    /// Binds render targets, copying views that are being unbound back into their textures.
    pub fn set_framebuffer_state(&mut self, framebuffer: FramebufferState<W>) -> PipeResult<()> {
        let unbound: SmallVec<[Arc<Surface<W>>; MAX_COLOR_BUFFERS + 1]> =
            self.hw.common.state.framebuffer.surfaces().filter(|surface| {
                surface.needs_propagation() &&
                    !framebuffer.surfaces().any(|bound| Arc::ptr_eq(bound, surface))
            }).cloned().collect();
        for surface in &unbound {
            self.with_retry(false, |hw| hw.propagate(surface))?;
        }
        self.hw.common.set_framebuffer_state(framebuffer);
        Ok(())
    }

    pub fn flush(&mut self, flags: FlushFlags) -> PipeResult<Option<W::Fence>> {
        self.hw.flush(flags)
    }
}

impl<W> HwState<W> where W: Winsys {
    /// Writes one packet and counts it.
    fn write(&mut self, packet: Packet, payload: &[u32]) -> PipeResult<usize> {
        let offset = self.family.write(&mut self.cs, packet, payload)?;
        self.stats.packets[packet as usize] += 1;
        Ok(offset)
    }

    fn resolve_buffer(&mut self, buffer: &Arc<Buffer<W>>) -> PipeResult<u32> {
        let opcode = self.family.opcode(Packet::Upload);
        self.uploads.resolve(&mut self.cs, opcode, buffer)
    }

    fn surface_handle(&mut self, surface: &Arc<Surface<W>>) -> PipeResult<u32> {
        self.cs.add_relocation(Relocation::Surface(surface.clone()))?;
        surface.host_handle().ok_or(PipeError::Fatal("render target without host storage"))
    }

    fn texture_handle(&mut self, texture: &Arc<Texture<W>>) -> PipeResult<u32> {
        self.cs.add_relocation(Relocation::Texture(texture.clone()))?;
        texture.host_handle().ok_or(PipeError::Fatal("texture without host storage"))
    }

    /// Dwords the uploads of the bound vertex and index buffers may add.
    fn pending_upload_dwords(&self) -> usize {
        let state = &self.common.state;
        let buffers = state.vertex_buffers
                           .iter()
                           .flatten()
                           .map(|binding| &binding.buffer)
                           .chain(state.index_buffer.iter().map(|binding| &binding.buffer));
        buffers.map(|buffer| {
            let state = buffer.lock();
            if state.dirty.is_empty() || state.upload_open {
                0
            } else {
                UploadTracker::upload_dwords(&self.cs, state.dirty.max_ranges())
            }
        }).sum()
    }

    fn write_copy(&mut self,
                  src: CopyTarget,
                  dst: CopyTarget,
                  src_rect: RectI,
                  dst_origin: Vector2I)
                  -> PipeResult<()> {
        let payload = [
            src.handle,
            src.subresource(),
            dst.handle,
            dst.subresource(),
            src_rect.min_x() as u32,
            src_rect.min_y() as u32,
            dst_origin.x() as u32,
            dst_origin.y() as u32,
            src_rect.width() as u32,
            src_rect.height() as u32,
        ];
        self.write(Packet::SurfaceCopy, &payload).map(|_| ())
    }

    /// Copies a rendered view back into its texture.
    fn propagate(&mut self, surface: &Arc<Surface<W>>) -> PipeResult<()> {
        if !surface.needs_propagation() {
            return Ok(());
        }
        let src = CopyTarget { handle: self.surface_handle(surface)?, level: 0, layer: 0 };
        let dst = CopyTarget {
            handle: self.texture_handle(surface.texture())?,
            level: surface.level(),
            layer: surface.layer(),
        };
        self.write_copy(src, dst, full_rect(surface), Vector2I::zero())?;
        surface.note_propagated();
        self.stats.propagations += 1;
        debug!("propagated view {:?} into texture {:?}", surface.id(), surface.texture().id());
        Ok(())
    }

    /// Propagates every bound render-target view of `texture`.
    fn propagate_views_of(&mut self, texture: &Arc<Texture<W>>) -> PipeResult<()> {
        let views: SmallVec<[Arc<Surface<W>>; MAX_COLOR_BUFFERS + 1]> =
            self.common.state.framebuffer.surfaces().filter(|surface| {
                Arc::ptr_eq(surface.texture(), texture) && surface.needs_propagation()
            }).cloned().collect();
        for surface in &views {
            self.propagate(surface)?;
        }
        Ok(())
    }

    /// Brings a sampler view up to date: pending render-target views of its texture are
    /// propagated first, then levels written since the view was last validated are copied
    /// into it.
    fn validate_sampler_view(&mut self, view: &Arc<SamplerView<W>>) -> PipeResult<()> {
        let texture = view.texture().clone();
        self.propagate_views_of(&texture)?;
        let stale = view.stale_levels();
        if stale.is_empty() {
            return Ok(());
        }

        let view_handle = view.host_handle()
                              .ok_or(PipeError::Fatal("sampler view without storage"))?;
        self.cs.add_relocation(Relocation::SamplerView(view.clone()))?;
        let texture_handle = self.texture_handle(&texture)?;
        let desc = *texture.desc();
        for &level in &stale {
            let (width, height, _) = desc.level_size(level);
            let rect = RectI::new(Vector2I::zero(), vec2i(width as i32, height as i32));
            for layer in 0..desc.num_layers(level) {
                let src = CopyTarget { handle: texture_handle, level, layer };
                let dst = CopyTarget {
                    handle: view_handle,
                    level: level - view.first_level(),
                    layer,
                };
                self.write_copy(src, dst, rect, Vector2I::zero())?;
            }
            self.stats.view_copies += 1;
        }
        let age = texture.lock().age;
        view.set_age(age);
        debug!("sampler view {:?}: refreshed levels {:?}", view.id(), stale);
        Ok(())
    }

    pub fn flush(&mut self, flags: FlushFlags) -> PipeResult<Option<W::Fence>> {
        let screen = self.common.screen.clone();
        let wait = flags.contains(FlushFlags::WAIT) || screen.options().sync;
        self.uploads.close_all(&mut self.cs);

        let mut submitted = Ok(None);
        if !self.cs.is_empty() {
            let want_fence = wait || flags.contains(FlushFlags::FENCE);
            debug!("{}: submitting {} dwords in {} packets",
                   self.family.name,
                   self.cs.used(),
                   self.cs.packet_count());
            submitted = screen.winsys().cs_flush(&self.cs.serialize(), want_fence);
            self.stats.submissions += 1;
        }

        // A new command buffer knows nothing about what the hardware has bound.
        self.cs.reset();
        self.staging.clear();
        self.common.dirty = DirtyState::all();
        self.shadow = HwShadow::default();
        self.stats.flushes += 1;
        screen.purge_surface_cache();

        let fence = submitted?;
        if let Some(ref fence) = fence {
            self.last_fence = Some(fence.clone());
        }
        if wait {
            if let Some(ref fence) = self.last_fence {
                if !screen.winsys().fence_finish(fence, None) {
                    warn!("{}: timed out waiting for {:?}", self.family.name, fence);
                }
            }
        }
        Ok(fence)
    }

    fn emit_draw(&mut self, draw: &DrawInfo) -> PipeResult<()> {
        let mut payload: SmallVec<[u32; 96]> = SmallVec::new();
        payload.extend_from_slice(&[emit::topology_code(draw.mode),
                                    draw.start,
                                    draw.count,
                                    draw.index_bias as u32]);
        match self.common.state.index_buffer.clone() {
            Some(ref binding) if draw.indexed => {
                let handle = self.resolve_buffer(&binding.buffer)?;
                payload.extend_from_slice(&[handle, binding.offset, binding.index_size]);
            }
            _ => payload.extend_from_slice(&[0, 0, 0]),
        }

        if self.family.inline_vertex_arrays {
            for element in &self.common.state.vertex_elements {
                let array = self.vertex_arrays
                                .get(element.buffer_index as usize)
                                .cloned()
                                .unwrap_or([0; 3]);
                payload.extend_from_slice(&[array[0],
                                            array[1] + element.src_offset,
                                            array[2],
                                            emit::vertex_format_code(element.format)]);
            }
        }
        self.write(Packet::Draw, &payload).map(|_| ())
    }

    /// Runs the vertex stage on the CPU and stores the results in a scratch buffer.
    fn transform_swtnl(&mut self, draw: &DrawInfo) -> PipeResult<Option<SwtnlVertices<W>>> {
        let variant = match self.swtnl_vs {
            Some(ref variant) => variant.clone(),
            None => return Err(PipeError::Fatal("software vertex path without a vertex program")),
        };
        let program = match variant.cpu_program() {
            Some(program) => program.clone(),
            None => return Err(PipeError::Fatal("software vertex path without a CPU program")),
        };

        let state = &self.common.state;
        let rasterizer = state.rasterizer;
        let pipeline = VertexPipeline {
            program: &*program,
            constants: &state.vs_constants,
            viewport: state.viewport,
            flatshade_first: rasterizer.flatshade_first,
        };
        let batch = pipeline.run(state, draw)?;
        if batch.triangles.is_empty() {
            return Ok(None);
        }

        let attributes = 1 + batch.vertices[0].varyings.len();
        if attributes > MAX_VERTEX_ELEMENTS {
            return Err(PipeError::bad_input(format!("{} vertex outputs", attributes)));
        }
        let (topology, corners): (u32, &[usize]) = match rasterizer.fill {
            PolygonMode::Fill => (emit::TOPOLOGY_TRIANGLE_LIST, &[0, 1, 2]),
            PolygonMode::Line => (TOPOLOGY_LINE_LIST, &[0, 1, 1, 2, 2, 0]),
        };

        let mut floats = Vec::with_capacity(batch.triangles.len() * corners.len() * attributes * 4);
        for triangle in &batch.triangles {
            let provoking = &batch.vertices[triangle.provoking as usize];
            for &corner in corners {
                let vertex = &batch.vertices[triangle.vertices[corner] as usize];
                floats.extend_from_slice(&vertex.position);
                let varyings = if rasterizer.flat_shade { provoking } else { vertex };
                for varying in &varyings.varyings {
                    floats.extend_from_slice(varying);
                }
            }
        }

        let mut bytes = vec![0; floats.len() * 4];
        LittleEndian::write_f32_into(&floats, &mut bytes);
        let buffer = self.common
                         .screen
                         .create_buffer(bytes.len(), BindFlags::VERTEX_BUFFER)
                         .map_err(upload::oom)?;
        buffer.write(0, &bytes)?;
        debug!("software vertex path: {} triangles, {} dropped",
               batch.triangles.len(),
               batch.dropped);
        Ok(Some(SwtnlVertices {
            buffer,
            topology,
            count: (batch.triangles.len() * corners.len()) as u32,
            attributes: attributes as u32,
        }))
    }

    fn emit_swtnl_draw(&mut self, vertices: &SwtnlVertices<W>) -> PipeResult<()> {
        let handle = self.resolve_buffer(&vertices.buffer)?;
        let stride = vertices.attributes * 16;
        let float4 = emit::vertex_format_code(crate::cso::VertexFormat::Float32x4);
        let mut payload: SmallVec<[u32; 96]> = SmallVec::new();
        payload.extend_from_slice(&[vertices.topology, 0, vertices.count, 0, 0, 0, 0]);

        if self.family.inline_vertex_arrays {
            for attribute in 0..vertices.attributes {
                payload.extend_from_slice(&[handle, attribute * 16, stride, float4]);
            }
            return self.write(Packet::Draw, &payload).map(|_| ());
        }

        let mut elements: SmallVec<[u32; 64]> = SmallVec::new();
        elements.push(vertices.attributes);
        for attribute in 0..vertices.attributes {
            elements.extend_from_slice(&[attribute * 16, 0, float4]);
        }
        self.write(Packet::VertexElements, &elements)?;
        self.write(Packet::VertexBuffers, &[1, handle, 0, stride])?;
        self.write(Packet::Draw, &payload).map(|_| ())
    }

    fn emit_clear(&mut self,
                  surface: &Arc<Surface<W>>,
                  flags: ClearFlags,
                  value: &ClearValue,
                  rect: RectI)
                  -> PipeResult<()> {
        let handle = self.surface_handle(surface)?;
        let color = value.color;
        let payload = [
            handle,
            flags.bits(),
            color[0].to_bits(),
            color[1].to_bits(),
            color[2].to_bits(),
            color[3].to_bits(),
            value.depth.to_bits(),
            value.stencil as u32,
            rect.min_x() as u32,
            rect.min_y() as u32,
            rect.width() as u32,
            rect.height() as u32,
        ];
        debug_assert_eq!(payload.len(), CLEAR_PAYLOAD_DWORDS);
        self.write(Packet::Clear, &payload).map(|_| ())
    }

    fn emit_texture_upload(&mut self,
                           texture: &Arc<Texture<W>>,
                           layer: u32,
                           level: u32,
                           rect: RectI,
                           data: &[u8])
                           -> PipeResult<()> {
        let screen = self.common.screen.clone();
        let winsys = screen.winsys();
        let staging = winsys.buffer_create(data.len(), BufferUsage::Staging).map_err(upload::oom)?;
        {
            let mut mapping = winsys.buffer_map(&staging)?;
            mapping[..data.len()].copy_from_slice(data);
            winsys.buffer_unmap(mapping);
        }

        let handle = self.texture_handle(texture)?;
        let payload = [
            handle,
            winsys.buffer_handle(&staging),
            level << 16 | layer,
            rect.min_x() as u32,
            rect.min_y() as u32,
            rect.width() as u32,
            rect.height() as u32,
        ];
        self.write(Packet::TextureUpload, &payload)?;
        self.staging.push(staging);
        Ok(())
    }

    /// The pass-through vertex shader for `num_outputs` CPU-transformed attributes.
    fn passthrough_vs(&mut self, num_outputs: usize) -> Arc<ShaderVariant> {
        if let Some(ref variant) = self.passthrough_vs {
            if variant.usage().num_instructions as usize == num_outputs {
                return variant.clone();
            }
        }
        let variant = Arc::new(ShaderVariant::passthrough_vs(num_outputs));
        self.passthrough_vs = Some(variant.clone());
        variant
    }
}

impl<W> StateContext for HwState<W> where W: Winsys {
    #[inline]
    fn dirty(&self) -> DirtyState {
        self.common.dirty
    }

    #[inline]
    fn set_dirty(&mut self, dirty: DirtyState) {
        self.common.dirty = dirty
    }

    fn flush_for_retry(&mut self) -> PipeResult<()> {
        self.flush(FlushFlags::empty()).map(|_| ())
    }
}

#[inline]
fn full_rect<W>(surface: &Surface<W>) -> RectI where W: Winsys {
    RectI::new(Vector2I::zero(), vec2i(surface.width() as i32, surface.height() as i32))
}

#[cfg(test)]
mod test {
    use super::HwContext;
    use crate::context::{BackendKind, FlushFlags};
    use crate::cso::{DrawInfo, FramebufferState, PrimitiveTopology, VertexBufferBinding};
    use crate::cso::{VertexElement, VertexFormat};
    use crate::dirty::DirtyState;
    use crate::hw::family::Packet;
    use crate::shader::test::TestCompiler;
    use crate::shader::{Shader, ShaderStage};
    use gallium_gpu::options::DebugOptions;
    use gallium_gpu::resource::TextureDesc;
    use gallium_gpu::screen::Screen;
    use gallium_gpu::{BindFlags, PipeError, SurfaceFormat, WinsysLimits};
    use gallium_nullws::NullWinsys;
    use std::sync::Arc;

    fn context(kind: BackendKind, limits: WinsysLimits) -> HwContext<NullWinsys> {
        let screen = Screen::new_hardware(NullWinsys::with_limits(limits), DebugOptions::default());
        HwContext::new(screen, Arc::new(TestCompiler::default()), kind).unwrap()
    }

    fn bind_triangle(context: &mut HwContext<NullWinsys>, format: VertexFormat) {
        let screen = context.common().screen.clone();
        let desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                       32,
                                       32,
                                       1,
                                       BindFlags::RENDER_TARGET);
        let texture = screen.create_texture(desc).unwrap();
        let surface = context.create_surface(&texture, 0, 0, SurfaceFormat::R8G8B8A8Unorm)
                             .unwrap();
        let framebuffer = FramebufferState::new(&[surface], None).unwrap();
        context.set_framebuffer_state(framebuffer).unwrap();

        let buffer = screen.create_buffer(96, BindFlags::VERTEX_BUFFER).unwrap();
        buffer.write(0, &[0; 96]).unwrap();
        let common = context.common_mut();
        common.set_vertex_elements(&[VertexElement { src_offset: 0, buffer_index: 0, format }])
              .unwrap();
        common.set_vertex_buffers(&[Some(VertexBufferBinding { buffer, stride: 8, offset: 0 })])
              .unwrap();
        let vs = Arc::new(Shader::new(ShaderStage::Vertex, vec![4, 2]));
        let fs = Arc::new(Shader::new(ShaderStage::Fragment, vec![4, 2]));
        common.bind_shader(ShaderStage::Vertex, Some(vs)).unwrap();
        common.bind_shader(ShaderStage::Fragment, Some(fs)).unwrap();
    }

    #[test]
    fn test_need_space_flushes_once_when_the_buffer_is_nearly_full() {
        let limits = WinsysLimits { max_cmd_dwords: 100, ..WinsysLimits::default() };
        let mut context = context(BackendKind::R600, limits);
        context.command_buffer_mut().reserve(96).unwrap();
        context.command_buffer_mut().commit();
        context.set_dirty(DirtyState::empty());

        assert!(context.need_space(10, false).unwrap());
        assert_eq!(context.stats().flushes, 1);
        assert_eq!(context.command_buffer().used(), 0);
        assert_eq!(context.dirty(), DirtyState::all());
        context.command_buffer_mut().reserve(10).unwrap();
        context.command_buffer_mut().commit();
        assert_eq!(context.command_buffer().used(), 10);
    }

    #[test]
    fn test_rebinding_the_bound_fragment_shader_emits_nothing() {
        let mut context = context(BackendKind::Evergreen, WinsysLimits::default());
        bind_triangle(&mut context, VertexFormat::Float32x2);
        let draw = DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3);
        context.draw(&draw).unwrap();
        assert_eq!(context.stats().packets(Packet::FragmentShader), 1);

        let fs = context.common().state.fs.clone();
        context.common_mut().bind_shader(ShaderStage::Fragment, fs).unwrap();
        context.draw(&draw).unwrap();
        assert_eq!(context.stats().packets(Packet::FragmentShader), 1);
        assert_eq!(context.stats().packets(Packet::Draw), 2);
    }

    #[test]
    fn test_flush_makes_the_next_pass_emit_everything_again() {
        let mut context = context(BackendKind::R600, WinsysLimits::default());
        bind_triangle(&mut context, VertexFormat::Float32x2);
        let draw = DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3);
        context.draw(&draw).unwrap();
        assert_eq!(context.run_state_pass().unwrap().emitted, 0);

        context.flush(FlushFlags::empty()).unwrap();
        assert_eq!(context.dirty(), DirtyState::all());
        context.draw(&draw).unwrap();
        for &packet in &[Packet::Framebuffer, Packet::Blend, Packet::VertexShader,
                         Packet::FragmentShader, Packet::VertexBuffers] {
            assert_eq!(context.stats().packets(packet), 2, "{:?}", packet);
        }
    }

    #[test]
    fn test_unsupported_fetch_format_goes_through_software_vertices() {
        let mut context = context(BackendKind::Svga, WinsysLimits::default());
        bind_triangle(&mut context, VertexFormat::Snorm16x2);
        context.draw(&DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3)).unwrap();
        assert!(context.uses_swtnl());
        assert_eq!(context.stats().swtnl_draws, 1);

        context.common_mut().set_vertex_elements(&[VertexElement {
            src_offset: 0,
            buffer_index: 0,
            format: VertexFormat::Float32x2,
        }]).unwrap();
        context.draw(&DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3)).unwrap();
        assert!(!context.uses_swtnl());
        assert_eq!(context.stats().swtnl_draws, 1);
    }

    #[test]
    fn test_draw_over_budget_is_dropped_and_the_context_survives() {
        let limits = WinsysLimits { gtt_bytes: 64, ..WinsysLimits::default() };
        let mut context = context(BackendKind::R600, limits);
        bind_triangle(&mut context, VertexFormat::Float32x2);
        let draw = DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3);
        assert_eq!(context.draw(&draw), Err(PipeError::OutOfMemory));
        assert_eq!(context.stats().dropped_draws, 1);

        let screen = context.common().screen.clone();
        let small = screen.create_buffer(48, BindFlags::VERTEX_BUFFER).unwrap();
        context.common_mut()
               .set_vertex_buffers(&[Some(VertexBufferBinding {
                   buffer: small,
                   stride: 8,
                   offset: 0,
               })])
               .unwrap();
        context.draw(&draw).unwrap();
        assert_eq!(context.stats().draws, 1);
    }
}
