// gallium/renderer/src/soft.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Contexts that render on the CPU.
//!
//! Draws are transformed and set up immediately and binned into the scene of the bound
//! framebuffer. Nothing touches texture memory until the scene is flushed: on `flush()`, on a
//! framebuffer change, or before anything reads or writes a texture the scene renders to.

use crate::concurrent::executor::{Executor, SequentialExecutor};
use crate::concurrent::rayon::RayonExecutor;
use crate::context::{ContextCommon, CopyRegion};
use crate::cso::{ClearFlags, ClearValue, DrawInfo, FramebufferState};
use crate::rasterizer::{self, RasterStats};
use crate::scene::{DrawState, Scene};
use crate::setup::{self, Setup};
use crate::shader::{ShaderCompiler, ShaderLimits, ShaderStage};
use crate::tiler;
use crate::vertex::VertexPipeline;
use gallium_geometry::rect::RectI;
use gallium_geometry::vector::{vec2i, Vector2I};
use gallium_gpu::resource::{Buffer, Surface, Texture};
use gallium_gpu::screen::Screen;
use gallium_gpu::{PipeError, PipeResult, Winsys};
use instant::Instant;
use std::sync::Arc;
use std::time::Duration;

/// The executors a software context can run its tile pass on.
pub enum TileExecutor {
    Sequential(SequentialExecutor),
    Rayon(RayonExecutor),
}

impl Executor for TileExecutor {
    fn build_vector<T, F>(&self, length: usize, builder: F) -> Vec<T>
                          where T: Send, F: Fn(usize) -> T + Send + Sync {
        match *self {
            TileExecutor::Sequential(ref executor) => executor.build_vector(length, builder),
            TileExecutor::Rayon(ref executor) => executor.build_vector(length, builder),
        }
    }
}

pub struct SoftContext<W> where W: Winsys {
    common: ContextCommon<W>,
    scene: Scene<W>,
    executor: TileExecutor,
    stats: RasterStats,
    tile_pass_time: Duration,
}

impl<W> SoftContext<W> where W: Winsys {
    pub fn new(screen: Arc<Screen<W>>, compiler: Arc<dyn ShaderCompiler>)
               -> PipeResult<SoftContext<W>> {
        if !screen.is_software() {
            return Err(PipeError::Fatal("software context on a GPU screen"));
        }
        let threads = screen.options().rasterizer_threads;
        let executor = if threads == 0 {
            TileExecutor::Sequential(SequentialExecutor)
        } else {
            match RayonExecutor::new(threads) {
                Ok(executor) => TileExecutor::Rayon(executor),
                Err(error) => {
                    warn!("{}; rasterizing on the calling thread", error);
                    TileExecutor::Sequential(SequentialExecutor)
                }
            }
        };
        info!("creating software context: {}",
              match executor {
                  TileExecutor::Sequential(_) => "sequential tile pass".to_owned(),
                  TileExecutor::Rayon(ref rayon) => format!("{} tile threads", rayon.num_threads()),
              });

        Ok(SoftContext {
            common: ContextCommon::new(screen, compiler),
            scene: Scene::new(FramebufferState::default()),
            executor,
            stats: RasterStats::default(),
            tile_pass_time: Duration::default(),
        })
    }

    #[inline]
    pub fn common(&self) -> &ContextCommon<W> {
        &self.common
    }

    #[inline]
    pub fn common_mut(&mut self) -> &mut ContextCommon<W> {
        &mut self.common
    }

    #[inline]
    pub fn stats(&self) -> &RasterStats {
        &self.stats
    }

    /// Wall-clock time spent in tile passes so far.
    #[inline]
    pub fn tile_pass_time(&self) -> Duration {
        self.tile_pass_time
    }

    #[inline]
    pub fn scene(&self) -> &Scene<W> {
        &self.scene
    }

    /// Binds render targets. Work binned for the previous ones is rasterized first.
    pub fn set_framebuffer_state(&mut self, framebuffer: FramebufferState<W>) -> PipeResult<()> {
        if !self.scene.is_bound_to(&framebuffer) {
            self.flush()?;
            self.scene = Scene::new(framebuffer.clone());
        }
        self.common.set_framebuffer_state(framebuffer);
        Ok(())
    }

    pub fn draw(&mut self, draw: &DrawInfo) -> PipeResult<()> {
        if !self.common.validate_draw(draw)? {
            debug!("skipping empty draw {:?}", draw);
            return Ok(());
        }
        let clip = self.common.state.clip_rect();
        if clip.is_empty() {
            debug!("skipping draw {:?} outside the scissor", draw);
            return Ok(());
        }

        let (vs, fs) = match (&self.common.state.vs, &self.common.state.fs) {
            (&Some(ref vs), &Some(ref fs)) => (vs.clone(), fs.clone()),
            _ => return Err(PipeError::bad_input("draw without both shaders bound")),
        };
        let limits = ShaderLimits::unlimited();
        let compiler = &*self.common.compiler;
        let vs = vs.get_or_compile(compiler,
                                   &self.common.compile_key(ShaderStage::Vertex, true),
                                   &limits);
        let fs = fs.get_or_compile(compiler,
                                   &self.common.compile_key(ShaderStage::Fragment, true),
                                   &limits);
        let (vs_program, fs_program) = match (vs.cpu_program(), fs.cpu_program()) {
            (Some(vs), Some(fs)) => (vs.clone(), fs.clone()),
            _ => return Err(PipeError::Fatal("shader variant without a CPU program")),
        };

        let state = &self.common.state;
        let pipeline = VertexPipeline {
            program: &*vs_program,
            constants: &state.vs_constants,
            viewport: state.viewport,
            flatshade_first: state.rasterizer.flatshade_first,
        };
        let batch = pipeline.run(state, draw)?;
        let draw_state = Arc::new(DrawState {
            program: fs_program,
            constants: state.fs_constants.clone(),
            depth_stencil: state.depth_stencil,
            stencil_ref: state.stencil_ref,
            blend: state.blend,
            blend_color: state.blend_color,
        });

        let stats = &mut self.stats;
        stats.triangles_culled += batch.dropped as u64;
        for triangle in &batch.triangles {
            let vertices = [
                &batch.vertices[triangle.vertices[0] as usize],
                &batch.vertices[triangle.vertices[1] as usize],
                &batch.vertices[triangle.vertices[2] as usize],
            ];
            let provoking = &batch.vertices[triangle.provoking as usize];
            match setup::setup_triangle(vertices, provoking, &state.rasterizer, clip) {
                Setup::Triangle(descriptor) => {
                    tiler::bin_triangle(&mut self.scene, descriptor, &draw_state);
                    stats.triangles_binned += 1;
                }
                Setup::Culled => stats.triangles_culled += 1,
                Setup::Degenerate => stats.triangles_degenerate += 1,
            }
        }
        debug!("binned {} triangles of draw {:?}", batch.triangles.len(), draw);

        let written = state.depth_stencil.written_buffers();
        self.common.mark_render_targets_dirty(ClearFlags::COLOR | written);
        if self.common.screen.options().sync {
            self.flush()?;
        }
        Ok(())
    }

    /// Clears whole bound buffers.
    pub fn clear(&mut self, flags: ClearFlags, value: &ClearValue) -> PipeResult<()> {
        let framebuffer = self.common.state.framebuffer.clone();
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
        match self.scene.slot_of(surface) {
            Some(slot) => self.scene.clear(slot, flags, value, rect),
            None => {
                if self.scene.renders_to(surface.texture()) {
                    self.flush()?;
                }
                rasterizer::fill_surface_rect(surface, flags, value, rect)?;
            }
        }
        surface.mark_dirty();
        self.common.invalidate_sampler_views();
        Ok(())
    }

    /// Vertex data is consumed when a draw is binned, so writes land immediately.
    pub fn buffer_write(&mut self, buffer: &Arc<Buffer<W>>, offset: usize, data: &[u8])
                        -> PipeResult<()> {
        buffer.write(offset, data)
    }

    pub fn texture_write(&mut self,
                         texture: &Arc<Texture<W>>,
                         layer: u32,
                         level: u32,
                         rect: RectI,
                         data: &[u8])
                         -> PipeResult<()> {
        if self.scene.renders_to(texture) {
            self.flush()?;
        }
        texture.write_region(layer, level, rect, data)?;
        self.common.invalidate_sampler_views();
        Ok(())
    }

    pub fn resource_copy_region(&mut self, region: &CopyRegion<W>) -> PipeResult<()> {
        if self.scene.renders_to(&region.src) || self.scene.renders_to(&region.dst) {
            self.flush()?;
        }
        let (src_width, _, _) = region.src.desc().level_size(region.src_level);
        let texels = region.src.read_layer(region.src_layer, region.src_level)?;
        let bpp = region.src.desc().format.bytes_per_pixel();
        let rect = region.src_rect;
        let row_bytes = rect.width() as usize * bpp;
        let mut data = Vec::with_capacity(row_bytes * rect.height() as usize);
        for y in rect.min_y()..rect.max_y() {
            let start = (y as usize * src_width as usize + rect.min_x() as usize) * bpp;
            data.extend_from_slice(&texels[start..(start + row_bytes)]);
        }
        region.dst.write_region(region.dst_layer, region.dst_level, region.dst_rect(), &data)?;
        self.common.invalidate_sampler_views();
        Ok(())
    }

    /// Rasterizes everything binned so far into texture memory.
    pub fn flush(&mut self) -> PipeResult<()> {
        if self.scene.is_idle() {
            return Ok(());
        }
        let start = Instant::now();
        let result = rasterizer::rasterize_scene(&self.scene, &self.executor, &mut self.stats);
        let elapsed = Instant::now() - start;
        self.tile_pass_time += elapsed;
        debug!("tile pass took {:?}", elapsed);
        self.scene.reset();
        if let Err(ref error) = result {
            warn!("tile pass failed, binned work is lost: {}", error);
        }
        result
    }

    pub fn read_pixels(&mut self, texture: &Arc<Texture<W>>, layer: u32, level: u32)
                       -> PipeResult<Vec<u8>> {
        self.flush()?;
        texture.read_layer(layer, level)
    }
}

#[inline]
fn full_rect<W>(surface: &Surface<W>) -> RectI where W: Winsys {
    RectI::new(Vector2I::zero(), vec2i(surface.width() as i32, surface.height() as i32))
}

#[cfg(test)]
mod test {
    use super::SoftContext;
    use crate::cso::{ClearFlags, ClearValue, CompareFunc, DepthStencilState, DrawInfo};
    use crate::cso::{FramebufferState, PrimitiveTopology, VertexBufferBinding, VertexElement};
    use crate::cso::VertexFormat;
    use crate::shader::test::TestCompiler;
    use crate::shader::{Shader, ShaderStage};
    use byteorder::{ByteOrder, LittleEndian};
    use gallium_geometry::rect::RectI;
    use gallium_geometry::vector::vec2i;
    use gallium_gpu::options::DebugOptions;
    use gallium_gpu::resource::{Surface, Texture, TextureDesc};
    use gallium_gpu::screen::Screen;
    use gallium_gpu::{BindFlags, SurfaceFormat};
    use gallium_nullws::NullWinsys;
    use std::sync::Arc;

    const GREEN: [u8; 4] = [0, 255, 0, 255];

    struct Target {
        color: Arc<Texture<NullWinsys>>,
        cbuf: Arc<Surface<NullWinsys>>,
        depth: Option<Arc<Texture<NullWinsys>>>,
    }

    fn context(threads: usize) -> SoftContext<NullWinsys> {
        let options = DebugOptions { rasterizer_threads: threads, ..DebugOptions::default() };
        let screen = Screen::new_software(NullWinsys::new(), options);
        SoftContext::new(screen, Arc::new(TestCompiler::default())).unwrap()
    }

    fn bind_target(context: &mut SoftContext<NullWinsys>, size: u32, depth: bool) -> Target {
        let screen = context.common().screen.clone();
        let color = screen.create_texture(TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                                              size,
                                                              size,
                                                              1,
                                                              BindFlags::RENDER_TARGET)).unwrap();
        let cbuf = Arc::new(Surface::new(color.clone(), 0, 0, SurfaceFormat::R8G8B8A8Unorm, None));
        let (depth, zsbuf) = if depth {
            let desc = TextureDesc::new_2d(SurfaceFormat::Z32Float,
                                           size,
                                           size,
                                           1,
                                           BindFlags::DEPTH_STENCIL);
            let texture = screen.create_texture(desc).unwrap();
            let zsbuf = Surface::new(texture.clone(), 0, 0, SurfaceFormat::Z32Float, None);
            (Some(texture), Some(Arc::new(zsbuf)))
        } else {
            (None, None)
        };
        let framebuffer = FramebufferState::new(&[cbuf.clone()], zsbuf).unwrap();
        context.set_framebuffer_state(framebuffer).unwrap();
        Target { color, cbuf, depth }
    }

    /// Binds shaders and a vertex buffer of window-space `[x, y, z]` positions.
    fn bind_vertices(context: &mut SoftContext<NullWinsys>, positions: &[[f32; 3]]) {
        let screen = context.common().screen.clone();
        let floats: Vec<f32> = positions.iter().flat_map(|position| position.to_vec()).collect();
        let mut bytes = vec![0; floats.len() * 4];
        LittleEndian::write_f32_into(&floats, &mut bytes);
        let buffer = screen.create_buffer(bytes.len(), BindFlags::VERTEX_BUFFER).unwrap();
        context.buffer_write(&buffer, 0, &bytes).unwrap();

        let common = context.common_mut();
        common.set_vertex_elements(&[VertexElement {
            src_offset: 0,
            buffer_index: 0,
            format: VertexFormat::Float32x3,
        }]).unwrap();
        common.set_vertex_buffers(&[Some(VertexBufferBinding { buffer, stride: 12, offset: 0 })])
              .unwrap();
        let vs = Arc::new(Shader::new(ShaderStage::Vertex, vec![4, 2]));
        let fs = Arc::new(Shader::new(ShaderStage::Fragment, vec![4, 2]));
        common.bind_shader(ShaderStage::Vertex, Some(vs)).unwrap();
        common.bind_shader(ShaderStage::Fragment, Some(fs)).unwrap();
    }

    fn quad(x0: f32, y0: f32, x1: f32, y1: f32, z: f32) -> Vec<[f32; 3]> {
        vec![[x0, y0, z], [x1, y0, z], [x0, y1, z], [x1, y0, z], [x1, y1, z], [x0, y1, z]]
    }

    fn pixel(texels: &[u8], width: usize, x: usize, y: usize) -> [u8; 4] {
        let offset = (y * width + x) * 4;
        [texels[offset], texels[offset + 1], texels[offset + 2], texels[offset + 3]]
    }

    #[test]
    fn test_full_clear_loads_nothing() {
        let mut context = context(0);
        let target = bind_target(&mut context, 128, false);
        let value = ClearValue { color: [1.0, 0.0, 0.0, 1.0], ..ClearValue::default() };
        context.clear(ClearFlags::COLOR, &value).unwrap();
        let texels = context.read_pixels(&target.color, 0, 0).unwrap();
        assert_eq!(context.stats().tiles_loaded, 0);
        assert_eq!(context.stats().tiles_cleared, 4);
        assert_eq!(context.stats().tiles_stored, 4);
        assert!(texels.chunks(4).all(|texel| texel == [255, 0, 0, 255]));
    }

    #[test]
    fn test_partial_clear_loads_only_straddling_tiles() {
        let mut context = context(0);
        let target = bind_target(&mut context, 128, false);
        let value = ClearValue { color: [0.0, 0.0, 1.0, 1.0], ..ClearValue::default() };
        let rect = RectI::from_points(vec2i(0, 0), vec2i(96, 64));
        context.clear_surface(&target.cbuf, ClearFlags::COLOR, &value, rect).unwrap();
        let texels = context.read_pixels(&target.color, 0, 0).unwrap();
        assert_eq!(context.stats().tiles_loaded, 1);
        assert_eq!(context.stats().tiles_cleared, 1);
        assert_eq!(pixel(&texels, 128, 80, 10), [0, 0, 255, 255]);
        assert_eq!(pixel(&texels, 128, 10, 10), [0, 0, 255, 255]);
        assert_eq!(pixel(&texels, 128, 100, 10), [0, 0, 0, 0]);
        assert_eq!(pixel(&texels, 128, 10, 100), [0, 0, 0, 0]);
    }

    #[test]
    fn test_nearer_draw_wins_the_depth_test() {
        let mut context = context(0);
        let target = bind_target(&mut context, 64, true);
        context.common_mut().set_depth_stencil_state(DepthStencilState {
            depth_enabled: true,
            depth_write: true,
            depth_func: CompareFunc::Less,
            ..DepthStencilState::default()
        });
        context.clear(ClearFlags::COLOR | ClearFlags::DEPTH, &ClearValue::default()).unwrap();

        let mut positions = quad(0.0, 0.0, 64.0, 64.0, 0.25);
        positions.extend(quad(0.0, 0.0, 64.0, 64.0, 0.75));
        bind_vertices(&mut context, &positions);
        context.draw(&DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 12)).unwrap();

        let depth = context.read_pixels(target.depth.as_ref().unwrap(), 0, 0).unwrap();
        assert!(depth.chunks(4).all(|texel| LittleEndian::read_f32(texel) == 0.25));
        assert_eq!(context.stats().fragments, 64 * 64);
        let color = context.read_pixels(&target.color, 0, 0).unwrap();
        assert!(color.chunks(4).all(|texel| texel == GREEN));
    }

    #[test]
    fn test_threaded_tile_pass_matches_sequential() {
        let render = |threads| {
            let mut context = context(threads);
            let target = bind_target(&mut context, 200, false);
            context.clear(ClearFlags::COLOR, &ClearValue::default()).unwrap();
            bind_vertices(&mut context, &[[3.0, 7.0, 0.5], [190.0, 40.0, 0.5], [60.0, 199.0, 0.5]]);
            context.draw(&DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3)).unwrap();
            let texels = context.read_pixels(&target.color, 0, 0).unwrap();
            (texels, *context.stats())
        };
        let (sequential, sequential_stats) = render(0);
        let (threaded, threaded_stats) = render(3);
        assert!(sequential.chunks(4).any(|texel| texel == GREEN));
        assert_eq!(sequential, threaded);
        assert_eq!(sequential_stats, threaded_stats);
    }

    #[test]
    fn test_degenerate_draw_bins_nothing() {
        let mut context = context(0);
        bind_target(&mut context, 64, false);
        bind_vertices(&mut context, &[[1.0, 1.0, 0.5], [10.0, 10.0, 0.5], [20.0, 20.0, 0.5]]);
        context.draw(&DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3)).unwrap();
        assert_eq!(context.stats().triangles_degenerate, 1);
        assert_eq!(context.stats().triangles_binned, 0);
        assert!(context.scene().is_idle());
    }
}
