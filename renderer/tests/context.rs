// gallium/renderer/tests/context.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Whole contexts driven through their public interface over the in-memory winsys.

use byteorder::{ByteOrder, LittleEndian};
use gallium_geometry::rect::RectI;
use gallium_geometry::vector::vec2i;
use gallium_gpu::options::DebugOptions;
use gallium_gpu::resource::{Buffer, TextureDesc};
use gallium_gpu::screen::Screen;
use gallium_gpu::{BindFlags, PipeError, SurfaceFormat, TextureTarget, WinsysLimits};
use gallium_nullws::NullWinsys;
use gallium_renderer::context::{BackendKind, Context, CopyRegion, FlushFlags};
use gallium_renderer::cso::{ClearFlags, ClearValue, DrawInfo, FramebufferState};
use gallium_renderer::cso::{PrimitiveTopology, VertexBufferBinding, VertexElement, VertexFormat};
use gallium_renderer::dirty::DirtyState;
use gallium_renderer::hw::family::Packet;
use gallium_renderer::shader::{CompileKey, CompiledShader, ConstantColorProgram};
use gallium_renderer::shader::{PassthroughProgram, ResourceUsage, Shader, ShaderCode};
use gallium_renderer::shader::{ShaderCompiler, ShaderStage};
use std::sync::Arc;

const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

/// Emits the tokens unchanged for the GPU and constant programs for the CPU.
struct EchoCompiler;

impl ShaderCompiler for EchoCompiler {
    fn compile(&self, stage: ShaderStage, tokens: &[u32], key: &CompileKey)
               -> Result<CompiledShader, String> {
        let code = match (key.cpu, stage) {
            (false, _) => ShaderCode::Tokens(tokens.to_vec()),
            (true, ShaderStage::Vertex) => {
                ShaderCode::Jit(Arc::new(PassthroughProgram { num_outputs: 1 }))
            }
            (true, ShaderStage::Fragment) => {
                ShaderCode::Jit(Arc::new(ConstantColorProgram { color: BLUE }))
            }
        };
        let usage = ResourceUsage { num_instructions: tokens.len() as u32, num_temps: 1 };
        Ok(CompiledShader { code, usage })
    }
}

fn screen(kind: BackendKind, options: DebugOptions) -> Arc<Screen<NullWinsys>> {
    match kind {
        BackendKind::Software => Screen::new_software(NullWinsys::new(), options),
        _ => Screen::new_hardware(NullWinsys::with_limits(WinsysLimits::default()), options),
    }
}

fn context(screen: &Arc<Screen<NullWinsys>>, kind: BackendKind) -> Context<NullWinsys> {
    Context::new(screen, Arc::new(EchoCompiler), kind).unwrap()
}

fn vertex_buffer(screen: &Arc<Screen<NullWinsys>>, positions: &[[f32; 2]])
                 -> Arc<Buffer<NullWinsys>> {
    let floats: Vec<f32> = positions.iter().flat_map(|position| position.to_vec()).collect();
    let mut bytes = vec![0; floats.len() * 4];
    LittleEndian::write_f32_into(&floats, &mut bytes);
    let buffer = screen.create_buffer(bytes.len(), BindFlags::VERTEX_BUFFER).unwrap();
    buffer.write(0, &bytes).unwrap();
    buffer
}

/// Binds a render target of `size` pixels, the shaders and `buffer` as two-float positions.
fn bind_pipeline(context: &mut Context<NullWinsys>,
                 screen: &Arc<Screen<NullWinsys>>,
                 size: u32,
                 buffer: Arc<Buffer<NullWinsys>>)
                 -> Arc<gallium_gpu::resource::Texture<NullWinsys>> {
    let desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                   size,
                                   size,
                                   1,
                                   BindFlags::RENDER_TARGET | BindFlags::SAMPLER_VIEW);
    let texture = screen.create_texture(desc).unwrap();
    let surface = context.create_surface(&texture, 0, 0, SurfaceFormat::R8G8B8A8Unorm).unwrap();
    context.set_framebuffer_state(FramebufferState::new(&[surface], None).unwrap()).unwrap();

    let element = VertexElement { src_offset: 0, buffer_index: 0, format: VertexFormat::Float32x2 };
    context.set_vertex_elements(&[element]).unwrap();
    context.set_vertex_buffers(&[Some(VertexBufferBinding { buffer, stride: 8, offset: 0 })])
           .unwrap();
    context.bind_vs(Some(Arc::new(Shader::new(ShaderStage::Vertex, vec![1, 2, 3])))).unwrap();
    context.bind_fs(Some(Arc::new(Shader::new(ShaderStage::Fragment, vec![1, 2])))).unwrap();
    texture
}

fn triangle() -> DrawInfo {
    DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, 3)
}

#[test]
fn test_overlapping_buffer_writes_merge_into_one_range() {
    let screen = screen(BackendKind::R600, DebugOptions::default());
    let mut context = context(&screen, BackendKind::R600);
    let buffer = screen.create_buffer(4096, BindFlags::VERTEX_BUFFER).unwrap();
    context.buffer_write(&buffer, 0, &[1; 100]).unwrap();
    context.buffer_write(&buffer, 200, &[2; 100]).unwrap();
    assert_eq!(buffer.lock().dirty.len(), 2);
    context.buffer_write(&buffer, 90, &[3; 120]).unwrap();
    assert_eq!(buffer.lock().dirty.ranges(), &[0..300]);
}

#[test]
fn test_reservation_past_the_end_flushes_exactly_once() {
    let limits = WinsysLimits { max_cmd_dwords: 100, ..WinsysLimits::default() };
    let screen = Screen::new_hardware(NullWinsys::with_limits(limits), DebugOptions::default());
    let mut context = context(&screen, BackendKind::Evergreen);
    let hw = match context {
        Context::Hardware(ref mut hw) => hw,
        Context::Software(_) => panic!("expected a hardware context"),
    };
    hw.command_buffer_mut().reserve(96).unwrap();
    hw.command_buffer_mut().commit();
    hw.set_dirty(DirtyState::empty());
    assert!(hw.need_space(10, false).unwrap());
    assert_eq!(hw.stats().flushes, 1);
    assert_eq!(hw.stats().submissions, 1);
    assert_eq!(hw.command_buffer().used(), 0);
    assert_eq!(hw.dirty(), DirtyState::all());
    assert_eq!(screen.winsys().submission_count(), 1);
}

#[test]
fn test_rebinding_the_same_fragment_variant_emits_no_shader_state() {
    let screen = screen(BackendKind::R600, DebugOptions::default());
    let mut context = context(&screen, BackendKind::R600);
    let buffer = vertex_buffer(&screen, &[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
    bind_pipeline(&mut context, &screen, 32, buffer);
    context.draw(&triangle()).unwrap();

    let fs = context.common().state.fs.clone();
    context.bind_fs(fs).unwrap();
    context.draw(&triangle()).unwrap();
    let stats = context.hw_stats().unwrap();
    assert_eq!(stats.packets(Packet::FragmentShader), 1);
    assert_eq!(stats.packets(Packet::Draw), 2);
}

#[test]
fn test_forced_level_view_gets_its_own_surface() {
    let options = DebugOptions { force_level_surface_view: true, ..DebugOptions::default() };
    let screen = screen(BackendKind::Svga, options);
    let mut context = context(&screen, BackendKind::Svga);
    let desc = TextureDesc {
        target: TextureTarget::Texture3D,
        format: SurfaceFormat::R8G8B8A8Unorm,
        width: 16,
        height: 16,
        depth: 16,
        num_levels: 4,
        bind: BindFlags::RENDER_TARGET | BindFlags::SAMPLER_VIEW,
    };
    let texture = screen.create_texture(desc).unwrap();
    let surface = context.create_surface(&texture, 2, 0, SurfaceFormat::R8G8B8A8Unorm).unwrap();
    assert!(surface.is_view());
    assert!(surface.host_handle().is_some());
    assert_ne!(surface.host_handle(), texture.host_handle());
    assert_eq!((surface.width(), surface.height()), (4, 4));
}

#[test]
fn test_full_clear_issues_no_tile_loads() {
    let screen = screen(BackendKind::Software, DebugOptions::default());
    let mut context = context(&screen, BackendKind::Software);
    let buffer = vertex_buffer(&screen, &[[0.0, 0.0], [100.0, 0.0], [0.0, 100.0]]);
    let texture = bind_pipeline(&mut context, &screen, 160, buffer);
    let value = ClearValue { color: [1.0, 1.0, 1.0, 1.0], ..ClearValue::default() };
    context.clear(ClearFlags::COLOR, &value).unwrap();
    context.draw(&triangle()).unwrap();
    context.flush(FlushFlags::empty()).unwrap();

    let stats = *context.raster_stats().unwrap();
    assert_eq!(stats.tiles_loaded, 0);
    assert_eq!(stats.tiles_cleared, 9);
    assert_eq!(stats.tiles_stored, 9);
    assert_eq!(stats.triangles_binned, 1);

    let texels = context.read_pixels(&texture, 0, 0).unwrap();
    let texel = |x: usize, y: usize| &texels[(y * 160 + x) * 4..(y * 160 + x) * 4 + 4];
    assert_eq!(texel(10, 10), &[0, 0, 255, 255]);
    assert_eq!(texel(150, 150), &[255, 255, 255, 255]);
}

#[test]
fn test_destroyed_buffer_backing_is_recycled_for_an_identical_buffer() {
    let screen = screen(BackendKind::R600, DebugOptions::default());
    let mut context = context(&screen, BackendKind::R600);
    let positions = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let first = vertex_buffer(&screen, &positions);
    bind_pipeline(&mut context, &screen, 32, first.clone());
    context.draw(&triangle()).unwrap();
    context.flush(FlushFlags::empty()).unwrap();
    let handle = first.lock().host.as_ref().map(|host| screen.host_handle(host));
    assert!(handle.is_some());

    let second = vertex_buffer(&screen, &positions);
    context.set_vertex_buffers(&[Some(VertexBufferBinding {
        buffer: second.clone(),
        stride: 8,
        offset: 0,
    })]).unwrap();
    drop(first);
    context.draw(&triangle()).unwrap();
    let recycled = second.lock().host.as_ref().map(|host| screen.host_handle(host));
    assert_eq!(recycled, handle);
}

#[test]
fn test_sampling_a_bound_render_target_is_rejected() {
    let screen = screen(BackendKind::Evergreen, DebugOptions::default());
    let mut context = context(&screen, BackendKind::Evergreen);
    let buffer = vertex_buffer(&screen, &[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
    let texture = bind_pipeline(&mut context, &screen, 32, buffer);
    let view = context.create_sampler_view(&texture, 0, 0).unwrap();
    context.set_sampler_views(&[Some(view)]).unwrap();
    match context.draw(&triangle()) {
        Err(PipeError::BadInput(_)) => {}
        other => panic!("expected a rejected draw, got {:?}", other),
    }
    assert_eq!(context.hw_stats().unwrap().packets(Packet::Draw), 0);
}

#[test]
fn test_software_copy_moves_texels_between_textures() {
    let screen = screen(BackendKind::Software, DebugOptions::default());
    let mut context = context(&screen, BackendKind::Software);
    let desc = TextureDesc::new_2d(SurfaceFormat::B8G8R8A8Unorm,
                                   16,
                                   16,
                                   1,
                                   BindFlags::SAMPLER_VIEW);
    let src = screen.create_texture(desc).unwrap();
    let dst = screen.create_texture(desc).unwrap();
    let rect = RectI::new(vec2i(2, 2), vec2i(4, 3));
    context.texture_write(&src, 0, 0, rect, &[7; 4 * 3 * 4]).unwrap();
    context.resource_copy_region(&CopyRegion {
        dst: dst.clone(),
        dst_level: 0,
        dst_layer: 0,
        dst_origin: vec2i(10, 12),
        src: src.clone(),
        src_level: 0,
        src_layer: 0,
        src_rect: rect,
    }).unwrap();

    let texels = context.read_pixels(&dst, 0, 0).unwrap();
    let written: usize = texels.iter().filter(|&&byte| byte == 7).count();
    assert_eq!(written, 4 * 3 * 4);
    assert_eq!(texels[(12 * 16 + 10) * 4], 7);
    assert_eq!(texels[(14 * 16 + 13) * 4], 7);
    assert_eq!(texels[(15 * 16 + 13) * 4], 0);
}

#[test]
fn test_partial_clear_through_the_context_validates_its_rect() {
    let screen = screen(BackendKind::Software, DebugOptions::default());
    let mut context = context(&screen, BackendKind::Software);
    let buffer = vertex_buffer(&screen, &[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
    bind_pipeline(&mut context, &screen, 64, buffer);
    let surface = context.common().state.framebuffer.cbufs[0].clone().unwrap();
    let outside = RectI::new(vec2i(32, 32), vec2i(64, 64));
    assert!(context.clear_render_target(&surface, outside, BLUE).is_err());
    let inside = RectI::new(vec2i(32, 32), vec2i(32, 32));
    context.clear_render_target(&surface, inside, BLUE).unwrap();
    context.flush(FlushFlags::empty()).unwrap();
    assert_eq!(context.raster_stats().unwrap().tiles_loaded, 1);
}
