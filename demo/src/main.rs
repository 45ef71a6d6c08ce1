// gallium/demo/src/main.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Renders two interpenetrating triangles through the software context into a PNG, then
//! replays the same frame on a hardware context over the in-memory winsys and reports what was
//! submitted.

#[macro_use]
extern crate log;

use byteorder::{ByteOrder, LittleEndian};
use clap::{App, Arg};
use gallium_geometry::rect::RectI;
use gallium_geometry::vector::{vec2i, Vector2I};
use gallium_gpu::options::{DebugOptions, OptionSource};
use gallium_gpu::resource::{Texture, TextureDesc};
use gallium_gpu::screen::Screen;
use gallium_gpu::{BindFlags, PipeResult, SurfaceFormat};
use gallium_nullws::NullWinsys;
use gallium_renderer::context::{BackendKind, Context, FlushFlags};
use gallium_renderer::cso::{ClearFlags, ClearValue, CompareFunc, DepthStencilState, DrawInfo};
use gallium_renderer::cso::{FramebufferState, PrimitiveTopology, VertexBufferBinding};
use gallium_renderer::cso::{VertexElement, VertexFormat, Viewport};
use gallium_renderer::hw::family::Packet;
use gallium_renderer::shader::{CompileKey, CompiledShader, PassthroughProgram, ResourceUsage};
use gallium_renderer::shader::{Shader, ShaderCode, ShaderCompiler, ShaderStage};
use image::ColorType;
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

const DEFAULT_SIZE: u32 = 256;
const DEFAULT_OUTPUT: &str = "gallium-demo.png";

const BACKGROUND: [f32; 4] = [0.125, 0.125, 0.125, 1.0];

/// Position `[x, y, z]` in normalized device coordinates and an RGBA8 color.
const VERTEX_STRIDE: usize = 16;
const TRIANGLES: [([f32; 3], [u8; 4]); 6] = [
    ([-0.9, -0.8, 0.2], [255, 64, 64, 255]),
    ([0.8, -0.6, 0.8], [255, 200, 64, 255]),
    ([-0.2, 0.9, 0.5], [255, 64, 160, 255]),
    ([0.9, 0.7, 0.2], [64, 160, 255, 255]),
    ([-0.8, 0.3, 0.8], [64, 255, 160, 255]),
    ([0.1, -0.9, 0.5], [160, 64, 255, 255]),
];

/// Hands the GPU its tokens unchanged and the CPU programs that pass the vertex color through.
struct DemoCompiler;

impl ShaderCompiler for DemoCompiler {
    fn compile(&self, stage: ShaderStage, tokens: &[u32], key: &CompileKey)
               -> Result<CompiledShader, String> {
        let code = match (key.cpu, stage) {
            (false, _) => ShaderCode::Tokens(tokens.to_vec()),
            (true, ShaderStage::Vertex) => {
                ShaderCode::Jit(Arc::new(PassthroughProgram { num_outputs: 2 }))
            }
            (true, ShaderStage::Fragment) => {
                ShaderCode::Jit(Arc::new(PassthroughProgram { num_outputs: 1 }))
            }
        };
        let usage = ResourceUsage { num_instructions: tokens.len() as u32, num_temps: 2 };
        Ok(CompiledShader { code, usage })
    }
}

struct Options {
    size: u32,
    output: PathBuf,
    backend: BackendKind,
    debug: DebugOptions,
}

impl Options {
    fn from_command_line() -> Options {
        let matches = App::new("gallium-demo")
            .arg(
                Arg::with_name("jobs")
                    .short("j")
                    .long("jobs")
                    .value_name("THREADS")
                    .takes_value(true)
                    .help("Number of tile threads for the software context"),
            )
            .arg(
                Arg::with_name("backend")
                    .short("b")
                    .long("backend")
                    .takes_value(true)
                    .possible_values(&["r600", "evergreen", "svga"])
                    .help("The hardware family to replay the frame on"),
            )
            .arg(
                Arg::with_name("size")
                    .short("s")
                    .long("size")
                    .value_name("PIXELS")
                    .takes_value(true)
                    .help("Width and height of the render target"),
            )
            .arg(Arg::with_name("OUTPUT").help("Path of the PNG to write").index(1))
            .get_matches();

        let mut debug = DebugOptions::from_source(&OptionSource::from_env_vars(env::vars()));
        if let Some(jobs) = matches.value_of("jobs").and_then(|jobs| jobs.parse().ok()) {
            debug.rasterizer_threads = jobs;
        }
        let backend = match matches.value_of("backend") {
            Some("evergreen") => BackendKind::Evergreen,
            Some("svga") => BackendKind::Svga,
            _ => BackendKind::R600,
        };
        let size = matches.value_of("size")
                          .and_then(|size| size.parse().ok())
                          .filter(|&size| size > 0)
                          .unwrap_or(DEFAULT_SIZE);
        let output = PathBuf::from(matches.value_of("OUTPUT").unwrap_or(DEFAULT_OUTPUT));
        Options { size, output, backend, debug }
    }
}

fn main() {
    drop(env_logger::init());
    let options = Options::from_command_line();

    let texels = match render_software(&options) {
        Ok(texels) => texels,
        Err(error) => {
            eprintln!("software rendering failed: {}", error);
            process::exit(1);
        }
    };
    if let Err(error) = image::save_buffer(&options.output,
                                           &texels,
                                           options.size,
                                           options.size,
                                           ColorType::RGBA(8)) {
        eprintln!("couldn't write {}: {}", options.output.display(), error);
        process::exit(1);
    }
    println!("wrote {}", options.output.display());

    if let Err(error) = render_hardware(&options) {
        eprintln!("hardware replay failed: {}", error);
        process::exit(1);
    }
}

fn render_software(options: &Options) -> PipeResult<Vec<u8>> {
    let screen = Screen::new_software(NullWinsys::new(), options.debug.clone());
    let mut context = Context::new(&screen, Arc::new(DemoCompiler), BackendKind::Software)?;
    let target = draw_frame(&mut context, &screen, options.size)?;
    context.flush(FlushFlags::empty())?;
    let texels = context.read_pixels(&target, 0, 0)?;

    if let Some(stats) = context.raster_stats() {
        println!("software: {} triangles binned, {} culled, {} degenerate",
                 stats.triangles_binned,
                 stats.triangles_culled,
                 stats.triangles_degenerate);
        println!("          tiles: {} loaded, {} cleared, {} shaded, {} stored",
                 stats.tiles_loaded,
                 stats.tiles_cleared,
                 stats.tiles_shaded,
                 stats.tiles_stored);
        println!("          classification: {} accepted, {} rejected, {} partial; {} fragments",
                 stats.trivially_accepted,
                 stats.trivially_rejected,
                 stats.partial,
                 stats.fragments);
    }
    if let Context::Software(ref software) = context {
        println!("          tile passes took {:?}", software.tile_pass_time());
    }
    Ok(texels)
}

fn render_hardware(options: &Options) -> PipeResult<()> {
    let screen = Screen::new_hardware(NullWinsys::new(), options.debug.clone());
    let mut context = Context::new(&screen, Arc::new(DemoCompiler), options.backend)?;
    draw_frame(&mut context, &screen, options.size)?;
    let fence = context.flush(FlushFlags::FENCE)?;
    context.finish()?;
    info!("hardware frame fenced with {:?}", fence);

    if let Some(stats) = context.hw_stats() {
        println!("{:?}: {} draws ({} through software vertices, {} dropped), {} submissions",
                 options.backend,
                 stats.draws,
                 stats.swtnl_draws,
                 stats.dropped_draws,
                 stats.submissions);
        println!("          packets: {} draw, {} clear, {} upload, {} state passes",
                 stats.packets(Packet::Draw),
                 stats.packets(Packet::Clear),
                 stats.packets(Packet::Upload),
                 stats.state_passes);
    }
    let winsys = screen.winsys();
    let dwords: usize = winsys.submissions().iter().map(|submission| submission.dwords.len()).sum();
    let cache = screen.surface_cache_stats();
    println!("          {} dwords submitted; surface cache: {} hits, {} misses",
             dwords,
             cache.hits,
             cache.misses);
    Ok(())
}

/// Clears a color and depth target and draws the triangles into it. Returns the color texture.
fn draw_frame(context: &mut Context<NullWinsys>, screen: &Arc<Screen<NullWinsys>>, size: u32)
              -> PipeResult<Arc<Texture<NullWinsys>>> {
    let color = screen.create_texture(TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                                          size,
                                                          size,
                                                          1,
                                                          BindFlags::RENDER_TARGET))?;
    let depth = screen.create_texture(TextureDesc::new_2d(SurfaceFormat::Z24UnormS8Uint,
                                                          size,
                                                          size,
                                                          1,
                                                          BindFlags::DEPTH_STENCIL))?;
    let cbuf = context.create_surface(&color, 0, 0, SurfaceFormat::R8G8B8A8Unorm)?;
    let zsbuf = context.create_surface(&depth, 0, 0, SurfaceFormat::Z24UnormS8Uint)?;
    context.set_framebuffer_state(FramebufferState::new(&[cbuf], Some(zsbuf))?)?;

    let bounds = RectI::new(Vector2I::zero(), vec2i(size as i32, size as i32));
    context.set_viewport(Viewport::from_rect(bounds))?;
    context.set_depth_stencil_state(DepthStencilState {
        depth_enabled: true,
        depth_write: true,
        depth_func: CompareFunc::Less,
        ..DepthStencilState::default()
    });

    let mut bytes = vec![0; TRIANGLES.len() * VERTEX_STRIDE];
    for (vertex, &(position, rgba)) in bytes.chunks_mut(VERTEX_STRIDE).zip(TRIANGLES.iter()) {
        LittleEndian::write_f32_into(&position, &mut vertex[0..12]);
        vertex[12..16].copy_from_slice(&rgba);
    }
    let buffer = screen.create_buffer(bytes.len(), BindFlags::VERTEX_BUFFER)?;
    context.buffer_write(&buffer, 0, &bytes)?;
    context.set_vertex_elements(&[
        VertexElement { src_offset: 0, buffer_index: 0, format: VertexFormat::Float32x3 },
        VertexElement { src_offset: 12, buffer_index: 0, format: VertexFormat::Unorm8x4 },
    ])?;
    context.set_vertex_buffers(&[Some(VertexBufferBinding {
        buffer,
        stride: VERTEX_STRIDE as u32,
        offset: 0,
    })])?;
    context.bind_vs(Some(Arc::new(Shader::new(ShaderStage::Vertex, vec![0x10, 0x11, 0x12]))))?;
    context.bind_fs(Some(Arc::new(Shader::new(ShaderStage::Fragment, vec![0x20, 0x21]))))?;

    let clear = ClearValue { color: BACKGROUND, depth: 1.0, stencil: 0 };
    context.clear(ClearFlags::COLOR | ClearFlags::DEPTH_STENCIL, &clear)?;
    context.draw(&DrawInfo::arrays(PrimitiveTopology::TriangleList, 0, TRIANGLES.len() as u32))?;
    debug!("frame of {}x{} recorded", size, size);
    Ok(color)
}
