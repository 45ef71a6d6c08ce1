// gallium/renderer/src/rasterizer.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The tile pass: turns a binned scene into texels.
//!
//! Each tile that has work is processed independently, on whatever executor the context
//! uses. A tile decodes or clears its working copy of every bound surface, runs its commands
//! in order, and hands the encoded result back; stores are applied afterwards in tile order.

use crate::concurrent::executor::Executor;
use crate::cso::{BlendFactor, BlendFunc, BlendState, ClearFlags, ClearValue, StencilOp};
use crate::cso::MAX_COLOR_BUFFERS;
use crate::lifecycle::TileLifecycle;
use crate::scene::{BeginOp, DrawState, Scene, SceneTile, TileCommand, SLOT_COUNT, ZS_SLOT};
use crate::setup::{TileCoverage, TriangleDescriptor};
use crate::tile_map::DenseTileMap;
use crate::tiles;
use crate::vertex::Attributes;
use byteorder::{ByteOrder, LittleEndian};
use gallium_geometry::rect::RectI;
use gallium_gpu::resource::Surface;
use gallium_gpu::{PipeError, PipeResult, SurfaceFormat, Winsys};
use smallvec::SmallVec;

const Z24_MAX: f32 = 16_777_215.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RasterStats {
    pub triangles_binned: u64,
    pub triangles_culled: u64,
    pub triangles_degenerate: u64,
    /// Surface tiles initialized from texture memory.
    pub tiles_loaded: u64,
    /// Surface tiles initialized from a clear value.
    pub tiles_cleared: u64,
    pub tiles_stored: u64,
    /// Tiles in which at least one triangle was not trivially rejected.
    pub tiles_shaded: u64,
    pub trivially_accepted: u64,
    pub trivially_rejected: u64,
    pub partial: u64,
    pub fragments: u64,
}

impl RasterStats {
    pub fn accumulate(&mut self, other: &RasterStats) {
        self.triangles_binned += other.triangles_binned;
        self.triangles_culled += other.triangles_culled;
        self.triangles_degenerate += other.triangles_degenerate;
        self.tiles_loaded += other.tiles_loaded;
        self.tiles_cleared += other.tiles_cleared;
        self.tiles_stored += other.tiles_stored;
        self.tiles_shaded += other.tiles_shaded;
        self.trivially_accepted += other.trivially_accepted;
        self.trivially_rejected += other.trivially_rejected;
        self.partial += other.partial;
        self.fragments += other.fragments;
    }
}

/// What the tile pass needs to know about one bound surface.
struct SlotTarget {
    format: SurfaceFormat,
    width: usize,
    /// The whole layer, read once if any tile loads it.
    image: Option<Vec<u8>>,
}

/// A tile's working copy of one surface, one entry per pixel of the tile rectangle.
enum TileBuffer {
    Color(Vec<[f32; 4]>),
    DepthStencil { format: SurfaceFormat, depth: Vec<f32>, stencil: Vec<u8> },
}

impl TileBuffer {
    fn cleared(format: SurfaceFormat, len: usize, value: &ClearValue) -> TileBuffer {
        if format.is_depth_stencil() {
            TileBuffer::DepthStencil {
                format,
                depth: vec![quantize_depth(format, value.depth); len],
                stencil: vec![value.stencil; len],
            }
        } else {
            let color = [
                quantize_unorm8(value.color[0]),
                quantize_unorm8(value.color[1]),
                quantize_unorm8(value.color[2]),
                quantize_unorm8(value.color[3]),
            ];
            TileBuffer::Color(vec![color; len])
        }
    }

    fn load(target: &SlotTarget, rect: RectI) -> PipeResult<TileBuffer> {
        let image = match target.image {
            Some(ref image) => image,
            None => return Err(PipeError::Fatal("tile load without a surface snapshot")),
        };
        let bpp = target.format.bytes_per_pixel();
        let texels = (rect.min_y()..rect.max_y()).flat_map(|y| {
            (rect.min_x()..rect.max_x()).map(move |x| {
                let offset = (y as usize * target.width + x as usize) * bpp;
                &image[offset..(offset + bpp)]
            })
        });
        if !target.format.is_depth_stencil() {
            return Ok(TileBuffer::Color(texels.map(|texel| {
                decode_color(target.format, texel)
            }).collect()));
        }
        let (depth, stencil) = texels.map(|texel| decode_depth_stencil(target.format, texel))
                                     .unzip();
        Ok(TileBuffer::DepthStencil { format: target.format, depth, stencil })
    }

    /// Clears the part of `clear_rect` inside the tile covering `tile_rect`.
    fn clear_rect(&mut self,
                  tile_rect: RectI,
                  clear_rect: RectI,
                  flags: ClearFlags,
                  value: &ClearValue) {
        let area = match tile_rect.intersection(clear_rect) {
            Some(area) => area,
            None => return,
        };
        let color = [
            quantize_unorm8(value.color[0]),
            quantize_unorm8(value.color[1]),
            quantize_unorm8(value.color[2]),
            quantize_unorm8(value.color[3]),
        ];
        for y in area.min_y()..area.max_y() {
            for x in area.min_x()..area.max_x() {
                let index = tile_index(tile_rect, x, y);
                match *self {
                    TileBuffer::Color(ref mut colors) => {
                        if flags.contains(ClearFlags::COLOR) {
                            colors[index] = color;
                        }
                    }
                    TileBuffer::DepthStencil { format, ref mut depth, ref mut stencil } => {
                        if flags.contains(ClearFlags::DEPTH) {
                            depth[index] = quantize_depth(format, value.depth);
                        }
                        if flags.contains(ClearFlags::STENCIL) && format.has_stencil() {
                            stencil[index] = value.stencil;
                        }
                    }
                }
            }
        }
    }

    /// Tightly packed texels in `format`.
    fn encode(&self, format: SurfaceFormat) -> Vec<u8> {
        let bpp = format.bytes_per_pixel();
        match *self {
            TileBuffer::Color(ref colors) => {
                let mut data = vec![0; colors.len() * bpp];
                for (texel, color) in data.chunks_mut(bpp).zip(colors.iter()) {
                    encode_color(format, *color, texel);
                }
                data
            }
            TileBuffer::DepthStencil { ref depth, ref stencil, .. } => {
                let mut data = vec![0; depth.len() * bpp];
                for (texel, (&depth, &stencil)) in data.chunks_mut(bpp)
                                                       .zip(depth.iter().zip(stencil.iter())) {
                    encode_depth_stencil(format, depth, stencil, texel);
                }
                data
            }
        }
    }
}

struct TileOutput {
    rect: RectI,
    stores: SmallVec<[(usize, Vec<u8>); SLOT_COUNT]>,
    stats: RasterStats,
}

/// Scratch registers reused across the fragments of a tile.
#[derive(Default)]
struct ShadeScratch {
    inputs: Attributes,
    outputs: Attributes,
}

/// Runs the tile pass over every tile of `scene` with work in it and writes the results to the
/// bound textures.
pub fn rasterize_scene<W, E>(scene: &Scene<W>, executor: &E, stats: &mut RasterStats)
                             -> PipeResult<()>
                             where W: Winsys, E: Executor {
    let tiles = scene.tiles();
    let active: Vec<usize> = (0..tiles.len()).filter(|&index| !tiles.data[index].is_idle())
                                             .collect();
    if active.is_empty() {
        return Ok(());
    }

    let mut targets: SmallVec<[Option<SlotTarget>; SLOT_COUNT]> = SmallVec::new();
    for slot in 0..SLOT_COUNT {
        let surface = match scene.slot_surface(slot) {
            Some(surface) => surface,
            None => {
                targets.push(None);
                continue;
            }
        };
        let loads = active.iter().any(|&index| tiles.data[index].begin[slot] == BeginOp::Load);
        let image = if loads {
            Some(surface.texture().read_layer(surface.layer(), surface.level())?)
        } else {
            None
        };
        targets.push(Some(SlotTarget {
            format: surface.format(),
            width: surface.width() as usize,
            image,
        }));
    }

    let bounds = scene.framebuffer().bounds();
    let bound = scene.bound_slots();
    let targets = &targets[..];
    let active = &active[..];
    let outputs = executor.build_vector(active.len(), |job| {
        rasterize_tile(tiles, active[job], targets, bounds, bound)
    });

    for output in outputs {
        let output = output?;
        for &(slot, ref data) in &output.stores {
            if let Some(surface) = scene.slot_surface(slot) {
                let texture = surface.texture();
                texture.write_region(surface.layer(), surface.level(), output.rect, data)?;
            }
        }
        stats.accumulate(&output.stats);
    }
    debug!("tile pass over {} of {} tiles", active.len(), tiles.len());
    Ok(())
}

fn rasterize_tile(tiles: &DenseTileMap<SceneTile>,
                  index: usize,
                  targets: &[Option<SlotTarget>],
                  bounds: RectI,
                  bound: u8)
                  -> PipeResult<TileOutput> {
    let tile = &tiles.data[index];
    let tile_origin = tiles::tile_pixel_rect(tiles.index_to_coords(index));
    let rect = match tile_origin.intersection(bounds) {
        Some(rect) => rect,
        None => return Err(PipeError::Fatal("tile outside the framebuffer")),
    };

    let mut stats = RasterStats::default();
    let mut lifecycle = TileLifecycle::new(bound);
    lifecycle.start()?;

    let mut buffers: SmallVec<[Option<TileBuffer>; SLOT_COUNT]> = SmallVec::new();
    for (slot, target) in targets.iter().enumerate() {
        let target = match *target {
            Some(ref target) => target,
            None => {
                buffers.push(None);
                continue;
            }
        };
        let buffer = match tile.begin[slot] {
            BeginOp::Load => {
                lifecycle.load(slot)?;
                stats.tiles_loaded += 1;
                TileBuffer::load(target, rect)?
            }
            BeginOp::Clear(ref value) => {
                lifecycle.clear(slot)?;
                stats.tiles_cleared += 1;
                TileBuffer::cleared(target.format, rect.area() as usize, value)
            }
        };
        buffers.push(Some(buffer));
    }

    let mut scratch = ShadeScratch::default();
    let mut shaded = false;
    for command in &tile.commands {
        lifecycle.shade()?;
        match *command {
            TileCommand::Triangle { ref triangle, ref draw } => {
                let test_pixels = match triangle.classify(tile_origin.origin()) {
                    TileCoverage::Reject => {
                        stats.trivially_rejected += 1;
                        continue;
                    }
                    TileCoverage::Accept => {
                        stats.trivially_accepted += 1;
                        false
                    }
                    TileCoverage::Partial => {
                        stats.partial += 1;
                        true
                    }
                };
                stats.fragments += shade_triangle(triangle,
                                                  draw,
                                                  rect,
                                                  test_pixels,
                                                  &mut buffers,
                                                  &mut scratch);
                shaded = true;
            }
            TileCommand::ClearRect { slot, rect: clear_rect, flags, ref value } => {
                if let Some(&mut Some(ref mut buffer)) = buffers.get_mut(slot) {
                    buffer.clear_rect(rect, clear_rect, flags, value);
                }
            }
        }
    }
    if shaded {
        stats.tiles_shaded += 1;
    }

    lifecycle.store()?;
    let mut stores = SmallVec::new();
    for (slot, (buffer, target)) in buffers.iter().zip(targets.iter()).enumerate() {
        if let (&Some(ref buffer), &Some(ref target)) = (buffer, target) {
            stores.push((slot, buffer.encode(target.format)));
            stats.tiles_stored += 1;
        }
    }
    Ok(TileOutput { rect, stores, stats })
}

/// Shades the pixels of `rect` the triangle covers. Returns the number of fragments written.
fn shade_triangle(triangle: &TriangleDescriptor,
                  draw: &DrawState,
                  rect: RectI,
                  test_pixels: bool,
                  buffers: &mut [Option<TileBuffer>],
                  scratch: &mut ShadeScratch)
                  -> u64 {
    let area = match rect.intersection(triangle.bounds) {
        Some(area) => area,
        None => return 0,
    };
    let num_outputs = draw.program.num_outputs().max(1);
    let mut written = 0;
    for y in area.min_y()..area.max_y() {
        for x in area.min_x()..area.max_x() {
            if test_pixels && !triangle.covers(x, y) {
                continue;
            }
            triangle.inputs.interpolate(x, y, &mut scratch.inputs);
            scratch.outputs.clear();
            scratch.outputs.resize(num_outputs, [0.0; 4]);
            if !draw.program.run(&scratch.inputs,
                                 &draw.constants,
                                 triangle.front_facing,
                                 &mut scratch.outputs) {
                continue;
            }

            let index = tile_index(rect, x, y);
            if let Some(&mut Some(TileBuffer::DepthStencil {
                format,
                ref mut depth,
                ref mut stencil,
            })) = buffers.get_mut(ZS_SLOT) {
                let z = triangle.inputs.depth(x, y);
                if !depth_stencil_test(draw,
                                       triangle.front_facing,
                                       format,
                                       z,
                                       &mut depth[index],
                                       &mut stencil[index]) {
                    continue;
                }
            }

            for (slot, buffer) in buffers.iter_mut().enumerate().take(MAX_COLOR_BUFFERS) {
                if let Some(TileBuffer::Color(ref mut colors)) = *buffer {
                    let src = scratch.outputs.get(slot).unwrap_or(&scratch.outputs[0]);
                    colors[index] = blend_pixel(&draw.blend, draw.blend_color, *src, colors[index]);
                }
            }
            written += 1;
        }
    }
    written
}

/// Runs the stencil and depth tests for one fragment, updating the stored values.
fn depth_stencil_test(draw: &DrawState,
                      front_facing: bool,
                      format: SurfaceFormat,
                      z: f32,
                      depth: &mut f32,
                      stencil: &mut u8)
                      -> bool {
    let state = &draw.depth_stencil;
    let face = if !front_facing && state.stencil[1].enabled { 1 } else { 0 };
    let (stencil_state, reference) = (&state.stencil[face], draw.stencil_ref[face]);
    let stencil_enabled = stencil_state.enabled && format.has_stencil();
    let update = |stencil: &mut u8, op: StencilOp| {
        let value = op.apply(*stencil, reference);
        *stencil = (*stencil & !stencil_state.write_mask) | (value & stencil_state.write_mask);
    };

    if stencil_enabled {
        let mask = stencil_state.value_mask;
        if !stencil_state.func.test(reference & mask, *stencil & mask) {
            update(stencil, stencil_state.fail_op);
            return false;
        }
    }
    if state.depth_enabled && !state.depth_func.test(z, *depth) {
        if stencil_enabled {
            update(stencil, stencil_state.zfail_op);
        }
        return false;
    }
    if stencil_enabled {
        update(stencil, stencil_state.zpass_op);
    }
    if state.depth_enabled && state.depth_write {
        *depth = quantize_depth(format, z);
    }
    true
}

fn blend_pixel(blend: &BlendState, constant: [f32; 4], src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let src = [clamp_unit(src[0]), clamp_unit(src[1]), clamp_unit(src[2]), clamp_unit(src[3])];
    let mut result = dst;
    for channel in 0..4 {
        if blend.color_mask.bits() & (1 << channel) == 0 {
            continue;
        }
        let value = if !blend.enabled {
            src[channel]
        } else {
            let (func, src_factor, dst_factor) = if channel < 3 {
                (blend.rgb_func, blend.rgb_src, blend.rgb_dst)
            } else {
                (blend.alpha_func, blend.alpha_src, blend.alpha_dst)
            };
            let s = src[channel] * blend_factor(src_factor, channel, src, dst, constant);
            let d = dst[channel] * blend_factor(dst_factor, channel, src, dst, constant);
            match func {
                BlendFunc::Add => s + d,
                BlendFunc::Subtract => s - d,
                BlendFunc::ReverseSubtract => d - s,
                BlendFunc::Min => src[channel].min(dst[channel]),
                BlendFunc::Max => src[channel].max(dst[channel]),
            }
        };
        result[channel] = quantize_unorm8(value);
    }
    result
}

fn blend_factor(factor: BlendFactor,
                channel: usize,
                src: [f32; 4],
                dst: [f32; 4],
                constant: [f32; 4])
                -> f32 {
    match factor {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::SrcColor => src[channel],
        BlendFactor::InvSrcColor => 1.0 - src[channel],
        BlendFactor::SrcAlpha => src[3],
        BlendFactor::InvSrcAlpha => 1.0 - src[3],
        BlendFactor::DstColor => dst[channel],
        BlendFactor::InvDstColor => 1.0 - dst[channel],
        BlendFactor::DstAlpha => dst[3],
        BlendFactor::InvDstAlpha => 1.0 - dst[3],
        BlendFactor::ConstColor => constant[channel],
        BlendFactor::InvConstColor => 1.0 - constant[channel],
    }
}

/// Clears `rect` of a surface the tile pass does not own, directly in texture memory.
pub fn fill_surface_rect<W>(surface: &Surface<W>,
                            flags: ClearFlags,
                            value: &ClearValue,
                            rect: RectI)
                            -> PipeResult<()>
                            where W: Winsys {
    let texture = surface.texture();
    let target = SlotTarget {
        format: surface.format(),
        width: surface.width() as usize,
        image: Some(texture.read_layer(surface.layer(), surface.level())?),
    };
    let mut buffer = TileBuffer::load(&target, rect)?;
    buffer.clear_rect(rect, rect, flags, value);
    texture.write_region(surface.layer(), surface.level(), rect, &buffer.encode(target.format))
}

#[inline]
fn tile_index(rect: RectI, x: i32, y: i32) -> usize {
    (y - rect.min_y()) as usize * rect.width() as usize + (x - rect.min_x()) as usize
}

#[inline]
fn clamp_unit(value: f32) -> f32 {
    value.max(0.0).min(1.0)
}

#[inline]
fn quantize_unorm8(value: f32) -> f32 {
    (clamp_unit(value) * 255.0).round() / 255.0
}

#[inline]
fn quantize_depth(format: SurfaceFormat, depth: f32) -> f32 {
    match format {
        SurfaceFormat::Z24UnormS8Uint => (clamp_unit(depth) * Z24_MAX).round() / Z24_MAX,
        _ => clamp_unit(depth),
    }
}

fn decode_color(format: SurfaceFormat, texel: &[u8]) -> [f32; 4] {
    let unorm = |byte: u8| byte as f32 / 255.0;
    match format {
        SurfaceFormat::B8G8R8A8Unorm => {
            [unorm(texel[2]), unorm(texel[1]), unorm(texel[0]), unorm(texel[3])]
        }
        _ => [unorm(texel[0]), unorm(texel[1]), unorm(texel[2]), unorm(texel[3])],
    }
}

fn encode_color(format: SurfaceFormat, color: [f32; 4], texel: &mut [u8]) {
    let unorm = |value: f32| (clamp_unit(value) * 255.0).round() as u8;
    let bytes = [unorm(color[0]), unorm(color[1]), unorm(color[2]), unorm(color[3])];
    match format {
        SurfaceFormat::B8G8R8A8Unorm => {
            texel.copy_from_slice(&[bytes[2], bytes[1], bytes[0], bytes[3]])
        }
        _ => texel.copy_from_slice(&bytes),
    }
}

fn decode_depth_stencil(format: SurfaceFormat, texel: &[u8]) -> (f32, u8) {
    match format {
        SurfaceFormat::Z24UnormS8Uint => {
            let packed = LittleEndian::read_u32(texel);
            ((packed & 0x00ff_ffff) as f32 / Z24_MAX, (packed >> 24) as u8)
        }
        _ => (LittleEndian::read_f32(texel), 0),
    }
}

fn encode_depth_stencil(format: SurfaceFormat, depth: f32, stencil: u8, texel: &mut [u8]) {
    match format {
        SurfaceFormat::Z24UnormS8Uint => {
            let depth = (clamp_unit(depth) * Z24_MAX).round() as u32;
            LittleEndian::write_u32(texel, depth | (stencil as u32) << 24);
        }
        _ => LittleEndian::write_f32(texel, depth),
    }
}
