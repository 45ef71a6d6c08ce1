// gallium/renderer/src/hw/emit.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The emitter table shared by the hardware families.
//!
//! The first three entries only derive decisions (software vertex fetch, primitive
//! decomposition, software vertex processing) and dirty the bits that later entries read.

use crate::command::Relocation;
use crate::context::MAX_CONSTANTS;
use crate::cso::{PolygonMode, PrimitiveTopology, StencilState, VertexFormat, Viewport};
use crate::cso::{MAX_COLOR_BUFFERS, MAX_SAMPLERS, MAX_VERTEX_BUFFERS, MAX_VERTEX_ELEMENTS};
use crate::dirty::{DirtyState, StateEngine};
use crate::hw::family::{HwFamily, Packet};
use crate::hw::HwState;
use crate::shader::{ShaderLimits, ShaderStage, ShaderVariant};
use gallium_gpu::resource::SamplerView;
use gallium_gpu::{PipeError, PipeResult, Winsys};
use smallvec::SmallVec;
use std::sync::Arc;

pub(super) const TOPOLOGY_TRIANGLE_LIST: u32 = 4;

/// `[width, height, color buffer count, color handles.., depth-stencil handle]`.
const FRAMEBUFFER_DWORDS: usize = 3 + MAX_COLOR_BUFFERS + 1;

pub(super) fn build_engine<W>(family: &'static HwFamily) -> StateEngine<HwState<W>>
                              where W: Winsys {
    let dwords = |packet, payload| family.packet_dwords(packet, payload) as u32;
    let shader_dwords = 2 + family.shader_limits.max_token_dwords;
    let copy_dwords = dwords(Packet::SurfaceCopy, super::COPY_PAYLOAD_DWORDS);

    let mut engine = StateEngine::new();
    engine.register_emitter("need_swvfetch", DirtyState::VERTEX_ELEMENTS, 0, need_swvfetch::<W>);
    engine.register_emitter("need_pipeline", DirtyState::RASTERIZER, 0, need_pipeline::<W>);
    engine.register_emitter("need_swtnl",
                            DirtyState::NEED_SWVFETCH | DirtyState::NEED_PIPELINE,
                            0,
                            need_swtnl::<W>);
    engine.register_emitter("framebuffer",
                            DirtyState::FRAMEBUFFER,
                            dwords(Packet::Framebuffer, FRAMEBUFFER_DWORDS),
                            emit_framebuffer::<W>);
    engine.register_emitter("viewport",
                            DirtyState::VIEWPORT | DirtyState::NEED_SWTNL,
                            dwords(Packet::Viewport, 6),
                            emit_viewport::<W>);
    engine.register_emitter("scissor",
                            DirtyState::SCISSOR | DirtyState::RASTERIZER | DirtyState::FRAMEBUFFER,
                            dwords(Packet::Scissor, 4),
                            emit_scissor::<W>);
    engine.register_emitter("blend", DirtyState::BLEND, dwords(Packet::Blend, 8), emit_blend::<W>);
    engine.register_emitter("blend_color",
                            DirtyState::BLEND_COLOR,
                            dwords(Packet::BlendColor, 4),
                            emit_blend_color::<W>);
    engine.register_emitter("depth_stencil",
                            DirtyState::DEPTH_STENCIL,
                            dwords(Packet::DepthStencil, 5),
                            emit_depth_stencil::<W>);
    engine.register_emitter("stencil_ref",
                            DirtyState::STENCIL_REF,
                            dwords(Packet::StencilRef, 1),
                            emit_stencil_ref::<W>);
    engine.register_emitter("rasterizer",
                            DirtyState::RASTERIZER,
                            dwords(Packet::Rasterizer, 2),
                            emit_rasterizer::<W>);
    engine.register_emitter("vs",
                            DirtyState::VS | DirtyState::NEED_SWTNL | DirtyState::SAMPLERS,
                            dwords(Packet::VertexShader, shader_dwords),
                            emit_vs::<W>);
    engine.register_emitter("fs",
                            DirtyState::FS | DirtyState::RASTERIZER | DirtyState::SAMPLERS,
                            dwords(Packet::FragmentShader, shader_dwords),
                            emit_fs::<W>);
    engine.register_emitter("constants",
                            DirtyState::VS_CONSTANTS | DirtyState::FS_CONSTANTS,
                            2 * dwords(Packet::Constants, 2 + MAX_CONSTANTS * 4),
                            emit_constants::<W>);
    engine.register_emitter("samplers",
                            DirtyState::SAMPLERS,
                            dwords(Packet::Samplers, 1 + MAX_SAMPLERS),
                            emit_samplers::<W>);
    engine.register_emitter("sampler_views",
                            DirtyState::SAMPLER_VIEWS,
                            dwords(Packet::SamplerView, 1 + MAX_SAMPLERS) +
                                MAX_SAMPLERS as u32 * 2 * copy_dwords,
                            emit_sampler_views::<W>);
    engine.register_emitter("vertex_elements",
                            DirtyState::VERTEX_ELEMENTS | DirtyState::NEED_SWTNL,
                            dwords(Packet::VertexElements, 1 + 3 * MAX_VERTEX_ELEMENTS),
                            emit_vertex_elements::<W>);
    engine.register_emitter("vertex_buffers",
                            DirtyState::VERTEX_BUFFERS | DirtyState::NEED_SWTNL,
                            dwords(Packet::VertexBuffers, 1 + 3 * MAX_VERTEX_BUFFERS),
                            emit_vertex_buffers::<W>);
    engine
}

pub(super) fn topology_code(mode: PrimitiveTopology) -> u32 {
    match mode {
        PrimitiveTopology::TriangleList => TOPOLOGY_TRIANGLE_LIST,
        PrimitiveTopology::TriangleFan => 5,
        PrimitiveTopology::TriangleStrip => 6,
    }
}

pub(super) fn vertex_format_code(format: VertexFormat) -> u32 {
    match format {
        VertexFormat::Float32x1 => 0x1,
        VertexFormat::Float32x2 => 0x2,
        VertexFormat::Float32x3 => 0x3,
        VertexFormat::Float32x4 => 0x4,
        VertexFormat::Unorm8x4 => 0x10,
        VertexFormat::Snorm16x2 => 0x11,
        VertexFormat::Fixed32x2 => 0x20,
    }
}

// Derived decisions

fn need_swvfetch<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let family = hw.family;
    let need = hw.common.state.vertex_elements.iter().any(|element| {
        !family.supports_vertex_format(element.format)
    });
    if need != hw.need_swvfetch {
        debug!("{}: software vertex fetch {}", family.name, if need { "on" } else { "off" });
        hw.need_swvfetch = need;
        hw.common.dirty |= DirtyState::NEED_SWVFETCH;
    }
    Ok(())
}

fn need_pipeline<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let need = hw.common.state.rasterizer.fill != PolygonMode::Fill;
    if need != hw.need_pipeline {
        hw.need_pipeline = need;
        hw.common.dirty |= DirtyState::NEED_PIPELINE;
    }
    Ok(())
}

fn need_swtnl<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let (force, forbid) = {
        let options = hw.common.screen.options();
        (options.force_swtnl, options.no_swtnl)
    };
    let mut need = hw.need_swvfetch || hw.need_pipeline || force;
    if need && forbid {
        warn!("{}: vertices need the software path, but it is disabled", hw.family.name);
        need = false;
    }
    if need != hw.need_swtnl {
        debug!("{}: software vertex processing {}",
               hw.family.name,
               if need { "on" } else { "off" });
        hw.need_swtnl = need;
        hw.common.dirty |= DirtyState::NEED_SWTNL;
    }
    Ok(())
}

// Fixed-function state

fn emit_framebuffer<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let framebuffer = hw.common.state.framebuffer.clone();
    let mut payload = [0; FRAMEBUFFER_DWORDS];
    payload[0] = framebuffer.width;
    payload[1] = framebuffer.height;
    payload[2] = framebuffer.cbufs.len() as u32;
    for (slot, surface) in framebuffer.cbufs.iter().enumerate() {
        if let Some(ref surface) = *surface {
            payload[3 + slot] = hw.surface_handle(surface)?;
        }
    }
    if let Some(ref zsbuf) = framebuffer.zsbuf {
        payload[FRAMEBUFFER_DWORDS - 1] = hw.surface_handle(zsbuf)?;
    }
    hw.write(Packet::Framebuffer, &payload).map(|_| ())
}

fn emit_viewport<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    // Software-transformed vertices arrive in window coordinates.
    let viewport = if hw.need_swtnl { Viewport::identity() } else { hw.common.state.viewport };
    let mut payload = [0; 6];
    for (word, value) in payload.iter_mut().zip(viewport.scale.iter().chain(&viewport.translate)) {
        *word = value.to_bits();
    }
    hw.write(Packet::Viewport, &payload).map(|_| ())
}

fn emit_scissor<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let rect = hw.common.state.clip_rect();
    let payload = [rect.min_x() as u32, rect.min_y() as u32, rect.max_x() as u32,
                   rect.max_y() as u32];
    hw.write(Packet::Scissor, &payload).map(|_| ())
}

fn emit_blend<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let blend = hw.common.state.blend;
    let payload = [
        blend.enabled as u32,
        blend.rgb_func as u32,
        blend.rgb_src as u32,
        blend.rgb_dst as u32,
        blend.alpha_func as u32,
        blend.alpha_src as u32,
        blend.alpha_dst as u32,
        blend.color_mask.bits() as u32,
    ];
    hw.write(Packet::Blend, &payload).map(|_| ())
}

fn emit_blend_color<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let color = hw.common.state.blend_color;
    let payload = [color[0].to_bits(), color[1].to_bits(), color[2].to_bits(), color[3].to_bits()];
    hw.write(Packet::BlendColor, &payload).map(|_| ())
}

fn stencil_words(stencil: &StencilState) -> [u32; 2] {
    [
        stencil.enabled as u32 | (stencil.func as u32) << 4 | (stencil.fail_op as u32) << 8 |
            (stencil.zfail_op as u32) << 12 | (stencil.zpass_op as u32) << 16,
        stencil.value_mask as u32 | (stencil.write_mask as u32) << 8,
    ]
}

fn emit_depth_stencil<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let state = hw.common.state.depth_stencil;
    let front = stencil_words(&state.stencil[0]);
    let back = stencil_words(&state.stencil[1]);
    let depth = state.depth_enabled as u32 | (state.depth_write as u32) << 1 |
        (state.depth_func as u32) << 4;
    hw.write(Packet::DepthStencil, &[depth, front[0], front[1], back[0], back[1]]).map(|_| ())
}

fn emit_stencil_ref<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let stencil_ref = hw.common.state.stencil_ref;
    let payload = [stencil_ref[0] as u32 | (stencil_ref[1] as u32) << 8];
    hw.write(Packet::StencilRef, &payload).map(|_| ())
}

fn emit_rasterizer<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let state = hw.common.state.rasterizer;
    let flags = state.cull as u32 | (state.front_ccw as u32) << 2 | (state.fill as u32) << 3 |
        (state.flat_shade as u32) << 4 | (state.flatshade_first as u32) << 5 |
        (state.light_twoside as u32) << 6 | (state.perspective_correct as u32) << 7 |
        (state.scissor as u32) << 8;
    hw.write(Packet::Rasterizer, &[flags, state.sprite_coord_enable as u32]).map(|_| ())
}

// Shaders

fn write_shader<W>(hw: &mut HwState<W>, packet: Packet, variant: &ShaderVariant)
                   -> PipeResult<()>
                   where W: Winsys {
    let tokens = variant.tokens();
    let mut payload = Vec::with_capacity(2 + tokens.len());
    payload.push(variant.id() as u32);
    payload.push(tokens.len() as u32);
    payload.extend_from_slice(tokens);
    hw.write(packet, &payload).map(|_| ())
}

fn emit_vs<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let shader = match hw.common.state.vs {
        Some(ref shader) => shader.clone(),
        None => return Ok(()),
    };
    let compiler = hw.common.compiler.clone();
    let variant = if hw.need_swtnl {
        let key = hw.common.compile_key(ShaderStage::Vertex, true);
        let program = shader.get_or_compile(&*compiler, &key, &ShaderLimits::unlimited());
        let num_outputs = program.cpu_program().map_or(1, |program| program.num_outputs());
        hw.swtnl_vs = Some(program);
        hw.passthrough_vs(num_outputs)
    } else {
        hw.swtnl_vs = None;
        let key = hw.common.compile_key(ShaderStage::Vertex, false);
        shader.get_or_compile(&*compiler, &key, &hw.family.shader_limits)
    };
    hw.vs_variant = Some(variant.clone());

    if hw.shadow.vs == Some(variant.id()) {
        return Ok(());
    }
    write_shader(hw, Packet::VertexShader, &variant)?;
    hw.shadow.vs = Some(variant.id());
    Ok(())
}

fn emit_fs<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let shader = match hw.common.state.fs {
        Some(ref shader) => shader.clone(),
        None => return Ok(()),
    };
    let key = hw.common.compile_key(ShaderStage::Fragment, false);
    let variant = shader.get_or_compile(&*hw.common.compiler, &key, &hw.family.shader_limits);
    hw.fs_variant = Some(variant.clone());

    if hw.shadow.fs == Some(variant.id()) {
        debug!("fragment shader variant {} already bound", variant.id());
        return Ok(());
    }
    write_shader(hw, Packet::FragmentShader, &variant)?;
    hw.shadow.fs = Some(variant.id());
    Ok(())
}

fn emit_constants<W>(hw: &mut HwState<W>, dirty: DirtyState) -> PipeResult<()> where W: Winsys {
    for &(stage, bit) in &[(0, DirtyState::VS_CONSTANTS), (1, DirtyState::FS_CONSTANTS)] {
        if !dirty.contains(bit) {
            continue;
        }
        let constants = if stage == 0 {
            &hw.common.state.vs_constants
        } else {
            &hw.common.state.fs_constants
        };
        let mut payload = Vec::with_capacity(2 + constants.len() * 4);
        payload.push(stage);
        payload.push(constants.len() as u32);
        payload.extend(constants.iter().flat_map(|constant| constant.iter().map(|v| v.to_bits())));
        hw.write(Packet::Constants, &payload)?;
    }
    Ok(())
}

// Textures

fn emit_samplers<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let mut payload: SmallVec<[u32; 1 + MAX_SAMPLERS]> = SmallVec::new();
    payload.push(hw.common.state.samplers.len() as u32);
    payload.extend(hw.common.state.samplers.iter().map(|sampler| {
        sampler.min_filter as u32 | (sampler.mag_filter as u32) << 2 |
            (sampler.normalized_coords as u32) << 4 | (sampler.compare_enabled as u32) << 5 |
            (sampler.compare_func as u32) << 8
    }));
    hw.write(Packet::Samplers, &payload).map(|_| ())
}

fn emit_sampler_views<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()> where W: Winsys {
    let views: SmallVec<[Option<Arc<SamplerView<W>>>; MAX_SAMPLERS]> =
        hw.common.state.sampler_views.clone();
    let mut payload: SmallVec<[u32; 1 + MAX_SAMPLERS]> = SmallVec::new();
    payload.push(views.len() as u32);
    for view in &views {
        let view = match *view {
            Some(ref view) => view,
            None => {
                payload.push(0);
                continue;
            }
        };
        hw.validate_sampler_view(view)?;
        hw.cs.add_relocation(Relocation::SamplerView(view.clone()))?;
        let handle = view.host_handle().ok_or(PipeError::Fatal("sampler view without storage"))?;
        payload.push(handle);
    }
    hw.write(Packet::SamplerView, &payload).map(|_| ())
}

// Vertex arrays

fn emit_vertex_elements<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()>
                           where W: Winsys {
    // Software vertices bring their own layout; inline families declare it per draw.
    if hw.need_swtnl || hw.family.inline_vertex_arrays {
        return Ok(());
    }
    let elements = &hw.common.state.vertex_elements;
    let mut payload: SmallVec<[u32; 64]> = SmallVec::new();
    payload.push(elements.len() as u32);
    for element in elements {
        payload.extend_from_slice(&[element.src_offset,
                                    element.buffer_index,
                                    vertex_format_code(element.format)]);
    }
    hw.write(Packet::VertexElements, &payload).map(|_| ())
}

fn emit_vertex_buffers<W>(hw: &mut HwState<W>, _: DirtyState) -> PipeResult<()>
                          where W: Winsys {
    if hw.need_swtnl {
        return Ok(());
    }
    let bindings = hw.common.state.vertex_buffers.clone();
    let mut arrays: SmallVec<[[u32; 3]; MAX_VERTEX_ELEMENTS]> = SmallVec::new();
    for binding in &bindings {
        match *binding {
            Some(ref binding) => {
                let handle = hw.resolve_buffer(&binding.buffer)?;
                arrays.push([handle, binding.offset, binding.stride]);
            }
            None => arrays.push([0; 3]),
        }
    }

    if !hw.family.inline_vertex_arrays {
        let mut payload: SmallVec<[u32; 64]> = SmallVec::new();
        payload.push(arrays.len() as u32);
        for array in &arrays {
            payload.extend_from_slice(array);
        }
        hw.write(Packet::VertexBuffers, &payload)?;
    }
    hw.vertex_arrays = arrays;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::build_engine;
    use crate::hw::family::SVGA;
    use crate::hw::HwState;
    use gallium_nullws::NullWinsys;

    #[test]
    fn test_derived_decisions_run_before_the_state_they_affect() {
        let engine = build_engine::<NullWinsys>(&SVGA);
        let names: Vec<_> = engine.emitters().iter().map(|emitter| emitter.name).collect();
        assert_eq!(names, vec![
            "need_swvfetch", "need_pipeline", "need_swtnl", "framebuffer", "viewport", "scissor",
            "blend", "blend_color", "depth_stencil", "stencil_ref", "rasterizer", "vs", "fs",
            "constants", "samplers", "sampler_views", "vertex_elements", "vertex_buffers",
        ]);
        let _: Option<HwState<NullWinsys>> = None;
    }
}
