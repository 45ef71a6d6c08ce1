// gallium/renderer/src/hw/family.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-family command encodings and limits.

use crate::command::{CommandBuffer, PacketFormat};
use crate::cso::VertexFormat;
use crate::shader::ShaderLimits;
use gallium_gpu::{PipeResult, Winsys};
use smallvec::SmallVec;

/// Every kind of packet the backends write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Packet {
    Framebuffer = 0,
    Viewport,
    Scissor,
    Blend,
    BlendColor,
    DepthStencil,
    StencilRef,
    Rasterizer,
    VertexShader,
    FragmentShader,
    Constants,
    Samplers,
    SamplerView,
    VertexElements,
    VertexBuffers,
    Draw,
    Clear,
    Upload,
    TextureUpload,
    SurfaceCopy,
}

pub const PACKET_COUNT: usize = 20;

const SET_CONTEXT_REG: u32 = 0x69;
const SET_ALU_CONST: u32 = 0x6a;
const SET_RESOURCE: u32 = 0x6d;
const SET_SAMPLER: u32 = 0x6e;
const DRAW_INDEX_AUTO: u32 = 0x2d;
const CP_DMA: u32 = 0x41;

const SVGA_CMD_SURFACE_COPY: u32 = 1042;
const SVGA_CMD_SURFACE_DMA: u32 = 1044;
const SVGA_CMD_SETRENDERSTATE: u32 = 1049;
const SVGA_CMD_SETRENDERTARGET: u32 = 1050;
const SVGA_CMD_SETTEXTURESTATE: u32 = 1051;
const SVGA_CMD_SETVIEWPORT: u32 = 1055;
const SVGA_CMD_CLEAR: u32 = 1057;
const SVGA_CMD_SET_SHADER: u32 = 1061;
const SVGA_CMD_SET_SHADER_CONST: u32 = 1062;
const SVGA_CMD_DRAW_PRIMITIVES: u32 = 1063;
const SVGA_CMD_SETSCISSORRECT: u32 = 1064;

const ALL_VERTEX_FORMATS_BUT_FIXED: [VertexFormat; 6] = [
    VertexFormat::Float32x1,
    VertexFormat::Float32x2,
    VertexFormat::Float32x3,
    VertexFormat::Float32x4,
    VertexFormat::Unorm8x4,
    VertexFormat::Snorm16x2,
];

const SVGA_VERTEX_FORMATS: [VertexFormat; 5] = [
    VertexFormat::Float32x1,
    VertexFormat::Float32x2,
    VertexFormat::Float32x3,
    VertexFormat::Float32x4,
    VertexFormat::Unorm8x4,
];

pub struct HwFamily {
    pub name: &'static str,
    pub format: PacketFormat,
    /// Opcode of each `Packet`.
    pub opcodes: [u32; PACKET_COUNT],
    /// Register offset prefixed to the payload of register-write packets; zero for none.
    pub registers: [u32; PACKET_COUNT],
    pub shader_limits: ShaderLimits,
    pub native_vertex_formats: &'static [VertexFormat],
    /// Vertex arrays are declared inside the draw packet instead of as separate state.
    pub inline_vertex_arrays: bool,
    /// Upper bound on the dwords of one draw packet.
    pub draw_dwords: u32,
}

pub static R600: HwFamily = HwFamily {
    name: "r600",
    format: PacketFormat::Pkt3,
    opcodes: [
        SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG,
        SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG,
        SET_ALU_CONST, SET_SAMPLER, SET_RESOURCE, SET_CONTEXT_REG, SET_RESOURCE,
        DRAW_INDEX_AUTO, SET_CONTEXT_REG, CP_DMA, CP_DMA, CP_DMA,
    ],
    registers: [
        0x010, 0x10f, 0x090, 0x1e0, 0x105, 0x200, 0x10c, 0x205, 0x216, 0x210,
        0, 0, 0, 0x1a0, 0, 0, 0x00b, 0, 0, 0,
    ],
    shader_limits: ShaderLimits { max_instructions: 1024, max_temps: 124, max_token_dwords: 1024 },
    native_vertex_formats: &ALL_VERTEX_FORMATS_BUT_FIXED,
    inline_vertex_arrays: false,
    draw_dwords: 10,
};

pub static EVERGREEN: HwFamily = HwFamily {
    name: "evergreen",
    format: PacketFormat::Pkt3,
    opcodes: [
        SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG,
        SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG, SET_CONTEXT_REG,
        SET_ALU_CONST, SET_SAMPLER, SET_RESOURCE, SET_CONTEXT_REG, SET_RESOURCE,
        DRAW_INDEX_AUTO, SET_CONTEXT_REG, CP_DMA, CP_DMA, CP_DMA,
    ],
    registers: [
        0x318, 0x10f, 0x090, 0x1e0, 0x105, 0x200, 0x10c, 0x205, 0x217, 0x210,
        0, 0, 0, 0x1a0, 0, 0, 0x00b, 0, 0, 0,
    ],
    shader_limits: ShaderLimits { max_instructions: 2048, max_temps: 124, max_token_dwords: 2048 },
    native_vertex_formats: &ALL_VERTEX_FORMATS_BUT_FIXED,
    inline_vertex_arrays: false,
    draw_dwords: 10,
};

pub static SVGA: HwFamily = HwFamily {
    name: "svga",
    format: PacketFormat::Svga,
    opcodes: [
        SVGA_CMD_SETRENDERTARGET, SVGA_CMD_SETVIEWPORT, SVGA_CMD_SETSCISSORRECT,
        SVGA_CMD_SETRENDERSTATE, SVGA_CMD_SETRENDERSTATE, SVGA_CMD_SETRENDERSTATE,
        SVGA_CMD_SETRENDERSTATE, SVGA_CMD_SETRENDERSTATE, SVGA_CMD_SET_SHADER,
        SVGA_CMD_SET_SHADER, SVGA_CMD_SET_SHADER_CONST, SVGA_CMD_SETTEXTURESTATE,
        SVGA_CMD_SETTEXTURESTATE, SVGA_CMD_DRAW_PRIMITIVES, SVGA_CMD_DRAW_PRIMITIVES,
        SVGA_CMD_DRAW_PRIMITIVES, SVGA_CMD_CLEAR, SVGA_CMD_SURFACE_DMA, SVGA_CMD_SURFACE_DMA,
        SVGA_CMD_SURFACE_COPY,
    ],
    registers: [0; PACKET_COUNT],
    shader_limits: ShaderLimits { max_instructions: 512, max_temps: 32, max_token_dwords: 512 },
    native_vertex_formats: &SVGA_VERTEX_FORMATS,
    inline_vertex_arrays: true,
    draw_dwords: 2 + 7 + 16 * 4,
};

impl HwFamily {
    #[inline]
    pub fn opcode(&self, packet: Packet) -> u32 {
        self.opcodes[packet as usize]
    }

    #[inline]
    pub fn supports_vertex_format(&self, format: VertexFormat) -> bool {
        self.native_vertex_formats.contains(&format)
    }

    /// Dwords of a packet with `payload_dwords` of payload, including any register prefix.
    #[inline]
    pub fn packet_dwords(&self, packet: Packet, payload_dwords: usize) -> usize {
        let prefix = if self.registers[packet as usize] != 0 { 1 } else { 0 };
        self.format.packet_dwords(prefix + payload_dwords)
    }

    /// Writes one packet. Returns the dword offset of `payload` in the buffer.
    pub fn write<W>(&self, cs: &mut CommandBuffer<W>, packet: Packet, payload: &[u32])
                    -> PipeResult<usize>
                    where W: Winsys {
        let register = self.registers[packet as usize];
        if register == 0 {
            return cs.packet(self.opcode(packet), payload);
        }
        let mut words: SmallVec<[u32; 32]> = SmallVec::with_capacity(payload.len() + 1);
        words.push(register);
        words.extend_from_slice(payload);
        Ok(cs.packet(self.opcode(packet), &words)? + 1)
    }

    /// Recognizes a packet written by `write()`.
    pub fn classify(&self, opcode: u32, payload: &[u32]) -> Option<Packet> {
        (0..PACKET_COUNT).map(packet_from_index).find(|&packet| {
            self.opcode(packet) == opcode && match self.registers[packet as usize] {
                0 => true,
                register => payload.first() == Some(&register),
            }
        })
    }
}

fn packet_from_index(index: usize) -> Packet {
    const PACKETS: [Packet; PACKET_COUNT] = [
        Packet::Framebuffer,
        Packet::Viewport,
        Packet::Scissor,
        Packet::Blend,
        Packet::BlendColor,
        Packet::DepthStencil,
        Packet::StencilRef,
        Packet::Rasterizer,
        Packet::VertexShader,
        Packet::FragmentShader,
        Packet::Constants,
        Packet::Samplers,
        Packet::SamplerView,
        Packet::VertexElements,
        Packet::VertexBuffers,
        Packet::Draw,
        Packet::Clear,
        Packet::Upload,
        Packet::TextureUpload,
        Packet::SurfaceCopy,
    ];
    PACKETS[index]
}

#[cfg(test)]
mod test {
    use super::{Packet, R600, SVGA};
    use crate::command::{CommandBuffer, PacketIter};
    use crate::cso::VertexFormat;
    use gallium_gpu::WinsysLimits;
    use gallium_nullws::NullWinsys;

    #[test]
    fn test_register_prefix_identifies_the_state_group() {
        let mut cs: CommandBuffer<NullWinsys> =
            CommandBuffer::new(R600.format, &WinsysLimits::default()).unwrap();
        let offset = R600.write(&mut cs, Packet::FragmentShader, &[7, 8]).unwrap();
        assert_eq!(cs.dwords()[offset], 7);
        let (opcode, payload) = PacketIter::new(R600.format, cs.dwords()).next().unwrap();
        assert_eq!(R600.classify(opcode, payload), Some(Packet::FragmentShader));
        assert_eq!(cs.used(), R600.packet_dwords(Packet::FragmentShader, 2));
    }

    #[test]
    fn test_svga_lacks_snorm16_fetch() {
        assert!(R600.supports_vertex_format(VertexFormat::Snorm16x2));
        assert!(!SVGA.supports_vertex_format(VertexFormat::Snorm16x2));
        assert!(!R600.supports_vertex_format(VertexFormat::Fixed32x2));
    }
}
