// gallium/renderer/src/vertex.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The CPU vertex pipeline: fetch, vertex program, perspective divide, viewport transform and
//! primitive assembly.
//!
//! There is no clipper. Triangles with a vertex at or behind the eye (`w <= 0`) are dropped.

use crate::cso::{DrawInfo, PipeState, PrimitiveTopology, VertexElement, VertexFormat, Viewport};
use crate::shader::CpuProgram;
use byteorder::{ByteOrder, LittleEndian};
use fxhash::FxHashMap;
use gallium_gpu::resource::ResourceId;
use gallium_gpu::{PipeError, PipeResult, Winsys};
use smallvec::SmallVec;

pub type Attributes = SmallVec<[[f32; 4]; 8]>;

#[derive(Clone, Debug, PartialEq)]
pub struct ShadedVertex {
    /// Window-space x, y and z, followed by the clip-space w.
    pub position: [f32; 4],
    /// Everything the vertex program wrote after the position.
    pub varyings: Attributes,
}

impl ShadedVertex {
    #[inline]
    pub fn is_behind_eye(&self) -> bool {
        !(self.position[3] > 0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AssembledTriangle {
    pub vertices: [u32; 3],
    /// The vertex flat-shaded values come from.
    pub provoking: u32,
}

#[derive(Clone, Debug, Default)]
pub struct PrimitiveBatch {
    pub vertices: Vec<ShadedVertex>,
    pub triangles: Vec<AssembledTriangle>,
    /// Triangles dropped for crossing the eye plane.
    pub dropped: u32,
}

struct Stream {
    data: Vec<u8>,
    stride: usize,
    offset: usize,
}

/// Reads vertex attributes out of snapshots of the bound vertex buffers.
pub struct VertexFetcher {
    elements: SmallVec<[VertexElement; 16]>,
    streams: SmallVec<[Option<usize>; 16]>,
    data: Vec<Stream>,
}

impl VertexFetcher {
    pub fn new<W>(state: &PipeState<W>) -> PipeResult<VertexFetcher> where W: Winsys {
        let mut snapshots: SmallVec<[(ResourceId, usize); 4]> = SmallVec::new();
        let mut data: Vec<Stream> = vec![];
        let mut streams = SmallVec::new();
        for binding in &state.vertex_buffers {
            let binding = match *binding {
                None => {
                    streams.push(None);
                    continue;
                }
                Some(ref binding) => binding,
            };
            let id = binding.buffer.id();
            let stride = binding.stride as usize;
            let offset = binding.offset as usize;
            // Buffers bound more than once are copied once per binding layout.
            let found = snapshots.iter().find(|&&(other, index)| {
                other == id && data[index].stride == stride && data[index].offset == offset
            });
            let index = match found {
                Some(&(_, index)) => index,
                None => {
                    let bytes = binding.buffer.read(0, binding.buffer.size())?;
                    data.push(Stream { data: bytes, stride, offset });
                    snapshots.push((id, data.len() - 1));
                    data.len() - 1
                }
            };
            streams.push(Some(index));
        }

        for element in &state.vertex_elements {
            match streams.get(element.buffer_index as usize) {
                Some(Some(_)) => {}
                _ => {
                    return Err(PipeError::bad_input(format!("no vertex buffer bound at {}",
                                                            element.buffer_index)))
                }
            }
        }

        Ok(VertexFetcher { elements: state.vertex_elements.clone(), streams, data })
    }

    #[inline]
    pub fn num_attributes(&self) -> usize {
        self.elements.len()
    }

    /// Fetches every attribute of vertex `index`.
    pub fn fetch(&self, index: u32, out: &mut Attributes) -> PipeResult<()> {
        out.clear();
        for element in &self.elements {
            let stream = match self.streams[element.buffer_index as usize] {
                Some(stream) => &self.data[stream],
                None => return Err(PipeError::bad_input("vertex buffer unbound")),
            };
            let start = stream.offset + index as usize * stream.stride +
                element.src_offset as usize;
            let end = start + element.format.size();
            if end > stream.data.len() {
                return Err(PipeError::bad_input(format!("vertex {} reads past its buffer",
                                                        index)));
            }
            out.push(decode_attribute(element.format, &stream.data[start..end]));
        }
        Ok(())
    }
}

/// Widens one attribute to four floats, filling missing components from `(0, 0, 0, 1)`.
pub fn decode_attribute(format: VertexFormat, bytes: &[u8]) -> [f32; 4] {
    let mut value = [0.0, 0.0, 0.0, 1.0];
    match format {
        VertexFormat::Float32x1 |
        VertexFormat::Float32x2 |
        VertexFormat::Float32x3 |
        VertexFormat::Float32x4 => {
            for (component, chunk) in value.iter_mut().zip(bytes.chunks(4)) {
                *component = LittleEndian::read_f32(chunk);
            }
        }
        VertexFormat::Unorm8x4 => {
            for (component, &byte) in value.iter_mut().zip(bytes.iter()) {
                *component = byte as f32 / 255.0;
            }
        }
        VertexFormat::Snorm16x2 => {
            for (component, chunk) in value.iter_mut().zip(bytes.chunks(2)) {
                *component = f32::max(LittleEndian::read_i16(chunk) as f32 / 32767.0, -1.0);
            }
        }
        VertexFormat::Fixed32x2 => {
            for (component, chunk) in value.iter_mut().zip(bytes.chunks(4)) {
                *component = LittleEndian::read_i32(chunk) as f32 / 65536.0;
            }
        }
    }
    value
}

/// The vertex indices a draw walks, with the index bias applied.
pub fn draw_indices<W>(state: &PipeState<W>, draw: &DrawInfo) -> PipeResult<Vec<u32>>
                       where W: Winsys {
    if !draw.indexed {
        return Ok((draw.start..(draw.start + draw.count)).collect());
    }
    let binding = match state.index_buffer {
        Some(ref binding) => binding,
        None => return Err(PipeError::bad_input("indexed draw without an index buffer")),
    };
    let size = binding.index_size as usize;
    let start = binding.offset as usize + draw.start as usize * size;
    let bytes = binding.buffer.read(start, draw.count as usize * size)?;
    let indices = bytes.chunks(size).map(|chunk| {
        let index = match size {
            2 => LittleEndian::read_u16(chunk) as i64,
            _ => LittleEndian::read_u32(chunk) as i64,
        };
        (index + draw.index_bias as i64).max(0) as u32
    }).collect();
    Ok(indices)
}

pub struct VertexPipeline<'a> {
    pub program: &'a dyn CpuProgram,
    pub constants: &'a [[f32; 4]],
    pub viewport: Viewport,
    pub flatshade_first: bool,
}

impl<'a> VertexPipeline<'a> {
    pub fn run<W>(&self, state: &PipeState<W>, draw: &DrawInfo) -> PipeResult<PrimitiveBatch>
                  where W: Winsys {
        let fetcher = VertexFetcher::new(state)?;
        let indices = draw_indices(state, draw)?;

        let mut batch = PrimitiveBatch::default();
        let mut cache: FxHashMap<u32, u32> = FxHashMap::default();
        let mut slots = Vec::with_capacity(indices.len());
        let mut inputs = Attributes::new();
        let mut outputs: Attributes = SmallVec::new();
        for &index in &indices {
            if let Some(&slot) = cache.get(&index) {
                slots.push(slot);
                continue;
            }
            fetcher.fetch(index, &mut inputs)?;
            outputs.clear();
            outputs.resize(self.program.num_outputs().max(1), [0.0; 4]);
            self.program.run(&inputs, self.constants, true, &mut outputs);

            let slot = batch.vertices.len() as u32;
            batch.vertices.push(self.transform(&outputs));
            cache.insert(index, slot);
            slots.push(slot);
        }

        for triangle in assemble(draw.mode, slots.len(), self.flatshade_first) {
            let vertices = [slots[triangle.vertices[0] as usize],
                            slots[triangle.vertices[1] as usize],
                            slots[triangle.vertices[2] as usize]];
            if vertices.iter().any(|&vertex| batch.vertices[vertex as usize].is_behind_eye()) {
                batch.dropped += 1;
                continue;
            }
            let provoking = slots[triangle.provoking as usize];
            batch.triangles.push(AssembledTriangle { vertices, provoking });
        }
        Ok(batch)
    }

    fn transform(&self, outputs: &[[f32; 4]]) -> ShadedVertex {
        let clip = outputs[0];
        let w = clip[3];
        let position = if w > 0.0 {
            let window = self.viewport.apply([clip[0] / w, clip[1] / w, clip[2] / w]);
            [window[0], window[1], window[2], w]
        } else {
            [clip[0], clip[1], clip[2], w]
        };
        ShadedVertex { position, varyings: outputs[1..].iter().cloned().collect() }
    }
}

/// Splits `count` vertices of `mode` into triangles of vertex positions.
///
/// Strips alternate their vertex order so that every triangle keeps the winding of the first.
pub fn assemble(mode: PrimitiveTopology, count: usize, flatshade_first: bool)
                -> Vec<AssembledTriangle> {
    let mut triangles = vec![];
    let mut push = |a: usize, b: usize, c: usize, first: usize, last: usize| {
        let provoking = if flatshade_first { first } else { last };
        triangles.push(AssembledTriangle {
            vertices: [a as u32, b as u32, c as u32],
            provoking: provoking as u32,
        });
    };
    match mode {
        PrimitiveTopology::TriangleList => {
            for base in (0..(count / 3)).map(|triangle| triangle * 3) {
                push(base, base + 1, base + 2, base, base + 2);
            }
        }
        PrimitiveTopology::TriangleStrip => {
            for index in 0..count.saturating_sub(2) {
                if index % 2 == 0 {
                    push(index, index + 1, index + 2, index, index + 2);
                } else {
                    push(index + 1, index, index + 2, index, index + 2);
                }
            }
        }
        PrimitiveTopology::TriangleFan => {
            for index in 1..count.saturating_sub(1) {
                push(0, index, index + 1, index, index + 1);
            }
        }
    }
    triangles
}

#[cfg(test)]
mod test {
    use super::{assemble, decode_attribute, VertexPipeline};
    use crate::cso::{DrawInfo, PipeState, PrimitiveTopology, VertexBufferBinding};
    use crate::cso::{VertexElement, VertexFormat, Viewport};
    use crate::shader::PassthroughProgram;
    use gallium_geometry::rect::RectI;
    use gallium_geometry::vector::vec2i;
    use gallium_gpu::options::DebugOptions;
    use gallium_gpu::screen::Screen;
    use gallium_gpu::BindFlags;
    use gallium_nullws::NullWinsys;

    fn floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|value| value.to_le_bytes().to_vec()).collect()
    }

    #[test]
    fn test_decode_normalized_formats() {
        assert_eq!(decode_attribute(VertexFormat::Unorm8x4, &[255, 0, 51, 255]),
                   [1.0, 0.0, 0.2, 1.0]);
        let snorm = [0x00, 0x80, 0xff, 0x7f];
        assert_eq!(decode_attribute(VertexFormat::Snorm16x2, &snorm), [-1.0, 1.0, 0.0, 1.0]);
        let fixed = (3i32 << 15).to_le_bytes();
        assert_eq!(decode_attribute(VertexFormat::Fixed32x2, &[&fixed[..], &fixed[..]].concat()),
                   [1.5, 1.5, 0.0, 1.0]);
    }

    #[test]
    fn test_strips_keep_winding_and_pick_provoking_vertices() {
        let strip = assemble(PrimitiveTopology::TriangleStrip, 4, false);
        assert_eq!(strip[0].vertices, [0, 1, 2]);
        assert_eq!(strip[1].vertices, [2, 1, 3]);
        assert_eq!(strip[1].provoking, 3);
        let first = assemble(PrimitiveTopology::TriangleStrip, 4, true);
        assert_eq!(first[1].provoking, 1);
        assert_eq!(assemble(PrimitiveTopology::TriangleFan, 5, false).len(), 3);
        assert_eq!(assemble(PrimitiveTopology::TriangleList, 7, false).len(), 2);
    }

    #[test]
    fn test_pipeline_transforms_and_drops_triangles_behind_the_eye() {
        let screen = Screen::new_software(NullWinsys::new(), DebugOptions::default());
        let data = floats(&[
            -1.0, 1.0, 0.0, 1.0,
            1.0, 1.0, 0.0, 1.0,
            -1.0, -1.0, 0.0, 1.0,
            0.0, 0.0, 0.0, -1.0,
        ]);
        let buffer = screen.create_buffer(data.len(), BindFlags::VERTEX_BUFFER).unwrap();
        buffer.write(0, &data).unwrap();

        let mut state: PipeState<NullWinsys> = PipeState::default();
        state.vertex_elements.push(VertexElement {
            src_offset: 0,
            buffer_index: 0,
            format: VertexFormat::Float32x4,
        });
        state.vertex_buffers.push(Some(VertexBufferBinding { buffer, stride: 16, offset: 0 }));

        let pipeline = VertexPipeline {
            program: &PassthroughProgram { num_outputs: 1 },
            constants: &[],
            viewport: Viewport::from_rect(RectI::new(vec2i(0, 0), vec2i(64, 32))),
            flatshade_first: false,
        };
        let draw = DrawInfo::arrays(PrimitiveTopology::TriangleStrip, 0, 4);
        let batch = pipeline.run(&state, &draw).unwrap();
        assert_eq!(batch.vertices[0].position, [0.0, 0.0, 0.5, 1.0]);
        assert_eq!(batch.vertices[2].position, [0.0, 32.0, 0.5, 1.0]);
        assert_eq!(batch.triangles.len(), 1);
        assert_eq!(batch.dropped, 1);
    }
}
