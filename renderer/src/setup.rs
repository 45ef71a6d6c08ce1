// gallium/renderer/src/setup.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Triangle setup.
//!
//! Vertex positions are snapped to 1/16 pixel. Each edge gets an integer edge function that is
//! positive inside the triangle when sampled at pixel centers, with the top-left fill rule
//! folded into its constant so that pixels on a shared edge belong to exactly one triangle.
//! Attributes get plane equations evaluated at pixel centers.

use crate::cso::{CullFace, RasterizerState};
use crate::tiles::TILE_SIZE;
use crate::vertex::{Attributes, ShadedVertex};
use gallium_geometry::rect::RectI;
use gallium_geometry::vector::{vec2i, Vector2I};

pub const SUBPIXEL_BITS: u32 = 4;
const SUBPIXEL_ONE: i64 = 1 << SUBPIXEL_BITS;
const HALF_PIXEL: i64 = SUBPIXEL_ONE / 2;

// Keeps every edge-function product inside an i64.
const MAX_COORDINATE: f32 = (1 << 22) as f32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeFunction {
    /// Value at the center of pixel (0, 0), fill-rule bias included.
    pub c: i64,
    /// Change per pixel step in x.
    pub dx: i64,
    /// Change per pixel step in y.
    pub dy: i64,
    /// Added to the value at a tile's first pixel, gives the largest value over the tile.
    pub reject_offset: i64,
    /// Added to the value at a tile's first pixel, gives the smallest value over the tile.
    pub accept_offset: i64,
}

impl EdgeFunction {
    /// The edge from `from` to `to`, in sub-pixel units, for a triangle of positive area.
    fn new(from: [i64; 2], to: [i64; 2]) -> EdgeFunction {
        let a = from[1] - to[1];
        let b = to[0] - from[0];
        let c = from[0] * to[1] - to[0] * from[1];
        let top_left = a > 0 || (a == 0 && b > 0);
        let bias = if top_left { 1 } else { 0 };

        let (dx, dy) = (a * SUBPIXEL_ONE, b * SUBPIXEL_ONE);
        let span = (TILE_SIZE - 1) as i64;
        EdgeFunction {
            c: a * HALF_PIXEL + b * HALF_PIXEL + c + bias,
            dx,
            dy,
            reject_offset: dx.max(0) * span + dy.max(0) * span,
            accept_offset: dx.min(0) * span + dy.min(0) * span,
        }
    }

    #[inline]
    pub fn at(&self, x: i32, y: i32) -> i64 {
        self.c + self.dx * x as i64 + self.dy * y as i64
    }
}

/// `a0 + dadx * x + dady * y`, with `x` and `y` at pixel centers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Plane {
    pub a0: f32,
    pub dadx: f32,
    pub dady: f32,
}

impl Plane {
    #[inline]
    pub fn constant(value: f32) -> Plane {
        Plane { a0: value, dadx: 0.0, dady: 0.0 }
    }

    fn through(points: &[[f32; 2]; 3], values: [f32; 3]) -> Plane {
        let (dx1, dy1) = (points[1][0] - points[0][0], points[1][1] - points[0][1]);
        let (dx2, dy2) = (points[2][0] - points[0][0], points[2][1] - points[0][1]);
        let det = dx1 * dy2 - dx2 * dy1;
        let (dv1, dv2) = (values[1] - values[0], values[2] - values[0]);
        let dadx = (dv1 * dy2 - dv2 * dy1) / det;
        let dady = (dx1 * dv2 - dx2 * dv1) / det;
        Plane { a0: values[0] - dadx * points[0][0] - dady * points[0][1], dadx, dady }
    }

    #[inline]
    pub fn at(&self, x: f32, y: f32) -> f32 {
        self.a0 + self.dadx * x + self.dady * y
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    /// Every fragment gets the provoking vertex's values.
    Constant,
    Linear,
    Perspective,
}

#[derive(Clone, Debug)]
pub struct ShadingInputs {
    pub interpolation: Interpolation,
    /// Window-space depth, always linear.
    pub z: Plane,
    /// `1 / w`, for perspective-correct varyings.
    pub inv_w: Plane,
    /// Per varying and component. Divided by `w` under perspective interpolation.
    pub varyings: Vec<[Plane; 4]>,
}

impl ShadingInputs {
    /// The varyings at the center of pixel (`x`, `y`).
    pub fn interpolate(&self, x: i32, y: i32, out: &mut Attributes) {
        let (x, y) = (x as f32 + 0.5, y as f32 + 0.5);
        let w = match self.interpolation {
            Interpolation::Perspective => {
                let inv_w = self.inv_w.at(x, y);
                if inv_w != 0.0 { 1.0 / inv_w } else { 0.0 }
            }
            Interpolation::Constant | Interpolation::Linear => 1.0,
        };
        out.clear();
        for planes in &self.varyings {
            out.push([
                planes[0].at(x, y) * w,
                planes[1].at(x, y) * w,
                planes[2].at(x, y) * w,
                planes[3].at(x, y) * w,
            ]);
        }
    }

    #[inline]
    pub fn depth(&self, x: i32, y: i32) -> f32 {
        self.z.at(x as f32 + 0.5, y as f32 + 0.5).max(0.0).min(1.0)
    }
}

/// How a triangle relates to a whole tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileCoverage {
    /// No pixel of the tile is inside.
    Reject,
    /// Every pixel of the tile is inside.
    Accept,
    /// Pixels must be tested one by one.
    Partial,
}

/// Everything the tile pass needs to rasterize and shade one triangle.
#[derive(Clone, Debug)]
pub struct TriangleDescriptor {
    pub edges: [EdgeFunction; 3],
    /// The pixels the triangle may touch, already clipped to the framebuffer and scissor.
    pub bounds: RectI,
    pub inputs: ShadingInputs,
    pub front_facing: bool,
}

impl TriangleDescriptor {
    /// Classifies the tile of `TILE_SIZE` pixels whose first pixel is `origin`.
    pub fn classify(&self, origin: Vector2I) -> TileCoverage {
        let mut accepted = 0;
        for edge in &self.edges {
            let value = edge.at(origin.x(), origin.y());
            if value + edge.reject_offset <= 0 {
                return TileCoverage::Reject;
            }
            if value + edge.accept_offset > 0 {
                accepted += 1;
            }
        }
        if accepted == self.edges.len() {
            TileCoverage::Accept
        } else {
            TileCoverage::Partial
        }
    }

    #[inline]
    pub fn covers(&self, x: i32, y: i32) -> bool {
        self.edges.iter().all(|edge| edge.at(x, y) > 0)
    }
}

#[derive(Clone, Debug)]
pub enum Setup {
    Triangle(TriangleDescriptor),
    /// Facing the culled way, off screen, or beyond the coordinate range.
    Culled,
    /// Zero area after snapping.
    Degenerate,
}

pub fn setup_triangle(vertices: [&ShadedVertex; 3],
                      provoking: &ShadedVertex,
                      rasterizer: &RasterizerState,
                      clip: RectI)
                      -> Setup {
    let in_range = vertices.iter().all(|vertex| {
        vertex.position[..2].iter().all(|&coord| coord.abs() < MAX_COORDINATE)
    });
    if !in_range {
        return Setup::Culled;
    }

    let snap = |vertex: &ShadedVertex| {
        [(vertex.position[0] * SUBPIXEL_ONE as f32).round() as i64,
         (vertex.position[1] * SUBPIXEL_ONE as f32).round() as i64]
    };
    let fixed = [snap(vertices[0]), snap(vertices[1]), snap(vertices[2])];
    let area = (fixed[1][0] - fixed[0][0]) * (fixed[2][1] - fixed[0][1]) -
        (fixed[2][0] - fixed[0][0]) * (fixed[1][1] - fixed[0][1]);
    if area == 0 {
        return Setup::Degenerate;
    }

    // Positive area is clockwise on screen, y pointing down.
    let front_facing = (area < 0) == rasterizer.front_ccw;
    let culled = match rasterizer.cull {
        CullFace::None => false,
        CullFace::Front => front_facing,
        CullFace::Back => !front_facing,
    };
    if culled {
        return Setup::Culled;
    }

    let order = if area > 0 { [0, 1, 2] } else { [0, 2, 1] };
    let fixed = [fixed[order[0]], fixed[order[1]], fixed[order[2]]];
    let vertices = [vertices[order[0]], vertices[order[1]], vertices[order[2]]];
    let edges = [
        EdgeFunction::new(fixed[0], fixed[1]),
        EdgeFunction::new(fixed[1], fixed[2]),
        EdgeFunction::new(fixed[2], fixed[0]),
    ];

    let (mut min, mut max) = (fixed[0], fixed[0]);
    for point in &fixed[1..] {
        min = [min[0].min(point[0]), min[1].min(point[1])];
        max = [max[0].max(point[0]), max[1].max(point[1])];
    }
    let min = vec2i(min[0].div_euclid(SUBPIXEL_ONE) as i32, min[1].div_euclid(SUBPIXEL_ONE) as i32);
    let max = vec2i(pixel_ceil(max[0]), pixel_ceil(max[1]));
    let bounds = match RectI::from_points(min, max).intersection(clip) {
        Some(bounds) if !bounds.is_empty() => bounds,
        _ => return Setup::Culled,
    };

    let points = [
        [fixed[0][0] as f32 / SUBPIXEL_ONE as f32, fixed[0][1] as f32 / SUBPIXEL_ONE as f32],
        [fixed[1][0] as f32 / SUBPIXEL_ONE as f32, fixed[1][1] as f32 / SUBPIXEL_ONE as f32],
        [fixed[2][0] as f32 / SUBPIXEL_ONE as f32, fixed[2][1] as f32 / SUBPIXEL_ONE as f32],
    ];
    let inputs = setup_inputs(&points, vertices, provoking, rasterizer);
    Setup::Triangle(TriangleDescriptor { edges, bounds, inputs, front_facing })
}

#[inline]
fn pixel_ceil(coord: i64) -> i32 {
    (coord + SUBPIXEL_ONE - 1).div_euclid(SUBPIXEL_ONE) as i32
}

fn setup_inputs(points: &[[f32; 2]; 3],
                vertices: [&ShadedVertex; 3],
                provoking: &ShadedVertex,
                rasterizer: &RasterizerState)
                -> ShadingInputs {
    let interpolation = if rasterizer.flat_shade {
        Interpolation::Constant
    } else if rasterizer.perspective_correct {
        Interpolation::Perspective
    } else {
        Interpolation::Linear
    };

    let z = Plane::through(points, [vertices[0].position[2],
                                    vertices[1].position[2],
                                    vertices[2].position[2]]);
    let inv_w = Plane::through(points, [1.0 / vertices[0].position[3],
                                        1.0 / vertices[1].position[3],
                                        1.0 / vertices[2].position[3]]);

    let count = vertices.iter().map(|vertex| vertex.varyings.len()).min().unwrap_or(0);
    let mut varyings = Vec::with_capacity(count);
    for varying in 0..count {
        let mut planes = [Plane::default(); 4];
        for (component, plane) in planes.iter_mut().enumerate() {
            *plane = match interpolation {
                Interpolation::Constant => Plane::constant(provoking.varyings[varying][component]),
                Interpolation::Linear | Interpolation::Perspective => {
                    let value = |vertex: &ShadedVertex| {
                        let value = vertex.varyings[varying][component];
                        if interpolation == Interpolation::Perspective {
                            value / vertex.position[3]
                        } else {
                            value
                        }
                    };
                    Plane::through(points, [value(vertices[0]),
                                            value(vertices[1]),
                                            value(vertices[2])])
                }
            };
        }
        varyings.push(planes);
    }
    ShadingInputs { interpolation, z, inv_w, varyings }
}
