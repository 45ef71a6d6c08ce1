// gallium/renderer/src/tiler.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Assigns set-up triangles to the tiles their bounding boxes touch.
//!
//! Classification against each tile happens later, in the tile pass. Triangles are appended
//! to each tile's command list, so every tile shades them in submission order.

use crate::scene::{DrawState, Scene, TileCommand};
use crate::setup::TriangleDescriptor;
use crate::tiles;
use gallium_gpu::Winsys;
use std::sync::Arc;

/// Bins `triangle` into `scene`. Returns the number of tiles it was added to.
pub fn bin_triangle<W>(scene: &mut Scene<W>, triangle: TriangleDescriptor, draw: &Arc<DrawState>)
                       -> u32
                       where W: Winsys {
    let tile_rect = tiles::pixel_rect_to_tile_rect(triangle.bounds);
    let triangle = Arc::new(triangle);
    let mut binned = 0;
    scene.tiles_mut().for_each_in_rect_mut(tile_rect, |_, tile| {
        let (triangle, draw) = (triangle.clone(), draw.clone());
        tile.commands.push(TileCommand::Triangle { triangle, draw });
        binned += 1;
    });
    binned
}

#[cfg(test)]
mod test {
    use super::bin_triangle;
    use crate::cso::{BlendState, DepthStencilState, FramebufferState, RasterizerState};
    use crate::scene::{DrawState, Scene, TileCommand};
    use crate::setup::{setup_triangle, Setup};
    use crate::shader::ConstantColorProgram;
    use crate::vertex::{Attributes, ShadedVertex};
    use gallium_geometry::rect::RectI;
    use gallium_geometry::vector::vec2i;
    use gallium_gpu::options::DebugOptions;
    use gallium_gpu::resource::{Surface, TextureDesc};
    use gallium_gpu::screen::Screen;
    use gallium_gpu::{BindFlags, SurfaceFormat};
    use gallium_nullws::NullWinsys;
    use quickcheck;
    use std::sync::Arc;

    fn scene() -> Scene<NullWinsys> {
        let screen = Screen::new_software(NullWinsys::new(), DebugOptions::default());
        let desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                       256,
                                       256,
                                       1,
                                       BindFlags::RENDER_TARGET);
        let texture = screen.create_texture(desc).unwrap();
        let cbuf = Arc::new(Surface::new(texture, 0, 0, SurfaceFormat::R8G8B8A8Unorm, None));
        Scene::new(FramebufferState::new(&[cbuf], None).unwrap())
    }

    fn draw_state() -> Arc<DrawState> {
        Arc::new(DrawState {
            program: Arc::new(ConstantColorProgram { color: [1.0; 4] }),
            constants: vec![],
            depth_stencil: DepthStencilState::default(),
            stencil_ref: [0; 2],
            blend: BlendState::default(),
            blend_color: [0.0; 4],
        })
    }

    fn vertex(x: f32, y: f32) -> ShadedVertex {
        ShadedVertex { position: [x, y, 0.5, 1.0], varyings: Attributes::new() }
    }

    fn binned_tiles(scene: &Scene<NullWinsys>) -> usize {
        scene.tiles().data.iter().filter(|tile| !tile.commands.is_empty()).count()
    }

    #[test]
    fn test_triangle_lands_in_every_tile_of_its_bounds() {
        let mut scene = scene();
        let (a, b, c) = (vertex(10.0, 10.0), vertex(150.0, 20.0), vertex(20.0, 70.0));
        let clip = scene.framebuffer().bounds();
        let triangle = match setup_triangle([&a, &b, &c], &c, &RasterizerState::default(), clip) {
            Setup::Triangle(triangle) => triangle,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(bin_triangle(&mut scene, triangle, &draw_state()), 6);
        assert_eq!(binned_tiles(&scene), 6);
        assert!(scene.tiles().get(vec2i(3, 0)).unwrap().commands.is_empty());
    }

    #[test]
    fn test_tiles_keep_submission_order() {
        let mut scene = scene();
        let clip = scene.framebuffer().bounds();
        let (a, b, c) = (vertex(0.0, 0.0), vertex(100.0, 0.0), vertex(0.0, 100.0));
        let (d, e, f) = (vertex(120.0, 120.0), vertex(10.0, 120.0), vertex(120.0, 10.0));
        let state = RasterizerState::default();
        let mut bounds = vec![];
        for &(p, q, r) in &[(&a, &b, &c), (&d, &e, &f)] {
            if let Setup::Triangle(triangle) = setup_triangle([p, q, r], r, &state, clip) {
                bounds.push(triangle.bounds);
                bin_triangle(&mut scene, triangle, &draw_state());
            }
        }
        assert_eq!(bounds.len(), 2);
        assert_eq!(binned_tiles(&scene), 4);
        for tile in scene.tiles().data.iter().filter(|tile| !tile.commands.is_empty()) {
            let order: Vec<_> = tile.commands.iter().map(|command| match *command {
                TileCommand::Triangle { ref triangle, .. } => triangle.bounds,
                TileCommand::ClearRect { rect, .. } => rect,
            }).collect();
            assert_eq!(order, bounds);
        }
    }

    #[test]
    fn test_degenerate_triangles_bin_nothing() {
        // Coordinates are exact multiples of a subpixel, so snapping keeps them collinear.
        fn prop_collinear_triangles_bin_nothing(x0: u16, y0: u16, dx: i8, dy: i8, k: u8)
                                                -> bool {
            let mut scene = scene();
            let clip = scene.framebuffer().bounds();
            let subpixel = |units: i32| units as f32 / 16.0;
            let (x0, y0) = (1024 + (x0 % 1024) as i32, 1024 + (y0 % 1024) as i32);
            let (dx, dy, k) = (dx as i32, dy as i32, (k % 5) as i32 - 2);
            let a = vertex(subpixel(x0), subpixel(y0));
            let b = vertex(subpixel(x0 + dx), subpixel(y0 + dy));
            let c = vertex(subpixel(x0 + dx * k), subpixel(y0 + dy * k));
            let degenerate = match setup_triangle([&a, &b, &c], &c, &RasterizerState::default(),
                                                  clip) {
                Setup::Degenerate => true,
                Setup::Triangle(triangle) => {
                    bin_triangle(&mut scene, triangle, &draw_state());
                    false
                }
                Setup::Culled => false,
            };
            degenerate && binned_tiles(&scene) == 0
        }
        quickcheck::quickcheck(prop_collinear_triangles_bin_nothing
                               as fn(u16, u16, i8, i8, u8) -> bool);
    }

    #[test]
    fn test_coincident_vertices_are_degenerate() {
        let clip = RectI::new(vec2i(0, 0), vec2i(256, 256));
        let a = vertex(100.25, 40.5);
        match setup_triangle([&a, &a, &a], &a, &RasterizerState::default(), clip) {
            Setup::Degenerate => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
