// gallium/renderer/src/tiles.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tile coordinates.

use gallium_geometry::rect::RectI;
use gallium_geometry::vector::{vec2i, Vector2I};

/// Tiles are square.
pub const TILE_SIZE: i32 = 64;

/// The tiles covering a framebuffer of `width` by `height` pixels.
#[inline]
pub fn framebuffer_tile_rect(width: u32, height: u32) -> RectI {
    pixel_rect_to_tile_rect(RectI::new(Vector2I::zero(), vec2i(width as i32, height as i32)))
}

/// The tiles a pixel rectangle touches.
#[inline]
pub fn pixel_rect_to_tile_rect(rect: RectI) -> RectI {
    if rect.is_empty() {
        return RectI::default();
    }
    RectI::from_points(rect.origin().div_floor(TILE_SIZE), rect.lower_right().div_ceil(TILE_SIZE))
}

/// The pixels of a tile, not clipped to the framebuffer.
#[inline]
pub fn tile_pixel_rect(coords: Vector2I) -> RectI {
    RectI::new(coords.scale(TILE_SIZE), Vector2I::splat(TILE_SIZE))
}

#[cfg(test)]
mod test {
    use super::{framebuffer_tile_rect, pixel_rect_to_tile_rect, tile_pixel_rect};
    use gallium_geometry::rect::RectI;
    use gallium_geometry::vector::vec2i;

    #[test]
    fn test_partial_tiles_round_up() {
        let tiles = framebuffer_tile_rect(100, 64);
        assert_eq!(tiles.size(), vec2i(2, 1));
        assert_eq!(tile_pixel_rect(vec2i(1, 0)), RectI::new(vec2i(64, 0), vec2i(64, 64)));
        assert!(framebuffer_tile_rect(0, 64).is_empty());
    }

    #[test]
    fn test_pixel_rect_touches_every_overlapped_tile() {
        let rect = RectI::from_points(vec2i(63, 10), vec2i(65, 129));
        assert_eq!(pixel_rect_to_tile_rect(rect), RectI::from_points(vec2i(0, 0), vec2i(2, 3)));
        let exact = RectI::from_points(vec2i(0, 0), vec2i(64, 64));
        assert_eq!(pixel_rect_to_tile_rect(exact), RectI::from_points(vec2i(0, 0), vec2i(1, 1)));
    }
}
