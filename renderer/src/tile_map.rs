// gallium/renderer/src/tile_map.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use gallium_geometry::rect::RectI;
use gallium_geometry::vector::{vec2i, Vector2I};

/// One value per tile of a rectangle of tiles, row-major.
#[derive(Clone, Debug)]
pub struct DenseTileMap<T> {
    pub data: Vec<T>,
    pub rect: RectI,
}

impl<T> DenseTileMap<T> {
    #[inline]
    pub fn from_builder<F>(mut build: F, rect: RectI) -> DenseTileMap<T>
                           where F: FnMut(Vector2I) -> T {
        let mut data = Vec::with_capacity(rect.area() as usize);
        for y in rect.min_y()..rect.max_y() {
            for x in rect.min_x()..rect.max_x() {
                data.push(build(vec2i(x, y)));
            }
        }
        DenseTileMap { data, rect }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn get(&self, coords: Vector2I) -> Option<&T> {
        self.coords_to_index(coords).and_then(|index| self.data.get(index))
    }

    #[inline]
    pub fn get_mut(&mut self, coords: Vector2I) -> Option<&mut T> {
        match self.coords_to_index(coords) {
            None => None,
            Some(index) => self.data.get_mut(index),
        }
    }

    #[inline]
    pub fn coords_to_index(&self, coords: Vector2I) -> Option<usize> {
        if self.rect.contains_point(coords) {
            Some(self.coords_to_index_unchecked(coords))
        } else {
            None
        }
    }

    #[inline]
    pub fn coords_to_index_unchecked(&self, coords: Vector2I) -> usize {
        (coords.y() - self.rect.min_y()) as usize * self.rect.width() as usize
            + (coords.x() - self.rect.min_x()) as usize
    }

    #[inline]
    pub fn index_to_coords(&self, index: usize) -> Vector2I {
        let (width, index) = (self.rect.width(), index as i32);
        self.rect.origin() + vec2i(index % width, index / width)
    }

    /// Visits the tiles of `rect` that lie in the map, in row-major order.
    pub fn for_each_in_rect_mut<F>(&mut self, rect: RectI, mut visit: F)
                                   where F: FnMut(Vector2I, &mut T) {
        let rect = match self.rect.intersection(rect) {
            Some(rect) => rect,
            None => return,
        };
        for y in rect.min_y()..rect.max_y() {
            for x in rect.min_x()..rect.max_x() {
                let coords = vec2i(x, y);
                let index = self.coords_to_index_unchecked(coords);
                visit(coords, &mut self.data[index]);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::DenseTileMap;
    use gallium_geometry::rect::RectI;
    use gallium_geometry::vector::vec2i;

    #[test]
    fn test_indices_round_trip_through_coordinates() {
        let rect = RectI::new(vec2i(2, 3), vec2i(4, 2));
        let map = DenseTileMap::from_builder(|coords| coords.x() * 10 + coords.y(), rect);
        assert_eq!(map.len(), 8);
        assert_eq!(map.get(vec2i(5, 4)), Some(&54));
        assert_eq!(map.get(vec2i(6, 4)), None);
        assert_eq!(map.index_to_coords(map.coords_to_index(vec2i(3, 4)).unwrap()), vec2i(3, 4));
    }

    #[test]
    fn test_rect_visits_are_clipped_to_the_map() {
        let mut map = DenseTileMap::from_builder(|_| 0, RectI::new(vec2i(0, 0), vec2i(3, 3)));
        map.for_each_in_rect_mut(RectI::from_points(vec2i(-5, 1), vec2i(2, 9)), |_, value| {
            *value += 1
        });
        assert_eq!(map.data, vec![0, 0, 0, 1, 1, 0, 1, 1, 0]);
    }
}
