// gallium/geometry/src/rect.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! 2D axis-aligned rectangles.
//!
//! Rectangles are half-open: `origin` is inclusive and `lower_right` is exclusive.

use crate::vector::Vector2I;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RectI {
    origin: Vector2I,
    lower_right: Vector2I,
}

impl RectI {
    #[inline]
    pub fn new(origin: Vector2I, size: Vector2I) -> RectI {
        RectI { origin, lower_right: origin + size }
    }

    #[inline]
    pub fn from_points(origin: Vector2I, lower_right: Vector2I) -> RectI {
        RectI { origin, lower_right }
    }

    #[inline]
    pub fn origin(&self) -> Vector2I {
        self.origin
    }

    #[inline]
    pub fn size(&self) -> Vector2I {
        self.lower_right - self.origin
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.lower_right.x() - self.origin.x()
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.lower_right.y() - self.origin.y()
    }

    #[inline]
    pub fn lower_right(&self) -> Vector2I {
        self.lower_right
    }

    #[inline]
    pub fn min_x(self) -> i32 {
        self.origin.x()
    }

    #[inline]
    pub fn min_y(self) -> i32 {
        self.origin.y()
    }

    #[inline]
    pub fn max_x(self) -> i32 {
        self.lower_right.x()
    }

    #[inline]
    pub fn max_y(self) -> i32 {
        self.lower_right.y()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    #[inline]
    pub fn area(&self) -> i32 {
        self.size().area()
    }

    #[inline]
    pub fn contains_point(&self, point: Vector2I) -> bool {
        self.origin.x() <= point.x() && point.x() < self.lower_right.x() &&
            self.origin.y() <= point.y() && point.y() < self.lower_right.y()
    }

    #[inline]
    pub fn contains_rect(&self, other: RectI) -> bool {
        self.origin.x() <= other.origin.x() && self.origin.y() <= other.origin.y() &&
            other.lower_right.x() <= self.lower_right.x() &&
            other.lower_right.y() <= self.lower_right.y()
    }

    #[inline]
    pub fn intersects(&self, other: RectI) -> bool {
        self.origin.x() < other.lower_right.x() && other.origin.x() < self.lower_right.x() &&
            self.origin.y() < other.lower_right.y() && other.origin.y() < self.lower_right.y()
    }

    #[inline]
    pub fn intersection(&self, other: RectI) -> Option<RectI> {
        if !self.intersects(other) {
            None
        } else {
            Some(RectI::from_points(self.origin.max(other.origin),
                                    self.lower_right.min(other.lower_right)))
        }
    }
}
