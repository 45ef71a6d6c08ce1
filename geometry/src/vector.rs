// gallium/geometry/src/vector.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Integer 2D vectors.

use std::ops::{Add, Sub};

/// 2D vectors with 32-bit integer coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Vector2I {
    x: i32,
    y: i32,
}

#[inline]
pub fn vec2i(x: i32, y: i32) -> Vector2I {
    Vector2I::new(x, y)
}

impl Vector2I {
    #[inline]
    pub fn new(x: i32, y: i32) -> Vector2I {
        Vector2I { x, y }
    }

    #[inline]
    pub fn zero() -> Vector2I {
        Vector2I::default()
    }

    #[inline]
    pub fn splat(value: i32) -> Vector2I {
        vec2i(value, value)
    }

    #[inline]
    pub fn scale(self, factor: i32) -> Vector2I {
        vec2i(self.x * factor, self.y * factor)
    }

    #[inline]
    pub fn x(self) -> i32 {
        self.x
    }

    #[inline]
    pub fn y(self) -> i32 {
        self.y
    }

    #[inline]
    pub fn min(self, other: Vector2I) -> Vector2I {
        vec2i(self.x.min(other.x), self.y.min(other.y))
    }

    #[inline]
    pub fn max(self, other: Vector2I) -> Vector2I {
        vec2i(self.x.max(other.x), self.y.max(other.y))
    }

    /// Componentwise floor division, rounding toward negative infinity.
    #[inline]
    pub fn div_floor(self, divisor: i32) -> Vector2I {
        vec2i(self.x.div_euclid(divisor), self.y.div_euclid(divisor))
    }

    /// Componentwise ceiling division.
    #[inline]
    pub fn div_ceil(self, divisor: i32) -> Vector2I {
        vec2i(-(-self.x).div_euclid(divisor), -(-self.y).div_euclid(divisor))
    }

    /// The product of the components. Negative extents yield zero.
    #[inline]
    pub fn area(self) -> i32 {
        self.x.max(0) * self.y.max(0)
    }
}

impl Add<Vector2I> for Vector2I {
    type Output = Vector2I;
    #[inline]
    fn add(self, other: Vector2I) -> Vector2I {
        vec2i(self.x + other.x, self.y + other.y)
    }
}

impl Sub<Vector2I> for Vector2I {
    type Output = Vector2I;
    #[inline]
    fn sub(self, other: Vector2I) -> Vector2I {
        vec2i(self.x - other.x, self.y - other.y)
    }
}
