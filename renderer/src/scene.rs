// gallium/renderer/src/scene.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The binned work of one framebuffer binding, waiting for the tile pass.
//!
//! Every tile records how each bound surface gets its initial content (loaded from the texture
//! or cleared to a value) and an ordered list of commands.

use crate::cso::{BlendState, ClearFlags, ClearValue, DepthStencilState, FramebufferState};
use crate::cso::MAX_COLOR_BUFFERS;
use crate::setup::TriangleDescriptor;
use crate::shader::CpuProgram;
use crate::tile_map::DenseTileMap;
use crate::tiles;
use gallium_geometry::rect::RectI;
use gallium_gpu::resource::{Surface, Texture};
use gallium_gpu::Winsys;
use smallvec::SmallVec;
use std::sync::Arc;

/// The slot of the depth-stencil buffer. Color buffers use slots `0..MAX_COLOR_BUFFERS`.
pub const ZS_SLOT: usize = MAX_COLOR_BUFFERS;
pub const SLOT_COUNT: usize = MAX_COLOR_BUFFERS + 1;

/// How a tile's copy of one surface is initialized.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BeginOp {
    Load,
    Clear(ClearValue),
}

/// The state a batch of triangles is shaded with, shared by every tile they touch.
pub struct DrawState {
    pub program: Arc<dyn CpuProgram>,
    pub constants: Vec<[f32; 4]>,
    pub depth_stencil: DepthStencilState,
    pub stencil_ref: [u8; 2],
    pub blend: BlendState,
    pub blend_color: [f32; 4],
}

#[derive(Clone)]
pub enum TileCommand {
    Triangle { triangle: Arc<TriangleDescriptor>, draw: Arc<DrawState> },
    ClearRect { slot: usize, rect: RectI, flags: ClearFlags, value: ClearValue },
}

#[derive(Clone)]
pub struct SceneTile {
    pub begin: [BeginOp; SLOT_COUNT],
    pub commands: SmallVec<[TileCommand; 4]>,
}

impl Default for SceneTile {
    fn default() -> SceneTile {
        SceneTile { begin: [BeginOp::Load; SLOT_COUNT], commands: SmallVec::new() }
    }
}

impl SceneTile {
    /// True if the tile pass has nothing to do here.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.commands.is_empty() && self.begin.iter().all(|begin| *begin == BeginOp::Load)
    }

    #[inline]
    fn has_triangles(&self) -> bool {
        self.commands.iter().any(|command| match *command {
            TileCommand::Triangle { .. } => true,
            TileCommand::ClearRect { .. } => false,
        })
    }
}

pub struct Scene<W> where W: Winsys {
    framebuffer: FramebufferState<W>,
    tiles: DenseTileMap<SceneTile>,
}

impl<W> Scene<W> where W: Winsys {
    pub fn new(framebuffer: FramebufferState<W>) -> Scene<W> {
        let rect = tiles::framebuffer_tile_rect(framebuffer.width, framebuffer.height);
        let tiles = DenseTileMap::from_builder(|_| SceneTile::default(), rect);
        Scene { framebuffer, tiles }
    }

    #[inline]
    pub fn framebuffer(&self) -> &FramebufferState<W> {
        &self.framebuffer
    }

    #[inline]
    pub fn tiles(&self) -> &DenseTileMap<SceneTile> {
        &self.tiles
    }

    #[inline]
    pub fn tiles_mut(&mut self) -> &mut DenseTileMap<SceneTile> {
        &mut self.tiles
    }

    /// True if `framebuffer` binds exactly the surfaces this scene renders to.
    pub fn is_bound_to(&self, framebuffer: &FramebufferState<W>) -> bool {
        let same = |a: &Option<Arc<Surface<W>>>, b: &Option<Arc<Surface<W>>>| match (a, b) {
            (&None, &None) => true,
            (&Some(ref a), &Some(ref b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        let ours = &self.framebuffer;
        ours.width == framebuffer.width && ours.height == framebuffer.height &&
            ours.cbufs.len() == framebuffer.cbufs.len() &&
            ours.cbufs.iter().zip(framebuffer.cbufs.iter()).all(|(a, b)| same(a, b)) &&
            same(&ours.zsbuf, &framebuffer.zsbuf)
    }

    pub fn slot_surface(&self, slot: usize) -> Option<&Arc<Surface<W>>> {
        if slot == ZS_SLOT {
            self.framebuffer.zsbuf.as_ref()
        } else {
            self.framebuffer.cbufs.get(slot).and_then(Option::as_ref)
        }
    }

    pub fn slot_of(&self, surface: &Arc<Surface<W>>) -> Option<usize> {
        (0..SLOT_COUNT).find(|&slot| match self.slot_surface(slot) {
            Some(bound) => Arc::ptr_eq(bound, surface),
            None => false,
        })
    }

    /// One bit per slot with a surface bound.
    pub fn bound_slots(&self) -> u8 {
        (0..SLOT_COUNT).filter(|&slot| self.slot_surface(slot).is_some())
                       .fold(0, |mask, slot| mask | 1 << slot)
    }

    pub fn renders_to(&self, texture: &Arc<Texture<W>>) -> bool {
        self.framebuffer.surfaces().any(|surface| Arc::ptr_eq(surface.texture(), texture))
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.tiles.data.iter().all(SceneTile::is_idle)
    }

    /// Forgets all binned work. The next pass loads whatever the last one stored.
    pub fn reset(&mut self) {
        for tile in &mut self.tiles.data {
            *tile = SceneTile::default();
        }
    }

    /// Records a clear of `rect` in the surface bound to `slot`.
    ///
    /// Tiles entirely inside the clear start from the clear value instead of loading. Tiles
    /// straddling its edge keep loading and clear the covered part afterwards.
    pub fn clear(&mut self, slot: usize, flags: ClearFlags, value: &ClearValue, rect: RectI) {
        let format = match self.slot_surface(slot) {
            Some(surface) => surface.format(),
            None => return,
        };
        let whole_surface = if !format.is_depth_stencil() {
            flags.contains(ClearFlags::COLOR)
        } else if format.has_stencil() {
            flags.contains(ClearFlags::DEPTH_STENCIL)
        } else {
            flags.contains(ClearFlags::DEPTH)
        };
        let rect = match rect.intersection(self.framebuffer.bounds()) {
            Some(rect) => rect,
            None => return,
        };

        let bounds = self.framebuffer.bounds();
        let value = *value;
        self.tiles.for_each_in_rect_mut(tiles::pixel_rect_to_tile_rect(rect), |coords, tile| {
            let tile_rect = match tiles::tile_pixel_rect(coords).intersection(bounds) {
                Some(tile_rect) => tile_rect,
                None => return,
            };
            if whole_surface && rect.contains_rect(tile_rect) {
                if !tile.has_triangles() {
                    tile.commands.retain(|command| match *command {
                        TileCommand::ClearRect { slot: cleared, .. } => cleared != slot,
                        TileCommand::Triangle { .. } => true,
                    });
                    tile.begin[slot] = BeginOp::Clear(value);
                    return;
                }
                tile.commands.push(TileCommand::ClearRect { slot, rect: tile_rect, flags, value });
                return;
            }
            if let Some(covered) = tile_rect.intersection(rect) {
                tile.commands.push(TileCommand::ClearRect { slot, rect: covered, flags, value });
            }
        });
    }
}
