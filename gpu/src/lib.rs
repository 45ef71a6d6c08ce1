// gallium/gpu/src/lib.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The device-wide half of the pipe layer: GPU resources, the host surface cache, and the
//! abstraction over the kernel/host window system that actually owns GPU memory.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod error;
pub mod options;
pub mod ranges;
pub mod reference;
pub mod resource;
pub mod screen;
pub mod surface_cache;

pub use crate::error::{PipeError, PipeResult};

use crate::surface_cache::SurfaceCacheKey;
use std::fmt::Debug;
use std::ops::DerefMut;
use std::time::Duration;

/// The services a host or kernel provides to the pipe layer.
///
/// Everything behind this trait is opaque: buffers are CPU-mappable GPU memory, surfaces are
/// host-side GPU objects identified by a small integer handle, and fences track the completion
/// of submitted command streams.
pub trait Winsys: Send + Sync + 'static {
    type Buffer: Send + Sync;
    type Surface: Clone + PartialEq + Debug + Send + Sync;
    type Fence: Clone + Debug + Send + Sync;
    type Mapping<'a>: DerefMut<Target = [u8]> where Self: 'a;

    fn limits(&self) -> WinsysLimits;

    fn buffer_create(&self, size: usize, usage: BufferUsage) -> PipeResult<Self::Buffer>;
    fn buffer_map<'a>(&'a self, buffer: &'a Self::Buffer) -> PipeResult<Self::Mapping<'a>>;
    fn buffer_unmap<'a>(&'a self, mapping: Self::Mapping<'a>);
    fn buffer_handle(&self, buffer: &Self::Buffer) -> u32;

    fn surface_create(&self, key: &SurfaceCacheKey) -> PipeResult<Self::Surface>;
    fn surface_destroy(&self, surface: Self::Surface);
    fn surface_handle(&self, surface: &Self::Surface) -> u32;

    /// Submits a serialized command stream. Returns a fence if one was requested.
    fn cs_flush(&self, commands: &[u8], want_fence: bool) -> PipeResult<Option<Self::Fence>>;
    fn fence_signalled(&self, fence: &Self::Fence) -> bool;
    /// Waits for the fence. The timeout is advisory.
    fn fence_finish(&self, fence: &Self::Fence, timeout: Option<Duration>) -> bool;
}

/// Hard limits of the host side, queried once per context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WinsysLimits {
    /// The size of one command buffer, in dwords.
    pub max_cmd_dwords: usize,
    /// Bytes of buffer memory a single command buffer may reference.
    pub gtt_bytes: u64,
    /// Bytes of texture memory a single command buffer may reference.
    pub vram_bytes: u64,
}

impl Default for WinsysLimits {
    fn default() -> WinsysLimits {
        WinsysLimits {
            max_cmd_dwords: 16 * 1024,
            gtt_bytes: 256 * 1024 * 1024,
            vram_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// CPU-written staging memory the GPU reads from (a GMR region).
    Staging,
    /// Scratch memory written and read back by the CPU.
    Readback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurfaceFormat {
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    Z32Float,
    Z24UnormS8Uint,
    /// Untyped bytes, for buffer resources.
    Buffer,
}

impl SurfaceFormat {
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            SurfaceFormat::Buffer => 1,
            SurfaceFormat::R8G8B8A8Unorm |
            SurfaceFormat::B8G8R8A8Unorm |
            SurfaceFormat::Z32Float |
            SurfaceFormat::Z24UnormS8Uint => 4,
        }
    }

    #[inline]
    pub fn is_depth_stencil(self) -> bool {
        match self {
            SurfaceFormat::Z32Float | SurfaceFormat::Z24UnormS8Uint => true,
            _ => false,
        }
    }

    #[inline]
    pub fn has_stencil(self) -> bool {
        self == SurfaceFormat::Z24UnormS8Uint
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    Texture1D,
    Texture2D,
    Texture3D,
    Cube,
}

bitflags! {
    /// How a resource may be bound to the pipeline.
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER   = 0x01;
        const INDEX_BUFFER    = 0x02;
        const CONSTANT_BUFFER = 0x04;
        const SAMPLER_VIEW    = 0x08;
        const RENDER_TARGET   = 0x10;
        const DEPTH_STENCIL   = 0x20;
    }
}

bitflags! {
    /// Creation flags of a host surface. Part of the surface cache key.
    pub struct SurfaceFlags: u32 {
        const CUBEMAP        = 0x01;
        const VOLUME         = 0x02;
        const HINT_TEXTURE   = 0x04;
        const HINT_RENDER    = 0x08;
        const HINT_DEPTH     = 0x10;
        const HINT_VERTEX    = 0x20;
        const HINT_INDEX     = 0x40;
        const HINT_CONSTANT  = 0x80;
    }
}

impl SurfaceFlags {
    pub fn from_bind_flags(bind: BindFlags) -> SurfaceFlags {
        let mut flags = SurfaceFlags::empty();
        if bind.contains(BindFlags::SAMPLER_VIEW) {
            flags |= SurfaceFlags::HINT_TEXTURE;
        }
        if bind.contains(BindFlags::RENDER_TARGET) {
            flags |= SurfaceFlags::HINT_RENDER;
        }
        if bind.contains(BindFlags::DEPTH_STENCIL) {
            flags |= SurfaceFlags::HINT_DEPTH;
        }
        if bind.contains(BindFlags::VERTEX_BUFFER) {
            flags |= SurfaceFlags::HINT_VERTEX;
        }
        if bind.contains(BindFlags::INDEX_BUFFER) {
            flags |= SurfaceFlags::HINT_INDEX;
        }
        if bind.contains(BindFlags::CONSTANT_BUFFER) {
            flags |= SurfaceFlags::HINT_CONSTANT;
        }
        flags
    }
}
