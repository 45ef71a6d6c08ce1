// gallium/nullws/src/lib.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A winsys that keeps everything in memory.
//!
//! Buffers are plain byte vectors, surfaces are bare handles, and submitted command streams are
//! recorded rather than executed. Fences retire when they are waited on, or all at once through
//! `retire_all()`. Limits are configurable and allocations can be made to fail, which makes this
//! the backend the pipe layer's out-of-memory paths are tested against.

#[macro_use]
extern crate log;

use byteorder::{ByteOrder, LittleEndian};
use fxhash::FxHashMap;
use gallium_gpu::surface_cache::SurfaceCacheKey;
use gallium_gpu::{BufferUsage, PipeError, PipeResult, Winsys, WinsysLimits};
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct NullWinsys {
    limits: WinsysLimits,
    state: Mutex<NullState>,
}

#[derive(Default)]
struct NullState {
    next_handle: u32,
    live_surfaces: FxHashMap<u32, SurfaceCacheKey>,
    surfaces_created: u64,
    surfaces_destroyed: u64,
    bad_destroys: u64,
    buffers_created: u64,
    failing_allocations: u32,
    submissions: Vec<Submission>,
    last_seqno: u64,
    retired_seqno: u64,
}

/// A recorded command stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Submission {
    pub dwords: Vec<u32>,
    pub fence: Option<NullFence>,
}

pub struct NullBuffer {
    handle: u32,
    data: Mutex<Vec<u8>>,
}

pub struct NullMapping<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NullSurface(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NullFence(pub u64);

impl NullWinsys {
    #[inline]
    pub fn new() -> NullWinsys {
        NullWinsys::with_limits(WinsysLimits::default())
    }

    pub fn with_limits(limits: WinsysLimits) -> NullWinsys {
        let state = NullState { next_handle: 1, ..NullState::default() };
        NullWinsys { limits, state: Mutex::new(state) }
    }

    /// Makes the next `count` buffer or surface creations fail.
    pub fn fail_next_allocations(&self, count: u32) {
        self.lock().failing_allocations = count;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }

    pub fn surfaces_created(&self) -> u64 {
        self.lock().surfaces_created
    }

    pub fn surfaces_destroyed(&self) -> u64 {
        self.lock().surfaces_destroyed
    }

    pub fn live_surfaces(&self) -> usize {
        self.lock().live_surfaces.len()
    }

    /// Destroys of handles that were never created or were already destroyed.
    pub fn bad_destroys(&self) -> u64 {
        self.lock().bad_destroys
    }

    pub fn buffers_created(&self) -> u64 {
        self.lock().buffers_created
    }

    /// Marks every submitted stream as complete.
    pub fn retire_all(&self) {
        let mut state = self.lock();
        state.retired_seqno = state.last_seqno;
    }

    fn lock(&self) -> MutexGuard<NullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_handle(&self, what: &'static str) -> PipeResult<u32> {
        let mut state = self.lock();
        if state.failing_allocations > 0 {
            state.failing_allocations -= 1;
            debug!("failing {} allocation on request", what);
            return Err(PipeError::AllocationFailed(what));
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(handle)
    }
}

impl Default for NullWinsys {
    fn default() -> NullWinsys {
        NullWinsys::new()
    }
}

impl Winsys for NullWinsys {
    type Buffer = NullBuffer;
    type Surface = NullSurface;
    type Fence = NullFence;
    type Mapping<'a> = NullMapping<'a>;

    #[inline]
    fn limits(&self) -> WinsysLimits {
        self.limits
    }

    fn buffer_create(&self, size: usize, usage: BufferUsage) -> PipeResult<NullBuffer> {
        let handle = self.allocate_handle("buffer")?;
        self.lock().buffers_created += 1;
        debug!("null buffer {}: {} bytes, {:?}", handle, size, usage);
        Ok(NullBuffer { handle, data: Mutex::new(vec![0; size]) })
    }

    fn buffer_map<'a>(&'a self, buffer: &'a NullBuffer) -> PipeResult<NullMapping<'a>> {
        Ok(NullMapping { guard: buffer.data.lock().unwrap_or_else(PoisonError::into_inner) })
    }

    fn buffer_unmap<'a>(&'a self, mapping: NullMapping<'a>) {
        drop(mapping)
    }

    #[inline]
    fn buffer_handle(&self, buffer: &NullBuffer) -> u32 {
        buffer.handle
    }

    fn surface_create(&self, key: &SurfaceCacheKey) -> PipeResult<NullSurface> {
        let handle = self.allocate_handle("surface")?;
        let mut state = self.lock();
        state.live_surfaces.insert(handle, *key);
        state.surfaces_created += 1;
        Ok(NullSurface(handle))
    }

    fn surface_destroy(&self, surface: NullSurface) {
        let mut state = self.lock();
        if state.live_surfaces.remove(&surface.0).is_none() {
            warn!("destroying unknown surface {}", surface.0);
            state.bad_destroys += 1;
            return;
        }
        state.surfaces_destroyed += 1;
    }

    #[inline]
    fn surface_handle(&self, surface: &NullSurface) -> u32 {
        surface.0
    }

    fn cs_flush(&self, commands: &[u8], want_fence: bool) -> PipeResult<Option<NullFence>> {
        if commands.len() % 4 != 0 {
            return Err(PipeError::bad_input("command stream is not dword aligned"));
        }
        let mut dwords = vec![0; commands.len() / 4];
        LittleEndian::read_u32_into(commands, &mut dwords);
        if dwords.len() > self.limits.max_cmd_dwords {
            return Err(PipeError::bad_input(format!("{} dwords submitted, limit is {}",
                                                    dwords.len(),
                                                    self.limits.max_cmd_dwords)));
        }

        let mut state = self.lock();
        let fence = if want_fence {
            state.last_seqno += 1;
            Some(NullFence(state.last_seqno))
        } else {
            None
        };
        debug!("null submission {}: {} dwords, {:?}", state.submissions.len(), dwords.len(), fence);
        state.submissions.push(Submission { dwords, fence });
        Ok(fence)
    }

    fn fence_signalled(&self, fence: &NullFence) -> bool {
        fence.0 <= self.lock().retired_seqno
    }

    fn fence_finish(&self, fence: &NullFence, _: Option<Duration>) -> bool {
        let mut state = self.lock();
        state.retired_seqno = state.retired_seqno.max(fence.0);
        true
    }
}

impl<'a> Deref for NullMapping<'a> {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl<'a> DerefMut for NullMapping<'a> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}
