// gallium/renderer/src/upload.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Deferred buffer uploads.
//!
//! CPU writes land in a buffer's shadow copy and are recorded as dirty byte ranges. The first
//! time a command references the buffer, `resolve()` makes sure it has a host surface and, if
//! anything is dirty, opens an upload packet with room for the whole range table. The box list
//! stays open until the command buffer is flushed, so writes made in the meantime still fold
//! into the same upload.

use crate::command::{CommandBuffer, Relocation};
use gallium_gpu::resource::Buffer;
use gallium_gpu::{BufferUsage, PipeError, PipeResult, Winsys};
use std::ops::Range;
use std::sync::Arc;

/// Dwords of an upload payload before the boxes: destination, source, box count.
const UPLOAD_HEADER_DWORDS: usize = 3;

struct OpenUpload<W> where W: Winsys {
    buffer: Arc<Buffer<W>>,
    payload_offset: usize,
    max_boxes: usize,
}

pub struct UploadTracker<W> where W: Winsys {
    open: Vec<OpenUpload<W>>,
    uploads_closed: u64,
    bytes_uploaded: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UploadStats {
    pub uploads: u64,
    pub bytes: u64,
}

impl<W> UploadTracker<W> where W: Winsys {
    pub fn new() -> UploadTracker<W> {
        UploadTracker { open: vec![], uploads_closed: 0, bytes_uploaded: 0 }
    }

    /// Upper bound on the command dwords `resolve()` writes for one buffer.
    #[inline]
    pub fn upload_dwords(cs: &CommandBuffer<W>, max_boxes: usize) -> usize {
        cs.format().packet_dwords(UPLOAD_HEADER_DWORDS + max_boxes * 2)
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    #[inline]
    pub fn stats(&self) -> UploadStats {
        UploadStats { uploads: self.uploads_closed, bytes: self.bytes_uploaded }
    }

    /// Returns the host handle of `buffer`, queuing an upload of its dirty bytes first.
    ///
    /// Allocation failures are reported as `OutOfMemory`, since a flush releases memory.
    pub fn resolve(&mut self, cs: &mut CommandBuffer<W>, opcode: u32, buffer: &Arc<Buffer<W>>)
                   -> PipeResult<u32> {
        let screen = buffer.screen();
        let winsys = screen.winsys();
        let mut state = buffer.lock();

        if state.host.is_none() {
            let host = screen.acquire_host_surface(buffer.cache_key()).map_err(oom)?;
            debug!("buffer {:?} gets host surface {}", buffer.id(), screen.host_handle(&host));
            state.host = Some(host);
        }
        let handle = match state.host {
            Some(ref host) => screen.host_handle(host),
            None => return Err(PipeError::Fatal("buffer lost its host surface")),
        };
        cs.add_relocation(Relocation::Buffer(buffer.clone()))?;

        if state.dirty.is_empty() || state.upload_open {
            return Ok(handle);
        }

        if state.staging.is_none() {
            state.staging = Some(winsys.buffer_create(buffer.size(), BufferUsage::Staging)
                                       .map_err(oom)?);
        }
        let staging_handle = match state.staging {
            Some(ref staging) => winsys.buffer_handle(staging),
            None => return Err(PipeError::Fatal("buffer lost its staging memory")),
        };

        let max_boxes = state.dirty.max_ranges();
        let (payload_offset, payload) =
            cs.reserve_packet(opcode, UPLOAD_HEADER_DWORDS + max_boxes * 2)?;
        payload[0] = handle;
        payload[1] = staging_handle;
        cs.commit();

        state.upload_open = true;
        debug!("opened upload for buffer {:?} at dword {}", buffer.id(), payload_offset);
        self.open.push(OpenUpload { buffer: buffer.clone(), payload_offset, max_boxes });
        Ok(handle)
    }

    /// Copies the dirty bytes of every open upload into staging memory and finalizes the box
    /// lists. Called right before submission.
    pub fn close_all(&mut self, cs: &mut CommandBuffer<W>) {
        for upload in self.open.drain(..) {
            let buffer = &upload.buffer;
            let winsys = buffer.screen().winsys();
            let mut state = buffer.lock();
            state.upload_open = false;

            let ranges = state.dirty.take();
            debug_assert!(ranges.len() <= upload.max_boxes);
            let copied = match state.staging {
                None => Err(PipeError::Fatal("open upload without staging memory")),
                Some(ref staging) => copy_ranges(winsys, staging, &state.shadow, &ranges),
            };
            let ranges = match copied {
                Ok(()) => ranges,
                Err(error) => {
                    warn!("upload of buffer {:?} dropped ({}); keeping it dirty",
                          buffer.id(),
                          error);
                    for range in &ranges {
                        state.dirty.mark_dirty(range.start, range.end);
                    }
                    vec![]
                }
            };

            let mut words = Vec::with_capacity(1 + ranges.len() * 2);
            words.push(ranges.len() as u32);
            for range in &ranges {
                words.push(range.start as u32);
                words.push((range.end - range.start) as u32);
                self.bytes_uploaded += (range.end - range.start) as u64;
            }
            cs.patch(upload.payload_offset + UPLOAD_HEADER_DWORDS - 1, &words);
            self.uploads_closed += 1;
            debug!("closed upload for buffer {:?}: {:?}", buffer.id(), ranges);
        }
    }
}

fn copy_ranges<W>(winsys: &W, staging: &W::Buffer, shadow: &[u8], ranges: &[Range<usize>])
                  -> PipeResult<()>
                  where W: Winsys {
    let mut mapping = winsys.buffer_map(staging)?;
    for range in ranges {
        mapping[range.clone()].copy_from_slice(&shadow[range.clone()]);
    }
    winsys.buffer_unmap(mapping);
    Ok(())
}

#[inline]
pub(crate) fn oom(error: PipeError) -> PipeError {
    match error {
        PipeError::AllocationFailed(what) => {
            debug!("{} allocation failed", what);
            PipeError::OutOfMemory
        }
        error => error,
    }
}
