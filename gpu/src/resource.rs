// gallium/gpu/src/resource.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! GPU resources: buffers, textures, render target surfaces, and sampler views.
//!
//! Resources are shared through `Arc`. The host surface backing a resource is handed back to the
//! screen's surface cache when the last reference goes away, never earlier; command buffers keep
//! their own references to everything they mention until they are submitted.

use crate::error::{PipeError, PipeResult};
use crate::ranges::DirtyRanges;
use crate::screen::{HostSurface, Screen};
use crate::surface_cache::SurfaceCacheKey;
use crate::{BindFlags, SurfaceFlags, SurfaceFormat, TextureTarget, Winsys};
use gallium_geometry::rect::RectI;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

// Buffers

pub struct Buffer<W> where W: Winsys {
    screen: Arc<Screen<W>>,
    id: ResourceId,
    size: usize,
    bind: BindFlags,
    state: Mutex<BufferState<W>>,
}

pub struct BufferState<W> where W: Winsys {
    /// The CPU copy. Always current.
    pub shadow: Vec<u8>,
    /// Bytes of `shadow` not yet uploaded to `host`.
    pub dirty: DirtyRanges,
    /// The GPU copy, created the first time a command references the buffer.
    pub host: Option<HostSurface<W>>,
    /// Staging memory uploads are copied through.
    pub staging: Option<W::Buffer>,
    /// True while an upload command for this buffer sits in an unsubmitted command buffer.
    pub upload_open: bool,
}

impl<W> Buffer<W> where W: Winsys {
    pub(crate) fn new(screen: Arc<Screen<W>>, size: usize, bind: BindFlags)
                      -> PipeResult<Buffer<W>> {
        if size == 0 {
            return Err(PipeError::bad_input("zero-sized buffer"));
        }
        let mut shadow: Vec<u8> = vec![];
        if shadow.try_reserve_exact(size).is_err() {
            return Err(PipeError::AllocationFailed("buffer shadow storage"));
        }
        shadow.resize(size, 0);

        let id = screen.next_resource_id();
        let dirty = DirtyRanges::new(screen.options().max_dirty_ranges);
        debug!("creating buffer {:?}: {} bytes, {:?}", id, size, bind);
        Ok(Buffer {
            screen,
            id,
            size,
            bind,
            state: Mutex::new(BufferState {
                shadow,
                dirty,
                host: None,
                staging: None,
                upload_open: false,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn bind(&self) -> BindFlags {
        self.bind
    }

    #[inline]
    pub fn screen(&self) -> &Arc<Screen<W>> {
        &self.screen
    }

    pub fn cache_key(&self) -> SurfaceCacheKey {
        SurfaceCacheKey::for_buffer(self.size, self.bind)
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<BufferState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes into the CPU copy and records the bytes as needing upload.
    pub fn write(&self, offset: usize, data: &[u8]) -> PipeResult<()> {
        let end = self.check_range(offset, data.len())?;
        let mut state = self.lock();
        state.shadow[offset..end].copy_from_slice(data);
        if !self.screen.is_software() {
            state.dirty.mark_dirty(offset, end);
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> PipeResult<Vec<u8>> {
        let end = self.check_range(offset, len)?;
        Ok(self.lock().shadow[offset..end].to_vec())
    }

    fn check_range(&self, offset: usize, len: usize) -> PipeResult<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(end),
            _ => Err(PipeError::bad_input(format!("range {}+{} outside buffer of {} bytes",
                                                  offset,
                                                  len,
                                                  self.size))),
        }
    }
}

impl<W> Drop for Buffer<W> where W: Winsys {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(host) = state.host.take() {
            debug!("buffer {:?} released, returning its surface", self.id);
            self.screen.release_host_surface(host);
        }
    }
}

// Textures

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub target: TextureTarget,
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub num_levels: u32,
    pub bind: BindFlags,
}

impl TextureDesc {
    pub fn new_2d(format: SurfaceFormat, width: u32, height: u32, num_levels: u32, bind: BindFlags)
                  -> TextureDesc {
        TextureDesc {
            target: TextureTarget::Texture2D,
            format,
            width,
            height,
            depth: 1,
            num_levels,
            bind,
        }
    }

    #[inline]
    pub fn num_faces(&self) -> u32 {
        if self.target == TextureTarget::Cube { 6 } else { 1 }
    }

    /// Width, height, and depth of a mip level.
    #[inline]
    pub fn level_size(&self, level: u32) -> (u32, u32, u32) {
        let depth = if self.target == TextureTarget::Texture3D {
            (self.depth >> level).max(1)
        } else {
            1
        };
        ((self.width >> level).max(1), (self.height >> level).max(1), depth)
    }

    #[inline]
    pub fn level_bytes(&self, level: u32) -> usize {
        let (width, height, depth) = self.level_size(level);
        width as usize * height as usize * depth as usize * self.format.bytes_per_pixel()
    }

    /// Number of layers a surface of `level` can pick from: faces for cube maps, slices for
    /// volumes, one otherwise.
    pub fn num_layers(&self, level: u32) -> u32 {
        match self.target {
            TextureTarget::Cube => 6,
            TextureTarget::Texture3D => self.level_size(level).2,
            TextureTarget::Texture1D | TextureTarget::Texture2D => 1,
        }
    }

    /// Index of the image holding `layer` of `level`, and the byte offset of the layer in it.
    pub fn image_location(&self, layer: u32, level: u32) -> (usize, usize) {
        match self.target {
            TextureTarget::Cube => ((layer * self.num_levels + level) as usize, 0),
            TextureTarget::Texture3D => {
                let (width, height, _) = self.level_size(level);
                let slice_bytes = width as usize * height as usize *
                    self.format.bytes_per_pixel();
                (level as usize, layer as usize * slice_bytes)
            }
            TextureTarget::Texture1D | TextureTarget::Texture2D => (level as usize, 0),
        }
    }

    pub fn cache_key(&self) -> SurfaceCacheKey {
        let mut flags = SurfaceFlags::from_bind_flags(self.bind);
        match self.target {
            TextureTarget::Cube => flags |= SurfaceFlags::CUBEMAP,
            TextureTarget::Texture3D => flags |= SurfaceFlags::VOLUME,
            TextureTarget::Texture1D | TextureTarget::Texture2D => {}
        }
        SurfaceCacheKey {
            format: self.format,
            width: self.width,
            height: self.height,
            depth: self.depth,
            num_mip_levels: self.num_levels,
            num_faces: self.num_faces(),
            flags,
            cachable: true,
        }
    }

    /// Key of a single-level, single-layer view surface of `level`.
    pub fn view_key(&self, level: u32, format: SurfaceFormat) -> SurfaceCacheKey {
        let (width, height, _) = self.level_size(level);
        SurfaceCacheKey {
            format,
            width,
            height,
            depth: 1,
            num_mip_levels: 1,
            num_faces: 1,
            flags: SurfaceFlags::from_bind_flags(self.bind),
            cachable: true,
        }
    }

    /// Key of a view surface covering levels `first_level..=last_level` and every face.
    pub fn sampler_view_key(&self, first_level: u32, last_level: u32) -> SurfaceCacheKey {
        let (width, height, depth) = self.level_size(first_level);
        let mut flags = SurfaceFlags::HINT_TEXTURE;
        if self.target == TextureTarget::Cube {
            flags |= SurfaceFlags::CUBEMAP;
        }
        SurfaceCacheKey {
            format: self.format,
            width,
            height,
            depth,
            num_mip_levels: last_level - first_level + 1,
            num_faces: self.num_faces(),
            flags,
            cachable: true,
        }
    }

    pub fn validate(&self) -> PipeResult<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 || self.num_levels == 0 {
            return Err(PipeError::bad_input(format!("empty texture {:?}", self)));
        }
        if self.format == SurfaceFormat::Buffer {
            return Err(PipeError::bad_input("buffer format used for a texture"));
        }
        let largest = self.width.max(self.height).max(self.depth);
        let max_levels = 32 - largest.leading_zeros();
        if self.num_levels > max_levels {
            return Err(PipeError::bad_input(format!("{} levels for a {}-texel texture",
                                                    self.num_levels,
                                                    largest)));
        }
        match self.target {
            TextureTarget::Texture1D if self.height != 1 || self.depth != 1 => {
                Err(PipeError::bad_input("1D texture with height or depth"))
            }
            TextureTarget::Texture2D if self.depth != 1 => {
                Err(PipeError::bad_input("2D texture with depth"))
            }
            TextureTarget::Cube if self.width != self.height || self.depth != 1 => {
                Err(PipeError::bad_input("cube map faces must be square"))
            }
            _ => Ok(()),
        }
    }
}

pub struct Texture<W> where W: Winsys {
    screen: Arc<Screen<W>>,
    id: ResourceId,
    desc: TextureDesc,
    state: Mutex<TextureState<W>>,
}

pub struct TextureState<W> where W: Winsys {
    /// Native storage on hardware screens.
    pub host: Option<HostSurface<W>>,
    /// Native storage on software screens, one image per face and level.
    pub storage: Vec<Vec<u8>>,
    /// Whether each face and level holds content, indexed like `storage`.
    pub defined: Vec<bool>,
    /// Bumped on every write to the native storage.
    pub age: u32,
    /// The `age` at which each level was last written.
    pub view_age: Vec<u32>,
    pub cached_view: Option<Weak<SamplerView<W>>>,
}

impl<W> TextureState<W> where W: Winsys {
    /// Records a write to `layer` of `level` of the native storage.
    pub fn note_write(&mut self, desc: &TextureDesc, layer: u32, level: u32) {
        let face = if desc.target == TextureTarget::Cube { layer } else { 0 };
        self.age += 1;
        self.view_age[level as usize] = self.age;
        self.defined[(face * desc.num_levels + level) as usize] = true;
    }

    pub fn is_defined(&self, desc: &TextureDesc, face: u32, level: u32) -> bool {
        self.defined.get((face * desc.num_levels + level) as usize).cloned().unwrap_or(false)
    }
}

impl<W> Texture<W> where W: Winsys {
    pub(crate) fn new(screen: Arc<Screen<W>>, desc: TextureDesc) -> PipeResult<Texture<W>> {
        desc.validate()?;

        let image_count = (desc.num_faces() * desc.num_levels) as usize;
        let mut storage = vec![];
        let mut host = None;
        if screen.is_software() {
            for image in 0..image_count {
                let level = image as u32 % desc.num_levels;
                let mut data: Vec<u8> = vec![];
                if data.try_reserve_exact(desc.level_bytes(level)).is_err() {
                    return Err(PipeError::AllocationFailed("texture storage"));
                }
                data.resize(desc.level_bytes(level), 0);
                storage.push(data);
            }
        } else {
            host = Some(screen.acquire_host_surface(desc.cache_key())?);
        }

        let id = screen.next_resource_id();
        debug!("creating texture {:?}: {:?}", id, desc);
        Ok(Texture {
            screen,
            id,
            desc,
            state: Mutex::new(TextureState {
                host,
                storage,
                defined: vec![false; image_count],
                age: 0,
                view_age: vec![0; desc.num_levels as usize],
                cached_view: None,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn screen(&self) -> &Arc<Screen<W>> {
        &self.screen
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<TextureState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn host_handle(&self) -> Option<u32> {
        self.lock().host.as_ref().map(|host| self.screen.host_handle(host))
    }

    pub fn check_level_layer(&self, level: u32, layer: u32) -> PipeResult<()> {
        if level >= self.desc.num_levels || layer >= self.desc.num_layers(level) {
            return Err(PipeError::bad_input(format!("level {} layer {} outside {:?}",
                                                    level,
                                                    layer,
                                                    self.desc)));
        }
        Ok(())
    }

    /// Checks that `rect` lies within `level`.
    pub fn check_rect(&self, level: u32, rect: RectI) -> PipeResult<()> {
        let (width, height, _) = self.desc.level_size(level);
        if rect.is_empty() || rect.min_x() < 0 || rect.min_y() < 0 ||
                rect.max_x() > width as i32 || rect.max_y() > height as i32 {
            return Err(PipeError::bad_input(format!("rect {:?} outside {}x{} level {}",
                                                    rect,
                                                    width,
                                                    height,
                                                    level)));
        }
        Ok(())
    }

    /// Writes tightly packed texels into CPU storage. Software screens only.
    pub fn write_region(&self, layer: u32, level: u32, rect: RectI, data: &[u8])
                        -> PipeResult<()> {
        self.check_level_layer(level, layer)?;
        self.check_rect(level, rect)?;
        let bpp = self.desc.format.bytes_per_pixel();
        let row_bytes = rect.width() as usize * bpp;
        if data.len() != row_bytes * rect.height() as usize {
            return Err(PipeError::bad_input(format!("{} bytes for a {:?} region",
                                                    data.len(),
                                                    rect)));
        }

        let (level_width, _, _) = self.desc.level_size(level);
        let stride = level_width as usize * bpp;
        let (image, base) = self.desc.image_location(layer, level);
        let mut state = self.lock();
        {
            let storage = match state.storage.get_mut(image) {
                Some(storage) => storage,
                None => return Err(PipeError::bad_input("texture has no CPU storage")),
            };
            for (row_index, row) in data.chunks(row_bytes).enumerate() {
                let y = rect.min_y() as usize + row_index;
                let start = base + y * stride + rect.min_x() as usize * bpp;
                storage[start..(start + row_bytes)].copy_from_slice(row);
            }
        }
        state.note_write(&self.desc, layer, level);
        Ok(())
    }

    /// Copies one layer of a level out of CPU storage. Software screens only.
    pub fn read_layer(&self, layer: u32, level: u32) -> PipeResult<Vec<u8>> {
        self.check_level_layer(level, layer)?;
        let (width, height, _) = self.desc.level_size(level);
        let len = width as usize * height as usize * self.desc.format.bytes_per_pixel();
        let (image, base) = self.desc.image_location(layer, level);
        let state = self.lock();
        match state.storage.get(image) {
            Some(storage) => Ok(storage[base..(base + len)].to_vec()),
            None => Err(PipeError::bad_input("texture has no CPU storage")),
        }
    }

    /// Returns the cached sampler view if it covers exactly these levels.
    pub fn cached_sampler_view(&self, first_level: u32, last_level: u32)
                               -> Option<Arc<SamplerView<W>>> {
        let view = self.lock().cached_view.as_ref()?.upgrade()?;
        if view.first_level == first_level && view.last_level == last_level {
            Some(view)
        } else {
            None
        }
    }

    pub fn set_cached_sampler_view(&self, view: &Arc<SamplerView<W>>) {
        self.lock().cached_view = Some(Arc::downgrade(view));
    }
}

impl<W> Drop for Texture<W> where W: Winsys {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(host) = state.host.take() {
            debug!("texture {:?} released, returning its surface", self.id);
            self.screen.release_host_surface(host);
        }
    }
}

// Surfaces

/// A render target: one layer of one level of a texture.
///
/// A surface either aliases the texture's native storage or owns a separate view surface. A
/// view that has been rendered to is `dirty` until it is propagated back to the texture.
pub struct Surface<W> where W: Winsys {
    texture: Arc<Texture<W>>,
    id: ResourceId,
    level: u32,
    layer: u32,
    format: SurfaceFormat,
    view: Option<HostSurface<W>>,
    dirty: AtomicBool,
}

impl<W> Surface<W> where W: Winsys {
    pub fn new(texture: Arc<Texture<W>>,
               level: u32,
               layer: u32,
               format: SurfaceFormat,
               view: Option<HostSurface<W>>)
               -> Surface<W> {
        let id = texture.screen.next_resource_id();
        Surface { texture, id, level, layer, format, view, dirty: AtomicBool::new(false) }
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[inline]
    pub fn texture(&self) -> &Arc<Texture<W>> {
        &self.texture
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    pub fn layer(&self) -> u32 {
        self.layer
    }

    #[inline]
    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.texture.desc.level_size(self.level).0
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.texture.desc.level_size(self.level).1
    }

    #[inline]
    pub fn is_view(&self) -> bool {
        self.view.is_some()
    }

    #[inline]
    pub fn view(&self) -> Option<&HostSurface<W>> {
        self.view.as_ref()
    }

    /// The host handle rendering goes to.
    pub fn host_handle(&self) -> Option<u32> {
        match self.view {
            Some(ref view) => Some(self.texture.screen.host_handle(view)),
            None => self.texture.host_handle(),
        }
    }

    /// Records that the surface was rendered to.
    pub fn mark_dirty(&self) {
        if self.is_view() {
            self.dirty.store(true, Ordering::Release);
        } else {
            self.texture.lock().note_write(&self.texture.desc, self.layer, self.level);
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// True if rendered content still has to be copied back to the texture.
    #[inline]
    pub fn needs_propagation(&self) -> bool {
        self.is_view() && self.is_dirty()
    }

    /// Records that the view's content was copied back to the texture.
    pub fn note_propagated(&self) {
        self.dirty.store(false, Ordering::Release);
        self.texture.lock().note_write(&self.texture.desc, self.layer, self.level);
    }
}

impl<W> Drop for Surface<W> where W: Winsys {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            self.texture.screen.release_host_surface(view);
        }
    }
}

// Sampler views

/// A range of mip levels of a texture, as seen by the samplers.
pub struct SamplerView<W> where W: Winsys {
    texture: Arc<Texture<W>>,
    id: ResourceId,
    first_level: u32,
    last_level: u32,
    view: Option<HostSurface<W>>,
    age: AtomicU32,
}

impl<W> SamplerView<W> where W: Winsys {
    pub fn new(texture: Arc<Texture<W>>,
               first_level: u32,
               last_level: u32,
               view: Option<HostSurface<W>>,
               age: u32)
               -> SamplerView<W> {
        let id = texture.screen.next_resource_id();
        SamplerView { texture, id, first_level, last_level, view, age: AtomicU32::new(age) }
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[inline]
    pub fn texture(&self) -> &Arc<Texture<W>> {
        &self.texture
    }

    #[inline]
    pub fn first_level(&self) -> u32 {
        self.first_level
    }

    #[inline]
    pub fn last_level(&self) -> u32 {
        self.last_level
    }

    #[inline]
    pub fn is_view(&self) -> bool {
        self.view.is_some()
    }

    pub fn host_handle(&self) -> Option<u32> {
        match self.view {
            Some(ref view) => Some(self.texture.screen.host_handle(view)),
            None => self.texture.host_handle(),
        }
    }

    #[inline]
    pub fn age(&self) -> u32 {
        self.age.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_age(&self, age: u32) {
        self.age.store(age, Ordering::Release)
    }

    /// Levels written in the texture since this view last copied them.
    pub fn stale_levels(&self) -> Vec<u32> {
        if !self.is_view() {
            return vec![];
        }
        let age = self.age();
        let state = self.texture.lock();
        (self.first_level..=self.last_level).filter(|&level| {
            state.view_age[level as usize] > age
        }).collect()
    }
}

impl<W> Drop for SamplerView<W> where W: Winsys {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            self.texture.screen.release_host_surface(view);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::error::PipeError;
    use crate::options::DebugOptions;
    use crate::screen::Screen;
    use crate::surface_cache::test::CountingWinsys;
    use crate::{BindFlags, SurfaceFormat, TextureTarget};
    use gallium_geometry::rect::RectI;
    use gallium_geometry::vector::vec2i;
    use super::{SamplerView, TextureDesc};
    use std::sync::Arc;

    #[test]
    fn test_buffer_writes_are_bounds_checked_and_tracked() {
        let screen = Screen::new_hardware(CountingWinsys::default(), DebugOptions::default());
        let buffer = screen.create_buffer(4096, BindFlags::VERTEX_BUFFER).unwrap();
        buffer.write(0, &[1; 100]).unwrap();
        buffer.write(200, &[2; 100]).unwrap();
        buffer.write(90, &[3; 120]).unwrap();
        assert_eq!(buffer.lock().dirty.ranges(), &[0..300]);
        assert!(buffer.write(4000, &[0; 100]).is_err());
        assert_eq!(buffer.read(89, 2).unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_dropping_texture_recycles_its_surface() {
        let winsys = CountingWinsys::default();
        let screen = Screen::new_hardware(winsys, DebugOptions::default());
        let desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                       32,
                                       32,
                                       1,
                                       BindFlags::SAMPLER_VIEW);
        let first = screen.create_texture(desc).unwrap();
        let handle = first.host_handle();
        let holder = first.clone();
        drop(first);
        assert_eq!(screen.surface_cache_stats().surfaces_cached, 0);
        drop(holder);
        assert_eq!(screen.surface_cache_stats().surfaces_cached, 1);
        let second = screen.create_texture(desc).unwrap();
        assert_eq!(second.host_handle(), handle);
    }

    #[test]
    fn test_invalid_texture_descs_are_rejected() {
        let screen = Screen::new_software(CountingWinsys::default(), DebugOptions::default());
        let mut desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                           8,
                                           8,
                                           5,
                                           BindFlags::SAMPLER_VIEW);
        assert!(matches!(screen.create_texture(desc), Err(PipeError::BadInput(_))));
        desc.num_levels = 4;
        desc.target = TextureTarget::Cube;
        desc.height = 4;
        assert!(matches!(screen.create_texture(desc), Err(PipeError::BadInput(_))));
    }

    #[test]
    fn test_software_region_writes_land_in_storage() {
        let screen = Screen::new_software(CountingWinsys::default(), DebugOptions::default());
        let desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                       4,
                                       4,
                                       2,
                                       BindFlags::SAMPLER_VIEW);
        let texture = screen.create_texture(desc).unwrap();
        let rect = RectI::new(vec2i(1, 1), vec2i(2, 1));
        texture.write_region(0, 0, rect, &[9; 8]).unwrap();
        let level = texture.read_layer(0, 0).unwrap();
        assert_eq!(&level[16..20], &[0; 4]);
        assert_eq!(&level[20..28], &[9; 8]);
        assert!(texture.lock().is_defined(&desc, 0, 0));
        assert!(!texture.lock().is_defined(&desc, 0, 1));
        assert!(texture.write_region(0, 1, RectI::new(vec2i(0, 0), vec2i(3, 3)), &[0; 36])
                       .is_err());
    }

    #[test]
    fn test_sampler_view_sees_newer_levels_as_stale() {
        let screen = Screen::new_hardware(CountingWinsys::default(), DebugOptions::default());
        let desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                       16,
                                       16,
                                       3,
                                       BindFlags::SAMPLER_VIEW);
        let texture = screen.create_texture(desc).unwrap();
        let key = desc.sampler_view_key(1, 2);
        let host = screen.acquire_host_surface(key).unwrap();
        let view = Arc::new(SamplerView::new(texture.clone(), 1, 2, Some(host), 0));
        texture.set_cached_sampler_view(&view);
        assert!(view.stale_levels().is_empty());

        texture.lock().note_write(&desc, 0, 2);
        assert_eq!(view.stale_levels(), vec![2]);
        view.set_age(texture.lock().age);
        assert!(view.stale_levels().is_empty());

        assert!(texture.cached_sampler_view(1, 2).is_some());
        assert!(texture.cached_sampler_view(0, 2).is_none());
        drop(view);
        assert!(texture.cached_sampler_view(1, 2).is_none());
    }
}
