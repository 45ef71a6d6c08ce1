// gallium/gpu/src/screen.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The device-wide object shared by every context.

use crate::error::PipeResult;
use crate::options::DebugOptions;
use crate::resource::{Buffer, ResourceId, Texture, TextureDesc};
use crate::surface_cache::{HostSurfaceCache, SurfaceCacheKey, SurfaceCacheStats};
use crate::{BindFlags, SurfaceFormat, TextureTarget, Winsys};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScreenKind {
    /// Resources live in host surfaces and are rendered by submitted command streams.
    Hardware,
    /// Resources live in CPU memory and are rendered by the tile rasterizer.
    Software,
}

/// A host surface together with the key it was created from.
pub struct HostSurface<W> where W: Winsys {
    pub key: SurfaceCacheKey,
    pub surface: W::Surface,
}

pub struct Screen<W> where W: Winsys {
    winsys: W,
    kind: ScreenKind,
    options: DebugOptions,
    // Serializes surface creation and destruction across contexts.
    surface_cache: Mutex<HostSurfaceCache<W>>,
    next_resource_id: AtomicU64,
}

impl<W> Screen<W> where W: Winsys {
    pub fn new(winsys: W, kind: ScreenKind, options: DebugOptions) -> Arc<Screen<W>> {
        info!("creating {:?} screen: {:?}", kind, options);
        let surface_cache = Mutex::new(HostSurfaceCache::new(options.surface_cache_bytes));
        Arc::new(Screen {
            winsys,
            kind,
            options,
            surface_cache,
            next_resource_id: AtomicU64::new(1),
        })
    }

    #[inline]
    pub fn new_hardware(winsys: W, options: DebugOptions) -> Arc<Screen<W>> {
        Screen::new(winsys, ScreenKind::Hardware, options)
    }

    #[inline]
    pub fn new_software(winsys: W, options: DebugOptions) -> Arc<Screen<W>> {
        Screen::new(winsys, ScreenKind::Software, options)
    }

    #[inline]
    pub fn winsys(&self) -> &W {
        &self.winsys
    }

    #[inline]
    pub fn kind(&self) -> ScreenKind {
        self.kind
    }

    #[inline]
    pub fn is_software(&self) -> bool {
        self.kind == ScreenKind::Software
    }

    #[inline]
    pub fn options(&self) -> &DebugOptions {
        &self.options
    }

    pub(crate) fn next_resource_id(&self) -> ResourceId {
        ResourceId(self.next_resource_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn create_buffer(self: &Arc<Self>, size: usize, bind: BindFlags)
                         -> PipeResult<Arc<Buffer<W>>> {
        Ok(Arc::new(Buffer::new(self.clone(), size, bind)?))
    }

    pub fn create_texture(self: &Arc<Self>, desc: TextureDesc) -> PipeResult<Arc<Texture<W>>> {
        Ok(Arc::new(Texture::new(self.clone(), desc)?))
    }

    /// Looks up a recycled host surface for `key`, creating one if none is free.
    pub fn acquire_host_surface(&self, key: SurfaceCacheKey) -> PipeResult<HostSurface<W>> {
        let surface = self.lock_surface_cache().create_or_reuse(&self.winsys, &key)?;
        Ok(HostSurface { key, surface })
    }

    pub fn release_host_surface(&self, host: HostSurface<W>) {
        self.lock_surface_cache().release(&self.winsys, host.key, host.surface)
    }

    pub fn purge_surface_cache(&self) {
        self.lock_surface_cache().purge_if_needed(&self.winsys)
    }

    pub fn surface_cache_stats(&self) -> SurfaceCacheStats {
        self.lock_surface_cache().stats()
    }

    #[inline]
    pub fn host_handle(&self, host: &HostSurface<W>) -> u32 {
        self.winsys.surface_handle(&host.surface)
    }

    /// Whether rendering to `level` of a texture has to go through a separate view surface.
    pub fn surface_needs_view(&self, desc: &TextureDesc, level: u32, format: SurfaceFormat)
                              -> bool {
        if self.is_software() {
            return false;
        }

        let mut view = self.options.force_surface_view;
        if format != desc.format {
            view = true;
        }
        if level != 0 && self.options.force_level_surface_view {
            view = true;
        }
        if desc.target == TextureTarget::Texture3D {
            view = true;
        }
        if self.options.no_surface_view {
            view = false;
        }
        view
    }

    /// Whether sampling levels `first_level..=last_level` needs a separate view surface.
    pub fn sampler_needs_view(&self, desc: &TextureDesc, first_level: u32, last_level: u32)
                              -> bool {
        if self.is_software() {
            return false;
        }

        let mut view = first_level != 0 || last_level + 1 != desc.num_levels;
        if self.options.force_sampler_view {
            view = true;
        }
        if self.options.no_sampler_view {
            view = false;
        }
        view
    }

    fn lock_surface_cache(&self) -> MutexGuard<HostSurfaceCache<W>> {
        self.surface_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W> Drop for Screen<W> where W: Winsys {
    fn drop(&mut self) {
        let cache = self.surface_cache.get_mut().unwrap_or_else(PoisonError::into_inner);
        cache.clear(&self.winsys);
    }
}

#[cfg(test)]
mod test {
    use crate::options::DebugOptions;
    use crate::resource::TextureDesc;
    use crate::surface_cache::test::CountingWinsys;
    use crate::{BindFlags, SurfaceFormat, TextureTarget};
    use super::Screen;

    fn volume_desc() -> TextureDesc {
        TextureDesc {
            target: TextureTarget::Texture3D,
            format: SurfaceFormat::R8G8B8A8Unorm,
            width: 16,
            height: 16,
            depth: 16,
            num_levels: 4,
            bind: BindFlags::SAMPLER_VIEW | BindFlags::RENDER_TARGET,
        }
    }

    #[test]
    fn test_surface_view_decisions() {
        let plain = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                        64,
                                        64,
                                        4,
                                        BindFlags::RENDER_TARGET);

        let screen = Screen::new_hardware(CountingWinsys::default(), DebugOptions::default());
        assert!(!screen.surface_needs_view(&plain, 2, SurfaceFormat::R8G8B8A8Unorm));
        assert!(screen.surface_needs_view(&plain, 0, SurfaceFormat::B8G8R8A8Unorm));
        assert!(screen.surface_needs_view(&volume_desc(), 0, SurfaceFormat::R8G8B8A8Unorm));

        let options = DebugOptions { force_level_surface_view: true, ..DebugOptions::default() };
        let screen = Screen::new_hardware(CountingWinsys::default(), options);
        assert!(screen.surface_needs_view(&plain, 2, SurfaceFormat::R8G8B8A8Unorm));
        assert!(!screen.surface_needs_view(&plain, 0, SurfaceFormat::R8G8B8A8Unorm));
        assert!(screen.surface_needs_view(&volume_desc(), 2, SurfaceFormat::R8G8B8A8Unorm));

        let options = DebugOptions {
            force_surface_view: true,
            no_surface_view: true,
            ..DebugOptions::default()
        };
        let screen = Screen::new_hardware(CountingWinsys::default(), options);
        assert!(!screen.surface_needs_view(&volume_desc(), 2, SurfaceFormat::R8G8B8A8Unorm));

        let screen = Screen::new_software(CountingWinsys::default(), DebugOptions::default());
        assert!(!screen.surface_needs_view(&volume_desc(), 2, SurfaceFormat::R8G8B8A8Unorm));
    }

    #[test]
    fn test_sampler_view_decisions() {
        let desc = TextureDesc::new_2d(SurfaceFormat::R8G8B8A8Unorm,
                                       64,
                                       64,
                                       4,
                                       BindFlags::SAMPLER_VIEW);
        let screen = Screen::new_hardware(CountingWinsys::default(), DebugOptions::default());
        assert!(!screen.sampler_needs_view(&desc, 0, 3));
        assert!(screen.sampler_needs_view(&desc, 1, 3));
        assert!(screen.sampler_needs_view(&desc, 0, 2));

        let options = DebugOptions { no_sampler_view: true, ..DebugOptions::default() };
        let screen = Screen::new_hardware(CountingWinsys::default(), options);
        assert!(!screen.sampler_needs_view(&desc, 1, 3));
    }

    #[test]
    fn test_destroyed_buffer_backing_is_recycled() {
        let screen = Screen::new_hardware(CountingWinsys::default(), DebugOptions::default());
        let key = crate::surface_cache::SurfaceCacheKey::for_buffer(256, BindFlags::VERTEX_BUFFER);
        let first = screen.acquire_host_surface(key).unwrap();
        let handle = screen.host_handle(&first);
        screen.release_host_surface(first);
        let second = screen.acquire_host_surface(key).unwrap();
        assert_eq!(screen.host_handle(&second), handle);
        screen.release_host_surface(second);
        drop(screen);
    }
}
