// gallium/gpu/src/surface_cache.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Recycling of host surfaces.

use crate::error::PipeResult;
use crate::{BindFlags, SurfaceFlags, SurfaceFormat, Winsys};
use fxhash::FxHashMap;
use instant::Instant;
use std::collections::VecDeque;
use std::time::Duration;

// Number of seconds before an unused surface is destroyed.
const DECAY_TIME: f32 = 2.0;

/// Everything a host surface is created from. Surfaces with equal keys are interchangeable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceCacheKey {
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub num_mip_levels: u32,
    pub num_faces: u32,
    pub flags: SurfaceFlags,
    pub cachable: bool,
}

impl SurfaceCacheKey {
    pub fn for_buffer(size: usize, bind: BindFlags) -> SurfaceCacheKey {
        SurfaceCacheKey {
            format: SurfaceFormat::Buffer,
            width: size as u32,
            height: 1,
            depth: 1,
            num_mip_levels: 1,
            num_faces: 1,
            flags: SurfaceFlags::from_bind_flags(bind),
            cachable: true,
        }
    }

    /// Bytes of the whole mip chain across all faces.
    pub fn byte_size(&self) -> u64 {
        let mut total = 0;
        for level in 0..self.num_mip_levels {
            let width = (self.width >> level).max(1) as u64;
            let height = (self.height >> level).max(1) as u64;
            let depth = (self.depth >> level).max(1) as u64;
            total += width * height * depth * self.format.bytes_per_pixel() as u64;
        }
        total * self.num_faces.max(1) as u64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SurfaceCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes_cached: u64,
    pub surfaces_cached: usize,
}

/// Free lists of host surfaces, bucketed by creation key.
///
/// Not synchronized; the screen owns the cache behind its mutex.
pub struct HostSurfaceCache<W> where W: Winsys {
    buckets: FxHashMap<SurfaceCacheKey, VecDeque<FreeSurface<W>>>,
    budget_bytes: u64,
    bytes_cached: u64,
    next_serial: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct FreeSurface<W> where W: Winsys {
    serial: u64,
    timestamp: Instant,
    surface: W::Surface,
}

impl<W> HostSurfaceCache<W> where W: Winsys {
    pub fn new(budget_bytes: u64) -> HostSurfaceCache<W> {
        HostSurfaceCache {
            buckets: FxHashMap::default(),
            budget_bytes,
            bytes_cached: 0,
            next_serial: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Hands out a free surface created with `key`, or creates a new one.
    pub fn create_or_reuse(&mut self, winsys: &W, key: &SurfaceCacheKey)
                           -> PipeResult<W::Surface> {
        if key.cachable {
            if let Some(surface) = self.take_free(key) {
                self.hits += 1;
                debug!("surface cache hit: {:?} -> {:?}", key, surface);
                return Ok(surface);
            }
        }

        self.misses += 1;
        match winsys.surface_create(key) {
            Ok(surface) => {
                debug!("surface cache miss: {:?} -> {:?}", key, surface);
                Ok(surface)
            }
            Err(err) if self.bytes_cached > 0 => {
                debug!("surface creation failed ({}), emptying the cache and retrying", err);
                self.clear(winsys);
                winsys.surface_create(key)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns a surface to its free list. Uncachable surfaces are destroyed immediately.
    pub fn release(&mut self, winsys: &W, key: SurfaceCacheKey, surface: W::Surface) {
        let byte_size = key.byte_size();
        if !key.cachable || byte_size > self.budget_bytes {
            debug!("destroying uncached surface {:?}", surface);
            winsys.surface_destroy(surface);
            return;
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        self.buckets.entry(key).or_insert_with(VecDeque::new).push_back(FreeSurface {
            serial,
            timestamp: Instant::now(),
            surface,
        });
        self.bytes_cached += byte_size;
        self.evict_to_budget(winsys);
    }

    /// Destroys surfaces that have sat unused for a while.
    #[inline]
    pub fn purge_if_needed(&mut self, winsys: &W) {
        self.purge_older_than(winsys, Duration::from_secs_f32(DECAY_TIME))
    }

    pub fn purge_older_than(&mut self, winsys: &W, max_age: Duration) {
        let now = Instant::now();
        let mut purged_bytes = 0;
        for (key, bucket) in self.buckets.iter_mut() {
            while let Some(free) = bucket.front() {
                if now - free.timestamp < max_age {
                    break;
                }
                if let Some(free) = bucket.pop_front() {
                    debug!("purging surface {:?}: {:?}", free.surface, key);
                    purged_bytes += key.byte_size();
                    winsys.surface_destroy(free.surface);
                }
            }
        }
        self.bytes_cached -= purged_bytes;
        self.buckets.retain(|_, bucket| !bucket.is_empty());
    }

    pub fn clear(&mut self, winsys: &W) {
        for (_, bucket) in self.buckets.drain() {
            for free in bucket {
                winsys.surface_destroy(free.surface);
            }
        }
        self.bytes_cached = 0;
    }

    pub fn stats(&self) -> SurfaceCacheStats {
        SurfaceCacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            bytes_cached: self.bytes_cached,
            surfaces_cached: self.buckets.values().map(|bucket| bucket.len()).sum(),
        }
    }

    fn take_free(&mut self, key: &SurfaceCacheKey) -> Option<W::Surface> {
        let (free, now_empty) = {
            let bucket = self.buckets.get_mut(key)?;
            let free = bucket.pop_back()?;
            (free, bucket.is_empty())
        };
        if now_empty {
            self.buckets.remove(key);
        }
        self.bytes_cached -= key.byte_size();
        Some(free.surface)
    }

    fn evict_to_budget(&mut self, winsys: &W) {
        while self.bytes_cached > self.budget_bytes {
            let oldest = self.buckets
                             .iter()
                             .filter_map(|(key, bucket)| {
                                 bucket.front().map(|free| (free.serial, *key))
                             })
                             .min_by_key(|&(serial, _)| serial);
            let key = match oldest {
                None => break,
                Some((_, key)) => key,
            };
            let free = match self.buckets.get_mut(&key).and_then(|bucket| bucket.pop_front()) {
                None => break,
                Some(free) => free,
            };
            debug!("evicting surface {:?}: {:?}", free.surface, key);
            winsys.surface_destroy(free.surface);
            self.bytes_cached -= key.byte_size();
            self.evictions += 1;
            self.buckets.retain(|_, bucket| !bucket.is_empty());
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use crate::error::{PipeError, PipeResult};
    use crate::{BindFlags, BufferUsage, SurfaceFormat, Winsys, WinsysLimits};
    use std::sync::Mutex;
    use std::time::Duration;
    use super::{HostSurfaceCache, SurfaceCacheKey};

    /// Just enough of a winsys to count surface traffic.
    #[derive(Default)]
    pub(crate) struct CountingWinsys {
        pub created: Mutex<u32>,
        pub destroyed: Mutex<Vec<u32>>,
        pub fail_creates: Mutex<u32>,
    }

    impl Winsys for CountingWinsys {
        type Buffer = Vec<u8>;
        type Surface = u32;
        type Fence = u32;
        type Mapping<'a> = Vec<u8> where Self: 'a;

        fn limits(&self) -> WinsysLimits {
            WinsysLimits::default()
        }

        fn buffer_create(&self, size: usize, _: BufferUsage) -> PipeResult<Vec<u8>> {
            Ok(vec![0; size])
        }

        fn buffer_map<'a>(&'a self, buffer: &'a Vec<u8>) -> PipeResult<Vec<u8>> {
            Ok(buffer.clone())
        }

        fn buffer_unmap<'a>(&'a self, _: Vec<u8>) {}

        fn buffer_handle(&self, _: &Vec<u8>) -> u32 {
            0
        }

        fn surface_create(&self, _: &SurfaceCacheKey) -> PipeResult<u32> {
            let mut fail = self.fail_creates.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(PipeError::AllocationFailed("surface"));
            }
            let mut created = self.created.lock().unwrap();
            *created += 1;
            Ok(*created)
        }

        fn surface_destroy(&self, surface: u32) {
            self.destroyed.lock().unwrap().push(surface);
        }

        fn surface_handle(&self, surface: &u32) -> u32 {
            *surface
        }

        fn cs_flush(&self, _: &[u8], _: bool) -> PipeResult<Option<u32>> {
            Ok(None)
        }

        fn fence_signalled(&self, _: &u32) -> bool {
            true
        }

        fn fence_finish(&self, _: &u32, _: Option<Duration>) -> bool {
            true
        }
    }

    fn buffer_key(size: usize) -> SurfaceCacheKey {
        SurfaceCacheKey::for_buffer(size, BindFlags::VERTEX_BUFFER)
    }

    #[test]
    fn test_released_surface_is_recycled_for_equal_key() {
        let winsys = CountingWinsys::default();
        let mut cache = HostSurfaceCache::new(1 << 20);
        let first = cache.create_or_reuse(&winsys, &buffer_key(4096)).unwrap();
        cache.release(&winsys, buffer_key(4096), first);
        let other = cache.create_or_reuse(&winsys, &buffer_key(2048)).unwrap();
        assert_ne!(other, first);
        let second = cache.create_or_reuse(&winsys, &buffer_key(4096)).unwrap();
        assert_eq!(second, first);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 2);
        assert!(winsys.destroyed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_uncachable_surfaces_are_destroyed() {
        let winsys = CountingWinsys::default();
        let mut cache = HostSurfaceCache::new(1 << 20);
        let mut key = buffer_key(64);
        key.cachable = false;
        let surface = cache.create_or_reuse(&winsys, &key).unwrap();
        cache.release(&winsys, key, surface);
        assert_eq!(*winsys.destroyed.lock().unwrap(), vec![surface]);
        assert_eq!(cache.stats().surfaces_cached, 0);
    }

    #[test]
    fn test_budget_evicts_oldest_first() {
        let winsys = CountingWinsys::default();
        let mut cache = HostSurfaceCache::new(2048);
        let a = cache.create_or_reuse(&winsys, &buffer_key(1024)).unwrap();
        let b = cache.create_or_reuse(&winsys, &buffer_key(1024)).unwrap();
        let c = cache.create_or_reuse(&winsys, &buffer_key(512)).unwrap();
        cache.release(&winsys, buffer_key(1024), a);
        cache.release(&winsys, buffer_key(512), c);
        cache.release(&winsys, buffer_key(1024), b);
        assert_eq!(*winsys.destroyed.lock().unwrap(), vec![a]);
        assert_eq!(cache.stats().bytes_cached, 1536);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_failed_creation_empties_cache_and_retries() {
        let winsys = CountingWinsys::default();
        let mut cache = HostSurfaceCache::new(1 << 20);
        let a = cache.create_or_reuse(&winsys, &buffer_key(256)).unwrap();
        cache.release(&winsys, buffer_key(256), a);
        *winsys.fail_creates.lock().unwrap() = 1;
        assert!(cache.create_or_reuse(&winsys, &buffer_key(128)).is_ok());
        assert_eq!(*winsys.destroyed.lock().unwrap(), vec![a]);

        *winsys.fail_creates.lock().unwrap() = 1;
        assert_eq!(cache.create_or_reuse(&winsys, &buffer_key(128)),
                   Err(PipeError::AllocationFailed("surface")));
    }

    #[test]
    fn test_purge_destroys_aged_surfaces() {
        let winsys = CountingWinsys::default();
        let mut cache = HostSurfaceCache::new(1 << 20);
        let a = cache.create_or_reuse(&winsys, &buffer_key(256)).unwrap();
        cache.release(&winsys, buffer_key(256), a);
        cache.purge_if_needed(&winsys);
        assert_eq!(cache.stats().surfaces_cached, 1);
        cache.purge_older_than(&winsys, Duration::from_secs(0));
        assert_eq!(cache.stats().surfaces_cached, 0);
        assert_eq!(cache.stats().bytes_cached, 0);
    }

    #[test]
    fn test_key_byte_size_covers_mip_chain_and_faces() {
        let key = SurfaceCacheKey {
            format: SurfaceFormat::R8G8B8A8Unorm,
            width: 4,
            height: 4,
            depth: 1,
            num_mip_levels: 3,
            num_faces: 6,
            flags: crate::SurfaceFlags::CUBEMAP,
            cachable: true,
        };
        assert_eq!(key.byte_size(), (16 + 4 + 1) * 4 * 6);
    }
}
