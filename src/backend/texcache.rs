// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Texture content cache
//!
//! The host addresses textures by base offset inside TMU memory, not by
//! handle, and may overwrite them at any time. The cache keys GPU textures
//! on (TMU, base offset) and validates by content hash over the resident
//! byte range plus the palette/NCC state, so palette animation and
//! in-place redownloads both re-upload while untouched textures hit.
//!
//! Records idle for many frames are evicted; their device textures go to a
//! free list for reuse before any new allocation.

use std::collections::HashMap;

use crate::backend::device::{GraphicsDevice, TextureId};
use crate::core::error::Result;
use crate::core::tmu::Tmu;

/// Frames a record may go unused before eviction
const EVICT_AGE_FRAMES: u64 = 600;

/// Free-listed textures kept for reuse; dimensions that never recur would
/// otherwise pin device memory forever
const FREE_LIST_MAX: usize = 32;

/// Content hash over a byte range, 32-bit words at a time
pub fn content_hash(bytes: &[u8]) -> u32 {
    let mut hash = 0u32;
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        hash = hash.wrapping_mul(65599).wrapping_add(word);
    }
    for &byte in chunks.remainder() {
        hash = hash.wrapping_mul(65599).wrapping_add(u32::from(byte));
    }
    hash
}

struct BaseRecord {
    texture: TextureId,
    hash: u32,
    width: u32,
    height: u32,
    last_used: u64,
}

/// Free-listed texture awaiting reuse
struct FreeTexture {
    texture: TextureId,
    width: u32,
    height: u32,
}

pub struct TextureCache {
    records: HashMap<(usize, u32), BaseRecord>,
    free: Vec<FreeTexture>,
    uploads: u64,
    hits: u64,
}

impl TextureCache {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            free: Vec::new(),
            uploads: 0,
            hits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    /// Resolve the GPU texture for one TMU's current configuration
    ///
    /// Hashes the resident range; a hash match touches the record, a
    /// mismatch (or a new base) expands and re-uploads.
    pub fn resolve(
        &mut self,
        device: &mut dyn GraphicsDevice,
        tmu_index: usize,
        tmu: &mut Tmu,
        frame: u64,
    ) -> Result<TextureId> {
        let (start, len) = tmu.resident_range();
        let range = &tmu.ram()[start..(start + len).min(tmu.ram().len())];
        let hash = content_hash(range) ^ tmu.palette_hash();
        let key = (tmu_index, start as u32);

        if let Some(record) = self.records.get_mut(&key) {
            if record.hash == hash {
                record.last_used = frame;
                self.hits += 1;
                return Ok(record.texture);
            }
        }

        let (width, height, rgba) = tmu.expand_rgba();
        let texture = match self.take_free(width, height) {
            Some(id) => id,
            None => device.create_texture(width, height)?,
        };
        device.upload_rgba(texture, width, height, &rgba)?;
        self.uploads += 1;
        log::trace!(
            "texture upload: tmu{tmu_index} base {start:#x} {width}x{height} hash {hash:08x}"
        );

        // A stale record for this base hands its old texture to the free
        // list
        if let Some(old) = self.records.insert(
            key,
            BaseRecord { texture, hash, width, height, last_used: frame },
        ) {
            if old.texture != texture {
                self.free.push(FreeTexture {
                    texture: old.texture,
                    width: old.width,
                    height: old.height,
                });
            }
        }
        Ok(texture)
    }

    fn take_free(&mut self, width: u32, height: u32) -> Option<TextureId> {
        let pos = self
            .free
            .iter()
            .position(|f| f.width == width && f.height == height)?;
        Some(self.free.swap_remove(pos).texture)
    }

    /// Evict records unused for [`EVICT_AGE_FRAMES`] frames
    ///
    /// Evicted handles go to the free list; past [`FREE_LIST_MAX`] the
    /// oldest free entries are destroyed on the device instead.
    pub fn end_frame(&mut self, device: &mut dyn GraphicsDevice, frame: u64) {
        let free = &mut self.free;
        self.records.retain(|key, record| {
            let keep = frame.saturating_sub(record.last_used) < EVICT_AGE_FRAMES;
            if !keep {
                log::debug!("evicting texture for tmu{} base {:#x}", key.0, key.1);
                free.push(FreeTexture {
                    texture: record.texture,
                    width: record.width,
                    height: record.height,
                });
            }
            keep
        });
        if self.free.len() > FREE_LIST_MAX {
            let excess = self.free.len() - FREE_LIST_MAX;
            for stale in self.free.drain(..excess) {
                device.destroy_texture(stale.texture);
            }
        }
    }
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::mock::{Call, MockDevice};

    fn small_tmu() -> Tmu {
        let mut tmu = Tmu::new(1 << 16);
        // RGB565, smallest aspect so the resident range stays tiny:
        // 256x32 at aspect 3
        tmu.set_texture_mode(10 << 8);
        tmu.set_t_lod((3 << 21) | (1 << 20));
        tmu
    }

    #[test]
    fn test_second_resolve_is_a_hit() {
        let mut dev = MockDevice::new();
        let mut cache = TextureCache::new();
        let mut tmu = small_tmu();

        let a = cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        let b = cache.resolve(&mut dev, 0, &mut tmu, 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.upload_count(), 1);
    }

    #[test]
    fn test_content_change_reuploads() {
        let mut dev = MockDevice::new();
        let mut cache = TextureCache::new();
        let mut tmu = small_tmu();

        let a = cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        tmu.texture_write(0, 0xffff_ffff);
        let b = cache.resolve(&mut dev, 0, &mut tmu, 2).unwrap();
        assert_eq!(cache.upload_count(), 2);
        // same base: the handle is replaced in place, old one freed or
        // reused
        let _ = (a, b);
    }

    #[test]
    fn test_palette_change_invalidates_indexed_texture() {
        let mut dev = MockDevice::new();
        let mut cache = TextureCache::new();
        let mut tmu = Tmu::new(1 << 16);
        tmu.set_texture_mode(5 << 8); // P8
        tmu.set_t_lod((3 << 21) | (1 << 20));

        cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        // palette download via the NCC escape
        tmu.ncc_write(0, 5, 0x8000_0000 | (0x10 << 24) | 0x00ff_0000);
        cache.resolve(&mut dev, 0, &mut tmu, 2).unwrap();
        assert_eq!(cache.upload_count(), 2);
    }

    #[test]
    fn test_palette_change_does_not_touch_raw_formats() {
        let mut dev = MockDevice::new();
        let mut cache = TextureCache::new();
        let mut tmu = small_tmu(); // RGB565

        cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        tmu.ncc_write(0, 5, 0x8000_0000 | (0x10 << 24) | 0x00ff_0000);
        cache.resolve(&mut dev, 0, &mut tmu, 2).unwrap();
        assert_eq!(cache.upload_count(), 1);
    }

    #[test]
    fn test_eviction_frees_then_reuses() {
        let mut dev = MockDevice::new();
        let mut cache = TextureCache::new();
        let mut tmu = small_tmu();

        cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        cache.end_frame(&mut dev, 1 + EVICT_AGE_FRAMES);
        assert!(cache.is_empty());

        // same dimensions: must come from the free list, not a new
        // allocation
        let creates = |dev: &MockDevice| {
            dev.calls.iter().filter(|c| matches!(c, Call::CreateTexture(..))).count()
        };
        let creates_before = creates(&dev);
        cache.resolve(&mut dev, 0, &mut tmu, 1 + EVICT_AGE_FRAMES).unwrap();
        let creates_after = creates(&dev);
        assert_eq!(creates_before, creates_after);
    }

    #[test]
    fn test_free_list_overflow_destroys_textures() {
        let mut dev = MockDevice::new();
        let mut cache = TextureCache::new();
        let mut tmu = small_tmu();

        // distinct bases, one record each (the base shifts left 3 into a
        // 64 KiB arena, so keep the steps small enough not to alias)
        for i in 0..(FREE_LIST_MAX + 4) as u32 {
            tmu.set_tex_base(0, i * 0x20);
            cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        }
        cache.end_frame(&mut dev, 1 + EVICT_AGE_FRAMES);
        assert!(cache.is_empty());

        let destroyed = dev
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Destroy(..)))
            .count();
        assert_eq!(destroyed, 4);
    }

    #[test]
    fn test_distinct_bases_get_distinct_textures() {
        let mut dev = MockDevice::new();
        let mut cache = TextureCache::new();
        let mut tmu = small_tmu();

        let a = cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        tmu.set_tex_base(0, 0x400); // move the base
        let b = cache.resolve(&mut dev, 0, &mut tmu, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_content_hash_distinguishes_words() {
        assert_ne!(content_hash(&[1, 0, 0, 0]), content_hash(&[0, 1, 0, 0]));
        assert_eq!(content_hash(&[]), 0);
    }
}
