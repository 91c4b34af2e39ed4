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

//! Frame Buffer Interface (FBI)
//!
//! One shared RAM arena subdivided by pixel offset into up to three 16-bit
//! color buffers (front/back/alt) and one auxiliary buffer holding either
//! depth or alpha. The arena is power-of-two sized and all addressing wraps
//! through a bitmask, matching the hardware's behavior of never faulting on
//! an out-of-range access.

use crate::core::state::{fbz, lfb};
use crate::core::tables::{dither_g, dither_rb, DITHER_MATRIX_2X2, DITHER_MATRIX_4X4};

/// Sentinel pixel offset meaning "no auxiliary buffer allocated"
pub const NO_AUX: u32 = u32::MAX;

/// Clip rectangle in pixel coordinates (right/bottom exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRect {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl ClipRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            right: width,
            top: 0,
            bottom: height,
        }
    }
}

/// The FBI memory arena and buffer layout
pub struct Fbi {
    /// Shared RAM arena, 16-bit units, power-of-two length
    ram: Vec<u16>,

    /// Arena index mask (len - 1)
    mask: usize,

    /// Pixel offsets of the three color buffers
    rgb_offs: [u32; 3],

    /// Pixel offset of the aux (depth/alpha) buffer, or [`NO_AUX`]
    aux_offs: u32,

    /// Which color buffer is currently displayed
    front_buf: usize,

    /// Which color buffer is currently drawn to
    back_buf: usize,

    /// Display width in pixels
    width: u32,

    /// Display height in pixels
    height: u32,

    /// Arena pixels per scanline
    row_pixels: u32,

    /// Active clip rectangle (from clipLeftRight / clipLowYHighY)
    clip: ClipRect,

    /// Count of swapbuffer commands executed
    swaps: u64,
}

impl Fbi {
    /// Create the arena and carve out the default buffer layout
    ///
    /// `size_bytes` is rounded up to a power of two. The layout is
    /// front/back/aux stacked at row-aligned offsets; the third color buffer
    /// stays unallocated until video dimensions demand it.
    pub fn new(size_bytes: usize, width: u32, height: u32) -> Self {
        let pixels = (size_bytes / 2).next_power_of_two();
        let mut fbi = Self {
            ram: vec![0; pixels],
            mask: pixels - 1,
            rgb_offs: [0; 3],
            aux_offs: NO_AUX,
            front_buf: 0,
            back_buf: 1,
            width,
            height,
            row_pixels: width,
            clip: ClipRect::full(width, height),
            swaps: 0,
        };
        fbi.recompute_layout(width, height);
        fbi
    }

    /// Recompute buffer offsets for new video dimensions
    ///
    /// Offsets never exceed the arena; buffers that would not fit wrap
    /// through the mask like the hardware does.
    pub fn recompute_layout(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.row_pixels = width;
        let buf_pixels = width * height;
        self.rgb_offs = [0, buf_pixels, 2 * buf_pixels];
        self.aux_offs = 3 * buf_pixels;
        self.clip = ClipRect::full(width, height);
        log::debug!(
            "FBI layout: {}x{}, color at {:?}, aux at {}",
            width,
            height,
            self.rgb_offs,
            self.aux_offs
        );
    }

    #[inline(always)]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline(always)]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline(always)]
    pub fn row_pixels(&self) -> u32 {
        self.row_pixels
    }

    #[inline(always)]
    pub fn clip(&self) -> ClipRect {
        self.clip
    }

    #[inline(always)]
    pub fn swap_count(&self) -> u64 {
        self.swaps
    }

    #[inline(always)]
    pub fn front_index(&self) -> usize {
        self.front_buf
    }

    #[inline(always)]
    pub fn back_index(&self) -> usize {
        self.back_buf
    }

    /// Update the clip rectangle from the packed clip registers
    pub fn set_clip(&mut self, left_right: u32, low_high_y: u32) {
        self.clip = ClipRect {
            left: (left_right >> 16) & 0x3ff,
            right: left_right & 0x3ff,
            top: (low_high_y >> 16) & 0x3ff,
            bottom: low_high_y & 0x3ff,
        };
    }

    /// Pixel offset of a color buffer by index
    #[inline(always)]
    pub fn rgb_offset(&self, index: usize) -> u32 {
        self.rgb_offs[index % 3]
    }

    /// Pixel offset of the aux buffer, or [`NO_AUX`]
    #[inline(always)]
    pub fn aux_offset(&self) -> u32 {
        self.aux_offs
    }

    /// Resolve the fbzMode draw-buffer selector to a color buffer offset
    ///
    /// The reserved selector values (2, 3) are a documented silent no-op.
    pub fn draw_buffer_offset(&self, fbz_mode: u32) -> Option<u32> {
        match fbz::draw_buffer(fbz_mode) {
            0 => Some(self.rgb_offs[self.front_buf]),
            1 => Some(self.rgb_offs[self.back_buf]),
            sel => {
                log::debug!("Reserved draw buffer selector {sel}, dropping command");
                None
            }
        }
    }

    /// Resolve an lfbMode buffer selector to a color buffer offset
    pub fn lfb_buffer_offset(&self, select: u32) -> Option<u32> {
        match select {
            0 => Some(self.rgb_offs[self.front_buf]),
            1 => Some(self.rgb_offs[self.back_buf]),
            _ => None,
        }
    }

    /// Rotate front/back on a swapbuffer command
    pub fn swap_buffers(&mut self) {
        std::mem::swap(&mut self.front_buf, &mut self.back_buf);
        self.swaps += 1;
        log::trace!("swapbuffer #{}: front={}", self.swaps, self.front_buf);
    }

    /// Read a pixel by absolute arena offset
    #[inline(always)]
    pub fn read_pixel(&self, offset: u32) -> u16 {
        self.ram[offset as usize & self.mask]
    }

    /// Write a pixel by absolute arena offset
    #[inline(always)]
    pub fn write_pixel(&mut self, offset: u32, value: u16) {
        let mask = self.mask;
        self.ram[offset as usize & mask] = value;
    }

    /// Borrow the whole arena (readback/mirroring)
    pub fn ram(&self) -> &[u16] {
        &self.ram
    }

    /// Mutably borrow the whole arena (readback/mirroring)
    pub fn ram_mut(&mut self) -> &mut [u16] {
        &mut self.ram
    }

    /// Raw parts for the worker pool's partitioned writes
    pub(crate) fn raw_parts(&mut self) -> (*mut u16, usize) {
        (self.ram.as_mut_ptr(), self.mask)
    }

    /// Execute a fastfill: dithered color clear and/or aux clear
    ///
    /// Clears the selected draw buffer to `color1` (through the dither
    /// matrix selected by fbzMode) and/or the aux buffer to the low 16 bits
    /// of `za_color`, over the intersection of the active clip rectangle,
    /// honoring the RGB/aux write masks.
    pub fn fastfill(&mut self, fbz_mode: u32, color1: u32, za_color: u32) {
        let clip = self.clip;
        let (sx, ex) = (clip.left, clip.right.min(self.width));
        let (sy, ey) = (clip.top, clip.bottom.min(self.height));
        if sx >= ex || sy >= ey {
            return;
        }

        if fbz::rgb_buffer_mask(fbz_mode) {
            if let Some(draw_offs) = self.draw_buffer_offset(fbz_mode) {
                let r = ((color1 >> 16) & 0xff) as i32;
                let g = ((color1 >> 8) & 0xff) as i32;
                let b = (color1 & 0xff) as i32;

                // Precompute the 4x4 block of dithered pixels
                let mut block = [0u16; 16];
                for (i, slot) in block.iter_mut().enumerate() {
                    let dith = i32::from(self.dither_value(fbz_mode, i as u32 & 3, i as u32 >> 2));
                    let (dr, dg, db) = if fbz::enable_dithering(fbz_mode) {
                        (dither_rb(r, dith), dither_g(g, dith), dither_rb(b, dith))
                    } else {
                        (r >> 3, g >> 2, b >> 3)
                    };
                    *slot = ((dr as u16) << 11) | ((dg as u16) << 5) | db as u16;
                }

                for y in sy..ey {
                    let row = draw_offs + y * self.row_pixels;
                    for x in sx..ex {
                        let value = block[(((y & 3) << 2) | (x & 3)) as usize];
                        self.write_pixel(row + x, value);
                    }
                }
            }
        }

        if fbz::aux_buffer_mask(fbz_mode) && self.aux_offs != NO_AUX {
            let depth = (za_color & 0xffff) as u16;
            for y in sy..ey {
                let row = self.aux_offs + y * self.row_pixels;
                for x in sx..ex {
                    self.write_pixel(row + x, depth);
                }
            }
        }
    }

    /// Dither matrix value for a pixel position under the given fbzMode
    #[inline(always)]
    pub fn dither_value(&self, fbz_mode: u32, x: u32, y: u32) -> u8 {
        let index = (((y & 3) << 2) | (x & 3)) as usize;
        if fbz::dither_type_2x2(fbz_mode) {
            DITHER_MATRIX_2X2[index]
        } else {
            DITHER_MATRIX_4X4[index]
        }
    }

    /// Linear frame buffer write
    ///
    /// `offset` is a 16-bit-pixel offset within the LFB window. Formats 0-2
    /// are the raw 16-bit color encodings; formats 12-15 carry depth in the
    /// high half. Unsupported formats are logged and dropped.
    pub fn lfb_write(&mut self, lfb_mode: u32, offset: u32, value: u32) {
        let Some(buf_offs) = self.lfb_buffer_offset(lfb::write_buffer_select(lfb_mode)) else {
            log::debug!("LFB write to reserved buffer selector, dropped");
            return;
        };

        let x = offset % self.row_pixels;
        let mut y = offset / self.row_pixels;
        if lfb::y_origin_inverted(lfb_mode) {
            y = self.height.saturating_sub(1).saturating_sub(y);
        }
        let base = buf_offs + y * self.row_pixels + x;

        match lfb::write_format(lfb_mode) {
            // two 16-bit color pixels per word
            0 | 1 | 2 => {
                let lo = (value & 0xffff) as u16;
                let hi = (value >> 16) as u16;
                let format = lfb::write_format(lfb_mode);
                self.write_pixel(base, lfb_color_to_565(lo, format));
                self.write_pixel(base + 1, lfb_color_to_565(hi, format));
            }
            // 16-bit depth + 16-bit color
            12..=15 => {
                let color = (value & 0xffff) as u16;
                let depth = (value >> 16) as u16;
                self.write_pixel(base, lfb_color_to_565(color, 0));
                if self.aux_offs != NO_AUX {
                    let aux = self.aux_offs + y * self.row_pixels + x;
                    self.write_pixel(aux, depth);
                }
            }
            format => {
                log::warn!("Unsupported LFB write format {format}, write dropped");
            }
        }
    }

    /// Read one pixel back through the LFB window
    pub fn lfb_read(&self, lfb_mode: u32, offset: u32) -> u32 {
        let Some(buf_offs) = self.lfb_buffer_offset(lfb::read_buffer_select(lfb_mode)) else {
            return 0;
        };
        let x = offset % self.row_pixels;
        let y = offset / self.row_pixels;
        let base = buf_offs + y * self.row_pixels + x;
        u32::from(self.read_pixel(base)) | (u32::from(self.read_pixel(base + 1)) << 16)
    }
}

/// Convert an LFB-format 16-bit color word to the native 5-6-5 layout
#[inline]
pub(crate) fn lfb_color_to_565(value: u16, format: u32) -> u16 {
    match format {
        // 565 RGB: native
        0 => value,
        // x555 RGB: widen green
        1 => {
            let r = (value >> 10) & 0x1f;
            let g = (value >> 5) & 0x1f;
            let b = value & 0x1f;
            (r << 11) | (g << 6) | (g >> 4 << 5) | b
        }
        // 1555 ARGB: drop alpha, widen green
        2 => {
            let r = (value >> 10) & 0x1f;
            let g = (value >> 5) & 0x1f;
            let b = value & 0x1f;
            (r << 11) | (g << 6) | (g >> 4 << 5) | b
        }
        _ => value,
    }
}
