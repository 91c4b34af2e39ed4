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

//! Texel format decoding
//!
//! The sixteen storage formats all expand to ARGB8888 through a 256-entry
//! lookup table keyed on the low texel byte; 16-bit formats add the high
//! byte inline (either raw channel bits or an alpha channel on top of the
//! 8-bit expansion).

/// The sixteen texel storage formats, by textureMode field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TexelFormat {
    Rgb332 = 0,
    Yiq422 = 1,
    Alpha8 = 2,
    Intensity8 = 3,
    AlphaIntensity44 = 4,
    Palette8 = 5,
    Palette8Rsvd6 = 6,
    Palette8Rsvd7 = 7,
    Argb8332 = 8,
    AYiq8422 = 9,
    Rgb565 = 10,
    Argb1555 = 11,
    Argb4444 = 12,
    AlphaIntensity88 = 13,
    AlphaPalette88 = 14,
    Reserved15 = 15,
}

impl TexelFormat {
    pub fn from_bits(bits: u32) -> Self {
        // All 16 encodings are covered, reserved slots included
        match bits & 0xf {
            0 => Self::Rgb332,
            1 => Self::Yiq422,
            2 => Self::Alpha8,
            3 => Self::Intensity8,
            4 => Self::AlphaIntensity44,
            5 => Self::Palette8,
            6 => Self::Palette8Rsvd6,
            7 => Self::Palette8Rsvd7,
            8 => Self::Argb8332,
            9 => Self::AYiq8422,
            10 => Self::Rgb565,
            11 => Self::Argb1555,
            12 => Self::Argb4444,
            13 => Self::AlphaIntensity88,
            14 => Self::AlphaPalette88,
            _ => Self::Reserved15,
        }
    }

    /// Whether texels occupy two bytes in texture memory
    pub fn is_16bit(self) -> bool {
        self as u32 >= 8
    }
}

#[inline(always)]
fn expand3(v: u32) -> u32 {
    (v << 5) | (v << 2) | (v >> 1)
}

#[inline(always)]
fn expand2(v: u32) -> u32 {
    v * 0x55
}

#[inline(always)]
fn expand4(v: u32) -> u32 {
    v * 0x11
}

#[inline(always)]
fn expand5(v: u32) -> u32 {
    (v << 3) | (v >> 2)
}

#[inline(always)]
fn expand6(v: u32) -> u32 {
    (v << 2) | (v >> 4)
}

fn rgb332(i: u32) -> u32 {
    let r = expand3((i >> 5) & 7);
    let g = expand3((i >> 2) & 7);
    let b = expand2(i & 3);
    0xff00_0000 | (r << 16) | (g << 8) | b
}

/// Build the 256-entry expansion table for a format's low texel byte
///
/// `ncc` is the active NCC table's decoded texel array, `palette` the
/// 256-entry palette; each applies only to the formats that index it.
pub fn build_lookup(format: u32, ncc: &[u32; 256], palette: &[u32; 256]) -> [u32; 256] {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let i = i as u32;
        *entry = match format & 0xf {
            0 | 8 => rgb332(i),
            1 | 9 => ncc[i as usize],
            2 => (i << 24) | (i << 16) | (i << 8) | i,
            3 | 13 => 0xff00_0000 | (i << 16) | (i << 8) | i,
            4 => {
                let a = expand4(i >> 4);
                let c = expand4(i & 0xf);
                (a << 24) | (c << 16) | (c << 8) | c
            }
            5 | 6 | 7 | 14 => 0xff00_0000 | (palette[i as usize] & 0x00ff_ffff),
            // 16-bit raw formats decode inline; reserved reads as black
            _ => 0xff00_0000,
        };
    }
    table
}

/// Decode a 16-bit texel to ARGB8888
///
/// Formats 10-12 unpack channel fields directly; the remaining 16-bit
/// formats expand the low byte through `lookup` and take alpha from the
/// high byte.
#[inline]
pub fn decode_texel_16(format: u32, texel: u16, lookup: &[u32; 256]) -> u32 {
    let texel = u32::from(texel);
    match format & 0xf {
        10 => {
            let r = expand5((texel >> 11) & 0x1f);
            let g = expand6((texel >> 5) & 0x3f);
            let b = expand5(texel & 0x1f);
            0xff00_0000 | (r << 16) | (g << 8) | b
        }
        11 => {
            let a = if texel & 0x8000 != 0 { 0xff } else { 0x00 };
            let r = expand5((texel >> 10) & 0x1f);
            let g = expand5((texel >> 5) & 0x1f);
            let b = expand5(texel & 0x1f);
            (a << 24) | (r << 16) | (g << 8) | b
        }
        12 => {
            let a = expand4((texel >> 12) & 0xf);
            let r = expand4((texel >> 8) & 0xf);
            let g = expand4((texel >> 4) & 0xf);
            let b = expand4(texel & 0xf);
            (a << 24) | (r << 16) | (g << 8) | b
        }
        _ => (lookup[(texel & 0xff) as usize] & 0x00ff_ffff) | ((texel & 0xff00) << 16),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb332_extremes() {
        let lookup = build_lookup(0, &[0; 256], &[0; 256]);
        assert_eq!(lookup[0x00], 0xff00_0000);
        assert_eq!(lookup[0xff], 0xffff_ffff);
    }

    #[test]
    fn test_ai44_split() {
        let lookup = build_lookup(4, &[0; 256], &[0; 256]);
        assert_eq!(lookup[0xf0], 0xff00_0000);
        assert_eq!(lookup[0x0f], 0x00ff_ffff);
    }

    #[test]
    fn test_palette_forces_opaque() {
        let mut palette = [0u32; 256];
        palette[7] = 0x0012_3456;
        let lookup = build_lookup(5, &[0; 256], &palette);
        assert_eq!(lookup[7], 0xff12_3456);
    }

    #[test]
    fn test_rgb565_full_range() {
        assert_eq!(decode_texel_16(10, 0xffff, &[0; 256]), 0xffff_ffff);
        assert_eq!(decode_texel_16(10, 0x0000, &[0; 256]), 0xff00_0000);
        // pure green: 6-bit channel expands losslessly
        assert_eq!(decode_texel_16(10, 0x07e0, &[0; 256]), 0xff00_ff00);
    }

    #[test]
    fn test_argb1555_alpha_bit() {
        assert_eq!(decode_texel_16(11, 0x7fff, &[0; 256]) >> 24, 0x00);
        assert_eq!(decode_texel_16(11, 0xffff, &[0; 256]) >> 24, 0xff);
    }

    #[test]
    fn test_ai88_alpha_from_high_byte() {
        let lookup = build_lookup(13, &[0; 256], &[0; 256]);
        let texel = decode_texel_16(13, 0x42_80, &lookup);
        assert_eq!(texel >> 24, 0x42);
        assert_eq!(texel & 0xff_ffff, 0x80_8080);
    }

    #[test]
    fn test_format_width_split() {
        assert!(!TexelFormat::from_bits(5).is_16bit());
        assert!(TexelFormat::from_bits(10).is_16bit());
    }
}
