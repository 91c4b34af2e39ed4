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

//! Decoded pipeline state
//!
//! The chip's rendering behavior is controlled by five packed 32-bit mode
//! registers: `fbzMode`, `fbzColorPath`, `alphaMode`, `fogMode`, and one
//! `textureMode` per TMU. Both backends consume an immutable
//! [`PipelineState`] snapshot of these words, taken when a triangle or
//! fastfill command fires.
//!
//! Field extraction goes through plain accessor functions on the raw words
//! rather than unions or bit-field structs, one module per register.

/// Immutable snapshot of the mode registers for one drawing command
///
/// Snapshots compare by value: two commands issued without intervening mode
/// writes carry equal (not merely identical) state, which the GPU command
/// buffer exploits to merge consecutive draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipelineState {
    /// fbzMode: depth/dither/write-mask/stipple control
    pub fbz_mode: u32,

    /// fbzColorPath: color combine unit control
    pub color_path: u32,

    /// alphaMode: alpha test and blend factor control
    pub alpha_mode: u32,

    /// fogMode: fog enable and source control
    pub fog_mode: u32,

    /// textureMode for TMU0 and TMU1
    pub texture_mode: [u32; 2],
}

impl PipelineState {
    /// Reduce to the subset of bits that influence GPU shader text
    ///
    /// Blend factors, the alpha-test reference, depth functions and write
    /// masks are applied as fixed-function state on the GPU side, so they
    /// are masked out here; leaving them in would only multiply shader
    /// variants without changing any generated source.
    pub fn reduced(&self, tmu_enabled: [bool; 2]) -> ReducedState {
        const FBZ_SHADER_BITS: u32 = (1 << 1) | (1 << 13); // chroma key, alpha mask
        const ALPHA_SHADER_BITS: u32 = 0x0000_000f; // test enable + function
        const TEX_SHADER_BITS: u32 = 0x3fff_f001; // combine selects + perspective

        ReducedState {
            fbz_mode: self.fbz_mode & FBZ_SHADER_BITS,
            color_path: self.color_path & 0x0fff_ffff,
            alpha_mode: self.alpha_mode & ALPHA_SHADER_BITS,
            fog_mode: self.fog_mode & 0xff,
            texture_mode: [
                if tmu_enabled[0] {
                    self.texture_mode[0] & TEX_SHADER_BITS
                } else {
                    0
                },
                if tmu_enabled[1] {
                    self.texture_mode[1] & TEX_SHADER_BITS
                } else {
                    0
                },
            ],
            tmu_enabled,
        }
    }
}

/// The subset of [`PipelineState`] that affects synthesized shader source
///
/// Used as the key of the shader variant cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReducedState {
    pub fbz_mode: u32,
    pub color_path: u32,
    pub alpha_mode: u32,
    pub fog_mode: u32,
    pub texture_mode: [u32; 2],
    pub tmu_enabled: [bool; 2],
}

/// fbzMode field accessors
pub mod fbz {
    #[inline(always)]
    pub fn enable_clipping(v: u32) -> bool {
        v & 1 != 0
    }

    #[inline(always)]
    pub fn enable_chromakey(v: u32) -> bool {
        (v >> 1) & 1 != 0
    }

    #[inline(always)]
    pub fn enable_stipple(v: u32) -> bool {
        (v >> 2) & 1 != 0
    }

    /// 0 = Z-buffer depth, 1 = W-buffer depth
    #[inline(always)]
    pub fn wbuffer_select(v: u32) -> bool {
        (v >> 3) & 1 != 0
    }

    #[inline(always)]
    pub fn enable_depthbuf(v: u32) -> bool {
        (v >> 4) & 1 != 0
    }

    /// Depth comparison function (0-7: never..always)
    #[inline(always)]
    pub fn depth_function(v: u32) -> u32 {
        (v >> 5) & 7
    }

    #[inline(always)]
    pub fn enable_dithering(v: u32) -> bool {
        (v >> 8) & 1 != 0
    }

    #[inline(always)]
    pub fn rgb_buffer_mask(v: u32) -> bool {
        (v >> 9) & 1 != 0
    }

    #[inline(always)]
    pub fn aux_buffer_mask(v: u32) -> bool {
        (v >> 10) & 1 != 0
    }

    /// 0 = 4×4 dither matrix, 1 = 2×2
    #[inline(always)]
    pub fn dither_type_2x2(v: u32) -> bool {
        (v >> 11) & 1 != 0
    }

    /// 0 = rotate mode, 1 = pattern mode
    #[inline(always)]
    pub fn stipple_pattern(v: u32) -> bool {
        (v >> 12) & 1 != 0
    }

    #[inline(always)]
    pub fn enable_alpha_mask(v: u32) -> bool {
        (v >> 13) & 1 != 0
    }

    /// Draw-buffer selector (0 = front, 1 = back, 2/3 = reserved)
    #[inline(always)]
    pub fn draw_buffer(v: u32) -> u32 {
        (v >> 14) & 3
    }

    #[inline(always)]
    pub fn enable_depth_bias(v: u32) -> bool {
        (v >> 16) & 1 != 0
    }

    /// 0 = top-left origin, 1 = bottom-left origin
    #[inline(always)]
    pub fn y_origin_inverted(v: u32) -> bool {
        (v >> 17) & 1 != 0
    }

    /// Aux buffer carries alpha instead of depth
    #[inline(always)]
    pub fn enable_alpha_planes(v: u32) -> bool {
        (v >> 18) & 1 != 0
    }

    #[inline(always)]
    pub fn alpha_dither_subtract(v: u32) -> bool {
        (v >> 19) & 1 != 0
    }

    /// Depth test compares against the zaColor constant instead of the iterator
    #[inline(always)]
    pub fn depth_source_compare(v: u32) -> bool {
        (v >> 20) & 1 != 0
    }

    /// W-buffer depth uses the floating Z encoding instead of the W encoding
    #[inline(always)]
    pub fn depth_float_select(v: u32) -> bool {
        (v >> 21) & 1 != 0
    }
}

/// fbzColorPath field accessors
pub mod cp {
    /// RGB "other" source (0 = iterated, 1 = texture, 2 = color1)
    #[inline(always)]
    pub fn rgb_select(v: u32) -> u32 {
        v & 3
    }

    /// Alpha "other" source (0 = iterated, 1 = texture, 2 = color1)
    #[inline(always)]
    pub fn a_select(v: u32) -> u32 {
        (v >> 2) & 3
    }

    /// RGB "local" source (0 = iterated, 1 = color0)
    #[inline(always)]
    pub fn local_select(v: u32) -> bool {
        (v >> 4) & 1 != 0
    }

    /// Alpha "local" source (0 = iterated, 1 = color0, 2 = clamped Z, 3 = clamped W)
    #[inline(always)]
    pub fn a_local_select(v: u32) -> u32 {
        (v >> 5) & 3
    }

    /// Texture alpha MSB gates the RGB local select
    #[inline(always)]
    pub fn local_select_override(v: u32) -> bool {
        (v >> 7) & 1 != 0
    }

    #[inline(always)]
    pub fn zero_other(v: u32) -> bool {
        (v >> 8) & 1 != 0
    }

    #[inline(always)]
    pub fn sub_clocal(v: u32) -> bool {
        (v >> 9) & 1 != 0
    }

    /// Blend multiplier source (0 = zero, 1 = clocal, 2 = aother,
    /// 3 = alocal, 4 = texture alpha, 5 = texture RGB)
    #[inline(always)]
    pub fn mselect(v: u32) -> u32 {
        (v >> 10) & 7
    }

    #[inline(always)]
    pub fn reverse_blend(v: u32) -> bool {
        (v >> 13) & 1 != 0
    }

    /// Post-blend addend (0/3 = none, 1 = clocal, 2 = alocal)
    #[inline(always)]
    pub fn add_select(v: u32) -> u32 {
        (v >> 14) & 3
    }

    #[inline(always)]
    pub fn invert_output(v: u32) -> bool {
        (v >> 16) & 1 != 0
    }

    #[inline(always)]
    pub fn a_zero_other(v: u32) -> bool {
        (v >> 17) & 1 != 0
    }

    #[inline(always)]
    pub fn a_sub_clocal(v: u32) -> bool {
        (v >> 18) & 1 != 0
    }

    /// Alpha blend multiplier (0 = zero, 1/3 = alocal, 2 = aother, 4 = texture alpha)
    #[inline(always)]
    pub fn a_mselect(v: u32) -> u32 {
        (v >> 19) & 7
    }

    #[inline(always)]
    pub fn a_reverse_blend(v: u32) -> bool {
        (v >> 22) & 1 != 0
    }

    #[inline(always)]
    pub fn a_add_select(v: u32) -> u32 {
        (v >> 23) & 3
    }

    #[inline(always)]
    pub fn a_invert_output(v: u32) -> bool {
        (v >> 25) & 1 != 0
    }

    /// Subpixel adjustment of iterator start values
    #[inline(always)]
    pub fn subpixel_adjust(v: u32) -> bool {
        (v >> 26) & 1 != 0
    }

    #[inline(always)]
    pub fn texture_enable(v: u32) -> bool {
        (v >> 27) & 1 != 0
    }

    /// Clamp iterated RGBA/Z/W instead of wrapping
    #[inline(always)]
    pub fn rgbzw_clamp(v: u32) -> bool {
        (v >> 28) & 1 != 0
    }
}

/// alphaMode field accessors
pub mod alpha {
    #[inline(always)]
    pub fn alphatest(v: u32) -> bool {
        v & 1 != 0
    }

    /// Alpha test function (0-7: never..always)
    #[inline(always)]
    pub fn alphafunction(v: u32) -> u32 {
        (v >> 1) & 7
    }

    #[inline(always)]
    pub fn alphablend(v: u32) -> bool {
        (v >> 4) & 1 != 0
    }

    #[inline(always)]
    pub fn src_rgb_factor(v: u32) -> u32 {
        (v >> 8) & 15
    }

    #[inline(always)]
    pub fn dst_rgb_factor(v: u32) -> u32 {
        (v >> 12) & 15
    }

    #[inline(always)]
    pub fn src_alpha_factor(v: u32) -> u32 {
        (v >> 16) & 15
    }

    #[inline(always)]
    pub fn dst_alpha_factor(v: u32) -> u32 {
        (v >> 20) & 15
    }

    /// Alpha test reference value
    #[inline(always)]
    pub fn alpharef(v: u32) -> u32 {
        (v >> 24) & 0xff
    }
}

/// fogMode field accessors
pub mod fog {
    #[inline(always)]
    pub fn enable_fog(v: u32) -> bool {
        v & 1 != 0
    }

    /// Start from zero instead of the fog color
    #[inline(always)]
    pub fn fog_add(v: u32) -> bool {
        (v >> 1) & 1 != 0
    }

    /// Replace the color instead of adding to it
    #[inline(always)]
    pub fn fog_mult(v: u32) -> bool {
        (v >> 2) & 1 != 0
    }

    /// Fog blend source (0 = table, 1 = iterated alpha, 2 = clamped Z, 3 = clamped W)
    #[inline(always)]
    pub fn fog_zalpha(v: u32) -> u32 {
        (v >> 3) & 3
    }

    /// Constant fog color, bypassing the blend entirely
    #[inline(always)]
    pub fn fog_constant(v: u32) -> bool {
        (v >> 5) & 1 != 0
    }

    #[inline(always)]
    pub fn fog_dither(v: u32) -> bool {
        (v >> 6) & 1 != 0
    }

    /// Table deltas may be negated (bit 1 of the delta selects)
    #[inline(always)]
    pub fn fog_zones(v: u32) -> bool {
        (v >> 7) & 1 != 0
    }
}

/// textureMode field accessors
pub mod tex {
    #[inline(always)]
    pub fn enable_perspective(v: u32) -> bool {
        v & 1 != 0
    }

    #[inline(always)]
    pub fn minification_filter(v: u32) -> bool {
        (v >> 1) & 1 != 0
    }

    #[inline(always)]
    pub fn magnification_filter(v: u32) -> bool {
        (v >> 2) & 1 != 0
    }

    #[inline(always)]
    pub fn clamp_neg_w(v: u32) -> bool {
        (v >> 3) & 1 != 0
    }

    #[inline(always)]
    pub fn enable_lod_dither(v: u32) -> bool {
        (v >> 4) & 1 != 0
    }

    /// Which of the two NCC tables decodes YIQ texels
    #[inline(always)]
    pub fn ncc_table_select(v: u32) -> usize {
        ((v >> 5) & 1) as usize
    }

    #[inline(always)]
    pub fn clamp_s(v: u32) -> bool {
        (v >> 6) & 1 != 0
    }

    #[inline(always)]
    pub fn clamp_t(v: u32) -> bool {
        (v >> 7) & 1 != 0
    }

    /// Texel format (0-15, see [`crate::core::tmu::TexelFormat`])
    #[inline(always)]
    pub fn format(v: u32) -> u32 {
        (v >> 8) & 0xf
    }

    #[inline(always)]
    pub fn tc_zero_other(v: u32) -> bool {
        (v >> 12) & 1 != 0
    }

    #[inline(always)]
    pub fn tc_sub_clocal(v: u32) -> bool {
        (v >> 13) & 1 != 0
    }

    /// RGB blend multiplier (0 = zero, 1 = clocal, 2 = aother,
    /// 3 = alocal, 4 = detail factor, 5 = LOD fraction)
    #[inline(always)]
    pub fn tc_mselect(v: u32) -> u32 {
        (v >> 14) & 7
    }

    #[inline(always)]
    pub fn tc_reverse_blend(v: u32) -> bool {
        (v >> 17) & 1 != 0
    }

    #[inline(always)]
    pub fn tc_add_select(v: u32) -> u32 {
        (v >> 18) & 3
    }

    #[inline(always)]
    pub fn tc_invert_output(v: u32) -> bool {
        (v >> 20) & 1 != 0
    }

    #[inline(always)]
    pub fn tca_zero_other(v: u32) -> bool {
        (v >> 21) & 1 != 0
    }

    #[inline(always)]
    pub fn tca_sub_clocal(v: u32) -> bool {
        (v >> 22) & 1 != 0
    }

    #[inline(always)]
    pub fn tca_mselect(v: u32) -> u32 {
        (v >> 23) & 7
    }

    #[inline(always)]
    pub fn tca_reverse_blend(v: u32) -> bool {
        (v >> 26) & 1 != 0
    }

    #[inline(always)]
    pub fn tca_add_select(v: u32) -> u32 {
        (v >> 27) & 3
    }

    #[inline(always)]
    pub fn tca_invert_output(v: u32) -> bool {
        (v >> 29) & 1 != 0
    }
}

/// tLOD field accessors
pub mod tlod {
    /// Minimum LOD, 4.2 fixed point
    #[inline(always)]
    pub fn lodmin(v: u32) -> u32 {
        v & 0x3f
    }

    /// Maximum LOD, 4.2 fixed point
    #[inline(always)]
    pub fn lodmax(v: u32) -> u32 {
        (v >> 6) & 0x3f
    }

    /// LOD bias, signed 4.2 fixed point
    #[inline(always)]
    pub fn lodbias(v: u32) -> u32 {
        (v >> 12) & 0x3f
    }

    /// Only odd mipmap levels are resident
    #[inline(always)]
    pub fn lod_odd(v: u32) -> bool {
        (v >> 18) & 1 != 0
    }

    /// Mipmap levels are split across TMUs
    #[inline(always)]
    pub fn lod_tsplit(v: u32) -> bool {
        (v >> 19) & 1 != 0
    }

    /// Aspect narrows T (set) or S (clear)
    #[inline(always)]
    pub fn lod_s_is_wider(v: u32) -> bool {
        (v >> 20) & 1 != 0
    }

    /// log2 aspect ratio (0-3)
    #[inline(always)]
    pub fn lod_aspect(v: u32) -> u32 {
        (v >> 21) & 3
    }

    /// Separate base address per mipmap level
    #[inline(always)]
    pub fn multi_base_addr(v: u32) -> bool {
        (v >> 24) & 1 != 0
    }
}

/// tDetail field accessors
pub mod tdetail {
    #[inline(always)]
    pub fn detail_max(v: u32) -> i32 {
        (v & 0xff) as i32
    }

    /// Detail bias, expanded to the 8.8 LOD scale
    #[inline(always)]
    pub fn detail_bias(v: u32) -> i32 {
        i32::from((((v >> 8) & 0x3f) as u8 as i8) << 2) << 6
    }

    #[inline(always)]
    pub fn detail_scale(v: u32) -> u32 {
        (v >> 14) & 7
    }
}

/// chromaRange field accessors
pub mod chroma_range {
    #[inline(always)]
    pub fn blue_exclusive(v: u32) -> bool {
        (v >> 24) & 1 != 0
    }

    #[inline(always)]
    pub fn green_exclusive(v: u32) -> bool {
        (v >> 25) & 1 != 0
    }

    #[inline(always)]
    pub fn red_exclusive(v: u32) -> bool {
        (v >> 26) & 1 != 0
    }

    /// Union (any channel) vs intersection (all channels) of the range tests
    #[inline(always)]
    pub fn union_mode(v: u32) -> bool {
        (v >> 27) & 1 != 0
    }

    #[inline(always)]
    pub fn enable(v: u32) -> bool {
        (v >> 28) & 1 != 0
    }
}

/// lfbMode field accessors
pub mod lfb {
    #[inline(always)]
    pub fn write_format(v: u32) -> u32 {
        v & 0xf
    }

    #[inline(always)]
    pub fn write_buffer_select(v: u32) -> u32 {
        (v >> 4) & 3
    }

    #[inline(always)]
    pub fn read_buffer_select(v: u32) -> u32 {
        (v >> 6) & 3
    }

    #[inline(always)]
    pub fn enable_pixel_pipeline(v: u32) -> bool {
        (v >> 8) & 1 != 0
    }

    #[inline(always)]
    pub fn y_origin_inverted(v: u32) -> bool {
        (v >> 13) & 1 != 0
    }
}
