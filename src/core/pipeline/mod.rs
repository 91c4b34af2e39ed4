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

//! Per-pixel pipeline
//!
//! Runs every fragment through the fixed stage order: stipple, depth
//! derivation and test, texture fetch/combine, color path combine with
//! chroma key and alpha mask, alpha test, fog, alpha blend against the
//! destination, dither and write-back. All arithmetic is fixed point and
//! every rejection updates the statistics counters.

use crate::core::state::{alpha, chroma_range, cp, fbz, fog};
use crate::core::tables::{
    dither_g, dither_rb, wfloat_from_iterw, zfloat_from_iterz, RecipLogTable, DITHER_MATRIX_2X2,
    DITHER_MATRIX_4X4,
};
use crate::core::tmu::{combine_texture, pack_argb, split_argb, TmuRaster};

/// Rejection and throughput counters, merged into the stats registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelStats {
    pub pixels_in: u64,
    pub pixels_out: u64,
    pub chroma_fail: u64,
    pub zfunc_fail: u64,
    pub afunc_fail: u64,
}

impl PixelStats {
    pub fn merge(&mut self, other: &PixelStats) {
        self.pixels_in += other.pixels_in;
        self.pixels_out += other.pixels_out;
        self.chroma_fail += other.chroma_fail;
        self.zfunc_fail += other.zfunc_fail;
        self.afunc_fail += other.afunc_fail;
    }
}

/// Snapshot of the mode and color registers the pixel pipeline reads
///
/// Copied per dispatch so workers never touch the register file.
#[derive(Debug, Clone, Copy)]
pub struct PixelRegs {
    pub fbz_mode: u32,
    pub color_path: u32,
    pub alpha_mode: u32,
    pub fog_mode: u32,
    pub stipple: u32,
    pub color0: u32,
    pub color1: u32,
    pub za_color: u32,
    pub chroma_key: u32,
    pub chroma_range: u32,
    pub fog_color: u32,
    pub fog_blend: [u8; 64],
    pub fog_delta: [u8; 64],
}

impl Default for PixelRegs {
    fn default() -> Self {
        Self {
            fbz_mode: 0,
            color_path: 0,
            alpha_mode: 0,
            fog_mode: 0,
            stipple: 0,
            color0: 0,
            color1: 0,
            za_color: 0,
            chroma_key: 0,
            chroma_range: 0,
            fog_color: 0,
            fog_blend: [0; 64],
            fog_delta: [0; 64],
        }
    }
}

/// Raw view of the drawing and aux buffers for one dispatch
///
/// Carries raw pointers so worker threads can write their disjoint
/// partitions without locking.
#[derive(Clone, Copy)]
pub struct FrameTarget {
    pub ram: *mut u16,
    pub mask: usize,
    pub row_pixels: u32,
    pub dest_base: u32,
    /// `u32::MAX` when no aux buffer is allocated
    pub aux_base: u32,
}

// SAFETY: partitions never overlap within a dispatch and the coordinator
// joins every worker before the frame buffer is touched again.
unsafe impl Send for FrameTarget {}
unsafe impl Sync for FrameTarget {}

impl FrameTarget {
    #[inline(always)]
    pub fn has_aux(&self) -> bool {
        self.aux_base != u32::MAX
    }

    #[inline(always)]
    fn index(&self, base: u32, x: i32, y: i32) -> usize {
        (base.wrapping_add(y as u32 * self.row_pixels).wrapping_add(x as u32)) as usize & self.mask
    }

    #[inline(always)]
    pub fn read_dest(&self, x: i32, y: i32) -> u16 {
        // SAFETY: index is masked into the arena; see the Send/Sync note.
        unsafe { *self.ram.add(self.index(self.dest_base, x, y)) }
    }

    #[inline(always)]
    pub fn write_dest(&self, x: i32, y: i32, value: u16) {
        // SAFETY: as above, and this partition owns (x, y).
        unsafe { *self.ram.add(self.index(self.dest_base, x, y)) = value };
    }

    #[inline(always)]
    pub fn read_aux(&self, x: i32, y: i32) -> u16 {
        // SAFETY: callers check has_aux(); index is masked.
        unsafe { *self.ram.add(self.index(self.aux_base, x, y)) }
    }

    #[inline(always)]
    pub fn write_aux(&self, x: i32, y: i32, value: u16) {
        // SAFETY: as above.
        unsafe { *self.ram.add(self.index(self.aux_base, x, y)) = value };
    }
}

/// Iterated parameter values for one pixel
///
/// Colors are 12.12, Z is 20.12, W and the texture coordinates are 48-bit
/// values in an i64 (2.32 for W, 14.18+14 for S/T before perspective).
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelIter {
    pub r: i32,
    pub g: i32,
    pub b: i32,
    pub a: i32,
    pub z: i32,
    pub w: i64,
    pub s: [i64; 2],
    pub t: [i64; 2],
    pub tw: [i64; 2],
}

/// Clamp an iterated 12.12 color channel to 8 bits
///
/// Without the clamp bit the hardware wraps: a value one step below zero
/// reads as 0 and one step past full scale reads as 0xff.
#[inline(always)]
pub fn clamp_channel(iterated: i32, rgbzw_clamp: bool) -> i32 {
    let v = iterated >> 12;
    if rgbzw_clamp {
        v.clamp(0, 0xff)
    } else {
        let v = v & 0xfff;
        if v == 0xfff {
            0
        } else if v == 0x100 {
            0xff
        } else {
            v & 0xff
        }
    }
}

/// Clamp iterated Z (20.12) to the 16-bit depth range
#[inline(always)]
pub fn clamped_z(iterz: i32, rgbzw_clamp: bool) -> i32 {
    let v = iterz >> 12;
    if rgbzw_clamp {
        v.clamp(0, 0xffff)
    } else {
        let v = v & 0xfffff;
        if v == 0xfffff {
            0
        } else if v > 0xffff {
            0xffff
        } else {
            v
        }
    }
}

/// Clamp iterated W to 8 bits for the alpha-from-W selects
#[inline(always)]
fn clamped_w(iterw: i64, rgbzw_clamp: bool) -> i32 {
    let v = (iterw >> 32) as i32;
    if rgbzw_clamp {
        v.clamp(0, 0xff)
    } else {
        let v = v & 0xffff;
        if v == 0xffff {
            0
        } else if v > 0xff {
            0xff
        } else {
            v
        }
    }
}

/// Per-pixel dither adjustment, or zero when dithering is off
#[inline(always)]
pub fn dither_amount(fbz_mode: u32, x: i32, y: i32) -> u32 {
    if !fbz::enable_dithering(fbz_mode) {
        0
    } else if fbz::dither_type_2x2(fbz_mode) {
        u32::from(DITHER_MATRIX_2X2[((y & 3) * 4 + (x & 3)) as usize])
    } else {
        u32::from(DITHER_MATRIX_4X4[((y & 3) * 4 + (x & 3)) as usize])
    }
}

/// Chroma key / chroma range rejection test on the selected other color
fn chroma_test_fails(regs: &PixelRegs, color: u32) -> bool {
    if !chroma_range::enable(regs.chroma_range) {
        return (color ^ regs.chroma_key) & 0x00ff_ffff == 0;
    }

    let channel_in_range = |shift: u32, exclusive: bool| -> u32 {
        let low = (regs.chroma_key >> shift) & 0xff;
        let high = (regs.chroma_range >> shift) & 0xff;
        let test = (color >> shift) & 0xff;
        u32::from((test >= low && test <= high) ^ exclusive)
    };

    let results = (channel_in_range(0, chroma_range::blue_exclusive(regs.chroma_range)) << 2)
        | (channel_in_range(8, chroma_range::green_exclusive(regs.chroma_range)) << 1)
        | channel_in_range(16, chroma_range::red_exclusive(regs.chroma_range));

    if chroma_range::union_mode(regs.chroma_range) {
        results != 0
    } else {
        results == 7
    }
}

/// Depth/alpha comparison, shared by the depth and alpha tests
#[inline(always)]
fn compare(function: u32, value: i32, reference: i32) -> bool {
    match function {
        0 => false,
        1 => value < reference,
        2 => value == reference,
        3 => value <= reference,
        4 => value > reference,
        5 => value != reference,
        6 => value >= reference,
        _ => true,
    }
}

/// Derive the 16-bit depth value for one pixel
pub fn compute_depth(regs: &PixelRegs, iter: &PixelIter) -> i32 {
    let fbz_mode = regs.fbz_mode;
    let clamp = cp::rgbzw_clamp(regs.color_path);

    let mut depth = if fbz::wbuffer_select(fbz_mode) {
        if !fbz::depth_float_select(fbz_mode) {
            i32::from(wfloat_from_iterw(iter.w))
        } else {
            i32::from(zfloat_from_iterz(iter.z))
        }
    } else {
        clamped_z(iter.z, clamp)
    };

    if fbz::enable_depth_bias(fbz_mode) {
        depth += i32::from(regs.za_color as u16 as i16);
        depth = depth.clamp(0, 0xffff);
    }
    depth
}

/// Run the color path combine unit
///
/// `texel` is the output of the texture combine chain (opaque black when
/// texturing is disabled). Returns `None` when the chroma key or alpha
/// mask rejects the pixel, with the matching counter already bumped.
fn color_path_combine(
    regs: &PixelRegs,
    iter: &PixelIter,
    texel: u32,
    stats: &mut PixelStats,
) -> Option<u32> {
    let fbzcp = regs.color_path;
    let clamp = cp::rgbzw_clamp(fbzcp);

    let iter_r = clamp_channel(iter.r, clamp);
    let iter_g = clamp_channel(iter.g, clamp);
    let iter_b = clamp_channel(iter.b, clamp);
    let iter_a = clamp_channel(iter.a, clamp);

    let (tex_r, tex_g, tex_b, tex_a) = split_argb(texel);
    let (c0_r, c0_g, c0_b, c0_a) = split_argb(regs.color0);
    let (c1_r, c1_g, c1_b, c1_a) = split_argb(regs.color1);

    // Select the "other" color
    let (or, og, ob) = match cp::rgb_select(fbzcp) {
        0 => (iter_r, iter_g, iter_b),
        1 => (tex_r, tex_g, tex_b),
        2 => (c1_r, c1_g, c1_b),
        _ => (0, 0, 0),
    };

    if fbz::enable_chromakey(regs.fbz_mode)
        && chroma_test_fails(regs, pack_argb(0, or, og, ob))
    {
        stats.chroma_fail += 1;
        return None;
    }

    let oa = match cp::a_select(fbzcp) {
        0 => iter_a,
        1 => tex_a,
        2 => c1_a,
        _ => 0,
    };

    if fbz::enable_alpha_mask(regs.fbz_mode) && oa & 1 == 0 {
        stats.afunc_fail += 1;
        return None;
    }

    // Select the "local" color; the override bit defers the choice to the
    // texel's alpha MSB
    let local_from_color0 = if cp::local_select_override(fbzcp) {
        texel >> 31 != 0
    } else {
        cp::local_select(fbzcp)
    };
    let (lr, lg, lb) = if local_from_color0 {
        (c0_r, c0_g, c0_b)
    } else {
        (iter_r, iter_g, iter_b)
    };
    let la = match cp::a_local_select(fbzcp) {
        0 => iter_a,
        1 => c0_a,
        2 => (clamped_z(iter.z, clamp) >> 8) & 0xff,
        _ => clamped_w(iter.w, clamp),
    };

    // Combine
    let (mut r, mut g, mut b) = if cp::zero_other(fbzcp) { (0, 0, 0) } else { (or, og, ob) };
    let mut a = if cp::a_zero_other(fbzcp) { 0 } else { oa };

    if cp::sub_clocal(fbzcp) {
        r -= lr;
        g -= lg;
        b -= lb;
    }
    if cp::a_sub_clocal(fbzcp) {
        a -= la;
    }

    let (mut blend_r, mut blend_g, mut blend_b) = match cp::mselect(fbzcp) {
        1 => (lr, lg, lb),
        2 => (oa, oa, oa),
        3 => (la, la, la),
        4 => (tex_a, tex_a, tex_a),
        5 => (tex_r, tex_g, tex_b),
        _ => (0, 0, 0),
    };
    let mut blend_a = match cp::a_mselect(fbzcp) {
        1 => la,
        2 => oa,
        3 => la,
        4 => tex_a,
        _ => 0,
    };

    if !cp::reverse_blend(fbzcp) {
        blend_r ^= 0xff;
        blend_g ^= 0xff;
        blend_b ^= 0xff;
    }
    if !cp::a_reverse_blend(fbzcp) {
        blend_a ^= 0xff;
    }

    r = (r * (blend_r + 1)) >> 8;
    g = (g * (blend_g + 1)) >> 8;
    b = (b * (blend_b + 1)) >> 8;
    a = (a * (blend_a + 1)) >> 8;

    match cp::add_select(fbzcp) {
        1 => {
            r += lr;
            g += lg;
            b += lb;
        }
        2 => {
            r += la;
            g += la;
            b += la;
        }
        _ => {}
    }
    if cp::a_add_select(fbzcp) != 0 {
        a += la;
    }

    let mut r = r.clamp(0, 0xff);
    let mut g = g.clamp(0, 0xff);
    let mut b = b.clamp(0, 0xff);
    let mut a = a.clamp(0, 0xff);

    if cp::invert_output(fbzcp) {
        r ^= 0xff;
        g ^= 0xff;
        b ^= 0xff;
    }
    if cp::a_invert_output(fbzcp) {
        a ^= 0xff;
    }

    Some(pack_argb(a, r, g, b))
}

/// Apply fog to a combined color
fn apply_fog(regs: &PixelRegs, iter: &PixelIter, color: u32, dith4: u32) -> u32 {
    let fogmode = regs.fog_mode;
    let (r, g, b, a) = split_argb(color);
    let (fog_r, fog_g, fog_b, _) = split_argb(regs.fog_color);

    let (fr, fg, fb) = if fog::fog_constant(fogmode) {
        (fog_r, fog_g, fog_b)
    } else {
        // Start from the fog color (or zero), optionally relative to the
        // incoming color, then scale by the blend factor
        let (mut fr, mut fg, mut fb) =
            if !fog::fog_add(fogmode) { (fog_r, fog_g, fog_b) } else { (0, 0, 0) };
        if !fog::fog_mult(fogmode) {
            fr -= r;
            fg -= g;
            fb -= b;
        }

        let clamp = cp::rgbzw_clamp(regs.color_path);
        let blend = match fog::fog_zalpha(fogmode) {
            0 => {
                // Table driven from the W-float depth
                let fogdepth = u32::from(wfloat_from_iterw(iter.w));
                let index = (fogdepth >> 10) as usize & 0x3f;
                let delta = i32::from(regs.fog_delta[index]);
                let mut deltaval = delta * ((fogdepth >> 2) & 0xff) as i32;
                if fog::fog_zones(fogmode) && delta & 2 != 0 {
                    deltaval = -deltaval;
                }
                if fog::fog_dither(fogmode) {
                    deltaval += dith4 as i32;
                }
                deltaval >>= 4;
                i32::from(regs.fog_blend[index]) + deltaval
            }
            1 => clamp_channel(iter.a, clamp),
            2 => (clamped_z(iter.z, clamp) >> 8) & 0xff,
            _ => clamped_w(iter.w, clamp),
        }
        .clamp(0, 0xff)
            + 1;

        ((fr * blend) >> 8, (fg * blend) >> 8, (fb * blend) >> 8)
    };

    let (r, g, b) = if !fog::fog_mult(fogmode) {
        (r + fr, g + fg, b + fb)
    } else {
        (fr, fg, fb)
    };
    pack_argb(a, r.clamp(0, 0xff), g.clamp(0, 0xff), b.clamp(0, 0xff))
}

/// One alpha blend scale factor (0-255 before the +1 in the multiply)
#[inline]
fn blend_scale(code: u32, src_alpha: i32, dst_alpha: i32, other: i32, prefog: i32) -> i32 {
    match code {
        0 => 0x00,
        1 => src_alpha,
        2 => other,
        3 => dst_alpha,
        4 => 0xff,
        5 => src_alpha ^ 0xff,
        6 => other ^ 0xff,
        7 => dst_alpha ^ 0xff,
        15 => prefog,
        _ => 0x00,
    }
}

/// Blend a combined color against the destination pixel
fn alpha_blend(
    regs: &PixelRegs,
    color: u32,
    prefog: u32,
    dest: u16,
    dest_alpha: i32,
    dith4: u32,
) -> u32 {
    let amode = regs.alpha_mode;
    let (sr, sg, sb, sa) = split_argb(color);
    let (pr, pg, pb, _) = split_argb(prefog);

    // Expand the 565 destination; the subtract mode backs the dither
    // adjustment out before blending
    let mut dr = i32::from((dest >> 8) & 0xf8);
    let mut dg = i32::from((dest >> 3) & 0xfc);
    let mut db = i32::from((dest << 3) & 0xf8);
    if fbz::alpha_dither_subtract(regs.fbz_mode) {
        let dith = dith4 as i32;
        dr = (dr - (dith >> 1)).max(0);
        dg = (dg - (dith >> 2)).max(0);
        db = (db - (dith >> 1)).max(0);
    }
    let da = dest_alpha;

    let src_rgb = alpha::src_rgb_factor(amode);
    let dst_rgb = alpha::dst_rgb_factor(amode);
    let src_a = alpha::src_alpha_factor(amode);
    let dst_a = alpha::dst_alpha_factor(amode);

    let r = (sr * (blend_scale(src_rgb, sa, da, dr, 0) + 1)
        + dr * (blend_scale(dst_rgb, sa, da, sr, pr) + 1))
        >> 8;
    let g = (sg * (blend_scale(src_rgb, sa, da, dg, 0) + 1)
        + dg * (blend_scale(dst_rgb, sa, da, sg, pg) + 1))
        >> 8;
    let b = (sb * (blend_scale(src_rgb, sa, da, db, 0) + 1)
        + db * (blend_scale(dst_rgb, sa, da, sb, pb) + 1))
        >> 8;
    let a = (sa * (blend_scale(src_a, sa, da, da, 0) + 1)
        + da * (blend_scale(dst_a, sa, da, sa, 0) + 1))
        >> 8;

    pack_argb(a.clamp(0, 0xff), r.clamp(0, 0xff), g.clamp(0, 0xff), b.clamp(0, 0xff))
}

/// Pack a color to 565, dithered when enabled
#[inline]
pub fn pack_565(fbz_mode: u32, color: u32, x: i32, y: i32) -> u16 {
    let (r, g, b, _) = split_argb(color);
    if fbz::enable_dithering(fbz_mode) {
        let dith = dither_amount(fbz_mode, x, y) as i32;
        let r5 = dither_rb(r, dith);
        let g6 = dither_g(g, dith);
        let b5 = dither_rb(b, dith);
        ((r5 << 11) | (g6 << 5) | b5) as u16
    } else {
        (((r as u32 >> 3) << 11) | ((g as u32 >> 2) << 5) | (b as u32 >> 3)) as u16
    }
}

/// Run one pixel through the full pipeline
///
/// `ordinal` is the pixel's index within the triangle in scan order; the
/// rotating stipple derives its shift from it so output is identical for
/// any worker count.
#[allow(clippy::too_many_arguments)]
pub fn pixel_pipeline(
    regs: &PixelRegs,
    target: &FrameTarget,
    tables: &RecipLogTable,
    tmus: &[TmuRaster],
    lod_base: &[i32; 2],
    x: i32,
    y: i32,
    ordinal: u32,
    iter: &PixelIter,
    stats: &mut PixelStats,
) {
    let fbz_mode = regs.fbz_mode;
    stats.pixels_in += 1;

    // Stipple
    if fbz::enable_stipple(fbz_mode) {
        if fbz::stipple_pattern(fbz_mode) {
            let bit = ((y & 3) << 3) | (!x & 7);
            if regs.stipple >> bit & 1 == 0 {
                return;
            }
        } else {
            // Rotate mode: the hardware rotates once per pixel, so the
            // effective shift is the pixel's ordinal position
            let rotated = regs.stipple.rotate_left((ordinal + 1) & 31);
            if rotated & 0x8000_0000 == 0 {
                return;
            }
        }
    }

    // Depth
    let depth = compute_depth(regs, iter);
    if fbz::enable_depthbuf(fbz_mode) && target.has_aux() {
        let source = if fbz::depth_source_compare(fbz_mode) {
            i32::from(regs.za_color as u16)
        } else {
            depth
        };
        let stored = i32::from(target.read_aux(x, y));
        if !compare(fbz::depth_function(fbz_mode), source, stored) {
            stats.zfunc_fail += 1;
            return;
        }
    }

    // Texture chain: the upstream unit feeds the downstream one
    let texel = if cp::texture_enable(regs.color_path) && !tmus.is_empty() {
        let mut combined = 0u32;
        for unit in (0..tmus.len()).rev() {
            let tmu = &tmus[unit];
            let dith4 = (dither_amount(fbz_mode, x, y) as i32) << 4;
            let (local, lod) = tmu.fetch_texel(
                tables,
                iter.s[unit],
                iter.t[unit],
                iter.tw[unit],
                lod_base[unit],
                dith4,
            );
            combined = combine_texture(tmu, local, combined, lod);
        }
        combined
    } else {
        0xff00_0000
    };

    // Color path (chroma key and alpha mask live inside)
    let Some(color) = color_path_combine(regs, iter, texel, stats) else {
        return;
    };

    // Alpha test
    if alpha::alphatest(regs.alpha_mode) {
        let a = (color >> 24) as i32;
        let reference = alpha::alpharef(regs.alpha_mode) as i32;
        if !compare(alpha::alphafunction(regs.alpha_mode), a, reference) {
            stats.afunc_fail += 1;
            return;
        }
    }

    // Fog
    let prefog = color;
    let dith4 = dither_amount(fbz_mode, x, y);
    let color = if fog::enable_fog(regs.fog_mode) {
        apply_fog(regs, iter, color, dith4)
    } else {
        color
    };

    // Alpha blend
    let color = if alpha::alphablend(regs.alpha_mode) {
        let dest = target.read_dest(x, y);
        let dest_alpha = if fbz::enable_alpha_planes(fbz_mode) && target.has_aux() {
            i32::from(target.read_aux(x, y) & 0xff)
        } else {
            0xff
        };
        alpha_blend(regs, color, prefog, dest, dest_alpha, dith4)
    } else {
        color
    };

    // Write-back
    if fbz::rgb_buffer_mask(fbz_mode) {
        target.write_dest(x, y, pack_565(fbz_mode, color, x, y));
    }
    if fbz::aux_buffer_mask(fbz_mode) && target.has_aux() {
        if !fbz::enable_alpha_planes(fbz_mode) {
            target.write_aux(x, y, depth as u16);
        } else {
            target.write_aux(x, y, (color >> 24) as u16);
        }
    }
    stats.pixels_out += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(width: u32, height: u32, ram: &mut Vec<u16>) -> FrameTarget {
        let pixels = (width * height * 2).next_power_of_two() as usize;
        ram.resize(pixels, 0);
        FrameTarget {
            ram: ram.as_mut_ptr(),
            mask: pixels - 1,
            row_pixels: width,
            dest_base: 0,
            aux_base: width * height,
        }
    }

    fn flat_regs() -> PixelRegs {
        PixelRegs {
            // rgb buffer writes on, aux writes on, depth buffering off
            fbz_mode: (1 << 9) | (1 << 10),
            // all-zero color path passes the iterated color straight
            // through (mselect 0 inverts to a full-scale blend factor)
            color_path: 0,
            ..PixelRegs::default()
        }
    }

    fn white_iter() -> PixelIter {
        PixelIter {
            r: 0xff << 12,
            g: 0xff << 12,
            b: 0xff << 12,
            a: 0xff << 12,
            ..PixelIter::default()
        }
    }

    #[test]
    fn test_passthrough_writes_white() {
        let mut ram = Vec::new();
        let t = target(4, 4, &mut ram);
        let tables = RecipLogTable::new();
        let mut stats = PixelStats::default();
        pixel_pipeline(
            &flat_regs(),
            &t,
            &tables,
            &[],
            &[0; 2],
            1,
            1,
            0,
            &white_iter(),
            &mut stats,
        );
        assert_eq!(t.read_dest(1, 1), 0xffff);
        assert_eq!(stats.pixels_in, 1);
        assert_eq!(stats.pixels_out, 1);
    }

    #[test]
    fn test_depth_less_is_strict() {
        let mut ram = Vec::new();
        let t = target(4, 4, &mut ram);
        let tables = RecipLogTable::new();
        let mut regs = flat_regs();
        // depth buffering on, function LESS, z-buffer (not w)
        regs.fbz_mode |= (1 << 4) | (1 << 5);
        t.write_aux(0, 0, 1000);

        let mut iter = white_iter();
        let mut stats = PixelStats::default();
        iter.z = 999 << 12;
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 0, 0, 0, &iter, &mut stats);
        assert_eq!(stats.pixels_out, 1);
        assert_eq!(t.read_aux(0, 0), 999);

        // equal depth must fail LESS
        t.write_aux(0, 0, 1000);
        iter.z = 1000 << 12;
        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 0, 0, 0, &iter, &mut stats);
        assert_eq!(stats.pixels_out, 0);
        assert_eq!(stats.zfunc_fail, 1);
    }

    #[test]
    fn test_chroma_key_exact_match_only() {
        let mut regs = flat_regs();
        regs.fbz_mode |= 1 << 1;
        regs.chroma_key = 0x0022_4466;

        let keyed = PixelIter {
            r: 0x22 << 12,
            g: 0x44 << 12,
            b: 0x66 << 12,
            a: 0xff << 12,
            ..PixelIter::default()
        };
        let mut ram = Vec::new();
        let t = target(4, 4, &mut ram);
        let tables = RecipLogTable::new();

        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 0, 0, 0, &keyed, &mut stats);
        assert_eq!(stats.chroma_fail, 1);
        assert_eq!(stats.pixels_out, 0);

        // off by one in blue survives
        let mut near = keyed;
        near.b = 0x67 << 12;
        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 0, 0, 0, &near, &mut stats);
        assert_eq!(stats.chroma_fail, 0);
        assert_eq!(stats.pixels_out, 1);
    }

    #[test]
    fn test_chroma_range_union_vs_intersection() {
        let mut regs = flat_regs();
        regs.fbz_mode |= 1 << 1;
        regs.chroma_key = 0x0010_1010;
        // range high = 0x20 per channel, enable bit
        regs.chroma_range = (1 << 28) | 0x0020_2020;

        // only red in range: union discards, intersection keeps
        let color = 0x0018_8080;
        regs.chroma_range |= 1 << 27;
        assert!(chroma_test_fails(&regs, color));
        regs.chroma_range &= !(1 << 27);
        assert!(!chroma_test_fails(&regs, color));

        // all channels in range: intersection discards too
        assert!(chroma_test_fails(&regs, 0x0018_1818));
    }

    #[test]
    fn test_alpha_blend_half_scale() {
        // (200 * (128 + 1)) >> 8 == 100 exactly
        let regs = PixelRegs {
            // src factor = src alpha, dst factor = zero
            alpha_mode: (1 << 4) | (1 << 8),
            ..PixelRegs::default()
        };
        let color = pack_argb(128, 200, 200, 200);
        let out = alpha_blend(&regs, color, color, 0, 0xff, 0);
        let (r, g, b, _) = split_argb(out);
        assert_eq!((r, g, b), (100, 100, 100));
    }

    #[test]
    fn test_alpha_test_rejects() {
        let mut regs = flat_regs();
        // alpha test on, function GREATER, ref 0x80
        regs.alpha_mode = 1 | (4 << 1) | (0x80 << 24);

        let mut ram = Vec::new();
        let t = target(4, 4, &mut ram);
        let tables = RecipLogTable::new();
        let mut iter = white_iter();
        iter.a = 0x80 << 12;
        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 0, 0, 0, &iter, &mut stats);
        assert_eq!(stats.afunc_fail, 1);

        iter.a = 0x81 << 12;
        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 0, 0, 0, &iter, &mut stats);
        assert_eq!(stats.pixels_out, 1);
    }

    #[test]
    fn test_pack_565_applies_dither_matrix() {
        let fbz_mode = 1 << 8;
        let color = 0x00d0_d0d0;
        let mut packed = std::collections::BTreeSet::new();
        for y in 0..4 {
            for x in 0..4 {
                let dith = dither_amount(fbz_mode, x, y) as i32;
                let expect = ((dither_rb(0xd0, dith) << 11)
                    | (dither_g(0xd0, dith) << 5)
                    | dither_rb(0xd0, dith)) as u16;
                assert_eq!(pack_565(fbz_mode, color, x, y), expect);
                packed.insert(expect);
            }
        }
        // the matrix must actually vary the packed value within a block
        assert!(packed.len() > 1);
        // dithering off truncates
        assert_eq!(pack_565(0, 0x00ff_ffff, 0, 0), 0xffff);
    }

    #[test]
    fn test_stipple_pattern_masks_pixels() {
        let mut regs = flat_regs();
        regs.fbz_mode |= (1 << 2) | (1 << 12);
        regs.stipple = 0;

        let mut ram = Vec::new();
        let t = target(8, 4, &mut ram);
        let tables = RecipLogTable::new();
        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 3, 1, 0, &white_iter(), &mut stats);
        assert_eq!(stats.pixels_out, 0);

        // set exactly the bit for (x=3, y=1): index = (1<<3) | (~3 & 7)
        regs.stipple = 1 << ((1 << 3) | (!3i32 & 7));
        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 3, 1, 0, &white_iter(), &mut stats);
        assert_eq!(stats.pixels_out, 1);
    }

    #[test]
    fn test_stipple_rotate_uses_ordinal() {
        let mut regs = flat_regs();
        regs.fbz_mode |= 1 << 2;
        // alternating bits: every other ordinal passes
        regs.stipple = 0xaaaa_aaaa;

        let mut ram = Vec::new();
        let t = target(8, 4, &mut ram);
        let tables = RecipLogTable::new();
        let mut pass = [false; 4];
        for (ordinal, slot) in pass.iter_mut().enumerate() {
            let mut stats = PixelStats::default();
            pixel_pipeline(
                &regs,
                &t,
                &tables,
                &[],
                &[0; 2],
                ordinal as i32,
                0,
                ordinal as u32,
                &white_iter(),
                &mut stats,
            );
            *slot = stats.pixels_out == 1;
        }
        assert_eq!(pass[0], pass[2]);
        assert_eq!(pass[1], pass[3]);
        assert_ne!(pass[0], pass[1]);
    }

    #[test]
    fn test_depth_bias_applies_sign() {
        let mut regs = flat_regs();
        regs.fbz_mode |= 1 << 16;
        regs.za_color = 0xffff; // -1 as i16
        let mut iter = PixelIter::default();
        iter.z = 100 << 12;
        assert_eq!(compute_depth(&regs, &iter), 99);
    }

    #[test]
    fn test_wbuffer_depth_uses_wfloat() {
        let regs = PixelRegs {
            fbz_mode: 1 << 3,
            ..PixelRegs::default()
        };
        let mut iter = PixelIter::default();
        iter.w = 1 << 32; // w == 1.0 encodes near the front
        let d = compute_depth(&regs, &iter);
        assert_eq!(d, i32::from(wfloat_from_iterw(1 << 32)));
    }

    #[test]
    fn test_clamp_channel_wrap_quirk() {
        assert_eq!(clamp_channel(-1 << 12, false), 0);
        assert_eq!(clamp_channel(0x100 << 12, false), 0xff);
        assert_eq!(clamp_channel(-5 << 12, true), 0);
        assert_eq!(clamp_channel(0x1ff << 12, true), 0xff);
    }

    #[test]
    fn test_fog_constant_adds_color() {
        let regs = PixelRegs {
            fog_mode: 1 | (1 << 5),
            fog_color: 0x0020_3040,
            ..PixelRegs::default()
        };
        let out = apply_fog(&regs, &PixelIter::default(), pack_argb(0xff, 0x10, 0x10, 0x10), 0);
        let (r, g, b, _) = split_argb(out);
        assert_eq!((r, g, b), (0x30, 0x40, 0x50));
    }

    #[test]
    fn test_aux_write_selects_alpha_planes() {
        let mut regs = flat_regs();
        regs.fbz_mode |= 1 << 18;
        let mut ram = Vec::new();
        let t = target(4, 4, &mut ram);
        let tables = RecipLogTable::new();
        let mut iter = white_iter();
        iter.a = 0x5a << 12;
        let mut stats = PixelStats::default();
        pixel_pipeline(&regs, &t, &tables, &[], &[0; 2], 2, 2, 0, &iter, &mut stats);
        assert_eq!(t.read_aux(2, 2), 0x5a);
    }
}
