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

//! Triangle rasterization
//!
//! The host supplies vertex positions (12.4 fixed point) and parameter
//! start values plus X/Y gradients; the chip never computes slopes itself.
//! Setup scan-converts the triangle into pixel spans with a running
//! ordinal, so a dispatch can be cut into contiguous pixel ranges at any
//! boundary and every partitioning renders the identical image.

pub mod workers;

use std::ops::Range;

use crate::core::fbi::ClipRect;
use crate::core::pipeline::{pixel_pipeline, FrameTarget, PixelIter, PixelRegs, PixelStats};
use crate::core::state::cp;
use crate::core::tables::RecipLogTable;
use crate::core::tmu::TmuRaster;

/// Per-TMU iterated parameter block (S/T are 14.18 shifted up 14, W 2.30
/// shifted up 16, all 48-bit in an i64)
#[derive(Debug, Clone, Copy, Default)]
pub struct TmuParams {
    pub start_s: i64,
    pub start_t: i64,
    pub start_w: i64,
    pub ds_dx: i64,
    pub dt_dx: i64,
    pub dw_dx: i64,
    pub ds_dy: i64,
    pub dt_dy: i64,
    pub dw_dy: i64,
}

/// Everything the host latched for one triangle command
#[derive(Debug, Clone, Copy, Default)]
pub struct TriangleParams {
    // Vertex positions, 12.4 fixed point
    pub ax: i32,
    pub ay: i32,
    pub bx: i32,
    pub by: i32,
    pub cx: i32,
    pub cy: i32,

    // Color/depth start values (12.12 colors, 20.12 Z) and gradients,
    // all anchored at vertex A
    pub start_r: i32,
    pub start_g: i32,
    pub start_b: i32,
    pub start_a: i32,
    pub start_z: i32,
    pub drdx: i32,
    pub dgdx: i32,
    pub dbdx: i32,
    pub dadx: i32,
    pub dzdx: i32,
    pub drdy: i32,
    pub dgdy: i32,
    pub dbdy: i32,
    pub dady: i32,
    pub dzdy: i32,

    // W iterator, 2.30 widened to 48 bits
    pub start_w: i64,
    pub dwdx: i64,
    pub dwdy: i64,

    pub tmu: [TmuParams; 2],
}

/// One horizontal run of covered pixels
#[derive(Debug, Clone, Copy)]
pub struct Span {
    /// Parameter-space scanline (distance from vertex A uses this)
    pub y: i32,
    /// Destination row after any Y-origin flip
    pub dest_y: i32,
    pub x0: i32,
    /// Exclusive
    pub x1: i32,
    /// Ordinal of the first pixel in this span within the triangle
    pub ordinal: u32,
}

/// A scan-converted triangle, ready to rasterize in pieces
pub struct TriangleSetup {
    pub params: TriangleParams,
    pub spans: Vec<Span>,
    pub total_pixels: u32,
}

/// Per-triangle LOD base from the texture coordinate gradients
///
/// Squares the larger of the X/Y texel footprints and halves the log so
/// the result is log2 of the footprint length.
pub fn compute_lod_base(tables: &RecipLogTable, tmu: &TmuParams) -> i32 {
    let texdx = (tmu.ds_dx >> 14) * (tmu.ds_dx >> 14) + (tmu.dt_dx >> 14) * (tmu.dt_dx >> 14);
    let texdy = (tmu.ds_dy >> 14) * (tmu.ds_dy >> 14) + (tmu.dt_dy >> 14) * (tmu.dt_dy >> 14);
    let footprint = texdx.max(texdy) >> 16;
    let (_, log2) = tables.fast_reciplog(footprint);
    (-log2 + (12 << 8)) / 2
}

/// X coordinate (12.4) where the edge from (x0,y0) to (x1,y1) crosses
/// scanline center `cy`
#[inline]
fn edge_x_at(x0: i32, y0: i32, x1: i32, y1: i32, cy: i32) -> i32 {
    if y1 == y0 {
        return x0;
    }
    (i64::from(x0) + i64::from(cy - y0) * i64::from(x1 - x0) / i64::from(y1 - y0)) as i32
}

impl TriangleSetup {
    /// Scan-convert one triangle
    ///
    /// `clip` bounds the spans (intersection of the screen and, when
    /// clipping is enabled, the clip register). `y_flip` carries the
    /// Y-origin row when inverted output is selected. Returns `None` for
    /// triangles that cover no pixel.
    pub fn new(
        mut params: TriangleParams,
        color_path: u32,
        clip: &ClipRect,
        y_flip: Option<i32>,
    ) -> Option<Self> {
        // Subpixel adjustment moves the start values from vertex A to the
        // nearest pixel center
        if cp::subpixel_adjust(color_path) {
            let dx = 8 - (params.ax & 15);
            let dy = 8 - (params.ay & 15);
            params.start_r += (dy * params.drdy + dx * params.drdx) >> 4;
            params.start_g += (dy * params.dgdy + dx * params.dgdx) >> 4;
            params.start_b += (dy * params.dbdy + dx * params.dbdx) >> 4;
            params.start_a += (dy * params.dady + dx * params.dadx) >> 4;
            params.start_z += (dy * params.dzdy + dx * params.dzdx) >> 4;
            params.start_w += (i64::from(dy) * params.dwdy + i64::from(dx) * params.dwdx) >> 4;
            for tmu in &mut params.tmu {
                tmu.start_s += (i64::from(dy) * tmu.ds_dy + i64::from(dx) * tmu.ds_dx) >> 4;
                tmu.start_t += (i64::from(dy) * tmu.dt_dy + i64::from(dx) * tmu.dt_dx) >> 4;
                tmu.start_w += (i64::from(dy) * tmu.dw_dy + i64::from(dx) * tmu.dw_dx) >> 4;
            }
        }

        // Sort the three vertices by Y for the edge walk (parameter
        // anchoring at vertex A is unaffected)
        let mut v = [(params.ax, params.ay), (params.bx, params.by), (params.cx, params.cy)];
        v.sort_by_key(|&(_, y)| y);
        let [(x0, y0), (x1, y1), (x2, y2)] = v;
        if y0 == y2 {
            return None;
        }

        // Pixel rows whose center falls inside [y0, y2)
        let mut iy0 = (y0 + 7) >> 4;
        let mut iy1 = (y2 + 7) >> 4;
        iy0 = iy0.max(clip.top as i32);
        iy1 = iy1.min(clip.bottom as i32);

        let mut spans = Vec::with_capacity((iy1 - iy0).max(0) as usize);
        let mut ordinal = 0u32;
        for iy in iy0..iy1 {
            let cy = (iy << 4) + 8;
            let xa = edge_x_at(x0, y0, x2, y2, cy);
            let xb = if cy < y1 {
                edge_x_at(x0, y0, x1, y1, cy)
            } else {
                edge_x_at(x1, y1, x2, y2, cy)
            };
            let (left, right) = if xa <= xb { (xa, xb) } else { (xb, xa) };

            let mut ix0 = (left + 7) >> 4;
            let mut ix1 = (right + 7) >> 4;
            ix0 = ix0.max(clip.left as i32);
            ix1 = ix1.min(clip.right as i32);
            if ix0 >= ix1 {
                continue;
            }

            let dest_y = match y_flip {
                Some(origin) => (origin - iy) & 0x3ff,
                None => iy,
            };
            spans.push(Span { y: iy, dest_y, x0: ix0, x1: ix1, ordinal });
            ordinal += (ix1 - ix0) as u32;
        }

        if spans.is_empty() {
            return None;
        }
        Some(Self { params, spans, total_pixels: ordinal })
    }

    /// Index of the span containing pixel ordinal `p`
    fn span_at(&self, p: u32) -> usize {
        self.spans.partition_point(|s| s.ordinal <= p) - 1
    }
}

/// Rasterize a contiguous pixel-ordinal range of a set-up triangle
///
/// Ranges from different callers must not overlap within one dispatch;
/// together they tile `0..total_pixels`.
#[allow(clippy::too_many_arguments)]
pub fn rasterize_range(
    setup: &TriangleSetup,
    regs: &PixelRegs,
    target: &FrameTarget,
    tables: &RecipLogTable,
    tmus: &[TmuRaster],
    lod_base: &[i32; 2],
    range: Range<u32>,
    stats: &mut PixelStats,
) {
    if range.is_empty() {
        return;
    }
    let p = &setup.params;
    let ax_pix = p.ax >> 4;
    let ay_pix = p.ay >> 4;

    let mut remaining = range.end - range.start;
    let mut span_index = setup.span_at(range.start);
    let mut offset = range.start - setup.spans[span_index].ordinal;

    while remaining > 0 && span_index < setup.spans.len() {
        let span = &setup.spans[span_index];
        let x_start = span.x0 + offset as i32;
        let count = ((span.x1 - x_start) as u32).min(remaining);

        let dy = span.y - ay_pix;
        let dx = x_start - ax_pix;

        // Anchor the iterators at the first pixel of this run, then step
        // by the X gradients
        let mut iter = PixelIter {
            r: p.start_r + dy * p.drdy + dx * p.drdx,
            g: p.start_g + dy * p.dgdy + dx * p.dgdx,
            b: p.start_b + dy * p.dbdy + dx * p.dbdx,
            a: p.start_a + dy * p.dady + dx * p.dadx,
            z: p.start_z + dy * p.dzdy + dx * p.dzdx,
            w: p.start_w + i64::from(dy) * p.dwdy + i64::from(dx) * p.dwdx,
            ..PixelIter::default()
        };
        for unit in 0..tmus.len().min(2) {
            let t = &p.tmu[unit];
            iter.s[unit] = t.start_s + i64::from(dy) * t.ds_dy + i64::from(dx) * t.ds_dx;
            iter.t[unit] = t.start_t + i64::from(dy) * t.dt_dy + i64::from(dx) * t.dt_dx;
            iter.tw[unit] = t.start_w + i64::from(dy) * t.dw_dy + i64::from(dx) * t.dw_dx;
        }

        for i in 0..count {
            let x = x_start + i as i32;
            let ordinal = span.ordinal + offset + i;
            pixel_pipeline(
                regs, target, tables, tmus, lod_base, x, span.dest_y, ordinal, &iter, stats,
            );

            iter.r += p.drdx;
            iter.g += p.dgdx;
            iter.b += p.dbdx;
            iter.a += p.dadx;
            iter.z += p.dzdx;
            iter.w += p.dwdx;
            for unit in 0..tmus.len().min(2) {
                let t = &p.tmu[unit];
                iter.s[unit] += t.ds_dx;
                iter.t[unit] += t.dt_dx;
                iter.tw[unit] += t.dw_dx;
            }
        }

        remaining -= count;
        offset = 0;
        span_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen_clip() -> ClipRect {
        ClipRect { left: 0, right: 64, top: 0, bottom: 64 }
    }

    /// Axis-aligned right triangle covering roughly half a 32x32 square
    fn right_triangle() -> TriangleParams {
        TriangleParams {
            ax: 0 << 4,
            ay: 0 << 4,
            bx: 32 << 4,
            by: 0 << 4,
            cx: 0 << 4,
            cy: 32 << 4,
            start_r: 0xff << 12,
            start_g: 0xff << 12,
            start_b: 0xff << 12,
            start_a: 0xff << 12,
            ..TriangleParams::default()
        }
    }

    fn make_target(ram: &mut Vec<u16>) -> FrameTarget {
        ram.resize(1 << 13, 0);
        FrameTarget {
            ram: ram.as_mut_ptr(),
            mask: (1 << 13) - 1,
            row_pixels: 64,
            dest_base: 0,
            aux_base: u32::MAX,
        }
    }

    fn flat_regs() -> PixelRegs {
        PixelRegs { fbz_mode: 1 << 9, ..PixelRegs::default() }
    }

    #[test]
    fn test_span_ordinals_are_contiguous() {
        let setup = TriangleSetup::new(right_triangle(), 0, &screen_clip(), None).unwrap();
        let mut expect = 0u32;
        for span in &setup.spans {
            assert_eq!(span.ordinal, expect);
            expect += (span.x1 - span.x0) as u32;
        }
        assert_eq!(setup.total_pixels, expect);
    }

    #[test]
    fn test_half_square_coverage() {
        let setup = TriangleSetup::new(right_triangle(), 0, &screen_clip(), None).unwrap();
        // a 32x32 right triangle covers about half the square
        let half = 32 * 32 / 2;
        assert!(
            (setup.total_pixels as i32 - half).abs() <= 32,
            "coverage {} too far from {}",
            setup.total_pixels,
            half
        );
    }

    #[test]
    fn test_degenerate_triangle_rejected() {
        let mut p = right_triangle();
        p.cy = p.ay;
        p.by = p.ay;
        assert!(TriangleSetup::new(p, 0, &screen_clip(), None).is_none());
    }

    #[test]
    fn test_clip_bounds_spans() {
        let clip = ClipRect { left: 4, right: 8, top: 4, bottom: 8 };
        let setup = TriangleSetup::new(right_triangle(), 0, &clip, None).unwrap();
        for span in &setup.spans {
            assert!(span.y >= 4 && span.y < 8);
            assert!(span.x0 >= 4 && span.x1 <= 8);
        }
    }

    #[test]
    fn test_y_flip_remaps_rows() {
        let setup = TriangleSetup::new(right_triangle(), 0, &screen_clip(), Some(63)).unwrap();
        for span in &setup.spans {
            assert_eq!(span.dest_y, 63 - span.y);
        }
    }

    #[test]
    fn test_split_range_matches_full_raster() {
        let setup = TriangleSetup::new(right_triangle(), 0, &screen_clip(), None).unwrap();
        let regs = flat_regs();
        let tables = RecipLogTable::new();

        let mut ram_full = Vec::new();
        let full = make_target(&mut ram_full);
        let mut stats_full = PixelStats::default();
        rasterize_range(
            &setup, &regs, &full, &tables, &[], &[0; 2], 0..setup.total_pixels, &mut stats_full,
        );

        let mut ram_split = Vec::new();
        let split = make_target(&mut ram_split);
        let mut stats_split = PixelStats::default();
        let cuts = [0, setup.total_pixels / 3, setup.total_pixels / 2 + 7, setup.total_pixels];
        for pair in cuts.windows(2) {
            rasterize_range(
                &setup, &regs, &split, &tables, &[], &[0; 2], pair[0]..pair[1], &mut stats_split,
            );
        }

        assert_eq!(ram_full, ram_split);
        assert_eq!(stats_full, stats_split);
    }

    #[test]
    fn test_gradient_shades_along_x() {
        let mut p = right_triangle();
        p.start_r = 0;
        p.start_g = 0;
        p.start_b = 0;
        p.drdx = 8 << 12; // 8 units of red per pixel
        let setup = TriangleSetup::new(p, 0, &screen_clip(), None).unwrap();
        let regs = flat_regs();
        let tables = RecipLogTable::new();
        let mut ram = Vec::new();
        let target = make_target(&mut ram);
        let mut stats = PixelStats::default();
        rasterize_range(
            &setup, &regs, &target, &tables, &[], &[0; 2], 0..setup.total_pixels, &mut stats,
        );
        // red increases monotonically along the top row
        let r0 = target.read_dest(1, 0) >> 11;
        let r1 = target.read_dest(16, 0) >> 11;
        assert!(r1 > r0, "expected shading, got {r0} then {r1}");
    }

    #[test]
    fn test_subpixel_adjust_changes_start() {
        let mut p = right_triangle();
        p.ax = (1 << 4) + 3; // off-center vertex
        p.ay = (1 << 4) + 5;
        p.drdx = 1 << 12;
        p.drdy = 1 << 12;
        let plain = TriangleSetup::new(p, 0, &screen_clip(), None).unwrap();
        let adjusted = TriangleSetup::new(p, 1 << 26, &screen_clip(), None).unwrap();
        assert_ne!(plain.params.start_r, adjusted.params.start_r);
    }

    #[test]
    fn test_lod_base_doubles_per_octave() {
        let tables = RecipLogTable::new();
        let one_texel = TmuParams {
            ds_dx: 1i64 << 32, // one texel per pixel in S
            ..TmuParams::default()
        };
        let two_texels = TmuParams { ds_dx: 2i64 << 32, ..TmuParams::default() };
        let l1 = compute_lod_base(&tables, &one_texel);
        let l2 = compute_lod_base(&tables, &two_texels);
        // one LOD step (256 in 8.8) per doubling, within table tolerance
        assert!((l2 - l1 - 256).abs() <= 4, "lod step was {}", l2 - l1);
    }
}
