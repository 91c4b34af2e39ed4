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

//! Shared fixed-point lookup tables
//!
//! The chip never performs a real divide or logarithm per pixel. Perspective
//! correction and W-depth compression both run through a small table-driven
//! reciprocal/log2 approximation with about 9 bits of precision, and color
//! reduction to 5-6-5 uses ordered-dither matrices with an asymmetric
//! rounding formula. Both are part of the hardware's visual signature, so the
//! exact bit patterns matter.

/// 4×4 ordered dither matrix
///
/// Indexed as `[(y & 3) * 4 + (x & 3)]`.
pub const DITHER_MATRIX_4X4: [u8; 16] = [
    0, 8, 2, 10, //
    12, 4, 14, 6, //
    3, 11, 1, 9, //
    15, 7, 13, 5, //
];

/// 2×2 ordered dither matrix, replicated to the same 4×4 indexing
pub const DITHER_MATRIX_2X2: [u8; 16] = [
    2, 10, 2, 10, //
    14, 6, 14, 6, //
    2, 10, 2, 10, //
    14, 6, 14, 6, //
];

/// Reduce an 8-bit red/blue channel to 5 bits with dithering
///
/// The `<< 1` / `>> 4` / `>> 7` terms reproduce the hardware's asymmetric
/// rounding; plain `(val + dith) >> 3` does not match it.
#[inline(always)]
pub fn dither_rb(val: i32, dith: i32) -> i32 {
    (((val << 1) - (val >> 4) + (val >> 7) + dith) >> 1) >> 3
}

/// Reduce an 8-bit green channel to 6 bits with dithering
#[inline(always)]
pub fn dither_g(val: i32, dith: i32) -> i32 {
    (((val << 2) - (val >> 4) + (val >> 6) + dith) >> 2) >> 2
}

/// Number of index bits in the reciprocal/log2 lookup table
const RECIPLOG_LOOKUP_BITS: u32 = 9;

/// Fractional precision of the raw reciprocal table entries
const RECIPLOG_LOOKUP_PREC: u32 = 22;

/// Fractional precision assumed for `fast_reciplog` input values
const RECIPLOG_INPUT_PREC: u32 = 32;

/// Fractional precision of the reciprocal returned by `fast_reciplog`
const RECIP_OUTPUT_PREC: u32 = 15;

/// Fractional precision of the log2 returned by `fast_reciplog`
pub const LOG_OUTPUT_PREC: u32 = 8;

/// Interleaved (reciprocal, log2) table covering one octave
///
/// Entry pairs cover normalized mantissas 1.0..=2.0 in 2^-9 steps; the extra
/// final pair lets the interpolation read one entry past the end.
pub struct RecipLogTable {
    entries: Vec<u32>,
}

impl RecipLogTable {
    /// Build the table
    ///
    /// Built once per chip instance at construction; the original builds it
    /// into process-global storage, which the context-object design replaces.
    pub fn new() -> Self {
        let count = (1usize << RECIPLOG_LOOKUP_BITS) + 1;
        let mut entries = Vec::with_capacity(count * 2);
        for val in 0..count as u32 {
            let mantissa = (1u32 << RECIPLOG_LOOKUP_BITS) + val;
            let recip =
                (1u64 << (RECIPLOG_LOOKUP_PREC + RECIPLOG_LOOKUP_BITS)) / u64::from(mantissa);
            let log2 = ((1u64 << LOG_OUTPUT_PREC) as f64
                * (f64::from(mantissa) / f64::from(1u32 << RECIPLOG_LOOKUP_BITS)).log2())
                as u32;
            entries.push(recip as u32);
            entries.push(log2);
        }
        Self { entries }
    }

    /// Approximate `1/value` and `log2(1/value)` in one pass
    ///
    /// `value` is treated as a signed fixed-point number with 32 fraction
    /// bits. Returns `(recip, log2)` where `recip` carries 15 fraction bits
    /// (sign-matched to the input) and `log2` is the base-2 log of the
    /// reciprocal's magnitude in signed x.8 fixed point.
    ///
    /// A zero input yields an "infinite" reciprocal (`i32::MAX` magnitude)
    /// and a large positive log, matching the hardware's saturating
    /// behavior.
    pub fn fast_reciplog(&self, value: i64) -> (i32, i32) {
        let neg = value < 0;
        let value = value.unsigned_abs();

        // If we've spilled out of 32 bits, push the value back under 32.
        let (mut temp, mut exp): (u32, i32) = if value & 0xffff_0000_0000 != 0 {
            ((value >> 16) as u32, -16)
        } else {
            (value as u32, 0)
        };

        if temp == 0 {
            return (
                if neg { i32::MIN + 1 } else { i32::MAX },
                1000 << LOG_OUTPUT_PREC,
            );
        }

        // Normalize so the top bit is set.
        let lz = temp.leading_zeros() as i32;
        temp <<= lz;
        exp += lz;

        // Index pairs of (recip, log) entries; interpolate between neighbors
        // on the next 8 bits of mantissa.
        let index = ((temp >> (31 - RECIPLOG_LOOKUP_BITS - 1))
            & ((2 << RECIPLOG_LOOKUP_BITS) - 2)) as usize;
        let interp = u64::from((temp >> (31 - RECIPLOG_LOOKUP_BITS - 8)) & 0xff);

        let recip0 = u64::from(self.entries[index]);
        let rlog0 = u64::from(self.entries[index + 1]);
        let recip1 = u64::from(self.entries[index + 2]);
        let rlog1 = u64::from(self.entries[index + 3]);

        let mut recip = ((recip0 * (0x100 - interp) + recip1 * interp) >> 8) as u32;
        let rlog = ((rlog0 * (0x100 - interp) + rlog1 * interp) >> 8) as i32;

        // log2(1/|v|) = (exp + 1) - mantissa fraction, in x.8 fixed point.
        let log2 = ((exp - (31 - RECIPLOG_INPUT_PREC as i32)) << LOG_OUTPUT_PREC) - rlog;

        // Fold all the precision parameters into one final shift.
        let exp = exp + (RECIP_OUTPUT_PREC as i32 - RECIPLOG_LOOKUP_PREC as i32)
            - (31 - RECIPLOG_INPUT_PREC as i32);
        if exp < 0 {
            recip >>= -exp;
        } else {
            recip = recip.checked_shl(exp as u32).unwrap_or(u32::MAX);
        }
        let recip = recip.min(i32::MAX as u32) as i32;

        (if neg { -recip } else { recip }, log2)
    }
}

impl Default for RecipLogTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Compress a 16.32 fixed-point 1/W value to the 16-bit W-buffer encoding
///
/// A 4-bit exponent (leading-zero count) and a 12-bit one's-complement
/// mantissa. Values that overflow 16.16 clamp to 0x0000 (nearest), values
/// under 1.0 clamp to 0xffff (farthest), and the `+1` after packing is the
/// hardware's off-by-one rounding.
#[inline]
pub fn wfloat_from_iterw(iterw: i64) -> u16 {
    if iterw as u64 & 0xffff_0000_0000 != 0 {
        return 0x0000;
    }
    let temp = iterw as u32;
    if temp & 0xffff_0000 == 0 {
        return 0xffff;
    }
    let exp = temp.leading_zeros();
    let mut wfloat = ((exp << 12) | ((!temp >> (19 - exp)) & 0xfff)) as u16;
    if wfloat < 0xffff {
        wfloat += 1;
    }
    wfloat
}

/// Compress a 20.12 fixed-point Z value to the 16-bit floating depth encoding
///
/// Same exponent/mantissa scheme as [`wfloat_from_iterw`], applied to the
/// Z iterator when the depth-float-select mode bit is set.
#[inline]
pub fn zfloat_from_iterz(iterz: i32) -> u16 {
    if iterz & 0xf000_0000u32 as i32 != 0 {
        return 0x0000;
    }
    let temp = (iterz as u32) << 4;
    if temp & 0xffff_0000 == 0 {
        return 0xffff;
    }
    let exp = temp.leading_zeros();
    let mut depth = ((exp << 12) | ((!temp >> (19 - exp)) & 0xfff)) as u16;
    if depth < 0xffff {
        depth += 1;
    }
    depth
}

/// Bilinear blend of four packed ARGB texels
///
/// `u` and `v` are 8-bit fractions. Channels are filtered two at a time in
/// the packed representation (red/blue, then alpha/green).
#[inline]
pub fn bilinear_filter(rgb00: u32, rgb01: u32, rgb10: u32, rgb11: u32, u: u32, v: u32) -> u32 {
    let filter_pair = |a: u32, b: u32, frac: u32| -> u32 {
        let a = a & 0x00ff_00ff;
        let b = b & 0x00ff_00ff;
        a.wrapping_add(b.wrapping_sub(a).wrapping_mul(frac) >> 8)
    };

    // red/blue live in the even bytes, alpha/green in the odd bytes
    let rb0 = filter_pair(rgb00, rgb01, u);
    let rb1 = filter_pair(rgb10, rgb11, u);
    let ag0 = filter_pair(rgb00 >> 8, rgb01 >> 8, u);
    let ag1 = filter_pair(rgb10 >> 8, rgb11 >> 8, u);

    let rb = filter_pair(rb0, rb1, v);
    let ag = filter_pair(ag0, ag1, v);
    ((ag << 8) & 0xff00_ff00) | (rb & 0x00ff_00ff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dither_matrix_dimensions() {
        assert_eq!(DITHER_MATRIX_4X4.len(), 16);
        assert_eq!(DITHER_MATRIX_2X2.len(), 16);
        // 2x2 repeats every other row/column
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(
                    DITHER_MATRIX_2X2[y * 4 + x],
                    DITHER_MATRIX_2X2[(y & 1) * 4 + (x & 1)]
                );
            }
        }
    }

    #[test]
    fn test_dither_rb_extremes() {
        // 0 stays 0, 255 reaches full 5-bit scale for every dither value
        for dith in 0..16 {
            assert_eq!(dither_rb(0, dith), 0);
            assert_eq!(dither_rb(255, dith), 31);
        }
    }

    #[test]
    fn test_dither_g_extremes() {
        for dith in 0..16 {
            assert_eq!(dither_g(0, dith), 0);
            assert_eq!(dither_g(255, dith), 63);
        }
    }

    #[test]
    fn test_dither_is_asymmetric() {
        // The hardware formula differs from naive (val + dith) >> 3 rounding
        // for at least some inputs; pin one known divergence.
        let naive = |val: i32, dith: i32| (val + dith) >> 3;
        let mut diverged = false;
        for val in 0..256 {
            for dith in 0..16 {
                if dither_rb(val, dith) != naive(val, dith).clamp(0, 31) {
                    diverged = true;
                }
            }
        }
        assert!(diverged);
    }

    #[test]
    fn test_wfloat_overflow_clamps_to_zero() {
        // 1/W too large to represent: nearest possible depth
        assert_eq!(wfloat_from_iterw(1i64 << 40), 0x0000);
    }

    #[test]
    fn test_wfloat_small_clamps_to_ffff() {
        assert_eq!(wfloat_from_iterw(0), 0xffff);
        assert_eq!(wfloat_from_iterw(0xffff), 0xffff);
    }

    #[test]
    fn test_wfloat_monotonic_nonincreasing() {
        // Larger 1/W (closer) must never produce a larger depth value.
        let mut prev = u16::MAX;
        let mut w = 0x1_0000i64;
        while w < 0x1_0000_0000 {
            let f = wfloat_from_iterw(w);
            assert!(f <= prev, "wfloat not monotonic at {w:#x}");
            prev = f;
            w += 0x37_9411;
        }
    }

    #[test]
    fn test_zfloat_overflow_clamps_to_zero() {
        assert_eq!(zfloat_from_iterz(0x1000_0000), 0x0000);
    }

    #[test]
    fn test_fast_reciplog_accuracy() {
        let table = RecipLogTable::new();
        // 1.0 in .32 → reciprocal 1.0 in .15
        let (recip, log2) = table.fast_reciplog(1i64 << 32);
        assert!((recip - (1 << 15)).abs() <= 2, "recip of 1.0 was {recip:#x}");
        assert!(log2.abs() <= 1, "log2 of 1.0 was {log2}");

        // 2.0 → reciprocal 0.5, log2(1/2) = -1.0
        let (recip, log2) = table.fast_reciplog(2i64 << 32);
        assert!((recip - (1 << 14)).abs() <= 2);
        assert!((log2 + (1 << LOG_OUTPUT_PREC)).abs() <= 1);

        // 0.25 → reciprocal 4.0, log2 = +2.0
        let (recip, log2) = table.fast_reciplog(1i64 << 30);
        assert!((recip - (4 << 15)).abs() <= 8);
        assert!((log2 - (2 << LOG_OUTPUT_PREC)).abs() <= 1);
    }

    #[test]
    fn test_fast_reciplog_sign() {
        let table = RecipLogTable::new();
        let (pos, _) = table.fast_reciplog(3i64 << 30);
        let (neg, _) = table.fast_reciplog(-(3i64 << 30));
        assert_eq!(pos, -neg);
    }

    #[test]
    fn test_fast_reciplog_zero_is_infinite() {
        let table = RecipLogTable::new();
        let (recip, log2) = table.fast_reciplog(0);
        assert_eq!(recip, i32::MAX);
        assert_eq!(log2, 1000 << LOG_OUTPUT_PREC);
    }

    #[test]
    fn test_bilinear_filter_corners() {
        let t00 = 0xff10_2030;
        let t01 = 0xff40_5060;
        let t10 = 0xff70_8090;
        let t11 = 0xffa0_b0c0;
        assert_eq!(bilinear_filter(t00, t01, t10, t11, 0, 0), t00);
    }

    #[test]
    fn test_bilinear_filter_midpoint() {
        // Flat color is invariant under filtering
        let c = 0x8040_2010;
        assert_eq!(bilinear_filter(c, c, c, c, 0x80, 0x80), c);
    }
}
