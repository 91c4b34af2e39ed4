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

//! GPU-to-chip readback and mirroring
//!
//! The host may read the frame buffer through the LFB at any time, so the
//! deferred backend mirrors the GPU's render target back into chip memory
//! after each flush. Color converts 565 to RGBA8 by bit replication and
//! back by truncation, which round-trips losslessly. Depth rides through
//! a color readback as two 8-bit channels (low byte in red, high in
//! green).
//!
//! Readback is double-buffered when the device supports asynchronous
//! transfers: the frame resolved this flush was requested on the previous
//! one. Devices without support fall back to a synchronous request/resolve
//! in the same flush.

use crate::backend::device::{GraphicsDevice, ReadbackTarget};
use crate::core::error::Result;

/// Expand a 565 pixel to RGBA8 by bit replication
#[inline(always)]
pub fn expand_565(pixel: u16) -> [u8; 4] {
    let r = ((pixel >> 11) & 0x1f) as u8;
    let g = ((pixel >> 5) & 0x3f) as u8;
    let b = (pixel & 0x1f) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2), 0xff]
}

/// Truncate RGBA8 back to 565 (exact inverse of [`expand_565`])
#[inline(always)]
pub fn pack_565(rgba: [u8; 4]) -> u16 {
    (u16::from(rgba[0] >> 3) << 11) | (u16::from(rgba[1] >> 2) << 5) | u16::from(rgba[2] >> 3)
}

/// Encode a 16-bit depth/aux value into two 8-bit channels
#[inline(always)]
pub fn depth_to_channels(depth: u16) -> [u8; 4] {
    [(depth & 0xff) as u8, (depth >> 8) as u8, 0, 0xff]
}

/// Inverse of [`depth_to_channels`]
#[inline(always)]
pub fn channels_to_depth(rgba: [u8; 4]) -> u16 {
    u16::from(rgba[0]) | (u16::from(rgba[1]) << 8)
}

/// Convert a tightly packed RGBA8 readback into 565 pixels
pub fn rgba_to_565(rgba: &[u8], out: &mut [u16]) {
    for (pixel, chunk) in out.iter_mut().zip(rgba.chunks_exact(4)) {
        *pixel = pack_565([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

/// Convert an RGBA8 depth readback into 16-bit aux values
pub fn rgba_to_depth(rgba: &[u8], out: &mut [u16]) {
    for (value, chunk) in out.iter_mut().zip(rgba.chunks_exact(4)) {
        *value = channels_to_depth([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

/// Double-buffered readback scheduler
///
/// Tracks which target was requested last flush so the next flush can
/// resolve it, pipelining the transfer behind rendering.
pub struct ReadbackQueue {
    in_flight: Option<ReadbackTarget>,
    async_supported: bool,
}

impl ReadbackQueue {
    pub fn new(async_supported: bool) -> Self {
        Self { in_flight: None, async_supported }
    }

    /// Request a readback and return the resolved data for the previous one
    ///
    /// In asynchronous mode the returned bytes lag one flush behind; in
    /// synchronous mode they are current.
    pub fn cycle(
        &mut self,
        device: &mut dyn GraphicsDevice,
        target: ReadbackTarget,
        width: u32,
        height: u32,
    ) -> Result<Option<(ReadbackTarget, Vec<u8>)>> {
        if !self.async_supported {
            device.begin_readback(target, width, height)?;
            let data = device.finish_readback()?;
            return Ok(Some((target, data)));
        }

        let resolved = match self.in_flight.take() {
            Some(previous) => Some((previous, device.finish_readback()?)),
            None => None,
        };
        device.begin_readback(target, width, height)?;
        self.in_flight = Some(target);
        Ok(resolved)
    }
}
