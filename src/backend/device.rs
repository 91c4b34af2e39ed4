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

//! Abstract graphics device
//!
//! The deferred backend talks to the GPU only through this trait. A real
//! implementation wraps a graphics API context; the crate itself ships no
//! such binding, so the concrete device is an external collaborator and
//! tests use a recording mock.

use crate::core::error::Result;

/// Opaque program handle issued by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// Opaque texture handle issued by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// Capabilities probed once at startup
///
/// Shortfalls degrade the backend once (logged) rather than per frame.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub max_texture_size: u32,
    pub npot_textures: bool,
    pub async_readback: bool,
}

/// Pixel-space rectangle, right/bottom exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// One vertex as handed to the device
///
/// Positions are in pixels, colors normalized, texture coordinates still
/// perspective (S/W, T/W and 1/W per unit so the shader can divide).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuVertex {
    pub x: f32,
    pub y: f32,
    pub depth: f32,
    pub rgba: [f32; 4],
    pub st: [[f32; 2]; 2],
    pub inv_w: [f32; 2],
}

/// Per-draw uniform values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawUniforms {
    pub color0: [f32; 4],
    pub color1: [f32; 4],
    pub chroma_key: [f32; 3],
    pub fog_color: [f32; 3],
    pub alpha_ref: f32,
}

impl Default for DrawUniforms {
    fn default() -> Self {
        Self {
            color0: [0.0; 4],
            color1: [0.0; 4],
            chroma_key: [0.0; 3],
            fog_color: [0.0; 3],
            alpha_ref: 0.0,
        }
    }
}

/// Fixed-function state accompanying a draw
///
/// Everything a shader variant does not bake in: depth test/write, blend
/// factors, scissor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawState {
    pub program: ProgramId,
    pub textures: [Option<TextureId>; 2],
    /// Comparison function 0-7 when depth testing is on
    pub depth_func: Option<u32>,
    pub depth_write: bool,
    /// (src, dst) factor codes when blending is on
    pub blend: Option<(u32, u32)>,
    pub scissor: Option<Region>,
    pub uniforms: DrawUniforms,
}

/// What a readback targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackTarget {
    Color,
    Depth,
}

/// The device interface the executor drives
///
/// All methods are expected to be cheap to call; the device may batch
/// internally. Readback is split into begin/finish so a double-buffered
/// implementation can overlap it with rendering.
pub trait GraphicsDevice {
    fn caps(&self) -> DeviceCaps;

    fn compile_program(&mut self, vertex_src: &str, fragment_src: &str) -> Result<ProgramId>;

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId>;

    fn upload_rgba(&mut self, texture: TextureId, width: u32, height: u32, pixels: &[u8])
        -> Result<()>;

    fn destroy_texture(&mut self, texture: TextureId);

    /// Clear color and/or depth over a region (whole target when `None`)
    fn clear(&mut self, region: Option<Region>, color: Option<[f32; 4]>, depth: Option<f32>);

    /// Draw `vertices` as a triangle list under `state`
    fn draw_triangles(&mut self, state: &DrawState, vertices: &[GpuVertex]) -> Result<()>;

    /// Draw `vertices` as single-pixel points
    ///
    /// Carries the (src, dst) blend factor codes when the pixels were
    /// written through the blender, `None` for raw writes.
    fn draw_pixels(&mut self, blend: Option<(u32, u32)>, vertices: &[GpuVertex]) -> Result<()>;

    /// Kick off an asynchronous readback of the render target
    fn begin_readback(&mut self, target: ReadbackTarget, width: u32, height: u32) -> Result<()>;

    /// Complete the readback started by [`GraphicsDevice::begin_readback`]
    ///
    /// Returns tightly packed RGBA8 rows. A device without async readback
    /// support may block here.
    fn finish_readback(&mut self) -> Result<Vec<u8>>;
}
