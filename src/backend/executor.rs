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

//! Deferred backend executor
//!
//! Sits between the chip and the abstract device: records chip draws into
//! the command buffer, resolves shader variants and cached textures, and
//! drains the buffer on flush. A failed flush marks only the commands that
//! executed, so the next flush resumes where it stopped.
//!
//! A few chip features have no GPU equivalent here (depth-source compare
//! and stipple); those draws still run, minus the feature, and the gap is
//! logged once rather than per triangle.

use crate::backend::commands::{CommandBuffer, GpuCommand};
use crate::backend::device::{
    DeviceCaps, DrawState, DrawUniforms, GpuVertex, GraphicsDevice, ReadbackTarget, Region,
};
use crate::backend::readback::{self, ReadbackQueue};
use crate::backend::shaders::ShaderCache;
use crate::backend::texcache::TextureCache;
use crate::core::error::Result;
use crate::core::fbi::{Fbi, NO_AUX};
use crate::core::state::{alpha, fbz, PipelineState};
use crate::core::tmu::Tmu;

pub struct Executor {
    device: Box<dyn GraphicsDevice>,
    caps: DeviceCaps,
    shaders: ShaderCache,
    textures: TextureCache,
    buffer: CommandBuffer,
    readback: ReadbackQueue,
    frame: u64,
    /// Latest scissor on the recording side, for dedup only
    scissor: Option<Region>,
    /// Scissor in effect at the replay point; survives a failed flush so
    /// resumed commands re-execute under the region they were recorded in
    applied_scissor: Option<Region>,
    warned_depth_source: bool,
    warned_stipple: bool,
}

impl Executor {
    pub fn new(device: Box<dyn GraphicsDevice>) -> Self {
        let caps = device.caps();
        // Degradations are decided once here, not rediscovered per frame
        if caps.max_texture_size < 256 {
            log::warn!(
                "device texture limit {} below chip maximum 256, large textures will sample wrong",
                caps.max_texture_size
            );
        }
        if !caps.npot_textures {
            log::warn!("device lacks non-power-of-two textures, odd aspect mipmaps pad");
        }
        if !caps.async_readback {
            log::info!("device lacks async readback, falling back to synchronous mirroring");
        }
        let readback = ReadbackQueue::new(caps.async_readback);
        Self {
            device,
            caps,
            shaders: ShaderCache::new(),
            textures: TextureCache::new(),
            buffer: CommandBuffer::new(),
            readback,
            frame: 0,
            scissor: None,
            applied_scissor: None,
            warned_depth_source: false,
            warned_stipple: false,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn pending_commands(&self) -> usize {
        self.buffer.unflushed().len()
    }

    pub fn shader_variants(&self) -> usize {
        self.shaders.len()
    }

    /// Record a clip rectangle change (deduplicated)
    pub fn record_clip(&mut self, region: Option<Region>) {
        if self.scissor == region {
            return;
        }
        self.scissor = region;
        self.buffer.push_scissor(region);
    }

    /// Record a fastfill as a clear
    pub fn record_fastfill(&mut self, region: Region, color: Option<u32>, depth: Option<u16>) {
        let color = color.map(|argb| {
            [
                ((argb >> 16) & 0xff) as f32 / 255.0,
                ((argb >> 8) & 0xff) as f32 / 255.0,
                (argb & 0xff) as f32 / 255.0,
                ((argb >> 24) & 0xff) as f32 / 255.0,
            ]
        });
        let depth = depth.map(|d| f32::from(d) / 65535.0);
        self.buffer.push_fastfill(region, color, depth);
    }

    /// Record one LFB pixel write as a point draw
    ///
    /// `alpha_mode` is present when lfbMode routes the write through the
    /// pixel pipeline; the blend factors are resolved at flush time.
    pub fn record_pixel(
        &mut self,
        x: u32,
        y: u32,
        rgba: [f32; 4],
        depth: Option<f32>,
        alpha_mode: Option<u32>,
    ) {
        let vert = GpuVertex {
            x: x as f32,
            y: y as f32,
            depth: depth.unwrap_or(0.0),
            rgba,
            st: [[0.0; 2]; 2],
            inv_w: [1.0; 2],
        };
        self.buffer.push_pixel(alpha_mode, vert);
    }

    /// Record one triangle under the current chip state
    pub fn record_triangle(
        &mut self,
        state: &PipelineState,
        tmu_enabled: [bool; 2],
        uniforms: DrawUniforms,
        verts: &[GpuVertex; 3],
        tmus: &mut [Tmu],
    ) -> Result<()> {
        if fbz::depth_source_compare(state.fbz_mode) && !self.warned_depth_source {
            self.warned_depth_source = true;
            log::warn!("depth-source compare has no GPU path, drawing with iterated depth");
        }
        if fbz::enable_stipple(state.fbz_mode) && !self.warned_stipple {
            self.warned_stipple = true;
            log::warn!("stipple has no GPU path, drawing unstippled");
        }

        let mut textures = [None, None];
        for (index, tmu) in tmus.iter_mut().enumerate().take(2) {
            if tmu_enabled[index] {
                textures[index] = Some(self.textures.resolve(
                    self.device.as_mut(),
                    index,
                    tmu,
                    self.frame,
                )?);
            }
        }

        let reduced = state.reduced(tmu_enabled);
        self.buffer.push_triangle(
            reduced,
            textures,
            state.fbz_mode,
            state.alpha_mode,
            uniforms,
            verts,
        );
        Ok(())
    }

    /// Drain the unflushed command range into the device
    ///
    /// On error the executed prefix is recorded and the remainder is left
    /// for the next flush.
    pub fn flush(&mut self) -> Result<()> {
        let mut executed = 0usize;
        let mut scissor = self.applied_scissor;
        let result = (|| -> Result<()> {
            // Work on a snapshot of the range; recording is not re-entered
            // during a flush
            let commands: Vec<GpuCommand> = self.buffer.unflushed().to_vec();
            for command in &commands {
                match command {
                    GpuCommand::SetScissor { region } => {
                        scissor = *region;
                    }
                    GpuCommand::FastFill { region, color, depth } => {
                        self.device.clear(Some(*region), *color, *depth);
                    }
                    GpuCommand::RawPixels { first_vertex, vertex_count } => {
                        let start = *first_vertex as usize;
                        let end = start + *vertex_count as usize;
                        self.device
                            .draw_pixels(None, &self.buffer.vertices()[start..end])?;
                    }
                    GpuCommand::BlendedPixels { alpha_mode, first_vertex, vertex_count } => {
                        let blend = alpha::alphablend(*alpha_mode).then(|| {
                            (
                                alpha::src_rgb_factor(*alpha_mode),
                                alpha::dst_rgb_factor(*alpha_mode),
                            )
                        });
                        let start = *first_vertex as usize;
                        let end = start + *vertex_count as usize;
                        self.device
                            .draw_pixels(blend, &self.buffer.vertices()[start..end])?;
                    }
                    GpuCommand::Draw {
                        state,
                        textures,
                        fbz_mode,
                        alpha_mode,
                        uniforms,
                        first_vertex,
                        vertex_count,
                    } => {
                        let program = self.shaders.program(self.device.as_mut(), state)?;
                        let draw_state = DrawState {
                            program,
                            textures: *textures,
                            depth_func: fbz::enable_depthbuf(*fbz_mode)
                                .then(|| fbz::depth_function(*fbz_mode)),
                            depth_write: fbz::aux_buffer_mask(*fbz_mode)
                                && !fbz::enable_alpha_planes(*fbz_mode),
                            blend: alpha::alphablend(*alpha_mode).then(|| {
                                (
                                    alpha::src_rgb_factor(*alpha_mode),
                                    alpha::dst_rgb_factor(*alpha_mode),
                                )
                            }),
                            scissor,
                            uniforms: *uniforms,
                        };
                        let start = *first_vertex as usize;
                        let end = start + *vertex_count as usize;
                        self.device
                            .draw_triangles(&draw_state, &self.buffer.vertices()[start..end])?;
                    }
                }
                executed += 1;
            }
            Ok(())
        })();

        // SetScissor commands never fail, so every one the loop reached
        // counts as applied even when a later draw errored
        self.applied_scissor = scissor;
        self.buffer.mark_flushed(executed);
        if result.is_ok() {
            self.buffer.trim_flushed();
        } else {
            log::warn!("flush stopped after {executed} commands, will resume");
        }
        result
    }

    /// Flush, mirror the render target back into chip memory, and age the
    /// texture cache
    ///
    /// Called once per buffer swap. The color mirror may lag one frame
    /// when the device reads back asynchronously.
    pub fn end_frame(&mut self, fbi: &mut Fbi) -> Result<()> {
        self.flush()?;

        // One readback may be in flight at a time, so color and depth
        // share the queue; each cycle resolves whatever the previous one
        // requested
        let width = fbi.width();
        let height = fbi.height();
        if fbi.aux_offset() != NO_AUX {
            if let Some((target, data)) =
                self.readback
                    .cycle(self.device.as_mut(), ReadbackTarget::Depth, width, height)?
            {
                mirror(fbi, target, &data);
            }
        }
        if let Some((target, data)) =
            self.readback
                .cycle(self.device.as_mut(), ReadbackTarget::Color, width, height)?
        {
            mirror(fbi, target, &data);
        }

        self.textures.end_frame(self.device.as_mut(), self.frame);
        self.frame += 1;
        Ok(())
    }

    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }
}

/// Write one resolved readback into the chip's frame buffer
fn mirror(fbi: &mut Fbi, target: ReadbackTarget, data: &[u8]) {
    let width = fbi.width() as usize;
    let height = fbi.height() as usize;
    let row_pixels = fbi.row_pixels() as usize;
    let base = match target {
        ReadbackTarget::Color => fbi.rgb_offset(fbi.back_index()) as usize,
        ReadbackTarget::Depth => fbi.aux_offset() as usize,
    };
    if data.len() < width * height * 4 {
        log::warn!("short readback ({} bytes), mirror skipped", data.len());
        return;
    }
    let ram = fbi.ram_mut();
    for y in 0..height {
        let row = &data[y * width * 4..(y + 1) * width * 4];
        let dst = &mut ram[base + y * row_pixels..base + y * row_pixels + width];
        match target {
            ReadbackTarget::Color => readback::rgba_to_565(row, dst),
            ReadbackTarget::Depth => readback::rgba_to_depth(row, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::backend::device::mock::MockDevice;
    use crate::backend::device::{ProgramId, TextureId};
    use crate::core::error::ChipError;

    /// Device that fails the first N triangle draws and records the
    /// scissor of every draw that succeeds
    struct FlakyDevice {
        scissors: Rc<RefCell<Vec<Option<Region>>>>,
        fail_draws: u32,
        next_program: u32,
    }

    impl GraphicsDevice for FlakyDevice {
        fn caps(&self) -> DeviceCaps {
            DeviceCaps { max_texture_size: 4096, npot_textures: true, async_readback: true }
        }

        fn compile_program(&mut self, _vertex: &str, _fragment: &str) -> Result<ProgramId> {
            let id = ProgramId(self.next_program);
            self.next_program += 1;
            Ok(id)
        }

        fn create_texture(&mut self, _width: u32, _height: u32) -> Result<TextureId> {
            Ok(TextureId(0))
        }

        fn upload_rgba(&mut self, _t: TextureId, _w: u32, _h: u32, _pixels: &[u8]) -> Result<()> {
            Ok(())
        }

        fn destroy_texture(&mut self, _texture: TextureId) {}

        fn clear(&mut self, _r: Option<Region>, _c: Option<[f32; 4]>, _d: Option<f32>) {}

        fn draw_triangles(&mut self, state: &DrawState, _vertices: &[GpuVertex]) -> Result<()> {
            if self.fail_draws > 0 {
                self.fail_draws -= 1;
                return Err(ChipError::DeviceAlloc("induced draw failure".into()));
            }
            self.scissors.borrow_mut().push(state.scissor);
            Ok(())
        }

        fn draw_pixels(&mut self, _blend: Option<(u32, u32)>, _v: &[GpuVertex]) -> Result<()> {
            Ok(())
        }

        fn begin_readback(&mut self, _t: ReadbackTarget, _w: u32, _h: u32) -> Result<()> {
            Ok(())
        }

        fn finish_readback(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn vertex(x: f32, y: f32) -> GpuVertex {
        GpuVertex {
            x,
            y,
            depth: 0.5,
            rgba: [1.0, 0.5, 0.25, 1.0],
            st: [[0.0; 2]; 2],
            inv_w: [1.0; 2],
        }
    }

    fn tri() -> [GpuVertex; 3] {
        [vertex(0.0, 0.0), vertex(8.0, 0.0), vertex(0.0, 8.0)]
    }

    fn executor() -> Executor {
        Executor::new(Box::new(MockDevice::new()))
    }

    #[test]
    fn test_merged_draws_flush_once() {
        let mut exec = executor();
        let state = PipelineState { fbz_mode: 1 << 9, ..PipelineState::default() };
        for _ in 0..4 {
            exec.record_triangle(&state, [false, false], DrawUniforms::default(), &tri(), &mut [])
                .unwrap();
        }
        assert_eq!(exec.pending_commands(), 1);
        exec.flush().unwrap();
        assert_eq!(exec.pending_commands(), 0);
        assert_eq!(exec.shader_variants(), 1);
    }

    #[test]
    fn test_failed_compile_resumes() {
        let mut dev = MockDevice::new();
        dev.fail_compile = true;
        let mut exec = Executor::new(Box::new(dev));
        let state = PipelineState { fbz_mode: 1 << 9, ..PipelineState::default() };
        exec.record_triangle(&state, [false, false], DrawUniforms::default(), &tri(), &mut [])
            .unwrap();
        assert!(exec.flush().is_err());
        // the draw is still pending for the next attempt
        assert_eq!(exec.pending_commands(), 1);
    }

    #[test]
    fn test_resumed_flush_replays_applied_scissor() {
        let scissors = Rc::new(RefCell::new(Vec::new()));
        let dev = FlakyDevice {
            scissors: Rc::clone(&scissors),
            fail_draws: 1,
            next_program: 0,
        };
        let mut exec = Executor::new(Box::new(dev));
        let state = PipelineState { fbz_mode: 1 << 9, ..PipelineState::default() };
        let a = Region { left: 0, top: 0, right: 10, bottom: 10 };
        let b = Region { left: 0, top: 0, right: 99, bottom: 99 };

        exec.record_clip(Some(a));
        exec.record_triangle(&state, [false, false], DrawUniforms::default(), &tri(), &mut [])
            .unwrap();
        exec.record_clip(Some(b));
        exec.record_triangle(&state, [false, false], DrawUniforms::default(), &tri(), &mut [])
            .unwrap();

        // scissor A applies, then the first draw fails and stays pending
        assert!(exec.flush().is_err());
        assert!(scissors.borrow().is_empty());

        // the retried draw must still run under A, not the later B
        exec.flush().unwrap();
        assert_eq!(*scissors.borrow(), vec![Some(a), Some(b)]);
    }

    #[test]
    fn test_clip_changes_are_deduplicated() {
        let mut exec = executor();
        let region = Region { left: 0, top: 0, right: 32, bottom: 32 };
        exec.record_clip(Some(region));
        exec.record_clip(Some(region));
        exec.record_clip(Some(region));
        assert_eq!(exec.pending_commands(), 1);
    }

    #[test]
    fn test_end_frame_mirrors_color() {
        let mut exec = executor();
        let mut fbi = Fbi::new(1 << 20, 16, 16);
        // async readback: first end_frame requests, second resolves
        exec.end_frame(&mut fbi).unwrap();
        exec.end_frame(&mut fbi).unwrap();
        assert_eq!(exec.frame(), 2);
    }

    #[test]
    fn test_lfb_pixels_flush_as_point_draws() {
        let mut exec = executor();
        exec.record_pixel(0, 0, [1.0, 0.0, 0.0, 1.0], None, None);
        exec.record_pixel(1, 0, [0.0, 1.0, 0.0, 1.0], None, None);
        exec.record_pixel(2, 0, [0.0, 0.0, 1.0, 0.5], None, Some(1 << 4));
        // one raw run, one blended run
        assert_eq!(exec.pending_commands(), 2);
        exec.flush().unwrap();
        assert_eq!(exec.pending_commands(), 0);
        // pixel draws compile no shader variants
        assert_eq!(exec.shader_variants(), 0);
    }

    #[test]
    fn test_fastfill_becomes_clear() {
        let mut exec = executor();
        exec.record_fastfill(
            Region { left: 0, top: 0, right: 16, bottom: 16 },
            Some(0x00ff_0000),
            Some(0xffff),
        );
        assert_eq!(exec.pending_commands(), 1);
        exec.flush().unwrap();
        assert_eq!(exec.pending_commands(), 0);
    }
}
