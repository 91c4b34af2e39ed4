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

//! The chip instance
//!
//! [`Voodoo`] ties the register file, FBI, TMUs and rasterizer together
//! behind the memory-mapped interface the host drives: 32-bit register
//! writes (with chip-select routing in the address), LFB accesses and
//! texture downloads. Drawing state is latched at write time; a write to
//! `triangleCMD` fires the latched parameters into whichever backend the
//! chip was built with.
//!
//! Register addresses are byte offsets. Bits 2-9 select the register word
//! and bits 10-13 are the chip-select mask (bit 0 FBI, bits 1-2 the TMUs);
//! a zero mask addresses every chip, which is how hosts normally write.

use std::sync::Arc;

use crate::backend::device::{DrawUniforms, GpuVertex, GraphicsDevice, Region};
use crate::backend::executor::Executor;
use crate::core::error::{ChipError, Result};
use crate::backend::readback::expand_565;
use crate::core::fbi::{lfb_color_to_565, ClipRect, Fbi};
use crate::core::pipeline::{FrameTarget, PixelRegs, PixelStats};
use crate::core::raster::workers::WorkerPool;
use crate::core::raster::{compute_lod_base, TriangleParams, TriangleSetup};
use crate::core::registers::{regs, RegisterFile};
use crate::core::state::{cp, fbz, lfb, PipelineState};
use crate::core::tables::RecipLogTable;
use crate::core::tmu::Tmu;

/// Construction parameters for a chip instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoodooConfig {
    /// Frame buffer width in pixels
    pub width: u32,
    /// Frame buffer height in pixels
    pub height: u32,
    /// Frame buffer memory in bytes (power of two)
    pub fb_size: usize,
    /// Texture memory per TMU in bytes (power of two)
    pub tex_size: usize,
    /// Number of texture units (0-2)
    pub tmu_count: usize,
    /// Rasterization worker threads; 0 picks one per spare hardware thread
    pub workers: usize,
}

impl Default for VoodooConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fb_size: 4 << 20,
            tex_size: 2 << 20,
            tmu_count: 2,
            workers: 0,
        }
    }
}

const MAX_DIMENSION: u32 = 1024;
const MAX_TMUS: usize = 2;

impl VoodooConfig {
    /// Bytes the frame buffer layout needs: three color buffers plus aux
    fn fb_bytes_needed(&self) -> usize {
        self.width as usize * self.height as usize * 2 * 4
    }

    /// Check the configuration without constructing anything
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.width > MAX_DIMENSION {
            return Err(ChipError::InvalidConfig(format!(
                "width {} out of range 1..={MAX_DIMENSION}",
                self.width
            )));
        }
        if self.height == 0 || self.height > MAX_DIMENSION {
            return Err(ChipError::InvalidConfig(format!(
                "height {} out of range 1..={MAX_DIMENSION}",
                self.height
            )));
        }
        if !self.fb_size.is_power_of_two() {
            return Err(ChipError::InvalidConfig(format!(
                "frame buffer size {:#x} is not a power of two",
                self.fb_size
            )));
        }
        if self.fb_size < self.fb_bytes_needed() {
            return Err(ChipError::InvalidConfig(format!(
                "frame buffer size {:#x} cannot hold {}x{} with aux",
                self.fb_size, self.width, self.height
            )));
        }
        if !self.tex_size.is_power_of_two() {
            return Err(ChipError::InvalidConfig(format!(
                "texture memory size {:#x} is not a power of two",
                self.tex_size
            )));
        }
        if self.tmu_count > MAX_TMUS {
            return Err(ChipError::InvalidConfig(format!(
                "tmu_count {} exceeds {MAX_TMUS}",
                self.tmu_count
            )));
        }
        Ok(())
    }

    /// Force the configuration into range, logging every adjustment
    fn clamped(mut self) -> Self {
        if self.width == 0 || self.width > MAX_DIMENSION {
            let fixed = self.width.clamp(1, MAX_DIMENSION);
            log::warn!("clamping width {} to {fixed}", self.width);
            self.width = fixed;
        }
        if self.height == 0 || self.height > MAX_DIMENSION {
            let fixed = self.height.clamp(1, MAX_DIMENSION);
            log::warn!("clamping height {} to {fixed}", self.height);
            self.height = fixed;
        }
        let fb_min = self.fb_bytes_needed().next_power_of_two();
        if !self.fb_size.is_power_of_two() || self.fb_size < fb_min {
            let fixed = self.fb_size.next_power_of_two().max(fb_min);
            log::warn!("rounding frame buffer size {:#x} up to {fixed:#x}", self.fb_size);
            self.fb_size = fixed;
        }
        if !self.tex_size.is_power_of_two() {
            let fixed = self.tex_size.next_power_of_two().max(4096);
            log::warn!("rounding texture memory {:#x} up to {fixed:#x}", self.tex_size);
            self.tex_size = fixed;
        }
        if self.tmu_count > MAX_TMUS {
            log::warn!("clamping tmu_count {} to {MAX_TMUS}", self.tmu_count);
            self.tmu_count = MAX_TMUS;
        }
        self
    }

    fn resolved_workers(&self) -> usize {
        if self.workers != 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map_or(1, |n| n.get().saturating_sub(1))
            .min(7)
    }
}

/// One modeled rasterizer chip
pub struct Voodoo {
    config: VoodooConfig,
    regs: RegisterFile,
    fbi: Fbi,
    tmus: Vec<Tmu>,
    tables: Arc<RecipLogTable>,
    pool: WorkerPool,
    executor: Option<Executor>,

    /// Triangle parameters latched by vertex/start/gradient writes
    tri: TriangleParams,
    stats: PixelStats,
    fog_blend: [u8; 64],
    fog_delta: [u8; 64],
    triangles: u64,
}

impl Voodoo {
    /// Build a chip with the software rasterizer backend
    ///
    /// Never fails: out-of-range parameters are clamped (and logged).
    /// Hosts that want a hard error call [`VoodooConfig::validate`] first.
    pub fn new(config: VoodooConfig) -> Self {
        let config = config.clamped();
        let pool = WorkerPool::new(config.resolved_workers());
        log::info!(
            "chip: {}x{}, {} KiB fb, {} tmu(s), {} partitions",
            config.width,
            config.height,
            config.fb_size >> 10,
            config.tmu_count,
            pool.partitions()
        );
        Self {
            regs: RegisterFile::new(),
            fbi: Fbi::new(config.fb_size, config.width, config.height),
            tmus: (0..config.tmu_count).map(|_| Tmu::new(config.tex_size)).collect(),
            tables: Arc::new(RecipLogTable::new()),
            pool,
            executor: None,
            tri: TriangleParams::default(),
            stats: PixelStats::default(),
            fog_blend: [0; 64],
            fog_delta: [0; 64],
            triangles: 0,
            config,
        }
    }

    /// Build a chip that renders through the deferred GPU backend
    pub fn with_device(config: VoodooConfig, device: Box<dyn GraphicsDevice>) -> Self {
        let mut chip = Self::new(config);
        chip.executor = Some(Executor::new(device));
        chip
    }

    pub fn config(&self) -> &VoodooConfig {
        &self.config
    }

    pub fn fbi(&self) -> &Fbi {
        &self.fbi
    }

    pub fn fbi_mut(&mut self) -> &mut Fbi {
        &mut self.fbi
    }

    pub fn tmu(&self, index: usize) -> Option<&Tmu> {
        self.tmus.get(index)
    }

    pub fn executor(&self) -> Option<&Executor> {
        self.executor.as_ref()
    }

    pub fn stats(&self) -> PixelStats {
        self.stats
    }

    pub fn triangle_count(&self) -> u64 {
        self.triangles
    }

    /// Memory-mapped register write
    ///
    /// `offset` is the byte offset within the register window.
    pub fn register_write(&mut self, offset: u32, data: u32) {
        let word = offset >> 2;
        let regnum = word & 0xff;
        let mut chips = (word >> 8) & 0xf;
        if chips == 0 {
            chips = 0xf;
        }

        // TMU block: routed by chip select, never stored in the FBI file
        if (regs::TEXTURE_MODE..=regs::NCC_TABLE1_END).contains(&regnum) {
            self.tmu_register_write(regnum, chips, data);
            return;
        }

        match regnum {
            // Vertex positions, 12.4 in the low 16 bits
            regs::VERTEX_AX => self.tri.ax = vertex_fixed(data),
            regs::VERTEX_AY => self.tri.ay = vertex_fixed(data),
            regs::VERTEX_BX => self.tri.bx = vertex_fixed(data),
            regs::VERTEX_BY => self.tri.by = vertex_fixed(data),
            regs::VERTEX_CX => self.tri.cx = vertex_fixed(data),
            regs::VERTEX_CY => self.tri.cy = vertex_fixed(data),

            // Color/depth start values and gradients (FBI only)
            regs::START_R if chips & 1 != 0 => self.tri.start_r = color_fixed(data),
            regs::START_G if chips & 1 != 0 => self.tri.start_g = color_fixed(data),
            regs::START_B if chips & 1 != 0 => self.tri.start_b = color_fixed(data),
            regs::START_A if chips & 1 != 0 => self.tri.start_a = color_fixed(data),
            regs::START_Z if chips & 1 != 0 => self.tri.start_z = data as i32,
            regs::DRDX if chips & 1 != 0 => self.tri.drdx = color_fixed(data),
            regs::DGDX if chips & 1 != 0 => self.tri.dgdx = color_fixed(data),
            regs::DBDX if chips & 1 != 0 => self.tri.dbdx = color_fixed(data),
            regs::DADX if chips & 1 != 0 => self.tri.dadx = color_fixed(data),
            regs::DZDX if chips & 1 != 0 => self.tri.dzdx = data as i32,
            regs::DRDY if chips & 1 != 0 => self.tri.drdy = color_fixed(data),
            regs::DGDY if chips & 1 != 0 => self.tri.dgdy = color_fixed(data),
            regs::DBDY if chips & 1 != 0 => self.tri.dbdy = color_fixed(data),
            regs::DADY if chips & 1 != 0 => self.tri.dady = color_fixed(data),
            regs::DZDY if chips & 1 != 0 => self.tri.dzdy = data as i32,

            // S/T go to the selected TMUs; W goes to the FBI and the TMUs
            regs::START_S => self.latch_tmu(chips, |t| t.start_s = st_fixed(data)),
            regs::START_T => self.latch_tmu(chips, |t| t.start_t = st_fixed(data)),
            regs::DSDX => self.latch_tmu(chips, |t| t.ds_dx = st_fixed(data)),
            regs::DTDX => self.latch_tmu(chips, |t| t.dt_dx = st_fixed(data)),
            regs::DSDY => self.latch_tmu(chips, |t| t.ds_dy = st_fixed(data)),
            regs::DTDY => self.latch_tmu(chips, |t| t.dt_dy = st_fixed(data)),
            regs::START_W => {
                if chips & 1 != 0 {
                    self.tri.start_w = w_fixed(data);
                }
                self.latch_tmu(chips, |t| t.start_w = w_fixed(data));
            }
            regs::DWDX => {
                if chips & 1 != 0 {
                    self.tri.dwdx = w_fixed(data);
                }
                self.latch_tmu(chips, |t| t.dw_dx = w_fixed(data));
            }
            regs::DWDY => {
                if chips & 1 != 0 {
                    self.tri.dwdy = w_fixed(data);
                }
                self.latch_tmu(chips, |t| t.dw_dy = w_fixed(data));
            }

            // Floating-point aliases of the same latches
            regs::FVERTEX_AX => self.tri.ax = f_vertex(data),
            regs::FVERTEX_AY => self.tri.ay = f_vertex(data),
            regs::FVERTEX_BX => self.tri.bx = f_vertex(data),
            regs::FVERTEX_BY => self.tri.by = f_vertex(data),
            regs::FVERTEX_CX => self.tri.cx = f_vertex(data),
            regs::FVERTEX_CY => self.tri.cy = f_vertex(data),
            regs::FSTART_R if chips & 1 != 0 => self.tri.start_r = f_color(data),
            regs::FSTART_G if chips & 1 != 0 => self.tri.start_g = f_color(data),
            regs::FSTART_B if chips & 1 != 0 => self.tri.start_b = f_color(data),
            regs::FSTART_A if chips & 1 != 0 => self.tri.start_a = f_color(data),
            regs::FSTART_Z if chips & 1 != 0 => self.tri.start_z = f_color(data),
            regs::FDRDX if chips & 1 != 0 => self.tri.drdx = f_color(data),
            regs::FDGDX if chips & 1 != 0 => self.tri.dgdx = f_color(data),
            regs::FDBDX if chips & 1 != 0 => self.tri.dbdx = f_color(data),
            regs::FDADX if chips & 1 != 0 => self.tri.dadx = f_color(data),
            regs::FDZDX if chips & 1 != 0 => self.tri.dzdx = f_color(data),
            regs::FDRDY if chips & 1 != 0 => self.tri.drdy = f_color(data),
            regs::FDGDY if chips & 1 != 0 => self.tri.dgdy = f_color(data),
            regs::FDBDY if chips & 1 != 0 => self.tri.dbdy = f_color(data),
            regs::FDADY if chips & 1 != 0 => self.tri.dady = f_color(data),
            regs::FDZDY if chips & 1 != 0 => self.tri.dzdy = f_color(data),
            regs::FSTART_S => self.latch_tmu(chips, |t| t.start_s = f_stw(data)),
            regs::FSTART_T => self.latch_tmu(chips, |t| t.start_t = f_stw(data)),
            regs::FDSDX => self.latch_tmu(chips, |t| t.ds_dx = f_stw(data)),
            regs::FDTDX => self.latch_tmu(chips, |t| t.dt_dx = f_stw(data)),
            regs::FDSDY => self.latch_tmu(chips, |t| t.ds_dy = f_stw(data)),
            regs::FDTDY => self.latch_tmu(chips, |t| t.dt_dy = f_stw(data)),
            regs::FSTART_W => {
                if chips & 1 != 0 {
                    self.tri.start_w = f_stw(data);
                }
                self.latch_tmu(chips, |t| t.start_w = f_stw(data));
            }
            regs::FDWDX => {
                if chips & 1 != 0 {
                    self.tri.dwdx = f_stw(data);
                }
                self.latch_tmu(chips, |t| t.dw_dx = f_stw(data));
            }
            regs::FDWDY => {
                if chips & 1 != 0 {
                    self.tri.dwdy = f_stw(data);
                }
                self.latch_tmu(chips, |t| t.dw_dy = f_stw(data));
            }

            regs::TRIANGLE_CMD | regs::FTRIANGLE_CMD => self.exec_triangle(),
            regs::FASTFILL_CMD => self.exec_fastfill(),
            regs::SWAPBUFFER_CMD => self.exec_swapbuffer(),
            regs::NOP_CMD => {
                if data & 1 != 0 {
                    self.stats = PixelStats::default();
                }
            }

            regs::CLIP_LEFT_RIGHT | regs::CLIP_LOW_Y_HIGH_Y => {
                if self.regs.write(regnum, data) {
                    self.fbi.set_clip(
                        self.regs.get(regs::CLIP_LEFT_RIGHT),
                        self.regs.get(regs::CLIP_LOW_Y_HIGH_Y),
                    );
                    self.record_clip_gpu();
                }
            }

            // Two packed (delta, blend) fog entries per word
            regs::FOG_TABLE..=regs::FOG_TABLE_END => {
                let i = ((regnum - regs::FOG_TABLE) * 2) as usize;
                self.fog_delta[i] = (data & 0xff) as u8;
                self.fog_blend[i] = ((data >> 8) & 0xff) as u8;
                self.fog_delta[i + 1] = ((data >> 16) & 0xff) as u8;
                self.fog_blend[i + 1] = ((data >> 24) & 0xff) as u8;
            }

            _ => {
                self.regs.write(regnum, data);
            }
        }
    }

    /// Memory-mapped register read
    pub fn register_read(&self, offset: u32) -> u32 {
        let regnum = (offset >> 2) & 0xff;
        match regnum {
            // FIFO always reports empty; swaps execute immediately so
            // none are ever pending
            regs::STATUS => 0x3f | ((self.fbi.front_index() as u32) << 10),
            regs::FBI_PIXELS_IN => (self.stats.pixels_in & 0xff_ffff) as u32,
            regs::FBI_CHROMA_FAIL => (self.stats.chroma_fail & 0xff_ffff) as u32,
            regs::FBI_ZFUNC_FAIL => (self.stats.zfunc_fail & 0xff_ffff) as u32,
            regs::FBI_AFUNC_FAIL => (self.stats.afunc_fail & 0xff_ffff) as u32,
            regs::FBI_PIXELS_OUT => (self.stats.pixels_out & 0xff_ffff) as u32,
            _ => self.regs.read(regnum),
        }
    }

    /// Linear frame buffer write; `offset` is a 16-bit-pixel offset
    pub fn lfb_write(&mut self, offset: u32, data: u32) {
        let lfb_mode = self.regs.get(regs::LFB_MODE);
        self.fbi.lfb_write(lfb_mode, offset, data);
        if self.executor.is_some() {
            self.record_lfb_gpu(lfb_mode, offset, data);
        }
    }

    /// Mirror an LFB write into the deferred backend as point draws
    fn record_lfb_gpu(&mut self, lfb_mode: u32, offset: u32, data: u32) {
        let x = offset % self.fbi.row_pixels();
        let mut y = offset / self.fbi.row_pixels();
        if lfb::y_origin_inverted(lfb_mode) {
            y = self.fbi.height().saturating_sub(1).saturating_sub(y);
        }
        let alpha_mode = lfb::enable_pixel_pipeline(lfb_mode)
            .then(|| self.regs.get(regs::ALPHA_MODE));

        let Some(exec) = self.executor.as_mut() else {
            return;
        };
        let format = lfb::write_format(lfb_mode);
        match format {
            0 | 1 | 2 => {
                let lo = lfb_color_to_565((data & 0xffff) as u16, format);
                let hi = lfb_color_to_565((data >> 16) as u16, format);
                exec.record_pixel(x, y, rgba_unit(expand_565(lo)), None, alpha_mode);
                exec.record_pixel(x + 1, y, rgba_unit(expand_565(hi)), None, alpha_mode);
            }
            12..=15 => {
                let color = lfb_color_to_565((data & 0xffff) as u16, 0);
                let depth = ((data >> 16) & 0xffff) as f32 / 65535.0;
                exec.record_pixel(x, y, rgba_unit(expand_565(color)), Some(depth), alpha_mode);
            }
            _ => {}
        }
    }

    /// Linear frame buffer read; `offset` is a 16-bit-pixel offset
    pub fn lfb_read(&self, offset: u32) -> u32 {
        let lfb_mode = self.regs.get(regs::LFB_MODE);
        self.fbi.lfb_read(lfb_mode, offset)
    }

    /// Texture download into one TMU's memory
    pub fn texture_write(&mut self, tmu: usize, byte_offset: u32, data: u32) {
        if let Some(unit) = self.tmus.get_mut(tmu) {
            unit.texture_write(byte_offset, data);
        }
    }

    fn tmu_register_write(&mut self, regnum: u32, chips: u32, data: u32) {
        for (index, tmu) in self.tmus.iter_mut().enumerate() {
            if chips & (2 << index) == 0 {
                continue;
            }
            match regnum {
                regs::TEXTURE_MODE => tmu.set_texture_mode(data),
                regs::T_LOD => tmu.set_t_lod(data),
                regs::T_DETAIL => tmu.set_t_detail(data),
                regs::TEX_BASE_ADDR => tmu.set_tex_base(0, data),
                regs::TEX_BASE_ADDR_1 => tmu.set_tex_base(1, data),
                regs::TEX_BASE_ADDR_2 => tmu.set_tex_base(2, data),
                regs::TEX_BASE_ADDR_3_8 => tmu.set_tex_base(3, data),
                regs::TREX_INIT0 | regs::TREX_INIT1 => {}
                regs::NCC_TABLE0..=regs::NCC_TABLE1_END => {
                    let (table, word) = if regnum < regs::NCC_TABLE1 {
                        (0, regnum - regs::NCC_TABLE0)
                    } else {
                        (1, regnum - regs::NCC_TABLE1)
                    };
                    tmu.ncc_write(table, word as usize, data);
                }
                _ => {}
            }
        }
    }

    fn latch_tmu(&mut self, chips: u32, mut apply: impl FnMut(&mut crate::core::raster::TmuParams)) {
        for index in 0..2 {
            if chips & (2 << index) != 0 {
                apply(&mut self.tri.tmu[index]);
            }
        }
    }

    fn pixel_regs(&self) -> PixelRegs {
        PixelRegs {
            fbz_mode: self.regs.get(regs::FBZ_MODE),
            color_path: self.regs.get(regs::FBZ_COLOR_PATH),
            alpha_mode: self.regs.get(regs::ALPHA_MODE),
            fog_mode: self.regs.get(regs::FOG_MODE),
            stipple: self.regs.get(regs::STIPPLE),
            color0: self.regs.get(regs::COLOR0),
            color1: self.regs.get(regs::COLOR1),
            za_color: self.regs.get(regs::ZA_COLOR),
            chroma_key: self.regs.get(regs::CHROMA_KEY),
            chroma_range: self.regs.get(regs::CHROMA_RANGE),
            fog_color: self.regs.get(regs::FOG_COLOR),
            fog_blend: self.fog_blend,
            fog_delta: self.fog_delta,
        }
    }

    fn exec_triangle(&mut self) {
        let fbz_mode = self.regs.get(regs::FBZ_MODE);
        let color_path = self.regs.get(regs::FBZ_COLOR_PATH);
        self.triangles += 1;

        let clip = if fbz::enable_clipping(fbz_mode) {
            self.fbi.clip()
        } else {
            ClipRect::full(self.fbi.width(), self.fbi.height())
        };
        let y_flip = fbz::y_origin_inverted(fbz_mode).then(|| self.fbi.height() as i32 - 1);

        let Some(setup) = TriangleSetup::new(self.tri, color_path, &clip, y_flip) else {
            return;
        };

        if self.executor.is_some() {
            if let Err(err) = self.record_triangle_gpu() {
                log::error!("deferred triangle failed: {err}");
            }
            return;
        }

        let texture_on = cp::texture_enable(color_path);
        let mut snapshots = Vec::new();
        let mut lod_base = [0i32; 2];
        if texture_on {
            for (index, tmu) in self.tmus.iter_mut().enumerate() {
                snapshots.push(tmu.raster_snapshot());
                lod_base[index] = compute_lod_base(&self.tables, &self.tri.tmu[index]);
            }
        }

        let Some(dest_base) = self.fbi.draw_buffer_offset(fbz_mode) else {
            log::debug!("triangle to reserved draw buffer selector, dropped");
            return;
        };
        let aux_base = self.fbi.aux_offset();
        let row_pixels = self.fbi.row_pixels();
        let (ram, mask) = self.fbi.raw_parts();
        let target = FrameTarget { ram, mask, row_pixels, dest_base, aux_base };

        let regs_snap = self.pixel_regs();
        let stats = self.pool.dispatch(
            Arc::new(setup),
            &regs_snap,
            target,
            &self.tables,
            &snapshots,
            lod_base,
        );
        self.stats.merge(&stats);
    }

    fn record_triangle_gpu(&mut self) -> Result<()> {
        let state = PipelineState {
            fbz_mode: self.regs.get(regs::FBZ_MODE),
            color_path: self.regs.get(regs::FBZ_COLOR_PATH),
            alpha_mode: self.regs.get(regs::ALPHA_MODE),
            fog_mode: self.regs.get(regs::FOG_MODE),
            texture_mode: [
                self.tmus.first().map_or(0, Tmu::texture_mode),
                self.tmus.get(1).map_or(0, Tmu::texture_mode),
            ],
        };
        let texture_on = cp::texture_enable(state.color_path);
        let tmu_enabled = [
            texture_on && !self.tmus.is_empty(),
            texture_on && self.tmus.len() > 1,
        ];

        let color0 = self.regs.get(regs::COLOR0);
        let color1 = self.regs.get(regs::COLOR1);
        let chroma = self.regs.get(regs::CHROMA_KEY);
        let fog = self.regs.get(regs::FOG_COLOR);
        let uniforms = DrawUniforms {
            color0: argb_to_f32(color0),
            color1: argb_to_f32(color1),
            chroma_key: rgb_to_f32(chroma),
            fog_color: rgb_to_f32(fog),
            alpha_ref: ((self.regs.get(regs::ALPHA_MODE) >> 24) & 0xff) as f32 / 255.0,
        };

        let p = self.tri;
        let verts = [
            gpu_vertex(&p, p.ax, p.ay),
            gpu_vertex(&p, p.bx, p.by),
            gpu_vertex(&p, p.cx, p.cy),
        ];

        let Some(exec) = self.executor.as_mut() else {
            return Ok(());
        };
        exec.record_triangle(&state, tmu_enabled, uniforms, &verts, &mut self.tmus)
    }

    fn record_clip_gpu(&mut self) {
        let clip = self.fbi.clip();
        if let Some(exec) = self.executor.as_mut() {
            exec.record_clip(Some(Region {
                left: clip.left,
                top: clip.top,
                right: clip.right,
                bottom: clip.bottom,
            }));
        }
    }

    fn exec_fastfill(&mut self) {
        let fbz_mode = self.regs.get(regs::FBZ_MODE);
        let color1 = self.regs.get(regs::COLOR1);
        let za_color = self.regs.get(regs::ZA_COLOR);

        // Chip memory is filled even on the GPU path so LFB reads stay
        // coherent before the next mirror
        self.fbi.fastfill(fbz_mode, color1, za_color);

        let clip = self.fbi.clip();
        if let Some(exec) = self.executor.as_mut() {
            exec.record_fastfill(
                Region {
                    left: clip.left,
                    top: clip.top,
                    right: clip.right,
                    bottom: clip.bottom,
                },
                fbz::rgb_buffer_mask(fbz_mode).then_some(color1),
                fbz::aux_buffer_mask(fbz_mode).then_some((za_color & 0xffff) as u16),
            );
        }
    }

    fn exec_swapbuffer(&mut self) {
        if let Some(exec) = self.executor.as_mut() {
            if let Err(err) = exec.end_frame(&mut self.fbi) {
                log::error!("frame flush failed: {err}");
            }
        }
        self.fbi.swap_buffers();
    }
}

/// 12.4 vertex coordinate from the low 16 bits
#[inline]
fn vertex_fixed(data: u32) -> i32 {
    i32::from(data as u16 as i16)
}

/// 12.12 color/alpha start or gradient, sign-extended from 24 bits
#[inline]
fn color_fixed(data: u32) -> i32 {
    ((data << 8) as i32) >> 8
}

/// Integer S/T parameter shifted to the 14.18+14 iterator scale
#[inline]
fn st_fixed(data: u32) -> i64 {
    i64::from(data as i32) << 14
}

/// Integer W parameter shifted to the 2.30+16 iterator scale
#[inline]
fn w_fixed(data: u32) -> i64 {
    i64::from(data as i32) << 2
}

/// Float vertex alias (pixels to 12.4)
#[inline]
fn f_vertex(data: u32) -> i32 {
    (f32::from_bits(data) * 16.0) as i32
}

/// Float color/depth alias (units to 12.12 / 20.12)
#[inline]
fn f_color(data: u32) -> i32 {
    (f32::from_bits(data) * 4096.0) as i32
}

/// Float S/T/W alias scaled by 2^32 into the 48-bit iterators
#[inline]
fn f_stw(data: u32) -> i64 {
    (f64::from(f32::from_bits(data)) * 4_294_967_296.0) as i64
}

fn argb_to_f32(argb: u32) -> [f32; 4] {
    [
        ((argb >> 16) & 0xff) as f32 / 255.0,
        ((argb >> 8) & 0xff) as f32 / 255.0,
        (argb & 0xff) as f32 / 255.0,
        ((argb >> 24) & 0xff) as f32 / 255.0,
    ]
}

fn rgba_unit(rgba: [u8; 4]) -> [f32; 4] {
    [
        f32::from(rgba[0]) / 255.0,
        f32::from(rgba[1]) / 255.0,
        f32::from(rgba[2]) / 255.0,
        f32::from(rgba[3]) / 255.0,
    ]
}

fn rgb_to_f32(argb: u32) -> [f32; 3] {
    [
        ((argb >> 16) & 0xff) as f32 / 255.0,
        ((argb >> 8) & 0xff) as f32 / 255.0,
        (argb & 0xff) as f32 / 255.0,
    ]
}

/// Evaluate the latched iterators at one vertex for the GPU path
///
/// The software rasterizer anchors parameters at vertex A in whole-pixel
/// steps; the GPU interpolates across the triangle instead, so exact
/// per-vertex values are good enough here.
fn gpu_vertex(p: &TriangleParams, vx: i32, vy: i32) -> GpuVertex {
    let fdx = (vx - p.ax) as f32 / 16.0;
    let fdy = (vy - p.ay) as f32 / 16.0;
    let channel = |start: i32, ddx: i32, ddy: i32| -> f32 {
        let v = start as f32 + fdy * ddy as f32 + fdx * ddx as f32;
        (v / 4096.0 / 255.0).clamp(0.0, 1.0)
    };
    let param = |start: i64, ddx: i64, ddy: i64| -> f32 {
        let v = start as f64 + f64::from(fdy) * ddy as f64 + f64::from(fdx) * ddx as f64;
        (v / 4_294_967_296.0) as f32
    };
    let z = p.start_z as f32 + fdy * p.dzdy as f32 + fdx * p.dzdx as f32;

    let mut st = [[0.0f32; 2]; 2];
    let mut inv_w = [1.0f32; 2];
    for (unit, t) in p.tmu.iter().enumerate() {
        st[unit] = [
            param(t.start_s, t.ds_dx, t.ds_dy),
            param(t.start_t, t.dt_dx, t.dt_dy),
        ];
        inv_w[unit] = param(t.start_w, t.dw_dx, t.dw_dy);
    }

    GpuVertex {
        x: vx as f32 / 16.0,
        y: vy as f32 / 16.0,
        depth: (z / 4096.0 / 65535.0).clamp(0.0, 1.0),
        rgba: [
            channel(p.start_r, p.drdx, p.drdy),
            channel(p.start_g, p.dgdx, p.dgdy),
            channel(p.start_b, p.dbdx, p.dbdy),
            channel(p.start_a, p.dadx, p.dady),
        ],
        st,
        inv_w,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::mock::MockDevice;

    fn small_config() -> VoodooConfig {
        VoodooConfig {
            width: 64,
            height: 64,
            fb_size: 1 << 16,
            tex_size: 1 << 16,
            tmu_count: 1,
            workers: 1,
        }
    }

    /// Latch a flat white right triangle covering the upper-left half of
    /// a 32x32 square
    fn latch_triangle(chip: &mut Voodoo) {
        chip.register_write(regs::VERTEX_AX * 4, 0);
        chip.register_write(regs::VERTEX_AY * 4, 0);
        chip.register_write(regs::VERTEX_BX * 4, 32 << 4);
        chip.register_write(regs::VERTEX_BY * 4, 0);
        chip.register_write(regs::VERTEX_CX * 4, 0);
        chip.register_write(regs::VERTEX_CY * 4, 32 << 4);
        chip.register_write(regs::START_R * 4, 0xff << 12);
        chip.register_write(regs::START_G * 4, 0xff << 12);
        chip.register_write(regs::START_B * 4, 0xff << 12);
        chip.register_write(regs::START_A * 4, 0xff << 12);
    }

    #[test]
    fn test_mode_register_round_trip() {
        let mut chip = Voodoo::new(small_config());
        chip.register_write(regs::FBZ_MODE * 4, 0x0000_0200);
        assert_eq!(chip.register_read(regs::FBZ_MODE * 4), 0x0000_0200);
    }

    #[test]
    fn test_stats_registers_are_write_protected() {
        let mut chip = Voodoo::new(small_config());
        chip.register_write(regs::FBI_PIXELS_IN * 4, 0x1234);
        assert_eq!(chip.register_read(regs::FBI_PIXELS_IN * 4), 0);
    }

    #[test]
    fn test_triangle_renders_pixels() {
        let mut chip = Voodoo::new(small_config());
        chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        latch_triangle(&mut chip);
        chip.register_write(regs::TRIANGLE_CMD * 4, 0);

        // (4, 4) is deep inside the triangle, (40, 40) outside
        let row = chip.fbi().row_pixels();
        let base = chip.fbi().rgb_offset(chip.fbi().front_index());
        assert_eq!(chip.fbi().read_pixel(base + 4 * row + 4), 0xffff);
        assert_eq!(chip.fbi().read_pixel(base + 40 * row + 40), 0);
        assert!(chip.stats().pixels_out > 0);
    }

    #[test]
    fn test_float_aliases_match_integer_registers() {
        let mut int_chip = Voodoo::new(small_config());
        int_chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        latch_triangle(&mut int_chip);
        int_chip.register_write(regs::TRIANGLE_CMD * 4, 0);

        let mut f_chip = Voodoo::new(small_config());
        f_chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        f_chip.register_write(regs::FVERTEX_AX * 4, 0.0f32.to_bits());
        f_chip.register_write(regs::FVERTEX_AY * 4, 0.0f32.to_bits());
        f_chip.register_write(regs::FVERTEX_BX * 4, 32.0f32.to_bits());
        f_chip.register_write(regs::FVERTEX_BY * 4, 0.0f32.to_bits());
        f_chip.register_write(regs::FVERTEX_CX * 4, 0.0f32.to_bits());
        f_chip.register_write(regs::FVERTEX_CY * 4, 32.0f32.to_bits());
        f_chip.register_write(regs::FSTART_R * 4, 255.0f32.to_bits());
        f_chip.register_write(regs::FSTART_G * 4, 255.0f32.to_bits());
        f_chip.register_write(regs::FSTART_B * 4, 255.0f32.to_bits());
        f_chip.register_write(regs::FSTART_A * 4, 255.0f32.to_bits());
        f_chip.register_write(regs::FTRIANGLE_CMD * 4, 0);

        assert_eq!(int_chip.stats().pixels_in, f_chip.stats().pixels_in);
        let row = int_chip.fbi().row_pixels();
        let base = int_chip.fbi().rgb_offset(int_chip.fbi().front_index());
        assert_eq!(
            int_chip.fbi().read_pixel(base + 4 * row + 4),
            f_chip.fbi().read_pixel(base + 4 * row + 4)
        );
    }

    #[test]
    fn test_nop_clears_statistics() {
        let mut chip = Voodoo::new(small_config());
        chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        latch_triangle(&mut chip);
        chip.register_write(regs::TRIANGLE_CMD * 4, 0);
        assert!(chip.register_read(regs::FBI_PIXELS_IN * 4) > 0);

        // data bit 0 selects the stats clear
        chip.register_write(regs::NOP_CMD * 4, 0);
        assert!(chip.register_read(regs::FBI_PIXELS_IN * 4) > 0);
        chip.register_write(regs::NOP_CMD * 4, 1);
        assert_eq!(chip.register_read(regs::FBI_PIXELS_IN * 4), 0);
    }

    #[test]
    fn test_fastfill_clears_clip_rect() {
        let mut chip = Voodoo::new(small_config());
        chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        chip.register_write(regs::COLOR1 * 4, 0x00ff_ffff);
        // clip to x 8..16, y 8..16
        chip.register_write(regs::CLIP_LEFT_RIGHT * 4, (8 << 16) | 16);
        chip.register_write(regs::CLIP_LOW_Y_HIGH_Y * 4, (8 << 16) | 16);
        chip.register_write(regs::FASTFILL_CMD * 4, 0);

        let row = chip.fbi().row_pixels();
        let base = chip.fbi().rgb_offset(chip.fbi().front_index());
        assert_eq!(chip.fbi().read_pixel(base + 8 * row + 8), 0xffff);
        assert_eq!(chip.fbi().read_pixel(base + 4 * row + 4), 0);
    }

    #[test]
    fn test_swapbuffer_flips_front_and_back() {
        let mut chip = Voodoo::new(small_config());
        let front_before = chip.fbi().front_index();
        chip.register_write(regs::SWAPBUFFER_CMD * 4, 0);
        assert_ne!(chip.fbi().front_index(), front_before);
        assert_eq!(chip.fbi().swap_count(), 1);
    }

    #[test]
    fn test_chip_select_routes_tmu_registers() {
        let mut chip = Voodoo::new(VoodooConfig { tmu_count: 2, ..small_config() });
        // chip-select bit 1 in address bits 10-13: TMU0 only
        let offset = (2 << 10) | (regs::TEXTURE_MODE * 4);
        chip.register_write(offset, 10 << 8);
        assert_eq!(chip.tmu(0).map(Tmu::texture_mode), Some(10 << 8));
        assert_eq!(chip.tmu(1).map(Tmu::texture_mode), Some(0));

        // zero chip select broadcasts
        chip.register_write(regs::TEXTURE_MODE * 4, 5 << 8);
        assert_eq!(chip.tmu(0).map(Tmu::texture_mode), Some(5 << 8));
        assert_eq!(chip.tmu(1).map(Tmu::texture_mode), Some(5 << 8));
    }

    #[test]
    fn test_invalid_config_is_clamped_not_fatal() {
        let bad = VoodooConfig {
            width: 5000,
            fb_size: 12345,
            ..VoodooConfig::default()
        };
        assert!(bad.validate().is_err());
        let chip = Voodoo::new(bad);
        assert_eq!(chip.config().width, MAX_DIMENSION);
        assert!(chip.config().fb_size.is_power_of_two());
    }

    #[test]
    fn test_deferred_backend_records_and_swaps() {
        let mut chip = Voodoo::with_device(small_config(), Box::new(MockDevice::new()));
        chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        latch_triangle(&mut chip);
        chip.register_write(regs::TRIANGLE_CMD * 4, 0);
        assert_eq!(chip.executor().map(Executor::pending_commands), Some(1));

        chip.register_write(regs::SWAPBUFFER_CMD * 4, 0);
        assert_eq!(chip.executor().map(Executor::pending_commands), Some(0));
        assert_eq!(chip.executor().map(Executor::frame), Some(1));
    }

    #[test]
    fn test_deferred_backend_mirrors_lfb_writes() {
        let mut chip = Voodoo::with_device(small_config(), Box::new(MockDevice::new()));
        // format 0, back buffer, pipeline bypassed
        chip.register_write(regs::LFB_MODE * 4, 1 << 4);
        chip.lfb_write(0, 0xf800_07e0);
        chip.lfb_write(2, 0x001f_ffff);
        // four pixels collapse into one raw-pixel run
        assert_eq!(chip.executor().map(Executor::pending_commands), Some(1));
        // the software arena saw the same write
        let back = chip.fbi().rgb_offset(chip.fbi().back_index());
        assert_eq!(chip.fbi().read_pixel(back), 0x07e0);
    }

    #[test]
    fn test_degenerate_triangle_draws_nothing() {
        let mut chip = Voodoo::new(small_config());
        chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        // all three vertices on one scanline
        chip.register_write(regs::VERTEX_AX * 4, 0);
        chip.register_write(regs::VERTEX_AY * 4, 5 << 4);
        chip.register_write(regs::VERTEX_BX * 4, 10 << 4);
        chip.register_write(regs::VERTEX_BY * 4, 5 << 4);
        chip.register_write(regs::VERTEX_CX * 4, 20 << 4);
        chip.register_write(regs::VERTEX_CY * 4, 5 << 4);
        chip.register_write(regs::TRIANGLE_CMD * 4, 0);
        assert_eq!(chip.stats().pixels_in, 0);
        assert_eq!(chip.triangle_count(), 1);
    }

    #[test]
    fn test_lfb_write_reads_back() {
        let mut chip = Voodoo::new(small_config());
        // format 0: two 565 pixels per word, front buffer
        chip.register_write(regs::LFB_MODE * 4, 0);
        chip.lfb_write(0, 0xf800_07e0);
        let read = chip.lfb_read(0);
        assert_eq!(read, 0xf800_07e0);
    }
}
