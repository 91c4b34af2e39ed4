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

//! Memory-mapped register file
//!
//! The chip exposes a 32-bit-word-addressed register file covering byte
//! offsets 0x000-0x380. Every register carries access-permission flags;
//! writes to non-writable registers are rejected (logged, no effect) and
//! reads of non-readable registers return zero. The bus-decode layer that
//! produces these accesses is an external collaborator; this module is the
//! consuming side.

use bitflags::bitflags;

/// Named register word indices (byte offset / 4)
///
/// Grouped the way the hardware groups them: integer vertex parameters,
/// floating-point aliases, mode registers, command triggers, video/init
/// registers, and the per-TMU block at 0x300+.
pub mod regs {
    pub const STATUS: u32 = 0x00;

    // Integer triangle parameters
    pub const VERTEX_AX: u32 = 0x02;
    pub const VERTEX_AY: u32 = 0x03;
    pub const VERTEX_BX: u32 = 0x04;
    pub const VERTEX_BY: u32 = 0x05;
    pub const VERTEX_CX: u32 = 0x06;
    pub const VERTEX_CY: u32 = 0x07;
    pub const START_R: u32 = 0x08;
    pub const START_G: u32 = 0x09;
    pub const START_B: u32 = 0x0a;
    pub const START_Z: u32 = 0x0b;
    pub const START_A: u32 = 0x0c;
    pub const START_S: u32 = 0x0d;
    pub const START_T: u32 = 0x0e;
    pub const START_W: u32 = 0x0f;
    pub const DRDX: u32 = 0x10;
    pub const DGDX: u32 = 0x11;
    pub const DBDX: u32 = 0x12;
    pub const DZDX: u32 = 0x13;
    pub const DADX: u32 = 0x14;
    pub const DSDX: u32 = 0x15;
    pub const DTDX: u32 = 0x16;
    pub const DWDX: u32 = 0x17;
    pub const DRDY: u32 = 0x18;
    pub const DGDY: u32 = 0x19;
    pub const DBDY: u32 = 0x1a;
    pub const DZDY: u32 = 0x1b;
    pub const DADY: u32 = 0x1c;
    pub const DSDY: u32 = 0x1d;
    pub const DTDY: u32 = 0x1e;
    pub const DWDY: u32 = 0x1f;
    pub const TRIANGLE_CMD: u32 = 0x20;

    // Floating-point triangle parameter aliases
    pub const FVERTEX_AX: u32 = 0x22;
    pub const FVERTEX_AY: u32 = 0x23;
    pub const FVERTEX_BX: u32 = 0x24;
    pub const FVERTEX_BY: u32 = 0x25;
    pub const FVERTEX_CX: u32 = 0x26;
    pub const FVERTEX_CY: u32 = 0x27;
    pub const FSTART_R: u32 = 0x28;
    pub const FSTART_G: u32 = 0x29;
    pub const FSTART_B: u32 = 0x2a;
    pub const FSTART_Z: u32 = 0x2b;
    pub const FSTART_A: u32 = 0x2c;
    pub const FSTART_S: u32 = 0x2d;
    pub const FSTART_T: u32 = 0x2e;
    pub const FSTART_W: u32 = 0x2f;
    pub const FDRDX: u32 = 0x30;
    pub const FDGDX: u32 = 0x31;
    pub const FDBDX: u32 = 0x32;
    pub const FDZDX: u32 = 0x33;
    pub const FDADX: u32 = 0x34;
    pub const FDSDX: u32 = 0x35;
    pub const FDTDX: u32 = 0x36;
    pub const FDWDX: u32 = 0x37;
    pub const FDRDY: u32 = 0x38;
    pub const FDGDY: u32 = 0x39;
    pub const FDBDY: u32 = 0x3a;
    pub const FDZDY: u32 = 0x3b;
    pub const FDADY: u32 = 0x3c;
    pub const FDSDY: u32 = 0x3d;
    pub const FDTDY: u32 = 0x3e;
    pub const FDWDY: u32 = 0x3f;
    pub const FTRIANGLE_CMD: u32 = 0x40;

    // Mode and command registers
    pub const FBZ_COLOR_PATH: u32 = 0x41;
    pub const FOG_MODE: u32 = 0x42;
    pub const ALPHA_MODE: u32 = 0x43;
    pub const FBZ_MODE: u32 = 0x44;
    pub const LFB_MODE: u32 = 0x45;
    pub const CLIP_LEFT_RIGHT: u32 = 0x46;
    pub const CLIP_LOW_Y_HIGH_Y: u32 = 0x47;
    pub const NOP_CMD: u32 = 0x48;
    pub const FASTFILL_CMD: u32 = 0x49;
    pub const SWAPBUFFER_CMD: u32 = 0x4a;
    pub const FOG_COLOR: u32 = 0x4b;
    pub const ZA_COLOR: u32 = 0x4c;
    pub const CHROMA_KEY: u32 = 0x4d;
    pub const CHROMA_RANGE: u32 = 0x4e;
    pub const STIPPLE: u32 = 0x50;
    pub const COLOR0: u32 = 0x51;
    pub const COLOR1: u32 = 0x52;

    // Read-only statistics
    pub const FBI_PIXELS_IN: u32 = 0x53;
    pub const FBI_CHROMA_FAIL: u32 = 0x54;
    pub const FBI_ZFUNC_FAIL: u32 = 0x55;
    pub const FBI_AFUNC_FAIL: u32 = 0x56;
    pub const FBI_PIXELS_OUT: u32 = 0x57;

    /// 32 words, two packed fog-table entries each
    pub const FOG_TABLE: u32 = 0x58;
    pub const FOG_TABLE_END: u32 = 0x77;

    // Video/init registers (consumed by the external timing layer)
    pub const FBI_INIT4: u32 = 0x80;
    pub const VIDEO_DIMENSIONS: u32 = 0x83;
    pub const FBI_INIT0: u32 = 0x84;
    pub const FBI_INIT1: u32 = 0x85;
    pub const FBI_INIT2: u32 = 0x86;
    pub const FBI_INIT3: u32 = 0x87;
    pub const H_SYNC: u32 = 0x88;
    pub const V_SYNC: u32 = 0x89;
    pub const CLUT_DATA: u32 = 0x8a;
    pub const DAC_DATA: u32 = 0x8b;

    // TMU registers (selected by chip-select bits in the address)
    pub const TEXTURE_MODE: u32 = 0xc0;
    pub const T_LOD: u32 = 0xc1;
    pub const T_DETAIL: u32 = 0xc2;
    pub const TEX_BASE_ADDR: u32 = 0xc3;
    pub const TEX_BASE_ADDR_1: u32 = 0xc4;
    pub const TEX_BASE_ADDR_2: u32 = 0xc5;
    pub const TEX_BASE_ADDR_3_8: u32 = 0xc6;
    pub const TREX_INIT0: u32 = 0xc7;
    pub const TREX_INIT1: u32 = 0xc8;

    /// 12 words: 4 Y, 4 I, 4 Q
    pub const NCC_TABLE0: u32 = 0xc9;
    pub const NCC_TABLE1: u32 = 0xd5;
    pub const NCC_TABLE1_END: u32 = 0xe0;
}

/// Number of register words modeled
pub const REGISTER_COUNT: usize = 0x100;

bitflags! {
    /// Per-register access permission bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegisterAccess: u8 {
        /// Host reads are allowed
        const READ = 1 << 0;
        /// Host writes are allowed
        const WRITE = 1 << 1;
        /// Writes go through the rendering pipeline (ordered with drawing)
        const PIPELINED = 1 << 2;
        /// Writes pass through the command FIFO
        const FIFO = 1 << 3;
    }
}

impl RegisterAccess {
    /// Write + pipelined + FIFO, the common case for drawing registers
    pub const WPF: Self = Self::WRITE.union(Self::PIPELINED).union(Self::FIFO);

    /// Read/write + pipelined + FIFO, used for the mode registers
    pub const RWPF: Self = Self::READ.union(Self::WPF);
}

/// Look up the access permissions for a register word index
///
/// Indices outside the modeled map get empty permissions, so stray accesses
/// are rejected the same way writes to read-only registers are.
pub fn register_access(regnum: u32) -> RegisterAccess {
    use regs::*;
    match regnum {
        STATUS => RegisterAccess::READ,
        VERTEX_AX..=TRIANGLE_CMD => RegisterAccess::WPF,
        FVERTEX_AX..=FTRIANGLE_CMD => RegisterAccess::WPF,
        FBZ_COLOR_PATH..=CHROMA_RANGE => RegisterAccess::RWPF,
        STIPPLE..=COLOR1 => RegisterAccess::RWPF,
        FBI_PIXELS_IN..=FBI_PIXELS_OUT => RegisterAccess::READ,
        FOG_TABLE..=FOG_TABLE_END => RegisterAccess::WPF,
        FBI_INIT4..=DAC_DATA => RegisterAccess::READ.union(RegisterAccess::WRITE),
        TEXTURE_MODE..=NCC_TABLE1_END => RegisterAccess::WPF,
        _ => RegisterAccess::empty(),
    }
}

/// Human-readable register name for diagnostics
pub fn register_name(regnum: u32) -> &'static str {
    use regs::*;
    match regnum {
        STATUS => "status",
        VERTEX_AX => "vertexAx",
        VERTEX_AY => "vertexAy",
        VERTEX_BX => "vertexBx",
        VERTEX_BY => "vertexBy",
        VERTEX_CX => "vertexCx",
        VERTEX_CY => "vertexCy",
        START_R..=START_W => "startRGBZASTW",
        DRDX..=DWDX => "dX",
        DRDY..=DWDY => "dY",
        TRIANGLE_CMD => "triangleCMD",
        FVERTEX_AX..=FVERTEX_CY => "fvertex",
        FSTART_R..=FSTART_W => "fstartRGBZASTW",
        FDRDX..=FDWDX => "fdX",
        FDRDY..=FDWDY => "fdY",
        FTRIANGLE_CMD => "ftriangleCMD",
        FBZ_COLOR_PATH => "fbzColorPath",
        FOG_MODE => "fogMode",
        ALPHA_MODE => "alphaMode",
        FBZ_MODE => "fbzMode",
        LFB_MODE => "lfbMode",
        CLIP_LEFT_RIGHT => "clipLeftRight",
        CLIP_LOW_Y_HIGH_Y => "clipLowYHighY",
        NOP_CMD => "nopCMD",
        FASTFILL_CMD => "fastfillCMD",
        SWAPBUFFER_CMD => "swapbufferCMD",
        FOG_COLOR => "fogColor",
        ZA_COLOR => "zaColor",
        CHROMA_KEY => "chromaKey",
        CHROMA_RANGE => "chromaRange",
        STIPPLE => "stipple",
        COLOR0 => "color0",
        COLOR1 => "color1",
        FBI_PIXELS_IN => "fbiPixelsIn",
        FBI_CHROMA_FAIL => "fbiChromaFail",
        FBI_ZFUNC_FAIL => "fbiZfuncFail",
        FBI_AFUNC_FAIL => "fbiAfuncFail",
        FBI_PIXELS_OUT => "fbiPixelsOut",
        FOG_TABLE..=FOG_TABLE_END => "fogTable",
        VIDEO_DIMENSIONS => "videoDimensions",
        FBI_INIT0 => "fbiInit0",
        FBI_INIT1 => "fbiInit1",
        FBI_INIT2 => "fbiInit2",
        FBI_INIT3 => "fbiInit3",
        FBI_INIT4 => "fbiInit4",
        H_SYNC => "hSync",
        V_SYNC => "vSync",
        CLUT_DATA => "clutData",
        DAC_DATA => "dacData",
        TEXTURE_MODE => "textureMode",
        T_LOD => "tLOD",
        T_DETAIL => "tDetail",
        TEX_BASE_ADDR => "texBaseAddr",
        TEX_BASE_ADDR_1 => "texBaseAddr_1",
        TEX_BASE_ADDR_2 => "texBaseAddr_2",
        TEX_BASE_ADDR_3_8 => "texBaseAddr_3_8",
        TREX_INIT0 => "trexInit0",
        TREX_INIT1 => "trexInit1",
        NCC_TABLE0..=NCC_TABLE1_END => "nccTable",
        _ => "reserved",
    }
}

/// Backing storage for the register file with access checking
///
/// The chip keeps command-relevant values (vertex parameters, mode words)
/// decoded elsewhere; this is the raw word array the host sees through
/// `register_read`, and the gatekeeper for `register_write`.
pub struct RegisterFile {
    words: [u32; REGISTER_COUNT],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            words: [0; REGISTER_COUNT],
        }
    }

    /// Attempt a host write; returns false (logged) if the register is not writable
    pub fn write(&mut self, regnum: u32, value: u32) -> bool {
        if !register_access(regnum).contains(RegisterAccess::WRITE) {
            log::warn!(
                "Rejected write to non-writable register {} (0x{:03X}) = 0x{:08X}",
                register_name(regnum),
                regnum * 4,
                value
            );
            return false;
        }
        self.words[(regnum as usize) & (REGISTER_COUNT - 1)] = value;
        true
    }

    /// Store a value without an access check (chip-internal updates, e.g. statistics)
    #[inline(always)]
    pub fn store(&mut self, regnum: u32, value: u32) {
        self.words[(regnum as usize) & (REGISTER_COUNT - 1)] = value;
    }

    /// Host read; non-readable registers return zero
    pub fn read(&self, regnum: u32) -> u32 {
        if !register_access(regnum).contains(RegisterAccess::READ) {
            log::trace!(
                "Read of non-readable register {} (0x{:03X}) returns 0",
                register_name(regnum),
                regnum * 4
            );
            return 0;
        }
        self.words[(regnum as usize) & (REGISTER_COUNT - 1)]
    }

    /// Raw value regardless of permissions (chip-internal)
    #[inline(always)]
    pub fn get(&self, regnum: u32) -> u32 {
        self.words[(regnum as usize) & (REGISTER_COUNT - 1)]
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
