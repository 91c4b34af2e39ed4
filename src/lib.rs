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

//! vgrx: a behavioral model of a 3dfx Voodoo Graphics class rasterizer chip
//!
//! This crate models a 1990s two-TMU triangle/pixel pipeline driven by
//! memory-mapped register writes, with two interchangeable execution backends:
//!
//! - a multi-threaded fixed-point software rasterizer that reproduces the
//!   chip's per-pixel rounding behavior exactly, and
//! - a deferred GPU command buffer that translates per-triangle chip state
//!   into synthesized shader programs behind an abstract graphics device.
//!
//! # Architecture
//!
//! - [`core`](crate::core): the chip model itself (register file, frame buffer
//!   interface, texture units, pixel pipeline, scan converter, worker pool)
//! - [`backend`]: the deferred GPU path (command buffer, shader variant cache,
//!   texture content cache, readback/mirroring)
//!
//! # Example
//!
//! ```
//! use vgrx::core::chip::{Voodoo, VoodooConfig};
//! use vgrx::core::registers::regs;
//!
//! let mut chip = Voodoo::new(VoodooConfig::default());
//! chip.register_write(regs::FBZ_MODE * 4, 0x0000_0200);
//! ```
//!
//! # Error Handling
//!
//! All fallible operations return [`Result<T>`](crate::core::error::Result)
//! which is an alias for `Result<T, ChipError>`.

pub mod backend;
pub mod core;

// Re-export commonly used types
pub use crate::core::error::{ChipError, Result};
