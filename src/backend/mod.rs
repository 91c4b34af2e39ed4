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

//! Deferred GPU backend
//!
//! The alternative to the software rasterizer: triangles are translated
//! into commands against an abstract [`device::GraphicsDevice`] instead of
//! being shaded on the CPU. State words become synthesized shader variants
//! (cached per [`crate::core::state::ReducedState`]), TMU memory becomes
//! cached GPU textures validated by content hash, and the rendered frame
//! is mirrored back into chip memory so LFB reads stay coherent.

pub mod commands;
pub mod device;
pub mod executor;
pub mod readback;
pub mod shaders;
pub mod texcache;

pub use device::{DeviceCaps, DrawUniforms, GpuVertex, GraphicsDevice, ProgramId, Region, TextureId};
pub use executor::Executor;
