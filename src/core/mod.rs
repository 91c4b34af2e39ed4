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

//! Core chip model
//!
//! Everything the chip itself owns: the register file, the decoded pipeline
//! state, the frame buffer interface (FBI), the texture mapping units (TMU),
//! the fixed-point per-pixel pipeline, the scan converter and its worker pool,
//! and the chip instance that ties them together.

pub mod chip;
pub mod error;
pub mod fbi;
pub mod pipeline;
pub mod raster;
pub mod registers;
pub mod state;
pub mod tables;
pub mod tmu;

pub use chip::{Voodoo, VoodooConfig};
pub use error::{ChipError, Result};
pub use state::PipelineState;
