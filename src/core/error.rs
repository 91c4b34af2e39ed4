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

//! Error types for the chip model
//!
//! Most of the chip is deliberately infallible: hardware masks out-of-range
//! addresses and ignores writes to read-only registers instead of faulting.
//! Errors here cover the host-side seams: device/driver failures in the GPU
//! backend and invalid construction parameters.

use thiserror::Error;

/// Errors produced by the chip model and its GPU backend
#[derive(Error, Debug)]
pub enum ChipError {
    /// A construction parameter was invalid (e.g. a non-power-of-two memory size)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The graphics device rejected a shader program
    #[error("Shader compilation failed: {0}")]
    ShaderCompile(String),

    /// The graphics device could not allocate a resource
    #[error("Device allocation failed: {0}")]
    DeviceAlloc(String),

    /// A pixel readback from the graphics device failed
    #[error("Readback failed: {0}")]
    Readback(String),

    /// The register trace fed to the CLI driver was malformed
    #[error("Trace parse error at line {line}: {message}")]
    TraceParse {
        /// 1-based line number in the trace file
        line: usize,
        /// What went wrong
        message: String,
    },

    /// I/O error (trace loading, frame dumping)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for chip operations
pub type Result<T> = std::result::Result<T, ChipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChipError::InvalidConfig("texture memory must be a power of two".into());
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_trace_parse_error_display() {
        let err = ChipError::TraceParse {
            line: 42,
            message: "expected hex offset".into(),
        };
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("expected hex offset"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ChipError = io.into();
        assert!(matches!(err, ChipError::Io(_)));
    }
}
