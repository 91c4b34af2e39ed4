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

//! Deferred command buffer
//!
//! Draws accumulate append-only between flushes. Consecutive triangles
//! under identical state merge into one draw so typical scenes collapse to
//! a few commands. A host that renders without ever presenting would grow
//! the buffer unboundedly, so a never-flushed backlog past a high-water
//! mark discards its oldest commands; a flush then trims the executed
//! prefix and rebases the surviving vertex ranges.

use crate::backend::device::{DrawUniforms, GpuVertex, Region, TextureId};
use crate::core::state::ReducedState;

/// Backlog size (commands) that triggers the never-flushed discard
const DISCARD_WATERMARK: usize = 4096;

/// Never-flushed backlogs may grow to this multiple of the watermark
const DISCARD_RATIO: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    Draw {
        state: ReducedState,
        textures: [Option<TextureId>; 2],
        /// Full mode words for the fixed-function side (depth, blend,
        /// masks); the shader key deliberately masks these out
        fbz_mode: u32,
        alpha_mode: u32,
        uniforms: DrawUniforms,
        first_vertex: u32,
        vertex_count: u32,
    },
    /// LFB pixels written past the pixel pipeline, drawn as raw points
    RawPixels {
        first_vertex: u32,
        vertex_count: u32,
    },
    /// LFB pixels routed through the blender
    BlendedPixels {
        alpha_mode: u32,
        first_vertex: u32,
        vertex_count: u32,
    },
    FastFill {
        region: Region,
        color: Option<[f32; 4]>,
        depth: Option<f32>,
    },
    SetScissor {
        region: Option<Region>,
    },
}

/// Vertex range referenced by a command, if it draws geometry
fn vertex_range(command: &GpuCommand) -> Option<(u32, u32)> {
    match command {
        GpuCommand::Draw { first_vertex, vertex_count, .. }
        | GpuCommand::RawPixels { first_vertex, vertex_count }
        | GpuCommand::BlendedPixels { first_vertex, vertex_count, .. } => {
            Some((*first_vertex, *vertex_count))
        }
        _ => None,
    }
}

fn first_vertex_mut(command: &mut GpuCommand) -> Option<&mut u32> {
    match command {
        GpuCommand::Draw { first_vertex, .. }
        | GpuCommand::RawPixels { first_vertex, .. }
        | GpuCommand::BlendedPixels { first_vertex, .. } => Some(first_vertex),
        _ => None,
    }
}

pub struct CommandBuffer {
    commands: Vec<GpuCommand>,
    vertices: Vec<GpuVertex>,
    flushed_commands: usize,
    flushed_vertices: u32,
    discarded: u64,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            vertices: Vec::new(),
            flushed_commands: 0,
            flushed_vertices: 0,
            discarded: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn vertices(&self) -> &[GpuVertex] {
        &self.vertices
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Commands recorded but not yet executed
    pub fn unflushed(&self) -> &[GpuCommand] {
        &self.commands[self.flushed_commands..]
    }

    /// Append a triangle, merging into the previous draw when the state,
    /// textures and fixed-function words all match
    pub fn push_triangle(
        &mut self,
        state: ReducedState,
        textures: [Option<TextureId>; 2],
        fbz_mode: u32,
        alpha_mode: u32,
        uniforms: DrawUniforms,
        verts: &[GpuVertex; 3],
    ) {
        let first = self.vertices.len() as u32;
        self.vertices.extend_from_slice(verts);

        if let Some(GpuCommand::Draw {
            state: prev_state,
            textures: prev_textures,
            fbz_mode: prev_fbz,
            alpha_mode: prev_alpha,
            uniforms: prev_uniforms,
            first_vertex,
            vertex_count,
        }) = self.commands.last_mut()
        {
            if *prev_state == state
                && *prev_textures == textures
                && *prev_fbz == fbz_mode
                && *prev_alpha == alpha_mode
                && *prev_uniforms == uniforms
                && *first_vertex + *vertex_count == first
            {
                *vertex_count += 3;
                return;
            }
        }

        self.commands.push(GpuCommand::Draw {
            state,
            textures,
            fbz_mode,
            alpha_mode,
            uniforms,
            first_vertex: first,
            vertex_count: 3,
        });
        self.maybe_discard_backlog();
    }

    /// Append one LFB pixel, merging into a preceding run of the same kind
    ///
    /// `alpha_mode` is present when the write runs through the blender.
    pub fn push_pixel(&mut self, alpha_mode: Option<u32>, vert: GpuVertex) {
        let first = self.vertices.len() as u32;
        self.vertices.push(vert);

        match self.commands.last_mut() {
            Some(GpuCommand::RawPixels { first_vertex, vertex_count })
                if alpha_mode.is_none() && *first_vertex + *vertex_count == first =>
            {
                *vertex_count += 1;
                return;
            }
            Some(GpuCommand::BlendedPixels { alpha_mode: prev, first_vertex, vertex_count })
                if alpha_mode == Some(*prev) && *first_vertex + *vertex_count == first =>
            {
                *vertex_count += 1;
                return;
            }
            _ => {}
        }

        self.commands.push(match alpha_mode {
            None => GpuCommand::RawPixels { first_vertex: first, vertex_count: 1 },
            Some(alpha_mode) => {
                GpuCommand::BlendedPixels { alpha_mode, first_vertex: first, vertex_count: 1 }
            }
        });
        self.maybe_discard_backlog();
    }

    pub fn push_fastfill(&mut self, region: Region, color: Option<[f32; 4]>, depth: Option<f32>) {
        self.commands.push(GpuCommand::FastFill { region, color, depth });
        self.maybe_discard_backlog();
    }

    pub fn push_scissor(&mut self, region: Option<Region>) {
        self.commands.push(GpuCommand::SetScissor { region });
        self.maybe_discard_backlog();
    }

    /// Record that the first `count` unflushed commands executed
    ///
    /// A flush that fails partway records only what ran; the remainder
    /// stays for the next attempt.
    pub fn mark_flushed(&mut self, count: usize) {
        let end = (self.flushed_commands + count).min(self.commands.len());
        for command in &self.commands[self.flushed_commands..end] {
            if let Some((first, count)) = vertex_range(command) {
                self.flushed_vertices = self.flushed_vertices.max(first + count);
            }
        }
        self.flushed_commands = end;
    }

    /// Drop the flushed prefix and rebase the surviving vertex ranges
    pub fn trim_flushed(&mut self) {
        if self.flushed_commands == 0 {
            return;
        }
        self.commands.drain(..self.flushed_commands);
        self.vertices.drain(..self.flushed_vertices as usize);
        let base = self.flushed_vertices;
        for command in &mut self.commands {
            if let Some(first_vertex) = first_vertex_mut(command) {
                *first_vertex -= base;
            }
        }
        self.flushed_commands = 0;
        self.flushed_vertices = 0;
    }

    /// Discard the oldest commands of a backlog that has never flushed
    fn maybe_discard_backlog(&mut self) {
        if self.flushed_commands != 0 || self.commands.len() < DISCARD_WATERMARK * DISCARD_RATIO {
            return;
        }
        let drop_count = self.commands.len() - DISCARD_WATERMARK;

        // First vertex still referenced by a kept command
        let keep_base = self.commands[drop_count..]
            .iter()
            .find_map(|c| vertex_range(c).map(|(first, _)| first))
            .unwrap_or(self.vertices.len() as u32);

        self.commands.drain(..drop_count);
        self.vertices.drain(..keep_base as usize);
        for command in &mut self.commands {
            if let Some(first_vertex) = first_vertex_mut(command) {
                *first_vertex -= keep_base;
            }
        }
        self.discarded += drop_count as u64;
        log::warn!(
            "command backlog never flushed: discarded {drop_count} oldest commands ({} total)",
            self.discarded
        );
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, y: f32) -> GpuVertex {
        GpuVertex {
            x,
            y,
            depth: 0.0,
            rgba: [1.0; 4],
            st: [[0.0; 2]; 2],
            inv_w: [1.0; 2],
        }
    }

    fn tri(seq: u32) -> [GpuVertex; 3] {
        let f = seq as f32;
        [vertex(f, 0.0), vertex(f + 1.0, 0.0), vertex(f, 1.0)]
    }

    fn push_plain(buf: &mut CommandBuffer, seq: u32, fbz_mode: u32) {
        buf.push_triangle(
            ReducedState::default(),
            [None, None],
            fbz_mode,
            0,
            DrawUniforms::default(),
            &tri(seq),
        );
    }

    #[test]
    fn test_identical_draws_merge() {
        let mut buf = CommandBuffer::new();
        for i in 0..5 {
            push_plain(&mut buf, i, 0x0200);
        }
        assert_eq!(buf.len(), 1);
        match &buf.unflushed()[0] {
            GpuCommand::Draw { vertex_count, .. } => assert_eq!(*vertex_count, 15),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_state_change_breaks_merge() {
        let mut buf = CommandBuffer::new();
        push_plain(&mut buf, 0, 0x0200);
        push_plain(&mut buf, 1, 0x0210);
        push_plain(&mut buf, 2, 0x0200);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_fastfill_breaks_merge() {
        let mut buf = CommandBuffer::new();
        push_plain(&mut buf, 0, 0x0200);
        buf.push_fastfill(
            Region { left: 0, top: 0, right: 64, bottom: 64 },
            Some([0.0; 4]),
            None,
        );
        push_plain(&mut buf, 1, 0x0200);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_trim_rebases_vertices() {
        let mut buf = CommandBuffer::new();
        push_plain(&mut buf, 0, 0x0200);
        push_plain(&mut buf, 1, 0x0210);
        buf.mark_flushed(1);
        buf.trim_flushed();
        assert_eq!(buf.len(), 1);
        match &buf.unflushed()[0] {
            GpuCommand::Draw { first_vertex, vertex_count, .. } => {
                assert_eq!(*first_vertex, 0);
                assert_eq!(*vertex_count, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(buf.vertices().len(), 3);
    }

    #[test]
    fn test_partial_flush_resumes() {
        let mut buf = CommandBuffer::new();
        push_plain(&mut buf, 0, 0x0200);
        push_plain(&mut buf, 1, 0x0210);
        push_plain(&mut buf, 2, 0x0220);
        buf.mark_flushed(2);
        assert_eq!(buf.unflushed().len(), 1);
        buf.mark_flushed(1);
        assert!(buf.unflushed().is_empty());
    }

    #[test]
    fn test_pixel_runs_merge_by_kind() {
        let mut buf = CommandBuffer::new();
        buf.push_pixel(None, vertex(0.0, 0.0));
        buf.push_pixel(None, vertex(1.0, 0.0));
        buf.push_pixel(Some(0x11), vertex(2.0, 0.0));
        buf.push_pixel(Some(0x11), vertex(3.0, 0.0));
        buf.push_pixel(Some(0x13), vertex(4.0, 0.0));
        assert_eq!(buf.len(), 3);
        match &buf.unflushed()[0] {
            GpuCommand::RawPixels { vertex_count, .. } => assert_eq!(*vertex_count, 2),
            other => panic!("unexpected command {other:?}"),
        }
        match &buf.unflushed()[1] {
            GpuCommand::BlendedPixels { alpha_mode, vertex_count, .. } => {
                assert_eq!(*alpha_mode, 0x11);
                assert_eq!(*vertex_count, 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_trim_rebases_pixel_ranges() {
        let mut buf = CommandBuffer::new();
        push_plain(&mut buf, 0, 0x0200);
        buf.push_pixel(None, vertex(5.0, 5.0));
        buf.mark_flushed(1);
        buf.trim_flushed();
        assert_eq!(buf.len(), 1);
        match &buf.unflushed()[0] {
            GpuCommand::RawPixels { first_vertex, vertex_count } => {
                assert_eq!(*first_vertex, 0);
                assert_eq!(*vertex_count, 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_backlog_discard_drops_oldest() {
        let mut buf = CommandBuffer::new();
        // alternate state every draw so nothing merges
        for i in 0..(DISCARD_WATERMARK * DISCARD_RATIO) as u32 {
            push_plain(&mut buf, i, 0x0200 | (i & 1) << 8);
        }
        assert_eq!(buf.len(), DISCARD_WATERMARK);
        assert!(buf.discarded() > 0);

        // every surviving draw's vertex range must stay in bounds
        for command in buf.unflushed() {
            if let GpuCommand::Draw { first_vertex, vertex_count, .. } = command {
                assert!(((first_vertex + vertex_count) as usize) <= buf.vertices().len());
            }
        }
    }

    #[test]
    fn test_flushed_buffers_never_discard() {
        let mut buf = CommandBuffer::new();
        push_plain(&mut buf, 0, 0x0200);
        buf.mark_flushed(1);
        for i in 0..(DISCARD_WATERMARK * DISCARD_RATIO) as u32 {
            push_plain(&mut buf, i, 0x0200 | (i & 1) << 8);
        }
        assert_eq!(buf.discarded(), 0);
    }
}
