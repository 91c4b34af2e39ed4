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

//! Shader variant cache
//!
//! Each distinct [`ReducedState`] maps to one synthesized program. The
//! fragment source is assembled from conditional blocks mirroring the pixel
//! pipeline's stages; bits that cannot affect shading are already masked
//! out of the key, so two register states that shade identically share a
//! program. Source assembly is deterministic: the same key always yields
//! byte-identical text.

use std::collections::HashMap;
use std::fmt::Write;

use crate::backend::device::{GraphicsDevice, ProgramId};
use crate::core::error::Result;
use crate::core::state::{alpha, cp, fbz, fog, tex, ReducedState};

/// Vertex stage, shared by every variant
pub const VERTEX_SOURCE: &str = "\
#version 130
uniform vec2 u_viewport;
in vec2 a_pos;
in float a_depth;
in vec4 a_color;
in vec4 a_st01;
in vec2 a_inv_w;
out vec4 v_color;
out vec4 v_st01;
out vec2 v_inv_w;
void main() {
    v_color = a_color;
    v_st01 = a_st01;
    v_inv_w = a_inv_w;
    vec2 ndc = (a_pos / u_viewport) * 2.0 - 1.0;
    gl_Position = vec4(ndc.x, -ndc.y, a_depth * 2.0 - 1.0, 1.0);
}
";

fn compare_expr(function: u32, value: &str, reference: &str) -> String {
    match function {
        0 => "false".to_string(),
        1 => format!("{value} < {reference}"),
        2 => format!("{value} == {reference}"),
        3 => format!("{value} <= {reference}"),
        4 => format!("{value} > {reference}"),
        5 => format!("{value} != {reference}"),
        6 => format!("{value} >= {reference}"),
        _ => "true".to_string(),
    }
}

/// Emit the texture combine block for one TMU
fn write_texture_combine(src: &mut String, unit: usize, mode: u32) {
    let sampler = format!("u_tex{unit}");
    let st = if unit == 0 { "v_st01.xy" } else { "v_st01.zw" };
    let inv_w = if unit == 0 { "v_inv_w.x" } else { "v_inv_w.y" };

    if tex::enable_perspective(mode) {
        let _ = writeln!(src, "    vec2 st{unit} = {st} / max({inv_w}, 1e-6);");
    } else {
        let _ = writeln!(src, "    vec2 st{unit} = {st};");
    }
    let _ = writeln!(src, "    vec4 c_local{unit} = texture2D({sampler}, st{unit});");

    // Combine against the downstream unit's output held in t_color
    let other = if tex::tc_zero_other(mode) { "vec3(0.0)" } else { "t_color.rgb" };
    let oa = if tex::tca_zero_other(mode) { "0.0" } else { "t_color.a" };
    let _ = writeln!(src, "    vec3 tc{unit} = {other};");
    let _ = writeln!(src, "    float ta{unit} = {oa};");
    if tex::tc_sub_clocal(mode) {
        let _ = writeln!(src, "    tc{unit} -= c_local{unit}.rgb;");
    }
    if tex::tca_sub_clocal(mode) {
        let _ = writeln!(src, "    ta{unit} -= c_local{unit}.a;");
    }

    let blend = match tex::tc_mselect(mode) {
        1 => format!("c_local{unit}.rgb"),
        2 => "vec3(t_color.a)".to_string(),
        3 => format!("vec3(c_local{unit}.a)"),
        // detail factor and LOD fraction collapse to constants here; the
        // software path is the reference for LOD-driven blending
        4 | 5 => "vec3(1.0)".to_string(),
        _ => "vec3(0.0)".to_string(),
    };
    let blend_a = match tex::tca_mselect(mode) {
        1 | 3 => format!("c_local{unit}.a"),
        2 => "t_color.a".to_string(),
        4 | 5 => "1.0".to_string(),
        _ => "0.0".to_string(),
    };
    let invert = if tex::tc_reverse_blend(mode) { "" } else { "vec3(1.0) - " };
    let invert_a = if tex::tca_reverse_blend(mode) { "" } else { "1.0 - " };
    let _ = writeln!(src, "    tc{unit} *= {invert}({blend});");
    let _ = writeln!(src, "    ta{unit} *= {invert_a}({blend_a});");

    match tex::tc_add_select(mode) {
        1 => {
            let _ = writeln!(src, "    tc{unit} += c_local{unit}.rgb;");
        }
        2 => {
            let _ = writeln!(src, "    tc{unit} += vec3(c_local{unit}.a);");
        }
        _ => {}
    }
    if tex::tca_add_select(mode) != 0 {
        let _ = writeln!(src, "    ta{unit} += c_local{unit}.a;");
    }

    let _ = writeln!(src, "    tc{unit} = clamp(tc{unit}, 0.0, 1.0);");
    let _ = writeln!(src, "    ta{unit} = clamp(ta{unit}, 0.0, 1.0);");
    if tex::tc_invert_output(mode) {
        let _ = writeln!(src, "    tc{unit} = vec3(1.0) - tc{unit};");
    }
    if tex::tca_invert_output(mode) {
        let _ = writeln!(src, "    ta{unit} = 1.0 - ta{unit};");
    }
    let _ = writeln!(src, "    t_color = vec4(tc{unit}, ta{unit});");
}

/// Assemble the fragment source for one shader variant
pub fn fragment_source(state: &ReducedState) -> String {
    let fbzcp = state.color_path;
    let mut src = String::with_capacity(2048);
    src.push_str("#version 130\n");
    src.push_str("uniform vec4 u_color0;\n");
    src.push_str("uniform vec4 u_color1;\n");
    src.push_str("uniform vec3 u_chroma_key;\n");
    src.push_str("uniform vec3 u_fog_color;\n");
    src.push_str("uniform float u_alpha_ref;\n");
    for unit in 0..2 {
        if state.texture_mode[unit] != 0 {
            let _ = writeln!(src, "uniform sampler2D u_tex{unit};");
        }
    }
    src.push_str("in vec4 v_color;\nin vec4 v_st01;\nin vec2 v_inv_w;\n");
    src.push_str("out vec4 frag;\n");
    src.push_str("void main() {\n");
    src.push_str("    vec4 t_color = vec4(0.0, 0.0, 0.0, 1.0);\n");

    // TMU chain, upstream first
    if cp::texture_enable(fbzcp) {
        for unit in (0..2).rev() {
            if state.texture_mode[unit] != 0 {
                write_texture_combine(&mut src, unit, state.texture_mode[unit]);
            }
        }
    }

    // Color path selects
    let other = match cp::rgb_select(fbzcp) {
        0 => "v_color.rgb",
        1 => "t_color.rgb",
        2 => "u_color1.rgb",
        _ => "vec3(0.0)",
    };
    let other_a = match cp::a_select(fbzcp) {
        0 => "v_color.a",
        1 => "t_color.a",
        2 => "u_color1.a",
        _ => "0.0",
    };
    let _ = writeln!(src, "    vec3 c_other = {other};");
    let _ = writeln!(src, "    float a_other = {other_a};");

    if fbz::enable_chromakey(state.fbz_mode) {
        src.push_str("    if (all(lessThan(abs(c_other - u_chroma_key), vec3(0.5 / 255.0)))) discard;\n");
    }
    if fbz::enable_alpha_mask(state.fbz_mode) {
        src.push_str("    if (mod(floor(a_other * 255.0 + 0.5), 2.0) < 0.5) discard;\n");
    }

    let local = if cp::local_select(fbzcp) { "u_color0.rgb" } else { "v_color.rgb" };
    if cp::local_select_override(fbzcp) {
        let _ = writeln!(
            src,
            "    vec3 c_local = (t_color.a >= 0.5) ? u_color0.rgb : v_color.rgb;"
        );
    } else {
        let _ = writeln!(src, "    vec3 c_local = {local};");
    }
    let local_a = match cp::a_local_select(fbzcp) {
        1 => "u_color0.a",
        // Z/W-derived alpha approximated by the interpolated depth
        2 | 3 => "v_color.a",
        _ => "v_color.a",
    };
    let _ = writeln!(src, "    float a_local = {local_a};");

    // Combine
    let zero = if cp::zero_other(fbzcp) { "vec3(0.0)" } else { "c_other" };
    let zero_a = if cp::a_zero_other(fbzcp) { "0.0" } else { "a_other" };
    let _ = writeln!(src, "    vec3 rgb = {zero};");
    let _ = writeln!(src, "    float a = {zero_a};");
    if cp::sub_clocal(fbzcp) {
        src.push_str("    rgb -= c_local;\n");
    }
    if cp::a_sub_clocal(fbzcp) {
        src.push_str("    a -= a_local;\n");
    }

    let blend = match cp::mselect(fbzcp) {
        1 => "c_local",
        2 => "vec3(a_other)",
        3 => "vec3(a_local)",
        4 => "vec3(t_color.a)",
        5 => "t_color.rgb",
        _ => "vec3(0.0)",
    };
    let blend_a = match cp::a_mselect(fbzcp) {
        1 | 3 => "a_local",
        2 => "a_other",
        4 => "t_color.a",
        _ => "0.0",
    };
    let invert = if cp::reverse_blend(fbzcp) { "" } else { "vec3(1.0) - " };
    let invert_a = if cp::a_reverse_blend(fbzcp) { "" } else { "1.0 - " };
    let _ = writeln!(src, "    rgb *= {invert}({blend});");
    let _ = writeln!(src, "    a *= {invert_a}({blend_a});");

    match cp::add_select(fbzcp) {
        1 => src.push_str("    rgb += c_local;\n"),
        2 => src.push_str("    rgb += vec3(a_local);\n"),
        _ => {}
    }
    if cp::a_add_select(fbzcp) != 0 {
        src.push_str("    a += a_local;\n");
    }
    src.push_str("    rgb = clamp(rgb, 0.0, 1.0);\n    a = clamp(a, 0.0, 1.0);\n");
    if cp::invert_output(fbzcp) {
        src.push_str("    rgb = vec3(1.0) - rgb;\n");
    }
    if cp::a_invert_output(fbzcp) {
        src.push_str("    a = 1.0 - a;\n");
    }

    // Alpha test
    if alpha::alphatest(state.alpha_mode) {
        let test = compare_expr(alpha::alphafunction(state.alpha_mode), "a", "u_alpha_ref");
        let _ = writeln!(src, "    if (!({test})) discard;");
    }

    // Fog
    if fog::enable_fog(state.fog_mode) {
        if fog::fog_constant(state.fog_mode) {
            src.push_str("    rgb = clamp(rgb + u_fog_color, 0.0, 1.0);\n");
        } else {
            // W-derived blend factor; the table interpolation stays on the
            // software path, the shader uses the analytic curve
            src.push_str("    float fogw = clamp(1.0 - v_inv_w.x, 0.0, 1.0);\n");
            if fog::fog_mult(state.fog_mode) {
                src.push_str("    rgb = u_fog_color * fogw;\n");
            } else {
                src.push_str("    rgb = mix(rgb, u_fog_color, fogw);\n");
            }
        }
    }

    src.push_str("    frag = vec4(rgb, a);\n}\n");
    src
}

/// Program cache keyed on the reduced pipeline state
pub struct ShaderCache {
    programs: HashMap<ReducedState, ProgramId>,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self { programs: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Fetch the program for a state, compiling it on first use
    pub fn program(
        &mut self,
        device: &mut dyn GraphicsDevice,
        state: &ReducedState,
    ) -> Result<ProgramId> {
        if let Some(&id) = self.programs.get(state) {
            return Ok(id);
        }
        let fragment = fragment_source(state);
        let id = device.compile_program(VERTEX_SOURCE, &fragment)?;
        log::debug!(
            "compiled shader variant #{} for cp={:08x} tex=[{:08x},{:08x}]",
            self.programs.len(),
            state.color_path,
            state.texture_mode[0],
            state.texture_mode[1]
        );
        self.programs.insert(*state, id);
        Ok(id)
    }
}

impl Default for ShaderCache {
    fn default() -> Self {
        Self::new()
    }
}
