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

//! Software rasterizer throughput benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use vgrx::core::chip::{Voodoo, VoodooConfig};
use vgrx::core::registers::regs;

fn chip(workers: usize) -> Voodoo {
    Voodoo::new(VoodooConfig {
        width: 640,
        height: 480,
        fb_size: 4 << 20,
        tex_size: 1 << 16,
        tmu_count: 0,
        workers,
    })
}

/// Latch a flat right triangle with legs of `size` pixels
fn latch_triangle(chip: &mut Voodoo, size: i32) {
    chip.register_write(regs::VERTEX_AX * 4, 0);
    chip.register_write(regs::VERTEX_AY * 4, 0);
    chip.register_write(regs::VERTEX_BX * 4, (size << 4) as u32);
    chip.register_write(regs::VERTEX_BY * 4, 0);
    chip.register_write(regs::VERTEX_CX * 4, 0);
    chip.register_write(regs::VERTEX_CY * 4, (size << 4) as u32);
    chip.register_write(regs::START_R * 4, 0xc0 << 12);
    chip.register_write(regs::START_G * 4, 0x80 << 12);
    chip.register_write(regs::START_B * 4, 0x40 << 12);
    chip.register_write(regs::START_A * 4, 0xff << 12);
}

fn bench_flat_triangles(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_triangle");
    for size in [32, 128, 400] {
        let mut chip = chip(1);
        chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        latch_triangle(&mut chip, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| chip.register_write(regs::TRIANGLE_CMD * 4, 0));
        });
    }
    group.finish();
}

fn bench_depth_tested_triangle(c: &mut Criterion) {
    let mut chip = chip(1);
    // depth buffering on, function LESS, rgb+aux writes
    chip.register_write(
        regs::FBZ_MODE * 4,
        (1 << 9) | (1 << 10) | (1 << 4) | (4 << 5),
    );
    latch_triangle(&mut chip, 256);
    chip.register_write(regs::START_Z * 4, 1000 << 12);
    c.bench_function("depth_tested_triangle_256", |b| {
        b.iter(|| chip.register_write(regs::TRIANGLE_CMD * 4, 0));
    });
}

fn bench_worker_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_scaling_400");
    for workers in [1usize, 2, 4] {
        let mut chip = chip(workers);
        chip.register_write(regs::FBZ_MODE * 4, 1 << 9);
        latch_triangle(&mut chip, 400);
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| chip.register_write(regs::TRIANGLE_CMD * 4, 0));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_flat_triangles,
    bench_depth_tested_triangle,
    bench_worker_scaling
);
criterion_main!(benches);
