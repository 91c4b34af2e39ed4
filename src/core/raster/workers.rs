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

//! Rasterization worker pool
//!
//! A fixed set of persistent threads plus the calling thread split each
//! triangle into contiguous pixel-ordinal ranges. Small triangles skip the
//! pool entirely; the dispatch overhead costs more than the pixels.
//!
//! Workers park on a per-worker condvar between triangles. The dispatching
//! thread rasterizes the final partition itself, then busy-polls the done
//! flags: the wait is bounded by one partition's work, so a short spin
//! beats a sleep/wake round trip.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::core::pipeline::{FrameTarget, PixelRegs, PixelStats};
use crate::core::raster::{rasterize_range, TriangleSetup};
use crate::core::tables::RecipLogTable;
use crate::core::tmu::TmuRaster;

/// Triangles below this pixel count render synchronously on the caller
const SYNC_PIXEL_THRESHOLD: u32 = 350;

/// One partition of a triangle dispatch
struct Job {
    setup: Arc<TriangleSetup>,
    regs: PixelRegs,
    target: FrameTarget,
    tables: Arc<RecipLogTable>,
    tmus: Vec<TmuRaster>,
    lod_base: [i32; 2],
    range: Range<u32>,
}

// SAFETY: the raw pointers inside FrameTarget and TmuRaster are valid for
// the whole dispatch (the coordinator joins all partitions before the chip
// mutates either arena) and the ranges are disjoint.
unsafe impl Send for Job {}

struct WorkerShared {
    slot: Mutex<Option<Job>>,
    wake: Condvar,
    done: AtomicBool,
    result: Mutex<PixelStats>,
    shutdown: AtomicBool,
}

struct Worker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

/// Persistent rasterization thread pool
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `count` worker threads (0 means caller-only rendering)
    pub fn new(count: usize) -> Self {
        let workers = (0..count)
            .map(|id| {
                let shared = Arc::new(WorkerShared {
                    slot: Mutex::new(None),
                    wake: Condvar::new(),
                    done: AtomicBool::new(true),
                    result: Mutex::new(PixelStats::default()),
                    shutdown: AtomicBool::new(false),
                });
                let thread_shared = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name(format!("vgrx-raster-{id}"))
                    .spawn(move || worker_loop(&thread_shared))
                    .ok();
                if handle.is_none() {
                    log::warn!("failed to spawn raster worker {id}, continuing without it");
                }
                Worker { shared, handle }
            })
            .filter(|w| w.handle.is_some())
            .collect();
        Self { workers }
    }

    /// Number of partitions a dispatch is cut into (workers + caller)
    pub fn partitions(&self) -> usize {
        self.workers.len() + 1
    }

    /// Rasterize one set-up triangle, splitting across the pool
    ///
    /// Returns the merged pixel statistics. The target and TMU snapshots
    /// must stay valid until this returns; the internal barrier guarantees
    /// no worker touches them afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &self,
        setup: Arc<TriangleSetup>,
        regs: &PixelRegs,
        target: FrameTarget,
        tables: &Arc<RecipLogTable>,
        tmus: &[TmuRaster],
        lod_base: [i32; 2],
    ) -> PixelStats {
        let total = setup.total_pixels;
        let mut stats = PixelStats::default();

        if self.workers.is_empty() || total < SYNC_PIXEL_THRESHOLD {
            rasterize_range(
                &setup, regs, &target, tables, tmus, &lod_base, 0..total, &mut stats,
            );
            return stats;
        }

        // Contiguous pixel-proportional partitions; the caller takes the
        // last one
        let parts = self.partitions() as u32;
        let bound = |i: u32| -> u32 { (u64::from(total) * u64::from(i) / u64::from(parts)) as u32 };

        for (i, worker) in self.workers.iter().enumerate() {
            let range = bound(i as u32)..bound(i as u32 + 1);
            worker.shared.done.store(false, Ordering::Release);
            let job = Job {
                setup: Arc::clone(&setup),
                regs: *regs,
                target,
                tables: Arc::clone(tables),
                tmus: tmus.to_vec(),
                lod_base,
                range,
            };
            *lock_recover(&worker.shared.slot) = Some(job);
            worker.shared.wake.notify_one();
        }

        rasterize_range(
            &setup,
            regs,
            &target,
            tables,
            tmus,
            &lod_base,
            bound(parts - 1)..total,
            &mut stats,
        );

        // Barrier: spin until every worker has published its result
        for worker in &self.workers {
            while !worker.shared.done.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            stats.merge(&lock_recover(&worker.shared.result));
        }
        stats
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.shared.shutdown.store(true, Ordering::Release);
            worker.shared.wake.notify_one();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Lock a mutex, recovering from poisoning
///
/// A panicking worker would otherwise wedge every later dispatch; the
/// guarded data (a job slot or a stats block) is always fully overwritten
/// before the next read.
fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn worker_loop(shared: &WorkerShared) {
    loop {
        let job = {
            let mut slot = lock_recover(&shared.slot);
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = slot.take() {
                    break job;
                }
                slot = match shared.wake.wait(slot) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };

        let mut stats = PixelStats::default();
        rasterize_range(
            &job.setup,
            &job.regs,
            &job.target,
            &job.tables,
            &job.tmus,
            &job.lod_base,
            job.range.clone(),
            &mut stats,
        );
        *lock_recover(&shared.result) = stats;
        shared.done.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fbi::ClipRect;
    use crate::core::raster::TriangleParams;
    use proptest::prelude::*;

    fn triangle(ax: i32, ay: i32, bx: i32, by: i32, cx: i32, cy: i32) -> TriangleParams {
        TriangleParams {
            ax: ax << 4,
            ay: ay << 4,
            bx: bx << 4,
            by: by << 4,
            cx: cx << 4,
            cy: cy << 4,
            start_r: 0x80 << 12,
            start_g: 0x40 << 12,
            start_b: 0x20 << 12,
            start_a: 0xff << 12,
            drdx: 3 << 10,
            dgdy: 2 << 10,
            ..TriangleParams::default()
        }
    }

    fn render(workers: usize, params: TriangleParams) -> (Vec<u16>, PixelStats) {
        let clip = ClipRect { left: 0, right: 128, top: 0, bottom: 128 };
        let setup = match TriangleSetup::new(params, 0, &clip, None) {
            Some(s) => Arc::new(s),
            None => return (vec![0; 1 << 15], PixelStats::default()),
        };
        let mut ram = vec![0u16; 1 << 15];
        let target = FrameTarget {
            ram: ram.as_mut_ptr(),
            mask: (1 << 15) - 1,
            row_pixels: 128,
            dest_base: 0,
            aux_base: u32::MAX,
        };
        let regs = PixelRegs { fbz_mode: 1 << 9, ..PixelRegs::default() };
        let tables = Arc::new(RecipLogTable::new());
        let pool = WorkerPool::new(workers);
        let stats = pool.dispatch(setup, &regs, target, &tables, &[], [0; 2]);
        (ram, stats)
    }

    #[test]
    fn test_worker_counts_agree() {
        // Big enough to cross the synchronous threshold
        let params = triangle(0, 0, 120, 0, 0, 120);
        let (ram0, stats0) = render(0, params);
        let (ram1, stats1) = render(1, params);
        let (ram3, stats3) = render(3, params);
        assert_eq!(ram0, ram1);
        assert_eq!(ram0, ram3);
        assert_eq!(stats0, stats1);
        assert_eq!(stats0, stats3);
    }

    #[test]
    fn test_small_triangle_renders_synchronously() {
        // Under the threshold the pool path and the sync path must agree
        let params = triangle(0, 0, 10, 0, 0, 10);
        let (ram0, stats0) = render(0, params);
        let (ram2, stats2) = render(2, params);
        assert_eq!(ram0, ram2);
        assert_eq!(stats0, stats2);
        assert!(stats0.pixels_in < u64::from(SYNC_PIXEL_THRESHOLD));
    }

    #[test]
    fn test_rotating_stipple_is_partition_independent() {
        let mut params = triangle(0, 0, 100, 0, 0, 100);
        params.start_r = 0xff << 12;
        let regs = PixelRegs {
            fbz_mode: (1 << 9) | (1 << 2), // stipple rotate mode
            stipple: 0xdead_beef,
            ..PixelRegs::default()
        };
        let clip = ClipRect { left: 0, right: 128, top: 0, bottom: 128 };
        let setup = Arc::new(TriangleSetup::new(params, 0, &clip, None).unwrap());
        let tables = Arc::new(RecipLogTable::new());

        let mut frames = Vec::new();
        for workers in [0usize, 2, 5] {
            let mut ram = vec![0u16; 1 << 15];
            let target = FrameTarget {
                ram: ram.as_mut_ptr(),
                mask: (1 << 15) - 1,
                row_pixels: 128,
                dest_base: 0,
                aux_base: u32::MAX,
            };
            let pool = WorkerPool::new(workers);
            pool.dispatch(Arc::clone(&setup), &regs, target, &tables, &[], [0; 2]);
            frames.push(ram);
        }
        assert_eq!(frames[0], frames[1]);
        assert_eq!(frames[0], frames[2]);
    }

    #[test]
    fn test_pool_survives_many_dispatches() {
        let pool = WorkerPool::new(2);
        let clip = ClipRect { left: 0, right: 128, top: 0, bottom: 128 };
        let tables = Arc::new(RecipLogTable::new());
        let regs = PixelRegs { fbz_mode: 1 << 9, ..PixelRegs::default() };
        let mut ram = vec![0u16; 1 << 15];
        for i in 0..50 {
            let params = triangle(0, 0, 60 + i, 0, 0, 60 + i);
            let setup = Arc::new(TriangleSetup::new(params, 0, &clip, None).unwrap());
            let target = FrameTarget {
                ram: ram.as_mut_ptr(),
                mask: (1 << 15) - 1,
                row_pixels: 128,
                dest_base: 0,
                aux_base: u32::MAX,
            };
            let stats = pool.dispatch(setup, &regs, target, &tables, &[], [0; 2]);
            assert!(stats.pixels_out > 0);
        }
    }

    proptest! {
        #[test]
        fn prop_partitioning_never_changes_output(
            bx in 1i32..120,
            by in 0i32..120,
            cx in 0i32..120,
            cy in 1i32..120,
        ) {
            let params = triangle(0, 0, bx, by, cx, cy);
            let (ram1, stats1) = render(1, params);
            let (ram3, stats3) = render(3, params);
            prop_assert_eq!(ram1, ram3);
            prop_assert_eq!(stats1, stats3);
        }
    }
}
