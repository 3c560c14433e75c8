//! Wave-front parallel back-end for the alpha/beta sweeps.
//!
//! The time axis is cut into warp-sized tiles. One task per lattice row:
//! the row's worker completes tiles left-to-right (alpha) or right-to-left
//! (beta) and publishes progress through the workspace's per-row atomic
//! counters: `fetch_add(1, Release)` per finished tile, Acquire spins on
//! the predecessor row's counter before a tile whose cells need it. Rows of
//! every (sequence, pass) pair are enqueued in topological order and taken
//! round-robin by a bounded pool of scoped workers, each draining its own
//! share in order; the earliest incomplete row therefore always has its
//! dependencies met and its owner on it, so the spin discipline cannot
//! deadlock. Alpha and beta passes of one sequence touch disjoint arenas
//! and run concurrently.
//!
//! Per cell, the arithmetic matches the sequential sweeps expression for
//! expression, so the two back-ends produce bit-identical lattices.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::TransducerError;
use crate::math::lse;
use crate::options::Options;
use crate::restrictions::AlignmentBand;
use crate::types::{DenseBatch, LogProbPair, SparseBatch};

use super::seq_dims;
use super::sparse::SparseLayout;

/// Tile width along the time axis; the warp size the counter protocol was
/// designed around.
pub(crate) const TILE: usize = 32;

const NEG_INF: f32 = f32::NEG_INFINITY;

/// Shared mutable lattice arena. Every row is written by exactly one worker;
/// cross-row reads happen only after the producer's counter increment for
/// the covering tile (Release) has been observed (Acquire), so no cell is
/// read while it may still be written.
struct SharedGrid {
    ptr: *mut f32,
    len: usize,
}

unsafe impl Send for SharedGrid {}
unsafe impl Sync for SharedGrid {}

impl SharedGrid {
    fn new(buf: &mut [f32]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    #[inline(always)]
    unsafe fn read(&self, idx: usize) -> f32 {
        debug_assert!(idx < self.len);
        *self.ptr.add(idx)
    }

    #[inline(always)]
    unsafe fn write(&self, idx: usize, v: f32) {
        debug_assert!(idx < self.len);
        *self.ptr.add(idx) = v;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Alpha,
    Beta,
}

#[derive(Debug, Clone, Copy)]
struct RowTask {
    n: usize,
    pass: Pass,
    u: usize,
}

/// Producer coverage after `c` published tiles, forward direction: tiles of
/// a row spanning `[start, end]` cover `t < start + c·TILE`. Returns how
/// many tiles must be published before every needed `t <= t_hi` is final.
#[inline]
fn needed_tiles_fwd(start: i32, end: i32, t_hi: i32) -> u32 {
    let hi = t_hi.min(end);
    if hi < start {
        0
    } else {
        (hi - start) as u32 / TILE as u32 + 1
    }
}

/// Backward direction: published tiles cover `t > end - c·TILE`.
#[inline]
fn needed_tiles_bwd(start: i32, end: i32, t_lo: i32) -> u32 {
    let lo = t_lo.max(start);
    if lo > end {
        0
    } else {
        (end - lo) as u32 / TILE as u32 + 1
    }
}

/// Spin until `counter` reaches `needed`; bails out when another worker has
/// already failed. Returns whether the wait completed.
#[inline]
fn wait_for(counter: &AtomicU32, needed: u32, failed: &AtomicBool) -> bool {
    if needed == 0 {
        return true;
    }
    let mut spins = 0u32;
    while counter.load(Ordering::Acquire) < needed {
        if failed.load(Ordering::Relaxed) {
            return false;
        }
        spins = spins.wrapping_add(1);
        if spins & 63 == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
    true
}

fn reset_counters(counters: &[AtomicU32]) {
    for c in counters {
        c.store(0, Ordering::Relaxed);
    }
}

/// Drain `tasks` with up to `workers` scoped threads, worker `k` taking
/// items `k, k + workers, …` in order. A panicking task poisons the run.
fn run_tasks(
    workers: usize,
    tasks: &[RowTask],
    failed: &AtomicBool,
    process: impl Fn(RowTask) + Sync,
) -> Result<(), TransducerError> {
    let workers = workers.min(tasks.len());
    if workers <= 1 {
        for &task in tasks {
            process(task);
        }
        return Ok(());
    }

    let process = &process;
    let mut outcome = Ok(());
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|k| {
                scope.spawn(move || {
                    for i in (k..tasks.len()).step_by(workers) {
                        if failed.load(Ordering::Relaxed) {
                            return Err("cancelled after another worker failed".to_string());
                        }
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(|| process(tasks[i])))
                        {
                            failed.store(true, Ordering::Relaxed);
                            return Err(panic_message(payload));
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            let joined = match handle.join() {
                Ok(result) => result,
                Err(payload) => Err(panic_message(payload)),
            };
            if outcome.is_ok() {
                if let Err(message) = joined {
                    outcome = Err(TransducerError::AlphasBetasCosts { message });
                }
            }
        }
    });
    outcome
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Dense (and band-restricted) wave-front over the whole batch.
pub(crate) fn alphas_betas(
    options: &Options,
    lp: &[LogProbPair],
    batch: &DenseBatch<'_>,
    mut alphas: Option<&mut [f32]>,
    mut betas: Option<&mut [f32]>,
    alpha_counters: &[AtomicU32],
    beta_counters: &[AtomicU32],
) -> Result<(), TransducerError> {
    let stride = options.max_tgt_len;
    let grid = options.max_src_len * stride;

    reset_counters(alpha_counters);
    reset_counters(beta_counters);

    // The band-restricted recurrences only overwrite reachable cells.
    if batch.wp_ends.is_some() {
        for n in 0..options.hypo_count() {
            let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
            for lattice in [alphas.as_deref_mut(), betas.as_deref_mut()].into_iter().flatten() {
                for t in 0..dims.t_len {
                    lattice[n * grid + t * stride..n * grid + t * stride + dims.u_len]
                        .fill(NEG_INF);
                }
            }
        }
    }

    let mut tasks = Vec::new();
    for n in 0..options.hypo_count() {
        let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
        if dims.t_len == 0 {
            continue;
        }
        if alphas.is_some() {
            for u in 0..dims.u_len {
                tasks.push(RowTask { n, pass: Pass::Alpha, u });
            }
        }
        if betas.is_some() {
            for u in (0..dims.u_len).rev() {
                tasks.push(RowTask { n, pass: Pass::Beta, u });
            }
        }
    }

    let alpha_grid = alphas.map(|a| SharedGrid::new(a));
    let beta_grid = betas.map(|b| SharedGrid::new(b));
    let failed = AtomicBool::new(false);

    run_tasks(options.worker_cap(), &tasks, &failed, |task| {
        let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, task.n);
        let base = task.n * grid;
        let lp_seq = &lp[base..base + grid];
        let band = batch.wp_ends.map(|w| {
            AlignmentBand::new(
                &w[task.n * stride..(task.n + 1) * stride],
                dims.t_len,
                options.l_buffer,
                options.r_buffer,
            )
        });
        let counters = match task.pass {
            Pass::Alpha => &alpha_counters[task.n * stride..(task.n + 1) * stride],
            Pass::Beta => &beta_counters[task.n * stride..(task.n + 1) * stride],
        };
        let lattice = match task.pass {
            Pass::Alpha => alpha_grid.as_ref().expect("alpha pass without alpha grid"),
            Pass::Beta => beta_grid.as_ref().expect("beta pass without beta grid"),
        };
        match task.pass {
            Pass::Alpha => alpha_row_dense(
                dims.t_len, stride, base, lp_seq, band.as_ref(), lattice, counters, task.u,
                &failed,
            ),
            Pass::Beta => beta_row_dense(
                dims.t_len, dims.u_len, stride, base, lp_seq, band.as_ref(), lattice, counters,
                task.u, &failed,
            ),
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn alpha_row_dense(
    t_len: usize,
    stride: usize,
    base: usize,
    lp: &[LogProbPair],
    band: Option<&AlignmentBand<'_>>,
    lattice: &SharedGrid,
    counters: &[AtomicU32],
    u: usize,
    failed: &AtomicBool,
) {
    let t_last = t_len as i32 - 1;
    let (row_start, row_end) = match band {
        Some(band) => band.valid_time_range(u),
        None => (0, t_last),
    };
    let tiles = t_len.div_ceil(TILE);

    for w in 0..tiles {
        let lo = w * TILE;
        let hi = (lo + TILE).min(t_len);
        if u > 0 && !wait_for(&counters[u - 1], needed_tiles_fwd(0, t_last, hi as i32 - 1), failed) {
            return;
        }
        for t in lo..hi {
            let idx = t * stride + u;
            match band {
                None => {
                    // SAFETY: same-row reads are earlier cells of this
                    // worker; row u-1 reads are covered by the counter wait.
                    let val = unsafe {
                        if t == 0 && u == 0 {
                            0.0
                        } else if u == 0 {
                            lattice.read(base + idx - stride) + lp[idx - stride].skip
                        } else if t == 0 {
                            lattice.read(base + idx - 1) + lp[idx - 1].emit
                        } else {
                            lse(
                                lattice.read(base + idx - stride) + lp[idx - stride].skip,
                                lattice.read(base + idx - 1) + lp[idx - 1].emit,
                            )
                        }
                    };
                    unsafe { lattice.write(base + idx, val) };
                }
                Some(band) => {
                    if t == 0 && u == 0 {
                        unsafe { lattice.write(base + idx, 0.0) };
                        continue;
                    }
                    let ti = t as i32;
                    if ti < row_start || ti > row_end {
                        continue;
                    }
                    let mut skip = NEG_INF;
                    let mut emit = NEG_INF;
                    if band.alpha_blank_transition(t, u) {
                        skip = unsafe { lattice.read(base + idx - stride) } + lp[idx - stride].skip;
                    }
                    if u >= 1 && band.alpha_emit_transition(t, u) {
                        emit = unsafe { lattice.read(base + idx - 1) } + lp[idx - 1].emit;
                    }
                    if skip != NEG_INF || emit != NEG_INF {
                        unsafe { lattice.write(base + idx, lse(skip, emit)) };
                    }
                }
            }
        }
        counters[u].fetch_add(1, Ordering::Release);
    }
}

#[allow(clippy::too_many_arguments)]
fn beta_row_dense(
    t_len: usize,
    u_len: usize,
    stride: usize,
    base: usize,
    lp: &[LogProbPair],
    band: Option<&AlignmentBand<'_>>,
    lattice: &SharedGrid,
    counters: &[AtomicU32],
    u: usize,
    failed: &AtomicBool,
) {
    let t_last = t_len as i32 - 1;
    let (row_start, row_end) = match band {
        Some(band) => band.valid_time_range(u),
        None => (0, t_last),
    };
    let tiles = t_len.div_ceil(TILE);

    for w in 0..tiles {
        // Tile w counts from the time end.
        let hi = t_len - (w * TILE).min(t_len);
        let lo = hi.saturating_sub(TILE);
        if u + 1 < u_len
            && !wait_for(&counters[u + 1], needed_tiles_bwd(0, t_last, lo as i32), failed)
        {
            return;
        }
        for t in (lo..hi).rev() {
            let idx = t * stride + u;
            match band {
                None => {
                    let val = unsafe {
                        if t == t_len - 1 && u == u_len - 1 {
                            lp[idx].skip
                        } else if u == u_len - 1 {
                            lattice.read(base + idx + stride) + lp[idx].skip
                        } else if t == t_len - 1 {
                            lattice.read(base + idx + 1) + lp[idx].emit
                        } else {
                            lse(
                                lattice.read(base + idx + stride) + lp[idx].skip,
                                lattice.read(base + idx + 1) + lp[idx].emit,
                            )
                        }
                    };
                    unsafe { lattice.write(base + idx, val) };
                }
                Some(band) => {
                    if t == t_len - 1 && u == u_len - 1 {
                        unsafe { lattice.write(base + idx, lp[idx].skip) };
                        continue;
                    }
                    let ti = t as i32;
                    if ti < row_start || ti > row_end {
                        continue;
                    }
                    let mut skip = NEG_INF;
                    let mut emit = NEG_INF;
                    if band.beta_blank_transition(t, u) {
                        skip = unsafe { lattice.read(base + idx + stride) } + lp[idx].skip;
                    }
                    if u + 1 < u_len && band.beta_emit_transition(t, u) {
                        emit = unsafe { lattice.read(base + idx + 1) } + lp[idx].emit;
                    }
                    if skip != NEG_INF || emit != NEG_INF {
                        unsafe { lattice.write(base + idx, lse(skip, emit)) };
                    }
                }
            }
        }
        counters[u].fetch_add(1, Ordering::Release);
    }
}

/// Sparse wave-front: same protocol, indices remapped through the row
/// segments of each sequence's [`SparseLayout`].
pub(crate) fn alphas_betas_sparse(
    options: &Options,
    lp: &[LogProbPair],
    batch: &SparseBatch<'_>,
    mut alphas: Option<&mut [f32]>,
    mut betas: Option<&mut [f32]>,
    alpha_counters: &[AtomicU32],
    beta_counters: &[AtomicU32],
) -> Result<(), TransducerError> {
    let stride = options.max_tgt_len;

    reset_counters(alpha_counters);
    reset_counters(beta_counters);

    // Per-sequence cell offsets; cells outside the band stay -inf.
    let mut bases = Vec::with_capacity(options.hypo_count() + 1);
    bases.push(0usize);
    for n in 0..options.hypo_count() {
        bases.push(bases[n] + batch.cells_per_sample[n].max(0) as usize);
    }
    for lattice in [alphas.as_deref_mut(), betas.as_deref_mut()].into_iter().flatten() {
        lattice[..bases[options.hypo_count()]].fill(NEG_INF);
    }

    let mut tasks = Vec::new();
    for n in 0..options.hypo_count() {
        let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
        if dims.t_len == 0 || bases[n + 1] == bases[n] {
            continue;
        }
        if alphas.is_some() {
            for u in 0..dims.u_len {
                tasks.push(RowTask { n, pass: Pass::Alpha, u });
            }
        }
        if betas.is_some() {
            for u in (0..dims.u_len).rev() {
                tasks.push(RowTask { n, pass: Pass::Beta, u });
            }
        }
    }

    let alpha_grid = alphas.map(|a| SharedGrid::new(a));
    let beta_grid = betas.map(|b| SharedGrid::new(b));
    let failed = AtomicBool::new(false);

    run_tasks(options.worker_cap(), &tasks, &failed, |task| {
        let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, task.n);
        let layout = SparseLayout::for_seq(options, batch.valid_ranges, task.n);
        let base = bases[task.n];
        let cells = bases[task.n + 1] - base;
        let lp_seq = &lp[base..base + cells];
        let counters = match task.pass {
            Pass::Alpha => &alpha_counters[task.n * stride..(task.n + 1) * stride],
            Pass::Beta => &beta_counters[task.n * stride..(task.n + 1) * stride],
        };
        let lattice = match task.pass {
            Pass::Alpha => alpha_grid.as_ref().expect("alpha pass without alpha grid"),
            Pass::Beta => beta_grid.as_ref().expect("beta pass without beta grid"),
        };
        match task.pass {
            Pass::Alpha => alpha_row_sparse(
                dims.t_len, dims.u_len, &layout, base, lp_seq, lattice, counters, task.u, &failed,
            ),
            Pass::Beta => beta_row_sparse(
                dims.t_len, dims.u_len, &layout, base, lp_seq, lattice, counters, task.u, &failed,
            ),
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn alpha_row_sparse(
    t_len: usize,
    _u_len: usize,
    layout: &SparseLayout<'_>,
    base: usize,
    lp: &[LogProbPair],
    lattice: &SharedGrid,
    counters: &[AtomicU32],
    u: usize,
    failed: &AtomicBool,
) {
    let t_last = t_len as i32 - 1;
    let start = layout.t_start(u);
    let row_len = layout.row_len(u);
    let off = layout.cells(u);
    let (prev_start, prev_end, prev_off) = if u > 0 {
        (layout.t_start(u - 1), layout.t_end(u - 1), layout.cells(u - 1))
    } else {
        (0, -1, 0)
    };
    let tiles = row_len.div_ceil(TILE);

    for w in 0..tiles {
        let lo = w * TILE;
        let hi = (lo + TILE).min(row_len);
        let t_hi = start + hi as i32 - 1;
        if u > 0 && !wait_for(&counters[u - 1], needed_tiles_fwd(prev_start, prev_end, t_hi), failed)
        {
            return;
        }
        for i in lo..hi {
            let t = start + i as i32;
            if t > t_last {
                break;
            }
            let idx = off + i;
            if u == 0 {
                if t == 0 {
                    unsafe { lattice.write(base + idx, 0.0) };
                } else if t > start {
                    let val = unsafe { lattice.read(base + idx - 1) } + lp[idx - 1].skip;
                    unsafe { lattice.write(base + idx, val) };
                }
                continue;
            }
            let mut skip = NEG_INF;
            let mut emit = NEG_INF;
            if t > start {
                skip = unsafe { lattice.read(base + idx - 1) } + lp[idx - 1].skip;
            }
            if layout.contains(t, u - 1) {
                let pidx = prev_off + (t - prev_start) as usize;
                emit = unsafe { lattice.read(base + pidx) } + lp[pidx].emit;
            }
            if skip != NEG_INF || emit != NEG_INF {
                unsafe { lattice.write(base + idx, lse(skip, emit)) };
            }
        }
        counters[u].fetch_add(1, Ordering::Release);
    }
}

#[allow(clippy::too_many_arguments)]
fn beta_row_sparse(
    t_len: usize,
    u_len: usize,
    layout: &SparseLayout<'_>,
    base: usize,
    lp: &[LogProbPair],
    lattice: &SharedGrid,
    counters: &[AtomicU32],
    u: usize,
    failed: &AtomicBool,
) {
    let t_last = t_len as i32 - 1;
    let start = layout.t_start(u);
    let end_clamped = layout.t_end(u).min(t_last);
    let row_len = layout.row_len(u);
    let off = layout.cells(u);
    let (next_start, next_end, next_off) = if u + 1 < u_len {
        (layout.t_start(u + 1), layout.t_end(u + 1), layout.cells(u + 1))
    } else {
        (0, -1, 0)
    };
    let tiles = row_len.div_ceil(TILE);

    for w in 0..tiles {
        let hi = row_len - (w * TILE).min(row_len);
        let lo = hi.saturating_sub(TILE);
        let t_lo = start + lo as i32;
        if u + 1 < u_len
            && !wait_for(&counters[u + 1], needed_tiles_bwd(next_start, next_end, t_lo), failed)
        {
            return;
        }
        for i in (lo..hi).rev() {
            let t = start + i as i32;
            if t > t_last {
                continue;
            }
            let idx = off + i;
            if u == u_len - 1 {
                if t == t_last {
                    unsafe { lattice.write(base + idx, lp[idx].skip) };
                } else if t < end_clamped {
                    let val = unsafe { lattice.read(base + idx + 1) } + lp[idx].skip;
                    unsafe { lattice.write(base + idx, val) };
                }
                continue;
            }
            let mut skip = NEG_INF;
            let mut emit = NEG_INF;
            if t < end_clamped {
                skip = unsafe { lattice.read(base + idx + 1) } + lp[idx].skip;
            }
            if layout.contains(t, u + 1) {
                let nidx = next_off + (t - next_start) as usize;
                emit = unsafe { lattice.read(base + nidx) } + lp[idx].emit;
            }
            if skip != NEG_INF || emit != NEG_INF {
                unsafe { lattice.write(base + idx, lse(skip, emit)) };
            }
        }
        counters[u].fetch_add(1, Ordering::Release);
    }
}
