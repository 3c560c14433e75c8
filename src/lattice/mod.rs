//! Forward (alpha) and backward (beta) sweeps over the RNN-T lattice.
//!
//! Each sequence owns a `t_len × u_len` grid stored row-major over time with
//! stride `max_tgt_len`. `alpha(t, u)` is the log-mass of all alignments
//! reaching `(t, u)`; `beta(t, u)` the log-mass of all completions. The
//! per-sequence cost is `-beta(0, 0)`, tied to the forward score
//! `alpha(T-1, U-1) + skip(T-1, U-1)` up to f32 rounding.

pub(crate) mod sparse;
pub(crate) mod wavefront;

use crate::math::lse;
use crate::options::Options;
use crate::restrictions::AlignmentBand;
use crate::types::{DenseBatch, LogProbPair};

const NEG_INF: f32 = f32::NEG_INFINITY;

/// Effective lattice extents of logical sequence `n`: the valid time steps
/// and the label-step rows including the leading blank row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SeqDims {
    pub t_len: usize,
    pub u_len: usize,
}

#[inline]
pub(crate) fn seq_dims(
    options: &Options,
    src_lengths: &[i32],
    tgt_lengths: &[i32],
    n: usize,
) -> SeqDims {
    let b = n / options.n_hypos;
    SeqDims {
        t_len: src_lengths[b].max(0) as usize,
        u_len: tgt_lengths[b].max(0) as usize + 1,
    }
}

/// Forward sweep over one unrestricted sequence. Returns the forward score.
pub(crate) fn alpha_dense(
    t_len: usize,
    u_len: usize,
    stride: usize,
    lp: &[LogProbPair],
    alpha: &mut [f32],
) -> f32 {
    alpha[0] = 0.0;

    for t in 1..t_len {
        alpha[t * stride] = alpha[(t - 1) * stride] + lp[(t - 1) * stride].skip;
    }

    for u in 1..u_len {
        alpha[u] = alpha[u - 1] + lp[u - 1].emit;
    }

    for t in 1..t_len {
        for u in 1..u_len {
            let skip = alpha[(t - 1) * stride + u] + lp[(t - 1) * stride + u].skip;
            let emit = alpha[t * stride + u - 1] + lp[t * stride + u - 1].emit;
            alpha[t * stride + u] = lse(skip, emit);
        }
    }

    let last = (t_len - 1) * stride + u_len - 1;
    alpha[last] + lp[last].skip
}

/// Backward sweep over one unrestricted sequence. Returns `beta(0, 0)`.
pub(crate) fn beta_dense(
    t_len: usize,
    u_len: usize,
    stride: usize,
    lp: &[LogProbPair],
    beta: &mut [f32],
) -> f32 {
    let last = (t_len - 1) * stride + u_len - 1;
    beta[last] = lp[last].skip;

    for t in (0..t_len - 1).rev() {
        beta[t * stride + u_len - 1] =
            beta[(t + 1) * stride + u_len - 1] + lp[t * stride + u_len - 1].skip;
    }

    for u in (0..u_len - 1).rev() {
        beta[(t_len - 1) * stride + u] =
            beta[(t_len - 1) * stride + u + 1] + lp[(t_len - 1) * stride + u].emit;
    }

    for t in (0..t_len - 1).rev() {
        for u in (0..u_len - 1).rev() {
            let skip = beta[(t + 1) * stride + u] + lp[t * stride + u].skip;
            let emit = beta[t * stride + u + 1] + lp[t * stride + u].emit;
            beta[t * stride + u] = lse(skip, emit);
        }
    }

    beta[0]
}

/// Forward sweep under an alignment band. Cells the band cannot reach stay
/// `-inf`; boundary rows stop at the first forbidden transition.
pub(crate) fn alpha_restricted(
    t_len: usize,
    u_len: usize,
    stride: usize,
    lp: &[LogProbPair],
    band: &AlignmentBand<'_>,
    alpha: &mut [f32],
) -> f32 {
    for t in 0..t_len {
        for u in 0..u_len {
            alpha[t * stride + u] = NEG_INF;
        }
    }
    alpha[0] = 0.0;

    for t in 1..t_len {
        if !band.alpha_blank_transition(t, 0) {
            break;
        }
        alpha[t * stride] = alpha[(t - 1) * stride] + lp[(t - 1) * stride].skip;
    }

    for u in 1..u_len {
        if !band.alpha_emit_transition(0, u) {
            break;
        }
        alpha[u] = alpha[u - 1] + lp[u - 1].emit;
    }

    for u in 1..u_len {
        let (start_t, end_t) = band.valid_time_range(u);
        for t in start_t..=end_t {
            let t = t as usize;
            let mut skip = NEG_INF;
            let mut emit = NEG_INF;
            if band.alpha_blank_transition(t, u) {
                skip = alpha[(t - 1) * stride + u] + lp[(t - 1) * stride + u].skip;
            }
            if band.alpha_emit_transition(t, u) {
                emit = alpha[t * stride + u - 1] + lp[t * stride + u - 1].emit;
            }
            if skip != NEG_INF || emit != NEG_INF {
                alpha[t * stride + u] = lse(skip, emit);
            }
        }
    }

    let last = (t_len - 1) * stride + u_len - 1;
    alpha[last] + lp[last].skip
}

/// Backward sweep under an alignment band, mirroring [`alpha_restricted`].
pub(crate) fn beta_restricted(
    t_len: usize,
    u_len: usize,
    stride: usize,
    lp: &[LogProbPair],
    band: &AlignmentBand<'_>,
    beta: &mut [f32],
) -> f32 {
    for t in 0..t_len {
        for u in 0..u_len {
            beta[t * stride + u] = NEG_INF;
        }
    }

    let last = (t_len - 1) * stride + u_len - 1;
    beta[last] = lp[last].skip;

    for t in (0..t_len - 1).rev() {
        if !band.beta_blank_transition(t, u_len - 1) {
            break;
        }
        beta[t * stride + u_len - 1] =
            beta[(t + 1) * stride + u_len - 1] + lp[t * stride + u_len - 1].skip;
    }

    for u in (0..u_len - 1).rev() {
        if !band.beta_emit_transition(t_len - 1, u) {
            break;
        }
        beta[(t_len - 1) * stride + u] =
            beta[(t_len - 1) * stride + u + 1] + lp[(t_len - 1) * stride + u].emit;
    }

    for u in (0..u_len - 1).rev() {
        let (start_t, end_t) = band.valid_time_range(u);
        for t in (start_t..=end_t).rev() {
            let t = t as usize;
            let mut skip = NEG_INF;
            let mut emit = NEG_INF;
            if band.beta_blank_transition(t, u) {
                skip = beta[(t + 1) * stride + u] + lp[t * stride + u].skip;
            }
            if band.beta_emit_transition(t, u) {
                emit = beta[t * stride + u + 1] + lp[t * stride + u].emit;
            }
            if skip != NEG_INF || emit != NEG_INF {
                beta[t * stride + u] = lse(skip, emit);
            }
        }
    }

    beta[0]
}

/// Sequential back-end: both sweeps for every sequence in the batch. Either
/// lattice may be omitted when only the other is needed.
pub(crate) fn alphas_betas_seq(
    options: &Options,
    lp: &[LogProbPair],
    batch: &DenseBatch<'_>,
    mut alphas: Option<&mut [f32]>,
    mut betas: Option<&mut [f32]>,
) {
    let stride = options.max_tgt_len;
    let grid = options.max_src_len * stride;

    for n in 0..options.hypo_count() {
        let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
        if dims.t_len == 0 {
            continue;
        }
        let lp_seq = &lp[n * grid..(n + 1) * grid];
        let band = batch
            .wp_ends
            .map(|w| AlignmentBand::new(&w[n * stride..(n + 1) * stride], dims.t_len, options.l_buffer, options.r_buffer));

        if let Some(alphas) = alphas.as_deref_mut() {
            let alpha_seq = &mut alphas[n * grid..(n + 1) * grid];
            match &band {
                Some(band) => {
                    alpha_restricted(dims.t_len, dims.u_len, stride, lp_seq, band, alpha_seq)
                }
                None => alpha_dense(dims.t_len, dims.u_len, stride, lp_seq, alpha_seq),
            };
        }
        if let Some(betas) = betas.as_deref_mut() {
            let beta_seq = &mut betas[n * grid..(n + 1) * grid];
            match &band {
                Some(band) => {
                    beta_restricted(dims.t_len, dims.u_len, stride, lp_seq, band, beta_seq)
                }
                None => beta_dense(dims.t_len, dims.u_len, stride, lp_seq, beta_seq),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // T=2, U=2 grid with uniform transitions log(1/2) everywhere.
    fn uniform_lp() -> Vec<LogProbPair> {
        let p = -(2.0f32.ln());
        vec![LogProbPair { skip: p, emit: p }; 4]
    }

    #[test]
    fn forward_and_backward_scores_agree() {
        let lp = uniform_lp();
        let mut alpha = vec![0.0f32; 4];
        let mut beta = vec![0.0f32; 4];
        let forward = alpha_dense(2, 2, 2, &lp, &mut alpha);
        let backward = beta_dense(2, 2, 2, &lp, &mut beta);
        assert!((forward - backward).abs() < 1e-6);
        // Two alignments, each of probability 1/8: score = log(1/4).
        assert!((forward + 2.0 * 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn unbounded_band_matches_dense() {
        let lp = uniform_lp();
        let wp_ends = [0, 0];
        let band = AlignmentBand::new(&wp_ends, 2, i32::MAX, i32::MAX);

        let mut dense = vec![0.0f32; 4];
        let mut restricted = vec![0.0f32; 4];
        let fwd_dense = alpha_dense(2, 2, 2, &lp, &mut dense);
        let fwd_restricted = alpha_restricted(2, 2, 2, &lp, &band, &mut restricted);
        assert_eq!(fwd_dense.to_bits(), fwd_restricted.to_bits());
        assert_eq!(dense, restricted);

        let bwd_dense = beta_dense(2, 2, 2, &lp, &mut dense);
        let bwd_restricted = beta_restricted(2, 2, 2, &lp, &band, &mut restricted);
        assert_eq!(bwd_dense.to_bits(), bwd_restricted.to_bits());
    }

    #[test]
    fn pinned_band_is_infeasible_when_time_must_advance() {
        // Anchors pinned to t=0 with zero slack: skip transitions are all
        // forbidden, so a T=3 lattice has no complete alignment.
        let lp = vec![LogProbPair { skip: -0.5, emit: -0.5 }; 6];
        let wp_ends = [0, 0];
        let band = AlignmentBand::new(&wp_ends, 3, 0, 0);
        let mut beta = vec![0.0f32; 6];
        let backward = beta_restricted(3, 2, 2, &lp, &band, &mut beta);
        assert_eq!(backward, f32::NEG_INFINITY);
    }
}
