//! Closed-form gradient assembly from logits, denominators and the two
//! lattices.
//!
//! With the fused log-softmax the gradient of cell `(t, u)` couples the
//! softmax Jacobian with the transition posteriors; without it the inputs
//! are already log-probabilities and only the transition posteriors remain
//! (see DESIGN.md). The output buffer may be the logits buffer itself
//! (`input == None`): the formulas are point-wise in the vocabulary index,
//! so each slot is read before it is overwritten, and the padded cells are
//! zeroed afterwards so stale logits cannot leak out of the call.

use crate::error::TransducerError;
use crate::lattice::seq_dims;
use crate::lattice::sparse::SparseLayout;
use crate::math::clamp_sym;
use crate::options::{BackendKind, Options};
use crate::stages::run_pieces;
use crate::types::{DenseBatch, Scalar, SparseBatch};

const NEG_INF: f32 = f32::NEG_INFINITY;

fn stage_workers(options: &Options) -> usize {
    match options.backend {
        BackendKind::Sequential => 1,
        BackendKind::Wavefront => options.worker_cap(),
    }
}

/// Dense gradients. `input` is the logits buffer, or `None` when the
/// gradient buffer aliases it; `zero_padding` is set on the aliased path.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_gradients_dense<S: Scalar>(
    options: &Options,
    input: Option<&[S]>,
    gradients: &mut [S],
    batch: &DenseBatch<'_>,
    denominators: &[f32],
    alphas: &[f32],
    betas: &[f32],
    zero_padding: bool,
) -> Result<(), TransducerError> {
    let grid = options.max_src_len * options.max_tgt_len;
    let d_len = options.num_targets;
    let hypos = options.hypo_count();

    run_pieces(
        stage_workers(options),
        &mut gradients[..hypos * grid * d_len],
        (0..hypos).map(|_| grid * d_len),
        |n, piece| {
            let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
            let b = n / options.n_hypos;
            let targets = &batch.targets[b * options.target_stride()..][..options.target_stride()];
            dense_one_sequence(
                options,
                dims.t_len,
                dims.u_len,
                targets,
                input.map(|src| &src[n * grid * d_len..(n + 1) * grid * d_len]),
                piece,
                &denominators[n * grid..(n + 1) * grid],
                &alphas[n * grid..(n + 1) * grid],
                &betas[n * grid..(n + 1) * grid],
                zero_padding,
            );
        },
    )
    .map_err(|message| TransducerError::Gradients { message })
}

#[allow(clippy::too_many_arguments)]
fn dense_one_sequence<S: Scalar>(
    options: &Options,
    t_len: usize,
    u_len: usize,
    targets: &[i32],
    input: Option<&[S]>,
    out: &mut [S],
    denom: &[f32],
    alpha: &[f32],
    beta: &[f32],
    zero_padding: bool,
) {
    let stride = options.max_tgt_len;
    let d_len = options.num_targets;
    let blank = options.blank as usize;

    if t_len > 0 {
        let cost = -beta[0];
        for t in 0..t_len {
            for u in 0..u_len {
                let cell = t * stride + u;
                let beta_down = if t + 1 < t_len { beta[cell + stride] } else { NEG_INF };
                let beta_right = if u + 1 < u_len { beta[cell + 1] } else { NEG_INF };
                let target = if u + 1 < u_len { targets[u] as usize } else { usize::MAX };
                write_cell(
                    options,
                    CellCtx {
                        c: if options.fused_log_softmax {
                            alpha[cell] + cost - denom[cell]
                        } else {
                            alpha[cell] + cost
                        },
                        beta_cur: beta[cell],
                        beta_down,
                        beta_right,
                        blank,
                        target,
                        last: t + 1 == t_len && u + 1 == u_len,
                        advances_time: t + 1 < t_len,
                    },
                    input.map(|src| &src[cell * d_len..(cell + 1) * d_len]),
                    &mut out[cell * d_len..(cell + 1) * d_len],
                );
            }
        }
    }

    if zero_padding {
        for t in t_len..options.max_src_len {
            out[t * stride * d_len..(t + 1) * stride * d_len].fill(S::from_f32(0.0));
        }
        for t in 0..t_len {
            for u in u_len..stride {
                let cell = t * stride + u;
                out[cell * d_len..(cell + 1) * d_len].fill(S::from_f32(0.0));
            }
        }
    }
}

/// Everything one vocabulary row of gradients depends on besides the logits.
struct CellCtx {
    c: f32,
    beta_cur: f32,
    beta_down: f32,
    beta_right: f32,
    blank: usize,
    target: usize,
    last: bool,
    advances_time: bool,
}

#[inline]
fn write_cell<S: Scalar>(options: &Options, ctx: CellCtx, input: Option<&[S]>, out: &mut [S]) {
    for k in 0..out.len() {
        let x = match input {
            Some(src) => src[k].to_f32(),
            None => out[k].to_f32(),
        };
        let g = x + ctx.c;
        let mut val = if options.fused_log_softmax {
            if k == ctx.blank && ctx.last {
                (g + ctx.beta_cur).exp() - g.exp()
            } else if k == ctx.blank && ctx.advances_time {
                (g + ctx.beta_cur).exp() - (g + ctx.beta_down).exp()
            } else if k == ctx.target {
                (g + ctx.beta_cur).exp() - (g + ctx.beta_right).exp()
            } else {
                (g + ctx.beta_cur).exp()
            }
        } else {
            let path = if k == ctx.blank && ctx.last {
                g
            } else if k == ctx.blank && ctx.advances_time {
                g + ctx.beta_down
            } else if k == ctx.target {
                g + ctx.beta_right
            } else {
                NEG_INF
            };
            -path.exp()
        };
        if options.clamp > 0.0 {
            val = clamp_sym(val, options.clamp);
        }
        out[k] = S::from_f32(val);
    }
}

/// Sparse gradients, `S × D`. No padding cells exist, so aliasing the logits
/// buffer needs no extra zeroing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_gradients_sparse<S: Scalar>(
    options: &Options,
    input: Option<&[S]>,
    gradients: &mut [S],
    batch: &SparseBatch<'_>,
    denominators: &[f32],
    alphas: &[f32],
    betas: &[f32],
) -> Result<(), TransducerError> {
    let d_len = options.num_targets;
    let hypos = options.hypo_count();

    let mut bases = Vec::with_capacity(hypos + 1);
    bases.push(0usize);
    for n in 0..hypos {
        bases.push(bases[n] + batch.cells_per_sample[n].max(0) as usize);
    }
    let total = bases[hypos];

    run_pieces(
        stage_workers(options),
        &mut gradients[..total * d_len],
        (0..hypos).map(|n| (bases[n + 1] - bases[n]) * d_len),
        |n, piece| {
            let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
            let base = bases[n];
            let cells = bases[n + 1] - bases[n];
            if dims.t_len == 0 || cells == 0 {
                piece.fill(S::from_f32(0.0));
                return;
            }
            let b = n / options.n_hypos;
            let targets = &batch.targets[b * options.target_stride()..][..options.target_stride()];
            let layout = SparseLayout::for_seq(options, batch.valid_ranges, n);
            sparse_one_sequence(
                options,
                dims.t_len,
                dims.u_len,
                targets,
                &layout,
                input.map(|src| &src[base * d_len..(base + cells) * d_len]),
                piece,
                &denominators[base..base + cells],
                &alphas[base..base + cells],
                &betas[base..base + cells],
            );
        },
    )
    .map_err(|message| TransducerError::Gradients { message })
}

#[allow(clippy::too_many_arguments)]
fn sparse_one_sequence<S: Scalar>(
    options: &Options,
    t_len: usize,
    u_len: usize,
    targets: &[i32],
    layout: &SparseLayout<'_>,
    input: Option<&[S]>,
    out: &mut [S],
    denom: &[f32],
    alpha: &[f32],
    beta: &[f32],
) {
    let d_len = options.num_targets;
    let blank = options.blank as usize;
    let t_last = t_len as i32 - 1;

    let cost = if layout.row_len(0) > 0 && layout.t_start(0) == 0 {
        -beta[0]
    } else {
        f32::INFINITY
    };

    let mut off = 0usize;
    for u in 0..u_len {
        let start = layout.t_start(u);
        let end = layout.t_end(u);
        let next_off = off + layout.row_len(u);
        for t in start..=end {
            let idx = off + (t - start) as usize;
            let beta_down = if t < t_last && t < end { beta[idx + 1] } else { NEG_INF };
            let beta_right = if u + 1 < u_len && layout.contains(t, u + 1) {
                beta[next_off + (t - layout.t_start(u + 1)) as usize]
            } else {
                NEG_INF
            };
            let target = if u + 1 < u_len { targets[u] as usize } else { usize::MAX };
            write_cell(
                options,
                CellCtx {
                    c: if options.fused_log_softmax {
                        alpha[idx] + cost - denom[idx]
                    } else {
                        alpha[idx] + cost
                    },
                    beta_cur: beta[idx],
                    beta_down,
                    beta_right,
                    blank,
                    target,
                    last: t == t_last && u + 1 == u_len,
                    advances_time: t < t_last,
                },
                input.map(|src| &src[idx * d_len..(idx + 1) * d_len]),
                &mut out[idx * d_len..(idx + 1) * d_len],
            );
        }
        off = next_off;
    }
}
