//! Denominator and log-probability stages.
//!
//! The denominator stage reduces each vocabulary row with a two-pass
//! log-sum-exp (maxima first, then the stabilised sums); the log-probability
//! stage extracts the two transitions the lattice uses from every in-range
//! cell. Under the wave-front back-end both stages shard their output over a
//! scoped worker pool; rows and sequences are independent, so the shards
//! never overlap.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::TransducerError;
use crate::lattice::seq_dims;
use crate::lattice::sparse::SparseLayout;
use crate::math::{reduce_max, reduce_sum_exp_given_max};
use crate::options::{BackendKind, Options};
use crate::types::{DenseBatch, LogProbPair, Scalar, SparseBatch};

use crate::lattice::wavefront::panic_message;

/// Split `out` into `sizes`-shaped pieces and run `f(piece_index, piece)`
/// over all of them, sharded round-robin across up to `workers` scoped
/// threads. Piece sizes must sum to `out.len()`.
pub(crate) fn run_pieces<T: Send, F>(
    workers: usize,
    out: &mut [T],
    sizes: impl Iterator<Item = usize>,
    f: F,
) -> Result<(), String>
where
    F: Fn(usize, &mut [T]) + Sync,
{
    let mut pieces = Vec::new();
    let mut rest = out;
    for (i, size) in sizes.enumerate() {
        let (piece, tail) = std::mem::take(&mut rest).split_at_mut(size);
        pieces.push((i, piece));
        rest = tail;
    }
    debug_assert!(rest.is_empty());

    let workers = workers.min(pieces.len());
    if workers <= 1 {
        for (i, piece) in pieces {
            f(i, piece);
        }
        return Ok(());
    }

    let mut shards: Vec<Vec<(usize, &mut [T])>> = (0..workers).map(|_| Vec::new()).collect();
    for (k, piece) in pieces.into_iter().enumerate() {
        shards[k % workers].push(piece);
    }

    let f = &f;
    let mut outcome = Ok(());
    std::thread::scope(|scope| {
        let handles: Vec<_> = shards
            .into_iter()
            .map(|shard| {
                scope.spawn(move || {
                    catch_unwind(AssertUnwindSafe(|| {
                        for (i, piece) in shard {
                            f(i, piece);
                        }
                    }))
                    .map_err(panic_message)
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
                    outcome = Err(message);
                }
            }
        }
    });
    outcome
}

fn stage_workers(options: &Options) -> usize {
    match options.backend {
        BackendKind::Sequential => 1,
        BackendKind::Wavefront => options.worker_cap(),
    }
}

/// Uniform piece sizes covering `total` items, last piece ragged.
fn even_sizes(total: usize, pieces: usize) -> impl Iterator<Item = usize> {
    let chunk = total.div_ceil(pieces.max(1)).max(1);
    (0..total.div_ceil(chunk)).map(move |i| chunk.min(total - i * chunk))
}

/// Per-cell log-sum-exp over the vocabulary: `rows` is `B·H·T·U` dense or
/// the materialised cell count sparse.
pub(crate) fn compute_denominators<S: Scalar>(
    options: &Options,
    rows: usize,
    logits: &[S],
    denominators: &mut [f32],
) -> Result<(), TransducerError> {
    let d_len = options.num_targets;
    let workers = stage_workers(options);
    let chunk = rows.div_ceil(workers.max(1)).max(1);

    run_pieces(
        workers,
        &mut denominators[..rows],
        even_sizes(rows, workers),
        |piece_idx, piece| {
            let first = piece_idx * chunk;
            for (i, slot) in piece.iter_mut().enumerate() {
                let row = &logits[(first + i) * d_len..(first + i + 1) * d_len];
                *slot = reduce_max(row);
            }
        },
    )
    .map_err(|message| TransducerError::DenominatorReduceMax { message })?;

    run_pieces(
        workers,
        &mut denominators[..rows],
        even_sizes(rows, workers),
        |piece_idx, piece| {
            let first = piece_idx * chunk;
            for (i, slot) in piece.iter_mut().enumerate() {
                let row = &logits[(first + i) * d_len..(first + i + 1) * d_len];
                *slot = reduce_sum_exp_given_max(row, *slot);
            }
        },
    )
    .map_err(|message| TransducerError::DenominatorReduceSum { message })
}

/// Dense log-probability pairs for every in-range cell.
pub(crate) fn compute_log_probs_dense<S: Scalar>(
    options: &Options,
    logits: &[S],
    batch: &DenseBatch<'_>,
    denominators: &[f32],
    log_probs: &mut [LogProbPair],
) -> Result<(), TransducerError> {
    let stride = options.max_tgt_len;
    let grid = options.max_src_len * stride;
    let d_len = options.num_targets;
    let blank = options.blank as usize;
    let hypos = options.hypo_count();

    run_pieces(
        stage_workers(options),
        &mut log_probs[..hypos * grid],
        (0..hypos).map(|_| grid),
        |n, piece| {
            let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
            let b = n / options.n_hypos;
            let targets = &batch.targets[b * options.target_stride()..][..options.target_stride()];
            for t in 0..dims.t_len {
                for u in 0..dims.u_len {
                    let cell = t * stride + u;
                    let denom = if options.fused_log_softmax {
                        denominators[n * grid + cell]
                    } else {
                        0.0
                    };
                    let row = (n * grid + cell) * d_len;
                    piece[cell].skip = logits[row + blank].to_f32() - denom;
                    if u + 1 < dims.u_len {
                        piece[cell].emit = logits[row + targets[u] as usize].to_f32() - denom;
                    }
                }
            }
        },
    )
    .map_err(|message| TransducerError::LogProbs { message })
}

/// Sparse log-probability pairs; only materialised cells are touched.
pub(crate) fn compute_log_probs_sparse<S: Scalar>(
    options: &Options,
    logits: &[S],
    batch: &SparseBatch<'_>,
    denominators: &[f32],
    log_probs: &mut [LogProbPair],
) -> Result<(), TransducerError> {
    let d_len = options.num_targets;
    let blank = options.blank as usize;
    let hypos = options.hypo_count();

    let mut bases = Vec::with_capacity(hypos + 1);
    bases.push(0usize);
    for n in 0..hypos {
        bases.push(bases[n] + batch.cells_per_sample[n].max(0) as usize);
    }
    let total = bases[hypos];

    run_pieces(
        stage_workers(options),
        &mut log_probs[..total],
        (0..hypos).map(|n| bases[n + 1] - bases[n]),
        |n, piece| {
            let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
            if dims.t_len == 0 {
                return;
            }
            let b = n / options.n_hypos;
            let targets = &batch.targets[b * options.target_stride()..][..options.target_stride()];
            let layout = SparseLayout::for_seq(options, batch.valid_ranges, n);
            let base = bases[n];
            let mut off = 0usize;
            for u in 0..dims.u_len {
                let start = layout.t_start(u);
                for t in start..=layout.t_end(u) {
                    let idx = off + (t - start) as usize;
                    let denom = if options.fused_log_softmax {
                        denominators[base + idx]
                    } else {
                        0.0
                    };
                    let row = (base + idx) * d_len;
                    piece[idx].skip = logits[row + blank].to_f32() - denom;
                    if u + 1 < dims.u_len {
                        piece[idx].emit = logits[row + targets[u] as usize].to_f32() - denom;
                    }
                }
                off += layout.row_len(u);
            }
        },
    )
    .map_err(|message| TransducerError::LogProbs { message })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(rows: usize, d_len: usize) -> Options {
        Options {
            batch_size: 1,
            max_src_len: rows,
            max_tgt_len: 1,
            num_targets: d_len,
            ..Options::default()
        }
    }

    #[test]
    fn denominators_match_direct_lse() {
        let logits: Vec<f32> = vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0];
        let mut denom = vec![0.0f32; 2];
        compute_denominators(&options(2, 3), 2, &logits, &mut denom).unwrap();
        let want0 = (1.0f32.exp() + 2.0f32.exp() + 3.0f32.exp()).ln();
        let want1 = ((-1.0f32).exp() + 1.0 + 1.0f32.exp()).ln();
        assert!((denom[0] - want0).abs() < 1e-5);
        assert!((denom[1] - want1).abs() < 1e-5);
    }

    #[test]
    fn denominators_parallel_match_sequential() {
        let rows = 67;
        let d_len = 5;
        let logits: Vec<f32> = (0..rows * d_len)
            .map(|i| ((i * 37 % 19) as f32) / 3.0 - 2.0)
            .collect();
        let mut seq = vec![0.0f32; rows];
        compute_denominators(&options(rows, d_len), rows, &logits, &mut seq).unwrap();

        let parallel_options = Options {
            backend: BackendKind::Wavefront,
            threads: 3,
            ..options(rows, d_len)
        };
        let mut par = vec![0.0f32; rows];
        compute_denominators(&parallel_options, rows, &logits, &mut par).unwrap();
        for (a, b) in seq.iter().zip(&par) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn log_probs_subtract_denominator_when_fused() {
        // One sequence, T=1, U=2, D=2, blank=0, target=[1].
        let options = Options {
            batch_size: 1,
            max_src_len: 1,
            max_tgt_len: 2,
            num_targets: 2,
            ..Options::default()
        };
        let logits = vec![0.5f32, -0.5, 1.0, 2.0];
        let targets = [1];
        let batch = DenseBatch {
            targets: &targets,
            src_lengths: &[1],
            tgt_lengths: &[1],
            wp_ends: None,
        };
        let mut denom = vec![0.0f32; 2];
        compute_denominators(&options, 2, &logits, &mut denom).unwrap();
        let mut lp = vec![LogProbPair { skip: 0.0, emit: 0.0 }; 2];
        compute_log_probs_dense(&options, &logits, &batch, &denom, &mut lp).unwrap();
        assert!((lp[0].skip - (0.5 - denom[0])).abs() < 1e-6);
        assert!((lp[0].emit - (-0.5 - denom[0])).abs() < 1e-6);
        assert!((lp[1].skip - (1.0 - denom[1])).abs() < 1e-6);

        let unfused = Options {
            fused_log_softmax: false,
            ..options
        };
        compute_log_probs_dense(&unfused, &logits, &batch, &denom, &mut lp).unwrap();
        assert_eq!(lp[0].skip, 0.5);
        assert_eq!(lp[0].emit, -0.5);
    }
}
