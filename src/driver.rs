//! Entry points composing the pipeline stages.
//!
//! Every entry runs denominators, then log-probabilities, then the lattice
//! sweeps it needs, aborting on the first stage failure. Costs always come
//! from the backward lattice (`-beta(0, 0)`); gradients are only assembled
//! when a buffer for them is supplied.

use crate::error::TransducerError;
use crate::gradients;
use crate::lattice::{self, seq_dims, sparse, wavefront};
use crate::options::{BackendKind, Options};
use crate::stages;
use crate::types::{DenseBatch, Scalar, SparseBatch};
use crate::workspace::{Workspace, WorkspaceViews};

/// Costs and, optionally, gradients for a dense batch.
pub fn compute<S: Scalar>(
    workspace: &mut Workspace,
    logits: &[S],
    batch: &DenseBatch<'_>,
    costs: &mut [S],
    gradients: Option<&mut [S]>,
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_validate_dense(&options, workspace.cell_count(), logits.len(), batch, costs.len());
    tracing::debug!(
        backend = ?options.backend,
        restricted = batch.wp_ends.is_some(),
        "dense transducer loss"
    );
    let WorkspaceViews {
        denominators,
        log_probs,
        alphas,
        betas,
        alpha_counters,
        beta_counters,
    } = workspace.views();

    stages::compute_denominators(&options, options.grid_cells(), logits, denominators)?;
    stages::compute_log_probs_dense(&options, logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            lattice::alphas_betas_seq(&options, log_probs, batch, Some(&mut *alphas), Some(&mut *betas));
        }
        BackendKind::Wavefront => wavefront::alphas_betas(
            &options,
            log_probs,
            batch,
            Some(&mut *alphas),
            Some(&mut *betas),
            alpha_counters,
            beta_counters,
        )?,
    }

    let infeasible = extract_costs_dense(&options, batch, betas, costs);
    if batch.wp_ends.is_some() && infeasible > 0 {
        tracing::warn!(
            sequences = infeasible,
            "alignment band admits no complete path; costs are infinite"
        );
    }

    if let Some(gradients) = gradients {
        gradients::compute_gradients_dense(
            &options,
            Some(logits),
            gradients,
            batch,
            denominators,
            alphas,
            betas,
            false,
        )?;
    }
    Ok(())
}

/// [`compute`] with the gradient buffer aliasing the logits buffer: the
/// gradients overwrite the logits in place and the padded cells are zeroed.
pub fn compute_in_place<S: Scalar>(
    workspace: &mut Workspace,
    logits: &mut [S],
    batch: &DenseBatch<'_>,
    costs: &mut [S],
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_validate_dense(&options, workspace.cell_count(), logits.len(), batch, costs.len());
    tracing::debug!(
        backend = ?options.backend,
        restricted = batch.wp_ends.is_some(),
        "dense transducer loss, gradients in place"
    );
    let WorkspaceViews {
        denominators,
        log_probs,
        alphas,
        betas,
        alpha_counters,
        beta_counters,
    } = workspace.views();

    stages::compute_denominators(&options, options.grid_cells(), &*logits, denominators)?;
    stages::compute_log_probs_dense(&options, &*logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            lattice::alphas_betas_seq(&options, log_probs, batch, Some(&mut *alphas), Some(&mut *betas));
        }
        BackendKind::Wavefront => wavefront::alphas_betas(
            &options,
            log_probs,
            batch,
            Some(&mut *alphas),
            Some(&mut *betas),
            alpha_counters,
            beta_counters,
        )?,
    }

    extract_costs_dense(&options, batch, betas, costs);

    gradients::compute_gradients_dense(
        &options,
        None,
        logits,
        batch,
        denominators,
        alphas,
        betas,
        true,
    )
}

/// Forward lattice only, written into the caller's `B·H × T × U` buffer.
pub fn compute_alphas<S: Scalar>(
    workspace: &mut Workspace,
    logits: &[S],
    batch: &DenseBatch<'_>,
    alphas: &mut [f32],
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_assert_eq!(alphas.len(), options.grid_cells());
    let WorkspaceViews {
        denominators,
        log_probs,
        alpha_counters,
        beta_counters,
        ..
    } = workspace.views();

    stages::compute_denominators(&options, options.grid_cells(), logits, denominators)?;
    stages::compute_log_probs_dense(&options, logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            lattice::alphas_betas_seq(&options, log_probs, batch, Some(alphas), None);
            Ok(())
        }
        BackendKind::Wavefront => wavefront::alphas_betas(
            &options,
            log_probs,
            batch,
            Some(alphas),
            None,
            alpha_counters,
            beta_counters,
        ),
    }
}

/// Backward lattice plus costs, the lattice written into the caller's
/// `B·H × T × U` buffer.
pub fn compute_betas<S: Scalar>(
    workspace: &mut Workspace,
    logits: &[S],
    batch: &DenseBatch<'_>,
    costs: &mut [S],
    betas: &mut [f32],
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_assert_eq!(betas.len(), options.grid_cells());
    let WorkspaceViews {
        denominators,
        log_probs,
        alpha_counters,
        beta_counters,
        ..
    } = workspace.views();

    stages::compute_denominators(&options, options.grid_cells(), logits, denominators)?;
    stages::compute_log_probs_dense(&options, logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            lattice::alphas_betas_seq(&options, log_probs, batch, None, Some(&mut *betas));
        }
        BackendKind::Wavefront => wavefront::alphas_betas(
            &options,
            log_probs,
            batch,
            None,
            Some(&mut *betas),
            alpha_counters,
            beta_counters,
        )?,
    }

    extract_costs_dense(&options, batch, betas, costs);
    Ok(())
}

/// Costs and, optionally, gradients for a sparse batch (`S × D` logits).
pub fn compute_sparse<S: Scalar>(
    workspace: &mut Workspace,
    logits: &[S],
    batch: &SparseBatch<'_>,
    costs: &mut [S],
    gradients: Option<&mut [S]>,
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_validate_sparse(&options, workspace.cell_count(), logits.len(), batch, costs.len());
    tracing::debug!(backend = ?options.backend, cells = options.sparse_cells, "sparse transducer loss");
    let WorkspaceViews {
        denominators,
        log_probs,
        alphas,
        betas,
        alpha_counters,
        beta_counters,
    } = workspace.views();

    stages::compute_denominators(&options, options.sparse_cells, logits, denominators)?;
    stages::compute_log_probs_sparse(&options, logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            sparse::alphas_betas_seq_sparse(&options, log_probs, batch, Some(&mut *alphas), Some(&mut *betas));
        }
        BackendKind::Wavefront => wavefront::alphas_betas_sparse(
            &options,
            log_probs,
            batch,
            Some(&mut *alphas),
            Some(&mut *betas),
            alpha_counters,
            beta_counters,
        )?,
    }

    extract_costs_sparse(&options, batch, betas, costs);

    if let Some(gradients) = gradients {
        gradients::compute_gradients_sparse(
            &options,
            Some(logits),
            gradients,
            batch,
            denominators,
            alphas,
            betas,
        )?;
    }
    Ok(())
}

/// [`compute_sparse`] with gradients overwriting the logits buffer. Sparse
/// storage has no padded cells, so nothing needs zeroing afterwards.
pub fn compute_sparse_in_place<S: Scalar>(
    workspace: &mut Workspace,
    logits: &mut [S],
    batch: &SparseBatch<'_>,
    costs: &mut [S],
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_validate_sparse(&options, workspace.cell_count(), logits.len(), batch, costs.len());
    let WorkspaceViews {
        denominators,
        log_probs,
        alphas,
        betas,
        alpha_counters,
        beta_counters,
    } = workspace.views();

    stages::compute_denominators(&options, options.sparse_cells, &*logits, denominators)?;
    stages::compute_log_probs_sparse(&options, &*logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            sparse::alphas_betas_seq_sparse(&options, log_probs, batch, Some(&mut *alphas), Some(&mut *betas));
        }
        BackendKind::Wavefront => wavefront::alphas_betas_sparse(
            &options,
            log_probs,
            batch,
            Some(&mut *alphas),
            Some(&mut *betas),
            alpha_counters,
            beta_counters,
        )?,
    }

    extract_costs_sparse(&options, batch, betas, costs);

    gradients::compute_gradients_sparse(
        &options,
        None,
        logits,
        batch,
        denominators,
        alphas,
        betas,
    )
}

/// Sparse forward lattice only, into the caller's `S`-cell buffer.
pub fn compute_alphas_sparse<S: Scalar>(
    workspace: &mut Workspace,
    logits: &[S],
    batch: &SparseBatch<'_>,
    alphas: &mut [f32],
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_assert_eq!(alphas.len(), options.sparse_cells);
    let WorkspaceViews {
        denominators,
        log_probs,
        alpha_counters,
        beta_counters,
        ..
    } = workspace.views();

    stages::compute_denominators(&options, options.sparse_cells, logits, denominators)?;
    stages::compute_log_probs_sparse(&options, logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            sparse::alphas_betas_seq_sparse(&options, log_probs, batch, Some(alphas), None);
            Ok(())
        }
        BackendKind::Wavefront => wavefront::alphas_betas_sparse(
            &options,
            log_probs,
            batch,
            Some(alphas),
            None,
            alpha_counters,
            beta_counters,
        ),
    }
}

/// Sparse backward lattice plus costs.
pub fn compute_betas_sparse<S: Scalar>(
    workspace: &mut Workspace,
    logits: &[S],
    batch: &SparseBatch<'_>,
    costs: &mut [S],
    betas: &mut [f32],
) -> Result<(), TransducerError> {
    let options = *workspace.options();
    debug_assert_eq!(betas.len(), options.sparse_cells);
    let WorkspaceViews {
        denominators,
        log_probs,
        alpha_counters,
        beta_counters,
        ..
    } = workspace.views();

    stages::compute_denominators(&options, options.sparse_cells, logits, denominators)?;
    stages::compute_log_probs_sparse(&options, logits, batch, denominators, log_probs)?;

    match options.backend {
        BackendKind::Sequential => {
            sparse::alphas_betas_seq_sparse(&options, log_probs, batch, None, Some(&mut *betas));
        }
        BackendKind::Wavefront => wavefront::alphas_betas_sparse(
            &options,
            log_probs,
            batch,
            None,
            Some(&mut *betas),
            alpha_counters,
            beta_counters,
        )?,
    }

    extract_costs_sparse(&options, batch, betas, costs);
    Ok(())
}

/// Negated backward scores into the cost buffer. Returns how many sequences
/// have no feasible alignment.
fn extract_costs_dense<S: Scalar>(
    options: &Options,
    batch: &DenseBatch<'_>,
    betas: &[f32],
    costs: &mut [S],
) -> usize {
    let grid = options.max_src_len * options.max_tgt_len;
    let mut infeasible = 0;
    for n in 0..options.hypo_count() {
        let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
        let cost = if dims.t_len == 0 {
            f32::INFINITY
        } else {
            -betas[n * grid]
        };
        if cost == f32::INFINITY {
            infeasible += 1;
        }
        costs[n] = S::from_f32(cost);
    }
    infeasible
}

fn extract_costs_sparse<S: Scalar>(
    options: &Options,
    batch: &SparseBatch<'_>,
    betas: &[f32],
    costs: &mut [S],
) -> usize {
    let mut infeasible = 0;
    let mut base = 0usize;
    for n in 0..options.hypo_count() {
        let dims = seq_dims(options, batch.src_lengths, batch.tgt_lengths, n);
        let cells = batch.cells_per_sample[n].max(0) as usize;
        let layout = sparse::SparseLayout::for_seq(options, batch.valid_ranges, n);
        let origin_present =
            cells > 0 && dims.t_len > 0 && layout.row_len(0) > 0 && layout.t_start(0) == 0;
        let cost = if origin_present {
            -betas[base]
        } else {
            f32::INFINITY
        };
        if cost == f32::INFINITY {
            infeasible += 1;
        }
        costs[n] = S::from_f32(cost);
        base += cells;
    }
    infeasible
}

fn debug_validate_dense(
    options: &Options,
    workspace_cells: usize,
    logits_len: usize,
    batch: &DenseBatch<'_>,
    costs_len: usize,
) {
    debug_assert_eq!(workspace_cells, options.grid_cells());
    debug_assert_eq!(logits_len, options.grid_cells() * options.num_targets);
    debug_assert_eq!(batch.src_lengths.len(), options.batch_size);
    debug_assert_eq!(batch.tgt_lengths.len(), options.batch_size);
    debug_assert_eq!(batch.targets.len(), options.batch_size * options.target_stride());
    debug_assert_eq!(costs_len, options.hypo_count());
    if let Some(wp_ends) = batch.wp_ends {
        debug_assert_eq!(wp_ends.len(), options.hypo_count() * options.max_tgt_len);
    }
    debug_assert!(options.blank >= 0 && (options.blank as usize) < options.num_targets);
}

fn debug_validate_sparse(
    options: &Options,
    workspace_cells: usize,
    logits_len: usize,
    batch: &SparseBatch<'_>,
    costs_len: usize,
) {
    debug_assert_eq!(workspace_cells, options.sparse_cells);
    debug_assert_eq!(logits_len, options.sparse_cells * options.num_targets);
    debug_assert_eq!(batch.src_lengths.len(), options.batch_size);
    debug_assert_eq!(batch.tgt_lengths.len(), options.batch_size);
    debug_assert_eq!(batch.targets.len(), options.batch_size * options.target_stride());
    debug_assert_eq!(costs_len, options.hypo_count());
    debug_assert_eq!(
        batch.valid_ranges.len(),
        options.hypo_count() * options.max_tgt_len * 2
    );
    debug_assert_eq!(batch.cells_per_sample.len(), options.hypo_count());
    debug_assert_eq!(
        batch.cells_per_sample.iter().map(|&c| c.max(0) as usize).sum::<usize>(),
        options.sparse_cells
    );
}
