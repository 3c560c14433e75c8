//! Scratch arena shared by the pipeline stages.
//!
//! One `f32` allocation holds denominators, log-probability pairs, alphas
//! and betas back to back; a second allocation holds the per-row atomic
//! counters the wave-front back-end sequences itself with. Both are sized
//! once from [`Options`] and reused across calls with compatible shapes.
//! Buffers are not zeroed between calls: every stage writes a cell before
//! any stage reads it, and the band-restricted paths pre-fill unreachable
//! cells with `-inf` themselves.

use std::sync::atomic::AtomicU32;

use crate::options::Options;
use crate::types::LogProbPair;

pub struct Workspace {
    options: Options,
    cells: usize,
    arena: Vec<f32>,
    counters: Vec<AtomicU32>,
}

/// Disjoint mutable views over one workspace, handed to the stages.
pub struct WorkspaceViews<'a> {
    pub denominators: &'a mut [f32],
    pub log_probs: &'a mut [LogProbPair],
    pub alphas: &'a mut [f32],
    pub betas: &'a mut [f32],
    pub alpha_counters: &'a [AtomicU32],
    pub beta_counters: &'a [AtomicU32],
}

impl Workspace {
    /// Workspace for dense calls: one cell per padded grid position.
    pub fn for_dense(options: Options) -> Self {
        let cells = options.grid_cells();
        Self::with_cells(options, cells)
    }

    /// Workspace for sparse calls: one cell per materialised position.
    pub fn for_sparse(options: Options) -> Self {
        let cells = options.sparse_cells;
        Self::with_cells(options, cells)
    }

    fn with_cells(options: Options, cells: usize) -> Self {
        let arena = vec![0.0f32; Self::required_floats(cells)];
        let counters = (0..Self::required_counters(&options))
            .map(|_| AtomicU32::new(0))
            .collect();
        Self {
            options,
            cells,
            arena,
            counters,
        }
    }

    /// `f32` slots backing `cells` lattice positions: denominator + two
    /// log-probability entries + alpha + beta per cell.
    pub fn required_floats(cells: usize) -> usize {
        cells * 5
    }

    /// One counter per (pass, sequence, label-step row).
    pub fn required_counters(options: &Options) -> usize {
        2 * options.hypo_count() * options.max_tgt_len
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Lattice cells backing this workspace.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cells
    }

    pub fn views(&mut self) -> WorkspaceViews<'_> {
        let cells = self.cells;
        let (denominators, rest) = self.arena.split_at_mut(cells);
        let (log_probs, rest) = rest.split_at_mut(2 * cells);
        let (alphas, betas) = rest.split_at_mut(cells);
        let (alpha_counters, beta_counters) =
            self.counters.split_at(self.counters.len() / 2);
        WorkspaceViews {
            denominators,
            log_probs: bytemuck::cast_slice_mut(log_probs),
            alphas,
            betas,
            alpha_counters,
            beta_counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Options {
        Options {
            batch_size: 2,
            n_hypos: 2,
            max_src_len: 7,
            max_tgt_len: 3,
            num_targets: 5,
            sparse_cells: 11,
            ..Options::default()
        }
    }

    #[test]
    fn dense_views_partition_the_arena() {
        let mut ws = Workspace::for_dense(options());
        let cells = 2 * 2 * 7 * 3;
        assert_eq!(ws.cell_count(), cells);
        let views = ws.views();
        assert_eq!(views.denominators.len(), cells);
        assert_eq!(views.log_probs.len(), cells);
        assert_eq!(views.alphas.len(), cells);
        assert_eq!(views.betas.len(), cells);
        assert_eq!(views.alpha_counters.len(), 2 * 2 * 3);
        assert_eq!(views.beta_counters.len(), 2 * 2 * 3);
    }

    #[test]
    fn sparse_views_size_by_materialised_cells() {
        let mut ws = Workspace::for_sparse(options());
        assert_eq!(ws.cell_count(), 11);
        let views = ws.views();
        assert_eq!(views.denominators.len(), 11);
        assert_eq!(views.log_probs.len(), 11);
        // Counters stay grid-shaped: the wave-front walks full rows.
        assert_eq!(views.alpha_counters.len(), 2 * 2 * 3);
    }

    #[test]
    fn sizing_is_pure() {
        assert_eq!(Workspace::required_floats(10), 50);
        assert_eq!(Workspace::required_counters(&options()), 24);
    }
}
