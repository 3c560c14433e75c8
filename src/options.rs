use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TransducerError;

/// Back-end selector: the opaque parallelism handle of the options record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// One stage after another, one sequence after another.
    #[default]
    Sequential,
    /// Tiled wave-front over each lattice on a scoped worker pool.
    Wavefront,
}

/// Immutable configuration consumed by every stage of one loss call.
///
/// `max_tgt_len` counts label-step rows including the implicit leading blank
/// row, so targets carry `max_tgt_len - 1` columns per batch item and the
/// effective lattice of item `b` is `src_lengths[b] × (tgt_lengths[b] + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Independent batch items (B).
    pub batch_size: usize,
    /// Hypotheses per batch item (H); the logical batch is `B·H`.
    pub n_hypos: usize,
    /// Padded time extent (T).
    pub max_src_len: usize,
    /// Padded label-step extent (U), counting the leading blank row.
    pub max_tgt_len: usize,
    /// Vocabulary size including blank (D).
    pub num_targets: usize,
    /// Id of the blank symbol, in `[0, num_targets)`.
    pub blank: i32,
    /// Symmetric gradient clamp; `0` disables.
    pub clamp: f32,
    /// Compute log-softmax inside the loss (subtract the per-cell
    /// denominator). When `false`, logits must arrive already normalised
    /// and the gradient takes the non-fused form.
    pub fused_log_softmax: bool,
    /// Alignment-band half-width to the left of each end-time anchor.
    pub l_buffer: i32,
    /// Alignment-band half-width to the right of each end-time anchor.
    pub r_buffer: i32,
    /// Materialised cell count (S), sparse mode only.
    pub sparse_cells: usize,
    pub backend: BackendKind,
    /// Wave-front worker cap; `0` uses the host parallelism.
    pub threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_size: 1,
            n_hypos: 1,
            max_src_len: 0,
            max_tgt_len: 0,
            num_targets: 0,
            blank: 0,
            clamp: 0.0,
            fused_log_softmax: true,
            l_buffer: 0,
            r_buffer: 0,
            sparse_cells: 0,
            backend: BackendKind::Sequential,
            threads: 0,
        }
    }
}

impl Options {
    /// Logical batch `B·H`.
    #[inline]
    pub fn hypo_count(&self) -> usize {
        self.batch_size * self.n_hypos
    }

    /// Dense lattice cells per call, `B·H·T·U`.
    #[inline]
    pub fn grid_cells(&self) -> usize {
        self.hypo_count() * self.max_src_len * self.max_tgt_len
    }

    /// Columns per row of the targets matrix.
    #[inline]
    pub(crate) fn target_stride(&self) -> usize {
        self.max_tgt_len.saturating_sub(1)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TransducerError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TransducerError::io("read options json", e))?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self, TransducerError> {
        serde_json::from_str(data).map_err(|e| TransducerError::json("parse options json", e))
    }

    /// Opt-in precondition check. The compute path itself never validates in
    /// release builds; adapters that cannot trust their inputs call this
    /// before handing buffers over.
    pub fn validate(&self) -> Result<(), TransducerError> {
        if self.num_targets == 0 {
            return Err(TransducerError::invalid_input("num_targets must be > 0"));
        }
        if self.blank < 0 || self.blank as usize >= self.num_targets {
            return Err(TransducerError::invalid_input(format!(
                "blank id {} outside vocabulary of size {}",
                self.blank, self.num_targets
            )));
        }
        if self.max_tgt_len == 0 {
            return Err(TransducerError::invalid_input(
                "max_tgt_len must count at least the blank row",
            ));
        }
        if self.batch_size == 0 || self.n_hypos == 0 {
            return Err(TransducerError::invalid_input(
                "batch_size and n_hypos must be > 0",
            ));
        }
        if self.clamp < 0.0 {
            return Err(TransducerError::invalid_input("clamp must be >= 0"));
        }
        if self.l_buffer < 0 || self.r_buffer < 0 {
            return Err(TransducerError::invalid_input(
                "alignment buffers must be >= 0",
            ));
        }
        Ok(())
    }

    /// Worker count for the wave-front back-end.
    pub(crate) fn worker_cap(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
