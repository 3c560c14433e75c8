use bytemuck::{Pod, Zeroable};
use half::f16;

/// Storage element type for logits, costs and gradients.
///
/// All score arithmetic runs in `f32` (the accumulation type); storage may
/// be narrower. Implemented for `f32` and [`half::f16`].
pub trait Scalar: Copy + Send + Sync + std::fmt::Debug + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Scalar for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Scalar for f16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

/// The two transitions out of a lattice cell, in log space.
///
/// `skip` advances time by emitting blank; `emit` advances the label step by
/// emitting the next target symbol. The emit slot of the last label-step row
/// is never written and never read.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LogProbPair {
    pub skip: f32,
    pub emit: f32,
}

/// Borrowed dense-mode batch inputs, everything except the logits buffer.
///
/// Shapes, with `B = batch_size`, `H = n_hypos`, `T = max_src_len`,
/// `U = max_tgt_len` (label-step rows including the leading blank row):
/// logits are `B·H × T × U × D` row-major and hypothesis `n` reads row
/// `n / H` of `targets` and the length vectors; the `H` hypotheses of one
/// batch item share audio length and reference labels.
#[derive(Debug, Clone, Copy)]
pub struct DenseBatch<'a> {
    /// Label ids, `B × (U − 1)` row-major; blank never appears here.
    pub targets: &'a [i32],
    /// Valid time steps per batch item, `B` entries.
    pub src_lengths: &'a [i32],
    /// Valid label steps per batch item, `B` entries; the effective lattice
    /// of item `b` is `src_lengths[b] × (tgt_lengths[b] + 1)`.
    pub tgt_lengths: &'a [i32],
    /// Per-label-step end-time anchors, `B·H × U`. Present selects the
    /// band-restricted lattice with the options' `l_buffer`/`r_buffer`.
    pub wp_ends: Option<&'a [i32]>,
}

/// Borrowed sparse-mode batch inputs.
///
/// Only in-band cells are materialised: logits are `S × D` where `S` is the
/// options' `sparse_cells`. Cells of sequence `n` are stored row-major by
/// label step `u < tgt_lengths[n / H] + 1`, each row holding the contiguous
/// time span `[t_start(u), t_end(u)]` taken from `valid_ranges`.
#[derive(Debug, Clone, Copy)]
pub struct SparseBatch<'a> {
    pub targets: &'a [i32],
    pub src_lengths: &'a [i32],
    pub tgt_lengths: &'a [i32],
    /// Inclusive `[t_start, t_end]` per (sequence, label step), `B·H × U × 2`.
    pub valid_ranges: &'a [i32],
    /// Materialised cell count per sequence, `B·H` entries.
    pub cells_per_sample: &'a [i32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip_f16() {
        let x = f16::from_f32(1.5);
        assert_eq!(x.to_f32(), 1.5);
        assert_eq!(<f16 as Scalar>::from_f32(f32::INFINITY), f16::INFINITY);
    }

    #[test]
    fn log_prob_pair_is_two_floats() {
        assert_eq!(std::mem::size_of::<LogProbPair>(), 8);
        let raw = [0.25f32, -0.5, 1.0, 2.0];
        let pairs: &[LogProbPair] = bytemuck::cast_slice(&raw);
        assert_eq!(pairs[0], LogProbPair { skip: 0.25, emit: -0.5 });
        assert_eq!(pairs[1], LogProbPair { skip: 1.0, emit: 2.0 });
    }
}
