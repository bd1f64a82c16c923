//! Shared bookkeeping for low-rank adapted layers.

// Allow usize to f64 casts for the scaling computation - this is standard in ML code
#![allow(clippy::cast_precision_loss)]

use candle_core::Tensor;
use candle_nn::Dropout;

use crate::Result;

/// Rank, scaling, dropout policy and merge state shared by any adapted
/// projection.
///
/// `merged` is false immediately after construction and only toggles through
/// the merge transition in [`MergedLinear::set_training`](crate::MergedLinear::set_training).
#[derive(Debug, Clone)]
pub struct LoraState {
    r: usize,
    alpha: f64,
    dropout: Option<Dropout>,
    merge_weights: bool,
    merged: bool,
}

impl LoraState {
    /// Create new adaptation state.
    #[must_use]
    pub fn new(r: usize, alpha: f64, dropout: f32, merge_weights: bool) -> Self {
        Self {
            r,
            alpha,
            dropout: (dropout > 0.0).then(|| Dropout::new(dropout)),
            merge_weights,
            merged: false,
        }
    }

    /// Rank of the low-rank decomposition.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.r
    }

    /// Scaling factor `alpha / r` applied to the low-rank branch output.
    ///
    /// Only meaningful when the rank is positive; callers guard on
    /// [`rank`](Self::rank) before using it.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    /// Whether mode switches should fold the update into the frozen weight.
    #[must_use]
    pub fn merge_weights(&self) -> bool {
        self.merge_weights
    }

    /// Whether the update is currently folded into the frozen weight.
    #[must_use]
    pub fn merged(&self) -> bool {
        self.merged
    }

    pub(crate) fn set_merged(&mut self, merged: bool) {
        self.merged = merged;
    }

    /// Apply dropout to the low-rank branch input.
    ///
    /// Identity when the dropout rate is zero or when not training.
    ///
    /// # Errors
    ///
    /// Returns an error if the dropout op fails.
    pub fn apply_dropout(&self, xs: &Tensor, training: bool) -> Result<Tensor> {
        match &self.dropout {
            Some(dropout) => Ok(dropout.forward(xs, training)?),
            None => Ok(xs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_initially_unmerged() {
        let state = LoraState::new(8, 16.0, 0.0, true);
        assert!(!state.merged());
        assert!(state.merge_weights());
    }

    #[test]
    fn test_scaling() {
        let state = LoraState::new(8, 16.0, 0.0, true);
        assert!((state.scaling() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_dropout_is_identity() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let state = LoraState::new(4, 8.0, 0.0, true);
        let xs = Tensor::rand(-1f32, 1f32, (3, 5), &device)?;
        let out = state.apply_dropout(&xs, true)?;
        let diff = (&xs - &out)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-12);
        Ok(())
    }

    #[test]
    fn test_dropout_off_when_not_training() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let state = LoraState::new(4, 8.0, 0.5, true);
        let xs = Tensor::ones((3, 5), DType::F32, &device)?;
        let out = state.apply_dropout(&xs, false)?;
        let diff = (&xs - &out)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-12);
        Ok(())
    }
}
