//! Core traits for attention projection layers.

use candle_core::Tensor;

use crate::params::ParamSet;
use crate::Result;

/// A fused attention projection.
///
/// The two sibling implementations are [`FrozenLinear`](crate::FrozenLinear)
/// (frozen-only) and [`MergedLinear`](crate::MergedLinear) (low-rank
/// augmented). Model-construction code selects between them through a
/// [`ProjectionFactory`](crate::ProjectionFactory).
pub trait Projection: Send + Sync {
    /// Forward pass projecting `xs` of shape `[..., in_features]` to
    /// `[..., out_features]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying tensor arithmetic fails.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Switch between training and inference mode.
    ///
    /// For adapted projections this drives dropout and may merge or unmerge
    /// the low-rank update into the frozen weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the merge arithmetic fails.
    fn set_training(&mut self, training: bool) -> Result<()>;

    /// Register this layer's parameters under `prefix` with their roles.
    fn register_parameters(&self, prefix: &str, params: &mut ParamSet);

    /// Whether this projection carries a low-rank adaptation branch.
    #[must_use]
    fn is_adapted(&self) -> bool;

    /// Input dimension.
    #[must_use]
    fn in_features(&self) -> usize;

    /// Output dimension.
    #[must_use]
    fn out_features(&self) -> usize;
}
