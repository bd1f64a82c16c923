//! Projection layer implementations.

pub mod frozen_linear;
pub mod merged_linear;
pub mod state;

pub use frozen_linear::FrozenLinear;
pub use merged_linear::{MergedLinear, MergedLinearConfig};
pub use state::LoraState;

use candle_core::Tensor;

use crate::Result;

/// Multiply `xs` of shape `[..., k]` by a `(k, n)` matrix, broadcasting the
/// matrix over up to two leading batch dimensions the way candle's `Linear`
/// does.
pub(crate) fn broadcast_matmul(xs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let rhs = match *xs.dims() {
        [b1, b2, _, _] => rhs.broadcast_left((b1, b2))?,
        [bsize, _, _] => rhs.broadcast_left(bsize)?,
        _ => rhs.clone(),
    };
    Ok(xs.matmul(&rhs)?)
}
