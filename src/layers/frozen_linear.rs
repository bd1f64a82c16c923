//! Frozen-only projection: the baseline sibling of [`MergedLinear`].
//!
//! [`MergedLinear`]: crate::MergedLinear

// Allow usize to f32 casts for initializer bounds - this is standard in ML code
#![allow(clippy::cast_precision_loss)]

use candle_core::{Device, Tensor};

use crate::layers::broadcast_matmul;
use crate::params::{ParamRole, ParamSet};
use crate::traits::Projection;
use crate::Result;

/// A dense projection with no adaptation branch.
///
/// Holds a weight of shape `(out_features, in_features)` and an optional bias.
/// Mode switches are a no-op: there is nothing to merge.
#[derive(Debug)]
pub struct FrozenLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
}

impl FrozenLinear {
    /// Create a new frozen projection with the standard linear initializer.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor allocation fails.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: &Device,
    ) -> Result<Self> {
        let bound = (1.0 / in_features as f32).sqrt();
        let weight = Tensor::rand(-bound, bound, (out_features, in_features), device)?;
        let bias = if bias {
            Some(Tensor::rand(-bound, bound, out_features, device)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Build a frozen projection from an existing weight and optional bias.
    ///
    /// # Errors
    ///
    /// Returns an error if `weight` is not of shape
    /// `(out_features, in_features)`.
    pub fn from_weight(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// The frozen weight, of shape `(out_features, in_features)`.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Projection for FrozenLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = broadcast_matmul(xs, &self.weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(ys.broadcast_add(bias)?),
            None => Ok(ys),
        }
    }

    fn set_training(&mut self, _training: bool) -> Result<()> {
        Ok(())
    }

    fn register_parameters(&self, prefix: &str, params: &mut ParamSet) {
        params.insert(
            format!("{prefix}.weight"),
            self.weight.clone(),
            ParamRole::Weight,
            false,
        );
        if let Some(bias) = &self.bias {
            params.insert(format!("{prefix}.bias"), bias.clone(), ParamRole::Bias, false);
        }
    }

    fn is_adapted(&self) -> bool {
        false
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }
}
