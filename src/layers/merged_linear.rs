//! Fused linear projection with per-partition low-rank adaptation.
//!
//! A `MergedLinear` combines a frozen dense projection with trainable
//! low-rank factors `ΔW = B @ A` applied to a subset of equal-size output
//! partitions (for a fused QKV projection: the query/key/value slices).
//! The update can be folded into the frozen weight for inference and folded
//! back out to resume training.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

// Allow usize to f32 casts for initializer bounds - this is standard in ML code
#![allow(clippy::cast_precision_loss)]

use candle_core::{DType, Device, Tensor, Var, D};
use serde::{Deserialize, Serialize};

use crate::config::LoraConfig;
use crate::error::{LoraError, Result};
use crate::layers::broadcast_matmul;
use crate::layers::state::LoraState;
use crate::params::{ParamRole, ParamSet};
use crate::traits::Projection;

/// Construction options for [`MergedLinear`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedLinearConfig {
    /// Low-rank hyperparameters.
    pub lora: LoraConfig,

    /// One flag per equal-size output partition; only flagged partitions
    /// receive an adaptation. The length must divide `out_features` evenly.
    pub enable_lora: Vec<bool>,

    /// Store the weight transposed and skip the transpose in every multiply.
    #[serde(default)]
    pub fan_in_fan_out: bool,

    /// Fold the update into the frozen weight when switching to inference
    /// mode, and fold it back out when switching to training mode. When
    /// false the low-rank branch is always computed in forward and the layer
    /// never merges.
    #[serde(default = "default_merge_weights")]
    pub merge_weights: bool,

    /// Allocate a bias vector.
    #[serde(default)]
    pub bias: bool,
}

fn default_merge_weights() -> bool {
    true
}

impl Default for MergedLinearConfig {
    fn default() -> Self {
        Self {
            lora: LoraConfig::default(),
            enable_lora: vec![false],
            fan_in_fan_out: false,
            merge_weights: true,
            bias: false,
        }
    }
}

/// Fused linear layer with optional per-partition low-rank update branches.
///
/// The frozen weight has shape `(out_features, in_features)` (transposed when
/// `fan_in_fan_out`). When the rank is positive and at least one partition is
/// enabled, the layer owns `lora_a` of shape `(r * enabled, in_features)` and
/// `lora_b` of shape `(partition_size * enabled, r)`, where group `g` of B
/// maps group `g` of the A output onto the g-th enabled partition. Disabled
/// partitions receive exactly zero update.
pub struct MergedLinear {
    weight: Var,
    bias: Option<Var>,
    lora_a: Option<Var>,
    lora_b: Option<Var>,
    state: LoraState,
    enable_lora: Vec<bool>,
    fan_in_fan_out: bool,
    in_features: usize,
    out_features: usize,
    training: bool,
}

impl MergedLinear {
    /// Create a new fused projection.
    ///
    /// The frozen weight and bias use the standard linear initializer
    /// (Kaiming-uniform, which for the √5 negative slope collapses to the
    /// `±1/sqrt(in_features)` bound). `lora_a` is Kaiming-uniform, `lora_b`
    /// starts at zero so the update is zero until training moves it.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidConfig`] if `enable_lora` is empty or its
    /// length does not divide `out_features` evenly, or if the low-rank
    /// hyperparameters are invalid.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: MergedLinearConfig,
        device: &Device,
    ) -> Result<Self> {
        config.lora.validate()?;
        if config.enable_lora.is_empty() {
            return Err(LoraError::InvalidConfig(
                "enable_lora must not be empty".into(),
            ));
        }
        if out_features % config.enable_lora.len() != 0 {
            return Err(LoraError::InvalidConfig(format!(
                "the length of enable_lora ({}) must divide out_features ({})",
                config.enable_lora.len(),
                out_features
            )));
        }

        let bound = (1.0 / in_features as f32).sqrt();
        let weight = Tensor::rand(-bound, bound, (out_features, in_features), device)?;
        let weight = if config.fan_in_fan_out {
            weight.t()?.contiguous()?
        } else {
            weight
        };
        let weight = Var::from_tensor(&weight)?;
        let bias = if config.bias {
            Some(Var::from_tensor(&Tensor::rand(
                -bound,
                bound,
                out_features,
                device,
            )?)?)
        } else {
            None
        };

        let r = config.lora.r;
        let enabled = config.enable_lora.iter().filter(|e| **e).count();
        let (lora_a, lora_b) = if r > 0 && enabled > 0 {
            let partition_size = out_features / config.enable_lora.len();
            let a = Tensor::rand(-bound, bound, (r * enabled, in_features), device)?;
            let b = Tensor::zeros((partition_size * enabled, r), DType::F32, device)?;
            (
                Some(Var::from_tensor(&a)?),
                Some(Var::from_tensor(&b)?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            weight,
            bias,
            lora_a,
            lora_b,
            state: LoraState::new(
                r,
                config.lora.alpha,
                config.lora.dropout,
                config.merge_weights,
            ),
            enable_lora: config.enable_lora,
            fan_in_fan_out: config.fan_in_fan_out,
            in_features,
            out_features,
            training: true,
        })
    }

    /// Size of one output partition.
    #[must_use]
    pub fn partition_size(&self) -> usize {
        self.out_features / self.enable_lora.len()
    }

    /// Rank of the low-rank decomposition.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.state.rank()
    }

    /// Scaling factor applied to the low-rank branch output.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.state.scaling()
    }

    /// Whether the update is currently folded into the frozen weight.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.state.merged()
    }

    /// Number of trainable low-rank parameters (A plus B).
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        let enabled = self.enabled_count();
        let r = self.state.rank();
        r * enabled * self.in_features + self.partition_size() * enabled * r
    }

    /// The frozen weight as currently stored: `(out_features, in_features)`,
    /// transposed when `fan_in_fan_out`.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    fn enabled_count(&self) -> usize {
        self.enable_lora.iter().filter(|e| **e).count()
    }

    fn has_adapter(&self) -> bool {
        self.lora_a.is_some()
    }

    /// Weight oriented as `(in_features, out_features)` for right-multiplying
    /// batched inputs.
    fn oriented_weight(&self) -> Result<Tensor> {
        if self.fan_in_fan_out {
            Ok(self.weight.as_tensor().clone())
        } else {
            Ok(self.weight.as_tensor().t()?)
        }
    }

    fn base_forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = broadcast_matmul(xs, &self.oriented_weight()?)?;
        match &self.bias {
            Some(bias) => Ok(ys.broadcast_add(bias.as_tensor())?),
            None => Ok(ys),
        }
    }

    /// The scaled update `ΔW` scattered to the full `(out_features,
    /// in_features)` shape (transposed when `fan_in_fan_out`), built from the
    /// per-partition products `B_g @ A_g`. Rows of disabled partitions are
    /// zero.
    fn delta_weight(&self) -> Result<Tensor> {
        let (Some(lora_a), Some(lora_b)) = (&self.lora_a, &self.lora_b) else {
            return Err(LoraError::InvalidConfig(
                "delta_weight requires an adaptation branch".into(),
            ));
        };
        let r = self.state.rank();
        let partition_size = self.partition_size();
        let device = self.weight.device();

        let mut rows = Vec::with_capacity(self.enable_lora.len());
        let mut group = 0;
        for &enabled in &self.enable_lora {
            if enabled {
                let a_g = lora_a.as_tensor().narrow(0, group * r, r)?;
                let b_g = lora_b
                    .as_tensor()
                    .narrow(0, group * partition_size, partition_size)?;
                rows.push(b_g.matmul(&a_g)?);
                group += 1;
            } else {
                rows.push(Tensor::zeros(
                    (partition_size, self.in_features),
                    DType::F32,
                    device,
                )?);
            }
        }
        let delta = Tensor::cat(&rows, 0)?.affine(self.state.scaling(), 0.0)?;
        if self.fan_in_fan_out {
            Ok(delta.t()?.contiguous()?)
        } else {
            Ok(delta)
        }
    }

    /// Forward pass.
    ///
    /// `base = xs · Wᵀ + bias`. When merged, or when no adaptation branch
    /// exists, base is returned unchanged. Otherwise each enabled partition
    /// receives its scaled low-rank contribution
    /// `dropout(xs) · A_gᵀ · B_gᵀ · scaling`; disabled partitions receive
    /// exactly zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying tensor arithmetic fails.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let base = self.base_forward(xs)?;
        let (Some(lora_a), Some(lora_b)) = (&self.lora_a, &self.lora_b) else {
            return Ok(base);
        };
        if self.state.merged() {
            return Ok(base);
        }

        let dropped = self.state.apply_dropout(xs, self.training)?;
        let after_a = broadcast_matmul(&dropped, &lora_a.as_tensor().t()?)?;

        let r = self.state.rank();
        let partition_size = self.partition_size();
        let mut chunks = Vec::with_capacity(self.enable_lora.len());
        let mut group = 0;
        for &enabled in &self.enable_lora {
            if enabled {
                let a_g = after_a.narrow(D::Minus1, group * r, r)?.contiguous()?;
                let b_g = lora_b
                    .as_tensor()
                    .narrow(0, group * partition_size, partition_size)?;
                chunks.push(broadcast_matmul(&a_g, &b_g.t()?)?);
                group += 1;
            } else {
                let mut dims = after_a.dims().to_vec();
                let last = dims.len() - 1;
                dims[last] = partition_size;
                chunks.push(Tensor::zeros(dims, base.dtype(), base.device())?);
            }
        }
        let update = Tensor::cat(&chunks, D::Minus1)?.affine(self.state.scaling(), 0.0)?;
        Ok(base.broadcast_add(&update)?)
    }

    /// Switch between training and inference mode.
    ///
    /// Records the mode (which drives dropout), then fires the merge
    /// transition when `merge_weights` is set and an adaptation branch
    /// exists: entering inference mode folds `ΔW` into the frozen weight in
    /// place; entering training mode folds it back out. Repeated calls with
    /// the same mode are no-ops, so the transition is idempotent. Without an
    /// adaptation branch (rank zero or no partition enabled) the merge flag
    /// never leaves the unmerged state.
    ///
    /// # Errors
    ///
    /// Returns an error if the merge arithmetic fails; the merge flag only
    /// flips after the weight mutation has succeeded.
    pub fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if !self.state.merge_weights() || !self.has_adapter() {
            return Ok(());
        }
        if training {
            if self.state.merged() {
                let delta = self.delta_weight()?;
                self.weight.set(&(self.weight.as_tensor() - &delta)?)?;
                self.state.set_merged(false);
            }
        } else if !self.state.merged() {
            let delta = self.delta_weight()?;
            self.weight.set(&(self.weight.as_tensor() + &delta)?)?;
            self.state.set_merged(true);
        }
        Ok(())
    }
}

impl Projection for MergedLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        MergedLinear::forward(self, xs)
    }

    fn set_training(&mut self, training: bool) -> Result<()> {
        MergedLinear::set_training(self, training)
    }

    fn register_parameters(&self, prefix: &str, params: &mut ParamSet) {
        // The dense weight is frozen exactly when an adaptation branch owns
        // the update.
        params.insert(
            format!("{prefix}.weight"),
            self.weight.as_tensor().clone(),
            ParamRole::Weight,
            !self.has_adapter(),
        );
        if let Some(bias) = &self.bias {
            params.insert(
                format!("{prefix}.bias"),
                bias.as_tensor().clone(),
                ParamRole::Bias,
                true,
            );
        }
        if let Some(lora_a) = &self.lora_a {
            params.insert(
                format!("{prefix}.lora_a"),
                lora_a.as_tensor().clone(),
                ParamRole::LoraA,
                true,
            );
        }
        if let Some(lora_b) = &self.lora_b {
            params.insert(
                format!("{prefix}.lora_b"),
                lora_b.as_tensor().clone(),
                ParamRole::LoraB,
                true,
            );
        }
    }

    fn is_adapted(&self) -> bool {
        self.has_adapter()
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qkv_config(r: usize) -> MergedLinearConfig {
        MergedLinearConfig {
            lora: LoraConfig {
                r,
                alpha: 2.0 * r.max(1) as f64,
                dropout: 0.0,
            },
            enable_lora: vec![true, false, true],
            ..Default::default()
        }
    }

    fn randomize_factors(layer: &MergedLinear) -> Result<()> {
        let a = layer.lora_a.as_ref().unwrap();
        let b = layer.lora_b.as_ref().unwrap();
        a.set(&Tensor::rand(-0.5f32, 0.5f32, a.dims(), a.device())?)?;
        b.set(&Tensor::rand(-0.5f32, 0.5f32, b.dims(), b.device())?)?;
        Ok(())
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        let diff = (a - b)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
        Ok(diff.into_iter().fold(0f32, f32::max))
    }

    #[test]
    fn test_uneven_partitions_rejected() {
        let device = Device::Cpu;
        let config = MergedLinearConfig {
            lora: LoraConfig {
                r: 2,
                alpha: 4.0,
                dropout: 0.0,
            },
            enable_lora: vec![true, false, true],
            ..Default::default()
        };
        let result = MergedLinear::new(4, 10, config, &device);
        assert!(matches!(result, Err(LoraError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_partitions_rejected() {
        let device = Device::Cpu;
        let config = MergedLinearConfig {
            enable_lora: vec![],
            ..Default::default()
        };
        assert!(MergedLinear::new(4, 12, config, &device).is_err());
    }

    #[test]
    fn test_forward_shape() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let layer = MergedLinear::new(8, 24, qkv_config(2), &device)?;
        let xs = Tensor::rand(-1f32, 1f32, (2, 5, 8), &device)?;
        let ys = layer.forward(&xs)?;
        assert_eq!(ys.dims(), &[2, 5, 24]);
        Ok(())
    }

    #[test]
    fn test_zero_init_update_is_identity() -> anyhow::Result<()> {
        // lora_b starts at zero, so before any training step the layer
        // behaves exactly like its frozen projection.
        let device = Device::Cpu;
        let layer = MergedLinear::new(6, 12, qkv_config(3), &device)?;
        let xs = Tensor::rand(-1f32, 1f32, (4, 6), &device)?;
        let base = layer.base_forward(&xs)?;
        let full = layer.forward(&xs)?;
        assert!(max_abs_diff(&base, &full)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_rank_zero_is_plain_linear() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = MergedLinearConfig {
            lora: LoraConfig {
                r: 0,
                alpha: 1.0,
                dropout: 0.0,
            },
            enable_lora: vec![true, false, true],
            ..Default::default()
        };
        let mut layer = MergedLinear::new(6, 12, config, &device)?;
        assert!(!layer.is_adapted());
        assert_eq!(layer.num_parameters(), 0);

        let xs = Tensor::rand(-1f32, 1f32, (4, 6), &device)?;
        let expected = xs.matmul(&layer.weight().t()?)?;
        let actual = layer.forward(&xs)?;
        assert!(max_abs_diff(&expected, &actual)? < 1e-6);

        // Merge is vacuous without an adaptation branch.
        layer.set_training(false)?;
        assert!(!layer.is_merged());
        Ok(())
    }

    #[test]
    fn test_all_partitions_disabled_is_plain_linear() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = MergedLinearConfig {
            lora: LoraConfig {
                r: 4,
                alpha: 8.0,
                dropout: 0.0,
            },
            enable_lora: vec![false, false, false],
            ..Default::default()
        };
        let mut layer = MergedLinear::new(6, 12, config, &device)?;
        assert!(!layer.is_adapted());
        layer.set_training(false)?;
        assert!(!layer.is_merged());
        Ok(())
    }

    #[test]
    fn test_disabled_partition_gets_zero_update() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let layer = MergedLinear::new(4, 9, qkv_config(2), &device)?;
        let xs = Tensor::rand(-1f32, 1f32, (3, 4), &device)?;

        let base = layer.base_forward(&xs)?;
        randomize_factors(&layer)?;
        let full = layer.forward(&xs)?;
        let update = (&full - &base)?;

        // Middle partition (indices 3..6) is disabled and must be exactly
        // zero; the outer partitions carry the update.
        let middle = update.narrow(D::Minus1, 3, 3)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(middle, 0.0);
        let outer = update.narrow(D::Minus1, 0, 3)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(outer > 0.0);
        Ok(())
    }

    #[test]
    fn test_merge_is_transparent() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut layer = MergedLinear::new(8, 24, qkv_config(2), &device)?;
        randomize_factors(&layer)?;
        let xs = Tensor::rand(-1f32, 1f32, (2, 5, 8), &device)?;

        let unmerged = layer.forward(&xs)?;
        layer.set_training(false)?;
        assert!(layer.is_merged());
        let merged = layer.forward(&xs)?;

        assert!(max_abs_diff(&unmerged, &merged)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_merge_is_idempotent() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut layer = MergedLinear::new(6, 12, qkv_config(2), &device)?;
        randomize_factors(&layer)?;

        layer.set_training(false)?;
        let once = layer.weight().flatten_all()?.to_vec1::<f32>()?;
        layer.set_training(false)?;
        let twice = layer.weight().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn test_merge_round_trip_restores_weight() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut layer = MergedLinear::new(6, 12, qkv_config(2), &device)?;
        randomize_factors(&layer)?;

        // Deep copy: Var::set mutates storage in place, so a plain clone
        // would alias the post-merge weight.
        let original = layer.weight().copy()?;
        layer.set_training(false)?;
        layer.set_training(true)?;
        assert!(!layer.is_merged());
        assert!(max_abs_diff(&original, layer.weight())? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_merge_disabled_by_config() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = MergedLinearConfig {
            merge_weights: false,
            ..qkv_config(2)
        };
        let mut layer = MergedLinear::new(6, 12, config, &device)?;
        randomize_factors(&layer)?;
        layer.set_training(false)?;
        assert!(!layer.is_merged());
        Ok(())
    }

    #[test]
    fn test_fan_in_fan_out_merge_round_trip() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = MergedLinearConfig {
            fan_in_fan_out: true,
            ..qkv_config(2)
        };
        let mut layer = MergedLinear::new(6, 12, config, &device)?;
        assert_eq!(layer.weight().dims(), &[6, 12]);
        randomize_factors(&layer)?;
        let xs = Tensor::rand(-1f32, 1f32, (3, 6), &device)?;

        let unmerged = layer.forward(&xs)?;
        let original = layer.weight().copy()?;
        layer.set_training(false)?;
        let merged = layer.forward(&xs)?;
        assert!(max_abs_diff(&unmerged, &merged)? < 1e-4);

        layer.set_training(true)?;
        assert!(max_abs_diff(&original, layer.weight())? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_num_parameters() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let layer = MergedLinear::new(8, 12, qkv_config(2), &device)?;
        // Two enabled partitions of size 4: A is (4, 8), B is (8, 2).
        assert_eq!(layer.num_parameters(), 4 * 8 + 8 * 2);
        Ok(())
    }
}
