//! Attention-block integration for adapted projections.
//!
//! Only the projection plumbing lives here: the block owns a fused QKV
//! projection built by a [`ProjectionFactory`] and a plain output
//! projection. Attention score computation, positional encodings and KV
//! caching belong to the surrounding model.

use candle_core::{Device, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{LoraError, Result};
use crate::layers::FrozenLinear;
use crate::params::ParamSet;
use crate::scope::{current_factory, ProjectionFactory};
use crate::traits::Projection;

/// Dimensions of a self-attention block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Embedding size.
    pub n_embd: usize,
    /// Number of attention heads.
    pub n_head: usize,
    /// Whether the projections carry biases.
    #[serde(default)]
    pub bias: bool,
}

impl AttentionConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `n_embd` is not divisible by `n_head`.
    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(LoraError::InvalidConfig(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }
}

/// Causal self-attention block computing query, key and value for all heads
/// with a single fused projection.
pub struct CausalSelfAttention {
    c_attn: Box<dyn Projection>,
    c_proj: FrozenLinear,
    n_embd: usize,
    n_head: usize,
}

impl CausalSelfAttention {
    /// Build a block with the projection variant selected by the active
    /// scope: adapted inside a [`LoraScope`](crate::LoraScope), baseline
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or construction
    /// fails.
    pub fn new(config: &AttentionConfig, device: &Device) -> Result<Self> {
        Self::with_factory(config, current_factory().as_ref(), device)
    }

    /// Build a block with an explicitly injected projection factory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or construction
    /// fails.
    pub fn with_factory(
        config: &AttentionConfig,
        factory: &dyn ProjectionFactory,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        // Query, key and value projections for all heads, in one matrix.
        let c_attn = factory.build(config.n_embd, 3 * config.n_embd, config.bias, device)?;
        let c_proj = FrozenLinear::new(config.n_embd, config.n_embd, config.bias, device)?;
        Ok(Self {
            c_attn,
            c_proj,
            n_embd: config.n_embd,
            n_head: config.n_head,
        })
    }

    /// Project the input and split it into query, key and value tensors,
    /// each of shape `[..., n_embd]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the projection fails.
    pub fn qkv(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let fused = self.c_attn.forward(xs)?;
        let q = fused.narrow(D::Minus1, 0, self.n_embd)?.contiguous()?;
        let k = fused
            .narrow(D::Minus1, self.n_embd, self.n_embd)?
            .contiguous()?;
        let v = fused
            .narrow(D::Minus1, 2 * self.n_embd, self.n_embd)?
            .contiguous()?;
        Ok((q, k, v))
    }

    /// The fused QKV projection.
    #[must_use]
    pub fn projection(&self) -> &dyn Projection {
        self.c_attn.as_ref()
    }

    /// Whether the QKV projection carries a low-rank adaptation branch.
    #[must_use]
    pub fn is_adapted(&self) -> bool {
        self.c_attn.is_adapted()
    }

    /// Number of attention heads.
    #[must_use]
    pub fn n_head(&self) -> usize {
        self.n_head
    }

    /// Switch the block between training and inference mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the projection's merge transition fails.
    pub fn set_training(&mut self, training: bool) -> Result<()> {
        self.c_attn.set_training(training)?;
        self.c_proj.set_training(training)
    }

    /// Register the block's parameters under `prefix`.
    pub fn register_parameters(&self, prefix: &str, params: &mut ParamSet) {
        self.c_attn
            .register_parameters(&format!("{prefix}.c_attn"), params);
        self.c_proj
            .register_parameters(&format!("{prefix}.c_proj"), params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoraConfig;
    use crate::scope::{BaselineFactory, LoraFactory};

    fn test_config() -> AttentionConfig {
        AttentionConfig {
            n_embd: 8,
            n_head: 2,
            bias: false,
        }
    }

    #[test]
    fn test_invalid_head_count() {
        let config = AttentionConfig {
            n_embd: 10,
            n_head: 3,
            bias: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_factory_selects_variant() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = test_config();

        let baseline = CausalSelfAttention::with_factory(&config, &BaselineFactory, &device)?;
        assert!(!baseline.is_adapted());

        let factory = LoraFactory::new(LoraConfig {
            r: 2,
            alpha: 4.0,
            dropout: 0.0,
        });
        let adapted = CausalSelfAttention::with_factory(&config, &factory, &device)?;
        assert!(adapted.is_adapted());
        Ok(())
    }

    #[test]
    fn test_qkv_split_shapes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = test_config();
        let block = CausalSelfAttention::with_factory(&config, &BaselineFactory, &device)?;

        let xs = Tensor::rand(-1f32, 1f32, (2, 5, 8), &device)?;
        let (q, k, v) = block.qkv(&xs)?;
        assert_eq!(q.dims(), &[2, 5, 8]);
        assert_eq!(k.dims(), &[2, 5, 8]);
        assert_eq!(v.dims(), &[2, 5, 8]);
        Ok(())
    }

    #[test]
    fn test_registered_parameter_names() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = test_config();
        let factory = LoraFactory::new(LoraConfig {
            r: 2,
            alpha: 4.0,
            dropout: 0.0,
        });
        let block = CausalSelfAttention::with_factory(&config, &factory, &device)?;

        let mut params = ParamSet::new();
        block.register_parameters("h.0.attn", &mut params);
        let names: Vec<_> = params.iter().map(|(name, _)| name.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "h.0.attn.c_attn.lora_a",
                "h.0.attn.c_attn.lora_b",
                "h.0.attn.c_attn.weight",
                "h.0.attn.c_proj.weight",
            ]
        );
        Ok(())
    }
}
