//! # lora-rs
//!
//! Partitioned Low-Rank Adaptation (LoRA) for fused attention projections.
//!
//! LoRA freezes a pretrained weight matrix and learns a low-rank additive
//! update `ΔW = B @ A` instead, reducing the number of trainable parameters
//! drastically. This crate provides the fused projection layer used for
//! multi-head attention, where query, key and value are computed by a single
//! matrix and the adaptation applies to a configurable subset of the output
//! partitions:
//!
//! - [`MergedLinear`]: frozen dense projection plus per-partition low-rank
//!   branches, with in-place merge/unmerge of the update for inference-speed
//!   parity.
//! - [`FrozenLinear`]: the baseline sibling without an adaptation branch.
//! - [`mark_only_lora_as_trainable`] / [`lora_state_dict`]: trainability and
//!   checkpoint filtering over role-tagged parameters.
//! - [`ProjectionFactory`] and [`LoraScope`]: select the projection variant
//!   during model construction, by injection or through a scoped guard.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use candle_core::{Device, Tensor};
//! use lora_rs::{LoraConfig, MergedLinear, MergedLinearConfig};
//!
//! let config = MergedLinearConfig {
//!     lora: LoraConfig { r: 8, alpha: 16.0, dropout: 0.0 },
//!     enable_lora: vec![true, false, true],
//!     ..Default::default()
//! };
//! let mut layer = MergedLinear::new(768, 3 * 768, config, &Device::Cpu)?;
//!
//! let input = Tensor::randn(0f32, 1f32, (1, 10, 768), &Device::Cpu)?;
//! let output = layer.forward(&input)?;
//!
//! // Fold the update into the frozen weight for inference.
//! layer.set_training(false)?;
//! ```
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod attention;
pub mod config;
pub mod error;
pub mod layers;
pub mod params;
pub mod scope;
pub mod traits;

pub use attention::{AttentionConfig, CausalSelfAttention};
pub use config::LoraConfig;
pub use error::{LoraError, Result};
pub use layers::{FrozenLinear, LoraState, MergedLinear, MergedLinearConfig};
pub use params::{
    lora_state_dict, mark_only_lora_as_trainable, BiasMode, ParamEntry, ParamRole, ParamSet,
};
pub use scope::{active_config, current_factory, BaselineFactory, LoraFactory, LoraScope, ProjectionFactory};
pub use traits::Projection;
