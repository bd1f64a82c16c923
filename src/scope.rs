//! Projection selection: factories and the scoped activation guard.
//!
//! The primary mechanism is dependency injection: model-construction code
//! takes a [`ProjectionFactory`] and the two sibling factories decide which
//! [`Projection`] variant every attention block gets. [`LoraScope`] is the
//! thin scoped convenience on top: it installs a [`LoraConfig`] in a
//! process-wide slot for the duration of model construction and restores the
//! previous value when dropped, including during unwinding.

use std::sync::Mutex;

use candle_core::Device;

use crate::config::LoraConfig;
use crate::layers::{FrozenLinear, MergedLinear, MergedLinearConfig};
use crate::traits::Projection;
use crate::Result;

/// Builds the fused attention projection for a block under construction.
pub trait ProjectionFactory: Send + Sync {
    /// Build a projection of the given dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if layer construction fails.
    fn build(
        &self,
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: &Device,
    ) -> Result<Box<dyn Projection>>;
}

/// Factory for the baseline, non-adapted projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineFactory;

impl ProjectionFactory for BaselineFactory {
    fn build(
        &self,
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: &Device,
    ) -> Result<Box<dyn Projection>> {
        Ok(Box::new(FrozenLinear::new(
            in_features,
            out_features,
            bias,
            device,
        )?))
    }
}

/// Factory for the low-rank adapted projection.
#[derive(Debug, Clone)]
pub struct LoraFactory {
    config: LoraConfig,
    enable_lora: Vec<bool>,
}

impl LoraFactory {
    /// Create a factory adapting the query and value slices of a fused QKV
    /// projection, the usual LoRA target selection.
    #[must_use]
    pub fn new(config: LoraConfig) -> Self {
        Self::with_partitions(config, vec![true, false, true])
    }

    /// Create a factory with an explicit partition pattern.
    #[must_use]
    pub fn with_partitions(config: LoraConfig, enable_lora: Vec<bool>) -> Self {
        Self {
            config,
            enable_lora,
        }
    }
}

impl ProjectionFactory for LoraFactory {
    fn build(
        &self,
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: &Device,
    ) -> Result<Box<dyn Projection>> {
        let config = MergedLinearConfig {
            lora: self.config.clone(),
            enable_lora: self.enable_lora.clone(),
            fan_in_fan_out: false,
            merge_weights: true,
            bias,
        };
        Ok(Box::new(MergedLinear::new(
            in_features,
            out_features,
            config,
            device,
        )?))
    }
}

/// The process-wide configuration slot read during model construction.
static ACTIVE_CONFIG: Mutex<Option<LoraConfig>> = Mutex::new(None);

fn slot() -> std::sync::MutexGuard<'static, Option<LoraConfig>> {
    // A poisoned slot only means a panic elsewhere mid-scope; the value
    // itself is still well-formed.
    ACTIVE_CONFIG
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The configuration installed by the innermost active [`LoraScope`], if any.
#[must_use]
pub fn active_config() -> Option<LoraConfig> {
    slot().clone()
}

/// The factory matching the current scope state: a [`LoraFactory`] while a
/// scope is active, a [`BaselineFactory`] otherwise.
#[must_use]
pub fn current_factory() -> Box<dyn ProjectionFactory> {
    match active_config() {
        Some(config) => Box::new(LoraFactory::new(config)),
        None => Box::new(BaselineFactory),
    }
}

/// Guard that keeps a [`LoraConfig`] active for the duration of model
/// construction.
///
/// Dropping the guard restores the previously installed value
/// unconditionally, so the slot is clean even when construction code
/// panics. At most one scope may be active at a time per process; callers
/// serialize scope usage.
#[must_use = "the scope deactivates when the guard is dropped"]
pub struct LoraScope {
    previous: Option<LoraConfig>,
    enabled: bool,
}

impl LoraScope {
    /// Activate `config` for every attention block constructed while the
    /// guard lives.
    pub fn enter(config: LoraConfig) -> Self {
        let previous = slot().replace(config);
        Self {
            previous,
            enabled: true,
        }
    }

    /// A pass-through scope: construction proceeds with the baseline
    /// projection as if no scope existed.
    pub fn disabled() -> Self {
        Self {
            previous: None,
            enabled: false,
        }
    }
}

impl Drop for LoraScope {
    fn drop(&mut self) {
        if self.enabled {
            *slot() = self.previous.take();
        }
    }
}
