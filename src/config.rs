//! Configuration types for low-rank adaptation.

use serde::{Deserialize, Serialize};

use crate::error::{LoraError, Result};

/// Hyperparameters shared by every adapted projection.
///
/// A rank of zero is legal and means "no adaptation": a layer constructed with
/// `r == 0` degenerates to a plain frozen projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator; updates are scaled by `alpha / r`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Dropout probability applied to the low-rank branch input during training.
    #[serde(default)]
    pub dropout: f32,
}

fn default_alpha() -> f64 {
    1.0
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 0,
            alpha: 1.0,
            dropout: 0.0,
        }
    }
}

impl LoraConfig {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if `alpha` is not positive or `dropout` lies outside
    /// `[0, 1)`.
    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(LoraError::InvalidConfig("alpha must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LoraError::InvalidConfig(
                "dropout must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}
