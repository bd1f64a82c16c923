//! Parameter enumeration, trainability marking and checkpoint filtering.
//!
//! Layers register their parameters here under dotted names together with a
//! typed [`ParamRole`]; the filters query the role structurally instead of
//! matching name substrings.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{LoraError, Result};

/// Role of a registered parameter, assigned at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Dense projection weight.
    Weight,
    /// Bias vector.
    Bias,
    /// Low-rank down-projection factor.
    LoraA,
    /// Low-rank up-projection factor.
    LoraB,
}

impl ParamRole {
    /// Whether this role is one of the trainable low-rank factors.
    #[must_use]
    pub fn is_lora_factor(self) -> bool {
        matches!(self, Self::LoraA | Self::LoraB)
    }
}

/// A registered parameter: tensor, role and trainable flag.
#[derive(Debug, Clone)]
pub struct ParamEntry {
    tensor: Tensor,
    role: ParamRole,
    trainable: bool,
}

impl ParamEntry {
    /// The parameter tensor.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// The parameter role.
    #[must_use]
    pub fn role(&self) -> ParamRole {
        self.role
    }

    /// Whether the parameter receives gradient updates.
    #[must_use]
    pub fn trainable(&self) -> bool {
        self.trainable
    }
}

/// Ordered map from dotted parameter name to [`ParamEntry`].
#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    entries: BTreeMap<String, ParamEntry>,
}

impl ParamSet {
    /// Create an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under `name`.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor,
        role: ParamRole,
        trainable: bool,
    ) {
        self.entries.insert(
            name.into(),
            ParamEntry {
                tensor,
                role,
                trainable,
            },
        );
    }

    /// Look up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.get(name)
    }

    /// Iterate over `(name, entry)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Number of registered parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no parameters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of elements across all trainable parameters.
    #[must_use]
    pub fn num_trainable(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.trainable)
            .map(|entry| entry.tensor.elem_count())
            .sum()
    }
}

/// Bias handling policy for the trainability and checkpoint filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasMode {
    /// Biases stay frozen and are not checkpointed.
    None,
    /// Every bias is trainable and checkpointed.
    All,
    /// Only biases of layers that carry low-rank factors.
    LoraOnly,
}

impl FromStr for BiasMode {
    type Err = LoraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            "lora_only" => Ok(Self::LoraOnly),
            other => Err(LoraError::InvalidConfig(format!(
                "unknown bias mode '{other}', expected one of none, all, lora_only"
            ))),
        }
    }
}

/// The dotted-name prefix identifying the layer that owns a parameter.
fn owner_prefix(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(prefix, _)| prefix)
}

/// Layers that registered at least one low-rank factor.
fn lora_owners(params: &ParamSet) -> BTreeSet<String> {
    params
        .iter()
        .filter(|(_, entry)| entry.role.is_lora_factor())
        .map(|(name, _)| owner_prefix(name).to_string())
        .collect()
}

/// Freeze every parameter that is not a low-rank factor, then unfreeze
/// biases according to `bias`.
pub fn mark_only_lora_as_trainable(params: &mut ParamSet, bias: BiasMode) {
    for entry in params.entries.values_mut() {
        if !entry.role.is_lora_factor() {
            entry.trainable = false;
        }
    }
    match bias {
        BiasMode::None => {}
        BiasMode::All => {
            for entry in params.entries.values_mut() {
                if entry.role == ParamRole::Bias {
                    entry.trainable = true;
                }
            }
        }
        BiasMode::LoraOnly => {
            let owners = lora_owners(params);
            for (name, entry) in &mut params.entries {
                if entry.role == ParamRole::Bias && owners.contains(owner_prefix(name)) {
                    entry.trainable = true;
                }
            }
        }
    }
}

/// Select the snapshot entries worth persisting: the low-rank factors, plus
/// biases according to `bias`.
///
/// A pure, read-only projection; the host's own save mechanism owns the
/// persistence format.
#[must_use]
pub fn lora_state_dict(params: &ParamSet, bias: BiasMode) -> BTreeMap<String, Tensor> {
    let mut selected = BTreeMap::new();
    for (name, entry) in params.iter() {
        if entry.role.is_lora_factor() {
            selected.insert(name.to_string(), entry.tensor.clone());
        }
    }
    match bias {
        BiasMode::None => {}
        BiasMode::All => {
            for (name, entry) in params.iter() {
                if entry.role == ParamRole::Bias {
                    selected.insert(name.to_string(), entry.tensor.clone());
                }
            }
        }
        BiasMode::LoraOnly => {
            let owners = lora_owners(params);
            for (name, entry) in params.iter() {
                if entry.role == ParamRole::Bias && owners.contains(owner_prefix(name)) {
                    selected.insert(name.to_string(), entry.tensor.clone());
                }
            }
        }
    }
    selected
}
