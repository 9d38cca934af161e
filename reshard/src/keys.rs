//! Weight key naming
//!
//! Full checkpoints use per-projection names (`q_proj.weight`). Sharded
//! checkpoints built for the GQA QKV linear module store the same weights
//! under `qkv_proj.weight_{q,k,v}`, and MLP gate/up shards may be fused
//! under `gate_up_proj`. [`WeightKeyMapper`] translates in both directions.

use crate::category::{classify, WeightCategory};
use crate::config::ConversionConfig;
use crate::{Error, Result};

/// `(full suffix, sharded suffix)` pairs for the GQA QKV linear layout.
const QKV_LINEAR_KEYS: &[(&str, &str)] = &[
    ("q_proj.weight", "qkv_proj.weight_q"),
    ("k_proj.weight", "qkv_proj.weight_k"),
    ("v_proj.weight", "qkv_proj.weight_v"),
];

/// Naming of attention projections in sharded checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// Same names as the full checkpoint.
    Separate,
    /// `qkv_proj.weight_{q,k,v}` names of the GQA QKV linear module.
    QkvLinear,
}

/// Translates between full-checkpoint and sharded-checkpoint weight names.
#[derive(Debug, Clone, Copy)]
pub struct WeightKeyMapper {
    layout: KeyLayout,
}

impl WeightKeyMapper {
    /// Pick the layout implied by the conversion flags.
    #[must_use]
    pub fn new(cfg: &ConversionConfig) -> Self {
        let layout = if cfg.qkv_linear || cfg.replicates_kv() {
            KeyLayout::QkvLinear
        } else {
            KeyLayout::Separate
        };
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    /// Name a full-checkpoint weight takes in a sharded checkpoint.
    ///
    /// # Errors
    /// Returns `UnknownWeightKey` for a q/k/v weight the layout has no
    /// mapping for (e.g. a bias under the QKV linear layout).
    pub fn to_sharded(&self, name: &str) -> Result<String> {
        self.rename(name, |(full, sharded)| (full, sharded))
    }

    /// Name a sharded-checkpoint weight takes in the full checkpoint.
    ///
    /// # Errors
    /// Returns `UnknownWeightKey` for an unmappable q/k/v weight.
    pub fn to_full(&self, name: &str) -> Result<String> {
        self.rename(name, |(full, sharded)| (sharded, full))
    }

    fn rename(
        &self,
        name: &str,
        direction: impl Fn((&'static str, &'static str)) -> (&'static str, &'static str),
    ) -> Result<String> {
        if self.layout == KeyLayout::Separate {
            return Ok(name.to_string());
        }
        let category = classify(name)?;
        if !category.is_qkv() || category == WeightCategory::QkvFused {
            return Ok(name.to_string());
        }
        for &pair in QKV_LINEAR_KEYS {
            let (from, to) = direction(pair);
            if let Some(prefix) = name.strip_suffix(from) {
                if prefix.is_empty() || prefix.ends_with('.') {
                    return Ok(format!("{prefix}{to}"));
                }
            }
        }
        Err(Error::UnknownWeightKey(name.to_string()))
    }
}

/// Name of the fused `gate_up_proj` tensor holding a gate or up shard.
#[must_use]
pub fn fused_gate_up_key(name: &str) -> String {
    if name.contains("gate_proj") {
        name.replacen("gate_proj", "gate_up_proj", 1)
    } else {
        name.replacen("up_proj", "gate_up_proj", 1)
    }
}

/// `(gate, up)` names for a fused `gate_up_proj` key.
#[must_use]
pub fn unfused_gate_up_keys(name: &str) -> (String, String) {
    (
        name.replacen("gate_up_proj", "gate_proj", 1),
        name.replacen("gate_up_proj", "up_proj", 1),
    )
}

/// `[q, k, v]` names for a coalesced `qkv_proj` key.
#[must_use]
pub fn unfused_qkv_keys(name: &str) -> [String; 3] {
    ["q", "k", "v"].map(|p| name.replacen("qkv_proj", &format!("{p}_proj"), 1))
}

/// Decoder layer index of a `model.layers.{i}.…` weight.
#[must_use]
pub fn layer_index(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("model.layers.")?;
    let idx = rest.split('.').next()?;
    idx.parse().ok()
}
