//! Model shape and conversion configuration

use serde::Deserialize;
use std::path::Path;

use crate::{Error, Result};

/// Attention and depth dimensions of the model being converted.
///
/// Parsed from the model's `config.json`; any other keys in the file are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelShapeConfig {
    /// Number of attention (query) heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (defaults to `num_attention_heads`)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,
}

impl ModelShapeConfig {
    #[must_use]
    pub fn new(
        num_attention_heads: usize,
        num_key_value_heads: usize,
        hidden_size: usize,
        num_hidden_layers: usize,
    ) -> Self {
        Self {
            num_attention_heads,
            num_key_value_heads: Some(num_key_value_heads),
            hidden_size,
            num_hidden_layers,
        }
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Number of key-value heads
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Per-head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Whether query heads share key-value heads
    #[must_use]
    pub fn is_gqa(&self) -> bool {
        self.num_attention_heads != self.num_kv_heads()
    }
}

/// How tensors that are not tensor-parallel (norms, rotary buffers, biases)
/// are reduced when the same name arrives from several ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnpartitionedPolicy {
    /// Keep the copy from the lowest `(pp_rank, tp_rank)`.
    #[default]
    First,
    /// Element-wise mean over all copies (float dtypes only).
    Average,
}

/// Parallel layout of the sharded checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionConfig {
    /// Tensor-parallel degree
    pub tp_size: usize,
    /// Pipeline-parallel degree
    pub pp_size: usize,
    /// Virtual pipeline stages per physical pipeline rank
    pub virtual_pp_size: usize,
    /// Factor by which KV heads are replicated across TP ranks
    pub kv_size_multiplier: usize,
    /// Attention uses the fused GQA QKV linear (`qkv_proj.weight_{q,k,v}` keys)
    pub qkv_linear: bool,
    /// Fuse separate q/k/v weights into one `qkv_proj.weight` before splitting
    pub coalesce_qkv: bool,
    /// Store sharded gate/up projections as one `gate_up_proj` tensor
    pub fuse_gate_up: bool,
    /// Reduction for replicated tensors when merging
    pub unpartitioned_policy: UnpartitionedPolicy,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            tp_size: 1,
            pp_size: 1,
            virtual_pp_size: 1,
            kv_size_multiplier: 1,
            qkv_linear: false,
            coalesce_qkv: false,
            fuse_gate_up: true,
            unpartitioned_policy: UnpartitionedPolicy::First,
        }
    }
}

impl ConversionConfig {
    /// Whether KV heads are replicated, which turns on GQA head reindexing.
    #[must_use]
    pub fn replicates_kv(&self) -> bool {
        self.kv_size_multiplier > 1
    }

    /// Total number of pipeline stages, counting virtual stages.
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.pp_size * self.virtual_pp_size
    }

    /// Check every layout invariant against the model shape.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for zero degrees or incompatible flags, and
    /// `ShapeMismatch` when a model dimension does not divide as required.
    pub fn validate(&self, shape: &ModelShapeConfig) -> Result<()> {
        for (flag, value) in [
            ("tp_size", self.tp_size),
            ("pp_size", self.pp_size),
            ("virtual_pp_size", self.virtual_pp_size),
            ("kv_size_multiplier", self.kv_size_multiplier),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{flag} must be at least 1")));
            }
        }

        let heads = shape.num_attention_heads;
        let kv_heads = shape.num_kv_heads();
        let dims = [heads, kv_heads, shape.hidden_size];
        let check = |ok: bool, reason: String| {
            if ok {
                Ok(())
            } else {
                Err(Error::shape("config.json", &dims, reason))
            }
        };

        check(
            heads > 0 && kv_heads > 0,
            "head counts must be non-zero".into(),
        )?;
        check(
            shape.hidden_size % heads == 0,
            format!("hidden_size is not divisible by num_attention_heads {heads}"),
        )?;
        check(
            shape.hidden_size % self.tp_size == 0,
            format!("hidden_size is not divisible by tp_size {}", self.tp_size),
        )?;
        check(
            heads % kv_heads == 0,
            format!("num_attention_heads is not divisible by num_key_value_heads {kv_heads}"),
        )?;

        if self.replicates_kv() {
            let replicated = kv_heads * self.kv_size_multiplier;
            check(
                self.tp_size % kv_heads == 0,
                format!(
                    "tp_size {} is not divisible by num_key_value_heads {kv_heads}",
                    self.tp_size
                ),
            )?;
            check(
                heads % replicated == 0,
                format!(
                    "num_attention_heads is not divisible by num_key_value_heads * kv_size_multiplier ({replicated})"
                ),
            )?;
            // Each rank owns exactly one replicated KV head and its query group.
            check(
                replicated == self.tp_size,
                format!(
                    "num_key_value_heads * kv_size_multiplier ({replicated}) must equal tp_size {}",
                    self.tp_size
                ),
            )?;
        }

        if self.coalesce_qkv {
            if self.qkv_linear || self.replicates_kv() {
                return Err(Error::InvalidConfig(
                    "coalesce_qkv cannot be combined with qkv_linear or kv_size_multiplier > 1"
                        .into(),
                ));
            }
            check(
                !shape.is_gqa(),
                "coalesce_qkv requires num_key_value_heads == num_attention_heads".into(),
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ModelShapeConfig {
        ModelShapeConfig::new(8, 2, 512, 4)
    }

    #[test]
    fn test_config_from_json_ignores_extra_keys() {
        let json = r#"{
            "vocab_size": 32000,
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "rope_theta": 500000.0
        }"#;
        let config: ModelShapeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_kv_heads(), 8);
        assert_eq!(config.head_dim(), 128);
        assert!(config.is_gqa());
    }

    #[test]
    fn test_config_kv_heads_default() {
        let json = r#"{
            "hidden_size": 2048,
            "num_hidden_layers": 22,
            "num_attention_heads": 32
        }"#;
        let config: ModelShapeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_kv_heads(), 32);
        assert!(!config.is_gqa());
    }

    #[test]
    fn test_validate_gqa_replication() {
        let cfg = ConversionConfig {
            tp_size: 4,
            kv_size_multiplier: 2,
            qkv_linear: true,
            ..ConversionConfig::default()
        };
        cfg.validate(&shape()).unwrap();
    }

    #[test]
    fn test_validate_rejects_replication_not_matching_tp() {
        let cfg = ConversionConfig {
            tp_size: 8,
            kv_size_multiplier: 2,
            ..ConversionConfig::default()
        };
        assert!(matches!(
            cfg.validate(&shape()),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_tp_not_multiple_of_kv_heads() {
        let cfg = ConversionConfig {
            tp_size: 3,
            kv_size_multiplier: 2,
            ..ConversionConfig::default()
        };
        let shape = ModelShapeConfig::new(12, 2, 768, 2);
        assert!(matches!(
            cfg.validate(&shape),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_hidden_divisible_by_tp() {
        let cfg = ConversionConfig {
            tp_size: 3,
            ..ConversionConfig::default()
        };
        assert!(cfg.validate(&shape()).is_err());
    }

    #[test]
    fn test_validate_zero_degree() {
        let cfg = ConversionConfig {
            pp_size: 0,
            ..ConversionConfig::default()
        };
        assert!(matches!(
            cfg.validate(&shape()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_coalesce_rules() {
        let cfg = ConversionConfig {
            tp_size: 2,
            coalesce_qkv: true,
            ..ConversionConfig::default()
        };
        cfg.validate(&ModelShapeConfig::new(8, 8, 512, 2)).unwrap();
        assert!(cfg.validate(&shape()).is_err());

        let with_linear = ConversionConfig {
            qkv_linear: true,
            ..cfg
        };
        assert!(matches!(
            with_linear.validate(&ModelShapeConfig::new(8, 8, 512, 2)),
            Err(Error::InvalidConfig(_))
        ));
    }
}
