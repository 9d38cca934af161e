//! Weight classification by name
//!
//! Every weight in a checkpoint is classified exactly once. Rules are
//! substring matches checked in a fixed priority order; the first match
//! wins. Names matching no rule are rejected rather than guessed.

use crate::shard::ShardStrategy;
use crate::{Error, Result};

/// What a weight is, which fixes how it is sliced across TP ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeightCategory {
    /// `embed_tokens`: vocab-parallel embedding.
    Embedding,
    /// Query projection (`q_proj` or `qkv_proj.weight_q`).
    QkvQ,
    /// Key projection (`k_proj` or `qkv_proj.weight_k`).
    QkvK,
    /// Value projection (`v_proj` or `qkv_proj.weight_v`).
    QkvV,
    /// Coalesced `qkv_proj.weight` with rank-major `[q; k; v]` blocks.
    QkvFused,
    /// Attention output projection.
    OProj,
    /// MLP gate projection.
    GateProj,
    /// MLP up projection.
    UpProj,
    /// Per-rank `[gate; up]` fused projection.
    GateUpFused,
    /// MLP down projection.
    DownProj,
    /// Output head.
    LmHead,
    /// Norms, rotary buffers and biases: copied verbatim.
    Unpartitioned,
}

impl WeightCategory {
    /// How weights of this category are laid out across TP ranks.
    #[must_use]
    pub const fn strategy(self) -> ShardStrategy {
        match self {
            Self::Embedding
            | Self::LmHead
            | Self::QkvQ
            | Self::QkvK
            | Self::QkvV
            | Self::QkvFused
            | Self::GateProj
            | Self::UpProj
            | Self::GateUpFused => ShardStrategy::Column,
            Self::OProj | Self::DownProj => ShardStrategy::Row,
            Self::Unpartitioned => ShardStrategy::Replicate,
        }
    }

    /// The TP partition dimension, `None` for unpartitioned weights.
    #[must_use]
    pub const fn partition_dim(self) -> Option<usize> {
        self.strategy().partition_dim()
    }

    /// Whether this is one of the attention q/k/v weights.
    #[must_use]
    pub const fn is_qkv(self) -> bool {
        matches!(self, Self::QkvQ | Self::QkvK | Self::QkvV | Self::QkvFused)
    }
}

/// Substrings marking weights that are never tensor-parallel.
const UNPARTITIONED_MARKERS: &[&str] = &["norm", "rotary_emb", "inv_freq", ".bias"];

/// Classify a weight by name.
///
/// # Errors
/// Returns `UnknownWeightKey` if no rule matches.
pub fn classify(name: &str) -> Result<WeightCategory> {
    if name.contains("embed_tokens") {
        return Ok(WeightCategory::Embedding);
    }
    if name.contains("lm_head") {
        return Ok(WeightCategory::LmHead);
    }

    // `qkv_proj` contains `v_proj`, so the fused name is checked first.
    if name.contains("qkv_proj") {
        return Ok(if name.ends_with("weight_q") {
            WeightCategory::QkvQ
        } else if name.ends_with("weight_k") {
            WeightCategory::QkvK
        } else if name.ends_with("weight_v") {
            WeightCategory::QkvV
        } else {
            WeightCategory::QkvFused
        });
    }
    if name.contains("q_proj") {
        return Ok(WeightCategory::QkvQ);
    }
    if name.contains("k_proj") {
        return Ok(WeightCategory::QkvK);
    }
    if name.contains("v_proj") {
        return Ok(WeightCategory::QkvV);
    }

    // Likewise `gate_up_proj` contains `up_proj`.
    if name.contains("gate_up_proj") {
        return Ok(WeightCategory::GateUpFused);
    }
    if name.contains("gate_proj") {
        return Ok(WeightCategory::GateProj);
    }
    if name.contains("up_proj") {
        return Ok(WeightCategory::UpProj);
    }
    if name.contains("down_proj") {
        return Ok(WeightCategory::DownProj);
    }
    if name.contains("o_proj") {
        return Ok(WeightCategory::OProj);
    }

    if UNPARTITIONED_MARKERS.iter().any(|m| name.contains(m)) {
        return Ok(WeightCategory::Unpartitioned);
    }

    Err(Error::UnknownWeightKey(name.to_string()))
}
