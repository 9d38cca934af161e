//! Query-head reindexing for replicated KV heads.
//!
//! With `kv_size_multiplier > 1` every TP rank holds exactly one KV head:
//! the `num_key_value_heads` heads are tiled `kv_size_multiplier` times and
//! the tiled tensor is cut into `tp_size` contiguous blocks, so rank `r`
//! sees KV head `r % num_key_value_heads`.
//!
//! Query heads must follow their KV head. Splitting the `R = kv * m` query
//! groups (`H / R` heads each) into `G = tp_size / kv` interleaved sets
//! gives the rank order
//!
//! ```text
//! rank:   0     1     ..  kv-1      kv    kv+1  ..
//! group:  0     G     ..  (kv-1)G   1     G+1   ..
//! ```
//!
//! `o_proj` consumes the attention output in the same head order, so its
//! input dimension is permuted identically (transpose, permute, transpose
//! back). Merging applies the inverse permutation.

use tracing::warn;

use crate::config::{ConversionConfig, ModelShapeConfig};
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Splits and merges attention weights under KV-head replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GqaReindexer {
    num_attention_heads: usize,
    num_kv_heads: usize,
    kv_size_multiplier: usize,
    head_dim: usize,
    tp_size: usize,
}

impl GqaReindexer {
    /// # Errors
    /// Returns `ShapeMismatch` or `InvalidConfig` if the head counts do not
    /// satisfy the replication invariants for this TP degree.
    pub fn new(shape: &ModelShapeConfig, cfg: &ConversionConfig) -> Result<Self> {
        cfg.validate(shape)?;
        Ok(Self {
            num_attention_heads: shape.num_attention_heads,
            num_kv_heads: shape.num_kv_heads(),
            kv_size_multiplier: cfg.kv_size_multiplier,
            head_dim: shape.head_dim(),
            tp_size: cfg.tp_size,
        })
    }

    /// Number of replicated KV heads, which is also the number of query groups.
    fn num_groups(&self) -> usize {
        self.num_kv_heads * self.kv_size_multiplier
    }

    /// TP ranks sharing one distinct KV head.
    fn ranks_per_kv_head(&self) -> usize {
        self.tp_size / self.num_kv_heads
    }

    /// Rows of one query group (`H / R` heads of `head_dim` rows).
    fn group_rows(&self) -> usize {
        self.num_attention_heads / self.num_groups() * self.head_dim
    }

    /// For each output position, the source query group (split direction).
    fn interleaved_order(&self) -> Vec<usize> {
        let kv = self.num_kv_heads;
        let g = self.ranks_per_kv_head();
        (0..self.num_groups()).map(|p| (p % kv) * g + p / kv).collect()
    }

    /// Inverse of [`Self::interleaved_order`] (merge direction).
    fn canonical_order(&self) -> Vec<usize> {
        let kv = self.num_kv_heads;
        let g = self.ranks_per_kv_head();
        (0..self.num_groups()).map(|q| (q % g) * kv + q / g).collect()
    }

    /// Permute whole query groups of a `[H * head_dim, in]` tensor.
    fn permute_groups(&self, name: &str, w: &Tensor, order: &[usize]) -> Result<Tensor> {
        let &[rows, cols] = w.shape() else {
            return Err(Error::shape(name, w.shape(), "expected a 2D attention weight"));
        };
        let expected = self.num_attention_heads * self.head_dim;
        if rows != expected {
            return Err(Error::shape(
                name,
                w.shape(),
                format!(
                    "head dimension {rows} != num_attention_heads * head_dim ({expected})"
                ),
            ));
        }
        w.clone()
            .reshape(vec![self.num_groups(), self.group_rows(), cols])?
            .index_select(order)?
            .reshape(vec![rows, cols])
    }

    /// This rank's query rows, reordered to line up with its KV head.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `full` is not `[H * head_dim, in]`.
    pub fn split_q(&self, name: &str, full: &Tensor, tp_rank: usize) -> Result<Tensor> {
        let interleaved = self.permute_groups(name, full, &self.interleaved_order())?;
        let block = interleaved.dim(0)? / self.tp_size;
        interleaved.narrow(0, tp_rank * block, block)
    }

    /// Rebuild the full query weight from every rank's block, in rank order.
    ///
    /// # Errors
    /// Returns an error if the concatenated blocks are not `[H * head_dim, in]`.
    pub fn merge_q(&self, name: &str, parts: &[&Tensor]) -> Result<Tensor> {
        let interleaved = Tensor::cat(parts, 0)?;
        self.permute_groups(name, &interleaved, &self.canonical_order())
    }

    /// This rank's `o_proj` columns, permuted like the query heads.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `full` is not `[hidden, H * head_dim]`.
    pub fn split_o(&self, name: &str, full: &Tensor, tp_rank: usize) -> Result<Tensor> {
        self.split_q(name, &full.transpose_2d()?, tp_rank)?
            .transpose_2d()
    }

    /// Rebuild the full `o_proj` weight from every rank's columns.
    ///
    /// # Errors
    /// Returns an error if the concatenated columns are not `H * head_dim`.
    pub fn merge_o(&self, name: &str, parts: &[&Tensor]) -> Result<Tensor> {
        let full_t = Tensor::cat(parts, 1)?.transpose_2d()?;
        self.permute_groups(name, &full_t, &self.canonical_order())?
            .transpose_2d()
    }

    /// Tile K or V `kv_size_multiplier` times along dim 0.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `full` is not `[kv * head_dim, in]`.
    pub fn replicate_kv(&self, name: &str, full: &Tensor) -> Result<Tensor> {
        let expected = self.num_kv_heads * self.head_dim;
        if full.shape().len() != 2 || full.shape()[0] != expected {
            return Err(Error::shape(
                name,
                full.shape(),
                format!("expected {expected} rows (num_key_value_heads * head_dim)"),
            ));
        }
        full.repeat_dim0(self.kv_size_multiplier)
    }

    /// This rank's block of the replicated K or V weight.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the replicated rows do not divide by `tp_size`.
    pub fn split_kv(&self, name: &str, full: &Tensor, tp_rank: usize) -> Result<Tensor> {
        let repeated = self.replicate_kv(name, full)?;
        let rows = repeated.dim(0)?;
        if rows % self.tp_size != 0 {
            return Err(Error::shape(
                name,
                full.shape(),
                format!(
                    "{rows} rows after KV replication are not divisible by tp_size {}",
                    self.tp_size
                ),
            ));
        }
        let block = rows / self.tp_size;
        repeated.narrow(0, tp_rank * block, block)
    }

    /// Rebuild K or V from every rank's block, keeping the first replica.
    ///
    /// # Errors
    /// Returns an error if the concatenated rows do not split into
    /// `kv_size_multiplier` replicas.
    pub fn merge_kv(&self, name: &str, parts: &[&Tensor]) -> Result<Tensor> {
        let repeated = Tensor::cat(parts, 0)?;
        let mut replicas = repeated.chunk(self.kv_size_multiplier, 0)?;
        if !replicas.windows(2).all(|w| w[0] == w[1]) {
            warn!(
                weight = name,
                kv_size_multiplier = self.kv_size_multiplier,
                "KV replicas differ across ranks, keeping the first"
            );
        }
        Ok(replicas.swap_remove(0))
    }

    /// Whether every replica inside a replicated K/V tensor is bit-identical.
    ///
    /// # Errors
    /// Returns an error if the rows do not split into `kv_size_multiplier` parts.
    pub fn replicas_identical(&self, repeated: &Tensor) -> Result<bool> {
        let replicas = repeated.chunk(self.kv_size_multiplier, 0)?;
        Ok(replicas.windows(2).all(|w| w[0] == w[1]))
    }
}
