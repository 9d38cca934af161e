//! Tensor parallelism slicing primitives
//!
//! Describes one rank's position in a tensor-parallel group and how a
//! weight is cut along its partition dimension.

use crate::tensor::Tensor;
use crate::{Error, Result};

/// A rank's position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This rank (`0..world_size`)
    pub rank: usize,
    /// Tensor-parallel degree
    pub world_size: usize,
}

impl ShardConfig {
    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` naming `name` if `dim` is not evenly
    /// divisible by `world_size`.
    pub fn shard_range(&self, name: &str, shape: &[usize], dim: usize) -> Result<(usize, usize)> {
        if dim % self.world_size != 0 {
            return Err(Error::shape(
                name,
                shape,
                format!(
                    "dimension {dim} is not evenly divisible by tp_size {}",
                    self.world_size
                ),
            ));
        }
        let shard_size = dim / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }

    /// Cut this rank's contiguous block out of `tensor` along `strategy`'s
    /// partition dimension. Replicated tensors are copied whole.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the partition dimension is missing or
    /// not divisible by the world size.
    pub fn slice(&self, name: &str, tensor: &Tensor, strategy: ShardStrategy) -> Result<Tensor> {
        let Some(dim) = strategy.partition_dim() else {
            return Ok(tensor.clone());
        };
        let size = tensor
            .dim(dim)
            .map_err(|e| Error::shape(name, tensor.shape(), e.to_string()))?;
        let (start, len) = self.shard_range(name, tensor.shape(), size)?;
        tensor.narrow(dim, start, len)
    }
}

/// How a weight tensor is laid out across tensor-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Identical full copy on every rank (norms, rotary buffers).
    Replicate,
    /// Column-parallel: split along the output dimension (rows of the weight
    /// matrix). Each rank gets rows `[rank*N/tp .. (rank+1)*N/tp]`.
    /// Used for embeddings, `lm_head`, q/k/v, gate and up projections.
    Column,
    /// Row-parallel: split along the input dimension (columns of the weight
    /// matrix). Used for `o_proj` and `down_proj`.
    Row,
}

impl ShardStrategy {
    /// The tensor dimension this strategy partitions, if any.
    #[must_use]
    pub const fn partition_dim(self) -> Option<usize> {
        match self {
            Self::Replicate => None,
            Self::Column => Some(0),
            Self::Row => Some(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_range() {
        let shard = ShardConfig {
            rank: 0,
            world_size: 4,
        };
        assert_eq!(shard.shard_range("w", &[128], 128).unwrap(), (0, 32));

        let shard = ShardConfig {
            rank: 3,
            world_size: 4,
        };
        assert_eq!(shard.shard_range("w", &[128], 128).unwrap(), (96, 32));
    }

    #[test]
    fn test_shard_range_indivisible() {
        let shard = ShardConfig {
            rank: 0,
            world_size: 3,
        };
        let err = shard
            .shard_range("model.embed_tokens.weight", &[128, 8], 128)
            .unwrap_err();
        assert!(err.to_string().contains("model.embed_tokens.weight"));
    }

    #[test]
    fn test_slice_row_and_column() {
        let data: Vec<f32> = (0..16u8).map(f32::from).collect();
        let t = Tensor::from_slice(&[4, 4], &data).unwrap();
        let shard = ShardConfig {
            rank: 1,
            world_size: 2,
        };

        let col = shard.slice("w", &t, ShardStrategy::Column).unwrap();
        assert_eq!(col, t.narrow(0, 2, 2).unwrap());

        let row = shard.slice("w", &t, ShardStrategy::Row).unwrap();
        assert_eq!(row, t.narrow(1, 2, 2).unwrap());

        let rep = shard.slice("w", &t, ShardStrategy::Replicate).unwrap();
        assert_eq!(rep, t);
    }

    #[test]
    fn test_slice_row_on_1d_is_shape_error() {
        let t = Tensor::from_slice(&[4], &[0.0f32; 4]).unwrap();
        let shard = ShardConfig {
            rank: 0,
            world_size: 2,
        };
        assert!(matches!(
            shard.slice("model.layers.0.self_attn.o_proj.bias", &t, ShardStrategy::Row),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
