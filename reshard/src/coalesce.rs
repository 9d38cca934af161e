//! Fusing separate q/k/v weights into one column-parallel `qkv_proj`.
//!
//! The fused tensor is laid out rank-major, `[q_0; k_0; v_0; q_1; k_1; v_1; …]`
//! where `x_r` is rank `r`'s contiguous block of `x`. A plain column split of
//! the fused tensor then hands each rank its own `[q_r; k_r; v_r]`.

use tracing::debug;

use crate::config::ModelShapeConfig;
use crate::keys::unfused_qkv_keys;
use crate::state::FullState;
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Replace every layer's `q_proj`/`k_proj`/`v_proj` weights with one
/// rank-major `qkv_proj.weight`.
///
/// # Errors
/// Returns `WeightNotFound` if a layer lacks one of the projections and
/// `ShapeMismatch` if a projection's rows do not divide by `tp_size`.
pub fn coalesce_qkv(
    mut full: FullState,
    shape: &ModelShapeConfig,
    tp_size: usize,
) -> Result<FullState> {
    let partition_size = shape.hidden_size / tp_size;

    for layer in 0..shape.num_hidden_layers {
        let fused_name = format!("model.layers.{layer}.self_attn.qkv_proj.weight");
        let mut projections = Vec::with_capacity(3);
        for name in unfused_qkv_keys(&fused_name) {
            let tensor = full
                .remove(&name)
                .ok_or_else(|| Error::WeightNotFound(name.clone()))?;
            if tensor.dim(0)? != partition_size * tp_size {
                return Err(Error::shape(
                    &name,
                    tensor.shape(),
                    format!("expected hidden_size {} rows", shape.hidden_size),
                ));
            }
            projections.push(tensor);
        }

        let mut blocks = Vec::with_capacity(3 * tp_size);
        for rank in 0..tp_size {
            for projection in &projections {
                blocks.push(projection.narrow(0, rank * partition_size, partition_size)?);
            }
        }
        let refs: Vec<&Tensor> = blocks.iter().collect();
        let fused = Tensor::cat(&refs, 0)?;
        debug!(weight = %fused_name, shape = ?fused.shape(), "coalesced q/k/v");
        full.insert(fused_name, fused);
    }

    Ok(full)
}

/// Cut one rank's `[q_r; k_r; v_r]` block back into its three projections.
///
/// # Errors
/// Returns `ShapeMismatch` if the block is not `3 * hidden_size / tp_size` rows.
pub fn split_coalesced_block(
    name: &str,
    block: &Tensor,
    shape: &ModelShapeConfig,
    tp_size: usize,
) -> Result<[Tensor; 3]> {
    let partition_size = shape.hidden_size / tp_size;
    if block.dim(0)? != 3 * partition_size {
        return Err(Error::shape(
            name,
            block.shape(),
            format!("expected 3 x {partition_size} rows of fused q/k/v"),
        ));
    }
    let mut parts = block.chunk(3, 0)?.into_iter();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(q), Some(k), Some(v)) => Ok([q, k, v]),
        _ => Err(Error::shape(name, block.shape(), "fused q/k/v split failed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(rows: usize, cols: usize, value: f32) -> Tensor {
        Tensor::from_slice(&[rows, cols], &vec![value; rows * cols]).unwrap()
    }

    fn state() -> FullState {
        let mut full = FullState::new();
        for (proj, value) in [("q", 1.0), ("k", 2.0), ("v", 3.0)] {
            full.insert(
                format!("model.layers.0.self_attn.{proj}_proj.weight"),
                filled(8, 2, value),
            );
        }
        full.insert("model.norm.weight".into(), filled(8, 1, 0.0));
        full
    }

    #[test]
    fn test_coalesce_rank_major_layout() {
        let shape = ModelShapeConfig::new(4, 4, 8, 1);
        let full = coalesce_qkv(state(), &shape, 2).unwrap();

        assert!(!full.contains_key("model.layers.0.self_attn.q_proj.weight"));
        assert!(full.contains_key("model.norm.weight"));

        let fused = &full["model.layers.0.self_attn.qkv_proj.weight"];
        assert_eq!(fused.shape(), &[24, 2]);
        let rows: Vec<f32> = fused
            .to_vec::<f32>()
            .unwrap()
            .chunks(2 * 4)
            .map(|block| block[0])
            .collect();
        // Blocks of 4 rows: q0 k0 v0 q1 k1 v1
        assert_eq!(rows, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_split_block_inverts_rank_slice() {
        let shape = ModelShapeConfig::new(4, 4, 8, 1);
        let original = state();
        let full = coalesce_qkv(original.clone(), &shape, 2).unwrap();
        let fused = &full["model.layers.0.self_attn.qkv_proj.weight"];

        let mut pieces: [Vec<Tensor>; 3] = Default::default();
        for rank in 0..2 {
            let block = fused.narrow(0, rank * 12, 12).unwrap();
            let [q, k, v] = split_coalesced_block("qkv", &block, &shape, 2).unwrap();
            pieces[0].push(q);
            pieces[1].push(k);
            pieces[2].push(v);
        }
        for (proj, parts) in ["q", "k", "v"].iter().zip(&pieces) {
            let refs: Vec<&Tensor> = parts.iter().collect();
            let name = format!("model.layers.0.self_attn.{proj}_proj.weight");
            assert_eq!(Tensor::cat(&refs, 0).unwrap(), original[&name]);
        }
    }

    #[test]
    fn test_coalesce_missing_projection() {
        let shape = ModelShapeConfig::new(4, 4, 8, 1);
        let mut full = state();
        full.remove("model.layers.0.self_attn.v_proj.weight");
        assert!(matches!(
            coalesce_qkv(full, &shape, 2),
            Err(Error::WeightNotFound(_))
        ));
    }
}
