//! Partial states back to one full state
//!
//! Merging runs in two passes. The first walks the whole TP x PP grid and
//! groups every rank's contribution under its sharded name, in `tp_rank`
//! order. The second reduces each group independently with the inverse of
//! the split transform for its category; groups share nothing, so they are
//! reduced in parallel.

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::category::{classify, WeightCategory};
use crate::coalesce::split_coalesced_block;
use crate::config::{ConversionConfig, ModelShapeConfig, UnpartitionedPolicy};
use crate::gqa::GqaReindexer;
use crate::keys::{unfused_gate_up_keys, unfused_qkv_keys, WeightKeyMapper};
use crate::state::{FullState, PartialSet, RankCoord};
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Reassembles a full state from every partial of a sharded checkpoint.
#[derive(Debug, Clone)]
pub struct ShardMerger {
    cfg: ConversionConfig,
    shape: ModelShapeConfig,
    keys: WeightKeyMapper,
    gqa: Option<GqaReindexer>,
}

/// Every rank's contribution to one sharded weight.
struct Group<'a> {
    category: WeightCategory,
    /// Pipeline rank holding a partitioned weight.
    pp_rank: usize,
    /// One slot per `tp_rank` for partitioned weights.
    shards: Vec<Option<&'a Tensor>>,
    /// Every copy of an unpartitioned weight, in grid order.
    copies: Vec<&'a Tensor>,
}

impl ShardMerger {
    /// # Errors
    /// Returns an error if `cfg` is inconsistent with `shape`.
    pub fn new(cfg: ConversionConfig, shape: ModelShapeConfig) -> Result<Self> {
        cfg.validate(&shape)?;
        let gqa = if cfg.replicates_kv() {
            Some(GqaReindexer::new(&shape, &cfg)?)
        } else {
            None
        };
        Ok(Self {
            cfg,
            shape,
            keys: WeightKeyMapper::new(&cfg),
            gqa,
        })
    }

    /// Merge all `tp_size * pp_size` partials into one full state.
    ///
    /// # Errors
    /// Returns `MissingPartial` if any rank of the grid is absent,
    /// `WeightNotFound` if a partitioned weight is missing from some TP
    /// rank, and the first reduce error otherwise.
    pub fn merge(&self, partials: &PartialSet) -> Result<FullState> {
        let groups = self.group(partials)?;
        debug!(weights = groups.len(), "grouped partial contributions");

        let merged: Vec<Vec<(String, Tensor)>> = groups
            .into_par_iter()
            .map(|(name, group)| self.reduce(&name, group))
            .collect::<Result<_>>()?;

        let mut full = FullState::new();
        for (name, tensor) in merged.into_iter().flatten() {
            if full.contains_key(&name) {
                return Err(Error::InvalidShape(format!(
                    "weight {name} reconstructed from more than one sharded key"
                )));
            }
            full.insert(name, tensor);
        }
        Ok(full)
    }

    /// Pass one: collect contributions by sharded name.
    fn group<'a>(&self, partials: &'a PartialSet) -> Result<BTreeMap<String, Group<'a>>> {
        let tp_size = self.cfg.tp_size;
        let mut groups: BTreeMap<String, Group<'a>> = BTreeMap::new();

        for coord in RankCoord::grid(tp_size, self.cfg.pp_size) {
            let partial = partials.get(&coord).ok_or(Error::MissingPartial {
                tp_rank: coord.tp_rank,
                pp_rank: coord.pp_rank,
            })?;
            for (name, tensor) in partial {
                let category = classify(name)?;
                let group = groups.entry(name.clone()).or_insert_with(|| Group {
                    category,
                    pp_rank: coord.pp_rank,
                    shards: vec![None; tp_size],
                    copies: Vec::new(),
                });

                if category == WeightCategory::Unpartitioned {
                    group.copies.push(tensor);
                    continue;
                }
                if group.pp_rank != coord.pp_rank {
                    return Err(Error::shape(
                        name,
                        tensor.shape(),
                        format!(
                            "partitioned weight present on pp_rank {} and pp_rank {}",
                            group.pp_rank, coord.pp_rank
                        ),
                    ));
                }
                group.shards[coord.tp_rank] = Some(tensor);
            }
        }

        if partials.len() > tp_size * self.cfg.pp_size {
            warn!(
                found = partials.len(),
                expected = tp_size * self.cfg.pp_size,
                "ignoring partials outside the configured grid"
            );
        }
        Ok(groups)
    }

    /// Pass two: inverse transform of one group into full-state weights.
    fn reduce(&self, name: &str, group: Group<'_>) -> Result<Vec<(String, Tensor)>> {
        if group.category == WeightCategory::Unpartitioned {
            return Ok(vec![(name.to_string(), self.reduce_copies(name, &group.copies)?)]);
        }

        let mut shards = Vec::with_capacity(group.shards.len());
        for (tp_rank, shard) in group.shards.into_iter().enumerate() {
            shards.push(shard.ok_or_else(|| {
                Error::WeightNotFound(format!(
                    "{name} (tp_rank {tp_rank}, pp_rank {})",
                    group.pp_rank
                ))
            })?);
        }

        let out = match (group.category, &self.gqa) {
            (WeightCategory::GateUpFused, _) => {
                let (gate_name, up_name) = unfused_gate_up_keys(name);
                let [gate, up] = self.unfuse(name, &shards)?;
                vec![(gate_name, gate), (up_name, up)]
            }
            (WeightCategory::QkvFused, _) => {
                let [q_name, k_name, v_name] = unfused_qkv_keys(name);
                let [q, k, v] = self.uncoalesce(name, &shards)?;
                vec![(q_name, q), (k_name, k), (v_name, v)]
            }
            (WeightCategory::QkvQ, Some(gqa)) => {
                vec![(self.keys.to_full(name)?, gqa.merge_q(name, &shards)?)]
            }
            (WeightCategory::QkvK | WeightCategory::QkvV, Some(gqa)) => {
                vec![(self.keys.to_full(name)?, gqa.merge_kv(name, &shards)?)]
            }
            (WeightCategory::OProj, Some(gqa)) => {
                vec![(self.keys.to_full(name)?, gqa.merge_o(name, &shards)?)]
            }
            (category, _) => {
                let dim = category.partition_dim().unwrap_or(0);
                let merged = Tensor::cat(&shards, dim)
                    .map_err(|e| Error::shape(name, shards[0].shape(), e.to_string()))?;
                vec![(self.keys.to_full(name)?, merged)]
            }
        };

        for (full_name, tensor) in &out {
            debug!(weight = %full_name, category = ?group.category, shape = ?tensor.shape(), "merged");
        }
        Ok(out)
    }

    /// Undo per-rank `[gate; up]` fusion: halve every rank's chunk at its
    /// midpoint and concatenate the halves separately.
    fn unfuse(&self, name: &str, shards: &[&Tensor]) -> Result<[Tensor; 2]> {
        let mut gates = Vec::with_capacity(shards.len());
        let mut ups = Vec::with_capacity(shards.len());
        for shard in shards {
            let mut halves = shard
                .chunk(2, 0)
                .map_err(|e| Error::shape(name, shard.shape(), e.to_string()))?
                .into_iter();
            match (halves.next(), halves.next()) {
                (Some(gate), Some(up)) => {
                    gates.push(gate);
                    ups.push(up);
                }
                _ => return Err(Error::shape(name, shard.shape(), "cannot halve fused gate/up")),
            }
        }
        debug!(weight = %name, tp_size = self.cfg.tp_size, "unfusing gate/up");
        Ok([concat(name, &gates)?, concat(name, &ups)?])
    }

    /// Undo QKV coalescing: split each rank's `[q_r; k_r; v_r]` block.
    fn uncoalesce(&self, name: &str, shards: &[&Tensor]) -> Result<[Tensor; 3]> {
        let mut pieces: [Vec<Tensor>; 3] = Default::default();
        for shard in shards {
            let [q, k, v] = split_coalesced_block(name, shard, &self.shape, self.cfg.tp_size)?;
            pieces[0].push(q);
            pieces[1].push(k);
            pieces[2].push(v);
        }
        let [q, k, v] = pieces;
        Ok([concat(name, &q)?, concat(name, &k)?, concat(name, &v)?])
    }

    /// Collapse the copies of a replicated weight.
    fn reduce_copies(&self, name: &str, copies: &[&Tensor]) -> Result<Tensor> {
        let Some(first) = copies.first() else {
            return Err(Error::WeightNotFound(name.to_string()));
        };
        match self.cfg.unpartitioned_policy {
            UnpartitionedPolicy::First => {
                if copies.iter().any(|c| c != first) {
                    warn!(
                        weight = %name,
                        copies = copies.len(),
                        "replicated weight differs across ranks, keeping the first copy"
                    );
                }
                Ok((*first).clone())
            }
            UnpartitionedPolicy::Average => Tensor::mean(copies)
                .map_err(|e| Error::shape(name, first.shape(), e.to_string())),
        }
    }
}

fn concat(name: &str, parts: &[Tensor]) -> Result<Tensor> {
    let refs: Vec<&Tensor> = parts.iter().collect();
    Tensor::cat(&refs, 0).map_err(|e| match refs.first() {
        Some(t) => Error::shape(name, t.shape(), e.to_string()),
        None => e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PipelinePlan;
    use crate::split::ShardSplitter;
    use crate::state::PartialState;

    fn tensor(rows: usize, cols: usize, offset: f32) -> Tensor {
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..rows * cols).map(|i| offset + i as f32).collect();
        Tensor::from_slice(&[rows, cols], &data).unwrap()
    }

    fn split_all(full: &FullState, cfg: ConversionConfig, shape: &ModelShapeConfig) -> PartialSet {
        let plan = PipelinePlan::new(full.keys().map(String::as_str), &cfg).unwrap();
        let splitter = ShardSplitter::new(cfg, shape, plan).unwrap();
        RankCoord::grid(cfg.tp_size, cfg.pp_size)
            .map(|c| (c, splitter.split(full, c.tp_rank, c.pp_rank).unwrap()))
            .collect()
    }

    fn mlp_full() -> FullState {
        let mut full = FullState::new();
        full.insert("model.layers.0.mlp.gate_proj.weight".into(), tensor(16, 4, 0.0));
        full.insert("model.layers.0.mlp.up_proj.weight".into(), tensor(16, 4, 1e3));
        full.insert("model.layers.0.mlp.down_proj.weight".into(), tensor(4, 16, 2e3));
        full.insert("model.layers.0.post_attention_layernorm.weight".into(), tensor(1, 4, 3e3));
        full
    }

    #[test]
    fn test_gate_up_round_trip() {
        let full = mlp_full();
        let cfg = ConversionConfig {
            tp_size: 4,
            ..ConversionConfig::default()
        };
        let shape = ModelShapeConfig::new(4, 4, 4, 1);
        let partials = split_all(&full, cfg, &shape);
        let merged = ShardMerger::new(cfg, shape).unwrap().merge(&partials).unwrap();
        assert_eq!(merged, full);
    }

    #[test]
    fn test_missing_partial() {
        let full = mlp_full();
        let cfg = ConversionConfig {
            tp_size: 2,
            ..ConversionConfig::default()
        };
        let shape = ModelShapeConfig::new(2, 2, 4, 1);
        let mut partials = split_all(&full, cfg, &shape);
        partials.remove(&RankCoord::new(1, 0));
        let err = ShardMerger::new(cfg, shape).unwrap().merge(&partials).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingPartial {
                tp_rank: 1,
                pp_rank: 0
            }
        ));
    }

    #[test]
    fn test_weight_missing_from_one_rank() {
        let full = mlp_full();
        let cfg = ConversionConfig {
            tp_size: 2,
            ..ConversionConfig::default()
        };
        let shape = ModelShapeConfig::new(2, 2, 4, 1);
        let mut partials = split_all(&full, cfg, &shape);
        partials
            .get_mut(&RankCoord::new(1, 0))
            .unwrap()
            .remove("model.layers.0.mlp.down_proj.weight");
        let err = ShardMerger::new(cfg, shape).unwrap().merge(&partials).unwrap_err();
        assert!(matches!(err, Error::WeightNotFound(_)), "{err}");
    }

    fn norm_partials(values: [f32; 2]) -> PartialSet {
        values
            .iter()
            .enumerate()
            .map(|(rank, &v)| {
                let mut partial = PartialState::new();
                partial.insert(
                    "model.norm.weight".into(),
                    Tensor::from_slice(&[2], &[v, v]).unwrap(),
                );
                (RankCoord::new(rank, 0), partial)
            })
            .collect()
    }

    #[test]
    fn test_unpartitioned_first_copy() {
        let cfg = ConversionConfig {
            tp_size: 2,
            ..ConversionConfig::default()
        };
        let shape = ModelShapeConfig::new(2, 2, 4, 1);
        let merged = ShardMerger::new(cfg, shape)
            .unwrap()
            .merge(&norm_partials([1.0, 3.0]))
            .unwrap();
        assert_eq!(merged["model.norm.weight"].to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_unpartitioned_average() {
        let cfg = ConversionConfig {
            tp_size: 2,
            unpartitioned_policy: UnpartitionedPolicy::Average,
            ..ConversionConfig::default()
        };
        let shape = ModelShapeConfig::new(2, 2, 4, 1);
        let merged = ShardMerger::new(cfg, shape)
            .unwrap()
            .merge(&norm_partials([1.0, 3.0]))
            .unwrap();
        assert_eq!(merged["model.norm.weight"].to_vec::<f32>().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_partitioned_weight_on_two_pipeline_ranks() {
        let cfg = ConversionConfig {
            pp_size: 2,
            ..ConversionConfig::default()
        };
        let shape = ModelShapeConfig::new(2, 2, 4, 2);
        let partials: PartialSet = (0..2)
            .map(|pp| {
                let mut partial = PartialState::new();
                partial.insert("lm_head.weight".into(), tensor(4, 4, 0.0));
                (RankCoord::new(0, pp), partial)
            })
            .collect();
        let err = ShardMerger::new(cfg, shape).unwrap().merge(&partials).unwrap_err();
        assert!(
            matches!(&err, Error::ShapeMismatch { name, .. } if name == "lm_head.weight"),
            "{err}"
        );
    }
}
