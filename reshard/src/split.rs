//! Full state to per-rank partial states

use std::collections::BTreeMap;

use tracing::debug;

use crate::category::{classify, WeightCategory};
use crate::config::{ConversionConfig, ModelShapeConfig};
use crate::gqa::GqaReindexer;
use crate::keys::{fused_gate_up_key, unfused_gate_up_keys, WeightKeyMapper};
use crate::partition::PipelinePlan;
use crate::shard::{ShardConfig, ShardStrategy};
use crate::state::{FullState, PartialState};
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Cuts a full state into the partial state of any `(tp_rank, pp_rank)`.
///
/// Holds no per-rank state, so one splitter can serve every rank
/// concurrently against the same shared [`FullState`].
#[derive(Debug, Clone)]
pub struct ShardSplitter {
    cfg: ConversionConfig,
    plan: PipelinePlan,
    keys: WeightKeyMapper,
    gqa: Option<GqaReindexer>,
}

/// Gate and up shards waiting for their partner before fusion.
#[derive(Default)]
struct GateUpPair {
    gate: Option<Tensor>,
    up: Option<Tensor>,
}

impl ShardSplitter {
    /// # Errors
    /// Returns an error if `cfg` is inconsistent with `shape`.
    pub fn new(cfg: ConversionConfig, shape: &ModelShapeConfig, plan: PipelinePlan) -> Result<Self> {
        cfg.validate(shape)?;
        let gqa = if cfg.replicates_kv() {
            Some(GqaReindexer::new(shape, &cfg)?)
        } else {
            None
        };
        Ok(Self {
            cfg,
            plan,
            keys: WeightKeyMapper::new(&cfg),
            gqa,
        })
    }

    #[must_use]
    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    /// Build the partial state of `(tp_rank, pp_rank)`.
    ///
    /// # Errors
    /// Fails on the first weight that cannot be classified or sliced,
    /// naming the weight and its shape.
    pub fn split(&self, full: &FullState, tp_rank: usize, pp_rank: usize) -> Result<PartialState> {
        if tp_rank >= self.cfg.tp_size || pp_rank >= self.cfg.pp_size {
            return Err(Error::InvalidConfig(format!(
                "rank (tp {tp_rank}, pp {pp_rank}) outside a {}x{} grid",
                self.cfg.tp_size, self.cfg.pp_size
            )));
        }
        let shard = ShardConfig {
            rank: tp_rank,
            world_size: self.cfg.tp_size,
        };

        let mut partial = PartialState::new();
        let mut pending: BTreeMap<String, GateUpPair> = BTreeMap::new();

        for (name, tensor) in full {
            if !self.plan.owns(name, pp_rank) {
                continue;
            }
            let category = classify(name)?;
            let sliced = self.slice(name, tensor, category, &shard)?;
            debug!(
                weight = %name,
                ?category,
                from = ?tensor.shape(),
                to = ?sliced.shape(),
                tp_rank,
                pp_rank,
                "split"
            );

            match category {
                WeightCategory::GateProj | WeightCategory::UpProj if self.cfg.fuse_gate_up => {
                    let pair = pending.entry(fused_gate_up_key(name)).or_default();
                    if category == WeightCategory::GateProj {
                        pair.gate = Some(sliced);
                    } else {
                        pair.up = Some(sliced);
                    }
                }
                WeightCategory::GateUpFused if !self.cfg.fuse_gate_up => {
                    let halves = sliced.chunk(2, 0)?;
                    let (gate_name, up_name) = unfused_gate_up_keys(name);
                    for (key, half) in [gate_name, up_name].into_iter().zip(halves) {
                        insert_unique(&mut partial, key, half)?;
                    }
                }
                _ => insert_unique(&mut partial, self.keys.to_sharded(name)?, sliced)?,
            }
        }

        for (fused, pair) in pending {
            let (gate_name, up_name) = unfused_gate_up_keys(&fused);
            let (gate, up) = match (pair.gate, pair.up) {
                (Some(gate), Some(up)) => (gate, up),
                (None, _) => return Err(Error::WeightNotFound(gate_name)),
                (_, None) => return Err(Error::WeightNotFound(up_name)),
            };
            let joined = Tensor::cat(&[&gate, &up], 0)
                .map_err(|e| Error::shape(&fused, gate.shape(), e.to_string()))?;
            insert_unique(&mut partial, fused, joined)?;
        }

        Ok(partial)
    }

    /// This rank's piece of one weight.
    fn slice(
        &self,
        name: &str,
        tensor: &Tensor,
        category: WeightCategory,
        shard: &ShardConfig,
    ) -> Result<Tensor> {
        match (category, &self.gqa) {
            (WeightCategory::QkvQ, Some(gqa)) => gqa.split_q(name, tensor, shard.rank),
            (WeightCategory::QkvK | WeightCategory::QkvV, Some(gqa)) => {
                gqa.split_kv(name, tensor, shard.rank)
            }
            (WeightCategory::OProj, Some(gqa)) => gqa.split_o(name, tensor, shard.rank),
            (WeightCategory::GateUpFused, _) => {
                // Slice gate and up halves separately so each rank keeps [gate; up].
                let halves = tensor
                    .chunk(2, 0)
                    .map_err(|e| Error::shape(name, tensor.shape(), e.to_string()))?;
                let mut parts = Vec::with_capacity(2);
                for half in &halves {
                    parts.push(shard.slice(name, half, ShardStrategy::Column)?);
                }
                let refs: Vec<&Tensor> = parts.iter().collect();
                Tensor::cat(&refs, 0)
            }
            _ => shard.slice(name, tensor, category.strategy()),
        }
    }
}

fn insert_unique(partial: &mut PartialState, key: String, tensor: Tensor) -> Result<()> {
    if partial.contains_key(&key) {
        return Err(Error::InvalidShape(format!(
            "two weights map to sharded key {key}"
        )));
    }
    partial.insert(key, tensor);
    Ok(())
}
