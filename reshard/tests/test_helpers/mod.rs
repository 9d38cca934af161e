//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::cast_precision_loss)]

use std::collections::BTreeSet;

use reshard::{
    keys::unfused_gate_up_keys, ConversionConfig, FullState, ModelShapeConfig, PartialSet,
    PipelinePlan, RankCoord, ShardMerger, ShardSplitter, Tensor, WeightCategory, WeightKeyMapper,
};

/// Dimensions of a synthetic Llama-style model.
#[derive(Debug, Clone)]
pub struct TinyLlama {
    pub shape: ModelShapeConfig,
    pub intermediate_size: usize,
    pub vocab_size: usize,
}

impl TinyLlama {
    pub fn new(heads: usize, kv_heads: usize, hidden: usize, layers: usize) -> Self {
        Self {
            shape: ModelShapeConfig::new(heads, kv_heads, hidden, layers),
            intermediate_size: 2 * hidden,
            vocab_size: 2 * hidden,
        }
    }

    /// Full state where every element of every tensor is distinct.
    pub fn full_state(&self) -> FullState {
        let hidden = self.shape.hidden_size;
        let head_dim = self.shape.head_dim();
        let q_rows = self.shape.num_attention_heads * head_dim;
        let kv_rows = self.shape.num_kv_heads() * head_dim;
        let inter = self.intermediate_size;

        let mut next = 0.0f32;
        let mut tensor = |dims: &[usize]| {
            let n: usize = dims.iter().product();
            let data: Vec<f32> = (0..n).map(|i| next + i as f32).collect();
            next += n as f32;
            Tensor::from_slice(dims, &data).unwrap()
        };

        let mut full = FullState::new();
        full.insert(
            "model.embed_tokens.weight".into(),
            tensor(&[self.vocab_size, hidden]),
        );
        full.insert("model.rotary_emb.inv_freq".into(), tensor(&[head_dim / 2]));
        for i in 0..self.shape.num_hidden_layers {
            let p = format!("model.layers.{i}");
            full.insert(format!("{p}.self_attn.q_proj.weight"), tensor(&[q_rows, hidden]));
            full.insert(format!("{p}.self_attn.k_proj.weight"), tensor(&[kv_rows, hidden]));
            full.insert(format!("{p}.self_attn.v_proj.weight"), tensor(&[kv_rows, hidden]));
            full.insert(format!("{p}.self_attn.o_proj.weight"), tensor(&[hidden, q_rows]));
            full.insert(format!("{p}.mlp.gate_proj.weight"), tensor(&[inter, hidden]));
            full.insert(format!("{p}.mlp.up_proj.weight"), tensor(&[inter, hidden]));
            full.insert(format!("{p}.mlp.down_proj.weight"), tensor(&[hidden, inter]));
            full.insert(format!("{p}.input_layernorm.weight"), tensor(&[hidden]));
            full.insert(format!("{p}.post_attention_layernorm.weight"), tensor(&[hidden]));
        }
        full.insert("model.norm.weight".into(), tensor(&[hidden]));
        full.insert("lm_head.weight".into(), tensor(&[self.vocab_size, hidden]));
        full
    }
}

pub fn splitter(full: &FullState, cfg: ConversionConfig, shape: &ModelShapeConfig) -> ShardSplitter {
    let plan = PipelinePlan::new(full.keys().map(String::as_str), &cfg).unwrap();
    ShardSplitter::new(cfg, shape, plan).unwrap()
}

/// Every partial of the `tp_size x pp_size` grid.
pub fn split_all(full: &FullState, cfg: ConversionConfig, shape: &ModelShapeConfig) -> PartialSet {
    let s = splitter(full, cfg, shape);
    RankCoord::grid(cfg.tp_size, cfg.pp_size)
        .map(|c| (c, s.split(full, c.tp_rank, c.pp_rank).unwrap()))
        .collect()
}

pub fn merge_all(partials: &PartialSet, cfg: ConversionConfig, shape: &ModelShapeConfig) -> FullState {
    ShardMerger::new(cfg, shape.clone())
        .unwrap()
        .merge(partials)
        .unwrap()
}

/// Full-state names a partial's keys stand for.
pub fn full_names(partial_keys: impl IntoIterator<Item = String>, cfg: &ConversionConfig) -> BTreeSet<String> {
    let keys = WeightKeyMapper::new(cfg);
    let mut names = BTreeSet::new();
    for key in partial_keys {
        if reshard::classify(&key).unwrap() == WeightCategory::GateUpFused {
            let (gate, up) = unfused_gate_up_keys(&key);
            names.insert(gate);
            names.insert(up);
        } else {
            names.insert(keys.to_full(&key).unwrap());
        }
    }
    names
}

pub fn rows(t: &Tensor) -> usize {
    t.shape()[0]
}
