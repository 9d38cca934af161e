//! Pipeline-parallel layer assignment
//!
//! Decoder layers are cut into `pp_size * virtual_pp_size` contiguous
//! stages of balanced length. Stage `s` runs on physical pipeline rank
//! `s % pp_size`, so with virtual pipelining each rank owns several
//! non-adjacent layer ranges.

use std::ops::Range;

use crate::config::ConversionConfig;
use crate::keys::layer_index;
use crate::{Error, Result};

/// Physical pipeline rank a (possibly virtual) stage runs on.
#[must_use]
pub fn stage_to_pipeline_parallel_rank(stage: usize, pp_size: usize) -> usize {
    stage % pp_size
}

/// Sorted, de-duplicated `model.layers.{i}` block names present in `names`.
pub fn layer_block_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut indices: Vec<usize> = names.into_iter().filter_map(layer_index).collect();
    indices.sort_unstable();
    indices.dedup();
    indices
        .into_iter()
        .map(|i| format!("model.layers.{i}"))
        .collect()
}

/// Balanced contiguous cut points for `num_stages` stages.
///
/// Returns the names of the last layer of every stage but the final one
/// (`num_stages - 1` entries). Each stage gets `floor(L / S)` or
/// `ceil(L / S)` layers, earlier stages taking the remainder.
///
/// # Errors
/// Returns `InvalidConfig` if there are fewer layers than stages.
pub fn create_partitions(num_stages: usize, layer_names: &[String]) -> Result<Vec<String>> {
    if num_stages == 0 {
        return Err(Error::InvalidConfig("number of pipeline stages must be at least 1".into()));
    }
    let num_layers = layer_names.len();
    if num_stages > 1 && num_layers < num_stages {
        return Err(Error::InvalidConfig(format!(
            "cannot split {num_layers} layers into {num_stages} pipeline stages"
        )));
    }

    let base = num_layers / num_stages;
    let remainder = num_layers % num_stages;
    let mut partitions = Vec::with_capacity(num_stages - 1);
    let mut end = 0;
    for stage in 0..num_stages - 1 {
        end += base + usize::from(stage < remainder);
        partitions.push(layer_names[end - 1].clone());
    }
    Ok(partitions)
}

/// Where a weight lives along the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Token embedding: pipeline rank 0 only.
    FirstRank,
    /// `lm_head` and the final norm: last pipeline rank only.
    LastRank,
    /// Decoder layer `i`: the rank running the stage that contains it.
    Layer(usize),
    /// Anything else outside the decoder stack is kept on every rank.
    EveryRank,
}

/// Pipeline placement of a weight by name.
#[must_use]
pub fn placement(name: &str) -> Placement {
    if name.contains("embed_tokens") {
        Placement::FirstRank
    } else if name.contains("lm_head") || name.contains("model.norm.weight") {
        Placement::LastRank
    } else if let Some(i) = layer_index(name) {
        Placement::Layer(i)
    } else {
        Placement::EveryRank
    }
}

/// Layer-to-stage assignment for one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    /// Layer index of each cut; stage `s` ends at `cuts[s]` inclusive.
    cuts: Vec<usize>,
    layers: Vec<usize>,
    pp_size: usize,
}

impl PipelinePlan {
    /// Plan stages for the decoder layers named in `weight_names`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if there are fewer layers than stages.
    pub fn new<'a>(
        weight_names: impl IntoIterator<Item = &'a str>,
        cfg: &ConversionConfig,
    ) -> Result<Self> {
        let blocks = layer_block_names(weight_names);
        let partitions = create_partitions(cfg.num_stages(), &blocks)?;
        let cuts = partitions.iter().filter_map(|p| layer_index(p)).collect();
        let layers = blocks.iter().filter_map(|b| layer_index(b)).collect();
        Ok(Self {
            cuts,
            layers,
            pp_size: cfg.pp_size,
        })
    }

    /// Cut boundaries as `model.layers.{i}` block names.
    #[must_use]
    pub fn partitions(&self) -> Vec<String> {
        self.cuts.iter().map(|i| format!("model.layers.{i}")).collect()
    }

    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.cuts.len() + 1
    }

    /// Stage whose cut range contains layer `layer`.
    #[must_use]
    pub fn stage_of_layer(&self, layer: usize) -> usize {
        self.cuts
            .iter()
            .position(|&cut| layer <= cut)
            .unwrap_or(self.cuts.len())
    }

    /// Physical pipeline rank owning layer `layer`.
    #[must_use]
    pub fn pp_rank_of_layer(&self, layer: usize) -> usize {
        stage_to_pipeline_parallel_rank(self.stage_of_layer(layer), self.pp_size)
    }

    /// Layer index range of every stage, in stage order.
    #[must_use]
    pub fn stage_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::with_capacity(self.num_stages());
        let mut start = self.layers.first().copied().unwrap_or(0);
        for &cut in &self.cuts {
            ranges.push(start..cut + 1);
            start = cut + 1;
        }
        let end = self.layers.last().map_or(start, |&last| last + 1);
        ranges.push(start..end.max(start));
        ranges
    }

    /// Whether `pp_rank` holds weight `name`.
    #[must_use]
    pub fn owns(&self, name: &str, pp_rank: usize) -> bool {
        match placement(name) {
            Placement::FirstRank => pp_rank == 0,
            Placement::LastRank => pp_rank == self.pp_size - 1,
            Placement::Layer(i) => self.pp_rank_of_layer(i) == pp_rank,
            Placement::EveryRank => true,
        }
    }
}

/// Human-readable layer range of `stage`, for logging.
#[must_use]
pub fn describe_stage(plan: &PipelinePlan, stage: usize) -> String {
    plan.stage_ranges().get(stage).map_or_else(String::new, |r| {
        format!("model.layers.{}..model.layers.{}", r.start, r.end.saturating_sub(1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("model.layers.{i}")).collect()
    }

    fn cfg(pp_size: usize, virtual_pp_size: usize) -> ConversionConfig {
        ConversionConfig {
            pp_size,
            virtual_pp_size,
            ..ConversionConfig::default()
        }
    }

    fn weights(n: usize) -> Vec<String> {
        let mut out = vec!["model.embed_tokens.weight".to_string()];
        for i in 0..n {
            out.push(format!("model.layers.{i}.mlp.up_proj.weight"));
            out.push(format!("model.layers.{i}.input_layernorm.weight"));
        }
        out.push("model.norm.weight".to_string());
        out.push("lm_head.weight".to_string());
        out
    }

    #[test]
    fn test_seven_layers_two_stages() {
        assert_eq!(
            create_partitions(2, &names(7)).unwrap(),
            vec!["model.layers.3".to_string()]
        );

        let w = weights(7);
        let plan = PipelinePlan::new(w.iter().map(String::as_str), &cfg(2, 1)).unwrap();
        assert_eq!(plan.partitions(), vec!["model.layers.3".to_string()]);
        assert_eq!(plan.stage_ranges(), vec![0..4, 4..7]);
        for layer in 0..=3 {
            assert_eq!(plan.pp_rank_of_layer(layer), 0);
        }
        for layer in 4..7 {
            assert_eq!(plan.pp_rank_of_layer(layer), 1);
        }
    }

    #[test]
    fn test_balanced_partition_property() {
        for num_layers in 1..40 {
            for num_stages in 1..=num_layers.min(9) {
                let cuts = create_partitions(num_stages, &names(num_layers)).unwrap();
                assert_eq!(cuts.len(), num_stages - 1);

                let mut prev_end = 0;
                let mut lens = Vec::new();
                for cut in &cuts {
                    let end = layer_index(cut).unwrap() + 1;
                    lens.push(end - prev_end);
                    prev_end = end;
                }
                lens.push(num_layers - prev_end);

                let floor = num_layers / num_stages;
                let ceil = num_layers.div_ceil(num_stages);
                assert!(lens.iter().all(|&l| l == floor || l == ceil), "{lens:?}");
                assert_eq!(lens.iter().sum::<usize>(), num_layers);
                assert!(lens.windows(2).all(|w| w[0] >= w[1]), "{lens:?}");
            }
        }
    }

    #[test]
    fn test_too_few_layers() {
        assert!(matches!(
            create_partitions(4, &names(3)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_virtual_pipeline_round_robin() {
        assert_eq!(stage_to_pipeline_parallel_rank(0, 2), 0);
        assert_eq!(stage_to_pipeline_parallel_rank(1, 2), 1);
        assert_eq!(stage_to_pipeline_parallel_rank(2, 2), 0);
        assert_eq!(stage_to_pipeline_parallel_rank(3, 2), 1);

        // 8 layers, 2 ranks x 2 virtual stages: [0,1] [2,3] [4,5] [6,7]
        let w = weights(8);
        let plan = PipelinePlan::new(w.iter().map(String::as_str), &cfg(2, 2)).unwrap();
        assert_eq!(plan.num_stages(), 4);
        let ranks: Vec<usize> = (0..8).map(|l| plan.pp_rank_of_layer(l)).collect();
        assert_eq!(ranks, vec![0, 0, 1, 1, 0, 0, 1, 1]);
    }

    #[test]
    fn test_placement_rules() {
        let w = weights(4);
        let plan = PipelinePlan::new(w.iter().map(String::as_str), &cfg(2, 1)).unwrap();

        assert!(plan.owns("model.embed_tokens.weight", 0));
        assert!(!plan.owns("model.embed_tokens.weight", 1));
        assert!(plan.owns("lm_head.weight", 1));
        assert!(!plan.owns("model.norm.weight", 0));
        assert!(plan.owns("model.layers.1.mlp.up_proj.weight", 0));
        assert!(plan.owns("model.layers.2.mlp.up_proj.weight", 1));
        assert!(plan.owns("model.rotary_emb.inv_freq", 0));
        assert!(plan.owns("model.rotary_emb.inv_freq", 1));
    }

    #[test]
    fn test_single_stage_owns_everything() {
        let w = weights(3);
        let plan = PipelinePlan::new(w.iter().map(String::as_str), &cfg(1, 1)).unwrap();
        assert!(plan.partitions().is_empty());
        assert!(w.iter().all(|name| plan.owns(name, 0)));
    }

    #[test]
    fn test_layer_block_names_sorted_numerically() {
        let blocks = layer_block_names([
            "model.layers.10.mlp.up_proj.weight",
            "model.layers.2.mlp.up_proj.weight",
            "model.layers.2.input_layernorm.weight",
            "lm_head.weight",
        ]);
        assert_eq!(blocks, vec!["model.layers.2", "model.layers.10"]);
    }

    #[test]
    fn test_describe_stage() {
        let w = weights(7);
        let plan = PipelinePlan::new(w.iter().map(String::as_str), &cfg(2, 1)).unwrap();
        assert_eq!(describe_stage(&plan, 1), "model.layers.4..model.layers.6");
    }
}
