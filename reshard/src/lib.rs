//! Reshard: tensor/pipeline-parallel checkpoint conversion
//!
//! Converts transformer weights between one unsharded ("full") state and
//! the per-rank ("partial") states of a TP x PP layout, including KV-head
//! replication for grouped-query attention, fused gate/up projections and
//! coalesced QKV projections. The split and merge paths are exact inverses.

pub mod category;
pub mod checkpoint;
pub mod coalesce;
pub mod config;
pub mod driver;
pub mod dtype;
pub mod error;
pub mod gqa;
pub mod keys;
pub mod merge;
pub mod partition;
pub mod shard;
pub mod split;
pub mod state;
pub mod tensor;
pub mod verify;

pub use category::{classify, WeightCategory};
pub use checkpoint::{load_full, load_partial, save_full, save_partial, PartialFormat};
pub use coalesce::coalesce_qkv;
pub use config::{ConversionConfig, ModelShapeConfig, UnpartitionedPolicy};
pub use driver::{ConversionReport, ConvertOptions, ConverterDriver, Direction, DriverState};
pub use dtype::{DType, TensorDType};
pub use error::{Error, Result};
pub use gqa::GqaReindexer;
pub use keys::{KeyLayout, WeightKeyMapper};
pub use merge::ShardMerger;
pub use partition::{create_partitions, stage_to_pipeline_parallel_rank, PipelinePlan, Placement};
pub use shard::{ShardConfig, ShardStrategy};
pub use split::ShardSplitter;
pub use state::{FullState, PartialSet, PartialState, RankCoord, StateDict};
pub use tensor::Tensor;
pub use verify::{verify_round_trip, RoundTripReport};
