//! Checkpoint resharding CLI.
//!
//! Usage:
//!   reshard --input_dir llama/model.safetensors --output_dir out \
//!     --config llama/config.json --tp_size 8 --pp_size 2 \
//!     --kv_size_multiplier 4 --convert_from_full_state
//!
//!   reshard --input_dir out/model --output_dir merged \
//!     --config llama/config.json --tp_size 8 --pp_size 2 \
//!     --kv_size_multiplier 4 --convert_to_full_state

use std::path::PathBuf;

use clap::{ArgGroup, Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reshard::{
    ConversionConfig, ConvertOptions, ConverterDriver, Direction, ModelShapeConfig, Result,
    UnpartitionedPolicy,
};

/// Convert transformer checkpoints between full and TP/PP-sharded layouts.
#[derive(Parser)]
#[command(name = "reshard", version)]
#[command(group(
    ArgGroup::new("direction")
        .required(true)
        .multiple(false)
        .args([
            "convert_from_full_state",
            "convert_to_full_state",
            "convert_from_xser",
            "convert_to_xser",
        ])
))]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Full checkpoint (file or directory) or directory of partial checkpoints
    #[arg(long = "input_dir")]
    input_dir: PathBuf,

    /// Where converted weights are written
    #[arg(long = "output_dir")]
    output_dir: PathBuf,

    /// Model config.json (needed to split or merge)
    #[arg(long, env = "RESHARD_MODEL_CONFIG")]
    config: Option<PathBuf>,

    /// Key prefix of the model weights inside partial checkpoints
    #[arg(long = "model_key", default_value = "model")]
    model_key: String,

    /// Tensor-parallel degree
    #[arg(long = "tp_size", default_value_t = 1)]
    tp_size: usize,

    /// Pipeline-parallel degree
    #[arg(long = "pp_size", default_value_t = 1)]
    pp_size: usize,

    /// Virtual pipeline stages per pipeline rank
    #[arg(long = "virtual_pp_size", default_value_t = 1)]
    virtual_pp_size: usize,

    /// KV-head replication factor
    #[arg(long = "kv_size_multiplier", default_value_t = 1)]
    kv_size_multiplier: usize,

    /// Sharded checkpoints use the GQA QKV linear key names
    #[arg(long = "qkv_linear")]
    qkv_linear: bool,

    /// Fuse q/k/v into one qkv_proj before splitting
    #[arg(long = "coalesce_qkv")]
    coalesce_qkv: bool,

    /// Keep gate and up projections as separate sharded tensors
    #[arg(long = "no_fuse_gate_up")]
    no_fuse_gate_up: bool,

    /// How replicated tensors are combined when merging
    #[arg(long = "unpartitioned_policy", value_enum, default_value_t = Policy::First)]
    unpartitioned_policy: Policy,

    /// Read partials in the serialized format
    #[arg(long = "load_xser")]
    load_xser: bool,

    /// Write partials in the serialized format
    #[arg(long = "save_xser")]
    save_xser: bool,

    /// After splitting, merge in memory and compare with the input
    #[arg(long)]
    verify: bool,

    #[arg(long = "convert_from_full_state")]
    convert_from_full_state: bool,

    #[arg(long = "convert_to_full_state")]
    convert_to_full_state: bool,

    /// Re-encode serialized partials as plain partials
    #[arg(long = "convert_from_xser")]
    convert_from_xser: bool,

    /// Re-encode plain partials as serialized partials
    #[arg(long = "convert_to_xser")]
    convert_to_xser: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    First,
    Average,
}

impl From<Policy> for UnpartitionedPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::First => Self::First,
            Policy::Average => Self::Average,
        }
    }
}

impl Cli {
    fn direction(&self) -> Direction {
        if self.convert_from_full_state {
            Direction::FromFullState
        } else if self.convert_to_full_state {
            Direction::ToFullState
        } else if self.convert_from_xser {
            Direction::FromSerialized
        } else {
            Direction::ToSerialized
        }
    }

    fn conversion(&self) -> ConversionConfig {
        ConversionConfig {
            tp_size: self.tp_size,
            pp_size: self.pp_size,
            virtual_pp_size: self.virtual_pp_size,
            kv_size_multiplier: self.kv_size_multiplier,
            qkv_linear: self.qkv_linear,
            coalesce_qkv: self.coalesce_qkv,
            fuse_gate_up: !self.no_fuse_gate_up,
            unpartitioned_policy: self.unpartitioned_policy.into(),
        }
    }
}

fn init_logging(level: &str) -> std::result::Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| format!("failed to initialize logging: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("{e}");
    }

    let shape = cli
        .config
        .as_ref()
        .map(ModelShapeConfig::from_file)
        .transpose()?;

    let options = ConvertOptions {
        input: cli.input_dir.clone(),
        output: cli.output_dir.clone(),
        shape,
        model_key: Some(cli.model_key.clone()).filter(|k| !k.is_empty()),
        load_serialized: cli.load_xser,
        save_serialized: cli.save_xser,
        verify: cli.verify,
    };

    let mut driver = ConverterDriver::new(cli.direction(), cli.conversion(), options);
    let report = driver.run()?;
    info!(files = report.written.len(), output = %cli.output_dir.display(), "done");
    if let Some(round_trip) = report.round_trip {
        if !round_trip.is_clean() {
            error!(%round_trip, "converted weights do not match the input");
        }
    }
    Ok(())
}
