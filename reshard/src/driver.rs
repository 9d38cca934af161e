//! Conversion orchestration
//!
//! [`ConverterDriver`] runs exactly one [`Direction`] per invocation. Every
//! `(tp_rank, pp_rank)` unit of work runs on the rayon pool; the first
//! failing unit aborts the whole run, since a partly written sharded
//! checkpoint cannot be loaded.

use std::fmt;
use std::path::PathBuf;

use rayon::prelude::*;
use tracing::info;

use crate::checkpoint::{self, PartialFormat};
use crate::coalesce::coalesce_qkv;
use crate::config::{ConversionConfig, ModelShapeConfig};
use crate::merge::ShardMerger;
use crate::partition::{describe_stage, stage_to_pipeline_parallel_rank, PipelinePlan};
use crate::split::ShardSplitter;
use crate::state::RankCoord;
use crate::verify::{verify_round_trip, RoundTripReport};
use crate::{Error, Result};

/// Which conversion to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Full checkpoint to per-rank partials.
    FromFullState,
    /// Per-rank partials to a full checkpoint.
    ToFullState,
    /// Serialized partials to plain partials, sharding unchanged.
    FromSerialized,
    /// Plain partials to serialized partials, sharding unchanged.
    ToSerialized,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FromFullState => "convert_from_full_state",
            Self::ToFullState => "convert_to_full_state",
            Self::FromSerialized => "convert_from_xser",
            Self::ToSerialized => "convert_to_xser",
        };
        f.write_str(name)
    }
}

/// What the driver is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Idle,
    SplittingFull,
    MergingPartials,
    Reencoding,
}

/// Paths and format switches of one conversion.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Full checkpoint (file or directory) or directory of partials
    pub input: PathBuf,
    /// Destination directory (or file, for a full checkpoint)
    pub output: PathBuf,
    /// Model shape, required to split or merge
    pub shape: Option<ModelShapeConfig>,
    /// Prefix stripped from partial keys when merging
    pub model_key: Option<String>,
    /// Read serialized partials when merging
    pub load_serialized: bool,
    /// Write serialized partials when splitting
    pub save_serialized: bool,
    /// Merge the fresh partials in memory after splitting and compare
    pub verify: bool,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default)]
pub struct ConversionReport {
    /// Every file written, in rank order for partials
    pub written: Vec<PathBuf>,
    /// Present when verification was requested
    pub round_trip: Option<RoundTripReport>,
}

/// Runs one conversion.
#[derive(Debug)]
pub struct ConverterDriver {
    direction: Direction,
    cfg: ConversionConfig,
    options: ConvertOptions,
    state: DriverState,
}

impl ConverterDriver {
    #[must_use]
    pub fn new(direction: Direction, cfg: ConversionConfig, options: ConvertOptions) -> Self {
        Self {
            direction,
            cfg,
            options,
            state: DriverState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> DriverState {
        self.state
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Run the configured conversion, returning to [`DriverState::Idle`]
    /// whether or not it succeeds.
    ///
    /// # Errors
    /// Returns the first configuration, I/O or conversion error.
    pub fn run(&mut self) -> Result<ConversionReport> {
        self.state = match self.direction {
            Direction::FromFullState => DriverState::SplittingFull,
            Direction::ToFullState => DriverState::MergingPartials,
            Direction::FromSerialized | Direction::ToSerialized => DriverState::Reencoding,
        };
        info!(
            direction = %self.direction,
            state = ?self.state,
            tp_size = self.cfg.tp_size,
            pp_size = self.cfg.pp_size,
            input = %self.options.input.display(),
            output = %self.options.output.display(),
            "starting conversion"
        );

        let result = match self.direction {
            Direction::FromFullState => self.split_full(),
            Direction::ToFullState => self.merge_partials(),
            Direction::FromSerialized => {
                self.reencode(PartialFormat::Serialized, PartialFormat::Plain)
            }
            Direction::ToSerialized => {
                self.reencode(PartialFormat::Plain, PartialFormat::Serialized)
            }
        };

        self.state = DriverState::Idle;
        if let Ok(report) = &result {
            info!(files = report.written.len(), "conversion finished");
        }
        result
    }

    fn shape(&self) -> Result<&ModelShapeConfig> {
        self.options.shape.as_ref().ok_or_else(|| {
            Error::InvalidConfig(format!("{} requires a model config", self.direction))
        })
    }

    fn split_full(&self) -> Result<ConversionReport> {
        let shape = self.shape()?;
        self.cfg.validate(shape)?;

        let mut full = checkpoint::load_full(&self.options.input)?;
        let plan = PipelinePlan::new(full.keys().map(String::as_str), &self.cfg)?;
        for stage in 0..plan.num_stages() {
            info!(
                stage,
                pp_rank = stage_to_pipeline_parallel_rank(stage, self.cfg.pp_size),
                layers = %describe_stage(&plan, stage),
                "pipeline stage"
            );
        }

        // Merging undoes coalescing, so verification compares against the input as loaded.
        let uncoalesced = (self.options.verify && self.cfg.coalesce_qkv).then(|| full.clone());
        if self.cfg.coalesce_qkv {
            full = coalesce_qkv(full, shape, self.cfg.tp_size)?;
            info!(layers = shape.num_hidden_layers, "coalesced q/k/v projections");
        }

        let splitter = ShardSplitter::new(self.cfg, shape, plan)?;
        let format = PartialFormat::from_flag(self.options.save_serialized);
        let full = &full;
        let written = RankCoord::grid(self.cfg.tp_size, self.cfg.pp_size)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|coord| {
                let partial = splitter.split(full, coord.tp_rank, coord.pp_rank)?;
                checkpoint::save_partial(&self.options.output, coord, &partial, format)
            })
            .collect::<Result<Vec<_>>>()?;

        let round_trip = if self.options.verify {
            let merger = ShardMerger::new(self.cfg, shape.clone())?;
            let expected = uncoalesced.as_ref().unwrap_or(full);
            let report = verify_round_trip(full, expected, &splitter, &merger, &self.cfg)?;
            report.log();
            Some(report)
        } else {
            None
        };

        Ok(ConversionReport {
            written,
            round_trip,
        })
    }

    fn merge_partials(&self) -> Result<ConversionReport> {
        let shape = self.shape()?;
        let merger = ShardMerger::new(self.cfg, shape.clone())?;
        let partials = checkpoint::load_partials(
            &self.options.input,
            self.cfg.tp_size,
            self.cfg.pp_size,
            PartialFormat::from_flag(self.options.load_serialized),
            self.options.model_key.as_deref(),
        )?;
        info!(partials = partials.len(), "merging partials");

        let full = merger.merge(&partials)?;
        drop(partials);
        let path = checkpoint::save_full(&self.options.output, &full)?;
        Ok(ConversionReport {
            written: vec![path],
            round_trip: None,
        })
    }

    fn reencode(&self, from: PartialFormat, to: PartialFormat) -> Result<ConversionReport> {
        if self.cfg.tp_size == 0 || self.cfg.pp_size == 0 {
            return Err(Error::InvalidConfig(
                "tp_size and pp_size must be at least 1".into(),
            ));
        }
        let input = &self.options.input;
        let coords = checkpoint::check_partials(input, self.cfg.tp_size, self.cfg.pp_size, from)?;
        let written = coords
            .par_iter()
            .map(|&coord| {
                let partial = checkpoint::load_partial(input, coord, from, None)?;
                checkpoint::save_partial(&self.options.output, coord, &partial, to)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ConversionReport {
            written,
            round_trip: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_without_shape_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ConverterDriver::new(
            Direction::FromFullState,
            ConversionConfig::default(),
            ConvertOptions {
                input: dir.path().join("missing.safetensors"),
                output: dir.path().join("out"),
                ..ConvertOptions::default()
            },
        );
        assert!(matches!(driver.run(), Err(Error::InvalidConfig(_))));
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[test]
    fn test_reencode_reports_missing_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ConverterDriver::new(
            Direction::ToSerialized,
            ConversionConfig {
                tp_size: 2,
                ..ConversionConfig::default()
            },
            ConvertOptions {
                input: dir.path().to_path_buf(),
                output: dir.path().join("out"),
                ..ConvertOptions::default()
            },
        );
        assert!(matches!(
            driver.run(),
            Err(Error::MissingPartial {
                tp_rank: 0,
                pp_rank: 0
            })
        ));
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[test]
    fn test_direction_names_match_flags() {
        assert_eq!(Direction::FromFullState.to_string(), "convert_from_full_state");
        assert_eq!(Direction::ToSerialized.to_string(), "convert_to_xser");
    }
}
