//! Split/merge round-trip checking

use std::fmt;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::ConversionConfig;
use crate::merge::ShardMerger;
use crate::split::ShardSplitter;
use crate::state::{FullState, PartialSet, RankCoord};
use crate::{Error, Result};

/// Differences between an expected full state and a reconstructed one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundTripReport {
    /// Expected weights absent from the reconstruction
    pub missing: Vec<String>,
    /// Reconstructed weights with no expected counterpart
    pub extra: Vec<String>,
    /// Weights present on both sides whose shape, dtype or bytes differ
    pub differing: Vec<String>,
}

impl RoundTripReport {
    /// Compare two full states name by name.
    #[must_use]
    pub fn compare(expected: &FullState, actual: &FullState) -> Self {
        let mut report = Self::default();
        for (name, tensor) in expected {
            match actual.get(name) {
                None => report.missing.push(name.clone()),
                Some(other) if other != tensor => report.differing.push(name.clone()),
                Some(_) => {}
            }
        }
        report.extra = actual
            .keys()
            .filter(|name| !expected.contains_key(*name))
            .cloned()
            .collect();
        report
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.differing.is_empty()
    }

    /// # Errors
    /// Returns `RoundTripMismatch` listing every offending name.
    pub fn into_result(self) -> Result<()> {
        if self.is_clean() {
            return Ok(());
        }
        let names = self
            .missing
            .into_iter()
            .chain(self.extra)
            .chain(self.differing)
            .collect();
        Err(Error::RoundTripMismatch { names })
    }

    /// Emit the report as log events.
    pub fn log(&self) {
        if self.is_clean() {
            info!("round trip verified");
            return;
        }
        warn!(
            missing = ?self.missing,
            extra = ?self.extra,
            differing = ?self.differing,
            "round trip mismatch"
        );
    }
}

impl fmt::Display for RoundTripReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} missing, {} extra, {} differing",
            self.missing.len(),
            self.extra.len(),
            self.differing.len()
        )
    }
}

/// Split `source` into every partial, merge them back, and compare the
/// result with `expected`.
///
/// `expected` differs from `source` only when `source` was rewritten before
/// splitting (QKV coalescing), since merging restores the separate q/k/v names.
///
/// # Errors
/// Returns the first split or merge failure. Content differences are
/// reported, not returned as errors.
pub fn verify_round_trip(
    source: &FullState,
    expected: &FullState,
    splitter: &ShardSplitter,
    merger: &ShardMerger,
    cfg: &ConversionConfig,
) -> Result<RoundTripReport> {
    let partials: PartialSet = RankCoord::grid(cfg.tp_size, cfg.pp_size)
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|coord| Ok((coord, splitter.split(source, coord.tp_rank, coord.pp_rank)?)))
        .collect::<Result<_>>()?;
    let merged = merger.merge(&partials)?;
    Ok(RoundTripReport::compare(expected, &merged))
}
