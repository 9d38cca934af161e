//! Checkpoint files on disk
//!
//! Partial checkpoints are stored one file per rank as
//! `dp_rank_00_tp_rank_{NN}_pp_rank_{NN}.pt`, written under `<out>/model/`.
//! Inputs in the older `tp_rank_{NN}_pp_rank_{NN}` layout are still read.

pub mod safetensors;
pub mod serialized;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::state::{FullState, PartialSet, PartialState, RankCoord, StateDict};
use crate::{Error, Result};

/// File name written by [`save_full`] when given a directory.
pub const FULL_CHECKPOINT_NAME: &str = "checkpoint.pt";

/// Sub-directory of the output directory that receives partials.
pub const PARTIAL_SUBDIR: &str = "model";

/// On-disk encoding of a partial checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialFormat {
    /// One SafeTensors file per rank.
    #[default]
    Plain,
    /// JSON manifest plus one file per tensor.
    Serialized,
}

impl PartialFormat {
    /// `Serialized` when `serialized` is set.
    #[must_use]
    pub fn from_flag(serialized: bool) -> Self {
        if serialized {
            Self::Serialized
        } else {
            Self::Plain
        }
    }

    fn read(self, path: &Path) -> Result<StateDict> {
        match self {
            Self::Plain => self::safetensors::read_state(path),
            Self::Serialized => serialized::read_state_chunked(path),
        }
    }

    fn write(self, path: &Path, state: &StateDict) -> Result<()> {
        match self {
            Self::Plain => self::safetensors::write_state(path, state),
            Self::Serialized => serialized::write_state_chunked(path, state),
        }
    }
}

/// `dp_rank_00_tp_rank_{NN}_pp_rank_{NN}.pt`
#[must_use]
pub fn partial_file_name(coord: RankCoord) -> String {
    format!(
        "dp_rank_00_tp_rank_{:02}_pp_rank_{:02}.pt",
        coord.tp_rank, coord.pp_rank
    )
}

/// Pre-`dp_rank` location of a partial inside `dir`.
#[must_use]
pub fn legacy_partial_path(dir: &Path, coord: RankCoord, format: PartialFormat) -> PathBuf {
    let rank_dir = dir.join(format!(
        "tp_rank_{:02}_pp_rank_{:02}",
        coord.tp_rank, coord.pp_rank
    ));
    match format {
        PartialFormat::Plain => rank_dir.join(FULL_CHECKPOINT_NAME),
        PartialFormat::Serialized => rank_dir,
    }
}

/// Where [`save_partial`] writes the partial of `coord`.
#[must_use]
pub fn partial_output_path(dir: &Path, coord: RankCoord) -> PathBuf {
    dir.join(PARTIAL_SUBDIR).join(partial_file_name(coord))
}

/// Locate the partial of `coord` in `dir`, preferring the legacy layout.
///
/// # Errors
/// Returns `Io(NotFound)` naming both candidate paths if neither exists.
pub fn find_partial(dir: &Path, coord: RankCoord, format: PartialFormat) -> Result<PathBuf> {
    let legacy = legacy_partial_path(dir, coord, format);
    if legacy.is_file() {
        return Ok(legacy);
    }
    let current = dir.join(partial_file_name(coord));
    if current.is_file() {
        return Ok(current);
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!(
            "neither {} nor {} exists",
            legacy.display(),
            current.display()
        ),
    )))
}

/// Load the partial of `coord` from `dir`.
///
/// With `model_key` set, a `"{model_key}/"` prefix shared by every key is
/// removed.
///
/// # Errors
/// Returns an error if the file is missing or cannot be decoded.
pub fn load_partial(
    dir: &Path,
    coord: RankCoord,
    format: PartialFormat,
    model_key: Option<&str>,
) -> Result<PartialState> {
    let path = find_partial(dir, coord, format)?;
    let state = format.read(&path)?;
    debug!(path = %path.display(), tensors = state.len(), %coord, "loaded partial");
    Ok(match model_key {
        Some(key) => strip_model_key(state, key),
        None => state,
    })
}

/// Check that every rank of a `tp_size x pp_size` grid has a partial in
/// `dir`, returning the grid coordinates.
///
/// # Errors
/// Returns `MissingPartial` for the first rank with no file.
pub fn check_partials(
    dir: &Path,
    tp_size: usize,
    pp_size: usize,
    format: PartialFormat,
) -> Result<Vec<RankCoord>> {
    let coords: Vec<RankCoord> = RankCoord::grid(tp_size, pp_size).collect();
    for &coord in &coords {
        if let Err(e) = find_partial(dir, coord, format) {
            warn!(%coord, error = %e, "partial checkpoint not found");
            return Err(Error::MissingPartial {
                tp_rank: coord.tp_rank,
                pp_rank: coord.pp_rank,
            });
        }
    }
    Ok(coords)
}

/// Load every partial of a `tp_size x pp_size` grid.
///
/// # Errors
/// Returns `MissingPartial` for the first rank with no file, or the first
/// decoding error.
pub fn load_partials(
    dir: &Path,
    tp_size: usize,
    pp_size: usize,
    format: PartialFormat,
    model_key: Option<&str>,
) -> Result<PartialSet> {
    check_partials(dir, tp_size, pp_size, format)?
        .into_par_iter()
        .map(|coord| Ok((coord, load_partial(dir, coord, format, model_key)?)))
        .collect()
}

/// Write the partial of `coord` under `<dir>/model/`.
///
/// # Errors
/// Returns an error if the directory or file cannot be written.
pub fn save_partial(
    dir: &Path,
    coord: RankCoord,
    state: &PartialState,
    format: PartialFormat,
) -> Result<PathBuf> {
    let path = partial_output_path(dir, coord);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    format.write(&path, state)?;
    info!(path = %path.display(), tensors = state.len(), %coord, ?format, "saved partial");
    Ok(path)
}

/// Load a full checkpoint.
///
/// `path` is either a single SafeTensors file or a directory. All
/// `*.safetensors` files in a directory are merged in name order; a
/// directory without any falls back to its [`FULL_CHECKPOINT_NAME`].
///
/// # Errors
/// Returns an error if nothing loadable is found, a file cannot be
/// decoded, or two files define the same tensor.
pub fn load_full(path: &Path) -> Result<FullState> {
    if !path.is_dir() {
        let state = self::safetensors::read_state(path)?;
        info!(path = %path.display(), tensors = state.len(), "loaded full checkpoint");
        return Ok(state);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "safetensors"))
        .collect();
    files.sort();

    if files.is_empty() {
        let fallback = path.join(FULL_CHECKPOINT_NAME);
        if fallback.is_file() {
            return load_full(&fallback);
        }
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "no .safetensors files or {FULL_CHECKPOINT_NAME} in {}",
                path.display()
            ),
        )));
    }

    let mut full = FullState::new();
    let mut origin: BTreeMap<String, PathBuf> = BTreeMap::new();
    for file in &files {
        for (name, tensor) in self::safetensors::read_state(file)? {
            if let Some(first) = origin.get(&name) {
                return Err(Error::SafeTensors(format!(
                    "tensor {name} defined in both {} and {}",
                    first.display(),
                    file.display()
                )));
            }
            origin.insert(name.clone(), file.clone());
            full.insert(name, tensor);
        }
    }
    info!(
        path = %path.display(),
        files = files.len(),
        tensors = full.len(),
        "loaded full checkpoint"
    );
    Ok(full)
}

/// Write a full checkpoint.
///
/// A `path` that is an existing directory, or has no extension, is treated
/// as a directory and receives [`FULL_CHECKPOINT_NAME`].
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_full(path: &Path, state: &FullState) -> Result<PathBuf> {
    let target = if path.is_dir() || path.extension().is_none() {
        fs::create_dir_all(path)?;
        path.join(FULL_CHECKPOINT_NAME)
    } else {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        path.to_path_buf()
    };
    self::safetensors::write_state(&target, state)?;
    info!(path = %target.display(), tensors = state.len(), "saved full checkpoint");
    Ok(target)
}

/// Drop a `"{model_key}/"` prefix if every key carries it.
#[must_use]
pub fn strip_model_key(state: StateDict, model_key: &str) -> StateDict {
    let prefix = format!("{model_key}/");
    if model_key.is_empty() || state.is_empty() || !state.keys().all(|k| k.starts_with(&prefix)) {
        return state;
    }
    state
        .into_iter()
        .map(|(name, tensor)| (name[prefix.len()..].to_string(), tensor))
        .collect()
}
