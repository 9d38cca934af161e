//! Chunked serialized partials
//!
//! The rank file itself is a small JSON manifest. Every tensor lives in its
//! own single-tensor SafeTensors file next to it:
//!
//! ```text
//! dp_rank_00_tp_rank_00_pp_rank_00.pt              manifest
//! dp_rank_00_tp_rank_00_pp_rank_00.pt.tensors/
//!     tensor_0.pt
//!     tensor_1.pt
//! ```
//!
//! Loading a rank touches one small file per tensor rather than mapping a
//! single large one, which is what accelerator runtimes stream from.

#![allow(clippy::doc_markdown)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::safetensors::{read_state, write_entries};
use crate::dtype::DType;
use crate::state::StateDict;
use crate::{Error, Result};

const FORMAT_NAME: &str = "reshard-chunked";
const FORMAT_VERSION: u32 = 1;

/// Key of the single tensor inside each chunk file.
const CHUNK_TENSOR_KEY: &str = "tensor";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format: String,
    version: u32,
    tensors: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    chunk: usize,
    dtype: String,
    shape: Vec<usize>,
}

/// Directory holding the chunk files of the manifest at `path`.
#[must_use]
pub fn chunk_dir(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tensors");
    PathBuf::from(name)
}

fn chunk_path(path: &Path, chunk: usize) -> PathBuf {
    chunk_dir(path).join(format!("tensor_{chunk}.pt"))
}

/// Write `state` as a manifest at `path` plus one chunk file per tensor.
///
/// # Errors
/// Returns an error if any file cannot be written.
pub fn write_state_chunked(path: &Path, state: &StateDict) -> Result<()> {
    let dir = chunk_dir(path);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    let mut tensors = BTreeMap::new();
    for (chunk, (name, tensor)) in state.iter().enumerate() {
        write_entries(&chunk_path(path, chunk), [(CHUNK_TENSOR_KEY, tensor)])?;
        tensors.insert(
            name.clone(),
            ManifestEntry {
                chunk,
                dtype: tensor.dtype().to_string(),
                shape: tensor.shape().to_vec(),
            },
        );
    }

    let manifest = Manifest {
        format: FORMAT_NAME.to_string(),
        version: FORMAT_VERSION,
        tensors,
    };
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &manifest)?;
    writer.flush()?;
    debug!(path = %path.display(), chunks = manifest.tensors.len(), "wrote chunked state");
    Ok(())
}

/// Read a chunked state written by [`write_state_chunked`].
///
/// # Errors
/// Returns an error if the manifest or a chunk cannot be read, or a chunk
/// disagrees with the dtype or shape its manifest entry records.
pub fn read_state_chunked(path: &Path) -> Result<StateDict> {
    let manifest: Manifest = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    if manifest.format != FORMAT_NAME || manifest.version != FORMAT_VERSION {
        return Err(Error::InvalidConfig(format!(
            "{} is not a {FORMAT_NAME} v{FORMAT_VERSION} manifest (found {} v{})",
            path.display(),
            manifest.format,
            manifest.version
        )));
    }

    let mut state = StateDict::new();
    for (name, entry) in manifest.tensors {
        let chunk_file = chunk_path(path, entry.chunk);
        let tensor = read_state(&chunk_file)?
            .remove(CHUNK_TENSOR_KEY)
            .ok_or_else(|| Error::WeightNotFound(format!("{name} in {}", chunk_file.display())))?;

        let expected = DType::from_name(&entry.dtype)
            .ok_or_else(|| Error::UnsupportedDtype(entry.dtype.clone()))?;
        if tensor.dtype() != expected {
            return Err(Error::DtypeMismatch {
                expected: expected.to_string(),
                got: tensor.dtype().to_string(),
            });
        }
        if tensor.shape() != entry.shape.as_slice() {
            return Err(Error::shape(
                &name,
                tensor.shape(),
                format!("manifest records shape {:?}", entry.shape),
            ));
        }
        state.insert(name, tensor);
    }
    Ok(state)
}
