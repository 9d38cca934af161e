//! `SafeTensors` encoding of a state dict

#![allow(clippy::doc_markdown)]

use std::borrow::Cow;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use safetensors::tensor::{SafeTensors, View};

use crate::dtype::DType;
use crate::state::StateDict;
use crate::tensor::Tensor;
use crate::Result;

impl View for &Tensor {
    fn dtype(&self) -> safetensors::Dtype {
        Tensor::dtype(self).to_safetensors()
    }

    fn shape(&self) -> &[usize] {
        Tensor::shape(self)
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }

    fn data_len(&self) -> usize {
        self.as_bytes().len()
    }
}

/// Read every tensor of a SafeTensors file into owned tensors.
///
/// # Errors
/// Returns an error if the file cannot be opened or parsed, or holds a
/// dtype outside [`DType`].
pub fn read_state(path: &Path) -> Result<StateDict> {
    let file = File::open(path)?;
    // SAFETY: the mapping is only read while `file` is open and every
    // tensor is copied out before it is dropped.
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)?;

    let mut state = StateDict::new();
    for (name, view) in st.tensors() {
        let dtype = DType::from_safetensors(view.dtype())?;
        let tensor = Tensor::new(view.shape().to_vec(), dtype, view.data().to_vec())?;
        state.insert(name, tensor);
    }
    Ok(state)
}

/// Write `state` as one SafeTensors file, replacing any existing file.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_state(path: &Path, state: &StateDict) -> Result<()> {
    write_entries(path, state.iter().map(|(name, tensor)| (name.as_str(), tensor)))
}

/// Write borrowed `(name, tensor)` pairs as one SafeTensors file.
pub(crate) fn write_entries<'a>(
    path: &Path,
    entries: impl IntoIterator<Item = (&'a str, &'a Tensor)>,
) -> Result<()> {
    safetensors::serialize_to_file(entries, &None, path)?;
    Ok(())
}
