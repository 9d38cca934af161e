//! Host-side tensors used while resharding.
//!
//! A [`Tensor`] owns contiguous row-major bytes. Every operation returns a
//! freshly materialized tensor; nothing here aliases its source, so a slice
//! taken from a full weight never keeps the full buffer alive.

use std::fmt;

use crate::dtype::{DType, TensorDType};
use crate::{Error, Result};

/// An owned N-D buffer with a shape and an element dtype.
#[derive(Clone, PartialEq, Eq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl Tensor {
    /// Create a tensor from raw bytes in `dtype` encoding.
    ///
    /// # Errors
    /// Returns `InvalidShape` if `data` does not hold exactly
    /// `shape.product() * dtype.size_in_bytes()` bytes.
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "{} bytes do not match shape {shape:?} of {dtype} ({expected} bytes)",
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Create a tensor from a typed slice.
    ///
    /// # Errors
    /// Returns `InvalidShape` if `data.len()` differs from the shape product.
    pub fn from_slice<T: TensorDType>(shape: &[usize], data: &[T]) -> Result<Self> {
        Self::new(
            shape.to_vec(),
            T::DTYPE,
            bytemuck::cast_slice(data).to_vec(),
        )
    }

    /// Copy the elements out as a typed vector.
    ///
    /// # Errors
    /// Returns `DtypeMismatch` if `T` does not match the tensor dtype.
    pub fn to_vec<T: TensorDType>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::DtypeMismatch {
                expected: T::DTYPE.to_string(),
                got: self.dtype.to_string(),
            });
        }
        // The byte buffer has no alignment guarantee, so collect instead of cast.
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of dimension `dim`.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the tensor has fewer than `dim + 1` dims.
    pub fn dim(&self, dim: usize) -> Result<usize> {
        self.shape.get(dim).copied().ok_or_else(|| {
            Error::InvalidShape(format!(
                "dim {dim} out of range for shape {:?}",
                self.shape
            ))
        })
    }

    /// Split the shape around `dim` into `(outer elements, dim size, inner bytes)`.
    fn layout_around(&self, dim: usize) -> Result<(usize, usize, usize)> {
        let size = self.dim(dim)?;
        let outer = self.shape[..dim].iter().product();
        let inner = self.shape[dim + 1..].iter().product::<usize>() * self.dtype.size_in_bytes();
        Ok((outer, size, inner))
    }

    /// Copy `len` entries of `dim` starting at `start`.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the range falls outside the dimension.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let (outer, size, inner) = self.layout_around(dim)?;
        if start + len > size {
            return Err(Error::InvalidShape(format!(
                "narrow [{start}, {}) exceeds dim {dim} of shape {:?}",
                start + len,
                self.shape
            )));
        }

        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * size + start) * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }

        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }

    /// Concatenate tensors along `dim`.
    ///
    /// # Errors
    /// Returns `InvalidShape` if `tensors` is empty or the shapes disagree
    /// outside `dim`, and `DtypeMismatch` if the dtypes differ.
    pub fn cat(tensors: &[&Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::InvalidShape("cat of zero tensors".into()))?;
        let (outer, _, inner) = first.layout_around(dim)?;

        let mut total = 0;
        for t in tensors {
            if t.dtype != first.dtype {
                return Err(Error::DtypeMismatch {
                    expected: first.dtype.to_string(),
                    got: t.dtype.to_string(),
                });
            }
            let compatible = t.shape.len() == first.shape.len()
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(d, (a, b))| d == dim || a == b);
            if !compatible {
                return Err(Error::InvalidShape(format!(
                    "cannot cat {:?} with {:?} along dim {dim}",
                    t.shape, first.shape
                )));
            }
            total += t.shape[dim];
        }

        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for t in tensors {
                let slab = t.shape[dim] * inner;
                data.extend_from_slice(&t.data[o * slab..(o + 1) * slab]);
            }
        }

        let mut shape = first.shape.clone();
        shape[dim] = total;
        Ok(Self {
            shape,
            dtype: first.dtype,
            data,
        })
    }

    /// Split along `dim` into pieces of the given sizes.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the sizes do not sum to the dimension.
    pub fn split_sizes(&self, sizes: &[usize], dim: usize) -> Result<Vec<Self>> {
        let size = self.dim(dim)?;
        if sizes.iter().sum::<usize>() != size {
            return Err(Error::InvalidShape(format!(
                "split sizes {sizes:?} do not cover dim {dim} of shape {:?}",
                self.shape
            )));
        }
        let mut start = 0;
        sizes
            .iter()
            .map(|&len| {
                let piece = self.narrow(dim, start, len);
                start += len;
                piece
            })
            .collect()
    }

    /// Split along `dim` into `n` equal pieces.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the dimension is not divisible by `n`.
    pub fn chunk(&self, n: usize, dim: usize) -> Result<Vec<Self>> {
        let size = self.dim(dim)?;
        if n == 0 || size % n != 0 {
            return Err(Error::InvalidShape(format!(
                "dim {dim} of shape {:?} is not divisible into {n} chunks",
                self.shape
            )));
        }
        self.split_sizes(&vec![size / n; n], dim)
    }

    /// Tile the whole tensor `n` times along dim 0 (`repeat(n, 1, ...)`).
    ///
    /// # Errors
    /// Returns `InvalidShape` for scalars.
    pub fn repeat_dim0(&self, n: usize) -> Result<Self> {
        let rows = self.dim(0)?;
        let mut shape = self.shape.clone();
        shape[0] = rows * n;
        Ok(Self {
            shape,
            dtype: self.dtype,
            data: self.data.repeat(n),
        })
    }

    /// Swap the two axes of a 2D tensor.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the tensor is not 2D.
    pub fn transpose_2d(&self) -> Result<Self> {
        let &[rows, cols] = self.shape.as_slice() else {
            return Err(Error::InvalidShape(format!(
                "transpose_2d: expected 2D tensor, got {:?}",
                self.shape
            )));
        };
        let elem = self.dtype.size_in_bytes();

        let mut data = vec![0u8; self.data.len()];
        for i in 0..rows {
            for j in 0..cols {
                let src = (i * cols + j) * elem;
                let dst = (j * rows + i) * elem;
                data[dst..dst + elem].copy_from_slice(&self.data[src..src + elem]);
            }
        }
        Ok(Self {
            shape: vec![cols, rows],
            dtype: self.dtype,
            data,
        })
    }

    /// Reinterpret the buffer with a new shape of the same element count.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the element counts differ.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        if shape.iter().product::<usize>() != self.numel() {
            return Err(Error::InvalidShape(format!(
                "cannot reshape {:?} into {shape:?}",
                self.shape
            )));
        }
        Ok(Self { shape, ..self })
    }

    /// Gather entries of dim 0 in the order given by `indices`.
    ///
    /// # Errors
    /// Returns `InvalidShape` if an index is out of range.
    pub fn index_select(&self, indices: &[usize]) -> Result<Self> {
        let (_, rows, inner) = self.layout_around(0)?;
        let mut data = Vec::with_capacity(indices.len() * inner);
        for &idx in indices {
            if idx >= rows {
                return Err(Error::InvalidShape(format!(
                    "index {idx} out of range for dim 0 of shape {:?}",
                    self.shape
                )));
            }
            data.extend_from_slice(&self.data[idx * inner..(idx + 1) * inner]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }

    /// Element-wise mean of same-shaped floating point tensors.
    ///
    /// Half-precision inputs are accumulated in f32 and rounded back.
    ///
    /// # Errors
    /// Returns an error if the list is empty, shapes or dtypes differ, or
    /// the dtype is not a float.
    pub fn mean(tensors: &[&Self]) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::InvalidShape("mean of zero tensors".into()))?;
        for t in tensors {
            if t.dtype != first.dtype {
                return Err(Error::DtypeMismatch {
                    expected: first.dtype.to_string(),
                    got: t.dtype.to_string(),
                });
            }
            if t.shape != first.shape {
                return Err(Error::InvalidShape(format!(
                    "cannot average {:?} with {:?}",
                    t.shape, first.shape
                )));
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let count = tensors.len() as f64;
        let shape = first.shape.as_slice();
        match first.dtype {
            DType::F64 => {
                let sums = sum_as_f64::<f64>(tensors, |v| v)?;
                let out: Vec<f64> = sums.into_iter().map(|s| s / count).collect();
                Self::from_slice(shape, &out)
            }
            DType::F32 => {
                let sums = sum_as_f64::<f32>(tensors, f64::from)?;
                #[allow(clippy::cast_possible_truncation)]
                let out: Vec<f32> = sums.into_iter().map(|s| (s / count) as f32).collect();
                Self::from_slice(shape, &out)
            }
            DType::F16 => {
                let sums = sum_as_f64::<half::f16>(tensors, |v| f64::from(v.to_f32()))?;
                let out: Vec<half::f16> =
                    sums.into_iter().map(|s| half::f16::from_f64(s / count)).collect();
                Self::from_slice(shape, &out)
            }
            DType::BF16 => {
                let sums = sum_as_f64::<half::bf16>(tensors, |v| f64::from(v.to_f32()))?;
                let out: Vec<half::bf16> =
                    sums.into_iter().map(|s| half::bf16::from_f64(s / count)).collect();
                Self::from_slice(shape, &out)
            }
            other => Err(Error::UnsupportedDtype(format!(
                "cannot average {other} tensors"
            ))),
        }
    }
}

fn sum_as_f64<T: TensorDType>(tensors: &[&Tensor], widen: impl Fn(T) -> f64) -> Result<Vec<f64>> {
    let mut sums = vec![0.0f64; tensors[0].numel()];
    for t in tensors {
        for (acc, v) in sums.iter_mut().zip(t.to_vec::<T>()?) {
            *acc += widen(v);
        }
    }
    Ok(sums)
}
