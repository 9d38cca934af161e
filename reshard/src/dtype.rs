//! Data types for checkpoint tensors

use std::fmt;

use crate::{Error, Result};

/// Element types that can appear in a checkpoint.
///
/// Resharding never does arithmetic on weights (except the optional
/// averaging of replicated tensors), so every dtype is just an element
/// width as far as slicing and concatenation are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// 64-bit floating point
    F64,
    /// 64-bit signed integer
    I64,
    /// 32-bit signed integer
    I32,
    /// 8-bit unsigned integer
    U8,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::U8 => 1,
        }
    }

    /// Convert from a safetensors dtype.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for dtypes checkpoints do not use.
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(Self::F32),
            safetensors::Dtype::F16 => Ok(Self::F16),
            safetensors::Dtype::BF16 => Ok(Self::BF16),
            safetensors::Dtype::F64 => Ok(Self::F64),
            safetensors::Dtype::I64 => Ok(Self::I64),
            safetensors::Dtype::I32 => Ok(Self::I32),
            safetensors::Dtype::U8 => Ok(Self::U8),
            other => Err(Error::UnsupportedDtype(format!("{other:?}"))),
        }
    }

    /// Convert to the safetensors dtype.
    #[must_use]
    pub const fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::F32 => safetensors::Dtype::F32,
            Self::F16 => safetensors::Dtype::F16,
            Self::BF16 => safetensors::Dtype::BF16,
            Self::F64 => safetensors::Dtype::F64,
            Self::I64 => safetensors::Dtype::I64,
            Self::I32 => safetensors::Dtype::I32,
            Self::U8 => safetensors::Dtype::U8,
        }
    }

    /// Parse the lowercase name written by [`fmt::Display`].
    #[must_use]
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "f32" => Some(Self::F32),
            "f16" => Some(Self::F16),
            "bf16" => Some(Self::BF16),
            "f64" => Some(Self::F64),
            "i64" => Some(Self::I64),
            "i32" => Some(Self::I32),
            "u8" => Some(Self::U8),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::F64 => write!(f, "f64"),
            Self::I64 => write!(f, "i64"),
            Self::I32 => write!(f, "i32"),
            Self::U8 => write!(f, "u8"),
        }
    }
}

/// Trait for Rust types that can back a tensor
pub trait TensorDType: bytemuck::Pod + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;
}

impl TensorDType for half::f16 {
    const DTYPE: DType = DType::F16;
}

impl TensorDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
}

impl TensorDType for f64 {
    const DTYPE: DType = DType::F64;
}

impl TensorDType for i64 {
    const DTYPE: DType = DType::I64;
}

impl TensorDType for i32 {
    const DTYPE: DType = DType::I32;
}

impl TensorDType for u8 {
    const DTYPE: DType = DType::U8;
}
