//! Error types for reshard

use thiserror::Error;

/// Result type alias using reshard's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for checkpoint conversion
#[derive(Error, Debug)]
pub enum Error {
    /// A dimension is not divisible by the parallel degree, or a GQA
    /// invariant does not hold for this weight.
    #[error("Shape mismatch for '{name}' {shape:?}: {reason}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        reason: String,
    },

    #[error("Unknown weight key: {0}")]
    UnknownWeightKey(String),

    #[error("Missing partial checkpoint for tp_rank {tp_rank}, pp_rank {pp_rank}")]
    MissingPartial { tp_rank: usize, pp_rank: usize },

    #[error("Round-trip mismatch for {} weight(s): {}", .names.len(), .names.join(", "))]
    RoundTripMismatch { names: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::ShapeMismatch`] for a named weight.
    pub(crate) fn shape(name: &str, shape: &[usize], reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            name: name.to_string(),
            shape: shape.to_vec(),
            reason: reason.into(),
        }
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_names_weight() {
        let err = Error::shape(
            "model.embed_tokens.weight",
            &[32001, 64],
            "dim 0 not divisible by tp_size 4",
        );
        let msg = err.to_string();
        assert!(msg.contains("model.embed_tokens.weight"));
        assert!(msg.contains("[32001, 64]"));
    }

    #[test]
    fn test_round_trip_mismatch_lists_names() {
        let err = Error::RoundTripMismatch {
            names: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Round-trip mismatch for 2 weight(s): a, b");
    }
}
