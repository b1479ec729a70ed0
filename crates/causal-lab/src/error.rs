//! Custom error types for the causal-inference toolkit.
//!
//! This module provides the error hierarchy using `thiserror` so that
//! every analysis step (loading, recoding, model fitting, matching,
//! discontinuity estimation) reports failures with a stable error code.
//!
//! Errors are serializable so they can be embedded in JSON reports and
//! consumed by tooling that pipes the CLI output.

use serde::Serialize;
use serde::ser::SerializeStruct;
use thiserror::Error;

/// The main error type for causal-lab.
#[derive(Error, Debug)]
pub enum CausalError {
    /// Analysis was cancelled by the caller.
    #[error("Analysis cancelled")]
    Cancelled,

    /// Column was not found in the dataset.
    #[error("Column '{0}' not found in dataset")]
    ColumnNotFound(String),

    /// Invalid configuration or arguments provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No valid values found in a column for computation.
    #[error("No valid values found in column '{0}'")]
    NoValidValues(String),

    /// A model formula could not be parsed.
    #[error("Invalid formula '{formula}': {reason}")]
    InvalidFormula { formula: String, reason: String },

    /// Not enough observations for the requested computation.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// A cross-product matrix could not be inverted.
    #[error("Singular design matrix: {0}")]
    SingularMatrix(String),

    /// A model failed to fit.
    #[error("Model fitting failed: {0}")]
    ModelFailed(String),

    /// Matching could not produce a usable sample.
    #[error("Matching failed: {0}")]
    MatchingFailed(String),

    /// The input file format is not supported.
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Internal error (invariant violation).
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CausalError>,
    },
}

impl CausalError {
    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CausalError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Get the stable error code.
    ///
    /// Context wrappers report the code of the error they wrap.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Cancelled => "CANCELLED",
            Self::ColumnNotFound(_) => "COLUMN_NOT_FOUND",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::NoValidValues(_) => "NO_VALID_VALUES",
            Self::InvalidFormula { .. } => "INVALID_FORMULA",
            Self::InsufficientData(_) => "INSUFFICIENT_DATA",
            Self::SingularMatrix(_) => "SINGULAR_MATRIX",
            Self::ModelFailed(_) => "MODEL_FAILED",
            Self::MatchingFailed(_) => "MATCHING_FAILED",
            Self::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    /// Check if this error represents a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::WithContext { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Check if the caller can fix this error by changing its inputs.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::ColumnNotFound(_)
            | Self::InvalidConfig(_)
            | Self::InvalidFormula { .. }
            | Self::UnsupportedFormat(_) => true,
            Self::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }
}

/// Errors are serialized as a struct with `code` and `message` fields.
impl Serialize for CausalError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("CausalError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for causal-lab operations.
pub type Result<T> = std::result::Result<T, CausalError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| CausalError::Polars(e).with_context(context))
    }
}

impl<T> ResultExt<T> for std::io::Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| CausalError::Io(e).with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(CausalError::Cancelled.error_code(), "CANCELLED");
        assert_eq!(
            CausalError::ColumnNotFound("educ".to_string()).error_code(),
            "COLUMN_NOT_FOUND"
        );
        assert_eq!(
            CausalError::SingularMatrix("x".to_string()).error_code(),
            "SINGULAR_MATRIX"
        );
    }

    #[test]
    fn test_is_cancelled_through_context() {
        assert!(CausalError::Cancelled.is_cancelled());
        assert!(CausalError::Cancelled.with_context("matching").is_cancelled());
        assert!(!CausalError::Internal("x".to_string()).is_cancelled());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(CausalError::InvalidConfig("ratio".to_string()).is_recoverable());
        assert!(
            CausalError::InvalidFormula {
                formula: "y ~".to_string(),
                reason: "empty".to_string()
            }
            .is_recoverable()
        );
        assert!(!CausalError::SingularMatrix("X'X".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_serialization() {
        let error = CausalError::ColumnNotFound("agecell".to_string());
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("COLUMN_NOT_FOUND"));
        assert!(json.contains("agecell"));
    }

    #[test]
    fn test_with_context() {
        let error = CausalError::InsufficientData("no controls".to_string())
            .with_context("During matching");
        assert!(error.to_string().contains("During matching"));
        assert_eq!(error.error_code(), "INSUFFICIENT_DATA");
    }
}
