use thiserror::Error;

/// Estimator error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("{name} has shape {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        name: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Innovation covariance is singular (det = {determinant:e})")]
    SingularInnovation { determinant: f64 },

    #[error("Timestamp went backwards: {previous} -> {current}")]
    NonMonotonicTimestamp { previous: i64, current: i64 },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for filter operations
pub type FilterResult<T> = Result<T, FilterError>;

/// Fail with `DimensionMismatch` unless `actual == expected`.
pub(crate) fn ensure_shape(
    name: &'static str,
    expected: (usize, usize),
    actual: (usize, usize),
) -> FilterResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(FilterError::DimensionMismatch {
            name,
            expected,
            actual,
        })
    }
}
