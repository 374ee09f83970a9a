//! Error kinds shared across the search core.
//!
//! Mirrors the `ChromaError`/`ErrorCodes` split: a small closed set of
//! machine-readable codes plus a trait object any module-local error type
//! can implement, so callers can match on `code()` without downcasting.

use std::error::Error;

/// The error kinds named in the search core's error-handling design.
///
/// Unlike a gRPC-style status code, each variant here corresponds to a
/// specific invariant violation in the index contract (see `ErrorCode::name`).
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ErrorCode {
    /// An operation that requires training was invoked on an untrained index.
    NotTrained,
    /// A vector's dimensionality did not match the index's configured `d`.
    DimensionMismatch,
    /// An insert would exceed a fixed-capacity structure.
    CapacityExceeded,
    /// The index variant does not implement this operation at all.
    UnsupportedOp,
    /// A caller-supplied argument violates a documented precondition.
    InvalidArgument,
    /// A training step produced non-finite values.
    NumericalFailure,
    /// An allocation or other resource could not be obtained.
    ResourceExhausted,
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NotTrained => "NotTrainedError",
            ErrorCode::DimensionMismatch => "DimensionMismatchError",
            ErrorCode::CapacityExceeded => "CapacityExceededError",
            ErrorCode::UnsupportedOp => "UnsupportedOpError",
            ErrorCode::InvalidArgument => "InvalidArgumentError",
            ErrorCode::NumericalFailure => "NumericalFailureError",
            ErrorCode::ResourceExhausted => "ResourceExhaustedError",
        }
    }
}

/// Implemented by every error type surfaced from the search core.
pub trait AnnError: Error + Send + Sync {
    fn code(&self) -> ErrorCode;

    fn boxed(self) -> Box<dyn AnnError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

impl Error for Box<dyn AnnError> {}

impl AnnError for Box<dyn AnnError> {
    fn code(&self) -> ErrorCode {
        self.as_ref().code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_distinct() {
        let codes = [
            ErrorCode::NotTrained,
            ErrorCode::DimensionMismatch,
            ErrorCode::CapacityExceeded,
            ErrorCode::UnsupportedOp,
            ErrorCode::InvalidArgument,
            ErrorCode::NumericalFailure,
            ErrorCode::ResourceExhausted,
        ];
        let names: std::collections::HashSet<_> = codes.iter().map(ErrorCode::name).collect();
        assert_eq!(names.len(), codes.len());
    }
}
