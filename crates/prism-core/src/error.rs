//! Error types for the ray tracing core.

use thiserror::Error;

/// Errors reported by the builders and by device backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The device could not satisfy a size query or a buffer request.
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    /// The device lacks a required ray tracing capability.
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A payload, attribute, or local argument block exceeds its declared size.
    #[error("Layout violation: {0}")]
    LayoutViolation(String),

    /// Hit-group records and instance numbering disagree.
    #[error("Indexing mismatch: {0}")]
    IndexingMismatch(String),

    /// A record or association names an export the pipeline does not have.
    #[error("Unknown shader export: {0}")]
    UnknownExport(String),

    /// Malformed input (empty mesh, bad index, missing record).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A handle whose slot has been destroyed or reused.
    #[error("Stale handle: {0}")]
    StaleHandle(String),

    /// Backend failure that does not fit another category.
    #[error("Device error: {0}")]
    Device(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Re-tag any failure as an allocation failure, keeping its message.
    ///
    /// Size queries and buffer creation report every failure as
    /// [`Error::AllocationFailure`] regardless of what the backend said.
    pub fn into_allocation_failure(self) -> Self {
        match self {
            Self::AllocationFailure(msg) => Self::AllocationFailure(msg),
            other => Self::AllocationFailure(other.to_string()),
        }
    }
}
