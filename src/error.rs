//! Custom error types for the application.
//!
//! This module defines the primary error type, `PhotodiagError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different kinds of errors that can occur, from
//! configuration issues to acquisition and fitting problems.
//!
//! ## Error Hierarchy
//!
//! `PhotodiagError` consolidates several error sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or
//!   format issues in the configuration files.
//! - **`Configuration`**: Semantic errors in the configuration, such as values
//!   that parse correctly but are logically invalid (e.g., a buffer capacity
//!   of zero). These are caught during the validation step.
//! - **`Io`**: Wraps standard `std::io::Error`.
//! - **`Stream`**: Errors from the pulse-synchronous streaming source. A
//!   stream error is terminal for an acquisition session: the worker logs it
//!   and exits, and the operator must restart the session.
//! - **`Scan`**: A rejected actuator move during a calibration scan, carrying
//!   a distinguishable reason (soft-limit violation vs. generic move error).
//! - **`Fit`**: Curve-fit failures (non-convergence, degenerate inputs). At
//!   the refresh boundary these are caught and degrade to an empty display
//!   state rather than propagating.
//! - **`Collaborator`**: Errors from the black-box control-system
//!   collaborators (channel access, pipeline store, logbook), which report
//!   through `anyhow`.
//!
//! By using `#[from]`, `PhotodiagError` can be seamlessly created from the
//! underlying error types, simplifying error handling with the `?` operator.

use thiserror::Error;

use crate::scan::MoveFailure;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PhotodiagError>;

/// The crate-wide error type.
#[derive(Error, Debug)]
pub enum PhotodiagError {
    /// Configuration file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The streaming source failed; terminal for the acquisition session.
    #[error("Stream error: {0}")]
    Stream(String),

    /// An acquisition session is already running for this panel.
    #[error("Acquisition already active")]
    AcquisitionActive,

    /// An acquisition session was configured with no channels.
    #[error("Channel list must not be empty")]
    EmptyChannelList,

    /// An actuator move was rejected during a scan.
    #[error("Scan aborted: {0}")]
    Scan(#[from] MoveFailure),

    /// A curve fit failed to converge or was given degenerate inputs.
    #[error("Fit error: {0}")]
    Fit(String),

    /// Fewer samples than the operation requires.
    #[error("Insufficient samples: needed {needed}, got {got}")]
    InsufficientSamples {
        /// Minimum number of samples required.
        needed: usize,
        /// Number of samples actually available.
        got: usize,
    },

    /// Two sequences that must have equal length did not.
    #[error("Shape mismatch: expected length {expected}, got {got}")]
    ShapeMismatch {
        /// Expected sequence length.
        expected: usize,
        /// Actual sequence length.
        got: usize,
    },

    /// Failure reported by a control-system collaborator.
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_failure_keeps_reason_distinguishable() {
        let err: PhotodiagError = MoveFailure::OutOfSoftLimits {
            target: 5.0,
            low: -1.0,
            high: 1.0,
        }
        .into();
        match err {
            PhotodiagError::Scan(MoveFailure::OutOfSoftLimits { target, .. }) => {
                assert_eq!(target, 5.0);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn insufficient_samples_message_names_counts() {
        let err = PhotodiagError::InsufficientSamples { needed: 3, got: 1 };
        assert_eq!(err.to_string(), "Insufficient samples: needed 3, got 1");
    }
}
