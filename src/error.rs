use thiserror::Error;

use crate::gnss::SatelliteId;

/// Fusion core error types
///
/// Everything except `WindowInvariantViolation` is a recoverable ingestion-boundary
/// condition: the offending input is rejected and estimator state is left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Out-of-order measurement at t={time:.6}s (last accepted {last:.6}s)")]
    OutOfOrderMeasurement { time: f64, last: f64 },

    #[error("No ephemeris for satellite {0} within the wait timeout")]
    UnresolvedEphemeris(SatelliteId),

    #[error("Duplicate or stale ephemeris for satellite {0}")]
    DuplicateOrStaleEphemeris(SatelliteId),

    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("Solver did not converge after {iterations} iterations")]
    SolverDivergence { iterations: usize },

    #[error("Window invariant violated: {0}")]
    WindowInvariantViolation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FusionError {
    /// Programmer-error class. The estimator refuses all further input after one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FusionError::WindowInvariantViolation(_))
    }
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        assert!(FusionError::WindowInvariantViolation("x".into()).is_fatal());
        assert!(!FusionError::OutOfOrderMeasurement { time: 0.0, last: 1.0 }.is_fatal());
        assert!(!FusionError::SolverDivergence { iterations: 3 }.is_fatal());
        assert!(!FusionError::UnresolvedEphemeris(SatelliteId(5)).is_fatal());
    }

    #[test]
    fn test_messages_name_the_input() {
        let err = FusionError::DuplicateOrStaleEphemeris(SatelliteId(12));
        assert!(err.to_string().contains("12"));
    }
}
