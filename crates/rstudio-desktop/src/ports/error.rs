//! Port allocation error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for port allocation operations.
pub type PortResult<T> = Result<T, PortError>;

/// Errors that can occur while allocating a port.
///
/// Losing a claim race is not an error; the scan just moves on.
#[derive(Debug, Error)]
pub enum PortError {
    /// Every port in the range is listening or claimed.
    #[error("no free port in range {min}-{max}")]
    Exhausted { min: u16, max: u16 },

    /// The configured range is empty or starts at zero.
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },

    /// The shared registry cannot be created or written.
    #[error("reservation registry {} is unusable: {source}", path.display())]
    Registry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The private assignment record cannot be written.
    #[error("cannot write port assignment {}: {source}", path.display())]
    Assignment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The persisted port is held by another user and the policy is strict.
    #[error(
        "assigned port {port} is held by {holder}; remove the assignment or free the port manually"
    )]
    Conflict { port: u16, holder: String },

    /// Our own stale server did not release the port after termination.
    #[error("port {port} is still in use after stopping our stale server")]
    StillOccupied { port: u16 },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PortError::Exhausted {
            min: 8800,
            max: 8899,
        };
        assert_eq!(err.to_string(), "no free port in range 8800-8899");

        let err = PortError::Conflict {
            port: 8801,
            holder: "user 'bob'".to_string(),
        };
        assert!(err.to_string().starts_with("assigned port 8801 is held by user 'bob'"));
    }
}
