//! Error types for the scheduler crate.

use minicloud_core::HostId;
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// No host has enough free capacity for the request.
    #[error("No hosts with sufficient resources available (cpu={cpu}, memory_mb={memory_mb})")]
    NoCapacity {
        /// Requested CPUs.
        cpu: u32,
        /// Requested memory.
        memory_mb: u32,
    },

    /// The host is not registered.
    #[error("Host not found: {0}")]
    HostNotFound(HostId),

    /// The host definition is unusable.
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] minicloud_store::StoreError),
}

impl SchedulerError {
    /// Check if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::HostNotFound(_) => 404,
            Self::InvalidHost(_) => 400,
            Self::NoCapacity { .. } | Self::Store(_) => 503,
        }
    }
}

/// A specialized Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
