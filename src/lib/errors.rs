//! Custom error types for squall operations.

use thiserror::Error;

/// Result type alias for squall operations
pub type Result<T> = std::result::Result<T, SquallError>;

/// Error type for squall operations
#[derive(Error, Debug)]
pub enum SquallError {
    /// Invalid parameter value provided
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// The parameter name
        parameter: String,
        /// Explanation of why it's invalid
        reason: String,
    },

    /// A compute device requested on the command line could not be opened
    #[error("Device unavailable: {device}: {reason}")]
    DeviceUnavailable {
        /// The device string as given by the user
        device: String,
        /// Explanation of the failure
        reason: String,
    },

    /// An inference call failed; the whole batch is abandoned
    #[error("Inference failed on {runner}: {reason}")]
    RunnerFailure {
        /// Name of the runner that failed
        runner: String,
        /// Explanation of the failure
        reason: String,
    },

    /// Decoding model scores into a sequence failed for one chunk
    #[error("Decode failed for chunk {chunk_index} of read {read_id}")]
    DecodeFailure {
        /// The owning read
        read_id: String,
        /// Index of the chunk within the read
        chunk_index: usize,
    },

    /// A push was attempted on a terminated work queue
    #[error("Work queue terminated")]
    QueueTerminated,

    /// The tensor slab pool was asked for more slabs than it holds
    #[error("Tensor pool exhausted: {users} users for {slabs} slabs")]
    PoolExhausted {
        /// Number of registered concurrent users
        users: usize,
        /// Number of slabs in the pool
        slabs: usize,
    },

    /// A record could not be serialized by the writer
    #[error("Bad record '{qname}': {reason}")]
    BadRecord {
        /// Query name of the offending record
        qname: String,
        /// Explanation of the problem
        reason: String,
    },

    /// File format error
    #[error("Invalid {file_type} file '{path}': {reason}")]
    InvalidFileFormat {
        /// Type of file (e.g., "signal", "model")
        file_type: String,
        /// Path to the file
        path: String,
        /// Explanation of the problem
        reason: String,
    },

    /// Underlying I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
