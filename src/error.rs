//! Custom error types for the pick-and-place core.
//!
//! `PnpError` is the crate-wide error. The narrower enums describe failures at
//! a single seam:
//!
//! - **`TransportError`**: the device channel could not open, write, or read.
//!   Adapters convert these into failure *values* (`false`, `Unknown`,
//!   `Error`) and never let them escape `send_command`/`query_status`/`measure`.
//! - **`PlanError`**: a submitted plan was rejected by intake validation.
//! - **`ActionError`**: a motion sub-step was refused or a coordinate lookup
//!   failed under the `reject` policy. The executor turns this into the
//!   terminal `Error` run state.
//!
//! By using `#[from]`, `PnpError` can be created from all of them with `?`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PnpError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum PnpError {
    /// Figment failed to load or deserialize the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error outside the device channels (plan files, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Plan file could not be decoded.
    #[error("Plan decode error: {0}")]
    PlanDecode(#[from] serde_json::Error),

    /// Device channel failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Plan intake rejected the plan.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// A logical action failed.
    #[error(transparent)]
    Action(#[from] ActionError),
}

impl From<figment::Error> for PnpError {
    fn from(err: figment::Error) -> Self {
        PnpError::Config(Box::new(err))
    }
}

/// Failures of the line-oriented device channel.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Operation attempted on a channel that is not open.
    #[error("Device channel '{0}' not connected")]
    NotConnected(String),

    /// The port could not be opened.
    #[error("Failed to open '{port}' at {baud_rate} baud: {reason}")]
    Open {
        /// Port path
        port: String,
        /// Configured baud rate
        baud_rate: u32,
        /// Driver-level reason
        reason: String,
    },

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    /// The port reported end-of-stream.
    #[error("Unexpected EOF from '{0}'")]
    UnexpectedEof(String),

    /// More than `limit` bytes arrived without a line terminator.
    #[error("Line from '{port}' exceeds {limit} bytes without a terminator")]
    LineTooLong {
        /// Port path
        port: String,
        /// Buffer limit in bytes
        limit: usize,
    },

    /// Read or write failed.
    #[error("I/O error on device channel: {0}")]
    Io(#[from] std::io::Error),
}

/// Plan intake validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The plan has no items.
    #[error("Plan is empty")]
    Empty,

    /// The same part appears twice (compared case-insensitively).
    #[error("Duplicate component in plan: {0}")]
    DuplicatePart(String),

    /// An item has an empty part or pad identifier.
    #[error("Plan item {index} has a blank {field}")]
    BlankField {
        /// Zero-based item index
        index: usize,
        /// Name of the blank field
        field: &'static str,
    },
}

/// Failures of the logical pick/place/test-station actions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The motion controller rejected or did not acknowledge a command.
    #[error("Motion command not acknowledged: {0}")]
    CommandFailed(String),

    /// The part has no feeder coordinate and the policy is `reject`.
    #[error("No feeder coordinate for part '{0}'")]
    UnmappedPart(String),

    /// The pad has no coordinate and the policy is `reject`.
    #[error("No coordinate for pad '{0}'")]
    UnmappedPad(String),

    /// The measurement trigger failed at the transport level.
    #[error("Measurement failed: {0}")]
    MeasurementFailed(String),
}
