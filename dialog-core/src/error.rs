//! Error taxonomy for the dialog core.

use thiserror::Error;

use crate::state::DialogState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy described for the dialog core: malformed input,
/// lookup misses, illegal state transitions, allocation failure,
/// collaborator failures, and startup configuration problems.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed parameters, unknown profile name, or unknown state name.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// A dialog or profile lookup produced no match.
    #[error("not found")]
    NotFound,

    /// The requested state transition is not permitted from the current state.
    #[error("cannot apply '{event}' to a dialog in state {from:?}")]
    Conflict {
        /// State the dialog was in when the event arrived.
        from: DialogState,
        /// Name of the event that was rejected.
        event: &'static str,
    },

    /// Allocation failed while handling an event; the event was aborted and
    /// any partial references released.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The transaction engine rejected a send issued on behalf of a dialog.
    #[error("downstream send failed: {0}")]
    DownstreamFailed(String),

    /// A startup configuration parameter is invalid; the module refuses to
    /// initialize.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Numeric fault code surfaced to RPC callers (400/404/500), matching
    /// the user-visible behavior described for the control surface.
    pub fn fault_code(&self) -> u32 {
        match self {
            Error::InputInvalid(_) | Error::Configuration(_) => 400,
            Error::NotFound => 404,
            Error::Conflict { .. } => 409,
            Error::ResourceExhausted | Error::DownstreamFailed(_) => 500,
        }
    }

    /// Small integer result matching the script-caller convention: `< 0`
    /// on error, distinguishing the error kind.
    pub fn script_code(&self) -> i32 {
        match self {
            Error::InputInvalid(_) => -1,
            Error::NotFound => -2,
            Error::Conflict { .. } => -3,
            Error::ResourceExhausted => -4,
            Error::DownstreamFailed(_) => -5,
            Error::Configuration(_) => -6,
        }
    }
}
