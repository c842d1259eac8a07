use thiserror::Error;

use crate::probe::edbg::avr8::FailureCode;
use crate::probe::TransportError;

/// Top-level error type for the whole target-control pipeline.
///
/// Each variant corresponds to one failure kind; handler boundaries
/// (the RSP packet handlers, the controller dispatch loop) match on
/// these instead of catching blindly.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A required target parameter or descriptor field is missing, or
    /// target bring-up failed in a way that prevents a debug session.
    #[error("device initialisation failure: {0}")]
    DeviceInit(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The probe answered a command with a FAILED response.
    #[error("{message} (failure code: {code:?})")]
    Protocol {
        message: String,
        code: Option<FailureCode>,
    },

    /// debugWire physical activation failed in the specific way that
    /// warrants DWEN fuse management.
    #[error("failed to activate the debugWire physical interface: {0}")]
    DebugWirePhysical(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A command was rejected before dispatch because the controller
    /// or target is in the wrong state.
    #[error("precondition failure: {0}")]
    Precondition(String),

    /// Signature mismatch or a failed post-write fuse verification.
    #[error("integrity failure: {0}")]
    Integrity(String),
}

impl Error {
    pub fn protocol(message: impl Into<String>, code: Option<FailureCode>) -> Self {
        Error::Protocol {
            message: message.into(),
            code,
        }
    }

    /// True if this error is the debugWire activation failure that
    /// should trigger the DWEN fuse update procedure.
    pub fn is_debug_wire_activation_failure(&self) -> bool {
        matches!(self, Error::DebugWirePhysical(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown environment \"{0}\"")]
    UnknownEnvironment(String),

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
