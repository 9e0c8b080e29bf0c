use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::TypeSpec;

/// Result type for bridge setup
pub type SetupResult<T> = Result<T, SetupError>;

/// Errors raised while assembling a bridge
///
/// All of these are fatal: a bridge that failed setup must not be started with
/// whatever bindings happened to succeed.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("channel `{0}` is already registered")]
    DuplicateChannel(String),

    #[error("invalid channel name `{name}`: {reason}")]
    InvalidChannelName { name: String, reason: &'static str },

    #[error("channel `{0}` is not present in the registry")]
    UnknownChannel(String),

    #[error("channel `{0}` already has a handler bound")]
    DuplicateBinding(String),

    #[error("handler for `{name}` has shape {actual}, registry declares {expected}")]
    IncompatibleBinding {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("channels without a handler: {}", .0.join(", "))]
    UnboundChannels(Vec<String>),

    #[error("host registry does not serve guest channel `{0}`")]
    MissingChannel(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Stable, minimal classification of a failed call
///
/// This is what crosses the boundary in a failure reply, so it must stay
/// small and must never carry host-internal detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownChannel,
    Marshaling,
    Handler,
    Disconnected,
    TimedOut,
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownChannel => "unknown channel",
            Self::Marshaling => "marshaling",
            Self::Handler => "handler",
            Self::Disconnected => "disconnected",
            Self::TimedOut => "timed out",
            Self::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Which slot of a call a marshaling failure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    /// Zero-based index into the user arguments (the context handle is not counted)
    Argument(usize),
    Result,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(index) => write!(f, "argument {index}"),
            Self::Result => f.write_str("result"),
        }
    }
}

/// A value did not have the shape its declared type requires
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, found {actual}")]
pub struct ShapeError {
    pub expected: String,
    pub actual: String,
}

impl ShapeError {
    /// Shape mismatch between what was expected and what arrived
    pub fn new(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn spec(expected: TypeSpec, actual: impl Into<String>) -> Self {
        Self::new(expected.to_string(), actual)
    }

    /// Attach the call site this shape error was found at
    pub fn at(self, channel: impl Into<String>, position: Position) -> MarshalingError {
        MarshalingError {
            channel: channel.into(),
            position,
            expected: self.expected,
            actual: self.actual,
        }
    }
}

/// An argument or result violated the channel's declared types
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("`{channel}` {position}: expected {expected}, found {actual}")]
pub struct MarshalingError {
    pub channel: String,
    pub position: Position,
    pub expected: String,
    pub actual: String,
}

/// Errors a guest sees as the outcome of one call
///
/// A `CallError` only ever rejects the call it belongs to; other in-flight
/// calls and the bridge itself are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    #[error("marshaling error: {0}")]
    Marshaling(#[from] MarshalingError),

    #[error("handler for `{channel}` failed (reference {reference})")]
    Handler { channel: String, reference: u64 },

    #[error("bridge disconnected during call to `{0}`")]
    Disconnected(String),

    #[error("call to `{0}` timed out")]
    TimedOut(String),

    #[error("protocol error on `{channel}`: {message}")]
    Protocol { channel: String, message: String },
}

impl CallError {
    /// Stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownChannel(_) => ErrorKind::UnknownChannel,
            Self::Marshaling(_) => ErrorKind::Marshaling,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    /// Name of the channel the failed call targeted
    pub fn channel(&self) -> &str {
        match self {
            Self::UnknownChannel(channel)
            | Self::Handler { channel, .. }
            | Self::Disconnected(channel)
            | Self::TimedOut(channel)
            | Self::Protocol { channel, .. } => channel,
            Self::Marshaling(e) => &e.channel,
        }
    }
}
