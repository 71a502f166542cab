//! Unified error types for the calibration platform.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! top-level run orchestration's error handling uniform. Transport-level
//! failures deliberately stay local to their component (a timed-out query
//! returns "no value" and the next cycle retries); only the variants below
//! ever propagate upward.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation that crosses a component boundary funnels into
/// this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A serial or network link failed.
    Transport(TransportError),
    /// The pressure controller rejected or aborted an operation.
    Control(ControlError),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Control(e) => write!(f, "control: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// A serial write exceeded its deadline.
    WriteTimeout,
    /// A reply did not arrive within the deadline.
    ReadTimeout,
    /// The reply contained no numeric field.
    Unparseable,
    /// The link has failed repeatedly and is considered down.
    LostLink,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteTimeout => write!(f, "write timeout"),
            Self::ReadTimeout => write!(f, "read timeout"),
            Self::Unparseable => write!(f, "unparseable reply"),
            Self::LostLink => write!(f, "link lost"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Control errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// A setpoint or channel was outside the configured range.
    /// The `&'static str` names the offending input.
    OutOfRange(&'static str),
    /// The inlet valve did not confirm closed within the pump-down deadline.
    PumpDownTimeout,
    /// The emergency stop is latched; no motion commands are accepted.
    EmergencyStop,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange(what) => write!(f, "out of range: {what}"),
            Self::PumpDownTimeout => write!(f, "inlet valve did not close within pump-down deadline"),
            Self::EmergencyStop => write!(f, "emergency stop active"),
        }
    }
}

impl From<ControlError> for Error {
    fn from(e: ControlError) -> Self {
        Self::Control(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
