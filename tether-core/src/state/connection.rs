//! Client connection state machine.
//!
//! Models the lifecycle a reconnect supervisor drives a session through,
//! with validated transitions that return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::TetherError;

// ── ConnectionState ──────────────────────────────────────────────

/// The current state of a supervised client connection.
///
/// ```text
///                 ┌──────────── Retrying ◄───────────┐
///                 │                ▲                 │
///                 ▼                │                 │
///  Disconnected ──► Connecting ──► Connected ──► Disconnected
///       ▲               │              │
///       │               ▼              ▼
///       └────────────── Error ◄────────┘
/// ```
///
/// `Retrying` is the `Connecting` sub-state used for supervised
/// reconnect attempts; the first connect never enters it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,

    /// First connect in progress.
    Connecting,

    /// Supervised reconnect attempt `attempt` (1-based) in progress.
    Retrying { attempt: u32 },

    Connected {
        /// When the connection entered the `Connected` state.
        since: Instant,
    },

    /// The last connect failed or the link broke with an error.
    Error { message: String },
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Retrying { attempt } => write!(f, "Retrying (attempt {attempt})"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Error { message } => write!(f, "Error: {message}"),
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// `Connecting` or `Retrying`.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Retrying { .. })
    }

    /// No link and no attempt in progress.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error { .. })
    }

    /// How long the connection has been up. `None` for any other state.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`, `Error`.
    pub fn begin_connect(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Disconnected | Self::Error { .. } => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(TetherError::ProtocolViolation(
                "cannot connect: a connection is already up or in progress",
            )),
        }
    }

    /// Valid from: `Disconnected`, `Error`, `Retrying`.
    pub fn begin_retry(&mut self, attempt: u32) -> Result<(), TetherError> {
        match self {
            Self::Disconnected | Self::Error { .. } | Self::Retrying { .. } => {
                *self = Self::Retrying { attempt };
                Ok(())
            }
            _ => Err(TetherError::ProtocolViolation(
                "cannot retry: not disconnected",
            )),
        }
    }

    /// Valid from: `Connecting`, `Retrying`.
    pub fn complete_connect(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Connecting | Self::Retrying { .. } => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(TetherError::ProtocolViolation(
                "cannot complete connect: no attempt in progress",
            )),
        }
    }

    /// Valid from: `Connecting`, `Retrying`, `Connected`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TetherError> {
        match self {
            Self::Connecting | Self::Retrying { .. } | Self::Connected { .. } => {
                *self = Self::Error {
                    message: message.into(),
                };
                Ok(())
            }
            _ => Err(TetherError::ProtocolViolation(
                "cannot fail: no connection or attempt in progress",
            )),
        }
    }

    /// The link went away. Valid from: `Connected`.
    pub fn lose(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Connected { .. } => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(TetherError::ProtocolViolation(
                "cannot lose a connection that is not up",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── Tests ────────────────────────────────────────────────────────
