//! Lifecycle and machine trust states

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of the tunnel connection.
///
/// Exactly one value is authoritative at any instant. The names match the
/// strings delivered to hosts (`"NoState"`, `"Running"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    NoState,
    InUseOtherUser,
    NeedsLogin,
    NeedsMachineAuth,
    Stopped,
    Starting,
    Running,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 7] = [
        ConnectionState::NoState,
        ConnectionState::InUseOtherUser,
        ConnectionState::NeedsLogin,
        ConnectionState::NeedsMachineAuth,
        ConnectionState::Stopped,
        ConnectionState::Starting,
        ConnectionState::Running,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::NoState => "NoState",
            ConnectionState::InUseOtherUser => "InUseOtherUser",
            ConnectionState::NeedsLogin => "NeedsLogin",
            ConnectionState::NeedsMachineAuth => "NeedsMachineAuth",
            ConnectionState::Stopped => "Stopped",
            ConnectionState::Starting => "Starting",
            ConnectionState::Running => "Running",
        }
    }

    /// True only for `Running`, the one state in which traffic may flow
    pub fn is_running(&self) -> bool {
        matches!(self, ConnectionState::Running)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state or status name
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseStateError {
    kind: &'static str,
    value: String,
}

impl FromStr for ConnectionState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError {
                kind: "connection state",
                value: s.to_string(),
            })
    }
}

/// Trust state of the local node identity.
///
/// Independent of [`ConnectionState`]: a node may be `Running` while its
/// machine is still `MachineUnauthorized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineStatus {
    #[default]
    MachineUnknown,
    MachineUnauthorized,
    MachineAuthorized,
    MachineInvalid,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::MachineUnknown => "MachineUnknown",
            MachineStatus::MachineUnauthorized => "MachineUnauthorized",
            MachineStatus::MachineAuthorized => "MachineAuthorized",
            MachineStatus::MachineInvalid => "MachineInvalid",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineStatus {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            MachineStatus::MachineUnknown,
            MachineStatus::MachineUnauthorized,
            MachineStatus::MachineAuthorized,
            MachineStatus::MachineInvalid,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| ParseStateError {
            kind: "machine status",
            value: s.to_string(),
        })
    }
}
