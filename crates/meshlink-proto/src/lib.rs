//! Meshlink Protocol Definitions
//!
//! This crate defines the data model shared by the control plane and the
//! tunnel backends: connection lifecycle states, network map snapshots,
//! backend notifications and remote-shell frames.

pub mod messages;
pub mod netmap;
pub mod state;

pub use messages::{BackendEvent, ShellFrame};
pub use netmap::{NetMap, NetMapNode, PeerNode, SelfNode};
pub use state::{ConnectionState, MachineStatus, ParseStateError};

/// Default terminal type requested for remote shells
pub const DEFAULT_TERM: &str = "xterm";

/// Default remote shell port on overlay peers
pub const SHELL_PORT: u16 = 22;
