//! Messages exchanged between the control plane and a tunnel backend

use serde::{Deserialize, Serialize};

/// Notification pushed by a tunnel backend to the control plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BackendEvent {
    /// No usable identity; interactive login is required
    NeedsLogin,
    /// Interactive login URL the user must visit
    BrowseToUrl { url: String },
    /// Login finished; the credential identifies this node on later starts
    Authenticated { credential: String },
    /// Control plane requires administrator approval of this device
    NeedsMachineAuth,
    /// Engine is up and the node may send traffic
    Running,
    /// Engine stopped on the backend side
    Stopped,
    /// Serialized topology snapshot (JSON form of `NetMap`)
    NetMap { payload: String },
    /// The link to the control plane or the data plane failed
    TransportFailure { reason: String, recoverable: bool },
}

/// Frame on a remote-shell channel.
///
/// Frames flowing towards the peer: `PtyRequest`, `Shell`, `Data`,
/// `WindowChange`, `Eof`. Frames flowing back: `Ready`, `Stdout`, `Stderr`,
/// `Exit`, `Rejected`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ShellFrame {
    PtyRequest {
        term: String,
        rows: u16,
        cols: u16,
    },
    Shell,
    Ready,
    Data(Vec<u8>),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    WindowChange {
        rows: u16,
        cols: u16,
    },
    Eof,
    Exit {
        status: Option<u32>,
    },
    Rejected {
        reason: String,
    },
}
