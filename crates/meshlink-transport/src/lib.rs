//! Transport abstraction layer for the overlay tunnel
//!
//! The control plane never touches sockets, keys or the overlay wire format.
//! Everything below the control plane is reached through [`TunnelBackend`]:
//! bringing the node up, interactive login, HTTP round trips over the
//! overlay and remote-shell channels to peers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   meshlink-client                        │
//! │   (state machine, fetch bridge, session manager)         │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ TunnelBackend + BackendEvent channel
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │              meshlink-transport (this crate)             │
//! │  - TunnelBackend       - ShellChannel                    │
//! │  - TransportResponse   - TransportError                  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────────┬──────────────────────────┐
//! │ embedding-specific backends  │ mock::MockBackend (tests)│
//! └──────────────────────────────┴──────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use http::{HeaderMap, StatusCode};
use meshlink_proto::{BackendEvent, ShellFrame};
use std::fmt::{self, Debug};
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl TransportError {
    /// Returns true if retrying cannot help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::AuthenticationFailed(_) | TransportError::ConfigurationError(_)
        )
    }

    /// Returns true if a retry with backoff might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Options used to bring the node up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Coordination server URL
    pub control_url: String,
    /// Hostname this node registers under
    pub hostname: String,
    /// Pre-authorized key; skips interactive login when valid
    pub auth_key: Option<String>,
    /// Identity persisted by an earlier login
    pub credential: Option<String>,
}

/// Lazily produced response body
pub type BodyStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;

/// Response to a round trip over the overlay.
///
/// Produced as soon as the headers have arrived; the body is pulled on demand.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response whose body is delivered as the given chunks, in order
    pub fn from_chunks(status: StatusCode, headers: HeaderMap, chunks: Vec<Bytes>) -> Self {
        let body = stream::iter(chunks.into_iter().map(Ok));
        Self::new(status, headers, Box::pin(body))
    }
}

impl Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Peer a remote shell should be opened to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    /// Host string as given by the caller
    pub host: String,
    /// Resolved peer name from the network map
    pub peer_name: String,
    /// Overlay addresses of the peer, preferred first
    pub addresses: Vec<String>,
    pub port: u16,
    pub username: String,
}

/// Control-plane side of a remote-shell channel
#[derive(Debug)]
pub struct ShellChannel {
    /// Frames towards the peer
    pub outbound: mpsc::UnboundedSender<ShellFrame>,
    /// Frames from the peer; `None` once the channel is gone
    pub inbound: mpsc::Receiver<ShellFrame>,
}

/// Backend side of a remote-shell channel
#[derive(Debug)]
pub struct RemoteShellEnd {
    /// Frames sent by the control plane
    pub inbound: mpsc::UnboundedReceiver<ShellFrame>,
    /// Frames delivered to the control plane
    pub outbound: mpsc::Sender<ShellFrame>,
}

impl ShellChannel {
    /// Create a connected pair of channel ends
    pub fn pair(capacity: usize) -> (ShellChannel, RemoteShellEnd) {
        let (to_remote_tx, to_remote_rx) = mpsc::unbounded_channel();
        let (to_local_tx, to_local_rx) = mpsc::channel(capacity);
        (
            ShellChannel {
                outbound: to_remote_tx,
                inbound: to_local_rx,
            },
            RemoteShellEnd {
                inbound: to_remote_rx,
                outbound: to_local_tx,
            },
        )
    }
}

/// Network-interface provider for the overlay.
///
/// Implementations own the secure tunnel, the cryptographic handshake and
/// the overlay wire protocol. State changes are reported asynchronously
/// through the event sender handed to [`TunnelBackend::connect`].
#[async_trait]
pub trait TunnelBackend: Send + Sync + Debug {
    /// Bring the node up and start reporting events.
    ///
    /// Returns once the backend is reachable. Authentication progress is
    /// reported through `events`, never through the return value. Calling
    /// it again after a failure replaces the previous event sender.
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: mpsc::Sender<BackendEvent>,
    ) -> TransportResult<()>;

    /// Begin interactive login; the URL arrives as [`BackendEvent::BrowseToUrl`]
    async fn start_login_interactive(&self) -> TransportResult<()>;

    /// Drop the node identity on the coordination server
    async fn logout(&self) -> TransportResult<()>;

    /// Tear the node down; no events are sent afterwards
    async fn shutdown(&self);

    /// Send an HTTP request over the overlay
    async fn round_trip(&self, request: http::Request<Bytes>)
        -> TransportResult<TransportResponse>;

    /// Open a remote-shell channel to a peer
    async fn dial_shell(&self, target: &ShellTarget) -> TransportResult<ShellChannel>;
}
