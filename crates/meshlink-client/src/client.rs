//! Host-facing client

use crate::config::MeshConfig;
use crate::control::{Command, ControlHandle, Shared};
use crate::fetch::{FetchBridge, FetchResponse};
use crate::notify::{Callbacks, Notifier};
use crate::ssh::{self, SshSession, TermConfig};
use bytes::Bytes;
use meshlink_proto::{ConnectionState, NetMap, PeerNode, SelfNode};
use meshlink_transport::{TransportError, TunnelBackend};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Control-plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Call made out of order (e.g. `start` twice, `login` before `start`)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Not connected (state: {state}, locked out: {locked_out})")]
    NotConnected {
        state: ConnectionState,
        locked_out: bool,
    },

    #[error("Peer {host} unavailable: {reason}")]
    PeerCapability { host: String, reason: String },

    #[error("Response body already consumed")]
    BodyAlreadyConsumed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Decode error: {0}")]
    Decode(String),
}

impl ControlError {
    /// Returns true if the same call may succeed later without host action
    pub fn is_recoverable(&self) -> bool {
        match self {
            ControlError::NotConnected { .. } => true,
            ControlError::Transport(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Embeddable overlay client.
///
/// Entry points never block on the network: lifecycle calls enqueue work
/// for the control loop, `ssh` returns a handle at once, and `fetch` waits
/// only for response headers. Must be used from within a Tokio runtime.
pub struct MeshClient {
    shared: Arc<Shared>,
    fetch: FetchBridge,
    control: Mutex<Option<ControlHandle>>,
}

impl MeshClient {
    pub fn new(backend: Arc<dyn TunnelBackend>) -> Self {
        let shared = Arc::new(Shared::new(backend));
        Self {
            fetch: FetchBridge::new(shared.clone()),
            shared,
            control: Mutex::new(None),
        }
    }

    fn control(&self) -> MutexGuard<'_, Option<ControlHandle>> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the control loop. Fails while a previous loop is still live.
    pub fn start(
        &self,
        config: MeshConfig,
        callbacks: Arc<dyn Callbacks>,
    ) -> Result<(), ControlError> {
        let mut control = self.control();
        if control.as_ref().is_some_and(ControlHandle::is_live) {
            return Err(ControlError::Lifecycle("already started".to_string()));
        }

        info!("Starting mesh client {}", config.hostname);
        let (notifier, _dispatcher) = Notifier::spawn(callbacks);
        *control = Some(ControlHandle::spawn(self.shared.clone(), notifier, config));
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), ControlError> {
        match self.control().as_ref() {
            Some(handle) => handle.send(command),
            None => Err(ControlError::Lifecycle("not started".to_string())),
        }
    }

    /// Begin interactive login. The URL arrives through
    /// `notify_browse_to_url`; a no-op while `Running`.
    pub fn login(&self) -> Result<(), ControlError> {
        self.send(Command::Login)
    }

    /// Forget the node identity and move to `Stopped`
    pub fn logout(&self) -> Result<(), ControlError> {
        self.send(Command::Logout)
    }

    /// Stop the control loop and wait for it to tear down
    pub async fn shutdown(&self) {
        let handle = self.control().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver that starts with the current state and sees every
    /// published change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn get_self(&self) -> Option<SelfNode> {
        self.shared.netmap.get_self()
    }

    pub fn get_peers(&self) -> Vec<PeerNode> {
        self.shared.netmap.get_peers()
    }

    pub fn net_map(&self) -> Option<Arc<NetMap>> {
        self.shared.netmap.snapshot()
    }

    pub async fn fetch(&self, request: http::Request<Bytes>) -> Result<FetchResponse, ControlError> {
        self.fetch.fetch(request).await
    }

    pub async fn fetch_with_cancel(
        &self,
        request: http::Request<Bytes>,
        cancel: CancellationToken,
    ) -> Result<FetchResponse, ControlError> {
        self.fetch.fetch_with_cancel(request, cancel).await
    }

    /// Open a remote shell to `host`.
    ///
    /// Always returns a handle. When validation fails the handle is already
    /// closed, carries the error in [`SshSession::rejection`], and `on_done`
    /// has fired.
    pub fn ssh(&self, host: &str, username: &str, config: TermConfig) -> SshSession {
        ssh::open(&self.shared, host, username, config)
    }

    /// Number of sessions not yet closed
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }
}
