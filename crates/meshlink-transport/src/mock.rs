//! Scriptable in-process backend for tests
//!
//! [`MockBackend`] emulates a coordination server and a set of peers well
//! enough to drive the control plane through login, topology updates, HTTP
//! round trips and remote shells without any network.

use crate::{
    ConnectOptions, RemoteShellEnd, ShellChannel, ShellTarget, TransportError, TransportResponse,
    TransportResult, TunnelBackend,
};
use async_trait::async_trait;
use bytes::Bytes;
use meshlink_proto::{BackendEvent, ShellFrame};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Prefix of credentials handed out by the mock coordination server
pub const CREDENTIAL_PREFIX: &str = "cred-";

/// How dialed peers answer a remote-shell request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellBehavior {
    /// Grant a shell that echoes input back on stdout
    #[default]
    Accept,
    /// Accept the connection but never answer the shell request
    Hang,
    /// Refuse the connection outright
    Refuse,
}

type HttpHandler =
    Arc<dyn Fn(http::Request<Bytes>) -> TransportResult<TransportResponse> + Send + Sync>;

#[derive(Default)]
struct MockState {
    events: Option<mpsc::Sender<BackendEvent>>,
    connect_failures: usize,
    valid_auth_keys: Vec<String>,
    netmap: Option<String>,
    login_url: String,
    auto_login: bool,
    http_handler: Option<HttpHandler>,
    shell_behavior: ShellBehavior,
    shell_banner: Option<Vec<u8>>,
    last_options: Option<ConnectOptions>,
    window_changes: Arc<Mutex<Vec<(u16, u16)>>>,
    connect_calls: usize,
    login_calls: usize,
    logout_calls: usize,
    round_trips: usize,
    shell_dials: usize,
    shutdowns: usize,
}

impl MockState {
    fn emit(&self, event: BackendEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(event) {
                debug!("mock backend dropped event: {}", e);
            }
        }
    }

    fn emit_authenticated(&self, credential: String) {
        self.emit(BackendEvent::Authenticated { credential });
        self.emit(BackendEvent::Running);
        if let Some(payload) = &self.netmap {
            self.emit(BackendEvent::NetMap {
                payload: payload.clone(),
            });
        }
    }
}

/// In-process [`TunnelBackend`] with scripted behaviour and call counters
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MockBackend")
            .field("connected", &state.events.is_some())
            .field("connect_calls", &state.connect_calls)
            .field("round_trips", &state.round_trips)
            .field("shell_dials", &state.shell_dials)
            .finish()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.lock().login_url = "https://login.mesh.example/a/mock".to_string();
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept this pre-authorized key on connect
    pub fn with_auth_key(self, key: &str) -> Self {
        self.lock().valid_auth_keys.push(key.to_string());
        self
    }

    /// Fail the next `count` connect attempts with a recoverable error
    pub fn with_connect_failures(self, count: usize) -> Self {
        self.lock().connect_failures = count;
        self
    }

    /// Topology snapshot sent whenever the node reaches `Running`
    pub fn with_netmap(self, payload: &str) -> Self {
        self.lock().netmap = Some(payload.to_string());
        self
    }

    pub fn with_login_url(self, url: &str) -> Self {
        self.lock().login_url = url.to_string();
        self
    }

    /// Complete interactive login right after sending the URL
    pub fn with_auto_login(self, enabled: bool) -> Self {
        self.lock().auto_login = enabled;
        self
    }

    pub fn with_shell_behavior(self, behavior: ShellBehavior) -> Self {
        self.lock().shell_behavior = behavior;
        self
    }

    /// Stdout sent by accepted shells before they report ready
    pub fn with_shell_banner(self, banner: &str) -> Self {
        self.lock().shell_banner = Some(banner.as_bytes().to_vec());
        self
    }

    pub fn with_http_handler<F>(self, handler: F) -> Self
    where
        F: Fn(http::Request<Bytes>) -> TransportResult<TransportResponse> + Send + Sync + 'static,
    {
        self.lock().http_handler = Some(Arc::new(handler));
        self
    }

    /// Push an event to the control plane as if the backend produced it
    pub fn emit(&self, event: BackendEvent) {
        self.lock().emit(event);
    }

    /// Finish a pending interactive login
    pub fn complete_login(&self) {
        self.lock()
            .emit_authenticated(format!("{}interactive", CREDENTIAL_PREFIX));
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.lock().last_options.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn login_calls(&self) -> usize {
        self.lock().login_calls
    }

    pub fn logout_calls(&self) -> usize {
        self.lock().logout_calls
    }

    pub fn round_trips(&self) -> usize {
        self.lock().round_trips
    }

    pub fn shell_dials(&self) -> usize {
        self.lock().shell_dials
    }

    pub fn shutdowns(&self) -> usize {
        self.lock().shutdowns
    }

    /// Window sizes received by accepted shells, in arrival order
    pub fn window_changes(&self) -> Vec<(u16, u16)> {
        let changes = self.lock().window_changes.clone();
        let recorded = changes.lock().unwrap_or_else(|e| e.into_inner());
        recorded.clone()
    }
}

#[async_trait]
impl TunnelBackend for MockBackend {
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: mpsc::Sender<BackendEvent>,
    ) -> TransportResult<()> {
        let mut state = self.lock();
        state.connect_calls += 1;
        state.last_options = Some(options.clone());

        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::ConnectionError(
                "mock: coordination server unreachable".to_string(),
            ));
        }

        if let Some(key) = &options.auth_key {
            if !state.valid_auth_keys.contains(key) {
                return Err(TransportError::AuthenticationFailed(format!(
                    "auth key {} rejected",
                    key
                )));
            }
            state.events = Some(events);
            state.emit_authenticated(format!("{}{}", CREDENTIAL_PREFIX, key));
            return Ok(());
        }

        state.events = Some(events);
        if let Some(credential) = &options.credential {
            if credential.starts_with(CREDENTIAL_PREFIX) {
                state.emit(BackendEvent::Running);
                if let Some(payload) = state.netmap.clone() {
                    state.emit(BackendEvent::NetMap { payload });
                }
            } else {
                state.emit(BackendEvent::NeedsLogin);
            }
        }
        Ok(())
    }

    async fn start_login_interactive(&self) -> TransportResult<()> {
        let mut state = self.lock();
        state.login_calls += 1;
        if state.events.is_none() {
            return Err(TransportError::ConnectionError(
                "mock: not connected".to_string(),
            ));
        }

        let url = state.login_url.clone();
        state.emit(BackendEvent::BrowseToUrl { url });
        if state.auto_login {
            state.emit_authenticated(format!("{}interactive", CREDENTIAL_PREFIX));
        }
        Ok(())
    }

    async fn logout(&self) -> TransportResult<()> {
        self.lock().logout_calls += 1;
        Ok(())
    }

    async fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdowns += 1;
        state.events = None;
    }

    async fn round_trip(
        &self,
        request: http::Request<Bytes>,
    ) -> TransportResult<TransportResponse> {
        let handler = {
            let mut state = self.lock();
            state.round_trips += 1;
            state.http_handler.clone()
        };

        match handler {
            Some(handler) => handler(request),
            None => Err(TransportError::ConnectionError(format!(
                "mock: no route to {}",
                request.uri()
            ))),
        }
    }

    async fn dial_shell(&self, target: &ShellTarget) -> TransportResult<ShellChannel> {
        let (behavior, banner, window_changes) = {
            let mut state = self.lock();
            state.shell_dials += 1;
            (
                state.shell_behavior,
                state.shell_banner.clone(),
                state.window_changes.clone(),
            )
        };
        debug!(
            "mock dial {}@{}:{} ({:?})",
            target.username, target.peer_name, target.port, behavior
        );

        match behavior {
            ShellBehavior::Refuse => Err(TransportError::ConnectionError(format!(
                "mock: {} refused the connection",
                target.peer_name
            ))),
            ShellBehavior::Hang => {
                let (channel, remote) = ShellChannel::pair(16);
                tokio::spawn(hang_shell(remote));
                Ok(channel)
            }
            ShellBehavior::Accept => {
                let (channel, remote) = ShellChannel::pair(16);
                tokio::spawn(echo_shell(remote, banner, window_changes));
                Ok(channel)
            }
        }
    }
}

/// Keeps the channel open without ever granting the shell
async fn hang_shell(mut remote: RemoteShellEnd) {
    while remote.inbound.recv().await.is_some() {}
}

/// Echo shell: stdout mirrors input, lines starting with `err:` go to
/// stderr and `exit` ends the session
async fn echo_shell(
    mut remote: RemoteShellEnd,
    banner: Option<Vec<u8>>,
    window_changes: Arc<Mutex<Vec<(u16, u16)>>>,
) {
    while let Some(frame) = remote.inbound.recv().await {
        let reply = match frame {
            ShellFrame::PtyRequest { rows, cols, .. } | ShellFrame::WindowChange { rows, cols } => {
                window_changes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((rows, cols));
                continue;
            }
            ShellFrame::Shell => {
                if let Some(banner) = banner.clone() {
                    if remote.outbound.send(ShellFrame::Stdout(banner)).await.is_err() {
                        break;
                    }
                }
                ShellFrame::Ready
            }
            ShellFrame::Data(data) if data.starts_with(b"exit") => {
                let _ = remote.outbound.send(ShellFrame::Exit { status: Some(0) }).await;
                break;
            }
            ShellFrame::Data(data) if data.starts_with(b"err:") => ShellFrame::Stderr(data),
            ShellFrame::Data(data) => ShellFrame::Stdout(data),
            ShellFrame::Eof => {
                let _ = remote.outbound.send(ShellFrame::Exit { status: None }).await;
                break;
            }
            other => {
                debug!("mock shell ignoring {:?}", other);
                continue;
            }
        };

        if remote.outbound.send(reply).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(auth_key: Option<&str>, credential: Option<&str>) -> ConnectOptions {
        ConnectOptions {
            control_url: "https://control.mesh.example".to_string(),
            hostname: "test-node".to_string(),
            auth_key: auth_key.map(str::to_string),
            credential: credential.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_valid_auth_key_reports_running() {
        let backend = MockBackend::new().with_auth_key("tskey-valid");
        let (tx, mut rx) = mpsc::channel(8);

        backend
            .connect(&options(Some("tskey-valid"), None), tx)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(BackendEvent::Authenticated {
                credential: "cred-tskey-valid".to_string()
            })
        );
        assert_eq!(rx.recv().await, Some(BackendEvent::Running));
    }

    #[tokio::test]
    async fn test_invalid_auth_key_is_non_recoverable() {
        let backend = MockBackend::new();
        let (tx, _rx) = mpsc::channel(8);

        let err = backend
            .connect(&options(Some("bogus"), None), tx)
            .await
            .unwrap_err();
        assert!(err.is_non_recoverable());
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let backend = MockBackend::new().with_connect_failures(2);

        for _ in 0..2 {
            let (tx, _rx) = mpsc::channel(8);
            let err = backend.connect(&options(None, None), tx).await.unwrap_err();
            assert!(err.is_recoverable());
        }
        let (tx, _rx) = mpsc::channel(8);
        assert!(backend.connect(&options(None, None), tx).await.is_ok());
        assert_eq!(backend.connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_echo_shell() {
        let backend = MockBackend::new();
        let target = ShellTarget {
            host: "peer-1".to_string(),
            peer_name: "peer-1.mesh.example.".to_string(),
            addresses: vec!["100.64.0.2".to_string()],
            port: 22,
            username: "root".to_string(),
        };

        let mut channel = backend.dial_shell(&target).await.unwrap();
        channel
            .outbound
            .send(ShellFrame::PtyRequest {
                term: "xterm".to_string(),
                rows: 24,
                cols: 80,
            })
            .unwrap();
        channel.outbound.send(ShellFrame::Shell).unwrap();
        assert_eq!(channel.inbound.recv().await, Some(ShellFrame::Ready));

        channel.outbound.send(ShellFrame::Data(b"ls\n".to_vec())).unwrap();
        assert_eq!(
            channel.inbound.recv().await,
            Some(ShellFrame::Stdout(b"ls\n".to_vec()))
        );

        channel.outbound.send(ShellFrame::Data(b"exit".to_vec())).unwrap();
        assert_eq!(
            channel.inbound.recv().await,
            Some(ShellFrame::Exit { status: Some(0) })
        );
        assert_eq!(backend.window_changes(), vec![(24, 80)]);
    }
}
