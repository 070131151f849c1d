//! Remote shell sessions
//!
//! `ssh()` validates synchronously and hands back an [`SshSession`] handle;
//! negotiation and data flow run on one task per session, so the callbacks
//! of a session never overlap.
//!
//! ```text
//! Negotiating ──ready──> Connected ──close/exit/eof──> Closed
//!      │                                                  ^
//!      └──────────── timeout/dial error/close ────────────┘
//! ```

use crate::client::ControlError;
use crate::control::Shared;
use crate::notify::{contain, Notifier};
use meshlink_proto::{ShellFrame, DEFAULT_TERM, SHELL_PORT};
use meshlink_transport::{ShellChannel, ShellTarget};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Negotiation deadline when the host does not set one
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

pub type OutputFn = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type SetReadFn = Arc<dyn Fn(ReadFn) + Send + Sync>;
pub type SessionEventFn = Arc<dyn Fn() + Send + Sync>;

/// Terminal geometry and host hooks for a session.
///
/// Hooks left unset do nothing.
#[derive(Clone)]
pub struct TermConfig {
    pub rows: u16,
    pub cols: u16,
    /// Negotiation deadline, [`DEFAULT_SESSION_TIMEOUT`] when `None`
    pub timeout: Option<Duration>,
    write_fn: OutputFn,
    write_error_fn: OutputFn,
    set_read_fn: SetReadFn,
    on_connection_progress: ProgressFn,
    on_connected: SessionEventFn,
    on_done: SessionEventFn,
}

impl fmt::Debug for TermConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TermConfig")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for TermConfig {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl TermConfig {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            timeout: None,
            write_fn: Arc::new(|_: &[u8]| {}),
            write_error_fn: Arc::new(|_: &[u8]| {}),
            set_read_fn: Arc::new(|_: ReadFn| {}),
            on_connection_progress: Arc::new(|_: &str| {}),
            on_connected: Arc::new(|| {}),
            on_done: Arc::new(|| {}),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Remote stdout
    pub fn write_fn(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.write_fn = Arc::new(f);
        self
    }

    /// Remote stderr
    pub fn write_error_fn(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.write_error_fn = Arc::new(f);
        self
    }

    /// Receives the input hook once the session is connected
    pub fn set_read_fn(mut self, f: impl Fn(ReadFn) + Send + Sync + 'static) -> Self {
        self.set_read_fn = Arc::new(f);
        self
    }

    pub fn on_connection_progress(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connection_progress = Arc::new(f);
        self
    }

    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Arc::new(f);
        self
    }

    pub fn on_done(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_done = Arc::new(f);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Negotiating,
    Connected,
    Closed,
}

struct SessionState {
    status: SessionStatus,
    rows: u16,
    cols: u16,
    outbound: Option<mpsc::UnboundedSender<ShellFrame>>,
}

struct SessionInner {
    id: u64,
    host: String,
    username: String,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    rejection: OnceLock<ControlError>,
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the channel; returns the geometry to request, or `None`
    /// if the session was closed meanwhile
    fn attach(&self, outbound: mpsc::UnboundedSender<ShellFrame>) -> Option<(u16, u16)> {
        let mut state = self.state();
        if state.status == SessionStatus::Closed {
            return None;
        }
        state.outbound = Some(outbound);
        Some((state.rows, state.cols))
    }

    fn mark_connected(&self) -> bool {
        let mut state = self.state();
        if state.status != SessionStatus::Negotiating {
            return false;
        }
        state.status = SessionStatus::Connected;
        true
    }

    fn send_if_connected(&self, frame: ShellFrame) -> bool {
        let state = self.state();
        if state.status != SessionStatus::Connected {
            return false;
        }
        state
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(frame).is_ok())
    }

    /// Final transition; tells the peer we are gone
    fn finish(&self) {
        let mut state = self.state();
        state.status = SessionStatus::Closed;
        if let Some(outbound) = state.outbound.take() {
            let _ = outbound.send(ShellFrame::Eof);
        }
    }
}

/// Host handle to a shell session
#[derive(Clone)]
pub struct SshSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("id", &self.inner.id)
            .field("host", &self.inner.host)
            .field("status", &self.status())
            .finish()
    }
}

impl SshSession {
    fn new(
        id: u64,
        host: &str,
        username: &str,
        config: &TermConfig,
        status: SessionStatus,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                host: host.to_string(),
                username: username.to_string(),
                state: Mutex::new(SessionState {
                    status,
                    rows: config.rows,
                    cols: config.cols,
                    outbound: None,
                }),
                cancel: CancellationToken::new(),
                rejection: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state().status
    }

    /// Current terminal size as `(rows, cols)`
    pub fn size(&self) -> (u16, u16) {
        let state = self.inner.state();
        (state.rows, state.cols)
    }

    /// Why `ssh()` refused this session, if it did
    pub fn rejection(&self) -> Option<&ControlError> {
        self.inner.rejection.get()
    }

    fn reject(&self, error: ControlError) {
        self.inner.state().status = SessionStatus::Closed;
        let _ = self.inner.rejection.set(error);
    }

    /// Input hook; the same one handed to `set_read_fn` on connect
    pub fn read_fn(&self) -> ReadFn {
        ReadFn {
            session: self.inner.clone(),
        }
    }

    /// Change the terminal size. Only possible while connected.
    pub fn resize(&self, rows: u16, cols: u16) -> bool {
        let mut state = self.inner.state();
        if state.status != SessionStatus::Connected {
            return false;
        }
        let sent = state
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(ShellFrame::WindowChange { rows, cols }).is_ok());
        if sent {
            state.rows = rows;
            state.cols = cols;
        }
        sent
    }

    /// Close the session. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.inner.state();
            if state.status == SessionStatus::Closed {
                return false;
            }
            state.status = SessionStatus::Closed;
        }
        debug!("Closing session {} to {}", self.inner.id, self.inner.host);
        self.inner.cancel.cancel();
        true
    }
}

/// Host input hook for a session
#[derive(Clone)]
pub struct ReadFn {
    session: Arc<SessionInner>,
}

impl fmt::Debug for ReadFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadFn")
            .field("session", &self.session.id)
            .finish()
    }
}

impl ReadFn {
    /// Forward input to the remote shell; false unless connected
    pub fn call(&self, data: &[u8]) -> bool {
        self.session
            .send_if_connected(ShellFrame::Data(data.to_vec()))
    }
}

/// Table of live sessions
#[derive(Default)]
pub(crate) struct SessionManager {
    sessions: Mutex<HashMap<u64, SshSession>>,
    next_id: AtomicU64,
}

impl SessionManager {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, SshSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, session: SshSession) {
        self.sessions().insert(session.id(), session);
    }

    fn remove(&self, id: u64) {
        self.sessions().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Close every live session; their tasks fire `on_done`
    pub(crate) fn close_all(&self) {
        let sessions: Vec<SshSession> = self.sessions().values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} session(s)", sessions.len());
        for session in sessions {
            session.close();
        }
    }
}

/// Open a shell session to `host`
pub(crate) fn open(shared: &Arc<Shared>, host: &str, username: &str, config: TermConfig) -> SshSession {
    let id = shared.sessions.next_id();
    let notifier = shared.notifier();

    // Registered before the readiness check, so a state change that
    // lands in between closes it through close_all
    let session = SshSession::new(id, host, username, &config, SessionStatus::Negotiating);
    shared.sessions.insert(session.clone());

    let target = match resolve_target(shared, host, username) {
        Ok(target) => target,
        Err(e) => {
            info!("Rejecting session to {}: {}", host, e);
            shared.sessions.remove(id);
            session.reject(e);
            contain(notifier.as_ref(), "on_done", || (config.on_done)());
            return session;
        }
    };

    info!("Opening session {} to {}@{}", id, username, target.peer_name);
    tokio::spawn(run_session(
        shared.clone(),
        session.inner.clone(),
        target,
        config,
        notifier,
    ));
    session
}

fn resolve_target(shared: &Shared, host: &str, username: &str) -> Result<ShellTarget, ControlError> {
    let netmap = shared.ensure_network_ready()?;

    let peer = netmap
        .as_deref()
        .and_then(|netmap| netmap.find_peer(host))
        .ok_or_else(|| ControlError::PeerCapability {
            host: host.to_string(),
            reason: "not found in the network map".to_string(),
        })?;
    if !peer.ssh_enabled {
        return Err(ControlError::PeerCapability {
            host: host.to_string(),
            reason: "remote shell is not enabled on this peer".to_string(),
        });
    }

    Ok(ShellTarget {
        host: host.to_string(),
        peer_name: peer.node.name.clone(),
        addresses: peer.node.addresses.clone(),
        port: SHELL_PORT,
        username: username.to_string(),
    })
}

/// Channel state once the peer reported ready
struct Ready {
    inbound: mpsc::Receiver<ShellFrame>,
    /// Output that arrived before `Ready`
    early: Vec<ShellFrame>,
}

async fn run_session(
    shared: Arc<Shared>,
    session: Arc<SessionInner>,
    target: ShellTarget,
    config: TermConfig,
    notifier: Option<Notifier>,
) {
    let notifier = notifier.as_ref();
    let timeout = config.timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT);
    let peer = short_name(&target.peer_name).to_string();

    let negotiated = tokio::select! {
        biased;
        _ = session.cancel.cancelled() => Err(None),
        result = tokio::time::timeout(timeout, negotiate(&shared, &session, &target, &config, notifier)) => {
            match result {
                Ok(Ok(ready)) => Ok(ready),
                Ok(Err(reason)) => Err(Some(reason)),
                Err(_) => Err(Some(timeout_reason(timeout, &peer))),
            }
        }
    };

    match negotiated {
        Ok(Ready { inbound, early }) => {
            if session.mark_connected() {
                info!("Session {} connected to {}", session.id, peer);
                let read_fn = ReadFn {
                    session: session.clone(),
                };
                contain(notifier, "set_read_fn", || (config.set_read_fn)(read_fn));
                contain(notifier, "on_connected", || (config.on_connected)());
                for frame in early {
                    deliver_output(&config, notifier, frame);
                }
                pump(&session, inbound, &config, notifier).await;
            }
        }
        Err(Some(reason)) => {
            warn!("Session {} to {} failed: {}", session.id, peer, reason);
            contain(notifier, "on_connection_progress", || {
                (config.on_connection_progress)(&reason)
            });
        }
        Err(None) => debug!("Session {} closed during negotiation", session.id),
    }

    session.finish();
    shared.sessions.remove(session.id);
    contain(notifier, "on_done", || (config.on_done)());
    debug!("Session {} done", session.id);
}

async fn negotiate(
    shared: &Shared,
    session: &SessionInner,
    target: &ShellTarget,
    config: &TermConfig,
    notifier: Option<&Notifier>,
) -> Result<Ready, String> {
    let peer = short_name(&target.peer_name);
    let progress = |message: &str| {
        contain(notifier, "on_connection_progress", || {
            (config.on_connection_progress)(message)
        })
    };

    progress(&format!("Connecting to {}…", peer));
    let ShellChannel {
        outbound,
        mut inbound,
    } = shared
        .backend
        .dial_shell(target)
        .await
        .map_err(|e| format!("Failed to connect to {}: {}", peer, e))?;

    progress("Starting session…");
    let closed = || format!("Connection to {} closed", peer);
    let (rows, cols) = session.attach(outbound.clone()).ok_or_else(closed)?;
    outbound
        .send(ShellFrame::PtyRequest {
            term: DEFAULT_TERM.to_string(),
            rows,
            cols,
        })
        .map_err(|_| closed())?;
    outbound.send(ShellFrame::Shell).map_err(|_| closed())?;

    let mut early = Vec::new();
    loop {
        match inbound.recv().await {
            Some(ShellFrame::Ready) => return Ok(Ready { inbound, early }),
            Some(frame @ (ShellFrame::Stdout(_) | ShellFrame::Stderr(_))) => early.push(frame),
            Some(ShellFrame::Rejected { reason }) => {
                return Err(format!("{} rejected the session: {}", peer, reason));
            }
            Some(ShellFrame::Exit { .. }) | Some(ShellFrame::Eof) | None => return Err(closed()),
            Some(other) => debug!("Ignoring {:?} during negotiation", other),
        }
    }
}

async fn pump(
    session: &SessionInner,
    mut inbound: mpsc::Receiver<ShellFrame>,
    config: &TermConfig,
    notifier: Option<&Notifier>,
) {
    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame @ (ShellFrame::Stdout(_) | ShellFrame::Stderr(_))) => {
                    deliver_output(config, notifier, frame);
                }
                Some(ShellFrame::Exit { status }) => {
                    debug!("Session {} remote exited with {:?}", session.id, status);
                    break;
                }
                Some(ShellFrame::Eof) | None => break,
                Some(other) => debug!("Session {} ignoring {:?}", session.id, other),
            },
        }
    }
}

fn deliver_output(config: &TermConfig, notifier: Option<&Notifier>, frame: ShellFrame) {
    match frame {
        ShellFrame::Stdout(data) => contain(notifier, "write_fn", || (config.write_fn)(&data)),
        ShellFrame::Stderr(data) => {
            contain(notifier, "write_error_fn", || (config.write_error_fn)(&data))
        }
        _ => {}
    }
}

fn timeout_reason(timeout: Duration, peer: &str) -> String {
    format!("Timed out after {:?} connecting to {}", timeout, peer)
}

fn short_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}
