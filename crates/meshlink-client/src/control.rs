//! Connection state machine
//!
//! One control loop task owns the lifecycle. It multiplexes host commands,
//! backend events, the retry timer and the ownership check, and it is the
//! only writer of the shared state. Every transition is handed to the host
//! callback and acknowledged before it becomes visible to fetches and shell
//! sessions.

use crate::backoff::Backoff;
use crate::client::ControlError;
use crate::config::MeshConfig;
use crate::netmap::NetMapRepository;
use crate::notify::Notifier;
use crate::ssh::SessionManager;
use crate::store::StateStore;
use meshlink_proto::{BackendEvent, ConnectionState, NetMap};
use meshlink_transport::{ConnectOptions, TunnelBackend};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the backend event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// State shared between the control loop and the host-facing API
pub(crate) struct Shared {
    pub(crate) backend: Arc<dyn TunnelBackend>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) netmap: NetMapRepository,
    pub(crate) sessions: SessionManager,
    notifier: Mutex<Option<Notifier>>,
}

impl Shared {
    pub(crate) fn new(backend: Arc<dyn TunnelBackend>) -> Self {
        let (state, _) = watch::channel(ConnectionState::NoState);
        Self {
            backend,
            state,
            netmap: NetMapRepository::new(),
            sessions: SessionManager::default(),
            notifier: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn notifier(&self) -> Option<Notifier> {
        self.notifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.lock().unwrap_or_else(|e| e.into_inner()) = Some(notifier);
    }

    /// Gate for traffic: `Running` and not locked out.
    ///
    /// Returns the snapshot the decision was made against.
    pub(crate) fn ensure_network_ready(&self) -> Result<Option<Arc<NetMap>>, ControlError> {
        let state = self.state();
        let netmap = self.netmap.snapshot();
        let locked_out = netmap.as_ref().is_some_and(|netmap| netmap.locked_out);

        if !state.is_running() || locked_out {
            return Err(ControlError::NotConnected { state, locked_out });
        }
        Ok(netmap)
    }
}

/// Host commands for the control loop
#[derive(Debug)]
pub(crate) enum Command {
    Login,
    Logout,
    Shutdown,
}

/// Handle to a running control loop
pub(crate) struct ControlHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ControlHandle {
    pub(crate) fn spawn(shared: Arc<Shared>, notifier: Notifier, config: MeshConfig) -> Self {
        shared.set_notifier(notifier.clone());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let control = ControlLoop {
            shared,
            notifier,
            store: StateStore::new(config.state_storage.clone()),
            options: ConnectOptions {
                control_url: config.control_url.clone(),
                hostname: config.hostname.clone(),
                auth_key: config.auth_key.clone(),
                credential: None,
            },
            backoff: Backoff::new(config.backoff.clone()),
            ownership_check_interval: config.ownership_check_interval,
            events: events_tx,
            token: Uuid::new_v4().to_string(),
            claimed: false,
            connected: false,
            login_pending: false,
            login_deferred: false,
            retry_at: None,
        };

        let task = tokio::spawn(control.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            task,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.task.is_finished() && !self.commands.is_closed()
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), ControlError> {
        if !self.is_live() {
            return Err(ControlError::Lifecycle("control loop has stopped".to_string()));
        }
        self.commands
            .send(command)
            .map_err(|_| ControlError::Lifecycle("control loop has stopped".to_string()))
    }

    /// Ask the loop to stop and wait for its teardown
    pub(crate) async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            error!("Control loop task failed: {}", e);
        }
    }
}

/// Why the control loop ended
enum Exit {
    Shutdown,
    Fatal(String),
    Displaced,
}

type Step = Result<(), Exit>;

struct ControlLoop {
    shared: Arc<Shared>,
    notifier: Notifier,
    store: StateStore,
    options: ConnectOptions,
    backoff: Backoff,
    ownership_check_interval: Duration,
    events: mpsc::Sender<BackendEvent>,
    /// Ownership token written to the store
    token: String,
    claimed: bool,
    connected: bool,
    /// Interactive login requested and not yet finished
    login_pending: bool,
    /// Interactive login must start once connected
    login_deferred: bool,
    retry_at: Option<Instant>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::Receiver<BackendEvent>,
    ) {
        info!(
            "Control loop starting: hostname={} control_url={}",
            self.options.hostname, self.options.control_url
        );

        let exit = self.drive(&mut commands, &mut events).await;
        self.finish(exit).await;

        info!("Control loop stopped");
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mut mpsc::Receiver<BackendEvent>,
    ) -> Exit {
        if let Err(exit) = self.begin().await {
            return exit;
        }

        let period = self.ownership_check_interval;
        let mut ownership = interval_at(Instant::now() + period, period);
        ownership.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;

            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Login) => self.login().await,
                    Some(Command::Logout) => self.logout().await,
                    Some(Command::Shutdown) | None => Err(Exit::Shutdown),
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.connect().await
                }
                _ = ownership.tick() => self.check_ownership(),
            };

            if let Err(exit) = step {
                return exit;
            }
        }
    }

    async fn begin(&mut self) -> Step {
        // The first notification is always the initial state
        self.notifier
            .deliver(|callbacks| callbacks.notify_state(ConnectionState::NoState))
            .await;
        self.shared.state.send_replace(ConnectionState::NoState);

        self.claim();
        self.set_state(ConnectionState::Starting).await;
        self.connect().await
    }

    async fn connect(&mut self) -> Step {
        let options = ConnectOptions {
            credential: self.store.credential(),
            ..self.options.clone()
        };
        debug!(
            "Connecting (auth_key={}, credential={})",
            options.auth_key.is_some(),
            options.credential.is_some()
        );

        match self
            .shared
            .backend
            .connect(&options, self.events.clone())
            .await
        {
            Ok(()) => {
                info!("Connected to coordination server {}", options.control_url);
                self.connected = true;
                self.backoff.reset();

                if self.login_deferred {
                    self.login_deferred = false;
                    return self.start_interactive_login().await;
                }
                if options.auth_key.is_none() && options.credential.is_none() {
                    self.set_state(ConnectionState::NeedsLogin).await;
                }
                Ok(())
            }
            Err(e) if e.is_non_recoverable() => Err(Exit::Fatal(format!("Connect failed: {}", e))),
            Err(e) => self.schedule_retry(&format!("Connect failed: {}", e)),
        }
    }

    fn schedule_retry(&mut self, reason: &str) -> Step {
        match self.backoff.next_delay() {
            Some(delay) => {
                warn!(
                    "{}; retrying in {}ms (attempt {})",
                    reason,
                    delay.as_millis(),
                    self.backoff.attempt()
                );
                self.retry_at = Some(Instant::now() + delay);
                Ok(())
            }
            None => Err(Exit::Fatal(format!(
                "Giving up after {} retries: {}",
                self.backoff.attempt() - 1,
                reason
            ))),
        }
    }

    async fn login(&mut self) -> Step {
        if self.shared.state().is_running() {
            debug!("Login requested while running, nothing to do");
            return Ok(());
        }
        if self.login_pending {
            debug!("Login already in progress");
            return Ok(());
        }

        info!("Starting interactive login");
        self.login_pending = true;
        self.claim();
        self.set_state(ConnectionState::Starting).await;

        if !self.connected {
            self.login_deferred = true;
            if self.retry_at.is_none() {
                return self.connect().await;
            }
            return Ok(());
        }
        self.start_interactive_login().await
    }

    async fn start_interactive_login(&mut self) -> Step {
        match self.shared.backend.start_login_interactive().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_non_recoverable() => Err(Exit::Fatal(format!("Login failed: {}", e))),
            Err(e) => {
                self.connected = false;
                self.login_deferred = true;
                self.schedule_retry(&format!("Login failed: {}", e))
            }
        }
    }

    async fn logout(&mut self) -> Step {
        info!("Logging out");

        if self.connected {
            if let Err(e) = self.shared.backend.logout().await {
                warn!("Backend logout failed: {}", e);
            }
        }
        self.store.clear_credential();
        self.shared.sessions.close_all();
        self.release();

        self.retry_at = None;
        self.backoff.reset();
        self.login_pending = false;
        self.login_deferred = false;

        self.set_state(ConnectionState::Stopped).await;
        Ok(())
    }

    async fn handle_event(&mut self, event: BackendEvent) -> Step {
        match event {
            BackendEvent::NeedsLogin => {
                self.login_pending = false;
                self.set_state(ConnectionState::NeedsLogin).await;
            }
            BackendEvent::BrowseToUrl { url } => {
                info!("Interactive login URL received");
                self.notifier
                    .post(move |callbacks| callbacks.notify_browse_to_url(&url));
            }
            BackendEvent::Authenticated { credential } => {
                info!("Node authenticated");
                self.store.set_credential(&credential);
            }
            BackendEvent::NeedsMachineAuth => {
                self.set_state(ConnectionState::NeedsMachineAuth).await;
            }
            BackendEvent::Running => {
                self.login_pending = false;
                self.backoff.reset();
                self.set_state(ConnectionState::Running).await;
            }
            BackendEvent::Stopped => {
                self.set_state(ConnectionState::Stopped).await;
            }
            BackendEvent::NetMap { payload } => {
                self.apply_net_map(&payload).await;
            }
            BackendEvent::TransportFailure {
                reason,
                recoverable: false,
            } => {
                return Err(Exit::Fatal(format!("Transport failure: {}", reason)));
            }
            BackendEvent::TransportFailure { reason, .. } => {
                return self.transport_lost(&reason).await;
            }
        }
        Ok(())
    }

    async fn apply_net_map(&mut self, payload: &str) {
        let Some(netmap) = self.shared.netmap.apply(payload) else {
            return;
        };

        if netmap.locked_out {
            warn!("Node key is locked out, closing all sessions");
            self.shared.sessions.close_all();
        }
        self.notifier
            .deliver(move |callbacks| callbacks.notify_net_map(netmap))
            .await;
    }

    async fn transport_lost(&mut self, reason: &str) -> Step {
        warn!("Transport lost: {}", reason);
        self.connected = false;
        self.shared.sessions.close_all();

        // After logout the loop idles until the next login
        if self.shared.state() == ConnectionState::Stopped {
            return Ok(());
        }

        self.login_deferred = self.login_pending;
        self.set_state(ConnectionState::Starting).await;
        if self.retry_at.is_some() {
            return Ok(());
        }
        self.schedule_retry(&format!("Transport lost: {}", reason))
    }

    fn check_ownership(&mut self) -> Step {
        if self.claimed && !self.store.is_owned_by(&self.token) {
            warn!("State store was claimed by another instance");
            return Err(Exit::Displaced);
        }
        Ok(())
    }

    async fn finish(&mut self, exit: Exit) {
        match exit {
            Exit::Shutdown => {
                info!("Control loop shutting down");
                self.teardown().await;
                self.set_state(ConnectionState::NoState).await;
            }
            Exit::Fatal(message) => {
                error!("{}", message);
                self.notifier
                    .deliver(move |callbacks| callbacks.notify_fatal_error(&message))
                    .await;
                self.teardown().await;
                self.set_state(ConnectionState::NoState).await;
            }
            Exit::Displaced => {
                self.claimed = false;
                self.set_state(ConnectionState::InUseOtherUser).await;
                self.teardown().await;
            }
        }
    }

    async fn teardown(&mut self) {
        self.retry_at = None;
        self.shared.sessions.close_all();
        self.shared.backend.shutdown().await;
        self.connected = false;
        self.release();
    }

    /// Notify the host, then publish. Sessions are closed when leaving
    /// `Running`.
    async fn set_state(&mut self, state: ConnectionState) {
        let previous = self.shared.state();
        if previous == state {
            return;
        }

        info!("State {} -> {}", previous, state);
        self.notifier
            .deliver(move |callbacks| callbacks.notify_state(state))
            .await;
        self.shared.state.send_replace(state);

        if previous.is_running() && !state.is_running() {
            self.shared.sessions.close_all();
        }
    }

    fn claim(&mut self) {
        self.store.claim(&self.token);
        self.claimed = true;
    }

    fn release(&mut self) {
        if self.claimed {
            self.store.release(&self.token);
            self.claimed = false;
        }
    }
}
