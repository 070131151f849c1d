#![allow(dead_code)]

use meshlink_client::{
    Callbacks, ConnectionState, MeshClient, MeshConfig, NetMap, ReadFn, TermConfig,
};
use meshlink_transport::mock::MockBackend;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(10);

pub const NETMAP: &str = r#"{
    "self": {
        "name": "laptop.mesh.example.",
        "addresses": ["100.64.0.1"],
        "machineKey": "mkey:self",
        "nodeKey": "nodekey:self",
        "machineStatus": "MachineAuthorized"
    },
    "peers": [
        {
            "name": "peer-1.mesh.example.",
            "addresses": ["100.64.0.2"],
            "machineKey": "mkey:peer-1",
            "nodeKey": "nodekey:peer-1",
            "online": true,
            "tailscaleSSHEnabled": true
        },
        {
            "name": "printer.mesh.example.",
            "addresses": ["100.64.0.3"],
            "machineKey": "mkey:printer",
            "nodeKey": "nodekey:printer",
            "tailscaleSSHEnabled": false
        }
    ],
    "lockedOut": false
}"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One host notification
#[derive(Debug, Clone)]
pub enum Note {
    State(ConnectionState),
    NetMap(Arc<NetMap>),
    BrowseToUrl(String),
    Panic(String),
    Fatal(String),
}

/// Callbacks that record every notification
pub struct Recorder {
    tx: mpsc::UnboundedSender<Note>,
    states: Mutex<Vec<ConnectionState>>,
    panic_on: Option<ConnectionState>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Notes) {
        Self::build(None)
    }

    /// Recorder whose state callback panics on `state`
    pub fn panicking_on(state: ConnectionState) -> (Arc<Self>, Notes) {
        Self::build(Some(state))
    }

    fn build(panic_on: Option<ConnectionState>) -> (Arc<Self>, Notes) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Self {
            tx,
            states: Mutex::new(Vec::new()),
            panic_on,
        });
        (recorder, Notes { rx })
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().unwrap().clone()
    }
}

impl Callbacks for Recorder {
    fn notify_state(&self, state: ConnectionState) {
        self.states.lock().unwrap().push(state);
        let _ = self.tx.send(Note::State(state));
        if self.panic_on == Some(state) {
            panic!("host callback failed on {}", state);
        }
    }

    fn notify_net_map(&self, netmap: Arc<NetMap>) {
        let _ = self.tx.send(Note::NetMap(netmap));
    }

    fn notify_browse_to_url(&self, url: &str) {
        let _ = self.tx.send(Note::BrowseToUrl(url.to_string()));
    }

    fn notify_panic_recover(&self, message: &str) {
        let _ = self.tx.send(Note::Panic(message.to_string()));
    }

    fn notify_fatal_error(&self, message: &str) {
        let _ = self.tx.send(Note::Fatal(message.to_string()));
    }
}

/// Receiving side of a [`Recorder`]
pub struct Notes {
    rx: mpsc::UnboundedReceiver<Note>,
}

impl Notes {
    /// Skip notifications until one matches
    pub async fn wait_for<T>(&mut self, mut matcher: impl FnMut(&Note) -> Option<T>) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                let note = self.rx.recv().await.expect("recorder dropped");
                if let Some(found) = matcher(&note) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for notification")
    }

    pub async fn wait_state(&mut self, state: ConnectionState) {
        self.wait_for(|note| matches!(note, Note::State(s) if *s == state).then_some(()))
            .await
    }

    pub async fn wait_url(&mut self) -> String {
        self.wait_for(|note| match note {
            Note::BrowseToUrl(url) => Some(url.clone()),
            _ => None,
        })
        .await
    }

    pub async fn wait_net_map(&mut self) -> Arc<NetMap> {
        self.wait_for(|note| match note {
            Note::NetMap(netmap) => Some(netmap.clone()),
            _ => None,
        })
        .await
    }

    pub async fn wait_fatal(&mut self) -> String {
        self.wait_for(|note| match note {
            Note::Fatal(message) => Some(message.clone()),
            _ => None,
        })
        .await
    }

    pub async fn wait_panic(&mut self) -> String {
        self.wait_for(|note| match note {
            Note::Panic(message) => Some(message.clone()),
            _ => None,
        })
        .await
    }
}

/// Wait until the published state matches
pub async fn wait_published(client: &MeshClient, state: ConnectionState) {
    let mut rx = client.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Client brought to `Running` with the sample network map committed
pub async fn running_client(backend: MockBackend) -> (MeshClient, Arc<Recorder>, Notes) {
    init_tracing();

    let backend = backend.with_auth_key("valid").with_netmap(NETMAP);
    let client = MeshClient::new(Arc::new(backend));
    let (recorder, mut notes) = Recorder::new();

    let config = MeshConfig::builder().auth_key("valid").build().unwrap();
    client.start(config, recorder.clone()).unwrap();
    notes.wait_net_map().await;
    wait_published(&client, ConnectionState::Running).await;

    (client, recorder, notes)
}

/// One session callback invocation
#[derive(Debug)]
pub enum SessionNote {
    Progress(String),
    ReadFn(ReadFn),
    Connected,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Done,
}

/// Terminal config whose hooks report into a channel
pub fn recording_term(rows: u16, cols: u16) -> (TermConfig, SessionNotes) {
    let (tx, rx) = mpsc::unbounded_channel();
    let progress = tx.clone();
    let read_fn = tx.clone();
    let connected = tx.clone();
    let stdout = tx.clone();
    let stderr = tx.clone();

    let config = TermConfig::new(rows, cols)
        .on_connection_progress(move |message| {
            let _ = progress.send(SessionNote::Progress(message.to_string()));
        })
        .set_read_fn(move |hook| {
            let _ = read_fn.send(SessionNote::ReadFn(hook));
        })
        .on_connected(move || {
            let _ = connected.send(SessionNote::Connected);
        })
        .write_fn(move |data| {
            let _ = stdout.send(SessionNote::Stdout(data.to_vec()));
        })
        .write_error_fn(move |data| {
            let _ = stderr.send(SessionNote::Stderr(data.to_vec()));
        })
        .on_done(move || {
            let _ = tx.send(SessionNote::Done);
        });

    (config, SessionNotes { rx })
}

pub struct SessionNotes {
    rx: mpsc::UnboundedReceiver<SessionNote>,
}

impl SessionNotes {
    pub async fn next(&mut self) -> SessionNote {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for session callback")
            .expect("session hooks dropped")
    }

    /// Everything delivered so far, without waiting
    pub fn drain(&mut self) -> Vec<SessionNote> {
        let mut notes = Vec::new();
        while let Ok(note) = self.rx.try_recv() {
            notes.push(note);
        }
        notes
    }

    /// Collect callbacks up to and including `Done`
    pub async fn until_done(&mut self) -> Vec<SessionNote> {
        let mut notes = Vec::new();
        loop {
            let note = self.next().await;
            let done = matches!(note, SessionNote::Done);
            notes.push(note);
            if done {
                return notes;
            }
        }
    }
}
