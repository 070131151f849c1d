//! Meshlink client
//!
//! Embeddable control plane for an overlay-network tunnel. It keeps the
//! node connected and logged in, and gives the host three things without
//! raw sockets: HTTP requests through the tunnel, remote shells to peers,
//! and the live network map.
//!
//! # Example
//!
//! ```no_run
//! use meshlink_client::{Callbacks, MeshClient, MeshConfig};
//! use meshlink_proto::{ConnectionState, NetMap};
//! use meshlink_transport::TunnelBackend;
//! use std::sync::Arc;
//!
//! struct Host;
//!
//! impl Callbacks for Host {
//!     fn notify_state(&self, state: ConnectionState) {
//!         println!("state: {}", state);
//!     }
//!     fn notify_net_map(&self, netmap: Arc<NetMap>) {
//!         println!("{} peers", netmap.peers.len());
//!     }
//!     fn notify_browse_to_url(&self, url: &str) {
//!         println!("log in at {}", url);
//!     }
//!     fn notify_panic_recover(&self, message: &str) {
//!         eprintln!("contained fault: {}", message);
//!     }
//! }
//!
//! # async fn run(backend: Arc<dyn TunnelBackend>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::builder()
//!     .auth_key("tskey-abc")
//!     .hostname("laptop")
//!     .build()?;
//!
//! let client = MeshClient::new(backend);
//! client.start(config, Arc::new(Host))?;
//!
//! let request = http::Request::get("http://100.64.0.2/status").body(bytes::Bytes::new())?;
//! let response = client.fetch(request).await?;
//! println!("{}", response.text().await?);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
mod control;
pub mod fetch;
pub mod netmap;
pub mod notify;
pub mod ssh;
pub mod store;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{ControlError, MeshClient};
pub use config::{MeshConfig, MeshConfigBuilder, DEFAULT_CONTROL_URL};
pub use fetch::{FetchBridge, FetchResponse, ResponseBody};
pub use netmap::NetMapRepository;
pub use notify::Callbacks;
pub use ssh::{ReadFn, SessionStatus, SshSession, TermConfig, DEFAULT_SESSION_TIMEOUT};
pub use store::{FileStateStorage, MemoryStateStorage, StateStorage, StateStore};

// Re-export the shared data model
pub use meshlink_proto::{ConnectionState, MachineStatus, NetMap, PeerNode, SelfNode};
