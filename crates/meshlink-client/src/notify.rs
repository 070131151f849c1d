//! Host notification sinks and their dispatcher
//!
//! All host callbacks run on one dispatcher task, in the order they were
//! queued. A panicking callback is contained and reported through
//! [`Callbacks::notify_panic_recover`]; the dispatcher keeps running.

use meshlink_proto::{ConnectionState, NetMap};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Host-implemented notification sinks
pub trait Callbacks: Send + Sync + 'static {
    /// Lifecycle state changed
    fn notify_state(&self, state: ConnectionState);

    /// A new topology snapshot was committed
    fn notify_net_map(&self, netmap: Arc<NetMap>);

    /// Interactive login needs the user to visit `url`
    fn notify_browse_to_url(&self, url: &str);

    /// An internal fault was contained
    fn notify_panic_recover(&self, message: &str);

    /// The control loop gave up (retries exhausted or a non-recoverable
    /// error). Defaults to the panic-recovery sink.
    fn notify_fatal_error(&self, message: &str) {
        self.notify_panic_recover(message);
    }
}

type Job = Box<dyn FnOnce(&dyn Callbacks) + Send>;

struct Envelope {
    job: Job,
    ack: Option<oneshot::Sender<()>>,
}

/// Queue in front of the dispatcher task
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Notifier {
    /// Start a dispatcher for `callbacks`. It stops once every `Notifier`
    /// clone has been dropped.
    pub(crate) fn spawn(callbacks: Arc<dyn Callbacks>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let task = tokio::spawn(async move {
            while let Some(Envelope { job, ack }) = rx.recv().await {
                let result = panic::catch_unwind(AssertUnwindSafe(|| job(callbacks.as_ref())));
                if let Err(payload) = result {
                    report_panic(callbacks.as_ref(), &panic_message(payload.as_ref()));
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            debug!("Notification dispatcher stopped");
        });

        (Self { tx }, task)
    }

    /// Queue a notification without waiting for it
    pub(crate) fn post<F>(&self, job: F)
    where
        F: FnOnce(&dyn Callbacks) + Send + 'static,
    {
        let envelope = Envelope {
            job: Box::new(job),
            ack: None,
        };
        if self.tx.send(envelope).is_err() {
            debug!("Notification dropped, dispatcher is gone");
        }
    }

    /// Queue a notification and wait until the host callback has returned
    pub(crate) async fn deliver<F>(&self, job: F)
    where
        F: FnOnce(&dyn Callbacks) + Send + 'static,
    {
        let (ack_tx, ack_rx) = oneshot::channel();
        let envelope = Envelope {
            job: Box::new(job),
            ack: Some(ack_tx),
        };
        if self.tx.send(envelope).is_err() {
            debug!("Notification dropped, dispatcher is gone");
            return;
        }
        let _ = ack_rx.await;
    }
}

fn report_panic(callbacks: &dyn Callbacks, message: &str) {
    error!("Host callback panicked: {}", message);
    let reported = panic::catch_unwind(AssertUnwindSafe(|| callbacks.notify_panic_recover(message)));
    if reported.is_err() {
        error!("Panic-recovery callback panicked as well");
    }
}

/// Run a session-level host closure, containing any panic.
///
/// Panics are forwarded to the panic-recovery sink when a dispatcher is
/// available and logged otherwise.
pub(crate) fn contain<F: FnOnce()>(notifier: Option<&Notifier>, what: &str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = format!("{} panicked: {}", what, panic_message(payload.as_ref()));
        error!("{}", message);
        if let Some(notifier) = notifier {
            notifier.post(move |callbacks| callbacks.notify_panic_recover(&message));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
