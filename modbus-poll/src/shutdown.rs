//! Cooperative stop signal shared between the control plane and the tasks it spawns.
//!
//! Adapted from the shutdown listener in mini-redis: a `broadcast` channel where only a single
//! value is ever sent. Dropping the sending half counts as a stop request as well, so a task can
//! never outlive the handle that was supposed to stop it.

use tokio::sync::broadcast;

type Notify = broadcast::Receiver<()>;

/// Sending half, held by whoever owns the task.
#[derive(Debug)]
pub(crate) struct Stop {
    notify: broadcast::Sender<()>,
}

impl Stop {
    /// Create a stop handle together with the listener to move into the task.
    pub(crate) fn new() -> (Stop, Shutdown) {
        let (notify, rx) = broadcast::channel(1);
        (Stop { notify }, Shutdown::new(rx))
    }

    /// Ask the task to stop. Safe to call from any context, any number of times.
    pub(crate) fn request(&self) {
        // No receivers just means the task already finished.
        let _ = self.notify.send(());
    }
}

/// Listens for a stop request.
///
/// Tracks whether the signal has been seen so callers can poll `is_shutdown` between units of
/// work without awaiting.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` once the stop signal has been received
    shutdown: bool,

    notify: Notify,
}

impl Shutdown {
    fn new(notify: Notify) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the stop signal has been received.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Receive the stop notice, waiting if necessary.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent, and a closed channel is
        // as good as a stop request.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

#[tokio::test]
async fn stop_request_is_sticky() {
    let (stop, mut shutdown) = Stop::new();
    assert!(!shutdown.is_shutdown());

    stop.request();
    stop.request();
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());

    // Already seen, so this must not wait for a second value.
    shutdown.recv().await;
}

#[tokio::test]
async fn dropping_stop_handle_counts_as_request() {
    let (stop, mut shutdown) = Stop::new();
    drop(stop);
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());
}
