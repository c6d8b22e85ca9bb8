use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, info};

use crate::device::DeskShared;

/// Background task keeping one desk's link alive
///
/// Polls link health every `poll_interval`; whenever the link is down it
/// makes a fresh connection attempt and waits `retry_backoff` after a
/// failure. The first tick runs after `initial_delay`. It only ends when
/// cancelled.
pub(crate) struct Supervisor {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub(crate) fn spawn(shared: Arc<DeskShared>, initial_delay: Duration) -> Self {
        let (cancel, cancelled) = watch::channel(false);
        let handle = tokio::spawn(run(shared, initial_delay, cancelled));
        Self { cancel, handle }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal cancellation and wait for the loop to exit.
    ///
    /// A connection attempt in flight is dropped; the controller resets
    /// `Connecting` back to `Disconnected` when that happens.
    pub(crate) async fn shutdown(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!("Connection supervisor panicked: {}", e);
            }
        }
    }

    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

async fn run(
    shared: Arc<DeskShared>,
    initial_delay: Duration,
    mut cancelled: watch::Receiver<bool>,
) {
    let address = shared.address().to_string();
    let poll_interval = shared.config().poll_interval();
    let retry_backoff = shared.config().retry_backoff();

    info!("Connection supervisor started for {}", address);

    let mut delay = initial_delay;
    loop {
        if !delay.is_zero() {
            tokio::select! {
                _ = cancelled.changed() => break,
                () = sleep(delay) => {}
            }
        }
        if *cancelled.borrow() {
            break;
        }

        let healthy = tokio::select! {
            _ = cancelled.changed() => break,
            session = shared.healthy_session() => session.is_some(),
        };

        delay = if healthy {
            poll_interval
        } else {
            debug!("Link to {} is down, attempting to reconnect...", address);
            tokio::select! {
                _ = cancelled.changed() => break,
                result = shared.establish() => match result {
                    Ok(_) => poll_interval,
                    Err(e) => {
                        debug!("Reconnect to {} failed: {}", address, e);
                        retry_backoff
                    }
                },
            }
        };
    }

    info!("Connection supervisor stopped for {}", address);
}
