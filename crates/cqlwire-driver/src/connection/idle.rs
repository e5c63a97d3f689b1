//! Idle abort timer
//!
//! Armed when a request is written, disarmed when any bytes are read. If it
//! fires the connection is torn down with [`ConnectionError::IdleTimeout`].

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::{Shared, shutdown_signal};
use crate::error::ConnectionError;

#[derive(Debug)]
pub(crate) struct IdleTimer {
    timeout: Option<Duration>,
    deadline: watch::Sender<Option<Instant>>,
}

impl IdleTimer {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        let (deadline, _) = watch::channel(None);
        Self { timeout, deadline }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Start the countdown unless one is already running
    pub(crate) fn arm(&self) {
        let Some(timeout) = self.timeout else {
            return;
        };
        self.deadline.send_if_modified(|deadline| {
            if deadline.is_some() {
                return false;
            }
            *deadline = Some(Instant::now() + timeout);
            true
        });
    }

    pub(crate) fn disarm(&self) {
        if self.timeout.is_none() {
            return;
        }
        self.deadline.send_if_modified(|deadline| deadline.take().is_some());
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.deadline.subscribe()
    }
}

/// Watchdog task. Exits when the connection goes away or is shut down.
pub(crate) async fn watchdog(
    shared: Weak<Shared>,
    mut deadline: watch::Receiver<Option<Instant>>,
    mut shutdown: watch::Receiver<bool>,
    timeout: Duration,
) {
    loop {
        let armed = *deadline.borrow_and_update();
        match armed {
            None => {
                tokio::select! {
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = shutdown_signal(&mut shutdown) => return,
                }
            }
            Some(at) => {
                tokio::select! {
                    () = tokio::time::sleep_until(at) => {
                        if *deadline.borrow() != Some(at) {
                            continue;
                        }
                        let Some(shared) = shared.upgrade() else {
                            return;
                        };
                        debug!(
                            connection = shared.id,
                            address = %shared.address,
                            ?timeout,
                            "Idle timeout fired"
                        );
                        shared.defunct(ConnectionError::IdleTimeout(timeout), true);
                        return;
                    }
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = shutdown_signal(&mut shutdown) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_arm_keeps_first_deadline() {
        let timer = IdleTimer::new(Some(Duration::from_secs(5)));
        let rx = timer.subscribe();
        timer.arm();
        let first = *rx.borrow();
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        timer.arm();
        assert_eq!(*rx.borrow(), first);

        timer.disarm();
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn test_disabled_timer_never_arms() {
        let timer = IdleTimer::new(None);
        let rx = timer.subscribe();
        timer.arm();
        assert!(rx.borrow().is_none());
        assert!(timer.timeout().is_none());
    }
}
