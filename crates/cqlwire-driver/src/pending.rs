//! Exactly-once completion tokens
//!
//! [`pending_operation`] creates a linked [`Completer`] and
//! [`PendingOperation`]. Completers are cloneable so the success path and
//! the fault path of a connection can each hold one; whichever completes
//! first wins and later completions are dropped.
//!
//! The waiter can block a thread ([`PendingOperation::wait_blocking`]) or an
//! async task ([`PendingOperation::wait`]). Neither polls.
//!
//! If the last completer is dropped without completing, for example when
//! the task holding it panics, the operation completes with the error
//! type's [`Abandoned`] conversion.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

const PENDING: u8 = 0;
const COMPLETED_SYNC: u8 = 1;
const COMPLETED_ASYNC: u8 = 2;

/// Every completer went away before the operation completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation abandoned before completion")]
pub struct Abandoned;

fn abandoned<E: From<Abandoned>>() -> E {
    E::from(Abandoned)
}

struct Slot<T, E> {
    state: AtomicU8,
    outcome: Mutex<Option<Result<T, E>>>,
    condvar: Condvar,
    notify: Notify,
    completers: AtomicUsize,
    abandoned: fn() -> E,
}

/// Completing side of a pending operation
pub struct Completer<T, E> {
    slot: Arc<Slot<T, E>>,
}

/// Waiting side of a pending operation
pub struct PendingOperation<T, E> {
    slot: Arc<Slot<T, E>>,
}

/// Create a linked completer and waiter
pub fn pending_operation<T, E>() -> (Completer<T, E>, PendingOperation<T, E>)
where
    E: From<Abandoned>,
{
    let slot = Arc::new(Slot {
        state: AtomicU8::new(PENDING),
        outcome: Mutex::new(None),
        condvar: Condvar::new(),
        notify: Notify::new(),
        completers: AtomicUsize::new(1),
        abandoned: abandoned::<E>,
    });
    (
        Completer {
            slot: Arc::clone(&slot),
        },
        PendingOperation { slot },
    )
}

impl<T, E> Clone for Completer<T, E> {
    fn clone(&self) -> Self {
        self.slot.completers.fetch_add(1, Ordering::Relaxed);
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T, E> Drop for Completer<T, E> {
    fn drop(&mut self) {
        if self.slot.completers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let error = (self.slot.abandoned)();
            self.finish(Err(error), COMPLETED_ASYNC);
        }
    }
}

impl<T, E> Completer<T, E> {
    /// Complete from an I/O completion path. Returns false if the
    /// operation was already completed.
    pub fn complete(&self, outcome: Result<T, E>) -> bool {
        self.finish(outcome, COMPLETED_ASYNC)
    }

    /// Complete on the issuing path before any I/O was awaited
    pub fn complete_inline(&self, outcome: Result<T, E>) -> bool {
        self.finish(outcome, COMPLETED_SYNC)
    }

    pub fn is_completed(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) != PENDING
    }

    fn finish(&self, outcome: Result<T, E>, mode: u8) -> bool {
        if self
            .slot
            .state
            .compare_exchange(PENDING, mode, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.slot.outcome.lock() = Some(outcome);
        self.slot.condvar.notify_all();
        self.slot.notify.notify_waiters();
        true
    }
}

impl<T, E> PendingOperation<T, E> {
    pub fn is_completed(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) != PENDING
    }

    /// Whether completion happened inline on the issuing path
    pub fn completed_synchronously(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) == COMPLETED_SYNC
    }

    fn take(&self) -> Option<Result<T, E>> {
        self.slot.outcome.lock().take()
    }

    /// Wait for the outcome from an async task
    pub async fn wait(self) -> Result<T, E> {
        loop {
            let mut notified = pin!(self.slot.notify.notified());
            notified.as_mut().enable();
            if let Some(outcome) = self.take() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Block the current thread until the outcome is available.
    ///
    /// Must not be called from inside an async runtime worker.
    pub fn wait_blocking(self) -> Result<T, E> {
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }
            self.slot.condvar.wait(&mut outcome);
        }
    }

    /// Blocking wait with a deadline. Hands the waiter back on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, E>, Self> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return Ok(outcome);
            }
            if self
                .slot
                .condvar
                .wait_until(&mut outcome, deadline)
                .timed_out()
            {
                if let Some(outcome) = outcome.take() {
                    return Ok(outcome);
                }
                drop(outcome);
                return Err(self);
            }
        }
    }
}

impl<T, E> std::fmt::Debug for PendingOperation<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T, E> std::fmt::Debug for Completer<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Failure {
        Abandoned,
        Reset(&'static str),
        Code(usize),
    }

    impl From<Abandoned> for Failure {
        fn from(_: Abandoned) -> Self {
            Self::Abandoned
        }
    }

    #[test]
    fn test_first_completion_wins() {
        let (completer, pending) = pending_operation::<u32, Failure>();
        let fault_path = completer.clone();

        assert!(completer.complete(Ok(7)));
        assert!(!fault_path.complete(Err(Failure::Reset("connection reset"))));
        assert!(!completer.complete_inline(Ok(8)));

        assert!(pending.is_completed());
        assert!(!pending.completed_synchronously());
        assert_eq!(pending.wait_blocking(), Ok(7));
    }

    #[test]
    fn test_inline_completion_is_synchronous() {
        let (completer, pending) = pending_operation::<(), Failure>();
        completer.complete_inline(Err(Failure::Reset("write failed")));
        assert!(pending.completed_synchronously());
        assert_eq!(pending.wait_blocking(), Err(Failure::Reset("write failed")));
    }

    #[test]
    fn test_blocking_wait_released_by_other_thread() {
        let (completer, pending) = pending_operation::<String, Failure>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok("done".to_string()));
        });
        assert_eq!(pending.wait_blocking(), Ok("done".to_string()));
        handle.join().expect("completer thread");
    }

    #[test]
    fn test_wait_timeout_returns_waiter() {
        let (completer, pending) = pending_operation::<u8, Failure>();
        let pending = pending
            .wait_timeout(Duration::from_millis(10))
            .expect_err("nothing completed yet");
        completer.complete(Ok(1));
        assert_eq!(pending.wait_timeout(Duration::from_secs(1)).unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let (completer, pending) = pending_operation::<u64, Failure>();
        let waiter = tokio::spawn(pending.wait());
        tokio::task::yield_now().await;
        completer.complete(Ok(42));
        assert_eq!(waiter.await.unwrap(), Ok(42));
    }

    #[tokio::test]
    async fn test_racing_completions_complete_once() {
        let (completer, pending) = pending_operation::<usize, Failure>();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let completer = completer.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    completer.complete(Ok(i))
                } else {
                    completer.complete(Err(Failure::Code(i)))
                }
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        match pending.wait().await {
            Ok(i) => assert_eq!(i % 2, 0),
            Err(Failure::Code(i)) => assert_eq!(i % 2, 1),
            Err(other) => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_dropping_a_clone_keeps_operation_pending() {
        let (completer, pending) = pending_operation::<u8, Failure>();
        drop(completer.clone());
        assert!(!pending.is_completed());
        completer.complete(Ok(3));
        assert_eq!(pending.wait_blocking(), Ok(3));
    }

    #[test]
    fn test_last_completer_dropped_after_completion_is_noop() {
        let (completer, pending) = pending_operation::<u8, Failure>();
        completer.complete(Ok(9));
        drop(completer);
        assert_eq!(pending.wait_blocking(), Ok(9));
    }

    #[test]
    fn test_panicking_holder_releases_blocking_waiter() {
        let (completer, pending) = pending_operation::<u8, Failure>();
        let handle = thread::spawn(move || {
            let _held = completer;
            thread::sleep(Duration::from_millis(20));
            panic!("request task failed");
        });
        assert_eq!(pending.wait_blocking(), Err(Failure::Abandoned));
        assert!(handle.join().is_err());
    }

    #[tokio::test]
    async fn test_panicking_task_releases_async_waiter() {
        let (completer, pending) = pending_operation::<u8, Failure>();
        let task = tokio::spawn(async move {
            let _held = completer;
            tokio::task::yield_now().await;
            panic!("request task failed");
        });
        assert_eq!(pending.wait().await, Err(Failure::Abandoned));
        assert!(task.await.is_err());
    }
}
