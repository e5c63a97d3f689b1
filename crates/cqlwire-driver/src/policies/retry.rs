//! Retry decisions for timeout and unavailable errors

use std::fmt::Debug;
use std::sync::Arc;

use cqlwire_frame::{Consistency, WriteType};
use tracing::info;

use crate::statement::Statement;

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same host, optionally at another consistency level
    Retry(Option<Consistency>),
    /// Return the error to the caller
    Rethrow,
    /// Report success with an empty result
    Ignore,
}

/// Consulted when a coordinator reports a read timeout, write timeout or
/// unavailable replicas. `retry_count` counts retries already made for the
/// request.
pub trait RetryPolicy: Send + Sync + Debug {
    fn on_read_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        retry_count: u32,
    ) -> RetryDecision;

    fn on_write_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        retry_count: u32,
    ) -> RetryDecision;

    fn on_unavailable(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retry_count: u32,
    ) -> RetryDecision;
}

/// Conservative defaults.
///
/// Retries a read timeout once when enough replicas answered but the data
/// replica did not, retries a batch log write timeout once, and rethrows
/// everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_read_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count == 0 && received >= required && !data_retrieved {
            RetryDecision::Retry(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        write_type: &WriteType,
        _required: i32,
        _received: i32,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count == 0 && *write_type == WriteType::BatchLog {
            RetryDecision::Retry(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_unavailable(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Retries once at the highest level the reported replica count can still
/// satisfy. Trades consistency for availability.
#[derive(Debug, Clone, Copy, Default)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    fn max_likely_to_work(known_ok: i32) -> RetryDecision {
        match known_ok {
            3.. => RetryDecision::Retry(Some(Consistency::Three)),
            2 => RetryDecision::Retry(Some(Consistency::Two)),
            1 => RetryDecision::Retry(Some(Consistency::One)),
            _ => RetryDecision::Rethrow,
        }
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn on_read_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count != 0 {
            RetryDecision::Rethrow
        } else if received < required {
            Self::max_likely_to_work(received)
        } else if !data_retrieved {
            RetryDecision::Retry(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        write_type: &WriteType,
        _required: i32,
        received: i32,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count != 0 {
            return RetryDecision::Rethrow;
        }
        match write_type {
            // At least one replica has the write and it will propagate
            WriteType::Simple | WriteType::Batch if received > 0 => RetryDecision::Ignore,
            WriteType::UnloggedBatch => Self::max_likely_to_work(received),
            WriteType::BatchLog => RetryDecision::Retry(None),
            _ => RetryDecision::Rethrow,
        }
    }

    fn on_unavailable(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        alive: i32,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count != 0 {
            return RetryDecision::Rethrow;
        }
        Self::max_likely_to_work(alive)
    }
}

/// Never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _received: i32,
        _data_retrieved: bool,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _write_type: &WriteType,
        _required: i32,
        _received: i32,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_unavailable(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        _retry_count: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Logs every decision of the wrapped policy other than rethrow
#[derive(Debug, Clone)]
pub struct LoggingRetryPolicy {
    inner: Arc<dyn RetryPolicy>,
}

impl LoggingRetryPolicy {
    pub fn new(inner: Arc<dyn RetryPolicy>) -> Self {
        Self { inner }
    }
}

fn log_decision(decision: RetryDecision, cause: &str, consistency: Consistency, retry_count: u32) {
    match decision {
        RetryDecision::Retry(next) => info!(
            cause,
            %consistency,
            next = %next.unwrap_or(consistency),
            retry_count,
            "Retrying"
        ),
        RetryDecision::Ignore => info!(cause, %consistency, retry_count, "Ignoring error"),
        RetryDecision::Rethrow => {}
    }
}

impl RetryPolicy for LoggingRetryPolicy {
    fn on_read_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        retry_count: u32,
    ) -> RetryDecision {
        let decision = self.inner.on_read_timeout(
            statement,
            consistency,
            required,
            received,
            data_retrieved,
            retry_count,
        );
        log_decision(decision, "read timeout", consistency, retry_count);
        decision
    }

    fn on_write_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        retry_count: u32,
    ) -> RetryDecision {
        let decision = self.inner.on_write_timeout(
            statement,
            consistency,
            write_type,
            required,
            received,
            retry_count,
        );
        log_decision(decision, "write timeout", consistency, retry_count);
        decision
    }

    fn on_unavailable(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retry_count: u32,
    ) -> RetryDecision {
        let decision =
            self.inner
                .on_unavailable(statement, consistency, required, alive, retry_count);
        log_decision(decision, "unavailable", consistency, retry_count);
        decision
    }
}
