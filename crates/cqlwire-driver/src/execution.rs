//! Request execution across hosts
//!
//! Walks the load-balancing plan. Transport failures and coordinator-level
//! server errors move on to the next host. Timeouts and unavailable errors
//! go to the retry policy, which may retry on the same host. An unprepared
//! statement is prepared again on the same connection and retried once.
//! Every other server error is final and is returned as
//! [`DriverError::Query`] together with the failures of earlier hosts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use cqlwire_frame::{
    Consistency, Request, Response, ResultBody, ServerError, ServerErrorKind,
};
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::error::{ConnectionError, DriverError, Result};
use crate::host::HostDistance;
use crate::policies::RetryDecision;
use crate::session::SessionInner;
use crate::statement::{PreparedStatement, Statement};

/// How a request finished
#[derive(Debug, Clone, Default)]
pub struct ExecutionInfo {
    /// Host that produced the final response
    pub queried_host: Option<SocketAddr>,
    /// Retries made on the advice of the retry policy
    pub retry_count: u32,
    /// Consistency of the final attempt
    pub achieved_consistency: Consistency,
    /// Failures recorded against hosts tried before the final one
    pub errors: HashMap<SocketAddr, DriverError>,
}

/// Result body plus how it was obtained
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub body: ResultBody,
    pub info: ExecutionInfo,
}

/// What is being sent
#[derive(Debug, Clone, Copy)]
pub(crate) enum Work<'a> {
    Statement(&'a Statement),
    Prepare(&'a str),
}

impl Work<'_> {
    fn routing_key(&self) -> Option<&[u8]> {
        match self {
            Self::Statement(statement) => statement.routing_key(),
            Self::Prepare(_) => None,
        }
    }
}

enum Outcome {
    Done(ResultBody),
    /// Try again on the same host
    Retry,
    /// Record against the host and fail over
    NextHost(DriverError),
}

/// Retry state of one logical request
struct Attempt<'a> {
    work: Work<'a>,
    consistency: Consistency,
    retry_count: u32,
    reprepared: bool,
}

pub(crate) async fn execute(session: &SessionInner, work: Work<'_>) -> Result<QueryResult> {
    let consistency = match work {
        Work::Statement(statement) => statement
            .consistency()
            .unwrap_or(session.config.query.consistency),
        Work::Prepare(_) => session.config.query.consistency,
    };
    let mut attempt = Attempt {
        work,
        consistency,
        retry_count: 0,
        reprepared: false,
    };
    let keyspace = session.keyspace();
    let policy = &session.policies.load_balancing;
    let plan = policy.new_query_plan(work.routing_key(), session.hosts.all());
    let mut errors = HashMap::new();

    for host in plan {
        if !host.is_considered_up() {
            trace!(host = %host, "Skipping down host");
            continue;
        }
        let distance = policy.distance(&host);
        if distance == HostDistance::Ignored {
            continue;
        }
        let Some(pool) = session.pool(&host, distance) else {
            continue;
        };
        let address = host.address();

        loop {
            let connection = match pool.acquire(keyspace.as_deref()).await {
                Ok(connection) => connection,
                Err(error) => {
                    debug!(host = %address, %error, "No connection");
                    errors.insert(address, DriverError::from(error));
                    break;
                }
            };

            let outcome = match attempt.run(session, &connection, keyspace.as_deref()).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    debug!(host = %address, %error, failed_hosts = errors.len(), "Request failed");
                    return Err(DriverError::Query {
                        error: Box::new(error),
                        errors,
                    });
                }
            };
            match outcome {
                Outcome::Done(body) => {
                    return Ok(QueryResult {
                        body,
                        info: ExecutionInfo {
                            queried_host: Some(address),
                            retry_count: attempt.retry_count,
                            achieved_consistency: attempt.consistency,
                            errors,
                        },
                    });
                }
                Outcome::Retry => {}
                Outcome::NextHost(error) => {
                    debug!(host = %address, %error, "Trying next host");
                    errors.insert(address, error);
                    break;
                }
            }
        }
    }

    warn!(tried = errors.len(), "No host available");
    Err(DriverError::NoHostAvailable { errors })
}

impl Attempt<'_> {
    async fn run(
        &mut self,
        session: &SessionInner,
        connection: &Connection,
        keyspace: Option<&str>,
    ) -> Result<Outcome> {
        if let Err(error) = connection.ensure_keyspace(keyspace).await {
            return match error {
                ConnectionError::Server(error) => Err(DriverError::Server(error)),
                other => Ok(Outcome::NextHost(other.into())),
            };
        }

        let version = connection.protocol_version();
        let request = match self.work {
            Work::Statement(statement) => {
                statement.to_request(version, self.consistency, session.config.query.page_size)
            }
            Work::Prepare(cql) => Request::Prepare(cql.to_string()),
        };
        let serialized = request.serialize(version, connection.compressor())?;

        let response = match connection.request(serialized).await {
            Ok(response) => response,
            Err(ConnectionError::Protocol(error)) if !is_transport_fault(connection) => {
                return Err(DriverError::Codec(error));
            }
            Err(error) => return Ok(Outcome::NextHost(error.into())),
        };

        match response {
            Response::Result(body) => Ok(Outcome::Done(body)),
            Response::Error(error) => self.on_server_error(session, connection, error).await,
            other => Err(DriverError::UnexpectedResponse(other.kind())),
        }
    }

    async fn on_server_error(
        &mut self,
        session: &SessionInner,
        connection: &Connection,
        error: ServerError,
    ) -> Result<Outcome> {
        if error.is_coordinator_failure() {
            return Ok(Outcome::NextHost(DriverError::Server(error)));
        }

        let Work::Statement(statement) = self.work else {
            return Err(DriverError::Server(error));
        };
        let retry = &session.policies.retry;
        let decision = match &error.kind {
            ServerErrorKind::ReadTimeout {
                consistency,
                received,
                block_for,
                data_present,
            } => retry.on_read_timeout(
                statement,
                *consistency,
                *block_for,
                *received,
                *data_present,
                self.retry_count,
            ),
            ServerErrorKind::WriteTimeout {
                consistency,
                received,
                block_for,
                write_type,
            } => retry.on_write_timeout(
                statement,
                *consistency,
                write_type,
                *block_for,
                *received,
                self.retry_count,
            ),
            ServerErrorKind::Unavailable {
                consistency,
                required,
                alive,
            } => retry.on_unavailable(
                statement,
                *consistency,
                *required,
                *alive,
                self.retry_count,
            ),
            ServerErrorKind::Unprepared { id } => {
                return self.reprepare(session, connection, id, error.clone()).await;
            }
            _ => return Err(DriverError::Server(error)),
        };

        match decision {
            RetryDecision::Retry(next) => {
                self.retry_count += 1;
                if let Some(next) = next {
                    self.consistency = next;
                }
                debug!(
                    retry_count = self.retry_count,
                    consistency = %self.consistency,
                    "Retrying on same host"
                );
                Ok(Outcome::Retry)
            }
            RetryDecision::Rethrow => Err(DriverError::Server(error)),
            RetryDecision::Ignore => Ok(Outcome::Done(ResultBody::Void)),
        }
    }

    /// Prepare the statement again on `connection`, once per request
    async fn reprepare(
        &mut self,
        session: &SessionInner,
        connection: &Connection,
        id: &Bytes,
        error: ServerError,
    ) -> Result<Outcome> {
        if self.reprepared {
            return Err(DriverError::Server(error));
        }
        let Some(prepared) = session.prepared(id) else {
            warn!(id = %hex::encode(id), "Unprepared statement not in cache");
            return Err(DriverError::Server(error));
        };
        self.reprepared = true;
        debug!(
            host = %connection.address(),
            id = %hex::encode(id),
            "Re-preparing statement"
        );

        match connection.send(&Request::Prepare(prepared.cql().to_string())).await {
            Ok(Response::Result(ResultBody::Prepared { id: new_id, .. })) => {
                if new_id != *prepared.id() {
                    warn!(
                        old = %hex::encode(prepared.id()),
                        new = %hex::encode(&new_id),
                        "Statement id changed on re-prepare"
                    );
                }
                Ok(Outcome::Retry)
            }
            Ok(Response::Error(error)) => Err(DriverError::Server(error)),
            Ok(other) => Err(DriverError::UnexpectedResponse(other.kind())),
            Err(error) => Ok(Outcome::NextHost(error.into())),
        }
    }
}

/// A protocol error on a still-healthy connection came from decoding one
/// response, not from a broken stream
fn is_transport_fault(connection: &Connection) -> bool {
    !connection.is_healthy()
}

/// Cache a freshly prepared statement
pub(crate) fn prepared_from_result(
    session: &SessionInner,
    cql: &str,
    body: ResultBody,
) -> Result<Arc<PreparedStatement>> {
    match body {
        ResultBody::Prepared { id, metadata } => {
            let prepared = Arc::new(PreparedStatement::new(id, cql, metadata));
            session.cache_prepared(Arc::clone(&prepared));
            Ok(prepared)
        }
        _ => Err(DriverError::UnexpectedResponse("RESULT")),
    }
}
