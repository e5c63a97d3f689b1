//! Synchronous facade over [`Session`]
//!
//! Each call runs on the owned runtime and the calling thread parks on the
//! operation's condvar until it completes. No pool or connection lock is
//! held while parked. A request task that panics releases its caller with
//! [`DriverError::Internal`]. Do not call from inside an async runtime.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::config::ClusterConfig;
use crate::error::{DriverError, Result};
use crate::execution::QueryResult;
use crate::pending::pending_operation;
use crate::session::Session;
use crate::statement::{PreparedStatement, Statement};

/// Blocking session owning its runtime
#[derive(Debug)]
pub struct BlockingSession {
    runtime: Runtime,
    session: Session,
}

impl BlockingSession {
    pub fn connect(config: ClusterConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("cqlwire")
            .build()
            .map_err(|e| DriverError::Internal(format!("Failed to start runtime: {e}")))?;
        let session = runtime.block_on(Session::connect(config))?;
        Ok(Self { runtime, session })
    }

    /// Wrap a session created on `runtime`
    pub fn from_session(runtime: Runtime, session: Session) -> Self {
        Self { runtime, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        run_on(&self.runtime, work)
    }

    pub fn execute(&self, statement: Statement) -> Result<QueryResult> {
        let session = self.session.clone();
        self.run(async move { session.execute(&statement).await })
    }

    pub fn query(&self, cql: impl Into<String>) -> Result<QueryResult> {
        self.execute(Statement::new(cql))
    }

    pub fn prepare(&self, cql: &str) -> Result<Arc<PreparedStatement>> {
        let session = self.session.clone();
        let cql = cql.to_string();
        self.run(async move { session.prepare(&cql).await })
    }

    pub fn use_keyspace(&self, keyspace: &str) -> Result<()> {
        let session = self.session.clone();
        let keyspace = keyspace.to_string();
        self.run(async move { session.use_keyspace(&keyspace).await })
    }

    /// Shut the session down and stop the runtime
    pub fn shutdown(self) {
        let Self { runtime, session } = self;
        runtime.block_on(session.shutdown());
        runtime.shutdown_background();
    }
}

/// Spawn `work` and park the calling thread until it finishes
fn run_on<T, F>(runtime: &Runtime, work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let (completer, pending) = pending_operation();
    runtime.spawn(async move {
        completer.complete(work.await);
    });
    pending.wait_blocking()
}
