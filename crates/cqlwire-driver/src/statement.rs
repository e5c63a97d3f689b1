//! Statements as submitted to the session

use std::sync::Arc;

use bytes::Bytes;
use cqlwire_frame::{
    BatchStatement, BatchType, Consistency, ProtocolVersion, QueryParameters, Request,
};

/// A statement prepared on the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    id: Bytes,
    cql: String,
    metadata: Bytes,
}

impl PreparedStatement {
    pub fn new(id: Bytes, cql: impl Into<String>, metadata: Bytes) -> Self {
        Self {
            id,
            cql: cql.into(),
            metadata,
        }
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn cql(&self) -> &str {
        &self.cql
    }

    /// Bind and result metadata as returned by the server, still encoded
    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    /// Bind already-serialized values
    pub fn bind(self: &Arc<Self>, values: Vec<Option<Bytes>>) -> Statement {
        Statement::bound(Arc::clone(self)).with_values(values)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Simple(String),
    Bound(Arc<PreparedStatement>),
    Batch {
        kind: BatchType,
        statements: Vec<BatchStatement>,
    },
}

/// One request to execute, with its per-request options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    kind: StatementKind,
    values: Vec<Option<Bytes>>,
    consistency: Option<Consistency>,
    serial_consistency: Option<Consistency>,
    page_size: Option<i32>,
    paging_state: Option<Bytes>,
    routing_key: Option<Bytes>,
    idempotent: bool,
}

impl Statement {
    /// A simple CQL statement
    pub fn new(cql: impl Into<String>) -> Self {
        Self::with_kind(StatementKind::Simple(cql.into()))
    }

    pub fn bound(prepared: Arc<PreparedStatement>) -> Self {
        Self::with_kind(StatementKind::Bound(prepared))
    }

    pub fn batch(kind: BatchType, statements: Vec<BatchStatement>) -> Self {
        Self::with_kind(StatementKind::Batch { kind, statements })
    }

    fn with_kind(kind: StatementKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
            consistency: None,
            serial_consistency: None,
            page_size: None,
            paging_state: None,
            routing_key: None,
            idempotent: false,
        }
    }

    #[must_use]
    pub fn with_values(mut self, values: Vec<Option<Bytes>>) -> Self {
        self.values = values;
        self
    }

    #[must_use]
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    #[must_use]
    pub fn with_serial_consistency(mut self, consistency: Consistency) -> Self {
        self.serial_consistency = Some(consistency);
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn with_paging_state(mut self, paging_state: Bytes) -> Self {
        self.paging_state = Some(paging_state);
        self
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: Bytes) -> Self {
        self.routing_key = Some(routing_key);
        self
    }

    /// Recorded for policies; the engine itself does not consult it
    #[must_use]
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    pub fn values(&self) -> &[Option<Bytes>] {
        &self.values
    }

    pub fn consistency(&self) -> Option<Consistency> {
        self.consistency
    }

    pub fn routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// The prepared statement this binds, if any
    pub fn prepared(&self) -> Option<&Arc<PreparedStatement>> {
        match &self.kind {
            StatementKind::Bound(prepared) => Some(prepared),
            _ => None,
        }
    }

    /// Build the wire request. `default_page_size` applies to protocol v2
    /// statements that set no page size of their own.
    pub fn to_request(
        &self,
        version: ProtocolVersion,
        consistency: Consistency,
        default_page_size: Option<i32>,
    ) -> Request {
        let page_size = match version {
            ProtocolVersion::V1 => self.page_size,
            ProtocolVersion::V2 => self.page_size.or(default_page_size),
        };
        let params = QueryParameters {
            consistency,
            values: self.values.clone(),
            skip_metadata: false,
            page_size,
            paging_state: self.paging_state.clone(),
            serial_consistency: self.serial_consistency,
        };
        match &self.kind {
            StatementKind::Simple(cql) => Request::Query {
                cql: cql.clone(),
                params,
            },
            StatementKind::Bound(prepared) => Request::Execute {
                id: prepared.id.clone(),
                params,
            },
            StatementKind::Batch { kind, statements } => Request::Batch {
                kind: *kind,
                statements: statements.clone(),
                consistency,
            },
        }
    }
}

impl From<&str> for Statement {
    fn from(cql: &str) -> Self {
        Self::new(cql)
    }
}

impl From<String> for Statement {
    fn from(cql: String) -> Self {
        Self::new(cql)
    }
}
