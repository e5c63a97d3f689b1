//! Errors reported by the server in ERROR frames

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::consistency::Consistency;
use crate::error::Result;
use crate::primitives::{read_byte, read_consistency, read_int, read_short_bytes, read_string};

/// Kind of write that timed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    Other(String),
}

impl WriteType {
    fn parse(raw: String) -> Self {
        match raw.as_str() {
            "SIMPLE" => Self::Simple,
            "BATCH" => Self::Batch,
            "UNLOGGED_BATCH" => Self::UnloggedBatch,
            "COUNTER" => Self::Counter,
            "BATCH_LOG" => Self::BatchLog,
            "CAS" => Self::Cas,
            _ => Self::Other(raw),
        }
    }
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Simple => "SIMPLE",
            Self::Batch => "BATCH",
            Self::UnloggedBatch => "UNLOGGED_BATCH",
            Self::Counter => "COUNTER",
            Self::BatchLog => "BATCH_LOG",
            Self::Cas => "CAS",
            Self::Other(raw) => raw,
        };
        f.write_str(name)
    }
}

/// Error code and its code-specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    Server,
    Protocol,
    BadCredentials,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    Overloaded,
    IsBootstrapping,
    TruncateError,
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    SyntaxError,
    Unauthorized,
    Invalid,
    ConfigError,
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: Bytes,
    },
    Unknown(i32),
}

impl ServerErrorKind {
    pub const fn code(&self) -> i32 {
        match self {
            Self::Server => 0x0000,
            Self::Protocol => 0x000A,
            Self::BadCredentials => 0x0100,
            Self::Unavailable { .. } => 0x1000,
            Self::Overloaded => 0x1001,
            Self::IsBootstrapping => 0x1002,
            Self::TruncateError => 0x1003,
            Self::WriteTimeout { .. } => 0x1100,
            Self::ReadTimeout { .. } => 0x1200,
            Self::SyntaxError => 0x2000,
            Self::Unauthorized => 0x2100,
            Self::Invalid => 0x2200,
            Self::ConfigError => 0x2300,
            Self::AlreadyExists { .. } => 0x2400,
            Self::Unprepared { .. } => 0x2500,
            Self::Unknown(code) => *code,
        }
    }
}

/// A structured ERROR response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Server error 0x{code:04x}: {message}", code = .kind.code())]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
}

impl ServerError {
    pub fn new(kind: ServerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Errors that say nothing about the query itself, only about the
    /// coordinator that received it. Another host may succeed.
    pub const fn is_coordinator_failure(&self) -> bool {
        matches!(
            self.kind,
            ServerErrorKind::Overloaded
                | ServerErrorKind::IsBootstrapping
                | ServerErrorKind::TruncateError
        )
    }

    pub fn decode(body: &mut Bytes) -> Result<Self> {
        let code = read_int(body)?;
        let message = read_string(body)?;
        let kind = match code {
            0x0000 => ServerErrorKind::Server,
            0x000A => ServerErrorKind::Protocol,
            0x0100 => ServerErrorKind::BadCredentials,
            0x1000 => ServerErrorKind::Unavailable {
                consistency: read_consistency(body)?,
                required: read_int(body)?,
                alive: read_int(body)?,
            },
            0x1001 => ServerErrorKind::Overloaded,
            0x1002 => ServerErrorKind::IsBootstrapping,
            0x1003 => ServerErrorKind::TruncateError,
            0x1100 => ServerErrorKind::WriteTimeout {
                consistency: read_consistency(body)?,
                received: read_int(body)?,
                block_for: read_int(body)?,
                write_type: WriteType::parse(read_string(body)?),
            },
            0x1200 => ServerErrorKind::ReadTimeout {
                consistency: read_consistency(body)?,
                received: read_int(body)?,
                block_for: read_int(body)?,
                data_present: read_byte(body)? != 0,
            },
            0x2000 => ServerErrorKind::SyntaxError,
            0x2100 => ServerErrorKind::Unauthorized,
            0x2200 => ServerErrorKind::Invalid,
            0x2300 => ServerErrorKind::ConfigError,
            0x2400 => ServerErrorKind::AlreadyExists {
                keyspace: read_string(body)?,
                table: read_string(body)?,
            },
            0x2500 => ServerErrorKind::Unprepared {
                id: read_short_bytes(body)?,
            },
            other => ServerErrorKind::Unknown(other),
        };
        Ok(Self { kind, message })
    }
}
