//! Response decoders

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{FrameError, Result};
use crate::event::{Event, SchemaChangeKind};
use crate::header::Opcode;
use crate::primitives::{
    read_bytes, read_int, read_short_bytes, read_string, read_string_multimap,
};
use crate::server_error::ServerError;

const ROWS_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const ROWS_HAS_MORE_PAGES: i32 = 0x0002;
const ROWS_NO_METADATA: i32 = 0x0004;

/// Body of a RESULT response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultBody {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared {
        id: Bytes,
        /// Bind and result metadata, left encoded
        metadata: Bytes,
    },
    SchemaChange {
        change: SchemaChangeKind,
        keyspace: String,
        table: String,
    },
}

/// A page of rows.
///
/// Column specs and row values stay encoded in `content`; decoding them
/// needs the CQL type system, which lives outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rows {
    pub flags: i32,
    pub column_count: i32,
    pub paging_state: Option<Bytes>,
    pub content: Bytes,
}

impl Rows {
    pub const fn has_more_pages(&self) -> bool {
        self.flags & ROWS_HAS_MORE_PAGES != 0
    }

    pub const fn has_global_table_spec(&self) -> bool {
        self.flags & ROWS_GLOBAL_TABLES_SPEC != 0
    }

    pub const fn has_metadata(&self) -> bool {
        self.flags & ROWS_NO_METADATA == 0
    }
}

impl ResultBody {
    pub fn decode(body: &mut Bytes) -> Result<Self> {
        let kind = read_int(body)?;
        match kind {
            0x0001 => Ok(Self::Void),
            0x0002 => {
                let flags = read_int(body)?;
                let column_count = read_int(body)?;
                let paging_state = if flags & ROWS_HAS_MORE_PAGES != 0 {
                    read_bytes(body)?
                } else {
                    None
                };
                Ok(Self::Rows(Rows {
                    flags,
                    column_count,
                    paging_state,
                    content: std::mem::take(body),
                }))
            }
            0x0003 => Ok(Self::SetKeyspace(read_string(body)?)),
            0x0004 => {
                let id = read_short_bytes(body)?;
                Ok(Self::Prepared {
                    id,
                    metadata: std::mem::take(body),
                })
            }
            0x0005 => Ok(Self::SchemaChange {
                change: SchemaChangeKind::parse(&read_string(body)?)?,
                keyspace: read_string(body)?,
                table: read_string(body)?,
            }),
            other => Err(FrameError::UnknownResultKind(other)),
        }
    }
}

/// A server-to-client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(ServerError),
    Ready,
    Authenticate { authenticator: String },
    Supported(HashMap<String, Vec<String>>),
    Result(ResultBody),
    Event(Event),
    AuthChallenge(Option<Bytes>),
    AuthSuccess(Option<Bytes>),
}

impl Response {
    /// Decode a response body. Request opcodes are rejected.
    pub fn decode(opcode: Opcode, mut body: Bytes) -> Result<Self> {
        let body = &mut body;
        let response = match opcode {
            Opcode::Error => Self::Error(ServerError::decode(body)?),
            Opcode::Ready => Self::Ready,
            Opcode::Authenticate => Self::Authenticate {
                authenticator: read_string(body)?,
            },
            Opcode::Supported => Self::Supported(read_string_multimap(body)?),
            Opcode::Result => Self::Result(ResultBody::decode(body)?),
            Opcode::Event => Self::Event(Event::decode(body)?),
            Opcode::AuthChallenge => Self::AuthChallenge(read_bytes(body)?),
            Opcode::AuthSuccess => Self::AuthSuccess(read_bytes(body)?),
            Opcode::Startup
            | Opcode::Credentials
            | Opcode::Options
            | Opcode::Query
            | Opcode::Prepare
            | Opcode::Execute
            | Opcode::Register
            | Opcode::Batch
            | Opcode::AuthResponse => return Err(FrameError::UnexpectedOpcode(opcode)),
        };
        Ok(response)
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Error(_) => "ERROR",
            Self::Ready => "READY",
            Self::Authenticate { .. } => "AUTHENTICATE",
            Self::Supported(_) => "SUPPORTED",
            Self::Result(_) => "RESULT",
            Self::Event(_) => "EVENT",
            Self::AuthChallenge(_) => "AUTH_CHALLENGE",
            Self::AuthSuccess(_) => "AUTH_SUCCESS",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::primitives::{write_bytes, write_int, write_short_bytes, write_string};
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_void_result() {
        let mut buf = BytesMut::new();
        write_int(&mut buf, 1);
        assert_eq!(
            Response::decode(Opcode::Result, buf.freeze()).unwrap(),
            Response::Result(ResultBody::Void)
        );
    }

    #[test]
    fn test_rows_with_paging_state() {
        let mut buf = BytesMut::new();
        write_int(&mut buf, 2);
        write_int(&mut buf, ROWS_HAS_MORE_PAGES | ROWS_GLOBAL_TABLES_SPEC);
        write_int(&mut buf, 3);
        write_bytes(&mut buf, Some(&[0xAB, 0xCD][..])).unwrap();
        buf.extend_from_slice(b"opaque");

        let Response::Result(ResultBody::Rows(rows)) =
            Response::decode(Opcode::Result, buf.freeze()).unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(rows.column_count, 3);
        assert!(rows.has_more_pages());
        assert!(rows.has_global_table_spec());
        assert!(rows.has_metadata());
        assert_eq!(rows.paging_state, Some(Bytes::from_static(&[0xAB, 0xCD])));
        assert_eq!(&rows.content[..], b"opaque");
    }

    #[test]
    fn test_prepared_result() {
        let mut buf = BytesMut::new();
        write_int(&mut buf, 4);
        write_short_bytes(&mut buf, &[1, 2, 3, 4]).unwrap();
        buf.extend_from_slice(&[0, 0, 0, 1]);

        assert_eq!(
            Response::decode(Opcode::Result, buf.freeze()).unwrap(),
            Response::Result(ResultBody::Prepared {
                id: Bytes::from_static(&[1, 2, 3, 4]),
                metadata: Bytes::from_static(&[0, 0, 0, 1])
            })
        );
    }

    #[test]
    fn test_authenticate() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "org.apache.cassandra.auth.PasswordAuthenticator").unwrap();
        assert_eq!(
            Response::decode(Opcode::Authenticate, buf.freeze()).unwrap(),
            Response::Authenticate {
                authenticator: "org.apache.cassandra.auth.PasswordAuthenticator".to_string()
            }
        );
    }

    #[test]
    fn test_request_opcode_rejected() {
        assert_eq!(
            Response::decode(Opcode::Query, Bytes::new()),
            Err(FrameError::UnexpectedOpcode(Opcode::Query))
        );
    }

    #[test]
    fn test_unknown_result_kind() {
        let mut buf = BytesMut::new();
        write_int(&mut buf, 9);
        assert_eq!(
            Response::decode(Opcode::Result, buf.freeze()),
            Err(FrameError::UnknownResultKind(9))
        );
    }
}
