//! Request encoders

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::compression::Compressor;
use crate::consistency::Consistency;
use crate::error::{FrameError, Result};
use crate::event::EventType;
use crate::frame::{FrameWriter, SerializedRequest};
use crate::header::{Opcode, ProtocolVersion};
use crate::primitives::{
    write_bytes, write_consistency, write_int, write_long_string, write_short_bytes,
    write_string_list, write_string_map,
};

/// STARTUP option naming the CQL version
pub const CQL_VERSION: &str = "CQL_VERSION";

/// STARTUP option naming the body codec
pub const COMPRESSION: &str = "COMPRESSION";

const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_PAGING_STATE: u8 = 0x08;
const FLAG_SERIAL_CONSISTENCY: u8 = 0x10;

/// Per-query options shared by QUERY and EXECUTE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameters {
    pub consistency: Consistency,
    /// Already-serialized bound values, `None` binding null
    pub values: Vec<Option<Bytes>>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<Consistency>,
}

impl QueryParameters {
    pub fn with_consistency(consistency: Consistency) -> Self {
        Self {
            consistency,
            ..Self::default()
        }
    }

    fn uses_v2_features(&self) -> bool {
        self.skip_metadata
            || self.page_size.is_some()
            || self.paging_state.is_some()
            || self.serial_consistency.is_some()
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }
        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= FLAG_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= FLAG_SERIAL_CONSISTENCY;
        }
        flags
    }

    fn write_v2(&self, dst: &mut BytesMut) -> Result<()> {
        write_consistency(dst, self.consistency);
        dst.put_u8(self.flags());
        if !self.values.is_empty() {
            write_values(dst, &self.values)?;
        }
        if let Some(page_size) = self.page_size {
            write_int(dst, page_size);
        }
        if let Some(state) = &self.paging_state {
            write_bytes(dst, Some(&state[..]))?;
        }
        if let Some(serial) = self.serial_consistency {
            write_consistency(dst, serial);
        }
        Ok(())
    }
}

fn write_values(dst: &mut BytesMut, values: &[Option<Bytes>]) -> Result<()> {
    let count = u16::try_from(values.len()).map_err(|_| FrameError::ValueTooLong {
        kind: "values",
        length: values.len(),
    })?;
    dst.put_u16(count);
    for value in values {
        write_bytes(dst, value.as_deref())?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatement {
    Query {
        cql: String,
        values: Vec<Option<Bytes>>,
    },
    Prepared {
        id: Bytes,
        values: Vec<Option<Bytes>>,
    },
}

/// A client-to-server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Startup(HashMap<String, String>),
    Credentials(HashMap<String, String>),
    Options,
    Query {
        cql: String,
        params: QueryParameters,
    },
    Prepare(String),
    Execute {
        id: Bytes,
        params: QueryParameters,
    },
    Batch {
        kind: BatchType,
        statements: Vec<BatchStatement>,
        consistency: Consistency,
    },
    Register(Vec<EventType>),
    AuthResponse(Bytes),
}

impl Request {
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Startup(_) => Opcode::Startup,
            Self::Credentials(_) => Opcode::Credentials,
            Self::Options => Opcode::Options,
            Self::Query { .. } => Opcode::Query,
            Self::Prepare(_) => Opcode::Prepare,
            Self::Execute { .. } => Opcode::Execute,
            Self::Batch { .. } => Opcode::Batch,
            Self::Register(_) => Opcode::Register,
            Self::AuthResponse(_) => Opcode::AuthResponse,
        }
    }

    /// Encode as a complete frame with stream id 0.
    ///
    /// STARTUP and OPTIONS are never compressed since they precede codec
    /// negotiation.
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        compressor: Option<&dyn Compressor>,
    ) -> Result<SerializedRequest> {
        let opcode = self.opcode();
        self.check_version(version)?;

        let mut writer = FrameWriter::new(version.request_byte(), 0, opcode);
        self.write_body(version, writer.body_mut())?;

        let compressor = match self {
            Self::Startup(_) | Self::Options => None,
            _ => compressor,
        };
        Ok(SerializedRequest::new(writer.finish(compressor)?, opcode))
    }

    fn check_version(&self, version: ProtocolVersion) -> Result<()> {
        if version >= ProtocolVersion::V2 {
            return match self {
                Self::Credentials(_) => Err(FrameError::UnexpectedOpcode(Opcode::Credentials)),
                _ => Ok(()),
            };
        }
        let needs_v2 = match self {
            Self::Batch { .. } | Self::AuthResponse(_) => true,
            Self::Query { params, .. } => !params.values.is_empty() || params.uses_v2_features(),
            Self::Execute { params, .. } => params.uses_v2_features(),
            _ => false,
        };
        if needs_v2 {
            return Err(FrameError::UnsupportedRequest {
                opcode: self.opcode(),
                required: ProtocolVersion::V2.as_u8(),
            });
        }
        Ok(())
    }

    fn write_body(&self, version: ProtocolVersion, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Startup(options) | Self::Credentials(options) => write_string_map(dst, options),
            Self::Options => Ok(()),
            Self::Query { cql, params } => {
                write_long_string(dst, cql)?;
                match version {
                    ProtocolVersion::V1 => {
                        write_consistency(dst, params.consistency);
                        Ok(())
                    }
                    ProtocolVersion::V2 => params.write_v2(dst),
                }
            }
            Self::Prepare(cql) => write_long_string(dst, cql),
            Self::Execute { id, params } => {
                write_short_bytes(dst, id)?;
                match version {
                    ProtocolVersion::V1 => {
                        write_values(dst, &params.values)?;
                        write_consistency(dst, params.consistency);
                        Ok(())
                    }
                    ProtocolVersion::V2 => params.write_v2(dst),
                }
            }
            Self::Batch {
                kind,
                statements,
                consistency,
            } => {
                dst.put_u8(*kind as u8);
                let count = u16::try_from(statements.len()).map_err(|_| {
                    FrameError::ValueTooLong {
                        kind: "batch",
                        length: statements.len(),
                    }
                })?;
                dst.put_u16(count);
                for statement in statements {
                    let values = match statement {
                        BatchStatement::Query { cql, values } => {
                            dst.put_u8(0);
                            write_long_string(dst, cql)?;
                            values
                        }
                        BatchStatement::Prepared { id, values } => {
                            dst.put_u8(1);
                            write_short_bytes(dst, id)?;
                            values
                        }
                    };
                    write_values(dst, values)?;
                }
                write_consistency(dst, *consistency);
                Ok(())
            }
            Self::Register(events) => {
                let names: Vec<&str> = events.iter().map(|e| e.as_str()).collect();
                write_string_list(dst, &names)
            }
            Self::AuthResponse(token) => write_bytes(dst, Some(&token[..])),
        }
    }
}
