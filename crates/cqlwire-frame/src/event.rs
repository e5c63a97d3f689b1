//! Server-pushed events

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::primitives::{read_inet, read_string};

/// Event categories a connection can REGISTER for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub const ALL: [Self; 3] = [Self::TopologyChange, Self::StatusChange, Self::SchemaChange];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TopologyChange => "TOPOLOGY_CHANGE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeKind {
    Created,
    Updated,
    Dropped,
}

impl SchemaChangeKind {
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        match raw {
            "CREATED" => Ok(Self::Created),
            "UPDATED" => Ok(Self::Updated),
            "DROPPED" => Ok(Self::Dropped),
            other => Err(FrameError::UnknownEvent(other.to_string())),
        }
    }
}

/// Decoded EVENT body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange {
        change: TopologyChange,
        address: SocketAddr,
    },
    StatusChange {
        change: StatusChange,
        address: SocketAddr,
    },
    SchemaChange {
        change: SchemaChangeKind,
        keyspace: String,
        /// Empty for keyspace-level changes
        table: String,
    },
}

impl Event {
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::TopologyChange { .. } => EventType::TopologyChange,
            Self::StatusChange { .. } => EventType::StatusChange,
            Self::SchemaChange { .. } => EventType::SchemaChange,
        }
    }

    pub fn decode(body: &mut Bytes) -> Result<Self> {
        let kind = read_string(body)?;
        match kind.as_str() {
            "TOPOLOGY_CHANGE" => {
                let change = match read_string(body)?.as_str() {
                    "NEW_NODE" => TopologyChange::NewNode,
                    "REMOVED_NODE" => TopologyChange::RemovedNode,
                    "MOVED_NODE" => TopologyChange::MovedNode,
                    other => return Err(FrameError::UnknownEvent(other.to_string())),
                };
                let address = read_inet(body)?;
                Ok(Self::TopologyChange { change, address })
            }
            "STATUS_CHANGE" => {
                let change = match read_string(body)?.as_str() {
                    "UP" => StatusChange::Up,
                    "DOWN" => StatusChange::Down,
                    other => return Err(FrameError::UnknownEvent(other.to_string())),
                };
                let address = read_inet(body)?;
                Ok(Self::StatusChange { change, address })
            }
            "SCHEMA_CHANGE" => {
                let change = SchemaChangeKind::parse(&read_string(body)?)?;
                let keyspace = read_string(body)?;
                let table = read_string(body)?;
                Ok(Self::SchemaChange {
                    change,
                    keyspace,
                    table,
                })
            }
            _ => Err(FrameError::UnknownEvent(kind)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::primitives::{write_inet, write_string};
    use bytes::BytesMut;

    #[test]
    fn test_status_change() {
        let addr: SocketAddr = "192.168.1.20:9042".parse().unwrap();
        let mut buf = BytesMut::new();
        write_string(&mut buf, "STATUS_CHANGE").unwrap();
        write_string(&mut buf, "DOWN").unwrap();
        write_inet(&mut buf, &addr);

        let event = Event::decode(&mut buf.freeze()).unwrap();
        assert_eq!(
            event,
            Event::StatusChange {
                change: StatusChange::Down,
                address: addr
            }
        );
        assert_eq!(event.event_type(), EventType::StatusChange);
    }

    #[test]
    fn test_schema_change_keyspace_level() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "SCHEMA_CHANGE").unwrap();
        write_string(&mut buf, "CREATED").unwrap();
        write_string(&mut buf, "metrics").unwrap();
        write_string(&mut buf, "").unwrap();

        let event = Event::decode(&mut buf.freeze()).unwrap();
        assert_eq!(
            event,
            Event::SchemaChange {
                change: SchemaChangeKind::Created,
                keyspace: "metrics".to_string(),
                table: String::new()
            }
        );
    }

    #[test]
    fn test_unknown_event() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "TRACE_COMPLETE").unwrap();
        assert_eq!(
            Event::decode(&mut buf.freeze()),
            Err(FrameError::UnknownEvent("TRACE_COMPLETE".to_string()))
        );
    }
}
