//! Protocol commands exchanged over a connection.
//!
//! Every frame starts with a one-byte opcode. All commands except HEADERS
//! and ADDRESS then carry the resource name as an encoded string.
//!
//! ```text
//! PERMISSION    name  u8 level
//! GET_KNOWN     name
//! ON_KNOWN      name  tick-set
//! GET_BLOCK     name  tick
//! CANCEL_BLOCK  name  tick
//! ON_BLOCK      name  tick  u32 len  payload  removal tick-set  u8 requested
//! ACK_BLOCK     name  tick
//! SUBSCRIBE     name
//! UNSUBSCRIBE   name
//! UNRESOLVED    name
//! HEADERS       (key value)*  null
//! ADDRESS       scheme  host  u16 port
//! ```

use std::fmt;

use weft_core::{Block, CodecError, Tick, TickSet};
use weft_perms::Permission;

/// Wire limits.
pub mod limits {
    /// Smallest outbound buffer. Every atomic encode step must fit in one.
    pub const MIN_BUFFER_SIZE: usize = 64;

    /// Default cap on an ON_BLOCK payload (16 MiB).
    pub const DEFAULT_MAX_BLOCK_LEN: u32 = 16 * 1024 * 1024;
}

/// Command opcodes, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Permission = 0,
    GetKnown = 1,
    OnKnown = 2,
    GetBlock = 3,
    CancelBlock = 4,
    OnBlock = 5,
    AckBlock = 6,
    Subscribe = 7,
    Unsubscribe = 8,
    Unresolved = 9,
    Headers = 10,
    Address = 11,
}

impl Opcode {
    /// Whether the frame carries a resource name after the opcode.
    pub fn is_resource_scoped(self) -> bool {
        !matches!(self, Opcode::Headers | Opcode::Address)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::Permission,
            1 => Opcode::GetKnown,
            2 => Opcode::OnKnown,
            3 => Opcode::GetBlock,
            4 => Opcode::CancelBlock,
            5 => Opcode::OnBlock,
            6 => Opcode::AckBlock,
            7 => Opcode::Subscribe,
            8 => Opcode::Unsubscribe,
            9 => Opcode::Unresolved,
            10 => Opcode::Headers,
            11 => Opcode::Address,
            other => return Err(CodecError::InvalidTag(other)),
        })
    }
}

/// Network address a peer reports for itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// One protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Permission {
        resource: String,
        permission: Permission,
    },
    GetKnown {
        resource: String,
    },
    OnKnown {
        resource: String,
        ticks: TickSet,
    },
    GetBlock {
        resource: String,
        tick: Tick,
    },
    CancelBlock {
        resource: String,
        tick: Tick,
    },
    OnBlock {
        resource: String,
        block: Block,
    },
    AckBlock {
        resource: String,
        tick: Tick,
    },
    Subscribe {
        resource: String,
    },
    Unsubscribe {
        resource: String,
    },
    Unresolved {
        resource: String,
    },
    Headers(Vec<(String, String)>),
    Address(Address),
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Permission { .. } => Opcode::Permission,
            Command::GetKnown { .. } => Opcode::GetKnown,
            Command::OnKnown { .. } => Opcode::OnKnown,
            Command::GetBlock { .. } => Opcode::GetBlock,
            Command::CancelBlock { .. } => Opcode::CancelBlock,
            Command::OnBlock { .. } => Opcode::OnBlock,
            Command::AckBlock { .. } => Opcode::AckBlock,
            Command::Subscribe { .. } => Opcode::Subscribe,
            Command::Unsubscribe { .. } => Opcode::Unsubscribe,
            Command::Unresolved { .. } => Opcode::Unresolved,
            Command::Headers(_) => Opcode::Headers,
            Command::Address(_) => Opcode::Address,
        }
    }

    /// The resource this command is about, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Command::Permission { resource, .. }
            | Command::GetKnown { resource }
            | Command::OnKnown { resource, .. }
            | Command::GetBlock { resource, .. }
            | Command::CancelBlock { resource, .. }
            | Command::OnBlock { resource, .. }
            | Command::AckBlock { resource, .. }
            | Command::Subscribe { resource }
            | Command::Unsubscribe { resource }
            | Command::Unresolved { resource } => Some(resource),
            Command::Headers(_) | Command::Address(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip_and_order() {
        for byte in 0u8..=11 {
            assert_eq!(Opcode::try_from(byte).unwrap() as u8, byte);
        }
        assert_eq!(Opcode::OnBlock as u8, 5);
        assert_eq!(Opcode::try_from(12), Err(CodecError::InvalidTag(12)));
    }

    #[test]
    fn test_resource_scope() {
        let cmd = Command::Subscribe {
            resource: "doc".into(),
        };
        assert_eq!(cmd.resource(), Some("doc"));
        assert!(cmd.opcode().is_resource_scoped());
        assert_eq!(Command::Headers(Vec::new()).resource(), None);
        assert!(!Opcode::Address.is_resource_scoped());
    }

    #[test]
    fn test_address_display() {
        let addr = Address {
            scheme: "tcp".into(),
            host: "example.net".into(),
            port: 7000,
        };
        assert_eq!(addr.to_string(), "tcp://example.net:7000");
    }
}
