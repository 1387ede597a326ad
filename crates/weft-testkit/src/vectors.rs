//! Wire vectors: commands with their exact encodings.
//!
//! Every implementation of the protocol must produce these bytes. Peers
//! are given fixed uids so the vectors do not depend on registration order.

use bytes::Bytes;

use weft_core::{Block, Peer, PeerUid, Tick, TickSet};
use weft_perms::Permission;
use weft_sync::{encode_command, Address, Command};

/// One wire vector.
#[derive(Debug, Clone)]
pub struct WireVector {
    pub name: &'static str,
    pub command: Command,
    /// Expected encoding (hex).
    pub hex: &'static str,
}

fn fixed_tick(byte: u8, time: u64) -> Tick {
    let peer = Peer::get_or_create(PeerUid::from_bytes([byte; 16])).expect("peer registry full");
    Tick::new(peer, time).expect("time out of range")
}

pub fn all_vectors() -> Vec<WireVector> {
    let t5 = fixed_tick(0x11, 5);
    let t1 = fixed_tick(0x22, 1);
    vec![
        WireVector {
            name: "subscribe",
            command: Command::Subscribe {
                resource: "doc".into(),
            },
            hex: "07646f63c1",
        },
        WireVector {
            name: "permission write",
            command: Command::Permission {
                resource: "doc".into(),
                permission: Permission::Write,
            },
            hex: "00646f63c102",
        },
        WireVector {
            name: "empty known set",
            command: Command::OnKnown {
                resource: "doc".into(),
                ticks: TickSet::new(),
            },
            hex: "02646f63c100",
        },
        WireVector {
            name: "get block",
            command: Command::GetBlock {
                resource: "doc".into(),
                tick: t5,
            },
            hex: "03646f63c110111111111111111111111111111111110000000000000005",
        },
        WireVector {
            name: "requested block",
            command: Command::OnBlock {
                resource: "d".into(),
                block: Block::new(t1, Bytes::from_static(b"hi")).with_requested(true),
            },
            hex: "0564c1102222222222222222222222222222222200000000000000010000000268690001",
        },
        WireVector {
            name: "headers",
            command: Command::Headers(vec![("k".into(), "v".into())]),
            hex: "0a6bc176c1c2",
        },
        WireVector {
            name: "address",
            command: Command::Address(Address {
                scheme: "ws".into(),
                host: "h".into(),
                port: 443,
            }),
            hex: "0b7773c168c101bb",
        },
        WireVector {
            name: "two and three byte units",
            command: Command::Unresolved {
                resource: "\u{e9}\u{4e2d}".into(),
            },
            hex: "0980e9c04e2dc1",
        },
    ]
}

/// Names of the vectors whose encoding differs from the expected bytes.
pub fn verify_all_vectors() -> Vec<&'static str> {
    all_vectors()
        .into_iter()
        .filter(|v| match encode_command(&v.command) {
            Ok(bytes) => hex::encode(bytes) != v.hex,
            Err(_) => true,
        })
        .map(|v| v.name)
        .collect()
}
