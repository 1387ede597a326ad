//! Error types for Weft core.

use thiserror::Error;

/// Errors raised by the peer registry and causal primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    /// All 24-bit peer indices are taken.
    #[error("peer index space exhausted")]
    PeerSpaceExhausted,

    /// A tick references a peer index that was never registered.
    #[error("unknown peer index: {0}")]
    UnknownPeer(u32),

    /// Time component does not fit in 40 bits.
    #[error("tick time out of range: {0}")]
    TimeOutOfRange(u64),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised by the resumable codec.
///
/// Running out of bytes is never an error; decoders report
/// [`Progress::Suspended`](crate::codec::Progress::Suspended) instead.
/// `Truncated` is only produced by whole-buffer decodes that expect the
/// complete value to be present.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid tag byte 0x{0:02x}")]
    InvalidTag(u8),

    #[error("string is not valid UTF-16")]
    InvalidUtf16,

    #[error("null marker inside a non-empty string")]
    MisplacedNull,

    #[error("back-reference to unknown peer slot {0}")]
    UnknownBackReference(u32),

    #[error("null tick where a tick was required")]
    UnexpectedNull,

    #[error("tick references unknown peer index {0}")]
    UnknownPeer(u32),

    #[error("tick time out of range: {0}")]
    TimeOutOfRange(u64),

    #[error("peer index space exhausted")]
    PeerSpaceExhausted,

    #[error("input ended before the value was complete")]
    Truncated,

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("length {len} exceeds limit {limit}")]
    LengthExceeded { len: u64, limit: u64 },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
