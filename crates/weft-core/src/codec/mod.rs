//! Resumable binary codec.
//!
//! ## Overview
//!
//! Every encoder and decoder is a small state machine struct. Each call
//! makes as much progress as the cursor allows and returns
//! [`Progress::Suspended`] when it needs more bytes (decoding) or more room
//! (encoding). Partially computed values live in the struct's own fields, so
//! the caller resumes simply by calling again with the same struct once the
//! cursor has been refilled or drained.
//!
//! Sub-steps are atomic: a step either finds all of its bytes and consumes
//! them, or consumes nothing. Calling a suspended operation again without
//! feeding the cursor is therefore a no-op that leaves the state equal to
//! what it was.
//!
//! ## Encodings
//!
//! - Integers: fixed-width big-endian.
//! - Strings: per UTF-16 code unit, see [`string`].
//! - Ticks: peer blob (null, literal UID, or back-reference) then an 8-byte
//!   time, see [`tick`].

pub mod cursor;
pub mod string;
pub mod tick;

pub use cursor::{ReadCursor, WriteCursor};
pub use string::{StringDecoder, StringEncoder};
pub use tick::{TickDecoder, TickEncoder, TickSetDecoder, TickSetEncoder};

/// Outcome of one resumable step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    /// The value is complete.
    Done(T),
    /// Not enough bytes or room; call again later.
    Suspended,
}

impl<T> Progress<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Progress::Done(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Progress<U> {
        match self {
            Progress::Done(v) => Progress::Done(f(v)),
            Progress::Suspended => Progress::Suspended,
        }
    }

    pub fn done(self) -> Option<T> {
        match self {
            Progress::Done(v) => Some(v),
            Progress::Suspended => None,
        }
    }
}

/// Unwrap a `Result<Progress<T>, E>`, returning `Ok(Progress::Suspended)`
/// from the enclosing function when the inner step suspended.
#[macro_export]
macro_rules! ready {
    ($e:expr) => {
        match $e? {
            $crate::codec::Progress::Done(v) => v,
            $crate::codec::Progress::Suspended => {
                return Ok($crate::codec::Progress::Suspended)
            }
        }
    };
}

/// Unwrap an `Option` from a `try_*` cursor read, suspending on `None`.
#[macro_export]
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok($crate::codec::Progress::Suspended),
        }
    };
}
