//! Error kinds visible at the engine boundary.
//!
//! One sum type for the whole crate: callers match on the kind, the engine
//! records per-block failures and keeps going unless the kind is fatal.
//! `NotFound` never escapes a public `read_block` — the access layer
//! translates it into a zeroed hole buffer.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed dataset header: {0}")]
    MalformedHeader(String),

    #[error("malformed bitmask: {0}")]
    MalformedBitmask(String),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("unknown time: {0}")]
    UnknownTime(f64),

    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Block absent — a hole. Internal; public reads translate this into a
    /// zero buffer with `was_hole` set.
    #[error("block not found")]
    NotFound,

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("aborted")]
    Aborted,

    #[error("service busy")]
    Busy,

    /// `read_block`/`write_block` called outside its session bracket, or a
    /// session opened twice.
    #[error("access session: {0}")]
    BadSession(&'static str),
}

impl Error {
    /// Transient failures are retried inside the access with bounded
    /// exponential backoff; everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Fatal errors abort the whole box query instead of a single block.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedHeader(_)
                | Error::MalformedBitmask(_)
                | Error::UnknownField(_)
                | Error::UnknownTime(_)
                | Error::OutOfRange(_)
                | Error::BadSession(_)
        )
    }
}
