//! Wire-protocol error types. These are fatal to the session; statement
//! failures are reported in-band as ErrorResponse packets instead.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("packet truncated while reading {0}")]
    Truncated(&'static str),

    #[error("invalid packet length {0}")]
    InvalidLength(u32),

    #[error("invalid UTF-8 in packet string")]
    InvalidUtf8,
}
