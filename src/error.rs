//! Error taxonomy for the multiplexer.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Errors produced by the mux and its streams.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The stream or its mux was closed on this side.
    #[error("the conn has closed")]
    Closed,
    /// The peer closed the stream; buffered data can still be read but
    /// nothing more can be written.
    #[error("io: write on closed conn")]
    WriteClosed,
    /// A read or write deadline elapsed before progress was made.
    #[error("deadline elapsed")]
    Timeout,
    /// No capacity for another stream: the peer refused the open, or the
    /// id space is saturated.
    #[error("stream capacity exhausted")]
    Capacity,
    /// The peer violated the wire protocol. Terminal for the mux.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// The underlying transport failed. Terminal for the mux.
    #[error(transparent)]
    Transport(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;
        match e {
            Error::Transport(io) => io,
            other => {
                let kind = match &other {
                    Error::Closed | Error::WriteClosed => ErrorKind::BrokenPipe,
                    Error::Timeout => ErrorKind::TimedOut,
                    Error::Capacity => ErrorKind::ConnectionRefused,
                    Error::Protocol(_) => ErrorKind::InvalidData,
                    Error::Transport(_) => ErrorKind::Other,
                };
                Self::new(kind, other)
            }
        }
    }
}

/// A specialized `Result` for mux operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
