// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::io;

/// Errors that can arise while encoding, decoding, or transporting a frame.
#[derive(Debug)]
pub enum Error {
    /// A read ran past the end of the message's valid data.
    BufferUnderflow,

    /// A write ran past the end of the message buffer's capacity.
    BufferOverflow,

    /// `send()` on the transport wrote fewer bytes than the full message.
    TruncatedSend,

    /// A received datagram was larger than [`crate::MAX_FRAME`].
    FrameTooLarge,

    /// The peer closed its end of the connection.
    PeerClosed,

    /// Underlying I/O or socket error.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferUnderflow => write!(f, "buffer underflow"),
            Self::BufferOverflow => write!(f, "buffer overflow"),
            Self::TruncatedSend => write!(f, "truncated send"),
            Self::FrameTooLarge => write!(f, "frame too large"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Io(io::Error::from(e))
    }
}
