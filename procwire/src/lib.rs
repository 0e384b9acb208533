// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod cmd;
mod error;
mod frame;
pub mod message;
pub mod protoerr;

pub use error::Error;
pub use frame::{recv_seqpacket, send_seqpacket, MsgBuf, MAX_FRAME};
pub use message::{Channel, ProcessStatus, ProcessSummary, StartArgs};
pub use protoerr::ProtoError;

/// A connected `AF_UNIX SOCK_SEQPACKET` pair, for tests that want a real
/// transport without a listening socket on disk. Preserves message
/// boundaries the way the production transport does.
pub mod testpipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::OwnedFd;

    pub fn pair() -> std::io::Result<(OwnedFd, OwnedFd)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )?;
        Ok((a, b))
    }
}
