// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Listening-socket bring-up.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::rc::Rc;

use log::info;
use nix::sys::socket::{accept, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

use crate::error::Error;
use crate::reactor::{HandlerOutcome, Reactor};
use crate::registry::Registry;
use crate::session::Session;

const BACKLOG: i32 = 16;

/// Binds `path`, unlinking a stale socket file first — but only if `path`
/// already exists *and* is actually a socket.
pub fn bind_at(path: &Path) -> Result<OwnedFd, Error> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
        }
        Ok(_) => return Err(Error::NotASocket(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    bind(sock.as_raw_fd(), &addr)?;
    listen(&sock, Backlog::new(BACKLOG)?)?;
    info!("listening on {}", path.display());
    Ok(sock)
}

/// Registers the listening socket's read interest with `reactor`. Each
/// readiness wakes one `accept`, wrapping the new connection in a
/// [`Session`] and handing it to `crate::session::register`.
pub fn register(reactor: &mut Reactor, listener: OwnedFd, registry: Rc<RefCell<Registry>>) {
    let fd = listener.as_raw_fd();
    reactor.register(fd, true, false, move |_fd, _readiness, reactor| {
        let _keep_alive = &listener;
        loop {
            match accept(listener.as_raw_fd()) {
                Ok(client_fd) => {
                    // SAFETY: `accept` returns a fresh, uniquely-owned fd.
                    let client = unsafe { OwnedFd::from_raw_fd(client_fd) };
                    let session = Rc::new(RefCell::new(Session::new(client)));
                    crate::session::register(reactor, session, registry.clone());
                }
                Err(nix::Error::EAGAIN) => return Ok(HandlerOutcome::Continue),
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(e as i32),
            }
        }
    });
}
