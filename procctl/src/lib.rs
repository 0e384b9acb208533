// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client-side session: send-then-pump per command over a framed socket.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use log::warn;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use procwire::{cmd, Channel, MsgBuf, ProcessStatus, ProcessSummary, StartArgs};

#[derive(Debug)]
pub enum Error {
    Wire(procwire::Error),
    /// A reply arrived whose `id` was neither `0` (event) nor the id of
    /// the in-flight request.
    ProtocolMismatch,
    /// Daemon reported a protocol-level error for the in-flight request.
    Proto(i32, String),
    /// Daemon sent `ABORT`; the connection is no longer usable.
    Aborted(i32, String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "{e}"),
            Self::ProtocolMismatch => write!(f, "protocol mismatch: unexpected reply id"),
            Self::Proto(code, msg) => write!(f, "error {code}: {msg}"),
            Self::Aborted(code, msg) => write!(f, "connection aborted ({code}): {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<procwire::Error> for Error {
    fn from(e: procwire::Error) -> Self {
        Self::Wire(e)
    }
}

/// User callbacks invoked by [`Connection::poll`]/`poll_until_reply` while
/// dispatching unsolicited (`id == 0`) events.
#[derive(Default)]
pub struct Callbacks {
    pub on_stdout: Option<Box<dyn FnMut(&[u8])>>,
    pub on_stderr: Option<Box<dyn FnMut(&[u8])>>,
    pub on_exit: Option<Box<dyn FnMut(u16)>>,
    pub on_kill: Option<Box<dyn FnMut(u16)>>,
}

/// Mirrors the daemon-side `Session`: socket, request-id counter, cached
/// last reply, cached attached process id/status.
pub struct Connection {
    socket: OwnedFd,
    next_id: u32,
    pub attached: Option<String>,
    pub last_status: Option<ProcessStatus>,
    pub callbacks: Callbacks,
}

impl Connection {
    /// Connects to the daemon's listening socket. Must match the daemon's
    /// socket type (`SOCK_SEQPACKET`) — `std::os::unix::net::UnixStream` is
    /// always `SOCK_STREAM` and `AF_UNIX` `connect()` requires the two ends
    /// to agree on type.
    pub fn connect(path: &Path) -> std::io::Result<Self> {
        let socket = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path)?;
        connect(socket.as_raw_fd(), &addr)?;
        Ok(Self {
            socket,
            next_id: 1,
            attached: None,
            last_status: None,
            callbacks: Callbacks::default(),
        })
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(&self, msg: &MsgBuf) -> Result<(), Error> {
        procwire::send_seqpacket(self.socket.as_raw_fd(), msg).map_err(Error::from)
    }

    pub fn hello(&mut self, version: u16) -> Result<(), Error> {
        let id = self.fresh_id();
        let mut out = MsgBuf::new();
        out.start(id, cmd::HELLO)?;
        out.write_u16(version)?;
        self.send(&out)?;
        self.poll_until_reply(id)?;
        Ok(())
    }

    pub fn start(&mut self, args: &StartArgs) -> Result<ProcessSummary, Error> {
        let id = self.fresh_id();
        let mut out = MsgBuf::new();
        out.start(id, cmd::START)?;
        args.write(&mut out)?;
        self.send(&out)?;
        let reply = self.poll_until_reply(id)?;
        self.take_attached_reply(reply)
    }

    pub fn attach(&mut self, process_id: &str) -> Result<ProcessSummary, Error> {
        let id = self.fresh_id();
        let mut out = MsgBuf::new();
        out.start(id, cmd::ATTACH)?;
        out.write_str(process_id)?;
        self.send(&out)?;
        let reply = self.poll_until_reply(id)?;
        self.take_attached_reply(reply)
    }

    pub fn list(&mut self) -> Result<Vec<ProcessSummary>, Error> {
        let id = self.fresh_id();
        let mut out = MsgBuf::new();
        out.start(id, cmd::LIST)?;
        self.send(&out)?;
        let mut reply = self.poll_until_reply(id)?;
        if reply.cmd != cmd::LIST_REPLY {
            return Ok(Vec::new());
        }
        let count = reply.read_u16()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(ProcessSummary::read(&mut reply)?);
        }
        Ok(out)
    }

    pub fn kill(&mut self, signal: u16) -> Result<(), Error> {
        let id = self.fresh_id();
        let mut out = MsgBuf::new();
        out.start(id, cmd::KILL)?;
        out.write_u16(signal)?;
        self.send(&out)?;
        self.poll_until_reply(id)?;
        Ok(())
    }

    pub fn stdin_data(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let id = self.fresh_id();
        let mut out = MsgBuf::new();
        out.start(id, cmd::DATA)?;
        out.write_u16(Channel::Stdin.to_wire())?;
        out.write_buf(bytes)?;
        self.send(&out)?;
        self.poll_until_reply(id)?;
        Ok(())
    }

    pub fn stdin_eof(&mut self) -> Result<(), Error> {
        self.stdin_data(&[])
    }

    fn take_attached_reply(&mut self, mut reply: MsgBuf) -> Result<ProcessSummary, Error> {
        let summary = ProcessSummary::read(&mut reply)?;
        self.attached = Some(summary.process_id.clone());
        self.last_status = Some(summary.status);
        Ok(summary)
    }

    /// Drains messages one at a time: an `id == 0` message is an
    /// unsolicited event dispatched to the callback table; the reply
    /// matching `request_id` is returned; any other id is a fatal
    /// [`Error::ProtocolMismatch`].
    fn poll_until_reply(&mut self, request_id: u32) -> Result<MsgBuf, Error> {
        loop {
            let mut msg = MsgBuf::new();
            procwire::recv_seqpacket(self.socket.as_raw_fd(), &mut msg)?;
            msg.parse_header()?;

            if msg.id == 0 {
                self.dispatch_event(&mut msg)?;
                continue;
            }

            if msg.id != request_id {
                return Err(Error::ProtocolMismatch);
            }

            return self.resolve_reply(msg);
        }
    }

    fn resolve_reply(&mut self, mut msg: MsgBuf) -> Result<MsgBuf, Error> {
        match msg.cmd {
            cmd::ERROR => {
                let code = msg.read_i32()?;
                let text = msg.read_str()?;
                Err(Error::Proto(code, text))
            }
            cmd::ABORT => {
                let code = msg.read_i32()?;
                let text = msg.read_str()?;
                Err(Error::Aborted(code, text))
            }
            _ => Ok(msg),
        }
    }

    fn dispatch_event(&mut self, msg: &mut MsgBuf) -> Result<(), Error> {
        match msg.cmd {
            cmd::DATA => {
                let channel = msg.read_u16()?;
                let payload = msg.read_buf()?;
                match Channel::from_wire(channel) {
                    Some(Channel::Stdout) => {
                        if let Some(cb) = &mut self.callbacks.on_stdout {
                            cb(&payload);
                        }
                    }
                    Some(Channel::Stderr) => {
                        if let Some(cb) = &mut self.callbacks.on_stderr {
                            cb(&payload);
                        }
                    }
                    _ => warn!("DATA event on unexpected channel {channel}"),
                }
            }
            cmd::STATUS => {
                let status = msg.read_u16()?;
                let code = msg.read_u16()?;
                let status = ProcessStatus::from_wire(status, code)
                    .ok_or(procwire::Error::BufferUnderflow)?;
                self.last_status = Some(status);
                match status {
                    ProcessStatus::Exit(code) => {
                        if let Some(cb) = &mut self.callbacks.on_exit {
                            cb(code);
                        }
                    }
                    ProcessStatus::Kill(signal) => {
                        if let Some(cb) = &mut self.callbacks.on_kill {
                            cb(signal);
                        }
                    }
                    ProcessStatus::Run => {}
                }
            }
            cmd::ABORT => {
                let code = msg.read_i32()?;
                let text = msg.read_str()?;
                return Err(Error::Aborted(code, text));
            }
            other => warn!("unexpected event command {}", cmd::name(other)),
        }
        Ok(())
    }

    /// Idle event pump for attached mode: drains whatever arrives within
    /// `timeout` without an outstanding request. A reply-shaped message
    /// here (any `id != 0`) indicates a bug.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.socket.as_raw_fd()) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let poll_timeout = match timeout {
            Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
            None => PollTimeout::NONE,
        };
        match poll(&mut fds, poll_timeout) {
            Ok(0) | Err(nix::Error::EINTR) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(Error::Wire(procwire::Error::Io(e.into()))),
        }

        let mut msg = MsgBuf::new();
        procwire::recv_seqpacket(self.socket.as_raw_fd(), &mut msg)?;
        msg.parse_header()?;
        if msg.id != 0 {
            return Err(Error::ProtocolMismatch);
        }
        self.dispatch_event(&mut msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn connection_over(socket: OwnedFd) -> Connection {
        Connection {
            socket,
            next_id: 1,
            attached: None,
            last_status: None,
            callbacks: Callbacks::default(),
        }
    }

    #[test]
    fn poll_until_reply_dispatches_event_then_returns_reply() {
        let (a, b) = procwire::testpipe::pair().unwrap();
        let mut conn = connection_over(b);

        let received = Rc::new(RefCell::new(Vec::new()));
        let received_clone = received.clone();
        conn.callbacks.on_stdout = Some(Box::new(move |bytes: &[u8]| {
            received_clone.borrow_mut().extend_from_slice(bytes);
        }));

        let mut event = MsgBuf::new();
        event.start(0, cmd::DATA).unwrap();
        event.write_u16(Channel::Stdout.to_wire()).unwrap();
        event.write_buf(b"hi").unwrap();
        procwire::send_seqpacket(a.as_raw_fd(), &event).unwrap();

        let mut reply = MsgBuf::new();
        reply.start(1, cmd::OK).unwrap();
        procwire::send_seqpacket(a.as_raw_fd(), &reply).unwrap();

        conn.hello(1).unwrap();

        assert_eq!(*received.borrow(), b"hi");
    }

    #[test]
    fn error_reply_is_mapped_to_proto_error() {
        let (a, b) = procwire::testpipe::pair().unwrap();
        let mut conn = connection_over(b);

        let mut reply = MsgBuf::new();
        reply.start(1, cmd::ERROR).unwrap();
        reply.write_i32(libc::ENOENT).unwrap();
        reply.write_str("no such process").unwrap();
        procwire::send_seqpacket(a.as_raw_fd(), &reply).unwrap();

        let err = conn.hello(1).unwrap_err();
        assert!(matches!(err, Error::Proto(code, _) if code == libc::ENOENT));
    }

    #[test]
    fn unexpected_reply_id_is_protocol_mismatch() {
        let (a, b) = procwire::testpipe::pair().unwrap();
        let mut conn = connection_over(b);

        let mut reply = MsgBuf::new();
        reply.start(99, cmd::OK).unwrap();
        procwire::send_seqpacket(a.as_raw_fd(), &reply).unwrap();

        let err = conn.hello(1).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch));
    }

    #[test]
    fn idle_poll_dispatches_status_event() {
        let (a, b) = procwire::testpipe::pair().unwrap();
        let mut conn = connection_over(b);

        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        conn.callbacks.on_exit = Some(Box::new(move |code| {
            *seen_clone.borrow_mut() = Some(code);
        }));

        let mut status = MsgBuf::new();
        status.start(0, cmd::STATUS).unwrap();
        status.write_u16(2).unwrap(); // STATUS_EXIT
        status.write_u16(7).unwrap();
        procwire::send_seqpacket(a.as_raw_fd(), &status).unwrap();

        conn.poll(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(conn.last_status, Some(ProcessStatus::Exit(7)));
        assert_eq!(*seen.borrow(), Some(7));
    }
}
