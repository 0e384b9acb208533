// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Daemon-side per-connection state. A `Session` binds a socket to at most
//! one attached [`Process`] and turns command frames into supervisor calls
//! and reply/event frames.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use log::{debug, warn};
use nix::sys::signal::Signal;
use procwire::{cmd, Channel, Error as WireError, MsgBuf, ProcessStatus, ProcessSummary, ProtoError, StartArgs};

use crate::process::Process;
use crate::reactor::{HandlerOutcome, Reactor};
use crate::registry::Registry;

/// One command handler's verdict, modeled as a sum type rather than
/// flattened to a status code until the wire.
pub enum Outcome {
    /// Framework sends a plain `OK`.
    Ok,
    /// A handler already wrote a specific reply (`ATTACHED`, `LIST`) into
    /// `out`.
    Reply,
    /// Non-fatal protocol error, mirrored back as `ERROR{code, msg}`.
    Proto(ProtoError),
    /// A system-level failure (not a bad request) during handling; mirrored
    /// back as `ABORT{code, msg}` and the session is torn down.
    Abort(i32, String),
}

pub struct Session {
    socket: OwnedFd,
    attached: Option<Rc<RefCell<Process>>>,
    version: u16,
}

impl Session {
    pub fn new(socket: OwnedFd) -> Self {
        Self {
            socket,
            attached: None,
            version: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Dispatches one incoming frame, writing a reply into `out` when the
    /// handler doesn't build one of its own, and returns whether the
    /// session should stay registered.
    fn dispatch(
        this: &Rc<RefCell<Session>>,
        registry: &Rc<RefCell<Registry>>,
        reactor: &mut Reactor,
        in_msg: &mut MsgBuf,
    ) -> Result<Outcome, WireError> {
        match in_msg.cmd {
            cmd::HELLO => {
                let version = in_msg.read_u16()?;
                this.borrow_mut().version = version;
                Ok(Outcome::Ok)
            }
            cmd::START => {
                if this.borrow().attached.is_some() {
                    return Ok(Outcome::Proto(ProtoError::Already));
                }
                let args = StartArgs::read(in_msg)?;
                handle_start(this, registry, reactor, &args)
            }
            cmd::ATTACH => {
                if this.borrow().attached.is_some() {
                    return Ok(Outcome::Proto(ProtoError::Already));
                }
                let process_id = in_msg.read_str()?;
                handle_attach(this, registry, &process_id)
            }
            cmd::DATA => {
                let Some(process) = this.borrow().attached.clone() else {
                    return Ok(Outcome::Proto(ProtoError::NotFound));
                };
                let channel = in_msg.read_u16()?;
                let payload = in_msg.read_buf()?;
                if Channel::from_wire(channel) != Some(Channel::Stdin) {
                    return Ok(Outcome::Proto(ProtoError::BadChannel));
                }
                if payload.is_empty() {
                    process.borrow_mut().close_stdin();
                } else if let Err(e) = process.borrow_mut().write_stdin(&payload) {
                    warn!("stdin write failed: {e}");
                }
                Ok(Outcome::Ok)
            }
            cmd::KILL => {
                let Some(process) = this.borrow().attached.clone() else {
                    return Ok(Outcome::Proto(ProtoError::NotFound));
                };
                let signal = in_msg.read_u16()?;
                let Some(signal) = Signal::try_from(signal as i32).ok() else {
                    return Ok(Outcome::Proto(ProtoError::BadSignal));
                };
                if process.borrow().status() != ProcessStatus::Run {
                    return Ok(Outcome::Proto(ProtoError::NotRunning));
                }
                match process.borrow_mut().kill(signal) {
                    Ok(()) => Ok(Outcome::Ok),
                    Err(_) => Ok(Outcome::Proto(ProtoError::NotRunning)),
                }
            }
            cmd::LIST => Ok(Outcome::Reply),
            _ => Ok(Outcome::Proto(ProtoError::NotSupported)),
        }
    }

    /// Forwards a process-side `DATA` event to this session's socket.
    pub fn notify_data(&mut self, process_id: &str, channel: Channel, bytes: &[u8]) {
        let _ = process_id;
        let mut out = MsgBuf::new();
        if out.start(0, cmd::DATA).is_err() {
            return;
        }
        if out.write_u16(channel.to_wire()).is_err() || out.write_buf(bytes).is_err() {
            return;
        }
        self.send_or_abort(&out);
    }

    pub fn notify_eof(&mut self, process_id: &str, channel: Channel) {
        self.notify_data(process_id, channel, &[]);
    }

    pub fn notify_status(&mut self, _process_id: &str, status: ProcessStatus) {
        let mut out = MsgBuf::new();
        let (code, value) = status.to_wire();
        if out.start(0, cmd::STATUS).is_err() {
            return;
        }
        if out.write_u16(code).is_err() || out.write_u16(value).is_err() {
            return;
        }
        self.send_or_abort(&out);
    }

    fn send_or_abort(&mut self, out: &MsgBuf) {
        if let Err(e) = procwire::send_seqpacket(self.socket.as_raw_fd(), out) {
            warn!("session send failed, aborting: {e}");
            let mut abort = MsgBuf::new();
            if abort.start(0, cmd::ABORT).is_ok()
                && abort.write_i32(libc::EIO).is_ok()
                && abort.write_str("send failed").is_ok()
            {
                let _ = procwire::send_seqpacket(self.socket.as_raw_fd(), &abort);
            }
        }
    }

    pub fn detach(&mut self, owner: &Rc<RefCell<Session>>) {
        if let Some(process) = self.attached.take() {
            process.borrow_mut().detach(owner);
        }
    }
}

fn handle_start(
    session: &Rc<RefCell<Session>>,
    registry: &Rc<RefCell<Registry>>,
    reactor: &mut Reactor,
    args: &StartArgs,
) -> Result<Outcome, WireError> {
    if !is_executable(&args.path) {
        return Ok(Outcome::Proto(ProtoError::NoExec));
    }

    let process = match Process::spawn(args, reactor) {
        Ok(p) => p,
        Err(e) => {
            warn!("spawn failed: {e}");
            return Ok(Outcome::Abort(e as i32, format!("spawn failed: {e}")));
        }
    };

    registry.borrow_mut().insert(process.clone());
    attach_process(session, &process);
    debug!("started {}", process.borrow().process_id);
    Ok(Outcome::Reply)
}

fn handle_attach(
    session: &Rc<RefCell<Session>>,
    registry: &Rc<RefCell<Registry>>,
    process_id: &str,
) -> Result<Outcome, WireError> {
    let Some(process) = registry.borrow().find(process_id) else {
        return Ok(Outcome::Proto(ProtoError::NotFound));
    };
    attach_process(session, &process);
    Ok(Outcome::Reply)
}

fn attach_process(session: &Rc<RefCell<Session>>, process: &Rc<RefCell<Process>>) {
    session.borrow_mut().attached = Some(process.clone());
    process.borrow_mut().attach(Rc::downgrade(session));
}

fn is_executable(path: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn build_attached_reply(id: u32, process: &Process) -> Result<MsgBuf, WireError> {
    let mut out = MsgBuf::new();
    out.start(id, cmd::ATTACHED)?;
    let (status, code) = process.status().to_wire();
    out.write_str(&process.process_id)?;
    out.write_u16(status)?;
    out.write_u16(code)?;
    Ok(out)
}

fn build_list_reply(id: u32, registry: &Registry) -> Result<MsgBuf, WireError> {
    let mut out = MsgBuf::new();
    out.start(id, cmd::LIST_REPLY)?;
    let summaries: Vec<ProcessSummary> = registry
        .iter()
        .map(|p| {
            let p = p.borrow();
            ProcessSummary {
                process_id: p.process_id.clone(),
                status: p.status(),
            }
        })
        .collect();
    out.write_u16(summaries.len() as u16)?;
    for s in &summaries {
        s.write(&mut out)?;
    }
    Ok(out)
}

/// Registers `socket`'s read interest with `reactor`. Closing over
/// `session`/`registry` so the handler can reach both supervisor state
/// and reply machinery; matches `Process::register_reader`'s "closure owns
/// the descriptor" shape.
pub fn register(
    reactor: &mut Reactor,
    session: Rc<RefCell<Session>>,
    registry: Rc<RefCell<Registry>>,
) {
    let fd = session.borrow().fd();
    reactor.register(fd, true, false, move |_fd, _readiness, reactor| {
        let mut in_msg = MsgBuf::new();
        match procwire::recv_seqpacket(session.borrow().socket.as_raw_fd(), &mut in_msg) {
            Ok(()) => {}
            Err(WireError::PeerClosed) => {
                session.borrow_mut().detach(&session);
                registry.borrow_mut().drop_empty();
                return Ok(HandlerOutcome::Deregister);
            }
            Err(e) => {
                warn!("recv failed: {e}");
                session.borrow_mut().detach(&session);
                registry.borrow_mut().drop_empty();
                return Ok(HandlerOutcome::Deregister);
            }
        }

        if let Err(e) = in_msg.parse_header() {
            warn!("malformed frame: {e}");
            session.borrow_mut().detach(&session);
            registry.borrow_mut().drop_empty();
            return Ok(HandlerOutcome::Deregister);
        }

        let id = in_msg.id;
        let cmd_code = in_msg.cmd;

        let outcome = match Session::dispatch(&session, &registry, reactor, &mut in_msg) {
            Ok(o) => o,
            Err(e) => {
                warn!("protocol error: {e}");
                Outcome::Proto(ProtoError::NotSupported)
            }
        };

        let mut abort = false;

        let reply = match outcome {
            Outcome::Ok => {
                let mut out = MsgBuf::new();
                out.start(id, cmd::OK).ok().map(|_| out)
            }
            Outcome::Proto(code) => {
                let mut out = MsgBuf::new();
                out.start(id, cmd::ERROR).ok().and_then(|_| {
                    out.write_i32(code.code()).ok()?;
                    out.write_str(code.message()).ok()?;
                    Some(())
                });
                Some(out)
            }
            Outcome::Abort(code, msg) => {
                abort = true;
                let mut out = MsgBuf::new();
                out.start(id, cmd::ABORT).ok().and_then(|_| {
                    out.write_i32(code).ok()?;
                    out.write_str(&msg).ok()?;
                    Some(())
                });
                Some(out)
            }
            Outcome::Reply => match cmd_code {
                cmd::START | cmd::ATTACH => session
                    .borrow()
                    .attached
                    .as_ref()
                    .and_then(|p| build_attached_reply(id, &p.borrow()).ok()),
                cmd::LIST => build_list_reply(id, &registry.borrow()).ok(),
                _ => None,
            },
        };

        if let Some(out) = reply {
            session.borrow_mut().send_or_abort(&out);
        }

        if abort {
            session.borrow_mut().detach(&session);
            registry.borrow_mut().drop_empty();
            return Ok(HandlerOutcome::Deregister);
        }

        registry.borrow_mut().drop_empty();
        Ok(HandlerOutcome::Continue)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};
    use procwire::testpipe;

    fn new_registry() -> Rc<RefCell<Registry>> {
        Rc::new(RefCell::new(Registry::new()))
    }

    fn recv_on(peer: &OwnedFd) -> MsgBuf {
        let mut msg = MsgBuf::new();
        procwire::recv_seqpacket(peer.as_raw_fd(), &mut msg).unwrap();
        msg.parse_header().unwrap();
        msg
    }

    fn send_start(peer: &OwnedFd, id: u32, path: &str) {
        let mut out = MsgBuf::new();
        out.start(id, cmd::START).unwrap();
        StartArgs {
            path: path.to_string(),
            argv: vec![],
            envp: vec![],
        }
        .write(&mut out)
        .unwrap();
        procwire::send_seqpacket(peer.as_raw_fd(), &out).unwrap();
    }

    #[test]
    fn start_replies_attached_and_double_start_is_already() {
        let mut reactor = Reactor::new();
        let registry = new_registry();
        let (session_fd, peer) = testpipe::pair().unwrap();
        let session = Rc::new(RefCell::new(Session::new(session_fd)));
        register(&mut reactor, session.clone(), registry.clone());

        send_start(&peer, 1, "/bin/true");
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        let reply = recv_on(&peer);
        assert_eq!(reply.id, 1);
        assert_eq!(reply.cmd, cmd::ATTACHED);

        send_start(&peer, 2, "/bin/true");
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        let mut reply = recv_on(&peer);
        assert_eq!(reply.id, 2);
        assert_eq!(reply.cmd, cmd::ERROR);
        assert_eq!(reply.read_i32().unwrap(), ProtoError::Already.code());

        let pid = session.borrow().attached.as_ref().unwrap().borrow().pid();
        let _ = waitpid(pid, None);
    }

    #[test]
    fn start_of_non_executable_path_is_noexec() {
        let mut reactor = Reactor::new();
        let registry = new_registry();
        let (session_fd, peer) = testpipe::pair().unwrap();
        let session = Rc::new(RefCell::new(Session::new(session_fd)));
        register(&mut reactor, session, registry);

        send_start(&peer, 1, "/nonexistent/path/to/nothing");
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        let mut reply = recv_on(&peer);
        assert_eq!(reply.cmd, cmd::ERROR);
        assert_eq!(reply.read_i32().unwrap(), ProtoError::NoExec.code());
    }

    #[test]
    fn data_on_non_stdin_channel_is_rejected() {
        let mut reactor = Reactor::new();
        let registry = new_registry();
        let (session_fd, peer) = testpipe::pair().unwrap();
        let session = Rc::new(RefCell::new(Session::new(session_fd)));
        register(&mut reactor, session.clone(), registry);

        send_start(&peer, 1, "/bin/cat");
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        let _ = recv_on(&peer); // ATTACHED

        let mut out = MsgBuf::new();
        out.start(2, cmd::DATA).unwrap();
        out.write_u16(Channel::Stdout.to_wire()).unwrap();
        out.write_buf(b"nope").unwrap();
        procwire::send_seqpacket(peer.as_raw_fd(), &out).unwrap();
        reactor.run(Some(Duration::from_secs(1))).unwrap();

        let mut reply = recv_on(&peer);
        assert_eq!(reply.cmd, cmd::ERROR);
        assert_eq!(reply.read_i32().unwrap(), ProtoError::BadChannel.code());

        let pid = session.borrow().attached.as_ref().unwrap().borrow().pid();
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }

    #[test]
    fn kill_terminates_the_attached_process() {
        let mut reactor = Reactor::new();
        let registry = new_registry();
        let (session_fd, peer) = testpipe::pair().unwrap();
        let session = Rc::new(RefCell::new(Session::new(session_fd)));
        register(&mut reactor, session.clone(), registry);

        send_start(&peer, 1, "/bin/cat");
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        let _ = recv_on(&peer); // ATTACHED

        let pid = session.borrow().attached.as_ref().unwrap().borrow().pid();

        let mut out = MsgBuf::new();
        out.start(2, cmd::KILL).unwrap();
        out.write_u16(Signal::SIGTERM as u16).unwrap();
        procwire::send_seqpacket(peer.as_raw_fd(), &out).unwrap();
        reactor.run(Some(Duration::from_secs(1))).unwrap();

        let reply = recv_on(&peer);
        assert_eq!(reply.cmd, cmd::OK);

        let status = waitpid(pid, None).unwrap();
        assert!(matches!(status, WaitStatus::Signaled(_, Signal::SIGTERM, _)));
    }

    #[test]
    fn kill_with_invalid_signal_number_is_bad_signal_not_bad_channel() {
        let mut reactor = Reactor::new();
        let registry = new_registry();
        let (session_fd, peer) = testpipe::pair().unwrap();
        let session = Rc::new(RefCell::new(Session::new(session_fd)));
        register(&mut reactor, session.clone(), registry);

        send_start(&peer, 1, "/bin/cat");
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        let _ = recv_on(&peer); // ATTACHED

        let mut out = MsgBuf::new();
        out.start(2, cmd::KILL).unwrap();
        out.write_u16(0xffff).unwrap();
        procwire::send_seqpacket(peer.as_raw_fd(), &out).unwrap();
        reactor.run(Some(Duration::from_secs(1))).unwrap();

        let mut reply = recv_on(&peer);
        assert_eq!(reply.cmd, cmd::ERROR);
        assert_eq!(reply.read_i32().unwrap(), ProtoError::BadSignal.code());

        let pid = session.borrow().attached.as_ref().unwrap().borrow().pid();
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
}
