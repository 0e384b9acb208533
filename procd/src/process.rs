// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Owned child processes. Each [`Process`] owns a `fork`+`exec`'d child's
//! stdin write end and stdout/stderr read ends, and fans `DATA`/`STATUS`
//! events out to whichever sessions are attached.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use log::warn;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::wait::WaitStatus;
use nix::unistd::{self, ForkResult, Pid};
use procwire::{Channel, ProcessStatus, StartArgs};

use crate::reactor::{HandlerOutcome, Reactor, SlotId};
use crate::session::Session;

const READ_CHUNK: usize = 4096;

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A process this daemon forked, identified on the wire as `"<path>:<pid>"`.
pub struct Process {
    pub process_id: String,
    path: String,
    pid: Pid,
    stdin: Option<OwnedFd>,
    stdout_slot: Option<SlotId>,
    stderr_slot: Option<SlotId>,
    status: ProcessStatus,
    consumers: Vec<Weak<RefCell<Session>>>,
}

impl Process {
    /// Forks, execs `args.path` with `args.argv`/`args.envp`, and registers
    /// its stdout/stderr readers with `reactor`. `on_data` is invoked with
    /// `(process_id, channel, bytes)` for every chunk read; `on_eof` with
    /// `(process_id, channel)` once a channel's read end hits EOF.
    pub fn spawn(
        args: &StartArgs,
        reactor: &mut Reactor,
    ) -> Result<Rc<RefCell<Process>>, nix::Error> {
        let (stdin_read, stdin_write) = unistd::pipe()?;
        let (stdout_read, stdout_write) = unistd::pipe()?;
        let (stderr_read, stderr_write) = unistd::pipe()?;

        // SAFETY: the child only calls async-signal-safe functions
        // (dup2/close/execve) before replacing its image.
        match unsafe { unistd::fork() }? {
            ForkResult::Child => {
                let _ = unistd::dup2(stdin_read.as_raw_fd(), 0);
                let _ = unistd::dup2(stdout_write.as_raw_fd(), 1);
                let _ = unistd::dup2(stderr_write.as_raw_fd(), 2);
                drop(stdin_read);
                drop(stdin_write);
                drop(stdout_read);
                drop(stdout_write);
                drop(stderr_read);
                drop(stderr_write);

                let path = match CString::new(args.path.clone()) {
                    Ok(p) => p,
                    Err(_) => std::process::exit(127),
                };
                let argv: Vec<CString> = std::iter::once(path.clone())
                    .chain(args.argv.iter().map(|a| {
                        CString::new(a.as_str()).unwrap_or_else(|_| CString::new("").unwrap())
                    }))
                    .collect();
                let envp: Vec<CString> = args
                    .envp
                    .iter()
                    .map(|e| CString::new(e.as_str()).unwrap_or_else(|_| CString::new("").unwrap()))
                    .collect();

                let _ = unistd::execve(&path, &argv, &envp);
                // execve only returns on failure.
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                drop(stdin_read);
                drop(stdout_write);
                drop(stderr_write);

                set_nonblocking(stdout_read.as_raw_fd())?;
                set_nonblocking(stderr_read.as_raw_fd())?;

                let process_id = format!("{}:{}", args.path, child.as_raw());
                let process = Rc::new(RefCell::new(Process {
                    process_id,
                    path: args.path.clone(),
                    pid: child,
                    stdin: Some(stdin_write),
                    stdout_slot: None,
                    stderr_slot: None,
                    status: ProcessStatus::Run,
                    consumers: Vec::new(),
                }));

                let weak = Rc::downgrade(&process);
                let stdout_slot =
                    register_reader(reactor, stdout_read, Channel::Stdout, weak.clone());
                let stderr_slot = register_reader(reactor, stderr_read, Channel::Stderr, weak);
                process.borrow_mut().stdout_slot = Some(stdout_slot);
                process.borrow_mut().stderr_slot = Some(stderr_slot);

                Ok(process)
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn attach(&mut self, session: Weak<RefCell<Session>>) {
        self.consumers.push(session);
    }

    pub fn detach(&mut self, session: &Rc<RefCell<Session>>) {
        self.consumers
            .retain(|w| !w.upgrade().is_some_or(|s| Rc::ptr_eq(&s, session)));
    }

    pub fn consumers(&self) -> impl Iterator<Item = Rc<RefCell<Session>>> + '_ {
        self.consumers.iter().filter_map(|w| w.upgrade())
    }

    /// Writes to the child's stdin. `DATA` on a process with a closed stdin
    /// (already-terminated child) is silently dropped, not an error — the
    /// child reaped the pipe on exit.
    pub fn write_stdin(&mut self, bytes: &[u8]) -> nix::Result<()> {
        let Some(fd) = &self.stdin else {
            return Ok(());
        };
        let mut written = 0;
        while written < bytes.len() {
            match nix::unistd::write(fd, &bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Closes the child's stdin, signaling EOF to the child.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn kill(&mut self, signal: nix::sys::signal::Signal) -> nix::Result<()> {
        nix::sys::signal::kill(self.pid, signal)
    }

    /// Called from the `SIGCHLD` drain once `waitpid` reaps this pid.
    /// Transitions `RUN -> EXIT|KILL` and tears down the reader descriptors.
    /// Terminal status is sticky — no further `DATA` follows.
    pub fn reap(&mut self, wait_status: WaitStatus, reactor: &mut Reactor) {
        self.status = match wait_status {
            WaitStatus::Exited(_, code) => ProcessStatus::Exit(code as u16),
            WaitStatus::Signaled(_, sig, _) => ProcessStatus::Kill(sig as u16),
            _ => return,
        };
        self.stdin = None;
        if let Some(slot) = self.stdout_slot.take() {
            reactor.remove(slot);
        }
        if let Some(slot) = self.stderr_slot.take() {
            reactor.remove(slot);
        }
    }
}

/// Registers `fd`'s read end with `reactor`. The returned closure owns
/// `fd` for as long as the slot is active, so deregistering the slot
/// (dropping the closure) closes the descriptor — there is no separate
/// close path.
fn register_reader(
    reactor: &mut Reactor,
    fd: OwnedFd,
    channel: Channel,
    process: Weak<RefCell<Process>>,
) -> SlotId {
    let raw = fd.as_raw_fd();
    reactor.register(raw, true, false, move |_raw_fd, _readiness, _reactor| {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match nix::unistd::read(&fd, &mut buf) {
                Ok(n) => n,
                Err(nix::Error::EAGAIN) => return Ok(HandlerOutcome::Continue),
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    warn!("read on {channel:?} failed: {e}");
                    return Ok(HandlerOutcome::Continue);
                }
            };

            let Some(process) = process.upgrade() else {
                return Ok(HandlerOutcome::Deregister);
            };

            if n == 0 {
                let process_id = process.borrow().process_id.clone();
                for session in process.borrow().consumers() {
                    session.borrow_mut().notify_eof(&process_id, channel);
                }
                return Ok(HandlerOutcome::Deregister);
            }

            let chunk = &buf[..n];
            let process_id = process.borrow().process_id.clone();
            for session in process.borrow().consumers() {
                session.borrow_mut().notify_data(&process_id, channel, chunk);
            }

            if n < buf.len() {
                return Ok(HandlerOutcome::Continue);
            }
        }
    })
}
