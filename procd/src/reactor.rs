// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Single-threaded readiness multiplexer: a set of registered descriptors,
//! each with read/write interest and a handler, walked sequentially each
//! cycle via `nix::poll`.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::poll::{self, PollFd, PollFlags, PollTimeout};

/// Opaque handle to a registered descriptor, returned by [`Reactor::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// What a handler wants to happen to its own slot after it runs.
pub enum HandlerOutcome {
    /// Keep the slot registered with its current interest.
    Continue,
    /// Deregister this slot (e.g. EOF on a pipe).
    Deregister,
}

/// `Err(errno)` aborts the current [`Reactor::run`] cycle. A spurious
/// `EAGAIN` readiness should be swallowed by the handler itself and
/// reported as `Ok(HandlerOutcome::Continue)`, not as an error.
pub type HandlerResult = Result<HandlerOutcome, i32>;

type Handler = Box<dyn FnMut(RawFd, Readiness, &mut Reactor) -> HandlerResult>;

struct Slot {
    fd: RawFd,
    read_interest: bool,
    write_interest: bool,
    active: bool,
    handler: Option<Handler>,
}

/// A single-threaded reactor. Handlers are given `&mut Reactor` so they can
/// reentrantly register/deregister *other* descriptors — e.g. tearing down
/// a process's remaining reader descriptors when the last attached session
/// detaches. Self-deregistration goes through the return value instead, so
/// a handler never needs to know its own `SlotId`.
#[derive(Default)]
pub struct Reactor {
    slots: Vec<Slot>,
}

impl Reactor {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn register(
        &mut self,
        fd: impl AsRawFd,
        read_interest: bool,
        write_interest: bool,
        handler: impl FnMut(RawFd, Readiness, &mut Reactor) -> HandlerResult + 'static,
    ) -> SlotId {
        let fd = fd.as_raw_fd();
        self.slots.push(Slot {
            fd,
            read_interest,
            write_interest,
            active: true,
            handler: Some(Box::new(handler)),
        });
        SlotId(self.slots.len() - 1)
    }

    pub fn set_interest(&mut self, id: SlotId, read_interest: bool, write_interest: bool) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.read_interest = read_interest;
            slot.write_interest = write_interest;
        }
    }

    /// Deregister a slot. Safe to call on an already-inactive or unknown
    /// slot (idempotent), and safe to call reentrantly from within another
    /// slot's handler mid-dispatch: the active bit is cleared but the slot
    /// stays in place so the in-progress poll-result walk isn't disturbed.
    pub fn remove(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.active = false;
            slot.handler = None;
        }
    }

    /// Run one readiness cycle. `None` timeout blocks indefinitely.
    ///
    /// Returns `Ok(())` on a clean cycle (including a spurious `EINTR`,
    /// which the caller should follow with a signal-trampoline drain) or
    /// `Err(errno)` if polling itself failed or a handler raised a fatal
    /// error.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<(), i32> {
        let mut poll_fds = Vec::new();
        let mut ids = Vec::new();

        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.active {
                continue;
            }

            let mut flags = PollFlags::empty();
            if slot.read_interest {
                flags.insert(PollFlags::POLLIN);
            }
            if slot.write_interest {
                flags.insert(PollFlags::POLLOUT);
            }
            if flags.is_empty() {
                continue;
            }

            // SAFETY: the fd is owned by the slot's registrant for as long
            // as the slot stays active, which outlives this poll call.
            let borrowed = unsafe { BorrowedFd::borrow_raw(slot.fd) };
            poll_fds.push(PollFd::new(borrowed, flags));
            ids.push(i);
        }

        let poll_timeout = match timeout {
            Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
            None => PollTimeout::NONE,
        };

        let ready = match poll::poll(&mut poll_fds, poll_timeout) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => return Ok(()),
            Err(e) => return Err(e as i32),
        };

        if ready == 0 {
            return Ok(());
        }

        for (pos, pfd) in poll_fds.iter().enumerate() {
            let Some(revents) = pfd.revents() else {
                continue;
            };
            if revents.is_empty() {
                continue;
            }

            let id = ids[pos];
            if !self.slots[id].active {
                // Removed by an earlier handler invocation in this same cycle.
                continue;
            }

            let readiness = Readiness {
                readable: revents
                    .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR),
                writable: revents.contains(PollFlags::POLLOUT),
            };
            if !readiness.readable && !readiness.writable {
                continue;
            }

            let fd = self.slots[id].fd;
            let Some(mut handler) = self.slots[id].handler.take() else {
                continue;
            };

            let result = handler(fd, readiness, self);

            let Some(slot) = self.slots.get_mut(id) else {
                continue;
            };
            match result {
                Ok(HandlerOutcome::Continue) => slot.handler = Some(handler),
                Ok(HandlerOutcome::Deregister) => {
                    slot.active = false;
                    slot.handler = None;
                }
                Err(errno) => {
                    slot.handler = Some(handler);
                    return Err(errno);
                }
            }
        }

        Ok(())
    }

    /// Repeated `run(None)` until `running` is cleared or an error propagates.
    pub fn main_loop(&mut self, running: &std::sync::atomic::AtomicBool) -> Result<(), i32> {
        use std::sync::atomic::Ordering;

        while running.load(Ordering::SeqCst) {
            self.run(None)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::fd::BorrowedFd;
    use std::rc::Rc;

    use nix::unistd;

    #[test]
    fn register_and_run_invokes_handler_on_readability() {
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let mut reactor = Reactor::new();
        let seen = Rc::new(RefCell::new(0u32));
        let seen_clone = seen.clone();

        reactor.register(read_fd.as_raw_fd(), true, false, move |fd, readiness, _reactor| {
            assert!(readiness.readable);
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut buf = [0u8; 8];
            let n = nix::unistd::read(borrowed, &mut buf).unwrap();
            assert_eq!(n, 1);
            *seen_clone.borrow_mut() += 1;
            Ok(HandlerOutcome::Continue)
        });

        unistd::write(&write_fd, b"x").unwrap();
        reactor.run(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn deregistered_slot_is_no_longer_polled() {
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let mut reactor = Reactor::new();
        let calls = Rc::new(RefCell::new(0u32));
        let calls_clone = calls.clone();

        reactor.register(read_fd.as_raw_fd(), true, false, move |fd, _readiness, _reactor| {
            *calls_clone.borrow_mut() += 1;
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut buf = [0u8; 8];
            let _ = nix::unistd::read(borrowed, &mut buf);
            Ok(HandlerOutcome::Deregister)
        });

        unistd::write(&write_fd, b"x").unwrap();
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(*calls.borrow(), 1);

        unistd::write(&write_fd, b"y").unwrap();
        reactor.run(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(*calls.borrow(), 1);
    }
}
