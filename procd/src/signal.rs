// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Signal trampoline: the handler itself only bumps an atomic counter;
//! everything else happens synchronously once control returns to the
//! reactor loop. Two fixed signals are trapped — `SIGCHLD` and `SIGINT` —
//! so this stays a pair of module statics rather than a generic registry
//! keyed by `Signal`.

use std::sync::atomic::{AtomicU32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGCHLD_COUNT: AtomicU32 = AtomicU32::new(0);
static SIGINT_COUNT: AtomicU32 = AtomicU32::new(0);
static PENDING: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_sigchld(_: i32) {
    SIGCHLD_COUNT.fetch_add(1, Ordering::Relaxed);
    PENDING.fetch_add(1, Ordering::Relaxed);
}

extern "C" fn on_sigint(_: i32) {
    SIGINT_COUNT.fetch_add(1, Ordering::Relaxed);
    PENDING.fetch_add(1, Ordering::Relaxed);
}

/// Installs the handlers for the lifetime of the process; there's nothing
/// to restore since `procd` never runs without them once started.
pub struct Trampoline {
    _private: (),
}

impl Trampoline {
    pub fn install() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGCHLD, &action)? };

        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGINT, &action)? };

        Ok(Self { _private: () })
    }

    /// True if any trapped signal arrived since the last `drain`. Cheap
    /// enough to call after every `reactor.run()` — including after a
    /// swallowed `EINTR` — to decide whether draining is worth the trip.
    pub fn pending(&self) -> bool {
        PENDING.load(Ordering::Acquire) > 0
    }

    /// Invokes `on_child` once per pending `SIGCHLD` and `on_int` once per
    /// pending `SIGINT`, in arrival order between the two, oldest first.
    /// Mirrors `signal_run()`: drains to zero before returning so a signal
    /// that arrives mid-drain is picked up on the *next* call rather than
    /// lost.
    pub fn drain(
        &self,
        mut on_child: impl FnMut() -> Result<(), i32>,
        mut on_int: impl FnMut() -> Result<(), i32>,
    ) -> Result<(), i32> {
        while PENDING.load(Ordering::Acquire) > 0 {
            if SIGCHLD_COUNT.load(Ordering::Acquire) > 0 {
                SIGCHLD_COUNT.fetch_sub(1, Ordering::AcqRel);
                PENDING.fetch_sub(1, Ordering::AcqRel);
                on_child()?;
                continue;
            }
            if SIGINT_COUNT.load(Ordering::Acquire) > 0 {
                SIGINT_COUNT.fetch_sub(1, Ordering::AcqRel);
                PENDING.fetch_sub(1, Ordering::AcqRel);
                on_int()?;
            }
        }
        Ok(())
    }
}
