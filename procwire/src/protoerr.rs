// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Protocol-level error codes: reported back to the client as
//! `ERROR{code, msg}`. Codes are POSIX-style, reusing the nearest matching
//! errno so a client can format them with `strerror`-equivalent tooling
//! without needing a private error table.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    /// `START`/`ATTACH` while already attached to a process.
    Already,
    /// `ATTACH` to an unknown `process_id`.
    NotFound,
    /// `DATA` on a channel other than `STDIN`.
    BadChannel,
    /// No handler registered for the command code.
    NotSupported,
    /// `KILL`/`DATA` against a process whose pid has already been reaped.
    NotRunning,
    /// `START`'s executable path is not executable.
    NoExec,
    /// `KILL`'s signal number doesn't name a valid signal.
    BadSignal,
}

impl ProtoError {
    /// The `i32` code carried on the wire in an `ERROR` reply.
    pub fn code(self) -> i32 {
        match self {
            Self::Already => libc::EALREADY,
            Self::NotFound => libc::ENOENT,
            Self::BadChannel => libc::EINVAL,
            Self::NotSupported => libc::ENOTSUP,
            Self::NotRunning => libc::ESRCH,
            Self::NoExec => libc::ENOEXEC,
            Self::BadSignal => libc::ERANGE,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            c if c == libc::EALREADY => Some(Self::Already),
            c if c == libc::ENOENT => Some(Self::NotFound),
            c if c == libc::EINVAL => Some(Self::BadChannel),
            c if c == libc::ENOTSUP => Some(Self::NotSupported),
            c if c == libc::ESRCH => Some(Self::NotRunning),
            c if c == libc::ENOEXEC => Some(Self::NoExec),
            c if c == libc::ERANGE => Some(Self::BadSignal),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Already => "already attached to a process",
            Self::NotFound => "no such process",
            Self::BadChannel => "bad channel for DATA",
            Self::NotSupported => "command not supported",
            Self::NotRunning => "process is not running",
            Self::NoExec => "path is not executable",
            Self::BadSignal => "invalid signal number",
        }
    }
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}
