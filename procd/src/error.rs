// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Daemon-wide error type: hand-rolled variants with a manual `Display`
//! impl, not `thiserror`.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Nix(nix::Error),
    Wire(procwire::Error),
    NotASocket(std::path::PathBuf),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Nix(e) => write!(f, "system call failed: {e}"),
            Self::Wire(e) => write!(f, "protocol error: {e}"),
            Self::NotASocket(path) => write!(f, "{} exists and is not a socket", path.display()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Nix(e)
    }
}

impl From<procwire::Error> for Error {
    fn from(e: procwire::Error) -> Self {
        Self::Wire(e)
    }
}
