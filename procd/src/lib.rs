// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod daemon;
pub mod error;
pub mod listener;
pub mod process;
pub mod reactor;
pub mod registry;
pub mod session;
pub mod signal;

pub use daemon::Daemon;
pub use error::Error;
