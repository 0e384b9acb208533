// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Command code taxonomy.
//!
//! `id == 0` marks an unsolicited server->client event; `id > 0` marks a
//! client-originated request and its matching reply.

pub const HELLO: u16 = 0x0001;
pub const START: u16 = 0x0101;
pub const ATTACH: u16 = 0x0102;
pub const ATTACHED: u16 = 0x0110;
pub const DATA: u16 = 0x0201;
pub const STATUS: u16 = 0x0202;
pub const OK: u16 = 0xff00;
pub const ERROR: u16 = 0xfff0;
pub const ABORT: u16 = 0xffff;

/// `LIST` and `KILL` sit in the unused C->S request range next to
/// `START`/`ATTACH`; `LIST`'s reply gets a code next to `ATTACHED`.
pub const LIST: u16 = 0x0103;
pub const KILL: u16 = 0x0104;
pub const LIST_REPLY: u16 = 0x0111;

pub fn name(cmd: u16) -> &'static str {
    match cmd {
        HELLO => "HELLO",
        START => "START",
        ATTACH => "ATTACH",
        ATTACHED => "ATTACHED",
        LIST => "LIST",
        LIST_REPLY => "LIST_REPLY",
        KILL => "KILL",
        DATA => "DATA",
        STATUS => "STATUS",
        OK => "OK",
        ERROR => "ERROR",
        ABORT => "ABORT",
        _ => "UNKNOWN",
    }
}
