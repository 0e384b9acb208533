// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::{Error, MsgBuf};

/// A `DATA` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl Channel {
    pub fn from_wire(val: u16) -> Option<Self> {
        match val {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }
}

/// Wire encoding of a process's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Run,
    Exit(u16),
    Kill(u16),
}

const STATUS_RUN: u16 = 1;
const STATUS_EXIT: u16 = 2;
const STATUS_KILL: u16 = 3;

impl ProcessStatus {
    pub fn from_wire(status: u16, code: u16) -> Option<Self> {
        match status {
            STATUS_RUN => Some(Self::Run),
            STATUS_EXIT => Some(Self::Exit(code)),
            STATUS_KILL => Some(Self::Kill(code)),
            _ => None,
        }
    }

    pub fn to_wire(self) -> (u16, u16) {
        match self {
            Self::Run => (STATUS_RUN, 0),
            Self::Exit(code) => (STATUS_EXIT, code),
            Self::Kill(signal) => (STATUS_KILL, signal),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Run)
    }
}

/// `ATTACHED`/`LIST_REPLY` entry payload: `{id, status, code}`.
#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub process_id: String,
    pub status: ProcessStatus,
}

impl ProcessSummary {
    pub fn write(&self, msg: &mut MsgBuf) -> Result<(), Error> {
        msg.write_str(&self.process_id)?;
        let (status, code) = self.status.to_wire();
        msg.write_u16(status)?;
        msg.write_u16(code)?;
        Ok(())
    }

    pub fn read(msg: &mut MsgBuf) -> Result<Self, Error> {
        let process_id = msg.read_str()?;
        let status = msg.read_u16()?;
        let code = msg.read_u16()?;
        let status = ProcessStatus::from_wire(status, code).ok_or(Error::BufferUnderflow)?;
        Ok(Self { process_id, status })
    }
}

/// `START` request payload: `{path, argv[], envp[]}`.
#[derive(Debug, Clone)]
pub struct StartArgs {
    pub path: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

impl StartArgs {
    pub fn write(&self, msg: &mut MsgBuf) -> Result<(), Error> {
        msg.write_str(&self.path)?;
        msg.write_str_array(&self.argv)?;
        msg.write_str_array(&self.envp)?;
        Ok(())
    }

    pub fn read(msg: &mut MsgBuf) -> Result<Self, Error> {
        let path = msg.read_str()?;
        let argv = msg.read_str_array()?;
        let envp = msg.read_str_array()?;
        Ok(Self { path, argv, envp })
    }
}
