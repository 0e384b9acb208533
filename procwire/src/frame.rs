// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::RawFd;

use nix::sys::socket::{self, MsgFlags};

use crate::Error;

/// Maximum size of a single framed message, including the `id`/`cmd` header.
pub const MAX_FRAME: usize = 64 * 1024;

/// A framed protocol message: `u32 id` + `u16 cmd` + payload.
///
/// The same cursor-based buffer is used both to build an outgoing message
/// (writes append at `offset`, which doubles as the valid length) and to
/// read an incoming one (`len` is set by the transport receive, `offset`
/// tracks how much of it has been consumed).
pub struct MsgBuf {
    buf: Box<[u8; MAX_FRAME]>,
    len: usize,
    offset: usize,
    pub id: u32,
    pub cmd: u16,
}

impl Default for MsgBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgBuf {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; MAX_FRAME]),
            len: 0,
            offset: 0,
            id: 0,
            cmd: 0,
        }
    }

    /// Reset the buffer and write the `id`/`cmd` header for an outgoing message.
    pub fn start(&mut self, id: u32, cmd: u16) -> Result<(), Error> {
        self.len = 0;
        self.offset = 0;
        self.id = id;
        self.cmd = cmd;

        self.write_u32(id)?;
        self.write_u16(cmd)?;

        Ok(())
    }

    /// Start a reply reusing `req`'s message id (invariant 5 of the protocol).
    pub fn reply_to(&mut self, req: &MsgBuf, cmd: u16) -> Result<(), Error> {
        self.start(req.id, cmd)
    }

    /// Reset for receiving: no valid data yet.
    pub fn reset_for_recv(&mut self) {
        self.len = 0;
        self.offset = 0;
        self.id = 0;
        self.cmd = 0;
    }

    /// Parse the `id`/`cmd` header off the front of a received message.
    pub fn parse_header(&mut self) -> Result<(), Error> {
        self.id = self.read_u32()?;
        self.cmd = self.read_u16()?;
        Ok(())
    }

    /// Bytes remaining to be consumed by reads.
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let end = self.offset + bytes.len();
        if end > self.buf.len() {
            return Err(Error::BufferOverflow);
        }

        self.buf[self.offset..end].copy_from_slice(bytes);
        self.offset = end;
        self.len = self.offset;

        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<&[u8], Error> {
        let end = self.offset + n;
        if end > self.len {
            return Err(Error::BufferUnderflow);
        }

        let slice = &self.buf[self.offset..end];
        self.offset = end;

        Ok(slice)
    }

    pub fn write_u16(&mut self, val: u16) -> Result<(), Error> {
        self.write(&val.to_be_bytes())
    }

    pub fn write_u32(&mut self, val: u32) -> Result<(), Error> {
        self.write(&val.to_be_bytes())
    }

    pub fn write_i32(&mut self, val: i32) -> Result<(), Error> {
        self.write(&val.to_be_bytes())
    }

    /// `u16`-length-prefixed byte buffer.
    pub fn write_buf(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let len: u16 = bytes
            .len()
            .try_into()
            .map_err(|_| Error::BufferOverflow)?;

        self.write_u16(len)?;
        self.write(bytes)
    }

    /// `u16`-length-prefixed string (no trailing NUL on the wire).
    pub fn write_str(&mut self, s: &str) -> Result<(), Error> {
        self.write_buf(s.as_bytes())
    }

    /// `u16`-count-prefixed array of strings.
    pub fn write_str_array(&mut self, items: &[impl AsRef<str>]) -> Result<(), Error> {
        let count: u16 = items
            .len()
            .try_into()
            .map_err(|_| Error::BufferOverflow)?;

        self.write_u16(count)?;
        for item in items {
            self.write_str(item.as_ref())?;
        }

        Ok(())
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let bytes = self.read(2)?;
        Ok(u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.read(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        let bytes = self.read(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_buf(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u16()? as usize;
        Ok(self.read(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> Result<String, Error> {
        let bytes = self.read_buf()?;
        String::from_utf8(bytes).map_err(|_| Error::BufferUnderflow)
    }

    pub fn read_str_array(&mut self) -> Result<Vec<String>, Error> {
        let count = self.read_u16()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.read_str()?);
        }
        Ok(out)
    }
}

/// Send one full message in a single `send()`. A short write is reported as
/// [`Error::TruncatedSend`]; the codec never retries or reassembles.
pub fn send_seqpacket(sock: RawFd, msg: &MsgBuf) -> Result<(), Error> {
    let sent = socket::send(sock, &msg.buf[..msg.offset], MsgFlags::empty())?;

    if sent < msg.offset {
        return Err(Error::TruncatedSend);
    }

    Ok(())
}

/// Receive one message. A zero-length receive means the peer closed; a
/// receive that was truncated (more data than our buffer, per `MSG_TRUNC`)
/// is reported as [`Error::FrameTooLarge`].
pub fn recv_seqpacket(sock: RawFd, msg: &mut MsgBuf) -> Result<(), Error> {
    msg.reset_for_recv();

    let received = socket::recv(sock, msg.buf.as_mut_slice(), MsgFlags::MSG_TRUNC)?;

    if received == 0 {
        return Err(Error::PeerClosed);
    }

    if received > msg.buf.len() {
        return Err(Error::FrameTooLarge);
    }

    msg.len = received;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut msg = MsgBuf::new();
        msg.start(7, 0x0201).unwrap();
        msg.write_u16(42).unwrap();
        msg.write_u32(0xdead_beef).unwrap();
        msg.write_i32(-5).unwrap();
        msg.write_buf(b"hello").unwrap();
        msg.write_str("world").unwrap();
        msg.write_str_array(&["a", "bb", "ccc"]).unwrap();

        // Simulate going over the wire: same buffer, reset the read cursor only
        // (`len` already tracks the total bytes written).
        msg.offset = 0;
        msg.parse_header().unwrap();

        assert_eq!(msg.id, 7);
        assert_eq!(msg.cmd, 0x0201);
        assert_eq!(msg.read_u16().unwrap(), 42);
        assert_eq!(msg.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(msg.read_i32().unwrap(), -5);
        assert_eq!(msg.read_buf().unwrap(), b"hello");
        assert_eq!(msg.read_str().unwrap(), "world");
        assert_eq!(
            msg.read_str_array().unwrap(),
            vec!["a".to_string(), "bb".to_string(), "ccc".to_string()]
        );
    }

    #[test]
    fn underflow_on_short_read() {
        let mut msg = MsgBuf::new();
        msg.start(1, 0x0001).unwrap();
        msg.offset = 0;
        msg.parse_header().unwrap();

        assert!(matches!(msg.read_u16(), Err(Error::BufferUnderflow)));
    }

    #[test]
    fn overflow_on_oversized_write() {
        let mut msg = MsgBuf::new();
        msg.start(1, 0x0001).unwrap();

        let huge = vec![0u8; MAX_FRAME];
        assert!(matches!(msg.write_buf(&huge), Err(Error::BufferOverflow)));
    }
}
