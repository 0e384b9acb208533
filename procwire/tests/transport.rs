// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::AsRawFd;

use procwire::{cmd, recv_seqpacket, send_seqpacket, testpipe, Channel, MsgBuf};

#[test]
fn send_recv_round_trip() {
    let (a, b) = testpipe::pair().unwrap();

    let mut out = MsgBuf::new();
    out.start(3, cmd::DATA).unwrap();
    out.write_u16(Channel::Stdout.to_wire()).unwrap();
    out.write_buf(b"hello\n").unwrap();

    send_seqpacket(a.as_raw_fd(), &out).unwrap();

    let mut inbound = MsgBuf::new();
    recv_seqpacket(b.as_raw_fd(), &mut inbound).unwrap();
    inbound.parse_header().unwrap();

    assert_eq!(inbound.id, 3);
    assert_eq!(inbound.cmd, cmd::DATA);
    assert_eq!(inbound.read_u16().unwrap(), Channel::Stdout.to_wire());
    assert_eq!(inbound.read_buf().unwrap(), b"hello\n");
}

#[test]
fn peer_close_is_reported() {
    let (a, b) = testpipe::pair().unwrap();
    drop(a);

    let mut inbound = MsgBuf::new();
    let err = recv_seqpacket(b.as_raw_fd(), &mut inbound).unwrap_err();

    assert!(matches!(err, procwire::Error::PeerClosed));
}
