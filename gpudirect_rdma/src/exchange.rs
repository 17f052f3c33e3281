/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Out-of-band exchange of connection metadata.
//!
//! Before the queue pairs can handshake, each side serializes its local
//! identifiers into a fixed 41-byte record and swaps it with the peer over
//! an external channel (a side-channel socket, a coordination service,
//! anything that moves bytes). This module knows nothing about fabric
//! internals beyond the record's fields and never inspects payload
//! semantics.
//!
//! Both sides send before either receives. On a synchronous channel the
//! reverse order deadlocks, so [`exchange`] always writes the local record
//! first.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::ExchangeError;
use crate::ibverbs_primitives::Gid;

/// Size of a serialized [`ConnectionRecord`]:
/// qp_num(4) + lid(2) + gid(16) + psn(3) + remote_key(4) + remote_addr(8)
/// + remote_len(4) = 41 bytes.
pub const CONNECTION_RECORD_SIZE: usize = 41;

/// The metadata one side advertises to its peer, immutable once sent.
///
/// Each side holds exactly one local and one remote instance: the local
/// record describes this side's queue pair and exposed memory region, the
/// peer's record supplies the connect parameters and the write target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Queue pair number on the advertising side.
    pub qp_num: u32,
    /// Local identifier of the advertising port (subnet-local routing).
    pub lid: u16,
    /// Global identifier of the advertising port; all-zero when the peer
    /// is reachable by LID alone.
    pub gid: Gid,
    /// Initial packet sequence number (24 bits on the wire).
    pub psn: u32,
    /// Remote key of the region the advertiser exposes for RDMA.
    pub remote_key: u32,
    /// Start address of the exposed region.
    pub remote_addr: u64,
    /// Length in bytes of the exposed region; writes beyond this bound
    /// are rejected locally before reaching the adapter.
    pub remote_len: u32,
}

impl ConnectionRecord {
    /// Serializes the record into its fixed wire layout, network byte
    /// order.
    pub fn to_wire(&self) -> [u8; CONNECTION_RECORD_SIZE] {
        let mut buf = [0u8; CONNECTION_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.qp_num.to_be_bytes());
        buf[4..6].copy_from_slice(&self.lid.to_be_bytes());
        buf[6..22].copy_from_slice(&self.gid.raw());
        // 24-bit PSN, high byte dropped.
        let psn = self.psn & 0xffffff;
        buf[22..25].copy_from_slice(&psn.to_be_bytes()[1..4]);
        buf[25..29].copy_from_slice(&self.remote_key.to_be_bytes());
        buf[29..37].copy_from_slice(&self.remote_addr.to_be_bytes());
        buf[37..41].copy_from_slice(&self.remote_len.to_be_bytes());
        buf
    }

    /// Deserializes a record from wire bytes.
    ///
    /// Fails with [`ExchangeError::Truncated`] when fewer than
    /// [`CONNECTION_RECORD_SIZE`] bytes are supplied.
    pub fn from_wire(buf: &[u8]) -> Result<Self, ExchangeError> {
        if buf.len() < CONNECTION_RECORD_SIZE {
            return Err(ExchangeError::Truncated {
                got: buf.len(),
                expected: CONNECTION_RECORD_SIZE,
            });
        }
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[6..22]);
        Ok(Self {
            qp_num: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            lid: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
            gid: Gid::from_raw(gid),
            psn: u32::from_be_bytes([0, buf[22], buf[23], buf[24]]),
            remote_key: u32::from_be_bytes(buf[25..29].try_into().unwrap()),
            remote_addr: u64::from_be_bytes(buf[29..37].try_into().unwrap()),
            remote_len: u32::from_be_bytes(buf[37..41].try_into().unwrap()),
        })
    }
}

/// A byte-stream primitive supplied by the caller for the out-of-band
/// exchange.
///
/// `recv` may return fewer bytes than requested; it should surface its own
/// timeouts as `WouldBlock`/`TimedOut` I/O errors so [`exchange`] can
/// account them against the overall window.
pub trait ExchangeChannel {
    /// Sends all of `bytes` to the peer.
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Receives up to `buf.len()` bytes, returning the count read; 0 means
    /// the peer closed the channel.
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// TCP side-channel used by the demo binary and tests.
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Connects to a listening peer, bounding both the connect and the
    /// per-call read/write waits by `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> std::io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_stream(stream, timeout)
    }

    /// Accepts one peer connection from the listener.
    pub fn accept(listener: &TcpListener, timeout: Duration) -> std::io::Result<Self> {
        let (stream, peer) = listener.accept()?;
        tracing::debug!("accepted exchange peer {}", peer);
        Self::from_stream(stream, timeout)
    }

    /// Wraps an established stream, setting its read/write timeouts.
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl ExchangeChannel for TcpChannel {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)
    }

    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

/// Swaps connection records with the peer: sends the local record, then
/// receives the peer's.
///
/// The local record goes out before any receive so that two sides running
/// this concurrently cannot deadlock on a synchronous channel. Receiving
/// stops when the full record has arrived, the channel closes (yielding
/// [`ExchangeError::Truncated`]), or `timeout` elapses.
pub fn exchange(
    local: &ConnectionRecord,
    channel: &mut impl ExchangeChannel,
    timeout: Duration,
) -> Result<ConnectionRecord, ExchangeError> {
    tracing::debug!("sending local connection record {:?}", local);
    channel.send(&local.to_wire())?;

    let start = Instant::now();
    let mut buf = [0u8; CONNECTION_RECORD_SIZE];
    let mut filled = 0;
    while filled < CONNECTION_RECORD_SIZE {
        if start.elapsed() >= timeout {
            return Err(ExchangeError::Timeout(timeout));
        }
        match channel.recv(&mut buf[filled..]) {
            Ok(0) => {
                return Err(ExchangeError::Truncated {
                    got: filled,
                    expected: CONNECTION_RECORD_SIZE,
                });
            }
            Ok(n) => filled += n,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(ExchangeError::Io(err)),
        }
    }

    let peer = ConnectionRecord::from_wire(&buf)?;
    tracing::debug!("received peer connection record {:?}", peer);
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    /// In-process channel for tests where both ends share a process.
    struct MemoryChannel {
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    fn memory_channel_pair() -> (MemoryChannel, MemoryChannel) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            MemoryChannel {
                tx: a_tx,
                rx: a_rx,
                pending: Vec::new(),
            },
            MemoryChannel {
                tx: b_tx,
                rx: b_rx,
                pending: Vec::new(),
            },
        )
    }

    impl ExchangeChannel for MemoryChannel {
        fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.tx
                .send(bytes.to_vec())
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }

        fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(bytes) => self.pending = bytes,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn sample_record(qp_num: u32) -> ConnectionRecord {
        ConnectionRecord {
            qp_num,
            lid: 0x1234,
            gid: Gid::from_raw([7u8; 16]),
            psn: 0xabcdef,
            remote_key: 0xdeadbeef,
            remote_addr: 0x7f00_0000_1000,
            remote_len: 1024,
        }
    }

    #[test]
    fn test_wire_roundtrip_preserves_fields() {
        let record = sample_record(42);
        let wire = record.to_wire();
        assert_eq!(wire.len(), CONNECTION_RECORD_SIZE);
        assert_eq!(ConnectionRecord::from_wire(&wire).unwrap(), record);
    }

    #[test]
    fn test_psn_is_masked_to_24_bits() {
        let mut record = sample_record(1);
        record.psn = 0xff123456;
        let decoded = ConnectionRecord::from_wire(&record.to_wire()).unwrap();
        assert_eq!(decoded.psn, 0x123456);
    }

    #[test]
    fn test_undersized_record_rejected() {
        let record = sample_record(1);
        let wire = record.to_wire();
        match ConnectionRecord::from_wire(&wire[..CONNECTION_RECORD_SIZE - 1]) {
            Err(ExchangeError::Truncated { got, expected }) => {
                assert_eq!(got, CONNECTION_RECORD_SIZE - 1);
                assert_eq!(expected, CONNECTION_RECORD_SIZE);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_exchange_both_sides_send_first() {
        let (mut a, mut b) = memory_channel_pair();
        let local_a = sample_record(1);
        let local_b = sample_record(2);

        // Concurrent exchange in both directions only completes because
        // each side sends before receiving.
        let handle = std::thread::spawn(move || {
            exchange(&local_b, &mut b, Duration::from_secs(1)).unwrap()
        });
        let got_b = exchange(&local_a, &mut a, Duration::from_secs(1)).unwrap();
        let got_a = handle.join().unwrap();

        assert_eq!(got_b.qp_num, 2);
        assert_eq!(got_a.qp_num, 1);
    }

    #[test]
    fn test_exchange_times_out_on_silent_peer() {
        let (mut a, _b) = memory_channel_pair();
        let local = sample_record(1);
        // _b never sends; the channel stays open so recv keeps timing out.
        match exchange(&local, &mut a, Duration::from_millis(50)) {
            Err(ExchangeError::Timeout(t)) => assert_eq!(t, Duration::from_millis(50)),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_exchange_reports_closed_channel() {
        let (mut a, b) = memory_channel_pair();
        drop(b);
        let local = sample_record(1);
        match exchange(&local, &mut a, Duration::from_secs(1)) {
            // Send fails or the receive sees a closed channel, depending
            // on drop timing; both are channel errors, not timeouts.
            Err(ExchangeError::Io(_)) | Err(ExchangeError::Truncated { .. }) => {}
            other => panic!("expected Io or Truncated, got {:?}", other),
        }
    }
}
