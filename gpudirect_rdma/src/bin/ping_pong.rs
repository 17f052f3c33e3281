/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Two-process RDMA ping-pong over a 1 KiB buffer.
//!
//! The server binds a TCP port for the out-of-band exchange and waits.
//! The client RDMA-writes a patterned payload into the server's region,
//! then posts a send as a doorbell; the server verifies the payload,
//! writes the mirrored pattern back, and rings its own doorbell. Each
//! side verifies what it received before tearing down.
//!
//! Exit codes distinguish the failing stage: 0 success, 1 usage or data
//! mismatch, 2 device, 3 buffer allocation, 4 registration, 5 exchange,
//! 6 state transition, 7 transfer.
//!
//! ```text
//! ping_pong server 0.0.0.0:7471
//! ping_pong client 10.0.0.2:7471
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::time::Duration;
use std::time::Instant;

use gpudirect_rdma::exchange;
use gpudirect_rdma::get_all_devices;
use gpudirect_rdma::teardown;
use gpudirect_rdma::AccessFlags;
use gpudirect_rdma::CompletionError;
use gpudirect_rdma::ConnectionRecord;
use gpudirect_rdma::DeviceBuffer;
use gpudirect_rdma::DeviceError;
use gpudirect_rdma::ExchangeError;
use gpudirect_rdma::IbverbsConfig;
use gpudirect_rdma::PostError;
use gpudirect_rdma::RdmaDomain;
use gpudirect_rdma::RdmaError;
use gpudirect_rdma::RdmaMemoryRegion;
use gpudirect_rdma::RdmaQueuePair;
use gpudirect_rdma::RegistrationError;
use gpudirect_rdma::StateTransitionError;
use gpudirect_rdma::TcpChannel;
use gpudirect_rdma::TransferEngine;

const BUF_SIZE: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_USAGE: i32 = 1;
const EXIT_DEVICE: i32 = 2;
const EXIT_ALLOCATION: i32 = 3;
const EXIT_REGISTRATION: i32 = 4;
const EXIT_EXCHANGE: i32 = 5;
const EXIT_STATE: i32 = 6;
const EXIT_TRANSFER: i32 = 7;

fn exit_code(err: &RdmaError) -> i32 {
    match err {
        RdmaError::Device(_) => EXIT_DEVICE,
        RdmaError::Registration(RegistrationError::EmptyBuffer) => EXIT_ALLOCATION,
        RdmaError::Registration(_) => EXIT_REGISTRATION,
        RdmaError::Exchange(_) => EXIT_EXCHANGE,
        RdmaError::StateTransition(_) => EXIT_STATE,
        RdmaError::Post(_) | RdmaError::Completion(_) => EXIT_TRANSFER,
    }
}

fn usage() -> ! {
    eprintln!("usage: ping_pong <server|client> <addr:port>");
    std::process::exit(EXIT_USAGE);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        usage();
    }
    let addr: SocketAddr = match args[2].parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("ping_pong: bad address {:?}: {}", args[2], err);
            usage();
        }
    };

    let is_server = match args[1].as_str() {
        "server" => true,
        "client" => false,
        _ => usage(),
    };

    match run(is_server, addr) {
        Ok(()) => {
            println!("ping_pong: OK");
        }
        Err(Failure::Rdma(err)) => {
            let code = exit_code(&err);
            eprintln!("ping_pong: {:#}", anyhow::Error::from(err));
            std::process::exit(code);
        }
        Err(Failure::Mismatch { index, got, want }) => {
            eprintln!(
                "ping_pong: payload mismatch at byte {}: got {:#x}, want {:#x}",
                index, got, want
            );
            std::process::exit(EXIT_USAGE);
        }
    }
}

#[derive(Debug)]
enum Failure {
    Rdma(RdmaError),
    Mismatch { index: usize, got: u8, want: u8 },
}

impl From<RdmaError> for Failure {
    fn from(err: RdmaError) -> Self {
        Failure::Rdma(err)
    }
}

macro_rules! failure_from {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for Failure {
                fn from(err: $err) -> Self {
                    Failure::Rdma(err.into())
                }
            }
        )*
    };
}

failure_from!(
    DeviceError,
    RegistrationError,
    ExchangeError,
    StateTransitionError,
    PostError,
    CompletionError,
);

/// The byte each side expects at `index` of the payload it receives.
fn expected_byte(receiver_is_server: bool, index: usize) -> u8 {
    if receiver_is_server {
        (index & 0xff) as u8
    } else {
        0xff - (index & 0xff) as u8
    }
}

fn fill_payload(buf: &mut [u8], sender_is_server: bool) {
    for (index, byte) in buf.iter_mut().enumerate() {
        // A sender fills the pattern its peer expects to receive.
        *byte = expected_byte(!sender_is_server, index);
    }
}

fn verify(buf: &[u8], receiver_is_server: bool) -> Result<(), Failure> {
    for (index, &got) in buf.iter().enumerate() {
        let want = expected_byte(receiver_is_server, index);
        if got != want {
            return Err(Failure::Mismatch { index, got, want });
        }
    }
    Ok(())
}

fn run(is_server: bool, addr: SocketAddr) -> Result<(), Failure> {
    let config = IbverbsConfig::default();
    let timeout = config.exchange_timeout;

    if !gpudirect_rdma::ibverbs_supported() {
        return Err(DeviceError::NoDevices.into());
    }
    let devices = get_all_devices();
    let device = devices.first().ok_or(DeviceError::NoDevices)?;
    tracing::info!("using device {}", device);

    let domain = RdmaDomain::new(device)?;

    // One buffer per side: the outbound payload and the landing zone for
    // the peer's write. The doorbell is a separate 1-byte send/recv pair.
    let mut buf = vec![0u8; BUF_SIZE].into_boxed_slice();
    fill_payload(&mut buf, is_server);
    let mut doorbell = [0u8; 1];

    let buffer = DeviceBuffer::from_host_slice(&mut buf);
    let doorbell_buffer = DeviceBuffer::from_host_slice(&mut doorbell);
    let region = RdmaMemoryRegion::register(&domain, &buffer, AccessFlags::remote_writable())?;
    let doorbell_region =
        RdmaMemoryRegion::register(&domain, &doorbell_buffer, AccessFlags::default())?;

    let mut qp = RdmaQueuePair::new(&domain, config)?;
    let local = qp.local_record(Some(&region))?;

    let peer: ConnectionRecord = {
        let mut channel = if is_server {
            let listener = TcpListener::bind(addr).map_err(ExchangeError::Io)?;
            tracing::info!("listening for exchange peer on {}", addr);
            TcpChannel::accept(&listener, timeout).map_err(ExchangeError::Io)?
        } else {
            TcpChannel::connect(addr, timeout).map_err(ExchangeError::Io)?
        };
        exchange(&local, &mut channel, timeout)?
    };
    tracing::info!("exchanged records with peer qp_num {}", peer.qp_num);

    qp.connect(&peer)?;

    let result = ping_pong(
        &mut qp,
        &region,
        &doorbell_region,
        &peer,
        &mut buf,
        is_server,
    );

    let released = teardown(vec![region, doorbell_region], Some(qp), Some(domain));
    result?;
    released?;
    Ok(())
}

fn ping_pong(
    qp: &mut RdmaQueuePair,
    region: &RdmaMemoryRegion,
    doorbell_region: &RdmaMemoryRegion,
    peer: &ConnectionRecord,
    buf: &mut [u8],
    is_server: bool,
) -> Result<(), Failure> {
    let mut engine = TransferEngine::new(qp);
    let mut seen = HashSet::new();

    // Staged before any peer traffic so the doorbell send cannot hit an
    // empty receive queue.
    engine.post_recv(1, doorbell_region, 0, doorbell_region.len())?;

    if is_server {
        wait_for(&mut engine, &mut seen, 1)?;
        verify(buf, true)?;
        tracing::info!("server: payload verified, writing pong");
        // The inbound ping overwrote the buffer; restore the outbound
        // pattern before writing it back.
        fill_payload(buf, true);
        engine.post_write(2, region, 0, region.len(), peer)?;
        wait_for(&mut engine, &mut seen, 2)?;
        engine.post_send(3, doorbell_region, 0, doorbell_region.len())?;
        wait_for(&mut engine, &mut seen, 3)?;
    } else {
        engine.post_write(2, region, 0, region.len(), peer)?;
        wait_for(&mut engine, &mut seen, 2)?;
        engine.post_send(3, doorbell_region, 0, doorbell_region.len())?;
        wait_for(&mut engine, &mut seen, 3)?;
        wait_for(&mut engine, &mut seen, 1)?;
        verify(buf, false)?;
        tracing::info!("client: pong verified");
    }
    Ok(())
}

/// Records a poll batch into `seen`, failing on any errored or flushed
/// completion. Completions arrive in adapter retirement order, so a batch
/// drained while waiting for one id may carry others; they are retained
/// for later waits instead of dropped.
fn absorb_batch(
    completions: &[gpudirect_rdma::WorkCompletion],
    seen: &mut HashSet<u64>,
) -> Result<(), Failure> {
    for completion in completions {
        if !completion.is_success() {
            return Err(transfer_failed(format!(
                "wr_id {} failed: {}",
                completion.wr_id,
                completion.status_str()
            )));
        }
        seen.insert(completion.wr_id);
    }
    Ok(())
}

/// Polls until the completion for `wr_id` has been observed, in this call
/// or an earlier one.
fn wait_for(
    engine: &mut TransferEngine<'_>,
    seen: &mut HashSet<u64>,
    wr_id: u64,
) -> Result<(), Failure> {
    let deadline = Instant::now() + POLL_TIMEOUT;
    loop {
        if seen.remove(&wr_id) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(transfer_failed(format!(
                "timed out waiting for wr_id {}",
                wr_id
            )));
        }
        let completions = engine.poll(16, POLL_TIMEOUT)?;
        absorb_batch(&completions, seen)?;
    }
}

fn transfer_failed(message: String) -> Failure {
    Failure::Rdma(RdmaError::Completion(CompletionError::Poll(
        std::io::Error::other(message),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpudirect_rdma::WorkCompletion;

    fn success(wr_id: u64) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            status: 0,
            opcode: 0,
            byte_count: 0,
            vendor_err: 0,
        }
    }

    #[test]
    fn test_batch_completions_are_retained_across_waits() {
        // The doorbell recv (1) can retire in the same batch as the
        // doorbell send (3); waiting on 3 first must not lose 1.
        let mut seen = HashSet::new();
        absorb_batch(&[success(3), success(1)], &mut seen).unwrap();
        assert!(seen.remove(&3));
        assert!(seen.remove(&1));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_failed_completion_stops_the_run() {
        let mut seen = HashSet::new();
        let flushed = WorkCompletion {
            wr_id: 2,
            status: rdma_sys::ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
            opcode: 0,
            byte_count: 0,
            vendor_err: 0,
        };
        assert!(absorb_batch(&[success(1), flushed], &mut seen).is_err());
        // The successful part of the batch is still recorded.
        assert!(seen.contains(&1));
    }
}
