/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end loopback tests: two queue pairs on one adapter, connected
//! through a real localhost TCP exchange, moving data between two host
//! buffers. These run only where an RDMA-capable device is present.

use std::net::TcpListener;
use std::time::Duration;

use gpudirect_rdma::exchange;
use gpudirect_rdma::get_all_devices;
use gpudirect_rdma::teardown;
use gpudirect_rdma::AccessFlags;
use gpudirect_rdma::ConnectionRecord;
use gpudirect_rdma::DeviceBuffer;
use gpudirect_rdma::IbverbsConfig;
use gpudirect_rdma::PostError;
use gpudirect_rdma::QpState;
use gpudirect_rdma::RdmaDomain;
use gpudirect_rdma::RdmaMemoryRegion;
use gpudirect_rdma::RdmaQueuePair;
use gpudirect_rdma::TcpChannel;
use gpudirect_rdma::TransferEngine;

const BUF_SIZE: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Swaps the two records over localhost TCP, one side per thread, the
/// way two real processes would.
fn tcp_exchange(a: &ConnectionRecord, b: &ConnectionRecord) -> (ConnectionRecord, ConnectionRecord) {
    let timeout = Duration::from_secs(5);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let b = b.clone();
    let acceptor = std::thread::spawn(move || {
        let mut channel = TcpChannel::accept(&listener, timeout).unwrap();
        exchange(&b, &mut channel, timeout).unwrap()
    });

    let mut channel = TcpChannel::connect(addr, timeout).unwrap();
    let seen_by_a = exchange(a, &mut channel, timeout).unwrap();
    let seen_by_b = acceptor.join().unwrap();
    (seen_by_a, seen_by_b)
}

struct Endpoint {
    qp: RdmaQueuePair,
    region: RdmaMemoryRegion,
    buf: Box<[u8]>,
}

impl Endpoint {
    fn new(domain: &RdmaDomain, fill: u8) -> Self {
        let mut buf = vec![fill; BUF_SIZE].into_boxed_slice();
        let region = RdmaMemoryRegion::register(
            domain,
            &DeviceBuffer::from_host_slice(&mut buf),
            AccessFlags::remote_writable(),
        )
        .unwrap();
        let qp = RdmaQueuePair::new(domain, IbverbsConfig::default()).unwrap();
        Endpoint { qp, region, buf }
    }

    fn record(&self) -> ConnectionRecord {
        self.qp.local_record(Some(&self.region)).unwrap()
    }
}

#[test]
fn test_loopback_write_lands_in_peer_buffer() {
    let devices = get_all_devices();
    if devices.is_empty() {
        println!("Skipping test: RDMA devices not available");
        return;
    }
    let domain = RdmaDomain::new(&devices[0]).unwrap();

    let mut src = Endpoint::new(&domain, 0);
    let mut dst = Endpoint::new(&domain, 0);
    for (index, byte) in src.buf.iter_mut().enumerate() {
        *byte = (index & 0xff) as u8;
    }

    let (dst_record, src_record) = tcp_exchange(&src.record(), &dst.record());
    src.qp.connect(&dst_record).unwrap();
    dst.qp.connect(&src_record).unwrap();
    assert_eq!(src.qp.state(), QpState::ReadyToSend);
    assert_eq!(dst.qp.state(), QpState::ReadyToSend);

    let mut engine = TransferEngine::new(&mut src.qp);
    engine
        .post_write(7, &src.region, 0, BUF_SIZE, &dst_record)
        .unwrap();
    assert_eq!(engine.outstanding(), 1);

    let completions = engine.poll(16, POLL_TIMEOUT).unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].wr_id, 7);
    assert!(completions[0].is_success());
    assert_eq!(engine.outstanding(), 0);

    for (index, &byte) in dst.buf.iter().enumerate() {
        assert_eq!(byte, (index & 0xff) as u8, "byte {} did not land", index);
    }

    teardown(vec![src.region], Some(src.qp), None).unwrap();
    teardown(vec![dst.region], Some(dst.qp), Some(domain)).unwrap();
}

#[test]
fn test_oversized_write_is_rejected_before_the_adapter() {
    let devices = get_all_devices();
    if devices.is_empty() {
        println!("Skipping test: RDMA devices not available");
        return;
    }
    let domain = RdmaDomain::new(&devices[0]).unwrap();

    let mut src = Endpoint::new(&domain, 0xaa);
    let mut dst = Endpoint::new(&domain, 0);

    let (dst_record, src_record) = tcp_exchange(&src.record(), &dst.record());
    src.qp.connect(&dst_record).unwrap();
    dst.qp.connect(&src_record).unwrap();

    let mut engine = TransferEngine::new(&mut src.qp);
    match engine.post_write(1, &src.region, 0, 2 * BUF_SIZE, &dst_record) {
        Err(PostError::LocalBounds { len, offset, bound }) => {
            assert_eq!(len, 2 * BUF_SIZE);
            assert_eq!(offset, 0);
            assert_eq!(bound, BUF_SIZE);
        }
        other => panic!("expected LocalBounds, got {:?}", other),
    }
    // Nothing reached the adapter, so nothing is in flight and the
    // target buffer is untouched.
    assert_eq!(engine.outstanding(), 0);
    assert!(dst.buf.iter().all(|&b| b == 0));

    teardown(vec![src.region], Some(src.qp), None).unwrap();
    teardown(vec![dst.region], Some(dst.qp), Some(domain)).unwrap();
}

#[test]
fn test_duplicate_work_request_id_is_rejected() {
    let devices = get_all_devices();
    if devices.is_empty() {
        println!("Skipping test: RDMA devices not available");
        return;
    }
    let domain = RdmaDomain::new(&devices[0]).unwrap();

    let mut src = Endpoint::new(&domain, 0x55);
    let mut dst = Endpoint::new(&domain, 0);

    let (dst_record, src_record) = tcp_exchange(&src.record(), &dst.record());
    src.qp.connect(&dst_record).unwrap();
    dst.qp.connect(&src_record).unwrap();

    let mut engine = TransferEngine::new(&mut src.qp);
    engine
        .post_write(42, &src.region, 0, BUF_SIZE, &dst_record)
        .unwrap();
    match engine.post_write(42, &src.region, 0, BUF_SIZE, &dst_record) {
        Err(PostError::DuplicateId(id)) => assert_eq!(id, 42),
        other => panic!("expected DuplicateId, got {:?}", other),
    }

    let completions = engine.poll(16, POLL_TIMEOUT).unwrap();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].is_success());

    teardown(vec![src.region], Some(src.qp), None).unwrap();
    teardown(vec![dst.region], Some(dst.qp), Some(domain)).unwrap();
}
