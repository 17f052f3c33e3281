/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reliable-connection queue pair and its handshake state machine.
//!
//! A queue pair moves through RESET -> INIT -> READY_TO_RECEIVE ->
//! READY_TO_SEND, each step a single atomic `ibv_modify_qp` call carrying
//! the parameters that step requires (local port and access flags for
//! INIT, the peer's identifiers and path MTU for RTR, sequence and retry
//! parameters for RTS). Posting outside READY_TO_SEND is rejected before
//! any adapter call.
//!
//! A failed transition leaves the pair in its prior state unless the
//! adapter itself reports the pair errored; once in ERROR the pair is
//! unusable and must be destroyed, not repaired.

use serde::Deserialize;
use serde::Serialize;

use crate::domain::RdmaDomain;
use crate::errors::last_os_error;
use crate::errors::CompletionError;
use crate::errors::DeviceError;
use crate::errors::PostError;
use crate::errors::StateTransitionError;
use crate::exchange::ConnectionRecord;
use crate::ibverbs_primitives::Gid;
use crate::ibverbs_primitives::IbverbsConfig;
use crate::ibverbs_primitives::RdmaOperation;
use crate::memory_region::RdmaMemoryRegion;

/// Lifecycle states of a reliable-connection queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpState {
    /// Freshly created; accepts no work.
    Reset,
    /// Bound to a local port with access flags; may pre-post receives.
    Init,
    /// Connected to the peer's identifiers; inbound traffic can land.
    ReadyToReceive,
    /// Fully handshaken; send-side posting is allowed.
    ReadyToSend,
    /// Terminal. The pair must be destroyed and re-created.
    Error,
}

impl QpState {
    /// Whether send-side work (writes, sends) may be posted.
    pub fn can_post_send(self) -> bool {
        self == QpState::ReadyToSend
    }

    /// Whether receive buffers may be posted. The verbs contract allows
    /// pre-posting receives from INIT onward.
    pub fn can_post_recv(self) -> bool {
        matches!(
            self,
            QpState::Init | QpState::ReadyToReceive | QpState::ReadyToSend
        )
    }

    /// Checks that `from -> to` is an edge of the handshake machine.
    ///
    /// The deliberate transition to [`QpState::Error`] is always legal and
    /// handled separately by [`RdmaQueuePair::to_error`].
    pub fn validate_transition(from: QpState, to: QpState) -> Result<(), StateTransitionError> {
        match (from, to) {
            (QpState::Error, _) => Err(StateTransitionError::Errored),
            (QpState::Reset, QpState::Init)
            | (QpState::Init, QpState::ReadyToReceive)
            | (QpState::ReadyToReceive, QpState::ReadyToSend) => Ok(()),
            _ => Err(StateTransitionError::InvalidTransition { from, to }),
        }
    }

    fn from_ibv(state: rdma_sys::ibv_qp_state::Type) -> QpState {
        match state {
            rdma_sys::ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
            rdma_sys::ibv_qp_state::IBV_QPS_INIT => QpState::Init,
            rdma_sys::ibv_qp_state::IBV_QPS_RTR => QpState::ReadyToReceive,
            rdma_sys::ibv_qp_state::IBV_QPS_RTS => QpState::ReadyToSend,
            // SQD/SQE and anything else are not states this machine
            // enters deliberately; treat them as errored.
            _ => QpState::Error,
        }
    }
}

/// One end of a reliable connection: a queue pair bound to one completion
/// queue, with exactly one send queue and one receive queue.
///
/// Must not be posted-to concurrently from multiple threads without an
/// external lock; send-queue ordering is only well-defined for a single
/// poster.
pub struct RdmaQueuePair {
    cq: *mut rdma_sys::ibv_cq,
    qp: *mut rdma_sys::ibv_qp,
    context: *mut rdma_sys::ibv_context,
    state: QpState,
    config: IbverbsConfig,
}

impl std::fmt::Debug for RdmaQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaQueuePair")
            .field("qp_num", &self.qp_num())
            .field("state", &self.state)
            .finish()
    }
}

// SAFETY: The raw ibverbs pointers can be used and dropped from any
// thread; the posting discipline above is the caller's responsibility and
// is unaffected by which thread owns the value.
unsafe impl Send for RdmaQueuePair {}

impl RdmaQueuePair {
    /// Creates the completion queue and an RC queue pair bound to it, in
    /// the RESET state.
    pub fn new(domain: &RdmaDomain, config: IbverbsConfig) -> Result<Self, DeviceError> {
        tracing::debug!("creating RdmaQueuePair from config {}", config);
        unsafe {
            let context = domain.context();
            let cq = rdma_sys::ibv_create_cq(
                context,
                config.cq_entries,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            );
            if cq.is_null() {
                return Err(DeviceError::CreateCq(last_os_error()));
            }

            let mut init_attr = std::mem::zeroed::<rdma_sys::ibv_qp_init_attr>();
            init_attr.send_cq = cq;
            init_attr.recv_cq = cq;
            init_attr.cap.max_send_wr = config.max_send_wr;
            init_attr.cap.max_recv_wr = config.max_recv_wr;
            init_attr.cap.max_send_sge = config.max_send_sge;
            init_attr.cap.max_recv_sge = config.max_recv_sge;
            init_attr.qp_type = rdma_sys::ibv_qp_type::IBV_QPT_RC;
            // Completions are requested per work request, not queue-wide.
            init_attr.sq_sig_all = 0;

            let qp = rdma_sys::ibv_create_qp(domain.pd(), &mut init_attr);
            if qp.is_null() {
                let err = last_os_error();
                rdma_sys::ibv_destroy_cq(cq);
                return Err(DeviceError::CreateQp(err));
            }

            Ok(RdmaQueuePair {
                cq,
                qp,
                context,
                state: QpState::Reset,
                config,
            })
        }
    }

    /// The adapter-assigned queue pair number.
    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.qp).qp_num }
    }

    /// The state this machine last drove the pair into.
    pub fn state(&self) -> QpState {
        self.state
    }

    /// The send-queue depth the transfer engine backpressures against.
    pub fn send_queue_depth(&self) -> usize {
        self.config.max_send_wr as usize
    }

    /// The receive-queue depth.
    pub fn recv_queue_depth(&self) -> usize {
        self.config.max_recv_wr as usize
    }

    /// Adopts ERROR directly, for callers that observed an errored
    /// completion and therefore already know the adapter's verdict.
    pub(crate) fn mark_errored(&mut self) {
        self.state = QpState::Error;
    }

    /// Builds the local [`ConnectionRecord`] to hand to the out-of-band
    /// exchange: this pair's identifiers plus the region (if any) exposed
    /// for the peer's RDMA writes.
    pub fn local_record(
        &self,
        exposed: Option<&RdmaMemoryRegion>,
    ) -> Result<ConnectionRecord, DeviceError> {
        unsafe {
            let mut port_attr = std::mem::zeroed::<rdma_sys::ibv_port_attr>();
            let errno = rdma_sys::___ibv_query_port(
                self.context,
                self.config.port_num,
                &mut port_attr as *mut rdma_sys::ibv_port_attr as *mut _,
            );
            if errno != 0 {
                return Err(DeviceError::QueryPort {
                    port: self.config.port_num,
                    source: last_os_error(),
                });
            }

            let mut gid = std::mem::zeroed::<rdma_sys::ibv_gid>();
            let ret = rdma_sys::ibv_query_gid(
                self.context,
                self.config.port_num,
                i32::from(self.config.gid_index),
                &mut gid,
            );
            if ret != 0 {
                return Err(DeviceError::QueryGid(self.config.gid_index));
            }

            Ok(ConnectionRecord {
                qp_num: (*self.qp).qp_num,
                lid: port_attr.lid,
                gid: Gid::from(gid),
                psn: self.config.psn,
                remote_key: exposed.map(|r| r.rkey()).unwrap_or(0),
                remote_addr: exposed.map(|r| r.addr() as u64).unwrap_or(0),
                remote_len: exposed.map(|r| r.len() as u32).unwrap_or(0),
            })
        }
    }

    /// RESET -> INIT: binds the pair to the local port with its partition
    /// key and access flags.
    pub fn to_init(&mut self) -> Result<(), StateTransitionError> {
        QpState::validate_transition(self.state, QpState::Init)?;

        let qp_access_flags = rdma_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | rdma_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | rdma_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ;

        let mut attr = unsafe { std::mem::zeroed::<rdma_sys::ibv_qp_attr>() };
        attr.qp_state = rdma_sys::ibv_qp_state::IBV_QPS_INIT;
        attr.qp_access_flags = qp_access_flags.0;
        attr.pkey_index = self.config.pkey_index;
        attr.port_num = self.config.port_num;

        let mask = rdma_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_PORT
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

        self.modify(&mut attr, mask, QpState::Init)
    }

    /// INIT -> READY_TO_RECEIVE: installs the peer's queue pair number,
    /// fabric address, starting sequence number, and the path MTU
    /// (clamped to the port's active MTU).
    pub fn to_ready_to_receive(
        &mut self,
        peer: &ConnectionRecord,
    ) -> Result<(), StateTransitionError> {
        QpState::validate_transition(self.state, QpState::ReadyToReceive)?;

        let mut attr = unsafe { std::mem::zeroed::<rdma_sys::ibv_qp_attr>() };
        attr.qp_state = rdma_sys::ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = self.active_path_mtu();
        attr.dest_qp_num = peer.qp_num;
        attr.rq_psn = peer.psn;
        attr.max_dest_rd_atomic = self.config.max_dest_rd_atomic;
        attr.min_rnr_timer = self.config.min_rnr_timer;
        attr.ah_attr.dlid = peer.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = self.config.port_num;

        // A zero GID in the peer's record means LID-based routing
        // (InfiniBand subnet-local / RoCEv1); otherwise route globally.
        if peer.gid.is_zero() {
            attr.ah_attr.is_global = 0;
        } else {
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid = peer.gid.into();
            attr.ah_attr.grh.hop_limit = 0xff;
            attr.ah_attr.grh.sgid_index = self.config.gid_index;
        }

        let mask = rdma_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_AV
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

        self.modify(&mut attr, mask, QpState::ReadyToReceive)
    }

    /// READY_TO_RECEIVE -> READY_TO_SEND: installs the local sequence
    /// number and the finite retry/timeout parameters.
    ///
    /// Retry exhaustion surfaces as a completion error to the transfer
    /// engine; there is no unbounded automatic retry at this layer.
    pub fn to_ready_to_send(&mut self) -> Result<(), StateTransitionError> {
        QpState::validate_transition(self.state, QpState::ReadyToSend)?;

        let mut attr = unsafe { std::mem::zeroed::<rdma_sys::ibv_qp_attr>() };
        attr.qp_state = rdma_sys::ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = self.config.psn;
        attr.max_rd_atomic = self.config.max_rd_atomic;
        attr.retry_cnt = self.config.retry_cnt;
        attr.rnr_retry = self.config.rnr_retry;
        attr.timeout = self.config.qp_timeout;

        let mask = rdma_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | rdma_sys::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

        self.modify(&mut attr, mask, QpState::ReadyToSend)
    }

    /// Drives the full handshake against the peer's exchanged record.
    pub fn connect(&mut self, peer: &ConnectionRecord) -> Result<(), StateTransitionError> {
        self.to_init()?;
        self.to_ready_to_receive(peer)?;
        self.to_ready_to_send()?;
        tracing::debug!(
            "connection sequence completed (qp_num {}, peer qp_num {})",
            self.qp_num(),
            peer.qp_num
        );
        Ok(())
    }

    /// Deliberately transitions the pair to ERROR, flushing all
    /// outstanding work. This is the only way to abort posted operations;
    /// afterwards the pair can only be destroyed.
    pub fn to_error(&mut self) -> Result<(), StateTransitionError> {
        let from = self.state;
        let mut attr = unsafe { std::mem::zeroed::<rdma_sys::ibv_qp_attr>() };
        attr.qp_state = rdma_sys::ibv_qp_state::IBV_QPS_ERR;
        let mask = rdma_sys::ibv_qp_attr_mask::IBV_QP_STATE;

        let errno = unsafe { rdma_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as i32) };
        if errno != 0 {
            self.reconcile_adapter_state();
            return Err(StateTransitionError::Rejected {
                from,
                to: QpState::Error,
                source: std::io::Error::from_raw_os_error(errno),
            });
        }
        self.state = QpState::Error;
        Ok(())
    }

    /// The configured path MTU clamped to the port's active MTU. The
    /// ibv_mtu enum is ordered, so a numeric min is a size min.
    fn active_path_mtu(&self) -> u32 {
        unsafe {
            let mut port_attr = std::mem::zeroed::<rdma_sys::ibv_port_attr>();
            let errno = rdma_sys::___ibv_query_port(
                self.context,
                self.config.port_num,
                &mut port_attr as *mut rdma_sys::ibv_port_attr as *mut _,
            );
            if errno != 0 {
                tracing::warn!(
                    "failed to query port {} for active MTU: {}",
                    self.config.port_num,
                    std::io::Error::from_raw_os_error(errno)
                );
                return self.config.path_mtu;
            }
            std::cmp::min(self.config.path_mtu, port_attr.active_mtu)
        }
    }

    fn modify(
        &mut self,
        attr: &mut rdma_sys::ibv_qp_attr,
        mask: rdma_sys::ibv_qp_attr_mask,
        to: QpState,
    ) -> Result<(), StateTransitionError> {
        let from = self.state;
        let errno = unsafe { rdma_sys::ibv_modify_qp(self.qp, attr, mask.0 as i32) };
        if errno != 0 {
            // The pair stays in its prior state unless the adapter says
            // otherwise; never silently assume ERROR.
            self.reconcile_adapter_state();
            return Err(StateTransitionError::Rejected {
                from,
                to,
                source: std::io::Error::from_raw_os_error(errno),
            });
        }
        self.state = to;
        tracing::debug!("queue pair {} transitioned {:?} -> {:?}", self.qp_num(), from, to);
        Ok(())
    }

    /// Re-queries the adapter and adopts ERROR if the adapter reports it.
    pub(crate) fn reconcile_adapter_state(&mut self) {
        if let Some(actual) = self.adapter_state() {
            if actual == QpState::Error {
                self.state = QpState::Error;
            }
        }
    }

    /// The adapter's own view of the pair's state, if it can be queried.
    pub fn adapter_state(&self) -> Option<QpState> {
        unsafe {
            let mut attr = std::mem::zeroed::<rdma_sys::ibv_qp_attr>();
            let mut init_attr = std::mem::zeroed::<rdma_sys::ibv_qp_init_attr>();
            let mask = rdma_sys::ibv_qp_attr_mask::IBV_QP_STATE;
            let errno =
                rdma_sys::ibv_query_qp(self.qp, &mut attr, mask.0 as i32, &mut init_attr);
            if errno != 0 {
                tracing::warn!(
                    "failed to query QP state: {}",
                    std::io::Error::from_raw_os_error(errno)
                );
                return None;
            }
            Some(QpState::from_ibv(attr.qp_state))
        }
    }

    /// Posts a one-sided RDMA write of `len` bytes from local memory into
    /// the peer's advertised region.
    ///
    /// Only legal in READY_TO_SEND; rejected before any adapter call
    /// otherwise. Bounds against the local registration and the peer's
    /// advertised length are the transfer engine's responsibility.
    pub fn post_write(
        &mut self,
        wr_id: u64,
        laddr: usize,
        lkey: u32,
        len: usize,
        raddr: u64,
        rkey: u32,
    ) -> Result<(), PostError> {
        if !self.state.can_post_send() {
            return Err(PostError::NotReady(self.state));
        }
        self.post_send_wr(wr_id, laddr, lkey, len, RdmaOperation::Write, raddr, rkey)
    }

    /// Posts a two-sided send of `len` bytes; the peer must have a
    /// receive posted.
    pub fn post_send(
        &mut self,
        wr_id: u64,
        laddr: usize,
        lkey: u32,
        len: usize,
    ) -> Result<(), PostError> {
        if !self.state.can_post_send() {
            return Err(PostError::NotReady(self.state));
        }
        self.post_send_wr(wr_id, laddr, lkey, len, RdmaOperation::Send, 0, 0)
    }

    /// Posts a receive buffer. Legal from INIT onward so receives can be
    /// pre-posted before the peer reaches READY_TO_SEND.
    pub fn post_recv(
        &mut self,
        wr_id: u64,
        laddr: usize,
        lkey: u32,
        len: usize,
    ) -> Result<(), PostError> {
        if !self.state.can_post_recv() {
            return Err(PostError::NotReady(self.state));
        }
        unsafe {
            let mut sge = rdma_sys::ibv_sge {
                addr: laddr as u64,
                length: len as u32,
                lkey,
            };
            let mut wr = std::mem::zeroed::<rdma_sys::ibv_recv_wr>();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad_wr: *mut rdma_sys::ibv_recv_wr = std::ptr::null_mut();
            let errno = rdma_sys::ibv_post_recv(self.qp, &mut wr, &mut bad_wr);
            if errno != 0 {
                return Err(PostError::Post(std::io::Error::from_raw_os_error(errno)));
            }
        }
        Ok(())
    }

    fn post_send_wr(
        &mut self,
        wr_id: u64,
        laddr: usize,
        lkey: u32,
        len: usize,
        op: RdmaOperation,
        raddr: u64,
        rkey: u32,
    ) -> Result<(), PostError> {
        unsafe {
            let mut sge = rdma_sys::ibv_sge {
                addr: laddr as u64,
                length: len as u32,
                lkey,
            };
            let mut wr = std::mem::zeroed::<rdma_sys::ibv_send_wr>();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = op.into();
            wr.send_flags = rdma_sys::ibv_send_flags::IBV_SEND_SIGNALED.0;
            if op == RdmaOperation::Write {
                wr.wr.rdma.remote_addr = raddr;
                wr.wr.rdma.rkey = rkey;
            }

            let mut bad_wr: *mut rdma_sys::ibv_send_wr = std::ptr::null_mut();
            let errno = rdma_sys::ibv_post_send(self.qp, &mut wr, &mut bad_wr);
            if errno != 0 {
                return Err(PostError::Post(std::io::Error::from_raw_os_error(errno)));
            }
            tracing::debug!(
                "posted {:?} (wr_id {}, lkey {}, laddr 0x{:x}, len {}, raddr 0x{:x}, rkey {})",
                op,
                wr_id,
                lkey,
                laddr,
                len,
                raddr,
                rkey,
            );
        }
        Ok(())
    }

    /// One non-blocking drain step against the completion queue; returns
    /// the number of entries written into `wc`.
    pub(crate) fn poll_cq(
        &mut self,
        wc: &mut [rdma_sys::ibv_wc],
    ) -> Result<usize, CompletionError> {
        let ret = unsafe { rdma_sys::ibv_poll_cq(self.cq, wc.len() as i32, wc.as_mut_ptr()) };
        if ret < 0 {
            return Err(CompletionError::Poll(last_os_error()));
        }
        Ok(ret as usize)
    }

    /// Explicitly destroys the queue pair, then its completion queue,
    /// reporting the first failure after attempting both.
    pub fn destroy(mut self) -> Result<(), DeviceError> {
        let result = self.destroy_inner();
        self.qp = std::ptr::null_mut();
        self.cq = std::ptr::null_mut();
        result
    }

    fn destroy_inner(&mut self) -> Result<(), DeviceError> {
        let mut first_error = None;
        unsafe {
            if !self.qp.is_null() {
                let errno = rdma_sys::ibv_destroy_qp(self.qp);
                if errno != 0 {
                    let err = DeviceError::Release {
                        resource: "queue pair",
                        source: std::io::Error::from_raw_os_error(errno),
                    };
                    tracing::warn!("teardown: {}", err);
                    first_error.get_or_insert(err);
                }
            }
            if !self.cq.is_null() {
                let errno = rdma_sys::ibv_destroy_cq(self.cq);
                if errno != 0 {
                    let err = DeviceError::Release {
                        resource: "completion queue",
                        source: std::io::Error::from_raw_os_error(errno),
                    };
                    tracing::warn!("teardown: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for RdmaQueuePair {
    fn drop(&mut self) {
        let _ = self.destroy_inner();
        self.qp = std::ptr::null_mut();
        self.cq = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs_primitives::get_all_devices;

    #[test]
    fn test_handshake_edges_are_legal() {
        assert!(QpState::validate_transition(QpState::Reset, QpState::Init).is_ok());
        assert!(QpState::validate_transition(QpState::Init, QpState::ReadyToReceive).is_ok());
        assert!(
            QpState::validate_transition(QpState::ReadyToReceive, QpState::ReadyToSend).is_ok()
        );
    }

    #[test]
    fn test_shortcut_transitions_are_rejected() {
        for (from, to) in [
            (QpState::Reset, QpState::ReadyToReceive),
            (QpState::Reset, QpState::ReadyToSend),
            (QpState::Init, QpState::ReadyToSend),
            (QpState::ReadyToSend, QpState::ReadyToReceive),
            (QpState::ReadyToReceive, QpState::Init),
            (QpState::Init, QpState::Init),
        ] {
            match QpState::validate_transition(from, to) {
                Err(StateTransitionError::InvalidTransition { from: f, to: t }) => {
                    assert_eq!(f, from);
                    assert_eq!(t, to);
                }
                other => panic!("expected InvalidTransition for {:?}->{:?}, got {:?}", from, to, other),
            }
        }
    }

    #[test]
    fn test_errored_pair_is_never_resurrected() {
        for to in [
            QpState::Reset,
            QpState::Init,
            QpState::ReadyToReceive,
            QpState::ReadyToSend,
        ] {
            assert!(matches!(
                QpState::validate_transition(QpState::Error, to),
                Err(StateTransitionError::Errored)
            ));
        }
    }

    #[test]
    fn test_only_ready_to_send_accepts_posts() {
        for state in [
            QpState::Reset,
            QpState::Init,
            QpState::ReadyToReceive,
            QpState::Error,
        ] {
            assert!(!state.can_post_send());
        }
        assert!(QpState::ReadyToSend.can_post_send());
        assert!(!QpState::Reset.can_post_recv());
        assert!(QpState::Init.can_post_recv());
    }

    #[test]
    fn test_create_queue_pair() {
        // Skip test if RDMA devices are not available
        let devices = get_all_devices();
        if devices.is_empty() {
            println!("Skipping test: RDMA devices not available");
            return;
        }
        let domain = RdmaDomain::new(&devices[0]).unwrap();
        let qp = RdmaQueuePair::new(&domain, IbverbsConfig::default());
        assert!(qp.is_ok());
        let qp = qp.unwrap();
        assert_eq!(qp.state(), QpState::Reset);
        assert!(qp.destroy().is_ok());
        domain.release().unwrap();
    }

    #[test]
    fn test_post_on_reset_pair_is_rejected_before_adapter() {
        let devices = get_all_devices();
        if devices.is_empty() {
            println!("Skipping test: RDMA devices not available");
            return;
        }
        let domain = RdmaDomain::new(&devices[0]).unwrap();
        let mut qp = RdmaQueuePair::new(&domain, IbverbsConfig::default()).unwrap();
        // Deliberately bogus addresses: the guard must fire before the
        // work request is even assembled.
        match qp.post_write(1, 0xdead, 0, 64, 0xbeef, 0) {
            Err(PostError::NotReady(state)) => assert_eq!(state, QpState::Reset),
            other => panic!("expected NotReady, got {:?}", other),
        }
        qp.destroy().unwrap();
        domain.release().unwrap();
    }

    #[test]
    fn test_loopback_connect() {
        let devices = get_all_devices();
        if devices.is_empty() {
            println!("Skipping test: RDMA devices not available");
            return;
        }
        let domain = RdmaDomain::new(&devices[0]).unwrap();

        let mut server_qp = RdmaQueuePair::new(&domain, IbverbsConfig::default()).unwrap();
        let mut client_qp = RdmaQueuePair::new(&domain, IbverbsConfig::default()).unwrap();

        let server_record = server_qp.local_record(None).unwrap();
        let client_record = client_qp.local_record(None).unwrap();

        assert!(server_qp.connect(&client_record).is_ok());
        assert!(client_qp.connect(&server_record).is_ok());
        assert_eq!(server_qp.state(), QpState::ReadyToSend);
        assert_eq!(client_qp.state(), QpState::ReadyToSend);

        crate::domain::teardown(Vec::new(), Some(server_qp), None).unwrap();
        crate::domain::teardown(Vec::new(), Some(client_qp), Some(domain)).unwrap();
    }
}
