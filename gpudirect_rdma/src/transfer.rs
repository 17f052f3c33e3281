/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Posting and completion tracking on top of a connected queue pair.
//!
//! The engine validates every request before it reaches the adapter:
//! state, duplicate id, local and remote bounds, then queue depth, in
//! that order. A request that fails validation has no adapter-side
//! effect at all. Every accepted request is held in an outstanding table
//! until a completion (success, failure, or synthetic flush) resolves
//! it, so requests are never silently lost.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use crate::errors::CompletionError;
use crate::errors::PostError;
use crate::exchange::ConnectionRecord;
use crate::ibverbs_primitives::RdmaOperation;
use crate::ibverbs_primitives::WorkCompletion;
use crate::memory_region::RdmaMemoryRegion;
use crate::queue_pair::QpState;
use crate::queue_pair::RdmaQueuePair;

/// Interval between completion-queue drain attempts while waiting.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// How many completion-queue entries one drain call can carry.
const POLL_BATCH: usize = 16;

/// An accepted, not-yet-completed work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    /// Caller-assigned id, echoed back in the matching completion.
    pub id: u64,
    /// Which queue the request occupies.
    pub operation: RdmaOperation,
    /// Payload length in bytes.
    pub length: usize,
}

/// Validates a request against the machine state and both bounds before
/// anything is handed to the adapter.
///
/// `remote_bound` is `None` for operations with no remote target (sends
/// and receives). Checks run in a fixed order: state, local bounds,
/// remote bounds, then depth; a rejection reports the earliest cause.
pub(crate) fn validate_post(
    state: QpState,
    recv_side: bool,
    offset: usize,
    len: usize,
    local_bound: usize,
    remote_bound: Option<usize>,
    outstanding: usize,
    depth: usize,
) -> Result<(), PostError> {
    let state_ok = if recv_side {
        state.can_post_recv()
    } else {
        state.can_post_send()
    };
    if !state_ok {
        return Err(PostError::NotReady(state));
    }
    if offset.checked_add(len).map_or(true, |end| end > local_bound) {
        return Err(PostError::LocalBounds {
            len,
            offset,
            bound: local_bound,
        });
    }
    if let Some(bound) = remote_bound {
        if offset + len > bound {
            return Err(PostError::RemoteBounds {
                len: offset + len,
                bound,
            });
        }
    }
    if outstanding >= depth {
        return Err(PostError::QueueFull { outstanding, depth });
    }
    Ok(())
}

/// Decides whether a batch containing a failed completion means the pair
/// entered ERROR: a flush status says so directly, otherwise only the
/// adapter's own verdict counts. An isolated per-request failure (a local
/// length error, say) leaves the other in-flight requests valid.
pub(crate) fn pair_errored(
    completions: &[WorkCompletion],
    adapter_state: Option<QpState>,
) -> bool {
    completions.iter().any(|c| c.is_flush()) || adapter_state == Some(QpState::Error)
}

/// Posts transfers on a connected queue pair and accounts for every one
/// of them until completion.
///
/// Borrows the pair mutably for its whole lifetime, so the pair cannot
/// be destroyed or reconnected while requests are in flight.
pub struct TransferEngine<'a> {
    qp: &'a mut RdmaQueuePair,
    outstanding: HashMap<u64, WorkRequest>,
    sends_in_flight: usize,
    recvs_in_flight: usize,
}

impl<'a> TransferEngine<'a> {
    pub fn new(qp: &'a mut RdmaQueuePair) -> Self {
        Self {
            qp,
            outstanding: HashMap::new(),
            sends_in_flight: 0,
            recvs_in_flight: 0,
        }
    }

    /// Requests currently in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Posts a one-sided write of `region[offset..offset + len]` into the
    /// peer's advertised region at the same offset.
    pub fn post_write(
        &mut self,
        id: u64,
        region: &RdmaMemoryRegion,
        offset: usize,
        len: usize,
        peer: &ConnectionRecord,
    ) -> Result<(), PostError> {
        if self.outstanding.contains_key(&id) {
            return Err(PostError::DuplicateId(id));
        }
        validate_post(
            self.qp.state(),
            false,
            offset,
            len,
            region.len(),
            Some(peer.remote_len as usize),
            self.sends_in_flight,
            self.qp.send_queue_depth(),
        )?;
        self.qp.post_write(
            id,
            region.addr() + offset,
            region.lkey(),
            len,
            peer.remote_addr + offset as u64,
            peer.remote_key,
        )?;
        self.track(id, RdmaOperation::Write, len);
        Ok(())
    }

    /// Posts a two-sided send of `region[offset..offset + len]`.
    pub fn post_send(
        &mut self,
        id: u64,
        region: &RdmaMemoryRegion,
        offset: usize,
        len: usize,
    ) -> Result<(), PostError> {
        if self.outstanding.contains_key(&id) {
            return Err(PostError::DuplicateId(id));
        }
        validate_post(
            self.qp.state(),
            false,
            offset,
            len,
            region.len(),
            None,
            self.sends_in_flight,
            self.qp.send_queue_depth(),
        )?;
        self.qp
            .post_send(id, region.addr() + offset, region.lkey(), len)?;
        self.track(id, RdmaOperation::Send, len);
        Ok(())
    }

    /// Posts a receive buffer at `region[offset..offset + len]`. Legal
    /// from INIT onward so receives can be staged before the peer sends.
    pub fn post_recv(
        &mut self,
        id: u64,
        region: &RdmaMemoryRegion,
        offset: usize,
        len: usize,
    ) -> Result<(), PostError> {
        if self.outstanding.contains_key(&id) {
            return Err(PostError::DuplicateId(id));
        }
        validate_post(
            self.qp.state(),
            true,
            offset,
            len,
            region.len(),
            None,
            self.recvs_in_flight,
            self.qp.recv_queue_depth(),
        )?;
        self.qp
            .post_recv(id, region.addr() + offset, region.lkey(), len)?;
        self.track(id, RdmaOperation::Recv, len);
        Ok(())
    }

    fn track(&mut self, id: u64, operation: RdmaOperation, length: usize) {
        match operation {
            RdmaOperation::Recv => self.recvs_in_flight += 1,
            _ => self.sends_in_flight += 1,
        }
        self.outstanding.insert(
            id,
            WorkRequest {
                id,
                operation,
                length,
            },
        );
    }

    /// Drains up to `max_entries` completions, returning early once at
    /// least one arrives or `timeout` elapses. An empty result on
    /// timeout is not an error.
    ///
    /// A failed completion resolves only its own request unless the pair
    /// itself entered ERROR (a flush status, or the adapter reporting
    /// ERR on re-query). Then every remaining outstanding request is
    /// resolved with a synthetic flush completion (reported even past
    /// `max_entries`), so the table empties rather than leaking requests
    /// whose hardware completions will never arrive.
    pub fn poll(
        &mut self,
        max_entries: usize,
        timeout: Duration,
    ) -> Result<Vec<WorkCompletion>, CompletionError> {
        let deadline = Instant::now() + timeout;
        let mut completions = Vec::new();

        loop {
            let want = max_entries.saturating_sub(completions.len()).min(POLL_BATCH);
            if want == 0 {
                return Ok(completions);
            }
            let mut wc: [rdma_sys::ibv_wc; POLL_BATCH] = unsafe { std::mem::zeroed() };
            let drained = self.qp.poll_cq(&mut wc[..want])?;
            for entry in wc.into_iter().take(drained) {
                let completion = WorkCompletion::from(entry);
                self.resolve(&completion);
                completions.push(completion);
            }

            if completions.iter().any(|c| !c.is_success()) {
                // A failed completion only takes the other in-flight
                // requests with it when the pair itself died: flush
                // statuses say so directly, otherwise ask the adapter.
                if pair_errored(&completions, self.qp.adapter_state()) {
                    self.qp.mark_errored();
                    self.flush_outstanding(&mut completions);
                }
                return Ok(completions);
            }

            if !completions.is_empty() {
                return Ok(completions);
            }

            if self.qp.state() == QpState::Error
                || self.qp.adapter_state() == Some(QpState::Error)
            {
                self.qp.mark_errored();
                self.flush_outstanding(&mut completions);
                return Ok(completions);
            }

            if Instant::now() >= deadline {
                return Ok(completions);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn resolve(&mut self, completion: &WorkCompletion) {
        match self.outstanding.remove(&completion.wr_id) {
            Some(request) => {
                match request.operation {
                    RdmaOperation::Recv => self.recvs_in_flight -= 1,
                    _ => self.sends_in_flight -= 1,
                }
                tracing::debug!(
                    "completed wr_id {} ({:?}, {} bytes, status {})",
                    completion.wr_id,
                    request.operation,
                    completion.byte_count,
                    completion.status_str(),
                );
            }
            None => {
                tracing::warn!(
                    "completion for unknown wr_id {} (status {})",
                    completion.wr_id,
                    completion.status_str(),
                );
            }
        }
    }

    fn flush_outstanding(&mut self, completions: &mut Vec<WorkCompletion>) {
        if self.outstanding.is_empty() {
            return;
        }
        tracing::warn!(
            "queue pair errored with {} requests in flight; resolving them as flushed",
            self.outstanding.len()
        );
        let mut ids: Vec<u64> = self.outstanding.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            completions.push(WorkCompletion::flushed(id));
        }
        self.outstanding.clear();
        self.sends_in_flight = 0;
        self.recvs_in_flight = 0;
    }
}
