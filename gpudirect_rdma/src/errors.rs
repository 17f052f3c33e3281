/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error taxonomy for the transfer engine.
//!
//! Setup-phase errors (device, registration, exchange, state transition) are
//! unrecoverable for the session: they propagate to the caller after
//! teardown of whatever was created, and are never retried internally.
//! Transfer-phase failures are reported per work-request through
//! [`WorkCompletion`](crate::WorkCompletion) statuses; [`CompletionError`]
//! covers only failures of the poll machinery itself.

use std::time::Duration;

use crate::queue_pair::QpState;

/// Errors opening the adapter, its context, or the protection domain.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// The adapter device list was empty.
    #[error("no RDMA devices found")]
    NoDevices,

    /// The named device is not present on this host.
    #[error("device '{0}' not found")]
    NotFound(String),

    /// `ibv_open_device` failed.
    #[error("failed to open device context: {0}")]
    Open(#[source] std::io::Error),

    /// `ibv_alloc_pd` failed.
    #[error("failed to allocate protection domain: {0}")]
    AllocPd(#[source] std::io::Error),

    /// `ibv_create_cq` failed.
    #[error("failed to create completion queue: {0}")]
    CreateCq(#[source] std::io::Error),

    /// `ibv_create_qp` failed.
    #[error("failed to create queue pair: {0}")]
    CreateQp(#[source] std::io::Error),

    /// Port attribute query failed.
    #[error("failed to query port {port}: {source}")]
    QueryPort {
        /// Physical port number.
        port: u8,
        #[source]
        source: std::io::Error,
    },

    /// GID table query failed.
    #[error("failed to query GID index {0}")]
    QueryGid(u8),

    /// A release call failed during teardown.
    #[error("failed to release {resource}: {source}")]
    Release {
        /// Which resource the release call was for.
        resource: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Errors pinning and registering a buffer with the adapter.
#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    /// Zero-length ranges cannot be registered.
    #[error("cannot register a zero-length buffer")]
    EmptyBuffer,

    /// Adapters reject remote-write permission without local-write.
    #[error("remote-write access requires local-write access")]
    RemoteWriteNeedsLocalWrite,

    /// The buffer is device-resident but no peer-to-peer DMA path exists
    /// between the adapter driver and the accelerator driver.
    #[error("GPU-Direct peer mapping unavailable: {0}")]
    GpuDirectUnavailable(String),

    /// `ibv_reg_mr` rejected the buffer.
    #[error("failed to register memory region: {0}")]
    Register(#[source] std::io::Error),

    /// `ibv_dereg_mr` failed.
    #[error("failed to deregister memory region: {0}")]
    Deregister(#[source] std::io::Error),
}

/// Errors exchanging connection records over the out-of-band channel.
#[derive(thiserror::Error, Debug)]
pub enum ExchangeError {
    /// Channel I/O failed.
    #[error("exchange channel: {0}")]
    Io(#[from] std::io::Error),

    /// The peer's record was shorter than the fixed wire size.
    #[error("malformed connection record: got {got} bytes, expected {expected}")]
    Truncated {
        /// Bytes actually received.
        got: usize,
        /// The fixed record size.
        expected: usize,
    },

    /// The peer did not respond within the configured window.
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors transitioning the queue pair between handshake states.
#[derive(thiserror::Error, Debug)]
pub enum StateTransitionError {
    /// The requested transition is not an edge of the handshake machine.
    #[error("invalid queue pair transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the pair was in.
        from: QpState,
        /// State that was requested.
        to: QpState,
    },

    /// The adapter rejected the modify call. The pair remains in `from`
    /// unless the adapter itself reports it errored.
    #[error("adapter rejected transition {from:?} -> {to:?}: {source}")]
    Rejected {
        /// State the pair was in.
        from: QpState,
        /// State that was requested.
        to: QpState,
        #[source]
        source: std::io::Error,
    },

    /// The pair is in ERROR; it must be destroyed, not repaired.
    #[error("queue pair is in the error state and cannot be reused")]
    Errored,
}

/// Errors rejecting a post before it reaches the adapter, or a failed
/// post call itself.
#[derive(thiserror::Error, Debug)]
pub enum PostError {
    /// Operations may only be posted once the pair is READY_TO_SEND.
    #[error("queue pair is not ready to send (state: {0:?})")]
    NotReady(QpState),

    /// The request would read past the local registration.
    #[error("length {len} at offset {offset} exceeds local registration of {bound} bytes")]
    LocalBounds {
        /// Requested byte count.
        len: usize,
        /// Offset into the local registration.
        offset: usize,
        /// The registration's length.
        bound: usize,
    },

    /// The request would write past the peer-advertised region.
    #[error("length {len} exceeds peer-advertised remote region of {bound} bytes")]
    RemoteBounds {
        /// Requested byte count.
        len: usize,
        /// The remote region length from the exchanged record.
        bound: usize,
    },

    /// The send queue already holds `depth` uncompleted requests; the
    /// caller must poll completions before posting more.
    #[error("send queue full: {outstanding} outstanding requests (depth {depth})")]
    QueueFull {
        /// Requests currently in flight.
        outstanding: usize,
        /// Configured send-queue depth.
        depth: usize,
    },

    /// A request with this id is already outstanding.
    #[error("work request id {0} is already outstanding")]
    DuplicateId(u64),

    /// `ibv_post_send`/`ibv_post_recv` failed.
    #[error("failed to post work request: {0}")]
    Post(#[source] std::io::Error),
}

/// Errors from the completion-poll machinery (not per-request failures,
/// which are reported as [`WorkCompletion`](crate::WorkCompletion) statuses).
#[derive(thiserror::Error, Debug)]
pub enum CompletionError {
    /// `ibv_poll_cq` itself failed.
    #[error("failed to poll completion queue: {0}")]
    Poll(#[source] std::io::Error),
}

/// Aggregate error for callers that do not discriminate between phases.
#[derive(thiserror::Error, Debug)]
pub enum RdmaError {
    /// Adapter/device/protection-domain failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Memory pinning/registration failure.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Metadata-exchange failure.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Queue-pair modify failure.
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),

    /// Post precondition or adapter post failure.
    #[error(transparent)]
    Post(#[from] PostError),

    /// Completion-poll failure.
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

pub(crate) fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}
