/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! GPU-Direct RDMA transfer engine.
//!
//! This crate implements the connection and transfer engine for moving data
//! between device (or host) memory on two machines over an RDMA fabric,
//! bypassing host-memory staging:
//!
//! 1. [`RdmaDomain`] opens the adapter context and protection domain.
//! 2. [`RdmaMemoryRegion`] registers a caller-owned buffer for DMA.
//! 3. [`RdmaQueuePair`] owns the reliable-connection queue pair and
//!    completion queue and drives the RESET -> INIT -> RTR -> RTS handshake.
//! 4. [`exchange`] swaps [`ConnectionRecord`]s with the peer over an
//!    out-of-band byte channel.
//! 5. [`TransferEngine`] posts RDMA writes/sends and polls completions.
//! 6. [`teardown`] releases everything in reverse acquisition order.
//!
//! The crate creates no threads of its own; it is safe when driven from a
//! single thread, or one thread per queue pair. Device discovery, GPU
//! allocation, and the out-of-band transport are caller-side collaborators.

// RDMA requires frequent unsafe code blocks
#![allow(clippy::undocumented_unsafe_blocks)]

mod domain;
mod errors;
mod exchange;
mod ibverbs_primitives;
mod memory_region;
mod queue_pair;
mod transfer;

pub use domain::*;
pub use errors::*;
pub use exchange::*;
pub use ibverbs_primitives::*;
pub use memory_region::*;
pub use queue_pair::*;
pub use transfer::*;
