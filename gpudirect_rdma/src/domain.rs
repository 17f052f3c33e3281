/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Adapter context, protection domain, and ordered teardown.
//!
//! `RdmaDomain` is the explicitly-passed fabric context of this crate: it
//! is created once from a named device and handed to every component that
//! needs the adapter, so there is no hidden global state. Teardown is
//! scoped acquisition with guaranteed release: every resource type releases
//! itself on drop, and [`teardown`] performs the explicit reverse-order
//! release (memory registrations, then queue pair and completion queue,
//! then protection domain, then device context), continuing past failures
//! and surfacing the first error encountered.

use std::ffi::CStr;

use crate::errors::last_os_error;
use crate::errors::DeviceError;
use crate::errors::RdmaError;
use crate::ibverbs_primitives::RdmaDevice;
use crate::memory_region::RdmaMemoryRegion;
use crate::queue_pair::RdmaQueuePair;

/// Owns the adapter context and protection domain for one session.
///
/// Exactly one protection domain per adapter context in this design; it is
/// exclusively owned by the process for the session's duration. A domain
/// and its registrations may be shared read-only (for posting) across
/// multiple queue pairs in the same process, but registration and
/// deregistration calls must be externally serialized.
pub struct RdmaDomain {
    context: *mut rdma_sys::ibv_context,
    pd: *mut rdma_sys::ibv_pd,
    device_name: String,
}

impl std::fmt::Debug for RdmaDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaDomain")
            .field("device", &self.device_name)
            .field("context", &format!("{:p}", self.context))
            .field("pd", &format!("{:p}", self.pd))
            .finish()
    }
}

// SAFETY: The raw pointers to ibverbs structs can be accessed from any
// thread, and it is safe to drop `RdmaDomain` (and run the ibverbs
// destructors) from any thread.
unsafe impl Send for RdmaDomain {}

// SAFETY: The underlying ibverbs APIs are thread-safe.
unsafe impl Sync for RdmaDomain {}

impl RdmaDomain {
    /// Opens the named device and allocates its protection domain.
    ///
    /// The adapter device list is acquired, walked, and freed before this
    /// returns; the domain holds only the opened context and the PD.
    ///
    /// # Errors
    ///
    /// Fails when no devices are present, the named device is absent, the
    /// context cannot be opened, or PD allocation fails. A failure after
    /// the context is opened closes it again before returning.
    pub fn new(device: &RdmaDevice) -> Result<Self, DeviceError> {
        tracing::debug!("creating RdmaDomain for device {}", device.name());
        unsafe {
            let device_name = device.name();
            let mut num_devices = 0i32;
            let devices = rdma_sys::ibv_get_device_list(&mut num_devices as *mut _);
            if devices.is_null() || num_devices == 0 {
                return Err(DeviceError::NoDevices);
            }

            let mut device_ptr = std::ptr::null_mut();
            for i in 0..num_devices {
                let dev = *devices.offset(i as isize);
                let dev_name = CStr::from_ptr(rdma_sys::ibv_get_device_name(dev)).to_string_lossy();
                if dev_name == device_name.as_str() {
                    device_ptr = dev;
                    break;
                }
            }

            if device_ptr.is_null() {
                rdma_sys::ibv_free_device_list(devices);
                return Err(DeviceError::NotFound(device_name.clone()));
            }
            tracing::info!("using RDMA device: {}", device_name);

            let context = rdma_sys::ibv_open_device(device_ptr);
            if context.is_null() {
                rdma_sys::ibv_free_device_list(devices);
                return Err(DeviceError::Open(last_os_error()));
            }

            let pd = rdma_sys::ibv_alloc_pd(context);
            if pd.is_null() {
                let err = last_os_error();
                rdma_sys::ibv_close_device(context);
                rdma_sys::ibv_free_device_list(devices);
                return Err(DeviceError::AllocPd(err));
            }

            rdma_sys::ibv_free_device_list(devices);

            Ok(RdmaDomain {
                context,
                pd,
                device_name: device_name.clone(),
            })
        }
    }

    /// The opened adapter context.
    pub fn context(&self) -> *mut rdma_sys::ibv_context {
        self.context
    }

    /// The protection domain owning this session's registrations and
    /// queue pairs.
    pub fn pd(&self) -> *mut rdma_sys::ibv_pd {
        self.pd
    }

    /// The name of the device this domain was opened on.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Explicitly releases the protection domain and device context,
    /// in that order, reporting the first failure.
    ///
    /// Registrations and queue pairs owned by this domain must be released
    /// first; the adapter rejects PD deallocation while they exist.
    pub fn release(mut self) -> Result<(), DeviceError> {
        let result = self.release_inner();
        // Drop must not release a second time.
        self.context = std::ptr::null_mut();
        self.pd = std::ptr::null_mut();
        result
    }

    fn release_inner(&mut self) -> Result<(), DeviceError> {
        let mut first_error = None;
        unsafe {
            if !self.pd.is_null() {
                let errno = rdma_sys::ibv_dealloc_pd(self.pd);
                if errno != 0 {
                    let err = DeviceError::Release {
                        resource: "protection domain",
                        source: std::io::Error::from_raw_os_error(errno),
                    };
                    tracing::warn!("teardown: {}", err);
                    first_error.get_or_insert(err);
                }
            }
            if !self.context.is_null() {
                let errno = rdma_sys::ibv_close_device(self.context);
                if errno != 0 {
                    let err = DeviceError::Release {
                        resource: "device context",
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

impl Drop for RdmaDomain {
    fn drop(&mut self) {
        // Guaranteed-release fallback for domains not explicitly released.
        let _ = self.release_inner();
        self.context = std::ptr::null_mut();
        self.pd = std::ptr::null_mut();
    }
}

/// Releases a session's resources in reverse acquisition order.
///
/// Every resource that reached creation is released exactly once: memory
/// registrations first, then the queue pair (and its completion queue),
/// then the protection domain and device context. A release failure never
/// aborts the remaining releases; it is logged and the first error is
/// surfaced after everything has been attempted.
pub fn teardown(
    regions: Vec<RdmaMemoryRegion>,
    queue_pair: Option<RdmaQueuePair>,
    domain: Option<RdmaDomain>,
) -> Result<(), RdmaError> {
    let mut first_error: Option<RdmaError> = None;

    for region in regions {
        if let Err(err) = region.deregister() {
            tracing::warn!("teardown: {}", err);
            first_error.get_or_insert(err.into());
        }
    }

    if let Some(qp) = queue_pair {
        if let Err(err) = qp.destroy() {
            tracing::warn!("teardown: {}", err);
            first_error.get_or_insert(err.into());
        }
    }

    if let Some(domain) = domain {
        if let Err(err) = domain.release() {
            tracing::warn!("teardown: {}", err);
            first_error.get_or_insert(err.into());
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
