/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Memory registration against the adapter.
//!
//! The core never allocates or frees transfer buffers; callers hand in an
//! opaque `(address, length, residency)` range and get back a registration
//! `{lkey, rkey, addr, len}` usable in work requests. A registration is
//! valid only while the underlying buffer is alive and while the owning
//! protection domain exists, and it must be released before the buffer is
//! freed.

use std::fs;

use crate::domain::RdmaDomain;
use crate::errors::last_os_error;
use crate::errors::RegistrationError;

/// Where a caller-owned buffer resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Accelerator (GPU) memory; registration goes through the adapter's
    /// peer-to-peer DMA path.
    Device,
    /// Ordinary host memory.
    Host,
}

/// An opaque caller-owned memory range to be registered for DMA.
///
/// The caller allocates and frees the memory; the core only registers it.
#[derive(Debug, Clone, Copy)]
pub struct DeviceBuffer {
    /// Start address in the process address space (for device memory, the
    /// device pointer as mapped for the process).
    pub addr: usize,
    /// Length in bytes.
    pub len: usize,
    /// Whether the range is device- or host-resident.
    pub residency: Residency,
}

impl DeviceBuffer {
    /// Describes a device-resident range from a raw device pointer.
    pub fn device(addr: usize, len: usize) -> Self {
        Self {
            addr,
            len,
            residency: Residency::Device,
        }
    }

    /// Describes a host-resident range backed by the given slice.
    ///
    /// The slice must stay alive (and un-moved) until the registration
    /// built from this buffer is released.
    pub fn from_host_slice(slice: &mut [u8]) -> Self {
        Self {
            addr: slice.as_mut_ptr() as usize,
            len: slice.len(),
            residency: Residency::Host,
        }
    }
}

/// Access permissions requested for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags {
    /// Adapter may write into the buffer locally (required for any
    /// incoming data, and a prerequisite for remote-write).
    pub local_write: bool,
    /// Remote peers may RDMA-write into the buffer.
    pub remote_write: bool,
    /// Remote peers may RDMA-read from the buffer.
    pub remote_read: bool,
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self {
            local_write: true,
            remote_write: false,
            remote_read: false,
        }
    }
}

impl AccessFlags {
    /// Local-write plus remote-write, the usual flags for a write target.
    pub fn remote_writable() -> Self {
        Self {
            local_write: true,
            remote_write: true,
            remote_read: false,
        }
    }

    fn to_ibv(self) -> rdma_sys::ibv_access_flags {
        let mut flags = rdma_sys::ibv_access_flags(0);
        if self.local_write {
            flags = flags | rdma_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
        }
        if self.remote_write {
            flags = flags | rdma_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
        }
        if self.remote_read {
            flags = flags | rdma_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        }
        flags
    }
}

/// Checks that the peer-to-peer DMA path for device-resident buffers is
/// present on this host.
///
/// Remote execution environments do not always load the `nvidia_peermem`
/// module; registering accelerator memory without it fails deep inside the
/// driver, so this is checked up front to fail cleanly.
pub fn gpu_direct_available() -> Result<(), RegistrationError> {
    match fs::read_to_string("/proc/modules") {
        Ok(contents) => {
            if contents.contains("nvidia_peermem") {
                Ok(())
            } else {
                Err(RegistrationError::GpuDirectUnavailable(
                    "nvidia_peermem module not found in /proc/modules".to_string(),
                ))
            }
        }
        Err(err) => Err(RegistrationError::GpuDirectUnavailable(format!(
            "cannot read /proc/modules: {}",
            err
        ))),
    }
}

/// A buffer registered with the adapter: `{lkey, rkey, addr, len}`.
///
/// Dropping the registration releases the adapter-side resources; use
/// [`deregister`](RdmaMemoryRegion::deregister) to observe release errors.
/// Registration and deregistration mutate adapter-side tables and must be
/// externally serialized.
pub struct RdmaMemoryRegion {
    mr: *mut rdma_sys::ibv_mr,
    addr: usize,
    len: usize,
}

impl std::fmt::Debug for RdmaMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaMemoryRegion")
            .field("addr", &format_args!("0x{:x}", self.addr))
            .field("len", &self.len)
            .field("lkey", &self.lkey())
            .field("rkey", &self.rkey())
            .finish()
    }
}

// SAFETY: The mr pointer may be used and dropped from any thread; the
// ibverbs registration calls themselves are thread-safe. This provides no
// protection for the underlying memory, which the caller must synchronize.
unsafe impl Send for RdmaMemoryRegion {}

impl RdmaMemoryRegion {
    /// Registers (pins) the buffer with the adapter under the domain's
    /// protection domain.
    ///
    /// Rejected before any adapter call: zero-length ranges, remote-write
    /// without local-write, and device-resident buffers on hosts without a
    /// peer-to-peer DMA path.
    pub fn register(
        domain: &RdmaDomain,
        buffer: &DeviceBuffer,
        access: AccessFlags,
    ) -> Result<Self, RegistrationError> {
        Self::validate(buffer, access)?;
        if buffer.residency == Residency::Device {
            gpu_direct_available()?;
        }

        unsafe {
            let mr = rdma_sys::ibv_reg_mr(
                domain.pd(),
                buffer.addr as *mut std::ffi::c_void,
                buffer.len,
                access.to_ibv().0 as i32,
            );
            if mr.is_null() {
                return Err(RegistrationError::Register(last_os_error()));
            }
            tracing::debug!(
                "registered {:?} buffer at 0x{:x} ({} bytes, lkey {}, rkey {})",
                buffer.residency,
                buffer.addr,
                buffer.len,
                (*mr).lkey,
                (*mr).rkey,
            );
            Ok(RdmaMemoryRegion {
                mr,
                addr: buffer.addr,
                len: buffer.len,
            })
        }
    }

    fn validate(buffer: &DeviceBuffer, access: AccessFlags) -> Result<(), RegistrationError> {
        if buffer.len == 0 {
            return Err(RegistrationError::EmptyBuffer);
        }
        if access.remote_write && !access.local_write {
            // The adapter writes inbound RDMA payloads through the local
            // side of the registration.
            return Err(RegistrationError::RemoteWriteNeedsLocalWrite);
        }
        Ok(())
    }

    /// Local key referencing this registration in scatter/gather entries.
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    /// Remote key a peer needs to target this registration.
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }

    /// Registered start address.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Registered length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty region (never constructed by `register`).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Explicitly releases the adapter-side registration.
    ///
    /// Consuming `self` makes a second deregistration unrepresentable.
    pub fn deregister(self) -> Result<(), RegistrationError> {
        let mr = self.mr;
        std::mem::forget(self);
        unsafe {
            let errno = rdma_sys::ibv_dereg_mr(mr);
            if errno != 0 {
                return Err(RegistrationError::Deregister(
                    std::io::Error::from_raw_os_error(errno),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for RdmaMemoryRegion {
    fn drop(&mut self) {
        unsafe {
            let errno = rdma_sys::ibv_dereg_mr(self.mr);
            if errno != 0 {
                tracing::warn!(
                    "failed to deregister memory region at 0x{:x}: {}",
                    self.addr,
                    std::io::Error::from_raw_os_error(errno)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs_primitives::get_all_devices;

    #[test]
    fn test_remote_write_requires_local_write() {
        let buffer = DeviceBuffer::device(0x1000, 4096);
        let flags = AccessFlags {
            local_write: false,
            remote_write: true,
            remote_read: false,
        };
        assert!(matches!(
            RdmaMemoryRegion::validate(&buffer, flags),
            Err(RegistrationError::RemoteWriteNeedsLocalWrite)
        ));
    }

    #[test]
    fn test_empty_buffer_is_rejected() {
        let buffer = DeviceBuffer::device(0x1000, 0);
        assert!(matches!(
            RdmaMemoryRegion::validate(&buffer, AccessFlags::default()),
            Err(RegistrationError::EmptyBuffer)
        ));
    }

    #[test]
    fn test_access_flags_mapping() {
        let flags = AccessFlags::remote_writable().to_ibv();
        assert_ne!(
            flags.0 & rdma_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0,
            0
        );
        assert_ne!(
            flags.0 & rdma_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0,
            0
        );
        assert_eq!(
            flags.0 & rdma_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ.0,
            0
        );
    }

    #[test]
    fn test_register_deregister_roundtrip() {
        let devices = get_all_devices();
        if devices.is_empty() {
            println!("Skipping test: RDMA devices not available");
            return;
        }
        let domain = RdmaDomain::new(&devices[0]).unwrap();

        let mut backing = vec![0u8; 1024];
        let buffer = DeviceBuffer::from_host_slice(&mut backing);

        // Round-trip twice: deregistration must leave the PD reusable.
        for _ in 0..2 {
            let region =
                RdmaMemoryRegion::register(&domain, &buffer, AccessFlags::remote_writable())
                    .unwrap();
            assert_eq!(region.len(), 1024);
            assert_ne!(region.lkey(), 0);
            region.deregister().unwrap();
        }
        domain.release().unwrap();
    }

    #[test]
    fn test_invalid_registrations_rejected_without_adapter() {
        let devices = get_all_devices();
        if devices.is_empty() {
            println!("Skipping test: RDMA devices not available");
            return;
        }
        let domain = RdmaDomain::new(&devices[0]).unwrap();

        let mut backing = vec![0u8; 16];
        let mut empty = DeviceBuffer::from_host_slice(&mut backing);
        empty.len = 0;
        assert!(matches!(
            RdmaMemoryRegion::register(&domain, &empty, AccessFlags::default()),
            Err(RegistrationError::EmptyBuffer)
        ));

        let buffer = DeviceBuffer::from_host_slice(&mut backing);
        let bad_flags = AccessFlags {
            local_write: false,
            remote_write: true,
            remote_read: false,
        };
        assert!(matches!(
            RdmaMemoryRegion::register(&domain, &buffer, bad_flags),
            Err(RegistrationError::RemoteWriteNeedsLocalWrite)
        ));
        domain.release().unwrap();
    }
}
